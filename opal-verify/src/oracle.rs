#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use miette::Diagnostic;
use thiserror::Error;

use opal_interp::{EvalValue, ValueCache};
use opal_ir::{BitVec, BlockPathCondition, Kind, Mapping, ParsedReplacement, TermId, TermStore};

/// Wall-clock budget for one oracle query, in milliseconds. A query that
/// exceeds it reports `Unknown`, never a verdict.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timeout {
    pub millis: u64,
}

impl Timeout {
    pub const fn from_millis(millis: u64) -> Self {
        Self { millis }
    }
}

impl Default for Timeout {
    fn default() -> Self {
        Self { millis: 10_000 }
    }
}

/// A concrete assignment to free variables witnessing non-equivalence.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Counterexample {
    pub values: BTreeMap<TermId, BitVec>,
}

impl Counterexample {
    pub fn to_cache(&self) -> ValueCache {
        self.values
            .iter()
            .map(|(&id, &v)| (id, EvalValue::Val(v)))
            .collect()
    }
}

impl fmt::Display for Counterexample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (id, v) in &self.values {
            if !first {
                write!(f, ", ")?;
            }
            first = false;
            write!(f, "%{} = {}", id.0, v)?;
        }
        Ok(())
    }
}

/// Outcome of an equivalence query. `Unknown` (timeouts included) is always
/// distinct from `Invalid`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VerifyResult {
    Valid,
    Invalid(Option<Counterexample>),
    Unknown,
}

/// Assignment of solved symbolic constants.
pub type ConstMap = BTreeMap<TermId, BitVec>;

/// Outcome of a constant query. `Infeasible` is a proof that no constants
/// exist; `Unknown` is not.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SolveResult {
    Consts(ConstMap),
    Infeasible,
    Unknown,
}

/// Transport or encoding failure talking to an oracle; distinct from every
/// `Unknown` outcome.
#[derive(Debug, Error, Diagnostic)]
pub enum OracleError {
    #[error("query contains unsolved symbolic constants; run constant synthesis first")]
    #[diagnostic(code(opal::verify::unsolved_holes))]
    UnsolvedHoles,

    #[error("replacement has no symbolic constants to solve for")]
    #[diagnostic(code(opal::verify::no_holes))]
    NoHoles,

    #[error("oracle cannot express {kind:?} at width {width}")]
    #[diagnostic(code(opal::verify::unsupported))]
    Unsupported { kind: Kind, width: u32 },

    #[error("oracle process failure: {0}")]
    #[diagnostic(code(opal::verify::process))]
    Process(String),
}

/// The external decision procedure the pipeline leans on for ground truth.
///
/// Implementations must be deterministic for a fixed query and must report
/// uncertainty as `Unknown`/`Infeasible` outcomes, reserving `Err` for
/// transport-level failures.
pub trait Oracle {
    /// Is `mapping.lhs => mapping.rhs` valid wherever the LHS is defined and
    /// every path condition holds?
    fn check_equivalent(
        &self,
        store: &mut TermStore,
        mapping: &Mapping,
        pcs: &[Mapping],
        bpcs: &[BlockPathCondition],
        timeout: Timeout,
    ) -> Result<VerifyResult, OracleError>;

    /// Find values for `holes` making the replacement correct on every
    /// recorded counterexample (unconstrained when none are known yet).
    fn solve_for_constants(
        &self,
        store: &mut TermStore,
        rep: &ParsedReplacement,
        holes: &[TermId],
        counterexamples: &[Counterexample],
        timeout: Timeout,
    ) -> Result<SolveResult, OracleError>;

    /// Oracle-side candidate generation; an alternative to enumerative
    /// synthesis. Engines without the capability return an empty sequence.
    fn infer_candidates(
        &self,
        _store: &mut TermStore,
        _lhs: TermId,
        _pcs: &[Mapping],
        _timeout: Timeout,
    ) -> Result<Vec<TermId>, OracleError> {
        Ok(Vec::new())
    }
}
