#![forbid(unsafe_code)]

use opal_ir::{BlockPathCondition, Mapping, TermId, TermStore, free_vars};
use opal_verify::{Oracle, Timeout};

use crate::cegis::ConstantSynthesisOptions;
use crate::prune::{InputSetPolicy, StatsLevel};

/// Everything one synthesis task carries through the pipeline: the target,
/// its free variables and width, the conditions scoping the search, and the
/// oracle deciding ground truth. Built once per task and passed by
/// reference; there is no process-wide synthesis state.
pub struct SynthesisContext<'o> {
    pub lhs: TermId,
    pub inputs: Vec<TermId>,
    pub width: u32,
    pub pcs: Vec<Mapping>,
    pub bpcs: Vec<BlockPathCondition>,
    pub oracle: &'o dyn Oracle,
    pub timeout: Timeout,
}

impl<'o> SynthesisContext<'o> {
    pub fn new(store: &TermStore, lhs: TermId, oracle: &'o dyn Oracle) -> Self {
        Self {
            lhs,
            inputs: free_vars(store, lhs),
            width: store.width(lhs),
            pcs: Vec::new(),
            bpcs: Vec::new(),
            oracle,
            timeout: Timeout::default(),
        }
    }

    pub fn with_pcs(mut self, pcs: Vec<Mapping>) -> Self {
        self.pcs = pcs;
        self
    }

    pub fn with_timeout(mut self, timeout: Timeout) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Knobs for one synthesis run. Budgets are required parameters with
/// explicit defaults, not afterthoughts; exceeding one is a reportable
/// outcome, never an error.
#[derive(Clone, Debug)]
pub struct SynthesisOptions {
    /// Upper bound on operation nodes in a candidate.
    pub max_ops: u32,
    /// Upper bound on candidates drawn from the grammar.
    pub max_guesses: usize,
    /// Offer a symbolic constant leaf, routing matches through CEGIS.
    pub synthesize_consts: bool,
    /// Keep enumerating after the first verified candidate and return every
    /// verified replacement instead of the first.
    pub check_all_guesses: bool,
    /// Only admit candidates strictly cheaper than the target.
    pub require_profit: bool,
    /// Run the dataflow pruning stage before any oracle query.
    pub prune: bool,
    pub input_sets: InputSetPolicy,
    pub stats: StatsLevel,
    pub cegis: ConstantSynthesisOptions,
}

impl Default for SynthesisOptions {
    fn default() -> Self {
        Self {
            max_ops: 3,
            max_guesses: 10_000,
            synthesize_consts: true,
            check_all_guesses: false,
            require_profit: true,
            prune: true,
            input_sets: InputSetPolicy::Diverse,
            stats: StatsLevel::Counts,
            cegis: ConstantSynthesisOptions::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opal_ir::{TermStore, b};
    use opal_verify::ExhaustiveOracle;

    #[test]
    fn context_derives_inputs_and_width() {
        let mut store = TermStore::new();
        let x = store.var(8, "x").unwrap();
        let y = store.var(8, "y").unwrap();
        let lhs = b(&mut store, x).add(y).get();
        let oracle = ExhaustiveOracle::default();
        let ctx = SynthesisContext::new(&store, lhs, &oracle);
        assert_eq!(ctx.width, 8);
        assert_eq!(ctx.inputs, vec![x, y]);
        assert!(ctx.pcs.is_empty());
    }
}
