#![forbid(unsafe_code)]

use std::time::Instant;

use log::debug;

use opal_interp::{ConcreteInterpreter, EvalValue, ValueCache};
use opal_ir::{
    BitVec, BlockPathCondition, Kind, Mapping, ParsedReplacement, TermId, TermStore, VarFacts,
    free_vars,
};

use crate::oracle::{
    ConstMap, Counterexample, Oracle, OracleError, SolveResult, Timeout, VerifyResult,
};

/// Oracle that decides queries by enumerating every assignment to the free
/// variables, with the concrete interpreter as the semantics of record.
///
/// Complete (never `Unknown` from incompleteness) whenever the combined bit
/// budget of the free variables fits under `max_bits`; larger queries report
/// `Unknown`. Built for tests and for small-width production queries, in the
/// way a missing real solver still leaves the workspace usable.
pub struct ExhaustiveOracle {
    pub max_bits: u32,
}

impl Default for ExhaustiveOracle {
    fn default() -> Self {
        Self { max_bits: 20 }
    }
}

impl ExhaustiveOracle {
    pub fn new(max_bits: u32) -> Self {
        Self { max_bits }
    }
}

/// Odometer over all assignments to `slots`, each slot a (term, width) pair.
struct Assignments {
    slots: Vec<(TermId, u32)>,
    counters: Vec<u128>,
    done: bool,
}

impl Assignments {
    fn new(slots: Vec<(TermId, u32)>) -> Self {
        let counters = vec![0; slots.len()];
        Self {
            slots,
            counters,
            done: false,
        }
    }

    fn next(&mut self) -> Option<Vec<(TermId, BitVec)>> {
        if self.done {
            return None;
        }
        let current: Vec<(TermId, BitVec)> = self
            .slots
            .iter()
            .zip(&self.counters)
            .map(|(&(id, w), &c)| (id, BitVec::new(w, c)))
            .collect();
        // Advance the odometer.
        let mut i = 0;
        loop {
            if i == self.slots.len() {
                self.done = true;
                break;
            }
            self.counters[i] += 1;
            let limit = if self.slots[i].1 == 128 {
                u128::MAX
            } else {
                1u128 << self.slots[i].1
            };
            if self.counters[i] < limit {
                break;
            }
            self.counters[i] = 0;
            i += 1;
        }
        Some(current)
    }
}

fn budget_of(slots: &[(TermId, u32)]) -> u32 {
    slots.iter().map(|&(_, w)| w).sum()
}

/// Whether a concrete value is consistent with a variable's annotations.
/// The oracle only considers assignments the annotations allow, since the
/// facts are givens of the query, not claims to check.
fn facts_allow(facts: &VarFacts, v: BitVec) -> bool {
    if !facts.known.contains(v) {
        return false;
    }
    if !facts.range.is_full() && !facts.range.contains(v) {
        return false;
    }
    if facts.non_zero && v.is_zero() {
        return false;
    }
    if facts.non_negative && v.is_negative() {
        return false;
    }
    if facts.negative && !v.is_negative() {
        return false;
    }
    if facts.power_of_two && !v.is_power_of_two() {
        return false;
    }
    if facts.num_sign_bits > 1 {
        // The top `num_sign_bits` bits must all replicate the sign bit.
        let w = v.width();
        let copies = v.ashr((w - facts.num_sign_bits.min(w)).min(w - 1));
        if !(copies.is_zero() || copies.is_all_ones()) {
            return false;
        }
    }
    true
}

fn var_slots(store: &TermStore, roots: &[TermId]) -> Vec<(TermId, u32)> {
    let mut slots = Vec::new();
    for &root in roots {
        for v in free_vars(store, root) {
            if !slots.iter().any(|&(id, _)| id == v) {
                slots.push((v, store.width(v)));
            }
        }
    }
    slots
}

fn assignment_allowed(store: &TermStore, assignment: &[(TermId, BitVec)]) -> bool {
    assignment.iter().all(|&(id, v)| {
        store
            .get(id)
            .facts
            .as_ref()
            .is_none_or(|f| facts_allow(f, v))
    })
}

fn seed(assignment: &[(TermId, BitVec)]) -> ValueCache {
    assignment
        .iter()
        .map(|&(id, v)| (id, EvalValue::Val(v)))
        .collect()
}

/// How one path condition fares under an assignment.
enum PcStatus {
    Holds,
    Fails,
    Indeterminate,
}

fn pc_status(ci: &mut ConcreteInterpreter, store: &TermStore, pc: &Mapping) -> PcStatus {
    let l = ci.evaluate(store, pc.lhs);
    let r = ci.evaluate(store, pc.rhs);
    match (l, r) {
        (EvalValue::Val(a), EvalValue::Val(b)) => {
            if a == b {
                PcStatus::Holds
            } else {
                PcStatus::Fails
            }
        }
        (EvalValue::Unimplemented, _) | (_, EvalValue::Unimplemented) => PcStatus::Indeterminate,
        // A poison/undef condition never scopes the rule in.
        _ => PcStatus::Fails,
    }
}

impl Oracle for ExhaustiveOracle {
    fn check_equivalent(
        &self,
        store: &mut TermStore,
        mapping: &Mapping,
        pcs: &[Mapping],
        bpcs: &[BlockPathCondition],
        timeout: Timeout,
    ) -> Result<VerifyResult, OracleError> {
        let mut roots = vec![mapping.lhs, mapping.rhs];
        for pc in pcs {
            roots.push(pc.lhs);
            roots.push(pc.rhs);
        }
        for bpc in bpcs {
            roots.push(bpc.pc.lhs);
            roots.push(bpc.pc.rhs);
        }
        if roots
            .iter()
            .any(|&r| opal_ir::contains_kind(store, r, Kind::Hole))
        {
            return Err(OracleError::UnsolvedHoles);
        }
        let slots = var_slots(store, &roots);
        if budget_of(&slots) > self.max_bits {
            debug!(
                "equivalence query needs {} bits, budget is {}",
                budget_of(&slots),
                self.max_bits
            );
            return Ok(VerifyResult::Unknown);
        }
        let all_pcs: Vec<Mapping> = pcs
            .iter()
            .copied()
            .chain(bpcs.iter().map(|b| b.pc))
            .collect();

        let start = Instant::now();
        let mut assignments = Assignments::new(slots);
        while let Some(assignment) = assignments.next() {
            if start.elapsed().as_millis() as u64 > timeout.millis {
                return Ok(VerifyResult::Unknown);
            }
            if !assignment_allowed(store, &assignment) {
                continue;
            }
            let mut ci = ConcreteInterpreter::with_persistent_cache(seed(&assignment));
            let mut scoped_in = true;
            for pc in &all_pcs {
                match pc_status(&mut ci, store, pc) {
                    PcStatus::Holds => {}
                    PcStatus::Fails => {
                        scoped_in = false;
                        break;
                    }
                    PcStatus::Indeterminate => return Ok(VerifyResult::Unknown),
                }
            }
            if !scoped_in {
                continue;
            }
            let lhs = ci.evaluate(store, mapping.lhs);
            let lhs_val = match lhs {
                EvalValue::Val(v) => v,
                EvalValue::Unimplemented => return Ok(VerifyResult::Unknown),
                // The replacement owes nothing where the target is undefined.
                _ => continue,
            };
            match ci.evaluate(store, mapping.rhs) {
                EvalValue::Val(v) if v == lhs_val => {}
                EvalValue::Unimplemented => return Ok(VerifyResult::Unknown),
                // Differing value, or poison/undef refining a defined LHS.
                _ => {
                    let cex = Counterexample {
                        values: assignment.into_iter().collect(),
                    };
                    return Ok(VerifyResult::Invalid(Some(cex)));
                }
            }
        }
        Ok(VerifyResult::Valid)
    }

    fn solve_for_constants(
        &self,
        store: &mut TermStore,
        rep: &ParsedReplacement,
        holes: &[TermId],
        counterexamples: &[Counterexample],
        timeout: Timeout,
    ) -> Result<SolveResult, OracleError> {
        let slots: Vec<(TermId, u32)> = holes.iter().map(|&h| (h, store.width(h))).collect();
        if budget_of(&slots) > self.max_bits {
            debug!(
                "constant query needs {} bits, budget is {}",
                budget_of(&slots),
                self.max_bits
            );
            return Ok(SolveResult::Unknown);
        }
        let mapping = rep.mapping();
        let all_pcs: Vec<Mapping> = rep
            .pcs
            .iter()
            .copied()
            .chain(rep.bpcs.iter().map(|b| b.pc))
            .collect();

        let start = Instant::now();
        let mut assignments = Assignments::new(slots);
        'candidates: while let Some(assignment) = assignments.next() {
            if start.elapsed().as_millis() as u64 > timeout.millis {
                return Ok(SolveResult::Unknown);
            }
            // Conditions decidable from the holes alone gate applicability;
            // this is how callers block previously-found assignments.
            let mut ci = ConcreteInterpreter::with_persistent_cache(seed(&assignment));
            for pc in &all_pcs {
                if let PcStatus::Fails = pc_status(&mut ci, store, pc) {
                    continue 'candidates;
                }
            }
            for cex in counterexamples {
                let mut cache = seed(&assignment);
                cache.extend(cex.to_cache());
                let mut ci = ConcreteInterpreter::with_persistent_cache(cache);
                let mut scoped_in = true;
                for pc in &all_pcs {
                    match pc_status(&mut ci, store, pc) {
                        PcStatus::Holds => {}
                        // An undecidable condition cannot constrain the
                        // candidate; verification decides later.
                        _ => {
                            scoped_in = false;
                            break;
                        }
                    }
                }
                if !scoped_in {
                    continue;
                }
                let EvalValue::Val(lhs_val) = ci.evaluate(store, mapping.lhs) else {
                    continue;
                };
                match ci.evaluate(store, mapping.rhs) {
                    EvalValue::Val(v) if v == lhs_val => {}
                    EvalValue::Unimplemented => continue,
                    _ => continue 'candidates,
                }
            }
            let consts: ConstMap = assignment.into_iter().collect();
            return Ok(SolveResult::Consts(consts));
        }
        Ok(SolveResult::Infeasible)
    }
}
