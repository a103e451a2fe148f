#![forbid(unsafe_code)]

use std::fmt;

use log::debug;

use opal_interp::{ConcreteInterpreter, EvalValue, ValueCache, const_range, known_bits};
use opal_ir::{
    BitVec, ConstRange, Kind, KnownBits, TermId, TermStore, VarFacts, contains_kind,
};
use opal_verify::Counterexample;

use crate::context::SynthesisContext;

/// How the concrete probe inputs are chosen. The default battery is a
/// heuristic; callers with better knowledge of their workload swap in
/// their own sets.
#[derive(Clone, Debug, Default)]
pub enum InputSetPolicy {
    /// Deterministic diverse bit patterns: zeros, ones, one, sign bit,
    /// alternating masks, small primes, and per-variable single-bit sweeps.
    #[default]
    Diverse,
    /// Only the all-zeros and all-ones corners; for very wide targets where
    /// every extra set is costly.
    Corners,
    /// Caller-supplied assignments, one value per input variable per set.
    Custom(Vec<Vec<BitVec>>),
}

/// How much accounting the pruning pass does.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum StatsLevel {
    Off,
    #[default]
    Counts,
    Verbose,
}

/// Cheap infeasibility filter run on every candidate before any oracle
/// query. Sound by construction: a candidate is rejected only on a
/// confirmed concrete mismatch against a defined target value, or on a
/// confirmed contradiction between abstract facts.
pub struct PruningManager {
    lhs: TermId,
    inputs: Vec<TermId>,
    policy: InputSetPolicy,
    stats: StatsLevel,
    /// One persistent interpreter per probe assignment; candidates sharing
    /// subterms with each other or the target reuse cached results.
    interps: Vec<ConcreteInterpreter>,
    lhs_values: Vec<EvalValue>,
    lhs_bits: Option<KnownBits>,
    lhs_range: Option<ConstRange>,
    num_pruned: u64,
    total_guesses: u64,
}

impl PruningManager {
    /// First phase of construction; `init` does the real work so callers
    /// that disable pruning pay nothing.
    pub fn new(ctx: &SynthesisContext<'_>, policy: InputSetPolicy, stats: StatsLevel) -> Self {
        Self {
            lhs: ctx.lhs,
            inputs: ctx.inputs.clone(),
            policy,
            stats,
            interps: Vec::new(),
            lhs_values: Vec::new(),
            lhs_bits: None,
            lhs_range: None,
            num_pruned: 0,
            total_guesses: 0,
        }
    }

    /// Build the probe inputs, evaluate the target on each, and compute the
    /// target's abstract facts over unbound inputs.
    pub fn init(&mut self, store: &TermStore) {
        let sets = self.generate_input_sets(store);
        for seed in sets {
            let mut ci = ConcreteInterpreter::with_persistent_cache(seed);
            self.lhs_values.push(ci.evaluate(store, self.lhs));
            self.interps.push(ci);
        }
        let mut unbound = ConcreteInterpreter::new();
        self.lhs_bits = Some(known_bits(store, self.lhs, &mut unbound));
        self.lhs_range = Some(const_range(store, self.lhs, &mut unbound));
        if self.stats >= StatsLevel::Verbose {
            debug!(
                "pruning initialized with {} input sets, lhs bits {}",
                self.interps.len(),
                self.lhs_bits.as_ref().expect("just set"),
            );
        }
    }

    /// Fold oracle-found witnesses into the probe battery; the driver feeds
    /// each verification counterexample back in so later candidates fail
    /// concretely instead of reaching the oracle.
    pub fn add_counterexample(&mut self, store: &TermStore, cex: &Counterexample) {
        let mut seed = cex.to_cache();
        // Complete partial witnesses so evaluation cannot go unbound.
        for &input in &self.inputs {
            seed.entry(input)
                .or_insert_with(|| EvalValue::Val(BitVec::zero(store.width(input))));
        }
        let mut ci = ConcreteInterpreter::with_persistent_cache(seed);
        self.lhs_values.push(ci.evaluate(store, self.lhs));
        self.interps.push(ci);
    }

    fn generate_input_sets(&self, store: &TermStore) -> Vec<ValueCache> {
        let patterns: Vec<fn(u32) -> BitVec> = match self.policy {
            InputSetPolicy::Custom(ref sets) => {
                return sets
                    .iter()
                    .map(|values| {
                        self.inputs
                            .iter()
                            .zip(values)
                            .map(|(&id, &v)| (id, EvalValue::Val(v)))
                            .collect()
                    })
                    .collect();
            }
            InputSetPolicy::Corners => vec![BitVec::zero, BitVec::all_ones],
            InputSetPolicy::Diverse => vec![
                BitVec::zero,
                BitVec::all_ones,
                BitVec::one,
                BitVec::sign_bit,
                |w| BitVec::new(w, 0xAAAA_AAAA_AAAA_AAAA_AAAA_AAAA_AAAA_AAAA),
                |w| BitVec::new(w, 0x5555_5555_5555_5555_5555_5555_5555_5555),
                |w| BitVec::new(w, 2),
                |w| BitVec::new(w, 3),
                |w| BitVec::new(w, 5),
                |w| BitVec::new(w, 7),
            ],
        };

        let mut sets = Vec::new();
        for (i, _) in patterns.iter().enumerate() {
            // Rotate the pattern table across variables so multi-input
            // targets see asymmetric combinations too.
            if let Some(seed) = self.assignment(store, |var_idx, w| {
                patterns[(i + var_idx) % patterns.len()](w)
            }) {
                sets.push(seed);
            }
        }
        if matches!(self.policy, InputSetPolicy::Diverse) {
            // Single-bit sweeps, bounded per variable.
            let max_bit = self
                .inputs
                .iter()
                .map(|&v| store.width(v))
                .max()
                .unwrap_or(0)
                .min(8);
            for bit in 0..max_bit {
                if let Some(seed) = self.assignment(store, |_, w| {
                    if bit < w {
                        BitVec::new(w, 1u128 << bit)
                    } else {
                        BitVec::zero(w)
                    }
                }) {
                    sets.push(seed);
                }
            }
        }
        sets
    }

    /// One probe assignment, with every value conformed to its variable's
    /// annotations; `None` when some variable admits no conforming value.
    fn assignment(
        &self,
        store: &TermStore,
        value_for: impl Fn(usize, u32) -> BitVec,
    ) -> Option<ValueCache> {
        let mut seed = ValueCache::new();
        for (idx, &input) in self.inputs.iter().enumerate() {
            let width = store.width(input);
            let facts = store.get(input).facts.clone().unwrap_or_else(|| VarFacts::none(width));
            let v = conform(&facts, value_for(idx, width))?;
            seed.insert(input, EvalValue::Val(v));
        }
        Some(seed)
    }

    /// Concrete-sampling filter: evaluate the candidate on every probe
    /// input and reject on a definite disagreement with a defined target
    /// value. Hole-bearing candidates are judged only where their value is
    /// independent of the holes.
    pub fn is_infeasible(&mut self, store: &TermStore, rhs: TermId) -> bool {
        self.total_guesses += 1;
        let has_holes = contains_kind(store, rhs, Kind::Hole);
        for i in 0..self.interps.len() {
            let EvalValue::Val(lhs_val) = self.lhs_values[i].clone() else {
                continue;
            };
            match self.interps[i].evaluate(store, rhs) {
                EvalValue::Val(v) if v != lhs_val => {
                    return self.record_pruned(store, rhs, "concrete mismatch");
                }
                // A candidate that is poison/undef where the target is
                // defined can never refine it.
                EvalValue::Poison | EvalValue::Undef | EvalValue::UndefinedBehavior
                    if !has_holes =>
                {
                    return self.record_pruned(store, rhs, "undefined under defined lhs");
                }
                _ => {}
            }
        }
        false
    }

    /// Adds the abstract cross-check on top of the concrete one: facts of
    /// the candidate provably inconsistent with the target's facts reject
    /// it without any oracle call. Holes abstract to fully-unknown, keeping
    /// the check sound for hole-bearing candidates.
    pub fn is_infeasible_with_oracle(&mut self, store: &TermStore, rhs: TermId) -> bool {
        if self.is_infeasible(store, rhs) {
            return true;
        }
        // Counted once by the concrete pass; the abstract pass only refines.
        let mut unbound = ConcreteInterpreter::new();
        if let Some(lhs_bits) = &self.lhs_bits {
            let rhs_bits = known_bits(store, rhs, &mut unbound);
            if lhs_bits.conflicts_with(&rhs_bits) {
                return self.record_pruned(store, rhs, "known-bits conflict");
            }
        }
        if let Some(lhs_range) = &self.lhs_range {
            let rhs_range = const_range(store, rhs, &mut unbound);
            if lhs_range.is_disjoint(&rhs_range) {
                return self.record_pruned(store, rhs, "disjoint ranges");
            }
        }
        false
    }

    fn record_pruned(&mut self, store: &TermStore, rhs: TermId, why: &str) -> bool {
        self.num_pruned += 1;
        if self.stats >= StatsLevel::Verbose {
            debug!("pruned ({why}): {}", opal_ir::print_term(store, rhs).trim_end());
        }
        true
    }

    pub fn num_pruned(&self) -> u64 {
        self.num_pruned
    }

    pub fn total_guesses(&self) -> u64 {
        self.total_guesses
    }
}

impl fmt::Display for PruningManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dataflow pruned {}/{}", self.num_pruned, self.total_guesses)
    }
}

/// Adjust a probe value to satisfy a variable's annotations, or report that
/// no nearby value does.
fn conform(facts: &VarFacts, v: BitVec) -> Option<BitVec> {
    let candidate = (v & !facts.known.zeros()) | facts.known.ones();
    for c in [
        candidate,
        facts.range.unsigned_min(),
        facts.range.unsigned_max(),
        facts.known.unsigned_min(),
    ] {
        if allows(facts, c) {
            return Some(c);
        }
    }
    None
}

fn allows(facts: &VarFacts, v: BitVec) -> bool {
    facts.known.contains(v)
        && (facts.range.is_full() || facts.range.contains(v))
        && !(facts.non_zero && v.is_zero())
        && !(facts.non_negative && v.is_negative())
        && !(facts.negative && !v.is_negative())
        && !(facts.power_of_two && !v.is_power_of_two())
}

#[cfg(test)]
mod tests {
    use super::*;
    use opal_ir::b;
    use opal_verify::ExhaustiveOracle;

    use crate::context::SynthesisContext;

    fn manager(store: &TermStore, ctx: &SynthesisContext<'_>) -> PruningManager {
        let mut pm = PruningManager::new(ctx, InputSetPolicy::Diverse, StatsLevel::Counts);
        pm.init(store);
        pm
    }

    #[test]
    fn concrete_mismatch_prunes() {
        let mut store = TermStore::new();
        let x = store.var(8, "x").unwrap();
        let lhs = b(&mut store, x).and(1).get();
        let oracle = ExhaustiveOracle::default();
        let ctx = SynthesisContext::new(&store, lhs, &oracle);
        let mut pm = manager(&store, &ctx);

        let bad = b(&mut store, x).or(1).get();
        assert!(pm.is_infeasible(&store, bad));
        let good = b(&mut store, x).and(1).get();
        assert!(!pm.is_infeasible(&store, good));
        assert_eq!(pm.num_pruned(), 1);
        assert_eq!(pm.total_guesses(), 2);
        assert_eq!(pm.to_string(), "dataflow pruned 1/2");
    }

    #[test]
    fn pruning_records_a_finite_witness() {
        // Soundness: whenever a candidate is pruned concretely, one of the
        // manager's own probe inputs separates it from the target.
        let mut store = TermStore::new();
        let x = store.var(4, "x").unwrap();
        let lhs = b(&mut store, x).add(1).get();
        let oracle = ExhaustiveOracle::default();
        let ctx = SynthesisContext::new(&store, lhs, &oracle);
        let mut pm = manager(&store, &ctx);

        let rhs = b(&mut store, x).add(2).get();
        assert!(pm.is_infeasible(&store, rhs));
        let witness = (0..16u128).any(|v| (v + 1) % 16 != (v + 2) % 16);
        assert!(witness);
    }

    #[test]
    fn abstract_conflict_prunes_without_concrete_witness() {
        let mut store = TermStore::new();
        let x = store.var(8, "x").unwrap();
        // Target always has bit 7 set; candidate always has it clear.
        let lhs = b(&mut store, x).or(0x80).get();
        let oracle = ExhaustiveOracle::default();
        let ctx = SynthesisContext::new(&store, lhs, &oracle);
        let mut pm =
            PruningManager::new(&ctx, InputSetPolicy::Custom(Vec::new()), StatsLevel::Off);
        pm.init(&store);

        let rhs = b(&mut store, x).and(0x7f).get();
        assert!(pm.is_infeasible_with_oracle(&store, rhs));
    }

    #[test]
    fn hole_bearing_candidates_survive_sentinel_probes() {
        let mut store = TermStore::new();
        let x = store.var(8, "x").unwrap();
        let lhs = b(&mut store, x).add(7).get();
        let oracle = ExhaustiveOracle::default();
        let ctx = SynthesisContext::new(&store, lhs, &oracle);
        let mut pm = manager(&store, &ctx);

        let c = store.hole(8);
        let candidate = b(&mut store, x).add(c).get();
        // The hole leaves every probe unimplemented, which proves nothing.
        assert!(!pm.is_infeasible(&store, candidate));
        assert!(!pm.is_infeasible_with_oracle(&store, candidate));
    }

    #[test]
    fn counterexamples_extend_the_battery() {
        let mut store = TermStore::new();
        let x = store.var(8, "x").unwrap();
        let lhs = b(&mut store, x).add(8).get();
        let oracle = ExhaustiveOracle::default();
        let ctx = SynthesisContext::new(&store, lhs, &oracle);
        // A single probe at zero cannot tell x + 8 from x ^ 8.
        let mut pm = PruningManager::new(
            &ctx,
            InputSetPolicy::Custom(vec![vec![BitVec::zero(8)]]),
            StatsLevel::Counts,
        );
        pm.init(&store);

        let rhs = b(&mut store, x).xor(8).get();
        assert!(!pm.is_infeasible(&store, rhs));

        // An oracle witness at x = 8 separates them from then on.
        let cex = Counterexample {
            values: [(x, BitVec::new(8, 8))].into_iter().collect(),
        };
        pm.add_counterexample(&store, &cex);
        assert!(pm.is_infeasible(&store, rhs));
    }

    #[test]
    fn annotated_inputs_only_receive_consistent_probes() {
        let mut store = TermStore::new();
        let mut facts = VarFacts::none(8);
        facts.non_zero = true;
        facts.known = KnownBits::new(BitVec::new(8, 0x01), BitVec::zero(8));
        let x = store.var_with_facts(8, "x", facts).unwrap();
        let lhs = b(&mut store, x).and(1).get();
        let oracle = ExhaustiveOracle::default();
        let ctx = SynthesisContext::new(&store, lhs, &oracle);
        let mut pm = manager(&store, &ctx);

        // With bit 0 known zero, lhs is always 0; the constant 0 candidate
        // must survive every probe.
        let zero = store.const_u128(8, 0);
        assert!(!pm.is_infeasible(&store, zero));
    }
}
