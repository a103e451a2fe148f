#![forbid(unsafe_code)]
//! Synthesis core of a peephole superoptimizer: hash-consed terms, concrete
//! and abstract interpreters, enumerative candidate search with dataflow
//! pruning, counterexample-guided constant synthesis, and rule
//! generalization. This crate re-exports the member crates; the end-to-end
//! pipeline tests live in `tests/`.

pub use opal_interp::{
    ConcreteInterpreter, EvalValue, ValueCache, const_range, is_concrete, known_bits,
};
pub use opal_ir::{
    BitVec, BlockPathCondition, Builder, ConstRange, Kind, KnownBits, MAX_WIDTH, Mapping,
    ParsedReplacement, TermData, TermError, TermId, TermStore, VarFacts, b, clone_term,
    contains_kind, cost, free_vars, holes, postorder, print_replacement, print_term, profit,
    replace_consts, replace_terms,
};
pub use opal_synth::{
    ConstSynthResult, ConstantSynthesisOptions, Generalized, Guesses, InputSetPolicy,
    PruningManager, StatsLevel, SynthesisContext, SynthesisOptions, SynthesisOutcome,
    SynthesisReport, SynthesisStats, find_one_const_set, find_valid_consts, generalize,
    generate_guesses, reduce, reduce_poison, shrink, synthesize,
};
pub use opal_verify::{
    ConstMap, Counterexample, ExhaustiveOracle, Oracle, OracleError, SolveResult, Timeout,
    VerifyResult, get_cex, get_multiple_cex, known_bits_with_oracle, range_with_oracle, verify,
};

#[cfg(feature = "z3")]
pub use opal_verify::Z3Oracle;
