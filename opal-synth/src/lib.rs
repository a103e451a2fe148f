#![forbid(unsafe_code)]

pub mod cegis;
pub mod context;
pub mod enumerate;
pub mod generalize;
pub mod prune;

pub use cegis::{
    ConstSynthResult, ConstantSynthesisOptions, find_one_const_set, find_valid_consts,
};
pub use context::{SynthesisContext, SynthesisOptions};
pub use enumerate::{
    Guesses, SynthesisOutcome, SynthesisReport, SynthesisStats, generate_guesses, synthesize,
};
pub use generalize::{Generalized, generalize, reduce, reduce_poison, shrink};
pub use prune::{InputSetPolicy, PruningManager, StatsLevel};
