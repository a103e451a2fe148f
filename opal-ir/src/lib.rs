#![forbid(unsafe_code)]

pub mod bitvec;
pub mod builder;
pub mod debug;
pub mod facts;
pub mod replacement;
pub mod term;

pub use bitvec::{BitVec, MAX_WIDTH};
pub use builder::{Builder, b};
pub use debug::{print_replacement, print_term};
pub use facts::{ConstRange, KnownBits};
pub use replacement::{
    BlockPathCondition, Mapping, ParsedReplacement, clone_term, contains_kind, cost, free_vars,
    holes, postorder, profit, replace_consts, replace_terms,
};
pub use term::{Kind, TermData, TermError, TermId, TermStore, VarFacts};
