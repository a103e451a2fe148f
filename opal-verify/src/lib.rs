#![forbid(unsafe_code)]

pub mod exhaustive;
pub mod facts;
pub mod oracle;
pub mod verify;

#[cfg(feature = "z3")]
pub mod z3_oracle;

pub use exhaustive::ExhaustiveOracle;
pub use facts::{known_bits_with_oracle, range_with_oracle};
pub use oracle::{
    ConstMap, Counterexample, Oracle, OracleError, SolveResult, Timeout, VerifyResult,
};
pub use verify::{get_cex, get_multiple_cex, verify};

#[cfg(feature = "z3")]
pub use z3_oracle::Z3Oracle;
