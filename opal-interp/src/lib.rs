#![forbid(unsafe_code)]

pub mod concrete;
pub mod known_bits;
pub mod range;
pub mod value;

pub use concrete::{
    ConcreteInterpreter, evaluate_add_nsw, evaluate_add_nuw, evaluate_add_nw, evaluate_ashr,
    evaluate_lshr, evaluate_sdiv, evaluate_shl, evaluate_single, evaluate_srem, evaluate_sub_nsw,
    evaluate_sub_nuw, evaluate_sub_nw, evaluate_udiv, evaluate_urem,
};
pub use known_bits::{is_concrete, known_bits};
pub use range::const_range;
pub use value::{EvalValue, ValueCache};
