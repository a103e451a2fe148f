#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::fmt;

use opal_ir::{BitVec, TermId};

/// Outcome of concretely evaluating a term. Only `Val` carries a value; the
/// other variants are terminal sentinels that propagate through further
/// evaluation according to each opcode's rules.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EvalValue {
    Val(BitVec),
    /// A deferred immediate-UB value: using it in most ways is allowed but
    /// any observable dependence makes the producing rule inapplicable.
    Poison,
    /// An arbitrary-but-fixed value was produced; the interpreter does not
    /// pick one.
    Undef,
    /// The input triggers immediate undefined behavior (division by zero).
    UndefinedBehavior,
    /// No defined result is available: an unbound variable, an unsolved
    /// symbolic constant, or an operation outside the evaluator's domain.
    Unimplemented,
}

impl EvalValue {
    pub fn has_value(&self) -> bool {
        matches!(self, EvalValue::Val(_))
    }

    pub fn value(&self) -> Option<&BitVec> {
        match self {
            EvalValue::Val(v) => Some(v),
            _ => None,
        }
    }

    /// A sentinel that can never refine a defined left-hand-side value.
    pub fn is_undefined(&self) -> bool {
        matches!(
            self,
            EvalValue::Poison | EvalValue::Undef | EvalValue::UndefinedBehavior
        )
    }
}

impl fmt::Display for EvalValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvalValue::Val(v) => write!(f, "{v}"),
            EvalValue::Poison => write!(f, "poison"),
            EvalValue::Undef => write!(f, "undef"),
            EvalValue::UndefinedBehavior => write!(f, "undefined behavior"),
            EvalValue::Unimplemented => write!(f, "unimplemented"),
        }
    }
}

/// Memoized evaluation results for one interpretation pass. Bindings for
/// variables (and solved holes) are seeded here before evaluation;
/// intermediate results are appended, never overwritten.
pub type ValueCache = HashMap<TermId, EvalValue>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_val_exposes_a_bitvector() {
        let v = EvalValue::Val(BitVec::new(8, 3));
        assert!(v.has_value());
        assert_eq!(v.value().unwrap().raw(), 3);
        for s in [
            EvalValue::Poison,
            EvalValue::Undef,
            EvalValue::UndefinedBehavior,
            EvalValue::Unimplemented,
        ] {
            assert!(!s.has_value());
            assert!(s.value().is_none());
        }
    }

    #[test]
    fn undefined_classification() {
        assert!(EvalValue::Poison.is_undefined());
        assert!(EvalValue::Undef.is_undefined());
        assert!(EvalValue::UndefinedBehavior.is_undefined());
        assert!(!EvalValue::Unimplemented.is_undefined());
        assert!(!EvalValue::Val(BitVec::zero(1)).is_undefined());
    }
}
