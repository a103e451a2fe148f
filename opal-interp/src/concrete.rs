#![forbid(unsafe_code)]

use opal_ir::{BitVec, Kind, TermId, TermStore};

use crate::value::{EvalValue, ValueCache};

/// Cache-backed concrete evaluator.
///
/// The cache doubles as the variable binding: callers seed `Var` (and solved
/// `Hole`) entries, then evaluate any term over those bindings. In
/// write-enabled mode every intermediate result is recorded too, so
/// evaluating many candidates that share hash-consed subterms does the work
/// for each subterm once.
pub struct ConcreteInterpreter {
    cache: ValueCache,
    cache_writable: bool,
}

impl Default for ConcreteInterpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl ConcreteInterpreter {
    pub fn new() -> Self {
        Self {
            cache: ValueCache::new(),
            cache_writable: false,
        }
    }

    /// Evaluate over the given bindings without recording intermediates.
    pub fn with_cache(cache: ValueCache) -> Self {
        Self {
            cache,
            cache_writable: false,
        }
    }

    /// Evaluate `root` eagerly, recording every intermediate result; the
    /// cache is read-only afterwards.
    pub fn with_root(store: &TermStore, root: TermId, cache: ValueCache) -> Self {
        let mut this = Self {
            cache,
            cache_writable: true,
        };
        this.evaluate(store, root);
        this.cache_writable = false;
        this
    }

    /// Keep recording intermediates across evaluations. Used by the pruning
    /// manager, whose per-input-set interpreters persist across candidates.
    pub fn with_persistent_cache(cache: ValueCache) -> Self {
        Self {
            cache,
            cache_writable: true,
        }
    }

    pub fn cached(&self, id: TermId) -> Option<&EvalValue> {
        self.cache.get(&id)
    }

    pub fn cache(&self) -> &ValueCache {
        &self.cache
    }

    pub fn evaluate(&mut self, store: &TermStore, id: TermId) -> EvalValue {
        if let Some(v) = self.cache.get(&id) {
            return v.clone();
        }
        let data = store.get(id);
        let result = match data.kind {
            Kind::Const => EvalValue::Val(data.value.expect("const carries a value")),
            // An unbound variable or unsolved symbolic constant has no
            // defined result; callers must treat this as a hard miss.
            Kind::Var | Kind::Hole => EvalValue::Unimplemented,
            kind => {
                let ops = data.ops.clone();
                let args: Vec<EvalValue> = ops
                    .iter()
                    .map(|&op| self.evaluate(store, op))
                    .collect();
                evaluate_single(kind, data.width, &args)
            }
        };
        if self.cache_writable {
            self.cache.insert(id, result.clone());
        }
        result
    }
}

/// Apply one opcode to already-evaluated operands.
pub fn evaluate_single(kind: Kind, width: u32, args: &[EvalValue]) -> EvalValue {
    use EvalValue::*;

    // Control-flow-like opcodes look at sentinels themselves.
    match kind {
        Kind::Select => {
            return match &args[0] {
                Val(c) => {
                    if c.is_true() {
                        args[1].clone()
                    } else {
                        args[2].clone()
                    }
                }
                UndefinedBehavior => UndefinedBehavior,
                Unimplemented => Unimplemented,
                // Branching on poison or undef is poison.
                _ => Poison,
            };
        }
        Kind::Freeze => {
            return match &args[0] {
                Val(v) => Val(*v),
                UndefinedBehavior => UndefinedBehavior,
                // A frozen poison/undef is some fixed value the concrete
                // interpreter cannot name.
                _ => Unimplemented,
            };
        }
        Kind::Phi => {
            // Only the degenerate single-incoming phi is evaluable.
            return if args.len() == 1 {
                args[0].clone()
            } else {
                Unimplemented
            };
        }
        _ => {}
    }

    // Everything else combines operand sentinels by dominance: UB over
    // poison over undef. An unevaluable operand ranks below all three,
    // since those sentinels hold whatever value it would have taken.
    fn severity(v: &EvalValue) -> u8 {
        match v {
            EvalValue::UndefinedBehavior => 4,
            EvalValue::Poison => 3,
            EvalValue::Undef => 2,
            EvalValue::Unimplemented => 1,
            EvalValue::Val(_) => 0,
        }
    }
    if let Some(worst) = args
        .iter()
        .filter(|a| !a.has_value())
        .max_by_key(|a| severity(a))
    {
        return worst.clone();
    }
    let v = |i: usize| *args[i].value().expect("checked above");

    match kind {
        Kind::Add => Val(v(0).wrapping_add(&v(1))),
        Kind::AddNsw => evaluate_add_nsw(v(0), v(1)),
        Kind::AddNuw => evaluate_add_nuw(v(0), v(1)),
        Kind::AddNw => evaluate_add_nw(v(0), v(1)),
        Kind::Sub => Val(v(0).wrapping_sub(&v(1))),
        Kind::SubNsw => evaluate_sub_nsw(v(0), v(1)),
        Kind::SubNuw => evaluate_sub_nuw(v(0), v(1)),
        Kind::SubNw => evaluate_sub_nw(v(0), v(1)),
        Kind::Mul => Val(v(0).wrapping_mul(&v(1))),
        Kind::MulNsw => {
            if v(0).smul_overflows(&v(1)) {
                Poison
            } else {
                Val(v(0).wrapping_mul(&v(1)))
            }
        }
        Kind::MulNuw => {
            if v(0).umul_overflows(&v(1)) {
                Poison
            } else {
                Val(v(0).wrapping_mul(&v(1)))
            }
        }
        Kind::MulNw => {
            if v(0).smul_overflows(&v(1)) || v(0).umul_overflows(&v(1)) {
                Poison
            } else {
                Val(v(0).wrapping_mul(&v(1)))
            }
        }

        Kind::UDiv => evaluate_udiv(v(0), v(1)),
        Kind::SDiv => evaluate_sdiv(v(0), v(1)),
        Kind::UDivExact => match evaluate_udiv(v(0), v(1)) {
            Val(q) => {
                if v(0).urem(&v(1)).is_zero() {
                    Val(q)
                } else {
                    Poison
                }
            }
            other => other,
        },
        Kind::SDivExact => match evaluate_sdiv(v(0), v(1)) {
            Val(q) => {
                if v(0).srem(&v(1)).is_zero() {
                    Val(q)
                } else {
                    Poison
                }
            }
            other => other,
        },
        Kind::URem => evaluate_urem(v(0), v(1)),
        Kind::SRem => evaluate_srem(v(0), v(1)),

        Kind::And => Val(v(0) & v(1)),
        Kind::Or => Val(v(0) | v(1)),
        Kind::Xor => Val(v(0) ^ v(1)),

        Kind::Shl => evaluate_shl(v(0), v(1)),
        Kind::ShlNsw => match evaluate_shl(v(0), v(1)) {
            Val(r) => {
                if r.ashr(v(1).raw() as u32) != v(0) {
                    Poison
                } else {
                    Val(r)
                }
            }
            other => other,
        },
        Kind::ShlNuw => match evaluate_shl(v(0), v(1)) {
            Val(r) => {
                if r.lshr(v(1).raw() as u32) != v(0) {
                    Poison
                } else {
                    Val(r)
                }
            }
            other => other,
        },
        Kind::ShlNw => match evaluate_shl(v(0), v(1)) {
            Val(r) => {
                let s = v(1).raw() as u32;
                if r.ashr(s) != v(0) || r.lshr(s) != v(0) {
                    Poison
                } else {
                    Val(r)
                }
            }
            other => other,
        },
        Kind::LShr => evaluate_lshr(v(0), v(1)),
        Kind::LShrExact => match evaluate_lshr(v(0), v(1)) {
            Val(r) => {
                if r.shl(v(1).raw() as u32) != v(0) {
                    Poison
                } else {
                    Val(r)
                }
            }
            other => other,
        },
        Kind::AShr => evaluate_ashr(v(0), v(1)),
        Kind::AShrExact => match evaluate_ashr(v(0), v(1)) {
            Val(r) => {
                if r.shl(v(1).raw() as u32) != v(0) {
                    Poison
                } else {
                    Val(r)
                }
            }
            other => other,
        },

        Kind::Eq => Val(BitVec::bool_val(v(0) == v(1))),
        Kind::Ne => Val(BitVec::bool_val(v(0) != v(1))),
        Kind::Ult => Val(BitVec::bool_val(v(0).ult(&v(1)))),
        Kind::Slt => Val(BitVec::bool_val(v(0).slt(&v(1)))),
        Kind::Ule => Val(BitVec::bool_val(v(0).ule(&v(1)))),
        Kind::Sle => Val(BitVec::bool_val(v(0).sle(&v(1)))),

        Kind::ZExt => Val(v(0).zext(width)),
        Kind::SExt => Val(v(0).sext(width)),
        Kind::Trunc => Val(v(0).trunc(width)),

        Kind::CtPop => Val(BitVec::new(width, v(0).ctpop() as u128)),
        Kind::Ctlz => Val(BitVec::new(width, v(0).ctlz() as u128)),
        Kind::Cttz => Val(BitVec::new(width, v(0).cttz() as u128)),
        Kind::BSwap => Val(v(0).byte_swap()),
        Kind::BitReverse => Val(v(0).bit_reverse()),
        Kind::LogB => {
            if v(0).is_zero() {
                Poison
            } else {
                Val(BitVec::new(width, v(0).log2() as u128))
            }
        }
        Kind::BitWidth => Val(BitVec::new(width, width as u128)),

        Kind::FShl => {
            let (a, b, s) = (v(0), v(1), v(2));
            let amt = (s.raw() % width as u128) as u32;
            if amt == 0 {
                Val(a)
            } else {
                Val(a.shl(amt) | b.lshr(width - amt))
            }
        }
        Kind::FShr => {
            let (a, b, s) = (v(0), v(1), v(2));
            let amt = (s.raw() % width as u128) as u32;
            if amt == 0 {
                Val(b)
            } else {
                Val(a.shl(width - amt) | b.lshr(amt))
            }
        }

        Kind::SAddWithOverflow => {
            overflow_aggregate(width, v(0).wrapping_add(&v(1)), v(0).sadd_overflows(&v(1)))
        }
        Kind::SAddO => Val(BitVec::bool_val(v(0).sadd_overflows(&v(1)))),
        Kind::UAddWithOverflow => {
            overflow_aggregate(width, v(0).wrapping_add(&v(1)), v(0).uadd_overflows(&v(1)))
        }
        Kind::UAddO => Val(BitVec::bool_val(v(0).uadd_overflows(&v(1)))),
        Kind::SSubWithOverflow => {
            overflow_aggregate(width, v(0).wrapping_sub(&v(1)), v(0).ssub_overflows(&v(1)))
        }
        Kind::SSubO => Val(BitVec::bool_val(v(0).ssub_overflows(&v(1)))),
        Kind::USubWithOverflow => {
            overflow_aggregate(width, v(0).wrapping_sub(&v(1)), v(0).usub_overflows(&v(1)))
        }
        Kind::USubO => Val(BitVec::bool_val(v(0).usub_overflows(&v(1)))),
        Kind::SMulWithOverflow => {
            overflow_aggregate(width, v(0).wrapping_mul(&v(1)), v(0).smul_overflows(&v(1)))
        }
        Kind::SMulO => Val(BitVec::bool_val(v(0).smul_overflows(&v(1)))),
        Kind::UMulWithOverflow => {
            overflow_aggregate(width, v(0).wrapping_mul(&v(1)), v(0).umul_overflows(&v(1)))
        }
        Kind::UMulO => Val(BitVec::bool_val(v(0).umul_overflows(&v(1)))),

        Kind::SAddSat => Val(v(0).sadd_sat(&v(1))),
        Kind::UAddSat => Val(v(0).uadd_sat(&v(1))),
        Kind::SSubSat => Val(v(0).ssub_sat(&v(1))),
        Kind::USubSat => Val(v(0).usub_sat(&v(1))),

        Kind::ExtractValue => {
            let agg = v(0);
            let field = agg.width() - 1;
            if v(1).is_zero() {
                Val(agg.trunc(width))
            } else {
                Val(BitVec::bool_val(agg.bit(field)))
            }
        }

        Kind::KnownOnesP => {
            let (x, m) = (v(0), v(1));
            Val(BitVec::bool_val((x & m) == m))
        }
        Kind::KnownZerosP => {
            let (x, m) = (v(0), v(1));
            Val(BitVec::bool_val((x & m).is_zero()))
        }

        Kind::Const | Kind::Var | Kind::Hole | Kind::Phi | Kind::Select | Kind::Freeze => {
            unreachable!("handled before operand propagation")
        }
    }
}

fn overflow_aggregate(width: u32, low: BitVec, flag: bool) -> EvalValue {
    let mut raw = low.zext(width).raw();
    if flag {
        raw |= 1u128 << (width - 1);
    }
    EvalValue::Val(BitVec::new(width, raw))
}

pub fn evaluate_add_nsw(a: BitVec, b: BitVec) -> EvalValue {
    if a.sadd_overflows(&b) {
        EvalValue::Poison
    } else {
        EvalValue::Val(a.wrapping_add(&b))
    }
}

pub fn evaluate_add_nuw(a: BitVec, b: BitVec) -> EvalValue {
    if a.uadd_overflows(&b) {
        EvalValue::Poison
    } else {
        EvalValue::Val(a.wrapping_add(&b))
    }
}

pub fn evaluate_add_nw(a: BitVec, b: BitVec) -> EvalValue {
    if a.sadd_overflows(&b) || a.uadd_overflows(&b) {
        EvalValue::Poison
    } else {
        EvalValue::Val(a.wrapping_add(&b))
    }
}

pub fn evaluate_sub_nsw(a: BitVec, b: BitVec) -> EvalValue {
    if a.ssub_overflows(&b) {
        EvalValue::Poison
    } else {
        EvalValue::Val(a.wrapping_sub(&b))
    }
}

pub fn evaluate_sub_nuw(a: BitVec, b: BitVec) -> EvalValue {
    if a.usub_overflows(&b) {
        EvalValue::Poison
    } else {
        EvalValue::Val(a.wrapping_sub(&b))
    }
}

pub fn evaluate_sub_nw(a: BitVec, b: BitVec) -> EvalValue {
    if a.ssub_overflows(&b) || a.usub_overflows(&b) {
        EvalValue::Poison
    } else {
        EvalValue::Val(a.wrapping_sub(&b))
    }
}

pub fn evaluate_udiv(a: BitVec, b: BitVec) -> EvalValue {
    if b.is_zero() {
        EvalValue::UndefinedBehavior
    } else {
        EvalValue::Val(a.udiv(&b))
    }
}

pub fn evaluate_sdiv(a: BitVec, b: BitVec) -> EvalValue {
    if b.is_zero() || (a == BitVec::min_signed(a.width()) && b.is_all_ones()) {
        EvalValue::UndefinedBehavior
    } else {
        EvalValue::Val(a.sdiv(&b))
    }
}

pub fn evaluate_urem(a: BitVec, b: BitVec) -> EvalValue {
    if b.is_zero() {
        EvalValue::UndefinedBehavior
    } else {
        EvalValue::Val(a.urem(&b))
    }
}

pub fn evaluate_srem(a: BitVec, b: BitVec) -> EvalValue {
    if b.is_zero() || (a == BitVec::min_signed(a.width()) && b.is_all_ones()) {
        EvalValue::UndefinedBehavior
    } else {
        EvalValue::Val(a.srem(&b))
    }
}

pub fn evaluate_shl(a: BitVec, b: BitVec) -> EvalValue {
    if b.raw() >= a.width() as u128 {
        EvalValue::Poison
    } else {
        EvalValue::Val(a.shl(b.raw() as u32))
    }
}

pub fn evaluate_lshr(a: BitVec, b: BitVec) -> EvalValue {
    if b.raw() >= a.width() as u128 {
        EvalValue::Poison
    } else {
        EvalValue::Val(a.lshr(b.raw() as u32))
    }
}

pub fn evaluate_ashr(a: BitVec, b: BitVec) -> EvalValue {
    if b.raw() >= a.width() as u128 {
        EvalValue::Poison
    } else {
        EvalValue::Val(a.ashr(b.raw() as u32))
    }
}
