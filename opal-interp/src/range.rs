#![forbid(unsafe_code)]

use std::collections::HashMap;

use opal_ir::{BitVec, ConstRange, Kind, TermId, TermStore};

use crate::concrete::ConcreteInterpreter;
use crate::known_bits::is_concrete;
use crate::value::EvalValue;

/// Bottom-up constant-range propagation. Same partial-evaluation discipline
/// as the known-bits walk; every transfer over-approximates, never excludes
/// a reachable value.
pub fn const_range(store: &TermStore, root: TermId, ci: &mut ConcreteInterpreter) -> ConstRange {
    let mut memo = HashMap::new();
    walk(store, root, ci, &mut memo)
}

fn walk(
    store: &TermStore,
    id: TermId,
    ci: &mut ConcreteInterpreter,
    memo: &mut HashMap<TermId, ConstRange>,
) -> ConstRange {
    if let Some(r) = memo.get(&id) {
        return *r;
    }
    let width = store.width(id);

    if is_concrete(store, id, true) {
        let r = match ci.evaluate(store, id) {
            EvalValue::Val(v) => ConstRange::single(v),
            _ => ConstRange::full(width),
        };
        memo.insert(id, r);
        return r;
    }
    if let Some(EvalValue::Val(v)) = ci.cached(id) {
        let r = ConstRange::single(*v);
        memo.insert(id, r);
        return r;
    }

    let data = store.get(id);
    let r = match data.kind {
        Kind::Const => ConstRange::single(data.value.expect("const carries a value")),
        Kind::Var => {
            let facts = data.facts.as_ref().expect("var carries facts");
            let mut r = facts.range;
            if r.is_full() && !facts.known.is_top() {
                // Derive a coarse range from the bit facts.
                r = ConstRange::closed(facts.known.unsigned_min(), facts.known.unsigned_max());
            }
            if r.is_full() && facts.non_negative {
                r = ConstRange::new(BitVec::zero(width), BitVec::min_signed(width));
            }
            if r.is_full() && facts.negative {
                r = ConstRange::new(BitVec::min_signed(width), BitVec::zero(width));
            }
            r
        }
        Kind::Hole => ConstRange::full(width),
        kind => {
            let ops: Vec<ConstRange> = data
                .ops
                .clone()
                .into_iter()
                .map(|op| walk(store, op, ci, memo))
                .collect();
            transfer_kind(kind, width, &ops)
        }
    };
    memo.insert(id, r);
    r
}

fn transfer_kind(kind: Kind, width: u32, ops: &[ConstRange]) -> ConstRange {
    use Kind::*;
    match kind {
        Add | AddNsw | AddNuw | AddNw => transfer::add(&ops[0], &ops[1]),
        Sub | SubNsw | SubNuw | SubNw => transfer::sub(&ops[0], &ops[1]),
        Mul | MulNsw | MulNuw | MulNw => transfer::mul(&ops[0], &ops[1]),
        UDiv | UDivExact => transfer::udiv(&ops[0], &ops[1]),
        URem => transfer::urem(&ops[0], &ops[1]),
        And => transfer::and(&ops[0], &ops[1]),
        Or => transfer::or(&ops[0], &ops[1]),
        Xor => transfer::xor(&ops[0], &ops[1]),
        Shl | ShlNsw | ShlNuw | ShlNw => transfer::shl(&ops[0], &ops[1]),
        LShr | LShrExact => transfer::lshr(&ops[0], &ops[1]),

        Eq | Ne | Ult | Slt | Ule | Sle => transfer::compare(kind, &ops[0], &ops[1]),

        ZExt => transfer::zext(&ops[0], width),
        SExt => transfer::sext(&ops[0], width),
        Trunc => transfer::trunc(&ops[0], width),

        Select => ops[1].union_with(&ops[2]),
        Freeze => ops[0],
        Phi => {
            let mut r = ops[0];
            for op in &ops[1..] {
                r = r.union_with(op);
            }
            r
        }

        CtPop | Ctlz | Cttz => {
            ConstRange::closed(BitVec::zero(width), clamped(width, width as u128))
        }
        LogB => ConstRange::closed(BitVec::zero(width), clamped(width, (width - 1) as u128)),
        BitWidth => ConstRange::single(clamped(width, width as u128)),

        _ => ConstRange::full(width),
    }
}

fn clamped(width: u32, v: u128) -> BitVec {
    BitVec::new(width, v.min(BitVec::all_ones(width).raw()))
}

/// Per-opcode range transfer functions.
pub mod transfer {
    use opal_ir::{BitVec, ConstRange, Kind};

    /// `[l1+l2, u1+u2-1]` unless the combined size wraps the width.
    pub fn add(lhs: &ConstRange, rhs: &ConstRange) -> ConstRange {
        if lhs.is_empty() || rhs.is_empty() {
            return ConstRange::empty(lhs.width());
        }
        let w = lhs.width();
        let (Some(s1), Some(s2)) = (lhs.size(), rhs.size()) else {
            return ConstRange::full(w);
        };
        // Combined span must stay below 2^w for the sum interval to be exact.
        let span = s1.checked_add(s2).map(|s| s - 1);
        let fits = match (span, w) {
            (None, _) => false,
            (Some(s), 128) => s < u128::MAX,
            (Some(s), w) => s <= (1u128 << w) - 1,
        };
        if !fits {
            return ConstRange::full(w);
        }
        let lower = lhs.lower().wrapping_add(&rhs.lower());
        let upper = lhs
            .upper()
            .wrapping_add(&rhs.upper())
            .wrapping_sub(&BitVec::one(w));
        ConstRange::new(lower, upper)
    }

    pub fn sub(lhs: &ConstRange, rhs: &ConstRange) -> ConstRange {
        if lhs.is_empty() || rhs.is_empty() {
            return ConstRange::empty(lhs.width());
        }
        let w = lhs.width();
        let (Some(s1), Some(s2)) = (lhs.size(), rhs.size()) else {
            return ConstRange::full(w);
        };
        let span = s1.checked_add(s2).map(|s| s - 1);
        let fits = match (span, w) {
            (None, _) => false,
            (Some(s), 128) => s < u128::MAX,
            (Some(s), w) => s <= (1u128 << w) - 1,
        };
        if !fits {
            return ConstRange::full(w);
        }
        let lower = lhs.lower().wrapping_sub(&rhs.upper()).wrapping_add(&BitVec::one(w));
        let upper = lhs.upper().wrapping_sub(&rhs.lower());
        ConstRange::new(lower, upper)
    }

    pub fn mul(lhs: &ConstRange, rhs: &ConstRange) -> ConstRange {
        let w = lhs.width();
        if lhs.is_empty() || rhs.is_empty() {
            return ConstRange::empty(w);
        }
        if lhs.is_wrapped() || rhs.is_wrapped() || lhs.is_full() || rhs.is_full() {
            return ConstRange::full(w);
        }
        let hi = lhs
            .unsigned_max()
            .raw()
            .checked_mul(rhs.unsigned_max().raw());
        match hi {
            Some(h) if h <= BitVec::all_ones(w).raw() => {
                let lo = lhs.unsigned_min().raw() * rhs.unsigned_min().raw();
                ConstRange::closed(BitVec::new(w, lo), BitVec::new(w, h))
            }
            _ => ConstRange::full(w),
        }
    }

    pub fn udiv(lhs: &ConstRange, rhs: &ConstRange) -> ConstRange {
        let w = lhs.width();
        if lhs.is_empty() || rhs.is_empty() {
            return ConstRange::empty(w);
        }
        let max_d = rhs.unsigned_max();
        if max_d.is_zero() {
            // Division by zero everywhere; no defined result to bound.
            return ConstRange::full(w);
        }
        let min_d = BitVec::umax(rhs.unsigned_min(), BitVec::one(w));
        let lo = lhs.unsigned_min().raw() / max_d.raw();
        let hi = lhs.unsigned_max().raw() / min_d.raw();
        ConstRange::closed(BitVec::new(w, lo), BitVec::new(w, hi))
    }

    pub fn urem(lhs: &ConstRange, rhs: &ConstRange) -> ConstRange {
        let w = lhs.width();
        if lhs.is_empty() || rhs.is_empty() {
            return ConstRange::empty(w);
        }
        let max_d = rhs.unsigned_max();
        if max_d.is_zero() {
            return ConstRange::full(w);
        }
        // Remainder is below the divisor and never above the dividend.
        let hi = BitVec::umin(
            lhs.unsigned_max(),
            max_d.wrapping_sub(&BitVec::one(w)),
        );
        ConstRange::closed(BitVec::zero(w), hi)
    }

    pub fn and(lhs: &ConstRange, rhs: &ConstRange) -> ConstRange {
        let w = lhs.width();
        if lhs.is_empty() || rhs.is_empty() {
            return ConstRange::empty(w);
        }
        let hi = BitVec::umin(lhs.unsigned_max(), rhs.unsigned_max());
        ConstRange::closed(BitVec::zero(w), hi)
    }

    pub fn or(lhs: &ConstRange, rhs: &ConstRange) -> ConstRange {
        let w = lhs.width();
        if lhs.is_empty() || rhs.is_empty() {
            return ConstRange::empty(w);
        }
        let lo = BitVec::umax(lhs.unsigned_min(), rhs.unsigned_min());
        // An OR never exceeds the next power of two above both maxima.
        let m = lhs.unsigned_max().raw() | rhs.unsigned_max().raw();
        let hi = if m == 0 {
            0
        } else {
            let bits = 128 - m.leading_zeros();
            if bits >= w as u32 {
                return ConstRange::closed(lo, BitVec::all_ones(w));
            }
            (1u128 << bits) - 1
        };
        ConstRange::closed(lo, BitVec::new(w, hi))
    }

    pub fn xor(lhs: &ConstRange, rhs: &ConstRange) -> ConstRange {
        let w = lhs.width();
        if lhs.is_empty() || rhs.is_empty() {
            return ConstRange::empty(w);
        }
        let m = lhs.unsigned_max().raw() | rhs.unsigned_max().raw();
        if m == 0 {
            return ConstRange::single(BitVec::zero(w));
        }
        let bits = 128 - m.leading_zeros();
        if bits >= w as u32 {
            return ConstRange::full(w);
        }
        ConstRange::closed(BitVec::zero(w), BitVec::new(w, (1u128 << bits) - 1))
    }

    pub fn shl(lhs: &ConstRange, rhs: &ConstRange) -> ConstRange {
        let w = lhs.width();
        if lhs.is_empty() || rhs.is_empty() {
            return ConstRange::empty(w);
        }
        let Some(amt) = rhs.as_single() else {
            return ConstRange::full(w);
        };
        if amt.raw() >= w as u128 {
            return ConstRange::full(w);
        }
        let c = amt.raw() as u32;
        if lhs.is_wrapped() || lhs.is_full() {
            return ConstRange::full(w);
        }
        let hi = lhs.unsigned_max().raw().checked_shl(c);
        match hi {
            Some(h) if h <= BitVec::all_ones(w).raw() => ConstRange::closed(
                BitVec::new(w, lhs.unsigned_min().raw() << c),
                BitVec::new(w, h),
            ),
            _ => ConstRange::full(w),
        }
    }

    pub fn lshr(lhs: &ConstRange, rhs: &ConstRange) -> ConstRange {
        let w = lhs.width();
        if lhs.is_empty() || rhs.is_empty() {
            return ConstRange::empty(w);
        }
        let min_amt = rhs.unsigned_min().raw().min(w as u128 - 1) as u32;
        let hi = lhs.unsigned_max().lshr(min_amt);
        ConstRange::closed(BitVec::zero(w), hi)
    }

    /// Comparison outputs collapse to `{0}`, `{1}`, or `{0,1}`.
    pub fn compare(kind: Kind, lhs: &ConstRange, rhs: &ConstRange) -> ConstRange {
        let t = ConstRange::single(BitVec::one(1));
        let f = ConstRange::single(BitVec::zero(1));
        let both = ConstRange::full(1);
        match kind {
            Kind::Eq => {
                if let (Some(a), Some(b)) = (lhs.as_single(), rhs.as_single()) {
                    if a == b { t } else { f }
                } else if lhs.is_disjoint(rhs) {
                    f
                } else {
                    both
                }
            }
            Kind::Ne => {
                if let (Some(a), Some(b)) = (lhs.as_single(), rhs.as_single()) {
                    if a != b { t } else { f }
                } else if lhs.is_disjoint(rhs) {
                    t
                } else {
                    both
                }
            }
            Kind::Ult => {
                if lhs.unsigned_max().ult(&rhs.unsigned_min()) {
                    t
                } else if !lhs.unsigned_min().ult(&rhs.unsigned_max()) {
                    f
                } else {
                    both
                }
            }
            Kind::Ule => {
                if lhs.unsigned_max().ule(&rhs.unsigned_min()) {
                    t
                } else if !lhs.unsigned_min().ule(&rhs.unsigned_max()) {
                    f
                } else {
                    both
                }
            }
            Kind::Slt => {
                if lhs.signed_max().slt(&rhs.signed_min()) {
                    t
                } else if !lhs.signed_min().slt(&rhs.signed_max()) {
                    f
                } else {
                    both
                }
            }
            Kind::Sle => {
                if lhs.signed_max().sle(&rhs.signed_min()) {
                    t
                } else if !lhs.signed_min().sle(&rhs.signed_max()) {
                    f
                } else {
                    both
                }
            }
            _ => both,
        }
    }

    pub fn zext(op: &ConstRange, width: u32) -> ConstRange {
        if op.is_empty() {
            return ConstRange::empty(width);
        }
        ConstRange::closed(op.unsigned_min().zext(width), op.unsigned_max().zext(width))
    }

    pub fn sext(op: &ConstRange, width: u32) -> ConstRange {
        if op.is_empty() {
            return ConstRange::empty(width);
        }
        let lo = op.signed_min().sext(width);
        let hi = op.signed_max().sext(width);
        ConstRange::closed(lo, hi)
    }

    pub fn trunc(op: &ConstRange, width: u32) -> ConstRange {
        if op.is_empty() {
            return ConstRange::empty(width);
        }
        if op.is_full() || op.is_wrapped() {
            return ConstRange::full(width);
        }
        // Exact only when the whole interval fits in the narrow width.
        if op.unsigned_max().raw() <= BitVec::all_ones(width).raw() {
            ConstRange::closed(op.unsigned_min().trunc(width), op.unsigned_max().trunc(width))
        } else {
            ConstRange::full(width)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ValueCache;
    use opal_ir::{TermStore, VarFacts, b};

    fn bv(w: u32, v: u128) -> BitVec {
        BitVec::new(w, v)
    }

    #[test]
    fn constants_are_singletons() {
        let mut store = TermStore::new();
        let t = store.const_u128(8, 42);
        let mut ci = ConcreteInterpreter::with_persistent_cache(ValueCache::new());
        assert_eq!(const_range(&store, t, &mut ci).as_single(), Some(bv(8, 42)));
    }

    #[test]
    fn addition_of_small_ranges_is_exact() {
        let mut store = TermStore::new();
        let mut facts = VarFacts::none(8);
        facts.range = ConstRange::new(bv(8, 10), bv(8, 20));
        let x = store.var_with_facts(8, "x", facts).unwrap();
        let t = b(&mut store, x).add(5).get();
        let mut ci = ConcreteInterpreter::new();
        let r = const_range(&store, t, &mut ci);
        assert!(r.contains(bv(8, 15)));
        assert!(r.contains(bv(8, 24)));
        assert!(!r.contains(bv(8, 25)));
        assert!(!r.contains(bv(8, 14)));
    }

    #[test]
    fn masked_value_bounds_an_and() {
        let mut store = TermStore::new();
        let x = store.var(8, "x").unwrap();
        let t = b(&mut store, x).and(0x0f).get();
        let mut ci = ConcreteInterpreter::new();
        let r = const_range(&store, t, &mut ci);
        assert!(r.contains(bv(8, 0)));
        assert!(r.contains(bv(8, 15)));
        assert!(!r.contains(bv(8, 16)));
    }

    #[test]
    fn urem_is_bounded_by_divisor() {
        let mut store = TermStore::new();
        let x = store.var(8, "x").unwrap();
        let t = b(&mut store, x).urem(10).get();
        let mut ci = ConcreteInterpreter::new();
        let r = const_range(&store, t, &mut ci);
        assert!(r.contains(bv(8, 9)));
        assert!(!r.contains(bv(8, 10)));
    }

    #[test]
    fn comparison_ranges_decide_when_bounds_separate() {
        let lo = ConstRange::new(bv(8, 0), bv(8, 10));
        let hi = ConstRange::new(bv(8, 10), bv(8, 20));
        assert_eq!(
            transfer::compare(Kind::Ult, &lo, &hi).as_single(),
            Some(bv(1, 1))
        );
        assert_eq!(
            transfer::compare(Kind::Eq, &lo, &hi).as_single(),
            Some(bv(1, 0))
        );
        assert!(transfer::compare(Kind::Ult, &hi, &lo).as_single() == Some(bv(1, 0)));
    }

    #[test]
    fn select_unions_both_arms() {
        let mut store = TermStore::new();
        let c = store.var(1, "c").unwrap();
        let a = store.const_u128(8, 3);
        let d = store.const_u128(8, 9);
        let t = store.intern(Kind::Select, 8, vec![c, a, d]).unwrap();
        let mut ci = ConcreteInterpreter::new();
        let r = const_range(&store, t, &mut ci);
        assert!(r.contains(bv(8, 3)));
        assert!(r.contains(bv(8, 9)));
    }
}
