#![forbid(unsafe_code)]

use std::collections::HashMap;

use opal_ir::{BitVec, Kind, KnownBits, TermId, TermStore, contains_kind};

use crate::concrete::ConcreteInterpreter;
use crate::value::EvalValue;

/// Whether the DAG under `id` contains no unknowns: no variables, and no
/// symbolic constants when `consider_holes` is set.
pub fn is_concrete(store: &TermStore, id: TermId, consider_holes: bool) -> bool {
    !contains_kind(store, id, Kind::Var)
        && (!consider_holes || !contains_kind(store, id, Kind::Hole))
}

/// Bottom-up known-bits propagation.
///
/// Fully-concrete subterms are evaluated through `ci` and contribute exact
/// facts (partial evaluation); variables start from their annotations;
/// symbolic constants are unknown. The result is sound: a bit is claimed
/// known only if every consistent concrete evaluation agrees on it.
pub fn known_bits(store: &TermStore, root: TermId, ci: &mut ConcreteInterpreter) -> KnownBits {
    let mut memo = HashMap::new();
    walk(store, root, ci, &mut memo)
}

fn walk(
    store: &TermStore,
    id: TermId,
    ci: &mut ConcreteInterpreter,
    memo: &mut HashMap<TermId, KnownBits>,
) -> KnownBits {
    if let Some(kb) = memo.get(&id) {
        return *kb;
    }
    let width = store.width(id);

    // Partial evaluation: a concrete subterm has exactly one defined value,
    // or none at all (in which case any claim is sound).
    if is_concrete(store, id, true) {
        let kb = match ci.evaluate(store, id) {
            EvalValue::Val(v) => KnownBits::exact(v),
            _ => KnownBits::top(width),
        };
        memo.insert(id, kb);
        return kb;
    }
    // A bound variable is as good as a constant.
    if let Some(EvalValue::Val(v)) = ci.cached(id) {
        let kb = KnownBits::exact(*v);
        memo.insert(id, kb);
        return kb;
    }

    let data = store.get(id);
    let kb = match data.kind {
        Kind::Const => KnownBits::exact(data.value.expect("const carries a value")),
        Kind::Var => {
            let facts = data.facts.as_ref().expect("var carries facts");
            let mut kb = facts.known;
            // Extra sign bits pin no individual bit; they only tie the top
            // bits to each other, so only the sign-fact flags refine here.
            if facts.non_negative {
                let sign = KnownBits::new(BitVec::sign_bit(width), BitVec::zero(width));
                kb = kb.conjoin(&sign).unwrap_or(kb);
            }
            if facts.negative {
                let sign = KnownBits::new(BitVec::zero(width), BitVec::sign_bit(width));
                kb = kb.conjoin(&sign).unwrap_or(kb);
            }
            kb
        }
        Kind::Hole => KnownBits::top(width),
        kind => {
            let ops: Vec<KnownBits> = data
                .ops
                .clone()
                .into_iter()
                .map(|op| walk(store, op, ci, memo))
                .collect();
            transfer_kind(store, kind, width, &data.ops.clone(), &ops)
        }
    };
    memo.insert(id, kb);
    kb
}

fn transfer_kind(
    store: &TermStore,
    kind: Kind,
    width: u32,
    op_ids: &[TermId],
    ops: &[KnownBits],
) -> KnownBits {
    use Kind::*;
    match kind {
        Add | AddNuw | AddNw => transfer::add(&ops[0], &ops[1]),
        AddNsw => transfer::addnsw(&ops[0], &ops[1]),
        Sub | SubNuw | SubNw => transfer::sub(&ops[0], &ops[1]),
        SubNsw => transfer::subnsw(&ops[0], &ops[1]),
        Mul | MulNsw | MulNuw | MulNw => transfer::mul(&ops[0], &ops[1]),
        UDiv | UDivExact => transfer::udiv(&ops[0], &ops[1]),
        URem => transfer::urem(&ops[0], &ops[1]),
        And => transfer::and(&ops[0], &ops[1]),
        Or => transfer::or(&ops[0], &ops[1]),
        Xor => transfer::xor(&ops[0], &ops[1]),
        Shl | ShlNsw | ShlNuw | ShlNw => transfer::shl(&ops[0], &ops[1]),
        LShr | LShrExact => transfer::lshr(&ops[0], &ops[1]),
        AShr | AShrExact => transfer::ashr(&ops[0], &ops[1]),
        Eq => transfer::eq(&ops[0], &ops[1]),
        Ne => transfer::ne(&ops[0], &ops[1]),
        Ult => transfer::ult(&ops[0], &ops[1]),
        Slt => transfer::slt(&ops[0], &ops[1]),
        Ule => transfer::ule(&ops[0], &ops[1]),
        Sle => transfer::sle(&ops[0], &ops[1]),

        ZExt => {
            let op = &ops[0];
            let ow = op.width();
            // High bits become known zero.
            let zero = op.zeros().zext(width) | (!BitVec::all_ones(ow).zext(width));
            KnownBits::new(zero, op.ones().zext(width))
        }
        SExt => {
            let op = &ops[0];
            if op.sign_known_zero() {
                KnownBits::new(op.zeros().sext(width), op.ones().zext(width))
            } else if op.sign_known_one() {
                KnownBits::new(op.zeros().zext(width), op.ones().sext(width))
            } else {
                // Sign unknown: low bits keep their facts, high bits are open.
                KnownBits::new(op.zeros().zext(width), op.ones().zext(width))
            }
        }
        Trunc => KnownBits::new(ops[0].zeros().trunc(width), ops[0].ones().trunc(width)),

        Select => ops[1].meet(&ops[2]),
        Freeze => ops[0],
        Phi => {
            let mut kb = ops[0];
            for op in &ops[1..] {
                kb = kb.meet(op);
            }
            kb
        }

        CtPop => count_bound(width, width),
        Ctlz | Cttz => count_bound(width, width),
        LogB => count_bound(width, width.saturating_sub(1)),
        BitWidth => KnownBits::exact(BitVec::new(width, width as u128)),
        BSwap => {
            let z = ops[0].zeros().byte_swap();
            let o = ops[0].ones().byte_swap();
            KnownBits::new(z, o)
        }
        BitReverse => KnownBits::new(ops[0].zeros().bit_reverse(), ops[0].ones().bit_reverse()),

        ExtractValue => {
            let idx = store
                .const_value(op_ids[1])
                .expect("interning checked the index");
            if idx.is_zero() {
                KnownBits::new(ops[0].zeros().trunc(width), ops[0].ones().trunc(width))
            } else {
                KnownBits::top(width)
            }
        }

        // Remaining opcodes contribute no local facts.
        _ => KnownBits::top(width),
    }
}

/// Result of a count-like opcode lies in `[0, max]`; bits above the count's
/// magnitude are known zero.
fn count_bound(width: u32, max: u32) -> KnownBits {
    let needed = 128 - (max as u128).leading_zeros();
    if needed >= width {
        return KnownBits::top(width);
    }
    let zero = BitVec::all_ones(width).shl(needed);
    KnownBits::new(zero, BitVec::zero(width))
}

/// Per-opcode known-bits transfer functions. Each is monotone and sound;
/// none is required to be complete.
pub mod transfer {
    use opal_ir::{BitVec, KnownBits};

    /// Carry-aware addition: a result bit is known when both operand bits
    /// and the incoming carry at that position are known.
    fn add_carry(lhs: &KnownBits, rhs: &KnownBits, carry_zero: bool, carry_one: bool) -> KnownBits {
        let w = lhs.width();
        let one = BitVec::one(w);
        let possible_sum_zero = lhs
            .unsigned_max()
            .wrapping_add(&rhs.unsigned_max())
            .wrapping_add(&if carry_zero { BitVec::zero(w) } else { one });
        let possible_sum_one = lhs
            .unsigned_min()
            .wrapping_add(&rhs.unsigned_min())
            .wrapping_add(&if carry_one { one } else { BitVec::zero(w) });

        let carry_known_zero = !(possible_sum_zero ^ lhs.zeros() ^ rhs.zeros());
        let carry_known_one = possible_sum_one ^ lhs.ones() ^ rhs.ones();

        let lhs_known = lhs.zeros() | lhs.ones();
        let rhs_known = rhs.zeros() | rhs.ones();
        let carry_known = carry_known_zero | carry_known_one;
        let known = lhs_known & rhs_known & carry_known;

        KnownBits::new(!possible_sum_zero & known, possible_sum_one & known)
    }

    pub fn add(lhs: &KnownBits, rhs: &KnownBits) -> KnownBits {
        add_carry(lhs, rhs, true, false)
    }

    pub fn addnsw(lhs: &KnownBits, rhs: &KnownBits) -> KnownBits {
        let mut kb = add(lhs, rhs);
        let w = kb.width();
        // Absent signed wrap, same-signed operands pin the result sign.
        if lhs.sign_known_zero() && rhs.sign_known_zero() {
            kb = kb
                .conjoin(&KnownBits::new(BitVec::sign_bit(w), BitVec::zero(w)))
                .unwrap_or(kb);
        } else if lhs.sign_known_one() && rhs.sign_known_one() {
            kb = kb
                .conjoin(&KnownBits::new(BitVec::zero(w), BitVec::sign_bit(w)))
                .unwrap_or(kb);
        }
        kb
    }

    pub fn sub(lhs: &KnownBits, rhs: &KnownBits) -> KnownBits {
        // a - b == a + ~b + 1.
        add_carry(lhs, &rhs.flip(), false, true)
    }

    pub fn subnsw(lhs: &KnownBits, rhs: &KnownBits) -> KnownBits {
        sub(lhs, rhs)
    }

    pub fn mul(lhs: &KnownBits, rhs: &KnownBits) -> KnownBits {
        let w = lhs.width();
        if let (Some(a), Some(c)) = (lhs.as_constant(), rhs.as_constant()) {
            return KnownBits::exact(a.wrapping_mul(&c));
        }
        // Known trailing zeros of the factors accumulate in the product.
        let tz = (trailing_known_zeros(lhs) + trailing_known_zeros(rhs)).min(w);
        let mut zero = low_ones(w, tz);
        // If the product cannot reach the top bits, they are known zero.
        if let Some(p) = lhs
            .unsigned_max()
            .raw()
            .checked_mul(rhs.unsigned_max().raw())
        {
            let used = 128 - p.leading_zeros();
            if used < w {
                zero = zero | BitVec::all_ones(w).shl(used);
            }
        }
        KnownBits::new(zero, BitVec::zero(w))
    }

    fn trailing_known_zeros(kb: &KnownBits) -> u32 {
        let w = kb.width();
        let mut n = 0;
        while n < w && kb.zeros().bit(n) {
            n += 1;
        }
        n
    }

    fn low_ones(width: u32, n: u32) -> BitVec {
        if n == 0 {
            BitVec::zero(width)
        } else if n >= width {
            BitVec::all_ones(width)
        } else {
            !BitVec::all_ones(width).shl(n)
        }
    }

    pub fn udiv(lhs: &KnownBits, rhs: &KnownBits) -> KnownBits {
        let w = lhs.width();
        if let (Some(a), Some(c)) = (lhs.as_constant(), rhs.as_constant())
            && !c.is_zero()
        {
            return KnownBits::exact(a.udiv(&c));
        }
        // The quotient never exceeds the dividend.
        leading_zero_bound(w, lhs.unsigned_max())
    }

    pub fn urem(lhs: &KnownBits, rhs: &KnownBits) -> KnownBits {
        let w = lhs.width();
        if let (Some(a), Some(c)) = (lhs.as_constant(), rhs.as_constant())
            && !c.is_zero()
        {
            return KnownBits::exact(a.urem(&c));
        }
        // The remainder is below the divisor and never above the dividend.
        let bound = BitVec::umin(lhs.unsigned_max(), rhs.unsigned_max());
        leading_zero_bound(w, bound)
    }

    fn leading_zero_bound(width: u32, max: BitVec) -> KnownBits {
        let lz = max.ctlz();
        if lz == 0 {
            KnownBits::top(width)
        } else if lz >= width {
            KnownBits::exact(BitVec::zero(width))
        } else {
            KnownBits::new(BitVec::all_ones(width).shl(width - lz), BitVec::zero(width))
        }
    }

    pub fn and(lhs: &KnownBits, rhs: &KnownBits) -> KnownBits {
        KnownBits::new(lhs.zeros() | rhs.zeros(), lhs.ones() & rhs.ones())
    }

    pub fn or(lhs: &KnownBits, rhs: &KnownBits) -> KnownBits {
        KnownBits::new(lhs.zeros() & rhs.zeros(), lhs.ones() | rhs.ones())
    }

    pub fn xor(lhs: &KnownBits, rhs: &KnownBits) -> KnownBits {
        let one = (lhs.ones() & rhs.zeros()) | (lhs.zeros() & rhs.ones());
        let zero = (lhs.zeros() & rhs.zeros()) | (lhs.ones() & rhs.ones());
        KnownBits::new(zero, one)
    }

    pub fn shl(lhs: &KnownBits, rhs: &KnownBits) -> KnownBits {
        let w = lhs.width();
        if let Some(amt) = rhs.as_constant() {
            if amt.raw() >= w as u128 {
                // The shift is poison; any claim is sound.
                return KnownBits::top(w);
            }
            let c = amt.raw() as u32;
            if c == 0 {
                return *lhs;
            }
            let zero = lhs.zeros().shl(c) | low_ones(w, c);
            return KnownBits::new(zero, lhs.ones().shl(c));
        }
        // Unknown amount: at least the minimum shift's low zeros.
        let min_amt = rhs.unsigned_min().raw().min(w as u128) as u32;
        KnownBits::new(low_ones(w, min_amt), BitVec::zero(w))
    }

    pub fn lshr(lhs: &KnownBits, rhs: &KnownBits) -> KnownBits {
        let w = lhs.width();
        if let Some(amt) = rhs.as_constant() {
            if amt.raw() >= w as u128 {
                return KnownBits::top(w);
            }
            let c = amt.raw() as u32;
            if c == 0 {
                return *lhs;
            }
            let zero = lhs.zeros().lshr(c) | BitVec::all_ones(w).shl(w - c);
            return KnownBits::new(zero, lhs.ones().lshr(c));
        }
        let min_amt = rhs.unsigned_min().raw().min(w as u128) as u32;
        if min_amt == 0 || min_amt >= w {
            return KnownBits::top(w);
        }
        KnownBits::new(BitVec::all_ones(w).shl(w - min_amt), BitVec::zero(w))
    }

    pub fn ashr(lhs: &KnownBits, rhs: &KnownBits) -> KnownBits {
        let w = lhs.width();
        if let Some(amt) = rhs.as_constant() {
            if amt.raw() >= w as u128 {
                return KnownBits::top(w);
            }
            let c = amt.raw() as u32;
            if c == 0 {
                return *lhs;
            }
            // The vacated high bits replicate the sign bit.
            let high = BitVec::all_ones(w).shl(w - c);
            if lhs.sign_known_zero() {
                return KnownBits::new(lhs.zeros().lshr(c) | high, lhs.ones().lshr(c));
            }
            if lhs.sign_known_one() {
                return KnownBits::new(lhs.zeros().lshr(c), lhs.ones().lshr(c) | high);
            }
            return KnownBits::new(lhs.zeros().lshr(c) & !high, lhs.ones().lshr(c));
        }
        KnownBits::top(w)
    }

    fn bool_known(result: Option<bool>) -> KnownBits {
        match result {
            Some(true) => KnownBits::exact(BitVec::one(1)),
            Some(false) => KnownBits::exact(BitVec::zero(1)),
            None => KnownBits::top(1),
        }
    }

    pub fn eq(lhs: &KnownBits, rhs: &KnownBits) -> KnownBits {
        if let (Some(a), Some(c)) = (lhs.as_constant(), rhs.as_constant()) {
            return bool_known(Some(a == c));
        }
        if lhs.conflicts_with(rhs) {
            return bool_known(Some(false));
        }
        bool_known(None)
    }

    pub fn ne(lhs: &KnownBits, rhs: &KnownBits) -> KnownBits {
        eq(lhs, rhs).flip_bool()
    }

    pub fn ult(lhs: &KnownBits, rhs: &KnownBits) -> KnownBits {
        if lhs.unsigned_max().ult(&rhs.unsigned_min()) {
            bool_known(Some(true))
        } else if !lhs.unsigned_min().ult(&rhs.unsigned_max()) {
            bool_known(Some(false))
        } else {
            bool_known(None)
        }
    }

    pub fn ule(lhs: &KnownBits, rhs: &KnownBits) -> KnownBits {
        if lhs.unsigned_max().ule(&rhs.unsigned_min()) {
            bool_known(Some(true))
        } else if !lhs.unsigned_min().ule(&rhs.unsigned_max()) {
            bool_known(Some(false))
        } else {
            bool_known(None)
        }
    }

    pub fn slt(lhs: &KnownBits, rhs: &KnownBits) -> KnownBits {
        if lhs.signed_max().slt(&rhs.signed_min()) {
            bool_known(Some(true))
        } else if !lhs.signed_min().slt(&rhs.signed_max()) {
            bool_known(Some(false))
        } else {
            bool_known(None)
        }
    }

    pub fn sle(lhs: &KnownBits, rhs: &KnownBits) -> KnownBits {
        if lhs.signed_max().sle(&rhs.signed_min()) {
            bool_known(Some(true))
        } else if !lhs.signed_min().sle(&rhs.signed_max()) {
            bool_known(Some(false))
        } else {
            bool_known(None)
        }
    }

    trait FlipBool {
        fn flip_bool(self) -> KnownBits;
    }

    impl FlipBool for KnownBits {
        fn flip_bool(self) -> KnownBits {
            if let Some(v) = self.as_constant() {
                KnownBits::exact(!v)
            } else {
                self
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ValueCache;
    use opal_ir::{VarFacts, b};

    fn bv(w: u32, v: u128) -> BitVec {
        BitVec::new(w, v)
    }

    #[test]
    fn constant_shift_is_exact() {
        let mut store = TermStore::new();
        let three = store.const_u128(64, 3);
        let two = store.const_u128(64, 2);
        let shift = store.intern(Kind::Shl, 64, vec![three, two]).unwrap();
        let mut ci = ConcreteInterpreter::with_persistent_cache(ValueCache::new());
        let kb = known_bits(&store, shift, &mut ci);
        assert_eq!(kb.as_constant(), Some(bv(64, 12)));
    }

    #[test]
    fn annotated_variable_bits_surface() {
        let mut store = TermStore::new();
        let mut facts = VarFacts::none(8);
        facts.known = KnownBits::exact(bv(8, 5));
        let x = store.var_with_facts(8, "x", facts).unwrap();
        let mut ci = ConcreteInterpreter::new();
        let kb = known_bits(&store, x, &mut ci);
        assert_eq!(kb.to_string(), "00000101");
    }

    #[test]
    fn sign_replication_alone_pins_no_bit() {
        let mut store = TermStore::new();
        let mut facts = VarFacts::none(8);
        facts.num_sign_bits = 3;
        let x = store.var_with_facts(8, "x", facts).unwrap();
        let mut ci = ConcreteInterpreter::new();
        let kb = known_bits(&store, x, &mut ci);
        // 0b111xxxxx and 0b000xxxxx both carry three sign bits.
        assert!(kb.contains(BitVec::new(8, 0xe0)));
        assert!(kb.contains(BitVec::new(8, 0x1f)));
    }

    #[test]
    fn and_or_masks_combine() {
        let mut store = TermStore::new();
        let x = store.var(8, "x").unwrap();
        let masked = b(&mut store, x).and(0x0f).get();
        let mut ci = ConcreteInterpreter::new();
        let kb = known_bits(&store, masked, &mut ci);
        assert_eq!(kb.to_string(), "0000????");

        let set = b(&mut store, x).or(0x80).get();
        let kb = known_bits(&store, set, &mut ci);
        assert_eq!(kb.to_string(), "1???????");
    }

    #[test]
    fn addition_carries_through_known_zeros() {
        // (x & 0x0f) + 0x10 keeps the low four bits of x and pins bit 4's
        // carry chain: low nibble unchanged, no carry into the top nibble.
        let mut store = TermStore::new();
        let x = store.var(8, "x").unwrap();
        let t = b(&mut store, x).and(0x0f).add(0x10).get();
        let mut ci = ConcreteInterpreter::new();
        let kb = known_bits(&store, t, &mut ci);
        assert!(kb.zeros().bit(7) && kb.zeros().bit(6) && kb.zeros().bit(5));
        assert!(kb.ones().bit(4));
    }

    #[test]
    fn transfer_soundness_spot_checks() {
        // For every pair of partial facts over width 4 and every concrete
        // pair consistent with them, the concrete result must satisfy the
        // transferred facts.
        for za in 0..16u128 {
            for oa in 0..16u128 {
                if za & oa != 0 {
                    continue;
                }
                let ka = KnownBits::new(bv(4, za), bv(4, oa));
                let kb_ = KnownBits::new(bv(4, oa), bv(4, za));
                let sum = transfer::add(&ka, &kb_);
                let diff = transfer::sub(&ka, &kb_);
                for a in 0..16u128 {
                    if !ka.contains(bv(4, a)) {
                        continue;
                    }
                    for c in 0..16u128 {
                        if !kb_.contains(bv(4, c)) {
                            continue;
                        }
                        let s = bv(4, a).wrapping_add(&bv(4, c));
                        assert!(sum.contains(s), "add {ka} + {kb_} claims {sum}, got {s}");
                        let d = bv(4, a).wrapping_sub(&bv(4, c));
                        assert!(diff.contains(d), "sub {ka} - {kb_} claims {diff}, got {d}");
                    }
                }
            }
        }
    }

    #[test]
    fn comparisons_from_disjoint_bounds() {
        let lo = KnownBits::new(bv(8, 0xf0), bv(8, 0x00)); // <= 0x0f
        let hi = KnownBits::new(bv(8, 0x0f), bv(8, 0x10)); // in [0x10, 0xf0]
        assert_eq!(transfer::ult(&lo, &hi).as_constant(), Some(bv(1, 1)));
        assert_eq!(transfer::ult(&hi, &lo).as_constant(), Some(bv(1, 0)));
        assert!(transfer::eq(&lo, &hi).as_constant() == Some(bv(1, 0)));
    }
}
