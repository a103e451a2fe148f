#![forbid(unsafe_code)]

use opal_ir::{BitVec, ConstRange, Kind, KnownBits, Mapping, TermId, TermStore};

use crate::oracle::{Oracle, OracleError, Timeout, VerifyResult};

/// Known bits of `t` under `pcs`, proved through the oracle one bit at a
/// time: bit `i` is known zero (one) when `(t >> i) & 1 == 0` (`== 1`) is
/// valid. Strictly more precise than local transfer-function propagation and
/// strictly more expensive; the per-query timeout is the caller's budget.
pub fn known_bits_with_oracle(
    store: &mut TermStore,
    oracle: &dyn Oracle,
    t: TermId,
    pcs: &[Mapping],
    timeout: Timeout,
) -> Result<KnownBits, OracleError> {
    let width = store.width(t);
    let mut zero = BitVec::zero(width);
    let mut one = BitVec::zero(width);
    for i in 0..width {
        let bit = bit_of(store, t, i);
        let zero_bit = store.const_u128(1, 0);
        match oracle.check_equivalent(store, &Mapping::new(bit, zero_bit), pcs, &[], timeout)? {
            VerifyResult::Valid => {
                zero = zero | BitVec::new(width, 1u128 << i);
                continue;
            }
            VerifyResult::Invalid(_) | VerifyResult::Unknown => {}
        }
        let one_bit = store.const_u128(1, 1);
        if let VerifyResult::Valid =
            oracle.check_equivalent(store, &Mapping::new(bit, one_bit), pcs, &[], timeout)?
        {
            one = one | BitVec::new(width, 1u128 << i);
        }
    }
    Ok(KnownBits::new(zero, one))
}

/// Unsigned range of `t` under `pcs`, found by binary search over validity
/// of `t <=u bound` and `bound <=u t`. Unknown probes widen, never narrow.
pub fn range_with_oracle(
    store: &mut TermStore,
    oracle: &dyn Oracle,
    t: TermId,
    pcs: &[Mapping],
    timeout: Timeout,
) -> Result<ConstRange, OracleError> {
    let width = store.width(t);
    let max = BitVec::all_ones(width).raw();

    // Smallest proven upper bound.
    let mut lo = 0u128;
    let mut hi = max;
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if bound_holds(store, oracle, t, mid, BoundSide::Upper, pcs, timeout)? {
            hi = mid;
        } else {
            lo = mid + 1;
        }
    }
    let upper = hi;

    // Largest proven lower bound.
    let mut lo2 = 0u128;
    let mut hi2 = upper;
    while lo2 < hi2 {
        let mid = lo2 + (hi2 - lo2).div_ceil(2);
        if bound_holds(store, oracle, t, mid, BoundSide::Lower, pcs, timeout)? {
            lo2 = mid;
        } else {
            hi2 = mid - 1;
        }
    }
    Ok(ConstRange::closed(
        BitVec::new(width, lo2),
        BitVec::new(width, upper),
    ))
}

enum BoundSide {
    Upper,
    Lower,
}

fn bound_holds(
    store: &mut TermStore,
    oracle: &dyn Oracle,
    t: TermId,
    bound: u128,
    side: BoundSide,
    pcs: &[Mapping],
    timeout: Timeout,
) -> Result<bool, OracleError> {
    let width = store.width(t);
    let c = store.const_u128(width, bound);
    let claim = match side {
        BoundSide::Upper => store
            .intern(Kind::Ule, 1, vec![t, c])
            .expect("predicate over equal widths"),
        BoundSide::Lower => store
            .intern(Kind::Ule, 1, vec![c, t])
            .expect("predicate over equal widths"),
    };
    let truth = store.true_val();
    Ok(matches!(
        oracle.check_equivalent(store, &Mapping::new(claim, truth), pcs, &[], timeout)?,
        VerifyResult::Valid
    ))
}

/// `(t >> i) & 1` as a 1-bit term.
fn bit_of(store: &mut TermStore, t: TermId, i: u32) -> TermId {
    let width = store.width(t);
    if width == 1 {
        return t;
    }
    let amt = store.const_u128(width, i as u128);
    let shifted = store
        .intern(Kind::LShr, width, vec![t, amt])
        .expect("shift within width");
    store
        .intern(Kind::Trunc, 1, vec![shifted])
        .expect("trunc to bit")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exhaustive::ExhaustiveOracle;
    use opal_ir::b;

    #[test]
    fn solver_bits_beat_local_propagation_under_conditions() {
        let mut store = TermStore::new();
        let x = store.var(8, "x").unwrap();
        let t = b(&mut store, x).and(0x0f).get();
        let cond = b(&mut store, x).eq(0x2c).get();
        let truth = store.true_val();
        let oracle = ExhaustiveOracle::default();

        let kb = known_bits_with_oracle(
            &mut store,
            &oracle,
            t,
            &[Mapping::new(cond, truth)],
            Timeout::default(),
        )
        .unwrap();
        // Under x == 0x2c the masked value is pinned to 0x0c.
        assert_eq!(kb.as_constant(), Some(BitVec::new(8, 0x0c)));
    }

    #[test]
    fn solver_bits_without_conditions_match_the_mask() {
        let mut store = TermStore::new();
        let x = store.var(8, "x").unwrap();
        let t = b(&mut store, x).or(0x80).get();
        let oracle = ExhaustiveOracle::default();
        let kb =
            known_bits_with_oracle(&mut store, &oracle, t, &[], Timeout::default()).unwrap();
        assert_eq!(kb.to_string(), "1???????");
    }

    #[test]
    fn solver_range_tightens_to_reachable_values() {
        let mut store = TermStore::new();
        let x = store.var(8, "x").unwrap();
        let t = b(&mut store, x).urem(10).add(5).get();
        let oracle = ExhaustiveOracle::default();
        let r = range_with_oracle(&mut store, &oracle, t, &[], Timeout::default()).unwrap();
        assert!(r.contains(BitVec::new(8, 5)));
        assert!(r.contains(BitVec::new(8, 14)));
        assert!(!r.contains(BitVec::new(8, 4)));
        assert!(!r.contains(BitVec::new(8, 15)));
    }
}
