#![forbid(unsafe_code)]

use opal_ir::{Kind, Mapping, ParsedReplacement, TermStore};

use crate::oracle::{Counterexample, Oracle, OracleError, Timeout, VerifyResult};

/// Check a hole-free replacement against the oracle. Replacements still
/// carrying symbolic constants must go through constant synthesis first;
/// handing one in here is a caller error, not an `Unknown`.
pub fn verify(
    store: &mut TermStore,
    oracle: &dyn Oracle,
    rep: &ParsedReplacement,
    timeout: Timeout,
) -> Result<VerifyResult, OracleError> {
    if !rep.holes(store).is_empty() {
        return Err(OracleError::UnsolvedHoles);
    }
    oracle.check_equivalent(store, &rep.mapping(), &rep.pcs, &rep.bpcs, timeout)
}

/// One concrete input on which the replacement goes wrong, if the oracle can
/// produce one. `Valid` and `Unknown` both come back as `None`.
pub fn get_cex(
    store: &mut TermStore,
    oracle: &dyn Oracle,
    rep: &ParsedReplacement,
    timeout: Timeout,
) -> Result<Option<Counterexample>, OracleError> {
    match verify(store, oracle, rep, timeout)? {
        VerifyResult::Invalid(cex) => Ok(cex),
        VerifyResult::Valid | VerifyResult::Unknown => Ok(None),
    }
}

/// Up to `max_count` distinct counterexamples, found by re-querying with
/// each found input excluded through an extra path condition.
pub fn get_multiple_cex(
    store: &mut TermStore,
    oracle: &dyn Oracle,
    rep: &ParsedReplacement,
    max_count: usize,
    timeout: Timeout,
) -> Result<Vec<Counterexample>, OracleError> {
    let mut found: Vec<Counterexample> = Vec::new();
    let mut scoped = rep.clone();
    while found.len() < max_count {
        let Some(cex) = get_cex(store, oracle, &scoped, timeout)? else {
            break;
        };
        // A variable-free rule has one assignment; nothing left to exclude.
        if cex.values.is_empty() {
            found.push(cex);
            break;
        }
        scoped.pcs.push(exclusion_pc(store, &cex));
        found.push(cex);
    }
    Ok(found)
}

/// A path condition that is false exactly on the given assignment, so the
/// next query must find a different witness.
fn exclusion_pc(store: &mut TermStore, cex: &Counterexample) -> Mapping {
    let mut conj = None;
    for (&var, &value) in &cex.values {
        let c = store.const_val(value);
        let eq = store
            .intern(Kind::Eq, 1, vec![var, c])
            .expect("equality over matching widths");
        conj = Some(match conj {
            None => eq,
            Some(acc) => store
                .intern(Kind::And, 1, vec![acc, eq])
                .expect("1-bit conjunction"),
        });
    }
    let matched = conj.expect("a counterexample binds at least one variable");
    let f = store.false_val();
    Mapping::new(matched, f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exhaustive::ExhaustiveOracle;
    use opal_ir::b;

    #[test]
    fn holes_are_rejected_up_front() {
        let mut store = TermStore::new();
        let x = store.var(8, "x").unwrap();
        let c = store.hole(8);
        let lhs = b(&mut store, x).add(1).get();
        let rhs = b(&mut store, x).add(c).get();
        let rep = ParsedReplacement::new(Mapping::new(lhs, rhs));
        let oracle = ExhaustiveOracle::default();
        assert!(matches!(
            verify(&mut store, &oracle, &rep, Timeout::default()),
            Err(OracleError::UnsolvedHoles)
        ));
    }

    #[test]
    fn multiple_counterexamples_are_distinct() {
        let mut store = TermStore::new();
        let x = store.var(4, "x").unwrap();
        let lhs = b(&mut store, x).and(1).get();
        let rhs = b(&mut store, x).and(3).get();
        let rep = ParsedReplacement::new(Mapping::new(lhs, rhs));
        let oracle = ExhaustiveOracle::default();

        let cexs = get_multiple_cex(&mut store, &oracle, &rep, 3, Timeout::default()).unwrap();
        assert_eq!(cexs.len(), 3);
        for (i, a) in cexs.iter().enumerate() {
            for b_ in &cexs[i + 1..] {
                assert_ne!(a, b_);
            }
            // Each witness really separates the two sides.
            let v = a.values[&x];
            assert_ne!(v.raw() & 1, v.raw() & 3);
        }
    }

    #[test]
    fn valid_rules_yield_no_counterexample() {
        let mut store = TermStore::new();
        let x = store.var(8, "x").unwrap();
        let lhs = b(&mut store, x).xor(x).get();
        let rhs = store.const_u128(8, 0);
        let rep = ParsedReplacement::new(Mapping::new(lhs, rhs));
        let oracle = ExhaustiveOracle::default();
        assert!(
            get_cex(&mut store, &oracle, &rep, Timeout::default())
                .unwrap()
                .is_none()
        );
    }
}
