#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use log::debug;

use opal_ir::{
    Kind, KnownBits, ParsedReplacement, TermId, TermStore, VarFacts, ConstRange, cost, free_vars,
    postorder,
};
use opal_verify::{ConstMap, Oracle, OracleError, Timeout, VerifyResult, verify};

use crate::cegis::{ConstSynthResult, ConstantSynthesisOptions, find_one_const_set};
use crate::context::SynthesisContext;

fn is_valid(
    store: &mut TermStore,
    oracle: &dyn Oracle,
    rep: &ParsedReplacement,
    timeout: Timeout,
) -> Result<bool, OracleError> {
    Ok(matches!(
        verify(store, oracle, rep, timeout)?,
        VerifyResult::Valid
    ))
}

/// Strip unnecessary constraints off a verified rule: drop each path
/// condition, then each variable annotation, keeping a change only when the
/// oracle re-confirms the strictly more general rule. Runs to a fixed
/// point; confluent but not guaranteed globally minimal.
pub fn reduce(
    store: &mut TermStore,
    oracle: &dyn Oracle,
    rep: &ParsedReplacement,
    timeout: Timeout,
) -> Result<ParsedReplacement, OracleError> {
    let mut cur = rep.clone();
    loop {
        let mut changed = false;

        let mut i = 0;
        while i < cur.pcs.len() {
            let mut trial = cur.clone();
            trial.pcs.remove(i);
            if is_valid(store, oracle, &trial, timeout)? {
                cur = trial;
                changed = true;
            } else {
                i += 1;
            }
        }
        let mut i = 0;
        while i < cur.bpcs.len() {
            let mut trial = cur.clone();
            trial.bpcs.remove(i);
            if is_valid(store, oracle, &trial, timeout)? {
                cur = trial;
                changed = true;
            } else {
                i += 1;
            }
        }

        for var in cur.free_vars(store) {
            let data = store.get(var);
            let Some(facts) = data.facts.clone() else {
                continue;
            };
            if facts.is_none() {
                continue;
            }
            let width = data.width;
            let name = data.name.clone().expect("var carries a name");
            for weakened in fact_weakenings(&facts, width) {
                let relaxed = store
                    .var_with_facts(width, &name, weakened)
                    .expect("width already validated");
                let mut map = BTreeMap::new();
                map.insert(var, relaxed);
                let trial = cur.replace_terms(store, &map);
                if is_valid(store, oracle, &trial, timeout)? {
                    cur = trial;
                    changed = true;
                    break;
                }
            }
        }

        if !changed {
            return Ok(cur);
        }
    }
}

/// Candidate relaxations each dropping exactly one annotation.
fn fact_weakenings(facts: &VarFacts, width: u32) -> Vec<VarFacts> {
    let mut out = Vec::new();
    let mut relax = |f: fn(&mut VarFacts, u32)| {
        let mut w = facts.clone();
        f(&mut w, width);
        if &w != facts {
            out.push(w);
        }
    };
    relax(|f, w| f.known = KnownBits::top(w));
    relax(|f, w| f.range = ConstRange::full(w));
    relax(|f, _| f.non_zero = false);
    relax(|f, _| f.non_negative = false);
    relax(|f, _| f.negative = false);
    relax(|f, _| f.power_of_two = false);
    relax(|f, _| f.num_sign_bits = 1);
    relax(|f, w| f.demanded = opal_ir::BitVec::all_ones(w));
    out
}

/// Relax poison and exactness flags: rewrite each flagged opcode in the rule
/// to its plain counterpart wherever validity survives. Dropping a flag on
/// the left widens where the rule applies; dropping one on the right widens
/// where the replacement is defined. Both directions only ever generalize.
pub fn reduce_poison(
    store: &mut TermStore,
    oracle: &dyn Oracle,
    rep: &ParsedReplacement,
    timeout: Timeout,
) -> Result<ParsedReplacement, OracleError> {
    let mut cur = rep.clone();
    loop {
        let mut changed = false;
        let flagged: Vec<TermId> = postorder(store, &cur.roots())
            .into_iter()
            .filter(|&id| store.kind(id).has_flag())
            .collect();
        for id in flagged {
            let data = store.get(id);
            let plain_kind = data.kind.strip_flags();
            let (width, ops) = (data.width, data.ops.clone());
            let plain = store
                .intern(plain_kind, width, ops)
                .expect("flag stripping preserves the shape");
            let mut map = BTreeMap::new();
            map.insert(id, plain);
            let trial = cur.replace_terms(store, &map);
            if is_valid(store, oracle, &trial, timeout)? {
                cur = trial;
                changed = true;
                break;
            }
        }
        if !changed {
            return Ok(cur);
        }
    }
}

/// A rule lifted to symbolic constants, with one concrete assignment
/// witnessing that the lifted form is satisfiable.
#[derive(Clone, Debug)]
pub struct Generalized {
    pub rep: ParsedReplacement,
    pub witnesses: ConstMap,
}

/// Lift concrete constants to symbolic ones, one at a time and cumulatively,
/// keeping each lift whose hole still admits a verified assignment. The
/// result is the most-lifted rule that stayed satisfiable, plus the witness
/// assignment for its holes.
pub fn generalize(
    store: &mut TermStore,
    oracle: &dyn Oracle,
    rep: &ParsedReplacement,
    cegis: &ConstantSynthesisOptions,
) -> Result<Generalized, OracleError> {
    let ctx = SynthesisContext::new(store, rep.lhs, oracle);
    let mut cur = rep.clone();
    let mut witnesses = ConstMap::new();

    for target in liftable_constants(store, &cur) {
        let width = store.width(target);
        let hole = store.hole(width);
        let mut map = BTreeMap::new();
        map.insert(target, hole);
        let trial = cur.replace_terms(store, &map);
        match find_one_const_set(store, &ctx, &trial, cegis)? {
            ConstSynthResult::Consts(consts) => {
                debug!(
                    "lifted constant {} to a symbolic hole",
                    store
                        .const_value(target)
                        .expect("liftable targets are constants"),
                );
                cur = trial;
                witnesses = consts;
            }
            ConstSynthResult::NoConsts | ConstSynthResult::Unknown => {}
        }
    }
    Ok(Generalized {
        rep: cur,
        witnesses,
    })
}

/// Constants under the mapping that may become holes: everything except
/// structural indices and the boolean anchors of path conditions.
fn liftable_constants(store: &TermStore, rep: &ParsedReplacement) -> Vec<TermId> {
    let mut roots = vec![rep.lhs];
    if let Some(rhs) = rep.rhs {
        roots.push(rhs);
    }
    let order = postorder(store, &roots);
    let mut protected: BTreeSet<TermId> = BTreeSet::new();
    for &id in &order {
        if store.kind(id) == Kind::ExtractValue {
            protected.insert(store.ops(id)[1]);
        }
    }
    for pc in &rep.pcs {
        protected.insert(pc.rhs);
    }
    for bpc in &rep.bpcs {
        protected.insert(bpc.pc.rhs);
    }
    order
        .into_iter()
        .filter(|&id| store.kind(id) == Kind::Const && !protected.contains(&id))
        .collect()
}

/// Delta-debugging on the example itself: replace left-hand substructure by
/// a fresh variable, by one of its own operands, or by zero, and drop
/// conditions stranded by disappearing variables, re-verifying each step,
/// until the size bound or a fixed point. Minimizes the reproducing
/// instance, not the rule.
pub fn shrink(
    store: &mut TermStore,
    oracle: &dyn Oracle,
    rep: &ParsedReplacement,
    target_cost: u32,
    timeout: Timeout,
) -> Result<ParsedReplacement, OracleError> {
    let mut cur = rep.clone();
    while cost(store, cur.lhs) > target_cost {
        let mut nodes: Vec<TermId> = postorder(store, &[cur.lhs])
            .into_iter()
            .filter(|&id| id != cur.lhs && !store.ops(id).is_empty())
            .collect();
        nodes.sort_by_key(|&id| std::cmp::Reverse(cost(store, id)));

        let mut stepped = false;
        'nodes: for id in nodes {
            let width = store.width(id);
            let mut alternatives = vec![store.fresh_var(width)];
            alternatives.extend(
                store
                    .ops(id)
                    .iter()
                    .copied()
                    .filter(|&op| store.width(op) == width),
            );
            alternatives.push(store.const_val(opal_ir::BitVec::zero(width)));

            for alt in alternatives {
                let mut map = BTreeMap::new();
                map.insert(id, alt);
                let trial = cur.replace_terms(store, &map);
                if cost(store, trial.lhs) < cost(store, cur.lhs)
                    && is_valid(store, oracle, &trial, timeout)?
                {
                    cur = drop_stranded_pcs(store, oracle, trial, timeout)?;
                    stepped = true;
                    break 'nodes;
                }
            }
        }
        if !stepped {
            break;
        }
    }
    Ok(cur)
}

/// Try to drop path conditions that mention variables the mapping no longer
/// uses; each drop must re-verify.
fn drop_stranded_pcs(
    store: &mut TermStore,
    oracle: &dyn Oracle,
    rep: ParsedReplacement,
    timeout: Timeout,
) -> Result<ParsedReplacement, OracleError> {
    let mut cur = rep;
    let mapping = cur.mapping();
    let mut used: BTreeSet<TermId> = free_vars(store, mapping.lhs).into_iter().collect();
    used.extend(free_vars(store, mapping.rhs));

    let mut i = 0;
    while i < cur.pcs.len() {
        let pc = cur.pcs[i];
        let stranded = free_vars(store, pc.lhs)
            .into_iter()
            .chain(free_vars(store, pc.rhs))
            .any(|v| !used.contains(&v));
        if stranded {
            let mut trial = cur.clone();
            trial.pcs.remove(i);
            if is_valid(store, oracle, &trial, timeout)? {
                cur = trial;
                continue;
            }
        }
        i += 1;
    }
    Ok(cur)
}

#[cfg(test)]
mod tests {
    use super::*;
    use opal_ir::{Mapping, b};
    use opal_verify::ExhaustiveOracle;

    fn t(store: &mut TermStore) -> TermId {
        store.true_val()
    }

    #[test]
    fn reduce_drops_superfluous_conditions_and_facts() {
        let mut store = TermStore::new();
        let mut facts = VarFacts::none(8);
        facts.non_zero = true;
        let x = store.var_with_facts(8, "x", facts).unwrap();
        let lhs = {
            let a = b(&mut store, x).and(1).get();
            let c = b(&mut store, x).and(2).get();
            store.intern(Kind::Or, 8, vec![a, c]).unwrap()
        };
        let rhs = b(&mut store, x).and(3).get();
        let cond = b(&mut store, x).ult(9).get();
        let tv = t(&mut store);
        let rep =
            ParsedReplacement::with_pcs(Mapping::new(lhs, rhs), vec![Mapping::new(cond, tv)]);

        let oracle = ExhaustiveOracle::default();
        let reduced = reduce(&mut store, &oracle, &rep, Timeout::default()).unwrap();
        assert!(reduced.pcs.is_empty());
        for var in reduced.free_vars(&store) {
            assert!(store.get(var).facts.as_ref().unwrap().is_none());
        }
        // The reduced rule is still oracle-valid.
        assert!(is_valid(&mut store, &oracle, &reduced, Timeout::default()).unwrap());
    }

    #[test]
    fn reduce_keeps_load_bearing_conditions() {
        let mut store = TermStore::new();
        let x = store.var(8, "x").unwrap();
        let lhs = b(&mut store, x).add(1).get();
        let rhs = store.const_u128(8, 6);
        let cond = b(&mut store, x).eq(5).get();
        let tv = t(&mut store);
        let rep =
            ParsedReplacement::with_pcs(Mapping::new(lhs, rhs), vec![Mapping::new(cond, tv)]);
        let oracle = ExhaustiveOracle::default();
        let reduced = reduce(&mut store, &oracle, &rep, Timeout::default()).unwrap();
        assert_eq!(reduced.pcs.len(), 1);
    }

    #[test]
    fn reduce_poison_strips_removable_flags_only() {
        let mut store = TermStore::new();
        let x = store.var(8, "x").unwrap();
        let oracle = ExhaustiveOracle::default();

        // (x +nsw 0) => x survives without the flag.
        let lhs = b(&mut store, x).add_nsw(0).get();
        let rep = ParsedReplacement::new(Mapping::new(lhs, x));
        let relaxed = reduce_poison(&mut store, &oracle, &rep, Timeout::default()).unwrap();
        assert_eq!(store.kind(relaxed.lhs), Kind::Add);

        // x <=s x +nsw 1 holds only because the flag rules out overflow.
        let bumped = b(&mut store, x).add_nsw(1).get();
        let claim = store.intern(Kind::Sle, 1, vec![x, bumped]).unwrap();
        let tv = t(&mut store);
        let rep = ParsedReplacement::new(Mapping::new(claim, tv));
        assert!(is_valid(&mut store, &oracle, &rep, Timeout::default()).unwrap());
        let kept = reduce_poison(&mut store, &oracle, &rep, Timeout::default()).unwrap();
        assert!(
            postorder(&store, &kept.roots())
                .iter()
                .any(|&id| store.kind(id) == Kind::AddNsw)
        );
    }

    #[test]
    fn generalize_lifts_constants_to_holes() {
        let mut store = TermStore::new();
        let x = store.var(8, "x").unwrap();
        let lhs = b(&mut store, x).shl(1).get();
        let rhs = b(&mut store, x).mul(2).get();
        let rep = ParsedReplacement::new(Mapping::new(lhs, rhs));
        let oracle = ExhaustiveOracle::default();

        let out = generalize(
            &mut store,
            &oracle,
            &rep,
            &ConstantSynthesisOptions::default(),
        )
        .unwrap();
        let lifted = out.rep.holes(&store);
        assert_eq!(lifted.len(), 2);
        // The witness assignment instantiates back to a valid rule.
        let concrete = out.rep.replace_consts(&mut store, &out.witnesses);
        assert!(is_valid(&mut store, &oracle, &concrete, Timeout::default()).unwrap());
    }

    #[test]
    fn shared_constants_lift_together() {
        // Hash-consing makes every use of 1:i4 the same node, so one lift
        // rewrites all three occurrences to the same hole.
        let mut store = TermStore::new();
        let x = store.var(4, "x").unwrap();
        let lhs = b(&mut store, x).or(1).and(1).get();
        let rhs = store.const_u128(4, 1);
        let rep = ParsedReplacement::new(Mapping::new(lhs, rhs));
        let oracle = ExhaustiveOracle::default();
        let out = generalize(
            &mut store,
            &oracle,
            &rep,
            &ConstantSynthesisOptions::default(),
        )
        .unwrap();
        let concrete = out.rep.replace_consts(&mut store, &out.witnesses);
        assert!(is_valid(&mut store, &oracle, &concrete, Timeout::default()).unwrap());
    }

    #[test]
    fn shrink_minimizes_the_example() {
        let mut store = TermStore::new();
        let x = store.var(4, "x").unwrap();
        let y = store.var(4, "y").unwrap();
        // ((x * y) & 0) => 0, with a condition on x that carries no weight.
        let lhs = b(&mut store, x).mul(y).and(0).get();
        let rhs = store.const_u128(4, 0);
        let cond = b(&mut store, x).eq(3).get();
        let tv = t(&mut store);
        let rep =
            ParsedReplacement::with_pcs(Mapping::new(lhs, rhs), vec![Mapping::new(cond, tv)]);
        let oracle = ExhaustiveOracle::default();

        let small = shrink(&mut store, &oracle, &rep, 1, Timeout::default()).unwrap();
        assert!(cost(&store, small.lhs) <= 1);
        assert!(small.pcs.is_empty());
        assert!(is_valid(&mut store, &oracle, &small, Timeout::default()).unwrap());
        // The multiplication is gone; a fresh variable stands in.
        assert!(
            !postorder(&store, &[small.lhs])
                .iter()
                .any(|&id| store.kind(id) == Kind::Mul)
        );
    }
}
