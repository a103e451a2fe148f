//! End-to-end runs of the synthesis pipeline against the exhaustive oracle:
//! enumerate, prune, verify (through constant synthesis where needed), then
//! generalize and shrink the accepted rule.

use opal::{
    BitVec, ConstSynthResult, ConstantSynthesisOptions, ExhaustiveOracle, Kind, Mapping,
    ParsedReplacement, SynthesisContext, SynthesisOptions, TermStore, Timeout, VarFacts,
    VerifyResult, b, cost, find_one_const_set, generalize, print_replacement, profit, reduce,
    shrink, synthesize, verify,
};

#[test]
fn synthesizes_the_minimal_mask_rewrite() {
    // (x & 1) | (x & 2) at width 8 must come back as x & 3, and the oracle
    // must confirm the rule.
    let mut store = TermStore::new();
    let x = store.var(8, "x").unwrap();
    let lhs = {
        let a = b(&mut store, x).and(1).get();
        let c = b(&mut store, x).and(2).get();
        store.intern(Kind::Or, 8, vec![a, c]).unwrap()
    };
    let oracle = ExhaustiveOracle::default();
    let ctx = SynthesisContext::new(&store, lhs, &oracle);
    let report = synthesize(&mut store, &ctx, &SynthesisOptions::default()).unwrap();

    let best = report.best().expect("a replacement exists").clone();
    let expected = b(&mut store, x).and(3).get();
    assert_eq!(best.mapping().rhs, expected);
    assert_eq!(
        verify(&mut store, &oracle, &best, Timeout::default()).unwrap(),
        VerifyResult::Valid
    );
    // Locally minimal under the cost metric: one op against the target's
    // three.
    assert_eq!(cost(&store, best.mapping().rhs), 1);
    assert_eq!(profit(&store, &best), 2);
    assert!(report.stats.pruned > 0);
    assert!(report.stats.total_guesses > report.stats.pruned);
}

#[test]
fn constant_synthesis_solves_the_pinned_offset() {
    // Target value 7 for x +nsw C under the path condition x == 5: the only
    // solution is C = 7 - 5.
    let mut store = TermStore::new();
    let x = store.var(8, "x").unwrap();
    let c = store.hole(8);
    let lhs = store.const_u128(8, 7);
    let rhs = b(&mut store, x).add_nsw(c).get();
    let cond = b(&mut store, x).eq(5).get();
    let t = store.true_val();
    let rep = ParsedReplacement::with_pcs(Mapping::new(lhs, rhs), vec![Mapping::new(cond, t)]);

    let oracle = ExhaustiveOracle::default();
    let mut ctx = SynthesisContext::new(&store, lhs, &oracle);
    ctx.pcs = rep.pcs.clone();
    let result = find_one_const_set(&mut store, &ctx, &rep, &ConstantSynthesisOptions::default())
        .unwrap();
    let ConstSynthResult::Consts(consts) = result else {
        panic!("expected constants, got {result:?}");
    };
    assert_eq!(consts[&c], BitVec::new(8, 2));

    // With an unsatisfiable shape the same loop proves infeasibility.
    let rhs2 = b(&mut store, x).mul(c).and(0).get();
    let rep2 =
        ParsedReplacement::with_pcs(Mapping::new(lhs, rhs2), rep.pcs.clone());
    let result2 =
        find_one_const_set(&mut store, &ctx, &rep2, &ConstantSynthesisOptions::default())
            .unwrap();
    assert_eq!(result2, ConstSynthResult::NoConsts);
}

#[test]
fn synthesized_rules_generalize_and_reduce() {
    // Synthesize under a narrowing annotation, then strip what the oracle
    // shows was never needed.
    let mut store = TermStore::new();
    let mut facts = VarFacts::none(8);
    facts.non_zero = true;
    let x = store.var_with_facts(8, "x", facts).unwrap();
    let lhs = {
        let a = b(&mut store, x).and(1).get();
        let c = b(&mut store, x).and(2).get();
        store.intern(Kind::Or, 8, vec![a, c]).unwrap()
    };
    let oracle = ExhaustiveOracle::default();
    let ctx = SynthesisContext::new(&store, lhs, &oracle);
    let report = synthesize(&mut store, &ctx, &SynthesisOptions::default()).unwrap();
    let found = report.best().expect("a replacement exists").clone();

    // Reduction drops the non-zero annotation: the rule never needed it.
    let reduced = reduce(&mut store, &oracle, &found, Timeout::default()).unwrap();
    for var in reduced.free_vars(&store) {
        assert!(store.get(var).facts.as_ref().unwrap().is_none());
    }
    assert_eq!(
        verify(&mut store, &oracle, &reduced, Timeout::default()).unwrap(),
        VerifyResult::Valid
    );

    // Generalization lifts the mask constants and still finds a witness.
    let out = generalize(
        &mut store,
        &oracle,
        &reduced,
        &ConstantSynthesisOptions::default(),
    )
    .unwrap();
    let concrete = out.rep.replace_consts(&mut store, &out.witnesses);
    assert_eq!(
        verify(&mut store, &oracle, &concrete, Timeout::default()).unwrap(),
        VerifyResult::Valid
    );
}

#[test]
fn accepted_rules_print_in_listing_form() {
    let mut store = TermStore::new();
    let x = store.var(8, "x").unwrap();
    let lhs = {
        let a = b(&mut store, x).and(1).get();
        let c = b(&mut store, x).and(2).get();
        store.intern(Kind::Or, 8, vec![a, c]).unwrap()
    };
    let oracle = ExhaustiveOracle::default();
    let ctx = SynthesisContext::new(&store, lhs, &oracle);
    let report = synthesize(&mut store, &ctx, &SynthesisOptions::default()).unwrap();
    let best = report.best().expect("a replacement exists").clone();

    let text = print_replacement(&store, &best);
    assert!(text.contains("%x:i8 = var"), "{text}");
    assert!(text.contains("= or"), "{text}");
    assert!(text.lines().last().unwrap().contains("=>"), "{text}");
}

#[test]
fn shrinking_reduces_a_reproducer_to_its_core() {
    // A bulky but valid example: ((x * y) ^ (x * y)) | (x & 5) => x & 5.
    let mut store = TermStore::new();
    let x = store.var(4, "x").unwrap();
    let y = store.var(4, "y").unwrap();
    let prod = b(&mut store, x).mul(y).get();
    let zeroed = b(&mut store, prod).xor(prod).get();
    let masked = b(&mut store, x).and(5).get();
    let lhs = store.intern(Kind::Or, 4, vec![zeroed, masked]).unwrap();
    let rep = ParsedReplacement::new(Mapping::new(lhs, masked));

    let oracle = ExhaustiveOracle::default();
    assert_eq!(
        verify(&mut store, &oracle, &rep, Timeout::default()).unwrap(),
        VerifyResult::Valid
    );

    let small = shrink(&mut store, &oracle, &rep, 2, Timeout::default()).unwrap();
    assert!(cost(&store, small.lhs) <= 2);
    assert_eq!(
        verify(&mut store, &oracle, &small, Timeout::default()).unwrap(),
        VerifyResult::Valid
    );
    // The expensive multiply cannot survive minimization at that bound.
    assert!(!opal::contains_kind(&store, small.lhs, Kind::Mul));
}

#[test]
fn unknown_oracle_answers_do_not_masquerade_as_failures() {
    // A 64-bit query is far past the exhaustive budget; the pipeline must
    // report exhaustion rather than inventing a verdict.
    let mut store = TermStore::new();
    let x = store.var(64, "x").unwrap();
    let lhs = {
        let a = b(&mut store, x).and(1).get();
        let c = b(&mut store, x).and(2).get();
        store.intern(Kind::Or, 64, vec![a, c]).unwrap()
    };
    let oracle = ExhaustiveOracle::new(16);
    let ctx = SynthesisContext::new(&store, lhs, &oracle);
    let opts = SynthesisOptions {
        max_guesses: 200,
        ..SynthesisOptions::default()
    };
    let report = synthesize(&mut store, &ctx, &opts).unwrap();
    assert!(matches!(
        report.outcome,
        opal::SynthesisOutcome::NoCandidate
    ));
}
