//! Differential properties between the two fact engines: the local
//! transfer-function walk and the oracle-backed probes must both cover every
//! concrete evaluation, and on targets that are defined somewhere the oracle
//! may only ever know more than local propagation, never contradict it.

use proptest::prelude::*;

use opal::{
    BitVec, ConcreteInterpreter, EvalValue, ExhaustiveOracle, Kind, TermId, TermStore, Timeout,
    ValueCache, const_range, known_bits, known_bits_with_oracle, range_with_oracle,
};

const WIDTH: u32 = 4;

const BINARY: &[Kind] = &[
    Kind::Add,
    Kind::Sub,
    Kind::Mul,
    Kind::And,
    Kind::Or,
    Kind::Xor,
    Kind::Shl,
    Kind::LShr,
    Kind::UDiv,
    Kind::URem,
];

#[derive(Clone, Debug)]
enum Shape {
    X,
    Const(u8),
    Bin(usize, Box<Shape>, Box<Shape>),
}

fn shape() -> impl Strategy<Value = Shape> {
    let leaf = prop_oneof![Just(Shape::X), (0u8..16).prop_map(Shape::Const)];
    leaf.prop_recursive(3, 12, 2, |inner| {
        (0..BINARY.len(), inner.clone(), inner)
            .prop_map(|(op, a, b)| Shape::Bin(op, Box::new(a), Box::new(b)))
    })
}

fn build(store: &mut TermStore, shape: &Shape, x: TermId) -> TermId {
    match shape {
        Shape::X => x,
        Shape::Const(c) => store.const_u128(WIDTH, *c as u128),
        Shape::Bin(op, a, b) => {
            let l = build(store, a, x);
            let r = build(store, b, x);
            store
                .intern(BINARY[*op], WIDTH, vec![l, r])
                .expect("same-width binary op")
        }
    }
}

fn eval_at(store: &TermStore, t: TermId, x: TermId, xv: u128) -> EvalValue {
    let mut cache = ValueCache::new();
    cache.insert(x, EvalValue::Val(BitVec::new(WIDTH, xv)));
    ConcreteInterpreter::with_cache(cache).evaluate(store, t)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn oracle_facts_refine_local_facts(s in shape()) {
        let mut store = TermStore::new();
        let x = store.var(WIDTH, "x").unwrap();
        let t = build(&mut store, &s, x);

        let mut unbound = ConcreteInterpreter::new();
        let local_bits = known_bits(&store, t, &mut unbound);
        let local_range = const_range(&store, t, &mut unbound);

        let oracle = ExhaustiveOracle::default();
        let oracle_bits =
            known_bits_with_oracle(&mut store, &oracle, t, &[], Timeout::default()).unwrap();
        let oracle_range =
            range_with_oracle(&mut store, &oracle, t, &[], Timeout::default()).unwrap();

        let mut defined_anywhere = false;
        for xv in 0..(1u128 << WIDTH) {
            if let EvalValue::Val(v) = eval_at(&store, t, x, xv) {
                defined_anywhere = true;
                prop_assert!(local_bits.contains(v), "local bits {local_bits} exclude {v}");
                prop_assert!(oracle_bits.contains(v), "oracle bits {oracle_bits} exclude {v}");
                prop_assert!(local_range.contains(v), "local range {local_range} excludes {v}");
                prop_assert!(
                    oracle_range.contains(v),
                    "oracle range {oracle_range} excludes {v}"
                );
            }
        }

        // On a nowhere-defined target every claim is vacuously sound and
        // the engines may disagree freely; otherwise the oracle subsumes
        // whatever local propagation proved.
        if defined_anywhere {
            prop_assert!(
                (local_bits.zeros() & !oracle_bits.zeros()).is_zero()
                    && (local_bits.ones() & !oracle_bits.ones()).is_zero(),
                "local {local_bits} knows a bit the oracle {oracle_bits} does not"
            );
        }
    }
}
