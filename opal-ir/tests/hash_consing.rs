//! Property tests: structural hash-consing makes id equality semantic
//! equality, however a term is built.

use proptest::prelude::*;

use opal_ir::{Kind, TermId, TermStore};

const WIDTH: u32 = 8;

const BINARY: &[Kind] = &[
    Kind::Add,
    Kind::Sub,
    Kind::Mul,
    Kind::And,
    Kind::Or,
    Kind::Xor,
    Kind::Shl,
    Kind::LShr,
];

#[derive(Clone, Debug)]
enum Shape {
    X,
    Y,
    Const(u8),
    Bin(usize, Box<Shape>, Box<Shape>),
}

fn shape() -> impl Strategy<Value = Shape> {
    let leaf = prop_oneof![
        Just(Shape::X),
        Just(Shape::Y),
        any::<u8>().prop_map(Shape::Const),
    ];
    leaf.prop_recursive(4, 24, 2, |inner| {
        (0..BINARY.len(), inner.clone(), inner)
            .prop_map(|(op, a, b)| Shape::Bin(op, Box::new(a), Box::new(b)))
    })
}

fn build(store: &mut TermStore, shape: &Shape, flip_commutative: bool) -> TermId {
    match shape {
        Shape::X => store.var(WIDTH, "x").unwrap(),
        Shape::Y => store.var(WIDTH, "y").unwrap(),
        Shape::Const(c) => store.const_u128(WIDTH, *c as u128),
        Shape::Bin(op, a, b) => {
            let kind = BINARY[*op];
            let l = build(store, a, flip_commutative);
            let r = build(store, b, flip_commutative);
            let ops = if flip_commutative && kind.is_commutative() {
                vec![r, l]
            } else {
                vec![l, r]
            };
            store.intern(kind, WIDTH, ops).expect("same-width binary op")
        }
    }
}

proptest! {
    #[test]
    fn rebuilding_a_term_reaches_the_same_id(s in shape()) {
        let mut store = TermStore::new();
        let a = build(&mut store, &s, false);
        let len_after_first = store.len();
        let b = build(&mut store, &s, false);
        prop_assert_eq!(a, b);
        prop_assert_eq!(store.len(), len_after_first, "rebuild allocated new nodes");
    }

    #[test]
    fn commutative_operand_order_is_canonical(s in shape()) {
        let mut store = TermStore::new();
        let a = build(&mut store, &s, false);
        let b = build(&mut store, &s, true);
        prop_assert_eq!(a, b);
    }

    #[test]
    fn constants_are_unique_per_value_and_width(v in any::<u8>()) {
        let mut store = TermStore::new();
        let a = store.const_u128(WIDTH, v as u128);
        let b = store.const_u128(WIDTH, v as u128);
        let wider = store.const_u128(WIDTH * 2, v as u128);
        prop_assert_eq!(a, b);
        prop_assert_ne!(a, wider);
    }
}
