#![forbid(unsafe_code)]

use crate::bitvec::BitVec;
use crate::term::{Kind, TermError, TermId, TermStore};

/// Operand accepted by the builder: an existing term or an integer literal
/// that is interned at the current width.
pub enum Operand {
    Term(TermId),
    Lit(i128),
}

impl From<TermId> for Operand {
    fn from(id: TermId) -> Self {
        Operand::Term(id)
    }
}

// Exactly one integer impl, so bare literals infer to it.
impl From<i128> for Operand {
    fn from(v: i128) -> Self {
        Operand::Lit(v)
    }
}

/// Fluent construction of term DAGs for tests and the generalization passes.
///
/// Interning can only fail on a width contract violation, which for chained
/// construction is a caller bug; the builder therefore panics on `TermError`
/// instead of threading `Result` through every link of the chain.
pub struct Builder<'s> {
    store: &'s mut TermStore,
    cur: TermId,
}

pub fn b(store: &mut TermStore, root: impl Into<Operand>) -> Builder<'_> {
    let cur = match root.into() {
        Operand::Term(id) => id,
        Operand::Lit(_) => panic!("builder root must be a term; literals have no width yet"),
    };
    Builder { store, cur }
}

macro_rules! binop {
    ($name:ident, $kind:expr) => {
        pub fn $name(self, rhs: impl Into<Operand>) -> Self {
            self.binary($kind, rhs)
        }
    };
}

macro_rules! cmpop {
    ($name:ident, $kind:expr) => {
        pub fn $name(self, rhs: impl Into<Operand>) -> Self {
            self.compare($kind, rhs)
        }
    };
}

macro_rules! unop {
    ($name:ident, $kind:expr) => {
        pub fn $name(self) -> Self {
            self.unary($kind)
        }
    };
}

impl<'s> Builder<'s> {
    pub fn get(self) -> TermId {
        self.cur
    }

    fn operand(&mut self, op: impl Into<Operand>) -> TermId {
        match op.into() {
            Operand::Term(id) => id,
            Operand::Lit(v) => {
                let w = self.store.width(self.cur);
                self.store.const_val(BitVec::from_i128(w, v))
            }
        }
    }

    fn binary(mut self, kind: Kind, rhs: impl Into<Operand>) -> Self {
        let r = self.operand(rhs);
        let w = self.store.width(self.cur);
        self.cur = self
            .store
            .intern(kind, w, vec![self.cur, r])
            .unwrap_or_else(|e| builder_bug(e));
        self
    }

    fn compare(mut self, kind: Kind, rhs: impl Into<Operand>) -> Self {
        let r = self.operand(rhs);
        self.cur = self
            .store
            .intern(kind, 1, vec![self.cur, r])
            .unwrap_or_else(|e| builder_bug(e));
        self
    }

    fn unary(mut self, kind: Kind) -> Self {
        let w = self.store.width(self.cur);
        self.cur = self
            .store
            .intern(kind, w, vec![self.cur])
            .unwrap_or_else(|e| builder_bug(e));
        self
    }

    binop!(add, Kind::Add);
    binop!(add_nsw, Kind::AddNsw);
    binop!(add_nuw, Kind::AddNuw);
    binop!(sub, Kind::Sub);
    binop!(sub_nsw, Kind::SubNsw);
    binop!(mul, Kind::Mul);
    binop!(mul_nsw, Kind::MulNsw);
    binop!(and, Kind::And);
    binop!(or, Kind::Or);
    binop!(xor, Kind::Xor);
    binop!(shl, Kind::Shl);
    binop!(lshr, Kind::LShr);
    binop!(ashr, Kind::AShr);
    binop!(udiv, Kind::UDiv);
    binop!(sdiv, Kind::SDiv);
    binop!(urem, Kind::URem);
    binop!(srem, Kind::SRem);

    cmpop!(eq, Kind::Eq);
    cmpop!(ne, Kind::Ne);
    cmpop!(ult, Kind::Ult);
    cmpop!(slt, Kind::Slt);
    cmpop!(ule, Kind::Ule);
    cmpop!(sle, Kind::Sle);

    pub fn ugt(self, rhs: impl Into<Operand>) -> Self {
        let mut this = self;
        let r = this.operand(rhs);
        let l = this.cur;
        this.cur = this
            .store
            .intern(Kind::Ult, 1, vec![r, l])
            .unwrap_or_else(|e| builder_bug(e));
        this
    }

    unop!(ctpop, Kind::CtPop);
    unop!(bswap, Kind::BSwap);
    unop!(bit_reverse, Kind::BitReverse);
    unop!(cttz, Kind::Cttz);
    unop!(ctlz, Kind::Ctlz);
    unop!(log_b, Kind::LogB);
    unop!(bit_width, Kind::BitWidth);
    unop!(freeze, Kind::Freeze);

    /// Bitwise complement, spelled as xor with all-ones.
    pub fn flip(mut self) -> Self {
        let w = self.store.width(self.cur);
        let ones = self.store.const_val(BitVec::all_ones(w));
        self.cur = self
            .store
            .intern(Kind::Xor, w, vec![self.cur, ones])
            .unwrap_or_else(|e| builder_bug(e));
        self
    }

    /// Two's-complement negation, spelled as zero minus the value.
    pub fn negate(mut self) -> Self {
        let w = self.store.width(self.cur);
        let zero = self.store.const_val(BitVec::zero(w));
        self.cur = self
            .store
            .intern(Kind::Sub, w, vec![zero, self.cur])
            .unwrap_or_else(|e| builder_bug(e));
        self
    }

    pub fn zext(mut self, width: u32) -> Self {
        self.cur = self
            .store
            .intern(Kind::ZExt, width, vec![self.cur])
            .unwrap_or_else(|e| builder_bug(e));
        self
    }

    pub fn sext(mut self, width: u32) -> Self {
        self.cur = self
            .store
            .intern(Kind::SExt, width, vec![self.cur])
            .unwrap_or_else(|e| builder_bug(e));
        self
    }

    pub fn trunc(mut self, width: u32) -> Self {
        self.cur = self
            .store
            .intern(Kind::Trunc, width, vec![self.cur])
            .unwrap_or_else(|e| builder_bug(e));
        self
    }

    /// `self ? then : otherwise`; the current term must be 1 bit wide.
    pub fn select(mut self, then: TermId, otherwise: TermId) -> Self {
        let w = self.store.width(then);
        self.cur = self
            .store
            .intern(Kind::Select, w, vec![self.cur, then, otherwise])
            .unwrap_or_else(|e| builder_bug(e));
        self
    }
}

fn builder_bug(e: TermError) -> ! {
    panic!("builder produced an ill-formed term: {e}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chains_build_the_expected_dag() {
        let mut store = TermStore::new();
        let x = store.var(8, "x").unwrap();
        let t = b(&mut store, x).and(1).or(2).get();
        assert_eq!(store.kind(t), Kind::Or);
        assert_eq!(store.width(t), 8);

        let direct = {
            let one = store.const_u128(8, 1);
            let two = store.const_u128(8, 2);
            let a = store.intern(Kind::And, 8, vec![x, one]).unwrap();
            store.intern(Kind::Or, 8, vec![a, two]).unwrap()
        };
        assert_eq!(t, direct);
    }

    #[test]
    fn literals_intern_at_the_current_width() {
        let mut store = TermStore::new();
        let x = store.var(8, "x").unwrap();
        let t = b(&mut store, x).add(-1).get();
        let ops = store.ops(t).to_vec();
        let c = ops
            .iter()
            .find_map(|&o| store.const_value(o))
            .expect("one operand is the literal");
        assert!(c.is_all_ones());
    }

    #[test]
    fn comparisons_narrow_to_one_bit() {
        let mut store = TermStore::new();
        let x = store.var(8, "x").unwrap();
        let t = b(&mut store, x).eq(5).get();
        assert_eq!(store.width(t), 1);

        let gt = b(&mut store, x).ugt(3).get();
        assert_eq!(store.kind(gt), Kind::Ult);
    }

    #[test]
    fn flip_and_negate_spellings() {
        let mut store = TermStore::new();
        let x = store.var(8, "x").unwrap();
        let f = b(&mut store, x).flip().get();
        assert_eq!(store.kind(f), Kind::Xor);
        let n = b(&mut store, x).negate().get();
        assert_eq!(store.kind(n), Kind::Sub);
    }
}
