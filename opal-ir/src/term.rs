#![forbid(unsafe_code)]

use std::collections::HashMap;

use miette::Diagnostic;
use thiserror::Error;

use crate::bitvec::{BitVec, MAX_WIDTH};
use crate::facts::{ConstRange, KnownBits};

/// Opaque handle to a node in the hash-consed term DAG. Equal ids mean
/// structurally (and semantically) equal terms within one store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TermId(pub u32);

/// Operation tag of a term node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Kind {
    // Leaves.
    Const,
    /// A symbolic constant to be solved for during constant synthesis.
    Hole,
    Var,
    /// Merge of incoming values; only the degenerate single-incoming form
    /// is evaluable by the core.
    Phi,

    Add,
    AddNsw,
    AddNuw,
    AddNw,
    Sub,
    SubNsw,
    SubNuw,
    SubNw,
    Mul,
    MulNsw,
    MulNuw,
    MulNw,

    UDiv,
    SDiv,
    UDivExact,
    SDivExact,
    URem,
    SRem,

    And,
    Or,
    Xor,

    Shl,
    ShlNsw,
    ShlNuw,
    ShlNw,
    LShr,
    LShrExact,
    AShr,
    AShrExact,

    Select,

    ZExt,
    SExt,
    Trunc,

    Eq,
    Ne,
    Ult,
    Slt,
    Ule,
    Sle,

    CtPop,
    BSwap,
    BitReverse,
    Cttz,
    Ctlz,
    /// Position of the most significant set bit.
    LogB,
    /// The operand's bit width as a value.
    BitWidth,

    FShl,
    FShr,

    SAddWithOverflow,
    SAddO,
    UAddWithOverflow,
    UAddO,
    SSubWithOverflow,
    SSubO,
    USubWithOverflow,
    USubO,
    SMulWithOverflow,
    SMulO,
    UMulWithOverflow,
    UMulO,

    SAddSat,
    UAddSat,
    SSubSat,
    USubSat,

    /// Field selection out of an overflow-reporting aggregate.
    ExtractValue,
    Freeze,

    /// Derived-fact predicate: all mask bits are one in the operand.
    KnownOnesP,
    /// Derived-fact predicate: all mask bits are zero in the operand.
    KnownZerosP,
}

impl Kind {
    /// Fixed operand count; `None` for the variadic `Phi`.
    pub fn arity(self) -> Option<usize> {
        use Kind::*;
        Some(match self {
            Const | Hole | Var => 0,
            Phi => return None,
            CtPop | BSwap | BitReverse | Cttz | Ctlz | LogB | BitWidth | ZExt | SExt | Trunc
            | Freeze => 1,
            Select | FShl | FShr => 3,
            _ => 2,
        })
    }

    pub fn is_commutative(self) -> bool {
        use Kind::*;
        matches!(
            self,
            Add | AddNsw
                | AddNuw
                | AddNw
                | Mul
                | MulNsw
                | MulNuw
                | MulNw
                | And
                | Or
                | Xor
                | Eq
                | Ne
                | SAddWithOverflow
                | SAddO
                | UAddWithOverflow
                | UAddO
                | SMulWithOverflow
                | SMulO
                | UMulWithOverflow
                | UMulO
                | SAddSat
                | UAddSat
        )
    }

    /// Produces a width-1 truth value.
    pub fn is_predicate(self) -> bool {
        use Kind::*;
        matches!(
            self,
            Eq | Ne
                | Ult
                | Slt
                | Ule
                | Sle
                | SAddO
                | UAddO
                | SSubO
                | USubO
                | SMulO
                | UMulO
                | KnownOnesP
                | KnownZerosP
        )
    }

    /// Carries an nsw/nuw/exact refinement over a plain opcode.
    pub fn has_flag(self) -> bool {
        self != self.strip_flags()
    }

    /// The flag-free counterpart of a flagged opcode.
    pub fn strip_flags(self) -> Kind {
        use Kind::*;
        match self {
            AddNsw | AddNuw | AddNw => Add,
            SubNsw | SubNuw | SubNw => Sub,
            MulNsw | MulNuw | MulNw => Mul,
            UDivExact => UDiv,
            SDivExact => SDiv,
            ShlNsw | ShlNuw | ShlNw => Shl,
            LShrExact => LShr,
            AShrExact => AShr,
            other => other,
        }
    }

    /// Estimated execution cost, used to order synthesis candidates and to
    /// score replacements.
    pub fn cost(self) -> u32 {
        use Kind::*;
        match self {
            Const | Hole | Var | Phi => 0,
            Mul | MulNsw | MulNuw | MulNw | SMulWithOverflow | SMulO | UMulWithOverflow
            | UMulO => 4,
            UDiv | SDiv | UDivExact | SDivExact | URem | SRem => 8,
            CtPop | BSwap | BitReverse | Cttz | Ctlz | LogB => 2,
            _ => 1,
        }
    }

    pub fn name(self) -> &'static str {
        use Kind::*;
        match self {
            Const => "const",
            Hole => "reservedconst",
            Var => "var",
            Phi => "phi",
            Add => "add",
            AddNsw => "addnsw",
            AddNuw => "addnuw",
            AddNw => "addnw",
            Sub => "sub",
            SubNsw => "subnsw",
            SubNuw => "subnuw",
            SubNw => "subnw",
            Mul => "mul",
            MulNsw => "mulnsw",
            MulNuw => "mulnuw",
            MulNw => "mulnw",
            UDiv => "udiv",
            SDiv => "sdiv",
            UDivExact => "udivexact",
            SDivExact => "sdivexact",
            URem => "urem",
            SRem => "srem",
            And => "and",
            Or => "or",
            Xor => "xor",
            Shl => "shl",
            ShlNsw => "shlnsw",
            ShlNuw => "shlnuw",
            ShlNw => "shlnw",
            LShr => "lshr",
            LShrExact => "lshrexact",
            AShr => "ashr",
            AShrExact => "ashrexact",
            Select => "select",
            ZExt => "zext",
            SExt => "sext",
            Trunc => "trunc",
            Eq => "eq",
            Ne => "ne",
            Ult => "ult",
            Slt => "slt",
            Ule => "ule",
            Sle => "sle",
            CtPop => "ctpop",
            BSwap => "bswap",
            BitReverse => "bitreverse",
            Cttz => "cttz",
            Ctlz => "ctlz",
            LogB => "logb",
            BitWidth => "bitwidth",
            FShl => "fshl",
            FShr => "fshr",
            SAddWithOverflow => "sadd.with.overflow",
            SAddO => "sadd.overflow",
            UAddWithOverflow => "uadd.with.overflow",
            UAddO => "uadd.overflow",
            SSubWithOverflow => "ssub.with.overflow",
            SSubO => "ssub.overflow",
            USubWithOverflow => "usub.with.overflow",
            USubO => "usub.overflow",
            SMulWithOverflow => "smul.with.overflow",
            SMulO => "smul.overflow",
            UMulWithOverflow => "umul.with.overflow",
            UMulO => "umul.overflow",
            SAddSat => "sadd.sat",
            UAddSat => "uadd.sat",
            SSubSat => "ssub.sat",
            USubSat => "usub.sat",
            ExtractValue => "extractvalue",
            Freeze => "freeze",
            KnownOnesP => "kop",
            KnownZerosP => "kzp",
        }
    }
}

/// Derived facts attached to a variable. Part of the variable's identity:
/// two variables with the same name but different facts are different terms.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct VarFacts {
    pub known: KnownBits,
    pub range: ConstRange,
    pub non_zero: bool,
    pub non_negative: bool,
    pub negative: bool,
    pub power_of_two: bool,
    pub num_sign_bits: u32,
    /// Bits of the value the surrounding context observes.
    pub demanded: BitVec,
}

impl VarFacts {
    pub fn none(width: u32) -> Self {
        Self {
            known: KnownBits::top(width),
            range: ConstRange::full(width),
            non_zero: false,
            non_negative: false,
            negative: false,
            power_of_two: false,
            num_sign_bits: 1,
            demanded: BitVec::all_ones(width),
        }
    }

    pub fn is_none(&self) -> bool {
        self == &Self::none(self.known.width())
    }
}

impl std::fmt::Debug for VarFacts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut d = f.debug_struct("VarFacts");
        if !self.known.is_top() {
            d.field("known", &self.known);
        }
        if !self.range.is_full() {
            d.field("range", &self.range);
        }
        if self.non_zero {
            d.field("non_zero", &true);
        }
        if self.non_negative {
            d.field("non_negative", &true);
        }
        if self.negative {
            d.field("negative", &true);
        }
        if self.power_of_two {
            d.field("power_of_two", &true);
        }
        if self.num_sign_bits > 1 {
            d.field("num_sign_bits", &self.num_sign_bits);
        }
        if !self.demanded.is_all_ones() {
            d.field("demanded", &self.demanded);
        }
        d.finish()
    }
}

/// One immutable node of the instruction DAG.
#[derive(Clone, Debug)]
pub struct TermData {
    pub kind: Kind,
    pub width: u32,
    pub ops: Vec<TermId>,
    /// Payload of a `Const` node.
    pub value: Option<BitVec>,
    /// Name of a `Var` or `Hole` node.
    pub name: Option<String>,
    /// Derived facts of a `Var` node.
    pub facts: Option<VarFacts>,
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct TermKey {
    kind: Kind,
    width: u32,
    ops: Vec<TermId>,
    value: Option<BitVec>,
    name: Option<String>,
    facts: Option<VarFacts>,
}

#[derive(Debug, Error, Diagnostic)]
pub enum TermError {
    #[error("{kind:?} takes {expected} operand(s), got {got}")]
    #[diagnostic(code(opal::ir::arity))]
    Arity {
        kind: Kind,
        expected: usize,
        got: usize,
    },

    #[error("width {width} is outside 1..={max}", max = MAX_WIDTH)]
    #[diagnostic(code(opal::ir::width))]
    BadWidth { width: u32 },

    #[error("{kind:?} at width {width}: operand widths {op_widths:?} violate the opcode contract")]
    #[diagnostic(code(opal::ir::width_mismatch))]
    WidthMismatch {
        kind: Kind,
        width: u32,
        op_widths: Vec<u32>,
    },

    #[error("{kind:?} result must be 1 bit wide, got {width}")]
    #[diagnostic(code(opal::ir::predicate_width))]
    PredicateWidth { kind: Kind, width: u32 },

    #[error("leaf kind {kind:?} cannot be built by intern; use the dedicated constructor")]
    #[diagnostic(code(opal::ir::leaf))]
    LeafViaIntern { kind: Kind },

    #[error("extractvalue index must be the constant 0 or 1")]
    #[diagnostic(code(opal::ir::extract_index))]
    BadExtractIndex,

    #[error("bswap requires a width that is a multiple of 8, got {width}")]
    #[diagnostic(code(opal::ir::bswap_width))]
    BadSwapWidth { width: u32 },

    #[error("phi needs at least one incoming value")]
    #[diagnostic(code(opal::ir::empty_phi))]
    EmptyPhi,
}

/// Arena and interning table owning every term of one synthesis context.
///
/// Terms are never freed individually; the whole store goes away at context
/// teardown. Interning canonicalizes commutative operand order and keeps one
/// node per distinct constant value, so `TermId` equality is semantic
/// equality.
#[derive(Default)]
pub struct TermStore {
    terms: Vec<TermData>,
    interned: HashMap<TermKey, TermId>,
    next_var: u32,
    next_hole: u32,
}

impl TermStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn get(&self, id: TermId) -> &TermData {
        &self.terms[id.0 as usize]
    }

    pub fn kind(&self, id: TermId) -> Kind {
        self.get(id).kind
    }

    pub fn width(&self, id: TermId) -> u32 {
        self.get(id).width
    }

    pub fn ops(&self, id: TermId) -> &[TermId] {
        &self.get(id).ops
    }

    /// Payload of a constant node, if `id` is one.
    pub fn const_value(&self, id: TermId) -> Option<BitVec> {
        self.get(id).value
    }

    fn insert(&mut self, key: TermKey) -> TermId {
        if let Some(&id) = self.interned.get(&key) {
            return id;
        }
        let id = TermId(self.terms.len() as u32);
        self.terms.push(TermData {
            kind: key.kind,
            width: key.width,
            ops: key.ops.clone(),
            value: key.value,
            name: key.name.clone(),
            facts: key.facts.clone(),
        });
        self.interned.insert(key, id);
        id
    }

    /// The unique constant term for this exact bit-vector value.
    pub fn const_val(&mut self, value: BitVec) -> TermId {
        self.insert(TermKey {
            kind: Kind::Const,
            width: value.width(),
            ops: Vec::new(),
            value: Some(value),
            name: None,
            facts: None,
        })
    }

    pub fn const_u128(&mut self, width: u32, value: u128) -> TermId {
        self.const_val(BitVec::new(width, value))
    }

    pub fn true_val(&mut self) -> TermId {
        self.const_u128(1, 1)
    }

    pub fn false_val(&mut self) -> TermId {
        self.const_u128(1, 0)
    }

    /// The variable with this name, width, and no derived facts.
    pub fn var(&mut self, width: u32, name: &str) -> Result<TermId, TermError> {
        self.var_with_facts(width, name, VarFacts::none(width))
    }

    pub fn var_with_facts(
        &mut self,
        width: u32,
        name: &str,
        facts: VarFacts,
    ) -> Result<TermId, TermError> {
        if width < 1 || width > MAX_WIDTH {
            return Err(TermError::BadWidth { width });
        }
        Ok(self.insert(TermKey {
            kind: Kind::Var,
            width,
            ops: Vec::new(),
            value: None,
            name: Some(name.to_string()),
            facts: Some(facts),
        }))
    }

    /// A variable with a name no other call has handed out.
    pub fn fresh_var(&mut self, width: u32) -> TermId {
        loop {
            let name = format!("fresh_{}", self.next_var);
            self.next_var += 1;
            let before = self.terms.len();
            let id = self
                .var(width, &name)
                .expect("fresh_var width checked by caller");
            if self.terms.len() > before {
                return id;
            }
        }
    }

    /// A fresh symbolic constant for the constant synthesizer to fill in.
    pub fn hole(&mut self, width: u32) -> TermId {
        let name = format!("symconst_{}", self.next_hole);
        self.next_hole += 1;
        self.insert(TermKey {
            kind: Kind::Hole,
            width,
            ops: Vec::new(),
            value: None,
            name: Some(name),
            facts: None,
        })
    }

    /// The canonical term for an operation node. Validates the opcode's
    /// arity/width contract and orders commutative operands, so equal
    /// expressions intern to the same id.
    pub fn intern(&mut self, kind: Kind, width: u32, ops: Vec<TermId>) -> Result<TermId, TermError> {
        if width < 1 || width > MAX_WIDTH {
            return Err(TermError::BadWidth { width });
        }
        if matches!(kind, Kind::Const | Kind::Var | Kind::Hole) {
            return Err(TermError::LeafViaIntern { kind });
        }
        if let Some(expected) = kind.arity()
            && ops.len() != expected
        {
            return Err(TermError::Arity {
                kind,
                expected,
                got: ops.len(),
            });
        }
        self.validate_widths(kind, width, &ops)?;

        let mut ops = ops;
        if kind.is_commutative() {
            debug_assert_eq!(ops.len(), 2);
            ops.sort();
        }

        let id = self.insert(TermKey {
            kind,
            width,
            ops,
            value: None,
            name: None,
            facts: None,
        });
        debug_assert_eq!(self.width(id), width, "interning changed a term width");
        Ok(id)
    }

    fn validate_widths(&self, kind: Kind, width: u32, ops: &[TermId]) -> Result<(), TermError> {
        use Kind::*;
        let w = |id: TermId| self.width(id);
        let mismatch = || TermError::WidthMismatch {
            kind,
            width,
            op_widths: ops.iter().map(|&o| self.width(o)).collect(),
        };

        let ok = match kind {
            Const | Var | Hole => unreachable!("leaves handled before width validation"),
            Phi => {
                if ops.is_empty() {
                    return Err(TermError::EmptyPhi);
                }
                ops.iter().all(|&o| w(o) == width)
            }
            Select => w(ops[0]) == 1 && w(ops[1]) == width && w(ops[2]) == width,
            ZExt | SExt => w(ops[0]) < width,
            Trunc => w(ops[0]) > width,
            BSwap => {
                if width % 8 != 0 {
                    return Err(TermError::BadSwapWidth { width });
                }
                w(ops[0]) == width
            }
            CtPop | BitReverse | Cttz | Ctlz | LogB | BitWidth | Freeze => w(ops[0]) == width,
            Eq | Ne | Ult | Slt | Ule | Sle | KnownOnesP | KnownZerosP | SAddO | UAddO | SSubO
            | USubO | SMulO | UMulO => {
                if width != 1 {
                    return Err(TermError::PredicateWidth { kind, width });
                }
                w(ops[0]) == w(ops[1])
            }
            SAddWithOverflow | UAddWithOverflow | SSubWithOverflow | USubWithOverflow
            | SMulWithOverflow | UMulWithOverflow => {
                w(ops[0]) == w(ops[1]) && width == w(ops[0]) + 1
            }
            ExtractValue => {
                let Some(idx) = self.const_value(ops[1]) else {
                    return Err(TermError::BadExtractIndex);
                };
                if idx.raw() > 1 {
                    return Err(TermError::BadExtractIndex);
                }
                let agg = w(ops[0]);
                if idx.is_zero() {
                    agg == width + 1
                } else {
                    width == 1 && agg >= 2
                }
            }
            FShl | FShr => ops.iter().all(|&o| w(o) == width),
            // Binary same-width ops.
            _ => w(ops[0]) == width && w(ops[1]) == width,
        };

        if ok { Ok(()) } else { Err(mismatch()) }
    }

    /// Ids of every term interned so far, in creation order.
    pub fn ids(&self) -> impl Iterator<Item = TermId> + '_ {
        (0..self.terms.len() as u32).map(TermId)
    }
}

impl std::fmt::Debug for TermStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TermStore")
            .field("terms", &self.terms.len())
            .finish()
    }
}
