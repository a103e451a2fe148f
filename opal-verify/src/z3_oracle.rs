#![forbid(unsafe_code)]
//! Z3-backed oracle, compiled behind `--features opal-verify/z3` so the
//! workspace stays buildable on machines without libz3.

use std::collections::{BTreeMap, HashMap};

use z3::{
    Config, Context, Params, SatResult, Solver,
    ast::{Ast, BV, Bool},
};

use opal_ir::{
    BitVec, BlockPathCondition, Kind, Mapping, ParsedReplacement, TermId, TermStore, free_vars,
};

use crate::oracle::{
    ConstMap, Counterexample, Oracle, OracleError, SolveResult, Timeout, VerifyResult,
};

pub struct Z3Oracle {
    ctx: &'static Context,
}

impl Z3Oracle {
    pub fn new() -> Self {
        let mut cfg = Config::new();
        cfg.set_model_generation(true);
        // Leak the Z3 context so encodings can be kept without
        // self-referential structs or unsafe code; one synthesis process
        // holds one context for its lifetime.
        let ctx: &'static Context = Box::leak(Box::new(Context::new(&cfg)));
        Self { ctx }
    }

    fn solver(&self, timeout: Timeout) -> Solver<'static> {
        let solver = Solver::new(self.ctx);
        let mut params = Params::new(self.ctx);
        params.set_u32("timeout", timeout.millis.min(u32::MAX as u64) as u32);
        solver.set_params(&params);
        solver
    }
}

impl Default for Z3Oracle {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-query encoder. `encode` returns the value of a node and accumulates
/// the node's well-definedness side conditions (UB- and poison-freedom)
/// into `defined`; refinement checks then assert the LHS's conditions and
/// refute the RHS's.
struct Encoder<'a> {
    ctx: &'static Context,
    store: &'a TermStore,
    bindings: &'a BTreeMap<TermId, BitVec>,
    cache: HashMap<TermId, BV<'static>>,
    defined: HashMap<TermId, Bool<'static>>,
}

impl<'a> Encoder<'a> {
    fn new(
        ctx: &'static Context,
        store: &'a TermStore,
        bindings: &'a BTreeMap<TermId, BitVec>,
    ) -> Self {
        Self {
            ctx,
            store,
            bindings,
            cache: HashMap::new(),
            defined: HashMap::new(),
        }
    }

    fn constant(&self, v: BitVec) -> BV<'static> {
        if v.width() <= 64 {
            BV::from_u64(self.ctx, v.raw() as u64, v.width())
        } else {
            let hi = BV::from_u64(self.ctx, (v.raw() >> 64) as u64, v.width() - 64);
            let lo = BV::from_u64(self.ctx, v.raw() as u64, 64);
            hi.concat(&lo)
        }
    }

    fn bool_bv(&self, b: &Bool<'static>) -> BV<'static> {
        b.ite(
            &BV::from_u64(self.ctx, 1, 1),
            &BV::from_u64(self.ctx, 0, 1),
        )
    }

    fn truthy(&self, bv: &BV<'static>) -> Bool<'static> {
        bv._eq(&BV::from_u64(self.ctx, 1, 1))
    }

    /// Conjunction of the well-definedness conditions of every node under
    /// `root`. `Bool::and` of nothing is true, matching always-defined DAGs.
    fn defined_under(&self, root: TermId) -> Bool<'static> {
        let conds: Vec<&Bool<'static>> = opal_ir::postorder(self.store, &[root])
            .into_iter()
            .filter_map(|id| self.defined.get(&id))
            .collect();
        Bool::and(self.ctx, &conds)
    }

    fn encode(&mut self, id: TermId) -> Result<BV<'static>, OracleError> {
        if let Some(bv) = self.cache.get(&id) {
            return Ok(bv.clone());
        }
        let data = self.store.get(id);
        let width = data.width;
        let encoded = match data.kind {
            Kind::Const => self.constant(data.value.expect("const carries a value")),
            Kind::Var | Kind::Hole => match self.bindings.get(&id) {
                Some(&v) => self.constant(v),
                None => {
                    let name = data.name.as_deref().expect("named leaf");
                    BV::new_const(self.ctx, format!("{name}_{}", id.0), width)
                }
            },
            kind => {
                let ops: Vec<BV<'static>> = data
                    .ops
                    .clone()
                    .into_iter()
                    .map(|op| self.encode(op))
                    .collect::<Result<_, _>>()?;
                self.encode_op(id, kind, width, &data.ops.clone(), &ops)?
            }
        };
        self.cache.insert(id, encoded.clone());
        Ok(encoded)
    }

    fn encode_op(
        &mut self,
        id: TermId,
        kind: Kind,
        width: u32,
        op_ids: &[TermId],
        ops: &[BV<'static>],
    ) -> Result<BV<'static>, OracleError> {
        use Kind::*;
        let ctx = self.ctx;
        let a = || ops[0].clone();
        let bb = || ops[1].clone();
        let unsupported = || OracleError::Unsupported { kind, width };

        let value = match kind {
            Add | AddNsw | AddNuw | AddNw => a().bvadd(&bb()),
            Sub | SubNsw | SubNuw | SubNw => a().bvsub(&bb()),
            Mul | MulNsw | MulNuw | MulNw => a().bvmul(&bb()),
            UDiv | UDivExact => a().bvudiv(&bb()),
            SDiv | SDivExact => a().bvsdiv(&bb()),
            URem => a().bvurem(&bb()),
            SRem => a().bvsrem(&bb()),
            And => a().bvand(&bb()),
            Or => a().bvor(&bb()),
            Xor => a().bvxor(&bb()),
            Shl | ShlNsw | ShlNuw | ShlNw => a().bvshl(&bb()),
            LShr | LShrExact => a().bvlshr(&bb()),
            AShr | AShrExact => a().bvashr(&bb()),

            Eq => self.bool_bv(&a()._eq(&bb())),
            Ne => self.bool_bv(&a()._eq(&bb()).not()),
            Ult => self.bool_bv(&a().bvult(&bb())),
            Slt => self.bool_bv(&a().bvslt(&bb())),
            Ule => self.bool_bv(&a().bvule(&bb())),
            Sle => self.bool_bv(&a().bvsle(&bb())),

            ZExt => a().zero_ext(width - a().get_size()),
            SExt => a().sign_ext(width - a().get_size()),
            Trunc => a().extract(width - 1, 0),

            Select => self.truthy(&ops[0]).ite(&ops[1], &ops[2]),
            // Freeze of a well-defined value is that value; definedness of
            // the operand propagates through `defined_under`.
            Freeze => a(),
            Phi if ops.len() == 1 => a(),
            Phi => return Err(unsupported()),

            CtPop => {
                let mut sum = BV::from_u64(ctx, 0, width);
                for i in 0..width {
                    let bit = a().extract(i, i);
                    let wide = if width > 1 { bit.zero_ext(width - 1) } else { bit };
                    sum = sum.bvadd(&wide);
                }
                sum
            }
            Cttz => {
                // Innermost alternative: every bit zero, count = width.
                let mut out = self.constant(BitVec::new(width, width as u128));
                for i in (0..width).rev() {
                    let set = a().extract(i, i)._eq(&BV::from_u64(ctx, 1, 1));
                    out = set.ite(&self.constant(BitVec::new(width, i as u128)), &out);
                }
                out
            }
            Ctlz => {
                let mut out = self.constant(BitVec::new(width, width as u128));
                for i in 0..width {
                    let set = a().extract(i, i)._eq(&BV::from_u64(ctx, 1, 1));
                    out = set.ite(
                        &self.constant(BitVec::new(width, (width - 1 - i) as u128)),
                        &out,
                    );
                }
                out
            }
            LogB => {
                let mut out = self.constant(BitVec::zero(width));
                for i in 0..width {
                    let set = a().extract(i, i)._eq(&BV::from_u64(ctx, 1, 1));
                    out = set.ite(&self.constant(BitVec::new(width, i as u128)), &out);
                }
                out
            }
            BitWidth => self.constant(BitVec::new(width, width as u128)),
            BSwap => {
                let bytes = width / 8;
                let mut out: Option<BV<'static>> = None;
                for i in 0..bytes {
                    let byte = a().extract(8 * i + 7, 8 * i);
                    out = Some(match out {
                        None => byte,
                        Some(acc) => acc.concat(&byte),
                    });
                }
                out.expect("bswap width is a positive multiple of 8")
            }
            BitReverse => {
                let mut out: Option<BV<'static>> = None;
                for i in 0..width {
                    let bit = a().extract(i, i);
                    out = Some(match out {
                        None => bit,
                        Some(acc) => acc.concat(&bit),
                    });
                }
                out.expect("width is positive")
            }

            FShl | FShr => {
                let w = self.constant(BitVec::new(width, width as u128));
                let amt = ops[2].bvurem(&w);
                let zero = self.constant(BitVec::zero(width));
                let inv = w.bvsub(&amt);
                let shifted = if kind == FShl {
                    ops[0].bvshl(&amt).bvor(&ops[1].bvlshr(&inv))
                } else {
                    ops[0].bvshl(&inv).bvor(&ops[1].bvlshr(&amt))
                };
                let plain = if kind == FShl { ops[0].clone() } else { ops[1].clone() };
                amt._eq(&zero).ite(&plain, &shifted)
            }

            SAddSat => {
                let no_over = ops[0].bvadd_no_overflow(&ops[1], true);
                let no_under = ops[0].bvadd_no_underflow(&ops[1]);
                let max = self.constant(BitVec::max_signed(width));
                let min = self.constant(BitVec::min_signed(width));
                no_over.ite(&no_under.ite(&ops[0].bvadd(&ops[1]), &min), &max)
            }
            UAddSat => {
                let no_over = ops[0].bvadd_no_overflow(&ops[1], false);
                let ones = self.constant(BitVec::all_ones(width));
                no_over.ite(&ops[0].bvadd(&ops[1]), &ones)
            }
            SSubSat => {
                let no_over = ops[0].bvsub_no_overflow(&ops[1]);
                let no_under = ops[0].bvsub_no_underflow(&ops[1], true);
                let max = self.constant(BitVec::max_signed(width));
                let min = self.constant(BitVec::min_signed(width));
                no_over.ite(&no_under.ite(&ops[0].bvsub(&ops[1]), &min), &max)
            }
            USubSat => {
                let no_under = ops[0].bvsub_no_underflow(&ops[1], false);
                let zero = self.constant(BitVec::zero(width));
                no_under.ite(&ops[0].bvsub(&ops[1]), &zero)
            }

            SAddWithOverflow | UAddWithOverflow | SSubWithOverflow | USubWithOverflow
            | SMulWithOverflow | UMulWithOverflow => {
                let flag = self.overflow_flag(aggregate_flag_kind(kind), &ops[0], &ops[1]);
                let low = match kind {
                    SAddWithOverflow | UAddWithOverflow => ops[0].bvadd(&ops[1]),
                    SSubWithOverflow | USubWithOverflow => ops[0].bvsub(&ops[1]),
                    _ => ops[0].bvmul(&ops[1]),
                };
                self.bool_bv(&flag).concat(&low)
            }
            SAddO | UAddO | SSubO | USubO | SMulO | UMulO => {
                let flag = self.overflow_flag(kind, &ops[0], &ops[1]);
                self.bool_bv(&flag)
            }

            ExtractValue => {
                let idx = self
                    .store
                    .const_value(op_ids[1])
                    .expect("interning checked the index");
                let agg_width = ops[0].get_size();
                if idx.is_zero() {
                    ops[0].extract(agg_width - 2, 0)
                } else {
                    ops[0].extract(agg_width - 1, agg_width - 1)
                }
            }

            KnownOnesP => self.bool_bv(&ops[0].bvand(&ops[1])._eq(&ops[1])),
            KnownZerosP => {
                let zero = self.constant(BitVec::zero(ops[0].get_size()));
                self.bool_bv(&ops[0].bvand(&ops[1])._eq(&zero))
            }

            Const | Var | Hole => unreachable!("leaves handled in encode"),
        };

        if let Some(cond) = self.definedness(kind, width, &ops, &value) {
            self.defined.insert(id, cond);
        }
        Ok(value)
    }

    /// Overflow predicate for the flag-reporting opcodes.
    fn overflow_flag(&self, kind: Kind, a: &BV<'static>, b: &BV<'static>) -> Bool<'static> {
        use Kind::*;
        let no = match kind {
            SAddO => Bool::and(
                self.ctx,
                &[&a.bvadd_no_overflow(b, true), &a.bvadd_no_underflow(b)],
            ),
            UAddO => a.bvadd_no_overflow(b, false),
            SSubO => Bool::and(
                self.ctx,
                &[&a.bvsub_no_overflow(b), &a.bvsub_no_underflow(b, true)],
            ),
            USubO => a.bvsub_no_underflow(b, false),
            SMulO => Bool::and(
                self.ctx,
                &[&a.bvmul_no_overflow(b, true), &a.bvmul_no_underflow(b)],
            ),
            UMulO => a.bvmul_no_overflow(b, false),
            other => unreachable!("not an overflow flag kind: {other:?}"),
        };
        no.not()
    }

    /// Side condition under which this node produces a defined value.
    fn definedness(
        &self,
        kind: Kind,
        width: u32,
        ops: &[BV<'static>],
        value: &BV<'static>,
    ) -> Option<Bool<'static>> {
        use Kind::*;
        let ctx = self.ctx;
        let nonzero_divisor = || {
            ops[1]
                ._eq(&self.constant(BitVec::zero(width)))
                .not()
        };
        let no_sdiv_wrap = || {
            let min = self.constant(BitVec::min_signed(width));
            let neg1 = self.constant(BitVec::all_ones(width));
            Bool::and(ctx, &[&ops[0]._eq(&min), &ops[1]._eq(&neg1)]).not()
        };
        let in_shift_range = || ops[1].bvult(&self.constant(BitVec::new(width, width as u128)));

        Some(match kind {
            UDiv | URem => nonzero_divisor(),
            SDiv | SRem => Bool::and(ctx, &[&nonzero_divisor(), &no_sdiv_wrap()]),
            UDivExact => {
                let exact = ops[0]
                    .bvurem(&ops[1])
                    ._eq(&self.constant(BitVec::zero(width)));
                Bool::and(ctx, &[&nonzero_divisor(), &exact])
            }
            SDivExact => {
                let exact = ops[0]
                    .bvsrem(&ops[1])
                    ._eq(&self.constant(BitVec::zero(width)));
                Bool::and(ctx, &[&nonzero_divisor(), &no_sdiv_wrap(), &exact])
            }

            AddNsw => Bool::and(
                ctx,
                &[
                    &ops[0].bvadd_no_overflow(&ops[1], true),
                    &ops[0].bvadd_no_underflow(&ops[1]),
                ],
            ),
            AddNuw => ops[0].bvadd_no_overflow(&ops[1], false),
            AddNw => Bool::and(
                ctx,
                &[
                    &ops[0].bvadd_no_overflow(&ops[1], true),
                    &ops[0].bvadd_no_underflow(&ops[1]),
                    &ops[0].bvadd_no_overflow(&ops[1], false),
                ],
            ),
            SubNsw => Bool::and(
                ctx,
                &[
                    &ops[0].bvsub_no_overflow(&ops[1]),
                    &ops[0].bvsub_no_underflow(&ops[1], true),
                ],
            ),
            SubNuw => ops[0].bvsub_no_underflow(&ops[1], false),
            SubNw => Bool::and(
                ctx,
                &[
                    &ops[0].bvsub_no_overflow(&ops[1]),
                    &ops[0].bvsub_no_underflow(&ops[1], true),
                    &ops[0].bvsub_no_underflow(&ops[1], false),
                ],
            ),
            MulNsw => Bool::and(
                ctx,
                &[
                    &ops[0].bvmul_no_overflow(&ops[1], true),
                    &ops[0].bvmul_no_underflow(&ops[1]),
                ],
            ),
            MulNuw => ops[0].bvmul_no_overflow(&ops[1], false),
            MulNw => Bool::and(
                ctx,
                &[
                    &ops[0].bvmul_no_overflow(&ops[1], true),
                    &ops[0].bvmul_no_underflow(&ops[1]),
                    &ops[0].bvmul_no_overflow(&ops[1], false),
                ],
            ),

            Shl | LShr | AShr => in_shift_range(),
            ShlNsw => Bool::and(
                ctx,
                &[&in_shift_range(), &value.bvashr(&ops[1])._eq(&ops[0])],
            ),
            ShlNuw => Bool::and(
                ctx,
                &[&in_shift_range(), &value.bvlshr(&ops[1])._eq(&ops[0])],
            ),
            ShlNw => Bool::and(
                ctx,
                &[
                    &in_shift_range(),
                    &value.bvashr(&ops[1])._eq(&ops[0]),
                    &value.bvlshr(&ops[1])._eq(&ops[0]),
                ],
            ),
            LShrExact | AShrExact => Bool::and(
                ctx,
                &[&in_shift_range(), &value.bvshl(&ops[1])._eq(&ops[0])],
            ),

            LogB => {
                let zero = self.constant(BitVec::zero(width));
                ops[0]._eq(&zero).not()
            }

            _ => return None,
        })
    }
}

/// The flag-only counterpart of a with-overflow aggregate.
fn aggregate_flag_kind(kind: Kind) -> Kind {
    match kind {
        Kind::SAddWithOverflow => Kind::SAddO,
        Kind::UAddWithOverflow => Kind::UAddO,
        Kind::SSubWithOverflow => Kind::SSubO,
        Kind::USubWithOverflow => Kind::USubO,
        Kind::SMulWithOverflow => Kind::SMulO,
        Kind::UMulWithOverflow => Kind::UMulO,
        other => other,
    }
}

fn model_value(model: &z3::Model<'static>, bv: &BV<'static>, width: u32) -> Option<BitVec> {
    let evaluated = model.eval(bv, true)?;
    if width <= 64 {
        Some(BitVec::new(width, evaluated.as_u64()? as u128))
    } else {
        let lo = evaluated.extract(63, 0).simplify().as_u64()? as u128;
        let hi = evaluated
            .extract(width - 1, 64)
            .simplify()
            .as_u64()? as u128;
        Some(BitVec::new(width, (hi << 64) | lo))
    }
}

impl Oracle for Z3Oracle {
    fn check_equivalent(
        &self,
        store: &mut TermStore,
        mapping: &Mapping,
        pcs: &[Mapping],
        bpcs: &[BlockPathCondition],
        timeout: Timeout,
    ) -> Result<VerifyResult, OracleError> {
        if opal_ir::contains_kind(store, mapping.lhs, Kind::Hole)
            || opal_ir::contains_kind(store, mapping.rhs, Kind::Hole)
        {
            return Err(OracleError::UnsolvedHoles);
        }
        let empty = BTreeMap::new();
        let mut enc = Encoder::new(self.ctx, store, &empty);
        let lhs = enc.encode(mapping.lhs)?;
        let rhs = enc.encode(mapping.rhs)?;
        let solver = self.solver(timeout);

        for pc in pcs.iter().chain(bpcs.iter().map(|b| &b.pc)) {
            let l = enc.encode(pc.lhs)?;
            let r = enc.encode(pc.rhs)?;
            solver.assert(&l._eq(&r));
            solver.assert(&enc.defined_under(pc.lhs));
        }
        // Refutation: a model is an input where the LHS is defined but the
        // RHS is undefined or disagrees.
        solver.assert(&enc.defined_under(mapping.lhs));
        let rhs_ok = Bool::and(self.ctx, &[&enc.defined_under(mapping.rhs), &lhs._eq(&rhs)]);
        solver.assert(&rhs_ok.not());

        match solver.check() {
            SatResult::Unsat => Ok(VerifyResult::Valid),
            SatResult::Unknown => Ok(VerifyResult::Unknown),
            SatResult::Sat => {
                let Some(model) = solver.get_model() else {
                    return Ok(VerifyResult::Invalid(None));
                };
                let mut values = BTreeMap::new();
                let mut vars = free_vars(store, mapping.lhs);
                vars.extend(free_vars(store, mapping.rhs));
                vars.dedup();
                for var in vars {
                    let width = store.width(var);
                    if let Some(bv) = enc.cache.get(&var)
                        && let Some(v) = model_value(&model, bv, width)
                    {
                        values.insert(var, v);
                    }
                }
                Ok(VerifyResult::Invalid(Some(Counterexample { values })))
            }
        }
    }

    fn solve_for_constants(
        &self,
        store: &mut TermStore,
        rep: &ParsedReplacement,
        holes: &[TermId],
        counterexamples: &[Counterexample],
        timeout: Timeout,
    ) -> Result<SolveResult, OracleError> {
        let solver = self.solver(timeout);
        let mapping = rep.mapping();

        // One shared encoder keeps the hole constants stable across
        // counterexamples; variables are rebound per counterexample.
        let empty = BTreeMap::new();
        let mut hole_enc = Encoder::new(self.ctx, store, &empty);
        let hole_bvs: Vec<(TermId, BV<'static>)> = holes
            .iter()
            .map(|&h| hole_enc.encode(h).map(|bv| (h, bv)))
            .collect::<Result<_, _>>()?;

        // Conditions decidable from the holes alone (no free variables)
        // gate which assignments are admissible; this carries the blocking
        // clauses of iterated constant search.
        for pc in rep.pcs.iter().chain(rep.bpcs.iter().map(|b| &b.pc)) {
            if free_vars(store, pc.lhs).is_empty() && free_vars(store, pc.rhs).is_empty() {
                let l = hole_enc.encode(pc.lhs)?;
                let r = hole_enc.encode(pc.rhs)?;
                solver.assert(&l._eq(&r));
            }
        }

        for cex in counterexamples {
            let mut enc = Encoder::new(self.ctx, store, &cex.values);
            // Share the hole constants.
            for (h, bv) in &hole_bvs {
                enc.cache.insert(*h, bv.clone());
            }
            let lhs = enc.encode(mapping.lhs)?;
            let rhs = enc.encode(mapping.rhs)?;
            let mut premises: Vec<Bool<'static>> = vec![enc.defined_under(mapping.lhs)];
            for pc in rep.pcs.iter().chain(rep.bpcs.iter().map(|b| &b.pc)) {
                let l = enc.encode(pc.lhs)?;
                let r = enc.encode(pc.rhs)?;
                premises.push(l._eq(&r));
                premises.push(enc.defined_under(pc.lhs));
            }
            let premise_refs: Vec<&Bool<'static>> = premises.iter().collect();
            let premise = Bool::and(self.ctx, &premise_refs);
            let conclusion =
                Bool::and(self.ctx, &[&enc.defined_under(mapping.rhs), &lhs._eq(&rhs)]);
            solver.assert(&premise.implies(&conclusion));
        }

        match solver.check() {
            SatResult::Unsat => Ok(SolveResult::Infeasible),
            SatResult::Unknown => Ok(SolveResult::Unknown),
            SatResult::Sat => {
                let Some(model) = solver.get_model() else {
                    return Ok(SolveResult::Unknown);
                };
                let mut consts = ConstMap::new();
                for (h, bv) in &hole_bvs {
                    let width = store.width(*h);
                    match model_value(&model, bv, width) {
                        Some(v) => {
                            consts.insert(*h, v);
                        }
                        None => return Ok(SolveResult::Unknown),
                    }
                }
                Ok(SolveResult::Consts(consts))
            }
        }
    }
}
