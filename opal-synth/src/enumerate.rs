#![forbid(unsafe_code)]

use std::collections::HashSet;

use log::debug;

use opal_ir::{BitVec, Kind, ParsedReplacement, TermId, TermStore, cost, holes};
use opal_verify::{OracleError, VerifyResult};

use crate::cegis::{ConstSynthResult, find_one_const_set};
use crate::context::{SynthesisContext, SynthesisOptions};
use crate::prune::PruningManager;

/// Binary opcodes offered by the candidate grammar, cheapest first.
const BINARY_OPS: &[Kind] = &[
    Kind::And,
    Kind::Or,
    Kind::Xor,
    Kind::Add,
    Kind::Sub,
    Kind::Shl,
    Kind::LShr,
    Kind::AShr,
    Kind::Mul,
    Kind::UDiv,
];

const UNARY_OPS: &[Kind] = &[Kind::Ctlz, Kind::Cttz, Kind::CtPop, Kind::BitReverse];

const COMPARE_OPS: &[Kind] = &[Kind::Eq, Kind::Ne, Kind::Ult, Kind::Slt, Kind::Ule, Kind::Sle];

/// The candidate sequence of one synthesis task: finite, restartable, and
/// ordered by non-decreasing estimated cost, so the first verified guess is
/// locally minimal under the cost metric rather than merely first generated.
pub struct Guesses {
    candidates: Vec<TermId>,
    cursor: usize,
}

impl Guesses {
    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn restart(&mut self) {
        self.cursor = 0;
    }

    pub fn as_slice(&self) -> &[TermId] {
        &self.candidates
    }
}

impl Iterator for Guesses {
    type Item = TermId;

    fn next(&mut self) -> Option<TermId> {
        let next = self.candidates.get(self.cursor).copied();
        self.cursor += next.is_some() as usize;
        next
    }
}

/// Enumerate replacement candidates for `width`-valued targets over the
/// given input variables.
///
/// The grammar: the inputs themselves (width-adapted where necessary), a
/// small constant pool plus one synthesizable symbolic constant, then
/// unary/binary/select compositions of cheaper candidates, bounded by
/// `max_ops` and the global guess budget, deduplicated through hash-consing
/// identity.
pub fn generate_guesses(
    store: &mut TermStore,
    inputs: &[TermId],
    width: u32,
    opts: &SynthesisOptions,
) -> Guesses {
    let mut seen: HashSet<TermId> = HashSet::new();
    let mut leaves: Vec<TermId> = Vec::new();
    let push = |pool: &mut Vec<TermId>, seen: &mut HashSet<TermId>, id: TermId| {
        if seen.insert(id) {
            pool.push(id);
        }
    };

    for &input in inputs {
        for adapted in adapt_width(store, input, width) {
            push(&mut leaves, &mut seen, adapted);
        }
    }
    for value in [
        BitVec::zero(width),
        BitVec::one(width),
        BitVec::all_ones(width),
        BitVec::sign_bit(width),
    ] {
        let c = store.const_val(value);
        push(&mut leaves, &mut seen, c);
    }
    if opts.synthesize_consts {
        let h = store.hole(width);
        push(&mut leaves, &mut seen, h);
    }

    // Comparison pool: 1-bit predicates over the original inputs, used as
    // select conditions, and as candidates in their own right for 1-bit
    // targets.
    let mut compares: Vec<TermId> = Vec::new();
    for (i, &a) in inputs.iter().enumerate() {
        for &b in &inputs[i..] {
            if store.width(a) != store.width(b) {
                continue;
            }
            let zero = store.const_val(BitVec::zero(store.width(a)));
            for kind in COMPARE_OPS {
                for (l, r) in [(a, b), (a, zero), (b, zero)] {
                    if l == r && matches!(kind, Kind::Eq | Kind::Ne) {
                        continue;
                    }
                    if let Ok(c) = store.intern(*kind, 1, vec![l, r]) {
                        if !compares.contains(&c) {
                            compares.push(c);
                        }
                    }
                }
            }
        }
    }

    let mut levels: Vec<Vec<TermId>> = vec![leaves.clone()];
    'grow: for k in 1..=opts.max_ops as usize {
        let mut tier: Vec<TermId> = Vec::new();
        // Binary compositions of strictly cheaper candidates.
        for &op in BINARY_OPS {
            for i in 0..k {
                let j = k - 1 - i;
                if j >= levels.len() {
                    continue;
                }
                for ai in 0..levels[i].len() {
                    for bi in 0..levels[j].len() {
                        let (a, b) = (levels[i][ai], levels[j][bi]);
                        if is_constant_like(store, a) && is_constant_like(store, b) {
                            continue;
                        }
                        if let Ok(t) = store.intern(op, width, vec![a, b]) {
                            push(&mut tier, &mut seen, t);
                        }
                        if generated(&levels, &tier) >= opts.max_guesses {
                            levels.push(tier);
                            break 'grow;
                        }
                    }
                }
            }
        }
        // Unary compositions.
        for &op in UNARY_OPS {
            for ai in 0..levels[k - 1].len() {
                let a = levels[k - 1][ai];
                if is_constant_like(store, a) {
                    continue;
                }
                if let Ok(t) = store.intern(op, width, vec![a]) {
                    push(&mut tier, &mut seen, t);
                }
            }
        }
        // Selects: one op for the select, one for its condition.
        if k >= 2 {
            for ci in 0..compares.len() {
                for i in 0..k - 1 {
                    let j = k - 2 - i;
                    if j >= levels.len() {
                        continue;
                    }
                    for ai in 0..levels[i].len() {
                        for bi in 0..levels[j].len() {
                            let (a, b) = (levels[i][ai], levels[j][bi]);
                            if a == b {
                                continue;
                            }
                            let c = compares[ci];
                            if let Ok(t) = store.intern(Kind::Select, width, vec![c, a, b]) {
                                push(&mut tier, &mut seen, t);
                            }
                            if generated(&levels, &tier) >= opts.max_guesses {
                                levels.push(tier);
                                break 'grow;
                            }
                        }
                    }
                }
            }
        }
        levels.push(tier);
    }

    let mut candidates: Vec<TermId> = levels.into_iter().flatten().collect();
    if width == 1 {
        for c in compares {
            if seen.insert(c) {
                candidates.push(c);
            }
        }
    }
    candidates.sort_by_key(|&id| (cost(store, id), id));
    candidates.truncate(opts.max_guesses);
    debug!("enumerated {} candidates at width {width}", candidates.len());
    Guesses {
        candidates,
        cursor: 0,
    }
}

fn generated(levels: &[Vec<TermId>], tier: &[TermId]) -> usize {
    levels.iter().map(Vec::len).sum::<usize>() + tier.len()
}

fn is_constant_like(store: &TermStore, id: TermId) -> bool {
    matches!(store.kind(id), Kind::Const | Kind::Hole)
}

/// An input as seen at the target width: itself when widths agree, both
/// extensions when narrower, the truncation when wider.
fn adapt_width(store: &mut TermStore, input: TermId, width: u32) -> Vec<TermId> {
    let w = store.width(input);
    if w == width {
        vec![input]
    } else if w < width {
        let z = store
            .intern(Kind::ZExt, width, vec![input])
            .expect("widening cast");
        let s = store
            .intern(Kind::SExt, width, vec![input])
            .expect("widening cast");
        vec![z, s]
    } else {
        vec![
            store
                .intern(Kind::Trunc, width, vec![input])
                .expect("narrowing cast"),
        ]
    }
}

/// Counters reported alongside the outcome of one synthesis run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SynthesisStats {
    pub total_guesses: u64,
    pub pruned: u64,
    pub verified: u64,
}

/// Outcome of one synthesis run. Exhausting the candidate space is the
/// normal `NoCandidate` result, not an error.
#[derive(Clone, Debug)]
pub enum SynthesisOutcome {
    Found(Vec<ParsedReplacement>),
    NoCandidate,
}

#[derive(Clone, Debug)]
pub struct SynthesisReport {
    pub outcome: SynthesisOutcome,
    pub stats: SynthesisStats,
}

impl SynthesisReport {
    /// The cheapest verified replacement, if any.
    pub fn best(&self) -> Option<&ParsedReplacement> {
        match &self.outcome {
            SynthesisOutcome::Found(reps) => reps.first(),
            SynthesisOutcome::NoCandidate => None,
        }
    }
}

/// The synthesis driver: enumerate candidates in cost order, filter through
/// the pruning manager, then settle survivors with the oracle: through
/// constant synthesis when the candidate carries symbolic constants,
/// directly otherwise. Stops at the first verified replacement unless
/// `check_all_guesses` asks for the full sweep.
pub fn synthesize(
    store: &mut TermStore,
    ctx: &SynthesisContext<'_>,
    opts: &SynthesisOptions,
) -> Result<SynthesisReport, OracleError> {
    let mut stats = SynthesisStats::default();
    let mut pruner = if opts.prune {
        let mut pm = PruningManager::new(ctx, opts.input_sets.clone(), opts.stats);
        pm.init(store);
        Some(pm)
    } else {
        None
    };

    // Oracle-suggested candidates run before the grammar's.
    let inferred = ctx
        .oracle
        .infer_candidates(store, ctx.lhs, &ctx.pcs, ctx.timeout)?;
    let guesses = generate_guesses(store, &ctx.inputs, ctx.width, opts);
    let lhs_cost = cost(store, ctx.lhs);

    let mut found: Vec<ParsedReplacement> = Vec::new();
    for guess in inferred.into_iter().chain(guesses) {
        if opts.require_profit && cost(store, guess) >= lhs_cost {
            continue;
        }
        stats.total_guesses += 1;
        if let Some(pm) = &mut pruner
            && pm.is_infeasible_with_oracle(store, guess)
        {
            continue;
        }

        let rep = ParsedReplacement {
            lhs: ctx.lhs,
            rhs: Some(guess),
            pcs: ctx.pcs.clone(),
            bpcs: ctx.bpcs.clone(),
        };
        let confirmed = if holes(store, guess).is_empty() {
            match ctx.oracle.check_equivalent(
                store,
                &rep.mapping(),
                &ctx.pcs,
                &ctx.bpcs,
                ctx.timeout,
            )? {
                VerifyResult::Valid => Some(rep),
                VerifyResult::Invalid(Some(cex)) => {
                    if let Some(pm) = &mut pruner {
                        pm.add_counterexample(store, &cex);
                    }
                    None
                }
                // Timeouts and bare refutations both just move on.
                VerifyResult::Invalid(None) | VerifyResult::Unknown => None,
            }
        } else {
            match find_one_const_set(store, ctx, &rep, &opts.cegis)? {
                ConstSynthResult::Consts(consts) => Some(rep.replace_consts(store, &consts)),
                ConstSynthResult::NoConsts | ConstSynthResult::Unknown => None,
            }
        };

        if let Some(rep) = confirmed {
            stats.verified += 1;
            found.push(rep);
            if !opts.check_all_guesses {
                break;
            }
        }
    }

    if let Some(pm) = &pruner {
        stats.pruned = pm.num_pruned();
        debug!("{pm}");
    }
    found.sort_by_key(|rep| cost(store, rep.mapping().rhs));
    let outcome = if found.is_empty() {
        SynthesisOutcome::NoCandidate
    } else {
        SynthesisOutcome::Found(found)
    };
    Ok(SynthesisReport { outcome, stats })
}
