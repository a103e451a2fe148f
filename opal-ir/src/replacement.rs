#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashSet};

use crate::bitvec::BitVec;
use crate::term::{Kind, TermId, TermStore};

/// An equivalence claim: the left term may be rewritten to the right term.
/// Path conditions reuse the same shape, with `rhs` a 1-bit constant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mapping {
    pub lhs: TermId,
    pub rhs: TermId,
}

impl Mapping {
    pub fn new(lhs: TermId, rhs: TermId) -> Self {
        Self { lhs, rhs }
    }
}

/// A path condition scoped to one predecessor edge of a block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockPathCondition {
    pub block: u32,
    pub pred: u32,
    pub pc: Mapping,
}

/// A complete rewrite rule: the LHS being replaced, the replacement (absent
/// while only a left-hand specification is known), and the conditions under
/// which the rule is claimed valid. Produced by extraction or synthesis,
/// consumed by verification and generalization; never mutated in place.
#[derive(Clone, Debug)]
pub struct ParsedReplacement {
    pub lhs: TermId,
    pub rhs: Option<TermId>,
    pub pcs: Vec<Mapping>,
    pub bpcs: Vec<BlockPathCondition>,
}

impl ParsedReplacement {
    pub fn new(mapping: Mapping) -> Self {
        Self {
            lhs: mapping.lhs,
            rhs: Some(mapping.rhs),
            pcs: Vec::new(),
            bpcs: Vec::new(),
        }
    }

    pub fn with_pcs(mapping: Mapping, pcs: Vec<Mapping>) -> Self {
        Self {
            lhs: mapping.lhs,
            rhs: Some(mapping.rhs),
            pcs,
            bpcs: Vec::new(),
        }
    }

    /// A left-hand-side-only specification, before a replacement is known.
    pub fn lhs_only(lhs: TermId) -> Self {
        Self {
            lhs,
            rhs: None,
            pcs: Vec::new(),
            bpcs: Vec::new(),
        }
    }

    /// The rule's mapping; callers use this once a replacement exists.
    pub fn mapping(&self) -> Mapping {
        Mapping::new(self.lhs, self.rhs.expect("replacement has no right-hand side yet"))
    }

    /// Every term reachable from the rule: mapping sides and all conditions.
    pub fn roots(&self) -> Vec<TermId> {
        let mut out = vec![self.lhs];
        if let Some(rhs) = self.rhs {
            out.push(rhs);
        }
        for pc in &self.pcs {
            out.push(pc.lhs);
            out.push(pc.rhs);
        }
        for bpc in &self.bpcs {
            out.push(bpc.pc.lhs);
            out.push(bpc.pc.rhs);
        }
        out
    }

    /// Rebuild the whole rule through a term substitution.
    pub fn replace_terms(&self, store: &mut TermStore, map: &BTreeMap<TermId, TermId>) -> Self {
        let sub = |store: &mut TermStore, id: TermId| replace_terms(store, id, map);
        Self {
            lhs: sub(store, self.lhs),
            rhs: self.rhs.map(|r| sub(store, r)),
            pcs: self
                .pcs
                .iter()
                .map(|pc| Mapping {
                    lhs: sub(store, pc.lhs),
                    rhs: sub(store, pc.rhs),
                })
                .collect(),
            bpcs: self
                .bpcs
                .iter()
                .map(|bpc| BlockPathCondition {
                    block: bpc.block,
                    pred: bpc.pred,
                    pc: Mapping {
                        lhs: sub(store, bpc.pc.lhs),
                        rhs: sub(store, bpc.pc.rhs),
                    },
                })
                .collect(),
        }
    }

    /// Substitute constants for holes (or other leaves) across the rule.
    pub fn replace_consts(&self, store: &mut TermStore, consts: &BTreeMap<TermId, BitVec>) -> Self {
        let map: BTreeMap<TermId, TermId> = consts
            .iter()
            .map(|(&id, &v)| (id, store.const_val(v)))
            .collect();
        self.replace_terms(store, &map)
    }

    pub fn free_vars(&self, store: &TermStore) -> Vec<TermId> {
        collect_kind(store, &self.roots(), Kind::Var)
    }

    pub fn holes(&self, store: &TermStore) -> Vec<TermId> {
        collect_kind(store, &self.roots(), Kind::Hole)
    }
}

/// Postorder walk over the distinct nodes reachable from `roots`.
pub fn postorder(store: &TermStore, roots: &[TermId]) -> Vec<TermId> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    let mut stack: Vec<(TermId, bool)> = roots.iter().rev().map(|&r| (r, false)).collect();
    while let Some((id, expanded)) = stack.pop() {
        if expanded {
            out.push(id);
            continue;
        }
        if !seen.insert(id) {
            continue;
        }
        stack.push((id, true));
        for &op in store.ops(id).iter().rev() {
            stack.push((op, false));
        }
    }
    out
}

fn collect_kind(store: &TermStore, roots: &[TermId], kind: Kind) -> Vec<TermId> {
    postorder(store, roots)
        .into_iter()
        .filter(|&id| store.kind(id) == kind)
        .collect()
}

pub fn free_vars(store: &TermStore, root: TermId) -> Vec<TermId> {
    collect_kind(store, &[root], Kind::Var)
}

pub fn holes(store: &TermStore, root: TermId) -> Vec<TermId> {
    collect_kind(store, &[root], Kind::Hole)
}

pub fn contains_kind(store: &TermStore, root: TermId, kind: Kind) -> bool {
    postorder(store, &[root]).iter().any(|&id| store.kind(id) == kind)
}

/// Rebuild `root` with every occurrence of a mapped term replaced. Unmapped
/// structure re-interns to the identical ids, so sharing is preserved.
pub fn replace_terms(
    store: &mut TermStore,
    root: TermId,
    map: &BTreeMap<TermId, TermId>,
) -> TermId {
    let order = postorder(store, &[root]);
    let mut rebuilt: BTreeMap<TermId, TermId> = BTreeMap::new();
    for id in order {
        if let Some(&to) = map.get(&id) {
            rebuilt.insert(id, to);
            continue;
        }
        let data = store.get(id);
        if data.ops.is_empty() {
            rebuilt.insert(id, id);
            continue;
        }
        let kind = data.kind;
        let width = data.width;
        let new_ops: Vec<TermId> = data.ops.iter().map(|o| rebuilt[o]).collect();
        let new_id = if new_ops == store.ops(id) {
            id
        } else {
            store
                .intern(kind, width, new_ops)
                .expect("substitution preserves widths")
        };
        rebuilt.insert(id, new_id);
    }
    rebuilt[&root]
}

/// Substitute constants for leaves (typically holes) under `root`.
pub fn replace_consts(
    store: &mut TermStore,
    root: TermId,
    consts: &BTreeMap<TermId, BitVec>,
) -> TermId {
    let map: BTreeMap<TermId, TermId> = consts
        .iter()
        .map(|(&id, &v)| (id, store.const_val(v)))
        .collect();
    replace_terms(store, root, &map)
}

/// Copy a term DAG into another store, preserving structure, names, and
/// facts. `map` carries leaf correspondences across calls.
pub fn clone_term(
    src: &TermStore,
    dst: &mut TermStore,
    root: TermId,
    map: &mut BTreeMap<TermId, TermId>,
) -> TermId {
    for id in postorder(src, &[root]) {
        if map.contains_key(&id) {
            continue;
        }
        let data = src.get(id);
        let cloned = match data.kind {
            Kind::Const => dst.const_val(data.value.expect("const carries a value")),
            Kind::Var => {
                let name = data.name.as_deref().expect("var carries a name");
                let facts = data.facts.clone().expect("var carries facts");
                dst.var_with_facts(data.width, name, facts)
                    .expect("source store already validated this var")
            }
            Kind::Hole => dst.hole(data.width),
            kind => {
                let ops = data.ops.iter().map(|o| map[o]).collect();
                dst.intern(kind, data.width, ops)
                    .expect("source store already validated this term")
            }
        };
        map.insert(id, cloned);
    }
    map[&root]
}

/// Weighted operation count of the DAG under `root`; shared nodes count once.
pub fn cost(store: &TermStore, root: TermId) -> u32 {
    postorder(store, &[root])
        .iter()
        .map(|&id| store.kind(id).cost())
        .sum()
}

/// How much a rule saves: LHS cost minus RHS cost. Negative profit marks a
/// rewrite that is not worth applying.
pub fn profit(store: &TermStore, rep: &ParsedReplacement) -> i64 {
    let m = rep.mapping();
    cost(store, m.lhs) as i64 - cost(store, m.rhs) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::b;

    #[test]
    fn postorder_visits_operands_first_and_once() {
        let mut store = TermStore::new();
        let x = store.var(8, "x").unwrap();
        let t = b(&mut store, x).and(1).or(2).get();
        let order = postorder(&store, &[t]);
        assert_eq!(*order.last().unwrap(), t);
        let and = order
            .iter()
            .position(|&id| store.kind(id) == Kind::And)
            .unwrap();
        let or = order
            .iter()
            .position(|&id| store.kind(id) == Kind::Or)
            .unwrap();
        assert!(and < or);

        // x is shared by nothing here, but sharing dedups.
        let shared = b(&mut store, t).xor(t).get();
        let order2 = postorder(&store, &[shared]);
        assert_eq!(
            order2.iter().filter(|&&id| id == t).count(),
            1,
            "shared subterm visits once"
        );
    }

    #[test]
    fn substitution_rebuilds_only_affected_paths() {
        let mut store = TermStore::new();
        let x = store.var(8, "x").unwrap();
        let y = store.var(8, "y").unwrap();
        let t = b(&mut store, x).and(1).get();
        let mut map = BTreeMap::new();
        map.insert(x, y);
        let t2 = replace_terms(&mut store, t, &map);
        let expected = b(&mut store, y).and(1).get();
        assert_eq!(t2, expected);

        // Substituting something absent returns the identical term.
        let mut none = BTreeMap::new();
        let z = store.var(8, "z").unwrap();
        none.insert(z, y);
        assert_eq!(replace_terms(&mut store, t, &none), t);
    }

    #[test]
    fn hole_substitution_produces_constants() {
        let mut store = TermStore::new();
        let x = store.var(8, "x").unwrap();
        let c = store.hole(8);
        let t = b(&mut store, x).add(c).get();
        let mut consts = BTreeMap::new();
        consts.insert(c, BitVec::new(8, 7));
        let t2 = replace_consts(&mut store, t, &consts);
        let expected = b(&mut store, x).add(7).get();
        assert_eq!(t2, expected);
        assert!(holes(&store, t2).is_empty());
    }

    #[test]
    fn clone_term_preserves_identity() {
        let mut src = TermStore::new();
        let x = src.var(8, "x").unwrap();
        let t = b(&mut src, x).and(3).xor(x).get();

        let mut dst = TermStore::new();
        let mut map = BTreeMap::new();
        let t2 = clone_term(&src, &mut dst, t, &mut map);
        assert_eq!(dst.kind(t2), Kind::Xor);
        let x2 = map[&x];
        assert_eq!(dst.get(x2).name.as_deref(), Some("x"));
        // Cloning again through the same map is a no-op.
        assert_eq!(clone_term(&src, &mut dst, t, &mut map), t2);
    }

    #[test]
    fn profit_prefers_cheaper_rhs() {
        let mut store = TermStore::new();
        let x = store.var(8, "x").unwrap();
        let lhs = {
            let a = b(&mut store, x).and(1).get();
            let c = b(&mut store, x).and(2).get();
            store.intern(Kind::Or, 8, vec![a, c]).unwrap()
        };
        let rhs = b(&mut store, x).and(3).get();
        let rep = ParsedReplacement::new(Mapping::new(lhs, rhs));
        assert_eq!(profit(&store, &rep), 2);
    }

    #[test]
    fn free_var_collection_dedups() {
        let mut store = TermStore::new();
        let x = store.var(8, "x").unwrap();
        let y = store.var(8, "y").unwrap();
        let t = {
            let a = b(&mut store, x).add(y).get();
            b(&mut store, a).xor(x).get()
        };
        let vars = free_vars(&store, t);
        assert_eq!(vars.len(), 2);
        assert!(vars.contains(&x) && vars.contains(&y));
    }
}
