#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt::Write;

use crate::replacement::{ParsedReplacement, postorder};
use crate::term::{Kind, TermId, TermStore};

/// Render a term DAG as a numbered instruction listing, one operation per
/// line (`%N:iW = opcode op, op`). For logs and test assertions; the real
/// printer for the interchange format lives outside the core.
pub fn print_term(store: &TermStore, root: TermId) -> String {
    let mut out = String::new();
    let mut names = BTreeMap::new();
    let mut next = 0u32;
    print_into(store, &[root], &mut out, &mut names, &mut next);
    out
}

/// Render a whole rule: path-condition lines, then the instruction listing,
/// then the final `lhs => rhs` mapping line.
pub fn print_replacement(store: &TermStore, rep: &ParsedReplacement) -> String {
    let mut out = String::new();
    let mut names = BTreeMap::new();
    let mut next = 0u32;

    for pc in &rep.pcs {
        print_into(store, &[pc.lhs, pc.rhs], &mut out, &mut names, &mut next);
        let _ = writeln!(out, "pc {} {}", names[&pc.lhs], names[&pc.rhs]);
    }
    for bpc in &rep.bpcs {
        print_into(
            store,
            &[bpc.pc.lhs, bpc.pc.rhs],
            &mut out,
            &mut names,
            &mut next,
        );
        let _ = writeln!(
            out,
            "blockpc %{}.{} {} {}",
            bpc.block, bpc.pred, names[&bpc.pc.lhs], names[&bpc.pc.rhs]
        );
    }

    let mut roots = vec![rep.lhs];
    if let Some(rhs) = rep.rhs {
        roots.push(rhs);
    }
    print_into(store, &roots, &mut out, &mut names, &mut next);
    match rep.rhs {
        Some(rhs) => {
            let _ = writeln!(out, "{} => {}", names[&rep.lhs], names[&rhs]);
        }
        None => {
            let _ = writeln!(out, "infer {}", names[&rep.lhs]);
        }
    }
    out
}

fn print_into(
    store: &TermStore,
    roots: &[TermId],
    out: &mut String,
    names: &mut BTreeMap<TermId, String>,
    next: &mut u32,
) {
    for id in postorder(store, roots) {
        if names.contains_key(&id) {
            continue;
        }
        let data = store.get(id);
        match data.kind {
            Kind::Const => {
                names.insert(
                    id,
                    format!("{}:i{}", data.value.expect("const value").raw(), data.width),
                );
            }
            Kind::Var | Kind::Hole => {
                let name = format!("%{}", data.name.as_deref().expect("named leaf"));
                let mut line = format!("{name}:i{} = {}", data.width, data.kind.name());
                if let Some(facts) = &data.facts {
                    if !facts.known.is_top() {
                        let _ = write!(line, " (knownBits={})", facts.known);
                    }
                    if !facts.range.is_full() {
                        let _ = write!(line, " (range={})", facts.range);
                    }
                    if facts.non_zero {
                        line.push_str(" (nonZero)");
                    }
                    if facts.non_negative {
                        line.push_str(" (nonNegative)");
                    }
                    if facts.negative {
                        line.push_str(" (negative)");
                    }
                    if facts.power_of_two {
                        line.push_str(" (powerOfTwo)");
                    }
                    if facts.num_sign_bits > 1 {
                        let _ = write!(line, " (signBits={})", facts.num_sign_bits);
                    }
                }
                let _ = writeln!(out, "{line}");
                names.insert(id, name);
            }
            kind => {
                let name = format!("%{}", *next);
                *next += 1;
                let ops = data
                    .ops
                    .iter()
                    .map(|o| names[o].clone())
                    .collect::<Vec<_>>()
                    .join(", ");
                let _ = writeln!(out, "{name}:i{} = {} {}", data.width, kind.name(), ops);
                names.insert(id, name);
            }
        }
    }
}
