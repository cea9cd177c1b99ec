//! Composite evaluation against the scan-result accumulator.
//!
//! Each pass evaluates every not-yet-fired composite against the current
//! accumulator state and batches its effects (insert own record, apply the
//! removal policy to contributing atoms); the batch is applied after the
//! pass and evaluation repeats until a fixed point. Batching makes the
//! outcome independent of evaluation order within a pass.

use super::expr::{Atom, Expr};
use super::{Composite, CompositePolicy};
use crate::scan::ScanResult;
use std::collections::HashSet;

/// Iteration cap guarding against pathological configurations.
const MAX_ITERATIONS: usize = 32;

/// A symbol that contributed to an expression's truth, with the modifiers
/// of the atom that referenced it.
#[derive(Debug, Clone)]
struct Contributor {
    name: String,
    protected: bool,
    no_score: bool,
}

#[derive(Debug)]
struct Val {
    truthy: bool,
    score: f64,
    contributors: Vec<Contributor>,
}

impl Val {
    fn falsy() -> Val {
        Val {
            truthy: false,
            score: 0.0,
            contributors: Vec::new(),
        }
    }
}

fn eval_atom(atom: &Atom, result: &ScanResult) -> Val {
    if let Some(group) = &atom.group {
        let members = result.group_members(group);
        if members.is_empty() {
            return Val::falsy();
        }
        return Val {
            truthy: true,
            score: result.group_score(group),
            contributors: members
                .into_iter()
                .map(|name| Contributor {
                    name,
                    protected: atom.protected,
                    no_score: atom.no_score,
                })
                .collect(),
        };
    }

    let Some(record) = result.get(&atom.name) else {
        return Val::falsy();
    };
    if let Some(sub) = &atom.suboption {
        if !record.options.iter().any(|o| o == sub) {
            return Val::falsy();
        }
    }
    Val {
        truthy: true,
        score: record.score,
        contributors: vec![Contributor {
            name: atom.name.clone(),
            protected: atom.protected,
            no_score: atom.no_score,
        }],
    }
}

fn eval_expr(expr: &Expr, result: &ScanResult) -> Val {
    match expr {
        Expr::Atom(atom) => eval_atom(atom, result),
        Expr::Not(inner) => {
            let v = eval_expr(inner, result);
            Val {
                truthy: !v.truthy,
                score: if v.truthy { 0.0 } else { 1.0 },
                contributors: Vec::new(),
            }
        }
        Expr::And(l, r) => {
            let lv = eval_expr(l, result);
            if !lv.truthy {
                return Val::falsy();
            }
            let rv = eval_expr(r, result);
            if !rv.truthy {
                return Val::falsy();
            }
            let mut contributors = lv.contributors;
            contributors.extend(rv.contributors);
            Val {
                truthy: true,
                score: lv.score + rv.score,
                contributors,
            }
        }
        Expr::Or(l, r) => {
            let lv = eval_expr(l, result);
            if lv.truthy {
                return lv;
            }
            let rv = eval_expr(r, result);
            if rv.truthy {
                return rv;
            }
            Val::falsy()
        }
        Expr::Cmp { op, lhs, rhs } => {
            let lv = eval_expr(lhs, result);
            if op.apply(lv.score, *rhs) {
                Val {
                    truthy: true,
                    score: lv.score,
                    contributors: lv.contributors,
                }
            } else {
                Val::falsy()
            }
        }
        Expr::Plus(l, r) => {
            let lv = eval_expr(l, result);
            let rv = eval_expr(r, result);
            let mut contributors = Vec::new();
            if lv.truthy {
                contributors.extend(lv.contributors);
            }
            if rv.truthy {
                contributors.extend(rv.contributors);
            }
            Val {
                truthy: lv.truthy || rv.truthy,
                score: lv.score + rv.score,
                contributors,
            }
        }
        Expr::Mul(inner, factor) => {
            let v = eval_expr(inner, result);
            Val {
                truthy: v.truthy,
                score: v.score * factor,
                contributors: v.contributors,
            }
        }
    }
}

fn apply_policy(result: &mut ScanResult, name: &str, policy: CompositePolicy) {
    match policy {
        CompositePolicy::RemoveAll => {
            result.remove(name);
        }
        CompositePolicy::RemoveSymbol => {
            if result.get(name).map_or(false, |r| r.score >= 0.0) {
                result.remove(name);
            }
        }
        CompositePolicy::RemoveWeight => {
            result.zero_weight(name);
        }
        CompositePolicy::Leave => {}
    }
}

/// Run one composite pass (first or second) to its fixed point, rewriting
/// the accumulator per each fired composite's policy.
pub fn process(result: &mut ScanResult, composites: &[&Composite]) {
    let mut fired: HashSet<&str> = HashSet::new();

    for _ in 0..MAX_ITERATIONS {
        let mut inserts: Vec<&Composite> = Vec::new();
        let mut removals: Vec<(String, CompositePolicy)> = Vec::new();

        for &comp in composites {
            if fired.contains(comp.name.as_str()) {
                continue;
            }
            let val = eval_expr(&comp.expr, result);
            if !val.truthy {
                continue;
            }
            log::debug!("composite {} fired", comp.name);
            fired.insert(comp.name.as_str());

            if val.contributors.iter().any(|c| c.no_score) {
                log::debug!("composite {} score withheld by '-' atom", comp.name);
            } else {
                inserts.push(comp);
            }
            for c in &val.contributors {
                if !c.protected {
                    removals.push((c.name.clone(), comp.policy));
                }
            }
        }

        if inserts.is_empty() && removals.is_empty() {
            return;
        }
        for comp in inserts {
            result.insert(&comp.name, 1.0, &[]);
        }
        for (name, policy) in removals {
            apply_policy(result, &name, policy);
        }
    }

    log::warn!("composite rewriting exceeded {MAX_ITERATIONS} iterations, halting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::composites::expr;
    use crate::scan::{Scoring, SymbolScore};
    use std::sync::Arc;

    fn composite(name: &str, expression: &str, score: f64, policy: CompositePolicy) -> Composite {
        Composite {
            name: name.to_string(),
            score,
            group: "composite".to_string(),
            policy,
            priority: 0,
            second_pass: false,
            expression: expression.to_string(),
            expr: expr::parse(expression).unwrap(),
        }
    }

    fn result_with(symbols: &[(&str, f64, Option<&str>)]) -> ScanResult {
        let mut scoring = Scoring::default();
        for (name, weight, group) in symbols {
            scoring.symbols.insert(
                name.to_string(),
                SymbolScore {
                    weight: *weight,
                    one_shot: false,
                    group: group.map(|g| g.to_string()),
                },
            );
        }
        // composite records insert through the same scoring table
        for name in ["C", "X", "OUTER", "INNER"] {
            scoring.symbols.entry(name.to_string()).or_insert(SymbolScore {
                weight: 5.0,
                one_shot: false,
                group: None,
            });
        }
        scoring.finish();
        let mut result = ScanResult::new(Arc::new(scoring));
        for (name, _, _) in symbols {
            result.insert(name, 1.0, &[]);
        }
        result
    }

    #[test]
    fn test_remove_all_policy() {
        // symbols A=1.0 B=2.0, composite C = "A & B" score 5, remove_all
        let mut result = result_with(&[("A", 1.0, None), ("B", 2.0, None)]);
        let c = composite("C", "A & B", 5.0, CompositePolicy::RemoveAll);
        process(&mut result, &[&c]);

        assert!(result.contains("C"));
        assert!(!result.contains("A"));
        assert!(!result.contains("B"));
        assert!((result.score() - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_remove_weight_policy_keeps_symbols() {
        let mut result = result_with(&[("A", 1.0, None), ("B", 2.0, None)]);
        let c = composite("C", "A & B", 5.0, CompositePolicy::RemoveWeight);
        process(&mut result, &[&c]);

        assert!(result.contains("A"));
        assert!(result.contains("B"));
        assert!(result.contains("C"));
        assert_eq!(result.get("A").unwrap().score, 0.0);
        assert_eq!(result.get("B").unwrap().score, 0.0);
        assert!((result.score() - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_tilde_protects_symbol_from_removal() {
        let mut result = result_with(&[("A", 1.0, None), ("B", 2.0, None)]);
        let c = composite("C", "~A & B", 5.0, CompositePolicy::RemoveAll);
        process(&mut result, &[&c]);

        assert!(result.contains("A"));
        assert!(!result.contains("B"));
        assert!(result.contains("C"));
        assert!((result.score() - 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_dash_withholds_composite_score() {
        let mut result = result_with(&[("A", 1.0, None), ("B", 2.0, None)]);
        let c = composite("C", "-A & B", 5.0, CompositePolicy::RemoveAll);
        process(&mut result, &[&c]);

        // fired: A and B removed, but C's own record is withheld
        assert!(!result.contains("A"));
        assert!(!result.contains("B"));
        assert!(!result.contains("C"));
    }

    #[test]
    fn test_remove_symbol_keeps_negative_scores() {
        let mut result = result_with(&[("A", 1.0, None), ("NEG", -2.0, None)]);
        let c = composite("C", "A & NEG", 5.0, CompositePolicy::RemoveSymbol);
        process(&mut result, &[&c]);

        assert!(!result.contains("A"));
        // negative record survives remove_symbol
        assert!(result.contains("NEG"));
    }

    #[test]
    fn test_leave_policy_touches_nothing() {
        let mut result = result_with(&[("A", 1.0, None), ("B", 2.0, None)]);
        let c = composite("C", "A & B", 5.0, CompositePolicy::Leave);
        process(&mut result, &[&c]);

        assert!(result.contains("A"));
        assert!(result.contains("B"));
        assert!(result.contains("C"));
        assert!((result.get("A").unwrap().score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_not_fires_on_absent_symbol() {
        let mut result = result_with(&[("A", 1.0, None)]);
        let c = composite("C", "A & !MISSING", 5.0, CompositePolicy::RemoveAll);
        process(&mut result, &[&c]);
        assert!(result.contains("C"));
        assert!(!result.contains("A"));
    }

    #[test]
    fn test_group_atom_matches_and_removes_members() {
        let mut result = result_with(&[
            ("FUZZY_1", 2.0, Some("fuzzy")),
            ("FUZZY_2", 3.0, Some("fuzzy")),
            ("OTHER", 1.0, None),
        ]);
        let c = composite("C", "g:fuzzy & OTHER", 5.0, CompositePolicy::RemoveAll);
        process(&mut result, &[&c]);

        assert!(result.contains("C"));
        assert!(!result.contains("FUZZY_1"));
        assert!(!result.contains("FUZZY_2"));
        assert!(!result.contains("OTHER"));
    }

    #[test]
    fn test_comparison_counts_scores() {
        let mut result = result_with(&[("A", 1.0, None), ("B", 1.0, None)]);
        let hit = composite("C", "A + B >= 2", 5.0, CompositePolicy::Leave);
        process(&mut result, &[&hit]);
        assert!(result.contains("C"));

        let mut result = result_with(&[("A", 1.0, None)]);
        let miss = composite("C", "A + B >= 2", 5.0, CompositePolicy::Leave);
        process(&mut result, &[&miss]);
        assert!(!result.contains("C"));
    }

    #[test]
    fn test_suboption_match_required() {
        let mut scoring = Scoring::default();
        for name in ["DKIM", "C"] {
            scoring.symbols.insert(
                name.to_string(),
                SymbolScore {
                    weight: 1.0,
                    one_shot: false,
                    group: None,
                },
            );
        }
        scoring.finish();
        let scoring = Arc::new(scoring);

        let mut result = ScanResult::new(scoring.clone());
        result.insert("DKIM", 1.0, &["example.com"]);
        let c = composite("C", "DKIM:example.com", 5.0, CompositePolicy::Leave);
        process(&mut result, &[&c]);
        assert!(result.contains("C"));

        let mut result = ScanResult::new(scoring);
        result.insert("DKIM", 1.0, &["other.org"]);
        let c = composite("C", "DKIM:example.com", 5.0, CompositePolicy::Leave);
        process(&mut result, &[&c]);
        assert!(!result.contains("C"));
    }

    #[test]
    fn test_composite_referencing_composite_reaches_fixed_point() {
        let mut result = result_with(&[("A", 1.0, None), ("B", 2.0, None)]);
        let inner = composite("INNER", "A & B", 5.0, CompositePolicy::Leave);
        let outer = composite("OUTER", "INNER", 5.0, CompositePolicy::RemoveAll);
        // OUTER only becomes true once INNER's record lands
        process(&mut result, &[&outer, &inner]);

        assert!(result.contains("OUTER"));
        // OUTER's remove_all applies to its contributor INNER
        assert!(!result.contains("INNER"));
    }

    #[test]
    fn test_order_independence_within_pass() {
        let run = |order: [&str; 2]| {
            let mut result = result_with(&[("A", 1.0, None), ("B", 2.0, None)]);
            let c1 = composite("C", "A & B", 5.0, CompositePolicy::RemoveAll);
            let c2 = composite("X", "A", 5.0, CompositePolicy::Leave);
            let comps: Vec<&Composite> = order
                .iter()
                .map(|n| if *n == "C" { &c1 } else { &c2 })
                .collect::<Vec<_>>();
            process(&mut result, &comps);
            let mut names: Vec<String> = result.records().map(|r| r.name.clone()).collect();
            names.sort();
            names
        };

        assert_eq!(run(["C", "X"]), run(["X", "C"]));
    }
}
