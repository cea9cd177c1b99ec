pub mod eval;
pub mod expr;

pub use eval::process;
pub use expr::{Atom, CmpOp, Expr, ExprError};

use crate::error::{ConfigError, MapError};
use crate::symcache::{SymbolCache, SymbolType};
use std::collections::HashMap;
use std::path::Path;

/// What happens to the symbols that made a composite true.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositePolicy {
    /// Delete the contributing record entirely.
    RemoveAll,
    /// Delete the record only when its score is non-negative.
    RemoveSymbol,
    /// Keep the record but zero its score contribution.
    RemoveWeight,
    /// No modification.
    Leave,
}

impl CompositePolicy {
    pub fn parse(name: &str) -> Option<CompositePolicy> {
        match name {
            "remove" | "remove_all" | "default" => Some(CompositePolicy::RemoveAll),
            "remove_symbol" => Some(CompositePolicy::RemoveSymbol),
            "remove_weight" => Some(CompositePolicy::RemoveWeight),
            "leave" | "remove_none" => Some(CompositePolicy::Leave),
            _ => None,
        }
    }
}

/// A parsed composite rule.
#[derive(Debug, Clone)]
pub struct Composite {
    pub name: String,
    pub score: f64,
    pub group: String,
    pub policy: CompositePolicy,
    pub priority: i32,
    /// Set by `process_dependencies`: evaluate after postfilters.
    pub second_pass: bool,
    pub expression: String,
    pub expr: Expr,
}

/// How to treat a redefinition of an existing composite name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnDuplicate {
    /// Configuration semantics: warn and keep the first definition.
    Refuse,
    /// Map-file semantics: replace the prior definition silently.
    Replace,
}

/// Holds every configured composite and classifies them into the two
/// evaluation passes at freeze time.
#[derive(Debug, Default)]
pub struct CompositesManager {
    composites: Vec<Composite>,
    by_name: HashMap<String, usize>,
    processed: bool,
}

impl CompositesManager {
    pub fn new() -> CompositesManager {
        CompositesManager::default()
    }

    /// Parse and add one composite definition. Parse failures reject the
    /// definition without aborting startup; the caller logs and moves on.
    #[allow(clippy::too_many_arguments)]
    pub fn add_composite(
        &mut self,
        name: &str,
        expression: &str,
        score: f64,
        policy: CompositePolicy,
        group: Option<&str>,
        priority: i32,
        on_duplicate: OnDuplicate,
    ) -> Result<(), ConfigError> {
        if let Some(&idx) = self.by_name.get(name) {
            match on_duplicate {
                OnDuplicate::Refuse => {
                    log::warn!("composite {name} is redefined, keeping first definition");
                    return Ok(());
                }
                OnDuplicate::Replace => {
                    log::debug!("composite {name} replaced");
                    let comp = self.build(name, expression, score, policy, group, priority)?;
                    self.composites[idx] = comp;
                    return Ok(());
                }
            }
        }

        let comp = self.build(name, expression, score, policy, group, priority)?;
        self.by_name.insert(name.to_string(), self.composites.len());
        self.composites.push(comp);
        Ok(())
    }

    fn build(
        &self,
        name: &str,
        expression: &str,
        score: f64,
        policy: CompositePolicy,
        group: Option<&str>,
        priority: i32,
    ) -> Result<Composite, ConfigError> {
        let expr = expr::parse(expression).map_err(|e| ConfigError::BadComposite {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Composite {
            name: name.to_string(),
            score,
            group: group.unwrap_or("composite").to_string(),
            policy,
            priority,
            second_pass: false,
            expression: expression.to_string(),
            expr,
        })
    }

    pub fn find(&self, name: &str) -> Option<&Composite> {
        self.by_name.get(name).map(|&idx| &self.composites[idx])
    }

    pub fn len(&self) -> usize {
        self.composites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.composites.is_empty()
    }

    pub fn composites(&self) -> &[Composite] {
        &self.composites
    }

    /// Load composites from map-file text: one `<name>:<score> <expression>`
    /// per line. Malformed lines are rejected with a log message; valid
    /// entries replace prior definitions of the same name. Returns the
    /// number of composites loaded.
    pub fn load_map_text(&mut self, text: &str) -> usize {
        let mut loaded = 0;
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((name_and_score, expression)) = line.split_once(' ') else {
                log::error!("composites map line {}: missing expression", lineno + 1);
                continue;
            };
            let Some((name, score_text)) = name_and_score.split_once(':') else {
                log::error!(
                    "composites map line {}: missing score for {}",
                    lineno + 1,
                    name_and_score
                );
                continue;
            };
            let score = match score_text.parse::<f64>() {
                Ok(n) if n.is_finite() => n,
                _ => {
                    log::error!("composites map line {}: invalid score for {}", lineno + 1, name);
                    continue;
                }
            };
            match self.add_composite(
                name,
                expression.trim(),
                score,
                CompositePolicy::RemoveAll,
                None,
                0,
                OnDuplicate::Replace,
            ) {
                Ok(()) => loaded += 1,
                Err(e) => log::error!("composites map line {}: {e}", lineno + 1),
            }
        }
        loaded
    }

    pub fn load_map_file(&mut self, path: &Path) -> Result<usize, MapError> {
        let text = std::fs::read_to_string(path).map_err(|source| MapError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Ok(self.load_map_text(&text))
    }

    /// Classify composites into first/second pass. An atom pushes its
    /// composite into the second pass when it names a postfilter, classifier
    /// or `nostat` symbol, carries the `^` forward marker, or (transitively)
    /// names another second-pass composite. Runs to a fixed point; flips
    /// are monotone so the loop terminates.
    pub fn process_dependencies(&mut self, cache: &SymbolCache) {
        for comp in &mut self.composites {
            let direct = comp.expr.atoms().iter().any(|atom| {
                if atom.forward {
                    return true;
                }
                match cache.get(&atom.name) {
                    Some(item) => {
                        matches!(item.stype, SymbolType::Postfilter | SymbolType::Classifier)
                            || item.flags.nostat
                    }
                    None => false,
                }
            });
            if direct {
                log::debug!("composite {} marked second pass (direct)", comp.name);
                comp.second_pass = true;
            }
        }

        loop {
            let second: Vec<String> = self
                .composites
                .iter()
                .filter(|c| c.second_pass)
                .map(|c| c.name.clone())
                .collect();
            let mut changed = false;
            for comp in &mut self.composites {
                if comp.second_pass {
                    continue;
                }
                if comp
                    .expr
                    .atoms()
                    .iter()
                    .any(|atom| second.iter().any(|s| s == &atom.name))
                {
                    log::debug!("composite {} marked second pass (transitive)", comp.name);
                    comp.second_pass = true;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        self.processed = true;
        let second = self.composites.iter().filter(|c| c.second_pass).count();
        log::debug!(
            "composite dependency analysis complete: {} first-pass, {} second-pass",
            self.composites.len() - second,
            second
        );
    }

    /// Composites of one pass in evaluation order: priority descending,
    /// name ascending on ties.
    fn pass(&self, second: bool) -> Vec<&Composite> {
        let mut list: Vec<&Composite> = self
            .composites
            .iter()
            .filter(|c| c.second_pass == second)
            .collect();
        list.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.name.cmp(&b.name)));
        list
    }

    pub fn first_pass(&self) -> Vec<&Composite> {
        self.pass(false)
    }

    pub fn second_pass(&self) -> Vec<&Composite> {
        self.pass(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symcache::{SymbolDef, SymbolFlags, SymbolHandler, SymbolOutput};
    use crate::task::Task;
    use async_trait::async_trait;
    use std::sync::Arc;

    struct Noop;

    #[async_trait]
    impl SymbolHandler for Noop {
        async fn run(&self, _task: &Task) -> anyhow::Result<SymbolOutput> {
            Ok(SymbolOutput::miss())
        }
    }

    #[test]
    fn test_policy_aliases() {
        assert_eq!(CompositePolicy::parse("remove"), Some(CompositePolicy::RemoveAll));
        assert_eq!(CompositePolicy::parse("default"), Some(CompositePolicy::RemoveAll));
        assert_eq!(CompositePolicy::parse("remove_none"), Some(CompositePolicy::Leave));
        assert_eq!(CompositePolicy::parse("bogus"), None);
    }

    #[test]
    fn test_bad_expression_rejected() {
        let mut cm = CompositesManager::new();
        let err = cm.add_composite(
            "BROKEN",
            "A &",
            1.0,
            CompositePolicy::RemoveAll,
            None,
            0,
            OnDuplicate::Refuse,
        );
        assert!(err.is_err());
        assert!(cm.is_empty());
    }

    #[test]
    fn test_config_duplicate_keeps_first() {
        let mut cm = CompositesManager::new();
        cm.add_composite("C", "A & B", 1.0, CompositePolicy::RemoveAll, None, 0, OnDuplicate::Refuse)
            .unwrap();
        cm.add_composite("C", "X | Y", 9.0, CompositePolicy::Leave, None, 0, OnDuplicate::Refuse)
            .unwrap();
        assert_eq!(cm.len(), 1);
        assert_eq!(cm.find("C").unwrap().expression, "A & B");
    }

    #[test]
    fn test_map_text_loading() {
        let mut cm = CompositesManager::new();
        let text = "\
# comment
SPAMMY_PAIR:5.5 BLOCKLISTED & SUSPICIOUS_SUBJECT
NO_SCORE_LINE BLOCKLISTED & X
BAD_SCORE:abc A & B
BAD_EXPR:1.0 A &
SPAMMY_PAIR:7.0 BLOCKLISTED | SUSPICIOUS_SUBJECT
";
        let loaded = cm.load_map_text(text);
        // the two SPAMMY_PAIR lines both load; the rest are rejected
        assert_eq!(loaded, 2);
        assert_eq!(cm.len(), 1);
        let comp = cm.find("SPAMMY_PAIR").unwrap();
        // later entry replaced the first silently
        assert_eq!(comp.score, 7.0);
        assert!(comp.expression.contains('|'));
    }

    #[test]
    fn test_second_pass_classification() {
        let mut cache = SymbolCache::new();
        cache
            .register(SymbolDef::new("F", crate::symcache::SymbolType::Filter).with_handler(Arc::new(Noop)))
            .unwrap();
        cache
            .register(
                SymbolDef::new("PF", crate::symcache::SymbolType::Postfilter)
                    .with_handler(Arc::new(Noop)),
            )
            .unwrap();
        cache
            .register(
                SymbolDef::new("NS", crate::symcache::SymbolType::Filter)
                    .with_flags(SymbolFlags {
                        nostat: true,
                        ..Default::default()
                    })
                    .with_handler(Arc::new(Noop)),
            )
            .unwrap();

        let mut cm = CompositesManager::new();
        let add = |cm: &mut CompositesManager, name: &str, expression: &str| {
            cm.add_composite(
                name,
                expression,
                1.0,
                CompositePolicy::RemoveAll,
                None,
                0,
                OnDuplicate::Refuse,
            )
            .unwrap();
        };
        add(&mut cm, "PLAIN", "F & F");
        add(&mut cm, "LATE", "F & PF");
        add(&mut cm, "STATLESS", "NS | F");
        add(&mut cm, "FORWARD", "^F");
        add(&mut cm, "CHAINED", "LATE & F");
        add(&mut cm, "DEEP", "CHAINED | F");

        cm.process_dependencies(&cache);

        let second: Vec<&str> = cm.second_pass().iter().map(|c| c.name.as_str()).collect();
        assert!(second.contains(&"LATE"));
        assert!(second.contains(&"STATLESS"));
        assert!(second.contains(&"FORWARD"));
        // transitive closure over composite references
        assert!(second.contains(&"CHAINED"));
        assert!(second.contains(&"DEEP"));
        let first: Vec<&str> = cm.first_pass().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(first, vec!["PLAIN"]);
    }

    #[test]
    fn test_pass_order_priority_then_name() {
        let mut cm = CompositesManager::new();
        for (name, priority) in [("BBB", 0), ("AAA", 0), ("ZZZ", 5)] {
            cm.add_composite(
                name,
                "X & Y",
                1.0,
                CompositePolicy::Leave,
                None,
                priority,
                OnDuplicate::Refuse,
            )
            .unwrap();
        }
        let order: Vec<&str> = cm.first_pass().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(order, vec!["ZZZ", "AAA", "BBB"]);
    }
}
