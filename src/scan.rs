use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Hard cap on the absolute raw score a single symbol may accumulate.
pub const SYMBOL_SCORE_CAP: f64 = 999.0;

/// Options recorded per symbol are deduplicated and bounded.
pub const MAX_OPTIONS: usize = 255;

/// Final categorical decision for a task, ordered least to greatest severity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    NoAction,
    Greylist,
    AddHeader,
    RewriteSubject,
    SoftReject,
    Reject,
    Discard,
    Quarantine,
}

impl Action {
    pub fn parse(name: &str) -> Option<Action> {
        match name {
            "no_action" | "no action" => Some(Action::NoAction),
            "greylist" => Some(Action::Greylist),
            "add_header" | "add header" => Some(Action::AddHeader),
            "rewrite_subject" | "rewrite subject" => Some(Action::RewriteSubject),
            "soft_reject" | "soft reject" => Some(Action::SoftReject),
            "reject" => Some(Action::Reject),
            "discard" => Some(Action::Discard),
            "quarantine" => Some(Action::Quarantine),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::NoAction => "no_action",
            Action::Greylist => "greylist",
            Action::AddHeader => "add_header",
            Action::RewriteSubject => "rewrite_subject",
            Action::SoftReject => "soft_reject",
            Action::Reject => "reject",
            Action::Discard => "discard",
            Action::Quarantine => "quarantine",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scoring metadata for one registered symbol name.
#[derive(Debug, Clone)]
pub struct SymbolScore {
    pub weight: f64,
    pub one_shot: bool,
    pub group: Option<String>,
}

/// Group score limits. A missing bound means unconstrained.
#[derive(Debug, Clone, Default)]
pub struct GroupLimits {
    pub max_score: Option<f64>,
    pub min_score: Option<f64>,
}

/// One configured action threshold. `priority` breaks ties between actions
/// configured at the same threshold.
#[derive(Debug, Clone)]
pub struct ActionThreshold {
    pub action: Action,
    pub threshold: f64,
    pub priority: i32,
}

/// Frozen scoring configuration shared read-only across tasks: registered
/// symbol weights, action thresholds, group limits and the grow factor.
#[derive(Debug, Clone, Default)]
pub struct Scoring {
    pub symbols: HashMap<String, SymbolScore>,
    pub actions: Vec<ActionThreshold>,
    pub groups: HashMap<String, GroupLimits>,
    pub grow_factor: Option<f64>,
    pub allow_unknown: bool,
    pub unknown_weight: f64,
}

impl Scoring {
    /// Sort thresholds ascending (ties by explicit priority, then action
    /// severity) so action selection is a forward scan with the last
    /// eligible entry winning.
    pub fn finish(&mut self) {
        self.actions.sort_by(|a, b| {
            a.threshold
                .partial_cmp(&b.threshold)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.priority.cmp(&b.priority))
                .then(a.action.cmp(&b.action))
        });
    }

    pub fn threshold_for(&self, action: Action) -> Option<f64> {
        self.actions
            .iter()
            .find(|t| t.action == action)
            .map(|t| t.threshold)
    }
}

/// An early-decision override. The highest-priority passthrough recorded
/// during a task decides the final action regardless of score.
#[derive(Debug, Clone)]
pub struct Passthrough {
    pub priority: i32,
    pub action: Action,
    pub message: Option<String>,
    pub module: Option<String>,
}

/// One accumulated symbol result.
#[derive(Debug, Clone)]
pub struct SymbolRecord {
    pub name: String,
    pub score: f64,
    pub options: Vec<String>,
    pub group: Option<String>,
}

/// The per-task scan-result accumulator: an insertion-ordered map of symbol
/// records plus the passthrough set. Scoring configuration is shared.
pub struct ScanResult {
    scoring: Arc<Scoring>,
    records: HashMap<String, SymbolRecord>,
    order: Vec<String>,
    passthroughs: Vec<Passthrough>,
}

impl ScanResult {
    pub fn new(scoring: Arc<Scoring>) -> Self {
        ScanResult {
            scoring,
            records: HashMap::new(),
            order: Vec::new(),
            passthroughs: Vec::new(),
        }
    }

    pub fn scoring(&self) -> &Scoring {
        &self.scoring
    }

    /// Record a symbol result. The stored raw weight is
    /// `registered_weight * multiplier`; repeated inserts accumulate unless
    /// the symbol is `one_shot`. Unknown symbols are dropped unless
    /// `allow_unknown` is configured.
    pub fn insert(&mut self, name: &str, multiplier: f64, options: &[&str]) {
        let (weight, one_shot, group) = match self.scoring.symbols.get(name) {
            Some(s) => (s.weight, s.one_shot, s.group.clone()),
            None if self.scoring.allow_unknown => (self.scoring.unknown_weight, false, None),
            None => {
                log::debug!("dropping result for unregistered symbol {name}");
                return;
            }
        };

        let delta = weight * multiplier;

        if let Some(rec) = self.records.get_mut(name) {
            if one_shot {
                log::debug!("symbol {name} is one_shot, ignoring repeated result");
                return;
            }
            if (rec.score + delta).abs() > SYMBOL_SCORE_CAP {
                log::debug!("symbol {name} score would exceed cap, rejecting insert");
                return;
            }
            rec.score += delta;
            for opt in options {
                if rec.options.len() >= MAX_OPTIONS {
                    break;
                }
                if !rec.options.iter().any(|o| o == opt) {
                    rec.options.push((*opt).to_string());
                }
            }
            return;
        }

        let score = if delta.abs() > SYMBOL_SCORE_CAP {
            log::debug!("symbol {name} initial score exceeds cap, clamping");
            SYMBOL_SCORE_CAP.copysign(delta)
        } else {
            delta
        };

        let mut opts: Vec<String> = Vec::new();
        for opt in options {
            if opts.len() >= MAX_OPTIONS {
                break;
            }
            if !opts.iter().any(|o| o == opt) {
                opts.push((*opt).to_string());
            }
        }

        self.records.insert(
            name.to_string(),
            SymbolRecord {
                name: name.to_string(),
                score,
                options: opts,
                group,
            },
        );
        self.order.push(name.to_string());
    }

    pub fn contains(&self, name: &str) -> bool {
        self.records.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&SymbolRecord> {
        self.records.get(name)
    }

    /// Remove a record entirely (composite `remove_all` / `remove_symbol`).
    pub fn remove(&mut self, name: &str) -> Option<SymbolRecord> {
        let rec = self.records.remove(name);
        if rec.is_some() {
            self.order.retain(|n| n != name);
        }
        rec
    }

    /// Zero a record's score contribution, keeping presence and options
    /// (composite `remove_weight`).
    pub fn zero_weight(&mut self, name: &str) {
        if let Some(rec) = self.records.get_mut(name) {
            rec.score = 0.0;
        }
    }

    /// Records in insertion order.
    pub fn records(&self) -> impl Iterator<Item = &SymbolRecord> {
        self.order.iter().filter_map(|n| self.records.get(n))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Sum of raw scores of present symbols belonging to `group`.
    pub fn group_score(&self, group: &str) -> f64 {
        self.records()
            .filter(|r| r.group.as_deref() == Some(group))
            .map(|r| r.score)
            .sum()
    }

    /// Whether any present symbol belongs to `group`.
    pub fn group_present(&self, group: &str) -> bool {
        self.records().any(|r| r.group.as_deref() == Some(group))
    }

    /// Symbols of `group` currently present, by name.
    pub fn group_members(&self, group: &str) -> Vec<String> {
        self.records()
            .filter(|r| r.group.as_deref() == Some(group))
            .map(|r| r.name.clone())
            .collect()
    }

    pub fn add_passthrough(&mut self, p: Passthrough) {
        log::info!(
            "passthrough recorded: action={} priority={} module={}",
            p.action,
            p.priority,
            p.module.as_deref().unwrap_or("-")
        );
        self.passthroughs.push(p);
    }

    /// The winning passthrough: highest priority, first recorded on ties.
    pub fn top_passthrough(&self) -> Option<&Passthrough> {
        self.passthroughs
            .iter()
            .fold(None, |best: Option<&Passthrough>, p| match best {
                Some(b) if b.priority >= p.priority => Some(b),
                _ => Some(p),
            })
    }

    /// Unnormalized score: group contributions clamped to configured limits,
    /// ungrouped records summed directly.
    pub fn raw_score(&self) -> f64 {
        let mut ungrouped = 0.0;
        let mut by_group: HashMap<&str, f64> = HashMap::new();

        for rec in self.records() {
            match rec.group.as_deref() {
                Some(g) => *by_group.entry(g).or_insert(0.0) += rec.score,
                None => ungrouped += rec.score,
            }
        }

        let mut total = ungrouped;
        for (group, sum) in by_group {
            let mut contribution = sum;
            if let Some(limits) = self.scoring.groups.get(group) {
                if let Some(max) = limits.max_score {
                    if contribution > max {
                        log::debug!("group {group} clamped to max_score {max}");
                        contribution = max;
                    }
                }
                if let Some(min) = limits.min_score {
                    if contribution < -min {
                        log::debug!("group {group} clamped to min_score {min}");
                        contribution = -min;
                    }
                }
            }
            total += contribution;
        }
        total
    }

    /// Final score after grow-factor normalization: scores past the reject
    /// threshold grow super-linearly.
    pub fn score(&self) -> f64 {
        let raw = self.raw_score();
        if let (Some(factor), Some(reject)) = (
            self.scoring.grow_factor,
            self.scoring.threshold_for(Action::Reject),
        ) {
            if raw > reject && factor > 0.0 {
                return reject + (raw - reject) * factor;
            }
        }
        raw
    }

    /// Select the final action: the winning passthrough if any, otherwise
    /// the action with the greatest threshold at or below the score.
    pub fn action(&self) -> (Action, Option<String>) {
        if let Some(p) = self.top_passthrough() {
            return (p.action, p.message.clone());
        }

        let score = self.score();
        let mut selected = Action::NoAction;
        for t in &self.scoring.actions {
            if t.threshold > score {
                break;
            }
            selected = t.action;
        }

        (selected, None)
    }
}
