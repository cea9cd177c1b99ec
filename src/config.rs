use crate::composites::{CompositePolicy, CompositesManager, OnDuplicate};
use crate::scan::{Action, ActionThreshold, GroupLimits, Scoring, SymbolScore};
use crate::symcache::{SymbolCache, SymbolFlags};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_socket_path")]
    pub socket_path: String,
    #[serde(default)]
    pub symbols: HashMap<String, SymbolConf>,
    #[serde(default)]
    pub composites: HashMap<String, CompositeConf>,
    #[serde(default)]
    pub actions: HashMap<String, ActionConf>,
    #[serde(default, alias = "group")]
    pub groups: HashMap<String, GroupConf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grow_factor: Option<f64>,
    #[serde(default)]
    pub allow_unknown: bool,
    #[serde(default)]
    pub unknown_weight: f64,
    #[serde(default)]
    pub scan: ScanConf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statistics: Option<StatisticsConfig>,
    /// Optional composites map file (`<name>:<score> <expression>` lines).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub composites_map: Option<String>,
}

fn default_socket_path() -> String {
    "/var/run/mailsieve.sock".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SymbolConf {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<String>,
    #[serde(default)]
    pub one_shot: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    /// Per-symbol async budget in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositeConf {
    pub expression: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// An action threshold, either bare (`reject: 15.0`) or with an explicit
/// tie-breaking priority.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ActionConf {
    Threshold(f64),
    Detailed {
        score: f64,
        #[serde(default)]
        priority: i32,
    },
}

impl ActionConf {
    fn score(&self) -> f64 {
        match self {
            ActionConf::Threshold(s) => *s,
            ActionConf::Detailed { score, .. } => *score,
        }
    }

    fn priority(&self) -> i32 {
        match self {
            ActionConf::Threshold(_) => 0,
            ActionConf::Detailed { priority, .. } => *priority,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupConf {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConf {
    /// Default per-symbol timeout in seconds when no augmentation is set.
    pub symbol_timeout: f64,
    /// Wall-clock budget for a whole task in seconds.
    pub task_deadline: f64,
}

impl Default for ScanConf {
    fn default() -> Self {
        ScanConf {
            symbol_timeout: 5.0,
            task_deadline: 8.0,
        }
    }
}

impl ScanConf {
    pub fn symbol_timeout_duration(&self) -> Duration {
        Duration::from_secs_f64(self.symbol_timeout)
    }

    pub fn task_deadline_duration(&self) -> Duration {
        Duration::from_secs_f64(self.task_deadline)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatisticsConfig {
    pub enabled: bool,
    pub database_path: String,
    pub flush_interval_seconds: Option<u64>,
}

impl Default for StatisticsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            database_path: "/var/lib/mailsieve/stats.db".to_string(),
            flush_interval_seconds: Some(60),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let mut symbols = HashMap::new();
        symbols.insert(
            "SUSPICIOUS_SUBJECT".to_string(),
            SymbolConf {
                score: Some(2.5),
                description: Some("Subject matches a spam pattern".to_string()),
                group: Some("content".to_string()),
                ..Default::default()
            },
        );
        symbols.insert(
            "RBL_LISTED".to_string(),
            SymbolConf {
                score: Some(5.5),
                group: Some("rbl".to_string()),
                timeout: Some(3.0),
                ..Default::default()
            },
        );
        symbols.insert(
            "HELO_BARE_IP".to_string(),
            SymbolConf {
                score: Some(1.2),
                group: Some("hfilter".to_string()),
                ..Default::default()
            },
        );
        symbols.insert(
            "SENDER_BLOCKLISTED".to_string(),
            SymbolConf {
                score: Some(8.0),
                priority: Some(10),
                one_shot: true,
                ..Default::default()
            },
        );

        let mut composites = HashMap::new();
        composites.insert(
            "SPAM_COMBO".to_string(),
            CompositeConf {
                expression: "SUSPICIOUS_SUBJECT & RBL_LISTED".to_string(),
                score: Some(4.0),
                policy: Some("remove_weight".to_string()),
                group: None,
                priority: None,
                enabled: true,
            },
        );
        composites.insert(
            "BOT_FINGERPRINT".to_string(),
            CompositeConf {
                expression: "HELO_BARE_IP & RBL_LISTED".to_string(),
                score: Some(3.0),
                policy: Some("leave".to_string()),
                group: None,
                priority: None,
                enabled: true,
            },
        );

        let mut actions = HashMap::new();
        actions.insert("greylist".to_string(), ActionConf::Threshold(4.0));
        actions.insert("add_header".to_string(), ActionConf::Threshold(6.0));
        actions.insert("rewrite_subject".to_string(), ActionConf::Threshold(8.0));
        actions.insert("reject".to_string(), ActionConf::Threshold(15.0));

        let mut groups = HashMap::new();
        groups.insert(
            "rbl".to_string(),
            GroupConf {
                max_score: Some(10.0),
                min_score: None,
                description: Some("DNS blocklists".to_string()),
            },
        );

        Config {
            socket_path: default_socket_path(),
            symbols,
            composites,
            actions,
            groups,
            grow_factor: Some(1.1),
            allow_unknown: false,
            unknown_weight: 0.0,
            scan: ScanConf::default(),
            statistics: Some(StatisticsConfig::default()),
            composites_map: None,
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Overlay configured symbol metadata onto the registered items. Must
    /// run before the cache freezes.
    pub fn apply_symbols(&self, cache: &mut SymbolCache) {
        for (name, conf) in &self.symbols {
            let Some(item) = cache.item_by_name_mut(name) else {
                // score-only definition; it still reaches the scoring table
                continue;
            };
            if let Some(score) = conf.score {
                item.weight = score;
            }
            if let Some(priority) = conf.priority {
                item.priority = priority;
            }
            if let Some(description) = &conf.description {
                item.description = Some(description.clone());
            }
            if let Some(group) = &conf.group {
                item.group = Some(group.clone());
            }
            if !conf.flags.is_empty() {
                item.flags = SymbolFlags::parse(&conf.flags);
            }
            if conf.one_shot {
                item.one_shot = true;
            }
            if let Some(timeout) = conf.timeout {
                if timeout > 0.0 {
                    item.augmentations.timeout = Some(Duration::from_secs_f64(timeout));
                }
            }
        }
    }

    /// Load configured composites into the manager. Bad definitions are
    /// logged and ignored; they never abort startup.
    pub fn apply_composites(&self, cm: &mut CompositesManager) {
        for (name, conf) in &self.composites {
            if !conf.enabled {
                log::info!("composite {name} is disabled");
                continue;
            }
            let policy = match conf.policy.as_deref() {
                None => CompositePolicy::RemoveAll,
                Some(text) => match CompositePolicy::parse(text) {
                    Some(policy) => policy,
                    None => {
                        log::error!("composite {name} has incorrect policy '{text}'");
                        continue;
                    }
                },
            };
            let score = conf.score.unwrap_or(self.unknown_weight);
            if let Err(e) = cm.add_composite(
                name,
                &conf.expression,
                score,
                policy,
                conf.group.as_deref(),
                conf.priority.unwrap_or(0),
                OnDuplicate::Refuse,
            ) {
                log::error!("cannot add composite {name}: {e}");
            }
        }
    }

    /// Build the frozen scoring table: registered items first, then
    /// configured score-only symbols, then composites.
    pub fn build_scoring(&self, cache: &SymbolCache, cm: &CompositesManager) -> Scoring {
        let mut scoring = Scoring {
            grow_factor: self.grow_factor,
            allow_unknown: self.allow_unknown,
            unknown_weight: self.unknown_weight,
            ..Default::default()
        };

        for item in cache.items() {
            scoring.symbols.insert(
                item.name.clone(),
                SymbolScore {
                    weight: item.weight,
                    one_shot: item.one_shot,
                    group: item.group.clone(),
                },
            );
        }

        for (name, conf) in &self.symbols {
            if cache.get(name).is_some() {
                continue;
            }
            scoring.symbols.insert(
                name.clone(),
                SymbolScore {
                    weight: conf.score.unwrap_or(self.unknown_weight),
                    one_shot: conf.one_shot,
                    group: conf.group.clone(),
                },
            );
        }

        for comp in cm.composites() {
            scoring.symbols.insert(
                comp.name.clone(),
                SymbolScore {
                    weight: comp.score,
                    one_shot: true,
                    group: Some(comp.group.clone()),
                },
            );
        }

        for (name, conf) in &self.actions {
            let Some(action) = Action::parse(name) else {
                log::error!("unknown action '{name}' in configuration, ignored");
                continue;
            };
            scoring.actions.push(ActionThreshold {
                action,
                threshold: conf.score(),
                priority: conf.priority(),
            });
        }

        for (name, conf) in &self.groups {
            scoring.groups.insert(
                name.clone(),
                GroupLimits {
                    max_score: conf.max_score,
                    min_score: conf.min_score,
                },
            );
        }

        scoring.finish();
        scoring
    }
}
