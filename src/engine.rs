use crate::composites::{self, CompositesManager};
use crate::config::Config;
use crate::error::ConfigError;
use crate::scan::{ScanResult, Scoring};
use crate::statistics::{StatEvent, StatisticsCollector};
use crate::symcache::{run_phase, Phase, SchedulerOpts, SymbolCache};
use crate::task::{ScanReport, SymbolEntry, Task};
use std::sync::Arc;
use std::time::Instant;

/// The frozen scan engine: a shared read-only symbol cache, classified
/// composites and scoring table, driving tasks through the full phase
/// sequence.
pub struct ScanEngine {
    cache: SymbolCache,
    composites: CompositesManager,
    scoring: Arc<Scoring>,
    opts: SchedulerOpts,
    stats: Option<Arc<StatisticsCollector>>,
}

impl ScanEngine {
    /// Overlay configuration on the registered symbols, freeze the cache,
    /// classify composites and build the scoring table.
    pub fn new(
        mut cache: SymbolCache,
        mut composites: CompositesManager,
        config: &Config,
    ) -> ScanEngine {
        config.apply_symbols(&mut cache);
        config.apply_composites(&mut composites);
        if let Some(path) = &config.composites_map {
            match composites.load_map_file(std::path::Path::new(path)) {
                Ok(n) => log::info!("loaded {n} composites from map {path}"),
                Err(e) => log::error!("composites map {path}: {e}"),
            }
        }

        cache.freeze();
        composites.process_dependencies(&cache);
        let scoring = Arc::new(config.build_scoring(&cache, &composites));

        ScanEngine {
            cache,
            composites,
            scoring,
            opts: SchedulerOpts {
                default_timeout: config.scan.symbol_timeout_duration(),
                ..Default::default()
            },
            stats: None,
        }
    }

    pub fn with_statistics(mut self, stats: Arc<StatisticsCollector>) -> ScanEngine {
        self.stats = Some(stats);
        self
    }

    pub fn cache(&self) -> &SymbolCache {
        &self.cache
    }

    pub fn composites(&self) -> &CompositesManager {
        &self.composites
    }

    pub fn scoring(&self) -> Arc<Scoring> {
        self.scoring.clone()
    }

    /// Run one task through the full sequence: the four symbol phases, the
    /// first composite pass, postfilters, the second composite pass and the
    /// idempotent phase, then compute the action.
    pub async fn scan(&self, task: &Task) -> Result<ScanReport, ConfigError> {
        let started = Instant::now();
        let mut result = ScanResult::new(self.scoring.clone());

        for phase in [
            Phase::Connect,
            Phase::Prefilter,
            Phase::Filter,
            Phase::Classifier,
        ] {
            let report = run_phase(&self.cache, phase, task, &mut result, &self.opts).await?;
            log_phase(phase, &report);
        }

        composites::process(&mut result, &self.composites.first_pass());

        let report = run_phase(&self.cache, Phase::Postfilter, task, &mut result, &self.opts).await?;
        log_phase(Phase::Postfilter, &report);

        composites::process(&mut result, &self.composites.second_pass());

        let report = run_phase(&self.cache, Phase::Idempotent, task, &mut result, &self.opts).await?;
        log_phase(Phase::Idempotent, &report);

        let (action, message) = result.action();
        let scan_time_ms = started.elapsed().as_millis() as u64;

        if let Some(stats) = &self.stats {
            for rec in result.records() {
                stats.record_event(StatEvent::SymbolHit {
                    symbol: rec.name.clone(),
                });
            }
            stats.record_event(StatEvent::ScanCompleted {
                action: action.to_string(),
                scan_time_ms,
            });
        }

        let symbols = result
            .records()
            .map(|rec| SymbolEntry {
                name: rec.name.clone(),
                score: rec.score,
                options: rec.options.clone(),
            })
            .collect();

        Ok(ScanReport {
            score: result.score(),
            required_score: self.scoring.threshold_for(crate::scan::Action::Reject),
            action: action.to_string(),
            symbols,
            messages: message.into_iter().collect(),
            scan_time_ms,
            fingerprint: format!("{:016x}", self.cache.fingerprint()),
        })
    }
}

fn log_phase(phase: Phase, report: &crate::symcache::scheduler::PhaseReport) {
    if !report.failed.is_empty() || !report.timed_out.is_empty() {
        log::warn!(
            "{phase:?} phase: fired={} skipped={} failed={:?} timed_out={:?}",
            report.fired.len(),
            report.skipped.len(),
            report.failed,
            report.timed_out
        );
    } else {
        log::debug!(
            "{phase:?} phase: fired={} skipped={}",
            report.fired.len(),
            report.skipped.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin;
    use crate::io::Collaborators;
    use crate::maps::StaticMap;
    use crate::symcache::{SymbolDef, SymbolHandler, SymbolOutput, SymbolType};
    use crate::task::{Envelope, Message, Task};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    struct AlwaysFire {
        trace: Arc<Mutex<Vec<String>>>,
        name: String,
    }

    #[async_trait]
    impl SymbolHandler for AlwaysFire {
        async fn run(&self, _task: &Task) -> anyhow::Result<SymbolOutput> {
            self.trace.lock().unwrap().push(self.name.clone());
            Ok(SymbolOutput::fired(1.0))
        }
    }

    fn spam_message() -> Message {
        Message {
            subject: Some("URGENT wire transfer lottery".to_string()),
            body: Some("you have won".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_two_phase_composite_fires_after_postfilter() {
        let _ = env_logger::builder().is_test(true).try_init();
        let trace = Arc::new(Mutex::new(Vec::new()));

        let mut cache = SymbolCache::new();
        cache
            .register(
                SymbolDef::new("F", SymbolType::Filter)
                    .with_weight(1.0)
                    .with_handler(Arc::new(AlwaysFire {
                        trace: trace.clone(),
                        name: "F".to_string(),
                    })),
            )
            .unwrap();
        cache
            .register(
                SymbolDef::new("PF", SymbolType::Postfilter)
                    .with_weight(1.0)
                    .with_handler(Arc::new(AlwaysFire {
                        trace: trace.clone(),
                        name: "PF".to_string(),
                    })),
            )
            .unwrap();

        let mut config = Config::default();
        config.symbols.clear();
        config.composites.clear();
        config.composites.insert(
            "X".to_string(),
            crate::config::CompositeConf {
                expression: "F & PF".to_string(),
                score: Some(3.0),
                policy: Some("leave".to_string()),
                group: None,
                priority: None,
                enabled: true,
            },
        );

        let engine = ScanEngine::new(cache, CompositesManager::new(), &config);
        // classified into the second pass because PF is a postfilter
        assert!(engine.composites().find("X").unwrap().second_pass);

        let task = Task::new(spam_message(), Envelope::default())
            .with_deadline(Duration::from_secs(5));
        let report = engine.scan(&task).await.unwrap();

        let names: Vec<&str> = report.symbols.iter().map(|s| s.name.as_str()).collect();
        assert!(names.contains(&"F"));
        assert!(names.contains(&"PF"));
        assert!(names.contains(&"X"));
        assert!((report.score - 5.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_end_to_end_demo_scan() {
        let _ = env_logger::builder().is_test(true).try_init();

        let mut cache = SymbolCache::new();
        builtin::register_builtins(&mut cache).unwrap();
        let config = Config::default();
        let engine = ScanEngine::new(cache, CompositesManager::new(), &config);

        let blocklist = StaticMap::from_keys(["spam.example"]);
        let collab =
            Collaborators::default().with_map("sender_blocklist", Arc::new(blocklist));

        let envelope = Envelope {
            mail_from: Some("bulk@spam.example".to_string()),
            helo: Some("[192.0.2.7]".to_string()),
            ..Default::default()
        };
        let task = Task::new(spam_message(), envelope)
            .with_collaborators(collab)
            .with_deadline(Duration::from_secs(5));

        let report = engine.scan(&task).await.unwrap();

        // the blocklist passthrough decides the action
        assert_eq!(report.action, "reject");
        assert_eq!(report.messages.len(), 1);
        assert!(report.messages[0].contains("spam.example"));

        // passthrough does not erase recorded symbols; SUSPICIOUS_SUBJECT
        // is suppressed (priority 0 < 10) but the blocklist symbol is there
        let names: Vec<&str> = report.symbols.iter().map(|s| s.name.as_str()).collect();
        assert!(names.contains(&"SENDER_BLOCKLISTED"));
        assert!(!names.contains(&"SUSPICIOUS_SUBJECT"));
    }

    #[tokio::test]
    async fn test_scan_without_passthrough_selects_by_score() {
        let mut cache = SymbolCache::new();
        builtin::register_builtins(&mut cache).unwrap();
        let config = Config::default();
        let engine = ScanEngine::new(cache, CompositesManager::new(), &config);

        // no blocklist map attached: only subject + bare HELO fire
        let envelope = Envelope {
            helo: Some("[192.0.2.7]".to_string()),
            ..Default::default()
        };
        let task = Task::new(spam_message(), envelope).with_deadline(Duration::from_secs(5));
        let report = engine.scan(&task).await.unwrap();

        // 2.5 (subject) + 1.2 (helo) = 3.7, below the greylist threshold
        assert!((report.score - 3.7).abs() < 1e-9);
        assert_eq!(report.action, "no_action");
    }

    #[tokio::test]
    async fn test_remove_weight_composite_end_to_end() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let mut cache = SymbolCache::new();
        for name in ["A", "B"] {
            cache
                .register(
                    SymbolDef::new(name, SymbolType::Filter)
                        .with_weight(if name == "A" { 1.0 } else { 2.0 })
                        .with_handler(Arc::new(AlwaysFire {
                            trace: trace.clone(),
                            name: name.to_string(),
                        })),
                )
                .unwrap();
        }

        let mut config = Config::default();
        config.symbols.clear();
        config.composites.clear();
        config.composites.insert(
            "C".to_string(),
            crate::config::CompositeConf {
                expression: "A & B".to_string(),
                score: Some(5.0),
                policy: Some("remove_weight".to_string()),
                group: None,
                priority: None,
                enabled: true,
            },
        );

        let engine = ScanEngine::new(cache, CompositesManager::new(), &config);
        let task = Task::new(spam_message(), Envelope::default())
            .with_deadline(Duration::from_secs(5));
        let report = engine.scan(&task).await.unwrap();

        let by_name: HashMap<&str, f64> = report
            .symbols
            .iter()
            .map(|s| (s.name.as_str(), s.score))
            .collect();
        assert_eq!(by_name["A"], 0.0);
        assert_eq!(by_name["B"], 0.0);
        assert_eq!(by_name["C"], 5.0);
        assert!((report.score - 5.0).abs() < 1e-9);
    }
}
