use super::item::{Phase, SymbolId, SymbolItem, SymbolOutput, SymbolVerdict};
use super::SymbolCache;
use crate::error::ConfigError;
use crate::scan::ScanResult;
use crate::task::Task;
use futures_util::future::FutureExt;
use futures_util::stream::{FuturesUnordered, StreamExt};
use std::collections::{BinaryHeap, HashMap};
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::timeout;

/// Per-task state of one scheduled item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    Pending,
    Runnable,
    Running,
    DoneFired,
    DoneNotFired,
    Skipped,
    Failed,
    Timeout,
}

impl ItemState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ItemState::DoneFired
                | ItemState::DoneNotFired
                | ItemState::Skipped
                | ItemState::Failed
                | ItemState::Timeout
        )
    }

    fn is_hard_failure(&self) -> bool {
        matches!(self, ItemState::Failed | ItemState::Timeout)
    }
}

/// Scheduler tunables shared by all phases of a scan.
#[derive(Debug, Clone)]
pub struct SchedulerOpts {
    /// Timeout applied to a symbol without a `timeout` augmentation.
    pub default_timeout: Duration,
    /// Callbacks running past this budget are logged.
    pub soft_budget: Duration,
}

impl Default for SchedulerOpts {
    fn default() -> Self {
        SchedulerOpts {
            default_timeout: Duration::from_secs(5),
            soft_budget: Duration::from_millis(50),
        }
    }
}

/// What happened to the items of one phase, for logging and tests.
#[derive(Debug, Default)]
pub struct PhaseReport {
    pub fired: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<String>,
    pub timed_out: Vec<String>,
}

enum RunOutcome {
    Output(anyhow::Result<SymbolOutput>),
    Panicked,
    TimedOut,
}

type RunFuture<'a> =
    Pin<Box<dyn std::future::Future<Output = (SymbolId, RunOutcome)> + Send + 'a>>;

/// Drive every schedulable item of `phase` to a terminal state. Items start
/// in deterministic (dependency, priority desc, name asc) order; callbacks
/// interleave only at await points, and a dependent never starts before all
/// its non-soft predecessors have finished.
pub async fn run_phase(
    cache: &SymbolCache,
    phase: Phase,
    task: &Task,
    result: &mut ScanResult,
    opts: &SchedulerOpts,
) -> Result<PhaseReport, ConfigError> {
    let plan = cache.plan().ok_or(ConfigError::NotFrozen)?;
    let order = plan.phase_order(phase);
    let mut report = PhaseReport::default();
    if order.is_empty() {
        return Ok(report);
    }

    let mut states: HashMap<SymbolId, ItemState> =
        order.iter().map(|&id| (id, ItemState::Pending)).collect();
    let mut ready = BinaryHeap::new();
    for &id in order {
        let node = plan.node(id).expect("frozen plan covers phase items");
        if node.predecessors.is_empty() {
            states.insert(id, ItemState::Runnable);
            ready.push(cache.ready_key(id));
        }
    }

    let mut in_flight: FuturesUnordered<RunFuture<'_>> = FuturesUnordered::new();

    loop {
        // Harvest callbacks that have already finished so their results
        // (and any recorded passthrough) are visible before the next item
        // is started.
        while let Some(Some((id, outcome))) = in_flight.next().now_or_never() {
            let state = resolve_outcome(cache, id, outcome, result);
            settle(cache, id, state, &mut states, &mut ready, &mut report);
        }

        if let Some(key) = ready.pop() {
            let id = key.id;
            let item = cache.item(id);

            if let Some(reason) = skip_reason(item, task, result) {
                log::debug!("symbol {} skipped: {}", item.name, reason);
                settle(
                    cache, id, ItemState::Skipped, &mut states, &mut ready, &mut report,
                );
                continue;
            }

            states.insert(id, ItemState::Running);
            let handler = item.handler.clone().expect("schedulable item has handler");
            let budget = item
                .augmentations
                .timeout
                .unwrap_or(opts.default_timeout)
                .min(task.time_remaining());
            let soft_budget = opts.soft_budget;
            let name = item.name.clone();

            in_flight.push(Box::pin(async move {
                if budget.is_zero() {
                    return (id, RunOutcome::TimedOut);
                }
                let started = std::time::Instant::now();
                let outcome =
                    match timeout(budget, AssertUnwindSafe(handler.run(task)).catch_unwind()).await
                    {
                        Ok(Ok(res)) => RunOutcome::Output(res),
                        Ok(Err(_)) => RunOutcome::Panicked,
                        Err(_) => RunOutcome::TimedOut,
                    };
                let elapsed = started.elapsed();
                if elapsed > soft_budget && !matches!(outcome, RunOutcome::TimedOut) {
                    log::debug!(
                        "symbol {name} ran for {}ms, over the {}ms soft budget",
                        elapsed.as_millis(),
                        soft_budget.as_millis()
                    );
                }
                (id, outcome)
            }));
            continue;
        }

        if in_flight.is_empty() {
            break;
        }

        let Some((id, outcome)) = in_flight.next().await else {
            break;
        };
        let state = resolve_outcome(cache, id, outcome, result);
        settle(cache, id, state, &mut states, &mut ready, &mut report);
    }

    Ok(report)
}

fn resolve_outcome(
    cache: &SymbolCache,
    id: SymbolId,
    outcome: RunOutcome,
    result: &mut ScanResult,
) -> ItemState {
    let item = cache.item(id);
    match outcome {
        RunOutcome::Output(Ok(output)) => apply_output(item, output, result),
        RunOutcome::Output(Err(e)) => {
            log::error!("symbol {} failed: {e:#}", item.name);
            ItemState::Failed
        }
        RunOutcome::Panicked => {
            log::error!("symbol {} panicked, containing", item.name);
            ItemState::Failed
        }
        RunOutcome::TimedOut => {
            log::warn!("symbol {} timed out", item.name);
            record_fail_symbol(cache, item, result);
            ItemState::Timeout
        }
    }
}

/// Pre-invocation filters: settings id gates, explicit enable/disable,
/// empty/mime message gates, registered conditions and the passthrough
/// short-circuit.
fn skip_reason(item: &SymbolItem, task: &Task, result: &ScanResult) -> Option<&'static str> {
    let settings = &task.settings;

    if !item.allowed_ids.is_empty() {
        match &settings.id {
            Some(id) if item.allowed_ids.contains(id) => {}
            _ => return Some("settings id not in allowed_ids"),
        }
    }
    if let Some(id) = &settings.id {
        if item.forbidden_ids.contains(id) {
            return Some("settings id in forbidden_ids");
        }
    }
    if settings.is_disabled(&item.name) {
        return Some("disabled by settings");
    }
    if item.flags.explicit_disable && !settings.is_enabled(&item.name) {
        return Some("not explicitly enabled");
    }
    if task.message.is_empty() && !item.flags.empty {
        return Some("message is empty");
    }
    if item.flags.mime && !task.message.has_mime {
        return Some("message has no mime structure");
    }
    if item.conditions.iter().any(|c| !c.check(task)) {
        return Some("condition returned skip");
    }
    if let Some(p) = result.top_passthrough() {
        if item.priority < p.priority && !item.flags.ignore_passthrough {
            return Some("suppressed by passthrough");
        }
    }
    None
}

fn apply_output(item: &SymbolItem, output: SymbolOutput, result: &mut ScanResult) -> ItemState {
    let state = match output.verdict {
        SymbolVerdict::Fired {
            multiplier,
            options,
        } => {
            let opts: Vec<&str> = options.iter().map(|s| s.as_str()).collect();
            result.insert(&item.name, multiplier, &opts);
            ItemState::DoneFired
        }
        SymbolVerdict::Miss => ItemState::DoneNotFired,
    };
    for extra in output.extra {
        let opts: Vec<&str> = extra.options.iter().map(|s| s.as_str()).collect();
        result.insert(&extra.symbol, extra.multiplier, &opts);
    }
    if let Some(p) = output.passthrough {
        result.add_passthrough(p);
    }
    state
}

/// Record the synthetic `<SYMBOL>_FAIL` counterpart on timeout, if one was
/// registered.
fn record_fail_symbol(cache: &SymbolCache, item: &SymbolItem, result: &mut ScanResult) {
    let fail_name = format!("{}_FAIL", item.name);
    if cache.get(&fail_name).is_some() {
        result.insert(&fail_name, 1.0, &["timeout"]);
    }
}

/// Commit a terminal state and walk forward edges: dependents of a hard
/// failure are transitively skipped; dependents whose predecessors are all
/// settled become runnable.
fn settle(
    cache: &SymbolCache,
    id: SymbolId,
    state: ItemState,
    states: &mut HashMap<SymbolId, ItemState>,
    ready: &mut BinaryHeap<super::ReadyKey>,
    report: &mut PhaseReport,
) {
    let plan = cache.plan().expect("settle runs on a frozen cache");
    let mut work = vec![(id, state)];

    while let Some((id, state)) = work.pop() {
        states.insert(id, state);
        let name = &cache.item(id).name;
        match state {
            ItemState::DoneFired => report.fired.push(name.clone()),
            ItemState::Skipped => report.skipped.push(name.clone()),
            ItemState::Failed => report.failed.push(name.clone()),
            ItemState::Timeout => report.timed_out.push(name.clone()),
            _ => {}
        }

        let Some(node) = plan.node(id) else { continue };
        for &succ in &node.successors {
            if states.get(&succ) != Some(&ItemState::Pending) {
                continue;
            }
            let succ_node = plan.node(succ).expect("successor is planned");
            let mut all_settled = true;
            let mut hard_failure = false;
            for &(pred, soft) in &succ_node.predecessors {
                let pred_state = states.get(&pred).copied().unwrap_or(ItemState::Pending);
                if !pred_state.is_terminal() {
                    all_settled = false;
                } else if pred_state.is_hard_failure() && !soft {
                    hard_failure = true;
                }
            }
            if hard_failure {
                log::debug!(
                    "symbol {} skipped: predecessor failed or timed out",
                    cache.item(succ).name
                );
                work.push((succ, ItemState::Skipped));
            } else if all_settled {
                states.insert(succ, ItemState::Runnable);
                ready.push(cache.ready_key(succ));
            }
        }
    }
}
