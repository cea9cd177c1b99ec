use crate::scan::Passthrough;
use crate::task::Task;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

pub type SymbolId = usize;

/// Registered symbol kinds. The type decides which scheduling phase an item
/// executes in; `virtual` items execute through their parent and `composite`
/// entries only carry scoring metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymbolType {
    Connect,
    Prefilter,
    Filter,
    Classifier,
    Composite,
    Postfilter,
    Idempotent,
    Virtual,
    Callback,
}

impl SymbolType {
    pub fn parse(name: &str) -> Option<SymbolType> {
        match name {
            "connect" => Some(SymbolType::Connect),
            "prefilter" => Some(SymbolType::Prefilter),
            "filter" | "normal" => Some(SymbolType::Filter),
            "classifier" => Some(SymbolType::Classifier),
            "composite" => Some(SymbolType::Composite),
            "postfilter" => Some(SymbolType::Postfilter),
            "idempotent" => Some(SymbolType::Idempotent),
            "virtual" => Some(SymbolType::Virtual),
            "callback" => Some(SymbolType::Callback),
            _ => None,
        }
    }
}

/// Symbol scheduling phases, in execution order. Composite evaluation runs
/// between `Classifier` and `Postfilter` (first pass) and between
/// `Postfilter` and `Idempotent` (second pass), driven by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Connect,
    Prefilter,
    Filter,
    Classifier,
    Postfilter,
    Idempotent,
}

pub const PHASE_ORDER: [Phase; 6] = [
    Phase::Connect,
    Phase::Prefilter,
    Phase::Filter,
    Phase::Classifier,
    Phase::Postfilter,
    Phase::Idempotent,
];

impl Phase {
    pub fn index(&self) -> usize {
        match self {
            Phase::Connect => 0,
            Phase::Prefilter => 1,
            Phase::Filter => 2,
            Phase::Classifier => 3,
            Phase::Postfilter => 4,
            Phase::Idempotent => 5,
        }
    }
}

impl SymbolType {
    /// The phase an item of this type executes in; `None` for entries that
    /// never enter the scheduler directly.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            SymbolType::Connect => Some(Phase::Connect),
            SymbolType::Prefilter => Some(Phase::Prefilter),
            SymbolType::Filter | SymbolType::Callback => Some(Phase::Filter),
            SymbolType::Classifier => Some(Phase::Classifier),
            SymbolType::Postfilter => Some(Phase::Postfilter),
            SymbolType::Idempotent => Some(Phase::Idempotent),
            SymbolType::Virtual | SymbolType::Composite => None,
        }
    }
}

/// Behavior flags carried by a symbol registration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SymbolFlags {
    pub fine: bool,
    pub empty: bool,
    pub nostat: bool,
    pub explicit_disable: bool,
    pub ignore_passthrough: bool,
    pub mime: bool,
    pub coro: bool,
    pub no_squeeze: bool,
}

impl SymbolFlags {
    /// Parse a flag list as it appears in configuration. Unknown flags are
    /// logged and ignored.
    pub fn parse(names: &[String]) -> SymbolFlags {
        let mut flags = SymbolFlags::default();
        for name in names {
            match name.as_str() {
                "fine" => flags.fine = true,
                "empty" => flags.empty = true,
                "nostat" => flags.nostat = true,
                "explicit_disable" => flags.explicit_disable = true,
                "ignore_passthrough" => flags.ignore_passthrough = true,
                "mime" => flags.mime = true,
                "coro" => flags.coro = true,
                "no_squeeze" => flags.no_squeeze = true,
                other => log::warn!("unknown symbol flag '{other}' ignored"),
            }
        }
        flags
    }
}

/// Free-form `key=value` augmentations attached at registration. Only
/// `timeout` is interpreted by the scheduler today.
#[derive(Debug, Clone, Default)]
pub struct Augmentations {
    pub timeout: Option<Duration>,
}

impl Augmentations {
    pub fn parse(items: &[String]) -> Augmentations {
        let mut aug = Augmentations::default();
        for item in items {
            match item.split_once('=') {
                Some(("timeout", value)) => match value.parse::<f64>() {
                    Ok(secs) if secs > 0.0 => {
                        aug.timeout = Some(Duration::from_secs_f64(secs));
                    }
                    _ => log::warn!("invalid timeout augmentation '{item}'"),
                },
                _ => log::debug!("unhandled augmentation '{item}'"),
            }
        }
        aug
    }
}

/// A dependency edge declared by name. Soft edges tolerate failed or
/// timed-out predecessors; hard edges skip the dependent instead.
#[derive(Debug, Clone)]
pub struct DepSpec {
    pub name: String,
    pub soft: bool,
}

impl DepSpec {
    /// Dependency names in configuration may carry a `?` prefix to mark the
    /// edge soft.
    pub fn parse(name: &str) -> DepSpec {
        match name.strip_prefix('?') {
            Some(rest) => DepSpec {
                name: rest.to_string(),
                soft: true,
            },
            None => DepSpec {
                name: name.to_string(),
                soft: false,
            },
        }
    }
}

/// What one callback invocation produced.
#[derive(Debug, Clone)]
pub enum SymbolVerdict {
    /// The symbol did not match.
    Miss,
    /// The symbol matched with a score multiplier and option strings.
    Fired {
        multiplier: f64,
        options: Vec<String>,
    },
}

/// A nested sub-symbol result emitted by a parent callback on behalf of a
/// virtual child.
#[derive(Debug, Clone)]
pub struct ExtraResult {
    pub symbol: String,
    pub multiplier: f64,
    pub options: Vec<String>,
}

/// Everything a symbol callback hands back to the scheduler.
#[derive(Debug, Clone)]
pub struct SymbolOutput {
    pub verdict: SymbolVerdict,
    pub extra: Vec<ExtraResult>,
    pub passthrough: Option<Passthrough>,
}

impl SymbolOutput {
    pub fn miss() -> SymbolOutput {
        SymbolOutput {
            verdict: SymbolVerdict::Miss,
            extra: Vec::new(),
            passthrough: None,
        }
    }

    pub fn fired(multiplier: f64) -> SymbolOutput {
        SymbolOutput {
            verdict: SymbolVerdict::Fired {
                multiplier,
                options: Vec::new(),
            },
            extra: Vec::new(),
            passthrough: None,
        }
    }

    pub fn with_option(mut self, option: impl Into<String>) -> SymbolOutput {
        if let SymbolVerdict::Fired { options, .. } = &mut self.verdict {
            options.push(option.into());
        }
        self
    }

    pub fn with_extra(mut self, symbol: impl Into<String>, multiplier: f64) -> SymbolOutput {
        self.extra.push(ExtraResult {
            symbol: symbol.into(),
            multiplier,
            options: Vec::new(),
        });
        self
    }

    pub fn with_passthrough(mut self, passthrough: Passthrough) -> SymbolOutput {
        self.passthrough = Some(passthrough);
        self
    }
}

/// A symbol callback. Synchronous work returns directly; non-blocking I/O
/// awaits a collaborator inside `run` and the scheduler enforces the
/// per-symbol timeout around the whole invocation.
#[async_trait]
pub trait SymbolHandler: Send + Sync {
    async fn run(&self, task: &Task) -> anyhow::Result<SymbolOutput>;
}

/// A pre-execution predicate; returning `false` skips the symbol for this
/// task.
pub trait SymbolCondition: Send + Sync {
    fn check(&self, task: &Task) -> bool;
}

impl<F> SymbolCondition for F
where
    F: Fn(&Task) -> bool + Send + Sync,
{
    fn check(&self, task: &Task) -> bool {
        self(task)
    }
}

/// A registered symbol item. Immutable once the registry is frozen.
pub struct SymbolItem {
    pub id: SymbolId,
    pub name: String,
    pub stype: SymbolType,
    pub flags: SymbolFlags,
    pub priority: i32,
    pub weight: f64,
    pub one_shot: bool,
    pub group: Option<String>,
    pub description: Option<String>,
    pub parent: Option<SymbolId>,
    pub deps: Vec<DepSpec>,
    pub allowed_ids: Vec<String>,
    pub forbidden_ids: Vec<String>,
    pub augmentations: Augmentations,
    pub handler: Option<Arc<dyn SymbolHandler>>,
    pub conditions: Vec<Arc<dyn SymbolCondition>>,
}

impl SymbolItem {
    /// Whether this item is driven by the scheduler (has a phase and a
    /// callback of its own).
    pub fn is_schedulable(&self) -> bool {
        self.stype.phase().is_some() && self.handler.is_some()
    }
}

impl std::fmt::Debug for SymbolItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymbolItem")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("stype", &self.stype)
            .field("priority", &self.priority)
            .field("weight", &self.weight)
            .field("deps", &self.deps)
            .finish()
    }
}

/// Builder for a symbol registration.
pub struct SymbolDef {
    pub name: String,
    pub stype: SymbolType,
    pub flags: SymbolFlags,
    pub priority: i32,
    pub weight: f64,
    pub one_shot: bool,
    pub group: Option<String>,
    pub description: Option<String>,
    pub parent: Option<String>,
    pub deps: Vec<DepSpec>,
    pub allowed_ids: Vec<String>,
    pub forbidden_ids: Vec<String>,
    pub augmentations: Augmentations,
    pub handler: Option<Arc<dyn SymbolHandler>>,
}

impl SymbolDef {
    pub fn new(name: impl Into<String>, stype: SymbolType) -> SymbolDef {
        SymbolDef {
            name: name.into(),
            stype,
            flags: SymbolFlags::default(),
            priority: 0,
            weight: 0.0,
            one_shot: false,
            group: None,
            description: None,
            parent: None,
            deps: Vec::new(),
            allowed_ids: Vec::new(),
            forbidden_ids: Vec::new(),
            augmentations: Augmentations::default(),
            handler: None,
        }
    }

    pub fn with_weight(mut self, weight: f64) -> SymbolDef {
        self.weight = weight;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> SymbolDef {
        self.priority = priority;
        self
    }

    pub fn with_flags(mut self, flags: SymbolFlags) -> SymbolDef {
        self.flags = flags;
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> SymbolDef {
        self.group = Some(group.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> SymbolDef {
        self.description = Some(description.into());
        self
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> SymbolDef {
        self.parent = Some(parent.into());
        self
    }

    pub fn with_dependency(mut self, name: impl Into<String>) -> SymbolDef {
        self.deps.push(DepSpec {
            name: name.into(),
            soft: false,
        });
        self
    }

    pub fn with_soft_dependency(mut self, name: impl Into<String>) -> SymbolDef {
        self.deps.push(DepSpec {
            name: name.into(),
            soft: true,
        });
        self
    }

    pub fn with_allowed_ids(mut self, ids: Vec<String>) -> SymbolDef {
        self.allowed_ids = ids;
        self
    }

    pub fn with_forbidden_ids(mut self, ids: Vec<String>) -> SymbolDef {
        self.forbidden_ids = ids;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> SymbolDef {
        self.augmentations.timeout = Some(timeout);
        self
    }

    pub fn with_one_shot(mut self, one_shot: bool) -> SymbolDef {
        self.one_shot = one_shot;
        self
    }

    pub fn with_handler(mut self, handler: Arc<dyn SymbolHandler>) -> SymbolDef {
        self.handler = Some(handler);
        self
    }
}
