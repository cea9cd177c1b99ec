use thiserror::Error;

/// Configuration-integrity errors raised while building or freezing the
/// symbol registry and composite set. Individual bad definitions are logged
/// and dropped by the callers; only errors that would leave the scheduler
/// non-deterministic abort startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("symbol '{0}' is already registered")]
    DuplicateSymbol(String),

    #[error("symbol '{name}' names parent '{parent}' which is not a registered callback symbol")]
    InvalidParent { name: String, parent: String },

    #[error("virtual symbol '{0}' requires a parent")]
    MissingParent(String),

    #[error("cannot register '{0}': registry is frozen")]
    Frozen(String),

    #[error("unknown symbol '{0}'")]
    UnknownSymbol(String),

    #[error("registry must be frozen before scanning")]
    NotFrozen,

    #[error("composite '{name}': {reason}")]
    BadComposite { name: String, reason: String },

    #[error("unknown composite policy '{0}'")]
    UnknownPolicy(String),

    #[error("unknown action '{0}'")]
    UnknownAction(String),
}

/// Map reload failures. The previous map contents are always retained when
/// reload fails.
#[derive(Debug, Error)]
pub enum MapError {
    #[error("cannot read map file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("map line {line} is malformed: {text}")]
    BadLine { line: usize, text: String },
}

/// Errors delivered by I/O collaborators (DNS, HTTP, key-value store) to the
/// originating symbol callback. These never abort a task; the symbol decides
/// whether to record a failure symbol.
#[derive(Debug, Clone, Error)]
pub enum IoError {
    #[error("dns failure: {0}")]
    Dns(String),

    #[error("http failure: {0}")]
    Http(String),

    #[error("kv failure: {0}")]
    Kv(String),

    #[error("operation timed out")]
    Timeout,
}
