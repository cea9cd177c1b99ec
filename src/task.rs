use crate::io::Collaborators;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// SMTP envelope data captured by the network worker before the message body
/// arrives.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub sender_ip: Option<IpAddr>,
    pub helo: Option<String>,
    pub mail_from: Option<String>,
    pub rcpt: Vec<String>,
    pub auth_user: Option<String>,
}

/// Immutable parsed-message handle. The MIME parser lives outside the core;
/// this is the view the detection symbols consume.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Message {
    pub subject: Option<String>,
    pub from_header: Option<String>,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
    pub has_mime: bool,
}

impl Message {
    /// Case-insensitive header lookup (headers are stored lowercased).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(|s| s.as_str())
    }

    /// A message with neither subject nor body text. Symbols without the
    /// `empty` flag are not scheduled for these.
    pub fn is_empty(&self) -> bool {
        let no_subject = self.subject.as_deref().map_or(true, |s| s.trim().is_empty());
        let no_body = self.body.as_deref().map_or(true, |b| b.trim().is_empty());
        no_subject && no_body
    }
}

/// User-supplied per-task settings. The `id` matches against symbol
/// `allowed_ids`/`forbidden_ids` filters; the enable/disable lists override
/// individual symbols by name.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct TaskSettings {
    pub id: Option<String>,
    pub enabled_symbols: Vec<String>,
    pub disabled_symbols: Vec<String>,
}

impl TaskSettings {
    pub fn is_enabled(&self, symbol: &str) -> bool {
        self.enabled_symbols.iter().any(|s| s == symbol)
    }

    pub fn is_disabled(&self, symbol: &str) -> bool {
        self.disabled_symbols.iter().any(|s| s == symbol)
    }
}

/// Per-message scan context. Created on submission, dropped once the report
/// is serialized. Never shared across workers while live.
pub struct Task {
    pub message: Message,
    pub envelope: Envelope,
    pub settings: TaskSettings,
    pub collaborators: Collaborators,
    started: Instant,
    deadline: Instant,
}

impl Task {
    pub fn new(message: Message, envelope: Envelope) -> Self {
        let now = Instant::now();
        Task {
            message,
            envelope,
            settings: TaskSettings::default(),
            collaborators: Collaborators::default(),
            started: now,
            deadline: now + Duration::from_secs(8),
        }
    }

    pub fn with_settings(mut self, settings: TaskSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_deadline(mut self, budget: Duration) -> Self {
        self.deadline = self.started + budget;
        self
    }

    pub fn with_collaborators(mut self, collaborators: Collaborators) -> Self {
        self.collaborators = collaborators;
        self
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Wall-clock budget left before the task deadline.
    pub fn time_remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// A structured submission record, as handed over by a network worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanRequest {
    pub message: Message,
    #[serde(default)]
    pub envelope: Envelope,
    #[serde(default)]
    pub settings: TaskSettings,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline_ms: Option<u64>,
}

impl ScanRequest {
    pub fn into_task(self) -> Task {
        let mut task =
            Task::new(self.message, self.envelope).with_settings(self.settings);
        if let Some(ms) = self.deadline_ms {
            task = task.with_deadline(Duration::from_millis(ms));
        }
        task
    }
}

/// One symbol entry in a serialized scan report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolEntry {
    pub name: String,
    pub score: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

/// The serialized scan result handed back to the submitting worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanReport {
    pub score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required_score: Option<f64>,
    pub action: String,
    pub symbols: Vec<SymbolEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<String>,
    pub scan_time_ms: u64,
    pub fingerprint: String,
}
