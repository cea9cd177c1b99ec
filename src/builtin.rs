//! Built-in detection symbols.
//!
//! A small stock of detections registered by the demo configuration and the
//! integration tests. Real deployments register their own handlers next to
//! these through the same `SymbolCache` API.

use crate::error::ConfigError;
use crate::io::DnsRecordType;
use crate::scan::{Action, Passthrough};
use crate::symcache::{SymbolCache, SymbolDef, SymbolHandler, SymbolOutput, SymbolType};
use crate::task::Task;
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

lazy_static! {
    static ref BARE_IP_HELO: Regex =
        Regex::new(r"^\[?\d{1,3}(\.\d{1,3}){3}\]?$").unwrap();
}

/// Extract the domain part of an address like `user@example.com`.
pub fn email_domain(addr: &str) -> Option<&str> {
    let addr = addr.trim_end_matches('>');
    addr.rsplit_once('@').map(|(_, domain)| domain)
}

/// Fires when the subject matches a compiled pattern.
pub struct SubjectPattern {
    pattern: Regex,
}

impl SubjectPattern {
    pub fn new(pattern: &str) -> anyhow::Result<SubjectPattern> {
        Ok(SubjectPattern {
            pattern: Regex::new(pattern)?,
        })
    }
}

#[async_trait]
impl SymbolHandler for SubjectPattern {
    async fn run(&self, task: &Task) -> anyhow::Result<SymbolOutput> {
        let Some(subject) = task.message.subject.as_deref() else {
            return Ok(SymbolOutput::miss());
        };
        match self.pattern.find(subject) {
            Some(m) => Ok(SymbolOutput::fired(1.0).with_option(m.as_str())),
            None => Ok(SymbolOutput::miss()),
        }
    }
}

/// Fires when the envelope sender's domain is present in a blocklist map.
/// Optionally records a passthrough so the decision short-circuits the rest
/// of the scan.
pub struct SenderBlocklist {
    map_name: String,
    passthrough_priority: Option<i32>,
}

impl SenderBlocklist {
    pub fn new(map_name: impl Into<String>) -> SenderBlocklist {
        SenderBlocklist {
            map_name: map_name.into(),
            passthrough_priority: None,
        }
    }

    pub fn with_passthrough(mut self, priority: i32) -> SenderBlocklist {
        self.passthrough_priority = Some(priority);
        self
    }
}

#[async_trait]
impl SymbolHandler for SenderBlocklist {
    async fn run(&self, task: &Task) -> anyhow::Result<SymbolOutput> {
        let Some(sender) = task.envelope.mail_from.as_deref() else {
            return Ok(SymbolOutput::miss());
        };
        let Some(domain) = email_domain(sender) else {
            return Ok(SymbolOutput::miss());
        };
        let Some(map) = task.collaborators.map(&self.map_name) else {
            log::debug!("blocklist map '{}' not attached to task", self.map_name);
            return Ok(SymbolOutput::miss());
        };
        if !map.get_key(domain) {
            return Ok(SymbolOutput::miss());
        }

        let mut output = SymbolOutput::fired(1.0).with_option(domain);
        if let Some(priority) = self.passthrough_priority {
            output = output.with_passthrough(Passthrough {
                priority,
                action: Action::Reject,
                message: Some(format!("sender domain {domain} is blocklisted")),
                module: Some("sender_blocklist".to_string()),
            });
        }
        Ok(output)
    }
}

/// Fires when HELO is a bare IP address, a common botnet tell.
pub struct BareHeloIp;

#[async_trait]
impl SymbolHandler for BareHeloIp {
    async fn run(&self, task: &Task) -> anyhow::Result<SymbolOutput> {
        let Some(helo) = task.envelope.helo.as_deref() else {
            return Ok(SymbolOutput::miss());
        };
        if BARE_IP_HELO.is_match(helo) {
            Ok(SymbolOutput::fired(1.0).with_option(helo))
        } else {
            Ok(SymbolOutput::miss())
        }
    }
}

/// DNSBL lookup of the sending IP: queries `<reversed-ip>.<zone>` through
/// the task's DNS collaborator. NXDOMAIN means clean; a timeout surfaces as
/// the scheduler's TIMEOUT state for this symbol.
pub struct DnsblLookup {
    zone: String,
}

impl DnsblLookup {
    pub fn new(zone: impl Into<String>) -> DnsblLookup {
        DnsblLookup { zone: zone.into() }
    }
}

#[async_trait]
impl SymbolHandler for DnsblLookup {
    async fn run(&self, task: &Task) -> anyhow::Result<SymbolOutput> {
        let Some(IpAddr::V4(ip)) = task.envelope.sender_ip else {
            return Ok(SymbolOutput::miss());
        };
        let Some(dns) = task.collaborators.dns.as_ref() else {
            log::debug!("no dns collaborator attached, skipping dnsbl check");
            return Ok(SymbolOutput::miss());
        };

        let octets = ip.octets();
        let query = format!(
            "{}.{}.{}.{}.{}",
            octets[3], octets[2], octets[1], octets[0], self.zone
        );
        let timeout = task.time_remaining().min(Duration::from_secs(3));

        match dns.resolve(DnsRecordType::A, &query, timeout).await {
            Ok(records) if !records.is_empty() => {
                Ok(SymbolOutput::fired(1.0).with_option(records[0].clone()))
            }
            Ok(_) => Ok(SymbolOutput::miss()),
            Err(e) => {
                log::debug!("dnsbl lookup {query} returned {e}");
                Ok(SymbolOutput::miss())
            }
        }
    }
}

/// Register the stock detection set used by the demo configuration.
pub fn register_builtins(cache: &mut SymbolCache) -> Result<(), ConfigError> {
    cache.register(
        SymbolDef::new("HELO_BARE_IP", SymbolType::Connect)
            .with_weight(1.2)
            .with_description("HELO is a bare IP address")
            .with_handler(Arc::new(BareHeloIp)),
    )?;

    cache.register(
        SymbolDef::new("SENDER_BLOCKLISTED", SymbolType::Prefilter)
            .with_weight(8.0)
            .with_priority(10)
            .with_description("envelope sender domain is blocklisted")
            .with_handler(Arc::new(
                SenderBlocklist::new("sender_blocklist").with_passthrough(10),
            )),
    )?;

    cache.register(
        SymbolDef::new("SUSPICIOUS_SUBJECT", SymbolType::Filter)
            .with_weight(2.5)
            .with_description("subject matches a spam pattern")
            .with_handler(Arc::new(
                SubjectPattern::new(r"(?i)(viagra|lottery|prize|urgent wire)")
                    .expect("stock pattern compiles"),
            )),
    )?;

    cache.register(
        SymbolDef::new("RBL_LISTED", SymbolType::Filter)
            .with_weight(5.5)
            .with_timeout(Duration::from_secs(3))
            .with_description("sending IP listed in the configured DNSBL")
            .with_handler(Arc::new(DnsblLookup::new("bl.mailsieve.example"))),
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IoError;
    use crate::io::{Collaborators, DnsResolver};
    use crate::maps::StaticMap;
    use crate::task::{Envelope, Message};

    struct ListedDns;

    #[async_trait]
    impl DnsResolver for ListedDns {
        async fn resolve(
            &self,
            _rtype: DnsRecordType,
            name: &str,
            _timeout: Duration,
        ) -> Result<Vec<String>, IoError> {
            if name.starts_with("2.0.0.127.") {
                Ok(vec!["127.0.0.2".to_string()])
            } else {
                Err(IoError::Dns("NXDOMAIN".to_string()))
            }
        }
    }

    fn message(subject: &str) -> Message {
        Message {
            subject: Some(subject.to_string()),
            body: Some("body".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_subject_pattern() {
        let handler = SubjectPattern::new(r"(?i)lottery").unwrap();
        let task = Task::new(message("You won the LOTTERY"), Envelope::default());
        let output = handler.run(&task).await.unwrap();
        assert!(matches!(
            output.verdict,
            crate::symcache::SymbolVerdict::Fired { .. }
        ));

        let task = Task::new(message("weekly report"), Envelope::default());
        let output = handler.run(&task).await.unwrap();
        assert!(matches!(output.verdict, crate::symcache::SymbolVerdict::Miss));
    }

    #[tokio::test]
    async fn test_sender_blocklist_with_passthrough() {
        let map = StaticMap::from_keys(["spam.example"]);
        let collab = Collaborators::default().with_map("sender_blocklist", Arc::new(map));
        let envelope = Envelope {
            mail_from: Some("bulk@spam.example".to_string()),
            ..Default::default()
        };
        let task = Task::new(message("x"), envelope).with_collaborators(collab);

        let handler = SenderBlocklist::new("sender_blocklist").with_passthrough(10);
        let output = handler.run(&task).await.unwrap();
        let p = output.passthrough.expect("passthrough recorded");
        assert_eq!(p.action, Action::Reject);
        assert_eq!(p.priority, 10);
    }

    #[tokio::test]
    async fn test_bare_helo_ip() {
        let envelope = Envelope {
            helo: Some("[192.0.2.7]".to_string()),
            ..Default::default()
        };
        let task = Task::new(message("x"), envelope);
        let output = BareHeloIp.run(&task).await.unwrap();
        assert!(matches!(
            output.verdict,
            crate::symcache::SymbolVerdict::Fired { .. }
        ));

        let envelope = Envelope {
            helo: Some("mail.example.com".to_string()),
            ..Default::default()
        };
        let task = Task::new(message("x"), envelope);
        let output = BareHeloIp.run(&task).await.unwrap();
        assert!(matches!(output.verdict, crate::symcache::SymbolVerdict::Miss));
    }

    #[tokio::test]
    async fn test_dnsbl_lookup() {
        let collab = Collaborators::default().with_dns(Arc::new(ListedDns));
        let envelope = Envelope {
            sender_ip: Some("127.0.0.2".parse().unwrap()),
            ..Default::default()
        };
        let task = Task::new(message("x"), envelope).with_collaborators(collab.clone());
        let handler = DnsblLookup::new("bl.test");
        let output = handler.run(&task).await.unwrap();
        assert!(matches!(
            output.verdict,
            crate::symcache::SymbolVerdict::Fired { .. }
        ));

        let envelope = Envelope {
            sender_ip: Some("198.51.100.1".parse().unwrap()),
            ..Default::default()
        };
        let task = Task::new(message("x"), envelope).with_collaborators(collab);
        let output = handler.run(&task).await.unwrap();
        assert!(matches!(output.verdict, crate::symcache::SymbolVerdict::Miss));
    }

    #[test]
    fn test_email_domain() {
        assert_eq!(email_domain("user@example.com"), Some("example.com"));
        assert_eq!(email_domain("<user@sub.example.org>"), Some("sub.example.org"));
        assert_eq!(email_domain("no-at-sign"), None);
    }
}
