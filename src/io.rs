//! I/O collaborator interfaces and their production implementations.
//!
//! The scan core only sees these traits; symbol callbacks reach DNS, HTTP
//! and the key-value store through the `Collaborators` handle on the task.
//! Every operation takes an explicit timeout and reports `IoError` as a
//! normal result, never aborting the task.

use crate::error::IoError;
use crate::maps::Map;
use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// DNS record types the core dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsRecordType {
    A,
    Mx,
    Txt,
}

#[async_trait]
pub trait DnsResolver: Send + Sync {
    async fn resolve(
        &self,
        rtype: DnsRecordType,
        name: &str,
        timeout: Duration,
    ) -> Result<Vec<String>, IoError>;
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

#[async_trait]
pub trait HttpClient: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    async fn request(
        &self,
        method: &str,
        url: &str,
        headers: &[(String, String)],
        body: Option<Vec<u8>>,
        max_size: usize,
        timeout: Duration,
    ) -> Result<HttpResponse, IoError>;
}

/// Cross-message key-value state (counters, greylist buckets, reputation).
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn command(
        &self,
        key: &str,
        write: bool,
        args: &[String],
    ) -> Result<Option<String>, IoError>;
}

/// The collaborator handles a task carries into its symbol callbacks.
#[derive(Default, Clone)]
pub struct Collaborators {
    pub dns: Option<Arc<dyn DnsResolver>>,
    pub http: Option<Arc<dyn HttpClient>>,
    pub kv: Option<Arc<dyn KvStore>>,
    pub maps: HashMap<String, Arc<dyn Map>>,
}

impl Collaborators {
    pub fn with_dns(mut self, dns: Arc<dyn DnsResolver>) -> Self {
        self.dns = Some(dns);
        self
    }

    pub fn with_http(mut self, http: Arc<dyn HttpClient>) -> Self {
        self.http = Some(http);
        self
    }

    pub fn with_kv(mut self, kv: Arc<dyn KvStore>) -> Self {
        self.kv = Some(kv);
        self
    }

    pub fn with_map(mut self, name: impl Into<String>, map: Arc<dyn Map>) -> Self {
        self.maps.insert(name.into(), map);
        self
    }

    pub fn map(&self, name: &str) -> Option<&Arc<dyn Map>> {
        self.maps.get(name)
    }
}

/// System-configured resolver backed by hickory.
pub struct HickoryDns {
    resolver: TokioAsyncResolver,
}

impl HickoryDns {
    pub fn from_system_conf() -> Result<HickoryDns, IoError> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf()
            .map_err(|e| IoError::Dns(e.to_string()))?;
        Ok(HickoryDns { resolver })
    }
}

#[async_trait]
impl DnsResolver for HickoryDns {
    async fn resolve(
        &self,
        rtype: DnsRecordType,
        name: &str,
        timeout: Duration,
    ) -> Result<Vec<String>, IoError> {
        log::debug!("dns lookup {rtype:?} {name} (timeout {}ms)", timeout.as_millis());
        let run = async {
            match rtype {
                DnsRecordType::A => self
                    .resolver
                    .lookup_ip(name)
                    .await
                    .map(|r| r.iter().map(|ip| ip.to_string()).collect::<Vec<_>>()),
                DnsRecordType::Mx => self
                    .resolver
                    .mx_lookup(name)
                    .await
                    .map(|r| r.iter().map(|mx| mx.exchange().to_string()).collect()),
                DnsRecordType::Txt => self
                    .resolver
                    .txt_lookup(name)
                    .await
                    .map(|r| r.iter().map(|txt| txt.to_string()).collect()),
            }
        };
        match tokio::time::timeout(timeout, run).await {
            Ok(Ok(records)) => Ok(records),
            Ok(Err(e)) => Err(IoError::Dns(e.to_string())),
            Err(_) => Err(IoError::Timeout),
        }
    }
}

/// reqwest-backed HTTP client with manual redirect policy, the way the
/// url-resolution checks want it.
pub struct ReqwestHttp {
    client: reqwest::Client,
}

impl ReqwestHttp {
    pub fn new() -> Result<ReqwestHttp, IoError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(concat!("mailsieve/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| IoError::Http(e.to_string()))?;
        Ok(ReqwestHttp { client })
    }
}

#[async_trait]
impl HttpClient for ReqwestHttp {
    async fn request(
        &self,
        method: &str,
        url: &str,
        headers: &[(String, String)],
        body: Option<Vec<u8>>,
        max_size: usize,
        timeout: Duration,
    ) -> Result<HttpResponse, IoError> {
        // reject garbage before it reaches the wire
        let parsed = Url::parse(url).map_err(|e| IoError::Http(format!("bad url {url}: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(IoError::Http(format!("unsupported scheme {}", parsed.scheme())));
        }

        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|e| IoError::Http(e.to_string()))?;
        let mut req = self.client.request(method, parsed).timeout(timeout);
        for (name, value) in headers {
            req = req.header(name, value);
        }
        if let Some(body) = body {
            req = req.body(body);
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                IoError::Timeout
            } else {
                IoError::Http(e.to_string())
            }
        })?;

        let status = resp.status().as_u16();
        let headers = resp
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_string(),
                    v.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect();
        let body = resp
            .bytes()
            .await
            .map_err(|e| IoError::Http(e.to_string()))?;
        let mut body = body.to_vec();
        if body.len() > max_size {
            body.truncate(max_size);
        }

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

/// Redis-backed key-value collaborator over a multiplexed async connection.
pub struct RedisKv {
    client: redis::Client,
    key_prefix: String,
}

impl RedisKv {
    pub fn new(connection_url: &str, key_prefix: impl Into<String>) -> Result<RedisKv, IoError> {
        let client = redis::Client::open(connection_url).map_err(|e| IoError::Kv(e.to_string()))?;
        Ok(RedisKv {
            client,
            key_prefix: key_prefix.into(),
        })
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}:{}", self.key_prefix, key)
    }
}

#[async_trait]
impl KvStore for RedisKv {
    async fn command(
        &self,
        key: &str,
        write: bool,
        args: &[String],
    ) -> Result<Option<String>, IoError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| IoError::Kv(e.to_string()))?;

        let full = self.full_key(key);
        if write {
            let value = args.first().cloned().unwrap_or_default();
            redis::cmd("SET")
                .arg(&full)
                .arg(value)
                .query_async::<_, ()>(&mut conn)
                .await
                .map_err(|e| IoError::Kv(e.to_string()))?;
            Ok(None)
        } else {
            redis::cmd("GET")
                .arg(&full)
                .query_async(&mut conn)
                .await
                .map_err(|e| IoError::Kv(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubDns;

    #[async_trait]
    impl DnsResolver for StubDns {
        async fn resolve(
            &self,
            _rtype: DnsRecordType,
            name: &str,
            _timeout: Duration,
        ) -> Result<Vec<String>, IoError> {
            if name.starts_with("listed") {
                Ok(vec!["127.0.0.2".to_string()])
            } else {
                Err(IoError::Dns("NXDOMAIN".to_string()))
            }
        }
    }

    #[tokio::test]
    async fn test_collaborators_dispatch() {
        let collab = Collaborators::default().with_dns(Arc::new(StubDns));
        let dns = collab.dns.as_ref().unwrap();
        let records = dns
            .resolve(DnsRecordType::A, "listed.zone.example", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(records, vec!["127.0.0.2"]);

        let err = dns
            .resolve(DnsRecordType::A, "clean.zone.example", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, IoError::Dns(_)));
    }

    #[tokio::test]
    async fn test_http_rejects_bad_urls() {
        let http = ReqwestHttp::new().unwrap();
        let err = http
            .request("GET", "not a url", &[], None, 1024, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, IoError::Http(_)));

        let err = http
            .request(
                "GET",
                "ftp://example.com/x",
                &[],
                None,
                1024,
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, IoError::Http(_)));
    }
}
