use std::fmt;
use std::io::Read;
use std::sync::Arc;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Default response body cap: 10 MiB.
pub const DEFAULT_BODY_LIMIT: usize = 10 * 1024 * 1024;

/// One connection pool shared by every gateway in the process.
static HTTP_CLIENT: Lazy<reqwest::blocking::Client> =
    Lazy::new(reqwest::blocking::Client::new);

#[derive(Debug, Clone, Error)]
pub enum NetError {
    #[error("denied: {0}")]
    Denied(String),
    #[error("host blocked by policy: {0}")]
    BlockedHost(String),
    #[error("response body exceeds {0} bytes")]
    BodyTooLarge(usize),
    #[error("transport error: {0}")]
    Transport(String),
}

impl NetError {
    /// Stable machine code carried over the bridge.
    pub fn code(&self) -> &'static str {
        match self {
            NetError::Denied(_) => "DENIED",
            NetError::BlockedHost(_) => "BLOCKED_HOST",
            NetError::BodyTooLarge(_) => "BODY_TOO_LARGE",
            NetError::Transport(_) => "TRANSPORT",
        }
    }

    /// HTTP-ish status reported to guests for a failed fetch: policy
    /// refusals read as 403, everything else as a bad gateway.
    pub fn status(&self) -> u16 {
        match self {
            NetError::Denied(_) | NetError::BlockedHost(_) => 403,
            NetError::BodyTooLarge(_) | NetError::Transport(_) => 502,
        }
    }
}

/// Hook run before every outbound request; an `Err` is treated as a
/// policy denial.
pub type RequestHook =
    Arc<dyn Fn(&str, &str, &[(String, String)]) -> Result<(), String> + Send + Sync>;

/// Host allow/block lists plus the optional request hook.
///
/// Matching: exact host equality, bare `*` matches everything, and
/// `*.suffix` matches any host whose labels end with `.suffix` (never
/// the bare suffix itself).
#[derive(Clone, Default)]
pub struct NetworkPolicy {
    pub allowed_hosts: Option<Vec<String>>,
    pub blocked_hosts: Option<Vec<String>>,
    pub on_request: Option<RequestHook>,
}

impl fmt::Debug for NetworkPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkPolicy")
            .field("allowed_hosts", &self.allowed_hosts)
            .field("blocked_hosts", &self.blocked_hosts)
            .field("on_request", &self.on_request.as_ref().map(|_| "<hook>"))
            .finish()
    }
}

pub fn matches_host_list(host: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|pattern| {
        if pattern == "*" {
            return true;
        }
        if let Some(suffix) = pattern.strip_prefix("*.") {
            return host.len() > suffix.len() + 1
                && host.ends_with(suffix)
                && host.as_bytes()[host.len() - suffix.len() - 1] == b'.';
        }
        host == pattern
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchRequest {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub body: Option<Vec<u8>>,
}

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchResponse {
    pub ok: bool,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub error: Option<String>,
    #[serde(default)]
    pub truncated: bool,
}

impl FetchResponse {
    pub fn failure(err: &NetError) -> Self {
        FetchResponse {
            ok: false,
            status: err.status(),
            headers: Vec::new(),
            body: Vec::new(),
            error: Some(err.to_string()),
            truncated: false,
        }
    }
}

/// Something that can perform a blocking fetch on behalf of a guest:
/// the gateway itself (in-thread mode) or a [`crate::BridgeClient`]
/// (worker mode).
pub trait SyncFetcher: Send + Sync {
    fn fetch_sync(&self, req: &FetchRequest) -> FetchResponse;
}

/// Policy-enforcing HTTP client over the shared connection pool.
pub struct NetworkGateway {
    policy: NetworkPolicy,
    body_limit: usize,
}

impl fmt::Debug for NetworkGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkGateway")
            .field("policy", &self.policy)
            .field("body_limit", &self.body_limit)
            .finish()
    }
}

impl NetworkGateway {
    pub fn new(policy: NetworkPolicy) -> Self {
        Self::with_body_limit(policy, DEFAULT_BODY_LIMIT)
    }

    pub fn with_body_limit(policy: NetworkPolicy, body_limit: usize) -> Self {
        NetworkGateway { policy, body_limit }
    }

    /// Static policy decision for `url`; deny-by-default.
    pub fn check_access(&self, url: &str, _method: &str) -> Result<(), NetError> {
        let parsed =
            Url::parse(url).map_err(|e| NetError::Denied(format!("invalid url: {e}")))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| NetError::Denied("url has no host".to_string()))?;

        if let Some(allowed) = &self.policy.allowed_hosts {
            if matches_host_list(host, allowed) {
                return Ok(());
            }
            return Err(NetError::Denied(format!("host not in allow list: {host}")));
        }
        if let Some(blocked) = &self.policy.blocked_hosts {
            if matches_host_list(host, blocked) {
                return Err(NetError::BlockedHost(host.to_string()));
            }
            return Ok(());
        }
        Err(NetError::Denied("no network policy configured".to_string()))
    }

    pub fn fetch(&self, req: &FetchRequest) -> Result<FetchResponse, NetError> {
        self.check_access(&req.url, &req.method)?;
        if let Some(hook) = &self.policy.on_request {
            hook(&req.url, &req.method, &req.headers).map_err(NetError::Denied)?;
        }

        let method = reqwest::Method::from_bytes(req.method.as_bytes())
            .map_err(|_| NetError::Transport(format!("bad method: {}", req.method)))?;
        let mut builder = HTTP_CLIENT.request(method, &req.url);
        for (name, value) in &req.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &req.body {
            builder = builder.body(body.clone());
        }

        tracing::debug!(url = %req.url, method = %req.method, "gateway fetch");
        let response = builder
            .send()
            .map_err(|e| NetError::Transport(e.to_string()))?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.to_string(),
                    value.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect();

        let mut body = Vec::new();
        let mut limited = response.take((self.body_limit + 1) as u64);
        limited
            .read_to_end(&mut body)
            .map_err(|e| NetError::Transport(e.to_string()))?;
        if body.len() > self.body_limit {
            return Err(NetError::BodyTooLarge(self.body_limit));
        }

        Ok(FetchResponse {
            ok: (200..300).contains(&status),
            status,
            headers,
            body,
            error: None,
            truncated: false,
        })
    }
}

impl SyncFetcher for NetworkGateway {
    fn fetch_sync(&self, req: &FetchRequest) -> FetchResponse {
        match self.fetch(req) {
            Ok(resp) => resp,
            Err(err) => {
                tracing::debug!(error = %err, "gateway fetch refused");
                FetchResponse::failure(&err)
            }
        }
    }
}
