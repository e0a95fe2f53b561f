//! Client identity and the request metadata the engine sees.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;

/// Prefix of the per-client sliding window key.
const WINDOW_PREFIX: &str = "ratelimit";
/// Prefix of the per-client threshold key.
const THRESHOLD_PREFIX: &str = "threshold";

/// A key that uniquely identifies a rate-limited client.
///
/// Usually the remote address; anything equality-comparable that the host
/// can extract from a request works.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientKey(String);

impl ClientKey {
    /// Create a client key from any identity string.
    pub fn new(identity: impl Into<String>) -> Self {
        Self(identity.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Backend key of this client's sliding window.
    pub fn window_key(&self) -> String {
        format!("{}:{}", WINDOW_PREFIX, self.0)
    }

    /// Backend key of this client's adaptive threshold.
    pub fn threshold_key(&self) -> String {
        format!("{}:{}", THRESHOLD_PREFIX, self.window_key())
    }
}

impl From<IpAddr> for ClientKey {
    fn from(addr: IpAddr) -> Self {
        Self(addr.to_string())
    }
}

impl From<&str> for ClientKey {
    fn from(identity: &str) -> Self {
        Self(identity.to_string())
    }
}

impl std::fmt::Display for ClientKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the enforcement hook knows about an inbound request.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RequestMeta {
    pub client: ClientKey,
    pub method: String,
    pub path: String,
    pub headers: BTreeMap<String, String>,
}

impl RequestMeta {
    pub fn new(client: impl Into<ClientKey>, method: &str, path: &str) -> Self {
        Self {
            client: client.into(),
            method: method.to_string(),
            path: path.to_string(),
            headers: BTreeMap::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.to_string());
        self
    }
}
