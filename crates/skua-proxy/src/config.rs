use crate::router::{ChainedProxyRouter, UpstreamProxy};
use crate::transport::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_IDLE_TIMEOUT, Timeouts};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use skua_core::CaptureTypeSet;
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 8080;

/// Upstream proxy settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChainedProxyConfig {
    /// `host:port`
    pub address: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub non_proxy_hosts: Vec<String>,
    /// Speak TLS to the upstream proxy. Fixed once the proxy starts.
    pub use_tls: bool,
}

impl ChainedProxyConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }

    pub fn upstream(&self) -> Result<UpstreamProxy> {
        let upstream = UpstreamProxy::parse(&self.address)?;
        Ok(match (&self.username, &self.password) {
            (Some(username), password) => {
                upstream.with_credentials(username, password.as_deref().unwrap_or(""))
            }
            (None, _) => upstream,
        })
    }
}

/// Proxy settings, loadable from a camelCase JSON file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxyConfig {
    pub bind_address: IpAddr,
    pub port: u16,
    /// Decrypt HTTPS. Fixed once the proxy starts.
    pub mitm: bool,
    /// Skip upstream certificate verification. Fixed once the proxy starts.
    pub trust_all_servers: bool,
    pub connect_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    pub latency_ms: u64,
    pub read_bandwidth_limit: u64,
    pub write_bandwidth_limit: u64,
    pub chained_proxy: Option<ChainedProxyConfig>,
    pub capture_types: CaptureTypeSet,
    pub additional_headers: BTreeMap<String, String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: DEFAULT_PORT,
            mitm: true,
            trust_all_servers: false,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT.as_millis() as u64,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT.as_millis() as u64,
            latency_ms: 0,
            read_bandwidth_limit: 0,
            write_bandwidth_limit: 0,
            chained_proxy: None,
            capture_types: CaptureTypeSet::none(),
            additional_headers: BTreeMap::new(),
        }
    }
}

impl ProxyConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        tracing::debug!("Loading proxy configuration from {:?}", path);
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("Invalid configuration in {}: {}", path.display(), e)))
    }

    pub fn with_bind_address(mut self, address: IpAddr) -> Self {
        self.bind_address = address;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_mitm(mut self, mitm: bool) -> Self {
        self.mitm = mitm;
        self
    }

    pub fn with_trust_all_servers(mut self, trust_all: bool) -> Self {
        self.trust_all_servers = trust_all;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency_ms = latency.as_millis() as u64;
        self
    }

    pub fn with_bandwidth_limits(mut self, read_bytes_per_sec: u64, write_bytes_per_sec: u64) -> Self {
        self.read_bandwidth_limit = read_bytes_per_sec;
        self.write_bandwidth_limit = write_bytes_per_sec;
        self
    }

    pub fn with_chained_proxy(mut self, chained: ChainedProxyConfig) -> Self {
        self.chained_proxy = Some(chained);
        self
    }

    pub fn with_capture_types(mut self, capture_types: CaptureTypeSet) -> Self {
        self.capture_types = capture_types;
        self
    }

    pub fn with_additional_header(mut self, name: &str, value: &str) -> Self {
        self.additional_headers.insert(name.to_string(), value.to_string());
        self
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }

    pub(crate) fn timeouts(&self) -> Timeouts {
        Timeouts::new(
            Duration::from_millis(self.connect_timeout_ms),
            Duration::from_millis(self.idle_timeout_ms),
        )
    }

    pub(crate) fn router(&self) -> Result<ChainedProxyRouter> {
        let Some(chained) = &self.chained_proxy else {
            return Ok(ChainedProxyRouter::default());
        };
        let router = ChainedProxyRouter::new(chained.use_tls);
        router.set_upstream(Some(chained.upstream()?));
        router.set_non_proxy_hosts(&chained.non_proxy_hosts)?;
        Ok(router)
    }
}
