//! Proxy configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ProxyError, Result};
use crate::DEFAULT_PROXY_PORT;

/// Upstream proxy that outbound traffic is chained through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalProxy {
    /// Proxy host.
    pub host: String,
    /// Proxy port.
    pub port: u16,
    /// Whether the external proxy is in use.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl ExternalProxy {
    /// Creates an enabled external proxy.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            enabled: true,
        }
    }

    /// Parses `host:port`.
    pub fn parse(value: &str) -> Result<Self> {
        let (host, port) = crate::message::parse_authority(value, 0)
            .filter(|(_, port)| *port != 0)
            .ok_or_else(|| ProxyError::Config(format!("expected host:port, got {value:?}")))?;
        Ok(Self::new(host, port))
    }

    /// Returns `host:port`.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Proxy server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Port to listen on (all interfaces). `0` picks an ephemeral port.
    pub port: u16,
    /// Whether TLS traffic is intercepted (otherwise relayed blindly).
    pub enable_ssl: bool,
    /// Whether the OS proxy is pointed at this server on start.
    pub enable_system_proxy: bool,
    /// Optional upstream proxy.
    pub external_proxy: Option<ExternalProxy>,
    /// Hosts that bypass the OS proxy setting.
    pub proxy_pass_domains: Vec<String>,
    /// CA directory; the platform data dir when unset.
    pub ca_dir: Option<PathBuf>,
    /// Skip certificate verification toward origins.
    pub accept_invalid_upstream_certs: bool,
}

fn default_true() -> bool {
    true
}

/// Default OS-proxy bypass list.
pub fn default_pass_domains() -> Vec<String> {
    [
        "192.168.0.0/16",
        "10.0.0.0/8",
        "172.16.0.0/12",
        "127.0.0.1",
        "localhost",
        "*.local",
        "timestamp.apple.com",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PROXY_PORT,
            enable_ssl: true,
            enable_system_proxy: false,
            external_proxy: None,
            proxy_pass_domains: default_pass_domains(),
            ca_dir: None,
            accept_invalid_upstream_certs: false,
        }
    }
}

impl ProxyConfig {
    /// Creates a configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a JSON configuration file. Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| ProxyError::Config(format!("failed to read {}: {e}", path.display())))?;
        serde_json::from_str(&json)
            .map_err(|e| ProxyError::Config(format!("invalid config {}: {e}", path.display())))
    }

    /// Sets the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Enables or disables TLS interception.
    pub fn with_ssl(mut self, enable_ssl: bool) -> Self {
        self.enable_ssl = enable_ssl;
        self
    }

    /// Enables or disables OS proxy registration on start.
    pub fn with_system_proxy(mut self, enable: bool) -> Self {
        self.enable_system_proxy = enable;
        self
    }

    /// Sets the external proxy.
    pub fn with_external_proxy(mut self, external_proxy: ExternalProxy) -> Self {
        self.external_proxy = Some(external_proxy);
        self
    }

    /// Sets the CA directory.
    pub fn with_ca_dir(mut self, ca_dir: impl Into<PathBuf>) -> Self {
        self.ca_dir = Some(ca_dir.into());
        self
    }

    /// Sets the OS-proxy bypass list.
    pub fn with_pass_domains(mut self, domains: Vec<String>) -> Self {
        self.proxy_pass_domains = domains;
        self
    }

    /// Disables certificate verification toward origins.
    pub fn with_accept_invalid_upstream_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_upstream_certs = accept;
        self
    }

    /// The external proxy, if configured and enabled.
    pub fn active_external_proxy(&self) -> Option<&ExternalProxy> {
        self.external_proxy.as_ref().filter(|p| p.enabled)
    }
}
