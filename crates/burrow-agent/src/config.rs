//! Agent configuration
//!
//! Supplied once by the embedding application before the agent starts and
//! never reloaded while it runs.

use crate::allowlist::PortAllowlist;
use crate::reconnect::ReconnectConfig;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Proxy host cannot be empty")]
    MissingProxyHost,

    #[error("Proxy port cannot be 0")]
    InvalidProxyPort,

    #[error("Device name cannot be empty")]
    MissingDeviceName,

    #[error("Device token cannot be empty")]
    MissingDeviceToken,

    #[error("Invalid backoff: {0}")]
    InvalidBackoff(&'static str),

    #[error("Stream stall timeout must be non-zero")]
    InvalidStallTimeout,
}

/// Encryption of the proxy connection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TlsMode {
    /// Plain TCP
    #[default]
    Disabled,
    /// TLS on top of TCP
    Enabled {
        /// Skip certificate verification (insecure, for development only)
        insecure: bool,
        /// Extra PEM bundle of trusted CA certificates
        ca_file: Option<PathBuf>,
        /// Name to verify instead of the proxy host
        server_name: Option<String>,
    },
}

impl TlsMode {
    pub fn is_enabled(&self) -> bool {
        matches!(self, TlsMode::Enabled { .. })
    }
}

/// Configuration for the agent
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Public proxy host name or IP
    pub proxy_host: String,

    /// Public proxy port
    pub proxy_port: u16,

    /// Transport encryption
    pub tls: TlsMode,

    /// Identifier the device announces in the handshake
    pub device_name: String,

    /// Credential the device presents in the handshake
    pub device_token: String,

    /// Host the local services listen on
    pub local_host: String,

    /// Ports the proxy may open streams to
    pub allowed_ports: PortAllowlist,

    /// Timeout for connecting to a local service
    pub local_connect_timeout: Duration,

    /// How long a stream's full queue may hold up the tunnel before the
    /// stream is closed
    pub stream_stall_timeout: Duration,

    /// Timeout for connecting to the proxy
    pub proxy_connect_timeout: Duration,

    /// Timeout for the whole handshake exchange
    pub handshake_timeout: Duration,

    /// Backoff between connection attempts
    pub reconnect: ReconnectConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            proxy_host: String::new(),
            proxy_port: 0,
            tls: TlsMode::Disabled,
            device_name: String::new(),
            device_token: String::new(),
            local_host: "127.0.0.1".to_string(),
            allowed_ports: PortAllowlist::allow_all(),
            local_connect_timeout: Duration::from_secs(10),
            stream_stall_timeout: Duration::from_secs(5),
            proxy_connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl AgentConfig {
    pub fn builder() -> AgentConfigBuilder {
        AgentConfigBuilder::default()
    }

    /// Proxy address in `host:port` form
    pub fn proxy_addr(&self) -> String {
        format!("{}:{}", self.proxy_host, self.proxy_port)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.proxy_host.trim().is_empty() {
            return Err(ConfigError::MissingProxyHost);
        }
        if self.proxy_port == 0 {
            return Err(ConfigError::InvalidProxyPort);
        }
        if self.device_name.trim().is_empty() {
            return Err(ConfigError::MissingDeviceName);
        }
        if self.device_token.is_empty() {
            return Err(ConfigError::MissingDeviceToken);
        }
        if self.stream_stall_timeout.is_zero() {
            return Err(ConfigError::InvalidStallTimeout);
        }
        if self.reconnect.initial_backoff.is_zero() {
            return Err(ConfigError::InvalidBackoff("initial backoff must be non-zero"));
        }
        if self.reconnect.max_backoff < self.reconnect.initial_backoff {
            return Err(ConfigError::InvalidBackoff(
                "max backoff must not be below initial backoff",
            ));
        }
        if !self.reconnect.multiplier.is_finite() {
            return Err(ConfigError::InvalidBackoff("multiplier must be finite"));
        }
        if self.reconnect.multiplier < 1.0 {
            return Err(ConfigError::InvalidBackoff("multiplier must be at least 1.0"));
        }
        Ok(())
    }
}

/// Builder for AgentConfig
#[derive(Default)]
pub struct AgentConfigBuilder {
    config: AgentConfig,
}

impl AgentConfigBuilder {
    pub fn proxy(mut self, host: impl Into<String>, port: u16) -> Self {
        self.config.proxy_host = host.into();
        self.config.proxy_port = port;
        self
    }

    pub fn tls(mut self, tls: TlsMode) -> Self {
        self.config.tls = tls;
        self
    }

    pub fn device_name(mut self, name: impl Into<String>) -> Self {
        self.config.device_name = name.into();
        self
    }

    pub fn device_token(mut self, token: impl Into<String>) -> Self {
        self.config.device_token = token.into();
        self
    }

    pub fn local_host(mut self, host: impl Into<String>) -> Self {
        self.config.local_host = host.into();
        self
    }

    pub fn allowed_ports(mut self, ports: Vec<u16>) -> Self {
        self.config.allowed_ports = PortAllowlist::new(ports);
        self
    }

    pub fn local_connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.local_connect_timeout = timeout;
        self
    }

    pub fn stream_stall_timeout(mut self, timeout: Duration) -> Self {
        self.config.stream_stall_timeout = timeout;
        self
    }

    pub fn proxy_connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.proxy_connect_timeout = timeout;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    pub fn reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.config.reconnect = reconnect;
        self
    }

    pub fn build(self) -> Result<AgentConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
