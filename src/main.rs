//! Burrow - device agent for reverse tunnels
//!
//! Keeps an outbound connection to a public proxy and relays the streams it
//! opens to TCP services on this device.

use anyhow::{Context, Result};
use burrow_agent::{Agent, AgentConfig, ReconnectConfig, TlsMode};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Burrow - expose services on a NATed device through a public proxy
#[derive(Parser, Debug)]
#[command(name = "burrow")]
#[command(about = "Burrow - expose services on a NATed device through a public proxy")]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Log level (trace, debug, info, warn, error) or a full filter directive
    #[arg(long, global = true, env = "BURROW_LOG", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Connect to a proxy and serve the streams it opens
    #[command(long_about = r#"
Connect to a proxy, authenticate as this device, and relay every stream the
proxy opens to the matching TCP port on this device. Reconnects with
exponential backoff (5s doubling up to 60s) whenever the connection drops.

EXAMPLES:
  # Expose SSH and a web UI through the proxy
  burrow connect --proxy proxy.example.com:7000 \
    --token $DEVICE_TOKEN \
    --device cam-01 \
    --allow-port 22 --allow-port 80

  # Encrypted transport with a private CA
  burrow connect --proxy proxy.example.com:7443 --tls \
    --ca-file /etc/burrow/ca.pem --token $DEVICE_TOKEN

  # Everything from a config file
  burrow connect --config /etc/burrow/agent.yaml

ENVIRONMENT VARIABLES:
  BURROW_PROXY        Proxy address (host:port)
  BURROW_TOKEN        Device token
  BURROW_DEVICE       Device name (defaults to the host name)
  BURROW_TLS          Use TLS to the proxy
  BURROW_CA_FILE      Extra trusted CA certificates (PEM)
  BURROW_LOCAL_HOST   Host the local services listen on
  BURROW_LOG          Log level
    "#)]
    Connect(ConnectArgs),
}

#[derive(clap::Args, Debug, Default)]
struct ConnectArgs {
    /// Proxy address (e.g., proxy.example.com:7000)
    #[arg(long, env = "BURROW_PROXY")]
    proxy: Option<String>,

    /// Device token presented in the handshake
    #[arg(long, env = "BURROW_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Device name (defaults to the host name)
    #[arg(long, env = "BURROW_DEVICE")]
    device: Option<String>,

    /// Configuration file (YAML)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Use TLS to the proxy
    #[arg(long, env = "BURROW_TLS")]
    tls: bool,

    /// PEM file with extra CA certificates to trust
    #[arg(long, env = "BURROW_CA_FILE")]
    ca_file: Option<PathBuf>,

    /// TLS server name, if it differs from the proxy host
    #[arg(long)]
    server_name: Option<String>,

    /// Skip certificate verification (insecure, for development only)
    #[arg(long)]
    insecure: bool,

    /// Host the local services listen on
    #[arg(long, env = "BURROW_LOCAL_HOST")]
    local_host: Option<String>,

    /// Local port the proxy may open (repeatable; default: any)
    #[arg(long = "allow-port")]
    allow_ports: Vec<u16>,

    /// Give up after this many reconnection attempts (default: never)
    #[arg(long)]
    max_attempts: Option<usize>,
}

/// Configuration file format
#[derive(Debug, Default, Serialize, Deserialize)]
struct ConfigFile {
    /// Proxy configuration
    #[serde(default)]
    proxy: ProxyFileConfig,

    /// Device identity
    #[serde(default)]
    device: DeviceFileConfig,

    /// Local services
    #[serde(default)]
    local: LocalFileConfig,

    #[serde(default)]
    reconnect: ReconnectFileConfig,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ProxyFileConfig {
    /// Proxy address (host:port)
    #[serde(skip_serializing_if = "Option::is_none")]
    address: Option<String>,

    #[serde(default)]
    tls: bool,

    #[serde(default)]
    insecure: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    ca_file: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    server_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    connect_timeout_secs: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    handshake_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DeviceFileConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,

    /// Environment variable name holding the token
    #[serde(skip_serializing_if = "Option::is_none")]
    token_env: Option<String>,

    /// Direct token (prefer using token_env)
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LocalFileConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    host: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    allowed_ports: Vec<u16>,

    #[serde(skip_serializing_if = "Option::is_none")]
    connect_timeout_secs: Option<u64>,

    /// Close a stream whose service stops reading for this long
    #[serde(skip_serializing_if = "Option::is_none")]
    stall_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ReconnectFileConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    initial_backoff_secs: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    max_backoff_secs: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    max_attempts: Option<usize>,
}

/// Setup logging; RUST_LOG, when set, wins over the log level
fn setup_logging(log_level: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(log_level)
            .with_context(|| format!("Invalid log level: {}", log_level))?,
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

/// Load configuration from YAML file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: ConfigFile = serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Merge CLI args with config file, giving precedence to CLI args
fn build_agent_config(args: ConnectArgs) -> Result<AgentConfig> {
    let file = match &args.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            load_config_file(path)?
        }
        None => ConfigFile::default(),
    };

    let proxy = args
        .proxy
        .or(file.proxy.address)
        .ok_or_else(|| anyhow::anyhow!("Proxy address is required (use --proxy or config file)"))?;
    let (proxy_host, proxy_port) = parse_address(&proxy)?;

    let token = match args.token {
        Some(token) => token,
        None => file_token(&file.device)?.ok_or_else(|| {
            anyhow::anyhow!("Device token is required (use --token, environment variable, or config file)")
        })?,
    };

    let device_name = match args.device.or(file.device.name) {
        Some(name) => name,
        None => {
            let name = hostname::get()
                .context("Failed to read host name; use --device")?
                .to_string_lossy()
                .into_owned();
            info!("Using host name as device name: {}", name);
            name
        }
    };

    let tls = if args.tls || args.insecure || file.proxy.tls {
        TlsMode::Enabled {
            insecure: args.insecure || file.proxy.insecure,
            ca_file: args.ca_file.or(file.proxy.ca_file),
            server_name: args.server_name.or(file.proxy.server_name),
        }
    } else {
        TlsMode::Disabled
    };

    let defaults = ReconnectConfig::default();
    let reconnect = ReconnectConfig {
        initial_backoff: file
            .reconnect
            .initial_backoff_secs
            .map_or(defaults.initial_backoff, Duration::from_secs),
        max_backoff: file
            .reconnect
            .max_backoff_secs
            .map_or(defaults.max_backoff, Duration::from_secs),
        multiplier: defaults.multiplier,
        max_attempts: args.max_attempts.or(file.reconnect.max_attempts),
    };

    let allowed_ports = if args.allow_ports.is_empty() {
        file.local.allowed_ports
    } else {
        args.allow_ports
    };

    let mut builder = AgentConfig::builder()
        .proxy(proxy_host, proxy_port)
        .tls(tls)
        .device_name(device_name)
        .device_token(token)
        .allowed_ports(allowed_ports)
        .reconnect(reconnect);

    if let Some(host) = args.local_host.or(file.local.host) {
        builder = builder.local_host(host);
    }
    if let Some(secs) = file.local.connect_timeout_secs {
        builder = builder.local_connect_timeout(Duration::from_secs(secs));
    }
    if let Some(secs) = file.local.stall_timeout_secs {
        builder = builder.stream_stall_timeout(Duration::from_secs(secs));
    }
    if let Some(secs) = file.proxy.connect_timeout_secs {
        builder = builder.proxy_connect_timeout(Duration::from_secs(secs));
    }
    if let Some(secs) = file.proxy.handshake_timeout_secs {
        builder = builder.handshake_timeout(Duration::from_secs(secs));
    }

    builder.build().context("Invalid agent configuration")
}

/// Token from the config file, preferring the environment variable it names
fn file_token(device: &DeviceFileConfig) -> Result<Option<String>> {
    if let Some(env_var) = &device.token_env {
        let token = std::env::var(env_var)
            .with_context(|| format!("Environment variable {} not set", env_var))?;
        return Ok(Some(token));
    }
    Ok(device.token.clone())
}

/// Split a `host:port` address
fn parse_address(addr: &str) -> Result<(String, u16)> {
    let (host, port) = addr.rsplit_once(':').ok_or_else(|| {
        anyhow::anyhow!("Invalid proxy address format: '{}' (expected format: host:port)", addr)
    })?;

    if host.is_empty() {
        anyhow::bail!("Invalid proxy address format: '{}' (host cannot be empty)", addr);
    }

    let port = port
        .parse::<u16>()
        .with_context(|| format!("Invalid port in proxy address: {}", addr))?;

    // Bracketed IPv6 literal
    let host = host.trim_start_matches('[').trim_end_matches(']');

    Ok((host.to_string(), port))
}

async fn connect(args: ConnectArgs) -> Result<()> {
    let config = build_agent_config(args).context("Failed to build agent configuration")?;

    // Log configuration (but not the token)
    info!("Device: {}", config.device_name);
    info!("Proxy: {}", config.proxy_addr());
    if config.allowed_ports.ports().is_empty() {
        info!("Allowed ports: any");
    } else {
        info!("Allowed ports: {:?}", config.allowed_ports.ports());
    }

    let agent = Arc::new(Agent::new(config).context("Failed to create agent")?);
    let stop = agent.stop_handle();

    let mut agent_task = tokio::spawn({
        let agent = agent.clone();
        async move { agent.run().await }
    });

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    // Wait for Ctrl+C or agent exit
    let result = tokio::select! {
        _ = &mut ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
            stop.stop();
            (&mut agent_task).await
        }
        result = &mut agent_task => result,
    };

    match result {
        Ok(Ok(())) => {
            info!("Burrow stopped");
            Ok(())
        }
        Ok(Err(e)) => {
            error!("Agent error: {:#}", e);
            Err(e.into())
        }
        Err(e) => {
            error!("Agent task panicked: {}", e);
            Err(e.into())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging first
    setup_logging(&cli.log_level)?;

    match cli.command {
        Commands::Connect(args) => {
            if args.insecure {
                warn!("Certificate verification disabled (insecure mode)");
            }
            connect(args).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address() {
        assert_eq!(
            parse_address("proxy.example.com:7000").unwrap(),
            ("proxy.example.com".to_string(), 7000)
        );
        assert_eq!(
            parse_address("[::1]:7000").unwrap(),
            ("::1".to_string(), 7000)
        );

        assert!(parse_address("proxy.example.com").is_err());
        assert!(parse_address("proxy.example.com:").is_err());
        assert!(parse_address("proxy.example.com:abc").is_err());
        assert!(parse_address(":7000").is_err());
        assert!(parse_address("").is_err());
    }

    #[test]
    fn test_cli_overrides_config_file() {
        let dir = std::env::temp_dir().join(format!("burrow-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("agent.yaml");
        fs::write(
            &path,
            r#"
proxy:
  address: file.example.com:7000
  tls: true
device:
  name: from-file
  token: file-token
local:
  allowed_ports: [22, 80]
reconnect:
  initial_backoff_secs: 1
  max_backoff_secs: 30
"#,
        )
        .unwrap();

        let args = ConnectArgs {
            config: Some(path),
            device: Some("from-cli".to_string()),
            allow_ports: vec![443],
            ..Default::default()
        };

        let config = build_agent_config(args).unwrap();
        assert_eq!(config.proxy_host, "file.example.com");
        assert_eq!(config.proxy_port, 7000);
        assert_eq!(config.device_name, "from-cli");
        assert_eq!(config.device_token, "file-token");
        assert!(config.tls.is_enabled());
        assert_eq!(config.allowed_ports.ports(), &[443]);
        assert_eq!(config.reconnect.initial_backoff, Duration::from_secs(1));
        assert_eq!(config.reconnect.max_backoff, Duration::from_secs(30));

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_missing_token_rejected() {
        let args = ConnectArgs {
            proxy: Some("proxy.example.com:7000".to_string()),
            device: Some("cam-01".to_string()),
            ..Default::default()
        };

        assert!(build_agent_config(args).is_err());
    }
}
