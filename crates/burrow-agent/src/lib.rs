//! Burrow Agent - device side of a reverse tunnel
//!
//! The agent dials out to a public proxy, authenticates with a device token,
//! and then serves the streams the proxy multiplexes over that single
//! connection. Each stream is relayed to a TCP service on the device.
//!
//! # Example Usage
//!
//! ```no_run
//! use burrow_agent::{Agent, AgentConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = AgentConfig::builder()
//!         .proxy("proxy.example.com", 7000)
//!         .device_name("cam-01")
//!         .device_token("your-token")
//!         .allowed_ports(vec![22, 80])
//!         .build()?;
//!
//!     let agent = Agent::new(config)?;
//!     let stop = agent.stop_handle();
//!     tokio::spawn(async move {
//!         let _ = tokio::signal::ctrl_c().await;
//!         stop.stop();
//!     });
//!
//!     agent.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! 1. **Connection**: plain TCP or TLS to the proxy
//! 2. **Handshake**: one JSON line each way, then binary frames
//! 3. **Reader**: decodes frames and routes them by stream id
//! 4. **Workers**: one task per stream, connected to `local_host:port`
//! 5. **Writer**: a single task owns the write half, so frames never interleave
//! 6. **Supervisor**: reconnects with exponential backoff until stopped

mod agent;
mod allowlist;
mod config;
mod handshake;
mod reader;
mod reconnect;
mod streams;
mod transport;
mod worker;
mod writer;

// Re-export public API
pub use agent::{Agent, AgentError, AgentStatus, StopHandle};
pub use allowlist::PortAllowlist;
pub use config::{AgentConfig, AgentConfigBuilder, ConfigError, TlsMode};
pub use handshake::{Authenticated, HandshakeClient, HandshakeError};
pub use reader::{LocalTarget, ReadOutcome, TunnelReader};
pub use reconnect::{ReconnectConfig, ReconnectError, ReconnectManager};
pub use streams::{
    StreamEntry, StreamError, StreamHandle, StreamState, StreamTable, MAX_TOMBSTONES,
    STREAM_QUEUE_CAPACITY,
};
pub use transport::{BoxedIo, Connector, TransportError, TunnelIo};
pub use worker::{StreamWorker, WorkerError};
pub use writer::{run_writer, FrameSink, SinkClosed, OUTBOUND_QUEUE_CAPACITY};
