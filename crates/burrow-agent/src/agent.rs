use crate::config::{AgentConfig, ConfigError};
use crate::handshake::{HandshakeClient, HandshakeError};
use crate::reader::{LocalTarget, ReadOutcome, TunnelReader};
use crate::reconnect::{ReconnectError, ReconnectManager};
use crate::streams::StreamTable;
use crate::transport::{BoxedIo, Connector, TransportError};
use crate::writer::{run_writer, FrameSink};
use burrow_proto::FrameError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Errors that can occur in the agent
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("Failed to read from tunnel: {0}")]
    Read(#[source] FrameError),

    #[error("Failed to write to tunnel: {0}")]
    Write(#[source] FrameError),

    #[error("Max reconnection attempts reached ({0})")]
    MaxAttemptsReached(usize),

    #[error("Agent already running")]
    AlreadyRunning,
}

/// What the agent is doing right now
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentStatus {
    /// Created, `run` not called yet
    Idle,
    /// Opening the proxy connection and authenticating
    Connecting { attempt: usize },
    /// Authenticated, relaying streams
    Connected { device_key: Option<String> },
    /// Waiting before the next attempt
    Backoff { delay: Duration },
    Stopped,
}

/// Cloneable handle that asks a running agent to stop
#[derive(Debug, Clone)]
pub struct StopHandle {
    token: CancellationToken,
}

impl StopHandle {
    /// Stop the agent: ends the backoff sleep, the tunnel read and every stream
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }
}

type PrestartHook = Box<dyn FnOnce() -> std::io::Result<()> + Send + 'static>;

/// The tunnel agent - keeps one authenticated connection to the proxy alive
/// and serves the streams the proxy opens over it
pub struct Agent {
    config: AgentConfig,

    connector: Connector,

    handshake: HandshakeClient,

    /// Cancelled once, by `StopHandle::stop`
    stop: CancellationToken,

    status: watch::Sender<AgentStatus>,

    /// Runs once before the first connection attempt
    prestart: Mutex<Option<PrestartHook>>,

    /// Stream table of the live session, if any
    current: Mutex<Option<StreamTable>>,

    running: AtomicBool,
}

impl Agent {
    /// Create a new agent with the given configuration
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        config.validate()?;

        let connector = Connector::new(&config)?;
        let handshake = HandshakeClient::new(
            config.device_token.clone(),
            config.device_name.clone(),
            config.handshake_timeout,
        );
        let (status, _) = watch::channel(AgentStatus::Idle);

        Ok(Self {
            config,
            connector,
            handshake,
            stop: CancellationToken::new(),
            status,
            prestart: Mutex::new(None),
            current: Mutex::new(None),
            running: AtomicBool::new(false),
        })
    }

    /// Register a one-shot provisioning step, run before the first connect
    ///
    /// A failing hook is logged and the agent starts anyway.
    pub fn with_prestart<F>(self, hook: F) -> Self
    where
        F: FnOnce() -> std::io::Result<()> + Send + 'static,
    {
        *lock(&self.prestart) = Some(Box::new(hook));
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            token: self.stop.clone(),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<AgentStatus> {
        self.status.subscribe()
    }

    pub fn status(&self) -> AgentStatus {
        self.status.borrow().clone()
    }

    /// Number of streams open in the current session
    pub fn active_streams(&self) -> usize {
        lock(&self.current).as_ref().map_or(0, StreamTable::len)
    }

    /// Run until stopped
    ///
    /// Connection failures, rejected handshakes and dropped sessions are
    /// logged and retried with backoff. Returns `Ok` after a stop request, or
    /// `MaxAttemptsReached` if a retry limit is configured and exhausted.
    pub async fn run(&self) -> Result<(), AgentError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(AgentError::AlreadyRunning);
        }

        tracing::info!(
            proxy = %self.connector.address(),
            device = %self.config.device_name,
            tls = self.config.tls.is_enabled(),
            "Starting agent"
        );

        self.run_prestart().await;

        let mut backoff = ReconnectManager::new(self.config.reconnect.clone());

        let result = loop {
            if self.stop.is_cancelled() {
                break Ok(());
            }

            self.set_status(AgentStatus::Connecting {
                attempt: backoff.attempt() + 1,
            });

            match self.connect_and_serve(&mut backoff).await {
                Ok(()) => tracing::info!("Tunnel session ended"),
                Err(e) => tracing::warn!(error = %e, "Tunnel connection failed"),
            }

            if self.stop.is_cancelled() {
                break Ok(());
            }

            let delay = backoff.current_backoff();
            self.set_status(AgentStatus::Backoff { delay });
            tracing::info!(
                delay_ms = delay.as_millis() as u64,
                attempt = backoff.attempt() + 1,
                "Reconnecting after backoff"
            );

            match backoff.wait(&self.stop).await {
                Ok(_) => {}
                Err(ReconnectError::Cancelled) => break Ok(()),
                Err(ReconnectError::MaxAttemptsReached(max)) => {
                    tracing::error!(max_attempts = max, "Giving up on the proxy");
                    break Err(AgentError::MaxAttemptsReached(max));
                }
            }
        };

        self.set_status(AgentStatus::Stopped);
        self.running.store(false, Ordering::SeqCst);

        tracing::info!("Agent stopped");
        result
    }

    async fn run_prestart(&self) {
        let Some(hook) = lock(&self.prestart).take() else {
            return;
        };

        match tokio::task::spawn_blocking(hook).await {
            Ok(Ok(())) => tracing::debug!("Pre-start hook completed"),
            Ok(Err(e)) => tracing::warn!(error = %e, "Pre-start hook failed, continuing"),
            Err(e) => tracing::warn!(error = %e, "Pre-start hook panicked, continuing"),
        }
    }

    /// One connection cycle: connect, authenticate, serve until it ends
    async fn connect_and_serve(&self, backoff: &mut ReconnectManager) -> Result<(), AgentError> {
        let mut io = tokio::select! {
            _ = self.stop.cancelled() => return Ok(()),
            io = self.connector.connect() => io?,
        };

        tracing::debug!(proxy = %self.connector.address(), "Connected to proxy");

        let authenticated = tokio::select! {
            _ = self.stop.cancelled() => return Ok(()),
            result = self.handshake.authenticate(&mut io) => result?,
        };

        backoff.reset();
        self.set_status(AgentStatus::Connected {
            device_key: authenticated.device_key,
        });

        self.serve(io).await
    }

    async fn serve(&self, io: BoxedIo) -> Result<(), AgentError> {
        let session = self.stop.child_token();
        let table = StreamTable::new();
        *lock(&self.current) = Some(table.clone());

        let (read_half, write_half) = tokio::io::split(io);
        let (sink, outbound) = FrameSink::channel();
        let writer = tokio::spawn(run_writer(write_half, outbound, session.clone()));

        let target = LocalTarget {
            host: self.config.local_host.clone(),
            connect_timeout: self.config.local_connect_timeout,
            stall_timeout: self.config.stream_stall_timeout,
            allowed_ports: self.config.allowed_ports.clone(),
        };
        let outcome = TunnelReader::new(read_half, table.clone(), sink, target, session.clone())
            .run()
            .await;

        // Peer is gone or we are stopping: no CLOSE frames for these
        session.cancel();
        let torn_down = table.clear();
        *lock(&self.current) = None;

        if torn_down > 0 {
            tracing::info!(streams = torn_down, "Tore down open streams");
        }

        let written = match writer.await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(error = %e, "Writer task panicked");
                Ok(())
            }
        };

        match outcome {
            ReadOutcome::Failed(e) => Err(AgentError::Read(e)),
            ReadOutcome::Eof | ReadOutcome::Cancelled => written.map_err(AgentError::Write),
        }
    }

    fn set_status(&self, status: AgentStatus) {
        self.status.send_replace(status);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
