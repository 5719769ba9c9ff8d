use crate::streams::{StreamHandle, StreamTable};
use crate::writer::FrameSink;
use burrow_proto::StreamId;
use bytes::Bytes;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Size of the buffer used for reads from the local service
const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Errors that can occur while opening the local side of a stream
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Failed to connect to local address {address}: {source}")]
    ConnectionFailed {
        address: String,
        source: std::io::Error,
    },

    #[error("Connecting to local address {address} timed out after {timeout:?}")]
    ConnectTimeout { address: String, timeout: Duration },

    #[error("Stream closed before the local connect finished")]
    Cancelled,
}

/// How the relay loop ended
#[derive(Debug)]
enum Exit {
    /// Local service closed its end
    LocalClosed,
    LocalReadFailed(std::io::Error),
    LocalWriteFailed(std::io::Error),
    /// Stream left the table: proxy sent CLOSE, the session is being torn
    /// down, or the reader gave up on a stalled local service
    RemoteClosed,
    /// Writer is gone, nothing more can reach the proxy
    SessionEnded,
}

/// Relays one stream between the proxy and a local TCP service
pub struct StreamWorker {
    pub stream_id: StreamId,
    pub port: u16,
    pub local_host: String,
    pub connect_timeout: Duration,
    pub table: StreamTable,
    pub sink: FrameSink,
    pub session: CancellationToken,
}

impl StreamWorker {
    /// Connect to the local service, then relay until either side closes
    ///
    /// `stream.inbound` carries DATA payloads from the proxy, including any
    /// that arrived before the local connect finished.
    pub async fn run(self, stream: StreamHandle) {
        let started = Instant::now();
        let StreamHandle { inbound, closed } = stream;

        let local = match self.connect(&closed).await {
            Ok(local) => local,
            Err(WorkerError::Cancelled) => return,
            Err(e) => {
                tracing::warn!(
                    stream_id = self.stream_id,
                    port = self.port,
                    error = %e,
                    "Local connect failed"
                );
                self.close_upstream().await;
                return;
            }
        };

        if !self.table.mark_open(self.stream_id) {
            tracing::debug!(
                stream_id = self.stream_id,
                "Stream closed by proxy while connecting"
            );
            return;
        }

        tracing::debug!(
            stream_id = self.stream_id,
            port = self.port,
            "Connected to local service"
        );

        let (reader, writer) = local.into_split();
        let mut bytes_to_local = 0u64;
        let mut bytes_to_proxy = 0u64;

        let exit = tokio::select! {
            _ = self.session.cancelled() => Exit::RemoteClosed,
            _ = closed.cancelled() => Exit::RemoteClosed,
            exit = Self::pump_to_local(inbound, writer, &mut bytes_to_local) => exit,
            exit = Self::pump_to_proxy(reader, &self.sink, self.stream_id, &mut bytes_to_proxy) => exit,
        };

        match &exit {
            Exit::LocalClosed => {
                tracing::debug!(stream_id = self.stream_id, "Local service closed connection");
                self.close_upstream().await;
            }
            Exit::LocalReadFailed(e) | Exit::LocalWriteFailed(e) => {
                tracing::warn!(
                    stream_id = self.stream_id,
                    error = %e,
                    "Local connection error"
                );
                self.close_upstream().await;
            }
            Exit::RemoteClosed | Exit::SessionEnded => {}
        }

        tracing::info!(
            stream_id = self.stream_id,
            port = self.port,
            bytes_to_local = bytes_to_local,
            bytes_to_proxy = bytes_to_proxy,
            duration_ms = started.elapsed().as_millis() as u64,
            "Stream closed"
        );
    }

    async fn connect(&self, closed: &CancellationToken) -> Result<TcpStream, WorkerError> {
        let address = format!("{}:{}", self.local_host, self.port);

        let connect = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&address));
        let result = tokio::select! {
            _ = self.session.cancelled() => return Err(WorkerError::Cancelled),
            _ = closed.cancelled() => return Err(WorkerError::Cancelled),
            result = connect => result,
        };

        let stream = result
            .map_err(|_| WorkerError::ConnectTimeout {
                address: address.clone(),
                timeout: self.connect_timeout,
            })?
            .map_err(|source| WorkerError::ConnectionFailed { address, source })?;

        let _ = stream.set_nodelay(true);
        Ok(stream)
    }

    /// Send CLOSE unless someone else already removed the stream
    async fn close_upstream(&self) {
        if self.table.remove(self.stream_id).is_some() {
            let _ = self.sink.close(self.stream_id).await;
        }
    }

    async fn pump_to_local(
        mut inbound: mpsc::Receiver<Bytes>,
        mut writer: OwnedWriteHalf,
        total: &mut u64,
    ) -> Exit {
        while let Some(data) = inbound.recv().await {
            if let Err(e) = writer.write_all(&data).await {
                return Exit::LocalWriteFailed(e);
            }
            *total += data.len() as u64;
        }

        let _ = writer.shutdown().await;
        Exit::RemoteClosed
    }

    async fn pump_to_proxy(
        mut reader: OwnedReadHalf,
        sink: &FrameSink,
        stream_id: StreamId,
        total: &mut u64,
    ) -> Exit {
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];

        loop {
            let n = match reader.read(&mut buffer).await {
                Ok(0) => return Exit::LocalClosed,
                Ok(n) => n,
                Err(e) => return Exit::LocalReadFailed(e),
            };

            if sink
                .data(stream_id, Bytes::copy_from_slice(&buffer[..n]))
                .await
                .is_err()
            {
                return Exit::SessionEnded;
            }
            *total += n as u64;
        }
    }
}
