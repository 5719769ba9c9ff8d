//! Inbound frame dispatch
//!
//! The reader owns the read half of the proxy connection and routes every
//! decoded frame: NEW spawns a [`StreamWorker`], DATA goes to the stream's
//! queue, CLOSE removes the stream. It never waits on a local connect.
//!
//! A full stream queue does hold up every stream behind it, so the wait is
//! bounded by `stall_timeout`; a stream still full after that is closed.

use crate::allowlist::PortAllowlist;
use crate::streams::StreamTable;
use crate::worker::StreamWorker;
use crate::writer::FrameSink;
use burrow_proto::{Frame, FrameCodec, FrameError, FrameType, StreamId};
use bytes::Bytes;
use futures::StreamExt;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Why a session's read loop stopped
#[derive(Debug)]
pub enum ReadOutcome {
    /// Proxy closed the connection cleanly
    Eof,
    /// Session was cancelled (stop request or writer failure)
    Cancelled,
    /// Short read, oversized frame, or I/O error
    Failed(FrameError),
}

/// Per-session settings the reader hands to each worker
#[derive(Debug, Clone)]
pub struct LocalTarget {
    pub host: String,
    pub connect_timeout: Duration,
    /// Longest the reader waits on one stream's full queue
    pub stall_timeout: Duration,
    pub allowed_ports: PortAllowlist,
}

pub struct TunnelReader<R> {
    frames: FramedRead<R, FrameCodec>,
    table: StreamTable,
    sink: FrameSink,
    target: LocalTarget,
    session: CancellationToken,
}

impl<R> TunnelReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(
        reader: R,
        table: StreamTable,
        sink: FrameSink,
        target: LocalTarget,
        session: CancellationToken,
    ) -> Self {
        Self {
            frames: FramedRead::new(reader, FrameCodec::new()),
            table,
            sink,
            target,
            session,
        }
    }

    /// Read and dispatch frames until the connection ends
    pub async fn run(mut self) -> ReadOutcome {
        loop {
            let next = tokio::select! {
                _ = self.session.cancelled() => return ReadOutcome::Cancelled,
                next = self.frames.next() => next,
            };

            match next {
                Some(Ok(frame)) => self.dispatch(frame).await,
                Some(Err(e)) => {
                    warn!(error = %e, "Failed to read frame from proxy");
                    return ReadOutcome::Failed(e);
                }
                None => {
                    info!("Proxy closed the tunnel connection");
                    return ReadOutcome::Eof;
                }
            }
        }
    }

    async fn dispatch(&self, frame: Frame) {
        trace!(
            stream_id = frame.stream_id,
            frame_type = ?frame.frame_type,
            size = frame.payload.len(),
            "Received frame"
        );

        match frame.frame_type {
            FrameType::New => self.handle_new(&frame).await,
            FrameType::Data => self.handle_data(frame.stream_id, frame.payload).await,
            FrameType::Close => self.handle_close(frame.stream_id),
            FrameType::Unknown(tag) => {
                warn!(
                    stream_id = frame.stream_id,
                    frame_type = tag,
                    "Dropping frame with unknown type"
                );
            }
        }
    }

    async fn handle_new(&self, frame: &Frame) {
        let stream_id = frame.stream_id;

        let Some(port) = frame.port() else {
            warn!(
                stream_id = stream_id,
                payload_len = frame.payload.len(),
                "NEW frame without a 2-byte port, refusing stream"
            );
            self.refuse(stream_id).await;
            return;
        };

        if !self.target.allowed_ports.is_port_allowed(port) {
            warn!(stream_id = stream_id, port = port, "Port not allowed, refusing stream");
            self.refuse(stream_id).await;
            return;
        }

        let stream = match self.table.register(stream_id, port) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(stream_id = stream_id, error = %e, "Ignoring NEW frame");
                return;
            }
        };

        debug!(stream_id = stream_id, port = port, "Opening stream");

        let worker = StreamWorker {
            stream_id,
            port,
            local_host: self.target.host.clone(),
            connect_timeout: self.target.connect_timeout,
            table: self.table.clone(),
            sink: self.sink.clone(),
            session: self.session.clone(),
        };
        tokio::spawn(worker.run(stream));
    }

    async fn handle_data(&self, stream_id: StreamId, payload: Bytes) {
        if payload.is_empty() {
            return;
        }

        let Some(entry) = self.table.get(stream_id) else {
            debug!(stream_id = stream_id, "DATA for unknown stream, dropping");
            return;
        };

        let payload = match entry.tx.try_send(payload) {
            Ok(()) => return,
            Err(TrySendError::Closed(_)) => {
                debug!(stream_id = stream_id, "Stream closed before DATA was delivered");
                return;
            }
            Err(TrySendError::Full(payload)) => payload,
        };

        // Every other stream waits while we do
        trace!(stream_id = stream_id, "Stream queue full, waiting");
        let sent = tokio::select! {
            _ = self.session.cancelled() => return,
            sent = tokio::time::timeout(self.target.stall_timeout, entry.tx.send(payload)) => sent,
        };

        match sent {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                debug!(stream_id = stream_id, "Stream closed before DATA was delivered");
            }
            Err(_) => {
                warn!(
                    stream_id = stream_id,
                    port = entry.port,
                    timeout_ms = self.target.stall_timeout.as_millis() as u64,
                    "Local service stopped reading, closing stream"
                );
                if self.table.remove(stream_id).is_some() {
                    let _ = self.sink.close(stream_id).await;
                }
            }
        }
    }

    fn handle_close(&self, stream_id: StreamId) {
        if self.table.remove(stream_id).is_none() {
            debug!(stream_id = stream_id, "CLOSE for unknown stream");
        }
    }

    /// Answer a NEW we will not serve; the id is never registered
    async fn refuse(&self, stream_id: StreamId) {
        let _ = self.sink.close(stream_id).await;
    }
}
