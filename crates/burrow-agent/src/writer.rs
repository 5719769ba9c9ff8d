//! Outbound frame path
//!
//! Exactly one task writes to the proxy connection. Stream workers and the
//! reader hand it frames through a [`FrameSink`]; each frame is encoded and
//! written whole, so frames from different streams never interleave on the
//! wire.

use burrow_proto::{Frame, FrameCodec, FrameError, StreamId};
use bytes::Bytes;
use futures::SinkExt;
use thiserror::Error;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Capacity of the queue feeding the writer task
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// The writer task has stopped; the session is going away
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("Tunnel writer closed")]
pub struct SinkClosed;

/// Handle for queueing frames to the proxy
#[derive(Debug, Clone)]
pub struct FrameSink {
    tx: mpsc::Sender<Frame>,
}

impl FrameSink {
    /// Create a sink and the receiver the writer task drains
    pub fn channel() -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        (Self { tx }, rx)
    }

    /// Queue a frame, waiting if the writer is behind
    pub async fn send(&self, frame: Frame) -> Result<(), SinkClosed> {
        self.tx.send(frame).await.map_err(|_| SinkClosed)
    }

    pub async fn data(&self, stream_id: StreamId, payload: Bytes) -> Result<(), SinkClosed> {
        self.send(Frame::data(stream_id, payload)).await
    }

    pub async fn close(&self, stream_id: StreamId) -> Result<(), SinkClosed> {
        self.send(Frame::close(stream_id)).await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Drain `rx` onto the proxy connection until the session ends.
///
/// Frames already queued are written back to back and flushed together. A
/// write failure cancels `session` so the reader notices the broken
/// connection, and is returned to the caller.
pub async fn run_writer<W>(
    writer: W,
    mut rx: mpsc::Receiver<Frame>,
    session: CancellationToken,
) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let mut sink = FramedWrite::new(writer, FrameCodec::new());

    loop {
        let frame = tokio::select! {
            biased;
            _ = session.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let result = tokio::select! {
            _ = session.cancelled() => break,
            result = write_batch(&mut sink, &mut rx, frame) => result,
        };

        if let Err(e) = result {
            warn!(error = %e, "Failed to write to proxy connection");
            session.cancel();
            return Err(e);
        }
    }

    debug!("Writer task finished");
    Ok(())
}

async fn write_batch<W>(
    sink: &mut FramedWrite<W, FrameCodec>,
    rx: &mut mpsc::Receiver<Frame>,
    first: Frame,
) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    trace_frame(&first);
    sink.feed(first).await?;

    while let Ok(frame) = rx.try_recv() {
        trace_frame(&frame);
        sink.feed(frame).await?;
    }

    sink.flush().await
}

fn trace_frame(frame: &Frame) {
    trace!(
        stream_id = frame.stream_id,
        frame_type = ?frame.frame_type,
        size = frame.payload.len(),
        "Writing frame"
    );
}
