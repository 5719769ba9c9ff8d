//! Device authentication against the proxy
//!
//! Runs once per connection, before any frame is exchanged. The response line
//! is read one byte at a time so that nothing past the newline is consumed:
//! whatever follows belongs to the frame stream.

use burrow_proto::{
    HandshakeCodecError, HandshakeOutcome, HandshakeRequest, HandshakeResponse,
    MAX_HANDSHAKE_LINE,
};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Handshake errors
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("Authentication rejected by proxy: {0}")]
    Rejected(String),

    #[error("Unexpected handshake status: {0:?}")]
    UnexpectedStatus(Option<String>),

    #[error("Malformed handshake response: {0}")]
    Malformed(#[from] HandshakeCodecError),

    #[error("Handshake response exceeds {0} bytes")]
    LineTooLong(usize),

    #[error("Connection closed during handshake")]
    ConnectionClosed,

    #[error("Handshake timed out after {0:?}")]
    Timeout(Duration),

    #[error("IO error during handshake: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of a successful handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authenticated {
    pub device_key: Option<String>,
}

/// Performs the one-shot authentication exchange
#[derive(Clone)]
pub struct HandshakeClient {
    request: HandshakeRequest,
    timeout: Duration,
}

impl std::fmt::Debug for HandshakeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the token
        f.debug_struct("HandshakeClient")
            .field("device", &self.request.name)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl HandshakeClient {
    pub fn new(token: impl Into<String>, device_name: impl Into<String>, timeout: Duration) -> Self {
        Self {
            request: HandshakeRequest::new(token, device_name),
            timeout,
        }
    }

    /// Authenticate over `io`, leaving it positioned at the first frame
    pub async fn authenticate<S>(&self, io: &mut S) -> Result<Authenticated, HandshakeError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        tokio::time::timeout(self.timeout, self.exchange(io))
            .await
            .map_err(|_| HandshakeError::Timeout(self.timeout))?
    }

    async fn exchange<S>(&self, io: &mut S) -> Result<Authenticated, HandshakeError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let line = self.request.to_line()?;
        io.write_all(&line).await?;
        io.flush().await?;

        debug!(device = %self.request.name, "Sent handshake request");

        let line = read_line(io, MAX_HANDSHAKE_LINE).await?;
        let response = match HandshakeResponse::from_line(&line) {
            Ok(response) => response,
            Err(e) => {
                warn!(
                    response = %String::from_utf8_lossy(&line),
                    "Unexpected non-JSON handshake response"
                );
                return Err(e.into());
            }
        };

        match response.outcome() {
            HandshakeOutcome::Authenticated { device_key } => {
                info!(device = %self.request.name, "Authenticated with proxy");
                Ok(Authenticated { device_key })
            }
            HandshakeOutcome::Rejected { reason } => Err(HandshakeError::Rejected(reason)),
            HandshakeOutcome::Unexpected { status } => {
                warn!(status = ?status, "Unexpected handshake status");
                Err(HandshakeError::UnexpectedStatus(status))
            }
        }
    }
}

/// Read up to and including `\n`, one byte at a time
async fn read_line<R>(reader: &mut R, max_len: usize) -> Result<Vec<u8>, HandshakeError>
where
    R: AsyncRead + Unpin,
{
    let mut line = Vec::with_capacity(128);
    let mut byte = [0u8; 1];

    loop {
        let n = reader.read(&mut byte).await?;
        if n == 0 {
            return Err(HandshakeError::ConnectionClosed);
        }
        if byte[0] == b'\n' {
            return Ok(line);
        }
        if line.len() + 1 >= max_len {
            return Err(HandshakeError::LineTooLong(max_len));
        }
        line.push(byte[0]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};

    fn client() -> HandshakeClient {
        HandshakeClient::new("secret", "cam-01", Duration::from_secs(5))
    }

    /// Fake proxy: read the request line, answer with `reply`, keep the socket
    async fn serve(server: tokio::io::DuplexStream, reply: &'static [u8]) -> String {
        let mut reader = BufReader::new(server);
        let mut request = String::new();
        reader.read_line(&mut request).await.unwrap();
        reader.get_mut().write_all(reply).await.unwrap();
        // Hold the stream open until the client is done with it
        tokio::time::sleep(Duration::from_millis(50)).await;
        request
    }

    #[tokio::test]
    async fn test_authenticated() {
        let (mut io, server) = tokio::io::duplex(1024);
        let proxy = tokio::spawn(serve(
            server,
            b"{\"status\":\"authenticated\",\"device_key\":\"abc\"}\n",
        ));

        let result = client().authenticate(&mut io).await.unwrap();
        assert_eq!(result.device_key.as_deref(), Some("abc"));

        let request = proxy.await.unwrap();
        assert_eq!(request, "{\"token\":\"secret\",\"name\":\"cam-01\"}\n");
    }

    #[tokio::test]
    async fn test_rejected() {
        let (mut io, server) = tokio::io::duplex(1024);
        tokio::spawn(serve(server, b"{\"status\":\"error\",\"message\":\"bad token\"}\n"));

        match client().authenticate(&mut io).await {
            Err(HandshakeError::Rejected(reason)) => assert_eq!(reason, "bad token"),
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unexpected_status_fails() {
        let (mut io, server) = tokio::io::duplex(1024);
        tokio::spawn(serve(server, b"{\"status\":\"queued\"}\n"));

        assert!(matches!(
            client().authenticate(&mut io).await,
            Err(HandshakeError::UnexpectedStatus(Some(_)))
        ));
    }

    #[tokio::test]
    async fn test_non_json_response_fails() {
        let (mut io, server) = tokio::io::duplex(1024);
        tokio::spawn(serve(server, b"hello there\n"));

        assert!(matches!(
            client().authenticate(&mut io).await,
            Err(HandshakeError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_close_before_newline() {
        let (mut io, server) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            let mut reader = BufReader::new(server);
            let mut request = String::new();
            reader.read_line(&mut request).await.unwrap();
            reader
                .get_mut()
                .write_all(b"{\"status\":\"authent")
                .await
                .unwrap();
            // reader (and the stream) dropped here
        });

        assert!(matches!(
            client().authenticate(&mut io).await,
            Err(HandshakeError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_line_too_long() {
        let (mut io, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let mut reader = BufReader::new(server);
            let mut request = String::new();
            reader.read_line(&mut request).await.unwrap();
            let junk = vec![b'x'; MAX_HANDSHAKE_LINE * 2];
            let _ = reader.get_mut().write_all(&junk).await;
            tokio::time::sleep(Duration::from_millis(100)).await;
        });

        assert!(matches!(
            client().authenticate(&mut io).await,
            Err(HandshakeError::LineTooLong(_))
        ));
    }

    #[tokio::test]
    async fn test_bytes_after_newline_are_left_unread() {
        let (mut io, server) = tokio::io::duplex(1024);
        tokio::spawn(serve(
            server,
            b"{\"status\":\"authenticated\"}\nDATA-AFTER",
        ));

        client().authenticate(&mut io).await.unwrap();

        let mut rest = [0u8; 10];
        io.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"DATA-AFTER");
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_proxy_times_out() {
        let (mut io, _server) = tokio::io::duplex(1024);

        assert!(matches!(
            client().authenticate(&mut io).await,
            Err(HandshakeError::Timeout(_))
        ));
    }
}
