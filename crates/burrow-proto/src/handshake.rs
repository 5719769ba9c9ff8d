//! Handshake messages
//!
//! The handshake is a single line of JSON in each direction, terminated by
//! `\n`, exchanged once right after the transport connects and before any
//! frame is sent.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Status value the proxy sends when it accepts the device
pub const STATUS_AUTHENTICATED: &str = "authenticated";

/// Status value the proxy sends when it rejects the device
pub const STATUS_ERROR: &str = "error";

/// Handshake encoding errors
#[derive(Debug, Error)]
pub enum HandshakeCodecError {
    #[error("Invalid handshake JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Handshake line is not valid UTF-8")]
    InvalidUtf8,
}

/// Authentication request sent by the device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub token: String,
    pub name: String,
}

impl HandshakeRequest {
    pub fn new(token: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            name: name.into(),
        }
    }

    /// Serialize as a single newline-terminated line
    pub fn to_line(&self) -> Result<Vec<u8>, HandshakeCodecError> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(line)
    }
}

/// Raw response line sent by the proxy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    #[serde(default)]
    pub status: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What a response line means for the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeOutcome {
    Authenticated { device_key: Option<String> },
    Rejected { reason: String },
    /// Any status other than `authenticated` or `error`, or none at all
    Unexpected { status: Option<String> },
}

impl HandshakeResponse {
    pub fn authenticated(device_key: impl Into<String>) -> Self {
        Self {
            status: Some(STATUS_AUTHENTICATED.to_string()),
            device_key: Some(device_key.into()),
            ..Default::default()
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            status: Some(STATUS_ERROR.to_string()),
            message: Some(message.into()),
            ..Default::default()
        }
    }

    /// Parse one response line (with or without the trailing newline)
    pub fn from_line(line: &[u8]) -> Result<Self, HandshakeCodecError> {
        let text = std::str::from_utf8(line).map_err(|_| HandshakeCodecError::InvalidUtf8)?;
        Ok(serde_json::from_str(text.trim_end_matches(['\r', '\n']))?)
    }

    /// Serialize as a single newline-terminated line
    pub fn to_line(&self) -> Result<Vec<u8>, HandshakeCodecError> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(line)
    }

    pub fn outcome(&self) -> HandshakeOutcome {
        match self.status.as_deref() {
            Some(STATUS_AUTHENTICATED) => HandshakeOutcome::Authenticated {
                device_key: self.device_key.clone(),
            },
            Some(STATUS_ERROR) => HandshakeOutcome::Rejected {
                reason: self
                    .message
                    .clone()
                    .or_else(|| self.error.clone())
                    .unwrap_or_else(|| "unspecified error".to_string()),
            },
            other => HandshakeOutcome::Unexpected {
                status: other.map(str::to_string),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_line() {
        let line = HandshakeRequest::new("secret", "cam-01").to_line().unwrap();

        assert_eq!(line.last(), Some(&b'\n'));
        assert_eq!(
            std::str::from_utf8(&line).unwrap(),
            "{\"token\":\"secret\",\"name\":\"cam-01\"}\n"
        );
    }

    #[test]
    fn test_authenticated_response() {
        let response =
            HandshakeResponse::from_line(b"{\"status\":\"authenticated\",\"device_key\":\"k1\"}\n")
                .unwrap();

        assert_eq!(
            response.outcome(),
            HandshakeOutcome::Authenticated {
                device_key: Some("k1".to_string())
            }
        );
    }

    #[test]
    fn test_error_response_prefers_message() {
        let response =
            HandshakeResponse::from_line(b"{\"status\":\"error\",\"message\":\"bad token\"}")
                .unwrap();
        assert_eq!(
            response.outcome(),
            HandshakeOutcome::Rejected {
                reason: "bad token".to_string()
            }
        );

        let response =
            HandshakeResponse::from_line(b"{\"status\":\"error\",\"error\":\"expired\"}").unwrap();
        assert_eq!(
            response.outcome(),
            HandshakeOutcome::Rejected {
                reason: "expired".to_string()
            }
        );
    }

    #[test]
    fn test_unexpected_status() {
        let response = HandshakeResponse::from_line(b"{\"status\":\"pending\"}\r\n").unwrap();
        assert_eq!(
            response.outcome(),
            HandshakeOutcome::Unexpected {
                status: Some("pending".to_string())
            }
        );

        let response = HandshakeResponse::from_line(b"{}").unwrap();
        assert_eq!(response.outcome(), HandshakeOutcome::Unexpected { status: None });
    }

    #[test]
    fn test_non_json_line() {
        assert!(matches!(
            HandshakeResponse::from_line(b"HTTP/1.1 400 Bad Request\n"),
            Err(HandshakeCodecError::Json(_))
        ));
        assert!(matches!(
            HandshakeResponse::from_line(&[0xff, 0xfe, b'\n']),
            Err(HandshakeCodecError::InvalidUtf8)
        ));
    }
}
