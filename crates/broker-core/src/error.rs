//! Error types shared across the exit-engine workspace.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Broker API error: {message}")]
    Api { message: String, status: Option<u16> },

    #[error("Broker token invalid or expired: {0}")]
    Token(String),

    #[error("Order rejected by broker: {0}")]
    OrderRejected(String),

    #[error("Invalid input: {0}")]
    Input(String),

    #[error("Malformed broker data: {0}")]
    Data(String),

    #[error("Credential encryption error: {0}")]
    Crypto(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No active broker account configured for user {0}")]
    NotConfigured(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Whether a failed broker call is worth retrying (network trouble,
    /// timeouts, 5xx responses). Auth, input and rejection errors are not.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Error::WebSocket(_) => true,
            Error::Api { status, .. } => matches!(status, Some(s) if *s >= 500),
            _ => false,
        }
    }

    /// Whether the error indicates an expired or invalid broker session.
    pub fn is_auth(&self) -> bool {
        matches!(self, Error::Token(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let server_err = Error::Api {
            message: "gateway timeout".to_string(),
            status: Some(504),
        };
        assert!(server_err.is_transient());

        let client_err = Error::Api {
            message: "bad order".to_string(),
            status: Some(400),
        };
        assert!(!client_err.is_transient());

        assert!(!Error::OrderRejected("insufficient margin".to_string()).is_transient());
        assert!(!Error::Token("expired".to_string()).is_transient());
    }

    #[test]
    fn test_auth_classification() {
        assert!(Error::Token("expired".to_string()).is_auth());
        assert!(!Error::Input("bad quantity".to_string()).is_auth());
    }
}
