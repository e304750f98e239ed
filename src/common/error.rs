//! Error types for quorumkv

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Membership Errors ===
    #[error("Malformed member {member}: {reason}")]
    MalformedMember { member: String, reason: String },

    #[error("Gossip error: {0}")]
    Gossip(String),

    // === State Machine Errors ===
    #[error("Key not found: {0}")]
    NotFound(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Fatal apply failure at index {index}: {reason}")]
    FatalApply { index: u64, reason: String },

    // === Consensus Errors ===
    #[error("Not leader: current leader is {0}")]
    NotLeader(String),

    #[error("Consensus error: {0}")]
    Consensus(String),

    #[error("Consensus timeout")]
    ConsensusTimeout,

    #[error("Write failed: {0}")]
    WriteFailed(String),

    // === Request Errors ===
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // === Generic ===
    #[error("Engine shut down")]
    Shutdown,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConsensusTimeout | Error::NotLeader(_) | Error::WriteFailed(_) | Error::Gossip(_)
        )
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> StatusCode {
        match self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::InvalidRequest(_) | Error::MalformedMember { .. } | Error::InvalidConfig(_) => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Codec(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::ConsensusTimeout
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.to_http_status();
        let label = match status {
            StatusCode::NOT_FOUND => "404 not found",
            StatusCode::BAD_REQUEST => "400 bad request",
            _ => "internal server error",
        };
        (
            status,
            axum::Json(json!({ "status": label, "error": self.to_string() })),
        )
            .into_response()
    }
}
