//! Error classification.
//!
//! # Responsibilities
//! - Sort failures into transient, client and unavailable classes
//! - Decide what is retryable and what counts toward a circuit
//!
//! # Design Decisions
//! - Connection errors, timeouts and 5xx are transient
//! - 4xx and validation failures are client errors and never count
//! - Unavailable is its own class so callers can fall back immediately

use serde::{Deserialize, Serialize};

/// Failure class shared by every kernel component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Timeout, connection reset, dependency 5xx.
    Transient,
    /// Validation failure, 4xx-equivalent.
    Client,
    /// Breaker open or backing store unreachable.
    Unavailable,
}

impl ErrorClass {
    /// Only transient failures are worth another attempt.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorClass::Transient)
    }

    /// Only transient failures are attributed to the dependency.
    pub fn counts_toward_circuit(self) -> bool {
        matches!(self, ErrorClass::Transient)
    }

    /// Classify an HTTP-like status code.
    ///
    /// 408 and 429 are transient even though they are in the 4xx range.
    pub fn from_status(status: u16) -> Self {
        match status {
            408 | 429 => ErrorClass::Transient,
            400..=499 => ErrorClass::Client,
            _ => ErrorClass::Transient,
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::Transient => write!(f, "transient"),
            ErrorClass::Client => write!(f, "client"),
            ErrorClass::Unavailable => write!(f, "unavailable"),
        }
    }
}

/// Errors that know their own class.
pub trait Classify {
    fn class(&self) -> ErrorClass;
}

impl Classify for std::io::Error {
    fn class(&self) -> ErrorClass {
        use std::io::ErrorKind;
        match self.kind() {
            ErrorKind::InvalidInput
            | ErrorKind::InvalidData
            | ErrorKind::NotFound
            | ErrorKind::PermissionDenied
            | ErrorKind::AlreadyExists
            | ErrorKind::Unsupported => ErrorClass::Client,
            _ => ErrorClass::Transient,
        }
    }
}

impl Classify for tokio::time::error::Elapsed {
    fn class(&self) -> ErrorClass {
        ErrorClass::Transient
    }
}
