use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for the decision pipeline
#[derive(Error, Debug)]
pub enum DeskError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Cycle lifecycle errors
    #[error("Cycle for {date} already {status}")]
    CycleConflict { date: String, status: String },

    #[error("Portfolio state unavailable: {0}")]
    PortfolioUnavailable(String),

    #[error("Circuit breaker state corrupted: {0}")]
    BreakerStateCorrupted(String),

    // Order path errors
    #[error("Order rejected by broker: {0}")]
    OrderRejected(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for DeskError
pub type Result<T> = std::result::Result<T, DeskError>;

/// Coarse classification used to decide how a failure propagates through a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Retried inside the adapter, then absorbed as a degraded cycle
    Transient,
    /// Instrument excluded, cycle continues degraded
    DataQuality,
    /// Surfaced per order as a verdict
    PolicyViolation,
    /// Returned to the caller at the coordinator boundary
    StateConflict,
    /// Aborts the cycle
    Fatal,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::Transient => write!(f, "transient"),
            ErrorClass::DataQuality => write!(f, "data_quality"),
            ErrorClass::PolicyViolation => write!(f, "policy_violation"),
            ErrorClass::StateConflict => write!(f, "state_conflict"),
            ErrorClass::Fatal => write!(f, "fatal"),
        }
    }
}

impl DeskError {
    pub fn class(&self) -> ErrorClass {
        match self {
            DeskError::OrderRejected(_) => ErrorClass::PolicyViolation,
            DeskError::CycleConflict { .. } => ErrorClass::StateConflict,
            DeskError::Config(_)
            | DeskError::InvalidConfig(_)
            | DeskError::Json(_)
            | DeskError::PortfolioUnavailable(_)
            | DeskError::BreakerStateCorrupted(_)
            | DeskError::Io(_)
            | DeskError::Internal(_)
            | DeskError::Other(_) => ErrorClass::Fatal,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Fatal
    }
}

/// Why a producer call failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    SourceUnavailable,
    InvalidData,
    Unknown,
    /// Halt observed while waiting to retry
    Cancelled,
}

impl FailureKind {
    /// Only transport-level failures are worth another attempt.
    pub fn is_retryable(self) -> bool {
        matches!(self, FailureKind::Timeout | FailureKind::SourceUnavailable)
    }

    pub fn class(self) -> ErrorClass {
        match self {
            FailureKind::Timeout | FailureKind::SourceUnavailable | FailureKind::Cancelled => {
                ErrorClass::Transient
            }
            FailureKind::InvalidData | FailureKind::Unknown => ErrorClass::DataQuality,
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Timeout => write!(f, "timeout"),
            FailureKind::SourceUnavailable => write!(f, "source_unavailable"),
            FailureKind::InvalidData => write!(f, "invalid_data"),
            FailureKind::Unknown => write!(f, "unknown"),
            FailureKind::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Failure returned by a single producer call
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct ProducerFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl ProducerFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Timeout, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(FailureKind::SourceUnavailable, message)
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(FailureKind::InvalidData, message)
    }
}
