//! Error handling for the acquisition service
//!
//! Every failure the pipeline can hit maps onto one of these variants. None
//! of them is fatal to the process: the schedulers log and carry on.

use thiserror::Error;

use crate::model::PointKind;

/// Acquisition service error type
#[derive(Error, Debug)]
pub enum TrendSrvError {
    /// Invalid or unreadable configuration
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Device unreachable, handshake failed, or link lost
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// A single point could not be read
    #[error("Read error: {tag}: {reason}")]
    ReadError { tag: String, reason: String },

    /// A point of a kind with no fallback reading failed to read
    #[error("No fallback for {kind} point {tag}: {reason}")]
    NoFallback {
        tag: String,
        kind: PointKind,
        reason: String,
    },

    /// Batch write or query failure
    #[error("Persistence error: {0}")]
    PersistenceError(String),

    /// Retention sweep failure for one or more reading kinds
    #[error("Retention error: {0}")]
    RetentionError(String),

    /// Requested feature or driver is not available
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Anything else
    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Result type alias for the acquisition service
pub type Result<T> = std::result::Result<T, TrendSrvError>;

impl TrendSrvError {
    pub fn config(msg: impl Into<String>) -> Self {
        TrendSrvError::ConfigError(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        TrendSrvError::ConnectionError(msg.into())
    }

    pub fn read(tag: impl Into<String>, reason: impl Into<String>) -> Self {
        TrendSrvError::ReadError {
            tag: tag.into(),
            reason: reason.into(),
        }
    }

    pub fn persistence(msg: impl Into<String>) -> Self {
        TrendSrvError::PersistenceError(msg.into())
    }

    pub fn retention(msg: impl Into<String>) -> Self {
        TrendSrvError::RetentionError(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        TrendSrvError::Unsupported(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        TrendSrvError::InternalError(msg.into())
    }
}

impl From<sqlx::Error> for TrendSrvError {
    fn from(err: sqlx::Error) -> Self {
        TrendSrvError::PersistenceError(err.to_string())
    }
}

impl From<figment::Error> for TrendSrvError {
    fn from(err: figment::Error) -> Self {
        TrendSrvError::ConfigError(err.to_string())
    }
}

impl From<anyhow::Error> for TrendSrvError {
    fn from(err: anyhow::Error) -> Self {
        TrendSrvError::InternalError(format!("{:#}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_error_display() {
        let err = TrendSrvError::read("T2", "timeout");
        assert_eq!(err.to_string(), "Read error: T2: timeout");
    }

    #[test]
    fn test_no_fallback_display() {
        let err = TrendSrvError::NoFallback {
            tag: "Recipe".to_string(),
            kind: PointKind::DataBlock,
            reason: "address out of range".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "No fallback for DataBlock point Recipe: address out of range"
        );
    }

    #[test]
    fn test_sqlx_error_maps_to_persistence() {
        let err: TrendSrvError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, TrendSrvError::PersistenceError(_)));
    }

    #[test]
    fn test_anyhow_error_maps_to_internal() {
        let err: TrendSrvError = anyhow::anyhow!("pool closed").into();
        assert!(matches!(err, TrendSrvError::InternalError(ref m) if m.contains("pool closed")));
    }
}
