//! Error types for cache operations

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Result type for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

/// Error type shared by every engine and the layers above them
#[derive(Debug)]
pub enum CacheError {
    /// Key failed validation; this is a programmer error and is never
    /// absorbed by the facade's soft-fail policy
    InvalidKey { key: String, reason: String },

    /// No engine (or the named engine) is currently available
    EngineUnavailable { engine: String },

    /// TCP connection to a remote node could not be established
    ConnectionFailed {
        addr: String,
        source: std::io::Error,
    },

    /// The pool is at capacity and no idle connection exists
    PoolExhausted { in_use: usize, max: usize },

    /// A bounded operation exceeded its configured timeout
    Timeout {
        operation: &'static str,
        duration: Duration,
    },

    /// No healthy node of the required class remains
    NoHealthyNode { role: &'static str },

    /// Encoding or decoding a payload (or a wire frame) failed
    SerializationFailed { context: String, detail: String },

    /// Numeric operation applied to a non-numeric existing value
    TypeMismatch { key: String, detail: String },

    /// Cluster configuration is invalid; fatal at construction
    ClusterMisconfigured { reason: String },

    /// Filesystem fault in the file engine
    Io {
        path: PathBuf,
        operation: &'static str,
        source: std::io::Error,
    },

    /// Operation was cancelled while the command was in flight
    CancelledDuringDispatch { operation: &'static str },
}

impl CacheError {
    /// Stable kind label used in logs and by the facade's error counter
    pub fn kind(&self) -> &'static str {
        match self {
            CacheError::InvalidKey { .. } => "InvalidKey",
            CacheError::EngineUnavailable { .. } => "EngineUnavailable",
            CacheError::ConnectionFailed { .. } => "ConnectionFailed",
            CacheError::PoolExhausted { .. } => "PoolExhausted",
            CacheError::Timeout { .. } => "Timeout",
            CacheError::NoHealthyNode { .. } => "NoHealthyNode",
            CacheError::SerializationFailed { .. } => "SerializationFailed",
            CacheError::TypeMismatch { .. } => "TypeMismatch",
            CacheError::ClusterMisconfigured { .. } => "ClusterMisconfigured",
            CacheError::Io { .. } => "IoError",
            CacheError::CancelledDuringDispatch { .. } => "CancelledDuringDispatch",
        }
    }

    /// Whether the remote engine's retry loop may re-attempt the operation
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CacheError::ConnectionFailed { .. }
                | CacheError::PoolExhausted { .. }
                | CacheError::Timeout { .. }
        )
    }

    pub fn invalid_key(key: impl Into<String>, reason: impl Into<String>) -> Self {
        CacheError::InvalidKey {
            key: key.into(),
            reason: reason.into(),
        }
    }

    pub fn serialization(context: impl Into<String>, detail: impl fmt::Display) -> Self {
        CacheError::SerializationFailed {
            context: context.into(),
            detail: detail.to_string(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, operation: &'static str, source: std::io::Error) -> Self {
        CacheError::Io {
            path: path.into(),
            operation,
            source,
        }
    }
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::InvalidKey { key, reason } => {
                write!(f, "invalid cache key {key:?}: {reason}")
            }
            CacheError::EngineUnavailable { engine } => {
                write!(f, "cache engine unavailable: {engine}")
            }
            CacheError::ConnectionFailed { addr, source } => {
                write!(f, "connection to {addr} failed: {source}")
            }
            CacheError::PoolExhausted { in_use, max } => {
                write!(f, "connection pool exhausted ({in_use}/{max} in use)")
            }
            CacheError::Timeout {
                operation,
                duration,
            } => {
                write!(f, "{operation} timed out after {duration:?}")
            }
            CacheError::NoHealthyNode { role } => {
                write!(f, "no healthy {role} node available")
            }
            CacheError::SerializationFailed { context, detail } => {
                write!(f, "serialization failed for {context}: {detail}")
            }
            CacheError::TypeMismatch { key, detail } => {
                write!(f, "type mismatch on {key:?}: {detail}")
            }
            CacheError::ClusterMisconfigured { reason } => {
                write!(f, "cluster misconfigured: {reason}")
            }
            CacheError::Io {
                path,
                operation,
                source,
            } => {
                write!(f, "failed to {operation} {}: {source}", path.display())
            }
            CacheError::CancelledDuringDispatch { operation } => {
                write!(f, "{operation} cancelled during dispatch")
            }
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CacheError::ConnectionFailed { source, .. } | CacheError::Io { source, .. } => {
                Some(source)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_labels_are_stable() {
        let err = CacheError::invalid_key("k", "bad");
        assert_eq!(err.kind(), "InvalidKey");

        let err = CacheError::Timeout {
            operation: "GET",
            duration: Duration::from_secs(1),
        };
        assert_eq!(err.kind(), "Timeout");
        assert!(err.is_transient());
    }

    #[test]
    fn invalid_key_is_not_transient() {
        assert!(!CacheError::invalid_key("k", "bad").is_transient());
    }

    #[test]
    fn display_includes_context() {
        let err = CacheError::NoHealthyNode { role: "slave" };
        assert_eq!(err.to_string(), "no healthy slave node available");
    }
}
