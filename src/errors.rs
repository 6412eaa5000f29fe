//! Application error model
//!
//! Defines a typed error hierarchy using `thiserror` shared by every stage.
//! Variants mirror the failure classes the migration distinguishes: hard
//! stops (config, permissions, auth), retryable network conditions
//! (transport, throttled), and per-message outcomes (integrity, verify,
//! lock timeout) that are counted but never abort a stage.

use thiserror::Error;

/// Application error type
///
/// Covers all error cases the migration may encounter, from configuration
/// loading through the final upload verification.
#[derive(Debug, Error)]
pub enum AppError {
    /// Configuration file missing, unparseable, or semantically invalid
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
    /// Config file or directory permissions looser than 0600/0700
    #[error("unsafe permissions: {0}")]
    PermissionTooOpen(String),
    /// Authentication failure (expired token, bad IMAP credentials)
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    /// Network or protocol failure that may succeed on retry
    #[error("transport error: {0}")]
    Transport(String),
    /// Server asked us to back off (Graph throttling)
    #[error("throttled: {0}")]
    Throttled(String),
    /// Resource not found (folder, message, state record)
    #[error("not found: {0}")]
    NotFound(String),
    /// Message failed the local integrity check
    #[error("integrity check failed: {0}")]
    Integrity(String),
    /// Advisory lock could not be acquired within the configured wait
    #[error("lock timeout: {0}")]
    LockTimeout(String),
    /// Message was appended but never observed by the verify search
    #[error("upload verification failed: {0}")]
    VerifyFailed(String),
    /// Internal error (unexpected failure, external crate error)
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Convenience constructor for `Transport`
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Whether the operation may be retried with the same inputs
    ///
    /// Only throttling and transport failures qualify. Auth and config
    /// errors abort the stage; integrity and verify failures are terminal
    /// for the message they belong to.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Throttled(_))
    }

    /// Whether this error aborts the whole stage immediately
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ConfigInvalid(_) | Self::PermissionTooOpen(_) | Self::AuthFailed(_)
        )
    }

    /// Process exit code for a stage aborted by this error
    ///
    /// `1` for configuration/dependency problems, `2` for authentication.
    /// Partial failure (exit `3`) and user abort (exit `4`) are decided by
    /// the driver from stage counters, not from a single error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::AuthFailed(_) => 2,
            _ => 1,
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(format!("io error: {err}"))
    }
}

/// Type alias for fallible return values
///
/// Use this for all internal functions that can fail. Provides a consistent
/// error type throughout the codebase.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::AppError;

    #[test]
    fn retryable_covers_only_transport_and_throttled() {
        assert!(AppError::Transport("reset".to_owned()).is_retryable());
        assert!(AppError::Throttled("back off".to_owned()).is_retryable());
        assert!(!AppError::AuthFailed("expired".to_owned()).is_retryable());
        assert!(!AppError::Integrity("short".to_owned()).is_retryable());
        assert!(!AppError::LockTimeout("counter".to_owned()).is_retryable());
    }

    #[test]
    fn exit_codes_distinguish_auth_from_config() {
        assert_eq!(AppError::AuthFailed("401".to_owned()).exit_code(), 2);
        assert_eq!(AppError::ConfigInvalid("bad yaml".to_owned()).exit_code(), 1);
        assert_eq!(AppError::PermissionTooOpen("0644".to_owned()).exit_code(), 1);
    }

    #[test]
    fn fatal_errors_are_the_abort_classes() {
        assert!(AppError::ConfigInvalid("x".to_owned()).is_fatal());
        assert!(AppError::AuthFailed("x".to_owned()).is_fatal());
        assert!(!AppError::Transport("x".to_owned()).is_fatal());
        assert!(!AppError::VerifyFailed("x".to_owned()).is_fatal());
    }
}
