//! Error types for vidtrackr-sync

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Transient error: {0}")]
    Transient(String),

    #[error("Request timeout: {0}")]
    Timeout(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Broadcast error: {0}")]
    Broadcast(String),

    #[error("Initialization failed: {0}")]
    Init(#[from] InitError),

    #[error("No conflict is pending")]
    NoConflict,

    #[error("Sync engine stopped")]
    Stopped,

    #[error("Configuration error: {0}")]
    Config(String),
}

/// How the coordinator reacts to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Credential invalid or expired; user must re-authenticate.
    Unauthorized,
    /// Remote document or cell absent; recovered by provisioning.
    NotFound,
    /// Network, rate limit, timeout or malformed remote data.
    Transient,
    /// Local storage or programming error.
    Local,
}

impl SyncError {
    pub fn class(&self) -> ErrorClass {
        match self {
            SyncError::Unauthorized(_) => ErrorClass::Unauthorized,
            SyncError::NotFound(_) => ErrorClass::NotFound,
            SyncError::Transient(_) | SyncError::Timeout(_) | SyncError::Parse(_) => {
                ErrorClass::Transient
            }
            SyncError::Http(e) => match e.status().map(|s| s.as_u16()) {
                Some(401) | Some(403) => ErrorClass::Unauthorized,
                Some(404) => ErrorClass::NotFound,
                _ => ErrorClass::Transient,
            },
            SyncError::Json(_) => ErrorClass::Transient,
            SyncError::Database(_)
            | SyncError::Io(_)
            | SyncError::Broadcast(_)
            | SyncError::Init(_)
            | SyncError::NoConflict
            | SyncError::Stopped
            | SyncError::Config(_) => ErrorClass::Local,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        self.class() == ErrorClass::Unauthorized
    }

    pub fn is_not_found(&self) -> bool {
        self.class() == ErrorClass::NotFound
    }
}

/// Failure of the credential subsystem to come up.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InitError {
    /// The supporting libraries never became available (blocked or absent).
    #[error("supporting libraries not loaded: {0}")]
    MissingLibraries(String),

    #[error("timed out after {0}ms")]
    Timeout(u64),

    #[error("{0}")]
    Failed(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert_eq!(
            SyncError::Unauthorized("expired".into()).class(),
            ErrorClass::Unauthorized
        );
        assert_eq!(SyncError::NotFound("cell".into()).class(), ErrorClass::NotFound);
        assert_eq!(SyncError::Timeout("fetch".into()).class(), ErrorClass::Transient);
        assert_eq!(SyncError::Parse("bad".into()).class(), ErrorClass::Transient);
        assert_eq!(SyncError::NoConflict.class(), ErrorClass::Local);
        assert!(SyncError::NotFound("x".into()).is_not_found());
        assert!(!SyncError::Transient("x".into()).is_unauthorized());
    }

    #[test]
    fn test_init_error_display() {
        let err = SyncError::from(InitError::Timeout(13000));
        assert_eq!(err.to_string(), "Initialization failed: timed out after 13000ms");
    }
}
