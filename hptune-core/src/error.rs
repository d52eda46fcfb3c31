//! Error types for the hptune-core crate.

use thiserror::Error;

/// Top-level error type for tuning and run-control operations.
#[derive(Debug, Error)]
pub enum TuneError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Strategy store error: {0}")]
    Store(String),

    #[error("Strategy error: {0}")]
    Strategy(String),

    #[error("Training error: {0}")]
    Training(String),

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Pipeline check failed: {0}")]
    Pipeline(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Submission error: {0}")]
    Submission(String),

    #[error("Notification error: {0}")]
    Notify(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl TuneError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    pub fn strategy(msg: impl Into<String>) -> Self {
        Self::Strategy(msg.into())
    }

    pub fn training(msg: impl Into<String>) -> Self {
        Self::Training(msg.into())
    }

    pub fn worker(msg: impl Into<String>) -> Self {
        Self::Worker(msg.into())
    }

    pub fn pipeline(msg: impl Into<String>) -> Self {
        Self::Pipeline(msg.into())
    }

    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }

    pub fn submission(msg: impl Into<String>) -> Self {
        Self::Submission(msg.into())
    }

    pub fn notify(msg: impl Into<String>) -> Self {
        Self::Notify(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Whether this error must end the run controller.
    ///
    /// Only notification failures are recoverable at the controller level;
    /// pipeline failures are handled where the debug pass runs and never
    /// reach this check.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Notify(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_domain() {
        let err = TuneError::strategy("unknown strategy 'st99'");
        assert_eq!(err.to_string(), "Strategy error: unknown strategy 'st99'");
    }

    #[test]
    fn test_notify_errors_are_not_fatal() {
        assert!(!TuneError::Notify("webhook down".into()).is_fatal());
        assert!(TuneError::store("locked").is_fatal());
        assert!(TuneError::training("loss is NaN").is_fatal());
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: TuneError = io.into();
        assert!(matches!(err, TuneError::Io(_)));
    }
}
