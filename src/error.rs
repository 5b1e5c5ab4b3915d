//! Error types and handling for the VPN lifecycle controller

use thiserror::Error;

/// Main error type for lifecycle operations
#[derive(Error, Debug)]
pub enum LifecycleError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Policy source unavailable or returned malformed data
    #[error("Policy read failed: {0}")]
    PolicyRead(String),

    /// Presenter rejected a notification post
    #[error("Notification post failed: {0}")]
    NotificationPost(String),

    /// An application identifier did not resolve against the registry
    #[error("Package validation failed for '{package}': {reason}")]
    PackageValidation { package: String, reason: String },

    /// Engine rejected or could not honor a connect request
    #[error("Engine connect failed: {0}")]
    EngineConnect(String),

    /// Engine rejected a disconnect request
    #[error("Engine disconnect failed: {0}")]
    EngineDisconnect(String),

    /// Implicit start refused because the environment is not eligible
    #[error("Restart not eligible: {0}")]
    IneligibleRestart(String),

    /// TUN/TAP interface errors
    #[error("TUN/TAP error: {0}")]
    TunTap(String),

    /// Persisted intent could not be read or written
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Unknown command delivered by the host
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid state errors
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Other errors
    #[error("Other error: {0}")]
    Other(String),
}

/// Result type alias for lifecycle operations
pub type Result<T> = std::result::Result<T, LifecycleError>;

/// Helper trait for converting errors to LifecycleError
pub trait IntoLifecycleError<T> {
    fn into_lifecycle_error(self, context: &str) -> Result<T>;
}

impl<T, E> IntoLifecycleError<T> for std::result::Result<T, E>
where
    E: std::fmt::Display,
{
    fn into_lifecycle_error(self, context: &str) -> Result<T> {
        self.map_err(|e| LifecycleError::Other(format!("{context}: {e}")))
    }
}

impl From<toml::de::Error> for LifecycleError {
    fn from(err: toml::de::Error) -> Self {
        LifecycleError::Config(format!("TOML parsing error: {err}"))
    }
}

impl From<tun::Error> for LifecycleError {
    fn from(err: tun::Error) -> Self {
        LifecycleError::TunTap(err.to_string())
    }
}
