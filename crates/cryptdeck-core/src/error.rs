//! Error type shared by every cryptdeck crate.

use thiserror::Error;

/// Failures that can escape library entry points.
///
/// Transition-level conditions (wrong passphrase, disconnected volume, …) never
/// surface here; the controller folds them into a `TransitionOutcome`.
#[derive(Debug, Error)]
pub enum CryptdeckError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to parse configuration: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("volume `{0}` is not configured in the volume table")]
    VolumeNotConfigured(String),

    #[error("presentation channel closed before the interaction was answered")]
    InteractionClosed,

    #[error("another volume transition is still in flight")]
    TransitionInFlight,
}

pub type CryptdeckResult<T> = Result<T, CryptdeckError>;
