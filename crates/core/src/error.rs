use thiserror::Error;

/// The universal error type for Perch.
#[derive(Error, Debug)]
pub enum PerchError {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Stanza error: {0}")]
    Stanza(#[from] StanzaError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("XMPP error: {0}")]
    Xmpp(String),

    #[error("Presence error: {0}")]
    Presence(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A specialized Result type for Perch operations.
pub type Result<T> = std::result::Result<T, PerchError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StanzaError {
    #[error("stanza parse failed: {0}")]
    ParseFailed(String),

    #[error("stanza serialization failed: {0}")]
    SerializeFailed(String),

    #[error("unsupported stanza element <{0}/>")]
    UnsupportedElement(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("invalid value {value:?} for field {field}")]
    InvalidValue { field: &'static str, value: String },

    #[error("invalid pattern: {0}")]
    InvalidPattern(String),

    #[error("invalid feature list: {0}")]
    InvalidFeatures(String),
}
