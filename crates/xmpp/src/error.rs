use perch_core::StanzaError;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("DNS resolution failed: {0}")]
    DnsResolutionFailed(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshakeFailed(String),

    #[error("connection closed")]
    Closed,

    #[error("no async runtime available to drive the transport")]
    NoRuntime,

    #[error("transport error: {0}")]
    TransportError(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("invalid UTF-8 on the wire: {0}")]
    InvalidUtf8(String),

    #[error("malformed XML: {0}")]
    MalformedXml(String),

    #[error(transparent)]
    Stanza(#[from] StanzaError),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("invalid JID {0:?}: expected user@host/resource")]
    InvalidJid(String),

    #[error("authentication failed for {jid}: {condition}")]
    AuthenticationFailed { jid: String, condition: String },

    #[error("transport failure: {0}")]
    TransportFailure(#[from] ConnectionError),

    #[error("stream failure: {0}")]
    Codec(#[from] CodecError),

    #[error("no session for {0} and no account to bring it up")]
    NotConnected(String),

    #[error("session {0} was closed")]
    Closed(String),
}

impl From<SessionError> for perch_core::PerchError {
    fn from(error: SessionError) -> Self {
        perch_core::PerchError::Xmpp(error.to_string())
    }
}
