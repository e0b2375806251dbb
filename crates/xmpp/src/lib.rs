pub mod codec;
pub mod error;
pub mod manager;
pub mod session;
pub mod transport;

pub use codec::{Frame, StreamHeader, StreamParser};
pub use error::{CodecError, ConnectionError, SessionError};
pub use manager::SessionManager;
pub use session::{Continuation, Effect, FailureReason, ReplyHandler, Session, SessionState};
pub use transport::{
    TcpTransport, TcpTransportFactory, Transport, TransportEvent, TransportFactory,
    TransportNotice, TransportNotifier,
};
