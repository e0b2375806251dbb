pub mod account;
pub mod channel;
pub mod config;
pub mod error;
pub mod event;
pub mod features;
pub mod jid;
pub mod pattern;
pub mod stanza;
pub mod telemetry;

pub use account::{Account, AccountStore, ConnectOptions};
pub use channel::{ChannelHub, EventChannel, EventSink, Handler};
pub use error::{ChannelError, PerchError, Result, StanzaError};
pub use event::{Direction, Event, EventKind, EventPayload, Field, FieldValue, StreamState, Value};
pub use features::{FeatureRegistry, FeatureSet};
pub use jid::JidParts;
pub use pattern::{Matcher, Pattern, matches};
pub use stanza::{Stanza, StanzaKind};
