use std::{borrow::Cow, fmt, str::FromStr};

use crate::{error::ChannelError, stanza::Stanza};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
        }
    }
}

impl FromStr for Direction {
    type Err = ChannelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in" => Ok(Direction::In),
            "out" => Ok(Direction::Out),
            other => Err(ChannelError::InvalidValue {
                field: "direction",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Presence,
    Message,
    Iq,
    Stream,
    Data,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Presence => "presence",
            EventKind::Message => "message",
            EventKind::Iq => "iq",
            EventKind::Stream => "stream",
            EventKind::Data => "data",
        }
    }
}

impl From<crate::stanza::StanzaKind> for EventKind {
    fn from(kind: crate::stanza::StanzaKind) -> Self {
        match kind {
            crate::stanza::StanzaKind::Message => EventKind::Message,
            crate::stanza::StanzaKind::Presence => EventKind::Presence,
            crate::stanza::StanzaKind::Iq => EventKind::Iq,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of the XML stream itself, reported as `stream` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamState {
    Open,
    Close,
}

impl StreamState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamState::Open => "open",
            StreamState::Close => "close",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    Stream { state: StreamState },
    Data { content: String },
    Stanza(Stanza),
}

/// A protocol event as seen by channels: a stanza, a raw chunk of wire data,
/// or a change in stream state, tagged with the session it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub kind: EventKind,
    pub direction: Direction,
    /// Full JID of the owning session.
    pub session: String,
    pub payload: EventPayload,
}

impl Event {
    pub fn stanza(direction: Direction, session: impl Into<String>, stanza: Stanza) -> Self {
        Self {
            kind: stanza.kind().into(),
            direction,
            session: session.into(),
            payload: EventPayload::Stanza(stanza),
        }
    }

    pub fn stream(direction: Direction, session: impl Into<String>, state: StreamState) -> Self {
        Self {
            kind: EventKind::Stream,
            direction,
            session: session.into(),
            payload: EventPayload::Stream { state },
        }
    }

    pub fn data(direction: Direction, session: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Data,
            direction,
            session: session.into(),
            payload: EventPayload::Data {
                content: content.into(),
            },
        }
    }

    pub fn as_stanza(&self) -> Option<&Stanza> {
        match &self.payload {
            EventPayload::Stanza(stanza) => Some(stanza),
            _ => None,
        }
    }

    pub fn stream_state(&self) -> Option<StreamState> {
        match &self.payload {
            EventPayload::Stream { state } => Some(*state),
            _ => None,
        }
    }

    pub fn field(&self, field: Field) -> Option<FieldValue<'_>> {
        match field {
            Field::Event => Some(FieldValue::Text(self.kind.as_str())),
            Field::Direction => Some(FieldValue::Text(self.direction.as_str())),
            Field::Session | Field::Account => Some(FieldValue::Text(&self.session)),
            Field::State => self.stream_state().map(|state| FieldValue::Text(state.as_str())),
            Field::Content => match &self.payload {
                EventPayload::Data { content } => Some(FieldValue::Text(content)),
                _ => None,
            },
            Field::Stanza => self.as_stanza().map(FieldValue::Stanza),
            Field::From => self.as_stanza().and_then(Stanza::from).map(FieldValue::Text),
            Field::To => self.as_stanza().and_then(Stanza::to).map(FieldValue::Text),
        }
    }
}

/// Addressable members of an [`Event`], the keys of a pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Field {
    Event,
    Direction,
    Session,
    Account,
    State,
    Content,
    Stanza,
    From,
    To,
}

impl Field {
    pub fn as_str(&self) -> &'static str {
        match self {
            Field::Event => "event",
            Field::Direction => "direction",
            Field::Session => "session",
            Field::Account => "account",
            Field::State => "state",
            Field::Content => "content",
            Field::Stanza => "stanza",
            Field::From => "from",
            Field::To => "to",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Borrowed view of one event member.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue<'a> {
    Text(&'a str),
    Stanza(&'a Stanza),
}

impl<'a> FieldValue<'a> {
    pub fn as_text(&self) -> Cow<'a, str> {
        match self {
            FieldValue::Text(text) => Cow::Borrowed(text),
            FieldValue::Stanza(stanza) => Cow::Owned(stanza.to_string()),
        }
    }

    pub fn as_stanza(&self) -> Option<&'a Stanza> {
        match self {
            FieldValue::Stanza(stanza) => Some(stanza),
            FieldValue::Text(_) => None,
        }
    }

    /// The identity used by identity-ref matchers: the session name for
    /// textual members, the `id` attribute for stanzas.
    pub fn identity(&self) -> Option<&'a str> {
        match self {
            FieldValue::Text(text) => Some(text),
            FieldValue::Stanza(stanza) => stanza.id(),
        }
    }
}

/// Owned value compared by exact matchers.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Text(String),
    Stanza(Stanza),
}

impl Value {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(text) => Some(text),
            Value::Stanza(_) => None,
        }
    }

    pub fn eq_field(&self, field: &FieldValue<'_>) -> bool {
        match (self, field) {
            (Value::Text(expected), FieldValue::Text(actual)) => expected == actual,
            (Value::Stanza(expected), FieldValue::Stanza(actual)) => expected == *actual,
            _ => false,
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<Direction> for Value {
    fn from(value: Direction) -> Self {
        Value::Text(value.as_str().to_string())
    }
}

impl From<EventKind> for Value {
    fn from(value: EventKind) -> Self {
        Value::Text(value.as_str().to_string())
    }
}

impl From<StreamState> for Value {
    fn from(value: StreamState) -> Self {
        Value::Text(value.as_str().to_string())
    }
}

impl From<Stanza> for Value {
    fn from(value: Stanza) -> Self {
        Value::Stanza(value)
    }
}
