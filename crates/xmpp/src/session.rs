use std::{
    collections::{HashMap, VecDeque},
    fmt,
};

use perch_core::{
    ConnectOptions, Direction, Event, JidParts, Stanza, StanzaKind, StreamState, stanza::ns,
};
use tracing::{debug, info, warn};
use xmpp_parsers::minidom::Element;

use crate::{
    codec::{self, Frame, STREAM_CLOSE, StreamParser},
    error::{ConnectionError, SessionError},
    transport::{Transport, TransportEvent},
};

/// Receives the signed-on JID, or why sign-on failed.
pub type Continuation = Box<dyn FnOnce(Result<String, SessionError>) + Send>;

/// Receives the first inbound stanza answering a request.
pub type ReplyHandler = Box<dyn FnOnce(&Event) -> anyhow::Result<()> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureReason {
    AuthenticationFailed,
    TransportFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Disconnected,
    Connecting,
    StreamOpen,
    Authenticating,
    RosterSync,
    Available,
    Closing,
    Failed(FailureReason),
}

impl SessionState {
    /// Between `connect` and sign-on completion.
    pub fn is_negotiating(&self) -> bool {
        matches!(
            self,
            SessionState::Connecting
                | SessionState::StreamOpen
                | SessionState::Authenticating
                | SessionState::RosterSync
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::StreamOpen => "stream-open",
            SessionState::Authenticating => "authenticating",
            SessionState::RosterSync => "roster-sync",
            SessionState::Available => "available",
            SessionState::Closing => "closing",
            SessionState::Failed(FailureReason::AuthenticationFailed) => "failed(auth)",
            SessionState::Failed(FailureReason::TransportFailure) => "failed(transport)",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Work a session hands back to its owner, to be carried out in order once
/// the owner no longer holds the session.
pub enum Effect {
    Publish(Event),
    Reply {
        handler: ReplyHandler,
        event: Event,
    },
    Complete {
        continuation: Continuation,
        result: Result<String, SessionError>,
    },
}

impl fmt::Debug for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Effect::Publish(event) => f.debug_tuple("Publish").field(event).finish(),
            Effect::Reply { event, .. } => f.debug_struct("Reply").field("event", event).finish(),
            Effect::Complete { result, .. } => {
                f.debug_struct("Complete").field("result", result).finish()
            }
        }
    }
}

enum Pending {
    Auth,
    Reply(ReplyHandler),
}

/// Checks that `jid` is a full user JID (`user@host/resource`).
pub fn parse_session_jid(jid: &str) -> Result<JidParts, SessionError> {
    JidParts::parse(jid)
        .filter(JidParts::is_full_user_jid)
        .ok_or_else(|| SessionError::InvalidJid(jid.to_string()))
}

pub fn next_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// One account's connection: stream negotiation, legacy authentication,
/// roster request, initial presence and reply correlation.
pub struct Session {
    jid: JidParts,
    full_jid: String,
    password: String,
    options: ConnectOptions,
    default_port: u16,
    state: SessionState,
    transport: Box<dyn Transport>,
    connection: u64,
    parser: StreamParser,
    pending: HashMap<String, Pending>,
    queued: VecDeque<(Stanza, Option<ReplyHandler>)>,
    continuations: Vec<Continuation>,
}

impl Session {
    pub fn new(
        jid: JidParts,
        password: impl Into<String>,
        options: ConnectOptions,
        default_port: u16,
        transport: Box<dyn Transport>,
        connection: u64,
    ) -> Self {
        let full_jid = jid.to_string();
        Self {
            jid,
            full_jid,
            password: password.into(),
            options,
            default_port,
            state: SessionState::Disconnected,
            transport,
            connection,
            parser: StreamParser::new(),
            pending: HashMap::new(),
            queued: VecDeque::new(),
            continuations: Vec::new(),
        }
    }

    pub fn jid(&self) -> &str {
        &self.full_jid
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn connection(&self) -> u64 {
        self.connection
    }

    pub fn pending_replies(&self) -> usize {
        self.pending.len()
    }

    pub fn queued(&self) -> usize {
        self.queued.len()
    }

    /// Starts sign-on. An available session completes `continuation` right
    /// away; one that is still negotiating completes it with the others.
    pub fn connect(&mut self, continuation: Option<Continuation>) -> Vec<Effect> {
        let mut effects = Vec::new();
        let state = self.state;
        match state {
            SessionState::Available => {
                if let Some(continuation) = continuation {
                    effects.push(Effect::Complete {
                        continuation,
                        result: Ok(self.full_jid.clone()),
                    });
                }
            }
            state if state.is_negotiating() => self.continuations.extend(continuation),
            SessionState::Closing => {
                if let Some(continuation) = continuation {
                    effects.push(Effect::Complete {
                        continuation,
                        result: Err(SessionError::Closed(self.full_jid.clone())),
                    });
                }
            }
            _ => {
                self.continuations.extend(continuation);
                self.parser.reset();

                let host = self
                    .options
                    .host
                    .clone()
                    .unwrap_or_else(|| self.jid.hostname.clone());
                let port = self.options.port.unwrap_or(self.default_port);
                let tls = self.options.tls;

                self.transition(SessionState::Connecting);
                info!(session = %self.full_jid, %host, port, tls, "connecting");
                if let Err(error) = self.transport.connect(&host, port, tls) {
                    self.fail(FailureReason::TransportFailure, error.into(), &mut effects);
                }
            }
        }
        effects
    }

    pub fn handle_transport(&mut self, event: TransportEvent) -> Vec<Effect> {
        let mut effects = Vec::new();
        match event {
            TransportEvent::Ready => self.on_ready(&mut effects),
            TransportEvent::Data(data) => self.on_data(&data, &mut effects),
            TransportEvent::Stop { error } => self.on_stop(error, &mut effects),
        }
        effects
    }

    /// Sends `stanza`, or queues it while sign-on is in progress. When
    /// `reply` is given, the stanza gets an `id` if it lacks one and the
    /// first inbound stanza carrying that id is routed to `reply`.
    pub fn send(
        &mut self,
        stanza: Stanza,
        reply: Option<ReplyHandler>,
    ) -> Result<Vec<Effect>, SessionError> {
        let mut effects = Vec::new();
        let state = self.state;
        match state {
            SessionState::Available => {
                self.write_stanza(stanza, reply.map(Pending::Reply), &mut effects)?;
            }
            state if state.is_negotiating() => {
                debug!(session = %self.full_jid, stanza = stanza.name(), "queueing until available");
                self.queued.push_back((stanza, reply));
            }
            _ => return Err(SessionError::NotConnected(self.full_jid.clone())),
        }
        Ok(effects)
    }

    /// Signs off: unavailable presence, stream close, transport close.
    pub fn close(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        let state = self.state;
        if !(state == SessionState::Available || state.is_negotiating()) {
            debug!(session = %self.full_jid, %state, "close ignored");
            return effects;
        }

        if state == SessionState::Available {
            let unavailable = Stanza::new(StanzaKind::Presence, |presence| {
                presence.attr("type", "unavailable")
            });
            if let Err(error) = self.write_stanza(unavailable, None, &mut effects) {
                warn!(session = %self.full_jid, %error, "failed to send unavailable presence");
            }
        }
        if state != SessionState::Connecting {
            self.write_stream_close(&mut effects);
        }
        self.transport.close();

        self.drop_pending("closed");
        let closed = SessionError::Closed(self.full_jid.clone());
        self.complete_all(Err(closed), &mut effects);
        self.transition(SessionState::Closing);
        info!(session = %self.full_jid, "signing off");
        effects
    }

    fn on_ready(&mut self, effects: &mut Vec<Effect>) {
        if self.state != SessionState::Connecting {
            debug!(session = %self.full_jid, state = %self.state, "ignoring transport ready");
            return;
        }

        let header = codec::stream_header(&self.jid.hostname);
        effects.push(Effect::Publish(Event::stream(
            Direction::Out,
            &self.full_jid,
            StreamState::Open,
        )));
        match self.write_raw(&header, effects) {
            Ok(()) => self.transition(SessionState::StreamOpen),
            Err(error) => self.fail(FailureReason::TransportFailure, error.into(), effects),
        }
    }

    fn on_data(&mut self, data: &[u8], effects: &mut Vec<Effect>) {
        if !(self.state == SessionState::Available
            || self.state == SessionState::Closing
            || self.state.is_negotiating())
        {
            debug!(session = %self.full_jid, state = %self.state, bytes = data.len(), "ignoring data");
            return;
        }

        effects.push(Effect::Publish(Event::data(
            Direction::In,
            &self.full_jid,
            String::from_utf8_lossy(data),
        )));

        let frames = match self.parser.feed(data) {
            Ok(frames) => frames,
            Err(error) => {
                warn!(session = %self.full_jid, %error, "unparseable stream data");
                if self.state.is_negotiating() {
                    self.fail(FailureReason::TransportFailure, error.into(), effects);
                } else {
                    self.abort_stream(effects);
                }
                return;
            }
        };

        for frame in frames {
            match frame {
                Frame::StreamOpen(header) => {
                    debug!(session = %self.full_jid, stream_id = ?header.id, "stream acknowledged");
                    effects.push(Effect::Publish(Event::stream(
                        Direction::In,
                        &self.full_jid,
                        StreamState::Open,
                    )));
                    if self.state == SessionState::StreamOpen {
                        self.authenticate(effects);
                    }
                }
                Frame::Stanza(stanza) => self.on_stanza(stanza, effects),
                Frame::Element(element) if element.is("error", ns::STREAM) => {
                    let condition = element.children().next().map(|c| c.name().to_string());
                    warn!(session = %self.full_jid, condition = ?condition, "stream error");
                }
                Frame::Element(element) => {
                    debug!(session = %self.full_jid, element = element.name(), "ignoring element");
                }
                Frame::StreamClose => {
                    effects.push(Effect::Publish(Event::stream(
                        Direction::In,
                        &self.full_jid,
                        StreamState::Close,
                    )));
                    if self.state != SessionState::Closing {
                        self.abort_stream(effects);
                    }
                }
            }

            if matches!(self.state, SessionState::Failed(_)) {
                break;
            }
        }
    }

    fn on_stop(&mut self, error: Option<ConnectionError>, effects: &mut Vec<Effect>) {
        let state = self.state;
        match state {
            state if state.is_negotiating() => {
                let error = error.unwrap_or(ConnectionError::Closed);
                self.fail(FailureReason::TransportFailure, error.into(), effects);
            }
            SessionState::Available | SessionState::Closing => {
                if state == SessionState::Available {
                    warn!(session = %self.full_jid, error = ?error, "connection lost");
                }
                self.drop_pending("transport stopped");
                self.queued.clear();
                self.parser.reset();
                self.transition(SessionState::Disconnected);
                info!(session = %self.full_jid, "signed off");
            }
            state => debug!(session = %self.full_jid, %state, "ignoring transport stop"),
        }
    }

    fn on_stanza(&mut self, stanza: Stanza, effects: &mut Vec<Effect>) {
        let event = Event::stanza(Direction::In, &self.full_jid, stanza.clone());
        effects.push(Effect::Publish(event.clone()));

        let Some(id) = stanza.id() else {
            return;
        };
        match self.pending.remove(id) {
            Some(Pending::Auth) => self.on_auth_reply(&stanza, effects),
            Some(Pending::Reply(handler)) => effects.push(Effect::Reply { handler, event }),
            None if stanza.kind() == StanzaKind::Iq
                && matches!(stanza.type_(), Some("result" | "error")) =>
            {
                debug!(session = %self.full_jid, id, "dropping unmatched reply");
            }
            None => {}
        }
    }

    fn authenticate(&mut self, effects: &mut Vec<Effect>) {
        let username = self.jid.username.clone().unwrap_or_default();
        let resource = self.jid.resource.clone().unwrap_or_default();
        let query = Element::builder("query", ns::AUTH)
            .append(Element::builder("username", ns::AUTH).append(username))
            .append(Element::builder("password", ns::AUTH).append(self.password.clone()))
            .append(Element::builder("resource", ns::AUTH).append(resource));
        let host = self.jid.hostname.clone();
        let iq = Stanza::new(StanzaKind::Iq, |iq| {
            iq.attr("to", host).attr("type", "set").append(query)
        });

        self.transition(SessionState::Authenticating);
        if let Err(error) = self.write_stanza(iq, Some(Pending::Auth), effects) {
            self.fail(FailureReason::TransportFailure, error, effects);
        }
    }

    fn on_auth_reply(&mut self, reply: &Stanza, effects: &mut Vec<Effect>) {
        if reply.type_() != Some("result") {
            let condition = reply
                .element()
                .children()
                .find(|child| child.name() == "error")
                .and_then(|error| error.children().next())
                .map(|condition| condition.name().to_string())
                .unwrap_or_else(|| "not-authorized".to_string());
            warn!(session = %self.full_jid, %condition, "authentication failed");

            self.write_stream_close(effects);
            let error = SessionError::AuthenticationFailed {
                jid: self.full_jid.clone(),
                condition,
            };
            self.fail(FailureReason::AuthenticationFailed, error, effects);
            return;
        }

        self.transition(SessionState::RosterSync);
        let roster = Stanza::new(StanzaKind::Iq, |iq| {
            iq.attr("type", "get")
                .append(Element::builder("query", ns::ROSTER))
        });
        let presence = Stanza::new(StanzaKind::Presence, |presence| presence);
        for stanza in [roster, presence] {
            if let Err(error) = self.write_stanza(stanza, None, effects) {
                self.fail(FailureReason::TransportFailure, error, effects);
                return;
            }
        }

        self.transition(SessionState::Available);
        info!(session = %self.full_jid, "signed on");

        while let Some((stanza, reply)) = self.queued.pop_front() {
            if let Err(error) = self.write_stanza(stanza, reply.map(Pending::Reply), effects) {
                warn!(session = %self.full_jid, %error, "failed to flush queued stanza");
            }
        }
        self.complete_all(Ok(self.full_jid.clone()), effects);
    }

    /// Answers a stream close (or garbage) from the server by closing our
    /// side too.
    fn abort_stream(&mut self, effects: &mut Vec<Effect>) {
        if self.state.is_negotiating() {
            self.fail(
                FailureReason::TransportFailure,
                ConnectionError::Closed.into(),
                effects,
            );
            return;
        }
        self.write_stream_close(effects);
        self.transport.close();
        self.drop_pending("stream closed");
        self.transition(SessionState::Closing);
    }

    fn write_stanza(
        &mut self,
        stanza: Stanza,
        pending: Option<Pending>,
        effects: &mut Vec<Effect>,
    ) -> Result<(), SessionError> {
        let needs_id = pending.is_some() || stanza.kind() == StanzaKind::Iq;
        let stanza = match stanza.id() {
            None if needs_id => stanza.with_attr("id", &next_id()),
            _ => stanza,
        };

        let bytes = codec::encode(&stanza)?;
        let id = stanza.id().map(str::to_string);
        if let (Some(id), Some(pending)) = (id.clone(), pending) {
            self.pending.insert(id, pending);
        }

        if let Err(error) = self.transport.write(&bytes) {
            if let Some(id) = &id {
                self.pending.remove(id);
            }
            return Err(error.into());
        }

        effects.push(Effect::Publish(Event::stanza(
            Direction::Out,
            &self.full_jid,
            stanza,
        )));
        effects.push(Effect::Publish(Event::data(
            Direction::Out,
            &self.full_jid,
            String::from_utf8_lossy(&bytes),
        )));
        Ok(())
    }

    fn write_raw(&mut self, data: &str, effects: &mut Vec<Effect>) -> Result<(), ConnectionError> {
        self.transport.write(data.as_bytes())?;
        effects.push(Effect::Publish(Event::data(Direction::Out, &self.full_jid, data)));
        Ok(())
    }

    fn write_stream_close(&mut self, effects: &mut Vec<Effect>) {
        effects.push(Effect::Publish(Event::stream(
            Direction::Out,
            &self.full_jid,
            StreamState::Close,
        )));
        if let Err(error) = self.write_raw(STREAM_CLOSE, effects) {
            debug!(session = %self.full_jid, %error, "could not write stream close");
        }
    }

    fn fail(&mut self, reason: FailureReason, error: SessionError, effects: &mut Vec<Effect>) {
        warn!(session = %self.full_jid, %error, "sign-on failed");
        self.transport.close();
        self.drop_pending("session failed");
        self.parser.reset();
        self.transition(SessionState::Failed(reason));
        self.complete_all(Err(error), effects);
    }

    fn drop_pending(&mut self, why: &'static str) {
        let replies = self.pending.len();
        let queued = self.queued.len();
        if replies > 0 || queued > 0 {
            debug!(session = %self.full_jid, replies, queued, why, "dropping pending work");
        }
        self.pending.clear();
        self.queued.clear();
    }

    fn complete_all(&mut self, result: Result<String, SessionError>, effects: &mut Vec<Effect>) {
        for continuation in self.continuations.drain(..) {
            effects.push(Effect::Complete {
                continuation,
                result: result.clone(),
            });
        }
    }

    fn transition(&mut self, next: SessionState) {
        debug!(session = %self.full_jid, from = %self.state, to = %next, "session state");
        self.state = next;
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("jid", &self.full_jid)
            .field("state", &self.state)
            .field("connection", &self.connection)
            .field("pending", &self.pending.len())
            .field("queued", &self.queued.len())
            .finish()
    }
}
