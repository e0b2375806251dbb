use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;
use perch_core::{
    Account, AccountStore, ChannelHub, ConnectOptions, Direction, Event, EventChannel, EventSink,
    Stanza, StanzaKind, stanza::ns,
};
use perch_storage::{StanzaCache, StorageError};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    error::SessionError,
    session::{Continuation, Effect, ReplyHandler, Session, SessionState, parse_session_jid},
    transport::{TransportFactory, TransportNotice, TransportNotifier},
};

/// Owns every session, the stanza log and the dispatch hub.
///
/// Sessions are driven by [`TransportNotice`]s, either pushed through
/// [`SessionManager::handle_notice`] by the host's I/O loop or drained by
/// [`SessionManager::run`]. Work produced by a session is carried out after
/// the session map is unlocked, so handlers may call back into the manager.
pub struct SessionManager {
    sessions: Mutex<HashMap<String, Session>>,
    cache: StanzaCache,
    hub: ChannelHub,
    accounts: Arc<dyn AccountStore>,
    transports: Arc<dyn TransportFactory>,
    notices: mpsc::UnboundedSender<TransportNotice>,
    next_connection: AtomicU64,
    default_port: u16,
}

impl SessionManager {
    pub fn new(
        hub: ChannelHub,
        accounts: Arc<dyn AccountStore>,
        transports: Arc<dyn TransportFactory>,
        default_port: u16,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportNotice>), StorageError> {
        let (notices, receiver) = mpsc::unbounded_channel();
        let manager = Self {
            sessions: Mutex::new(HashMap::new()),
            cache: StanzaCache::new()?,
            hub,
            accounts,
            transports,
            notices,
            next_connection: AtomicU64::new(1),
            default_port,
        };
        Ok((manager, receiver))
    }

    pub fn cache(&self) -> &StanzaCache {
        &self.cache
    }

    pub fn hub(&self) -> &ChannelHub {
        &self.hub
    }

    pub fn create_channel(&self) -> EventChannel {
        self.hub.create_channel()
    }

    /// Signs `jid` on with `password`. `continuation` receives the JID once
    /// the session is available, or the reason it never will be.
    pub fn sign_on(
        &self,
        jid: &str,
        password: &str,
        options: ConnectOptions,
        continuation: Option<Continuation>,
    ) -> Result<(), SessionError> {
        let parts = parse_session_jid(jid)?;
        let effects = {
            let mut sessions = self.sessions.lock();
            let live = sessions
                .get(jid)
                .is_some_and(|session| Self::is_live(session.state()));
            if !live {
                sessions.insert(jid.to_string(), self.new_session(parts, password, options));
            }
            match sessions.get_mut(jid) {
                Some(session) => session.connect(continuation),
                None => return Err(SessionError::NotConnected(jid.to_string())),
            }
        };
        self.apply(effects);
        Ok(())
    }

    pub fn up(&self, account: &Account, continuation: Option<Continuation>) -> Result<(), SessionError> {
        self.sign_on(
            &account.jid(),
            &account.password,
            account.connect_options(),
            continuation,
        )
    }

    /// Brings up the configured account signing on as `jid`.
    pub fn up_jid(&self, jid: &str, continuation: Option<Continuation>) -> Result<(), SessionError> {
        let account = self
            .accounts
            .by_jid(jid)
            .ok_or_else(|| SessionError::NotConnected(jid.to_string()))?;
        self.up(&account, continuation)
    }

    /// Signs on every account marked `auto_login`. Returns how many were
    /// started.
    pub fn auto_login(&self) -> usize {
        let mut started = 0;
        for account in self.accounts.accounts().into_iter().filter(|a| a.auto_login) {
            let key = account.key.clone();
            let continuation: Continuation = Box::new(move |result| match result {
                Ok(jid) => info!(account = %key, %jid, "auto-login complete"),
                Err(error) => warn!(account = %key, %error, "auto-login failed"),
            });
            match self.up(&account, Some(continuation)) {
                Ok(()) => started += 1,
                Err(error) => warn!(account = %account.key, %error, "auto-login skipped"),
            }
        }
        started
    }

    pub fn down(&self, jid: &str) {
        let effects = match self.sessions.lock().get_mut(jid) {
            Some(session) => session.close(),
            None => {
                debug!(session = jid, "down: no such session");
                return;
            }
        };
        self.apply(effects);
    }

    /// Sends `stanza` on `jid`'s session. A session that is still signing on
    /// queues it; with no live session the matching configured account is
    /// brought up first.
    pub fn send(
        &self,
        jid: &str,
        stanza: Stanza,
        reply: Option<ReplyHandler>,
    ) -> Result<(), SessionError> {
        let live = self
            .sessions
            .lock()
            .get(jid)
            .is_some_and(|session| Self::is_live(session.state()));
        if !live {
            info!(session = jid, "bringing account up to send");
            self.up_jid(jid, None)?;
        }

        let effects = match self.sessions.lock().get_mut(jid) {
            Some(session) => session.send(stanza, reply)?,
            None => return Err(SessionError::NotConnected(jid.to_string())),
        };
        self.apply(effects);
        Ok(())
    }

    pub fn state(&self, jid: &str) -> Option<SessionState> {
        self.sessions.lock().get(jid).map(Session::state)
    }

    pub fn is_up(&self, jid: &str) -> bool {
        self.state(jid) == Some(SessionState::Available)
    }

    /// Every known session and its state, sorted by JID.
    pub fn sessions(&self) -> Vec<(String, SessionState)> {
        let mut sessions: Vec<_> = self
            .sessions
            .lock()
            .values()
            .map(|session| (session.jid().to_string(), session.state()))
            .collect();
        sessions.sort_by(|a, b| a.0.cmp(&b.0));
        sessions
    }

    pub fn handle_notice(&self, notice: TransportNotice) {
        let effects = {
            let mut sessions = self.sessions.lock();
            let Some(session) = sessions.get_mut(&notice.session) else {
                debug!(session = %notice.session, "notice for unknown session");
                return;
            };
            if session.connection() != notice.connection {
                debug!(
                    session = %notice.session,
                    stale = notice.connection,
                    current = session.connection(),
                    "ignoring notice from previous connection"
                );
                return;
            }
            session.handle_transport(notice.event)
        };
        self.apply(effects);
    }

    /// Drains transport notices. Returns once the receiver is closed.
    pub async fn run(&self, mut receiver: mpsc::UnboundedReceiver<TransportNotice>) {
        while let Some(notice) = receiver.recv().await {
            self.handle_notice(notice);
        }
        debug!("transport notice channel closed");
    }

    fn new_session(
        &self,
        jid: perch_core::JidParts,
        password: &str,
        options: ConnectOptions,
    ) -> Session {
        let connection = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let notifier = TransportNotifier::new(jid.to_string(), connection, self.notices.clone());
        let transport = self.transports.create(notifier);
        Session::new(
            jid,
            password,
            options,
            self.default_port,
            transport,
            connection,
        )
    }

    fn is_live(state: SessionState) -> bool {
        state == SessionState::Available || state.is_negotiating()
    }

    fn apply(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Publish(event) => self.publish(&event),
                Effect::Reply { handler, event } => {
                    if let Err(error) = handler(&event) {
                        warn!(session = %event.session, %error, "reply handler failed");
                    }
                }
                Effect::Complete {
                    continuation,
                    result,
                } => continuation(result),
            }
        }
    }

    fn publish(&self, event: &Event) {
        if let Some(stanza) = event.as_stanza() {
            if let Err(error) = self.cache.append(stanza, event.direction, &event.session) {
                warn!(session = %event.session, %error, "failed to log stanza");
            }
        }
        self.hub.dispatch(event);

        if is_disco_info_get(event) {
            self.answer_disco_info(event);
        }
    }

    fn answer_disco_info(&self, event: &Event) {
        let Some(request) = event.as_stanza() else {
            return;
        };
        let id = request.id().unwrap_or_default().to_string();
        let requester = request.from().map(str::to_string);
        let query = self.hub.registry().disco_info();
        let reply = Stanza::new(StanzaKind::Iq, |iq| {
            let iq = iq.attr("type", "result").attr("id", id).append(query);
            match requester {
                Some(requester) => iq.attr("to", requester),
                None => iq,
            }
        });

        debug!(session = %event.session, id = request.id(), "answering disco#info");
        let effects = match self.sessions.lock().get_mut(&event.session) {
            Some(session) => session.send(reply, None),
            None => return,
        };
        match effects {
            Ok(effects) => self.apply(effects),
            Err(error) => warn!(session = %event.session, %error, "failed to answer disco#info"),
        }
    }
}

fn is_disco_info_get(event: &Event) -> bool {
    event.direction == Direction::In
        && event.as_stanza().is_some_and(|stanza| {
            stanza.kind() == StanzaKind::Iq
                && stanza.type_() == Some("get")
                && stanza.has_child("query", ns::DISCO_INFO)
        })
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("sessions", &self.sessions.lock().len())
            .field("cache", &self.cache)
            .field("channels", &self.hub.channel_count())
            .field("default_port", &self.default_port)
            .finish()
    }
}
