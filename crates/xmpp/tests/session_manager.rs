use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use assert_matches::assert_matches;
use parking_lot::Mutex;
use perch_core::{
    Account, ChannelHub, ConnectOptions, Direction, Event, EventKind, FeatureRegistry, FeatureSet,
    Pattern, Stanza, StanzaKind, StreamState, stanza::ns,
};
use perch_storage::Query;
use perch_test_support::{
    fixtures,
    transport::{RecordingFactory, TransportHandle, drain, server_header},
};
use perch_xmpp::{
    ConnectionError, Continuation, FailureReason, ReplyHandler, SessionError, SessionManager,
    SessionState, TransportNotice,
};
use tokio::sync::mpsc::UnboundedReceiver;

const JID: &str = "u@d/r";

type Outcomes = Arc<Mutex<Vec<Result<String, SessionError>>>>;

struct Harness {
    manager: SessionManager,
    receiver: UnboundedReceiver<TransportNotice>,
    factory: RecordingFactory,
}

impl Harness {
    fn new(accounts: Vec<Account>) -> Self {
        let factory = RecordingFactory::new();
        let (manager, receiver) = SessionManager::new(
            ChannelHub::new(FeatureRegistry::new()),
            Arc::new(accounts),
            Arc::new(factory.clone()),
            5223,
        )
        .unwrap();
        Self {
            manager,
            receiver,
            factory,
        }
    }

    fn pump(&mut self) {
        drain(&self.manager, &mut self.receiver);
    }

    fn transport(&self) -> TransportHandle {
        self.factory.last().expect("a transport was created")
    }

    /// Plays the server side of sign-on up to the authentication request.
    fn negotiate(&mut self, domain: &str) -> Stanza {
        let transport = self.transport();
        transport.ready();
        self.pump();
        transport.receive(&server_header(domain));
        self.pump();
        transport.last_stanza().expect("auth request was written")
    }

    fn sign_on(&mut self, jid: &str, outcomes: &Outcomes) -> TransportHandle {
        self.manager
            .sign_on(jid, "pw", ConnectOptions::default(), Some(record(outcomes)))
            .unwrap();
        let domain = jid.split(['@', '/']).nth(1).unwrap().to_string();
        let auth = self.negotiate(&domain);
        self.transport()
            .receive(&format!("<iq type='result' id='{}'/>", auth.id().unwrap()));
        self.pump();
        self.transport()
    }
}

fn outcomes() -> Outcomes {
    Arc::new(Mutex::new(Vec::new()))
}

fn record(outcomes: &Outcomes) -> Continuation {
    let outcomes = Arc::clone(outcomes);
    Box::new(move |result| outcomes.lock().push(result))
}

fn counting_reply(count: &Arc<AtomicUsize>) -> ReplyHandler {
    let count = Arc::clone(count);
    Box::new(move |_event: &Event| -> anyhow::Result<()> {
        count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
}

fn account(address: &str, resource: &str) -> Account {
    Account {
        key: "main".to_string(),
        address: address.to_string(),
        password: "secret".to_string(),
        resource: resource.to_string(),
        connection_host: None,
        connection_port: None,
        connection_security: Some(0),
        auto_login: true,
    }
}

#[test]
fn sign_on_writes_header_auth_roster_presence_in_order() {
    let mut harness = Harness::new(Vec::new());
    let results = outcomes();
    harness
        .manager
        .sign_on(JID, "pw", ConnectOptions::default(), Some(record(&results)))
        .unwrap();

    let transport = harness.transport();
    assert_eq!(transport.connected_to(), Some(("d".to_string(), 5223, true)));
    assert_eq!(harness.manager.state(JID), Some(SessionState::Connecting));

    let auth = harness.negotiate("d");
    assert_eq!(harness.manager.state(JID), Some(SessionState::Authenticating));
    assert_eq!(auth.type_(), Some("set"));
    assert_eq!(auth.to(), Some("d"));
    assert_eq!(auth.payload_ns().as_deref(), Some(ns::AUTH));
    assert_eq!(auth.element().get_child("query", ns::AUTH).and_then(|q| q.get_child("password", ns::AUTH)).map(|p| p.text()), Some("pw".to_string()));

    transport.receive(&format!("<iq type='result' id='{}'/>", auth.id().unwrap()));
    harness.pump();

    let writes = transport.writes();
    assert_eq!(writes.len(), 4);
    assert!(writes[0].contains("<stream:stream"));
    assert!(writes[0].contains("to='d'"));

    let stanzas = transport.written_stanzas();
    assert_eq!(stanzas.len(), 3);
    assert_eq!(stanzas[0].payload_ns().as_deref(), Some(ns::AUTH));
    assert_eq!(stanzas[1].kind(), StanzaKind::Iq);
    assert_eq!(stanzas[1].type_(), Some("get"));
    assert_eq!(stanzas[1].payload_ns().as_deref(), Some(ns::ROSTER));
    assert_eq!(stanzas[2].kind(), StanzaKind::Presence);
    assert_eq!(stanzas[2].type_(), None);

    assert!(harness.manager.is_up(JID));
    assert_eq!(*results.lock(), vec![Ok(JID.to_string())]);
}

#[test]
fn continuation_fires_once_even_if_auth_reply_repeats() {
    let mut harness = Harness::new(Vec::new());
    let results = outcomes();
    harness
        .manager
        .sign_on(JID, "pw", ConnectOptions::default(), Some(record(&results)))
        .unwrap();
    let auth = harness.negotiate("d");
    let reply = format!("<iq type='result' id='{}'/>", auth.id().unwrap());

    harness.transport().receive(&reply);
    harness.transport().receive(&reply);
    harness.pump();

    assert_eq!(results.lock().len(), 1);
}

#[test]
fn signing_on_an_available_session_completes_immediately() {
    let mut harness = Harness::new(Vec::new());
    let results = outcomes();
    harness.sign_on(JID, &results);

    harness
        .manager
        .sign_on(JID, "pw", ConnectOptions::default(), Some(record(&results)))
        .unwrap();

    assert_eq!(results.lock().len(), 2);
    assert_eq!(harness.factory.count(), 1);
}

#[test]
fn connect_options_override_host_port_and_tls() {
    let harness = Harness::new(Vec::new());
    let options = ConnectOptions {
        host: Some("xmpp.d".to_string()),
        port: Some(5222),
        tls: false,
    };
    harness.manager.sign_on(JID, "pw", options, None).unwrap();
    assert_eq!(
        harness.transport().connected_to(),
        Some(("xmpp.d".to_string(), 5222, false))
    );
}

#[test]
fn invalid_jid_is_rejected() {
    let harness = Harness::new(Vec::new());
    assert_matches!(
        harness.manager.sign_on("no-resource@d", "pw", ConnectOptions::default(), None),
        Err(SessionError::InvalidJid(_))
    );
    assert_eq!(harness.factory.count(), 0);
}

#[test]
fn reply_for_an_id_is_delivered_once() {
    let mut harness = Harness::new(Vec::new());
    let transport = harness.sign_on(JID, &outcomes());
    let count = Arc::new(AtomicUsize::new(0));

    let version = Stanza::new(StanzaKind::Iq, |iq| {
        iq.attr("type", "get").attr("id", "42").attr("to", "d").append(
            xmpp_parsers::minidom::Element::builder("query", "jabber:iq:version"),
        )
    });
    harness
        .manager
        .send(JID, version, Some(counting_reply(&count)))
        .unwrap();
    assert_eq!(transport.last_stanza().and_then(|s| s.id().map(str::to_string)), Some("42".to_string()));

    transport.receive("<iq type='result' id='42' from='d'/>");
    transport.receive("<iq type='result' id='42' from='d'/>");
    harness.pump();

    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn reply_handler_gets_an_id_when_stanza_has_none() {
    let mut harness = Harness::new(Vec::new());
    let transport = harness.sign_on(JID, &outcomes());
    let count = Arc::new(AtomicUsize::new(0));

    let message = Stanza::new(StanzaKind::Message, |message| message.attr("to", "x@d"));
    harness
        .manager
        .send(JID, message, Some(counting_reply(&count)))
        .unwrap();
    let id = transport.last_stanza().and_then(|s| s.id().map(str::to_string)).unwrap();

    transport.receive(&format!("<message from='x@d/h' id='{id}' type='error'/>"));
    harness.pump();
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn authentication_error_fails_the_session() {
    let mut harness = Harness::new(Vec::new());
    let results = outcomes();
    harness
        .manager
        .sign_on(JID, "wrong", ConnectOptions::default(), Some(record(&results)))
        .unwrap();
    let auth = harness.negotiate("d");

    harness.transport().receive(&format!(
        "<iq type='error' id='{}'><error type='auth'><not-authorized xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/></error></iq>",
        auth.id().unwrap()
    ));
    harness.pump();

    assert_eq!(
        harness.manager.state(JID),
        Some(SessionState::Failed(FailureReason::AuthenticationFailed))
    );
    assert_matches!(
        results.lock().as_slice(),
        [Err(SessionError::AuthenticationFailed { condition, .. })] if condition == "not-authorized"
    );
    assert!(harness.transport().is_closed());
    assert!(harness.transport().writes().last().unwrap().contains("</stream:stream>"));
}

#[test]
fn transport_failure_during_negotiation_fails_the_session() {
    let mut harness = Harness::new(Vec::new());
    let results = outcomes();
    harness
        .manager
        .sign_on(JID, "pw", ConnectOptions::default(), Some(record(&results)))
        .unwrap();

    harness
        .transport()
        .stop(Some(ConnectionError::DnsResolutionFailed("d:5223".to_string())));
    harness.pump();

    assert_eq!(
        harness.manager.state(JID),
        Some(SessionState::Failed(FailureReason::TransportFailure))
    );
    assert_matches!(
        results.lock().as_slice(),
        [Err(SessionError::TransportFailure(ConnectionError::DnsResolutionFailed(_)))]
    );
}

#[test]
fn failed_session_can_sign_on_again_and_ignores_old_connection() {
    let mut harness = Harness::new(Vec::new());
    harness
        .manager
        .sign_on(JID, "wrong", ConnectOptions::default(), None)
        .unwrap();
    let auth = harness.negotiate("d");
    let first = harness.transport();
    first.receive(&format!("<iq type='error' id='{}'/>", auth.id().unwrap()));
    harness.pump();

    harness
        .manager
        .sign_on(JID, "pw", ConnectOptions::default(), None)
        .unwrap();
    assert_eq!(harness.factory.count(), 2);

    first.ready();
    harness.pump();
    assert_eq!(harness.manager.state(JID), Some(SessionState::Connecting));
    assert!(harness.transport().writes().is_empty());
}

#[test]
fn send_while_down_brings_account_up_and_flushes_after_sign_on() {
    let jid = "alice@example.com/Perch";
    let mut harness = Harness::new(vec![account("alice@example.com", "Perch")]);

    let message = Stanza::new(StanzaKind::Message, |message| {
        message
            .attr("to", "bob@example.com")
            .append(xmpp_parsers::minidom::Element::builder("body", ns::JABBER_CLIENT).append("hello"))
    });
    harness.manager.send(jid, message, None).unwrap();

    let transport = harness.transport();
    assert_eq!(
        transport.connected_to(),
        Some(("example.com".to_string(), 5223, false))
    );
    assert!(transport.writes().is_empty());

    let auth = harness.negotiate("example.com");
    transport.receive(&format!("<iq type='result' id='{}'/>", auth.id().unwrap()));
    harness.pump();

    let kinds: Vec<StanzaKind> = transport.written_stanzas().iter().map(Stanza::kind).collect();
    assert_eq!(
        kinds,
        vec![StanzaKind::Iq, StanzaKind::Iq, StanzaKind::Presence, StanzaKind::Message]
    );
    assert_eq!(
        transport.last_stanza().unwrap().child_text("body").as_deref(),
        Some("hello")
    );
}

#[test]
fn send_without_session_or_account_is_not_connected() {
    let harness = Harness::new(Vec::new());
    let presence = Stanza::new(StanzaKind::Presence, |presence| presence);
    assert_matches!(
        harness.manager.send(JID, presence, None),
        Err(SessionError::NotConnected(jid)) if jid == JID
    );
}

#[test]
fn auto_login_starts_flagged_accounts() {
    let mut manual = account("bob@example.com", "Perch");
    manual.auto_login = false;
    let harness = Harness::new(vec![account("alice@example.com", "Perch"), manual]);

    assert_eq!(harness.manager.auto_login(), 1);
    assert_eq!(harness.factory.count(), 1);
    assert_eq!(harness.transport().session(), "alice@example.com/Perch");
}

#[test]
fn down_signs_off_and_drops_pending_replies() {
    let mut harness = Harness::new(Vec::new());
    let transport = harness.sign_on(JID, &outcomes());
    let count = Arc::new(AtomicUsize::new(0));

    let ping = Stanza::new(StanzaKind::Iq, |iq| {
        iq.attr("type", "get")
            .attr("id", "p1")
            .append(xmpp_parsers::minidom::Element::builder("ping", "urn:xmpp:ping"))
    });
    harness.manager.send(JID, ping, Some(counting_reply(&count))).unwrap();

    harness.manager.down(JID);
    assert_eq!(harness.manager.state(JID), Some(SessionState::Closing));
    assert!(transport.is_closed());

    let writes = transport.writes();
    assert!(writes.last().unwrap().contains("</stream:stream>"));
    let unavailable = transport.last_stanza().unwrap();
    assert_eq!(unavailable.kind(), StanzaKind::Presence);
    assert_eq!(unavailable.type_(), Some("unavailable"));

    transport.receive("<iq type='result' id='p1'/>");
    transport.stop(None);
    harness.pump();

    assert_eq!(count.load(Ordering::SeqCst), 0);
    assert_eq!(harness.manager.state(JID), Some(SessionState::Disconnected));
    assert_matches!(
        harness.manager.send(JID, Stanza::new(StanzaKind::Presence, |p| p), None),
        Err(SessionError::NotConnected(_))
    );
}

#[test]
fn disco_info_requests_are_answered_with_registered_features() {
    let mut harness = Harness::new(Vec::new());
    let transport = harness.sign_on("alice@example.com/Perch", &outcomes());
    let _channel = harness
        .manager
        .hub()
        .create_channel_with_features(FeatureSet::new(["urn:example:whiteboard"]));

    transport.receive(&fixtures::stanza_xml("disco-info-get.xml"));
    harness.pump();

    let reply = transport.last_stanza().unwrap();
    assert_eq!(reply.type_(), Some("result"));
    assert_eq!(reply.id(), Some("disco_1"));
    assert_eq!(reply.to(), Some("example.com"));

    let features = FeatureSet::from_disco_info(
        reply.element().get_child("query", ns::DISCO_INFO).unwrap(),
    )
    .unwrap();
    let features: Vec<&str> = features.iter().collect();
    assert!(features.contains(&ns::DISCO_INFO));
    assert!(features.contains(&"urn:example:whiteboard"));
}

#[test]
fn channels_see_stream_events_and_cache_logs_stanzas() {
    let mut harness = Harness::new(Vec::new());
    let channel = harness.manager.create_channel();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    channel.on(Pattern::new().event(EventKind::Stream), move |event: &Event| {
        sink.lock().push((event.direction, event.stream_state()));
        Ok(())
    });

    harness.sign_on(JID, &outcomes());

    assert_eq!(
        *seen.lock(),
        vec![
            (Direction::Out, Some(StreamState::Open)),
            (Direction::In, Some(StreamState::Open)),
        ]
    );

    let cache = harness.manager.cache();
    let outbound = cache.all(&Query::new().direction(Direction::Out).account(JID)).unwrap();
    assert_eq!(outbound.len(), 3);
    let inbound = cache.all(&Query::new().direction(Direction::In)).unwrap();
    assert_eq!(inbound.len(), 1);
    assert_eq!(inbound[0].stanza.type_(), Some("result"));
}

#[test]
fn released_channel_stops_receiving_events() {
    let mut harness = Harness::new(Vec::new());
    let channel = harness.manager.create_channel();
    let count = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&count);
    channel.on(Pattern::new(), move |_event: &Event| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    harness
        .manager
        .sign_on(JID, "pw", ConnectOptions::default(), None)
        .unwrap();
    harness.transport().ready();
    harness.pump();
    let before = count.load(Ordering::SeqCst);
    assert!(before > 0);

    channel.release();
    channel.release();
    harness.transport().receive(&server_header("d"));
    harness.pump();
    assert_eq!(count.load(Ordering::SeqCst), before);
    assert_eq!(harness.manager.hub().channel_count(), 0);
}
