//! An in-memory transport that records what sessions write and lets tests
//! play the server's side.

use std::sync::Arc;

use parking_lot::Mutex;
use perch_core::Stanza;
use perch_xmpp::{
    ConnectionError, SessionManager, Transport, TransportEvent, TransportFactory, TransportNotice,
    TransportNotifier,
};
use tokio::sync::mpsc;

#[derive(Debug, Default)]
struct Recorded {
    connected_to: Option<(String, u16, bool)>,
    writes: Vec<String>,
    closed: bool,
}

/// Test-side view of one recording transport.
#[derive(Debug, Clone)]
pub struct TransportHandle {
    notifier: TransportNotifier,
    recorded: Arc<Mutex<Recorded>>,
}

impl TransportHandle {
    pub fn session(&self) -> &str {
        self.notifier.session()
    }

    pub fn connected_to(&self) -> Option<(String, u16, bool)> {
        self.recorded.lock().connected_to.clone()
    }

    pub fn writes(&self) -> Vec<String> {
        self.recorded.lock().writes.clone()
    }

    /// Every write that parses as a stanza, in write order.
    pub fn written_stanzas(&self) -> Vec<Stanza> {
        self.writes()
            .iter()
            .filter_map(|write| write.parse::<Stanza>().ok())
            .collect()
    }

    pub fn last_stanza(&self) -> Option<Stanza> {
        self.written_stanzas().pop()
    }

    pub fn is_closed(&self) -> bool {
        self.recorded.lock().closed
    }

    pub fn ready(&self) {
        self.notifier.notify(TransportEvent::Ready);
    }

    /// Delivers `xml` as if the server had sent it.
    pub fn receive(&self, xml: &str) {
        self.notifier
            .notify(TransportEvent::Data(xml.as_bytes().to_vec()));
    }

    pub fn stop(&self, error: Option<ConnectionError>) {
        self.notifier.notify(TransportEvent::Stop { error });
    }
}

struct RecordingTransport {
    recorded: Arc<Mutex<Recorded>>,
}

impl Transport for RecordingTransport {
    fn connect(&mut self, host: &str, port: u16, tls: bool) -> Result<(), ConnectionError> {
        self.recorded.lock().connected_to = Some((host.to_string(), port, tls));
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        let mut recorded = self.recorded.lock();
        if recorded.closed {
            return Err(ConnectionError::Closed);
        }
        recorded.writes.push(String::from_utf8_lossy(data).into_owned());
        Ok(())
    }

    fn close(&mut self) {
        self.recorded.lock().closed = true;
    }
}

/// Hands out recording transports and keeps a handle to each one.
#[derive(Debug, Clone, Default)]
pub struct RecordingFactory {
    handles: Arc<Mutex<Vec<TransportHandle>>>,
}

impl RecordingFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handles(&self) -> Vec<TransportHandle> {
        self.handles.lock().clone()
    }

    pub fn last(&self) -> Option<TransportHandle> {
        self.handles.lock().last().cloned()
    }

    pub fn count(&self) -> usize {
        self.handles.lock().len()
    }
}

impl TransportFactory for RecordingFactory {
    fn create(&self, notifier: TransportNotifier) -> Box<dyn Transport> {
        let recorded = Arc::new(Mutex::new(Recorded::default()));
        self.handles.lock().push(TransportHandle {
            notifier,
            recorded: Arc::clone(&recorded),
        });
        Box::new(RecordingTransport { recorded })
    }
}

/// Feeds every queued notice to `manager`, including notices produced while
/// doing so. Returns how many were handled.
pub fn drain(
    manager: &SessionManager,
    receiver: &mut mpsc::UnboundedReceiver<TransportNotice>,
) -> usize {
    let mut handled = 0;
    while let Ok(notice) = receiver.try_recv() {
        manager.handle_notice(notice);
        handled += 1;
    }
    handled
}

/// The server's stream header for `domain`.
pub fn server_header(domain: &str) -> String {
    format!(
        "<?xml version='1.0'?><stream:stream xmlns='jabber:client' \
         xmlns:stream='http://etherx.jabber.org/streams' id='s1' from='{domain}'>"
    )
}
