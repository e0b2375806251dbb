use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use tokio::sync::mpsc;

use crate::error::ConnectionError;

/// What a transport reports about its connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The connection is established and writes will reach the peer.
    Ready,
    Data(Vec<u8>),
    /// The connection is gone. Sent at most once per connection.
    Stop { error: Option<ConnectionError> },
}

/// A transport event tagged with the session and connection it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportNotice {
    pub session: String,
    pub connection: u64,
    pub event: TransportEvent,
}

/// Sending half handed to each transport.
#[derive(Debug, Clone)]
pub struct TransportNotifier {
    session: String,
    connection: u64,
    sender: mpsc::UnboundedSender<TransportNotice>,
    stopped: Arc<AtomicBool>,
}

impl TransportNotifier {
    pub fn new(
        session: impl Into<String>,
        connection: u64,
        sender: mpsc::UnboundedSender<TransportNotice>,
    ) -> Self {
        Self {
            session: session.into(),
            connection,
            sender,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn connection(&self) -> u64 {
        self.connection
    }

    /// Forwards `event`. Anything after the first `Stop` is discarded.
    pub fn notify(&self, event: TransportEvent) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        if matches!(event, TransportEvent::Stop { .. }) && self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        let notice = TransportNotice {
            session: self.session.clone(),
            connection: self.connection,
            event,
        };
        if self.sender.send(notice).is_err() {
            tracing::debug!(session = %self.session, "transport notice dropped, manager is gone");
        }
    }
}

/// A byte pipe to an XMPP server.
///
/// `connect` and `write` must not block: completion and incoming data are
/// reported through the [`TransportNotifier`] the transport was created with.
/// Writes are delivered in call order.
pub trait Transport: Send {
    fn connect(&mut self, host: &str, port: u16, tls: bool) -> Result<(), ConnectionError>;

    fn write(&mut self, data: &[u8]) -> Result<(), ConnectionError>;

    fn close(&mut self);
}

pub trait TransportFactory: Send + Sync {
    fn create(&self, notifier: TransportNotifier) -> Box<dyn Transport>;
}

mod native {
    use std::sync::Arc;

    use tokio::{
        io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
        net::TcpStream,
        sync::mpsc,
    };
    use tokio_rustls::{
        TlsConnector,
        rustls::{ClientConfig, RootCertStore, pki_types::ServerName},
    };
    use tracing::{debug, warn};

    use super::{Transport, TransportEvent, TransportFactory, TransportNotifier};
    use crate::error::ConnectionError;

    const READ_BUFFER_SIZE: usize = 8192;

    enum Command {
        Write(Vec<u8>),
        Close,
    }

    /// TCP transport with optional direct TLS, driven by a tokio task.
    pub struct TcpTransport {
        notifier: TransportNotifier,
        commands: Option<mpsc::UnboundedSender<Command>>,
    }

    impl TcpTransport {
        pub fn new(notifier: TransportNotifier) -> Self {
            Self {
                notifier,
                commands: None,
            }
        }
    }

    impl Transport for TcpTransport {
        fn connect(&mut self, host: &str, port: u16, tls: bool) -> Result<(), ConnectionError> {
            let runtime =
                tokio::runtime::Handle::try_current().map_err(|_| ConnectionError::NoRuntime)?;
            let (commands, receiver) = mpsc::unbounded_channel();
            self.commands = Some(commands);

            let notifier = self.notifier.clone();
            let host = host.to_string();
            runtime.spawn(async move {
                let error = run_connection(&host, port, tls, receiver, &notifier)
                    .await
                    .err();
                if let Some(error) = &error {
                    warn!(session = %notifier.session(), host = %host, port, %error, "transport stopped with error");
                }
                notifier.notify(TransportEvent::Stop { error });
            });
            Ok(())
        }

        fn write(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
            let commands = self.commands.as_ref().ok_or(ConnectionError::Closed)?;
            commands
                .send(Command::Write(data.to_vec()))
                .map_err(|_| ConnectionError::Closed)
        }

        fn close(&mut self) {
            if let Some(commands) = self.commands.take() {
                let _ = commands.send(Command::Close);
            }
        }
    }

    /// Creates a [`TcpTransport`] for every session.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct TcpTransportFactory;

    impl TransportFactory for TcpTransportFactory {
        fn create(&self, notifier: TransportNotifier) -> Box<dyn Transport> {
            Box::new(TcpTransport::new(notifier))
        }
    }

    async fn run_connection(
        host: &str,
        port: u16,
        tls: bool,
        commands: mpsc::UnboundedReceiver<Command>,
        notifier: &TransportNotifier,
    ) -> Result<(), ConnectionError> {
        let tcp = TcpStream::connect((host, port))
            .await
            .map_err(|error| ConnectionError::DnsResolutionFailed(format!("{host}:{port}: {error}")))?;
        debug!(session = %notifier.session(), host, port, tls, "tcp connected");

        if tls {
            let stream = upgrade_to_tls(tcp, host).await?;
            pump(stream, commands, notifier).await
        } else {
            pump(tcp, commands, notifier).await
        }
    }

    async fn upgrade_to_tls(
        tcp: TcpStream,
        host: &str,
    ) -> Result<tokio_rustls::client::TlsStream<TcpStream>, ConnectionError> {
        let mut roots = RootCertStore::empty();
        let certs = rustls_native_certs::load_native_certs();
        for cert in certs.certs {
            if let Err(error) = roots.add(cert) {
                warn!(%error, "failed to add root certificate");
            }
        }
        for error in &certs.errors {
            warn!(%error, "error loading native certificates");
        }

        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(config));
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|error| ConnectionError::TlsHandshakeFailed(error.to_string()))?;

        connector
            .connect(server_name, tcp)
            .await
            .map_err(|error| ConnectionError::TlsHandshakeFailed(error.to_string()))
    }

    async fn pump<S>(
        stream: S,
        mut commands: mpsc::UnboundedReceiver<Command>,
        notifier: &TransportNotifier,
    ) -> Result<(), ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        notifier.notify(TransportEvent::Ready);

        let mut buffer = vec![0u8; READ_BUFFER_SIZE];
        loop {
            tokio::select! {
                read = reader.read(&mut buffer) => {
                    match read {
                        Ok(0) => return Ok(()),
                        Ok(n) => notifier.notify(TransportEvent::Data(buffer[..n].to_vec())),
                        Err(error) => return Err(ConnectionError::TransportError(error.to_string())),
                    }
                }
                command = commands.recv() => {
                    match command {
                        Some(Command::Write(data)) => {
                            writer
                                .write_all(&data)
                                .await
                                .map_err(|error| ConnectionError::TransportError(error.to_string()))?;
                            writer
                                .flush()
                                .await
                                .map_err(|error| ConnectionError::TransportError(error.to_string()))?;
                        }
                        Some(Command::Close) | None => {
                            let _ = writer.shutdown().await;
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
}

pub use native::{TcpTransport, TcpTransportFactory};
