use chrono::{SecondsFormat, Utc};
use speech_protocol::protocol::TIMESTAMP_HEADER;
use speech_protocol::{Frame, Headers, RawMessage};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{
    TransportError, TransportEvent, TransportFactory, TransportSink, TransportStream,
    NORMAL_CLOSE,
};
use crate::config::ConnectionSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Connection activity delivered to the session queue.
///
/// Every event carries the generation of the connection attempt that
/// produced it; events from a replaced connection are ignored.
pub enum ConnectionEvent {
    Opened {
        generation: u64,
        sink: Box<dyn TransportSink>,
        stream: Box<dyn TransportStream>,
    },
    OpenFailed {
        generation: u64,
        error: TransportError,
    },
    Message {
        generation: u64,
        message: RawMessage,
    },
    Closed {
        generation: u64,
        code: u16,
        reason: String,
    },
}

impl fmt::Debug for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Opened { generation, .. } => write!(f, "Opened({generation})"),
            Self::OpenFailed { generation, error } => {
                write!(f, "OpenFailed({generation}, {error})")
            }
            Self::Message { generation, message } => {
                write!(f, "Message({generation}, {} bytes)", message.len())
            }
            Self::Closed {
                generation,
                code,
                reason,
            } => write!(f, "Closed({generation}, {code}, {reason})"),
        }
    }
}

/// One duplex connection to the service, reopened on demand.
///
/// Opening is asynchronous: `open` spawns the connect and its outcome
/// arrives as a [`ConnectionEvent`] on the session queue.
pub struct TransportConnection {
    factory: Arc<dyn TransportFactory>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    state: ConnectionState,
    generation: u64,
    sink: Option<Box<dyn TransportSink>>,
    reader: Option<JoinHandle<()>>,
    connector: Option<JoinHandle<()>>,
    frame_headers: Headers,
    /// Longest wait for the peer to finish a caller-side close
    close_timeout: Duration,
    connection_id: Option<String>,
    connected_count: u32,
    disconnected_count: u32,
}

impl TransportConnection {
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        events: mpsc::UnboundedSender<ConnectionEvent>,
        close_timeout: Duration,
    ) -> Self {
        Self {
            factory,
            events,
            state: ConnectionState::Disconnected,
            generation: 0,
            sink: None,
            reader: None,
            connector: None,
            frame_headers: Headers::new(),
            close_timeout,
            connection_id: None,
            connected_count: 0,
            disconnected_count: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn connection_id(&self) -> Option<&str> {
        self.connection_id.as_deref()
    }

    pub fn connected_count(&self) -> u32 {
        self.connected_count
    }

    pub fn disconnected_count(&self) -> u32 {
        self.disconnected_count
    }

    /// Header added to every frame sent from now on
    pub fn set_frame_header(&mut self, name: &str, value: &str) {
        self.frame_headers.insert(name, value);
    }

    /// Start opening a connection. Returns false if one is already open or
    /// being opened.
    pub fn open(&mut self, snapshot: ConnectionSnapshot) -> bool {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Connected => {
                log::debug!("🔌 Open ignored, connection is {:?}", self.state);
                return false;
            }
            ConnectionState::Disconnected | ConnectionState::Disconnecting => {}
        }

        self.generation += 1;
        self.state = ConnectionState::Connecting;
        self.connection_id = Some(snapshot.connection_id.clone());

        let generation = self.generation;
        let factory = self.factory.clone();
        let events = self.events.clone();

        log::info!(
            "🌐 Connecting ({}) to {}",
            snapshot.connection_id,
            snapshot.uri
        );
        self.connector = Some(tokio::spawn(async move {
            let event = match factory.connect(&snapshot).await {
                Ok((sink, stream)) => ConnectionEvent::Opened {
                    generation,
                    sink,
                    stream,
                },
                Err(error) => ConnectionEvent::OpenFailed { generation, error },
            };
            let _ = events.send(event);
        }));
        true
    }

    /// Apply an open outcome. Returns true if this connection is now live.
    pub fn on_opened(
        &mut self,
        generation: u64,
        sink: Box<dyn TransportSink>,
        mut stream: Box<dyn TransportStream>,
    ) -> bool {
        if generation != self.generation || self.state != ConnectionState::Connecting {
            log::debug!("🗑️ Dropping stale connection {}", generation);
            let mut sink = sink;
            tokio::spawn(async move {
                let _ = sink.close(NORMAL_CLOSE, "superseded").await;
            });
            return false;
        }

        self.connector = None;
        self.sink = Some(sink);
        self.state = ConnectionState::Connected;
        self.connected_count += 1;

        let events = self.events.clone();
        self.reader = Some(tokio::spawn(async move {
            loop {
                match stream.recv().await {
                    TransportEvent::Message(message) => {
                        if events
                            .send(ConnectionEvent::Message {
                                generation,
                                message,
                            })
                            .is_err()
                        {
                            break;
                        }
                    }
                    TransportEvent::Closed { code, reason } => {
                        let _ = events.send(ConnectionEvent::Closed {
                            generation,
                            code,
                            reason,
                        });
                        break;
                    }
                }
            }
        }));

        log::info!(
            "✅ Connected ({} connected / {} disconnected)",
            self.connected_count,
            self.disconnected_count
        );
        true
    }

    /// Returns false for a stale attempt
    pub fn on_open_failed(&mut self, generation: u64, error: &TransportError) -> bool {
        if generation != self.generation || self.state != ConnectionState::Connecting {
            return false;
        }
        log::warn!("❌ Connection failed: {}", error);
        self.connector = None;
        self.state = ConnectionState::Disconnected;
        true
    }

    /// Returns false for a stale connection
    pub fn on_closed(&mut self, generation: u64, code: u16, reason: &str) -> bool {
        if generation != self.generation || self.state != ConnectionState::Connected {
            return false;
        }
        log::info!("🔚 Service closed connection: {} {}", code, reason);
        self.teardown();
        true
    }

    pub fn is_current(&self, generation: u64) -> bool {
        generation == self.generation && self.state == ConnectionState::Connected
    }

    /// Send a frame with the connection headers merged in.
    ///
    /// Returns the encoded size in bytes.
    pub async fn send(&mut self, mut frame: Frame) -> Result<usize, TransportError> {
        let sink = self.sink.as_mut().ok_or(TransportError::NotConnected)?;

        for (name, value) in self.frame_headers.iter() {
            frame.set_header(name, value);
        }
        frame.set_header(
            TIMESTAMP_HEADER,
            &Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        );

        let message = frame.encode()?;
        let size = message.len();
        sink.send(message).await?;
        log::trace!("📤 {} ({} bytes)", frame.path(), size);
        Ok(size)
    }

    /// Close from the caller side. Returns false if nothing was open.
    pub async fn close(&mut self, code: u16, reason: &str) -> bool {
        match self.state {
            ConnectionState::Connected => {
                self.state = ConnectionState::Disconnecting;
                if let Some(sink) = self.sink.as_mut() {
                    match tokio::time::timeout(self.close_timeout, sink.close(code, reason)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => log::debug!("Close handshake failed: {}", e),
                        Err(_) => log::warn!(
                            "⏰ Close handshake not finished after {:?}, dropping connection",
                            self.close_timeout
                        ),
                    }
                }
                self.teardown();
                // late events from this connection are now stale
                self.generation += 1;
                true
            }
            ConnectionState::Connecting => {
                if let Some(connector) = self.connector.take() {
                    connector.abort();
                }
                self.state = ConnectionState::Disconnected;
                self.generation += 1;
                true
            }
            ConnectionState::Disconnected | ConnectionState::Disconnecting => false,
        }
    }

    fn teardown(&mut self) {
        self.sink = None;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.state = ConnectionState::Disconnected;
        self.disconnected_count += 1;
    }
}

impl Drop for TransportConnection {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(connector) = self.connector.take() {
            connector.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::sync::mpsc::UnboundedReceiver;

    const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

    struct LoopbackFactory {
        sent: Arc<Mutex<Vec<RawMessage>>>,
        inbound: Mutex<Option<UnboundedReceiver<TransportEvent>>>,
        reject: bool,
        hang_on_close: bool,
    }

    struct LoopbackSink {
        sent: Arc<Mutex<Vec<RawMessage>>>,
        hang_on_close: bool,
    }
    struct LoopbackStream(UnboundedReceiver<TransportEvent>);

    #[async_trait]
    impl TransportSink for LoopbackSink {
        async fn send(&mut self, message: RawMessage) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push(message);
            Ok(())
        }

        async fn close(&mut self, _code: u16, _reason: &str) -> Result<(), TransportError> {
            if self.hang_on_close {
                std::future::pending::<()>().await;
            }
            Ok(())
        }
    }

    #[async_trait]
    impl TransportStream for LoopbackStream {
        async fn recv(&mut self) -> TransportEvent {
            self.0.recv().await.unwrap_or(TransportEvent::Closed {
                code: 1006,
                reason: "gone".into(),
            })
        }
    }

    #[async_trait]
    impl TransportFactory for LoopbackFactory {
        async fn connect(
            &self,
            _snapshot: &ConnectionSnapshot,
        ) -> Result<(Box<dyn TransportSink>, Box<dyn TransportStream>), TransportError> {
            if self.reject {
                return Err(TransportError::Rejected {
                    code: 403008,
                    reason: "Forbidden".into(),
                });
            }
            let inbound = self.inbound.lock().unwrap().take().unwrap();
            Ok((
                Box::new(LoopbackSink {
                    sent: self.sent.clone(),
                    hang_on_close: self.hang_on_close,
                }),
                Box::new(LoopbackStream(inbound)),
            ))
        }
    }

    fn snapshot() -> ConnectionSnapshot {
        crate::config::SpeechConfig::new("wss://example.test/speech")
            .unwrap()
            .snapshot("conn-1")
    }

    fn setup(
        reject: bool,
        hang_on_close: bool,
    ) -> (
        TransportConnection,
        mpsc::UnboundedReceiver<ConnectionEvent>,
        mpsc::UnboundedSender<TransportEvent>,
        Arc<Mutex<Vec<RawMessage>>>,
    ) {
        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let sent = Arc::new(Mutex::new(Vec::new()));
        let factory = Arc::new(LoopbackFactory {
            sent: sent.clone(),
            inbound: Mutex::new(Some(server_rx)),
            reject,
            hang_on_close,
        });
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            TransportConnection::new(factory, events_tx, CLOSE_TIMEOUT),
            events_rx,
            server_tx,
            sent,
        )
    }

    async fn complete_open(
        connection: &mut TransportConnection,
        events: &mut mpsc::UnboundedReceiver<ConnectionEvent>,
    ) {
        match events.recv().await.unwrap() {
            ConnectionEvent::Opened {
                generation,
                sink,
                stream,
            } => assert!(connection.on_opened(generation, sink, stream)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_open_is_idempotent() {
        let (mut connection, mut events, _server, _sent) = setup(false, false);
        assert!(connection.open(snapshot()));
        assert!(!connection.open(snapshot()));
        complete_open(&mut connection, &mut events).await;
        assert!(!connection.open(snapshot()));
        assert_eq!(connection.connected_count(), 1);
        assert_eq!(connection.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_send_merges_headers() {
        let (mut connection, mut events, _server, sent) = setup(false, false);
        connection.set_frame_header("X-Custom", "yes");
        connection.open(snapshot());
        complete_open(&mut connection, &mut events).await;

        let size = connection
            .send(Frame::text("speech.context", "R1", "{}"))
            .await
            .unwrap();
        let sent = sent.lock().unwrap();
        assert_eq!(sent[0].len(), size);
        let frame = Frame::decode(&sent[0]).unwrap();
        assert_eq!(frame.headers().get("x-custom"), Some("yes"));
        assert!(frame.headers().contains("x-timestamp"));
    }

    #[tokio::test]
    async fn test_inbound_and_remote_close() {
        let (mut connection, mut events, server, _sent) = setup(false, false);
        connection.open(snapshot());
        complete_open(&mut connection, &mut events).await;

        server
            .send(TransportEvent::Message(RawMessage::Text("hi".into())))
            .unwrap();
        server
            .send(TransportEvent::Closed {
                code: 1011,
                reason: "boom".into(),
            })
            .unwrap();

        assert!(matches!(
            events.recv().await.unwrap(),
            ConnectionEvent::Message { generation: 1, .. }
        ));
        match events.recv().await.unwrap() {
            ConnectionEvent::Closed {
                generation, code, ..
            } => {
                assert_eq!(code, 1011);
                assert!(connection.on_closed(generation, code, "boom"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(connection.disconnected_count(), 1);
        assert!(!connection.on_closed(1, 1011, "again"));
    }

    #[tokio::test]
    async fn test_rejected_open() {
        let (mut connection, mut events, _server, _sent) = setup(true, false);
        connection.open(snapshot());
        match events.recv().await.unwrap() {
            ConnectionEvent::OpenFailed { generation, error } => {
                assert_eq!(error.status_code(), Some(403008));
                assert!(connection.on_open_failed(generation, &error));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert_eq!(connection.connected_count(), 0);
    }

    #[tokio::test]
    async fn test_caller_close_makes_events_stale() {
        let (mut connection, mut events, _server, _sent) = setup(false, false);
        connection.open(snapshot());
        complete_open(&mut connection, &mut events).await;
        let generation = connection.generation();

        assert!(connection.close(1000, "bye").await);
        assert!(!connection.close(1000, "bye").await);
        assert!(!connection.is_current(generation));
        assert!(matches!(
            connection.send(Frame::text("telemetry", "", "{}")).await,
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_does_not_wait_forever_for_peer() {
        let (mut connection, mut events, _server, _sent) = setup(false, true);
        connection.open(snapshot());
        complete_open(&mut connection, &mut events).await;

        let started = tokio::time::Instant::now();
        assert!(connection.close(1000, "bye").await);
        assert!(started.elapsed() >= CLOSE_TIMEOUT);
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert_eq!(connection.disconnected_count(), 1);
    }
}
