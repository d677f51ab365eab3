use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::audio::{AudioChunker, AudioData, AudioMessage, AudioSource, ThrottleClock};
use crate::config::{PropertyChannel, SpeechConfig};
use crate::error::{Result, SessionError};
use crate::events::SessionEvent;
use crate::timer::{Scheduler, TimerFired, TimerId, TimerKind, TokioScheduler};
use crate::transport::{
    ConnectionEvent, ConnectionState, TransportConnection, TransportFactory,
    WebSocketTransportFactory, NORMAL_CLOSE,
};
use crate::turn::{Action, RecognitionMode, TurnController, TurnState};

/// Bounded so a fast source waits for the session instead of piling up
const AUDIO_CHANNEL_CAPACITY: usize = 32;

type Reply<T = ()> = oneshot::Sender<Result<T>>;

enum Command {
    Start { mode: RecognitionMode, reply: Reply },
    Stop { reply: Reply },
    OpenConnection { reply: Reply },
    CloseConnection { reply: Reply },
    AddTargetLanguage { language: String, reply: Reply },
    RemoveTargetLanguage { language: String, reply: Reply },
    AddPhrase { phrase: String, reply: Reply },
    ClearPhrases { reply: Reply },
    SetServiceProperty {
        name: String,
        value: String,
        channel: PropertyChannel,
        reply: Reply,
    },
    SetContextSection {
        name: String,
        value: serde_json::Value,
        reply: Reply,
    },
    SetAuthorizationToken { token: String, reply: Reply },
    Stats { reply: Reply<SessionStats> },
}

/// Point-in-time view of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStats {
    pub state: TurnState,
    pub connection: ConnectionState,
    pub connected_count: u32,
    pub disconnected_count: u32,
    pub session_id: Option<String>,
    pub target_languages: Vec<String>,
    pub phrases: Vec<String>,
}

/// Builder for a speech session task
pub struct SpeechSession {
    config: SpeechConfig,
    source: Box<dyn AudioSource>,
    factory: Arc<dyn TransportFactory>,
    scheduler: Option<(Box<dyn Scheduler>, mpsc::UnboundedReceiver<TimerFired>)>,
}

impl SpeechSession {
    pub fn new(mut config: SpeechConfig, source: impl AudioSource + 'static) -> Self {
        config.audio_format = source.format();
        Self {
            config,
            source: Box::new(source),
            factory: Arc::new(WebSocketTransportFactory::new()),
            scheduler: None,
        }
    }

    /// Replace the WebSocket transport
    pub fn with_transport(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.factory = factory;
        self
    }

    /// Replace the tokio timer backend. `fired` must receive the scheduler's firings.
    pub fn with_scheduler(
        mut self,
        scheduler: Box<dyn Scheduler>,
        fired: mpsc::UnboundedReceiver<TimerFired>,
    ) -> Self {
        self.scheduler = Some((scheduler, fired));
        self
    }

    /// Spawn the session task on the current runtime
    pub fn spawn(self) -> (SessionHandle, mpsc::UnboundedReceiver<SessionEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (connection_tx, connection_rx) = mpsc::unbounded_channel();
        let (audio_tx, audio_rx) = mpsc::channel(AUDIO_CHANNEL_CAPACITY);
        let (scheduler, timer_rx) = match self.scheduler {
            Some(scheduler) => scheduler,
            None => {
                let (scheduler, timer_rx) = TokioScheduler::new();
                (Box::new(scheduler) as Box<dyn Scheduler>, timer_rx)
            }
        };

        let chunk_size = self
            .config
            .audio_format
            .bytes_for(self.config.chunk_duration);
        let mut connection =
            TransportConnection::new(self.factory, connection_tx, self.config.stop_grace);
        for (name, value) in &self.config.frame_headers {
            connection.set_frame_header(name, value);
        }

        let driver = SessionDriver {
            controller: TurnController::new(&self.config),
            connection,
            config: self.config,
            source: Arc::new(Mutex::new(self.source)),
            chunker: None,
            throttle_clock: None,
            chunk_size,
            audio_tx,
            scheduler,
            timers: HashMap::new(),
            events: event_tx,
            pending_stops: Vec::new(),
        };

        tokio::spawn(driver.run(command_rx, connection_rx, audio_rx, timer_rx));
        (SessionHandle { commands: command_tx }, event_rx)
    }
}

/// Cloneable handle to a running session.
///
/// Every operation is serialized through the session task and resolves once
/// the task has applied it.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl SessionHandle {
    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| SessionError::SessionClosed)?;
        response.await.map_err(|_| SessionError::SessionClosed)?
    }

    pub async fn start(&self, mode: RecognitionMode) -> Result<()> {
        self.request(|reply| Command::Start { mode, reply }).await
    }

    pub async fn start_continuous(&self) -> Result<()> {
        self.start(RecognitionMode::Continuous).await
    }

    pub async fn recognize_once(&self) -> Result<()> {
        self.start(RecognitionMode::SingleShot).await
    }

    /// Resolves once the session has stopped and result events are detached
    pub async fn stop(&self) -> Result<()> {
        self.request(|reply| Command::Stop { reply }).await
    }

    /// Open without starting recognition. Completion arrives as `Connected`.
    pub async fn open_connection(&self) -> Result<()> {
        self.request(|reply| Command::OpenConnection { reply }).await
    }

    pub async fn close_connection(&self) -> Result<()> {
        self.request(|reply| Command::CloseConnection { reply }).await
    }

    pub async fn add_target_language(&self, language: &str) -> Result<()> {
        let language = language.to_string();
        self.request(|reply| Command::AddTargetLanguage { language, reply })
            .await
    }

    pub async fn remove_target_language(&self, language: &str) -> Result<()> {
        let language = language.to_string();
        self.request(|reply| Command::RemoveTargetLanguage { language, reply })
            .await
    }

    pub async fn add_phrase(&self, phrase: &str) -> Result<()> {
        let phrase = phrase.to_string();
        self.request(|reply| Command::AddPhrase { phrase, reply }).await
    }

    pub async fn clear_phrases(&self) -> Result<()> {
        self.request(|reply| Command::ClearPhrases { reply }).await
    }

    pub async fn set_service_property(
        &self,
        name: &str,
        value: &str,
        channel: PropertyChannel,
    ) -> Result<()> {
        let (name, value) = (name.to_string(), value.to_string());
        self.request(|reply| Command::SetServiceProperty {
            name,
            value,
            channel,
            reply,
        })
        .await
    }

    /// Replace a whole top-level section of the context payload
    pub async fn set_context_section(&self, name: &str, value: serde_json::Value) -> Result<()> {
        let name = name.to_string();
        self.request(|reply| Command::SetContextSection { name, value, reply })
            .await
    }

    /// Used from the next connection open onward
    pub async fn set_authorization_token(&self, token: &str) -> Result<()> {
        let token = token.to_string();
        self.request(|reply| Command::SetAuthorizationToken { token, reply })
            .await
    }

    pub async fn stats(&self) -> Result<SessionStats> {
        self.request(|reply| Command::Stats { reply }).await
    }
}

/// The single writer for one session's state
struct SessionDriver {
    config: SpeechConfig,
    controller: TurnController,
    connection: TransportConnection,
    source: Arc<Mutex<Box<dyn AudioSource>>>,
    chunker: Option<AudioChunker>,
    /// Pacing shared by the chunkers of one run until speech is detected
    throttle_clock: Option<ThrottleClock>,
    chunk_size: usize,
    audio_tx: mpsc::Sender<AudioMessage>,
    scheduler: Box<dyn Scheduler>,
    timers: HashMap<TimerKind, TimerId>,
    events: mpsc::UnboundedSender<SessionEvent>,
    pending_stops: Vec<Reply>,
}

impl SessionDriver {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut connection_events: mpsc::UnboundedReceiver<ConnectionEvent>,
        mut audio: mpsc::Receiver<AudioMessage>,
        mut timers: mpsc::UnboundedReceiver<TimerFired>,
    ) {
        log::debug!("🧵 Session task started");
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => break,
                },
                Some(event) = connection_events.recv() => self.on_connection_event(event).await,
                // a reset turn leaves audio queued; the bounded channel pauses the chunker
                Some(message) = audio.recv(), if !self.controller.holds_audio() => {
                    self.on_audio(message).await
                }
                Some(fired) = timers.recv() => self.on_timer(fired).await,
            }
        }

        if let Some(chunker) = self.chunker.take() {
            chunker.abort();
        }
        self.connection.close(NORMAL_CLOSE, "session dropped").await;
        log::debug!("🧵 Session task finished");
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Start { mode, reply } => match self.controller.start(mode) {
                Ok(actions) => {
                    self.throttle_clock = None;
                    self.apply(actions).await;
                    let _ = reply.send(Ok(()));
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Command::Stop { reply } => {
                self.pending_stops.push(reply);
                let actions = self.controller.stop();
                self.apply(actions).await;
            }
            Command::OpenConnection { reply } => {
                self.open_connection();
                let _ = reply.send(Ok(()));
            }
            Command::CloseConnection { reply } => {
                let was = self.connection.state();
                let closed = self.connection.close(NORMAL_CLOSE, "closed by caller").await;
                // a pending reconnect has no socket open but still ends here
                if closed || self.controller.state() == TurnState::Connecting {
                    if was == ConnectionState::Connected {
                        self.emit(SessionEvent::Disconnected {
                            code: NORMAL_CLOSE,
                            reason: "closed by caller".to_string(),
                        });
                    }
                    let actions =
                        self.controller
                            .on_disconnected(NORMAL_CLOSE, "closed by caller", true);
                    self.apply(actions).await;
                }
                let _ = reply.send(Ok(()));
            }
            Command::AddTargetLanguage { language, reply } => {
                let actions = self.controller.add_target_language(&language);
                self.apply(actions).await;
                let _ = reply.send(Ok(()));
            }
            Command::RemoveTargetLanguage { language, reply } => {
                let actions = self.controller.remove_target_language(&language);
                self.apply(actions).await;
                let _ = reply.send(Ok(()));
            }
            Command::AddPhrase { phrase, reply } => {
                let actions = self.controller.add_phrase(&phrase);
                self.apply(actions).await;
                let _ = reply.send(Ok(()));
            }
            Command::ClearPhrases { reply } => {
                let actions = self.controller.clear_phrases();
                self.apply(actions).await;
                let _ = reply.send(Ok(()));
            }
            Command::SetServiceProperty {
                name,
                value,
                channel,
                reply,
            } => {
                match channel {
                    PropertyChannel::UriQuery => self.config.set_uri_property(&name, &value),
                    PropertyChannel::Context => {
                        let actions = self.controller.set_context_property(&name, &value);
                        self.apply(actions).await;
                    }
                }
                let _ = reply.send(Ok(()));
            }
            Command::SetContextSection { name, value, reply } => {
                let actions = self.controller.set_context_section(&name, value);
                self.apply(actions).await;
                let _ = reply.send(Ok(()));
            }
            Command::SetAuthorizationToken { token, reply } => {
                log::info!("🔑 Authorization token updated");
                self.config.set_authorization_token(&token);
                let _ = reply.send(Ok(()));
            }
            Command::Stats { reply } => {
                let _ = reply.send(Ok(SessionStats {
                    state: self.controller.state(),
                    connection: self.connection.state(),
                    connected_count: self.connection.connected_count(),
                    disconnected_count: self.connection.disconnected_count(),
                    session_id: self.controller.session_id().map(String::from),
                    target_languages: self.controller.context().target_languages().to_vec(),
                    phrases: self.controller.context().phrases().to_vec(),
                }));
            }
        }
    }

    async fn on_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Opened {
                generation,
                sink,
                stream,
            } => {
                if self.connection.on_opened(generation, sink, stream) {
                    let connection_id = self.connection.connection_id().unwrap_or_default().to_string();
                    self.emit(SessionEvent::Connected { connection_id });
                    let actions = self.controller.on_connected();
                    self.apply(actions).await;
                }
            }
            ConnectionEvent::OpenFailed { generation, error } => {
                if self.connection.on_open_failed(generation, &error) {
                    let actions = self
                        .controller
                        .on_open_failed(error.status_code(), &error.to_string());
                    self.apply(actions).await;
                }
            }
            ConnectionEvent::Message {
                generation,
                message,
            } => {
                if self.connection.is_current(generation) {
                    let actions = self.controller.on_message(&message);
                    self.apply(actions).await;
                }
            }
            ConnectionEvent::Closed {
                generation,
                code,
                reason,
            } => {
                if self.connection.on_closed(generation, code, &reason) {
                    self.emit(SessionEvent::Disconnected {
                        code,
                        reason: reason.clone(),
                    });
                    let actions = self.controller.on_disconnected(code, &reason, false);
                    self.apply(actions).await;
                }
            }
        }
    }

    async fn on_audio(&mut self, message: AudioMessage) {
        if message.generation != self.connection.generation() {
            log::trace!("Dropping audio from chunker {}", message.generation);
            return;
        }
        if matches!(
            message.data,
            AudioData::EndOfAudio | AudioData::Stopped | AudioData::Failed(_)
        ) {
            self.chunker = None;
        }
        let actions = self.controller.on_audio(message.data);
        self.apply(actions).await;
    }

    async fn on_timer(&mut self, fired: TimerFired) {
        if self.timers.get(&fired.kind) != Some(&fired.id) {
            return;
        }
        self.timers.remove(&fired.kind);
        let actions = self.controller.on_timer(fired.kind);
        self.apply(actions).await;
    }

    fn open_connection(&mut self) {
        let connection_id = Uuid::new_v4().simple().to_string().to_uppercase();
        let snapshot = self.config.snapshot(&connection_id);
        self.connection.open(snapshot);
    }

    fn emit(&self, event: SessionEvent) {
        // the owner may have dropped the receiver
        let _ = self.events.send(event);
    }

    async fn apply(&mut self, actions: Vec<Action>) {
        let mut queue: VecDeque<Action> = actions.into();
        while let Some(action) = queue.pop_front() {
            match action {
                Action::OpenConnection => self.open_connection(),
                Action::CloseConnection { code, reason } => {
                    let was = self.connection.state();
                    if self.connection.close(code, &reason).await && was == ConnectionState::Connected {
                        self.emit(SessionEvent::Disconnected { code, reason });
                    }
                }
                Action::Send(frame) => {
                    let path = frame.path().to_string();
                    let request_id = frame.request_id().to_string();
                    match self.connection.send(frame).await {
                        Ok(size) => self.emit(SessionEvent::MessageSent {
                            path,
                            request_id,
                            size,
                        }),
                        // a close event follows a broken connection
                        Err(e) => log::warn!("⚠️ Failed to send {}: {}", path, e),
                    }
                }
                Action::Emit(event) => self.emit(SessionEvent::Recognition(event)),
                Action::StartAudio { throttled } => {
                    if let Some(previous) = self.chunker.take() {
                        previous.abort();
                    }
                    let clock = if throttled {
                        Some(self.throttle_clock.get_or_insert_with(ThrottleClock::new).clone())
                    } else {
                        None
                    };
                    self.chunker = Some(AudioChunker::start(
                        self.source.clone(),
                        self.chunk_size,
                        clock,
                        self.connection.generation(),
                        self.audio_tx.clone(),
                    ));
                }
                Action::StopAudio => match &self.chunker {
                    Some(chunker) => chunker.stop(),
                    None => queue.extend(self.controller.on_audio(AudioData::Stopped)),
                },
                Action::PauseAudio => {
                    if let Some(chunker) = self.chunker.take() {
                        chunker.abort();
                    }
                }
                Action::ReleaseThrottle => {
                    self.throttle_clock = None;
                    if let Some(chunker) = &self.chunker {
                        chunker.release_throttle();
                    }
                }
                Action::Schedule { kind, delay } => {
                    if let Some(previous) = self.timers.remove(&kind) {
                        self.scheduler.cancel(previous);
                    }
                    let id = self.scheduler.schedule(delay, kind);
                    self.timers.insert(kind, id);
                }
                Action::CancelTimer(kind) => {
                    if let Some(id) = self.timers.remove(&kind) {
                        self.scheduler.cancel(id);
                    }
                }
                Action::StopCompleted => {
                    for reply in self.pending_stops.drain(..) {
                        let _ = reply.send(Ok(()));
                    }
                }
            }
        }
    }
}
