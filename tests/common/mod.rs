//! In-memory speech service used by the integration tests.
//!
//! The service recognizes one phrase per `phrase_bytes` of audio received,
//! answers the empty audio frame with `turn.end` and records every frame the
//! client sends, per connection. Offsets restart at every turn's WAV header,
//! the way the real service counts them.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use speech_protocol::{paths, Frame, RawMessage};
use speech_session_rs::audio::AudioFormat;
use speech_session_rs::config::ConnectionSnapshot;
use speech_session_rs::transport::{
    TransportError, TransportEvent, TransportFactory, TransportSink, TransportStream,
};
use speech_session_rs::{RecognitionEvent, SessionEvent};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct MockOptions {
    /// Audio bytes per recognized phrase
    pub phrase_bytes: usize,
    /// Never report speech, so the client keeps pacing its audio
    pub silent: bool,
    /// Drop the first connection after this many phrases
    pub drop_after_phrases: Option<usize>,
    /// Drop the first connection after this much audio
    pub drop_after_bytes: Option<usize>,
    pub drop_code: u16,
    /// End each turn from the service side after this many phrases
    pub end_turn_after_phrases: Option<usize>,
    /// Never answer the end of a turn's audio with `turn.end`
    pub never_end_turn: bool,
    /// Send a frame that cannot be parsed right after this many phrases
    pub garble_after_phrases: Option<usize>,
    /// Reject connection attempts from this index on
    pub reject_from: Option<usize>,
    pub reject_code: u32,
}

impl Default for MockOptions {
    fn default() -> Self {
        Self {
            phrase_bytes: 32_000,
            silent: false,
            drop_after_phrases: None,
            drop_after_bytes: None,
            drop_code: 1006,
            end_turn_after_phrases: None,
            never_end_turn: false,
            garble_after_phrases: None,
            reject_from: None,
            reject_code: 401000,
        }
    }
}

/// What one connection saw
#[derive(Debug, Clone, Default)]
pub struct ConnectionLog {
    pub uri: String,
    pub headers: Vec<(String, String)>,
    pub frames: Vec<Frame>,
}

impl ConnectionLog {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn paths(&self) -> Vec<&str> {
        self.frames.iter().map(|f| f.path()).collect()
    }

    /// Audio bytes after each turn's WAV header, in send order
    pub fn audio_payload(&self) -> Vec<u8> {
        self.frames
            .iter()
            .filter(|f| f.is_path(paths::AUDIO) && !f.headers().contains("content-type"))
            .flat_map(|f| f.body().to_vec())
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct ServiceLog {
    pub attempts: usize,
    pub connections: Vec<ConnectionLog>,
}

#[derive(Clone, Default)]
pub struct MockSpeechService {
    options: MockOptions,
    log: Arc<Mutex<ServiceLog>>,
}

impl MockSpeechService {
    pub fn new(options: MockOptions) -> Self {
        Self {
            options,
            log: Arc::new(Mutex::new(ServiceLog::default())),
        }
    }

    pub fn attempts(&self) -> usize {
        self.log.lock().unwrap().attempts
    }

    pub fn connections(&self) -> Vec<ConnectionLog> {
        self.log.lock().unwrap().connections.clone()
    }

    pub fn connection(&self, index: usize) -> ConnectionLog {
        self.connections()[index].clone()
    }
}

#[async_trait]
impl TransportFactory for MockSpeechService {
    async fn connect(
        &self,
        snapshot: &ConnectionSnapshot,
    ) -> Result<(Box<dyn TransportSink>, Box<dyn TransportStream>), TransportError> {
        let index = {
            let mut log = self.log.lock().unwrap();
            let attempt = log.attempts;
            log.attempts += 1;
            if self.options.reject_from.is_some_and(|from| attempt >= from) {
                return Err(TransportError::Rejected {
                    code: self.options.reject_code,
                    reason: "rejected by mock service".to_string(),
                });
            }
            log.connections.push(ConnectionLog {
                uri: snapshot.uri.to_string(),
                headers: snapshot.headers.clone(),
                frames: Vec::new(),
            });
            log.connections.len() - 1
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let sink = MockSink {
            options: self.options.clone(),
            log: self.log.clone(),
            index,
            tx,
            closed: false,
            request_id: String::new(),
            targets: Vec::new(),
            connection_bytes: 0,
            turn_bytes: 0,
            turn_open: false,
            turn_phrases: 0,
            pending: 0,
            phrase_start: 0,
            speaking: false,
            phrases: 0,
        };
        Ok((Box::new(sink), Box::new(MockStream { rx })))
    }
}

struct MockStream {
    rx: mpsc::UnboundedReceiver<TransportEvent>,
}

#[async_trait]
impl TransportStream for MockStream {
    async fn recv(&mut self) -> TransportEvent {
        self.rx.recv().await.unwrap_or(TransportEvent::Closed {
            code: 1006,
            reason: "mock service gone".to_string(),
        })
    }
}

struct MockSink {
    options: MockOptions,
    log: Arc<Mutex<ServiceLog>>,
    index: usize,
    tx: mpsc::UnboundedSender<TransportEvent>,
    closed: bool,
    request_id: String,
    targets: Vec<String>,
    connection_bytes: u64,
    /// Audio in the current turn; offsets count from here
    turn_bytes: u64,
    turn_open: bool,
    turn_phrases: usize,
    pending: usize,
    phrase_start: u64,
    speaking: bool,
    phrases: usize,
}

fn ticks(bytes: u64) -> u64 {
    AudioFormat::default().ticks_for_bytes(bytes)
}

impl MockSink {
    fn reply(&self, path: &str, body: Value) {
        let raw = Frame::text(path, &self.request_id, body.to_string())
            .encode()
            .unwrap();
        let _ = self.tx.send(TransportEvent::Message(raw));
    }

    fn begin_turn(&mut self, request_id: &str) {
        self.request_id = request_id.to_string();
        self.turn_open = true;
        self.turn_bytes = 0;
        self.turn_phrases = 0;
        self.pending = 0;
        self.speaking = false;
        self.reply(paths::TURN_START, json!({ "context": { "serviceTag": "mock" } }));
    }

    fn end_turn(&mut self) {
        self.turn_open = false;
        self.reply(paths::TURN_END, json!({}));
    }

    fn drop_connection(&mut self) {
        self.closed = true;
        let _ = self.tx.send(TransportEvent::Closed {
            code: self.options.drop_code,
            reason: "mock service reset".to_string(),
        });
    }

    fn on_audio(&mut self, len: usize) {
        if !self.turn_open {
            // the turn already ended; the client catches up with a new header
            return;
        }
        self.connection_bytes += len as u64;
        if self.index == 0
            && self
                .options
                .drop_after_bytes
                .is_some_and(|limit| self.connection_bytes >= limit as u64)
        {
            self.drop_connection();
            return;
        }
        if self.options.silent {
            self.turn_bytes += len as u64;
            return;
        }
        if !self.speaking {
            self.speaking = true;
            self.phrase_start = self.turn_bytes;
            self.reply(
                paths::SPEECH_START_DETECTED,
                json!({ "Offset": ticks(self.phrase_start) }),
            );
        }
        self.turn_bytes += len as u64;
        self.pending += len;

        let text = format!("phrase {}", self.phrases + 1);
        if self.targets.is_empty() {
            self.reply(
                paths::SPEECH_HYPOTHESIS,
                json!({
                    "Text": text,
                    "Offset": ticks(self.phrase_start),
                    "Duration": ticks(self.pending as u64),
                }),
            );
        } else {
            self.reply(
                paths::TRANSLATION_HYPOTHESIS,
                json!({
                    "Text": text,
                    "Offset": ticks(self.phrase_start),
                    "Duration": ticks(self.pending as u64),
                    "Translation": { "Translations": self.translations(&text) },
                }),
            );
        }

        if self.pending >= self.options.phrase_bytes {
            self.finish_phrase();
            if !self.closed
                && self
                    .options
                    .end_turn_after_phrases
                    .is_some_and(|n| self.turn_phrases >= n)
            {
                self.end_turn();
            }
        }
    }

    fn translations(&self, text: &str) -> Vec<Value> {
        self.targets
            .iter()
            .map(|language| json!({ "Language": language, "Text": format!("{language}: {text}") }))
            .collect()
    }

    fn finish_phrase(&mut self) {
        if !self.speaking {
            return;
        }
        self.speaking = false;
        self.phrases += 1;
        self.turn_phrases += 1;
        let text = format!("phrase {}", self.phrases);
        let duration = ticks(self.pending as u64);
        self.pending = 0;

        self.reply(
            paths::SPEECH_END_DETECTED,
            json!({ "Offset": ticks(self.turn_bytes) }),
        );
        if self.targets.is_empty() {
            self.reply(
                paths::SPEECH_PHRASE,
                json!({
                    "RecognitionStatus": "Success",
                    "DisplayText": text,
                    "Offset": ticks(self.phrase_start),
                    "Duration": duration,
                }),
            );
        } else {
            self.reply(
                paths::TRANSLATION_PHRASE,
                json!({
                    "RecognitionStatus": "Success",
                    "Text": text,
                    "Offset": ticks(self.phrase_start),
                    "Duration": duration,
                    "Translation": {
                        "TranslationStatus": "Success",
                        "Translations": self.translations(&text),
                    },
                }),
            );
        }

        if self.options.garble_after_phrases == Some(self.phrases) {
            let _ = self
                .tx
                .send(TransportEvent::Message(RawMessage::Binary(vec![0xff, 0xff, 1])));
        }
        if self.index == 0 && self.options.drop_after_phrases == Some(self.phrases) {
            self.drop_connection();
        }
    }
}

#[async_trait]
impl TransportSink for MockSink {
    async fn send(&mut self, message: RawMessage) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::NotConnected);
        }
        let frame = Frame::decode(&message)?;
        self.log.lock().unwrap().connections[self.index]
            .frames
            .push(frame.clone());

        if frame.is_path(paths::SPEECH_CONTEXT) {
            let body: Value = frame.body_json()?;
            self.targets = body["translationcontext"]["to"]
                .as_array()
                .map(|to| {
                    to.iter()
                        .filter_map(|l| l.as_str().map(String::from))
                        .collect()
                })
                .unwrap_or_default();
        } else if frame.is_path(paths::AUDIO) {
            if frame.headers().contains("content-type") {
                self.begin_turn(frame.request_id());
            } else if frame.body().is_empty() {
                if !self.turn_open {
                    return Ok(());
                }
                self.finish_phrase();
                if !self.closed && !self.options.never_end_turn {
                    self.end_turn();
                }
            } else {
                self.on_audio(frame.body().len());
            }
        }
        Ok(())
    }

    async fn close(&mut self, _code: u16, _reason: &str) -> Result<(), TransportError> {
        self.closed = true;
        Ok(())
    }
}

/// Receive events until `done` matches one, failing after `limit`
pub async fn collect_until(
    events: &mut mpsc::UnboundedReceiver<SessionEvent>,
    limit: Duration,
    mut done: impl FnMut(&SessionEvent) -> bool,
) -> Vec<SessionEvent> {
    let mut seen = Vec::new();
    let result = tokio::time::timeout(limit, async {
        while let Some(event) = events.recv().await {
            let finished = done(&event);
            seen.push(event);
            if finished {
                return true;
            }
        }
        false
    })
    .await;
    assert!(
        matches!(result, Ok(true)),
        "condition not reached, saw {} events: {:?}",
        seen.len(),
        seen.iter().rev().take(5).collect::<Vec<_>>()
    );
    seen
}

pub fn is_stopped(event: &SessionEvent) -> bool {
    matches!(
        event,
        SessionEvent::Recognition(RecognitionEvent::SessionStopped { .. })
    )
}

pub fn recognition(events: &[SessionEvent]) -> Vec<&RecognitionEvent> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Recognition(event) => Some(event),
            _ => None,
        })
        .collect()
}

/// Event names in order, with partial results left out
pub fn lifecycle(events: &[SessionEvent]) -> Vec<&'static str> {
    recognition(events)
        .into_iter()
        .filter(|e| !matches!(e, RecognitionEvent::Recognizing(_)))
        .map(|e| e.name())
        .collect()
}
