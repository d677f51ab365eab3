//! Recognition state machine.
//!
//! `TurnController` owns all turn and session state but performs no I/O: each
//! input returns the list of [`Action`]s the session task must carry out, in
//! order. This keeps ordering guarantees testable without a runtime.

use serde_json::json;
use speech_protocol::messages::{
    SpeechBoundary, SpeechHypothesis, SpeechPhrase, TranslationBlock, TranslationHypothesis,
    TranslationPhrase,
};
use speech_protocol::{paths, Frame, ProtocolError, RawMessage, RecognitionStatus, ServiceMessage};
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

use crate::audio::{AudioData, AudioFormat};
use crate::config::{ReconnectPolicy, SpeechConfig};
use crate::context::ContextBuilder;
use crate::error::{CancellationDetails, CancellationErrorCode, SessionError};
use crate::events::{RecognitionEvent, RecognitionResult, ResultReason};
use crate::telemetry::TelemetryAggregator;
use crate::timer::TimerKind;

/// Close code sent when an inbound frame breaks the handshake
const PROTOCOL_ERROR_CLOSE: u16 = 1002;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecognitionMode {
    /// Ends after the first final result
    SingleShot,
    /// Chains turns until stopped or the audio ends
    Continuous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    Connecting,
    Active,
    Stopping,
}

/// Side effects requested by the controller
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    OpenConnection,
    CloseConnection { code: u16, reason: String },
    Send(Frame),
    Emit(RecognitionEvent),
    StartAudio { throttled: bool },
    /// Flush the partial chunk and report back with `AudioData::Stopped`
    StopAudio,
    /// Drop audio not yet sent; used when the connection goes away
    PauseAudio,
    ReleaseThrottle,
    Schedule { kind: TimerKind, delay: Duration },
    CancelTimer(TimerKind),
    StopCompleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phrase {
    Silent,
    Speaking,
    /// Speech end seen, final result pending
    Ended,
}

/// Why the current turn is being left
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TurnExit {
    /// Keep the connection and start a fresh turn on it
    Reset,
    /// The audio ran out; the service is finishing the turn
    EndOfAudio,
    /// Single-shot result delivered
    Done,
}

pub struct TurnController {
    mode: RecognitionMode,
    state: TurnState,
    context: ContextBuilder,
    telemetry: TelemetryAggregator,
    format: AudioFormat,
    recognition_language: String,
    reconnect: ReconnectPolicy,
    stop_grace: Duration,

    connected: bool,
    handshake_complete: bool,
    speech_config_sent: bool,
    audio_running: bool,
    throttle_released: bool,

    session_id: Option<String>,
    session_started: bool,
    request_id: String,
    phrase: Phrase,
    exit: Option<TurnExit>,
    result_delivered: bool,
    source_exhausted: bool,

    /// Session offset at which the current turn's audio starts
    offset_base: u64,
    /// Audio sent in the current turn; the service counts offsets from its header
    turn_bytes: u64,
    last_offset: u64,
    reconnect_attempts: u32,
}

impl TurnController {
    pub fn new(config: &SpeechConfig) -> Self {
        Self {
            mode: RecognitionMode::Continuous,
            state: TurnState::Idle,
            context: ContextBuilder::new(config.target_languages.clone(), config.voice.clone()),
            telemetry: TelemetryAggregator::new(),
            format: config.audio_format,
            recognition_language: config.recognition_language.clone(),
            reconnect: config.reconnect,
            stop_grace: config.stop_grace,
            connected: false,
            handshake_complete: false,
            speech_config_sent: false,
            audio_running: false,
            throttle_released: false,
            session_id: None,
            session_started: false,
            request_id: String::new(),
            phrase: Phrase::Silent,
            exit: None,
            result_delivered: false,
            source_exhausted: false,
            offset_base: 0,
            turn_bytes: 0,
            last_offset: 0,
            reconnect_attempts: 0,
        }
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn mode(&self) -> RecognitionMode {
        self.mode
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn context(&self) -> &ContextBuilder {
        &self.context
    }

    fn is_running(&self) -> bool {
        matches!(self.state, TurnState::Active | TurnState::Stopping)
    }

    /// Audio may still be sent under the current request id
    fn turn_open(&self) -> bool {
        self.is_running() && self.exit.is_none()
    }

    /// Audio must stay queued until the reset turn is replaced
    pub fn holds_audio(&self) -> bool {
        self.is_running() && self.exit == Some(TurnExit::Reset)
    }

    // ----- caller commands -----

    pub fn start(&mut self, mode: RecognitionMode) -> Result<Vec<Action>, SessionError> {
        if self.state != TurnState::Idle {
            return Err(SessionError::AlreadyRunning);
        }

        log::info!("▶️ Starting {:?} recognition", mode);
        self.mode = mode;
        self.session_id = None;
        self.session_started = false;
        self.throttle_released = false;
        self.source_exhausted = false;
        self.reconnect_attempts = 0;
        self.offset_base = 0;
        self.last_offset = 0;
        self.turn_bytes = 0;

        let mut actions = Vec::new();
        if self.connected {
            self.state = TurnState::Active;
            self.begin_turn(&mut actions);
        } else {
            self.state = TurnState::Connecting;
            actions.push(Action::OpenConnection);
        }
        Ok(actions)
    }

    pub fn stop(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        match self.state {
            TurnState::Idle => actions.push(Action::StopCompleted),
            TurnState::Stopping => {}
            TurnState::Connecting => {
                log::info!("⏹️ Stop while connecting");
                self.state = TurnState::Stopping;
                self.end_run(&mut actions);
            }
            TurnState::Active => {
                log::info!("⏹️ Stopping recognition");
                self.state = TurnState::Stopping;
                actions.push(Action::Schedule {
                    kind: TimerKind::StopGrace,
                    delay: self.stop_grace,
                });
                if self.audio_running {
                    actions.push(Action::StopAudio);
                } else if self.turn_open() {
                    self.end_audio(&mut actions, TurnExit::EndOfAudio);
                }
            }
        }
        actions
    }

    pub fn add_target_language(&mut self, language: &str) -> Vec<Action> {
        if self.context.add_target_language(language) {
            log::info!("🌍 Added target language {}", language);
        }
        Vec::new()
    }

    /// Removing the primary language with a voice configured resets the turn
    pub fn remove_target_language(&mut self, language: &str) -> Vec<Action> {
        let mut actions = Vec::new();
        let voice = self.context.voice_configured();
        match self.context.remove_target_language(language) {
            Some(0) if voice && self.turn_open() => {
                log::info!("🔁 Primary language {} removed, resetting turn", language);
                self.end_audio(&mut actions, TurnExit::Reset);
                actions.push(Action::Schedule {
                    kind: TimerKind::TurnReset,
                    delay: self.stop_grace,
                });
            }
            Some(index) => log::info!("🌍 Removed target language {} (index {})", language, index),
            None => log::debug!("Target language {} was not configured", language),
        }
        actions
    }

    pub fn add_phrase(&mut self, phrase: &str) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.context.add_phrase(phrase) {
            self.resend_context(&mut actions);
        }
        actions
    }

    pub fn clear_phrases(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.context.clear_phrases() {
            self.resend_context(&mut actions);
        }
        actions
    }

    pub fn set_context_property(&mut self, name: &str, value: &str) -> Vec<Action> {
        let mut actions = Vec::new();
        self.context.set_service_property(name, value);
        self.resend_context(&mut actions);
        actions
    }

    pub fn set_context_section(&mut self, name: &str, value: serde_json::Value) -> Vec<Action> {
        let mut actions = Vec::new();
        self.context.set_section(name, value);
        self.resend_context(&mut actions);
        actions
    }

    fn resend_context(&mut self, actions: &mut Vec<Action>) {
        if self.turn_open() {
            push_frame(actions, self.context.build(&self.request_id));
        }
    }

    // ----- connection events -----

    pub fn on_connected(&mut self) -> Vec<Action> {
        self.connected = true;
        self.handshake_complete = false;
        self.speech_config_sent = false;
        self.turn_bytes = 0;

        let mut actions = Vec::new();
        for (request_id, record) in self.telemetry.take_deferred() {
            log::debug!("📊 Sending telemetry held for turn {}", request_id);
            push_frame(&mut actions, record.to_frame(&request_id));
        }
        if self.state == TurnState::Connecting {
            self.state = TurnState::Active;
            self.begin_turn(&mut actions);
        }
        actions
    }

    pub fn on_open_failed(&mut self, status: Option<u32>, message: &str) -> Vec<Action> {
        self.connected = false;
        let mut actions = Vec::new();
        match self.state {
            TurnState::Connecting if self.reconnect_attempts > 0 => {
                log::warn!(
                    "🔌 Reconnect attempt {} failed: {}",
                    self.reconnect_attempts,
                    message
                );
                self.schedule_reconnect(&mut actions, status, message);
            }
            TurnState::Connecting | TurnState::Stopping => {
                let details = match status {
                    Some(code) => format!("Connection failed ({code}): {message}"),
                    None => format!("Connection failed: {message}"),
                };
                self.cancel(&mut actions, CancellationErrorCode::ConnectionFailure, details);
            }
            TurnState::Idle | TurnState::Active => {}
        }
        actions
    }

    /// `by_caller` is true when the session's owner closed the connection
    pub fn on_disconnected(&mut self, code: u16, reason: &str, by_caller: bool) -> Vec<Action> {
        self.connected = false;
        let mut actions = Vec::new();

        if self.audio_running {
            self.audio_running = false;
            actions.push(Action::PauseAudio);
        }
        self.rebase_offsets();

        match self.state {
            TurnState::Idle => {}
            TurnState::Connecting if by_caller => {
                self.cancel(
                    &mut actions,
                    CancellationErrorCode::ConnectionFailure,
                    format!("Disconnect: connection closed by caller ({code})"),
                );
            }
            TurnState::Connecting => {}
            TurnState::Stopping => {
                self.close_phrase(&mut actions);
                self.end_run(&mut actions);
            }
            TurnState::Active => {
                self.close_phrase(&mut actions);
                if by_caller {
                    self.cancel(
                        &mut actions,
                        CancellationErrorCode::ConnectionFailure,
                        format!("Disconnect: connection closed by caller ({code})"),
                    );
                } else if self.mode == RecognitionMode::SingleShot && self.result_delivered {
                    self.end_run(&mut actions);
                } else if self.mode == RecognitionMode::Continuous
                    && self.exit == Some(TurnExit::EndOfAudio)
                {
                    self.emit(
                        &mut actions,
                        RecognitionEvent::Canceled(CancellationDetails::end_of_stream()),
                    );
                    self.end_run(&mut actions);
                } else if self.mode == RecognitionMode::Continuous && !matches!(code, 1007 | 1008) {
                    log::info!("🔄 Connection lost ({} {}), reconnecting", code, reason);
                    self.state = TurnState::Connecting;
                    self.schedule_reconnect(&mut actions, Some(code as u32), reason);
                } else {
                    self.cancel(
                        &mut actions,
                        CancellationErrorCode::from_close_code(code),
                        format!("Disconnect: {code} {reason}"),
                    );
                }
            }
        }
        actions
    }

    pub fn on_timer(&mut self, kind: TimerKind) -> Vec<Action> {
        let mut actions = Vec::new();
        match (kind, self.state) {
            (TimerKind::StopGrace, TurnState::Stopping) => {
                log::warn!("⏰ Service did not end the turn in time, finishing stop");
                self.end_run(&mut actions);
            }
            (TimerKind::Reconnect, TurnState::Connecting) => actions.push(Action::OpenConnection),
            (TimerKind::TurnReset, TurnState::Active) if self.holds_audio() => {
                log::warn!("⏰ Service did not end the turn {} after a reset", self.request_id);
                self.close_phrase(&mut actions);
                self.cancel(
                    &mut actions,
                    CancellationErrorCode::ServiceTimeout,
                    "Turn was not ended after a reset".to_string(),
                );
            }
            _ => log::debug!("Ignoring {:?} timer in {:?}", kind, self.state),
        }
        actions
    }

    fn schedule_reconnect(&mut self, actions: &mut Vec<Action>, status: Option<u32>, reason: &str) {
        self.reconnect_attempts += 1;
        if self.reconnect_attempts > self.reconnect.max_attempts {
            let details = match status {
                Some(code) => format!("Reconnect failed after {} attempts ({code}): {reason}", self.reconnect.max_attempts),
                None => format!("Reconnect failed after {} attempts: {reason}", self.reconnect.max_attempts),
            };
            self.cancel(actions, CancellationErrorCode::ConnectionFailure, details);
            return;
        }
        let delay = self.reconnect.backoff * (self.reconnect_attempts - 1);
        if delay.is_zero() {
            actions.push(Action::OpenConnection);
        } else {
            actions.push(Action::Schedule {
                kind: TimerKind::Reconnect,
                delay,
            });
        }
    }

    // ----- audio -----

    pub fn on_audio(&mut self, data: AudioData) -> Vec<Action> {
        let mut actions = Vec::new();
        match data {
            AudioData::Chunk(chunk) => {
                if self.turn_open() && self.connected {
                    self.send_audio(&mut actions, chunk);
                } else {
                    log::trace!("Dropping {} audio bytes outside an open turn", chunk.len());
                }
            }
            AudioData::EndOfAudio => {
                self.audio_running = false;
                self.source_exhausted = true;
                if self.turn_open() {
                    self.end_audio(&mut actions, TurnExit::EndOfAudio);
                }
            }
            AudioData::Stopped => {
                self.audio_running = false;
                if self.state == TurnState::Stopping && self.turn_open() {
                    self.end_audio(&mut actions, TurnExit::EndOfAudio);
                }
            }
            AudioData::Failed(error) => {
                self.audio_running = false;
                if self.is_running() {
                    self.close_phrase(&mut actions);
                    self.cancel(&mut actions, CancellationErrorCode::RuntimeError, error);
                }
            }
        }
        actions
    }

    fn send_audio(&mut self, actions: &mut Vec<Action>, chunk: Vec<u8>) {
        self.turn_bytes += chunk.len() as u64;
        actions.push(Action::Send(Frame::binary(
            paths::AUDIO,
            &self.request_id,
            chunk,
        )));
    }

    /// Send the empty audio frame that tells the service the turn's audio ended
    fn end_audio(&mut self, actions: &mut Vec<Action>, exit: TurnExit) {
        if self.exit.is_some() {
            return;
        }
        self.exit = Some(exit);
        if self.connected {
            actions.push(Action::Send(Frame::binary(
                paths::AUDIO,
                &self.request_id,
                Vec::new(),
            )));
        }
    }

    // ----- turns -----

    fn begin_turn(&mut self, actions: &mut Vec<Action>) {
        self.rebase_offsets();
        self.request_id = new_request_id();
        self.phrase = Phrase::Silent;
        self.exit = None;
        self.result_delivered = false;

        let session_id = self.session_id.clone().unwrap_or_else(|| self.request_id.clone());
        if let Some((previous_id, record)) = self.telemetry.begin(&self.request_id, &session_id) {
            push_frame(actions, record.to_frame(&previous_id));
        }

        log::debug!("🆕 Turn {} starting", self.request_id);
        if !self.speech_config_sent {
            self.speech_config_sent = true;
            push_frame(actions, self.speech_config());
        }
        push_frame(actions, self.context.build(&self.request_id));
        actions.push(Action::Send(
            Frame::binary(paths::AUDIO, &self.request_id, self.format.wav_header())
                .with_header("Content-Type", "audio/x-wav"),
        ));

        if self.source_exhausted {
            // nothing left to read; close the turn straight away
            self.end_audio(actions, TurnExit::EndOfAudio);
        } else if !self.audio_running {
            self.audio_running = true;
            actions.push(Action::StartAudio {
                throttled: !self.throttle_released,
            });
        }
    }

    fn speech_config(&self) -> Result<Frame, ProtocolError> {
        let recognition = match self.mode {
            RecognitionMode::SingleShot => "interactive",
            RecognitionMode::Continuous => "conversation",
        };
        let body = json!({
            "context": {
                "system": {
                    "name": env!("CARGO_PKG_NAME"),
                    "version": env!("CARGO_PKG_VERSION"),
                    "build": "Rust",
                },
                "os": {
                    "platform": std::env::consts::OS,
                    "name": std::env::consts::ARCH,
                },
                "audio": {
                    "source": {
                        "type": "Stream",
                        "samplerate": self.format.sample_rate,
                        "bitspersample": self.format.bits_per_sample,
                        "channelcount": self.format.channels,
                    }
                },
            },
            "recognition": recognition,
            "language": self.recognition_language,
        });
        Ok(Frame::text(paths::SPEECH_CONFIG, "", serde_json::to_string(&body)?)
            .with_header("Content-Type", "application/json"))
    }

    // ----- inbound frames -----

    pub fn on_message(&mut self, raw: &RawMessage) -> Vec<Action> {
        let mut actions = Vec::new();

        let parsed = Frame::decode(raw)
            .and_then(|frame| ServiceMessage::from_frame(&frame).map(|message| (frame, message)));
        let (frame, message) = match parsed {
            Ok(parsed) => parsed,
            Err(e) if !self.handshake_complete => {
                log::error!("❌ Malformed frame during handshake: {}", e);
                actions.push(Action::CloseConnection {
                    code: PROTOCOL_ERROR_CLOSE,
                    reason: "malformed frame".to_string(),
                });
                self.connected = false;
                if self.audio_running {
                    self.audio_running = false;
                    actions.push(Action::PauseAudio);
                }
                if self.is_running() {
                    self.close_phrase(&mut actions);
                    self.cancel(
                        &mut actions,
                        CancellationErrorCode::ConnectionFailure,
                        format!("Malformed frame during handshake: {e}"),
                    );
                }
                return actions;
            }
            Err(e) => {
                log::warn!("⚠️ Dropping malformed frame: {}", e);
                return actions;
            }
        };
        self.handshake_complete = true;

        if !self.is_running() {
            log::debug!("Dropping {} with no recognition running", frame.path());
            return actions;
        }
        if frame.request_id() != self.request_id {
            log::debug!(
                "Dropping {} for request {} (current {})",
                frame.path(),
                frame.request_id(),
                self.request_id
            );
            return actions;
        }

        let json = frame.body_text().unwrap_or_default().to_string();
        match message {
            ServiceMessage::TurnStart(start) => {
                self.reconnect_attempts = 0;
                if let Some(tag) = start.service_tag() {
                    log::debug!("🏷️ Service tag {}", tag);
                }
                if !self.session_started {
                    let session_id = self.request_id.clone();
                    self.session_id = Some(session_id.clone());
                    self.session_started = true;
                    self.telemetry.set_session_id(&session_id);
                    self.emit(&mut actions, RecognitionEvent::SessionStarted { session_id });
                }
            }
            ServiceMessage::SpeechStartDetected(SpeechBoundary { offset }) => {
                self.telemetry.listening_started();
                if !self.throttle_released {
                    self.throttle_released = true;
                    actions.push(Action::ReleaseThrottle);
                }
                if !self.single_shot_done() {
                    self.open_phrase(&mut actions, offset);
                }
            }
            ServiceMessage::SpeechHypothesis(hypothesis)
            | ServiceMessage::SpeechFragment(hypothesis) => {
                self.telemetry.hypothesis();
                self.on_hypothesis(&mut actions, hypothesis, json);
            }
            ServiceMessage::TranslationHypothesis(hypothesis) => {
                self.telemetry.hypothesis();
                self.on_translation_hypothesis(&mut actions, hypothesis, json);
            }
            ServiceMessage::SpeechEndDetected(SpeechBoundary { offset }) => {
                if self.phrase == Phrase::Speaking {
                    self.phrase = Phrase::Ended;
                    let offset = self.absolute(offset);
                    self.emit(&mut actions, RecognitionEvent::SpeechEndDetected { offset });
                }
            }
            ServiceMessage::SpeechPhrase(phrase) => {
                self.telemetry.phrase();
                self.on_phrase(&mut actions, phrase, json);
            }
            ServiceMessage::TranslationPhrase(phrase) => {
                self.telemetry.phrase();
                self.on_translation_phrase(&mut actions, phrase, json);
            }
            ServiceMessage::SynthesisEnd => log::debug!("🔊 Synthesis ended"),
            ServiceMessage::TurnEnd => self.on_turn_end(&mut actions),
            ServiceMessage::Unknown(path) => log::debug!("Ignoring message on {}", path),
        }
        actions
    }

    fn on_hypothesis(&mut self, actions: &mut Vec<Action>, hypothesis: SpeechHypothesis, json: String) {
        if !self.accepts_partial() {
            return;
        }
        self.open_phrase(actions, hypothesis.offset);
        let result = self.result(
            ResultReason::RecognizingSpeech,
            hypothesis.text,
            hypothesis.offset,
            hypothesis.duration,
            hypothesis.language,
            None,
            json,
        );
        self.emit(actions, RecognitionEvent::Recognizing(result));
    }

    fn on_translation_hypothesis(
        &mut self,
        actions: &mut Vec<Action>,
        hypothesis: TranslationHypothesis,
        json: String,
    ) {
        if !self.accepts_partial() {
            return;
        }
        self.open_phrase(actions, hypothesis.offset);
        let result = self.result(
            ResultReason::TranslatingSpeech,
            hypothesis.text,
            hypothesis.offset,
            hypothesis.duration,
            None,
            Some(hypothesis.translation),
            json,
        );
        self.emit(actions, RecognitionEvent::Recognizing(result));
    }

    /// Partials are only valid between speech start and speech end
    fn accepts_partial(&self) -> bool {
        self.phrase != Phrase::Ended && !self.single_shot_done()
    }

    fn single_shot_done(&self) -> bool {
        self.mode == RecognitionMode::SingleShot && self.result_delivered
    }

    fn on_phrase(&mut self, actions: &mut Vec<Action>, phrase: SpeechPhrase, json: String) {
        let status = phrase.recognition_status.clone();
        if !self.check_status(actions, &status) {
            return;
        }
        let reason = if status.is_no_match() {
            ResultReason::NoMatch
        } else {
            ResultReason::RecognizedSpeech
        };
        let result = self.result(
            reason,
            phrase.display_text.unwrap_or_default(),
            phrase.offset,
            phrase.duration,
            phrase.language,
            None,
            json,
        );
        self.deliver_final(actions, result);
    }

    fn on_translation_phrase(&mut self, actions: &mut Vec<Action>, phrase: TranslationPhrase, json: String) {
        let status = phrase.recognition_status.clone();
        if !self.check_status(actions, &status) {
            return;
        }
        if let Some(reason) = phrase.translation.as_ref().and_then(|t| t.failure_reason.as_deref()) {
            log::warn!("⚠️ Translation failed: {}", reason);
        }
        let reason = if status.is_no_match() {
            ResultReason::NoMatch
        } else {
            ResultReason::TranslatedSpeech
        };
        let result = self.result(
            reason,
            phrase.text.unwrap_or_default(),
            phrase.offset,
            phrase.duration,
            None,
            phrase.translation,
            json,
        );
        self.deliver_final(actions, result);
    }

    /// Returns true if the phrase carries a result to deliver
    fn check_status(&mut self, actions: &mut Vec<Action>, status: &RecognitionStatus) -> bool {
        if self.single_shot_done() {
            return false;
        }
        if *status == RecognitionStatus::EndOfDictation {
            log::debug!("End of dictation");
            return false;
        }
        if status.is_failure() {
            let code = match status {
                RecognitionStatus::TooManyRequests => CancellationErrorCode::TooManyRequests,
                RecognitionStatus::BadRequest => CancellationErrorCode::BadRequest,
                RecognitionStatus::Forbidden => CancellationErrorCode::Forbidden,
                RecognitionStatus::ServiceUnavailable => CancellationErrorCode::ServiceUnavailable,
                _ => CancellationErrorCode::ServiceError,
            };
            self.close_phrase(actions);
            self.cancel(actions, code, format!("Recognition status {}", status.as_str()));
            return false;
        }
        true
    }

    fn deliver_final(&mut self, actions: &mut Vec<Action>, result: RecognitionResult) {
        if result.reason != ResultReason::NoMatch {
            self.open_phrase(actions, result.offset.saturating_sub(self.offset_base));
        }
        if self.phrase == Phrase::Speaking {
            self.phrase = Phrase::Ended;
            let offset = result.offset + result.duration;
            self.emit(actions, RecognitionEvent::SpeechEndDetected { offset });
        }
        self.phrase = Phrase::Silent;
        self.result_delivered = true;
        self.emit(actions, RecognitionEvent::Recognized(result));

        if self.mode == RecognitionMode::SingleShot {
            if self.audio_running {
                self.audio_running = false;
                actions.push(Action::PauseAudio);
            }
            self.end_audio(actions, TurnExit::Done);
        }
    }

    fn on_turn_end(&mut self, actions: &mut Vec<Action>) {
        self.close_phrase(actions);
        if let Some((request_id, record)) = self.telemetry.finish() {
            push_frame(actions, record.to_frame(&request_id));
        }

        if self.state == TurnState::Stopping {
            self.end_run(actions);
            return;
        }

        match (self.mode, self.exit) {
            (_, Some(TurnExit::Reset)) => {
                log::info!("🔁 Turn {} reset", self.request_id);
                actions.push(Action::CancelTimer(TimerKind::TurnReset));
                self.begin_turn(actions);
            }
            (RecognitionMode::Continuous, Some(TurnExit::EndOfAudio)) => {
                self.emit(actions, RecognitionEvent::Canceled(CancellationDetails::end_of_stream()));
                self.end_run(actions);
            }
            (RecognitionMode::Continuous, _) => self.begin_turn(actions),
            (RecognitionMode::SingleShot, _) => {
                if !self.result_delivered && self.exit == Some(TurnExit::EndOfAudio) {
                    self.emit(actions, RecognitionEvent::Canceled(CancellationDetails::end_of_stream()));
                }
                self.end_run(actions);
            }
        }
    }

    // ----- helpers -----

    /// Fold the audio of the finished turn or connection into the session offset
    fn rebase_offsets(&mut self) {
        self.offset_base += self.format.ticks_for_bytes(self.turn_bytes);
        self.turn_bytes = 0;
    }

    fn absolute(&mut self, offset: u64) -> u64 {
        let absolute = self.offset_base + offset;
        self.last_offset = self.last_offset.max(absolute);
        absolute
    }

    /// Make sure a speech start precedes anything reported for a phrase
    fn open_phrase(&mut self, actions: &mut Vec<Action>, offset: u64) {
        if self.phrase == Phrase::Silent {
            self.phrase = Phrase::Speaking;
            let offset = self.absolute(offset);
            self.emit(actions, RecognitionEvent::SpeechStartDetected { offset });
        }
    }

    /// Emit the speech end a phrase is still owed
    fn close_phrase(&mut self, actions: &mut Vec<Action>) {
        if self.phrase == Phrase::Speaking {
            let offset = self.last_offset;
            self.emit(actions, RecognitionEvent::SpeechEndDetected { offset });
        }
        self.phrase = Phrase::Silent;
    }

    #[allow(clippy::too_many_arguments)]
    fn result(
        &mut self,
        reason: ResultReason,
        text: String,
        offset: u64,
        duration: u64,
        language: Option<String>,
        translation: Option<TranslationBlock>,
        json: String,
    ) -> RecognitionResult {
        let offset = self.absolute(offset);
        self.last_offset = self.last_offset.max(offset + duration);
        let translations: BTreeMap<String, String> = translation
            .map(|block| {
                block
                    .translations
                    .into_iter()
                    .map(|t| (t.language, t.text))
                    .collect()
            })
            .unwrap_or_default();
        RecognitionResult {
            result_id: Uuid::new_v4().simple().to_string(),
            reason,
            text,
            offset,
            duration,
            language,
            translations,
            json,
        }
    }

    fn emit(&mut self, actions: &mut Vec<Action>, event: RecognitionEvent) {
        event.log();
        actions.push(Action::Emit(event));
    }

    /// Report an error cancellation and end the run
    fn cancel(&mut self, actions: &mut Vec<Action>, code: CancellationErrorCode, details: String) {
        log::warn!("🛑 Recognition canceled: {} {}", code, details);
        self.emit(
            actions,
            RecognitionEvent::Canceled(CancellationDetails::error(code, details)),
        );
        self.end_run(actions);
    }

    /// Close out the run: stop audio, bracket with SessionStopped, go idle
    fn end_run(&mut self, actions: &mut Vec<Action>) {
        let stopping = self.state == TurnState::Stopping;

        if self.audio_running {
            self.audio_running = false;
            actions.push(Action::PauseAudio);
        }
        actions.push(Action::CancelTimer(TimerKind::Reconnect));
        actions.push(Action::CancelTimer(TimerKind::TurnReset));
        if stopping {
            actions.push(Action::CancelTimer(TimerKind::StopGrace));
        }

        if let Some((request_id, record)) = self.telemetry.finish() {
            if self.connected {
                push_frame(actions, record.to_frame(&request_id));
            } else {
                self.telemetry.defer(request_id, record);
            }
        }

        if self.session_started {
            let session_id = self.session_id.clone().unwrap_or_default();
            self.emit(actions, RecognitionEvent::SessionStopped { session_id });
        }

        self.session_started = false;
        self.exit = None;
        self.phrase = Phrase::Silent;
        self.state = TurnState::Idle;
        log::info!("⏏️ Recognition ended");

        if stopping {
            actions.push(Action::StopCompleted);
        }
    }
}

fn new_request_id() -> String {
    Uuid::new_v4().simple().to_string().to_uppercase()
}

fn push_frame(actions: &mut Vec<Action>, frame: Result<Frame, ProtocolError>) {
    match frame {
        Ok(frame) => actions.push(Action::Send(frame)),
        Err(e) => log::error!("❌ Failed to build frame: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CancellationReason;
    use speech_protocol::FrameKind;

    fn config() -> SpeechConfig {
        SpeechConfig::new("wss://example.test/speech").unwrap()
    }

    fn service(path: &str, request_id: &str, body: &str) -> RawMessage {
        Frame::text(path, request_id, body).encode().unwrap()
    }

    fn events(actions: &[Action]) -> Vec<RecognitionEvent> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Emit(event) => Some(event.clone()),
                _ => None,
            })
            .collect()
    }

    fn names(actions: &[Action]) -> Vec<&'static str> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Emit(event) => Some(event.name()),
                _ => None,
            })
            .collect()
    }

    fn sent(actions: &[Action]) -> Vec<&Frame> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Send(frame) => Some(frame),
                _ => None,
            })
            .collect()
    }

    fn running(config: &SpeechConfig, mode: RecognitionMode) -> (TurnController, Vec<Action>) {
        let mut controller = TurnController::new(config);
        let mut actions = controller.start(mode).unwrap();
        assert_eq!(actions, vec![Action::OpenConnection]);
        actions = controller.on_connected();
        (controller, actions)
    }

    fn turn_start(controller: &mut TurnController) -> Vec<Action> {
        let id = controller.request_id().to_string();
        controller.on_message(&service("turn.start", &id, ""))
    }

    fn say(controller: &mut TurnController, path: &str, body: &str) -> Vec<Action> {
        let id = controller.request_id().to_string();
        controller.on_message(&service(path, &id, body))
    }

    #[test]
    fn test_turn_begins_with_config_context_and_header() {
        let config = config().with_target_languages(["de"]);
        let (controller, actions) = running(&config, RecognitionMode::Continuous);

        let frames = sent(&actions);
        let paths: Vec<&str> = frames.iter().map(|f| f.path()).collect();
        assert_eq!(paths, vec!["speech.config", "speech.context", "audio"]);
        assert_eq!(frames[2].kind(), FrameKind::Binary);
        assert_eq!(frames[2].body().len(), crate::audio::WAV_HEADER_LEN);
        assert_eq!(frames[1].request_id(), controller.request_id());
        assert!(actions.contains(&Action::StartAudio { throttled: true }));
        assert_eq!(controller.state(), TurnState::Active);
    }

    #[test]
    fn test_start_twice_is_rejected() {
        let (mut controller, _) = running(&config(), RecognitionMode::Continuous);
        assert!(matches!(
            controller.start(RecognitionMode::SingleShot),
            Err(SessionError::AlreadyRunning)
        ));
    }

    #[test]
    fn test_continuous_event_order() {
        let (mut controller, _) = running(&config(), RecognitionMode::Continuous);
        let mut all = turn_start(&mut controller);
        all.extend(say(&mut controller, "speech.startDetected", r#"{"Offset":1000}"#));
        all.extend(say(&mut controller, "speech.hypothesis", r#"{"Text":"hel","Offset":1000,"Duration":500}"#));
        all.extend(say(&mut controller, "speech.hypothesis", r#"{"Text":"hello","Offset":1000,"Duration":900}"#));
        all.extend(say(&mut controller, "speech.endDetected", r#"{"Offset":2000}"#));
        all.extend(say(&mut controller, "speech.hypothesis", r#"{"Text":"late","Offset":1000,"Duration":950}"#));
        all.extend(say(
            &mut controller,
            "speech.phrase",
            r#"{"RecognitionStatus":"Success","DisplayText":"Hello.","Offset":1000,"Duration":1000}"#,
        ));

        assert_eq!(
            names(&all),
            vec![
                "SessionStarted",
                "SpeechStartDetected",
                "Recognizing",
                "Recognizing",
                "SpeechEndDetected",
                "Recognized",
            ]
        );
        assert!(all.contains(&Action::ReleaseThrottle));

        // the next phrase does not repeat SessionStarted
        let next = say(&mut controller, "speech.hypothesis", r#"{"Text":"again","Offset":3000,"Duration":10}"#);
        assert_eq!(names(&next), vec!["SpeechStartDetected", "Recognizing"]);
    }

    #[test]
    fn test_frames_for_other_requests_are_dropped() {
        let (mut controller, _) = running(&config(), RecognitionMode::Continuous);
        turn_start(&mut controller);
        let actions = controller.on_message(&service(
            "speech.hypothesis",
            "SOMEONEELSE",
            r#"{"Text":"x","Offset":0}"#,
        ));
        assert!(actions.is_empty());
    }

    #[test]
    fn test_malformed_frame_fatal_only_during_handshake() {
        let (mut controller, _) = running(&config(), RecognitionMode::Continuous);
        let actions = controller.on_message(&RawMessage::Binary(vec![0x00, 0x40, 1, 2]));
        assert!(matches!(actions[0], Action::CloseConnection { code: 1002, .. }));
        match &events(&actions)[..] {
            [RecognitionEvent::Canceled(details)] => {
                assert_eq!(details.error_code, CancellationErrorCode::ConnectionFailure);
                assert!(details.details.contains("handshake"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(controller.state(), TurnState::Idle);

        let (mut controller, _) = running(&config(), RecognitionMode::Continuous);
        turn_start(&mut controller);
        let actions = controller.on_message(&RawMessage::Text("garbage".into()));
        assert!(actions.is_empty());
        assert_eq!(controller.state(), TurnState::Active);
    }

    #[test]
    fn test_primary_language_removal_resets_turn_with_voice() {
        let config = config().with_target_languages(["de", "fr"]).with_voice("de-DE-Voice");
        let (mut controller, _) = running(&config, RecognitionMode::Continuous);
        turn_start(&mut controller);
        let old_request = controller.request_id().to_string();

        let actions = controller.remove_target_language("de");
        let frames = sent(&actions);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_path("audio") && frames[0].body().is_empty());
        assert!(actions.contains(&Action::Schedule {
            kind: TimerKind::TurnReset,
            delay: config.stop_grace
        }));
        // audio stays queued until the new turn starts
        assert!(controller.holds_audio());

        let actions = say(&mut controller, "turn.end", "");
        assert_ne!(controller.request_id(), old_request);
        assert!(!controller.holds_audio());
        assert!(actions.contains(&Action::CancelTimer(TimerKind::TurnReset)));
        let frames = sent(&actions);
        let context = frames.iter().find(|f| f.is_path("speech.context")).unwrap();
        let body: serde_json::Value = context.body_json().unwrap();
        assert_eq!(body["translationcontext"]["to"], json!(["fr"]));
        assert!(frames.iter().any(|f| f.is_path("telemetry")));
        assert_eq!(frames.last().unwrap().body().len(), crate::audio::WAV_HEADER_LEN);
        assert!(!frames.iter().any(|f| f.is_path("speech.config")));
        assert!(events(&actions).is_empty());
    }

    #[test]
    fn test_reset_turn_continues_session_offsets() {
        let config = config().with_target_languages(["de", "fr"]).with_voice("de-DE-Voice");
        let (mut controller, _) = running(&config, RecognitionMode::Continuous);
        turn_start(&mut controller);
        // two seconds of audio in the first turn
        controller.on_audio(AudioData::Chunk(vec![0; 64_000]));
        let first = say(
            &mut controller,
            "speech.phrase",
            r#"{"RecognitionStatus":"Success","DisplayText":"Eins.","Offset":10000000,"Duration":5000000}"#,
        );
        assert!(matches!(&events(&first)[..], [.., RecognitionEvent::Recognized(r)] if r.offset == 10_000_000));

        controller.remove_target_language("de");
        say(&mut controller, "turn.end", "");
        turn_start(&mut controller);

        // the new turn counts from its own header
        let second = say(
            &mut controller,
            "speech.phrase",
            r#"{"RecognitionStatus":"Success","DisplayText":"Zwei.","Offset":1000000,"Duration":5000000}"#,
        );
        match &events(&second)[..] {
            [RecognitionEvent::SpeechStartDetected { offset }, _, RecognitionEvent::Recognized(result)] => {
                assert_eq!(*offset, 21_000_000);
                assert_eq!(result.offset, 21_000_000);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_service_turn_end_chains_turn_with_later_offsets() {
        let (mut controller, _) = running(&config(), RecognitionMode::Continuous);
        turn_start(&mut controller);
        controller.on_audio(AudioData::Chunk(vec![0; 32_000]));
        let old_request = controller.request_id().to_string();

        let actions = say(&mut controller, "turn.end", "");
        assert_ne!(controller.request_id(), old_request);
        assert!(sent(&actions).iter().any(|f| f.is_path("telemetry")));
        // the chunker keeps running across the turn boundary
        assert!(!actions.iter().any(|a| matches!(a, Action::StartAudio { .. })));
        assert!(events(&actions).is_empty());

        assert!(events(&turn_start(&mut controller)).is_empty());
        let actions = say(&mut controller, "speech.startDetected", r#"{"Offset":500}"#);
        assert_eq!(
            events(&actions),
            vec![RecognitionEvent::SpeechStartDetected { offset: 10_000_500 }]
        );
    }

    #[test]
    fn test_reset_window_times_out_without_turn_end() {
        let config = config().with_target_languages(["de", "fr"]).with_voice("de-DE-Voice");
        let (mut controller, _) = running(&config, RecognitionMode::Continuous);
        turn_start(&mut controller);
        controller.remove_target_language("de");

        let actions = controller.on_timer(TimerKind::TurnReset);
        match &events(&actions)[..] {
            [RecognitionEvent::Canceled(details), RecognitionEvent::SessionStopped { .. }] => {
                assert_eq!(details.error_code, CancellationErrorCode::ServiceTimeout);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(actions.contains(&Action::PauseAudio));
        assert!(!controller.holds_audio());
        assert_eq!(controller.state(), TurnState::Idle);

        // a late firing after the reset completed is ignored
        let (mut controller, _) = running(&config, RecognitionMode::Continuous);
        turn_start(&mut controller);
        controller.remove_target_language("de");
        say(&mut controller, "turn.end", "");
        assert!(controller.on_timer(TimerKind::TurnReset).is_empty());
    }

    #[test]
    fn test_telemetry_of_canceled_turn_sent_on_next_connection() {
        let (mut controller, _) = running(&config(), RecognitionMode::Continuous);
        turn_start(&mut controller);
        let canceled_request = controller.request_id().to_string();
        say(&mut controller, "speech.hypothesis", r#"{"Text":"hel","Offset":0,"Duration":10}"#);

        let actions = controller.on_disconnected(1000, "closed", true);
        assert!(!sent(&actions).iter().any(|f| f.is_path("telemetry")));

        controller.start(RecognitionMode::Continuous).unwrap();
        let actions = controller.on_connected();
        let telemetry: Vec<&Frame> = sent(&actions)
            .into_iter()
            .filter(|f| f.is_path("telemetry"))
            .collect();
        assert_eq!(telemetry.len(), 1);
        assert_eq!(telemetry[0].request_id(), canceled_request);
        let body: serde_json::Value = telemetry[0].body_json().unwrap();
        assert_eq!(body["hypothesisCount"], 1);

        // sent once only
        controller.on_disconnected(1000, "closed", true);
        controller.start(RecognitionMode::Continuous).unwrap();
        let again = controller.on_connected();
        assert!(!sent(&again)
            .iter()
            .any(|f| f.is_path("telemetry") && f.request_id() == canceled_request));
    }

    #[test]
    fn test_non_primary_removal_does_not_reset() {
        let config = config().with_target_languages(["de", "fr"]).with_voice("de-DE-Voice");
        let (mut controller, _) = running(&config, RecognitionMode::Continuous);
        turn_start(&mut controller);
        assert!(controller.remove_target_language("fr").is_empty());

        let mut config = config;
        config.voice = None;
        let mut controller = TurnController::new(&config);
        controller.start(RecognitionMode::Continuous).unwrap();
        controller.on_connected();
        assert!(controller.remove_target_language("de").is_empty());
        assert_eq!(controller.context().target_languages(), &["fr"]);
    }

    #[test]
    fn test_phrase_mutation_resends_context() {
        let (mut controller, _) = running(&config(), RecognitionMode::Continuous);
        let actions = controller.add_phrase("Contoso");
        let frames = sent(&actions);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].body_text().unwrap().contains("Contoso"));
        assert!(controller.add_phrase("Contoso").is_empty());
        assert_eq!(sent(&controller.set_context_property("k", "v")).len(), 1);
    }

    #[test]
    fn test_caller_close_cancels_without_retry() {
        let (mut controller, _) = running(&config(), RecognitionMode::Continuous);
        turn_start(&mut controller);
        say(&mut controller, "speech.startDetected", r#"{"Offset":0}"#);

        let actions = controller.on_disconnected(1000, "closed", true);
        assert!(!actions.contains(&Action::OpenConnection));
        let events = events(&actions);
        assert_eq!(events[0].name(), "SpeechEndDetected");
        match &events[1] {
            RecognitionEvent::Canceled(details) => {
                assert_eq!(details.reason, CancellationReason::Error);
                assert!(details.details.contains("Disconnect"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(events[2].name(), "SessionStopped");
        assert_eq!(controller.state(), TurnState::Idle);
    }

    #[test]
    fn test_service_close_reconnects_with_offset_base() {
        let (mut controller, _) = running(&config(), RecognitionMode::Continuous);
        turn_start(&mut controller);
        // one second of audio on the first connection
        controller.on_audio(AudioData::Chunk(vec![0; 32_000]));

        let actions = controller.on_disconnected(1006, "max duration", false);
        assert!(actions.contains(&Action::PauseAudio));
        assert!(actions.contains(&Action::OpenConnection));
        assert!(events(&actions).is_empty());
        assert_eq!(controller.state(), TurnState::Connecting);

        let actions = controller.on_connected();
        assert!(sent(&actions).iter().any(|f| f.is_path("speech.config")));
        assert!(events(&turn_start(&mut controller)).is_empty());

        let actions = say(&mut controller, "speech.startDetected", r#"{"Offset":500}"#);
        assert_eq!(
            events(&actions)[0],
            RecognitionEvent::SpeechStartDetected { offset: 10_000_500 }
        );
    }

    #[test]
    fn test_reconnect_gives_up_after_policy() {
        let mut config = config();
        config.reconnect = ReconnectPolicy {
            max_attempts: 2,
            backoff: Duration::from_millis(100),
        };
        let (mut controller, _) = running(&config, RecognitionMode::Continuous);
        turn_start(&mut controller);

        assert!(controller.on_disconnected(1006, "", false).contains(&Action::OpenConnection));
        let actions = controller.on_open_failed(Some(503), "unavailable");
        assert!(actions.contains(&Action::Schedule {
            kind: TimerKind::Reconnect,
            delay: Duration::from_millis(100)
        }));
        assert_eq!(controller.on_timer(TimerKind::Reconnect), vec![Action::OpenConnection]);

        let actions = controller.on_open_failed(Some(503), "unavailable");
        match &events(&actions)[..] {
            [RecognitionEvent::Canceled(details), RecognitionEvent::SessionStopped { .. }] => {
                assert_eq!(details.error_code, CancellationErrorCode::ConnectionFailure);
                assert!(details.details.contains("503"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_initial_connection_failure() {
        let mut controller = TurnController::new(&config());
        controller.start(RecognitionMode::SingleShot).unwrap();
        let actions = controller.on_open_failed(Some(401000), "Unauthorized");
        match &events(&actions)[..] {
            [RecognitionEvent::Canceled(details)] => {
                assert_eq!(details.error_code, CancellationErrorCode::ConnectionFailure);
                assert!(details.details.contains("401000"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(controller.state(), TurnState::Idle);
    }

    #[test]
    fn test_single_shot_ends_after_first_result() {
        let (mut controller, _) = running(&config(), RecognitionMode::SingleShot);
        turn_start(&mut controller);
        let actions = say(
            &mut controller,
            "speech.phrase",
            r#"{"RecognitionStatus":"Success","DisplayText":"Hi.","Offset":100,"Duration":200}"#,
        );
        assert_eq!(
            names(&actions),
            vec!["SpeechStartDetected", "SpeechEndDetected", "Recognized"]
        );
        assert!(actions.contains(&Action::PauseAudio));
        assert!(sent(&actions).iter().any(|f| f.is_path("audio") && f.body().is_empty()));

        let more = say(
            &mut controller,
            "speech.phrase",
            r#"{"RecognitionStatus":"Success","DisplayText":"Again.","Offset":400,"Duration":200}"#,
        );
        assert!(events(&more).is_empty());
        let late = say(&mut controller, "speech.startDetected", r#"{"Offset":900}"#);
        assert!(events(&late).is_empty());

        let actions = say(&mut controller, "turn.end", "");
        assert_eq!(names(&actions), vec!["SessionStopped"]);
        assert_eq!(controller.state(), TurnState::Idle);
    }

    #[test]
    fn test_failure_status_cancels() {
        let (mut controller, _) = running(&config(), RecognitionMode::Continuous);
        turn_start(&mut controller);
        let actions = say(&mut controller, "speech.phrase", r#"{"RecognitionStatus":"TooManyRequests"}"#);
        match &events(&actions)[..] {
            [RecognitionEvent::Canceled(details), RecognitionEvent::SessionStopped { .. }] => {
                assert_eq!(details.error_code, CancellationErrorCode::TooManyRequests);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_end_of_audio_in_continuous_mode() {
        let (mut controller, _) = running(&config(), RecognitionMode::Continuous);
        turn_start(&mut controller);
        let actions = controller.on_audio(AudioData::EndOfAudio);
        assert!(sent(&actions)[0].body().is_empty());

        let actions = say(&mut controller, "turn.end", "");
        match &events(&actions)[..] {
            [RecognitionEvent::Canceled(details), RecognitionEvent::SessionStopped { .. }] => {
                assert_eq!(details.reason, CancellationReason::EndOfStream);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_stop_waits_for_turn_end_then_detaches() {
        let (mut controller, _) = running(&config(), RecognitionMode::Continuous);
        turn_start(&mut controller);

        let actions = controller.stop();
        assert!(actions.contains(&Action::StopAudio));
        assert!(controller.stop().is_empty());

        let actions = controller.on_audio(AudioData::Stopped);
        assert!(sent(&actions)[0].body().is_empty());

        let actions = say(&mut controller, "turn.end", "");
        assert_eq!(names(&actions), vec!["SessionStopped"]);
        assert_eq!(actions.last(), Some(&Action::StopCompleted));
        assert!(actions.contains(&Action::CancelTimer(TimerKind::StopGrace)));

        let late = controller.on_message(&service(
            "speech.phrase",
            "ANY",
            r#"{"RecognitionStatus":"Success","DisplayText":"late"}"#,
        ));
        assert!(late.is_empty());
        assert_eq!(controller.stop(), vec![Action::StopCompleted]);
    }

    #[test]
    fn test_stop_grace_timer_finishes_stop() {
        let (mut controller, _) = running(&config(), RecognitionMode::Continuous);
        turn_start(&mut controller);
        controller.stop();
        let actions = controller.on_timer(TimerKind::StopGrace);
        assert_eq!(actions.last(), Some(&Action::StopCompleted));
        assert_eq!(controller.state(), TurnState::Idle);
    }
}
