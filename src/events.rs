use std::collections::BTreeMap;
use strum::Display;

use crate::error::CancellationDetails;

/// Kind of result carried by `Recognizing` / `Recognized`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ResultReason {
    RecognizingSpeech,
    RecognizedSpeech,
    TranslatingSpeech,
    TranslatedSpeech,
    NoMatch,
}

/// A partial or final recognition result
#[derive(Debug, Clone, PartialEq)]
pub struct RecognitionResult {
    pub result_id: String,
    pub reason: ResultReason,
    pub text: String,
    /// 100ns ticks from the start of the session's audio
    pub offset: u64,
    pub duration: u64,
    pub language: Option<String>,
    /// Target language to translated text
    pub translations: BTreeMap<String, String>,
    /// Raw JSON body the result was built from
    pub json: String,
}

/// Recognition lifecycle events for one session
#[derive(Debug, Clone, PartialEq)]
pub enum RecognitionEvent {
    SessionStarted { session_id: String },
    SpeechStartDetected { offset: u64 },
    Recognizing(RecognitionResult),
    Recognized(RecognitionResult),
    SpeechEndDetected { offset: u64 },
    SessionStopped { session_id: String },
    Canceled(CancellationDetails),
}

impl RecognitionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SessionStarted { .. } => "SessionStarted",
            Self::SpeechStartDetected { .. } => "SpeechStartDetected",
            Self::Recognizing(_) => "Recognizing",
            Self::Recognized(_) => "Recognized",
            Self::SpeechEndDetected { .. } => "SpeechEndDetected",
            Self::SessionStopped { .. } => "SessionStopped",
            Self::Canceled(_) => "Canceled",
        }
    }

    /// Fields worth logging for this event type
    pub fn log_fields(&self) -> Vec<(&'static str, String)> {
        match self {
            Self::SessionStarted { session_id } | Self::SessionStopped { session_id } => {
                vec![("session_id", session_id.clone())]
            }
            Self::SpeechStartDetected { offset } | Self::SpeechEndDetected { offset } => {
                vec![("offset", offset.to_string())]
            }
            Self::Recognizing(result) | Self::Recognized(result) => {
                let mut fields = vec![
                    ("result_id", result.result_id.clone()),
                    ("reason", result.reason.to_string()),
                    ("text", result.text.clone()),
                    ("offset", result.offset.to_string()),
                    ("duration", result.duration.to_string()),
                ];
                if !result.translations.is_empty() {
                    let languages: Vec<&str> =
                        result.translations.keys().map(String::as_str).collect();
                    fields.push(("translations", languages.join(",")));
                }
                fields
            }
            Self::Canceled(details) => vec![
                ("reason", details.reason.to_string()),
                ("error_code", details.error_code.to_string()),
                ("details", details.details.clone()),
            ],
        }
    }

    pub fn log(&self) {
        let fields: Vec<String> = self
            .log_fields()
            .into_iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        log::debug!("🎙️ {} {}", self.name(), fields.join(" "));
    }
}

/// Everything a session reports to its owner
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connected {
        connection_id: String,
    },
    Disconnected {
        code: u16,
        reason: String,
    },
    /// Observability hook, raised for every frame written to the transport
    MessageSent {
        path: String,
        request_id: String,
        size: usize,
    },
    Recognition(RecognitionEvent),
}

impl From<RecognitionEvent> for SessionEvent {
    fn from(event: RecognitionEvent) -> Self {
        SessionEvent::Recognition(event)
    }
}
