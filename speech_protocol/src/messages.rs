//! Typed bodies for the messages the service sends during a turn.
//!
//! Offsets and durations are expressed in 100-nanosecond ticks from the
//! beginning of the audio stream of the current connection.

use crate::protocol::{paths, Frame, ProtocolError};
use serde::{Deserialize, Serialize, Serializer};

/// Ticks per second for offsets and durations
pub const TICKS_PER_SECOND: u64 = 10_000_000;

/// Recognition outcome carried by final phrase messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionStatus {
    Success,
    NoMatch,
    InitialSilenceTimeout,
    BabbleTimeout,
    Error,
    EndOfDictation,
    TooManyRequests,
    BadRequest,
    Forbidden,
    ServiceUnavailable,
    Unknown(String),
}

impl RecognitionStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Success => "Success",
            Self::NoMatch => "NoMatch",
            Self::InitialSilenceTimeout => "InitialSilenceTimeout",
            Self::BabbleTimeout => "BabbleTimeout",
            Self::Error => "Error",
            Self::EndOfDictation => "EndOfDictation",
            Self::TooManyRequests => "TooManyRequests",
            Self::BadRequest => "BadRequest",
            Self::Forbidden => "Forbidden",
            Self::ServiceUnavailable => "ServiceUnavailable",
            Self::Unknown(s) => s.as_str(),
        }
    }

    /// Audio was processed but produced no text
    pub fn is_no_match(&self) -> bool {
        matches!(
            self,
            Self::NoMatch | Self::InitialSilenceTimeout | Self::BabbleTimeout
        )
    }

    /// The service reported a failure that ends the session
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::Error
                | Self::TooManyRequests
                | Self::BadRequest
                | Self::Forbidden
                | Self::ServiceUnavailable
        )
    }
}

impl std::str::FromStr for RecognitionStatus {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let status = match s {
            "Success" => Self::Success,
            "NoMatch" => Self::NoMatch,
            "InitialSilenceTimeout" => Self::InitialSilenceTimeout,
            "BabbleTimeout" => Self::BabbleTimeout,
            "Error" => Self::Error,
            "EndOfDictation" => Self::EndOfDictation,
            "TooManyRequests" => Self::TooManyRequests,
            "BadRequest" => Self::BadRequest,
            "Forbidden" => Self::Forbidden,
            "ServiceUnavailable" => Self::ServiceUnavailable,
            _ => Self::Unknown(s.to_string()),
        };
        Ok(status)
    }
}

impl<'de> Deserialize<'de> for RecognitionStatus {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(s.parse().unwrap_or_else(|never: std::convert::Infallible| match never {}))
    }
}

impl Serialize for RecognitionStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// `speech.startDetected` / `speech.endDetected`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SpeechBoundary {
    pub offset: u64,
}

/// `speech.hypothesis` / `speech.fragment`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SpeechHypothesis {
    pub text: String,
    pub offset: u64,
    #[serde(default)]
    pub duration: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

/// `speech.phrase`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SpeechPhrase {
    pub recognition_status: RecognitionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_text: Option<String>,
    #[serde(default)]
    pub offset: u64,
    #[serde(default)]
    pub duration: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

/// A single target-language rendition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Translation {
    pub language: String,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TranslationBlock {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub translation_status: Option<String>,
    #[serde(default)]
    pub translations: Vec<Translation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

/// `translation.hypothesis`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TranslationHypothesis {
    pub text: String,
    pub offset: u64,
    #[serde(default)]
    pub duration: u64,
    #[serde(default)]
    pub translation: TranslationBlock,
}

/// `translation.phrase`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TranslationPhrase {
    pub recognition_status: RecognitionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default)]
    pub offset: u64,
    #[serde(default)]
    pub duration: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub translation: Option<TranslationBlock>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnStartContext {
    #[serde(rename = "serviceTag", default, skip_serializing_if = "Option::is_none")]
    pub service_tag: Option<String>,
}

/// `turn.start`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnStart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<TurnStartContext>,
}

impl TurnStart {
    pub fn service_tag(&self) -> Option<&str> {
        self.context.as_ref()?.service_tag.as_deref()
    }
}

/// Messages the service sends to the client
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceMessage {
    TurnStart(TurnStart),
    SpeechStartDetected(SpeechBoundary),
    SpeechHypothesis(SpeechHypothesis),
    SpeechFragment(SpeechHypothesis),
    TranslationHypothesis(TranslationHypothesis),
    SpeechEndDetected(SpeechBoundary),
    SpeechPhrase(SpeechPhrase),
    TranslationPhrase(TranslationPhrase),
    SynthesisEnd,
    TurnEnd,
    Unknown(String),
}

impl ServiceMessage {
    /// Interpret a decoded frame by its path
    pub fn from_frame(frame: &Frame) -> Result<Self, ProtocolError> {
        let path = frame.path().to_ascii_lowercase();

        let message = match path.as_str() {
            paths::TURN_START => {
                if frame.body().iter().all(|b| b.is_ascii_whitespace()) {
                    ServiceMessage::TurnStart(TurnStart::default())
                } else {
                    ServiceMessage::TurnStart(frame.body_json()?)
                }
            }
            paths::SPEECH_START_DETECTED => ServiceMessage::SpeechStartDetected(frame.body_json()?),
            paths::SPEECH_HYPOTHESIS => ServiceMessage::SpeechHypothesis(frame.body_json()?),
            paths::SPEECH_FRAGMENT => ServiceMessage::SpeechFragment(frame.body_json()?),
            paths::TRANSLATION_HYPOTHESIS => {
                ServiceMessage::TranslationHypothesis(frame.body_json()?)
            }
            paths::SPEECH_END_DETECTED => ServiceMessage::SpeechEndDetected(frame.body_json()?),
            paths::SPEECH_PHRASE => ServiceMessage::SpeechPhrase(frame.body_json()?),
            paths::TRANSLATION_PHRASE => ServiceMessage::TranslationPhrase(frame.body_json()?),
            paths::TRANSLATION_SYNTHESIS_END => ServiceMessage::SynthesisEnd,
            paths::TURN_END => ServiceMessage::TurnEnd,
            _ => ServiceMessage::Unknown(frame.path().to_string()),
        };

        Ok(message)
    }
}
