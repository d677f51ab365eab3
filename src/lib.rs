//! Streaming speech recognition and translation client.
//!
//! A [`SpeechSession`] drives one recognition session over a duplex
//! connection: audio goes up in fixed-duration chunks, hypotheses and final
//! results come back as [`SessionEvent`]s.

pub mod audio;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod session;
pub mod telemetry;
pub mod timer;
pub mod transport;
pub mod turn;

pub use audio::{AudioFormat, AudioSource, PushAudioStream, PushAudioWriter, SilenceSource, WavFileSource};
pub use config::{OutputFormat, PropertyChannel, ReconnectPolicy, SpeechConfig};
pub use error::{CancellationDetails, CancellationErrorCode, CancellationReason, Result, SessionError};
pub use events::{RecognitionEvent, RecognitionResult, ResultReason, SessionEvent};
pub use session::{SessionHandle, SessionStats, SpeechSession};
pub use turn::{RecognitionMode, TurnState};
