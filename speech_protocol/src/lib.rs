//! # Speech Protocol
//!
//! Frame codec and message types for the duplex speech service protocol.
//!
//! This crate provides:
//! - Low-level frame definitions (headers, text and binary wire formats)
//! - Typed bodies for the messages the service sends back during a turn
//!
//! ## Example Usage
//!
//! ```rust
//! use speech_protocol::{Frame, RawMessage};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Build an audio frame for a turn
//! let frame = Frame::binary("audio", "0A1B2C", vec![0u8; 320])
//!     .with_header("Content-Type", "audio/x-wav");
//!
//! // Serialize it for the transport and read it back
//! let raw = frame.encode()?;
//! assert!(matches!(raw, RawMessage::Binary(_)));
//! assert_eq!(Frame::decode(&raw)?, frame);
//! # Ok(())
//! # }
//! ```

pub mod messages;
pub mod protocol;

// Re-export commonly used types
pub use messages::{RecognitionStatus, ServiceMessage};
pub use protocol::{paths, Frame, FrameKind, Headers, ProtocolError, RawMessage};
