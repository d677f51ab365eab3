pub mod connection;
pub mod websocket;

pub use connection::{ConnectionEvent, ConnectionState, TransportConnection};
pub use websocket::WebSocketTransportFactory;

use async_trait::async_trait;
use speech_protocol::{ProtocolError, RawMessage};
use thiserror::Error;
use tokio_tungstenite::tungstenite;

use crate::config::ConnectionSnapshot;

/// Close code used when the stream ends without a close frame
pub const ABNORMAL_CLOSE: u16 = 1006;
pub const NORMAL_CLOSE: u16 = 1000;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("Connection rejected with status {code}: {reason}")]
    Rejected { code: u32, reason: String },
    #[error("Invalid header {0}")]
    InvalidHeader(String),
    #[error("Not connected")]
    NotConnected,
    #[error("Frame encoding failed: {0}")]
    Protocol(#[from] ProtocolError),
}

impl TransportError {
    /// Opaque status code reported by the remote side, if there is one
    pub fn status_code(&self) -> Option<u32> {
        match self {
            TransportError::Rejected { code, .. } => Some(*code),
            TransportError::WebSocket(tungstenite::Error::Http(response)) => {
                Some(response.status().as_u16() as u32)
            }
            TransportError::WebSocket(tungstenite::Error::ConnectionClosed)
            | TransportError::WebSocket(tungstenite::Error::AlreadyClosed) => {
                Some(ABNORMAL_CLOSE as u32)
            }
            _ => None,
        }
    }
}

/// What the receiving half of a connection yields
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Message(RawMessage),
    /// Terminal; the stream yields nothing after this
    Closed { code: u16, reason: String },
}

/// Opens connections for a session.
///
/// Injected when the session is built so tests can run against an
/// in-memory service.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(
        &self,
        snapshot: &ConnectionSnapshot,
    ) -> Result<(Box<dyn TransportSink>, Box<dyn TransportStream>), TransportError>;
}

#[async_trait]
pub trait TransportSink: Send {
    async fn send(&mut self, message: RawMessage) -> Result<(), TransportError>;

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError>;
}

#[async_trait]
pub trait TransportStream: Send {
    async fn recv(&mut self) -> TransportEvent;
}
