use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use speech_protocol::RawMessage;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::{
    TransportError, TransportEvent, TransportFactory, TransportSink, TransportStream,
    ABNORMAL_CLOSE,
};
use crate::config::ConnectionSnapshot;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connects to the service over WebSocket (TLS via native-tls)
#[derive(Debug, Clone, Default)]
pub struct WebSocketTransportFactory;

impl WebSocketTransportFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TransportFactory for WebSocketTransportFactory {
    async fn connect(
        &self,
        snapshot: &ConnectionSnapshot,
    ) -> Result<(Box<dyn TransportSink>, Box<dyn TransportStream>), TransportError> {
        let mut request = snapshot.uri.as_str().into_client_request()?;
        for (name, value) in &snapshot.headers {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| TransportError::InvalidHeader(name.clone()))?;
            let header_value = HeaderValue::from_str(value)
                .map_err(|_| TransportError::InvalidHeader(name.clone()))?;
            request.headers_mut().insert(header_name, header_value);
        }

        let (ws_stream, response) = connect_async(request).await?;
        log::info!(
            "✅ WebSocket connected ({}), status: {}",
            snapshot.connection_id,
            response.status()
        );

        let (write, read) = ws_stream.split();
        Ok((
            Box::new(WebSocketSink { write }),
            Box::new(WebSocketReader { read }),
        ))
    }
}

struct WebSocketSink {
    write: SplitSink<WsStream, Message>,
}

#[async_trait]
impl TransportSink for WebSocketSink {
    async fn send(&mut self, message: RawMessage) -> Result<(), TransportError> {
        let message = match message {
            RawMessage::Text(text) => Message::Text(text.into()),
            RawMessage::Binary(data) => Message::Binary(data.into()),
        };
        self.write.send(message).await?;
        Ok(())
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError> {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        };
        self.write.send(Message::Close(Some(frame))).await?;
        self.write.close().await?;
        log::info!("🔚 WebSocket closed cleanly");
        Ok(())
    }
}

struct WebSocketReader {
    read: SplitStream<WsStream>,
}

#[async_trait]
impl TransportStream for WebSocketReader {
    async fn recv(&mut self) -> TransportEvent {
        loop {
            match self.read.next().await {
                Some(Ok(Message::Text(text))) => {
                    return TransportEvent::Message(RawMessage::Text(text.to_string()));
                }
                Some(Ok(Message::Binary(data))) => {
                    return TransportEvent::Message(RawMessage::Binary(data.as_slice().to_vec()));
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = match frame {
                        Some(frame) => (u16::from(frame.code), frame.reason.to_string()),
                        None => (1005, String::new()),
                    };
                    return TransportEvent::Closed { code, reason };
                }
                Some(Ok(_)) => {
                    // ping/pong are answered by tungstenite
                    continue;
                }
                Some(Err(e)) => {
                    log::warn!("❌ WebSocket read error: {}", e);
                    return TransportEvent::Closed {
                        code: ABNORMAL_CLOSE,
                        reason: e.to_string(),
                    };
                }
                None => {
                    return TransportEvent::Closed {
                        code: ABNORMAL_CLOSE,
                        reason: "stream ended".to_string(),
                    };
                }
            }
        }
    }
}
