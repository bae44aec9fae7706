//! WebSocket transport implementation.
//!
//! This module provides a client-side WebSocket connection using
//! tokio-tungstenite. JSON frames travel as text messages and MessagePack
//! frames as binary messages; either kind is accepted on receive.

use async_trait::async_trait;
use bytes::BytesMut;
use foundry_protocol::{codec, Encoding, Frame, ProtocolError};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};

use crate::traits::{Connection, ConnectionId, TransportError};

/// Default maximum inbound message size (1 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// WebSocket client configuration.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Server URL, e.g. `ws://127.0.0.1:3000/ws`.
    pub url: String,
    /// Wire encoding requested from the server.
    pub encoding: Encoding,
    /// Maximum message size in bytes.
    pub max_message_size: usize,
}

impl WebSocketConfig {
    /// Create a configuration for the given URL with JSON encoding.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            encoding: Encoding::Json,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    /// Set the wire encoding.
    #[must_use]
    pub fn with_encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// URL including the `format` query parameter.
    #[must_use]
    pub fn request_url(&self) -> String {
        let separator = if self.url.contains('?') { '&' } else { '?' };
        format!("{}{}format={}", self.url, separator, self.encoding)
    }
}

type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A WebSocket connection to a foundry server.
pub struct WebSocketConnection {
    id: ConnectionId,
    stream: ClientStream,
    url: String,
    encoding: Encoding,
    is_open: bool,
    read_buffer: BytesMut,
    max_message_size: usize,
}

impl WebSocketConnection {
    /// Connect to a server.
    ///
    /// # Errors
    ///
    /// Returns an error if the TCP connection or WebSocket handshake fails.
    pub async fn connect(config: &WebSocketConfig) -> Result<Self, TransportError> {
        let url = config.request_url();
        let (stream, _response) = connect_async(url.as_str()).await.map_err(|e| {
            error!(url = %url, "WebSocket handshake failed: {}", e);
            TransportError::ConnectFailed(e.to_string())
        })?;

        let id = ConnectionId::generate();
        info!(connection = %id, url = %url, encoding = %config.encoding, "WebSocket connected");

        Ok(Self {
            id,
            stream,
            url,
            encoding: config.encoding,
            is_open: true,
            read_buffer: BytesMut::with_capacity(4096),
            max_message_size: config.max_message_size,
        })
    }

    /// Encoding used for outbound frames.
    #[must_use]
    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Next complete frame in the read buffer. A buffer that can no longer
    /// be split into frames is discarded so later messages still decode.
    fn decode_buffered(&mut self) -> Result<Option<Frame>, TransportError> {
        match codec::decode_from(&mut self.read_buffer) {
            Ok(frame) => Ok(frame),
            Err(e @ ProtocolError::Invalid(_)) => Err(e.into()),
            Err(e) => {
                self.read_buffer.clear();
                Err(e.into())
            }
        }
    }

    fn check_size(&self, len: usize) -> Result<(), TransportError> {
        if len > self.max_message_size {
            warn!(
                "Message too large: {} bytes (max: {})",
                len, self.max_message_size
            );
            return Err(TransportError::Protocol(ProtocolError::FrameTooLarge(len)));
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for WebSocketConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        // Binary data left over from a previous message may hold whole frames.
        if let Some(frame) = self.decode_buffered()? {
            return Ok(Some(frame));
        }

        loop {
            match self.stream.next().await {
                Some(Ok(Message::Binary(data))) => {
                    self.check_size(data.len())?;
                    self.read_buffer.extend_from_slice(&data);

                    if let Some(frame) = self.decode_buffered()? {
                        return Ok(Some(frame));
                    }
                }
                Some(Ok(Message::Text(text))) => {
                    self.check_size(text.len())?;
                    return Ok(Some(codec::decode_json(&text)?));
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {
                    // Pongs are queued by tungstenite itself.
                }
                Some(Ok(Message::Close(_))) => {
                    debug!(connection = %self.id, "Received close frame");
                    self.is_open = false;
                    return Ok(None);
                }
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => {
                    debug!(connection = %self.id, "Connection closed");
                    self.is_open = false;
                    return Ok(None);
                }
                Some(Err(e)) => {
                    error!(connection = %self.id, "WebSocket error: {}", e);
                    self.is_open = false;
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
                None => {
                    debug!(connection = %self.id, "WebSocket stream ended");
                    self.is_open = false;
                    return Ok(None);
                }
            }
        }
    }

    async fn send(&mut self, frame: &Frame) -> Result<(), TransportError> {
        if !self.is_open {
            return Err(TransportError::ConnectionClosed);
        }

        let message = match self.encoding {
            Encoding::Json => Message::Text(codec::encode_json(frame)?),
            Encoding::Msgpack => Message::Binary(codec::encode(frame)?.to_vec()),
        };

        self.stream
            .send(message)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !std::mem::replace(&mut self.is_open, false) {
            return Ok(()); // Already closed
        }

        self.stream
            .close(None)
            .await
            .map_err(|e| TransportError::SendFailed(format!("Failed to close: {}", e)))
    }

    fn remote_addr(&self) -> Option<String> {
        Some(self.url.clone())
    }

    fn is_open(&self) -> bool {
        self.is_open
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foundry_protocol::{Machine, MachinePatch, MachineStatus};
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    #[test]
    fn test_request_url() {
        let config = WebSocketConfig::new("ws://127.0.0.1:3000/ws");
        assert_eq!(config.request_url(), "ws://127.0.0.1:3000/ws?format=json");

        let config = WebSocketConfig::new("ws://host/ws?token=abc").with_encoding(Encoding::Msgpack);
        assert_eq!(config.request_url(), "ws://host/ws?token=abc&format=msgpack");
    }

    #[tokio::test]
    async fn test_exchange_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();

            let list = Frame::machines_list(vec![Machine::new("M1", "Press", "Press")]);
            ws.send(Message::Text(codec::encode_json(&list).unwrap()))
                .await
                .unwrap();

            // Two binary frames in one message.
            let mut buf = BytesMut::new();
            codec::encode_into(&Frame::request_machines(), &mut buf).unwrap();
            codec::encode_into(&Frame::error(1001, "bad"), &mut buf).unwrap();
            ws.send(Message::Binary(buf.to_vec())).await.unwrap();

            match ws.next().await {
                Some(Ok(Message::Text(text))) => codec::decode_json(&text).unwrap(),
                other => panic!("Expected text message, got {:?}", other),
            }
        });

        let config = WebSocketConfig::new(format!("ws://{}/ws", addr));
        let mut conn = WebSocketConnection::connect(&config).await.unwrap();
        assert!(conn.is_open());

        assert!(matches!(conn.recv().await.unwrap(), Some(Frame::MachinesList(_))));
        assert_eq!(conn.recv().await.unwrap(), Some(Frame::RequestMachines));
        assert!(matches!(conn.recv().await.unwrap(), Some(Frame::Error(_))));

        let patch = MachinePatch::new("M1").with_status(MachineStatus::Online);
        conn.send(&Frame::simulator_update(patch.clone()))
            .await
            .unwrap();

        assert_eq!(server.await.unwrap(), Frame::simulator_update(patch));
    }
}
