use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::config::RemoteConfig;
use crate::error::TransportError;
use crate::protocol::events::{ClientMessage, ServerMessage};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Something received off the wire: a parsed control/event message or
/// a binary audio payload tagged with its one-byte handler prefix.
#[derive(Debug)]
pub enum Incoming {
    Message(ServerMessage),
    Binary { handler_id: u8, payload: Bytes },
}

/// One live connection to the remote host. Replaced wholesale on
/// reconnect; after a failure the old value is dropped, never reused.
pub struct Connection {
    ws: WsStream,
}

impl Connection {
    /// Opens the WebSocket and completes the bearer-token handshake,
    /// all within `timeout`.
    pub async fn connect(config: &RemoteConfig, timeout: Duration) -> Result<Self, TransportError> {
        let scheme = if config.tls { "wss" } else { "ws" };
        let url = format!(
            "{}://{}:{}{}/websocket",
            scheme, config.host, config.port, config.api_path
        );
        info!("Connecting to {}", url);

        let connection = tokio::time::timeout(timeout, async {
            let (ws, _response) = connect_async(url.as_str())
                .await
                .map_err(|e| TransportError::Connect(format!("{}: {}", url, e)))?;
            let mut connection = Self { ws };
            connection.authenticate(&config.token).await?;
            Ok::<_, TransportError>(connection)
        })
        .await
        .map_err(|_| TransportError::ConnectTimeout(timeout))??;

        Ok(connection)
    }

    /// Re-authentication happens from scratch on every connect.
    async fn authenticate(&mut self, token: &str) -> Result<(), TransportError> {
        match self.recv_message().await? {
            ServerMessage::AuthRequired { ha_version } => {
                debug!("Auth required (server version {:?})", ha_version);
            }
            other => {
                return Err(TransportError::Malformed(format!(
                    "expected auth_required, got {:?}",
                    other
                )));
            }
        }

        self.send(&ClientMessage::Auth {
            access_token: token.to_string(),
        })
        .await?;

        match self.recv_message().await? {
            ServerMessage::AuthOk { ha_version } => {
                info!("Authenticated (server version {:?})", ha_version);
                Ok(())
            }
            ServerMessage::AuthInvalid { message } => Err(TransportError::AuthRejected(
                message.unwrap_or_else(|| "no reason given".to_string()),
            )),
            other => Err(TransportError::Malformed(format!(
                "expected auth result, got {:?}",
                other
            ))),
        }
    }

    /// Resolves a pipeline name to its id. An unknown name logs a
    /// warning and falls back to the server's preferred pipeline.
    pub async fn resolve_pipeline(
        &mut self,
        name: &str,
        message_id: u64,
    ) -> Result<Option<String>, TransportError> {
        self.send(&ClientMessage::PipelineList { id: message_id })
            .await?;

        loop {
            match self.recv_message().await? {
                ServerMessage::Result {
                    id,
                    success,
                    result,
                    ..
                } if id == message_id => {
                    if !success {
                        warn!("Pipeline list request failed, using preferred pipeline");
                        return Ok(None);
                    }
                    let pipelines = result
                        .as_ref()
                        .and_then(|r| r.get("pipelines"))
                        .and_then(|p| p.as_array())
                        .cloned()
                        .unwrap_or_default();

                    for pipeline in &pipelines {
                        if pipeline.get("name").and_then(|n| n.as_str()) == Some(name) {
                            let id = pipeline
                                .get("id")
                                .and_then(|i| i.as_str())
                                .map(|s| s.to_string());
                            debug!("Resolved pipeline {:?} to {:?}", name, id);
                            return Ok(id);
                        }
                    }

                    warn!("No pipeline named {:?}, using preferred pipeline", name);
                    return Ok(None);
                }
                other => {
                    debug!("Ignoring message while resolving pipeline: {:?}", other);
                }
            }
        }
    }

    pub async fn send(&mut self, message: &ClientMessage) -> Result<(), TransportError> {
        let json = serde_json::to_string(message)
            .map_err(|e| TransportError::Malformed(e.to_string()))?;
        self.ws.send(Message::Text(json)).await?;
        Ok(())
    }

    async fn recv_message(&mut self) -> Result<ServerMessage, TransportError> {
        loop {
            match self.recv().await? {
                Incoming::Message(message) => return Ok(message),
                Incoming::Binary { handler_id, .. } => {
                    warn!("Unexpected binary payload (handler {})", handler_id);
                }
            }
        }
    }

    pub async fn recv(&mut self) -> Result<Incoming, TransportError> {
        loop {
            let message = self.ws.next().await.ok_or(TransportError::Closed)??;
            if let Some(incoming) = decode_message(message)? {
                return Ok(incoming);
            }
        }
    }

    /// Splits into independent send/receive halves so neither
    /// direction ever blocks on the other.
    pub fn split(self) -> (ConnectionWriter, ConnectionReader) {
        let (sink, stream) = self.ws.split();
        (ConnectionWriter { sink }, ConnectionReader { stream })
    }
}

pub struct ConnectionWriter {
    sink: SplitSink<WsStream, Message>,
}

impl ConnectionWriter {
    pub async fn send(&mut self, message: &ClientMessage) -> Result<(), TransportError> {
        let json = serde_json::to_string(message)
            .map_err(|e| TransportError::Malformed(e.to_string()))?;
        self.sink.send(Message::Text(json)).await?;
        Ok(())
    }

    /// Streams one audio frame as a binary message carrying the
    /// single-byte handler prefix.
    pub async fn send_audio(
        &mut self,
        handler_id: u8,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let mut message = Vec::with_capacity(payload.len() + 1);
        message.push(handler_id);
        message.extend_from_slice(payload);
        self.sink.send(Message::Binary(message)).await?;
        Ok(())
    }
}

pub struct ConnectionReader {
    stream: SplitStream<WsStream>,
}

impl ConnectionReader {
    pub async fn recv(&mut self) -> Result<Incoming, TransportError> {
        loop {
            let message = self.stream.next().await.ok_or(TransportError::Closed)??;
            if let Some(incoming) = decode_message(message)? {
                return Ok(incoming);
            }
        }
    }
}

fn decode_message(message: Message) -> Result<Option<Incoming>, TransportError> {
    match message {
        Message::Text(text) => {
            let parsed: ServerMessage = serde_json::from_str(&text)
                .map_err(|e| TransportError::Malformed(format!("{} in {:?}", e, text)))?;
            Ok(Some(Incoming::Message(parsed)))
        }
        Message::Binary(payload) => {
            if payload.is_empty() {
                return Err(TransportError::Malformed(
                    "empty binary message".to_string(),
                ));
            }
            let handler_id = payload[0];
            Ok(Some(Incoming::Binary {
                handler_id,
                payload: Bytes::copy_from_slice(&payload[1..]),
            }))
        }
        Message::Close(_) => Err(TransportError::Closed),
        // Ping/pong are handled by the websocket layer.
        _ => Ok(None),
    }
}
