//! WebSocket session endpoint.
//!
//! Each accepted connection runs one voice session. Binary frames carry PCM
//! audio in both directions; text frames from the server carry JSON notices.

use crate::AppState;
use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket},
        ConnectInfo, Extension, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parley_types::audio::strip_wav_header;
use parley_types::{AudioChunk, Direction};
use parley_voice::{
    run_session, AudioSink, AudioSource, AudioTransport, OutboundFrame, TransportError,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::OwnedSemaphorePermit;

/// Upgrades the connection to a voice session if a session slot is free.
///
/// Connections beyond `server.max_sessions` are refused with `409 Conflict`.
pub async fn ws_handler(
    Extension(state): Extension<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    let permit = match state.sessions.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            tracing::warn!(remote_addr = %addr, "session limit reached, refusing connection");
            return (StatusCode::CONFLICT, "session limit reached").into_response();
        }
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, addr, permit))
}

async fn handle_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    addr: SocketAddr,
    permit: OwnedSemaphorePermit,
) {
    tracing::info!(remote_addr = %addr, "voice client connected");
    let transport = WsTransport::new(socket, state.input_sample_rate, state.add_wav_header);
    let report = run_session(
        state.settings.clone(),
        state.collaborators.clone(),
        transport,
    )
    .await;
    tracing::info!(
        remote_addr = %addr,
        session_id = %report.id,
        final_state = %report.final_state,
        turns = report.completed_turns,
        "voice client disconnected"
    );
    drop(permit);
}

/// A voice session over an axum websocket.
pub struct WsTransport {
    socket: WebSocket,
    input_sample_rate: u32,
    add_wav_header: bool,
}

impl WsTransport {
    pub fn new(socket: WebSocket, input_sample_rate: u32, add_wav_header: bool) -> Self {
        Self {
            socket,
            input_sample_rate,
            add_wav_header,
        }
    }
}

impl AudioTransport for WsTransport {
    type Source = WsSource;
    type Sink = WsSink;

    fn split(self) -> (WsSource, WsSink) {
        let (sink, stream) = self.socket.split();
        (
            WsSource {
                stream,
                sample_rate: self.input_sample_rate,
                seq: 0,
            },
            WsSink {
                sink,
                add_wav_header: self.add_wav_header,
            },
        )
    }
}

pub struct WsSource {
    stream: SplitStream<WebSocket>,
    sample_rate: u32,
    seq: u64,
}

#[async_trait]
impl AudioSource for WsSource {
    async fn receive(&mut self) -> Option<Result<AudioChunk, TransportError>> {
        loop {
            let msg = match self.stream.next().await? {
                Ok(msg) => msg,
                Err(e) => return Some(Err(TransportError::Receive(e.to_string()))),
            };
            match msg {
                WsMessage::Binary(bytes) => {
                    let payload = strip_wav_header(&bytes);
                    if payload.is_empty() {
                        continue;
                    }
                    return Some(
                        match AudioChunk::from_le_bytes(
                            self.seq,
                            Direction::Inbound,
                            self.sample_rate,
                            payload,
                        ) {
                            Ok(chunk) => {
                                self.seq += 1;
                                Ok(chunk)
                            }
                            Err(e) => Err(TransportError::Frame(e.to_string())),
                        },
                    );
                }
                WsMessage::Text(text) => {
                    tracing::debug!(len = text.as_str().len(), "ignoring client text frame");
                }
                WsMessage::Close(_) => return None,
                WsMessage::Ping(_) | WsMessage::Pong(_) => {}
            }
        }
    }
}

pub struct WsSink {
    sink: SplitSink<WebSocket, WsMessage>,
    add_wav_header: bool,
}

#[async_trait]
impl AudioSink for WsSink {
    async fn send(&mut self, frame: OutboundFrame) -> Result<(), TransportError> {
        let msg = match frame {
            OutboundFrame::Audio(chunk) => {
                let bytes = if self.add_wav_header {
                    chunk.to_wav()
                } else {
                    chunk.to_le_bytes()
                };
                WsMessage::Binary(bytes.into())
            }
            OutboundFrame::Notice(notice) => {
                let json = serde_json::to_string(&notice)
                    .map_err(|e| TransportError::Send(format!("serialize notice: {}", e)))?;
                WsMessage::Text(json.into())
            }
        };
        self.sink
            .send(msg)
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.sink
            .close()
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }
}
