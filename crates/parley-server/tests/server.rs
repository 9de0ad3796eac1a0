use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use futures_util::{SinkExt, StreamExt};
use parley_server::config::Config;
use parley_server::{app, AppState};
use parley_types::audio::{encode_s16le, wav_header};
use parley_types::{AudioChunk, Message};
use parley_voice::{
    AudioStream, Collaborators, ResponseGenerator, SpeechSynthesizer, SpeechToText, TextStream,
    TranscriptEvent, TranscriptStream, VoiceError,
};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tower::ServiceExt;

const RATE: u32 = 16_000;
const FRAME: usize = 320;
const USER_TEXT: &str = "I want to be a backend engineer";
const REPLY: &str = "Great choice. Tell me about a service you built.";
const WAIT: Duration = Duration::from_secs(5);

type Ws = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Reports one fixed transcript when each utterance ends.
struct FixedStt;

#[async_trait]
impl SpeechToText for FixedStt {
    async fn transcribe(
        &self,
        mut audio: mpsc::Receiver<AudioChunk>,
    ) -> Result<TranscriptStream, VoiceError> {
        Ok(futures_util::stream::once(async move {
            while audio.recv().await.is_some() {}
            Ok(TranscriptEvent::Final(USER_TEXT.to_string()))
        })
        .boxed())
    }
}

struct FixedLlm;

#[async_trait]
impl ResponseGenerator for FixedLlm {
    async fn generate(&self, _context: Vec<Message>) -> Result<TextStream, VoiceError> {
        let words: Vec<Result<String, VoiceError>> = REPLY
            .split_inclusive(' ')
            .map(|w| Ok(w.to_string()))
            .collect();
        Ok(futures_util::stream::iter(words).boxed())
    }
}

/// Three frames of tone per sentence.
struct ToneTts;

#[async_trait]
impl SpeechSynthesizer for ToneTts {
    fn sample_rate(&self) -> u32 {
        RATE
    }

    async fn synthesize(&self, _text: &str) -> Result<AudioStream, VoiceError> {
        let blocks: Vec<Result<Vec<i16>, VoiceError>> = vec![Ok(vec![1_000; FRAME]); 3];
        Ok(futures_util::stream::iter(blocks).boxed())
    }
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.audio.pace_output = false;
    config.pipeline.enable_metrics = false;
    config
}

fn state(config: &Config) -> AppState {
    AppState::new(
        config,
        Collaborators {
            stt: Arc::new(FixedStt),
            generator: Arc::new(FixedLlm),
            synthesizer: Arc::new(ToneTts),
        },
    )
}

async fn serve(config: Config) -> SocketAddr {
    let app = app(state(&config));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    addr
}

async fn next_frame(ws: &mut Ws) -> WsMessage {
    tokio::time::timeout(WAIT, ws.next())
        .await
        .expect("timed out waiting for a frame")
        .expect("connection closed")
        .expect("websocket error")
}

/// Reads frames until a JSON notice matches, counting binary frames on the way.
async fn until_notice(ws: &mut Ws, pred: impl Fn(&Value) -> bool) -> (Value, Vec<Vec<u8>>) {
    let mut audio = Vec::new();
    loop {
        match next_frame(ws).await {
            WsMessage::Binary(bytes) => audio.push(bytes.to_vec()),
            WsMessage::Text(text) => {
                let notice: Value = serde_json::from_str(text.as_str()).unwrap();
                if pred(&notice) {
                    return (notice, audio);
                }
            }
            _ => {}
        }
    }
}

fn is_state(state: &'static str) -> impl Fn(&Value) -> bool {
    move |n| n["type"] == "state" && n["state"] == state
}

fn pcm_frame(loud: bool) -> Vec<u8> {
    let amp: i16 = if loud { 16_000 } else { 0 };
    let samples: Vec<i16> = (0..FRAME)
        .map(|i| if i % 2 == 0 { amp } else { -amp })
        .collect();
    encode_s16le(&samples)
}

#[tokio::test]
async fn health_check_returns_ok() {
    let app = app(state(&test_config()));

    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "ok");
    assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn greeting_then_spoken_turn_over_websocket() {
    let addr = serve(test_config()).await;
    let (mut ws, _) = connect_async(format!("ws://{}/", addr))
        .await
        .expect("failed to connect");

    let (greeting, _) = until_notice(&mut ws, |n| n["type"] == "transcript").await;
    assert_eq!(greeting["role"], "assistant");
    assert_eq!(greeting["final"], true);

    let (_, greeting_audio) = until_notice(&mut ws, is_state("listening")).await;
    // Three sentences, three tone frames each.
    assert_eq!(greeting_audio.len(), 9);
    for frame in &greeting_audio {
        assert_eq!(&frame[0..4], b"RIFF");
        assert_eq!(frame.len(), 44 + FRAME * 2);
    }

    // First frame arrives wrapped in a WAV header, as browsers often send it.
    let first = pcm_frame(true);
    let mut wrapped = wav_header(RATE, 1, first.len() as u32).to_vec();
    wrapped.extend_from_slice(&first);
    ws.send(WsMessage::Binary(wrapped.into())).await.unwrap();
    for _ in 1..20 {
        ws.send(WsMessage::Binary(pcm_frame(true).into())).await.unwrap();
    }
    for _ in 0..60 {
        ws.send(WsMessage::Binary(pcm_frame(false).into())).await.unwrap();
    }

    let (user, _) = until_notice(&mut ws, |n| {
        n["type"] == "transcript" && n["role"] == "user"
    })
    .await;
    assert_eq!(user["text"], USER_TEXT);

    let (reply, _) = until_notice(&mut ws, |n| {
        n["type"] == "transcript" && n["role"] == "assistant"
    })
    .await;
    assert_eq!(reply["text"], REPLY);

    let (_, reply_audio) = until_notice(&mut ws, is_state("listening")).await;
    // Two sentences, three tone frames each.
    assert_eq!(reply_audio.len(), 6);

    ws.close(None).await.unwrap();
}

#[tokio::test]
async fn second_connection_is_refused_while_session_runs() {
    let addr = serve(test_config()).await;
    let url = format!("ws://{}/ws", addr);

    let (mut first, _) = connect_async(url.as_str()).await.expect("failed to connect");
    until_notice(&mut first, is_state("listening")).await;

    match connect_async(url.as_str()).await {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status().as_u16(), 409);
        }
        Err(e) => panic!("unexpected error: {}", e),
        Ok(_) => panic!("second connection was accepted"),
    }

    first.close(None).await.unwrap();
    drop(first);

    // The slot frees once the first session has wound down.
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if connect_async(url.as_str()).await.is_ok() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "session slot was never released"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn client_directory_takes_over_the_root() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("index.html"), "<h1>parley</h1>").unwrap();
    let mut config = test_config();
    config.server.client_dir = Some(dir.path().to_string_lossy().into_owned());
    let app = app(state(&config));

    let response = app
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&body[..], b"<h1>parley</h1>");
}
