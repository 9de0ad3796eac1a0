//! Response generation: the collaborator seam and an OpenAI-compatible
//! streaming chat client.

use crate::config::LlmConfig;
use crate::error::VoiceError;
use crate::metrics::StageTimer;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};
use parley_types::Message;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

/// Timeout for establishing the completion request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest wait for the next reply fragment before the generation fails.
pub const GENERATION_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

const DELTA_QUEUE_CAPACITY: usize = 64;

pub type TextStream = BoxStream<'static, Result<String, VoiceError>>;

/// Produces the assistant's reply to a conversation.
#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    /// Streams the reply as text fragments. The context ends with the user
    /// message being answered.
    async fn generate(&self, context: Vec<Message>) -> Result<TextStream, VoiceError>;
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    #[serde(default)]
    delta: ChatDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChatDelta {
    content: Option<String>,
}

/// One decoded server-sent event payload.
#[derive(Debug, Clone, PartialEq, Eq)]
enum SseItem {
    Text(String),
    Done,
}

/// Incremental decoder for `text/event-stream` bodies. Input may split lines
/// and UTF-8 sequences at arbitrary byte boundaries.
#[derive(Debug, Default)]
struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    /// Feeds bytes and returns the `data:` payloads of every completed line.
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut payloads = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(data) = line.strip_prefix("data:") {
                payloads.push(data.trim_start().to_string());
            }
        }
        payloads
    }
}

fn parse_payload(payload: &str) -> Result<Option<SseItem>, VoiceError> {
    if payload == "[DONE]" {
        return Ok(Some(SseItem::Done));
    }
    let chunk: ChatChunk = serde_json::from_str(payload)
        .map_err(|e| VoiceError::Generation(format!("unparseable stream chunk: {}", e)))?;
    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
        .filter(|t| !t.is_empty())
        .map(SseItem::Text))
}

/// Streaming `/chat/completions` client.
#[derive(Debug, Clone)]
pub struct OpenAiGenerator {
    client: reqwest::Client,
    config: LlmConfig,
}

impl OpenAiGenerator {
    pub fn new(config: LlmConfig) -> Result<Self, VoiceError> {
        let client = reqwest::Client::builder()
            .connect_timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| VoiceError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl ResponseGenerator for OpenAiGenerator {
    async fn generate(&self, context: Vec<Message>) -> Result<TextStream, VoiceError> {
        let body = ChatRequest {
            model: &self.config.model,
            messages: &context,
            stream: true,
            temperature: self.config.temperature,
        };
        let response = tokio::time::timeout(
            REQUEST_TIMEOUT,
            self.client
                .post(self.endpoint())
                .bearer_auth(&self.config.api_key)
                .json(&body)
                .send(),
        )
        .await
        .map_err(|_| {
            VoiceError::Generation(format!(
                "request timed out after {} seconds",
                REQUEST_TIMEOUT.as_secs()
            ))
        })?
        .map_err(|e| VoiceError::Generation(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(VoiceError::Generation(format!(
                "upstream returned {}: {}",
                status, detail
            )));
        }

        let (tx, rx) = mpsc::channel(DELTA_QUEUE_CAPACITY);
        tokio::spawn(pump_events(response.bytes_stream(), tx));

        Ok(ReceiverStream::new(rx).boxed())
    }
}

/// Decodes an event-stream body into reply fragments on `tx`.
///
/// A body that ends without the `[DONE]` sentinel was cut off and is
/// reported as an error.
async fn pump_events<S, B, E>(body: S, tx: mpsc::Sender<Result<String, VoiceError>>)
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: fmt::Display,
{
    let mut body = std::pin::pin!(body);
    let mut decoder = SseDecoder::default();
    while let Some(bytes) = body.next().await {
        let bytes = match bytes {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = tx
                    .send(Err(VoiceError::Generation(format!("stream failed: {}", e))))
                    .await;
                return;
            }
        };
        for payload in decoder.push(bytes.as_ref()) {
            match parse_payload(&payload) {
                Ok(Some(SseItem::Text(text))) => {
                    if tx.send(Ok(text)).await.is_err() {
                        return;
                    }
                }
                Ok(Some(SseItem::Done)) => return,
                Ok(None) => {}
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            }
        }
    }
    let _ = tx
        .send(Err(VoiceError::Generation(
            "stream ended before [DONE]".to_string(),
        )))
        .await;
}

/// Runs one generation to completion and returns the full reply.
///
/// Returns `Ok(None)` if `cancel` fires first. An empty reply is an error,
/// and so is waiting longer than [`GENERATION_IDLE_TIMEOUT`] for the stream
/// to open or for any fragment.
pub async fn generate_reply(
    generator: &dyn ResponseGenerator,
    context: Vec<Message>,
    cancel: &CancellationToken,
    timer: &mut StageTimer,
) -> Result<Option<String>, VoiceError> {
    let mut stream = tokio::select! {
        _ = cancel.cancelled() => return Ok(None),
        stream = tokio::time::timeout(GENERATION_IDLE_TIMEOUT, generator.generate(context)) => {
            stream.map_err(|_| idle_timeout())??
        }
    };

    let mut reply = String::new();
    loop {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            item = tokio::time::timeout(GENERATION_IDLE_TIMEOUT, stream.next()) => {
                item.map_err(|_| idle_timeout())?
            }
        };
        match item {
            Some(Ok(fragment)) => {
                timer.first_byte();
                reply.push_str(&fragment);
            }
            Some(Err(e)) => return Err(e),
            None => break,
        }
    }

    let reply = reply.trim();
    if reply.is_empty() {
        return Err(VoiceError::Generation("empty response".to_string()));
    }
    Ok(Some(reply.to_string()))
}

fn idle_timeout() -> VoiceError {
    VoiceError::Generation(format!(
        "no response for {} seconds",
        GENERATION_IDLE_TIMEOUT.as_secs()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Stage;
    use futures_util::stream;
    use serde_json::json;

    struct Canned(Vec<Result<String, VoiceError>>);

    #[async_trait]
    impl ResponseGenerator for Canned {
        async fn generate(&self, _context: Vec<Message>) -> Result<TextStream, VoiceError> {
            Ok(stream::iter(self.0.clone()).boxed())
        }
    }

    /// Never yields a fragment.
    struct Stalled;

    #[async_trait]
    impl ResponseGenerator for Stalled {
        async fn generate(&self, _context: Vec<Message>) -> Result<TextStream, VoiceError> {
            Ok(stream::pending().boxed())
        }
    }

    #[test]
    fn request_body_matches_chat_format() {
        let messages = vec![Message::system("be kind"), Message::user("hi")];
        let body = ChatRequest {
            model: "gpt-4-turbo-preview",
            messages: &messages,
            stream: true,
            temperature: None,
        };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({
                "model": "gpt-4-turbo-preview",
                "messages": [
                    {"role": "system", "content": "be kind"},
                    {"role": "user", "content": "hi"}
                ],
                "stream": true
            })
        );
    }

    #[test]
    fn sse_decoder_handles_split_lines() {
        let mut decoder = SseDecoder::default();
        let first = decoder.push(b"data: {\"choices\":[{\"delta\":{\"content\":\"Hel");
        assert!(first.is_empty());
        let second = decoder.push(b"lo\"}}]}\r\n\r\n: keep-alive\ndata: [DONE]\n");
        assert_eq!(
            second,
            vec![
                r#"{"choices":[{"delta":{"content":"Hello"}}]}"#.to_string(),
                "[DONE]".to_string()
            ]
        );
    }

    #[test]
    fn sse_decoder_handles_split_utf8() {
        let line = "data: {\"choices\":[{\"delta\":{\"content\":\"héllo\"}}]}\n".as_bytes();
        let split = line.iter().position(|b| *b == 0xc3).unwrap() + 1;
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(&line[..split]).is_empty());
        let payloads = decoder.push(&line[split..]);
        assert_eq!(
            parse_payload(&payloads[0]).unwrap(),
            Some(SseItem::Text("héllo".to_string()))
        );
    }

    #[test]
    fn payload_parsing() {
        assert_eq!(parse_payload("[DONE]").unwrap(), Some(SseItem::Done));
        assert_eq!(
            parse_payload(r#"{"choices":[{"delta":{"role":"assistant"}}]}"#).unwrap(),
            None
        );
        assert!(matches!(
            parse_payload("{oops"),
            Err(VoiceError::Generation(_))
        ));
    }

    #[tokio::test]
    async fn generate_reply_joins_fragments() {
        let generator = Canned(vec![
            Ok("Tell me ".to_string()),
            Ok("about yourself.".to_string()),
        ]);
        let mut timer = StageTimer::start(Stage::Generation);
        let reply = generate_reply(&generator, Vec::new(), &CancellationToken::new(), &mut timer)
            .await
            .unwrap();
        assert_eq!(reply.as_deref(), Some("Tell me about yourself."));
        assert!(timer.finish().ttfb.is_some());
    }

    #[tokio::test]
    async fn generate_reply_rejects_empty_and_propagates_errors() {
        let mut timer = StageTimer::start(Stage::Generation);
        let token = CancellationToken::new();
        let empty = Canned(vec![Ok("  ".to_string())]);
        assert!(generate_reply(&empty, Vec::new(), &token, &mut timer)
            .await
            .is_err());

        let broken = Canned(vec![
            Ok("partial".to_string()),
            Err(VoiceError::Generation("reset".to_string())),
        ]);
        assert_eq!(
            generate_reply(&broken, Vec::new(), &token, &mut timer).await,
            Err(VoiceError::Generation("reset".to_string()))
        );
    }

    #[tokio::test]
    async fn generate_reply_stops_on_cancel() {
        let token = CancellationToken::new();
        let mut timer = StageTimer::start(Stage::Generation);
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel.cancel();
        });
        let reply = generate_reply(&Stalled, Vec::new(), &token, &mut timer)
            .await
            .unwrap();
        assert_eq!(reply, None);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_generation_times_out() {
        let mut timer = StageTimer::start(Stage::Generation);
        let started = tokio::time::Instant::now();
        let result =
            generate_reply(&Stalled, Vec::new(), &CancellationToken::new(), &mut timer).await;
        assert!(matches!(result, Err(VoiceError::Generation(_))));
        assert!(started.elapsed() >= GENERATION_IDLE_TIMEOUT);
    }

    async fn pump(chunks: Vec<&'static str>) -> Vec<Result<String, VoiceError>> {
        let body = stream::iter(
            chunks
                .into_iter()
                .map(|c| Ok::<_, std::io::Error>(c.as_bytes().to_vec())),
        );
        let (tx, mut rx) = mpsc::channel(16);
        pump_events(body, tx).await;
        let mut items = Vec::new();
        while let Some(item) = rx.recv().await {
            items.push(item);
        }
        items
    }

    #[tokio::test]
    async fn event_stream_ends_at_done() {
        let items = pump(vec![
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\n",
            "data: [DONE]\n\n",
        ])
        .await;
        assert_eq!(items, vec![Ok("Hi".to_string())]);
    }

    #[tokio::test]
    async fn truncated_event_stream_is_an_error() {
        let items = pump(vec![
            "data: {\"choices\":[{\"delta\":{\"content\":\"Tell me about\"}}]}\n\n",
        ])
        .await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0], Ok("Tell me about".to_string()));
        assert!(matches!(items[1], Err(VoiceError::Generation(_))));
    }
}
