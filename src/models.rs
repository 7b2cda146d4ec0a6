use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::session::{Message, Role};
use crate::settings::AppConfig;

pub const LOCAL_ECHO_PREFIX: &str = "(local dev) You said: ";
pub const LOCAL_ECHO_DELAY: Duration = Duration::from_millis(10);

/// Text tokens in arrival order. Finite and not restartable.
pub type TokenStream = BoxStream<'static, anyhow::Result<String>>;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ModelRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub temperature: f32,
}

pub trait ChatProvider: Send + Sync {
    fn name(&self) -> &'static str;
    fn stream_chat(&self, req: ModelRequest) -> TokenStream;
}

/// Picks the live provider when a credential is configured, the local echo otherwise.
pub fn provider_for(config: &AppConfig) -> Arc<dyn ChatProvider> {
    match &config.api_key {
        Some(key) => Arc::new(OpenAICompatible::new(config.base_url.clone(), key.clone())),
        None => Arc::new(LocalEcho::default()),
    }
}

#[derive(Clone)]
pub struct OpenAICompatible {
    pub base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAICompatible {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self { base_url: base_url.into(), api_key: api_key.into(), client: reqwest::Client::new() }
    }

    async fn open_stream(&self, req: &ModelRequest) -> anyhow::Result<reqwest::Response> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let body = OaiChatRequest {
            model: &req.model,
            messages: &req.messages,
            temperature: req.temperature,
            stream: true,
        };
        let resp = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("failed to send streaming request")?;
        if !resp.status().is_success() {
            bail!("model call failed: {}", resp.status());
        }
        Ok(resp)
    }
}

#[derive(Debug, Serialize)]
struct OaiChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct OaiStreamChunk {
    #[serde(default)]
    choices: Vec<OaiStreamChoice>,
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct OaiStreamChoice {
    delta: OaiDelta,
}

#[derive(Debug, Deserialize)]
struct OaiDelta {
    content: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
enum SseData {
    Token(String),
    Skip,
    Done,
}

fn parse_sse_line(line: &str) -> anyhow::Result<SseData> {
    let Some(data) = line.strip_prefix("data:") else { return Ok(SseData::Skip) };
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(SseData::Done);
    }
    let chunk: OaiStreamChunk = serde_json::from_str(data).context("malformed stream chunk")?;
    if let Some(err) = chunk.error {
        bail!("provider stream error: {}", err);
    }
    match chunk.choices.into_iter().next().and_then(|c| c.delta.content) {
        Some(text) if !text.is_empty() => Ok(SseData::Token(text)),
        _ => Ok(SseData::Skip),
    }
}

/// Pops one complete line off the front of `buf`, if there is one.
fn take_line(buf: &mut Vec<u8>) -> Option<String> {
    let pos = buf.iter().position(|b| *b == b'\n')?;
    let raw: Vec<u8> = buf.drain(..=pos).collect();
    Some(String::from_utf8_lossy(&raw).trim_end_matches(['\r', '\n']).to_string())
}

impl ChatProvider for OpenAICompatible {
    fn name(&self) -> &'static str {
        "openai-compatible"
    }

    fn stream_chat(&self, req: ModelRequest) -> TokenStream {
        let this = self.clone();
        boxed(async_stream::try_stream! {
            let resp = this.open_stream(&req).await?;
            let mut bytes = resp.bytes_stream();
            let mut buf: Vec<u8> = Vec::new();
            'read: while let Some(chunk) = bytes.next().await {
                let chunk = chunk.context("failed to read stream chunk")?;
                buf.extend_from_slice(&chunk);
                while let Some(line) = take_line(&mut buf) {
                    match parse_sse_line(&line)? {
                        SseData::Token(text) => {
                            yield text;
                        }
                        SseData::Skip => {}
                        SseData::Done => break 'read,
                    }
                }
            }
        })
    }
}

fn boxed(s: impl Stream<Item = anyhow::Result<String>> + Send + 'static) -> TokenStream {
    Box::pin(s)
}

/// Echoes the last user message back one character at a time.
#[derive(Debug, Clone)]
pub struct LocalEcho {
    pub delay: Duration,
}

impl Default for LocalEcho {
    fn default() -> Self {
        Self { delay: LOCAL_ECHO_DELAY }
    }
}

impl LocalEcho {
    pub fn reply_for(messages: &[Message]) -> String {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        format!("{LOCAL_ECHO_PREFIX}{last_user}")
    }
}

impl ChatProvider for LocalEcho {
    fn name(&self) -> &'static str {
        "local-echo"
    }

    fn stream_chat(&self, req: ModelRequest) -> TokenStream {
        let text = Self::reply_for(&req.messages);
        let delay = self.delay;
        boxed(async_stream::stream! {
            for ch in text.chars() {
                yield Ok(ch.to_string());
                tokio::time::sleep(delay).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, StatusCode, header};
    use axum::{Json, Router, routing::post};
    use futures::TryStreamExt;

    fn request(messages: Vec<Message>) -> ModelRequest {
        ModelRequest { model: "m".into(), messages, temperature: 0.2 }
    }

    #[test]
    fn sse_lines_are_classified() {
        let tok = r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#;
        assert_eq!(parse_sse_line(tok).unwrap(), SseData::Token("Hel".into()));
        let empty = r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#;
        assert_eq!(parse_sse_line(empty).unwrap(), SseData::Skip);
        assert_eq!(parse_sse_line("data: [DONE]").unwrap(), SseData::Done);
        assert_eq!(parse_sse_line(": keep-alive").unwrap(), SseData::Skip);
        assert!(parse_sse_line(r#"data: {"error":{"message":"rate limited"}}"#).is_err());
    }

    #[test]
    fn take_line_keeps_partial_tail() {
        let mut buf = b"data: a\r\ndata: b\ndata: par".to_vec();
        assert_eq!(take_line(&mut buf).as_deref(), Some("data: a"));
        assert_eq!(take_line(&mut buf).as_deref(), Some("data: b"));
        assert_eq!(take_line(&mut buf), None);
        assert_eq!(buf, b"data: par");
    }

    #[tokio::test]
    async fn local_echo_streams_single_characters() {
        let echo = LocalEcho { delay: Duration::from_millis(0) };
        let msgs = vec![
            Message::system("sys"),
            Message::user("older"),
            Message::assistant("x"),
            Message::user("ping"),
        ];
        let tokens: Vec<String> = echo.stream_chat(request(msgs)).try_collect().await.unwrap();
        assert!(tokens.iter().all(|t| t.chars().count() == 1));
        assert_eq!(tokens.concat(), "(local dev) You said: ping");
    }

    #[test]
    fn provider_selection_follows_credential() {
        let mut cfg = AppConfig::from_lookup(|_| None);
        assert_eq!(provider_for(&cfg).name(), "local-echo");
        cfg.api_key = Some("k".into());
        assert_eq!(provider_for(&cfg).name(), "openai-compatible");
    }

    async fn stub_provider(status: StatusCode) -> String {
        let app = Router::new().route(
            "/chat/completions",
            post(move |headers: HeaderMap, Json(body): Json<serde_json::Value>| async move {
                assert_eq!(headers.get(header::AUTHORIZATION).unwrap(), "Bearer test-key");
                assert_eq!(body["stream"], true);
                assert_eq!(body["messages"][0]["role"], "user");
                let sse = concat!(
                    "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
                    "data: {\"choices\":[{\"delta\":{\"content\":\"Hello\"}}]}\n\n",
                    "data: {\"choices\":[{\"delta\":{\"content\":\", world\"}}]}\n\n",
                    "data: [DONE]\n\n",
                );
                (status, [(header::CONTENT_TYPE, "text/event-stream")], sse)
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn openai_compatible_streams_deltas() {
        let base = stub_provider(StatusCode::OK).await;
        let provider = OpenAICompatible::new(base, "test-key");
        let tokens: Vec<String> = provider
            .stream_chat(request(vec![Message::user("hi")]))
            .try_collect()
            .await
            .unwrap();
        assert_eq!(tokens, vec!["Hello".to_string(), ", world".to_string()]);
    }

    #[tokio::test]
    async fn openai_compatible_surfaces_http_failure() {
        let base = stub_provider(StatusCode::UNAUTHORIZED).await;
        let provider = OpenAICompatible::new(base, "test-key");
        let res: anyhow::Result<Vec<String>> =
            provider.stream_chat(request(vec![Message::user("hi")])).try_collect().await;
        assert!(res.unwrap_err().to_string().contains("401"));
    }
}
