use std::sync::Arc;

use futures::stream::BoxStream;
use futures::{Stream, StreamExt, TryStreamExt};
use serde::Deserialize;

use crate::error::ChatError;
use crate::models::{ChatProvider, ModelRequest};
use crate::session::{LogRecord, Message, Slug, Turn};
use crate::settings::{AppConfig, RequestOverrides, resolve_effective_settings};
use crate::storage::SessionStore;

pub const INVALID_NAME_MARKER: &str = "[error] invalid chat name";
pub const CREATE_FAILED_MARKER: &str = "[error] cannot create chat";

pub type ReplyStream = BoxStream<'static, Result<String, ChatError>>;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SendOptions {
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub temperature: Option<f32>,
}

/// Drives one exchange: history in, tokens out, turn persisted at the end.
#[derive(Clone)]
pub struct ChatEngine {
    store: Arc<dyn SessionStore>,
    provider: Arc<dyn ChatProvider>,
    config: Arc<AppConfig>,
}

impl ChatEngine {
    pub fn new(
        store: Arc<dyn SessionStore>,
        provider: Arc<dyn ChatProvider>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self { store, provider, config }
    }

    pub fn store(&self) -> &dyn SessionStore {
        self.store.as_ref()
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Streams the assistant reply for `user_text`.
    ///
    /// Name problems come back as a single marker token rather than an error.
    /// The turn is appended only after the provider stream ends cleanly; a
    /// provider error or a dropped stream leaves the log untouched.
    pub fn stream_turn(&self, chat_name: &str, user_text: &str, opts: SendOptions) -> ReplyStream {
        let engine = self.clone();
        let chat_name = chat_name.to_string();
        let user_text = user_text.to_string();

        boxed(async_stream::try_stream! {
            let Ok(slug) = Slug::parse(&chat_name) else {
                tracing::warn!(chat = %chat_name, "rejected invalid chat name");
                yield INVALID_NAME_MARKER.to_string();
                return;
            };

            if !engine.store.exists(&slug).await {
                match engine.store.create(slug.as_str(), opts.model.as_deref()).await {
                    // lost a creation race with a concurrent request
                    Ok(_) | Err(ChatError::AlreadyExists(_)) => {}
                    Err(e) => {
                        tracing::error!(chat = %slug, error = %e, "cannot create chat");
                        yield CREATE_FAILED_MARKER.to_string();
                        return;
                    }
                }
            }

            let history = engine.store.load_history(&slug).await?;
            let settings = resolve_effective_settings(
                &engine.config,
                &RequestOverrides { model: opts.model.clone(), temperature: opts.temperature },
            );

            let mut messages = Vec::with_capacity(history.messages.len() + 2);
            if let Some(prompt) = opts.system_prompt.as_deref().filter(|p| !p.is_empty()) {
                messages.push(Message::system(prompt));
            }
            messages.extend(history.messages);
            messages.push(Message::user(user_text.as_str()));

            tracing::debug!(
                chat = %slug,
                model = %settings.model,
                provider = engine.provider.name(),
                context = messages.len(),
                "starting exchange"
            );

            let mut tokens = engine.provider.stream_chat(ModelRequest {
                model: settings.model.clone(),
                messages,
                temperature: settings.temperature,
            });
            let mut guard = ExchangeGuard::new(&slug);
            let mut reply = String::new();
            while let Some(token) = tokens.next().await {
                let token = token.map_err(|e| {
                    guard.fail("provider");
                    ChatError::from(e)
                })?;
                reply.push_str(&token);
                yield token;
            }

            let turn = Turn::new(&settings.model, &user_text, reply);
            let chat_id = turn.chat_id.clone();
            engine.store.append(&slug, &LogRecord::Turn(turn)).await.map_err(|e| {
                guard.fail("storage");
                e
            })?;
            guard.complete();
            metrics::counter!("chat_turns_persisted_total").increment(1);
            tracing::info!(
                chat = %slug,
                chat_id = %chat_id,
                model = %settings.model,
                "turn persisted"
            );
        })
    }

    /// Non-streaming variant: the concatenation of every token `stream_turn` yields.
    pub async fn complete_turn(
        &self,
        chat_name: &str,
        user_text: &str,
        opts: SendOptions,
    ) -> Result<String, ChatError> {
        self.stream_turn(chat_name, user_text, opts)
            .try_fold(String::new(), |mut acc, token| async move {
                acc.push_str(&token);
                Ok(acc)
            })
            .await
    }
}

fn boxed(s: impl Stream<Item = Result<String, ChatError>> + Send + 'static) -> ReplyStream {
    Box::pin(s)
}

/// Logs and counts an exchange that ends without a persisted turn.
struct ExchangeGuard {
    chat: String,
    reason: &'static str,
    done: bool,
}

impl ExchangeGuard {
    fn new(chat: &Slug) -> Self {
        Self { chat: chat.to_string(), reason: "cancelled", done: false }
    }

    fn fail(&mut self, reason: &'static str) {
        self.reason = reason;
    }

    fn complete(&mut self) {
        self.done = true;
    }
}

impl Drop for ExchangeGuard {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        metrics::counter!("chat_turns_failed_total", "reason" => self.reason).increment(1);
        tracing::warn!(
            chat = %self.chat,
            reason = self.reason,
            "exchange ended without a persisted turn"
        );
    }
}
