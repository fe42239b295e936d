//! Telegram Bot API client implementing the chat boundary.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::chat::{
    CallbackQuery, ChatApi, ChatError, ChatEvent, ChatId, IncomingText, InlineKeyboard,
    MessageId, OutgoingMessage, ParseMode,
};

const LONG_POLL_SECS: u64 = 30;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(LONG_POLL_SECS + 15);
const MAX_POLL_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    error_code: Option<u16>,
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    retry_after: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<Message>,
    pub callback_query: Option<TelegramCallback>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: ChatId,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: MessageId,
    pub chat: Chat,
    pub text: Option<String>,
    pub reply_to_message: Option<Box<Message>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramCallback {
    pub id: String,
    pub data: Option<String>,
    pub message: Option<Message>,
}

impl Update {
    /// Map to the relay's inbound event, dropping update kinds it ignores.
    pub fn into_event(self) -> Option<ChatEvent> {
        if let Some(callback) = self.callback_query {
            return Some(ChatEvent::Callback(CallbackQuery {
                id: callback.id,
                chat_id: callback.message.as_ref().map(|message| message.chat.id),
                message_id: callback.message.as_ref().map(|message| message.message_id),
                data: callback.data.unwrap_or_default(),
            }));
        }
        let message = self.message?;
        let text = message.text?;
        Some(ChatEvent::Text(IncomingText {
            chat_id: message.chat.id,
            message_id: message.message_id,
            reply_to: message.reply_to_message.map(|parent| parent.message_id),
            text,
        }))
    }
}

#[derive(Debug, Clone)]
pub struct TelegramClient {
    client: Client,
    base_url: String,
    token: String,
}

impl TelegramClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self, ChatError> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, body: Value) -> Result<T, ChatError> {
        let url = format!("{}/bot{}/{}", self.base_url, self.token, method);
        let response = self.client.post(url).json(&body).send().await?;
        let status = response.status().as_u16();
        let bytes = response.bytes().await?;
        let envelope: ApiEnvelope<T> = serde_json::from_slice(&bytes)?;

        if envelope.ok {
            return envelope
                .result
                .ok_or_else(|| ChatError::InvalidResponse(format!("{method}: missing result")));
        }
        Err(ChatError::api(
            envelope.error_code.unwrap_or(status),
            envelope
                .description
                .unwrap_or_else(|| format!("{method} failed")),
            envelope.parameters.and_then(|parameters| parameters.retry_after),
        ))
    }

    pub async fn get_updates(
        &self,
        offset: Option<i64>,
        timeout_secs: u64,
    ) -> Result<Vec<Update>, ChatError> {
        let mut body = json!({
            "timeout": timeout_secs,
            "allowed_updates": ["message", "callback_query"],
        });
        if let Some(offset) = offset {
            body["offset"] = json!(offset);
        }
        self.call("getUpdates", body).await
    }

    /// Long polling does not work while a webhook is registered.
    pub async fn delete_webhook(&self) -> Result<(), ChatError> {
        let _: bool = self.call("deleteWebhook", json!({})).await?;
        Ok(())
    }

    /// Forward inbound events until `cancel` fires.
    pub async fn run_polling(
        self: Arc<Self>,
        events_tx: mpsc::Sender<ChatEvent>,
        cancel: CancellationToken,
    ) {
        let mut offset: Option<i64> = None;
        let mut failures = 0u32;

        loop {
            let updates = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.get_updates(offset, LONG_POLL_SECS) => result,
            };

            match updates {
                Ok(updates) => {
                    failures = 0;
                    for update in updates {
                        offset = Some(update.update_id + 1);
                        if let Some(event) = update.into_event() {
                            if events_tx.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                }
                Err(error) => {
                    failures += 1;
                    let delay = match error.retry_after() {
                        Some(secs) => Duration::from_secs(secs),
                        None => poll_backoff(failures),
                    };
                    tracing::warn!(
                        target = "session_relay::telegram",
                        error = %error,
                        failures,
                        delay_ms = delay.as_millis() as u64,
                        "getUpdates failed"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
        tracing::info!(target = "session_relay::telegram", "polling stopped");
    }
}

fn poll_backoff(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(5);
    Duration::from_secs(1u64 << exp).min(MAX_POLL_BACKOFF)
}

fn message_body(
    chat_id: ChatId,
    text: &str,
    parse_mode: Option<ParseMode>,
    markup: Option<&InlineKeyboard>,
) -> Map<String, Value> {
    let mut body = Map::new();
    body.insert("chat_id".into(), json!(chat_id));
    body.insert("text".into(), json!(text));
    if let Some(mode) = parse_mode {
        body.insert("parse_mode".into(), json!(mode));
    }
    if let Some(markup) = markup {
        body.insert("reply_markup".into(), json!(markup));
    }
    body
}

#[async_trait]
impl ChatApi for TelegramClient {
    async fn send_message(&self, message: OutgoingMessage) -> Result<MessageId, ChatError> {
        let mut body = message_body(
            message.chat_id,
            &message.text,
            message.parse_mode,
            message.markup.as_ref(),
        );
        if let Some(reply_to) = message.reply_to {
            body.insert(
                "reply_parameters".into(),
                json!({"message_id": reply_to, "allow_sending_without_reply": true}),
            );
        }
        let sent: Message = self.call("sendMessage", Value::Object(body)).await?;
        Ok(sent.message_id)
    }

    async fn edit_message(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        text: &str,
        parse_mode: Option<ParseMode>,
        markup: Option<InlineKeyboard>,
    ) -> Result<(), ChatError> {
        let mut body = message_body(chat_id, text, parse_mode, markup.as_ref());
        body.insert("message_id".into(), json!(message_id));
        let _: Value = self.call("editMessageText", Value::Object(body)).await?;
        Ok(())
    }

    async fn answer_callback(&self, callback_id: &str, text: Option<&str>) -> Result<(), ChatError> {
        let mut body = json!({ "callback_query_id": callback_id });
        if let Some(text) = text {
            body["text"] = json!(text);
        }
        let _: bool = self.call("answerCallbackQuery", body).await?;
        Ok(())
    }
}
