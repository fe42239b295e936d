//! Boundary between the relay core and the chat platform.
//!
//! The core only needs to send (optionally with an inline keyboard), edit a
//! message by id, and answer button presses. Inbound traffic arrives as
//! [`ChatEvent`]s.

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

pub type ChatId = i64;
pub type MessageId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ParseMode {
    #[serde(rename = "HTML")]
    Html,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InlineButton {
    pub text: String,
    pub callback_data: String,
}

impl InlineButton {
    pub fn new(text: impl Into<String>, callback_data: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            callback_data: callback_data.into(),
        }
    }
}

/// A single row of callback buttons.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InlineKeyboard {
    pub inline_keyboard: Vec<Vec<InlineButton>>,
}

impl InlineKeyboard {
    pub fn row(buttons: Vec<InlineButton>) -> Self {
        Self {
            inline_keyboard: vec![buttons],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub chat_id: ChatId,
    pub text: String,
    pub parse_mode: Option<ParseMode>,
    pub markup: Option<InlineKeyboard>,
    pub reply_to: Option<MessageId>,
}

impl OutgoingMessage {
    pub fn plain(chat_id: ChatId, text: impl Into<String>) -> Self {
        Self {
            chat_id,
            text: text.into(),
            parse_mode: None,
            markup: None,
            reply_to: None,
        }
    }

    pub fn html(chat_id: ChatId, text: impl Into<String>) -> Self {
        Self {
            parse_mode: Some(ParseMode::Html),
            ..Self::plain(chat_id, text)
        }
    }

    pub fn with_markup(mut self, markup: InlineKeyboard) -> Self {
        self.markup = Some(markup);
        self
    }

    pub fn replying_to(mut self, message_id: MessageId) -> Self {
        self.reply_to = Some(message_id);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingText {
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub reply_to: Option<MessageId>,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackQuery {
    pub id: String,
    pub chat_id: Option<ChatId>,
    pub message_id: Option<MessageId>,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    Text(IncomingText),
    Callback(CallbackQuery),
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("chat API error ({status}): {description}")]
    Api {
        status: u16,
        description: String,
        retry_after: Option<u64>,
    },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl ChatError {
    pub fn api(status: u16, description: impl Into<String>, retry_after: Option<u64>) -> Self {
        Self::Api {
            status,
            description: description.into(),
            retry_after,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::Api { status: 429, .. })
    }

    /// Seconds the platform asked us to wait before the next call.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Self::Api { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Editing a message to identical content is rejected by the platform.
    pub fn is_not_modified(&self) -> bool {
        matches!(
            self,
            Self::Api { status: 400, description, .. } if description.contains("message is not modified")
        )
    }
}

#[async_trait]
pub trait ChatApi: Send + Sync + 'static {
    async fn send_message(&self, message: OutgoingMessage) -> Result<MessageId, ChatError>;

    async fn edit_message(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        text: &str,
        parse_mode: Option<ParseMode>,
        markup: Option<InlineKeyboard>,
    ) -> Result<(), ChatError>;

    async fn answer_callback(&self, callback_id: &str, text: Option<&str>) -> Result<(), ChatError>;
}
