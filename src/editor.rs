//! Live rendering of a delta stream into one chat message.
//!
//! The editor is an explicit state machine (`Idle → Streaming → Settling →
//! Done`) driven by two inputs: the next delta and a single optional edit
//! deadline. Interim edits are spaced at least `interval` apart and only
//! scheduled once `min_growth` characters are waiting; the final flush is
//! unconditional and splits text longer than `max_len` into follow-ups.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{sleep, sleep_until, Instant};

use crate::{
    chat::{ChatApi, ChatError, ChatId, MessageId, OutgoingMessage},
    format::{clip_chars, split_message},
    process::{ProcessExit, ProcessHandle},
    registry::SessionRegistry,
};

pub const PLACEHOLDER_TEXT: &str = "...";
pub const NO_RESPONSE_TEXT: &str = "No response generated.";
pub const FAILURE_TEXT: &str = "Error: something went wrong.";
/// Shown when the subprocess was killed (superseded or shut down) before
/// producing any text.
pub const STOPPED_TEXT: &str = "Stopped before a response was generated.";

const FINAL_EDIT_ATTEMPTS: u32 = 3;
const MAX_RETRY_AFTER: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EditorConfig {
    pub interval: Duration,
    pub min_growth: usize,
    pub max_len: usize,
}

impl Default for EditorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1500),
            min_growth: 20,
            max_len: 4000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditorPhase {
    Idle,
    Streaming,
    Settling,
    Done,
}

/// Anything that yields cumulative text deltas and a completion value.
#[async_trait]
pub trait DeltaSource: Send {
    async fn next_delta(&mut self) -> Option<String>;
    async fn wait(&self) -> ProcessExit;
}

#[async_trait]
impl DeltaSource for ProcessHandle {
    async fn next_delta(&mut self) -> Option<String> {
        ProcessHandle::next_delta(self).await
    }

    async fn wait(&self) -> ProcessExit {
        ProcessHandle::wait(self).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditorReport {
    pub message_id: MessageId,
    pub interim_edits: usize,
    pub follow_ups: Vec<MessageId>,
    pub final_text: String,
    pub phase: EditorPhase,
}

pub struct ThrottledEditor<'a> {
    chat: &'a dyn ChatApi,
    registry: &'a SessionRegistry,
    config: EditorConfig,
    chat_id: ChatId,
    owner_id: MessageId,
    message_id: MessageId,
    phase: EditorPhase,
    full_text: String,
    /// Text currently visible in the destination message.
    shown: String,
    /// Byte length of `full_text` covered by the last successful edit.
    flushed_len: usize,
    last_edit_at: Option<Instant>,
    backoff_until: Option<Instant>,
    deadline: Option<Instant>,
    interim_edits: usize,
}

impl<'a> ThrottledEditor<'a> {
    /// Send the placeholder message and register it under `owner_id`.
    pub async fn start(
        chat: &'a dyn ChatApi,
        registry: &'a SessionRegistry,
        config: EditorConfig,
        chat_id: ChatId,
        owner_id: MessageId,
    ) -> Result<ThrottledEditor<'a>, ChatError> {
        let message_id = chat
            .send_message(OutgoingMessage::plain(chat_id, PLACEHOLDER_TEXT))
            .await?;
        registry.map_response(message_id, owner_id);

        Ok(Self {
            chat,
            registry,
            config,
            chat_id,
            owner_id,
            message_id,
            phase: EditorPhase::Idle,
            full_text: String::new(),
            shown: PLACEHOLDER_TEXT.to_string(),
            flushed_len: 0,
            last_edit_at: None,
            backoff_until: None,
            deadline: None,
            interim_edits: 0,
        })
    }

    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    pub fn phase(&self) -> EditorPhase {
        self.phase
    }

    /// Consume `source` to completion and leave the final text in the chat.
    pub async fn run<S>(&mut self, source: &mut S) -> Result<EditorReport, ChatError>
    where
        S: DeltaSource + ?Sized,
    {
        loop {
            let deadline = self.deadline;
            tokio::select! {
                delta = source.next_delta() => match delta {
                    Some(delta) => self.on_delta(&delta),
                    None => break,
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.on_tick().await;
                }
            }
        }

        self.deadline = None;
        self.phase = EditorPhase::Settling;
        let follow_ups = self.settle(source).await;
        self.phase = EditorPhase::Done;
        let follow_ups = follow_ups?;

        Ok(EditorReport {
            message_id: self.message_id,
            interim_edits: self.interim_edits,
            follow_ups,
            final_text: self.full_text.clone(),
            phase: self.phase,
        })
    }

    /// Best-effort error notice after an unrecoverable failure.
    pub async fn fail(&mut self) {
        self.deadline = None;
        self.phase = EditorPhase::Done;
        if let Err(error) = self
            .chat
            .edit_message(self.chat_id, self.message_id, FAILURE_TEXT, None, None)
            .await
        {
            tracing::warn!(
                target = "session_relay::editor",
                message_id = self.message_id,
                error = %error,
                "failed to post error notice"
            );
        }
    }

    fn on_delta(&mut self, delta: &str) {
        if self.phase == EditorPhase::Idle {
            self.phase = EditorPhase::Streaming;
        }
        self.full_text.push_str(delta);
        if self.deadline.is_none() && self.pending_growth() >= self.config.min_growth {
            self.deadline = Some(self.next_edit_slot());
        }
    }

    async fn on_tick(&mut self) {
        self.deadline = None;
        let display = clip_chars(&self.full_text, self.config.max_len).to_string();

        if display == self.shown {
            self.flushed_len = self.full_text.len();
        } else {
            let now = Instant::now();
            self.last_edit_at = Some(now);
            match self
                .chat
                .edit_message(self.chat_id, self.message_id, &display, None, None)
                .await
            {
                Ok(()) => {
                    self.interim_edits += 1;
                    self.mark_shown(display);
                }
                Err(error) if error.is_not_modified() => self.mark_shown(display),
                Err(error) => {
                    if let Some(secs) = error.retry_after() {
                        self.backoff_until = Some(now + Duration::from_secs(secs).min(MAX_RETRY_AFTER));
                    }
                    tracing::warn!(
                        target = "session_relay::editor",
                        message_id = self.message_id,
                        error = %error,
                        "interim edit failed"
                    );
                }
            }
        }

        if self.pending_growth() >= self.config.min_growth {
            self.deadline = Some(self.next_edit_slot());
        }
    }

    async fn settle<S>(&mut self, source: &mut S) -> Result<Vec<MessageId>, ChatError>
    where
        S: DeltaSource + ?Sized,
    {
        if self.full_text.is_empty() {
            let exit = source.wait().await;
            let text = match exit.error_text.filter(|text| !text.trim().is_empty()) {
                Some(text) => text,
                None if exit.killed => STOPPED_TEXT.to_string(),
                None => NO_RESPONSE_TEXT.to_string(),
            };
            self.full_text = clip_chars(&text, self.config.max_len).to_string();
            let final_text = self.full_text.clone();
            self.final_edit(&final_text).await;
            return Ok(Vec::new());
        }

        let full_text = std::mem::take(&mut self.full_text);
        let segments = split_message(&full_text, self.config.max_len);
        let mut follow_ups = Vec::new();
        let result = async {
            if let Some((first, rest)) = segments.split_first() {
                if *first != self.shown {
                    self.final_edit(first).await;
                }
                for segment in rest {
                    let id = self
                        .chat
                        .send_message(OutgoingMessage::plain(self.chat_id, *segment))
                        .await?;
                    self.registry.map_response(id, self.owner_id);
                    follow_ups.push(id);
                }
            }
            Ok::<_, ChatError>(())
        }
        .await;
        self.full_text = full_text;
        result.map(|()| follow_ups)
    }

    async fn final_edit(&mut self, text: &str) {
        for attempt in 1..=FINAL_EDIT_ATTEMPTS {
            match self
                .chat
                .edit_message(self.chat_id, self.message_id, text, None, None)
                .await
            {
                Ok(()) => {
                    self.shown = text.to_string();
                    return;
                }
                Err(error) if error.is_not_modified() => return,
                Err(error) => {
                    tracing::warn!(
                        target = "session_relay::editor",
                        message_id = self.message_id,
                        attempt,
                        error = %error,
                        "final edit failed"
                    );
                    match error.retry_after() {
                        Some(secs) if attempt < FINAL_EDIT_ATTEMPTS => {
                            sleep(Duration::from_secs(secs).min(MAX_RETRY_AFTER)).await;
                        }
                        _ => return,
                    }
                }
            }
        }
    }

    fn mark_shown(&mut self, display: String) {
        self.shown = display;
        self.flushed_len = self.full_text.len();
    }

    fn pending_growth(&self) -> usize {
        self.full_text[self.flushed_len..].chars().count()
    }

    fn next_edit_slot(&self) -> Instant {
        let earliest = match self.last_edit_at {
            Some(at) => at + self.config.interval,
            None => Instant::now(),
        };
        match self.backoff_until {
            Some(until) => earliest.max(until),
            None => earliest,
        }
    }
}
