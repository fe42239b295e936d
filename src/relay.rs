//! Relay dispatcher: alarms out, replies and button presses in.

use std::sync::Arc;

use anyhow::{Context, Result};
use crate::{
    chat::{
        CallbackQuery, ChatApi, ChatEvent, ChatId, IncomingText, InlineButton, InlineKeyboard,
        MessageId, OutgoingMessage, ParseMode,
    },
    editor::{EditorConfig, ThrottledEditor},
    events::{EventEmitter, RelayEvent},
    format::{format_alarm, format_expanded},
    process::ProcessManager,
    registry::SessionRegistry,
    remote_control::RemoteControl,
    session::Session,
    transcript,
};

pub const SEE_MORE: &str = "see_more";
pub const REMOTE_CONTROL: &str = "remote_control";

const SESSION_EXPIRED: &str = "Session expired";
const RC_STARTING: &str = "Starting remote control...";
const RC_DISABLED: &str = "Remote control is not configured";
const RC_NOT_FOUND: &str = "Remote control URL not found.";

#[derive(Clone)]
pub struct Relay {
    chat: Arc<dyn ChatApi>,
    registry: SessionRegistry,
    processes: ProcessManager,
    chat_id: ChatId,
    editor: EditorConfig,
    remote_control: Option<RemoteControl>,
    events: EventEmitter,
}

impl Relay {
    pub fn new(
        chat: Arc<dyn ChatApi>,
        processes: ProcessManager,
        chat_id: ChatId,
        editor: EditorConfig,
    ) -> Self {
        Self {
            chat,
            registry: SessionRegistry::new(),
            processes,
            chat_id,
            editor,
            remote_control: None,
            events: EventEmitter::disabled(),
        }
    }

    pub fn with_remote_control(mut self, remote_control: Option<RemoteControl>) -> Self {
        self.remote_control = remote_control;
        self
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    fn alarm_keyboard(&self) -> InlineKeyboard {
        let mut buttons = vec![InlineButton::new("See more", SEE_MORE)];
        if self.remote_control.is_some() {
            buttons.push(InlineButton::new("Remote control", REMOTE_CONTROL));
        }
        InlineKeyboard::row(buttons)
    }

    /// Announce a freshly ingested session and register it under the alarm id.
    pub async fn send_alarm(&self, mut session: Session) -> Result<MessageId> {
        let message = OutgoingMessage::html(self.chat_id, format_alarm(&session))
            .with_markup(self.alarm_keyboard());
        let alarm_id = self
            .chat
            .send_message(message)
            .await
            .context("failed to send alarm")?;

        session.anchor(self.chat_id, alarm_id);
        tracing::info!(
            target = "session_relay::relay",
            message_id = alarm_id,
            session_id = %session.session_id,
            project = %session.project_name,
            event = %session.hook_event,
            "alarm sent"
        );
        self.events.emit(&RelayEvent::AlarmSent {
            message_id: alarm_id,
            session_id: session.session_id.clone(),
            project: session.project_name.clone(),
            event: session.hook_event.clone(),
        });
        self.registry.put(alarm_id, session);
        self.registry.set_active(Some(alarm_id));
        Ok(alarm_id)
    }

    /// Handle one inbound chat event. Failures are logged, never propagated.
    pub async fn handle_event(&self, event: ChatEvent) {
        let result = match event {
            ChatEvent::Text(text) => self.handle_reply(text).await,
            ChatEvent::Callback(query) => self.handle_callback(query).await,
        };
        if let Err(error) = result {
            tracing::error!(target = "session_relay::relay", error = ?error, "chat event handler failed");
        }
    }

    async fn handle_reply(&self, incoming: IncomingText) -> Result<()> {
        if incoming.chat_id != self.chat_id {
            tracing::debug!(target = "session_relay::relay", chat_id = incoming.chat_id, "ignoring foreign chat");
            return Ok(());
        }
        let Some(reply_to) = incoming.reply_to else {
            return Ok(());
        };
        let Some((owner_id, session)) = self.lookup(reply_to) else {
            tracing::debug!(target = "session_relay::relay", reply_to, "reply to untracked message");
            return Ok(());
        };

        self.registry.set_active(Some(owner_id));
        tracing::info!(
            target = "session_relay::relay",
            owner = owner_id,
            reply_to,
            session_id = %session.session_id,
            project = %session.project_name,
            "user reply received"
        );
        self.events.emit(&RelayEvent::ReplyStarted {
            owner: owner_id,
            session_id: session.session_id.clone(),
        });

        let mut editor = ThrottledEditor::start(
            self.chat.as_ref(),
            &self.registry,
            self.editor,
            self.chat_id,
            owner_id,
        )
        .await
        .context("failed to send placeholder")?;

        let mut handle = self
            .processes
            .spawn(&session.session_id, &session.project_dir, &incoming.text)
            .await;

        match editor.run(&mut handle).await {
            Ok(report) => {
                tracing::info!(
                    target = "session_relay::relay",
                    owner = owner_id,
                    message_id = report.message_id,
                    interim_edits = report.interim_edits,
                    follow_ups = report.follow_ups.len(),
                    chars = report.final_text.chars().count(),
                    "reply finished"
                );
                self.events.emit(&RelayEvent::ReplyFinished {
                    owner: owner_id,
                    message_id: report.message_id,
                    interim_edits: report.interim_edits,
                    follow_ups: report.follow_ups,
                });
            }
            Err(error) => {
                handle.kill();
                tracing::error!(
                    target = "session_relay::relay",
                    owner = owner_id,
                    error = %error,
                    "streaming response failed"
                );
                self.events.emit(&RelayEvent::ReplyFailed {
                    owner: owner_id,
                    error: error.to_string(),
                });
                editor.fail().await;
            }
        }
        Ok(())
    }

    async fn handle_callback(&self, query: CallbackQuery) -> Result<()> {
        if query.chat_id != Some(self.chat_id) {
            tracing::debug!(target = "session_relay::relay", chat_id = ?query.chat_id, "ignoring foreign callback");
            return Ok(());
        }
        let session = query.message_id.and_then(|id| self.lookup(id));

        match (query.data.as_str(), session) {
            (SEE_MORE | REMOTE_CONTROL, None) => {
                self.answer(&query.id, Some(SESSION_EXPIRED)).await;
                Ok(())
            }
            (SEE_MORE, Some((owner_id, session))) => self.expand(&query.id, owner_id, &session).await,
            (REMOTE_CONTROL, Some((owner_id, session))) => {
                self.start_remote_control(&query.id, owner_id, &session).await
            }
            (other, _) => {
                tracing::debug!(target = "session_relay::relay", data = %other, "unknown callback");
                self.answer(&query.id, None).await;
                Ok(())
            }
        }
    }

    async fn expand(&self, callback_id: &str, owner_id: MessageId, session: &Session) -> Result<()> {
        let summary = transcript::summarize(&session.transcript_path, &session.project_dir).await;
        let text = format_expanded(session, &summary.last_assistant_message, &summary.files_touched);

        let edited = self
            .chat
            .edit_message(
                self.chat_id,
                owner_id,
                &text,
                Some(ParseMode::Html),
                Some(self.alarm_keyboard()),
            )
            .await;
        self.registry.set_active(Some(owner_id));
        self.answer(callback_id, None).await;

        match edited {
            Err(error) if !error.is_not_modified() => {
                Err(error).context("failed to expand alarm")
            }
            _ => {
                tracing::info!(
                    target = "session_relay::relay",
                    message_id = owner_id,
                    project = %session.project_name,
                    files = summary.files_touched.len(),
                    "expanded alarm"
                );
                Ok(())
            }
        }
    }

    async fn start_remote_control(
        &self,
        callback_id: &str,
        owner_id: MessageId,
        session: &Session,
    ) -> Result<()> {
        let Some(remote_control) = &self.remote_control else {
            self.answer(callback_id, Some(RC_DISABLED)).await;
            return Ok(());
        };
        self.answer(callback_id, Some(RC_STARTING)).await;
        self.registry.set_active(Some(owner_id));

        let url = remote_control.activate(&session.transcript_path).await;
        tracing::info!(
            target = "session_relay::relay",
            owner = owner_id,
            found = url.is_some(),
            "remote control activated"
        );
        self.events.emit(&RelayEvent::RemoteControl {
            owner: owner_id,
            session_id: session.session_id.clone(),
            url: url.clone(),
        });

        let text = match &url {
            Some(url) => format!("Remote control: {url}"),
            None => RC_NOT_FOUND.to_string(),
        };
        let sent = self
            .chat
            .send_message(OutgoingMessage::plain(self.chat_id, text).replying_to(owner_id))
            .await
            .context("failed to send remote-control link")?;
        self.registry.map_response(sent, owner_id);
        Ok(())
    }

    fn lookup(&self, any_id: MessageId) -> Option<(MessageId, Session)> {
        let owner_id = self.registry.resolve_owner(any_id)?;
        self.registry.get(owner_id).map(|session| (owner_id, session))
    }

    async fn answer(&self, callback_id: &str, text: Option<&str>) {
        if let Err(error) = self.chat.answer_callback(callback_id, text).await {
            tracing::warn!(target = "session_relay::relay", error = %error, "failed to answer callback");
        }
    }
}
