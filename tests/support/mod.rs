//! In-memory chat and delta-source doubles shared by the integration tests.
#![allow(dead_code)]

use std::{
    collections::VecDeque,
    io,
    sync::{
        atomic::{AtomicI64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use session_relay::{
    chat::{ChatApi, ChatError, ChatId, InlineKeyboard, MessageId, OutgoingMessage, ParseMode},
    editor::DeltaSource,
    events::EventEmitter,
    process::ProcessExit,
};
use tokio::time::{sleep_until, Instant};

#[derive(Debug, Clone)]
pub struct SentMessage {
    pub id: MessageId,
    pub message: OutgoingMessage,
    pub at: Instant,
}

#[derive(Debug, Clone)]
pub struct EditAttempt {
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub text: String,
    pub parse_mode: Option<ParseMode>,
    pub markup: Option<InlineKeyboard>,
    pub at: Instant,
    pub ok: bool,
}

#[derive(Debug, Clone)]
struct FailureSpec {
    status: u16,
    description: String,
    retry_after: Option<u64>,
}

impl FailureSpec {
    fn to_error(&self) -> ChatError {
        ChatError::api(self.status, self.description.clone(), self.retry_after)
    }
}

/// Records every call; sends and edits can be scripted to fail.
#[derive(Debug)]
pub struct RecordingChat {
    next_id: AtomicI64,
    sent: Mutex<Vec<SentMessage>>,
    edits: Mutex<Vec<EditAttempt>>,
    answers: Mutex<Vec<(String, Option<String>)>>,
    edit_failures: Mutex<VecDeque<FailureSpec>>,
    always_fail_edits: Mutex<Option<FailureSpec>>,
    send_attempts: AtomicUsize,
    send_failures: Mutex<Vec<(usize, FailureSpec)>>,
}

impl Default for RecordingChat {
    fn default() -> Self {
        Self {
            next_id: AtomicI64::new(100),
            sent: Mutex::new(Vec::new()),
            edits: Mutex::new(Vec::new()),
            answers: Mutex::new(Vec::new()),
            edit_failures: Mutex::new(VecDeque::new()),
            always_fail_edits: Mutex::new(None),
            send_attempts: AtomicUsize::new(0),
            send_failures: Mutex::new(Vec::new()),
        }
    }
}

impl RecordingChat {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next edit with the given platform error.
    pub fn fail_next_edit(&self, status: u16, description: &str, retry_after: Option<u64>) {
        self.edit_failures.lock().push_back(FailureSpec {
            status,
            description: description.to_string(),
            retry_after,
        });
    }

    /// Fail the `nth` send attempt (1-based, counted from construction).
    /// Failed sends are not recorded and consume no message id.
    pub fn fail_nth_send(&self, nth: usize, status: u16, description: &str) {
        self.send_failures.lock().push((
            nth,
            FailureSpec {
                status,
                description: description.to_string(),
                retry_after: None,
            },
        ));
    }

    pub fn fail_all_edits(&self, status: u16, description: &str) {
        *self.always_fail_edits.lock() = Some(FailureSpec {
            status,
            description: description.to_string(),
            retry_after: None,
        });
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().clone()
    }

    pub fn edits(&self) -> Vec<EditAttempt> {
        self.edits.lock().clone()
    }

    pub fn successful_edits(&self) -> Vec<EditAttempt> {
        self.edits().into_iter().filter(|edit| edit.ok).collect()
    }

    pub fn answers(&self) -> Vec<(String, Option<String>)> {
        self.answers.lock().clone()
    }
}

#[async_trait]
impl ChatApi for RecordingChat {
    async fn send_message(&self, message: OutgoingMessage) -> Result<MessageId, ChatError> {
        let attempt = self.send_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let failure = {
            let mut failures = self.send_failures.lock();
            let position = failures.iter().position(|(nth, _)| *nth == attempt);
            position.map(|index| failures.remove(index).1)
        };
        if let Some(failure) = failure {
            return Err(failure.to_error());
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.sent.lock().push(SentMessage {
            id,
            message,
            at: Instant::now(),
        });
        Ok(id)
    }

    async fn edit_message(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        text: &str,
        parse_mode: Option<ParseMode>,
        markup: Option<InlineKeyboard>,
    ) -> Result<(), ChatError> {
        let failure = self
            .edit_failures
            .lock()
            .pop_front()
            .or_else(|| self.always_fail_edits.lock().clone());
        self.edits.lock().push(EditAttempt {
            chat_id,
            message_id,
            text: text.to_string(),
            parse_mode,
            markup,
            at: Instant::now(),
            ok: failure.is_none(),
        });
        match failure {
            Some(failure) => Err(failure.to_error()),
            None => Ok(()),
        }
    }

    async fn answer_callback(&self, callback_id: &str, text: Option<&str>) -> Result<(), ChatError> {
        self.answers
            .lock()
            .push((callback_id.to_string(), text.map(ToOwned::to_owned)));
        Ok(())
    }
}

/// Yields each delta at a fixed offset from construction, then ends.
pub struct ScriptedSource {
    start: Instant,
    steps: VecDeque<(Duration, String)>,
    exit: ProcessExit,
}

impl ScriptedSource {
    pub fn new(steps: &[(u64, &str)]) -> Self {
        Self {
            start: Instant::now(),
            steps: steps
                .iter()
                .map(|(offset_ms, text)| (Duration::from_millis(*offset_ms), text.to_string()))
                .collect(),
            exit: ProcessExit {
                code: Some(0),
                killed: false,
                error_text: None,
            },
        }
    }

    pub fn failing(error_text: Option<&str>) -> Self {
        let mut source = Self::new(&[]);
        source.exit = ProcessExit {
            code: Some(1),
            killed: false,
            error_text: error_text.map(ToOwned::to_owned),
        };
        source
    }

    /// Ends without text, as a subprocess killed before answering does.
    pub fn killed() -> Self {
        let mut source = Self::new(&[]);
        source.exit = ProcessExit {
            code: None,
            killed: true,
            error_text: None,
        };
        source
    }
}

#[async_trait]
impl DeltaSource for ScriptedSource {
    async fn next_delta(&mut self) -> Option<String> {
        let offset = self.steps.front()?.0;
        sleep_until(self.start + offset).await;
        self.steps.pop_front().map(|(_, text)| text)
    }

    async fn wait(&self) -> ProcessExit {
        self.exit.clone()
    }
}

/// Shared in-memory sink for relay events.
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<u8>>>);

impl EventLog {
    pub fn emitter(&self) -> EventEmitter {
        EventEmitter::to_writer(self.clone())
    }

    pub fn lines(&self) -> Vec<serde_json::Value> {
        String::from_utf8_lossy(&self.0.lock())
            .lines()
            .map(|line| serde_json::from_str(line).expect("event line should be JSON"))
            .collect()
    }

    pub fn types(&self) -> Vec<String> {
        self.lines()
            .iter()
            .filter_map(|line| line["type"].as_str().map(ToOwned::to_owned))
            .collect()
    }
}

impl io::Write for EventLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
