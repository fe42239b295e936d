//! Operator-facing output: `tracing` logs plus an optional stream of
//! machine-readable relay events, one JSON object per line.

use std::{
    fmt,
    io::{self, IsTerminal, Write},
    sync::Arc,
};

use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::chat::MessageId;

/// Install the global subscriber. Logs go to stderr so stdout stays free;
/// an unparsable level falls back to `info`.
pub fn init_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = io::stderr();
    let ansi = stderr.is_terminal();
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(io::stderr)
                .with_target(true)
                .with_ansi(ansi),
        )
        .try_init()?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayEvent {
    AlarmSent {
        message_id: MessageId,
        session_id: String,
        project: String,
        event: String,
    },
    ReplyStarted {
        owner: MessageId,
        session_id: String,
    },
    ReplyFinished {
        owner: MessageId,
        message_id: MessageId,
        interim_edits: usize,
        follow_ups: Vec<MessageId>,
    },
    ReplyFailed {
        owner: MessageId,
        error: String,
    },
    RemoteControl {
        owner: MessageId,
        session_id: String,
        url: Option<String>,
    },
}

#[derive(Serialize)]
struct EventLine<'a> {
    ts: String,
    #[serde(flatten)]
    event: &'a RelayEvent,
}

type Sink = Arc<Mutex<Box<dyn Write + Send>>>;

/// Cloneable handle onto the event sink. Disabled emitters drop everything.
#[derive(Clone, Default)]
pub struct EventEmitter {
    sink: Option<Sink>,
}

impl fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEmitter")
            .field("enabled", &self.sink.is_some())
            .finish()
    }
}

impl EventEmitter {
    /// Stderr when `enabled`, otherwise a disabled emitter.
    pub fn new(enabled: bool) -> Self {
        if enabled {
            Self::to_writer(io::stderr())
        } else {
            Self::disabled()
        }
    }

    pub fn disabled() -> Self {
        Self { sink: None }
    }

    pub fn to_writer(writer: impl Write + Send + 'static) -> Self {
        Self {
            sink: Some(Arc::new(Mutex::new(Box::new(writer)))),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    pub fn emit(&self, event: &RelayEvent) {
        let Some(sink) = &self.sink else {
            return;
        };
        let line = EventLine {
            ts: Utc::now().to_rfc3339(),
            event,
        };
        let encoded = match serde_json::to_string(&line) {
            Ok(encoded) => encoded,
            Err(error) => {
                tracing::warn!(target = "session_relay::events", error = %error, "failed to encode event");
                return;
            }
        };

        let mut writer = sink.lock();
        if let Err(error) = writeln!(writer, "{encoded}").and_then(|()| writer.flush()) {
            tracing::debug!(target = "session_relay::events", error = %error, "event sink write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{io, sync::Arc};

    use parking_lot::Mutex;
    use serde_json::Value;

    use super::{EventEmitter, RelayEvent};

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Captured {
        fn lines(&self) -> Vec<Value> {
            String::from_utf8(self.0.lock().clone())
                .unwrap()
                .lines()
                .map(|line| serde_json::from_str(line).unwrap())
                .collect()
        }
    }

    #[test]
    fn alarm_event_is_one_flat_json_line() {
        let captured = Captured::default();
        let emitter = EventEmitter::to_writer(captured.clone());
        emitter.emit(&RelayEvent::AlarmSent {
            message_id: 100,
            session_id: "abc".to_string(),
            project: "repo / proj".to_string(),
            event: "Stop".to_string(),
        });

        let lines = captured.lines();
        assert_eq!(lines.len(), 1);
        let line = &lines[0];
        assert_eq!(line["type"], "alarm_sent");
        assert_eq!(line["message_id"], 100);
        assert_eq!(line["session_id"], "abc");
        assert_eq!(line["project"], "repo / proj");
        assert_eq!(line["event"], "Stop");
        let ts = line["ts"].as_str().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(ts).is_ok(), "bad ts {ts}");
    }

    #[test]
    fn clones_share_the_sink_in_order() {
        let captured = Captured::default();
        let emitter = EventEmitter::to_writer(captured.clone());
        let other = emitter.clone();

        emitter.emit(&RelayEvent::ReplyStarted {
            owner: 7,
            session_id: "s".to_string(),
        });
        other.emit(&RelayEvent::ReplyFinished {
            owner: 7,
            message_id: 8,
            interim_edits: 2,
            follow_ups: vec![9, 10],
        });
        other.emit(&RelayEvent::RemoteControl {
            owner: 7,
            session_id: "s".to_string(),
            url: None,
        });

        let lines = captured.lines();
        let types: Vec<&str> = lines.iter().map(|l| l["type"].as_str().unwrap()).collect();
        assert_eq!(types, ["reply_started", "reply_finished", "remote_control"]);
        assert_eq!(lines[1]["follow_ups"], serde_json::json!([9, 10]));
        assert_eq!(lines[1]["interim_edits"], 2);
        assert!(lines[2]["url"].is_null());
    }

    #[test]
    fn disabled_emitter_writes_nothing() {
        let emitter = EventEmitter::disabled();
        assert!(!emitter.is_enabled());
        emitter.emit(&RelayEvent::ReplyFailed {
            owner: 1,
            error: "boom".to_string(),
        });
        assert!(!EventEmitter::new(false).is_enabled());
        assert!(EventEmitter::new(true).is_enabled());
    }
}
