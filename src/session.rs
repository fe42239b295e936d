use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::chat::{ChatId, MessageId};

/// Path components that carry no meaning for a project label.
const SKIPPED_COMPONENTS: &[&str] = &["Users", "home", "Documents", "packages", "src"];

/// One assistant conversation under observation.
///
/// Everything except `alarm_message_id` and `chat_id` is fixed at ingestion;
/// those two are filled in once, after the alarm message has been sent.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub project_dir: PathBuf,
    pub project_name: String,
    pub session_id: String,
    pub transcript_path: PathBuf,
    pub hook_event: String,
    pub last_activity: DateTime<Utc>,
    pub alarm_message_id: Option<MessageId>,
    pub chat_id: Option<ChatId>,
}

impl Session {
    pub fn new(
        hook_event: impl Into<String>,
        session_id: impl Into<String>,
        cwd: impl Into<PathBuf>,
        transcript_path: &str,
    ) -> Self {
        let project_dir = cwd.into();
        let home = dirs::home_dir();
        Self {
            project_name: derive_project_name(&project_dir, home.as_deref()),
            project_dir,
            session_id: session_id.into(),
            transcript_path: expand_home(transcript_path, home.as_deref()),
            hook_event: hook_event.into(),
            last_activity: Utc::now(),
            alarm_message_id: None,
            chat_id: None,
        }
    }

    /// Record where the alarm for this session landed.
    pub fn anchor(&mut self, chat_id: ChatId, alarm_message_id: MessageId) {
        self.chat_id = Some(chat_id);
        self.alarm_message_id = Some(alarm_message_id);
    }
}

/// Short display label built from the trailing meaningful path components.
pub fn derive_project_name(cwd: &Path, home: Option<&Path>) -> String {
    let relative = home
        .filter(|home| home.components().count() > 1)
        .and_then(|home| cwd.strip_prefix(home).ok())
        .unwrap_or(cwd);

    let meaningful: Vec<String> = relative
        .components()
        .filter_map(|component| match component {
            std::path::Component::Normal(part) => Some(part.to_string_lossy().to_string()),
            _ => None,
        })
        .filter(|part| !SKIPPED_COMPONENTS.contains(&part.as_str()))
        .collect();

    let start = meaningful.len().saturating_sub(2);
    let label = meaningful[start..].join(" / ");
    if label.is_empty() {
        "unknown".to_string()
    } else {
        label
    }
}

/// Expand a leading `~` to the home directory.
pub fn expand_home(raw: &str, home: Option<&Path>) -> PathBuf {
    // `~user/...` names another account's home; leave it alone.
    let rest = match raw.strip_prefix('~') {
        Some("") => "",
        Some(rest) if rest.starts_with('/') => rest.trim_start_matches('/'),
        _ => return PathBuf::from(raw),
    };
    match home {
        Some(home) if rest.is_empty() => home.to_path_buf(),
        Some(home) => home.join(rest),
        None => PathBuf::from(raw),
    }
}
