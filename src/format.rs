use chrono::Local;

use crate::session::Session;

const EXPANDED_MESSAGE_CHARS: usize = 1500;
const EXPANDED_MAX_FILES: usize = 20;

pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

pub fn format_alarm(session: &Session) -> String {
    let time = session
        .last_activity
        .with_timezone(&Local)
        .format("%m.%d %H:%M");
    let icon = if session.hook_event == "Stop" {
        '\u{23f9}'
    } else {
        '\u{26a1}'
    };

    format!(
        "<b>{icon} {}</b>\n<code>{}</code>\n{time}",
        escape_html(&session.hook_event),
        escape_html(&session.project_name)
    )
}

pub fn format_expanded(session: &Session, last_message: &str, files_touched: &[String]) -> String {
    let mut parts = vec![format_alarm(session), String::new()];

    if !last_message.is_empty() {
        let truncated = if last_message.chars().count() > EXPANDED_MESSAGE_CHARS {
            format!("{}...", clip_chars(last_message, EXPANDED_MESSAGE_CHARS))
        } else {
            last_message.to_string()
        };
        parts.push("<b>Last message:</b>".to_string());
        parts.push(escape_html(&truncated));
        parts.push(String::new());
    }

    if !files_touched.is_empty() {
        let files = files_touched
            .iter()
            .take(EXPANDED_MAX_FILES)
            .map(|file| escape_html(file))
            .collect::<Vec<_>>()
            .join(", ");
        parts.push(format!("<b>Files:</b> {files}"));
        parts.push(String::new());
    }

    parts.push("<i>Reply below to continue \u{2193}</i>".to_string());
    parts.join("\n")
}

/// The first `max_chars` characters of `text`.
pub fn clip_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Split into consecutive segments of at most `max_chars` characters.
pub fn split_message(text: &str, max_chars: usize) -> Vec<&str> {
    let max_chars = max_chars.max(1);
    let mut segments = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        let head = clip_chars(rest, max_chars);
        segments.push(head);
        rest = &rest[head.len()..];
    }
    segments
}
