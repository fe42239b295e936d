//! Reader for an assistant session's append-only JSONL transcript.

use std::{collections::HashSet, path::Path};

use serde_json::Value;

use crate::stream::{assistant_content, text_segments};

/// Tools whose `input.file_path` counts as a touched file.
const FILE_TOOLS: &[&str] = &["Read", "Edit", "Write"];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TranscriptSummary {
    pub last_assistant_message: String,
    /// De-duplicated, in first-seen order, relative to the project root when possible.
    pub files_touched: Vec<String>,
}

/// Latest assistant text and touched files. Unreadable transcripts yield an
/// empty summary.
pub async fn summarize(transcript_path: &Path, project_dir: &Path) -> TranscriptSummary {
    match tokio::fs::read_to_string(transcript_path).await {
        Ok(content) => summarize_content(&content, project_dir),
        Err(error) => {
            tracing::warn!(
                target = "session_relay::transcript",
                path = %transcript_path.display(),
                error = %error,
                "failed to read transcript"
            );
            TranscriptSummary::default()
        }
    }
}

pub fn summarize_content(content: &str, project_dir: &Path) -> TranscriptSummary {
    let mut summary = TranscriptSummary::default();
    let mut seen = HashSet::new();
    let prefix = format!("{}/", project_dir.to_string_lossy().trim_end_matches('/'));

    for record in content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
    {
        let Some(blocks) = assistant_content(&record) else {
            continue;
        };

        let text = text_segments(blocks);
        if !text.is_empty() {
            summary.last_assistant_message = text;
        }

        for path in blocks.iter().filter_map(touched_file) {
            let display = path.strip_prefix(prefix.as_str()).unwrap_or(path).to_string();
            if seen.insert(display.clone()) {
                summary.files_touched.push(display);
            }
        }
    }

    summary
}

fn touched_file(block: &Value) -> Option<&str> {
    if block.get("type").and_then(Value::as_str) != Some("tool_use") {
        return None;
    }
    let name = block.get("name").and_then(Value::as_str)?;
    if !FILE_TOOLS.contains(&name) {
        return None;
    }
    block
        .get("input")
        .and_then(|input| input.get("file_path"))
        .and_then(Value::as_str)
        .filter(|path| !path.is_empty())
}

/// Number of lines currently in the transcript (0 when unreadable).
pub async fn count_lines(transcript_path: &Path) -> usize {
    match tokio::fs::read_to_string(transcript_path).await {
        Ok(content) => content.lines().count(),
        Err(_) => 0,
    }
}

/// Lines appended after the first `after_line` lines.
pub async fn read_lines_after(transcript_path: &Path, after_line: usize) -> Vec<String> {
    match tokio::fs::read_to_string(transcript_path).await {
        Ok(content) => content
            .lines()
            .skip(after_line)
            .map(ToOwned::to_owned)
            .collect(),
        Err(error) => {
            tracing::warn!(
                target = "session_relay::transcript",
                path = %transcript_path.display(),
                error = %error,
                "failed to read transcript tail"
            );
            Vec::new()
        }
    }
}
