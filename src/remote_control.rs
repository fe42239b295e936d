//! Opens a companion remote-control session and fishes its URL out of the
//! transcript.

use std::{path::Path, process::Stdio, sync::LazyLock, time::Duration};

use regex::Regex;
use tokio::process::Command;

use crate::{process::ProcessCommand, transcript};

static SESSION_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https://claude\.ai/code/session_\S+").expect("valid regex"));

#[derive(Debug, Clone)]
pub struct RemoteControl {
    command: ProcessCommand,
    wait: Duration,
}

impl RemoteControl {
    pub fn new(command: ProcessCommand, wait: Duration) -> Self {
        Self { command, wait }
    }

    /// Trigger the automation, then look for a session URL among the
    /// transcript lines appended after the trigger.
    pub async fn activate(&self, transcript_path: &Path) -> Option<String> {
        let before = transcript::count_lines(transcript_path).await;

        let status = Command::new(&self.command.program)
            .args(&self.command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await;
        match status {
            Ok(output) if output.status.success() => {}
            Ok(output) => {
                tracing::warn!(
                    target = "session_relay::remote_control",
                    code = ?output.status.code(),
                    stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                    "remote-control command failed"
                );
                return None;
            }
            Err(error) => {
                tracing::warn!(
                    target = "session_relay::remote_control",
                    program = %self.command.program,
                    error = %error,
                    "failed to run remote-control command"
                );
                return None;
            }
        }

        tokio::time::sleep(self.wait).await;

        let appended = transcript::read_lines_after(transcript_path, before).await;
        find_session_url(&appended)
    }
}

/// First session URL mentioned in `lines`.
pub fn find_session_url<S: AsRef<str>>(lines: &[S]) -> Option<String> {
    lines
        .iter()
        .find_map(|line| SESSION_URL.find(line.as_ref()))
        .map(|found| trim_json_tail(found.as_str()).to_string())
}

/// A match inside a JSON string runs into the closing quote and punctuation.
fn trim_json_tail(url: &str) -> &str {
    let end = url
        .find(|c: char| matches!(c, '"' | '\\' | '\'' | '<' | '>'))
        .unwrap_or(url.len());
    url[..end].trim_end_matches(|c: char| matches!(c, ',' | '.' | ')' | ']' | '}'))
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use super::{find_session_url, RemoteControl};
    use crate::process::ProcessCommand;

    #[test]
    fn finds_url_inside_json_record() {
        let lines = vec![
            r#"{"type":"user","message":"hi"}"#.to_string(),
            r#"{"type":"system","content":"Remote control at https://claude.ai/code/session_01AbC, enjoy"}"#
                .to_string(),
            r#"{"type":"system","content":"open https://claude.ai/code/session_02XyZ"}"#.to_string(),
        ];
        assert_eq!(
            find_session_url(&lines).as_deref(),
            Some("https://claude.ai/code/session_01AbC")
        );
        assert_eq!(
            find_session_url(&lines[2..]).as_deref(),
            Some("https://claude.ai/code/session_02XyZ")
        );
        assert_eq!(find_session_url::<String>(&[]), None);
    }

    #[tokio::test]
    async fn activate_reads_only_appended_lines() {
        let dir = tempfile::tempdir().unwrap();
        let transcript = dir.path().join("t.jsonl");
        std::fs::write(
            &transcript,
            "{\"old\":\"https://claude.ai/code/session_stale\"}\n",
        )
        .unwrap();

        let script = dir.path().join("rc.sh");
        std::fs::write(
            &script,
            format!(
                "printf '%s\\n' '{{\"url\":\"https://claude.ai/code/session_fresh\"}}' >> '{}'\n",
                transcript.display()
            ),
        )
        .unwrap();

        let rc = RemoteControl::new(
            ProcessCommand {
                program: "sh".to_string(),
                args: vec![script.to_string_lossy().to_string()],
            },
            Duration::from_millis(10),
        );
        assert_eq!(
            rc.activate(&transcript).await.as_deref(),
            Some("https://claude.ai/code/session_fresh")
        );
    }

    #[tokio::test]
    async fn nothing_appended_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        let transcript = dir.path().join("t.jsonl");
        std::fs::write(&transcript, "{\"old\":\"https://claude.ai/code/session_stale\"}\n").unwrap();

        let rc = RemoteControl::new(ProcessCommand::new("true"), Duration::from_millis(10));
        assert_eq!(rc.activate(&transcript).await, None);
    }

    #[tokio::test]
    async fn failing_command_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        let transcript = dir.path().join("t.jsonl");
        let rc = RemoteControl::new(ProcessCommand::new("false"), Duration::from_millis(10));
        assert_eq!(rc.activate(&transcript).await, None);
    }
}
