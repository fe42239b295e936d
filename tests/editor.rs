mod support;

use std::time::Duration;

use session_relay::{
    editor::{
        EditorConfig, EditorPhase, ThrottledEditor, FAILURE_TEXT, NO_RESPONSE_TEXT,
        PLACEHOLDER_TEXT, STOPPED_TEXT,
    },
    registry::SessionRegistry,
    session::Session,
};
use support::{RecordingChat, ScriptedSource};

const CHAT: i64 = 42;
const OWNER: i64 = 7;

fn config(interval_ms: u64, min_growth: usize, max_len: usize) -> EditorConfig {
    EditorConfig {
        interval: Duration::from_millis(interval_ms),
        min_growth,
        max_len,
    }
}

fn registry_with_owner() -> SessionRegistry {
    let registry = SessionRegistry::new();
    registry.put(OWNER, Session::new("Stop", "abc", "/repo/proj", "/tmp/t.jsonl"));
    registry
}

#[tokio::test(start_paused = true)]
async fn interim_edits_respect_interval_and_final_flush_is_unconditional() {
    let chat = RecordingChat::new();
    let registry = registry_with_owner();
    let chunk = "a".repeat(25);
    let steps: Vec<(u64, &str)> = (1..=10).map(|n| (n * 200, chunk.as_str())).collect();
    let mut source = ScriptedSource::new(&steps);

    let mut editor = ThrottledEditor::start(&chat, &registry, config(1500, 20, 4000), CHAT, OWNER)
        .await
        .unwrap();
    assert_eq!(editor.phase(), EditorPhase::Idle);
    let report = editor.run(&mut source).await.unwrap();

    let edits = chat.edits();
    assert_eq!(report.phase, EditorPhase::Done);
    assert_eq!(report.final_text, chunk.repeat(10));
    assert_eq!(edits.last().unwrap().text, report.final_text);

    let interim = &edits[..edits.len() - 1];
    assert_eq!(interim.len(), report.interim_edits);
    assert!(report.interim_edits >= 1);
    for pair in interim.windows(2) {
        assert!(
            pair[1].at - pair[0].at >= Duration::from_millis(1500),
            "interim edits {:?} apart",
            pair[1].at - pair[0].at
        );
    }

    let lengths: Vec<usize> = edits.iter().map(|edit| edit.text.len()).collect();
    assert!(lengths.windows(2).all(|pair| pair[0] <= pair[1]));
    assert!(edits.iter().all(|edit| edit.message_id == report.message_id));
}

#[tokio::test(start_paused = true)]
async fn small_output_is_only_flushed_at_completion() {
    let chat = RecordingChat::new();
    let registry = registry_with_owner();
    let mut source = ScriptedSource::new(&[(10, "Hi"), (20, " there")]);

    let mut editor = ThrottledEditor::start(&chat, &registry, config(1500, 20, 4000), CHAT, OWNER)
        .await
        .unwrap();
    let report = editor.run(&mut source).await.unwrap();

    let edits = chat.edits();
    assert_eq!(edits.len(), 1);
    assert_eq!(edits[0].text, "Hi there");
    assert_eq!(report.interim_edits, 0);
}

#[tokio::test(start_paused = true)]
async fn placeholder_is_sent_and_mapped_to_owner() {
    let chat = RecordingChat::new();
    let registry = registry_with_owner();

    let editor = ThrottledEditor::start(&chat, &registry, EditorConfig::default(), CHAT, OWNER)
        .await
        .unwrap();

    let sent = chat.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].message.text, PLACEHOLDER_TEXT);
    assert_eq!(sent[0].message.chat_id, CHAT);
    assert_eq!(registry.resolve_owner(editor.message_id()), Some(OWNER));
}

#[tokio::test(start_paused = true)]
async fn overflow_is_split_into_mapped_follow_ups() {
    let chat = RecordingChat::new();
    let registry = registry_with_owner();
    let text = "0123456789abcdefghijKLMNO";
    let mut source = ScriptedSource::new(&[(5, text)]);

    let mut editor = ThrottledEditor::start(&chat, &registry, config(1500, 100, 10), CHAT, OWNER)
        .await
        .unwrap();
    let report = editor.run(&mut source).await.unwrap();

    let edits = chat.successful_edits();
    assert_eq!(edits.len(), 1);
    assert_eq!(edits[0].text, "0123456789");

    let follow_ups: Vec<String> = chat
        .sent()
        .into_iter()
        .skip(1)
        .map(|sent| sent.message.text)
        .collect();
    assert_eq!(follow_ups, vec!["abcdefghij", "KLMNO"]);
    assert_eq!(format!("{}{}", edits[0].text, follow_ups.concat()), text);

    assert_eq!(report.follow_ups.len(), 2);
    for id in &report.follow_ups {
        assert_eq!(registry.resolve_owner(*id), Some(OWNER));
    }
}

#[tokio::test(start_paused = true)]
async fn interim_edit_stops_growing_once_limit_is_shown() {
    let chat = RecordingChat::new();
    let registry = registry_with_owner();
    let first = "x".repeat(30);
    let second = "y".repeat(30);
    let mut source = ScriptedSource::new(&[(5, first.as_str()), (3000, second.as_str())]);

    let mut editor = ThrottledEditor::start(&chat, &registry, config(1500, 20, 10), CHAT, OWNER)
        .await
        .unwrap();
    let report = editor.run(&mut source).await.unwrap();

    // One interim edit shows the clipped prefix; later growth changes nothing visible.
    let edits = chat.edits();
    assert_eq!(edits.len(), 1);
    assert_eq!(edits[0].text, "x".repeat(10));
    assert_eq!(report.interim_edits, 1);
    assert_eq!(report.follow_ups.len(), 5);
}

#[tokio::test(start_paused = true)]
async fn empty_stream_shows_error_text() {
    let chat = RecordingChat::new();
    let registry = registry_with_owner();
    let mut source = ScriptedSource::failing(Some("session not found"));

    let mut editor = ThrottledEditor::start(&chat, &registry, EditorConfig::default(), CHAT, OWNER)
        .await
        .unwrap();
    editor.run(&mut source).await.unwrap();

    let edits = chat.edits();
    assert_eq!(edits.len(), 1);
    assert_eq!(edits[0].text, "session not found");
}

#[tokio::test(start_paused = true)]
async fn empty_stream_without_stderr_uses_fallback() {
    let chat = RecordingChat::new();
    let registry = registry_with_owner();
    let mut source = ScriptedSource::failing(None);

    let mut editor = ThrottledEditor::start(&chat, &registry, EditorConfig::default(), CHAT, OWNER)
        .await
        .unwrap();
    editor.run(&mut source).await.unwrap();

    assert_eq!(chat.edits().last().unwrap().text, NO_RESPONSE_TEXT);
}

#[tokio::test(start_paused = true)]
async fn killed_before_any_text_says_stopped() {
    let chat = RecordingChat::new();
    let registry = registry_with_owner();
    let mut source = ScriptedSource::killed();

    let mut editor = ThrottledEditor::start(&chat, &registry, EditorConfig::default(), CHAT, OWNER)
        .await
        .unwrap();
    let report = editor.run(&mut source).await.unwrap();

    assert_eq!(report.final_text, STOPPED_TEXT);
    let edits = chat.edits();
    assert_eq!(edits.len(), 1);
    assert_eq!(edits[0].text, STOPPED_TEXT);
    assert_ne!(edits[0].text, NO_RESPONSE_TEXT);
}

#[tokio::test(start_paused = true)]
async fn failed_follow_up_send_is_reported() {
    let chat = RecordingChat::new();
    // placeholder is send #1, the first follow-up is send #2
    chat.fail_nth_send(2, 500, "Internal Server Error");
    let registry = registry_with_owner();
    let mut source = ScriptedSource::new(&[(5, "0123456789abcdefghij")]);

    let mut editor = ThrottledEditor::start(&chat, &registry, config(1500, 100, 10), CHAT, OWNER)
        .await
        .unwrap();
    let error = editor.run(&mut source).await.unwrap_err();
    assert!(!error.is_not_modified());

    let texts: Vec<String> = chat.successful_edits().into_iter().map(|e| e.text).collect();
    assert_eq!(texts, vec!["0123456789"]);
    assert_eq!(chat.sent().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn rate_limited_edit_backs_off_and_stream_continues() {
    let chat = RecordingChat::new();
    chat.fail_next_edit(429, "Too Many Requests: retry after 2", Some(2));
    let registry = registry_with_owner();
    let chunk = "b".repeat(25);
    let mut source = ScriptedSource::new(&[
        (10, chunk.as_str()),
        (500, chunk.as_str()),
        (3000, chunk.as_str()),
    ]);

    let mut editor = ThrottledEditor::start(&chat, &registry, config(1500, 20, 4000), CHAT, OWNER)
        .await
        .unwrap();
    let report = editor.run(&mut source).await.unwrap();

    let edits = chat.edits();
    assert!(!edits[0].ok);
    assert!(edits[1].ok);
    assert!(edits[1].at - edits[0].at >= Duration::from_secs(2));
    assert_eq!(edits.last().unwrap().text, chunk.repeat(3));
    assert_eq!(report.final_text, chunk.repeat(3));
}

#[tokio::test(start_paused = true)]
async fn edit_failures_never_abort_consumption() {
    let chat = RecordingChat::new();
    chat.fail_all_edits(400, "Bad Request: message to edit not found");
    let registry = registry_with_owner();
    let chunk = "c".repeat(25);
    let mut source = ScriptedSource::new(&[(10, chunk.as_str()), (2000, chunk.as_str())]);

    let mut editor = ThrottledEditor::start(&chat, &registry, config(1500, 20, 4000), CHAT, OWNER)
        .await
        .unwrap();
    let report = editor.run(&mut source).await.unwrap();

    assert_eq!(report.final_text, chunk.repeat(2));
    assert_eq!(report.phase, EditorPhase::Done);
    assert!(chat.edits().iter().all(|edit| !edit.ok));
}

#[tokio::test(start_paused = true)]
async fn fail_posts_error_notice() {
    let chat = RecordingChat::new();
    let registry = registry_with_owner();
    let mut editor = ThrottledEditor::start(&chat, &registry, EditorConfig::default(), CHAT, OWNER)
        .await
        .unwrap();

    editor.fail().await;

    assert_eq!(editor.phase(), EditorPhase::Done);
    let edits = chat.edits();
    assert_eq!(edits.len(), 1);
    assert_eq!(edits[0].text, FAILURE_TEXT);
}
