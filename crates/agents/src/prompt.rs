//! Prompt assembly: session history → backend messages.

use sluice_sessions::{HistoryEntry, Role};

use crate::model::ChatMessage;

/// Flatten stored history into backend messages. Thinking and tool-call
/// parts are not replayed; the text blocks are what the model sees again.
pub fn history_to_messages(history: &[HistoryEntry]) -> Vec<ChatMessage> {
    history
        .iter()
        .filter_map(|entry| {
            let text = entry.text();
            if text.is_empty() {
                return None;
            }
            Some(match entry.role {
                Role::User => ChatMessage::user(text),
                Role::Assistant => ChatMessage::assistant(text),
            })
        })
        .collect()
}

/// Build the full prompt: optional system message, history, and the run
/// message guaranteed to be the trailing user turn.
pub fn build_messages(
    system_prompt: Option<&str>,
    history: &[HistoryEntry],
    run_message: &str,
) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len() + 2);
    if let Some(system) = system_prompt
        && !system.trim().is_empty()
    {
        messages.push(ChatMessage::system(system));
    }
    messages.extend(history_to_messages(history));
    ensure_last_is_user(&mut messages, run_message);
    messages
}

/// The run message is normally the final history entry already; when history
/// was trimmed or injected out from under the run, append it explicitly.
fn ensure_last_is_user(messages: &mut Vec<ChatMessage>, run_message: &str) {
    let last_is_run_message = messages
        .last()
        .map(|m| matches!(m.role, crate::model::MessageRole::User) && m.content == run_message)
        .unwrap_or(false);
    if !last_is_run_message {
        messages.push(ChatMessage::user(run_message));
    }
}
