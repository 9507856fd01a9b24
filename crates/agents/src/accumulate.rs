//! Tool-call fragment accumulation.
//!
//! Streaming backends deliver tool calls as incremental deltas keyed by
//! `index`, each carrying a piece of the id, name, or JSON-encoded argument
//! string. Fragments are concatenated per index and parsed once the stream
//! ends.

use std::collections::BTreeMap;

use crate::model::{ToolCall, ToolCallFragment};

#[derive(Default)]
struct Partial {
    id: String,
    name: String,
    arguments: String,
}

/// Merges [`ToolCallFragment`]s by index and drains them as complete
/// [`ToolCall`]s in index order.
#[derive(Default)]
pub struct ToolCallAccumulator {
    partials: BTreeMap<usize, Partial>,
}

impl ToolCallAccumulator {
    pub fn push(&mut self, fragment: ToolCallFragment) {
        let partial = self.partials.entry(fragment.index).or_default();
        if let Some(id) = fragment.id {
            partial.id.push_str(&id);
        }
        if let Some(name) = fragment.name {
            partial.name.push_str(&name);
        }
        if let Some(args) = fragment.arguments {
            partial.arguments.push_str(&args);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.partials.is_empty()
    }

    /// Finalize all partials, in index order. Calls without a usable name are
    /// dropped; unparseable argument strings fall back to `{}` so the model
    /// can self-correct on the next turn.
    pub fn drain(&mut self) -> Vec<ToolCall> {
        let partials = std::mem::take(&mut self.partials);
        partials
            .into_values()
            .filter(|p| !p.name.is_empty())
            .map(|p| ToolCall {
                id: if p.id.is_empty() {
                    synthetic_call_id()
                } else {
                    p.id
                },
                name: p.name,
                arguments: parse_arguments(&p.arguments),
            })
            .collect()
    }
}

/// Parse an accumulated argument string, salvaging trailing commas before
/// giving up and substituting `{}`.
pub fn parse_arguments(raw: &str) -> serde_json::Value {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return serde_json::json!({});
    }
    if let Ok(v) = serde_json::from_str(trimmed) {
        return v;
    }
    // Small models produce trailing commas; strip them and retry once.
    let repaired = strip_trailing_commas(trimmed);
    serde_json::from_str(&repaired).unwrap_or_else(|_| serde_json::json!({}))
}

fn strip_trailing_commas(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_string = false;
    let mut escaped = false;
    let mut chars = input.chars().peekable();
    while let Some(ch) = chars.next() {
        if in_string {
            out.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => {
                in_string = true;
                out.push(ch);
            },
            ',' => {
                // Drop the comma when the next non-whitespace char closes a
                // container.
                let mut lookahead = chars.clone();
                let next = loop {
                    match lookahead.next() {
                        Some(c) if c.is_whitespace() => continue,
                        other => break other,
                    }
                };
                if !matches!(next, Some('}') | Some(']')) {
                    out.push(ch);
                }
            },
            _ => out.push(ch),
        }
    }
    out
}

fn synthetic_call_id() -> String {
    format!("call_{}", uuid::Uuid::new_v4().simple())
}
