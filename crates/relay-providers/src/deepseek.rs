// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! DeepSeek pure logic: prompt rendering, per-model feature flags, and
//! the completion SSE line classifier. The HTTP side lives in
//! [`crate::deepseek_adapter`].

use relay_convert::{Message, Role};
use serde::Deserialize;
use serde_json::Value;

pub const ASSISTANT_OPEN: &str = "<｜Assistant｜>";
pub const ASSISTANT_CLOSE: &str = "<｜end▁of▁sentence｜>";
pub const USER_PREFIX: &str = "<｜User｜>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelFlags {
    pub thinking_enabled: bool,
    pub search_enabled: bool,
}

/// Model → `(thinking_enabled, search_enabled)` completion flags.
pub fn flags_for_model(model: &str) -> ModelFlags {
    match model {
        "deepseek-reasoner" => ModelFlags { thinking_enabled: true, search_enabled: false },
        "deepseek-chat-search" => ModelFlags { thinking_enabled: false, search_enabled: true },
        "deepseek-reasoner-search" => ModelFlags { thinking_enabled: true, search_enabled: true },
        _ => ModelFlags { thinking_enabled: false, search_enabled: false },
    }
}

/// Merge adjacent same-role messages (joined by `\n\n`) then render
/// the DeepSeek single-prompt-string format: the first user/system
/// message is inlined raw, later ones get the user prefix marker, and
/// assistant turns are wrapped in their open/close sentinels.
pub fn prepare_prompt(messages: &[Message]) -> String {
    let merged = merge_adjacent(messages);

    let mut out = String::new();
    let mut seen_user_or_system = false;

    for (role, content, tool_call_id) in merged {
        let content = rewrite_images(&content);
        match role {
            Role::Assistant => {
                out.push_str(ASSISTANT_OPEN);
                out.push_str(&content);
                out.push_str(ASSISTANT_CLOSE);
            }
            Role::Tool => {
                let id = tool_call_id.unwrap_or_default();
                out.push_str(&format!("<|tool_outputs id={id}|>{content}"));
            }
            Role::User | Role::System => {
                if !seen_user_or_system {
                    out.push_str(&content);
                    seen_user_or_system = true;
                } else {
                    out.push_str(USER_PREFIX);
                    out.push_str(&content);
                }
            }
        }
    }

    out
}

fn merge_adjacent(messages: &[Message]) -> Vec<(Role, String, Option<String>)> {
    let mut merged: Vec<(Role, String, Option<String>)> = Vec::new();
    for m in messages {
        match merged.last_mut() {
            Some((role, content, _)) if *role == m.role => {
                content.push_str("\n\n");
                content.push_str(&m.content);
            }
            _ => merged.push((m.role, m.content.clone(), m.tool_call_id.clone())),
        }
    }
    merged
}

/// `![alt](url)` → `[alt](url)`: markdown image syntax is preserved
/// but re-emitted without the leading `!`.
fn rewrite_images(text: &str) -> String {
    let re = regex::Regex::new(r"!\[([^\]]*)\]\(([^)]*)\)").unwrap();
    re.replace_all(text, "[$1]($2)").to_string()
}

// ── Streaming transform ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum DeepSeekDelta {
    Content(String),
    Reasoning(String),
    Finished,
    Ignored,
}

#[derive(Deserialize)]
struct SseLine {
    #[serde(default)]
    p: Option<String>,
    v: Value,
}

/// Parse and classify one `data: {"p":...,"v":...}` line from the
/// DeepSeek completion SSE stream.
pub fn transform_line(data_json: &str, flags: ModelFlags) -> anyhow::Result<DeepSeekDelta> {
    let line: SseLine = serde_json::from_str(data_json)?;

    if let Some(arr) = line.v.as_array() {
        let finished = arr.iter().any(|item| {
            item.get("p").and_then(|p| p.as_str()) == Some("status")
                && item.get("v").and_then(|v| v.as_str()) == Some("FINISHED")
        });
        if finished {
            return Ok(DeepSeekDelta::Finished);
        }
        return Ok(DeepSeekDelta::Ignored);
    }

    let path = line.p.as_deref();

    if path == Some("response/search_status") {
        return Ok(DeepSeekDelta::Ignored);
    }

    if path == Some("response/thinking_content") {
        if !flags.thinking_enabled {
            return Ok(DeepSeekDelta::Ignored);
        }
        if let Some(text) = line.v.as_str() {
            return Ok(DeepSeekDelta::Reasoning(text.to_string()));
        }
        return Ok(DeepSeekDelta::Ignored);
    }

    if path.is_none() || path == Some("response/content") {
        if let Some(text) = line.v.as_str() {
            if flags.search_enabled && text.starts_with("[citation:") {
                return Ok(DeepSeekDelta::Ignored);
            }
            return Ok(DeepSeekDelta::Content(text.to_string()));
        }
    }

    Ok(DeepSeekDelta::Ignored)
}

/// Incrementally split a raw SSE byte buffer into complete `data: ...`
/// lines, returning the leftover partial buffer. Mirrors the
/// line-buffering-across-TCP-chunks pattern used for every SSE-based
/// adapter in this codebase.
pub fn drain_complete_sse_lines(buffer: &mut String) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = buffer.find("\n\n") {
        let frame: String = buffer.drain(..pos + 2).collect();
        for line in frame.lines() {
            if let Some(data) = line.strip_prefix("data: ") {
                if data != "[DONE]" {
                    lines.push(data.to_string());
                }
            }
        }
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_convert::middle::Message;

    #[test]
    fn flags_match_table() {
        assert_eq!(flags_for_model("deepseek-chat"), ModelFlags { thinking_enabled: false, search_enabled: false });
        assert_eq!(flags_for_model("deepseek-reasoner"), ModelFlags { thinking_enabled: true, search_enabled: false });
        assert_eq!(flags_for_model("deepseek-chat-search"), ModelFlags { thinking_enabled: false, search_enabled: true });
        assert_eq!(flags_for_model("deepseek-reasoner-search"), ModelFlags { thinking_enabled: true, search_enabled: true });
    }

    #[test]
    fn first_message_is_raw_subsequent_user_prefixed() {
        let messages = vec![
            Message::text(Role::User, "first"),
            Message::text(Role::Assistant, "reply"),
            Message::text(Role::User, "second"),
        ];
        let prompt = prepare_prompt(&messages);
        assert!(prompt.starts_with("first"));
        assert!(prompt.contains(&format!("{ASSISTANT_OPEN}reply{ASSISTANT_CLOSE}")));
        assert!(prompt.contains(&format!("{USER_PREFIX}second")));
    }

    #[test]
    fn adjacent_same_role_messages_merge() {
        let messages = vec![
            Message::text(Role::User, "a"),
            Message::text(Role::User, "b"),
        ];
        let prompt = prepare_prompt(&messages);
        assert_eq!(prompt, "a\n\nb");
    }

    #[test]
    fn markdown_images_lose_bang_prefix() {
        let messages = vec![Message::text(Role::User, "look ![cat](http://x/cat.png) wow")];
        let prompt = prepare_prompt(&messages);
        assert_eq!(prompt, "look [cat](http://x/cat.png) wow");
    }

    #[test]
    fn tool_message_uses_tool_outputs_tag() {
        let mut m = Message::text(Role::Tool, "result text");
        m.tool_call_id = Some("abc".to_string());
        let prompt = prepare_prompt(&[m]);
        assert_eq!(prompt, "<|tool_outputs id=abc|>result text");
    }

    #[test]
    fn content_line_then_finished_status_array() {
        let flags = flags_for_model("deepseek-chat");
        let d1 = transform_line(r#"{"p":"response/content","v":"Hello"}"#, flags).unwrap();
        assert_eq!(d1, DeepSeekDelta::Content("Hello".to_string()));

        let d2 = transform_line(r#"{"v":[{"p":"status","v":"FINISHED"}]}"#, flags).unwrap();
        assert_eq!(d2, DeepSeekDelta::Finished);
    }

    #[test]
    fn thinking_content_ignored_when_thinking_disabled() {
        let flags = flags_for_model("deepseek-chat");
        let d = transform_line(r#"{"p":"response/thinking_content","v":"hmm"}"#, flags).unwrap();
        assert_eq!(d, DeepSeekDelta::Ignored);
    }

    #[test]
    fn thinking_content_emitted_when_enabled() {
        let flags = flags_for_model("deepseek-reasoner");
        let d = transform_line(r#"{"p":"response/thinking_content","v":"hmm"}"#, flags).unwrap();
        assert_eq!(d, DeepSeekDelta::Reasoning("hmm".to_string()));
    }

    #[test]
    fn search_status_is_always_ignored() {
        let flags = flags_for_model("deepseek-chat-search");
        let d = transform_line(r#"{"p":"response/search_status","v":"searching"}"#, flags).unwrap();
        assert_eq!(d, DeepSeekDelta::Ignored);
    }

    #[test]
    fn citation_fragments_dropped_when_search_enabled() {
        let flags = flags_for_model("deepseek-chat-search");
        let d = transform_line(r#"{"p":"response/content","v":"[citation:1]"}"#, flags).unwrap();
        assert_eq!(d, DeepSeekDelta::Ignored);
    }

    #[test]
    fn drain_complete_sse_lines_handles_partial_chunks() {
        let mut buffer = String::from("data: {\"p\":\"response/content\",\"v\":\"He");
        assert!(drain_complete_sse_lines(&mut buffer).is_empty());
        buffer.push_str("llo\"}\n\n");
        let lines = drain_complete_sse_lines(&mut buffer);
        assert_eq!(lines, vec![r#"{"p":"response/content","v":"Hello"}"#.to_string()]);
        assert!(buffer.is_empty());
    }
}
