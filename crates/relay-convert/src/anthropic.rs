// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Anthropic `/v1/messages` request shape ⇄ [`MiddleRequest`].

use anyhow::{bail, Context};
use serde_json::Value;

use crate::middle::{FunctionCall, Message, MiddleRequest, Role, ToolCall};

pub fn to_middle(body: &Value) -> anyhow::Result<MiddleRequest> {
    let model = body["model"]
        .as_str()
        .context("missing 'model'")?
        .to_string();
    let raw_messages = body["messages"]
        .as_array()
        .context("missing 'messages'")?;

    let mut messages = Vec::new();

    if let Some(system_text) = system_as_text(&body["system"]) {
        messages.push(Message::text(Role::System, system_text));
    }

    for raw in raw_messages {
        messages.extend(convert_message(raw)?);
    }

    if messages.is_empty() {
        bail!("'messages' must not be empty");
    }

    Ok(MiddleRequest {
        model,
        messages,
        temperature: body["temperature"].as_f64(),
        top_p: body["top_p"].as_f64(),
        top_k: body["top_k"].as_i64(),
        stream: body["stream"].as_bool().unwrap_or(false),
        ..Default::default()
    })
}

fn system_as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Array(parts) => {
            let joined = parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("\n");
            (!joined.is_empty()).then_some(joined)
        }
        _ => None,
    }
}

/// A single Anthropic message can expand into multiple Middle
/// messages: text blocks collapse into one message, but each
/// `tool_use`/`tool_result` block becomes its own message so tool
/// call structure survives the conversion.
fn convert_message(raw: &Value) -> anyhow::Result<Vec<Message>> {
    let role = match raw["role"].as_str().context("message missing 'role'")? {
        "user" => Role::User,
        "assistant" => Role::Assistant,
        other => bail!("unsupported role '{other}'"),
    };

    let content = &raw["content"];
    if let Value::String(text) = content {
        return Ok(vec![Message::text(role, text.clone())]);
    }

    let blocks = content.as_array().context("message content must be string or array")?;
    let mut out = Vec::new();
    let mut text_parts = Vec::new();

    for block in blocks {
        match block["type"].as_str().unwrap_or("") {
            "text" => {
                if let Some(t) = block["text"].as_str() {
                    text_parts.push(t.to_string());
                }
            }
            "tool_use" => {
                let id = block["id"].as_str().unwrap_or_default().to_string();
                let name = block["name"].as_str().unwrap_or_default().to_string();
                let arguments = block["input"].to_string();
                out.push(Message {
                    role: Role::Assistant,
                    content: String::new(),
                    name: None,
                    tool_calls: vec![ToolCall::Function {
                        id,
                        function: FunctionCall { name, arguments },
                    }],
                    tool_call_id: None,
                    reasoning_content: None,
                });
            }
            "tool_result" => {
                let tool_call_id = block["tool_use_id"].as_str().unwrap_or_default().to_string();
                let raw_content = tool_result_text(&block["content"]);

                let (content_text, tool_calls) = match serde_json::from_str::<Value>(&raw_content) {
                    Ok(_) => (
                        raw_content.clone(),
                        vec![ToolCall::Function {
                            id: tool_call_id.clone(),
                            function: FunctionCall {
                                name: "toolResult".to_string(),
                                arguments: raw_content,
                            },
                        }],
                    ),
                    Err(_) => (raw_content, Vec::new()),
                };

                out.push(Message {
                    role: Role::Tool,
                    content: content_text,
                    name: None,
                    tool_calls,
                    tool_call_id: Some(tool_call_id),
                    reasoning_content: None,
                });
            }
            _ => {}
        }
    }

    if !text_parts.is_empty() {
        out.insert(0, Message::text(role, text_parts.join("\n")));
    }

    Ok(out)
}

fn tool_result_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn system_string_becomes_system_message() {
        let body = json!({
            "model": "m",
            "system": "be nice",
            "messages": [{"role": "user", "content": "hi"}],
        });
        let mid = to_middle(&body).unwrap();
        assert_eq!(mid.messages[0].role, Role::System);
        assert_eq!(mid.messages[0].content, "be nice");
        assert_eq!(mid.messages[1].content, "hi");
    }

    #[test]
    fn tool_use_becomes_assistant_tool_call() {
        let body = json!({
            "model": "m",
            "messages": [{
                "role": "assistant",
                "content": [{"type": "tool_use", "id": "t1", "name": "search", "input": {"q": "x"}}]
            }],
        });
        let mid = to_middle(&body).unwrap();
        match &mid.messages[0].tool_calls[0] {
            ToolCall::Function { id, function } => {
                assert_eq!(id, "t1");
                assert_eq!(function.name, "search");
            }
            _ => panic!(),
        }
    }

    #[test]
    fn tool_result_with_json_content_gets_synthetic_call() {
        let body = json!({
            "model": "m",
            "messages": [{
                "role": "user",
                "content": [{"type": "tool_result", "tool_use_id": "t1", "content": "{\"ok\":true}"}]
            }],
        });
        let mid = to_middle(&body).unwrap();
        let msg = &mid.messages[0];
        assert_eq!(msg.role, Role::Tool);
        assert_eq!(msg.tool_calls.len(), 1);
        match &msg.tool_calls[0] {
            ToolCall::Function { function, .. } => assert_eq!(function.name, "toolResult"),
            _ => panic!(),
        }
    }

    #[test]
    fn tool_result_with_plain_text_keeps_text_only() {
        let body = json!({
            "model": "m",
            "messages": [{
                "role": "user",
                "content": [{"type": "tool_result", "tool_use_id": "t1", "content": "not json"}]
            }],
        });
        let mid = to_middle(&body).unwrap();
        let msg = &mid.messages[0];
        assert!(msg.tool_calls.is_empty());
        assert_eq!(msg.content, "not json");
    }
}
