// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! OpenAI `/v1/chat/completions` request shape ⇄ [`MiddleRequest`].

use anyhow::{bail, Context};
use serde_json::Value;

use crate::middle::{
    FunctionCall, Message, MiddleRequest, NamedFunction, Role, ToolCall, ToolChoice,
    ToolChoiceMode,
};

pub fn to_middle(body: &Value) -> anyhow::Result<MiddleRequest> {
    let model = body["model"]
        .as_str()
        .context("missing 'model'")?
        .to_string();
    let raw_messages = body["messages"]
        .as_array()
        .context("missing 'messages'")?;

    if raw_messages.is_empty() {
        bail!("'messages' must not be empty");
    }

    let mut messages = Vec::with_capacity(raw_messages.len());
    for raw in raw_messages {
        messages.push(convert_message(raw)?);
    }

    Ok(MiddleRequest {
        model,
        messages,
        temperature: body["temperature"].as_f64(),
        top_p: body["top_p"].as_f64(),
        top_k: body["top_k"].as_i64(),
        n: body["n"].as_u64().map(|n| n as u32),
        stream: body["stream"].as_bool().unwrap_or(false),
        presence_penalty: body["presence_penalty"].as_f64(),
        frequency_penalty: body["frequency_penalty"].as_f64(),
        tools: body.get("tools").cloned(),
        tool_choice: convert_tool_choice(&body["tool_choice"]),
        seed: body["seed"].as_i64(),
        reasoning_effort: body["reasoning_effort"].as_str().map(str::to_string),
    })
}

fn convert_tool_choice(value: &Value) -> Option<ToolChoice> {
    match value {
        Value::String(mode) => match mode.as_str() {
            "none" => Some(ToolChoice::Mode(ToolChoiceMode::None)),
            "auto" => Some(ToolChoice::Mode(ToolChoiceMode::Auto)),
            "required" => Some(ToolChoice::Mode(ToolChoiceMode::Required)),
            _ => None,
        },
        Value::Object(_) => {
            let name = value["function"]["name"].as_str()?;
            Some(ToolChoice::Named {
                r#type: "function".to_string(),
                function: NamedFunction { name: name.to_string() },
            })
        }
        _ => None,
    }
}

fn convert_message(raw: &Value) -> anyhow::Result<Message> {
    let role = match raw["role"].as_str().context("message missing 'role'")? {
        "system" => Role::System,
        "user" => Role::User,
        "assistant" => Role::Assistant,
        "tool" => Role::Tool,
        other => bail!("unsupported role '{other}'"),
    };

    let content = match &raw["content"] {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    };

    let mut tool_calls = Vec::new();
    if let Some(calls) = raw["tool_calls"].as_array() {
        for call in calls {
            let id = call["id"].as_str().unwrap_or_default().to_string();
            let name = call["function"]["name"].as_str().unwrap_or_default().to_string();
            let arguments = call["function"]["arguments"]
                .as_str()
                .unwrap_or("{}")
                .to_string();
            tool_calls.push(ToolCall::Function {
                id,
                function: FunctionCall { name, arguments },
            });
        }
    }

    Ok(Message {
        role,
        content,
        name: raw["name"].as_str().map(str::to_string),
        tool_calls,
        tool_call_id: raw["tool_call_id"].as_str().map(str::to_string),
        reasoning_content: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn simple_text_request_converts() {
        let body = json!({
            "model": "deepseek-chat",
            "messages": [{"role": "user", "content": "hi"}],
            "stream": false,
        });
        let mid = to_middle(&body).unwrap();
        assert_eq!(mid.model, "deepseek-chat");
        assert_eq!(mid.messages.len(), 1);
        assert_eq!(mid.messages[0].content, "hi");
        assert!(!mid.stream);
    }

    #[test]
    fn multimodal_text_parts_are_joined() {
        let body = json!({
            "model": "m",
            "messages": [{"role": "user", "content": [{"type":"text","text":"a"},{"type":"text","text":"b"}]}],
        });
        let mid = to_middle(&body).unwrap();
        assert_eq!(mid.messages[0].content, "a\nb");
    }

    #[test]
    fn tool_calls_preserved_structurally() {
        let body = json!({
            "model": "m",
            "messages": [{
                "role": "assistant",
                "content": "",
                "tool_calls": [{"id": "c1", "type": "function", "function": {"name": "foo", "arguments": "{}"}}]
            }],
        });
        let mid = to_middle(&body).unwrap();
        match &mid.messages[0].tool_calls[0] {
            ToolCall::Function { id, function } => {
                assert_eq!(id, "c1");
                assert_eq!(function.name, "foo");
            }
            _ => panic!("expected function tool call"),
        }
    }

    #[test]
    fn tool_choice_string_and_named_forms_convert() {
        let body = json!({
            "model": "m",
            "messages": [{"role": "user", "content": "hi"}],
            "tool_choice": "auto",
        });
        let mid = to_middle(&body).unwrap();
        assert!(matches!(mid.tool_choice, Some(ToolChoice::Mode(ToolChoiceMode::Auto))));

        let body = json!({
            "model": "m",
            "messages": [{"role": "user", "content": "hi"}],
            "tool_choice": {"type": "function", "function": {"name": "search"}},
        });
        let mid = to_middle(&body).unwrap();
        match mid.tool_choice {
            Some(ToolChoice::Named { function, .. }) => assert_eq!(function.name, "search"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn missing_model_is_an_error() {
        let body = json!({"messages": [{"role": "user", "content": "hi"}]});
        assert!(to_middle(&body).is_err());
    }

    #[test]
    fn empty_messages_is_an_error() {
        let body = json!({"model": "m", "messages": []});
        assert!(to_middle(&body).is_err());
    }
}
