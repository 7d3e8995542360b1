// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Gemini `generateContent`/`streamGenerateContent` request shape ⇄
//! [`MiddleRequest`].

use anyhow::{bail, Context};
use serde_json::{json, Value};

use crate::middle::{
    FunctionCall, InlineData, Message, MiddleRequest, NamedFunction, Role, ToolCall, ToolChoice,
    ToolChoiceMode,
};

pub fn to_middle(model: &str, body: &Value, force_stream: bool) -> anyhow::Result<MiddleRequest> {
    let mut messages = Vec::new();

    if let Some(text) = parts_text(&body["systemInstruction"]["parts"]) {
        messages.push(Message::text(Role::System, text));
    }

    let contents = body["contents"].as_array().context("missing 'contents'")?;
    for content in contents {
        let role = match content["role"].as_str().unwrap_or("user") {
            "model" => Role::Assistant,
            _ => Role::User,
        };
        let parts = content["parts"].as_array().context("content missing 'parts'")?;
        for part in parts {
            messages.push(convert_part(role, part)?);
        }
    }

    if messages.is_empty() {
        bail!("'contents' must not be empty");
    }

    let generation_config = &body["generationConfig"];

    Ok(MiddleRequest {
        model: model.to_string(),
        messages,
        temperature: generation_config["temperature"].as_f64(),
        top_p: generation_config["topP"].as_f64(),
        top_k: generation_config["topK"].as_i64(),
        stream: force_stream,
        tools: body.get("tools").cloned(),
        tool_choice: convert_tool_config(&body["toolConfig"]),
        ..Default::default()
    })
}

fn convert_part(role: Role, part: &Value) -> anyhow::Result<Message> {
    if let Some(text) = part["text"].as_str() {
        return Ok(Message::text(role, text.to_string()));
    }

    if let Some(inline) = part.get("inlineData") {
        let mime_type = inline["mimeType"].as_str().unwrap_or_default().to_string();
        let data = inline["data"].as_str().unwrap_or_default().to_string();
        return Ok(Message {
            role: Role::Assistant,
            content: String::new(),
            name: None,
            tool_calls: vec![ToolCall::InlineData {
                id: "inline-0".to_string(),
                inline_data: InlineData { mime_type, data },
            }],
            tool_call_id: None,
            reasoning_content: None,
        });
    }

    if let Some(call) = part.get("functionCall") {
        let name = call["name"].as_str().unwrap_or_default().to_string();
        let arguments = call["args"].to_string();
        return Ok(Message {
            role: Role::Assistant,
            content: String::new(),
            name: None,
            tool_calls: vec![ToolCall::Function {
                id: format!("call-{name}"),
                function: FunctionCall { name, arguments },
            }],
            tool_call_id: None,
            reasoning_content: None,
        });
    }

    if let Some(response) = part.get("functionResponse") {
        let name = response["name"].as_str().unwrap_or_default().to_string();
        let content = response["response"].to_string();
        return Ok(Message {
            role: Role::Tool,
            content,
            name: Some(name.clone()),
            tool_calls: Vec::new(),
            tool_call_id: Some(name),
            reasoning_content: None,
        });
    }

    bail!("unrecognized Gemini part shape");
}

fn parts_text(parts: &Value) -> Option<String> {
    let arr = parts.as_array()?;
    let joined = arr
        .iter()
        .filter_map(|p| p["text"].as_str())
        .collect::<Vec<_>>()
        .join("\n");
    (!joined.is_empty()).then_some(joined)
}

fn convert_tool_config(tool_config: &Value) -> Option<ToolChoice> {
    let mode = tool_config["functionCallingConfig"]["mode"].as_str()?;
    let allowed = tool_config["functionCallingConfig"]["allowedFunctionNames"].as_array();

    match mode {
        "NONE" => Some(ToolChoice::Mode(ToolChoiceMode::None)),
        "AUTO" => Some(ToolChoice::Mode(ToolChoiceMode::Auto)),
        "ANY" => {
            if let Some(names) = allowed {
                if names.len() == 1 {
                    if let Some(name) = names[0].as_str() {
                        return Some(ToolChoice::Named {
                            r#type: "function".to_string(),
                            function: NamedFunction {
                                name: name.to_string(),
                            },
                        });
                    }
                }
            }
            Some(ToolChoice::Mode(ToolChoiceMode::Required))
        }
        _ => None,
    }
}

/// OpenAI → Gemini response conversion is provided by
/// `Aggregated::to_gemini_completion` in [`crate::response`]; this
/// helper only builds the error envelope Gemini clients expect.
pub fn error_envelope(status: u16, message: &str) -> Value {
    json!({ "error": { "code": status, "message": message, "status": "INTERNAL" } })
}
