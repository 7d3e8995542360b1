// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Streaming response events shared by every provider adapter, plus
//! SSE aggregation and the Gemini/Anthropic re-wrap helpers.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// One incremental event an adapter emits while streaming a
/// completion. The dispatcher translates these into OpenAI SSE bytes,
/// and either forwards them verbatim (stream) or aggregates them into
/// a single JSON body (non-stream).
#[derive(Debug, Clone)]
pub enum ResponseEvent {
    /// First non-empty delta only: announces the assistant role.
    RoleAssistant,
    ContentDelta(String),
    ReasoningDelta(String),
    /// Terminal event: finish reason plus whatever usage was observed.
    Done {
        finish_reason: String,
        usage: Option<Usage>,
    },
}

/// An OpenAI-shaped `chat.completion.chunk` SSE payload, serialized
/// exactly as upstream-compatible clients expect it.
#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: ChunkDelta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ChunkDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
}

/// Render one [`ResponseEvent`] as a complete `data: …\n\n` SSE frame
/// (or `None` for events that don't produce a wire frame on their
/// own, i.e. [`ResponseEvent::RoleAssistant`] which is folded into the
/// next content delta by the caller).
pub fn render_chunk(
    id: &str,
    created: i64,
    model: &str,
    role_sent: &mut bool,
    event: &ResponseEvent,
) -> String {
    let mut delta = ChunkDelta::default();
    let mut finish_reason = None;
    let mut usage = None;

    if !*role_sent {
        delta.role = Some("assistant");
        *role_sent = true;
    }

    match event {
        ResponseEvent::RoleAssistant => {}
        ResponseEvent::ContentDelta(text) => delta.content = Some(text.clone()),
        ResponseEvent::ReasoningDelta(text) => delta.reasoning_content = Some(text.clone()),
        ResponseEvent::Done {
            finish_reason: fr,
            usage: u,
        } => {
            finish_reason = Some(fr.clone());
            usage = u.clone();
        }
    }

    let chunk = ChatCompletionChunk {
        id: id.to_string(),
        object: "chat.completion.chunk",
        created,
        model: model.to_string(),
        choices: vec![ChunkChoice {
            index: 0,
            delta,
            finish_reason,
        }],
        usage,
    };

    format!("data: {}\n\n", serde_json::to_string(&chunk).unwrap())
}

pub const DONE_FRAME: &str = "data: [DONE]\n\n";

/// The fully aggregated result of a non-streaming request:
/// `delta.content` and `delta.reasoning_content` concatenated in
/// stream order, keeping the final `finish_reason`, `usage`, `id`,
/// and `model` observed on the stream.
#[derive(Debug, Clone, Default)]
pub struct Aggregated {
    pub id: String,
    pub model: String,
    pub content: String,
    pub reasoning_content: String,
    pub finish_reason: String,
    pub usage: Option<Usage>,
}

impl Aggregated {
    pub fn new(id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            ..Default::default()
        }
    }

    pub fn apply(&mut self, event: &ResponseEvent) {
        match event {
            ResponseEvent::RoleAssistant => {}
            ResponseEvent::ContentDelta(text) => self.content.push_str(text),
            ResponseEvent::ReasoningDelta(text) => self.reasoning_content.push_str(text),
            ResponseEvent::Done {
                finish_reason,
                usage,
            } => {
                self.finish_reason = finish_reason.clone();
                self.usage = usage.clone();
            }
        }
    }

    pub fn to_openai_completion(&self, created: i64) -> Value {
        let mut message = json!({
            "role": "assistant",
            "content": self.content,
        });
        if !self.reasoning_content.is_empty() {
            message["reasoning_content"] = json!(self.reasoning_content);
        }

        json!({
            "id": self.id,
            "object": "chat.completion",
            "created": created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "message": message,
                "finish_reason": self.finish_reason,
            }],
            "usage": self.usage,
        })
    }

    pub fn to_gemini_completion(&self) -> Value {
        json!({
            "candidates": [{
                "content": { "role": "model", "parts": [{ "text": self.content }] },
                "finishReason": "STOP",
                "index": 0,
            }],
            "usageMetadata": {
                "promptTokenCount": self.usage.as_ref().map(|u| u.prompt_tokens).unwrap_or(0),
                "candidatesTokenCount": self.usage.as_ref().map(|u| u.completion_tokens).unwrap_or(0),
                "totalTokenCount": self.usage.as_ref().map(|u| u.total_tokens).unwrap_or(0),
            },
            "modelVersion": self.model,
        })
    }

    pub fn to_anthropic_completion(&self) -> Value {
        json!({
            "id": self.id,
            "type": "message",
            "role": "assistant",
            "model": self.model,
            "content": [{ "type": "text", "text": self.content }],
            "stop_reason": anthropic_stop_reason(&self.finish_reason),
            "stop_sequence": Value::Null,
            "usage": {
                "input_tokens": self.usage.as_ref().map(|u| u.prompt_tokens).unwrap_or(0),
                "output_tokens": self.usage.as_ref().map(|u| u.completion_tokens).unwrap_or(0),
            },
        })
    }
}

fn anthropic_stop_reason(openai_finish_reason: &str) -> &'static str {
    match openai_finish_reason {
        "length" => "max_tokens",
        "tool_calls" => "tool_use",
        _ => "end_turn",
    }
}

/// Rewrap a single OpenAI `chat.completion.chunk` JSON value as a
/// Gemini `streamGenerateContent` SSE frame.
pub fn openai_chunk_to_gemini_sse(chunk: &Value) -> String {
    let text = chunk["choices"][0]["delta"]["content"]
        .as_str()
        .unwrap_or("");
    let model = chunk["model"].as_str().unwrap_or("");

    let frame = json!({
        "candidates": [{
            "content": { "role": "model", "parts": [{ "text": text }] },
            "index": 0,
        }],
        "modelVersion": model,
    });

    format!("data: {}\n\n", serde_json::to_string(&frame).unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_chunk_sets_role_exactly_once() {
        let mut role_sent = false;
        let first = render_chunk("id", 0, "m", &mut role_sent, &ResponseEvent::ContentDelta("hi".into()));
        assert!(first.contains("\"role\":\"assistant\""));
        assert!(role_sent);

        let second = render_chunk("id", 0, "m", &mut role_sent, &ResponseEvent::ContentDelta(" there".into()));
        assert!(!second.contains("\"role\""));
    }

    #[test]
    fn aggregation_concatenates_content_and_reasoning() {
        let mut agg = Aggregated::new("id1", "deepseek-chat");
        agg.apply(&ResponseEvent::ReasoningDelta("think...".into()));
        agg.apply(&ResponseEvent::ContentDelta("Hel".into()));
        agg.apply(&ResponseEvent::ContentDelta("lo".into()));
        agg.apply(&ResponseEvent::Done {
            finish_reason: "stop".into(),
            usage: Some(Usage::new(1, 2)),
        });

        assert_eq!(agg.content, "Hello");
        assert_eq!(agg.reasoning_content, "think...");
        assert_eq!(agg.finish_reason, "stop");

        let completion = agg.to_openai_completion(0);
        assert_eq!(completion["choices"][0]["message"]["content"], "Hello");
    }

    #[test]
    fn gemini_sse_rewrap_carries_text_and_model() {
        let chunk = json!({"choices": [{"delta": {"content": "hi"}}], "model": "m"});
        let frame = openai_chunk_to_gemini_sse(&chunk);
        assert!(frame.contains("\"text\":\"hi\""));
        assert!(frame.contains("\"modelVersion\":\"m\""));
    }

    #[test]
    fn gemini_non_stream_shape() {
        let mut agg = Aggregated::new("id1", "m");
        agg.apply(&ResponseEvent::ContentDelta("hi".into()));
        let v = agg.to_gemini_completion();
        assert_eq!(v["candidates"][0]["content"]["parts"][0]["text"], "hi");
        assert_eq!(v["candidates"][0]["finishReason"], "STOP");
    }

    #[test]
    fn anthropic_non_stream_shape() {
        let mut agg = Aggregated::new("id1", "m");
        agg.apply(&ResponseEvent::ContentDelta("hi".into()));
        agg.apply(&ResponseEvent::Done { finish_reason: "stop".into(), usage: None });
        let v = agg.to_anthropic_completion();
        assert_eq!(v["content"][0]["text"], "hi");
        assert_eq!(v["stop_reason"], "end_turn");
    }
}
