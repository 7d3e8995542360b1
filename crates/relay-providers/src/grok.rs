// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Grok pure logic: the model table, token ranking algorithm, Statsig
//! header generation, payload construction, and the NDJSON streaming
//! classifier.
//!
//! Everything here is synchronous and side-effect free; [`crate::grok_adapter`]
//! owns the HTTP calls, retries, and media caching built on top of it.

use base64::Engine;
use rand::Rng;
use relay_store::GrokTokenEntry;
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy)]
pub struct GrokModelEntry {
    pub id: &'static str,
    pub grok_model: &'static str,
    pub model_mode: &'static str,
    pub rate_limit_model_id: &'static str,
    pub cost_multiplier: f64,
    pub requires_super: bool,
}

pub const GROK_MODELS: &[GrokModelEntry] = &[
    GrokModelEntry { id: "grok-3", grok_model: "grok-3", model_mode: "MODEL_MODE_GROK_3", rate_limit_model_id: "grok-3", cost_multiplier: 1.0, requires_super: false },
    GrokModelEntry { id: "grok-3-fast", grok_model: "grok-3", model_mode: "MODEL_MODE_FAST", rate_limit_model_id: "grok-3", cost_multiplier: 1.0, requires_super: false },
    GrokModelEntry { id: "grok-3-mini", grok_model: "grok-3", model_mode: "MODEL_MODE_MINI", rate_limit_model_id: "grok-3", cost_multiplier: 0.2, requires_super: false },
    GrokModelEntry { id: "grok-3-mini-fast", grok_model: "grok-3", model_mode: "MODEL_MODE_MINI_FAST", rate_limit_model_id: "grok-3", cost_multiplier: 0.2, requires_super: false },
    GrokModelEntry { id: "grok-4", grok_model: "grok-4", model_mode: "MODEL_MODE_GROK_4", rate_limit_model_id: "grok-4", cost_multiplier: 1.0, requires_super: false },
    GrokModelEntry { id: "grok-4-fast", grok_model: "grok-4", model_mode: "MODEL_MODE_FAST", rate_limit_model_id: "grok-4", cost_multiplier: 1.0, requires_super: false },
    GrokModelEntry { id: "grok-4-heavy", grok_model: "grok-4", model_mode: "MODEL_MODE_HEAVY", rate_limit_model_id: "grok-4-heavy", cost_multiplier: 4.0, requires_super: true },
    GrokModelEntry { id: "grok-imagine-0.9", grok_model: "grok-imagine", model_mode: "MODEL_MODE_GROK_3", rate_limit_model_id: "grok-imagine-0.9", cost_multiplier: 1.0, requires_super: false },
];

pub fn model_entry(model_id: &str) -> Option<&'static GrokModelEntry> {
    GROK_MODELS.iter().find(|m| m.id == model_id)
}

pub fn is_heavy(model_id: &str) -> bool {
    model_id == "grok-4-heavy"
}

// ── Token ranking ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RankCandidate {
    pub sso: String,
    pub tier_super: bool,
    pub field: i64,
}

/// Partition eligible entries by tier and "quota known", and order
/// `normal.unused → normal.used(desc) → super.unused → super.used(desc)`.
/// Heavy requests ignore the normal tier entirely.
pub fn rank_tokens(
    normal: &[(String, GrokTokenEntry)],
    super_tier: &[(String, GrokTokenEntry)],
    heavy: bool,
) -> Vec<String> {
    let eligible = |sso: &str, entry: &GrokTokenEntry, tier_super: bool| -> Option<RankCandidate> {
        if entry.is_expired() || entry.failed_count >= 3 {
            return None;
        }
        let field = entry.field(heavy);
        if field == 0 {
            return None;
        }
        Some(RankCandidate { sso: sso.to_string(), tier_super, field })
    };

    let mut normal_candidates: Vec<RankCandidate> = if heavy {
        Vec::new()
    } else {
        normal.iter().filter_map(|(sso, e)| eligible(sso, e, false)).collect()
    };
    let mut super_candidates: Vec<RankCandidate> = super_tier
        .iter()
        .filter_map(|(sso, e)| eligible(sso, e, true))
        .collect();

    let (normal_unused, mut normal_used): (Vec<_>, Vec<_>) =
        normal_candidates.drain(..).partition(|c| c.field == -1);
    let (super_unused, mut super_used): (Vec<_>, Vec<_>) =
        super_candidates.drain(..).partition(|c| c.field == -1);

    normal_used.sort_by(|a, b| b.field.cmp(&a.field));
    super_used.sort_by(|a, b| b.field.cmp(&a.field));

    normal_unused
        .into_iter()
        .chain(normal_used)
        .chain(super_unused)
        .chain(super_used)
        .map(|c| c.sso)
        .collect()
}

pub fn upstream_cookie(token: &str) -> String {
    format!("sso-rw={token};sso={token}")
}

// ── Statsig header ──────────────────────────────────────────────────────────

const ALPHANUMERIC: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
const LOWERCASE: &[u8] = b"abcdefghijklmnopqrstuvwxyz";

fn random_string(rng: &mut impl Rng, alphabet: &[u8], len: usize) -> String {
    (0..len)
        .map(|_| alphabet[rng.gen_range(0..alphabet.len())] as char)
        .collect()
}

/// `x-statsig-id` generation: a fake browser TypeError, base64-encoded,
/// in one of two equiprobable forms.
pub fn generate_dynamic_statsig_id(rng: &mut impl Rng) -> String {
    let message = if rng.gen_bool(0.5) {
        let rand5 = random_string(rng, ALPHANUMERIC, 5);
        format!("e:TypeError: Cannot read properties of null (reading 'children['{rand5}']')")
    } else {
        let rand10 = random_string(rng, LOWERCASE, 10);
        format!("e:TypeError: Cannot read properties of undefined (reading '{rand10}')")
    };
    base64::engine::general_purpose::STANDARD.encode(message)
}

// ── Retry policy ─────────────────────────────────────────────────────────────

pub const OUTER_RETRIES: u32 = 3;
pub const INNER_403_RETRIES: u32 = 5;
pub const INNER_403_PAUSE_MS: u64 = 500;

pub fn outer_backoff_ms(attempt: u32) -> u64 {
    (attempt as u64 + 1) * 100
}

// ── Payload construction ─────────────────────────────────────────────────────

/// The fixed options set sent with every text-model completion.
pub fn build_text_payload(
    entry: &GrokModelEntry,
    message: &str,
    file_attachments: &[String],
    image_attachments: &[String],
    temporary: bool,
) -> Value {
    json!({
        "temporary": temporary,
        "modelName": entry.grok_model,
        "message": message,
        "fileAttachments": file_attachments,
        "imageAttachments": image_attachments,
        "disableSearch": false,
        "enableImageGeneration": true,
        "returnImageBytes": false,
        "returnRawGrokInXaiRequest": false,
        "enableImageStreaming": true,
        "imageGenerationCount": 2,
        "forceConcise": false,
        "toolOverrides": {},
        "enableSideBySide": true,
        "sendFinalMetadata": true,
        "isReasoning": false,
        "webpageUrls": [],
        "disableTextFollowUps": true,
        "responseMetadata": { "requestModelDetails": { "modelId": entry.grok_model } },
        "disableMemory": false,
        "forceSideBySide": false,
        "modelMode": entry.model_mode,
        "isAsyncChat": false,
    })
}

/// Image-to-video requests replace the text payload with this fixed
/// skeleton referencing the uploaded source image.
pub fn build_image_to_video_payload(reference_url: &str, user_text: &str, file_id: &str) -> Value {
    json!({
        "temporary": true,
        "modelName": "grok-3",
        "message": format!("{reference_url}  {user_text} --mode=custom"),
        "fileAttachments": [file_id],
        "toolOverrides": { "videoGen": true },
    })
}

// ── Streaming transform ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum GrokChunk {
    Token { text: String, is_thinking: bool },
    GeneratedImages(Vec<String>),
    VideoUrl(String),
    Ignored,
}

/// Classify one NDJSON line from the Grok completion stream.
pub fn parse_ndjson_line(line: &str) -> anyhow::Result<GrokChunk> {
    let v: Value = serde_json::from_str(line)?;
    let response = &v["result"]["response"];

    if let Some(url) = response["streamingVideoGenerationResponse"]["videoUrl"].as_str() {
        return Ok(GrokChunk::VideoUrl(url.to_string()));
    }

    if let Some(arr) = response["modelResponse"]["generatedImageUrls"].as_array() {
        let urls = arr.iter().filter_map(|u| u.as_str().map(String::from)).collect();
        return Ok(GrokChunk::GeneratedImages(urls));
    }

    match response.get("token") {
        Some(Value::String(text)) => {
            let is_thinking = response["isThinking"].as_bool().unwrap_or(false);
            Ok(GrokChunk::Token { text: text.clone(), is_thinking })
        }
        // Array-valued `token` fields are explicitly ignored.
        _ => Ok(GrokChunk::Ignored),
    }
}

/// Incrementally split a raw NDJSON byte buffer (one JSON object per
/// line, unlike DeepSeek's `data: `-prefixed SSE) into complete lines.
pub fn drain_complete_ndjson_lines(buffer: &mut String) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = buffer.find('\n') {
        let line: String = buffer.drain(..pos + 1).collect();
        lines.push(line.trim_end_matches('\n').to_string());
    }
    lines
}

pub fn token_is_filtered(text: &str, filtered_tags: &[String]) -> bool {
    filtered_tags.iter().any(|tag| text.contains(tag.as_str()))
}

pub fn image_markdown(url: &str) -> String {
    format!("![Generated Image]({url})")
}

pub fn video_html(url: &str) -> String {
    format!("<video src={url} controls width=500 height=300></video>")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn entry(field: i64) -> GrokTokenEntry {
        GrokTokenEntry {
            created_time: 0,
            remaining_queries: field,
            heavy_remaining_queries: field,
            status: "active".into(),
            failed_count: 0,
            last_failure_time: None,
            last_failure_reason: None,
        }
    }

    #[test]
    fn ranking_orders_unused_before_used_and_normal_before_super() {
        let normal = vec![
            ("n-used-low".to_string(), entry(5)),
            ("n-unused".to_string(), entry(-1)),
            ("n-used-high".to_string(), entry(50)),
        ];
        let super_tier = vec![
            ("s-unused".to_string(), entry(-1)),
            ("s-used".to_string(), entry(10)),
        ];

        let order = rank_tokens(&normal, &super_tier, false);
        assert_eq!(
            order,
            vec!["n-unused", "n-used-high", "n-used-low", "s-unused", "s-used"]
        );
    }

    #[test]
    fn heavy_requests_ignore_normal_tier() {
        let normal = vec![("n".to_string(), entry(100))];
        let super_tier = vec![("s".to_string(), entry(-1))];
        let order = rank_tokens(&normal, &super_tier, true);
        assert_eq!(order, vec!["s"]);
    }

    #[test]
    fn expired_and_exhausted_and_thrice_failed_entries_are_excluded() {
        let mut expired = entry(5);
        expired.status = "expired".into();
        let mut exhausted = entry(0);
        exhausted.status = "active".into();
        let mut failed = entry(5);
        failed.failed_count = 3;

        let normal = vec![
            ("expired".to_string(), expired),
            ("exhausted".to_string(), exhausted),
            ("failed".to_string(), failed),
            ("ok".to_string(), entry(1)),
        ];
        let order = rank_tokens(&normal, &[], false);
        assert_eq!(order, vec!["ok"]);
    }

    #[test]
    fn dynamic_statsig_id_is_valid_base64_of_one_of_two_forms() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        for _ in 0..20 {
            let id = generate_dynamic_statsig_id(&mut rng);
            let decoded = base64::engine::general_purpose::STANDARD.decode(&id).unwrap();
            let text = String::from_utf8(decoded).unwrap();
            assert!(
                text.contains("reading 'children[")
                    || text.contains("reading '") && text.contains("Cannot read properties of undefined"),
                "unexpected statsig message form: {text}"
            );
        }
    }

    #[test]
    fn ndjson_token_line_parses() {
        let line = r#"{"result":{"response":{"token":"hello","isThinking":false}}}"#;
        assert_eq!(
            parse_ndjson_line(line).unwrap(),
            GrokChunk::Token { text: "hello".to_string(), is_thinking: false }
        );
    }

    #[test]
    fn ndjson_array_token_is_ignored() {
        let line = r#"{"result":{"response":{"token":["a","b"]}}}"#;
        assert_eq!(parse_ndjson_line(line).unwrap(), GrokChunk::Ignored);
    }

    #[test]
    fn ndjson_video_url_classified() {
        let line = r#"{"result":{"response":{"streamingVideoGenerationResponse":{"videoUrl":"v/1.mp4"}}}}"#;
        assert_eq!(parse_ndjson_line(line).unwrap(), GrokChunk::VideoUrl("v/1.mp4".to_string()));
    }

    #[test]
    fn ndjson_generated_images_classified() {
        let line = r#"{"result":{"response":{"modelResponse":{"generatedImageUrls":["a.png","b.png"]}}}}"#;
        assert_eq!(
            parse_ndjson_line(line).unwrap(),
            GrokChunk::GeneratedImages(vec!["a.png".to_string(), "b.png".to_string()])
        );
    }

    #[test]
    fn ndjson_buffer_splits_on_newline_and_buffers_partial_lines() {
        let mut buffer = String::from(r#"{"a":1}"#);
        assert!(drain_complete_ndjson_lines(&mut buffer).is_empty());
        buffer.push('\n');
        buffer.push_str(r#"{"b":2}"#);
        let lines = drain_complete_ndjson_lines(&mut buffer);
        assert_eq!(lines, vec![r#"{"a":1}"#.to_string()]);
        assert_eq!(buffer, r#"{"b":2}"#);
    }

    #[test]
    fn filtered_tag_detection() {
        let tags = vec!["xaiartifact".to_string(), "grok:render".to_string()];
        assert!(token_is_filtered("<xaiartifact>foo</xaiartifact>", &tags));
        assert!(!token_is_filtered("plain text", &tags));
    }
}
