// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! `GET /images/{image|video}/{flattened-path}`: streams a cached
//! media file with a `Content-Type` inferred from its extension.

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::state::GatewayState;

pub async fn serve_media(State(state): State<GatewayState>, Path((kind, flat_path)): Path<(String, String)>) -> Response {
    let cache = match kind.as_str() {
        "image" => &state.media_images,
        "video" => &state.media_videos,
        _ => return (StatusCode::NOT_FOUND, "unknown media kind").into_response(),
    };

    // `..` has no meaning once a remote path is flattened to a single
    // filename; stripping it defends against a crafted path segment
    // reaching outside the cache directory.
    let sanitized = flat_path.replace("..", "");
    let path = cache.local_path(&sanitized);

    match tokio::fs::read(&path).await {
        Ok(bytes) => (StatusCode::OK, [(header::CONTENT_TYPE, content_type_for(&sanitized))], bytes).into_response(),
        Err(_) => (StatusCode::NOT_FOUND, "not found").into_response(),
    }
}

fn content_type_for(filename: &str) -> &'static str {
    match filename.rsplit('.').next().unwrap_or("") {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_known_extensions() {
        assert_eq!(content_type_for("a_b_c.png"), "image/png");
        assert_eq!(content_type_for("a_b_c.mp4"), "video/mp4");
    }

    #[test]
    fn content_type_unknown_extension_is_octet_stream() {
        assert_eq!(content_type_for("a_b_c"), "application/octet-stream");
    }
}
