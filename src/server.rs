use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    ImagineError,
    codec::ARTIFACT_MIME_TYPE,
    config::DEFAULT_PROMPT,
    model::TextToImage,
    session::{GenerationSession, SessionSnapshot},
};

const INDEX_TEMPLATE: &str = include_str!("../assets/index.html");

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GenerateRequest {
    pub prompt: String,
}

type SharedSession<T> = Arc<GenerationSession<T>>;

/// Routes for the page and its API, bound to one session.
pub fn router<T: TextToImage + Send + Sync + 'static>(session: SharedSession<T>) -> Router {
    Router::new()
        .route("/", get(get_index))
        .route("/generate", post(post_generate::<T>))
        .route("/progress", get(get_progress::<T>))
        .route("/image", get(get_image::<T>))
        .route("/download", get(get_download::<T>))
        .with_state(session)
}

/// The page with `prompt` prefilled in the text area.
pub fn render_index(prompt: &str) -> String {
    INDEX_TEMPLATE.replace("{{DEFAULT_PROMPT}}", &escape_html(prompt))
}

// The prompt lands inside a <textarea>, so markup in it must not close the element
fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            c => escaped.push(c),
        }
    }
    escaped
}

async fn get_index() -> Html<String> {
    Html(render_index(DEFAULT_PROMPT))
}

async fn post_generate<T: TextToImage + Send + Sync + 'static>(
    State(session): State<SharedSession<T>>,
    Json(payload): Json<GenerateRequest>,
) -> impl IntoResponse {
    match session.submit(&payload.prompt) {
        Ok(id) => {
            log::info!("Scheduled generation {id}");
            (
                StatusCode::OK,
                Json(json!({ "status": "scheduled", "id": id })),
            )
        }
        Err(e) => {
            let status = match e {
                ImagineError::Busy => StatusCode::CONFLICT,
                ImagineError::EmptyPrompt => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            log::warn!("Rejected generation: {e}");
            (status, Json(json!({ "error": e.to_string() })))
        }
    }
}

async fn get_progress<T: TextToImage + Send + Sync + 'static>(
    State(session): State<SharedSession<T>>,
) -> Json<SessionSnapshot> {
    Json(session.poll())
}

async fn get_image<T: TextToImage + Send + Sync + 'static>(
    State(session): State<SharedSession<T>>,
) -> Response {
    match session.present() {
        Some(output) => (
            [(header::CONTENT_TYPE, ARTIFACT_MIME_TYPE)],
            output.artifact.bytes().to_vec(),
        )
            .into_response(),
        None => no_image(),
    }
}

async fn get_download<T: TextToImage + Send + Sync + 'static>(
    State(session): State<SharedSession<T>>,
) -> Response {
    match session.present() {
        Some(output) => {
            let artifact = &output.artifact;
            (
                [
                    (header::CONTENT_TYPE, artifact.mime_type().to_string()),
                    (header::CONTENT_DISPOSITION, artifact.content_disposition()),
                ],
                artifact.bytes().to_vec(),
            )
                .into_response()
        }
        None => no_image(),
    }
}

fn no_image() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "no image has been generated yet" })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_prefills_default_prompt() {
        let page = render_index(DEFAULT_PROMPT);
        assert!(page.contains("AI Prompt-A-Thon: Text-to-Image Generator"));
        assert!(page.contains("A futuristic urban hospital"));
        assert!(!page.contains("{{DEFAULT_PROMPT}}"));
    }

    #[test]
    fn test_index_escapes_prompt() {
        let page = render_index("</textarea><script>alert(1)</script>");
        assert!(page.contains("&lt;/textarea&gt;&lt;script&gt;"));
        assert!(!page.contains("<script>alert(1)"));
    }
}
