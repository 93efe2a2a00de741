use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::{error::SecretError, AppState};

// ── Health ────────────────────────────────────────────────────────────────────

pub async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

// ── Create ────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateRequest {
    pub content: String,
    pub ttl_minutes: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct CreateResponse {
    pub id: Uuid,
    /// One-time link. Relative unless a public URL is configured.
    pub url: String,
    pub created_at: i64,
    pub expires_at: Option<i64>,
}

pub async fn create_secret(
    State(state): State<AppState>,
    payload: Result<Json<CreateRequest>, JsonRejection>,
) -> Response {
    let body = match payload {
        Ok(Json(body)) => body,
        Err(rejection) => return rejection_response(rejection),
    };
    match state.service.create(&body.content, body.ttl_minutes) {
        Ok(created) => {
            let base = state.public_url.as_deref().unwrap_or("");
            let url = format!("{base}/secrets/{}", created.id);
            (
                StatusCode::CREATED,
                Json(CreateResponse {
                    id: created.id,
                    url,
                    created_at: created.created_at,
                    expires_at: created.expires_at,
                }),
            )
                .into_response()
        }
        Err(e) => error_response(e),
    }
}

// ── Retrieve (burns) ──────────────────────────────────────────────────────────

pub async fn retrieve_secret(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.service.retrieve_and_burn(&id) {
        Ok(revealed) => (
            [(header::CACHE_CONTROL, "no-store")],
            Json(revealed),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

// ── Cleanup ───────────────────────────────────────────────────────────────────

pub async fn run_cleanup(State(state): State<AppState>) -> Response {
    match state.service.run_cleanup() {
        Ok(deleted) => Json(json!({ "deleted": deleted })).into_response(),
        Err(e) => error_response(e),
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn error_response(e: SecretError) -> Response {
    match e {
        SecretError::Validation { field, rule } => (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": format!("invalid {field}: {rule}"),
                "field": field,
                "rule": rule,
            })),
        )
            .into_response(),
        SecretError::NotFound => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "not found or expired"})),
        )
            .into_response(),
        e @ (SecretError::Storage(_) | SecretError::Crypto(_)) => internal_error(e),
    }
}

/// Bodies that do not parse as JSON, or do not fit `CreateRequest`, get a 400
/// with the same JSON envelope as validation failures. Other rejections keep
/// their status but still answer in JSON.
fn rejection_response(rejection: JsonRejection) -> Response {
    let status = match &rejection {
        JsonRejection::JsonDataError(_) | JsonRejection::JsonSyntaxError(_) => {
            StatusCode::BAD_REQUEST
        }
        _ => rejection.status(),
    };
    let detail = rejection.body_text();
    let detail = detail
        .strip_prefix(DESERIALIZE_PREFIX)
        .unwrap_or(&detail)
        .to_owned();
    let mut body = json!({ "error": format!("invalid request body: {detail}") });
    if let Some(field) = rejected_field(&detail) {
        body["field"] = json!(field);
    }
    (status, Json(body)).into_response()
}

const DESERIALIZE_PREFIX: &str = "Failed to deserialize the JSON body into the target type: ";

/// Name the request field a deserialization error is about, if any.
///
/// Missing fields read "missing field `content` at ..."; type mismatches are
/// prefixed with the field path, as in "ttl_minutes: invalid type: ...".
fn rejected_field(detail: &str) -> Option<&'static str> {
    const FIELDS: [&str; 2] = ["content", "ttl_minutes"];
    if let Some(rest) = detail.strip_prefix("missing field `") {
        let name = rest.split('`').next()?;
        return FIELDS.into_iter().find(|f| *f == name);
    }
    let (path, _) = detail.split_once(": ")?;
    FIELDS.into_iter().find(|f| *f == path)
}

fn internal_error(e: SecretError) -> Response {
    tracing::error!(error = %e, "internal error");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "internal server error"})),
    )
        .into_response()
}
