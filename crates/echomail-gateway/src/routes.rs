//! API route handlers for the gateway.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;

use super::server::AppState;

/// 1x1 transparent PNG served to mail clients that fetch the tracking image.
const PIXEL_B64: &str =
    "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAQAAAC1HAwCAAAAC0lEQVR42mP8HwQACfsD/QkEZHcAAAAASUVORK5CYII=";

static PIXEL: LazyLock<Vec<u8>> =
    LazyLock::new(|| BASE64.decode(PIXEL_B64).unwrap_or_default());

fn json_error(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({"ok": false, "error": message}))).into_response()
}

/// Health check endpoint.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "echomail-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.start_time.elapsed().as_secs(),
    }))
}

/// Dispatch trigger. Authenticated with the shared cron secret, passed as
/// `?key=` or an `x-cron-key` header — external cron pingers usually only
/// support one of the two.
pub async fn cron_run(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    if let Some(expected) = &state.cron_secret {
        let from_query = params.get("key").map(String::as_str);
        let from_header = headers.get("x-cron-key").and_then(|v| v.to_str().ok());
        if from_query != Some(expected) && from_header != Some(expected) {
            tracing::warn!("🔒 Dispatch trigger refused: bad key");
            return json_error(StatusCode::FORBIDDEN, "Forbidden");
        }
    }

    match state.runner.run_pass(Utc::now()).await {
        Ok(summary) => {
            let errors: HashMap<String, String> = summary
                .errors
                .iter()
                .map(|(id, reason)| (id.to_string(), reason.clone()))
                .collect();
            Json(serde_json::json!({
                "ok": true,
                "sent": summary.sent,
                "errors": errors,
            }))
            .into_response()
        }
        Err(e) => {
            tracing::error!("❌ Dispatch pass failed: {e}");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
        }
    }
}

/// Open-tracking pixel. Always answers with the image once an `id` is
/// present — an unknown or already-counted id must not change what the
/// mail client renders.
pub async fn track_open(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(id) = params.get("id").filter(|id| !id.is_empty()) else {
        return json_error(StatusCode::BAD_REQUEST, "Missing id parameter");
    };

    match state.store.mark_opened(id, Utc::now()) {
        Ok(true) => tracing::info!("👁️ Open recorded for delivery {id}"),
        Ok(false) => tracing::debug!("Open ignored for delivery {id} (unknown or repeat)"),
        Err(e) => {
            tracing::error!("❌ Pixel tracker error for delivery {id}: {e}");
            return json_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
        }
    }

    pixel_response()
}

fn pixel_response() -> Response {
    (
        [
            (header::CONTENT_TYPE, "image/png"),
            (header::CACHE_CONTROL, "no-store, no-cache, must-revalidate, proxy-revalidate"),
            (header::PRAGMA, "no-cache"),
            (header::EXPIRES, "0"),
        ],
        PIXEL.clone(),
    )
        .into_response()
}

/// Send one probe mail outside any sequence, to verify SMTP credentials.
/// `?to=` overrides the recipient; the default is the sender itself.
pub async fn send_test_mail(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let to = params
        .get("to")
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .unwrap_or(&state.from_email);
    if !to.contains('@') {
        return json_error(StatusCode::BAD_REQUEST, "Invalid recipient address");
    }

    match state
        .mailer
        .send(
            to,
            "✅ Test email from EchoMail",
            "<p>Your EchoMail transport is working.</p>",
        )
        .await
    {
        Ok(message_id) => {
            tracing::info!("✉️ Test mail sent: {message_id} → {to}");
            Json(serde_json::json!({"ok": true, "message_id": message_id, "to": to}))
                .into_response()
        }
        Err(e) => {
            tracing::error!("❌ Test mail to {to} failed: {e}");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
        }
    }
}
