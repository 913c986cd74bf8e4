//! Local HTTP control API.
//!
//! Exposes the service operations to editor plugins and scripts.
//! Binds to 127.0.0.1 only, port 8768 by default.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{AppConfig, CopilotConfigUpdate, VoiceConfigUpdate};
use crate::error::SpeakerError;
use crate::normalizer::{is_speakable, normalize};
use crate::service::SpeakerService;
use crate::source::Suggestion;

pub type ApiState = Arc<SpeakerService>;

// --- Request/Response types ---

#[derive(Deserialize)]
struct SpeakRequest {
    text: String,
}

#[derive(Deserialize)]
struct RealTimeRequest {
    enabled: bool,
}

#[derive(Serialize)]
struct StatusResponse {
    state: String,
    running: bool,
    speaking: bool,
    copilot_connected: bool,
    listening: bool,
    real_time_enabled: bool,
}

#[derive(Serialize)]
struct SimpleResponse {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl SimpleResponse {
    fn ok(status: &str) -> Self {
        Self {
            status: status.into(),
            error: None,
        }
    }

    fn err(error: &SpeakerError) -> Self {
        Self {
            status: "error".into(),
            error: Some(error.to_string()),
        }
    }
}

/// Build the axum router.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/status", get(handle_status))
        .route("/speak", post(handle_speak))
        .route("/cancel", post(handle_cancel))
        .route("/voices", get(handle_voices))
        .route("/config", get(handle_config))
        .route("/config/voice", post(handle_voice_config))
        .route("/config/copilot", post(handle_copilot_config))
        .route("/realtime", post(handle_real_time))
        .route("/start", post(handle_start))
        .route("/stop", post(handle_stop))
        .route("/suggestions", get(handle_suggestions))
        .with_state(state)
}

/// Start the API server as a background tokio task.
pub async fn start_api(state: ApiState, port: u16) {
    let app = router(state);
    let addr = format!("127.0.0.1:{port}");
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            warn!("Failed to bind control API on {addr}: {e}");
            return;
        }
    };
    info!("Control API listening on {addr}");

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!("Control API server error: {e}");
        }
    });
}

// --- Handlers ---

async fn handle_status(State(service): State<ApiState>) -> Json<StatusResponse> {
    let state = service.state();
    Json(StatusResponse {
        state: state.to_string(),
        running: service.is_running(),
        speaking: service.is_speaking(),
        copilot_connected: service.is_copilot_connected(),
        listening: service.is_listening(),
        real_time_enabled: service.config().real_time_enabled,
    })
}

async fn handle_speak(
    State(service): State<ApiState>,
    Json(req): Json<SpeakRequest>,
) -> Json<SimpleResponse> {
    if !is_speakable(&normalize(&req.text)) {
        return Json(SimpleResponse::err(&SpeakerError::UnspeakableText));
    }

    let preview: String = req.text.chars().take(80).collect();
    info!(
        "HTTP /speak: \"{}{}\" ({} chars)",
        preview.replace('\n', " "),
        if req.text.chars().count() > 80 { "..." } else { "" },
        req.text.len(),
    );

    // Fire-and-forget: playback can outlive the request
    tokio::spawn(async move {
        if let Err(e) = service.speak_text(&req.text).await {
            warn!("HTTP /speak failed: {e}");
        }
    });

    Json(SimpleResponse::ok("speaking"))
}

async fn handle_cancel(State(service): State<ApiState>) -> Json<SimpleResponse> {
    service.cancel_speech().await;
    Json(SimpleResponse::ok("cancelled"))
}

async fn handle_voices(State(service): State<ApiState>) -> Json<Vec<String>> {
    Json(service.list_voices().await)
}

async fn handle_config(State(service): State<ApiState>) -> Json<AppConfig> {
    Json(service.config())
}

async fn handle_voice_config(
    State(service): State<ApiState>,
    Json(update): Json<VoiceConfigUpdate>,
) -> Json<SimpleResponse> {
    match service.update_voice_config(update).await {
        Ok(_) => Json(SimpleResponse::ok("ok")),
        Err(e) => Json(SimpleResponse::err(&e)),
    }
}

async fn handle_copilot_config(
    State(service): State<ApiState>,
    Json(update): Json<CopilotConfigUpdate>,
) -> Json<SimpleResponse> {
    match service.update_copilot_config(update).await {
        Ok(_) => Json(SimpleResponse::ok("ok")),
        Err(e) => Json(SimpleResponse::err(&e)),
    }
}

async fn handle_real_time(
    State(service): State<ApiState>,
    Json(req): Json<RealTimeRequest>,
) -> Json<SimpleResponse> {
    match service.set_real_time_enabled(req.enabled) {
        Ok(()) => Json(SimpleResponse::ok("ok")),
        Err(e) => Json(SimpleResponse::err(&e)),
    }
}

async fn handle_start(State(service): State<ApiState>) -> Json<SimpleResponse> {
    match service.start() {
        Ok(()) => Json(SimpleResponse::ok("running")),
        Err(e) => Json(SimpleResponse::err(&e)),
    }
}

async fn handle_stop(State(service): State<ApiState>) -> Json<SimpleResponse> {
    service.stop().await;
    Json(SimpleResponse::ok("stopped"))
}

async fn handle_suggestions(State(service): State<ApiState>) -> Json<Vec<Suggestion>> {
    Json(service.current_suggestions().await)
}
