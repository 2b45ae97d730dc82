//! REST surface: one-shot interaction endpoint and aggregated health check.

use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::core::session::{CharacterDetails, Session};
use crate::errors::AppError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct InteractRequest {
    #[serde(default)]
    pub user_input: Option<String>,
    #[serde(default)]
    pub character_details: CharacterDetails,
    #[serde(default = "default_mode")]
    pub mode: String,
    /// Base64 PCM16, required in voice mode.
    #[serde(default)]
    pub audio_data: Option<String>,
    /// Continue an existing conversation instead of a one-shot exchange.
    #[serde(default)]
    pub session_id: Option<String>,
}

fn default_mode() -> String {
    "chat".to_string()
}

#[derive(Debug, Serialize)]
pub struct InteractResponse {
    pub response: String,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,
    /// Base64 synthesis output, voice mode only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_data: Option<String>,
}

/// `POST /interact`: a single chat or voice exchange. With a `session_id`
/// the conversation history and persona context carry over between calls.
pub async fn interact(
    State(state): State<Arc<AppState>>,
    Json(request): Json<InteractRequest>,
) -> Result<Response, AppError> {
    let mut session = match &request.session_id {
        Some(id) => match state.sessions.load(id).await {
            Ok(Some(session)) => session,
            Ok(None) => Session::new(request.character_details.clone()),
            Err(e) => return Err(AppError::InternalServerError(e.to_string())),
        },
        None => Session::new(request.character_details.clone()),
    };

    let outcome = match request.mode.as_str() {
        "chat" => {
            let user_input = request
                .user_input
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .ok_or_else(|| {
                    AppError::BadRequest("user_input is required in chat mode".into())
                })?;
            match state.orchestrator.run_chat(&mut session, user_input).await {
                Ok(turn) => {
                    session.push_turn_pair(user_input, &turn.reply);
                    Ok(InteractResponse {
                        response: turn.reply,
                        session_id: session.id.clone(),
                        transcript: None,
                        audio_data: None,
                    })
                }
                Err(err) => Err(err),
            }
        }
        "voice" => {
            let encoded = request.audio_data.as_deref().ok_or_else(|| {
                AppError::BadRequest("audio_data is required in voice mode".into())
            })?;
            let audio = BASE64
                .decode(encoded)
                .map_err(|e| AppError::BadRequest(format!("invalid base64 audio: {e}")))?;
            match state
                .orchestrator
                .run_voice_rest(&mut session, Bytes::from(audio))
                .await
            {
                Ok(turn) => {
                    session.push_turn_pair(&turn.transcript, &turn.reply);
                    Ok(InteractResponse {
                        response: turn.reply,
                        session_id: session.id.clone(),
                        transcript: Some(turn.transcript),
                        audio_data: Some(turn.audio_data),
                    })
                }
                Err(err) => Err(err),
            }
        }
        other => {
            return Err(AppError::BadRequest(format!(
                "unknown mode '{other}', expected 'chat' or 'voice'"
            )));
        }
    };

    if let Err(e) = state.sessions.save(&session).await {
        warn!(session_id = %session.id, "failed to save session: {e}");
    }

    match outcome {
        Ok(body) => Ok(Json(body).into_response()),
        Err(err) => Err(AppError::from(err)),
    }
}

/// `GET /health`: probes every downstream service. `ok` only when all four
/// answer; otherwise 503 with a per-service error map.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Response {
    let mut services = HashMap::new();
    let mut healthy = true;

    for (service, result) in state.orchestrator.client().probe_all().await {
        match result {
            Ok(()) => {
                services.insert(service.as_str(), "ok".to_string());
            }
            Err(e) => {
                healthy = false;
                services.insert(service.as_str(), format!("unreachable: {e}"));
            }
        }
    }

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    info!(healthy, "health check");
    (
        status,
        Json(json!({
            "status": if healthy { "ok" } else { "degraded" },
            "services": services,
        })),
    )
        .into_response()
}
