//! Axum Handlers for the REST API
//!
//! One handler per channel (direct chat, WhatsApp webhook, A2A JSON-RPC)
//! plus read-only session views. Every channel handler normalizes its input,
//! runs one orchestrator turn and renders the reply in the channel's format.
//! `utoipa` doc comments generate the OpenAPI documentation.

use axum::{
    Form,
    extract::{Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Json, Response},
};
use assessor_core::orchestrator::{Channel, InboundMessage, TurnReply};
use assessor_core::retry::FailureClass;
use assessor_core::session::FlowStage;
use assessor_core::verdict::calculate_verdict;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::{
    channels::{self, JsonRpcRequest},
    models::{ChatRequest, ChatResponse, ErrorResponse, HealthResponse, SessionView, VerdictResponse},
    state::AppState,
};

pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    InternalServerError(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, Json(ErrorResponse { message })).into_response()
            }
            ApiError::NotFound(message) => {
                (StatusCode::NOT_FOUND, Json(ErrorResponse { message })).into_response()
            }
            ApiError::InternalServerError(err) => {
                error!("Internal Server Error: {:?}", err);
                let message = "An internal server error occurred.".to_string();
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorResponse { message }),
                )
                    .into_response()
            }
        }
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::InternalServerError(err.into())
    }
}

/// Send a candidate message and get the assessor's reply.
#[utoipa::path(
    post,
    path = "/chat",
    request_body = ChatRequest,
    responses(
        (status = 200, description = "The assessor's reply", body = ChatResponse),
        (status = 400, description = "Bad request", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn chat(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    let session_key = payload.session_key.trim().to_string();
    if session_key.is_empty() {
        return Err(ApiError::BadRequest("session_key must not be empty".to_string()));
    }
    let media = payload
        .media
        .into_iter()
        .map(|m| m.into_inbound())
        .collect::<Result<Vec<_>, _>>()
        .map_err(ApiError::BadRequest)?;

    let reply = state
        .orchestrator
        .handle_turn(InboundMessage {
            session_key,
            user_id: payload.user_id,
            channel: Channel::Chat,
            text: payload.text,
            media,
        })
        .await?;
    Ok(Json(reply.into()))
}

/// Twilio WhatsApp webhook. Replies with TwiML.
#[utoipa::path(
    post,
    path = "/webhooks/whatsapp",
    request_body(content = String, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 200, description = "TwiML reply", body = String, content_type = "application/xml"),
        (status = 400, description = "Bad request", body = ErrorResponse)
    )
)]
pub async fn whatsapp_webhook(
    State(state): State<Arc<AppState>>,
    Form(form): Form<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    let inbound = channels::whatsapp_inbound(&form).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    info!(session_key = %inbound.session_key, media = inbound.media.len(), "WhatsApp message received");

    let session_key = inbound.session_key.clone();
    let reply = match state.orchestrator.handle_turn(inbound).await {
        Ok(reply) => reply,
        Err(e) => {
            // Twilio shows whatever we return, so answer with the apology
            // instead of an HTTP error.
            error!(error = %e, "WhatsApp turn failed");
            whatsapp_failure_reply(&state, &session_key).await
        }
    };

    Ok((
        [(header::CONTENT_TYPE, "application/xml")],
        channels::render_twiml(&reply),
    )
        .into_response())
}

/// Apology for a failed WhatsApp turn, tagged with the last stored stage.
pub(crate) async fn whatsapp_failure_reply(state: &AppState, session_key: &str) -> TurnReply {
    let stage = match state.orchestrator.session(session_key).await {
        Ok(Some(session)) => session.stage,
        Ok(None) => FlowStage::New,
        Err(e) => {
            warn!(error = %e, "Could not load session stage for failure reply");
            FlowStage::New
        }
    };
    TurnReply::plain(
        FailureClass::NonTransient.reply_text(),
        stage,
        Some(FailureClass::NonTransient),
    )
}

/// A2A JSON-RPC endpoint. Supports `message/send`.
#[utoipa::path(
    post,
    path = "/a2a",
    request_body(content = Object, description = "JSON-RPC 2.0 request"),
    responses(
        (status = 200, description = "JSON-RPC 2.0 response", body = Object)
    )
)]
pub async fn a2a(
    State(state): State<Arc<AppState>>,
    Json(request): Json<JsonRpcRequest>,
) -> Json<Value> {
    let id = request.id;
    if request.method != "message/send" {
        warn!(method = %request.method, "Unsupported JSON-RPC method");
        return Json(channels::rpc_error(
            id,
            channels::JSONRPC_METHOD_NOT_FOUND,
            "Method not found",
        ));
    }

    let (inbound, context_id) = match channels::a2a_inbound(request.params) {
        Ok(parsed) => parsed,
        Err(e) => {
            return Json(channels::rpc_error(
                id,
                channels::JSONRPC_INVALID_PARAMS,
                &format!("Invalid params: {e}"),
            ));
        }
    };

    match state.orchestrator.handle_turn(inbound).await {
        Ok(reply) => Json(channels::rpc_result(id, channels::a2a_task(&reply, &context_id))),
        Err(e) => {
            error!(error = %e, context_id = %context_id, "A2A turn failed");
            Json(channels::rpc_error(
                id,
                channels::JSONRPC_INTERNAL_ERROR,
                "Internal error",
            ))
        }
    }
}

/// Get a stored session.
#[utoipa::path(
    get,
    path = "/sessions/{key}",
    responses(
        (status = 200, description = "Session details", body = SessionView),
        (status = 404, description = "Session not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    params(
        ("key" = String, Path, description = "Session key, e.g. `whatsapp:+919876543210`")
    )
)]
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<Json<SessionView>, ApiError> {
    let session = state
        .orchestrator
        .session(&key)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Session '{}' not found", key)))?;
    Ok(Json(SessionView::from_session(&session)?))
}

/// Get the pass/fail verdict for a session's candidate.
#[utoipa::path(
    get,
    path = "/sessions/{key}/verdict",
    responses(
        (status = 200, description = "Verdict for the candidate's target role", body = VerdictResponse),
        (status = 404, description = "Session not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    params(
        ("key" = String, Path, description = "Session key")
    )
)]
pub async fn get_verdict(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<Json<VerdictResponse>, ApiError> {
    let session = state
        .orchestrator
        .session(&key)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Session '{}' not found", key)))?;
    let role = session.candidate.target_role();
    let verdict = calculate_verdict(
        session.candidate.assessment_history(),
        state.orchestrator.competency(),
        role,
    );
    Ok(Json(VerdictResponse {
        session_key: key,
        role: role.map(str::to_owned),
        verdict,
    }))
}

/// Liveness check.
#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Service is up", body = HealthResponse))
)]
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}
