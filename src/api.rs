use std::{convert::Infallible, sync::Arc};

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive},
        IntoResponse, Sse,
    },
    routing::{get, post},
    Router,
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::spawn;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info};
use uuid::Uuid;

use crate::{
    app_state::{AppState, SessionSlot, Status},
    rag,
    session::SessionState,
};

type ApiError = (StatusCode, Json<serde_json::Value>);

// --- Payloads y Respuestas de la API ---

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateSessionResponse {
    pub session_id: Uuid,
}

#[derive(Deserialize)]
pub struct AnswerPayload {
    pub text: String,
}

#[derive(Deserialize)]
pub struct MessagePayload {
    pub content: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    pub reply: String,
}

// --- Router ---

pub fn create_router(app_state: AppState) -> Router {
    Router::new()
        .route("/api/sessions", post(create_session_handler))
        .route("/api/sessions/:id", axum::routing::delete(close_session_handler))
        .route("/api/sessions/:id/events", get(events_handler))
        .route("/api/sessions/:id/answer", post(answer_handler))
        .route("/api/sessions/:id/messages", post(message_handler))
        .route("/api/status", get(status_handler))
        .route("/api/shutdown", post(shutdown_handler))
        .with_state(app_state)
}

// --- Handlers ---

/// Crea la sesión y la arranca en segundo plano. Los mensajes que lleguen
/// antes de que esté lista esperan al mutex de la sesión.
#[axum::debug_handler]
async fn create_session_handler(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let id = Uuid::new_v4();
    let slot = Arc::new(SessionSlot::new(state.config.persona_avatar()));
    let mut guard = slot.state.clone().lock_owned().await;

    state
        .sessions
        .lock()
        .map_err(|_| internal_error("Registro de sesiones no disponible"))?
        .insert(id, slot.clone());
    info!("Nueva sesión {id}.");

    let factory = state.factory.clone();
    spawn(async move {
        let session = factory.start_session(id, slot.frontend.as_ref()).await;
        *guard = SessionState::Ready(Box::new(session));
        info!("Inicialización de la sesión {id} completada.");
    });

    Ok((StatusCode::CREATED, Json(CreateSessionResponse { session_id: id })))
}

#[axum::debug_handler]
async fn events_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let slot = find_session(&state, &id)?;
    // Un cliente que se reconecta sustituye al anterior.
    let receiver = slot
        .frontend
        .subscribe()
        .map_err(|e| internal_error(&e.to_string()))?;

    let stream = ReceiverStream::new(receiver).map(|event| {
        Ok::<_, Infallible>(Event::default().data(serde_json::to_string(&event).unwrap_or_default()))
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

#[axum::debug_handler]
async fn answer_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<AnswerPayload>,
) -> Result<StatusCode, ApiError> {
    let slot = find_session(&state, &id)?;
    if slot.frontend.answer(payload.text) {
        Ok(StatusCode::ACCEPTED)
    } else {
        Err((
            StatusCode::CONFLICT,
            Json(json!({"error": "No hay ninguna pregunta pendiente."})),
        ))
    }
}

#[axum::debug_handler]
async fn message_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<MessagePayload>,
) -> Result<Json<MessageResponse>, ApiError> {
    let slot = find_session(&state, &id)?;
    let mut guard = slot.state.lock().await;
    let Some(session) = guard.session_mut() else {
        return Err((
            StatusCode::CONFLICT,
            Json(json!({"error": "La sesión todavía no está lista."})),
        ));
    };

    match rag::respond(&payload.content, session, slot.frontend.as_ref()).await {
        Ok(reply) => Ok(Json(MessageResponse { reply: reply.content })),
        Err(e) => {
            error!("Error generando la respuesta en la sesión {id}: {e}");
            Err((
                StatusCode::BAD_GATEWAY,
                Json(json!({"error": format!("Error al generar la respuesta: {}", e)})),
            ))
        }
    }
}

#[axum::debug_handler]
async fn close_session_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let removed = state
        .sessions
        .lock()
        .map_err(|_| internal_error("Registro de sesiones no disponible"))?
        .remove(&id);
    match removed {
        Some(_) => {
            info!("Sesión {id} cerrada.");
            Ok(StatusCode::NO_CONTENT)
        }
        None => Err(not_found()),
    }
}

#[axum::debug_handler]
async fn status_handler(State(state): State<AppState>) -> Json<Status> {
    let active_sessions = state.sessions.lock().map(|s| s.len()).unwrap_or(0);
    Json(Status {
        message: "Servidor listo.".to_string(),
        active_sessions,
    })
}

// --- Handler de Apagado y Utilidades ---

#[axum::debug_handler]
async fn shutdown_handler(State(state): State<AppState>) -> impl IntoResponse {
    info!("Petición de apagado recibida.");
    if let Ok(mut sender) = state.shutdown_sender.lock() {
        if let Some(sender) = sender.take() {
            let _ = sender.send(());
        }
    }
    StatusCode::OK
}

fn find_session(state: &AppState, id: &Uuid) -> Result<Arc<SessionSlot>, ApiError> {
    state.session(id).ok_or_else(not_found)
}

fn not_found() -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": "Sesión no encontrada."})),
    )
}

fn internal_error(message: &str) -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": message })))
}
