use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use common::{
    Ack, CreateGroupRequest, ErrorResponse, GroupCommError, GroupStatus, HeartbeatRequest,
    Message, MessageKind, PollRequest, PollResponse, RegistrationResponse, TaskEventRequest,
    DRIVER_ID,
};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::relay::RelayChannel;
use crate::service::DriverHandle;

#[derive(Clone)]
pub struct AppState {
    pub driver: DriverHandle,
    pub relay: RelayChannel,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/groups", post(create_group))
        .route("/api/v1/groups/:id", get(get_group))
        .route("/api/v1/groups/:id/tasks/register", post(register_task))
        .route("/api/v1/groups/:id/tasks/running", post(task_running))
        .route("/api/v1/groups/:id/tasks/completed", post(task_completed))
        .route("/api/v1/groups/:id/tasks/failed", post(task_failed))
        .route("/api/v1/tasks/heartbeat", post(heartbeat))
        .route("/api/v1/messages", post(post_message))
        .route("/api/v1/messages/poll", post(poll_messages))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/* ---------------- errores ---------------- */

/// Error de dominio convertido a respuesta HTTP con cuerpo `{ "error": ... }`.
pub struct ApiError(GroupCommError);

impl From<GroupCommError> for ApiError {
    fn from(e: GroupCommError) -> Self {
        ApiError(e)
    }
}

pub fn status_for(error: &GroupCommError) -> StatusCode {
    match error {
        GroupCommError::UnknownGroup { .. }
        | GroupCommError::UnknownMember { .. }
        | GroupCommError::UnknownOperator { .. } => StatusCode::NOT_FOUND,
        GroupCommError::DuplicateMember { .. } | GroupCommError::GroupExists { .. } => {
            StatusCode::CONFLICT
        }
        GroupCommError::InvalidOperatorSpec { .. }
        | GroupCommError::ConfigurationConflict { .. }
        | GroupCommError::InvalidTransition { .. }
        | GroupCommError::WrongRole { .. }
        | GroupCommError::MissingFunction { .. }
        | GroupCommError::Codec { .. } => StatusCode::BAD_REQUEST,
        GroupCommError::UnrecoverableGroup { .. } => StatusCode::GONE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        debug!("respondiendo {}: {}", status, self.0);
        let body = ErrorResponse {
            error: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/* ---------------- handlers HTTP ---------------- */

async fn health() -> &'static str {
    "ok"
}

// Crea un grupo con sus miembros esperados y sus operadores
async fn create_group(
    State(state): State<AppState>,
    Json(req): Json<CreateGroupRequest>,
) -> Result<(StatusCode, Json<GroupStatus>), ApiError> {
    let specs = req.operator_specs()?;
    state
        .driver
        .create_group(req.group_id.clone(), req.members, req.shape, specs)
        .await?;
    let status = state.driver.status(&req.group_id).await?;
    info!("grupo {} creado vía HTTP", req.group_id);
    Ok((StatusCode::CREATED, Json(status)))
}

// Estado del grupo: topología, epoch y acks por miembro
async fn get_group(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<GroupStatus> {
    Ok(Json(state.driver.status(&id).await?))
}

async fn register_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<TaskEventRequest>,
) -> ApiResult<RegistrationResponse> {
    Ok(Json(state.driver.task_registered(&id, &req.task_id).await?))
}

async fn task_running(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<TaskEventRequest>,
) -> ApiResult<Ack> {
    state.driver.task_running(&id, &req.task_id).await?;
    Ok(Json(Ack { ok: true }))
}

async fn task_completed(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<TaskEventRequest>,
) -> ApiResult<Ack> {
    state.driver.task_completed(&id, &req.task_id).await?;
    state.relay.discard(&req.task_id, &id);
    Ok(Json(Ack { ok: true }))
}

async fn task_failed(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<TaskEventRequest>,
) -> ApiResult<Ack> {
    let reason = req.reason.as_deref().unwrap_or("reportado por el task");
    state.driver.task_failed(&id, &req.task_id, reason).await?;
    state.relay.discard(&req.task_id, &id);
    Ok(Json(Ack { ok: true }))
}

async fn heartbeat(
    State(state): State<AppState>,
    Json(req): Json<HeartbeatRequest>,
) -> Result<Json<Ack>, Response> {
    match state.driver.heartbeat(&req.task_id).await {
        Ok(true) => Ok(Json(Ack { ok: true })),
        Ok(false) => Err(StatusCode::NOT_FOUND.into_response()),
        Err(e) => Err(ApiError(e).into_response()),
    }
}

// Los ACKs van al loop del driver; el resto queda en el buzón del destino
async fn post_message(
    State(state): State<AppState>,
    Json(message): Json<Message>,
) -> ApiResult<Ack> {
    if message.destination == DRIVER_ID {
        if message.kind == MessageKind::ControlAck {
            state
                .driver
                .task_acked(&message.group_id, &message.source, message.epoch)
                .await?;
        }
        return Ok(Json(Ack { ok: true }));
    }
    state.relay.post(message);
    Ok(Json(Ack { ok: true }))
}

async fn poll_messages(
    State(state): State<AppState>,
    Json(req): Json<PollRequest>,
) -> Json<PollResponse> {
    Json(PollResponse {
        messages: state.relay.poll(&req.task_id),
    })
}
