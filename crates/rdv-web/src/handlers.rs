//! HTTP request handlers. Core calls are blocking and run on the blocking pool.

use axum::Extension;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use rdv_core::explain::{ExplainFormat, ExplainOptions};
use rdv_core::ops::{OpsAction, OpsParams, SignalMode};
use rdv_core::service::{
    CallContext, ComputeInput, Execution, ExplainOutput, Preview, QueryInput, QueryService,
};
use rdv_core::{Error, ErrorBody};

use crate::access::Outcome;
use crate::auth::AuthUser;
use crate::state::{AppState, SharedState};

// ============================================================
// Errors
// ============================================================

pub(crate) struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    fn from_core(err: &Error, expose_db_errors: bool) -> Self {
        let status = status_for(err);
        if err.is_input_error() {
            debug!(kind = err.kind(), "rejected request");
        } else if status.is_server_error() {
            warn!(kind = err.kind(), error = %err, "request failed");
        }
        Self {
            status,
            body: err.to_body(expose_db_errors),
        }
    }

    fn internal(message: &str) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: ErrorBody {
                error: "internal_error".to_string(),
                message: Some(message.to_string()),
                missing: None,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let outcome = Outcome(self.body.error.clone());
        let mut response = (self.status, Json(self.body)).into_response();
        response.extensions_mut().insert(outcome);
        response
    }
}

pub(crate) fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::QueryTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        Error::ConnectionUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        Error::Database { .. } | Error::ComposeParamCollision(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
        _ => StatusCode::BAD_REQUEST,
    }
}

/// Runs a core call on the blocking pool and maps its error.
async fn blocking<T, F>(state: SharedState, f: F) -> Result<Json<T>, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&QueryService) -> rdv_core::Result<T> + Send + 'static,
{
    let expose = state.expose_db_errors;
    match tokio::task::spawn_blocking(move || f(&state.service)).await {
        Ok(Ok(value)) => Ok(Json(value)),
        Ok(Err(e)) => Err(ApiError::from_core(&e, expose)),
        Err(e) => {
            error!(error = %e, "blocking task failed");
            Err(ApiError::internal("request task failed"))
        }
    }
}

fn actor(user: Option<Extension<AuthUser>>) -> String {
    user.map(|Extension(u)| u.0)
        .unwrap_or_else(|| AuthUser::ANONYMOUS.to_string())
}

fn context(user: Option<Extension<AuthUser>>, connection_id: String, timeout_ms: Option<u64>) -> CallContext {
    CallContext {
        actor: actor(user),
        connection_id,
        timeout_ms,
    }
}

// ============================================================
// Health
// ============================================================

#[utoipa::path(
    get,
    path = "/api/v1/health",
    responses(
        (status = 200, description = "Service is healthy", body = String)
    )
)]
pub(crate) async fn handle_health() -> &'static str {
    "ok"
}

// ============================================================
// Query
// ============================================================

#[utoipa::path(
    post,
    path = "/api/v1/query/preview",
    request_body = QueryInput,
    responses(
        (status = 200, description = "Compiled statement and literal preview", body = Preview),
        (status = 400, description = "Template rejected", body = ErrorBody)
    )
)]
pub(crate) async fn handle_preview(
    State(state): AppState,
    Json(input): Json<QueryInput>,
) -> Result<Json<Preview>, ApiError> {
    blocking(state, move |svc| svc.preview(&input)).await
}

#[derive(Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ExecuteRequest {
    connection_id: String,
    #[serde(default)]
    timeout_ms: Option<u64>,
    #[serde(flatten)]
    query: QueryInput,
}

#[utoipa::path(
    post,
    path = "/api/v1/query/execute",
    request_body = ExecuteRequest,
    responses(
        (status = 200, description = "Rows of the executed statement", body = Execution),
        (status = 400, description = "Template rejected", body = ErrorBody),
        (status = 503, description = "Connection unavailable", body = ErrorBody),
        (status = 504, description = "Statement timed out", body = ErrorBody)
    )
)]
pub(crate) async fn handle_execute(
    State(state): AppState,
    user: Option<Extension<AuthUser>>,
    Json(req): Json<ExecuteRequest>,
) -> Result<Json<Execution>, ApiError> {
    let ctx = context(user, req.connection_id, req.timeout_ms);
    blocking(state, move |svc| svc.execute(&ctx, &req.query)).await
}

#[derive(Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ComputeRequest {
    connection_id: String,
    #[serde(default)]
    timeout_ms: Option<u64>,
    #[serde(flatten)]
    input: ComputeInput,
}

#[utoipa::path(
    post,
    path = "/api/v1/query/compute",
    request_body = ComputeRequest,
    responses(
        (status = 200, description = "Rows of the composed statement", body = Execution),
        (status = 400, description = "Template rejected", body = ErrorBody)
    )
)]
pub(crate) async fn handle_compute(
    State(state): AppState,
    user: Option<Extension<AuthUser>>,
    Json(req): Json<ComputeRequest>,
) -> Result<Json<Execution>, ApiError> {
    let ctx = context(user, req.connection_id, req.timeout_ms);
    blocking(state, move |svc| svc.compute(&ctx, &req.input)).await
}

#[derive(Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ExplainRequest {
    connection_id: String,
    #[serde(default)]
    timeout_ms: Option<u64>,
    #[serde(default)]
    format: ExplainFormat,
    #[serde(default)]
    analyze: bool,
    #[serde(flatten)]
    query: QueryInput,
}

#[utoipa::path(
    post,
    path = "/api/v1/query/explain",
    request_body = ExplainRequest,
    responses(
        (status = 200, description = "Query plan", body = ExplainOutput),
        (status = 400, description = "Template rejected", body = ErrorBody)
    )
)]
pub(crate) async fn handle_explain(
    State(state): AppState,
    user: Option<Extension<AuthUser>>,
    Json(req): Json<ExplainRequest>,
) -> Result<Json<ExplainOutput>, ApiError> {
    let ctx = context(user, req.connection_id, req.timeout_ms);
    let opts = ExplainOptions {
        format: req.format,
        analyze: req.analyze,
    };
    blocking(state, move |svc| svc.explain(&ctx, &req.query, opts)).await
}

#[derive(Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct EnumOptionsRequest {
    connection_id: String,
    #[serde(default)]
    timeout_ms: Option<u64>,
    sql: String,
}

#[derive(Serialize, utoipa::ToSchema)]
pub(crate) struct EnumOptionsResponse {
    options: Vec<String>,
    count: usize,
}

#[utoipa::path(
    post,
    path = "/api/v1/query/enum-options",
    request_body = EnumOptionsRequest,
    responses(
        (status = 200, description = "Distinct first-column values", body = EnumOptionsResponse),
        (status = 400, description = "Options query rejected", body = ErrorBody)
    )
)]
pub(crate) async fn handle_enum_options(
    State(state): AppState,
    user: Option<Extension<AuthUser>>,
    Json(req): Json<EnumOptionsRequest>,
) -> Result<Json<EnumOptionsResponse>, ApiError> {
    let ctx = context(user, req.connection_id, req.timeout_ms);
    blocking(state, move |svc| {
        let options = svc.enum_options(&ctx, &req.sql)?;
        Ok(EnumOptionsResponse {
            count: options.len(),
            options,
        })
    })
    .await
}

// ============================================================
// Ops
// ============================================================

#[derive(Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct OpsRequest {
    connection_id: String,
    #[serde(default)]
    timeout_ms: Option<u64>,
    action_id: OpsAction,
    #[serde(default)]
    params: OpsParams,
}

#[utoipa::path(
    post,
    path = "/api/v1/ops/query",
    request_body = OpsRequest,
    responses(
        (status = 200, description = "Introspection rows", body = Execution),
        (status = 400, description = "Invalid parameters", body = ErrorBody)
    )
)]
pub(crate) async fn handle_ops_query(
    State(state): AppState,
    user: Option<Extension<AuthUser>>,
    Json(req): Json<OpsRequest>,
) -> Result<Json<Execution>, ApiError> {
    let ctx = context(user, req.connection_id, req.timeout_ms);
    blocking(state, move |svc| svc.ops_query(&ctx, req.action_id, &req.params)).await
}

#[derive(Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SignalRequest {
    connection_id: String,
    pid: i32,
    mode: SignalMode,
    #[serde(default)]
    confirm: bool,
}

#[derive(Serialize, utoipa::ToSchema)]
pub(crate) struct SignalResponse {
    ok: bool,
}

#[utoipa::path(
    post,
    path = "/api/v1/ops/signal",
    request_body = SignalRequest,
    responses(
        (status = 200, description = "Whether the backend was signalled", body = SignalResponse),
        (status = 400, description = "Confirmation missing or invalid pid", body = ErrorBody)
    )
)]
pub(crate) async fn handle_signal(
    State(state): AppState,
    user: Option<Extension<AuthUser>>,
    Json(req): Json<SignalRequest>,
) -> Result<Json<SignalResponse>, ApiError> {
    let ctx = context(user, req.connection_id, None);
    blocking(state, move |svc| {
        let ok = svc.signal(&ctx, req.pid, req.mode, req.confirm)?;
        Ok(SignalResponse { ok })
    })
    .await
}
