//! OpenAPI documentation definition.

use rdv_core::ErrorBody;
use rdv_core::explain::{ExplainFormat, ExplainOptions};
use rdv_core::ops::{OpsAction, OpsParams, SignalMode};
use rdv_core::service::{ComputeInput, Execution, ExplainOutput, Preview, QueryInput};
use rdv_core::session::QueryResult;
use rdv_core::template::{CompiledStatement, VariableDef, VariableType};
use utoipa::OpenApi;

use crate::handlers::{
    ComputeRequest, EnumOptionsRequest, EnumOptionsResponse, ExecuteRequest, ExplainRequest,
    OpsRequest, SignalRequest, SignalResponse,
};

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::handle_health,
        crate::handlers::handle_preview,
        crate::handlers::handle_execute,
        crate::handlers::handle_compute,
        crate::handlers::handle_explain,
        crate::handlers::handle_enum_options,
        crate::handlers::handle_ops_query,
        crate::handlers::handle_signal,
    ),
    components(schemas(
        QueryInput,
        ComputeInput,
        VariableDef,
        VariableType,
        CompiledStatement,
        Preview,
        Execution,
        QueryResult,
        ExplainFormat,
        ExplainOptions,
        ExplainOutput,
        OpsAction,
        OpsParams,
        SignalMode,
        ErrorBody,
        ExecuteRequest,
        ComputeRequest,
        ExplainRequest,
        EnumOptionsRequest,
        EnumOptionsResponse,
        OpsRequest,
        SignalRequest,
        SignalResponse,
    )),
    info(
        title = "rdv API",
        version = "1.0",
        description = "Read-only SQL templating and guarded execution against PostgreSQL"
    )
)]
pub(crate) struct ApiDoc;
