//! End-to-end pipeline used by the CLI and the HTTP API.
//!
//! Each call resolves the connection, guards and compiles the templates, and
//! executes the final statement in an isolated session. Pools are cached per
//! (actor, connection), so two actors never share a pool even for the same
//! connection id.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::compose::compose_templates;
use crate::error::{Error, Result};
use crate::explain::{ExplainFormat, ExplainOptions, build_explain, plan_json, plan_text};
use crate::guard::ensure_read_only;
use crate::ops::{
    AuditRecord, AuditSink, OpsAction, OpsParams, SignalMode, SignalOutcome, TracingAuditSink,
    build, build_signal,
};
use crate::options::fetch_enum_options;
use crate::session::{ConnectionTarget, QueryResult, SessionExecutor, SessionMode, SessionOptions};
use crate::template::{
    CompileOptions, CompiledStatement, InputValues, VariableDef, compile_with, render_preview,
};

/// Resolves connection ids to targets.
pub trait Credentials: Send + Sync {
    fn resolve(&self, actor: &str, connection_id: &str) -> Result<ConnectionTarget>;
}

/// Fixed id → DSN map shared by every actor.
#[derive(Clone, Default)]
pub struct StaticCredentials {
    dsns: HashMap<String, String>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, id: impl Into<String>, dsn: impl Into<String>) -> Self {
        self.dsns.insert(id.into(), dsn.into());
        self
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.dsns.keys().map(String::as_str)
    }
}

impl Credentials for StaticCredentials {
    fn resolve(&self, _actor: &str, connection_id: &str) -> Result<ConnectionTarget> {
        self.dsns
            .get(connection_id)
            .map(|dsn| ConnectionTarget::new(connection_id, dsn.clone()))
            .ok_or_else(|| Error::ConnectionUnavailable {
                reason: format!("unknown connection: {}", connection_id),
                statement: None,
            })
    }
}

/// Who is calling, against which connection, with what timeout.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub actor: String,
    pub connection_id: String,
    pub timeout_ms: Option<u64>,
}

/// A template with its variable schema and runtime values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
pub struct QueryInput {
    pub sql: String,
    #[serde(default)]
    pub variables: Vec<VariableDef>,
    #[serde(default)]
    #[cfg_attr(feature = "api", schema(value_type = Object))]
    pub values: InputValues,
}

/// A base template plus a calculation template over its rows.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
pub struct ComputeInput {
    pub base_sql: String,
    pub calc_sql: String,
    #[serde(default)]
    pub variables: Vec<VariableDef>,
    #[serde(default)]
    #[cfg_attr(feature = "api", schema(value_type = Object))]
    pub values: InputValues,
}

#[derive(Debug, Clone, Serialize)]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
pub struct Preview {
    pub statement: CompiledStatement,
    /// Values inlined as literals. Display only.
    pub preview: String,
}

/// Executed statement text and its rows. Bound values are not echoed.
#[derive(Debug, Clone, Serialize)]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
pub struct Execution {
    pub sql: String,
    #[serde(flatten)]
    pub result: QueryResult,
}

#[derive(Debug, Clone, Serialize)]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
pub struct ExplainOutput {
    pub preview: String,
    pub format: ExplainFormat,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[cfg_attr(feature = "api", schema(value_type = Option<Object>))]
    pub plan: Option<Value>,
}

pub struct QueryService {
    executor: SessionExecutor,
    credentials: Arc<dyn Credentials>,
    audit: Arc<dyn AuditSink>,
    compile_options: CompileOptions,
}

impl QueryService {
    pub fn new(executor: SessionExecutor, credentials: Arc<dyn Credentials>) -> Self {
        Self {
            executor,
            credentials,
            audit: Arc::new(TracingAuditSink),
            compile_options: CompileOptions::default(),
        }
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_compile_options(mut self, opts: CompileOptions) -> Self {
        self.compile_options = opts;
        self
    }

    pub fn executor(&self) -> &SessionExecutor {
        &self.executor
    }

    fn target(&self, ctx: &CallContext) -> Result<ConnectionTarget> {
        self.credentials.resolve(&ctx.actor, &ctx.connection_id)
    }

    fn session_options(&self, ctx: &CallContext) -> SessionOptions {
        SessionOptions::with_timeout(ctx.timeout_ms).cached(ctx.actor.clone())
    }

    fn compile(&self, input: &QueryInput) -> Result<CompiledStatement> {
        ensure_read_only(&input.sql)?;
        compile_with(&input.sql, &input.variables, &input.values, &self.compile_options)
    }

    /// Guards and compiles without touching the database.
    pub fn preview(&self, input: &QueryInput) -> Result<Preview> {
        let statement = self.compile(input)?;
        let preview = render_preview(&statement);
        Ok(Preview { statement, preview })
    }

    pub fn execute(&self, ctx: &CallContext, input: &QueryInput) -> Result<Execution> {
        let statement = self.compile(input)?;
        self.run(ctx, statement)
    }

    /// Composes the calculation over the base query and runs the result.
    pub fn compute(&self, ctx: &CallContext, input: &ComputeInput) -> Result<Execution> {
        let statement = compose_templates(
            &input.base_sql,
            &input.calc_sql,
            &input.variables,
            &input.values,
            &self.compile_options,
        )?;
        self.run(ctx, statement)
    }

    fn run(&self, ctx: &CallContext, statement: CompiledStatement) -> Result<Execution> {
        let target = self.target(ctx)?;
        debug!(
            actor = %ctx.actor,
            connection = %ctx.connection_id,
            params = statement.values.len(),
            "executing statement"
        );
        let result = self
            .executor
            .run(&target, &statement, &self.session_options(ctx))?;
        Ok(Execution {
            sql: statement.text,
            result,
        })
    }

    pub fn explain(
        &self,
        ctx: &CallContext,
        input: &QueryInput,
        opts: ExplainOptions,
    ) -> Result<ExplainOutput> {
        let compiled = self.compile(input)?;
        let explain = build_explain(&compiled, opts)?;
        let target = self.target(ctx)?;
        let result = self.executor.with_session(
            &target,
            SessionMode::ReadOnly,
            &self.session_options(ctx),
            |session| session.query_gated(&explain),
        )
        .map_err(|e| e.with_statement(&explain))?;
        let (text, plan) = match opts.format {
            ExplainFormat::Text => (Some(plan_text(&result)), None),
            ExplainFormat::Json => (None, plan_json(&result)),
        };
        Ok(ExplainOutput {
            preview: render_preview(&compiled),
            format: opts.format,
            text,
            plan,
        })
    }

    pub fn enum_options(&self, ctx: &CallContext, sql: &str) -> Result<Vec<String>> {
        let target = self.target(ctx)?;
        fetch_enum_options(&self.executor, &target, sql, &self.session_options(ctx))
    }

    pub fn ops_query(
        &self,
        ctx: &CallContext,
        action: OpsAction,
        params: &OpsParams,
    ) -> Result<Execution> {
        let statement = build(action, params)?;
        self.run(ctx, statement)
    }

    /// Cancels or terminates a backend. Requires `confirm`; every attempt
    /// that reaches the database is audited.
    pub fn signal(&self, ctx: &CallContext, pid: i32, mode: SignalMode, confirm: bool) -> Result<bool> {
        if !confirm {
            return Err(Error::ConfirmationRequired);
        }
        let statement = build_signal(pid, mode)?;
        let target = self.target(ctx)?;

        let outcome = self.executor.with_session(
            &target,
            SessionMode::Writable,
            &self.session_options(ctx),
            |session| session.query_gated(&statement),
        );
        let signalled = outcome
            .map_err(|e| e.with_statement(&statement))
            .map(|result| {
                result
                    .rows
                    .first()
                    .and_then(|row| row.first())
                    .and_then(Value::as_bool)
                    .unwrap_or(false)
            });

        self.audit.record(&AuditRecord {
            actor: ctx.actor.clone(),
            connection: ctx.connection_id.clone(),
            pid,
            mode,
            outcome: match &signalled {
                Ok(true) => SignalOutcome::Signalled,
                Ok(false) => SignalOutcome::NotSignalled,
                Err(e) => SignalOutcome::Failed(e.kind().to_string()),
            },
            at: Utc::now(),
        });

        signalled
    }
}
