mod access;
mod auth;
mod handlers;
mod openapi;
mod state;

use std::net::SocketAddr;
use std::process;
use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use clap::Parser;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use rdv_core::config::SessionConfig;
use rdv_core::dsn::validate_dsn;
use rdv_core::service::{QueryService, StaticCredentials};
use rdv_core::session::SessionExecutor;
use rdv_core::session::pg::PgConnector;
use rdv_core::template::CompileOptions;

use openapi::ApiDoc;
use state::{SharedState, WebState};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

// ============================================================
// CLI
// ============================================================

#[derive(Parser)]
#[command(name = "rdv-web", about = "rdv read-only SQL API server", version = rdv_core::VERSION)]
struct Args {
    /// Listen address.
    #[arg(long, default_value = "0.0.0.0:8080", env = "RDV_LISTEN")]
    listen: String,

    /// Connection as `id=dsn`. Repeat or comma-separate for several.
    #[arg(long = "connection", env = "RDV_CONNECTIONS", value_delimiter = ',')]
    connections: Vec<String>,

    /// Statement timeout when a request does not set one (ms).
    #[arg(long, default_value = "5000", env = "RDV_QUERY_TIMEOUT_DEFAULT_MS")]
    query_timeout_default_ms: u64,

    /// Upper bound for any requested statement timeout (ms).
    #[arg(long, default_value = "10000", env = "RDV_QUERY_TIMEOUT_MAX_MS")]
    query_timeout_max_ms: u64,

    /// Rows returned per statement.
    #[arg(long, default_value = "1000", env = "RDV_MAX_ROWS")]
    max_rows: usize,

    /// Connections per pool.
    #[arg(long, default_value = "4", env = "RDV_POOL_SIZE")]
    pool_size: usize,

    /// Reject `raw` template variables.
    #[arg(long, env = "RDV_DISABLE_RAW")]
    disable_raw: bool,

    /// Include database error text in error responses.
    #[arg(long, env = "RDV_EXPOSE_DB_ERRORS")]
    expose_db_errors: bool,

    /// Basic Auth username. If set, --auth-password is also required.
    #[arg(long, env = "RDV_AUTH_USER")]
    auth_user: Option<String>,

    /// Basic Auth password.
    #[arg(long, env = "RDV_AUTH_PASSWORD")]
    auth_password: Option<String>,
}

impl Args {
    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            default_timeout_ms: self.query_timeout_default_ms,
            max_timeout_ms: self.query_timeout_max_ms,
            max_rows: self.max_rows,
            pool_size: self.pool_size,
            ..SessionConfig::default()
        }
    }
}

/// Parses `id=dsn` entries, rejecting malformed ids and DSNs.
fn parse_connections(entries: &[String]) -> Result<StaticCredentials, String> {
    let mut creds = StaticCredentials::new();
    for entry in entries {
        let (id, dsn) = entry
            .split_once('=')
            .ok_or_else(|| "connection must be `id=dsn`".to_string())?;
        let id = id.trim();
        if id.is_empty() {
            return Err("connection id is empty".to_string());
        }
        let check = validate_dsn(dsn);
        if !check.ok {
            return Err(format!(
                "connection {}: {}",
                id,
                check.reason.unwrap_or("invalid_url")
            ));
        }
        creds = creds.with(id, dsn.trim());
    }
    Ok(creds)
}

// ============================================================
// Router
// ============================================================

fn router(state: SharedState, auth_creds: Option<Arc<(String, String)>>) -> Router {
    let mut app = Router::new()
        .route("/api/v1/health", get(handlers::handle_health))
        .route("/api/v1/query/preview", post(handlers::handle_preview))
        .route("/api/v1/query/execute", post(handlers::handle_execute))
        .route("/api/v1/query/compute", post(handlers::handle_compute))
        .route("/api/v1/query/explain", post(handlers::handle_explain))
        .route(
            "/api/v1/query/enum-options",
            post(handlers::handle_enum_options),
        )
        .route("/api/v1/ops/query", post(handlers::handle_ops_query))
        .route("/api/v1/ops/signal", post(handlers::handle_signal))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .with_state(state);

    if let Some(creds) = auth_creds {
        app = app.layer(axum::middleware::from_fn_with_state(
            creds,
            auth::basic_auth_middleware,
        ));
    }

    app.layer(axum::middleware::from_fn(access::access_log))
        .layer(CorsLayer::permissive())
        .layer(CompressionLayer::new())
}

// ============================================================
// Main
// ============================================================

fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("rdv_web=info,rdv_core=info")),
        )
        .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to build tokio runtime");
            process::exit(1);
        }
    };
    runtime.block_on(async_main(args));
}

async fn async_main(args: Args) {
    info!(version = rdv_core::VERSION, "starting");

    let credentials = match parse_connections(&args.connections) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "invalid connection configuration");
            process::exit(1);
        }
    };
    let ids: Vec<&str> = credentials.ids().collect();
    info!(connections = ?ids, "connections configured");

    let auth_creds = match (&args.auth_user, &args.auth_password) {
        (Some(user), Some(pass)) => {
            info!("basic auth enabled");
            Some(Arc::new((user.clone(), pass.clone())))
        }
        (Some(_), None) | (None, Some(_)) => {
            error!("--auth-user and --auth-password must both be set");
            process::exit(1);
        }
        _ => None,
    };

    let executor = SessionExecutor::new(Arc::new(PgConnector), args.session_config());
    let service = QueryService::new(executor, Arc::new(credentials)).with_compile_options(
        CompileOptions {
            allow_raw: !args.disable_raw,
        },
    );
    let state = Arc::new(WebState {
        service,
        expose_db_errors: args.expose_db_errors,
    });

    let app = router(state, auth_creds).into_make_service_with_connect_info::<SocketAddr>();

    let addr: SocketAddr = match args.listen.parse() {
        Ok(a) => a,
        Err(e) => {
            error!(listen = %args.listen, error = %e, "invalid listen address");
            process::exit(1);
        }
    };
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(%addr, error = %e, "failed to bind");
            process::exit(1);
        }
    };
    info!(%addr, "listening");

    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "server error");
        process::exit(1);
    }
}
