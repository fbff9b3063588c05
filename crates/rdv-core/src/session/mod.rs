//! Session executor.
//!
//! Every statement runs inside its own short transaction on a pooled
//! connection:
//!
//! ```text
//! BEGIN READ ONLY                      -- BEGIN for writable sessions
//! SET LOCAL statement_timeout = <ms>
//! SET LOCAL idle_in_transaction_session_timeout = <ms>
//! SET LOCAL search_path = pg_catalog, "$user"
//! <body>
//! ROLLBACK                             -- COMMIT for successful writable sessions
//! ```
//!
//! `SET LOCAL` keeps the settings scoped to the transaction, so nothing leaks
//! into the next checkout of the same connection. A connection whose cleanup
//! fails, or whose body panicked, is discarded instead of being returned.
//!
//! Connections come from a [`Connector`]. [`pg::PgConnector`] talks to
//! a real server; [`mock::MockConnector`] records statements in memory.

pub mod mock;
pub mod pool;
pub mod pg;
mod types;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::guard::ensure_read_only;
use crate::template::CompiledStatement;
use pool::{Pool, PoolStats};

/// SQLSTATE `query_canceled`, raised for statement timeouts and user cancels.
const SQLSTATE_QUERY_CANCELED: &str = "57014";

/// Identity and DSN of one database connection.
///
/// `id` scopes pool reuse. The DSN may contain credentials and is never
/// printed.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionTarget {
    pub id: String,
    pub dsn: String,
}

impl ConnectionTarget {
    pub fn new(id: impl Into<String>, dsn: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            dsn: dsn.into(),
        }
    }
}

impl std::fmt::Debug for ConnectionTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionTarget")
            .field("id", &self.id)
            .field("dsn", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    ReadOnly,
    Writable,
}

/// Per-call execution options.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Requested statement timeout; clamped by [`SessionConfig`].
    pub timeout_ms: Option<u64>,
    /// Reuse a cached pool for this key. Without it the pool lives for one call.
    pub cache_key: Option<String>,
}

impl SessionOptions {
    pub fn with_timeout(timeout_ms: Option<u64>) -> Self {
        Self {
            timeout_ms,
            cache_key: None,
        }
    }

    pub fn cached(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }
}

/// Settings applied to one session. Computed per call, never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDirective {
    pub timeout_ms: u64,
    pub search_path: Vec<String>,
    pub mode: SessionMode,
    pub cache_key: Option<String>,
}

impl SessionDirective {
    /// Statements sent after checkout, in order.
    pub fn begin_statements(&self) -> Vec<String> {
        let begin = match self.mode {
            SessionMode::ReadOnly => "BEGIN READ ONLY",
            SessionMode::Writable => "BEGIN",
        };
        let mut statements = vec![
            begin.to_string(),
            format!("SET LOCAL statement_timeout = {}", self.timeout_ms),
            format!(
                "SET LOCAL idle_in_transaction_session_timeout = {}",
                self.timeout_ms
            ),
        ];
        if !self.search_path.is_empty() {
            let schemas: Vec<String> = self.search_path.iter().map(|s| quote_ident(s)).collect();
            statements.push(format!("SET LOCAL search_path = {}", schemas.join(", ")));
        }
        statements
    }

    /// Statement that ends the transaction.
    pub fn end_statement(&self, succeeded: bool) -> &'static str {
        match self.mode {
            SessionMode::Writable if succeeded => "COMMIT",
            _ => "ROLLBACK",
        }
    }
}

/// Quotes an identifier unless it is a plain lowercase name.
pub fn quote_ident(name: &str) -> String {
    let plain = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_')
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if plain {
        name.to_string()
    } else {
        format!("\"{}\"", name.replace('"', "\"\""))
    }
}

/// Rows returned by one statement.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
pub struct QueryResult {
    pub columns: Vec<String>,
    #[cfg_attr(feature = "api", schema(value_type = Vec<Vec<Object>>))]
    pub rows: Vec<Vec<Value>>,
    pub row_count: usize,
    /// More rows were available than `max_rows`.
    pub truncated: bool,
}

impl QueryResult {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Values of one column, in row order.
    pub fn column_values(&self, index: usize) -> impl Iterator<Item = &Value> {
        self.rows.iter().filter_map(move |row| row.get(index))
    }
}

/// Failure reported by a connection, before mapping to [`Error`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbFailure {
    pub sqlstate: Option<String>,
    /// Already formatted for display; never contains the DSN.
    pub message: String,
    /// The connection can no longer be used.
    pub connection_lost: bool,
}

impl DbFailure {
    pub fn server(sqlstate: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            sqlstate: Some(sqlstate.into()),
            message: message.into(),
            connection_lost: false,
        }
    }

    pub fn lost(message: impl Into<String>) -> Self {
        Self {
            sqlstate: None,
            message: message.into(),
            connection_lost: true,
        }
    }

    /// Maps the failure to the public error taxonomy.
    pub fn into_error(self, timeout_ms: u64) -> Error {
        if self.sqlstate.as_deref() == Some(SQLSTATE_QUERY_CANCELED)
            && self.message.contains("statement timeout")
        {
            return Error::QueryTimeout {
                timeout_ms,
                statement: None,
            };
        }
        if self.connection_lost {
            return Error::ConnectionUnavailable {
                reason: self.message,
                statement: None,
            };
        }
        Error::Database {
            message: self.message,
            sqlstate: self.sqlstate,
            statement: None,
        }
    }
}

/// One open database connection.
pub trait SessionConnection: Send {
    fn batch_execute(&mut self, sql: &str) -> Result<(), DbFailure>;

    /// Runs `stmt` with its bound values, keeping at most `max_rows` rows.
    fn query(&mut self, stmt: &CompiledStatement, max_rows: usize)
    -> Result<QueryResult, DbFailure>;
}

/// Opens connections for a target.
pub trait Connector: Send + Sync {
    fn connect(
        &self,
        target: &ConnectionTarget,
        config: &SessionConfig,
    ) -> Result<Box<dyn SessionConnection>, DbFailure>;
}

type ConnectionPool = Pool<Box<dyn SessionConnection>>;

/// Runs bodies inside isolated, bounded sessions.
pub struct SessionExecutor {
    connector: Arc<dyn Connector>,
    config: SessionConfig,
    /// Cached pools keyed by (cache key, target id).
    pools: Mutex<HashMap<(String, String), Arc<ConnectionPool>>>,
}

/// Handle passed to a session body.
pub struct Session<'a> {
    conn: &'a mut Box<dyn SessionConnection>,
    directive: &'a SessionDirective,
    max_rows: usize,
}

impl SessionExecutor {
    pub fn new(connector: Arc<dyn Connector>, config: SessionConfig) -> Self {
        Self {
            connector,
            config,
            pools: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn directive(&self, mode: SessionMode, opts: &SessionOptions) -> SessionDirective {
        SessionDirective {
            timeout_ms: self.config.resolve_timeout_ms(opts.timeout_ms),
            search_path: self.config.search_path.clone(),
            mode,
            cache_key: opts.cache_key.clone(),
        }
    }

    fn new_pool(&self, target: &ConnectionTarget) -> Arc<ConnectionPool> {
        let connector = Arc::clone(&self.connector);
        let config = self.config.clone();
        let target = target.clone();
        Pool::new(self.config.pool_size, move || {
            connector.connect(&target, &config).map_err(|f| {
                warn!(target_id = %target.id, error = %f.message, "connect failed");
                Error::ConnectionUnavailable {
                    reason: f.message,
                    statement: None,
                }
            })
        })
    }

    fn pool_for(&self, target: &ConnectionTarget, cache_key: Option<&str>) -> Arc<ConnectionPool> {
        let Some(key) = cache_key else {
            return self.new_pool(target);
        };
        let mut pools = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            pools
                .entry((key.to_string(), target.id.clone()))
                .or_insert_with(|| self.new_pool(target)),
        )
    }

    /// Stats of a cached pool, if one exists.
    pub fn pool_stats(&self, target: &ConnectionTarget, cache_key: &str) -> Option<PoolStats> {
        let pools = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
        pools
            .get(&(cache_key.to_string(), target.id.clone()))
            .map(|p| p.stats())
    }

    /// Checks out a connection, applies the directive, runs `body`, and ends
    /// the transaction.
    pub fn with_session<T, F>(
        &self,
        target: &ConnectionTarget,
        mode: SessionMode,
        opts: &SessionOptions,
        body: F,
    ) -> Result<T>
    where
        F: FnOnce(&mut Session<'_>) -> Result<T>,
    {
        let directive = self.directive(mode, opts);
        let timeout_ms = directive.timeout_ms;
        let pool = self.pool_for(target, directive.cache_key.as_deref());
        let mut conn = pool.acquire(self.config.acquire_timeout())?;
        debug!(
            target_id = %target.id,
            mode = ?mode,
            timeout_ms,
            cached = directive.cache_key.is_some(),
            "session acquired"
        );

        // Until cleanup succeeds the connection may be mid-transaction.
        conn.set_reusable(false);

        for sql in directive.begin_statements() {
            if let Err(f) = conn.batch_execute(&sql) {
                warn!(target_id = %target.id, error = %f.message, "session setup failed, discarding connection");
                conn.discard();
                return Err(f.into_error(timeout_ms));
            }
        }

        let outcome = {
            let mut session = Session {
                conn: &mut *conn,
                directive: &directive,
                max_rows: self.config.max_rows,
            };
            body(&mut session)
        };

        if let Err(e) = &outcome {
            if matches!(e, Error::QueryTimeout { .. }) {
                warn!(target_id = %target.id, timeout_ms, "statement timed out");
            } else {
                debug!(target_id = %target.id, error = %e, "session body failed");
            }
        }

        let end = directive.end_statement(outcome.is_ok());
        match conn.batch_execute(end) {
            Ok(()) => {
                conn.set_reusable(true);
                outcome
            }
            Err(f) => {
                warn!(target_id = %target.id, statement = end, error = %f.message, "session cleanup failed, discarding connection");
                conn.discard();
                match outcome {
                    Ok(_) if end == "COMMIT" => Err(f.into_error(timeout_ms)),
                    other => other,
                }
            }
        }
    }

    /// Guards and runs one read-only statement.
    pub fn run(
        &self,
        target: &ConnectionTarget,
        stmt: &CompiledStatement,
        opts: &SessionOptions,
    ) -> Result<QueryResult> {
        ensure_read_only(&stmt.text)?;
        self.with_session(target, SessionMode::ReadOnly, opts, |session| {
            session.query_gated(stmt)
        })
        .map_err(|e| e.with_statement(stmt))
    }
}

impl Session<'_> {
    pub fn directive(&self) -> &SessionDirective {
        self.directive
    }

    /// Runs `stmt`. Read-only sessions check it with the guard first.
    pub fn query(&mut self, stmt: &CompiledStatement) -> Result<QueryResult> {
        if self.directive.mode == SessionMode::ReadOnly {
            ensure_read_only(&stmt.text)?;
        }
        self.query_gated(stmt)
    }

    /// Runs a statement that was already guarded or built from fixed text.
    pub fn query_gated(&mut self, stmt: &CompiledStatement) -> Result<QueryResult> {
        self.conn
            .query(stmt, self.max_rows)
            .map_err(|f| f.into_error(self.directive.timeout_ms).with_statement(stmt))
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockConnector;
    use super::*;
    use crate::template::VariableValue;
    use serde_json::json;
    use std::panic::{AssertUnwindSafe, catch_unwind};

    fn target() -> ConnectionTarget {
        ConnectionTarget::new("c1", "postgres://app:secret@db/app")
    }

    fn executor(mock: &MockConnector) -> SessionExecutor {
        SessionExecutor::new(Arc::new(mock.clone()), SessionConfig::default())
    }

    fn cached() -> SessionOptions {
        SessionOptions::default().cached("tenant-a")
    }

    #[test]
    fn directive_statements_in_order() {
        let mock = MockConnector::new();
        let exec = executor(&mock);
        exec.run(
            &target(),
            &CompiledStatement::new("select $1", vec![VariableValue::Integer(1)]),
            &SessionOptions::with_timeout(Some(250)),
        )
        .unwrap();
        assert_eq!(
            mock.executed(),
            vec![
                "BEGIN READ ONLY",
                "SET LOCAL statement_timeout = 250",
                "SET LOCAL idle_in_transaction_session_timeout = 250",
                "SET LOCAL search_path = pg_catalog, \"$user\"",
                "select $1",
                "ROLLBACK",
            ]
        );
    }

    #[test]
    fn timeout_is_clamped() {
        let exec = executor(&MockConnector::new());
        let d = exec.directive(SessionMode::ReadOnly, &SessionOptions::with_timeout(Some(60_000)));
        assert_eq!(d.timeout_ms, 10_000);
        let d = exec.directive(SessionMode::ReadOnly, &SessionOptions::default());
        assert_eq!(d.timeout_ms, 5_000);
    }

    #[test]
    fn writable_commits_on_success_and_rolls_back_on_error() {
        let mock = MockConnector::new();
        let exec = executor(&mock);
        let stmt = CompiledStatement::new("SELECT pg_cancel_backend($1) AS ok", vec![]);
        exec.with_session(&target(), SessionMode::Writable, &SessionOptions::default(), |s| {
            s.query_gated(&stmt)
        })
        .unwrap();
        assert_eq!(mock.executed().first().map(String::as_str), Some("BEGIN"));
        assert_eq!(mock.executed().last().map(String::as_str), Some("COMMIT"));

        let mock = MockConnector::new();
        let exec = executor(&mock);
        let result: Result<()> =
            exec.with_session(&target(), SessionMode::Writable, &SessionOptions::default(), |_| {
                Err(Error::InvalidParams("nope".to_string()))
            });
        assert!(result.is_err());
        assert_eq!(mock.executed().last().map(String::as_str), Some("ROLLBACK"));
    }

    #[test]
    fn readonly_session_rechecks_guard() {
        let mock = MockConnector::new();
        let exec = executor(&mock);
        let err = exec
            .with_session(&target(), SessionMode::ReadOnly, &SessionOptions::default(), |s| {
                s.query(&CompiledStatement::new("delete from t", vec![]))
            })
            .unwrap_err();
        assert_eq!(err.kind(), "not_read_only");
        assert!(!mock.executed().iter().any(|s| s == "delete from t"));
    }

    #[test]
    fn run_rejects_before_connecting() {
        let mock = MockConnector::new();
        let exec = executor(&mock);
        let err = exec
            .run(&target(), &CompiledStatement::new("update t set x = 1", vec![]), &cached())
            .unwrap_err();
        assert_eq!(err.kind(), "not_read_only");
        assert_eq!(mock.connects(), 0);
    }

    #[test]
    fn statement_timeout_maps_to_query_timeout() {
        let mock = MockConnector::new();
        mock.push_failure(DbFailure::server(
            "57014",
            "ERROR: canceling statement due to statement timeout",
        ));
        let exec = executor(&mock);
        let stmt = CompiledStatement::new("select pg_sleep(10)", vec![]);
        let err = exec.run(&target(), &stmt, &cached()).unwrap_err();
        assert_eq!(err.kind(), "query_timeout");
        assert_eq!(err.statement().map(|s| s.text.as_str()), Some("select pg_sleep(10)"));
        assert_eq!(mock.executed().last().map(String::as_str), Some("ROLLBACK"));

        let stats = exec.pool_stats(&target(), "tenant-a").unwrap();
        assert_eq!(stats.released, 1);
    }

    #[test]
    fn user_cancel_is_a_database_error() {
        let mock = MockConnector::new();
        mock.push_failure(DbFailure::server(
            "57014",
            "ERROR: canceling statement due to user request",
        ));
        let err = executor(&mock)
            .run(&target(), &CompiledStatement::new("select 1", vec![]), &cached())
            .unwrap_err();
        assert_eq!(err.kind(), "database_error");
    }

    #[test]
    fn lost_connection_is_unavailable_and_discarded() {
        let mock = MockConnector::new();
        mock.push_failure(DbFailure::lost("connection closed"));
        mock.fail_statement("ROLLBACK", DbFailure::lost("connection closed"));
        let exec = executor(&mock);
        let err = exec
            .run(&target(), &CompiledStatement::new("select 1", vec![]), &cached())
            .unwrap_err();
        assert_eq!(err.kind(), "connection_unavailable");
        let stats = exec.pool_stats(&target(), "tenant-a").unwrap();
        assert_eq!(stats.discarded, 1);
        assert_eq!(stats.idle, 0);
    }

    #[test]
    fn failed_commit_is_reported() {
        let mock = MockConnector::new();
        mock.fail_statement("COMMIT", DbFailure::server("40001", "ERROR: could not serialize"));
        let exec = executor(&mock);
        let err = exec
            .with_session(&target(), SessionMode::Writable, &cached(), |_| Ok(()))
            .unwrap_err();
        assert_eq!(err.kind(), "database_error");
        assert_eq!(exec.pool_stats(&target(), "tenant-a").unwrap().discarded, 1);
    }

    #[test]
    fn failed_rollback_keeps_result_but_discards() {
        let mock = MockConnector::new();
        mock.fail_statement("ROLLBACK", DbFailure::lost("connection reset"));
        let exec = executor(&mock);
        let result = exec
            .run(&target(), &CompiledStatement::new("select 1", vec![]), &cached())
            .unwrap();
        assert_eq!(result.row_count, 0);
        assert_eq!(exec.pool_stats(&target(), "tenant-a").unwrap().discarded, 1);
    }

    #[test]
    fn setup_failure_discards_connection() {
        let mock = MockConnector::new();
        mock.fail_statement("SET LOCAL search_path", DbFailure::server("3F000", "ERROR: bad schema"));
        let exec = executor(&mock);
        let err = exec
            .run(&target(), &CompiledStatement::new("select 1", vec![]), &cached())
            .unwrap_err();
        assert_eq!(err.kind(), "database_error");
        assert!(!mock.executed().iter().any(|s| s == "select 1"));
        assert_eq!(exec.pool_stats(&target(), "tenant-a").unwrap().discarded, 1);
    }

    #[test]
    fn cleanup_balanced_when_body_errors_or_panics() {
        let mock = MockConnector::new();
        let exec = executor(&mock);

        let _ = exec.with_session(&target(), SessionMode::ReadOnly, &cached(), |_| {
            Err::<(), _>(Error::InvalidParams("body failed".to_string()))
        });

        let panicked = catch_unwind(AssertUnwindSafe(|| {
            let _ = exec.with_session(&target(), SessionMode::ReadOnly, &cached(), |_| {
                if true {
                    panic!("body panicked");
                }
                Ok(())
            });
        }));
        assert!(panicked.is_err());

        let stats = exec.pool_stats(&target(), "tenant-a").unwrap();
        assert_eq!(stats.acquired, 2);
        assert_eq!(stats.acquired, stats.released + stats.discarded);
        assert_eq!(stats.discarded, 1);
        assert_eq!(stats.in_flight, stats.idle);
    }

    #[test]
    fn cached_pool_reuses_connection() {
        let mock = MockConnector::new();
        let exec = executor(&mock);
        let stmt = CompiledStatement::new("select 1", vec![]);
        exec.run(&target(), &stmt, &cached()).unwrap();
        exec.run(&target(), &stmt, &cached()).unwrap();
        assert_eq!(mock.connects(), 1);

        exec.run(&target(), &stmt, &SessionOptions::default()).unwrap();
        assert_eq!(mock.connects(), 2);

        let other = ConnectionTarget::new("c2", "postgres://db/other");
        exec.run(&other, &stmt, &cached()).unwrap();
        assert_eq!(mock.connects(), 3);
    }

    #[test]
    fn connect_failure_is_unavailable() {
        let mock = MockConnector::new();
        mock.fail_connect(DbFailure::lost("connection refused"));
        let err = executor(&mock)
            .run(&target(), &CompiledStatement::new("select 1", vec![]), &cached())
            .unwrap_err();
        assert_eq!(err.kind(), "connection_unavailable");
        assert!(!err.to_string().contains("secret"));
    }

    #[test]
    fn exhausted_pool_reports_statement() {
        let mock = MockConnector::new();
        let exec = SessionExecutor::new(
            Arc::new(mock.clone()),
            SessionConfig {
                pool_size: 1,
                acquire_timeout_ms: 10,
                ..Default::default()
            },
        );
        let stmt = CompiledStatement::new("select 1", vec![]);
        let err = exec
            .with_session(&target(), SessionMode::ReadOnly, &cached(), |_| {
                exec.run(&target(), &stmt, &cached())
            })
            .unwrap_err();
        assert_eq!(err.kind(), "connection_unavailable");
        assert_eq!(err.statement().map(|s| s.text.as_str()), Some("select 1"));

        let stats = exec.pool_stats(&target(), "tenant-a").unwrap();
        assert_eq!(stats.acquired, 1);
        assert_eq!(stats.in_flight, stats.idle);
    }

    #[test]
    fn setup_failure_reports_statement() {
        let mock = MockConnector::new();
        mock.fail_statement("BEGIN READ ONLY", DbFailure::lost("connection reset"));
        let err = executor(&mock)
            .run(&target(), &CompiledStatement::new("select 2", vec![]), &cached())
            .unwrap_err();
        assert_eq!(err.kind(), "connection_unavailable");
        assert_eq!(err.statement().map(|s| s.text.as_str()), Some("select 2"));
    }

    #[test]
    fn rows_are_capped() {
        let mock = MockConnector::new();
        mock.push_result(QueryResult {
            columns: vec!["n".to_string()],
            rows: (0..5).map(|n| vec![json!(n)]).collect(),
            row_count: 5,
            truncated: false,
        });
        let exec = SessionExecutor::new(
            Arc::new(mock.clone()),
            SessionConfig {
                max_rows: 3,
                ..Default::default()
            },
        );
        let result = exec
            .run(&target(), &CompiledStatement::new("select n", vec![]), &cached())
            .unwrap();
        assert_eq!(result.row_count, 3);
        assert!(result.truncated);
    }

    #[test]
    fn target_debug_redacts_dsn() {
        let shown = format!("{:?}", target());
        assert!(shown.contains("c1"));
        assert!(!shown.contains("secret"));
    }

    #[test]
    fn quote_ident_rules() {
        assert_eq!(quote_ident("pg_catalog"), "pg_catalog");
        assert_eq!(quote_ident("$user"), "\"$user\"");
        assert_eq!(quote_ident("Sales"), "\"Sales\"");
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }
}
