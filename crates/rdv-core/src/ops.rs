//! Fixed introspection statements for operators.
//!
//! Each [`OpsAction`] maps to exactly one hard-coded, parameterized query over
//! `pg_stat_activity` / `pg_locks`. The texts are trusted and already in final
//! positional form; only the small parameter object is validated.
//!
//! Backend signalling (`pg_cancel_backend` / `pg_terminate_backend`) is the
//! only statement that runs in a writable session. Every signal attempt is
//! recorded through an [`AuditSink`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::template::{CompiledStatement, VariableValue};

/// Upper bound for `minMinutes` (one week).
pub const MAX_MIN_MINUTES: i64 = 7 * 24 * 60;
/// Upper bound for `limit`.
pub const MAX_LIMIT: i64 = 1000;

const DEFAULT_MIN_MINUTES: i64 = 5;
const DEFAULT_LIMIT: i64 = 200;

/// Enumerated operator actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
pub enum OpsAction {
    LongRunningActivity,
    BlockingActivity,
    LongTransactions,
    WaitingLocks,
    ConnectionsOverview,
}

impl OpsAction {
    pub const ALL: [OpsAction; 5] = [
        OpsAction::LongRunningActivity,
        OpsAction::BlockingActivity,
        OpsAction::LongTransactions,
        OpsAction::WaitingLocks,
        OpsAction::ConnectionsOverview,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OpsAction::LongRunningActivity => "long_running_activity",
            OpsAction::BlockingActivity => "blocking_activity",
            OpsAction::LongTransactions => "long_transactions",
            OpsAction::WaitingLocks => "waiting_locks",
            OpsAction::ConnectionsOverview => "connections_overview",
        }
    }
}

impl std::fmt::Display for OpsAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OpsAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        OpsAction::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| Error::InvalidParams(format!("unknown ops action: {}", s)))
    }
}

/// Optional parameters; absent fields take their defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
pub struct OpsParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_minutes: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_idle: Option<bool>,
}

impl OpsParams {
    fn min_minutes(&self) -> Result<i64> {
        in_range("minMinutes", self.min_minutes.unwrap_or(DEFAULT_MIN_MINUTES), MAX_MIN_MINUTES)
    }

    fn limit(&self) -> Result<i64> {
        in_range("limit", self.limit.unwrap_or(DEFAULT_LIMIT), MAX_LIMIT)
    }
}

fn in_range(field: &str, value: i64, max: i64) -> Result<i64> {
    if (1..=max).contains(&value) {
        Ok(value)
    } else {
        Err(Error::InvalidParams(format!(
            "{} must be between 1 and {}, got {}",
            field, max, value
        )))
    }
}

/// Builds the fixed statement for `action`.
pub fn build(action: OpsAction, params: &OpsParams) -> Result<CompiledStatement> {
    match action {
        OpsAction::LongRunningActivity => {
            let values = vec![params.min_minutes()?.into(), params.limit()?.into()];
            let not_idle = params.not_idle.unwrap_or(true);
            Ok(CompiledStatement::new(build_long_running_query(not_idle), values))
        }
        OpsAction::BlockingActivity => {
            let values = vec![params.min_minutes()?.into(), params.limit()?.into()];
            Ok(CompiledStatement::new(BLOCKING_ACTIVITY_QUERY, values))
        }
        OpsAction::LongTransactions => {
            let values = vec![params.min_minutes()?.into(), params.limit()?.into()];
            Ok(CompiledStatement::new(LONG_TRANSACTIONS_QUERY, values))
        }
        OpsAction::WaitingLocks => Ok(CompiledStatement::new(
            WAITING_LOCKS_QUERY,
            vec![params.limit()?.into()],
        )),
        OpsAction::ConnectionsOverview => Ok(CompiledStatement::new(
            CONNECTIONS_OVERVIEW_QUERY,
            vec![params.limit()?.into()],
        )),
    }
}

fn build_long_running_query(not_idle: bool) -> String {
    let state_filter = if not_idle { "state <> 'idle'" } else { "TRUE" };
    format!(
        r#"
SELECT
  pid,
  usename,
  application_name,
  client_addr,
  state,
  wait_event_type,
  wait_event,
  backend_type,
  (now() - query_start)::text AS run_for,
  LEFT(query, 2000) AS query
FROM pg_catalog.pg_stat_activity
WHERE {state_filter}
  AND pid <> pg_backend_pid()
  AND (now() - query_start) > (interval '1 minute' * $1)
ORDER BY run_for DESC
LIMIT $2"#
    )
}

const BLOCKING_ACTIVITY_QUERY: &str = r#"
SELECT
  a.pid               AS blocked_pid,
  a.usename           AS blocked_user,
  a.application_name  AS blocked_app,
  a.client_addr       AS blocked_client,
  (now() - a.query_start)::text AS blocked_for,
  a.state             AS blocked_state,
  LEFT(a.query, 2000) AS blocked_query,
  b.pid               AS blocking_pid,
  b.usename           AS blocking_user,
  b.application_name  AS blocking_app,
  (now() - b.query_start)::text AS blocking_for,
  b.state             AS blocking_state,
  LEFT(b.query, 2000) AS blocking_query
FROM pg_catalog.pg_stat_activity a
JOIN LATERAL unnest(pg_catalog.pg_blocking_pids(a.pid)) AS bp(blocking_pid) ON TRUE
JOIN pg_catalog.pg_stat_activity b ON b.pid = bp.blocking_pid
WHERE a.pid <> pg_backend_pid()
  AND (now() - a.query_start) > (interval '1 minute' * $1)
ORDER BY blocked_for DESC
LIMIT $2"#;

const LONG_TRANSACTIONS_QUERY: &str = r#"
SELECT
  pid,
  usename,
  application_name,
  client_addr,
  state,
  (now() - xact_start)::text AS xact_for,
  (now() - query_start)::text AS run_for,
  LEFT(query, 2000) AS query
FROM pg_catalog.pg_stat_activity
WHERE xact_start IS NOT NULL
  AND pid <> pg_backend_pid()
  AND (now() - xact_start) > (interval '1 minute' * $1)
ORDER BY xact_for DESC
LIMIT $2"#;

const WAITING_LOCKS_QUERY: &str = r#"
SELECT
  l.locktype,
  l.mode,
  l.pid,
  l.relation,
  n.nspname AS schema,
  c.relname AS relation_name,
  a.usename,
  a.application_name,
  a.state,
  (now() - a.query_start)::text AS run_for,
  LEFT(a.query, 2000) AS query
FROM pg_catalog.pg_locks l
LEFT JOIN pg_catalog.pg_stat_activity a ON a.pid = l.pid
LEFT JOIN pg_catalog.pg_class c ON c.oid = l.relation
LEFT JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
WHERE l.granted = FALSE
ORDER BY run_for DESC NULLS LAST
LIMIT $1"#;

const CONNECTIONS_OVERVIEW_QUERY: &str = r#"
SELECT
  a.usename,
  a.application_name,
  COUNT(*) AS sessions,
  SUM(CASE WHEN a.state = 'active' THEN 1 ELSE 0 END) AS active,
  SUM(CASE WHEN a.state = 'idle' THEN 1 ELSE 0 END) AS idle,
  SUM(CASE WHEN a.state = 'idle in transaction' THEN 1 ELSE 0 END) AS idle_in_xact
FROM pg_catalog.pg_stat_activity a
GROUP BY a.usename, a.application_name
ORDER BY sessions DESC, active DESC
LIMIT $1"#;

// ============================================================
// Backend signalling
// ============================================================

/// Administrative signal sent to a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
pub enum SignalMode {
    Cancel,
    Terminate,
}

impl SignalMode {
    fn function(&self) -> &'static str {
        match self {
            SignalMode::Cancel => "pg_cancel_backend",
            SignalMode::Terminate => "pg_terminate_backend",
        }
    }
}

impl std::fmt::Display for SignalMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalMode::Cancel => f.write_str("cancel"),
            SignalMode::Terminate => f.write_str("terminate"),
        }
    }
}

/// Builds `SELECT pg_cancel_backend($1)` / `pg_terminate_backend($1)`.
pub fn build_signal(pid: i32, mode: SignalMode) -> Result<CompiledStatement> {
    if pid <= 0 {
        return Err(Error::InvalidParams(format!(
            "pid must be positive, got {}",
            pid
        )));
    }
    Ok(CompiledStatement::new(
        format!("SELECT {}($1) AS ok", mode.function()),
        vec![VariableValue::Integer(pid as i64)],
    ))
}

/// Outcome of a signal attempt, as recorded in the audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalOutcome {
    /// The server accepted the signal.
    Signalled,
    /// The server returned false (no such backend or not permitted).
    NotSignalled,
    /// Execution failed; holds the error kind.
    Failed(String),
}

/// One administrative action: who, against what, and how it ended.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub actor: String,
    pub connection: String,
    pub pid: i32,
    pub mode: SignalMode,
    pub outcome: SignalOutcome,
    pub at: DateTime<Utc>,
}

/// Destination for administrative audit records.
pub trait AuditSink: Send + Sync {
    fn record(&self, record: &AuditRecord);
}

/// Audit sink that writes records to the `tracing` log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, record: &AuditRecord) {
        info!(
            target: "rdv::audit",
            actor = %record.actor,
            connection = %record.connection,
            pid = record.pid,
            mode = %record.mode,
            outcome = ?record.outcome,
            at = %record.at.to_rfc3339(),
            "backend signal"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::is_read_only;

    #[test]
    fn long_running_activity_params() {
        let stmt = build(
            OpsAction::LongRunningActivity,
            &OpsParams {
                min_minutes: Some(5),
                limit: Some(200),
                not_idle: Some(true),
            },
        )
        .unwrap();
        assert_eq!(stmt.values, vec![VariableValue::Integer(5), VariableValue::Integer(200)]);
        assert!(stmt.text.contains("interval '1 minute' * $1"));
        assert!(stmt.text.contains("LIMIT $2"));
        assert!(stmt.text.contains("state <> 'idle'"));
    }

    #[test]
    fn not_idle_false_drops_state_filter() {
        let stmt = build(
            OpsAction::LongRunningActivity,
            &OpsParams {
                not_idle: Some(false),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(!stmt.text.contains("state <> 'idle'"));
        assert!(stmt.text.contains("WHERE TRUE"));
    }

    #[test]
    fn defaults_applied() {
        let stmt = build(OpsAction::LongTransactions, &OpsParams::default()).unwrap();
        assert_eq!(stmt.values, vec![VariableValue::Integer(5), VariableValue::Integer(200)]);
        let stmt = build(OpsAction::WaitingLocks, &OpsParams::default()).unwrap();
        assert_eq!(stmt.values, vec![VariableValue::Integer(200)]);
        assert!(stmt.text.contains("LIMIT $1"));
    }

    #[test]
    fn limit_only_actions_ignore_min_minutes() {
        let params = OpsParams {
            min_minutes: Some(0),
            limit: Some(10),
            not_idle: None,
        };
        let stmt = build(OpsAction::ConnectionsOverview, &params).unwrap();
        assert_eq!(stmt.values, vec![VariableValue::Integer(10)]);
    }

    #[test]
    fn ranges_validated() {
        let too_long = OpsParams {
            min_minutes: Some(MAX_MIN_MINUTES + 1),
            ..Default::default()
        };
        let err = build(OpsAction::BlockingActivity, &too_long).unwrap_err();
        assert_eq!(err.kind(), "invalid_params");

        let zero_limit = OpsParams {
            limit: Some(0),
            ..Default::default()
        };
        assert!(build(OpsAction::WaitingLocks, &zero_limit).is_err());

        let max = OpsParams {
            min_minutes: Some(MAX_MIN_MINUTES),
            limit: Some(MAX_LIMIT),
            not_idle: None,
        };
        assert!(build(OpsAction::BlockingActivity, &max).is_ok());
    }

    #[test]
    fn every_action_is_read_only_and_consistent() {
        for action in OpsAction::ALL {
            let stmt = build(action, &OpsParams::default()).unwrap();
            assert!(is_read_only(&stmt.text), "{action} should pass the guard");
            assert_eq!(
                crate::params::max_placeholder_index(&stmt.text),
                stmt.values.len(),
                "{action}"
            );
        }
    }

    #[test]
    fn action_ids_round_trip_through_str() {
        for action in OpsAction::ALL {
            assert_eq!(action.as_str().parse::<OpsAction>().unwrap(), action);
        }
        assert!("vacuum_everything".parse::<OpsAction>().is_err());
        let parsed: OpsAction = serde_json::from_str("\"waiting_locks\"").unwrap();
        assert_eq!(parsed, OpsAction::WaitingLocks);
    }

    #[test]
    fn params_wire_shape() {
        let p: OpsParams =
            serde_json::from_str(r#"{"minMinutes": 10, "limit": 5, "notIdle": false}"#).unwrap();
        assert_eq!(p.min_minutes, Some(10));
        assert_eq!(p.not_idle, Some(false));
    }

    #[test]
    fn signal_statements() {
        let stmt = build_signal(4242, SignalMode::Terminate).unwrap();
        assert_eq!(stmt.text, "SELECT pg_terminate_backend($1) AS ok");
        assert_eq!(stmt.values, vec![VariableValue::Integer(4242)]);
        assert!(build_signal(0, SignalMode::Cancel).is_err());
    }
}
