//! PostgreSQL connector on the synchronous `postgres` client.

use fallible_iterator::FallibleIterator;
use native_tls::TlsConnector;
use postgres::config::SslMode;
use postgres::types::ToSql;
use postgres::{Client, Config, NoTls};
use postgres_native_tls::MakeTlsConnector;
use tracing::debug;

use super::types::cell_to_json;
use super::{ConnectionTarget, Connector, DbFailure, QueryResult, SessionConnection};
use crate::config::SessionConfig;
use crate::template::CompiledStatement;

const APPLICATION_NAME: &str = "rdv";

/// Opens real connections. TLS is used unless the DSN sets `sslmode=disable`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PgConnector;

impl Connector for PgConnector {
    fn connect(
        &self,
        target: &ConnectionTarget,
        config: &SessionConfig,
    ) -> Result<Box<dyn SessionConnection>, DbFailure> {
        let mut pg_config: Config = target.dsn.parse().map_err(|e| failure(&e))?;
        pg_config.connect_timeout(config.connect_timeout());
        if pg_config.get_application_name().is_none() {
            pg_config.application_name(APPLICATION_NAME);
        }

        let client = if matches!(pg_config.get_ssl_mode(), SslMode::Disable) {
            pg_config.connect(NoTls)
        } else {
            let tls = TlsConnector::builder()
                .build()
                .map_err(|e| DbFailure::lost(format!("TLS setup failed: {}", e)))?;
            pg_config.connect(MakeTlsConnector::new(tls))
        }
        .map_err(|e| DbFailure {
            connection_lost: true,
            ..failure(&e)
        })?;

        debug!(target_id = %target.id, "connected");
        Ok(Box::new(PgConnection { client }))
    }
}

struct PgConnection {
    client: Client,
}

impl SessionConnection for PgConnection {
    fn batch_execute(&mut self, sql: &str) -> Result<(), DbFailure> {
        self.client.batch_execute(sql).map_err(|e| failure(&e))
    }

    fn query(
        &mut self,
        stmt: &CompiledStatement,
        max_rows: usize,
    ) -> Result<QueryResult, DbFailure> {
        let prepared = self.client.prepare(&stmt.text).map_err(|e| failure(&e))?;
        let columns: Vec<String> = prepared
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect();

        let params = stmt.values.iter().map(|v| v as &dyn ToSql);
        let mut rows = self
            .client
            .query_raw(&prepared, params)
            .map_err(|e| failure(&e))?;

        let mut result = QueryResult {
            columns,
            ..Default::default()
        };
        while let Some(row) = rows.next().map_err(|e| failure(&e))? {
            if result.rows.len() == max_rows {
                result.truncated = true;
                break;
            }
            let cells = (0..row.len())
                .map(|idx| cell_to_json(&row, idx))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| failure(&e))?;
            result.rows.push(cells);
        }
        result.row_count = result.rows.len();
        Ok(result)
    }
}

fn failure(e: &postgres::Error) -> DbFailure {
    DbFailure {
        sqlstate: e.code().map(|c| c.code().to_string()),
        message: format_postgres_error(e),
        connection_lost: e.is_closed(),
    }
}

/// Formats a PostgreSQL error for display.
///
/// Server errors become `severity: message`; client errors are summarized.
pub fn format_postgres_error(e: &postgres::Error) -> String {
    if let Some(db_error) = e.as_db_error() {
        format!("{}: {}", db_error.severity(), db_error.message())
    } else {
        let msg = e.to_string();
        if msg.contains("Connection refused") {
            "connection refused".to_string()
        } else if msg.contains("password authentication failed") {
            "password authentication failed".to_string()
        } else if msg.contains("timed out") {
            "connection timed out".to_string()
        } else if msg.contains("does not exist") {
            msg.split("FATAL:")
                .last()
                .unwrap_or(&msg)
                .trim()
                .to_string()
        } else {
            msg
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_dsn_is_reported_without_connecting() {
        let target = ConnectionTarget::new("bad", "postgres://user:pw@host:notaport/db");
        let err = PgConnector
            .connect(&target, &SessionConfig::default())
            .err()
            .unwrap();
        assert!(!err.message.contains("pw"));
    }
}
