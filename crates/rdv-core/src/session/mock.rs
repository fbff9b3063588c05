//! In-memory connector for testing the executor without a database.
//!
//! `MockConnector` records every statement sent by any of its connections and
//! replays scripted results. Clones share the same state, so a test keeps one
//! handle for assertions and hands another to the executor.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{ConnectionTarget, Connector, DbFailure, QueryResult, SessionConnection};
use crate::config::SessionConfig;
use crate::template::{CompiledStatement, VariableValue};

#[derive(Default)]
struct MockState {
    executed: Vec<String>,
    bound: Vec<Vec<VariableValue>>,
    /// Scripted outcomes for `query`, consumed in order.
    responses: VecDeque<Result<QueryResult, DbFailure>>,
    /// Batch statements starting with the prefix fail.
    failing_statements: Vec<(String, DbFailure)>,
    connect_failure: Option<DbFailure>,
    connects: usize,
}

/// Connector whose connections only record what they are asked to run.
#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<MockState>>,
}

impl MockConnector {
    /// Creates a connector that answers every query with an empty result.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues a successful result for the next query.
    pub fn push_result(&self, result: QueryResult) {
        self.lock().responses.push_back(Ok(result));
    }

    /// Queues a failure for the next query.
    pub fn push_failure(&self, failure: DbFailure) {
        self.lock().responses.push_back(Err(failure));
    }

    /// Makes every batch statement starting with `prefix` fail.
    pub fn fail_statement(&self, prefix: impl Into<String>, failure: DbFailure) {
        self.lock().failing_statements.push((prefix.into(), failure));
    }

    /// Makes every connect attempt fail.
    pub fn fail_connect(&self, failure: DbFailure) {
        self.lock().connect_failure = Some(failure);
    }

    /// Every statement sent so far, batch and query, in order.
    pub fn executed(&self) -> Vec<String> {
        self.lock().executed.clone()
    }

    /// Values bound to each query, in order.
    pub fn bound_values(&self) -> Vec<Vec<VariableValue>> {
        self.lock().bound.clone()
    }

    /// Number of connections opened.
    pub fn connects(&self) -> usize {
        self.lock().connects
    }
}

impl Connector for MockConnector {
    fn connect(
        &self,
        _target: &ConnectionTarget,
        _config: &SessionConfig,
    ) -> Result<Box<dyn SessionConnection>, DbFailure> {
        let mut state = self.lock();
        if let Some(failure) = &state.connect_failure {
            return Err(failure.clone());
        }
        state.connects += 1;
        Ok(Box::new(MockConnection {
            state: Arc::clone(&self.state),
        }))
    }
}

struct MockConnection {
    state: Arc<Mutex<MockState>>,
}

impl SessionConnection for MockConnection {
    fn batch_execute(&mut self, sql: &str) -> Result<(), DbFailure> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.executed.push(sql.to_string());
        match state
            .failing_statements
            .iter()
            .find(|(prefix, _)| sql.starts_with(prefix.as_str()))
        {
            Some((_, failure)) => Err(failure.clone()),
            None => Ok(()),
        }
    }

    fn query(
        &mut self,
        stmt: &CompiledStatement,
        max_rows: usize,
    ) -> Result<QueryResult, DbFailure> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.executed.push(stmt.text.clone());
        state.bound.push(stmt.values.clone());
        let mut result = state.responses.pop_front().unwrap_or_else(|| Ok(QueryResult::default()))?;
        if result.rows.len() > max_rows {
            result.rows.truncate(max_rows);
            result.truncated = true;
        }
        result.row_count = result.rows.len();
        Ok(result)
    }
}
