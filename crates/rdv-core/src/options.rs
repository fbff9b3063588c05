//! Allowed values for `enum` variables, read from an options query.

use serde_json::Value;

use crate::error::Result;
use crate::session::{ConnectionTarget, QueryResult, SessionExecutor, SessionOptions};
use crate::template::CompiledStatement;

/// Runs a parameterless, read-only options query and collects its first
/// column.
pub fn fetch_enum_options(
    executor: &SessionExecutor,
    target: &ConnectionTarget,
    sql: &str,
    opts: &SessionOptions,
) -> Result<Vec<String>> {
    let stmt = CompiledStatement::new(sql, Vec::new());
    let result = executor.run(target, &stmt, opts)?;
    Ok(collect_options(&result))
}

/// First-column values as strings: nulls skipped, duplicates dropped, order kept.
pub fn collect_options(result: &QueryResult) -> Vec<String> {
    let mut options: Vec<String> = Vec::new();
    for value in result.column_values(0) {
        let text = match value {
            Value::Null => continue,
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        if !options.contains(&text) {
            options.push(text);
        }
    }
    options
}
