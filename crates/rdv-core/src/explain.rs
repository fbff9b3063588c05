//! `EXPLAIN` wrapping for compiled statements.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::guard::ensure_read_only;
use crate::session::QueryResult;
use crate::template::CompiledStatement;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
pub enum ExplainFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
pub struct ExplainOptions {
    #[serde(default)]
    pub format: ExplainFormat,
    /// Executes the statement. Still bounded by the session timeout and
    /// read-only transaction.
    #[serde(default)]
    pub analyze: bool,
}

/// Prefixes `stmt` with `EXPLAIN (...)`. Values are unchanged.
///
/// The inner statement must pass the read-only guard.
pub fn build_explain(stmt: &CompiledStatement, opts: ExplainOptions) -> Result<CompiledStatement> {
    ensure_read_only(&stmt.text)?;

    let mut options = Vec::with_capacity(6);
    if opts.analyze {
        options.push("ANALYZE TRUE");
    }
    match opts.format {
        ExplainFormat::Json => options.push("FORMAT JSON"),
        ExplainFormat::Text => {
            options.extend(["FORMAT TEXT", "VERBOSE FALSE", "COSTS TRUE", "SETTINGS FALSE"])
        }
    }

    Ok(CompiledStatement {
        text: format!("EXPLAIN ({}) {}", options.join(", "), stmt.text),
        values: stmt.values.clone(),
        placeholders: stmt.placeholders.clone(),
    })
}

/// Joins the `QUERY PLAN` column of a text-format plan into one string.
pub fn plan_text(result: &QueryResult) -> String {
    let idx = result.column_index("QUERY PLAN").unwrap_or(0);
    result
        .column_values(idx)
        .map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// First cell of a JSON-format plan.
pub fn plan_json(result: &QueryResult) -> Option<Value> {
    result.rows.first().and_then(|row| row.first()).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::VariableValue;
    use serde_json::json;

    fn stmt() -> CompiledStatement {
        CompiledStatement::new("select * from t where id = $1", vec![VariableValue::Integer(3)])
    }

    #[test]
    fn text_format_options() {
        let e = build_explain(&stmt(), ExplainOptions::default()).unwrap();
        assert_eq!(
            e.text,
            "EXPLAIN (FORMAT TEXT, VERBOSE FALSE, COSTS TRUE, SETTINGS FALSE) \
             select * from t where id = $1"
        );
        assert_eq!(e.values, vec![VariableValue::Integer(3)]);
    }

    #[test]
    fn analyze_json() {
        let e = build_explain(
            &stmt(),
            ExplainOptions {
                format: ExplainFormat::Json,
                analyze: true,
            },
        )
        .unwrap();
        assert!(e.text.starts_with("EXPLAIN (ANALYZE TRUE, FORMAT JSON) select"));
    }

    #[test]
    fn inner_statement_is_guarded() {
        let err = build_explain(
            &CompiledStatement::new("delete from t", vec![]),
            ExplainOptions::default(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), "not_read_only");
    }

    #[test]
    fn plan_lines_joined() {
        let result = QueryResult {
            columns: vec!["QUERY PLAN".to_string()],
            rows: vec![
                vec![json!("Seq Scan on t  (cost=0.00..1.01 rows=1 width=4)")],
                vec![json!("  Filter: (id = 3)")],
            ],
            row_count: 2,
            truncated: false,
        };
        assert_eq!(
            plan_text(&result),
            "Seq Scan on t  (cost=0.00..1.01 rows=1 width=4)\n  Filter: (id = 3)"
        );
    }

    #[test]
    fn json_plan_is_first_cell() {
        let result = QueryResult {
            columns: vec!["QUERY PLAN".to_string()],
            rows: vec![vec![json!([{"Plan": {"Node Type": "Seq Scan"}}])]],
            row_count: 1,
            truncated: false,
        };
        assert_eq!(
            plan_json(&result),
            Some(json!([{"Plan": {"Node Type": "Seq Scan"}}]))
        );
    }
}
