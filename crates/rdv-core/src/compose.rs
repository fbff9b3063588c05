//! Composition of a base query and a calculation query into one statement.
//!
//! A calculation template refers to the base query's rows through the
//! `{{_sql}}` sentinel. Before compilation the sentinel is rewritten to
//! `select * from rdv_base`; after both templates are compiled the base
//! statement is wrapped as a CTE named `rdv_base` in front of the calculation
//! statement. Calculation parameters keep the low indices, base parameters are
//! shifted above them.

use crate::error::{Error, Result};
use crate::guard::ensure_read_only;
use crate::params::{max_placeholder_index, shift_placeholders};
use crate::template::{
    CompileOptions, CompiledStatement, InputValues, VariableDef, compile_with, extract_var_names,
};

/// CTE alias under which the base query's rows are visible to the calculation.
pub const BASE_ALIAS: &str = "rdv_base";

/// Sentinel variable name standing for the base query.
pub const BASE_SENTINEL: &str = "_sql";

/// Rewrites every `{{_sql}}` sentinel to a select over [`BASE_ALIAS`].
pub fn prepare_calc_template(calc_sql: &str) -> String {
    let mut out = String::with_capacity(calc_sql.len());
    let mut rest = calc_sql;
    while let Some(start) = rest.find("{{") {
        let after = &rest[start + 2..];
        let trimmed = after.trim_start();
        if let Some(tail) = trimmed.strip_prefix(BASE_SENTINEL)
            && let Some(end) = tail.trim_start().strip_prefix("}}")
        {
            out.push_str(&rest[..start]);
            out.push_str("select * from ");
            out.push_str(BASE_ALIAS);
            rest = end;
        } else {
            out.push_str(&rest[..start + 2]);
            rest = after;
        }
    }
    out.push_str(rest);
    out
}

/// Every name referenced by the (prepared) calculation template must be declared.
pub fn check_calc_variables(calc_sql: &str, vars: &[VariableDef]) -> Result<()> {
    let missing: Vec<String> = extract_var_names(calc_sql)
        .into_iter()
        .filter(|name| name != BASE_SENTINEL && !vars.iter().any(|v| &v.name == name))
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(Error::MissingVariable { missing })
    }
}

/// Merges `base` into `calc` as a CTE, renumbering base parameters.
pub fn compose(base: &CompiledStatement, calc: &CompiledStatement) -> Result<CompiledStatement> {
    check_param_range("base", base)?;
    check_param_range("calculation", calc)?;

    let offset = calc.values.len();
    let shifted = shift_placeholders(&base.text, offset);
    let text = format!("with {} as ( {} ) {}", BASE_ALIAS, shifted, calc.text);

    let mut values = Vec::with_capacity(calc.values.len() + base.values.len());
    values.extend(calc.values.iter().cloned());
    values.extend(base.values.iter().cloned());

    let mut placeholders = calc.placeholders.clone();
    placeholders.extend(base.placeholders.iter().cloned());

    let total = values.len();
    if max_placeholder_index(&text) > total {
        return Err(Error::ComposeParamCollision(format!(
            "merged text references ${} but only {} values are bound",
            max_placeholder_index(&text),
            total
        )));
    }

    Ok(CompiledStatement {
        text,
        values,
        placeholders,
    })
}

fn check_param_range(label: &str, stmt: &CompiledStatement) -> Result<()> {
    let max = max_placeholder_index(&stmt.text);
    if max > stmt.values.len() {
        return Err(Error::ComposeParamCollision(format!(
            "{} statement references ${} but binds {} values",
            label,
            max,
            stmt.values.len()
        )));
    }
    Ok(())
}

/// Guards, compiles and composes a base template and a calculation template.
pub fn compose_templates(
    base_sql: &str,
    calc_sql: &str,
    vars: &[VariableDef],
    values: &InputValues,
    opts: &CompileOptions,
) -> Result<CompiledStatement> {
    ensure_read_only(base_sql)?;
    ensure_read_only(calc_sql)?;

    let calc_prepared = prepare_calc_template(calc_sql);
    check_calc_variables(&calc_prepared, vars)?;

    let base = compile_with(base_sql, vars, values, opts)?;
    let calc = compile_with(&calc_prepared, vars, values, opts)?;
    compose(&base, &calc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::is_read_only;
    use crate::template::{VariableType, VariableValue};
    use serde_json::json;

    fn stmt(text: &str, values: &[&str]) -> CompiledStatement {
        CompiledStatement::new(text, values.iter().map(|v| VariableValue::from(*v)).collect())
    }

    #[test]
    fn calc_first_ordering() {
        let base = stmt("select * from orders where region = $1", &["v1"]);
        let calc = stmt(
            "select count(*) from (select * from rdv_base) x where x.kind = $1",
            &["base_param"],
        );
        let merged = compose(&base, &calc).unwrap();
        assert_eq!(
            merged.text,
            "with rdv_base as ( select * from orders where region = $2 ) \
             select count(*) from (select * from rdv_base) x where x.kind = $1"
        );
        assert_eq!(
            merged.values,
            vec![VariableValue::from("base_param"), VariableValue::from("v1")]
        );
        assert!(is_read_only(&merged.text));
    }

    #[test]
    fn base_param_moves_above_calc_params() {
        let base = stmt("select * from rdv_base", &["v1"]);
        let calc = stmt("select count(*) from ($1) x", &["base_param"]);
        let merged = compose(&base, &calc).unwrap();
        assert_eq!(
            merged.values,
            vec![VariableValue::from("base_param"), VariableValue::from("v1")]
        );
        assert!(merged.text.ends_with("select count(*) from ($1) x"));
        assert!(is_read_only(&merged.text));
    }

    #[test]
    fn parameter_count_is_sum() {
        let base = stmt("select $1, $2, $1", &["a", "b"]);
        let calc = stmt("select $1, $2, $3 from rdv_base", &["x", "y", "z"]);
        let merged = compose(&base, &calc).unwrap();
        assert_eq!(merged.values.len(), 5);
        assert_eq!(max_placeholder_index(&merged.text), 5);
        assert!(merged.text.starts_with("with rdv_base as ( select $4, $5, $4 )"));
    }

    #[test]
    fn dollar_text_in_literals_is_not_a_parameter() {
        let base = stmt("select '$5' as price", &[]);
        let calc = stmt("select * from rdv_base where note <> 'n/a $1' and qty > $1", &["7"]);
        let merged = compose(&base, &calc).unwrap();
        assert_eq!(
            merged.text,
            "with rdv_base as ( select '$5' as price ) \
             select * from rdv_base where note <> 'n/a $1' and qty > $1"
        );
        assert_eq!(merged.values.len(), 1);
    }

    #[test]
    fn out_of_range_input_is_collision() {
        let base = stmt("select $2", &["only-one"]);
        let calc = stmt("select * from rdv_base", &[]);
        let err = compose(&base, &calc).unwrap_err();
        assert_eq!(err.kind(), "compose_param_collision");
    }

    #[test]
    fn sentinel_rewritten() {
        assert_eq!(
            prepare_calc_template("select count(*) from ({{ _sql }}) t where {{x}} > 1"),
            "select count(*) from (select * from rdv_base) t where {{x}} > 1"
        );
        assert_eq!(prepare_calc_template("{{_sqlx}}"), "{{_sqlx}}");
    }

    #[test]
    fn calc_vars_must_be_declared() {
        let vars = vec![VariableDef::new("x", VariableType::Number)];
        assert!(check_calc_variables("select {{x}} from rdv_base", &vars).is_ok());
        let err = check_calc_variables("select {{x}}, {{y}} from rdv_base", &vars).unwrap_err();
        match err {
            Error::MissingVariable { missing } => assert_eq!(missing, vec!["y"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn end_to_end_templates() {
        let vars = vec![
            VariableDef::new("region", VariableType::Text).required(),
            VariableDef::new("min_total", VariableType::Number),
        ];
        let values = json!({"region": "emea", "min_total": 100});
        let merged = compose_templates(
            "select * from orders where region = {{region}}",
            "select count(*) from ({{_sql}}) o where o.total > {{min_total}}",
            &vars,
            values.as_object().unwrap(),
            &CompileOptions::default(),
        )
        .unwrap();
        assert_eq!(
            merged.text,
            "with rdv_base as ( select * from orders where region = $2 ) \
             select count(*) from (select * from rdv_base) o where o.total > $1"
        );
        assert_eq!(
            merged.values,
            vec![VariableValue::Integer(100), VariableValue::from("emea")]
        );
        assert_eq!(merged.placeholders, vec!["min_total", "region"]);
    }

    #[test]
    fn templates_must_be_read_only() {
        let err = compose_templates(
            "select 1",
            "delete from t",
            &[],
            &InputValues::new(),
            &CompileOptions::default(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), "not_read_only");
    }

    #[test]
    fn undeclared_calc_variable_rejected_before_compiling() {
        let err = compose_templates(
            "select 1",
            "select {{nope}} from ({{_sql}}) b",
            &[],
            &InputValues::new(),
            &CompileOptions::default(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), "missing_variable");
    }
}
