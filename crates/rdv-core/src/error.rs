//! Error taxonomy shared by every stage of the pipeline.
//!
//! Input errors (`NotReadOnly`, `UnknownVariable`, `MissingVariable`,
//! `TypeCoercion`, `InvalidParams`, `ConfirmationRequired`) are raised before
//! any database round trip. Infrastructure errors (`QueryTimeout`,
//! `ConnectionUnavailable`, `Database`) carry the compiled statement, when one
//! is known, for operator diagnostics. Nothing here is retried automatically.

use serde::Serialize;

use crate::template::{CompiledStatement, VariableType};

/// Error type for templating, composition and execution.
#[derive(Debug)]
pub enum Error {
    /// Statement failed the read-only guard.
    NotReadOnly { reason: String },
    /// Template references names absent from the variable schema.
    UnknownVariable { names: Vec<String> },
    /// Required variables with no value and no default.
    MissingVariable { missing: Vec<String> },
    /// A supplied value cannot be coerced to the declared type.
    TypeCoercion {
        name: String,
        expected: VariableType,
        reason: String,
    },
    /// Builder parameters failed validation (ranges, identifiers, pids).
    InvalidParams(String),
    /// Internal invariant violation while renumbering parameters. Indicates a bug.
    ComposeParamCollision(String),
    /// Statement was aborted by the server-side statement timeout.
    QueryTimeout {
        timeout_ms: u64,
        statement: Option<Box<CompiledStatement>>,
    },
    /// Pool acquisition or connect failed.
    ConnectionUnavailable {
        reason: String,
        statement: Option<Box<CompiledStatement>>,
    },
    /// Wrapped failure reported by the database. `message` is already redacted.
    Database {
        message: String,
        sqlstate: Option<String>,
        statement: Option<Box<CompiledStatement>>,
    },
    /// Administrative signal requested without explicit confirmation.
    ConfirmationRequired,
}

/// Result alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Wire name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::NotReadOnly { .. } => "not_read_only",
            Error::UnknownVariable { .. } => "unknown_variable",
            Error::MissingVariable { .. } => "missing_variable",
            Error::TypeCoercion { .. } => "type_coercion_error",
            Error::InvalidParams(_) => "invalid_params",
            Error::ComposeParamCollision(_) => "compose_param_collision",
            Error::QueryTimeout { .. } => "query_timeout",
            Error::ConnectionUnavailable { .. } => "connection_unavailable",
            Error::Database { .. } => "database_error",
            Error::ConfirmationRequired => "confirmation_required",
        }
    }

    /// True for caller input errors, which are correctable and never retried.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            Error::NotReadOnly { .. }
                | Error::UnknownVariable { .. }
                | Error::MissingVariable { .. }
                | Error::TypeCoercion { .. }
                | Error::InvalidParams(_)
                | Error::ConfirmationRequired
        )
    }

    /// Compiled statement attached for diagnostics, if any.
    pub fn statement(&self) -> Option<&CompiledStatement> {
        match self {
            Error::QueryTimeout { statement, .. }
            | Error::ConnectionUnavailable { statement, .. }
            | Error::Database { statement, .. } => statement.as_deref(),
            _ => None,
        }
    }

    /// Attaches `stmt` to infrastructure errors that do not carry one yet.
    pub fn with_statement(mut self, stmt: &CompiledStatement) -> Self {
        match &mut self {
            Error::QueryTimeout { statement, .. }
            | Error::ConnectionUnavailable { statement, .. }
            | Error::Database { statement, .. } => {
                if statement.is_none() {
                    *statement = Some(Box::new(stmt.clone()));
                }
            }
            _ => {}
        }
        self
    }

    /// Builds the body returned to external callers.
    ///
    /// Database error text is only included when `expose_db_errors` is set.
    /// Bound values are never part of the body.
    pub fn to_body(&self, expose_db_errors: bool) -> ErrorBody {
        let message = match self {
            Error::Database { message, .. } if expose_db_errors => Some(message.clone()),
            Error::Database { .. } => Some("database error".to_string()),
            other => Some(other.to_string()),
        };
        let missing = match self {
            Error::MissingVariable { missing } => Some(missing.clone()),
            _ => None,
        };
        ErrorBody {
            error: self.kind().to_string(),
            message,
            missing,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::NotReadOnly { reason } => {
                write!(f, "only read-only SELECT/WITH statements are allowed: {}", reason)
            }
            Error::UnknownVariable { names } => {
                write!(f, "undefined variable(s): {}", names.join(", "))
            }
            Error::MissingVariable { missing } => {
                write!(f, "missing required variable(s): {}", missing.join(", "))
            }
            Error::TypeCoercion {
                name,
                expected,
                reason,
            } => write!(f, "variable {} must be a {}: {}", name, expected, reason),
            Error::InvalidParams(msg) => write!(f, "invalid parameters: {}", msg),
            Error::ComposeParamCollision(msg) => {
                write!(f, "parameter renumbering collision: {}", msg)
            }
            Error::QueryTimeout { timeout_ms, .. } => {
                write!(f, "query exceeded the {} ms statement timeout", timeout_ms)
            }
            Error::ConnectionUnavailable { reason, .. } => {
                write!(f, "connection unavailable: {}", reason)
            }
            Error::Database { message, .. } => write!(f, "database error: {}", message),
            Error::ConfirmationRequired => write!(f, "explicit confirmation is required"),
        }
    }
}

impl std::error::Error for Error {}

/// Error shape returned to external callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missing: Option<Vec<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::VariableValue;

    fn stmt() -> CompiledStatement {
        CompiledStatement {
            text: "select $1".to_string(),
            values: vec![VariableValue::Text("secret".to_string())],
            placeholders: vec!["token".to_string()],
        }
    }

    #[test]
    fn missing_variable_body_lists_names() {
        let err = Error::MissingVariable {
            missing: vec!["id".to_string()],
        };
        let body = err.to_body(false);
        assert_eq!(body.error, "missing_variable");
        assert_eq!(body.missing, Some(vec!["id".to_string()]));
        assert!(err.is_input_error());
    }

    #[test]
    fn database_message_redacted_unless_exposed() {
        let err = Error::Database {
            message: "ERROR: relation \"payroll\" does not exist".to_string(),
            sqlstate: Some("42P01".to_string()),
            statement: None,
        };
        assert_eq!(
            err.to_body(false).message.as_deref(),
            Some("database error")
        );
        assert!(err.to_body(true).message.unwrap().contains("payroll"));
        assert!(!err.is_input_error());
    }

    #[test]
    fn with_statement_fills_only_empty_slot() {
        let err = Error::QueryTimeout {
            timeout_ms: 5000,
            statement: None,
        }
        .with_statement(&stmt());
        assert_eq!(err.statement().map(|s| s.text.as_str()), Some("select $1"));

        let other = CompiledStatement {
            text: "select 2".to_string(),
            values: vec![],
            placeholders: vec![],
        };
        let err = err.with_statement(&other);
        assert_eq!(err.statement().map(|s| s.text.as_str()), Some("select $1"));
    }

    #[test]
    fn body_never_contains_bound_values() {
        let err = Error::Database {
            message: "boom".to_string(),
            sqlstate: None,
            statement: Some(Box::new(stmt())),
        };
        let json = serde_json::to_string(&err.to_body(true)).unwrap();
        assert!(!json.contains("secret"));
    }

    #[test]
    fn input_errors_are_not_retryable() {
        assert!(Error::ConfirmationRequired.is_input_error());
        assert!(
            !Error::ConnectionUnavailable {
                reason: "pool exhausted".to_string(),
                statement: None
            }
            .is_input_error()
        );
    }
}
