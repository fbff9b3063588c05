//! rdv - compile, check and run read-only SQL templates.
//!
//! Usage:
//!   rdv check query.sql                         # read-only guard only
//!   rdv compile query.sql --values '{"id": 1}'  # positional SQL + values
//!   rdv compile query.sql --preview             # values inlined for reading
//!   rdv compose base.sql calc.sql --vars @vars.json
//!   rdv ops long_running_activity --params '{"minMinutes": 10}'
//!   rdv run query.sql --dsn postgres://...      # execute and print rows

mod input;

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{debug, error};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use rdv_core::compose::compose_templates;
use rdv_core::config::SessionConfig;
use rdv_core::guard::ensure_read_only;
use rdv_core::ops::{OpsAction, OpsParams, build};
use rdv_core::service::{CallContext, QueryInput, QueryService, StaticCredentials};
use rdv_core::session::SessionExecutor;
use rdv_core::session::pg::PgConnector;
use rdv_core::template::{CompileOptions, InputValues, VariableDef, compile_with, render_preview};

use input::{InputError, json_arg, read_template};

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

const CLI_CONNECTION: &str = "cli";

#[derive(Parser)]
#[command(name = "rdv", about = "Read-only SQL templates", version = rdv_core::VERSION)]
struct Args {
    /// More logging (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log errors.
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args)]
struct TemplateArgs {
    /// Variable schema: inline JSON array or @file.
    #[arg(long, value_name = "JSON")]
    vars: Option<String>,

    /// Input values: inline JSON object or @file.
    #[arg(long, value_name = "JSON")]
    values: Option<String>,

    /// Reject `raw` variables.
    #[arg(long)]
    no_raw: bool,
}

impl TemplateArgs {
    fn load(&self) -> Result<(Vec<VariableDef>, InputValues), CliError> {
        let vars: Vec<VariableDef> = json_arg(self.vars.as_deref())?;
        Ok((vars, json_arg(self.values.as_deref())?))
    }

    fn compile_options(&self) -> CompileOptions {
        CompileOptions {
            allow_raw: !self.no_raw,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Check that a template is a read-only statement.
    Check {
        /// Template file, or `-` for stdin.
        template: String,
    },
    /// Compile a template to positional SQL and bound values.
    Compile {
        template: String,
        #[command(flatten)]
        args: TemplateArgs,
        /// Print SQL with values inlined instead of JSON.
        #[arg(long)]
        preview: bool,
    },
    /// Compose a calculation template over a base template.
    Compose {
        base: String,
        calc: String,
        #[command(flatten)]
        args: TemplateArgs,
        #[arg(long)]
        preview: bool,
    },
    /// Print the statement for an introspection action.
    Ops {
        /// One of long_running_activity, blocking_activity, long_transactions,
        /// waiting_locks, connections_overview.
        action: OpsAction,
        /// Parameters: inline JSON object or @file.
        #[arg(long, value_name = "JSON")]
        params: Option<String>,
    },
    /// Compile and execute a template in a read-only session.
    Run {
        template: String,
        #[command(flatten)]
        args: TemplateArgs,
        /// Connection string.
        #[arg(long, env = "RDV_DSN", hide_env_values = true)]
        dsn: String,
        /// Statement timeout (ms).
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Rows to print.
        #[arg(long, default_value = "1000", env = "RDV_MAX_ROWS")]
        max_rows: usize,
    },
}

// ============================================================
// Errors
// ============================================================

#[derive(Debug)]
enum CliError {
    Input(InputError),
    Core(rdv_core::Error),
    Output(serde_json::Error),
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliError::Input(e) => write!(f, "{}", e),
            CliError::Core(e) => write!(f, "{}", e),
            CliError::Output(e) => write!(f, "cannot encode output: {}", e),
        }
    }
}

impl From<InputError> for CliError {
    fn from(e: InputError) -> Self {
        CliError::Input(e)
    }
}

impl From<rdv_core::Error> for CliError {
    fn from(e: rdv_core::Error) -> Self {
        CliError::Core(e)
    }
}

impl CliError {
    /// 2 for rejected input, 1 for everything else.
    fn exit_code(&self) -> u8 {
        match self {
            CliError::Input(_) => 2,
            CliError::Core(e) if e.is_input_error() => 2,
            _ => 1,
        }
    }
}

// ============================================================
// Main
// ============================================================

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    match execute(args.command) {
        Ok(output) => {
            println!("{}", output);
            ExitCode::SUCCESS
        }
        Err(e) => {
            match &e {
                CliError::Core(core) => error!(kind = core.kind(), "{}", e),
                _ => error!("{}", e),
            }
            ExitCode::from(e.exit_code())
        }
    }
}

fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        LevelFilter::ERROR
    } else {
        match verbose {
            0 => LevelFilter::WARN,
            1 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        }
    };

    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn to_json<T: Serialize>(value: &T) -> Result<String, CliError> {
    serde_json::to_string_pretty(value).map_err(CliError::Output)
}

fn execute(command: Command) -> Result<String, CliError> {
    match command {
        Command::Check { template } => {
            let sql = read_template(&template)?;
            ensure_read_only(&sql)?;
            Ok("ok".to_string())
        }
        Command::Compile {
            template,
            args,
            preview,
        } => {
            let sql = read_template(&template)?;
            let (vars, values) = args.load()?;
            ensure_read_only(&sql)?;
            let compiled = compile_with(&sql, &vars, &values, &args.compile_options())?;
            debug!(params = compiled.values.len(), "compiled");
            if preview {
                Ok(render_preview(&compiled))
            } else {
                to_json(&compiled)
            }
        }
        Command::Compose {
            base,
            calc,
            args,
            preview,
        } => {
            let base_sql = read_template(&base)?;
            let calc_sql = read_template(&calc)?;
            let (vars, values) = args.load()?;
            let composed =
                compose_templates(&base_sql, &calc_sql, &vars, &values, &args.compile_options())?;
            if preview {
                Ok(render_preview(&composed))
            } else {
                to_json(&composed)
            }
        }
        Command::Ops { action, params } => {
            let params: OpsParams = json_arg(params.as_deref())?;
            to_json(&build(action, &params)?)
        }
        Command::Run {
            template,
            args,
            dsn,
            timeout_ms,
            max_rows,
        } => {
            let sql = read_template(&template)?;
            let (variables, values) = args.load()?;
            let config = SessionConfig {
                max_rows,
                pool_size: 1,
                ..SessionConfig::default()
            };
            let service = QueryService::new(
                SessionExecutor::new(Arc::new(PgConnector), config),
                Arc::new(StaticCredentials::new().with(CLI_CONNECTION, dsn)),
            )
            .with_compile_options(args.compile_options());
            let ctx = CallContext {
                actor: CLI_CONNECTION.to_string(),
                connection_id: CLI_CONNECTION.to_string(),
                timeout_ms,
            };
            let input = QueryInput {
                sql,
                variables,
                values,
            };
            to_json(&service.execute(&ctx, &input)?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn template(text: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        file
    }

    fn path(file: &tempfile::NamedTempFile) -> String {
        file.path().to_str().unwrap().to_string()
    }

    fn template_args(vars: &str, values: &str) -> TemplateArgs {
        TemplateArgs {
            vars: Some(vars.to_string()),
            values: Some(values.to_string()),
            no_raw: false,
        }
    }

    #[test]
    fn check_rejects_writes() {
        let ok = template("-- report\nselect 1");
        assert_eq!(execute(Command::Check { template: path(&ok) }).unwrap(), "ok");

        let bad = template("select 1; drop table users");
        let err = execute(Command::Check { template: path(&bad) }).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn compile_prints_statement() {
        let file = template("select * from t where id = {{id}} and name = {{name}}");
        let out = execute(Command::Compile {
            template: path(&file),
            args: template_args(
                r#"[{"name":"id","type":"number"},{"name":"name","type":"text"}]"#,
                r#"{"id": 3, "name": "o'neil"}"#,
            ),
            preview: false,
        })
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["text"], "select * from t where id = $1 and name = $2");
        assert_eq!(value["values"], serde_json::json!([3, "o'neil"]));
    }

    #[test]
    fn compile_preview() {
        let file = template("select * from t where name = {{name}}");
        let out = execute(Command::Compile {
            template: path(&file),
            args: template_args(r#"[{"name":"name","type":"text"}]"#, r#"{"name": "o'neil"}"#),
            preview: true,
        })
        .unwrap();
        assert_eq!(out, "select * from t where name = 'o''neil'");
    }

    #[test]
    fn invalid_variable_name_rejected() {
        let file = template("select 1");
        let err = execute(Command::Compile {
            template: path(&file),
            args: template_args(r#"[{"name":"1bad","type":"text"}]"#, "{}"),
            preview: false,
        })
        .unwrap_err();
        assert!(matches!(err, CliError::Core(rdv_core::Error::InvalidParams(_))));
    }

    #[test]
    fn compose_numbers_calc_first() {
        let base = template("select * from orders where region = {{region}}");
        let calc = template("select count(*) from ({{_sql}}) o where o.kind = {{kind}}");
        let out = execute(Command::Compose {
            base: path(&base),
            calc: path(&calc),
            args: template_args(
                r#"[{"name":"region","type":"text"},{"name":"kind","type":"text"}]"#,
                r#"{"region": "emea", "kind": "retail"}"#,
            ),
            preview: false,
        })
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["values"], serde_json::json!(["retail", "emea"]));
    }

    #[test]
    fn ops_statement() {
        let out = execute(Command::Ops {
            action: OpsAction::LongRunningActivity,
            params: None,
        })
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["values"], serde_json::json!([5, 200]));
    }

    #[test]
    fn parses_subcommands() {
        let args = Args::try_parse_from(["rdv", "-v", "ops", "waiting_locks"]).unwrap();
        assert_eq!(args.verbose, 1);
        assert!(matches!(
            args.command,
            Command::Ops {
                action: OpsAction::WaitingLocks,
                ..
            }
        ));
        assert!(Args::try_parse_from(["rdv", "ops", "vacuum_everything"]).is_err());
    }
}
