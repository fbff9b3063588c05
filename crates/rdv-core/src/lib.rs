//! rdv-core: read-only SQL templating and execution safety.
//!
//! Pipeline, leaf to root:
//! - `guard`: lexical read-only classifier
//! - `template`: `{{name}}` compiler, value coercion, preview rendering
//! - `params`: positional parameter scanning and renumbering
//! - `compose`: base + calculation composition via a CTE
//! - `session`: pooled, isolated, time-bounded execution
//! - `ops`: fixed introspection statements and backend signalling
//!
//! Around it:
//! - `explain`, `options`, `dsn`: EXPLAIN wrapping, enum option lookup, DSN checks
//! - `config`: session limits
//! - `service`: end-to-end facade used by the CLI and HTTP API

pub mod compose;
pub mod config;
pub mod dsn;
pub mod error;
pub mod explain;
pub mod guard;
pub mod ops;
pub mod options;
pub mod params;
pub mod service;
pub mod session;
pub mod template;

pub use error::{Error, ErrorBody, Result};

/// Crate version plus the git SHA it was built from.
pub const VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("RDV_GIT_SHA"), ")");
