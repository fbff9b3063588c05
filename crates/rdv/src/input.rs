//! Loading templates and JSON arguments from files, stdin or the command line.

use std::fmt;
use std::fs;
use std::io::{self, Read};
use std::path::Path;

use serde::de::DeserializeOwned;

#[derive(Debug)]
pub enum InputError {
    Io { source: String, err: io::Error },
    Json { source: String, err: serde_json::Error },
}

impl fmt::Display for InputError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputError::Io { source, err } => write!(f, "cannot read {}: {}", source, err),
            InputError::Json { source, err } => write!(f, "invalid JSON in {}: {}", source, err),
        }
    }
}

impl std::error::Error for InputError {}

/// Reads a template from `path`, or from stdin when `path` is `-`.
pub fn read_template(path: &str) -> Result<String, InputError> {
    if path == "-" {
        let mut buf = String::new();
        io::stdin()
            .read_to_string(&mut buf)
            .map_err(|err| InputError::Io {
                source: "stdin".to_string(),
                err,
            })?;
        return Ok(buf);
    }
    read_file(Path::new(path))
}

fn read_file(path: &Path) -> Result<String, InputError> {
    fs::read_to_string(path).map_err(|err| InputError::Io {
        source: path.display().to_string(),
        err,
    })
}

/// Parses a JSON argument: `@path` reads the file, anything else is inline JSON.
/// An absent argument yields the type's default.
pub fn json_arg<T: DeserializeOwned + Default>(arg: Option<&str>) -> Result<T, InputError> {
    let Some(arg) = arg else {
        return Ok(T::default());
    };
    let (source, text) = match arg.strip_prefix('@') {
        Some(path) => (path.to_string(), read_file(Path::new(path))?),
        None => ("argument".to_string(), arg.to_string()),
    };
    serde_json::from_str(&text).map_err(|err| InputError::Json { source, err })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdv_core::template::{InputValues, VariableDef, VariableType};
    use std::io::Write;

    #[test]
    fn template_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "select {{{{id}}}}").unwrap();
        let text = read_template(file.path().to_str().unwrap()).unwrap();
        assert_eq!(text, "select {{id}}");
    }

    #[test]
    fn missing_template_names_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.sql");
        let err = read_template(path.to_str().unwrap()).unwrap_err();
        assert!(err.to_string().contains("nope.sql"));
    }

    #[test]
    fn variables_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"[{{"name": "id", "type": "uuid", "required": true}}]"#).unwrap();
        let arg = format!("@{}", file.path().display());
        let vars: Vec<VariableDef> = json_arg(Some(&arg)).unwrap();
        assert_eq!(vars.len(), 1);
        assert_eq!(vars[0].var_type, VariableType::Uuid);
        assert!(vars[0].required);
    }

    #[test]
    fn inline_values_and_default() {
        let values: InputValues = json_arg(Some(r#"{"region": "emea"}"#)).unwrap();
        assert_eq!(values["region"], "emea");

        let empty: InputValues = json_arg(None).unwrap();
        assert!(empty.is_empty());

        let err = json_arg::<InputValues>(Some("{oops")).unwrap_err();
        assert!(matches!(err, InputError::Json { .. }));
    }
}
