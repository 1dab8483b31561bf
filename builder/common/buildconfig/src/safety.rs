use lazy_static::lazy_static;
use serde_yaml::Value;

use crate::{ConfigError, STAGES};

lazy_static! {
    /// Substrings no user-provided string may contain: path traversal, and
    /// artifact-info forgery via names ending in `.{stage}.yml`.
    static ref FORBIDDEN_PATTERNS: Vec<String> = {
        let mut patterns = vec!["..".to_string()];
        for stage in STAGES {
            patterns.push(format!(".{stage}.yml"));
            patterns.push(format!(".{stage}.yaml"));
        }
        patterns
    };
}

/// Recursively rejects unsafe strings anywhere in user-provided data.
pub fn deep_check(data: &Value) -> Result<(), ConfigError> {
    match data {
        Value::Mapping(mapping) => {
            for (key, value) in mapping {
                deep_check(key)?;
                deep_check(value)?;
            }
            Ok(())
        }
        Value::Sequence(sequence) => {
            for item in sequence {
                deep_check(item)?;
            }
            Ok(())
        }
        Value::String(s) => {
            for pattern in FORBIDDEN_PATTERNS.iter() {
                if s.contains(pattern) {
                    return Err(ConfigError(format!(
                        "Forbidden pattern '{pattern}' found in '{s}'."
                    )));
                }
            }
            Ok(())
        }
        Value::Null | Value::Bool(_) | Value::Number(_) => Ok(()),
        Value::Tagged(_) => Err(ConfigError("Unexpected tagged value found".to_string())),
    }
}

/// Validates a file name produced by untrusted tooling output: non-empty,
/// not dash- or dot-prefixed, drawn from `[A-Za-z0-9._+-]`.
pub fn is_filename_valid(filename: &str, forbidden_filename: Option<&str>) -> bool {
    let mut chars = filename.chars();
    match chars.next() {
        None | Some('-') | Some('.') => return false,
        Some(_) => {}
    }
    if forbidden_filename == Some(filename) {
        return false;
    }
    filename
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '+'))
}

pub fn str_to_bool(input: &str) -> bool {
    matches!(input.to_lowercase().as_str(), "true" | "1")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_traversal_and_forged_records() {
        let bad = Value::String("../../etc/passwd".to_string());
        assert!(deep_check(&bad).is_err());

        let forged = serde_yaml::from_str::<Value>("files: [owned.publish.yml]").unwrap();
        assert!(deep_check(&forged).is_err());

        let fine = serde_yaml::from_str::<Value>("files: [archive.tar.gz]\ncount: 3").unwrap();
        assert!(deep_check(&fine).is_ok());
    }

    #[test]
    fn validates_filenames() {
        assert!(is_filename_valid("qubes-core-qrexec-4.1.16-1.fc32.src.rpm", None));
        assert!(!is_filename_valid("", None));
        assert!(!is_filename_valid(".hidden", None));
        assert!(!is_filename_valid("-rf", None));
        assert!(!is_filename_valid("a/b", None));
        assert!(!is_filename_valid("name", Some("name")));
    }
}
