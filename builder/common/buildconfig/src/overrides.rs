//! Parser for `-o KEY[:SUB…]=VALUE` / `-o KEY+VALUE` command-line overrides.
//!
//! `:` descends into a mapping, `+` appends to a list, `=` terminates with a
//! scalar. Values spelled `true|false|1|0` are coerced to booleans. A
//! leading `+` on the whole key keeps the top-level `+key` append form.

use lazy_static::lazy_static;
use regex::Regex;
use serde_yaml::{Mapping, Value};

use crate::{deep_merge, str_to_bool, ConfigError};

lazy_static! {
    static ref ALLOWED_KEY_RE: Regex = Regex::new(r"\A[A-Za-z0-9_+-]+\z").unwrap();
}

fn validate_identifier(identifier: &str) -> Result<(), ConfigError> {
    let malformed = !ALLOWED_KEY_RE.is_match(identifier)
        || identifier == "-"
        || identifier == "_"
        || identifier.starts_with('-')
        || identifier.ends_with('-')
        || identifier.starts_with('_')
        || identifier.ends_with('_');
    if malformed {
        return Err(ConfigError(format!(
            "Invalid key identifier found: '{identifier}'."
        )));
    }
    Ok(())
}

fn coerce_scalar(value: &str) -> Value {
    match value.to_lowercase().as_str() {
        "true" | "false" | "1" | "0" => Value::Bool(str_to_bool(value)),
        _ => Value::String(value.to_string()),
    }
}

fn parse_entry(spec: &str, value: Option<&str>, append: bool) -> Result<Value, ConfigError> {
    let (spec, value, append) = match value {
        Some(_) => (spec, value, append),
        None => {
            if let Some((head, tail)) = spec.split_once('=') {
                (head, Some(tail), append)
            } else if let Some((head, tail)) = spec.split_once('+') {
                (head, Some(tail), true)
            } else {
                (spec, None, append)
            }
        }
    };

    // Whichever of ':' and '+' comes first decides whether we descend into a
    // mapping or into a list.
    let split = match (spec.find(':'), spec.find('+')) {
        (Some(d), Some(a)) if d < a => Some((d, ':')),
        (Some(_), Some(a)) => Some((a, '+')),
        (Some(d), None) => Some((d, ':')),
        (None, Some(a)) => Some((a, '+')),
        (None, None) => None,
    };

    match split {
        Some((index, separator)) if index + 1 < spec.len() => {
            let key = &spec[..index];
            let rest = &spec[index + 1..];
            validate_identifier(key)?;
            let inner = match separator {
                ':' => {
                    if value.is_none() {
                        return Err(ConfigError(format!("Cannot find '=' or '+' in '{rest}'")));
                    }
                    parse_entry(rest, value, append)?
                }
                _ => Value::Sequence(vec![parse_entry(rest, value, append)?]),
            };
            let mut mapping = Mapping::new();
            mapping.insert(Value::String(key.to_string()), inner);
            Ok(Value::Mapping(mapping))
        }
        _ => match value {
            None => Ok(Value::String(spec.to_string())),
            Some(value) => {
                validate_identifier(spec)?;
                let scalar = coerce_scalar(value);
                let scalar = if append {
                    Value::Sequence(vec![scalar])
                } else {
                    scalar
                };
                let mut mapping = Mapping::new();
                mapping.insert(Value::String(spec.to_string()), scalar);
                Ok(Value::Mapping(mapping))
            }
        },
    }
}

/// Parses all `-o` occurrences into one nested override mapping.
pub fn parse_cli_overrides<'a, I>(options: I) -> Result<Mapping, ConfigError>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut result = Value::Mapping(Mapping::new());
    for spec in options {
        let parsed = if let Some(rest) = spec.strip_prefix('+') {
            // '+components', '+plugins' and friends are handled at top level.
            let inner = parse_entry(rest, None, false)?;
            match inner {
                Value::Mapping(mapping) => {
                    let mut renamed = Mapping::new();
                    for (key, value) in mapping {
                        let key = key.as_str().unwrap_or_default().to_string();
                        renamed.insert(Value::String(format!("+{key}")), value);
                    }
                    Value::Mapping(renamed)
                }
                other => other,
            }
        } else {
            parse_entry(spec, None, false)?
        };
        result = deep_merge(&result, &parsed, true);
    }
    match result {
        Value::Mapping(mapping) => Ok(mapping),
        _ => Ok(Mapping::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(items: &[&str]) -> Value {
        Value::Mapping(parse_cli_overrides(items.iter().copied()).unwrap())
    }

    fn yaml(text: &str) -> Value {
        serde_yaml::from_str(text).unwrap()
    }

    #[test]
    fn scalar_override() {
        assert_eq!(parse(&["qubes-release=r4.2"]), yaml("qubes-release: r4.2"));
    }

    #[test]
    fn nested_and_boolean() {
        assert_eq!(
            parse(&["executor:type=qubes", "executor:options:clean=false"]),
            yaml("executor:\n  type: qubes\n  options:\n    clean: false")
        );
    }

    #[test]
    fn append_builds_lists() {
        assert_eq!(
            parse(&["components+lvm2", "components+vmm-xen"]),
            yaml("components: [lvm2, vmm-xen]")
        );
    }

    #[test]
    fn top_level_plus_key_is_preserved() {
        assert_eq!(
            parse(&["+components+extra-pkg"]),
            yaml("+components: [extra-pkg]")
        );
    }

    #[test]
    fn invalid_identifier_is_rejected() {
        assert!(parse_cli_overrides(["bad key=1"].into_iter()).is_err());
        assert!(parse_cli_overrides(["-lead=1"].into_iter()).is_err());
    }
}
