use std::fmt;
use std::sync::OnceLock;

use serde_yaml::Value;

use crate::{Distribution, TemplateError};

/// A buildable bootable VM image.
#[derive(Debug)]
pub struct Template {
    pub name: String,
    pub distribution: Distribution,
    pub flavor: String,
    pub options: Vec<String>,
    /// Build timeout in seconds.
    pub timeout: u64,
    /// `YYYYMMDDHHMM`, assigned when the build stage stamps the template.
    timestamp: OnceLock<String>,
}

impl Template {
    /// Parses one `templates:` entry, `{name: {dist: ..., flavor: ...}}`.
    pub fn from_config(entry: &Value) -> Result<Self, TemplateError> {
        let mapping = entry
            .as_mapping()
            .ok_or_else(|| TemplateError("Invalid value for template.".to_string()))?;
        let (name, desc) = mapping
            .iter()
            .next()
            .ok_or_else(|| TemplateError("Empty template.".to_string()))?;
        let name = name
            .as_str()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| TemplateError("Empty template.".to_string()))?;
        let desc = desc
            .as_mapping()
            .ok_or_else(|| TemplateError("Invalid value for template.".to_string()))?;

        let dist = desc
            .get("dist")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                TemplateError(format!("Invalid provided distribution for template '{name}'."))
            })?;
        if dist.starts_with("host-") {
            return Err(TemplateError(format!(
                "Invalid provided distribution for template '{name}'."
            )));
        }
        let dist = if dist.starts_with("vm-") {
            dist.to_string()
        } else {
            format!("vm-{dist}")
        };
        let distribution =
            Distribution::new(&dist).map_err(|e| TemplateError(e.to_string()))?;

        let flavor = desc
            .get("flavor")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let options = desc
            .get("options")
            .and_then(Value::as_sequence)
            .map(|seq| {
                seq.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let timeout = desc
            .get("timeout")
            .and_then(Value::as_u64)
            .unwrap_or(3600);

        Ok(Self {
            name: name.to_string(),
            distribution,
            flavor,
            options,
            timeout,
            timestamp: OnceLock::new(),
        })
    }

    /// The build timestamp, if already assigned during this run.
    pub fn timestamp(&self) -> Option<&str> {
        self.timestamp.get().map(String::as_str)
    }

    /// Lazily assigns the build timestamp; later calls keep the first value.
    pub fn set_timestamp(&self, timestamp: String) -> &str {
        self.timestamp.get_or_init(|| timestamp)
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn yaml(text: &str) -> Value {
        serde_yaml::from_str(text).unwrap()
    }

    #[test]
    fn parses_template_entry() {
        let template = Template::from_config(&yaml(
            "fedora-35-xfce:\n  dist: fc35\n  flavor: xfce\n  options: [minimal]\n  timeout: 7200",
        ))
        .unwrap();
        assert_eq!(template.name, "fedora-35-xfce");
        assert_eq!(template.distribution.distribution(), "vm-fc35");
        assert_eq!(template.flavor, "xfce");
        assert_eq!(template.options, vec!["minimal".to_string()]);
        assert_eq!(template.timeout, 7200);
    }

    #[test]
    fn rejects_host_distribution() {
        assert!(Template::from_config(&yaml("bad:\n  dist: host-fc35")).is_err());
        assert!(Template::from_config(&yaml("bad: null")).is_err());
    }

    #[test]
    fn timestamp_is_assigned_once() {
        let template = Template::from_config(&yaml("t:\n  dist: fc35")).unwrap();
        assert_eq!(template.timestamp(), None);
        template.set_timestamp("202301010101".to_string());
        template.set_timestamp("999901010101".to_string());
        assert_eq!(template.timestamp(), Some("202301010101"));
    }
}
