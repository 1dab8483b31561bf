use std::path::PathBuf;

use serde::{Deserialize, Deserializer};

use crate::{ContainerExecutor, Executor, ExecutorError, LocalExecutor, QubesExecutor};

/// The resolved `executor:` configuration stanza.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ExecutorSpec {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub options: ExecutorOptions,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ExecutorOptions {
    pub user: Option<String>,
    pub group: Option<String>,
    /// Tear the sandbox down after a successful run. Default true.
    #[serde(deserialize_with = "bool_or_string")]
    pub clean: Option<bool>,
    /// Tear the sandbox down after a failed run. Defaults to `clean`.
    #[serde(deserialize_with = "bool_or_string")]
    pub clean_on_error: Option<bool>,
    /// Disposable VM template for the qubes executor.
    pub dispvm: Option<String>,
    /// Container image for the podman/docker executor.
    pub image: Option<String>,
    /// Directory holding the file-copy RPC service programs installed into
    /// disposable VMs.
    pub rpc_services_dir: Option<PathBuf>,
}

impl ExecutorOptions {
    pub fn clean(&self) -> bool {
        self.clean.unwrap_or(true)
    }

    pub fn clean_on_error(&self) -> bool {
        self.clean_on_error.unwrap_or_else(|| self.clean())
    }
}

// CLI overrides deliver booleans as "true"/"1" strings; accept both forms.
fn bool_or_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<bool>, D::Error> {
    let value = Option::<serde_yaml::Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(serde_yaml::Value::Null) => None,
        Some(serde_yaml::Value::Bool(b)) => Some(b),
        Some(serde_yaml::Value::String(s)) => {
            Some(matches!(s.to_lowercase().as_str(), "true" | "1"))
        }
        Some(serde_yaml::Value::Number(n)) => Some(n.as_u64() == Some(1)),
        Some(_) => None,
    })
}

/// Builds an executor from a resolved options stanza.
pub fn new_executor(spec: &ExecutorSpec) -> Result<Box<dyn Executor>, ExecutorError> {
    match spec.kind.as_deref() {
        Some("local") => Ok(Box::new(LocalExecutor::new(spec.options.clone()))),
        Some(client @ ("podman" | "docker")) => Ok(Box::new(ContainerExecutor::new(
            client,
            spec.options.clone(),
        )?)),
        Some("qubes") => Ok(Box::new(QubesExecutor::new(spec.options.clone()))),
        _ => Err(ExecutorError::failed(
            "Cannot determine which executor to use.",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_from_config_stanza() {
        let spec: ExecutorSpec = serde_yaml::from_str(
            "type: qubes\noptions:\n  dispvm: builder-dvm\n  clean: 'false'\n",
        )
        .unwrap();
        assert_eq!(spec.kind.as_deref(), Some("qubes"));
        assert_eq!(spec.options.dispvm.as_deref(), Some("builder-dvm"));
        assert!(!spec.options.clean());
        // clean-on-error follows clean unless set explicitly.
        assert!(!spec.options.clean_on_error());
    }

    #[test]
    fn missing_type_is_an_error() {
        let spec = ExecutorSpec::default();
        assert!(new_executor(&spec).is_err());
    }
}
