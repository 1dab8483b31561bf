use strum_macros::{Display, EnumString};

use crate::ConfigError;

/// Pipeline stages in execution order. `init-cache` is on-demand only and
/// never part of an `all` run.
#[derive(Clone, Copy, Debug, Display, EnumString, Eq, Hash, PartialEq)]
#[strum(serialize_all = "kebab-case")]
pub enum Stage {
    Fetch,
    Prep,
    Build,
    Post,
    Verify,
    Sign,
    Publish,
    Upload,
    InitCache,
}

/// The ordered stage list an `all` run walks.
pub const STAGES: [Stage; 8] = [
    Stage::Fetch,
    Stage::Prep,
    Stage::Build,
    Stage::Post,
    Stage::Verify,
    Stage::Sign,
    Stage::Publish,
    Stage::Upload,
];

impl Stage {
    /// Parses a stage name or its single-letter CLI alias.
    pub fn from_name_or_alias(name: &str) -> Result<Self, ConfigError> {
        let name = match name {
            "f" => "fetch",
            "b" => "build",
            "po" => "post",
            "v" => "verify",
            "s" => "sign",
            "pu" => "publish",
            "u" => "upload",
            other => other,
        };
        name.parse()
            .map_err(|_| ConfigError(format!("Unknown stage '{name}'.")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_names_and_aliases() {
        assert_eq!(Stage::from_name_or_alias("fetch").unwrap(), Stage::Fetch);
        assert_eq!(Stage::from_name_or_alias("f").unwrap(), Stage::Fetch);
        assert_eq!(Stage::from_name_or_alias("po").unwrap(), Stage::Post);
        assert_eq!(Stage::from_name_or_alias("pu").unwrap(), Stage::Publish);
        assert_eq!(
            Stage::from_name_or_alias("init-cache").unwrap(),
            Stage::InitCache
        );
        assert!(Stage::from_name_or_alias("pub").is_err());
    }

    #[test]
    fn displays_kebab_case() {
        assert_eq!(Stage::InitCache.to_string(), "init-cache");
        assert_eq!(Stage::Fetch.to_string(), "fetch");
    }
}
