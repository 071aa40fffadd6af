/// Dependency specifiers attached to a request
use crate::config::types::{ExecutionError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, PathBuf};

const MAX_SPEC_LEN: usize = 214;

/// A package to install before the program runs.
///
/// Deserialized values go through [`Dependency::check_format`], so a
/// specifier that `parse` would refuse cannot arrive through JSON either.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(
    tag = "kind",
    content = "value",
    rename_all = "snake_case",
    try_from = "UncheckedDependency"
)]
pub enum Dependency {
    /// Name (optionally with a version constraint) for the language's package manager.
    Registry(String),
    /// Absolute host path copied into the workspace.
    LocalPath(PathBuf),
}

#[derive(Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
enum UncheckedDependency {
    Registry(String),
    LocalPath(PathBuf),
}

impl TryFrom<UncheckedDependency> for Dependency {
    type Error = ExecutionError;

    fn try_from(raw: UncheckedDependency) -> Result<Self> {
        let dep = match raw {
            UncheckedDependency::Registry(name) => Dependency::Registry(name),
            UncheckedDependency::LocalPath(path) => Dependency::LocalPath(path),
        };
        dep.check_format()?;
        Ok(dep)
    }
}

impl Dependency {
    /// Parse one specifier. Paths start with `/` or `.`; anything else is a
    /// registry package.
    pub fn parse(spec: &str) -> Result<Self> {
        let spec = spec.trim();
        let dep = if spec.starts_with('/') || spec.starts_with('.') {
            Dependency::LocalPath(PathBuf::from(spec))
        } else {
            Dependency::Registry(spec.to_string())
        };
        dep.check_format()?;
        Ok(dep)
    }

    /// Shape rules every specifier must satisfy before it reaches an
    /// installer's argv, however the value was constructed.
    pub fn check_format(&self) -> Result<()> {
        let spec = self.as_str();
        if spec.is_empty() {
            return Err(ExecutionError::Validation("empty dependency specifier".to_string()));
        }
        if spec.len() > MAX_SPEC_LEN {
            return Err(ExecutionError::Validation(format!(
                "dependency specifier longer than {MAX_SPEC_LEN} bytes"
            )));
        }

        match self {
            Dependency::LocalPath(path) => {
                if !path.is_absolute() {
                    return Err(ExecutionError::Validation(format!(
                        "local dependency must be an absolute path: {spec}"
                    )));
                }
                if path.components().any(|c| matches!(c, Component::ParentDir)) {
                    return Err(ExecutionError::Validation(format!(
                        "local dependency may not contain '..': {spec}"
                    )));
                }
                Ok(())
            }
            Dependency::Registry(_) => {
                if spec.starts_with('-') {
                    return Err(ExecutionError::Validation(format!(
                        "dependency may not start with '-': {spec}"
                    )));
                }
                if let Some(bad) = spec.chars().find(|c| !is_registry_char(*c)) {
                    return Err(ExecutionError::Validation(format!(
                        "dependency {spec:?} contains disallowed character {bad:?}"
                    )));
                }
                Ok(())
            }
        }
    }

    /// Split a free-form list on whitespace and commas.
    pub fn parse_list(raw: &str) -> Result<Vec<Self>> {
        raw.split(|c: char| c.is_whitespace() || c == ',')
            .filter(|s| !s.is_empty())
            .map(Self::parse)
            .collect()
    }

    pub fn as_str(&self) -> std::borrow::Cow<'_, str> {
        match self {
            Dependency::Registry(name) => name.as_str().into(),
            Dependency::LocalPath(path) => path.to_string_lossy(),
        }
    }

    /// Check a local path against the allow-listed roots without touching disk.
    pub fn check_allowed(&self, roots: &[PathBuf]) -> Result<()> {
        match self {
            Dependency::Registry(_) => Ok(()),
            Dependency::LocalPath(path) if roots.iter().any(|root| path.starts_with(root)) => Ok(()),
            Dependency::LocalPath(path) => Err(ExecutionError::Validation(format!(
                "local dependency {} is outside the allowed roots",
                path.display()
            ))),
        }
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str())
    }
}

/// Package names, version constraints, npm scopes and extras.
fn is_registry_char(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(c, '.' | '_' | '-' | '@' | '/' | '=' | '<' | '>' | '~' | '^' | '!' | '+' | '[' | ']' | ':')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_list_splits_on_whitespace_and_commas() {
        let deps = Dependency::parse_list("requests numpy==1.26.0,\n  @types/node").expect("parse");
        assert_eq!(
            deps,
            vec![
                Dependency::Registry("requests".to_string()),
                Dependency::Registry("numpy==1.26.0".to_string()),
                Dependency::Registry("@types/node".to_string()),
            ]
        );
        assert!(Dependency::parse_list("  ").expect("empty").is_empty());
    }

    #[test]
    fn test_flag_injection_is_rejected() {
        assert!(Dependency::parse("--index-url=http://evil").is_err());
        assert!(Dependency::parse("-e").is_err());
    }

    #[test]
    fn test_shell_metacharacters_are_rejected() {
        for spec in ["left;rm", "a|b", "$(id)", "x`y`", "a&b", "q\"uote"] {
            assert!(Dependency::parse(spec).is_err(), "{spec} should be rejected");
        }
    }

    #[test]
    fn test_local_paths() {
        let dep = Dependency::parse("/srv/packages/mylib").expect("parse");
        assert_eq!(dep, Dependency::LocalPath(PathBuf::from("/srv/packages/mylib")));
        assert!(Dependency::parse("./relative").is_err());
        assert!(Dependency::parse("/srv/packages/../etc").is_err());

        let roots = vec![PathBuf::from("/srv/packages")];
        assert!(dep.check_allowed(&roots).is_ok());
        let outside = Dependency::parse("/etc/ssh").expect("parse");
        assert!(outside.check_allowed(&roots).is_err());
        assert!(dep.check_allowed(&[]).is_err());
    }

    #[test]
    fn test_hand_built_registry_entries_are_checked() {
        assert!(Dependency::Registry("--index-url=http://evil".to_string())
            .check_format()
            .is_err());
        assert!(Dependency::Registry("ok;rm".to_string()).check_format().is_err());
        assert!(Dependency::Registry(String::new()).check_format().is_err());
        assert!(Dependency::LocalPath(PathBuf::from("relative/dir")).check_format().is_err());
        assert!(Dependency::Registry("lodash@4.17.21".to_string()).check_format().is_ok());
    }

    #[test]
    fn test_deserialization_applies_format_rules() {
        let good: Dependency =
            serde_json::from_str(r#"{"kind":"registry","value":"requests==2.31.0"}"#).expect("valid");
        assert_eq!(good, Dependency::Registry("requests==2.31.0".to_string()));

        let flag = serde_json::from_str::<Dependency>(r#"{"kind":"registry","value":"--pre"}"#);
        assert!(flag.is_err());
        let traversal =
            serde_json::from_str::<Dependency>(r#"{"kind":"local_path","value":"/srv/../etc"}"#);
        assert!(traversal.is_err());

        let round = serde_json::to_string(&good).expect("serialize");
        assert_eq!(serde_json::from_str::<Dependency>(&round).expect("reparse"), good);
    }
}
