//! The target catalogue and run selection.

use std::collections::HashSet;

use depforge_schema::{Catalogue, CatalogueError, Stage};
use thiserror::Error;

use crate::error::ForgeError;
use crate::target::Target;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Duplicate target {name} {version}")]
    Duplicate { name: String, version: String },

    #[error(transparent)]
    Catalogue(#[from] CatalogueError),
}

/// Read-only, ordered set of targets. Built once at startup.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    targets: Vec<Target>,
}

impl Registry {
    /// # Errors
    ///
    /// [`RegistryError::Duplicate`] when two targets share name and version.
    pub fn new(targets: Vec<Target>) -> Result<Self, RegistryError> {
        let mut seen = HashSet::new();
        for t in &targets {
            if !seen.insert((t.name(), t.version())) {
                return Err(RegistryError::Duplicate {
                    name: t.name().to_string(),
                    version: t.version().to_string(),
                });
            }
        }
        Ok(Self { targets })
    }

    /// Registry from a validated catalogue, in file order.
    ///
    /// # Errors
    ///
    /// Catalogue validation errors.
    pub fn from_catalogue(catalogue: Catalogue) -> Result<Self, RegistryError> {
        catalogue.validate()?;
        Self::new(catalogue.targets.into_iter().map(Target::from_spec).collect())
    }

    /// Parse and validate a TOML catalogue.
    ///
    /// # Errors
    ///
    /// Parse, validation or duplicate errors.
    pub fn from_toml(text: &str) -> Result<Self, RegistryError> {
        Self::from_catalogue(Catalogue::from_toml(text)?)
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// First target called `name`.
    pub fn get(&self, name: &str) -> Option<&Target> {
        self.targets.iter().find(|t| t.name() == name)
    }

    /// Build a run over the requested names, or every target when `names` is
    /// empty. Selected targets keep registry order regardless of request order.
    ///
    /// # Errors
    ///
    /// [`ForgeError::UnknownTarget`] for the first name not in the registry.
    pub fn select<S: AsRef<str>>(&self, names: &[S]) -> Result<Run<'_>, ForgeError> {
        if let Some(unknown) = names
            .iter()
            .map(AsRef::as_ref)
            .find(|n| self.get(n).is_none())
        {
            return Err(ForgeError::UnknownTarget {
                name: unknown.to_string(),
                available: self.targets.iter().map(|t| t.name().to_string()).collect(),
            });
        }

        let targets = if names.is_empty() {
            self.targets.iter().collect()
        } else {
            self.targets
                .iter()
                .filter(|t| names.iter().any(|n| n.as_ref() == t.name()))
                .collect()
        };
        Ok(Run {
            targets,
            stages: &Stage::ALL,
        })
    }
}

/// Targets and stage sequence for one invocation.
#[derive(Debug, Clone)]
pub struct Run<'r> {
    pub targets: Vec<&'r Target>,
    pub stages: &'static [Stage],
}

#[cfg(test)]
mod tests {
    use super::*;
    use depforge_schema::Sha256Digest;

    fn target(name: &str, version: &str) -> Target {
        Target::new(
            name,
            version,
            Sha256Digest::new("0".repeat(64)).unwrap(),
            "{name}.tar",
            "file:///tmp/{filename}",
        )
    }

    fn registry() -> Registry {
        Registry::new(vec![target("a", "1"), target("b", "1"), target("c", "2")]).unwrap()
    }

    #[test]
    fn empty_selection_is_everything() {
        let reg = registry();
        let run = reg.select::<&str>(&[]).unwrap();
        let names: Vec<_> = run.targets.iter().map(|t| t.name()).collect();
        assert_eq!(names, ["a", "b", "c"]);
        assert_eq!(run.stages, Stage::ALL);
    }

    #[test]
    fn selection_keeps_registry_order() {
        let reg = registry();
        let run = reg.select(&["c", "a"]).unwrap();
        let names: Vec<_> = run.targets.iter().map(|t| t.name()).collect();
        assert_eq!(names, ["a", "c"]);
    }

    #[test]
    fn unknown_name_fails() {
        let reg = registry();
        let err = reg.select(&["a", "nope"]).unwrap_err();
        assert!(matches!(err, ForgeError::UnknownTarget { ref name, .. } if name == "nope"));
        assert!(err.to_string().contains("a, b, c"));
    }

    #[test]
    fn duplicates_rejected() {
        let err = Registry::new(vec![target("a", "1"), target("a", "1")]).unwrap_err();
        assert!(matches!(err, RegistryError::Duplicate { .. }));
        // same name, different version is fine
        assert!(Registry::new(vec![target("a", "1"), target("a", "2")]).is_ok());
    }

    #[test]
    fn from_toml_applies_skip() {
        let reg = Registry::from_toml(
            r#"
[[target]]
name = "rapidcsv"
version = "8.75"
sha256 = "8f6f5e5b4e1a6b0d3d9b1c1c3f6e5b1a7f3b8e0c2d6e2b5f4a6c9d1e0f2a3b4c"
filename = "v{version}.tar.gz"
url = "https://github.com/d99kris/rapidcsv/archive/refs/tags/{filename}"
source_subdir = "rapidcsv-{version}"
skip = ["patch"]
"#,
        )
        .unwrap();
        assert_eq!(reg.len(), 1);
        let t = reg.get("rapidcsv").unwrap();
        assert!(matches!(
            t.action(Stage::Patch),
            crate::target::StageAction::Skip
        ));
    }
}
