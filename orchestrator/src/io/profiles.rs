//! Policy profile sources: read-only built-ins layered under custom profiles.
//!
//! Profiles are compiled on save and on load, so a profile that reaches a run
//! is always valid.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::core::policy::{CompiledProfile, PolicyError, PolicyProfile, builtin_profiles};
use crate::io::config::write_atomic;

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("policy profile '{0}' not found")]
    NotFound(String),
    #[error("policy profile '{0}' is built in and read-only")]
    ReadOnly(String),
    #[error(transparent)]
    Invalid(#[from] PolicyError),
    #[error("profile storage: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProfileSummary {
    pub name: String,
    pub description: String,
    pub builtin: bool,
}

pub trait ProfileSource: Send + Sync {
    /// Load and compile a profile by name.
    fn get(&self, name: &str) -> Result<CompiledProfile, ProfileError>;
    /// Built-ins first, then custom profiles by name.
    fn list(&self) -> Result<Vec<ProfileSummary>, ProfileError>;
    /// Create or replace a custom profile.
    fn save(&self, profile: PolicyProfile) -> Result<(), ProfileError>;
    fn delete(&self, name: &str) -> Result<(), ProfileError>;
}

fn builtin(name: &str) -> Option<PolicyProfile> {
    builtin_profiles().into_iter().find(|p| p.name == name)
}

fn builtin_summaries() -> Vec<ProfileSummary> {
    builtin_profiles()
        .into_iter()
        .map(|p| ProfileSummary {
            name: p.name,
            description: p.description,
            builtin: true,
        })
        .collect()
}

/// Custom profiles held in memory.
#[derive(Debug, Default)]
pub struct InMemoryProfiles {
    custom: RwLock<BTreeMap<String, PolicyProfile>>,
}

impl InMemoryProfiles {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> ProfileError {
        ProfileError::Storage("profile table poisoned".to_string())
    }
}

impl ProfileSource for InMemoryProfiles {
    fn get(&self, name: &str) -> Result<CompiledProfile, ProfileError> {
        if let Some(profile) = builtin(name) {
            return Ok(profile.compile()?);
        }
        let custom = self.custom.read().map_err(|_| Self::poisoned())?;
        let profile = custom
            .get(name)
            .cloned()
            .ok_or_else(|| ProfileError::NotFound(name.to_string()))?;
        Ok(profile.compile()?)
    }

    fn list(&self) -> Result<Vec<ProfileSummary>, ProfileError> {
        let custom = self.custom.read().map_err(|_| Self::poisoned())?;
        let mut all = builtin_summaries();
        all.extend(custom.values().map(|p| ProfileSummary {
            name: p.name.clone(),
            description: p.description.clone(),
            builtin: false,
        }));
        Ok(all)
    }

    fn save(&self, profile: PolicyProfile) -> Result<(), ProfileError> {
        if builtin(&profile.name).is_some() {
            return Err(ProfileError::ReadOnly(profile.name));
        }
        profile.clone().compile()?;
        let mut custom = self.custom.write().map_err(|_| Self::poisoned())?;
        custom.insert(profile.name.clone(), profile);
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<(), ProfileError> {
        if builtin(name).is_some() {
            return Err(ProfileError::ReadOnly(name.to_string()));
        }
        let mut custom = self.custom.write().map_err(|_| Self::poisoned())?;
        custom
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| ProfileError::NotFound(name.to_string()))
    }
}

/// Custom profiles stored as `<dir>/<name>.toml`.
#[derive(Debug, Clone)]
pub struct FileProfileStore {
    dir: PathBuf,
}

impl FileProfileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.toml"))
    }

    fn read(&self, path: &Path) -> Result<PolicyProfile, ProfileError> {
        let contents = fs::read_to_string(path)
            .map_err(|err| ProfileError::Storage(format!("read {}: {err}", path.display())))?;
        toml::from_str(&contents)
            .map_err(|err| ProfileError::Storage(format!("parse {}: {err}", path.display())))
    }
}

/// Parse a profile from TOML text.
pub fn parse_profile(contents: &str) -> Result<PolicyProfile, ProfileError> {
    toml::from_str(contents).map_err(|err| ProfileError::Storage(format!("parse profile: {err}")))
}

impl ProfileSource for FileProfileStore {
    fn get(&self, name: &str) -> Result<CompiledProfile, ProfileError> {
        if let Some(profile) = builtin(name) {
            return Ok(profile.compile()?);
        }
        // Names are validated on save; reject anything that could escape the directory.
        if name.is_empty() || name.contains(['/', '\\', '.']) {
            return Err(ProfileError::NotFound(name.to_string()));
        }
        let path = self.path_for(name);
        if !path.exists() {
            return Err(ProfileError::NotFound(name.to_string()));
        }
        let profile = self.read(&path)?;
        if profile.name != name {
            return Err(ProfileError::Storage(format!(
                "{} declares name '{}'",
                path.display(),
                profile.name
            )));
        }
        debug!(profile = name, "loaded custom profile");
        Ok(profile.compile()?)
    }

    fn list(&self) -> Result<Vec<ProfileSummary>, ProfileError> {
        let mut all = builtin_summaries();
        if !self.dir.exists() {
            return Ok(all);
        }
        let entries = fs::read_dir(&self.dir)
            .map_err(|err| ProfileError::Storage(format!("read {}: {err}", self.dir.display())))?;
        let mut custom = BTreeMap::new();
        for entry in entries {
            let entry = entry.map_err(|err| ProfileError::Storage(err.to_string()))?;
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "toml") {
                continue;
            }
            let profile = self.read(&path)?;
            custom.insert(
                profile.name.clone(),
                ProfileSummary {
                    name: profile.name,
                    description: profile.description,
                    builtin: false,
                },
            );
        }
        all.extend(custom.into_values());
        Ok(all)
    }

    fn save(&self, profile: PolicyProfile) -> Result<(), ProfileError> {
        if builtin(&profile.name).is_some() {
            return Err(ProfileError::ReadOnly(profile.name));
        }
        let compiled = profile.compile()?;
        let mut buf = toml::to_string_pretty(compiled.profile())
            .map_err(|err| ProfileError::Storage(format!("serialize profile: {err}")))?;
        buf.push('\n');
        let path = self.path_for(compiled.name());
        write_atomic(&path, &buf).map_err(|err| ProfileError::Storage(format!("{err:#}")))?;
        info!(profile = compiled.name(), path = %path.display(), "saved custom profile");
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<(), ProfileError> {
        if builtin(name).is_some() {
            return Err(ProfileError::ReadOnly(name.to_string()));
        }
        if name.is_empty() || name.contains(['/', '\\', '.']) {
            return Err(ProfileError::NotFound(name.to_string()));
        }
        let path = self.path_for(name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(ProfileError::NotFound(name.to_string()))
            }
            Err(err) => Err(ProfileError::Storage(format!(
                "remove {}: {err}",
                path.display()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::policy::{DecisionKind, PLAN_READONLY, PermissionRule};

    fn custom(name: &str, tool_pattern: &str) -> PolicyProfile {
        PolicyProfile {
            name: name.to_string(),
            description: "custom".to_string(),
            default_decision: DecisionKind::Ask,
            rules: vec![PermissionRule::new(tool_pattern, "*", "*", DecisionKind::Allow)],
            quality_gates: Vec::new(),
            termination: Vec::new(),
        }
    }

    #[test]
    fn file_store_round_trips_custom_profiles() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileProfileStore::new(temp.path().join("profiles"));
        store.save(custom("reviewer", "{read,grep}")).expect("save");

        let loaded = store.get("reviewer").expect("get");
        assert_eq!(loaded.profile(), &custom("reviewer", "{read,grep}"));

        let names: Vec<(String, bool)> = store
            .list()
            .expect("list")
            .into_iter()
            .map(|s| (s.name, s.builtin))
            .collect();
        assert_eq!(names.len(), 5);
        assert_eq!(names[4], ("reviewer".to_string(), false));

        store.delete("reviewer").expect("delete");
        assert!(matches!(store.get("reviewer"), Err(ProfileError::NotFound(_))));
    }

    #[test]
    fn builtins_are_read_only() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileProfileStore::new(temp.path());
        assert!(matches!(
            store.save(custom(PLAN_READONLY, "*")),
            Err(ProfileError::ReadOnly(_))
        ));
        assert!(matches!(
            store.delete(PLAN_READONLY),
            Err(ProfileError::ReadOnly(_))
        ));
        assert!(store.get(PLAN_READONLY).is_ok());
    }

    #[test]
    fn invalid_profiles_are_rejected_on_save() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileProfileStore::new(temp.path());
        assert!(matches!(
            store.save(custom("broken", "[oops")),
            Err(ProfileError::Invalid(PolicyError::Pattern { .. }))
        ));
        assert!(!temp.path().join("broken.toml").exists());
    }

    #[test]
    fn hand_edited_file_with_bad_pattern_fails_on_load() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(
            temp.path().join("edited.toml"),
            "name = \"edited\"\n[[rules]]\ntool = \"{a,b\"\ndecision = \"allow\"\n",
        )
        .expect("write");
        let store = FileProfileStore::new(temp.path());
        assert!(matches!(store.get("edited"), Err(ProfileError::Invalid(_))));
        assert!(matches!(store.get("../etc"), Err(ProfileError::NotFound(_))));
    }

    #[test]
    fn in_memory_profiles_mirror_file_semantics() {
        let profiles = InMemoryProfiles::new();
        profiles.save(custom("mine", "*")).expect("save");
        assert_eq!(profiles.get("mine").expect("get").name(), "mine");
        assert_eq!(profiles.list().expect("list").len(), 5);
        assert!(matches!(
            profiles.delete(PLAN_READONLY),
            Err(ProfileError::ReadOnly(_))
        ));
        profiles.delete("mine").expect("delete");
        assert!(matches!(profiles.get("mine"), Err(ProfileError::NotFound(_))));
    }

    #[test]
    fn parse_profile_reads_toml() {
        let profile = parse_profile("name = \"x\"\ndefault_decision = \"allow\"\n").expect("parse");
        assert_eq!(profile.default_decision, DecisionKind::Allow);
        assert!(profile.rules.is_empty());
    }
}
