use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context as AnyhowContext, Result};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::model::cores::CoreSet;

fn default_vcodec() -> String {
    "h264".to_string()
}

fn default_preset() -> String {
    "veryfast".to_string()
}

fn default_crf() -> u32 {
    28
}

fn default_threads() -> u32 {
    2
}

fn default_units() -> u32 {
    1
}

/// Resource requirements and transcoding knobs for one class of task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Profile {
    pub name: String,
    pub scale: String,
    #[serde(default = "default_vcodec")]
    pub vcodec: String,
    #[serde(default = "default_preset")]
    pub preset: String,
    #[serde(default = "default_crf")]
    pub crf: u32,
    /// Encoder threads.
    #[serde(default = "default_threads")]
    pub vthreads: u32,
    /// Filter-graph threads.
    #[serde(default = "default_threads")]
    pub fthreads: u32,
    #[serde(default = "default_units")]
    pub cpu_units: u32,
    /// Fixed core list used in exclusive mode when slots are disabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpuset: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
}

impl Profile {
    fn builtin(name: &str, scale: &str, vcodec: &str, preset: &str, threads: u32, cpu_units: u32) -> Self {
        Self {
            name: name.to_string(),
            scale: scale.to_string(),
            vcodec: vcodec.to_string(),
            preset: preset.to_string(),
            crf: 28,
            vthreads: threads,
            fthreads: threads,
            cpu_units,
            cpuset: None,
            aliases: Vec::new(),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::Profile {
            name: self.name.clone(),
            reason: reason.to_string(),
        };
        if self.name.trim().is_empty() {
            return Err(invalid("empty name"));
        }
        if self.cpu_units == 0 {
            return Err(invalid("cpu_units must be at least 1"));
        }
        if !self.scale.contains(':') {
            return Err(invalid("scale must be W:H"));
        }
        if let Some(cpuset) = &self.cpuset {
            cpuset.parse::<CoreSet>()?;
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct ProfileFile {
    profiles: Vec<Profile>,
}

/// Name -> profile table. Lookups are case-insensitive and honor aliases.
#[derive(Debug, Clone)]
pub struct ProfileRegistry {
    profiles: BTreeMap<String, Profile>,
    aliases: BTreeMap<String, String>,
}

impl Default for ProfileRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ProfileRegistry {
    pub fn empty() -> Self {
        Self {
            profiles: BTreeMap::new(),
            aliases: BTreeMap::new(),
        }
    }

    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        let mut light = Profile::builtin("light1c", "854:480", "h264", "veryfast", 1, 1);
        light.aliases = vec!["light480p1c".to_string(), "light_1c".to_string()];
        for profile in [
            Profile::builtin("fast1080p", "1920:1080", "h264", "fast", 2, 2),
            Profile::builtin("medium480p", "854:480", "h264", "medium", 2, 2),
            Profile::builtin("hevc1080p", "1920:1080", "hevc", "medium", 4, 4),
            light,
        ] {
            registry.profiles_insert(profile);
        }
        registry
    }

    fn profiles_insert(&mut self, profile: Profile) {
        let key = profile.name.to_lowercase();
        for alias in &profile.aliases {
            self.aliases.insert(alias.to_lowercase(), key.clone());
        }
        self.profiles.insert(key, profile);
    }

    /// Adds or replaces a profile after validating it.
    pub fn insert(&mut self, profile: Profile) -> Result<(), ConfigError> {
        profile.validate()?;
        self.profiles_insert(profile);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Profile> {
        let key = name.trim().to_lowercase();
        let key = self.aliases.get(&key).unwrap_or(&key);
        self.profiles.get(key)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.profiles.values().map(|p| p.name.as_str())
    }

    /// Merges profiles from a YAML document (`profiles: [...]`) over this table.
    pub fn extend_from_yaml(&mut self, yaml: &str) -> Result<()> {
        let file: ProfileFile = serde_yaml::from_str(yaml).context("Failed to deserialize profile YAML")?;
        for profile in file.profiles {
            self.insert(profile)?;
        }
        Ok(())
    }

    pub fn load_file(&mut self, path: &Path) -> Result<()> {
        let yaml = fs::read_to_string(path)
            .with_context(|| format!("Failed to read profile file {}", path.display()))?;
        self.extend_from_yaml(&yaml)
            .with_context(|| format!("Invalid profile file {}", path.display()))
    }
}
