//! Harness configuration (`demohost.toml`)
//!
//! Every field has a default, so an empty file (or no file at all) reproduces the
//! stock setup: `demos.wasm` driving three 800x600 demos at 60 fps.

use std::collections::HashSet;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::channel::ChannelSpec;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarnessConfig {
    /// Path to the compiled module (default: `demos.wasm`)
    #[serde(default = "default_module")]
    pub module: PathBuf,
    #[serde(default)]
    pub pump: PumpConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    /// Demos in render order (default: triangle, dot3d, squish)
    #[serde(default = "default_demos")]
    pub demos: Vec<DemoConfig>,
}

/// Frame pacing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PumpConfig {
    /// Frames per second (default: 60)
    #[serde(default = "default_fps")]
    pub target_fps: u32,
    /// Stop after this many ticks; run until interrupted when unset
    #[serde(default)]
    pub max_ticks: Option<u64>,
    /// Advance a virtual clock instead of sleeping (default: false)
    #[serde(default)]
    pub virtual_time: bool,
}

/// PNG snapshots of each demo's surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Output directory; snapshots are disabled when unset
    #[serde(default)]
    pub dir: Option<PathBuf>,
    /// Write every Nth presented frame (default: 60)
    #[serde(default = "default_snapshot_every")]
    pub every: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DemoConfig {
    pub name: String,
    #[serde(default = "default_width")]
    pub width: NonZeroU32,
    #[serde(default = "default_height")]
    pub height: NonZeroU32,
}

impl DemoConfig {
    pub fn spec(&self) -> ChannelSpec {
        ChannelSpec::new(self.name.clone(), self.width, self.height)
    }
}

fn default_module() -> PathBuf {
    PathBuf::from("demos.wasm")
}
fn default_fps() -> u32 {
    60
}
fn default_snapshot_every() -> u32 {
    60
}
fn default_width() -> NonZeroU32 {
    NonZeroU32::MIN.saturating_add(799)
}
fn default_height() -> NonZeroU32 {
    NonZeroU32::MIN.saturating_add(599)
}

fn default_demos() -> Vec<DemoConfig> {
    ["triangle", "dot3d", "squish"]
        .into_iter()
        .map(|name| DemoConfig {
            name: name.to_string(),
            width: default_width(),
            height: default_height(),
        })
        .collect()
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            module: default_module(),
            pump: PumpConfig::default(),
            snapshot: SnapshotConfig::default(),
            demos: default_demos(),
        }
    }
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            target_fps: default_fps(),
            max_ticks: None,
            virtual_time: false,
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            dir: None,
            every: default_snapshot_every(),
        }
    }
}

impl HarnessConfig {
    /// Read and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&text)?;
        tracing::debug!(path = %path.display(), demos = config.demos.len(), "loaded config");
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.demos.is_empty() {
            return Err(ConfigError::Invalid("at least one demo is required".into()));
        }
        if self.pump.target_fps == 0 {
            return Err(ConfigError::Invalid("pump.target_fps must be positive".into()));
        }
        if self.snapshot.every == 0 {
            return Err(ConfigError::Invalid("snapshot.every must be positive".into()));
        }

        let mut seen = HashSet::new();
        for demo in &self.demos {
            if !is_export_prefix(&demo.name) {
                return Err(ConfigError::Invalid(format!(
                    "demo name `{}` is not a valid export prefix",
                    demo.name
                )));
            }
            if demo.spec().buffer_len().is_none() {
                return Err(ConfigError::Invalid(format!(
                    "demo `{}` is {}x{}; its framebuffer cannot fit in 4 GiB of guest memory",
                    demo.name, demo.width, demo.height
                )));
            }
            if !seen.insert(demo.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "demo `{}` is listed twice",
                    demo.name
                )));
            }
        }
        Ok(())
    }

    pub fn channel_specs(&self) -> Vec<ChannelSpec> {
        self.demos.iter().map(DemoConfig::spec).collect()
    }
}

/// `[A-Za-z_][A-Za-z0-9_]*`
fn is_export_prefix(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
