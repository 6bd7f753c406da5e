//! Configuration file handling.
//!
//! Settings come from `ecoled.toml`, looked up in the workspace directory
//! when a workspace is selected, or from the file passed with `--config`.
//! Missing sections and keys fall back to defaults.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::calc::GradingPolicy;
use crate::ranking::RankingPolicy;

pub const CONFIG_FILE_NAME: &str = "ecoled.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub grading: GradingConfig,

    #[serde(default)]
    pub ranking: RankingConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub limits: LimitsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradingConfig {
    /// Fraction of the maximum score needed to pass.
    #[serde(default = "default_pass_ratio")]
    pub pass_ratio: f64,
}

impl Default for GradingConfig {
    fn default() -> Self {
        Self {
            pass_ratio: default_pass_ratio(),
        }
    }
}

fn default_pass_ratio() -> f64 {
    0.5
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankingConfig {
    /// Students with fewer scored evaluations are left out of rankings.
    #[serde(default = "default_min_evaluations")]
    pub min_evaluations: usize,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            min_evaluations: default_min_evaluations(),
        }
    }
}

fn default_min_evaluations() -> usize {
    2
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Lifetime of cached predefined reports; 0 disables the cache.
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_ttl_seconds(),
        }
    }
}

fn default_ttl_seconds() -> u64 {
    300
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_batch_max_entries")]
    pub batch_max_entries: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            batch_max_entries: default_batch_max_entries(),
        }
    }
}

fn default_batch_max_entries() -> usize {
    5000
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// `Ok(None)` when the workspace has no config file.
    pub fn load_from_workspace(workspace: &Path) -> Result<Option<Self>> {
        let path = workspace.join(CONFIG_FILE_NAME);
        if !path.is_file() {
            return Ok(None);
        }
        Self::load(&path).map(Some)
    }

    pub fn validate(&self) -> Result<()> {
        let r = self.grading.pass_ratio;
        if !(r > 0.0 && r <= 1.0) {
            bail!("grading.pass_ratio must be in (0, 1], got {}", r);
        }
        if self.limits.batch_max_entries == 0 {
            bail!("limits.batch_max_entries must be at least 1");
        }
        Ok(())
    }

    pub fn grading_policy(&self) -> GradingPolicy {
        GradingPolicy {
            pass_ratio: self.grading.pass_ratio,
        }
    }

    pub fn ranking_policy(&self) -> RankingPolicy {
        RankingPolicy {
            min_evaluations: self.ranking.min_evaluations,
        }
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.ttl_seconds)
    }

    pub fn default_toml() -> String {
        toml::to_string_pretty(&Config::default()).unwrap_or_default()
    }
}
