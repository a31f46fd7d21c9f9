//! Tuning knobs for building and sampling a tile tree.
//!
//! All settings have serde defaults so a partial TOML table is enough.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{ConfigError, ConfigResult};

/// Settings for a whole tiling run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TileSettings {
    #[serde(default)]
    pub build: BuildSettings,
    #[serde(default)]
    pub sparsify: SparsifySettings,
}

/// Settings for the concurrent build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildSettings {
    /// A leaf sheds its buffer once it holds this many objects
    #[serde(default = "default_max_objects_per_bag")]
    pub max_objects_per_bag: usize,
    /// A leaf splits once it has shed this many bags
    #[serde(default = "default_max_bags_before_split")]
    pub max_bags_before_split: usize,
    /// Leaves at this depth keep shedding instead of splitting
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,
    /// Soft cap on queued batches before producers and reworkers back off
    #[serde(default = "default_max_worklist_size")]
    pub max_worklist_size: usize,
    /// Idle sleep between queue polls, in milliseconds
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Run one worker per CPU core instead of `worker_count`
    #[serde(default)]
    pub use_all_cores: bool,
    #[serde(default = "default_rework_worker_count")]
    pub rework_worker_count: usize,
    /// Objects per batch handed to a producer
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// How long a second build waits for admission before giving up
    #[serde(default = "default_admission_timeout_ms")]
    pub admission_timeout_ms: u64,
}

fn default_max_objects_per_bag() -> usize {
    500
}

fn default_max_bags_before_split() -> usize {
    10
}

fn default_max_depth() -> u32 {
    24
}

fn default_max_worklist_size() -> usize {
    250
}

fn default_delay_ms() -> u64 {
    5
}

fn default_worker_count() -> usize {
    3
}

fn default_rework_worker_count() -> usize {
    2
}

fn default_batch_size() -> usize {
    500
}

fn default_admission_timeout_ms() -> u64 {
    1000
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            max_objects_per_bag: default_max_objects_per_bag(),
            max_bags_before_split: default_max_bags_before_split(),
            max_depth: default_max_depth(),
            max_worklist_size: default_max_worklist_size(),
            delay_ms: default_delay_ms(),
            worker_count: default_worker_count(),
            use_all_cores: false,
            rework_worker_count: default_rework_worker_count(),
            batch_size: default_batch_size(),
            admission_timeout_ms: default_admission_timeout_ms(),
        }
    }
}

impl BuildSettings {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn admission_timeout(&self) -> Duration {
        Duration::from_millis(self.admission_timeout_ms)
    }

    /// Worker pool size for a build.
    pub fn effective_worker_count(&self) -> usize {
        if self.use_all_cores {
            num_cpus::get().max(1)
        } else {
            self.worker_count
        }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let positive = [
            ("max_objects_per_bag", self.max_objects_per_bag),
            ("max_bags_before_split", self.max_bags_before_split),
            ("max_worklist_size", self.max_worklist_size),
            ("worker_count", self.worker_count),
            ("rework_worker_count", self.rework_worker_count),
            ("batch_size", self.batch_size),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::Zero(field));
            }
        }
        Ok(())
    }
}

/// Settings for the sparsify pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SparsifySettings {
    /// Target sample size is `max_objects_per_bag * oversample_factor`
    #[serde(default = "default_oversample_factor")]
    pub oversample_factor: usize,
    /// Draw attempts per node before accepting a short sample
    #[serde(default = "default_max_tries")]
    pub max_tries: usize,
    /// Fixed RNG seed for reproducible samples
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_oversample_factor() -> usize {
    5
}

fn default_max_tries() -> usize {
    1000
}

impl Default for SparsifySettings {
    fn default() -> Self {
        Self {
            oversample_factor: default_oversample_factor(),
            max_tries: default_max_tries(),
            seed: None,
        }
    }
}

impl TileSettings {
    pub fn validate(&self) -> ConfigResult<()> {
        self.build.validate()?;
        if self.sparsify.oversample_factor == 0 {
            return Err(ConfigError::Zero("oversample_factor"));
        }
        Ok(())
    }
}
