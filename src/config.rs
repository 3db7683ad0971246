//! Engine and application configuration.
//!
//! Every field has a serde default so a partial (or empty) TOML file is a
//! valid configuration. Constants are tuning choices, not correctness
//! requirements; [`TutorConfig::validate`] only rejects values that would
//! break the model.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TutorError};

/// Top-level configuration, one section per concern.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TutorConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub bank: BankConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Parameters of the ability model and the question selector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Prior ability for a topic the learner has never attempted.
    #[serde(default)]
    pub initial_theta: f64,
    #[serde(default = "default_theta_min")]
    pub theta_min: f64,
    #[serde(default = "default_theta_max")]
    pub theta_max: f64,
    /// Step size of the online gradient update.
    ///
    /// 0.3 moves theta by at most 0.3 * a per attempt, so reaching the
    /// default mastery threshold from the prior takes several consistent
    /// passes, while a single careless failure costs well under one
    /// difficulty band. Larger values react faster but swing more.
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    /// Bound on `a * (theta - b)` before exponentiation.
    #[serde(default = "default_exponent_clamp")]
    pub exponent_clamp: f64,
    /// Mastery threshold for topics that do not declare their own.
    #[serde(default = "default_mastery_threshold")]
    pub mastery_threshold: f64,
    /// Attempts required on a topic before it can count as mastered.
    #[serde(default = "default_min_attempts")]
    pub min_attempts_for_mastery: u32,
    /// Number of most recent attempts whose items are not re-served.
    #[serde(default = "default_recency_window")]
    pub recency_window: usize,
    /// Probability of picking among the top-k items instead of the best.
    #[serde(default)]
    pub exploration_rate: f64,
    #[serde(default = "default_exploration_top_k")]
    pub exploration_top_k: usize,
}

fn default_theta_min() -> f64 {
    -4.0
}
fn default_theta_max() -> f64 {
    4.0
}
fn default_learning_rate() -> f64 {
    0.3
}
fn default_exponent_clamp() -> f64 {
    35.0
}
fn default_mastery_threshold() -> f64 {
    1.2
}
fn default_min_attempts() -> u32 {
    3
}
fn default_recency_window() -> usize {
    5
}
fn default_exploration_top_k() -> usize {
    3
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            initial_theta: 0.0,
            theta_min: default_theta_min(),
            theta_max: default_theta_max(),
            learning_rate: default_learning_rate(),
            exponent_clamp: default_exponent_clamp(),
            mastery_threshold: default_mastery_threshold(),
            min_attempts_for_mastery: default_min_attempts(),
            recency_window: default_recency_window(),
            exploration_rate: 0.0,
            exploration_top_k: default_exploration_top_k(),
        }
    }
}

impl EngineConfig {
    pub fn clamp_theta(&self, theta: f64) -> f64 {
        theta.clamp(self.theta_min, self.theta_max)
    }

    pub fn validate(&self) -> Result<()> {
        let finite = [
            ("initial_theta", self.initial_theta),
            ("theta_min", self.theta_min),
            ("theta_max", self.theta_max),
            ("learning_rate", self.learning_rate),
            ("exponent_clamp", self.exponent_clamp),
            ("mastery_threshold", self.mastery_threshold),
            ("exploration_rate", self.exploration_rate),
        ];
        for (name, value) in finite {
            if !value.is_finite() {
                return Err(TutorError::config(format!("engine.{name} must be finite")));
            }
        }
        if self.theta_min >= self.theta_max {
            return Err(TutorError::config(format!(
                "engine.theta_min ({}) must be below engine.theta_max ({})",
                self.theta_min, self.theta_max
            )));
        }
        if !(self.theta_min..=self.theta_max).contains(&self.initial_theta) {
            return Err(TutorError::config(
                "engine.initial_theta must lie within [theta_min, theta_max]",
            ));
        }
        if self.learning_rate <= 0.0 {
            return Err(TutorError::config("engine.learning_rate must be positive"));
        }
        if self.exponent_clamp <= 0.0 {
            return Err(TutorError::config("engine.exponent_clamp must be positive"));
        }
        self.validate_threshold(self.mastery_threshold, "engine.mastery_threshold")?;
        if !(0.0..=1.0).contains(&self.exploration_rate) {
            return Err(TutorError::config(
                "engine.exploration_rate must lie within [0, 1]",
            ));
        }
        if self.exploration_top_k == 0 {
            return Err(TutorError::config(
                "engine.exploration_top_k must be at least 1",
            ));
        }
        Ok(())
    }

    /// A threshold must be reachable and above the prior, otherwise
    /// progress has no range to move through.
    pub fn validate_threshold(&self, threshold: f64, what: &str) -> Result<()> {
        if !threshold.is_finite() {
            return Err(TutorError::config(format!("{what} must be finite")));
        }
        if threshold <= self.initial_theta {
            return Err(TutorError::config(format!(
                "{what} ({threshold}) must be above initial_theta ({})",
                self.initial_theta
            )));
        }
        if threshold > self.theta_max {
            return Err(TutorError::config(format!(
                "{what} ({threshold}) is unreachable above theta_max ({})",
                self.theta_max
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BankConfig {
    #[serde(default = "default_bank_path")]
    pub path: PathBuf,
}

fn default_bank_path() -> PathBuf {
    PathBuf::from("bank.json")
}

impl Default for BankConfig {
    fn default() -> Self {
        Self {
            path: default_bank_path(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

impl TutorConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: TutorConfig =
            toml::from_str(s).map_err(|e| TutorError::config(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            TutorError::config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    /// Load `path` if given, otherwise fall back to defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.engine.validate()
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| TutorError::config(e.to_string()))
    }
}
