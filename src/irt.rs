//! Two-parameter logistic (2PL) item response model.
//!
//! `P(correct | theta) = 1 / (1 + exp(-a * (theta - b)))` where `a` is the
//! item discrimination and `b` its difficulty. Ability is updated online with
//! a single gradient-ascent step on the log-likelihood of each observed
//! outcome, so the per-topic state is just one number.

use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::error::{Result, TutorError};

/// Default bound on the logistic exponent. `exp(35)` is ~1.6e15, far from
/// overflow, and keeps `p` strictly inside (0, 1).
pub const DEFAULT_EXPONENT_CLAMP: f64 = 35.0;

/// Observed result of an attempt, as used by the likelihood.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Passed,
    Failed,
}

impl Outcome {
    pub fn from_passed(passed: bool) -> Self {
        if passed {
            Outcome::Passed
        } else {
            Outcome::Failed
        }
    }

    /// Accepts exactly 0.0 or 1.0.
    pub fn from_score(score: f64) -> Result<Self> {
        if score == 1.0 {
            Ok(Outcome::Passed)
        } else if score == 0.0 {
            Ok(Outcome::Failed)
        } else {
            Err(TutorError::invalid(format!(
                "outcome must be 0 or 1, got {score}"
            )))
        }
    }

    pub fn as_f64(self) -> f64 {
        match self {
            Outcome::Passed => 1.0,
            Outcome::Failed => 0.0,
        }
    }
}

fn check_finite(name: &str, value: f64) -> Result<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(TutorError::invalid(format!("{name} must be finite, got {value}")))
    }
}

fn check_discrimination(discrimination: f64) -> Result<()> {
    check_finite("discrimination", discrimination)?;
    if discrimination <= 0.0 {
        return Err(TutorError::config(format!(
            "discrimination must be positive, got {discrimination}"
        )));
    }
    Ok(())
}

/// Probability of a correct response, with the exponent clamped to
/// `[-exponent_clamp, exponent_clamp]`.
pub fn probability_correct_clamped(
    theta: f64,
    difficulty: f64,
    discrimination: f64,
    exponent_clamp: f64,
) -> Result<f64> {
    check_finite("theta", theta)?;
    check_finite("difficulty", difficulty)?;
    check_discrimination(discrimination)?;

    let exponent = (-discrimination * (theta - difficulty)).clamp(-exponent_clamp, exponent_clamp);
    Ok(1.0 / (1.0 + exponent.exp()))
}

pub fn probability_correct(theta: f64, difficulty: f64, discrimination: f64) -> Result<f64> {
    probability_correct_clamped(theta, difficulty, discrimination, DEFAULT_EXPONENT_CLAMP)
}

/// Fisher information of an item at `theta`: `a^2 * p * (1 - p)`.
///
/// Peaks where the item difficulty equals theta.
pub fn fisher_information(
    theta: f64,
    difficulty: f64,
    discrimination: f64,
    exponent_clamp: f64,
) -> Result<f64> {
    let p = probability_correct_clamped(theta, difficulty, discrimination, exponent_clamp)?;
    Ok(discrimination * discrimination * p * (1.0 - p))
}

/// One gradient step on the log-likelihood of `outcome`:
/// `theta + learning_rate * a * (outcome - p)`, left unclamped.
pub fn gradient_step(
    theta: f64,
    difficulty: f64,
    discrimination: f64,
    outcome: f64,
    learning_rate: f64,
    exponent_clamp: f64,
) -> Result<f64> {
    let outcome = Outcome::from_score(outcome)?;
    check_finite("learning_rate", learning_rate)?;
    if learning_rate <= 0.0 {
        return Err(TutorError::invalid(format!(
            "learning_rate must be positive, got {learning_rate}"
        )));
    }
    let p = probability_correct_clamped(theta, difficulty, discrimination, exponent_clamp)?;
    Ok(theta + learning_rate * discrimination * (outcome.as_f64() - p))
}

/// Update ability after an attempt and clamp it into the configured range.
pub fn update_theta(
    theta: f64,
    difficulty: f64,
    discrimination: f64,
    outcome: f64,
    learning_rate: f64,
    config: &EngineConfig,
) -> Result<f64> {
    let raw = gradient_step(
        theta,
        difficulty,
        discrimination,
        outcome,
        learning_rate,
        config.exponent_clamp,
    )?;
    Ok(config.clamp_theta(raw))
}

/// Item difficulty relative to the learner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DifficultyBand {
    Easy,
    Medium,
    Hard,
}

impl DifficultyBand {
    /// Easy below `theta - 0.5`, hard above `theta + 0.5`.
    pub fn classify(theta: f64, difficulty: f64) -> Self {
        let gap = difficulty - theta;
        if gap < -0.5 {
            DifficultyBand::Easy
        } else if gap > 0.5 {
            DifficultyBand::Hard
        } else {
            DifficultyBand::Medium
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DifficultyBand::Easy => "easy",
            DifficultyBand::Medium => "medium",
            DifficultyBand::Hard => "hard",
        }
    }
}
