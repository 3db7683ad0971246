//! Question selection.
//!
//! Maximum-information selection: pick the opened topic furthest from
//! mastery, then the item whose Fisher information at the learner's theta
//! is highest, skipping items seen in the recent window. Selection never
//! mutates state, so asking twice gives the same answer.

use std::collections::{BTreeMap, HashSet};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::ability;
use crate::bank::ItemBank;
use crate::config::EngineConfig;
use crate::error::{Result, TutorError};
use crate::irt::{self, DifficultyBand};
use crate::models::{Item, SelectionResult, TopicStatus, UserState};

/// Information values closer than this are treated as a tie.
const INFORMATION_RESOLUTION: f64 = 1e-12;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SelectionMode {
    /// Next opened topic furthest from mastery.
    #[default]
    Default,
    /// A specific opened or mastered topic.
    Revisit(String),
}

#[derive(Debug, Clone)]
pub struct ScoredItem<'a> {
    pub item: &'a Item,
    pub probability_correct: f64,
    pub information: f64,
}

impl ScoredItem<'_> {
    fn rank_key(&self) -> f64 {
        (self.information / INFORMATION_RESOLUTION).round()
    }
}

/// Score `items` at `theta`, most informative first, ties by name.
pub fn rank_items<'a>(
    items: &[&'a Item],
    theta: f64,
    engine: &EngineConfig,
) -> Result<Vec<ScoredItem<'a>>> {
    let mut scored = items
        .iter()
        .map(|&item| {
            let p = irt::probability_correct_clamped(
                theta,
                item.difficulty,
                item.discrimination,
                engine.exponent_clamp,
            )?;
            Ok(ScoredItem {
                item,
                probability_correct: p,
                information: item.discrimination * item.discrimination * p * (1.0 - p),
            })
        })
        .collect::<Result<Vec<_>>>()?;
    scored.sort_by(|a, b| {
        b.rank_key()
            .total_cmp(&a.rank_key())
            .then_with(|| a.item.name.cmp(&b.item.name))
    });
    Ok(scored)
}

/// The opened topic with the lowest progress, ties by canonical order then
/// name. Topics without questions are skipped. `None` when no opened topic
/// has anything to serve.
pub fn focus_topic(
    bank: &ItemBank,
    state: &UserState,
    statuses: &BTreeMap<String, TopicStatus>,
    engine: &EngineConfig,
) -> Option<String> {
    let graph = bank.graph();
    statuses
        .iter()
        .filter(|(topic, status)| {
            **status == TopicStatus::Opened && !bank.items_for_topic(topic).is_empty()
        })
        .map(|(topic, _)| {
            let progress = ability::topic_progress_percent(bank, state, statuses, topic, engine);
            (progress, graph.rank(topic).unwrap_or(usize::MAX), topic)
        })
        .min_by(|a, b| {
            a.0.total_cmp(&b.0)
                .then_with(|| a.1.cmp(&b.1))
                .then_with(|| a.2.cmp(b.2))
        })
        .map(|(_, _, topic)| topic.clone())
}

/// FNV-1a over the user id and the little-endian attempt count. Stable
/// across builds, so an exploration pick never changes under a user.
fn exploration_seed(user_id: &str, attempts: u32) -> u64 {
    user_id
        .bytes()
        .chain(attempts.to_le_bytes())
        .fold(FNV_OFFSET_BASIS, |hash, byte| {
            (hash ^ u64::from(byte)).wrapping_mul(FNV_PRIME)
        })
}

/// Choose the next question for `state`.
///
/// `recent` holds the names of the items in the user's recent window.
pub fn select(
    bank: &ItemBank,
    engine: &EngineConfig,
    state: &UserState,
    recent: &HashSet<String>,
    mode: &SelectionMode,
) -> Result<SelectionResult> {
    let statuses = ability::derive_statuses(bank, state, engine);
    let topic = match mode {
        SelectionMode::Default => focus_topic(bank, state, &statuses, engine).ok_or_else(|| {
            TutorError::NoEligibleItem("no opened topic with questions to practice".to_string())
        })?,
        SelectionMode::Revisit(topic) => {
            bank.require_topic(topic)?;
            if statuses.get(topic) == Some(&TopicStatus::Locked) {
                let missing: Vec<&str> = bank
                    .graph()
                    .transitive_prerequisites(topic)
                    .into_iter()
                    .filter(|p| statuses.get(*p) != Some(&TopicStatus::Mastered))
                    .collect();
                return Err(TutorError::NoEligibleItem(format!(
                    "topic '{topic}' is locked; master {} first",
                    missing.join(", ")
                )));
            }
            topic.clone()
        }
    };

    let theta = state.theta(&topic, engine.initial_theta);
    let items = bank.items_for_topic(&topic);
    if items.is_empty() {
        return Err(TutorError::NoEligibleItem(format!(
            "topic '{topic}' has no questions"
        )));
    }
    let ranked = rank_items(&items, theta, engine)?;
    let fresh: Vec<&ScoredItem> = ranked
        .iter()
        .filter(|s| !recent.contains(&s.item.name))
        .collect();

    let (chosen, is_fallback, is_exploration) = if fresh.is_empty() {
        (&ranked[0], true, false)
    } else {
        explore(engine, state, &fresh)
    };

    let band = DifficultyBand::classify(theta, chosen.item.difficulty);
    let mut reason = selection_reason(&topic, band, is_fallback, is_exploration);
    if matches!(mode, SelectionMode::Revisit(_)) {
        reason = format!("revisiting {topic}: {reason}");
    }

    Ok(SelectionResult {
        item: chosen.item.clone(),
        topic,
        theta,
        probability_correct: chosen.probability_correct,
        information: chosen.information,
        reason,
        is_fallback,
        is_exploration,
    })
}

/// Best fresh item, or with probability `exploration_rate` a uniform pick
/// among the top-k. Seeded from the user and their attempt count.
fn explore<'s, 'a>(
    engine: &EngineConfig,
    state: &UserState,
    fresh: &[&'s ScoredItem<'a>],
) -> (&'s ScoredItem<'a>, bool, bool) {
    if engine.exploration_rate > 0.0 && fresh.len() > 1 {
        let mut rng = StdRng::seed_from_u64(exploration_seed(&state.user_id, state.total_attempts()));
        if rng.gen::<f64>() < engine.exploration_rate {
            let k = engine.exploration_top_k.min(fresh.len());
            let pick = rng.gen_range(0..k);
            return (fresh[pick], false, pick != 0);
        }
    }
    (fresh[0], false, false)
}

fn selection_reason(topic: &str, band: DifficultyBand, fallback: bool, exploration: bool) -> String {
    if fallback {
        return format!(
            "every {topic} question was attempted recently; repeating the closest match to your ability"
        );
    }
    if exploration {
        return format!("exploring another well-matched {topic} question");
    }
    match band {
        DifficultyBand::Medium => format!("closest to your current ability level in {topic}"),
        DifficultyBand::Easy => {
            format!("most informative {topic} question left, a little below your level")
        }
        DifficultyBand::Hard => {
            format!("most informative {topic} question left, a stretch above your level")
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    pub name: String,
    pub difficulty: f64,
    pub band: DifficultyBand,
    pub probability_correct: f64,
    pub information: f64,
    pub recently_attempted: bool,
}

/// Up to `n` items of `topic` ranked by information. Recent items only
/// appear when there are not enough fresh ones.
pub fn recommend(
    bank: &ItemBank,
    engine: &EngineConfig,
    state: &UserState,
    recent: &HashSet<String>,
    topic: &str,
    n: usize,
) -> Result<Vec<Recommendation>> {
    bank.require_topic(topic)?;
    let theta = state.theta(topic, engine.initial_theta);
    let items = bank.items_for_topic(topic);
    let ranked = rank_items(&items, theta, engine)?;
    let (fresh, seen): (Vec<_>, Vec<_>) = ranked
        .into_iter()
        .partition(|s| !recent.contains(&s.item.name));

    Ok(fresh
        .into_iter()
        .chain(seen)
        .take(n)
        .map(|s| Recommendation {
            name: s.item.name.clone(),
            difficulty: s.item.difficulty,
            band: DifficultyBand::classify(theta, s.item.difficulty),
            probability_correct: s.probability_correct,
            information: s.information,
            recently_attempted: recent.contains(&s.item.name),
        })
        .collect())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Explanation {
    pub question_name: String,
    pub topic: String,
    pub theta: f64,
    pub difficulty: f64,
    pub band: DifficultyBand,
    pub probability_correct: f64,
    pub information: f64,
    /// `|difficulty - theta|`
    pub difficulty_gap: f64,
    pub reason: String,
}

pub fn explain(
    bank: &ItemBank,
    engine: &EngineConfig,
    state: &UserState,
    question: &str,
) -> Result<Explanation> {
    let item = bank.require_item(question)?;
    let theta = state.theta(&item.topic, engine.initial_theta);
    let p = irt::probability_correct_clamped(
        theta,
        item.difficulty,
        item.discrimination,
        engine.exponent_clamp,
    )?;
    let information =
        irt::fisher_information(theta, item.difficulty, item.discrimination, engine.exponent_clamp)?;
    let band = DifficultyBand::classify(theta, item.difficulty);

    Ok(Explanation {
        question_name: item.name.clone(),
        topic: item.topic.clone(),
        theta,
        difficulty: item.difficulty,
        band,
        probability_correct: p,
        information,
        difficulty_gap: (item.difficulty - theta).abs(),
        reason: explanation_reason(band, p, information),
    })
}

fn explanation_reason(band: DifficultyBand, p: f64, information: f64) -> String {
    let info = if information > 1.0 {
        "very informative"
    } else if information > 0.5 {
        "informative"
    } else {
        "moderately informative"
    };
    let chance = if p > 0.8 {
        "a high chance of success"
    } else if p > 0.5 {
        "a good chance of success"
    } else {
        "a real challenge"
    };
    format!(
        "This {} question is {info} at your current level and offers {chance}.",
        band.as_str()
    )
}
