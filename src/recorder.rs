//! Interaction records and everything derived from the log.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::ability;
use crate::bank::ItemBank;
use crate::config::EngineConfig;
use crate::error::{Result, TutorError};
use crate::models::{AttemptFeedback, InteractionRecord, RecentPerformance, UpdateResult, UserState};

/// Tolerance when comparing replayed and stored thetas.
const REPLAY_TOLERANCE: f64 = 1e-9;

pub fn validate_pass_rate(test_pass_rate: f64) -> Result<()> {
    if !test_pass_rate.is_finite() || !(0.0..=100.0).contains(&test_pass_rate) {
        return Err(TutorError::invalid(format!(
            "test pass rate must be within [0, 100], got {test_pass_rate}"
        )));
    }
    Ok(())
}

/// Build the record for a committed transition.
pub fn build_record(
    user_id: &str,
    epoch: u32,
    update: &UpdateResult,
    test_pass_rate: f64,
    feedback: &AttemptFeedback,
    timestamp: &str,
) -> Result<InteractionRecord> {
    validate_pass_rate(test_pass_rate)?;
    feedback.validate()?;
    Ok(InteractionRecord {
        id: None,
        user_id: user_id.to_string(),
        epoch,
        question_name: update.question_name.clone(),
        topic: update.topic.clone(),
        theta_before: update.theta_before,
        theta_after: update.theta_after,
        passed: update.passed,
        test_pass_rate,
        timestamp: timestamp.to_string(),
        difficulty_rating: feedback.difficulty_rating,
        confidence_level: feedback.confidence_level,
        notes: feedback.notes.clone(),
    })
}

/// Names of the items attempted in the last `window` records.
pub fn recent_item_names(records: &[InteractionRecord], window: usize) -> HashSet<String> {
    records
        .iter()
        .rev()
        .take(window)
        .map(|r| r.question_name.clone())
        .collect()
}

pub fn recent_performance(records: &[InteractionRecord], n: usize) -> RecentPerformance {
    let recent: Vec<&InteractionRecord> = records.iter().rev().take(n).collect();
    if recent.is_empty() {
        return RecentPerformance::default();
    }
    let attempts = recent.len();
    let correct = recent.iter().filter(|r| r.passed).count();
    let mean_rate = recent.iter().map(|r| r.test_pass_rate).sum::<f64>() / attempts as f64;
    RecentPerformance {
        attempts,
        correct,
        accuracy: correct as f64 / attempts as f64 * 100.0,
        mean_test_pass_rate: mean_rate,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicStats {
    pub topic: String,
    pub attempted: usize,
    pub passed: usize,
    pub success_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistorySummary {
    pub topics: Vec<TopicStats>,
    pub total_attempts: usize,
    pub total_passed: usize,
    pub success_rate: f64,
    pub recent: RecentPerformance,
}

fn rate(passed: usize, attempted: usize) -> f64 {
    if attempted == 0 {
        0.0
    } else {
        passed as f64 / attempted as f64 * 100.0
    }
}

/// Per-topic statistics in canonical topic order, plus overall totals.
pub fn summarize(bank: &ItemBank, records: &[InteractionRecord], recent_n: usize) -> HistorySummary {
    let mut counts: HashMap<&str, (usize, usize)> = HashMap::new();
    for record in records {
        let entry = counts.entry(record.topic.as_str()).or_default();
        entry.0 += 1;
        if record.passed {
            entry.1 += 1;
        }
    }

    let topics = bank
        .graph()
        .canonical_order()
        .into_iter()
        .map(|topic| {
            let (attempted, passed) = counts.get(topic).copied().unwrap_or_default();
            TopicStats {
                topic: topic.to_string(),
                attempted,
                passed,
                success_rate: rate(passed, attempted),
            }
        })
        .collect();

    let total_attempts = records.len();
    let total_passed = records.iter().filter(|r| r.passed).count();
    HistorySummary {
        topics,
        total_attempts,
        total_passed,
        success_rate: rate(total_passed, total_attempts),
        recent: recent_performance(records, recent_n),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayMismatch {
    pub record_id: Option<i64>,
    pub question_name: String,
    pub recorded_theta_before: f64,
    pub replayed_theta_before: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayReport {
    pub user_id: String,
    pub epoch: u32,
    pub replayed_attempts: usize,
    pub mismatches: Vec<ReplayMismatch>,
    /// Whether the replayed state equals the stored one.
    pub matches_stored: bool,
    pub state: UserState,
}

impl ReplayReport {
    pub fn is_consistent(&self) -> bool {
        self.mismatches.is_empty() && self.matches_stored
    }
}

/// Rebuild the current epoch's ability state from its interaction log.
pub fn replay(
    bank: &ItemBank,
    engine: &EngineConfig,
    stored: &UserState,
    records: &[InteractionRecord],
) -> Result<ReplayReport> {
    let mut state = UserState::new(&stored.user_id, stored.epoch);
    let mut mismatches = Vec::new();
    let mut replayed_attempts = 0;

    for record in records.iter().filter(|r| r.epoch == stored.epoch) {
        let item = bank.require_item(&record.question_name)?;
        let replayed_before = state.theta(&item.topic, engine.initial_theta);
        if (replayed_before - record.theta_before).abs() > REPLAY_TOLERANCE {
            mismatches.push(ReplayMismatch {
                record_id: record.id,
                question_name: record.question_name.clone(),
                recorded_theta_before: record.theta_before,
                replayed_theta_before: replayed_before,
            });
        }
        state = ability::apply_attempt(bank, &state, item, record.passed, engine, &record.timestamp)?
            .state;
        replayed_attempts += 1;
    }

    let matches_stored = same_abilities(&state, stored, engine);
    Ok(ReplayReport {
        user_id: stored.user_id.clone(),
        epoch: stored.epoch,
        replayed_attempts,
        mismatches,
        matches_stored,
        state,
    })
}

fn same_abilities(a: &UserState, b: &UserState, engine: &EngineConfig) -> bool {
    let topics: HashSet<&String> = a.abilities.keys().chain(b.abilities.keys()).collect();
    topics.into_iter().all(|topic| {
        let x = a.ability(topic, engine.initial_theta);
        let y = b.ability(topic, engine.initial_theta);
        (x.theta - y.theta).abs() <= REPLAY_TOLERANCE
            && x.attempt_count == y.attempt_count
            && x.correct_count == y.correct_count
            && x.mastered == y.mastered
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DifficultyRating, TopicStatus};

    fn bank() -> ItemBank {
        ItemBank::from_json_str(
            r#"{
                "topics": [{"name": "A"}, {"name": "B", "prerequisites": ["A"]}],
                "items": [
                    {"name": "a1", "topic": "A", "difficulty": 0.0, "discrimination": 1.0},
                    {"name": "a2", "topic": "A", "difficulty": 0.5, "discrimination": 1.4},
                    {"name": "b1", "topic": "B", "difficulty": 0.0, "discrimination": 1.0}
                ]
            }"#,
            &EngineConfig::default(),
        )
        .unwrap()
    }

    fn record(question: &str, topic: &str, passed: bool, rate: f64) -> InteractionRecord {
        InteractionRecord {
            id: None,
            user_id: "u".into(),
            epoch: 0,
            question_name: question.into(),
            topic: topic.into(),
            theta_before: 0.0,
            theta_after: 0.0,
            passed,
            test_pass_rate: rate,
            timestamp: "t".into(),
            difficulty_rating: None,
            confidence_level: None,
            notes: None,
        }
    }

    fn update(passed: bool) -> UpdateResult {
        UpdateResult {
            question_name: "a1".into(),
            topic: "A".into(),
            passed,
            theta_before: 0.0,
            theta_after: 0.15,
            previous_status: TopicStatus::Opened,
            new_status: TopicStatus::Opened,
            progress_percent: 12.5,
            unlocked_topics: vec![],
            newly_mastered: vec![],
        }
    }

    /// Run real transitions and record them, as the engine would.
    fn simulate(bank: &ItemBank, attempts: &[(&str, bool)]) -> (UserState, Vec<InteractionRecord>) {
        let engine = EngineConfig::default();
        let mut state = UserState::new("u", 0);
        let mut records = Vec::new();
        for (i, (question, passed)) in attempts.iter().enumerate() {
            let item = bank.item(question).unwrap();
            let t = ability::apply_attempt(bank, &state, item, *passed, &engine, "ts").unwrap();
            let mut r = build_record(
                "u",
                0,
                &t.update,
                if *passed { 100.0 } else { 0.0 },
                &AttemptFeedback::default(),
                "ts",
            )
            .unwrap();
            r.id = Some(i as i64 + 1);
            records.push(r);
            state = t.state;
        }
        (state, records)
    }

    mod record_tests {
        use super::*;

        #[test]
        fn copies_transition_and_feedback() {
            let feedback = AttemptFeedback {
                difficulty_rating: Some(DifficultyRating::Hard),
                confidence_level: Some(2),
                notes: Some("off by one".into()),
            };
            let r = build_record("u", 3, &update(true), 75.0, &feedback, "now").unwrap();
            assert_eq!(r.epoch, 3);
            assert_eq!(r.theta_after, 0.15);
            assert_eq!(r.test_pass_rate, 75.0);
            assert_eq!(r.difficulty_rating, Some(DifficultyRating::Hard));
            assert_eq!(r.notes.as_deref(), Some("off by one"));
        }

        #[test]
        fn rejects_pass_rate_out_of_range() {
            let fb = AttemptFeedback::default();
            assert!(build_record("u", 0, &update(true), 100.5, &fb, "t").is_err());
            assert!(build_record("u", 0, &update(true), -1.0, &fb, "t").is_err());
            assert!(build_record("u", 0, &update(true), f64::NAN, &fb, "t").is_err());
        }

        #[test]
        fn rejects_bad_confidence() {
            let fb = AttemptFeedback {
                confidence_level: Some(9),
                ..Default::default()
            };
            assert!(matches!(
                build_record("u", 0, &update(true), 50.0, &fb, "t"),
                Err(TutorError::InvalidInput(_))
            ));
        }
    }

    mod analytics_tests {
        use super::*;

        #[test]
        fn recent_names_use_last_window() {
            let records = vec![
                record("a1", "A", true, 100.0),
                record("a2", "A", true, 100.0),
                record("b1", "B", false, 0.0),
            ];
            let recent = recent_item_names(&records, 2);
            assert!(recent.contains("a2") && recent.contains("b1"));
            assert!(!recent.contains("a1"));
            assert!(recent_item_names(&records, 0).is_empty());
        }

        #[test]
        fn recent_performance_over_last_n() {
            let records = vec![
                record("a1", "A", false, 0.0),
                record("a1", "A", true, 100.0),
                record("a2", "A", false, 50.0),
            ];
            let perf = recent_performance(&records, 2);
            assert_eq!(perf.attempts, 2);
            assert_eq!(perf.correct, 1);
            assert_eq!(perf.accuracy, 50.0);
            assert_eq!(perf.mean_test_pass_rate, 75.0);
            assert_eq!(recent_performance(&[], 5), RecentPerformance::default());
        }

        #[test]
        fn summary_per_topic_in_canonical_order() {
            let records = vec![
                record("b1", "B", true, 100.0),
                record("a1", "A", true, 100.0),
                record("a2", "A", false, 20.0),
            ];
            let summary = summarize(&bank(), &records, 10);
            assert_eq!(summary.topics[0].topic, "A");
            assert_eq!(summary.topics[0].attempted, 2);
            assert_eq!(summary.topics[0].success_rate, 50.0);
            assert_eq!(summary.topics[1].passed, 1);
            assert_eq!(summary.total_attempts, 3);
            assert_eq!(summary.total_passed, 2);
        }

        #[test]
        fn empty_history_has_zero_rates() {
            let summary = summarize(&bank(), &[], 5);
            assert_eq!(summary.total_attempts, 0);
            assert_eq!(summary.success_rate, 0.0);
            assert!(summary.topics.iter().all(|t| t.attempted == 0));
        }
    }

    mod replay_tests {
        use super::*;

        #[test]
        fn replay_reproduces_state() {
            let bank = bank();
            let (state, records) =
                simulate(&bank, &[("a1", true), ("a2", false), ("a1", true), ("a2", true)]);
            let report = replay(&bank, &EngineConfig::default(), &state, &records).unwrap();
            assert_eq!(report.replayed_attempts, 4);
            assert!(report.is_consistent());
            assert_eq!(report.state.abilities["A"].attempt_count, 4);
        }

        #[test]
        fn detects_tampered_theta_before() {
            let bank = bank();
            let (state, mut records) = simulate(&bank, &[("a1", true), ("a1", true)]);
            records[1].theta_before = 0.9;
            let report = replay(&bank, &EngineConfig::default(), &state, &records).unwrap();
            assert_eq!(report.mismatches.len(), 1);
            assert_eq!(report.mismatches[0].record_id, Some(2));
            assert!(report.matches_stored);
            assert!(!report.is_consistent());
        }

        #[test]
        fn detects_stored_state_drift() {
            let bank = bank();
            let (mut state, records) = simulate(&bank, &[("a1", true)]);
            state.abilities.get_mut("A").unwrap().theta += 0.5;
            let report = replay(&bank, &EngineConfig::default(), &state, &records).unwrap();
            assert!(report.mismatches.is_empty());
            assert!(!report.matches_stored);
        }

        #[test]
        fn ignores_other_epochs() {
            let bank = bank();
            let (_, mut records) = simulate(&bank, &[("a1", true), ("a1", false)]);
            for r in &mut records {
                r.epoch = 0;
            }
            let fresh = UserState::new("u", 1);
            let report = replay(&bank, &EngineConfig::default(), &fresh, &records).unwrap();
            assert_eq!(report.replayed_attempts, 0);
            assert!(report.is_consistent());
        }

        #[test]
        fn unknown_question_fails() {
            let bank = bank();
            let records = vec![record("gone", "A", true, 100.0)];
            let result = replay(&bank, &EngineConfig::default(), &UserState::new("u", 0), &records);
            assert!(matches!(result, Err(TutorError::NotFound(_))));
        }
    }
}
