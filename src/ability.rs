//! Ability model and mastery tracking.
//!
//! Status is derived, never stored: a topic is locked while any prerequisite
//! is not mastered, mastered once theta reaches the topic threshold with
//! enough attempts, and opened otherwise. The only stored bit is the
//! mastery latch on [`AbilityState`], which keeps a mastered topic mastered
//! after later failures.

use std::collections::BTreeMap;

use crate::bank::ItemBank;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::irt;
use crate::models::{AbilityState, Item, TopicProgress, TopicStatus, UpdateResult, UserState};

/// Highest progress a topic can show before it is mastered.
pub const MAX_UNMASTERED_PROGRESS: f64 = 99.0;

/// Derive the status of every topic, walking topics in canonical order so
/// that prerequisites are always resolved first.
pub fn derive_statuses(
    bank: &ItemBank,
    state: &UserState,
    engine: &EngineConfig,
) -> BTreeMap<String, TopicStatus> {
    let graph = bank.graph();
    let mut statuses = BTreeMap::new();
    for topic in graph.canonical_order() {
        let locked = graph
            .prerequisites(topic)
            .iter()
            .any(|p| statuses.get(*p) != Some(&TopicStatus::Mastered));
        let status = if locked {
            TopicStatus::Locked
        } else {
            let ability = state.ability(topic, engine.initial_theta);
            if ability.mastered || meets_mastery(bank, &ability, engine) {
                TopicStatus::Mastered
            } else {
                TopicStatus::Opened
            }
        };
        statuses.insert(topic.to_string(), status);
    }
    statuses
}

fn meets_mastery(bank: &ItemBank, ability: &AbilityState, engine: &EngineConfig) -> bool {
    ability.theta >= bank.mastery_threshold(&ability.topic, engine)
        && ability.attempt_count >= bank.min_attempts(&ability.topic, engine)
}

/// Progress towards mastery as a percentage.
///
/// Linear in theta between the prior and the threshold. Mastered topics
/// always report 100; anything else is capped just below it.
pub fn progress_percent(theta: f64, status: TopicStatus, threshold: f64, initial_theta: f64) -> f64 {
    if status == TopicStatus::Mastered {
        return 100.0;
    }
    let span = threshold - initial_theta;
    if span <= 0.0 {
        return 0.0;
    }
    ((theta - initial_theta) / span * 100.0).clamp(0.0, MAX_UNMASTERED_PROGRESS)
}

pub fn topic_progress_percent(
    bank: &ItemBank,
    state: &UserState,
    statuses: &BTreeMap<String, TopicStatus>,
    topic: &str,
    engine: &EngineConfig,
) -> f64 {
    let status = statuses.get(topic).copied().unwrap_or(TopicStatus::Locked);
    progress_percent(
        state.theta(topic, engine.initial_theta),
        status,
        bank.mastery_threshold(topic, engine),
        engine.initial_theta,
    )
}

/// Per-topic progress in canonical order.
pub fn topic_progress(
    bank: &ItemBank,
    state: &UserState,
    engine: &EngineConfig,
) -> Vec<TopicProgress> {
    let statuses = derive_statuses(bank, state, engine);
    let graph = bank.graph();
    graph
        .canonical_order()
        .into_iter()
        .map(|topic| {
            let ability = state.ability(topic, engine.initial_theta);
            let status = statuses.get(topic).copied().unwrap_or(TopicStatus::Locked);
            let threshold = bank.mastery_threshold(topic, engine);
            TopicProgress {
                topic: topic.to_string(),
                theta: ability.theta,
                status,
                progress_percent: progress_percent(
                    ability.theta,
                    status,
                    threshold,
                    engine.initial_theta,
                ),
                attempt_count: ability.attempt_count,
                correct_count: ability.correct_count,
                mastery_threshold: threshold,
                level: graph.level(topic).unwrap_or(0),
                prerequisites: graph
                    .prerequisites(topic)
                    .into_iter()
                    .map(str::to_string)
                    .collect(),
            }
        })
        .collect()
}

/// The state after one attempt together with what changed.
#[derive(Debug, Clone)]
pub struct Transition {
    pub state: UserState,
    pub update: UpdateResult,
}

/// Apply one graded attempt to `state` without touching the original.
///
/// Updates theta and counters of the item's topic, then re-derives every
/// status so that unlocks cascade to dependents, and latches every topic
/// that is now mastered.
pub fn apply_attempt(
    bank: &ItemBank,
    state: &UserState,
    item: &Item,
    passed: bool,
    engine: &EngineConfig,
    timestamp: &str,
) -> Result<Transition> {
    let before = derive_statuses(bank, state, engine);
    let mut ability = state.ability(&item.topic, engine.initial_theta);
    let theta_before = ability.theta;
    let theta_after = irt::update_theta(
        theta_before,
        item.difficulty,
        item.discrimination,
        irt::Outcome::from_passed(passed).as_f64(),
        engine.learning_rate,
        engine,
    )?;

    ability.theta = theta_after;
    ability.attempt_count += 1;
    if passed {
        ability.correct_count += 1;
    }
    ability.updated_at = Some(timestamp.to_string());

    let mut next = state.clone();
    next.abilities.insert(item.topic.clone(), ability);

    let after = derive_statuses(bank, &next, engine);
    for (topic, status) in &after {
        if *status == TopicStatus::Mastered {
            let entry = next
                .abilities
                .entry(topic.clone())
                .or_insert_with(|| AbilityState::prior(topic, engine.initial_theta));
            entry.mastered = true;
        }
    }

    let mut unlocked_topics = Vec::new();
    let mut newly_mastered = Vec::new();
    for topic in bank.graph().canonical_order() {
        let was = before.get(topic).copied().unwrap_or(TopicStatus::Locked);
        let now = after.get(topic).copied().unwrap_or(TopicStatus::Locked);
        if was == TopicStatus::Locked && now != TopicStatus::Locked {
            unlocked_topics.push(topic.to_string());
        }
        if was != TopicStatus::Mastered && now == TopicStatus::Mastered {
            newly_mastered.push(topic.to_string());
        }
    }

    let previous_status = before
        .get(&item.topic)
        .copied()
        .unwrap_or(TopicStatus::Locked);
    let new_status = after
        .get(&item.topic)
        .copied()
        .unwrap_or(TopicStatus::Locked);

    let update = UpdateResult {
        question_name: item.name.clone(),
        topic: item.topic.clone(),
        passed,
        theta_before,
        theta_after,
        previous_status,
        new_status,
        progress_percent: topic_progress_percent(bank, &next, &after, &item.topic, engine),
        unlocked_topics,
        newly_mastered,
    };

    Ok(Transition { state: next, update })
}

#[cfg(test)]
mod tests {
    use super::*;

    const TS: &str = "2024-01-01T00:00:00Z";

    fn bank() -> ItemBank {
        ItemBank::from_json_str(
            r#"{
                "topics": [
                    {"name": "A"},
                    {"name": "B", "prerequisites": ["A"]},
                    {"name": "C", "prerequisites": ["B"]}
                ],
                "items": [
                    {"name": "a1", "topic": "A", "difficulty": 0.0, "discrimination": 1.0},
                    {"name": "b1", "topic": "B", "difficulty": 0.0, "discrimination": 1.0},
                    {"name": "c1", "topic": "C", "difficulty": 0.0, "discrimination": 1.0}
                ]
            }"#,
            &EngineConfig::default(),
        )
        .unwrap()
    }

    fn with_theta(state: &mut UserState, topic: &str, theta: f64, attempts: u32) {
        let mut ability = AbilityState::prior(topic, 0.0);
        ability.theta = theta;
        ability.attempt_count = attempts;
        state.abilities.insert(topic.to_string(), ability);
    }

    mod status_tests {
        use super::*;

        #[test]
        fn fresh_user_has_only_roots_open() {
            let engine = EngineConfig::default();
            let statuses = derive_statuses(&bank(), &UserState::new("u", 0), &engine);
            assert_eq!(statuses["A"], TopicStatus::Opened);
            assert_eq!(statuses["B"], TopicStatus::Locked);
            assert_eq!(statuses["C"], TopicStatus::Locked);
        }

        #[test]
        fn dependent_locked_regardless_of_own_theta() {
            let engine = EngineConfig::default();
            let mut state = UserState::new("u", 0);
            with_theta(&mut state, "A", 0.5, 10);
            with_theta(&mut state, "B", 3.5, 10);
            let statuses = derive_statuses(&bank(), &state, &engine);
            assert_eq!(statuses["A"], TopicStatus::Opened);
            assert_eq!(statuses["B"], TopicStatus::Locked);
        }

        #[test]
        fn mastery_needs_threshold_and_attempts() {
            let engine = EngineConfig::default();
            let mut state = UserState::new("u", 0);
            with_theta(&mut state, "A", 1.3, 2);
            assert_eq!(derive_statuses(&bank(), &state, &engine)["A"], TopicStatus::Opened);
            with_theta(&mut state, "A", 1.3, 3);
            let statuses = derive_statuses(&bank(), &state, &engine);
            assert_eq!(statuses["A"], TopicStatus::Mastered);
            assert_eq!(statuses["B"], TopicStatus::Opened);
        }

        #[test]
        fn latch_keeps_mastery_below_threshold() {
            let engine = EngineConfig::default();
            let mut state = UserState::new("u", 0);
            with_theta(&mut state, "A", -1.0, 9);
            state.abilities.get_mut("A").unwrap().mastered = true;
            assert_eq!(derive_statuses(&bank(), &state, &engine)["A"], TopicStatus::Mastered);
        }
    }

    mod progress_tests {
        use super::*;

        #[test]
        fn linear_between_prior_and_threshold() {
            assert_eq!(progress_percent(0.0, TopicStatus::Opened, 1.2, 0.0), 0.0);
            assert!((progress_percent(0.6, TopicStatus::Opened, 1.2, 0.0) - 50.0).abs() < 1e-9);
        }

        #[test]
        fn clamped_to_range() {
            assert_eq!(progress_percent(-2.0, TopicStatus::Opened, 1.2, 0.0), 0.0);
            assert_eq!(progress_percent(3.0, TopicStatus::Opened, 1.2, 0.0), 99.0);
            assert_eq!(progress_percent(3.0, TopicStatus::Locked, 1.2, 0.0), 99.0);
        }

        #[test]
        fn mastered_is_always_full() {
            assert_eq!(progress_percent(-3.0, TopicStatus::Mastered, 1.2, 0.0), 100.0);
        }

        #[test]
        fn monotonic_in_theta() {
            let mut last = -1.0;
            for i in -10..=20 {
                let p = progress_percent(i as f64 * 0.1, TopicStatus::Opened, 1.2, 0.0);
                assert!(p >= last);
                last = p;
            }
        }

        #[test]
        fn topic_progress_lists_canonical_order() {
            let engine = EngineConfig::default();
            let report = topic_progress(&bank(), &UserState::new("u", 0), &engine);
            let names: Vec<&str> = report.iter().map(|t| t.topic.as_str()).collect();
            assert_eq!(names, vec!["A", "B", "C"]);
            assert_eq!(report[2].level, 2);
            assert_eq!(report[1].prerequisites, vec!["A".to_string()]);
        }
    }

    mod transition_tests {
        use super::*;

        #[test]
        fn pass_updates_theta_and_counters() {
            let engine = EngineConfig::default();
            let bank = bank();
            let state = UserState::new("u", 0);
            let item = bank.item("a1").unwrap();
            let t = apply_attempt(&bank, &state, item, true, &engine, TS).unwrap();

            assert_eq!(t.update.theta_before, 0.0);
            assert!((t.update.theta_after - 0.15).abs() < 1e-12);
            let a = &t.state.abilities["A"];
            assert_eq!(a.attempt_count, 1);
            assert_eq!(a.correct_count, 1);
            assert_eq!(a.updated_at.as_deref(), Some(TS));
            // Original state untouched.
            assert!(state.abilities.is_empty());
        }

        #[test]
        fn mastering_prerequisite_unlocks_dependent() {
            let engine = EngineConfig::default();
            let bank = bank();
            let mut state = UserState::new("u", 0);
            with_theta(&mut state, "A", 1.19, 5);
            let item = bank.item("a1").unwrap();
            let t = apply_attempt(&bank, &state, item, true, &engine, TS).unwrap();

            assert_eq!(t.update.previous_status, TopicStatus::Opened);
            assert_eq!(t.update.new_status, TopicStatus::Mastered);
            assert_eq!(t.update.unlocked_topics, vec!["B".to_string()]);
            assert_eq!(t.update.newly_mastered, vec!["A".to_string()]);
            assert_eq!(t.update.progress_percent, 100.0);
            assert!(t.state.abilities["A"].mastered);
        }

        #[test]
        fn cascade_masters_dependent_already_above_threshold() {
            let engine = EngineConfig::default();
            let bank = bank();
            let mut state = UserState::new("u", 0);
            with_theta(&mut state, "A", 1.19, 5);
            with_theta(&mut state, "B", 2.0, 4);
            let t = apply_attempt(&bank, &state, bank.item("a1").unwrap(), true, &engine, TS)
                .unwrap();
            assert_eq!(
                t.update.newly_mastered,
                vec!["A".to_string(), "B".to_string()]
            );
            assert_eq!(
                t.update.unlocked_topics,
                vec!["B".to_string(), "C".to_string()]
            );
            assert!(t.state.abilities["B"].mastered);
        }

        #[test]
        fn failures_never_revert_mastery() {
            let engine = EngineConfig::default();
            let bank = bank();
            let mut state = UserState::new("u", 0);
            with_theta(&mut state, "A", 1.19, 5);
            let item = bank.item("a1").unwrap();
            state = apply_attempt(&bank, &state, item, true, &engine, TS).unwrap().state;

            for _ in 0..30 {
                let t = apply_attempt(&bank, &state, item, false, &engine, TS).unwrap();
                assert_eq!(t.update.new_status, TopicStatus::Mastered);
                assert_eq!(t.update.progress_percent, 100.0);
                state = t.state;
            }
            assert!(state.abilities["A"].theta < 1.2);
            assert_eq!(derive_statuses(&bank, &state, &engine)["B"], TopicStatus::Opened);
        }

        #[test]
        fn attempt_on_locked_topic_moves_theta_but_stays_locked() {
            let engine = EngineConfig::default();
            let bank = bank();
            let state = UserState::new("u", 0);
            let t = apply_attempt(&bank, &state, bank.item("c1").unwrap(), true, &engine, TS)
                .unwrap();
            assert_eq!(t.update.new_status, TopicStatus::Locked);
            assert!(t.update.theta_after > 0.0);
            assert!(!t.state.abilities["C"].mastered);
        }
    }
}
