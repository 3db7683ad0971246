//! The tutor engine: the API the surrounding application calls.
//!
//! State is fetched from the store at the start of each call and committed
//! at the end; nothing about a user is cached between calls. Attempts for
//! one user are serialized by a per-user lock, which is only held around
//! the read-update-commit step. Grading runs outside of it. A user's lock
//! is dropped from the registry once nobody holds or waits on it.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::ability;
use crate::bank::ItemBank;
use crate::config::EngineConfig;
use crate::error::{Result, TutorError};
use crate::grading::{GradeReport, Grader};
use crate::models::{
    AttemptFeedback, InteractionRecord, OverallSummary, ProgressReport, SelectionResult,
    TopicStatus, UpdateResult, UserState,
};
use crate::recorder::{self, HistorySummary, ReplayReport};
use crate::selector::{self, Explanation, Recommendation, SelectionMode};
use crate::store::Store;

/// Attempts considered by "recent performance".
pub const RECENT_PERFORMANCE_WINDOW: usize = 10;

pub struct Tutor<S: Store> {
    bank: ItemBank,
    config: EngineConfig,
    store: Mutex<S>,
    user_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

/// A consistent view of one user: state and the records of its epoch.
struct Snapshot {
    state: UserState,
    records: Vec<InteractionRecord>,
}

fn check_user_id(user_id: &str) -> Result<()> {
    if user_id.trim().is_empty() {
        return Err(TutorError::invalid("user id must not be empty"));
    }
    Ok(())
}

impl<S: Store> Tutor<S> {
    pub fn new(bank: ItemBank, config: EngineConfig, store: S) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            bank,
            config,
            store: Mutex::new(store),
            user_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn bank(&self) -> &ItemBank {
        &self.bank
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // Store calls are transactional, so a poisoned guard holds no partial write.
    fn store(&self) -> MutexGuard<'_, S> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn user_lock(&self, user_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.user_locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn release_user_lock(&self, user_id: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.user_locks.lock().unwrap_or_else(PoisonError::into_inner);
        // Clones are only taken under `user_locks`, so the count cannot grow here.
        // Two references left means the registry's and ours.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(user_id);
        }
    }

    /// Run `f` holding the lock of `user_id`.
    fn with_user_lock<T>(&self, user_id: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let lock = self.user_lock(user_id);
        let result = {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            f()
        };
        self.release_user_lock(user_id, lock);
        result
    }

    fn snapshot(&self, user_id: &str) -> Result<Snapshot> {
        let store = self.store();
        let state = store.load_user_state(user_id)?;
        let records = store
            .load_interactions(user_id)?
            .into_iter()
            .filter(|r| r.epoch == state.epoch)
            .collect();
        Ok(Snapshot { state, records })
    }

    fn recent_items(&self, records: &[InteractionRecord]) -> HashSet<String> {
        recorder::recent_item_names(records, self.config.recency_window)
    }

    pub fn select_next(&self, user_id: &str) -> Result<SelectionResult> {
        self.select_with(user_id, &SelectionMode::Default)
    }

    pub fn select_with(&self, user_id: &str, mode: &SelectionMode) -> Result<SelectionResult> {
        check_user_id(user_id)?;
        let snapshot = self.snapshot(user_id)?;
        let recent = self.recent_items(&snapshot.records);
        let result = selector::select(&self.bank, &self.config, &snapshot.state, &recent, mode)?;
        debug!(
            user = user_id,
            question = %result.item.name,
            topic = %result.topic,
            theta = result.theta,
            information = result.information,
            fallback = result.is_fallback,
            "question selected"
        );
        Ok(result)
    }

    pub fn record_attempt(
        &self,
        user_id: &str,
        question_name: &str,
        passed: bool,
        test_pass_rate: f64,
    ) -> Result<UpdateResult> {
        self.record_attempt_with_feedback(
            user_id,
            question_name,
            passed,
            test_pass_rate,
            &AttemptFeedback::default(),
        )
    }

    /// Apply a graded attempt: update ability, then append the record, both
    /// in one commit.
    pub fn record_attempt_with_feedback(
        &self,
        user_id: &str,
        question_name: &str,
        passed: bool,
        test_pass_rate: f64,
        feedback: &AttemptFeedback,
    ) -> Result<UpdateResult> {
        check_user_id(user_id)?;
        recorder::validate_pass_rate(test_pass_rate)?;
        feedback.validate()?;
        let item = self.bank.require_item(question_name)?;

        let (update, id) = self.with_user_lock(user_id, || {
            let state = self.store().load_user_state(user_id)?;
            let timestamp = Utc::now().to_rfc3339();
            let transition =
                ability::apply_attempt(&self.bank, &state, item, passed, &self.config, &timestamp)?;
            let record = recorder::build_record(
                user_id,
                state.epoch,
                &transition.update,
                test_pass_rate,
                feedback,
                &timestamp,
            )?;
            let id = self.store().commit_attempt(&transition.state, &record)?;
            Ok((transition.update, id))
        })?;

        info!(
            user = user_id,
            question = question_name,
            passed,
            theta_before = update.theta_before,
            theta_after = update.theta_after,
            status = update.new_status.as_str(),
            record = id,
            "attempt recorded"
        );
        if !update.unlocked_topics.is_empty() {
            info!(user = user_id, topics = ?update.unlocked_topics, "topics unlocked");
        }
        Ok(update)
    }

    /// Grade `code` with `grader` and record the outcome.
    ///
    /// No lock is held while the grader runs.
    pub fn submit(
        &self,
        user_id: &str,
        question_name: &str,
        code: &str,
        grader: &dyn Grader,
        feedback: &AttemptFeedback,
    ) -> Result<(GradeReport, UpdateResult)> {
        check_user_id(user_id)?;
        let item = self.bank.require_item(question_name)?;
        let report = grader.grade(item, code);
        if let Some(error) = &report.error {
            debug!(user = user_id, question = question_name, error = %error, "submission raised");
        }
        let update = self.record_attempt_with_feedback(
            user_id,
            question_name,
            report.passed,
            report.pass_rate(),
            feedback,
        )?;
        Ok((report, update))
    }

    pub fn get_progress(&self, user_id: &str) -> Result<ProgressReport> {
        check_user_id(user_id)?;
        let snapshot = self.snapshot(user_id)?;
        let topics = ability::topic_progress(&self.bank, &snapshot.state, &self.config);
        let statuses = ability::derive_statuses(&self.bank, &snapshot.state, &self.config);

        let count = |status: TopicStatus| topics.iter().filter(|t| t.status == status).count();
        let total_topics = topics.len();
        let mastered = count(TopicStatus::Mastered);
        let overall_progress_percent = if total_topics == 0 {
            0.0
        } else {
            mastered as f64 / total_topics as f64 * 100.0
        };

        let overall = OverallSummary {
            total_topics,
            mastered,
            opened: count(TopicStatus::Opened),
            locked: count(TopicStatus::Locked),
            overall_progress_percent,
            total_attempts: snapshot.records.len(),
            current_focus: selector::focus_topic(
                &self.bank,
                &snapshot.state,
                &statuses,
                &self.config,
            ),
            recent: recorder::recent_performance(&snapshot.records, RECENT_PERFORMANCE_WINDOW),
        };

        Ok(ProgressReport {
            user_id: user_id.to_string(),
            topics,
            overall,
        })
    }

    /// Records of every epoch, newest first, at most `limit`.
    pub fn history(&self, user_id: &str, limit: Option<usize>) -> Result<Vec<InteractionRecord>> {
        check_user_id(user_id)?;
        let records = self.store().load_interactions(user_id)?;
        Ok(records
            .into_iter()
            .rev()
            .take(limit.unwrap_or(usize::MAX))
            .collect())
    }

    /// Statistics over the current epoch.
    pub fn history_summary(&self, user_id: &str) -> Result<HistorySummary> {
        check_user_id(user_id)?;
        let snapshot = self.snapshot(user_id)?;
        Ok(recorder::summarize(
            &self.bank,
            &snapshot.records,
            RECENT_PERFORMANCE_WINDOW,
        ))
    }

    pub fn recommend(&self, user_id: &str, topic: &str, n: usize) -> Result<Vec<Recommendation>> {
        check_user_id(user_id)?;
        let snapshot = self.snapshot(user_id)?;
        let recent = self.recent_items(&snapshot.records);
        selector::recommend(&self.bank, &self.config, &snapshot.state, &recent, topic, n)
    }

    pub fn explain(&self, user_id: &str, question_name: &str) -> Result<Explanation> {
        check_user_id(user_id)?;
        let snapshot = self.snapshot(user_id)?;
        selector::explain(&self.bank, &self.config, &snapshot.state, question_name)
    }

    /// Start over: new epoch, abilities back at the prior. History is kept.
    pub fn reset_user(&self, user_id: &str) -> Result<UserState> {
        check_user_id(user_id)?;
        let state = self.with_user_lock(user_id, || {
            self.store().reset_user(user_id, self.config.initial_theta)
        })?;
        info!(user = user_id, epoch = state.epoch, "user reset");
        Ok(state)
    }

    /// Replay the current epoch's log and compare it with stored state.
    pub fn verify_history(&self, user_id: &str) -> Result<ReplayReport> {
        check_user_id(user_id)?;
        let report = self.with_user_lock(user_id, || {
            let snapshot = self.snapshot(user_id)?;
            recorder::replay(&self.bank, &self.config, &snapshot.state, &snapshot.records)
        })?;
        if !report.is_consistent() {
            warn!(
                user = user_id,
                mismatches = report.mismatches.len(),
                matches_stored = report.matches_stored,
                "history does not replay to stored state"
            );
        }
        Ok(report)
    }

    pub fn list_users(&self) -> Result<Vec<String>> {
        self.store().list_users()
    }
}
