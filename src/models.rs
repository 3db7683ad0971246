use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TutorError};

/// Tolerance used when comparing floating point test outputs.
pub const FLOAT_TOLERANCE: f64 = 1e-9;

// A question in the item bank. Immutable once the bank is loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    pub name: String,
    pub topic: String,
    /// IRT difficulty `b`.
    pub difficulty: f64,
    /// IRT discrimination `a`, strictly positive.
    pub discrimination: f64,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tests: Vec<TestCase>,
    #[serde(default)]
    pub hidden_tests: Vec<TestCase>,
    #[serde(default)]
    pub init_code: Option<String>,
    /// Whether output order is irrelevant when grading.
    #[serde(default)]
    pub unordered: bool,
}

impl Item {
    pub fn visible_test_count(&self) -> usize {
        self.tests.len()
    }

    pub fn hidden_test_count(&self) -> usize {
        self.hidden_tests.len()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub input: TestValue,
    pub output: TestValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Scalar {
    fn as_number(&self) -> Option<f64> {
        match self {
            Scalar::Int(i) => Some(*i as f64),
            Scalar::Float(f) => Some(*f),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Scalar::Null => 0,
            Scalar::Bool(_) => 1,
            Scalar::Int(_) | Scalar::Float(_) => 2,
            Scalar::Text(_) => 3,
        }
    }

    fn matches(&self, other: &Scalar) -> bool {
        match (self, other) {
            (Scalar::Null, Scalar::Null) => true,
            (Scalar::Bool(a), Scalar::Bool(b)) => a == b,
            (Scalar::Int(a), Scalar::Int(b)) => a == b,
            (Scalar::Text(a), Scalar::Text(b)) => a == b,
            _ => match (self.as_number(), other.as_number()) {
                (Some(a), Some(b)) => (a - b).abs() < FLOAT_TOLERANCE,
                _ => false,
            },
        }
    }

    fn canonical_cmp(&self, other: &Scalar) -> Ordering {
        match (self, other) {
            (Scalar::Bool(a), Scalar::Bool(b)) => a.cmp(b),
            (Scalar::Text(a), Scalar::Text(b)) => a.cmp(b),
            _ => match (self.as_number(), other.as_number()) {
                (Some(a), Some(b)) => a.total_cmp(&b),
                _ => self.rank().cmp(&other.rank()),
            },
        }
    }
}

/// A test input or expected output.
///
/// Question payloads mix scalars, arrays and objects; this is the closed set
/// of shapes the engine accepts from a bank file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TestValue {
    Scalar(Scalar),
    Sequence(Vec<TestValue>),
    Mapping(BTreeMap<String, TestValue>),
}

impl TestValue {
    /// Compare an expected value against an actual one.
    ///
    /// With `unordered`, sequences are compared as multisets, with nested
    /// sequences normalised first.
    pub fn matches(&self, actual: &TestValue, unordered: bool) -> bool {
        match (self, actual) {
            (TestValue::Scalar(a), TestValue::Scalar(b)) => a.matches(b),
            (TestValue::Sequence(a), TestValue::Sequence(b)) => {
                if a.len() != b.len() {
                    return false;
                }
                if unordered {
                    let a = TestValue::Sequence(a.clone()).canonical();
                    let b = TestValue::Sequence(b.clone()).canonical();
                    a.matches(&b, false)
                } else {
                    a.iter().zip(b.iter()).all(|(x, y)| x.matches(y, false))
                }
            }
            (TestValue::Mapping(a), TestValue::Mapping(b)) => {
                a.len() == b.len()
                    && a.iter().all(|(k, v)| {
                        b.get(k)
                            .map(|other| v.matches(other, unordered))
                            .unwrap_or(false)
                    })
            }
            _ => false,
        }
    }

    fn canonical(self) -> TestValue {
        match self {
            TestValue::Sequence(items) => {
                let mut items: Vec<TestValue> =
                    items.into_iter().map(TestValue::canonical).collect();
                items.sort_by(TestValue::canonical_cmp);
                TestValue::Sequence(items)
            }
            TestValue::Mapping(map) => TestValue::Mapping(
                map.into_iter().map(|(k, v)| (k, v.canonical())).collect(),
            ),
            scalar => scalar,
        }
    }

    fn canonical_cmp(&self, other: &TestValue) -> Ordering {
        match (self, other) {
            (TestValue::Scalar(a), TestValue::Scalar(b)) => a.canonical_cmp(b),
            (TestValue::Sequence(a), TestValue::Sequence(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    let ord = x.canonical_cmp(y);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            (TestValue::Mapping(a), TestValue::Mapping(b)) => a.len().cmp(&b.len()),
            (TestValue::Scalar(_), _) => Ordering::Less,
            (_, TestValue::Scalar(_)) => Ordering::Greater,
            (TestValue::Sequence(_), TestValue::Mapping(_)) => Ordering::Less,
            (TestValue::Mapping(_), TestValue::Sequence(_)) => Ordering::Greater,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopicStatus {
    Locked,
    Opened,
    Mastered,
}

impl TopicStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TopicStatus::Locked => "locked",
            TopicStatus::Opened => "opened",
            TopicStatus::Mastered => "mastered",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            TopicStatus::Locked => "Locked",
            TopicStatus::Opened => "Opened",
            TopicStatus::Mastered => "Mastered",
        }
    }
}

// Latent ability for one (user, topic) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbilityState {
    pub topic: String,
    pub theta: f64,
    pub attempt_count: u32,
    pub correct_count: u32,
    /// Set the first time the topic is derived as mastered; never cleared
    /// except by a user reset.
    pub mastered: bool,
    pub updated_at: Option<String>,
}

impl AbilityState {
    pub fn prior(topic: &str, initial_theta: f64) -> Self {
        Self {
            topic: topic.to_string(),
            theta: initial_theta,
            attempt_count: 0,
            correct_count: 0,
            mastered: false,
            updated_at: None,
        }
    }
}

// All ability states of a user within the current reset epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserState {
    pub user_id: String,
    pub epoch: u32,
    pub abilities: BTreeMap<String, AbilityState>,
}

impl UserState {
    pub fn new(user_id: &str, epoch: u32) -> Self {
        Self {
            user_id: user_id.to_string(),
            epoch,
            abilities: BTreeMap::new(),
        }
    }

    /// The stored state for `topic`, or the prior if never attempted.
    pub fn ability(&self, topic: &str, initial_theta: f64) -> AbilityState {
        self.abilities
            .get(topic)
            .cloned()
            .unwrap_or_else(|| AbilityState::prior(topic, initial_theta))
    }

    pub fn theta(&self, topic: &str, initial_theta: f64) -> f64 {
        self.abilities
            .get(topic)
            .map(|a| a.theta)
            .unwrap_or(initial_theta)
    }

    pub fn total_attempts(&self) -> u32 {
        self.abilities.values().map(|a| a.attempt_count).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DifficultyRating {
    Easy,
    Medium,
    Hard,
}

impl DifficultyRating {
    pub fn as_str(&self) -> &'static str {
        match self {
            DifficultyRating::Easy => "easy",
            DifficultyRating::Medium => "medium",
            DifficultyRating::Hard => "hard",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "easy" | "e" | "1" => Some(DifficultyRating::Easy),
            "medium" | "m" | "ok" | "2" => Some(DifficultyRating::Medium),
            "hard" | "h" | "3" => Some(DifficultyRating::Hard),
            _ => None,
        }
    }
}

/// Optional self-report attached to an attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttemptFeedback {
    pub difficulty_rating: Option<DifficultyRating>,
    /// 1 (guessing) to 5 (certain).
    pub confidence_level: Option<u8>,
    pub notes: Option<String>,
}

impl AttemptFeedback {
    pub fn validate(&self) -> Result<()> {
        if let Some(level) = self.confidence_level {
            if !(1..=5).contains(&level) {
                return Err(TutorError::invalid(format!(
                    "confidence level must be between 1 and 5, got {level}"
                )));
            }
        }
        Ok(())
    }
}

// One submitted attempt. Append-only; never updated or deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionRecord {
    pub id: Option<i64>,
    pub user_id: String,
    pub epoch: u32,
    pub question_name: String,
    pub topic: String,
    pub theta_before: f64,
    pub theta_after: f64,
    pub passed: bool,
    /// Percentage of tests passed, 0 to 100.
    pub test_pass_rate: f64,
    pub timestamp: String,
    pub difficulty_rating: Option<DifficultyRating>,
    pub confidence_level: Option<u8>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionResult {
    pub item: Item,
    pub topic: String,
    /// Ability the decision was made at.
    pub theta: f64,
    pub probability_correct: f64,
    pub information: f64,
    pub reason: String,
    /// The recency filter left nothing and was ignored.
    pub is_fallback: bool,
    /// Picked by the exploration policy rather than maximum information.
    pub is_exploration: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateResult {
    pub question_name: String,
    pub topic: String,
    pub passed: bool,
    pub theta_before: f64,
    pub theta_after: f64,
    pub previous_status: TopicStatus,
    pub new_status: TopicStatus,
    pub progress_percent: f64,
    /// Topics that went from locked to opened or mastered.
    pub unlocked_topics: Vec<String>,
    pub newly_mastered: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicProgress {
    pub topic: String,
    pub theta: f64,
    pub status: TopicStatus,
    pub progress_percent: f64,
    pub attempt_count: u32,
    pub correct_count: u32,
    pub mastery_threshold: f64,
    pub level: usize,
    pub prerequisites: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecentPerformance {
    pub attempts: usize,
    pub correct: usize,
    pub accuracy: f64,
    pub mean_test_pass_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverallSummary {
    pub total_topics: usize,
    pub mastered: usize,
    pub opened: usize,
    pub locked: usize,
    pub overall_progress_percent: f64,
    pub total_attempts: usize,
    pub current_focus: Option<String>,
    pub recent: RecentPerformance,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressReport {
    pub user_id: String,
    pub topics: Vec<TopicProgress>,
    pub overall: OverallSummary,
}

impl ProgressReport {
    pub fn topic(&self, name: &str) -> Option<&TopicProgress> {
        self.topics.iter().find(|t| t.topic == name)
    }
}

// JSON output wrapper for CLI
#[derive(Debug, Serialize)]
pub struct JsonOutput<T: Serialize> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T: Serialize> JsonOutput<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}
