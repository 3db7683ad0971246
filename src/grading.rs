//! Grading seam: the core never executes code, it only consumes reports.

use serde::{Deserialize, Serialize};

use crate::models::{Item, TestCase, TestValue};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestOutcome {
    pub input: TestValue,
    pub expected: TestValue,
    pub actual: Option<TestValue>,
    pub passed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeReport {
    pub passed: bool,
    pub results: Vec<TestOutcome>,
    pub error: Option<String>,
}

impl GradeReport {
    /// Compare produced outputs against `tests` in order.
    ///
    /// A missing output counts as a failed test. A report with a runtime
    /// error or without any test is never passed.
    pub fn from_outputs(
        tests: &[TestCase],
        outputs: &[TestValue],
        unordered: bool,
        error: Option<String>,
    ) -> Self {
        let results: Vec<TestOutcome> = tests
            .iter()
            .enumerate()
            .map(|(i, test)| {
                let actual = outputs.get(i).cloned();
                let passed = actual
                    .as_ref()
                    .map(|a| test.output.matches(a, unordered))
                    .unwrap_or(false);
                TestOutcome {
                    input: test.input.clone(),
                    expected: test.output.clone(),
                    actual,
                    passed,
                }
            })
            .collect();
        let passed = error.is_none() && !results.is_empty() && results.iter().all(|r| r.passed);
        Self {
            passed,
            results,
            error,
        }
    }

    pub fn failed_with(error: impl Into<String>) -> Self {
        Self {
            passed: false,
            results: Vec::new(),
            error: Some(error.into()),
        }
    }

    pub fn passed_count(&self) -> usize {
        self.results.iter().filter(|r| r.passed).count()
    }

    /// Percentage of passed tests, 0 when there are none.
    pub fn pass_rate(&self) -> f64 {
        if self.results.is_empty() {
            0.0
        } else {
            self.passed_count() as f64 / self.results.len() as f64 * 100.0
        }
    }
}

/// Runs a submission against an item's tests.
///
/// Implementations may be slow (sandboxes, remote runners); the engine calls
/// them without holding any user lock.
pub trait Grader: Send + Sync {
    fn grade(&self, item: &Item, code: &str) -> GradeReport;
}
