//! The item bank: topics, their prerequisites and the questions in each.
//!
//! Loaded once from a JSON document and validated in full before anything
//! else runs. After construction the bank is immutable.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::{Result, TutorError};
use crate::graph::PrerequisiteGraph;
use crate::models::Item;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicDef {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub prerequisites: Vec<String>,
    /// Overrides `engine.mastery_threshold` for this topic.
    #[serde(default)]
    pub mastery_threshold: Option<f64>,
    /// Overrides `engine.min_attempts_for_mastery` for this topic.
    #[serde(default)]
    pub min_attempts: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct BankFile {
    #[serde(default = "default_version")]
    version: String,
    topics: Vec<TopicDef>,
    #[serde(default)]
    items: Vec<Item>,
}

fn default_version() -> String {
    "1".to_string()
}

#[derive(Debug, Clone)]
pub struct ItemBank {
    version: String,
    topics: Vec<TopicDef>,
    items: Vec<Item>,
    graph: PrerequisiteGraph,
    topic_index: HashMap<String, usize>,
    item_index: HashMap<String, usize>,
    by_topic: HashMap<String, Vec<usize>>,
    thresholds: HashMap<String, f64>,
    min_attempts: HashMap<String, u32>,
}

impl ItemBank {
    pub fn load(path: &Path, engine: &EngineConfig) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            TutorError::config(format!("cannot read item bank {}: {e}", path.display()))
        })?;
        Self::from_json_str(&content, engine)
    }

    pub fn from_json_str(s: &str, engine: &EngineConfig) -> Result<Self> {
        let file: BankFile = serde_json::from_str(s)
            .map_err(|e| TutorError::config(format!("invalid item bank: {e}")))?;
        Self::new(file.version, file.topics, file.items, engine)
    }

    pub fn new(
        version: String,
        topics: Vec<TopicDef>,
        items: Vec<Item>,
        engine: &EngineConfig,
    ) -> Result<Self> {
        let edges: Vec<(String, Vec<String>)> = topics
            .iter()
            .map(|t| (t.name.clone(), t.prerequisites.clone()))
            .collect();
        let graph = PrerequisiteGraph::new(&edges)?;

        let mut thresholds = HashMap::new();
        let mut min_attempts = HashMap::new();
        for topic in &topics {
            let threshold = topic.mastery_threshold.unwrap_or(engine.mastery_threshold);
            engine.validate_threshold(
                threshold,
                &format!("mastery threshold of topic '{}'", topic.name),
            )?;
            thresholds.insert(topic.name.clone(), threshold);
            min_attempts.insert(
                topic.name.clone(),
                topic.min_attempts.unwrap_or(engine.min_attempts_for_mastery),
            );
        }

        let mut item_index = HashMap::new();
        let mut by_topic: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, item) in items.iter().enumerate() {
            validate_item(item, &graph)?;
            if item_index.insert(item.name.clone(), i).is_some() {
                return Err(TutorError::config(format!(
                    "duplicate item '{}'",
                    item.name
                )));
            }
            by_topic.entry(item.topic.clone()).or_default().push(i);
        }

        for topic in &topics {
            if !by_topic.contains_key(&topic.name) {
                warn!(topic = %topic.name, "topic has no items");
            }
        }

        let topic_index = topics
            .iter()
            .enumerate()
            .map(|(i, t)| (t.name.clone(), i))
            .collect();

        debug!(
            version = %version,
            topics = topics.len(),
            items = items.len(),
            "item bank loaded"
        );

        Ok(Self {
            version,
            topics,
            items,
            graph,
            topic_index,
            item_index,
            by_topic,
            thresholds,
            min_attempts,
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn graph(&self) -> &PrerequisiteGraph {
        &self.graph
    }

    /// Topic definitions in declaration order.
    pub fn topics(&self) -> &[TopicDef] {
        &self.topics
    }

    pub fn topic(&self, name: &str) -> Option<&TopicDef> {
        self.topic_index.get(name).map(|&i| &self.topics[i])
    }

    pub fn items(&self) -> &[Item] {
        &self.items
    }

    pub fn item(&self, name: &str) -> Option<&Item> {
        self.item_index.get(name).map(|&i| &self.items[i])
    }

    pub fn require_item(&self, name: &str) -> Result<&Item> {
        self.item(name)
            .ok_or_else(|| TutorError::NotFound(format!("question '{name}'")))
    }

    pub fn require_topic(&self, name: &str) -> Result<&TopicDef> {
        self.topic(name)
            .ok_or_else(|| TutorError::NotFound(format!("topic '{name}'")))
    }

    /// Items of `topic` in bank order.
    pub fn items_for_topic(&self, topic: &str) -> Vec<&Item> {
        self.by_topic
            .get(topic)
            .map(|idx| idx.iter().map(|&i| &self.items[i]).collect())
            .unwrap_or_default()
    }

    pub fn mastery_threshold(&self, topic: &str, engine: &EngineConfig) -> f64 {
        self.thresholds
            .get(topic)
            .copied()
            .unwrap_or(engine.mastery_threshold)
    }

    pub fn min_attempts(&self, topic: &str, engine: &EngineConfig) -> u32 {
        self.min_attempts
            .get(topic)
            .copied()
            .unwrap_or(engine.min_attempts_for_mastery)
    }

    /// Item names per topic, in canonical topic order.
    pub fn summary(&self) -> Vec<(String, usize)> {
        self.graph
            .canonical_order()
            .into_iter()
            .map(|t| {
                let count = self.by_topic.get(t).map(Vec::len).unwrap_or(0);
                (t.to_string(), count)
            })
            .collect()
    }
}

fn validate_item(item: &Item, graph: &PrerequisiteGraph) -> Result<()> {
    if item.name.trim().is_empty() {
        return Err(TutorError::config("item name must not be empty"));
    }
    if !graph.contains(&item.topic) {
        return Err(TutorError::config(format!(
            "item '{}' belongs to unknown topic '{}'",
            item.name, item.topic
        )));
    }
    if !item.difficulty.is_finite() {
        return Err(TutorError::config(format!(
            "item '{}' has non-finite difficulty",
            item.name
        )));
    }
    if !item.discrimination.is_finite() || item.discrimination <= 0.0 {
        return Err(TutorError::config(format!(
            "item '{}' has non-positive discrimination {}",
            item.name, item.discrimination
        )));
    }
    let mut seen = HashSet::new();
    for test in item.tests.iter().chain(item.hidden_tests.iter()) {
        // Identical test cases would be double-counted by the pass rate.
        if !seen.insert(serde_json::to_string(test).unwrap_or_default()) {
            warn!(item = %item.name, "item repeats a test case");
        }
    }
    Ok(())
}
