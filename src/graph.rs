//! Prerequisite DAG over topics.

use std::collections::{BTreeSet, HashMap};

use crate::error::{Result, TutorError};

#[derive(Debug, Clone)]
pub struct PrerequisiteGraph {
    /// Declaration order.
    topics: Vec<String>,
    index: HashMap<String, usize>,
    prerequisites: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
    /// Canonical (topological) order as indices into `topics`.
    order: Vec<usize>,
    rank: Vec<usize>,
    levels: Vec<usize>,
}

impl PrerequisiteGraph {
    /// Build the graph from `(topic, prerequisites)` pairs in declaration
    /// order. Fails on duplicates, unknown or self prerequisites, and cycles.
    pub fn new(topics: &[(String, Vec<String>)]) -> Result<Self> {
        let mut index = HashMap::new();
        for (i, (name, _)) in topics.iter().enumerate() {
            if name.trim().is_empty() {
                return Err(TutorError::config("topic name must not be empty"));
            }
            if index.insert(name.clone(), i).is_some() {
                return Err(TutorError::config(format!("duplicate topic '{name}'")));
            }
        }

        let n = topics.len();
        let mut prerequisites = vec![Vec::new(); n];
        let mut dependents = vec![Vec::new(); n];
        for (i, (name, prereqs)) in topics.iter().enumerate() {
            for prereq in prereqs {
                let j = *index.get(prereq).ok_or_else(|| {
                    TutorError::config(format!(
                        "topic '{name}' requires unknown topic '{prereq}'"
                    ))
                })?;
                if i == j {
                    return Err(TutorError::config(format!(
                        "topic '{name}' lists itself as a prerequisite"
                    )));
                }
                if !prerequisites[i].contains(&j) {
                    prerequisites[i].push(j);
                    dependents[j].push(i);
                }
            }
        }

        // Kahn's algorithm; among ready topics the earliest declared wins.
        let mut in_degree: Vec<usize> = prerequisites.iter().map(Vec::len).collect();
        let mut ready: BTreeSet<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);
        while let Some(next) = ready.pop_first() {
            order.push(next);
            for &dep in &dependents[next] {
                in_degree[dep] -= 1;
                if in_degree[dep] == 0 {
                    ready.insert(dep);
                }
            }
        }
        if order.len() < n {
            let stuck: Vec<&str> = (0..n)
                .filter(|&i| in_degree[i] > 0)
                .map(|i| topics[i].0.as_str())
                .collect();
            return Err(TutorError::config(format!(
                "prerequisite cycle among topics: {}",
                stuck.join(", ")
            )));
        }

        let mut rank = vec![0; n];
        for (position, &i) in order.iter().enumerate() {
            rank[i] = position;
        }

        let mut levels = vec![0; n];
        for &i in &order {
            levels[i] = prerequisites[i]
                .iter()
                .map(|&p| levels[p] + 1)
                .max()
                .unwrap_or(0);
        }

        Ok(Self {
            topics: topics.iter().map(|(name, _)| name.clone()).collect(),
            index,
            prerequisites,
            dependents,
            order,
            rank,
            levels,
        })
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.index.contains_key(topic)
    }

    /// Topics in canonical order: every topic after all of its prerequisites.
    pub fn canonical_order(&self) -> Vec<&str> {
        self.order.iter().map(|&i| self.topics[i].as_str()).collect()
    }

    /// Position of `topic` in the canonical order.
    pub fn rank(&self, topic: &str) -> Option<usize> {
        self.index.get(topic).map(|&i| self.rank[i])
    }

    pub fn prerequisites(&self, topic: &str) -> Vec<&str> {
        self.names(topic, &self.prerequisites)
    }

    pub fn dependents(&self, topic: &str) -> Vec<&str> {
        self.names(topic, &self.dependents)
    }

    /// All direct and indirect prerequisites, in canonical order.
    pub fn transitive_prerequisites(&self, topic: &str) -> Vec<&str> {
        let Some(&start) = self.index.get(topic) else {
            return Vec::new();
        };
        let mut seen = vec![false; self.topics.len()];
        let mut stack = self.prerequisites[start].clone();
        while let Some(i) = stack.pop() {
            if !seen[i] {
                seen[i] = true;
                stack.extend(self.prerequisites[i].iter().copied());
            }
        }
        self.order
            .iter()
            .filter(|&&i| seen[i])
            .map(|&i| self.topics[i].as_str())
            .collect()
    }

    /// Depth in the DAG: 0 for topics without prerequisites.
    pub fn level(&self, topic: &str) -> Option<usize> {
        self.index.get(topic).map(|&i| self.levels[i])
    }

    fn names(&self, topic: &str, edges: &[Vec<usize>]) -> Vec<&str> {
        self.index
            .get(topic)
            .map(|&i| edges[i].iter().map(|&j| self.topics[j].as_str()).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topics(defs: &[(&str, &[&str])]) -> Vec<(String, Vec<String>)> {
        defs.iter()
            .map(|(name, prereqs)| {
                (
                    name.to_string(),
                    prereqs.iter().map(|p| p.to_string()).collect(),
                )
            })
            .collect()
    }

    fn recursion_graph() -> PrerequisiteGraph {
        PrerequisiteGraph::new(&topics(&[
            ("Recursion Basics", &[]),
            ("Backtracking", &["Recursion Basics"]),
            ("Dynamic Programming", &["Recursion Basics", "Backtracking"]),
        ]))
        .unwrap()
    }

    mod construction_tests {
        use super::*;

        #[test]
        fn accepts_empty_graph() {
            let graph = PrerequisiteGraph::new(&[]).unwrap();
            assert!(graph.canonical_order().is_empty());
            assert!(!graph.contains("a"));
        }

        #[test]
        fn rejects_duplicate_topic() {
            let result = PrerequisiteGraph::new(&topics(&[("a", &[]), ("a", &[])]));
            assert!(matches!(result, Err(TutorError::Config(_))));
        }

        #[test]
        fn rejects_unknown_prerequisite() {
            let result = PrerequisiteGraph::new(&topics(&[("a", &["missing"])]));
            assert!(matches!(result, Err(TutorError::Config(msg)) if msg.contains("missing")));
        }

        #[test]
        fn rejects_self_prerequisite() {
            let result = PrerequisiteGraph::new(&topics(&[("a", &["a"])]));
            assert!(matches!(result, Err(TutorError::Config(_))));
        }

        #[test]
        fn rejects_cycle() {
            let result = PrerequisiteGraph::new(&topics(&[
                ("a", &["c"]),
                ("b", &["a"]),
                ("c", &["b"]),
                ("d", &[]),
            ]));
            match result {
                Err(TutorError::Config(msg)) => {
                    assert!(msg.contains("cycle"));
                    assert!(!msg.contains('d'));
                }
                other => panic!("expected cycle error, got {other:?}"),
            }
        }

        #[test]
        fn duplicate_prerequisite_entries_collapse() {
            let graph =
                PrerequisiteGraph::new(&topics(&[("a", &[]), ("b", &["a", "a"])])).unwrap();
            assert_eq!(graph.prerequisites("b"), vec!["a"]);
            assert_eq!(graph.dependents("a"), vec!["b"]);
        }
    }

    mod order_tests {
        use super::*;

        #[test]
        fn canonical_order_respects_prerequisites() {
            let graph = PrerequisiteGraph::new(&topics(&[
                ("advanced", &["basics"]),
                ("basics", &[]),
                ("other", &[]),
            ]))
            .unwrap();
            assert_eq!(graph.canonical_order(), vec!["basics", "advanced", "other"]);
            assert_eq!(graph.rank("basics"), Some(0));
            assert_eq!(graph.rank("advanced"), Some(1));
            assert_eq!(graph.rank("nope"), None);
        }

        #[test]
        fn independent_topics_keep_declaration_order() {
            let graph =
                PrerequisiteGraph::new(&topics(&[("zeta", &[]), ("alpha", &[]), ("mid", &[])]))
                    .unwrap();
            assert_eq!(graph.canonical_order(), vec!["zeta", "alpha", "mid"]);
        }
    }

    mod query_tests {
        use super::*;

        #[test]
        fn levels_follow_longest_path() {
            let graph = recursion_graph();
            assert_eq!(graph.level("Recursion Basics"), Some(0));
            assert_eq!(graph.level("Backtracking"), Some(1));
            assert_eq!(graph.level("Dynamic Programming"), Some(2));
        }

        #[test]
        fn transitive_prerequisites_in_canonical_order() {
            let graph = PrerequisiteGraph::new(&topics(&[
                ("a", &[]),
                ("b", &["a"]),
                ("c", &["b"]),
                ("d", &["c"]),
            ]))
            .unwrap();
            assert_eq!(graph.transitive_prerequisites("d"), vec!["a", "b", "c"]);
            assert!(graph.transitive_prerequisites("a").is_empty());
            assert!(graph.transitive_prerequisites("unknown").is_empty());
        }

        #[test]
        fn dependents_are_direct_only() {
            let graph = recursion_graph();
            assert_eq!(
                graph.dependents("Recursion Basics"),
                vec!["Backtracking", "Dynamic Programming"]
            );
            assert_eq!(graph.dependents("Dynamic Programming"), Vec::<&str>::new());
        }
    }
}
