//! Adaptive practice engine.
//!
//! Models a learner's ability per topic with a 2PL item response model,
//! serves the most informative question from the item bank, and tracks
//! mastery over a prerequisite graph of topics.

pub mod ability;
pub mod bank;
pub mod config;
pub mod engine;
pub mod error;
pub mod grading;
pub mod graph;
pub mod irt;
pub mod models;
pub mod recorder;
pub mod selector;
pub mod store;

pub use bank::ItemBank;
pub use config::{EngineConfig, TutorConfig};
pub use engine::Tutor;
pub use error::{Result, TutorError};
pub use selector::SelectionMode;
pub use store::{Database, Store};
