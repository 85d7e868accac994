pub mod config;
pub mod engine;
pub mod error;
pub mod features;
pub mod http;
pub mod ledger;
pub mod metrics;
pub mod neighbors;
pub mod scoring;
mod storage;
pub mod tuner;
pub mod weights;
pub mod worker;

pub use config::EngineConfig;
pub use engine::{ClassificationEngine, Collaborators, ExampleInput, FeedbackExample};
pub use error::{EngineError, Result};
pub use features::{status_class, FeatureExtractor, StatusClass, Vocabulary};
pub use ledger::{DecisionOutcome, FeedbackLedger, LedgerView};
pub use metrics::LearningMetrics;
pub use neighbors::{NeighborAnalysis, NeighborAnalyzer, NeighborSummary};
pub use scoring::{ScoredOutcome, ScoringEngine};
pub use tuner::AutoTuner;
pub use weights::{load_weights_file, SharedWeights, WeightStore};
pub use worker::{SnapshotWorker, WorkerHandle};
