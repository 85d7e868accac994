use chrono::{Duration as ChronoDuration, Utc};
use para_collaborators::index::CATEGORY_KEY;
use para_collaborators::{ClassificationOracle, ContentStore, VectorIndex};
use para_schemas::{
    Adjustment, Category, CategoryPerformance, ClassificationDecision, FactorStats,
    FactorWeightTable, FeatureSet, FeedbackCorrection, KnowledgeImport, LearningKnowledge,
    LearningProgress, LearningSnapshot, LedgerEntry, MetricName, NoteId, NoteMetadata, Suggestion,
    TrendPoint,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::features::FeatureExtractor;
use crate::ledger::FeedbackLedger;
use crate::metrics::LearningMetrics;
use crate::neighbors::NeighborAnalyzer;
use crate::scoring::ScoringEngine;
use crate::tuner::AutoTuner;
use crate::weights::{SharedWeights, WeightStore};

const SNIPPET_CHARS: usize = 200;

/// External services the engine talks to. Only the content store is
/// required; without an index or oracle those signals are simply absent.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn ContentStore>,
    pub index: Option<Arc<dyn VectorIndex>>,
    pub oracle: Option<Arc<dyn ClassificationOracle>>,
}

impl Collaborators {
    pub fn new(store: Arc<dyn ContentStore>) -> Self {
        Self {
            store,
            index: None,
            oracle: None,
        }
    }

    pub fn with_index(mut self, index: Arc<dyn VectorIndex>) -> Self {
        self.index = Some(index);
        self
    }

    pub fn with_oracle(mut self, oracle: Arc<dyn ClassificationOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }
}

/// One line of the exported feedback dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackExample {
    pub input: ExampleInput,
    pub label: Category,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExampleInput {
    pub note_id: NoteId,
    pub predicted: Category,
    pub confidence: f64,
    pub features: FeatureSet,
    pub reason: Option<String>,
}

/// Classification and continuous-learning engine.
pub struct ClassificationEngine {
    config: EngineConfig,
    store: Arc<dyn ContentStore>,
    index: Option<Arc<dyn VectorIndex>>,
    oracle: Option<Arc<dyn ClassificationOracle>>,
    extractor: FeatureExtractor,
    neighbors: NeighborAnalyzer,
    scorer: ScoringEngine,
    ledger: Arc<FeedbackLedger>,
    weight_store: Arc<WeightStore>,
    weights: SharedWeights,
    metrics: Arc<LearningMetrics>,
    tuner: Arc<AutoTuner>,
}

impl ClassificationEngine {
    /// Open the stores under `config.db_path` and resolve the live weight
    /// table (persisted, then weights file, then defaults).
    pub fn open(config: EngineConfig, collaborators: Collaborators) -> Result<Self> {
        if let Some(parent) = config.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    EngineError::Input(format!("cannot create {}: {}", parent.display(), e))
                })?;
            }
        }

        let ledger = Arc::new(FeedbackLedger::open(&config.db_path, config.ledger_retry_backoff)?);
        let weight_store = Arc::new(WeightStore::open(&config.db_path)?);
        let (version, table) = weight_store.load_or_init(config.weights_file.as_deref())?;
        let weights = SharedWeights::new(table, version);

        let metrics = Arc::new(LearningMetrics::open(
            &config.db_path,
            ledger.clone(),
            weight_store.clone(),
            config.metrics_window_days,
            config.velocity_window,
        )?);
        let tuner = Arc::new(AutoTuner::new(
            ledger.clone(),
            weight_store.clone(),
            weights.clone(),
            config.metrics_window_days,
        ));

        let neighbors = match &collaborators.index {
            Some(index) => NeighborAnalyzer::new(index.clone(), config.index_timeout)
                .with_scoped_queries(config.scoped_queries),
            None => NeighborAnalyzer::disabled(),
        };

        info!(
            "Classification engine ready (db: {}, weights v{}, index: {}, oracle: {})",
            config.db_path.display(),
            version,
            collaborators.index.is_some(),
            collaborators
                .oracle
                .as_ref()
                .map(|o| o.name().to_string())
                .unwrap_or_else(|| "none".to_string())
        );

        Ok(Self {
            config,
            store: collaborators.store,
            index: collaborators.index,
            oracle: collaborators.oracle,
            extractor: FeatureExtractor::new(),
            neighbors,
            scorer: ScoringEngine::new(),
            ledger,
            weight_store,
            weights,
            metrics,
            tuner,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<LearningMetrics> {
        self.metrics.clone()
    }

    pub fn current_weights(&self) -> Arc<FactorWeightTable> {
        self.weights.current()
    }

    pub fn weights_version(&self) -> i64 {
        self.weights.version()
    }

    /// Classify a note fetched from the content store.
    pub async fn classify_note(&self, note_id: &NoteId) -> Result<ClassificationDecision> {
        let (text, metadata) = self.store.get(note_id).await?;
        self.classify_text(note_id, &text, &metadata).await
    }

    /// Classify a note from caller-supplied text, record the decision and,
    /// when it is not Inbox, index the note under its category.
    pub async fn classify_text(
        &self,
        note_id: &NoteId,
        text: &str,
        metadata: &NoteMetadata,
    ) -> Result<ClassificationDecision> {
        let now = Utc::now();
        let features = self.extractor.extract_at(text, metadata, now);
        let neighbors = self
            .neighbors
            .analyze_excluding(Some(note_id), text, self.config.neighbor_k)
            .await;
        let oracle_category = self.consult_oracle(text).await;

        let weights = self.weights.current();
        let outcome = self.scorer.score(&features, &neighbors, oracle_category, &weights)?;
        let decision = outcome.into_decision(note_id.clone(), now, features, &neighbors, oracle_category);

        let ledger = self.ledger.clone();
        let record = decision.clone();
        blocking(move || ledger.record_decision(&record)).await?;

        if decision.category != Category::Inbox {
            self.index_note(note_id, text, decision.category).await;
        }

        info!(
            "Classified {} as {} (confidence {:.3}{})",
            note_id,
            decision.category,
            decision.confidence,
            if decision.requires_review(weights.confidence_threshold()) {
                ", needs review"
            } else {
                ""
            }
        );
        Ok(decision)
    }

    async fn consult_oracle(&self, text: &str) -> Option<Category> {
        let oracle = self.oracle.as_ref()?;
        let call = oracle.classify(text, &self.config.oracle_directive);

        match tokio::time::timeout(self.config.oracle_timeout, call).await {
            Ok(Ok(verdict)) if verdict.category.is_scored() => {
                debug!("Oracle {} says {}", oracle.name(), verdict.category);
                Some(verdict.category)
            }
            Ok(Ok(verdict)) => {
                debug!("Oracle {} returned unscored {}", oracle.name(), verdict.category);
                None
            }
            Ok(Err(e)) => {
                warn!("Oracle {} unavailable: {}", oracle.name(), e);
                None
            }
            Err(_) => {
                warn!("Oracle {} timed out after {:?}", oracle.name(), self.config.oracle_timeout);
                None
            }
        }
    }

    async fn index_note(&self, note_id: &NoteId, text: &str, category: Category) {
        let Some(index) = self.index.as_ref() else {
            return;
        };
        let snippet: String = text.chars().take(SNIPPET_CHARS).collect();
        let metadata = HashMap::from([(CATEGORY_KEY.to_string(), category.as_str().to_string())]);

        match tokio::time::timeout(
            self.config.index_timeout,
            index.upsert(note_id, text, &snippet, metadata),
        )
        .await
        {
            Ok(Ok(())) => debug!("Indexed {} under {}", note_id, category),
            Ok(Err(e)) => warn!("Index upsert for {} failed: {}", note_id, e),
            Err(_) => warn!("Index upsert for {} timed out", note_id),
        }
    }

    /// Repopulate the vector index from the ledger. Each note is indexed under
    /// its effective category: that of its latest non-Inbox ledger entry, a
    /// correction's target or a decision's category. Notes the content store
    /// can no longer produce are skipped. Returns how many notes were indexed.
    pub async fn rebuild_index(&self) -> Result<usize> {
        if self.index.is_none() {
            return Ok(0);
        }

        let ledger = self.ledger.clone();
        let view = blocking(move || ledger.read_view(None)).await?;
        let mut effective: BTreeMap<NoteId, Category> = BTreeMap::new();
        for entry in &view.entries {
            let category = match entry {
                LedgerEntry::Decision(d) => d.category,
                LedgerEntry::Correction(c) => c.corrected_category,
            };
            // Inbox decisions never touch the index
            if category.is_scored() {
                effective.insert(entry.note_id().clone(), category);
            }
        }

        let mut indexed = 0;
        for (note_id, category) in &effective {
            match self.store.get(note_id).await {
                Ok((text, _)) => {
                    self.index_note(note_id, &text, *category).await;
                    indexed += 1;
                }
                Err(e) => debug!("Not re-indexing {}: {}", note_id, e),
            }
        }

        info!("Rebuilt index with {} of {} classified notes", indexed, effective.len());
        Ok(indexed)
    }

    /// Record the user's category for a note. The note must have a decision.
    pub async fn submit_correction(
        &self,
        note_id: &NoteId,
        category: Category,
        reason: Option<String>,
    ) -> Result<FeedbackCorrection> {
        if !category.is_scored() {
            return Err(EngineError::Input(format!(
                "{} is not a valid correction target",
                category
            )));
        }

        let ledger = self.ledger.clone();
        let id = note_id.clone();
        let correction =
            blocking(move || ledger.correct_latest(&id, category, reason, Utc::now())).await?;

        match self.store.get(note_id).await {
            Ok((text, _)) => self.index_note(note_id, &text, category).await,
            Err(e) => debug!("Not re-indexing {}: {}", note_id, e),
        }

        Ok(correction)
    }

    pub async fn history(&self, note_id: &NoteId) -> Result<Vec<LedgerEntry>> {
        let ledger = self.ledger.clone();
        let id = note_id.clone();
        blocking(move || ledger.history(&id)).await
    }

    /// Compute, persist and return a fresh snapshot.
    pub async fn get_snapshot(&self) -> Result<LearningSnapshot> {
        let metrics = self.metrics.clone();
        blocking(move || metrics.compute_snapshot()).await
    }

    pub async fn latest_snapshot(&self) -> Result<Option<LearningSnapshot>> {
        let metrics = self.metrics.clone();
        blocking(move || metrics.latest_snapshot()).await
    }

    async fn latest_or_fresh_snapshot(&self) -> Result<LearningSnapshot> {
        match self.latest_snapshot().await? {
            Some(snapshot) => Ok(snapshot),
            None => self.get_snapshot().await,
        }
    }

    /// Values of `metric` across stored snapshots of the last `days` days
    /// (all snapshots when `None`).
    pub async fn get_trend(&self, metric: MetricName, days: Option<u32>) -> Result<Vec<TrendPoint>> {
        let metrics = self.metrics.clone();
        let since = days.map(|d| Utc::now() - ChronoDuration::days(d as i64));
        blocking(move || metrics.trend(metric, since)).await
    }

    pub async fn progress(&self, days: u32) -> Result<LearningProgress> {
        let metrics = self.metrics.clone();
        blocking(move || metrics.progress(days)).await
    }

    pub async fn suggest_improvements(&self) -> Result<Vec<Suggestion>> {
        let snapshot = self.latest_or_fresh_snapshot().await?;
        let metrics = self.metrics.clone();
        blocking(move || metrics.suggest_improvements(&snapshot)).await
    }

    /// Tuning proposals against the live table. Nothing is applied.
    pub async fn propose_adjustments(&self) -> Result<Vec<Adjustment>> {
        let snapshot = self.latest_or_fresh_snapshot().await?;
        let tuner = self.tuner.clone();
        let current = self.weights.current();
        blocking(move || tuner.propose_adjustments(&snapshot, &current)).await
    }

    /// Apply adjustments the caller has confirmed.
    pub async fn apply_adjustments(&self, adjustments: Vec<Adjustment>) -> Result<FactorWeightTable> {
        let tuner = self.tuner.clone();
        blocking(move || tuner.apply(&adjustments)).await
    }

    pub async fn category_performance(&self) -> Result<Vec<CategoryPerformance>> {
        let metrics = self.metrics.clone();
        blocking(move || metrics.category_performance()).await
    }

    pub async fn factor_analysis(&self, days: Option<u32>) -> Result<Vec<FactorStats>> {
        let metrics = self.metrics.clone();
        blocking(move || metrics.factor_analysis(days)).await
    }

    /// Bundle the live weight table, the adjustment log and every stored
    /// snapshot so another installation can start from them.
    pub async fn export_learning_knowledge(&self) -> Result<LearningKnowledge> {
        let weights_version = self.weights.version();
        let weights = (*self.weights.current()).clone();
        let store = self.weight_store.clone();
        let metrics = self.metrics.clone();
        let (adjustments, snapshots) =
            blocking(move || Ok((store.adjustments(None)?, metrics.snapshots(None)?))).await?;

        info!(
            "Exported learning knowledge: weights v{}, {} adjustments, {} snapshots",
            weights_version,
            adjustments.len(),
            snapshots.len()
        );
        Ok(LearningKnowledge {
            exported_at: Utc::now(),
            weights_version,
            weights,
            adjustments,
            snapshots,
        })
    }

    /// Adopt an exported bundle: its weight table becomes the live version
    /// and its adjustments and snapshots join the local history. The ledger
    /// is left untouched.
    pub async fn import_learning_knowledge(
        &self,
        knowledge: LearningKnowledge,
    ) -> Result<KnowledgeImport> {
        knowledge
            .weights
            .validate()
            .map_err(|e| EngineError::Input(format!("imported weight table: {}", e)))?;
        let tuner = self.tuner.clone();
        let metrics = self.metrics.clone();

        let result = blocking(move || {
            let snapshots_imported = metrics.import_snapshots(&knowledge.snapshots)?;
            let (weights_version, adjustments_imported) =
                tuner.adopt(&knowledge.weights, &knowledge.adjustments)?;
            Ok(KnowledgeImport {
                weights_version,
                adjustments_imported,
                snapshots_imported,
            })
        })
        .await?;

        info!(
            "Imported learning knowledge: weights v{}, {} adjustments, {} snapshots",
            result.weights_version, result.adjustments_imported, result.snapshots_imported
        );
        Ok(result)
    }

    /// Write one JSON line `{input, label}` per corrected decision, plus
    /// uncorrected non-Inbox decisions labelled with their own category when
    /// `include_uncorrected` is set. Returns the number of lines written.
    pub fn export_feedback_dataset<W: Write>(
        &self,
        mut writer: W,
        include_uncorrected: bool,
    ) -> Result<usize> {
        let view = self.ledger.read_view(None)?;
        let mut written = 0;

        for outcome in view.outcomes() {
            let decision = outcome.decision;
            let (label, reason) = match outcome.correction {
                Some(correction) => (correction.corrected_category, correction.reason.clone()),
                None if include_uncorrected && decision.category != Category::Inbox => {
                    (decision.category, None)
                }
                None => continue,
            };

            let example = FeedbackExample {
                input: ExampleInput {
                    note_id: decision.note_id.clone(),
                    predicted: decision.category,
                    confidence: decision.confidence,
                    features: decision.features.clone(),
                    reason,
                },
                label,
            };
            serde_json::to_writer(&mut writer, &example)?;
            writer.write_all(b"\n").map_err(anyhow::Error::from)?;
            written += 1;
        }
        writer.flush().map_err(anyhow::Error::from)?;

        info!("Exported {} feedback examples", written);
        Ok(written)
    }

    /// Flush the ledger's WAL. The engine must not be used afterwards.
    pub fn close(self) -> Result<()> {
        self.ledger.checkpoint()?;
        info!(
            "Classification engine closed ({} weight versions)",
            self.weight_store.version_count()?
        );
        Ok(())
    }
}

/// Run synchronous storage work off the async executor.
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| EngineError::Other(anyhow::Error::from(e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use para_collaborators::{InMemoryVectorIndex, MemoryContentStore};
    use tempfile::TempDir;

    fn engine(dir: &TempDir) -> (ClassificationEngine, Arc<MemoryContentStore>, Arc<InMemoryVectorIndex>) {
        let store = Arc::new(MemoryContentStore::new());
        let index = Arc::new(InMemoryVectorIndex::default());
        let collaborators = Collaborators::new(store.clone()).with_index(index.clone());
        let engine = ClassificationEngine::open(
            EngineConfig::with_db_path(dir.path().join("para.db")),
            collaborators,
        )
        .unwrap();
        (engine, store, index)
    }

    const PROJECT_NOTE: &str = "---\nstatus: active\ndeadline: 2030-01-01\n---\n# Launch\n\n\
Goal: ship the roadmap milestone.\n\n- [ ] draft\n- [ ] review\n- [x] kickoff\n";

    #[tokio::test]
    async fn test_classify_records_and_indexes() {
        let dir = TempDir::new().unwrap();
        let (engine, store, index) = engine(&dir);
        let note_id = store.insert_path(dir.path().join("launch.md"), PROJECT_NOTE);

        let decision = engine.classify_note(&note_id).await.unwrap();
        assert_eq!(decision.category, Category::Projects);
        assert!((0.0..=1.0).contains(&decision.confidence));
        assert_eq!(index.len(), 1);

        let history = engine.history(&note_id).await.unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_note_is_not_found() {
        let dir = TempDir::new().unwrap();
        let (engine, _, _) = engine(&dir);

        let err = engine.classify_note(&NoteId::new("missing")).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));

        let err = engine
            .submit_correction(&NoteId::new("missing"), Category::Areas, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_correction_targets_must_be_scored() {
        let dir = TempDir::new().unwrap();
        let (engine, store, _) = engine(&dir);
        let note_id = store.insert_path(dir.path().join("launch.md"), PROJECT_NOTE);
        engine.classify_note(&note_id).await.unwrap();

        let err = engine
            .submit_correction(&note_id, Category::Inbox, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Input(_)));

        let correction = engine
            .submit_correction(&note_id, Category::Areas, Some("ongoing".into()))
            .await
            .unwrap();
        assert_eq!(correction.original_category, Category::Projects);
        assert_eq!(engine.history(&note_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_export_writes_one_line_per_pair() {
        let dir = TempDir::new().unwrap();
        let (engine, store, _) = engine(&dir);
        let a = store.insert_path(dir.path().join("a.md"), PROJECT_NOTE);
        let b = store.insert_path(dir.path().join("b.md"), PROJECT_NOTE);
        engine.classify_note(&a).await.unwrap();
        engine.classify_note(&b).await.unwrap();
        engine.submit_correction(&a, Category::Archive, None).await.unwrap();

        let mut out = Vec::new();
        assert_eq!(engine.export_feedback_dataset(&mut out, false).unwrap(), 1);
        let line = String::from_utf8(out).unwrap();
        let example: FeedbackExample = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(example.label, Category::Archive);
        assert_eq!(example.input.predicted, Category::Projects);

        let mut all = Vec::new();
        assert_eq!(engine.export_feedback_dataset(&mut all, true).unwrap(), 2);
        engine.close().unwrap();
    }

    #[tokio::test]
    async fn test_rebuild_index_uses_effective_category() {
        let dir = TempDir::new().unwrap();
        let (engine, store, _) = engine(&dir);
        let kept = store.insert_path(dir.path().join("kept.md"), PROJECT_NOTE);
        let moved = store.insert_path(dir.path().join("moved.md"), PROJECT_NOTE);
        engine.classify_note(&kept).await.unwrap();
        engine.classify_note(&moved).await.unwrap();
        engine.submit_correction(&moved, Category::Areas, None).await.unwrap();
        // Known to the ledger only
        engine
            .classify_text(&NoteId::new("gone"), PROJECT_NOTE, &NoteMetadata::default())
            .await
            .unwrap();
        engine.close().unwrap();

        let index = Arc::new(InMemoryVectorIndex::default());
        let collaborators = Collaborators::new(store.clone()).with_index(index.clone());
        let reopened = ClassificationEngine::open(
            EngineConfig::with_db_path(dir.path().join("para.db")),
            collaborators,
        )
        .unwrap();
        assert!(index.is_empty());

        assert_eq!(reopened.rebuild_index().await.unwrap(), 2);
        assert_eq!(index.len(), 2);
        let areas = index.query(PROJECT_NOTE, 10, Some(Category::Areas)).await.unwrap();
        assert_eq!(areas.len(), 1);
        assert_eq!(areas[0].id, moved.0);
        let projects = index.query(PROJECT_NOTE, 10, Some(Category::Projects)).await.unwrap();
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].id, kept.0);
    }
}
