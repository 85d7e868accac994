use anyhow::Result;
use para_collaborators::{InMemoryVectorIndex, MemoryContentStore};
use para_engine::{ClassificationEngine, Collaborators, EngineConfig, EngineError};
use para_schemas::{Category, LedgerEntry, MetricName, NoteId, NoteMetadata, TunableParameter};
use std::sync::Arc;
use tempfile::TempDir;

const NOTES: [(&str, Category); 4] = [
    (
        "# Website relaunch\nGoal: ship the new roadmap milestone by 2031-03-01.\n\n- [ ] wireframes\n- [ ] copy\n",
        Category::Projects,
    ),
    (
        "# Health\nMy responsibility: weekly routine, fitness habits and the monthly budget review.\n",
        Category::Areas,
    ),
    (
        "# Bread recipe\nA reference guide with a template.\n\n| flour | water |\n|---|---|\n| 500 | 350 |\n",
        Category::Resources,
    ),
    (
        "---\nstatus: done\n---\n# Old migration\nCompleted and archived. Obsolete now.\n\n- [x] move\n- [x] verify\n",
        Category::Archive,
    ),
];

fn open_engine(dir: &TempDir) -> Result<ClassificationEngine> {
    open_with_store(dir, Arc::new(MemoryContentStore::new()))
}

/// Every call gets a fresh, empty index.
fn open_with_store(dir: &TempDir, store: Arc<MemoryContentStore>) -> Result<ClassificationEngine> {
    let collaborators =
        Collaborators::new(store).with_index(Arc::new(InMemoryVectorIndex::default()));
    Ok(ClassificationEngine::open(
        EngineConfig::with_db_path(dir.path().join("para.db")),
        collaborators,
    )?)
}

fn metadata() -> NoteMetadata {
    NoteMetadata {
        path: None,
        modified: None,
        size_bytes: None,
    }
}

#[tokio::test]
async fn test_templates_land_in_expected_categories() -> Result<()> {
    let dir = TempDir::new()?;
    let engine = open_engine(&dir)?;

    for (i, (text, expected)) in NOTES.iter().enumerate() {
        let decision = engine
            .classify_text(&NoteId::new(format!("note-{}", i)), text, &metadata())
            .await?;
        assert_eq!(decision.category, *expected, "reasoning: {}", decision.reasoning);
        assert!(decision.confidence >= 0.0 && decision.confidence <= 1.0);
        assert!(!decision.reasoning.is_empty());
    }

    // Nothing scores on an empty note
    let empty = engine
        .classify_text(&NoteId::new("empty"), "", &metadata())
        .await?;
    assert_eq!(empty.category, Category::Inbox);
    Ok(())
}

#[tokio::test]
async fn test_hundred_decisions_ten_corrections() -> Result<()> {
    let dir = TempDir::new()?;
    let engine = open_engine(&dir)?;

    for i in 0..100 {
        let (text, _) = NOTES[i % NOTES.len()];
        engine
            .classify_text(&NoteId::new(format!("note-{}", i)), text, &metadata())
            .await?;
    }
    for i in 0..10 {
        engine
            .submit_correction(&NoteId::new(format!("note-{}", i * 4)), Category::Areas, None)
            .await?;
    }

    let snapshot = engine.get_snapshot().await?;
    assert_eq!(snapshot.total_classifications, 100);
    assert!((snapshot.accuracy_rate - 90.0).abs() < 1e-9);
    assert_eq!(snapshot.user_satisfaction, 1.0);
    assert!(snapshot.category_balance > 0.0 && snapshot.category_balance <= 1.0);
    assert!(snapshot.confidence_correlation.is_finite());
    assert!((-1.0..=1.0).contains(&snapshot.confidence_correlation));

    let performance = engine.category_performance().await?;
    let projects = performance
        .iter()
        .find(|p| p.category == Category::Projects)
        .expect("projects were decided");
    assert_eq!(projects.decisions, 25);
    assert_eq!(projects.corrections, 10);
    Ok(())
}

#[tokio::test]
async fn test_history_is_append_only_and_ordered() -> Result<()> {
    let dir = TempDir::new()?;
    let engine = open_engine(&dir)?;
    let note = NoteId::new("evolving");

    let (project, _) = NOTES[0];
    let (archive, _) = NOTES[3];
    engine.classify_text(&note, project, &metadata()).await?;
    engine
        .submit_correction(&note, Category::Areas, Some("ongoing".into()))
        .await?;
    engine.classify_text(&note, archive, &metadata()).await?;

    let history = engine.history(&note).await?;
    assert_eq!(history.len(), 3);
    assert!(history.windows(2).all(|w| w[0].timestamp() <= w[1].timestamp()));
    match &history[1] {
        LedgerEntry::Correction(c) => {
            assert_eq!(c.original_category, Category::Projects);
            assert_eq!(c.corrected_category, Category::Areas);
        }
        other => panic!("expected correction, got {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn test_correction_requires_prior_decision() -> Result<()> {
    let dir = TempDir::new()?;
    let engine = open_engine(&dir)?;

    let err = engine
        .submit_correction(&NoteId::new("never-seen"), Category::Projects, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
    assert!(engine.history(&NoteId::new("never-seen")).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_tuning_round_trip_persists_across_reopen() -> Result<()> {
    let dir = TempDir::new()?;
    {
        let engine = open_engine(&dir)?;
        for i in 0..20 {
            let (text, _) = NOTES[i % NOTES.len()];
            engine
                .classify_text(&NoteId::new(format!("note-{}", i)), text, &metadata())
                .await?;
        }
        // A correction rate of 25% pushes the semantic weight up
        for i in 0..5 {
            engine
                .submit_correction(&NoteId::new(format!("note-{}", i)), Category::Resources, None)
                .await?;
        }
        engine.get_snapshot().await?;

        let proposals = engine.propose_adjustments().await?;
        let semantic = proposals
            .iter()
            .find(|a| a.parameter == TunableParameter::SemanticWeight)
            .expect("semantic weight proposal");
        assert!((semantic.proposed - 0.6).abs() < 1e-9);

        // Proposing alone changes nothing
        assert_eq!(engine.weights_version(), 1);

        let table = engine.apply_adjustments(proposals).await?;
        assert!((table.semantic_weight() - 0.6).abs() < 1e-9);
        assert_eq!(engine.weights_version(), 2);

        engine.get_snapshot().await?;
        let trend = engine.get_trend(MetricName::AccuracyRate, None).await?;
        assert_eq!(trend.len(), 2);
        engine.close()?;
    }

    let engine = open_engine(&dir)?;
    assert_eq!(engine.weights_version(), 2);
    assert!((engine.current_weights().semantic_weight() - 0.6).abs() < 1e-9);
    assert!(engine.latest_snapshot().await?.is_some());
    assert!(engine.get_snapshot().await?.system_adaptability > 0.5);
    Ok(())
}

#[tokio::test]
async fn test_concurrent_classification_of_distinct_notes() -> Result<()> {
    let dir = TempDir::new()?;
    let engine = Arc::new(open_engine(&dir)?);

    let mut tasks = Vec::new();
    for i in 0..16 {
        let engine = engine.clone();
        tasks.push(tokio::spawn(async move {
            let (text, _) = NOTES[i % NOTES.len()];
            engine
                .classify_text(&NoteId::new(format!("note-{}", i)), text, &metadata())
                .await
        }));
    }
    for task in tasks {
        task.await??;
    }

    let snapshot = engine.get_snapshot().await?;
    assert_eq!(snapshot.total_classifications, 16);
    Ok(())
}

#[tokio::test]
async fn test_neighbors_survive_restart() -> Result<()> {
    let dir = TempDir::new()?;
    let store = Arc::new(MemoryContentStore::new());
    let incoming = NoteId::new("incoming");
    let (incoming_text, _) = NOTES[0];

    let before = {
        let engine = open_with_store(&dir, store.clone())?;
        for (i, (text, _)) in NOTES.iter().enumerate() {
            let id = store.insert_path(dir.path().join(format!("note-{}.md", i)), *text);
            engine.classify_note(&id).await?;
        }
        let decision = engine.classify_text(&incoming, incoming_text, &metadata()).await?;
        engine.close()?;
        decision.neighbors
    };
    assert_eq!(before.len(), NOTES.len());

    let engine = open_with_store(&dir, store)?;
    let cold = engine.classify_text(&incoming, incoming_text, &metadata()).await?;
    assert!(cold.neighbors.is_empty());

    assert_eq!(engine.rebuild_index().await?, NOTES.len());
    let warm = engine.classify_text(&incoming, incoming_text, &metadata()).await?;
    assert_eq!(warm.neighbors, before);
    Ok(())
}

#[tokio::test]
async fn test_learning_knowledge_moves_between_installations() -> Result<()> {
    let source_dir = TempDir::new()?;
    let knowledge = {
        let engine = open_engine(&source_dir)?;
        for i in 0..20 {
            let (text, _) = NOTES[i % NOTES.len()];
            engine
                .classify_text(&NoteId::new(format!("note-{}", i)), text, &metadata())
                .await?;
        }
        for i in 0..5 {
            engine
                .submit_correction(&NoteId::new(format!("note-{}", i)), Category::Resources, None)
                .await?;
        }
        engine.get_snapshot().await?;
        let proposals = engine.propose_adjustments().await?;
        engine.apply_adjustments(proposals).await?;
        engine.get_snapshot().await?;

        let factors = engine.factor_analysis(None).await?;
        assert!(factors.iter().any(|f| f.corrected > 0));
        assert!(factors.iter().all(|f| f.decisions > 0 && f.corrected <= f.decisions));

        engine.export_learning_knowledge().await?
    };
    assert_eq!(knowledge.weights_version, 2);
    assert!(!knowledge.adjustments.is_empty());
    assert_eq!(knowledge.snapshots.len(), 2);

    // Survives the wire format
    let knowledge: para_schemas::LearningKnowledge =
        serde_json::from_str(&serde_json::to_string(&knowledge)?)?;

    let target_dir = TempDir::new()?;
    let engine = open_engine(&target_dir)?;
    assert_eq!(engine.weights_version(), 1);

    let imported = engine.import_learning_knowledge(knowledge.clone()).await?;
    assert_eq!(imported.weights_version, 2);
    assert_eq!(imported.adjustments_imported, knowledge.adjustments.len());
    assert_eq!(imported.snapshots_imported, 2);
    assert_eq!(*engine.current_weights(), knowledge.weights);
    assert_eq!(
        engine.get_trend(MetricName::AccuracyRate, None).await?.len(),
        2
    );
    // The ledger is not part of the bundle
    assert!(engine.history(&NoteId::new("note-0")).await?.is_empty());

    // Importing twice does not duplicate history
    let again = engine.import_learning_knowledge(knowledge).await?;
    assert_eq!(again.adjustments_imported, 0);
    assert_eq!(again.snapshots_imported, 0);
    engine.close()?;
    Ok(())
}
