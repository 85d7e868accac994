/// Tuning CLI - computes a learning snapshot, prints suggestions and
/// parameter proposals, and applies them only after confirmation.
///
/// Usage:
///   cargo run --bin para-tune [--db-path <path>] [--yes]
///   cargo run --bin para-tune --export-knowledge <file>
///   cargo run --bin para-tune --import-knowledge <file> [--yes]
///
/// Options:
///   --db-path: SQLite database (defaults to PARA_DB_PATH or ~/.para/para.db)
///   --yes: apply proposals or an import without the interactive prompt
///   --export-knowledge: write weights, adjustments and snapshots as JSON
///   --import-knowledge: adopt a bundle written by --export-knowledge
use anyhow::Result;
use clap::Parser;
use para_collaborators::MemoryContentStore;
use para_engine::{ClassificationEngine, Collaborators, EngineConfig};
use para_schemas::LearningKnowledge;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};

#[derive(Parser, Debug)]
#[command(name = "para-tune")]
#[command(about = "Review learning metrics and apply tuning proposals")]
struct Args {
    /// Path to SQLite database file
    #[arg(long, short)]
    db_path: Option<PathBuf>,

    /// Apply proposals without asking
    #[arg(long, short)]
    yes: bool,

    /// Only print metrics and proposals
    #[arg(long)]
    dry_run: bool,

    /// Write the learned knowledge bundle to this file and exit
    #[arg(long, conflicts_with = "import_knowledge")]
    export_knowledge: Option<PathBuf>,

    /// Adopt a knowledge bundle from this file and exit
    #[arg(long)]
    import_knowledge: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    let args = Args::parse();

    let mut config = EngineConfig::from_env();
    if let Some(path) = args.db_path {
        config.db_path = path;
    }
    info!("Database: {}", config.db_path.display());

    // Tuning reads the ledger only; no content store or index is needed
    let engine = ClassificationEngine::open(
        config,
        Collaborators::new(Arc::new(MemoryContentStore::new())),
    )?;

    if let Some(path) = &args.export_knowledge {
        let knowledge = engine.export_learning_knowledge().await?;
        std::fs::write(path, serde_json::to_vec_pretty(&knowledge)?)?;
        info!("Knowledge written to {}", path.display());
        engine.close()?;
        return Ok(());
    }

    if let Some(path) = &args.import_knowledge {
        let knowledge: LearningKnowledge = serde_json::from_slice(&std::fs::read(path)?)?;
        info!(
            "Bundle from {}: weights v{}, {} adjustments, {} snapshots",
            knowledge.exported_at,
            knowledge.weights_version,
            knowledge.adjustments.len(),
            knowledge.snapshots.len()
        );
        if args.dry_run {
            info!("Dry run; nothing imported.");
        } else if args.yes || confirm("Import this bundle?")? {
            let imported = engine.import_learning_knowledge(knowledge).await?;
            info!(
                "Imported. Weight table version {} ({} adjustments, {} snapshots added)",
                imported.weights_version, imported.adjustments_imported, imported.snapshots_imported
            );
        } else {
            info!("Nothing imported.");
        }
        engine.close()?;
        return Ok(());
    }

    let snapshot = engine.get_snapshot().await?;
    info!("─────────────────────────────────────────────────");
    info!("Decisions:          {}", snapshot.total_classifications);
    info!("Accuracy:           {:.1}%", snapshot.accuracy_rate);
    info!("Correlation:        {:.3}", snapshot.confidence_correlation);
    info!("Velocity:           {:.3}", snapshot.learning_velocity);
    info!("Improvement:        {:.3}", snapshot.improvement_score);
    info!("Category balance:   {:.3}", snapshot.category_balance);
    info!("Satisfaction:       {:.3}", snapshot.user_satisfaction);
    info!("─────────────────────────────────────────────────");

    for suggestion in engine.suggest_improvements().await? {
        info!(
            "[{}] {} -> {}",
            suggestion.severity.as_str(),
            suggestion.message,
            suggestion.action
        );
    }

    let proposals = engine.propose_adjustments().await?;
    if proposals.is_empty() {
        info!("No adjustments proposed.");
        engine.close()?;
        return Ok(());
    }

    for adjustment in &proposals {
        info!(
            "Proposal: {} {:.2} -> {:.2} ({})",
            adjustment.parameter.as_str(),
            adjustment.current,
            adjustment.proposed,
            adjustment.reason
        );
    }

    if args.dry_run {
        info!("Dry run; nothing applied.");
    } else if args.yes || confirm(&format!("Apply {} adjustment(s)?", proposals.len()))? {
        engine.apply_adjustments(proposals).await?;
        info!("Applied. Weight table version {}", engine.weights_version());
    } else {
        info!("Nothing applied.");
    }

    engine.close()?;
    Ok(())
}

fn confirm(question: &str) -> Result<bool> {
    print!("{} [y/N] ", question);
    std::io::stdout().flush()?;

    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}
