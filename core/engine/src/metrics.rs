use chrono::{DateTime, Duration as ChronoDuration, Utc};
use para_schemas::{
    AppliedAdjustment, Category, CategoryPerformance, FactorStats, LearningProgress,
    LearningSnapshot, MetricName, Severity, Suggestion, SuggestionKind, TrendDirection,
    TrendPoint, SNAPSHOT_SCHEMA_VERSION,
};
use rusqlite::{params, Connection, Row};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::ledger::{FeedbackLedger, LedgerView};
use crate::storage::{append_only_triggers, open_connection, ts_from_sql, ts_to_sql};
use crate::weights::WeightStore;

const ACCURACY_TARGET: f64 = 85.0;
const CORRELATION_TARGET: f64 = 0.6;
const VELOCITY_TARGET: f64 = 0.3;
const MIN_FEEDBACK_RATE: f64 = 0.05;
const MAX_FEEDBACK_RATE: f64 = 0.20;
const CATEGORY_CORRECTION_LIMIT: f64 = 0.30;
const CATEGORY_MIN_DECISIONS: u64 = 5;
const BALANCE_TARGET: f64 = 0.3;

const ADAPTABILITY_WINDOW_DAYS: i64 = 30;
const ADAPTABILITY_SATURATION: f64 = 10.0;
const TUNABLE_PARAMETERS: f64 = 2.0;
/// Accuracy change (percentage points) that counts as a trend.
const PROGRESS_EPSILON: f64 = 1.0;

const SNAPSHOT_COLUMNS: &str = "ts, schema_version, total_classifications, accuracy_rate, \
    confidence_correlation, learning_velocity, improvement_score, category_balance, \
    semantic_coherence, user_satisfaction, system_adaptability";

/// Computes, persists and queries learning snapshots.
pub struct LearningMetrics {
    path: PathBuf,
    ledger: Arc<FeedbackLedger>,
    weights: Arc<WeightStore>,
    window: Option<ChronoDuration>,
    velocity_window: usize,
}

impl LearningMetrics {
    pub fn open<P: AsRef<Path>>(
        path: P,
        ledger: Arc<FeedbackLedger>,
        weights: Arc<WeightStore>,
        window_days: Option<u32>,
        velocity_window: usize,
    ) -> Result<Self> {
        let metrics = Self {
            path: path.as_ref().to_path_buf(),
            ledger,
            weights,
            window: window_days.map(|d| ChronoDuration::days(d as i64)),
            velocity_window: velocity_window.max(2),
        };

        let conn = metrics.connect()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS learning_snapshots (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                ts TEXT NOT NULL,
                schema_version INTEGER NOT NULL,
                total_classifications INTEGER NOT NULL,
                accuracy_rate REAL NOT NULL,
                confidence_correlation REAL NOT NULL,
                learning_velocity REAL NOT NULL,
                improvement_score REAL NOT NULL,
                category_balance REAL NOT NULL,
                semantic_coherence REAL NOT NULL,
                user_satisfaction REAL NOT NULL,
                system_adaptability REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_snapshots_ts ON learning_snapshots(ts, seq);",
        )?;
        conn.execute_batch(&append_only_triggers("learning_snapshots"))?;

        Ok(metrics)
    }

    fn connect(&self) -> Result<Connection> {
        Ok(open_connection(&self.path)?)
    }

    fn view(&self, now: DateTime<Utc>) -> Result<LedgerView> {
        self.ledger.read_view(self.window.map(|w| now - w))
    }

    pub fn compute_snapshot(&self) -> Result<LearningSnapshot> {
        self.compute_snapshot_at(Utc::now())
    }

    /// Compute a snapshot as of `now`, persist it and return it.
    pub fn compute_snapshot_at(&self, now: DateTime<Utc>) -> Result<LearningSnapshot> {
        let view = self.view(now)?;
        let previous = self.recent_snapshots(self.velocity_window - 1)?;
        let adjustments = self.weights.adjustments(None)?;

        let history: Vec<f64> = previous.iter().map(|s| s.accuracy_rate / 100.0).collect();
        let snapshot = snapshot_from(&view, &history, &adjustments, now);
        self.persist(&snapshot)?;

        info!(
            "Learning snapshot: {} decisions, accuracy {:.1}%, correlation {:.3}, velocity {:.3}",
            snapshot.total_classifications,
            snapshot.accuracy_rate,
            snapshot.confidence_correlation,
            snapshot.learning_velocity
        );
        Ok(snapshot)
    }

    fn persist(&self, snapshot: &LearningSnapshot) -> Result<()> {
        let conn = self.connect()?;
        insert_snapshot(&conn, snapshot)?;
        Ok(())
    }

    /// Append snapshots recorded elsewhere, e.g. by an imported knowledge
    /// bundle. Snapshots from a newer schema or with a timestamp already on
    /// record are skipped. Returns how many were stored.
    pub fn import_snapshots(&self, snapshots: &[LearningSnapshot]) -> Result<usize> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        let mut stored = 0;
        for snapshot in snapshots.iter().filter(|s| s.is_supported()) {
            let known: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM learning_snapshots WHERE ts = ?1)",
                params![ts_to_sql(&snapshot.timestamp)],
                |row| row.get(0),
            )?;
            if known {
                continue;
            }
            insert_snapshot(&tx, snapshot)?;
            stored += 1;
        }
        tx.commit()?;
        if stored < snapshots.len() {
            debug!("Skipped {} imported snapshots", snapshots.len() - stored);
        }
        Ok(stored)
    }

    /// Stored snapshots at or after `since`, oldest first. Rows written by a
    /// newer schema are skipped.
    pub fn snapshots(&self, since: Option<DateTime<Utc>>) -> Result<Vec<LearningSnapshot>> {
        let conn = self.connect()?;
        let lower = since.map(|ts| ts_to_sql(&ts)).unwrap_or_default();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM learning_snapshots WHERE ts >= ?1 ORDER BY ts, seq",
            SNAPSHOT_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![lower], snapshot_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut snapshots = Vec::with_capacity(rows.len());
        for snapshot in rows {
            if !snapshot.is_supported() {
                warn!(
                    "Skipping snapshot with unsupported schema version {}",
                    snapshot.schema_version
                );
                continue;
            }
            snapshots.push(snapshot);
        }
        Ok(snapshots)
    }

    fn recent_snapshots(&self, limit: usize) -> Result<Vec<LearningSnapshot>> {
        let all = self.snapshots(None)?;
        let skip = all.len().saturating_sub(limit);
        Ok(all.into_iter().skip(skip).collect())
    }

    pub fn latest_snapshot(&self) -> Result<Option<LearningSnapshot>> {
        Ok(self.recent_snapshots(1)?.pop())
    }

    pub fn snapshot_count(&self) -> Result<usize> {
        let conn = self.connect()?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM learning_snapshots", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// One metric over time, read from its own column.
    pub fn trend(&self, metric: MetricName, since: Option<DateTime<Utc>>) -> Result<Vec<TrendPoint>> {
        let conn = self.connect()?;
        let lower = since.map(|ts| ts_to_sql(&ts)).unwrap_or_default();
        // Column names come from the closed MetricName set
        let mut stmt = conn.prepare(&format!(
            "SELECT ts, {} FROM learning_snapshots
             WHERE ts >= ?1 AND schema_version <= ?2 ORDER BY ts, seq",
            metric.as_str()
        ))?;
        let points = stmt
            .query_map(params![lower, SNAPSHOT_SCHEMA_VERSION], |row| {
                Ok(TrendPoint {
                    timestamp: ts_from_sql(&row.get::<_, String>(0)?)?,
                    value: row.get::<_, f64>(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(points)
    }

    pub fn progress(&self, days: u32) -> Result<LearningProgress> {
        let since = Utc::now() - ChronoDuration::days(days as i64);
        Ok(progress_of(&self.snapshots(Some(since))?))
    }

    pub fn category_performance(&self) -> Result<Vec<CategoryPerformance>> {
        Ok(category_performance(&self.view(Utc::now())?))
    }

    /// Factor statistics over the last `days` days, or the configured window.
    pub fn factor_analysis(&self, days: Option<u32>) -> Result<Vec<FactorStats>> {
        let now = Utc::now();
        let view = match days {
            Some(days) => self.ledger.read_view(Some(now - ChronoDuration::days(days as i64)))?,
            None => self.view(now)?,
        };
        Ok(factor_analysis(&view))
    }

    pub fn suggest_improvements(&self, snapshot: &LearningSnapshot) -> Result<Vec<Suggestion>> {
        let view = self.view(snapshot.timestamp)?;
        let snapshots = self.snapshot_count()?;
        Ok(suggestions_for(snapshot, snapshots, &view))
    }
}

fn insert_snapshot(conn: &Connection, snapshot: &LearningSnapshot) -> rusqlite::Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO learning_snapshots ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            SNAPSHOT_COLUMNS
        ),
        params![
            ts_to_sql(&snapshot.timestamp),
            snapshot.schema_version,
            snapshot.total_classifications as i64,
            snapshot.accuracy_rate,
            snapshot.confidence_correlation,
            snapshot.learning_velocity,
            snapshot.improvement_score,
            snapshot.category_balance,
            snapshot.semantic_coherence,
            snapshot.user_satisfaction,
            snapshot.system_adaptability,
        ],
    )?;
    Ok(())
}

fn snapshot_from_row(row: &Row) -> rusqlite::Result<LearningSnapshot> {
    Ok(LearningSnapshot {
        timestamp: ts_from_sql(&row.get::<_, String>(0)?)?,
        schema_version: row.get(1)?,
        total_classifications: row.get::<_, i64>(2)?.max(0) as u64,
        accuracy_rate: row.get(3)?,
        confidence_correlation: row.get(4)?,
        learning_velocity: row.get(5)?,
        improvement_score: row.get(6)?,
        category_balance: row.get(7)?,
        semantic_coherence: row.get(8)?,
        user_satisfaction: row.get(9)?,
        system_adaptability: row.get(10)?,
    })
}

/// Build a snapshot from a ledger view. `history` holds the accuracy
/// fractions of previous snapshots, oldest first.
pub fn snapshot_from(
    view: &LedgerView,
    history: &[f64],
    adjustments: &[AppliedAdjustment],
    now: DateTime<Utc>,
) -> LearningSnapshot {
    let decisions = view.decision_count();
    let corrections = view.correction_count();

    let accuracy = accuracy_rate(decisions, corrections);
    let correlation = confidence_correlation(view);

    let mut series = history.to_vec();
    series.push(accuracy / 100.0);

    LearningSnapshot {
        schema_version: SNAPSHOT_SCHEMA_VERSION,
        timestamp: now,
        total_classifications: decisions as u64,
        accuracy_rate: accuracy,
        confidence_correlation: correlation,
        learning_velocity: learning_velocity(&series),
        improvement_score: improvement_score(accuracy, correlation),
        category_balance: category_balance(view),
        semantic_coherence: semantic_coherence(view),
        user_satisfaction: user_satisfaction(decisions, corrections),
        system_adaptability: system_adaptability(adjustments, now),
    }
}

/// Percent of decisions left uncorrected; 0 with no decisions.
pub fn accuracy_rate(decisions: usize, corrections: usize) -> f64 {
    if decisions == 0 {
        return 0.0;
    }
    ((1.0 - corrections as f64 / decisions as f64) * 100.0).clamp(0.0, 100.0)
}

/// Pearson correlation between confidence and "was not corrected".
pub fn confidence_correlation(view: &LedgerView) -> f64 {
    let pairs: Vec<(f64, f64)> = view
        .outcomes()
        .iter()
        .map(|o| (o.decision.confidence, if o.is_corrected() { 0.0 } else { 1.0 }))
        .collect();
    pearson(&pairs)
}

pub fn pearson(pairs: &[(f64, f64)]) -> f64 {
    if pairs.len() < 2 {
        return 0.0;
    }
    let n = pairs.len() as f64;
    let mean_x = pairs.iter().map(|(x, _)| x).sum::<f64>() / n;
    let mean_y = pairs.iter().map(|(_, y)| y).sum::<f64>() / n;

    let (mut cov, mut var_x, mut var_y) = (0.0, 0.0, 0.0);
    for (x, y) in pairs {
        let dx = x - mean_x;
        let dy = y - mean_y;
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }

    if var_x <= f64::EPSILON || var_y <= f64::EPSILON {
        return 0.0;
    }
    let r = cov / (var_x.sqrt() * var_y.sqrt());
    if r.is_finite() {
        r.clamp(-1.0, 1.0)
    } else {
        0.0
    }
}

/// Least-squares slope of the accuracy series mapped onto [0, 1].
pub fn learning_velocity(series: &[f64]) -> f64 {
    if series.len() < 2 {
        return 0.0;
    }
    let n = series.len() as f64;
    let mean_x = (n - 1.0) / 2.0;
    let mean_y = series.iter().sum::<f64>() / n;

    let (mut num, mut den) = (0.0, 0.0);
    for (i, y) in series.iter().enumerate() {
        let dx = i as f64 - mean_x;
        num += dx * (y - mean_y);
        den += dx * dx;
    }
    let slope = if den > 0.0 { num / den } else { 0.0 };
    ((slope + 0.1) / 0.2).clamp(0.0, 1.0)
}

pub fn improvement_score(accuracy_rate: f64, correlation: f64) -> f64 {
    (0.6 * accuracy_rate / 100.0 + 0.4 * correlation).clamp(0.0, 1.0)
}

/// Shannon entropy of decided categories, normalised by log2(5).
pub fn category_balance(view: &LedgerView) -> f64 {
    let mut counts: BTreeMap<Category, usize> = BTreeMap::new();
    for decision in view.decisions() {
        *counts.entry(decision.category).or_default() += 1;
    }
    let total: usize = counts.values().sum();
    if total == 0 {
        return 0.0;
    }

    let entropy: f64 = counts
        .values()
        .map(|count| {
            let p = *count as f64 / total as f64;
            -p * p.log2()
        })
        .sum();
    (entropy / (Category::ALL.len() as f64).log2()).clamp(0.0, 1.0)
}

/// Mean share of neighbours that agree with the decided category.
pub fn semantic_coherence(view: &LedgerView) -> f64 {
    let shares: Vec<f64> = view
        .decisions()
        .filter(|d| !d.neighbors.is_empty())
        .map(|d| {
            let agreeing = d.neighbors.iter().filter(|n| n.category == d.category).count();
            agreeing as f64 / d.neighbors.len() as f64
        })
        .collect();

    if shares.is_empty() {
        0.5
    } else {
        shares.iter().sum::<f64>() / shares.len() as f64
    }
}

/// Satisfaction peaks when the correction rate sits between 5% and 15%:
/// fewer suggests users are not giving feedback, more suggests bad output.
pub fn user_satisfaction(decisions: usize, corrections: usize) -> f64 {
    if decisions == 0 {
        return 0.5;
    }
    let rate = corrections as f64 / decisions as f64;
    if rate < 0.05 {
        20.0 * rate
    } else if rate <= 0.15 {
        1.0
    } else {
        (1.0 - 5.0 * (rate - 0.15)).max(0.0)
    }
}

pub fn system_adaptability(adjustments: &[AppliedAdjustment], now: DateTime<Utc>) -> f64 {
    if adjustments.is_empty() {
        return 0.5;
    }
    let distinct: HashSet<_> = adjustments.iter().map(|a| a.adjustment.parameter).collect();
    let cutoff = now - ChronoDuration::days(ADAPTABILITY_WINDOW_DAYS);
    let recent = adjustments.iter().filter(|a| a.applied_at >= cutoff).count();

    let breadth = (distinct.len() as f64 / TUNABLE_PARAMETERS).min(1.0);
    let activity = (recent as f64 / ADAPTABILITY_SATURATION).min(1.0);
    ((breadth + activity) / 2.0).clamp(0.0, 1.0)
}

#[derive(Default)]
struct FactorTally {
    decisions: u64,
    corrected: u64,
    correct_sum: f64,
    corrected_sum: f64,
    confidence_sum: f64,
}

/// Per category and factor: how often the factor contributed to a decision
/// for that category, and its mean contribution to decisions the user kept
/// versus decisions the user corrected. Most used factors come first.
pub fn factor_analysis(view: &LedgerView) -> Vec<FactorStats> {
    let mut tallies: BTreeMap<(Category, String), FactorTally> = BTreeMap::new();

    for outcome in view.outcomes() {
        let decision = outcome.decision;
        let corrected = outcome.is_corrected();
        for (factor, value) in decision.score_breakdown.factors(decision.category) {
            if value == 0.0 {
                continue;
            }
            let tally = tallies
                .entry((decision.category, factor.to_string()))
                .or_default();
            tally.decisions += 1;
            tally.confidence_sum += decision.confidence;
            if corrected {
                tally.corrected += 1;
                tally.corrected_sum += value;
            } else {
                tally.correct_sum += value;
            }
        }
    }

    let mean = |sum: f64, n: u64| if n == 0 { 0.0 } else { sum / n as f64 };
    let mut stats: Vec<FactorStats> = tallies
        .into_iter()
        .map(|((category, factor), t)| FactorStats {
            category,
            factor,
            decisions: t.decisions,
            corrected: t.corrected,
            correction_rate: t.corrected as f64 / t.decisions as f64,
            mean_when_correct: mean(t.correct_sum, t.decisions - t.corrected),
            mean_when_corrected: mean(t.corrected_sum, t.corrected),
            avg_confidence: t.confidence_sum / t.decisions as f64,
        })
        .collect();
    stats.sort_by(|a, b| {
        b.decisions
            .cmp(&a.decisions)
            .then(a.category.cmp(&b.category))
            .then_with(|| a.factor.cmp(&b.factor))
    });
    stats
}

pub fn category_performance(view: &LedgerView) -> Vec<CategoryPerformance> {
    let mut stats: BTreeMap<Category, (u64, u64, f64)> = BTreeMap::new();
    for outcome in view.outcomes() {
        let entry = stats.entry(outcome.decision.category).or_default();
        entry.0 += 1;
        if outcome.is_corrected() {
            entry.1 += 1;
        }
        entry.2 += outcome.decision.confidence;
    }

    stats
        .into_iter()
        .map(|(category, (decisions, corrections, confidence_sum))| CategoryPerformance {
            category,
            decisions,
            corrections,
            correction_rate: corrections as f64 / decisions as f64,
            avg_confidence: confidence_sum / decisions as f64,
        })
        .collect()
}

pub fn progress_of(snapshots: &[LearningSnapshot]) -> LearningProgress {
    let (first, last) = match (snapshots.first(), snapshots.last()) {
        (Some(first), Some(last)) => (first.accuracy_rate, last.accuracy_rate),
        _ => (0.0, 0.0),
    };
    let change = last - first;
    let direction = if change > PROGRESS_EPSILON {
        TrendDirection::Improving
    } else if change < -PROGRESS_EPSILON {
        TrendDirection::Declining
    } else {
        TrendDirection::Stable
    };

    LearningProgress {
        snapshots: snapshots.len(),
        first_accuracy: first,
        last_accuracy: last,
        overall_improvement: change,
        direction,
    }
}

/// Structured, severity-ordered improvement suggestions for a snapshot.
/// `snapshot_count` is the number of stored snapshots.
pub fn suggestions_for(
    snapshot: &LearningSnapshot,
    snapshot_count: usize,
    view: &LedgerView,
) -> Vec<Suggestion> {
    let mut suggestions = Vec::new();
    if snapshot.total_classifications == 0 {
        debug!("No decisions yet, nothing to suggest");
        return suggestions;
    }

    let mut push = |kind, severity, category, message: String, action: &str| {
        suggestions.push(Suggestion {
            kind,
            severity,
            category,
            message,
            action: action.to_string(),
        })
    };

    if snapshot.accuracy_rate < ACCURACY_TARGET {
        push(
            SuggestionKind::LowAccuracy,
            Severity::High,
            None,
            format!(
                "Accuracy is {:.1}%, below the {:.0}% target",
                snapshot.accuracy_rate, ACCURACY_TARGET
            ),
            "Review recent corrections and adjust factor weights for the most corrected categories",
        );
    }

    if snapshot.confidence_correlation < CORRELATION_TARGET {
        push(
            SuggestionKind::PoorCalibration,
            Severity::Medium,
            None,
            format!(
                "Confidence correlates weakly with correctness ({:.2})",
                snapshot.confidence_correlation
            ),
            "Recalibrate the confidence threshold using the tuner",
        );
    }

    if snapshot_count >= 2 && snapshot.learning_velocity < VELOCITY_TARGET {
        push(
            SuggestionKind::SlowLearning,
            Severity::Low,
            None,
            format!("Learning velocity is low ({:.2})", snapshot.learning_velocity),
            "Apply pending tuning proposals or collect more corrections",
        );
    }

    let decisions = view.decision_count();
    if decisions > 0 {
        let rate = view.correction_count() as f64 / decisions as f64;
        if rate < MIN_FEEDBACK_RATE {
            push(
                SuggestionKind::InsufficientFeedback,
                Severity::High,
                None,
                format!("Only {:.1}% of decisions received feedback", rate * 100.0),
                "Review more classifications so the engine has corrections to learn from",
            );
        } else if rate > MAX_FEEDBACK_RATE {
            push(
                SuggestionKind::ExcessiveCorrections,
                Severity::Medium,
                None,
                format!("{:.1}% of decisions were corrected", rate * 100.0),
                "Review the factor weights; the current table disagrees with users often",
            );
        }
    }

    for perf in category_performance(view) {
        if perf.decisions >= CATEGORY_MIN_DECISIONS && perf.correction_rate > CATEGORY_CORRECTION_LIMIT {
            push(
                SuggestionKind::CategoryCorrectionRate,
                Severity::High,
                Some(perf.category),
                format!(
                    "{:.0}% of {} decisions were corrected",
                    perf.correction_rate * 100.0,
                    perf.category
                ),
                "Lower the weights of the factors that push notes into this category",
            );
        }
    }

    if snapshot.category_balance < BALANCE_TARGET {
        push(
            SuggestionKind::CategoryImbalance,
            Severity::Low,
            None,
            format!("Decisions are concentrated (balance {:.2})", snapshot.category_balance),
            "Check whether one category's weights dominate the others",
        );
    }

    suggestions.sort_by(|a, b| b.severity.cmp(&a.severity));
    suggestions
}
