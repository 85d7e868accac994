use chrono::{Duration as ChronoDuration, Utc};
use para_schemas::{
    Adjustment, AppliedAdjustment, FactorWeightTable, LearningSnapshot, TunableParameter,
};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::ledger::{FeedbackLedger, LedgerView};
use crate::weights::{SharedWeights, WeightStore};

pub const THRESHOLD_CANDIDATES: [f64; 5] = [0.5, 0.6, 0.7, 0.8, 0.9];
/// Minimum distance between the best and current threshold worth proposing.
const THRESHOLD_TOLERANCE: f64 = 0.05;
/// Correction rate (percent) above which neighbours get more say.
const CORRECTION_RATE_LIMIT: f64 = 15.0;
const SEMANTIC_STEP: f64 = 0.1;
const SEMANTIC_CAP: f64 = 0.8;

/// Proposes parameter changes from ledger evidence and applies confirmed
/// ones to the live weight table.
pub struct AutoTuner {
    ledger: Arc<FeedbackLedger>,
    store: Arc<WeightStore>,
    weights: SharedWeights,
    window: Option<ChronoDuration>,
    apply_lock: Mutex<()>,
}

impl AutoTuner {
    pub fn new(
        ledger: Arc<FeedbackLedger>,
        store: Arc<WeightStore>,
        weights: SharedWeights,
        window_days: Option<u32>,
    ) -> Self {
        Self {
            ledger,
            store,
            weights,
            window: window_days.map(|d| ChronoDuration::days(d as i64)),
            apply_lock: Mutex::new(()),
        }
    }

    pub fn propose_adjustments(
        &self,
        snapshot: &LearningSnapshot,
        current: &FactorWeightTable,
    ) -> Result<Vec<Adjustment>> {
        let view = self.ledger.read_view(self.window.map(|w| Utc::now() - w))?;
        let proposals = proposals_for(snapshot, current, &view);
        debug!("Tuner proposed {} adjustments", proposals.len());
        Ok(proposals)
    }

    /// Apply confirmed adjustments: build and validate a new table, persist
    /// it as a new version with the adjustment log, then swap it in.
    pub fn apply(&self, adjustments: &[Adjustment]) -> Result<FactorWeightTable> {
        let _guard = self.apply_lock.lock().unwrap_or_else(|e| e.into_inner());
        let live = self.weights.current();
        if adjustments.is_empty() {
            return Ok((*live).clone());
        }

        let mut next = (*live).clone();
        let mut recorded = Vec::with_capacity(adjustments.len());
        for adjustment in adjustments {
            let live_value = match adjustment.parameter {
                TunableParameter::ConfidenceThreshold => live.confidence_threshold(),
                TunableParameter::SemanticWeight => live.semantic_weight(),
            };
            if (live_value - adjustment.current).abs() > f64::EPSILON {
                warn!(
                    "Adjustment for {} was proposed against {} but live value is {}",
                    adjustment.parameter.as_str(),
                    adjustment.current,
                    live_value
                );
            }

            match adjustment.parameter {
                TunableParameter::ConfidenceThreshold => {
                    next.set_confidence_threshold(adjustment.proposed)?
                }
                TunableParameter::SemanticWeight => next.set_semantic_weight(adjustment.proposed)?,
            }
            // The log keeps the value actually replaced
            recorded.push(Adjustment {
                current: live_value,
                ..adjustment.clone()
            });
        }
        next.validate()?;

        let (version, applied) = self.store.save_tuned(&next, &recorded)?;
        for record in &applied {
            info!(
                "Applied adjustment {}: {} {} -> {} ({})",
                record.id,
                record.adjustment.parameter.as_str(),
                record.adjustment.current,
                record.adjustment.proposed,
                record.adjustment.reason
            );
        }
        self.weights.swap(next.clone(), version);
        info!("Weight table version {} is live", version);

        Ok(next)
    }

    /// Make an imported table live as a new version, attaching its
    /// adjustment log. Returns the version and how many log entries were new.
    pub fn adopt(
        &self,
        table: &FactorWeightTable,
        adjustments: &[AppliedAdjustment],
    ) -> Result<(i64, usize)> {
        let _guard = self.apply_lock.lock().unwrap_or_else(|e| e.into_inner());
        let (version, added) = self.store.save_imported(table, adjustments)?;
        self.weights.swap(table.clone(), version);
        info!(
            "Imported weight table is live as version {} ({} new adjustments)",
            version, added
        );
        Ok((version, added))
    }
}

/// Threshold with the lowest error rate among candidates that have at least
/// one decision at or above them. Returns `(threshold, error_rate)`.
pub fn best_threshold(view: &LedgerView) -> Option<(f64, f64)> {
    let outcomes = view.outcomes();
    let mut best: Option<(f64, f64)> = None;

    for threshold in THRESHOLD_CANDIDATES {
        let above: Vec<_> = outcomes
            .iter()
            .filter(|o| o.decision.confidence >= threshold)
            .collect();
        if above.is_empty() {
            continue;
        }
        let errors = above.iter().filter(|o| o.is_corrected()).count();
        let error_rate = errors as f64 / above.len() as f64;

        // Strict comparison keeps the lower threshold on ties
        if best.map(|(_, e)| error_rate < e).unwrap_or(true) {
            best = Some((threshold, error_rate));
        }
    }

    best
}

pub fn proposals_for(
    snapshot: &LearningSnapshot,
    current: &FactorWeightTable,
    view: &LedgerView,
) -> Vec<Adjustment> {
    let mut proposals = Vec::new();

    if let Some((threshold, error_rate)) = best_threshold(view) {
        let existing = current.confidence_threshold();
        if (threshold - existing).abs() > THRESHOLD_TOLERANCE {
            proposals.push(Adjustment {
                parameter: TunableParameter::ConfidenceThreshold,
                current: existing,
                proposed: threshold,
                reason: format!(
                    "error rate {:.1}% at threshold {:.1} is the lowest observed",
                    error_rate * 100.0,
                    threshold
                ),
            });
        }
    }

    let correction_rate = 100.0 - snapshot.accuracy_rate;
    if snapshot.total_classifications > 0 && correction_rate > CORRECTION_RATE_LIMIT {
        let existing = current.semantic_weight();
        let proposed = (existing + SEMANTIC_STEP).min(SEMANTIC_CAP);
        if proposed > existing {
            proposals.push(Adjustment {
                parameter: TunableParameter::SemanticWeight,
                current: existing,
                proposed,
                reason: format!(
                    "correction rate {:.1}% exceeds {:.0}%; lean more on similar notes",
                    correction_rate, CORRECTION_RATE_LIMIT
                ),
            });
        }
    }

    proposals
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone};
    use para_schemas::{
        Category, ClassificationDecision, FeatureSet, FeedbackCorrection, LedgerEntry, NoteId,
        ScoreBreakdown,
    };
    use std::time::Duration;
    use tempfile::TempDir;

    use crate::metrics::snapshot_from;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn decision(note: &str, confidence: f64, secs: i64) -> ClassificationDecision {
        ClassificationDecision {
            note_id: NoteId::new(note),
            timestamp: at(secs),
            category: Category::Projects,
            confidence,
            score_breakdown: ScoreBreakdown::new(),
            neighbors: Vec::new(),
            oracle_category: None,
            reasoning: String::new(),
            features: FeatureSet::new(),
        }
    }

    fn correction(note: &str, secs: i64) -> FeedbackCorrection {
        FeedbackCorrection {
            note_id: NoteId::new(note),
            original_category: Category::Projects,
            corrected_category: Category::Areas,
            reason: Some("belongs to an area".into()),
            timestamp: at(secs),
        }
    }

    /// Low-confidence decisions all corrected, high-confidence ones all right.
    fn split_view() -> LedgerView {
        let mut entries = Vec::new();
        for i in 0..4 {
            entries.push(LedgerEntry::Decision(decision(&format!("low{}", i), 0.55, i)));
            entries.push(LedgerEntry::Decision(decision(&format!("high{}", i), 0.85, i)));
        }
        for i in 0..4 {
            entries.push(LedgerEntry::Correction(correction(&format!("low{}", i), 10 + i)));
        }
        LedgerView { entries }
    }

    #[test]
    fn test_best_threshold_prefers_lowest_error_then_lowest_value() {
        let view = split_view();
        let (threshold, error) = best_threshold(&view).unwrap();
        assert_eq!(threshold, 0.6);
        assert_eq!(error, 0.0);
        assert!(best_threshold(&LedgerView::default()).is_none());
    }

    #[test]
    fn test_proposals_for_threshold_and_semantic_weight() {
        let view = split_view();
        let snapshot = snapshot_from(&view, &[], &[], at(100));
        assert_eq!(snapshot.accuracy_rate, 50.0);

        let proposals = proposals_for(&snapshot, &FactorWeightTable::default(), &view);
        assert_eq!(proposals.len(), 2);
        assert_eq!(proposals[0].parameter, TunableParameter::ConfidenceThreshold);
        assert_eq!(proposals[0].proposed, 0.6);
        assert_eq!(proposals[1].parameter, TunableParameter::SemanticWeight);
        assert!((proposals[1].proposed - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_no_proposals_when_close_enough() {
        let view = split_view();
        let snapshot = snapshot_from(&view, &[], &[], at(100));
        let mut table = FactorWeightTable::default();
        table.set_confidence_threshold(0.62).unwrap();
        table.set_semantic_weight(0.8).unwrap();

        assert!(proposals_for(&snapshot, &table, &view).is_empty());
    }

    #[test]
    fn test_apply_persists_version_and_swaps_live_table() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("para.db");
        let ledger = Arc::new(FeedbackLedger::open(&path, Duration::from_millis(1)).unwrap());
        let store = Arc::new(WeightStore::open(&path).unwrap());
        let (version, table) = store.load_or_init(None).unwrap();
        let shared = SharedWeights::new(table, version);

        let tuner = AutoTuner::new(ledger, store.clone(), shared.clone(), None);
        let before = shared.current();

        let applied = tuner
            .apply(&[Adjustment {
                parameter: TunableParameter::ConfidenceThreshold,
                current: 0.7,
                proposed: 0.6,
                reason: "test".into(),
            }])
            .unwrap();

        assert_eq!(applied.confidence_threshold(), 0.6);
        assert_eq!(shared.current().confidence_threshold(), 0.6);
        assert_eq!(before.confidence_threshold(), 0.7);
        assert_eq!(shared.version(), 2);
        assert_eq!(store.version_count().unwrap(), 2);
        assert_eq!(store.adjustments(None).unwrap().len(), 1);
    }

    #[test]
    fn test_apply_logs_live_value_for_stale_proposal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("para.db");
        let ledger = Arc::new(FeedbackLedger::open(&path, Duration::from_millis(1)).unwrap());
        let store = Arc::new(WeightStore::open(&path).unwrap());
        let (version, table) = store.load_or_init(None).unwrap();
        let shared = SharedWeights::new(table, version);
        let tuner = AutoTuner::new(ledger, store.clone(), shared.clone(), None);

        tuner
            .apply(&[Adjustment {
                parameter: TunableParameter::SemanticWeight,
                current: 0.9,
                proposed: 0.6,
                reason: "stale".into(),
            }])
            .unwrap();

        let logged = store.adjustments(None).unwrap();
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].adjustment.current, 0.5);
        assert_eq!(logged[0].adjustment.proposed, 0.6);
    }

    #[test]
    fn test_adopt_swaps_imported_table() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("para.db");
        let ledger = Arc::new(FeedbackLedger::open(&path, Duration::from_millis(1)).unwrap());
        let store = Arc::new(WeightStore::open(&path).unwrap());
        let (version, table) = store.load_or_init(None).unwrap();
        let shared = SharedWeights::new(table.clone(), version);
        let tuner = AutoTuner::new(ledger, store.clone(), shared.clone(), None);

        let mut imported = table;
        imported.set_confidence_threshold(0.8).unwrap();
        let (adopted, added) = tuner.adopt(&imported, &[]).unwrap();

        assert_eq!(adopted, 2);
        assert_eq!(added, 0);
        assert_eq!(shared.version(), 2);
        assert_eq!(shared.current().confidence_threshold(), 0.8);
        assert_eq!(store.latest().unwrap(), Some((2, imported)));
    }

    #[test]
    fn test_apply_rejects_out_of_range_values() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("para.db");
        let ledger = Arc::new(FeedbackLedger::open(&path, Duration::from_millis(1)).unwrap());
        let store = Arc::new(WeightStore::open(&path).unwrap());
        let shared = SharedWeights::new(FactorWeightTable::default(), 0);
        let tuner = AutoTuner::new(ledger, store.clone(), shared.clone(), None);

        let result = tuner.apply(&[Adjustment {
            parameter: TunableParameter::SemanticWeight,
            current: 0.5,
            proposed: 1.5,
            reason: "bad".into(),
        }]);
        assert!(result.is_err());
        assert_eq!(shared.current().semantic_weight(), 0.5);
        assert_eq!(store.version_count().unwrap(), 0);
    }
}
