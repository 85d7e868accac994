use chrono::{DateTime, Utc};
use para_schemas::{
    feature, format_contribution, Category, ClassificationDecision, FactorName, FactorWeightTable,
    FeatureSet, NoteId, ScoreBreakdown,
};
use std::collections::BTreeMap;
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::features::{status_class, StatusClass, Vocabulary};
use crate::neighbors::NeighborAnalysis;

// Pattern adjustments. These are fixed constants, not part of the tunable
// weight table.
const MARKERS_COUNTED: usize = 3;
const URGENCY_BOOST: f64 = 0.5;
const URGENCY_ARCHIVE_PENALTY: f64 = 0.5;
const MAINTENANCE_BOOST: f64 = 0.4;
const REFERENCE_BOOST: f64 = 0.4;
const COMPLETION_BOOST: f64 = 0.4;
const COMPLETION_CAP: f64 = 1.0;
const ACTIVE_ARCHIVE_PENALTY: f64 = 0.5;
/// Max adjustment as a fraction of the pre-adjustment raw score.
const ADJUSTMENT_CLAMP: f64 = 0.5;
/// Smallest score the clamp is taken against, so markers still move a
/// category that no weighted factor touched.
const ADJUSTMENT_FLOOR: f64 = 1.0;

const NEIGHBOR_SATURATION: f64 = 20.0;
const TOP_KEYWORDS: usize = 5;

const REPORTED_PATTERNS: &[&str] = &[
    feature::HAS_GOAL,
    feature::HAS_RESPONSIBILITY,
    feature::HAS_DASHBOARD,
    feature::HAS_DEADLINE,
    feature::HAS_IMAGES,
    feature::HAS_TABLES,
    feature::HAS_CODE,
    feature::IN_ARCHIVE_PATH,
    feature::IS_STALE,
];

/// Result of scoring one note, before it is stamped into a decision.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredOutcome {
    /// Final category (Inbox when below threshold).
    pub category: Category,
    /// Highest scoring category, kept even when the outcome is Inbox.
    pub best: Category,
    pub confidence: f64,
    pub raw_scores: BTreeMap<Category, f64>,
    pub breakdown: ScoreBreakdown,
    pub reasoning: String,
}

impl ScoredOutcome {
    pub fn into_decision(
        self,
        note_id: NoteId,
        timestamp: DateTime<Utc>,
        features: FeatureSet,
        neighbors: &NeighborAnalysis,
        oracle_category: Option<Category>,
    ) -> ClassificationDecision {
        ClassificationDecision {
            note_id,
            timestamp,
            category: self.category,
            confidence: self.confidence,
            score_breakdown: self.breakdown,
            neighbors: neighbors.matches.clone(),
            oracle_category,
            reasoning: self.reasoning,
            features,
        }
    }
}

/// Combines features, neighbour affinities and the oracle verdict into a
/// category and a calibrated confidence. Pure: identical inputs give
/// identical outcomes.
pub struct ScoringEngine {
    vocabulary: Vocabulary,
}

impl Default for ScoringEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ScoringEngine {
    pub fn new() -> Self {
        Self {
            vocabulary: Vocabulary::new(),
        }
    }

    pub fn score(
        &self,
        features: &FeatureSet,
        neighbors: &NeighborAnalysis,
        oracle_category: Option<Category>,
        weights: &FactorWeightTable,
    ) -> Result<ScoredOutcome> {
        weights.validate()?;

        let mut breakdown = ScoreBreakdown::new();
        for category in Category::SCORED {
            for (factor, weight) in weights.factors(category) {
                let contribution = weight
                    * self.contribution(factor, category, features, neighbors, oracle_category, weights);
                if contribution != 0.0 {
                    breakdown.record(category, factor.as_str(), contribution);
                }
            }
        }

        let adjustments = self.apply_adjustments(features, &mut breakdown);

        let raw_scores: BTreeMap<Category, f64> = Category::SCORED
            .iter()
            .map(|c| (*c, breakdown.raw_score(*c)))
            .collect();

        let mut best = Category::SCORED[0];
        for category in Category::SCORED {
            if raw_scores[&category] > raw_scores[&best] {
                best = category;
            }
        }
        let best_score = raw_scores[&best];
        let second_score = raw_scores
            .iter()
            .filter(|(c, _)| **c != best)
            .map(|(_, s)| *s)
            .fold(f64::NEG_INFINITY, f64::max);

        let below_threshold = best_score < weights.absolute_threshold() || best_score <= 0.0;
        let category = if below_threshold { Category::Inbox } else { best };

        let confidence = confidence(best_score, second_score, &raw_scores, neighbors.neighbor_count());
        if !confidence.is_finite() || !(0.0..=1.0).contains(&confidence) {
            return Err(EngineError::InvariantViolation(format!(
                "confidence {} outside [0, 1]",
                confidence
            )));
        }

        let reasoning = self.reasoning(
            features,
            neighbors,
            oracle_category,
            &adjustments,
            best,
            best_score,
            second_score,
            below_threshold.then(|| weights.absolute_threshold()),
        );

        debug!(
            "Scored {} (best {} at {:.3}, confidence {:.3})",
            category, best, best_score, confidence
        );

        Ok(ScoredOutcome {
            category,
            best,
            confidence,
            raw_scores,
            breakdown,
            reasoning,
        })
    }

    fn contribution(
        &self,
        factor: FactorName,
        category: Category,
        features: &FeatureSet,
        neighbors: &NeighborAnalysis,
        oracle_category: Option<Category>,
        weights: &FactorWeightTable,
    ) -> f64 {
        let status = features.text(feature::STATUS).and_then(status_class);
        let on = |b: bool| if b { 1.0 } else { 0.0 };

        match factor {
            FactorName::HasGoal => on(features.flag(feature::HAS_GOAL)),
            FactorName::HasResponsibility => on(features.flag(feature::HAS_RESPONSIBILITY)),
            FactorName::HasDashboard => on(features.flag(feature::HAS_DASHBOARD)),
            FactorName::HasDeadline => on(features.flag(feature::HAS_DEADLINE)),
            FactorName::HasImages => on(features.flag(feature::HAS_IMAGES)),
            FactorName::HasTables => on(features.flag(feature::HAS_TABLES)),
            FactorName::HasCode => on(features.flag(feature::HAS_CODE)),
            FactorName::HasLinks => on(features.count(feature::N_LINKS) > 0),
            FactorName::StatusActive => on(status == Some(StatusClass::Active)),
            FactorName::StatusCompleted => on(status == Some(StatusClass::Completed)),
            FactorName::InArchivePath => on(features.flag(feature::IN_ARCHIVE_PATH)),
            FactorName::IsStale => on(features.flag(feature::IS_STALE)),
            FactorName::PendingTasks => features.count(feature::N_PENDING) as f64,
            FactorName::CompletedTasks => features.count(feature::N_COMPLETED) as f64,
            FactorName::DomainKeywords => self.keywords_for(features, category).len() as f64,
            FactorName::Neighbors => neighbors.affinity(category) * weights.semantic_weight(),
            FactorName::Oracle => on(oracle_category == Some(category)),
        }
    }

    fn keywords_for<'a>(&self, features: &'a FeatureSet, category: Category) -> Vec<&'a str> {
        features
            .set(feature::DOMAIN_KEYWORDS)
            .map(|keywords| {
                keywords
                    .iter()
                    .filter(|k| self.vocabulary.category_of(k) == Some(category))
                    .map(String::as_str)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Second pass of signed corrections keyed on keyword clusters. Returns
    /// the applied (post-clamp) adjustments for the reasoning trace.
    fn apply_adjustments(
        &self,
        features: &FeatureSet,
        breakdown: &mut ScoreBreakdown,
    ) -> Vec<(Category, &'static str, f64)> {
        let markers = |name: &str| features.set_len(name).min(MARKERS_COUNTED) as f64;

        let urgency = markers(feature::URGENCY_MARKERS);
        let maintenance = markers(feature::MAINTENANCE_MARKERS);
        let reference = markers(feature::REFERENCE_MARKERS);
        let completion = markers(feature::COMPLETION_MARKERS);

        let status_active = features
            .text(feature::STATUS)
            .and_then(status_class)
            == Some(StatusClass::Active);
        let active_signals = markers(feature::ACTIVE_MARKERS)
            + if features.count(feature::N_PENDING) > 0 { 1.0 } else { 0.0 }
            + if status_active { 1.0 } else { 0.0 };

        let proposed: [(Category, &'static str, f64); 6] = [
            (Category::Projects, "urgency", URGENCY_BOOST * urgency),
            (Category::Areas, "maintenance", MAINTENANCE_BOOST * maintenance),
            (Category::Resources, "reference", REFERENCE_BOOST * reference),
            (Category::Archive, "urgency", -URGENCY_ARCHIVE_PENALTY * urgency),
            (Category::Archive, "completion", (COMPLETION_BOOST * completion).min(COMPLETION_CAP)),
            (Category::Archive, "active", -ACTIVE_ARCHIVE_PENALTY * active_signals),
        ];

        let mut applied = Vec::new();
        for category in Category::SCORED {
            let entries: Vec<(&'static str, f64)> = proposed
                .iter()
                .filter(|(c, _, amount)| *c == category && *amount != 0.0)
                .map(|(_, name, amount)| (*name, *amount))
                .collect();
            if entries.is_empty() {
                continue;
            }

            let base = breakdown.raw_score(category).abs().max(ADJUSTMENT_FLOOR);
            let limit = ADJUSTMENT_CLAMP * base;
            let total: f64 = entries.iter().map(|(_, a)| a).sum();
            let ratio = if total.abs() > limit {
                if total == 0.0 { 0.0 } else { limit / total.abs() }
            } else {
                1.0
            };

            for (name, amount) in entries {
                let scaled = amount * ratio;
                if scaled != 0.0 {
                    breakdown.record(category, &format!("adjust:{}", name), scaled);
                    applied.push((category, name, scaled));
                }
            }
        }

        applied
    }

    #[allow(clippy::too_many_arguments)]
    fn reasoning(
        &self,
        features: &FeatureSet,
        neighbors: &NeighborAnalysis,
        oracle_category: Option<Category>,
        adjustments: &[(Category, &'static str, f64)],
        best: Category,
        best_score: f64,
        second_score: f64,
        fallback_threshold: Option<f64>,
    ) -> String {
        let mut parts = Vec::new();

        let matched: Vec<String> = neighbors
            .summary
            .iter()
            .filter(|(_, s)| s.count > 0)
            .map(|(c, s)| format!("{} {} (avg distance {:.2})", s.count, c, s.avg_distance))
            .collect();
        parts.push(if matched.is_empty() {
            "neighbors: none".to_string()
        } else {
            format!("neighbors: {}", matched.join(", "))
        });

        let fired: Vec<&str> = REPORTED_PATTERNS
            .iter()
            .copied()
            .filter(|name| features.flag(name))
            .collect();
        let mut pattern_part = if fired.is_empty() {
            "patterns: none".to_string()
        } else {
            format!("patterns: {}", fired.join(", "))
        };
        let pending = features.count(feature::N_PENDING);
        if pending > 0 {
            pattern_part.push_str(&format!(", {} pending tasks", pending));
        }
        if let Some(status) = features.text(feature::STATUS) {
            pattern_part.push_str(&format!(", status '{}'", status));
        }
        parts.push(pattern_part);

        // Keywords of the winning category first
        let mut keywords = self.keywords_for(features, best);
        for category in Category::SCORED {
            if category != best {
                keywords.extend(self.keywords_for(features, category));
            }
        }
        keywords.truncate(TOP_KEYWORDS);
        if !keywords.is_empty() {
            parts.push(format!("keywords: {}", keywords.join(", ")));
        }

        if let Some(oracle) = oracle_category {
            parts.push(format!("oracle: {}", oracle));
        }

        if !adjustments.is_empty() {
            let rendered: Vec<String> = adjustments
                .iter()
                .map(|(c, name, amount)| format!("{} {} {}", name, format_contribution(*amount), c))
                .collect();
            parts.push(format!("adjustments: {}", rendered.join(", ")));
        }

        let runner_up = if second_score.is_finite() { second_score } else { 0.0 };
        match fallback_threshold {
            Some(threshold) => parts.push(format!(
                "best {} scored {:.2} (threshold {:.2}), routed to Inbox",
                best, best_score, threshold
            )),
            None => parts.push(format!(
                "chose {} with {:.2} (runner-up {:.2})",
                best, best_score, runner_up
            )),
        }

        parts.join("; ")
    }
}

/// `clamp01(0.6*normalize(best) + 0.3*min(1, 2*(best - second)) + 0.1*min(1, n/20))`
/// where `normalize(best)` is best's share of all positive raw scores.
pub fn confidence(
    best_score: f64,
    second_score: f64,
    raw_scores: &BTreeMap<Category, f64>,
    neighbor_count: usize,
) -> f64 {
    let positive_sum: f64 = raw_scores.values().filter(|s| **s > 0.0).sum();
    let normalized = if positive_sum > 0.0 {
        best_score.max(0.0) / positive_sum
    } else {
        0.0
    };

    let second = if second_score.is_finite() { second_score } else { 0.0 };
    let separation = (2.0 * (best_score - second)).clamp(0.0, 1.0);
    let evidence = (neighbor_count as f64 / NEIGHBOR_SATURATION).min(1.0);

    (0.6 * normalized + 0.3 * separation + 0.1 * evidence).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use para_schemas::{FeatureValue, NeighborMatch};
    use std::collections::BTreeSet;

    fn engine() -> ScoringEngine {
        ScoringEngine::new()
    }

    fn markers(words: &[&str]) -> FeatureValue {
        FeatureValue::Set(words.iter().map(|w| w.to_string()).collect::<BTreeSet<_>>())
    }

    #[test]
    fn test_oracle_weight_decides_projects() {
        let mut weights = FactorWeightTable::zeroed()
            .with_weight(Category::Projects, FactorName::Oracle, 10.0)
            .unwrap();
        weights.set_absolute_threshold(5.0).unwrap();

        let outcome = engine()
            .score(
                &FeatureSet::new(),
                &NeighborAnalysis::empty(),
                Some(Category::Projects),
                &weights,
            )
            .unwrap();

        assert_eq!(outcome.category, Category::Projects);
        assert_eq!(
            outcome.breakdown.formatted(Category::Projects, "oracle").as_deref(),
            Some("+10")
        );
        assert!((outcome.confidence - 0.9).abs() < 1e-9);
        assert!(outcome.reasoning.contains("oracle: Projects"));
    }

    #[test]
    fn test_all_zero_input_goes_to_inbox() {
        let outcome = engine()
            .score(
                &FeatureSet::new(),
                &NeighborAnalysis::empty(),
                None,
                &FactorWeightTable::zeroed(),
            )
            .unwrap();

        assert_eq!(outcome.category, Category::Inbox);
        assert!(outcome.raw_scores.values().all(|s| *s == 0.0));
        assert_eq!(outcome.confidence, 0.0);
        assert!(outcome.reasoning.contains("routed to Inbox"));
    }

    #[test]
    fn test_below_absolute_threshold_keeps_breakdown() {
        let mut weights = FactorWeightTable::zeroed()
            .with_weight(Category::Areas, FactorName::HasResponsibility, 2.0)
            .unwrap();
        weights.set_absolute_threshold(3.0).unwrap();
        let features = FeatureSet::new().with(feature::HAS_RESPONSIBILITY, FeatureValue::Flag(true));

        let outcome = engine()
            .score(&features, &NeighborAnalysis::empty(), None, &weights)
            .unwrap();

        assert_eq!(outcome.category, Category::Inbox);
        assert_eq!(outcome.best, Category::Areas);
        assert_eq!(
            outcome.breakdown.formatted(Category::Areas, "has_responsibility").as_deref(),
            Some("+2")
        );
    }

    #[test]
    fn test_ties_resolve_in_category_order() {
        let weights = FactorWeightTable::zeroed()
            .with_weight(Category::Areas, FactorName::HasGoal, 2.0)
            .unwrap()
            .with_weight(Category::Projects, FactorName::HasGoal, 2.0)
            .unwrap();
        let features = FeatureSet::new().with(feature::HAS_GOAL, FeatureValue::Flag(true));

        let outcome = engine()
            .score(&features, &NeighborAnalysis::empty(), None, &weights)
            .unwrap();
        assert_eq!(outcome.category, Category::Projects);
        // No separation from the runner-up
        assert!((outcome.confidence - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_counts_keywords_and_neighbors_contribute() {
        let weights = FactorWeightTable::zeroed()
            .with_weight(Category::Projects, FactorName::PendingTasks, 0.5)
            .unwrap()
            .with_weight(Category::Projects, FactorName::DomainKeywords, 1.0)
            .unwrap()
            .with_weight(Category::Projects, FactorName::Neighbors, 4.0)
            .unwrap();
        let features = FeatureSet::new()
            .with(feature::N_PENDING, FeatureValue::Count(4))
            .with(feature::DOMAIN_KEYWORDS, markers(&["sprint", "roadmap", "receta"]));
        let neighbors = NeighborAnalysis::from_matches(vec![NeighborMatch {
            category: Category::Projects,
            distance: 0.5,
        }]);

        let outcome = engine().score(&features, &neighbors, None, &weights).unwrap();
        let b = &outcome.breakdown;
        assert_eq!(b.formatted(Category::Projects, "pending_tasks").as_deref(), Some("+2"));
        assert_eq!(b.formatted(Category::Projects, "domain_keywords").as_deref(), Some("+2"));
        // affinity 0.5 * semantic_weight 0.5 * weight 4
        assert_eq!(b.formatted(Category::Projects, "neighbors").as_deref(), Some("+1"));
        assert!(outcome.reasoning.contains("keywords: roadmap, sprint, receta"));
        assert!(outcome.reasoning.contains("1 Projects"));
    }

    #[test]
    fn test_adjustments_are_clamped_to_half_of_raw_score() {
        let weights = FactorWeightTable::zeroed()
            .with_weight(Category::Archive, FactorName::InArchivePath, 1.0)
            .unwrap();
        let features = FeatureSet::new()
            .with(feature::IN_ARCHIVE_PATH, FeatureValue::Flag(true))
            .with(
                feature::COMPLETION_MARKERS,
                markers(&["completed", "obsolete", "done", "archived"]),
            );

        let outcome = engine()
            .score(&features, &NeighborAnalysis::empty(), None, &weights)
            .unwrap();
        assert_eq!(
            outcome.breakdown.formatted(Category::Archive, "adjust:completion").as_deref(),
            Some("+0.5")
        );
        assert!((outcome.raw_scores[&Category::Archive] - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_markers_move_unscored_category_within_floor() {
        let weights = FactorWeightTable::zeroed()
            .with_weight(Category::Areas, FactorName::HasResponsibility, 0.2)
            .unwrap();
        let features = FeatureSet::new()
            .with(feature::HAS_RESPONSIBILITY, FeatureValue::Flag(true))
            .with(feature::URGENCY_MARKERS, markers(&["urgent", "asap"]));

        let outcome = engine()
            .score(&features, &NeighborAnalysis::empty(), None, &weights)
            .unwrap();

        // Two markers propose +1.0; a zero score is clamped against the floor
        assert_eq!(
            outcome.breakdown.formatted(Category::Projects, "adjust:urgency").as_deref(),
            Some("+0.5")
        );
        assert!((outcome.raw_scores[&Category::Projects] - 0.5).abs() < 1e-9);
        assert!((outcome.raw_scores[&Category::Archive] + 0.5).abs() < 1e-9);
        assert_eq!(outcome.best, Category::Projects);
    }

    #[test]
    fn test_active_content_reverses_archive_bias() {
        let weights = FactorWeightTable::zeroed()
            .with_weight(Category::Archive, FactorName::StatusCompleted, 4.0)
            .unwrap()
            .with_weight(Category::Projects, FactorName::PendingTasks, 1.0)
            .unwrap();
        let features = FeatureSet::new()
            .with(feature::STATUS, FeatureValue::Text("done".into()))
            .with(feature::N_PENDING, FeatureValue::Count(3))
            .with(feature::COMPLETION_MARKERS, markers(&["done"]))
            .with(feature::ACTIVE_MARKERS, markers(&["in progress", "pending"]))
            .with(feature::URGENCY_MARKERS, markers(&["urgent"]));

        let outcome = engine()
            .score(&features, &NeighborAnalysis::empty(), None, &weights)
            .unwrap();

        // Archive: 4 + 0.4 - 0.5 - 1.5, total -1.6 stays inside the 2.0 clamp
        assert!((outcome.raw_scores[&Category::Archive] - 2.4).abs() < 1e-9);
        // Projects: 3 pending + urgency 0.5
        assert!((outcome.raw_scores[&Category::Projects] - 3.5).abs() < 1e-9);
        assert_eq!(outcome.category, Category::Projects);
        assert!(outcome.reasoning.contains("adjustments:"));
    }

    #[test]
    fn test_determinism() {
        let weights = FactorWeightTable::default();
        let features = FeatureSet::new()
            .with(feature::HAS_GOAL, FeatureValue::Flag(true))
            .with(feature::N_PENDING, FeatureValue::Count(2))
            .with(feature::DOMAIN_KEYWORDS, markers(&["sprint"]));
        let neighbors = NeighborAnalysis::from_matches(vec![
            NeighborMatch { category: Category::Projects, distance: 0.1 },
            NeighborMatch { category: Category::Areas, distance: 0.7 },
        ]);

        let a = engine().score(&features, &neighbors, Some(Category::Projects), &weights).unwrap();
        let b = engine().score(&features, &neighbors, Some(Category::Projects), &weights).unwrap();
        assert_eq!(a, b);
        assert_eq!(
            serde_json::to_string(&a.breakdown).unwrap(),
            serde_json::to_string(&b.breakdown).unwrap()
        );
    }

    #[test]
    fn test_confidence_formula() {
        let scores: BTreeMap<Category, f64> = [
            (Category::Projects, 3.0),
            (Category::Areas, 1.0),
            (Category::Resources, 0.0),
            (Category::Archive, -1.0),
        ]
        .into_iter()
        .collect();
        // 0.6 * 0.75 + 0.3 * 1 + 0.1 * 0.5
        assert!((confidence(3.0, 1.0, &scores, 10) - 0.8).abs() < 1e-9);
        assert_eq!(confidence(0.0, f64::NEG_INFINITY, &BTreeMap::new(), 0), 0.0);
    }
}
