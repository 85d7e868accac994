use crate::Category;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A single named input contributing to a category's raw score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactorName {
    HasGoal,
    HasResponsibility,
    HasDashboard,
    HasDeadline,
    HasImages,
    HasTables,
    HasCode,
    HasLinks,
    StatusActive,
    StatusCompleted,
    InArchivePath,
    IsStale,
    PendingTasks,
    CompletedTasks,
    DomainKeywords,
    Neighbors,
    Oracle,
}

impl FactorName {
    pub const ALL: [FactorName; 17] = [
        FactorName::HasGoal,
        FactorName::HasResponsibility,
        FactorName::HasDashboard,
        FactorName::HasDeadline,
        FactorName::HasImages,
        FactorName::HasTables,
        FactorName::HasCode,
        FactorName::HasLinks,
        FactorName::StatusActive,
        FactorName::StatusCompleted,
        FactorName::InArchivePath,
        FactorName::IsStale,
        FactorName::PendingTasks,
        FactorName::CompletedTasks,
        FactorName::DomainKeywords,
        FactorName::Neighbors,
        FactorName::Oracle,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FactorName::HasGoal => "has_goal",
            FactorName::HasResponsibility => "has_responsibility",
            FactorName::HasDashboard => "has_dashboard",
            FactorName::HasDeadline => "has_deadline",
            FactorName::HasImages => "has_images",
            FactorName::HasTables => "has_tables",
            FactorName::HasCode => "has_code",
            FactorName::HasLinks => "has_links",
            FactorName::StatusActive => "status_active",
            FactorName::StatusCompleted => "status_completed",
            FactorName::InArchivePath => "in_archive_path",
            FactorName::IsStale => "is_stale",
            FactorName::PendingTasks => "pending_tasks",
            FactorName::CompletedTasks => "completed_tasks",
            FactorName::DomainKeywords => "domain_keywords",
            FactorName::Neighbors => "neighbors",
            FactorName::Oracle => "oracle",
        }
    }
}

impl fmt::Display for FactorName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FactorName {
    type Err = WeightTableError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FactorName::ALL
            .into_iter()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| WeightTableError::UnknownFactor(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum WeightTableError {
    #[error("unknown factor name: {0}")]
    UnknownFactor(String),

    #[error("unknown category: {0}")]
    UnknownCategory(String),

    #[error("{0} does not take factor weights")]
    UnscoredCategory(Category),

    #[error("weight {category}/{factor} must be finite and non-negative, got {value}")]
    InvalidWeight {
        category: Category,
        factor: FactorName,
        value: f64,
    },

    #[error("{name} must be within [{min}, {max}], got {value}")]
    ScalarOutOfRange {
        name: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
}

pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.7;
pub const DEFAULT_SEMANTIC_WEIGHT: f64 = 0.5;
pub const DEFAULT_ABSOLUTE_THRESHOLD: f64 = 1.0;

/// Tunable scoring configuration: `(Category, FactorName) -> weight` plus the
/// global scalars. Every constructor and mutator validates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawWeightTable", into = "RawWeightTable")]
pub struct FactorWeightTable {
    weights: BTreeMap<(Category, FactorName), f64>,
    confidence_threshold: f64,
    semantic_weight: f64,
    absolute_threshold: f64,
}

impl Default for FactorWeightTable {
    fn default() -> Self {
        use Category::*;
        use FactorName::*;

        let entries: &[(Category, FactorName, f64)] = &[
            (Projects, HasGoal, 2.0),
            (Projects, HasDeadline, 2.0),
            (Projects, PendingTasks, 0.5),
            (Projects, CompletedTasks, 0.2),
            (Projects, StatusActive, 1.0),
            (Projects, DomainKeywords, 0.6),
            (Projects, Neighbors, 8.0),
            (Projects, Oracle, 3.0),
            (Areas, HasResponsibility, 2.5),
            (Areas, HasDashboard, 1.0),
            (Areas, StatusActive, 0.5),
            (Areas, DomainKeywords, 0.6),
            (Areas, Neighbors, 8.0),
            (Areas, Oracle, 3.0),
            (Resources, HasImages, 0.5),
            (Resources, HasTables, 0.8),
            (Resources, HasCode, 1.0),
            (Resources, HasLinks, 0.3),
            (Resources, DomainKeywords, 0.6),
            (Resources, Neighbors, 8.0),
            (Resources, Oracle, 3.0),
            (Archive, StatusCompleted, 2.5),
            (Archive, CompletedTasks, 0.3),
            (Archive, InArchivePath, 1.5),
            (Archive, IsStale, 1.0),
            (Archive, DomainKeywords, 0.6),
            (Archive, Neighbors, 8.0),
            (Archive, Oracle, 3.0),
        ];

        Self {
            weights: entries.iter().map(|(c, f, w)| ((*c, *f), *w)).collect(),
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            semantic_weight: DEFAULT_SEMANTIC_WEIGHT,
            absolute_threshold: DEFAULT_ABSOLUTE_THRESHOLD,
        }
    }
}

impl FactorWeightTable {
    /// Table with every weight at zero and default scalars.
    pub fn zeroed() -> Self {
        Self {
            weights: BTreeMap::new(),
            ..Self::default()
        }
    }

    pub fn weight(&self, category: Category, factor: FactorName) -> f64 {
        self.weights.get(&(category, factor)).copied().unwrap_or(0.0)
    }

    /// Non-zero weights of one category, in factor order.
    pub fn factors(&self, category: Category) -> impl Iterator<Item = (FactorName, f64)> + '_ {
        self.weights
            .iter()
            .filter(move |((c, _), w)| *c == category && **w != 0.0)
            .map(|((_, f), w)| (*f, *w))
    }

    pub fn confidence_threshold(&self) -> f64 {
        self.confidence_threshold
    }

    pub fn semantic_weight(&self) -> f64 {
        self.semantic_weight
    }

    pub fn absolute_threshold(&self) -> f64 {
        self.absolute_threshold
    }

    pub fn set_weight(
        &mut self,
        category: Category,
        factor: FactorName,
        value: f64,
    ) -> Result<(), WeightTableError> {
        check_weight(category, factor, value)?;
        self.weights.insert((category, factor), value);
        Ok(())
    }

    pub fn with_weight(
        mut self,
        category: Category,
        factor: FactorName,
        value: f64,
    ) -> Result<Self, WeightTableError> {
        self.set_weight(category, factor, value)?;
        Ok(self)
    }

    pub fn set_confidence_threshold(&mut self, value: f64) -> Result<(), WeightTableError> {
        check_scalar("confidence_threshold", value, 0.0, 1.0)?;
        self.confidence_threshold = value;
        Ok(())
    }

    pub fn set_semantic_weight(&mut self, value: f64) -> Result<(), WeightTableError> {
        check_scalar("semantic_weight", value, 0.0, 1.0)?;
        self.semantic_weight = value;
        Ok(())
    }

    pub fn set_absolute_threshold(&mut self, value: f64) -> Result<(), WeightTableError> {
        check_scalar("absolute_threshold", value, 0.0, f64::MAX)?;
        self.absolute_threshold = value;
        Ok(())
    }

    /// Re-check every invariant of the table.
    pub fn validate(&self) -> Result<(), WeightTableError> {
        check_scalar("confidence_threshold", self.confidence_threshold, 0.0, 1.0)?;
        check_scalar("semantic_weight", self.semantic_weight, 0.0, 1.0)?;
        check_scalar("absolute_threshold", self.absolute_threshold, 0.0, f64::MAX)?;
        for ((category, factor), value) in &self.weights {
            check_weight(*category, *factor, *value)?;
        }
        Ok(())
    }
}

fn check_weight(category: Category, factor: FactorName, value: f64) -> Result<(), WeightTableError> {
    if !category.is_scored() {
        return Err(WeightTableError::UnscoredCategory(category));
    }
    if !value.is_finite() || value < 0.0 {
        return Err(WeightTableError::InvalidWeight {
            category,
            factor,
            value,
        });
    }
    Ok(())
}

fn check_scalar(name: &'static str, value: f64, min: f64, max: f64) -> Result<(), WeightTableError> {
    if !value.is_finite() || value < min || value > max {
        return Err(WeightTableError::ScalarOutOfRange {
            name,
            value,
            min,
            max,
        });
    }
    Ok(())
}

// ============================================================================
// Serialized form
// ============================================================================

fn default_confidence_threshold() -> f64 {
    DEFAULT_CONFIDENCE_THRESHOLD
}

fn default_semantic_weight() -> f64 {
    DEFAULT_SEMANTIC_WEIGHT
}

fn default_absolute_threshold() -> f64 {
    DEFAULT_ABSOLUTE_THRESHOLD
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawWeightTable {
    #[serde(default = "default_confidence_threshold")]
    confidence_threshold: f64,
    #[serde(default = "default_semantic_weight")]
    semantic_weight: f64,
    #[serde(default = "default_absolute_threshold")]
    absolute_threshold: f64,
    #[serde(default)]
    weights: BTreeMap<String, BTreeMap<String, f64>>,
}

impl TryFrom<RawWeightTable> for FactorWeightTable {
    type Error = WeightTableError;

    fn try_from(raw: RawWeightTable) -> Result<Self, Self::Error> {
        let mut table = FactorWeightTable::zeroed();
        table.set_confidence_threshold(raw.confidence_threshold)?;
        table.set_semantic_weight(raw.semantic_weight)?;
        table.set_absolute_threshold(raw.absolute_threshold)?;

        for (category_name, factors) in raw.weights {
            let category = category_name
                .parse::<Category>()
                .map_err(|_| WeightTableError::UnknownCategory(category_name.clone()))?;
            for (factor_name, value) in factors {
                let factor = factor_name.parse::<FactorName>()?;
                table.set_weight(category, factor, value)?;
            }
        }

        Ok(table)
    }
}

impl From<FactorWeightTable> for RawWeightTable {
    fn from(table: FactorWeightTable) -> Self {
        let mut weights: BTreeMap<String, BTreeMap<String, f64>> = BTreeMap::new();
        for ((category, factor), value) in &table.weights {
            weights
                .entry(category.as_str().to_string())
                .or_default()
                .insert(factor.as_str().to_string(), *value);
        }
        Self {
            confidence_threshold: table.confidence_threshold,
            semantic_weight: table.semantic_weight,
            absolute_threshold: table.absolute_threshold,
            weights,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_table_is_valid() {
        let table = FactorWeightTable::default();
        assert!(table.validate().is_ok());
        assert_eq!(table.confidence_threshold(), 0.7);
        assert_eq!(table.semantic_weight(), 0.5);
        assert!(table.weight(Category::Projects, FactorName::Oracle) > 0.0);
        assert_eq!(table.weight(Category::Areas, FactorName::HasGoal), 0.0);
    }

    #[test]
    fn test_unknown_factor_is_rejected() {
        let json = r#"{"weights": {"Projects": {"has_vibes": 1.0}}}"#;
        let err = serde_json::from_str::<FactorWeightTable>(json).unwrap_err();
        assert!(err.to_string().contains("unknown factor name: has_vibes"));
    }

    #[test]
    fn test_inbox_row_and_unknown_category_rejected() {
        let inbox = r#"{"weights": {"Inbox": {"oracle": 1.0}}}"#;
        assert!(serde_json::from_str::<FactorWeightTable>(inbox).is_err());

        let unknown = r#"{"weights": {"Someday": {"oracle": 1.0}}}"#;
        let err = serde_json::from_str::<FactorWeightTable>(unknown).unwrap_err();
        assert!(err.to_string().contains("unknown category"));
    }

    #[test]
    fn test_negative_values_rejected() {
        let mut table = FactorWeightTable::zeroed();
        assert!(table
            .set_weight(Category::Projects, FactorName::Oracle, -1.0)
            .is_err());
        assert!(table.set_confidence_threshold(-0.1).is_err());
        assert!(table.set_semantic_weight(1.5).is_err());
        assert!(table.set_absolute_threshold(f64::NAN).is_err());

        let json = r#"{"confidence_threshold": -0.2}"#;
        assert!(serde_json::from_str::<FactorWeightTable>(json).is_err());
    }

    #[test]
    fn test_serialized_form_round_trips() {
        let table = FactorWeightTable::zeroed()
            .with_weight(Category::Projects, FactorName::Oracle, 10.0)
            .unwrap();
        let json = serde_json::to_value(&table).unwrap();
        assert_eq!(json["weights"]["Projects"]["oracle"], 10.0);

        let back: FactorWeightTable = serde_json::from_value(json).unwrap();
        assert_eq!(back, table);
        assert_eq!(back.factors(Category::Projects).count(), 1);
    }
}
