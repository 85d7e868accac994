use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

mod weights;

pub use weights::{FactorName, FactorWeightTable, WeightTableError};

// ============================================================================
// ID Types
// ============================================================================

/// Stable note identity: hex SHA-256 of the note's canonical path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NoteId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AdjustmentId(pub String);

impl NoteId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive the identity of a note from its location on disk.
    ///
    /// Existing files are resolved through the filesystem (symlinks, `..`);
    /// paths that do not exist are normalized lexically so the same spelling
    /// always maps to the same id.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Self {
        let canonical = canonical_path(path.as_ref());
        Self(hex::encode(Sha256::digest(canonical.as_bytes())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NoteId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for AdjustmentId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn canonical_path(path: &Path) -> String {
    if let Ok(resolved) = std::fs::canonicalize(path) {
        return lexical_path(&resolved);
    }
    lexical_path(path)
}

fn lexical_path(path: &Path) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut absolute = false;

    for component in path.components() {
        match component {
            Component::Prefix(prefix) => {
                parts.push(prefix.as_os_str().to_string_lossy().replace('\\', "/"))
            }
            Component::RootDir => absolute = true,
            Component::CurDir => {}
            Component::ParentDir => {
                parts.pop();
            }
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
        }
    }

    let joined = parts.join("/");
    if absolute {
        format!("/{}", joined)
    } else {
        joined
    }
}

// ============================================================================
// Category
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Category {
    Projects,
    Areas,
    Resources,
    Archive,
    Inbox,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown category: {0}")]
pub struct ParseCategoryError(pub String);

impl Category {
    pub const ALL: [Category; 5] = [
        Category::Projects,
        Category::Areas,
        Category::Resources,
        Category::Archive,
        Category::Inbox,
    ];

    /// Categories that receive a score. Order doubles as the tie-break order.
    pub const SCORED: [Category; 4] = [
        Category::Projects,
        Category::Areas,
        Category::Resources,
        Category::Archive,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Projects => "Projects",
            Category::Areas => "Areas",
            Category::Resources => "Resources",
            Category::Archive => "Archive",
            Category::Inbox => "Inbox",
        }
    }

    pub fn is_scored(&self) -> bool {
        !matches!(self, Category::Inbox)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = ParseCategoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Category::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| ParseCategoryError(s.to_string()))
    }
}

// ============================================================================
// Features
// ============================================================================

/// Names of the features produced by the extractor.
pub mod feature {
    pub const HAS_GOAL: &str = "has_goal";
    pub const HAS_RESPONSIBILITY: &str = "has_responsibility";
    pub const HAS_DASHBOARD: &str = "has_dashboard";
    pub const HAS_DEADLINE: &str = "has_deadline";
    pub const HAS_DATES: &str = "has_dates";
    pub const STATUS: &str = "status";
    pub const TAGS: &str = "tags";
    pub const DOMAIN_KEYWORDS: &str = "domain_keywords";
    pub const N_TASKS: &str = "n_tasks";
    pub const N_PENDING: &str = "n_pending";
    pub const N_COMPLETED: &str = "n_completed";
    pub const HAS_IMAGES: &str = "has_images";
    pub const HAS_TABLES: &str = "has_tables";
    pub const HAS_CODE: &str = "has_code";
    pub const N_LINKS: &str = "n_links";
    pub const WORD_COUNT: &str = "word_count";
    pub const BYTE_SIZE: &str = "byte_size";
    pub const URGENCY_MARKERS: &str = "urgency_markers";
    pub const MAINTENANCE_MARKERS: &str = "maintenance_markers";
    pub const REFERENCE_MARKERS: &str = "reference_markers";
    pub const COMPLETION_MARKERS: &str = "completion_markers";
    pub const ACTIVE_MARKERS: &str = "active_markers";
    pub const IN_ARCHIVE_PATH: &str = "in_archive_path";
    pub const DAYS_SINCE_MODIFIED: &str = "days_since_modified";
    pub const IS_STALE: &str = "is_stale";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FeatureValue {
    Flag(bool),
    Count(u64),
    Text(String),
    Set(BTreeSet<String>),
    Null,
}

/// Feature name → typed value. Built once per classification attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureSet(BTreeMap<String, FeatureValue>);

impl FeatureSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: FeatureValue) -> Self {
        self.0.insert(name.to_string(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&FeatureValue> {
        self.0.get(name)
    }

    pub fn flag(&self, name: &str) -> bool {
        matches!(self.0.get(name), Some(FeatureValue::Flag(true)))
    }

    pub fn count(&self, name: &str) -> u64 {
        match self.0.get(name) {
            Some(FeatureValue::Count(n)) => *n,
            _ => 0,
        }
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        match self.0.get(name) {
            Some(FeatureValue::Text(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn set(&self, name: &str) -> Option<&BTreeSet<String>> {
        match self.0.get(name) {
            Some(FeatureValue::Set(values)) => Some(values),
            _ => None,
        }
    }

    pub fn set_len(&self, name: &str) -> usize {
        self.set(name).map(BTreeSet::len).unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FeatureValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Path-level facts about a note supplied by the content store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NoteMetadata {
    pub path: Option<PathBuf>,
    pub modified: Option<DateTime<Utc>>,
    pub size_bytes: Option<u64>,
}

// ============================================================================
// Decision Schema
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeighborMatch {
    pub category: Category,
    pub distance: f64,
}

/// Per-category, per-factor contributions to the raw score.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScoreBreakdown(BTreeMap<String, BTreeMap<String, f64>>);

impl ScoreBreakdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, category: Category, factor: &str, contribution: f64) {
        *self
            .0
            .entry(category.as_str().to_string())
            .or_default()
            .entry(factor.to_string())
            .or_insert(0.0) += contribution;
    }

    pub fn contribution(&self, category: Category, factor: &str) -> Option<f64> {
        self.0
            .get(category.as_str())
            .and_then(|factors| factors.get(factor))
            .copied()
    }

    /// Signed, rounded rendering of a contribution, e.g. `"+10"` or `"-0.25"`.
    pub fn formatted(&self, category: Category, factor: &str) -> Option<String> {
        self.contribution(category, factor).map(format_contribution)
    }

    pub fn factors(&self, category: Category) -> impl Iterator<Item = (&str, f64)> {
        self.0
            .get(category.as_str())
            .into_iter()
            .flat_map(|factors| factors.iter().map(|(k, v)| (k.as_str(), *v)))
    }

    pub fn raw_score(&self, category: Category) -> f64 {
        self.factors(category).map(|(_, v)| v).sum()
    }
}

pub fn format_contribution(value: f64) -> String {
    let rounded = (value * 10_000.0).round() / 10_000.0;
    // Avoid rendering "-0"
    let rounded = if rounded == 0.0 { 0.0 } else { rounded };
    format!("{:+}", rounded)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationDecision {
    pub note_id: NoteId,
    pub timestamp: DateTime<Utc>,
    pub category: Category,
    pub confidence: f64,
    pub score_breakdown: ScoreBreakdown,
    pub neighbors: Vec<NeighborMatch>,
    pub oracle_category: Option<Category>,
    pub reasoning: String,
    pub features: FeatureSet,
}

impl ClassificationDecision {
    /// Whether a human should look at this decision before acting on it.
    pub fn requires_review(&self, confidence_threshold: f64) -> bool {
        self.category == Category::Inbox || self.confidence < confidence_threshold
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackCorrection {
    pub note_id: NoteId,
    pub original_category: Category,
    pub corrected_category: Category,
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LedgerEntry {
    Decision(ClassificationDecision),
    Correction(FeedbackCorrection),
}

impl LedgerEntry {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            LedgerEntry::Decision(d) => d.timestamp,
            LedgerEntry::Correction(c) => c.timestamp,
        }
    }

    pub fn note_id(&self) -> &NoteId {
        match self {
            LedgerEntry::Decision(d) => &d.note_id,
            LedgerEntry::Correction(c) => &c.note_id,
        }
    }
}

// ============================================================================
// Learning Schema
// ============================================================================

pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

fn default_schema_version() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningSnapshot {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub timestamp: DateTime<Utc>,
    pub total_classifications: u64,
    pub accuracy_rate: f64, // percent
    pub confidence_correlation: f64,
    pub learning_velocity: f64,
    pub improvement_score: f64,
    pub category_balance: f64,
    pub semantic_coherence: f64,
    pub user_satisfaction: f64,
    pub system_adaptability: f64,
}

impl LearningSnapshot {
    pub fn is_supported(&self) -> bool {
        self.schema_version <= SNAPSHOT_SCHEMA_VERSION
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricName {
    TotalClassifications,
    AccuracyRate,
    ConfidenceCorrelation,
    LearningVelocity,
    ImprovementScore,
    CategoryBalance,
    SemanticCoherence,
    UserSatisfaction,
    SystemAdaptability,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown metric: {0}")]
pub struct ParseMetricError(pub String);

impl MetricName {
    pub const ALL: [MetricName; 9] = [
        MetricName::TotalClassifications,
        MetricName::AccuracyRate,
        MetricName::ConfidenceCorrelation,
        MetricName::LearningVelocity,
        MetricName::ImprovementScore,
        MetricName::CategoryBalance,
        MetricName::SemanticCoherence,
        MetricName::UserSatisfaction,
        MetricName::SystemAdaptability,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricName::TotalClassifications => "total_classifications",
            MetricName::AccuracyRate => "accuracy_rate",
            MetricName::ConfidenceCorrelation => "confidence_correlation",
            MetricName::LearningVelocity => "learning_velocity",
            MetricName::ImprovementScore => "improvement_score",
            MetricName::CategoryBalance => "category_balance",
            MetricName::SemanticCoherence => "semantic_coherence",
            MetricName::UserSatisfaction => "user_satisfaction",
            MetricName::SystemAdaptability => "system_adaptability",
        }
    }
}

impl FromStr for MetricName {
    type Err = ParseMetricError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        MetricName::ALL
            .into_iter()
            .find(|m| m.as_str() == wanted)
            .ok_or_else(|| ParseMetricError(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryPerformance {
    pub category: Category,
    pub decisions: u64,
    pub corrections: u64,
    pub correction_rate: f64,
    pub avg_confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Improving,
    Stable,
    Declining,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningProgress {
    pub snapshots: usize,
    pub first_accuracy: f64,
    pub last_accuracy: f64,
    pub overall_improvement: f64,
    pub direction: TrendDirection,
}

// ============================================================================
// Suggestions & Tuning
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    #[serde(rename = "low")]
    Low,
    #[serde(rename = "medium")]
    Medium,
    #[serde(rename = "high")]
    High,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionKind {
    LowAccuracy,
    PoorCalibration,
    SlowLearning,
    InsufficientFeedback,
    ExcessiveCorrections,
    CategoryCorrectionRate,
    CategoryImbalance,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub kind: SuggestionKind,
    pub severity: Severity,
    pub category: Option<Category>,
    pub message: String,
    pub action: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunableParameter {
    ConfidenceThreshold,
    SemanticWeight,
}

impl TunableParameter {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunableParameter::ConfidenceThreshold => "confidence_threshold",
            TunableParameter::SemanticWeight => "semantic_weight",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Adjustment {
    pub parameter: TunableParameter,
    pub current: f64,
    pub proposed: f64,
    pub reason: String,
}

/// An adjustment that has been applied to the live weight table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedAdjustment {
    pub id: AdjustmentId,
    pub adjustment: Adjustment,
    pub table_version: i64,
    pub applied_at: DateTime<Utc>,
}

/// Portable bundle of what the engine has learned: the live weight table,
/// the adjustments that shaped it and the snapshot history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningKnowledge {
    pub exported_at: DateTime<Utc>,
    pub weights_version: i64,
    pub weights: FactorWeightTable,
    #[serde(default)]
    pub adjustments: Vec<AppliedAdjustment>,
    #[serde(default)]
    pub snapshots: Vec<LearningSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeImport {
    pub weights_version: i64,
    pub adjustments_imported: usize,
    pub snapshots_imported: usize,
}

/// How one factor contributed to the decisions of one category, split by
/// whether the user later corrected them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorStats {
    pub category: Category,
    pub factor: String,
    pub decisions: u64,
    pub corrected: u64,
    pub correction_rate: f64,
    pub mean_when_correct: f64,
    pub mean_when_corrected: f64,
    pub avg_confidence: f64,
}

// ============================================================================
// Helper Functions
// ============================================================================

pub fn generate_adjustment_id() -> AdjustmentId {
    AdjustmentId(ulid::Ulid::new().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_note_id_is_stable_for_equivalent_paths() {
        let a = NoteId::from_path("vault/missing/./projects/../plan.md");
        let b = NoteId::from_path("vault/missing/plan.md");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
        assert_ne!(a, NoteId::from_path("vault/missing/other.md"));
    }

    #[test]
    fn test_category_parsing() {
        assert_eq!("projects".parse::<Category>().unwrap(), Category::Projects);
        assert_eq!(" ARCHIVE ".parse::<Category>().unwrap(), Category::Archive);
        assert!("someday".parse::<Category>().is_err());
        assert!(!Category::Inbox.is_scored());
        assert_eq!(Category::SCORED.len(), 4);
    }

    #[test]
    fn test_format_contribution() {
        assert_eq!(format_contribution(10.0), "+10");
        assert_eq!(format_contribution(-0.25), "-0.25");
        assert_eq!(format_contribution(0.1 + 0.2), "+0.3");
        assert_eq!(format_contribution(-0.00001), "+0");
    }

    #[test]
    fn test_breakdown_raw_score() {
        let mut breakdown = ScoreBreakdown::new();
        breakdown.record(Category::Projects, "oracle", 10.0);
        breakdown.record(Category::Projects, "adjust:urgency", 2.0);

        assert_eq!(breakdown.raw_score(Category::Projects), 12.0);
        assert_eq!(
            breakdown.formatted(Category::Projects, "adjust:urgency").as_deref(),
            Some("+2")
        );
        assert_eq!(breakdown.raw_score(Category::Areas), 0.0);
    }

    #[test]
    fn test_feature_set_accessors() {
        let features = FeatureSet::new()
            .with(feature::HAS_DEADLINE, FeatureValue::Flag(true))
            .with(feature::N_TASKS, FeatureValue::Count(3))
            .with(feature::STATUS, FeatureValue::Null);

        assert!(features.flag(feature::HAS_DEADLINE));
        assert!(!features.flag(feature::HAS_GOAL));
        assert_eq!(features.count(feature::N_TASKS), 3);
        assert_eq!(features.text(feature::STATUS), None);

        let json = serde_json::to_string(&features).unwrap();
        let back: FeatureSet = serde_json::from_str(&json).unwrap();
        assert_eq!(back, features);
    }

    #[test]
    fn test_snapshot_without_version_reads_as_v1() {
        let json = r#"{
            "timestamp": "2024-01-01T00:00:00Z",
            "total_classifications": 4,
            "accuracy_rate": 75.0,
            "confidence_correlation": 0.0,
            "learning_velocity": 0.5,
            "improvement_score": 0.45,
            "category_balance": 0.2,
            "semantic_coherence": 0.5,
            "user_satisfaction": 0.0,
            "system_adaptability": 0.5
        }"#;
        let snapshot: LearningSnapshot = serde_json::from_str(json).unwrap();
        assert_eq!(snapshot.schema_version, 1);
        assert!(snapshot.is_supported());
        assert_eq!(snapshot.accuracy_rate, 75.0);
    }

    #[test]
    fn test_metric_name_parsing() {
        assert_eq!(
            "Accuracy_Rate".parse::<MetricName>().unwrap(),
            MetricName::AccuracyRate
        );
        assert!("latency".parse::<MetricName>().is_err());
    }
}
