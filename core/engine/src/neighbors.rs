use para_collaborators::{IndexHit, VectorIndex};
use para_schemas::{Category, NeighborMatch, NoteId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct NeighborSummary {
    pub count: usize,
    pub avg_distance: f64,
    /// Share of neighbour similarity pointing at this category, in [0, 1].
    pub affinity: f64,
}

/// Per-category view of the nearest neighbours of a note.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeighborAnalysis {
    pub summary: BTreeMap<Category, NeighborSummary>,
    pub matches: Vec<NeighborMatch>,
}

impl Default for NeighborAnalysis {
    fn default() -> Self {
        Self::empty()
    }
}

pub fn affinity(distance: f64) -> f64 {
    if distance.is_finite() {
        (1.0 - distance).max(0.0)
    } else {
        0.0
    }
}

impl NeighborAnalysis {
    /// Fully uninformative signal: zero affinity everywhere.
    pub fn empty() -> Self {
        Self {
            summary: Category::SCORED
                .iter()
                .map(|c| (*c, NeighborSummary::default()))
                .collect(),
            matches: Vec::new(),
        }
    }

    pub fn from_matches(matches: Vec<NeighborMatch>) -> Self {
        let mut analysis = Self::empty();
        let total = matches.len();
        if total == 0 {
            return analysis;
        }

        for category in Category::SCORED {
            let own: Vec<&NeighborMatch> = matches.iter().filter(|m| m.category == category).collect();
            if own.is_empty() {
                continue;
            }
            let distance_sum: f64 = own.iter().map(|m| m.distance).sum();
            let affinity_sum: f64 = own.iter().map(|m| affinity(m.distance)).sum();

            analysis.summary.insert(
                category,
                NeighborSummary {
                    count: own.len(),
                    avg_distance: distance_sum / own.len() as f64,
                    affinity: (affinity_sum / total as f64).clamp(0.0, 1.0),
                },
            );
        }

        analysis.matches = matches;
        analysis
    }

    pub fn affinity(&self, category: Category) -> f64 {
        self.summary.get(&category).map(|s| s.affinity).unwrap_or(0.0)
    }

    pub fn neighbor_count(&self) -> usize {
        self.matches.len()
    }

    /// Blend in category-scoped affinities (mean of global and scoped).
    fn blend_scoped(&mut self, scoped: &BTreeMap<Category, f64>) {
        for (category, scoped_affinity) in scoped {
            if let Some(summary) = self.summary.get_mut(category) {
                summary.affinity = ((summary.affinity + scoped_affinity) / 2.0).clamp(0.0, 1.0);
            }
        }
    }
}

/// Queries the vector index and turns distances into category affinities.
/// Any index failure degrades to an empty analysis.
pub struct NeighborAnalyzer {
    index: Option<Arc<dyn VectorIndex>>,
    timeout: Duration,
    scoped_queries: bool,
}

impl NeighborAnalyzer {
    pub fn new(index: Arc<dyn VectorIndex>, timeout: Duration) -> Self {
        Self {
            index: Some(index),
            timeout,
            scoped_queries: false,
        }
    }

    /// Analyzer without an index; always returns the empty analysis.
    pub fn disabled() -> Self {
        Self {
            index: None,
            timeout: Duration::from_secs(0),
            scoped_queries: false,
        }
    }

    pub fn with_scoped_queries(mut self, enabled: bool) -> Self {
        self.scoped_queries = enabled;
        self
    }

    pub async fn analyze(&self, text: &str, k: usize) -> NeighborAnalysis {
        self.analyze_excluding(None, text, k).await
    }

    /// Like `analyze`, ignoring the note's own entry in the index.
    pub async fn analyze_excluding(
        &self,
        exclude: Option<&NoteId>,
        text: &str,
        k: usize,
    ) -> NeighborAnalysis {
        if self.index.is_none() || k == 0 || text.trim().is_empty() {
            return NeighborAnalysis::empty();
        }

        let hits = match self.query(text, k, None, exclude).await {
            Ok(hits) => hits,
            Err(e) => {
                warn!("Neighbour lookup degraded: {}", e);
                return NeighborAnalysis::empty();
            }
        };

        let matches: Vec<NeighborMatch> = hits
            .iter()
            .filter_map(|hit| {
                hit.category()
                    .filter(Category::is_scored)
                    .map(|category| NeighborMatch {
                        category,
                        distance: hit.distance,
                    })
            })
            .collect();

        let mut analysis = NeighborAnalysis::from_matches(matches);

        if self.scoped_queries && analysis.neighbor_count() > 0 {
            let mut scoped = BTreeMap::new();
            for category in Category::SCORED {
                match self.query(text, k, Some(category), exclude).await {
                    Ok(hits) if !hits.is_empty() => {
                        let mean = hits.iter().map(|h| affinity(h.distance)).sum::<f64>()
                            / hits.len() as f64;
                        scoped.insert(category, mean);
                    }
                    Ok(_) => {
                        scoped.insert(category, 0.0);
                    }
                    Err(e) => warn!("Scoped neighbour lookup for {} skipped: {}", category, e),
                }
            }
            analysis.blend_scoped(&scoped);
        }

        debug!(
            "Neighbour analysis: {} matches across {} categories",
            analysis.neighbor_count(),
            analysis.summary.values().filter(|s| s.count > 0).count()
        );

        analysis
    }

    async fn query(
        &self,
        text: &str,
        k: usize,
        filter: Option<Category>,
        exclude: Option<&NoteId>,
    ) -> Result<Vec<IndexHit>> {
        let index = self
            .index
            .as_ref()
            .ok_or_else(|| EngineError::unavailable("vector index", "not configured"))?;

        let fetch = if exclude.is_some() { k + 1 } else { k };
        let hits = tokio::time::timeout(self.timeout, index.query(text, fetch, filter))
            .await
            .map_err(|_| EngineError::unavailable("vector index", "timed out"))?
            .map_err(|e| EngineError::unavailable("vector index", e))?;

        Ok(hits
            .into_iter()
            .filter(|hit| exclude.map(|id| hit.id != id.0).unwrap_or(true))
            .take(k)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use para_collaborators::{CollaboratorError, InMemoryVectorIndex};
    use std::collections::HashMap;

    struct FailingIndex;

    #[async_trait]
    impl VectorIndex for FailingIndex {
        async fn upsert(
            &self,
            _id: &NoteId,
            _text: &str,
            _snippet: &str,
            _metadata: HashMap<String, String>,
        ) -> para_collaborators::Result<()> {
            Err(CollaboratorError::Unavailable("offline".into()))
        }

        async fn query(
            &self,
            _text: &str,
            _k: usize,
            _filter: Option<Category>,
        ) -> para_collaborators::Result<Vec<IndexHit>> {
            Err(CollaboratorError::Unavailable("offline".into()))
        }
    }

    struct SlowIndex;

    #[async_trait]
    impl VectorIndex for SlowIndex {
        async fn upsert(
            &self,
            _id: &NoteId,
            _text: &str,
            _snippet: &str,
            _metadata: HashMap<String, String>,
        ) -> para_collaborators::Result<()> {
            Ok(())
        }

        async fn query(
            &self,
            _text: &str,
            _k: usize,
            _filter: Option<Category>,
        ) -> para_collaborators::Result<Vec<IndexHit>> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Vec::new())
        }
    }

    fn tagged(category: Category) -> HashMap<String, String> {
        HashMap::from([("category".to_string(), category.as_str().to_string())])
    }

    #[test]
    fn test_from_matches_summarizes_per_category() {
        let analysis = NeighborAnalysis::from_matches(vec![
            NeighborMatch { category: Category::Projects, distance: 0.2 },
            NeighborMatch { category: Category::Projects, distance: 0.4 },
            NeighborMatch { category: Category::Resources, distance: 1.5 },
            NeighborMatch { category: Category::Areas, distance: 0.0 },
        ]);

        let projects = analysis.summary[&Category::Projects];
        assert_eq!(projects.count, 2);
        assert!((projects.avg_distance - 0.3).abs() < 1e-9);
        assert!((projects.affinity - (0.8 + 0.6) / 4.0).abs() < 1e-9);

        // Distances past 1.0 never produce negative affinity
        assert_eq!(analysis.affinity(Category::Resources), 0.0);
        assert!((analysis.affinity(Category::Areas) - 0.25).abs() < 1e-9);
        assert_eq!(analysis.affinity(Category::Archive), 0.0);
        assert_eq!(analysis.neighbor_count(), 4);
    }

    #[test]
    fn test_affinity_bounds() {
        assert_eq!(affinity(0.0), 1.0);
        assert_eq!(affinity(2.0), 0.0);
        assert_eq!(affinity(f64::NAN), 0.0);
    }

    #[tokio::test]
    async fn test_unavailable_index_degrades_to_empty() {
        let analyzer = NeighborAnalyzer::new(Arc::new(FailingIndex), Duration::from_secs(1));
        let analysis = analyzer.analyze("anything at all", 5).await;
        assert_eq!(analysis, NeighborAnalysis::empty());
        assert_eq!(NeighborAnalyzer::disabled().analyze("x", 5).await.neighbor_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_degrades_to_empty() {
        let analyzer = NeighborAnalyzer::new(Arc::new(SlowIndex), Duration::from_millis(20));
        let analysis = analyzer.analyze("anything at all", 5).await;
        assert_eq!(analysis.neighbor_count(), 0);
    }

    #[tokio::test]
    async fn test_analyze_excludes_own_entry() {
        let index = Arc::new(InMemoryVectorIndex::default());
        let own = NoteId::new("own");
        index
            .upsert(&own, "sprint roadmap launch", "", tagged(Category::Projects))
            .await
            .unwrap();
        index
            .upsert(&NoteId::new("other"), "sprint roadmap", "", tagged(Category::Projects))
            .await
            .unwrap();
        index
            .upsert(&NoteId::new("recipe"), "bread recipe flour", "", tagged(Category::Resources))
            .await
            .unwrap();

        let analyzer =
            NeighborAnalyzer::new(index, Duration::from_secs(1)).with_scoped_queries(true);
        let analysis = analyzer
            .analyze_excluding(Some(&own), "sprint roadmap launch", 2)
            .await;

        assert_eq!(analysis.neighbor_count(), 2);
        assert_eq!(analysis.matches[0].category, Category::Projects);
        assert!(analysis.affinity(Category::Projects) > analysis.affinity(Category::Resources));
    }
}
