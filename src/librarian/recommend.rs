//! Experience clustering and recommendation derivation.

use crate::artifact::Experience;
use crate::scope::Scope;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// What a recommendation proposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecommendationKind {
    /// Promote a recurring case pattern to a strategy
    Promotion,
    /// Merge near-identical experiences into one
    Consolidation,
    /// Retire stale, low-confidence entries
    Deprecation,
}

/// User-driven recommendation lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecommendationState {
    Pending,
    Approved,
    Rejected,
    Skipped,
}

/// A librarian output proposing a structural change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    pub id: String,
    pub kind: RecommendationKind,
    pub state: RecommendationState,
    pub scope: Scope,
    pub title: String,
    pub description: String,
    pub confidence: f64,
    /// How many experiences back this recommendation
    pub pattern_count: usize,
    pub experience_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Recommendation {
    fn new(
        kind: RecommendationKind,
        scope: Scope,
        title: String,
        description: String,
        confidence: f64,
        experience_ids: Vec<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            state: RecommendationState::Pending,
            scope,
            title,
            description,
            confidence,
            pattern_count: experience_ids.len(),
            experience_ids,
            created_at: Utc::now(),
        }
    }
}

/// A cluster of related experiences.
#[derive(Debug, Clone)]
pub struct Cluster {
    pub category: String,
    pub members: Vec<Experience>,
}

/// Group experiences by category, splitting each category by rough title
/// similarity (shared leading token).
pub fn cluster_experiences(experiences: Vec<Experience>) -> Vec<Cluster> {
    let mut by_key: HashMap<(String, String), Vec<Experience>> = HashMap::new();
    for experience in experiences {
        let category = experience
            .category
            .clone()
            .unwrap_or_else(|| "uncategorized".to_string());
        let head = experience
            .title
            .split_whitespace()
            .next()
            .unwrap_or("")
            .to_lowercase();
        by_key.entry((category, head)).or_default().push(experience);
    }

    let mut clusters: Vec<Cluster> = by_key
        .into_iter()
        .map(|((category, _), members)| Cluster { category, members })
        .collect();
    clusters.sort_by_key(|c| std::cmp::Reverse(c.members.len()));
    clusters
}

/// Thresholds for recommendation derivation.
#[derive(Debug, Clone)]
pub struct RecommendConfig {
    /// Cluster size required for a promotion
    pub min_pattern_count: usize,
    /// Confidence below which repeated failures suggest deprecation
    pub deprecation_confidence: f64,
}

impl Default for RecommendConfig {
    fn default() -> Self {
        Self {
            min_pattern_count: 3,
            deprecation_confidence: 0.4,
        }
    }
}

/// Turn clusters into typed recommendations.
pub fn derive_recommendations(
    scope: &Scope,
    clusters: &[Cluster],
    config: &RecommendConfig,
) -> Vec<Recommendation> {
    let mut recommendations = Vec::new();

    for cluster in clusters {
        let ids: Vec<String> = cluster
            .members
            .iter()
            .map(|e| e.envelope.id.clone())
            .collect();

        if cluster.members.len() >= config.min_pattern_count {
            let confidence = (0.5 + 0.1 * cluster.members.len() as f64).min(0.95);
            recommendations.push(Recommendation::new(
                RecommendationKind::Promotion,
                scope.clone(),
                format!("Promote recurring '{}' pattern", cluster.category),
                format!(
                    "{} similar experiences in category '{}' suggest a strategy-level entry",
                    cluster.members.len(),
                    cluster.category
                ),
                confidence,
                ids.clone(),
            ));
        }

        // Identical titles inside one cluster are consolidation candidates
        let mut title_counts: HashMap<&str, usize> = HashMap::new();
        for member in &cluster.members {
            *title_counts.entry(member.title.as_str()).or_insert(0) += 1;
        }
        if let Some((title, count)) = title_counts.iter().max_by_key(|(_, c)| **c) {
            if *count >= 2 {
                let duplicate_ids: Vec<String> = cluster
                    .members
                    .iter()
                    .filter(|e| e.title == *title)
                    .map(|e| e.envelope.id.clone())
                    .collect();
                recommendations.push(Recommendation::new(
                    RecommendationKind::Consolidation,
                    scope.clone(),
                    format!("Consolidate duplicates of '{}'", title),
                    format!("{} experiences share the same title", count),
                    0.8,
                    duplicate_ids,
                ));
            }
        }

        let weak: Vec<String> = cluster
            .members
            .iter()
            .filter(|e| e.confidence < config.deprecation_confidence)
            .map(|e| e.envelope.id.clone())
            .collect();
        if !weak.is_empty() && weak.len() == cluster.members.len() {
            recommendations.push(Recommendation::new(
                RecommendationKind::Deprecation,
                scope.clone(),
                format!("Deprecate low-confidence '{}' entries", cluster.category),
                format!("{} entries never rose above the confidence floor", weak.len()),
                0.6,
                weak,
            ));
        }
    }

    recommendations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{EntryType, Envelope, ExperienceLevel};
    use crate::scope::ScopeType;

    fn experience(title: &str, category: &str, confidence: f64) -> Experience {
        Experience {
            envelope: Envelope::new(
                EntryType::Experience,
                Scope::of(ScopeType::Project, "p1").unwrap(),
            ),
            title: title.to_string(),
            level: ExperienceLevel::Case,
            category: Some(category.to_string()),
            scenario: None,
            outcome: None,
            content: "content".to_string(),
            confidence,
        }
    }

    #[test]
    fn test_clustering_by_category_and_title_head() {
        let clusters = cluster_experiences(vec![
            experience("Bash failing with exit 1", "tool-failure", 0.7),
            experience("Bash failing with timeout", "tool-failure", 0.7),
            experience("Deploy subagent failed", "subagent-failure", 0.7),
        ]);

        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].members.len(), 2);
        assert_eq!(clusters[0].category, "tool-failure");
    }

    #[test]
    fn test_promotion_requires_pattern_count() {
        let scope = Scope::of(ScopeType::Project, "p1").unwrap();
        let config = RecommendConfig::default();

        let small = cluster_experiences(vec![
            experience("Bash a", "tool-failure", 0.7),
            experience("Bash b", "tool-failure", 0.7),
        ]);
        assert!(derive_recommendations(&scope, &small, &config)
            .iter()
            .all(|r| r.kind != RecommendationKind::Promotion));

        let large = cluster_experiences(vec![
            experience("Bash a", "tool-failure", 0.7),
            experience("Bash b", "tool-failure", 0.7),
            experience("Bash c", "tool-failure", 0.7),
        ]);
        let recommendations = derive_recommendations(&scope, &large, &config);
        let promotion = recommendations
            .iter()
            .find(|r| r.kind == RecommendationKind::Promotion)
            .expect("promotion derived");
        assert_eq!(promotion.pattern_count, 3);
        assert!(promotion.confidence >= 0.8);
        assert_eq!(promotion.state, RecommendationState::Pending);
    }

    #[test]
    fn test_consolidation_for_duplicate_titles() {
        let scope = Scope::of(ScopeType::Project, "p1").unwrap();
        let clusters = cluster_experiences(vec![
            experience("Bash failing with exit 1", "tool-failure", 0.7),
            experience("Bash failing with exit 1", "tool-failure", 0.7),
        ]);
        let recommendations =
            derive_recommendations(&scope, &clusters, &RecommendConfig::default());
        assert!(recommendations
            .iter()
            .any(|r| r.kind == RecommendationKind::Consolidation && r.pattern_count == 2));
    }

    #[test]
    fn test_deprecation_for_uniformly_weak_cluster() {
        let scope = Scope::of(ScopeType::Project, "p1").unwrap();
        let clusters = cluster_experiences(vec![
            experience("Flaky probe", "error-pattern", 0.2),
            experience("Flaky retry", "error-pattern", 0.3),
        ]);
        let recommendations =
            derive_recommendations(&scope, &clusters, &RecommendConfig::default());
        assert!(recommendations
            .iter()
            .any(|r| r.kind == RecommendationKind::Deprecation));
    }
}
