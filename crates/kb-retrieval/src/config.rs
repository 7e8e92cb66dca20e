//! Ranker configuration.
//!
//! All boosts are fractions of the raw distance. Term and pattern lists are
//! plain data so deployments inject their own domain vocabulary.

use serde::{Deserialize, Serialize};

/// Configuration for [`crate::HybridRanker`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RankerConfig {
    /// Reduction per query term found in the chunk
    pub keyword_weight: f32,

    /// Base reduction for website chunks
    pub website_boost: f32,

    /// Reduction when a website chunk contains a structural marker
    pub structure_marker_boost: f32,

    /// Navigation/structure markers looked for in website text (case-insensitive)
    pub structure_markers: Vec<String>,

    /// Reduction when the URL matches a topic path pattern
    pub topic_url_boost: f32,

    /// Substrings identifying topic pages in URLs (case-insensitive)
    pub topic_url_patterns: Vec<String>,

    /// Reduction for website chunks beyond the first crawled page
    pub page_boost: f32,

    /// Reduction per domain term present in the text
    pub domain_term_boost: f32,

    /// Domain vocabulary; empty by default
    pub domain_terms: Vec<String>,

    /// Words ignored when computing keyword overlap
    pub stopwords: Vec<String>,

    /// Cap on the summed reduction; must stay below 1
    pub max_reduction: f32,

    /// Enforce mixed source types in the top results
    pub diversity: bool,
}

impl Default for RankerConfig {
    fn default() -> Self {
        Self {
            keyword_weight: 0.05,
            website_boost: 0.10,
            structure_marker_boost: 0.05,
            structure_markers: vec![
                "overview".to_string(),
                "key points".to_string(),
                "see also".to_string(),
                "related topics".to_string(),
                "table of contents".to_string(),
                "##".to_string(),
                "•".to_string(),
            ],
            topic_url_boost: 0.05,
            topic_url_patterns: vec![
                "/topic".to_string(),
                "/disease".to_string(),
                "/conditions/".to_string(),
                "/health-topics/".to_string(),
            ],
            page_boost: 0.03,
            domain_term_boost: 0.02,
            domain_terms: Vec::new(),
            stopwords: [
                "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "in", "is", "it",
                "of", "on", "or", "that", "the", "to", "was", "what", "with",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            max_reduction: 0.5,
            diversity: true,
        }
    }
}

impl RankerConfig {
    pub fn with_domain_terms<I, S>(mut self, terms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.domain_terms = terms.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_diversity(mut self, enabled: bool) -> Self {
        self.diversity = enabled;
        self
    }

    pub fn with_keyword_weight(mut self, weight: f32) -> Self {
        self.keyword_weight = weight;
        self
    }

    /// Cap clamped into `[0, 0.95]` so a score can never reach zero from boosts alone.
    pub fn effective_max_reduction(&self) -> f32 {
        self.max_reduction.clamp(0.0, 0.95)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RankerConfig::default();
        assert!(config.max_reduction < 1.0);
        assert!(config.domain_terms.is_empty());
        assert!(config.diversity);
    }

    #[test]
    fn test_partial_deserialize_uses_defaults() {
        let config: RankerConfig =
            serde_json::from_str(r#"{"domain_terms": ["lupus"], "max_reduction": 3.0}"#).unwrap();
        assert_eq!(config.domain_terms, vec!["lupus".to_string()]);
        assert_eq!(config.website_boost, 0.10);
        assert_eq!(config.effective_max_reduction(), 0.95);
    }
}
