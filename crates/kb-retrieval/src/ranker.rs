//! Hybrid re-ranking of nearest-neighbor candidates.
//!
//! `score = distance * (1 - min(reduction, max_reduction))`, lower is better.
//! Candidates are sorted by `(score, -overlap, distance, position)`, then the
//! diversity pass promotes a different source type into the top results when
//! one exists in the pool.

use std::cmp::Ordering;
use std::collections::HashSet;

use kb_types::{ChunkMetadata, SourceType};
use kb_vector::ScoredChunk;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::RankerConfig;
use crate::tokenize::term_set;

/// A re-ranked search result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedChunk {
    pub id: String,
    pub text: String,
    pub metadata: ChunkMetadata,
    /// Raw squared L2 distance
    pub distance: f32,
    /// Re-ranked score, lower is better
    pub score: f32,
    /// Distinct query terms found in the text
    pub keyword_overlap: usize,
    #[serde(skip)]
    position: usize,
}

impl RankedChunk {
    pub fn source_type(&self) -> SourceType {
        self.metadata.source_type
    }
}

/// Re-ranks candidates using keyword overlap, source boosts and diversity.
#[derive(Debug, Clone)]
pub struct HybridRanker {
    config: RankerConfig,
    stopwords: HashSet<String>,
    markers: Vec<String>,
    url_patterns: Vec<String>,
    domain_terms: Vec<String>,
}

impl Default for HybridRanker {
    fn default() -> Self {
        Self::new(RankerConfig::default())
    }
}

fn lowered(items: &[String]) -> Vec<String> {
    items
        .iter()
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

impl HybridRanker {
    pub fn new(config: RankerConfig) -> Self {
        Self {
            stopwords: config.stopwords.iter().map(|s| s.to_lowercase()).collect(),
            markers: lowered(&config.structure_markers),
            url_patterns: lowered(&config.topic_url_patterns),
            domain_terms: lowered(&config.domain_terms),
            config,
        }
    }

    pub fn config(&self) -> &RankerConfig {
        &self.config
    }

    /// Re-rank `candidates` for `query` and keep the best `k`.
    ///
    /// Diversity applies from `k >= 2`. A single requested result is always
    /// the best-scoring candidate, whatever its source type.
    pub fn rank(&self, query: &str, candidates: Vec<ScoredChunk>, k: usize) -> Vec<RankedChunk> {
        if k == 0 || candidates.is_empty() {
            return Vec::new();
        }

        let query_terms = term_set(query, &self.stopwords);
        let max_reduction = self.config.effective_max_reduction();

        let mut ranked: Vec<RankedChunk> = candidates
            .into_iter()
            .map(|c| {
                let overlap = self.keyword_overlap(&query_terms, &c.text);
                let reduction = self.config.keyword_weight * overlap as f32
                    + self.source_reduction(&c.text, &c.metadata);
                let factor = 1.0 - reduction.clamp(0.0, max_reduction);
                RankedChunk {
                    score: c.distance * factor,
                    keyword_overlap: overlap,
                    id: c.id,
                    text: c.text,
                    metadata: c.metadata,
                    distance: c.distance,
                    position: c.position,
                }
            })
            .collect();

        ranked.sort_by(compare_ranked);

        if self.config.diversity {
            enforce_diversity(&mut ranked, k);
        }
        ranked.truncate(k);

        debug!(
            query_terms = query_terms.len(),
            returned = ranked.len(),
            "Ranked candidates"
        );
        ranked
    }

    fn keyword_overlap(&self, query_terms: &HashSet<String>, text: &str) -> usize {
        if query_terms.is_empty() {
            return 0;
        }
        let text_terms = term_set(text, &self.stopwords);
        query_terms.intersection(&text_terms).count()
    }

    /// Summed source-type reduction before capping.
    fn source_reduction(&self, text: &str, metadata: &ChunkMetadata) -> f32 {
        if metadata.source_type != SourceType::Website {
            return 0.0;
        }

        let cfg = &self.config;
        let lower = text.to_lowercase();
        let mut total = cfg.website_boost;

        if self.markers.iter().any(|m| lower.contains(m.as_str())) {
            total += cfg.structure_marker_boost;
        }

        if let Some(url) = &metadata.url {
            let url = url.to_lowercase();
            if self.url_patterns.iter().any(|p| url.contains(p.as_str())) {
                total += cfg.topic_url_boost;
            }
        }

        if metadata.page_number.is_some_and(|p| p > 1) {
            total += cfg.page_boost;
        }

        let terms_found = self
            .domain_terms
            .iter()
            .filter(|t| lower.contains(t.as_str()))
            .count();
        total += cfg.domain_term_boost * terms_found as f32;

        total
    }
}

fn compare_ranked(a: &RankedChunk, b: &RankedChunk) -> Ordering {
    a.score
        .total_cmp(&b.score)
        .then_with(|| b.keyword_overlap.cmp(&a.keyword_overlap))
        .then_with(|| a.distance.total_cmp(&b.distance))
        .then_with(|| a.position.cmp(&b.position))
}

/// Move the best candidate of a different type from `from..` into `slot`.
fn promote_other_type(
    ranked: &mut Vec<RankedChunk>,
    dominant: SourceType,
    from: usize,
    slot: usize,
) -> bool {
    let Some(offset) = ranked[from..]
        .iter()
        .position(|c| c.source_type() != dominant)
    else {
        return false;
    };
    let item = ranked.remove(from + offset);
    debug!(
        id = %item.id,
        source_type = item.source_type().as_str(),
        slot = slot,
        "Promoted for source diversity"
    );
    ranked.insert(slot, item);
    true
}

fn single_type(items: &[RankedChunk]) -> Option<SourceType> {
    let first = items.first()?.source_type();
    items
        .iter()
        .all(|c| c.source_type() == first)
        .then_some(first)
}

/// No-op for `k < 2`: one slot cannot hold two source types.
fn enforce_diversity(ranked: &mut Vec<RankedChunk>, k: usize) {
    let cutoff = k.min(ranked.len());
    if k < 2 || cutoff == ranked.len() {
        return;
    }

    if cutoff >= 3 {
        if let Some(dominant) = single_type(&ranked[..3]) {
            promote_other_type(ranked, dominant, 3, 2);
        }
    }

    if let Some(dominant) = single_type(&ranked[..cutoff]) {
        promote_other_type(ranked, dominant, cutoff, cutoff - 1);
    }
}
