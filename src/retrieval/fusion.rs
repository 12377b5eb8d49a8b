//! Reciprocal Rank Fusion over every (variant, mode) list

use super::{ContentType, ListId, RankedList, SearchMode};
use crate::config::RetrievalConfig;
use crate::error::{RagError, Result};
use ahash::{HashMap, HashMapExt, HashSet, HashSetExt};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Subtitle cue timings such as `00:12.345 --> 00:15.000`
const TIMESTAMP_PATTERN: &str = r"\d{2}:\d{2}\.\d{3}\s*-->\s*\d{2}:\d{2}\.\d{3}";

/// One list's contribution to a fused chunk
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Contribution {
    pub list: ListId,
    pub rank: usize,
    /// `weight / (k + rank)`
    pub score: f64,
}

/// One unique chunk after fusion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedResult {
    pub doc_id: String,
    pub chunk_id: String,
    pub content_type: ContentType,
    pub text: String,
    /// Sum of all contributions
    pub score: f64,
    /// In traversal order
    pub contributions: Vec<Contribution>,
    /// Position of the first sighting in the traversal; lower wins ties
    pub first_seen: usize,
}

/// RRF: `score(chunk) = sum over lists of weight(mode) / (k + rank)`
///
/// Lists are traversed in (variant, mode, rank) order, vector before keyword,
/// which fixes `first_seen` and therefore the tie order. Identical inputs
/// always produce identical output regardless of the order lists arrive in.
#[derive(Debug, Clone)]
pub struct FusionRanker {
    k: f64,
    vector_weight: f64,
    keyword_weight: f64,
    timestamps: Regex,
}

impl FusionRanker {
    pub fn new(k: f64, vector_weight: f64, keyword_weight: f64) -> Result<Self> {
        if !(k.is_finite() && k > 0.0) {
            return Err(RagError::InvalidConfigValue {
                path: "retrieval.rrf_k".to_string(),
                message: format!("RRF k must be a positive number, got {}", k),
            });
        }
        for (path, weight) in [
            ("retrieval.vector_weight", vector_weight),
            ("retrieval.keyword_weight", keyword_weight),
        ] {
            if !(weight.is_finite() && weight > 0.0) {
                return Err(RagError::InvalidConfigValue {
                    path: path.to_string(),
                    message: format!("Fusion weight must be a positive number, got {}", weight),
                });
            }
        }

        let timestamps = Regex::new(TIMESTAMP_PATTERN)
            .map_err(|e| RagError::Config(format!("Invalid timestamp pattern: {}", e)))?;

        Ok(Self {
            k,
            vector_weight,
            keyword_weight,
            timestamps,
        })
    }

    pub fn from_config(config: &RetrievalConfig) -> Result<Self> {
        Self::new(config.rrf_k, config.vector_weight, config.keyword_weight)
    }

    pub fn k(&self) -> f64 {
        self.k
    }

    fn weight(&self, mode: SearchMode) -> f64 {
        match mode {
            SearchMode::Vector => self.vector_weight,
            SearchMode::Keyword => self.keyword_weight,
        }
    }

    /// Merge ranked lists into one deduplicated list, best first
    ///
    /// A chunk repeated within a single list counts once, at its best rank.
    pub fn fuse(&self, lists: &[RankedList]) -> Vec<FusedResult> {
        let mut ordered: Vec<&RankedList> = lists.iter().collect();
        ordered.sort_by_key(|l| l.list);

        let mut fused: Vec<FusedResult> = Vec::new();
        let mut slots: HashMap<&str, usize> = HashMap::new();
        let mut seen_order = 0usize;

        for ranked in ordered {
            let mut hits: Vec<_> = ranked.hits.iter().collect();
            hits.sort_by_key(|h| h.rank);

            let mut in_list: HashSet<&str> = HashSet::with_capacity(hits.len());
            for hit in hits {
                let order = seen_order;
                seen_order += 1;

                if !in_list.insert(hit.chunk_id.as_str()) {
                    continue;
                }

                let contribution = Contribution {
                    list: ranked.list,
                    rank: hit.rank,
                    score: self.weight(ranked.list.mode) / (self.k + hit.rank as f64),
                };

                match slots.get(hit.chunk_id.as_str()) {
                    Some(&slot) => {
                        let entry = &mut fused[slot];
                        entry.score += contribution.score;
                        entry.contributions.push(contribution);
                    }
                    None => {
                        slots.insert(hit.chunk_id.as_str(), fused.len());
                        fused.push(FusedResult {
                            doc_id: hit.doc_id.clone(),
                            chunk_id: hit.chunk_id.clone(),
                            content_type: hit.content_type,
                            text: strip_timestamps(&self.timestamps, &hit.text),
                            score: contribution.score,
                            contributions: vec![contribution],
                            first_seen: order,
                        });
                    }
                }
            }
        }

        fused.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.first_seen.cmp(&b.first_seen))
        });
        fused
    }
}

/// Remove subtitle timestamps and collapse the whitespace they leave behind
pub fn strip_timestamps(pattern: &Regex, text: &str) -> String {
    if !pattern.is_match(text) {
        return text.to_string();
    }
    pattern
        .replace_all(text, " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
