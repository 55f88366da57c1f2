//! Inverted index (C6): a tokenized TF-IDF index over one `(table,
//! column)` pair, maintained incrementally from the write path and
//! persisted as a single JSON metadata file (spec §4.6, §6).

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fixed small stop-word set (spec §4.6).
const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "has", "he", "in", "is",
    "it", "its", "of", "on", "that", "the", "to", "was", "were", "will", "with",
];

fn stop_words() -> &'static HashSet<&'static str> {
    static SET: OnceLock<HashSet<&'static str>> = OnceLock::new();
    SET.get_or_init(|| STOP_WORDS.iter().copied().collect())
}

/// Splits `text` into lowercased Unicode letter/digit runs, dropping stop
/// words. Tokenizing a string made of already-tokenized words is a no-op
/// beyond case-folding, so `tokenize` is idempotent on its own output
/// (invariant 5).
pub fn tokenize(text: &str) -> Vec<String> {
    let stops = stop_words();
    let mut tokens = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        if ch.is_alphanumeric() {
            current.extend(ch.to_lowercase());
        } else if !current.is_empty() {
            if !stops.contains(current.as_str()) {
                tokens.push(std::mem::take(&mut current));
            } else {
                current.clear();
            }
        }
    }
    if !current.is_empty() && !stops.contains(current.as_str()) {
        tokens.push(current);
    }
    tokens
}

/// `token -> row_id -> term_frequency` for one indexed column.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvertedIndex {
    postings: BTreeMap<String, BTreeMap<Uuid, f64>>,
    /// token count per document, needed to recompute TF on update/delete.
    doc_lengths: HashMap<Uuid, usize>,
}

impl InvertedIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Indexes `text` under `row_id`, replacing any prior postings for
    /// that row (the "update" maintenance hook, spec §4.6).
    pub fn index(&mut self, row_id: Uuid, text: &str) {
        self.delete(row_id);
        let tokens = tokenize(text);
        if tokens.is_empty() {
            return;
        }
        self.doc_lengths.insert(row_id, tokens.len());
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for t in &tokens {
            *counts.entry(t.as_str()).or_insert(0) += 1;
        }
        for (token, count) in counts {
            let tf = count as f64 / tokens.len() as f64;
            self.postings
                .entry(token.to_string())
                .or_default()
                .insert(row_id, tf);
        }
    }

    /// Removes every posting for `row_id`, dropping now-empty token
    /// entries entirely.
    pub fn delete(&mut self, row_id: Uuid) {
        self.doc_lengths.remove(&row_id);
        self.postings.retain(|_, docs| {
            docs.remove(&row_id);
            !docs.is_empty()
        });
    }

    pub fn document_count(&self) -> usize {
        self.doc_lengths.len()
    }

    fn posting(&self, token: &str) -> Option<&BTreeMap<Uuid, f64>> {
        self.postings.get(token)
    }

    /// Scores every row touched by any of `tokens` by summed TF·IDF,
    /// descending. IDF is computed from the union of posting sets for
    /// the query's own tokens (spec §4.6/SPEC_FULL §4), not full table
    /// cardinality, so only this index's state is needed.
    pub fn search(&self, query: &str) -> Vec<(Uuid, f64)> {
        let tokens = tokenize(query);
        let mut doc_ids: HashSet<Uuid> = HashSet::new();
        for token in &tokens {
            if let Some(postings) = self.posting(token) {
                doc_ids.extend(postings.keys().copied());
            }
        }
        let total_docs = doc_ids.len().max(1) as f64;

        let mut scores: HashMap<Uuid, f64> = HashMap::new();
        for token in &tokens {
            let Some(postings) = self.posting(token) else {
                continue;
            };
            let idf = (total_docs / postings.len() as f64).ln().max(0.0) + 1.0;
            for (&row_id, &tf) in postings {
                *scores.entry(row_id).or_insert(0.0) += tf * idf;
            }
        }
        let mut ranked: Vec<_> = scores.into_iter().collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        ranked
    }

    pub fn save(&self, path: impl AsRef<Path>) -> crate::error::Result<()> {
        let data = serde_json::to_vec_pretty(self)
            .map_err(|e| crate::error::SerengetiError::CorruptData(e.to_string()))?;
        std::fs::write(path, data)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> crate::error::Result<Self> {
        let data = std::fs::read(path)?;
        serde_json::from_slice(&data)
            .map_err(|e| crate::error::SerengetiError::CorruptData(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_idempotent() {
        let text = "The Database Storage Engine";
        let once = tokenize(text);
        let twice = tokenize(&once.join(" "));
        let mut a = once.clone();
        let mut b = twice.clone();
        a.sort();
        b.sort();
        assert_eq!(a, b);
    }

    #[test]
    fn search_orders_by_relevance() {
        let mut idx = InvertedIndex::new();
        let d1 = Uuid::new_v4();
        let d2 = Uuid::new_v4();
        let d3 = Uuid::new_v4();
        idx.index(d1, "database storage engine");
        idx.index(d2, "storage only");
        idx.index(d3, "engine tuning");

        let results = idx.search("storage engine");
        assert_eq!(results[0].0, d1);
        assert!(results[0].1 > 0.0);
        assert_eq!(results.len(), 3);
    }

    #[test]
    fn delete_drops_empty_tokens() {
        let mut idx = InvertedIndex::new();
        let d1 = Uuid::new_v4();
        idx.index(d1, "unique");
        idx.delete(d1);
        assert!(idx.postings.is_empty());
        assert_eq!(idx.document_count(), 0);
    }
}
