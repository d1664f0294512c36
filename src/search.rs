//! Semantic search over journal entries and topics: embed the query, scan
//! the stored vectors, score by dot product (vectors are unit length, so
//! this is cosine), keep everything above the per-table threshold.
//! Deliberately O(n·D) with a recency-capped scan.

use rayon::prelude::*;

use crate::{Embedder, Store};

pub(crate) const TAU_JOURNAL: f32 = 0.30;
pub(crate) const TAU_TOPIC: f32 = 0.35;
pub(crate) const N_CANDIDATES: usize = 500;

#[derive(Debug, Clone)]
pub(crate) struct SearchHit {
    pub(crate) id: String,
    pub(crate) label: String,
    pub(crate) content: String,
    pub(crate) timestamp: i64,
    pub(crate) score: f32,
}

pub(crate) fn search_journal(
    store: &Store,
    embedder: &Embedder,
    query: &str,
    k: usize,
) -> Result<Vec<SearchHit>, String> {
    let query_vec = embedder.embed_query(query)?;
    let candidates = store
        .list_journal_with_embeddings(N_CANDIDATES)
        .map_err(|e| e.to_string())?;
    let pool: Vec<(String, String, String, i64, Vec<f32>)> = candidates
        .into_iter()
        .map(|(entry, vector)| (entry.id, entry.topic, entry.content, entry.timestamp, vector))
        .collect();
    Ok(rank(pool, &query_vec, TAU_JOURNAL, k))
}

pub(crate) fn search_topics(
    store: &Store,
    embedder: &Embedder,
    query: &str,
    k: usize,
) -> Result<Vec<SearchHit>, String> {
    let query_vec = embedder.embed_query(query)?;
    let candidates = store
        .list_topics_with_embeddings(N_CANDIDATES)
        .map_err(|e| e.to_string())?;
    let pool: Vec<(String, String, String, i64, Vec<f32>)> = candidates
        .into_iter()
        .map(|(topic, vector)| (topic.id, topic.name, topic.content, topic.updated_at, vector))
        .collect();
    Ok(rank(pool, &query_vec, TAU_TOPIC, k))
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Score every candidate, drop those at or below `tau`, sort by score
/// descending with newest-first tie-breaking, take `k`.
pub(crate) fn rank(
    pool: Vec<(String, String, String, i64, Vec<f32>)>,
    query: &[f32],
    tau: f32,
    k: usize,
) -> Vec<SearchHit> {
    let mut scored: Vec<SearchHit> = pool
        .into_par_iter()
        .filter_map(|(id, label, content, timestamp, vector)| {
            if vector.len() != query.len() {
                return None;
            }
            let score = dot(query, &vector);
            if score <= tau {
                return None;
            }
            Some(SearchHit {
                id,
                label,
                content,
                timestamp,
                score,
            })
        })
        .collect();
    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.timestamp.cmp(&a.timestamp))
    });
    scored.truncate(k);
    scored
}

pub(crate) fn format_hits(hits: &[SearchHit]) -> String {
    if hits.is_empty() {
        return "No matches.".to_string();
    }
    let mut out = String::new();
    for (i, hit) in hits.iter().enumerate() {
        out.push_str(&format!(
            "{}. [{:.3}] {} — {}\n",
            i + 1,
            hit.score,
            hit.label,
            hit.content.replace('\n', " ")
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(id: &str, ts: i64, v: Vec<f32>) -> (String, String, String, i64, Vec<f32>) {
        (id.to_string(), id.to_string(), format!("content {id}"), ts, v)
    }

    #[test]
    fn test_rank_orders_by_score() {
        let query = vec![1.0, 0.0];
        let pool = vec![
            cand("low", 1, vec![0.5, 0.866]),
            cand("high", 2, vec![0.99, 0.141]),
            cand("mid", 3, vec![0.8, 0.6]),
        ];
        let hits = rank(pool, &query, 0.30, 10);
        let ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["high", "mid", "low"]);
    }

    #[test]
    fn test_rank_drops_at_or_below_tau() {
        let query = vec![1.0, 0.0];
        let pool = vec![
            cand("below", 1, vec![0.2, 0.9798]),
            cand("exact", 2, vec![0.30, 0.9539]),
            cand("above", 3, vec![0.31, 0.9507]),
        ];
        let hits = rank(pool, &query, 0.30, 10);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "above");
    }

    #[test]
    fn test_rank_ties_newest_first() {
        let query = vec![1.0, 0.0];
        let pool = vec![
            cand("older", 100, vec![0.9, 0.4359]),
            cand("newer", 200, vec![0.9, 0.4359]),
        ];
        let hits = rank(pool, &query, 0.0, 10);
        assert_eq!(hits[0].id, "newer");
        assert_eq!(hits[1].id, "older");
    }

    #[test]
    fn test_format_hits() {
        assert_eq!(format_hits(&[]), "No matches.");
        let hits = vec![SearchHit {
            id: "1".into(),
            label: "coffee".into(),
            content: "likes dark\nroast".into(),
            timestamp: 5,
            score: 0.91234,
        }];
        let text = format_hits(&hits);
        assert!(text.starts_with("1. [0.912] coffee"));
        // newlines inside content are flattened for the tool reply
        assert!(text.contains("likes dark roast"));
    }

    #[test]
    fn test_rank_skips_dimension_mismatch_and_truncates() {
        let query = vec![1.0, 0.0];
        let pool = vec![
            cand("bad-dim", 1, vec![1.0, 0.0, 0.0]),
            cand("a", 2, vec![0.9, 0.4359]),
            cand("b", 3, vec![0.8, 0.6]),
        ];
        let hits = rank(pool, &query, 0.0, 1);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "a");
    }
}
