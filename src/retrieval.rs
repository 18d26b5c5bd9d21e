use crate::error::CoreError;

use serde::Serialize;

pub const UNKNOWN_SOURCE: &str = "Unknown Source";

/// A passage returned by the index, ranked from 1 (most similar).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievedChunk {
    pub text: String,
    pub source: String,
    pub rank: usize,
}

/// Similarity search over the document corpus.
///
/// Implementations must fail with `IndexUnavailable` when the index cannot be
/// consulted, never with an empty list.
pub trait DocumentRetriever: Send + Sync {
    fn retrieve(&self, query: &str, k: usize) -> Result<Vec<RetrievedChunk>, CoreError>;
}

/// Turns `(text, source)` pairs that are already in similarity order into at most
/// `k` ranked chunks.
pub fn rank_hits<I>(hits: I, k: usize) -> Vec<RetrievedChunk>
where
    I: IntoIterator<Item = (String, Option<String>)>,
{
    hits.into_iter()
        .take(k)
        .enumerate()
        .map(|(i, (text, source))| RetrievedChunk {
            text,
            source: source
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| UNKNOWN_SOURCE.to_string()),
            rank: i + 1,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranks_start_at_one_and_respect_k() {
        let hits = vec![
            ("a".to_string(), Some("10-K.txt".to_string())),
            ("b".to_string(), None),
            ("c".to_string(), Some("q3.txt".to_string())),
        ];
        let ranked = rank_hits(hits, 2);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].rank, 1);
        assert_eq!(ranked[1].rank, 2);
        assert_eq!(ranked[1].source, UNKNOWN_SOURCE);
    }
}
