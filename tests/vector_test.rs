use finqa_core::{
    embed::TextEmbedder,
    error::CoreError,
    retrieval::DocumentRetriever,
    vector::{DocumentSource, VectorStore},
};
use serde_json::json;
use std::sync::Arc;

const KEYWORDS: [&str; 4] = ["revenue", "risk", "dividend", "supply"];

/// Counts keyword occurrences, one dimension per keyword.
struct KeywordEmbedder;

impl TextEmbedder for KeywordEmbedder {
    fn dimensions(&self) -> usize {
        KEYWORDS.len()
    }

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CoreError> {
        Ok(texts
            .iter()
            .map(|text| {
                let lower = text.to_lowercase();
                KEYWORDS
                    .iter()
                    .map(|k| lower.matches(k).count() as f32)
                    .collect()
            })
            .collect())
    }
}

fn doc(source: &str, chunk_number: i32, content: &str) -> DocumentSource {
    DocumentSource {
        source: source.to_string(),
        chunk_number,
        content: content.to_string(),
        metadata: json!({ "company": "tsla" }),
    }
}

#[test]
fn test_built_index_returns_ranked_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let store = VectorStore::create(
        &dir.path().join("index"),
        &dir.path().join("chunks.db"),
        Arc::new(KeywordEmbedder),
    )
    .unwrap();

    let added = store
        .add_documents_and_build(vec![
            doc("tsla_10k.txt", 0, "Supply chain risk and supply shortages are a key risk."),
            doc("ko_10k.txt", 0, "The dividend was raised for the 62nd year."),
            doc("mcd_q3.txt", 0, "Revenue grew on pricing."),
        ])
        .unwrap();
    assert_eq!(added, 3);
    assert_eq!(store.chunks().count().unwrap(), 3);

    let hits = store.retrieve("What supply risk does Tesla face?", 2).unwrap();
    assert!(!hits.is_empty() && hits.len() <= 2);
    assert_eq!(hits[0].source, "tsla_10k.txt");
    let ranks: Vec<usize> = hits.iter().map(|h| h.rank).collect();
    assert_eq!(ranks, (1..=hits.len()).collect::<Vec<_>>());

    assert!(store.retrieve("anything", 0).unwrap().is_empty());
}

#[test]
fn test_missing_index_is_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let result = VectorStore::open(
        &dir.path().join("index"),
        &dir.path().join("chunks.db"),
        Arc::new(KeywordEmbedder),
    );
    assert!(matches!(result, Err(CoreError::IndexUnavailable(_))));
}
