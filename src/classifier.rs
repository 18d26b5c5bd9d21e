//! Numerical vs contextual question classifier.
//!
//! Artifacts are exported once from the training pipeline as JSON (a TF-IDF
//! vectorizer and a fitted model) and are never refit here. Preprocessing must
//! stay byte-for-byte compatible with what the model was trained on.

use crate::error::CoreError;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::Path;

/// Which branch of the pipeline a question belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    Numerical,
    Contextual,
}

impl Classification {
    pub fn from_label(label: i64) -> Self {
        if label == 1 {
            Classification::Numerical
        } else {
            Classification::Contextual
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Numerical => "numerical",
            Classification::Contextual => "contextual",
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// --- Artifact format ---

fn default_ngram_range() -> (usize, usize) {
    (1, 1)
}

fn default_token_pattern() -> String {
    r"(?u)\b\w\w+\b".to_string()
}

fn default_norm() -> Option<String> {
    Some("l2".to_string())
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct VectorizerArtifact {
    pub vocabulary: HashMap<String, usize>,
    pub idf: Vec<f64>,
    #[serde(default = "default_ngram_range")]
    pub ngram_range: (usize, usize),
    #[serde(default)]
    pub sublinear_tf: bool,
    #[serde(default = "default_norm")]
    pub norm: Option<String>,
    #[serde(default = "default_token_pattern")]
    pub token_pattern: String,
    #[serde(default = "default_true")]
    pub lowercase: bool,
}

/// One fitted decision tree in scikit-learn's flat array layout.
#[derive(Debug, Clone, Deserialize)]
pub struct TreeArtifact {
    pub children_left: Vec<i64>,
    pub children_right: Vec<i64>,
    pub feature: Vec<i64>,
    pub threshold: Vec<f64>,
    /// Per-node class weights, one entry per class.
    pub value: Vec<Vec<f64>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelArtifact {
    Linear { coef: Vec<f64>, intercept: f64 },
    Forest { classes: Vec<i64>, trees: Vec<TreeArtifact> },
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClassifierArtifacts {
    pub vectorizer: VectorizerArtifact,
    pub model: ModelArtifact,
    #[serde(default)]
    pub lemma_exceptions: HashMap<String, String>,
}

// --- Preprocessing ---

static PUNCTUATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^\w\s]").expect("punctuation pattern is valid"));

// WordNet's noun detachment rules, in WordNet's order.
const NOUN_SUFFIX_RULES: &[(&str, &str)] = &[
    ("s", ""),
    ("ses", "s"),
    ("xes", "x"),
    ("zes", "z"),
    ("ches", "ch"),
    ("shes", "sh"),
    ("men", "man"),
    ("ies", "y"),
];

/// A noun lemmatizer that uses the vectorizer vocabulary as its lexicon.
///
/// A candidate lemma is only accepted if the vocabulary knows it, which is the
/// only case in which the choice can change the feature vector.
#[derive(Debug, Clone, Default)]
pub struct Lemmatizer {
    lexicon: std::collections::HashSet<String>,
    exceptions: HashMap<String, String>,
}

impl Lemmatizer {
    pub fn new(
        lexicon: impl IntoIterator<Item = String>,
        exceptions: HashMap<String, String>,
    ) -> Self {
        Self {
            lexicon: lexicon.into_iter().filter(|t| !t.contains(' ')).collect(),
            exceptions,
        }
    }

    pub fn lemmatize(&self, word: &str) -> String {
        if let Some(lemma) = self.exceptions.get(word) {
            return lemma.clone();
        }
        let mut candidates: Vec<String> = Vec::new();
        if self.lexicon.contains(word) {
            candidates.push(word.to_string());
        }
        for (suffix, replacement) in NOUN_SUFFIX_RULES {
            if let Some(stem) = word.strip_suffix(suffix) {
                let form = format!("{}{}", stem, replacement);
                if !form.is_empty() && self.lexicon.contains(&form) {
                    candidates.push(form);
                }
            }
        }
        candidates
            .into_iter()
            .min_by_key(|c| c.chars().count())
            .unwrap_or_else(|| word.to_string())
    }
}

/// Lowercase, strip punctuation, tokenize, lemmatize, rejoin with single spaces.
pub fn preprocess(text: &str, lemmatizer: &Lemmatizer) -> String {
    let lowered = text.to_lowercase();
    let stripped = PUNCTUATION.replace_all(&lowered, "");
    stripped
        .split_whitespace()
        .map(|token| lemmatizer.lemmatize(token))
        .collect::<Vec<_>>()
        .join(" ")
}

// --- Vectorizer ---

/// A frozen TF-IDF vectorizer equivalent to scikit-learn's `transform`.
#[derive(Debug, Clone)]
pub struct TfidfVectorizer {
    vocabulary: HashMap<String, usize>,
    idf: Vec<f64>,
    ngram_range: (usize, usize),
    sublinear_tf: bool,
    norm: Option<String>,
    token_pattern: Regex,
    lowercase: bool,
}

/// Sparse feature vector, ordered by feature index.
pub type SparseVector = BTreeMap<usize, f64>;

impl TfidfVectorizer {
    pub fn from_artifact(artifact: VectorizerArtifact) -> Result<Self, CoreError> {
        let token_pattern = Regex::new(&artifact.token_pattern).map_err(|e| {
            CoreError::Artifact(format!("Invalid token pattern '{}': {}", artifact.token_pattern, e))
        })?;
        let (min_n, max_n) = artifact.ngram_range;
        if min_n == 0 || min_n > max_n {
            return Err(CoreError::Artifact(format!(
                "Invalid ngram range ({}, {})",
                min_n, max_n
            )));
        }
        if let Some((term, &index)) = artifact
            .vocabulary
            .iter()
            .find(|(_, &index)| index >= artifact.idf.len())
        {
            return Err(CoreError::Artifact(format!(
                "Vocabulary term '{}' has index {} but only {} idf weights exist",
                term,
                index,
                artifact.idf.len()
            )));
        }
        match artifact.norm.as_deref() {
            None | Some("l1") | Some("l2") => {}
            Some(other) => {
                return Err(CoreError::Artifact(format!("Unsupported norm '{}'", other)));
            }
        }
        Ok(Self {
            vocabulary: artifact.vocabulary,
            idf: artifact.idf,
            ngram_range: (min_n, max_n),
            sublinear_tf: artifact.sublinear_tf,
            norm: artifact.norm,
            token_pattern,
            lowercase: artifact.lowercase,
        })
    }

    pub fn n_features(&self) -> usize {
        self.idf.len()
    }

    pub fn vocabulary(&self) -> impl Iterator<Item = &String> {
        self.vocabulary.keys()
    }

    pub fn transform(&self, document: &str) -> SparseVector {
        let text = if self.lowercase {
            document.to_lowercase()
        } else {
            document.to_string()
        };
        let tokens: Vec<&str> = self.token_pattern.find_iter(&text).map(|m| m.as_str()).collect();

        let mut counts: BTreeMap<usize, f64> = BTreeMap::new();
        let (min_n, max_n) = self.ngram_range;
        for n in min_n..=max_n {
            for window in tokens.windows(n) {
                let gram = window.join(" ");
                if let Some(&index) = self.vocabulary.get(&gram) {
                    *counts.entry(index).or_insert(0.0) += 1.0;
                }
            }
        }

        let mut vector: SparseVector = counts
            .into_iter()
            .map(|(index, count)| {
                let tf = if self.sublinear_tf { 1.0 + count.ln() } else { count };
                (index, tf * self.idf[index])
            })
            .collect();

        let norm = match self.norm.as_deref() {
            Some("l2") => vector.values().map(|v| v * v).sum::<f64>().sqrt(),
            Some("l1") => vector.values().map(|v| v.abs()).sum::<f64>(),
            _ => 0.0,
        };
        if norm > 0.0 {
            vector.values_mut().for_each(|v| *v /= norm);
        }
        vector
    }
}

// --- Model ---

#[derive(Debug, Clone)]
enum Model {
    Linear { coef: Vec<f64>, intercept: f64 },
    Forest { classes: Vec<i64>, trees: Vec<TreeArtifact> },
}

impl Model {
    fn from_artifact(artifact: ModelArtifact, n_features: usize) -> Result<Self, CoreError> {
        match artifact {
            ModelArtifact::Linear { coef, intercept } => {
                if coef.len() != n_features {
                    return Err(CoreError::Artifact(format!(
                        "Linear model has {} coefficients for {} features",
                        coef.len(),
                        n_features
                    )));
                }
                Ok(Model::Linear { coef, intercept })
            }
            ModelArtifact::Forest { classes, trees } => {
                if classes.is_empty() || trees.is_empty() {
                    return Err(CoreError::Artifact("Forest has no classes or no trees".to_string()));
                }
                for (t, tree) in trees.iter().enumerate() {
                    validate_tree(tree, classes.len(), n_features)
                        .map_err(|msg| CoreError::Artifact(format!("Tree {}: {}", t, msg)))?;
                }
                Ok(Model::Forest { classes, trees })
            }
        }
    }

    fn predict(&self, x: &SparseVector) -> i64 {
        match self {
            Model::Linear { coef, intercept } => {
                let score: f64 = x.iter().map(|(&i, v)| coef[i] * v).sum::<f64>() + intercept;
                if score > 0.0 {
                    1
                } else {
                    0
                }
            }
            Model::Forest { classes, trees } => {
                let mut totals = vec![0.0; classes.len()];
                for tree in trees {
                    let leaf = &tree.value[leaf_index(tree, x)];
                    let weight: f64 = leaf.iter().sum();
                    if weight > 0.0 {
                        for (total, v) in totals.iter_mut().zip(leaf) {
                            *total += v / weight;
                        }
                    }
                }
                // First maximum wins, matching numpy's argmax.
                let mut best = 0;
                for (i, total) in totals.iter().enumerate() {
                    if *total > totals[best] {
                        best = i;
                    }
                }
                classes[best]
            }
        }
    }
}

fn validate_tree(tree: &TreeArtifact, n_classes: usize, n_features: usize) -> Result<(), String> {
    let n = tree.children_left.len();
    if n == 0 {
        return Err("empty tree".to_string());
    }
    if tree.children_right.len() != n
        || tree.feature.len() != n
        || tree.threshold.len() != n
        || tree.value.len() != n
    {
        return Err("node arrays have different lengths".to_string());
    }
    for node in 0..n {
        let (left, right) = (tree.children_left[node], tree.children_right[node]);
        if tree.value[node].len() != n_classes {
            return Err(format!("node {} has {} class weights", node, tree.value[node].len()));
        }
        if left == -1 {
            continue;
        }
        // Children always come after their parent, which also rules out cycles.
        let in_range = |child: i64| child > node as i64 && (child as usize) < n;
        if !in_range(left) || !in_range(right) {
            return Err(format!("node {} has invalid children ({}, {})", node, left, right));
        }
        if tree.feature[node] < 0 || tree.feature[node] as usize >= n_features {
            return Err(format!("node {} splits on unknown feature {}", node, tree.feature[node]));
        }
    }
    Ok(())
}

fn leaf_index(tree: &TreeArtifact, x: &SparseVector) -> usize {
    let mut node = 0usize;
    while tree.children_left[node] != -1 {
        let feature = tree.feature[node] as usize;
        let value = x.get(&feature).copied().unwrap_or(0.0);
        node = if value <= tree.threshold[node] {
            tree.children_left[node] as usize
        } else {
            tree.children_right[node] as usize
        };
    }
    node
}

// --- Classifier ---

/// Preprocess → vectorize → predict. Deterministic for fixed artifacts.
#[derive(Debug, Clone)]
pub struct QueryClassifier {
    lemmatizer: Lemmatizer,
    vectorizer: TfidfVectorizer,
    model: Model,
}

impl QueryClassifier {
    pub fn from_artifacts(artifacts: ClassifierArtifacts) -> Result<Self, CoreError> {
        let vectorizer = TfidfVectorizer::from_artifact(artifacts.vectorizer)?;
        let model = Model::from_artifact(artifacts.model, vectorizer.n_features())?;
        let lemmatizer = Lemmatizer::new(
            vectorizer.vocabulary().cloned(),
            artifacts.lemma_exceptions,
        );
        Ok(Self {
            lemmatizer,
            vectorizer,
            model,
        })
    }

    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let raw = fs::read_to_string(path).map_err(|e| {
            CoreError::Artifact(format!("Cannot read classifier artifacts at {}: {}", path.display(), e))
        })?;
        let artifacts: ClassifierArtifacts = serde_json::from_str(&raw).map_err(|e| {
            CoreError::Artifact(format!("Malformed classifier artifacts at {}: {}", path.display(), e))
        })?;
        let classifier = Self::from_artifacts(artifacts)?;
        log::info!(
            "Loaded question classifier from {} ({} features)",
            path.display(),
            classifier.vectorizer.n_features()
        );
        Ok(classifier)
    }

    pub fn preprocess(&self, question: &str) -> String {
        preprocess(question, &self.lemmatizer)
    }

    pub fn classify(&self, question: &str) -> Classification {
        let features = self.vectorizer.transform(&self.preprocess(question));
        Classification::from_label(self.model.predict(&features))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lemmatizer(words: &[&str]) -> Lemmatizer {
        Lemmatizer::new(words.iter().map(|w| w.to_string()), HashMap::new())
    }

    #[test]
    fn preprocess_lowercases_strips_and_lemmatizes() {
        let lem = lemmatizer(&["revenue", "company", "what"]);
        assert_eq!(
            preprocess("What were the Companies'   REVENUES?!", &lem),
            "what were the company revenue"
        );
    }

    #[test]
    fn lemmatizer_keeps_words_without_known_lemma() {
        let lem = lemmatizer(&["loss"]);
        // "los" is not a known word, so "loss" stays.
        assert_eq!(lem.lemmatize("loss"), "loss");
        assert_eq!(lem.lemmatize("losses"), "loss");
        assert_eq!(lem.lemmatize("xyzzies"), "xyzzies");
    }

    #[test]
    fn exceptions_take_priority() {
        let mut exceptions = HashMap::new();
        exceptions.insert("data".to_string(), "datum".to_string());
        let lem = Lemmatizer::new(vec!["data".to_string()], exceptions);
        assert_eq!(lem.lemmatize("data"), "datum");
    }

    #[test]
    fn tfidf_matches_sklearn_l2_normalisation() {
        let mut vocabulary = HashMap::new();
        vocabulary.insert("revenue".to_string(), 0);
        vocabulary.insert("risk".to_string(), 1);
        let vectorizer = TfidfVectorizer::from_artifact(VectorizerArtifact {
            vocabulary,
            idf: vec![1.0, 2.0],
            ngram_range: (1, 1),
            sublinear_tf: false,
            norm: Some("l2".to_string()),
            token_pattern: default_token_pattern(),
            lowercase: true,
        })
        .unwrap();

        let x = vectorizer.transform("revenue risk risk a");
        let norm = (1.0f64 + 16.0).sqrt();
        assert!((x[&0] - 1.0 / norm).abs() < 1e-12);
        assert!((x[&1] - 4.0 / norm).abs() < 1e-12);
        assert!(vectorizer.transform("nothing known").is_empty());
    }

    #[test]
    fn tree_with_backward_child_is_rejected() {
        let tree = TreeArtifact {
            children_left: vec![1, -1],
            children_right: vec![0, -1],
            feature: vec![0, -2],
            threshold: vec![0.5, -2.0],
            value: vec![vec![1.0, 1.0], vec![1.0, 0.0]],
        };
        assert!(validate_tree(&tree, 2, 1).is_err());
    }
}
