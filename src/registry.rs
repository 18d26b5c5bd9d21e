use crate::classifier::QueryClassifier;
use crate::config::Settings;
use crate::embed::Embedder;
use crate::error::CoreError;
use crate::retrieval::DocumentRetriever;
use crate::vector::VectorStore;

use log::{info, warn};
use std::sync::Arc;

enum RetrieverSlot {
    Ready(Arc<dyn DocumentRetriever>),
    Unavailable(String),
}

/// Read-only artifacts loaded once at startup and shared by every request.
pub struct ModelRegistry {
    classifier: QueryClassifier,
    retriever: RetrieverSlot,
}

impl ModelRegistry {
    pub fn new(classifier: QueryClassifier, retriever: Arc<dyn DocumentRetriever>) -> Self {
        Self {
            classifier,
            retriever: RetrieverSlot::Ready(retriever),
        }
    }

    /// A registry whose contextual branch reports `reason` on every request.
    pub fn without_index(classifier: QueryClassifier, reason: impl Into<String>) -> Self {
        Self {
            classifier,
            retriever: RetrieverSlot::Unavailable(reason.into()),
        }
    }

    /// Loads the classifier and opens the vector index.
    ///
    /// A broken classifier is fatal. A missing index is not: the numerical
    /// branch keeps working and contextual questions get `IndexUnavailable`.
    pub fn load(settings: &Settings) -> Result<Self, CoreError> {
        let classifier = QueryClassifier::load(&settings.classifier_path)?;

        let opened = Embedder::new(&settings.embedding_model).and_then(|embedder| {
            VectorStore::open(&settings.index_dir, &settings.chunk_db_path, Arc::new(embedder))
        });
        match opened {
            Ok(store) => {
                info!("Vector index ready at {}", settings.index_dir.display());
                Ok(Self::new(classifier, Arc::new(store)))
            }
            Err(e) => {
                warn!("{}", e);
                let reason = match e {
                    CoreError::IndexUnavailable(reason) => reason,
                    other => other.to_string(),
                };
                Ok(Self::without_index(classifier, reason))
            }
        }
    }

    pub fn classifier(&self) -> &QueryClassifier {
        &self.classifier
    }

    pub fn retriever(&self) -> Result<&dyn DocumentRetriever, CoreError> {
        match &self.retriever {
            RetrieverSlot::Ready(retriever) => Ok(retriever.as_ref()),
            RetrieverSlot::Unavailable(reason) => Err(CoreError::IndexUnavailable(reason.clone())),
        }
    }
}
