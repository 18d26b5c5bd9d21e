use crate::error::CoreError;

use std::sync::atomic::{AtomicUsize, Ordering};

/// Round-robin over the configured provider API keys.
///
/// Shared by every request the orchestrator serves, so consecutive LLM calls
/// spread across keys regardless of which request makes them.
#[derive(Debug)]
pub struct ApiKeyPool {
    keys: Vec<String>,
    cursor: AtomicUsize,
}

impl ApiKeyPool {
    pub fn new(keys: Vec<String>) -> Result<Self, CoreError> {
        let keys: Vec<String> = keys.into_iter().filter(|k| !k.trim().is_empty()).collect();
        if keys.is_empty() {
            return Err(CoreError::Config("No API keys configured".to_string()));
        }
        Ok(Self {
            keys,
            cursor: AtomicUsize::new(0),
        })
    }

    /// The next key in rotation.
    pub fn next_key(&self) -> &str {
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.keys.len();
        &self.keys[index]
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotates_in_order_and_wraps() {
        let pool = ApiKeyPool::new(vec!["a".into(), "b".into(), "c".into()]).unwrap();
        let drawn: Vec<&str> = (0..7).map(|_| pool.next_key()).collect();
        assert_eq!(drawn, vec!["a", "b", "c", "a", "b", "c", "a"]);
    }

    #[test]
    fn empty_pool_is_a_configuration_error() {
        assert!(matches!(ApiKeyPool::new(vec![]), Err(CoreError::Config(_))));
        assert!(matches!(ApiKeyPool::new(vec!["  ".into()]), Err(CoreError::Config(_))));
    }
}
