//! In-process object store, used by tests and single-node demos

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

use super::{validate_key, ObjectMeta, ObjectStore};
use crate::error::{BundlecastError, Result};

#[derive(Clone, Default)]
pub struct MemoryObjectStore {
    objects: Arc<DashMap<String, (Vec<u8>, ObjectMeta)>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Keys under a prefix, sorted
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .objects
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn meta(&self, key: &str) -> Option<ObjectMeta> {
        self.objects.get(key).map(|entry| entry.value().1.clone())
    }

    /// Overwrite stored bytes without validation, for corruption tests
    pub fn tamper(&self, key: &str, data: Vec<u8>) {
        if let Some(mut entry) = self.objects.get_mut(key) {
            entry.value_mut().0 = data;
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, data: Vec<u8>, meta: ObjectMeta) -> Result<()> {
        validate_key(key)?;
        self.objects.insert(key.to_string(), (data, meta));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.objects
            .get(key)
            .map(|entry| entry.value().0.clone())
            .ok_or_else(|| BundlecastError::not_found("object", key))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects.remove(key);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
