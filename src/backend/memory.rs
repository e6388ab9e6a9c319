//! In-process key-value handler

use super::{ResourceArgs, ResourceHandler, ResourceResponse};
use crate::error::{EsiError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::RwLock;

/// Serves content from a map held in memory
///
/// Useful for static fragments registered at startup and for tests.
#[derive(Debug, Default)]
pub struct MemoryHandler {
    entries: RwLock<HashMap<String, Bytes>>,
}

impl MemoryHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: impl Into<String>, value: impl Into<Bytes>) {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(key.into(), value.into());
        }
    }

    pub fn remove(&self, key: &str) -> Option<Bytes> {
        self.entries.write().ok()?.remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Into<String>, V: Into<Bytes>> FromIterator<(K, V)> for MemoryHandler {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let handler = MemoryHandler::new();
        for (k, v) in iter {
            handler.insert(k, v);
        }
        handler
    }
}

#[async_trait]
impl ResourceHandler for MemoryHandler {
    fn name(&self) -> &str {
        "memory"
    }

    async fn do_request(&self, args: &ResourceArgs) -> Result<ResourceResponse> {
        let key = args.lookup_key();
        let entries = self
            .entries
            .read()
            .map_err(|_| EsiError::InternalError("memory store lock poisoned".to_string()))?;
        match entries.get(key) {
            Some(value) => Ok(ResourceResponse::new(value.clone())),
            None => Err(EsiError::ResourceNotFound(key.to_string())),
        }
    }
}
