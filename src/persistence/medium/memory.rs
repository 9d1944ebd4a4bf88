//! 内存文档存储
//!
//! 进程内存中的实现，重启即丢失。每个测试各自持有一个实例，互不干扰。

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use dashmap::DashMap;

use super::DocumentStore;
use crate::persistence::codec::Document;
use crate::persistence::error::StoreError;

/// 内存文档存储
///
/// Key: 集合名称，Value: 该集合的 键 -> 文档 映射
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    collections: DashMap<String, HashMap<String, Document>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 集合中的文档数量
    pub fn len(&self, collection: &str) -> usize {
        self.collections
            .get(collection)
            .map(|docs| docs.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn put(&self, collection: &str, key: &str, document: &Document) -> Result<(), StoreError> {
        self.collections
            .entry(collection.to_string())
            .or_default()
            .insert(key.to_string(), document.clone());
        Ok(())
    }

    async fn get(&self, collection: &str, key: &str) -> Result<Option<Document>, StoreError> {
        Ok(self
            .collections
            .get(collection)
            .and_then(|docs| docs.get(key).cloned()))
    }

    async fn get_all(&self, collection: &str) -> Result<BTreeMap<String, Document>, StoreError> {
        Ok(self
            .collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete(&self, collection: &str, key: &str) -> Result<(), StoreError> {
        if let Some(mut docs) = self.collections.get_mut(collection) {
            docs.remove(key);
        }
        Ok(())
    }

    async fn delete_all(&self, collection: &str) -> Result<(), StoreError> {
        self.collections.remove(collection);
        Ok(())
    }
}
