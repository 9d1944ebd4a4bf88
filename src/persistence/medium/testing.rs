//! 测试用的可注入故障的存储介质

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{DocumentStore, MemoryDocumentStore};
use crate::persistence::codec::Document;
use crate::persistence::error::StoreError;
use crate::persistence::schema::SCHEMA_COLLECTION;

/// 包装内存介质：可让指定集合的写入失败，并统计版本戳写入次数
#[derive(Debug, Default)]
pub struct FaultyDocumentStore {
    inner: MemoryDocumentStore,
    failing_collection: Mutex<Option<String>>,
    schema_writes: AtomicUsize,
}

impl FaultyDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 之后写入该集合的操作都返回 `MediumUnavailable`
    pub fn fail_puts_to(&self, collection: &str) {
        *self.failing_collection.lock() = Some(collection.to_string());
    }

    /// 恢复正常
    pub fn heal(&self) {
        *self.failing_collection.lock() = None;
    }

    pub fn schema_writes(&self) -> usize {
        self.schema_writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentStore for FaultyDocumentStore {
    fn kind(&self) -> &'static str {
        "faulty"
    }

    async fn put(&self, collection: &str, key: &str, document: &Document) -> Result<(), StoreError> {
        if self.failing_collection.lock().as_deref() == Some(collection) {
            return Err(StoreError::MediumUnavailable(format!(
                "injected failure: {}/{}",
                collection, key
            )));
        }
        if collection == SCHEMA_COLLECTION {
            self.schema_writes.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.put(collection, key, document).await
    }

    async fn get(&self, collection: &str, key: &str) -> Result<Option<Document>, StoreError> {
        self.inner.get(collection, key).await
    }

    async fn get_all(&self, collection: &str) -> Result<BTreeMap<String, Document>, StoreError> {
        self.inner.get_all(collection).await
    }

    async fn delete(&self, collection: &str, key: &str) -> Result<(), StoreError> {
        self.inner.delete(collection, key).await
    }

    async fn delete_all(&self, collection: &str) -> Result<(), StoreError> {
        self.inner.delete_all(collection).await
    }
}
