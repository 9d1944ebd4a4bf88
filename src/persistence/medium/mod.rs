//! 键值文档存储介质
//!
//! 唯一接触持久化介质的一层：按集合（collection）划分命名空间的扁平键值存储。
//!
//! ## 实现
//!
//! - [`FileDocumentStore`]: 每个集合一个目录，每个键一个 JSON 文件（默认）
//! - [`SqliteDocumentStore`]: 单表 SQLite 数据库
//! - [`MemoryDocumentStore`]: 进程内存，用于测试
//!
//! 键由上层清洗后传入，介质不再做任何转换。

pub mod file;
pub mod memory;
pub mod sqlite;

#[cfg(test)]
pub(crate) mod testing;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::codec::Document;
use super::error::StoreError;
use crate::config::{PersistenceConfig, StorageBackend};

pub use file::FileDocumentStore;
pub use memory::MemoryDocumentStore;
pub use sqlite::SqliteDocumentStore;

/// 文档存储介质
///
/// - `put` 覆盖同键旧文档，返回前数据已落盘
/// - `get` 找不到时返回 `Ok(None)`，单个文档损坏时返回 `StoreError::Decode`
/// - `get_all` 跳过并记录损坏文档，不因一条坏记录而整体失败
/// - `delete` / `delete_all` 对不存在的目标是空操作
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// 介质名称（用于日志）
    fn kind(&self) -> &'static str;

    async fn put(&self, collection: &str, key: &str, document: &Document) -> Result<(), StoreError>;

    async fn get(&self, collection: &str, key: &str) -> Result<Option<Document>, StoreError>;

    async fn get_all(&self, collection: &str) -> Result<BTreeMap<String, Document>, StoreError>;

    async fn delete(&self, collection: &str, key: &str) -> Result<(), StoreError>;

    async fn delete_all(&self, collection: &str) -> Result<(), StoreError>;
}

/// 按配置创建存储介质
///
/// # Arguments
/// * `config` - 持久化配置
/// * `base_dir` - 基础目录（相对路径的 `store_dir` 以此为准）
pub fn open_medium(
    config: &PersistenceConfig,
    base_dir: &Path,
) -> Result<Arc<dyn DocumentStore>, StoreError> {
    let medium: Arc<dyn DocumentStore> = match config.backend {
        StorageBackend::File => {
            let dir = config.resolve_store_dir(base_dir);
            Arc::new(FileDocumentStore::new(dir)?)
        }
        StorageBackend::Sqlite => {
            let path = config.resolve_store_dir(base_dir).join(&config.sqlite_file);
            Arc::new(SqliteDocumentStore::open(&path)?)
        }
        StorageBackend::Memory => Arc::new(MemoryDocumentStore::new()),
    };

    info!("存储介质已就绪: {}", medium.kind());

    Ok(medium)
}
