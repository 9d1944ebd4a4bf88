//! SQLite 文档存储
//!
//! 所有集合共用一张表：
//! - documents: (collection, key) 为主键，body 为 JSON 文本

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, warn};

use super::DocumentStore;
use crate::persistence::codec::Document;
use crate::persistence::error::StoreError;

/// SQLite 文档存储
#[derive(Clone)]
pub struct SqliteDocumentStore {
    /// SQLite 连接
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteDocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteDocumentStore").finish_non_exhaustive()
    }
}

impl SqliteDocumentStore {
    /// 打开（或创建）数据库文件
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        // 确保父目录存在
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)?;
        let store = Self::with_connection(conn)?;

        info!("SQLite 文档存储已打开: {:?}", db_path);

        Ok(store)
    }

    /// 内存数据库（测试用）
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        init_tables(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// 在阻塞线程池上持锁执行
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock();
            f(&guard)
        })
        .await?
    }
}

/// 初始化数据库表
fn init_tables(conn: &Connection) -> Result<(), StoreError> {
    // 每次提交都落盘
    conn.pragma_update(None, "synchronous", "FULL")?;

    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            collection TEXT NOT NULL,
            key TEXT NOT NULL,
            body TEXT NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (collection, key)
        )
        "#,
        [],
    )?;

    debug!("documents 表初始化完成");
    Ok(())
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    fn kind(&self) -> &'static str {
        "sqlite"
    }

    async fn put(&self, collection: &str, key: &str, document: &Document) -> Result<(), StoreError> {
        let body = serde_json::to_string(document).map_err(|e| StoreError::Encode {
            reason: e.to_string(),
        })?;
        let collection = collection.to_string();
        let key = key.to_string();

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO documents (collection, key, body, updated_at) VALUES (?1, ?2, ?3, ?4)",
                params![collection, key, body, Utc::now().timestamp_millis()],
            )?;
            debug!("已写入文档: {}/{}", collection, key);
            Ok(())
        })
        .await
    }

    async fn get(&self, collection: &str, key: &str) -> Result<Option<Document>, StoreError> {
        let collection = collection.to_string();
        let key = key.to_string();

        self.with_conn(move |conn| {
            let body: Option<String> = conn
                .query_row(
                    "SELECT body FROM documents WHERE collection = ?1 AND key = ?2",
                    params![collection, key],
                    |row| row.get(0),
                )
                .optional()?;

            match body {
                Some(body) => serde_json::from_str::<Document>(&body)
                    .map(Some)
                    .map_err(|e| StoreError::decode(&collection, &key, e)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn get_all(&self, collection: &str) -> Result<BTreeMap<String, Document>, StoreError> {
        let collection = collection.to_string();

        self.with_conn(move |conn| {
            let mut stmt = conn.prepare("SELECT key, body FROM documents WHERE collection = ?1")?;
            let rows = stmt.query_map(params![collection], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;

            let mut documents: BTreeMap<String, Document> = BTreeMap::new();
            for row in rows {
                let (key, body) = row?;
                match serde_json::from_str::<Document>(&body) {
                    Ok(document) => {
                        documents.insert(key, document);
                    }
                    Err(e) => warn!("跳过无效文档 {}/{}: {}", collection, key, e),
                }
            }

            debug!("扫描到 {} 个文档: {}", documents.len(), collection);
            Ok(documents)
        })
        .await
    }

    async fn delete(&self, collection: &str, key: &str) -> Result<(), StoreError> {
        let collection = collection.to_string();
        let key = key.to_string();

        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM documents WHERE collection = ?1 AND key = ?2",
                params![collection, key],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete_all(&self, collection: &str) -> Result<(), StoreError> {
        let collection = collection.to_string();

        self.with_conn(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM documents WHERE collection = ?1",
                params![collection],
            )?;
            debug!("已删除 {} 中的 {} 个文档", collection, deleted);
            Ok(())
        })
        .await
    }
}
