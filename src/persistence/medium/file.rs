//! 文件文档存储
//!
//! ## 文件结构
//!
//! ```text
//! {root}/
//! ├── task_records/
//! │   ├── {key}.json
//! │   └── .{uuid}.tmp             # 写入中的临时文件
//! ├── resume_data/
//! └── __schema/identity.json
//! ```
//!
//! 写入流程：临时文件 -> flush + fsync -> 原子重命名 -> fsync 目录。
//! 进程在任意时刻崩溃，目标文件要么是旧文档，要么是新文档。
//!
//! 键直接作为文件名，受文件系统文件名长度限制（常见为 255 字节，含 `.json` 后缀）。
//! 超长的键写入时返回 `StoreError::MediumUnavailable`。

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, warn};
use uuid::Uuid;

use super::DocumentStore;
use crate::persistence::codec::Document;
use crate::persistence::error::StoreError;

/// 文档文件扩展名
const DOC_EXTENSION: &str = "json";

/// 临时文件后缀
const TEMP_SUFFIX: &str = ".tmp";

/// 文件文档存储
#[derive(Debug, Clone)]
pub struct FileDocumentStore {
    root: PathBuf,
}

impl FileDocumentStore {
    /// 创建文件存储，根目录不存在时自动创建
    pub fn new(root: PathBuf) -> Result<Self, StoreError> {
        ensure_dir(&root)?;
        debug!("文件存储根目录: {:?}", root);
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn collection_dir(&self, collection: &str) -> PathBuf {
        self.root.join(collection)
    }
}

// ============================================================================
// 辅助函数
// ============================================================================

/// 获取文档文件路径：`{dir}/{key}.json`
fn get_document_path(dir: &Path, key: &str) -> PathBuf {
    dir.join(format!("{}.{}", key, DOC_EXTENSION))
}

/// 确保目录存在
fn ensure_dir(dir: &Path) -> io::Result<()> {
    if !dir.exists() {
        fs::create_dir_all(dir)?;
        debug!("已创建目录: {:?}", dir);
    }
    Ok(())
}

/// 重命名后同步目录项，否则断电可能丢失重命名本身
#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

/// 在阻塞线程池上执行文件 I/O
async fn run_blocking<T, F>(f: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}

// ============================================================================
// 同步文件操作
// ============================================================================

/// 写入文档
///
/// 每次写入使用独立的临时文件名，同键并发写入互不破坏，结果为后写入者胜出。
/// 临时文件名与键无关，长度不受键影响
fn write_document(dir: &Path, key: &str, document: &Document) -> io::Result<()> {
    ensure_dir(dir)?;

    let path = get_document_path(dir, key);
    let temp_path = dir.join(format!(".{}{}", Uuid::new_v4().simple(), TEMP_SUFFIX));

    let result = write_and_rename(&temp_path, &path, document).and_then(|_| sync_dir(dir));

    if result.is_err() && temp_path.exists() {
        if let Err(e) = fs::remove_file(&temp_path) {
            warn!("删除临时文件失败 {:?}: {}", temp_path, e);
        }
    }

    result
}

fn write_and_rename(temp_path: &Path, path: &Path, document: &Document) -> io::Result<()> {
    let file = File::create(temp_path)?;
    let mut writer = BufWriter::new(file);

    serde_json::to_writer_pretty(&mut writer, document).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Failed to serialize document: {}", e),
        )
    })?;

    writer.flush()?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    drop(file);

    // 原子重命名
    fs::rename(temp_path, path)?;

    debug!("已写入文档: {:?}", path);

    Ok(())
}

/// 读取单个文档文件
///
/// 外层错误为 I/O 错误，内层错误为 JSON 解析错误
fn load_document_from_path(path: &Path) -> io::Result<Result<Document, serde_json::Error>> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    Ok(serde_json::from_reader(reader))
}

fn read_document(dir: &Path, collection: &str, key: &str) -> Result<Option<Document>, StoreError> {
    let path = get_document_path(dir, key);

    match load_document_from_path(&path) {
        Ok(Ok(document)) => Ok(Some(document)),
        Ok(Err(e)) => {
            warn!("文档解析失败 {:?}: {}", path, e);
            Err(StoreError::decode(collection, key, e))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// 扫描集合目录中的所有文档
///
/// 跳过无法读取或解析的文件，以及写入中断残留的临时文件
fn scan_documents(dir: &Path) -> Result<BTreeMap<String, Document>, StoreError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => return Err(e.into()),
    };

    let mut documents = BTreeMap::new();
    let mut skipped = 0;

    for entry in entries {
        let path = entry?.path();

        if !path.is_file() {
            continue;
        }

        let file_name = match path.file_name().and_then(|s| s.to_str()) {
            Some(name) => name,
            None => continue,
        };

        let key = match file_name.strip_suffix(&format!(".{}", DOC_EXTENSION)) {
            Some(key) => key.to_string(),
            None => continue,
        };

        match load_document_from_path(&path) {
            Ok(Ok(document)) => {
                documents.insert(key, document);
            }
            Ok(Err(e)) => {
                warn!("跳过无效文档文件 {:?}: {}", path, e);
                skipped += 1;
            }
            Err(e) => {
                warn!("跳过无法读取的文档文件 {:?}: {}", path, e);
                skipped += 1;
            }
        }
    }

    if skipped > 0 {
        warn!("扫描 {:?} 完成，跳过 {} 个无效文件", dir, skipped);
    }

    debug!("扫描到 {} 个文档: {:?}", documents.len(), dir);

    Ok(documents)
}

fn remove_document(dir: &Path, key: &str) -> io::Result<()> {
    let path = get_document_path(dir, key);
    match fs::remove_file(&path) {
        Ok(()) => {
            debug!("已删除文档: {:?}", path);
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// 删除集合中的所有文档（包括残留临时文件）
fn remove_all_documents(dir: &Path) -> io::Result<usize> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let doc_suffix = format!(".{}", DOC_EXTENSION);
    let mut deleted = 0;

    for entry in entries {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }

        let is_ours = path
            .file_name()
            .and_then(|s| s.to_str())
            .map(|name| name.ends_with(&doc_suffix) || name.ends_with(TEMP_SUFFIX))
            .unwrap_or(false);

        if is_ours {
            match fs::remove_file(&path) {
                Ok(()) => deleted += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
    }

    debug!("已删除 {:?} 中的 {} 个文件", dir, deleted);

    Ok(deleted)
}

// ============================================================================
// DocumentStore 实现
// ============================================================================

#[async_trait]
impl DocumentStore for FileDocumentStore {
    fn kind(&self) -> &'static str {
        "file"
    }

    async fn put(&self, collection: &str, key: &str, document: &Document) -> Result<(), StoreError> {
        let dir = self.collection_dir(collection);
        let key = key.to_string();
        let document = document.clone();
        run_blocking(move || Ok(write_document(&dir, &key, &document)?)).await
    }

    async fn get(&self, collection: &str, key: &str) -> Result<Option<Document>, StoreError> {
        let dir = self.collection_dir(collection);
        let collection = collection.to_string();
        let key = key.to_string();
        run_blocking(move || read_document(&dir, &collection, &key)).await
    }

    async fn get_all(&self, collection: &str) -> Result<BTreeMap<String, Document>, StoreError> {
        let dir = self.collection_dir(collection);
        run_blocking(move || scan_documents(&dir)).await
    }

    async fn delete(&self, collection: &str, key: &str) -> Result<(), StoreError> {
        let dir = self.collection_dir(collection);
        let key = key.to_string();
        run_blocking(move || Ok(remove_document(&dir, &key)?)).await
    }

    async fn delete_all(&self, collection: &str) -> Result<(), StoreError> {
        let dir = self.collection_dir(collection);
        run_blocking(move || {
            remove_all_documents(&dir)?;
            Ok(())
        })
        .await
    }
}

// ============================================================================
// 单元测试
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn setup_store() -> (TempDir, FileDocumentStore) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = FileDocumentStore::new(temp_dir.path().join("store")).unwrap();
        (temp_dir, store)
    }

    #[test]
    fn test_get_document_path() {
        let path = get_document_path(Path::new("/tmp/store/task_records"), "task_123");
        assert_eq!(path, PathBuf::from("/tmp/store/task_records/task_123.json"));
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let (_temp, store) = setup_store();
        let doc = json!({ "task_id": "t1", "status": "running" });

        store.put("task_records", "t1", &doc).await.unwrap();

        let loaded = store.get("task_records", "t1").await.unwrap();
        assert_eq!(loaded, Some(doc));
        assert!(store.root().join("task_records/t1.json").exists());
    }

    #[tokio::test]
    async fn test_get_missing_returns_none() {
        let (_temp, store) = setup_store();
        assert_eq!(store.get("task_records", "nope").await.unwrap(), None);
        assert_eq!(store.get("never_written", "nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_put_overwrites() {
        let (_temp, store) = setup_store();
        store.put("c", "k", &json!({ "v": 1 })).await.unwrap();
        store.put("c", "k", &json!({ "v": 2 })).await.unwrap();

        assert_eq!(store.get("c", "k").await.unwrap(), Some(json!({ "v": 2 })));
        assert_eq!(store.get_all("c").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_no_temp_files_left_after_put() {
        let (_temp, store) = setup_store();
        store.put("c", "k", &json!({ "v": 1 })).await.unwrap();

        let leftovers: Vec<_> = fs::read_dir(store.root().join("c"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(TEMP_SUFFIX))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_document_fails_get_only() {
        let (_temp, store) = setup_store();
        store.put("c", "good", &json!({ "v": 1 })).await.unwrap();
        fs::write(store.root().join("c/bad.json"), "not valid json").unwrap();

        let err = store.get("c", "bad").await.unwrap_err();
        assert!(err.is_decode());

        let all = store.get_all("c").await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(all.contains_key("good"));
    }

    #[tokio::test]
    async fn test_get_all_ignores_temp_files() {
        let (_temp, store) = setup_store();
        store.put("c", "a", &json!({ "v": "a" })).await.unwrap();
        fs::write(store.root().join("c/.0123abcd.tmp"), "{\"v\":").unwrap();

        let all = store.get_all("c").await.unwrap();
        assert_eq!(all.keys().collect::<Vec<_>>(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_get_all_empty_collection() {
        let (_temp, store) = setup_store();
        assert!(store.get_all("empty").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_and_delete_all() {
        let (_temp, store) = setup_store();
        for i in 1..=3 {
            store
                .put("c", &format!("task_{:03}", i), &json!({ "i": i }))
                .await
                .unwrap();
        }

        store.delete("c", "task_001").await.unwrap();
        store.delete("c", "task_001").await.unwrap();
        assert_eq!(store.get("c", "task_001").await.unwrap(), None);
        assert_eq!(store.get_all("c").await.unwrap().len(), 2);

        store.delete_all("c").await.unwrap();
        assert!(store.get_all("c").await.unwrap().is_empty());

        store.delete_all("c").await.unwrap();
        store.delete_all("never_written").await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_key_is_a_real_key() {
        let (_temp, store) = setup_store();
        store.put("c", "", &json!({ "empty": true })).await.unwrap();
        store.put("c", "x", &json!({ "empty": false })).await.unwrap();

        assert_eq!(
            store.get("c", "").await.unwrap(),
            Some(json!({ "empty": true }))
        );
        let all = store.get_all("c").await.unwrap();
        assert!(all.contains_key(""));
        assert!(all.contains_key("x"));
    }

    #[tokio::test]
    async fn test_documents_survive_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("store");

        {
            let store = FileDocumentStore::new(root.clone()).unwrap();
            store.put("c", "k", &json!({ "v": 42 })).await.unwrap();
        }

        let reopened = FileDocumentStore::new(root).unwrap();
        assert_eq!(reopened.get("c", "k").await.unwrap(), Some(json!({ "v": 42 })));
    }

    #[tokio::test]
    async fn test_long_key_within_file_name_limit() {
        let (_temp, store) = setup_store();
        // 250 字节 + ".json" 恰好不超过 255 字节
        let key = "k".repeat(250);
        let doc = json!({ "data": "offset=4096" });

        store.put("resume_data", &key, &doc).await.unwrap();
        assert_eq!(store.get("resume_data", &key).await.unwrap(), Some(doc));
        assert!(store.get_all("resume_data").await.unwrap().contains_key(&key));
    }
}
