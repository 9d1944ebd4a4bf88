//! 任务状态存储
//!
//! 下载/上传引擎唯一使用的持久化入口。四类记录共用一组泛型接口：
//!
//! ```text
//! store / retrieve / retrieve_all / remove / update
//! ```
//!
//! 任何记录操作都会先等待启动迁移结束（只执行一次），因此不会读到迁移到一半的数据。
//!
//! ## 降级模式
//!
//! 迁移失败时仍然可用：
//! - 写入总是落到当前 schema 的集合
//! - 读取先查当前集合，找不到再查旧集合并在内存中升级
//! - 删除同时作用于两套集合，避免旧数据「复活」

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::codec::{from_document, sanitize_task_id, to_document, Category, Document, Record};
use super::error::StoreError;
use super::medium::{open_medium, DocumentStore};
use super::migration::{MigrationCoordinator, MigrationOutcome, MigrationReport};
use super::schema::{apply_chain, CollectionLayout, MigrationRegistry, SchemaIdentity, UpgradeFn};
use super::types::TaskRecord;
use crate::config::PersistenceConfig;

/// 存储选项
#[derive(Debug, Clone, Default)]
pub struct StoreOptions {
    /// 迁移成功后清空旧集合
    pub purge_legacy_after_migration: bool,
}

impl From<&PersistenceConfig> for StoreOptions {
    fn from(config: &PersistenceConfig) -> Self {
        Self {
            purge_legacy_after_migration: config.purge_legacy_after_migration,
        }
    }
}

/// 降级模式下读取旧集合所需的信息
#[derive(Debug)]
struct LegacyFallback {
    layout: CollectionLayout,
    chain: Vec<UpgradeFn>,
}

impl LegacyFallback {
    /// 只有能识别且能升级的旧 schema 才有回退读取
    fn resolve(registry: &MigrationRegistry, from: &SchemaIdentity) -> Option<Self> {
        if !registry.recognizes(from) {
            return None;
        }
        let chain = registry
            .chain(from.version, registry.current_identity().version)
            .ok()?;
        let layout = registry.version(from.version)?.layout;
        if layout == registry.current_layout() {
            return None;
        }
        Some(Self { layout, chain })
    }

    fn upgrade<R: Record>(&self, key: &str, document: Document) -> Result<R, StoreError> {
        let collection = self.layout.collection(R::CATEGORY);
        let upgraded = apply_chain(&self.chain, R::CATEGORY, document)
            .map_err(|reason| StoreError::decode(collection, key, reason))?;
        decode(collection, key, upgraded)
    }
}

/// 启动迁移完成后的状态
#[derive(Debug)]
struct InitState {
    outcome: MigrationOutcome,
    fallback: Option<LegacyFallback>,
}

/// 任务状态存储
pub struct TaskStateStore {
    medium: Arc<dyn DocumentStore>,
    registry: Arc<MigrationRegistry>,
    coordinator: MigrationCoordinator,
    /// 初始化屏障
    init: OnceCell<InitState>,
}

impl std::fmt::Debug for TaskStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskStateStore")
            .field("medium", &self.medium.kind())
            .field("current", &self.registry.current_identity())
            .field("initialized", &self.init.initialized())
            .finish()
    }
}

impl TaskStateStore {
    /// 创建存储（不立即迁移，首次操作或 [`initialize`](Self::initialize) 时执行）
    pub fn new(
        medium: Arc<dyn DocumentStore>,
        registry: MigrationRegistry,
        options: StoreOptions,
    ) -> Self {
        let registry = Arc::new(registry);
        let coordinator = MigrationCoordinator::new(Arc::clone(&medium), Arc::clone(&registry))
            .with_purge_legacy(options.purge_legacy_after_migration);

        Self {
            medium,
            registry,
            coordinator,
            init: OnceCell::new(),
        }
    }

    /// 使用内置版本历史和默认选项
    pub fn with_medium(medium: Arc<dyn DocumentStore>) -> Self {
        Self::new(medium, MigrationRegistry::builtin(), StoreOptions::default())
    }

    /// 创建并完成启动迁移
    pub async fn open(
        medium: Arc<dyn DocumentStore>,
        registry: MigrationRegistry,
        options: StoreOptions,
    ) -> Self {
        let store = Self::new(medium, registry, options);
        store.initialize().await;
        store
    }

    /// 按配置打开存储
    ///
    /// # Arguments
    /// * `config` - 持久化配置
    /// * `base_dir` - 相对路径的基准目录
    pub async fn from_config(
        config: &PersistenceConfig,
        base_dir: &Path,
    ) -> Result<Self, StoreError> {
        let medium = open_medium(config, base_dir)?;
        Ok(Self::open(medium, MigrationRegistry::builtin(), StoreOptions::from(config)).await)
    }

    /// 执行启动迁移（只执行一次，并发调用者等待同一个结果）
    pub async fn initialize(&self) -> &MigrationOutcome {
        &self.ready().await.outcome
    }

    /// 启动迁移结果，尚未初始化时为 None
    pub fn migration_outcome(&self) -> Option<&MigrationOutcome> {
        self.init.get().map(|state| &state.outcome)
    }

    /// 是否运行在降级模式
    pub fn is_degraded(&self) -> bool {
        self.migration_outcome()
            .map(|outcome| !outcome.is_success())
            .unwrap_or(false)
    }

    pub fn medium_kind(&self) -> &'static str {
        self.medium.kind()
    }

    /// 当前代码期望的 schema
    pub fn current_schema_identity(&self) -> SchemaIdentity {
        self.registry.current_identity()
    }

    /// 介质上记录的 schema
    pub async fn stored_schema_identity(&self) -> Result<SchemaIdentity, StoreError> {
        self.coordinator.stored_identity().await
    }

    /// 手动从 `from` 迁移到当前 schema（版本已一致时为空操作）
    pub async fn migrate(&self, from: &SchemaIdentity) -> Result<MigrationReport, StoreError> {
        self.ready().await;
        self.coordinator.migrate(from).await
    }

    async fn ready(&self) -> &InitState {
        self.init
            .get_or_init(|| async {
                let outcome = self.coordinator.run().await;
                let fallback = outcome
                    .degraded_from()
                    .and_then(|from| LegacyFallback::resolve(&self.registry, from));
                if let Some(fallback) = &fallback {
                    warn!(
                        "降级模式：未迁移的数据将从旧集合读取 ({:?})",
                        fallback.layout
                    );
                }
                InitState { outcome, fallback }
            })
            .await
    }

    fn collection(&self, category: Category) -> &'static str {
        self.registry.current_layout().collection(category)
    }

    // ========================================================================
    // 记录操作
    // ========================================================================

    /// 保存记录（同 ID 覆盖）
    ///
    /// 返回 Ok 时记录已持久化；返回 Err 时调用方不应假设已写入
    pub async fn store<R: Record>(&self, record: &R) -> Result<(), StoreError> {
        self.ready().await;

        let collection = self.collection(R::CATEGORY);
        let key = sanitize_task_id(record.task_id());
        let document = to_document(record).map_err(|e| StoreError::Encode {
            reason: e.to_string(),
        })?;

        self.medium.put(collection, &key, &document).await?;
        debug!("已保存 {}: {}", R::CATEGORY, record.task_id());
        Ok(())
    }

    /// 按任务 ID 读取记录
    ///
    /// 不存在返回 `Ok(None)`；文档损坏返回 `StoreError::Decode`
    pub async fn retrieve<R: Record>(&self, task_id: &str) -> Result<Option<R>, StoreError> {
        let state = self.ready().await;

        let collection = self.collection(R::CATEGORY);
        let key = sanitize_task_id(task_id);

        if let Some(document) = self.medium.get(collection, &key).await? {
            return decode(collection, &key, document).map(Some);
        }

        match &state.fallback {
            Some(fallback) => {
                let legacy = fallback.layout.collection(R::CATEGORY);
                match self.medium.get(legacy, &key).await? {
                    Some(document) => {
                        debug!("从旧集合读取 {}: {}", R::CATEGORY, task_id);
                        fallback.upgrade(&key, document).map(Some)
                    }
                    None => Ok(None),
                }
            }
            None => Ok(None),
        }
    }

    /// 读取某一类别的全部记录，跳过无法解码的文档
    pub async fn retrieve_all<R: Record>(&self) -> Result<Vec<R>, StoreError> {
        let state = self.ready().await;

        let collection = self.collection(R::CATEGORY);
        let documents = self.medium.get_all(collection).await?;
        let mut seen: HashSet<String> = HashSet::with_capacity(documents.len());
        let mut records = Vec::with_capacity(documents.len());

        for (key, document) in documents {
            match decode::<R>(collection, &key, document) {
                Ok(record) => records.push(record),
                Err(e) => warn!("跳过无法解码的记录: {}", e),
            }
            seen.insert(key);
        }

        if let Some(fallback) = &state.fallback {
            let legacy = fallback.layout.collection(R::CATEGORY);
            let documents = self.medium.get_all(legacy).await?;
            for (key, document) in documents {
                // 当前集合中的同键记录优先
                if seen.contains(&key) {
                    continue;
                }
                match fallback.upgrade::<R>(&key, document) {
                    Ok(record) => records.push(record),
                    Err(e) => warn!("跳过无法升级的旧记录: {}", e),
                }
            }
        }

        debug!("读取 {} 条 {} 记录", records.len(), R::CATEGORY);
        Ok(records)
    }

    /// 删除记录
    ///
    /// `Some(id)` 只删除该 ID（空字符串也是合法 ID）；`None` 清空整个类别。
    /// 目标不存在时为空操作
    pub async fn remove<R: Record>(&self, task_id: Option<&str>) -> Result<(), StoreError> {
        let state = self.ready().await;

        let collection = self.collection(R::CATEGORY);
        let legacy = state
            .fallback
            .as_ref()
            .map(|fallback| fallback.layout.collection(R::CATEGORY));

        match task_id {
            Some(task_id) => {
                let key = sanitize_task_id(task_id);
                self.medium.delete(collection, &key).await?;
                if let Some(legacy) = legacy {
                    self.medium.delete(legacy, &key).await?;
                }
                debug!("已删除 {}: {}", R::CATEGORY, task_id);
            }
            None => {
                self.medium.delete_all(collection).await?;
                if let Some(legacy) = legacy {
                    self.medium.delete_all(legacy).await?;
                }
                info!("已清空 {} 记录", R::CATEGORY);
            }
        }

        Ok(())
    }

    /// 读取 -> 修改 -> 写回
    ///
    /// 记录不存在时返回 `Ok(false)`，不会调用 `updater`
    pub async fn update<R, F>(&self, task_id: &str, updater: F) -> Result<bool, StoreError>
    where
        R: Record,
        F: FnOnce(&mut R) + Send,
    {
        let Some(mut record) = self.retrieve::<R>(task_id).await? else {
            return Ok(false);
        };

        updater(&mut record);
        self.store(&record).await?;
        Ok(true)
    }

    /// 清理过期的终态任务记录
    ///
    /// 删除状态为完成/失败/取消且 `updated_at` 早于 `retention_days` 天前的记录。
    /// 截止时间超出可表示的时间范围时没有记录过期
    ///
    /// # Returns
    /// 删除的记录数
    pub async fn purge_finished_task_records(
        &self,
        retention_days: u32,
    ) -> Result<usize, StoreError> {
        let Some(cutoff) = Utc::now().checked_sub_signed(Duration::days(i64::from(retention_days)))
        else {
            debug!("保留期 {} 天超出时间范围，跳过清理", retention_days);
            return Ok(0);
        };

        let expired: Vec<String> = self
            .retrieve_all::<TaskRecord>()
            .await?
            .into_iter()
            .filter(|record| record.status.is_terminal() && record.updated_at < cutoff)
            .map(|record| record.task_id)
            .collect();

        for task_id in &expired {
            self.remove::<TaskRecord>(Some(task_id)).await?;
        }

        if !expired.is_empty() {
            info!(
                "已清理 {} 条超过 {} 天的终态任务记录",
                expired.len(),
                retention_days
            );
        }

        Ok(expired.len())
    }
}

fn decode<R: Record>(collection: &str, key: &str, document: Document) -> Result<R, StoreError> {
    from_document(document).map_err(|e| StoreError::decode(collection, key, e))
}

// ============================================================================
// 单元测试
// ============================================================================
