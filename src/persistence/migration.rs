//! schema 迁移协调器
//!
//! ## 迁移流程
//!
//! 1. 读取版本戳（不存在视为 legacy@v0）
//! 2. 与当前版本一致则直接返回
//! 3. 否则按登记表取出升级链，逐个集合：读取旧文档 -> 升级 -> 写入新集合 -> 回读校验
//! 4. 全部写入成功后才写版本戳
//!
//! 旧集合在迁移过程中只读不写：中途失败时旧数据仍可按原格式读取，
//! 下次启动从未变化的版本戳重新开始。新集合中已存在的键不会被覆盖，
//! 因此重复执行是幂等的。

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::codec::Category;
use super::error::StoreError;
use super::medium::DocumentStore;
use super::schema::{
    apply_chain, MigrationRegistry, SchemaIdentity, UpgradeFn, SCHEMA_COLLECTION, SCHEMA_KEY,
};

/// 单次迁移的统计信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub from: SchemaIdentity,
    pub to: SchemaIdentity,
    /// 成功迁移的文档数
    pub migrated: usize,
    /// 目标集合中已存在、保留未覆盖的文档数
    pub kept_existing: usize,
    /// 升级失败而跳过的文档（`collection/key`）
    pub skipped: Vec<String>,
    /// 是否已清空旧集合
    pub purged_legacy: bool,
}

impl MigrationReport {
    fn new(from: SchemaIdentity, to: SchemaIdentity) -> Self {
        Self {
            from,
            to,
            migrated: 0,
            kept_existing: 0,
            skipped: Vec::new(),
            purged_legacy: false,
        }
    }

    /// 是否为空操作（版本已一致）
    pub fn is_noop(&self) -> bool {
        self.from == self.to
    }
}

/// 启动迁移的结果
#[derive(Debug)]
pub enum MigrationOutcome {
    /// 版本一致，无需迁移
    UpToDate,
    /// 迁移完成
    Migrated(MigrationReport),
    /// 迁移失败，存储以降级模式运行
    ///
    /// `from` 为 None 表示连版本戳都无法读取
    Failed {
        from: Option<SchemaIdentity>,
        error: StoreError,
    },
}

impl MigrationOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failed { .. })
    }

    /// 降级模式下仍处于旧格式的 schema
    pub fn degraded_from(&self) -> Option<&SchemaIdentity> {
        match self {
            Self::Failed { from, .. } => from.as_ref(),
            _ => None,
        }
    }
}

/// 迁移协调器
pub struct MigrationCoordinator {
    medium: Arc<dyn DocumentStore>,
    registry: Arc<MigrationRegistry>,
    /// 迁移成功后是否清空旧集合
    purge_legacy: bool,
}

impl std::fmt::Debug for MigrationCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationCoordinator")
            .field("medium", &self.medium.kind())
            .field("current", &self.registry.current_identity())
            .field("purge_legacy", &self.purge_legacy)
            .finish()
    }
}

impl MigrationCoordinator {
    pub fn new(medium: Arc<dyn DocumentStore>, registry: Arc<MigrationRegistry>) -> Self {
        Self {
            medium,
            registry,
            purge_legacy: false,
        }
    }

    pub fn with_purge_legacy(mut self, purge_legacy: bool) -> Self {
        self.purge_legacy = purge_legacy;
        self
    }

    /// 当前代码期望的 schema（不读介质）
    pub fn current_identity(&self) -> SchemaIdentity {
        self.registry.current_identity()
    }

    /// 读取介质上的版本戳，不存在时返回 legacy@v0
    pub async fn stored_identity(&self) -> Result<SchemaIdentity, StoreError> {
        match self.medium.get(SCHEMA_COLLECTION, SCHEMA_KEY).await? {
            Some(document) => serde_json::from_value(document)
                .map_err(|e| StoreError::decode(SCHEMA_COLLECTION, SCHEMA_KEY, e)),
            None => Ok(SchemaIdentity::legacy()),
        }
    }

    /// 启动时执行：比较版本，必要时迁移
    ///
    /// 不会返回错误，失败时以 [`MigrationOutcome::Failed`] 告知调用方进入降级模式
    pub async fn run(&self) -> MigrationOutcome {
        let current = self.current_identity();

        let stored = match self.stored_identity().await {
            Ok(stored) => stored,
            Err(e) => {
                error!("读取 schema 版本戳失败，以降级模式继续运行: {}", e);
                return MigrationOutcome::Failed {
                    from: None,
                    error: e,
                };
            }
        };

        if stored == current {
            info!("schema 已是最新: {}", current);
            return MigrationOutcome::UpToDate;
        }

        info!("检测到 schema 变化: {} -> {}，开始迁移", stored, current);

        match self.migrate(&stored).await {
            Ok(report) => {
                info!(
                    "迁移完成: {} -> {}，迁移 {} 条，保留 {} 条，跳过 {} 条",
                    report.from,
                    report.to,
                    report.migrated,
                    report.kept_existing,
                    report.skipped.len()
                );
                MigrationOutcome::Migrated(report)
            }
            Err(e) => {
                error!("迁移失败，以降级模式继续运行: {}", e);
                MigrationOutcome::Failed {
                    from: Some(stored),
                    error: e,
                }
            }
        }
    }

    /// 从 `from` 迁移到当前版本
    ///
    /// 版本已一致时为空操作并返回成功
    pub async fn migrate(&self, from: &SchemaIdentity) -> Result<MigrationReport, StoreError> {
        let current = self.current_identity();
        let mut report = MigrationReport::new(from.clone(), current.clone());

        if *from == current {
            debug!("schema 已是 {}，跳过迁移", current);
            return Ok(report);
        }

        if !self.registry.recognizes(from) {
            return Err(StoreError::Migration(format!(
                "无法识别的 schema: {}（期望 {}）",
                from, self.registry.name()
            )));
        }

        let chain = self
            .registry
            .chain(from.version, current.version)
            .map_err(StoreError::Migration)?;

        let source = self
            .registry
            .version(from.version)
            .map(|v| v.layout)
            .ok_or_else(|| StoreError::Migration(format!("未登记的 schema 版本 v{}", from.version)))?;
        let destination = self.registry.current_layout();

        // 源集合与目标集合相同会变成原地覆盖，旧数据在新数据落盘前就被破坏
        for category in Category::ALL {
            if source.collection(category) == destination.collection(category) {
                return Err(StoreError::Migration(format!(
                    "v{} 与 v{} 的 {} 集合同名: {}",
                    from.version,
                    current.version,
                    category,
                    destination.collection(category)
                )));
            }
        }

        for category in Category::ALL {
            self.migrate_collection(
                category,
                source.collection(category),
                destination.collection(category),
                &chain,
                &mut report,
            )
            .await?;
        }

        // 所有文档落盘并校验后才写版本戳
        let stamp = serde_json::to_value(&current).map_err(|e| StoreError::Encode {
            reason: e.to_string(),
        })?;
        self.medium.put(SCHEMA_COLLECTION, SCHEMA_KEY, &stamp).await?;
        info!("已写入 schema 版本戳: {}", current);

        if self.purge_legacy {
            if report.skipped.is_empty() {
                report.purged_legacy = self.purge_source(&source_collections(&source)).await;
            } else {
                warn!(
                    "{} 条旧文档未能迁移，保留旧集合",
                    report.skipped.len()
                );
            }
        }

        Ok(report)
    }

    async fn migrate_collection(
        &self,
        category: Category,
        source: &str,
        destination: &str,
        chain: &[UpgradeFn],
        report: &mut MigrationReport,
    ) -> Result<(), StoreError> {
        let documents = self.medium.get_all(source).await?;
        if documents.is_empty() {
            debug!("旧集合为空，跳过: {}", source);
            return Ok(());
        }

        let existing = self.medium.get_all(destination).await?;

        info!(
            "迁移集合 {} -> {}: {} 个文档",
            source,
            destination,
            documents.len()
        );

        for (key, document) in documents {
            if existing.contains_key(&key) {
                debug!("目标已存在，保留: {}/{}", destination, key);
                report.kept_existing += 1;
                continue;
            }

            let upgraded = match apply_chain(chain, category, document) {
                Ok(upgraded) => upgraded,
                Err(reason) => {
                    warn!("跳过无法升级的文档 {}/{}: {}", source, key, reason);
                    report.skipped.push(format!("{}/{}", source, key));
                    continue;
                }
            };

            self.medium.put(destination, &key, &upgraded).await?;

            // 回读校验
            let written = self.medium.get(destination, &key).await?;
            if written.as_ref() != Some(&upgraded) {
                return Err(StoreError::Migration(format!(
                    "回读校验失败: {}/{}",
                    destination, key
                )));
            }

            report.migrated += 1;
        }

        Ok(())
    }

    /// 清空旧集合，任一失败则返回 false（版本戳已写入，不影响迁移结果）
    async fn purge_source(&self, collections: &[&str]) -> bool {
        let mut all_purged = true;
        for collection in collections {
            if let Err(e) = self.medium.delete_all(collection).await {
                warn!("清空旧集合失败 {}: {}", collection, e);
                all_purged = false;
            }
        }
        if all_purged {
            info!("已清空旧集合: {:?}", collections);
        }
        all_purged
    }
}

fn source_collections(layout: &super::schema::CollectionLayout) -> Vec<&'static str> {
    Category::ALL
        .iter()
        .map(|category| layout.collection(*category))
        .collect()
}

// ============================================================================
// 单元测试
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::codec::{from_document, Document};
    use crate::persistence::medium::testing::FaultyDocumentStore;
    use crate::persistence::medium::MemoryDocumentStore;
    use crate::persistence::schema::{
        CollectionLayout, SchemaVersion, CURRENT_SCHEMA_NAME, LEGACY_LAYOUT, V1_LAYOUT,
    };
    use crate::persistence::types::{ResumeData, TaskRecord, TaskStatus};
    use serde_json::json;

    fn coordinator(medium: Arc<dyn DocumentStore>) -> MigrationCoordinator {
        MigrationCoordinator::new(medium, Arc::new(MigrationRegistry::builtin()))
    }

    fn legacy_task_record(task_id: &str, status: &str) -> Document {
        json!({
            "taskId": task_id,
            "taskType": "download",
            "status": status,
            "progress": { "bytesTransferred": 10 },
            "createdAt": 1_700_000_000_000i64,
            "updatedAt": 1_700_000_000_000i64
        })
    }

    async fn seed_legacy(medium: &dyn DocumentStore) {
        medium
            .put("taskRecords", "t1", &legacy_task_record("t1", "running"))
            .await
            .unwrap();
        medium
            .put("taskRecords", "t2", &legacy_task_record("t2", "paused"))
            .await
            .unwrap();
        medium
            .put(
                "resumeData",
                "t1",
                &json!({
                    "taskId": "t1",
                    "data": "offset=4096",
                    "requiredStartByte": 4096,
                    "createdAt": 1_700_000_000_000i64
                }),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_first_run_stamps_current_version() {
        let medium = Arc::new(MemoryDocumentStore::new());
        let coordinator = coordinator(medium.clone());

        assert_eq!(coordinator.stored_identity().await.unwrap(), SchemaIdentity::legacy());

        let outcome = coordinator.run().await;
        match outcome {
            MigrationOutcome::Migrated(report) => {
                assert_eq!(report.migrated, 0);
                assert!(report.skipped.is_empty());
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        assert_eq!(
            coordinator.stored_identity().await.unwrap(),
            coordinator.current_identity()
        );
    }

    #[tokio::test]
    async fn test_second_run_is_noop() {
        let medium = Arc::new(MemoryDocumentStore::new());
        let coordinator = coordinator(medium.clone());

        assert!(coordinator.run().await.is_success());
        assert!(matches!(coordinator.run().await, MigrationOutcome::UpToDate));

        let current = coordinator.current_identity();
        let report = coordinator.migrate(&current).await.unwrap();
        assert!(report.is_noop());
        assert_eq!(report.migrated, 0);
    }

    #[tokio::test]
    async fn test_migrates_legacy_documents() {
        let medium = Arc::new(MemoryDocumentStore::new());
        seed_legacy(medium.as_ref()).await;
        let coordinator = coordinator(medium.clone());

        let report = coordinator.migrate(&SchemaIdentity::legacy()).await.unwrap();
        assert_eq!(report.migrated, 3);
        assert!(!report.purged_legacy);

        let doc = medium.get("task_records", "t1").await.unwrap().unwrap();
        let record: TaskRecord = from_document(doc).unwrap();
        assert_eq!(record.status, TaskStatus::Running);
        assert_eq!(record.progress.bytes_transferred, 10);

        let doc = medium.get("resume_data", "t1").await.unwrap().unwrap();
        let resume: ResumeData = from_document(doc).unwrap();
        assert_eq!(resume.data, "offset=4096");

        // 旧数据保持原样
        assert_eq!(medium.len("taskRecords"), 2);
        assert_eq!(medium.len("resumeData"), 1);
    }

    #[tokio::test]
    async fn test_purge_legacy_after_migration() {
        let medium = Arc::new(MemoryDocumentStore::new());
        seed_legacy(medium.as_ref()).await;
        let coordinator = coordinator(medium.clone()).with_purge_legacy(true);

        let report = coordinator.migrate(&SchemaIdentity::legacy()).await.unwrap();
        assert!(report.purged_legacy);
        assert_eq!(medium.len("taskRecords"), 0);
        assert_eq!(medium.len("resumeData"), 0);
        assert_eq!(medium.len("task_records"), 2);
    }

    #[tokio::test]
    async fn test_unupgradable_document_is_skipped() {
        let medium = Arc::new(MemoryDocumentStore::new());
        seed_legacy(medium.as_ref()).await;
        medium
            .put("taskRecords", "broken", &json!("not an object"))
            .await
            .unwrap();
        let coordinator = coordinator(medium.clone()).with_purge_legacy(true);

        let report = coordinator.migrate(&SchemaIdentity::legacy()).await.unwrap();
        assert_eq!(report.migrated, 3);
        assert_eq!(report.skipped, vec!["taskRecords/broken".to_string()]);
        // 有跳过的文档时不清空旧集合
        assert!(!report.purged_legacy);
        assert_eq!(medium.len("taskRecords"), 3);
    }

    #[tokio::test]
    async fn test_existing_destination_is_kept() {
        let medium = Arc::new(MemoryDocumentStore::new());
        seed_legacy(medium.as_ref()).await;
        let newer = json!({ "task_id": "t1", "marker": "written in degraded mode" });
        medium.put("task_records", "t1", &newer).await.unwrap();

        let report = coordinator(medium.clone())
            .migrate(&SchemaIdentity::legacy())
            .await
            .unwrap();

        assert_eq!(report.kept_existing, 1);
        assert_eq!(report.migrated, 2);
        assert_eq!(medium.get("task_records", "t1").await.unwrap(), Some(newer));
    }

    #[tokio::test]
    async fn test_unknown_schema_fails_without_stamping() {
        let medium = Arc::new(MemoryDocumentStore::new());
        let foreign = SchemaIdentity::new("someone_else", 4);
        medium
            .put(SCHEMA_COLLECTION, SCHEMA_KEY, &serde_json::to_value(&foreign).unwrap())
            .await
            .unwrap();
        let coordinator = coordinator(medium.clone());

        let outcome = coordinator.run().await;
        assert!(!outcome.is_success());
        assert_eq!(outcome.degraded_from(), Some(&foreign));
        assert_eq!(coordinator.stored_identity().await.unwrap(), foreign);
    }

    #[tokio::test]
    async fn test_newer_stored_version_fails() {
        let medium = Arc::new(MemoryDocumentStore::new());
        let newer = SchemaIdentity::new(CURRENT_SCHEMA_NAME, 99);
        medium
            .put(SCHEMA_COLLECTION, SCHEMA_KEY, &serde_json::to_value(&newer).unwrap())
            .await
            .unwrap();

        let err = coordinator(medium).migrate(&newer).await.unwrap_err();
        assert!(matches!(err, StoreError::Migration(_)));
    }

    #[tokio::test]
    async fn test_corrupt_stamp_fails_with_unknown_source() {
        let medium = Arc::new(MemoryDocumentStore::new());
        medium
            .put(SCHEMA_COLLECTION, SCHEMA_KEY, &json!({ "name": 1 }))
            .await
            .unwrap();

        let outcome = coordinator(medium).run().await;
        assert!(!outcome.is_success());
        assert_eq!(outcome.degraded_from(), None);
    }

    #[tokio::test]
    async fn test_partial_failure_then_retry_by_restart() {
        let medium = Arc::new(FaultyDocumentStore::new());
        seed_legacy(medium.as_ref()).await;
        medium.fail_puts_to("resume_data");

        // 第一次启动：task_records 已写入，resume_data 写入失败
        let first = coordinator(medium.clone()).run().await;
        assert_eq!(first.degraded_from(), Some(&SchemaIdentity::legacy()));
        assert_eq!(
            coordinator(medium.clone()).stored_identity().await.unwrap(),
            SchemaIdentity::legacy()
        );
        assert!(medium.get("task_records", "t1").await.unwrap().is_some());
        assert!(medium.get("resumeData", "t1").await.unwrap().is_some());

        // 第二次启动：介质恢复，从同一版本戳重试
        medium.heal();
        match coordinator(medium.clone()).run().await {
            MigrationOutcome::Migrated(report) => {
                assert_eq!(report.kept_existing, 2);
                assert_eq!(report.migrated, 1);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(medium.get("resume_data", "t1").await.unwrap().is_some());
    }

    fn add_marker_v2(_category: Category, mut document: Document) -> Result<Document, String> {
        let obj = document.as_object_mut().ok_or("not an object")?;
        obj.insert("steps".to_string(), json!(["v2"]));
        Ok(document)
    }

    fn add_marker_v3(_category: Category, mut document: Document) -> Result<Document, String> {
        let steps = document
            .get_mut("steps")
            .and_then(|s| s.as_array_mut())
            .ok_or("v3 requires v2 output")?;
        steps.push(json!("v3"));
        Ok(document)
    }

    fn layout(prefix: &'static [&'static str; 4]) -> CollectionLayout {
        CollectionLayout {
            task_records: prefix[0],
            paused_tasks: prefix[1],
            modified_tasks: prefix[2],
            resume_data: prefix[3],
        }
    }

    #[tokio::test]
    async fn test_chain_applies_steps_in_order() {
        static V3: [&str; 4] = ["tr_v3", "pt_v3", "mt_v3", "rd_v3"];
        let registry = MigrationRegistry::new(
            "custom",
            SchemaVersion {
                version: 1,
                description: "base",
                layout: V1_LAYOUT,
                upgrade: None,
            },
        )
        .register(SchemaVersion {
            version: 2,
            description: "add steps",
            layout: V1_LAYOUT,
            upgrade: Some(add_marker_v2 as UpgradeFn),
        })
        .register(SchemaVersion {
            version: 3,
            description: "append step",
            layout: layout(&V3),
            upgrade: Some(add_marker_v3 as UpgradeFn),
        });

        let medium = Arc::new(MemoryDocumentStore::new());
        medium
            .put("task_records", "k", &json!({ "task_id": "k" }))
            .await
            .unwrap();

        let coordinator = MigrationCoordinator::new(medium.clone(), Arc::new(registry));
        let report = coordinator
            .migrate(&SchemaIdentity::new("custom", 1))
            .await
            .unwrap();

        assert_eq!(report.to, SchemaIdentity::new("custom", 3));
        assert_eq!(
            medium.get("tr_v3", "k").await.unwrap(),
            Some(json!({ "task_id": "k", "steps": ["v2", "v3"] }))
        );
    }

    #[tokio::test]
    async fn test_same_collection_layout_is_rejected() {
        let registry = MigrationRegistry::new(
            "custom",
            SchemaVersion {
                version: 0,
                description: "base",
                layout: LEGACY_LAYOUT,
                upgrade: None,
            },
        )
        .register(SchemaVersion {
            version: 1,
            description: "in place",
            layout: LEGACY_LAYOUT,
            upgrade: Some(add_marker_v2 as UpgradeFn),
        });

        let medium = Arc::new(MemoryDocumentStore::new());
        let coordinator = MigrationCoordinator::new(medium, Arc::new(registry));
        let err = coordinator
            .migrate(&SchemaIdentity::legacy())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Migration(_)));
    }
}
