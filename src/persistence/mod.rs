//! 任务状态持久化模块
//!
//! 该模块负责下载/上传任务状态的持久化，使引擎在进程重启后能够恢复：
//! - 任务记录：任务的当前状态与进度
//! - 暂停任务：被暂停任务的完整定义
//! - 修改任务：被修改过的任务定义
//! - 续传数据：断点续传所需的不透明数据
//!
//! ## 分层
//!
//! ```text
//! TaskStateStore      记录级接口，等待迁移完成，降级模式回退读取
//!   ├── codec         实体 <-> 文档，任务 ID 清洗
//!   ├── migration     启动时 schema 版本比较与迁移
//!   │     └── schema  版本历史、集合布局、升级函数
//!   └── medium        键值文档存储（文件 / SQLite / 内存）
//! ```
//!
//! ## 文件结构（文件介质）
//!
//! ```text
//! task_store/
//! ├── __schema/identity.json   # schema 版本戳
//! ├── task_records/{key}.json
//! ├── paused_tasks/{key}.json
//! ├── modified_tasks/{key}.json
//! └── resume_data/{key}.json
//! ```
//!
//! ## 使用示例
//!
//! ```ignore
//! use std::sync::Arc;
//! use transfer_state_store::persistence::{MemoryDocumentStore, TaskStateStore, TaskRecord};
//!
//! let store = TaskStateStore::with_medium(Arc::new(MemoryDocumentStore::new()));
//!
//! // 首次调用会等待启动迁移完成
//! store.store(&record).await?;
//! let loaded = store.retrieve::<TaskRecord>("task_001").await?;
//!
//! // 任务完成后删除
//! store.remove::<TaskRecord>(Some("task_001")).await?;
//! ```

pub mod codec;
pub mod error;
pub mod medium;
pub mod migration;
pub mod schema;
pub mod store;
pub mod types;

// 导出类型
pub use types::{
    ModifiedTask, PausedTask, ResumeData, TaskDefinition, TaskRecord, TaskStatus, TaskType,
    TransferProgress,
};

// 导出编解码
pub use codec::{from_document, sanitize_task_id, to_document, Category, Document, Record};

// 导出错误类型
pub use error::StoreError;

// 导出存储介质
pub use medium::{
    open_medium, DocumentStore, FileDocumentStore, MemoryDocumentStore, SqliteDocumentStore,
};

// 导出 schema 与迁移
pub use migration::{MigrationCoordinator, MigrationOutcome, MigrationReport};
pub use schema::{
    MigrationRegistry, SchemaIdentity, SchemaVersion, CURRENT_SCHEMA_NAME, CURRENT_SCHEMA_VERSION,
};

// 导出存储入口
pub use store::{StoreOptions, TaskStateStore};
