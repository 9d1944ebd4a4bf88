// Transfer State Store Library
// 下载/上传任务状态持久化核心库

// 配置管理模块
pub mod config;

// 日志模块
pub mod logging;

// 任务状态持久化模块
pub mod persistence;

// 导出常用类型
pub use config::{AppConfig, LogConfig, PersistenceConfig, StorageBackend};
pub use persistence::{
    DocumentStore, MigrationOutcome, ModifiedTask, PausedTask, ResumeData, SchemaIdentity,
    StoreError, TaskRecord, TaskStateStore, TaskStatus,
};
