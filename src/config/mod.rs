// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 持久化配置
    #[serde(default)]
    pub persistence: PersistenceConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 50MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    50 * 1024 * 1024 // 50MB
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

/// 存储介质类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    /// 每个键一个 JSON 文件
    #[default]
    File,
    /// 单文件 SQLite 数据库
    Sqlite,
    /// 进程内存（重启即丢失）
    Memory,
}

/// 持久化配置
///
/// 用于配置任务状态存储：
/// - 存储介质及其位置
/// - schema 迁移后是否清理旧数据
/// - 终态任务记录的保留期限
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// 存储介质
    #[serde(default)]
    pub backend: StorageBackend,

    /// 存储目录（相对于工作目录或绝对路径）
    #[serde(default = "default_store_dir")]
    pub store_dir: String,

    /// SQLite 数据库文件名（位于 store_dir 下）
    #[serde(default = "default_sqlite_file")]
    pub sqlite_file: String,

    /// 迁移成功后是否删除旧 schema 的集合
    #[serde(default)]
    pub purge_legacy_after_migration: bool,

    /// 终态任务记录保留天数（0 表示不清理，默认 30 天）
    #[serde(default = "default_task_record_retention_days")]
    pub task_record_retention_days: u32,
}

/// 终态任务记录保留天数上限（约 1000 年）
pub const MAX_TASK_RECORD_RETENTION_DAYS: u32 = 365_000;

// PersistenceConfig 默认值函数
fn default_store_dir() -> String {
    "task_store".to_string()
}

fn default_sqlite_file() -> String {
    "task_store.db".to_string()
}

fn default_task_record_retention_days() -> u32 {
    30
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            store_dir: default_store_dir(),
            sqlite_file: default_sqlite_file(),
            purge_legacy_after_migration: false,
            task_record_retention_days: default_task_record_retention_days(),
        }
    }
}

impl PersistenceConfig {
    /// 解析存储目录
    ///
    /// # Arguments
    /// * `base_dir` - 相对路径的基准目录
    pub fn resolve_store_dir(&self, base_dir: &Path) -> PathBuf {
        let dir = Path::new(&self.store_dir);
        if dir.is_absolute() {
            dir.to_path_buf()
        } else {
            base_dir.join(dir)
        }
    }

    /// 验证配置
    pub fn validate(&self) -> Result<()> {
        if self.backend != StorageBackend::Memory && self.store_dir.trim().is_empty() {
            anyhow::bail!("store_dir 不能为空");
        }
        if self.backend == StorageBackend::Sqlite && self.sqlite_file.trim().is_empty() {
            anyhow::bail!("sqlite_file 不能为空");
        }
        if self.task_record_retention_days > MAX_TASK_RECORD_RETENTION_DAYS {
            anyhow::bail!(
                "task_record_retention_days 超出范围: {}（最大 {}）",
                self.task_record_retention_days,
                MAX_TASK_RECORD_RETENTION_DAYS
            );
        }
        Ok(())
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;

        config
            .persistence
            .validate()
            .context("配置文件中的持久化配置验证失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        self.persistence
            .validate()
            .context("保存配置失败：持久化配置无效")?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = Path::new(path).parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {}", path);

        Ok(())
    }

    /// 加载或创建默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                let default_config = Self::default();

                // 配置文件不存在时写出默认配置，已存在但无效时不覆盖
                if !Path::new(path).exists() {
                    if let Err(e) = default_config.save_to_file(path).await {
                        tracing::error!("保存默认配置失败: {}", e);
                    }
                }

                default_config
            }
        }
    }
}
