//! 持久化模块核心类型定义
//!
//! 四类持久化记录：任务记录、暂停任务、修改任务、续传数据。
//! 四者按任务 ID 独立存储、独立清理，彼此之间没有隐含的归属关系。

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::codec::{Category, Record};

/// 任务生命周期状态
///
/// 使用 snake_case 序列化以便 JSON 可读
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// 已入队，等待执行
    Enqueued,
    /// 传输中
    Running,
    /// 已完成
    Complete,
    /// 失败
    Failed,
    /// 已取消
    Canceled,
    /// 已暂停
    Paused,
}

impl TaskStatus {
    /// 是否为终态（完成、失败或取消）
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Canceled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enqueued => "enqueued",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
            Self::Paused => "paused",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 任务类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// 下载任务
    Download,
    /// 上传任务
    Upload,
}

/// 传输进度
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransferProgress {
    /// 已传输字节数
    pub bytes_transferred: u64,

    /// 预期文件大小（未知时为 None）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_size: Option<u64>,
}

impl TransferProgress {
    /// 进度比例（0.0 - 1.0），文件大小未知时返回 None
    pub fn fraction(&self) -> Option<f64> {
        match self.expected_size {
            Some(0) => Some(1.0),
            Some(total) => Some((self.bytes_transferred as f64 / total as f64).min(1.0)),
            None => None,
        }
    }
}

/// 任务定义快照
///
/// 足以在之后重建并重新提交任务；由上层 API 负责校验
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    /// 任务 ID（调用方分配，全局唯一）
    pub task_id: String,

    pub task_type: TaskType,

    /// 远程地址
    pub url: String,

    /// 本地文件名
    pub filename: String,

    /// 本地目录（相对于基础目录）
    #[serde(default)]
    pub directory: String,

    /// 请求头，名称原样保存
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,

    /// 优先级，数值越小越优先
    #[serde(default)]
    pub priority: i32,

    /// 最大重试次数
    #[serde(default)]
    pub retries: u32,

    /// 剩余重试次数
    #[serde(default)]
    pub retries_remaining: u32,

    /// 任务分组
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,

    /// 调用方附加的不透明数据
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<String>,

    /// 是否允许暂停
    #[serde(default)]
    pub allow_pause: bool,

    /// 创建时间
    pub created_at: DateTime<Utc>,
}

impl TaskDefinition {
    /// 创建下载任务定义
    pub fn new_download(task_id: String, url: String, filename: String) -> Self {
        Self::new(task_id, TaskType::Download, url, filename)
    }

    /// 创建上传任务定义
    pub fn new_upload(task_id: String, url: String, filename: String) -> Self {
        Self::new(task_id, TaskType::Upload, url, filename)
    }

    fn new(task_id: String, task_type: TaskType, url: String, filename: String) -> Self {
        Self {
            task_id,
            task_type,
            url,
            filename,
            directory: String::new(),
            headers: BTreeMap::new(),
            priority: 5,
            retries: 0,
            retries_remaining: 0,
            group: None,
            metadata: None,
            allow_pause: false,
            created_at: Utc::now(),
        }
    }

    /// 设置重试次数（同时重置剩余次数）
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self.retries_remaining = retries;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }
}

/// 任务记录
///
/// 任务的状态/审计条目：首次受理时创建，每次可观察的状态变化时更新，
/// 调用方清理历史或删除任务时移除
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,

    pub task_type: TaskType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,

    pub status: TaskStatus,

    #[serde(default)]
    pub progress: TransferProgress,

    /// 错误信息（任务失败时）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    /// 为新受理的任务创建记录
    pub fn new(task: &TaskDefinition) -> Self {
        let now = Utc::now();
        Self {
            task_id: task.task_id.clone(),
            task_type: task.task_type,
            group: task.group.clone(),
            status: TaskStatus::Enqueued,
            progress: TransferProgress::default(),
            error_msg: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// 更新最后修改时间
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// 状态迁移
    pub fn set_status(&mut self, status: TaskStatus) {
        self.status = status;
        self.touch();
    }

    /// 标记失败并记录错误信息
    pub fn mark_failed(&mut self, error_msg: impl Into<String>) {
        self.status = TaskStatus::Failed;
        self.error_msg = Some(error_msg.into());
        self.touch();
    }

    pub fn set_progress(&mut self, bytes_transferred: u64, expected_size: Option<u64>) {
        self.progress = TransferProgress {
            bytes_transferred,
            expected_size,
        };
        self.touch();
    }
}

impl Record for TaskRecord {
    const CATEGORY: Category = Category::TaskRecord;

    fn task_id(&self) -> &str {
        &self.task_id
    }
}

/// 暂停任务：暂停瞬间的完整任务定义快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PausedTask {
    pub task: TaskDefinition,
    pub paused_at: DateTime<Utc>,
}

impl PausedTask {
    pub fn new(task: TaskDefinition) -> Self {
        Self {
            task,
            paused_at: Utc::now(),
        }
    }
}

impl Record for PausedTask {
    const CATEGORY: Category = Category::PausedTask;

    fn task_id(&self) -> &str {
        &self.task.task_id
    }
}

/// 修改任务：静止状态下被调用方修改、尚未重新提交的任务定义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModifiedTask {
    pub task: TaskDefinition,
    pub modified_at: DateTime<Utc>,
}

impl ModifiedTask {
    pub fn new(task: TaskDefinition) -> Self {
        Self {
            task,
            modified_at: Utc::now(),
        }
    }
}

impl Record for ModifiedTask {
    const CATEGORY: Category = Category::ModifiedTask;

    fn task_id(&self) -> &str {
        &self.task.task_id
    }
}

/// 续传数据
///
/// 传输引擎私有的不透明状态（偏移量、校验信息、续传令牌等），
/// 用于从中断处继续而不必从零开始
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeData {
    pub task_id: String,

    /// 引擎私有数据，原样保存
    pub data: String,

    /// 续传时要求的起始字节
    #[serde(default)]
    pub required_start_byte: u64,

    /// 服务端 ETag，用于校验部分内容是否仍然有效
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,

    pub created_at: DateTime<Utc>,
}

impl ResumeData {
    pub fn new(task_id: String, data: String, required_start_byte: u64) -> Self {
        Self {
            task_id,
            data,
            required_start_byte,
            etag: None,
            created_at: Utc::now(),
        }
    }
}

impl Record for ResumeData {
    const CATEGORY: Category = Category::ResumeData;

    fn task_id(&self) -> &str {
        &self.task_id
    }
}
