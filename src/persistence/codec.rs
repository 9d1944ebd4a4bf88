//! 记录编解码
//!
//! 实体与文档（`serde_json::Value`）之间的双向映射。纯函数，无 I/O。
//! 四类记录共用同一套 serde 实现，每种实体只需声明自己的类别和任务 ID。

use serde::de::DeserializeOwned;
use serde::Serialize;

/// 存储单元：JSON 结构化文档
pub type Document = serde_json::Value;

/// 物理键中不允许出现的字符
const ILLEGAL_KEY_CHARS: [char; 9] = ['\\', '/', ':', '*', '?', '"', '<', '>', '|'];

/// 记录类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    /// 任务记录
    TaskRecord,
    /// 暂停任务
    PausedTask,
    /// 修改任务
    ModifiedTask,
    /// 续传数据
    ResumeData,
}

impl Category {
    pub const ALL: [Category; 4] = [
        Category::TaskRecord,
        Category::PausedTask,
        Category::ModifiedTask,
        Category::ResumeData,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::TaskRecord => "task_record",
            Category::PausedTask => "paused_task",
            Category::ModifiedTask => "modified_task",
            Category::ResumeData => "resume_data",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 可持久化的记录
pub trait Record: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// 记录所属类别
    const CATEGORY: Category;

    /// 调用方分配的任务 ID（未经清洗）
    fn task_id(&self) -> &str;
}

/// 实体 -> 文档
pub fn to_document<R: Record>(record: &R) -> Result<Document, serde_json::Error> {
    serde_json::to_value(record)
}

/// 文档 -> 实体
///
/// 缺少必填字段或字段类型不符时失败，不会构造出半成品
pub fn from_document<R: Record>(document: Document) -> Result<R, serde_json::Error> {
    serde_json::from_value(document)
}

/// 将任务 ID 转换为物理存储键
///
/// `\ / : * ? " < > |` 统一替换为 `_`。确定性但不保证无碰撞：
/// `"a/b"` 与 `"a\\b"` 映射到同一个键，后写入者覆盖先写入者
pub fn sanitize_task_id(task_id: &str) -> String {
    task_id
        .chars()
        .map(|c| if ILLEGAL_KEY_CHARS.contains(&c) { '_' } else { c })
        .collect()
}
