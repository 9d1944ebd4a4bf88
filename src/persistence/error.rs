//! 持久化错误类型
//!
//! 「记录不存在」不是错误：查询接口统一返回 `Option`。

use thiserror::Error;

/// 任务状态存储错误
#[derive(Debug, Error)]
pub enum StoreError {
    /// 已存储的文档无法解析，或结构与实体不匹配
    #[error("文档解码失败 {collection}/{key}: {reason}")]
    Decode {
        collection: String,
        key: String,
        reason: String,
    },

    /// 实体无法编码为文档
    #[error("文档编码失败: {reason}")]
    Encode { reason: String },

    /// 存储介质不可用（权限、磁盘已满、文件丢失等）
    #[error("存储介质不可用: {0}")]
    MediumUnavailable(String),

    /// schema 迁移未完成
    #[error("迁移失败: {0}")]
    Migration(String),
}

impl StoreError {
    pub(crate) fn decode(collection: &str, key: &str, reason: impl ToString) -> Self {
        Self::Decode {
            collection: collection.to_string(),
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }

    /// 是否为单条记录损坏（而非整个介质不可用）
    pub fn is_decode(&self) -> bool {
        matches!(self, Self::Decode { .. })
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        Self::MediumUnavailable(e.to_string())
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::MediumUnavailable(format!("sqlite: {}", e))
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::MediumUnavailable(format!("后台 I/O 任务异常退出: {}", e))
    }
}
