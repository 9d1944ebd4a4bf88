//! 存储 schema 版本历史
//!
//! 每个版本登记三项数据：版本号、集合布局、从上一版本升级单个文档的函数。
//! 迁移协调器只负责编排（读版本 -> 取升级链 -> 应用 -> 写版本戳），
//! 新增版本只需在 [`MigrationRegistry::builtin`] 中登记一条记录。
//!
//! ## 版本
//!
//! | 版本 | 名称 | 集合 | 文档格式 |
//! |------|------|------|----------|
//! | 0 | legacy | `taskRecords` 等 camelCase 集合 | camelCase 字段，时间戳为 Unix 毫秒 |
//! | 1 | transfer_state | `task_records` 等 snake_case 集合 | snake_case 字段，RFC 3339 时间 |

use std::collections::BTreeMap;

use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::codec::{Category, Document};

/// 当前 schema 名称
pub const CURRENT_SCHEMA_NAME: &str = "transfer_state";

/// 当前 schema 版本
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// 没有版本戳时隐含的 schema 名称（首次运行或迁移机制引入之前的数据）
pub const LEGACY_SCHEMA_NAME: &str = "legacy";

/// 保存版本戳的保留集合
pub const SCHEMA_COLLECTION: &str = "__schema";

/// 版本戳文档的键
pub const SCHEMA_KEY: &str = "identity";

/// 升级函数：把上一版本的单个文档转换为本版本格式
pub type UpgradeFn = fn(Category, Document) -> Result<Document, String>;

/// schema 标识
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaIdentity {
    pub name: String,
    pub version: u32,
}

impl SchemaIdentity {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }

    /// 无版本戳时的隐含标识：legacy@v0
    pub fn legacy() -> Self {
        Self::new(LEGACY_SCHEMA_NAME, 0)
    }

    pub fn is_legacy(&self) -> bool {
        self.name == LEGACY_SCHEMA_NAME && self.version == 0
    }
}

impl std::fmt::Display for SchemaIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@v{}", self.name, self.version)
    }
}

/// 某个 schema 版本下各类别对应的集合名称
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectionLayout {
    pub task_records: &'static str,
    pub paused_tasks: &'static str,
    pub modified_tasks: &'static str,
    pub resume_data: &'static str,
}

impl CollectionLayout {
    pub fn collection(&self, category: Category) -> &'static str {
        match category {
            Category::TaskRecord => self.task_records,
            Category::PausedTask => self.paused_tasks,
            Category::ModifiedTask => self.modified_tasks,
            Category::ResumeData => self.resume_data,
        }
    }
}

/// 版本 0 的集合布局
pub const LEGACY_LAYOUT: CollectionLayout = CollectionLayout {
    task_records: "taskRecords",
    paused_tasks: "pausedTasks",
    modified_tasks: "modifiedTasks",
    resume_data: "resumeData",
};

/// 版本 1 的集合布局
pub const V1_LAYOUT: CollectionLayout = CollectionLayout {
    task_records: "task_records",
    paused_tasks: "paused_tasks",
    modified_tasks: "modified_tasks",
    resume_data: "resume_data",
};

/// 单个 schema 版本
#[derive(Debug, Clone)]
pub struct SchemaVersion {
    pub version: u32,
    pub description: &'static str,
    pub layout: CollectionLayout,
    /// 从 `version - 1` 升级到本版本；基础版本为 None
    pub upgrade: Option<UpgradeFn>,
}

/// schema 版本登记表
#[derive(Debug, Clone)]
pub struct MigrationRegistry {
    name: String,
    versions: BTreeMap<u32, SchemaVersion>,
    /// 最高登记版本
    latest: SchemaVersion,
}

impl MigrationRegistry {
    /// 以基础版本创建登记表
    pub fn new(name: impl Into<String>, base: SchemaVersion) -> Self {
        let mut versions = BTreeMap::new();
        versions.insert(base.version, base.clone());
        Self {
            name: name.into(),
            versions,
            latest: base,
        }
    }

    /// 登记一个版本（同版本号覆盖）
    pub fn register(mut self, version: SchemaVersion) -> Self {
        if version.version >= self.latest.version {
            self.latest = version.clone();
        }
        self.versions.insert(version.version, version);
        self
    }

    /// 内置版本历史
    pub fn builtin() -> Self {
        Self::new(
            CURRENT_SCHEMA_NAME,
            SchemaVersion {
                version: 0,
                description: "legacy camelCase collections",
                layout: LEGACY_LAYOUT,
                upgrade: None,
            },
        )
        .register(SchemaVersion {
            version: CURRENT_SCHEMA_VERSION,
            description: "snake_case fields, RFC 3339 timestamps",
            layout: V1_LAYOUT,
            upgrade: Some(upgrade_legacy_document as UpgradeFn),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 最高登记版本
    pub fn current_version(&self) -> &SchemaVersion {
        &self.latest
    }

    pub fn current_identity(&self) -> SchemaIdentity {
        SchemaIdentity::new(self.name.clone(), self.current_version().version)
    }

    pub fn current_layout(&self) -> CollectionLayout {
        self.current_version().layout
    }

    pub fn version(&self, version: u32) -> Option<&SchemaVersion> {
        self.versions.get(&version)
    }

    /// 该标识是否属于本登记表的历史（本名称，或无版本戳的 legacy@v0）
    pub fn recognizes(&self, identity: &SchemaIdentity) -> bool {
        identity.name == self.name || identity.is_legacy()
    }

    /// 按顺序返回 `from` 升级到 `to` 所需的升级函数
    pub fn chain(&self, from: u32, to: u32) -> Result<Vec<UpgradeFn>, String> {
        if from > to {
            return Err(format!("不支持从 v{} 降级到 v{}", from, to));
        }
        if self.version(from).is_none() {
            return Err(format!("未登记的 schema 版本 v{}", from));
        }

        ((from + 1)..=to)
            .map(|v| {
                self.version(v)
                    .and_then(|sv| sv.upgrade)
                    .ok_or_else(|| format!("缺少 v{} -> v{} 的升级步骤", v - 1, v))
            })
            .collect()
    }
}

impl Default for MigrationRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

/// 依次应用升级链
pub fn apply_chain(
    chain: &[UpgradeFn],
    category: Category,
    document: Document,
) -> Result<Document, String> {
    chain
        .iter()
        .try_fold(document, |doc, upgrade| upgrade(category, doc))
}

// ============================================================================
// v0 -> v1
// ============================================================================

/// 值为用户数据的字段，内部键名原样保留
const PRESERVED_KEYS: [&str; 1] = ["headers"];

/// 不符合驼峰规则的旧字段名
const RENAMED_KEYS: [(&str, &str); 1] = [("eTag", "etag")];

/// v0 -> v1：字段名 camelCase -> snake_case，`*_at` 毫秒时间戳 -> RFC 3339
fn upgrade_legacy_document(_category: Category, document: Document) -> Result<Document, String> {
    match document {
        Value::Object(map) => Ok(Value::Object(snake_case_object(map))),
        other => Err(format!("期望 JSON 对象，实际为: {}", other)),
    }
}

fn snake_case_object(map: Map<String, Value>) -> Map<String, Value> {
    map.into_iter()
        .map(|(key, value)| {
            let key = legacy_key_to_snake(&key);
            let value = if PRESERVED_KEYS.contains(&key.as_str()) {
                value
            } else {
                upgrade_value(&key, value)
            };
            (key, value)
        })
        .collect()
}

/// 对象递归转换；数组逐个元素按所属字段名转换
fn upgrade_value(key: &str, value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(snake_case_object(map)),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| upgrade_value(key, item))
                .collect(),
        ),
        Value::Number(n) if key.ends_with("_at") => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .map(|t| Value::String(t.to_rfc3339()))
            .unwrap_or(Value::Number(n)),
        other => other,
    }
}

fn legacy_key_to_snake(key: &str) -> String {
    if let Some((_, renamed)) = RENAMED_KEYS.iter().find(|(old, _)| *old == key) {
        return renamed.to_string();
    }

    let mut out = String::with_capacity(key.len() + 4);
    for (i, c) in key.chars().enumerate() {
        if c.is_ascii_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}
