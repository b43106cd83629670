//! 文件儲存介面
//!
//! 儲存平台為外部協作者，核心只依賴此處定義的非同步介面：
//! 以字串ID為鍵、依邏輯集合分類的文件，支援點號欄位路徑的部分更新、
//! 以版本號進行的樂觀鎖，以及儲存端原子計數器。

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

use crate::{MesError, Result};

/// 邏輯集合
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Collection {
    /// 生產批次
    Batches,
    /// 原料
    RawMaterials,
    /// 成品庫存（產品）
    Products,
}

impl Collection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Batches => "batches",
            Collection::RawMaterials => "rawMaterials",
            Collection::Products => "finalStock",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 儲存文件
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    /// 文件鍵
    pub id: String,

    /// 版本號（每次寫入遞增）
    pub version: u64,

    /// 文件內容
    pub data: Value,
}

impl Document {
    /// 讀取點號路徑欄位
    pub fn field(&self, path: &str) -> Option<&Value> {
        lookup_path(&self.data, path)
    }
}

/// 依點號路徑讀取欄位
pub fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, key| current.get(key))
}

/// 查詢條件
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// 全部文件
    All,
    /// 文件鍵前綴
    IdPrefix(String),
    /// 欄位等於
    FieldEq { path: String, value: Value },
    /// 字串欄位前綴
    FieldPrefix { path: String, prefix: String },
}

impl Filter {
    pub fn field_eq(path: &str, value: impl Into<Value>) -> Self {
        Filter::FieldEq {
            path: path.to_string(),
            value: value.into(),
        }
    }

    pub fn field_prefix(path: &str, prefix: &str) -> Self {
        Filter::FieldPrefix {
            path: path.to_string(),
            prefix: prefix.to_string(),
        }
    }

    /// 檢查文件是否符合條件
    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Filter::All => true,
            Filter::IdPrefix(prefix) => doc.id.starts_with(prefix.as_str()),
            Filter::FieldEq { path, value } => doc.field(path) == Some(value),
            Filter::FieldPrefix { path, prefix } => doc
                .field(path)
                .and_then(Value::as_str)
                .is_some_and(|s| s.starts_with(prefix.as_str())),
        }
    }
}

/// 部分更新：點號欄位路徑 → 新值
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldPatch {
    fields: BTreeMap<String, Value>,
}

impl FieldPatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// 設置欄位值
    pub fn set_value(mut self, path: &str, value: Value) -> Self {
        self.fields.insert(path.to_string(), value);
        self
    }

    /// 序列化後設置欄位值
    pub fn set<T: Serialize>(self, path: &str, value: &T) -> Result<Self> {
        Ok(self.set_value(path, serde_json::to_value(value)?))
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        self.fields.get(path)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }

    /// 移除指定根欄位（含其子路徑），回傳是否有移除
    pub fn strip_root(&mut self, root: &str) -> bool {
        let before = self.fields.len();
        self.fields
            .retain(|path, _| path != root && !path.starts_with(&format!("{}.", root)));
        before != self.fields.len()
    }

    /// 將更新套用至文件內容
    pub fn apply_to(&self, data: &mut Value) -> Result<()> {
        for (path, value) in &self.fields {
            let keys: Vec<&str> = path.split('.').collect();
            let Some((last, parents)) = keys.split_last() else {
                continue;
            };
            let mut current = &mut *data;
            for key in parents {
                if current.is_null() {
                    *current = Value::Object(Map::new());
                }
                let Value::Object(map) = current else {
                    return Err(MesError::Validation(format!(
                        "欄位路徑 {} 穿越非物件欄位 {}",
                        path, key
                    )));
                };
                current = map
                    .entry(key.to_string())
                    .or_insert_with(|| Value::Object(Map::new()));
            }
            if current.is_null() {
                *current = Value::Object(Map::new());
            }
            match current {
                Value::Object(map) => {
                    map.insert(last.to_string(), value.clone());
                }
                _ => {
                    return Err(MesError::Validation(format!(
                        "欄位路徑 {} 的上層不是物件",
                        path
                    )))
                }
            }
        }
        Ok(())
    }
}

/// 文件儲存介面
///
/// 每個呼叫都是非同步 I/O 邊界，可能與其他請求任意交錯。
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// 依鍵讀取文件
    async fn get(&self, collection: Collection, id: &str) -> Result<Option<Document>>;

    /// 依條件查詢文件
    async fn query(&self, collection: Collection, filter: &Filter) -> Result<Vec<Document>>;

    /// 建立文件，鍵已存在時回傳 `AlreadyExists`
    async fn create(&self, collection: Collection, id: &str, data: Value) -> Result<Document>;

    /// 部分更新；指定 `expected_version` 時版本不符回傳 `VersionConflict`
    async fn update(
        &self,
        collection: Collection,
        id: &str,
        patch: &FieldPatch,
        expected_version: Option<u64>,
    ) -> Result<Document>;

    /// 刪除文件，回傳是否存在
    async fn delete(&self, collection: Collection, id: &str) -> Result<bool>;

    /// 監看查詢結果，每次變更推送一次完整結果
    fn watch(&self, collection: Collection, filter: Filter) -> BoxStream<'static, Vec<Document>>;

    /// 原子遞增計數器：`counter = max(counter, floor) + 1`
    async fn next_sequence(&self, key: &str, floor: u64) -> Result<u64>;
}
