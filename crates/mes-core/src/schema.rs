//! 文件結構驗證與版本遷移
//!
//! 儲存層讀出的文件在此轉換為具型別的實體。舊版（無 `schemaVersion`）
//! 批次文件依明確規則遷移，其餘任何無法解析或違反不變量的文件一律拒絕。

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::batch::{Batch, StageRecord, CURRENT_SCHEMA_VERSION};
use crate::product::{Product, RawMaterial};
use crate::stage::Stage;
use crate::store::Document;
use crate::{MesError, Result};

/// 實體序列化為文件內容
pub fn encode<T: Serialize>(entity: &T) -> Result<Value> {
    Ok(serde_json::to_value(entity)?)
}

/// 解析批次文件（必要時先遷移）
pub fn decode_batch(doc: &Document) -> Result<Batch> {
    let data = migrate_batch(doc)?;
    let batch: Batch = parse(&doc.id, data)?;
    batch.validate()?;
    Ok(batch)
}

/// 解析產品文件
pub fn decode_product(doc: &Document) -> Result<Product> {
    check_version(doc)?;
    let product: Product = parse(&doc.id, doc.data.clone())?;
    product.validate()?;
    Ok(product)
}

/// 解析原料文件
pub fn decode_raw_material(doc: &Document) -> Result<RawMaterial> {
    check_version(doc)?;
    let material: RawMaterial = parse(&doc.id, doc.data.clone())?;
    if material.quantity < Decimal::ZERO {
        return Err(MesError::InvalidDocument {
            id: doc.id.clone(),
            reason: format!("原料數量為負數: {}", material.quantity),
        });
    }
    Ok(material)
}

/// 文件是否仍為舊版結構（讀取時需遷移）
pub fn needs_migration(doc: &Document) -> bool {
    schema_version(&doc.data).unwrap_or(0) < u64::from(CURRENT_SCHEMA_VERSION)
}

fn parse<T: DeserializeOwned>(id: &str, data: Value) -> Result<T> {
    serde_json::from_value(data).map_err(|e| MesError::InvalidDocument {
        id: id.to_string(),
        reason: e.to_string(),
    })
}

fn schema_version(data: &Value) -> Option<u64> {
    data.get("schemaVersion").and_then(Value::as_u64)
}

fn check_version(doc: &Document) -> Result<()> {
    match schema_version(&doc.data) {
        None => Ok(()),
        Some(v) if v == u64::from(CURRENT_SCHEMA_VERSION) => Ok(()),
        Some(v) => Err(MesError::InvalidDocument {
            id: doc.id.clone(),
            reason: format!("不支援的結構版本: {}", v),
        }),
    }
}

fn migrate_batch(doc: &Document) -> Result<Value> {
    let mut data = doc.data.clone();
    let version = schema_version(&data).unwrap_or(0);
    let object = data.as_object_mut().ok_or_else(|| MesError::InvalidDocument {
        id: doc.id.clone(),
        reason: "文件內容不是物件".to_string(),
    })?;

    match version {
        0 => {
            tracing::debug!("遷移舊版批次文件: {}", doc.id);
            migrate_batch_v0(&doc.id, object)?;
        }
        v if v == u64::from(CURRENT_SCHEMA_VERSION) => {}
        v => {
            return Err(MesError::InvalidDocument {
                id: doc.id.clone(),
                reason: format!("不支援的結構版本: {}", v),
            })
        }
    }

    Ok(data)
}

/// v0 → v1 遷移規則：
/// - 缺少 `id` 時使用文件鍵
/// - 缺少或空白的 `batchId` 使用 `id`
/// - `processingStages` 補齊四個標準站別的零值紀錄
/// - 缺少 `totalMaterialQuantity` 時由物料快照加總
/// - 缺少 `createdAt` 時使用 UNIX epoch
fn migrate_batch_v0(doc_id: &str, object: &mut Map<String, Value>) -> Result<()> {
    let id = object
        .get("id")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .unwrap_or(doc_id)
        .to_string();
    object.insert("id".to_string(), Value::String(id.clone()));

    let missing_batch_id = object
        .get("batchId")
        .and_then(Value::as_str)
        .map_or(true, |s| s.trim().is_empty());
    if missing_batch_id {
        object.insert("batchId".to_string(), Value::String(id));
    }

    let stages = object
        .entry("processingStages")
        .or_insert_with(|| Value::Object(Map::new()));
    let stages = stages.as_object_mut().ok_or_else(|| MesError::InvalidDocument {
        id: doc_id.to_string(),
        reason: "processingStages 不是物件".to_string(),
    })?;
    for stage in Stage::CANONICAL {
        if !stages.contains_key(stage.as_str()) {
            stages.insert(
                stage.as_str().to_string(),
                serde_json::to_value(StageRecord::default())?,
            );
        }
    }

    if !object.contains_key("totalMaterialQuantity") {
        let total: Decimal = object
            .get("materials")
            .and_then(Value::as_array)
            .map(|materials| {
                materials
                    .iter()
                    .filter_map(|m| m.get("quantity"))
                    .filter_map(|q| serde_json::from_value::<Decimal>(q.clone()).ok())
                    .sum()
            })
            .unwrap_or(Decimal::ZERO);
        object.insert("totalMaterialQuantity".to_string(), serde_json::to_value(total)?);
    }

    if !object.contains_key("createdAt") {
        object.insert(
            "createdAt".to_string(),
            serde_json::to_value(DateTime::<Utc>::UNIX_EPOCH)?,
        );
    }

    object.insert(
        "schemaVersion".to_string(),
        Value::from(CURRENT_SCHEMA_VERSION),
    );
    Ok(())
}
