//! 具型別的儲存庫
//!
//! 包裝 `DocumentStore`：每次呼叫都有逾時上限，讀出的文件經 `schema`
//! 驗證後才交給上層，寫入前也先以相同規則檢查結果。

use futures::stream::{BoxStream, StreamExt};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::batch::Batch;
use crate::config::MesConfig;
use crate::product::{Product, RawMaterial};
use crate::schema::{decode_batch, decode_product, decode_raw_material, encode, needs_migration};
use crate::store::{Collection, Document, DocumentStore, FieldPatch, Filter};
use crate::{MesError, Result};

/// 不可變更的批號欄位
pub const IMMUTABLE_BATCH_FIELD: &str = "batchId";

/// 站別紀錄中僅能由站別排程器寫入的欄位
const SEQUENCED_STAGE_FIELDS: [&str; 3] = ["completed", "startedAt", "finishedAt"];

/// 路徑是否為站別排程器專屬欄位（狀態與站別進度）
fn is_sequenced_path(path: &str) -> bool {
    let mut keys = path.split('.');
    match (keys.next(), keys.next(), keys.next()) {
        (Some("status"), _, _) => true,
        (Some("processingStages"), None, _) | (Some("processingStages"), Some(_), None) => true,
        (Some("processingStages"), Some(_), Some(field)) => SEQUENCED_STAGE_FIELDS.contains(&field),
        _ => false,
    }
}

/// 以逾時包裝儲存層呼叫；逾時視為可重試的失敗
pub async fn with_timeout<T, F>(timeout: Duration, operation: &str, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!("儲存層呼叫逾時: {} ({:?})", operation, timeout);
            Err(MesError::Timeout {
                operation: operation.to_string(),
            })
        }
    }
}

/// 已載入的批次（含文件鍵與版本，用於樂觀鎖寫回）
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedBatch {
    /// 文件鍵
    pub key: String,

    /// 讀取時的版本號
    pub version: u64,

    /// 批次內容
    pub batch: Batch,

    /// 儲存的文件為舊版結構，寫回時需整份改寫
    pub migrated: bool,
}

impl LoadedBatch {
    fn from_document(doc: &Document) -> Result<Self> {
        Ok(Self {
            key: doc.id.clone(),
            version: doc.version,
            batch: decode_batch(doc)?,
            migrated: needs_migration(doc),
        })
    }
}

/// 舊資料查找轉接器
///
/// 早期資料的文件鍵與批次ID不一致，批次ID存放於文件內的次要欄位。
/// 主鍵查無資料時，以此欄位再查一次。
#[derive(Debug, Clone)]
pub struct LegacyIdLookup {
    field: String,
}

impl LegacyIdLookup {
    pub fn new(field: &str) -> Self {
        Self {
            field: field.to_string(),
        }
    }

    /// 以次要欄位查找，多筆符合時取第一筆
    pub async fn find(
        &self,
        store: &dyn DocumentStore,
        collection: Collection,
        id: &str,
    ) -> Result<Option<Document>> {
        let mut docs = store
            .query(collection, &Filter::field_eq(&self.field, id))
            .await?;
        if docs.len() > 1 {
            tracing::warn!(
                "次要欄位 {}={} 對應到 {} 筆文件，使用第一筆",
                self.field,
                id,
                docs.len()
            );
        }
        Ok(if docs.is_empty() {
            None
        } else {
            Some(docs.swap_remove(0))
        })
    }
}

impl Default for LegacyIdLookup {
    fn default() -> Self {
        Self::new("id")
    }
}

/// 批次儲存庫
#[derive(Clone)]
pub struct BatchRepository {
    store: Arc<dyn DocumentStore>,
    timeout: Duration,
    legacy: Option<LegacyIdLookup>,
}

impl BatchRepository {
    /// 創建批次儲存庫
    pub fn new(store: Arc<dyn DocumentStore>, config: &MesConfig) -> Self {
        Self {
            store,
            timeout: config.repository_timeout(),
            legacy: config.legacy_lookup.then(LegacyIdLookup::default),
        }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// 產生新的儲存層ID
    pub fn new_storage_id() -> String {
        Uuid::new_v4().simple().to_string()
    }

    /// 寫入新批次（文件鍵即批次 `id`）
    pub async fn insert(&self, batch: &Batch) -> Result<LoadedBatch> {
        batch.validate()?;
        let data = encode(batch)?;
        let doc = with_timeout(
            self.timeout,
            "batches.create",
            self.store.create(Collection::Batches, &batch.id, data),
        )
        .await?;
        LoadedBatch::from_document(&doc)
    }

    /// 查找批次：先主鍵，未命中時走舊資料轉接器
    pub async fn find(&self, id: &str) -> Result<Option<LoadedBatch>> {
        let primary = with_timeout(
            self.timeout,
            "batches.get",
            self.store.get(Collection::Batches, id),
        )
        .await?;
        if let Some(doc) = primary {
            return LoadedBatch::from_document(&doc).map(Some);
        }

        let Some(legacy) = &self.legacy else {
            return Ok(None);
        };
        let fallback = with_timeout(
            self.timeout,
            "batches.query.legacy",
            legacy.find(self.store.as_ref(), Collection::Batches, id),
        )
        .await?;
        match fallback {
            Some(doc) => {
                tracing::debug!("批次 {} 透過舊資料欄位找到，文件鍵 {}", id, doc.id);
                LoadedBatch::from_document(&doc).map(Some)
            }
            None => Ok(None),
        }
    }

    /// 載入批次，兩條查找路徑都未命中時回傳 `NotFound`
    pub async fn load(&self, id: &str) -> Result<LoadedBatch> {
        self.find(id).await?.ok_or_else(|| MesError::NotFound {
            entity: "批次",
            id: id.to_string(),
        })
    }

    /// 依可讀批號查找
    pub async fn find_by_batch_code(&self, batch_code: &str) -> Result<Option<LoadedBatch>> {
        let docs = with_timeout(
            self.timeout,
            "batches.query.batchId",
            self.store.query(
                Collection::Batches,
                &Filter::field_eq(IMMUTABLE_BATCH_FIELD, batch_code),
            ),
        )
        .await?;
        docs.first().map(LoadedBatch::from_document).transpose()
    }

    /// 列出批次，無效文件記錄警告後略過
    pub async fn list(&self, filter: &Filter) -> Result<Vec<Batch>> {
        let docs = with_timeout(
            self.timeout,
            "batches.query",
            self.store.query(Collection::Batches, filter),
        )
        .await?;
        Ok(decode_valid(docs))
    }

    /// 以樂觀鎖寫回批次更新
    ///
    /// `batchId` 欄位一律自更新內容中剔除；套用後的文件必須仍通過驗證。
    pub async fn apply(&self, loaded: &LoadedBatch, mut patch: FieldPatch) -> Result<LoadedBatch> {
        if patch.strip_root(IMMUTABLE_BATCH_FIELD) {
            tracing::debug!("批次 {} 的更新內容含 batchId，已剔除", loaded.batch.batch_id);
        }
        if patch.is_empty() {
            return Ok(loaded.clone());
        }

        let mut preview = encode(&loaded.batch)?;
        patch.apply_to(&mut preview)?;
        decode_batch(&Document {
            id: loaded.key.clone(),
            version: loaded.version,
            data: preview.clone(),
        })?;

        // 舊版文件在第一次寫回時改寫為目前結構
        if loaded.migrated {
            tracing::info!("批次 {} 以目前結構版本改寫", loaded.batch.batch_id);
            if let Value::Object(fields) = preview {
                patch = fields
                    .into_iter()
                    .fold(FieldPatch::new(), |acc, (key, value)| acc.set_value(&key, value));
            }
        }

        let doc = with_timeout(
            self.timeout,
            "batches.update",
            self.store.update(
                Collection::Batches,
                &loaded.key,
                &patch,
                Some(loaded.version),
            ),
        )
        .await?;
        LoadedBatch::from_document(&doc)
    }

    /// 外部協作者的一般欄位更新
    ///
    /// 批次狀態與站別進度只能經由站別排程器變更，含這些路徑的更新以
    /// `Validation` 拒絕；暫停請改用 `hold_batch` / `release_batch`。
    pub async fn update_fields(&self, id: &str, patch: FieldPatch) -> Result<LoadedBatch> {
        let owned: Vec<&str> = patch
            .iter()
            .map(|(path, _)| path.as_str())
            .filter(|path| is_sequenced_path(path))
            .collect();
        if !owned.is_empty() {
            return Err(MesError::Validation(format!(
                "批次 {} 的更新含站別排程器專屬欄位: {}",
                id,
                owned.join(", ")
            )));
        }
        let loaded = self.load(id).await?;
        self.apply(&loaded, patch).await
    }

    /// 刪除批次
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let Some(loaded) = self.find(id).await? else {
            return Ok(false);
        };
        with_timeout(
            self.timeout,
            "batches.delete",
            self.store.delete(Collection::Batches, &loaded.key),
        )
        .await
    }

    /// 監看批次（供報表協作者使用）
    pub fn watch(&self, filter: Filter) -> BoxStream<'static, Vec<Batch>> {
        self.store
            .watch(Collection::Batches, filter)
            .map(decode_valid)
            .boxed()
    }
}

fn decode_valid(docs: Vec<Document>) -> Vec<Batch> {
    docs.iter()
        .filter_map(|doc| match decode_batch(doc) {
            Ok(batch) => Some(batch),
            Err(e) => {
                tracing::warn!("略過無效的批次文件 {}: {}", doc.id, e);
                None
            }
        })
        .collect()
}

/// 產品（成品庫存）儲存庫
#[derive(Clone)]
pub struct ProductRepository {
    store: Arc<dyn DocumentStore>,
    timeout: Duration,
}

impl ProductRepository {
    pub fn new(store: Arc<dyn DocumentStore>, config: &MesConfig) -> Self {
        Self {
            store,
            timeout: config.repository_timeout(),
        }
    }

    pub async fn insert(&self, product: &Product) -> Result<()> {
        product.validate()?;
        with_timeout(
            self.timeout,
            "finalStock.create",
            self.store.create(Collection::Products, &product.id, encode(product)?),
        )
        .await?;
        Ok(())
    }

    pub async fn find(&self, id: &str) -> Result<Option<Product>> {
        let doc = with_timeout(
            self.timeout,
            "finalStock.get",
            self.store.get(Collection::Products, id),
        )
        .await?;
        doc.as_ref().map(decode_product).transpose()
    }

    pub async fn load(&self, id: &str) -> Result<Product> {
        self.find(id).await?.ok_or_else(|| MesError::NotFound {
            entity: "產品",
            id: id.to_string(),
        })
    }

    pub async fn list(&self) -> Result<Vec<Product>> {
        let docs = with_timeout(
            self.timeout,
            "finalStock.query",
            self.store.query(Collection::Products, &Filter::All),
        )
        .await?;
        Ok(docs
            .iter()
            .filter_map(|doc| {
                decode_product(doc)
                    .map_err(|e| tracing::warn!("略過無效的產品文件 {}: {}", doc.id, e))
                    .ok()
            })
            .collect())
    }
}

/// 原料儲存庫
#[derive(Clone)]
pub struct RawMaterialRepository {
    store: Arc<dyn DocumentStore>,
    timeout: Duration,
}

impl RawMaterialRepository {
    pub fn new(store: Arc<dyn DocumentStore>, config: &MesConfig) -> Self {
        Self {
            store,
            timeout: config.repository_timeout(),
        }
    }

    pub async fn insert(&self, material: &RawMaterial) -> Result<()> {
        with_timeout(
            self.timeout,
            "rawMaterials.create",
            self.store
                .create(Collection::RawMaterials, &material.id, encode(material)?),
        )
        .await?;
        Ok(())
    }

    pub async fn find(&self, id: &str) -> Result<Option<RawMaterial>> {
        let doc = with_timeout(
            self.timeout,
            "rawMaterials.get",
            self.store.get(Collection::RawMaterials, id),
        )
        .await?;
        doc.as_ref().map(decode_raw_material).transpose()
    }

    pub async fn list(&self) -> Result<Vec<RawMaterial>> {
        let docs = with_timeout(
            self.timeout,
            "rawMaterials.query",
            self.store.query(Collection::RawMaterials, &Filter::All),
        )
        .await?;
        Ok(docs
            .iter()
            .filter_map(|doc| {
                decode_raw_material(doc)
                    .map_err(|e| tracing::warn!("略過無效的原料文件 {}: {}", doc.id, e))
                    .ok()
            })
            .collect())
    }
}
