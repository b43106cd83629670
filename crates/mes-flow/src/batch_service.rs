//! 批次建立服務
//!
//! 流程：檢查請求 → 載入產品與庫存 → BOM 解析與短缺檢查 → 配發批號 → 寫入。
//! 任何驗證或短缺錯誤都發生在配號之前，失敗的建立不會消耗序號。

use chrono::Utc;
use futures::future::try_join_all;
use mes_calc::{BatchPlan, BomResolver, StockSnapshot};
use mes_core::{
    Batch, BatchRepository, Collection, DocumentStore, MaterialSource, MesConfig, MesError,
    Product, ProductRepository, RawMaterial, RawMaterialRepository, Result, Stage,
};
use rust_decimal::Decimal;
use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

use crate::allocator::IdAllocator;

/// 原料ID前綴
pub const RAW_MATERIAL_PREFIX: &str = "RM";

/// 批次建立請求
#[derive(Debug, Clone, PartialEq)]
pub struct CreateBatchRequest {
    pub product_id: String,
    pub stage: Stage,
    pub quantity_to_build: u32,

    /// 冪等鍵：相同鍵的重複請求回傳同一批次
    pub idempotency_key: Option<String>,
}

impl CreateBatchRequest {
    pub fn new(product_id: &str, stage: Stage, quantity_to_build: u32) -> Self {
        Self {
            product_id: product_id.to_string(),
            stage,
            quantity_to_build,
            idempotency_key: None,
        }
    }

    /// 建構器模式：設置冪等鍵
    pub fn with_idempotency_key(mut self, key: &str) -> Self {
        self.idempotency_key = Some(key.to_string());
        self
    }
}

/// 批次建立結果
#[derive(Debug, Clone, PartialEq)]
pub struct BatchCreation {
    pub batch: Batch,

    /// 降級處理的警告（例如配號失敗改用儲存層ID）
    pub warnings: Vec<String>,

    /// 是否為冪等重放（未寫入新批次）
    pub replayed: bool,
}

/// 批次建立服務
#[derive(Clone)]
pub struct BatchService {
    batches: BatchRepository,
    products: ProductRepository,
    raw_materials: RawMaterialRepository,
    allocator: IdAllocator,
}

impl BatchService {
    pub fn new(store: Arc<dyn DocumentStore>, config: &MesConfig) -> Self {
        Self {
            batches: BatchRepository::new(store.clone(), config),
            products: ProductRepository::new(store.clone(), config),
            raw_materials: RawMaterialRepository::new(store.clone(), config),
            allocator: IdAllocator::new(store, config),
        }
    }

    /// 建構器模式：替換配號器
    pub fn with_allocator(mut self, allocator: IdAllocator) -> Self {
        self.allocator = allocator;
        self
    }

    pub fn batches(&self) -> &BatchRepository {
        &self.batches
    }

    pub fn products(&self) -> &ProductRepository {
        &self.products
    }

    pub fn raw_materials(&self) -> &RawMaterialRepository {
        &self.raw_materials
    }

    /// 建立批次
    pub async fn create_batch(&self, request: CreateBatchRequest) -> Result<BatchCreation> {
        if request.product_id.trim().is_empty() {
            return Err(MesError::Validation("缺少產品參照".to_string()));
        }
        if request.quantity_to_build == 0 {
            return Err(MesError::Validation("建造數量必須大於 0".to_string()));
        }

        let storage_id = match &request.idempotency_key {
            Some(key) => idempotent_storage_id(key),
            None => BatchRepository::new_storage_id(),
        };
        if request.idempotency_key.is_some() {
            if let Some(existing) = self.batches.find(&storage_id).await? {
                tracing::info!("冪等鍵命中，回傳既有批次 {}", existing.batch.batch_id);
                return Ok(BatchCreation {
                    batch: existing.batch,
                    warnings: Vec::new(),
                    replayed: true,
                });
            }
        }

        let product = self.products.load(&request.product_id).await?;
        let plan = self
            .plan(&product, request.stage, request.quantity_to_build)
            .await?;

        let mut warnings = Vec::new();
        let batch_id = self
            .batch_code_or_fallback(request.stage, false, &storage_id, &mut warnings)
            .await;

        let batch = Batch::new(
            storage_id.clone(),
            product.id.clone(),
            product.name.clone(),
            request.quantity_to_build,
            product.manufacturing_stages.clone(),
            Utc::now(),
        )
        .with_batch_id(batch_id)
        .with_materials(plan.materials);

        self.persist(batch, warnings, request.idempotency_key.is_some())
            .await
    }

    /// 以來源批次測試站的不良品建立重工批次（僅含測試站）
    pub async fn create_rework_batch(&self, source_batch_id: &str) -> Result<BatchCreation> {
        let source = self.batches.load(source_batch_id).await?.batch;
        if !source.is_selected(Stage::Testing) {
            return Err(MesError::Validation(format!(
                "批次 {} 未包含測試站，無法建立重工批次",
                source.batch_id
            )));
        }
        let rejected = source.stage(Stage::Testing).rejected;
        if rejected == 0 {
            return Err(MesError::Validation(format!(
                "批次 {} 測試站沒有不良品",
                source.batch_id
            )));
        }

        let storage_id = idempotent_storage_id(&format!("rework:{}", source.id));
        if let Some(existing) = self.batches.find(&storage_id).await? {
            tracing::info!(
                "批次 {} 已有重工批次 {}",
                source.batch_id,
                existing.batch.batch_id
            );
            return Ok(BatchCreation {
                batch: existing.batch,
                warnings: Vec::new(),
                replayed: true,
            });
        }

        let product = self.products.load(&source.product_ref).await?;
        let plan = self.plan(&product, Stage::Testing, rejected).await?;

        let mut warnings = Vec::new();
        let batch_id = self
            .batch_code_or_fallback(Stage::Testing, true, &storage_id, &mut warnings)
            .await;

        let batch = Batch::new(
            storage_id,
            source.product_ref.clone(),
            source.product_name.clone(),
            rejected,
            vec![Stage::Testing],
            Utc::now(),
        )
        .with_batch_id(batch_id)
        .with_materials(plan.materials)
        .as_rework_of(source.batch_id.clone());

        self.persist(batch, warnings, true).await
    }

    /// 登錄新原料並配發 `RM_###` ID
    pub async fn register_raw_material(
        &self,
        name: &str,
        quantity: Decimal,
        unit: &str,
        min_stock: Option<Decimal>,
    ) -> Result<RawMaterial> {
        if name.trim().is_empty() {
            return Err(MesError::Validation("原料名稱不可為空".to_string()));
        }
        if quantity < Decimal::ZERO {
            return Err(MesError::Validation(format!("原料數量不可為負數: {}", quantity)));
        }

        let id = self
            .allocator
            .allocate(Collection::RawMaterials, RAW_MATERIAL_PREFIX)
            .await?;
        let mut material = RawMaterial::new(&id, name, quantity, unit);
        material.min_stock = min_stock;
        self.raw_materials.insert(&material).await?;

        tracing::info!("登錄原料 {} ({})", material.id, material.name);
        Ok(material)
    }

    /// 預覽批次計劃（不寫入）
    pub async fn preview(
        &self,
        product_id: &str,
        stage: Stage,
        quantity_to_build: u32,
    ) -> Result<BatchPlan> {
        let product = self.products.load(product_id).await?;
        self.stock_plan(&product, stage, quantity_to_build).await
    }

    async fn plan(
        &self,
        product: &Product,
        stage: Stage,
        quantity_to_build: u32,
    ) -> Result<BatchPlan> {
        let plan = self.stock_plan(product, stage, quantity_to_build).await?;
        if !plan.is_feasible() {
            tracing::warn!("產品 {} 庫存不足，短缺 {} 項", product.id, plan.shortages.len());
        }
        plan.into_result()
    }

    async fn stock_plan(
        &self,
        product: &Product,
        stage: Stage,
        quantity_to_build: u32,
    ) -> Result<BatchPlan> {
        let refs: BTreeSet<(MaterialSource, &str)> = product
            .bom_for(stage)
            .map(|row| (row.source, row.material_ref.as_str()))
            .collect();

        let mut snapshot = StockSnapshot::new();
        let raw = try_join_all(
            refs.iter()
                .filter(|(source, _)| *source == MaterialSource::Raw)
                .map(|(_, id)| self.raw_materials.find(id)),
        )
        .await?;
        for material in raw.iter().flatten() {
            snapshot.insert_raw_material(material);
        }
        let finals = try_join_all(
            refs.iter()
                .filter(|(source, _)| *source == MaterialSource::Final)
                .map(|(_, id)| self.products.find(id)),
        )
        .await?;
        for other in finals.iter().flatten() {
            snapshot.insert_product(other);
        }

        BomResolver::plan_batch(product, stage, quantity_to_build, &snapshot)
    }

    async fn batch_code_or_fallback(
        &self,
        stage: Stage,
        is_rework: bool,
        storage_id: &str,
        warnings: &mut Vec<String>,
    ) -> String {
        match self.allocator.allocate_batch_code(stage, is_rework).await {
            Ok(code) => code,
            Err(e) => {
                let message = format!("批號配發失敗，改用儲存層ID {}: {}", storage_id, e);
                tracing::warn!("{}", message);
                warnings.push(message);
                storage_id.to_string()
            }
        }
    }

    async fn persist(
        &self,
        batch: Batch,
        warnings: Vec<String>,
        idempotent: bool,
    ) -> Result<BatchCreation> {
        match self.batches.insert(&batch).await {
            Ok(saved) => {
                tracing::info!(
                    "建立批次 {}：產品 {}，數量 {}，物料 {} 項",
                    saved.batch.batch_id,
                    saved.batch.product_ref,
                    saved.batch.quantity_to_build,
                    saved.batch.materials.len()
                );
                Ok(BatchCreation {
                    batch: saved.batch,
                    warnings,
                    replayed: false,
                })
            }
            Err(MesError::AlreadyExists { .. }) if idempotent => {
                let existing = self.batches.load(&batch.id).await?;
                tracing::info!("並行的冪等請求已建立批次 {}", existing.batch.batch_id);
                Ok(BatchCreation {
                    batch: existing.batch,
                    warnings: Vec::new(),
                    replayed: true,
                })
            }
            Err(e) => Err(e),
        }
    }
}

/// 由冪等鍵推導固定的儲存層ID
fn idempotent_storage_id(key: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("mes-batch:{}", key).as_bytes())
        .simple()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mes_core::{BomRow, ErrorKind, MemoryStore};

    async fn setup(steel: i64) -> (MemoryStore, BatchService) {
        let store = MemoryStore::new();
        let service = BatchService::new(Arc::new(store.clone()), &MesConfig::default());
        service
            .raw_materials()
            .insert(&RawMaterial::new("steel", "steel", Decimal::from(steel), "kg"))
            .await
            .unwrap();
        service
            .products()
            .insert(
                &Product::new("P-1", "Widget", vec![Stage::Molding, Stage::Testing])
                    .with_bom_row(BomRow::raw("steel", Stage::Molding, Decimal::from(2), "kg"))
                    .with_bom_row(BomRow::raw("steel", Stage::Testing, Decimal::ONE, "kg")),
            )
            .await
            .unwrap();
        (store, service)
    }

    #[test]
    fn test_idempotent_storage_id_is_stable() {
        assert_eq!(idempotent_storage_id("k1"), idempotent_storage_id("k1"));
        assert_ne!(idempotent_storage_id("k1"), idempotent_storage_id("k2"));
    }

    #[tokio::test]
    async fn test_create_batch_snapshots_materials() {
        let (_, service) = setup(50).await;

        let created = service
            .create_batch(CreateBatchRequest::new("P-1", Stage::Molding, 10))
            .await
            .unwrap();

        assert_eq!(created.batch.batch_id, "BATCH-MLD-001");
        assert_eq!(created.batch.materials.len(), 1);
        assert_eq!(created.batch.total_material_quantity, Decimal::from(20));
        assert_eq!(created.batch.selected_processes, vec![Stage::Molding, Stage::Testing]);
        assert!(created.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_shortage_blocks_creation_without_consuming_code() {
        let (store, service) = setup(15).await;

        let err = service
            .create_batch(CreateBatchRequest::new("P-1", Stage::Molding, 10))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Shortage);
        assert!(err.to_string().contains("steel: need 20 kg, have 15 kg"));
        assert_eq!(store.len(Collection::Batches).await, 0);

        let ok = service
            .create_batch(CreateBatchRequest::new("P-1", Stage::Molding, 5))
            .await
            .unwrap();
        assert_eq!(ok.batch.batch_id, "BATCH-MLD-001");
    }

    #[tokio::test]
    async fn test_missing_product_is_not_found() {
        let (_, service) = setup(50).await;

        let err = service
            .create_batch(CreateBatchRequest::new("P-404", Stage::Molding, 1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_idempotency_key_replays() {
        let (store, service) = setup(50).await;
        let request =
            CreateBatchRequest::new("P-1", Stage::Molding, 10).with_idempotency_key("req-1");

        let first = service.create_batch(request.clone()).await.unwrap();
        let second = service.create_batch(request).await.unwrap();

        assert!(!first.replayed);
        assert!(second.replayed);
        assert_eq!(first.batch.batch_id, second.batch.batch_id);
        assert_eq!(store.len(Collection::Batches).await, 1);
    }

    #[tokio::test]
    async fn test_rework_batch_from_testing_rejects() {
        let (_, service) = setup(50).await;
        let created = service
            .create_batch(CreateBatchRequest::new("P-1", Stage::Molding, 10))
            .await
            .unwrap();

        let no_rejects = service.create_rework_batch(&created.batch.id).await;
        assert!(matches!(no_rejects, Err(MesError::Validation(_))));

        let patch = mes_core::FieldPatch::new()
            .set("processingStages.Testing.rejected", &3u32)
            .unwrap();
        service
            .batches()
            .update_fields(&created.batch.id, patch)
            .await
            .unwrap();

        let rework = service.create_rework_batch(&created.batch.id).await.unwrap();
        assert_eq!(rework.batch.batch_id, "FT-001");
        assert_eq!(rework.batch.quantity_to_build, 3);
        assert_eq!(rework.batch.selected_processes, vec![Stage::Testing]);
        assert_eq!(rework.batch.rework_of.as_deref(), Some("BATCH-MLD-001"));
        assert!(rework.batch.is_rework);

        let again = service.create_rework_batch(&created.batch.id).await.unwrap();
        assert!(again.replayed);
        assert_eq!(again.batch.batch_id, "FT-001");
    }

    #[tokio::test]
    async fn test_register_raw_material() {
        let (_, service) = setup(50).await;

        let first = service
            .register_raw_material("resin", Decimal::from(5), "kg", None)
            .await
            .unwrap();
        let second = service
            .register_raw_material("paint", Decimal::from(2), "l", Some(Decimal::ONE))
            .await
            .unwrap();

        assert_eq!(first.id, "RM_001");
        assert_eq!(second.id, "RM_002");
        assert!(service.raw_materials().find("RM_002").await.unwrap().is_some());
        assert!(service
            .register_raw_material("bad", Decimal::from(-1), "kg", None)
            .await
            .is_err());
    }
}
