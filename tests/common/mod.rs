//! 整合測試共用工具

#![allow(dead_code)]

use async_trait::async_trait;
use futures::stream::BoxStream;
use mes_core::{
    BomRow, Collection, Document, DocumentStore, FieldPatch, Filter, MemoryStore, MesConfig,
    MesError, Product, RawMaterial, RawMaterialRepository, ProductRepository, Result, Stage,
};
use rust_decimal::Decimal;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// 計數器故障的儲存（模擬配號失敗）
#[derive(Clone)]
pub struct FailingSequenceStore {
    pub inner: MemoryStore,
}

#[async_trait]
impl DocumentStore for FailingSequenceStore {
    async fn get(&self, collection: Collection, id: &str) -> Result<Option<Document>> {
        self.inner.get(collection, id).await
    }

    async fn query(&self, collection: Collection, filter: &Filter) -> Result<Vec<Document>> {
        self.inner.query(collection, filter).await
    }

    async fn create(&self, collection: Collection, id: &str, data: Value) -> Result<Document> {
        self.inner.create(collection, id, data).await
    }

    async fn update(
        &self,
        collection: Collection,
        id: &str,
        patch: &FieldPatch,
        expected_version: Option<u64>,
    ) -> Result<Document> {
        self.inner.update(collection, id, patch, expected_version).await
    }

    async fn delete(&self, collection: Collection, id: &str) -> Result<bool> {
        self.inner.delete(collection, id).await
    }

    fn watch(&self, collection: Collection, filter: Filter) -> BoxStream<'static, Vec<Document>> {
        self.inner.watch(collection, filter)
    }

    async fn next_sequence(&self, _key: &str, _floor: u64) -> Result<u64> {
        Err(MesError::Storage("計數器無法使用".to_string()))
    }
}

/// 讀取極慢的儲存（模擬逾時）
#[derive(Clone)]
pub struct SlowStore {
    pub inner: MemoryStore,
    pub delay: Duration,
}

#[async_trait]
impl DocumentStore for SlowStore {
    async fn get(&self, collection: Collection, id: &str) -> Result<Option<Document>> {
        tokio::time::sleep(self.delay).await;
        self.inner.get(collection, id).await
    }

    async fn query(&self, collection: Collection, filter: &Filter) -> Result<Vec<Document>> {
        tokio::time::sleep(self.delay).await;
        self.inner.query(collection, filter).await
    }

    async fn create(&self, collection: Collection, id: &str, data: Value) -> Result<Document> {
        self.inner.create(collection, id, data).await
    }

    async fn update(
        &self,
        collection: Collection,
        id: &str,
        patch: &FieldPatch,
        expected_version: Option<u64>,
    ) -> Result<Document> {
        self.inner.update(collection, id, patch, expected_version).await
    }

    async fn delete(&self, collection: Collection, id: &str) -> Result<bool> {
        self.inner.delete(collection, id).await
    }

    fn watch(&self, collection: Collection, filter: Filter) -> BoxStream<'static, Vec<Document>> {
        self.inner.watch(collection, filter)
    }

    async fn next_sequence(&self, key: &str, floor: u64) -> Result<u64> {
        self.inner.next_sequence(key, floor).await
    }
}

/// Widget：成型每件 2 kg 鋼材，組裝每件 1 個齒輪（成品）
pub fn widget() -> Product {
    Product::new(
        "P-WIDGET",
        "Widget",
        vec![Stage::Molding, Stage::Machining, Stage::Assembling, Stage::Testing],
    )
    .with_bom_row(BomRow::raw("steel", Stage::Molding, Decimal::from(2), "kg"))
    .with_bom_row(BomRow::final_product("P-GEAR", Stage::Assembling, Decimal::ONE, "pcs"))
}

pub fn gear(quantity: i64) -> Product {
    Product::new("P-GEAR", "Gear", vec![Stage::Machining]).with_quantity(Decimal::from(quantity))
}

/// 寫入 Widget、齒輪與鋼材
pub async fn seed(store: Arc<dyn DocumentStore>, steel: i64, gears: i64) {
    let config = MesConfig::default();
    RawMaterialRepository::new(store.clone(), &config)
        .insert(&RawMaterial::new("steel", "steel", Decimal::from(steel), "kg"))
        .await
        .unwrap();
    let products = ProductRepository::new(store, &config);
    products.insert(&widget()).await.unwrap();
    products.insert(&gear(gears)).await.unwrap();
}
