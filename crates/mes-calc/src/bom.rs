//! BOM 解析與庫存檢查

use mes_core::{
    BomRow, MaterialSnapshot, MaterialSource, MesError, Product, RawMaterial, Shortage, Stage,
};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};

/// 庫存水位
#[derive(Debug, Clone, PartialEq)]
pub struct StockLevel {
    /// 物料名稱
    pub name: String,

    /// 可用數量
    pub quantity: Decimal,

    /// 單位
    pub unit: String,
}

/// 庫存查詢
pub trait StockLookup {
    /// 查詢物料庫存；參照不存在時回傳 `None`
    fn stock(&self, source: MaterialSource, material_ref: &str) -> Option<StockLevel>;
}

/// 預先載入的庫存快照
#[derive(Debug, Clone, Default)]
pub struct StockSnapshot {
    raw: HashMap<String, StockLevel>,
    finals: HashMap<String, StockLevel>,
}

impl StockSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// 建構器模式：加入原料
    pub fn with_raw_material(mut self, material: &RawMaterial) -> Self {
        self.insert_raw_material(material);
        self
    }

    /// 建構器模式：加入成品
    pub fn with_product(mut self, product: &Product) -> Self {
        self.insert_product(product);
        self
    }

    pub fn insert_raw_material(&mut self, material: &RawMaterial) {
        self.raw.insert(
            material.id.clone(),
            StockLevel {
                name: material.name.clone(),
                quantity: material.quantity,
                unit: material.unit.clone(),
            },
        );
    }

    pub fn insert_product(&mut self, product: &Product) {
        self.finals.insert(
            product.id.clone(),
            StockLevel {
                name: product.name.clone(),
                quantity: product.quantity,
                unit: product.unit.clone(),
            },
        );
    }
}

impl StockLookup for StockSnapshot {
    fn stock(&self, source: MaterialSource, material_ref: &str) -> Option<StockLevel> {
        match source {
            MaterialSource::Raw => self.raw.get(material_ref),
            MaterialSource::Final => self.finals.get(material_ref),
        }
        .cloned()
    }
}

/// 批次計劃結果
#[derive(Debug, Clone, PartialEq)]
pub struct BatchPlan {
    /// 站別
    pub stage: Stage,

    /// 建造數量
    pub quantity_to_build: u32,

    /// 要擷取到批次上的物料快照
    pub materials: Vec<MaterialSnapshot>,

    /// 短缺明細（全部列出）
    pub shortages: Vec<Shortage>,

    /// 物料總量
    pub total_material_quantity: Decimal,
}

impl BatchPlan {
    /// 是否可建立批次
    pub fn is_feasible(&self) -> bool {
        self.shortages.is_empty()
    }

    /// 有短缺時轉為 `Shortage` 錯誤
    pub fn into_result(self) -> mes_core::Result<Self> {
        if self.is_feasible() {
            Ok(self)
        } else {
            Err(MesError::Shortage(self.shortages))
        }
    }
}

/// BOM 解析器
pub struct BomResolver;

impl BomResolver {
    /// 依產品、站別與建造數量計算物料需求並檢查庫存
    ///
    /// 同一物料在該站別出現多列時，需求量合併後再與庫存比較。
    pub fn plan_batch(
        product: &Product,
        stage: Stage,
        quantity_to_build: u32,
        stock: &impl StockLookup,
    ) -> mes_core::Result<BatchPlan> {
        if product.id.trim().is_empty() {
            return Err(MesError::Validation("缺少產品參照".to_string()));
        }
        if quantity_to_build == 0 {
            return Err(MesError::Validation("建造數量必須大於 0".to_string()));
        }
        if !product.allows_stage(stage) {
            return Err(MesError::StageNotAllowed {
                product: product.id.clone(),
                stage,
            });
        }

        let rows: Vec<&BomRow> = product.bom_for(stage).collect();
        for row in &rows {
            row.validate()?;
        }

        let unresolved: Vec<&str> = rows
            .iter()
            .filter(|row| stock.stock(row.source, &row.material_ref).is_none())
            .map(|row| row.material_ref.as_str())
            .collect();
        if !unresolved.is_empty() {
            return Err(MesError::Validation(format!(
                "產品 {} 的 BOM 參照不存在的物料: {}",
                product.id,
                unresolved.join(", ")
            )));
        }

        let build_qty = Decimal::from(quantity_to_build);
        let mut materials = Vec::with_capacity(rows.len());
        let mut required: BTreeMap<(MaterialSource, &str), (Decimal, &BomRow)> = BTreeMap::new();

        for row in &rows {
            let level = stock
                .stock(row.source, &row.material_ref)
                .ok_or_else(|| MesError::Validation(format!("物料 {} 不存在", row.material_ref)))?;
            let quantity = row
                .qty_per_unit
                .checked_mul(build_qty)
                .ok_or_else(|| overflow(&product.id, &row.material_ref))?;

            materials.push(MaterialSnapshot {
                material_id: row.material_ref.clone(),
                name: level.name,
                quantity,
                unit: row.unit.clone(),
                stage,
                source: row.source,
            });

            match required.get_mut(&(row.source, row.material_ref.as_str())) {
                Some((total, _)) => {
                    *total = total
                        .checked_add(quantity)
                        .ok_or_else(|| overflow(&product.id, &row.material_ref))?;
                }
                None => {
                    required.insert((row.source, row.material_ref.as_str()), (quantity, row));
                }
            }
        }

        let mut shortages = Vec::new();
        for ((source, material_ref), (need, row)) in &required {
            if let Some(level) = stock.stock(*source, material_ref) {
                if *need > level.quantity {
                    shortages.push(Shortage {
                        material_id: material_ref.to_string(),
                        name: level.name,
                        required: *need,
                        available: level.quantity,
                        unit: row.unit.clone(),
                    });
                }
            }
        }

        let total_material_quantity = materials
            .iter()
            .try_fold(Decimal::ZERO, |acc, m| acc.checked_add(m.quantity))
            .ok_or_else(|| {
                MesError::Validation(format!("產品 {} 的物料總量數值溢位", product.id))
            })?;

        tracing::debug!(
            "產品 {} 站別 {} 計劃 {} 件：物料 {} 項，短缺 {} 項",
            product.id,
            stage,
            quantity_to_build,
            materials.len(),
            shortages.len()
        );

        Ok(BatchPlan {
            stage,
            quantity_to_build,
            materials,
            shortages,
            total_material_quantity,
        })
    }
}

fn overflow(product: &str, material_ref: &str) -> MesError {
    MesError::Validation(format!("產品 {product} 的物料 {material_ref} 需求量數值溢位"))
}
