//! 產品、BOM 與原料模型

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::batch::CURRENT_SCHEMA_VERSION;
use crate::stage::{is_canonical_subsequence, Stage};
use crate::{MesError, Result};

/// 物料來源
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaterialSource {
    /// 原料庫存
    Raw,
    /// 其他成品庫存
    Final,
}

/// BOM 列
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BomRow {
    /// 物料參照（原料ID或成品ID）
    pub material_ref: String,

    /// 使用站別
    pub stage: Stage,

    /// 單位用量
    pub qty_per_unit: Decimal,

    /// 單位
    pub unit: String,

    /// 來源
    pub source: MaterialSource,
}

impl BomRow {
    /// 創建原料 BOM 列
    pub fn raw(material_ref: &str, stage: Stage, qty_per_unit: Decimal, unit: &str) -> Self {
        Self {
            material_ref: material_ref.to_string(),
            stage,
            qty_per_unit,
            unit: unit.to_string(),
            source: MaterialSource::Raw,
        }
    }

    /// 創建成品 BOM 列
    pub fn final_product(
        material_ref: &str,
        stage: Stage,
        qty_per_unit: Decimal,
        unit: &str,
    ) -> Self {
        Self {
            source: MaterialSource::Final,
            ..Self::raw(material_ref, stage, qty_per_unit, unit)
        }
    }

    /// 檢查 BOM 列格式
    pub fn validate(&self) -> Result<()> {
        if self.material_ref.trim().is_empty() {
            return Err(MesError::Validation("BOM 列缺少物料參照".to_string()));
        }
        if self.qty_per_unit < Decimal::ZERO {
            return Err(MesError::Validation(format!(
                "BOM 列 {} 的單位用量為負數: {}",
                self.material_ref, self.qty_per_unit
            )));
        }
        Ok(())
    }
}

/// 產品（成品庫存）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    #[serde(default = "current_schema_version")]
    pub schema_version: u32,

    /// 產品ID
    pub id: String,

    /// 產品名稱
    pub name: String,

    /// 現有成品數量
    pub quantity: Decimal,

    /// 單位
    #[serde(default = "default_unit")]
    pub unit: String,

    /// 選用站別（有序）
    pub manufacturing_stages: Vec<Stage>,

    /// 各站別庫存警戒值
    #[serde(default)]
    pub stage_thresholds: BTreeMap<Stage, Decimal>,

    /// 物料清單
    #[serde(default)]
    pub bom: Vec<BomRow>,
}

impl Product {
    /// 創建新的產品
    pub fn new(id: &str, name: &str, manufacturing_stages: Vec<Stage>) -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            id: id.to_string(),
            name: name.to_string(),
            quantity: Decimal::ZERO,
            unit: default_unit(),
            manufacturing_stages,
            stage_thresholds: BTreeMap::new(),
            bom: Vec::new(),
        }
    }

    /// 建構器模式：設置現有數量
    pub fn with_quantity(mut self, quantity: Decimal) -> Self {
        self.quantity = quantity;
        self
    }

    /// 建構器模式：加入 BOM 列
    pub fn with_bom_row(mut self, row: BomRow) -> Self {
        self.bom.push(row);
        self
    }

    /// 建構器模式：設置站別警戒值
    pub fn with_stage_threshold(mut self, stage: Stage, threshold: Decimal) -> Self {
        self.stage_thresholds.insert(stage, threshold);
        self
    }

    pub fn allows_stage(&self, stage: Stage) -> bool {
        self.manufacturing_stages.contains(&stage)
    }

    /// 指定站別的 BOM 列
    pub fn bom_for(&self, stage: Stage) -> impl Iterator<Item = &BomRow> {
        self.bom.iter().filter(move |row| row.stage == stage)
    }

    /// 成品警戒值（取最後一個選用站別的設定）
    pub fn stock_threshold(&self) -> Option<Decimal> {
        self.manufacturing_stages
            .last()
            .and_then(|s| self.stage_thresholds.get(s))
            .copied()
    }

    /// 驗證產品設定
    pub fn validate(&self) -> Result<()> {
        if !is_canonical_subsequence(&self.manufacturing_stages) {
            return Err(MesError::InvalidDocument {
                id: self.id.clone(),
                reason: format!(
                    "manufacturingStages 必須為標準站別順序的非空子序列: {:?}",
                    self.manufacturing_stages
                ),
            });
        }
        Ok(())
    }
}

/// 原料
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMaterial {
    #[serde(default = "current_schema_version")]
    pub schema_version: u32,

    /// 原料ID
    pub id: String,

    /// 原料名稱
    pub name: String,

    /// 現有數量
    pub quantity: Decimal,

    /// 單位
    pub unit: String,

    /// 最低庫存（低於時提示補貨）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_stock: Option<Decimal>,
}

impl RawMaterial {
    /// 創建新的原料
    pub fn new(id: &str, name: &str, quantity: Decimal, unit: &str) -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            id: id.to_string(),
            name: name.to_string(),
            quantity,
            unit: unit.to_string(),
            min_stock: None,
        }
    }

    /// 建構器模式：設置最低庫存
    pub fn with_min_stock(mut self, min_stock: Decimal) -> Self {
        self.min_stock = Some(min_stock);
        self
    }
}

fn current_schema_version() -> u32 {
    CURRENT_SCHEMA_VERSION
}

fn default_unit() -> String {
    "pcs".to_string()
}
