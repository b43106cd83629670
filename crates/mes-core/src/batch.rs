//! 生產批次模型

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::product::MaterialSource;
use crate::stage::{is_canonical_subsequence, BatchStatus, Stage};
use crate::{MesError, Result};

/// 目前的文件結構版本
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// 站別執行狀態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    /// 未開工
    NotStarted,
    /// 已開工
    Started,
    /// 已完工
    Completed,
}

/// 單一站別的生產紀錄
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageRecord {
    /// 良品數
    pub accepted: u32,

    /// 不良品數
    pub rejected: u32,

    /// 實際耗用總量（作業員回報）
    pub actual_consumption: Decimal,

    /// 是否完工
    pub completed: bool,

    /// 開工時間
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// 完工時間
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,

    /// 逐物料耗用（物料ID → 數量），存在時優先於比例分攤
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub material_consumptions: Option<BTreeMap<String, Decimal>>,
}

impl StageRecord {
    /// 目前站別狀態
    pub fn state(&self) -> StageState {
        if self.completed {
            StageState::Completed
        } else if self.started_at.is_some() {
            StageState::Started
        } else {
            StageState::NotStarted
        }
    }

    /// 是否曾經開工（完工也視為開工過）
    pub fn has_started(&self) -> bool {
        self.started_at.is_some() || self.completed
    }
}

/// 四個標準站別的紀錄，欄位固定存在
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingStages {
    #[serde(rename = "Molding")]
    pub molding: StageRecord,
    #[serde(rename = "Machining")]
    pub machining: StageRecord,
    #[serde(rename = "Assembling")]
    pub assembling: StageRecord,
    #[serde(rename = "Testing")]
    pub testing: StageRecord,
}

impl ProcessingStages {
    pub fn get(&self, stage: Stage) -> &StageRecord {
        match stage {
            Stage::Molding => &self.molding,
            Stage::Machining => &self.machining,
            Stage::Assembling => &self.assembling,
            Stage::Testing => &self.testing,
        }
    }

    pub fn get_mut(&mut self, stage: Stage) -> &mut StageRecord {
        match stage {
            Stage::Molding => &mut self.molding,
            Stage::Machining => &mut self.machining,
            Stage::Assembling => &mut self.assembling,
            Stage::Testing => &mut self.testing,
        }
    }

    /// 依標準順序列出所有站別
    pub fn iter(&self) -> impl Iterator<Item = (Stage, &StageRecord)> {
        Stage::CANONICAL.into_iter().map(move |s| (s, self.get(s)))
    }
}

/// 建立批次時擷取的物料快照（之後的耗用計算以此為準）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaterialSnapshot {
    /// 物料ID（原料或成品）
    pub material_id: String,

    /// 物料名稱
    pub name: String,

    /// 計劃用量 = 單位用量 × 建造數量
    pub quantity: Decimal,

    /// 單位
    pub unit: String,

    /// 所屬站別
    pub stage: Stage,

    /// 來源
    pub source: MaterialSource,
}

/// 生產批次
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Batch {
    /// 文件結構版本
    pub schema_version: u32,

    /// 儲存層ID
    pub id: String,

    /// 可讀批號（建立後不可變更）
    pub batch_id: String,

    /// 產品ID
    pub product_ref: String,

    /// 產品名稱
    pub product_name: String,

    /// 建造數量
    pub quantity_to_build: u32,

    /// 物料快照
    pub materials: Vec<MaterialSnapshot>,

    /// 物料總量
    pub total_material_quantity: Decimal,

    /// 選用站別（標準順序的子序列）
    pub selected_processes: Vec<Stage>,

    /// 各站別紀錄
    pub processing_stages: ProcessingStages,

    /// 批次狀態
    pub status: BatchStatus,

    /// 建立時間
    pub created_at: DateTime<Utc>,

    /// 是否為重工批次
    #[serde(default)]
    pub is_rework: bool,

    /// 重工來源批號
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rework_of: Option<String>,
}

impl Batch {
    /// 創建新的批次（批號預設為儲存層ID）
    pub fn new(
        id: String,
        product_ref: String,
        product_name: String,
        quantity_to_build: u32,
        selected_processes: Vec<Stage>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            batch_id: id.clone(),
            id,
            product_ref,
            product_name,
            quantity_to_build,
            materials: Vec::new(),
            total_material_quantity: Decimal::ZERO,
            selected_processes,
            processing_stages: ProcessingStages::default(),
            status: BatchStatus::Planned,
            created_at,
            is_rework: false,
            rework_of: None,
        }
    }

    /// 建構器模式：設置可讀批號
    pub fn with_batch_id(mut self, batch_id: String) -> Self {
        self.batch_id = batch_id;
        self
    }

    /// 建構器模式：設置物料快照並計算總量
    pub fn with_materials(mut self, materials: Vec<MaterialSnapshot>) -> Self {
        self.total_material_quantity = materials.iter().map(|m| m.quantity).sum();
        self.materials = materials;
        self
    }

    /// 建構器模式：標記為重工批次
    pub fn as_rework_of(mut self, source_batch_id: String) -> Self {
        self.is_rework = true;
        self.rework_of = Some(source_batch_id);
        self
    }

    pub fn stage(&self, stage: Stage) -> &StageRecord {
        self.processing_stages.get(stage)
    }

    pub fn is_selected(&self, stage: Stage) -> bool {
        self.selected_processes.contains(&stage)
    }

    /// 站別在選用序列中的位置
    pub fn position(&self, stage: Stage) -> Option<usize> {
        self.selected_processes.iter().position(|s| *s == stage)
    }

    /// 前一個選用站別
    pub fn previous_stage(&self, stage: Stage) -> Option<Stage> {
        match self.position(stage)? {
            0 => None,
            idx => self.selected_processes.get(idx - 1).copied(),
        }
    }

    /// 下一個選用站別
    pub fn next_stage(&self, stage: Stage) -> Option<Stage> {
        let idx = self.position(stage)?;
        self.selected_processes.get(idx + 1).copied()
    }

    pub fn last_stage(&self) -> Option<Stage> {
        self.selected_processes.last().copied()
    }

    /// 指定站別之前的選用站別是否全部完工
    pub fn predecessors_completed(&self, stage: Stage) -> bool {
        match self.position(stage) {
            Some(idx) => self.selected_processes[..idx]
                .iter()
                .all(|s| self.stage(*s).completed),
            None => false,
        }
    }

    /// 依站別紀錄推導批次狀態（不含外部設定的暫停）
    pub fn derived_status(&self) -> BatchStatus {
        if let Some(last) = self.last_stage() {
            if self.stage(last).completed {
                return BatchStatus::Completed;
            }
        }
        if self.processing_stages.iter().any(|(_, r)| r.has_started()) {
            BatchStatus::InProgress
        } else {
            BatchStatus::Planned
        }
    }

    /// 指定站別的計劃物料
    pub fn materials_for(&self, stage: Stage) -> impl Iterator<Item = &MaterialSnapshot> {
        self.materials.iter().filter(move |m| m.stage == stage)
    }

    /// 驗證批次不變量
    pub fn validate(&self) -> Result<()> {
        if self.batch_id.trim().is_empty() {
            return Err(MesError::InvalidDocument {
                id: self.id.clone(),
                reason: "batchId 不可為空".to_string(),
            });
        }

        if !is_canonical_subsequence(&self.selected_processes) {
            return Err(MesError::InvalidDocument {
                id: self.id.clone(),
                reason: format!(
                    "selectedProcesses 必須為標準站別順序的非空子序列: {:?}",
                    self.selected_processes
                ),
            });
        }

        for stage in &self.selected_processes {
            if self.stage(*stage).completed && !self.predecessors_completed(*stage) {
                return Err(MesError::InvalidDocument {
                    id: self.id.clone(),
                    reason: format!("站別 {} 已完工但前序站別未完工", stage),
                });
            }
        }

        for (stage, record) in self.processing_stages.iter() {
            let negative_breakdown = record
                .material_consumptions
                .as_ref()
                .is_some_and(|m| m.values().any(|v| *v < Decimal::ZERO));
            if record.actual_consumption < Decimal::ZERO || negative_breakdown {
                return Err(MesError::InvalidDocument {
                    id: self.id.clone(),
                    reason: format!("站別 {} 的耗用量為負數", stage),
                });
            }
        }

        if let Some(material) = self.materials.iter().find(|m| m.quantity < Decimal::ZERO) {
            return Err(MesError::InvalidDocument {
                id: self.id.clone(),
                reason: format!("物料 {} 的計劃用量為負數", material.material_id),
            });
        }

        Ok(())
    }
}
