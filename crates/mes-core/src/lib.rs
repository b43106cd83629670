//! # MES Core
//!
//! 核心資料模型、錯誤類型與儲存層邊界

pub mod batch;
pub mod config;
pub mod memory;
pub mod product;
pub mod repository;
pub mod schema;
pub mod stage;
pub mod store;

// Re-export 主要類型
pub use batch::{Batch, MaterialSnapshot, ProcessingStages, StageRecord, StageState};
pub use config::MesConfig;
pub use memory::MemoryStore;
pub use product::{BomRow, MaterialSource, Product, RawMaterial};
pub use repository::{BatchRepository, LoadedBatch, ProductRepository, RawMaterialRepository};
pub use stage::{BatchStatus, Stage};
pub use store::{Collection, Document, DocumentStore, FieldPatch, Filter};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// 物料短缺明細
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Shortage {
    /// 物料ID
    pub material_id: String,

    /// 物料名稱
    pub name: String,

    /// 需求量
    pub required: Decimal,

    /// 可用量
    pub available: Decimal,

    /// 單位
    pub unit: String,
}

impl Shortage {
    /// 短缺數量
    pub fn missing(&self) -> Decimal {
        self.required - self.available
    }
}

impl fmt::Display for Shortage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: need {} {}, have {} {}",
            self.name,
            self.required.normalize(),
            self.unit,
            self.available.normalize(),
            self.unit
        )
    }
}

fn format_shortages(shortages: &[Shortage]) -> String {
    shortages
        .iter()
        .map(|s| format!("  - {}", s))
        .collect::<Vec<_>>()
        .join("\n")
}

/// 錯誤分類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Shortage,
    NotFound,
    Sequencing,
    Conflict,
    Timeout,
    Storage,
}

/// MES 錯誤類型
#[derive(Debug, thiserror::Error)]
pub enum MesError {
    #[error("驗證錯誤: {0}")]
    Validation(String),

    #[error("站別 {stage} 不在產品 {product} 的製程設定中")]
    StageNotAllowed { product: String, stage: Stage },

    #[error("物料不足:\n{}", format_shortages(.0))]
    Shortage(Vec<Shortage>),

    #[error("找不到{entity}: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("製程順序錯誤: {0}")]
    Sequencing(String),

    #[error("版本衝突: id={id}, expected={expected}, actual={actual}")]
    VersionConflict { id: String, expected: u64, actual: u64 },

    #[error("儲存層呼叫逾時: {operation}")]
    Timeout { operation: String },

    #[error("文件已存在: {collection}/{id}")]
    AlreadyExists { collection: String, id: String },

    #[error("文件格式無效 (id={id}): {reason}")]
    InvalidDocument { id: String, reason: String },

    #[error("儲存層錯誤: {0}")]
    Storage(String),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl MesError {
    /// 錯誤分類
    pub fn kind(&self) -> ErrorKind {
        match self {
            MesError::Validation(_)
            | MesError::StageNotAllowed { .. }
            | MesError::InvalidDocument { .. }
            | MesError::Serialization(_) => ErrorKind::Validation,
            MesError::Shortage(_) => ErrorKind::Shortage,
            MesError::NotFound { .. } => ErrorKind::NotFound,
            MesError::Sequencing(_) => ErrorKind::Sequencing,
            MesError::VersionConflict { .. } | MesError::AlreadyExists { .. } => {
                ErrorKind::Conflict
            }
            MesError::Timeout { .. } => ErrorKind::Timeout,
            MesError::Storage(_) => ErrorKind::Storage,
        }
    }

    /// 是否可重試
    pub fn is_retryable(&self) -> bool {
        matches!(self, MesError::VersionConflict { .. } | MesError::Timeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, MesError>;
