//! # MES Calculation
//!
//! 批次計算引擎：BOM 解析、站別狀態機、耗用損耗與規則式建議

pub mod bom;
pub mod sequencing;
pub mod suggestion;
pub mod wastage;

// Re-export 主要類型
pub use bom::{BatchPlan, BomResolver, StockLevel, StockLookup, StockSnapshot};
pub use sequencing::{StageMachine, StageOutput, StageTransition, TransitionTable};
pub use suggestion::{Chart, ChartPoint, FallbackRules, Suggestion, SuggestionSnapshot};
pub use wastage::{
    BatchConsumption, MaterialConsumption, ProductWastage, StageConsumption, WastageCalculator,
};
