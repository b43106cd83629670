//! # MES
//!
//! 生產批次追蹤：站別狀態機、BOM 解析與庫存檢查、耗用損耗計算、可讀ID配號

pub mod logging;

pub use mes_cache;
pub use mes_calc;
pub use mes_core;
pub use mes_flow;

pub use mes_core::{Batch, BatchStatus, MesConfig, MesError, Result, Stage};
pub use mes_flow::MesServices;
