//! 執行期配置

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::Result;

/// 系統配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MesConfig {
    /// 單次儲存層呼叫逾時（毫秒）
    pub repository_timeout_ms: u64,

    /// 版本衝突時的最大重試次數
    pub max_conflict_retries: u32,

    /// 重試間隔（毫秒，線性遞增）
    pub retry_backoff_ms: u64,

    /// 可讀ID的數字位數
    pub id_pad_width: usize,

    /// 是否啟用舊資料的次要欄位查找
    pub legacy_lookup: bool,

    /// 建議快取存活時間（秒）
    pub suggestion_cache_ttl_secs: u64,

    /// 建議快取容量
    pub suggestion_cache_capacity: usize,

    /// 外部建議產生器逾時（毫秒）
    pub suggestion_timeout_ms: u64,

    /// 建議計算取用的最近批次數
    pub recent_batch_window: usize,

    /// 預設低庫存警戒值
    pub default_low_stock_threshold: Decimal,

    /// 良率目標（百分比）
    pub yield_target_percent: Decimal,

    /// 建議數量上限
    pub max_suggestions: usize,
}

impl Default for MesConfig {
    fn default() -> Self {
        Self {
            repository_timeout_ms: 2_000,
            max_conflict_retries: 5,
            retry_backoff_ms: 10,
            id_pad_width: 3,
            legacy_lookup: true,
            suggestion_cache_ttl_secs: 300,
            suggestion_cache_capacity: 32,
            suggestion_timeout_ms: 10_000,
            recent_batch_window: 20,
            default_low_stock_threshold: Decimal::from(10),
            yield_target_percent: Decimal::from(90),
            max_suggestions: 5,
        }
    }
}

impl MesConfig {
    /// 由 JSON 載入配置，缺少的欄位使用預設值
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// 建構器模式：設置儲存層逾時
    pub fn with_repository_timeout(mut self, timeout: Duration) -> Self {
        self.repository_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// 建構器模式：設置衝突重試次數
    pub fn with_max_conflict_retries(mut self, retries: u32) -> Self {
        self.max_conflict_retries = retries;
        self
    }

    /// 建構器模式：設置ID位數
    pub fn with_id_pad_width(mut self, width: usize) -> Self {
        self.id_pad_width = width;
        self
    }

    /// 建構器模式：設置是否啟用舊資料查找
    pub fn with_legacy_lookup(mut self, enabled: bool) -> Self {
        self.legacy_lookup = enabled;
        self
    }

    /// 建構器模式：設置建議快取存活時間
    pub fn with_suggestion_cache_ttl(mut self, ttl: Duration) -> Self {
        self.suggestion_cache_ttl_secs = ttl.as_secs();
        self
    }

    /// 建構器模式：設置低庫存警戒值
    pub fn with_default_low_stock_threshold(mut self, threshold: Decimal) -> Self {
        self.default_low_stock_threshold = threshold;
        self
    }

    /// 建構器模式：設置良率目標
    pub fn with_yield_target_percent(mut self, percent: Decimal) -> Self {
        self.yield_target_percent = percent;
        self
    }

    pub fn repository_timeout(&self) -> Duration {
        Duration::from_millis(self.repository_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn suggestion_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.suggestion_cache_ttl_secs)
    }

    pub fn suggestion_timeout(&self) -> Duration {
        Duration::from_millis(self.suggestion_timeout_ms)
    }
}
