//! 建議快取
//!
//! 以 moka 建構：容量有上限、存活時間明確，由建議服務注入持有。
//! 可跨工作共用，不需外層鎖。

use mes_calc::Suggestion;
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;

/// 建議快取
#[derive(Clone)]
pub struct SuggestionCache {
    /// moka 快取（容量 + TTL）
    cache: Cache<String, Arc<Vec<Suggestion>>>,
    ttl: Duration,
}

impl SuggestionCache {
    /// 創建新的快取（容量至少為 1）
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(capacity.max(1) as u64)
            .time_to_live(ttl)
            .eviction_listener(|key, _value, cause| {
                tracing::debug!("建議快取項目移除: {} ({:?})", key, cause);
            })
            .build();

        Self { cache, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// 目前項目數（為估計值，淘汰工作執行後才精確）
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    /// 讀取未過期的項目
    pub async fn get(&self, fingerprint: &str) -> Option<Vec<Suggestion>> {
        self.cache
            .get(fingerprint)
            .await
            .map(|suggestions| suggestions.as_ref().clone())
    }

    /// 寫入項目；已滿時由 moka 依使用頻率淘汰
    pub async fn insert(&self, fingerprint: String, suggestions: Vec<Suggestion>) {
        self.cache.insert(fingerprint, Arc::new(suggestions)).await;
    }

    /// 執行待處理的過期與淘汰工作
    pub async fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks().await;
    }

    pub fn clear(&self) {
        self.cache.invalidate_all();
    }
}
