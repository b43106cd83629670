//! 版本衝突重試

use mes_core::{MesConfig, Result};
use std::future::Future;
use std::time::Duration;

/// 重試策略：有上限的次數與線性遞增的間隔
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// 首次嘗試之外的最大重試次數
    pub max_retries: u32,

    /// 第 n 次重試前等待 `backoff * n`
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &MesConfig) -> Self {
        Self {
            max_retries: config.max_conflict_retries,
            backoff: config.retry_backoff(),
        }
    }

    /// 不重試
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            backoff: Duration::ZERO,
        }
    }
}

/// 可重試錯誤（版本衝突、逾時）時重新執行整個讀取-計算-寫入流程
pub async fn retry_on_conflict<T, F, Fut>(
    policy: RetryPolicy,
    operation: &str,
    mut attempt: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut retries = 0;
    loop {
        match attempt().await {
            Err(e) if e.is_retryable() && retries < policy.max_retries => {
                retries += 1;
                tracing::debug!("{} 第 {} 次重試: {}", operation, retries, e);
                if !policy.backoff.is_zero() {
                    tokio::time::sleep(policy.backoff * retries).await;
                }
            }
            Err(e) => {
                if e.is_retryable() {
                    tracing::warn!("{} 重試 {} 次後仍失敗: {}", operation, retries, e);
                }
                return Err(e);
            }
            Ok(value) => return Ok(value),
        }
    }
}
