//! 可讀ID配號
//!
//! 序號由儲存端原子計數器發放；既有資料的最大序號只作為計數器下限，
//! 因此並行配號不會取得相同號碼，舊資料的號碼也不會被重複使用。

use mes_core::repository::{with_timeout, IMMUTABLE_BATCH_FIELD};
use mes_core::{Collection, DocumentStore, Filter, MesConfig, Result, Stage};
use std::sync::Arc;
use std::time::Duration;

/// 重工批號前綴
pub const REWORK_PREFIX: &str = "FT-";

/// 站別批號前綴，例如 `BATCH-MLD-`
pub fn batch_code_prefix(stage: Stage, is_rework: bool) -> String {
    if is_rework {
        REWORK_PREFIX.to_string()
    } else {
        format!("BATCH-{}-", stage.code())
    }
}

/// 解析前綴後的數字尾碼
fn parse_suffix(value: &str, prefix: &str) -> Option<u64> {
    value.strip_prefix(prefix)?.parse().ok()
}

/// 補零格式化（超過位數時不截斷）
fn format_code(prefix: &str, sequence: u64, pad: usize) -> String {
    format!("{}{:0width$}", prefix, sequence, width = pad)
}

/// 可讀ID配號器
#[derive(Clone)]
pub struct IdAllocator {
    store: Arc<dyn DocumentStore>,
    timeout: Duration,
    pad: usize,
}

impl IdAllocator {
    pub fn new(store: Arc<dyn DocumentStore>, config: &MesConfig) -> Self {
        Self {
            store,
            timeout: config.repository_timeout(),
            pad: config.id_pad_width,
        }
    }

    /// 建構器模式：設置數字位數
    pub fn with_pad(mut self, pad: usize) -> Self {
        self.pad = pad;
        self
    }

    /// 配發集合內的可讀ID，例如 `RM_001`
    pub async fn allocate(&self, collection: Collection, prefix: &str) -> Result<String> {
        let scoped = format!("{}_", prefix);
        let existing = with_timeout(
            self.timeout,
            "allocate.scan",
            self.store.query(collection, &Filter::IdPrefix(scoped.clone())),
        )
        .await?;
        let floor = existing
            .iter()
            .filter_map(|doc| parse_suffix(&doc.id, &scoped))
            .max()
            .unwrap_or(0);

        let counter_key = format!("{}/{}", collection, scoped);
        let sequence = self.next(&counter_key, floor).await?;
        let id = format_code(&scoped, sequence, self.pad);
        tracing::debug!("配發ID {} (下限 {})", id, floor);
        Ok(id)
    }

    /// 配發批號，例如 `BATCH-MLD-007`；重工批次使用 `FT-` 前綴
    pub async fn allocate_batch_code(&self, stage: Stage, is_rework: bool) -> Result<String> {
        let prefix = batch_code_prefix(stage, is_rework);
        let existing = with_timeout(
            self.timeout,
            "allocateBatchCode.scan",
            self.store.query(
                Collection::Batches,
                &Filter::field_prefix(IMMUTABLE_BATCH_FIELD, &prefix),
            ),
        )
        .await?;
        let floor = existing
            .iter()
            .filter_map(|doc| doc.field(IMMUTABLE_BATCH_FIELD)?.as_str())
            .filter_map(|code| parse_suffix(code, &prefix))
            .max()
            .unwrap_or(0);

        let counter_key = format!("{}/{}", Collection::Batches, prefix);
        let sequence = self.next(&counter_key, floor).await?;
        let code = format_code(&prefix, sequence, self.pad);
        tracing::debug!("配發批號 {} (下限 {})", code, floor);
        Ok(code)
    }

    async fn next(&self, key: &str, floor: u64) -> Result<u64> {
        with_timeout(
            self.timeout,
            "allocate.nextSequence",
            self.store.next_sequence(key, floor),
        )
        .await
    }
}
