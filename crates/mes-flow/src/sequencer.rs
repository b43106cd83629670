//! 站別作業服務
//!
//! 每個操作都是一次完整的讀取-計算-寫入：載入批次、交由狀態機計算、
//! 以載入時的版本號寫回。版本衝突或逾時時整段重新執行，因此並行的
//! 完工請求不會互相覆蓋，重複的請求也只會寫入一次。

use chrono::Utc;
use futures::stream::{BoxStream, StreamExt};
use mes_calc::{StageMachine, StageOutput, StageTransition};
use mes_core::{Batch, BatchRepository, Filter, LoadedBatch, MesConfig, Result, Stage};

use crate::retry::{retry_on_conflict, RetryPolicy};

/// 站別作業服務
#[derive(Clone)]
pub struct StageSequencer {
    repo: BatchRepository,
    machine: StageMachine,
    retry: RetryPolicy,
}

impl StageSequencer {
    pub fn new(repo: BatchRepository, config: &MesConfig) -> Self {
        Self {
            repo,
            machine: StageMachine::default(),
            retry: RetryPolicy::from_config(config),
        }
    }

    /// 建構器模式：替換狀態機（自訂轉換表）
    pub fn with_machine(mut self, machine: StageMachine) -> Self {
        self.machine = machine;
        self
    }

    /// 建構器模式：替換重試策略
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn machine(&self) -> &StageMachine {
        &self.machine
    }

    /// 開工
    pub async fn start_stage(&self, batch_id: &str, stage: Stage) -> Result<StageTransition> {
        let transition = retry_on_conflict(self.retry, "startStage", move || {
            self.start_once(batch_id, stage)
        })
        .await?;
        if !transition.is_noop() {
            tracing::info!("批次 {} 站別 {} 開工", transition.batch.batch_id, stage);
        }
        Ok(transition)
    }

    async fn start_once(&self, batch_id: &str, stage: Stage) -> Result<StageTransition> {
        let loaded = self.repo.load(batch_id).await?;
        let transition = self.machine.start(&loaded.batch, stage, Utc::now())?;
        self.commit(&loaded, transition).await
    }

    /// 完工
    pub async fn complete_stage(&self, batch_id: &str, stage: Stage) -> Result<StageTransition> {
        let transition = retry_on_conflict(self.retry, "completeStage", move || {
            self.complete_once(batch_id, stage)
        })
        .await?;
        if !transition.is_noop() {
            tracing::info!(
                "批次 {} 站別 {} 完工，批次狀態 {}{}",
                transition.batch.batch_id,
                stage,
                transition.status,
                transition
                    .auto_started
                    .map(|s| format!("，自動開工 {}", s))
                    .unwrap_or_default()
            );
        }
        Ok(transition)
    }

    async fn complete_once(&self, batch_id: &str, stage: Stage) -> Result<StageTransition> {
        let loaded = self.repo.load(batch_id).await?;
        let transition = self.machine.complete(&loaded.batch, stage, Utc::now())?;
        self.commit(&loaded, transition).await
    }

    /// 紀錄站別產出（良品、不良品、實際耗用）
    pub async fn record_stage_output(
        &self,
        batch_id: &str,
        stage: Stage,
        output: StageOutput,
    ) -> Result<StageTransition> {
        let output = &output;
        let transition = retry_on_conflict(self.retry, "recordStageOutput", move || {
            self.record_once(batch_id, stage, output)
        })
        .await?;
        tracing::info!(
            "批次 {} 站別 {} 紀錄產出：良品 {}，不良 {}，耗用 {}",
            transition.batch.batch_id,
            stage,
            output.accepted,
            output.rejected,
            output.actual_consumption
        );
        Ok(transition)
    }

    async fn record_once(
        &self,
        batch_id: &str,
        stage: Stage,
        output: &StageOutput,
    ) -> Result<StageTransition> {
        let loaded = self.repo.load(batch_id).await?;
        let transition = self.machine.record_output(&loaded.batch, stage, output)?;
        self.commit(&loaded, transition).await
    }

    /// 暫停批次
    pub async fn hold_batch(&self, batch_id: &str) -> Result<StageTransition> {
        let transition = retry_on_conflict(self.retry, "holdBatch", move || async move {
            let loaded = self.repo.load(batch_id).await?;
            let transition = self.machine.hold(&loaded.batch)?;
            self.commit(&loaded, transition).await
        })
        .await?;
        tracing::info!("批次 {} 暫停", transition.batch.batch_id);
        Ok(transition)
    }

    /// 解除暫停
    pub async fn release_batch(&self, batch_id: &str) -> Result<StageTransition> {
        let transition = retry_on_conflict(self.retry, "releaseBatch", move || async move {
            let loaded = self.repo.load(batch_id).await?;
            let transition = self.machine.release(&loaded.batch)?;
            self.commit(&loaded, transition).await
        })
        .await?;
        tracing::info!(
            "批次 {} 解除暫停，狀態 {}",
            transition.batch.batch_id,
            transition.status
        );
        Ok(transition)
    }

    /// 指定站別目前可操作的批次
    pub async fn actionable_batches(&self, stage: Stage) -> Result<Vec<Batch>> {
        let batches = self.repo.list(&Filter::All).await?;
        Ok(batches
            .into_iter()
            .filter(|b| self.machine.is_actionable(b, stage))
            .collect())
    }

    /// 監看指定站別可操作的批次
    pub fn watch_actionable(&self, stage: Stage) -> BoxStream<'static, Vec<Batch>> {
        let machine = self.machine.clone();
        self.repo
            .watch(Filter::All)
            .map(move |batches| {
                batches
                    .into_iter()
                    .filter(|b| machine.is_actionable(b, stage))
                    .collect()
            })
            .boxed()
    }

    async fn commit(
        &self,
        loaded: &LoadedBatch,
        mut transition: StageTransition,
    ) -> Result<StageTransition> {
        if transition.is_noop() {
            return Ok(transition);
        }
        let saved = self.repo.apply(loaded, transition.patch.clone()).await?;
        transition.batch = saved.batch;
        Ok(transition)
    }
}
