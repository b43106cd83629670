//! 站別狀態機
//!
//! 純函式：依目前批次內容計算開工、完工、紀錄產出等操作的結果，
//! 同時產生寫回儲存層用的點號欄位更新。是否自動開工下一站由
//! `TransitionTable` 決定，例外轉換是資料而非程式分支。

use chrono::{DateTime, Utc};
use mes_core::{Batch, BatchStatus, FieldPatch, MesError, Stage};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};

/// 站別轉換表：(前站, 後站) → 前站完工時是否自動開工後站
#[derive(Debug, Clone, Default)]
pub struct TransitionTable {
    rules: HashMap<(Stage, Stage), bool>,
}

impl TransitionTable {
    /// 空表（全部自動開工）
    pub fn new() -> Self {
        Self::default()
    }

    /// 標準轉換表：組裝 → 測試需手動開工
    pub fn standard() -> Self {
        Self::new().with_rule(Stage::Assembling, Stage::Testing, false)
    }

    /// 建構器模式：設置轉換規則
    pub fn with_rule(mut self, from: Stage, to: Stage, auto_advance: bool) -> Self {
        self.rules.insert((from, to), auto_advance);
        self
    }

    /// 前站完工時是否自動開工後站（未列出者預設為是）
    pub fn auto_advance(&self, from: Stage, to: Stage) -> bool {
        self.rules.get(&(from, to)).copied().unwrap_or(true)
    }
}

/// 作業員回報的站別產出
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageOutput {
    pub accepted: u32,
    pub rejected: u32,
    pub actual_consumption: Decimal,
    pub material_consumptions: Option<BTreeMap<String, Decimal>>,
}

/// 狀態機操作結果
#[derive(Debug, Clone)]
pub struct StageTransition {
    /// 操作的站別
    pub stage: Option<Stage>,

    /// 操作後的批次狀態
    pub status: BatchStatus,

    /// 因自動推進而開工的下一站
    pub auto_started: Option<Stage>,

    /// 寫回儲存層的更新（空表示無需寫入）
    pub patch: FieldPatch,

    /// 操作後的批次內容
    pub batch: Batch,
}

impl StageTransition {
    fn unchanged(batch: &Batch, stage: Option<Stage>) -> Self {
        Self {
            stage,
            status: batch.status,
            auto_started: None,
            patch: FieldPatch::new(),
            batch: batch.clone(),
        }
    }

    /// 是否為無變更操作
    pub fn is_noop(&self) -> bool {
        self.patch.is_empty()
    }
}

fn stage_path(stage: Stage, field: &str) -> String {
    format!("processingStages.{}.{}", stage, field)
}

/// 站別狀態機
#[derive(Debug, Clone)]
pub struct StageMachine {
    table: TransitionTable,
}

impl Default for StageMachine {
    fn default() -> Self {
        Self::new(TransitionTable::standard())
    }
}

impl StageMachine {
    pub fn new(table: TransitionTable) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &TransitionTable {
        &self.table
    }

    /// 站別是否可操作
    ///
    /// 需為選用站別且未完工；為第一站，或前站已完工。前站完工但轉換
    /// 不自動開工時，本站必須已經手動開工才可操作。
    pub fn is_actionable(&self, batch: &Batch, stage: Stage) -> bool {
        if !batch.is_selected(stage) || batch.stage(stage).completed {
            return false;
        }
        match batch.previous_stage(stage) {
            None => true,
            Some(prev) => {
                batch.stage(prev).completed
                    && (self.table.auto_advance(prev, stage)
                        || batch.stage(stage).started_at.is_some())
            }
        }
    }

    /// 可操作的站別（依選用順序）
    pub fn actionable_stages(&self, batch: &Batch) -> Vec<Stage> {
        batch
            .selected_processes
            .iter()
            .copied()
            .filter(|s| self.is_actionable(batch, *s))
            .collect()
    }

    fn ensure_selected(batch: &Batch, stage: Stage) -> mes_core::Result<()> {
        if batch.is_selected(stage) {
            Ok(())
        } else {
            Err(MesError::Sequencing(format!(
                "站別 {} 不在批次 {} 的選用站別中",
                stage, batch.batch_id
            )))
        }
    }

    fn ensure_not_on_hold(batch: &Batch) -> mes_core::Result<()> {
        if batch.status == BatchStatus::OnHold {
            Err(MesError::Sequencing(format!(
                "批次 {} 暫停中，需先解除暫停",
                batch.batch_id
            )))
        } else {
            Ok(())
        }
    }

    /// 開工
    ///
    /// 不檢查前站是否完工（手動開工即為組裝 → 測試的放行方式）。
    /// 已開工的站別視為無變更；已完工的站別不可重新開工。
    pub fn start(
        &self,
        batch: &Batch,
        stage: Stage,
        now: DateTime<Utc>,
    ) -> mes_core::Result<StageTransition> {
        Self::ensure_selected(batch, stage)?;
        Self::ensure_not_on_hold(batch)?;

        let record = batch.stage(stage);
        if record.completed {
            return Err(MesError::Sequencing(format!(
                "批次 {} 的站別 {} 已完工，不可重新開工",
                batch.batch_id, stage
            )));
        }
        if record.started_at.is_some() {
            tracing::debug!("批次 {} 站別 {} 已開工，略過", batch.batch_id, stage);
            return Ok(StageTransition::unchanged(batch, Some(stage)));
        }

        let mut next = batch.clone();
        next.processing_stages.get_mut(stage).started_at = Some(now);
        next.status = BatchStatus::InProgress;

        let patch = FieldPatch::new()
            .set(&stage_path(stage, "startedAt"), &now)?
            .set("status", &BatchStatus::InProgress)?;

        Ok(StageTransition {
            stage: Some(stage),
            status: next.status,
            auto_started: None,
            patch,
            batch: next,
        })
    }

    /// 完工
    ///
    /// 前序選用站別必須全部完工。最後一站完工時批次完成；否則依轉換表
    /// 決定是否自動開工下一站。已完工的站別視為無變更。
    pub fn complete(
        &self,
        batch: &Batch,
        stage: Stage,
        now: DateTime<Utc>,
    ) -> mes_core::Result<StageTransition> {
        Self::ensure_selected(batch, stage)?;
        Self::ensure_not_on_hold(batch)?;

        if batch.stage(stage).completed {
            tracing::debug!("批次 {} 站別 {} 已完工，略過", batch.batch_id, stage);
            return Ok(StageTransition::unchanged(batch, Some(stage)));
        }
        if !batch.predecessors_completed(stage) {
            let pending: Vec<&str> = batch
                .selected_processes
                .iter()
                .take_while(|s| **s != stage)
                .filter(|s| !batch.stage(**s).completed)
                .map(|s| s.as_str())
                .collect();
            return Err(MesError::Sequencing(format!(
                "批次 {} 的站別 {} 前序站別未完工: {}",
                batch.batch_id,
                stage,
                pending.join(", ")
            )));
        }

        let mut next = batch.clone();
        let mut patch = FieldPatch::new()
            .set(&stage_path(stage, "completed"), &true)?
            .set(&stage_path(stage, "finishedAt"), &now)?;
        {
            let record = next.processing_stages.get_mut(stage);
            record.completed = true;
            record.finished_at = Some(now);
            if record.started_at.is_none() {
                record.started_at = Some(now);
                patch = patch.set(&stage_path(stage, "startedAt"), &now)?;
            }
        }

        let mut auto_started = None;
        match batch.next_stage(stage) {
            None => next.status = BatchStatus::Completed,
            Some(following) => {
                next.status = BatchStatus::InProgress;
                let idle = next.stage(following).started_at.is_none();
                if self.table.auto_advance(stage, following) && idle {
                    next.processing_stages.get_mut(following).started_at = Some(now);
                    patch = patch.set(&stage_path(following, "startedAt"), &now)?;
                    auto_started = Some(following);
                }
            }
        }
        patch = patch.set("status", &next.status)?;

        Ok(StageTransition {
            stage: Some(stage),
            status: next.status,
            auto_started,
            patch,
            batch: next,
        })
    }

    /// 紀錄站別產出
    pub fn record_output(
        &self,
        batch: &Batch,
        stage: Stage,
        output: &StageOutput,
    ) -> mes_core::Result<StageTransition> {
        Self::ensure_selected(batch, stage)?;

        if output.actual_consumption < Decimal::ZERO {
            return Err(MesError::Validation(format!(
                "站別 {} 的實際耗用不可為負數: {}",
                stage, output.actual_consumption
            )));
        }
        if let Some(breakdown) = &output.material_consumptions {
            for (material_id, amount) in breakdown {
                if *amount < Decimal::ZERO {
                    return Err(MesError::Validation(format!(
                        "物料 {} 的耗用不可為負數: {}",
                        material_id, amount
                    )));
                }
                if !batch.materials_for(stage).any(|m| &m.material_id == material_id) {
                    return Err(MesError::Validation(format!(
                        "物料 {} 不屬於批次 {} 的站別 {}",
                        material_id, batch.batch_id, stage
                    )));
                }
            }
        }

        let mut next = batch.clone();
        {
            let record = next.processing_stages.get_mut(stage);
            record.accepted = output.accepted;
            record.rejected = output.rejected;
            record.actual_consumption = output.actual_consumption;
            record.material_consumptions = output.material_consumptions.clone();
        }

        let patch = FieldPatch::new()
            .set(&stage_path(stage, "accepted"), &output.accepted)?
            .set(&stage_path(stage, "rejected"), &output.rejected)?
            .set(&stage_path(stage, "actualConsumption"), &output.actual_consumption)?
            .set(
                &stage_path(stage, "materialConsumptions"),
                &output.material_consumptions,
            )?;

        Ok(StageTransition {
            stage: Some(stage),
            status: next.status,
            auto_started: None,
            patch,
            batch: next,
        })
    }

    /// 暫停批次
    pub fn hold(&self, batch: &Batch) -> mes_core::Result<StageTransition> {
        match batch.status {
            BatchStatus::OnHold => Ok(StageTransition::unchanged(batch, None)),
            BatchStatus::Completed => Err(MesError::Sequencing(format!(
                "批次 {} 已完成，不可暫停",
                batch.batch_id
            ))),
            _ => Self::with_status(batch, BatchStatus::OnHold),
        }
    }

    /// 解除暫停，狀態依站別紀錄重新推導
    pub fn release(&self, batch: &Batch) -> mes_core::Result<StageTransition> {
        if batch.status != BatchStatus::OnHold {
            return Ok(StageTransition::unchanged(batch, None));
        }
        Self::with_status(batch, batch.derived_status())
    }

    fn with_status(batch: &Batch, status: BatchStatus) -> mes_core::Result<StageTransition> {
        let mut next = batch.clone();
        next.status = status;
        Ok(StageTransition {
            stage: None,
            status,
            auto_started: None,
            patch: FieldPatch::new().set("status", &status)?,
            batch: next,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mes_core::{ErrorKind, MaterialSnapshot, MaterialSource};
    use proptest::prelude::*;
    use rstest::rstest;

    fn batch(stages: Vec<Stage>) -> Batch {
        Batch::new(
            "b1".to_string(),
            "P-1".to_string(),
            "Widget".to_string(),
            10,
            stages,
            Utc::now(),
        )
    }

    fn full_batch() -> Batch {
        batch(Stage::CANONICAL.to_vec())
    }

    #[test]
    fn test_first_stage_is_actionable() {
        let machine = StageMachine::default();
        let batch = full_batch();

        assert_eq!(machine.actionable_stages(&batch), vec![Stage::Molding]);
    }

    #[test]
    fn test_completing_molding_auto_starts_machining() {
        let machine = StageMachine::default();
        let now = Utc::now();
        let result = machine.complete(&full_batch(), Stage::Molding, now).unwrap();

        assert_eq!(result.auto_started, Some(Stage::Machining));
        assert_eq!(result.batch.stage(Stage::Machining).started_at, Some(now));
        assert_eq!(result.status, BatchStatus::InProgress);
        assert!(result
            .patch
            .get("processingStages.Machining.startedAt")
            .is_some());
    }

    #[test]
    fn test_completing_assembling_does_not_start_testing() {
        let machine = StageMachine::default();
        let now = Utc::now();
        let mut batch = full_batch();
        for stage in [Stage::Molding, Stage::Machining] {
            batch = machine.complete(&batch, stage, now).unwrap().batch;
        }

        let result = machine.complete(&batch, Stage::Assembling, now).unwrap();

        assert_eq!(result.auto_started, None);
        assert_eq!(result.batch.stage(Stage::Testing).started_at, None);
        assert!(result.patch.get("processingStages.Testing.startedAt").is_none());
        assert!(!machine.is_actionable(&result.batch, Stage::Testing));

        let started = machine.start(&result.batch, Stage::Testing, now).unwrap();
        assert!(machine.is_actionable(&started.batch, Stage::Testing));
    }

    #[test]
    fn test_completing_last_stage_completes_batch() {
        let machine = StageMachine::default();
        let now = Utc::now();
        let mut batch = batch(vec![Stage::Molding, Stage::Testing]);

        batch = machine.complete(&batch, Stage::Molding, now).unwrap().batch;
        let result = machine.complete(&batch, Stage::Testing, now).unwrap();

        assert_eq!(result.status, BatchStatus::Completed);
        assert_eq!(result.batch.derived_status(), BatchStatus::Completed);
        assert_eq!(*result.patch.get("status").unwrap(), "Completed");
    }

    #[test]
    fn test_complete_out_of_order_is_rejected() {
        let machine = StageMachine::default();
        let err = machine
            .complete(&full_batch(), Stage::Assembling, Utc::now())
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Sequencing);
    }

    #[rstest]
    #[case(Stage::Machining)]
    #[case(Stage::Assembling)]
    fn test_unselected_stage_is_rejected(#[case] stage: Stage) {
        let machine = StageMachine::default();
        let batch = batch(vec![Stage::Molding, Stage::Testing]);

        assert!(machine.start(&batch, stage, Utc::now()).is_err());
        assert!(machine.complete(&batch, stage, Utc::now()).is_err());
        assert!(!machine.is_actionable(&batch, stage));
    }

    #[test]
    fn test_start_ignores_predecessors_and_sets_in_progress() {
        let machine = StageMachine::default();
        let result = machine
            .start(&full_batch(), Stage::Testing, Utc::now())
            .unwrap();

        assert_eq!(result.status, BatchStatus::InProgress);
        assert!(result.batch.stage(Stage::Testing).started_at.is_some());
    }

    #[test]
    fn test_repeated_operations_are_idempotent() {
        let machine = StageMachine::default();
        let now = Utc::now();
        let started = machine.start(&full_batch(), Stage::Molding, now).unwrap().batch;

        let again = machine.start(&started, Stage::Molding, Utc::now()).unwrap();
        assert!(again.is_noop());
        assert_eq!(again.batch.stage(Stage::Molding).started_at, Some(now));

        let completed = machine.complete(&started, Stage::Molding, now).unwrap().batch;
        let again = machine.complete(&completed, Stage::Molding, Utc::now()).unwrap();
        assert!(again.is_noop());
        assert_eq!(again.batch.stage(Stage::Molding).finished_at, Some(now));

        assert!(machine.start(&completed, Stage::Molding, now).is_err());
    }

    #[test]
    fn test_custom_transition_table() {
        let machine = StageMachine::new(
            TransitionTable::standard().with_rule(Stage::Molding, Stage::Machining, false),
        );
        let result = machine
            .complete(&full_batch(), Stage::Molding, Utc::now())
            .unwrap();

        assert_eq!(result.auto_started, None);
        assert!(!machine.is_actionable(&result.batch, Stage::Machining));
    }

    #[test]
    fn test_hold_and_release() {
        let machine = StageMachine::default();
        let started = machine
            .start(&full_batch(), Stage::Molding, Utc::now())
            .unwrap()
            .batch;

        let held = machine.hold(&started).unwrap().batch;
        assert_eq!(held.status, BatchStatus::OnHold);
        assert!(machine.complete(&held, Stage::Molding, Utc::now()).is_err());

        let released = machine.release(&held).unwrap();
        assert_eq!(released.status, BatchStatus::InProgress);
        assert!(machine.release(&released.batch).unwrap().is_noop());
    }

    #[test]
    fn test_record_output_validates_breakdown() {
        let machine = StageMachine::default();
        let batch = full_batch().with_materials(vec![MaterialSnapshot {
            material_id: "steel".to_string(),
            name: "steel".to_string(),
            quantity: Decimal::from(20),
            unit: "kg".to_string(),
            stage: Stage::Molding,
            source: MaterialSource::Raw,
        }]);

        let ok = StageOutput {
            accepted: 8,
            rejected: 2,
            actual_consumption: Decimal::from(18),
            material_consumptions: Some(BTreeMap::from([("steel".to_string(), Decimal::from(18))])),
        };
        let result = machine.record_output(&batch, Stage::Molding, &ok).unwrap();
        assert_eq!(result.batch.stage(Stage::Molding).accepted, 8);
        assert_eq!(result.patch.len(), 4);

        let foreign = StageOutput {
            material_consumptions: Some(BTreeMap::from([("paint".to_string(), Decimal::ONE)])),
            ..ok.clone()
        };
        assert!(machine.record_output(&batch, Stage::Molding, &foreign).is_err());

        let negative = StageOutput {
            actual_consumption: Decimal::from(-1),
            material_consumptions: None,
            ..ok
        };
        assert!(machine.record_output(&batch, Stage::Molding, &negative).is_err());
    }

    fn selected_stages() -> impl Strategy<Value = Vec<Stage>> {
        proptest::sample::subsequence(Stage::CANONICAL.to_vec(), 1..=4)
    }

    proptest! {
        #[test]
        fn prop_completion_requires_predecessors(
            stages in selected_stages(),
            completed_prefix in 0usize..4,
            target in 0usize..4,
        ) {
            let machine = StageMachine::default();
            let now = Utc::now();
            let mut batch = batch(stages.clone());
            let prefix = completed_prefix.min(stages.len());
            for stage in &stages[..prefix] {
                batch = machine.complete(&batch, *stage, now).unwrap().batch;
            }

            let target = stages[target % stages.len()];
            let result = machine.complete(&batch, target, now);
            let position = batch.position(target).unwrap();

            if position <= prefix {
                prop_assert!(result.is_ok());
                let after = result.unwrap().batch;
                prop_assert!(after.validate().is_ok());
            } else {
                prop_assert!(result.is_err());
            }
        }

        #[test]
        fn prop_actionable_stage_is_unique(
            stages in selected_stages(),
            completed_prefix in 0usize..4,
        ) {
            let machine = StageMachine::default();
            let now = Utc::now();
            let mut batch = batch(stages.clone());
            for stage in stages.iter().take(completed_prefix) {
                batch = machine.complete(&batch, *stage, now).unwrap().batch;
            }

            prop_assert!(machine.actionable_stages(&batch).len() <= 1);
        }
    }
}
