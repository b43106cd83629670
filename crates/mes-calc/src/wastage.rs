//! 耗用與損耗計算
//!
//! 以批次建立時的物料快照與各站別紀錄為輸入的純函式，
//! 重複計算結果相同，不產生任何副作用。

use mes_core::{Batch, MesError, Result, Stage};
use rayon::prelude::*;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;

/// 單一物料的耗用結果
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MaterialConsumption {
    pub material_id: String,
    pub name: String,
    pub unit: String,

    /// 計劃用量（快照）
    pub planned_quantity: Decimal,

    /// 理論投入 = 良品數 × 單位用量
    pub raw_material_input: Decimal,

    /// 實際耗用
    pub actual_consumption: Decimal,

    /// 損耗（不為負，兩位小數）
    pub wastage: Decimal,
}

/// 單一站別的耗用結果
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageConsumption {
    pub stage: Stage,
    pub accepted: u32,
    pub rejected: u32,

    /// 站別理論投入
    pub raw_material_input: Decimal,

    /// 站別實際耗用（作業員回報總量）
    pub actual_consumption: Decimal,

    /// 站別損耗 = 各物料損耗加總
    pub wastage: Decimal,

    /// 無法歸屬到快照物料的耗用
    pub unallocated_consumption: Decimal,

    pub materials: Vec<MaterialConsumption>,
}

/// 批次耗用結果
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchConsumption {
    pub batch_id: String,
    pub product_ref: String,
    pub product_name: String,
    pub stages: Vec<StageConsumption>,
    pub total_wastage: Decimal,
}

/// 產品別損耗彙總
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductWastage {
    pub product_ref: String,
    pub product_name: String,
    pub batch_count: usize,
    pub total_wastage: Decimal,
}

/// 損耗計算器
pub struct WastageCalculator;

impl WastageCalculator {
    /// 損耗 = max(0, 實際 − 理論)，四捨五入至兩位小數
    pub fn wastage(actual_consumption: Decimal, raw_material_input: Decimal) -> Decimal {
        actual_consumption
            .saturating_sub(raw_material_input)
            .max(Decimal::ZERO)
            .round_dp(2)
    }

    /// 物料單位用量（建造數量為 0 時視為 0）
    fn per_unit(batch: &Batch, quantity: Decimal) -> Decimal {
        if batch.quantity_to_build == 0 {
            Decimal::ZERO
        } else {
            quantity / Decimal::from(batch.quantity_to_build)
        }
    }

    /// 站別理論投入 = 良品數 × Σ(物料計劃用量 / 建造數量)
    pub fn raw_material_input(batch: &Batch, stage: Stage) -> Result<Decimal> {
        let per_unit = checked_sum(
            batch.materials_for(stage).map(|m| Self::per_unit(batch, m.quantity)),
            "單位用量",
        )?;
        checked_mul(Decimal::from(batch.stage(stage).accepted), per_unit, "理論投入")
    }

    /// 計算單一站別的耗用與損耗
    ///
    /// 有逐物料耗用時以其為準（未列出的物料視為 0），同一物料出現多列時
    /// 依各列計劃用量分攤該物料的耗用；否則將站別總耗用依各物料計劃用量
    /// 佔比分攤，計劃用量全為 0 時平均分攤。數值溢位時回傳 `Validation`。
    pub fn stage_consumption(batch: &Batch, stage: Stage) -> Result<StageConsumption> {
        let record = batch.stage(stage);
        let accepted = Decimal::from(record.accepted);
        let stage_materials: Vec<_> = batch.materials_for(stage).collect();
        let planned_total = checked_sum(stage_materials.iter().map(|m| m.quantity), "計劃用量")?;
        let material_count = Decimal::from(stage_materials.len() as u64);

        // 同一物料各列的計劃用量合計與列數
        let mut per_material: HashMap<&str, (Decimal, u64)> = HashMap::new();
        for m in &stage_materials {
            let entry = per_material
                .entry(m.material_id.as_str())
                .or_insert((Decimal::ZERO, 0));
            entry.0 = checked_add(entry.0, m.quantity, "計劃用量")?;
            entry.1 += 1;
        }

        let mut materials = Vec::with_capacity(stage_materials.len());
        for m in &stage_materials {
            let raw_material_input =
                checked_mul(accepted, Self::per_unit(batch, m.quantity), "理論投入")?;
            let actual_consumption = match &record.material_consumptions {
                Some(breakdown) => {
                    let amount = breakdown
                        .get(&m.material_id)
                        .copied()
                        .unwrap_or(Decimal::ZERO);
                    match per_material.get(m.material_id.as_str()) {
                        Some((same_total, _)) if *same_total > Decimal::ZERO => {
                            amount * (m.quantity / *same_total)
                        }
                        Some((_, rows)) if *rows > 1 => amount / Decimal::from(*rows),
                        _ => amount,
                    }
                }
                None if planned_total > Decimal::ZERO => {
                    record.actual_consumption * (m.quantity / planned_total)
                }
                None => record.actual_consumption / material_count,
            };
            materials.push(MaterialConsumption {
                material_id: m.material_id.clone(),
                name: m.name.clone(),
                unit: m.unit.clone(),
                planned_quantity: m.quantity,
                raw_material_input,
                actual_consumption,
                wastage: Self::wastage(actual_consumption, raw_material_input),
            });
        }

        let unallocated_consumption = match &record.material_consumptions {
            _ if materials.is_empty() => record.actual_consumption,
            Some(breakdown) => checked_sum(
                breakdown
                    .iter()
                    .filter(|(id, _)| !per_material.contains_key(id.as_str()))
                    .map(|(_, amount)| *amount),
                "未歸屬耗用",
            )?,
            None => Decimal::ZERO,
        };

        Ok(StageConsumption {
            stage,
            accepted: record.accepted,
            rejected: record.rejected,
            raw_material_input: checked_sum(
                materials.iter().map(|m| m.raw_material_input),
                "理論投入",
            )?,
            actual_consumption: record.actual_consumption,
            wastage: checked_sum(materials.iter().map(|m| m.wastage), "損耗")?,
            unallocated_consumption,
            materials,
        })
    }

    /// 計算批次所有選用站別的耗用
    pub fn batch_consumption(batch: &Batch) -> Result<BatchConsumption> {
        let stages = batch
            .selected_processes
            .iter()
            .map(|s| Self::stage_consumption(batch, *s))
            .collect::<Result<Vec<_>>>()?;
        let total_wastage = checked_sum(stages.iter().map(|s| s.wastage), "損耗")?;

        Ok(BatchConsumption {
            batch_id: batch.batch_id.clone(),
            product_ref: batch.product_ref.clone(),
            product_name: batch.product_name.clone(),
            stages,
            total_wastage,
        })
    }

    /// 依產品彙總損耗，由高至低排序
    pub fn by_product(batches: &[Batch]) -> Result<Vec<ProductWastage>> {
        let totals: HashMap<String, ProductWastage> = batches
            .par_iter()
            .map(|b| -> Result<ProductWastage> {
                let consumption = Self::batch_consumption(b)?;
                Ok(ProductWastage {
                    product_ref: b.product_ref.clone(),
                    product_name: b.product_name.clone(),
                    batch_count: 1,
                    total_wastage: consumption.total_wastage,
                })
            })
            .try_fold(HashMap::new, |mut acc, item| {
                merge_product_wastage(&mut acc, item?)?;
                Ok::<_, MesError>(acc)
            })
            .try_reduce(HashMap::new, |mut left, right| {
                for item in right.into_values() {
                    merge_product_wastage(&mut left, item)?;
                }
                Ok(left)
            })?;

        let mut ranked: Vec<ProductWastage> = totals.into_values().collect();
        ranked.sort_by(|a, b| {
            b.total_wastage
                .cmp(&a.total_wastage)
                .then_with(|| a.product_ref.cmp(&b.product_ref))
        });

        tracing::debug!("產品損耗彙總：批次 {} 筆，產品 {} 項", batches.len(), ranked.len());
        Ok(ranked)
    }
}

fn merge_product_wastage(
    acc: &mut HashMap<String, ProductWastage>,
    item: ProductWastage,
) -> Result<()> {
    match acc.get_mut(&item.product_ref) {
        Some(existing) => {
            existing.batch_count += item.batch_count;
            existing.total_wastage =
                checked_add(existing.total_wastage, item.total_wastage, "產品損耗")?;
        }
        None => {
            acc.insert(item.product_ref.clone(), item);
        }
    }
    Ok(())
}

fn overflow(what: &str) -> MesError {
    MesError::Validation(format!("{what}數值溢位"))
}

fn checked_add(left: Decimal, right: Decimal, what: &str) -> Result<Decimal> {
    left.checked_add(right).ok_or_else(|| overflow(what))
}

fn checked_mul(left: Decimal, right: Decimal, what: &str) -> Result<Decimal> {
    left.checked_mul(right).ok_or_else(|| overflow(what))
}

fn checked_sum(values: impl IntoIterator<Item = Decimal>, what: &str) -> Result<Decimal> {
    values
        .into_iter()
        .try_fold(Decimal::ZERO, |acc, value| checked_add(acc, value, what))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mes_core::{MaterialSnapshot, MaterialSource};
    use proptest::prelude::*;
    use rstest::rstest;
    use std::collections::BTreeMap;

    fn material(id: &str, quantity: i64, stage: Stage) -> MaterialSnapshot {
        MaterialSnapshot {
            material_id: id.to_string(),
            name: id.to_string(),
            quantity: Decimal::from(quantity),
            unit: "kg".to_string(),
            stage,
            source: MaterialSource::Raw,
        }
    }

    fn molding_batch(accepted: u32, actual: Decimal) -> Batch {
        let mut batch = Batch::new(
            "b1".to_string(),
            "P-1".to_string(),
            "Widget".to_string(),
            10,
            vec![Stage::Molding],
            Utc::now(),
        )
        .with_materials(vec![material("steel", 20, Stage::Molding)]);
        batch.processing_stages.molding.accepted = accepted;
        batch.processing_stages.molding.actual_consumption = actual;
        batch
    }

    #[rstest]
    #[case(18, "2.00")]
    #[case(14, "0")]
    #[case(16, "0")]
    fn test_molding_scenarios(#[case] actual: i64, #[case] expected: &str) {
        let batch = molding_batch(8, Decimal::from(actual));
        let stage = WastageCalculator::stage_consumption(&batch, Stage::Molding).unwrap();

        assert_eq!(stage.raw_material_input, Decimal::from(16));
        assert_eq!(
            WastageCalculator::raw_material_input(&batch, Stage::Molding).unwrap(),
            Decimal::from(16)
        );
        assert_eq!(stage.materials[0].wastage, expected.parse::<Decimal>().unwrap());
        assert_eq!(stage.wastage, expected.parse::<Decimal>().unwrap());
    }

    #[test]
    fn test_proportional_distribution() {
        let mut batch = Batch::new(
            "b1".to_string(),
            "P-1".to_string(),
            "Widget".to_string(),
            10,
            vec![Stage::Molding],
            Utc::now(),
        )
        .with_materials(vec![
            material("steel", 30, Stage::Molding),
            material("resin", 10, Stage::Molding),
        ]);
        batch.processing_stages.molding.accepted = 10;
        batch.processing_stages.molding.actual_consumption = Decimal::from(48);

        let stage = WastageCalculator::stage_consumption(&batch, Stage::Molding).unwrap();

        // 分攤比例 3:1 → 36 與 12；理論投入 30 與 10
        assert_eq!(stage.materials[0].actual_consumption, Decimal::from(36));
        assert_eq!(stage.materials[1].actual_consumption, Decimal::from(12));
        assert_eq!(stage.materials[0].wastage, Decimal::from(6));
        assert_eq!(stage.materials[1].wastage, Decimal::from(2));
        assert_eq!(stage.wastage, Decimal::from(8));
    }

    #[test]
    fn test_breakdown_is_authoritative() {
        let mut batch = Batch::new(
            "b1".to_string(),
            "P-1".to_string(),
            "Widget".to_string(),
            10,
            vec![Stage::Molding],
            Utc::now(),
        )
        .with_materials(vec![
            material("steel", 30, Stage::Molding),
            material("resin", 10, Stage::Molding),
        ]);
        let record = &mut batch.processing_stages.molding;
        record.accepted = 10;
        record.actual_consumption = Decimal::from(48);
        record.material_consumptions = Some(BTreeMap::from([
            ("steel".to_string(), Decimal::from(29)),
            ("resin".to_string(), Decimal::from(19)),
        ]));

        let stage = WastageCalculator::stage_consumption(&batch, Stage::Molding).unwrap();

        assert_eq!(stage.materials[0].wastage, Decimal::ZERO);
        assert_eq!(stage.materials[1].wastage, Decimal::from(9));
        assert_eq!(stage.unallocated_consumption, Decimal::ZERO);
    }

    #[test]
    fn test_stage_without_materials_reports_unallocated() {
        let mut batch = molding_batch(8, Decimal::from(18));
        batch.selected_processes = vec![Stage::Molding, Stage::Testing];
        batch.processing_stages.testing.actual_consumption = Decimal::from(3);

        let report = WastageCalculator::batch_consumption(&batch).unwrap();

        assert_eq!(report.stages.len(), 2);
        assert_eq!(report.stages[1].unallocated_consumption, Decimal::from(3));
        assert_eq!(report.stages[1].wastage, Decimal::ZERO);
        assert_eq!(report.total_wastage, "2.00".parse::<Decimal>().unwrap());
    }

    #[test]
    fn test_zero_quantity_to_build_has_no_input() {
        let mut batch = molding_batch(8, Decimal::from(5));
        batch.quantity_to_build = 0;

        let stage = WastageCalculator::stage_consumption(&batch, Stage::Molding).unwrap();
        assert_eq!(stage.raw_material_input, Decimal::ZERO);
        assert_eq!(stage.wastage, Decimal::from(5));
    }

    #[test]
    fn test_by_product_ranking() {
        let mut other = molding_batch(8, Decimal::from(30));
        other.product_ref = "P-2".to_string();
        other.product_name = "Gadget".to_string();
        let batches = vec![
            molding_batch(8, Decimal::from(18)),
            molding_batch(8, Decimal::from(19)),
            other,
        ];

        let ranked = WastageCalculator::by_product(&batches).unwrap();

        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].product_ref, "P-2");
        assert_eq!(ranked[0].total_wastage, Decimal::from(14));
        assert_eq!(ranked[1].batch_count, 2);
        assert_eq!(ranked[1].total_wastage, Decimal::from(5));
    }

    #[test]
    fn test_calculation_is_repeatable() {
        let batch = molding_batch(7, Decimal::from(21));

        assert_eq!(
            WastageCalculator::batch_consumption(&batch).unwrap(),
            WastageCalculator::batch_consumption(&batch).unwrap()
        );
    }

    #[test]
    fn test_breakdown_is_split_across_duplicate_rows() {
        let mut batch = Batch::new(
            "b1".to_string(),
            "P-1".to_string(),
            "Widget".to_string(),
            10,
            vec![Stage::Molding],
            Utc::now(),
        )
        .with_materials(vec![
            material("steel", 10, Stage::Molding),
            material("steel", 10, Stage::Molding),
        ]);
        let record = &mut batch.processing_stages.molding;
        record.accepted = 8;
        record.actual_consumption = Decimal::from(18);

        let proportional = WastageCalculator::stage_consumption(&batch, Stage::Molding).unwrap();

        batch.processing_stages.molding.material_consumptions =
            Some(BTreeMap::from([("steel".to_string(), Decimal::from(18))]));
        let breakdown = WastageCalculator::stage_consumption(&batch, Stage::Molding).unwrap();

        // 理論投入 8 + 8，實際 9 + 9
        assert_eq!(breakdown.materials[0].actual_consumption, Decimal::from(9));
        assert_eq!(breakdown.materials[1].actual_consumption, Decimal::from(9));
        assert_eq!(breakdown.wastage, Decimal::from(2));
        assert_eq!(breakdown.wastage, proportional.wastage);
        assert_eq!(breakdown.unallocated_consumption, Decimal::ZERO);
    }

    #[test]
    fn test_overflow_is_validation_error() {
        let mut batch = molding_batch(u32::MAX, Decimal::from(18));
        batch.quantity_to_build = 1;
        batch.materials[0].quantity = Decimal::MAX;

        let err = WastageCalculator::stage_consumption(&batch, Stage::Molding).unwrap_err();
        assert!(matches!(err, MesError::Validation(_)));
        assert!(WastageCalculator::by_product(&[batch]).is_err());
    }

    proptest! {
        #[test]
        fn prop_wastage_is_never_negative(
            accepted in 0u32..10_000,
            quantity_to_build in 0u32..10_000,
            planned in 0i64..100_000,
            actual in 0i64..100_000,
        ) {
            let mut batch = molding_batch(accepted, Decimal::new(actual, 2));
            batch.quantity_to_build = quantity_to_build;
            batch.materials[0].quantity = Decimal::new(planned, 1);

            let stage = WastageCalculator::stage_consumption(&batch, Stage::Molding).unwrap();
            prop_assert!(stage.wastage >= Decimal::ZERO);
            for material in &stage.materials {
                prop_assert!(material.wastage >= Decimal::ZERO);
            }
        }
    }
}
