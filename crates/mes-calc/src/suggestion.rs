//! 規則式生產建議
//!
//! 外部建議產生器無法使用（或輸出無效）時的確定性備援。
//! 輸出形狀與外部產生器相同：`{suggestion, reasoning, chart}`。

use mes_core::{Batch, BatchStatus, MesConfig, Product, RawMaterial};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::wastage::WastageCalculator;

/// 圖表資料點
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartPoint {
    pub name: String,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
}

/// 圖表
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chart {
    pub title: String,
    pub data: Vec<ChartPoint>,
}

/// 單則建議
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub suggestion: String,
    pub reasoning: String,
    pub chart: Chart,
}

impl Suggestion {
    /// 文字非空且圖表數值皆為有限數
    pub fn is_well_formed(&self) -> bool {
        !self.suggestion.trim().is_empty()
            && !self.reasoning.trim().is_empty()
            && self.chart.data.iter().all(|p| {
                p.value.is_finite() && p.threshold.map_or(true, f64::is_finite)
            })
    }
}

/// 批次摘要（送往外部產生器的精簡格式）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchDigest {
    pub batch_id: String,
    pub product: String,
    pub quantity_to_build: u32,
    pub status: BatchStatus,
    pub accepted: u32,
    pub rejected: u32,
    pub wastage: Decimal,
}

fn batch_wastage(batch: &Batch) -> Decimal {
    match WastageCalculator::batch_consumption(batch) {
        Ok(report) => report.total_wastage,
        Err(e) => {
            tracing::warn!("批次 {} 損耗計算失敗: {}", batch.batch_id, e);
            Decimal::ZERO
        }
    }
}

/// 物料水位摘要
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MaterialLevel {
    pub id: String,
    pub name: String,
    pub quantity: Decimal,
    pub unit: String,
    pub threshold: Decimal,
}

/// 建議輸入快照
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SuggestionSnapshot {
    pub batches: Vec<BatchDigest>,
    pub materials: Vec<MaterialLevel>,
}

impl SuggestionSnapshot {
    pub fn build(
        batches: &[Batch],
        raw_materials: &[RawMaterial],
        products: &[Product],
        default_threshold: Decimal,
    ) -> Self {
        let batches = batches
            .iter()
            .map(|b| {
                let last = b.last_stage().map(|s| b.stage(s));
                BatchDigest {
                    batch_id: b.batch_id.clone(),
                    product: b.product_name.clone(),
                    quantity_to_build: b.quantity_to_build,
                    status: b.status,
                    accepted: last.map_or(0, |r| r.accepted),
                    rejected: last.map_or(0, |r| r.rejected),
                    wastage: batch_wastage(b),
                }
            })
            .collect();

        let materials = raw_materials
            .iter()
            .map(|m| MaterialLevel {
                id: m.id.clone(),
                name: m.name.clone(),
                quantity: m.quantity,
                unit: m.unit.clone(),
                threshold: m.min_stock.unwrap_or(default_threshold),
            })
            .chain(products.iter().map(|p| MaterialLevel {
                id: p.id.clone(),
                name: p.name.clone(),
                quantity: p.quantity,
                unit: p.unit.clone(),
                threshold: p.stock_threshold().unwrap_or(default_threshold),
            }))
            .collect();

        Self { batches, materials }
    }

    /// 序列化為精簡 JSON
    pub fn to_compact_json(&self) -> mes_core::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// 規則式建議
#[derive(Debug, Clone)]
pub struct FallbackRules {
    default_low_stock_threshold: Decimal,
    yield_target_percent: Decimal,
    max_suggestions: usize,
}

impl FallbackRules {
    pub fn from_config(config: &MesConfig) -> Self {
        Self {
            default_low_stock_threshold: config.default_low_stock_threshold,
            yield_target_percent: config.yield_target_percent,
            max_suggestions: config.max_suggestions,
        }
    }

    pub fn default_low_stock_threshold(&self) -> Decimal {
        self.default_low_stock_threshold
    }

    pub fn max_suggestions(&self) -> usize {
        self.max_suggestions.max(1)
    }

    /// 依序套用低庫存、損耗排名、良率規則；皆未觸發時回傳一則概況
    pub fn generate(
        &self,
        batches: &[Batch],
        raw_materials: &[RawMaterial],
        products: &[Product],
    ) -> Vec<Suggestion> {
        let snapshot = SuggestionSnapshot::build(
            batches,
            raw_materials,
            products,
            self.default_low_stock_threshold,
        );

        let mut suggestions: Vec<Suggestion> = [
            self.low_stock(&snapshot),
            self.top_wastage(batches),
            self.production_yield(batches),
        ]
        .into_iter()
        .flatten()
        .collect();

        if suggestions.is_empty() {
            suggestions.push(self.nominal(batches));
        }
        suggestions.truncate(self.max_suggestions());

        tracing::debug!("規則式建議產生 {} 則", suggestions.len());
        suggestions
    }

    fn low_stock(&self, snapshot: &SuggestionSnapshot) -> Option<Suggestion> {
        let mut low: Vec<&MaterialLevel> = snapshot
            .materials
            .iter()
            .filter(|m| m.quantity < m.threshold)
            .collect();
        if low.is_empty() {
            return None;
        }
        low.sort_by(|a, b| a.quantity.cmp(&b.quantity).then_with(|| a.id.cmp(&b.id)));

        let names: Vec<&str> = low.iter().map(|m| m.name.as_str()).collect();
        Some(Suggestion {
            suggestion: format!("補充庫存: {}", names.join("、")),
            reasoning: format!("{} 項物料低於警戒值，可能影響後續批次建立", low.len()),
            chart: Chart {
                title: "低庫存物料".to_string(),
                data: low
                    .iter()
                    .map(|m| ChartPoint {
                        name: m.name.clone(),
                        value: to_f64(m.quantity),
                        threshold: Some(to_f64(m.threshold)),
                    })
                    .collect(),
            },
        })
    }

    fn top_wastage(&self, batches: &[Batch]) -> Option<Suggestion> {
        let ranked = match WastageCalculator::by_product(batches) {
            Ok(ranked) => ranked,
            Err(e) => {
                tracing::warn!("產品損耗彙總失敗，略過損耗規則: {}", e);
                return None;
            }
        };
        let ranked: Vec<_> = ranked
            .into_iter()
            .filter(|p| p.total_wastage > Decimal::ZERO)
            .take(5)
            .collect();
        let worst = ranked.first()?;

        Some(Suggestion {
            suggestion: format!("檢討 {} 的物料損耗", worst.product_name),
            reasoning: format!(
                "{} 在 {} 個批次中累計損耗 {}，為損耗最高的產品",
                worst.product_name,
                worst.batch_count,
                worst.total_wastage.normalize()
            ),
            chart: Chart {
                title: "產品損耗排名".to_string(),
                data: ranked
                    .iter()
                    .map(|p| ChartPoint {
                        name: p.product_name.clone(),
                        value: to_f64(p.total_wastage),
                        threshold: None,
                    })
                    .collect(),
            },
        })
    }

    fn production_yield(&self, batches: &[Batch]) -> Option<Suggestion> {
        let points: Vec<(String, Decimal)> = batches
            .iter()
            .filter(|b| b.status == BatchStatus::Completed && b.quantity_to_build > 0)
            .filter_map(|b| {
                let last = b.last_stage()?;
                let percent = Decimal::from(b.stage(last).accepted) * Decimal::ONE_HUNDRED
                    / Decimal::from(b.quantity_to_build);
                Some((b.batch_id.clone(), percent.round_dp(2)))
            })
            .collect();
        if points.is_empty() {
            return None;
        }

        let average = (points.iter().map(|(_, p)| *p).sum::<Decimal>()
            / Decimal::from(points.len() as u64))
        .round_dp(2);
        if average >= self.yield_target_percent {
            return None;
        }

        let target = to_f64(self.yield_target_percent);
        Some(Suggestion {
            suggestion: "提升完工批次良率".to_string(),
            reasoning: format!(
                "近期完工批次平均良率 {}%，低於目標 {}%",
                average.normalize(),
                self.yield_target_percent.normalize()
            ),
            chart: Chart {
                title: "批次良率".to_string(),
                data: points
                    .into_iter()
                    .map(|(name, percent)| ChartPoint {
                        name,
                        value: to_f64(percent),
                        threshold: Some(target),
                    })
                    .collect(),
            },
        })
    }

    fn nominal(&self, batches: &[Batch]) -> Suggestion {
        let statuses = [
            BatchStatus::Planned,
            BatchStatus::InProgress,
            BatchStatus::OnHold,
            BatchStatus::Completed,
        ];
        Suggestion {
            suggestion: "維持目前生產節奏".to_string(),
            reasoning: "庫存、損耗與良率均在正常範圍".to_string(),
            chart: Chart {
                title: "批次狀態分布".to_string(),
                data: statuses
                    .iter()
                    .map(|status| ChartPoint {
                        name: status.to_string(),
                        value: batches.iter().filter(|b| b.status == *status).count() as f64,
                        threshold: None,
                    })
                    .collect(),
            },
        }
    }
}

fn to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or_default()
}
