//! Widget 批次示例：建立批次、逐站作業、計算損耗

use anyhow::Result;
use mes::logging;
use mes_calc::{StageOutput, WastageCalculator};
use mes_core::{
    BomRow, MemoryStore, MesConfig, Product, ProductRepository, RawMaterial,
    RawMaterialRepository, Stage,
};
use mes_flow::{CreateBatchRequest, MesServices};
use rust_decimal::Decimal;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();
    println!("=== Widget 批次示例 ===\n");

    let store = Arc::new(MemoryStore::new());
    let config = MesConfig::default();

    RawMaterialRepository::new(store.clone(), &config)
        .insert(&RawMaterial::new("steel", "steel", Decimal::from(15), "kg"))
        .await?;
    ProductRepository::new(store.clone(), &config)
        .insert(
            &Product::new(
                "P-WIDGET",
                "Widget",
                vec![Stage::Molding, Stage::Assembling, Stage::Testing],
            )
            .with_bom_row(BomRow::raw("steel", Stage::Molding, Decimal::from(2), "kg")),
        )
        .await?;

    let services = MesServices::new(store.clone(), &config);

    // 庫存 15 kg，需求 20 kg
    match services
        .batches
        .create_batch(CreateBatchRequest::new("P-WIDGET", Stage::Molding, 10))
        .await
    {
        Ok(_) => println!("意外：批次建立成功"),
        Err(e) => println!("建立失敗（預期）：\n{}\n", e),
    }

    let created = services
        .batches
        .create_batch(CreateBatchRequest::new("P-WIDGET", Stage::Molding, 5))
        .await?;
    let id = created.batch.id.clone();
    println!("建立批次 {}（數量 {}）", created.batch.batch_id, created.batch.quantity_to_build);

    let seq = &services.sequencer;
    seq.start_stage(&id, Stage::Molding).await?;
    seq.record_stage_output(
        &id,
        Stage::Molding,
        StageOutput {
            accepted: 4,
            rejected: 1,
            actual_consumption: Decimal::from(9),
            material_consumptions: None,
        },
    )
    .await?;
    seq.complete_stage(&id, Stage::Molding).await?;

    let assembled = seq.complete_stage(&id, Stage::Assembling).await?;
    println!(
        "組裝完工，測試站已開工: {}",
        assembled.batch.stage(Stage::Testing).started_at.is_some()
    );
    seq.start_stage(&id, Stage::Testing).await?;
    let done = seq.complete_stage(&id, Stage::Testing).await?;
    println!("批次狀態: {}\n", done.batch.status);

    let report = WastageCalculator::batch_consumption(&done.batch)?;
    println!("損耗報表:");
    for stage in &report.stages {
        println!(
            "  - {}: 理論投入 {}, 實際耗用 {}, 損耗 {}",
            stage.stage, stage.raw_material_input, stage.actual_consumption, stage.wastage
        );
    }
    println!("  合計損耗: {}\n", report.total_wastage);

    println!("生產建議:");
    for suggestion in services.advisor.suggest().await {
        println!("  - {}（{}）", suggestion.suggestion, suggestion.reasoning);
    }

    Ok(())
}
