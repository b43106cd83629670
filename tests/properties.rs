//! 儲存文件形狀的性質測試

use chrono::Utc;
use mes_core::repository::IMMUTABLE_BATCH_FIELD;
use mes_core::schema::{decode_batch, encode};
use mes_core::{Batch, Document, FieldPatch, Stage};
use proptest::prelude::*;
use serde_json::json;

fn selected_stages() -> impl Strategy<Value = Vec<Stage>> {
    proptest::sample::subsequence(Stage::CANONICAL.to_vec(), 1..=4)
}

fn batch(stages: Vec<Stage>) -> Batch {
    Batch::new(
        "b1".to_string(),
        "P-1".to_string(),
        "Widget".to_string(),
        10,
        stages,
        Utc::now(),
    )
    .with_batch_id("BATCH-MLD-001".to_string())
}

proptest! {
    #[test]
    fn prop_every_stage_key_is_stored(stages in selected_stages()) {
        let data = encode(&batch(stages)).unwrap();

        for stage in Stage::CANONICAL {
            prop_assert!(data["processingStages"].get(stage.as_str()).is_some());
        }
    }

    #[test]
    fn prop_batch_id_survives_any_patch(
        stages in selected_stages(),
        hijack in "[A-Z0-9-]{1,12}",
        nested in any::<bool>(),
    ) {
        let original = batch(stages);
        let path = if nested {
            format!("{}.value", IMMUTABLE_BATCH_FIELD)
        } else {
            IMMUTABLE_BATCH_FIELD.to_string()
        };
        let mut patch = FieldPatch::new()
            .set_value(&path, json!(hijack))
            .set_value("productName", json!("Renamed"));

        prop_assert!(patch.strip_root(IMMUTABLE_BATCH_FIELD));
        let mut data = encode(&original).unwrap();
        patch.apply_to(&mut data).unwrap();
        let decoded = decode_batch(&Document { id: "b1".to_string(), version: 1, data }).unwrap();

        prop_assert_eq!(decoded.batch_id, original.batch_id);
        prop_assert_eq!(decoded.product_name, "Renamed");
    }
}
