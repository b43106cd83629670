//! 建議快取指紋

use mes_core::{Batch, Product, RawMaterial};
use sha2::{Digest, Sha256};

/// 由近期批次ID與物料數量計算指紋
///
/// 輸入順序不影響結果。
pub fn fingerprint(
    batches: &[Batch],
    raw_materials: &[RawMaterial],
    products: &[Product],
) -> String {
    let mut batch_keys: Vec<String> = batches
        .iter()
        .map(|b| format!("{}:{}", b.batch_id, b.status))
        .collect();
    batch_keys.sort();

    let mut material_keys: Vec<String> = raw_materials
        .iter()
        .map(|m| format!("raw:{}={}", m.id, m.quantity.normalize()))
        .chain(
            products
                .iter()
                .map(|p| format!("final:{}={}", p.id, p.quantity.normalize())),
        )
        .collect();
    material_keys.sort();

    let mut hasher = Sha256::new();
    for key in batch_keys.iter().chain(material_keys.iter()) {
        hasher.update(key.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}
