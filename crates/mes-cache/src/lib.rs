//! # MES Cache
//!
//! 建議快取與指紋

pub mod fingerprint;
pub mod suggestion_cache;

// Re-export 主要類型
pub use fingerprint::fingerprint;
pub use suggestion_cache::SuggestionCache;
