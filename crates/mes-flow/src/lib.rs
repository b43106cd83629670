//! # MES Flow
//!
//! 非同步流程：批號配發、批次建立、站別作業與生產建議

pub mod advisor;
pub mod allocator;
pub mod batch_service;
pub mod retry;
pub mod sequencer;

// Re-export 主要類型
pub use advisor::{SuggestionGenerator, SuggestionService};
pub use allocator::IdAllocator;
pub use batch_service::{BatchCreation, BatchService, CreateBatchRequest};
pub use retry::{retry_on_conflict, RetryPolicy};
pub use sequencer::StageSequencer;

use mes_core::{BatchRepository, DocumentStore, MesConfig};
use std::sync::Arc;

/// 共用同一儲存層與配置的服務組合
#[derive(Clone)]
pub struct MesServices {
    pub batches: BatchService,
    pub sequencer: StageSequencer,
    pub advisor: Arc<SuggestionService>,
}

impl MesServices {
    pub fn new(store: Arc<dyn DocumentStore>, config: &MesConfig) -> Self {
        Self {
            batches: BatchService::new(store.clone(), config),
            sequencer: StageSequencer::new(BatchRepository::new(store.clone(), config), config),
            advisor: Arc::new(SuggestionService::new(store, config)),
        }
    }
}
