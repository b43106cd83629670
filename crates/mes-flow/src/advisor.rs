//! 生產建議服務
//!
//! 外部建議產生器為選用協作者。無產生器、逾時、錯誤或輸出無效時，
//! 一律回傳規則式結果；此服務從不對呼叫端回報錯誤。

use async_trait::async_trait;
use mes_cache::{fingerprint, SuggestionCache};
use mes_calc::{FallbackRules, Suggestion, SuggestionSnapshot};
use mes_core::{
    Batch, BatchRepository, DocumentStore, Filter, MesConfig, Product, ProductRepository,
    RawMaterial, RawMaterialRepository, Result,
};
use std::sync::Arc;
use std::time::Duration;

/// 外部建議產生器
#[async_trait]
pub trait SuggestionGenerator: Send + Sync {
    /// 輸入為精簡 JSON 快照
    async fn generate(&self, snapshot: &str) -> Result<Vec<Suggestion>>;
}

/// 生產建議服務
pub struct SuggestionService {
    batches: BatchRepository,
    products: ProductRepository,
    raw_materials: RawMaterialRepository,
    generator: Option<Arc<dyn SuggestionGenerator>>,
    cache: SuggestionCache,
    rules: FallbackRules,
    timeout: Duration,
    window: usize,
}

impl SuggestionService {
    pub fn new(store: Arc<dyn DocumentStore>, config: &MesConfig) -> Self {
        Self {
            batches: BatchRepository::new(store.clone(), config),
            products: ProductRepository::new(store.clone(), config),
            raw_materials: RawMaterialRepository::new(store, config),
            generator: None,
            cache: SuggestionCache::new(
                config.suggestion_cache_capacity,
                config.suggestion_cache_ttl(),
            ),
            rules: FallbackRules::from_config(config),
            timeout: config.suggestion_timeout(),
            window: config.recent_batch_window,
        }
    }

    /// 建構器模式：設置外部產生器
    pub fn with_generator(mut self, generator: Arc<dyn SuggestionGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    /// 建構器模式：注入快取
    pub fn with_cache(mut self, cache: SuggestionCache) -> Self {
        self.cache = cache;
        self
    }

    /// 產生建議
    pub async fn suggest(&self) -> Vec<Suggestion> {
        let (batches, raw_materials, products) = match self.load_inputs().await {
            Ok(inputs) => inputs,
            Err(e) => {
                tracing::warn!("建議資料載入失敗，使用空資料: {}", e);
                (Vec::new(), Vec::new(), Vec::new())
            }
        };

        let Some(generator) = &self.generator else {
            return self.rules.generate(&batches, &raw_materials, &products);
        };

        let key = fingerprint(&batches, &raw_materials, &products);
        if let Some(cached) = self.cache.get(&key).await {
            tracing::debug!("建議快取命中: {}", key);
            return cached;
        }

        match self
            .ask_generator(generator.as_ref(), &batches, &raw_materials, &products)
            .await
        {
            Some(suggestions) => {
                self.cache.insert(key, suggestions.clone()).await;
                suggestions
            }
            None => self.rules.generate(&batches, &raw_materials, &products),
        }
    }

    async fn load_inputs(&self) -> Result<(Vec<Batch>, Vec<RawMaterial>, Vec<Product>)> {
        let (mut batches, raw_materials, products) = futures::try_join!(
            self.batches.list(&Filter::All),
            self.raw_materials.list(),
            self.products.list(),
        )?;
        batches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        batches.truncate(self.window);
        Ok((batches, raw_materials, products))
    }

    async fn ask_generator(
        &self,
        generator: &dyn SuggestionGenerator,
        batches: &[Batch],
        raw_materials: &[RawMaterial],
        products: &[Product],
    ) -> Option<Vec<Suggestion>> {
        let snapshot = SuggestionSnapshot::build(
            batches,
            raw_materials,
            products,
            self.rules.default_low_stock_threshold(),
        );
        let json = match snapshot.to_compact_json() {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!("建議快照序列化失敗: {}", e);
                return None;
            }
        };

        let reply = tokio::time::timeout(self.timeout, generator.generate(&json)).await;
        let mut suggestions = match reply {
            Ok(Ok(suggestions)) => suggestions,
            Ok(Err(e)) => {
                tracing::warn!("外部建議產生器失敗，改用規則式建議: {}", e);
                return None;
            }
            Err(_) => {
                tracing::warn!("外部建議產生器逾時 ({:?})，改用規則式建議", self.timeout);
                return None;
            }
        };

        if suggestions.is_empty() || !suggestions.iter().all(Suggestion::is_well_formed) {
            tracing::warn!("外部建議產生器輸出為空或無效，改用規則式建議");
            return None;
        }
        suggestions.truncate(self.rules.max_suggestions());
        Some(suggestions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mes_calc::Chart;
    use mes_core::{MemoryStore, MesError};
    use rust_decimal::Decimal;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Scripted {
        calls: AtomicUsize,
        reply: Result<Vec<Suggestion>>,
    }

    #[async_trait]
    impl SuggestionGenerator for Scripted {
        async fn generate(&self, _snapshot: &str) -> Result<Vec<Suggestion>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.reply {
                Ok(list) => Ok(list.clone()),
                Err(e) => Err(MesError::Storage(e.to_string())),
            }
        }
    }

    fn external() -> Suggestion {
        Suggestion {
            suggestion: "外部建議".to_string(),
            reasoning: "模型".to_string(),
            chart: Chart {
                title: "外部".to_string(),
                data: vec![],
            },
        }
    }

    async fn service(reply: Result<Vec<Suggestion>>) -> (SuggestionService, Arc<Scripted>) {
        let store = MemoryStore::new();
        let config = MesConfig::default();
        RawMaterialRepository::new(Arc::new(store.clone()), &config)
            .insert(&RawMaterial::new("paint", "paint", Decimal::ONE, "l"))
            .await
            .unwrap();
        let generator = Arc::new(Scripted {
            calls: AtomicUsize::new(0),
            reply,
        });
        let service =
            SuggestionService::new(Arc::new(store), &config).with_generator(generator.clone());
        (service, generator)
    }

    #[tokio::test]
    async fn test_generator_result_is_cached() {
        let (service, generator) = service(Ok(vec![external()])).await;

        let first = service.suggest().await;
        let second = service.suggest().await;

        assert_eq!(first[0].suggestion, "外部建議");
        assert_eq!(first, second);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_injected_cache_is_shared() {
        let (service, generator) = service(Ok(vec![external()])).await;
        let cache = SuggestionCache::new(4, Duration::from_secs(60));
        let service = service.with_cache(cache.clone());

        service.suggest().await;
        cache.run_pending_tasks().await;

        assert_eq!(cache.entry_count(), 1);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_generator_error_falls_back() {
        let (service, _) = service(Err(MesError::Storage("down".to_string()))).await;

        let result = service.suggest().await;
        assert_eq!(result[0].chart.title, "低庫存物料");
    }

    #[tokio::test]
    async fn test_empty_generator_output_falls_back() {
        let (service, generator) = service(Ok(vec![])).await;

        let result = service.suggest().await;
        assert_eq!(result[0].chart.title, "低庫存物料");

        service.suggest().await;
        assert_eq!(generator.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_without_generator_uses_rules() {
        let store = MemoryStore::new();
        let service = SuggestionService::new(Arc::new(store), &MesConfig::default());

        let result = service.suggest().await;
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].suggestion, "維持目前生產節奏");
    }
}
