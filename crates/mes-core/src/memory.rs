//! 記憶體文件儲存
//!
//! `DocumentStore` 的參考實作，供測試與單機情境使用。

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};

use crate::store::{Collection, Document, DocumentStore, FieldPatch, Filter};
use crate::{MesError, Result};

struct Inner {
    collections: RwLock<HashMap<Collection, BTreeMap<String, Document>>>,
    counters: Mutex<HashMap<String, u64>>,
    changes: watch::Sender<u64>,
}

impl Inner {
    async fn snapshot(&self, collection: Collection, filter: &Filter) -> Vec<Document> {
        let collections = self.collections.read().await;
        collections
            .get(&collection)
            .map(|docs| docs.values().filter(|d| filter.matches(d)).cloned().collect())
            .unwrap_or_default()
    }

    fn notify(&self) {
        self.changes.send_modify(|revision| *revision += 1);
    }
}

/// 記憶體文件儲存
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    /// 創建空的儲存
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                collections: RwLock::new(HashMap::new()),
                counters: Mutex::new(HashMap::new()),
                changes,
            }),
        }
    }

    /// 集合內文件數
    pub async fn len(&self, collection: Collection) -> usize {
        let collections = self.inner.collections.read().await;
        collections.get(&collection).map(BTreeMap::len).unwrap_or(0)
    }

    /// 直接寫入原始文件（匯入舊資料用，不檢查結構）
    pub async fn insert_raw(&self, collection: Collection, id: &str, data: Value) {
        let mut collections = self.inner.collections.write().await;
        let docs = collections.entry(collection).or_default();
        let version = docs.get(id).map(|d| d.version + 1).unwrap_or(1);
        docs.insert(
            id.to_string(),
            Document {
                id: id.to_string(),
                version,
                data,
            },
        );
        drop(collections);
        self.inner.notify();
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, collection: Collection, id: &str) -> Result<Option<Document>> {
        let collections = self.inner.collections.read().await;
        Ok(collections.get(&collection).and_then(|docs| docs.get(id)).cloned())
    }

    async fn query(&self, collection: Collection, filter: &Filter) -> Result<Vec<Document>> {
        Ok(self.inner.snapshot(collection, filter).await)
    }

    async fn create(&self, collection: Collection, id: &str, data: Value) -> Result<Document> {
        let mut collections = self.inner.collections.write().await;
        let docs = collections.entry(collection).or_default();
        if docs.contains_key(id) {
            return Err(MesError::AlreadyExists {
                collection: collection.to_string(),
                id: id.to_string(),
            });
        }

        let doc = Document {
            id: id.to_string(),
            version: 1,
            data,
        };
        docs.insert(id.to_string(), doc.clone());
        drop(collections);

        self.inner.notify();
        Ok(doc)
    }

    async fn update(
        &self,
        collection: Collection,
        id: &str,
        patch: &FieldPatch,
        expected_version: Option<u64>,
    ) -> Result<Document> {
        let mut collections = self.inner.collections.write().await;
        let doc = collections
            .get_mut(&collection)
            .and_then(|docs| docs.get_mut(id))
            .ok_or_else(|| MesError::NotFound {
                entity: "文件",
                id: format!("{}/{}", collection, id),
            })?;

        if let Some(expected) = expected_version {
            if doc.version != expected {
                return Err(MesError::VersionConflict {
                    id: id.to_string(),
                    expected,
                    actual: doc.version,
                });
            }
        }

        // 先在副本上套用，失敗時不留下半套用的內容
        let mut data = doc.data.clone();
        patch.apply_to(&mut data)?;
        doc.data = data;
        doc.version += 1;
        let updated = doc.clone();
        drop(collections);

        self.inner.notify();
        Ok(updated)
    }

    async fn delete(&self, collection: Collection, id: &str) -> Result<bool> {
        let mut collections = self.inner.collections.write().await;
        let existed = collections
            .get_mut(&collection)
            .and_then(|docs| docs.remove(id))
            .is_some();
        drop(collections);

        if existed {
            self.inner.notify();
        }
        Ok(existed)
    }

    fn watch(&self, collection: Collection, filter: Filter) -> BoxStream<'static, Vec<Document>> {
        let inner = self.inner.clone();
        let receiver = inner.changes.subscribe();

        stream::unfold(
            (inner, receiver, filter, None::<Vec<Document>>),
            move |(inner, mut receiver, filter, last)| async move {
                loop {
                    if last.is_some() && receiver.changed().await.is_err() {
                        return None;
                    }
                    let docs = inner.snapshot(collection, &filter).await;
                    if last.as_ref() != Some(&docs) {
                        return Some((docs.clone(), (inner, receiver, filter, Some(docs))));
                    }
                }
            },
        )
        .boxed()
    }

    async fn next_sequence(&self, key: &str, floor: u64) -> Result<u64> {
        let mut counters = self.inner.counters.lock().await;
        let counter = counters.entry(key.to_string()).or_insert(0);
        *counter = (*counter).max(floor) + 1;
        Ok(*counter)
    }
}
