use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{
    stage_writes, Collection, DocKey, Document, DocumentStore, Filter, StoreError, StoreResult,
    WriteOp,
};

/// Document store held in process memory.
///
/// Commits stage and apply under a single write lock, so every transaction
/// is serializable with respect to every other.
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<Collection, BTreeMap<String, Document>>>,
    commits: AtomicUsize,
    fail_commit: RwLock<Option<usize>>,
    ack_delay: Option<Duration>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays the acknowledgement of every commit after it has been applied.
    pub fn with_ack_delay(mut self, delay: Duration) -> Self {
        self.ack_delay = Some(delay);
        self
    }

    /// Makes the `n`th commit from now (1-based) fail with a backend error
    /// without applying anything. One-shot.
    pub fn fail_nth_commit(&self, n: usize) {
        let target = self.commits.load(Ordering::SeqCst) + n;
        *self.fail_commit.write() = Some(target);
    }

    pub fn len(&self, collection: Collection) -> usize {
        self.collections
            .read()
            .get(&collection)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }

    pub fn is_empty(&self, collection: Collection) -> bool {
        self.len(collection) == 0
    }

    fn injected_failure(&self) -> bool {
        let attempt = self.commits.fetch_add(1, Ordering::SeqCst) + 1;
        let mut fail = self.fail_commit.write();
        if *fail == Some(attempt) {
            *fail = None;
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, collection: Collection, id: &str) -> StoreResult<Option<Document>> {
        Ok(self
            .collections
            .read()
            .get(&collection)
            .and_then(|docs| docs.get(id))
            .cloned())
    }

    async fn commit(&self, writes: &[WriteOp]) -> StoreResult<()> {
        if self.injected_failure() {
            return Err(StoreError::Backend("injected commit failure".to_string()));
        }

        {
            let mut collections = self.collections.write();

            let mut current: HashMap<DocKey, Option<Document>> = HashMap::new();
            for write in writes {
                let key = write.key();
                let existing = collections
                    .get(&write.collection)
                    .and_then(|docs| docs.get(&write.document_id))
                    .cloned();
                current.entry(key).or_insert(existing);
            }

            let staged = stage_writes(&current, writes)?;

            for ((collection, id), state) in staged {
                let docs = collections.entry(collection).or_default();
                match state {
                    Some(doc) => {
                        docs.insert(id, doc);
                    }
                    None => {
                        docs.remove(&id);
                    }
                }
            }
        }

        if let Some(delay) = self.ack_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn query(&self, collection: Collection, filter: &Filter) -> StoreResult<Vec<Document>> {
        let docs: Vec<Document> = self
            .collections
            .read()
            .get(&collection)
            .map(|docs| docs.values().cloned().collect())
            .unwrap_or_default();
        Ok(filter.apply(docs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_failed_commit_leaves_no_partial_writes() {
        let store = MemoryStore::new();
        store
            .commit(&[WriteOp::create(Collection::Commands, "c1", json!({"v": 1}))])
            .await
            .unwrap();

        let result = store
            .commit(&[
                WriteOp::create(Collection::Events, "e1", json!({"id": "e1"})),
                WriteOp::update(Collection::Commands, "c1", json!({"v": 2})),
                WriteOp::update(Collection::Commands, "missing", json!({"v": 2})),
            ])
            .await;

        assert!(matches!(result, Err(StoreError::NotFound { .. })));
        assert!(store.get(Collection::Events, "e1").await.unwrap().is_none());
        assert_eq!(
            store.get(Collection::Commands, "c1").await.unwrap(),
            Some(json!({"v": 1}))
        );
    }

    #[tokio::test]
    async fn test_create_rejects_existing_document() {
        let store = MemoryStore::new();
        let op = WriteOp::create(Collection::Events, "e1", json!({"id": "e1"}));
        store.commit(&[op.clone()]).await.unwrap();
        assert!(matches!(
            store.commit(&[op]).await,
            Err(StoreError::AlreadyExists { .. })
        ));
    }

    #[tokio::test]
    async fn test_injected_failure_is_one_shot() {
        let store = MemoryStore::new();
        store.fail_nth_commit(2);
        let op = |id: &str| WriteOp::set(Collection::Events, id, json!({"id": id}));

        store.commit(&[op("a")]).await.unwrap();
        assert!(store.commit(&[op("b")]).await.is_err());
        store.commit(&[op("c")]).await.unwrap();

        assert_eq!(store.len(Collection::Events), 2);
        assert!(!store.exists(Collection::Events, "b").await.unwrap());
    }

    #[tokio::test]
    async fn test_query_filters_collection() {
        let store = MemoryStore::new();
        store
            .commit(&[
                WriteOp::set(Collection::Events, "a", json!({"patient_id": "p1", "n": 2})),
                WriteOp::set(Collection::Events, "b", json!({"patient_id": "p2", "n": 1})),
                WriteOp::set(Collection::Events, "c", json!({"patient_id": "p1", "n": 1})),
            ])
            .await
            .unwrap();

        let docs = store
            .query(
                Collection::Events,
                &Filter::new()
                    .eq("patient_id", "p1")
                    .order_by("n", super::super::Direction::Ascending),
            )
            .await
            .unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0]["n"], json!(1));
    }
}
