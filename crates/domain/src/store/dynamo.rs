//! DynamoDB document store.
//!
//! One table per collection, partition key `id`. Each item carries a `_rev`
//! counter. A commit reads every touched item, stages the writes in memory,
//! then issues a single `TransactWriteItems` in which each put/delete is
//! conditioned on the revision it was read at (or on non-existence). A
//! concurrent writer therefore cancels the transaction instead of being
//! silently overwritten.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use aws_sdk_dynamodb::{
    error::SdkError,
    operation::transact_write_items::TransactWriteItemsError,
    types::{AttributeValue, Delete, Put, TransactWriteItem},
    Client,
};

use super::{
    stage_writes, Collection, DocKey, Document, DocumentStore, Filter, StoreError, StoreResult,
    WriteOp,
};
use crate::config::TableNames;

const KEY_ATTR: &str = "id";
const REV_ATTR: &str = "_rev";
const CONDITION_FAILED: &str = "ConditionalCheckFailed";

/// DynamoDB's per-transaction item limit.
pub const MAX_TRANSACTION_ITEMS: usize = 100;

#[derive(Clone, Debug)]
pub struct DynamoStore {
    client: Client,
    tables: TableNames,
}

impl DynamoStore {
    pub fn new(client: Client, tables: TableNames) -> Self {
        Self { client, tables }
    }

    fn table(&self, collection: Collection) -> &str {
        self.tables.table_for(collection)
    }

    async fn load(&self, collection: Collection, id: &str) -> StoreResult<Option<(Document, u64)>> {
        let output = self
            .client
            .get_item()
            .table_name(self.table(collection))
            .key(KEY_ATTR, AttributeValue::S(id.to_string()))
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        match output.item() {
            None => Ok(None),
            Some(item) => decode(item.clone()).map(Some),
        }
    }

    fn put_item(
        &self,
        key: &DocKey,
        doc: &Document,
        rev: Option<u64>,
    ) -> StoreResult<TransactWriteItem> {
        let mut item: HashMap<String, AttributeValue> =
            serde_dynamo::to_item(doc).map_err(|e| StoreError::Backend(e.to_string()))?;
        item.insert(KEY_ATTR.to_string(), AttributeValue::S(key.1.clone()));
        item.insert(
            REV_ATTR.to_string(),
            AttributeValue::N((rev.unwrap_or(0) + 1).to_string()),
        );

        let builder = Put::builder().table_name(self.table(key.0)).set_item(Some(item));
        let builder = match rev {
            Some(rev) => builder
                .condition_expression("#rev = :rev")
                .expression_attribute_names("#rev", REV_ATTR)
                .expression_attribute_values(":rev", AttributeValue::N(rev.to_string())),
            None => builder
                .condition_expression("attribute_not_exists(#id)")
                .expression_attribute_names("#id", KEY_ATTR),
        };
        let put = builder
            .build()
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        Ok(TransactWriteItem::builder().put(put).build())
    }

    fn delete_item(&self, key: &DocKey, rev: u64) -> StoreResult<TransactWriteItem> {
        let delete = Delete::builder()
            .table_name(self.table(key.0))
            .key(KEY_ATTR, AttributeValue::S(key.1.clone()))
            .condition_expression("#rev = :rev")
            .expression_attribute_names("#rev", REV_ATTR)
            .expression_attribute_values(":rev", AttributeValue::N(rev.to_string()))
            .build()
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        Ok(TransactWriteItem::builder().delete(delete).build())
    }
}

#[async_trait]
impl DocumentStore for DynamoStore {
    async fn get(&self, collection: Collection, id: &str) -> StoreResult<Option<Document>> {
        Ok(self.load(collection, id).await?.map(|(doc, _)| doc))
    }

    async fn commit(&self, writes: &[WriteOp]) -> StoreResult<()> {
        let mut current: HashMap<DocKey, Option<Document>> = HashMap::new();
        let mut revisions: HashMap<DocKey, u64> = HashMap::new();

        for write in writes {
            let key = write.key();
            if current.contains_key(&key) {
                continue;
            }
            match self.load(key.0, &key.1).await? {
                Some((doc, rev)) => {
                    revisions.insert(key.clone(), rev);
                    current.insert(key, Some(doc));
                }
                None => {
                    current.insert(key, None);
                }
            }
        }

        let staged = stage_writes(&current, writes)?;

        // Stable ordering keeps request payloads reproducible in logs.
        let staged: BTreeMap<DocKey, Option<Document>> = staged.into_iter().collect();

        let mut items = Vec::with_capacity(staged.len());
        // Index-aligned with `items`: the key of each put guarded on absence.
        let mut creates: Vec<Option<DocKey>> = Vec::with_capacity(staged.len());
        for (key, state) in &staged {
            let rev = revisions.get(key).copied();
            match (state, rev) {
                (Some(doc), rev) => {
                    items.push(self.put_item(key, doc, rev)?);
                    creates.push(rev.is_none().then(|| key.clone()));
                }
                (None, Some(rev)) => {
                    items.push(self.delete_item(key, rev)?);
                    creates.push(None);
                }
                // Created and deleted inside the same transaction.
                (None, None) => {}
            }
        }

        if items.is_empty() {
            return Ok(());
        }
        if items.len() > MAX_TRANSACTION_ITEMS {
            return Err(StoreError::Backend(format!(
                "transaction touches {} items, limit is {}",
                items.len(),
                MAX_TRANSACTION_ITEMS
            )));
        }

        self.client
            .transact_write_items()
            .set_transact_items(Some(items))
            .send()
            .await
            .map_err(|e| map_transact_error(e, &creates))?;

        Ok(())
    }

    async fn query(&self, collection: Collection, filter: &Filter) -> StoreResult<Vec<Document>> {
        let mut docs = Vec::new();
        let mut start_key: Option<HashMap<String, AttributeValue>> = None;

        loop {
            let output = self
                .client
                .scan()
                .table_name(self.table(collection))
                .consistent_read(true)
                .set_exclusive_start_key(start_key.take())
                .send()
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))?;

            for item in output.items() {
                let (doc, _) = decode(item.clone())?;
                docs.push(doc);
            }

            match output.last_evaluated_key() {
                Some(key) if !key.is_empty() => start_key = Some(key.clone()),
                _ => break,
            }
        }

        Ok(filter.apply(docs))
    }
}

fn decode(mut item: HashMap<String, AttributeValue>) -> StoreResult<(Document, u64)> {
    let rev = match item.remove(REV_ATTR) {
        Some(AttributeValue::N(n)) => n
            .parse::<u64>()
            .map_err(|e| StoreError::Backend(format!("invalid {REV_ATTR}: {e}")))?,
        _ => 0,
    };
    let doc: Document =
        serde_dynamo::from_item(item).map_err(|e| StoreError::Backend(e.to_string()))?;
    Ok((doc, rev))
}

fn map_transact_error<R>(
    err: SdkError<TransactWriteItemsError, R>,
    creates: &[Option<DocKey>],
) -> StoreError
where
    R: std::fmt::Debug + Send + Sync + 'static,
{
    match err.into_service_error() {
        TransactWriteItemsError::TransactionCanceledException(e) => {
            let codes: Vec<Option<&str>> =
                e.cancellation_reasons().iter().map(|r| r.code()).collect();
            match lost_create(&codes, creates) {
                Some((collection, id)) => StoreError::AlreadyExists {
                    collection: *collection,
                    id: id.clone(),
                },
                None => StoreError::Conflict(e.to_string()),
            }
        }
        TransactWriteItemsError::TransactionInProgressException(e) => {
            StoreError::Conflict(e.to_string())
        }
        other => StoreError::Backend(other.to_string()),
    }
}

/// The first absence-guarded put whose condition failed: another writer
/// created that document first.
fn lost_create<'a>(codes: &[Option<&str>], creates: &'a [Option<DocKey>]) -> Option<&'a DocKey> {
    codes
        .iter()
        .zip(creates)
        .find_map(|(code, key)| match (code, key) {
            (Some(CONDITION_FAILED), Some(key)) => Some(key),
            _ => None,
        })
}
