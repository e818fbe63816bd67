//! Transactional document store abstraction.
//!
//! Every durable write in the crate is expressed as a list of [`WriteOp`]s
//! and committed atomically through [`DocumentStore::commit`]. Two backends
//! are provided: an in-process [`memory::MemoryStore`] and a DynamoDB-backed
//! [`dynamo::DynamoStore`].

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// In-process backend
pub mod memory;

/// DynamoDB backend
pub mod dynamo;

pub use memory::MemoryStore;

pub type Document = Value;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, Eq, PartialEq, Hash, Ord, PartialOrd)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Commands,
    Events,
    ArchivedEvents,
    TransactionLog,
    RollbackLog,
    #[serde(rename = "manual_review_queue")]
    ManualReview,
}

impl Collection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Commands => "commands",
            Collection::Events => "events",
            Collection::ArchivedEvents => "archived_events",
            Collection::TransactionLog => "transaction_log",
            Collection::RollbackLog => "rollback_log",
            Collection::ManualReview => "manual_review_queue",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Replace the whole document, creating it if absent.
    Set,
    /// Deep-merge into an existing document.
    Update,
    /// Deep-merge, creating the document if absent.
    Merge,
    Delete,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Precondition {
    Exists,
    NotExists,
    FieldEquals { field: String, value: Value },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct WriteOp {
    pub collection: Collection,
    pub document_id: String,
    pub operation: Operation,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precondition: Option<Precondition>,
}

impl WriteOp {
    fn new(collection: Collection, document_id: &str, operation: Operation, data: Value) -> Self {
        Self {
            collection,
            document_id: document_id.to_string(),
            operation,
            data,
            precondition: None,
        }
    }

    pub fn set(collection: Collection, document_id: &str, data: Value) -> Self {
        Self::new(collection, document_id, Operation::Set, data)
    }

    /// A `set` that fails if the document already exists.
    pub fn create(collection: Collection, document_id: &str, data: Value) -> Self {
        Self::set(collection, document_id, data).when(Precondition::NotExists)
    }

    pub fn update(collection: Collection, document_id: &str, data: Value) -> Self {
        Self::new(collection, document_id, Operation::Update, data)
    }

    pub fn merge(collection: Collection, document_id: &str, data: Value) -> Self {
        Self::new(collection, document_id, Operation::Merge, data)
    }

    pub fn delete(collection: Collection, document_id: &str) -> Self {
        Self::new(collection, document_id, Operation::Delete, Value::Null)
    }

    pub fn when(mut self, precondition: Precondition) -> Self {
        self.precondition = Some(precondition);
        self
    }

    /// Guards the write on `field` still holding `value`.
    pub fn when_field(self, field: &str, value: impl Into<Value>) -> Self {
        self.when(Precondition::FieldEquals {
            field: field.to_string(),
            value: value.into(),
        })
    }

    pub fn key(&self) -> DocKey {
        (self.collection, self.document_id.clone())
    }
}

pub type DocKey = (Collection, String);

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Document not found: {collection}/{id}")]
    NotFound { collection: Collection, id: String },

    #[error("Document already exists: {collection}/{id}")]
    AlreadyExists { collection: Collection, id: String },

    #[error("Version mismatch on {collection}/{id}: expected {field} = {expected}")]
    VersionMismatch {
        collection: Collection,
        id: String,
        field: String,
        expected: Value,
    },

    #[error("Write conflict: {0}")]
    Conflict(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, collection: Collection, id: &str) -> StoreResult<Option<Document>>;

    /// Applies every write or none of them.
    async fn commit(&self, writes: &[WriteOp]) -> StoreResult<()>;

    async fn query(&self, collection: Collection, filter: &Filter) -> StoreResult<Vec<Document>>;

    async fn exists(&self, collection: Collection, id: &str) -> StoreResult<bool> {
        Ok(self.get(collection, id).await?.is_some())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Condition {
    Eq(String, Value),
    In(String, Vec<Value>),
    Gte(String, Value),
    Lte(String, Value),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

/// Conjunctive filter over dotted field paths.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Filter {
    pub conditions: Vec<Condition>,
    pub order_by: Option<(String, Direction)>,
    pub limit: Option<usize>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition::Eq(field.to_string(), value.into()));
        self
    }

    pub fn any_of(mut self, field: &str, values: Vec<Value>) -> Self {
        self.conditions.push(Condition::In(field.to_string(), values));
        self
    }

    pub fn gte(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition::Gte(field.to_string(), value.into()));
        self
    }

    pub fn lte(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition::Lte(field.to_string(), value.into()));
        self
    }

    pub fn order_by(mut self, field: &str, direction: Direction) -> Self {
        self.order_by = Some((field.to_string(), direction));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, doc: &Document) -> bool {
        self.conditions.iter().all(|condition| match condition {
            Condition::Eq(field, expected) => {
                lookup(doc, field).is_some_and(|actual| values_equal(actual, expected))
            }
            Condition::In(field, options) => lookup(doc, field)
                .is_some_and(|actual| options.iter().any(|o| values_equal(actual, o))),
            Condition::Gte(field, bound) => lookup(doc, field).is_some_and(|actual| {
                matches!(
                    compare_values(actual, bound),
                    Some(Ordering::Greater | Ordering::Equal)
                )
            }),
            Condition::Lte(field, bound) => lookup(doc, field).is_some_and(|actual| {
                matches!(
                    compare_values(actual, bound),
                    Some(Ordering::Less | Ordering::Equal)
                )
            }),
        })
    }

    /// Filters, orders and truncates `docs` in memory.
    pub fn apply(&self, docs: impl IntoIterator<Item = Document>) -> Vec<Document> {
        let mut matched: Vec<Document> = docs.into_iter().filter(|d| self.matches(d)).collect();

        if let Some((field, direction)) = &self.order_by {
            matched.sort_by(|a, b| {
                let ordering = match (lookup(a, field), lookup(b, field)) {
                    (Some(x), Some(y)) => compare_values(x, y).unwrap_or(Ordering::Equal),
                    (Some(_), None) => Ordering::Greater,
                    (None, Some(_)) => Ordering::Less,
                    (None, None) => Ordering::Equal,
                };
                match direction {
                    Direction::Ascending => ordering,
                    Direction::Descending => ordering.reverse(),
                }
            });
        }

        if let Some(limit) = self.limit {
            matched.truncate(limit);
        }
        matched
    }
}

/// Resolves a dotted path such as `timing.scheduled_for`. `null` counts as absent.
pub fn lookup<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    if current.is_null() {
        None
    } else {
        Some(current)
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) | (Value::String(_), Value::String(_)) => {
            compare_values(a, b) == Some(Ordering::Equal)
        }
        _ => a == b,
    }
}

/// Numbers compare numerically; strings that both parse as RFC 3339 compare
/// as instants, other strings lexically.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => {
            match (
                DateTime::parse_from_rfc3339(x),
                DateTime::parse_from_rfc3339(y),
            ) {
                (Ok(dx), Ok(dy)) => Some(dx.with_timezone(&Utc).cmp(&dy.with_timezone(&Utc))),
                _ => Some(x.cmp(y)),
            }
        }
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Recursively merges `patch` into `target`; non-object values replace.
pub fn deep_merge(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                match target.get_mut(key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        deep_merge(existing, value)
                    }
                    _ => {
                        target.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

/// Replays `writes` in order over the `current` state of every touched
/// document and returns the final state per key (`None` = absent).
///
/// This is the validation half of a commit. Backends call it while holding
/// whatever isolation they provide and apply the result only if it succeeds.
pub fn stage_writes(
    current: &HashMap<DocKey, Option<Document>>,
    writes: &[WriteOp],
) -> StoreResult<HashMap<DocKey, Option<Document>>> {
    let mut staged: HashMap<DocKey, Option<Document>> = HashMap::new();

    for write in writes {
        let key = write.key();
        let state = staged
            .entry(key.clone())
            .or_insert_with(|| current.get(&key).cloned().flatten());

        if let Some(precondition) = &write.precondition {
            check_precondition(write, precondition, state.as_ref())?;
        }

        match write.operation {
            Operation::Set => *state = Some(write.data.clone()),
            Operation::Update => match state {
                Some(doc) => deep_merge(doc, &write.data),
                None => return Err(not_found(write)),
            },
            Operation::Merge => match state {
                Some(doc) => deep_merge(doc, &write.data),
                None => *state = Some(write.data.clone()),
            },
            Operation::Delete => {
                if state.is_none() {
                    return Err(not_found(write));
                }
                *state = None;
            }
        }
    }

    Ok(staged)
}

fn check_precondition(
    write: &WriteOp,
    precondition: &Precondition,
    state: Option<&Document>,
) -> StoreResult<()> {
    match (precondition, state) {
        (Precondition::Exists, None) => Err(not_found(write)),
        (Precondition::NotExists, Some(_)) => Err(StoreError::AlreadyExists {
            collection: write.collection,
            id: write.document_id.clone(),
        }),
        (Precondition::FieldEquals { field, value }, doc) => {
            let holds = doc
                .and_then(|d| lookup(d, field))
                .is_some_and(|actual| values_equal(actual, value));
            if holds {
                Ok(())
            } else if doc.is_none() {
                Err(not_found(write))
            } else {
                Err(StoreError::VersionMismatch {
                    collection: write.collection,
                    id: write.document_id.clone(),
                    field: field.clone(),
                    expected: value.clone(),
                })
            }
        }
        _ => Ok(()),
    }
}

fn not_found(write: &WriteOp) -> StoreError {
    StoreError::NotFound {
        collection: write.collection,
        id: write.document_id.clone(),
    }
}
