use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use cascade_core::{
    domain::expression::values_equal,
    CoreError, ErrorKind, RecordStore, SnapshotHandle, StepOutcome,
};

/// Column holding the generated row identifier
pub const ID_FIELD: &str = "id";

type Row = Map<String, Value>;

/// Rows of one collection in insertion order
#[derive(Debug, Clone, Default)]
struct Collection {
    rows: Vec<Row>,
    next_id: u64,
}

type Collections = HashMap<String, Collection>;

/// Reference from a column of one collection to the `id` of another
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    /// Referencing column
    pub field: String,
    /// Referenced collection
    pub references: String,
}

/// In-memory implementation of the RecordStore
///
/// Filters are objects of column/value pairs matched by equality; an empty
/// filter matches every row.
#[derive(Clone, Default)]
pub struct InMemoryRecordStore {
    collections: Arc<RwLock<Collections>>,
    snapshots: Arc<RwLock<HashMap<String, Collections>>>,
    foreign_keys: Arc<HashMap<String, Vec<ForeignKey>>>,
}

impl InMemoryRecordStore {
    /// Create an empty store without constraints
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `record.field` to reference an existing row of `references`
    pub fn with_foreign_key(
        mut self,
        record: impl Into<String>,
        field: impl Into<String>,
        references: impl Into<String>,
    ) -> Self {
        let mut keys = (*self.foreign_keys).clone();
        keys.entry(record.into()).or_default().push(ForeignKey {
            field: field.into(),
            references: references.into(),
        });
        self.foreign_keys = Arc::new(keys);
        self
    }

    /// Insert rows without constraint checks
    pub async fn seed(&self, record: &str, rows: Vec<Value>) -> Result<(), CoreError> {
        let mut collections = self.collections.write().await;
        let collection = collections.entry(record.to_string()).or_default();
        for row in rows {
            match row {
                Value::Object(row) => {
                    collection.insert(row);
                }
                other => {
                    return Err(CoreError::ValidationError(format!(
                        "Seed rows of {} must be objects, got {}",
                        record, other
                    )))
                }
            }
        }
        Ok(())
    }

    /// Number of rows in a collection
    pub async fn count(&self, record: &str) -> usize {
        let collections = self.collections.read().await;
        collections.get(record).map(|c| c.rows.len()).unwrap_or(0)
    }

    /// Rows of a collection in insertion order
    pub async fn rows(&self, record: &str) -> Vec<Value> {
        let collections = self.collections.read().await;
        collections
            .get(record)
            .map(|c| c.rows.iter().cloned().map(Value::Object).collect())
            .unwrap_or_default()
    }

    /// Snapshots taken and not yet restored or discarded
    pub async fn open_snapshots(&self) -> usize {
        self.snapshots.read().await.len()
    }

    fn check_references(&self, collections: &Collections, record: &str, row: &Row) -> Result<(), String> {
        let keys = match self.foreign_keys.get(record) {
            Some(keys) => keys,
            None => return Ok(()),
        };

        for key in keys {
            let value = match row.get(&key.field) {
                Some(value) if !value.is_null() => value,
                _ => {
                    return Err(format!(
                        "{}.{} must reference a {} row",
                        record, key.field, key.references
                    ))
                }
            };

            let found = collections
                .get(&key.references)
                .map(|target| {
                    target
                        .rows
                        .iter()
                        .any(|r| r.get(ID_FIELD).map(|id| values_equal(id, value)).unwrap_or(false))
                })
                .unwrap_or(false);

            if !found {
                return Err(format!(
                    "{}.{} = {} references a missing {} row",
                    record, key.field, value, key.references
                ));
            }
        }
        Ok(())
    }
}

impl Collection {
    fn insert(&mut self, mut row: Row) -> Row {
        match row.get(ID_FIELD).and_then(Value::as_u64) {
            Some(id) => self.next_id = self.next_id.max(id),
            None if row.contains_key(ID_FIELD) => {}
            None => {
                self.next_id += 1;
                row.insert(ID_FIELD.to_string(), json!(self.next_id));
            }
        }
        self.rows.push(row.clone());
        row
    }
}

fn as_object(value: Value, what: &str) -> Result<Row, StepOutcome> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(StepOutcome::err(
            ErrorKind::Validation,
            format!("{} must be an object, got {}", what, other),
        )),
    }
}

fn matches(row: &Row, filter: &Row) -> bool {
    filter.iter().all(|(field, expected)| {
        row.get(field)
            .map(|actual| values_equal(actual, expected))
            .unwrap_or(false)
    })
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn create(&self, record: &str, payload: Value) -> StepOutcome {
        let row = match as_object(payload, "Record payload") {
            Ok(row) => row,
            Err(outcome) => return outcome,
        };

        let mut collections = self.collections.write().await;
        if let Err(message) = self.check_references(&collections, record, &row) {
            warn!(record, %message, "create rejected");
            return StepOutcome::err(ErrorKind::Validation, message);
        }

        let created = collections.entry(record.to_string()).or_default().insert(row);
        debug!(record, id = ?created.get(ID_FIELD), "record created");
        StepOutcome::ok(Value::Object(created))
    }

    async fn update(&self, record: &str, filter: Value, changes: Value) -> StepOutcome {
        let filter = match as_object(filter, "Filter") {
            Ok(filter) => filter,
            Err(outcome) => return outcome,
        };
        let changes = match as_object(changes, "Update payload") {
            Ok(changes) => changes,
            Err(outcome) => return outcome,
        };

        let mut collections = self.collections.write().await;
        let mut updated: Vec<Row> = collections
            .get(record)
            .map(|c| c.rows.iter().filter(|r| matches(r, &filter)).cloned().collect())
            .unwrap_or_default();

        for row in &mut updated {
            for (field, value) in &changes {
                row.insert(field.clone(), value.clone());
            }
            if let Err(message) = self.check_references(&collections, record, row) {
                warn!(record, %message, "update rejected");
                return StepOutcome::err(ErrorKind::Validation, message);
            }
        }

        if let Some(collection) = collections.get_mut(record) {
            for row in collection.rows.iter_mut().filter(|r| matches(r, &filter)) {
                for (field, value) in &changes {
                    row.insert(field.clone(), value.clone());
                }
            }
        }

        debug!(record, count = updated.len(), "records updated");
        StepOutcome::ok(json!(updated.len()))
    }

    async fn delete(&self, record: &str, filter: Value) -> StepOutcome {
        let filter = match as_object(filter, "Filter") {
            Ok(filter) => filter,
            Err(outcome) => return outcome,
        };

        let mut collections = self.collections.write().await;
        let removed = match collections.get_mut(record) {
            Some(collection) => {
                let before = collection.rows.len();
                collection.rows.retain(|r| !matches(r, &filter));
                before - collection.rows.len()
            }
            None => 0,
        };

        debug!(record, count = removed, "records deleted");
        StepOutcome::ok(json!(removed))
    }

    async fn query(&self, record: &str, filter: Value) -> StepOutcome {
        let filter = match as_object(filter, "Filter") {
            Ok(filter) => filter,
            Err(outcome) => return outcome,
        };

        let collections = self.collections.read().await;
        let rows = collections
            .get(record)
            .map(|c| {
                c.rows
                    .iter()
                    .filter(|r| matches(r, &filter))
                    .cloned()
                    .map(Value::Object)
                    .collect()
            })
            .unwrap_or_default();
        StepOutcome::ok(Value::Array(rows))
    }

    async fn snapshot(&self) -> Result<SnapshotHandle, CoreError> {
        let copy = self.collections.read().await.clone();
        let handle = SnapshotHandle(Uuid::new_v4().to_string());
        self.snapshots.write().await.insert(handle.0.clone(), copy);
        debug!(snapshot = %handle.0, "snapshot taken");
        Ok(handle)
    }

    async fn restore(&self, handle: &SnapshotHandle) -> Result<(), CoreError> {
        let saved = self
            .snapshots
            .write()
            .await
            .remove(&handle.0)
            .ok_or_else(|| CoreError::StoreError(format!("Unknown snapshot {}", handle.0)))?;
        *self.collections.write().await = saved;
        debug!(snapshot = %handle.0, "snapshot restored");
        Ok(())
    }

    async fn discard(&self, handle: &SnapshotHandle) -> Result<(), CoreError> {
        self.snapshots
            .write()
            .await
            .remove(&handle.0)
            .map(|_| ())
            .ok_or_else(|| CoreError::StoreError(format!("Unknown snapshot {}", handle.0)))
    }
}
