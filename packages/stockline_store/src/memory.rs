//! In-memory reference store.
//!
//! One `Vec` of JSON rows per dataset, rows keyed by their `"id"`
//! field. Entities and datasets share the same vocabulary: a mutation
//! against `"inventory"` is visible in the `"inventory"` dataset on the
//! next fetch.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{AppliedChange, ChangeAction, DATASETS, StoreError, SyncStore};

#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: RwLock<HashMap<String, Vec<Value>>>,
}

impl MemoryStore {
    /// Empty store with every known dataset present.
    pub fn new() -> Self {
        let rows = DATASETS.iter().map(|name| (name.to_string(), Vec::new())).collect();
        Self { rows: RwLock::new(rows) }
    }

    /// Store pre-seeded with a small cross-referenced sample so the demo
    /// server syncs something meaningful out of the box.
    pub fn with_sample_data() -> Self {
        let mut rows: HashMap<String, Vec<Value>> = HashMap::new();
        rows.insert(
            "warehouses".into(),
            vec![
                json!({"id": "wh-1", "name": "Central", "city": "Rotterdam"}),
                json!({"id": "wh-2", "name": "North Annex", "city": "Groningen"}),
            ],
        );
        rows.insert(
            "suppliers".into(),
            vec![json!({"id": "sup-1", "name": "Veldman Parts BV", "currency": "EUR"})],
        );
        rows.insert(
            "categories".into(),
            vec![
                json!({"id": "cat-1", "name": "Fasteners"}),
                json!({"id": "cat-2", "name": "Abrasives"}),
            ],
        );
        rows.insert(
            "units".into(),
            vec![json!({"id": "unit-1", "name": "piece"}), json!({"id": "unit-2", "name": "box"})],
        );
        rows.insert(
            "inventory".into(),
            vec![
                json!({
                    "id": "inv-1", "name": "M6 hex bolt", "sku": "FAS-0061",
                    "category": "cat-1", "unit": "unit-1", "warehouse": "wh-1",
                    "supplier": "sup-1", "quantity": 1250
                }),
                json!({
                    "id": "inv-2", "name": "Sanding disc 125mm", "sku": "ABR-0125",
                    "category": "cat-2", "unit": "unit-2", "warehouse": "wh-2",
                    "supplier": "sup-1", "quantity": 84
                }),
            ],
        );
        Self { rows: RwLock::new(rows) }
    }

    /// Seed a row directly, mainly for tests.
    pub async fn insert_row(&self, dataset: &str, row: Value) {
        self.rows.write().await.entry(dataset.to_string()).or_default().push(row);
    }

    pub async fn row_count(&self, dataset: &str) -> usize {
        self.rows.read().await.get(dataset).map(Vec::len).unwrap_or(0)
    }
}

/// Row-id equality: ids arrive as JSON values, so `7` and `"7"` are
/// distinct on purpose — the store never coerces.
fn row_matches(row: &Value, id: &Value) -> bool {
    row.get("id") == Some(id)
}

#[async_trait]
impl SyncStore for MemoryStore {
    async fn fetch_dataset(&self, name: &str) -> Result<Option<Vec<Value>>, StoreError> {
        Ok(self.rows.read().await.get(name).cloned())
    }

    async fn apply_change(
        &self,
        entity: &str,
        action: ChangeAction,
        id: Option<&Value>,
        data: Option<&Value>,
    ) -> Result<AppliedChange, StoreError> {
        let mut rows = self.rows.write().await;
        let collection = rows
            .get_mut(entity)
            .ok_or_else(|| StoreError::UnknownEntity(entity.to_string()))?;

        match action {
            ChangeAction::Create => {
                let mut row = data.cloned().ok_or(StoreError::InvalidChange("data"))?;
                let assigned = match row.get("id") {
                    Some(existing) => existing.clone(),
                    None => {
                        let fresh = Value::String(Uuid::new_v4().to_string());
                        if let Some(obj) = row.as_object_mut() {
                            obj.insert("id".into(), fresh.clone());
                        }
                        fresh
                    }
                };
                collection.push(row.clone());
                Ok(AppliedChange { id: Some(assigned), data: Some(row) })
            }
            ChangeAction::Update => {
                let target = id
                    .cloned()
                    .or_else(|| data.and_then(|d| d.get("id").cloned()))
                    .ok_or(StoreError::InvalidChange("id"))?;
                let row = collection
                    .iter_mut()
                    .find(|row| row_matches(row, &target))
                    .ok_or_else(|| StoreError::NotFound {
                        entity: entity.to_string(),
                        id: target.to_string(),
                    })?;
                if let (Some(obj), Some(Value::Object(patch))) = (row.as_object_mut(), data) {
                    for (key, value) in patch {
                        obj.insert(key.clone(), value.clone());
                    }
                }
                Ok(AppliedChange { id: Some(target), data: Some(row.clone()) })
            }
            ChangeAction::Delete => {
                let target = id.cloned().ok_or(StoreError::InvalidChange("id"))?;
                let before = collection.len();
                collection.retain(|row| !row_matches(row, &target));
                if collection.len() == before {
                    return Err(StoreError::NotFound {
                        entity: entity.to_string(),
                        id: target.to_string(),
                    });
                }
                Ok(AppliedChange { id: Some(target), data: None })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fetch_unknown_dataset_is_none() {
        let store = MemoryStore::new();
        assert!(store.fetch_dataset("gadgets").await.unwrap().is_none());
        assert_eq!(store.fetch_dataset("inventory").await.unwrap().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn create_assigns_id_when_absent() {
        let store = MemoryStore::new();
        let applied = store
            .apply_change("inventory", ChangeAction::Create, None, Some(&json!({"name": "Washer"})))
            .await
            .unwrap();
        let id = applied.id.expect("id assigned");
        assert!(id.as_str().is_some());
        assert_eq!(applied.data.unwrap()["id"], id);
        assert_eq!(store.row_count("inventory").await, 1);
    }

    #[tokio::test]
    async fn update_merges_fields() {
        let store = MemoryStore::with_sample_data();
        let applied = store
            .apply_change(
                "inventory",
                ChangeAction::Update,
                Some(&json!("inv-1")),
                Some(&json!({"quantity": 3})),
            )
            .await
            .unwrap();
        let row = applied.data.unwrap();
        assert_eq!(row["quantity"], 3);
        // Untouched fields survive the merge.
        assert_eq!(row["sku"], "FAS-0061");
    }

    #[tokio::test]
    async fn update_missing_row_is_not_found() {
        let store = MemoryStore::new();
        let err = store
            .apply_change("inventory", ChangeAction::Update, Some(&json!("nope")), None)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "not_found");
    }

    #[tokio::test]
    async fn delete_removes_row() {
        let store = MemoryStore::with_sample_data();
        let before = store.row_count("inventory").await;
        store
            .apply_change("inventory", ChangeAction::Delete, Some(&json!("inv-2")), None)
            .await
            .unwrap();
        assert_eq!(store.row_count("inventory").await, before - 1);
    }

    #[tokio::test]
    async fn unknown_entity_rejected() {
        let store = MemoryStore::new();
        let err = store
            .apply_change("gadgets", ChangeAction::Create, None, Some(&json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "unknown_entity");
    }
}
