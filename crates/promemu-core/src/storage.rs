use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

/// A value a scenario can stash between invocations of the same metric.
///
/// Kept as a small closed enum rather than `Box<dyn Any>`: scenarios here
/// are plain typed functions, not dynamically dispatched closures, so there
/// is no need for an open-ended payload type.
#[derive(Debug, Clone, PartialEq)]
pub enum StorageValue {
    Float(f64),
    Bool(bool),
    Timestamp(u64),
    Int(i64),
    Text(String),
}

impl StorageValue {
    pub fn as_float(&self) -> Option<f64> {
        match self {
            StorageValue::Float(v) => Some(*v),
            StorageValue::Int(v) => Some(*v as f64),
            StorageValue::Timestamp(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            StorageValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            StorageValue::Timestamp(v) => Some(*v),
            StorageValue::Int(v) if *v >= 0 => Some(*v as u64),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            StorageValue::Text(v) => Some(v.as_str()),
            _ => None,
        }
    }
}

impl From<f64> for StorageValue {
    fn from(v: f64) -> Self {
        StorageValue::Float(v)
    }
}

impl From<bool> for StorageValue {
    fn from(v: bool) -> Self {
        StorageValue::Bool(v)
    }
}

impl From<String> for StorageValue {
    fn from(v: String) -> Self {
        StorageValue::Text(v)
    }
}

/// Per-scenario scratch map with get/set/clean, shared between the metric
/// that owns it and the tasks a scenario might fan out into (e.g. the
/// `feature_toggle` state transition emitting an event on the bus).
#[derive(Debug, Clone, Default)]
pub struct StateStorage {
    inner: Arc<Mutex<HashMap<String, StorageValue>>>,
}

impl StateStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &str) -> Option<StorageValue> {
        self.inner.lock().await.get(key).cloned()
    }

    pub async fn get_or(&self, key: &str, default: StorageValue) -> StorageValue {
        self.inner
            .lock()
            .await
            .get(key)
            .cloned()
            .unwrap_or(default)
    }

    pub async fn set(&self, key: impl Into<String>, value: impl Into<StorageValue>) {
        self.inner.lock().await.insert(key.into(), value.into());
    }

    pub async fn remove(&self, key: &str) {
        self.inner.lock().await.remove(key);
    }

    pub async fn clean(&self) {
        self.inner.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_set_round_trip() {
        let storage = StateStorage::new();
        assert_eq!(storage.get("missing").await, None);

        storage.set("x", 42.0).await;
        assert_eq!(storage.get("x").await.unwrap().as_float(), Some(42.0));

        let got = storage.get_or("missing", StorageValue::Float(7.0)).await;
        assert_eq!(got.as_float(), Some(7.0));
    }

    #[tokio::test]
    async fn clean_clears_everything() {
        let storage = StateStorage::new();
        storage.set("a", 1.0).await;
        storage.set("b", true).await;
        storage.clean().await;
        assert_eq!(storage.get("a").await, None);
        assert_eq!(storage.get("b").await, None);
    }

    #[tokio::test]
    async fn clones_share_the_same_map() {
        let storage = StateStorage::new();
        let clone = storage.clone();
        storage.set("shared", 1.0).await;
        assert_eq!(clone.get("shared").await.unwrap().as_float(), Some(1.0));
    }
}
