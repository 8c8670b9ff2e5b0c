// ABOUTME: In-memory IndexStore used by tests and dry runs
// ABOUTME: Clones share the same underlying map

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::{IndexStore, IndexValue};

#[derive(Debug, Clone, Default)]
pub struct MemoryIndexStore {
    values: Arc<Mutex<HashMap<(String, String), IndexValue>>>,
}

impl MemoryIndexStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tracked (alias, table) pairs.
    pub fn len(&self) -> usize {
        self.values.lock().map(|v| v.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl IndexStore for MemoryIndexStore {
    async fn get(&self, source_alias: &str, table_id: &str) -> Result<Option<IndexValue>> {
        let values = self
            .values
            .lock()
            .map_err(|_| anyhow!("Index store mutex poisoned"))?;
        Ok(values
            .get(&(source_alias.to_string(), table_id.to_string()))
            .cloned())
    }

    async fn set(&self, source_alias: &str, table_id: &str, value: &IndexValue) -> Result<()> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| anyhow!("Index store mutex poisoned"))?;
        values.insert(
            (source_alias.to_string(), table_id.to_string()),
            value.clone(),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_overwrites_pair() {
        let store = MemoryIndexStore::new();
        store.set("shop", "orders", &IndexValue::Integer(1)).await.unwrap();
        store.set("shop", "orders", &IndexValue::Integer(5)).await.unwrap();
        store.set("shop_eu", "orders", &IndexValue::Integer(2)).await.unwrap();

        assert_eq!(store.len(), 2);
        assert_eq!(
            store.get("shop", "orders").await.unwrap(),
            Some(IndexValue::Integer(5))
        );
        assert_eq!(
            store.get("shop_eu", "orders").await.unwrap(),
            Some(IndexValue::Integer(2))
        );
        assert_eq!(store.get("shop", "customers").await.unwrap(), None);
    }
}
