//! Dynamic config service - Process-wide settings cache
//!
//! Keys are loaded from the store once at boot and then kept coherent by
//! `config.updated` events from the admin service. Readers dominate, so the
//! map sits behind a read-write lock; the only writer is the cache bus.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::application::ports::outbound::{ConfigStorePort, RepositoryError};

pub struct DynamicConfigService {
    store: Arc<dyn ConfigStorePort>,
    cache: RwLock<HashMap<String, String>>,
}

impl DynamicConfigService {
    pub fn new(store: Arc<dyn ConfigStorePort>) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Initial snapshot load; called once at process start.
    pub async fn load(&self) -> Result<usize, RepositoryError> {
        let entries = self.store.load_all().await?;
        let mut cache = self.cache.write().await;
        cache.clear();
        for (key, value) in entries {
            cache.insert(key, value);
        }
        Ok(cache.len())
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        self.cache.read().await.get(key).cloned()
    }

    /// Positive-integer lookup with a cached default for missing or
    /// unparsable values.
    pub async fn get_positive_int(&self, key: &str, default: i64) -> i64 {
        match self.get(key).await {
            Some(raw) => match raw.parse::<i64>() {
                Ok(v) if v > 0 => v,
                _ => {
                    tracing::warn!(key, %raw, "dynamic config value is not a positive integer, using default");
                    default
                }
            },
            None => default,
        }
    }

    pub async fn get_f64(&self, key: &str, default: f64) -> f64 {
        match self.get(key).await {
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                tracing::warn!(key, %raw, "dynamic config value is not a number, using default");
                default
            }),
            None => default,
        }
    }

    /// Writer side of the cache bus.
    pub async fn apply_update(&self, key: String, value: String) {
        tracing::debug!(key, "applying dynamic config update");
        self.cache.write().await.insert(key, value);
    }
}
