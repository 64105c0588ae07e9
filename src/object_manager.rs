//! Keyed registry of releasable objects.
//!
//! Holds long-lived handles (per-cluster informers, per-GVK watches, failover
//! policies) with a uniform lifecycle: whatever leaves the registry is
//! released first.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

use crate::error::{OperatorError, Result};

/// Something that owns resources which must be torn down on eviction.
pub trait Release: Send + Sync {
    fn release(&self) -> Result<()>;
}

/// Thread-safe map from key to `Arc<T>`.
///
/// `register` refuses duplicates, `upsert` replaces (releasing the previous
/// value). Release failures are logged and never block the mutation.
pub struct ObjectManager<T: Release + ?Sized> {
    objects: RwLock<HashMap<String, Arc<T>>>,
}

impl<T: Release + ?Sized> Default for ObjectManager<T> {
    fn default() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
        }
    }
}

impl<T: Release + ?Sized> ObjectManager<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `obj` under `key`; fails if the key is already present.
    pub fn register(&self, key: &str, obj: Arc<T>) -> Result<()> {
        let mut objects = self.objects.write();
        if objects.contains_key(key) {
            return Err(OperatorError::Conflict(format!(
                "object {key} is already registered"
            )));
        }
        objects.insert(key.to_string(), obj);
        Ok(())
    }

    /// Insert `obj` under `key`, releasing any previous value first.
    pub fn upsert(&self, key: &str, obj: Arc<T>) {
        let mut objects = self.objects.write();
        if let Some(old) = objects.remove(key) {
            release_logged(key, &old);
        }
        objects.insert(key.to_string(), obj);
    }

    /// Release and remove the value under `key`. Returns whether one existed.
    pub fn delete(&self, key: &str) -> bool {
        let mut objects = self.objects.write();
        match objects.remove(key) {
            Some(old) => {
                release_logged(key, &old);
                true
            }
            None => false,
        }
    }

    /// Release and remove every value.
    pub fn clear(&self) {
        let mut objects = self.objects.write();
        for (key, obj) in objects.drain() {
            release_logged(&key, &obj);
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<T>> {
        self.objects.read().get(key).cloned()
    }

    pub fn has(&self, key: &str) -> bool {
        self.objects.read().contains_key(key)
    }

    pub fn get_all(&self) -> Vec<(String, Arc<T>)> {
        self.objects
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect()
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

fn release_logged<T: Release + ?Sized>(key: &str, obj: &Arc<T>) {
    if let Err(e) = obj.release() {
        warn!(key = %key, error = %e, "Failed to release object");
    }
}
