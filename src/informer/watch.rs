//! Watch loop with a local object cache.
//!
//! Turns the raw watcher event stream into add/update/delete changes, keeping
//! the last seen version of every object so updates carry the old object and
//! relists surface deletions that happened while the watch was down.

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::pin::pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use kube::runtime::watcher::{self, watcher, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Resource, ResourceExt};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// One observed change of a watched object.
#[derive(Debug, Clone)]
pub enum Change<K> {
    Added(Arc<K>),
    Updated { old: Arc<K>, new: Arc<K> },
    Deleted(Arc<K>),
}

impl<K> Change<K> {
    /// The current object, or the last known one for a deletion.
    pub fn object(&self) -> &Arc<K> {
        match self {
            Change::Added(obj) | Change::Deleted(obj) => obj,
            Change::Updated { new, .. } => new,
        }
    }
}

/// Receives the changes of one watch, in order.
#[async_trait]
pub trait ChangeHandler<K>: Send + Sync {
    async fn on_change(&self, change: Change<K>);
}

/// Cache key: `namespace/name` for namespaced objects, `name` otherwise.
pub fn object_key(name: &str, namespace: Option<&str>) -> String {
    match namespace {
        Some(ns) if !ns.is_empty() => format!("{ns}/{name}"),
        _ => name.to_string(),
    }
}

/// Last seen version of every watched object.
pub struct ObjectCache<K> {
    objects: RwLock<HashMap<String, Arc<K>>>,
    relisted: Mutex<Option<HashSet<String>>>,
}

impl<K> Default for ObjectCache<K> {
    fn default() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
            relisted: Mutex::new(None),
        }
    }
}

impl<K: Resource + Clone> ObjectCache<K> {
    pub fn get(&self, name: &str, namespace: Option<&str>) -> Option<Arc<K>> {
        self.objects.read().get(&object_key(name, namespace)).cloned()
    }

    pub fn list(&self) -> Vec<Arc<K>> {
        self.objects.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    fn upsert(&self, obj: K) -> Change<K> {
        let key = object_key(&obj.name_any(), obj.namespace().as_deref());
        let new = Arc::new(obj);
        match self.objects.write().insert(key, Arc::clone(&new)) {
            Some(old) => Change::Updated { old, new },
            None => Change::Added(new),
        }
    }

    /// Fold one watcher event into the cache and return the resulting changes.
    pub fn apply(&self, event: Event<K>) -> Vec<Change<K>> {
        match event {
            Event::Apply(obj) => vec![self.upsert(obj)],
            Event::Delete(obj) => {
                let key = object_key(&obj.name_any(), obj.namespace().as_deref());
                let last = self.objects.write().remove(&key);
                vec![Change::Deleted(last.unwrap_or_else(|| Arc::new(obj)))]
            }
            Event::Init => {
                *self.relisted.lock() = Some(HashSet::new());
                Vec::new()
            }
            Event::InitApply(obj) => {
                let key = object_key(&obj.name_any(), obj.namespace().as_deref());
                if let Some(seen) = self.relisted.lock().as_mut() {
                    seen.insert(key);
                }
                vec![self.upsert(obj)]
            }
            Event::InitDone => {
                let Some(seen) = self.relisted.lock().take() else {
                    return Vec::new();
                };
                let mut objects = self.objects.write();
                let gone: Vec<String> = objects
                    .keys()
                    .filter(|k| !seen.contains(*k))
                    .cloned()
                    .collect();
                gone.iter()
                    .filter_map(|k| objects.remove(k))
                    .map(Change::Deleted)
                    .collect()
            }
        }
    }
}

/// Watch `api` until `token` is cancelled, feeding changes to `handler`.
/// Watch errors are retried with the watcher's default backoff.
pub async fn run_watch<K>(
    api: Api<K>,
    config: watcher::Config,
    cache: Arc<ObjectCache<K>>,
    handler: Arc<dyn ChangeHandler<K>>,
    token: CancellationToken,
) where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    let mut stream = pin!(watcher(api, config).default_backoff());
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            next = stream.next() => match next {
                Some(Ok(event)) => {
                    for change in cache.apply(event) {
                        handler.on_change(change).await;
                    }
                }
                Some(Err(e)) => warn!(error = %e, "Watch stream error"),
                None => break,
            },
        }
    }
    debug!("Watch stopped");
}
