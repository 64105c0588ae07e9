//! Failover policies loaded from a ConfigMap.
//!
//! Every data entry of the ConfigMap is one JSON-encoded [`FailoverConfig`].
//! Policies are keyed by the lowercased monitor id they apply to.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::object_manager::{ObjectManager, Release};

/// Restart every workload running on the faulty node.
pub const GLOBAL_RESTART: &str = "global_restart";

/// Failover policy for one fault type. `key` is accepted as a deprecated
/// spelling of `id`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverConfig {
    #[serde(default, alias = "key")]
    pub id: String,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub force: bool,
}

impl FailoverConfig {
    pub fn is_global_restart(&self) -> bool {
        self.action == GLOBAL_RESTART
    }
}

impl Release for FailoverConfig {
    fn release(&self) -> Result<()> {
        debug!(id = %self.id, "Dropping failover policy");
        Ok(())
    }
}

/// Current failover policies. The ConfigMap is the only source of truth: each
/// snapshot fully replaces the previous one.
#[derive(Default)]
pub struct FailoverPolicies {
    configs: ObjectManager<FailoverConfig>,
    last_data: Mutex<Option<BTreeMap<String, String>>>,
}

impl FailoverPolicies {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, monitor_id: &str) -> Option<Arc<FailoverConfig>> {
        self.configs.get(&monitor_id.to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.configs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }

    /// Apply one ConfigMap snapshot. Unchanged entries keep their stored
    /// value; entries missing from the snapshot are dropped. Malformed entries
    /// are skipped.
    pub fn apply(&self, data: &BTreeMap<String, String>) {
        let mut last = self.last_data.lock();
        if last.as_ref() == Some(data) {
            return;
        }

        let mut latest = BTreeMap::new();
        for (key, raw) in data {
            match serde_json::from_str::<FailoverConfig>(raw) {
                Ok(mut config) => {
                    if config.id.is_empty() {
                        config.id = key.clone();
                    }
                    latest.insert(config.id.to_lowercase(), config);
                }
                Err(e) => warn!(key = %key, error = %e, "Skipping malformed failover config"),
            }
        }

        apply_snapshot(&self.configs, latest);
        *last = Some(data.clone());
        info!(policies = self.configs.len(), "Loaded failover policies");
    }

    /// Drop every policy, e.g. when the ConfigMap is deleted.
    pub fn clear(&self) {
        *self.last_data.lock() = None;
        self.configs.clear();
        info!("Cleared failover policies");
    }
}

/// Make `manager` hold exactly `latest`. Entries equal to the stored value
/// are kept as they are; removed and changed entries are released.
fn apply_snapshot<T: Release + PartialEq>(manager: &ObjectManager<T>, latest: BTreeMap<String, T>) {
    for key in manager.keys() {
        if !latest.contains_key(&key) {
            manager.delete(&key);
        }
    }
    for (key, value) in latest {
        if manager.get(&key).as_deref() == Some(&value) {
            continue;
        }
        manager.upsert(&key, Arc::new(value));
    }
}
