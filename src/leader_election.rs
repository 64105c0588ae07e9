//! Lease-based leader election.
//!
//! Only the replica holding the Lease runs the controllers. Standby replicas
//! block in [`LeaderElector::acquire`] until the holder stops renewing and the
//! lease expires.

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lease name and timings.
#[derive(Debug, Clone)]
pub struct LeaderElectionConfig {
    pub lease_name: String,
    pub namespace: String,
    pub lease_duration: Duration,
    pub renew_interval: Duration,
    pub retry_interval: Duration,
}

impl Default for LeaderElectionConfig {
    fn default() -> Self {
        Self {
            lease_name: "primus-safe-controller-leader".to_string(),
            namespace: String::new(),
            lease_duration: Duration::from_secs(15),
            renew_interval: Duration::from_secs(10),
            retry_interval: Duration::from_secs(5),
        }
    }
}

/// Detects the namespace for leader election.
///
/// Priority: explicit argument, then the service account file, then `"default"`.
pub fn detect_namespace(explicit: &str) -> String {
    if !explicit.is_empty() {
        return explicit.to_string();
    }
    std::fs::read_to_string("/var/run/secrets/kubernetes.io/serviceaccount/namespace")
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "default".to_string())
}

/// What to do with the lease as observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeaseAction {
    Renew,
    TakeOver,
    Wait,
}

fn decide(spec: Option<&LeaseSpec>, identity: &str, now: DateTime<Utc>, default_duration: Duration) -> LeaseAction {
    let holder = spec.and_then(|s| s.holder_identity.as_deref());
    if holder == Some(identity) {
        return LeaseAction::Renew;
    }
    if holder.is_none() || is_expired(spec, now, default_duration) {
        return LeaseAction::TakeOver;
    }
    LeaseAction::Wait
}

fn is_expired(spec: Option<&LeaseSpec>, now: DateTime<Utc>, default_duration: Duration) -> bool {
    let duration_secs = spec
        .and_then(|s| s.lease_duration_seconds)
        .map(i64::from)
        .unwrap_or(default_duration.as_secs() as i64);
    match spec.and_then(|s| s.renew_time.as_ref()) {
        Some(MicroTime(t)) => now.signed_duration_since(*t).num_seconds() > duration_secs,
        None => true,
    }
}

/// Holds or waits for the controller Lease, with optimistic concurrency on
/// the Lease's `resourceVersion`.
pub struct LeaderElector {
    lease_api: Api<Lease>,
    identity: String,
    config: LeaderElectionConfig,
}

impl LeaderElector {
    pub fn new(client: Client, config: LeaderElectionConfig) -> Self {
        let lease_api = Api::<Lease>::namespaced(client, &config.namespace);
        let identity = std::env::var("POD_NAME")
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_else(|_| format!("primus-safe-{:08x}", rand::random::<u32>()));
        info!(identity = %identity, namespace = %config.namespace, lease = %config.lease_name, "Initialized leader elector");
        Self {
            lease_api,
            identity,
            config,
        }
    }

    /// Blocks until the lease is acquired.
    pub async fn acquire(&self) -> anyhow::Result<()> {
        info!(identity = %self.identity, lease = %self.config.lease_name, "Waiting to acquire leader lease");
        loop {
            match self.try_acquire().await {
                Ok(true) => {
                    info!(identity = %self.identity, "Acquired leader lease");
                    return Ok(());
                }
                Ok(false) => {
                    debug!(retry_in = ?self.config.retry_interval, "Lease held by another instance");
                }
                Err(e) => {
                    warn!(error = %e, retry_in = ?self.config.retry_interval, "Lease acquisition error");
                }
            }
            tokio::time::sleep(self.config.retry_interval).await;
        }
    }

    /// Renew until leadership is lost or `token` is cancelled. Losing the
    /// lease cancels `token` so every controller stops.
    pub async fn keep_renewing(&self, token: CancellationToken) {
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(self.config.renew_interval) => {}
            }
            match self.renew().await {
                Ok(true) => {}
                Ok(false) => {
                    error!("Lost leader lease");
                    token.cancel();
                    return;
                }
                Err(e) => {
                    error!(error = %e, "Failed to renew leader lease");
                    token.cancel();
                    return;
                }
            }
        }
    }

    /// Returns `Ok(true)` if still leader, `Ok(false)` if lost.
    pub async fn renew(&self) -> anyhow::Result<bool> {
        let lease = self.lease_api.get(&self.config.lease_name).await?;
        let holder = lease
            .spec
            .as_ref()
            .and_then(|s| s.holder_identity.as_deref());
        if holder != Some(self.identity.as_str()) {
            return Ok(false);
        }

        let mut updated = lease.clone();
        if let Some(ref mut spec) = updated.spec {
            spec.renew_time = Some(MicroTime(Utc::now()));
        }
        self.replace(&updated).await
    }

    /// Clears the holder identity so a standby replica can take over at once.
    pub async fn release(&self) {
        info!(identity = %self.identity, "Releasing leader lease");
        let lease = match self.lease_api.get(&self.config.lease_name).await {
            Ok(l) => l,
            Err(e) => {
                warn!(error = %e, "Failed to read lease for release");
                return;
            }
        };

        let holder = lease
            .spec
            .as_ref()
            .and_then(|s| s.holder_identity.as_deref());
        if holder != Some(self.identity.as_str()) {
            debug!("Lease not held by us, skipping release");
            return;
        }

        let mut updated = lease.clone();
        if let Some(ref mut spec) = updated.spec {
            spec.holder_identity = None;
        }
        match self.replace(&updated).await {
            Ok(true) => info!("Released leader lease"),
            Ok(false) => warn!("Lease changed while releasing"),
            Err(e) => warn!(error = %e, "Failed to release leader lease"),
        }
    }

    async fn try_acquire(&self) -> anyhow::Result<bool> {
        let now = Utc::now();
        match self.lease_api.get_opt(&self.config.lease_name).await? {
            Some(existing) => {
                match decide(existing.spec.as_ref(), &self.identity, now, self.config.lease_duration) {
                    LeaseAction::Renew => self.update_lease(&existing, now, false).await,
                    LeaseAction::TakeOver => self.update_lease(&existing, now, true).await,
                    LeaseAction::Wait => Ok(false),
                }
            }
            None => self.create_lease(now).await,
        }
    }

    fn lease_duration_secs(&self) -> i32 {
        self.config.lease_duration.as_secs() as i32
    }

    async fn create_lease(&self, now: DateTime<Utc>) -> anyhow::Result<bool> {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.config.lease_name.clone()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(self.lease_duration_secs()),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(0),
                ..Default::default()
            }),
        };
        match self.lease_api.create(&PostParams::default(), &lease).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn update_lease(&self, existing: &Lease, now: DateTime<Utc>, takeover: bool) -> anyhow::Result<bool> {
        let prev = existing.spec.as_ref();
        let transitions = prev.and_then(|s| s.lease_transitions).unwrap_or(0);

        let mut updated = existing.clone();
        updated.spec = Some(LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(self.lease_duration_secs()),
            acquire_time: if takeover {
                Some(MicroTime(now))
            } else {
                prev.and_then(|s| s.acquire_time.clone())
            },
            renew_time: Some(MicroTime(now)),
            lease_transitions: Some(if takeover { transitions + 1 } else { transitions }),
            ..Default::default()
        });
        self.replace(&updated).await
    }

    /// Replace the lease; a resourceVersion conflict means someone else won.
    async fn replace(&self, lease: &Lease) -> anyhow::Result<bool> {
        match self
            .lease_api
            .replace(&self.config.lease_name, &PostParams::default(), lease)
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DURATION: Duration = Duration::from_secs(15);

    fn spec(holder: Option<&str>, renewed_secs_ago: i64, now: DateTime<Utc>) -> LeaseSpec {
        LeaseSpec {
            holder_identity: holder.map(str::to_string),
            lease_duration_seconds: Some(15),
            renew_time: Some(MicroTime(now - chrono::Duration::seconds(renewed_secs_ago))),
            ..Default::default()
        }
    }

    #[test]
    fn test_own_lease_is_renewed() {
        let now = Utc::now();
        let s = spec(Some("me"), 100, now);
        assert_eq!(decide(Some(&s), "me", now, DURATION), LeaseAction::Renew);
    }

    #[test]
    fn test_live_foreign_lease_waits() {
        let now = Utc::now();
        let s = spec(Some("other"), 5, now);
        assert_eq!(decide(Some(&s), "me", now, DURATION), LeaseAction::Wait);
    }

    #[test]
    fn test_expired_or_released_lease_is_taken_over() {
        let now = Utc::now();
        let expired = spec(Some("other"), 16, now);
        assert_eq!(decide(Some(&expired), "me", now, DURATION), LeaseAction::TakeOver);

        let released = spec(None, 1, now);
        assert_eq!(decide(Some(&released), "me", now, DURATION), LeaseAction::TakeOver);
    }

    #[test]
    fn test_missing_renew_time_is_expired() {
        let now = Utc::now();
        assert!(is_expired(None, now, DURATION));
        let s = LeaseSpec {
            holder_identity: Some("other".to_string()),
            ..Default::default()
        };
        assert!(is_expired(Some(&s), now, DURATION));
    }

    #[test]
    fn test_detect_namespace_prefers_explicit() {
        assert_eq!(detect_namespace("primus-safe"), "primus-safe");
    }
}
