//! Workload Flow Controller
//!
//! Enforces dependency ordering between workloads. When a workload ends, every
//! workload that lists it in `spec.dependencies` has the phase recorded; a
//! failed upstream fails its dependents, a successful one re-queues them so the
//! dependency gate can report them ready.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use kube::runtime::watcher;
use kube::{Api, Client, ResourceExt};
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::conditions::set_workload_failed;
use crate::crd::{Workload, WorkloadPhase};
use crate::error::Result;
use crate::informer::{run_watch, Change, ChangeHandler, ObjectCache};
use crate::workload_store::WorkloadStore;
use crate::workqueue::{Handler, RateLimitedController, RateLimitingQueue, ReconcileResult};

/// Forward and reverse dependency edges of every observed workload.
#[derive(Default)]
pub struct DependencyIndex {
    inner: RwLock<Edges>,
}

#[derive(Default)]
struct Edges {
    dependencies: HashMap<String, Vec<String>>,
    dependents: HashMap<String, HashSet<String>>,
}

impl DependencyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the current dependencies of `workload`, replacing older edges.
    pub fn upsert(&self, workload: &Workload) {
        let name = workload.name_any();
        let mut edges = self.inner.write();
        edges.unlink(&name);
        for dep in &workload.spec.dependencies {
            edges
                .dependents
                .entry(dep.clone())
                .or_default()
                .insert(name.clone());
        }
        edges
            .dependencies
            .insert(name, workload.spec.dependencies.clone());
    }

    pub fn remove(&self, name: &str) {
        self.inner.write().unlink(name);
    }

    /// Workloads that list `name` as a dependency, sorted.
    pub fn dependents_of(&self, name: &str) -> Vec<String> {
        let edges = self.inner.read();
        let mut out: Vec<String> = edges
            .dependents
            .get(name)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        out.sort();
        out
    }

    /// A dependency path that leads from `name` back to itself, if any.
    /// Only workloads already in the index are followed.
    pub fn find_cycle(&self, name: &str) -> Option<Vec<String>> {
        let edges = self.inner.read();
        let mut path = vec![name.to_string()];
        let mut visited = HashSet::new();
        if edges.reaches(name, name, &mut path, &mut visited) {
            Some(path)
        } else {
            None
        }
    }
}

impl Edges {
    fn unlink(&mut self, name: &str) {
        let Some(old) = self.dependencies.remove(name) else {
            return;
        };
        for dep in old {
            if let Some(set) = self.dependents.get_mut(&dep) {
                set.remove(name);
                if set.is_empty() {
                    self.dependents.remove(&dep);
                }
            }
        }
    }

    fn reaches(
        &self,
        from: &str,
        target: &str,
        path: &mut Vec<String>,
        visited: &mut HashSet<String>,
    ) -> bool {
        let Some(deps) = self.dependencies.get(from) else {
            return false;
        };
        for dep in deps {
            path.push(dep.clone());
            if dep == target {
                return true;
            }
            if visited.insert(dep.clone()) && self.reaches(dep, target, path, visited) {
                return true;
            }
            path.pop();
        }
        false
    }
}

pub struct WorkloadFlow {
    workloads: Arc<dyn WorkloadStore>,
    index: DependencyIndex,
    observed: Mutex<HashSet<String>>,
}

impl WorkloadFlow {
    pub fn new(workloads: Arc<dyn WorkloadStore>) -> Self {
        Self {
            workloads,
            index: DependencyIndex::new(),
            observed: Mutex::new(HashSet::new()),
        }
    }

    pub fn index(&self) -> &DependencyIndex {
        &self.index
    }

    /// Apply one watched change. Returns the workloads to reconcile.
    pub async fn on_change(&self, change: &Change<Workload>) -> Vec<String> {
        match change {
            Change::Added(new) => self.on_observed(new).await,
            Change::Updated { old, new } => {
                self.index.upsert(new);
                if !old.is_end() && new.is_end() {
                    return self.cascade(new).await;
                }
                Vec::new()
            }
            Change::Deleted(old) => {
                let name = old.name_any();
                self.index.remove(&name);
                self.observed.lock().remove(&name);
                Vec::new()
            }
        }
    }

    async fn on_observed(&self, workload: &Workload) -> Vec<String> {
        let name = workload.name_any();
        self.index.upsert(workload);
        let first = self.observed.lock().insert(name.clone());
        if workload.is_end() {
            // Relists replay ended workloads; their dependents may still be waiting
            return self.index.dependents_of(&name);
        }
        if workload.spec.dependencies.is_empty() {
            return Vec::new();
        }
        if first {
            if let Some(cycle) = self.index.find_cycle(&name) {
                let message = format!("cyclic dependency: {}", cycle.join(" -> "));
                warn!(workload = %name, %message, "Failing workload");
                if let Err(e) = self.fail(&name, &message).await {
                    warn!(workload = %name, error = %e, "Failed to mark cyclic workload");
                }
                return Vec::new();
            }
        }
        vec![name]
    }

    /// Record the final phase of `upstream` on each of its dependents.
    async fn cascade(&self, upstream: &Workload) -> Vec<String> {
        let upstream_name = upstream.name_any();
        let phase = upstream.phase();
        let mut enqueue = Vec::new();
        for dependent in self.index.dependents_of(&upstream_name) {
            match self.propagate(&upstream_name, phase, &dependent).await {
                Ok(true) => enqueue.push(dependent),
                Ok(false) => {}
                Err(e) => {
                    warn!(workload = %dependent, upstream = %upstream_name, error = %e, "Failed to propagate dependency phase");
                    enqueue.push(dependent);
                }
            }
        }
        enqueue
    }

    async fn propagate(&self, upstream: &str, phase: WorkloadPhase, name: &str) -> Result<bool> {
        let Some(mut dependent) = self.workloads.get(name).await? else {
            return Ok(false);
        };
        if dependent.is_end() {
            return Ok(false);
        }
        dependent.set_dependencies_phase(upstream, phase);
        if phase != WorkloadPhase::Succeeded {
            let message = format!("dependency {upstream} finished with phase {}", phase.as_str());
            set_workload_failed(&mut dependent, &message);
            self.workloads.update_status(&dependent).await?;
            info!(workload = %name, upstream = %upstream, "Dependency failed, failing workload");
            return Ok(false);
        }
        self.workloads.update_status(&dependent).await?;
        debug!(workload = %name, upstream = %upstream, "Dependency succeeded");
        Ok(true)
    }

    async fn fail(&self, name: &str, message: &str) -> Result<()> {
        let Some(mut workload) = self.workloads.get(name).await? else {
            return Ok(());
        };
        if workload.is_end() {
            return Ok(());
        }
        set_workload_failed(&mut workload, message);
        self.workloads.update_status(&workload).await?;
        Ok(())
    }
}

/// Dependency gate: back-fills phases of already-ended dependencies, fails
/// workloads whose dependencies do not exist and reports readiness.
#[async_trait]
impl Handler<String> for WorkloadFlow {
    async fn reconcile(&self, name: String) -> Result<ReconcileResult> {
        let Some(mut workload) = self.workloads.get(&name).await? else {
            return Ok(ReconcileResult::done());
        };
        if workload.is_end() || workload.spec.dependencies.is_empty() {
            return Ok(ReconcileResult::done());
        }

        let mut changed = false;
        for dep in workload.spec.dependencies.clone() {
            if workload.dependencies_phase(&dep).is_some() {
                continue;
            }
            let Some(upstream) = self.workloads.get(&dep).await? else {
                set_workload_failed(&mut workload, &format!("dependency {dep} does not exist"));
                self.workloads.update_status(&workload).await?;
                return Ok(ReconcileResult::done());
            };
            if !upstream.is_end() {
                continue;
            }
            let phase = upstream.phase();
            workload.set_dependencies_phase(&dep, phase);
            changed = true;
            if phase != WorkloadPhase::Succeeded {
                let message = format!("dependency {dep} finished with phase {}", phase.as_str());
                set_workload_failed(&mut workload, &message);
                break;
            }
        }

        if changed {
            workload = self.workloads.update_status(&workload).await?;
        }
        if workload.is_dependencies_finish() {
            info!(workload = %name, "All dependencies succeeded");
        }
        Ok(ReconcileResult::done())
    }
}

/// Feeds watched workload changes into the flow and its queue.
pub struct WorkloadFlowWatch {
    flow: Arc<WorkloadFlow>,
    queue: RateLimitingQueue<String>,
}

impl WorkloadFlowWatch {
    pub fn new(flow: Arc<WorkloadFlow>, queue: RateLimitingQueue<String>) -> Self {
        Self { flow, queue }
    }
}

#[async_trait]
impl ChangeHandler<Workload> for WorkloadFlowWatch {
    async fn on_change(&self, change: Change<Workload>) {
        for name in self.flow.on_change(&change).await {
            self.queue.add(name);
        }
    }
}

/// Run the flow controller until `token` is cancelled.
pub async fn run(flow: Arc<WorkloadFlow>, client: Client, concurrency: usize, token: CancellationToken) {
    let engine = RateLimitedController::new(
        "workload-flow",
        Arc::clone(&flow) as Arc<dyn Handler<String>>,
        concurrency,
    );
    let watch = WorkloadFlowWatch::new(flow, engine.queue().clone());
    tokio::join!(
        run_watch(
            Api::<Workload>::all(client),
            watcher::Config::default(),
            Arc::new(ObjectCache::default()),
            Arc::new(watch),
            token.clone(),
        ),
        engine.start(token),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::fixtures::workload;
    use crate::crd::WorkloadStatus;
    use crate::workload_store::fake::FakeWorkloadStore;

    fn with_deps(name: &str, deps: &[&str]) -> Workload {
        let mut w = workload(name);
        w.spec.dependencies = deps.iter().map(|d| d.to_string()).collect();
        w
    }

    fn in_phase(mut w: Workload, phase: WorkloadPhase) -> Workload {
        w.status = Some(WorkloadStatus {
            phase: Some(phase),
            ..Default::default()
        });
        w
    }

    fn flow_with(store: &Arc<FakeWorkloadStore>, workloads: Vec<Workload>) -> Arc<WorkloadFlow> {
        let flow = Arc::new(WorkloadFlow::new(store.clone()));
        for w in workloads {
            flow.index().upsert(&w);
            store.put(w);
        }
        flow
    }

    #[test]
    fn test_index_reverse_lookup() {
        let index = DependencyIndex::new();
        index.upsert(&with_deps("b", &["a"]));
        index.upsert(&with_deps("c", &["a", "b"]));
        assert_eq!(index.dependents_of("a"), vec!["b", "c"]);
        assert_eq!(index.dependents_of("b"), vec!["c"]);

        // Re-indexing drops stale edges
        index.upsert(&with_deps("c", &["b"]));
        assert_eq!(index.dependents_of("a"), vec!["b"]);
        index.remove("b");
        assert!(index.dependents_of("a").is_empty());
    }

    #[test]
    fn test_find_cycle() {
        let index = DependencyIndex::new();
        index.upsert(&with_deps("a", &["c"]));
        index.upsert(&with_deps("b", &["a"]));
        assert!(index.find_cycle("b").is_none());

        index.upsert(&with_deps("c", &["b"]));
        assert_eq!(index.find_cycle("c").unwrap(), vec!["c", "b", "a", "c"]);
        assert!(index.find_cycle("x").is_none());
    }

    #[tokio::test]
    async fn test_failed_upstream_fails_dependent() {
        let store = Arc::new(FakeWorkloadStore::default());
        let a = in_phase(workload("a"), WorkloadPhase::Running);
        let flow = flow_with(&store, vec![a.clone(), with_deps("b", &["a"])]);

        let ended = in_phase(a.clone(), WorkloadPhase::Failed);
        let enqueue = flow
            .on_change(&Change::Updated {
                old: Arc::new(a),
                new: Arc::new(ended),
            })
            .await;

        assert!(enqueue.is_empty());
        let b = store.stored("b");
        assert_eq!(b.phase(), WorkloadPhase::Failed);
        assert_eq!(b.dependencies_phase("a"), Some(WorkloadPhase::Failed));
    }

    #[tokio::test]
    async fn test_succeeded_upstream_enqueues_dependent() {
        let store = Arc::new(FakeWorkloadStore::default());
        let a = in_phase(workload("a"), WorkloadPhase::Running);
        let flow = flow_with(&store, vec![a.clone(), with_deps("b", &["a"])]);

        let ended = in_phase(a.clone(), WorkloadPhase::Succeeded);
        let enqueue = flow
            .on_change(&Change::Updated {
                old: Arc::new(a),
                new: Arc::new(ended),
            })
            .await;

        assert_eq!(enqueue, vec!["b"]);
        let b = store.stored("b");
        assert_ne!(b.phase(), WorkloadPhase::Failed);
        assert_eq!(b.dependencies_phase("a"), Some(WorkloadPhase::Succeeded));
        assert!(b.is_dependencies_finish());
    }

    #[tokio::test]
    async fn test_update_without_transition_is_ignored() {
        let store = Arc::new(FakeWorkloadStore::default());
        let a = in_phase(workload("a"), WorkloadPhase::Failed);
        let flow = flow_with(&store, vec![a.clone(), with_deps("b", &["a"])]);

        let enqueue = flow
            .on_change(&Change::Updated {
                old: Arc::new(a.clone()),
                new: Arc::new(a),
            })
            .await;
        assert!(enqueue.is_empty());
        assert_eq!(store.stored("b").phase(), WorkloadPhase::Pending);
    }

    #[tokio::test]
    async fn test_cycle_fails_workload_on_first_observation() {
        let store = Arc::new(FakeWorkloadStore::default());
        let flow = Arc::new(WorkloadFlow::new(store.clone()));
        let a = with_deps("a", &["b"]);
        let b = with_deps("b", &["a"]);
        store.put(a.clone());
        store.put(b.clone());

        assert_eq!(flow.on_change(&Change::Added(Arc::new(a))).await, vec!["a"]);
        assert!(flow.on_change(&Change::Added(Arc::new(b))).await.is_empty());

        let b = store.stored("b");
        assert_eq!(b.phase(), WorkloadPhase::Failed);
        assert!(b.last_condition().unwrap().message.starts_with("cyclic dependency"));
    }

    #[tokio::test]
    async fn test_gate_backfills_and_reports_ready() {
        let store = Arc::new(FakeWorkloadStore::default());
        let flow = flow_with(
            &store,
            vec![
                in_phase(workload("a"), WorkloadPhase::Succeeded),
                in_phase(workload("b"), WorkloadPhase::Running),
                with_deps("c", &["a", "b"]),
            ],
        );

        flow.reconcile("c".to_string()).await.unwrap();
        let c = store.stored("c");
        assert_eq!(c.dependencies_phase("a"), Some(WorkloadPhase::Succeeded));
        assert_eq!(c.dependencies_phase("b"), None);
        assert!(!c.is_dependencies_finish());
    }

    #[tokio::test]
    async fn test_gate_fails_on_missing_dependency() {
        let store = Arc::new(FakeWorkloadStore::default());
        let flow = flow_with(&store, vec![with_deps("c", &["ghost"])]);

        flow.reconcile("c".to_string()).await.unwrap();
        let c = store.stored("c");
        assert_eq!(c.phase(), WorkloadPhase::Failed);
        assert!(c.last_condition().unwrap().message.contains("ghost"));
    }
}
