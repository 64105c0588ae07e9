//! Primus-SaFE controllers
//!
//! Multi-cluster workload dispatch plumbing for GPU clusters: per-cluster
//! dynamic informers driven by ResourceTemplates, a syncer mirroring
//! data-plane object state onto admin Workloads, failover, dependency-ordered
//! workload flow, and an exporter mirroring admin objects into PostgreSQL.
//!
//! ## Custom Resources
//!
//! - `Workload`: a unit of work dispatched to one data-plane cluster
//! - `Fault`: a detected node problem, keyed by monitor id
//! - `ResourceTemplate`: how to read an arbitrary resource kind
//! - `Cluster`, `Workspace`, `Node`: admin-cluster topology
//!
//! ## Example
//!
//! ```yaml
//! apiVersion: amd.com/v1
//! kind: Workload
//! metadata:
//!   name: train-llm
//! spec:
//!   workspace: team-a
//!   groupVersionKind: {group: batch, version: v1, kind: Job}
//!   maxRetry: 2
//!   dependencies: [prepare-data]
//! ```

pub mod conditions;
pub mod controllers;
pub mod crd;
pub mod error;
pub mod exporter;
pub mod informer;
pub mod leader_election;
pub mod object_manager;
pub mod retry;
pub mod unstructured;
pub mod workload_store;
pub mod workqueue;

pub use controllers::{
    ClusterController, ClusterLifecycle, Dispatcher, FailoverController, FailoverPolicies, Syncer,
    WorkloadFlow,
};
pub use crd::{
    Cluster, Fault, GroupVersionKind, ResourceTemplate, Workload, WorkloadPhase, WorkloadSpec,
    WorkloadStatus,
};
pub use error::{OperatorError, Result};
