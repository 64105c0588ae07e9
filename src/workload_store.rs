//! Admin-cluster access to Workload objects.

use std::collections::BTreeMap;

use async_trait::async_trait;
use kube::api::{ListParams, Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use serde_json::json;

use crate::crd::Workload;
use crate::error::Result;

#[async_trait]
pub trait WorkloadStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<Workload>>;

    async fn list(&self) -> Result<Vec<Workload>>;

    /// Write the workload's status and return the stored object. The write is
    /// rejected with a conflict if the stored object changed since `workload`
    /// was read.
    async fn update_status(&self, workload: &Workload) -> Result<Workload>;

    /// Merge annotations; a `None` value removes the key.
    async fn patch_annotations(
        &self,
        name: &str,
        annotations: BTreeMap<String, Option<String>>,
    ) -> Result<()>;
}

pub struct KubeWorkloadStore {
    api: Api<Workload>,
}

impl KubeWorkloadStore {
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl WorkloadStore for KubeWorkloadStore {
    async fn get(&self, name: &str) -> Result<Option<Workload>> {
        Ok(self.api.get_opt(name).await?)
    }

    async fn list(&self) -> Result<Vec<Workload>> {
        Ok(self.api.list(&ListParams::default()).await?.items)
    }

    async fn update_status(&self, workload: &Workload) -> Result<Workload> {
        let patch = json!({
            "metadata": { "resourceVersion": workload.resource_version() },
            "status": workload.status,
        });
        Ok(self
            .api
            .patch_status(&workload.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?)
    }

    async fn patch_annotations(
        &self,
        name: &str,
        annotations: BTreeMap<String, Option<String>>,
    ) -> Result<()> {
        let patch = json!({ "metadata": { "annotations": annotations } });
        self.api
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}
