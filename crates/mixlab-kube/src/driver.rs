use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{Pod, ReplicationController, Service};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::core::NamespaceResourceScope;
use kube::{Client, Config, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::Path;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use mixlab_core::workload::APP_LABEL;
use mixlab_core::{BuildError, Manifest, ResourceKind};

pub const FIELD_MANAGER: &str = "mixlab";
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("timed out after {timeout:?} waiting for {what}")]
    Timeout { what: String, timeout: Duration },
    #[error("{op} is not supported for {kind}")]
    Unsupported {
        kind: ResourceKind,
        op: &'static str,
    },
    #[error("kube config: {0}")]
    Config(String),
    #[error("invalid descriptor: {0}")]
    Invalid(#[from] BuildError),
    #[error(transparent)]
    Kube(#[from] kube::Error),
}

impl DriverError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, DriverError::Timeout { .. })
    }
}

fn is_status(err: &kube::Error, code: u16) -> bool {
    matches!(err, kube::Error::Api(e) if e.code == code)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOptions {
    /// Server-side dry run; nothing is persisted.
    pub dry_run: bool,
    /// Patch the existing object instead of failing on AlreadyExists.
    pub exist_ok: bool,
}

/// A pod status condition to wait for, e.g. `Ready=True`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionMatch {
    pub type_: String,
    pub status: String,
}

impl ConditionMatch {
    pub fn new(type_: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            type_: type_.into(),
            status: status.into(),
        }
    }

    pub fn ready(ready: bool) -> Self {
        Self::new("Ready", if ready { "True" } else { "False" })
    }
}

impl Default for ConditionMatch {
    fn default() -> Self {
        Self::ready(true)
    }
}

/// Named resources grouped by kind. Iteration follows teardown order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceBundle(BTreeMap<ResourceKind, Vec<String>>);

impl ResourceBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, kind: ResourceKind, name: impl Into<String>) {
        let name = name.into();
        let names = self.0.entry(kind).or_default();
        if !names.contains(&name) {
            names.push(name);
        }
    }

    pub fn from_manifests<'a, I>(manifests: I) -> Self
    where
        I: IntoIterator<Item = &'a Manifest>,
    {
        let mut bundle = Self::new();
        for m in manifests {
            bundle.insert(m.kind(), m.name());
        }
        bundle
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(Vec::is_empty)
    }

    pub fn len(&self) -> usize {
        self.0.values().map(Vec::len).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ResourceKind, &str)> {
        self.0
            .iter()
            .flat_map(|(kind, names)| names.iter().map(move |n| (*kind, n.as_str())))
    }
}

impl FromIterator<(ResourceKind, String)> for ResourceBundle {
    fn from_iter<T: IntoIterator<Item = (ResourceKind, String)>>(iter: T) -> Self {
        let mut bundle = Self::new();
        for (kind, name) in iter {
            bundle.insert(kind, name);
        }
        bundle
    }
}

/// Narrows the namespace-wide emptiness checks. An object is ignored when
/// its `app` label is in `exclude_apps` or its name is in `exclude_names`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectFilter {
    pub exclude_apps: Vec<String>,
    pub exclude_names: Vec<String>,
}

impl ObjectFilter {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn exclude_app(mut self, app: impl Into<String>) -> Self {
        self.exclude_apps.push(app.into());
        self
    }

    pub fn exclude_name(mut self, name: impl Into<String>) -> Self {
        self.exclude_names.push(name.into());
        self
    }

    pub fn label_selector(&self) -> Option<String> {
        (!self.exclude_apps.is_empty())
            .then(|| format!("{} notin ({})", APP_LABEL, self.exclude_apps.join(",")))
    }

    pub fn field_selector(&self) -> Option<String> {
        (!self.exclude_names.is_empty()).then(|| {
            self.exclude_names
                .iter()
                .map(|n| format!("metadata.name!={}", n))
                .collect::<Vec<_>>()
                .join(",")
        })
    }

    fn list_params(&self) -> ListParams {
        let mut params = ListParams::default().limit(1);
        if let Some(labels) = self.label_selector() {
            params = params.labels(&labels);
        }
        if let Some(fields) = self.field_selector() {
            params = params.fields(&fields);
        }
        params
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteSummary {
    pub deleted: usize,
    pub missing: usize,
    pub failed: usize,
}

/// The cluster operations the experiment runner depends on.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    async fn apply(
        &self,
        manifest: &Manifest,
        namespace: &str,
        options: ApplyOptions,
    ) -> Result<(), DriverError>;

    /// Best effort: 404s count as missing, other failures are logged and
    /// skipped.
    async fn delete_resources(
        &self,
        bundle: &ResourceBundle,
        namespace: &str,
    ) -> Result<DeleteSummary, DriverError>;

    async fn wait_for_cleanup(
        &self,
        bundle: &ResourceBundle,
        namespace: &str,
        timeout: Duration,
    ) -> Result<(), DriverError>;

    async fn wait_for_rollout(
        &self,
        kind: ResourceKind,
        name: &str,
        namespace: &str,
        timeout: Duration,
        condition: Option<&ConditionMatch>,
    ) -> Result<(), DriverError>;

    async fn poll_ns_has_objects(
        &self,
        namespace: &str,
        kinds: &[ResourceKind],
        filter: &ObjectFilter,
    ) -> Result<bool, DriverError>;

    async fn wait_for_empty(
        &self,
        namespace: &str,
        kinds: &[ResourceKind],
        filter: &ObjectFilter,
        timeout: Duration,
    ) -> Result<(), DriverError>;
}

trait Namespaced:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + DeserializeOwned
    + Serialize
    + Send
    + Sync
    + 'static
{
}

impl<K> Namespaced for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + DeserializeOwned
        + Serialize
        + Send
        + Sync
        + 'static
{
}

/// Kubernetes implementation of [`Orchestrator`] over an explicit client.
#[derive(Clone)]
pub struct KubeDriver {
    client: Client,
    poll_interval: Duration,
}

impl KubeDriver {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Builds a client from `kube_config` (or the default kubeconfig) and an
    /// optional context. With neither given, in-cluster and default
    /// inference apply.
    pub async fn connect(
        kube_config: Option<&Path>,
        context: Option<String>,
    ) -> Result<Self, DriverError> {
        let options = KubeConfigOptions {
            context,
            ..Default::default()
        };
        let config = match kube_config {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path)
                    .map_err(|e| DriverError::Config(format!("{}: {}", path.display(), e)))?;
                Config::from_custom_kubeconfig(kubeconfig, &options)
                    .await
                    .map_err(|e| DriverError::Config(e.to_string()))?
            }
            None if options.context.is_some() => Config::from_kubeconfig(&options)
                .await
                .map_err(|e| DriverError::Config(e.to_string()))?,
            None => Config::infer()
                .await
                .map_err(|e| DriverError::Config(e.to_string()))?,
        };
        let client = Client::try_from(config)?;
        Ok(Self::new(client))
    }

    fn api<K: Namespaced>(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn create_or_patch<K: Namespaced>(
        &self,
        obj: &K,
        namespace: &str,
        options: ApplyOptions,
    ) -> Result<(), DriverError> {
        let mut obj = obj.clone();
        obj.meta_mut().namespace = Some(namespace.to_string());
        let name = obj.meta().name.clone().unwrap_or_default();
        let api = self.api::<K>(namespace);
        let post = PostParams {
            dry_run: options.dry_run,
            field_manager: Some(FIELD_MANAGER.to_string()),
        };
        match api.create(&post, &obj).await {
            Ok(_) => {
                debug!(kind = %K::kind(&()), %name, %namespace, dry_run = options.dry_run, "created");
                Ok(())
            }
            Err(e) if options.exist_ok && is_status(&e, 409) => {
                debug!(kind = %K::kind(&()), %name, %namespace, "already exists, patching");
                api.patch(&name, &self.patch_params(options.dry_run), &Patch::Strategic(&obj))
                    .await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn patch_params(&self, dry_run: bool) -> PatchParams {
        let mut params = PatchParams::default();
        params.dry_run = dry_run;
        params.field_manager = Some(FIELD_MANAGER.to_string());
        params
    }

    async fn patch_one<K: Namespaced>(&self, obj: &K, namespace: &str) -> Result<(), DriverError> {
        let name = obj.meta().name.clone().unwrap_or_default();
        self.api::<K>(namespace)
            .patch(&name, &self.patch_params(false), &Patch::Strategic(obj))
            .await?;
        Ok(())
    }

    async fn replace_one<K: Namespaced>(&self, obj: &K, namespace: &str) -> Result<(), DriverError> {
        let api = self.api::<K>(namespace);
        let name = obj.meta().name.clone().unwrap_or_default();
        let current = api.get(&name).await?;
        let mut obj = obj.clone();
        obj.meta_mut().namespace = Some(namespace.to_string());
        obj.meta_mut().resource_version = current.meta().resource_version.clone();
        api.replace(&name, &PostParams::default(), &obj).await?;
        Ok(())
    }

    /// Strategic-merge patch of an existing object.
    pub async fn patch(&self, manifest: &Manifest, namespace: &str) -> Result<(), DriverError> {
        match manifest {
            Manifest::Pod(o) => self.patch_one(o, namespace).await,
            Manifest::StatefulSet(o) => self.patch_one(o, namespace).await,
            Manifest::Deployment(o) => self.patch_one(o, namespace).await,
            Manifest::DaemonSet(o) => self.patch_one(o, namespace).await,
            Manifest::Job(o) => self.patch_one(o, namespace).await,
            Manifest::Service(o) => self.patch_one(o, namespace).await,
        }
    }

    /// Full replacement at the current resource version.
    pub async fn replace(&self, manifest: &Manifest, namespace: &str) -> Result<(), DriverError> {
        match manifest {
            Manifest::Pod(o) => self.replace_one(o, namespace).await,
            Manifest::StatefulSet(o) => self.replace_one(o, namespace).await,
            Manifest::Deployment(o) => self.replace_one(o, namespace).await,
            Manifest::DaemonSet(o) => self.replace_one(o, namespace).await,
            Manifest::Job(o) => self.replace_one(o, namespace).await,
            Manifest::Service(o) => self.replace_one(o, namespace).await,
        }
    }

    async fn delete_one<K: Namespaced>(&self, name: &str, namespace: &str) -> Result<(), kube::Error> {
        self.api::<K>(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
    }

    async fn delete_named(
        &self,
        kind: ResourceKind,
        name: &str,
        namespace: &str,
    ) -> Result<(), kube::Error> {
        match kind {
            ResourceKind::Deployment => self.delete_one::<Deployment>(name, namespace).await,
            ResourceKind::StatefulSet => self.delete_one::<StatefulSet>(name, namespace).await,
            ResourceKind::DaemonSet => self.delete_one::<DaemonSet>(name, namespace).await,
            ResourceKind::ReplicaSet => self.delete_one::<ReplicaSet>(name, namespace).await,
            ResourceKind::ReplicationController => {
                self.delete_one::<ReplicationController>(name, namespace)
                    .await
            }
            ResourceKind::Job => self.delete_one::<Job>(name, namespace).await,
            ResourceKind::CronJob => self.delete_one::<CronJob>(name, namespace).await,
            ResourceKind::Pod => self.delete_one::<Pod>(name, namespace).await,
            ResourceKind::Service => self.delete_one::<Service>(name, namespace).await,
        }
    }

    async fn exists_one<K: Namespaced>(&self, name: &str, namespace: &str) -> Result<bool, kube::Error> {
        match self.api::<K>(namespace).get(name).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn exists(
        &self,
        kind: ResourceKind,
        name: &str,
        namespace: &str,
    ) -> Result<bool, DriverError> {
        let found = match kind {
            ResourceKind::Deployment => self.exists_one::<Deployment>(name, namespace).await,
            ResourceKind::StatefulSet => self.exists_one::<StatefulSet>(name, namespace).await,
            ResourceKind::DaemonSet => self.exists_one::<DaemonSet>(name, namespace).await,
            ResourceKind::ReplicaSet => self.exists_one::<ReplicaSet>(name, namespace).await,
            ResourceKind::ReplicationController => {
                self.exists_one::<ReplicationController>(name, namespace)
                    .await
            }
            ResourceKind::Job => self.exists_one::<Job>(name, namespace).await,
            ResourceKind::CronJob => self.exists_one::<CronJob>(name, namespace).await,
            ResourceKind::Pod => self.exists_one::<Pod>(name, namespace).await,
            ResourceKind::Service => self.exists_one::<Service>(name, namespace).await,
        }?;
        Ok(found)
    }

    async fn has_any<K: Namespaced>(
        &self,
        namespace: &str,
        params: &ListParams,
    ) -> Result<bool, kube::Error> {
        let list = self.api::<K>(namespace).list(params).await?;
        Ok(!list.items.is_empty())
    }

    async fn kind_has_objects(
        &self,
        kind: ResourceKind,
        namespace: &str,
        params: &ListParams,
    ) -> Result<bool, kube::Error> {
        match kind {
            ResourceKind::Deployment => self.has_any::<Deployment>(namespace, params).await,
            ResourceKind::StatefulSet => self.has_any::<StatefulSet>(namespace, params).await,
            ResourceKind::DaemonSet => self.has_any::<DaemonSet>(namespace, params).await,
            ResourceKind::ReplicaSet => self.has_any::<ReplicaSet>(namespace, params).await,
            ResourceKind::ReplicationController => {
                self.has_any::<ReplicationController>(namespace, params)
                    .await
            }
            ResourceKind::Job => self.has_any::<Job>(namespace, params).await,
            ResourceKind::CronJob => self.has_any::<CronJob>(namespace, params).await,
            ResourceKind::Pod => self.has_any::<Pod>(namespace, params).await,
            ResourceKind::Service => self.has_any::<Service>(namespace, params).await,
        }
    }

    async fn is_ready(
        &self,
        kind: ResourceKind,
        name: &str,
        namespace: &str,
        condition: Option<&ConditionMatch>,
    ) -> Result<bool, DriverError> {
        match kind {
            ResourceKind::StatefulSet => {
                let set = self.api::<StatefulSet>(namespace).get(name).await?;
                Ok(stateful_set_ready(&set))
            }
            ResourceKind::Deployment => {
                let deployment = self.api::<Deployment>(namespace).get(name).await?;
                Ok(deployment_ready(&deployment))
            }
            ResourceKind::DaemonSet => {
                let ds = self.api::<DaemonSet>(namespace).get(name).await?;
                Ok(daemon_set_ready(&ds))
            }
            ResourceKind::Pod => {
                let pod = self.api::<Pod>(namespace).get(name).await?;
                let default = ConditionMatch::default();
                Ok(pod_has_condition(&pod, condition.unwrap_or(&default)))
            }
            other => Err(DriverError::Unsupported {
                kind: other,
                op: "wait_for_rollout",
            }),
        }
    }
}

#[async_trait]
impl Orchestrator for KubeDriver {
    async fn apply(
        &self,
        manifest: &Manifest,
        namespace: &str,
        options: ApplyOptions,
    ) -> Result<(), DriverError> {
        manifest.validate()?;
        info!(
            kind = %manifest.kind(),
            name = manifest.name(),
            namespace,
            dry_run = options.dry_run,
            "applying"
        );
        match manifest {
            Manifest::Pod(o) => self.create_or_patch(o, namespace, options).await,
            Manifest::StatefulSet(o) => self.create_or_patch(o, namespace, options).await,
            Manifest::Deployment(o) => self.create_or_patch(o, namespace, options).await,
            Manifest::DaemonSet(o) => self.create_or_patch(o, namespace, options).await,
            Manifest::Job(o) => self.create_or_patch(o, namespace, options).await,
            Manifest::Service(o) => self.create_or_patch(o, namespace, options).await,
        }
    }

    async fn delete_resources(
        &self,
        bundle: &ResourceBundle,
        namespace: &str,
    ) -> Result<DeleteSummary, DriverError> {
        let mut summary = DeleteSummary::default();
        for (kind, name) in bundle.iter() {
            match self.delete_named(kind, name, namespace).await {
                Ok(()) => {
                    info!(%kind, name, namespace, "deleted");
                    summary.deleted += 1;
                }
                Err(kube::Error::Api(e)) if e.code == 404 => {
                    debug!(%kind, name, namespace, "already gone");
                    summary.missing += 1;
                }
                Err(e) => {
                    warn!(%kind, name, namespace, error = %e, "delete failed, continuing");
                    summary.failed += 1;
                }
            }
        }
        Ok(summary)
    }

    async fn wait_for_cleanup(
        &self,
        bundle: &ResourceBundle,
        namespace: &str,
        timeout: Duration,
    ) -> Result<(), DriverError> {
        let deadline = Instant::now() + timeout;
        loop {
            let mut remaining = 0usize;
            for (kind, name) in bundle.iter() {
                match self.exists(kind, name, namespace).await {
                    Ok(false) => {}
                    Ok(true) => remaining += 1,
                    Err(e) => {
                        debug!(%kind, name, error = %e, "cleanup poll failed, retrying");
                        remaining += 1;
                    }
                }
            }
            if remaining == 0 {
                info!(namespace, resources = bundle.len(), "cleanup complete");
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(DriverError::Timeout {
                    what: format!("{} resources to disappear from {}", remaining, namespace),
                    timeout,
                });
            }
            debug!(namespace, remaining, "waiting for cleanup");
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn wait_for_rollout(
        &self,
        kind: ResourceKind,
        name: &str,
        namespace: &str,
        timeout: Duration,
        condition: Option<&ConditionMatch>,
    ) -> Result<(), DriverError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.is_ready(kind, name, namespace, condition).await {
                Ok(true) => {
                    info!(%kind, name, namespace, "rollout ready");
                    return Ok(());
                }
                Ok(false) => debug!(%kind, name, "not ready yet"),
                Err(DriverError::Kube(e)) => {
                    debug!(%kind, name, error = %e, "readiness poll failed, retrying")
                }
                Err(e) => return Err(e),
            }
            if Instant::now() >= deadline {
                return Err(DriverError::Timeout {
                    what: format!("{} {}/{} to become ready", kind, namespace, name),
                    timeout,
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn poll_ns_has_objects(
        &self,
        namespace: &str,
        kinds: &[ResourceKind],
        filter: &ObjectFilter,
    ) -> Result<bool, DriverError> {
        let params = filter.list_params();
        for kind in kinds {
            if self.kind_has_objects(*kind, namespace, &params).await? {
                debug!(%kind, namespace, "namespace still has objects");
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn wait_for_empty(
        &self,
        namespace: &str,
        kinds: &[ResourceKind],
        filter: &ObjectFilter,
        timeout: Duration,
    ) -> Result<(), DriverError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.poll_ns_has_objects(namespace, kinds, filter).await {
                Ok(false) => return Ok(()),
                Ok(true) => {}
                Err(e) => debug!(namespace, error = %e, "empty check failed, retrying"),
            }
            if Instant::now() >= deadline {
                return Err(DriverError::Timeout {
                    what: format!("namespace {} to be empty", namespace),
                    timeout,
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

fn replicas_converged(desired: i32, available: Option<i32>, ready: Option<i32>) -> bool {
    match available {
        Some(available) => available == desired,
        None => ready.unwrap_or(0) == desired,
    }
}

pub fn stateful_set_ready(set: &StatefulSet) -> bool {
    let desired = set.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let status = set.status.as_ref();
    replicas_converged(
        desired,
        status.and_then(|s| s.available_replicas),
        status.and_then(|s| s.ready_replicas),
    )
}

pub fn deployment_ready(deployment: &Deployment) -> bool {
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let status = deployment.status.as_ref();
    replicas_converged(
        desired,
        status.and_then(|s| s.available_replicas),
        status.and_then(|s| s.ready_replicas),
    )
}

pub fn daemon_set_ready(ds: &DaemonSet) -> bool {
    let Some(status) = ds.status.as_ref() else {
        return false;
    };
    replicas_converged(
        status.desired_number_scheduled,
        status.number_available,
        Some(status.number_ready),
    )
}

pub fn pod_has_condition(pod: &Pod, condition: &ConditionMatch) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map_or(false, |conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == condition.type_ && c.status == condition.status)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::{
        DaemonSetStatus, DeploymentSpec, DeploymentStatus, StatefulSetSpec, StatefulSetStatus,
    };
    use k8s_openapi::api::core::v1::{PodCondition, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use serde_json::{json, Value};
    use std::io::Read;
    use std::sync::{Arc, Mutex};
    use tiny_http::{Header, Response, Server};

    fn stateful_set(replicas: i32, available: Option<i32>, ready: Option<i32>) -> StatefulSet {
        StatefulSet {
            spec: Some(StatefulSetSpec {
                replicas: Some(replicas),
                ..Default::default()
            }),
            status: Some(StatefulSetStatus {
                replicas,
                available_replicas: available,
                ready_replicas: ready,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn stateful_set_readiness_prefers_available() {
        assert!(stateful_set_ready(&stateful_set(3, Some(3), Some(1))));
        assert!(!stateful_set_ready(&stateful_set(3, Some(2), Some(3))));
        assert!(stateful_set_ready(&stateful_set(3, None, Some(3))));
        assert!(!stateful_set_ready(&stateful_set(3, None, None)));
    }

    #[test]
    fn zero_replicas_is_ready_immediately() {
        assert!(stateful_set_ready(&stateful_set(0, None, None)));
        let deployment = Deployment {
            spec: Some(DeploymentSpec {
                replicas: Some(0),
                ..Default::default()
            }),
            status: None,
            ..Default::default()
        };
        assert!(deployment_ready(&deployment));
    }

    #[test]
    fn deployment_falls_back_to_ready() {
        let deployment = Deployment {
            spec: Some(DeploymentSpec {
                replicas: Some(2),
                ..Default::default()
            }),
            status: Some(DeploymentStatus {
                ready_replicas: Some(2),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(deployment_ready(&deployment));
    }

    #[test]
    fn daemon_set_without_status_is_not_ready() {
        assert!(!daemon_set_ready(&DaemonSet::default()));
        let ds = DaemonSet {
            status: Some(DaemonSetStatus {
                desired_number_scheduled: 4,
                number_available: Some(4),
                number_ready: 3,
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(daemon_set_ready(&ds));
    }

    #[test]
    fn pod_condition_match() {
        let pod = Pod {
            status: Some(PodStatus {
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: "False".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(pod_has_condition(&pod, &ConditionMatch::ready(false)));
        assert!(!pod_has_condition(&pod, &ConditionMatch::ready(true)));
        assert!(!pod_has_condition(&Pod::default(), &ConditionMatch::default()));
    }

    #[test]
    fn bundle_iterates_in_teardown_order() {
        let bundle: ResourceBundle = vec![
            (ResourceKind::Service, "nodes".to_string()),
            (ResourceKind::Pod, "publisher".to_string()),
            (ResourceKind::StatefulSet, "nodes".to_string()),
            (ResourceKind::Job, "seed".to_string()),
            (ResourceKind::StatefulSet, "nodes".to_string()),
        ]
        .into_iter()
        .collect();
        let order: Vec<(ResourceKind, &str)> = bundle.iter().collect();
        assert_eq!(
            order,
            vec![
                (ResourceKind::StatefulSet, "nodes"),
                (ResourceKind::Job, "seed"),
                (ResourceKind::Pod, "publisher"),
                (ResourceKind::Service, "nodes"),
            ]
        );
        assert_eq!(bundle.len(), 4);
    }

    #[test]
    fn filter_builds_exclusion_selectors() {
        assert_eq!(ObjectFilter::none().label_selector(), None);
        assert_eq!(ObjectFilter::none().field_selector(), None);
        let filter = ObjectFilter::none()
            .exclude_app("api-requester")
            .exclude_app("grafana")
            .exclude_name("requester")
            .exclude_name("requester-0");
        assert_eq!(
            filter.label_selector().as_deref(),
            Some("app notin (api-requester,grafana)")
        );
        assert_eq!(
            filter.field_selector().as_deref(),
            Some("metadata.name!=requester,metadata.name!=requester-0")
        );
    }

    const SETS: &str = "/apis/apps/v1/namespaces/ns/statefulsets";
    const NODES: &str = "/apis/apps/v1/namespaces/ns/statefulsets/nodes";

    fn api_status(code: u16, reason: &str) -> Value {
        json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": if code < 300 { "Success" } else { "Failure" },
            "message": reason,
            "reason": reason,
            "code": code,
        })
    }

    /// In-process API server. Objects are keyed by item path; list calls
    /// ignore selectors.
    #[derive(Default)]
    struct FakeApi {
        objects: BTreeMap<String, Value>,
        requests: Vec<String>,
        /// Item paths that always answer 500.
        failing: Vec<String>,
        /// Item GETs answered 500 before the real object is served.
        flaky_gets: usize,
        /// Item GETs after which a converged status is reported.
        ready_after: Option<usize>,
        gets: usize,
    }

    impl FakeApi {
        fn handle(&mut self, method: &str, url: &str, body: &str) -> (u16, Value) {
            self.requests.push(format!("{} {}", method, url));
            let (path, query) = url.split_once('?').unwrap_or((url, ""));
            if self.failing.iter().any(|f| f == path) {
                return (500, api_status(500, "InternalError"));
            }
            match method {
                "POST" => {
                    let obj: Value = serde_json::from_str(body).expect("object body");
                    let name = obj["metadata"]["name"].as_str().expect("name");
                    let key = format!("{}/{}", path, name);
                    if self.objects.contains_key(&key) {
                        return (409, api_status(409, "AlreadyExists"));
                    }
                    if !query.contains("dryRun=All") {
                        self.objects.insert(key, obj.clone());
                    }
                    (201, obj)
                }
                "PATCH" => match self.objects.get_mut(path) {
                    Some(existing) => {
                        *existing = serde_json::from_str(body).expect("patch body");
                        (200, existing.clone())
                    }
                    None => (404, api_status(404, "NotFound")),
                },
                "DELETE" => match self.objects.remove(path) {
                    Some(_) => (200, api_status(200, "")),
                    None => (404, api_status(404, "NotFound")),
                },
                "GET" if query.contains("limit=") => {
                    let prefix = format!("{}/", path);
                    let items: Vec<Value> = self
                        .objects
                        .iter()
                        .filter(|(key, _)| key.starts_with(&prefix))
                        .map(|(_, obj)| obj.clone())
                        .take(1)
                        .collect();
                    (200, json!({"apiVersion": "v1", "kind": "List", "metadata": {}, "items": items}))
                }
                "GET" => {
                    self.gets += 1;
                    if self.gets <= self.flaky_gets {
                        return (500, api_status(500, "InternalError"));
                    }
                    let ready = self.ready_after.map_or(false, |n| self.gets > n);
                    match self.objects.get_mut(path) {
                        Some(obj) => {
                            if ready {
                                let replicas = obj["spec"]["replicas"].clone();
                                obj["status"] = json!({
                                    "replicas": replicas,
                                    "readyReplicas": replicas,
                                    "availableReplicas": replicas,
                                });
                            }
                            (200, obj.clone())
                        }
                        None => (404, api_status(404, "NotFound")),
                    }
                }
                _ => (405, api_status(405, "MethodNotAllowed")),
            }
        }

        fn methods(&self) -> Vec<&str> {
            self.requests
                .iter()
                .map(|r| r.split(' ').next().unwrap_or_default())
                .collect()
        }
    }

    fn serve(api: FakeApi) -> (KubeDriver, Arc<Mutex<FakeApi>>) {
        let api = Arc::new(Mutex::new(api));
        let server = Server::http("127.0.0.1:0").expect("bind");
        let addr = server.server_addr().to_ip().expect("ip addr");
        let shared = Arc::clone(&api);
        std::thread::spawn(move || {
            for mut request in server.incoming_requests() {
                let mut body = String::new();
                let _ = request.as_reader().read_to_string(&mut body);
                let method = request.method().to_string();
                let (code, reply) = shared
                    .lock()
                    .expect("lock")
                    .handle(&method, request.url(), &body);
                let header = Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..])
                    .expect("header");
                let response = Response::from_string(reply.to_string())
                    .with_status_code(code)
                    .with_header(header);
                let _ = request.respond(response);
            }
        });
        let config = Config::new(format!("http://{}", addr).parse().expect("cluster url"));
        let client = Client::try_from(config).expect("client");
        let driver = KubeDriver::new(client).with_poll_interval(Duration::from_millis(10));
        (driver, api)
    }

    fn nodes(replicas: i32) -> Manifest {
        Manifest::new(Manifest::StatefulSet(StatefulSet {
            metadata: ObjectMeta {
                name: Some("nodes".to_string()),
                namespace: Some("ns".to_string()),
                ..Default::default()
            },
            spec: Some(StatefulSetSpec {
                replicas: Some(replicas),
                ..Default::default()
            }),
            ..Default::default()
        }))
        .expect("valid")
    }

    fn stored(name: &str, kind: &str) -> Value {
        json!({
            "apiVersion": if kind == "StatefulSet" { "apps/v1" } else { "v1" },
            "kind": kind,
            "metadata": {"name": name, "namespace": "ns", "labels": {"app": name}},
        })
    }

    #[tokio::test]
    async fn conflict_patches_only_when_exist_ok() {
        let (driver, api) = serve(FakeApi::default());
        driver
            .apply(&nodes(3), "ns", ApplyOptions::default())
            .await
            .expect("create");
        let err = driver
            .apply(&nodes(5), "ns", ApplyOptions::default())
            .await
            .expect_err("conflict");
        assert!(matches!(err, DriverError::Kube(kube::Error::Api(ref e)) if e.code == 409));

        let options = ApplyOptions {
            exist_ok: true,
            ..Default::default()
        };
        driver.apply(&nodes(5), "ns", options).await.expect("patched");
        driver.patch(&nodes(4), "ns").await.expect("patch");

        let api = api.lock().expect("lock");
        assert_eq!(api.methods(), vec!["POST", "POST", "POST", "PATCH", "PATCH"]);
        assert!(api.requests[0].contains("fieldManager=mixlab"));
        assert_eq!(api.objects[NODES]["spec"]["replicas"], json!(4));
    }

    #[tokio::test]
    async fn dry_run_leaves_namespace_empty() {
        let (driver, api) = serve(FakeApi::default());
        let options = ApplyOptions {
            dry_run: true,
            exist_ok: false,
        };
        driver.apply(&nodes(3), "ns", options).await.expect("dry run");
        driver
            .wait_for_empty(
                "ns",
                &[ResourceKind::StatefulSet],
                &ObjectFilter::none(),
                Duration::from_millis(200),
            )
            .await
            .expect("still empty");

        let api = api.lock().expect("lock");
        assert!(api.requests[0].starts_with(&format!("POST {}?", SETS)));
        assert!(api.requests[0].contains("dryRun=All"));
        assert!(api.objects.is_empty());
    }

    #[tokio::test]
    async fn delete_counts_missing_and_continues_past_failures() {
        let mut fake = FakeApi::default();
        fake.objects.insert(NODES.to_string(), stored("nodes", "StatefulSet"));
        fake.failing.push("/api/v1/namespaces/ns/services/nodes".to_string());
        let (driver, api) = serve(fake);

        let bundle: ResourceBundle = vec![
            (ResourceKind::Service, "nodes".to_string()),
            (ResourceKind::Pod, "gone".to_string()),
            (ResourceKind::StatefulSet, "nodes".to_string()),
        ]
        .into_iter()
        .collect();
        let summary = driver.delete_resources(&bundle, "ns").await.expect("summary");
        assert_eq!(
            summary,
            DeleteSummary {
                deleted: 1,
                missing: 1,
                failed: 1,
            }
        );
        {
            let api = api.lock().expect("lock");
            assert_eq!(api.methods(), vec!["DELETE", "DELETE", "DELETE"]);
            assert!(api.requests[0].starts_with(&format!("DELETE {}", NODES)));
            assert!(api.requests[2].contains("/services/nodes"));
        }

        let gone: ResourceBundle = vec![
            (ResourceKind::StatefulSet, "nodes".to_string()),
            (ResourceKind::Pod, "gone".to_string()),
        ]
        .into_iter()
        .collect();
        driver
            .wait_for_cleanup(&gone, "ns", Duration::from_millis(200))
            .await
            .expect("cleaned up");
    }

    #[tokio::test]
    async fn rollout_retries_errors_and_not_ready_polls() {
        let fake = FakeApi {
            flaky_gets: 1,
            ready_after: Some(2),
            ..Default::default()
        };
        let (driver, api) = serve(fake);
        driver
            .apply(&nodes(2), "ns", ApplyOptions::default())
            .await
            .expect("create");
        driver
            .wait_for_rollout(ResourceKind::StatefulSet, "nodes", "ns", Duration::from_secs(5), None)
            .await
            .expect("ready");
        assert_eq!(api.lock().expect("lock").gets, 3);
    }

    #[tokio::test]
    async fn rollout_times_out_when_never_ready() {
        let (driver, _api) = serve(FakeApi::default());
        driver
            .apply(&nodes(2), "ns", ApplyOptions::default())
            .await
            .expect("create");
        let err = driver
            .wait_for_rollout(
                ResourceKind::StatefulSet,
                "nodes",
                "ns",
                Duration::from_millis(50),
                None,
            )
            .await
            .expect_err("never ready");
        assert!(err.is_timeout());

        let err = driver
            .wait_for_rollout(ResourceKind::Job, "seed", "ns", Duration::from_secs(5), None)
            .await
            .expect_err("jobs have no rollout");
        assert!(matches!(err, DriverError::Unsupported { kind: ResourceKind::Job, .. }));
    }

    #[tokio::test]
    async fn empty_wait_sends_filter_and_times_out_on_leftovers() {
        let mut fake = FakeApi::default();
        fake.objects.insert(
            "/api/v1/namespaces/ns/pods/requester".to_string(),
            stored("requester", "Pod"),
        );
        let (driver, api) = serve(fake);

        let filter = ObjectFilter::none()
            .exclude_app("api-requester")
            .exclude_name("requester");
        assert!(driver
            .poll_ns_has_objects("ns", &[ResourceKind::Pod], &filter)
            .await
            .expect("poll"));
        {
            let api = api.lock().expect("lock");
            let list = &api.requests[0];
            assert!(list.starts_with("GET /api/v1/namespaces/ns/pods?"));
            assert!(list.contains("limit=1"));
            assert!(list.contains("labelSelector=app+notin+%28api-requester%29"));
            assert!(list.contains("fieldSelector=metadata.name%21%3Drequester"));
        }

        let err = driver
            .wait_for_empty(
                "ns",
                &[ResourceKind::StatefulSet, ResourceKind::Pod],
                &ObjectFilter::none(),
                Duration::from_millis(50),
            )
            .await
            .expect_err("pod left over");
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn apply_rechecks_descriptors_built_outside_the_constructor() {
        let (driver, api) = serve(FakeApi::default());
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("publisher".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let err = driver
            .apply(&Manifest::Pod(pod), "ns", ApplyOptions::default())
            .await
            .expect_err("no namespace");
        assert!(matches!(
            err,
            DriverError::Invalid(BuildError::MissingField("metadata.namespace"))
        ));
        assert!(api.lock().expect("lock").requests.is_empty());
    }
}
