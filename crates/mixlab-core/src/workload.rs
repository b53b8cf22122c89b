//! Typed workload configuration: container, pod spec, pod template and
//! replicated group. Each layer only exposes mutations that are safe at
//! that layer; the volume/mount cross-check happens when a group is built.

use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, ContainerPort, EmptyDirVolumeSource, EnvVar, EnvVarSource,
    ExecAction, HTTPGetAction, ObjectFieldSelector, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, PodDNSConfig, PodSpec,
    PodTemplateSpec, Probe, ResourceRequirements, Volume, VolumeMount,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::command::CommandConfig;
use crate::error::BuildError;
use crate::kind::ResourceKind;

pub const APP_LABEL: &str = "app";

/// Specifies whether the orchestrator should pull images when creating pods.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PullPolicy {
    Always,
    #[default]
    IfAbsent,
    Never,
}

impl fmt::Display for PullPolicy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PullPolicy::Always => f.write_str("Always"),
            PullPolicy::IfAbsent => f.write_str("IfNotPresent"),
            PullPolicy::Never => f.write_str("Never"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagementPolicy {
    #[default]
    Parallel,
    Ordered,
}

impl ManagementPolicy {
    pub(crate) fn as_k8s(&self) -> &'static str {
        match self {
            ManagementPolicy::Parallel => "Parallel",
            ManagementPolicy::Ordered => "OrderedReady",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Prepend,
    Append,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvSource {
    Value(String),
    /// Downward API field, e.g. `status.podIP`.
    Field(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvConfig {
    pub name: String,
    pub source: EnvSource,
}

impl EnvConfig {
    pub fn value(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: EnvSource::Value(value.into()),
        }
    }

    pub fn field(name: impl Into<String>, field_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: EnvSource::Field(field_path.into()),
        }
    }

    fn build(&self) -> EnvVar {
        match &self.source {
            EnvSource::Value(v) => EnvVar {
                name: self.name.clone(),
                value: Some(v.clone()),
                ..Default::default()
            },
            EnvSource::Field(path) => EnvVar {
                name: self.name.clone(),
                value_from: Some(EnvVarSource {
                    field_ref: Some(ObjectFieldSelector {
                        field_path: path.clone(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortConfig {
    pub name: Option<String>,
    pub port: i32,
    pub protocol: Option<String>,
}

impl PortConfig {
    pub fn tcp(name: impl Into<String>, port: i32) -> Self {
        Self {
            name: Some(name.into()),
            port,
            protocol: Some("TCP".to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourcesConfig {
    pub requests: BTreeMap<String, String>,
    pub limits: BTreeMap<String, String>,
}

impl ResourcesConfig {
    fn build(&self) -> Option<ResourceRequirements> {
        if self.requests.is_empty() && self.limits.is_empty() {
            return None;
        }
        Some(ResourceRequirements {
            requests: quantities(&self.requests),
            limits: quantities(&self.limits),
            ..Default::default()
        })
    }
}

fn quantities(map: &BTreeMap<String, String>) -> Option<BTreeMap<String, Quantity>> {
    if map.is_empty() {
        return None;
    }
    Some(
        map.iter()
            .map(|(k, v)| (k.clone(), Quantity(v.clone())))
            .collect(),
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeAction {
    HttpGet { path: String, port: i32 },
    Exec(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeConfig {
    pub action: ProbeAction,
    pub initial_delay_seconds: i32,
    pub period_seconds: i32,
    pub success_threshold: i32,
    pub failure_threshold: i32,
    pub timeout_seconds: i32,
}

impl ProbeConfig {
    pub fn http_get(path: impl Into<String>, port: i32) -> Self {
        Self {
            action: ProbeAction::HttpGet {
                path: path.into(),
                port,
            },
            initial_delay_seconds: 1,
            period_seconds: 3,
            success_threshold: 1,
            failure_threshold: 1,
            timeout_seconds: 5,
        }
    }

    fn build(&self) -> Probe {
        let mut probe = Probe {
            initial_delay_seconds: Some(self.initial_delay_seconds),
            period_seconds: Some(self.period_seconds),
            success_threshold: Some(self.success_threshold),
            failure_threshold: Some(self.failure_threshold),
            timeout_seconds: Some(self.timeout_seconds),
            ..Default::default()
        };
        match &self.action {
            ProbeAction::HttpGet { path, port } => {
                probe.http_get = Some(HTTPGetAction {
                    path: Some(path.clone()),
                    port: IntOrString::Int(*port),
                    ..Default::default()
                });
            }
            ProbeAction::Exec(command) => {
                probe.exec = Some(ExecAction {
                    command: Some(command.clone()),
                });
            }
        }
        probe
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountConfig {
    pub name: String,
    pub mount_path: String,
    pub read_only: bool,
}

impl MountConfig {
    pub fn new(name: impl Into<String>, mount_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mount_path: mount_path.into(),
            read_only: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerConfig {
    pub name: String,
    pub image: String,
    pub pull_policy: PullPolicy,
    pub ports: Vec<PortConfig>,
    pub env: Vec<EnvConfig>,
    pub resources: ResourcesConfig,
    pub readiness_probe: Option<ProbeConfig>,
    pub volume_mounts: Vec<MountConfig>,
    pub command_config: CommandConfig,
}

impl ContainerConfig {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            pull_policy: PullPolicy::default(),
            ports: Vec::new(),
            env: Vec::new(),
            resources: ResourcesConfig::default(),
            readiness_probe: None,
            volume_mounts: Vec::new(),
            command_config: CommandConfig::default(),
        }
    }

    pub fn add_env(&mut self, env: EnvConfig) -> Result<(), BuildError> {
        if self.env.iter().any(|e| e.name == env.name) {
            return Err(BuildError::DuplicateEnv {
                container: self.name.clone(),
                name: env.name,
            });
        }
        self.env.push(env);
        Ok(())
    }

    pub fn set_readiness_probe(
        &mut self,
        probe: ProbeConfig,
        overwrite: bool,
    ) -> Result<(), BuildError> {
        if self.readiness_probe.is_some() && !overwrite {
            return Err(BuildError::ProbeExists(self.name.clone()));
        }
        self.readiness_probe = Some(probe);
        Ok(())
    }

    /// Mounts a volume into this container. The volume itself must be
    /// declared on the pod spec; that is checked at build time.
    pub fn add_volume_mount(&mut self, mount: MountConfig) -> Result<(), BuildError> {
        if self
            .volume_mounts
            .iter()
            .any(|m| m.mount_path == mount.mount_path)
        {
            return Err(BuildError::DuplicateMount {
                container: self.name.clone(),
                path: mount.mount_path,
            });
        }
        self.volume_mounts.push(mount);
        Ok(())
    }

    pub fn add_port(&mut self, port: PortConfig) {
        self.ports.push(port);
    }

    pub fn build(&self) -> Result<Container, BuildError> {
        let entry = if self.command_config.is_empty() {
            None
        } else {
            Some(self.command_config.render()?)
        };
        let (command, args) = match entry {
            Some(e) => (Some(e.command), Some(e.args).filter(|a| !a.is_empty())),
            None => (None, None),
        };
        Ok(Container {
            name: self.name.clone(),
            image: Some(self.image.clone()),
            image_pull_policy: Some(self.pull_policy.to_string()),
            ports: non_empty(
                self.ports
                    .iter()
                    .map(|p| ContainerPort {
                        name: p.name.clone(),
                        container_port: p.port,
                        protocol: p.protocol.clone(),
                        ..Default::default()
                    })
                    .collect(),
            ),
            env: non_empty(self.env.iter().map(EnvConfig::build).collect()),
            resources: self.resources.build(),
            readiness_probe: self.readiness_probe.as_ref().map(ProbeConfig::build),
            volume_mounts: non_empty(
                self.volume_mounts
                    .iter()
                    .map(|m| VolumeMount {
                        name: m.name.clone(),
                        mount_path: m.mount_path.clone(),
                        read_only: m.read_only.then_some(true),
                        ..Default::default()
                    })
                    .collect(),
            ),
            command,
            args,
            ..Default::default()
        })
    }
}

fn non_empty<T>(items: Vec<T>) -> Option<Vec<T>> {
    if items.is_empty() {
        None
    } else {
        Some(items)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeSource {
    EmptyDir,
    ConfigMap(String),
    Claim(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeConfig {
    pub name: String,
    pub source: VolumeSource,
}

impl VolumeConfig {
    pub fn empty_dir(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: VolumeSource::EmptyDir,
        }
    }

    fn build(&self) -> Volume {
        let mut volume = Volume {
            name: self.name.clone(),
            ..Default::default()
        };
        match &self.source {
            VolumeSource::EmptyDir => volume.empty_dir = Some(EmptyDirVolumeSource::default()),
            VolumeSource::ConfigMap(name) => {
                volume.config_map = Some(ConfigMapVolumeSource {
                    name: Some(name.clone()),
                    ..Default::default()
                })
            }
            VolumeSource::Claim(claim) => {
                volume.persistent_volume_claim = Some(PersistentVolumeClaimVolumeSource {
                    claim_name: claim.clone(),
                    ..Default::default()
                })
            }
        }
        volume
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodSpecConfig {
    pub volumes: Vec<VolumeConfig>,
    pub init_containers: Vec<ContainerConfig>,
    pub containers: Vec<ContainerConfig>,
    pub dns_searches: Vec<String>,
    /// Left unset, the cluster default (`Always`) applies.
    pub restart_policy: Option<String>,
}

impl PodSpecConfig {
    pub fn add_volume(&mut self, volume: VolumeConfig) -> Result<(), BuildError> {
        if self.volumes.iter().any(|v| v.name == volume.name) {
            return Err(BuildError::DuplicateVolume(volume.name));
        }
        self.volumes.push(volume);
        Ok(())
    }

    pub fn add_container(
        &mut self,
        container: ContainerConfig,
        order: Order,
    ) -> Result<(), BuildError> {
        insert_container(&mut self.containers, container, order)
    }

    pub fn add_init_container(
        &mut self,
        container: ContainerConfig,
        order: Order,
    ) -> Result<(), BuildError> {
        insert_container(&mut self.init_containers, container, order)
    }

    pub fn add_dns_search(&mut self, search: impl Into<String>) {
        let search = search.into();
        if !self.dns_searches.contains(&search) {
            self.dns_searches.push(search);
        }
    }

    pub fn container_mut(&mut self, name: &str) -> Result<&mut ContainerConfig, BuildError> {
        self.containers
            .iter_mut()
            .find(|c| c.name == name)
            .ok_or_else(|| BuildError::UnknownContainer(name.to_string()))
    }

    pub fn declared_volumes(&self) -> BTreeSet<&str> {
        self.volumes.iter().map(|v| v.name.as_str()).collect()
    }

    /// Checks that every mount (init containers included) names a volume in
    /// `volumes` or in `extra_volumes` (claim templates).
    pub fn validate(&self, extra_volumes: &[&str]) -> Result<(), BuildError> {
        let mut known = self.declared_volumes();
        known.extend(extra_volumes.iter().copied());
        for c in self.init_containers.iter().chain(self.containers.iter()) {
            for m in &c.volume_mounts {
                if !known.contains(m.name.as_str()) {
                    return Err(BuildError::UnknownVolume {
                        container: c.name.clone(),
                        volume: m.name.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn build(&self, extra_volumes: &[&str]) -> Result<PodSpec, BuildError> {
        self.validate(extra_volumes)?;
        let containers = self
            .containers
            .iter()
            .map(ContainerConfig::build)
            .collect::<Result<Vec<_>, _>>()?;
        let init_containers = self
            .init_containers
            .iter()
            .map(ContainerConfig::build)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(PodSpec {
            containers,
            init_containers: non_empty(init_containers),
            volumes: non_empty(self.volumes.iter().map(VolumeConfig::build).collect()),
            dns_config: (!self.dns_searches.is_empty()).then(|| PodDNSConfig {
                searches: Some(self.dns_searches.clone()),
                ..Default::default()
            }),
            restart_policy: self.restart_policy.clone(),
            ..Default::default()
        })
    }
}

fn insert_container(
    list: &mut Vec<ContainerConfig>,
    container: ContainerConfig,
    order: Order,
) -> Result<(), BuildError> {
    if list.iter().any(|c| c.name == container.name) {
        return Err(BuildError::DuplicateContainer(container.name));
    }
    match order {
        Order::Prepend => list.insert(0, container),
        Order::Append => list.push(container),
    }
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodTemplateConfig {
    pub name: Option<String>,
    pub namespace: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub pod_spec: PodSpecConfig,
}

impl PodTemplateConfig {
    pub fn build(&self, extra_volumes: &[&str]) -> Result<PodTemplateSpec, BuildError> {
        Ok(PodTemplateSpec {
            metadata: Some(ObjectMeta {
                name: self.name.clone(),
                namespace: self.namespace.clone(),
                labels: (!self.labels.is_empty()).then(|| self.labels.clone()),
                ..Default::default()
            }),
            spec: Some(self.pod_spec.build(extra_volumes)?),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimTemplateConfig {
    pub name: String,
    pub storage: String,
    pub storage_class: Option<String>,
    pub access_modes: Vec<String>,
}

impl ClaimTemplateConfig {
    pub fn new(name: impl Into<String>, storage: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            storage: storage.into(),
            storage_class: None,
            access_modes: vec!["ReadWriteOnce".to_string()],
        }
    }

    pub(crate) fn build(&self) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(self.access_modes.clone()),
                storage_class_name: self.storage_class.clone(),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(BTreeMap::from([(
                        "storage".to_string(),
                        Quantity(self.storage.clone()),
                    )])),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            status: None,
        }
    }
}

/// A named cohort of identical pods. Builds into a StatefulSet, Deployment
/// or DaemonSet according to `kind`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupConfig {
    pub name: Option<String>,
    pub namespace: Option<String>,
    pub api_version: String,
    pub kind: ResourceKind,
    pub labels: BTreeMap<String, String>,
    pub replicas: i32,
    pub selector_labels: BTreeMap<String, String>,
    pub service_name: Option<String>,
    pub pod_template: PodTemplateConfig,
    pub volume_claim_templates: Vec<ClaimTemplateConfig>,
    pub management_policy: ManagementPolicy,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            name: None,
            namespace: None,
            api_version: ResourceKind::StatefulSet.api_version().to_string(),
            kind: ResourceKind::StatefulSet,
            labels: BTreeMap::new(),
            replicas: 1,
            selector_labels: BTreeMap::new(),
            service_name: None,
            pod_template: PodTemplateConfig::default(),
            volume_claim_templates: Vec::new(),
            management_policy: ManagementPolicy::default(),
        }
    }
}

impl GroupConfig {
    /// Sets `app=<app>` on the group, its selector and its pod template.
    pub fn set_app_label(&mut self, app: impl Into<String>) {
        let app = app.into();
        self.labels.insert(APP_LABEL.to_string(), app.clone());
        self.selector_labels
            .insert(APP_LABEL.to_string(), app.clone());
        self.pod_template
            .labels
            .insert(APP_LABEL.to_string(), app);
    }

    pub fn pod_spec_mut(&mut self) -> &mut PodSpecConfig {
        &mut self.pod_template.pod_spec
    }

    pub fn claim_names(&self) -> Vec<&str> {
        self.volume_claim_templates
            .iter()
            .map(|c| c.name.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Arg, Command, DuplicatePolicy};

    #[test]
    fn duplicate_env_var_is_rejected() {
        let mut c = ContainerConfig::new("waku", "img");
        c.add_env(EnvConfig::field("IP", "status.podIP")).expect("first");
        let err = c.add_env(EnvConfig::value("IP", "1.2.3.4")).expect_err("dup");
        assert!(matches!(err, BuildError::DuplicateEnv { ref name, .. } if name == "IP"));
        assert_eq!(c.env.len(), 1);
    }

    #[test]
    fn readiness_probe_needs_overwrite_flag() {
        let mut c = ContainerConfig::new("waku", "img");
        c.set_readiness_probe(ProbeConfig::http_get("/health", 8008), false)
            .expect("first");
        assert!(c
            .set_readiness_probe(ProbeConfig::http_get("/debug/v1/info", 8645), false)
            .is_err());
        c.set_readiness_probe(ProbeConfig::http_get("/debug/v1/info", 8645), true)
            .expect("overwrite");
        let built = c.build().expect("build");
        let probe = built.readiness_probe.expect("probe");
        assert_eq!(
            probe.http_get.and_then(|h| h.path).as_deref(),
            Some("/debug/v1/info")
        );
    }

    #[test]
    fn container_build_renders_shell_command() {
        let mut c = ContainerConfig::new("waku", "img");
        let mut cmd = Command::new("/usr/bin/wakunode");
        cmd.add_arg(Arg::pair("--relay", true), DuplicatePolicy::Error)
            .expect("arg");
        c.command_config.push(Command::new(". /etc/enr/enr.env"));
        c.command_config.push(cmd);
        let built = c.build().expect("build");
        assert_eq!(
            built.command,
            Some(vec!["/bin/sh".to_string(), "-c".to_string()])
        );
        assert_eq!(
            built.args,
            Some(vec![". /etc/enr/enr.env\n/usr/bin/wakunode --relay=true".to_string()])
        );
        assert_eq!(built.image_pull_policy.as_deref(), Some("IfNotPresent"));
    }

    #[test]
    fn container_order_and_uniqueness() {
        let mut spec = PodSpecConfig::default();
        spec.add_container(ContainerConfig::new("b", "img"), Order::Append)
            .expect("b");
        spec.add_container(ContainerConfig::new("a", "img"), Order::Prepend)
            .expect("a");
        assert!(spec
            .add_container(ContainerConfig::new("a", "img"), Order::Append)
            .is_err());
        let names: Vec<&str> = spec.containers.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(spec.add_volume(VolumeConfig::empty_dir("data")).is_ok());
        assert!(spec.add_volume(VolumeConfig::empty_dir("data")).is_err());
    }

    #[test]
    fn init_container_mounts_are_validated() {
        let mut spec = PodSpecConfig::default();
        let mut init = ContainerConfig::new("enr", "img");
        init.add_volume_mount(MountConfig::new("enr-data", "/etc/enr"))
            .expect("mount");
        spec.add_init_container(init, Order::Append).expect("init");
        spec.add_container(ContainerConfig::new("waku", "img"), Order::Append)
            .expect("main");
        assert!(spec.build(&[]).is_err());
        spec.add_volume(VolumeConfig::empty_dir("enr-data"))
            .expect("volume");
        let built = spec.build(&[]).expect("build");
        assert_eq!(built.init_containers.map(|c| c.len()), Some(1));
    }
}
