//! Step pipeline from an empty group config to a finalized [`Manifest`].

use k8s_openapi::api::apps::v1::{
    DaemonSet, DaemonSetSpec, Deployment, DeploymentSpec, StatefulSet, StatefulSetSpec,
};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{Pod, Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::collections::BTreeMap;
use tracing::debug;

use crate::error::BuildError;
use crate::kind::ResourceKind;
use crate::manifest::Manifest;
use crate::workload::{
    ClaimTemplateConfig, ContainerConfig, GroupConfig, ManagementPolicy, Order,
    PodTemplateConfig, VolumeConfig,
};

#[derive(Debug, Clone, Default)]
pub struct GroupBuilder {
    config: GroupConfig,
}

impl GroupBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: GroupConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GroupConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut GroupConfig {
        &mut self.config
    }

    pub fn with_name(&mut self, name: impl Into<String>) -> &mut Self {
        self.config.name = Some(name.into());
        self
    }

    pub fn with_namespace(&mut self, namespace: impl Into<String>) -> &mut Self {
        self.config.namespace = Some(namespace.into());
        self
    }

    pub fn with_kind(&mut self, kind: ResourceKind) -> Result<&mut Self, BuildError> {
        match kind {
            ResourceKind::StatefulSet | ResourceKind::Deployment | ResourceKind::DaemonSet => {
                self.config.kind = kind;
                self.config.api_version = kind.api_version().to_string();
                Ok(self)
            }
            other => Err(BuildError::Unsupported {
                kind: other,
                feature: "replicated groups",
            }),
        }
    }

    pub fn with_replicas(&mut self, replicas: i32) -> Result<&mut Self, BuildError> {
        if replicas < 0 {
            return Err(BuildError::InvalidOption {
                path: "replicas".to_string(),
                reason: format!("must not be negative (got {})", replicas),
            });
        }
        self.config.replicas = replicas;
        Ok(self)
    }

    pub fn with_label(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.config.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_app(&mut self, app: impl Into<String>) -> &mut Self {
        self.config.set_app_label(app);
        self
    }

    pub fn with_service_name(&mut self, service: impl Into<String>) -> &mut Self {
        self.config.service_name = Some(service.into());
        self
    }

    pub fn with_management_policy(&mut self, policy: ManagementPolicy) -> &mut Self {
        self.config.management_policy = policy;
        self
    }

    pub fn with_volume_claim_template(
        &mut self,
        claim: ClaimTemplateConfig,
    ) -> Result<&mut Self, BuildError> {
        if self
            .config
            .volume_claim_templates
            .iter()
            .any(|c| c.name == claim.name)
            || self.config.pod_template.pod_spec.declared_volumes().contains(claim.name.as_str())
        {
            return Err(BuildError::DuplicateVolume(claim.name));
        }
        self.config.volume_claim_templates.push(claim);
        Ok(self)
    }

    pub fn with_volume(&mut self, volume: VolumeConfig) -> Result<&mut Self, BuildError> {
        self.config.pod_spec_mut().add_volume(volume)?;
        Ok(self)
    }

    pub fn with_container(
        &mut self,
        container: ContainerConfig,
        order: Order,
    ) -> Result<&mut Self, BuildError> {
        self.config.pod_spec_mut().add_container(container, order)?;
        Ok(self)
    }

    pub fn with_init_container(
        &mut self,
        container: ContainerConfig,
        order: Order,
    ) -> Result<&mut Self, BuildError> {
        self.config
            .pod_spec_mut()
            .add_init_container(container, order)?;
        Ok(self)
    }

    pub fn container_mut(&mut self, name: &str) -> Result<&mut ContainerConfig, BuildError> {
        self.config.pod_spec_mut().container_mut(name)
    }

    pub fn build(&self) -> Result<Manifest, BuildError> {
        build_group(&self.config)
    }

    /// The headless service governing this group, exposing every port of
    /// every container.
    pub fn build_service(&self) -> Result<Manifest, BuildError> {
        let cfg = &self.config;
        let name = cfg
            .service_name
            .clone()
            .or_else(|| cfg.name.clone())
            .ok_or(BuildError::MissingField("metadata.name"))?;
        let ports: Vec<ServicePort> = cfg
            .pod_template
            .pod_spec
            .containers
            .iter()
            .flat_map(|c| c.ports.iter())
            .map(|p| ServicePort {
                name: p.name.clone(),
                port: p.port,
                target_port: Some(IntOrString::Int(p.port)),
                protocol: p.protocol.clone(),
                ..Default::default()
            })
            .collect();
        Manifest::new(Manifest::Service(Service {
            metadata: ObjectMeta {
                name: Some(name),
                namespace: cfg.namespace.clone(),
                labels: labels(&cfg.labels),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                cluster_ip: Some("None".to_string()),
                selector: labels(&cfg.selector_labels),
                ports: (!ports.is_empty()).then_some(ports),
                ..Default::default()
            }),
            status: None,
        }))
    }
}

fn labels(map: &BTreeMap<String, String>) -> Option<BTreeMap<String, String>> {
    (!map.is_empty()).then(|| map.clone())
}

fn build_group(cfg: &GroupConfig) -> Result<Manifest, BuildError> {
    let name = cfg
        .name
        .clone()
        .ok_or(BuildError::MissingField("metadata.name"))?;
    let namespace = cfg
        .namespace
        .clone()
        .ok_or(BuildError::MissingField("metadata.namespace"))?;
    let metadata = ObjectMeta {
        name: Some(name.clone()),
        namespace: Some(namespace),
        labels: labels(&cfg.labels),
        ..Default::default()
    };
    let selector = LabelSelector {
        match_labels: labels(&cfg.selector_labels),
        ..Default::default()
    };
    let claims = cfg.claim_names();
    let template = cfg.pod_template.build(&claims)?;
    debug!(kind = %cfg.kind, name = %name, replicas = cfg.replicas, "building group manifest");

    if cfg.kind != ResourceKind::StatefulSet && !cfg.volume_claim_templates.is_empty() {
        return Err(BuildError::Unsupported {
            kind: cfg.kind,
            feature: "volume claim templates",
        });
    }

    let manifest = match cfg.kind {
        ResourceKind::StatefulSet => Manifest::StatefulSet(StatefulSet {
            metadata,
            spec: Some(StatefulSetSpec {
                replicas: Some(cfg.replicas),
                selector,
                service_name: cfg.service_name.clone().unwrap_or(name),
                template,
                volume_claim_templates: (!cfg.volume_claim_templates.is_empty()).then(|| {
                    cfg.volume_claim_templates
                        .iter()
                        .map(ClaimTemplateConfig::build)
                        .collect()
                }),
                pod_management_policy: Some(cfg.management_policy.as_k8s().to_string()),
                ..Default::default()
            }),
            status: None,
        }),
        ResourceKind::Deployment => Manifest::Deployment(Deployment {
            metadata,
            spec: Some(DeploymentSpec {
                replicas: Some(cfg.replicas),
                selector,
                template,
                ..Default::default()
            }),
            status: None,
        }),
        ResourceKind::DaemonSet => Manifest::DaemonSet(DaemonSet {
            metadata,
            spec: Some(DaemonSetSpec {
                selector,
                template,
                ..Default::default()
            }),
            status: None,
        }),
        other => {
            return Err(BuildError::Unsupported {
                kind: other,
                feature: "replicated groups",
            })
        }
    };
    Manifest::new(manifest)
}

/// A standalone pod from a template carrying its own name and namespace.
pub fn build_pod(template: &PodTemplateConfig) -> Result<Manifest, BuildError> {
    let spec = template.pod_spec.build(&[])?;
    Manifest::new(Manifest::Pod(Pod {
        metadata: ObjectMeta {
            name: template.name.clone(),
            namespace: template.namespace.clone(),
            labels: labels(&template.labels),
            ..Default::default()
        },
        spec: Some(spec),
        status: None,
    }))
}

pub fn build_job(template: &PodTemplateConfig, backoff_limit: i32) -> Result<Manifest, BuildError> {
    let mut pod_template = template.build(&[])?;
    if let Some(meta) = pod_template.metadata.as_mut() {
        meta.name = None;
        meta.namespace = None;
    }
    if let Some(spec) = pod_template.spec.as_mut() {
        spec.restart_policy = Some("Never".to_string());
    }
    Manifest::new(Manifest::Job(Job {
        metadata: ObjectMeta {
            name: template.name.clone(),
            namespace: template.namespace.clone(),
            labels: labels(&template.labels),
            ..Default::default()
        },
        spec: Some(JobSpec {
            template: pod_template,
            backoff_limit: Some(backoff_limit),
            ..Default::default()
        }),
        status: None,
    }))
}
