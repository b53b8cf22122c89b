use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Pod, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::Serialize;

use crate::error::BuildError;
use crate::kind::ResourceKind;

/// A finalized workload descriptor, ready for submission.
///
/// Produced by the builders; nothing mutates it afterwards. Every manifest
/// produced through [`Manifest::new`] carries a kind, a name and a
/// namespace.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Manifest {
    Pod(Pod),
    StatefulSet(StatefulSet),
    Deployment(Deployment),
    DaemonSet(DaemonSet),
    Job(Job),
    Service(Service),
}

impl Manifest {
    pub fn new(manifest: Manifest) -> Result<Manifest, BuildError> {
        manifest.validate()?;
        Ok(manifest)
    }

    /// Checks the name and namespace a submission needs. The variants are
    /// public, so consumers re-check before talking to a cluster.
    pub fn validate(&self) -> Result<(), BuildError> {
        let meta = self.metadata();
        if meta.name.as_deref().map_or(true, str::is_empty) {
            return Err(BuildError::MissingField("metadata.name"));
        }
        if meta.namespace.as_deref().map_or(true, str::is_empty) {
            return Err(BuildError::MissingField("metadata.namespace"));
        }
        Ok(())
    }

    pub fn kind(&self) -> ResourceKind {
        match self {
            Manifest::Pod(_) => ResourceKind::Pod,
            Manifest::StatefulSet(_) => ResourceKind::StatefulSet,
            Manifest::Deployment(_) => ResourceKind::Deployment,
            Manifest::DaemonSet(_) => ResourceKind::DaemonSet,
            Manifest::Job(_) => ResourceKind::Job,
            Manifest::Service(_) => ResourceKind::Service,
        }
    }

    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            Manifest::Pod(o) => &o.metadata,
            Manifest::StatefulSet(o) => &o.metadata,
            Manifest::Deployment(o) => &o.metadata,
            Manifest::DaemonSet(o) => &o.metadata,
            Manifest::Job(o) => &o.metadata,
            Manifest::Service(o) => &o.metadata,
        }
    }

    pub fn name(&self) -> &str {
        self.metadata().name.as_deref().unwrap_or_default()
    }

    pub fn namespace(&self) -> &str {
        self.metadata().namespace.as_deref().unwrap_or_default()
    }

    /// Desired replica count for controllers that declare one.
    pub fn replicas(&self) -> Option<i32> {
        match self {
            Manifest::StatefulSet(o) => o.spec.as_ref().and_then(|s| s.replicas),
            Manifest::Deployment(o) => o.spec.as_ref().and_then(|s| s.replicas),
            _ => None,
        }
    }

    /// The descriptor as a JSON document including `apiVersion` and `kind`.
    pub fn to_value(&self) -> serde_json::Result<serde_json::Value> {
        // k8s-openapi's Serialize impls emit apiVersion/kind themselves.
        serde_json::to_value(self)
    }

    pub fn file_stem(&self) -> String {
        format!("{}-{}", self.kind().as_str().to_ascii_lowercase(), self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_missing_name_and_namespace() {
        let err = Manifest::new(Manifest::Pod(Pod::default())).expect_err("no name");
        assert!(matches!(err, BuildError::MissingField("metadata.name")));

        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("p".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let err = Manifest::new(Manifest::Pod(pod)).expect_err("no namespace");
        assert!(matches!(err, BuildError::MissingField("metadata.namespace")));
    }

    #[test]
    fn serializes_with_api_version_and_kind() {
        let svc = Service {
            metadata: ObjectMeta {
                name: Some("nodes".to_string()),
                namespace: Some("ns".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let manifest = Manifest::new(Manifest::Service(svc)).expect("valid");
        let value = manifest.to_value().expect("json");
        assert_eq!(value["apiVersion"], "v1");
        assert_eq!(value["kind"], "Service");
        assert_eq!(value["metadata"]["name"], "nodes");
        assert_eq!(manifest.file_stem(), "service-nodes");
    }
}
