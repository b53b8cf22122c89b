//! Loading, overriding and validating experiment files.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};

use mixlab_core::overlay::{build_generator_pod, build_node_group, NodeGroup};
use mixlab_core::tree::{self, SetPolicy};
use mixlab_core::{BuildError, Manifest};
use mixlab_kube::{RequestTarget, RequesterOptions};

use crate::error::RunError;
use crate::metadata::MetadataSpec;

const REQUIRED_FIELDS: &[&str] = &[
    "experiment.name",
    "namespace",
    "nodes",
    "drive.mode",
];

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExperimentInfo {
    pub name: String,
    #[serde(default)]
    pub class: Option<String>,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("runs")
}

fn yes() -> bool {
    true
}

fn default_count() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RequestSpec {
    pub target: RequestTarget,
    pub endpoint: RequestTarget,
    /// How many times to send this request.
    #[serde(default = "default_count")]
    pub count: u32,
    #[serde(default)]
    pub interval_secs: u64,
}

fn default_generator_start_secs() -> u64 {
    300
}

fn default_generator_finish_secs() -> u64 {
    3600
}

/// How traffic is driven through the overlay during the stable window.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DriveSpec {
    /// Send requests through the API requester.
    Requester {
        requester: RequesterOptions,
        #[serde(default)]
        requests: Vec<RequestSpec>,
    },
    /// Deploy a generator pod and wait for its readiness to flip from
    /// Ready=True to Ready=False.
    Generator {
        generator: Value,
        #[serde(default = "default_generator_start_secs")]
        start_timeout_secs: u64,
        #[serde(default = "default_generator_finish_secs")]
        finish_timeout_secs: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TimingSpec {
    pub cold_start_secs: u64,
    pub drain_secs: u64,
    pub rollout_timeout_secs: u64,
    pub empty_timeout_secs: u64,
    pub cleanup_timeout_secs: u64,
    /// Pause between cluster polls while waiting.
    pub poll_interval_secs: u64,
}

impl Default for TimingSpec {
    fn default() -> Self {
        Self {
            cold_start_secs: 60,
            drain_secs: 30,
            rollout_timeout_secs: 600,
            empty_timeout_secs: 300,
            cleanup_timeout_secs: 600,
            poll_interval_secs: 2,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct StackInfo {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub extra_fields: Vec<String>,
}

/// Typed view over the resolved option tree.
#[derive(Debug, Clone, Deserialize)]
pub struct ExperimentSpec {
    pub experiment: ExperimentInfo,
    pub namespace: String,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default)]
    pub kube_config: Option<PathBuf>,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub skip_check: bool,
    #[serde(default = "yes")]
    pub wait_for_ready: bool,
    pub nodes: Vec<Value>,
    pub drive: DriveSpec,
    #[serde(default)]
    pub timing: TimingSpec,
    #[serde(default)]
    pub metadata: MetadataSpec,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub stack: StackInfo,
}

/// An experiment: the authoritative option tree and its typed projection.
#[derive(Debug, Clone)]
pub struct Experiment {
    pub tree: Value,
    pub spec: ExperimentSpec,
}

impl Experiment {
    pub fn load(path: &Path, overrides: &[(String, Value)]) -> Result<Self> {
        let tree = load_tree(path)?;
        Self::from_tree(tree, overrides)
            .with_context(|| format!("invalid experiment spec {}", path.display()))
    }

    pub fn from_tree(mut tree: Value, overrides: &[(String, Value)]) -> Result<Self> {
        apply_overrides(&mut tree, overrides)?;
        validate_required_fields(&tree)?;
        fill_namespace_defaults(&mut tree);
        let spec: ExperimentSpec = serde_json::from_value(tree.clone())
            .map_err(|e| RunError::InvalidSpec(e.to_string()))?;
        if spec.nodes.is_empty() {
            return Err(anyhow!("experiment '{}' declares no node groups", spec.experiment.name));
        }
        Ok(Self { tree, spec })
    }

    pub fn name(&self) -> &str {
        &self.spec.experiment.name
    }

    pub fn namespace(&self) -> &str {
        &self.spec.namespace
    }
}

pub fn load_tree(path: &Path) -> Result<Value> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let tree: Value = serde_yaml::from_str(&raw)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    if !tree.is_object() {
        return Err(anyhow!("{} must hold a mapping at the top level", path.display()));
    }
    Ok(tree)
}

/// Writes each `path=value` binding into `tree`, replacing existing leaves.
pub fn apply_overrides(tree: &mut Value, overrides: &[(String, Value)]) -> Result<(), RunError> {
    let policy = SetPolicy {
        replace_leaf: true,
        replace_nondict_stems: false,
    };
    for (path, value) in overrides {
        tree::set(tree, path.as_str(), value.clone(), policy)?;
    }
    Ok(())
}

/// Lists every missing required path at once.
pub fn validate_required_fields(tree: &Value) -> Result<(), RunError> {
    let missing: Vec<String> = REQUIRED_FIELDS
        .iter()
        .filter(|path| match tree::get(tree, **path) {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.is_empty(),
            Some(Value::Array(a)) => a.is_empty(),
            _ => false,
        })
        .map(|p| p.to_string())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(RunError::MissingFields(missing))
    }
}

/// Node groups, the generator and the requester inherit the experiment
/// namespace unless they name their own.
fn fill_namespace_defaults(tree: &mut Value) {
    let Some(ns) = tree.get("namespace").cloned() else {
        return;
    };
    let defaults = json!({ "namespace": ns });
    if let Some(nodes) = tree.get_mut("nodes").and_then(Value::as_array_mut) {
        for node in nodes {
            tree::merge_missing(node, &defaults);
        }
    }
    if let Some(drive) = tree.get_mut("drive") {
        for key in ["generator", "requester"] {
            if let Some(section) = drive.get_mut(key) {
                tree::merge_missing(section, &defaults);
            }
        }
    }
}

/// Everything BUILD produces.
#[derive(Debug, Clone)]
pub struct Workloads {
    pub nodes: Vec<NodeGroup>,
    pub generator: Option<Manifest>,
}

impl Workloads {
    /// All descriptors in deploy order.
    pub fn manifests(&self) -> Vec<&Manifest> {
        let mut out: Vec<&Manifest> = self.nodes.iter().flat_map(|g| g.manifests()).collect();
        out.extend(self.generator.iter());
        out
    }
}

pub fn build_workloads(spec: &ExperimentSpec) -> Result<Workloads, BuildError> {
    let nodes = spec
        .nodes
        .iter()
        .map(build_node_group)
        .collect::<Result<Vec<_>, _>>()?;
    let generator = match &spec.drive {
        DriveSpec::Generator { generator, .. } => Some(build_generator_pod(generator)?),
        DriveSpec::Requester { .. } => None,
    };
    Ok(Workloads { nodes, generator })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> Value {
        json!({
            "experiment": { "name": "regression", "class": "waku" },
            "namespace": "zerotesting",
            "nodes": [
                { "name": "nodes", "image": "wakuorg/nwaku:latest", "replicas": 10,
                  "presets": ["regression"] }
            ],
            "drive": {
                "mode": "generator",
                "generator": { "name": "publisher", "image": "publisher:latest" }
            },
            "timing": { "cold_start_secs": 5 }
        })
    }

    #[test]
    fn validate_required_fields_reports_all_missing() {
        let err = validate_required_fields(&json!({"nodes": []})).expect_err("missing");
        let RunError::MissingFields(missing) = err else {
            panic!("expected MissingFields");
        };
        assert_eq!(missing, vec!["experiment.name", "namespace", "nodes", "drive.mode"]);
    }

    #[test]
    fn validate_required_fields_passes_on_complete_spec() {
        validate_required_fields(&minimal()).expect("complete");
    }

    #[test]
    fn overrides_replace_leaves_and_reach_the_projection() {
        let exp = Experiment::from_tree(
            minimal(),
            &[
                ("timing.drain_secs".to_string(), json!(5)),
                ("nodes.0.replicas".to_string(), json!(3)),
                ("namespace".to_string(), json!("other")),
            ],
        )
        .expect("experiment");
        assert_eq!(exp.spec.timing.drain_secs, 5);
        assert_eq!(exp.spec.timing.cold_start_secs, 5);
        assert_eq!(exp.spec.timing.rollout_timeout_secs, 600);
        assert_eq!(exp.spec.timing.poll_interval_secs, 2);
        assert_eq!(exp.spec.nodes[0]["replicas"], 3);
        assert_eq!(exp.tree["nodes"][0]["namespace"], "other");
    }

    #[test]
    fn namespace_flows_into_workloads() {
        let exp = Experiment::from_tree(minimal(), &[]).expect("experiment");
        let workloads = build_workloads(&exp.spec).expect("build");
        let manifests = workloads.manifests();
        assert_eq!(manifests.len(), 3);
        assert!(manifests.iter().all(|m| m.namespace() == "zerotesting"));
        assert_eq!(manifests[2].name(), "publisher");
    }

    #[test]
    fn requester_drive_parses() {
        let mut tree = minimal();
        tree["drive"] = json!({
            "mode": "requester",
            "requester": { "service": "api-requester" },
            "requests": [{
                "target": { "kind": "name", "value": "nodes" },
                "endpoint": { "kind": "name", "value": "publish" },
                "count": 10
            }]
        });
        let exp = Experiment::from_tree(tree, &[]).expect("experiment");
        let DriveSpec::Requester { requester, requests } = &exp.spec.drive else {
            panic!("expected requester drive");
        };
        assert_eq!(requester.namespace, "zerotesting");
        assert_eq!(requester.app, "api-requester");
        assert_eq!(requests[0].count, 10);
    }

    #[test]
    fn load_reads_yaml() {
        let dir = std::env::temp_dir().join(format!(
            "mixlab_config_{}_{}",
            std::process::id(),
            chrono::Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).expect("mkdir");
        let path = dir.join("experiment.yaml");
        fs::write(
            &path,
            "experiment:\n  name: smoke\nnamespace: ns\nnodes:\n  - name: n\n    image: img\ndrive:\n  mode: generator\n  generator:\n    name: pub\n    image: pub\n",
        )
        .expect("write");
        let exp = Experiment::load(&path, &[]).expect("load");
        assert_eq!(exp.name(), "smoke");
        assert!(!exp.spec.skip_check);
        assert!(exp.spec.wait_for_ready);
        let _ = fs::remove_dir_all(&dir);
    }
}
