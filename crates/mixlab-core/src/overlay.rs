//! Overlay node groups: presets and builder steps for the nodes under test.
//!
//! Everything here layers under user input. Presets and helper steps add
//! arguments with [`DuplicatePolicy::Ignore`], so a flag the user already
//! set is never touched.

use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::str::FromStr;
use tracing::debug;

use crate::builder::{build_pod, GroupBuilder};
use crate::command::{Arg, Command, DuplicatePolicy};
use crate::error::BuildError;
use crate::kind::ResourceKind;
use crate::manifest::Manifest;
use crate::tree;
use crate::workload::{
    ContainerConfig, EnvConfig, ManagementPolicy, MountConfig, Order, PodTemplateConfig,
    PortConfig, ProbeConfig, PullPolicy, VolumeConfig, APP_LABEL,
};

pub const NODE_CONTAINER: &str = "node";
pub const NODE_PROGRAM: &str = "/usr/bin/wakunode";
pub const REST_PORT: i32 = 8645;
pub const METRICS_PORT: i32 = 8008;
pub const P2P_PORT: i32 = 60000;
pub const DISCV5_PORT: i32 = 9000;
pub const STORE_VOLUME: &str = "store-data";
pub const STORE_MOUNT_PATH: &str = "/data";
pub const BOOTSTRAP_FLAG: &str = "--discv5-bootstrap-node";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preset {
    Regression,
    Bootstrap,
}

impl Preset {
    pub fn args(&self) -> Vec<Arg> {
        match self {
            Preset::Regression => vec![
                Arg::pair("--relay", true),
                Arg::pair("--rest", true),
                Arg::pair("--rest-admin", true),
                Arg::pair("--rest-address", "0.0.0.0"),
                Arg::pair("--rest-port", REST_PORT),
                Arg::pair("--metrics-server", true),
                Arg::pair("--metrics-server-address", "0.0.0.0"),
                Arg::pair("--log-format", "JSON"),
                Arg::pair("--max-connections", 150),
            ],
            Preset::Bootstrap => vec![
                Arg::pair("--relay", true),
                Arg::pair("--discv5-discovery", true),
                Arg::pair("--discv5-udp-port", DISCV5_PORT),
                Arg::pair("--peer-exchange", true),
            ],
        }
    }
}

impl FromStr for Preset {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "regression" => Ok(Preset::Regression),
            "bootstrap" => Ok(Preset::Bootstrap),
            other => Err(BuildError::UnknownPreset(other.to_string())),
        }
    }
}

/// The last command of a container's entrypoint, which is the node itself;
/// anything before it is setup (sourcing env files and the like).
fn node_command<'a>(
    builder: &'a mut GroupBuilder,
    container: &str,
) -> Result<&'a mut Command, BuildError> {
    let c = builder.container_mut(container)?;
    let name = c.name.clone();
    c.command_config
        .commands
        .last_mut()
        .ok_or_else(|| BuildError::InvalidOption {
            path: format!("containers.{}.command", name),
            reason: "container has no command".to_string(),
        })
}

impl GroupBuilder {
    pub fn with_preset(&mut self, container: &str, preset: Preset) -> Result<&mut Self, BuildError> {
        node_command(self, container)?.add_args(preset.args(), DuplicatePolicy::Ignore)?;
        Ok(self)
    }

    /// Turns on the message store with `retention` and backs it with an
    /// emptyDir volume.
    pub fn with_store(&mut self, container: &str, retention: &str) -> Result<&mut Self, BuildError> {
        node_command(self, container)?.add_args(
            [
                Arg::pair("--store", true),
                Arg::pair("--store-message-retention-policy", retention),
                Arg::pair(
                    "--store-message-db-url",
                    format!("sqlite://{}/store.sqlite3", STORE_MOUNT_PATH),
                ),
            ],
            DuplicatePolicy::Ignore,
        )?;
        if !self
            .config()
            .pod_template
            .pod_spec
            .declared_volumes()
            .contains(STORE_VOLUME)
        {
            self.with_volume(VolumeConfig::empty_dir(STORE_VOLUME))?;
        }
        self.container_mut(container)?
            .add_volume_mount(MountConfig::new(STORE_VOLUME, STORE_MOUNT_PATH))?;
        Ok(self)
    }

    /// One bootstrap flag per peer. If the user listed any bootstrap node
    /// themselves, theirs are kept and these are skipped.
    pub fn with_bootstrap_peers<I, S>(
        &mut self,
        container: &str,
        peers: I,
    ) -> Result<&mut Self, BuildError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let args: Vec<Arg> = peers
            .into_iter()
            .map(|p| Arg::pair(BOOTSTRAP_FLAG, p.as_ref()))
            .collect();
        node_command(self, container)?.add_args(args, DuplicatePolicy::Ignore)?;
        Ok(self)
    }

    /// HTTP readiness probe against the node's REST port. The REST server is
    /// switched on if the user did not configure it.
    pub fn with_readiness_probe(
        &mut self,
        container: &str,
        path: &str,
        overwrite: bool,
    ) -> Result<&mut Self, BuildError> {
        let cmd = node_command(self, container)?;
        cmd.add_args(
            [
                Arg::pair("--rest", true),
                Arg::pair("--rest-address", "0.0.0.0"),
                Arg::pair("--rest-port", REST_PORT),
            ],
            DuplicatePolicy::Ignore,
        )?;
        let port = cmd
            .find_arg("--rest-port")
            .flatten()
            .and_then(|p| p.parse::<i32>().ok())
            .unwrap_or(REST_PORT);
        self.container_mut(container)?
            .set_readiness_probe(ProbeConfig::http_get(path, port), overwrite)?;
        Ok(self)
    }

    /// Sources `path` before starting the node. The file is expected to be
    /// written by an init container into a shared volume.
    pub fn with_env_source_file(
        &mut self,
        container: &str,
        path: &str,
    ) -> Result<&mut Self, BuildError> {
        let c = self.container_mut(container)?;
        let source = format!(". {}", path);
        if c.command_config.find_command(&source).is_none() {
            c.command_config.prepend(Command::new(source));
        }
        c.command_config.single_shell = false;
        Ok(self)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreOptions {
    pub retention: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReadinessOptions {
    #[serde(default = "default_readiness_path")]
    pub path: String,
}

fn default_readiness_path() -> String {
    "/health".to_string()
}

/// Typed view over one node-group entry of the experiment options.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeGroupOptions {
    pub name: String,
    pub namespace: String,
    pub image: String,
    pub replicas: i32,
    pub kind: String,
    pub command: String,
    pub pull_policy: PullPolicy,
    pub management_policy: ManagementPolicy,
    #[serde(default)]
    pub multiline: bool,
    /// Flag name to value. `null` renders a bare flag; a list repeats the
    /// flag once per element.
    #[serde(default)]
    pub args: serde_json::Map<String, Value>,
    #[serde(default)]
    pub presets: Vec<String>,
    #[serde(default)]
    pub store: Option<StoreOptions>,
    #[serde(default)]
    pub bootstrap_peers: Vec<String>,
    #[serde(default)]
    pub readiness: Option<ReadinessOptions>,
    #[serde(default)]
    pub env_source_file: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub resources: ResourceOptions,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResourceOptions {
    #[serde(default)]
    pub requests: BTreeMap<String, String>,
    #[serde(default)]
    pub limits: BTreeMap<String, String>,
}

/// Option-level defaults merged under every node group.
pub fn node_group_defaults() -> Value {
    json!({
        "replicas": 1,
        "kind": "StatefulSet",
        "command": NODE_PROGRAM,
        "pull_policy": "if_absent",
        "management_policy": "parallel",
    })
}

impl NodeGroupOptions {
    /// Projects `options` after layering [`node_group_defaults`] under it.
    /// The caller's tree is left untouched.
    pub fn from_tree(options: &Value) -> Result<Self, BuildError> {
        let mut resolved = options.clone();
        tree::merge_missing(&mut resolved, &node_group_defaults());
        serde_json::from_value(resolved).map_err(|e| BuildError::InvalidOption {
            path: options
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("<node group>")
                .to_string(),
            reason: e.to_string(),
        })
    }
}

fn normalize_flag(key: &str) -> String {
    if key.starts_with('-') {
        key.to_string()
    } else {
        format!("--{}", key)
    }
}

/// Converts an args mapping into ordered command arguments.
pub fn args_from_map(args: &serde_json::Map<String, Value>) -> Result<Vec<Arg>, BuildError> {
    let mut out = Vec::new();
    for (key, value) in args {
        let flag = normalize_flag(key);
        match value {
            Value::Null => out.push(Arg::flag(flag)),
            Value::Array(items) => {
                for item in items {
                    out.push(Arg::pair(flag.clone(), scalar(key, item)?));
                }
            }
            other => out.push(Arg::pair(flag, scalar(key, other)?)),
        }
    }
    Ok(out)
}

fn scalar(key: &str, value: &Value) -> Result<String, BuildError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Bool(_) | Value::Number(_) => Ok(value.to_string()),
        _ => Err(BuildError::InvalidOption {
            path: format!("args.{}", key),
            reason: "expected a scalar or a list of scalars".to_string(),
        }),
    }
}

/// A replicated group of overlay nodes and its headless service.
#[derive(Debug, Clone)]
pub struct NodeGroup {
    pub group: Manifest,
    pub service: Manifest,
}

impl NodeGroup {
    pub fn manifests(&self) -> [&Manifest; 2] {
        [&self.service, &self.group]
    }
}

pub fn node_group_builder(opts: &NodeGroupOptions) -> Result<GroupBuilder, BuildError> {
    let kind = ResourceKind::from_str(&opts.kind).map_err(|e| BuildError::InvalidOption {
        path: format!("{}.kind", opts.name),
        reason: e,
    })?;

    let mut command = Command::new(opts.command.clone()).multiline(opts.multiline);
    command.add_args(args_from_map(&opts.args)?, DuplicatePolicy::Error)?;

    let mut container = ContainerConfig::new(NODE_CONTAINER, opts.image.clone());
    container.pull_policy = opts.pull_policy;
    container.command_config.push(command);
    container.resources.requests = opts.resources.requests.clone();
    container.resources.limits = opts.resources.limits.clone();
    container.add_port(PortConfig::tcp("rest", REST_PORT));
    container.add_port(PortConfig::tcp("metrics", METRICS_PORT));
    container.add_port(PortConfig::tcp("libp2p", P2P_PORT));
    container.add_env(EnvConfig::field("IP", "status.podIP"))?;

    let mut builder = GroupBuilder::new();
    builder
        .with_name(opts.name.clone())
        .with_namespace(opts.namespace.clone())
        .with_app(opts.name.clone())
        .with_service_name(opts.name.clone())
        .with_management_policy(opts.management_policy)
        .with_kind(kind)?
        .with_replicas(opts.replicas)?
        .with_container(container, Order::Append)?;
    for (k, v) in &opts.labels {
        builder.with_label(k.clone(), v.clone());
    }
    builder
        .config_mut()
        .pod_spec_mut()
        .add_dns_search(format!("{}.{}.svc.cluster.local", opts.name, opts.namespace));

    for preset in &opts.presets {
        builder.with_preset(NODE_CONTAINER, preset.parse()?)?;
    }
    if !opts.bootstrap_peers.is_empty() {
        builder.with_bootstrap_peers(NODE_CONTAINER, &opts.bootstrap_peers)?;
    }
    if let Some(store) = &opts.store {
        builder.with_store(NODE_CONTAINER, &store.retention)?;
    }
    if let Some(readiness) = &opts.readiness {
        builder.with_readiness_probe(NODE_CONTAINER, &readiness.path, false)?;
    }
    if let Some(path) = &opts.env_source_file {
        builder.with_env_source_file(NODE_CONTAINER, path)?;
    }
    Ok(builder)
}

/// Builds the node group described by `options`.
pub fn build_node_group(options: &Value) -> Result<NodeGroup, BuildError> {
    let opts = NodeGroupOptions::from_tree(options)?;
    let builder = node_group_builder(&opts)?;
    let group = builder.build()?;
    let service = builder.build_service()?;
    debug!(name = %opts.name, replicas = opts.replicas, "built node group");
    Ok(NodeGroup { group, service })
}

/// Typed view over the traffic generator entry of the experiment options.
#[derive(Debug, Clone, Deserialize)]
pub struct GeneratorOptions {
    pub name: String,
    pub namespace: String,
    pub image: String,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: serde_json::Map<String, Value>,
    #[serde(default)]
    pub pull_policy: PullPolicy,
}

/// The traffic generator runs as a bare pod that is never restarted, so its
/// readiness settles at false once it has published everything.
pub fn build_generator_pod(options: &Value) -> Result<Manifest, BuildError> {
    let opts: GeneratorOptions =
        serde_json::from_value(options.clone()).map_err(|e| BuildError::InvalidOption {
            path: "generator".to_string(),
            reason: e.to_string(),
        })?;
    let mut container = ContainerConfig::new("generator", opts.image.clone());
    container.pull_policy = opts.pull_policy;
    if let Some(program) = &opts.command {
        let mut command = Command::new(program.clone());
        command.add_args(args_from_map(&opts.args)?, DuplicatePolicy::Error)?;
        container.command_config.push(command);
        container.command_config.single_shell = true;
    }
    let mut template = PodTemplateConfig {
        name: Some(opts.name.clone()),
        namespace: Some(opts.namespace.clone()),
        ..Default::default()
    };
    template
        .labels
        .insert(APP_LABEL.to_string(), opts.name.clone());
    template.pod_spec.restart_policy = Some("Never".to_string());
    template
        .pod_spec
        .add_container(container, Order::Append)?;
    build_pod(&template)
}
