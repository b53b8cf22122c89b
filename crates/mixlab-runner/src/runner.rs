//! The experiment lifecycle.
//!
//! ```text
//! INIT -> BUILD -> PRECHECK -> DEPLOY -> STEADY -> DRIVE -> DRAIN -> META -> DONE
//!                        any error -> TEARDOWN
//! ```
//!
//! Every applied resource is pushed onto a cleanup stack as soon as the
//! apply succeeds. Teardown unwinds that stack in reverse on every exit
//! path, so the event log always ends with `cleanup_finished` and
//! `run_finished`. An interrupt stops the phases at their next suspension
//! point and takes the same teardown path.

use anyhow::{anyhow, Result};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use mixlab_core::{Manifest, NodeGroup, ResourceKind};
use mixlab_kube::{
    ApplyOptions, ConditionMatch, DriverError, ObjectFilter, Orchestrator, ResourceBundle,
    SideChannel,
};

use crate::config::{build_workloads, DriveSpec, Experiment, Workloads};
use crate::events::{self, EventLog};
use crate::metadata::{build_run_metadata, MetadataContext};
use crate::rundir::{RunControlGuard, RunDir};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Build,
    Precheck,
    Deploy,
    Steady,
    Drive,
    Drain,
    Meta,
    Done,
    Teardown,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Init => "init",
            Phase::Build => "build",
            Phase::Precheck => "precheck",
            Phase::Deploy => "deploy",
            Phase::Steady => "steady",
            Phase::Drive => "drive",
            Phase::Drain => "drain",
            Phase::Meta => "meta",
            Phase::Done => "done",
            Phase::Teardown => "teardown",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    Failed,
    Interrupted,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Interrupted => "interrupted",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CleanupAction {
    pub label: String,
    pub namespace: String,
    pub bundle: ResourceBundle,
}

/// LIFO stack of teardown actions. Actions cannot be removed once pushed;
/// the only way out is [`unwind`](Self::unwind).
#[derive(Debug, Default)]
pub struct CleanupStack {
    actions: Vec<CleanupAction>,
}

impl CleanupStack {
    pub fn push(&mut self, action: CleanupAction) {
        debug!(label = %action.label, "registered cleanup");
        self.actions.push(action);
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Runs every action newest first. Failures are logged and skipped;
    /// returns how many actions failed.
    pub async fn unwind(&mut self, orchestrator: &dyn Orchestrator, timeout: Duration) -> usize {
        let mut failures = 0;
        while let Some(action) = self.actions.pop() {
            info!(label = %action.label, namespace = %action.namespace, "cleanup");
            match orchestrator
                .delete_resources(&action.bundle, &action.namespace)
                .await
            {
                Ok(summary) if summary.failed > 0 => {
                    warn!(label = %action.label, failed = summary.failed, "some deletes failed");
                    failures += 1;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(label = %action.label, error = %e, "delete failed");
                    failures += 1;
                    continue;
                }
            }
            if let Err(e) = orchestrator
                .wait_for_cleanup(&action.bundle, &action.namespace, timeout)
                .await
            {
                warn!(label = %action.label, error = %e, "cleanup wait failed");
                failures += 1;
            }
        }
        failures
    }
}

/// Invocation details recorded in the run metadata.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub command: Option<String>,
    pub overrides: Vec<(String, Value)>,
}

#[derive(Debug)]
pub struct RunOutcome {
    pub run_dir: PathBuf,
    pub status: RunStatus,
    pub metadata: Option<Value>,
    pub error: Option<String>,
}

pub struct ExperimentRunner<'a> {
    experiment: &'a Experiment,
    orchestrator: &'a dyn Orchestrator,
    side_channel: Option<&'a dyn SideChannel>,
    run_dir: RunDir,
    events: EventLog,
    cleanup: CleanupStack,
    phase: Phase,
    options: RunOptions,
    stack: Value,
}

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

/// The requester companion lives outside the experiment's lifecycle; when it
/// shares the experiment namespace it must not hold up the empty check.
fn precheck_filter(drive: &DriveSpec, namespace: &str) -> ObjectFilter {
    match drive {
        DriveSpec::Requester { requester, .. } if requester.namespace == namespace => {
            let mut filter = ObjectFilter::none()
                .exclude_app(&requester.app)
                .exclude_name(&requester.service);
            if let Some(pod) = &requester.pod_name {
                filter = filter.exclude_name(pod);
            }
            filter
        }
        _ => ObjectFilter::none(),
    }
}

impl<'a> ExperimentRunner<'a> {
    pub fn new(
        experiment: &'a Experiment,
        orchestrator: &'a dyn Orchestrator,
        run_dir: RunDir,
        options: RunOptions,
    ) -> Self {
        let events = EventLog::new(run_dir.events_path());
        Self {
            experiment,
            orchestrator,
            side_channel: None,
            run_dir,
            events,
            cleanup: CleanupStack::default(),
            phase: Phase::Init,
            options,
            stack: Value::Null,
        }
    }

    pub fn with_side_channel(mut self, channel: &'a dyn SideChannel) -> Self {
        self.side_channel = Some(channel);
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub async fn run(self) -> Result<RunOutcome> {
        self.run_until(std::future::pending()).await
    }

    /// Runs until the phases finish or `cancel` resolves. Either way the
    /// cleanup stack is unwound before returning.
    pub async fn run_until<F>(mut self, cancel: F) -> Result<RunOutcome>
    where
        F: Future<Output = ()>,
    {
        let mut guard = RunControlGuard::new(&self.run_dir);
        self.enter(Phase::Init)?;
        self.events.log(
            events::RUN_START,
            json!({
                "experiment": self.experiment.name(),
                "namespace": self.experiment.namespace(),
                "run_dir": self.run_dir.root().display().to_string(),
            }),
        )?;

        let result = tokio::select! {
            result = self.run_phases() => Some(result),
            _ = cancel => None,
        };
        let (status, metadata, error) = match result {
            Some(Ok(metadata)) => (RunStatus::Completed, Some(metadata), None),
            Some(Err(e)) => {
                let message = format!("{:#}", e);
                let timeout = e
                    .downcast_ref::<DriverError>()
                    .map_or(false, DriverError::is_timeout);
                warn!(phase = %self.phase, error = %message, timeout, "run failed");
                self.log_quiet(
                    events::RUN_ERROR,
                    json!({ "phase": self.phase.as_str(), "error": message, "timeout": timeout }),
                );
                (RunStatus::Failed, None, Some(message))
            }
            None => {
                warn!(phase = %self.phase, "run interrupted");
                self.log_quiet(
                    events::RUN_ERROR,
                    json!({ "phase": self.phase.as_str(), "error": "interrupted", "timeout": false }),
                );
                (RunStatus::Interrupted, None, Some("interrupted".to_string()))
            }
        };

        self.teardown().await;
        self.events
            .log(events::RUN_FINISHED, json!({ "status": status.as_str() }))?;
        guard.complete(status.as_str())?;
        info!(status = status.as_str(), run_dir = %self.run_dir.root().display(), "run finished");
        Ok(RunOutcome {
            run_dir: self.run_dir.root().to_path_buf(),
            status,
            metadata,
            error,
        })
    }

    fn enter(&mut self, phase: Phase) -> Result<()> {
        self.phase = phase;
        info!(phase = %phase, "entering phase");
        self.run_dir.write_run_control("running", Some(phase.as_str()))
    }

    fn log_quiet(&self, event: &str, fields: Value) {
        if let Err(e) = self.events.log(event, fields) {
            warn!(event, error = %e, "failed to write event");
        }
    }

    async fn run_phases(&mut self) -> Result<Value> {
        let experiment = self.experiment;
        let spec = &experiment.spec;

        self.enter(Phase::Build)?;
        let workloads = build_workloads(spec)?;
        self.run_dir.write_resolved(&experiment.tree)?;
        for manifest in workloads.manifests() {
            self.run_dir.write_manifest(manifest)?;
        }
        self.stack = self.stack_section(&workloads);

        self.enter(Phase::Precheck)?;
        self.precheck().await?;

        self.enter(Phase::Deploy)?;
        for group in &workloads.nodes {
            self.deploy_group(group).await?;
        }

        self.enter(Phase::Steady)?;
        self.events.log(
            events::STEADY_START,
            json!({ "cold_start_secs": spec.timing.cold_start_secs }),
        )?;
        tokio::time::sleep(secs(spec.timing.cold_start_secs)).await;

        self.enter(Phase::Drive)?;
        self.drive(workloads.generator.as_ref()).await?;

        self.enter(Phase::Drain)?;
        tokio::time::sleep(secs(spec.timing.drain_secs)).await;
        self.events.log(
            events::PUBLISHER_WAIT_FINISHED,
            json!({ "drain_secs": spec.timing.drain_secs }),
        )?;
        self.events.log(events::STEADY_END, Value::Null)?;
        self.events.log(events::INTERNAL_RUN_FINISHED, Value::Null)?;

        self.enter(Phase::Meta)?;
        let metadata = self.metadata_event()?;

        self.enter(Phase::Done)?;
        Ok(metadata)
    }

    async fn precheck(&mut self) -> Result<()> {
        let experiment = self.experiment;
        let (spec, ns) = (&experiment.spec, experiment.namespace());
        self.events.log(
            events::WAIT_FOR_CLEAR_START,
            json!({ "namespace": ns, "skip_check": spec.skip_check }),
        )?;
        if spec.skip_check {
            debug!(namespace = ns, "skipping empty-namespace check");
        } else {
            let filter = precheck_filter(&spec.drive, ns);
            self.orchestrator
                .wait_for_empty(
                    ns,
                    &ResourceKind::ALL,
                    &filter,
                    secs(spec.timing.empty_timeout_secs),
                )
                .await?;
        }
        self.events
            .log(events::WAIT_FOR_CLEAR_FINISHED, json!({ "namespace": ns }))?;
        Ok(())
    }

    async fn apply(&mut self, manifest: &Manifest) -> Result<()> {
        let ns = manifest.namespace();
        self.orchestrator
            .apply(manifest, ns, ApplyOptions::default())
            .await?;
        self.cleanup.push(CleanupAction {
            label: format!("{} {}", manifest.kind(), manifest.name()),
            namespace: ns.to_string(),
            bundle: ResourceBundle::from_manifests([manifest]),
        });
        Ok(())
    }

    /// Applies the group's service and workload, then waits for the
    /// workload to roll out.
    async fn deploy_group(&mut self, group: &NodeGroup) -> Result<()> {
        let experiment = self.experiment;
        let spec = &experiment.spec;
        let (name, ns) = (group.group.name(), group.group.namespace());
        self.events.log(
            events::DEPLOYMENT,
            json!({ "phase": "start", "service": name, "namespace": ns }),
        )?;
        for manifest in group.manifests() {
            self.apply(manifest).await?;
        }
        if spec.wait_for_ready {
            self.orchestrator
                .wait_for_rollout(
                    group.group.kind(),
                    name,
                    ns,
                    secs(spec.timing.rollout_timeout_secs),
                    None,
                )
                .await?;
        }
        self.events.log(
            events::DEPLOYMENT,
            json!({ "phase": "finished", "service": name, "namespace": ns }),
        )?;
        Ok(())
    }

    async fn drive(&mut self, generator: Option<&Manifest>) -> Result<()> {
        let experiment = self.experiment;
        match &experiment.spec.drive {
            DriveSpec::Requester { requests, .. } => {
                let channel = self
                    .side_channel
                    .ok_or_else(|| anyhow!("requester drive needs a side channel"))?;
                self.events.log(
                    events::PUBLISHER_DEPLOY_START,
                    json!({ "mode": "requester", "requests": requests.len() }),
                )?;
                let mut sent = 0u64;
                for request in requests {
                    for i in 0..request.count {
                        channel.request(&request.target, &request.endpoint).await?;
                        sent += 1;
                        if request.interval_secs > 0 && i + 1 < request.count {
                            tokio::time::sleep(secs(request.interval_secs)).await;
                        }
                    }
                }
                self.events.log(
                    events::PUBLISHER_MESSAGES_FINISHED,
                    json!({ "mode": "requester", "sent": sent }),
                )?;
            }
            DriveSpec::Generator {
                start_timeout_secs,
                finish_timeout_secs,
                ..
            } => {
                let pod = generator.ok_or_else(|| anyhow!("generator drive built no pod"))?;
                let (name, ns) = (pod.name(), pod.namespace());
                self.events.log(
                    events::PUBLISHER_DEPLOY_START,
                    json!({ "mode": "generator", "pod": name }),
                )?;
                self.apply(pod).await?;
                self.orchestrator
                    .wait_for_rollout(
                        ResourceKind::Pod,
                        name,
                        ns,
                        secs(*start_timeout_secs),
                        Some(&ConditionMatch::ready(true)),
                    )
                    .await?;
                self.orchestrator
                    .wait_for_rollout(
                        ResourceKind::Pod,
                        name,
                        ns,
                        secs(*finish_timeout_secs),
                        Some(&ConditionMatch::ready(false)),
                    )
                    .await?;
                self.events.log(
                    events::PUBLISHER_MESSAGES_FINISHED,
                    json!({ "mode": "generator", "pod": name }),
                )?;
            }
        }
        Ok(())
    }

    fn stack_section(&self, workloads: &Workloads) -> Value {
        let spec = &self.experiment.spec;
        let groups: Vec<&Manifest> = workloads.nodes.iter().map(|g| &g.group).collect();
        let namespaces: BTreeSet<&str> = groups.iter().map(|m| m.namespace()).collect();
        json!({
            "statefulsets": groups.iter().map(|m| m.name()).collect::<Vec<_>>(),
            "nodes_per_statefulset": groups.iter().map(|m| m.replicas().unwrap_or(1)).collect::<Vec<_>>(),
            "namespace": self.experiment.namespace(),
            "namespaces": namespaces.into_iter().collect::<Vec<_>>(),
            "name": spec.stack.name.clone().unwrap_or_else(|| self.experiment.name().to_string()),
            "extra_fields": spec.stack.extra_fields,
        })
    }

    fn metadata_context(&self) -> MetadataContext {
        let spec = &self.experiment.spec;
        let mut metadata = json!({
            "namespace": self.experiment.namespace(),
            "subdir": self.run_dir.subdir(),
        });
        if let Some(command) = &self.options.command {
            metadata["command"] = json!(command);
        }
        if let Some(path) = &spec.kube_config {
            metadata["kube_config"] = json!(path.display().to_string());
        }
        if !self.options.overrides.is_empty() {
            metadata["args"] = json!(self
                .options
                .overrides
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>());
        }
        if let Some(namespaces) = self.stack.get("namespaces").and_then(Value::as_array) {
            if namespaces.len() > 1 {
                metadata["namespaces"] = Value::Array(namespaces.clone());
            }
        }
        MetadataContext {
            experiment: json!({
                "experiment_name": self.experiment.name(),
                "experiment_class": spec.experiment.class,
            }),
            stack: self.stack.clone(),
            params: spec.params.clone(),
            metadata,
        }
    }

    fn metadata_event(&mut self) -> Result<Value> {
        let events = self.events.read()?;
        let metadata = build_run_metadata(
            &events,
            &self.experiment.spec.metadata,
            &self.metadata_context(),
        )?;
        self.events.log(events::METADATA, metadata.clone())?;
        self.run_dir.write_metadata(&metadata)?;
        Ok(metadata)
    }

    async fn teardown(&mut self) {
        self.phase = Phase::Teardown;
        if let Err(e) = self.run_dir.write_run_control("running", Some(Phase::Teardown.as_str())) {
            warn!(error = %e, "failed to update run control");
        }
        let pending = self.cleanup.len();
        self.log_quiet(events::CLEANUP_START, json!({ "actions": pending }));
        let timeout = secs(self.experiment.spec.timing.cleanup_timeout_secs);
        let failures = self.cleanup.unwind(self.orchestrator, timeout).await;
        self.log_quiet(
            events::CLEANUP_FINISHED,
            json!({ "actions": pending, "failures": failures }),
        );
    }
}
