pub mod config;
pub mod error;
pub mod events;
pub mod metadata;
pub mod rundir;
pub mod runner;

pub use config::{
    apply_overrides, build_workloads, load_tree, validate_required_fields, DriveSpec, Experiment,
    ExperimentSpec, RequestSpec, TimingSpec, Workloads,
};
pub use error::RunError;
pub use events::{read_events, EventLog};
pub use metadata::{build_run_metadata, extract_metadata, MetadataContext, MetadataSpec};
pub use rundir::{canonical_json_digest, RunControlGuard, RunDir};
pub use runner::{
    CleanupAction, CleanupStack, ExperimentRunner, Phase, RunOptions, RunOutcome, RunStatus,
};
