//! Cluster-facing half of mixlab: the orchestrator driver, the pod command
//! channel and the side-channel requester client.

pub mod driver;
pub mod exec;
pub mod requester;

pub use driver::{
    ApplyOptions, ConditionMatch, DeleteSummary, DriverError, KubeDriver, ObjectFilter,
    Orchestrator, ResourceBundle,
};
pub use exec::{exec_in_pod, ChannelState, ExecError, ExecOptions, PodChannel};
pub use requester::{
    discover_requester, RequestError, RequestTarget, Requester, RequesterOptions, SideChannel,
};
