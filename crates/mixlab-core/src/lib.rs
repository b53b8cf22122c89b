//! Option trees, entrypoint commands and workload descriptors for overlay
//! experiments. Nothing in this crate talks to a cluster.

pub mod builder;
pub mod command;
pub mod error;
pub mod kind;
pub mod manifest;
pub mod overlay;
pub mod tree;
pub mod workload;

pub use builder::{build_job, build_pod, GroupBuilder};
pub use command::{Arg, Command, CommandConfig, CommandError, DuplicatePolicy, Entrypoint};
pub use error::BuildError;
pub use kind::ResourceKind;
pub use manifest::Manifest;
pub use overlay::{build_generator_pod, build_node_group, NodeGroup, NodeGroupOptions, Preset};
pub use tree::{SetPolicy, TreeError, TreePath, VisitOrder};
