use thiserror::Error;

use crate::command::CommandError;
use crate::kind::ResourceKind;
use crate::tree::TreeError;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("env var '{name}' already set on container '{container}'")]
    DuplicateEnv { container: String, name: String },
    #[error("container '{0}' already has a readiness probe (pass overwrite to replace it)")]
    ProbeExists(String),
    #[error("volume '{0}' declared twice")]
    DuplicateVolume(String),
    #[error("container '{0}' declared twice")]
    DuplicateContainer(String),
    #[error("mount path '{path}' used twice on container '{container}'")]
    DuplicateMount { container: String, path: String },
    #[error("container '{container}' mounts undeclared volume '{volume}'")]
    UnknownVolume { container: String, volume: String },
    #[error("no container named '{0}'")]
    UnknownContainer(String),
    #[error("descriptor is missing required field {0}")]
    MissingField(&'static str),
    #[error("{kind} does not support {feature}")]
    Unsupported {
        kind: ResourceKind,
        feature: &'static str,
    },
    #[error("unknown preset '{0}'")]
    UnknownPreset(String),
    #[error("invalid option at '{path}': {reason}")]
    InvalidOption { path: String, reason: String },
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error(transparent)]
    Tree(#[from] TreeError),
}
