use std::path::PathBuf;
use thiserror::Error;

use mixlab_core::{BuildError, TreeError};
use mixlab_kube::{DriverError, ExecError, RequestError};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("{path}:{line}: malformed event: {reason}")]
    MalformedEvent {
        path: PathBuf,
        line: usize,
        reason: String,
    },
    #[error("experiment spec missing required fields:\n{}", .0.iter().map(|p| format!("  - {}", p)).collect::<Vec<_>>().join("\n"))]
    MissingFields(Vec<String>),
    #[error("invalid experiment spec: {0}")]
    InvalidSpec(String),
    #[error("bad timestamp '{value}': {reason}")]
    Timestamp { value: String, reason: String },
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    Tree(#[from] TreeError),
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}
