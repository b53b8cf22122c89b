//! On-disk layout of a run.

use anyhow::Result;
use chrono::Utc;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use mixlab_core::Manifest;

pub const EVENTS_FILE: &str = "events.log";
pub const RESOLVED_FILE: &str = "resolved_experiment.json";
pub const DIGEST_FILE: &str = "resolved_experiment.digest";
pub const METADATA_FILE: &str = "metadata.json";

pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = Map::new();
            for k in keys {
                out.insert(k.clone(), canonicalize(&map[k.as_str()]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// sha256 over the key-sorted compact JSON encoding.
pub fn canonical_json_digest(value: &Value) -> Result<String> {
    let bytes = serde_json::to_vec(&canonicalize(value))?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// `<output_dir>/<experiment>/run_<YYYYmmdd_HHMMSS>`, one per run.
#[derive(Debug, Clone)]
pub struct RunDir {
    root: PathBuf,
    run_id: String,
    subdir: String,
}

impl RunDir {
    pub fn create(output_dir: &Path, experiment: &str) -> Result<Self> {
        let base = format!("run_{}", Utc::now().format("%Y%m%d_%H%M%S"));
        let parent = output_dir.join(experiment);
        fs::create_dir_all(&parent)?;
        let mut run_id = base.clone();
        let mut n = 1;
        while parent.join(&run_id).exists() {
            run_id = format!("{}_{}", base, n);
            n += 1;
        }
        let root = parent.join(&run_id);
        fs::create_dir_all(root.join("manifests"))?;
        fs::create_dir_all(root.join("runtime"))?;
        Ok(Self {
            subdir: format!("{}/{}", experiment, run_id),
            root,
            run_id,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Path relative to the output directory.
    pub fn subdir(&self) -> &str {
        &self.subdir
    }

    pub fn events_path(&self) -> PathBuf {
        self.root.join(EVENTS_FILE)
    }

    pub fn run_control_path(&self) -> PathBuf {
        self.root.join("runtime").join("run_control.json")
    }

    /// Writes the resolved option tree and its digest; returns the digest.
    pub fn write_resolved(&self, tree: &Value) -> Result<String> {
        atomic_write_json_pretty(&self.root.join(RESOLVED_FILE), tree)?;
        let digest = canonical_json_digest(tree)?;
        atomic_write_bytes(&self.root.join(DIGEST_FILE), format!("{}\n", digest).as_bytes())?;
        Ok(digest)
    }

    pub fn write_manifest(&self, manifest: &Manifest) -> Result<PathBuf> {
        let path = self
            .root
            .join("manifests")
            .join(format!("{}.yaml", manifest.file_stem()));
        let yaml = serde_yaml::to_string(&manifest.to_value()?)?;
        atomic_write_bytes(&path, yaml.as_bytes())?;
        Ok(path)
    }

    pub fn write_metadata(&self, metadata: &Value) -> Result<()> {
        atomic_write_json_pretty(&self.root.join(METADATA_FILE), metadata)
    }

    pub fn write_run_control(&self, status: &str, phase: Option<&str>) -> Result<()> {
        let payload = json!({
            "schema_version": "run_control_v1",
            "run_id": self.run_id,
            "status": status,
            "phase": phase,
            "updated_at": Utc::now().to_rfc3339(),
        });
        atomic_write_json_pretty(&self.run_control_path(), &payload)
    }
}

/// Marks the run `failed` on drop unless [`complete`](Self::complete) ran.
pub struct RunControlGuard {
    run_dir: RunDir,
    done: bool,
}

impl RunControlGuard {
    pub fn new(run_dir: &RunDir) -> Self {
        Self {
            run_dir: run_dir.clone(),
            done: false,
        }
    }

    pub fn complete(&mut self, status: &str) -> Result<()> {
        self.run_dir.write_run_control(status, None)?;
        self.done = true;
        Ok(())
    }
}

impl Drop for RunControlGuard {
    fn drop(&mut self) {
        if !self.done {
            let _ = self.run_dir.write_run_control("failed", None);
        }
    }
}
