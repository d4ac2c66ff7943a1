//! Declarative worker configuration: a JSON file listing the workers to run
//! with their construction arguments. The queues between workers are ambient
//! and wired in by the supervisor.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::cache;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub workers: Vec<WorkerSpec>,
}

/// One worker to run, dispatched by `kind`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerSpec {
    BrouteReader {
        port: String,
        baudrate: u32,
        broute_id: String,
        broute_pwd: String,
        #[serde(default = "default_scan_cache")]
        scan_cache: PathBuf,
    },
    SerialReader {
        port: String,
        baudrate: u32,
        #[serde(default)]
        checker: Vec<CheckerSpec>,
    },
    FileRecorder {
        fname_base: String,
        /// Attach the upload queue so 10-minute aggregates are forwarded.
        #[serde(default)]
        upload: bool,
        #[serde(default = "default_data_dir")]
        data_dir: PathBuf,
        #[serde(default)]
        disp: Vec<DispSpec>,
    },
    HttpPostUploader {
        target_url: String,
        upload_key: String,
    },
}

/// Outlier limits for one sensor of one unit.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckerSpec {
    pub unit: String,
    pub sensor: String,
    pub min: f64,
    pub max: f64,
    pub variation: f64,
}

/// Routes matching samples to a `/tmp/DISP<filenumber>.txt` snapshot.
#[derive(Debug, Clone, Deserialize)]
pub struct DispSpec {
    pub unit: String,
    pub sensor: String,
    pub filenumber: String,
}

fn default_scan_cache() -> PathBuf {
    PathBuf::from(cache::DEFAULT_PATH)
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".")
}

pub fn load(path: &Path) -> Result<Config> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let config: Config = serde_json::from_str(&contents)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(config)
}
