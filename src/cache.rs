//! On-disk cache of the last successful PAN scan. A fresh cache lets the
//! worker skip the slow active scan after a restart; the file's modification
//! time is its own TTL witness.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const DEFAULT_PATH: &str = "scancache.json";

const DEFAULT_TTL: Duration = Duration::from_secs(3600);

/// PAN descriptor assembled from an `EPANDESC` block. `pan_id`, `channel`
/// and `addr` are required for a usable descriptor; the rest is carried for
/// diagnostics. Serde names match the dongle's key spelling so the cache
/// file mirrors the wire format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanResult {
    #[serde(rename = "Pan ID")]
    pub pan_id: String,
    #[serde(rename = "Channel")]
    pub channel: String,
    #[serde(rename = "Addr")]
    pub addr: String,
    #[serde(rename = "Channel Page", skip_serializing_if = "Option::is_none")]
    pub channel_page: Option<String>,
    #[serde(rename = "LQI", skip_serializing_if = "Option::is_none")]
    pub lqi: Option<String>,
    #[serde(rename = "PairID", skip_serializing_if = "Option::is_none")]
    pub pair_id: Option<String>,
}

impl ScanResult {
    /// Build a descriptor from collected `key:value` continuation pairs.
    /// `None` unless all three required keys are present.
    pub fn from_pairs(mut pairs: HashMap<String, String>) -> Option<Self> {
        Some(Self {
            pan_id: pairs.remove("Pan ID")?,
            channel: pairs.remove("Channel")?,
            addr: pairs.remove("Addr")?,
            channel_page: pairs.remove("Channel Page"),
            lqi: pairs.remove("LQI"),
            pair_id: pairs.remove("PairID"),
        })
    }
}

pub struct ScanCache {
    path: PathBuf,
    ttl: Duration,
}

impl ScanCache {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            ttl: DEFAULT_TTL,
        }
    }

    #[cfg(test)]
    fn with_ttl(path: PathBuf, ttl: Duration) -> Self {
        Self { path, ttl }
    }

    /// Return the cached descriptor when the file exists, is younger than the
    /// TTL and parses with the required keys. A stale cache is simply a miss;
    /// a malformed one is deleted.
    pub fn load(&self) -> Option<ScanResult> {
        let meta = fs::metadata(&self.path).ok()?;
        let age = meta
            .modified()
            .ok()
            .and_then(|mtime| mtime.elapsed().ok())
            .unwrap_or_default();
        if age >= self.ttl {
            debug!(path = %self.path.display(), "scan cache is stale");
            return None;
        }

        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "cannot read scan cache");
                return None;
            }
        };
        match serde_json::from_str::<ScanResult>(&contents) {
            Ok(result) => Some(result),
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "malformed scan cache, deleting");
                self.invalidate();
                None
            }
        }
    }

    pub fn store(&self, result: &ScanResult) {
        let json = match serde_json::to_string_pretty(result) {
            Ok(json) => json,
            Err(err) => {
                warn!(error = %err, "cannot serialize scan result");
                return;
            }
        };
        if let Err(err) = fs::write(&self.path, json) {
            warn!(path = %self.path.display(), error = %err, "cannot write scan cache");
        }
    }

    pub fn invalidate(&self) {
        if let Err(err) = fs::remove_file(&self.path) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %err, "cannot delete scan cache");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> ScanResult {
        ScanResult {
            pan_id: "8888".into(),
            channel: "21".into(),
            addr: "001D129012345678".into(),
            channel_page: Some("09".into()),
            lqi: Some("E1".into()),
            pair_id: Some("00000001".into()),
        }
    }

    #[test]
    fn store_then_load_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = ScanCache::new(dir.path().join("scancache.json"));
        cache.store(&descriptor());

        let loaded = cache.load().expect("fresh cache should hit");
        assert_eq!(loaded, descriptor());

        // on-disk keys use the dongle's spelling
        let raw = fs::read_to_string(dir.path().join("scancache.json")).expect("read");
        assert!(raw.contains("\"Pan ID\""));
        assert!(raw.contains("\"Addr\""));
    }

    #[test]
    fn stale_cache_misses_but_survives() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("scancache.json");
        let cache = ScanCache::with_ttl(path.clone(), Duration::ZERO);
        cache.store(&descriptor());

        assert!(cache.load().is_none());
        assert!(path.exists(), "stale cache must not be deleted");
    }

    #[test]
    fn malformed_cache_is_deleted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("scancache.json");
        fs::write(&path, "{ not json").expect("write");

        let cache = ScanCache::new(path.clone());
        assert!(cache.load().is_none());
        assert!(!path.exists(), "malformed cache must be deleted");
    }

    #[test]
    fn cache_missing_required_keys_is_deleted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("scancache.json");
        fs::write(&path, r#"{"Channel": "21", "LQI": "E1"}"#).expect("write");

        let cache = ScanCache::new(path.clone());
        assert!(cache.load().is_none());
        assert!(!path.exists());
    }

    #[test]
    fn from_pairs_requires_core_keys() {
        let mut pairs = HashMap::new();
        pairs.insert("Channel".to_string(), "21".to_string());
        pairs.insert("Pan ID".to_string(), "8888".to_string());
        assert!(ScanResult::from_pairs(pairs.clone()).is_none());

        pairs.insert("Addr".to_string(), "001D129012345678".to_string());
        let result = ScanResult::from_pairs(pairs).expect("complete descriptor");
        assert_eq!(result.pan_id, "8888");
        assert!(result.lqi.is_none());
    }
}
