use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   config.toml:     [liveness]
//                    idle_timeout_secs = 900
//
//   env var:         STOCKLINE_LIVENESS__IDLE_TIMEOUT_SECS=900
//                    (double underscore = nesting)
//
//   (single underscore stays within field names: STOCKLINE_SYNC__DATASET_PACING_MS)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub sync: SyncFileConfig,
    #[serde(default)]
    pub liveness: LivenessFileConfig,
}

/// Bind address knobs (lives under `[server]` in config.toml).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

/// Sync streaming knobs (lives under `[sync]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncFileConfig {
    /// Pause between dataset responses, to avoid saturating slow clients.
    #[serde(default = "default_dataset_pacing_ms")]
    pub dataset_pacing_ms: u64,
    /// Serialized payloads larger than this are compressed for clients
    /// that declared support.
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold_bytes: usize,
    /// Per-connection outbound queue depth before fan-out drops.
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

impl Default for SyncFileConfig {
    fn default() -> Self {
        Self {
            dataset_pacing_ms: default_dataset_pacing_ms(),
            compression_threshold_bytes: default_compression_threshold(),
            outbound_buffer: default_outbound_buffer(),
        }
    }
}

/// Heartbeat and eviction knobs (lives under `[liveness]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LivenessFileConfig {
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Connections idle past this are force-closed by the sweep.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

impl Default for LivenessFileConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

fn default_dataset_pacing_ms() -> u64 {
    100
}
fn default_compression_threshold() -> usize {
    1024
}
fn default_outbound_buffer() -> usize {
    256
}
fn default_heartbeat_interval_secs() -> u64 {
    30
}
fn default_sweep_interval_secs() -> u64 {
    300
}
fn default_idle_timeout_secs() -> u64 {
    600
}

/// Resolved sync configuration (runtime view).
#[derive(Clone, Debug)]
pub struct SyncConfig {
    pub dataset_pacing: Duration,
    pub compression_threshold: usize,
    pub outbound_buffer: usize,
}

impl SyncConfig {
    pub fn from_file(fc: &SyncFileConfig) -> Self {
        Self {
            dataset_pacing: Duration::from_millis(fc.dataset_pacing_ms),
            compression_threshold: fc.compression_threshold_bytes,
            outbound_buffer: fc.outbound_buffer,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::from_file(&SyncFileConfig::default())
    }
}

/// Resolved liveness configuration (runtime view).
#[derive(Clone, Debug)]
pub struct LivenessConfig {
    pub heartbeat_interval: Duration,
    pub sweep_interval: Duration,
    pub idle_timeout: Duration,
}

impl LivenessConfig {
    pub fn from_file(fc: &LivenessFileConfig) -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(fc.heartbeat_interval_secs),
            sweep_interval: Duration::from_secs(fc.sweep_interval_secs),
            idle_timeout: Duration::from_secs(fc.idle_timeout_secs),
        }
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self::from_file(&LivenessFileConfig::default())
    }
}

/// Build a figment that layers: defaults → config.toml → STOCKLINE_* env vars.
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("STOCKLINE_").split("__"))
}

/// Extract the layered configuration or fail with context.
pub fn resolve(data_dir: &Path) -> Result<FileConfig> {
    load_config(data_dir).extract().context("invalid configuration")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_timings() {
        let config = FileConfig::default();
        assert_eq!(config.sync.dataset_pacing_ms, 100);
        assert_eq!(config.sync.compression_threshold_bytes, 1024);
        assert_eq!(config.liveness.heartbeat_interval_secs, 30);
        assert_eq!(config.liveness.sweep_interval_secs, 300);
        assert_eq!(config.liveness.idle_timeout_secs, 600);
    }

    #[test]
    fn config_toml_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            "[server]\nport = 7411\n\n[liveness]\nidle_timeout_secs = 900\n",
        )
        .unwrap();

        let config = resolve(dir.path()).unwrap();
        assert_eq!(config.server.port, Some(7411));
        assert_eq!(config.liveness.idle_timeout_secs, 900);
        // Untouched sections keep their defaults.
        assert_eq!(config.sync.dataset_pacing_ms, 100);
    }

    #[test]
    fn missing_config_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = resolve(dir.path()).unwrap();
        assert_eq!(config.sync.outbound_buffer, 256);
        assert!(config.server.host.is_none());
    }

    #[test]
    fn runtime_views_convert_units() {
        let liveness = LivenessConfig::default();
        assert_eq!(liveness.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(liveness.idle_timeout, Duration::from_secs(600));

        let sync = SyncConfig::default();
        assert_eq!(sync.dataset_pacing, Duration::from_millis(100));
    }
}
