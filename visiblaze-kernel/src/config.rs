use log::warn;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;

/// Configuration kernel. Les politiques de rétention et de staleness sont
/// des paramètres externes, jamais des constantes en dur.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct KernelConfig {
    pub bind_port: u16,
    pub data_dir: String,
    /// Transitions CIS conservées par check_id et par hôte.
    pub cis_history_limit: usize,
    /// Âge au-delà duquel un hôte est marqué stale dans les vues.
    pub stale_after_seconds: i64,
    /// Plafond par défaut du listing /hosts.
    pub list_limit: usize,
    pub write_retry: WriteRetryConf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct WriteRetryConf {
    pub attempts: u32,
    pub backoff_ms: u64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            bind_port: 8080,
            data_dir: "./data".into(),
            cis_history_limit: 10,
            stale_after_seconds: 90,
            list_limit: 100,
            write_retry: WriteRetryConf::default(),
        }
    }
}

impl Default for WriteRetryConf {
    fn default() -> Self {
        Self { attempts: 3, backoff_ms: 50 }
    }
}

pub async fn load_config() -> KernelConfig {
    let path = std::env::var("VISIBLAZE_KERNEL_CONFIG").unwrap_or_else(|_| "kernel.yaml".into());
    if Path::new(&path).exists() {
        let txt = fs::read_to_string(&path).await.unwrap_or_default();
        if txt.trim().is_empty() {
            return KernelConfig::default();
        }
        serde_yaml::from_str(&txt).unwrap_or_else(|e| {
            warn!("[kernel] invalid config {}: {e}", path);
            KernelConfig::default()
        })
    } else {
        warn!("[kernel] no {} found, using default config", path);
        KernelConfig::default()
    }
}
