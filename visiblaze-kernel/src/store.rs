/**
 * STORE - Persistance partitionnée par hôte + lectures snapshot
 *
 * RÔLE : Appliquer atomiquement le résultat d'une réconciliation et servir
 * les lectures du Query Service sans jamais exposer d'état partiel.
 *
 * FONCTIONNEMENT :
 * - une partition par host_id : write gate tokio::Mutex + snapshot
 *   Arc<HostRecord> swappé d'un coup (un lecteur voit tout l'ancien état
 *   ou tout le nouveau, jamais un mélange)
 * - pas de verrou global : les hôtes sont indépendants, deux ingests pour
 *   deux hôtes différents ne se coordonnent jamais
 * - deuxième ingest concurrent pour le même hôte => rejet Conflict
 *   (politique explicite : l'appelant retry avec backoff)
 * - un fichier JSON par hôte sous data_dir/hosts/, écrit en temp + rename ;
 *   erreurs IO transitoires retentées avec backoff exponentiel borné
 * - idempotence : payload identique déjà appliqué => no-op qui réussit
 */

use crate::models::{ChangeSet, CisResult, HostRecord, Package};
use crate::reconcile::{reconcile, ReconcileError};
use crate::validate::ValidatedPayload;
use log::{info, warn};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("concurrent ingest already in flight for host {host_id}")]
    Conflict { host_id: String },
    #[error("persistence unavailable after {attempts} attempts: {source}")]
    Unavailable {
        attempts: u32,
        #[source]
        source: std::io::Error,
    },
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Échec d'un ingest : soit la réconciliation (déterministe, jamais
/// retentée ici), soit la couche persistance.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub data_dir: PathBuf,
    pub cis_history_limit: usize,
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
}

#[derive(Debug)]
pub struct IngestOutcome {
    pub host_id: String,
    /// false si l'ingest était un doublon déjà appliqué (no-op idempotent)
    pub applied: bool,
    pub changes: ChangeSet,
}

#[derive(Debug, Serialize)]
pub struct StoreStats {
    pub hosts_tracked: usize,
    pub ingests_applied: u64,
    pub ingests_noop: u64,
}

/// Une partition = l'unité de concurrence. Le gate sérialise les écritures
/// du même hôte ; le snapshot est remplacé en une seule affectation.
struct Partition {
    gate: Mutex<()>,
    current: RwLock<Option<Arc<HostRecord>>>,
}

pub struct Store {
    cfg: StoreConfig,
    partitions: RwLock<HashMap<String, Arc<Partition>>>,
    ingests_applied: AtomicU64,
    ingests_noop: AtomicU64,
}

impl Store {
    /// Ouvre le store et recharge toutes les partitions depuis le disque.
    pub fn open(cfg: StoreConfig) -> Result<Self, StoreError> {
        let hosts_dir = cfg.data_dir.join("hosts");
        std::fs::create_dir_all(&hosts_dir)?;

        let mut partitions = HashMap::new();
        for entry in std::fs::read_dir(&hosts_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            match std::fs::read_to_string(&path) {
                Ok(content) => match serde_json::from_str::<HostRecord>(&content) {
                    Ok(record) => {
                        let host_id = record.host.facts.host_id.clone();
                        partitions.insert(
                            host_id,
                            Arc::new(Partition {
                                gate: Mutex::new(()),
                                current: RwLock::new(Some(Arc::new(record))),
                            }),
                        );
                    }
                    Err(e) => warn!("[store] invalid host record in {:?}: {}", path, e),
                },
                Err(e) => warn!("[store] failed to read {:?}: {}", path, e),
            }
        }

        info!("[store] loaded {} hosts from {:?}", partitions.len(), hosts_dir);
        Ok(Self {
            cfg,
            partitions: RwLock::new(partitions),
            ingests_applied: AtomicU64::new(0),
            ingests_noop: AtomicU64::new(0),
        })
    }

    /// Applique un payload validé. Réconciliation sous le write gate de la
    /// partition, persistance, puis swap du snapshot. Le gate est relâché
    /// sur tous les chemins de sortie (drop du guard), échec compris :
    /// un ingest raté laisse l'état précédent intact.
    pub async fn ingest(
        &self,
        payload: ValidatedPayload,
        receive_time: OffsetDateTime,
    ) -> Result<IngestOutcome, IngestError> {
        let host_id = payload.host.host_id.clone();
        let partition = self.partition(&host_id);

        let _guard = partition
            .gate
            .try_lock()
            .map_err(|_| StoreError::Conflict { host_id: host_id.clone() })?;

        let prior = partition.current.read().clone();

        // Idempotence : re-livraison d'un rapport déjà appliqué => no-op
        if let Some(ref current) = prior {
            if receive_time <= current.host.last_seen && payload_matches(current, &payload) {
                self.ingests_noop.fetch_add(1, Ordering::Relaxed);
                info!("[store] duplicate ingest for host {} ignored", host_id);
                return Ok(IngestOutcome { host_id, applied: false, changes: ChangeSet::default() });
            }
        }

        let (record, changes) =
            reconcile(prior.as_deref(), &payload, receive_time, self.cfg.cis_history_limit)?;
        let record = Arc::new(record);

        self.persist_with_retry(&record).await?;
        *partition.current.write() = Some(record);

        self.ingests_applied.fetch_add(1, Ordering::Relaxed);
        info!(
            "[store] ingested host {} (+{} -{} ~{} pkgs, {} cis transitions)",
            host_id,
            changes.packages_added.len(),
            changes.packages_removed.len(),
            changes.packages_changed.len(),
            changes.cis_transitions.len()
        );
        Ok(IngestOutcome { host_id, applied: true, changes })
    }

    pub fn get_host(&self, host_id: &str) -> Option<Arc<HostRecord>> {
        let partition = self.partitions.read().get(host_id).cloned()?;
        let snapshot = partition.current.read().clone();
        snapshot
    }

    /// Liste triée par host_id, filtre substring insensible à la casse sur
    /// hostname/os_id/kernel (le contrat de filtrage du dashboard).
    pub fn list_hosts(&self, filter: Option<&str>) -> Vec<Arc<HostRecord>> {
        let partitions: Vec<Arc<Partition>> = self.partitions.read().values().cloned().collect();
        let mut hosts: Vec<Arc<HostRecord>> =
            partitions.iter().filter_map(|p| p.current.read().clone()).collect();

        if let Some(needle) = filter {
            let needle = needle.to_lowercase();
            hosts.retain(|h| {
                h.host.facts.hostname.to_lowercase().contains(&needle)
                    || h.host.facts.os_id.to_lowercase().contains(&needle)
                    || h.host.facts.kernel.to_lowercase().contains(&needle)
            });
        }
        hosts.sort_by(|a, b| a.host.facts.host_id.cmp(&b.host.facts.host_id));
        hosts
    }

    /// None si l'hôte est inconnu ; liste vide s'il existe sans paquets.
    pub fn get_packages(&self, host_id: &str) -> Option<Vec<Package>> {
        self.get_host(host_id).map(|r| r.packages.clone())
    }

    pub fn get_cis_results(&self, host_id: &str) -> Option<Vec<CisResult>> {
        self.get_host(host_id).map(|r| r.cis_results.clone())
    }

    pub fn stats(&self) -> StoreStats {
        let hosts_tracked = self
            .partitions
            .read()
            .values()
            .filter(|p| p.current.read().is_some())
            .count();
        StoreStats {
            hosts_tracked,
            ingests_applied: self.ingests_applied.load(Ordering::Relaxed),
            ingests_noop: self.ingests_noop.load(Ordering::Relaxed),
        }
    }

    fn partition(&self, host_id: &str) -> Arc<Partition> {
        if let Some(p) = self.partitions.read().get(host_id) {
            return p.clone();
        }
        let mut partitions = self.partitions.write();
        partitions
            .entry(host_id.to_string())
            .or_insert_with(|| {
                Arc::new(Partition { gate: Mutex::new(()), current: RwLock::new(None) })
            })
            .clone()
    }

    /// Écriture temp + rename pour qu'un crash ne laisse jamais un fichier
    /// tronqué. Les erreurs IO sont retentées avec backoff exponentiel
    /// borné avant de remonter Unavailable.
    async fn persist_with_retry(&self, record: &HostRecord) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(record)?;
        let path = self.host_path(&record.host.facts.host_id);
        let tmp = path.with_extension("json.tmp");

        let attempts = self.cfg.retry_attempts.max(1);
        let mut backoff = self.cfg.retry_backoff_ms;
        let mut last_err = None;
        for attempt in 1..=attempts {
            let result = async {
                tokio::fs::write(&tmp, &json).await?;
                tokio::fs::rename(&tmp, &path).await
            }
            .await;
            match result {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        "[store] persist attempt {}/{} failed for {:?}: {}",
                        attempt, attempts, path, e
                    );
                    last_err = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(std::time::Duration::from_millis(backoff)).await;
                        backoff = backoff.saturating_mul(2);
                    }
                }
            }
        }
        Err(StoreError::Unavailable {
            attempts,
            source: last_err.unwrap_or_else(|| std::io::Error::other("persist failed")),
        })
    }

    fn host_path(&self, host_id: &str) -> PathBuf {
        self.cfg.data_dir.join("hosts").join(format!("{host_id}.json"))
    }
}

/// Égalité de contenu entre le snapshot stocké et un payload re-livré.
fn payload_matches(current: &HostRecord, payload: &ValidatedPayload) -> bool {
    current.host.facts == payload.host
        && current.packages == payload.packages
        && current.cis_results == payload.cis_results
}
