use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use time::OffsetDateTime;

/// Faits déclarés par l'agent dans un rapport. L'agent ne contrôle jamais
/// first_seen/last_seen : ces champs appartiennent au kernel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostFacts {
    pub host_id: String,
    pub hostname: String,
    #[serde(default)]
    pub os_id: String,
    #[serde(default)]
    pub os_version: String,
    #[serde(default)]
    pub kernel: String,
    #[serde(default)]
    pub ip_addresses: Vec<String>,
    #[serde(default)]
    pub agent_version: String,
}

/// État durable d'un hôte : faits + horodatages faisant autorité.
/// Invariant : first_seen <= last_seen, first_seen immuable après création.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Host {
    #[serde(flatten)]
    pub facts: HostFacts,
    #[serde(with = "time::serde::rfc3339")]
    pub first_seen: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Package {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub arch: String,
    #[serde(default)]
    pub manager: String,
    #[serde(default)]
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installed_at: Option<String>,
}

impl Package {
    /// Identité d'un paquet au sein d'un hôte : (name, arch, manager).
    pub fn identity(&self) -> (&str, &str, &str) {
        (&self.name, &self.arch, &self.manager)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    Fail,
    Manual,
}

impl CheckStatus {
    /// Parse strict : toute valeur inconnue est refusée, jamais coercée.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pass" => Some(Self::Pass),
            "fail" => Some(Self::Fail),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::Manual => "manual",
        }
    }
}

/// Résultat CIS tel que reçu sur le wire : status encore brut (String),
/// validé vers CheckStatus par le validateur.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CisResultIn {
    pub check_id: String,
    #[serde(default)]
    pub title: String,
    pub status: String,
    #[serde(default)]
    pub evidence: serde_json::Value,
    #[serde(default)]
    pub ts: String,
}

/// Résultat CIS validé et stocké. `evidence` est un blob opaque : le kernel
/// le transporte sans jamais l'interpréter. `ts` vient de l'horloge agent,
/// non fiable pour l'ordonnancement, conservé tel quel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CisResult {
    pub check_id: String,
    pub title: String,
    pub status: CheckStatus,
    pub evidence: serde_json::Value,
    pub ts: String,
}

/// Unité de travail soumise par un agent : snapshot complet de l'hôte,
/// de son inventaire paquets et de ses résultats CIS.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestPayload {
    pub host: HostFacts,
    #[serde(default)]
    pub packages: Vec<Package>,
    #[serde(default)]
    pub cis_results: Vec<CisResultIn>,
}

/// Transition de statut d'un check CIS, datée au receive_time kernel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CisTransition {
    pub check_id: String,
    pub from: Option<CheckStatus>,
    pub to: CheckStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
}

/// État durable complet d'un hôte, remplacé atomiquement à chaque ingest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostRecord {
    pub host: Host,
    pub packages: Vec<Package>,
    pub cis_results: Vec<CisResult>,
    /// Historique borné des transitions, par check_id.
    #[serde(default)]
    pub cis_history: BTreeMap<String, Vec<CisTransition>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PackageChange {
    pub name: String,
    pub arch: String,
    pub manager: String,
    pub old_version: String,
    pub new_version: String,
}

/// Diff calculé entre le snapshot précédent et le nouveau lors d'une
/// réconciliation. Un ingest no-op (doublon) produit un ChangeSet vide.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChangeSet {
    pub packages_added: Vec<Package>,
    pub packages_removed: Vec<Package>,
    pub packages_changed: Vec<PackageChange>,
    pub cis_transitions: Vec<CisTransition>,
    pub cis_unchanged: usize,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.packages_added.is_empty()
            && self.packages_removed.is_empty()
            && self.packages_changed.is_empty()
            && self.cis_transitions.is_empty()
    }
}
