/**
 * INGEST VALIDATOR - Vérification et normalisation des rapports agents
 *
 * RÔLE : Garantir qu'aucun payload malformé n'atteint la réconciliation.
 * Fonction pure : aucun effet de bord, même entrée => même résultat.
 *
 * POLITIQUE : les doublons de paquets sous (name, arch, manager) sont
 * dédupliqués last-write-wins au sein d'un même rapport (politique
 * documentée, pas une erreur). Tout statut CIS inconnu est rejeté.
 */

use crate::models::{CheckStatus, CisResult, CisResultIn, HostFacts, IngestPayload, Package};
use std::collections::HashMap;

/// Erreur de validation : code machine + chemin du champ fautif, pour que
/// l'API puisse renvoyer un message précis sans parser de chaînes.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing or empty field: {field}")]
    EmptyField { field: String },
    #[error("invalid host_id: path separators are not allowed")]
    InvalidHostId,
    #[error("unknown CIS status {value:?} at {field}")]
    UnknownStatus { field: String, value: String },
}

impl ValidationError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::EmptyField { .. } => "empty_field",
            Self::InvalidHostId => "invalid_host_id",
            Self::UnknownStatus { .. } => "unknown_status",
        }
    }

    pub fn field(&self) -> &str {
        match self {
            Self::EmptyField { field } | Self::UnknownStatus { field, .. } => field,
            Self::InvalidHostId => "host.host_id",
        }
    }
}

/// Payload vérifié et normalisé, seul type accepté par la réconciliation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedPayload {
    pub host: HostFacts,
    pub packages: Vec<Package>,
    pub cis_results: Vec<CisResult>,
}

/// Valide un rapport entrant. Ordre des contrôles : host_id, hostname,
/// paquets (name/version), dédup paquets, résultats CIS (check_id, status).
pub fn validate(payload: IngestPayload) -> Result<ValidatedPayload, ValidationError> {
    let mut host = payload.host;

    if host.host_id.trim().is_empty() {
        return Err(ValidationError::EmptyField { field: "host.host_id".into() });
    }
    // host_id nomme le fichier de partition sur disque
    if host.host_id.contains('/') || host.host_id.contains('\\') || host.host_id.contains("..") {
        return Err(ValidationError::InvalidHostId);
    }
    if host.hostname.trim().is_empty() {
        return Err(ValidationError::EmptyField { field: "host.hostname".into() });
    }

    host.ip_addresses = normalize_ips(host.ip_addresses);

    for (i, pkg) in payload.packages.iter().enumerate() {
        if pkg.name.trim().is_empty() {
            return Err(ValidationError::EmptyField { field: format!("packages[{i}].name") });
        }
        if pkg.version.trim().is_empty() {
            return Err(ValidationError::EmptyField { field: format!("packages[{i}].version") });
        }
    }

    let packages = dedup_packages(payload.packages);

    let mut cis_results = Vec::with_capacity(payload.cis_results.len());
    for (i, raw) in payload.cis_results.into_iter().enumerate() {
        if raw.check_id.trim().is_empty() {
            return Err(ValidationError::EmptyField { field: format!("cis_results[{i}].check_id") });
        }
        let status = CheckStatus::parse(&raw.status).ok_or_else(|| ValidationError::UnknownStatus {
            field: format!("cis_results[{i}].status"),
            value: raw.status.clone(),
        })?;
        cis_results.push(to_validated(raw, status));
    }

    Ok(ValidatedPayload { host, packages, cis_results })
}

fn to_validated(raw: CisResultIn, status: CheckStatus) -> CisResult {
    CisResult {
        check_id: raw.check_id,
        title: raw.title,
        status,
        evidence: raw.evidence,
        ts: raw.ts,
    }
}

/// Déduplication last-write-wins sous (name, arch, manager) : la dernière
/// occurrence écrase les précédentes, silencieusement.
fn dedup_packages(packages: Vec<Package>) -> Vec<Package> {
    let mut out: Vec<Package> = Vec::with_capacity(packages.len());
    let mut seen: HashMap<(String, String, String), usize> = HashMap::new();
    for pkg in packages {
        let key = (pkg.name.clone(), pkg.arch.clone(), pkg.manager.clone());
        match seen.get(&key) {
            Some(&idx) => out[idx] = pkg,
            None => {
                seen.insert(key, out.len());
                out.push(pkg);
            }
        }
    }
    out
}

/// Trim + suppression des vides et doublons, ordre préservé.
fn normalize_ips(ips: Vec<String>) -> Vec<String> {
    let mut out = Vec::with_capacity(ips.len());
    for ip in ips {
        let ip = ip.trim().to_string();
        if ip.is_empty() || out.contains(&ip) {
            continue;
        }
        out.push(ip);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base_payload() -> IngestPayload {
        IngestPayload {
            host: HostFacts {
                host_id: "h1".into(),
                hostname: "web01".into(),
                os_id: "ubuntu".into(),
                os_version: "22.04".into(),
                kernel: "6.8.0".into(),
                ip_addresses: vec!["10.0.0.5".into()],
                agent_version: "0.1.0".into(),
            },
            packages: vec![pkg("nginx", "1.24", "amd64", "apt")],
            cis_results: vec![CisResultIn {
                check_id: "CIS-1.1".into(),
                title: "Ensure something".into(),
                status: "pass".into(),
                evidence: json!({"checked": true}),
                ts: "2026-08-30T10:00:00Z".into(),
            }],
        }
    }

    fn pkg(name: &str, version: &str, arch: &str, manager: &str) -> Package {
        Package {
            name: name.into(),
            version: version.into(),
            arch: arch.into(),
            manager: manager.into(),
            source: String::new(),
            installed_at: None,
        }
    }

    #[test]
    fn test_valid_payload_passes() {
        let v = validate(base_payload()).unwrap();
        assert_eq!(v.host.host_id, "h1");
        assert_eq!(v.cis_results[0].status, CheckStatus::Pass);
    }

    #[test]
    fn test_empty_host_id_rejected() {
        let mut p = base_payload();
        p.host.host_id = "  ".into();
        let err = validate(p).unwrap_err();
        assert_eq!(err.code(), "empty_field");
        assert_eq!(err.field(), "host.host_id");
    }

    #[test]
    fn test_host_id_with_path_separator_rejected() {
        let mut p = base_payload();
        p.host.host_id = "../etc/passwd".into();
        assert_eq!(validate(p).unwrap_err().code(), "invalid_host_id");
    }

    #[test]
    fn test_empty_hostname_rejected() {
        let mut p = base_payload();
        p.host.hostname = String::new();
        assert_eq!(validate(p).unwrap_err().field(), "host.hostname");
    }

    #[test]
    fn test_empty_package_version_rejected() {
        let mut p = base_payload();
        p.packages.push(pkg("curl", "", "amd64", "apt"));
        let err = validate(p).unwrap_err();
        assert_eq!(err.field(), "packages[1].version");
    }

    #[test]
    fn test_duplicate_packages_keep_last_occurrence() {
        let mut p = base_payload();
        p.packages = vec![
            pkg("nginx", "1.22", "amd64", "apt"),
            pkg("curl", "8.5", "amd64", "apt"),
            pkg("nginx", "1.24", "amd64", "apt"),
        ];
        let v = validate(p).unwrap();
        assert_eq!(v.packages.len(), 2);
        let nginx = v.packages.iter().find(|p| p.name == "nginx").unwrap();
        assert_eq!(nginx.version, "1.24");
    }

    #[test]
    fn test_same_name_different_arch_not_deduplicated() {
        let mut p = base_payload();
        p.packages = vec![pkg("libc6", "2.39", "amd64", "apt"), pkg("libc6", "2.39", "i386", "apt")];
        assert_eq!(validate(p).unwrap().packages.len(), 2);
    }

    #[test]
    fn test_unknown_cis_status_rejected() {
        let mut p = base_payload();
        p.cis_results[0].status = "warning".into();
        let err = validate(p).unwrap_err();
        assert_eq!(err.code(), "unknown_status");
        assert_eq!(err.field(), "cis_results[0].status");
    }

    #[test]
    fn test_empty_check_id_rejected() {
        let mut p = base_payload();
        p.cis_results[0].check_id = String::new();
        assert_eq!(validate(p).unwrap_err().field(), "cis_results[0].check_id");
    }

    #[test]
    fn test_ip_addresses_normalized() {
        let mut p = base_payload();
        p.host.ip_addresses = vec![" 10.0.0.5 ".into(), String::new(), "10.0.0.5".into(), "fe80::1".into()];
        let v = validate(p).unwrap();
        assert_eq!(v.host.ip_addresses, vec!["10.0.0.5".to_string(), "fe80::1".to_string()]);
    }
}
