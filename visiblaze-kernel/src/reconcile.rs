/**
 * RECONCILIATION ENGINE - Fusion d'un rapport dans l'état durable d'un hôte
 *
 * RÔLE : Transformer (état precedent, payload validé, receive_time) en
 * (nouvel état, ChangeSet). Seul propriétaire de cette transition ;
 * aucun autre module ne fabrique de HostRecord.
 *
 * FONCTIONNEMENT :
 * - receive_time kernel fait autorité pour first_seen/last_seen, jamais
 *   l'horloge agent (non synchronisée, non fiable)
 * - paquets : différence symétrique sous (name, arch, manager)
 * - CIS : transition enregistrée seulement si le statut change, historique
 *   borné par check_id (les rapports identiques répétés ne font pas
 *   grossir l'historique)
 * - rapport plus vieux que last_seen => StaleReport, état intact
 *
 * Fonction pure : la persistance atomique est le travail du Store.
 */

use crate::models::{ChangeSet, CisTransition, HostRecord, Host, PackageChange};
use crate::validate::ValidatedPayload;
use std::collections::{BTreeMap, HashMap};
use time::OffsetDateTime;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ReconcileError {
    #[error("stale report for host {host_id}: received {received} but last_seen is {last_seen}")]
    StaleReport {
        host_id: String,
        received: OffsetDateTime,
        last_seen: OffsetDateTime,
    },
}

pub fn reconcile(
    prior: Option<&HostRecord>,
    payload: &ValidatedPayload,
    receive_time: OffsetDateTime,
    history_limit: usize,
) -> Result<(HostRecord, ChangeSet), ReconcileError> {
    // Les rapports doivent arriver en receive_time non décroissant par hôte.
    // Le réordonnancement est le problème de l'appelant, pas le nôtre.
    if let Some(prev) = prior {
        if receive_time < prev.host.last_seen {
            return Err(ReconcileError::StaleReport {
                host_id: payload.host.host_id.clone(),
                received: receive_time,
                last_seen: prev.host.last_seen,
            });
        }
    }

    let first_seen = prior.map_or(receive_time, |p| p.host.first_seen);
    let host = Host {
        facts: payload.host.clone(),
        first_seen,
        last_seen: receive_time,
    };

    let mut changes = ChangeSet::default();
    diff_packages(prior, payload, &mut changes);

    let mut cis_history = prior.map(|p| p.cis_history.clone()).unwrap_or_default();
    diff_cis(prior, payload, receive_time, history_limit, &mut cis_history, &mut changes);

    let record = HostRecord {
        host,
        packages: payload.packages.clone(),
        cis_results: payload.cis_results.clone(),
        cis_history,
    };
    Ok((record, changes))
}

/// Différence symétrique des ensembles de paquets, clé (name, arch, manager).
fn diff_packages(prior: Option<&HostRecord>, payload: &ValidatedPayload, changes: &mut ChangeSet) {
    let old: BTreeMap<_, _> = prior
        .map(|p| p.packages.iter().map(|pkg| (pkg.identity(), pkg)).collect())
        .unwrap_or_default();
    let new: BTreeMap<_, _> = payload.packages.iter().map(|pkg| (pkg.identity(), pkg)).collect();

    for (key, pkg) in &new {
        match old.get(key) {
            None => changes.packages_added.push((*pkg).clone()),
            Some(prev) if prev.version != pkg.version => {
                changes.packages_changed.push(PackageChange {
                    name: pkg.name.clone(),
                    arch: pkg.arch.clone(),
                    manager: pkg.manager.clone(),
                    old_version: prev.version.clone(),
                    new_version: pkg.version.clone(),
                });
            }
            Some(_) => {}
        }
    }
    for (key, pkg) in &old {
        if !new.contains_key(key) {
            changes.packages_removed.push((*pkg).clone());
        }
    }
}

/// Transitions CIS par check_id. Un statut identique au précédent est compté
/// "unchanged" et ne crée pas d'entrée d'historique.
fn diff_cis(
    prior: Option<&HostRecord>,
    payload: &ValidatedPayload,
    receive_time: OffsetDateTime,
    history_limit: usize,
    cis_history: &mut BTreeMap<String, Vec<CisTransition>>,
    changes: &mut ChangeSet,
) {
    let previous: HashMap<&str, _> = prior
        .map(|p| p.cis_results.iter().map(|r| (r.check_id.as_str(), r.status)).collect())
        .unwrap_or_default();

    for result in &payload.cis_results {
        let from = previous.get(result.check_id.as_str()).copied();
        if from == Some(result.status) {
            changes.cis_unchanged += 1;
            continue;
        }
        let transition = CisTransition {
            check_id: result.check_id.clone(),
            from,
            to: result.status,
            at: receive_time,
        };
        let history = cis_history.entry(result.check_id.clone()).or_default();
        history.push(transition.clone());
        if history.len() > history_limit {
            let excess = history.len() - history_limit;
            history.drain(..excess);
        }
        changes.cis_transitions.push(transition);
    }
}
