/**
 * GARBAGE COLLECTOR - nettoyage des maintenances
 *
 * Pour chaque maintenance :
 * - les hôtes membres qui sont dans le groupe des désactivés sont retirés
 * - s'il ne reste aucun hôte (et aucun groupe), la maintenance est supprimée
 *   si `delete_empty_maintenance`, sinon vidée quand même (warning) ; si la
 *   plateforme refuse une maintenance vide, l'action échoue et la
 *   maintenance reste inchangée
 *
 * Désactivé par défaut, timer indépendant, dry-run respecté, pas de failsafe.
 */

use crate::config::{GcConfig, PlatformConfig};
use crate::platform::{PlatformApi, PlatformSnapshot};
use crate::state::ShutdownRx;
use crate::sync::{pass_span, Action, Dispatcher};
use crate::worker::{PeriodicWork, WorkError};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Instrument};

pub fn plan(snapshot: &PlatformSnapshot, disabled_group: &str, delete_empty: bool) -> Vec<Action> {
    if !snapshot.hostgroups.contains_key(disabled_group) {
        warn!("Disabled host group '{disabled_group}' does not exist, nothing to collect");
        return Vec::new();
    }
    let disabled: BTreeSet<&String> = snapshot
        .hosts
        .values()
        .filter(|host| host.in_group(disabled_group))
        .map(|host| &host.id)
        .collect();

    let mut actions = Vec::new();
    for maintenance in &snapshot.maintenances {
        let remaining: Vec<String> = maintenance
            .host_ids
            .iter()
            .filter(|id| !disabled.contains(id))
            .cloned()
            .collect();
        if remaining.len() == maintenance.host_ids.len() {
            continue;
        }

        if remaining.is_empty() && maintenance.group_ids.is_empty() {
            if delete_empty {
                actions.push(Action::DeleteMaintenance {
                    maintenance_id: maintenance.id.clone(),
                    name: maintenance.name.clone(),
                });
                continue;
            }
            warn!(
                "Maintenance '{}' ({}) only contains disabled hosts and delete_empty_maintenance is off: \
                 removing them anyway, the window stays unchanged if the platform rejects an empty maintenance",
                maintenance.name, maintenance.id
            );
        }

        actions.push(Action::RemoveFromMaintenance {
            maintenance_id: maintenance.id.clone(),
            name: maintenance.name.clone(),
            host_ids: remaining,
        });
    }
    actions
}

pub struct GarbageCollector {
    api: Arc<dyn PlatformApi>,
    platform: PlatformConfig,
    config: GcConfig,
}

impl GarbageCollector {
    pub fn new(api: Arc<dyn PlatformApi>, platform: PlatformConfig, config: GcConfig) -> Self {
        Self { api, platform, config }
    }
}

#[async_trait]
impl PeriodicWork for GarbageCollector {
    fn name(&self) -> &str {
        "gc"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(self.config.interval_secs)
    }

    async fn work(&mut self, shutdown: &ShutdownRx) -> Result<(), WorkError> {
        async {
            let snapshot = PlatformSnapshot::fetch(self.api.as_ref(), &[], true).await?;
            let actions = plan(
                &snapshot,
                &self.platform.hostgroup_disabled,
                self.config.delete_empty_maintenance,
            );
            let report = Dispatcher::new(self.api.as_ref(), self.platform.dryrun, shutdown, snapshot.hostgroups)
                .apply(&actions)
                .await;
            info!(
                applied = report.applied,
                failed = report.failed,
                dry_run = report.dry_run,
                "Garbage collection done ({} maintenances checked)",
                snapshot.maintenances.len()
            );
            Ok::<_, WorkError>(())
        }
        .instrument(pass_span("gc"))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{ApiVersion, HostStatus, IdMap, Maintenance, PlatformHost};
    use std::collections::BTreeMap;

    fn host(id: &str, group: &str) -> PlatformHost {
        PlatformHost {
            id: id.into(),
            name: format!("host{id}"),
            status: HostStatus::Unmonitored,
            groups: [(group.to_string(), "g".to_string())].into(),
            templates: IdMap::new(),
            interfaces: Vec::new(),
            tags: BTreeSet::new(),
            inventory_mode: 1,
            inventory: BTreeMap::new(),
        }
    }

    fn maintenance(id: &str, hosts: &[&str], groups: &[&str]) -> Maintenance {
        Maintenance {
            id: id.into(),
            name: format!("window {id}"),
            host_ids: hosts.iter().map(|h| h.to_string()).collect(),
            group_ids: groups.iter().map(|g| g.to_string()).collect(),
        }
    }

    fn snapshot(maintenances: Vec<Maintenance>) -> PlatformSnapshot {
        let hosts = [host("1", "All-auto-disabled-hosts"), host("2", "All-hosts"), host("3", "All-auto-disabled-hosts")];
        PlatformSnapshot {
            version: ApiVersion::new(7, 0, 0),
            hosts: hosts.into_iter().map(|h| (h.name.clone(), h)).collect(),
            hostgroups: [("All-auto-disabled-hosts".to_string(), "2".to_string())].into(),
            templategroups: IdMap::new(),
            templates: IdMap::new(),
            maintenances,
        }
    }

    #[test]
    fn removes_disabled_members_and_deletes_empty_windows_when_enabled() {
        let snap = snapshot(vec![
            maintenance("m1", &["1", "2"], &[]),
            maintenance("m2", &["1", "3"], &[]),
            maintenance("m3", &["3"], &["7"]),
            maintenance("m4", &["2"], &[]),
        ]);

        let actions = plan(&snap, "All-auto-disabled-hosts", true);
        assert_eq!(
            actions,
            vec![
                Action::RemoveFromMaintenance {
                    maintenance_id: "m1".into(),
                    name: "window m1".into(),
                    host_ids: vec!["2".into()],
                },
                Action::DeleteMaintenance { maintenance_id: "m2".into(), name: "window m2".into() },
                Action::RemoveFromMaintenance {
                    maintenance_id: "m3".into(),
                    name: "window m3".into(),
                    host_ids: Vec::new(),
                },
            ]
        );
    }

    #[test]
    fn empty_windows_are_emptied_when_deletion_is_off() {
        let snap = snapshot(vec![maintenance("m2", &["1", "3"], &[])]);
        assert_eq!(
            plan(&snap, "All-auto-disabled-hosts", false),
            vec![Action::RemoveFromMaintenance {
                maintenance_id: "m2".into(),
                name: "window m2".into(),
                host_ids: Vec::new(),
            }]
        );
    }

    #[test]
    fn missing_disabled_group_collects_nothing() {
        let snap = snapshot(vec![maintenance("m2", &["1"], &[])]);
        assert!(plan(&snap, "Nope", true).is_empty());
    }
}
