/**
 * SYNC ENGINE - alignement de la plateforme sur la table fusionnée
 *
 * ARCHITECTURE :
 * - Chaque updater (hôtes, groupes, templates) est un `plan(...)` pur sur
 *   (hôtes fusionnés, snapshot plateforme, mappings, config) qui produit
 *   une liste d'`Action`
 * - Le `Dispatcher` exécute la liste dans l'ordre : dry-run = log seul,
 *   action en échec = loggée et on continue, arrêt demandé = on s'arrête
 *   après l'appel en cours
 *
 * La passe suivante repart d'un snapshot frais : une passe partielle se
 * rattrape toute seule (plans idempotents).
 */

pub mod hostgroups;
pub mod hosts;
pub mod templates;

pub use hostgroups::HostgroupUpdater;
pub use hosts::HostUpdater;
pub use templates::TemplateUpdater;

use crate::models::{Host, Interface, Tag};
use crate::platform::{ApiError, HostCreate, HostPatch, HostStatus, IdMap, PlatformApi, PlatformHost};
use crate::state::{is_shutting_down, ShutdownRx};
use crate::store::HostMap;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::{error, info, info_span, Span};

/// Séparateur préfixe / nom dans les noms de groupes ("Siteadmin-ops")
pub const GROUP_SEPARATOR: &str = "-";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    CreateHostGroup { name: String },
    CreateTemplateGroup { name: String },
    CreateHost(HostCreate),
    /// Réactive un hôte existant non supervisé
    EnableHost { host_id: String, hostname: String, group_ids: Vec<String> },
    /// Statut non supervisé, templates retirés, groupe = groupe des désactivés
    DisableHost { host_id: String, hostname: String, disabled_group_id: String },
    SetInterface { host_id: String, hostname: String, interface: Interface, existing: Option<String> },
    SetTags { host_id: String, hostname: String, tags: BTreeSet<Tag> },
    SetInventoryMode { host_id: String, hostname: String, mode: i8 },
    SetInventory { host_id: String, hostname: String, inventory: BTreeMap<String, String> },
    /// Noms de groupes, résolus en ids à l'exécution (ils peuvent avoir été créés dans la passe)
    SetHostGroups { host_id: String, hostname: String, groups: BTreeSet<String> },
    SetTemplates { host_id: String, hostname: String, templates: IdMap, clear: IdMap },
    RemoveFromMaintenance { maintenance_id: String, name: String, host_ids: Vec<String> },
    DeleteMaintenance { maintenance_id: String, name: String },
}

fn names<'a>(items: impl IntoIterator<Item = &'a String>) -> String {
    items.into_iter().map(String::as_str).collect::<Vec<_>>().join(", ")
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::CreateHostGroup { name } => write!(f, "Creating host group '{name}'"),
            Action::CreateTemplateGroup { name } => write!(f, "Creating template group '{name}'"),
            Action::CreateHost(host) => write!(f, "Creating host '{}'", host.name),
            Action::EnableHost { host_id, hostname, .. } => {
                write!(f, "Enabling old host '{hostname}' ({host_id})")
            }
            Action::DisableHost { host_id, hostname, .. } => {
                write!(f, "Disabling host '{hostname}' ({host_id})")
            }
            Action::SetInterface { host_id, hostname, interface, existing } => write!(
                f,
                "{} interface (type: {}) on host '{hostname}' ({host_id})",
                if existing.is_some() { "Updating" } else { "Creating" },
                interface.kind
            ),
            Action::SetTags { host_id, hostname, tags } => {
                let tags: Vec<String> = tags.iter().map(|(k, v)| format!("{k}={v}")).collect();
                write!(f, "Setting tags ({}) on host '{hostname}' ({host_id})", tags.join(", "))
            }
            Action::SetInventoryMode { host_id, hostname, mode } => {
                write!(f, "Setting inventory_mode ({mode}) on host '{hostname}' ({host_id})")
            }
            Action::SetInventory { hostname, inventory, .. } => {
                write!(f, "Setting inventory ({}) on host '{hostname}'", names(inventory.keys()))
            }
            Action::SetHostGroups { hostname, groups, .. } => {
                write!(f, "Setting host groups ({}) on host '{hostname}'", names(groups))
            }
            Action::SetTemplates { hostname, templates, clear, .. } => write!(
                f,
                "Setting templates ({}) on host '{hostname}', clearing ({})",
                names(templates.keys()),
                names(clear.keys())
            ),
            Action::RemoveFromMaintenance { name, host_ids, .. } => write!(
                f,
                "Setting maintenance '{name}' hosts to ({})",
                names(host_ids)
            ),
            Action::DeleteMaintenance { maintenance_id, name } => {
                write!(f, "Deleting maintenance '{name}' ({maintenance_id})")
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("host group '{0}' does not exist")]
    UnknownGroup(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub applied: usize,
    pub failed: usize,
    /// Non exécutées (arrêt demandé)
    pub skipped: usize,
    /// Loggées seulement (dry-run)
    pub dry_run: usize,
}

impl ApplyReport {
    pub fn merge(&mut self, other: ApplyReport) {
        self.applied += other.applied;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.dry_run += other.dry_run;
    }
}

pub struct Dispatcher<'a> {
    api: &'a dyn PlatformApi,
    dryrun: bool,
    shutdown: &'a ShutdownRx,
    /// Nom -> id des groupes d'hôtes, complété au fil des créations
    group_ids: IdMap,
}

impl<'a> Dispatcher<'a> {
    pub fn new(api: &'a dyn PlatformApi, dryrun: bool, shutdown: &'a ShutdownRx, group_ids: IdMap) -> Self {
        Self { api, dryrun, shutdown, group_ids }
    }

    pub async fn apply(&mut self, actions: &[Action]) -> ApplyReport {
        let mut report = ApplyReport::default();
        for (done, action) in actions.iter().enumerate() {
            if is_shutting_down(self.shutdown) {
                report.skipped = actions.len() - done;
                info!("Told to stop, {} actions not applied", report.skipped);
                break;
            }
            if self.dryrun {
                info!("DRYRUN: {action}");
                report.dry_run += 1;
                continue;
            }
            match self.execute(action).await {
                Ok(()) => {
                    info!("{action}");
                    report.applied += 1;
                }
                Err(e) => {
                    error!("Failed: {action}: {e}");
                    report.failed += 1;
                }
            }
        }
        report
    }

    fn group_id(&self, name: &str) -> Result<String, ActionError> {
        self.group_ids
            .get(name)
            .cloned()
            .ok_or_else(|| ActionError::UnknownGroup(name.to_string()))
    }

    async fn execute(&mut self, action: &Action) -> Result<(), ActionError> {
        let api = self.api;
        match action {
            Action::CreateHostGroup { name } => {
                let id = api.create_hostgroup(name).await?;
                self.group_ids.insert(name.clone(), id);
            }
            Action::CreateTemplateGroup { name } => {
                api.create_templategroup(name).await?;
            }
            Action::CreateHost(host) => {
                api.create_host(host).await?;
            }
            Action::EnableHost { host_id, group_ids, .. } => {
                let patch = HostPatch {
                    status: Some(HostStatus::Monitored),
                    group_ids: Some(group_ids.clone()),
                    ..HostPatch::default()
                };
                api.update_host(host_id, &patch).await?;
            }
            Action::DisableHost { host_id, disabled_group_id, .. } => {
                let patch = HostPatch {
                    status: Some(HostStatus::Unmonitored),
                    group_ids: Some(vec![disabled_group_id.clone()]),
                    template_ids: Some(Vec::new()),
                    ..HostPatch::default()
                };
                api.update_host(host_id, &patch).await?;
            }
            Action::SetInterface { host_id, interface, existing, .. } => {
                api.set_interface(host_id, interface, existing.as_deref()).await?;
            }
            Action::SetTags { host_id, tags, .. } => {
                let patch = HostPatch { tags: Some(tags.clone()), ..HostPatch::default() };
                api.update_host(host_id, &patch).await?;
            }
            Action::SetInventoryMode { host_id, mode, .. } => {
                let patch = HostPatch { inventory_mode: Some(*mode), ..HostPatch::default() };
                api.update_host(host_id, &patch).await?;
            }
            Action::SetInventory { host_id, inventory, .. } => {
                let patch = HostPatch { inventory: Some(inventory.clone()), ..HostPatch::default() };
                api.update_host(host_id, &patch).await?;
            }
            Action::SetHostGroups { host_id, groups, .. } => {
                let ids = groups.iter().map(|g| self.group_id(g)).collect::<Result<Vec<_>, _>>()?;
                let patch = HostPatch { group_ids: Some(ids), ..HostPatch::default() };
                api.update_host(host_id, &patch).await?;
            }
            Action::SetTemplates { host_id, templates, clear, .. } => {
                // Le clear doit réussir avant le set (sinon unlink sans clear)
                if !clear.is_empty() {
                    let patch = HostPatch {
                        clear_template_ids: Some(clear.values().cloned().collect()),
                        ..HostPatch::default()
                    };
                    api.update_host(host_id, &patch).await?;
                }
                let patch = HostPatch {
                    template_ids: Some(templates.values().cloned().collect()),
                    ..HostPatch::default()
                };
                api.update_host(host_id, &patch).await?;
            }
            Action::RemoveFromMaintenance { maintenance_id, host_ids, .. } => {
                api.update_maintenance_hosts(maintenance_id, host_ids).await?;
            }
            Action::DeleteMaintenance { maintenance_id, .. } => {
                api.delete_maintenance(maintenance_id).await?;
            }
        }
        Ok(())
    }
}

/// Span d'une passe de synchronisation, avec un id pour corréler les logs
pub fn pass_span(updater: &str) -> Span {
    info_span!("pass", updater = %updater, id = %uuid::Uuid::new_v4())
}

/// Hôtes fusionnés activés
pub fn enabled_hosts(merged: HostMap) -> HostMap {
    merged.into_iter().filter(|(_, host)| host.enabled).collect()
}

/// Hôtes de la plateforme gérés par la synchro : supervisés et hors groupe manuel
pub fn is_managed(host: &PlatformHost, manual_group: &str) -> bool {
    host.status == HostStatus::Monitored && !host.in_group(manual_group)
}

/// Paires (hôte plateforme, hôte fusionné) à mettre à jour
pub fn synced_pairs<'a>(
    platform: &'a BTreeMap<String, PlatformHost>,
    enabled: &'a HostMap,
    manual_group: &'a str,
) -> impl Iterator<Item = (&'a PlatformHost, &'a Host)> + 'a {
    platform
        .values()
        .filter(move |ph| is_managed(ph, manual_group))
        .filter_map(move |ph| enabled.get(&ph.name).map(|host| (ph, host)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{ApiVersion, Maintenance};
    use crate::state::shutdown_channel;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Plateforme qui enregistre les écritures et refuse les hôtes "bad-*"
    #[derive(Default)]
    struct Recorder {
        writes: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PlatformApi for Recorder {
        async fn version(&self) -> Result<ApiVersion, ApiError> {
            Ok(ApiVersion::new(7, 0, 0))
        }
        async fn hosts(&self, _: &[String]) -> Result<Vec<PlatformHost>, ApiError> {
            Ok(Vec::new())
        }
        async fn hostgroups(&self) -> Result<IdMap, ApiError> {
            Ok(IdMap::new())
        }
        async fn templategroups(&self) -> Result<IdMap, ApiError> {
            Ok(IdMap::new())
        }
        async fn templates(&self) -> Result<IdMap, ApiError> {
            Ok(IdMap::new())
        }
        async fn maintenances(&self) -> Result<Vec<Maintenance>, ApiError> {
            Ok(Vec::new())
        }
        async fn create_host(&self, host: &HostCreate) -> Result<String, ApiError> {
            if host.name.starts_with("bad-") {
                return Err(ApiError::Rpc { code: -32500, message: "Application error.".into(), data: String::new() });
            }
            self.writes.lock().push(format!("create {}", host.name));
            Ok("100".into())
        }
        async fn update_host(&self, host_id: &str, patch: &HostPatch) -> Result<(), ApiError> {
            self.writes.lock().push(format!("update {host_id} {:?}", patch.group_ids));
            Ok(())
        }
        async fn set_interface(&self, _: &str, _: &Interface, _: Option<&str>) -> Result<(), ApiError> {
            Ok(())
        }
        async fn create_hostgroup(&self, name: &str) -> Result<String, ApiError> {
            self.writes.lock().push(format!("group {name}"));
            Ok("55".into())
        }
        async fn create_templategroup(&self, _: &str) -> Result<String, ApiError> {
            Ok("56".into())
        }
        async fn update_maintenance_hosts(&self, _: &str, _: &[String]) -> Result<(), ApiError> {
            Ok(())
        }
        async fn delete_maintenance(&self, _: &str) -> Result<(), ApiError> {
            Ok(())
        }
    }

    fn create(name: &str) -> Action {
        Action::CreateHost(HostCreate {
            name: name.into(),
            group_ids: vec!["1".into()],
            interfaces: Vec::new(),
            tags: BTreeSet::new(),
            inventory_mode: 1,
            inventory: BTreeMap::new(),
        })
    }

    #[tokio::test]
    async fn failed_action_does_not_stop_the_pass() {
        let api = Recorder::default();
        let (_tx, rx) = shutdown_channel();
        let mut dispatcher = Dispatcher::new(&api, false, &rx, IdMap::new());

        let report = dispatcher.apply(&[create("bad-01"), create("web01")]).await;
        assert_eq!(report, ApplyReport { applied: 1, failed: 1, ..ApplyReport::default() });
        assert_eq!(*api.writes.lock(), vec!["create web01".to_string()]);
    }

    #[tokio::test]
    async fn created_groups_are_resolvable_later_in_the_pass() {
        let api = Recorder::default();
        let (_tx, rx) = shutdown_channel();
        let mut dispatcher = Dispatcher::new(&api, false, &rx, IdMap::new());

        let actions = [
            Action::CreateHostGroup { name: "Source-cmdb".into() },
            Action::SetHostGroups {
                host_id: "10".into(),
                hostname: "web01".into(),
                groups: ["Source-cmdb".to_string()].into(),
            },
            Action::SetHostGroups {
                host_id: "11".into(),
                hostname: "web02".into(),
                groups: ["Source-missing".to_string()].into(),
            },
        ];
        let report = dispatcher.apply(&actions).await;
        assert_eq!(report.applied, 2);
        assert_eq!(report.failed, 1);
        assert!(api.writes.lock().contains(&"update 10 Some([\"55\"])".to_string()));
    }

    #[tokio::test]
    async fn dry_run_only_logs() {
        let api = Recorder::default();
        let (_tx, rx) = shutdown_channel();
        let report = Dispatcher::new(&api, true, &rx, IdMap::new()).apply(&[create("web01")]).await;
        assert_eq!(report.dry_run, 1);
        assert!(api.writes.lock().is_empty());
    }

    #[tokio::test]
    async fn shutdown_skips_remaining_actions() {
        let api = Recorder::default();
        let (tx, rx) = shutdown_channel();
        tx.send(true).unwrap();
        let report = Dispatcher::new(&api, false, &rx, IdMap::new())
            .apply(&[create("web01"), create("web02")])
            .await;
        assert_eq!(report.skipped, 2);
        assert!(api.writes.lock().is_empty());
    }
}
