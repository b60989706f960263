/**
 * HOST UPDATER - création, désactivation et mise à jour des hôtes
 *
 * ENSEMBLES :
 * - géré   = hôte plateforme supervisé, hors groupe manuel
 * - retrait = géré mais absent (ou désactivé) de la table fusionnée
 * - ajout   = activé dans la table fusionnée, ni géré ni manuel
 *   (hôte existant non supervisé = réactivation, sinon création)
 * - mise à jour = dans les deux : interfaces principales, tags préfixés,
 *   mode d'inventaire automatique, clés d'inventaire gérées
 *
 * Le failsafe porte sur ajout + retrait ; les mises à jour passent toujours.
 * Un retrait ne supprime rien : l'hôte passe dans le groupe des désactivés.
 */

use super::{enabled_hosts, is_managed, pass_span, synced_pairs, Action, ApplyReport, Dispatcher};
use crate::config::PlatformConfig;
use crate::failsafe::{FailsafeDecision, FailsafeGuard};
use crate::models::{Host, Interface, Tag, INTERFACE_AGENT};
use crate::platform::{HostCreate, PlatformApi, PlatformHost, PlatformSnapshot, INVENTORY_MODE_AUTOMATIC};
use crate::state::ShutdownRx;
use crate::store::{HostMap, HostStore};
use crate::worker::{PeriodicWork, WorkError};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn, Instrument};

const DEFAULT_AGENT_PORT: &str = "10050";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostPlan {
    pub to_add: Vec<String>,
    pub to_remove: Vec<String>,
    /// Désactivations puis créations / réactivations
    pub changes: Vec<Action>,
    pub updates: Vec<Action>,
}

impl HostPlan {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.updates.is_empty()
    }
}

fn group_id(snapshot: &PlatformSnapshot, name: &str, needed_for: &str) -> Result<String, WorkError> {
    snapshot.hostgroups.get(name).cloned().ok_or_else(|| {
        WorkError::Fatal(format!("host group '{name}' does not exist on the platform, cannot {needed_for}"))
    })
}

/// Tags du préfixe géré ; les autres sont ignorés avec un warning
fn managed_tags(host: &Host, prefix: &str) -> BTreeSet<Tag> {
    let (managed, ignored): (BTreeSet<Tag>, BTreeSet<Tag>) =
        host.tags.iter().cloned().partition(|(key, _)| key.starts_with(prefix));
    if !ignored.is_empty() {
        warn!(
            "Tags ({}) not matching tags prefix ('{prefix}') are configured on host '{}'. They will be ignored.",
            ignored.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join(", "),
            host.hostname
        );
    }
    managed
}

/// Inventaire restreint aux clés gérées
fn managed_inventory<'a>(
    hostname: &str,
    entries: impl Iterator<Item = (&'a String, &'a String)>,
    managed_keys: &[String],
) -> BTreeMap<String, String> {
    let (managed, ignored): (BTreeMap<_, _>, BTreeMap<_, _>) = entries
        .map(|(k, v)| (k.clone(), v.clone()))
        .partition(|(k, _)| managed_keys.contains(k));
    if !ignored.is_empty() {
        warn!(
            "Inventory properties ({}) on host '{hostname}' are not managed, ignoring them",
            ignored.keys().cloned().collect::<Vec<_>>().join(", ")
        );
    }
    managed
}

fn create_action(host: &Host, all_group_id: &str, config: &PlatformConfig) -> Action {
    let interfaces = if host.interfaces.is_empty() {
        vec![Interface::new(host.hostname.clone(), DEFAULT_AGENT_PORT, INTERFACE_AGENT)]
    } else {
        host.interfaces.clone()
    };
    Action::CreateHost(HostCreate {
        name: host.hostname.clone(),
        group_ids: vec![all_group_id.to_string()],
        interfaces,
        tags: managed_tags(host, &config.tags_prefix),
        inventory_mode: INVENTORY_MODE_AUTOMATIC,
        inventory: managed_inventory(&host.hostname, host.inventory.iter(), &config.managed_inventory),
    })
}

/// Mises à jour d'un hôte présent des deux côtés
pub fn host_updates(platform: &PlatformHost, host: &Host, config: &PlatformConfig) -> Vec<Action> {
    let mut actions = Vec::new();
    let host_id = &platform.id;
    let hostname = &platform.name;

    for wanted in &host.interfaces {
        let existing = platform.main_interface(wanted.kind);
        if existing.is_some_and(|current| current.matches(wanted)) {
            continue;
        }
        actions.push(Action::SetInterface {
            host_id: host_id.clone(),
            hostname: hostname.clone(),
            interface: wanted.clone(),
            existing: existing.map(|current| current.id.clone()),
        });
    }

    let prefix = config.tags_prefix.as_str();
    let wanted_tags = managed_tags(host, prefix);
    let (current_tags, foreign_tags): (BTreeSet<Tag>, BTreeSet<Tag>) =
        platform.tags.iter().cloned().partition(|(key, _)| key.starts_with(prefix));
    if current_tags != wanted_tags {
        debug!(
            "Tags on '{hostname}': removing {}, adding {}",
            current_tags.difference(&wanted_tags).count(),
            wanted_tags.difference(&current_tags).count()
        );
        actions.push(Action::SetTags {
            host_id: host_id.clone(),
            hostname: hostname.clone(),
            tags: wanted_tags.union(&foreign_tags).cloned().collect(),
        });
    }

    if platform.inventory_mode != INVENTORY_MODE_AUTOMATIC {
        actions.push(Action::SetInventoryMode {
            host_id: host_id.clone(),
            hostname: hostname.clone(),
            mode: INVENTORY_MODE_AUTOMATIC,
        });
    }

    let changed = host
        .inventory
        .iter()
        .filter(|(key, value)| platform.inventory.get(*key) != Some(*value));
    let inventory = managed_inventory(hostname, changed, &config.managed_inventory);
    if !inventory.is_empty() {
        actions.push(Action::SetInventory { host_id: host_id.clone(), hostname: hostname.clone(), inventory });
    }

    actions
}

/// Plan complet. Erreur fatale si un groupe requis (désactivés, tous) manque.
pub fn plan(merged: HostMap, snapshot: &PlatformSnapshot, config: &PlatformConfig) -> Result<HostPlan, WorkError> {
    let enabled = enabled_hosts(merged);
    let manual = &config.hostgroup_manual;

    let managed: BTreeSet<&String> = snapshot
        .hosts
        .values()
        .filter(|ph| is_managed(ph, manual))
        .map(|ph| &ph.name)
        .collect();
    let manual_hosts: BTreeSet<&String> =
        snapshot.hosts.values().filter(|ph| ph.in_group(manual)).map(|ph| &ph.name).collect();

    let to_remove: Vec<String> = managed
        .iter()
        .filter(|name| !enabled.contains_key(**name))
        .map(|name| name.to_string())
        .collect();
    let to_add: Vec<String> = enabled
        .keys()
        .filter(|name| !managed.contains(name) && !manual_hosts.contains(name))
        .cloned()
        .collect();

    debug!(
        "Platform: {} hosts ({} managed, {} manual). Enabled merged hosts: {}",
        snapshot.hosts.len(),
        managed.len(),
        manual_hosts.len(),
        enabled.len()
    );
    let manual_and_source = enabled.keys().filter(|name| manual_hosts.contains(name)).count();
    if manual_and_source > 0 {
        debug!("{manual_and_source} hosts are both in a source and in the manual group");
    }

    let mut changes = Vec::new();
    if !to_remove.is_empty() {
        let disabled_group_id = group_id(snapshot, &config.hostgroup_disabled, "disable hosts")?;
        for name in &to_remove {
            let host = &snapshot.hosts[name];
            changes.push(Action::DisableHost {
                host_id: host.id.clone(),
                hostname: name.clone(),
                disabled_group_id: disabled_group_id.clone(),
            });
        }
    }
    if !to_add.is_empty() {
        let all_group_id = group_id(snapshot, &config.hostgroup_all, "enable hosts")?;
        for name in &to_add {
            match snapshot.hosts.get(name) {
                Some(existing) => changes.push(Action::EnableHost {
                    host_id: existing.id.clone(),
                    hostname: name.clone(),
                    group_ids: vec![all_group_id.clone()],
                }),
                None => changes.push(create_action(&enabled[name], &all_group_id, config)),
            }
        }
    }

    let updates = synced_pairs(&snapshot.hosts, &enabled, manual)
        .flat_map(|(ph, host)| host_updates(ph, host, config))
        .collect();

    Ok(HostPlan { to_add, to_remove, changes, updates })
}

pub struct HostUpdater {
    api: Arc<dyn PlatformApi>,
    store: Arc<dyn HostStore>,
    config: PlatformConfig,
    failsafe: FailsafeGuard,
}

impl HostUpdater {
    pub fn new(
        api: Arc<dyn PlatformApi>,
        store: Arc<dyn HostStore>,
        config: PlatformConfig,
        failsafe: FailsafeGuard,
    ) -> Self {
        Self { api, store, config, failsafe }
    }

    pub async fn sync_pass(&self, shutdown: &ShutdownRx) -> Result<ApplyReport, WorkError> {
        let merged = self.store.load_merged().await?;
        let snapshot = PlatformSnapshot::fetch(self.api.as_ref(), &self.config.managed_inventory, false).await?;
        let plan = plan(merged, &snapshot, &self.config)?;

        let mut dispatcher =
            Dispatcher::new(self.api.as_ref(), self.config.dryrun, shutdown, snapshot.hostgroups.clone());
        let mut report = ApplyReport::default();

        match self.failsafe.check(&plan.to_add, &plan.to_remove).await {
            FailsafeDecision::Proceed => report.merge(dispatcher.apply(&plan.changes).await),
            decision => warn!(
                "Failsafe ({decision:?}): not adding {} / not removing {} hosts this pass",
                plan.to_add.len(),
                plan.to_remove.len()
            ),
        }
        report.merge(dispatcher.apply(&plan.updates).await);
        Ok(report)
    }
}

#[async_trait]
impl PeriodicWork for HostUpdater {
    fn name(&self) -> &str {
        "hosts"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(self.config.update_interval_secs)
    }

    async fn work(&mut self, shutdown: &ShutdownRx) -> Result<(), WorkError> {
        let started = std::time::Instant::now();
        let report = self.sync_pass(shutdown).instrument(pass_span("hosts")).await?;
        info!(
            applied = report.applied,
            failed = report.failed,
            dry_run = report.dry_run,
            "Done with host update in {:.2} seconds",
            started.elapsed().as_secs_f64()
        );
        Ok(())
    }
}
