/**
 * HOSTGROUP UPDATER - groupes d'hôtes dérivés des fiches fusionnées
 *
 * ÉTAPE 1, créations (avant toute affectation) :
 * - groupes "extra" : valeurs du mapping site-admin re-préfixées
 * - groupes de templates (ou groupes d'hôtes homonymes avant 6.2)
 * - tout groupe dérivé d'un hôte qui n'existe pas encore
 *
 * ÉTAPE 2, affectation par hôte géré :
 *   dérivés = {all} ∪ map propriétés ∪ map site-admins
 *             ∪ {préfixe source + source} ∪ {préfixe importance + importance | X}
 *   nouveaux = (actuels − (gérés − dérivés)) ∪ dérivés
 * Les groupes hors gestion (ajoutés à la main) sont conservés.
 */

use super::{enabled_hosts, pass_span, synced_pairs, Action, Dispatcher, GROUP_SEPARATOR};
use crate::config::PlatformConfig;
use crate::mapping::{all_values, mapping_values_with_prefix, with_prefix, Mappings};
use crate::models::Host;
use crate::platform::{PlatformApi, PlatformSnapshot};
use crate::state::ShutdownRx;
use crate::store::{HostMap, HostStore};
use crate::worker::{PeriodicWork, WorkError};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn, Instrument};

/// Groupes qu'un hôte doit avoir
pub fn desired_hostgroups(host: &Host, mappings: &Mappings, config: &PlatformConfig) -> BTreeSet<String> {
    let mut groups = BTreeSet::from([config.hostgroup_all.clone()]);
    for property in &host.properties {
        if let Some(mapped) = mappings.property_hostgroup.get(property) {
            groups.extend(mapped.iter().cloned());
        }
    }
    for siteadmin in &host.siteadmins {
        if let Some(mapped) = mappings.siteadmin_hostgroup.get(siteadmin) {
            groups.extend(mapped.iter().cloned());
        }
    }
    for source in &host.sources {
        groups.insert(format!("{}{source}", config.hostgroup_source_prefix));
    }
    let importance = host.importance.map_or_else(|| "X".to_string(), |i| i.to_string());
    groups.insert(format!("{}{importance}", config.hostgroup_importance_prefix));
    groups
}

/// Groupes dont la synchro a la charge
pub fn managed_hostgroups(
    existing: impl IntoIterator<Item = String>,
    mappings: &Mappings,
    config: &PlatformConfig,
) -> BTreeSet<String> {
    let mut managed = all_values(&mappings.property_hostgroup);
    managed.extend(all_values(&mappings.siteadmin_hostgroup));
    managed.extend(existing.into_iter().filter(|name| {
        name.starts_with(&config.hostgroup_source_prefix) || name.starts_with(&config.hostgroup_importance_prefix)
    }));
    managed.insert(config.hostgroup_all.clone());
    managed
}

fn template_group_names(mappings: &Mappings, config: &PlatformConfig) -> BTreeSet<String> {
    all_values(&mappings.siteadmin_hostgroup)
        .iter()
        .filter_map(|group| match with_prefix(group, &config.templategroup_prefix, GROUP_SEPARATOR) {
            Ok(name) => Some(name),
            Err(e) => {
                warn!("Cannot derive template group from '{group}': {e}");
                None
            }
        })
        .collect()
}

pub fn plan(
    merged: HostMap,
    snapshot: &PlatformSnapshot,
    mappings: &Mappings,
    config: &PlatformConfig,
) -> Vec<Action> {
    let enabled = enabled_hosts(merged);
    let existing = &snapshot.hostgroups;
    let mut new_hostgroups = BTreeSet::new();
    let mut new_templategroups = BTreeSet::new();

    for prefix in &config.extra_siteadmin_hostgroup_prefixes {
        let extra = mapping_values_with_prefix(&mappings.siteadmin_hostgroup, prefix, GROUP_SEPARATOR);
        new_hostgroups.extend(all_values(&extra).into_iter().filter(|g| !existing.contains_key(g)));
    }

    if config.create_templategroups {
        let wanted = template_group_names(mappings, config);
        if snapshot.version.supports_templategroups() {
            new_templategroups.extend(wanted.into_iter().filter(|g| !snapshot.templategroups.contains_key(g)));
        } else {
            debug!("Platform version {} has no template groups, creating host groups instead", snapshot.version);
            new_hostgroups.extend(wanted.into_iter().filter(|g| !existing.contains_key(g)));
        }
    }

    let managed = managed_hostgroups(existing.keys().cloned(), mappings, config);
    let mut assignments = Vec::new();
    for (platform, host) in synced_pairs(&snapshot.hosts, &enabled, &config.hostgroup_manual) {
        let desired = desired_hostgroups(host, mappings, config);
        new_hostgroups.extend(desired.iter().filter(|g| !existing.contains_key(*g)).cloned());

        let current: BTreeSet<String> = platform.groups.keys().cloned().collect();
        let updated: BTreeSet<String> = current
            .iter()
            .filter(|g| !managed.contains(*g) || desired.contains(*g))
            .chain(desired.iter())
            .cloned()
            .collect();
        if updated != current {
            debug!(
                "Host groups on '{}': removing ({}), adding ({})",
                platform.name,
                current.difference(&updated).cloned().collect::<Vec<_>>().join(", "),
                updated.difference(&current).cloned().collect::<Vec<_>>().join(", ")
            );
            assignments.push(Action::SetHostGroups {
                host_id: platform.id.clone(),
                hostname: platform.name.clone(),
                groups: updated,
            });
        }
    }

    let mut actions: Vec<Action> = new_hostgroups
        .into_iter()
        .map(|name| Action::CreateHostGroup { name })
        .collect();
    actions.extend(new_templategroups.into_iter().map(|name| Action::CreateTemplateGroup { name }));
    actions.extend(assignments);
    actions
}

pub struct HostgroupUpdater {
    api: Arc<dyn PlatformApi>,
    store: Arc<dyn HostStore>,
    mappings: Arc<Mappings>,
    config: PlatformConfig,
}

impl HostgroupUpdater {
    pub fn new(
        api: Arc<dyn PlatformApi>,
        store: Arc<dyn HostStore>,
        mappings: Arc<Mappings>,
        config: PlatformConfig,
    ) -> Self {
        Self { api, store, mappings, config }
    }
}

#[async_trait]
impl PeriodicWork for HostgroupUpdater {
    fn name(&self) -> &str {
        "hostgroups"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(self.config.update_interval_secs)
    }

    async fn work(&mut self, shutdown: &ShutdownRx) -> Result<(), WorkError> {
        async {
            let merged = self.store.load_merged().await?;
            let snapshot = PlatformSnapshot::fetch(self.api.as_ref(), &[], false).await?;
            let actions = plan(merged, &snapshot, &self.mappings, &self.config);

            let mut dispatcher =
                Dispatcher::new(self.api.as_ref(), self.config.dryrun, shutdown, snapshot.hostgroups.clone());
            let report = dispatcher.apply(&actions).await;
            info!(
                applied = report.applied,
                failed = report.failed,
                dry_run = report.dry_run,
                "Done with host group update"
            );
            Ok::<_, WorkError>(())
        }
        .instrument(pass_span("hostgroups"))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::parse_map;
    use crate::platform::{ApiVersion, HostStatus, IdMap, PlatformHost};
    use std::collections::BTreeMap;

    fn mappings() -> Mappings {
        Mappings {
            property_template: Default::default(),
            property_hostgroup: parse_map("is_web:Role-web", "test"),
            siteadmin_hostgroup: parse_map("ops@example.com:Siteadmin-ops", "test"),
        }
    }

    fn platform_host(groups: &[&str]) -> PlatformHost {
        PlatformHost {
            id: "10".into(),
            name: "web01.example.com".into(),
            status: HostStatus::Monitored,
            groups: groups.iter().map(|g| (g.to_string(), format!("g-{g}"))).collect(),
            templates: IdMap::new(),
            interfaces: Vec::new(),
            tags: BTreeSet::new(),
            inventory_mode: 1,
            inventory: BTreeMap::new(),
        }
    }

    fn snapshot(version: ApiVersion, host: PlatformHost, groups: &[&str]) -> PlatformSnapshot {
        PlatformSnapshot {
            version,
            hosts: [(host.name.clone(), host)].into(),
            hostgroups: groups.iter().map(|g| (g.to_string(), format!("g-{g}"))).collect(),
            templategroups: IdMap::new(),
            templates: IdMap::new(),
            maintenances: Vec::new(),
        }
    }

    fn web_host() -> Host {
        let mut host = Host::new("web01.example.com");
        host.properties.insert("is_web".into());
        host.siteadmins.insert("ops@example.com".into());
        host.sources.insert("cmdb".into());
        host
    }

    #[test]
    fn derives_groups_from_properties_siteadmins_sources_and_importance() {
        let config = PlatformConfig::with_url("http://zbx.test");
        let desired = desired_hostgroups(&web_host(), &mappings(), &config);
        let expected: BTreeSet<String> =
            ["All-hosts", "Role-web", "Siteadmin-ops", "Source-cmdb", "Importance-X"].map(String::from).into();
        assert_eq!(desired, expected);
    }

    #[test]
    fn creates_missing_groups_before_assigning_and_keeps_foreign_groups() {
        let config = PlatformConfig::with_url("http://zbx.test");
        let existing = ["All-hosts", "Role-web", "Source-ldap", "Handmade"];
        let host = platform_host(&["All-hosts", "Source-ldap", "Handmade"]);
        let snap = snapshot(ApiVersion::new(7, 0, 0), host, &existing);
        let merged: HostMap = [("web01.example.com".to_string(), web_host())].into();

        let actions = plan(merged, &snap, &mappings(), &config);
        let created: Vec<&str> = actions
            .iter()
            .filter_map(|a| match a {
                Action::CreateHostGroup { name } => Some(name.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(created, vec!["Importance-X", "Siteadmin-ops", "Source-cmdb"]);

        match actions.last().unwrap() {
            Action::SetHostGroups { groups, .. } => {
                assert!(groups.contains("Handmade"));
                assert!(!groups.contains("Source-ldap"));
                assert!(groups.contains("Source-cmdb"));
                assert!(groups.contains("Role-web"));
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn template_groups_fall_back_to_host_groups_before_6_2() {
        let mut config = PlatformConfig::with_url("http://zbx.test");
        config.create_templategroups = true;
        let host = platform_host(&["All-hosts"]);

        let old = plan(HostMap::new(), &snapshot(ApiVersion::new(6, 0, 0), host.clone(), &["All-hosts"]), &mappings(), &config);
        assert_eq!(old, vec![Action::CreateHostGroup { name: "Templates-ops".into() }]);

        let new = plan(HostMap::new(), &snapshot(ApiVersion::new(6, 4, 0), host, &["All-hosts"]), &mappings(), &config);
        assert_eq!(new, vec![Action::CreateTemplateGroup { name: "Templates-ops".into() }]);
    }

    #[test]
    fn extra_siteadmin_prefixes_create_groups() {
        let mut config = PlatformConfig::with_url("http://zbx.test");
        config.extra_siteadmin_hostgroup_prefixes.insert("Secondary-".into());
        let snap = snapshot(ApiVersion::new(7, 0, 0), platform_host(&["All-hosts"]), &["All-hosts"]);
        let actions = plan(HostMap::new(), &snap, &mappings(), &config);
        assert_eq!(actions, vec![Action::CreateHostGroup { name: "Secondary-ops".into() }]);
    }
}
