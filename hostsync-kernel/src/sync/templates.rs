//! Template updater : templates dérivés des propriétés des hôtes.
//!
//! Seuls les templates du mapping qui existent sur la plateforme sont gérés ;
//! un template géré qui n'est plus dérivé est retiré avec `templates_clear`.

use super::{enabled_hosts, pass_span, synced_pairs, Action, Dispatcher};
use crate::config::PlatformConfig;
use crate::mapping::{all_values, Mappings};
use crate::models::Host;
use crate::platform::{IdMap, PlatformApi, PlatformSnapshot};
use crate::state::ShutdownRx;
use crate::store::{HostMap, HostStore};
use crate::worker::{PeriodicWork, WorkError};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, Instrument};

/// Templates voulus pour un hôte, restreints à ceux qui existent
pub fn desired_templates(host: &Host, mappings: &Mappings, existing: &IdMap) -> BTreeSet<String> {
    host.properties
        .iter()
        .filter_map(|property| mappings.property_template.get(property))
        .flatten()
        .filter(|name| existing.contains_key(*name))
        .cloned()
        .collect()
}

pub fn plan(merged: HostMap, snapshot: &PlatformSnapshot, mappings: &Mappings, config: &PlatformConfig) -> Vec<Action> {
    let enabled = enabled_hosts(merged);
    let managed: BTreeSet<String> = all_values(&mappings.property_template)
        .into_iter()
        .filter(|name| snapshot.templates.contains_key(name))
        .collect();

    let mut actions = Vec::new();
    for (platform, host) in synced_pairs(&snapshot.hosts, &enabled, &config.hostgroup_manual) {
        let desired = desired_templates(host, mappings, &snapshot.templates);

        let (clear, mut templates): (IdMap, IdMap) = platform
            .templates
            .iter()
            .map(|(name, id)| (name.clone(), id.clone()))
            .partition(|(name, _)| managed.contains(name) && !desired.contains(name));
        for name in &desired {
            templates
                .entry(name.clone())
                .or_insert_with(|| snapshot.templates[name].clone());
        }

        if templates != platform.templates {
            debug!(
                "Updating templates on host '{}'. Old: {}. New: {}",
                platform.name,
                platform.templates.keys().cloned().collect::<Vec<_>>().join(", "),
                templates.keys().cloned().collect::<Vec<_>>().join(", ")
            );
            actions.push(Action::SetTemplates {
                host_id: platform.id.clone(),
                hostname: platform.name.clone(),
                templates,
                clear,
            });
        }
    }
    actions
}

pub struct TemplateUpdater {
    api: Arc<dyn PlatformApi>,
    store: Arc<dyn HostStore>,
    mappings: Arc<Mappings>,
    config: PlatformConfig,
}

impl TemplateUpdater {
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
impl PeriodicWork for TemplateUpdater {
    fn name(&self) -> &str {
        "templates"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(self.config.update_interval_secs)
    }

    async fn work(&mut self, shutdown: &ShutdownRx) -> Result<(), WorkError> {
        async {
            let merged = self.store.load_merged().await?;
            let snapshot = PlatformSnapshot::fetch(self.api.as_ref(), &[], false).await?;
            let actions = plan(merged, &snapshot, &self.mappings, &self.config);
            let report = Dispatcher::new(self.api.as_ref(), self.config.dryrun, shutdown, snapshot.hostgroups)
                .apply(&actions)
                .await;
            info!(
                applied = report.applied,
                failed = report.failed,
                dry_run = report.dry_run,
                "Done with template update"
            );
            Ok::<_, WorkError>(())
        }
        .instrument(pass_span("templates"))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::parse_map;
    use crate::platform::{ApiVersion, HostStatus, PlatformHost};
    use std::collections::BTreeMap;

    fn ids(names: &[&str]) -> IdMap {
        names.iter().map(|n| (n.to_string(), format!("t-{n}"))).collect()
    }

    fn setup(current: &[&str]) -> (PlatformSnapshot, Mappings) {
        let host = PlatformHost {
            id: "10".into(),
            name: "web01.example.com".into(),
            status: HostStatus::Monitored,
            groups: IdMap::new(),
            templates: ids(current),
            interfaces: Vec::new(),
            tags: BTreeSet::new(),
            inventory_mode: 1,
            inventory: BTreeMap::new(),
        };
        let snapshot = PlatformSnapshot {
            version: ApiVersion::new(7, 0, 0),
            hosts: [(host.name.clone(), host)].into(),
            hostgroups: IdMap::new(),
            templategroups: IdMap::new(),
            templates: ids(&["Template-web", "Template-db", "Template-local"]),
            maintenances: Vec::new(),
        };
        let mappings = Mappings {
            property_template: parse_map(
                "is_web:Template-web,Template-gone\nis_db:Template-db",
                "test",
            ),
            ..Mappings::default()
        };
        (snapshot, mappings)
    }

    fn web_host() -> HostMap {
        let mut host = Host::new("web01.example.com");
        host.properties.insert("is_web".into());
        [(host.hostname.clone(), host)].into()
    }

    #[test]
    fn swaps_managed_templates_and_keeps_local_ones() {
        let (snapshot, mappings) = setup(&["Template-db", "Template-local"]);
        let config = PlatformConfig::with_url("http://zbx.test");

        let actions = plan(web_host(), &snapshot, &mappings, &config);
        assert_eq!(
            actions,
            vec![Action::SetTemplates {
                host_id: "10".into(),
                hostname: "web01.example.com".into(),
                templates: ids(&["Template-local", "Template-web"]),
                clear: ids(&["Template-db"]),
            }]
        );
    }

    #[test]
    fn converged_host_has_no_action() {
        let (snapshot, mappings) = setup(&["Template-web", "Template-local"]);
        let config = PlatformConfig::with_url("http://zbx.test");
        assert!(plan(web_host(), &snapshot, &mappings, &config).is_empty());
    }
}
