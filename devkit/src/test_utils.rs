/*!
Test Harness de bout en bout

Assemble une synchro complète sans réseau :
- sources scriptées -> store mémoire -> merger
- updaters hôtes / groupes / templates et GC contre la `FakePlatform`
- failsafe avec rapport et fichier OK dans un répertoire temporaire
- horloge virtuelle pour les sources (chaque collecte avance d'une heure)
*/

use crate::fake_platform::{FakePlatform, WriteRecord};
use crate::scripted::ScriptedCollector;
use anyhow::Result;
use hostsync_kernel::config::{FailsafeConfig, GcConfig, PlatformConfig, SourceConfig};
use hostsync_kernel::failsafe::FailsafeGuard;
use hostsync_kernel::gc::GarbageCollector;
use hostsync_kernel::health::HealthTracker;
use hostsync_kernel::mapping::Mappings;
use hostsync_kernel::merger::{MergeReport, Merger};
use hostsync_kernel::models::{Host, HostActions};
use hostsync_kernel::modifiers::ModifierChain;
use hostsync_kernel::platform::PlatformApi;
use hostsync_kernel::source::{CycleOutcome, SourceRunner};
use hostsync_kernel::state::{shutdown_channel, ShutdownRx, ShutdownTx};
use hostsync_kernel::store::{HostMap, HostStore, MemoryStore};
use hostsync_kernel::sync::{ApplyReport, HostUpdater, HostgroupUpdater, TemplateUpdater};
use hostsync_kernel::worker::PeriodicWork;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use time::macros::datetime;
use time::OffsetDateTime;

pub const FAILSAFE_CEILING: usize = 20;

/// Harness de test complet pour la synchronisation
pub struct TestHarness {
    pub platform: Arc<FakePlatform>,
    pub store: Arc<MemoryStore>,
    pub health: HealthTracker,
    pub config: PlatformConfig,
    pub mappings: Arc<Mappings>,
    failsafe: FailsafeConfig,
    sources: Vec<(SourceRunner, Arc<ScriptedCollector>)>,
    clock: OffsetDateTime,
    _shutdown_tx: ShutdownTx,
    shutdown: ShutdownRx,
    _dir: TempDir,
}

impl TestHarness {
    /// Plateforme 7.0 avec les groupes par défaut, aucune source
    pub fn new() -> Result<Self> {
        env_logger::try_init().ok();

        let dir = tempfile::tempdir()?;
        let mut config = PlatformConfig::with_url("http://fake-platform.test");
        config.managed_inventory = vec!["location".to_string()];
        let failsafe = FailsafeConfig {
            max_changes: FAILSAFE_CEILING,
            report_file: Some(dir.path().join("failsafe.json")),
            ok_file: Some(dir.path().join("failsafe_ok")),
            ok_file_strict: true,
        };
        let (tx, rx) = shutdown_channel();

        Ok(Self {
            platform: Arc::new(FakePlatform::with_default_groups()),
            store: Arc::new(MemoryStore::new()),
            health: HealthTracker::new(FAILSAFE_CEILING),
            config,
            mappings: Arc::new(Mappings::default()),
            failsafe,
            sources: Vec::new(),
            clock: datetime!(2026-01-05 08:00 UTC),
            _shutdown_tx: tx,
            shutdown: rx,
            _dir: dir,
        })
    }

    fn api(&self) -> Arc<dyn PlatformApi> {
        self.platform.clone()
    }

    /// Déclare une source ; l'ordre des appels est l'ordre de précédence
    pub async fn add_source(&mut self, name: &str, hosts: Vec<Host>) -> Result<Arc<ScriptedCollector>> {
        let collector = Arc::new(ScriptedCollector::new(hosts));
        self.store.ensure_source(name).await?;
        let runner = SourceRunner::new(
            SourceConfig::new(name, "scripted"),
            collector.clone(),
            self.store.clone(),
            self.health.clone(),
            self.clock,
        );
        self.sources.push((runner, collector.clone()));
        log::info!("source '{name}' registered");
        Ok(collector)
    }

    pub fn set_mappings(&mut self, mappings: Mappings) {
        self.mappings = Arc::new(mappings);
    }

    pub fn set_dryrun(&mut self, dryrun: bool) {
        self.config.dryrun = dryrun;
    }

    /// Une collecte par source, puis l'horloge avance d'une heure
    pub async fn collect_all(&mut self) -> Result<Vec<CycleOutcome>> {
        let mut outcomes = Vec::new();
        for (runner, _) in &mut self.sources {
            outcomes.push(runner.run_cycle(self.clock).await?);
        }
        self.clock += time::Duration::hours(1);
        Ok(outcomes)
    }

    pub async fn merge(&self) -> Result<MergeReport> {
        let names = self.sources.iter().map(|(runner, _)| runner.name().to_string()).collect();
        let merger = Merger::new(names, self.store.clone(), ModifierChain::empty(), Duration::from_secs(60));
        Ok(merger.merge_pass().await?)
    }

    pub async fn merged(&self) -> Result<HostMap> {
        Ok(self.store.load_merged().await?)
    }

    pub async fn sync_hosts(&self) -> Result<ApplyReport> {
        let updater = HostUpdater::new(
            self.api(),
            self.store.clone(),
            self.config.clone(),
            FailsafeGuard::new(self.failsafe.clone()),
        );
        Ok(updater.sync_pass(&self.shutdown).await?)
    }

    pub async fn sync_hostgroups(&self) -> Result<()> {
        let mut updater =
            HostgroupUpdater::new(self.api(), self.store.clone(), self.mappings.clone(), self.config.clone());
        Ok(updater.work(&self.shutdown).await?)
    }

    pub async fn sync_templates(&self) -> Result<()> {
        let mut updater =
            TemplateUpdater::new(self.api(), self.store.clone(), self.mappings.clone(), self.config.clone());
        Ok(updater.work(&self.shutdown).await?)
    }

    pub async fn gc(&self, delete_empty_maintenance: bool) -> Result<()> {
        let gc_config = GcConfig { enabled: true, interval_secs: 86400, delete_empty_maintenance };
        let mut gc = GarbageCollector::new(self.api(), self.config.clone(), gc_config);
        Ok(gc.work(&self.shutdown).await?)
    }

    /// Collecte, fusion, puis les trois updaters dans l'ordre du démon
    pub async fn full_pass(&mut self) -> Result<ApplyReport> {
        self.collect_all().await?;
        self.merge().await?;
        let report = self.sync_hosts().await?;
        self.sync_hostgroups().await?;
        self.sync_templates().await?;
        Ok(report)
    }

    pub fn failsafe_report_path(&self) -> PathBuf {
        self.failsafe.report_file.clone().unwrap_or_default()
    }

    pub fn failsafe_ok_path(&self) -> PathBuf {
        self.failsafe.ok_file.clone().unwrap_or_default()
    }

    /// Rapport du dernier blocage, s'il existe
    pub fn failsafe_report(&self) -> Option<HostActions> {
        let text = std::fs::read_to_string(self.failsafe_report_path()).ok()?;
        serde_json::from_str(&text).ok()
    }

    /// Crée le fichier OK : la prochaine passe ignore le failsafe une fois
    pub fn approve_failsafe(&self) -> Result<()> {
        std::fs::write(self.failsafe_ok_path(), "")?;
        Ok(())
    }

    /// Écritures touchant un hôte donné
    pub fn writes_for(&self, hostname: &str) -> Vec<WriteRecord> {
        self.platform
            .writes()
            .into_iter()
            .filter(|write| match write {
                WriteRecord::CreateHost(name) => name == hostname,
                WriteRecord::UpdateHost { host, .. } | WriteRecord::SetInterface { host, .. } => host == hostname,
                _ => false,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake_platform::{GROUP_ALL, GROUP_DISABLED, GROUP_MANUAL};
    use crate::scripted::HostBuilder;
    use hostsync_kernel::mapping::parse_map;
    use hostsync_kernel::models::{Interface, INTERFACE_SNMP};
    use hostsync_kernel::platform::HostStatus;

    fn fleet(prefix: &str, n: usize) -> Vec<Host> {
        (0..n).map(|i| Host::new(format!("{prefix}{i:02}.example.com"))).collect()
    }

    fn web_mappings() -> Mappings {
        Mappings {
            property_template: parse_map("is_web:Template-web", "property_template_map.txt"),
            property_hostgroup: parse_map("is_web:Web-servers", "property_hostgroup_map.txt"),
            ..Mappings::default()
        }
    }

    #[tokio::test]
    async fn repeated_passes_converge_to_no_writes() {
        let mut harness = TestHarness::new().unwrap();
        harness.platform.add_template("Template-web");
        harness.set_mappings(web_mappings());

        let mut snmp = Interface::new("10.0.0.5", "161", INTERFACE_SNMP);
        snmp.details.insert("version".into(), "2".into());
        snmp.details.insert("community".into(), "{$SNMP_COMMUNITY}".into());
        let hosts = vec![
            HostBuilder::new("web01.example.com")
                .property("is_web")
                .tag("zac_env", "prod")
                .inventory("location", "room-1")
                .build(),
            HostBuilder::new("switch01.example.com").interface(snmp).importance(1).build(),
            HostBuilder::new("db01.example.com").build(),
        ];
        harness.add_source("cmdb", hosts).await.unwrap();

        harness.full_pass().await.unwrap();
        harness.full_pass().await.unwrap();
        harness.platform.clear_writes();
        harness.full_pass().await.unwrap();
        assert_eq!(harness.platform.writes(), Vec::new());

        let web = harness.platform.host("web01.example.com").unwrap();
        assert!(web.in_group(GROUP_ALL));
        assert!(web.in_group("Web-servers"));
        assert!(web.in_group("Source-cmdb"));
        assert!(web.in_group("Importance-X"));
        assert!(web.templates.contains_key("Template-web"));
        assert_eq!(web.inventory.get("location").map(String::as_str), Some("room-1"));

        let switch = harness.platform.host("switch01.example.com").unwrap();
        assert!(switch.in_group("Importance-1"));
        assert!(switch.main_interface(INTERFACE_SNMP).is_some());
    }

    #[tokio::test]
    async fn mass_removal_is_blocked_and_reported() {
        let mut harness = TestHarness::new().unwrap();
        for host in fleet("old", 25) {
            harness.platform.add_host(&host.hostname, &[GROUP_ALL]);
        }
        harness.add_source("cmdb", Vec::new()).await.unwrap();

        let report = harness.full_pass().await.unwrap();
        assert_eq!(report.applied, 0);

        let blocked = harness.failsafe_report().expect("failsafe report");
        assert_eq!(blocked.remove.len(), 25);
        assert!(blocked.add.is_empty());
        for name in harness.platform.host_names() {
            assert_eq!(harness.platform.host(&name).unwrap().status, HostStatus::Monitored);
        }
    }

    #[tokio::test]
    async fn removal_at_the_ceiling_proceeds() {
        let mut harness = TestHarness::new().unwrap();
        for host in fleet("old", FAILSAFE_CEILING) {
            harness.platform.add_host(&host.hostname, &[GROUP_ALL]);
        }
        harness.add_source("cmdb", Vec::new()).await.unwrap();

        let report = harness.full_pass().await.unwrap();
        assert_eq!(report.applied, FAILSAFE_CEILING);
        assert!(harness.failsafe_report().is_none());
        let disabled = harness.platform.host("old00.example.com").unwrap();
        assert_eq!(disabled.status, HostStatus::Unmonitored);
    }

    #[tokio::test]
    async fn ok_marker_releases_one_blocked_pass() {
        let mut harness = TestHarness::new().unwrap();
        harness.add_source("cmdb", fleet("new", 30)).await.unwrap();

        harness.full_pass().await.unwrap();
        assert!(harness.platform.host_names().is_empty());

        harness.approve_failsafe().unwrap();
        let report = harness.full_pass().await.unwrap();
        assert_eq!(report.applied, 30);
        assert_eq!(harness.platform.host_names().len(), 30);
        assert!(!harness.failsafe_ok_path().exists());

        // Le marqueur est consommé : un nouveau retrait massif est bloqué
        harness.sources[0].1.set_hosts(fleet("other", 1));
        harness.full_pass().await.unwrap();
        let host = harness.platform.host("new00.example.com").unwrap();
        assert_eq!(host.status, HostStatus::Monitored);
        assert_eq!(harness.failsafe_report().unwrap().remove.len(), 30);
    }

    #[tokio::test]
    async fn later_source_wins_attributes_and_tags_are_united() {
        let mut harness = TestHarness::new().unwrap();
        let b = HostBuilder::new("web01.example.com")
            .importance(3)
            .tag("zac_env", "prod")
            .inventory("location", "room-b")
            .build();
        let a = HostBuilder::new("web01.example.com")
            .importance(5)
            .tag("zac_role", "frontend")
            .inventory("location", "room-a")
            .build();
        harness.add_source("b", vec![b]).await.unwrap();
        harness.add_source("a", vec![a]).await.unwrap();

        harness.full_pass().await.unwrap();

        let merged = harness.merged().await.unwrap();
        let host = &merged["web01.example.com"];
        assert_eq!(host.inventory["location"], "room-a");
        assert_eq!(host.importance, Some(3));

        let platform_host = harness.platform.host("web01.example.com").unwrap();
        assert!(platform_host.tags.contains(&("zac_env".to_string(), "prod".to_string())));
        assert!(platform_host.tags.contains(&("zac_role".to_string(), "frontend".to_string())));
        assert_eq!(platform_host.inventory["location"], "room-a");
        assert!(platform_host.in_group("Source-a"));
        assert!(platform_host.in_group("Source-b"));
    }

    #[tokio::test]
    async fn dry_run_never_writes() {
        let mut harness = TestHarness::new().unwrap();
        harness.set_dryrun(true);
        harness.set_mappings(web_mappings());
        harness.platform.add_host("stale.example.com", &[GROUP_ALL]);
        harness.add_source("cmdb", fleet("web", 3)).await.unwrap();

        let report = harness.full_pass().await.unwrap();
        assert_eq!(report.dry_run, 4);
        assert_eq!(report.applied, 0);
        assert!(harness.platform.writes().is_empty());
        assert_eq!(harness.platform.host_names(), vec!["stale.example.com".to_string()]);
    }

    #[tokio::test]
    async fn manual_hosts_are_left_alone() {
        let mut harness = TestHarness::new().unwrap();
        harness.platform.add_host("manual01.example.com", &[GROUP_MANUAL]);
        harness.platform.add_host("manual02.example.com", &[GROUP_MANUAL, GROUP_ALL]);
        let sourced = vec![
            HostBuilder::new("manual01.example.com").tag("zac_env", "prod").build(),
            Host::new("web01.example.com"),
        ];
        harness.add_source("cmdb", sourced).await.unwrap();

        harness.full_pass().await.unwrap();

        assert!(harness.writes_for("manual01.example.com").is_empty());
        assert!(harness.writes_for("manual02.example.com").is_empty());
        assert!(!harness.writes_for("web01.example.com").is_empty());
        let untouched = harness.platform.host("manual02.example.com").unwrap();
        assert_eq!(untouched.status, HostStatus::Monitored);
    }

    #[tokio::test]
    async fn disabled_host_is_parked_without_templates() {
        let mut harness = TestHarness::new().unwrap();
        let template = harness.platform.add_template("Template-web");
        harness.platform.add_host("web01.example.com", &[GROUP_ALL, "Web-servers"]);
        harness.platform.edit_host("web01.example.com", |host| {
            host.templates.insert("Template-web".into(), template.clone());
        });
        harness
            .add_source("cmdb", vec![HostBuilder::new("web01.example.com").disabled().build()])
            .await
            .unwrap();

        harness.full_pass().await.unwrap();

        let host = harness.platform.host("web01.example.com").unwrap();
        assert_eq!(host.status, HostStatus::Unmonitored);
        assert_eq!(host.groups.keys().cloned().collect::<Vec<_>>(), vec![GROUP_DISABLED.to_string()]);
        assert!(host.templates.is_empty());
    }

    #[tokio::test]
    async fn gc_prunes_disabled_hosts_from_maintenances() {
        let harness = TestHarness::new().unwrap();
        harness.platform.add_host("live.example.com", &[GROUP_ALL]);
        harness.platform.add_host("gone.example.com", &[GROUP_DISABLED]);
        harness.platform.edit_host("gone.example.com", |host| host.status = HostStatus::Unmonitored);
        let mixed = harness.platform.add_maintenance("patching", &["live.example.com", "gone.example.com"]);
        let only_gone = harness.platform.add_maintenance("decommission", &["gone.example.com"]);

        harness.gc(true).await.unwrap();

        let live_id = harness.platform.host("live.example.com").unwrap().id;
        let remaining = harness.platform.maintenance(&mixed).unwrap();
        assert_eq!(remaining.host_ids.into_iter().collect::<Vec<_>>(), vec![live_id]);
        assert!(harness.platform.maintenance(&only_gone).is_none());
    }

    #[tokio::test]
    async fn gc_empties_windows_it_may_not_delete() {
        let harness = TestHarness::new().unwrap();
        harness.platform.add_host("gone.example.com", &[GROUP_DISABLED]);
        harness.platform.edit_host("gone.example.com", |host| host.status = HostStatus::Unmonitored);
        let window = harness.platform.add_maintenance("decommission", &["gone.example.com"]);

        harness.gc(false).await.unwrap();

        let kept = harness.platform.maintenance(&window).unwrap();
        assert!(kept.host_ids.is_empty());
        assert!(harness
            .platform
            .writes()
            .contains(&WriteRecord::UpdateMaintenance { id: window, host_ids: Vec::new() }));
    }

    #[tokio::test]
    async fn failing_host_does_not_stop_the_pass() {
        let mut harness = TestHarness::new().unwrap();
        harness.platform.fail_writes_for("web00.example.com");
        harness.add_source("cmdb", fleet("web", 3)).await.unwrap();

        let report = harness.full_pass().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.applied, 2);
        assert!(harness.platform.host("web02.example.com").is_some());
    }
}
