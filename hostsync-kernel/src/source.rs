/**
 * SOURCE RUNNER - un worker par source configurée
 *
 * CYCLE :
 * 1. `SourceHealth::should_run(now)` (source désactivée = cycle sauté,
 *    réactivée automatiquement à l'expiration)
 * 2. Appel du collecteur sous timeout (`timeout_secs`)
 * 3. Échec : transition de résilience (backoff / tolérance / fatal),
 *    datée de la fin de la collecte et non de son début
 * 4. Succès : fiches validées, dédupliquées, marquées `sources = {nom}`,
 *    puis commit dans le namespace de la source (politique `on_empty`)
 *
 * Le runner est seul à écrire dans son namespace.
 */

use crate::collectors::SourceCollector;
use crate::config::{EmptyResultPolicy, SourceConfig};
use crate::health::HealthTracker;
use crate::models::Host;
use crate::resilience::{FailureVerdict, SourceHealth};
use crate::state::{is_shutting_down, ShutdownRx};
use crate::store::{CommitStats, HostMap, HostStore};
use crate::worker::{sleep_or_shutdown, WorkError};
use anyhow::anyhow;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::time::Instant;
use tracing::{error, info, info_span, warn, Instrument};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Pas encore l'heure (ou source désactivée)
    NotDue,
    Committed(CommitStats),
    /// Résultat vide ignoré (`on_empty: keep`)
    EmptyIgnored,
    Failed(FailureVerdict),
}

pub struct SourceRunner {
    config: SourceConfig,
    collector: Arc<dyn SourceCollector>,
    store: Arc<dyn HostStore>,
    health: SourceHealth,
    tracker: HealthTracker,
    worker_name: String,
}

impl SourceRunner {
    pub fn new(
        config: SourceConfig,
        collector: Arc<dyn SourceCollector>,
        store: Arc<dyn HostStore>,
        tracker: HealthTracker,
        now: OffsetDateTime,
    ) -> Self {
        let worker_name = format!("source:{}", config.name);
        tracker.register(&worker_name);
        Self {
            health: SourceHealth::from_config(&config, now),
            config,
            collector,
            store,
            tracker,
            worker_name,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn health(&self) -> &SourceHealth {
        &self.health
    }

    /// Valide, déduplique et marque les fiches d'une collecte
    fn prepare(&self, hosts: Vec<Host>) -> anyhow::Result<HostMap> {
        let mut prepared = HostMap::new();
        for mut host in hosts {
            host.validate()?;
            if prepared.contains_key(&host.hostname) {
                warn!("duplicate host '{}' in collector output, keeping the first", host.hostname);
                continue;
            }
            host.sources.clear();
            host.sources.insert(self.config.name.clone());
            prepared.insert(host.hostname.clone(), host);
        }
        Ok(prepared)
    }

    async fn collect(&self) -> anyhow::Result<HostMap> {
        let timeout = Duration::from_secs(self.config.timeout_secs);
        let hosts = tokio::time::timeout(timeout, self.collector.collect(&self.config.params))
            .await
            .map_err(|_| anyhow!("collector timed out after {}s", timeout.as_secs()))??;
        self.prepare(hosts)
    }

    /// Un cycle complet démarré à l'instant `now`
    pub async fn run_cycle(&mut self, now: OffsetDateTime) -> Result<CycleOutcome, WorkError> {
        if !self.health.should_run(now) {
            return Ok(CycleOutcome::NotDue);
        }

        let started = Instant::now();
        let result = self.collect().await;
        let finished = now + started.elapsed();

        let hosts = match result {
            Ok(hosts) => hosts,
            Err(e) => {
                let verdict = self.health.record_failure(finished, format!("{e:#}"));
                error!("collection failed: {e:#}");
                self.tracker.mark_error(&self.worker_name, &format!("{e:#}"));
                self.tracker.set_phase(&self.worker_name, self.health.phase(), self.health.disabled_until());
                if verdict == FailureVerdict::Fatal {
                    return Err(WorkError::Fatal(format!(
                        "source '{}' failed and exit_on_error is set: {e:#}",
                        self.config.name
                    )));
                }
                return Ok(CycleOutcome::Failed(verdict));
            }
        };

        self.health.record_success(finished);
        self.tracker.set_phase(&self.worker_name, self.health.phase(), None);

        if hosts.is_empty() && self.config.on_empty == EmptyResultPolicy::Keep {
            let previous = self.store.load_source(&self.config.name).await?;
            if !previous.is_empty() {
                warn!(
                    "collector returned no hosts, keeping {} previously committed hosts",
                    previous.len()
                );
                self.tracker.mark_ok(&self.worker_name);
                return Ok(CycleOutcome::EmptyIgnored);
            }
        }

        let stats = self.store.commit_source(&self.config.name, &hosts).await?;
        info!(
            inserted = stats.inserted,
            updated = stats.updated,
            removed = stats.removed,
            unchanged = stats.unchanged,
            "collected {} hosts",
            hosts.len()
        );
        self.tracker.mark_ok(&self.worker_name);
        Ok(CycleOutcome::Committed(stats))
    }

    /// Boucle du worker jusqu'au signal d'arrêt ou à une erreur fatale
    pub async fn run(mut self, mut shutdown: ShutdownRx) -> Result<(), WorkError> {
        let span = info_span!("worker", name = %self.worker_name);
        async move {
            self.store.ensure_source(&self.config.name).await?;
            info!("source worker started (collector '{}')", self.collector.kind());

            loop {
                if is_shutting_down(&shutdown) {
                    break;
                }
                match self.run_cycle(OffsetDateTime::now_utc()).await {
                    Ok(_) => {}
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        error!("cycle failed: {e}");
                        self.tracker.mark_error(&self.worker_name, &e.to_string());
                    }
                }

                let wake_at = self
                    .health
                    .wake_at()
                    .unwrap_or_else(|| OffsetDateTime::now_utc() + self.config.update_interval());
                let wait = Duration::try_from(wake_at - OffsetDateTime::now_utc()).unwrap_or_default();
                if sleep_or_shutdown(wait, &mut shutdown).await {
                    break;
                }
            }
            info!("source worker stopped");
            Ok(())
        }
        .instrument(span)
        .await
    }
}
