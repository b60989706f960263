/**
 * HOSTSYNC - point d'entrée du démon
 *
 * RÔLE : charge la configuration, résout les collecteurs / modificateurs,
 * ouvre le store et le client plateforme, puis lance tous les workers.
 *
 * ARRÊT : SIGINT / SIGTERM ou premier worker en erreur fatale -> signal
 * d'arrêt diffusé, workers attendus pendant `shutdown_grace_secs`, puis
 * abandonnés. Toute erreur de configuration arrête le démarrage avant le
 * lancement des workers.
 */

use anyhow::{anyhow, Context};
use hostsync_kernel::collectors::CollectorRegistry;
use hostsync_kernel::config::{load_config, Config};
use hostsync_kernel::failsafe::FailsafeGuard;
use hostsync_kernel::gc::GarbageCollector;
use hostsync_kernel::health::HealthTracker;
use hostsync_kernel::mapping::Mappings;
use hostsync_kernel::merger::Merger;
use hostsync_kernel::modifiers::ModifierRegistry;
use hostsync_kernel::platform::{PlatformApi, ZabbixClient};
use hostsync_kernel::source::SourceRunner;
use hostsync_kernel::state::shutdown_channel;
use hostsync_kernel::store::open_store;
use hostsync_kernel::sync::{HostUpdater, HostgroupUpdater, TemplateUpdater};
use hostsync_kernel::worker::{run_periodic, WorkError};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const HEALTH_WRITE_INTERVAL: Duration = Duration::from_secs(30);

type WorkerResult = (String, Result<(), WorkError>);

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("cannot listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("cannot listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();

    let config: Config = load_config().context("invalid configuration")?;
    init_tracing(&config.log_level);
    info!(
        "hostsync starting: {} sources, {} modifiers, dryrun={}",
        config.sources.len(),
        config.modifiers.len(),
        config.platform.dryrun
    );

    // Unités résolues au démarrage : un nom inconnu ou un paramètre invalide est fatal
    let collectors = CollectorRegistry::with_builtins();
    let mut resolved = Vec::new();
    for source in &config.sources {
        let collector = collectors
            .resolve(source)
            .with_context(|| format!("source '{}'", source.name))?;
        resolved.push((source.clone(), collector));
    }
    let chain = ModifierRegistry::with_builtins()
        .build_chain(&config.modifiers)
        .context("modifier chain")?;
    if !chain.is_empty() {
        info!("modifier chain: {}", chain.names().join(" -> "));
    }

    let mappings = Arc::new(
        Mappings::load(&config.platform.map_dir)
            .with_context(|| format!("cannot read map files in {}", config.platform.map_dir.display()))?,
    );
    let store = open_store(&config.store).await.context("cannot open store")?;
    let api: Arc<dyn PlatformApi> = Arc::new(ZabbixClient::new(&config.platform).context("platform client")?);
    match api.version().await {
        Ok(version) => info!("platform API version {version}"),
        Err(e) => warn!("platform API not reachable yet: {e}"),
    }

    let health = HealthTracker::new(config.failsafe.max_changes);
    let (shutdown_tx, shutdown_rx) = shutdown_channel();
    let mut workers: JoinSet<WorkerResult> = JoinSet::new();

    let now = OffsetDateTime::now_utc();
    for (source, collector) in resolved {
        let name = format!("source:{}", source.name);
        let runner = SourceRunner::new(source, collector, store.clone(), health.clone(), now);
        let rx = shutdown_rx.clone();
        workers.spawn(async move { (name, runner.run(rx).await) });
    }

    let merger = Merger::new(
        config.source_names(),
        store.clone(),
        chain,
        Duration::from_secs(config.merger.update_interval_secs),
    );
    let (h, rx) = (health.clone(), shutdown_rx.clone());
    workers.spawn(async move { ("merger".to_string(), run_periodic(merger, h, rx).await) });

    let hosts = HostUpdater::new(
        api.clone(),
        store.clone(),
        config.platform.clone(),
        FailsafeGuard::new(config.failsafe.clone()),
    );
    let (h, rx) = (health.clone(), shutdown_rx.clone());
    workers.spawn(async move { ("hosts".to_string(), run_periodic(hosts, h, rx).await) });

    let hostgroups = HostgroupUpdater::new(api.clone(), store.clone(), mappings.clone(), config.platform.clone());
    let (h, rx) = (health.clone(), shutdown_rx.clone());
    workers.spawn(async move { ("hostgroups".to_string(), run_periodic(hostgroups, h, rx).await) });

    let templates = TemplateUpdater::new(api.clone(), store.clone(), mappings, config.platform.clone());
    let (h, rx) = (health.clone(), shutdown_rx.clone());
    workers.spawn(async move { ("templates".to_string(), run_periodic(templates, h, rx).await) });

    if config.gc.enabled {
        let gc = GarbageCollector::new(api.clone(), config.platform.clone(), config.gc.clone());
        let (h, rx) = (health.clone(), shutdown_rx.clone());
        workers.spawn(async move { ("gc".to_string(), run_periodic(gc, h, rx).await) });
    } else {
        info!("garbage collector disabled");
    }

    let writer = health.spawn_writer(config.health_file.clone(), HEALTH_WRITE_INTERVAL, shutdown_rx.clone());
    let http = match &config.http {
        Some(http) => {
            let addr: SocketAddr = http.listen.parse().context("http.listen")?;
            let (h, rx) = (health.clone(), shutdown_rx.clone());
            Some(tokio::spawn(async move {
                if let Err(e) = hostsync_kernel::http::serve(addr, h, rx).await {
                    error!("health endpoint stopped: {e}");
                }
            }))
        }
        None => None,
    };

    // Attente : signal d'arrêt ou premier worker terminé en erreur fatale
    let mut fatal = None;
    tokio::select! {
        _ = shutdown_signal() => info!("shutdown requested"),
        Some(joined) = workers.join_next() => {
            fatal = Some(match joined {
                Ok((name, Err(e))) => format!("{name}: {e}"),
                Ok((name, Ok(()))) => format!("{name} stopped unexpectedly"),
                Err(e) => format!("worker panicked: {e}"),
            });
        }
    }
    if let Some(reason) = &fatal {
        error!("stopping all workers: {reason}");
    }
    let _ = shutdown_tx.send(true);

    let grace = Duration::from_secs(config.shutdown_grace_secs);
    let drained = tokio::time::timeout(grace, async {
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((name, Err(e))) => warn!("{name} stopped with error: {e}"),
                Ok((name, Ok(()))) => info!("{name} stopped"),
                Err(e) => warn!("worker task failed: {e}"),
            }
        }
    })
    .await;
    if drained.is_err() {
        warn!("workers still running after {}s, aborting them", grace.as_secs());
        workers.abort_all();
    }
    let _ = writer.await;
    if let Some(http) = http {
        let _ = http.await;
    }

    info!("hostsync stopped");
    match fatal {
        Some(reason) => Err(anyhow!(reason)),
        None => Ok(()),
    }
}
