/**
 * HEALTH - état de chaque worker pour la supervision externe
 *
 * - Chaque worker (source, merger, updaters, GC) a une entrée `WorkerStatus`
 * - Un task périodique réécrit le fichier health (écriture atomique
 *   tmp + rename) et logge une ligne de synthèse
 * - Le même document est servi par GET /health (voir http.rs)
 *
 * Observabilité uniquement : aucun worker ne lit l'état d'un autre.
 */

use crate::resilience::SourcePhase;
use crate::state::{new_state, Shared, ShutdownRx};
use crate::worker::sleep_or_shutdown;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub name: String,
    /// Dernière passe réussie
    pub ok: bool,
    /// Phase de résilience (sources uniquement)
    pub phase: Option<SourcePhase>,
    pub last_success: Option<String>,
    pub last_error: Option<String>,
    pub error_count: u64,
    pub disabled_until: Option<String>,
}

impl WorkerStatus {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ok: true,
            phase: None,
            last_success: None,
            last_error: None,
            error_count: 0,
            disabled_until: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub date: String,
    pub date_unixtime: i64,
    pub pid: u32,
    pub cwd: String,
    pub uptime_seconds: u64,
    pub memory_usage_mb: f32,
    pub all_ok: bool,
    pub workers: Vec<WorkerStatus>,
    pub failsafe: usize,
}

pub fn rfc3339(at: OffsetDateTime) -> String {
    at.format(&Rfc3339).unwrap_or_else(|_| at.unix_timestamp().to_string())
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    workers: Shared<BTreeMap<String, WorkerStatus>>,
    failsafe: usize,
}

impl HealthTracker {
    pub fn new(failsafe: usize) -> Self {
        Self {
            start_time: Instant::now(),
            workers: new_state(BTreeMap::new()),
            failsafe,
        }
    }

    pub fn register(&self, name: &str) {
        self.workers
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| WorkerStatus::new(name));
    }

    fn update(&self, name: &str, apply: impl FnOnce(&mut WorkerStatus)) {
        let mut workers = self.workers.lock();
        let status = workers
            .entry(name.to_string())
            .or_insert_with(|| WorkerStatus::new(name));
        apply(status);
    }

    pub fn mark_ok(&self, name: &str) {
        let now = rfc3339(OffsetDateTime::now_utc());
        self.update(name, |s| {
            s.ok = true;
            s.last_success = Some(now);
            s.last_error = None;
        });
    }

    pub fn mark_error(&self, name: &str, error: &str) {
        self.update(name, |s| {
            s.ok = false;
            s.error_count += 1;
            s.last_error = Some(error.to_string());
        });
    }

    pub fn set_phase(&self, name: &str, phase: SourcePhase, disabled_until: Option<OffsetDateTime>) {
        self.update(name, |s| {
            s.phase = Some(phase);
            s.disabled_until = disabled_until.map(rfc3339);
        });
    }

    pub fn worker(&self, name: &str) -> Option<WorkerStatus> {
        self.workers.lock().get(name).cloned()
    }

    pub fn report(&self) -> HealthReport {
        let now = OffsetDateTime::now_utc();
        let workers: Vec<WorkerStatus> = self.workers.lock().values().cloned().collect();
        HealthReport {
            date: rfc3339(now),
            date_unixtime: now.unix_timestamp(),
            pid: std::process::id(),
            cwd: std::env::current_dir()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            memory_usage_mb: get_memory_usage_mb(),
            all_ok: workers.iter().all(|w| w.ok),
            workers,
            failsafe: self.failsafe,
        }
    }

    /// Écrit le rapport dans `path` (tmp + rename, jamais de fichier tronqué)
    pub async fn write_file(&self, path: &Path) -> std::io::Result<()> {
        let payload = serde_json::to_vec_pretty(&self.report())?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, payload).await?;
        tokio::fs::rename(&tmp, path).await
    }

    /// Démarre la réécriture périodique du fichier health
    pub fn spawn_writer(
        &self,
        path: Option<PathBuf>,
        interval: Duration,
        mut shutdown: ShutdownRx,
    ) -> JoinHandle<()> {
        let tracker = self.clone();
        tokio::spawn(async move {
            loop {
                let report = tracker.report();
                let failing: Vec<&str> = report
                    .workers
                    .iter()
                    .filter(|w| !w.ok)
                    .map(|w| w.name.as_str())
                    .collect();
                if failing.is_empty() {
                    info!("health: {} workers ok", report.workers.len());
                } else {
                    warn!("health: workers not ok: {}", failing.join(", "));
                }

                if let Some(path) = &path {
                    if let Err(e) = tracker.write_file(path).await {
                        warn!("cannot write health file {}: {e}", path.display());
                    }
                }
                if sleep_or_shutdown(interval, &mut shutdown).await {
                    break;
                }
            }
        })
    }
}

fn get_memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            let rss_kb = status
                .lines()
                .find(|line| line.starts_with("VmRSS:"))
                .and_then(|line| line.split_whitespace().nth(1))
                .and_then(|kb| kb.parse::<u64>().ok());
            if let Some(kb) = rss_kb {
                return kb as f32 / 1024.0;
            }
        }
    }
    0.0
}
