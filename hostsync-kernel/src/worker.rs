/**
 * WORKERS PÉRIODIQUES - boucle commune du merger, des updaters et du GC
 *
 * FONCTIONNEMENT :
 * - Une passe à la fois : la suivante démarre `interval` après le début
 *   de la précédente (jamais de chevauchement)
 * - Erreur récupérable : loggée, health "not ok", nouvelle tentative au
 *   prochain intervalle
 * - Erreur fatale : la boucle s'arrête et remonte l'erreur à `main`, qui
 *   déclenche l'arrêt global
 * - Le signal d'arrêt est vérifié entre les passes ; les updaters le
 *   vérifient aussi entre deux actions
 */

use crate::health::HealthTracker;
use crate::platform::ApiError;
use crate::state::{is_shutting_down, ShutdownRx};
use crate::store::StoreError;
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tracing::{error, info, info_span, warn, Instrument};

#[derive(Debug, thiserror::Error)]
pub enum WorkError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("{0}")]
    Failed(String),
    #[error("fatal: {0}")]
    Fatal(String),
}

impl WorkError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, WorkError::Fatal(_))
    }
}

#[async_trait]
pub trait PeriodicWork: Send {
    fn name(&self) -> &str;

    fn interval(&self) -> Duration;

    /// Une passe complète
    async fn work(&mut self, shutdown: &ShutdownRx) -> Result<(), WorkError>;
}

/// Attend `duration` ou le signal d'arrêt. Renvoie true si l'arrêt est demandé.
pub async fn sleep_or_shutdown(duration: Duration, shutdown: &mut ShutdownRx) -> bool {
    if is_shutting_down(shutdown) {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        changed = shutdown.changed() => changed.is_err() || is_shutting_down(shutdown),
    }
}

pub async fn run_periodic<W: PeriodicWork>(
    mut work: W,
    health: HealthTracker,
    mut shutdown: ShutdownRx,
) -> Result<(), WorkError> {
    let name = work.name().to_string();
    health.register(&name);

    let span = info_span!("worker", name = %name);
    async move {
        info!("worker started (interval {}s)", work.interval().as_secs());
        loop {
            if is_shutting_down(&shutdown) {
                break;
            }

            let started = Instant::now();
            match work.work(&shutdown).await {
                Ok(()) => health.mark_ok(&name),
                Err(e) if e.is_fatal() => {
                    error!("{e}");
                    health.mark_error(&name, &e.to_string());
                    return Err(e);
                }
                Err(e) => {
                    error!("pass failed: {e}");
                    health.mark_error(&name, &e.to_string());
                }
            }

            let elapsed = started.elapsed();
            let interval = work.interval();
            if elapsed > interval {
                warn!(
                    "pass took {}s, longer than the {}s interval",
                    elapsed.as_secs(),
                    interval.as_secs()
                );
            }
            if sleep_or_shutdown(interval.saturating_sub(elapsed), &mut shutdown).await {
                break;
            }
        }
        info!("worker stopped");
        Ok(())
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::shutdown_channel;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct Counter {
        passes: Arc<AtomicU32>,
        fail_at: Option<u32>,
    }

    #[async_trait]
    impl PeriodicWork for Counter {
        fn name(&self) -> &str {
            "counter"
        }
        fn interval(&self) -> Duration {
            Duration::from_millis(10)
        }
        async fn work(&mut self, _shutdown: &ShutdownRx) -> Result<(), WorkError> {
            let n = self.passes.fetch_add(1, Ordering::SeqCst) + 1;
            match self.fail_at {
                Some(at) if n == at => Err(WorkError::Fatal("boom".into())),
                _ if n == 1 => Err(WorkError::Failed("first pass fails".into())),
                _ => Ok(()),
            }
        }
    }

    #[tokio::test]
    async fn recoverable_errors_keep_the_loop_running_until_shutdown() {
        let passes = Arc::new(AtomicU32::new(0));
        let health = HealthTracker::new(20);
        let (tx, rx) = shutdown_channel();

        let handle = tokio::spawn(run_periodic(
            Counter { passes: passes.clone(), fail_at: None },
            health.clone(),
            rx,
        ));
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();

        assert!(handle.await.unwrap().is_ok());
        assert!(passes.load(Ordering::SeqCst) >= 2);
        assert!(health.worker("counter").unwrap().ok);
    }

    #[tokio::test]
    async fn fatal_error_stops_the_loop() {
        let passes = Arc::new(AtomicU32::new(0));
        let (_tx, rx) = shutdown_channel();

        let result = run_periodic(
            Counter { passes: passes.clone(), fail_at: Some(3) },
            HealthTracker::new(20),
            rx,
        )
        .await;
        assert!(matches!(result, Err(WorkError::Fatal(_))));
        assert_eq!(passes.load(Ordering::SeqCst), 3);
    }
}
