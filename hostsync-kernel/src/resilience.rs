/**
 * RÉSILIENCE DES SOURCES - machine à états par source (circuit breaker)
 *
 * RÔLE :
 * Décide si une source doit être interrogée maintenant et comment réagir
 * à un échec de collecte. Aucune I/O : toutes les fonctions prennent `now`,
 * ce qui rend la logique testable sans horloge réelle.
 *
 * ÉTATS :
 * - Active   : collecte à chaque intervalle
 * - Backoff  : prochain essai retardé de base × facteur^échecs (plafonné)
 * - Disabled : trop d'erreurs dans la fenêtre, source coupée pour une durée fixe
 * - Fatal    : `exit_on_error`, le daemon doit s'arrêter
 *
 * POLITIQUES (une seule par source, dérivée de la config) :
 * - Backoff   : défaut
 * - Tolerance : `error_tolerance` > 0 et `error_duration_secs` > 0
 * - Fixed     : `disable_duration_secs` < 0 (ou tolérance avec durée 0),
 *               ni croissance du délai ni désactivation
 */

use crate::config::SourceConfig;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use time::{Duration, OffsetDateTime};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourcePhase {
    Active,
    Backoff,
    Disabled,
    Fatal,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FailurePolicy {
    Backoff { factor: f64, max_interval: Duration },
    Tolerance { window: Duration, threshold: u32, disable_for: Duration },
    Fixed,
}

impl FailurePolicy {
    pub fn from_config(config: &SourceConfig) -> Self {
        if config.disable_duration_secs < 0 {
            return FailurePolicy::Fixed;
        }
        if config.error_tolerance > 0 && config.error_duration_secs > 0 {
            if config.disable_duration_secs == 0 {
                return FailurePolicy::Fixed;
            }
            return FailurePolicy::Tolerance {
                window: Duration::seconds(config.error_duration_secs as i64),
                threshold: config.error_tolerance,
                disable_for: Duration::seconds(config.disable_duration_secs),
            };
        }
        FailurePolicy::Backoff {
            factor: config.backoff_factor,
            max_interval: Duration::seconds(config.max_backoff_secs as i64),
        }
    }
}

/// Fenêtre glissante d'horodatages d'erreurs
#[derive(Debug, Clone)]
pub struct ErrorWindow {
    window: Duration,
    events: VecDeque<OffsetDateTime>,
}

impl ErrorWindow {
    pub fn new(window: Duration) -> Self {
        Self { window, events: VecDeque::new() }
    }

    pub fn record(&mut self, at: OffsetDateTime) {
        self.events.push_back(at);
        self.prune(at);
    }

    /// Retire les erreurs plus anciennes que la fenêtre (bornes incluses)
    pub fn prune(&mut self, now: OffsetDateTime) {
        while let Some(&oldest) = self.events.front() {
            if now - oldest > self.window {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn count(&mut self, now: OffsetDateTime) -> usize {
        self.prune(now);
        self.events.len()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}

/// Résultat d'un échec enregistré
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureVerdict {
    Retry { at: OffsetDateTime },
    Disabled { until: OffsetDateTime },
    Fatal,
}

/// Délai avant l'essai suivant après `failures` échecs consécutifs
pub fn retry_delay(base: Duration, factor: f64, failures: u32, max: Duration) -> Duration {
    let exponent = i32::try_from(failures).unwrap_or(i32::MAX);
    let secs = base.as_seconds_f64() * factor.powi(exponent);
    if !secs.is_finite() || secs >= max.as_seconds_f64() {
        max
    } else {
        Duration::seconds_f64(secs)
    }
}

/// État de santé d'une source
#[derive(Debug, Clone)]
pub struct SourceHealth {
    name: String,
    policy: FailurePolicy,
    base_interval: Duration,
    exit_on_error: bool,
    phase: SourcePhase,
    consecutive_errors: u32,
    errors: ErrorWindow,
    next_run: OffsetDateTime,
    disabled_until: Option<OffsetDateTime>,
    last_success: Option<OffsetDateTime>,
    last_error: Option<String>,
}

impl SourceHealth {
    pub fn new(
        name: impl Into<String>,
        policy: FailurePolicy,
        base_interval: Duration,
        exit_on_error: bool,
        now: OffsetDateTime,
    ) -> Self {
        let window = match &policy {
            FailurePolicy::Tolerance { window, .. } => *window,
            _ => Duration::ZERO,
        };
        Self {
            name: name.into(),
            policy,
            base_interval,
            exit_on_error,
            phase: SourcePhase::Active,
            consecutive_errors: 0,
            errors: ErrorWindow::new(window),
            next_run: now,
            disabled_until: None,
            last_success: None,
            last_error: None,
        }
    }

    pub fn from_config(config: &SourceConfig, now: OffsetDateTime) -> Self {
        Self::new(
            config.name.clone(),
            FailurePolicy::from_config(config),
            config.update_interval(),
            config.exit_on_error,
            now,
        )
    }

    pub fn phase(&self) -> SourcePhase {
        self.phase
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    pub fn next_run(&self) -> OffsetDateTime {
        self.next_run
    }

    pub fn disabled_until(&self) -> Option<OffsetDateTime> {
        self.disabled_until
    }

    pub fn last_success(&self) -> Option<OffsetDateTime> {
        self.last_success
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Prochain instant où `should_run` peut répondre vrai (None si Fatal)
    pub fn wake_at(&self) -> Option<OffsetDateTime> {
        match self.phase {
            SourcePhase::Fatal => None,
            SourcePhase::Disabled => self.disabled_until,
            _ => Some(self.next_run),
        }
    }

    /// Vrai si la source doit être collectée maintenant. Réactive une source
    /// désactivée dont la période est écoulée.
    pub fn should_run(&mut self, now: OffsetDateTime) -> bool {
        match self.phase {
            SourcePhase::Fatal => false,
            SourcePhase::Disabled => match self.disabled_until {
                Some(until) if now >= until => {
                    info!(source = %self.name, "disable period elapsed, re-enabling source");
                    self.phase = SourcePhase::Active;
                    self.disabled_until = None;
                    self.consecutive_errors = 0;
                    self.errors.clear();
                    self.next_run = now;
                    true
                }
                _ => false,
            },
            SourcePhase::Active | SourcePhase::Backoff => now >= self.next_run,
        }
    }

    pub fn record_success(&mut self, now: OffsetDateTime) {
        if self.phase == SourcePhase::Backoff {
            info!(source = %self.name, "source recovered after {} failures", self.consecutive_errors);
        }
        self.phase = SourcePhase::Active;
        self.consecutive_errors = 0;
        self.errors.clear();
        self.last_success = Some(now);
        self.last_error = None;
        self.next_run = now + self.base_interval;
    }

    pub fn record_failure(&mut self, now: OffsetDateTime, error: impl Into<String>) -> FailureVerdict {
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        self.errors.record(now);
        self.last_error = Some(error.into());

        if self.exit_on_error {
            self.phase = SourcePhase::Fatal;
            return FailureVerdict::Fatal;
        }

        match self.policy.clone() {
            FailurePolicy::Backoff { factor, max_interval } => {
                let delay = retry_delay(self.base_interval, factor, self.consecutive_errors, max_interval);
                self.phase = SourcePhase::Backoff;
                self.next_run = now + delay;
                warn!(
                    source = %self.name,
                    failures = self.consecutive_errors,
                    "backing off for {}s",
                    delay.whole_seconds()
                );
                FailureVerdict::Retry { at: self.next_run }
            }
            FailurePolicy::Tolerance { threshold, disable_for, .. } => {
                let count = self.errors.count(now);
                if count >= threshold as usize {
                    let until = now + disable_for;
                    warn!(
                        source = %self.name,
                        errors = count,
                        "error tolerance reached, disabling source for {}s",
                        disable_for.whole_seconds()
                    );
                    self.phase = SourcePhase::Disabled;
                    self.disabled_until = Some(until);
                    self.errors.clear();
                    FailureVerdict::Disabled { until }
                } else {
                    self.phase = SourcePhase::Active;
                    self.next_run = now + self.base_interval;
                    FailureVerdict::Retry { at: self.next_run }
                }
            }
            FailurePolicy::Fixed => {
                self.phase = SourcePhase::Active;
                self.next_run = now + self.base_interval;
                FailureVerdict::Retry { at: self.next_run }
            }
        }
    }
}
