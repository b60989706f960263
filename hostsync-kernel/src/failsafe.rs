/**
 * FAILSAFE - garde-fou contre les créations / retraits massifs
 *
 * RÈGLE :
 * Si le nombre d'hôtes à créer OU à retirer dépasse `max_changes`, la passe
 * est bloquée pour ces deux types d'actions (les mises à jour continuent).
 *
 * DÉBLOCAGE :
 * 1. Le rapport JSON `{"add": [...], "remove": [...]}` est écrit dans
 *    `report_file` à chaque blocage
 * 2. L'opérateur crée `ok_file` : à la passe suivante il est supprimé et
 *    UNE passe est autorisée
 * 3. Suppression impossible : mode strict = blocage, sinon la passe
 *    continue (nettoyage manuel à la charge de l'opérateur)
 *
 * Le plafond n'est jamais relevé automatiquement.
 */

use crate::config::FailsafeConfig;
use crate::models::HostActions;
use std::path::Path;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailsafeDecision {
    Proceed,
    /// Bloqué sans possibilité d'override (pas de fichier OK configuré,
    /// ou fichier OK non supprimable en mode strict)
    Blocked,
    /// Bloqué, en attente du fichier OK
    AwaitingOverride,
}

impl FailsafeDecision {
    pub fn allows_changes(self) -> bool {
        self == FailsafeDecision::Proceed
    }
}

#[derive(Debug, Clone)]
pub struct FailsafeGuard {
    config: FailsafeConfig,
}

impl FailsafeGuard {
    pub fn new(config: FailsafeConfig) -> Self {
        Self { config }
    }

    pub fn ceiling(&self) -> usize {
        self.config.max_changes
    }

    pub fn exceeds(&self, to_add: usize, to_remove: usize) -> bool {
        to_add > self.config.max_changes || to_remove > self.config.max_changes
    }

    pub async fn check(&self, to_add: &[String], to_remove: &[String]) -> FailsafeDecision {
        if !self.exceeds(to_add.len(), to_remove.len()) {
            return FailsafeDecision::Proceed;
        }
        error!(
            "Too many hosts to change (failsafe={}). Remove: {}, Add: {}. Aborting",
            self.config.max_changes,
            to_remove.len(),
            to_add.len()
        );

        self.write_report(&HostActions { add: to_add.to_vec(), remove: to_remove.to_vec() })
            .await;
        self.consume_ok_file().await
    }

    async fn write_report(&self, actions: &HostActions) {
        let Some(path) = &self.config.report_file else {
            warn!("Unable to write failsafe hosts. No failsafe report file configured.");
            return;
        };
        let written = match serde_json::to_vec_pretty(actions) {
            Ok(payload) => tokio::fs::write(path, payload).await,
            Err(e) => Err(e.into()),
        };
        match written {
            Ok(()) => info!("Wrote list of hosts to add and remove to {}", path.display()),
            Err(e) => error!("Unable to write failsafe report {}: {e}", path.display()),
        }
    }

    async fn consume_ok_file(&self) -> FailsafeDecision {
        let Some(path) = &self.config.ok_file else {
            return FailsafeDecision::Blocked;
        };
        if !exists(path).await {
            info!(
                "Failsafe OK file {} does not exist. Create it to approve changes.",
                path.display()
            );
            return FailsafeDecision::AwaitingOverride;
        }
        if let Err(e) = tokio::fs::remove_file(path).await {
            error!("Unable to delete failsafe OK file {}: {e}", path.display());
            if self.config.ok_file_strict {
                return FailsafeDecision::Blocked;
            }
            warn!("Continuing with changes despite failed deletion.");
        }
        info!("Failsafe OK file exists. Proceeding with changes.");
        FailsafeDecision::Proceed
    }
}

async fn exists(path: &Path) -> bool {
    tokio::fs::metadata(path).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn names(prefix: &str, n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{prefix}{i:02}.example.com")).collect()
    }

    fn guard(dir: &TempDir, strict: bool) -> FailsafeGuard {
        FailsafeGuard::new(FailsafeConfig {
            max_changes: 20,
            report_file: Some(dir.path().join("failsafe.json")),
            ok_file: Some(dir.path().join("failsafe_ok")),
            ok_file_strict: strict,
        })
    }

    #[tokio::test]
    async fn under_ceiling_proceeds_without_report() {
        let dir = tempfile::tempdir().unwrap();
        let guard = guard(&dir, true);
        assert_eq!(guard.check(&names("a", 20), &names("r", 20)).await, FailsafeDecision::Proceed);
        assert!(!dir.path().join("failsafe.json").exists());
    }

    #[tokio::test]
    async fn over_ceiling_writes_full_report_and_waits() {
        let dir = tempfile::tempdir().unwrap();
        let guard = guard(&dir, true);
        let remove = names("r", 25);

        assert_eq!(guard.check(&[], &remove).await, FailsafeDecision::AwaitingOverride);

        let report: HostActions =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join("failsafe.json")).unwrap())
                .unwrap();
        assert_eq!(report.remove, remove);
        assert!(report.add.is_empty());
    }

    #[tokio::test]
    async fn ok_file_allows_exactly_one_pass() {
        let dir = tempfile::tempdir().unwrap();
        let guard = guard(&dir, true);
        let ok = dir.path().join("failsafe_ok");
        std::fs::write(&ok, "").unwrap();

        assert_eq!(guard.check(&names("a", 21), &[]).await, FailsafeDecision::Proceed);
        assert!(!ok.exists());
        assert_eq!(guard.check(&names("a", 21), &[]).await, FailsafeDecision::AwaitingOverride);
    }

    #[tokio::test]
    async fn undeletable_ok_file_blocks_in_strict_mode() {
        let dir = tempfile::tempdir().unwrap();
        // Un répertoire ne peut pas être supprimé par remove_file
        std::fs::create_dir(dir.path().join("failsafe_ok")).unwrap();

        assert_eq!(
            guard(&dir, true).check(&names("a", 30), &[]).await,
            FailsafeDecision::Blocked
        );
        assert_eq!(
            guard(&dir, false).check(&names("a", 30), &[]).await,
            FailsafeDecision::Proceed
        );
    }

    #[tokio::test]
    async fn no_ok_file_configured_is_a_hard_block() {
        let guard = FailsafeGuard::new(FailsafeConfig { max_changes: 1, ..FailsafeConfig::default() });
        assert_eq!(guard.check(&names("a", 2), &[]).await, FailsafeDecision::Blocked);
    }
}
