/**
 * HOST STORE - persistence des fiches par source et de la table fusionnée
 *
 * RÔLE :
 * Un namespace par source (`hosts_source_<nom>`) + une table fusionnée.
 * Chaque ligne = hostname (clé) + fiche JSON complète.
 *
 * FONCTIONNEMENT :
 * - `commit_source` / `commit_merged` remplacent atomiquement le contenu
 *   d'un namespace : suppression des absents, insertion des nouveaux,
 *   mise à jour uniquement si la fiche a changé
 * - Chaque commit renvoie des `CommitStats` (loggées par l'appelant)
 * - Backends : SQLite (production) et mémoire (tests, `memory:`)
 */

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::config::StoreConfig;
use crate::models::Host;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

pub type HostMap = BTreeMap<String, Host>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("store operation timed out after {0}s")]
    Timeout(u64),
    #[error("unknown source namespace: {0}")]
    UnknownSource(String),
    #[error("unsupported store url: {0}")]
    UnsupportedUrl(String),
}

/// Compteurs d'un commit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CommitStats {
    pub inserted: usize,
    pub updated: usize,
    pub removed: usize,
    pub unchanged: usize,
}

impl CommitStats {
    pub fn changed(&self) -> bool {
        self.inserted + self.updated + self.removed > 0
    }
}

#[async_trait]
pub trait HostStore: Send + Sync {
    /// Crée le namespace de la source s'il n'existe pas
    async fn ensure_source(&self, source: &str) -> Result<(), StoreError>;

    async fn load_source(&self, source: &str) -> Result<HostMap, StoreError>;

    /// Remplace le contenu du namespace `source` par `hosts`
    async fn commit_source(&self, source: &str, hosts: &HostMap) -> Result<CommitStats, StoreError>;

    async fn load_merged(&self) -> Result<HostMap, StoreError>;

    /// Remplace la table fusionnée par `hosts`, sauf les hostnames de `keep`
    /// dont la ligne existante (ou son absence) est laissée telle quelle
    async fn commit_merged(
        &self,
        hosts: &HostMap,
        keep: &BTreeSet<String>,
    ) -> Result<CommitStats, StoreError>;
}

/// Différence entre le contenu actuel d'un namespace et le contenu voulu
#[derive(Debug, Default)]
pub(crate) struct RowDiff<'a> {
    pub inserts: Vec<&'a Host>,
    pub updates: Vec<&'a Host>,
    pub removals: Vec<String>,
    pub unchanged: usize,
}

impl RowDiff<'_> {
    pub fn stats(&self) -> CommitStats {
        CommitStats {
            inserted: self.inserts.len(),
            updated: self.updates.len(),
            removed: self.removals.len(),
            unchanged: self.unchanged,
        }
    }
}

pub(crate) fn diff_rows<'a>(
    current: &HostMap,
    desired: &'a HostMap,
    keep: &BTreeSet<String>,
) -> RowDiff<'a> {
    let mut diff = RowDiff::default();

    for hostname in current.keys() {
        if !desired.contains_key(hostname) && !keep.contains(hostname) {
            diff.removals.push(hostname.clone());
        }
    }
    for (hostname, host) in desired {
        if keep.contains(hostname) {
            continue;
        }
        match current.get(hostname) {
            None => diff.inserts.push(host),
            Some(existing) if existing != host => diff.updates.push(host),
            Some(_) => diff.unchanged += 1,
        }
    }
    diff
}

/// Ouvre le backend désigné par `config.url`
pub async fn open_store(config: &StoreConfig) -> Result<Arc<dyn HostStore>, StoreError> {
    if config.url == "memory:" {
        return Ok(Arc::new(MemoryStore::new()));
    }
    if config.url.starts_with("sqlite:") {
        return Ok(Arc::new(SqliteStore::connect(config).await?));
    }
    Err(StoreError::UnsupportedUrl(config.url.clone()))
}
