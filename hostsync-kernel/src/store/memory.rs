//! Backend mémoire du HostStore (`memory:`), utilisé par les tests et le devkit.

use super::{diff_rows, CommitStats, HostMap, HostStore, StoreError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Default)]
pub struct MemoryStore {
    sources: Mutex<BTreeMap<String, HostMap>>,
    merged: Mutex<HostMap>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn replace(table: &mut HostMap, hosts: &HostMap, keep: &BTreeSet<String>) -> CommitStats {
        let diff = diff_rows(table, hosts, keep);
        let stats = diff.stats();
        for hostname in &diff.removals {
            table.remove(hostname);
        }
        for host in diff.inserts.iter().chain(diff.updates.iter()) {
            table.insert(host.hostname.clone(), (*host).clone());
        }
        stats
    }
}

#[async_trait]
impl HostStore for MemoryStore {
    async fn ensure_source(&self, source: &str) -> Result<(), StoreError> {
        self.sources.lock().entry(source.to_string()).or_default();
        Ok(())
    }

    async fn load_source(&self, source: &str) -> Result<HostMap, StoreError> {
        self.sources
            .lock()
            .get(source)
            .cloned()
            .ok_or_else(|| StoreError::UnknownSource(source.to_string()))
    }

    async fn commit_source(&self, source: &str, hosts: &HostMap) -> Result<CommitStats, StoreError> {
        let mut sources = self.sources.lock();
        let table = sources
            .get_mut(source)
            .ok_or_else(|| StoreError::UnknownSource(source.to_string()))?;
        Ok(Self::replace(table, hosts, &BTreeSet::new()))
    }

    async fn load_merged(&self) -> Result<HostMap, StoreError> {
        Ok(self.merged.lock().clone())
    }

    async fn commit_merged(
        &self,
        hosts: &HostMap,
        keep: &BTreeSet<String>,
    ) -> Result<CommitStats, StoreError> {
        Ok(Self::replace(&mut self.merged.lock(), hosts, keep))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Host;

    fn map(names: &[&str]) -> HostMap {
        names.iter().map(|n| (n.to_string(), Host::new(*n))).collect()
    }

    #[tokio::test]
    async fn commit_replaces_namespace_content() {
        let store = MemoryStore::new();
        store.ensure_source("cmdb").await.unwrap();

        let stats = store.commit_source("cmdb", &map(&["a", "b"])).await.unwrap();
        assert_eq!(stats.inserted, 2);

        let stats = store.commit_source("cmdb", &map(&["b", "c"])).await.unwrap();
        assert_eq!((stats.inserted, stats.removed, stats.unchanged), (1, 1, 1));

        let rows = store.load_source("cmdb").await.unwrap();
        assert_eq!(rows.keys().cloned().collect::<Vec<_>>(), vec!["b", "c"]);
    }

    #[tokio::test]
    async fn unknown_namespace_is_an_error() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.load_source("nope").await,
            Err(StoreError::UnknownSource(_))
        ));
    }
}
