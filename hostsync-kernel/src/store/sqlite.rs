//! Backend SQLite du HostStore.
//!
//! Une table par source + la table fusionnée, toutes de la forme
//! `(hostname TEXT PRIMARY KEY, data TEXT NOT NULL)` avec la fiche en JSON.
//! Les noms de sources sont validés à la configuration (`[A-Za-z0-9_]`),
//! ce qui permet de les interpoler dans les requêtes.

use super::{diff_rows, CommitStats, HostMap, HostStore, StoreError};
use crate::config::StoreConfig;
use crate::models::Host;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Row, SqliteConnection};
use std::collections::BTreeSet;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

pub struct SqliteStore {
    pool: SqlitePool,
    source_prefix: String,
    hosts_table: String,
    timeout_secs: u64,
}

impl SqliteStore {
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(&config.url)?.create_if_missing(true);
        // Une seule connexion : `sqlite::memory:` donne une base par connexion
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            // Au-delà de la borne par requête : c'est `bounded` qui coupe en premier
            .acquire_timeout(Duration::from_secs(config.timeout_secs.max(1) * 2))
            .connect_with(options)
            .await?;

        let store = Self {
            pool,
            source_prefix: config.source_table_prefix.clone(),
            hosts_table: config.hosts_table.clone(),
            timeout_secs: config.timeout_secs,
        };
        store.create_table(&store.hosts_table).await?;
        debug!(url = %config.url, "sqlite store ready");
        Ok(store)
    }

    fn source_table(&self, source: &str) -> String {
        format!("{}{}", self.source_prefix, source)
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        if self.timeout_secs == 0 {
            return fut.await;
        }
        tokio::time::timeout(Duration::from_secs(self.timeout_secs), fut)
            .await
            .map_err(|_| StoreError::Timeout(self.timeout_secs))?
    }

    async fn create_table(&self, table: &str) -> Result<(), StoreError> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS \"{table}\" (hostname TEXT PRIMARY KEY NOT NULL, data TEXT NOT NULL)"
        );
        self.bounded(async {
            sqlx::query(&sql).execute(&self.pool).await?;
            Ok::<_, StoreError>(())
        })
        .await
    }

    async fn table_exists(&self, table: &str) -> Result<bool, StoreError> {
        self.bounded(async {
            let count: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?")
                    .bind(table)
                    .fetch_one(&self.pool)
                    .await?;
            Ok::<_, StoreError>(count > 0)
        })
        .await
    }

    async fn load_table(conn: &mut SqliteConnection, table: &str) -> Result<HostMap, StoreError> {
        let rows = sqlx::query(&format!("SELECT hostname, data FROM \"{table}\""))
            .fetch_all(conn)
            .await?;

        let mut hosts = HostMap::new();
        for row in rows {
            let hostname: String = row.try_get("hostname")?;
            let data: String = row.try_get("data")?;
            match serde_json::from_str::<Host>(&data) {
                Ok(host) => {
                    hosts.insert(hostname, host);
                }
                Err(e) => warn!(table, hostname = %hostname, "skipping unreadable row: {e}"),
            }
        }
        Ok(hosts)
    }

    async fn replace_table(
        &self,
        table: &str,
        hosts: &HostMap,
        keep: &BTreeSet<String>,
    ) -> Result<CommitStats, StoreError> {
        self.bounded(async {
            let mut tx = self.pool.begin().await?;
            let current = Self::load_table(&mut *tx, table).await?;
            let diff = diff_rows(&current, hosts, keep);

            for hostname in &diff.removals {
                sqlx::query(&format!("DELETE FROM \"{table}\" WHERE hostname = ?"))
                    .bind(hostname)
                    .execute(&mut *tx)
                    .await?;
            }
            for host in &diff.inserts {
                sqlx::query(&format!("INSERT INTO \"{table}\" (hostname, data) VALUES (?, ?)"))
                    .bind(&host.hostname)
                    .bind(serde_json::to_string(host)?)
                    .execute(&mut *tx)
                    .await?;
            }
            for host in &diff.updates {
                sqlx::query(&format!("UPDATE \"{table}\" SET data = ? WHERE hostname = ?"))
                    .bind(serde_json::to_string(host)?)
                    .bind(&host.hostname)
                    .execute(&mut *tx)
                    .await?;
            }

            tx.commit().await?;
            Ok::<_, StoreError>(diff.stats())
        })
        .await
    }

    async fn read_table(&self, table: &str) -> Result<HostMap, StoreError> {
        self.bounded(async {
            let mut conn = self.pool.acquire().await?;
            Self::load_table(&mut *conn, table).await
        })
        .await
    }
}

#[async_trait]
impl HostStore for SqliteStore {
    async fn ensure_source(&self, source: &str) -> Result<(), StoreError> {
        self.create_table(&self.source_table(source)).await
    }

    async fn load_source(&self, source: &str) -> Result<HostMap, StoreError> {
        let table = self.source_table(source);
        if !self.table_exists(&table).await? {
            return Err(StoreError::UnknownSource(source.to_string()));
        }
        self.read_table(&table).await
    }

    async fn commit_source(&self, source: &str, hosts: &HostMap) -> Result<CommitStats, StoreError> {
        self.replace_table(&self.source_table(source), hosts, &BTreeSet::new()).await
    }

    async fn load_merged(&self) -> Result<HostMap, StoreError> {
        self.read_table(&self.hosts_table).await
    }

    async fn commit_merged(
        &self,
        hosts: &HostMap,
        keep: &BTreeSet<String>,
    ) -> Result<CommitStats, StoreError> {
        self.replace_table(&self.hosts_table, hosts, keep).await
    }
}
