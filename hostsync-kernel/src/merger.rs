/**
 * MERGER - fusion des fiches par source en une fiche canonique par hôte
 *
 * RÈGLES DE FUSION (précédence = ordre de déclaration des sources,
 * la dernière déclarée l'emporte) :
 * - enabled      : OU logique
 * - properties, siteadmins, sources, tags : union
 * - importance   : plus petite valeur présente
 * - interfaces   : une par type, celle de la source la plus prioritaire
 * - inventory    : par clé, valeur de la source la plus prioritaire (conflit loggé)
 *
 * Les fiches sont triées par précédence avant la fusion : le résultat ne
 * dépend pas de l'ordre de lecture.
 *
 * PASSE DU WORKER :
 * lecture de tous les namespaces -> fusion -> chaîne de modificateurs -> commit.
 * Un hôte qu'aucune source ne rapporte disparaît de la table fusionnée ;
 * un hôte dont la chaîne échoue garde sa ligne précédente.
 */

use crate::models::Host;
use crate::modifiers::ModifierChain;
use crate::state::ShutdownRx;
use crate::store::{CommitStats, HostMap, HostStore, StoreError};
use crate::worker::{PeriodicWork, WorkError};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Fiche d'une source avec sa précédence (plus grand = prioritaire)
#[derive(Debug, Clone)]
pub struct RankedHost {
    pub precedence: usize,
    pub host: Host,
}

/// Fusionne les fiches d'un même hôte. `None` si la liste est vide.
pub fn merge_hosts(mut records: Vec<RankedHost>) -> Option<Host> {
    // Plus prioritaire en premier ; tri stable + départage par contenu
    records.sort_by(|a, b| {
        b.precedence
            .cmp(&a.precedence)
            .then_with(|| a.host.sources.cmp(&b.host.sources))
    });

    let mut iter = records.into_iter();
    let mut merged = iter.next()?.host;

    for RankedHost { host, .. } in iter {
        merged.enabled |= host.enabled;
        merged.properties.extend(host.properties);
        merged.siteadmins.extend(host.siteadmins);
        merged.sources.extend(host.sources);
        merged.tags.extend(host.tags);

        merged.importance = match (merged.importance, host.importance) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        for interface in host.interfaces {
            if merged.interface(interface.kind).is_some() {
                debug!(
                    "{}: interface type {} already provided by a higher-precedence source",
                    merged.hostname, interface.kind
                );
            } else {
                merged.interfaces.push(interface);
            }
        }

        for (key, value) in host.inventory {
            match merged.inventory.get(&key) {
                Some(existing) if existing != &value => warn!(
                    "{}: inventory '{key}' set by several sources, keeping '{existing}'",
                    merged.hostname
                ),
                Some(_) => {}
                None => {
                    merged.inventory.insert(key, value);
                }
            }
        }
    }

    merged.interfaces.sort_by_key(|i| i.kind);
    Some(merged)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub hosts: usize,
    pub modifier_failures: usize,
    pub stats: CommitStats,
}

pub struct Merger {
    /// Noms des sources dans l'ordre de configuration
    sources: Vec<String>,
    store: Arc<dyn HostStore>,
    chain: ModifierChain,
    interval: Duration,
}

impl Merger {
    pub fn new(
        sources: Vec<String>,
        store: Arc<dyn HostStore>,
        chain: ModifierChain,
        interval: Duration,
    ) -> Self {
        Self { sources, store, chain, interval }
    }

    async fn load_ranked(&self) -> Result<BTreeMap<String, Vec<RankedHost>>, StoreError> {
        let mut by_host: BTreeMap<String, Vec<RankedHost>> = BTreeMap::new();
        for (precedence, source) in self.sources.iter().enumerate() {
            let rows = match self.store.load_source(source).await {
                Ok(rows) => rows,
                Err(StoreError::UnknownSource(_)) => {
                    debug!("source '{source}' has no namespace yet");
                    continue;
                }
                Err(e) => return Err(e),
            };
            for (hostname, host) in rows {
                by_host.entry(hostname).or_default().push(RankedHost { precedence, host });
            }
        }
        Ok(by_host)
    }

    pub async fn merge_pass(&self) -> Result<MergeReport, WorkError> {
        let by_host = self.load_ranked().await?;

        let mut merged = HostMap::new();
        let mut keep = BTreeSet::new();
        let mut modifier_failures = 0;

        for (hostname, records) in by_host {
            let Some(host) = merge_hosts(records) else { continue };
            match self.chain.apply(host).await {
                Ok(host) => {
                    merged.insert(hostname, host);
                }
                Err(e) => {
                    warn!("{e}; keeping previous merged record");
                    modifier_failures += 1;
                    keep.insert(hostname);
                }
            }
        }

        let stats = self.store.commit_merged(&merged, &keep).await?;
        Ok(MergeReport { hosts: merged.len() + keep.len(), modifier_failures, stats })
    }
}

#[async_trait]
impl PeriodicWork for Merger {
    fn name(&self) -> &str {
        "merger"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn work(&mut self, _shutdown: &ShutdownRx) -> Result<(), WorkError> {
        let report = self.merge_pass().await?;
        info!(
            inserted = report.stats.inserted,
            updated = report.stats.updated,
            removed = report.stats.removed,
            modifier_failures = report.modifier_failures,
            "merged {} hosts",
            report.hosts
        );
        Ok(())
    }
}
