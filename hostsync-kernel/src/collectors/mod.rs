/**
 * COLLECTEURS DE SOURCES - unités enfichables qui produisent des fiches hôtes
 *
 * RÔLE :
 * Un collecteur interroge un système externe (CMDB, fichier, script...) et
 * renvoie une liste de `Host`. Le moteur ne connaît que le trait
 * `SourceCollector` ; les implémentations sont résolues par nom de type
 * dans le `CollectorRegistry` au démarrage.
 *
 * COLLECTEURS FOURNIS :
 * - `file` : fichier YAML ou JSON contenant une liste d'hôtes
 * - `exec` : commande externe qui écrit une liste d'hôtes JSON sur stdout
 */

pub mod exec;
pub mod file;

pub use exec::ExecCollector;
pub use file::FileCollector;

use crate::config::SourceConfig;
use crate::models::Host;
use crate::units::{validate_params, ParamSpec, Params, UnitError};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

#[async_trait]
pub trait SourceCollector: Send + Sync {
    /// Nom de type référencé par `sources[].collector`
    fn kind(&self) -> &str;

    fn schema(&self) -> &[ParamSpec];

    async fn collect(&self, params: &Params) -> anyhow::Result<Vec<Host>>;
}

#[derive(Clone, Default)]
pub struct CollectorRegistry {
    collectors: BTreeMap<String, Arc<dyn SourceCollector>>,
}

impl CollectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registre avec les collecteurs `file` et `exec`
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(FileCollector));
        registry.register(Arc::new(ExecCollector));
        registry
    }

    pub fn register(&mut self, collector: Arc<dyn SourceCollector>) {
        self.collectors.insert(collector.kind().to_string(), collector);
    }

    pub fn kinds(&self) -> Vec<String> {
        self.collectors.keys().cloned().collect()
    }

    /// Trouve le collecteur d'une source et valide ses paramètres
    pub fn resolve(&self, source: &SourceConfig) -> Result<Arc<dyn SourceCollector>, UnitError> {
        let collector = self.collectors.get(&source.collector).ok_or_else(|| UnitError::UnknownKind {
            unit: source.name.clone(),
            kind: source.collector.clone(),
        })?;
        validate_params(&source.name, collector.schema(), &source.params)?;
        Ok(Arc::clone(collector))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_resolve_with_valid_params() {
        let registry = CollectorRegistry::with_builtins();
        assert_eq!(registry.kinds(), vec!["exec", "file"]);

        let mut source = SourceConfig::new("cmdb", "file");
        source.params.insert("path".into(), "/tmp/hosts.yaml".into());
        assert_eq!(registry.resolve(&source).unwrap().kind(), "file");
    }

    #[test]
    fn unknown_kind_and_bad_params_are_rejected() {
        let registry = CollectorRegistry::with_builtins();
        let source = SourceConfig::new("cmdb", "ldap");
        assert!(matches!(registry.resolve(&source), Err(UnitError::UnknownKind { .. })));

        let source = SourceConfig::new("cmdb", "exec");
        assert!(matches!(registry.resolve(&source), Err(UnitError::MissingParam { .. })));
    }
}
