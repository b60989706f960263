/**
 * MODIFICATEURS D'HÔTES - transformations appliquées après la fusion
 *
 * RÔLE :
 * Chaque fiche fusionnée traverse la chaîne de modificateurs configurée,
 * dans l'ordre. Un modificateur reçoit une copie et renvoie la fiche modifiée.
 *
 * GARANTIES :
 * - Un modificateur ne peut pas changer le hostname
 * - La fiche renvoyée doit rester valide (`Host::validate`)
 * - En cas d'échec, la chaîne s'arrête et renvoie `ModifyError` ; le merger
 *   conserve alors la ligne fusionnée précédente de cet hôte
 * - Une fiche où seule une partie de la chaîne a été appliquée n'est jamais
 *   écrite dans la table fusionnée
 */

pub mod exec;
pub mod property_tags;

pub use exec::ExecModifier;
pub use property_tags::PropertyTagsModifier;

use crate::config::ModifierConfig;
use crate::models::{Host, ModelError};
use crate::units::{validate_params, ParamSpec, Params, UnitError};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum ModifyError {
    #[error("modifier '{modifier}' failed on host '{hostname}': {source}")]
    Failed {
        modifier: String,
        hostname: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("modifier '{modifier}' changed hostname '{hostname}' to '{renamed}'")]
    HostnameChanged { modifier: String, hostname: String, renamed: String },
    #[error("modifier '{modifier}' produced an invalid host: {source}")]
    Invalid {
        modifier: String,
        #[source]
        source: ModelError,
    },
}

#[async_trait]
pub trait HostModifier: Send + Sync {
    /// Nom de type référencé par `modifiers[].modifier`
    fn kind(&self) -> &str;

    fn schema(&self) -> &[ParamSpec];

    async fn modify(&self, host: Host, params: &Params) -> anyhow::Result<Host>;
}

#[derive(Clone, Default)]
pub struct ModifierRegistry {
    modifiers: BTreeMap<String, Arc<dyn HostModifier>>,
}

impl ModifierRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registre avec les modificateurs `property_tags` et `exec`
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(PropertyTagsModifier));
        registry.register(Arc::new(ExecModifier));
        registry
    }

    pub fn register(&mut self, modifier: Arc<dyn HostModifier>) {
        self.modifiers.insert(modifier.kind().to_string(), modifier);
    }

    /// Construit la chaîne ordonnée à partir de la configuration
    pub fn build_chain(&self, configs: &[ModifierConfig]) -> Result<ModifierChain, UnitError> {
        let mut links = Vec::with_capacity(configs.len());
        for config in configs {
            let modifier = self.modifiers.get(&config.modifier).ok_or_else(|| UnitError::UnknownKind {
                unit: config.name.clone(),
                kind: config.modifier.clone(),
            })?;
            validate_params(&config.name, modifier.schema(), &config.params)?;
            links.push(ChainLink {
                name: config.name.clone(),
                modifier: Arc::clone(modifier),
                params: config.params.clone(),
            });
        }
        Ok(ModifierChain { links })
    }
}

#[derive(Clone)]
struct ChainLink {
    name: String,
    modifier: Arc<dyn HostModifier>,
    params: Params,
}

#[derive(Clone, Default)]
pub struct ModifierChain {
    links: Vec<ChainLink>,
}

impl ModifierChain {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.links.iter().map(|l| l.name.as_str()).collect()
    }

    pub async fn apply(&self, host: Host) -> Result<Host, ModifyError> {
        let mut current = host;
        for link in &self.links {
            let hostname = current.hostname.clone();
            let modified = link
                .modifier
                .modify(current.clone(), &link.params)
                .await
                .map_err(|source| ModifyError::Failed {
                    modifier: link.name.clone(),
                    hostname: hostname.clone(),
                    source,
                })?;

            if modified.hostname != hostname {
                return Err(ModifyError::HostnameChanged {
                    modifier: link.name.clone(),
                    hostname,
                    renamed: modified.hostname,
                });
            }
            modified
                .validate()
                .map_err(|source| ModifyError::Invalid { modifier: link.name.clone(), source })?;
            current = modified;
        }
        Ok(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::ParamKind;

    struct Rename;

    #[async_trait]
    impl HostModifier for Rename {
        fn kind(&self) -> &str {
            "rename"
        }
        fn schema(&self) -> &[ParamSpec] {
            &[]
        }
        async fn modify(&self, mut host: Host, _params: &Params) -> anyhow::Result<Host> {
            host.hostname.push_str(".renamed");
            Ok(host)
        }
    }

    struct AddProperty;

    const ADD_SCHEMA: &[ParamSpec] = &[ParamSpec::required("property", ParamKind::String)];

    #[async_trait]
    impl HostModifier for AddProperty {
        fn kind(&self) -> &str {
            "add_property"
        }
        fn schema(&self) -> &[ParamSpec] {
            ADD_SCHEMA
        }
        async fn modify(&self, mut host: Host, params: &Params) -> anyhow::Result<Host> {
            let property = crate::units::param_str(params, "property").unwrap_or_default();
            host.properties.insert(property.to_string());
            Ok(host)
        }
    }

    fn config(name: &str, modifier: &str, params: serde_json::Value) -> ModifierConfig {
        ModifierConfig {
            name: name.into(),
            modifier: modifier.into(),
            params: serde_json::from_value(params).unwrap(),
        }
    }

    fn registry() -> ModifierRegistry {
        let mut registry = ModifierRegistry::new();
        registry.register(Arc::new(Rename));
        registry.register(Arc::new(AddProperty));
        registry
    }

    #[tokio::test]
    async fn chain_applies_in_order() {
        let chain = registry()
            .build_chain(&[
                config("first", "add_property", serde_json::json!({"property": "a"})),
                config("second", "add_property", serde_json::json!({"property": "b"})),
            ])
            .unwrap();
        assert_eq!(chain.names(), vec!["first", "second"]);

        let host = chain.apply(Host::new("web01")).await.unwrap();
        assert_eq!(host.properties.len(), 2);
    }

    #[tokio::test]
    async fn hostname_change_is_rejected() {
        let chain = registry().build_chain(&[config("r", "rename", serde_json::json!({}))]).unwrap();
        let err = chain.apply(Host::new("web01")).await.unwrap_err();
        assert!(matches!(err, ModifyError::HostnameChanged { .. }));
    }

    #[test]
    fn unknown_modifier_kind_is_rejected() {
        let result = registry().build_chain(&[config("x", "nope", serde_json::json!({}))]);
        assert!(matches!(result, Err(UnitError::UnknownKind { .. })));
    }
}
