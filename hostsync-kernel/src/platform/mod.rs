/**
 * PLATFORM - accès à l'API de la plateforme de supervision
 *
 * RÔLE :
 * `PlatformApi` est la seule porte vers la plateforme : lectures (hôtes,
 * groupes, templates, maintenances) et écritures. Le moteur de
 * synchronisation et le GC ne connaissent que ce trait ; `ZabbixClient`
 * l'implémente en JSON-RPC, la devkit fournit une plateforme en mémoire.
 *
 * Les identifiants sont des chaînes opaques (ids de la plateforme).
 */

pub mod compat;
pub mod zabbix;

pub use compat::ApiVersion;
pub use zabbix::ZabbixClient;

use crate::models::{Interface, Tag, INTERFACE_SNMP};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error {code}: {message} {data}")]
    Rpc { code: i64, message: String, data: String },
    #[error("login failed: {0}")]
    Auth(String),
    #[error("unexpected API response: {0}")]
    Decode(String),
    #[error("API request timed out after {0}s")]
    Timeout(u64),
}

/// Nom -> id
pub type IdMap = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostStatus {
    Monitored,
    Unmonitored,
}

impl HostStatus {
    pub fn code(self) -> u8 {
        match self {
            HostStatus::Monitored => 0,
            HostStatus::Unmonitored => 1,
        }
    }

    pub fn from_code(code: u8) -> Self {
        if code == 0 {
            HostStatus::Monitored
        } else {
            HostStatus::Unmonitored
        }
    }
}

/// Mode d'inventaire "automatique"
pub const INVENTORY_MODE_AUTOMATIC: i8 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformInterface {
    pub id: String,
    pub endpoint: String,
    pub port: String,
    pub kind: u8,
    pub main: bool,
    pub use_ip: bool,
    pub details: BTreeMap<String, String>,
}

impl PlatformInterface {
    /// Vrai si l'interface de la plateforme correspond déjà à celle voulue.
    /// Les détails SNMP en plus côté plateforme sont ignorés.
    pub fn matches(&self, wanted: &Interface) -> bool {
        let same_endpoint = self.use_ip == wanted.use_ip()
            && self.endpoint == wanted.endpoint
            && self.port == wanted.port;
        let same_details = wanted.kind != INTERFACE_SNMP
            || wanted.details.iter().all(|(k, v)| self.details.get(k) == Some(v));
        same_endpoint && same_details
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformHost {
    pub id: String,
    pub name: String,
    pub status: HostStatus,
    pub groups: IdMap,
    pub templates: IdMap,
    pub interfaces: Vec<PlatformInterface>,
    pub tags: BTreeSet<Tag>,
    pub inventory_mode: i8,
    pub inventory: BTreeMap<String, String>,
}

impl PlatformHost {
    pub fn in_group(&self, name: &str) -> bool {
        self.groups.contains_key(name)
    }

    pub fn main_interface(&self, kind: u8) -> Option<&PlatformInterface> {
        self.interfaces.iter().find(|i| i.main && i.kind == kind)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Maintenance {
    pub id: String,
    pub name: String,
    pub host_ids: BTreeSet<String>,
    pub group_ids: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCreate {
    pub name: String,
    pub group_ids: Vec<String>,
    pub interfaces: Vec<Interface>,
    pub tags: BTreeSet<Tag>,
    pub inventory_mode: i8,
    pub inventory: BTreeMap<String, String>,
}

/// Modification partielle d'un hôte : seuls les champs `Some` sont envoyés
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostPatch {
    pub status: Option<HostStatus>,
    pub group_ids: Option<Vec<String>>,
    pub template_ids: Option<Vec<String>>,
    pub clear_template_ids: Option<Vec<String>>,
    pub tags: Option<BTreeSet<Tag>>,
    pub inventory_mode: Option<i8>,
    pub inventory: Option<BTreeMap<String, String>>,
}

#[async_trait]
pub trait PlatformApi: Send + Sync {
    async fn version(&self) -> Result<ApiVersion, ApiError>;

    /// Hôtes non découverts, tous statuts confondus
    async fn hosts(&self, inventory_fields: &[String]) -> Result<Vec<PlatformHost>, ApiError>;
    async fn hostgroups(&self) -> Result<IdMap, ApiError>;
    async fn templategroups(&self) -> Result<IdMap, ApiError>;
    async fn templates(&self) -> Result<IdMap, ApiError>;
    async fn maintenances(&self) -> Result<Vec<Maintenance>, ApiError>;

    /// Renvoie l'id du nouvel hôte
    async fn create_host(&self, host: &HostCreate) -> Result<String, ApiError>;
    async fn update_host(&self, host_id: &str, patch: &HostPatch) -> Result<(), ApiError>;
    /// Crée l'interface principale du type donné, ou met à jour `existing`
    async fn set_interface(
        &self,
        host_id: &str,
        interface: &Interface,
        existing: Option<&str>,
    ) -> Result<(), ApiError>;
    async fn create_hostgroup(&self, name: &str) -> Result<String, ApiError>;
    async fn create_templategroup(&self, name: &str) -> Result<String, ApiError>;
    async fn update_maintenance_hosts(
        &self,
        maintenance_id: &str,
        host_ids: &[String],
    ) -> Result<(), ApiError>;
    async fn delete_maintenance(&self, maintenance_id: &str) -> Result<(), ApiError>;
}

/// Vue de la plateforme au début d'une passe
#[derive(Debug, Clone)]
pub struct PlatformSnapshot {
    pub version: ApiVersion,
    pub hosts: BTreeMap<String, PlatformHost>,
    pub hostgroups: IdMap,
    /// Vide avant 6.2
    pub templategroups: IdMap,
    pub templates: IdMap,
    pub maintenances: Vec<Maintenance>,
}

impl PlatformSnapshot {
    pub async fn fetch(
        api: &dyn PlatformApi,
        inventory_fields: &[String],
        with_maintenances: bool,
    ) -> Result<Self, ApiError> {
        let version = api.version().await?;
        let hosts = api
            .hosts(inventory_fields)
            .await?
            .into_iter()
            .map(|h| (h.name.clone(), h))
            .collect();
        let templategroups = if version.supports_templategroups() {
            api.templategroups().await?
        } else {
            IdMap::new()
        };
        let maintenances = if with_maintenances {
            api.maintenances().await?
        } else {
            Vec::new()
        };
        Ok(Self {
            version,
            hosts,
            hostgroups: api.hostgroups().await?,
            templategroups,
            templates: api.templates().await?,
            maintenances,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snmp(endpoint: &str, port: &str) -> PlatformInterface {
        PlatformInterface {
            id: "7".into(),
            endpoint: endpoint.into(),
            port: port.into(),
            kind: INTERFACE_SNMP,
            main: true,
            use_ip: endpoint.parse::<std::net::IpAddr>().is_ok(),
            details: [("version".to_string(), "2".to_string()), ("bulk".to_string(), "1".to_string())]
                .into(),
        }
    }

    #[test]
    fn interface_match_ignores_extra_platform_details() {
        let mut wanted = Interface::new("10.0.0.5", "161", INTERFACE_SNMP);
        wanted.details.insert("version".into(), "2".into());
        assert!(snmp("10.0.0.5", "161").matches(&wanted));

        wanted.details.insert("community".into(), "{$SNMP_COMMUNITY}".into());
        assert!(!snmp("10.0.0.5", "161").matches(&wanted));
    }

    #[test]
    fn interface_match_compares_endpoint_kind() {
        let wanted = Interface::new("sw01.example.com", "161", INTERFACE_SNMP);
        assert!(!snmp("10.0.0.5", "161").matches(&wanted));
        assert!(snmp("sw01.example.com", "161").matches(&wanted));
        assert!(!snmp("sw01.example.com", "1161").matches(&wanted));
    }
}
