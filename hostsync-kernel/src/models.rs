/**
 * MODÈLE HÔTE - Fiche hôte canonique partagée par tout le pipeline
 *
 * RÔLE :
 * Une même structure `Host` circule des collecteurs jusqu'au moteur de
 * synchronisation : sortie brute d'une source, ligne stockée par source,
 * puis ligne fusionnée.
 *
 * FONCTIONNEMENT :
 * - Les ensembles (propriétés, tags...) sont des BTreeSet : ordre stable,
 *   sérialisation déterministe, comparaison d'égalité fiable
 * - `validate()` vérifie les invariants avant toute écriture en base
 * - Les tags sont des paires (clé, valeur)
 */

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

pub type Tag = (String, String);

/// Type d'interface "agent"
pub const INTERFACE_AGENT: u8 = 1;
/// Type d'interface SNMP (exige des `details`)
pub const INTERFACE_SNMP: u8 = 2;
pub const INTERFACE_IPMI: u8 = 3;
pub const INTERFACE_JMX: u8 = 4;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("hostname must not be empty")]
    EmptyHostname,
    #[error("{hostname}: duplicate interface type {kind}")]
    DuplicateInterface { hostname: String, kind: u8 },
    #[error("{hostname}: interface type {kind} is not a known interface type")]
    UnknownInterface { hostname: String, kind: u8 },
    #[error("{hostname}: SNMP interface requires details")]
    MissingSnmpDetails { hostname: String },
    #[error("{hostname}: interface endpoint must not be empty")]
    EmptyEndpoint { hostname: String },
}

/// Interface d'un hôte (endpoint = IP ou nom DNS)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    pub endpoint: String,
    pub port: String,
    #[serde(rename = "type")]
    pub kind: u8,
    /// Paramètres SNMP (version, community, bulk...)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, String>,
}

impl Interface {
    pub fn new(endpoint: impl Into<String>, port: impl Into<String>, kind: u8) -> Self {
        Self {
            endpoint: endpoint.into(),
            port: port.into(),
            kind,
            details: BTreeMap::new(),
        }
    }

    /// Vrai si l'endpoint est une adresse IP plutôt qu'un nom DNS
    pub fn use_ip(&self) -> bool {
        self.endpoint.parse::<IpAddr>().is_ok()
    }
}

fn default_enabled() -> bool {
    true
}

/// Fiche hôte telle que produite par une source puis fusionnée
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub hostname: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Plus petit = plus important
    #[serde(default)]
    pub importance: Option<u32>,
    #[serde(default)]
    pub interfaces: Vec<Interface>,
    #[serde(default)]
    pub inventory: BTreeMap<String, String>,
    #[serde(default)]
    pub properties: BTreeSet<String>,
    #[serde(default)]
    pub siteadmins: BTreeSet<String>,
    #[serde(default)]
    pub sources: BTreeSet<String>,
    #[serde(default)]
    pub tags: BTreeSet<Tag>,
}

impl Host {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            enabled: true,
            importance: None,
            interfaces: Vec::new(),
            inventory: BTreeMap::new(),
            properties: BTreeSet::new(),
            siteadmins: BTreeSet::new(),
            sources: BTreeSet::new(),
            tags: BTreeSet::new(),
        }
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        if self.hostname.trim().is_empty() {
            return Err(ModelError::EmptyHostname);
        }
        let mut seen = BTreeSet::new();
        for interface in &self.interfaces {
            if !(INTERFACE_AGENT..=INTERFACE_JMX).contains(&interface.kind) {
                return Err(ModelError::UnknownInterface {
                    hostname: self.hostname.clone(),
                    kind: interface.kind,
                });
            }
            if !seen.insert(interface.kind) {
                return Err(ModelError::DuplicateInterface {
                    hostname: self.hostname.clone(),
                    kind: interface.kind,
                });
            }
            if interface.endpoint.trim().is_empty() {
                return Err(ModelError::EmptyEndpoint { hostname: self.hostname.clone() });
            }
            if interface.kind == INTERFACE_SNMP && interface.details.is_empty() {
                return Err(ModelError::MissingSnmpDetails { hostname: self.hostname.clone() });
            }
        }
        Ok(())
    }

    pub fn interface(&self, kind: u8) -> Option<&Interface> {
        self.interfaces.iter().find(|i| i.kind == kind)
    }
}

/// Rapport failsafe : hôtes qui auraient été créés / retirés
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostActions {
    pub add: Vec<String>,
    pub remove: Vec<String>,
}

impl HostActions {
    pub fn len(&self) -> usize {
        self.add.len() + self.remove.len()
    }

    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty()
    }
}
