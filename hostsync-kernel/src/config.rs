/**
 * CONFIGURATION - fichier YAML unique + overrides d'environnement
 *
 * CHARGEMENT :
 * - `.env` chargé via dotenvy au démarrage (main)
 * - Chemin du fichier : $HOSTSYNC_CONFIG, sinon `hostsync.yaml`
 * - $HOSTSYNC_PLATFORM_PASSWORD remplace `platform.password`
 * - Toute erreur (fichier illisible, YAML invalide, validation) est fatale :
 *   le daemon ne démarre pas avec une configuration partielle
 */

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use time::Duration;

pub const CONFIG_ENV: &str = "HOSTSYNC_CONFIG";
pub const PASSWORD_ENV: &str = "HOSTSYNC_PLATFORM_PASSWORD";
pub const DEFAULT_CONFIG_PATH: &str = "hostsync.yaml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Fichier health réécrit périodiquement (désactivé si absent)
    #[serde(default)]
    pub health_file: Option<PathBuf>,
    /// Endpoint HTTP /health (désactivé si absent)
    #[serde(default)]
    pub http: Option<HttpConfig>,
    /// Délai accordé aux workers pour finir leur passe à l'arrêt
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
    #[serde(default)]
    pub store: StoreConfig,
    pub platform: PlatformConfig,
    #[serde(default)]
    pub failsafe: FailsafeConfig,
    #[serde(default)]
    pub merger: MergerConfig,
    #[serde(default)]
    pub gc: GcConfig,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub modifiers: Vec<ModifierConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpConfig {
    /// ex: "127.0.0.1:8090"
    pub listen: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// `sqlite://chemin.db` ou `memory:`
    #[serde(default = "default_store_url")]
    pub url: String,
    #[serde(default = "default_source_table_prefix")]
    pub source_table_prefix: String,
    #[serde(default = "default_hosts_table")]
    pub hosts_table: String,
    #[serde(default = "default_store_timeout")]
    pub timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            source_table_prefix: default_source_table_prefix(),
            hosts_table: default_hosts_table(),
            timeout_secs: default_store_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlatformConfig {
    pub url: String,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub dryrun: bool,
    /// 0 = pas de timeout
    #[serde(default = "default_platform_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_true")]
    pub verify_ssl: bool,
    #[serde(default = "default_map_dir")]
    pub map_dir: PathBuf,
    #[serde(default = "default_tags_prefix")]
    pub tags_prefix: String,
    #[serde(default)]
    pub managed_inventory: Vec<String>,
    #[serde(default = "default_hostgroup_all")]
    pub hostgroup_all: String,
    #[serde(default = "default_hostgroup_manual")]
    pub hostgroup_manual: String,
    #[serde(default = "default_hostgroup_disabled")]
    pub hostgroup_disabled: String,
    #[serde(default = "default_hostgroup_source_prefix")]
    pub hostgroup_source_prefix: String,
    #[serde(default = "default_hostgroup_importance_prefix")]
    pub hostgroup_importance_prefix: String,
    #[serde(default)]
    pub extra_siteadmin_hostgroup_prefixes: BTreeSet<String>,
    #[serde(default)]
    pub create_templategroups: bool,
    #[serde(default = "default_templategroup_prefix")]
    pub templategroup_prefix: String,
    #[serde(default = "default_update_interval")]
    pub update_interval_secs: u64,
}

impl PlatformConfig {
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: default_username(),
            password: String::new(),
            dryrun: false,
            timeout_secs: default_platform_timeout(),
            verify_ssl: true,
            map_dir: default_map_dir(),
            tags_prefix: default_tags_prefix(),
            managed_inventory: Vec::new(),
            hostgroup_all: default_hostgroup_all(),
            hostgroup_manual: default_hostgroup_manual(),
            hostgroup_disabled: default_hostgroup_disabled(),
            hostgroup_source_prefix: default_hostgroup_source_prefix(),
            hostgroup_importance_prefix: default_hostgroup_importance_prefix(),
            extra_siteadmin_hostgroup_prefixes: BTreeSet::new(),
            create_templategroups: false,
            templategroup_prefix: default_templategroup_prefix(),
            update_interval_secs: default_update_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FailsafeConfig {
    /// Nombre maximal de créations (ou de retraits) par passe
    #[serde(default = "default_failsafe")]
    pub max_changes: usize,
    #[serde(default)]
    pub report_file: Option<PathBuf>,
    #[serde(default)]
    pub ok_file: Option<PathBuf>,
    /// Si le fichier OK ne peut pas être supprimé : true = refuser la passe
    #[serde(default = "default_true")]
    pub ok_file_strict: bool,
}

impl Default for FailsafeConfig {
    fn default() -> Self {
        Self {
            max_changes: default_failsafe(),
            report_file: None,
            ok_file: None,
            ok_file_strict: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MergerConfig {
    #[serde(default = "default_update_interval")]
    pub update_interval_secs: u64,
}

impl Default for MergerConfig {
    fn default() -> Self {
        Self { update_interval_secs: default_update_interval() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GcConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_gc_interval")]
    pub interval_secs: u64,
    /// Supprime les maintenances qui se retrouvent vides
    #[serde(default)]
    pub delete_empty_maintenance: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: default_gc_interval(),
            delete_empty_maintenance: false,
        }
    }
}

/// Comportement quand une source renvoie zéro hôte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EmptyResultPolicy {
    /// Résultat vide ignoré, les lignes précédentes sont conservées
    #[default]
    Keep,
    /// Résultat vide = la source ne fournit plus aucun hôte
    Replace,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    pub name: String,
    /// Type de collecteur enregistré dans le CollectorRegistry (`file`, `exec`...)
    pub collector: String,
    #[serde(default = "default_update_interval")]
    pub update_interval_secs: u64,
    #[serde(default = "default_collect_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
    #[serde(default)]
    pub error_tolerance: u32,
    #[serde(default)]
    pub error_duration_secs: u64,
    /// < 0 : ni backoff ni désactivation
    #[serde(default = "default_disable_duration")]
    pub disable_duration_secs: i64,
    #[serde(default)]
    pub exit_on_error: bool,
    #[serde(default)]
    pub on_empty: EmptyResultPolicy,
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
}

impl SourceConfig {
    pub fn new(name: impl Into<String>, collector: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            collector: collector.into(),
            update_interval_secs: default_update_interval(),
            timeout_secs: default_collect_timeout(),
            backoff_factor: default_backoff_factor(),
            max_backoff_secs: default_max_backoff(),
            error_tolerance: 0,
            error_duration_secs: 0,
            disable_duration_secs: default_disable_duration(),
            exit_on_error: false,
            on_empty: EmptyResultPolicy::Keep,
            params: BTreeMap::new(),
        }
    }

    pub fn update_interval(&self) -> Duration {
        Duration::seconds(self.update_interval_secs as i64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModifierConfig {
    pub name: String,
    /// Type de modificateur enregistré dans le ModifierRegistry
    pub modifier: String,
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
}

impl Config {
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        Self::from_yaml_str(&text)
    }

    /// Vérifie les contraintes qui ne s'expriment pas dans les types
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.platform.url.trim().is_empty() {
            return invalid("platform.url must not be empty".into());
        }
        if self.platform.update_interval_secs == 0 || self.merger.update_interval_secs == 0 {
            return invalid("update intervals must be greater than zero".into());
        }
        if self.gc.enabled && self.gc.interval_secs == 0 {
            return invalid("gc.interval_secs must be greater than zero".into());
        }
        for group in [
            &self.platform.hostgroup_all,
            &self.platform.hostgroup_manual,
            &self.platform.hostgroup_disabled,
        ] {
            if group.trim().is_empty() {
                return invalid("host group names must not be empty".into());
            }
        }
        if let Some(http) = &self.http {
            if http.listen.parse::<std::net::SocketAddr>().is_err() {
                return invalid(format!("http.listen '{}' is not a socket address", http.listen));
            }
        }
        for prefix in [
            &self.platform.hostgroup_source_prefix,
            &self.platform.hostgroup_importance_prefix,
            &self.platform.templategroup_prefix,
        ] {
            if prefix.is_empty() {
                return invalid("group prefixes must not be empty".into());
            }
        }
        for prefix in &self.platform.extra_siteadmin_hostgroup_prefixes {
            if !prefix.ends_with('-') {
                return invalid(format!(
                    "extra siteadmin hostgroup prefix '{prefix}' must end with '-'"
                ));
            }
        }

        let mut names = BTreeSet::new();
        for source in &self.sources {
            if source.name.is_empty()
                || !source.name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
            {
                return invalid(format!(
                    "source name '{}' must be non-empty and contain only [A-Za-z0-9_]",
                    source.name
                ));
            }
            if !names.insert(source.name.as_str()) {
                return invalid(format!("duplicate source name '{}'", source.name));
            }
            if source.update_interval_secs == 0 || source.timeout_secs == 0 {
                return invalid(format!(
                    "source '{}': update_interval_secs and timeout_secs must be > 0",
                    source.name
                ));
            }
            if !source.backoff_factor.is_finite() || source.backoff_factor < 1.0 {
                return invalid(format!("source '{}': backoff_factor must be >= 1", source.name));
            }
            if source.max_backoff_secs < source.update_interval_secs {
                return invalid(format!(
                    "source '{}': max_backoff_secs must be >= update_interval_secs",
                    source.name
                ));
            }
        }

        let mut modifier_names = BTreeSet::new();
        for modifier in &self.modifiers {
            if !modifier_names.insert(modifier.name.as_str()) {
                return invalid(format!("duplicate modifier name '{}'", modifier.name));
            }
        }
        Ok(())
    }

    pub fn source_names(&self) -> Vec<String> {
        self.sources.iter().map(|s| s.name.clone()).collect()
    }
}

/// Charge la configuration depuis $HOSTSYNC_CONFIG (ou `hostsync.yaml`)
pub fn load_config() -> Result<Config, ConfigError> {
    let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
    let mut config = Config::from_path(Path::new(&path))?;
    if let Ok(password) = std::env::var(PASSWORD_ENV) {
        config.platform.password = password;
    }
    Ok(config)
}

fn default_log_level() -> String {
    "info".into()
}

fn default_shutdown_grace() -> u64 {
    30
}

fn default_store_url() -> String {
    "sqlite://hostsync.db".into()
}

fn default_source_table_prefix() -> String {
    "hosts_source_".into()
}

fn default_hosts_table() -> String {
    "hosts".into()
}

fn default_store_timeout() -> u64 {
    30
}

fn default_username() -> String {
    "Admin".into()
}

fn default_platform_timeout() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

fn default_map_dir() -> PathBuf {
    PathBuf::from("maps")
}

fn default_tags_prefix() -> String {
    "zac_".into()
}

fn default_hostgroup_all() -> String {
    "All-hosts".into()
}

fn default_hostgroup_manual() -> String {
    "All-manual-hosts".into()
}

fn default_hostgroup_disabled() -> String {
    "All-auto-disabled-hosts".into()
}

fn default_hostgroup_source_prefix() -> String {
    "Source-".into()
}

fn default_hostgroup_importance_prefix() -> String {
    "Importance-".into()
}

fn default_templategroup_prefix() -> String {
    "Templates-".into()
}

fn default_update_interval() -> u64 {
    60
}

fn default_failsafe() -> usize {
    20
}

fn default_gc_interval() -> u64 {
    86400
}

fn default_collect_timeout() -> u64 {
    60
}

fn default_backoff_factor() -> f64 {
    1.5
}

fn default_max_backoff() -> u64 {
    3600
}

fn default_disable_duration() -> i64 {
    3600
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
platform:
  url: https://zabbix.example.com
sources:
  - name: cmdb
    collector: file
    params:
      path: /var/lib/hostsync/cmdb.yaml
"#;

    #[test]
    fn minimal_config_gets_defaults() {
        let config = Config::from_yaml_str(MINIMAL).unwrap();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.shutdown_grace_secs, 30);
        assert_eq!(config.store.timeout_secs, 30);
        assert_eq!(config.platform.hostgroup_disabled, "All-auto-disabled-hosts");
        assert_eq!(config.failsafe.max_changes, 20);
        assert_eq!(config.platform.tags_prefix, "zac_");
        assert_eq!(config.store.source_table_prefix, "hosts_source_");
        assert!(!config.platform.dryrun);
        assert!(!config.gc.enabled);

        let source = &config.sources[0];
        assert_eq!(source.update_interval_secs, 60);
        assert_eq!(source.backoff_factor, 1.5);
        assert_eq!(source.disable_duration_secs, 3600);
        assert_eq!(source.on_empty, EmptyResultPolicy::Keep);
        assert_eq!(source.params["path"], Value::String("/var/lib/hostsync/cmdb.yaml".into()));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let text = format!("{MINIMAL}\nbogus: 1\n");
        assert!(matches!(Config::from_yaml_str(&text), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn duplicate_source_names_are_invalid() {
        let text = r#"
platform:
  url: https://zabbix.example.com
sources:
  - { name: cmdb, collector: file }
  - { name: cmdb, collector: exec }
"#;
        assert!(matches!(Config::from_yaml_str(text), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn source_names_must_be_table_safe() {
        let text = r#"
platform:
  url: https://zabbix.example.com
sources:
  - { name: "cmdb; drop", collector: file }
"#;
        assert!(matches!(Config::from_yaml_str(text), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn backoff_factor_below_one_is_invalid() {
        let text = r#"
platform:
  url: https://zabbix.example.com
sources:
  - { name: cmdb, collector: file, backoff_factor: 0.5 }
"#;
        assert!(matches!(Config::from_yaml_str(text), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::from_path(&dir.path().join("absent.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
