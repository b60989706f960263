/**
 * FICHIERS DE MAPPING - propriété -> templates / groupes, siteadmin -> groupes
 *
 * FORMAT :
 * ```text
 * # commentaire
 * is_app_server:Template-app-generic,Template-os-linux
 * hansen@example.com:Hostgroup-hansen-hosts
 * ```
 * - Lignes vides et commentaires ignorés
 * - Ligne invalide : warning + ignorée
 * - Clé dupliquée : les valeurs s'ajoutent (warning)
 * - Valeurs dédupliquées en conservant l'ordre
 */

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::warn;

pub const PROPERTY_TEMPLATE_MAP: &str = "property_template_map.txt";
pub const PROPERTY_HOSTGROUP_MAP: &str = "property_hostgroup_map.txt";
pub const SITEADMIN_HOSTGROUP_MAP: &str = "siteadmin_hostgroup_map.txt";

pub type MapFile = BTreeMap<String, Vec<String>>;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MappingError {
    #[error("text, prefix and separator must not be empty")]
    EmptyInput,
    #[error("could not find prefix in {text:?} with separator {separator:?}")]
    NoSuffix { text: String, separator: String },
}

/// Parse le contenu d'un fichier de mapping (`origin` sert uniquement aux logs)
pub fn parse_map(content: &str, origin: &str) -> MapFile {
    let mut map = MapFile::new();

    for (index, raw) in content.lines().enumerate() {
        let lineno = index + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let parsed = line.split_once(':').and_then(|(key, value)| {
            let key = key.trim();
            let values: Vec<String> = value
                .split(',')
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .collect();
            (!key.is_empty() && !values.is_empty()).then(|| (key.to_string(), values))
        });

        let Some((key, values)) = parsed else {
            warn!(
                "Invalid format at line {lineno} in map file '{origin}'. Expected 'key:value', got '{line}'."
            );
            continue;
        };

        match map.get_mut(&key) {
            Some(existing) => {
                warn!("Duplicate key {key} at line {lineno} in map file '{origin}'.");
                existing.extend(values);
            }
            None => {
                map.insert(key, values);
            }
        }
    }

    for values in map.values_mut() {
        let mut seen = BTreeSet::new();
        values.retain(|v| seen.insert(v.clone()));
    }
    map
}

/// Lit un fichier de mapping depuis le disque
pub fn read_map_file(path: &Path) -> std::io::Result<MapFile> {
    let content = std::fs::read_to_string(path)?;
    Ok(parse_map(&content, &path.display().to_string()))
}

/// Remplace le préfixe de `text` (tout ce qui précède le premier séparateur) par `prefix`.
/// `with_prefix("Siteadmin-hansen", "Templates-", "-") == "Templates-hansen"`
pub fn with_prefix(text: &str, prefix: &str, separator: &str) -> Result<String, MappingError> {
    if text.is_empty() || prefix.is_empty() || separator.is_empty() {
        return Err(MappingError::EmptyInput);
    }
    let suffix = match text.split_once(separator) {
        Some((_, suffix)) if !suffix.is_empty() => suffix,
        _ => {
            return Err(MappingError::NoSuffix {
                text: text.to_string(),
                separator: separator.to_string(),
            })
        }
    };

    let name = format!("{prefix}{suffix}");
    if !prefix.ends_with(separator) && !suffix.starts_with(separator) {
        warn!("Prefix '{prefix}' for group name '{name}' does not contain separator '{separator}'");
    }
    Ok(name)
}

/// Applique `with_prefix` à toutes les valeurs d'un mapping (valeurs invalides ignorées)
pub fn mapping_values_with_prefix(map: &MapFile, prefix: &str, separator: &str) -> MapFile {
    map.iter()
        .map(|(key, values)| {
            let renamed = values
                .iter()
                .filter_map(|v| match with_prefix(v, prefix, separator) {
                    Ok(name) => Some(name),
                    Err(_) => {
                        warn!("Unable to replace prefix in '{v}' with '{prefix}'");
                        None
                    }
                })
                .collect();
            (key.clone(), renamed)
        })
        .collect()
}

/// Toutes les valeurs d'un mapping, à plat
pub fn all_values(map: &MapFile) -> BTreeSet<String> {
    map.values().flatten().cloned().collect()
}

/// Les trois mappings utilisés par le moteur de synchronisation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Mappings {
    pub property_template: MapFile,
    pub property_hostgroup: MapFile,
    pub siteadmin_hostgroup: MapFile,
}

impl Mappings {
    /// Charge les trois fichiers depuis `dir`. Un fichier absent donne un mapping vide.
    pub fn load(dir: &Path) -> std::io::Result<Self> {
        Ok(Self {
            property_template: load_optional(&dir.join(PROPERTY_TEMPLATE_MAP))?,
            property_hostgroup: load_optional(&dir.join(PROPERTY_HOSTGROUP_MAP))?,
            siteadmin_hostgroup: load_optional(&dir.join(SITEADMIN_HOSTGROUP_MAP))?,
        })
    }
}

fn load_optional(path: &Path) -> std::io::Result<MapFile> {
    match read_map_file(path) {
        Ok(map) => Ok(map),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!("map file {} not found, using empty mapping", path.display());
            Ok(MapFile::new())
        }
        Err(e) => Err(e),
    }
}
