/**
 * UNITÉS ENFICHABLES - schéma de paramètres commun aux collecteurs et modificateurs
 *
 * Chaque unité déclare les paramètres qu'elle accepte (`ParamSpec`).
 * La configuration est validée contre ce schéma au démarrage : paramètre
 * obligatoire manquant, type incorrect ou clé inconnue = erreur fatale.
 */

use serde_json::Value;
use std::collections::BTreeMap;

pub type Params = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    String,
    Integer,
    Bool,
    StringList,
}

impl ParamKind {
    fn accepts(self, value: &Value) -> bool {
        match self {
            ParamKind::String => value.is_string(),
            ParamKind::Integer => value.is_i64() || value.is_u64(),
            ParamKind::Bool => value.is_boolean(),
            ParamKind::StringList => value
                .as_array()
                .is_some_and(|items| items.iter().all(Value::is_string)),
        }
    }

    fn label(self) -> &'static str {
        match self {
            ParamKind::String => "string",
            ParamKind::Integer => "integer",
            ParamKind::Bool => "bool",
            ParamKind::StringList => "list of strings",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamKind,
    pub required: bool,
}

impl ParamSpec {
    pub const fn required(name: &'static str, kind: ParamKind) -> Self {
        Self { name, kind, required: true }
    }

    pub const fn optional(name: &'static str, kind: ParamKind) -> Self {
        Self { name, kind, required: false }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum UnitError {
    #[error("{unit}: unknown unit kind '{kind}'")]
    UnknownKind { unit: String, kind: String },
    #[error("{unit}: missing required parameter '{param}'")]
    MissingParam { unit: String, param: String },
    #[error("{unit}: parameter '{param}' must be a {expected}")]
    InvalidParam { unit: String, param: String, expected: &'static str },
    #[error("{unit}: unknown parameter '{param}'")]
    UnknownParam { unit: String, param: String },
}

pub fn validate_params(unit: &str, schema: &[ParamSpec], params: &Params) -> Result<(), UnitError> {
    for spec in schema {
        match params.get(spec.name) {
            None if spec.required => {
                return Err(UnitError::MissingParam {
                    unit: unit.to_string(),
                    param: spec.name.to_string(),
                })
            }
            Some(value) if !spec.kind.accepts(value) => {
                return Err(UnitError::InvalidParam {
                    unit: unit.to_string(),
                    param: spec.name.to_string(),
                    expected: spec.kind.label(),
                })
            }
            _ => {}
        }
    }
    if let Some(param) = params.keys().find(|k| !schema.iter().any(|s| s.name == k.as_str())) {
        return Err(UnitError::UnknownParam { unit: unit.to_string(), param: param.clone() });
    }
    Ok(())
}

pub fn param_str<'a>(params: &'a Params, name: &str) -> Option<&'a str> {
    params.get(name).and_then(Value::as_str)
}

pub fn param_u64(params: &Params, name: &str) -> Option<u64> {
    params.get(name).and_then(Value::as_u64)
}

pub fn param_list(params: &Params, name: &str) -> Vec<String> {
    params
        .get(name)
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default()
}
