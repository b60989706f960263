//! Modificateur `property_tags` : transforme des propriétés en tags
//! `(tags_prefix + tag, propriété)`. Les motifs sont ancrés en début de chaîne.

use super::HostModifier;
use crate::models::Host;
use crate::units::{param_list, param_str, ParamKind, ParamSpec, Params};
use anyhow::Context;
use async_trait::async_trait;
use regex::Regex;
use std::collections::BTreeSet;
use tracing::debug;

const SCHEMA: &[ParamSpec] = &[
    ParamSpec::required("tag", ParamKind::String),
    ParamSpec::optional("tags_prefix", ParamKind::String),
    ParamSpec::optional("include_patterns", ParamKind::StringList),
    ParamSpec::optional("exclude_patterns", ParamKind::StringList),
];

const DEFAULT_TAGS_PREFIX: &str = "zac_";

fn compile(patterns: &[String]) -> anyhow::Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| Regex::new(p).with_context(|| format!("invalid pattern '{p}'")))
        .collect()
}

fn matches_any(value: &str, patterns: &[Regex]) -> Option<String> {
    patterns
        .iter()
        .find(|re| re.find(value).is_some_and(|m| m.start() == 0))
        .map(|re| re.as_str().to_string())
}

/// Propriétés retenues : au moins un include (si la liste n'est pas vide)
/// et aucun exclude. Listes vides = tout passe.
pub fn match_host_properties(host: &Host, include: &[Regex], exclude: &[Regex]) -> BTreeSet<String> {
    let mut matched = BTreeSet::new();
    for property in &host.properties {
        if let Some(pattern) = matches_any(property, exclude) {
            debug!(host = %host.hostname, property = %property, pattern = %pattern, "property excluded");
            continue;
        }
        if !include.is_empty() && matches_any(property, include).is_none() {
            continue;
        }
        matched.insert(property.clone());
    }
    matched
}

pub struct PropertyTagsModifier;

#[async_trait]
impl HostModifier for PropertyTagsModifier {
    fn kind(&self) -> &str {
        "property_tags"
    }

    fn schema(&self) -> &[ParamSpec] {
        SCHEMA
    }

    async fn modify(&self, mut host: Host, params: &Params) -> anyhow::Result<Host> {
        let tag = param_str(params, "tag").context("missing 'tag' parameter")?;
        let prefix = param_str(params, "tags_prefix").unwrap_or(DEFAULT_TAGS_PREFIX);
        let include = compile(&param_list(params, "include_patterns"))?;
        let exclude = compile(&param_list(params, "exclude_patterns"))?;

        let key = format!("{prefix}{tag}");
        host.tags.retain(|(k, _)| k != &key);
        for property in match_host_properties(&host, &include, &exclude) {
            host.tags.insert((key.clone(), property));
        }
        Ok(host)
    }
}
