//! Collecteur `file` : lit une liste d'hôtes depuis un fichier YAML ou JSON.

use super::SourceCollector;
use crate::models::Host;
use crate::units::{param_str, ParamKind, ParamSpec, Params};
use anyhow::{bail, Context};
use async_trait::async_trait;
use std::path::Path;

const SCHEMA: &[ParamSpec] = &[
    ParamSpec::required("path", ParamKind::String),
    // "yaml" ou "json" ; sinon déduit de l'extension
    ParamSpec::optional("format", ParamKind::String),
];

pub struct FileCollector;

#[async_trait]
impl SourceCollector for FileCollector {
    fn kind(&self) -> &str {
        "file"
    }

    fn schema(&self) -> &[ParamSpec] {
        SCHEMA
    }

    async fn collect(&self, params: &Params) -> anyhow::Result<Vec<Host>> {
        let path = param_str(params, "path").context("missing 'path' parameter")?;
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("cannot read {path}"))?;

        let is_json = match param_str(params, "format") {
            Some("json") => true,
            Some("yaml") => false,
            Some(other) => bail!("unsupported format '{other}'"),
            None => Path::new(path).extension().is_some_and(|ext| ext == "json"),
        };

        let hosts = if is_json {
            serde_json::from_str(&text).with_context(|| format!("invalid host list in {path}"))?
        } else {
            serde_yaml::from_str(&text).with_context(|| format!("invalid host list in {path}"))?
        };
        Ok(hosts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(path: &Path) -> Params {
        serde_json::from_value(json!({ "path": path.to_string_lossy() })).unwrap()
    }

    #[tokio::test]
    async fn reads_yaml_host_list() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts.yaml");
        std::fs::write(
            &path,
            "- hostname: web01.example.com\n  properties: [is_web]\n- hostname: db01.example.com\n  enabled: false\n",
        )
        .unwrap();

        let hosts = FileCollector.collect(&params(&path)).await.unwrap();
        assert_eq!(hosts.len(), 2);
        assert!(hosts[0].properties.contains("is_web"));
        assert!(!hosts[1].enabled);
    }

    #[tokio::test]
    async fn reads_json_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts.json");
        std::fs::write(&path, r#"[{"hostname": "web01", "importance": 2}]"#).unwrap();

        let hosts = FileCollector.collect(&params(&path)).await.unwrap();
        assert_eq!(hosts[0].importance, Some(2));
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = FileCollector.collect(&params(&dir.path().join("absent.yaml"))).await;
        assert!(result.is_err());
    }
}
