//! Modificateur `exec` : envoie la fiche JSON sur stdin d'une commande et relit
//! la fiche modifiée sur stdout.

use super::HostModifier;
use crate::collectors::exec::{run_command, DEFAULT_COMMAND_TIMEOUT};
use crate::models::Host;
use crate::units::{param_str, param_u64, ParamKind, ParamSpec, Params};
use anyhow::Context;
use async_trait::async_trait;
use std::time::Duration;

const SCHEMA: &[ParamSpec] = &[
    ParamSpec::required("command", ParamKind::String),
    ParamSpec::optional("timeout_secs", ParamKind::Integer),
];

pub struct ExecModifier;

#[async_trait]
impl HostModifier for ExecModifier {
    fn kind(&self) -> &str {
        "exec"
    }

    fn schema(&self) -> &[ParamSpec] {
        SCHEMA
    }

    async fn modify(&self, host: Host, params: &Params) -> anyhow::Result<Host> {
        let command = param_str(params, "command").context("missing 'command' parameter")?;
        let timeout = param_u64(params, "timeout_secs")
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_COMMAND_TIMEOUT);

        let input = serde_json::to_vec(&host)?;
        let stdout = run_command(command, Some(input), timeout).await?;
        serde_json::from_slice(&stdout).context("modifier output is not a JSON host")
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn identity_command_returns_same_host() {
        let params = serde_json::from_value(json!({"command": "cat"})).unwrap();
        let mut host = Host::new("web01");
        host.importance = Some(3);

        let modified = ExecModifier.modify(host.clone(), &params).await.unwrap();
        assert_eq!(modified, host);
    }

    #[tokio::test]
    async fn garbage_output_is_an_error() {
        let params = serde_json::from_value(json!({"command": "echo not-json"})).unwrap();
        assert!(ExecModifier.modify(Host::new("web01"), &params).await.is_err());
    }
}
