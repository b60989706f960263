//! Collecteur `exec` : lance une commande externe et lit une liste d'hôtes JSON
//! sur sa sortie standard. `run_command` est aussi utilisé par le modificateur `exec`.

use super::SourceCollector;
use crate::models::Host;
use crate::units::{param_str, param_u64, ParamKind, ParamSpec, Params};
use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

const SCHEMA: &[ParamSpec] = &[
    ParamSpec::required("command", ParamKind::String),
    ParamSpec::optional("timeout_secs", ParamKind::Integer),
];

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Exécute `command` (découpée façon shell, sans passer par un shell),
/// envoie `stdin` s'il est fourni, et renvoie stdout si le code retour est 0.
pub async fn run_command(
    command: &str,
    stdin: Option<Vec<u8>>,
    timeout: Duration,
) -> anyhow::Result<Vec<u8>> {
    let argv = shell_words::split(command).with_context(|| format!("cannot parse command: {command}"))?;
    let (program, args) = argv.split_first().ok_or_else(|| anyhow!("empty command"))?;

    let mut child = Command::new(program)
        .args(args)
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("cannot start {program}"))?;

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        tokio::spawn(async move {
            // Erreur d'écriture = le process a fermé stdin, son code retour tranchera
            let _ = pipe.write_all(&input).await;
        });
    }

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| anyhow!("{program} timed out after {}s", timeout.as_secs()))??;

    if !output.status.success() {
        bail!(
            "{program} exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(output.stdout)
}

pub struct ExecCollector;

#[async_trait]
impl SourceCollector for ExecCollector {
    fn kind(&self) -> &str {
        "exec"
    }

    fn schema(&self) -> &[ParamSpec] {
        SCHEMA
    }

    async fn collect(&self, params: &Params) -> anyhow::Result<Vec<Host>> {
        let command = param_str(params, "command").context("missing 'command' parameter")?;
        let timeout = param_u64(params, "timeout_secs")
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_COMMAND_TIMEOUT);

        let stdout = run_command(command, None, timeout).await?;
        serde_json::from_slice(&stdout).context("command output is not a JSON host list")
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: serde_json::Value) -> Params {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn parses_stdout_as_hosts() {
        let p = params(json!({
            "command": r#"echo '[{"hostname": "web01", "siteadmins": ["ops@example.com"]}]'"#
        }));
        let hosts = ExecCollector.collect(&p).await.unwrap();
        assert_eq!(hosts.len(), 1);
        assert!(hosts[0].siteadmins.contains("ops@example.com"));
    }

    #[tokio::test]
    async fn non_zero_exit_is_an_error() {
        let err = ExecCollector.collect(&params(json!({"command": "false"}))).await.unwrap_err();
        assert!(err.to_string().contains("exited"));
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let p = params(json!({"command": "sleep 5", "timeout_secs": 1}));
        let err = ExecCollector.collect(&p).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn stdin_is_forwarded() {
        let out = run_command("cat", Some(b"hello".to_vec()), Duration::from_secs(5)).await.unwrap();
        assert_eq!(out, b"hello");
    }
}
