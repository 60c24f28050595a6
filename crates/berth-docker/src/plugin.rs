//! Managed plugins through the `docker plugin` command line.
//!
//! The Engine API client has no plugin endpoints, so these calls shell out to
//! the CLI talking to the same daemon.

use berth_core::error::RuntimeError;
use berth_core::runtime::{PluginInstall, RuntimeResult};
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct PluginCli {
    program: String,
}

impl Default for PluginCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl PluginCli {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub async fn list(&self) -> RuntimeResult<Vec<String>> {
        let out = self.run(&["plugin", "ls", "--format", "{{.Name}}"]).await?;
        Ok(parse_names(&out))
    }

    pub async fn install(&self, opts: &PluginInstall) -> RuntimeResult<()> {
        let args = install_args(opts);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run(&args).await.map(|_| ())
    }

    pub async fn is_enabled(&self, reference: &str) -> RuntimeResult<bool> {
        let out = self
            .run(&["plugin", "inspect", "--format", "{{.Enabled}}", reference])
            .await?;
        parse_enabled(&out)
    }

    pub async fn enable(&self, reference: &str) -> RuntimeResult<()> {
        self.run(&["plugin", "enable", reference]).await.map(|_| ())
    }

    async fn run(&self, args: &[&str]) -> RuntimeResult<String> {
        debug!(program = %self.program, ?args, "running plugin command");
        let output = Command::new(&self.program)
            .args(args)
            .output()
            .await
            .map_err(|e| RuntimeError::Unavailable(format!("failed to run {}: {e}", self.program)))?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(classify_failure(
                &args.join(" "),
                &String::from_utf8_lossy(&output.stderr),
            ))
        }
    }
}

pub(crate) fn install_args(opts: &PluginInstall) -> Vec<String> {
    let mut args = vec!["plugin".to_string(), "install".to_string()];
    if opts.grant_all_permissions {
        args.push("--grant-all-permissions".into());
    }
    if opts.disabled {
        args.push("--disable".into());
    }
    args.push(opts.remote.clone());
    args.extend(opts.args.iter().cloned());
    args
}

pub(crate) fn parse_names(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect()
}

pub(crate) fn parse_enabled(stdout: &str) -> RuntimeResult<bool> {
    match stdout.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(RuntimeError::Unavailable(format!(
            "unexpected plugin state '{other}'"
        ))),
    }
}

pub(crate) fn classify_failure(command: &str, stderr: &str) -> RuntimeError {
    let message = format!("docker {command}: {}", stderr.trim());
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("not found") || lower.contains("no such") {
        RuntimeError::NotFound(message)
    } else if lower.contains("cannot connect") || lower.contains("is the docker daemon running") {
        RuntimeError::Unavailable(message)
    } else {
        RuntimeError::Rejected(message)
    }
}
