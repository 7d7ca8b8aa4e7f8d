//! Cloud and checkpoint operations driven by configured shell commands.
//!
//! Each operation is a template such as
//! `cloudctl create --pool {pool} --type {instance_type}`. Placeholders are
//! substituted with single-quoted values, the result runs under `sh -c` with
//! a timeout, and the trimmed stdout is the returned id or handle.

use std::time::Duration;

use async_trait::async_trait;
use htas_cluster::{Checkpointer, CloudProvider, ClusterResult, SnapshotHandle};
use htas_core::config::CloudConfig;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::error::{CloudError, CloudResult};

#[derive(Debug, Clone)]
pub struct CommandProvider {
    create: Option<String>,
    delete: Option<String>,
    checkpoint: Option<String>,
    restore: Option<String>,
    timeout: Duration,
}

impl CommandProvider {
    pub fn new(config: &CloudConfig) -> Self {
        Self {
            create: config.create_command.clone(),
            delete: config.delete_command.clone(),
            checkpoint: config.checkpoint_command.clone(),
            restore: config.restore_command.clone(),
            timeout: config.command_timeout,
        }
    }

    /// Both checkpoint and restore commands are configured.
    pub fn can_checkpoint(&self) -> bool {
        self.checkpoint.is_some() && self.restore.is_some()
    }

    async fn run(&self, op: &'static str, template: Option<&str>, vars: &[(&str, &str)]) -> CloudResult<String> {
        let template = template.ok_or(CloudError::NotConfigured(op))?;
        let command = render(template, vars);
        debug!(%op, %command, "running command");

        let output = match timeout(self.timeout, Command::new("sh").arg("-c").arg(&command).kill_on_drop(true).output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => return Err(CloudError::Spawn { command, source }),
            Err(_) => {
                return Err(CloudError::Timeout {
                    command,
                    timeout: self.timeout,
                });
            }
        };

        if !output.status.success() {
            return Err(CloudError::Failed {
                command,
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Run a command whose stdout names the result.
    async fn run_for_id(&self, op: &'static str, template: Option<&str>, vars: &[(&str, &str)]) -> CloudResult<String> {
        let id = self.run(op, template, vars).await?;
        match id.lines().last() {
            Some(line) if !line.trim().is_empty() => Ok(line.trim().to_string()),
            _ => Err(CloudError::EmptyOutput {
                command: render(template.unwrap_or_default(), vars),
            }),
        }
    }
}

#[async_trait]
impl CloudProvider for CommandProvider {
    async fn create_node(&self, pool: &str, instance_type: &str) -> ClusterResult<String> {
        let vars = [("pool", pool), ("instance_type", instance_type)];
        let node = self.run_for_id("create", self.create.as_deref(), &vars).await?;
        info!(%node, %pool, %instance_type, "node created");
        Ok(node)
    }

    async fn delete_node(&self, node: &str) -> ClusterResult<()> {
        self.run("delete", self.delete.as_deref(), &[("node", node)]).await?;
        info!(%node, "node deleted");
        Ok(())
    }
}

#[async_trait]
impl Checkpointer for CommandProvider {
    async fn checkpoint(&self, pod: &str) -> ClusterResult<SnapshotHandle> {
        let handle = self.run_for_id("checkpoint", self.checkpoint.as_deref(), &[("pod", pod)]).await?;
        Ok(SnapshotHandle(handle))
    }

    async fn restore(&self, snapshot: &SnapshotHandle, node: &str) -> ClusterResult<String> {
        let vars = [("snapshot", snapshot.0.as_str()), ("node", node)];
        Ok(self.run_for_id("restore", self.restore.as_deref(), &vars).await?)
    }
}

/// Substitute `{name}` placeholders. Unknown placeholders are left alone.
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (name, value) in vars {
        out = out.replace(&format!("{{{name}}}"), &shell_quote(value));
    }
    out
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
