//! Runs the configured start/shutdown commands for lifecycle events

use crate::config::CommandsConfig;
use crate::error::{GateError, Result};
use crate::lifecycle::LifecycleEvent;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{error, info};

/// What a finished command produced
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub name: String,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Executes lifecycle commands fire-and-forget
pub struct CommandInvoker {
    commands: CommandsConfig,
}

impl CommandInvoker {
    pub fn new(commands: CommandsConfig) -> Arc<Self> {
        Arc::new(Self { commands })
    }

    /// Split the named command line into program and arguments
    pub fn argv(&self, name: &str) -> Result<Vec<String>> {
        let line = self
            .commands
            .get(name)
            .ok_or_else(|| GateError::Config(format!("no command named '{}'", name)))?;
        let argv = shell_words::split(line)
            .map_err(|e| GateError::Config(format!("command '{}': {}", name, e)))?;
        if argv.is_empty() {
            return Err(GateError::Config(format!("command '{}' is empty", name)));
        }
        Ok(argv)
    }

    /// Run the named command to completion
    pub async fn execute(&self, name: &str) -> Result<CommandOutcome> {
        let argv = self.argv(name)?;

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        if let Some(dir) = &self.commands.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let output = cmd.output().await?;
        Ok(CommandOutcome {
            name: name.to_string(),
            success: output.status.success(),
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    /// Handle one event in its own task
    pub fn dispatch(self: &Arc<Self>, event: LifecycleEvent) -> tokio::task::JoinHandle<()> {
        let invoker = Arc::clone(self);
        tokio::spawn(async move {
            let name = event.command();
            info!(event = %event, command = name, "Running lifecycle command");

            match invoker.execute(name).await {
                Ok(outcome) if outcome.success => {
                    info!(command = name, stdout = %outcome.stdout, "Command finished");
                }
                Ok(outcome) => {
                    error!(
                        command = name,
                        exit_code = ?outcome.exit_code,
                        stderr = %outcome.stderr,
                        "Command failed"
                    );
                }
                Err(e) => {
                    error!(command = name, error = %e, "Failed to run command");
                }
            }
        })
    }

    /// Consume events until every sender is gone
    pub async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<LifecycleEvent>) {
        while let Some(event) = events.recv().await {
            self.dispatch(event);
        }
        info!("Command invoker stopped");
    }
}
