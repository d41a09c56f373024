//! Step Execution
//!
//! The scheduler treats a step's payload as opaque and hands it to a
//! [`StepExecutor`]. [`ShellExecutor`] is the bundled implementation: it
//! runs the executable reference as a bash script with the order's
//! parameters substituted and exported.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio::process::Command;

use crate::workflow::model::DEFAULT_TRANSITION;
use crate::workflow::store::encode_file_name;

/// Prefix of the stdout line a script uses to pick its transition.
pub const TRANSITION_MARKER: &str = "TRANSITION=";

/// Result of running one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// The step succeeded and names the transition to follow.
    Success { transition: String },
    /// The step failed; the work order ends in ERROR.
    Failure { reason: String },
}

impl StepOutcome {
    /// Success following the default `next` transition.
    pub fn success() -> Self {
        Self::Success {
            transition: DEFAULT_TRANSITION.to_string(),
        }
    }

    pub fn success_with(transition: impl Into<String>) -> Self {
        Self::Success {
            transition: transition.into(),
        }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        Self::Failure {
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// What a step executor knows about the order it runs for.
#[derive(Debug, Clone)]
pub struct OrderContext {
    pub work_order_uri: String,
    pub workflow_uri: String,
    pub step: String,
    /// Caller-supplied context label
    pub context: String,
    /// The definition's view variables
    pub view: HashMap<String, String>,
}

/// Runs one step's payload.
///
/// Called at most once per step visit of an order. May take arbitrarily
/// long; the scheduler awaits it off the caller's path.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn run(
        &self,
        executable: &str,
        params: &HashMap<String, String>,
        ctx: &OrderContext,
    ) -> StepOutcome;
}

/// Executes steps as bash scripts.
///
/// `{name}` placeholders in the executable are replaced by parameter or
/// view values, and every parameter is exported as an environment
/// variable. Exit status 0 is success; a stdout line `TRANSITION=<name>`
/// selects the transition, otherwise `next` is used.
#[derive(Debug, Clone, Default)]
pub struct ShellExecutor {
    working_dir: Option<PathBuf>,
    dry_run: bool,
}

impl ShellExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the working directory scripts run in.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Log commands instead of running them.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    async fn execute(
        &self,
        executable: &str,
        params: &HashMap<String, String>,
        ctx: &OrderContext,
    ) -> Result<StepOutcome, Box<dyn std::error::Error + Send + Sync>> {
        let command_text = substitute_placeholders(executable, params, &ctx.view);

        if self.dry_run {
            info!("[DRY RUN] {} / {}: {}", ctx.work_order_uri, ctx.step, command_text);
            return Ok(StepOutcome::success());
        }

        let script_path = create_execution_script(&ctx.work_order_uri, &ctx.step, &command_text)?;

        let mut cmd = Command::new("bash");
        cmd.arg(&script_path)
            .stdin(Stdio::null())
            .env("ORDERFLOW_WORK_ORDER", &ctx.work_order_uri)
            .env("ORDERFLOW_WORKFLOW", &ctx.workflow_uri)
            .env("ORDERFLOW_STEP", &ctx.step)
            .env("ORDERFLOW_CONTEXT", &ctx.context);

        for (name, value) in ctx.view.iter().chain(params.iter()) {
            if is_env_name(name) {
                cmd.env(name, value);
            }
        }

        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
            debug!("Executing in directory: {}", dir.display());
        }

        let output = cmd.output().await;

        if let Err(e) = fs::remove_file(&script_path) {
            warn!("Failed to clean up script {}: {}", script_path.display(), e);
        }

        let output = output?;
        let stdout = String::from_utf8_lossy(&output.stdout);

        if output.status.success() {
            if !stdout.trim().is_empty() {
                debug!("Step '{}' output:\n{}", ctx.step, stdout);
            }
            return Ok(match transition_from_output(&stdout) {
                Some(name) => StepOutcome::success_with(name),
                None => StepOutcome::success(),
            });
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        error!(
            "Step '{}' of {} failed with exit code: {:?}",
            ctx.step,
            ctx.work_order_uri,
            output.status.code()
        );
        if !stderr.trim().is_empty() {
            error!("stderr:\n{}", stderr);
        }
        if !stdout.trim().is_empty() {
            debug!("stdout:\n{}", stdout);
        }

        Ok(StepOutcome::failure(format!(
            "Step '{}' exited with code {:?}",
            ctx.step,
            output.status.code()
        )))
    }
}

#[async_trait]
impl StepExecutor for ShellExecutor {
    async fn run(
        &self,
        executable: &str,
        params: &HashMap<String, String>,
        ctx: &OrderContext,
    ) -> StepOutcome {
        match self.execute(executable, params, ctx).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Step '{}' of {} could not run: {}", ctx.step, ctx.work_order_uri, e);
                StepOutcome::failure(e.to_string())
            }
        }
    }
}

/// Replaces `{name}` with parameter values, falling back to view values.
fn substitute_placeholders(
    template: &str,
    params: &HashMap<String, String>,
    view: &HashMap<String, String>,
) -> String {
    let mut text = template.to_string();
    for (name, value) in view.iter().filter(|(k, _)| !params.contains_key(*k)) {
        text = text.replace(&format!("{{{}}}", name), value);
    }
    for (name, value) in params {
        text = text.replace(&format!("{{{}}}", name), value);
    }
    text
}

/// Last `TRANSITION=<name>` line of the output, if any.
fn transition_from_output(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .rev()
        .filter_map(|line| line.trim().strip_prefix(TRANSITION_MARKER))
        .map(str::trim)
        .find(|name| !name.is_empty())
        .map(str::to_string)
}

fn is_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Creates a temporary bash script for one step visit.
fn create_execution_script(
    work_order_uri: &str,
    step: &str,
    command_text: &str,
) -> std::io::Result<PathBuf> {
    let script_dir = std::env::temp_dir().join("orderflow_scripts");
    fs::create_dir_all(&script_dir)?;

    let script_path = script_dir.join(format!(
        "{}_{}.sh",
        encode_file_name(work_order_uri),
        encode_file_name(step)
    ));
    write_script(&script_path, command_text)?;
    Ok(script_path)
}

fn write_script(path: &Path, command_text: &str) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    writeln!(file, "#!/bin/bash")?;
    writeln!(file, "set -e")?;
    writeln!(file, "{}", command_text)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    }

    Ok(())
}
