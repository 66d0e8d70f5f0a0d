//! The administrative reload pipeline
//!
//! A reload runs an ordered list of external reconfiguration commands (for
//! example, regenerating a routing map) exactly once each, in declared
//! order, stopping at the first failure. Later steps may depend on the side
//! effects of earlier ones, so there is no retry and no rollback; a partial
//! run is an acceptable degraded state that requires manual intervention.

use async_trait::async_trait;
use serde::Deserialize;
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, error};

/// Bundled step list, baked into the binary at build time.
const EMBEDDED_STEPS: &str = include_str!("../cmds.json");

/// Error from a single reload step.
#[derive(Debug, Error)]
pub enum ReloadError {
    /// The external program could not be started at all
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    /// The external program ran but exited unsuccessfully
    #[error("'{program}' exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
}

/// A single executable reconfiguration step.
///
/// Steps are polymorphic so that future kinds (HTTP calls, in-process
/// actions) can join the pipeline without touching the runner.
#[async_trait]
pub trait ReloadStep: Send + Sync {
    /// Short label for log lines and diagnostics.
    fn describe(&self) -> String;

    /// Run the step to completion, returning its captured stdout.
    async fn execute(&self) -> Result<Vec<u8>, ReloadError>;
}

/// An external command invocation: a program and its verbatim arguments.
///
/// Immutable once loaded. The wire names (`cmd`, `args`) match the bundled
/// `cmds.json` resource.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandStep {
    #[serde(rename = "cmd")]
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[async_trait]
impl ReloadStep for CommandStep {
    fn describe(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }

    async fn execute(&self) -> Result<Vec<u8>, ReloadError> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| ReloadError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(ReloadError::Failed {
                program: self.program.clone(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(output.stdout)
    }
}

/// Wire shape of the bundled step list.
#[derive(Debug, Deserialize)]
struct StepList {
    #[serde(rename = "cmd_list", default)]
    steps: Vec<CommandStep>,
}

/// An ordered list of reload steps, executed sequentially and fail-fast.
pub struct ReloadPipeline {
    steps: Vec<Box<dyn ReloadStep>>,
}

impl ReloadPipeline {
    /// Build a pipeline from already-constructed steps.
    pub fn from_steps(steps: Vec<Box<dyn ReloadStep>>) -> Self {
        Self { steps }
    }

    /// Parse a pipeline from a JSON step list.
    ///
    /// Malformed input is logged and degrades to an empty pipeline, turning
    /// subsequent reloads into no-ops instead of refusing to start. The
    /// startup banner reports the step count so a silently-empty pipeline is
    /// visible to operators.
    pub fn from_json(input: &str) -> Self {
        let steps = match serde_json::from_str::<StepList>(input) {
            Ok(list) => list.steps,
            Err(e) => {
                error!(error = %e, "Malformed reload step list, continuing with an empty pipeline");
                Vec::new()
            }
        };

        Self {
            steps: steps
                .into_iter()
                .map(|s| Box::new(s) as Box<dyn ReloadStep>)
                .collect(),
        }
    }

    /// Load the step list bundled into the binary.
    pub fn embedded() -> Self {
        Self::from_json(EMBEDDED_STEPS)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Execute every step in order, stopping at the first failure.
    ///
    /// A step runs only if all prior steps succeeded; remaining steps after
    /// a failure are discarded. Stdout is logged at debug level and then
    /// dropped. No per-step timeout is enforced: a hung external command
    /// blocks the caller (and, through the gate lock, the whole proxy)
    /// indefinitely.
    pub async fn run(&self) -> Result<(), ReloadError> {
        for step in &self.steps {
            debug!(step = %step.describe(), "Running reload step");
            match step.execute().await {
                Ok(stdout) => {
                    debug!(
                        step = %step.describe(),
                        stdout = %String::from_utf8_lossy(&stdout),
                        "Reload step succeeded"
                    );
                }
                Err(e) => {
                    error!(step = %step.describe(), error = %e, "Reload step failed, aborting pipeline");
                    return Err(e);
                }
            }
        }

        Ok(())
    }
}
