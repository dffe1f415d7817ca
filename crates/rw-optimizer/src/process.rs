//! Trainer that runs an external command per trial.
//!
//! The child learns about its trial through environment variables and reports
//! progress as JSON lines on stdout:
//!
//! ```text
//! {"checkpoint": 3, "metric": 0.71}
//! {"final_metric": 0.64}
//! ```
//!
//! Any other output is passed through to debug logging. Closing the child's
//! stdin is the request to stop; a child that ignores it is killed after a
//! grace period.

use rw_types::TrainerError;
use serde::Deserialize;
use std::io::{BufRead, BufReader, Lines};
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use crate::resource::ResourceHandle;
use crate::runner::{RunConfig, Trainer, TrainingSession, TrainingStep};

pub const ENV_TRIAL_ID: &str = "RUNGWISE_TRIAL_ID";
pub const ENV_RUN_NAME: &str = "RUNGWISE_RUN_NAME";
pub const ENV_OUTPUT_DIR: &str = "RUNGWISE_OUTPUT_DIR";
pub const ENV_PARAMS: &str = "RUNGWISE_PARAMS";
pub const ENV_MAX_CHECKPOINT: &str = "RUNGWISE_MAX_CHECKPOINT";

#[derive(Debug, Clone)]
pub struct ProcessTrainer {
    program: String,
    args: Vec<String>,
    grace: Duration,
}

impl ProcessTrainer {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            grace: Duration::from_secs(30),
        }
    }

    /// How long a cancelled child may take to exit on its own.
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }
}

impl Trainer for ProcessTrainer {
    fn start(
        &mut self,
        config: &RunConfig,
        resource: &ResourceHandle,
    ) -> Result<Box<dyn TrainingSession>, TrainerError> {
        std::fs::create_dir_all(&config.output_dir)?;
        let params = serde_json::to_string(&config.params)
            .map_err(|e| TrainerError::Rejected(format!("cannot encode params: {e}")))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .envs(resource.env_vars())
            .env(ENV_TRIAL_ID, config.trial_id.to_string())
            .env(ENV_RUN_NAME, &config.run_name)
            .env(ENV_OUTPUT_DIR, &config.output_dir)
            .env(ENV_PARAMS, params)
            .env(ENV_MAX_CHECKPOINT, config.max_checkpoint.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| TrainerError::Rejected(format!("cannot spawn {}: {e}", self.program)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TrainerError::Rejected("child stdout not captured".to_string()))?;
        let stdin = child.stdin.take();
        tracing::debug!(trial = config.trial_id, pid = child.id(), program = %self.program, "spawned trainer");

        Ok(Box::new(ProcessSession {
            trial_id: config.trial_id,
            child,
            stdin,
            lines: BufReader::new(stdout).lines(),
            grace: self.grace,
            exited: None,
        }))
    }
}

/// One protocol line from the child.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
enum Message {
    Checkpoint {
        checkpoint: f64,
        /// `null` reports a non-finite value (JSON has no NaN).
        metric: Option<f64>,
    },
    Final {
        final_metric: f64,
    },
}

fn parse_message(line: &str) -> Option<Message> {
    let line = line.trim();
    if !line.starts_with('{') {
        return None;
    }
    serde_json::from_str(line).ok()
}

struct ProcessSession {
    trial_id: u64,
    child: Child,
    stdin: Option<ChildStdin>,
    lines: Lines<BufReader<ChildStdout>>,
    grace: Duration,
    exited: Option<ExitStatus>,
}

impl ProcessSession {
    fn wait(&mut self) -> std::io::Result<ExitStatus> {
        if let Some(status) = self.exited {
            return Ok(status);
        }
        let status = self.child.wait()?;
        self.exited = Some(status);
        Ok(status)
    }

    /// Read the rest of stdout after the final metric so the child can exit.
    fn drain(&mut self) {
        for line in self.lines.by_ref() {
            match line {
                Ok(line) => tracing::debug!(trial = self.trial_id, "{line}"),
                Err(_) => break,
            }
        }
    }
}

impl TrainingSession for ProcessSession {
    fn step(&mut self) -> TrainingStep {
        while let Some(line) = self.lines.next() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    return TrainingStep::Failed {
                        reason: format!("failed to read trainer output: {e}"),
                    }
                }
            };
            match parse_message(&line) {
                Some(Message::Checkpoint { checkpoint, metric }) => {
                    return TrainingStep::Checkpoint {
                        checkpoint,
                        metric: metric.unwrap_or(f64::NAN),
                    };
                }
                Some(Message::Final { final_metric }) => {
                    self.drain();
                    match self.wait() {
                        Ok(status) if !status.success() => tracing::warn!(
                            trial = self.trial_id,
                            %status,
                            "trainer reported a final metric but exited unsuccessfully"
                        ),
                        Ok(_) => {}
                        Err(e) => tracing::warn!(trial = self.trial_id, error = %e, "failed to reap trainer"),
                    }
                    return TrainingStep::Done { final_metric };
                }
                None => tracing::debug!(trial = self.trial_id, "{line}"),
            }
        }

        match self.wait() {
            Ok(status) => TrainingStep::Failed {
                reason: format!("trainer exited without a final metric ({status})"),
            },
            Err(e) => TrainingStep::Failed {
                reason: format!("failed to wait for trainer: {e}"),
            },
        }
    }

    fn cancel(&mut self) {
        if self.exited.is_some() {
            return;
        }
        // Closing stdin is the stop request.
        drop(self.stdin.take());

        let deadline = Instant::now() + self.grace;
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    self.exited = Some(status);
                    tracing::debug!(trial = self.trial_id, %status, "trainer stopped");
                    return;
                }
                Ok(None) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(50));
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(trial = self.trial_id, error = %e, "failed to poll trainer");
                    break;
                }
            }
        }

        tracing::warn!(trial = self.trial_id, grace_secs = self.grace.as_secs_f64(), "killing trainer");
        if let Err(e) = self.child.kill() {
            tracing::warn!(trial = self.trial_id, error = %e, "failed to kill trainer");
        }
        if let Ok(status) = self.child.wait() {
            self.exited = Some(status);
        }
    }
}

impl Drop for ProcessSession {
    fn drop(&mut self) {
        if self.exited.is_none() {
            self.cancel();
        }
    }
}
