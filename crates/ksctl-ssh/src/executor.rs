//! Drives a [`ScriptPipeline`] on one host
//!
//! One connection per run. Each script gets a fresh channel, its own retry
//! budget, and transient channel faults are absorbed without spending that
//! budget. The first script to exhaust its attempts ends the run.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use ksctl_common::retry::{jittered_pause, retry_with_backoff_if, RetryConfig};

use crate::error::{Result, SshError};
use crate::pipeline::{Script, ScriptPipeline};
use crate::russh_transport::RusshTransport;
use crate::transport::{CommandOutput, RemoteTarget, Session, Transport};

/// Whether stdout of each script is kept
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputMode {
    /// Keep stdout of every script, in order
    WithOutput,
    /// Discard stdout
    WithoutOutput,
}

/// Timing and retry knobs of the executor
#[derive(Clone, Debug, PartialEq)]
pub struct ExecutorConfig {
    /// Pause before dialing, letting a fresh VM finish booting
    pub settle_delay: Duration,
    /// Backoff for establishing the connection
    pub dial_retry: RetryConfig,
    /// Tries and spacing for channel faults inside one attempt
    pub transient_retry: RetryConfig,
    /// Lower bound of the pause between script attempts
    pub retry_pause_min: Duration,
    /// Upper bound of the pause between script attempts
    pub retry_pause_max: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_secs(20),
            dial_retry: RetryConfig::ssh_dial(),
            transient_retry: RetryConfig::ssh_transient(),
            retry_pause_min: Duration::from_secs(1),
            retry_pause_max: Duration::from_secs(2),
        }
    }
}

impl ExecutorConfig {
    /// Millisecond timings for tests and local harnesses
    pub fn fast() -> Self {
        Self {
            settle_delay: Duration::ZERO,
            dial_retry: RetryConfig::immediate(6),
            transient_retry: RetryConfig::immediate(5),
            retry_pause_min: Duration::from_millis(1),
            retry_pause_max: Duration::from_millis(2),
        }
    }
}

/// Turns successful script attempts into synthetic failures
///
/// Production runs use [`NoFaults`]; chaos runs use
/// [`FailUntilLastAttempt`] to prove every retryable script really retries.
pub trait FaultInjector: Send + Sync {
    /// Failure reason for this attempt, or `None` to let it succeed
    fn inject(&self, script: &Script, attempt: u32, max_attempts: u32) -> Option<String>;
}

/// Never injects
#[derive(Clone, Copy, Debug, Default)]
pub struct NoFaults;

impl FaultInjector for NoFaults {
    fn inject(&self, _script: &Script, _attempt: u32, _max_attempts: u32) -> Option<String> {
        None
    }
}

/// Fails every attempt of a retryable script except its last one
#[derive(Clone, Copy, Debug, Default)]
pub struct FailUntilLastAttempt;

impl FaultInjector for FailUntilLastAttempt {
    fn inject(&self, script: &Script, attempt: u32, max_attempts: u32) -> Option<String> {
        (script.can_retry && attempt < max_attempts)
            .then(|| format!("injected fault on attempt {attempt}/{max_attempts}"))
    }
}

/// Captured results of a successful run
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecutionOutcome {
    /// Stdout of every script in pipeline order (with-output mode only)
    pub outputs: Vec<String>,
}

impl ExecutionOutcome {
    /// Output of the script at `index` without surrounding newlines
    pub fn trimmed(&self, index: usize) -> Option<String> {
        self.outputs
            .get(index)
            .map(|s| s.trim_matches(|c| c == '\n' || c == '\r').to_string())
    }
}

/// Runs script pipelines on remote hosts
#[derive(Clone)]
pub struct RemoteExecutor {
    transport: Arc<dyn Transport>,
    config: ExecutorConfig,
    faults: Arc<dyn FaultInjector>,
    fast_mode: bool,
}

impl RemoteExecutor {
    /// Executor over the given transport with production timings
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            config: ExecutorConfig::default(),
            faults: Arc::new(NoFaults),
            fast_mode: false,
        }
    }

    /// Executor over real SSH, verifying host keys with `ssh-keyscan`
    pub fn ssh() -> Self {
        Self::new(Arc::new(RusshTransport::new()))
    }

    /// Replace the timing configuration
    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the fault injector
    pub fn with_fault_injector(mut self, faults: Arc<dyn FaultInjector>) -> Self {
        self.faults = faults;
        self
    }

    /// Copy of this executor that skips the settle delay
    pub fn fast(&self) -> Self {
        Self {
            fast_mode: true,
            ..self.clone()
        }
    }

    /// Run every script of `pipeline` on `target`
    ///
    /// Stops at the first script that exhausts its attempts; later scripts
    /// never run.
    pub async fn run(
        &self,
        target: &RemoteTarget,
        mut pipeline: ScriptPipeline,
        mode: OutputMode,
    ) -> Result<ExecutionOutcome> {
        if pipeline.is_empty() {
            return Ok(ExecutionOutcome::default());
        }

        if !self.fast_mode && !self.config.settle_delay.is_zero() {
            debug!(host = %target.host, delay = ?self.config.settle_delay, "waiting for host to settle");
            tokio::time::sleep(self.config.settle_delay).await;
        }

        let mut session = retry_with_backoff_if(
            &self.config.dial_retry,
            "ssh dial",
            |e: &SshError| e.is_retryable(),
            || self.transport.connect(target),
        )
        .await?;

        let result = self
            .drive(&target.host, session.as_mut(), &mut pipeline, mode)
            .await;

        if let Err(e) = session.close().await {
            debug!(host = %target.host, error = %e, "closing ssh session failed");
        }
        result
    }

    async fn drive(
        &self,
        host: &str,
        session: &mut dyn Session,
        pipeline: &mut ScriptPipeline,
        mode: OutputMode,
    ) -> Result<ExecutionOutcome> {
        let mut outcome = ExecutionOutcome::default();
        while let Some(script) = pipeline.next_script() {
            let stdout = self.run_script(host, session, &script).await?;
            if mode == OutputMode::WithOutput {
                outcome.outputs.push(stdout);
            }
        }
        Ok(outcome)
    }

    async fn run_script(
        &self,
        host: &str,
        session: &mut dyn Session,
        script: &Script,
    ) -> Result<String> {
        let max_attempts = script.attempts();
        let command = script.command_line();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            debug!(script = %script.name, host, attempt, max_attempts, "running script");

            let (reason, stderr) = match self.exec_absorbing_transients(host, session, &command).await
            {
                Ok(out) if out.success() => {
                    match self.faults.inject(script, attempt, max_attempts) {
                        None => {
                            info!(script = %script.name, host, "script succeeded");
                            return Ok(out.stdout);
                        }
                        Some(reason) => (reason, out.stderr),
                    }
                }
                Ok(out) => (format!("exit status {}", out.exit_status), out.stderr),
                Err(e) => (e.to_string(), String::new()),
            };

            warn!(
                script = %script.name,
                host,
                attempt,
                max_attempts,
                reason = %reason,
                "script attempt failed"
            );

            if attempt >= max_attempts {
                return Err(SshError::ScriptFailed {
                    script: script.name.clone(),
                    host: host.to_string(),
                    attempts: attempt,
                    stderr,
                    reason,
                });
            }

            tokio::time::sleep(jittered_pause(
                self.config.retry_pause_min,
                self.config.retry_pause_max,
            ))
            .await;
        }
    }

    async fn exec_absorbing_transients(
        &self,
        host: &str,
        session: &mut dyn Session,
        command: &str,
    ) -> Result<CommandOutput> {
        let limit = self.config.transient_retry.max_attempts.max(1);
        let mut tries = 0u32;
        loop {
            tries += 1;
            match session.exec(command).await {
                Err(e) if e.is_transient() && tries < limit => {
                    warn!(host, tries, error = %e, "transient ssh fault, retrying");
                    tokio::time::sleep(self.config.transient_retry.initial_delay).await;
                }
                other => return other,
            }
        }
    }
}
