//! Scripted in-memory transport
//!
//! Matches each executed command against substring rules and replays canned
//! output, recording every connection and command for later assertions.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{Result, SshError};
use crate::transport::{CommandOutput, RemoteTarget, Session, Transport};

/// Canned answer for a matching command
#[derive(Clone, Debug)]
pub enum Reply {
    /// Command ran and exited with this output
    Output(CommandOutput),
    /// Command ended without an exit status
    MissingExitStatus,
    /// Channel could not be opened
    ChannelOpenFailure,
}

impl Reply {
    /// Successful run printing `stdout`
    pub fn stdout(stdout: impl Into<String>) -> Self {
        Reply::Output(CommandOutput {
            stdout: stdout.into(),
            ..Default::default()
        })
    }

    /// Failed run with exit status 1
    pub fn failure(stderr: impl Into<String>) -> Self {
        Reply::Output(CommandOutput {
            stderr: stderr.into(),
            exit_status: 1,
            ..Default::default()
        })
    }
}

/// Fault raised when dialing a host
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectFault {
    /// Connection refused; retryable
    Dial,
    /// Server presented an unknown key; fatal
    HostKeyMismatch,
}

/// A command seen by the transport
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutedCommand {
    /// Host the command ran on
    pub host: String,
    /// Full command line
    pub command: String,
}

struct Rule {
    host: Option<String>,
    pattern: String,
    queued: VecDeque<Reply>,
    standing: Option<Reply>,
}

impl Rule {
    fn matches(&self, host: &str, command: &str) -> bool {
        self.host.as_deref().map_or(true, |h| h == host) && command.contains(&self.pattern)
    }
}

#[derive(Default)]
struct Inner {
    rules: Vec<Rule>,
    connect_faults: Vec<(String, ConnectFault, usize)>,
    connects: Vec<String>,
    login_keys: Vec<(String, String)>,
    executed: Vec<ExecutedCommand>,
}

impl Inner {
    fn reply_for(&mut self, host: &str, command: &str) -> Reply {
        if let Some(rule) = self
            .rules
            .iter_mut()
            .find(|r| r.matches(host, command) && !r.queued.is_empty())
        {
            if let Some(reply) = rule.queued.pop_front() {
                return reply;
            }
        }

        self.rules
            .iter()
            .rev()
            .find(|r| r.matches(host, command) && r.standing.is_some())
            .and_then(|r| r.standing.clone())
            .unwrap_or_else(|| Reply::stdout(""))
    }
}

/// Transport answering from rules instead of real hosts
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    inner: Arc<Mutex<Inner>>,
}

impl ScriptedTransport {
    /// Transport where every command succeeds with empty output
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands containing `pattern` print `stdout` on any host
    pub fn respond(&self, pattern: &str, stdout: &str) -> &Self {
        self.push_rule(None, pattern, VecDeque::new(), Some(Reply::stdout(stdout)))
    }

    /// Commands containing `pattern` print `stdout` on `host` only
    pub fn respond_on(&self, host: &str, pattern: &str, stdout: &str) -> &Self {
        self.push_rule(
            Some(host.to_string()),
            pattern,
            VecDeque::new(),
            Some(Reply::stdout(stdout)),
        )
    }

    /// Commands containing `pattern` always get `reply`
    pub fn reply(&self, pattern: &str, reply: Reply) -> &Self {
        self.push_rule(None, pattern, VecDeque::new(), Some(reply))
    }

    /// The next `times` commands containing `pattern` exit 1 with `stderr`
    pub fn fail(&self, pattern: &str, times: usize, stderr: &str) -> &Self {
        let queued = (0..times).map(|_| Reply::failure(stderr)).collect();
        self.push_rule(None, pattern, queued, None)
    }

    /// The next `times` commands containing `pattern` lose their exit status
    pub fn transient(&self, pattern: &str, times: usize) -> &Self {
        let queued = (0..times).map(|_| Reply::MissingExitStatus).collect();
        self.push_rule(None, pattern, queued, None)
    }

    /// The next `times` connections to `host` fail with `fault`
    pub fn fail_connect(&self, host: &str, fault: ConnectFault, times: usize) -> &Self {
        self.inner
            .lock()
            .connect_faults
            .push((host.to_string(), fault, times));
        self
    }

    fn push_rule(
        &self,
        host: Option<String>,
        pattern: &str,
        queued: VecDeque<Reply>,
        standing: Option<Reply>,
    ) -> &Self {
        self.inner.lock().rules.push(Rule {
            host,
            pattern: pattern.to_string(),
            queued,
            standing,
        });
        self
    }

    /// Every command run so far, in order
    pub fn executed(&self) -> Vec<ExecutedCommand> {
        self.inner.lock().executed.clone()
    }

    /// Commands run on `host`, in order
    pub fn executed_on(&self, host: &str) -> Vec<String> {
        self.inner
            .lock()
            .executed
            .iter()
            .filter(|c| c.host == host)
            .map(|c| c.command.clone())
            .collect()
    }

    /// How many commands contained `pattern`
    pub fn count(&self, pattern: &str) -> usize {
        self.inner
            .lock()
            .executed
            .iter()
            .filter(|c| c.command.contains(pattern))
            .count()
    }

    /// How many commands on `host` contained `pattern`
    pub fn count_on(&self, host: &str, pattern: &str) -> usize {
        self.inner
            .lock()
            .executed
            .iter()
            .filter(|c| c.host == host && c.command.contains(pattern))
            .count()
    }

    /// Hosts dialed so far, one entry per attempt
    pub fn connects(&self) -> Vec<String> {
        self.inner.lock().connects.clone()
    }

    /// Private keys presented to `host`, one entry per attempt
    pub fn login_keys_on(&self, host: &str) -> Vec<String> {
        self.inner
            .lock()
            .login_keys
            .iter()
            .filter(|(h, _)| h == host)
            .map(|(_, key)| key.clone())
            .collect()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&self, target: &RemoteTarget) -> Result<Box<dyn Session>> {
        let mut inner = self.inner.lock();
        inner.connects.push(target.host.clone());
        inner
            .login_keys
            .push((target.host.clone(), target.private_key.clone()));

        if let Some(entry) = inner
            .connect_faults
            .iter_mut()
            .find(|(h, _, left)| *h == target.host && *left > 0)
        {
            entry.2 -= 1;
            return Err(match entry.1 {
                ConnectFault::Dial => SshError::Dial {
                    host: target.host.clone(),
                    message: "connection refused".to_string(),
                },
                ConnectFault::HostKeyMismatch => SshError::HostKeyMismatch {
                    host: target.host.clone(),
                    algorithm: "ssh-ed25519".to_string(),
                    expected: "SHA256:expected".to_string(),
                    offered: "SHA256:offered".to_string(),
                },
            });
        }

        Ok(Box::new(ScriptedSession {
            host: target.host.clone(),
            inner: self.inner.clone(),
        }))
    }
}

struct ScriptedSession {
    host: String,
    inner: Arc<Mutex<Inner>>,
}

#[async_trait]
impl Session for ScriptedSession {
    async fn exec(&mut self, command: &str) -> Result<CommandOutput> {
        let mut inner = self.inner.lock();
        inner.executed.push(ExecutedCommand {
            host: self.host.clone(),
            command: command.to_string(),
        });

        match inner.reply_for(&self.host, command) {
            Reply::Output(out) => Ok(out),
            Reply::MissingExitStatus => Err(SshError::MissingExitStatus {
                host: self.host.clone(),
            }),
            Reply::ChannelOpenFailure => Err(SshError::ChannelOpen {
                host: self.host.clone(),
                message: "open failed".to_string(),
            }),
        }
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
