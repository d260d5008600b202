//! Remote execution pipeline for ksctl
//!
//! Scripts are collected into a [`ScriptPipeline`] and driven over SSH by a
//! [`RemoteExecutor`]. The wire is abstracted behind [`Transport`] so the
//! bootstrap logic can be exercised without real machines.

#![deny(missing_docs)]

pub mod error;
pub mod executor;
pub mod host_identity;
pub mod keypair;
pub mod pipeline;
pub mod russh_transport;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod transport;

pub use error::{Result, SshError};
pub use executor::{
    ExecutionOutcome, ExecutorConfig, FailUntilLastAttempt, FaultInjector, NoFaults, OutputMode,
    RemoteExecutor,
};
pub use pipeline::{Script, ScriptExecutor, ScriptPipeline};
pub use transport::{CommandOutput, RemoteTarget, Session, Transport};
