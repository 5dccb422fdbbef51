//! Error taxonomy of the supervision engine.
//!
//! - [`ConfigurationError`]: the definition is unusable; never retried.
//! - [`SupervisorError::Launch`]: the command could not be started; retried
//!   with backoff under auto-restart, fatal otherwise.
//! - [`SystemError`]: a wait, kill or notify primitive failed; fatal to the
//!   current incarnation.

use std::io;

use nix::sys::signal::Signal;
use svcwrap_core::ScmStatus;
use thiserror::Error;

pub use svcwrap_core::ConfigurationError;

/// Failures talking to the host service manager.
#[derive(Error, Debug)]
pub enum HostError {
	#[error("failed to send to notify socket {addr}: {source}")]
	Send {
		addr: String,
		#[source]
		source: io::Error,
	},
}

#[derive(Error, Debug)]
pub enum SystemError {
	#[error("failed waiting for {what} process: {source}")]
	Wait {
		what: &'static str,
		#[source]
		source: io::Error,
	},

	#[error("failed to send {signal:?} to process group {pgid}: {source}")]
	Kill {
		pgid: u32,
		signal: Signal,
		#[source]
		source: nix::Error,
	},

	#[error("failed to report '{status}' to the service manager: {source}")]
	Notify {
		status: ScmStatus,
		#[source]
		source: HostError,
	},

	#[error("cannot report '{to}' after terminal status '{from}'")]
	InvalidTransition { from: ScmStatus, to: ScmStatus },
}

impl SystemError {
	pub fn as_label(&self) -> &'static str {
		match self {
			SystemError::Wait { .. } => "system_wait_failed",
			SystemError::Kill { .. } => "system_kill_failed",
			SystemError::Notify { .. } => "system_notify_failed",
			SystemError::InvalidTransition { .. } => "system_invalid_transition",
		}
	}
}

#[derive(Error, Debug)]
pub enum SupervisorError {
	#[error("configuration error: {0}")]
	Configuration(#[from] ConfigurationError),

	#[error("failed to launch {what} command `{command}`: {source}")]
	Launch {
		what: &'static str,
		command: String,
		#[source]
		source: io::Error,
	},

	#[error(transparent)]
	System(#[from] SystemError),
}

impl SupervisorError {
	/// Short stable label for logs.
	pub fn as_label(&self) -> &'static str {
		match self {
			SupervisorError::Configuration(_) => "configuration",
			SupervisorError::Launch { .. } => "launch_failed",
			SupervisorError::System(e) => e.as_label(),
		}
	}

	/// Only launch failures are worth another attempt.
	pub fn is_retryable(&self) -> bool {
		matches!(self, SupervisorError::Launch { .. })
	}
}
