//! The host service manager side of the status bridge.
//!
//! [`NotifySocket`] speaks the systemd `sd_notify` datagram protocol on the
//! socket named by `NOTIFY_SOCKET`. Other hosts (and tests) implement
//! [`ServiceHost`] directly.

use std::os::unix::net::UnixDatagram;
use std::time::Duration;

use svcwrap_core::ScmStatus;

use crate::error::HostError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate<'a> {
	pub service: &'a str,
	pub status: ScmStatus,
	pub pid: Option<u32>,
}

pub trait ServiceHost: Send + Sync {
	fn report(&self, update: &StatusUpdate<'_>) -> Result<(), HostError>;

	/// Asks the host for more time before it gives up on startup.
	fn extend_timeout(&self, _by: Duration) -> Result<(), HostError> {
		Ok(())
	}
}

#[derive(Debug, Clone)]
pub struct NotifySocket {
	addr: String,
}

impl NotifySocket {
	pub const ENV: &'static str = "NOTIFY_SOCKET";

	pub fn new(addr: impl Into<String>) -> Self {
		Self { addr: addr.into() }
	}

	/// `None` when the process was not started by a notify-aware manager.
	pub fn from_env() -> Option<Self> {
		std::env::var(Self::ENV)
			.ok()
			.filter(|s| !s.is_empty())
			.map(Self::new)
	}

	pub fn addr(&self) -> &str {
		&self.addr
	}

	fn send(&self, message: &str) -> Result<(), HostError> {
		let err = |source| HostError::Send {
			addr: self.addr.clone(),
			source,
		};
		let socket = UnixDatagram::unbound().map_err(err)?;
		if let Some(name) = self.addr.strip_prefix('@') {
			send_abstract(&socket, name, message).map_err(err)?;
		} else {
			socket.send_to(message.as_bytes(), &self.addr).map_err(err)?;
		}
		Ok(())
	}
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn send_abstract(socket: &UnixDatagram, name: &str, message: &str) -> std::io::Result<()> {
	#[cfg(target_os = "android")]
	use std::os::android::net::SocketAddrExt;
	#[cfg(target_os = "linux")]
	use std::os::linux::net::SocketAddrExt;
	use std::os::unix::net::SocketAddr;

	let addr = SocketAddr::from_abstract_name(name.as_bytes())?;
	socket.send_to_addr(message.as_bytes(), &addr)?;
	Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn send_abstract(_socket: &UnixDatagram, name: &str, _message: &str) -> std::io::Result<()> {
	Err(std::io::Error::new(
		std::io::ErrorKind::Unsupported,
		format!("abstract socket @{} not supported on this platform", name),
	))
}

/// The `sd_notify` payload for a status.
pub fn notify_message(update: &StatusUpdate<'_>) -> String {
	let service = update.service;
	match update.status {
		ScmStatus::Initialising => format!("STATUS={}: initialising", service),
		ScmStatus::Starting => format!("STATUS={}: starting", service),
		ScmStatus::Running => match update.pid {
			Some(pid) => format!("READY=1\nSTATUS={}: running (pid {})", service, pid),
			None => format!("READY=1\nSTATUS={}: running", service),
		},
		ScmStatus::Stopping => format!("STOPPING=1\nSTATUS={}: stopping", service),
		ScmStatus::Stopped => format!("STATUS={}: stopped", service),
		ScmStatus::Failed => format!("STATUS={}: failed", service),
		ScmStatus::MustStartAsConsole => {
			format!("STATUS={}: not running under a service manager", service)
		}
	}
}

impl ServiceHost for NotifySocket {
	fn report(&self, update: &StatusUpdate<'_>) -> Result<(), HostError> {
		self.send(&notify_message(update))
	}

	fn extend_timeout(&self, by: Duration) -> Result<(), HostError> {
		self.send(&format!("EXTEND_TIMEOUT_USEC={}", by.as_micros()))
	}
}
