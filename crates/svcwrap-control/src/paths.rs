use std::path::{Path, PathBuf};

/// Where a running supervisor publishes its socket and pid file.
#[derive(Debug, Clone)]
pub struct ControlPaths {
	pub service: String,
	state_dir: PathBuf,
}

impl ControlPaths {
	pub fn new(service: impl Into<String>) -> Self {
		Self::in_dir(svcwrap_core::protocol::state_dir(), service)
	}

	pub fn in_dir(state_dir: impl Into<PathBuf>, service: impl Into<String>) -> Self {
		Self {
			service: service.into(),
			state_dir: state_dir.into(),
		}
	}

	pub fn state_dir(&self) -> &Path {
		&self.state_dir
	}

	pub fn socket_path(&self) -> PathBuf {
		self.state_dir.join(format!("{}.sock", self.service))
	}

	pub fn pid_path(&self) -> PathBuf {
		self.state_dir.join(format!("{}.pid", self.service))
	}
}
