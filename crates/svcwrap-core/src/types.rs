use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigurationError;

pub const DEFAULT_WAIT_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_RESTART_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownMethod {
	/// Force-terminate the process tree straight away.
	#[default]
	Kill,
	/// Run the configured shutdown command, then escalate.
	Command,
	/// Ask the process group to close (SIGTERM), then escalate after the wait interval.
	#[serde(alias = "winmessage")]
	WindowMessage,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
	Idle,
	#[default]
	Normal,
	High,
	#[serde(alias = "real")]
	Realtime,
}

impl Priority {
	/// Nice value applied to the launched process.
	pub fn nice(self) -> i32 {
		match self {
			Priority::Idle => 19,
			Priority::Normal => 0,
			Priority::High => -10,
			Priority::Realtime => -20,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriveTarget {
	Local(PathBuf),
	/// `//host/share[/path]`
	Network(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveMapping {
	pub letter: char,
	pub target: DriveTarget,
}

impl std::fmt::Display for DriveMapping {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match &self.target {
			DriveTarget::Local(path) => write!(f, "{}: -> {}", self.letter, path.display()),
			DriveTarget::Network(path) => write!(f, "{}: -> {}", self.letter, path),
		}
	}
}

/// Everything needed to supervise one command. Built once and owned by a
/// single supervisor for its whole lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfiguration {
	pub name: String,
	pub startup_command: String,
	pub arguments: Vec<String>,
	pub wait_command: Option<String>,
	pub shutdown_command: Option<String>,
	pub shutdown_method: ShutdownMethod,
	pub priority: Priority,
	pub startup_dir: Option<PathBuf>,
	pub startup_delay: Duration,
	pub wait_interval: Duration,
	pub auto_restart: bool,
	pub restart_interval: Duration,
	pub start_minimised: bool,
	pub start_in_new_window: bool,
	pub environment: Vec<(String, String)>,
	pub drives: Vec<DriveMapping>,
}

impl ServiceConfiguration {
	pub fn new(name: impl Into<String>, startup_command: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			startup_command: startup_command.into(),
			arguments: Vec::new(),
			wait_command: None,
			shutdown_command: None,
			shutdown_method: ShutdownMethod::default(),
			priority: Priority::default(),
			startup_dir: None,
			startup_delay: Duration::ZERO,
			wait_interval: DEFAULT_WAIT_INTERVAL,
			auto_restart: false,
			restart_interval: DEFAULT_RESTART_INTERVAL,
			start_minimised: false,
			start_in_new_window: false,
			environment: Vec::new(),
			drives: Vec::new(),
		}
	}

	pub fn validate(&self) -> Result<(), ConfigurationError> {
		if self.startup_command.trim().is_empty() {
			return Err(ConfigurationError::MissingStartupCommand);
		}
		if self.shutdown_method == ShutdownMethod::Command
			&& self.shutdown_command.as_deref().map_or(true, |c| c.trim().is_empty())
		{
			return Err(ConfigurationError::MissingShutdownCommand);
		}
		for (name, _) in &self.environment {
			if name.is_empty() || name.contains('=') || name.contains('\0') {
				return Err(ConfigurationError::InvalidEnvironment { name: name.clone() });
			}
		}
		let mut seen = HashSet::new();
		for drive in &self.drives {
			if !drive.letter.is_ascii_alphabetic() {
				return Err(ConfigurationError::InvalidDriveLetter(drive.letter));
			}
			if !seen.insert(drive.letter.to_ascii_uppercase()) {
				return Err(ConfigurationError::DuplicateDrive(drive.letter));
			}
		}
		Ok(())
	}

	/// The startup command line as it would be typed, for logs and status.
	pub fn command_line(&self) -> String {
		let mut line = self.startup_command.clone();
		for arg in &self.arguments {
			line.push(' ');
			if arg.contains(char::is_whitespace) {
				line.push('"');
				line.push_str(arg);
				line.push('"');
			} else {
				line.push_str(arg);
			}
		}
		line
	}
}

/// Statuses reported to the host service manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScmStatus {
	Initialising,
	Starting,
	Running,
	Stopping,
	Stopped,
	MustStartAsConsole,
	Failed,
}

impl ScmStatus {
	pub fn is_terminal(self) -> bool {
		matches!(
			self,
			ScmStatus::Stopped | ScmStatus::Failed | ScmStatus::MustStartAsConsole
		)
	}

	pub fn as_str(self) -> &'static str {
		match self {
			ScmStatus::Initialising => "initialising",
			ScmStatus::Starting => "starting",
			ScmStatus::Running => "running",
			ScmStatus::Stopping => "stopping",
			ScmStatus::Stopped => "stopped",
			ScmStatus::MustStartAsConsole => "must_start_as_console",
			ScmStatus::Failed => "failed",
		}
	}
}

impl std::fmt::Display for ScmStatus {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
	pub service: String,
	pub status: ScmStatus,
	pub pid: Option<u32>,
	pub incarnation: u32,
}
