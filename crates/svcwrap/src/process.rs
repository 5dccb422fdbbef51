use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use svcwrap_core::{Priority, ServiceConfiguration};
use tokio::process::{Child, Command};

use crate::error::{SupervisorError, SystemError};
use crate::prepare::Environment;

/// One launched process, leading its own process group so the whole tree
/// can be signalled at once.
pub struct ChildProcess {
	what: &'static str,
	child: Child,
	pid: u32,
	exit: Option<ExitStatus>,
}

/// The live processes of one incarnation: the startup command and, while
/// startup synchronization runs, the wait-command.
pub struct ProcessRecord {
	pub command: ChildProcess,
	pub waiter: Option<ChildProcess>,
}

impl ProcessRecord {
	pub fn launch(config: &ServiceConfiguration, env: &Environment) -> Result<Self, SupervisorError> {
		Ok(Self {
			command: ChildProcess::spawn_startup(config, env)?,
			waiter: None,
		})
	}

	pub fn pid(&self) -> u32 {
		self.command.pid()
	}
}

impl ChildProcess {
	/// The startup command runs directly, with its argument list and priority.
	pub fn spawn_startup(
		config: &ServiceConfiguration,
		env: &Environment,
	) -> Result<Self, SupervisorError> {
		let mut cmd = Command::new(&config.startup_command);
		cmd.args(&config.arguments);
		let child = Self::spawn("startup", cmd, config, env, config.command_line())?;
		set_priority(child.pid, config.priority);
		Ok(child)
	}

	/// Wait and shutdown commands are command lines handed to `sh -c`.
	pub fn spawn_shell(
		what: &'static str,
		command_line: &str,
		config: &ServiceConfiguration,
		env: &Environment,
	) -> Result<Self, SupervisorError> {
		let mut cmd = Command::new("sh");
		cmd.args(["-c", command_line]);
		Self::spawn(what, cmd, config, env, command_line.to_string())
	}

	fn spawn(
		what: &'static str,
		mut cmd: Command,
		config: &ServiceConfiguration,
		env: &Environment,
		shown: String,
	) -> Result<Self, SupervisorError> {
		cmd.env_clear()
			.envs(env.iter().map(|(k, v)| (k, v)))
			.stdin(if config.start_minimised { Stdio::null() } else { Stdio::inherit() })
			// Own process group so the tree can be killed as a whole
			.process_group(0);
		if config.start_in_new_window {
			cmd.stdout(Stdio::null()).stderr(Stdio::null());
		}
		if let Some(ref dir) = config.startup_dir {
			cmd.current_dir(dir);
		}

		let launch_error = |source: std::io::Error| SupervisorError::Launch {
			what,
			command: shown.clone(),
			source,
		};
		let child = cmd.spawn().map_err(launch_error)?;
		let pid = child.id().ok_or_else(|| {
			launch_error(std::io::Error::other("process exited before its pid was read"))
		})?;
		tracing::info!("launched {} command `{}` (pid {})", what, shown, pid);

		Ok(Self {
			what,
			child,
			pid,
			exit: None,
		})
	}

	pub fn pid(&self) -> u32 {
		self.pid
	}

	/// Waits for exit. Cancel-safe, so it can sit in a `select!`.
	pub async fn wait(&mut self) -> Result<ExitStatus, SystemError> {
		if let Some(status) = self.exit {
			return Ok(status);
		}
		let status = self.child.wait().await.map_err(|source| SystemError::Wait {
			what: self.what,
			source,
		})?;
		self.exit = Some(status);
		Ok(status)
	}

	/// `None` if the process is still alive once `timeout` has passed.
	pub async fn wait_timeout(
		&mut self,
		timeout: Duration,
	) -> Result<Option<ExitStatus>, SystemError> {
		match tokio::time::timeout(timeout, self.wait()).await {
			Ok(status) => status.map(Some),
			Err(_) => Ok(None),
		}
	}

	pub fn is_alive(&mut self) -> Result<bool, SystemError> {
		if self.exit.is_some() {
			return Ok(false);
		}
		match self.child.try_wait() {
			Ok(Some(status)) => {
				self.exit = Some(status);
				Ok(false)
			}
			Ok(None) => Ok(true),
			Err(source) => Err(SystemError::Wait { what: self.what, source }),
		}
	}

	/// Graceful close request: SIGTERM to the whole process group.
	pub fn request_close(&mut self) -> Result<(), SystemError> {
		if !self.is_alive()? {
			return Ok(());
		}
		tracing::info!("asking {} process group {} to close", self.what, self.pid);
		self.signal_group(Signal::SIGTERM)
	}

	/// SIGKILL to the whole process group, then reap.
	pub async fn terminate(&mut self) -> Result<ExitStatus, SystemError> {
		if let Some(status) = self.exit {
			return Ok(status);
		}
		tracing::warn!("force-terminating {} process group {}", self.what, self.pid);
		self.signal_group(Signal::SIGKILL)?;
		self.wait().await
	}

	/// SIGKILL to whatever is left of the process group, even after the
	/// leader has exited. Descendants that ignored the close request die here.
	pub fn kill_group(&self) -> Result<(), SystemError> {
		self.signal_group(Signal::SIGKILL)
	}

	fn signal_group(&self, signal: Signal) -> Result<(), SystemError> {
		match killpg(Pid::from_raw(self.pid as i32), signal) {
			// group already gone
			Ok(()) | Err(Errno::ESRCH) => Ok(()),
			Err(source) => Err(SystemError::Kill {
				pgid: self.pid,
				signal,
				source,
			}),
		}
	}
}

impl Drop for ChildProcess {
	fn drop(&mut self) {
		if self.exit.is_none() {
			let _ = killpg(Pid::from_raw(self.pid as i32), Signal::SIGKILL);
		}
	}
}

/// Whether any process with this pid exists.
pub fn pid_alive(pid: u32) -> bool {
	!matches!(kill(Pid::from_raw(pid as i32), None), Err(Errno::ESRCH))
}

fn set_priority(pid: u32, priority: Priority) {
	if priority == Priority::Normal {
		return;
	}
	// SAFETY: setpriority only reads its integer arguments.
	let rc = unsafe {
		nix::libc::setpriority(
			nix::libc::PRIO_PROCESS,
			pid as nix::libc::id_t,
			priority.nice(),
		)
	};
	if rc != 0 {
		tracing::warn!(
			"could not set {:?} priority (nice {}) on pid {}: {}",
			priority,
			priority.nice(),
			pid,
			Errno::last()
		);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn env() -> Environment {
		crate::prepare::build_environment(std::env::vars_os(), &[]).unwrap()
	}

	#[tokio::test]
	async fn missing_binary_is_a_launch_error() {
		let config = ServiceConfiguration::new("t", "/definitely/not/here");
		let err = ChildProcess::spawn_startup(&config, &env()).err().unwrap();
		assert!(err.is_retryable());
	}

	#[tokio::test]
	async fn terminate_kills_the_group() {
		let config = ServiceConfiguration::new("t", "sh");
		let mut child = ChildProcess::spawn_shell("test", "sleep 60 & sleep 60", &config, &env())
			.unwrap();
		let pid = child.pid();
		assert!(child.is_alive().unwrap());
		let status = child.terminate().await.unwrap();
		assert!(!status.success());
		assert!(!child.is_alive().unwrap());
		assert!(!pid_alive(pid));
	}

	#[tokio::test]
	async fn wait_timeout_reports_still_running() {
		let config = ServiceConfiguration::new("t", "sh");
		let mut child = ChildProcess::spawn_shell("test", "sleep 60", &config, &env()).unwrap();
		assert!(child.wait_timeout(Duration::from_millis(100)).await.unwrap().is_none());
		child.request_close().unwrap();
		let status = child.wait_timeout(Duration::from_secs(5)).await.unwrap();
		assert!(status.is_some());
	}

	#[tokio::test]
	async fn kill_group_reaches_descendants_after_the_leader_exits() {
		let dir = tempfile::tempdir().unwrap();
		let mut config = ServiceConfiguration::new("t", "sh");
		config.startup_dir = Some(dir.path().to_path_buf());
		let mut child = ChildProcess::spawn_shell(
			"test",
			"(trap '' TERM; exec sleep 60) & echo $! > straggler.pid",
			&config,
			&env(),
		)
		.unwrap();
		assert!(child.wait().await.unwrap().success());
		let straggler: u32 = std::fs::read_to_string(dir.path().join("straggler.pid"))
			.unwrap()
			.trim()
			.parse()
			.unwrap();
		assert!(pid_alive(straggler));

		child.kill_group().unwrap();
		assert!(wait_until_gone(straggler).await);
		// nothing left to signal
		child.kill_group().unwrap();
	}

	/// Zombies count as gone: an orphan is reaped by init on its own schedule.
	fn running(pid: u32) -> bool {
		match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
			Ok(stat) => !stat
				.rsplit(')')
				.next()
				.is_some_and(|rest| rest.trim_start().starts_with('Z')),
			Err(_) => pid_alive(pid),
		}
	}

	async fn wait_until_gone(pid: u32) -> bool {
		for _ in 0..100 {
			if !running(pid) {
				return true;
			}
			tokio::time::sleep(Duration::from_millis(50)).await;
		}
		false
	}

	#[tokio::test]
	async fn environment_and_directory_are_applied() {
		let dir = tempfile::tempdir().unwrap();
		let mut config = ServiceConfiguration::new("t", "sh");
		config.startup_dir = Some(dir.path().to_path_buf());
		let env = crate::prepare::build_environment(
			std::env::vars_os(),
			&[("SVCWRAP_TEST_VALUE".into(), "hello".into())],
		)
		.unwrap();
		let mut child = ChildProcess::spawn_shell(
			"test",
			"printf '%s' \"$SVCWRAP_TEST_VALUE\" > out.txt",
			&config,
			&env,
		)
		.unwrap();
		assert!(child.wait().await.unwrap().success());
		assert_eq!(std::fs::read_to_string(dir.path().join("out.txt")).unwrap(), "hello");
	}
}
