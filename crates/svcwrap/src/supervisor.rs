use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use svcwrap_core::config::DriveRoots;
use svcwrap_core::{ScmStatus, ServiceConfiguration, ShutdownMethod};
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;

use crate::bridge::StatusBridge;
use crate::delay::DelayTimer;
use crate::error::SupervisorError;
use crate::prepare::{apply_drive_mappings, build_environment, Environment};
use crate::process::{ChildProcess, ProcessRecord};

const MIN_HEARTBEAT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
	/// The command exited on its own and was not restarted.
	Completed,
	/// A stop request ended the run.
	StoppedByRequest,
	/// No service manager is present; the caller should run in console mode.
	MustStartAsConsole,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
	pub outcome: RunOutcome,
	pub incarnations: u32,
	/// Shutdown ended with SIGKILL rather than a clean exit.
	pub forced_termination: bool,
}

#[derive(Debug)]
pub enum WatchOutcome {
	Completed(ExitStatus),
	StoppedByRequest,
}

#[derive(Debug)]
enum Startup {
	Ready,
	Exited(ExitStatus),
	StopRequested,
}

#[derive(Debug)]
enum Incarnation {
	Completed(ExitStatus),
	StoppedByRequest { forced: bool },
}

/// Runs one configured command through successive incarnations until it
/// completes, is stopped, or fails.
pub struct Supervisor {
	config: ServiceConfiguration,
	bridge: Arc<StatusBridge>,
	roots: DriveRoots,
	timer: DelayTimer,
	incarnations: u32,
}

impl Supervisor {
	pub fn new(config: ServiceConfiguration, bridge: Arc<StatusBridge>) -> Self {
		let timer = DelayTimer::new(bridge.stop_signal());
		Self {
			config,
			bridge,
			roots: DriveRoots::default(),
			timer,
			incarnations: 0,
		}
	}

	pub fn with_drive_roots(mut self, roots: DriveRoots) -> Self {
		self.roots = roots;
		self
	}

	/// Supervises until the run ends. Any error has already been reported to
	/// the host as FAILED (best effort) by the time it is returned.
	pub async fn start(&mut self) -> Result<RunSummary, SupervisorError> {
		if self.bridge.status() == ScmStatus::MustStartAsConsole {
			tracing::warn!("{}: not started by a service manager", self.config.name);
			return Ok(self.summary(RunOutcome::MustStartAsConsole, false));
		}

		match self.supervise().await {
			Ok(summary) => {
				tracing::info!(
					"{}: finished after {} incarnation(s) ({:?})",
					self.config.name,
					summary.incarnations,
					summary.outcome
				);
				Ok(summary)
			}
			Err(e) => {
				tracing::error!(kind = e.as_label(), "{}: {}", self.config.name, e);
				self.bridge.set_pid(None);
				let _ = self.bridge.notify(ScmStatus::Failed, true);
				Err(e)
			}
		}
	}

	async fn supervise(&mut self) -> Result<RunSummary, SupervisorError> {
		self.bridge.notify(ScmStatus::Initialising, false)?;
		self.config.validate()?;

		loop {
			if self.bridge.stop_requested() {
				self.bridge.notify(ScmStatus::Stopping, false)?;
				self.bridge.notify(ScmStatus::Stopped, false)?;
				return Ok(self.summary(RunOutcome::StoppedByRequest, false));
			}

			self.incarnations += 1;
			self.bridge.set_incarnation(self.incarnations);
			if self.bridge.status() != ScmStatus::Starting {
				self.bridge.notify(ScmStatus::Starting, false)?;
			}
			tracing::info!(
				"{}: incarnation {}: {}",
				self.config.name,
				self.incarnations,
				self.config.command_line()
			);

			match self.run_incarnation().await {
				Ok(Incarnation::StoppedByRequest { forced }) => {
					return Ok(self.summary(RunOutcome::StoppedByRequest, forced));
				}
				Ok(Incarnation::Completed(status)) => {
					tracing::info!("{}: command exited ({})", self.config.name, status);
					if !self.config.auto_restart {
						self.bridge.notify(ScmStatus::Stopped, false)?;
						return Ok(self.summary(RunOutcome::Completed, false));
					}
					self.bridge.notify(ScmStatus::Starting, false)?;
				}
				Err(e) if e.is_retryable() && self.config.auto_restart => {
					tracing::warn!(
						"{}: {}; retrying in {}ms",
						self.config.name,
						e,
						self.config.restart_interval.as_millis()
					);
				}
				Err(e) => return Err(e),
			}

			if !self.timer.sleep(self.config.restart_interval, "auto-restart").await {
				self.bridge.notify(ScmStatus::Stopping, false)?;
				self.bridge.notify(ScmStatus::Stopped, false)?;
				return Ok(self.summary(RunOutcome::StoppedByRequest, false));
			}
		}
	}

	async fn run_incarnation(&self) -> Result<Incarnation, SupervisorError> {
		apply_drive_mappings(&self.config.drives, &self.roots)?;
		let env = build_environment(std::env::vars_os(), &self.config.environment)?;
		let mut record = ProcessRecord::launch(&self.config, &env)?;
		self.bridge.set_pid(Some(record.pid()));

		let result = self.drive(&mut record, &env).await;
		if result.is_err() {
			if let Err(e) = record.command.terminate().await {
				tracing::warn!("{}: cleanup after failure: {}", self.config.name, e);
			}
		}
		self.bridge.set_pid(None);
		result
	}

	async fn drive(
		&self,
		record: &mut ProcessRecord,
		env: &Environment,
	) -> Result<Incarnation, SupervisorError> {
		let stop = self.bridge.stop_signal();

		match self.wait_for_startup(record, env, &stop).await? {
			Startup::Ready => {}
			Startup::Exited(status) => {
				tracing::warn!("{}: command exited during startup", self.config.name);
				return Ok(Incarnation::Completed(status));
			}
			Startup::StopRequested => {
				let forced = self.kill_command(record, env).await?;
				return Ok(Incarnation::StoppedByRequest { forced });
			}
		}

		self.bridge.notify(ScmStatus::Running, false)?;
		match self.watch_command(record, &stop).await? {
			WatchOutcome::Completed(status) => Ok(Incarnation::Completed(status)),
			WatchOutcome::StoppedByRequest => {
				let forced = self.kill_command(record, env).await?;
				Ok(Incarnation::StoppedByRequest { forced })
			}
		}
	}

	/// Holds back RUNNING until the wait-command exits or the startup delay
	/// has elapsed, heartbeating the host meanwhile.
	async fn wait_for_startup(
		&self,
		record: &mut ProcessRecord,
		env: &Environment,
		stop: &CancellationToken,
	) -> Result<Startup, SupervisorError> {
		let period = self.config.wait_interval.max(MIN_HEARTBEAT);
		let mut heartbeat = interval_at(Instant::now() + period, period);
		let ProcessRecord { command, waiter } = record;

		let Some(ref line) = self.config.wait_command else {
			let delay = self.timer.sleep(self.config.startup_delay, "startup delay");
			tokio::pin!(delay);
			loop {
				tokio::select! {
					elapsed = &mut delay => {
						return Ok(if elapsed { Startup::Ready } else { Startup::StopRequested });
					}
					status = command.wait() => return Ok(Startup::Exited(status?)),
					_ = heartbeat.tick() => self.bridge.heartbeat(period * 2),
				}
			}
		};

		let waiter = waiter.insert(ChildProcess::spawn_shell("wait", line, &self.config, env)?);
		loop {
			tokio::select! {
				status = waiter.wait() => {
					// exit code is not interpreted
					tracing::info!("{}: wait command finished ({})", self.config.name, status?);
					return Ok(Startup::Ready);
				}
				status = command.wait() => {
					let status = status?;
					waiter.terminate().await?;
					return Ok(Startup::Exited(status));
				}
				_ = stop.cancelled() => {
					waiter.terminate().await?;
					return Ok(Startup::StopRequested);
				}
				_ = heartbeat.tick() => self.bridge.heartbeat(period * 2),
			}
		}
	}

	/// Races the command's exit against a stop request.
	pub async fn watch_command(
		&self,
		record: &mut ProcessRecord,
		stop: &CancellationToken,
	) -> Result<WatchOutcome, SupervisorError> {
		tokio::select! {
			status = record.command.wait() => Ok(WatchOutcome::Completed(status?)),
			_ = stop.cancelled() => Ok(WatchOutcome::StoppedByRequest),
		}
	}

	/// Shuts the command down by the configured method, escalating to a
	/// forced kill when it outlives the wait interval. Returns whether the
	/// kill was forced.
	pub async fn kill_command(
		&self,
		record: &mut ProcessRecord,
		env: &Environment,
	) -> Result<bool, SupervisorError> {
		self.bridge.notify(ScmStatus::Stopping, false)?;
		let command = &mut record.command;

		let forced = match self.config.shutdown_method {
			ShutdownMethod::Kill => {
				let alive = command.is_alive()?;
				command.terminate().await?;
				alive
			}
			ShutdownMethod::Command => {
				let launched = match self.config.shutdown_command.as_deref() {
					Some(line) => ChildProcess::spawn_shell("shutdown", line, &self.config, env),
					None => Err(SupervisorError::from(
						svcwrap_core::ConfigurationError::MissingShutdownCommand,
					)),
				};
				match launched {
					Ok(mut shutdown) => {
						let status = shutdown.wait().await?;
						tracing::info!("{}: shutdown command finished ({})", self.config.name, status);
						self.escalate(command).await?
					}
					Err(e) => {
						tracing::error!("{}: {}; terminating instead", self.config.name, e);
						let alive = command.is_alive()?;
						command.terminate().await?;
						alive
					}
				}
			}
			ShutdownMethod::WindowMessage => {
				command.request_close()?;
				self.escalate(command).await?
			}
		};
		// the leader may be gone while descendants that ignored the close
		// request still hold the group
		command.kill_group()?;

		self.bridge.notify(ScmStatus::Stopped, false)?;
		Ok(forced)
	}

	async fn escalate(&self, command: &mut ChildProcess) -> Result<bool, SupervisorError> {
		let grace = self.config.wait_interval;
		match command.wait_timeout(grace).await? {
			Some(status) => {
				tracing::info!("{}: command exited ({})", self.config.name, status);
				Ok(false)
			}
			None => {
				tracing::warn!(
					"{}: still running {}ms after shutdown request",
					self.config.name,
					grace.as_millis()
				);
				command.terminate().await?;
				Ok(true)
			}
		}
	}

	fn summary(&self, outcome: RunOutcome, forced_termination: bool) -> RunSummary {
		RunSummary {
			outcome,
			incarnations: self.incarnations,
			forced_termination,
		}
	}
}
