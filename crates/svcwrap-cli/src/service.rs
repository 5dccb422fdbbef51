use std::sync::Arc;

use owo_colors::OwoColorize;
use svcwrap::{RunOutcome, RunSummary, StatusBridge, StopContext, StopRequest, StopTrigger, Supervisor, SupervisorError};
use svcwrap_control::{ControlPaths, ControlServer, ServerError};
use svcwrap_core::config::{DriveRoots, ServiceFile};
use svcwrap_core::protocol::{Request, Response};
use svcwrap_core::{ScmStatus, ServiceConfiguration};
use thiserror::Error;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use crate::{EXIT_CONFIG, EXIT_FAILURE, EXIT_MUST_START_AS_CONSOLE, EXIT_OK};

#[derive(Debug, Clone, Copy)]
pub enum Mode {
	Service { console_fallback: bool },
	Console,
}

#[derive(Error, Debug)]
enum RunError {
	#[error(transparent)]
	Supervisor(#[from] SupervisorError),
	#[error("control socket: {0}")]
	Control(#[from] ServerError),
}

struct StopNotice {
	service: String,
	interactive: bool,
}

pub async fn run(file: &ServiceFile, name: &str, mode: Mode) -> i32 {
	let config = match file.service(name) {
		Ok(config) => config,
		Err(e) => {
			eprintln!("{} {}", "error:".red().bold(), e);
			return EXIT_CONFIG;
		}
	};
	let roots = file.drive_roots();

	let bridge = match mode {
		Mode::Console => StatusBridge::detached(name),
		Mode::Service { .. } => StatusBridge::connect(name, false),
	};
	let interactive = matches!(mode, Mode::Console);

	let paths = ControlPaths::new(name);
	match supervise(config.clone(), Arc::new(bridge), roots.clone(), &paths, interactive).await {
		Ok(summary) if summary.outcome == RunOutcome::MustStartAsConsole => match mode {
			Mode::Service { console_fallback: true } => {
				tracing::warn!("{}: no service manager found, running in console mode", name);
				let bridge = Arc::new(StatusBridge::detached(name));
				exit_code(supervise(config, bridge, roots, &paths, true).await)
			}
			_ => {
				eprintln!(
					"{} {} must be started from a service manager (NOTIFY_SOCKET is not set)",
					"error:".red().bold(),
					name
				);
				EXIT_MUST_START_AS_CONSOLE
			}
		},
		result => exit_code(result),
	}
}

async fn supervise(
	config: ServiceConfiguration,
	bridge: Arc<StatusBridge>,
	roots: DriveRoots,
	paths: &ControlPaths,
	interactive: bool,
) -> Result<RunSummary, RunError> {
	let name = config.name.clone();
	let mut supervisor = Supervisor::new(config, Arc::clone(&bridge)).with_drive_roots(roots);
	if bridge.status() == ScmStatus::MustStartAsConsole {
		return Ok(supervisor.start().await?);
	}

	let context: StopContext = Arc::new(StopNotice {
		service: name,
		interactive,
	});
	bridge.install_stop_callback(StopRequest::callback(announce_stop, context));
	let trigger = bridge.trigger();

	let server = match ControlServer::bind(paths) {
		Ok(server) => server,
		Err(e) => {
			// the host is still waiting to hear how startup went
			let _ = bridge.notify(ScmStatus::Failed, true);
			return Err(e.into());
		}
	};
	let shutdown = CancellationToken::new();
	let control = {
		let bridge = Arc::clone(&bridge);
		let trigger = trigger.clone();
		tokio::spawn(server.serve(
			move |req: Request| {
				let response = handle_request(&bridge, &trigger, req);
				async move { response }
			},
			|message| Response::Error { message },
			shutdown.clone(),
		))
	};
	let signals = tokio::spawn(forward_signals(trigger));

	let result = supervisor.start().await;

	shutdown.cancel();
	signals.abort();
	let _ = control.await;
	Ok(result?)
}

fn handle_request(bridge: &StatusBridge, trigger: &StopTrigger, request: Request) -> Response {
	match request {
		Request::Ping => Response::Pong,
		Request::Status => Response::Status {
			snapshot: bridge.snapshot(),
		},
		Request::Stop if bridge.stop_requested() => Response::Ok {
			message: Some(format!("{}: already stopping", bridge.service())),
		},
		Request::Stop => {
			trigger.fire();
			Response::Ok {
				message: Some(format!("{}: stopping", bridge.service())),
			}
		}
	}
}

fn announce_stop(context: &StopContext) {
	let Some(notice) = context.downcast_ref::<StopNotice>() else {
		return;
	};
	if notice.interactive {
		eprintln!("{} {}", "stopping".yellow().bold(), notice.service);
	} else {
		tracing::info!("{}: stop requested", notice.service);
	}
}

async fn forward_signals(trigger: StopTrigger) {
	let mut term = match signal(SignalKind::terminate()) {
		Ok(term) => term,
		Err(e) => {
			tracing::warn!("cannot listen for SIGTERM: {}", e);
			return;
		}
	};
	tokio::select! {
		_ = term.recv() => tracing::debug!("received SIGTERM"),
		_ = tokio::signal::ctrl_c() => tracing::debug!("received SIGINT"),
	}
	trigger.fire();
}

fn exit_code(result: Result<RunSummary, RunError>) -> i32 {
	match result {
		Ok(_) => EXIT_OK,
		// already logged by the supervisor
		Err(RunError::Supervisor(SupervisorError::Configuration(_))) => EXIT_CONFIG,
		Err(RunError::Supervisor(_)) => EXIT_FAILURE,
		Err(e) => {
			eprintln!("{} {}", "error:".red().bold(), e);
			EXIT_FAILURE
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn control_requests_reach_the_bridge() {
		let bridge = StatusBridge::detached("web");
		bridge.set_pid(Some(31));
		let trigger = bridge.trigger();

		assert_eq!(handle_request(&bridge, &trigger, Request::Ping), Response::Pong);
		match handle_request(&bridge, &trigger, Request::Status) {
			Response::Status { snapshot } => {
				assert_eq!(snapshot.service, "web");
				assert_eq!(snapshot.pid, Some(31));
			}
			other => panic!("unexpected {:?}", other),
		}

		assert_eq!(
			handle_request(&bridge, &trigger, Request::Stop),
			Response::Ok { message: Some("web: stopping".into()) }
		);
		assert!(bridge.stop_requested());
		assert_eq!(
			handle_request(&bridge, &trigger, Request::Stop),
			Response::Ok { message: Some("web: already stopping".into()) }
		);
	}

	#[tokio::test]
	async fn control_socket_in_use_reports_failed() {
		let dir = tempfile::Builder::new().prefix("svc").tempdir_in("/tmp").unwrap();
		let paths = ControlPaths::in_dir(dir.path(), "web");
		let _first = ControlServer::bind(&paths).unwrap();

		let bridge = Arc::new(StatusBridge::detached("web"));
		let mut config = ServiceConfiguration::new("web", "sleep");
		config.arguments = vec!["60".into()];
		let result = supervise(config, Arc::clone(&bridge), DriveRoots::default(), &paths, false).await;

		assert!(matches!(result, Err(RunError::Control(ServerError::AlreadyRunning { .. }))));
		assert_eq!(bridge.status(), ScmStatus::Failed);
		assert_eq!(bridge.snapshot().pid, None);
	}

	#[test]
	fn configuration_errors_map_to_their_own_exit_code() {
		let err = RunError::from(SupervisorError::from(
			svcwrap::ConfigurationError::MissingStartupCommand,
		));
		assert_eq!(exit_code(Err(err)), EXIT_CONFIG);

		let summary = RunSummary {
			outcome: RunOutcome::Completed,
			incarnations: 1,
			forced_termination: false,
		};
		assert_eq!(exit_code(Ok(summary)), EXIT_OK);
	}
}
