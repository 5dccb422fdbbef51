use std::time::{Duration, Instant};

use owo_colors::OwoColorize;
use svcwrap_control::client::{self, ClientError, ControlClient};
use svcwrap_control::ControlPaths;
use svcwrap_core::protocol::{Request, Response};
use svcwrap_core::{ScmStatus, StatusSnapshot};

use crate::{EXIT_FAILURE, EXIT_OK};

fn request(paths: &ControlPaths, request: Request) -> Result<Response, ClientError> {
	ControlClient::<Request, Response>::connect(paths)?.send(&request)
}

pub fn cmd_status(name: &str, json: bool) -> i32 {
	let paths = ControlPaths::new(name);
	match request(&paths, Request::Status) {
		Ok(Response::Status { snapshot }) => {
			if json {
				match serde_json::to_string_pretty(&snapshot) {
					Ok(text) => println!("{}", text),
					Err(e) => {
						eprintln!("{} {}", "error:".red().bold(), e);
						return EXIT_FAILURE;
					}
				}
			} else {
				println!("{}", status_line(&snapshot));
			}
			EXIT_OK
		}
		Ok(Response::Error { message }) => {
			eprintln!("{} {}", "error:".red().bold(), message);
			EXIT_FAILURE
		}
		Ok(other) => {
			tracing::warn!("unexpected reply: {:?}", other);
			EXIT_FAILURE
		}
		Err(ClientError::NotRunning(_)) => {
			println!("{} {:<12} {}", "○".dimmed(), name, "not running".dimmed());
			EXIT_FAILURE
		}
		Err(e) => {
			eprintln!("{} {}", "error:".red().bold(), e);
			EXIT_FAILURE
		}
	}
}

fn status_line(snapshot: &StatusSnapshot) -> String {
	let (circle, label) = match snapshot.status {
		ScmStatus::Running => ("●".green().to_string(), "running".green().to_string()),
		ScmStatus::Initialising | ScmStatus::Starting => {
			("●".yellow().to_string(), snapshot.status.yellow().to_string())
		}
		ScmStatus::Stopping => ("●".yellow().to_string(), "stopping".yellow().to_string()),
		ScmStatus::Failed => ("●".red().to_string(), "failed".red().to_string()),
		ScmStatus::Stopped | ScmStatus::MustStartAsConsole => {
			("○".dimmed().to_string(), snapshot.status.dimmed().to_string())
		}
	};
	let pid = snapshot
		.pid
		.map(|p| p.to_string())
		.unwrap_or_else(|| "-".to_string());
	format!(
		"{} {:<12} {:<10} pid {:<8} incarnation {}",
		circle, snapshot.service, label, pid, snapshot.incarnation
	)
}

pub fn cmd_stop(name: &str, timeout: Duration) -> i32 {
	let paths = ControlPaths::new(name);
	match request(&paths, Request::Stop) {
		Ok(Response::Ok { message }) => {
			if let Some(msg) = message {
				eprintln!("{}", msg);
			}
		}
		Ok(Response::Error { message }) => {
			eprintln!("{} {}", "error:".red().bold(), message);
			return EXIT_FAILURE;
		}
		Ok(other) => {
			tracing::warn!("unexpected reply: {:?}", other);
			return EXIT_FAILURE;
		}
		Err(ClientError::NotRunning(_)) => {
			eprintln!("{}: not running", name);
			return EXIT_OK;
		}
		Err(e) => {
			eprintln!("{} {}", "error:".red().bold(), e);
			return EXIT_FAILURE;
		}
	}

	// the socket goes away once the supervisor has finished shutting down
	let started = Instant::now();
	while client::is_running(&paths) {
		if started.elapsed() >= timeout {
			eprintln!(
				"{} {} still stopping after {}s",
				"warning:".yellow().bold(),
				name,
				timeout.as_secs()
			);
			return EXIT_FAILURE;
		}
		std::thread::sleep(Duration::from_millis(100));
	}
	eprintln!("{}: stopped", name);
	EXIT_OK
}
