use crate::types::StatusSnapshot;
use serde::{Deserialize, Serialize};

/// Requests accepted on a running supervisor's control socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Request {
	Ping,
	Status,
	Stop,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
	Pong,
	Status { snapshot: StatusSnapshot },
	Ok { message: Option<String> },
	Error { message: String },
}

pub const APP_NAME: &str = "svcwrap";

pub fn state_dir() -> std::path::PathBuf {
	if let Ok(dir) = std::env::var("XDG_STATE_HOME") {
		std::path::PathBuf::from(dir).join(APP_NAME)
	} else if let Some(home) = home_dir() {
		home.join(".local").join("state").join(APP_NAME)
	} else {
		std::path::PathBuf::from("/tmp").join(APP_NAME)
	}
}

pub fn config_dir() -> std::path::PathBuf {
	if let Ok(dir) = std::env::var("XDG_CONFIG_HOME") {
		std::path::PathBuf::from(dir).join(APP_NAME)
	} else if let Some(home) = home_dir() {
		home.join(".config").join(APP_NAME)
	} else {
		std::path::PathBuf::from("/tmp").join(APP_NAME).join("config")
	}
}

fn home_dir() -> Option<std::path::PathBuf> {
	std::env::var("HOME").ok().map(std::path::PathBuf::from)
}
