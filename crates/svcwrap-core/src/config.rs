use crate::error::ConfigError;
use crate::protocol::{config_dir, state_dir};
use crate::types::{DriveMapping, DriveTarget, Priority, ServiceConfiguration, ShutdownMethod};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ── Service file (~/.config/svcwrap/services.toml) ─────────────────────────

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ServiceFile {
	#[serde(default)]
	pub defaults: DefaultsConfig,
	#[serde(default)]
	pub logging: LoggingConfig,
	#[serde(default)]
	pub drives: DrivesConfig,
	#[serde(default)]
	pub services: BTreeMap<String, ServiceSection>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DefaultsConfig {
	#[serde(default = "default_wait_interval")]
	pub wait_interval: u64,
	#[serde(default)]
	pub auto_restart: bool,
	#[serde(default = "default_restart_interval")]
	pub restart_interval: u64,
	#[serde(default)]
	pub shutdown_method: ShutdownMethod,
	#[serde(default)]
	pub priority: Priority,
	#[serde(default)]
	pub env: Vec<String>,
}

impl Default for DefaultsConfig {
	fn default() -> Self {
		Self {
			wait_interval: default_wait_interval(),
			auto_restart: false,
			restart_interval: default_restart_interval(),
			shutdown_method: ShutdownMethod::default(),
			priority: Priority::default(),
			env: Vec::new(),
		}
	}
}

fn default_wait_interval() -> u64 {
	5
}
fn default_restart_interval() -> u64 {
	5
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
	#[serde(default = "default_level")]
	pub level: String,
}

impl Default for LoggingConfig {
	fn default() -> Self {
		Self { level: default_level() }
	}
}

fn default_level() -> String {
	"info".to_string()
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct DrivesConfig {
	/// Directory holding one symlink per mapped drive letter.
	pub root: Option<String>,
	/// Where `//host/share` network paths are mounted locally.
	pub network_root: Option<String>,
}

/// Resolved locations used when applying drive mappings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveRoots {
	pub root: PathBuf,
	pub network_root: PathBuf,
}

impl Default for DriveRoots {
	fn default() -> Self {
		Self {
			root: state_dir().join("drives"),
			network_root: PathBuf::from("/mnt/net"),
		}
	}
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ServiceSection {
	pub startup: Option<String>,
	#[serde(default)]
	pub args: Vec<String>,
	pub wait: Option<String>,
	pub shutdown: Option<String>,
	pub shutdown_method: Option<ShutdownMethod>,
	pub priority: Option<Priority>,
	pub startup_dir: Option<String>,
	pub startup_delay: Option<u64>,
	pub wait_interval: Option<u64>,
	pub auto_restart: Option<bool>,
	pub restart_interval: Option<u64>,
	#[serde(default)]
	pub start_minimised: bool,
	#[serde(default)]
	pub start_in_new_window: bool,
	#[serde(default)]
	pub env: Vec<String>,
	#[serde(default)]
	pub local_drives: Vec<String>,
	#[serde(default)]
	pub network_drives: Vec<String>,
}

pub fn default_config_path() -> PathBuf {
	config_dir().join("services.toml")
}

pub fn load_service_file(path: &Path) -> Result<ServiceFile, ConfigError> {
	let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
		path: path.to_path_buf(),
		source,
	})?;
	parse_service_file(&content, path)
}

pub fn parse_service_file(content: &str, path: &Path) -> Result<ServiceFile, ConfigError> {
	toml::from_str(content).map_err(|source| ConfigError::Parse {
		path: path.to_path_buf(),
		source,
	})
}

impl ServiceFile {
	pub fn service_names(&self) -> Vec<&str> {
		self.services.keys().map(|s| s.as_str()).collect()
	}

	/// Builds and validates the configuration of one service, with
	/// `[defaults]` filling anything the section leaves out.
	pub fn service(&self, name: &str) -> Result<ServiceConfiguration, ConfigError> {
		let section = self
			.services
			.get(name)
			.ok_or_else(|| ConfigError::UnknownService(name.to_string()))?;
		let defaults = &self.defaults;

		let mut config = ServiceConfiguration::new(
			name,
			section.startup.as_deref().map(expand).unwrap_or_default(),
		);
		config.arguments = section.args.iter().map(|a| expand(a)).collect();
		config.wait_command = section.wait.as_deref().map(expand);
		config.shutdown_command = section.shutdown.as_deref().map(expand);
		config.shutdown_method = section.shutdown_method.unwrap_or(defaults.shutdown_method);
		config.priority = section.priority.unwrap_or(defaults.priority);
		config.startup_dir = section.startup_dir.as_deref().map(|d| PathBuf::from(expand(d)));
		config.startup_delay = Duration::from_secs(section.startup_delay.unwrap_or(0));
		config.wait_interval =
			Duration::from_secs(section.wait_interval.unwrap_or(defaults.wait_interval));
		config.auto_restart = section.auto_restart.unwrap_or(defaults.auto_restart);
		config.restart_interval =
			Duration::from_secs(section.restart_interval.unwrap_or(defaults.restart_interval));
		config.start_minimised = section.start_minimised;
		config.start_in_new_window = section.start_in_new_window;

		for entry in defaults.env.iter().chain(&section.env) {
			let (key, value) = parse_pair(entry).ok_or_else(|| ConfigError::MalformedEntry {
				service: name.to_string(),
				field: "env",
				entry: entry.clone(),
			})?;
			config.environment.push((key, expand(&value)));
		}

		for (field, entries, network) in [
			("local_drives", &section.local_drives, false),
			("network_drives", &section.network_drives, true),
		] {
			for entry in entries {
				let malformed = || ConfigError::MalformedEntry {
					service: name.to_string(),
					field,
					entry: entry.clone(),
				};
				let (letter, path) = parse_pair(entry).ok_or_else(malformed)?;
				let letter = drive_letter(&letter).ok_or_else(malformed)?;
				let target = if network {
					DriveTarget::Network(path)
				} else {
					DriveTarget::Local(PathBuf::from(expand(&path)))
				};
				config.drives.push(DriveMapping { letter, target });
			}
		}

		config.validate().map_err(|source| ConfigError::Invalid {
			service: name.to_string(),
			source,
		})?;
		Ok(config)
	}

	pub fn drive_roots(&self) -> DriveRoots {
		let mut roots = DriveRoots::default();
		if let Some(ref root) = self.drives.root {
			roots.root = PathBuf::from(expand(root));
		}
		if let Some(ref root) = self.drives.network_root {
			roots.network_root = PathBuf::from(expand(root));
		}
		roots
	}
}

/// Splits `NAME=value` at the first `=`.
fn parse_pair(entry: &str) -> Option<(String, String)> {
	let (key, value) = entry.split_once('=')?;
	let key = key.trim();
	if key.is_empty() {
		return None;
	}
	Some((key.to_string(), value.trim().to_string()))
}

/// Accepts `X` or `X:`.
fn drive_letter(s: &str) -> Option<char> {
	let s = s.strip_suffix(':').unwrap_or(s);
	let mut chars = s.chars();
	match (chars.next(), chars.next()) {
		(Some(c), None) => Some(c.to_ascii_uppercase()),
		_ => None,
	}
}

/// Expands a leading `~/` and every `${NAME}` whose variable is set.
/// Unset variables are left as written.
pub fn expand(value: &str) -> String {
	let value = expand_tilde(value);
	let mut out = String::with_capacity(value.len());
	let mut rest = value.as_str();
	while let Some(start) = rest.find("${") {
		out.push_str(&rest[..start]);
		let after = &rest[start + 2..];
		match after.find('}') {
			Some(end) => {
				let name = &after[..end];
				match std::env::var(name) {
					Ok(v) => out.push_str(&v),
					Err(_) => out.push_str(&rest[start..start + 3 + end]),
				}
				rest = &after[end + 1..];
			}
			None => {
				out.push_str(&rest[start..]);
				rest = "";
			}
		}
	}
	out.push_str(rest);
	out
}

fn expand_tilde(path: &str) -> String {
	if let Some(rest) = path.strip_prefix("~/") {
		if let Ok(home) = std::env::var("HOME") {
			return format!("{}/{}", home.trim_end_matches('/'), rest);
		}
	}
	path.to_string()
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::error::ConfigurationError;

	fn parse(content: &str) -> ServiceFile {
		parse_service_file(content, Path::new("services.toml")).unwrap()
	}

	#[test]
	fn full_section() {
		let file = parse(
			r#"
[defaults]
wait_interval = 7
env = ["LANG=C"]

[services.web]
startup = "/usr/bin/server"
args = ["--port", "8080"]
wait = "wait-for-port 8080"
shutdown = "/usr/bin/server --stop"
shutdown_method = "command"
priority = "high"
startup_delay = 2
auto_restart = true
restart_interval = 9
env = ["MODE=prod", "EMPTY="]
local_drives = ["x=/srv/data"]
network_drives = ["Y:=//files/share"]
"#,
		);
		let config = file.service("web").unwrap();
		assert_eq!(config.startup_command, "/usr/bin/server");
		assert_eq!(config.arguments, vec!["--port", "8080"]);
		assert_eq!(config.wait_command.as_deref(), Some("wait-for-port 8080"));
		assert_eq!(config.shutdown_method, ShutdownMethod::Command);
		assert_eq!(config.priority, Priority::High);
		assert_eq!(config.startup_delay, Duration::from_secs(2));
		assert_eq!(config.wait_interval, Duration::from_secs(7));
		assert!(config.auto_restart);
		assert_eq!(config.restart_interval, Duration::from_secs(9));
		assert_eq!(
			config.environment,
			vec![
				("LANG".to_string(), "C".to_string()),
				("MODE".to_string(), "prod".to_string()),
				("EMPTY".to_string(), String::new()),
			]
		);
		assert_eq!(
			config.drives,
			vec![
				DriveMapping { letter: 'X', target: DriveTarget::Local("/srv/data".into()) },
				DriveMapping { letter: 'Y', target: DriveTarget::Network("//files/share".into()) },
			]
		);
	}

	#[test]
	fn defaults_apply() {
		let file = parse("[services.echo]\nstartup = \"echo\"\n");
		let config = file.service("echo").unwrap();
		assert_eq!(config.shutdown_method, ShutdownMethod::Kill);
		assert_eq!(config.wait_interval, Duration::from_secs(5));
		assert!(!config.auto_restart);
		assert!(config.wait_command.is_none());
	}

	#[test]
	fn winmessage_alias() {
		let file = parse("[services.gui]\nstartup = \"app\"\nshutdown_method = \"winmessage\"\n");
		assert_eq!(
			file.service("gui").unwrap().shutdown_method,
			ShutdownMethod::WindowMessage
		);
	}

	#[test]
	fn unknown_service() {
		let file = parse("");
		assert!(matches!(file.service("nope"), Err(ConfigError::UnknownService(_))));
	}

	#[test]
	fn missing_startup_is_invalid() {
		let file = parse("[services.web]\nargs = [\"x\"]\n");
		match file.service("web") {
			Err(ConfigError::Invalid { source, .. }) => {
				assert_eq!(source, ConfigurationError::MissingStartupCommand)
			}
			other => panic!("unexpected {:?}", other),
		}
	}

	#[test]
	fn malformed_env_entry() {
		let file = parse("[services.web]\nstartup = \"x\"\nenv = [\"NOEQUALS\"]\n");
		assert!(matches!(
			file.service("web"),
			Err(ConfigError::MalformedEntry { field: "env", .. })
		));
	}

	#[test]
	fn malformed_drive_letter() {
		let file = parse("[services.web]\nstartup = \"x\"\nlocal_drives = [\"XY=/tmp\"]\n");
		assert!(matches!(
			file.service("web"),
			Err(ConfigError::MalformedEntry { field: "local_drives", .. })
		));
	}

	#[test]
	fn parse_error_names_file() {
		let err = parse_service_file("[services", Path::new("bad.toml")).unwrap_err();
		assert!(err.to_string().contains("bad.toml"));
	}

	#[test]
	fn load_from_disk() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("services.toml");
		std::fs::write(&path, "[services.a]\nstartup = \"true\"\n").unwrap();
		let file = load_service_file(&path).unwrap();
		assert_eq!(file.service_names(), vec!["a"]);
		assert!(matches!(
			load_service_file(&dir.path().join("missing.toml")),
			Err(ConfigError::Io { .. })
		));
	}

	#[test]
	fn expand_leaves_unknown_variables() {
		assert_eq!(expand("${SVCWRAP_SURELY_UNSET_VAR}/x"), "${SVCWRAP_SURELY_UNSET_VAR}/x");
		assert_eq!(expand("plain"), "plain");
		assert_eq!(expand("broken ${"), "broken ${");
	}

	#[test]
	fn expand_known_variable() {
		let home = std::env::var("HOME").unwrap_or_default();
		assert_eq!(expand("${HOME}/data"), format!("{}/data", home));
	}

	#[test]
	fn drive_roots_override() {
		let file = parse("[drives]\nroot = \"/run/drives\"\nnetwork_root = \"/net\"\n");
		let roots = file.drive_roots();
		assert_eq!(roots.root, PathBuf::from("/run/drives"));
		assert_eq!(roots.network_root, PathBuf::from("/net"));
	}
}
