use std::path::PathBuf;
use thiserror::Error;

/// A service definition that can never be supervised as written.
/// Never retried: a bad definition will not fix itself.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
	#[error("no startup command configured")]
	MissingStartupCommand,

	#[error("shutdown method is 'command' but no shutdown command is configured")]
	MissingShutdownCommand,

	#[error("invalid environment variable name {name:?}")]
	InvalidEnvironment { name: String },

	#[error("invalid drive letter {0:?}")]
	InvalidDriveLetter(char),

	#[error("drive {0}: is mapped more than once")]
	DuplicateDrive(char),

	#[error("cannot map drive {letter}: to {target}: {reason}")]
	DriveMapping {
		letter: char,
		target: String,
		reason: String,
	},
}

/// Failures while reading a service file.
#[derive(Error, Debug)]
pub enum ConfigError {
	#[error("failed to read {}: {source}", path.display())]
	Io {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("failed to parse {}: {source}", path.display())]
	Parse {
		path: PathBuf,
		#[source]
		source: toml::de::Error,
	},

	#[error("unknown service: {0}")]
	UnknownService(String),

	#[error("{service}: malformed {field} entry {entry:?} (expected NAME=value)")]
	MalformedEntry {
		service: String,
		field: &'static str,
		entry: String,
	},

	#[error("{service}: {source}")]
	Invalid {
		service: String,
		#[source]
		source: ConfigurationError,
	},
}
