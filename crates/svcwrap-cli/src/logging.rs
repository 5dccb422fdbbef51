use tracing_subscriber::EnvFilter;

/// Picks the log filter: `--log-level`, then `-v`, then `RUST_LOG`, then the
/// level from the service file.
pub fn filter(level: Option<&str>, verbose: u8, fallback: &str) -> EnvFilter {
	if let Some(level) = level {
		return EnvFilter::new(level);
	}
	match verbose {
		0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)),
		1 => EnvFilter::new("debug"),
		_ => EnvFilter::new("trace"),
	}
}

pub fn init(level: Option<&str>, verbose: u8, fallback: &str) {
	let _ = tracing_subscriber::fmt()
		.with_env_filter(filter(level, verbose, fallback))
		.with_writer(std::io::stderr)
		.with_target(false)
		.try_init();
}
