mod control;
mod logging;
mod service;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use owo_colors::OwoColorize;
use svcwrap_core::config::{self, ServiceFile};

const EXIT_OK: i32 = 0;
const EXIT_FAILURE: i32 = 1;
const EXIT_CONFIG: i32 = 2;
const EXIT_MUST_START_AS_CONSOLE: i32 = 3;

#[derive(Parser, Debug)]
#[command(name = "svcwrap", version, about = "Run any program as a supervised service")]
struct Cli {
	#[command(subcommand)]
	command: Commands,

	/// Service file (default: $XDG_CONFIG_HOME/svcwrap/services.toml).
	#[arg(long, global = true)]
	config: Option<PathBuf>,

	/// Log filter, e.g. `debug` or `svcwrap=trace`. Overrides RUST_LOG.
	#[arg(long, global = true)]
	log_level: Option<String>,

	/// More logging (-v debug, -vv trace).
	#[arg(short, long, global = true, action = clap::ArgAction::Count)]
	verbose: u8,
}

#[derive(Subcommand, Debug)]
enum Commands {
	/// Run a service under the service manager
	Run {
		name: String,
		/// Exit with status 3 instead of running interactively when no
		/// service manager is present.
		#[arg(long)]
		no_console_fallback: bool,
	},
	/// Run a service in the foreground; Ctrl-C stops it
	Console { name: String },
	/// Show the status of a running service
	Status {
		name: String,
		/// Print the raw status as JSON.
		#[arg(long)]
		json: bool,
	},
	/// Ask a running service to stop
	Stop {
		name: String,
		/// Seconds to wait for it to finish stopping.
		#[arg(long, default_value_t = 60)]
		timeout: u64,
	},
	/// Load and validate a service definition
	Check { name: String },
}

fn main() {
	let cli = Cli::parse();
	let config_path = cli.config.clone().unwrap_or_else(config::default_config_path);

	let code = match cli.command {
		Commands::Run { ref name, no_console_fallback } => {
			with_service_file(&cli, &config_path, |file| {
				let mode = service::Mode::Service {
					console_fallback: !no_console_fallback,
				};
				block_on(service::run(file, name, mode))
			})
		}
		Commands::Console { ref name } => with_service_file(&cli, &config_path, |file| {
			block_on(service::run(file, name, service::Mode::Console))
		}),
		Commands::Status { ref name, json } => {
			logging::init(cli.log_level.as_deref(), cli.verbose, "warn");
			control::cmd_status(name, json)
		}
		Commands::Stop { ref name, timeout } => {
			logging::init(cli.log_level.as_deref(), cli.verbose, "warn");
			control::cmd_stop(name, std::time::Duration::from_secs(timeout))
		}
		Commands::Check { ref name } => {
			logging::init(cli.log_level.as_deref(), cli.verbose, "warn");
			cmd_check(&config_path, name)
		}
	};
	std::process::exit(code);
}

fn with_service_file(cli: &Cli, path: &Path, run: impl FnOnce(&ServiceFile) -> i32) -> i32 {
	match config::load_service_file(path) {
		Ok(file) => {
			logging::init(cli.log_level.as_deref(), cli.verbose, &file.logging.level);
			run(&file)
		}
		Err(e) => {
			eprintln!("{} {}", "error:".red().bold(), e);
			EXIT_CONFIG
		}
	}
}

fn block_on<F: std::future::Future<Output = i32>>(future: F) -> i32 {
	match tokio::runtime::Runtime::new() {
		Ok(runtime) => runtime.block_on(future),
		Err(e) => {
			eprintln!("{} failed to start runtime: {}", "error:".red().bold(), e);
			EXIT_FAILURE
		}
	}
}

fn cmd_check(path: &Path, name: &str) -> i32 {
	let service = config::load_service_file(path).and_then(|file| file.service(name));
	let config = match service {
		Ok(config) => config,
		Err(e) => {
			eprintln!("{} {}", "error:".red().bold(), e);
			return EXIT_CONFIG;
		}
	};

	println!("{} {}", "●".green(), config.name.bold());
	println!("  {:<16} {}", "startup", config.command_line());
	if let Some(ref wait) = config.wait_command {
		println!("  {:<16} {}", "wait", wait);
	}
	match config.shutdown_command {
		Some(ref cmd) => println!("  {:<16} {:?} ({})", "shutdown", config.shutdown_method, cmd),
		None => println!("  {:<16} {:?}", "shutdown", config.shutdown_method),
	}
	println!("  {:<16} {:?}", "priority", config.priority);
	if let Some(ref dir) = config.startup_dir {
		println!("  {:<16} {}", "directory", dir.display());
	}
	if !config.startup_delay.is_zero() {
		println!("  {:<16} {}s", "startup delay", config.startup_delay.as_secs_f64());
	}
	println!("  {:<16} {}s", "wait interval", config.wait_interval.as_secs_f64());
	if config.auto_restart {
		println!("  {:<16} every {}s", "auto-restart", config.restart_interval.as_secs_f64());
	}
	for (name, value) in &config.environment {
		println!("  {:<16} {}={}", "env", name, value);
	}
	for drive in &config.drives {
		println!("  {:<16} {}", "drive", drive);
	}
	EXIT_OK
}
