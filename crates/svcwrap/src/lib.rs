//! # svcwrap
//!
//! Runs an ordinary command as a managed service.
//!
//! A [`Supervisor`] launches the configured command, holds back RUNNING until
//! startup has settled, watches the process, negotiates shutdown when a stop
//! arrives and optionally restarts it after it exits. Every transition is
//! reported through a [`StatusBridge`] to the host service manager.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use svcwrap::{StatusBridge, Supervisor};
//! use svcwrap_core::ServiceConfiguration;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let mut config = ServiceConfiguration::new("web", "/usr/bin/server");
//! config.arguments = vec!["--port".into(), "8080".into()];
//! config.auto_restart = true;
//!
//! let bridge = Arc::new(StatusBridge::connect("web", true));
//! let trigger = bridge.trigger();
//! tokio::spawn(async move {
//!     let _ = tokio::signal::ctrl_c().await;
//!     trigger.fire();
//! });
//!
//! let summary = Supervisor::new(config, bridge).start().await.unwrap();
//! println!("{:?}", summary.outcome);
//! # }
//! ```

pub mod bridge;
pub mod delay;
pub mod error;
pub mod host;
pub mod prepare;
pub mod process;
pub mod supervisor;

pub use bridge::{StatusBridge, StopContext, StopRequest, StopTrigger};
pub use delay::DelayTimer;
pub use error::{ConfigurationError, HostError, SupervisorError, SystemError};
pub use host::{NotifySocket, ServiceHost, StatusUpdate};
pub use supervisor::{RunOutcome, RunSummary, Supervisor, WatchOutcome};
