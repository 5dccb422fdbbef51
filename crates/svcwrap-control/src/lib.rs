pub mod client;
pub mod paths;
pub mod server;

pub use client::{ClientError, ControlClient};
pub use paths::ControlPaths;
pub use server::{ControlServer, ServerError};
