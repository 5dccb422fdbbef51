use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

use crate::client;
use crate::paths::ControlPaths;

#[derive(Error, Debug)]
pub enum ServerError {
	#[error("{service} is already running (socket {path} is live)")]
	AlreadyRunning { service: String, path: PathBuf },

	#[error("{path}: {source}")]
	Io {
		path: PathBuf,
		#[source]
		source: io::Error,
	},
}

/// A bound control socket. The socket and pid files are removed on drop.
pub struct ControlServer {
	paths: ControlPaths,
	listener: UnixListener,
}

impl ControlServer {
	/// Binds the service's socket and writes its pid file. A stale socket
	/// left by a crashed run is replaced; a live one is an error.
	pub fn bind(paths: &ControlPaths) -> Result<Self, ServerError> {
		let io_err = |path: PathBuf| move |source: io::Error| ServerError::Io { path, source };

		std::fs::create_dir_all(paths.state_dir())
			.map_err(io_err(paths.state_dir().to_path_buf()))?;

		let socket_path = paths.socket_path();
		if socket_path.exists() {
			if client::is_running(paths) {
				return Err(ServerError::AlreadyRunning {
					service: paths.service.clone(),
					path: socket_path,
				});
			}
			tracing::debug!("removing stale socket {}", socket_path.display());
			std::fs::remove_file(&socket_path).map_err(io_err(socket_path.clone()))?;
		}

		let listener = UnixListener::bind(&socket_path).map_err(io_err(socket_path.clone()))?;
		let server = Self {
			paths: paths.clone(),
			listener,
		};
		std::fs::write(paths.pid_path(), std::process::id().to_string())
			.map_err(io_err(paths.pid_path()))?;

		tracing::info!("listening on {}", socket_path.display());
		Ok(server)
	}

	/// Answers newline-delimited JSON requests until `shutdown` fires.
	/// Lines that do not parse get `on_invalid(message)` as their reply.
	pub async fn serve<Req, Resp, F, Fut, E>(
		self,
		handler: F,
		on_invalid: E,
		shutdown: CancellationToken,
	) where
		Req: DeserializeOwned + Send + 'static,
		Resp: Serialize + Send + 'static,
		F: Fn(Req) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Resp> + Send + 'static,
		E: Fn(String) -> Resp + Send + Sync + 'static,
	{
		let handler = Arc::new(handler);
		let on_invalid = Arc::new(on_invalid);

		loop {
			let stream = tokio::select! {
				_ = shutdown.cancelled() => break,
				accepted = self.listener.accept() => match accepted {
					Ok((stream, _)) => stream,
					Err(e) => {
						tracing::error!("accept error: {}", e);
						continue;
					}
				},
			};

			let handler = Arc::clone(&handler);
			let on_invalid = Arc::clone(&on_invalid);
			let shutdown = shutdown.clone();
			tokio::spawn(async move {
				tokio::select! {
					_ = handle_connection(stream, handler, on_invalid) => {}
					_ = shutdown.cancelled() => {}
				}
			});
		}
		tracing::debug!("control socket for {} closed", self.paths.service);
	}
}

impl Drop for ControlServer {
	fn drop(&mut self) {
		let _ = std::fs::remove_file(self.paths.socket_path());
		let _ = std::fs::remove_file(self.paths.pid_path());
	}
}

async fn handle_connection<Req, Resp, F, Fut, E>(
	stream: UnixStream,
	handler: Arc<F>,
	on_invalid: Arc<E>,
) where
	Req: DeserializeOwned + Send + 'static,
	Resp: Serialize + Send + 'static,
	F: Fn(Req) -> Fut + Send + Sync + 'static,
	Fut: Future<Output = Resp> + Send + 'static,
	E: Fn(String) -> Resp + Send + Sync + 'static,
{
	let (reader, mut writer) = stream.into_split();
	let mut lines = BufReader::new(reader).lines();

	while let Ok(Some(line)) = lines.next_line().await {
		let response = match serde_json::from_str::<Req>(&line) {
			Ok(request) => handler(request).await,
			Err(e) => {
				tracing::warn!("invalid request: {}", e);
				on_invalid(format!("invalid request: {}", e))
			}
		};

		let mut data = match serde_json::to_vec(&response) {
			Ok(d) => d,
			Err(e) => {
				tracing::error!("failed to serialize response: {}", e);
				continue;
			}
		};
		data.push(b'\n');

		if writer.write_all(&data).await.is_err() {
			break;
		}
	}
}
