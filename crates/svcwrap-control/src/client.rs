use std::io::{self, BufRead, BufReader, Write};
use std::marker::PhantomData;
use std::os::unix::net::UnixStream;
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

use crate::paths::ControlPaths;

const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum ClientError {
	#[error("{0} is not running")]
	NotRunning(String),

	#[error("io error: {0}")]
	Io(#[from] io::Error),

	#[error("serialize error: {0}")]
	Serialize(#[source] serde_json::Error),

	#[error("deserialize error: {0}")]
	Deserialize(#[source] serde_json::Error),

	#[error("connection closed before a reply arrived")]
	Closed,
}

/// Blocking client for a supervisor's control socket.
pub struct ControlClient<Req, Resp> {
	stream: UnixStream,
	_phantom: PhantomData<(Req, Resp)>,
}

impl<Req, Resp> ControlClient<Req, Resp>
where
	Req: Serialize,
	Resp: DeserializeOwned,
{
	pub fn connect(paths: &ControlPaths) -> Result<Self, ClientError> {
		let stream = UnixStream::connect(paths.socket_path())
			.map_err(|_| ClientError::NotRunning(paths.service.clone()))?;
		stream.set_read_timeout(Some(REPLY_TIMEOUT))?;
		Ok(Self {
			stream,
			_phantom: PhantomData,
		})
	}

	pub fn send(&mut self, request: &Req) -> Result<Resp, ClientError> {
		let mut data = serde_json::to_vec(request).map_err(ClientError::Serialize)?;
		data.push(b'\n');
		self.stream.write_all(&data)?;

		let mut reader = BufReader::new(&self.stream);
		let mut line = String::new();
		if reader.read_line(&mut line)? == 0 {
			return Err(ClientError::Closed);
		}
		serde_json::from_str(&line).map_err(ClientError::Deserialize)
	}
}

/// Whether a supervisor is answering on the service's socket.
pub fn is_running(paths: &ControlPaths) -> bool {
	UnixStream::connect(paths.socket_path()).is_ok()
}

pub fn read_pid(paths: &ControlPaths) -> Option<u32> {
	std::fs::read_to_string(paths.pid_path())
		.ok()
		.and_then(|s| s.trim().parse().ok())
}
