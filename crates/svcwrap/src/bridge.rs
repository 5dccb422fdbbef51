//! Status reporting to the host service manager, and stop-request intake.
//!
//! Whatever form the host uses to ask for a stop (a polled flag, a token it
//! cancels, or a callback it invokes from its own context) ends up as one
//! [`CancellationToken`] that every supervisor wait selects on.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use svcwrap_core::{ScmStatus, StatusSnapshot};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::SystemError;
use crate::host::{NotifySocket, ServiceHost, StatusUpdate};

pub type StopContext = Arc<dyn Any + Send + Sync>;
pub type StopHandler = Arc<dyn Fn(&StopContext) + Send + Sync>;

/// The three ways a host can deliver a stop request.
pub enum StopRequest {
	/// A flag the host sets; checked every `poll`.
	Flag { flag: Arc<AtomicBool>, poll: Duration },
	/// A token the host cancels.
	Token(CancellationToken),
	/// A handler the host invokes through [`StopTrigger::fire`], with an
	/// opaque context handed back to it.
	Callback { handler: StopHandler, context: StopContext },
}

impl StopRequest {
	pub fn flag(flag: Arc<AtomicBool>, poll: Duration) -> Self {
		StopRequest::Flag { flag, poll }
	}

	pub fn token(token: CancellationToken) -> Self {
		StopRequest::Token(token)
	}

	pub fn callback<F>(handler: F, context: StopContext) -> Self
	where
		F: Fn(&StopContext) + Send + Sync + 'static,
	{
		StopRequest::Callback {
			handler: Arc::new(handler),
			context,
		}
	}
}

impl std::fmt::Debug for StopRequest {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			StopRequest::Flag { poll, .. } => write!(f, "StopRequest::Flag({:?})", poll),
			StopRequest::Token(_) => f.write_str("StopRequest::Token"),
			StopRequest::Callback { .. } => f.write_str("StopRequest::Callback"),
		}
	}
}

enum Installed {
	Nothing,
	Task(JoinHandle<()>),
	Callback { handler: StopHandler, context: StopContext },
}

impl Installed {
	fn release(&mut self) {
		if let Installed::Task(handle) = self {
			handle.abort();
		}
		*self = Installed::Nothing;
	}
}

struct StopShared {
	signal: CancellationToken,
	installed: Mutex<Installed>,
}

impl StopShared {
	fn fire(&self) {
		let callback = match &*self.installed.lock().unwrap_or_else(|e| e.into_inner()) {
			Installed::Callback { handler, context } => Some((handler.clone(), context.clone())),
			_ => None,
		};
		if let Some((handler, context)) = callback {
			handler(&context);
		}
		if !self.signal.is_cancelled() {
			tracing::info!("stop requested");
		}
		self.signal.cancel();
	}
}

/// Handle for the host's stop-handling context (signal listener, control
/// socket). Firing runs the installed callback, if any, then raises the
/// stop signal.
#[derive(Clone)]
pub struct StopTrigger {
	shared: Arc<StopShared>,
}

impl StopTrigger {
	pub fn fire(&self) {
		self.shared.fire();
	}
}

pub struct StatusBridge {
	service: String,
	host: Option<Arc<dyn ServiceHost>>,
	stop: Arc<StopShared>,
	status: watch::Sender<StatusSnapshot>,
}

impl StatusBridge {
	pub fn new(service: impl Into<String>, host: Arc<dyn ServiceHost>) -> Self {
		Self::build(service.into(), Some(host))
	}

	/// A bridge with no host behind it: `notify` records the status and
	/// always succeeds. For interactive runs and tests.
	pub fn detached(service: impl Into<String>) -> Self {
		Self::build(service.into(), None)
	}

	/// Connects to the service manager named by `NOTIFY_SOCKET`. Without one,
	/// the bridge is detached if `allow_connect_errors` is set; otherwise it
	/// is left in `MustStartAsConsole` so the caller can rerun interactively.
	pub fn connect(service: impl Into<String>, allow_connect_errors: bool) -> Self {
		Self::connect_to(service.into(), NotifySocket::from_env(), allow_connect_errors)
	}

	fn connect_to(service: String, socket: Option<NotifySocket>, allow_connect_errors: bool) -> Self {
		match socket {
			Some(socket) => {
				tracing::debug!("reporting status to {}", socket.addr());
				Self::build(service, Some(Arc::new(socket)))
			}
			None if allow_connect_errors => Self::build(service, None),
			None => {
				let bridge = Self::build(service, None);
				// detached, so this cannot fail
				let _ = bridge.notify(ScmStatus::MustStartAsConsole, true);
				bridge
			}
		}
	}

	fn build(service: String, host: Option<Arc<dyn ServiceHost>>) -> Self {
		let (status, _) = watch::channel(StatusSnapshot {
			service: service.clone(),
			status: ScmStatus::Initialising,
			pid: None,
			incarnation: 0,
		});
		Self {
			service,
			host,
			stop: Arc::new(StopShared {
				signal: CancellationToken::new(),
				installed: Mutex::new(Installed::Nothing),
			}),
			status,
		}
	}

	pub fn service(&self) -> &str {
		&self.service
	}

	pub fn is_managed(&self) -> bool {
		self.host.is_some()
	}

	pub fn status(&self) -> ScmStatus {
		self.status.borrow().status
	}

	pub fn snapshot(&self) -> StatusSnapshot {
		self.status.borrow().clone()
	}

	pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
		self.status.subscribe()
	}

	/// Reports `status` to the host and records it once the host has taken
	/// it. Host failures are returned, leaving the recorded status untouched,
	/// unless `ignore_errors` is set, as for notifications sent during
	/// teardown.
	pub fn notify(&self, status: ScmStatus, ignore_errors: bool) -> Result<(), SystemError> {
		let current = self.status();
		if current.is_terminal() && current != status {
			let err = SystemError::InvalidTransition { from: current, to: status };
			if ignore_errors {
				tracing::warn!("{}: {}", self.service, err);
				return Ok(());
			}
			return Err(err);
		}

		if let Some(ref host) = self.host {
			let update = StatusUpdate {
				service: &self.service,
				status,
				pid: self.status.borrow().pid,
			};
			match host.report(&update) {
				Ok(()) => {}
				Err(e) if ignore_errors => {
					tracing::warn!("{}: ignoring failed '{}' notification: {}", self.service, status, e);
				}
				Err(source) => return Err(SystemError::Notify { status, source }),
			}
		}

		self.status.send_modify(|s| s.status = status);
		tracing::info!("{}: {}", self.service, status);
		Ok(())
	}

	/// Re-reports the current status and keeps the host from timing out a
	/// slow startup. Failures are only logged.
	pub fn heartbeat(&self, extend_by: Duration) {
		let Some(ref host) = self.host else {
			return;
		};
		let snapshot = self.snapshot();
		let update = StatusUpdate {
			service: &self.service,
			status: snapshot.status,
			pid: snapshot.pid,
		};
		if let Err(e) = host.report(&update).and_then(|()| host.extend_timeout(extend_by)) {
			tracing::warn!("{}: startup heartbeat failed: {}", self.service, e);
		}
	}

	pub fn set_pid(&self, pid: Option<u32>) {
		self.status.send_modify(|s| s.pid = pid);
	}

	pub fn set_incarnation(&self, incarnation: u32) {
		self.status.send_modify(|s| s.incarnation = incarnation);
	}

	/// Installs the host's stop-delivery form, replacing any earlier one.
	/// Flag and token forms spawn a forwarding task, so this must run inside
	/// a tokio runtime.
	pub fn install_stop_callback(&self, request: StopRequest) {
		tracing::debug!("{}: installing {:?}", self.service, request);
		let signal = self.stop.signal.clone();
		let installed = match request {
			StopRequest::Flag { flag, poll } => {
				Installed::Task(tokio::spawn(poll_flag(flag, poll, signal)))
			}
			StopRequest::Token(host_token) => Installed::Task(tokio::spawn(async move {
				tokio::select! {
					_ = host_token.cancelled() => {
						tracing::info!("stop requested");
						signal.cancel();
					}
					_ = signal.cancelled() => {}
				}
			})),
			StopRequest::Callback { handler, context } => Installed::Callback { handler, context },
		};

		let mut slot = self.stop.installed.lock().unwrap_or_else(|e| e.into_inner());
		slot.release();
		*slot = installed;
	}

	/// The single signal every supervisor wait listens to.
	pub fn stop_signal(&self) -> CancellationToken {
		self.stop.signal.clone()
	}

	pub fn stop_requested(&self) -> bool {
		self.stop.signal.is_cancelled()
	}

	pub fn trigger(&self) -> StopTrigger {
		StopTrigger {
			shared: Arc::clone(&self.stop),
		}
	}
}

impl Drop for StatusBridge {
	fn drop(&mut self) {
		if let Ok(mut slot) = self.stop.installed.lock() {
			slot.release();
		}
	}
}

async fn poll_flag(flag: Arc<AtomicBool>, poll: Duration, signal: CancellationToken) {
	let mut ticker = tokio::time::interval(poll.max(Duration::from_millis(1)));
	ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
	loop {
		tokio::select! {
			_ = signal.cancelled() => return,
			_ = ticker.tick() => {
				if flag.load(Ordering::SeqCst) {
					tracing::info!("stop requested");
					signal.cancel();
					return;
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::error::HostError;
	use std::sync::atomic::AtomicUsize;
	use std::time::Instant;

	#[derive(Default)]
	struct Recording {
		seen: Mutex<Vec<ScmStatus>>,
		fail: AtomicBool,
	}

	impl ServiceHost for Recording {
		fn report(&self, update: &StatusUpdate<'_>) -> Result<(), HostError> {
			if self.fail.load(Ordering::SeqCst) {
				return Err(HostError::Send {
					addr: "test".into(),
					source: std::io::Error::from(std::io::ErrorKind::BrokenPipe),
				});
			}
			self.seen.lock().unwrap().push(update.status);
			Ok(())
		}
	}

	#[test]
	fn notify_forwards_to_host() {
		let host = Arc::new(Recording::default());
		let bridge = StatusBridge::new("web", host.clone());
		bridge.notify(ScmStatus::Starting, false).unwrap();
		bridge.notify(ScmStatus::Running, false).unwrap();
		assert_eq!(*host.seen.lock().unwrap(), vec![ScmStatus::Starting, ScmStatus::Running]);
		assert_eq!(bridge.status(), ScmStatus::Running);
	}

	#[test]
	fn host_failure_is_an_error_unless_ignored() {
		let host = Arc::new(Recording::default());
		host.fail.store(true, Ordering::SeqCst);
		let bridge = StatusBridge::new("web", host);
		assert!(matches!(
			bridge.notify(ScmStatus::Starting, false),
			Err(SystemError::Notify { status: ScmStatus::Starting, .. })
		));
		assert_eq!(bridge.status(), ScmStatus::Initialising);
		assert!(bridge.notify(ScmStatus::Failed, true).is_ok());
		assert_eq!(bridge.status(), ScmStatus::Failed);
	}

	#[test]
	fn rejected_terminal_status_leaves_room_for_failed() {
		let host = Arc::new(Recording::default());
		let bridge = StatusBridge::new("web", host.clone());
		bridge.notify(ScmStatus::Running, false).unwrap();

		host.fail.store(true, Ordering::SeqCst);
		assert!(bridge.notify(ScmStatus::Stopped, false).is_err());
		assert_eq!(bridge.status(), ScmStatus::Running);

		host.fail.store(false, Ordering::SeqCst);
		bridge.notify(ScmStatus::Failed, true).unwrap();
		assert_eq!(*host.seen.lock().unwrap(), vec![ScmStatus::Running, ScmStatus::Failed]);
		assert_eq!(bridge.status(), ScmStatus::Failed);
	}

	#[test]
	fn terminal_status_is_final() {
		let bridge = StatusBridge::detached("web");
		bridge.notify(ScmStatus::Stopped, false).unwrap();
		assert!(matches!(
			bridge.notify(ScmStatus::Running, false),
			Err(SystemError::InvalidTransition { .. })
		));
		// repeating the terminal status is harmless
		bridge.notify(ScmStatus::Stopped, false).unwrap();
		bridge.notify(ScmStatus::Failed, true).unwrap();
		assert_eq!(bridge.status(), ScmStatus::Stopped);
	}

	#[test]
	fn connect_without_host() {
		let tolerant = StatusBridge::connect_to("web".into(), None, true);
		assert!(!tolerant.is_managed());
		assert_eq!(tolerant.status(), ScmStatus::Initialising);

		let strict = StatusBridge::connect_to("web".into(), None, false);
		assert_eq!(strict.status(), ScmStatus::MustStartAsConsole);

		let managed = StatusBridge::connect_to("web".into(), Some(NotifySocket::new("/run/notify")), false);
		assert!(managed.is_managed());
		assert_eq!(managed.status(), ScmStatus::Initialising);
	}

	#[test]
	fn snapshot_tracks_pid_and_incarnation() {
		let bridge = StatusBridge::detached("web");
		let rx = bridge.subscribe();
		bridge.set_incarnation(3);
		bridge.set_pid(Some(99));
		bridge.notify(ScmStatus::Running, false).unwrap();
		let snap = rx.borrow().clone();
		assert_eq!(snap.incarnation, 3);
		assert_eq!(snap.pid, Some(99));
		assert_eq!(snap.status, ScmStatus::Running);
		assert_eq!(snap.service, "web");
	}

	#[tokio::test]
	async fn flag_is_noticed_within_one_poll() {
		let bridge = StatusBridge::detached("web");
		let flag = Arc::new(AtomicBool::new(false));
		let poll = Duration::from_millis(100);
		bridge.install_stop_callback(StopRequest::flag(flag.clone(), poll));
		let signal = bridge.stop_signal();

		tokio::time::sleep(Duration::from_millis(250)).await;
		assert!(!signal.is_cancelled());
		let flipped = Instant::now();
		flag.store(true, Ordering::SeqCst);
		signal.cancelled().await;
		assert!(flipped.elapsed() <= poll + Duration::from_millis(50));
	}

	#[tokio::test]
	async fn host_token_is_forwarded() {
		let bridge = StatusBridge::detached("web");
		let host_token = CancellationToken::new();
		bridge.install_stop_callback(StopRequest::token(host_token.clone()));
		assert!(!bridge.stop_requested());
		host_token.cancel();
		tokio::time::timeout(Duration::from_secs(1), bridge.stop_signal().cancelled())
			.await
			.unwrap();
	}

	#[tokio::test]
	async fn callback_receives_context_and_raises_signal() {
		let bridge = StatusBridge::detached("web");
		let calls = Arc::new(AtomicUsize::new(0));
		let context: StopContext = calls.clone();
		bridge.install_stop_callback(StopRequest::callback(
			|ctx| {
				if let Some(counter) = ctx.downcast_ref::<AtomicUsize>() {
					counter.fetch_add(1, Ordering::SeqCst);
				}
			},
			context,
		));

		let trigger = bridge.trigger();
		std::thread::spawn(move || trigger.fire()).join().unwrap();
		assert_eq!(calls.load(Ordering::SeqCst), 1);
		assert!(bridge.stop_requested());
	}

	#[tokio::test]
	async fn installing_replaces_previous_form() {
		let bridge = StatusBridge::detached("web");
		let flag = Arc::new(AtomicBool::new(false));
		bridge.install_stop_callback(StopRequest::flag(flag.clone(), Duration::from_millis(10)));
		let host_token = CancellationToken::new();
		bridge.install_stop_callback(StopRequest::token(host_token.clone()));

		flag.store(true, Ordering::SeqCst);
		tokio::time::sleep(Duration::from_millis(100)).await;
		assert!(!bridge.stop_requested());

		host_token.cancel();
		tokio::time::timeout(Duration::from_secs(1), bridge.stop_signal().cancelled())
			.await
			.unwrap();
	}
}
