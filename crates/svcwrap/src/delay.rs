use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A timed wait that a stop request cuts short.
#[derive(Debug, Clone)]
pub struct DelayTimer {
	cancel: CancellationToken,
}

impl DelayTimer {
	pub fn new(cancel: CancellationToken) -> Self {
		Self { cancel }
	}

	/// Waits up to `duration`. Returns `true` if the full duration elapsed and
	/// `false` as soon as the cancellation token fires.
	pub async fn sleep(&self, duration: Duration, label: &str) -> bool {
		if self.cancel.is_cancelled() {
			return false;
		}
		if duration.is_zero() {
			return true;
		}

		tracing::debug!("waiting {}ms for {} ...", duration.as_millis(), label);
		tokio::select! {
			_ = self.cancel.cancelled() => {
				tracing::debug!("... wait for {} cancelled", label);
				false
			}
			_ = tokio::time::sleep(duration) => {
				tracing::debug!("... wait {}ms for {} complete", duration.as_millis(), label);
				true
			}
		}
	}
}
