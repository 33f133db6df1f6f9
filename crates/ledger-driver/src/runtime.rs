//! Background machinery shared by the drivers: the cached head, the shutdown
//! signal and the block poller.

use crate::DriverError;
use ledger_types::BlockInfo;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub(crate) struct DriverRuntime {
	head: watch::Sender<Option<BlockInfo>>,
	shutdown: watch::Sender<bool>,
	poller: Mutex<Option<JoinHandle<()>>>,
}

impl DriverRuntime {
	pub fn new() -> Self {
		let (head, _) = watch::channel(None);
		let (shutdown, _) = watch::channel(false);
		Self {
			head,
			shutdown,
			poller: Mutex::new(None),
		}
	}

	pub fn is_closed(&self) -> bool {
		*self.shutdown.borrow()
	}

	pub fn ensure_open(&self) -> Result<(), DriverError> {
		if self.is_closed() {
			Err(DriverError::Closed)
		} else {
			Ok(())
		}
	}

	pub fn head(&self) -> Option<BlockInfo> {
		self.head.borrow().clone()
	}

	/// Publishes a new head to listeners.
	///
	/// Heads older than the cached one are ignored; a different block at the
	/// same height replaces it. Returns true when the cached head changed.
	pub fn publish_head(&self, block: BlockInfo) -> bool {
		self.head.send_if_modified(|current| {
			let newer = match current {
				Some(known) => {
					block.block_number > known.block_number
						|| (block.block_number == known.block_number
							&& block.block_hash != known.block_hash)
				},
				None => true,
			};
			if newer {
				*current = Some(block);
			}
			newer
		})
	}

	pub fn heads(&self) -> watch::Receiver<Option<BlockInfo>> {
		self.head.subscribe()
	}

	pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
		self.shutdown.subscribe()
	}

	/// Keeps the handle of the block poller so `close` can stop it.
	///
	/// A poller attached after `close` is aborted right away.
	pub fn attach_poller(&self, task: JoinHandle<()>) {
		if let Ok(mut poller) = self.poller.lock() {
			if self.is_closed() {
				task.abort();
				return;
			}
			if let Some(previous) = poller.replace(task) {
				previous.abort();
			}
		}
	}

	/// Signals shutdown to every background task.
	///
	/// Returns false when the runtime was already closed.
	pub fn close(&self) -> bool {
		let was_closed = self.shutdown.send_replace(true);
		if let Ok(mut poller) = self.poller.lock() {
			if let Some(task) = poller.take() {
				task.abort();
			}
		}
		!was_closed
	}
}

/// Runs `tick` every `period` until shutdown is signalled.
///
/// Tick failures are logged and the loop keeps going.
pub(crate) async fn run_poller<F, Fut>(
	name: &'static str,
	period: Duration,
	mut shutdown: watch::Receiver<bool>,
	mut tick: F,
) where
	F: FnMut() -> Fut,
	Fut: Future<Output = Result<(), DriverError>>,
{
	let mut interval = tokio::time::interval(period);
	// Set the interval to skip missed ticks instead of bursting
	interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

	loop {
		tokio::select! {
			_ = interval.tick() => {
				if let Err(e) = tick().await {
					tracing::warn!(driver = name, error = %e, "Block poller tick failed");
				}
			}
			// Also resolves when shutdown was published before the subscription.
			_ = async { shutdown.wait_for(|closed| *closed).await.map(|_| ()) } => break,
		}
	}
	tracing::debug!(driver = name, "Block poller stopped");
}
