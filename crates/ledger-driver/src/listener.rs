//! Block-cursor event listener.
//!
//! One task per subscription. The task keeps the next block to process and, on
//! every new head, extracts the events of all blocks up to that head before
//! moving the cursor past it. Historical replay and live processing therefore
//! share a single cursor. Extracted events go through the finality gate
//! before they reach the stream.

use crate::finality::FinalityGate;
use crate::{DriverError, EventStream};
use async_trait::async_trait;
use ledger_types::{BlockInfo, Event};
use tokio::sync::{mpsc, watch};

/// Extracts the events of a subscription from a range of blocks.
#[async_trait]
pub(crate) trait BlockEventSource: Send + Sync + 'static {
	/// Returns the matching events of blocks `from..=to` in block order.
	async fn events_between(&self, from: u64, to: u64) -> Result<Vec<Event>, DriverError>;
}

/// Spawns a listener starting at block `start`.
///
/// RPC failures are logged and the same range is attempted again on the next
/// head. Any other failure is delivered on the stream and ends it.
pub(crate) fn spawn_listener<S>(
	source: S,
	mut heads: watch::Receiver<Option<BlockInfo>>,
	mut shutdown: watch::Receiver<bool>,
	start: u64,
	delay: u64,
) -> EventStream
where
	S: BlockEventSource,
{
	let (sender, receiver) = mpsc::unbounded_channel();

	let task = tokio::spawn(async move {
		let mut cursor = start;
		let mut gate = FinalityGate::new(delay);

		loop {
			if *shutdown.borrow() {
				break;
			}

			let head = heads
				.borrow_and_update()
				.as_ref()
				.map(|block| block.block_number);

			if let Some(head) = head {
				if head >= cursor {
					match source.events_between(cursor, head).await {
						Ok(events) => {
							tracing::debug!(
								from = cursor,
								to = head,
								events = events.len(),
								"Processed blocks"
							);
							gate.hold(events);
							cursor = head + 1;
						},
						Err(DriverError::Rpc(e)) => {
							tracing::warn!(
								from = cursor,
								to = head,
								error = %e,
								"Failed to fetch events, retrying on next block"
							);
						},
						Err(e) => {
							tracing::error!(error = %e, "Listener stopped");
							let _ = sender.send(Err(e));
							break;
						},
					}
				}

				for event in gate.release(head) {
					if sender.send(Ok(event)).is_err() {
						return;
					}
				}
			}

			tokio::select! {
				changed = heads.changed() => {
					if changed.is_err() {
						break;
					}
				}
				changed = shutdown.changed() => {
					if changed.is_err() {
						break;
					}
				}
				_ = sender.closed() => break,
			}
		}
	});

	EventStream::new(receiver, Some(task))
}
