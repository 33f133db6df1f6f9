//! Confirmation waiting and transaction-info resolution shared by the drivers.

use crate::{DriverError, TransactionInfoProvider, TransactionTable};
use ledger_types::{truncate_id, TransactionId, TransactionInfo, TransactionStatus};
use std::future::Future;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

/// Waits until `id` leaves the pending status.
///
/// Local pending transactions are awaited on their status channel; local
/// terminal ones are answered from the table. Any other id is polled through
/// `fetch` every `poll_interval`.
pub(crate) async fn wait_for_confirmation<I, P, F, Fut>(
	table: &TransactionTable<I, P>,
	id: &TransactionId,
	poll_interval: Duration,
	mut fetch: F,
) -> Result<(), DriverError>
where
	I: Clone,
	P: Clone,
	F: FnMut() -> Fut,
	Fut: Future<Output = Result<TransactionInfo<I, P>, DriverError>>,
{
	if let Some(mut receiver) = table.subscribe(id) {
		let status = *receiver
			.wait_for(TransactionStatus::is_final)
			.await
			.map_err(|_| DriverError::Closed)?;
		let reason = table.get(id).and_then(|info| info.current_error);
		return settle(id, status, reason);
	}

	if let Some(info) = table.get(id) {
		if info.status.is_final() {
			return settle(id, info.status, info.current_error);
		}
	}

	tracing::debug!(
		tx_id = %truncate_id(id.as_str()),
		"Polling status of transaction without local channel"
	);
	let mut interval = tokio::time::interval(poll_interval);
	interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
	loop {
		interval.tick().await;
		let info = fetch().await?;
		if info.status.is_final() {
			return settle(id, info.status, info.current_error);
		}
	}
}

fn settle(
	id: &TransactionId,
	status: TransactionStatus,
	reason: Option<String>,
) -> Result<(), DriverError> {
	match status {
		TransactionStatus::Rejected => Err(DriverError::Rejected {
			id: id.clone(),
			reason: reason.unwrap_or_else(|| "Transaction rejected".to_string()),
		}),
		_ => Ok(()),
	}
}

/// Returns the local record of `id`, falling back to `provider`.
///
/// Terminal records obtained from the provider are cached in the table.
pub(crate) async fn resolve_transaction_info<I, P>(
	table: &TransactionTable<I, P>,
	provider: &dyn TransactionInfoProvider<I, P>,
	id: &TransactionId,
) -> Result<TransactionInfo<I, P>, DriverError>
where
	I: Clone,
	P: Clone,
{
	if let Some(info) = table.get(id) {
		return Ok(info);
	}

	match provider.get_transaction_info(id).await? {
		Some(info) => {
			table.cache_external(info.clone());
			Ok(info)
		},
		None => Err(DriverError::NotFound(id.clone())),
	}
}
