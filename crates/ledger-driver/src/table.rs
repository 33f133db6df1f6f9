//! Transaction table shared by a driver's operations and its block poller.
//!
//! Each record is stored in a concurrent map keyed by transaction id. Records
//! that are still pending also own a status channel: waiters subscribe to it,
//! and the single transition to a terminal status publishes that status and
//! drops the sender, completing the channel.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ledger_types::{TransactionId, TransactionInfo, TransactionStatus};
use tokio::sync::watch;

/// Lifecycle records and status channels of one driver.
pub struct TransactionTable<I, P> {
	infos: DashMap<TransactionId, TransactionInfo<I, P>>,
	channels: DashMap<TransactionId, watch::Sender<TransactionStatus>>,
}

impl<I, P> Default for TransactionTable<I, P> {
	fn default() -> Self {
		Self {
			infos: DashMap::new(),
			channels: DashMap::new(),
		}
	}
}

impl<I: Clone, P: Clone> TransactionTable<I, P> {
	pub fn new() -> Self {
		Self::default()
	}

	/// Stores a record, opening its status channel when it is pending.
	pub fn register(&self, info: TransactionInfo<I, P>) {
		let id = info.id.clone();
		let status = info.status;
		self.infos.insert(id.clone(), info);
		if !status.is_final() {
			let (sender, _) = watch::channel(status);
			self.channels.insert(id, sender);
		}
	}

	/// Moves a pending record to a terminal status.
	///
	/// `update` runs on the record under the same lock as the status change.
	/// Returns false, leaving the record untouched, when the id is unknown,
	/// the record is already terminal or `status` is not terminal.
	pub fn transition<F>(&self, id: &TransactionId, status: TransactionStatus, update: F) -> bool
	where
		F: FnOnce(&mut TransactionInfo<I, P>),
	{
		if !status.is_final() {
			return false;
		}
		{
			let Some(mut entry) = self.infos.get_mut(id) else {
				return false;
			};
			if entry.status.is_final() {
				return false;
			}
			entry.status = status;
			entry.last_status_timestamp = Utc::now();
			update(entry.value_mut());
		}
		if let Some((_, sender)) = self.channels.remove(id) {
			sender.send_replace(status);
		}
		true
	}

	/// Applies a change that does not touch the status.
	pub fn modify<F>(&self, id: &TransactionId, update: F) -> bool
	where
		F: FnOnce(&mut TransactionInfo<I, P>),
	{
		match self.infos.get_mut(id) {
			Some(mut entry) => {
				update(entry.value_mut());
				true
			},
			None => false,
		}
	}

	/// Subscribes to the status channel of a pending record.
	///
	/// Returns `None` once the record is terminal or for unknown ids.
	pub fn subscribe(&self, id: &TransactionId) -> Option<watch::Receiver<TransactionStatus>> {
		self.channels.get(id).map(|sender| sender.subscribe())
	}

	pub fn get(&self, id: &TransactionId) -> Option<TransactionInfo<I, P>> {
		self.infos.get(id).map(|entry| entry.value().clone())
	}

	pub fn status(&self, id: &TransactionId) -> Option<TransactionStatus> {
		self.infos.get(id).map(|entry| entry.status)
	}

	pub fn contains(&self, id: &TransactionId) -> bool {
		self.infos.contains_key(id)
	}

	pub fn all(&self) -> Vec<TransactionInfo<I, P>> {
		self.infos.iter().map(|entry| entry.value().clone()).collect()
	}

	/// Returns the records still waiting for a terminal status.
	pub fn pending(&self) -> Vec<TransactionInfo<I, P>> {
		self.infos
			.iter()
			.filter(|entry| entry.status == TransactionStatus::Pending)
			.map(|entry| entry.value().clone())
			.collect()
	}

	/// Caches a terminal record obtained from the ledger.
	///
	/// Local records always win; pending external records are not cached.
	pub fn cache_external(&self, info: TransactionInfo<I, P>) {
		if info.status.is_final() {
			self.infos.entry(info.id.clone()).or_insert(info);
		}
	}

	/// Removes terminal records whose last transition is older than `cutoff`.
	///
	/// Returns the number of records removed.
	pub fn evict_terminal_older_than(&self, cutoff: DateTime<Utc>) -> usize {
		let before = self.infos.len();
		self.infos
			.retain(|_, info| !(info.status.is_final() && info.last_status_timestamp < cutoff));
		before.saturating_sub(self.infos.len())
	}

	/// Drops every status channel; pending waiters observe a closed channel.
	pub fn close(&self) {
		self.channels.clear();
	}
}
