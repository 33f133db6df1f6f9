//! Event types for on-chain notifications.
//!
//! Events are what the extraction pipelines produce from raw block data: a
//! decoded, mapped payload stamped with where it came from.

use crate::TransactionId;
use serde::{Deserialize, Serialize};

/// Event-name filter that matches every event of a contract.
pub const ALL_EVENTS: &str = "allEvents";

/// A decoded contract event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
	pub event_name: String,
	pub smart_contract_address: String,
	pub block_number: u64,
	pub block_hash: String,
	/// Transaction (operation hash on Tezos) that emitted the event.
	pub transaction_id: TransactionId,
	/// Decoded payload after the name-keyed mapper has been applied.
	pub payload: serde_json::Value,
}

/// Reference to a block on the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
	pub block_number: u64,
	pub block_hash: String,
}

/// Parameters of a `listen` subscription.
#[derive(Debug, Clone)]
pub struct ListenParams<P> {
	pub smart_contract_address: String,
	/// Event name, or [`ALL_EVENTS`].
	pub event_name: String,
	/// First block to replay; live blocks only when absent.
	pub from: Option<u64>,
	pub blockchain_specific_params: Option<P>,
}

impl<P> ListenParams<P> {
	pub fn new(smart_contract_address: impl Into<String>, event_name: impl Into<String>) -> Self {
		Self {
			smart_contract_address: smart_contract_address.into(),
			event_name: event_name.into(),
			from: None,
			blockchain_specific_params: None,
		}
	}

	pub fn from_block(mut self, block_number: u64) -> Self {
		self.from = Some(block_number);
		self
	}

	pub fn with_params(mut self, params: P) -> Self {
		self.blockchain_specific_params = Some(params);
		self
	}

	/// Returns true when the subscription matches an event called `name`.
	pub fn matches(&self, name: &str) -> bool {
		self.event_name == ALL_EVENTS || self.event_name == name
	}
}
