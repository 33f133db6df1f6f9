//! Transaction types for the ledger orchestration layer.
//!
//! This module defines the submission model handed to drivers, the lifecycle
//! record a driver keeps for every transaction it knows about, and the status
//! machine those records move through.

use crate::Event;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Ledger-native transaction identifier.
///
/// A hex hash on EVM ledgers, a base58 operation hash on Tezos. Drivers use it
/// as the primary key of their transaction table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(pub String);

impl TransactionId {
	pub fn new(id: impl Into<String>) -> Self {
		Self(id.into())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for TransactionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl From<String> for TransactionId {
	fn from(id: String) -> Self {
		Self(id)
	}
}

impl From<&str> for TransactionId {
	fn from(id: &str) -> Self {
		Self(id.to_string())
	}
}

impl AsRef<str> for TransactionId {
	fn as_ref(&self) -> &str {
		&self.0
	}
}

/// Lifecycle status of a transaction.
///
/// Every transaction starts `Pending` and reaches exactly one terminal status,
/// which is never left again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
	/// Accepted by the ledger, not yet included with enough confirmations.
	Pending,
	/// Included and executed successfully.
	Confirmed,
	/// Failed, reverted or dropped.
	Rejected,
	/// Superseded by a confirmed replacement.
	Cancelled,
}

impl TransactionStatus {
	/// Returns true for the statuses a transaction can never leave.
	pub fn is_final(&self) -> bool {
		!matches!(self, TransactionStatus::Pending)
	}
}

impl fmt::Display for TransactionStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let label = match self {
			TransactionStatus::Pending => "PENDING",
			TransactionStatus::Confirmed => "CONFIRMED",
			TransactionStatus::Rejected => "REJECTED",
			TransactionStatus::Cancelled => "CANCELLED",
		};
		f.write_str(label)
	}
}

/// Ledger-agnostic description of a transaction to submit or simulate.
///
/// `P` carries the ledger-specific parameters (ABI and gas settings on EVM,
/// fee limits and mappers on Tezos). A submission is immutable once handed to
/// a driver.
#[derive(Debug, Clone)]
pub struct AbstractTransaction<P> {
	/// Recipient account or contract address.
	pub to: String,
	/// Contract entrypoint; `None` means a plain value transfer.
	pub method_name: Option<String>,
	/// Positional entrypoint arguments.
	pub method_parameters: Option<Vec<serde_json::Value>>,
	/// Amount of native currency attached, in the ledger's base unit.
	pub value: Option<u128>,
	/// Explicit nonce/counter; the next available one is used when absent.
	pub nonce: Option<u64>,
	/// Transactions that must leave `Pending` before this one is submitted.
	pub previous_transactions: Vec<TransactionId>,
	/// Set on replacements built by boost and cancel.
	pub replaced_transaction_id: Option<TransactionId>,
	pub blockchain_specific_params: Option<P>,
}

impl<P> AbstractTransaction<P> {
	/// Creates a plain transfer to `to` with no value attached.
	pub fn new(to: impl Into<String>) -> Self {
		Self {
			to: to.into(),
			method_name: None,
			method_parameters: None,
			value: None,
			nonce: None,
			previous_transactions: Vec::new(),
			replaced_transaction_id: None,
			blockchain_specific_params: None,
		}
	}

	/// Turns the transaction into a contract call.
	pub fn with_method(
		mut self,
		method_name: impl Into<String>,
		method_parameters: Vec<serde_json::Value>,
	) -> Self {
		self.method_name = Some(method_name.into());
		self.method_parameters = Some(method_parameters);
		self
	}

	pub fn with_value(mut self, value: u128) -> Self {
		self.value = Some(value);
		self
	}

	pub fn with_nonce(mut self, nonce: u64) -> Self {
		self.nonce = Some(nonce);
		self
	}

	pub fn with_params(mut self, params: P) -> Self {
		self.blockchain_specific_params = Some(params);
		self
	}

	/// Orders this transaction after the given ones.
	pub fn after(mut self, previous: impl IntoIterator<Item = TransactionId>) -> Self {
		self.previous_transactions.extend(previous);
		self
	}

	/// Returns true when the transaction targets a contract entrypoint.
	pub fn is_contract_call(&self) -> bool {
		self.method_name.is_some()
	}
}

/// Lifecycle record a driver keeps for one transaction.
///
/// `I` carries the ledger fee fields actually used, `P` the parameters of the
/// original submission stored in `details`.
#[derive(Debug, Clone)]
pub struct TransactionInfo<I, P> {
	pub id: TransactionId,
	pub nonce: Option<u64>,
	pub status: TransactionStatus,
	pub last_status_timestamp: DateTime<Utc>,
	pub send_timestamp: Option<DateTime<Utc>>,
	pub send_block_number: Option<u64>,
	/// Inclusion block, set on confirmation.
	pub block_number: Option<u64>,
	pub blockchain_specific_transaction_info: Option<I>,
	/// The submission this record was created from, absent for external transactions.
	pub details: Option<AbstractTransaction<P>>,
	pub replaced_transaction_id: Option<TransactionId>,
	pub replacement_transaction_id: Option<TransactionId>,
	/// Failure reason of a rejected transaction.
	pub current_error: Option<String>,
	/// Events emitted by this transaction, filled on confirmation.
	pub emitted_events: Option<Vec<Event>>,
}

impl<I, P> TransactionInfo<I, P> {
	/// Creates the record of a transaction this driver has just broadcast.
	pub fn pending(id: TransactionId, nonce: u64) -> Self {
		let now = Utc::now();
		Self {
			id,
			nonce: Some(nonce),
			status: TransactionStatus::Pending,
			last_status_timestamp: now,
			send_timestamp: Some(now),
			send_block_number: None,
			block_number: None,
			blockchain_specific_transaction_info: None,
			details: None,
			replaced_transaction_id: None,
			replacement_transaction_id: None,
			current_error: None,
			emitted_events: None,
		}
	}

	/// Creates the record of a transaction found on the ledger but not sent by this driver.
	pub fn external(id: TransactionId, nonce: Option<u64>, status: TransactionStatus) -> Self {
		Self {
			id,
			nonce,
			status,
			last_status_timestamp: Utc::now(),
			send_timestamp: None,
			send_block_number: None,
			block_number: None,
			blockchain_specific_transaction_info: None,
			details: None,
			replaced_transaction_id: None,
			replacement_transaction_id: None,
			current_error: None,
			emitted_events: None,
		}
	}
}

/// Returned by a successful submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionReceipt {
	pub transaction_id: TransactionId,
}

impl From<TransactionId> for TransactionReceipt {
	fn from(transaction_id: TransactionId) -> Self {
		Self { transaction_id }
	}
}
