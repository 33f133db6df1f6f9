//! Ledger driver module for the transaction orchestration layer.
//!
//! This module defines the contract every ledger driver fulfils: submitting
//! transactions, tracking them through their lifecycle, waiting for their
//! confirmation, replacing them while pending, performing read-only calls and
//! streaming contract events once they are old enough to be considered final.
//! It also hosts the shared machinery drivers are built from and the EVM and
//! Tezos implementations.

use async_trait::async_trait;
use futures::Stream;
use ledger_types::{
	AbstractTransaction, BlockInfo, Event, ListenParams, MappingError, SignerError,
	TransactionId, TransactionInfo, TransactionReceipt, TransactionStatus,
};
use std::pin::Pin;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Re-export implementations
pub mod implementations {
	pub mod evm;
	pub mod tezos;
}

mod finality;
mod lifecycle;
mod listener;
mod runtime;
pub mod table;

pub use table::TransactionTable;

/// Errors reported by the RPC capabilities drivers talk to.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RpcError {
	/// The request never got a response from the node.
	#[error("Connection error: {0}")]
	Connection(String),
	/// The node answered with a non-success HTTP status.
	#[error("HTTP error {status}: {body}")]
	Http { status: u16, body: String },
	/// The node processed the request and reported an error.
	#[error("Node error: {message}")]
	Node { id: Option<String>, message: String },
	/// The response could not be interpreted.
	#[error("Invalid response: {0}")]
	Decode(String),
}

/// Errors that can occur during driver operations.
#[derive(Debug, Error)]
pub enum DriverError {
	/// Transient failure; the operation may succeed if attempted again.
	#[error("Retriable error: {0}")]
	Retriable(Box<DriverError>),
	/// Missing or invalid configuration, ABI, mapper, method or event.
	#[error("Configuration error: {0}")]
	Configuration(String),
	/// The transaction is not in a status that allows the operation.
	#[error("Cannot {operation} transaction {id} with status {status}")]
	InvalidState {
		id: TransactionId,
		status: TransactionStatus,
		operation: &'static str,
	},
	/// The transaction record lacks what the operation needs.
	#[error("Missing {what} for transaction {id}")]
	MissingDetails {
		id: TransactionId,
		what: &'static str,
	},
	/// The ledger does not support the operation.
	#[error("Unsupported operation: {0}")]
	Unsupported(String),
	/// Neither the driver nor its transaction-info provider know the id.
	#[error("Transaction with id[{0}] unknown")]
	NotFound(TransactionId),
	/// Error reported by the RPC capability.
	#[error("RPC error: {0}")]
	Rpc(#[from] RpcError),
	/// Error reported by the signer.
	#[error("Signer error: {0}")]
	Signing(#[from] SignerError),
	/// The transaction reached the rejected status.
	#[error("Transaction {id} rejected: {reason}")]
	Rejected { id: TransactionId, reason: String },
	/// Ledger data could not be decoded or encoded.
	#[error("Decoding error: {0}")]
	Decode(String),
	/// Error raised by a payload mapper.
	#[error("Mapping error: {0}")]
	Mapping(#[from] MappingError),
	/// The driver has been closed.
	#[error("Driver is closed")]
	Closed,
}

impl DriverError {
	/// Marks the error as transient.
	pub fn retriable(self) -> Self {
		match self {
			DriverError::Retriable(_) => self,
			other => DriverError::Retriable(Box::new(other)),
		}
	}

	pub fn is_retriable(&self) -> bool {
		matches!(self, DriverError::Retriable(_))
	}

	/// Returns the error without its retriable marker.
	pub fn root_cause(&self) -> &DriverError {
		match self {
			DriverError::Retriable(inner) => inner.root_cause(),
			other => other,
		}
	}
}

/// Trait defining the interface every ledger driver implements.
///
/// A driver owns one connection to its ledger and one transaction table.
/// `initialize` is invoked lazily by every other operation, so callers only
/// need it to surface connection problems early. After `close` every
/// operation fails with [`DriverError::Closed`].
#[async_trait]
pub trait BlockchainDriver: Send + Sync {
	/// Ledger-specific submission parameters.
	type Params: Clone + Send + Sync + 'static;
	/// Ledger-specific fee fields recorded for each transaction.
	type Info: Clone + Send + Sync + 'static;

	/// Establishes the connection and starts the block poller. Idempotent.
	async fn initialize(&self) -> Result<(), DriverError>;

	/// Submits a transaction.
	///
	/// Returns as soon as the ledger accepted the transaction into its pending
	/// pool. Transient failures are reported as [`DriverError::Retriable`].
	async fn send(
		&self,
		tx: AbstractTransaction<Self::Params>,
	) -> Result<TransactionReceipt, DriverError>;

	/// Performs a read-only call without touching the transaction table.
	async fn call(
		&self,
		tx: AbstractTransaction<Self::Params>,
	) -> Result<serde_json::Value, DriverError>;

	/// Streams events of a contract once they are old enough to be final.
	///
	/// With `from` set, historical blocks are replayed first; otherwise only
	/// blocks after the current head are processed.
	async fn listen(&self, params: ListenParams<Self::Params>) -> Result<EventStream, DriverError>;

	/// Returns the local record of a transaction, falling back to the ledger
	/// for transactions this driver did not send.
	async fn get_transaction_info(
		&self,
		id: &TransactionId,
	) -> Result<TransactionInfo<Self::Info, Self::Params>, DriverError>;

	/// Returns every locally known transaction.
	async fn get_transactions_info(
		&self,
	) -> Result<Vec<TransactionInfo<Self::Info, Self::Params>>, DriverError>;

	/// Waits until the transaction leaves the pending status.
	///
	/// Fails with [`DriverError::Rejected`] when the transaction is rejected;
	/// confirmed and cancelled transactions resolve successfully.
	async fn wait_for_confirmation(&self, id: &TransactionId) -> Result<(), DriverError>;

	/// Resubmits a pending transaction with a higher fee.
	async fn boost_transaction(
		&self,
		id: &TransactionId,
		params: Option<Self::Params>,
	) -> Result<TransactionReceipt, DriverError>;

	/// Replaces a pending transaction with a no-op.
	async fn cancel_transaction(
		&self,
		id: &TransactionId,
		params: Option<Self::Params>,
	) -> Result<TransactionReceipt, DriverError>;

	/// Returns the most recent block known to the driver.
	async fn get_last_block(&self) -> Result<BlockInfo, DriverError>;

	/// Releases the connection, background tasks and subscriptions.
	async fn close(&self) -> Result<(), DriverError>;

	/// Returns true when a failed `send` may succeed if attempted again.
	fn should_retry(&self, error: &DriverError) -> bool {
		error.is_retriable()
	}
}

/// Source of records for transactions the driver did not send itself.
#[async_trait]
pub trait TransactionInfoProvider<I, P>: Send + Sync {
	/// Returns `None` when the ledger does not know the transaction.
	async fn get_transaction_info(
		&self,
		id: &TransactionId,
	) -> Result<Option<TransactionInfo<I, P>>, DriverError>;
}

/// Live stream of contract events.
///
/// The stream ends when the driver is closed or the listener fails; a failure
/// is delivered as the last item. Dropping the stream stops its listener.
pub struct EventStream {
	inner: UnboundedReceiverStream<Result<Event, DriverError>>,
	task: Option<JoinHandle<()>>,
}

impl EventStream {
	pub fn new(
		receiver: mpsc::UnboundedReceiver<Result<Event, DriverError>>,
		task: Option<JoinHandle<()>>,
	) -> Self {
		Self {
			inner: UnboundedReceiverStream::new(receiver),
			task,
		}
	}

	/// Stops the listener feeding this stream.
	pub fn cancel(&mut self) {
		if let Some(task) = self.task.take() {
			task.abort();
		}
	}
}

impl Stream for EventStream {
	type Item = Result<Event, DriverError>;

	fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
		Pin::new(&mut self.inner).poll_next(cx)
	}
}

impl Drop for EventStream {
	fn drop(&mut self) {
		self.cancel();
	}
}

impl std::fmt::Debug for EventStream {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("EventStream")
			.field("running", &self.task.is_some())
			.finish()
	}
}
