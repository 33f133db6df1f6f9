//! Transaction manager for the orchestration layer.
//!
//! The manager is the entry point callers use. It owns one driver and runs
//! every submission through the retry engine, asking the driver which errors
//! are worth another attempt. Every other operation is handed to the driver
//! unchanged.

use ledger_driver::{BlockchainDriver, DriverError, EventStream};
use ledger_retry::with_retry;
use ledger_types::{
	truncate_id, AbstractTransaction, BlockInfo, ListenParams, TransactionId, TransactionInfo,
	TransactionReceipt,
};
use std::sync::Arc;
use tracing::instrument;

/// Retry policy applied to transaction submission.
pub type TxRetryConfig = ledger_retry::RetryConfig;

/// Record type of the transactions handled by driver `D`.
pub type DriverTransactionInfo<D> =
	TransactionInfo<<D as BlockchainDriver>::Info, <D as BlockchainDriver>::Params>;

/// Façade over a [`BlockchainDriver`] that retries submissions.
pub struct TransactionManager<D: BlockchainDriver> {
	driver: Arc<D>,
	retry: TxRetryConfig,
}

impl<D: BlockchainDriver> TransactionManager<D> {
	pub fn new(driver: D, retry: TxRetryConfig) -> Self {
		Self::from_shared(Arc::new(driver), retry)
	}

	/// Creates a manager over a driver shared with other components.
	pub fn from_shared(driver: Arc<D>, retry: TxRetryConfig) -> Self {
		Self { driver, retry }
	}

	/// Returns the underlying driver.
	pub fn driver(&self) -> &Arc<D> {
		&self.driver
	}

	pub fn retry_config(&self) -> &TxRetryConfig {
		&self.retry
	}

	pub async fn initialize(&self) -> Result<(), DriverError> {
		self.driver.initialize().await
	}

	/// Submits a transaction, retrying while the driver classifies the
	/// failure as retriable.
	///
	/// Once the retry budget is spent the error of the last attempt is
	/// returned as the driver reported it.
	#[instrument(skip_all, fields(to = %truncate_id(&tx.to)))]
	pub async fn send(
		&self,
		tx: AbstractTransaction<D::Params>,
	) -> Result<TransactionReceipt, DriverError> {
		let driver = &self.driver;
		let receipt = with_retry(
			&self.retry,
			|error| driver.should_retry(error),
			|| driver.send(tx.clone()),
		)
		.await?;

		tracing::info!(
			tx_id = %truncate_id(receipt.transaction_id.as_str()),
			"Transaction submitted"
		);
		Ok(receipt)
	}

	pub async fn call(
		&self,
		tx: AbstractTransaction<D::Params>,
	) -> Result<serde_json::Value, DriverError> {
		self.driver.call(tx).await
	}

	pub async fn listen(&self, params: ListenParams<D::Params>) -> Result<EventStream, DriverError> {
		self.driver.listen(params).await
	}

	pub async fn get_transaction_info(
		&self,
		id: &TransactionId,
	) -> Result<DriverTransactionInfo<D>, DriverError> {
		self.driver.get_transaction_info(id).await
	}

	pub async fn get_transactions_info(&self) -> Result<Vec<DriverTransactionInfo<D>>, DriverError> {
		self.driver.get_transactions_info().await
	}

	/// Resolves once the transaction is confirmed or cancelled; fails when it
	/// is rejected.
	pub async fn wait_for_confirmation(&self, id: &TransactionId) -> Result<(), DriverError> {
		self.driver.wait_for_confirmation(id).await
	}

	/// Replaces a pending transaction with a higher-fee copy. Not retried.
	pub async fn boost_transaction(
		&self,
		id: &TransactionId,
		params: Option<D::Params>,
	) -> Result<TransactionReceipt, DriverError> {
		self.driver.boost_transaction(id, params).await
	}

	/// Replaces a pending transaction with a no-op. Not retried.
	pub async fn cancel_transaction(
		&self,
		id: &TransactionId,
		params: Option<D::Params>,
	) -> Result<TransactionReceipt, DriverError> {
		self.driver.cancel_transaction(id, params).await
	}

	pub async fn get_last_block(&self) -> Result<BlockInfo, DriverError> {
		self.driver.get_last_block().await
	}

	pub async fn close(&self) -> Result<(), DriverError> {
		self.driver.close().await
	}
}
