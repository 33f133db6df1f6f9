//! RPC capability the EVM driver is built on.
//!
//! The driver only sees these ledger-neutral shapes; the alloy adapter in
//! [`super::alloy`] converts them from and to the JSON-RPC types.

use crate::RpcError;
use alloy_primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use ledger_types::BlockInfo;

/// A log entry as returned by the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvmLog {
	pub address: Address,
	pub topics: Vec<B256>,
	pub data: Bytes,
	pub block_number: Option<u64>,
	pub block_hash: Option<B256>,
	pub transaction_hash: Option<B256>,
}

/// Receipt of an included transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvmReceipt {
	pub transaction_hash: B256,
	/// False when execution reverted.
	pub status: bool,
	pub block_number: Option<u64>,
	pub block_hash: Option<B256>,
	pub logs: Vec<EvmLog>,
}

/// A transaction as known to the node, included or not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvmTransaction {
	pub hash: B256,
	pub nonce: u64,
	pub gas_price: Option<u128>,
	pub gas_limit: u64,
	/// Inclusion block; `None` while in the mempool.
	pub block_number: Option<u64>,
}

/// Arguments of `eth_call` and `eth_estimateGas`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvmCallRequest {
	pub from: Option<Address>,
	pub to: Address,
	pub data: Bytes,
	pub value: U256,
	pub gas: Option<u64>,
	pub gas_price: Option<u128>,
}

/// Log query over an inclusive block range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvmLogFilter {
	pub address: Address,
	pub from_block: u64,
	pub to_block: u64,
}

/// Node operations used by the EVM driver.
#[async_trait]
pub trait EvmRpc: Send + Sync {
	async fn chain_id(&self) -> Result<u64, RpcError>;

	async fn latest_block(&self) -> Result<BlockInfo, RpcError>;

	/// Price suggested by the node, in wei.
	async fn gas_price(&self) -> Result<u128, RpcError>;

	/// Transaction count of `address` including pending transactions.
	async fn pending_nonce(&self, address: Address) -> Result<u64, RpcError>;

	async fn estimate_gas(&self, request: &EvmCallRequest) -> Result<u64, RpcError>;

	async fn call(&self, request: &EvmCallRequest) -> Result<Bytes, RpcError>;

	/// Broadcasts a signed transaction and returns its hash.
	async fn send_raw_transaction(&self, raw: &[u8]) -> Result<B256, RpcError>;

	async fn transaction_receipt(&self, hash: B256) -> Result<Option<EvmReceipt>, RpcError>;

	async fn transaction_by_hash(&self, hash: B256) -> Result<Option<EvmTransaction>, RpcError>;

	async fn logs(&self, filter: &EvmLogFilter) -> Result<Vec<EvmLog>, RpcError>;
}
