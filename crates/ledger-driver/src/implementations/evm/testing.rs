//! In-memory EVM node used by the driver tests.

use super::rpc::{EvmCallRequest, EvmLog, EvmLogFilter, EvmReceipt, EvmRpc, EvmTransaction};
use crate::RpcError;
use alloy_consensus::{TxEnvelope, TxLegacy};
use alloy_dyn_abi::DynSolValue;
use alloy_eips::eip2718::Decodable2718;
use alloy_json_abi::JsonAbi;
use alloy_primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use ledger_types::{BlockInfo, ONE_GWEI};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

/// First Anvil development key.
pub(crate) const TEST_KEY: &str =
	"0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

pub(crate) struct MockState {
	pub chain_id: u64,
	pub head: u64,
	pub gas_price: u128,
	pub nonce: u64,
	pub estimate: u64,
	pub call_result: Bytes,
	pub call_error: Option<RpcError>,
	pub send_errors: VecDeque<RpcError>,
	pub sent: Vec<(B256, TxLegacy)>,
	pub receipts: HashMap<B256, EvmReceipt>,
	pub transactions: HashMap<B256, EvmTransaction>,
	pub logs: Vec<EvmLog>,
	pub log_queries: Vec<EvmLogFilter>,
	pub calls: Vec<EvmCallRequest>,
}

pub(crate) struct MockEvmRpc {
	state: Mutex<MockState>,
}

impl MockEvmRpc {
	pub fn new() -> Self {
		Self {
			state: Mutex::new(MockState {
				chain_id: 1337,
				head: 100,
				gas_price: 150 * ONE_GWEI,
				nonce: 0,
				estimate: 21_000,
				call_result: Bytes::new(),
				call_error: None,
				send_errors: VecDeque::new(),
				sent: Vec::new(),
				receipts: HashMap::new(),
				transactions: HashMap::new(),
				logs: Vec::new(),
				log_queries: Vec::new(),
				calls: Vec::new(),
			}),
		}
	}

	pub fn state(&self) -> MutexGuard<'_, MockState> {
		self.state.lock().unwrap()
	}

	/// Mines the transaction in `block`.
	pub fn include(&self, hash: B256, block: u64, status: bool, logs: Vec<EvmLog>) {
		let mut state = self.state();
		state.receipts.insert(
			hash,
			EvmReceipt {
				transaction_hash: hash,
				status,
				block_number: Some(block),
				block_hash: Some(block_hash(block)),
				logs,
			},
		);
		if let Some(tx) = state.transactions.get_mut(&hash) {
			tx.block_number = Some(block);
		}
	}

	/// Last broadcast transaction.
	pub fn last_sent(&self) -> (B256, TxLegacy) {
		self.state().sent.last().cloned().unwrap()
	}
}

pub(crate) fn block_hash(number: u64) -> B256 {
	B256::from(U256::from(number))
}

/// A `Transfer(from, to, value)` log of the token ABI.
pub(crate) fn transfer_log(contract: Address, block: u64, tx_byte: u8, value: u64) -> EvmLog {
	let abi: JsonAbi = serde_json::from_str(super::abi::tests::TOKEN_ABI).unwrap();
	let event = &abi.event("Transfer").unwrap()[0];
	EvmLog {
		address: contract,
		topics: vec![
			event.selector(),
			Address::repeat_byte(0xaa).into_word(),
			Address::repeat_byte(0xbb).into_word(),
		],
		data: DynSolValue::Uint(U256::from(value), 256).abi_encode().into(),
		block_number: Some(block),
		block_hash: Some(block_hash(block)),
		transaction_hash: Some(B256::with_last_byte(tx_byte)),
	}
}

#[async_trait]
impl EvmRpc for MockEvmRpc {
	async fn chain_id(&self) -> Result<u64, RpcError> {
		Ok(self.state().chain_id)
	}

	async fn latest_block(&self) -> Result<BlockInfo, RpcError> {
		let head = self.state().head;
		Ok(BlockInfo {
			block_number: head,
			block_hash: format!("{:#x}", block_hash(head)),
		})
	}

	async fn gas_price(&self) -> Result<u128, RpcError> {
		Ok(self.state().gas_price)
	}

	async fn pending_nonce(&self, _address: Address) -> Result<u64, RpcError> {
		Ok(self.state().nonce)
	}

	async fn estimate_gas(&self, _request: &EvmCallRequest) -> Result<u64, RpcError> {
		Ok(self.state().estimate)
	}

	async fn call(&self, request: &EvmCallRequest) -> Result<Bytes, RpcError> {
		let mut state = self.state();
		state.calls.push(request.clone());
		match state.call_error.clone() {
			Some(error) => Err(error),
			None => Ok(state.call_result.clone()),
		}
	}

	async fn send_raw_transaction(&self, raw: &[u8]) -> Result<B256, RpcError> {
		let mut state = self.state();
		if let Some(error) = state.send_errors.pop_front() {
			return Err(error);
		}
		let envelope = TxEnvelope::decode_2718(&mut &raw[..])
			.map_err(|e| RpcError::Node {
				id: None,
				message: e.to_string(),
			})?;
		let TxEnvelope::Legacy(signed) = envelope else {
			return Err(RpcError::Node {
				id: None,
				message: "unexpected transaction type".into(),
			});
		};
		let hash = *signed.hash();
		let tx = signed.tx().clone();
		state.nonce = state.nonce.max(tx.nonce + 1);
		state.transactions.insert(
			hash,
			EvmTransaction {
				hash,
				nonce: tx.nonce,
				gas_price: Some(tx.gas_price),
				gas_limit: tx.gas_limit,
				block_number: None,
			},
		);
		state.sent.push((hash, tx));
		Ok(hash)
	}

	async fn transaction_receipt(&self, hash: B256) -> Result<Option<EvmReceipt>, RpcError> {
		Ok(self.state().receipts.get(&hash).cloned())
	}

	async fn transaction_by_hash(&self, hash: B256) -> Result<Option<EvmTransaction>, RpcError> {
		Ok(self.state().transactions.get(&hash).cloned())
	}

	async fn logs(&self, filter: &EvmLogFilter) -> Result<Vec<EvmLog>, RpcError> {
		let mut state = self.state();
		state.log_queries.push(filter.clone());
		Ok(state
			.logs
			.iter()
			.filter(|log| {
				log.address == filter.address
					&& log
						.block_number
						.is_some_and(|n| n >= filter.from_block && n <= filter.to_block)
			})
			.cloned()
			.collect())
	}
}
