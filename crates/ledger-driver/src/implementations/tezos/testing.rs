//! In-memory Tezos node and signer used by the driver tests.

use super::rpc::{
	ContentMetadata, InternalOperationResult, OperationContent, OperationEntry, OperationResult,
	PendingOperations, TezosBlock, TezosBlockHeader, TezosNodeError, TezosRpc, TezosUnsignedOperation,
	TransactionContent,
};
use crate::RpcError;
use async_trait::async_trait;
use ledger_types::{Signer, SignerError};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

pub(crate) const CONTRACT: &str = "KT1BEqzn5Wx8uJrZNvuS9DVHmLvG9td3fDLi";
pub(crate) const SOURCE: &str = "tz1VSUr8wwNhLAzempoch5d6hLRiTh8Cjcjb";
pub(crate) const SIGNATURE: [u8; 64] = [0x11; 64];

pub(crate) struct MockState {
	pub head: u64,
	pub blocks: HashMap<u64, TezosBlock>,
	pub counter: u64,
	pub entrypoints: HashMap<String, HashMap<String, Value>>,
	pub storage: HashMap<String, Value>,
	pub simulation_status: String,
	pub simulation_errors: Vec<String>,
	pub consumed_milligas: u64,
	pub paid_storage_size_diff: u64,
	pub forged_size: usize,
	pub simulated: Vec<Vec<TransactionContent>>,
	pub forged: Vec<Vec<TransactionContent>>,
	pub injected: Vec<Vec<u8>>,
	pub inject_errors: VecDeque<RpcError>,
	pub pending: PendingOperations,
	pub block_requests: Vec<Option<u64>>,
}

pub(crate) struct MockTezosRpc {
	state: Mutex<MockState>,
}

impl MockTezosRpc {
	pub fn new() -> Self {
		Self {
			state: Mutex::new(MockState {
				head: 100,
				blocks: HashMap::new(),
				counter: 41,
				entrypoints: HashMap::new(),
				storage: HashMap::new(),
				simulation_status: "applied".to_string(),
				simulation_errors: Vec::new(),
				consumed_milligas: 2_500_000,
				paid_storage_size_diff: 0,
				forged_size: 150,
				simulated: Vec::new(),
				forged: Vec::new(),
				injected: Vec::new(),
				inject_errors: VecDeque::new(),
				pending: PendingOperations::default(),
				block_requests: Vec::new(),
			}),
		}
	}

	pub fn state(&self) -> MutexGuard<'_, MockState> {
		self.state.lock().unwrap()
	}

	/// Adds `entry` to the block at `level`.
	pub fn include(&self, level: u64, entry: OperationEntry) {
		let mut state = self.state();
		let block = state
			.blocks
			.entry(level)
			.or_insert_with(|| block_with(level, Vec::new()));
		block.operations[0].push(entry);
	}

	/// Hash returned for the most recent injection.
	pub fn last_hash(&self) -> String {
		operation_hash(self.state().injected.len())
	}
}

fn operation_hash(index: usize) -> String {
	format!("ooMockOperation{}", index)
}

pub(crate) fn block_hash(level: u64) -> String {
	format!("BLockMock{}", level)
}

pub(crate) fn block_with(level: u64, entries: Vec<OperationEntry>) -> TezosBlock {
	TezosBlock {
		hash: block_hash(level),
		header: TezosBlockHeader { level },
		operations: vec![entries],
	}
}

pub(crate) fn applied(status: &str, error_ids: &[&str]) -> OperationResult {
	OperationResult {
		status: status.to_string(),
		consumed_milligas: Some("1000".to_string()),
		paid_storage_size_diff: None,
		allocated_destination_contract: None,
		errors: error_ids
			.iter()
			.map(|id| TezosNodeError {
				kind: Some("temporary".to_string()),
				id: id.to_string(),
			})
			.collect(),
	}
}

/// A call to `destination` with its result and internal operations.
pub(crate) fn contract_call(
	hash: &str,
	destination: &str,
	counter: u64,
	result: OperationResult,
	internal: Vec<InternalOperationResult>,
) -> OperationEntry {
	OperationEntry {
		hash: hash.to_string(),
		contents: vec![OperationContent {
			kind: "transaction".to_string(),
			source: Some(SOURCE.to_string()),
			destination: Some(destination.to_string()),
			counter: Some(counter.to_string()),
			metadata: Some(ContentMetadata {
				operation_result: Some(result),
				internal_operation_results: Some(internal),
			}),
		}],
	}
}

pub(crate) fn event_result(source: &str, tag: &str, payload: Value) -> InternalOperationResult {
	InternalOperationResult {
		kind: "event".to_string(),
		source: Some(source.to_string()),
		tag: Some(tag.to_string()),
		payload: Some(payload),
		result: Some(applied("applied", &[])),
	}
}

/// An applied call to `contract` emitting one event.
pub(crate) fn event_call(hash: &str, contract: &str, tag: &str, payload: Value) -> OperationEntry {
	contract_call(
		hash,
		contract,
		1,
		applied("applied", &[]),
		vec![event_result(contract, tag, payload)],
	)
}

#[async_trait]
impl TezosRpc for MockTezosRpc {
	async fn chain_id(&self) -> Result<String, RpcError> {
		Ok("NetXdQprcVkpaWU".to_string())
	}

	async fn block(&self, level: Option<u64>) -> Result<TezosBlock, RpcError> {
		let mut state = self.state();
		state.block_requests.push(level);
		let level = level.unwrap_or(state.head);
		if level > state.head {
			return Err(RpcError::Http {
				status: 404,
				body: "block not found".to_string(),
			});
		}
		Ok(state
			.blocks
			.get(&level)
			.cloned()
			.unwrap_or_else(|| block_with(level, Vec::new())))
	}

	async fn counter(&self, _address: &str) -> Result<u64, RpcError> {
		Ok(self.state().counter)
	}

	async fn entrypoints(&self, contract: &str) -> Result<Option<HashMap<String, Value>>, RpcError> {
		Ok(self.state().entrypoints.get(contract).cloned())
	}

	async fn storage(&self, contract: &str) -> Result<Value, RpcError> {
		self.state()
			.storage
			.get(contract)
			.cloned()
			.ok_or_else(|| RpcError::Http {
				status: 404,
				body: "contract not found".to_string(),
			})
	}

	async fn run_operation(
		&self,
		_branch: &str,
		contents: &[TransactionContent],
		_signature: &str,
		_chain_id: &str,
	) -> Result<Vec<OperationContent>, RpcError> {
		let mut state = self.state();
		state.simulated.push(contents.to_vec());
		let error_ids: Vec<&str> = state.simulation_errors.iter().map(String::as_str).collect();
		let mut result = applied(&state.simulation_status, &error_ids);
		result.consumed_milligas = Some(state.consumed_milligas.to_string());
		result.paid_storage_size_diff = Some(state.paid_storage_size_diff.to_string());

		Ok(contents
			.iter()
			.map(|content| OperationContent {
				kind: content.kind.clone(),
				source: Some(content.source.clone()),
				destination: Some(content.destination.clone()),
				counter: Some(content.counter.clone()),
				metadata: Some(ContentMetadata {
					operation_result: Some(result.clone()),
					internal_operation_results: None,
				}),
			})
			.collect())
	}

	async fn forge(
		&self,
		_branch: &str,
		contents: &[TransactionContent],
	) -> Result<Vec<u8>, RpcError> {
		let mut state = self.state();
		state.forged.push(contents.to_vec());
		Ok(vec![0xab; state.forged_size])
	}

	async fn inject(&self, signed_operation: &[u8]) -> Result<String, RpcError> {
		let mut state = self.state();
		if let Some(error) = state.inject_errors.pop_front() {
			return Err(error);
		}
		state.injected.push(signed_operation.to_vec());
		state.counter += 1;
		Ok(operation_hash(state.injected.len()))
	}

	async fn pending_operations(&self) -> Result<PendingOperations, RpcError> {
		Ok(self.state().pending.clone())
	}
}

/// Signer returning a fixed signature.
pub(crate) struct MockTezosSigner {
	pub address: Option<String>,
	pub signed: Mutex<Vec<TezosUnsignedOperation>>,
}

impl MockTezosSigner {
	pub fn new() -> Self {
		Self {
			address: Some(SOURCE.to_string()),
			signed: Mutex::new(Vec::new()),
		}
	}
}

#[async_trait]
impl Signer<TezosUnsignedOperation> for MockTezosSigner {
	async fn sign(&self, operation: &TezosUnsignedOperation) -> Result<Vec<u8>, SignerError> {
		self.signed.lock().unwrap().push(operation.clone());
		Ok(SIGNATURE.to_vec())
	}

	async fn public_key(&self) -> Result<String, SignerError> {
		Ok("edpkuBknW28nW72KG6RoHtYW7p12T6GKc7nAbwYX5m8Wd9sDVC9yav".to_string())
	}

	async fn address(&self) -> Result<Option<String>, SignerError> {
		Ok(self.address.clone())
	}
}
