//! RPC capability the Tezos driver is built on.
//!
//! Block and operation shapes follow the node's JSON; only the fields the
//! driver reads are modelled; everything else is ignored on deserialization.

use crate::RpcError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// A block with its operations grouped by validation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TezosBlock {
	pub hash: String,
	pub header: TezosBlockHeader,
	#[serde(default)]
	pub operations: Vec<Vec<OperationEntry>>,
}

impl TezosBlock {
	pub fn level(&self) -> u64 {
		self.header.level
	}

	/// Operations of every validation pass, in block order.
	pub fn entries(&self) -> impl Iterator<Item = &OperationEntry> {
		self.operations.iter().flatten()
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TezosBlockHeader {
	pub level: u64,
}

/// A signed operation and its contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationEntry {
	pub hash: String,
	#[serde(default)]
	pub contents: Vec<OperationContent>,
}

impl OperationEntry {
	/// Counter of the first content when it is a transaction.
	pub fn counter(&self) -> Option<u64> {
		self.contents
			.first()
			.filter(|content| content.kind == "transaction")
			.and_then(|content| content.counter.as_deref())
			.and_then(|counter| counter.parse().ok())
	}
}

/// One manager operation of an [`OperationEntry`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationContent {
	pub kind: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub source: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub destination: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub counter: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub metadata: Option<ContentMetadata>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentMetadata {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub operation_result: Option<OperationResult>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub internal_operation_results: Option<Vec<InternalOperationResult>>,
}

/// Outcome of applying an operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationResult {
	/// `applied`, `failed`, `backtracked` or `skipped`.
	pub status: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub consumed_milligas: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub paid_storage_size_diff: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub allocated_destination_contract: Option<bool>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub errors: Vec<TezosNodeError>,
}

impl OperationResult {
	pub fn is_applied(&self) -> bool {
		self.status == "applied"
	}

	pub fn error_ids(&self) -> Vec<String> {
		self.errors.iter().map(|error| error.id.clone()).collect()
	}
}

/// Operation emitted by a contract while executing, including events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InternalOperationResult {
	pub kind: String,
	#[serde(default)]
	pub source: Option<String>,
	/// Event name when `kind` is `event`.
	#[serde(default)]
	pub tag: Option<String>,
	/// Micheline payload when `kind` is `event`.
	#[serde(default)]
	pub payload: Option<Value>,
	#[serde(default)]
	pub result: Option<OperationResult>,
}

/// Error entry reported by the node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TezosNodeError {
	#[serde(default)]
	pub kind: Option<String>,
	pub id: String,
}

/// A transaction content ready to be forged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionContent {
	pub kind: String,
	pub source: String,
	pub fee: String,
	pub counter: String,
	pub gas_limit: String,
	pub storage_limit: String,
	pub amount: String,
	pub destination: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub parameters: Option<TransactionParameters>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionParameters {
	pub entrypoint: String,
	/// Micheline value.
	pub value: Value,
}

/// Operation handed to the signer.
#[derive(Debug, Clone, PartialEq)]
pub struct TezosUnsignedOperation {
	/// Block hash the operation is anchored to.
	pub branch: String,
	pub contents: Vec<TransactionContent>,
	/// Binary encoding produced by the node.
	pub forged_bytes: Vec<u8>,
}

/// Mempool content, keyed by classification.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingOperations {
	/// Applied or validated operations.
	pub applied: Vec<OperationEntry>,
	pub branch_delayed: Vec<OperationEntry>,
	pub refused: Vec<OperationEntry>,
	pub branch_refused: Vec<OperationEntry>,
}

#[derive(Deserialize)]
struct RawPendingOperations {
	#[serde(default)]
	applied: Vec<Value>,
	#[serde(default)]
	validated: Vec<Value>,
	#[serde(default)]
	branch_delayed: Vec<Value>,
	#[serde(default)]
	refused: Vec<Value>,
	#[serde(default)]
	branch_refused: Vec<Value>,
}

impl PendingOperations {
	/// Parses the `pending_operations` response.
	///
	/// Entries are either operation objects or `[hash, operation]` pairs
	/// depending on the node version; both are accepted.
	pub fn from_json(value: Value) -> Result<Self, RpcError> {
		let raw: RawPendingOperations =
			serde_json::from_value(value).map_err(|e| RpcError::Decode(e.to_string()))?;
		let parse = |entries: Vec<Value>| -> Result<Vec<OperationEntry>, RpcError> {
			entries.into_iter().map(parse_mempool_entry).collect()
		};

		let mut applied = parse(raw.applied)?;
		applied.extend(parse(raw.validated)?);
		Ok(Self {
			applied,
			branch_delayed: parse(raw.branch_delayed)?,
			refused: parse(raw.refused)?,
			branch_refused: parse(raw.branch_refused)?,
		})
	}
}

fn parse_mempool_entry(entry: Value) -> Result<OperationEntry, RpcError> {
	let entry = match entry {
		Value::Array(mut pair) if pair.len() == 2 => {
			let mut operation = pair.pop().unwrap_or_default();
			let hash = pair.pop().unwrap_or_default();
			if let Value::Object(fields) = &mut operation {
				fields.insert("hash".to_string(), hash);
			}
			operation
		},
		other => other,
	};
	serde_json::from_value(entry).map_err(|e| RpcError::Decode(e.to_string()))
}

/// Node RPCs used by the Tezos driver.
#[async_trait]
pub trait TezosRpc: Send + Sync {
	async fn chain_id(&self) -> Result<String, RpcError>;

	/// Block at `level`, or the head when `None`.
	async fn block(&self, level: Option<u64>) -> Result<TezosBlock, RpcError>;

	/// Current counter of an implicit account.
	async fn counter(&self, address: &str) -> Result<u64, RpcError>;

	/// Entrypoint types of a contract; `None` when no contract lives there.
	async fn entrypoints(&self, contract: &str) -> Result<Option<HashMap<String, Value>>, RpcError>;

	/// Micheline storage of a contract.
	async fn storage(&self, contract: &str) -> Result<Value, RpcError>;

	/// Simulates the operation and returns its contents with results.
	async fn run_operation(
		&self,
		branch: &str,
		contents: &[TransactionContent],
		signature: &str,
		chain_id: &str,
	) -> Result<Vec<OperationContent>, RpcError>;

	/// Returns the binary encoding of the operation.
	async fn forge(&self, branch: &str, contents: &[TransactionContent])
		-> Result<Vec<u8>, RpcError>;

	/// Injects a signed operation and returns its hash.
	async fn inject(&self, signed_operation: &[u8]) -> Result<String, RpcError>;

	async fn pending_operations(&self) -> Result<PendingOperations, RpcError>;
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn test_block_deserialization_ignores_unknown_fields() {
		let block: TezosBlock = serde_json::from_value(json!({
			"protocol": "PtNairob",
			"hash": "BLockHash",
			"header": { "level": 42, "timestamp": "2024-01-01T00:00:00Z" },
			"operations": [[], [{
				"hash": "ooHash",
				"branch": "BLbranch",
				"contents": [{
					"kind": "transaction",
					"source": "tz1source",
					"destination": "KT1contract",
					"counter": "17",
					"amount": "0",
					"metadata": {
						"operation_result": { "status": "applied", "consumed_milligas": "1000" }
					}
				}]
			}]]
		}))
		.unwrap();

		assert_eq!(block.level(), 42);
		let entry = block.entries().next().unwrap();
		assert_eq!(entry.hash, "ooHash");
		assert_eq!(entry.counter(), Some(17));
		let result = entry.contents[0]
			.metadata
			.as_ref()
			.and_then(|m| m.operation_result.as_ref())
			.unwrap();
		assert!(result.is_applied());
	}

	#[test]
	fn test_pending_operations_accept_both_layouts() {
		let pending = PendingOperations::from_json(json!({
			"validated": [{ "hash": "ooValidated", "contents": [] }],
			"applied": [{ "hash": "ooApplied", "contents": [] }],
			"refused": [["ooRefused", {
				"contents": [{ "kind": "transaction", "counter": "3" }],
				"error": []
			}]],
			"branch_delayed": [],
			"unprocessed": []
		}))
		.unwrap();

		let hashes: Vec<_> = pending.applied.iter().map(|e| e.hash.as_str()).collect();
		assert_eq!(hashes, vec!["ooApplied", "ooValidated"]);
		assert_eq!(pending.refused[0].hash, "ooRefused");
		assert_eq!(pending.refused[0].counter(), Some(3));
		assert!(pending.branch_refused.is_empty());
	}
}
