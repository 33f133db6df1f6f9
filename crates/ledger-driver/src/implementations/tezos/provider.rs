//! Transaction-info provider backed by the Tezos node.

use super::rpc::{OperationEntry, TezosBlock, TezosRpc};
use super::{TezosParams, TezosTransactionInfo};
use crate::{DriverError, TransactionInfoProvider};
use async_trait::async_trait;
use ledger_types::{truncate_id, TransactionId, TransactionInfo, TransactionStatus};
use std::sync::Arc;

type Record = TransactionInfo<TezosTransactionInfo, TezosParams>;

/// Looks operations up in the mempool, then in recent blocks.
///
/// Blocks are scanned backwards from the head down to
/// `max(min_block, head - max_lookback)`.
pub struct TezosNodeInfoProvider {
	rpc: Arc<dyn TezosRpc>,
	min_block: u64,
	max_lookback: u64,
}

impl TezosNodeInfoProvider {
	pub fn new(rpc: Arc<dyn TezosRpc>, min_block: u64, max_lookback: u64) -> Self {
		Self {
			rpc,
			min_block,
			max_lookback,
		}
	}

	async fn from_mempool(&self, id: &TransactionId) -> Result<Option<Record>, DriverError> {
		let pending = self.rpc.pending_operations().await?;
		let classes = [
			(&pending.applied, TransactionStatus::Pending),
			(&pending.branch_delayed, TransactionStatus::Pending),
			(&pending.refused, TransactionStatus::Rejected),
			(&pending.branch_refused, TransactionStatus::Rejected),
		];

		for (entries, status) in classes {
			if let Some(entry) = find(entries.iter(), id) {
				let mut info = Record::external(id.clone(), entry.counter(), status);
				if status == TransactionStatus::Rejected {
					info.current_error = Some("Operation refused by the mempool".to_string());
				}
				return Ok(Some(info));
			}
		}
		Ok(None)
	}

	async fn from_blocks(&self, id: &TransactionId) -> Result<Option<Record>, DriverError> {
		let head = self.rpc.block(None).await?;
		let lowest = head
			.level()
			.saturating_sub(self.max_lookback)
			.max(self.min_block);

		if let Some(info) = included_in(&head, id) {
			return Ok(Some(info));
		}
		for level in (lowest..head.level()).rev() {
			let block = self.rpc.block(Some(level)).await?;
			if let Some(info) = included_in(&block, id) {
				return Ok(Some(info));
			}
		}
		Ok(None)
	}
}

fn find<'a>(
	mut entries: impl Iterator<Item = &'a OperationEntry>,
	id: &TransactionId,
) -> Option<&'a OperationEntry> {
	entries.find(|entry| entry.hash == id.as_str())
}

fn included_in(block: &TezosBlock, id: &TransactionId) -> Option<Record> {
	let entry = find(block.entries(), id)?;
	let mut info = Record::external(id.clone(), entry.counter(), TransactionStatus::Confirmed);
	info.block_number = Some(block.level());
	Some(info)
}

#[async_trait]
impl TransactionInfoProvider<TezosTransactionInfo, TezosParams> for TezosNodeInfoProvider {
	async fn get_transaction_info(&self, id: &TransactionId) -> Result<Option<Record>, DriverError> {
		let info = match self.from_mempool(id).await? {
			Some(info) => Some(info),
			None => self.from_blocks(id).await?,
		};

		match &info {
			Some(info) => tracing::trace!(
				tx_id = %truncate_id(id.as_str()),
				status = %info.status,
				"External operation found"
			),
			None => tracing::trace!(tx_id = %truncate_id(id.as_str()), "External operation not found"),
		}
		Ok(info)
	}
}
