//! Transaction-info provider backed by the EVM node.

use super::rpc::EvmRpc;
use super::{parse_hash, EvmParams, EvmTransactionInfo};
use crate::{DriverError, TransactionInfoProvider};
use async_trait::async_trait;
use ledger_types::{truncate_id, TransactionId, TransactionInfo, TransactionStatus};
use std::sync::Arc;

/// Looks transactions up with `eth_getTransactionByHash`.
///
/// Transactions in the mempool are reported pending, included ones confirmed.
pub struct EvmNodeInfoProvider {
	rpc: Arc<dyn EvmRpc>,
}

impl EvmNodeInfoProvider {
	pub fn new(rpc: Arc<dyn EvmRpc>) -> Self {
		Self { rpc }
	}
}

#[async_trait]
impl TransactionInfoProvider<EvmTransactionInfo, EvmParams> for EvmNodeInfoProvider {
	async fn get_transaction_info(
		&self,
		id: &TransactionId,
	) -> Result<Option<TransactionInfo<EvmTransactionInfo, EvmParams>>, DriverError> {
		let hash = parse_hash(id)?;
		let Some(tx) = self.rpc.transaction_by_hash(hash).await? else {
			tracing::trace!(tx_id = %truncate_id(id.as_str()), "External transaction not found");
			return Ok(None);
		};

		let status = match tx.block_number {
			Some(_) => TransactionStatus::Confirmed,
			None => TransactionStatus::Pending,
		};
		let mut info = TransactionInfo::external(id.clone(), Some(tx.nonce), status);
		info.block_number = tx.block_number;
		info.blockchain_specific_transaction_info = Some(EvmTransactionInfo {
			gas_price: tx.gas_price,
			gas_limit: Some(tx.gas_limit),
		});

		tracing::trace!(
			tx_id = %truncate_id(id.as_str()),
			status = %status,
			"External transaction found"
		);
		Ok(Some(info))
	}
}
