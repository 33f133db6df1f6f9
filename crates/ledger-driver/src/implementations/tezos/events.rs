//! Event extraction from Tezos blocks.
//!
//! Contract events are internal operation results of kind `event` carried by
//! the transactions that called the contract.

use super::micheline;
use super::rpc::{InternalOperationResult, OperationContent, TezosBlock, TezosRpc};
use crate::listener::BlockEventSource;
use crate::DriverError;
use async_trait::async_trait;
use ledger_types::{Event, PayloadMappers, TransactionId, ALL_EVENTS};
use std::sync::Arc;

/// Selects and decodes the events of interest.
#[derive(Debug, Clone)]
pub struct TezosEventFilter {
	pub contract: String,
	/// Event tag, or [`ALL_EVENTS`].
	pub event_name: String,
	pub mappers: PayloadMappers,
	/// Restricts extraction to one operation.
	pub operation_hash: Option<String>,
}

impl TezosEventFilter {
	fn accepts(&self, result: &InternalOperationResult) -> bool {
		result.kind == "event"
			&& result.source.as_deref() == Some(self.contract.as_str())
			&& (self.event_name == ALL_EVENTS
				|| result.tag.as_deref() == Some(self.event_name.as_str()))
	}

	fn targets_contract(&self, content: &OperationContent) -> bool {
		content.kind == "transaction"
			&& content.destination.as_deref() == Some(self.contract.as_str())
			&& content
				.metadata
				.as_ref()
				.is_some_and(|metadata| metadata.internal_operation_results.is_some())
	}
}

/// Extracts the events selected by `filter` from `block`, in block order.
pub fn extract_events(
	block: &TezosBlock,
	filter: &TezosEventFilter,
) -> Result<Vec<Event>, DriverError> {
	let candidates = block
		.entries()
		.filter(|entry| {
			filter
				.operation_hash
				.as_deref()
				.map_or(true, |hash| entry.hash == hash)
		})
		.flat_map(|entry| entry.contents.iter().map(move |content| (&entry.hash, content)))
		.filter(|(_, content)| filter.targets_contract(content))
		.flat_map(|(hash, content)| {
			content
				.metadata
				.iter()
				.flat_map(|metadata| metadata.internal_operation_results.iter().flatten())
				.map(move |result| (hash, result))
		})
		.filter(|(_, result)| filter.accepts(result));

	candidates
		.map(|(hash, result)| build_event(block, hash, result, filter))
		.collect()
}

fn build_event(
	block: &TezosBlock,
	operation_hash: &str,
	result: &InternalOperationResult,
	filter: &TezosEventFilter,
) -> Result<Event, DriverError> {
	let event_name = result.tag.clone().ok_or_else(|| {
		DriverError::Configuration(format!(
			"No event name found for event in operation {}",
			operation_hash
		))
	})?;

	let decoded = result
		.payload
		.as_ref()
		.map(micheline::decode)
		.unwrap_or_default();
	let arguments = serde_json::Value::Array(micheline::flatten_payload(decoded));
	let payload = filter.mappers.apply(&event_name, arguments)?;

	Ok(Event {
		event_name,
		smart_contract_address: filter.contract.clone(),
		block_number: block.level(),
		block_hash: block.hash.clone(),
		transaction_id: TransactionId::new(operation_hash),
		payload,
	})
}

/// Feeds a listener with the events of one contract, block by block.
pub(crate) struct TezosBlockSource {
	pub rpc: Arc<dyn TezosRpc>,
	pub filter: TezosEventFilter,
}

#[async_trait]
impl BlockEventSource for TezosBlockSource {
	async fn events_between(&self, from: u64, to: u64) -> Result<Vec<Event>, DriverError> {
		let mut events = Vec::new();
		for level in from..=to {
			let block = self.rpc.block(Some(level)).await?;
			events.extend(extract_events(&block, &self.filter)?);
		}
		Ok(events)
	}
}
