//! Event extraction from EVM logs.
//!
//! Logs are kept when they come from the watched contract and their first
//! topic is the selector of a non-anonymous event of the ABI. Matching logs
//! are decoded, passed through the payload mapper when one is configured and
//! stamped with their origin.

use super::abi;
use super::rpc::{EvmLog, EvmLogFilter, EvmRpc};
use crate::listener::BlockEventSource;
use crate::DriverError;
use alloy_json_abi::{Event as AbiEvent, JsonAbi};
use alloy_primitives::{Address, B256};
use async_trait::async_trait;
use ledger_types::{Event, PayloadMappers, TransactionId, ALL_EVENTS};
use std::collections::HashMap;
use std::sync::Arc;

/// Selects and decodes the events of interest.
#[derive(Debug, Clone)]
pub struct EventFilter {
	/// Emitting contract; logs of any contract are considered when `None`.
	pub address: Option<Address>,
	/// Event name, or [`ALL_EVENTS`].
	pub event_name: String,
	pub abi: Arc<JsonAbi>,
	pub mappers: Option<PayloadMappers>,
}

impl EventFilter {
	fn matches_name(&self, name: &str) -> bool {
		self.event_name == ALL_EVENTS || self.event_name == name
	}
}

/// Extracts the events selected by `filter` from `logs`, preserving order.
pub fn extract_events(logs: &[EvmLog], filter: &EventFilter) -> Result<Vec<Event>, DriverError> {
	let by_selector: HashMap<B256, &AbiEvent> = filter
		.abi
		.events()
		.filter(|event| !event.anonymous)
		.map(|event| (event.selector(), event))
		.collect();

	logs.iter()
		.filter(|log| filter.address.map_or(true, |address| log.address == address))
		.filter_map(|log| {
			let selector = log.topics.first()?;
			by_selector.get(selector).map(|event| (log, *event))
		})
		.filter(|(_, event)| filter.matches_name(&event.name))
		.map(|(log, event)| build_event(log, event, filter.mappers.as_ref()))
		.collect()
}

fn build_event(
	log: &EvmLog,
	event: &AbiEvent,
	mappers: Option<&PayloadMappers>,
) -> Result<Event, DriverError> {
	let decoded = abi::decode_event(event, &log.topics, &log.data)?;
	let payload = match mappers {
		Some(mappers) => mappers.apply(&event.name, decoded)?,
		None => decoded,
	};

	let block_number = log
		.block_number
		.ok_or_else(|| DriverError::Decode("Log without block number".to_string()))?;
	let block_hash = log
		.block_hash
		.ok_or_else(|| DriverError::Decode("Log without block hash".to_string()))?;
	let transaction_hash = log
		.transaction_hash
		.ok_or_else(|| DriverError::Decode("Log without transaction hash".to_string()))?;

	Ok(Event {
		event_name: event.name.clone(),
		smart_contract_address: log.address.to_checksum(None),
		block_number,
		block_hash: format!("{:#x}", block_hash),
		transaction_id: TransactionId::new(format!("{:#x}", transaction_hash)),
		payload,
	})
}

/// Feeds a listener with the logs of one contract.
pub(crate) struct EvmLogSource {
	pub rpc: Arc<dyn EvmRpc>,
	pub address: Address,
	pub filter: EventFilter,
	/// Largest block range requested in a single `eth_getLogs` call.
	pub max_log_range: u64,
}

#[async_trait]
impl BlockEventSource for EvmLogSource {
	async fn events_between(&self, from: u64, to: u64) -> Result<Vec<Event>, DriverError> {
		let step = self.max_log_range.max(1);
		let mut events = Vec::new();
		let mut start = from;

		while start <= to {
			let end = to.min(start.saturating_add(step - 1));
			let logs = self
				.rpc
				.logs(&EvmLogFilter {
					address: self.address,
					from_block: start,
					to_block: end,
				})
				.await?;
			events.extend(extract_events(&logs, &self.filter)?);
			if end == u64::MAX {
				break;
			}
			start = end + 1;
		}

		Ok(events)
	}
}
