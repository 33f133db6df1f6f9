//! EVM ledger driver.
//!
//! Submits legacy transactions signed by the injected signer and tracks them
//! with a block poller that reads receipts once enough blocks were mined on
//! top of the inclusion block. Pending transactions can be boosted or
//! cancelled by resubmitting at the same nonce with a higher gas price.

pub mod abi;
pub mod alloy;
pub mod events;
pub mod provider;
pub mod rpc;
#[cfg(test)]
pub(crate) mod testing;

pub use self::alloy::{create_driver, AlloyEvmRpc, EvmDriverFactory, LocalEvmSigner, Registry};
pub use events::{extract_events, EventFilter};
pub use provider::EvmNodeInfoProvider;
pub use rpc::{EvmCallRequest, EvmLog, EvmLogFilter, EvmReceipt, EvmRpc, EvmTransaction};

use crate::lifecycle::{resolve_transaction_info, wait_for_confirmation};
use crate::listener::spawn_listener;
use crate::runtime::{run_poller, DriverRuntime};
use crate::{
	BlockchainDriver, DriverError, EventStream, RpcError, TransactionInfoProvider,
	TransactionTable,
};
use alloy_consensus::TxLegacy;
use alloy_json_abi::JsonAbi;
use alloy_primitives::{keccak256, Address, Bytes, TxKind, B256, U256};
use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use events::EvmLogSource;
use ledger_types::{
	ceil_scale, floor_scale, gwei_to_wei, truncate_id, without_0x_prefix, AbstractTransaction,
	BlockInfo, ConfigSchema, Field, FieldType, ListenParams, MappingError, PayloadMappers, Schema,
	Signer, TransactionId, TransactionInfo, TransactionReceipt, TransactionStatus,
	ValidationError, ALL_EVENTS,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::instrument;

/// Safety margin applied to gas estimates of contract calls.
const GAS_LIMIT_MARGIN: f64 = 1.3;

/// Node messages reporting a nonce conflict.
const NONCE_ERRORS: [&str; 4] = [
	"nonce too low",
	"nonce too high",
	"replacement transaction underpriced",
	"the tx doesn't have the correct nonce",
];

const CONNECTION_NOT_OPEN: &str = "connection not open on send()";

/// Configuration of the EVM driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvmConfig {
	/// Chain id used for signing; read from the node when absent.
	#[serde(default)]
	pub chain_id: Option<u64>,
	/// Blocks, including the inclusion block, before a transaction is final.
	#[serde(default = "default_confirmations")]
	pub confirmations: u64,
	/// Blocks to wait before delivering an event.
	#[serde(default = "default_event_delay_in_blocks")]
	pub event_delay_in_blocks: u64,
	/// Period of the block poller.
	#[serde(default = "default_polling_interval_ms")]
	pub polling_interval_ms: u64,
	/// Period used when waiting on transactions this driver did not send.
	#[serde(default = "default_confirmation_polling_interval_ms")]
	pub confirmation_polling_interval_ms: u64,
	#[serde(default = "default_min_gas_price_gwei")]
	pub min_gas_price_gwei: u64,
	#[serde(default = "default_max_gas_price_gwei")]
	pub max_gas_price_gwei: u64,
	/// Multiplier applied to the gas price suggested by the node.
	#[serde(default = "default_gas_price_factor")]
	pub gas_price_factor: f64,
	/// Multiplier applied to the gas price of a boosted transaction.
	#[serde(default = "default_transaction_boost_factor")]
	pub transaction_boost_factor: f64,
	/// Largest block range of a single log query.
	#[serde(default = "default_max_log_range")]
	pub max_log_range: u64,
	/// Terminal records older than this are evicted; kept forever when absent.
	#[serde(default)]
	pub transaction_retention_secs: Option<u64>,
}

fn default_confirmations() -> u64 {
	1
}

fn default_event_delay_in_blocks() -> u64 {
	5
}

fn default_polling_interval_ms() -> u64 {
	10_000
}

fn default_confirmation_polling_interval_ms() -> u64 {
	1000
}

fn default_min_gas_price_gwei() -> u64 {
	100
}

fn default_max_gas_price_gwei() -> u64 {
	350
}

fn default_gas_price_factor() -> f64 {
	1.2
}

fn default_transaction_boost_factor() -> f64 {
	1.2
}

fn default_max_log_range() -> u64 {
	1000
}

impl Default for EvmConfig {
	fn default() -> Self {
		Self {
			chain_id: None,
			confirmations: default_confirmations(),
			event_delay_in_blocks: default_event_delay_in_blocks(),
			polling_interval_ms: default_polling_interval_ms(),
			confirmation_polling_interval_ms: default_confirmation_polling_interval_ms(),
			min_gas_price_gwei: default_min_gas_price_gwei(),
			max_gas_price_gwei: default_max_gas_price_gwei(),
			gas_price_factor: default_gas_price_factor(),
			transaction_boost_factor: default_transaction_boost_factor(),
			max_log_range: default_max_log_range(),
			transaction_retention_secs: None,
		}
	}
}

impl EvmConfig {
	/// Checks the invariants deserialization cannot express.
	pub fn validate(&self) -> Result<(), DriverError> {
		if self.min_gas_price_gwei == 0 || self.max_gas_price_gwei == 0 {
			return Err(DriverError::Configuration(
				"Gas price bounds must be positive".to_string(),
			));
		}
		if self.min_gas_price_gwei > self.max_gas_price_gwei {
			return Err(DriverError::Configuration(format!(
				"min_gas_price_gwei {} is greater than max_gas_price_gwei {}",
				self.min_gas_price_gwei, self.max_gas_price_gwei
			)));
		}
		if self.gas_price_factor < 1.0 || self.transaction_boost_factor < 1.0 {
			return Err(DriverError::Configuration(
				"Gas price factors must be at least 1".to_string(),
			));
		}
		if self.polling_interval_ms == 0 || self.confirmation_polling_interval_ms == 0 {
			return Err(DriverError::Configuration(
				"Polling intervals must be positive".to_string(),
			));
		}
		if self.confirmations == 0 || self.max_log_range == 0 {
			return Err(DriverError::Configuration(
				"confirmations and max_log_range must be positive".to_string(),
			));
		}
		Ok(())
	}

	/// Applies the factor to a suggested price and clamps it to the bounds.
	pub fn gas_price_from_suggestion(&self, suggested: u128) -> u128 {
		floor_scale(suggested, self.gas_price_factor).clamp(
			gwei_to_wei(self.min_gas_price_gwei),
			gwei_to_wei(self.max_gas_price_gwei),
		)
	}
}

/// Configuration schema for the EVM driver section.
pub struct EvmConfigSchema;

impl EvmConfigSchema {
	/// Static validation method for use before instance creation
	pub fn validate_config(config: &toml::Value) -> Result<(), ValidationError> {
		Self.validate(config)
	}
}

impl ConfigSchema for EvmConfigSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		let at_least = |min: i64| FieldType::Integer {
			min: Some(min),
			max: None,
		};
		let schema = Schema::new(
			// Required fields
			vec![Field::new("node_url", FieldType::String).with_validator(|value| {
				match value.as_str() {
					Some(url) if url.starts_with("http://") || url.starts_with("https://") => Ok(()),
					_ => Err("node_url must start with http:// or https://".to_string()),
				}
			})],
			// Optional fields
			vec![
				Field::new("chain_id", at_least(1)),
				Field::new("confirmations", at_least(1)),
				Field::new("event_delay_in_blocks", at_least(0)),
				Field::new("polling_interval_ms", at_least(1)),
				Field::new(
					"confirmation_polling_interval_ms",
					at_least(1),
				),
				Field::new("min_gas_price_gwei", at_least(1)),
				Field::new("max_gas_price_gwei", at_least(1)),
				Field::new(
					"gas_price_factor",
					FieldType::Float {
						min: Some(1.0),
						max: None,
					},
				),
				Field::new(
					"transaction_boost_factor",
					FieldType::Float {
						min: Some(1.0),
						max: None,
					},
				),
				Field::new("max_log_range", at_least(1)),
				Field::new("transaction_retention_secs", at_least(1)),
			],
		);

		schema.validate(config)
	}
}

/// EVM-specific submission and listen parameters.
#[derive(Debug, Clone, Default)]
pub struct EvmParams {
	/// Contract ABI, required for contract calls and listening.
	pub abi: Option<Arc<JsonAbi>>,
	/// Gas price in wei; computed from the node suggestion when absent.
	pub gas_price: Option<u128>,
	/// Gas limit; estimated when absent.
	pub gas_limit: Option<u64>,
	/// Mappers applied to decoded event payloads.
	pub event_mappers: Option<PayloadMappers>,
}

impl EvmParams {
	pub fn with_abi(abi: JsonAbi) -> Self {
		Self {
			abi: Some(Arc::new(abi)),
			..Self::default()
		}
	}

	pub fn gas_price(mut self, gas_price: u128) -> Self {
		self.gas_price = Some(gas_price);
		self
	}

	pub fn gas_limit(mut self, gas_limit: u64) -> Self {
		self.gas_limit = Some(gas_limit);
		self
	}

	pub fn event_mappers(mut self, mappers: PayloadMappers) -> Self {
		self.event_mappers = Some(mappers);
		self
	}
}

/// Fee fields recorded for an EVM transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvmTransactionInfo {
	pub gas_price: Option<u128>,
	pub gas_limit: Option<u64>,
}

type Record = TransactionInfo<EvmTransactionInfo, EvmParams>;

/// Parses a transaction id into a transaction hash.
pub(crate) fn parse_hash(id: &TransactionId) -> Result<B256, DriverError> {
	id.as_str()
		.parse::<B256>()
		.map_err(|e| DriverError::Decode(format!("Invalid transaction hash {}: {}", id, e)))
}

fn parse_address(address: &str) -> Result<Address, DriverError> {
	address
		.parse::<Address>()
		.map_err(|e| DriverError::Configuration(format!("Invalid address {}: {}", address, e)))
}

/// Derives an address from an uncompressed secp256k1 public key.
///
/// Accepts the 65-byte SEC1 encoding or the 64 raw coordinate bytes.
pub fn address_from_public_key(public_key: &str) -> Result<Address, DriverError> {
	let bytes = hex::decode(without_0x_prefix(public_key))
		.map_err(|e| DriverError::Configuration(format!("Invalid public key: {}", e)))?;
	let coordinates = match bytes.len() {
		65 if bytes[0] == 0x04 => &bytes[1..],
		64 => &bytes[..],
		len => {
			return Err(DriverError::Configuration(format!(
				"Unsupported public key length {}",
				len
			)))
		},
	};
	Ok(Address::from_slice(&keccak256(coordinates)[12..]))
}

/// Wraps transient send failures in [`DriverError::Retriable`].
///
/// Nonce conflicts and connection faults are transient; anything else is
/// surfaced as is.
pub fn classify_send_error(error: RpcError) -> DriverError {
	let retriable = match &error {
		RpcError::Connection(_) => true,
		RpcError::Node { message, .. } => {
			let message = message.to_lowercase();
			NONCE_ERRORS.iter().any(|pattern| message.contains(pattern))
				|| message.contains(CONNECTION_NOT_OPEN)
		},
		RpcError::Http { .. } | RpcError::Decode(_) => false,
	};
	let error = DriverError::Rpc(error);
	if retriable {
		error.retriable()
	} else {
		error
	}
}

struct EvmSession {
	chain_id: u64,
	address: Address,
}

struct EvmInner {
	rpc: Arc<dyn EvmRpc>,
	signer: Arc<dyn Signer<TxLegacy>>,
	info_provider: Arc<dyn TransactionInfoProvider<EvmTransactionInfo, EvmParams>>,
	config: EvmConfig,
	table: TransactionTable<EvmTransactionInfo, EvmParams>,
	runtime: DriverRuntime,
	session: OnceCell<EvmSession>,
}

/// Driver for EVM ledgers.
pub struct EvmDriver {
	inner: Arc<EvmInner>,
}

impl EvmDriver {
	/// Creates a driver using the node itself as transaction-info provider.
	pub fn new(
		config: EvmConfig,
		rpc: Arc<dyn EvmRpc>,
		signer: Arc<dyn Signer<TxLegacy>>,
	) -> Result<Self, DriverError> {
		let provider = Arc::new(EvmNodeInfoProvider::new(rpc.clone()));
		Self::with_info_provider(config, rpc, signer, provider)
	}

	pub fn with_info_provider(
		config: EvmConfig,
		rpc: Arc<dyn EvmRpc>,
		signer: Arc<dyn Signer<TxLegacy>>,
		info_provider: Arc<dyn TransactionInfoProvider<EvmTransactionInfo, EvmParams>>,
	) -> Result<Self, DriverError> {
		config.validate()?;
		Ok(Self {
			inner: Arc::new(EvmInner {
				rpc,
				signer,
				info_provider,
				config,
				table: TransactionTable::new(),
				runtime: DriverRuntime::new(),
				session: OnceCell::new(),
			}),
		})
	}

	pub fn config(&self) -> &EvmConfig {
		&self.inner.config
	}
}

impl Drop for EvmDriver {
	fn drop(&mut self) {
		self.inner.close();
	}
}

impl EvmInner {
	async fn session(self: &Arc<Self>) -> Result<&EvmSession, DriverError> {
		self.runtime.ensure_open()?;
		self.session.get_or_try_init(|| self.start()).await
	}

	async fn start(self: &Arc<Self>) -> Result<EvmSession, DriverError> {
		let chain_id = match self.config.chain_id {
			Some(chain_id) => chain_id,
			None => self.rpc.chain_id().await?,
		};
		let address = self.signing_address().await?;
		self.runtime.publish_head(self.rpc.latest_block().await?);

		let inner = Arc::clone(self);
		let period = Duration::from_millis(self.config.polling_interval_ms);
		let shutdown = self.runtime.shutdown_signal();
		let task = tokio::spawn(async move {
			run_poller("evm", period, shutdown, || inner.poll_once()).await;
		});
		self.runtime.attach_poller(task);

		tracing::info!(chain_id, address = %address, "EVM driver initialized");
		Ok(EvmSession { chain_id, address })
	}

	async fn signing_address(&self) -> Result<Address, DriverError> {
		match self.signer.address().await? {
			Some(address) => parse_address(&address),
			None => address_from_public_key(&self.signer.public_key().await?),
		}
	}

	fn confirmation_poll_interval(&self) -> Duration {
		Duration::from_millis(self.config.confirmation_polling_interval_ms)
	}

	async fn transaction_info(&self, id: &TransactionId) -> Result<Record, DriverError> {
		resolve_transaction_info(&self.table, self.info_provider.as_ref(), id).await
	}

	async fn wait(&self, id: &TransactionId) -> Result<(), DriverError> {
		wait_for_confirmation(&self.table, id, self.confirmation_poll_interval(), || {
			self.transaction_info(id)
		})
		.await
	}

	async fn last_block(self: &Arc<Self>) -> Result<BlockInfo, DriverError> {
		self.session().await?;
		if let Some(head) = self.runtime.head() {
			return Ok(head);
		}
		let head = self.rpc.latest_block().await?;
		self.runtime.publish_head(head.clone());
		Ok(head)
	}

	async fn suggested_gas_price(&self) -> Result<u128, DriverError> {
		let suggested = self.rpc.gas_price().await.map_err(classify_send_error)?;
		Ok(self.config.gas_price_from_suggestion(suggested))
	}

	#[instrument(skip_all, fields(to = %truncate_id(&tx.to), method = ?tx.method_name))]
	async fn send_transaction(
		self: &Arc<Self>,
		tx: AbstractTransaction<EvmParams>,
	) -> Result<TransactionReceipt, DriverError> {
		let session = self.session().await?;

		for previous in &tx.previous_transactions {
			if let Err(e) = self.wait(previous).await {
				tracing::warn!(
					previous = %truncate_id(previous.as_str()),
					error = %e,
					"Previous transaction did not confirm, sending anyway"
				);
			}
		}

		let params = tx.blockchain_specific_params.clone().unwrap_or_default();
		let nonce = match tx.nonce {
			Some(nonce) => nonce,
			None => self
				.rpc
				.pending_nonce(session.address)
				.await
				.map_err(classify_send_error)?,
		};
		let gas_price = match params.gas_price {
			Some(gas_price) => gas_price,
			None => self.suggested_gas_price().await?,
		};

		let to = parse_address(&tx.to)?;
		let value = U256::from(tx.value.unwrap_or_default());
		let mut request = EvmCallRequest {
			from: Some(session.address),
			to,
			data: Bytes::new(),
			value,
			gas: None,
			gas_price: Some(gas_price),
		};

		let gas_limit = match &tx.method_name {
			Some(method) => {
				let abi = params.abi.as_deref().ok_or_else(|| {
					DriverError::Configuration(format!("ABI is required to call method {}", method))
				})?;
				let args = tx.method_parameters.as_deref().unwrap_or_default();
				let function = abi::find_function(abi, method, args.len())?;
				request.data = abi::encode_call(function, args)?;

				let gas_limit = match params.gas_limit {
					Some(gas_limit) => gas_limit,
					None => {
						let estimate =
							self.rpc.estimate_gas(&request).await.map_err(classify_send_error)?;
						ceil_scale(u128::from(estimate), GAS_LIMIT_MARGIN) as u64
					},
				};

				// Surfaces revert reasons before anything is signed.
				request.gas = Some(gas_limit);
				self.rpc.call(&request).await.map_err(classify_send_error)?;
				gas_limit
			},
			None => match params.gas_limit {
				Some(gas_limit) => gas_limit,
				None => self.rpc.estimate_gas(&request).await.map_err(classify_send_error)?,
			},
		};

		let unsigned = TxLegacy {
			chain_id: Some(session.chain_id),
			nonce,
			gas_price,
			gas_limit,
			to: TxKind::Call(to),
			value,
			input: request.data,
		};
		let raw = self.signer.sign(&unsigned).await?;
		let hash = self
			.rpc
			.send_raw_transaction(&raw)
			.await
			.map_err(classify_send_error)?;
		let id = TransactionId::new(format!("{:#x}", hash));

		let mut info = Record::pending(id.clone(), nonce);
		info.send_block_number = self.runtime.head().map(|head| head.block_number);
		info.blockchain_specific_transaction_info = Some(EvmTransactionInfo {
			gas_price: Some(gas_price),
			gas_limit: Some(gas_limit),
		});
		info.replaced_transaction_id = tx.replaced_transaction_id.clone();
		info.details = Some(tx);
		self.table.register(info);

		tracing::info!(
			tx_id = %truncate_id(id.as_str()),
			nonce,
			gas_price,
			gas_limit,
			"Submitted transaction"
		);
		Ok(TransactionReceipt::from(id))
	}

	/// Returns the pending record that a replacement would supersede.
	async fn replaceable(
		&self,
		id: &TransactionId,
		operation: &'static str,
	) -> Result<(Record, u64), DriverError> {
		let info = self.transaction_info(id).await?;
		if info.status != TransactionStatus::Pending {
			return Err(DriverError::InvalidState {
				id: id.clone(),
				status: info.status,
				operation,
			});
		}
		let nonce = info.nonce.ok_or_else(|| DriverError::MissingDetails {
			id: id.clone(),
			what: "nonce",
		})?;
		Ok((info, nonce))
	}

	#[instrument(skip_all, fields(tx_id = %truncate_id(id.as_str())))]
	async fn boost(
		self: &Arc<Self>,
		id: &TransactionId,
		overrides: Option<EvmParams>,
	) -> Result<TransactionReceipt, DriverError> {
		let (info, nonce) = self.replaceable(id, "boost").await?;
		let recorded = info.blockchain_specific_transaction_info.unwrap_or_default();
		let current_price = recorded.gas_price.ok_or_else(|| DriverError::MissingDetails {
			id: id.clone(),
			what: "gas price",
		})?;
		let details = info.details.ok_or_else(|| DriverError::MissingDetails {
			id: id.clone(),
			what: "transaction details",
		})?;

		let overrides = overrides.unwrap_or_default();
		let gas_price = overrides
			.gas_price
			.unwrap_or_else(|| ceil_scale(current_price, self.config.transaction_boost_factor));
		let mut params = details.blockchain_specific_params.clone().unwrap_or_default();
		params.gas_price = Some(gas_price);
		params.gas_limit = overrides.gas_limit.or(recorded.gas_limit).or(params.gas_limit);

		tracing::info!(current_price, gas_price, "Boosting transaction");
		let replacement = AbstractTransaction {
			nonce: Some(nonce),
			previous_transactions: Vec::new(),
			replaced_transaction_id: Some(id.clone()),
			blockchain_specific_params: Some(params),
			..details
		};
		self.replace(id, replacement).await
	}

	#[instrument(skip_all, fields(tx_id = %truncate_id(id.as_str())))]
	async fn cancel(
		self: &Arc<Self>,
		id: &TransactionId,
		overrides: Option<EvmParams>,
	) -> Result<TransactionReceipt, DriverError> {
		let session = self.session().await?;
		let (_, nonce) = self.replaceable(id, "cancel").await?;

		let overrides = overrides.unwrap_or_default();
		let params = EvmParams {
			gas_price: Some(
				overrides
					.gas_price
					.unwrap_or_else(|| gwei_to_wei(self.config.max_gas_price_gwei)),
			),
			gas_limit: overrides.gas_limit,
			..EvmParams::default()
		};

		tracing::info!("Cancelling transaction");
		let mut replacement = AbstractTransaction::new(session.address.to_checksum(None))
			.with_value(0)
			.with_nonce(nonce)
			.with_params(params);
		replacement.replaced_transaction_id = Some(id.clone());
		self.replace(id, replacement).await
	}

	/// Sends `replacement` and cancels `original` once it is final.
	async fn replace(
		self: &Arc<Self>,
		original: &TransactionId,
		replacement: AbstractTransaction<EvmParams>,
	) -> Result<TransactionReceipt, DriverError> {
		let receipt = self.send_transaction(replacement).await?;
		let replacement_id = receipt.transaction_id.clone();
		self.table.modify(original, |info| {
			info.replacement_transaction_id = Some(replacement_id.clone());
		});

		let inner = Arc::clone(self);
		let original = original.clone();
		tokio::spawn(async move {
			match inner.wait(&replacement_id).await {
				Ok(()) => {
					if inner
						.table
						.transition(&original, TransactionStatus::Cancelled, |_| {})
					{
						tracing::info!(
							tx_id = %truncate_id(original.as_str()),
							replacement = %truncate_id(replacement_id.as_str()),
							"Transaction replaced"
						);
					}
				},
				Err(e) => tracing::warn!(
					tx_id = %truncate_id(original.as_str()),
					replacement = %truncate_id(replacement_id.as_str()),
					error = %e,
					"Replacement transaction failed"
				),
			}
		});

		Ok(receipt)
	}

	async fn call(
		self: &Arc<Self>,
		tx: AbstractTransaction<EvmParams>,
	) -> Result<serde_json::Value, DriverError> {
		let session = self.session().await?;
		let method = tx.method_name.as_deref().ok_or_else(|| {
			DriverError::Configuration("Method name is required for a call".to_string())
		})?;
		let params = tx.blockchain_specific_params.as_ref();
		let abi = params.and_then(|p| p.abi.as_deref()).ok_or_else(|| {
			DriverError::Configuration(format!("ABI is required to call method {}", method))
		})?;
		let args = tx.method_parameters.as_deref().unwrap_or_default();
		let function = abi::find_function(abi, method, args.len())?;

		let request = EvmCallRequest {
			from: Some(session.address),
			to: parse_address(&tx.to)?,
			data: abi::encode_call(function, args)?,
			value: U256::from(tx.value.unwrap_or_default()),
			gas: params.and_then(|p| p.gas_limit),
			gas_price: None,
		};
		let output = self.rpc.call(&request).await?;
		abi::decode_output(function, &output)
	}

	#[instrument(skip_all, fields(contract = %truncate_id(&params.smart_contract_address), event = %params.event_name))]
	async fn listen(self: &Arc<Self>, params: ListenParams<EvmParams>) -> Result<EventStream, DriverError> {
		let specific = params.blockchain_specific_params.unwrap_or_default();
		let abi = specific.abi.ok_or_else(|| {
			DriverError::Configuration("ABI is required to listen to events".to_string())
		})?;
		if params.event_name != ALL_EVENTS {
			if abi.event(&params.event_name).is_none() {
				return Err(DriverError::Configuration(format!(
					"Event {} not found in ABI",
					params.event_name
				)));
			}
			if let Some(mappers) = &specific.event_mappers {
				if !mappers.contains(&params.event_name) {
					return Err(MappingError::Missing(params.event_name).into());
				}
			}
		}
		let address = parse_address(&params.smart_contract_address)?;

		let start = match params.from {
			Some(from) => from,
			None => self.last_block().await?.block_number + 1,
		};
		self.session().await?;

		let source = EvmLogSource {
			rpc: self.rpc.clone(),
			address,
			filter: EventFilter {
				address: Some(address),
				event_name: params.event_name,
				abi,
				mappers: specific.event_mappers,
			},
			max_log_range: self.config.max_log_range,
		};
		tracing::info!(from = start, "Listening to events");
		Ok(spawn_listener(
			source,
			self.runtime.heads(),
			self.runtime.shutdown_signal(),
			start,
			self.config.event_delay_in_blocks,
		))
	}

	/// One block poller iteration.
	async fn poll_once(&self) -> Result<(), DriverError> {
		let head = self.rpc.latest_block().await?;
		if self.runtime.publish_head(head.clone()) {
			tracing::debug!(block_number = head.block_number, "New block");
		}

		for info in self.table.pending() {
			if let Err(e) = self.track(&info, head.block_number).await {
				tracing::debug!(
					tx_id = %truncate_id(info.id.as_str()),
					error = %e,
					"Failed to check transaction"
				);
			}
		}

		let cutoff = self
			.config
			.transaction_retention_secs
			.and_then(|secs| TimeDelta::try_seconds(i64::try_from(secs).ok()?))
			.and_then(|window| Utc::now().checked_sub_signed(window));
		if let Some(cutoff) = cutoff {
			let evicted = self.table.evict_terminal_older_than(cutoff);
			if evicted > 0 {
				tracing::debug!(evicted, "Evicted terminal transactions");
			}
		}
		Ok(())
	}

	/// Moves a pending transaction to its terminal status once its receipt has
	/// enough confirmations.
	async fn track(&self, info: &Record, head: u64) -> Result<(), DriverError> {
		let hash = parse_hash(&info.id)?;
		let Some(receipt) = self.rpc.transaction_receipt(hash).await? else {
			return Ok(());
		};
		let Some(block_number) = receipt.block_number else {
			return Ok(());
		};
		if head.saturating_add(1) < block_number.saturating_add(self.config.confirmations) {
			return Ok(());
		}

		if receipt.status {
			let emitted = self.emitted_events(info, &receipt);
			if self.table.transition(&info.id, TransactionStatus::Confirmed, |record| {
				record.block_number = Some(block_number);
				record.emitted_events = Some(emitted);
			}) {
				tracing::info!(
					tx_id = %truncate_id(info.id.as_str()),
					block_number,
					"Transaction confirmed"
				);
			}
		} else if self.table.transition(&info.id, TransactionStatus::Rejected, |record| {
			record.block_number = Some(block_number);
			record.current_error = Some("Transaction reverted".to_string());
		}) {
			tracing::warn!(
				tx_id = %truncate_id(info.id.as_str()),
				block_number,
				"Transaction reverted"
			);
		}
		Ok(())
	}

	/// Decodes the receipt logs of the called contract with the ABI the
	/// transaction was sent with.
	///
	/// Events without a registered mapper keep their decoded payload.
	fn emitted_events(&self, info: &Record, receipt: &EvmReceipt) -> Vec<ledger_types::Event> {
		let Some(details) = info.details.as_ref() else {
			return Vec::new();
		};
		let Some(params) = details.blockchain_specific_params.as_ref() else {
			return Vec::new();
		};
		let Some(abi) = params.abi.clone() else {
			return Vec::new();
		};
		let Ok(contract) = parse_address(&details.to) else {
			return Vec::new();
		};

		let filter = EventFilter {
			address: Some(contract),
			event_name: ALL_EVENTS.to_string(),
			abi,
			mappers: None,
		};
		let events = match extract_events(&receipt.logs, &filter) {
			Ok(events) => events,
			Err(e) => {
				tracing::warn!(
					tx_id = %truncate_id(info.id.as_str()),
					error = %e,
					"Failed to decode emitted events"
				);
				return Vec::new();
			},
		};

		let Some(mappers) = params.event_mappers.as_ref() else {
			return events;
		};
		events
			.into_iter()
			.map(|mut event| {
				if mappers.contains(&event.event_name) {
					match mappers.apply(&event.event_name, event.payload.clone()) {
						Ok(payload) => event.payload = payload,
						Err(e) => tracing::warn!(
							tx_id = %truncate_id(info.id.as_str()),
							event = %event.event_name,
							error = %e,
							"Failed to map emitted event"
						),
					}
				}
				event
			})
			.collect()
	}

	fn close(&self) {
		if self.runtime.close() {
			self.table.close();
			tracing::info!("EVM driver closed");
		}
	}
}

#[async_trait]
impl BlockchainDriver for EvmDriver {
	type Params = EvmParams;
	type Info = EvmTransactionInfo;

	async fn initialize(&self) -> Result<(), DriverError> {
		self.inner.session().await.map(|_| ())
	}

	async fn send(
		&self,
		tx: AbstractTransaction<EvmParams>,
	) -> Result<TransactionReceipt, DriverError> {
		self.inner.send_transaction(tx).await
	}

	async fn call(
		&self,
		tx: AbstractTransaction<EvmParams>,
	) -> Result<serde_json::Value, DriverError> {
		self.inner.call(tx).await
	}

	async fn listen(&self, params: ListenParams<EvmParams>) -> Result<EventStream, DriverError> {
		self.inner.listen(params).await
	}

	async fn get_transaction_info(&self, id: &TransactionId) -> Result<Record, DriverError> {
		self.inner.session().await?;
		self.inner.transaction_info(id).await
	}

	async fn get_transactions_info(&self) -> Result<Vec<Record>, DriverError> {
		self.inner.session().await?;
		Ok(self.inner.table.all())
	}

	async fn wait_for_confirmation(&self, id: &TransactionId) -> Result<(), DriverError> {
		self.inner.session().await?;
		self.inner.wait(id).await
	}

	async fn boost_transaction(
		&self,
		id: &TransactionId,
		params: Option<EvmParams>,
	) -> Result<TransactionReceipt, DriverError> {
		self.inner.boost(id, params).await
	}

	async fn cancel_transaction(
		&self,
		id: &TransactionId,
		params: Option<EvmParams>,
	) -> Result<TransactionReceipt, DriverError> {
		self.inner.cancel(id, params).await
	}

	async fn get_last_block(&self) -> Result<BlockInfo, DriverError> {
		self.inner.last_block().await
	}

	async fn close(&self) -> Result<(), DriverError> {
		self.inner.close();
		Ok(())
	}
}
