//! Tezos ledger driver.
//!
//! Operations are simulated, forged by the node, signed by the injected
//! signer and injected. A block poller scans every new block for the pending
//! operation hashes and settles each operation once enough blocks were baked
//! on top of its inclusion block. Tezos has no fee market replacement, so
//! boosting and cancelling are not supported.

pub mod events;
pub mod http;
pub mod micheline;
pub mod provider;
pub mod rpc;
#[cfg(test)]
pub(crate) mod testing;
pub mod views;

pub use events::{extract_events, TezosEventFilter};
pub use http::{create_driver, HttpTezosRpc, Registry, TezosDriverFactory};
pub use provider::TezosNodeInfoProvider;
pub use rpc::{
	OperationContent, OperationEntry, OperationResult, PendingOperations, TezosBlock, TezosRpc,
	TezosUnsignedOperation, TransactionContent, TransactionParameters,
};
pub use views::{ViewMapper, ViewMappers};

use crate::lifecycle::{resolve_transaction_info, wait_for_confirmation};
use crate::listener::spawn_listener;
use crate::runtime::{run_poller, DriverRuntime};
use crate::{
	BlockchainDriver, DriverError, EventStream, RpcError, TransactionInfoProvider,
	TransactionTable,
};
use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use dashmap::DashMap;
use events::TezosBlockSource;
use ledger_types::{
	ceil_scale, truncate_id, AbstractTransaction, BlockInfo, ConfigSchema, Event, Field, FieldType,
	ListenParams, MappingError, PayloadMappers, Schema, Signer, SignerError, TransactionId,
	TransactionInfo, TransactionReceipt, TransactionStatus, ValidationError, ALL_EVENTS,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell};
use tracing::instrument;

/// Safety margin applied to simulated gas and storage.
const LIMIT_MARGIN: f64 = 1.3;

const HARD_GAS_LIMIT_PER_OPERATION: u64 = 1_040_000;
const HARD_STORAGE_LIMIT_PER_OPERATION: u64 = 60_000;

/// Storage burnt when an operation allocates a new account.
const ORIGINATION_SIZE: u64 = 257;

const MINIMAL_FEE_MUTEZ: u64 = 100;
const FEE_BUFFER_MUTEZ: u64 = 10;

const SIGNATURE_LENGTH: usize = 64;

/// Placeholder signature accepted by `run_operation`.
const SIMULATION_SIGNATURE: &str =
	"edsigtXomBKi5CTRf5cjATJWSyaRvhfYNHqSUGrn4SdbYRcGwQrUGjzEfQDTuqHhuA8b2d8NarZjz8TRf65WkpQmo423BtomS8Q";

/// Node error ids reporting a counter conflict.
const COUNTER_ERRORS: [&str; 5] = [
	".counter_in_the_future",
	".counter_in_the_past",
	".tx_rollup_counter_overflow",
	".tx_rollup_operation_counter_mismatch",
	".tx_rollup_unknown_address_index",
];

const COUNTER_ALREADY_USED: &str = "already used for contract";

/// HTTP statuses worth retrying.
const RETRIABLE_HTTP_STATUSES: [u16; 7] = [408, 429, 500, 503, 504, 507, 508];

/// Configuration of the Tezos driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TezosConfig {
	/// Period of the block poller.
	pub polling_interval_ms: u64,
	/// Blocks, including the inclusion block, before an operation is final.
	#[serde(default = "default_confirmations")]
	pub confirmations: u64,
	/// Pending operations not included within this delay are rejected.
	#[serde(default = "default_confirmation_timeout_secs")]
	pub confirmation_timeout_secs: u64,
	#[serde(default = "default_confirmation_polling_interval_ms")]
	pub confirmation_polling_interval_ms: u64,
	#[serde(default)]
	pub event_delay_in_blocks: u64,
	/// Lowest level scanned when looking up external operations.
	#[serde(default)]
	pub info_provider_min_block: u64,
	#[serde(default = "default_info_provider_max_lookback")]
	pub info_provider_max_lookback: u64,
	#[serde(default)]
	pub transaction_retention_secs: Option<u64>,
}

fn default_confirmations() -> u64 {
	5
}

fn default_confirmation_timeout_secs() -> u64 {
	180
}

fn default_confirmation_polling_interval_ms() -> u64 {
	1000
}

fn default_info_provider_max_lookback() -> u64 {
	1000
}

impl TezosConfig {
	pub fn new(polling_interval_ms: u64) -> Self {
		Self {
			polling_interval_ms,
			confirmations: default_confirmations(),
			confirmation_timeout_secs: default_confirmation_timeout_secs(),
			confirmation_polling_interval_ms: default_confirmation_polling_interval_ms(),
			event_delay_in_blocks: 0,
			info_provider_min_block: 0,
			info_provider_max_lookback: default_info_provider_max_lookback(),
			transaction_retention_secs: None,
		}
	}

	pub fn validate(&self) -> Result<(), DriverError> {
		if self.polling_interval_ms == 0 {
			return Err(DriverError::Configuration(
				"Polling interval should not be 0".to_string(),
			));
		}
		if self.confirmation_polling_interval_ms == 0 {
			return Err(DriverError::Configuration(
				"Confirmation polling interval should not be 0".to_string(),
			));
		}
		if self.confirmations == 0 {
			return Err(DriverError::Configuration(
				"confirmations must be positive".to_string(),
			));
		}
		Ok(())
	}
}

/// Configuration schema for the Tezos driver section.
pub struct TezosConfigSchema;

impl TezosConfigSchema {
	/// Static validation method for use before instance creation
	pub fn validate_config(config: &toml::Value) -> Result<(), ValidationError> {
		Self.validate(config)
	}
}

impl ConfigSchema for TezosConfigSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		let at_least = |min: i64| FieldType::Integer {
			min: Some(min),
			max: None,
		};
		let schema = Schema::new(
			// Required fields
			vec![
				Field::new("node_url", FieldType::String).with_validator(|value| {
					match value.as_str() {
						Some(url) if url.starts_with("http://") || url.starts_with("https://") => Ok(()),
						_ => Err("node_url must start with http:// or https://".to_string()),
					}
				}),
				Field::new("polling_interval_ms", at_least(1)),
			],
			// Optional fields
			vec![
				Field::new("confirmations", at_least(1)),
				Field::new("confirmation_timeout_secs", at_least(0)),
				Field::new("confirmation_polling_interval_ms", at_least(1)),
				Field::new("event_delay_in_blocks", at_least(0)),
				Field::new("info_provider_min_block", at_least(0)),
				Field::new("info_provider_max_lookback", at_least(0)),
				Field::new("transaction_retention_secs", at_least(1)),
			],
		);

		schema.validate(config)
	}
}

/// Tezos-specific submission, call and listen parameters.
#[derive(Debug, Clone, Default)]
pub struct TezosParams {
	/// Fee in mutez; computed from the limits and the operation size when absent.
	pub fee: Option<u64>,
	/// Gas limit; simulated when absent.
	pub gas_limit: Option<u64>,
	/// Storage limit in bytes; simulated when absent.
	pub storage_limit: Option<u64>,
	/// Mappers applied to event payloads; required to listen.
	pub event_mappers: Option<PayloadMappers>,
	/// Mappers computing `call` results from the contract storage.
	pub view_mappers: Option<ViewMappers>,
}

impl TezosParams {
	pub fn fee(mut self, fee: u64) -> Self {
		self.fee = Some(fee);
		self
	}

	pub fn gas_limit(mut self, gas_limit: u64) -> Self {
		self.gas_limit = Some(gas_limit);
		self
	}

	pub fn storage_limit(mut self, storage_limit: u64) -> Self {
		self.storage_limit = Some(storage_limit);
		self
	}

	pub fn event_mappers(mut self, mappers: PayloadMappers) -> Self {
		self.event_mappers = Some(mappers);
		self
	}

	pub fn view_mappers(mut self, mappers: ViewMappers) -> Self {
		self.view_mappers = Some(mappers);
		self
	}
}

/// Fee fields recorded for a Tezos operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TezosTransactionInfo {
	pub fee: Option<u64>,
	pub gas_limit: Option<u64>,
	pub storage_limit: Option<u64>,
}

type Record = TransactionInfo<TezosTransactionInfo, TezosParams>;

fn is_counter_error(text: &str) -> bool {
	COUNTER_ERRORS.iter().any(|id| text.contains(id))
}

/// Wraps transient send failures in [`DriverError::Retriable`].
///
/// Counter conflicts, connection faults and overloaded nodes are transient.
pub fn classify_send_error(error: RpcError) -> DriverError {
	let retriable = match &error {
		RpcError::Connection(_) => true,
		RpcError::Http { status, body } => {
			RETRIABLE_HTTP_STATUSES.contains(status)
				|| is_counter_error(body)
				|| body.contains(COUNTER_ALREADY_USED)
		},
		RpcError::Node { id, message } => {
			id.as_deref().is_some_and(is_counter_error) || message.contains(COUNTER_ALREADY_USED)
		},
		RpcError::Decode(_) => false,
	};
	let error = DriverError::Rpc(error);
	if retriable {
		error.retriable()
	} else {
		error
	}
}

/// Minimal fee accepted by bakers, with a small buffer.
pub fn minimal_fee(gas_limit: u64, forged_size: usize) -> u64 {
	MINIMAL_FEE_MUTEZ + gas_limit.div_ceil(10) + forged_size as u64 + FEE_BUFFER_MUTEZ
}

fn parse_amount(amount: Option<&str>) -> u64 {
	amount.and_then(|a| a.parse().ok()).unwrap_or_default()
}

/// Gas and storage consumed by a simulated operation.
fn simulated_usage(contents: &[OperationContent]) -> Result<(u64, u64), RpcError> {
	let mut milligas = 0u64;
	let mut storage = 0u64;
	let mut failure = None;
	let mut error_ids = Vec::new();

	for content in contents {
		let Some(metadata) = &content.metadata else {
			continue;
		};
		let internal = metadata
			.internal_operation_results
			.iter()
			.flatten()
			.filter_map(|internal| internal.result.as_ref());
		for result in metadata.operation_result.iter().chain(internal) {
			if !result.is_applied() {
				failure.get_or_insert_with(|| result.status.clone());
			}
			error_ids.extend(result.error_ids());
			milligas += parse_amount(result.consumed_milligas.as_deref());
			storage += parse_amount(result.paid_storage_size_diff.as_deref());
			if result.allocated_destination_contract == Some(true) {
				storage += ORIGINATION_SIZE;
			}
		}
	}

	if let Some(status) = failure {
		return Err(RpcError::Node {
			id: error_ids.first().cloned(),
			message: format!("Simulation {}: {}", status, error_ids.join(", ")),
		});
	}
	Ok((milligas.div_ceil(1000), storage))
}

fn with_margin(value: u64) -> u64 {
	ceil_scale(u128::from(value), LIMIT_MARGIN) as u64
}

fn block_info(block: &TezosBlock) -> BlockInfo {
	BlockInfo {
		block_number: block.level(),
		block_hash: block.hash.clone(),
	}
}

/// Where and how a pending operation was included.
struct Inclusion {
	level: u64,
	applied: bool,
	error_ids: Vec<String>,
	events: Vec<Event>,
}

struct TezosSession {
	chain_id: String,
	address: String,
}

struct TezosInner {
	rpc: Arc<dyn TezosRpc>,
	signer: Arc<dyn Signer<TezosUnsignedOperation>>,
	info_provider: Arc<dyn TransactionInfoProvider<TezosTransactionInfo, TezosParams>>,
	config: TezosConfig,
	table: TransactionTable<TezosTransactionInfo, TezosParams>,
	runtime: DriverRuntime,
	session: OnceCell<TezosSession>,
	inclusions: DashMap<TransactionId, Inclusion>,
	/// Last level scanned for pending operations.
	scanned_level: Mutex<Option<u64>>,
}

/// Driver for Tezos ledgers.
pub struct TezosDriver {
	inner: Arc<TezosInner>,
}

impl TezosDriver {
	/// Creates a driver using the node itself as transaction-info provider.
	pub fn new(
		config: TezosConfig,
		rpc: Arc<dyn TezosRpc>,
		signer: Arc<dyn Signer<TezosUnsignedOperation>>,
	) -> Result<Self, DriverError> {
		let provider = Arc::new(TezosNodeInfoProvider::new(
			rpc.clone(),
			config.info_provider_min_block,
			config.info_provider_max_lookback,
		));
		Self::with_info_provider(config, rpc, signer, provider)
	}

	pub fn with_info_provider(
		config: TezosConfig,
		rpc: Arc<dyn TezosRpc>,
		signer: Arc<dyn Signer<TezosUnsignedOperation>>,
		info_provider: Arc<dyn TransactionInfoProvider<TezosTransactionInfo, TezosParams>>,
	) -> Result<Self, DriverError> {
		config.validate()?;
		Ok(Self {
			inner: Arc::new(TezosInner {
				rpc,
				signer,
				info_provider,
				config,
				table: TransactionTable::new(),
				runtime: DriverRuntime::new(),
				session: OnceCell::new(),
				inclusions: DashMap::new(),
				scanned_level: Mutex::new(None),
			}),
		})
	}

	pub fn config(&self) -> &TezosConfig {
		&self.inner.config
	}
}

impl Drop for TezosDriver {
	fn drop(&mut self) {
		self.inner.close();
	}
}

impl TezosInner {
	async fn session(self: &Arc<Self>) -> Result<&TezosSession, DriverError> {
		self.runtime.ensure_open()?;
		self.session.get_or_try_init(|| self.start()).await
	}

	async fn start(self: &Arc<Self>) -> Result<TezosSession, DriverError> {
		let address = self.signer.address().await?.ok_or_else(|| {
			DriverError::Configuration("The Tezos signer must provide its address".to_string())
		})?;
		let chain_id = self.rpc.chain_id().await?;
		let head = self.rpc.block(None).await?;
		*self.scanned_level.lock().await = Some(head.level());
		self.runtime.publish_head(block_info(&head));

		let inner = Arc::clone(self);
		let period = Duration::from_millis(self.config.polling_interval_ms);
		let shutdown = self.runtime.shutdown_signal();
		let task = tokio::spawn(async move {
			run_poller("tezos", period, shutdown, || inner.poll_once()).await;
		});
		self.runtime.attach_poller(task);

		tracing::info!(chain_id = %chain_id, address = %address, "Tezos driver initialized");
		Ok(TezosSession { chain_id, address })
	}

	async fn transaction_info(&self, id: &TransactionId) -> Result<Record, DriverError> {
		resolve_transaction_info(&self.table, self.info_provider.as_ref(), id).await
	}

	async fn wait(&self, id: &TransactionId) -> Result<(), DriverError> {
		let poll_interval = Duration::from_millis(self.config.confirmation_polling_interval_ms);
		wait_for_confirmation(&self.table, id, poll_interval, || self.transaction_info(id)).await
	}

	async fn last_block(self: &Arc<Self>) -> Result<BlockInfo, DriverError> {
		self.session().await?;
		if let Some(head) = self.runtime.head() {
			return Ok(head);
		}
		let head = block_info(&self.rpc.block(None).await?);
		self.runtime.publish_head(head.clone());
		Ok(head)
	}

	/// Micheline parameters of a call to `method` on `contract`.
	async fn entrypoint_parameters(
		&self,
		contract: &str,
		method: &str,
		args: &[Value],
	) -> Result<TransactionParameters, DriverError> {
		let entrypoints = self
			.rpc
			.entrypoints(contract)
			.await
			.map_err(classify_send_error)?
			.ok_or_else(|| {
				DriverError::Configuration(format!("No contract at address {}", contract))
			})?;
		let ty = entrypoints.get(method).ok_or_else(|| {
			DriverError::Configuration(format!(
				"Contract at address {} does not have a method named {}",
				contract, method
			))
		})?;

		let value = match args {
			[single] => single.clone(),
			many => Value::Array(many.to_vec()),
		};
		let value = micheline::encode(ty, &value).map_err(|e| {
			DriverError::Configuration(format!("Invalid parameters for method {}: {}", method, e))
		})?;
		Ok(TransactionParameters {
			entrypoint: method.to_string(),
			value,
		})
	}

	/// Fills the missing limits from a simulation of `content`.
	async fn estimate_limits(
		&self,
		session: &TezosSession,
		branch: &str,
		content: &TransactionContent,
		params: &TezosParams,
	) -> Result<(u64, u64), DriverError> {
		if let (Some(gas_limit), Some(storage_limit)) = (params.gas_limit, params.storage_limit) {
			return Ok((gas_limit, storage_limit));
		}

		let mut dry_run = content.clone();
		dry_run.fee = "0".to_string();
		dry_run.gas_limit = HARD_GAS_LIMIT_PER_OPERATION.to_string();
		dry_run.storage_limit = HARD_STORAGE_LIMIT_PER_OPERATION.to_string();
		let simulated = self
			.rpc
			.run_operation(branch, &[dry_run], SIMULATION_SIGNATURE, &session.chain_id)
			.await
			.and_then(|contents| simulated_usage(&contents))
			.map_err(classify_send_error)?;

		let gas_limit = params.gas_limit.unwrap_or_else(|| with_margin(simulated.0));
		let storage_limit = params.storage_limit.unwrap_or_else(|| with_margin(simulated.1));
		tracing::debug!(
			consumed_gas = simulated.0,
			paid_storage = simulated.1,
			gas_limit,
			storage_limit,
			"Simulated operation"
		);
		Ok((gas_limit, storage_limit))
	}

	async fn forge(&self, branch: &str, content: &TransactionContent) -> Result<Vec<u8>, DriverError> {
		self.rpc
			.forge(branch, std::slice::from_ref(content))
			.await
			.map_err(classify_send_error)
	}

	/// Sets the fee of `content` and returns its forged bytes.
	///
	/// The fee depends on the encoded size, which depends on the fee; a second
	/// forge settles it.
	async fn forge_with_fee(
		&self,
		branch: &str,
		content: &mut TransactionContent,
		explicit_fee: Option<u64>,
		gas_limit: u64,
	) -> Result<(Vec<u8>, u64), DriverError> {
		if let Some(fee) = explicit_fee {
			content.fee = fee.to_string();
			return Ok((self.forge(branch, content).await?, fee));
		}

		content.fee = "0".to_string();
		let mut fee = minimal_fee(gas_limit, self.forge(branch, content).await?.len());
		content.fee = fee.to_string();
		let mut forged = self.forge(branch, content).await?;
		let required = minimal_fee(gas_limit, forged.len());
		if required > fee {
			fee = required;
			content.fee = fee.to_string();
			forged = self.forge(branch, content).await?;
		}
		Ok((forged, fee))
	}

	#[instrument(skip_all, fields(to = %truncate_id(&tx.to), method = ?tx.method_name))]
	async fn send_transaction(
		self: &Arc<Self>,
		tx: AbstractTransaction<TezosParams>,
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
		let counter = match tx.nonce {
			Some(counter) => counter,
			None => {
				self.rpc
					.counter(&session.address)
					.await
					.map_err(classify_send_error)?
					+ 1
			},
		};
		let parameters = match &tx.method_name {
			Some(method) => {
				let args = tx.method_parameters.as_deref().unwrap_or_default();
				Some(self.entrypoint_parameters(&tx.to, method, args).await?)
			},
			None => None,
		};
		let branch = self.last_block().await?.block_hash;

		let mut content = TransactionContent {
			kind: "transaction".to_string(),
			source: session.address.clone(),
			fee: "0".to_string(),
			counter: counter.to_string(),
			gas_limit: String::new(),
			storage_limit: String::new(),
			amount: tx.value.unwrap_or_default().to_string(),
			destination: tx.to.clone(),
			parameters,
		};
		let (gas_limit, storage_limit) = self
			.estimate_limits(session, &branch, &content, &params)
			.await?;
		content.gas_limit = gas_limit.to_string();
		content.storage_limit = storage_limit.to_string();
		let (forged, fee) = self
			.forge_with_fee(&branch, &mut content, params.fee, gas_limit)
			.await?;

		let unsigned = TezosUnsignedOperation {
			branch,
			contents: vec![content],
			forged_bytes: forged,
		};
		let signature = self.signer.sign(&unsigned).await?;
		if signature.len() != SIGNATURE_LENGTH {
			return Err(SignerError::Signing(format!(
				"Expected a {}-byte signature, got {} bytes",
				SIGNATURE_LENGTH,
				signature.len()
			))
			.into());
		}
		let mut signed = unsigned.forged_bytes;
		signed.extend_from_slice(&signature);
		let hash = self.rpc.inject(&signed).await.map_err(classify_send_error)?;
		let id = TransactionId::new(hash);

		let mut info = Record::pending(id.clone(), counter);
		info.send_block_number = self.runtime.head().map(|head| head.block_number);
		info.blockchain_specific_transaction_info = Some(TezosTransactionInfo {
			fee: Some(fee),
			gas_limit: Some(gas_limit),
			storage_limit: Some(storage_limit),
		});
		info.replaced_transaction_id = tx.replaced_transaction_id.clone();
		info.details = Some(tx);
		self.table.register(info);

		tracing::info!(
			tx_id = %truncate_id(id.as_str()),
			counter,
			fee,
			gas_limit,
			storage_limit,
			"Injected operation"
		);
		Ok(TransactionReceipt::from(id))
	}

	async fn call(
		self: &Arc<Self>,
		tx: AbstractTransaction<TezosParams>,
	) -> Result<Value, DriverError> {
		self.session().await?;
		let method = tx.method_name.as_deref().ok_or_else(|| {
			DriverError::Configuration("Method name is required for a call".to_string())
		})?;
		let no_view =
			|| DriverError::Configuration(format!("No view mapper for method {}", method));
		let views = tx
			.blockchain_specific_params
			.as_ref()
			.and_then(|params| params.view_mappers.as_ref())
			.filter(|views| views.contains(method))
			.ok_or_else(no_view)?;

		let storage = micheline::decode(&self.rpc.storage(&tx.to).await?);
		let args = tx.method_parameters.as_deref().unwrap_or_default();
		let result = views.apply(method, &storage, args).ok_or_else(no_view)?;
		Ok(result?)
	}

	#[instrument(skip_all, fields(contract = %truncate_id(&params.smart_contract_address), event = %params.event_name))]
	async fn listen(
		self: &Arc<Self>,
		params: ListenParams<TezosParams>,
	) -> Result<EventStream, DriverError> {
		let mappers = params
			.blockchain_specific_params
			.and_then(|specific| specific.event_mappers)
			.ok_or_else(|| {
				DriverError::Configuration(
					"Event mappers are required to listen to Tezos events".to_string(),
				)
			})?;
		if params.event_name != ALL_EVENTS && !mappers.contains(&params.event_name) {
			return Err(MappingError::Missing(params.event_name).into());
		}

		let start = match params.from {
			Some(from) => from,
			None => self.last_block().await?.block_number + 1,
		};
		self.session().await?;

		let source = TezosBlockSource {
			rpc: self.rpc.clone(),
			filter: TezosEventFilter {
				contract: params.smart_contract_address,
				event_name: params.event_name,
				mappers,
				operation_hash: None,
			},
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
		let head = self.rpc.block(None).await?;
		let head_level = head.level();
		if self.runtime.publish_head(block_info(&head)) {
			tracing::debug!(level = head_level, "New block");
		}

		let pending = self.table.pending();
		{
			let mut scanned = self.scanned_level.lock().await;
			let from = scanned.map_or(head_level, |level| level + 1);
			for level in from..=head_level {
				if level == head_level {
					self.record_inclusions(&head, &pending);
				} else {
					let block = self.rpc.block(Some(level)).await?;
					self.record_inclusions(&block, &pending);
				}
				*scanned = Some(level);
			}
		}

		for info in &pending {
			self.track(info, head_level);
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

	/// Remembers the pending operations included in `block`.
	fn record_inclusions(&self, block: &TezosBlock, pending: &[Record]) {
		for info in pending {
			if self.inclusions.contains_key(&info.id) {
				continue;
			}
			let Some(entry) = block.entries().find(|entry| entry.hash == info.id.as_str()) else {
				continue;
			};

			let mut applied = !entry.contents.is_empty();
			let mut error_ids = Vec::new();
			for content in &entry.contents {
				let metadata = content.metadata.as_ref();
				match metadata.and_then(|m| m.operation_result.as_ref()) {
					Some(result) => {
						applied &= result.is_applied();
						error_ids.extend(result.error_ids());
					},
					None => applied = false,
				}
				let internal = metadata
					.and_then(|m| m.internal_operation_results.as_ref())
					.into_iter()
					.flatten()
					.filter_map(|internal| internal.result.as_ref());
				for result in internal {
					error_ids.extend(result.error_ids());
				}
			}
			let events = if applied {
				self.emitted_events(block, info)
			} else {
				Vec::new()
			};

			tracing::debug!(
				tx_id = %truncate_id(info.id.as_str()),
				level = block.level(),
				applied,
				"Operation included"
			);
			self.inclusions.insert(
				info.id.clone(),
				Inclusion {
					level: block.level(),
					applied,
					error_ids,
					events,
				},
			);
		}
	}

	/// Events the operation emitted, when it was sent with event mappers.
	fn emitted_events(&self, block: &TezosBlock, info: &Record) -> Vec<Event> {
		let Some(details) = info.details.as_ref() else {
			return Vec::new();
		};
		let Some(mappers) = details
			.blockchain_specific_params
			.as_ref()
			.and_then(|params| params.event_mappers.clone())
		else {
			return Vec::new();
		};

		let filter = TezosEventFilter {
			contract: details.to.clone(),
			event_name: ALL_EVENTS.to_string(),
			mappers,
			operation_hash: Some(info.id.as_str().to_string()),
		};
		extract_events(block, &filter).unwrap_or_else(|e| {
			tracing::warn!(
				tx_id = %truncate_id(info.id.as_str()),
				error = %e,
				"Failed to decode emitted events"
			);
			Vec::new()
		})
	}

	/// Settles a pending operation once its inclusion has enough
	/// confirmations, or rejects it when it was never included in time.
	fn track(&self, info: &Record, head: u64) {
		let ready = self.inclusions.get(&info.id).map(|inclusion| {
			head.saturating_add(1) >= inclusion.level.saturating_add(self.config.confirmations)
		});

		match ready {
			Some(true) => {
				if let Some((_, inclusion)) = self.inclusions.remove(&info.id) {
					self.settle(info, inclusion);
				}
			},
			Some(false) => {},
			None => {
				let timed_out = info.send_timestamp.is_some_and(|sent| {
					u64::try_from(Utc::now().signed_duration_since(sent).num_seconds())
						.is_ok_and(|elapsed| elapsed >= self.config.confirmation_timeout_secs)
				});
				if timed_out
					&& self.table.transition(&info.id, TransactionStatus::Rejected, |record| {
						record.current_error = Some(format!(
							"Operation not included within {} seconds",
							self.config.confirmation_timeout_secs
						));
					}) {
					tracing::warn!(
						tx_id = %truncate_id(info.id.as_str()),
						timeout_secs = self.config.confirmation_timeout_secs,
						"Operation not included in time"
					);
				}
			},
		}
	}

	fn settle(&self, info: &Record, inclusion: Inclusion) {
		let Inclusion {
			level,
			applied,
			error_ids,
			events,
		} = inclusion;

		if applied {
			if self.table.transition(&info.id, TransactionStatus::Confirmed, |record| {
				record.block_number = Some(level);
				record.emitted_events = Some(events);
			}) {
				tracing::info!(
					tx_id = %truncate_id(info.id.as_str()),
					level,
					"Operation confirmed"
				);
			}
			return;
		}

		let reason = if error_ids.is_empty() {
			"Operation failed".to_string()
		} else {
			error_ids.join(", ")
		};
		if self.table.transition(&info.id, TransactionStatus::Rejected, |record| {
			record.block_number = Some(level);
			record.current_error = Some(reason.clone());
		}) {
			tracing::warn!(
				tx_id = %truncate_id(info.id.as_str()),
				level,
				reason = %reason,
				"Operation failed"
			);
		}
	}

	fn close(&self) {
		if self.runtime.close() {
			self.table.close();
			self.inclusions.clear();
			tracing::info!("Tezos driver closed");
		}
	}
}

#[async_trait]
impl BlockchainDriver for TezosDriver {
	type Params = TezosParams;
	type Info = TezosTransactionInfo;

	async fn initialize(&self) -> Result<(), DriverError> {
		self.inner.session().await.map(|_| ())
	}

	async fn send(
		&self,
		tx: AbstractTransaction<TezosParams>,
	) -> Result<TransactionReceipt, DriverError> {
		self.inner.send_transaction(tx).await
	}

	async fn call(&self, tx: AbstractTransaction<TezosParams>) -> Result<Value, DriverError> {
		self.inner.call(tx).await
	}

	async fn listen(&self, params: ListenParams<TezosParams>) -> Result<EventStream, DriverError> {
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
		_id: &TransactionId,
		_params: Option<TezosParams>,
	) -> Result<TransactionReceipt, DriverError> {
		self.inner.session().await?;
		Err(DriverError::Unsupported(
			"Boosting transactions is not possible on Tezos right now".to_string(),
		))
	}

	async fn cancel_transaction(
		&self,
		_id: &TransactionId,
		_params: Option<TezosParams>,
	) -> Result<TransactionReceipt, DriverError> {
		self.inner.session().await?;
		Err(DriverError::Unsupported(
			"Cancelling transactions is not possible on Tezos right now".to_string(),
		))
	}

	async fn get_last_block(&self) -> Result<BlockInfo, DriverError> {
		self.inner.last_block().await
	}

	async fn close(&self) -> Result<(), DriverError> {
		self.inner.close();
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::testing::{
		applied, block_hash, contract_call, event_result, MockTezosRpc, MockTezosSigner, CONTRACT,
		SIGNATURE, SOURCE,
	};
	use super::*;
	use futures::StreamExt;
	use serde_json::json;
	use std::collections::HashMap;

	fn test_config() -> TezosConfig {
		TezosConfig {
			confirmations: 2,
			confirmation_polling_interval_ms: 10,
			..TezosConfig::new(3_600_000)
		}
	}

	fn mint_type() -> Value {
		json!({
			"prim": "pair",
			"args": [
				{ "prim": "address", "annots": ["%owner"] },
				{ "prim": "nat", "annots": ["%amount"] }
			]
		})
	}

	fn node() -> Arc<MockTezosRpc> {
		let rpc = Arc::new(MockTezosRpc::new());
		let entrypoints = HashMap::from([
			("mint".to_string(), mint_type()),
			("pause".to_string(), json!({ "prim": "unit" })),
		]);
		rpc.state()
			.entrypoints
			.insert(CONTRACT.to_string(), entrypoints);
		rpc
	}

	fn driver(rpc: &Arc<MockTezosRpc>, config: TezosConfig) -> (TezosDriver, Arc<MockTezosSigner>) {
		let signer = Arc::new(MockTezosSigner::new());
		let driver = TezosDriver::new(config, rpc.clone(), signer.clone()).unwrap();
		(driver, signer)
	}

	fn mint_call() -> AbstractTransaction<TezosParams> {
		let mappers = PayloadMappers::new().register_identity("Minted").unwrap();
		AbstractTransaction::new(CONTRACT)
			.with_method("mint", vec![json!("tz1owner"), json!(5)])
			.with_params(TezosParams::default().event_mappers(mappers))
	}

	fn mint_payload() -> Value {
		json!({ "prim": "Pair", "args": [{ "string": "tz1owner" }, { "int": "5" }] })
	}

	#[test]
	fn test_config_requires_polling_interval() {
		assert!(serde_json::from_value::<TezosConfig>(json!({ "confirmations": 2 })).is_err());

		let config: TezosConfig =
			serde_json::from_value(json!({ "polling_interval_ms": 2000 })).unwrap();
		assert_eq!(config, TezosConfig::new(2000));
		assert_eq!(config.confirmations, 5);
		assert_eq!(config.event_delay_in_blocks, 0);

		assert!(matches!(
			TezosConfig::new(0).validate(),
			Err(DriverError::Configuration(_))
		));
	}

	#[test]
	fn test_send_errors_are_classified() {
		let node = |id: &str, message: &str| RpcError::Node {
			id: Some(id.to_string()),
			message: message.to_string(),
		};
		let http = |status: u16| RpcError::Http {
			status,
			body: "error".to_string(),
		};

		let retriable = |error: RpcError| classify_send_error(error).is_retriable();

		assert!(retriable(node("proto.018-Proxford.contract.counter_in_the_past", "")));
		assert!(retriable(node("proto.018-Proxford.tx_rollup_counter_overflow", "")));
		assert!(retriable(node("validate", "Counter 12 already used for contract tz1")));
		assert!(retriable(http(503)));
		assert!(retriable(http(429)));
		assert!(retriable(RpcError::Connection("refused".to_string())));
		assert!(!retriable(http(400)));
		assert!(!retriable(node("proto.018-Proxford.michelson_v1.script_rejected", "")));
		assert!(!retriable(RpcError::Decode("bad json".to_string())));
	}

	#[test]
	fn test_fee_and_simulated_usage() {
		assert_eq!(minimal_fee(3250, 150), 585);
		assert_eq!(minimal_fee(1, 0), 111);

		let mut result = applied("applied", &[]);
		result.consumed_milligas = Some("1500500".to_string());
		result.paid_storage_size_diff = Some("67".to_string());
		result.allocated_destination_contract = Some(true);
		let entry = contract_call("ooSim", CONTRACT, 1, result, Vec::new());
		assert_eq!(simulated_usage(&entry.contents).unwrap(), (1501, 324));

		let entry = contract_call(
			"ooSim",
			CONTRACT,
			1,
			applied("failed", &["proto.alpha.michelson_v1.script_rejected"]),
			Vec::new(),
		);
		assert!(matches!(
			simulated_usage(&entry.contents),
			Err(RpcError::Node { id: Some(id), .. }) if id.ends_with("script_rejected")
		));
	}

	#[tokio::test]
	async fn test_contract_call_is_injected_and_confirmed() {
		let rpc = node();
		let (driver, signer) = driver(&rpc, test_config());

		let receipt = driver.send(mint_call()).await.unwrap();
		assert_eq!(receipt.transaction_id, TransactionId::new(rpc.last_hash()));

		{
			let state = rpc.state();
			let dry_run = &state.simulated[0][0];
			assert_eq!(dry_run.gas_limit, HARD_GAS_LIMIT_PER_OPERATION.to_string());
			assert_eq!(dry_run.fee, "0");
			assert_eq!(state.forged.len(), 2);

			let content = &state.forged[1][0];
			assert_eq!(content.source, SOURCE);
			assert_eq!(content.destination, CONTRACT);
			assert_eq!(content.counter, "42");
			assert_eq!(content.gas_limit, "3250");
			assert_eq!(content.storage_limit, "0");
			assert_eq!(content.fee, "585");
			let parameters = content.parameters.as_ref().unwrap();
			assert_eq!(parameters.entrypoint, "mint");
			assert_eq!(parameters.value, mint_payload());

			let injected = &state.injected[0];
			assert_eq!(injected.len(), 150 + SIGNATURE_LENGTH);
			assert_eq!(&injected[150..], &SIGNATURE[..]);
		}
		let signed = signer.signed.lock().unwrap()[0].clone();
		assert_eq!(signed.branch, block_hash(100));
		assert_eq!(signed.forged_bytes.len(), 150);

		let info = driver.get_transaction_info(&receipt.transaction_id).await.unwrap();
		assert_eq!(info.status, TransactionStatus::Pending);
		assert_eq!(info.nonce, Some(42));
		assert_eq!(info.send_block_number, Some(100));
		assert_eq!(
			info.blockchain_specific_transaction_info,
			Some(TezosTransactionInfo {
				fee: Some(585),
				gas_limit: Some(3250),
				storage_limit: Some(0),
			})
		);

		rpc.include(
			101,
			contract_call(
				receipt.transaction_id.as_str(),
				CONTRACT,
				42,
				applied("applied", &[]),
				vec![event_result(CONTRACT, "Minted", mint_payload())],
			),
		);
		rpc.state().head = 101;
		driver.inner.poll_once().await.unwrap();
		assert_eq!(
			driver.inner.table.status(&receipt.transaction_id),
			Some(TransactionStatus::Pending)
		);

		rpc.state().head = 102;
		driver.inner.poll_once().await.unwrap();
		driver
			.wait_for_confirmation(&receipt.transaction_id)
			.await
			.unwrap();

		let info = driver.get_transaction_info(&receipt.transaction_id).await.unwrap();
		assert_eq!(info.status, TransactionStatus::Confirmed);
		assert_eq!(info.block_number, Some(101));
		let events = info.emitted_events.unwrap();
		assert_eq!(events.len(), 1);
		assert_eq!(events[0].event_name, "Minted");
		assert_eq!(events[0].payload, json!(["tz1owner", 5]));
	}

	#[tokio::test]
	async fn test_explicit_limits_skip_simulation() {
		let rpc = node();
		let (driver, _) = driver(&rpc, test_config());

		let tx = AbstractTransaction::new(CONTRACT)
			.with_method("pause", Vec::new())
			.with_nonce(7)
			.with_params(TezosParams::default().fee(1000).gas_limit(5000).storage_limit(300));
		driver.send(tx).await.unwrap();

		let state = rpc.state();
		assert!(state.simulated.is_empty());
		assert_eq!(state.forged.len(), 1);
		let content = &state.forged[0][0];
		assert_eq!(content.counter, "7");
		assert_eq!(content.fee, "1000");
		assert_eq!(content.gas_limit, "5000");
		assert_eq!(content.storage_limit, "300");
		assert_eq!(
			content.parameters.as_ref().unwrap().value,
			json!({ "prim": "Unit" })
		);
	}

	#[tokio::test]
	async fn test_transfer_has_no_parameters() {
		let rpc = node();
		let (driver, _) = driver(&rpc, test_config());

		driver
			.send(AbstractTransaction::new("tz1recipient").with_value(1_000_000))
			.await
			.unwrap();

		let state = rpc.state();
		let content = &state.forged[1][0];
		assert_eq!(content.destination, "tz1recipient");
		assert_eq!(content.amount, "1000000");
		assert!(content.parameters.is_none());
	}

	#[tokio::test]
	async fn test_unknown_contract_or_method_is_fatal() {
		let rpc = node();
		let (driver, _) = driver(&rpc, test_config());

		let missing = AbstractTransaction::new("KT1missing").with_method("mint", Vec::new());
		let error = driver.send(missing).await.unwrap_err();
		assert!(
			matches!(&error, DriverError::Configuration(m) if m == "No contract at address KT1missing")
		);

		let unknown = AbstractTransaction::new(CONTRACT).with_method("burn", Vec::new());
		let error = driver.send(unknown).await.unwrap_err();
		assert!(matches!(&error, DriverError::Configuration(m) if m.ends_with("method named burn")));
		assert!(!driver.should_retry(&error));

		let bad_args = AbstractTransaction::new(CONTRACT).with_method("mint", vec![json!(true)]);
		assert!(matches!(
			driver.send(bad_args).await,
			Err(DriverError::Configuration(_))
		));
		assert!(rpc.state().injected.is_empty());
	}

	#[tokio::test]
	async fn test_counter_conflicts_are_retriable() {
		let rpc = node();
		{
			let mut state = rpc.state();
			state.simulation_status = "failed".to_string();
			state.simulation_errors =
				vec!["proto.018-Proxford.contract.counter_in_the_past".to_string()];
		}
		let (driver, _) = driver(&rpc, test_config());

		let error = driver.send(mint_call()).await.unwrap_err();
		assert!(driver.should_retry(&error));
		assert!(rpc.state().injected.is_empty());

		rpc.state().simulation_status = "applied".to_string();
		rpc.state().simulation_errors.clear();
		rpc.state().inject_errors.push_back(RpcError::Http {
			status: 503,
			body: "unavailable".to_string(),
		});
		let error = driver.send(mint_call()).await.unwrap_err();
		assert!(driver.should_retry(&error));
		assert!(driver.inner.table.all().is_empty());

		driver.send(mint_call()).await.unwrap();
		assert_eq!(driver.inner.table.all().len(), 1);
	}

	#[tokio::test]
	async fn test_failed_operation_is_rejected() {
		let rpc = node();
		let config = TezosConfig {
			confirmations: 1,
			..test_config()
		};
		let (driver, _) = driver(&rpc, config);

		let id = driver.send(mint_call()).await.unwrap().transaction_id;
		rpc.include(
			101,
			contract_call(
				id.as_str(),
				CONTRACT,
				42,
				applied("failed", &["proto.alpha.michelson_v1.script_rejected"]),
				Vec::new(),
			),
		);
		rpc.state().head = 101;
		driver.inner.poll_once().await.unwrap();

		let result = driver.wait_for_confirmation(&id).await;
		assert!(matches!(
			result,
			Err(DriverError::Rejected { reason, .. }) if reason == "proto.alpha.michelson_v1.script_rejected"
		));
		let info = driver.get_transaction_info(&id).await.unwrap();
		assert_eq!(info.block_number, Some(101));
		assert!(info.emitted_events.is_none());
	}

	#[tokio::test]
	async fn test_operation_not_included_in_time_is_rejected() {
		let rpc = node();
		let config = TezosConfig {
			confirmation_timeout_secs: 0,
			..test_config()
		};
		let (driver, _) = driver(&rpc, config);

		let id = driver.send(mint_call()).await.unwrap().transaction_id;
		driver.inner.poll_once().await.unwrap();

		assert!(matches!(
			driver.wait_for_confirmation(&id).await,
			Err(DriverError::Rejected { .. })
		));
	}

	#[tokio::test]
	async fn test_poller_scans_skipped_levels() {
		let rpc = node();
		let (driver, _) = driver(&rpc, test_config());

		let id = driver.send(mint_call()).await.unwrap().transaction_id;
		rpc.include(
			101,
			contract_call(id.as_str(), CONTRACT, 42, applied("applied", &[]), Vec::new()),
		);
		rpc.state().head = 104;
		rpc.state().block_requests.clear();
		driver.inner.poll_once().await.unwrap();

		assert_eq!(
			rpc.state().block_requests,
			vec![None, Some(101), Some(102), Some(103)]
		);
		assert_eq!(
			driver.inner.table.status(&id),
			Some(TransactionStatus::Confirmed)
		);
	}

	#[tokio::test]
	async fn test_boost_and_cancel_are_unsupported() {
		let rpc = node();
		let (driver, _) = driver(&rpc, test_config());
		let id = driver.send(mint_call()).await.unwrap().transaction_id;

		assert!(matches!(
			driver.boost_transaction(&id, None).await,
			Err(DriverError::Unsupported(m)) if m == "Boosting transactions is not possible on Tezos right now"
		));
		assert!(matches!(
			driver.cancel_transaction(&id, None).await,
			Err(DriverError::Unsupported(m)) if m == "Cancelling transactions is not possible on Tezos right now"
		));
	}

	#[tokio::test]
	async fn test_call_uses_view_mapper() {
		let rpc = node();
		rpc.state().storage.insert(
			CONTRACT.to_string(),
			json!({ "prim": "Pair", "args": [{ "int": "7" }, { "string": "tz1admin" }] }),
		);
		let (driver, _) = driver(&rpc, test_config());

		let views = ViewMappers::new()
			.register("total_supply", |storage, _| Ok(storage[0].clone()))
			.unwrap();
		let tx = AbstractTransaction::new(CONTRACT)
			.with_method("total_supply", Vec::new())
			.with_params(TezosParams::default().view_mappers(views));
		assert_eq!(driver.call(tx).await.unwrap(), json!(7));

		let unmapped = AbstractTransaction::new(CONTRACT).with_method("admin", Vec::new());
		assert!(matches!(
			driver.call(unmapped).await,
			Err(DriverError::Configuration(m)) if m == "No view mapper for method admin"
		));
		assert!(driver.get_transactions_info().await.unwrap().is_empty());
	}

	#[tokio::test]
	async fn test_listen_requires_mappers() {
		let rpc = node();
		let (driver, _) = driver(&rpc, test_config());

		let bare = ListenParams::new(CONTRACT, "Minted");
		assert!(matches!(
			driver.listen(bare).await,
			Err(DriverError::Configuration(_))
		));

		let mappers = PayloadMappers::new().register_identity("Burned").unwrap();
		let unmapped = ListenParams::new(CONTRACT, "Minted")
			.with_params(TezosParams::default().event_mappers(mappers));
		assert!(matches!(
			driver.listen(unmapped).await,
			Err(DriverError::Mapping(MappingError::Missing(_)))
		));
	}

	#[tokio::test]
	async fn test_listen_replays_history() {
		let rpc = node();
		rpc.include(
			95,
			contract_call(
				"ooMinted",
				CONTRACT,
				3,
				applied("applied", &[]),
				vec![event_result(CONTRACT, "Minted", mint_payload())],
			),
		);
		let (driver, _) = driver(&rpc, test_config());

		let mappers = PayloadMappers::new().register_identity("Minted").unwrap();
		let params = ListenParams::new(CONTRACT, "Minted")
			.from_block(90)
			.with_params(TezosParams::default().event_mappers(mappers));
		let mut stream = driver.listen(params).await.unwrap();

		let event = tokio::time::timeout(Duration::from_secs(5), stream.next())
			.await
			.unwrap()
			.unwrap()
			.unwrap();
		assert_eq!(event.block_number, 95);
		assert_eq!(event.transaction_id, TransactionId::from("ooMinted"));
		assert_eq!(event.payload, json!(["tz1owner", 5]));
	}

	#[tokio::test]
	async fn test_external_operation_is_resolved_from_node() {
		let rpc = node();
		rpc.include(
			99,
			contract_call("ooExternal", CONTRACT, 3, applied("applied", &[]), Vec::new()),
		);
		let (driver, _) = driver(&rpc, test_config());

		let id = TransactionId::from("ooExternal");
		driver.wait_for_confirmation(&id).await.unwrap();
		let info = driver.get_transaction_info(&id).await.unwrap();
		assert_eq!(info.status, TransactionStatus::Confirmed);
		assert_eq!(info.block_number, Some(99));
	}

	#[tokio::test]
	async fn test_signer_without_address_is_rejected() {
		let rpc = node();
		let signer = Arc::new(MockTezosSigner {
			address: None,
			..MockTezosSigner::new()
		});
		let driver = TezosDriver::new(test_config(), rpc, signer).unwrap();

		assert!(matches!(
			driver.initialize().await,
			Err(DriverError::Configuration(_))
		));
	}

	#[tokio::test]
	async fn test_closed_driver_refuses_operations() {
		let rpc = node();
		let (driver, _) = driver(&rpc, test_config());
		assert_eq!(driver.get_last_block().await.unwrap().block_number, 100);

		driver.close().await.unwrap();
		assert!(matches!(driver.send(mint_call()).await, Err(DriverError::Closed)));
		assert!(matches!(driver.get_last_block().await, Err(DriverError::Closed)));
	}
}
