//! Alloy-backed RPC capability, local signer and driver factory.

use super::rpc::{EvmCallRequest, EvmLog, EvmLogFilter, EvmReceipt, EvmRpc, EvmTransaction};
use super::{EvmConfig, EvmConfigSchema, EvmDriver};
use crate::{DriverError, RpcError};
use alloy_consensus::{SignableTransaction, Transaction as _, TxEnvelope, TxLegacy};
use alloy_eips::eip2718::Encodable2718;
use alloy_primitives::{Address, Bytes, TxKind, B256, U64};
use alloy_provider::{Provider, RootProvider};
use alloy_rpc_types::{Filter, Log, TransactionInput, TransactionRequest};
use alloy_signer::SignerSync;
use alloy_signer_local::PrivateKeySigner;
use alloy_transport::TransportError;
use alloy_transport_http::Http;
use async_trait::async_trait;
use ledger_types::{with_0x_prefix, BlockInfo, ConfigSchema, Signer, SignerError};
use serde::Deserialize;
use std::sync::Arc;

/// [`EvmRpc`] over JSON-RPC/HTTP.
pub struct AlloyEvmRpc {
	provider: RootProvider<Http<reqwest::Client>>,
}

impl AlloyEvmRpc {
	pub fn new(node_url: &str) -> Result<Self, DriverError> {
		let url = node_url.parse().map_err(|e| {
			DriverError::Configuration(format!("Invalid node URL {}: {}", node_url, e))
		})?;
		Ok(Self {
			provider: RootProvider::new_http(url),
		})
	}
}

fn map_transport_error(error: TransportError) -> RpcError {
	if let Some(payload) = error.as_error_resp() {
		return RpcError::Node {
			id: Some(payload.code.to_string()),
			message: payload.message.to_string(),
		};
	}
	if error.is_transport_error() {
		return RpcError::Connection(error.to_string());
	}
	RpcError::Decode(error.to_string())
}

fn to_request(request: &EvmCallRequest) -> TransactionRequest {
	TransactionRequest {
		from: request.from,
		to: Some(TxKind::Call(request.to)),
		value: Some(request.value),
		gas: request.gas,
		gas_price: request.gas_price,
		input: TransactionInput::new(request.data.clone()),
		..Default::default()
	}
}

fn to_log(log: &Log) -> EvmLog {
	EvmLog {
		address: log.inner.address,
		topics: log.inner.data.topics().to_vec(),
		data: log.inner.data.data.clone(),
		block_number: log.block_number,
		block_hash: log.block_hash,
		transaction_hash: log.transaction_hash,
	}
}

/// Header fields of `eth_getBlockByNumber`.
#[derive(Debug, Deserialize)]
struct BlockHeader {
	number: U64,
	hash: B256,
}

#[async_trait]
impl EvmRpc for AlloyEvmRpc {
	async fn chain_id(&self) -> Result<u64, RpcError> {
		self.provider.get_chain_id().await.map_err(map_transport_error)
	}

	async fn latest_block(&self) -> Result<BlockInfo, RpcError> {
		let header: Option<BlockHeader> = self
			.provider
			.raw_request("eth_getBlockByNumber".into(), ("latest", false))
			.await
			.map_err(map_transport_error)?;
		let header = header.ok_or_else(|| RpcError::Decode("Latest block not found".to_string()))?;
		Ok(BlockInfo {
			block_number: header.number.to::<u64>(),
			block_hash: format!("{:#x}", header.hash),
		})
	}

	async fn gas_price(&self) -> Result<u128, RpcError> {
		self.provider.get_gas_price().await.map_err(map_transport_error)
	}

	async fn pending_nonce(&self, address: Address) -> Result<u64, RpcError> {
		self.provider
			.get_transaction_count(address)
			.pending()
			.await
			.map_err(map_transport_error)
	}

	async fn estimate_gas(&self, request: &EvmCallRequest) -> Result<u64, RpcError> {
		self.provider
			.estimate_gas(&to_request(request))
			.await
			.map_err(map_transport_error)
	}

	async fn call(&self, request: &EvmCallRequest) -> Result<Bytes, RpcError> {
		self.provider
			.call(&to_request(request))
			.await
			.map_err(map_transport_error)
	}

	async fn send_raw_transaction(&self, raw: &[u8]) -> Result<B256, RpcError> {
		let pending = self
			.provider
			.send_raw_transaction(raw)
			.await
			.map_err(map_transport_error)?;
		Ok(*pending.tx_hash())
	}

	async fn transaction_receipt(&self, hash: B256) -> Result<Option<EvmReceipt>, RpcError> {
		let receipt = self
			.provider
			.get_transaction_receipt(hash)
			.await
			.map_err(map_transport_error)?;
		Ok(receipt.map(|receipt| EvmReceipt {
			transaction_hash: receipt.transaction_hash,
			status: receipt.status(),
			block_number: receipt.block_number,
			block_hash: receipt.block_hash,
			logs: receipt.inner.logs().iter().map(to_log).collect(),
		}))
	}

	async fn transaction_by_hash(&self, hash: B256) -> Result<Option<EvmTransaction>, RpcError> {
		let tx = self
			.provider
			.get_transaction_by_hash(hash)
			.await
			.map_err(map_transport_error)?;
		Ok(tx.map(|tx| EvmTransaction {
			hash,
			nonce: tx.nonce(),
			gas_price: tx.gas_price(),
			gas_limit: tx.gas_limit(),
			block_number: tx.block_number,
		}))
	}

	async fn logs(&self, filter: &EvmLogFilter) -> Result<Vec<EvmLog>, RpcError> {
		let filter = Filter::new()
			.address(filter.address)
			.from_block(filter.from_block)
			.to_block(filter.to_block);
		let logs = self
			.provider
			.get_logs(&filter)
			.await
			.map_err(map_transport_error)?;
		Ok(logs.iter().map(to_log).collect())
	}
}

/// Signs legacy transactions with a local private key.
pub struct LocalEvmSigner {
	signer: PrivateKeySigner,
}

impl LocalEvmSigner {
	pub fn new(private_key: &str) -> Result<Self, SignerError> {
		let signer = private_key
			.parse::<PrivateKeySigner>()
			.map_err(|e| SignerError::InvalidKey(e.to_string()))?;
		Ok(Self { signer })
	}
}

#[async_trait]
impl Signer<TxLegacy> for LocalEvmSigner {
	async fn sign(&self, tx: &TxLegacy) -> Result<Vec<u8>, SignerError> {
		let signature = self
			.signer
			.sign_hash_sync(&tx.signature_hash())
			.map_err(|e| SignerError::Signing(e.to_string()))?;
		let envelope = TxEnvelope::from(tx.clone().into_signed(signature));
		Ok(envelope.encoded_2718())
	}

	async fn public_key(&self) -> Result<String, SignerError> {
		let point = self.signer.credential().verifying_key().to_encoded_point(false);
		Ok(with_0x_prefix(&hex::encode(point.as_bytes())))
	}

	async fn address(&self) -> Result<Option<String>, SignerError> {
		Ok(Some(self.signer.address().to_checksum(None)))
	}
}

/// Factory function to create an EVM driver from configuration.
///
/// Configuration parameters:
/// - `node_url`: JSON-RPC endpoint of the node (required)
/// - every field of [`EvmConfig`], all optional
pub fn create_driver(
	config: &toml::Value,
	signer: Arc<dyn Signer<TxLegacy>>,
) -> Result<EvmDriver, DriverError> {
	EvmConfigSchema::validate_config(config)
		.map_err(|e| DriverError::Configuration(format!("Invalid configuration: {}", e)))?;

	let node_url = config
		.get("node_url")
		.and_then(|v| v.as_str())
		.ok_or_else(|| DriverError::Configuration("node_url is required".to_string()))?;
	let driver_config: EvmConfig = config
		.clone()
		.try_into()
		.map_err(|e| DriverError::Configuration(format!("Invalid configuration: {}", e)))?;

	let rpc = Arc::new(AlloyEvmRpc::new(node_url)?);
	EvmDriver::new(driver_config, rpc, signer)
}

/// Signature of the EVM driver factory.
pub type EvmDriverFactory =
	fn(&toml::Value, Arc<dyn Signer<TxLegacy>>) -> Result<EvmDriver, DriverError>;

/// Registry for the EVM driver implementation.
pub struct Registry;

impl ledger_types::ImplementationRegistry for Registry {
	const NAME: &'static str = "evm";
	type Factory = EvmDriverFactory;

	fn factory() -> Self::Factory {
		create_driver
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::implementations::evm::address_from_public_key;
	use crate::implementations::evm::testing::TEST_KEY;
	use alloy_eips::eip2718::Decodable2718;
	use alloy_primitives::{address, U256};
	use ledger_types::ImplementationRegistry;

	const TEST_ADDRESS: Address = address!("f39Fd6e51aad88F6F4ce6aB8827279cffFb92266");

	#[tokio::test]
	async fn test_signed_transaction_recovers_signer() {
		let signer = LocalEvmSigner::new(TEST_KEY).unwrap();
		let tx = TxLegacy {
			chain_id: Some(1337),
			nonce: 5,
			gas_price: 100_000_000_000,
			gas_limit: 21_000,
			to: TxKind::Call(Address::repeat_byte(0x11)),
			value: U256::from(1u64),
			input: Bytes::new(),
		};

		let raw = signer.sign(&tx).await.unwrap();
		let TxEnvelope::Legacy(signed) = TxEnvelope::decode_2718(&mut raw.as_slice()).unwrap()
		else {
			panic!("expected a legacy transaction");
		};
		assert_eq!(signed.tx(), &tx);
		assert_eq!(signed.recover_signer().unwrap(), TEST_ADDRESS);
	}

	#[tokio::test]
	async fn test_public_key_derives_address() {
		let signer = LocalEvmSigner::new(TEST_KEY).unwrap();
		let public_key = signer.public_key().await.unwrap();

		assert_eq!(address_from_public_key(&public_key).unwrap(), TEST_ADDRESS);
		assert_eq!(
			signer.address().await.unwrap(),
			Some(TEST_ADDRESS.to_checksum(None))
		);
	}

	#[test]
	fn test_invalid_key_is_rejected() {
		assert!(matches!(
			LocalEvmSigner::new("0x1234"),
			Err(SignerError::InvalidKey(_))
		));
	}

	#[test]
	fn test_factory_validates_configuration() {
		let signer: Arc<dyn Signer<TxLegacy>> = Arc::new(LocalEvmSigner::new(TEST_KEY).unwrap());
		let factory = Registry::factory();

		let missing_url: toml::Value = toml::from_str("confirmations = 2").unwrap();
		assert!(matches!(
			factory(&missing_url, signer.clone()),
			Err(DriverError::Configuration(_))
		));

		let inverted_bounds: toml::Value = toml::from_str(
			r#"
			node_url = "http://localhost:8545"
			min_gas_price_gwei = 400
			max_gas_price_gwei = 350
			"#,
		)
		.unwrap();
		assert!(matches!(
			factory(&inverted_bounds, signer.clone()),
			Err(DriverError::Configuration(_))
		));

		let valid: toml::Value = toml::from_str(
			r#"
			node_url = "http://localhost:8545"
			confirmations = 3
			gas_price_factor = 1.5
			"#,
		)
		.unwrap();
		let driver = factory(&valid, signer).unwrap();
		assert_eq!(driver.config().confirmations, 3);
		assert_eq!(driver.config().gas_price_factor, 1.5);
		assert_eq!(driver.config().event_delay_in_blocks, 5);
		assert_eq!(Registry::NAME, "evm");
	}
}
