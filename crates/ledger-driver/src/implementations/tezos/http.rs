//! Tezos node RPC over HTTP, and the driver factory.

use super::rpc::{
	OperationContent, PendingOperations, TezosBlock, TezosRpc, TransactionContent,
};
use super::{TezosConfig, TezosConfigSchema, TezosDriver, TezosUnsignedOperation};
use crate::{DriverError, RpcError};
use async_trait::async_trait;
use ledger_types::{ConfigSchema, Signer};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

const CHAIN: &str = "/chains/main";
const HEAD: &str = "/chains/main/blocks/head";

/// [`TezosRpc`] over the node's JSON/HTTP interface.
pub struct HttpTezosRpc {
	client: reqwest::Client,
	base_url: String,
}

impl HttpTezosRpc {
	pub fn new(node_url: &str) -> Result<Self, DriverError> {
		reqwest::Url::parse(node_url).map_err(|e| {
			DriverError::Configuration(format!("Invalid node URL {}: {}", node_url, e))
		})?;
		Ok(Self {
			client: reqwest::Client::new(),
			base_url: node_url.trim_end_matches('/').to_string(),
		})
	}

	fn url(&self, path: &str) -> String {
		format!("{}{}", self.base_url, path)
	}

	async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, RpcError> {
		let response = self
			.client
			.get(self.url(path))
			.send()
			.await
			.map_err(|e| RpcError::Connection(e.to_string()))?;
		read_json(response).await
	}

	async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
		&self,
		path: &str,
		body: &B,
	) -> Result<T, RpcError> {
		let response = self
			.client
			.post(self.url(path))
			.json(body)
			.send()
			.await
			.map_err(|e| RpcError::Connection(e.to_string()))?;
		read_json(response).await
	}
}

async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, RpcError> {
	let status = response.status();
	let body = response
		.text()
		.await
		.map_err(|e| RpcError::Connection(e.to_string()))?;
	if !status.is_success() {
		return Err(RpcError::Http {
			status: status.as_u16(),
			body,
		});
	}
	serde_json::from_str(&body).map_err(|e| RpcError::Decode(e.to_string()))
}

fn block_path(level: Option<u64>) -> String {
	match level {
		Some(level) => format!("{}/blocks/{}", CHAIN, level),
		None => HEAD.to_string(),
	}
}

fn contract_path(contract: &str, resource: &str) -> String {
	format!("{}/context/contracts/{}/{}", HEAD, contract, resource)
}

#[derive(Deserialize)]
struct EntrypointsResponse {
	#[serde(default)]
	entrypoints: HashMap<String, Value>,
}

#[derive(Deserialize)]
struct RunOperationResponse {
	contents: Vec<OperationContent>,
}

#[async_trait]
impl TezosRpc for HttpTezosRpc {
	async fn chain_id(&self) -> Result<String, RpcError> {
		self.get(&format!("{}/chain_id", CHAIN)).await
	}

	async fn block(&self, level: Option<u64>) -> Result<TezosBlock, RpcError> {
		self.get(&block_path(level)).await
	}

	async fn counter(&self, address: &str) -> Result<u64, RpcError> {
		let counter: String = self.get(&contract_path(address, "counter")).await?;
		counter
			.parse()
			.map_err(|e| RpcError::Decode(format!("Invalid counter {}: {}", counter, e)))
	}

	async fn entrypoints(&self, contract: &str) -> Result<Option<HashMap<String, Value>>, RpcError> {
		match self
			.get::<EntrypointsResponse>(&contract_path(contract, "entrypoints"))
			.await
		{
			Ok(response) => Ok(Some(response.entrypoints)),
			Err(RpcError::Http { status, .. }) if status == StatusCode::NOT_FOUND.as_u16() => Ok(None),
			Err(e) => Err(e),
		}
	}

	async fn storage(&self, contract: &str) -> Result<Value, RpcError> {
		self.get(&contract_path(contract, "storage")).await
	}

	async fn run_operation(
		&self,
		branch: &str,
		contents: &[TransactionContent],
		signature: &str,
		chain_id: &str,
	) -> Result<Vec<OperationContent>, RpcError> {
		let body = json!({
			"operation": {
				"branch": branch,
				"contents": contents,
				"signature": signature,
			},
			"chain_id": chain_id,
		});
		let response: RunOperationResponse = self
			.post(&format!("{}/helpers/scripts/run_operation", HEAD), &body)
			.await?;
		Ok(response.contents)
	}

	async fn forge(
		&self,
		branch: &str,
		contents: &[TransactionContent],
	) -> Result<Vec<u8>, RpcError> {
		let body = json!({ "branch": branch, "contents": contents });
		let forged: String = self
			.post(&format!("{}/helpers/forge/operations", HEAD), &body)
			.await?;
		hex::decode(&forged).map_err(|e| RpcError::Decode(format!("Invalid forged bytes: {}", e)))
	}

	async fn inject(&self, signed_operation: &[u8]) -> Result<String, RpcError> {
		self.post("/injection/operation", &hex::encode(signed_operation))
			.await
	}

	async fn pending_operations(&self) -> Result<PendingOperations, RpcError> {
		let raw: Value = self
			.get(&format!("{}/mempool/pending_operations", CHAIN))
			.await?;
		PendingOperations::from_json(raw)
	}
}

/// Factory function to create a Tezos driver from configuration.
///
/// Configuration parameters:
/// - `node_url`: RPC endpoint of the node (required)
/// - `polling_interval_ms`: period of the block poller (required)
/// - every other field of [`TezosConfig`], all optional
pub fn create_driver(
	config: &toml::Value,
	signer: Arc<dyn Signer<TezosUnsignedOperation>>,
) -> Result<TezosDriver, DriverError> {
	TezosConfigSchema::validate_config(config)
		.map_err(|e| DriverError::Configuration(format!("Invalid configuration: {}", e)))?;

	let node_url = config
		.get("node_url")
		.and_then(|v| v.as_str())
		.ok_or_else(|| DriverError::Configuration("node_url is required".to_string()))?;
	let driver_config: TezosConfig = config
		.clone()
		.try_into()
		.map_err(|e| DriverError::Configuration(format!("Invalid configuration: {}", e)))?;

	let rpc = Arc::new(HttpTezosRpc::new(node_url)?);
	TezosDriver::new(driver_config, rpc, signer)
}

/// Signature of the Tezos driver factory.
pub type TezosDriverFactory =
	fn(&toml::Value, Arc<dyn Signer<TezosUnsignedOperation>>) -> Result<TezosDriver, DriverError>;

/// Registry for the Tezos driver implementation.
pub struct Registry;

impl ledger_types::ImplementationRegistry for Registry {
	const NAME: &'static str = "tezos";
	type Factory = TezosDriverFactory;

	fn factory() -> Self::Factory {
		create_driver
	}
}
