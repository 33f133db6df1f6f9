//! Signing capability used by drivers.
//!
//! Drivers never hold keys; they build the ledger transaction and ask the
//! injected signer for the bytes to broadcast.

use async_trait::async_trait;
use thiserror::Error;

/// Errors that can occur during signing.
#[derive(Debug, Error)]
pub enum SignerError {
	/// The key material is unusable.
	#[error("Invalid key: {0}")]
	InvalidKey(String),
	/// Producing the signature failed.
	#[error("Signing failed: {0}")]
	Signing(String),
}

/// Signs ledger transactions of type `Tx`.
///
/// What `sign` returns depends on the ledger: the fully encoded signed
/// transaction on EVM, the raw signature over the forged operation on Tezos.
#[async_trait]
pub trait Signer<Tx>: Send + Sync
where
	Tx: Send + Sync,
{
	/// Signs the transaction.
	async fn sign(&self, tx: &Tx) -> Result<Vec<u8>, SignerError>;

	/// Returns the ledger encoding of the signing public key.
	async fn public_key(&self) -> Result<String, SignerError>;

	/// Returns the signing address when the signer knows it.
	///
	/// Drivers derive the address from the public key when this is `None`.
	async fn address(&self) -> Result<Option<String>, SignerError> {
		Ok(None)
	}
}
