//! Common types module for the ledger orchestration layer.
//!
//! This module defines the ledger-agnostic data model shared by the drivers,
//! the transaction manager and the configuration layer: transaction identities
//! and lifecycle records, emitted events, block references, the signing
//! capability and the name-keyed payload mappers used during event extraction.

/// Emitted events, listen parameters and block references.
pub mod events;
/// Name-keyed payload mappers applied to decoded event payloads.
pub mod mapper;
/// Registry trait tying configuration names to driver factories.
pub mod registry;
/// Signing capability injected into drivers.
pub mod signer;
/// Transaction identities, submissions and lifecycle records.
pub mod transaction;
/// Utility functions for formatting and unit conversion.
pub mod utils;
/// Configuration validation types for ensuring type-safe configurations.
pub mod validation;

pub use events::*;
pub use mapper::*;
pub use registry::*;
pub use signer::*;
pub use transaction::*;
pub use utils::{
	ceil_scale, floor_scale, gwei_to_wei, truncate_id, with_0x_prefix, without_0x_prefix, ONE_GWEI,
};
pub use validation::*;
