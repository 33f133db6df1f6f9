//! Utility functions shared across the ledger crates.
//!
//! This module provides helpers for formatting identifiers in log output and
//! for fee arithmetic in ledger base units.

pub mod formatting;
pub mod units;

pub use formatting::{truncate_id, with_0x_prefix, without_0x_prefix};
pub use units::{ceil_scale, floor_scale, gwei_to_wei, ONE_GWEI};
