//! Fee arithmetic in ledger base units.
//!
//! Multiplicative factors are applied in fixed point with nine decimals so that
//! factors such as 1.2 scale integer amounts exactly.

/// One gwei expressed in wei.
pub const ONE_GWEI: u128 = 1_000_000_000;

const FACTOR_SCALE: u128 = 1_000_000_000;

/// Converts an amount in gwei to wei.
pub fn gwei_to_wei(gwei: u64) -> u128 {
	u128::from(gwei) * ONE_GWEI
}

fn scaled_factor(factor: f64) -> u128 {
	if factor.is_finite() && factor > 0.0 {
		(factor * FACTOR_SCALE as f64).round() as u128
	} else {
		0
	}
}

/// Returns `ceil(value * factor)`.
pub fn ceil_scale(value: u128, factor: f64) -> u128 {
	let product = value.saturating_mul(scaled_factor(factor));
	product / FACTOR_SCALE + u128::from(product % FACTOR_SCALE != 0)
}

/// Returns `floor(value * factor)`.
pub fn floor_scale(value: u128, factor: f64) -> u128 {
	value.saturating_mul(scaled_factor(factor)) / FACTOR_SCALE
}
