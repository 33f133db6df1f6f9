//! Registry trait for driver implementations.
//!
//! Each driver module provides a `Registry` struct implementing this trait so
//! that configuration files can refer to the implementation by name.

/// Base trait for implementation registries.
///
/// Every driver implementation declares the name used for its section in the
/// configuration file and the factory function building it from that section.
pub trait ImplementationRegistry {
	/// The name used in configuration files to reference this implementation,
	/// for example "evm" for `driver.implementations.evm`.
	const NAME: &'static str;

	/// The factory function type this implementation provides.
	type Factory;

	/// Returns the factory function for this implementation.
	fn factory() -> Self::Factory;
}
