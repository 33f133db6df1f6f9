//! Name-keyed payload mappers.
//!
//! Extraction pipelines decode raw event data into a generic JSON tree and then
//! hand it to the mapper registered under the event's name. Registration is
//! validated up front so a lookup can only fail for names never registered.

use crate::ALL_EVENTS;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised while registering or applying payload mappers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MappingError {
	/// The name cannot identify an event.
	#[error("Invalid mapper name '{0}'")]
	InvalidName(String),
	/// A mapper is already registered under this name.
	#[error("Mapper '{0}' is already registered")]
	Duplicate(String),
	/// No mapper is registered under this name.
	#[error("No event mapper for event {0}")]
	Missing(String),
	/// The mapper rejected the payload.
	#[error("Mapper '{name}' failed: {message}")]
	Failed { name: String, message: String },
}

/// Turns a decoded payload into the caller's representation.
///
/// Receives the event name and the decoded payload.
pub type PayloadMapper =
	Arc<dyn Fn(&str, serde_json::Value) -> Result<serde_json::Value, String> + Send + Sync>;

/// Registry of payload mappers keyed by event name.
#[derive(Clone, Default)]
pub struct PayloadMappers {
	mappers: HashMap<String, PayloadMapper>,
}

impl PayloadMappers {
	pub fn new() -> Self {
		Self::default()
	}

	/// Registers `mapper` under `name`.
	///
	/// Empty names, the wildcard and duplicates are rejected.
	pub fn register<F>(mut self, name: impl Into<String>, mapper: F) -> Result<Self, MappingError>
	where
		F: Fn(&str, serde_json::Value) -> Result<serde_json::Value, String> + Send + Sync + 'static,
	{
		let name = name.into();
		if name.trim().is_empty() || name == ALL_EVENTS {
			return Err(MappingError::InvalidName(name));
		}
		if self.mappers.contains_key(&name) {
			return Err(MappingError::Duplicate(name));
		}
		self.mappers.insert(name, Arc::new(mapper));
		Ok(self)
	}

	/// Registers a mapper that returns the decoded payload unchanged.
	pub fn register_identity(self, name: impl Into<String>) -> Result<Self, MappingError> {
		self.register(name, |_, payload| Ok(payload))
	}

	pub fn contains(&self, name: &str) -> bool {
		self.mappers.contains_key(name)
	}

	pub fn is_empty(&self) -> bool {
		self.mappers.is_empty()
	}

	pub fn names(&self) -> impl Iterator<Item = &str> {
		self.mappers.keys().map(String::as_str)
	}

	/// Applies the mapper registered under `name`.
	pub fn apply(
		&self,
		name: &str,
		payload: serde_json::Value,
	) -> Result<serde_json::Value, MappingError> {
		let mapper = self
			.mappers
			.get(name)
			.ok_or_else(|| MappingError::Missing(name.to_string()))?;
		mapper(name, payload).map_err(|message| MappingError::Failed {
			name: name.to_string(),
			message,
		})
	}
}

impl fmt::Debug for PayloadMappers {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let mut names: Vec<&str> = self.names().collect();
		names.sort_unstable();
		f.debug_struct("PayloadMappers").field("names", &names).finish()
	}
}
