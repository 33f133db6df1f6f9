//! Views computed from contract storage.
//!
//! Tezos contracts expose no callable read-only entrypoints to the driver, so
//! a `call` reads the storage and hands it to the mapper registered under the
//! method name.

use ledger_types::MappingError;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Computes a view result from the Micheline storage and the call arguments.
pub type ViewMapper = Arc<dyn Fn(&Value, &[Value]) -> Result<Value, String> + Send + Sync>;

/// Registry of view mappers keyed by method name.
#[derive(Clone, Default)]
pub struct ViewMappers {
	mappers: HashMap<String, ViewMapper>,
}

impl ViewMappers {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn register<F>(mut self, method: impl Into<String>, mapper: F) -> Result<Self, MappingError>
	where
		F: Fn(&Value, &[Value]) -> Result<Value, String> + Send + Sync + 'static,
	{
		let method = method.into();
		if method.trim().is_empty() {
			return Err(MappingError::InvalidName(method));
		}
		if self.mappers.contains_key(&method) {
			return Err(MappingError::Duplicate(method));
		}
		self.mappers.insert(method, Arc::new(mapper));
		Ok(self)
	}

	pub fn contains(&self, method: &str) -> bool {
		self.mappers.contains_key(method)
	}

	/// Applies the mapper of `method`; `None` when none is registered.
	pub fn apply(
		&self,
		method: &str,
		storage: &Value,
		args: &[Value],
	) -> Option<Result<Value, MappingError>> {
		let mapper = self.mappers.get(method)?;
		Some(mapper(storage, args).map_err(|message| MappingError::Failed {
			name: method.to_string(),
			message,
		}))
	}
}

impl fmt::Debug for ViewMappers {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let mut methods: Vec<&str> = self.mappers.keys().map(String::as_str).collect();
		methods.sort_unstable();
		f.debug_struct("ViewMappers").field("methods", &methods).finish()
	}
}
