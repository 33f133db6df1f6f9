//! Configuration module for the transaction orchestration layer.
//!
//! The configuration is a TOML document with three sections:
//! - `[manager]`: retry policy applied to transaction submission
//! - `[driver]`: the primary driver and one raw section per implementation,
//!   validated against the implementation's schema
//! - `[logging]`: default log filter
//!
//! Files can be split with `include`, see [`ConfigLoader`]. `${VAR}` and
//! `${VAR:-default}` references are replaced with environment values before
//! parsing.

mod loader;

pub use loader::ConfigLoader;

use ledger_driver::implementations::{evm, tezos};
use ledger_retry::RetryConfig;
use ledger_types::ImplementationRegistry;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
	/// Error that occurs during file I/O operations.
	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),
	/// Error that occurs when parsing TOML configuration.
	#[error("Configuration error: {0}")]
	Parse(String),
	/// Error that occurs when configuration validation fails.
	#[error("Validation error: {0}")]
	Validation(String),
}

impl From<toml::de::Error> for ConfigError {
	fn from(err: toml::de::Error) -> Self {
		// The message alone; the default rendering repeats the input.
		ConfigError::Parse(err.message().to_string())
	}
}

/// Root of the configuration document.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
	/// Retry policy of `TransactionManager::send`.
	#[serde(default)]
	pub manager: RetryConfig,
	pub driver: DriverConfig,
	#[serde(default)]
	pub logging: LoggingConfig,
}

/// Driver selection.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DriverConfig {
	/// Name of the implementation to instantiate.
	pub primary: String,
	/// Implementation sections keyed by registry name (`evm`, `tezos`).
	pub implementations: HashMap<String, toml::Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
	/// `EnvFilter` directive used when `RUST_LOG` is unset.
	#[serde(default = "default_log_level")]
	pub level: String,
}

impl Default for LoggingConfig {
	fn default() -> Self {
		Self {
			level: default_log_level(),
		}
	}
}

fn default_log_level() -> String {
	"info".to_string()
}

/// Replaces `${VAR}` and `${VAR:-default}` with environment values.
///
/// A variable that is unset and has no default is an error.
pub(crate) fn resolve_env_vars(input: &str) -> Result<String, ConfigError> {
	// Bounds the regex work on hostile input.
	const MAX_INPUT_SIZE: usize = 1024 * 1024;
	if input.len() > MAX_INPUT_SIZE {
		return Err(ConfigError::Validation(format!(
			"Configuration file too large: {} bytes (max: {} bytes)",
			input.len(),
			MAX_INPUT_SIZE
		)));
	}

	let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]{0,127})(?::-([^}]{0,256}))?\}")
		.map_err(|e| ConfigError::Parse(format!("Regex error: {}", e)))?;

	let mut resolved = String::with_capacity(input.len());
	let mut last = 0;
	for cap in re.captures_iter(input) {
		let (Some(reference), Some(name)) = (cap.get(0), cap.get(1)) else {
			continue;
		};
		let value = match (std::env::var(name.as_str()), cap.get(2)) {
			(Ok(value), _) => value,
			(Err(_), Some(default)) => default.as_str().to_string(),
			(Err(_), None) => {
				return Err(ConfigError::Validation(format!(
					"Environment variable '{}' not found",
					name.as_str()
				)));
			},
		};
		resolved.push_str(&input[last..reference.start()]);
		resolved.push_str(&value);
		last = reference.end();
	}
	resolved.push_str(&input[last..]);

	Ok(resolved)
}

impl Config {
	/// Loads a configuration file with its includes, then validates it.
	pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
		let table = ConfigLoader::new().load(path)?;
		let config: Config = toml::Value::Table(table).try_into()?;
		config.validate()?;
		Ok(config)
	}

	/// Checks the sections against each other and against the driver schemas.
	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.manager.initial_interval_ms == 0 {
			return Err(ConfigError::Validation(
				"manager.initial_interval_ms must be greater than 0".into(),
			));
		}
		if self.manager.max_interval_ms < self.manager.initial_interval_ms {
			return Err(ConfigError::Validation(
				"manager.max_interval_ms cannot be lower than manager.initial_interval_ms".into(),
			));
		}

		if self.driver.implementations.is_empty() {
			return Err(ConfigError::Validation(
				"At least one driver implementation must be configured".into(),
			));
		}
		if self.driver.primary.is_empty() {
			return Err(ConfigError::Validation(
				"Driver primary implementation cannot be empty".into(),
			));
		}
		if !self.driver.implementations.contains_key(&self.driver.primary) {
			return Err(ConfigError::Validation(format!(
				"Primary driver '{}' not found in implementations",
				self.driver.primary
			)));
		}
		for (name, section) in &self.driver.implementations {
			validate_driver_section(name, section)?;
		}

		EnvFilter::try_new(&self.logging.level).map_err(|e| {
			ConfigError::Validation(format!("Invalid log level '{}': {}", self.logging.level, e))
		})?;

		Ok(())
	}

	/// Returns the name and raw section of the primary driver.
	pub fn primary_driver(&self) -> Result<(&str, &toml::Value), ConfigError> {
		self.driver
			.implementations
			.get(&self.driver.primary)
			.map(|section| (self.driver.primary.as_str(), section))
			.ok_or_else(|| {
				ConfigError::Validation(format!(
					"Primary driver '{}' not found in implementations",
					self.driver.primary
				))
			})
	}
}

fn validate_driver_section(name: &str, section: &toml::Value) -> Result<(), ConfigError> {
	let result = if name == evm::Registry::NAME {
		evm::EvmConfigSchema::validate_config(section)
	} else if name == tezos::Registry::NAME {
		tezos::TezosConfigSchema::validate_config(section)
	} else {
		return Err(ConfigError::Validation(format!(
			"Unknown driver implementation '{}'",
			name
		)));
	};
	result.map_err(|e| ConfigError::Validation(format!("driver.implementations.{}: {}", name, e)))
}

impl FromStr for Config {
	type Err = ConfigError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let resolved = resolve_env_vars(s)?;
		let config: Config = toml::from_str(&resolved)?;
		config.validate()?;
		Ok(config)
	}
}

/// Installs the global `tracing` subscriber.
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init_logging(config: &LoggingConfig) -> Result<(), ConfigError> {
	let filter = EnvFilter::try_from_default_env()
		.or_else(|_| EnvFilter::try_new(&config.level))
		.map_err(|e| {
			ConfigError::Validation(format!("Invalid log level '{}': {}", config.level, e))
		})?;

	tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_thread_ids(true)
		.with_target(true)
		.try_init()
		.map_err(|e| ConfigError::Validation(format!("Cannot install logger: {}", e)))
}
