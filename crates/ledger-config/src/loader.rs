//! Multi-file configuration loading.
//!
//! A file may pull other files in with `include = "file.toml"` or
//! `include = ["a.toml", "b.toml"]`. Included paths are relative to the file
//! naming them and may include further files. Every top-level section must be
//! defined exactly once across the whole tree.

use crate::{resolve_env_vars, ConfigError};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

/// Loads a configuration file and everything it includes into one table.
#[derive(Default)]
pub struct ConfigLoader {
	/// Canonical paths already read, to detect include cycles.
	visited: HashSet<PathBuf>,
	/// File each top-level section was read from.
	section_sources: HashMap<String, PathBuf>,
}

impl ConfigLoader {
	pub fn new() -> Self {
		Self::default()
	}

	/// Reads `path` and its includes, depth first.
	pub fn load(&mut self, path: impl AsRef<Path>) -> Result<toml::Table, ConfigError> {
		let mut merged = toml::Table::new();
		self.merge_file(path.as_ref(), &mut merged)?;
		Ok(merged)
	}

	fn merge_file(&mut self, path: &Path, merged: &mut toml::Table) -> Result<(), ConfigError> {
		let canonical = path.canonicalize().map_err(|e| {
			ConfigError::Io(std::io::Error::new(
				e.kind(),
				format!("Cannot resolve path {}: {}", path.display(), e),
			))
		})?;
		if !self.visited.insert(canonical.clone()) {
			return Err(ConfigError::Validation(format!(
				"Circular include detected: {} was already loaded",
				canonical.display()
			)));
		}

		let content = resolve_env_vars(&std::fs::read_to_string(&canonical)?)?;
		let mut table: toml::Table = toml::from_str(&content)?;
		let includes = include_paths(table.remove("include"))?;
		tracing::debug!(
			file = %canonical.display(),
			sections = table.len(),
			includes = includes.len(),
			"Loaded configuration file"
		);

		for (section, value) in table {
			if let Some(source) = self.section_sources.get(&section) {
				return Err(ConfigError::Validation(format!(
					"Duplicate section '{}' found in {} and {}",
					section,
					source.display(),
					canonical.display()
				)));
			}
			self.section_sources.insert(section.clone(), canonical.clone());
			merged.insert(section, value);
		}

		let base = canonical.parent().unwrap_or_else(|| Path::new("."));
		for include in includes {
			let resolved = if include.is_absolute() {
				include
			} else {
				base.join(include)
			};
			self.merge_file(&resolved, merged)?;
		}
		Ok(())
	}
}

fn include_paths(value: Option<toml::Value>) -> Result<Vec<PathBuf>, ConfigError> {
	match value {
		None => Ok(Vec::new()),
		Some(toml::Value::String(path)) => Ok(vec![PathBuf::from(path)]),
		Some(toml::Value::Array(items)) => items
			.into_iter()
			.map(|item| match item {
				toml::Value::String(path) => Ok(PathBuf::from(path)),
				_ => Err(ConfigError::Validation(
					"Include array must contain only strings".into(),
				)),
			})
			.collect(),
		Some(_) => Err(ConfigError::Validation(
			"Include must be a string or array of strings".into(),
		)),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::fs;
	use tempfile::TempDir;

	#[test]
	fn test_nested_includes_are_merged() {
		let dir = TempDir::new().unwrap();
		fs::create_dir(dir.path().join("drivers")).unwrap();
		fs::write(
			dir.path().join("main.toml"),
			r#"
include = ["drivers/driver.toml"]

[manager]
max_retries = 3
"#,
		)
		.unwrap();
		fs::write(
			dir.path().join("drivers/driver.toml"),
			r#"
include = "logging.toml"

[driver]
primary = "tezos"
"#,
		)
		.unwrap();
		// Relative to drivers/, not to the main file.
		fs::write(
			dir.path().join("drivers/logging.toml"),
			"[logging]\nlevel = \"debug\"\n",
		)
		.unwrap();

		let merged = ConfigLoader::new().load(dir.path().join("main.toml")).unwrap();
		let table = toml::Value::Table(merged);

		assert_eq!(table["manager"]["max_retries"].as_integer(), Some(3));
		assert_eq!(table["driver"]["primary"].as_str(), Some("tezos"));
		assert_eq!(table["logging"]["level"].as_str(), Some("debug"));
		assert!(table.get("include").is_none());
	}

	#[test]
	fn test_duplicate_section_is_rejected() {
		let dir = TempDir::new().unwrap();
		fs::write(
			dir.path().join("main.toml"),
			"include = [\"other.toml\"]\n[driver]\nprimary = \"evm\"\n",
		)
		.unwrap();
		fs::write(dir.path().join("other.toml"), "[driver]\nprimary = \"tezos\"\n").unwrap();

		let error = ConfigLoader::new()
			.load(dir.path().join("main.toml"))
			.unwrap_err();
		assert!(error.to_string().contains("Duplicate section 'driver'"));
	}

	#[test]
	fn test_include_cycle_is_rejected() {
		let dir = TempDir::new().unwrap();
		fs::write(dir.path().join("a.toml"), "include = \"b.toml\"\n[manager]\n").unwrap();
		fs::write(dir.path().join("b.toml"), "include = \"a.toml\"\n[logging]\n").unwrap();

		let error = ConfigLoader::new().load(dir.path().join("a.toml")).unwrap_err();
		assert!(error.to_string().contains("already loaded"));
	}

	#[test]
	fn test_invalid_include_and_missing_file() {
		let dir = TempDir::new().unwrap();
		fs::write(dir.path().join("main.toml"), "include = 5\n").unwrap();
		let error = ConfigLoader::new()
			.load(dir.path().join("main.toml"))
			.unwrap_err();
		assert!(matches!(error, ConfigError::Validation(_)));

		fs::write(dir.path().join("main.toml"), "include = [\"missing.toml\"]\n").unwrap();
		let error = ConfigLoader::new()
			.load(dir.path().join("main.toml"))
			.unwrap_err();
		assert!(matches!(error, ConfigError::Io(_)));
	}
}
