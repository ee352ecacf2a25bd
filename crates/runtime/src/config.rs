//! Broker configuration.
//!
//! Loaded from an optional JSON file and overridden from the environment.
//! A missing file yields the defaults.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const DEFAULT_MAX_BACKLOG: u32 = 1024;

pub const ENV_MAX_BACKLOG: &str = "UCM_MAX_BACKLOG";
pub const ENV_ID_LIMIT: &str = "UCM_ID_LIMIT";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BrokerConfig {
	/// Backlog ceiling applied when a listener does not pick a smaller one.
	pub max_backlog: u32,
	/// Number of ids each handle table may hand out concurrently.
	pub id_limit: u32,
}

impl Default for BrokerConfig {
	fn default() -> Self {
		Self {
			max_backlog: DEFAULT_MAX_BACKLOG,
			id_limit: u32::MAX,
		}
	}
}

impl BrokerConfig {
	/// Reads a JSON config file. A missing file is not an error.
	pub fn load(path: &Path) -> Result<Self> {
		match fs::read_to_string(path) {
			Ok(content) => Ok(serde_json::from_str(&content)?),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
			Err(e) => Err(e.into()),
		}
	}

	/// Applies `UCM_MAX_BACKLOG` / `UCM_ID_LIMIT` from the process environment.
	pub fn with_env(self) -> Result<Self> {
		self.with_overrides(|key| std::env::var(key).ok())
	}

	/// Applies overrides from an arbitrary key lookup.
	pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
		if let Some(raw) = lookup(ENV_MAX_BACKLOG) {
			self.max_backlog = parse_u32(ENV_MAX_BACKLOG, &raw)?;
		}
		if let Some(raw) = lookup(ENV_ID_LIMIT) {
			self.id_limit = parse_u32(ENV_ID_LIMIT, &raw)?;
		}
		self.validate()?;
		Ok(self)
	}

	pub fn validate(&self) -> Result<()> {
		if self.max_backlog == 0 {
			return Err(Error::InvalidArgument("max_backlog must be positive".into()));
		}
		if self.id_limit == 0 {
			return Err(Error::InvalidArgument("id_limit must be positive".into()));
		}
		Ok(())
	}
}

fn parse_u32(key: &str, raw: &str) -> Result<u32> {
	raw.trim()
		.parse()
		.map_err(|_| Error::InvalidArgument(format!("{key}: expected an unsigned integer, got '{raw}'")))
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;

	use tempfile::TempDir;

	use super::*;

	#[test]
	fn test_defaults() {
		let config = BrokerConfig::default();
		assert_eq!(config.max_backlog, 1024);
		assert_eq!(config.id_limit, u32::MAX);
	}

	#[test]
	fn test_load_missing_file_yields_defaults() {
		let tmp = TempDir::new().unwrap();
		let config = BrokerConfig::load(&tmp.path().join("absent.json")).unwrap();
		assert_eq!(config, BrokerConfig::default());
	}

	#[test]
	fn test_load_partial_file() {
		let tmp = TempDir::new().unwrap();
		let path = tmp.path().join("ucmd.json");
		fs::write(&path, r#"{"maxBacklog": 16}"#).unwrap();

		let config = BrokerConfig::load(&path).unwrap();
		assert_eq!(config.max_backlog, 16);
		assert_eq!(config.id_limit, u32::MAX);
	}

	#[test]
	fn test_load_malformed_file() {
		let tmp = TempDir::new().unwrap();
		let path = tmp.path().join("ucmd.json");
		fs::write(&path, "{not json").unwrap();

		assert!(matches!(BrokerConfig::load(&path), Err(Error::Json(_))));
	}

	#[test]
	fn test_load_unreadable_path_is_io_error() {
		let tmp = TempDir::new().unwrap();

		let err = BrokerConfig::load(tmp.path()).unwrap_err();
		assert!(matches!(err, Error::Io(_)));
		assert_eq!(err.code(), "EIO");
	}

	#[test]
	fn test_overrides_take_precedence() {
		let env: HashMap<&str, &str> = [(ENV_MAX_BACKLOG, "8"), (ENV_ID_LIMIT, " 32 ")].into();
		let config = BrokerConfig::default()
			.with_overrides(|k| env.get(k).map(|v| v.to_string()))
			.unwrap();
		assert_eq!(config.max_backlog, 8);
		assert_eq!(config.id_limit, 32);
	}

	#[test]
	fn test_overrides_reject_garbage_and_zero() {
		let err = BrokerConfig::default()
			.with_overrides(|k| (k == ENV_MAX_BACKLOG).then(|| "lots".to_string()))
			.unwrap_err();
		assert!(err.to_string().contains(ENV_MAX_BACKLOG));

		let err = BrokerConfig::default()
			.with_overrides(|k| (k == ENV_ID_LIMIT).then(|| "0".to_string()))
			.unwrap_err();
		assert!(matches!(err, Error::InvalidArgument(_)));
	}
}
