//! Configuration module for the resource broker.
//!
//! Loads the broker configuration from TOML, resolving `${VAR}` and
//! `${VAR:-default}` environment references, and validates it before any
//! component is built.
//!
//! ## Modular Configuration Support
//!
//! Configurations can be split into multiple files:
//! - `include = ["clouds.toml", "federation/peers.toml"]` pulls in other files,
//!   resolved against the including file; included files may include more
//! - Clouds, storage implementations, transports and peers may each live in a
//!   different file, as may individual `[processors]` intervals
//! - `[broker]` and `[api]` belong to one file, and no key or named entry may
//!   be set twice

#[cfg(feature = "testing")]
pub mod builders;
mod loader;

pub use loader::ConfigLoader;

use broker_types::PeersConfig;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),
	#[error("Configuration error: {0}")]
	Parse(String),
	#[error("Validation error: {0}")]
	Validation(String),
}

impl From<toml::de::Error> for ConfigError {
	fn from(err: toml::de::Error) -> Self {
		// Keep only the message, not the echoed input
		ConfigError::Parse(err.message().to_string())
	}
}

/// Main configuration structure for the broker.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
	/// Identity of this broker within the federation.
	pub broker: BrokerConfig,
	/// Persistence of order records and the audit trail.
	pub storage: StorageConfig,
	/// Sleep intervals of the lifecycle processors.
	#[serde(default)]
	pub processors: ProcessorsConfig,
	/// Clouds served locally and their plugin implementations.
	pub cloud: CloudConfig,
	/// Transport and addresses used to reach peer providers.
	pub federation: Option<FederationConfig>,
	/// Endpoint through which peers reach this broker.
	pub api: Option<ApiConfig>,
}

/// Identity of this broker.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BrokerConfig {
	/// Provider id. Orders whose provider equals it are served locally.
	pub provider_id: String,
}

/// Configuration for the storage backend.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
	/// Which implementation to use as primary.
	pub primary: String,
	/// Map of storage implementation names to their configurations.
	pub implementations: HashMap<String, toml::Value>,
	/// Interval in seconds for cleaning up expired storage entries.
	#[serde(default = "default_cleanup_interval_seconds")]
	pub cleanup_interval_seconds: u64,
}

fn default_cleanup_interval_seconds() -> u64 {
	3600
}

/// Sleep interval, in milliseconds, between passes of each processor.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ProcessorsConfig {
	#[serde(default = "default_fast_sleep_ms")]
	pub open_sleep_ms: u64,
	#[serde(default = "default_fast_sleep_ms")]
	pub spawning_sleep_ms: u64,
	#[serde(default = "default_fulfilled_sleep_ms")]
	pub fulfilled_sleep_ms: u64,
	#[serde(default = "default_failed_sleep_ms")]
	pub failed_sleep_ms: u64,
	#[serde(default = "default_failed_sleep_ms")]
	pub unable_to_check_status_sleep_ms: u64,
	#[serde(default = "default_fast_sleep_ms")]
	pub stopping_sleep_ms: u64,
	#[serde(default = "default_fast_sleep_ms")]
	pub assigned_for_deletion_sleep_ms: u64,
	#[serde(default = "default_fast_sleep_ms")]
	pub checking_deletion_sleep_ms: u64,
	#[serde(default = "default_fast_sleep_ms")]
	pub closed_sleep_ms: u64,
	#[serde(default = "default_fulfilled_sleep_ms")]
	pub remote_sync_sleep_ms: u64,
}

fn default_fast_sleep_ms() -> u64 {
	1000
}

fn default_fulfilled_sleep_ms() -> u64 {
	5000
}

fn default_failed_sleep_ms() -> u64 {
	10_000
}

impl Default for ProcessorsConfig {
	fn default() -> Self {
		Self {
			open_sleep_ms: default_fast_sleep_ms(),
			spawning_sleep_ms: default_fast_sleep_ms(),
			fulfilled_sleep_ms: default_fulfilled_sleep_ms(),
			failed_sleep_ms: default_failed_sleep_ms(),
			unable_to_check_status_sleep_ms: default_failed_sleep_ms(),
			stopping_sleep_ms: default_fast_sleep_ms(),
			assigned_for_deletion_sleep_ms: default_fast_sleep_ms(),
			checking_deletion_sleep_ms: default_fast_sleep_ms(),
			closed_sleep_ms: default_fast_sleep_ms(),
			remote_sync_sleep_ms: default_fulfilled_sleep_ms(),
		}
	}
}

impl ProcessorsConfig {
	/// Named view over every interval, used for validation and logging.
	pub fn entries(&self) -> [(&'static str, u64); 10] {
		[
			("open_sleep_ms", self.open_sleep_ms),
			("spawning_sleep_ms", self.spawning_sleep_ms),
			("fulfilled_sleep_ms", self.fulfilled_sleep_ms),
			("failed_sleep_ms", self.failed_sleep_ms),
			(
				"unable_to_check_status_sleep_ms",
				self.unable_to_check_status_sleep_ms,
			),
			("stopping_sleep_ms", self.stopping_sleep_ms),
			(
				"assigned_for_deletion_sleep_ms",
				self.assigned_for_deletion_sleep_ms,
			),
			("checking_deletion_sleep_ms", self.checking_deletion_sleep_ms),
			("closed_sleep_ms", self.closed_sleep_ms),
			("remote_sync_sleep_ms", self.remote_sync_sleep_ms),
		]
	}
}

/// Clouds served by this broker.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CloudConfig {
	/// Cloud used when an order does not name one.
	pub default_cloud: String,
	/// Cloud name to plugin selection and settings.
	pub clouds: HashMap<String, CloudEntry>,
}

/// Plugin selection for one cloud.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CloudEntry {
	/// Registered plugin implementation name.
	pub implementation: String,
	/// Implementation-specific settings.
	#[serde(default = "empty_table")]
	pub config: toml::Value,
}

fn empty_table() -> toml::Value {
	toml::Value::Table(toml::Table::new())
}

/// Federation transport and peers.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FederationConfig {
	/// Which transport implementation to use.
	pub primary: String,
	/// Map of transport implementation names to their configurations.
	pub transports: HashMap<String, toml::Value>,
	/// Peer providers keyed by provider id.
	#[serde(default)]
	pub peers: PeersConfig,
}

/// Configuration for the federation endpoint served to peers.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConfig {
	#[serde(default)]
	pub enabled: bool,
	#[serde(default = "default_api_host")]
	pub host: String,
	#[serde(default = "default_api_port")]
	pub port: u16,
	/// Request timeout in seconds.
	#[serde(default = "default_api_timeout")]
	pub timeout_seconds: u64,
}

fn default_api_host() -> String {
	"127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
	8085
}

fn default_api_timeout() -> u64 {
	30
}

/// Resolves environment variables in a string.
///
/// Replaces ${VAR_NAME} with the value of VAR_NAME and supports defaults with
/// ${VAR_NAME:-default_value}. Inputs above 1MB are rejected.
pub(crate) fn resolve_env_vars(input: &str) -> Result<String, ConfigError> {
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

	let mut result = String::with_capacity(input.len());
	let mut last_end = 0;

	for cap in re.captures_iter(input) {
		let (Some(full_match), Some(var_name)) = (cap.get(0), cap.get(1)) else {
			continue;
		};
		let value = match std::env::var(var_name.as_str()) {
			Ok(v) => v,
			Err(_) => match cap.get(2) {
				Some(default) => default.as_str().to_string(),
				None => {
					return Err(ConfigError::Validation(format!(
						"Environment variable '{}' not found",
						var_name.as_str()
					)))
				},
			},
		};

		result.push_str(&input[last_end..full_match.start()]);
		result.push_str(&value);
		last_end = full_match.end();
	}
	result.push_str(&input[last_end..]);

	Ok(result)
}

impl Config {
	/// Loads configuration from a file, following `include` directives.
	pub async fn from_file(path: &str) -> Result<Self, ConfigError> {
		let path_buf = Path::new(path);
		let base_dir = path_buf.parent().unwrap_or_else(|| Path::new("."));

		let mut loader = loader::ConfigLoader::new(base_dir);
		let file_name = path_buf
			.file_name()
			.ok_or_else(|| ConfigError::Validation(format!("Invalid path: {}", path)))?;
		loader.load_config(file_name).await
	}

	/// Validates cross-field constraints that serde cannot express.
	fn validate(&self) -> Result<(), ConfigError> {
		let provider_id = self.broker.provider_id.trim();
		if provider_id.is_empty() {
			return Err(ConfigError::Validation(
				"Broker provider_id cannot be empty".into(),
			));
		}

		if self.storage.implementations.is_empty() {
			return Err(ConfigError::Validation(
				"At least one storage implementation must be configured".into(),
			));
		}
		if !self
			.storage
			.implementations
			.contains_key(&self.storage.primary)
		{
			return Err(ConfigError::Validation(format!(
				"Primary storage '{}' not found in implementations",
				self.storage.primary
			)));
		}
		if self.storage.cleanup_interval_seconds == 0
			|| self.storage.cleanup_interval_seconds > 86400
		{
			return Err(ConfigError::Validation(
				"Storage cleanup_interval_seconds must be between 1 and 86400".into(),
			));
		}

		for (name, sleep_ms) in self.processors.entries() {
			if sleep_ms == 0 {
				return Err(ConfigError::Validation(format!(
					"Processor interval '{}' must be greater than 0",
					name
				)));
			}
		}

		if self.cloud.clouds.is_empty() {
			return Err(ConfigError::Validation(
				"At least one cloud must be configured".into(),
			));
		}
		if !self.cloud.clouds.contains_key(&self.cloud.default_cloud) {
			return Err(ConfigError::Validation(format!(
				"Default cloud '{}' not found in clouds",
				self.cloud.default_cloud
			)));
		}
		for (name, entry) in &self.cloud.clouds {
			if entry.implementation.is_empty() {
				return Err(ConfigError::Validation(format!(
					"Cloud '{}' must name an implementation",
					name
				)));
			}
		}

		if let Some(federation) = &self.federation {
			if !federation.transports.contains_key(&federation.primary) {
				return Err(ConfigError::Validation(format!(
					"Primary transport '{}' not found in transports",
					federation.primary
				)));
			}
			for (peer_id, peer) in &federation.peers {
				if peer_id == provider_id {
					return Err(ConfigError::Validation(format!(
						"Peer '{}' has the same id as this broker",
						peer_id
					)));
				}
				if !(peer.url.starts_with("http://") || peer.url.starts_with("https://")) {
					return Err(ConfigError::Validation(format!(
						"Peer '{}' must have an http(s) url, got '{}'",
						peer_id, peer.url
					)));
				}
			}
		}

		Ok(())
	}
}

/// Parses a TOML string, resolving environment variables and validating the result.
impl FromStr for Config {
	type Err = ConfigError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let resolved = resolve_env_vars(s)?;
		let config: Config = toml::from_str(&resolved)?;
		config.validate()?;
		Ok(config)
	}
}
