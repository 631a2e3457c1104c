//! File-backed storage implementation.
//!
//! Each key `<namespace>:<id>` is stored as `<storage_path>/<namespace>/<id>.bin`,
//! with both segments percent-encoded so distinct keys never share a file.
//! Files start with a fixed header carrying an optional expiry so namespaces
//! such as the audit trail can be given a retention period.

use crate::{StorageError, StorageInterface};
use async_trait::async_trait;
use broker_types::{ConfigSchema, Field, FieldType, Schema, StorageKey, ValidationError};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::fs;

/// Namespace used for keys without a `namespace:` prefix.
const DEFAULT_NAMESPACE: &str = "default";

fn now_secs() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_secs())
		.unwrap_or(0)
}

/// Fixed-size file header.
///
/// Layout (32 bytes):
/// - [0-3]: magic "BRKS"
/// - [4-5]: version (u16, little-endian)
/// - [6-13]: expiry (u64, little-endian, Unix seconds, 0 = never)
/// - [14-31]: reserved
#[derive(Debug, Clone, PartialEq)]
struct FileHeader {
	version: u16,
	expires_at: u64,
}

impl FileHeader {
	const MAGIC: &'static [u8; 4] = b"BRKS";
	const VERSION: u16 = 1;
	const SIZE: usize = 32;

	fn new(ttl: Duration) -> Self {
		let expires_at = if ttl.is_zero() {
			0
		} else {
			now_secs().saturating_add(ttl.as_secs())
		};
		Self {
			version: Self::VERSION,
			expires_at,
		}
	}

	fn serialize(&self) -> [u8; Self::SIZE] {
		let mut bytes = [0u8; Self::SIZE];
		bytes[0..4].copy_from_slice(Self::MAGIC);
		bytes[4..6].copy_from_slice(&self.version.to_le_bytes());
		bytes[6..14].copy_from_slice(&self.expires_at.to_le_bytes());
		bytes
	}

	fn deserialize(bytes: &[u8]) -> Result<Self, StorageError> {
		if bytes.len() < Self::SIZE {
			return Err(StorageError::Backend("File too small for header".into()));
		}
		if &bytes[0..4] != Self::MAGIC {
			return Err(StorageError::Backend("Missing file header".into()));
		}

		let version = u16::from_le_bytes([bytes[4], bytes[5]]);
		if version > Self::VERSION {
			return Err(StorageError::Backend(format!(
				"Unsupported file version: {}",
				version
			)));
		}

		let mut expires_bytes = [0u8; 8];
		expires_bytes.copy_from_slice(&bytes[6..14]);
		Ok(Self {
			version,
			expires_at: u64::from_le_bytes(expires_bytes),
		})
	}

	fn is_expired(&self) -> bool {
		self.expires_at != 0 && now_secs() >= self.expires_at
	}
}

/// Default retention per namespace, configured with `ttl_<namespace>` seconds.
#[derive(Debug, Clone, Default)]
pub struct TtlConfig {
	ttls: HashMap<StorageKey, Duration>,
}

impl TtlConfig {
	fn from_config(config: &toml::Value) -> Self {
		let mut ttls = HashMap::new();
		for storage_key in StorageKey::all() {
			let config_key = format!("ttl_{}", storage_key.as_str());
			if let Some(seconds) = config.get(&config_key).and_then(|v| v.as_integer()) {
				ttls.insert(storage_key, Duration::from_secs(seconds.max(0) as u64));
			}
		}
		Self { ttls }
	}

	fn get_ttl(&self, namespace: &str) -> Duration {
		namespace
			.parse::<StorageKey>()
			.ok()
			.and_then(|key| self.ttls.get(&key).copied())
			.unwrap_or(Duration::ZERO)
	}
}

/// File-based storage implementation.
pub struct FileStorage {
	base_path: PathBuf,
	ttl_config: TtlConfig,
}

impl FileStorage {
	pub fn new(base_path: PathBuf, ttl_config: TtlConfig) -> Self {
		Self {
			base_path,
			ttl_config,
		}
	}

	fn split_key(key: &str) -> (&str, &str) {
		key.split_once(':').unwrap_or((DEFAULT_NAMESPACE, key))
	}

	/// Percent-encodes every byte outside `[A-Za-z0-9_-]`.
	fn encode_segment(segment: &str) -> String {
		let mut encoded = String::with_capacity(segment.len());
		for byte in segment.bytes() {
			if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
				encoded.push(byte as char);
			} else {
				encoded.push_str(&format!("%{:02X}", byte));
			}
		}
		encoded
	}

	/// Inverse of [`Self::encode_segment`]. Returns `None` for names this
	/// backend did not write.
	fn decode_segment(encoded: &str) -> Option<String> {
		let bytes = encoded.as_bytes();
		let mut decoded = Vec::with_capacity(bytes.len());
		let mut i = 0;
		while i < bytes.len() {
			if bytes[i] == b'%' {
				let hex = encoded.get(i + 1..i + 3)?;
				decoded.push(u8::from_str_radix(hex, 16).ok()?);
				i += 3;
			} else {
				decoded.push(bytes[i]);
				i += 1;
			}
		}
		String::from_utf8(decoded).ok()
	}

	fn get_file_path(&self, key: &str) -> PathBuf {
		let (namespace, id) = Self::split_key(key);
		self.base_path
			.join(Self::encode_segment(namespace))
			.join(format!("{}.bin", Self::encode_segment(id)))
	}

	/// Reads a file and strips its header, treating expired files as absent.
	async fn read_live(path: &Path) -> Result<Vec<u8>, StorageError> {
		let data = match fs::read(path).await {
			Ok(data) => data,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
				return Err(StorageError::NotFound)
			},
			Err(e) => return Err(StorageError::Backend(e.to_string())),
		};

		let header = FileHeader::deserialize(&data)?;
		if header.is_expired() {
			return Err(StorageError::NotFound);
		}
		Ok(data[FileHeader::SIZE..].to_vec())
	}

	/// Returns the `.bin` files of one namespace directory.
	async fn namespace_files(dir: &Path) -> Result<Vec<PathBuf>, StorageError> {
		let mut files = Vec::new();
		let mut entries = match fs::read_dir(dir).await {
			Ok(entries) => entries,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
			Err(e) => return Err(StorageError::Backend(e.to_string())),
		};

		while let Some(entry) = entries
			.next_entry()
			.await
			.map_err(|e| StorageError::Backend(e.to_string()))?
		{
			let path = entry.path();
			if path.extension() == Some(std::ffi::OsStr::new("bin")) {
				files.push(path);
			}
		}
		Ok(files)
	}

	async fn cleanup_expired_files(&self) -> Result<usize, StorageError> {
		let mut removed = 0;
		let mut namespaces = match fs::read_dir(&self.base_path).await {
			Ok(entries) => entries,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
			Err(e) => return Err(StorageError::Backend(e.to_string())),
		};

		while let Some(namespace) = namespaces
			.next_entry()
			.await
			.map_err(|e| StorageError::Backend(e.to_string()))?
		{
			for path in Self::namespace_files(&namespace.path()).await? {
				let Ok(data) = fs::read(&path).await else {
					tracing::debug!("Skipping unreadable file {:?}", path);
					continue;
				};
				let expired = FileHeader::deserialize(&data)
					.map(|header| header.is_expired())
					.unwrap_or(false);
				if !expired {
					continue;
				}
				match fs::remove_file(&path).await {
					Ok(()) => removed += 1,
					Err(e) => tracing::warn!("Failed to remove expired file {:?}: {}", path, e),
				}
			}
		}

		Ok(removed)
	}
}

#[async_trait]
impl StorageInterface for FileStorage {
	async fn get_bytes(&self, key: &str) -> Result<Vec<u8>, StorageError> {
		Self::read_live(&self.get_file_path(key)).await
	}

	async fn set_bytes(
		&self,
		key: &str,
		value: Vec<u8>,
		ttl: Option<Duration>,
	) -> Result<(), StorageError> {
		let path = self.get_file_path(key);
		if let Some(parent) = path.parent() {
			fs::create_dir_all(parent)
				.await
				.map_err(|e| StorageError::Backend(e.to_string()))?;
		}

		let (namespace, _) = Self::split_key(key);
		let ttl = ttl.unwrap_or_else(|| self.ttl_config.get_ttl(namespace));

		let mut file_data = Vec::with_capacity(FileHeader::SIZE + value.len());
		file_data.extend_from_slice(&FileHeader::new(ttl).serialize());
		file_data.extend_from_slice(&value);

		// Write to a temp file and rename so readers never see a partial record
		let temp_path = path.with_extension("tmp");
		fs::write(&temp_path, file_data)
			.await
			.map_err(|e| StorageError::Backend(e.to_string()))?;
		fs::rename(&temp_path, &path)
			.await
			.map_err(|e| StorageError::Backend(e.to_string()))?;

		Ok(())
	}

	async fn delete(&self, key: &str) -> Result<(), StorageError> {
		match fs::remove_file(self.get_file_path(key)).await {
			Ok(()) => Ok(()),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(StorageError::Backend(e.to_string())),
		}
	}

	async fn exists(&self, key: &str) -> Result<bool, StorageError> {
		match Self::read_live(&self.get_file_path(key)).await {
			Ok(_) => Ok(true),
			Err(StorageError::NotFound) => Ok(false),
			Err(e) => Err(e),
		}
	}

	async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
		let (namespace, id_prefix) = Self::split_key(prefix);
		let dir = self.base_path.join(Self::encode_segment(namespace));

		let mut keys = Vec::new();
		for path in Self::namespace_files(&dir).await? {
			let Some(id) = path
				.file_stem()
				.and_then(|stem| stem.to_str())
				.and_then(Self::decode_segment)
			else {
				continue;
			};
			if !id.starts_with(id_prefix) {
				continue;
			}
			match Self::read_live(&path).await {
				Ok(_) => keys.push(format!("{}:{}", namespace, id)),
				Err(StorageError::NotFound) => {},
				Err(e) => tracing::debug!("Skipping file {:?}: {}", path, e),
			}
		}
		Ok(keys)
	}

	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(FileStorageSchema)
	}

	async fn cleanup_expired(&self) -> Result<usize, StorageError> {
		self.cleanup_expired_files().await
	}
}

/// Configuration schema for FileStorage.
pub struct FileStorageSchema;

impl ConfigSchema for FileStorageSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		let mut optional_fields = vec![Field::new("storage_path", FieldType::String)];
		for storage_key in StorageKey::all() {
			optional_fields.push(Field::new(
				format!("ttl_{}", storage_key.as_str()),
				FieldType::Integer {
					min: Some(0),
					max: None,
				},
			));
		}
		Schema::new(vec![], optional_fields).validate(config)
	}
}

/// Factory function to create a file storage backend.
///
/// Configuration parameters:
/// - `storage_path`: base directory (default: "./data/storage")
/// - `ttl_orders`, `ttl_audit`: retention in seconds per namespace (default: 0, keep forever)
pub fn create_storage(config: &toml::Value) -> Result<Box<dyn StorageInterface>, StorageError> {
	FileStorageSchema
		.validate(config)
		.map_err(|e| StorageError::Configuration(e.to_string()))?;

	let storage_path = config
		.get("storage_path")
		.and_then(|v| v.as_str())
		.unwrap_or("./data/storage")
		.to_string();

	Ok(Box::new(FileStorage::new(
		PathBuf::from(storage_path),
		TtlConfig::from_config(config),
	)))
}

/// Registry for the file storage implementation.
pub struct Registry;

impl broker_types::ImplementationRegistry for Registry {
	const NAME: &'static str = "file";
	type Factory = crate::StorageFactory;

	fn factory() -> Self::Factory {
		create_storage
	}
}

impl crate::StorageRegistry for Registry {}
