//! Multi-file configuration loading.
//!
//! A file may pull in others with `include = "x.toml"` or `include = [..]`,
//! resolved against the including file's directory. Sections are merged by
//! what they hold: `[broker]` and `[api]` belong to one file, the remaining
//! sections merge key by key, and their named tables (clouds, storage
//! implementations, transports, peers) merge entry by entry. Any key or named
//! entry set by two files is an error.

use crate::{resolve_env_vars, Config, ConfigError};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

/// How a top-level section is combined across files.
enum Merge {
	/// The whole section comes from a single file.
	Whole,
	/// Keys merge one by one; the listed keys are tables of named entries
	/// that merge entry by entry.
	PerKey { named: &'static [&'static str] },
}

const SECTIONS: &[(&str, Merge)] = &[
	("broker", Merge::Whole),
	("api", Merge::Whole),
	("processors", Merge::PerKey { named: &[] }),
	(
		"storage",
		Merge::PerKey {
			named: &["implementations"],
		},
	),
	("cloud", Merge::PerKey { named: &["clouds"] }),
	(
		"federation",
		Merge::PerKey {
			named: &["transports", "peers"],
		},
	),
];

/// Loads a configuration file together with everything it includes.
pub struct ConfigLoader {
	/// Directory the entry file is resolved against.
	base_path: PathBuf,
	sections: HashMap<&'static str, toml::Table>,
	/// File that set each section, key or named entry, by dotted path.
	owners: HashMap<String, PathBuf>,
	loaded: HashSet<PathBuf>,
	/// Files whose includes are being followed.
	stack: Vec<PathBuf>,
}

impl ConfigLoader {
	pub fn new(base_path: impl AsRef<Path>) -> Self {
		Self {
			base_path: base_path.as_ref().to_path_buf(),
			sections: HashMap::new(),
			owners: HashMap::new(),
			loaded: HashSet::new(),
			stack: Vec::new(),
		}
	}

	/// Loads `config_path` and its includes, then validates the merged result.
	pub async fn load_config(
		&mut self,
		config_path: impl AsRef<Path>,
	) -> Result<Config, ConfigError> {
		let entry = Self::resolve(&self.base_path, config_path.as_ref());
		self.load_file(entry).await?;

		let mut root = toml::Table::new();
		for (name, table) in self.sections.drain() {
			root.insert(name.to_string(), toml::Value::Table(table));
		}
		let config: Config = toml::Value::Table(root).try_into()?;
		config.validate()?;
		Ok(config)
	}

	async fn load_file(&mut self, path: PathBuf) -> Result<(), ConfigError> {
		let canonical = tokio::fs::canonicalize(&path).await.map_err(|e| {
			ConfigError::Io(std::io::Error::new(
				e.kind(),
				format!("Cannot resolve configuration file {}: {}", path.display(), e),
			))
		})?;

		if self.stack.contains(&canonical) {
			return Err(ConfigError::Validation(format!(
				"Circular include: {} includes itself",
				canonical.display()
			)));
		}
		if !self.loaded.insert(canonical.clone()) {
			return Err(ConfigError::Validation(format!(
				"{} is included more than once",
				canonical.display()
			)));
		}

		let content = tokio::fs::read_to_string(&canonical).await?;
		let mut table: toml::Table = toml::from_str(&resolve_env_vars(&content)?)?;
		let includes = Self::includes(table.remove("include"), &canonical)?;

		for (section, value) in table {
			self.merge_section(&canonical, section, value)?;
		}

		let dir = canonical
			.parent()
			.map(Path::to_path_buf)
			.unwrap_or_else(|| self.base_path.clone());
		self.stack.push(canonical);
		for include in includes {
			Box::pin(self.load_file(Self::resolve(&dir, &include))).await?;
		}
		self.stack.pop();
		Ok(())
	}

	fn includes(value: Option<toml::Value>, source: &Path) -> Result<Vec<PathBuf>, ConfigError> {
		let invalid = || {
			ConfigError::Validation(format!(
				"include in {} must be a string or an array of strings",
				source.display()
			))
		};
		match value {
			None => Ok(Vec::new()),
			Some(toml::Value::String(path)) => Ok(vec![PathBuf::from(path)]),
			Some(toml::Value::Array(items)) => items
				.into_iter()
				.map(|item| match item {
					toml::Value::String(path) => Ok(PathBuf::from(path)),
					_ => Err(invalid()),
				})
				.collect(),
			Some(_) => Err(invalid()),
		}
	}

	fn merge_section(
		&mut self,
		source: &Path,
		section: String,
		value: toml::Value,
	) -> Result<(), ConfigError> {
		let Some((name, rule)) = SECTIONS
			.iter()
			.find(|(name, _)| *name == section)
			.map(|(name, rule)| (*name, rule))
		else {
			return Err(ConfigError::Validation(format!(
				"Unknown section '{}' in {}",
				section,
				source.display()
			)));
		};
		let toml::Value::Table(incoming) = value else {
			return Err(ConfigError::Validation(format!(
				"Section '{}' in {} must be a table",
				section,
				source.display()
			)));
		};

		match rule {
			Merge::Whole => {
				self.claim(section, source)?;
				self.sections.insert(name, incoming);
			},
			Merge::PerKey { named } => {
				for (key, value) in incoming {
					if !named.iter().any(|n| *n == key) {
						self.claim(format!("{}.{}", name, key), source)?;
						self.sections.entry(name).or_default().insert(key, value);
						continue;
					}

					let toml::Value::Table(entries) = value else {
						return Err(ConfigError::Validation(format!(
							"'{}.{}' in {} must be a table",
							name,
							key,
							source.display()
						)));
					};
					for (entry_name, entry) in entries {
						self.claim(format!("{}.{}.{}", name, key, entry_name), source)?;
						let slot = self
							.sections
							.entry(name)
							.or_default()
							.entry(key.clone())
							.or_insert_with(|| toml::Value::Table(toml::Table::new()));
						if let Some(map) = slot.as_table_mut() {
							map.insert(entry_name, entry);
						}
					}
				}
			},
		}
		Ok(())
	}

	/// Records `source` as the only file allowed to set `path`.
	fn claim(&mut self, path: String, source: &Path) -> Result<(), ConfigError> {
		if let Some(existing) = self.owners.get(&path) {
			return Err(ConfigError::Validation(format!(
				"'{}' is set in both {} and {}",
				path,
				existing.display(),
				source.display()
			)));
		}
		self.owners.insert(path, source.to_path_buf());
		Ok(())
	}

	fn resolve(dir: &Path, path: &Path) -> PathBuf {
		if path.is_absolute() {
			path.to_path_buf()
		} else {
			dir.join(path)
		}
	}
}
