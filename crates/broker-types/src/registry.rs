//! Registry trait for self-registering implementations.
//!
//! Every pluggable implementation (storage backend, cloud plugin, peer
//! transport) exposes a `Registry` marker type implementing this trait, so the
//! service can map configuration names to factory functions without reflection.

/// Base trait for implementation registries.
pub trait ImplementationRegistry {
	/// Name used in configuration files to select this implementation,
	/// e.g. "memory" for `storage.implementations.memory` or "simulated"
	/// for `cloud.clouds.<name>.implementation = "simulated"`.
	const NAME: &'static str;

	/// Factory function type this implementation provides.
	///
	/// Each plugin crate defines its own, such as `StorageFactory` or
	/// `CloudPluginFactory`.
	type Factory;

	/// Returns the factory that builds the implementation from its TOML config.
	fn factory() -> Self::Factory;
}
