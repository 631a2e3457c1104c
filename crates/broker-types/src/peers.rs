//! Federation peer addressing.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How to reach one peer provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
	/// Base URL of the peer's federation endpoint.
	pub url: String,
}

/// Peers keyed by provider id.
pub type PeersConfig = HashMap<String, PeerConfig>;
