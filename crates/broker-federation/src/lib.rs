//! Federation module for the resource broker.
//!
//! Orders whose provider is another member of the federation are forwarded to
//! that provider's broker and tracked from here by polling it. This crate holds
//! both sides of that conversation: the client-side [`PeerTransportInterface`]
//! used to reach a peer, and the server-side [`FederationHandler`] a broker
//! exposes so peers can reach it.

use async_trait::async_trait;
use broker_types::{
	ComputeQuota, ConfigSchema, ImageSummary, ImplementationRegistry, Instance, OrderRecord,
	OrderSpec, PeersConfig, SecurityRule, SystemUser,
};
use thiserror::Error;

/// Re-export implementations
pub mod implementations {
	pub mod http;
	pub mod loopback;
}

pub mod messages;

/// Errors that can occur while talking to a peer.
///
/// `Unreachable` is transient: the peer could not answer and the call may be
/// retried. `Rejected` and `NotFound` are answers from the peer.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
	#[error("Peer unreachable: {0}")]
	Unreachable(String),
	#[error("Rejected by peer: {0}")]
	Rejected(String),
	#[error("Not found at peer: {0}")]
	NotFound(String),
	#[error("Protocol error: {0}")]
	Protocol(String),
	#[error("Configuration error: {0}")]
	Configuration(String),
}

impl TransportError {
	/// HTTP status a federation endpoint answers with for this error.
	pub fn status_code(&self) -> u16 {
		match self {
			TransportError::NotFound(_) => 404,
			TransportError::Rejected(_) => 422,
			TransportError::Protocol(_) => 400,
			TransportError::Unreachable(_) => 503,
			TransportError::Configuration(_) => 500,
		}
	}

	/// Rebuilds the error a peer reported through an HTTP status.
	pub fn from_status(status: u16, message: String) -> Self {
		match status {
			404 => TransportError::NotFound(message),
			400 => TransportError::Protocol(message),
			502..=504 => TransportError::Unreachable(message),
			_ => TransportError::Rejected(message),
		}
	}
}

/// Client side of the federation: operations forwarded to a peer provider.
///
/// `peer` is the provider id of the broker to reach.
#[async_trait]
pub trait PeerTransportInterface: Send + Sync {
	/// Returns the configuration schema for this transport.
	fn config_schema(&self) -> Box<dyn ConfigSchema>;

	/// Delivers an order to the provider that will serve it.
	async fn create_order(&self, peer: &str, spec: &OrderSpec) -> Result<(), TransportError>;

	/// Fetches the peer's current copy of an order.
	async fn get_order(&self, peer: &str, order_id: &str) -> Result<OrderRecord, TransportError>;

	/// Fetches the instance behind an order served by the peer.
	async fn get_instance(&self, peer: &str, order_id: &str) -> Result<Instance, TransportError>;

	/// Asks the peer to tear an order down.
	async fn delete_order(&self, peer: &str, order_id: &str) -> Result<(), TransportError>;

	/// Asks the peer to stop the compute instance behind an order.
	async fn stop_order(&self, peer: &str, order_id: &str) -> Result<(), TransportError>;

	async fn get_user_quota(
		&self,
		peer: &str,
		cloud_name: &str,
		user: &SystemUser,
	) -> Result<ComputeQuota, TransportError>;

	async fn get_all_images(
		&self,
		peer: &str,
		cloud_name: &str,
		user: &SystemUser,
	) -> Result<Vec<ImageSummary>, TransportError>;

	async fn get_image(
		&self,
		peer: &str,
		cloud_name: &str,
		image_id: &str,
		user: &SystemUser,
	) -> Result<ImageSummary, TransportError>;

	async fn get_security_rules(
		&self,
		peer: &str,
		order_id: &str,
		user: &SystemUser,
	) -> Result<Vec<SecurityRule>, TransportError>;

	async fn request_security_rule(
		&self,
		peer: &str,
		order_id: &str,
		rule: &SecurityRule,
		user: &SystemUser,
	) -> Result<String, TransportError>;

	async fn delete_security_rule(
		&self,
		peer: &str,
		order_id: &str,
		rule_id: &str,
		user: &SystemUser,
	) -> Result<(), TransportError>;
}

/// Server side of the federation: what a broker does when a peer calls it.
#[async_trait]
pub trait FederationHandler: Send + Sync {
	/// Accepts an order forwarded by its requesting provider.
	async fn receive_order(&self, spec: OrderSpec) -> Result<(), TransportError>;

	async fn get_order(&self, order_id: &str) -> Result<OrderRecord, TransportError>;

	async fn get_instance(&self, order_id: &str) -> Result<Instance, TransportError>;

	async fn delete_order(&self, order_id: &str) -> Result<(), TransportError>;

	async fn stop_order(&self, order_id: &str) -> Result<(), TransportError>;

	async fn get_user_quota(
		&self,
		cloud_name: &str,
		user: &SystemUser,
	) -> Result<ComputeQuota, TransportError>;

	async fn get_all_images(
		&self,
		cloud_name: &str,
		user: &SystemUser,
	) -> Result<Vec<ImageSummary>, TransportError>;

	async fn get_image(
		&self,
		cloud_name: &str,
		image_id: &str,
		user: &SystemUser,
	) -> Result<ImageSummary, TransportError>;

	async fn get_security_rules(
		&self,
		order_id: &str,
		user: &SystemUser,
	) -> Result<Vec<SecurityRule>, TransportError>;

	async fn request_security_rule(
		&self,
		order_id: &str,
		rule: &SecurityRule,
		user: &SystemUser,
	) -> Result<String, TransportError>;

	async fn delete_security_rule(
		&self,
		order_id: &str,
		rule_id: &str,
		user: &SystemUser,
	) -> Result<(), TransportError>;
}

/// Type alias for transport factory functions.
pub type TransportFactory =
	fn(&toml::Value, &PeersConfig) -> Result<Box<dyn PeerTransportInterface>, TransportError>;

/// Registry trait for transport implementations.
pub trait TransportRegistry: ImplementationRegistry<Factory = TransportFactory> {}

/// Get all registered transport implementations.
///
/// The loopback transport is wired in code and has no factory.
pub fn get_all_implementations() -> Vec<(&'static str, TransportFactory)> {
	use implementations::http;

	vec![(http::Registry::NAME, http::Registry::factory())]
}
