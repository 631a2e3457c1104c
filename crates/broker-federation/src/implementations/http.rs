//! HTTP transport to peer brokers.
//!
//! Calls the federation endpoint of each peer at the URL configured for it in
//! `[federation.peers]`. Connection failures and timeouts are reported as
//! `Unreachable` so the caller keeps its cached view and retries later.

use crate::messages::{
	routes, CloudUserRequest, ErrorBody, SecurityRuleCreated, SecurityRuleRequest, UserRequest,
};
use crate::{PeerTransportInterface, TransportError};
use async_trait::async_trait;
use broker_types::{
	ComputeQuota, ConfigSchema, Field, FieldType, ImageSummary, Instance, OrderRecord, OrderSpec,
	PeersConfig, Schema, SecurityRule, SystemUser, ValidationError,
};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use std::time::Duration;

const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// reqwest-based peer transport.
pub struct HttpTransport {
	client: Client,
	peers: PeersConfig,
}

impl HttpTransport {
	pub fn new(peers: PeersConfig, timeout: Duration) -> Result<Self, TransportError> {
		let client = Client::builder()
			.timeout(timeout)
			.connect_timeout(timeout.min(Duration::from_secs(2)))
			.build()
			.map_err(|e| TransportError::Configuration(format!("HTTP client: {}", e)))?;
		Ok(Self { client, peers })
	}

	fn url(&self, peer: &str, route: &str, segments: &[&str]) -> Result<String, TransportError> {
		let base = self
			.peers
			.get(peer)
			.map(|p| p.url.trim_end_matches('/'))
			.ok_or_else(|| TransportError::Configuration(format!("Unknown peer '{}'", peer)))?;
		Ok(format!("{}{}", base, routes::fill(route, segments)))
	}

	async fn execute(&self, request: RequestBuilder) -> Result<reqwest::Response, TransportError> {
		let response = request.send().await.map_err(|e| {
			if e.is_connect() || e.is_timeout() {
				TransportError::Unreachable(e.to_string())
			} else if e.is_decode() {
				TransportError::Protocol(e.to_string())
			} else {
				TransportError::Unreachable(e.to_string())
			}
		})?;

		let status = response.status();
		if status.is_success() {
			return Ok(response);
		}
		let body = response.text().await.unwrap_or_default();
		let message = serde_json::from_str::<ErrorBody>(&body)
			.map(|b| b.error)
			.unwrap_or(body);
		Err(TransportError::from_status(status.as_u16(), message))
	}

	async fn fetch<R: DeserializeOwned>(&self, request: RequestBuilder) -> Result<R, TransportError> {
		self.execute(request)
			.await?
			.json::<R>()
			.await
			.map_err(|e| TransportError::Protocol(e.to_string()))
	}
}

#[async_trait]
impl PeerTransportInterface for HttpTransport {
	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(HttpTransportSchema)
	}

	async fn create_order(&self, peer: &str, spec: &OrderSpec) -> Result<(), TransportError> {
		let url = self.url(peer, routes::ORDERS, &[])?;
		self.execute(self.client.post(url).json(spec)).await?;
		Ok(())
	}

	async fn get_order(&self, peer: &str, order_id: &str) -> Result<OrderRecord, TransportError> {
		let url = self.url(peer, routes::ORDER, &[order_id])?;
		self.fetch(self.client.get(url)).await
	}

	async fn get_instance(&self, peer: &str, order_id: &str) -> Result<Instance, TransportError> {
		let url = self.url(peer, routes::ORDER_INSTANCE, &[order_id])?;
		self.fetch(self.client.get(url)).await
	}

	async fn delete_order(&self, peer: &str, order_id: &str) -> Result<(), TransportError> {
		let url = self.url(peer, routes::ORDER, &[order_id])?;
		self.execute(self.client.delete(url)).await?;
		Ok(())
	}

	async fn stop_order(&self, peer: &str, order_id: &str) -> Result<(), TransportError> {
		let url = self.url(peer, routes::ORDER_STOP, &[order_id])?;
		self.execute(self.client.post(url)).await?;
		Ok(())
	}

	async fn get_user_quota(
		&self,
		peer: &str,
		cloud_name: &str,
		user: &SystemUser,
	) -> Result<ComputeQuota, TransportError> {
		let url = self.url(peer, routes::QUOTA, &[])?;
		let body = CloudUserRequest {
			cloud_name: cloud_name.to_string(),
			system_user: user.clone(),
		};
		self.fetch(self.client.post(url).json(&body)).await
	}

	async fn get_all_images(
		&self,
		peer: &str,
		cloud_name: &str,
		user: &SystemUser,
	) -> Result<Vec<ImageSummary>, TransportError> {
		let url = self.url(peer, routes::IMAGES, &[])?;
		let body = CloudUserRequest {
			cloud_name: cloud_name.to_string(),
			system_user: user.clone(),
		};
		self.fetch(self.client.post(url).json(&body)).await
	}

	async fn get_image(
		&self,
		peer: &str,
		cloud_name: &str,
		image_id: &str,
		user: &SystemUser,
	) -> Result<ImageSummary, TransportError> {
		let url = self.url(peer, routes::IMAGE, &[image_id])?;
		let body = CloudUserRequest {
			cloud_name: cloud_name.to_string(),
			system_user: user.clone(),
		};
		self.fetch(self.client.post(url).json(&body)).await
	}

	async fn get_security_rules(
		&self,
		peer: &str,
		order_id: &str,
		user: &SystemUser,
	) -> Result<Vec<SecurityRule>, TransportError> {
		let url = self.url(peer, routes::ORDER_RULES_LIST, &[order_id])?;
		let body = UserRequest {
			system_user: user.clone(),
		};
		self.fetch(self.client.post(url).json(&body)).await
	}

	async fn request_security_rule(
		&self,
		peer: &str,
		order_id: &str,
		rule: &SecurityRule,
		user: &SystemUser,
	) -> Result<String, TransportError> {
		let url = self.url(peer, routes::ORDER_RULES, &[order_id])?;
		let body = SecurityRuleRequest {
			rule: rule.clone(),
			system_user: user.clone(),
		};
		let created: SecurityRuleCreated = self.fetch(self.client.post(url).json(&body)).await?;
		Ok(created.id)
	}

	async fn delete_security_rule(
		&self,
		peer: &str,
		order_id: &str,
		rule_id: &str,
		user: &SystemUser,
	) -> Result<(), TransportError> {
		let url = self.url(peer, routes::ORDER_RULE_DELETE, &[order_id, rule_id])?;
		let body = UserRequest {
			system_user: user.clone(),
		};
		self.execute(self.client.post(url).json(&body)).await?;
		Ok(())
	}
}

/// Configuration schema for the HTTP transport.
pub struct HttpTransportSchema;

impl ConfigSchema for HttpTransportSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		let schema = Schema::new(
			vec![],
			vec![Field::new(
				"timeout_ms",
				FieldType::Integer {
					min: Some(1),
					max: Some(300_000),
				},
			)],
		);
		schema.validate(config)
	}
}

/// Factory function to create an HTTP transport.
pub fn create_transport(
	config: &toml::Value,
	peers: &PeersConfig,
) -> Result<Box<dyn PeerTransportInterface>, TransportError> {
	HttpTransportSchema
		.validate(config)
		.map_err(|e| TransportError::Configuration(e.to_string()))?;

	let timeout_ms = config
		.get("timeout_ms")
		.and_then(|v| v.as_integer())
		.and_then(|v| u64::try_from(v).ok())
		.unwrap_or(DEFAULT_TIMEOUT_MS);

	Ok(Box::new(HttpTransport::new(
		peers.clone(),
		Duration::from_millis(timeout_ms),
	)?))
}

/// Registry for the HTTP transport implementation.
pub struct Registry;

impl broker_types::ImplementationRegistry for Registry {
	const NAME: &'static str = "http";
	type Factory = crate::TransportFactory;

	fn factory() -> Self::Factory {
		create_transport
	}
}

impl crate::TransportRegistry for Registry {}

#[cfg(test)]
mod tests {
	use super::*;
	use broker_types::PeerConfig;

	fn peers(url: &str) -> PeersConfig {
		let mut peers = PeersConfig::new();
		peers.insert(
			"provider-b".to_string(),
			PeerConfig {
				url: url.to_string(),
			},
		);
		peers
	}

	#[tokio::test]
	async fn test_closed_port_is_unreachable() {
		let transport =
			HttpTransport::new(peers("http://127.0.0.1:1"), Duration::from_millis(500)).unwrap();
		let result = transport.get_order("provider-b", "o-1").await;
		assert!(matches!(result, Err(TransportError::Unreachable(_))));
	}

	#[tokio::test]
	async fn test_unknown_peer_is_a_configuration_error() {
		let transport =
			HttpTransport::new(peers("http://127.0.0.1:1"), Duration::from_millis(500)).unwrap();
		let result = transport.delete_order("provider-z", "o-1").await;
		assert!(matches!(result, Err(TransportError::Configuration(_))));
	}

	#[test]
	fn test_url_building_trims_trailing_slash() {
		let transport =
			HttpTransport::new(peers("http://peer-b:8085/"), Duration::from_millis(500)).unwrap();
		assert_eq!(
			transport
				.url("provider-b", routes::ORDER_STOP, &["o-1"])
				.unwrap(),
			"http://peer-b:8085/federation/orders/o-1/stop"
		);
		assert_eq!(
			transport
				.url("provider-b", routes::ORDER, &["a/b?c"])
				.unwrap(),
			"http://peer-b:8085/federation/orders/a%2Fb%3Fc"
		);
	}

	#[test]
	fn test_factory_validates_timeout() {
		let ok: toml::Value = toml::from_str("timeout_ms = 1500").unwrap();
		assert!(create_transport(&ok, &PeersConfig::new()).is_ok());

		let bad: toml::Value = toml::from_str("timeout_ms = 0").unwrap();
		assert!(matches!(
			create_transport(&bad, &PeersConfig::new()),
			Err(TransportError::Configuration(_))
		));
	}
}
