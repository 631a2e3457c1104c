//! In-process transport.
//!
//! Routes calls straight to the [`FederationHandler`] registered for each peer,
//! which lets several brokers share one process. Peers can be marked
//! unreachable to reproduce network partitions.

use crate::{FederationHandler, PeerTransportInterface, TransportError};
use async_trait::async_trait;
use broker_types::{
	ComputeQuota, ConfigSchema, ImageSummary, Instance, OrderRecord, OrderSpec, Schema,
	SecurityRule, SystemUser, ValidationError,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

/// Transport that calls peer handlers directly.
#[derive(Default)]
pub struct LoopbackTransport {
	handlers: RwLock<HashMap<String, Arc<dyn FederationHandler>>>,
	partitioned: RwLock<HashSet<String>>,
}

impl LoopbackTransport {
	pub fn new() -> Self {
		Self::default()
	}

	/// Makes `handler` answer calls addressed to `peer`.
	pub fn register(&self, peer: impl Into<String>, handler: Arc<dyn FederationHandler>) {
		if let Ok(mut handlers) = self.handlers.write() {
			handlers.insert(peer.into(), handler);
		}
	}

	/// Cuts or restores the link to `peer`.
	pub fn set_reachable(&self, peer: &str, reachable: bool) {
		if let Ok(mut partitioned) = self.partitioned.write() {
			if reachable {
				partitioned.remove(peer);
			} else {
				partitioned.insert(peer.to_string());
			}
		}
	}

	fn handler(&self, peer: &str) -> Result<Arc<dyn FederationHandler>, TransportError> {
		let partitioned = self
			.partitioned
			.read()
			.map(|p| p.contains(peer))
			.unwrap_or(false);
		if partitioned {
			return Err(TransportError::Unreachable(format!("{} is partitioned", peer)));
		}
		self.handlers
			.read()
			.ok()
			.and_then(|handlers| handlers.get(peer).cloned())
			.ok_or_else(|| TransportError::Unreachable(format!("no route to {}", peer)))
	}
}

#[async_trait]
impl PeerTransportInterface for LoopbackTransport {
	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(LoopbackTransportSchema)
	}

	async fn create_order(&self, peer: &str, spec: &OrderSpec) -> Result<(), TransportError> {
		self.handler(peer)?.receive_order(spec.clone()).await
	}

	async fn get_order(&self, peer: &str, order_id: &str) -> Result<OrderRecord, TransportError> {
		self.handler(peer)?.get_order(order_id).await
	}

	async fn get_instance(&self, peer: &str, order_id: &str) -> Result<Instance, TransportError> {
		self.handler(peer)?.get_instance(order_id).await
	}

	async fn delete_order(&self, peer: &str, order_id: &str) -> Result<(), TransportError> {
		self.handler(peer)?.delete_order(order_id).await
	}

	async fn stop_order(&self, peer: &str, order_id: &str) -> Result<(), TransportError> {
		self.handler(peer)?.stop_order(order_id).await
	}

	async fn get_user_quota(
		&self,
		peer: &str,
		cloud_name: &str,
		user: &SystemUser,
	) -> Result<ComputeQuota, TransportError> {
		self.handler(peer)?.get_user_quota(cloud_name, user).await
	}

	async fn get_all_images(
		&self,
		peer: &str,
		cloud_name: &str,
		user: &SystemUser,
	) -> Result<Vec<ImageSummary>, TransportError> {
		self.handler(peer)?.get_all_images(cloud_name, user).await
	}

	async fn get_image(
		&self,
		peer: &str,
		cloud_name: &str,
		image_id: &str,
		user: &SystemUser,
	) -> Result<ImageSummary, TransportError> {
		self.handler(peer)?
			.get_image(cloud_name, image_id, user)
			.await
	}

	async fn get_security_rules(
		&self,
		peer: &str,
		order_id: &str,
		user: &SystemUser,
	) -> Result<Vec<SecurityRule>, TransportError> {
		self.handler(peer)?.get_security_rules(order_id, user).await
	}

	async fn request_security_rule(
		&self,
		peer: &str,
		order_id: &str,
		rule: &SecurityRule,
		user: &SystemUser,
	) -> Result<String, TransportError> {
		self.handler(peer)?
			.request_security_rule(order_id, rule, user)
			.await
	}

	async fn delete_security_rule(
		&self,
		peer: &str,
		order_id: &str,
		rule_id: &str,
		user: &SystemUser,
	) -> Result<(), TransportError> {
		self.handler(peer)?
			.delete_security_rule(order_id, rule_id, user)
			.await
	}
}

/// The loopback transport takes no options.
pub struct LoopbackTransportSchema;

impl ConfigSchema for LoopbackTransportSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		Schema::new(vec![], vec![]).validate(config)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicUsize, Ordering};

	#[derive(Default)]
	struct CountingHandler {
		received: AtomicUsize,
	}

	#[async_trait]
	impl FederationHandler for CountingHandler {
		async fn receive_order(&self, _spec: OrderSpec) -> Result<(), TransportError> {
			self.received.fetch_add(1, Ordering::SeqCst);
			Ok(())
		}

		async fn get_order(&self, order_id: &str) -> Result<OrderRecord, TransportError> {
			Err(TransportError::NotFound(order_id.to_string()))
		}

		async fn get_instance(&self, order_id: &str) -> Result<Instance, TransportError> {
			Err(TransportError::NotFound(order_id.to_string()))
		}

		async fn delete_order(&self, _order_id: &str) -> Result<(), TransportError> {
			Ok(())
		}

		async fn stop_order(&self, _order_id: &str) -> Result<(), TransportError> {
			Ok(())
		}

		async fn get_user_quota(
			&self,
			_cloud_name: &str,
			_user: &SystemUser,
		) -> Result<ComputeQuota, TransportError> {
			Ok(ComputeQuota::default())
		}

		async fn get_all_images(
			&self,
			_cloud_name: &str,
			_user: &SystemUser,
		) -> Result<Vec<ImageSummary>, TransportError> {
			Ok(vec![])
		}

		async fn get_image(
			&self,
			_cloud_name: &str,
			image_id: &str,
			_user: &SystemUser,
		) -> Result<ImageSummary, TransportError> {
			Err(TransportError::NotFound(image_id.to_string()))
		}

		async fn get_security_rules(
			&self,
			_order_id: &str,
			_user: &SystemUser,
		) -> Result<Vec<SecurityRule>, TransportError> {
			Ok(vec![])
		}

		async fn request_security_rule(
			&self,
			_order_id: &str,
			_rule: &SecurityRule,
			_user: &SystemUser,
		) -> Result<String, TransportError> {
			Err(TransportError::Rejected("unsupported".into()))
		}

		async fn delete_security_rule(
			&self,
			_order_id: &str,
			_rule_id: &str,
			_user: &SystemUser,
		) -> Result<(), TransportError> {
			Ok(())
		}
	}

	#[tokio::test]
	async fn test_partition_and_recovery() {
		let transport = LoopbackTransport::new();
		let handler = Arc::new(CountingHandler::default());
		transport.register("provider-b", handler.clone());

		let user = SystemUser {
			user_id: "u".into(),
			user_name: "u".into(),
			identity_provider_id: "provider-a".into(),
		};
		let spec = OrderSpec::new(
			"provider-a",
			"provider-b",
			"default",
			user.clone(),
			broker_types::ResourceSpec::Volume(broker_types::VolumeSpec {
				name: None,
				size_gb: 1,
			}),
		);
		transport.create_order("provider-b", &spec).await.unwrap();
		assert_eq!(handler.received.load(Ordering::SeqCst), 1);
		assert!(transport
			.get_user_quota("provider-b", "default", &user)
			.await
			.is_ok());

		transport.set_reachable("provider-b", false);
		assert!(matches!(
			transport.get_order("provider-b", "o-1").await,
			Err(TransportError::Unreachable(_))
		));

		transport.set_reachable("provider-b", true);
		assert!(matches!(
			transport.get_order("provider-b", "o-1").await,
			Err(TransportError::NotFound(_))
		));
	}

	#[tokio::test]
	async fn test_unregistered_peer_is_unreachable() {
		let transport = LoopbackTransport::new();
		assert!(matches!(
			transport.delete_order("provider-c", "o-1").await,
			Err(TransportError::Unreachable(_))
		));
	}
}
