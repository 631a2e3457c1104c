//! Federation endpoint: serves the orders peers forward to this broker.

use super::{ControllerError, OrderController};
use crate::connector::ConnectorError;
use crate::state::TransitionError;
use async_trait::async_trait;
use broker_federation::{FederationHandler, TransportError};
use broker_types::{
	truncate_id, ComputeQuota, ImageSummary, Instance, OrderRecord, OrderSpec, SecurityRule,
	SystemUser,
};
use std::sync::Arc;

fn to_transport(err: ControllerError) -> TransportError {
	match err {
		ControllerError::NotFound(msg) | ControllerError::Connector(ConnectorError::NotFound(msg)) => {
			TransportError::NotFound(msg)
		},
		ControllerError::Connector(ConnectorError::Unavailable(msg)) => {
			TransportError::Unreachable(msg)
		},
		other => TransportError::Rejected(other.to_string()),
	}
}

pub struct FederationEndpoint {
	controller: Arc<OrderController>,
}

impl FederationEndpoint {
	pub fn new(controller: Arc<OrderController>) -> Self {
		Self { controller }
	}
}

#[async_trait]
impl FederationHandler for FederationEndpoint {
	async fn receive_order(&self, spec: OrderSpec) -> Result<(), TransportError> {
		let local = self.controller.local_provider();
		if spec.provider != local {
			return Err(TransportError::Rejected(format!(
				"order {} is for provider {}, this is {}",
				truncate_id(&spec.id),
				spec.provider,
				local
			)));
		}
		let order_id = spec.id.clone();
		let requester = spec.requester.clone();
		match self.controller.activate_order(spec).await {
			Ok(_) => {
				tracing::info!(order_id = %truncate_id(&order_id), requester = %requester, "Accepted forwarded order");
				Ok(())
			},
			// A retried delivery of an order we already hold.
			Err(ControllerError::Transition(TransitionError::AlreadyActive(_))) => Ok(()),
			Err(e) => Err(to_transport(e)),
		}
	}

	async fn get_order(&self, order_id: &str) -> Result<OrderRecord, TransportError> {
		self.controller.get_order(order_id).await.map_err(to_transport)
	}

	async fn get_instance(&self, order_id: &str) -> Result<Instance, TransportError> {
		self.controller
			.get_resource_instance(order_id)
			.await
			.map_err(to_transport)
	}

	async fn delete_order(&self, order_id: &str) -> Result<(), TransportError> {
		match self.controller.delete_order(order_id).await {
			Ok(()) | Err(ControllerError::AlreadyDeleting(_)) => Ok(()),
			Err(e) => Err(to_transport(e)),
		}
	}

	async fn stop_order(&self, order_id: &str) -> Result<(), TransportError> {
		self.controller.stop_order(order_id).await.map_err(to_transport)
	}

	async fn get_user_quota(
		&self,
		cloud_name: &str,
		user: &SystemUser,
	) -> Result<ComputeQuota, TransportError> {
		self.controller
			.get_user_quota(self.controller.local_provider(), cloud_name, user)
			.await
			.map_err(to_transport)
	}

	async fn get_all_images(
		&self,
		cloud_name: &str,
		user: &SystemUser,
	) -> Result<Vec<ImageSummary>, TransportError> {
		self.controller
			.get_all_images(self.controller.local_provider(), cloud_name, user)
			.await
			.map_err(to_transport)
	}

	async fn get_image(
		&self,
		cloud_name: &str,
		image_id: &str,
		user: &SystemUser,
	) -> Result<ImageSummary, TransportError> {
		self.controller
			.get_image(self.controller.local_provider(), cloud_name, image_id, user)
			.await
			.map_err(to_transport)
	}

	async fn get_security_rules(
		&self,
		order_id: &str,
		user: &SystemUser,
	) -> Result<Vec<SecurityRule>, TransportError> {
		self.controller
			.get_all_security_rules(order_id, user)
			.await
			.map_err(to_transport)
	}

	async fn request_security_rule(
		&self,
		order_id: &str,
		rule: &SecurityRule,
		user: &SystemUser,
	) -> Result<String, TransportError> {
		self.controller
			.request_security_rule(order_id, rule, user)
			.await
			.map_err(to_transport)
	}

	async fn delete_security_rule(
		&self,
		order_id: &str,
		rule_id: &str,
		user: &SystemUser,
	) -> Result<(), TransportError> {
		self.controller
			.delete_security_rule(order_id, rule_id, user)
			.await
			.map_err(to_transport)
	}
}
