//! Connector for orders served by a peer provider.
//!
//! Every call is forwarded over the federation transport, addressed by the
//! order id the peer shares with us. Until the request has been delivered
//! (`forwarded` unset) the peer knows nothing about the order, so reads and
//! deletes are answered locally.

use super::{instance_without_id, CloudConnector, ConnectorError};
use async_trait::async_trait;
use broker_federation::{PeerTransportInterface, TransportError};
use broker_types::{
	truncate_id, ComputeQuota, ImageSummary, Instance, OrderRecord, OrderSpec, OrderStatus,
	SecurityRule, SystemUser,
};
use std::sync::Arc;
use tracing::instrument;

pub struct RemoteCloudConnector {
	peer: String,
	transport: Option<Arc<dyn PeerTransportInterface>>,
}

impl RemoteCloudConnector {
	pub fn new(peer: String, transport: Option<Arc<dyn PeerTransportInterface>>) -> Self {
		Self { peer, transport }
	}

	pub fn peer(&self) -> &str {
		&self.peer
	}

	fn transport(&self) -> Result<&Arc<dyn PeerTransportInterface>, ConnectorError> {
		self.transport.as_ref().ok_or_else(|| {
			ConnectorError::Consistency(format!(
				"No federation transport configured to reach {}",
				self.peer
			))
		})
	}

	fn require_forwarded(spec: &OrderSpec, status: &OrderStatus) -> Result<(), ConnectorError> {
		if status.forwarded {
			Ok(())
		} else {
			Err(ConnectorError::Failed(format!(
				"order {} has not been delivered to its provider",
				truncate_id(&spec.id)
			)))
		}
	}
}

#[async_trait]
impl CloudConnector for RemoteCloudConnector {
	#[instrument(skip_all, fields(order_id = %truncate_id(&spec.id), peer = %self.peer))]
	async fn request_instance(&self, spec: &OrderSpec) -> Result<Option<String>, ConnectorError> {
		self.transport()?.create_order(&self.peer, spec).await?;
		tracing::debug!("Order forwarded");
		Ok(None)
	}

	async fn get_instance(
		&self,
		spec: &OrderSpec,
		status: &OrderStatus,
	) -> Result<Instance, ConnectorError> {
		if !status.forwarded {
			return instance_without_id(status.state);
		}
		Ok(self.transport()?.get_instance(&self.peer, &spec.id).await?)
	}

	async fn delete_instance(
		&self,
		spec: &OrderSpec,
		status: &OrderStatus,
	) -> Result<(), ConnectorError> {
		if !status.forwarded {
			return Ok(());
		}
		match self.transport()?.delete_order(&self.peer, &spec.id).await {
			Ok(()) | Err(TransportError::NotFound(_)) => Ok(()),
			Err(e) => Err(e.into()),
		}
	}

	async fn stop_instance(
		&self,
		spec: &OrderSpec,
		status: &OrderStatus,
	) -> Result<(), ConnectorError> {
		Self::require_forwarded(spec, status)?;
		Ok(self.transport()?.stop_order(&self.peer, &spec.id).await?)
	}

	async fn get_remote_order(&self, spec: &OrderSpec) -> Result<OrderRecord, ConnectorError> {
		Ok(self.transport()?.get_order(&self.peer, &spec.id).await?)
	}

	async fn get_user_quota(
		&self,
		cloud_name: &str,
		user: &SystemUser,
	) -> Result<ComputeQuota, ConnectorError> {
		Ok(self
			.transport()?
			.get_user_quota(&self.peer, cloud_name, user)
			.await?)
	}

	async fn get_all_images(
		&self,
		cloud_name: &str,
		user: &SystemUser,
	) -> Result<Vec<ImageSummary>, ConnectorError> {
		Ok(self
			.transport()?
			.get_all_images(&self.peer, cloud_name, user)
			.await?)
	}

	async fn get_image(
		&self,
		cloud_name: &str,
		image_id: &str,
		user: &SystemUser,
	) -> Result<ImageSummary, ConnectorError> {
		Ok(self
			.transport()?
			.get_image(&self.peer, cloud_name, image_id, user)
			.await?)
	}

	async fn get_all_security_rules(
		&self,
		spec: &OrderSpec,
		status: &OrderStatus,
		user: &SystemUser,
	) -> Result<Vec<SecurityRule>, ConnectorError> {
		Self::require_forwarded(spec, status)?;
		Ok(self
			.transport()?
			.get_security_rules(&self.peer, &spec.id, user)
			.await?)
	}

	async fn request_security_rule(
		&self,
		spec: &OrderSpec,
		status: &OrderStatus,
		rule: &SecurityRule,
		user: &SystemUser,
	) -> Result<String, ConnectorError> {
		Self::require_forwarded(spec, status)?;
		Ok(self
			.transport()?
			.request_security_rule(&self.peer, &spec.id, rule, user)
			.await?)
	}

	async fn delete_security_rule(
		&self,
		spec: &OrderSpec,
		status: &OrderStatus,
		rule_id: &str,
		user: &SystemUser,
	) -> Result<(), ConnectorError> {
		Self::require_forwarded(spec, status)?;
		Ok(self
			.transport()?
			.delete_security_rule(&self.peer, &spec.id, rule_id, user)
			.await?)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::test_support::{volume_spec, RecordingHandler};
	use broker_federation::implementations::loopback::LoopbackTransport;
	use broker_types::{InstanceState, OrderState};

	fn forwarded(state: OrderState) -> OrderStatus {
		OrderStatus {
			state,
			forwarded: true,
			..Default::default()
		}
	}

	fn setup() -> (RemoteCloudConnector, Arc<LoopbackTransport>, Arc<RecordingHandler>) {
		let transport = Arc::new(LoopbackTransport::new());
		let handler = Arc::new(RecordingHandler::default());
		transport.register("provider-b", handler.clone());
		let connector = RemoteCloudConnector::new("provider-b".into(), Some(transport.clone()));
		(connector, transport, handler)
	}

	#[tokio::test]
	async fn test_request_is_forwarded_without_instance_id() {
		let (connector, _, handler) = setup();
		let spec = volume_spec("provider-b");
		assert_eq!(connector.request_instance(&spec).await.unwrap(), None);
		assert_eq!(handler.received(), vec![spec.id.clone()]);
	}

	#[tokio::test]
	async fn test_undelivered_orders_are_answered_locally() {
		let (connector, transport, handler) = setup();
		transport.set_reachable("provider-b", false);
		let spec = volume_spec("provider-b");
		let status = OrderStatus::default();

		let instance = connector.get_instance(&spec, &status).await.unwrap();
		assert_eq!(instance.state, InstanceState::Dispatched);
		connector.delete_instance(&spec, &status).await.unwrap();
		assert!(handler.deleted().is_empty());
		assert!(matches!(
			connector.stop_instance(&spec, &status).await,
			Err(ConnectorError::Failed(_))
		));
	}

	#[tokio::test]
	async fn test_partition_surfaces_as_unavailable() {
		let (connector, transport, _) = setup();
		transport.set_reachable("provider-b", false);
		let spec = volume_spec("provider-b");
		let err = connector
			.get_instance(&spec, &forwarded(OrderState::Fulfilled))
			.await
			.unwrap_err();
		assert!(err.is_unavailable());
	}

	#[tokio::test]
	async fn test_delete_of_unknown_remote_order_succeeds() {
		let (connector, _, handler) = setup();
		let spec = volume_spec("provider-b");
		connector
			.delete_instance(&spec, &forwarded(OrderState::AssignedForDeletion))
			.await
			.unwrap();
		assert_eq!(handler.deleted(), vec![spec.id.clone()]);
	}

	#[tokio::test]
	async fn test_missing_transport_is_a_consistency_error() {
		let connector = RemoteCloudConnector::new("provider-b".into(), None);
		assert!(matches!(
			connector.request_instance(&volume_spec("provider-b")).await,
			Err(ConnectorError::Consistency(_))
		));
	}
}
