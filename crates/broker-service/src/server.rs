//! HTTP server for the federation endpoint.
//!
//! Peers reach this broker through the routes in
//! [`broker_federation::messages::routes`]. Every route delegates to the
//! broker's [`FederationHandler`].

use axum::{
	extract::{Path, State},
	http::StatusCode,
	response::{IntoResponse, Json, Response},
	routing::{get, post},
	Router,
};
use broker_config::ApiConfig;
use broker_federation::messages::{
	routes, CloudUserRequest, ErrorBody, SecurityRuleCreated, SecurityRuleRequest, UserRequest,
};
use broker_federation::{FederationHandler, TransportError};
use broker_types::{ComputeQuota, ImageSummary, Instance, OrderRecord, OrderSpec, SecurityRule};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Shared application state for the API server.
#[derive(Clone)]
pub struct AppState {
	pub handler: Arc<dyn FederationHandler>,
}

/// Error answered to a peer.
pub struct ApiError(TransportError);

impl From<TransportError> for ApiError {
	fn from(err: TransportError) -> Self {
		Self(err)
	}
}

impl IntoResponse for ApiError {
	fn into_response(self) -> Response {
		let status = StatusCode::from_u16(self.0.status_code())
			.unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
		let body = ErrorBody {
			error: self.0.to_string(),
		};
		(status, Json(body)).into_response()
	}
}

type ApiResult<T> = Result<T, ApiError>;

pub fn router(handler: Arc<dyn FederationHandler>) -> Router {
	Router::new()
		.route(routes::ORDERS, post(handle_receive_order))
		.route(routes::ORDER, get(handle_get_order).delete(handle_delete_order))
		.route(routes::ORDER_INSTANCE, get(handle_get_instance))
		.route(routes::ORDER_STOP, post(handle_stop_order))
		.route(routes::ORDER_RULES, post(handle_request_security_rule))
		.route(routes::ORDER_RULES_LIST, post(handle_get_security_rules))
		.route(routes::ORDER_RULE_DELETE, post(handle_delete_security_rule))
		.route(routes::QUOTA, post(handle_get_user_quota))
		.route(routes::IMAGES, post(handle_get_all_images))
		.route(routes::IMAGE, post(handle_get_image))
		.layer(
			ServiceBuilder::new()
				.layer(TraceLayer::new_for_http())
				.layer(CorsLayer::permissive()),
		)
		.with_state(AppState { handler })
}

/// Serves the federation endpoint until the process exits.
pub async fn start_server(
	api_config: ApiConfig,
	handler: Arc<dyn FederationHandler>,
) -> Result<(), Box<dyn std::error::Error>> {
	let app = router(handler).layer(tower_http::timeout::TimeoutLayer::new(
		Duration::from_secs(api_config.timeout_seconds),
	));

	let bind_address = format!("{}:{}", api_config.host, api_config.port);
	let listener = TcpListener::bind(&bind_address).await?;

	tracing::info!("Federation endpoint starting on {}", bind_address);

	axum::serve(listener, app).await?;

	Ok(())
}

async fn handle_receive_order(
	State(state): State<AppState>,
	Json(spec): Json<OrderSpec>,
) -> ApiResult<StatusCode> {
	state.handler.receive_order(spec).await?;
	Ok(StatusCode::CREATED)
}

async fn handle_get_order(
	Path(order_id): Path<String>,
	State(state): State<AppState>,
) -> ApiResult<Json<OrderRecord>> {
	Ok(Json(state.handler.get_order(&order_id).await?))
}

async fn handle_get_instance(
	Path(order_id): Path<String>,
	State(state): State<AppState>,
) -> ApiResult<Json<Instance>> {
	Ok(Json(state.handler.get_instance(&order_id).await?))
}

async fn handle_delete_order(
	Path(order_id): Path<String>,
	State(state): State<AppState>,
) -> ApiResult<StatusCode> {
	state.handler.delete_order(&order_id).await?;
	Ok(StatusCode::NO_CONTENT)
}

async fn handle_stop_order(
	Path(order_id): Path<String>,
	State(state): State<AppState>,
) -> ApiResult<StatusCode> {
	state.handler.stop_order(&order_id).await?;
	Ok(StatusCode::NO_CONTENT)
}

async fn handle_get_user_quota(
	State(state): State<AppState>,
	Json(request): Json<CloudUserRequest>,
) -> ApiResult<Json<ComputeQuota>> {
	let quota = state
		.handler
		.get_user_quota(&request.cloud_name, &request.system_user)
		.await?;
	Ok(Json(quota))
}

async fn handle_get_all_images(
	State(state): State<AppState>,
	Json(request): Json<CloudUserRequest>,
) -> ApiResult<Json<Vec<ImageSummary>>> {
	let images = state
		.handler
		.get_all_images(&request.cloud_name, &request.system_user)
		.await?;
	Ok(Json(images))
}

async fn handle_get_image(
	Path(image_id): Path<String>,
	State(state): State<AppState>,
	Json(request): Json<CloudUserRequest>,
) -> ApiResult<Json<ImageSummary>> {
	let image = state
		.handler
		.get_image(&request.cloud_name, &image_id, &request.system_user)
		.await?;
	Ok(Json(image))
}

async fn handle_get_security_rules(
	Path(order_id): Path<String>,
	State(state): State<AppState>,
	Json(request): Json<UserRequest>,
) -> ApiResult<Json<Vec<SecurityRule>>> {
	let rules = state
		.handler
		.get_security_rules(&order_id, &request.system_user)
		.await?;
	Ok(Json(rules))
}

async fn handle_request_security_rule(
	Path(order_id): Path<String>,
	State(state): State<AppState>,
	Json(request): Json<SecurityRuleRequest>,
) -> ApiResult<(StatusCode, Json<SecurityRuleCreated>)> {
	let id = state
		.handler
		.request_security_rule(&order_id, &request.rule, &request.system_user)
		.await?;
	Ok((StatusCode::CREATED, Json(SecurityRuleCreated { id })))
}

async fn handle_delete_security_rule(
	Path((order_id, rule_id)): Path<(String, String)>,
	State(state): State<AppState>,
	Json(request): Json<UserRequest>,
) -> ApiResult<StatusCode> {
	state
		.handler
		.delete_security_rule(&order_id, &rule_id, &request.system_user)
		.await?;
	Ok(StatusCode::NO_CONTENT)
}
