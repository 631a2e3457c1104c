//! Wire format of the federation endpoint.
//!
//! Bodies are JSON. Orders, instances, quotas, images and rules travel in their
//! `broker_types` shape; the types here only wrap the extra request context.
//! Failures are answered with a non-2xx status and an [`ErrorBody`]; the status
//! classes are those of [`TransportError::status_code`](crate::TransportError::status_code).

use broker_types::{SecurityRule, SystemUser};
use serde::{Deserialize, Serialize};

/// Route templates served by a broker to its peers.
pub mod routes {
	pub const ORDERS: &str = "/federation/orders";
	pub const ORDER: &str = "/federation/orders/{order_id}";
	pub const ORDER_INSTANCE: &str = "/federation/orders/{order_id}/instance";
	pub const ORDER_STOP: &str = "/federation/orders/{order_id}/stop";
	pub const ORDER_RULES: &str = "/federation/orders/{order_id}/security-rules";
	pub const ORDER_RULES_LIST: &str = "/federation/orders/{order_id}/security-rules/list";
	pub const ORDER_RULE_DELETE: &str =
		"/federation/orders/{order_id}/security-rules/{rule_id}/delete";
	pub const QUOTA: &str = "/federation/quota";
	pub const IMAGES: &str = "/federation/images";
	pub const IMAGE: &str = "/federation/images/{image_id}";

	/// Fills a route template with concrete path segments, in order. Each
	/// segment is percent-encoded so ids cannot add path levels or a query.
	pub fn fill(template: &str, segments: &[&str]) -> String {
		let mut out = String::with_capacity(template.len());
		let mut rest = template;
		let mut values = segments.iter();
		while let Some(start) = rest.find('{') {
			out.push_str(&rest[..start]);
			let Some(end) = rest[start..].find('}') else {
				break;
			};
			if let Some(value) = values.next() {
				encode_segment(value, &mut out);
			}
			rest = &rest[start + end + 1..];
		}
		out.push_str(rest);
		out
	}

	/// Appends `value` keeping only RFC 3986 unreserved characters as is.
	fn encode_segment(value: &str, out: &mut String) {
		for byte in value.bytes() {
			if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~') {
				out.push(byte as char);
			} else {
				out.push_str(&format!("%{:02X}", byte));
			}
		}
	}
}

/// Request scoped to a user in one of the peer's clouds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudUserRequest {
	pub cloud_name: String,
	pub system_user: SystemUser,
}

/// Request scoped to a user only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRequest {
	pub system_user: SystemUser,
}

/// Creation of a security rule on a peer's order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityRuleRequest {
	pub rule: SecurityRule,
	pub system_user: SystemUser,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityRuleCreated {
	pub id: String,
}

/// Body of every non-2xx answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
	pub error: String,
}

#[cfg(test)]
mod tests {
	use super::routes;

	#[test]
	fn test_fill_routes() {
		assert_eq!(
			routes::fill(routes::ORDER_RULE_DELETE, &["o-1", "r-9"]),
			"/federation/orders/o-1/security-rules/r-9/delete"
		);
		assert_eq!(routes::fill(routes::ORDERS, &[]), "/federation/orders");
	}

	#[test]
	fn test_fill_encodes_reserved_characters() {
		assert_eq!(
			routes::fill(routes::ORDER_STOP, &["../a/b?x=1#f"]),
			"/federation/orders/..%2Fa%2Fb%3Fx%3D1%23f/stop"
		);
		assert_eq!(
			routes::fill(routes::IMAGE, &["ubuntu 24.04%"]),
			"/federation/images/ubuntu%2024.04%25"
		);
	}
}
