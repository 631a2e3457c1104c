//! Helpers shared across broker crates.

/// Shortens an id for log output: first 8 characters followed by "..".
pub fn truncate_id(id: &str) -> String {
	match id.char_indices().nth(8) {
		Some((cut, _)) => format!("{}..", &id[..cut]),
		None => id.to_string(),
	}
}

/// Generates a fresh order id.
pub fn new_order_id() -> String {
	uuid::Uuid::new_v4().to_string()
}
