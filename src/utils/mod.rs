//!
//! Small helpers shared across the sync core.

/// Wall-clock milliseconds since the Unix epoch.
pub fn current_time_millis() -> i64 {
	chrono::Utc::now().timestamp_millis()
}

/// Filesystem-safe, collision-free file stem for a stream.
pub fn storage_key(user_id: &str, scope_id: &str) -> String {
	format!("{}_{}", hex::encode(user_id), hex::encode(scope_id))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn storage_key_is_path_safe_and_unambiguous() {
		let key = storage_key("user/1", "calendar:a");
		assert!(key.chars().all(|c| c.is_ascii_hexdigit() || c == '_'));
		assert_ne!(storage_key("a_b", "c"), storage_key("a", "b_c"));
	}
}
