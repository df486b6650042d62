//! Memoized results of cacheable methods.
//!
//! Entries are keyed by service, method, canonical argument text and target
//! profile. Only successful results are stored; nothing expires on its own.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde_json::Value;
use xprofile_protocol::Profile;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
	pub service: String,
	pub method: String,
	/// Canonical JSON of the key-relevant arguments.
	pub args: String,
	pub profile: Profile,
}

impl CacheKey {
	pub fn new(service: impl Into<String>, method: impl Into<String>, args: impl Into<String>, profile: Profile) -> Self {
		Self {
			service: service.into(),
			method: method.into(),
			args: args.into(),
			profile,
		}
	}
}

/// Lookup and store are separate steps with no in-flight tracking: callers
/// that miss the same key concurrently each dispatch, and the last success
/// stored wins. A key is dispatched at most once only across calls that start
/// after an earlier one has stored its result.
#[derive(Debug, Default)]
pub struct ResultCache {
	entries: Mutex<HashMap<CacheKey, Value>>,
}

impl ResultCache {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn get(&self, key: &CacheKey) -> Option<Value> {
		self.entries.lock().get(key).cloned()
	}

	pub fn insert(&self, key: CacheKey, value: Value) {
		self.entries.lock().insert(key, value);
	}

	pub fn clear(&self) {
		self.entries.lock().clear();
	}

	/// Drops every entry of one method, across profiles and arguments.
	pub fn clear_method(&self, service: &str, method: &str) {
		self.entries.lock().retain(|key, _| key.service != service || key.method != method);
	}

	pub fn clear_profile(&self, profile: Profile) {
		self.entries.lock().retain(|key, _| key.profile != profile);
	}

	pub fn len(&self) -> usize {
		self.entries.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	fn key(method: &str, args: &str, profile: Profile) -> CacheKey {
		CacheKey::new("Notes", method, args, profile)
	}

	#[test]
	fn entries_are_distinct_per_profile_and_args() {
		let cache = ResultCache::new();
		cache.insert(key("count", "[\"inbox\"]", Profile::Work), json!(3));
		cache.insert(key("count", "[\"inbox\"]", Profile::Personal), json!(1));

		assert_eq!(cache.get(&key("count", "[\"inbox\"]", Profile::Work)), Some(json!(3)));
		assert_eq!(cache.get(&key("count", "[\"inbox\"]", Profile::Personal)), Some(json!(1)));
		assert_eq!(cache.get(&key("count", "[\"archive\"]", Profile::Work)), None);
	}

	#[test]
	fn targeted_clears() {
		let cache = ResultCache::new();
		cache.insert(key("count", "[]", Profile::Work), json!(3));
		cache.insert(key("count", "[]", Profile::Personal), json!(1));
		cache.insert(key("title", "[]", Profile::Work), json!("t"));

		cache.clear_profile(Profile::Personal);
		assert_eq!(cache.len(), 2);

		cache.clear_method("Notes", "count");
		assert_eq!(cache.len(), 1);
		assert!(cache.get(&key("title", "[]", Profile::Work)).is_some());

		cache.clear();
		assert!(cache.is_empty());
	}
}
