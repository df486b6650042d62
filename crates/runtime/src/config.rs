//! Connector configuration.
//!
//! Configuration files are JSON:
//! ```json
//! {
//!   "name": "work-connector",
//!   "primaryProfile": "WORK",
//!   "idleTimeoutMs": 30000,
//!   "uncaughtExceptionPolicy": "NOTIFY_SUPPRESS"
//! }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use xprofile_protocol::ProfileType;

use crate::error::{Error, Result};
use crate::exception::UncaughtExceptionPolicy;

/// Idle time after the last holder is released before a connection unbinds.
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 30_000;

fn default_idle_timeout_ms() -> u64 {
	DEFAULT_IDLE_TIMEOUT_MS
}

/// Declared configuration of one connector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorConfig {
	pub name: String,
	#[serde(default)]
	pub primary_profile: ProfileType,
	#[serde(default = "default_idle_timeout_ms")]
	pub idle_timeout_ms: u64,
	/// Policy applied by services that do not declare their own.
	#[serde(default)]
	pub uncaught_exception_policy: UncaughtExceptionPolicy,
}

impl ConnectorConfig {
	pub fn new(name: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			primary_profile: ProfileType::None,
			idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
			uncaught_exception_policy: UncaughtExceptionPolicy::default(),
		}
	}

	pub fn with_primary_profile(mut self, primary_profile: impl Into<ProfileType>) -> Self {
		self.primary_profile = primary_profile.into();
		self
	}

	pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
		self.idle_timeout_ms = u64::try_from(idle_timeout.as_millis()).unwrap_or(u64::MAX);
		self
	}

	pub fn with_uncaught_exception_policy(mut self, policy: UncaughtExceptionPolicy) -> Self {
		self.uncaught_exception_policy = policy;
		self
	}

	pub fn idle_timeout(&self) -> Duration {
		Duration::from_millis(self.idle_timeout_ms)
	}

	pub fn from_json(json: &str) -> Result<Self> {
		let config: Self = serde_json::from_str(json)?;
		if config.name.trim().is_empty() {
			return Err(Error::InvalidDescriptor("connector name must not be empty".to_string()));
		}
		Ok(config)
	}

	pub fn load(path: &Path) -> Result<Self> {
		let content = std::fs::read_to_string(path)?;
		Self::from_json(&content)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_fill_missing_fields() {
		let config = ConnectorConfig::from_json(r#"{"name": "default"}"#).unwrap();
		assert_eq!(config.primary_profile, ProfileType::None);
		assert_eq!(config.idle_timeout(), Duration::from_millis(DEFAULT_IDLE_TIMEOUT_MS));
		assert_eq!(config.uncaught_exception_policy, UncaughtExceptionPolicy::NotifyRethrow);
	}

	#[test]
	fn parses_camel_case_fields() {
		let config = ConnectorConfig::from_json(
			r#"{"name": "work", "primaryProfile": "WORK", "idleTimeoutMs": 5, "uncaughtExceptionPolicy": "NOTIFY_SUPPRESS"}"#,
		)
		.unwrap();
		assert_eq!(config.primary_profile, ProfileType::Work);
		assert_eq!(config.idle_timeout(), Duration::from_millis(5));
		assert_eq!(config.uncaught_exception_policy, UncaughtExceptionPolicy::NotifySuppress);
	}

	#[test]
	fn rejects_blank_name() {
		assert!(ConnectorConfig::from_json(r#"{"name": " "}"#).is_err());
	}
}
