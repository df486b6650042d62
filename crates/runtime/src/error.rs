//! Error taxonomy for cross-profile calls.
//!
//! Configuration and connectivity failures ([`Error::NoPrimaryProfileConfigured`],
//! [`Error::ProfileUnavailable`], [`Error::ConnectionUnavailable`]) always reach the
//! caller. Only [`Error::RemoteInvocation`] is subject to the service's
//! [`UncaughtExceptionPolicy`](crate::UncaughtExceptionPolicy).
//!
//! `Error` is `Clone` so a single bind attempt can report the same failure to
//! every task waiting on it.

use xprofile_protocol::Profile;

use crate::exception::ProfileRuntimeException;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
	/// `primary`/`secondary`/`suppliers` used without a configured primary profile.
	#[error("connector '{connector}' has no primary profile configured")]
	NoPrimaryProfileConfigured { connector: String },

	/// The target profile does not exist, is turned off, or cannot be bound.
	#[error("profile {0} is not available")]
	ProfileUnavailable(Profile),

	/// A bound connection was severed before the call reached its terminal outcome.
	#[error("connection to profile {profile} unavailable: {reason}")]
	ConnectionUnavailable { profile: Profile, reason: String },

	/// The target method raised a failure.
	#[error(transparent)]
	RemoteInvocation(#[from] ProfileRuntimeException),

	#[error("invalid descriptor: {0}")]
	InvalidDescriptor(String),

	#[error("service '{service}' has no method '{method}'")]
	UnknownMethod { service: String, method: String },

	#[error("invalid arguments for '{method}': {reason}")]
	InvalidArguments { method: String, reason: String },

	#[error("no implementation of service '{service}' is registered in profile {profile}")]
	ServiceNotRegistered { service: String, profile: Profile },

	#[error("serialization error: {0}")]
	Serialization(String),

	#[error("protocol error: {0}")]
	Protocol(String),

	#[error("io error: {0}")]
	Io(String),
}

impl Error {
	pub(crate) fn connection_unavailable(profile: Profile, reason: impl Into<String>) -> Self {
		Error::ConnectionUnavailable {
			profile,
			reason: reason.into(),
		}
	}

	/// Returns `true` for failures caused by reachability rather than by the call itself.
	pub fn is_unavailable(&self) -> bool {
		matches!(self, Error::ProfileUnavailable(_) | Error::ConnectionUnavailable { .. })
	}

	pub fn is_remote_invocation(&self) -> bool {
		matches!(self, Error::RemoteInvocation(_))
	}

	pub fn is_no_primary_profile(&self) -> bool {
		matches!(self, Error::NoPrimaryProfileConfigured { .. })
	}

	/// The wrapped target-side failure, when this is a remote invocation error.
	pub fn as_remote(&self) -> Option<&ProfileRuntimeException> {
		match self {
			Error::RemoteInvocation(exception) => Some(exception),
			_ => None,
		}
	}
}

impl From<serde_json::Error> for Error {
	fn from(err: serde_json::Error) -> Self {
		Error::Serialization(err.to_string())
	}
}

impl From<std::io::Error> for Error {
	fn from(err: std::io::Error) -> Self {
		Error::Io(err.to_string())
	}
}
