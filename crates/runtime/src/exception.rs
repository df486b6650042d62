//! Capture and propagation of failures raised by target methods.
//!
//! A target method that fails produces a [`MethodFailure`]: the failure's class
//! identity (when representable) and message. It crosses the connection as an
//! [`ErrorPayload`] and is re-wrapped on the caller side in a
//! [`ProfileRuntimeException`] carrying the original as its `source()`.
//!
//! The [`ExceptionPropagator`] then applies the service's
//! [`UncaughtExceptionPolicy`]: listeners always hear about the failure, and the
//! policy decides whether the caller's return path does too.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;
use xprofile_protocol::{ErrorPayload, Profile};

use crate::error::{Error, Result};

/// What happens to a remote method failure after listeners are notified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UncaughtExceptionPolicy {
	/// Notify listeners, then return the wrapped failure to the caller.
	#[default]
	NotifyRethrow,
	/// Notify listeners only; the caller sees "no value".
	NotifySuppress,
}

/// A failure raised while executing a method body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodFailure {
	class_name: Option<String>,
	message: String,
	stack: Option<String>,
}

impl MethodFailure {
	/// Failure with an explicit class identity.
	pub fn new(class_name: impl Into<String>, message: impl Into<String>) -> Self {
		Self {
			class_name: Some(class_name.into()),
			message: message.into(),
			stack: None,
		}
	}

	/// Failure whose class identity could not be represented.
	pub fn generic(message: impl Into<String>) -> Self {
		Self {
			class_name: None,
			message: message.into(),
			stack: None,
		}
	}

	/// Captures a Rust error, using its type path as the class identity and its
	/// source chain as the stack.
	pub fn from_error<E: std::error::Error + 'static>(err: &E) -> Self {
		let mut chain = Vec::new();
		let mut source = err.source();
		while let Some(cause) = source {
			chain.push(cause.to_string());
			source = cause.source();
		}

		Self {
			class_name: Some(std::any::type_name::<E>().to_string()),
			message: err.to_string(),
			stack: (!chain.is_empty()).then(|| chain.join("\ncaused by: ")),
		}
	}

	/// Captures a panic payload in the generic wrapped form.
	pub fn panicked(payload: Box<dyn Any + Send>) -> Self {
		let message = if let Some(text) = payload.downcast_ref::<&str>() {
			(*text).to_string()
		} else if let Some(text) = payload.downcast_ref::<String>() {
			text.clone()
		} else {
			"target method panicked".to_string()
		};
		Self::generic(format!("panic: {message}"))
	}

	pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
		self.stack = Some(stack.into());
		self
	}

	pub fn class_name(&self) -> Option<&str> {
		self.class_name.as_deref()
	}

	pub fn message(&self) -> &str {
		&self.message
	}

	pub fn stack(&self) -> Option<&str> {
		self.stack.as_deref()
	}

	pub fn to_payload(&self) -> ErrorPayload {
		ErrorPayload {
			message: self.message.clone(),
			name: self.class_name.clone(),
			stack: self.stack.clone(),
		}
	}
}

impl fmt::Display for MethodFailure {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match &self.class_name {
			Some(class_name) => write!(f, "{class_name}: {}", self.message),
			None => f.write_str(&self.message),
		}
	}
}

impl std::error::Error for MethodFailure {}

impl From<ErrorPayload> for MethodFailure {
	fn from(payload: ErrorPayload) -> Self {
		Self {
			class_name: payload.name,
			message: payload.message,
			stack: payload.stack,
		}
	}
}

impl From<Error> for MethodFailure {
	fn from(err: Error) -> Self {
		MethodFailure::from_error(&err)
	}
}

/// Caller-side wrapper for every failure raised by a target method.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{service}.{method} failed in profile {profile}: {cause}")]
pub struct ProfileRuntimeException {
	profile: Profile,
	service: String,
	method: String,
	#[source]
	cause: MethodFailure,
}

impl ProfileRuntimeException {
	pub fn new(profile: Profile, service: impl Into<String>, method: impl Into<String>, cause: MethodFailure) -> Self {
		Self {
			profile,
			service: service.into(),
			method: method.into(),
			cause,
		}
	}

	/// Profile the failing method executed in.
	pub fn profile(&self) -> Profile {
		self.profile
	}

	pub fn service(&self) -> &str {
		&self.service
	}

	pub fn method(&self) -> &str {
		&self.method
	}

	/// The original failure.
	pub fn cause(&self) -> &MethodFailure {
		&self.cause
	}
}

/// Observer of remote method failures.
pub type FailureListener = Arc<dyn Fn(&ProfileRuntimeException) + Send + Sync>;

/// Applies an [`UncaughtExceptionPolicy`] to wrapped failures.
pub struct ExceptionPropagator {
	policy: UncaughtExceptionPolicy,
	listeners: RwLock<Vec<FailureListener>>,
}

impl ExceptionPropagator {
	pub fn new(policy: UncaughtExceptionPolicy) -> Self {
		Self {
			policy,
			listeners: RwLock::new(Vec::new()),
		}
	}

	pub fn policy(&self) -> UncaughtExceptionPolicy {
		self.policy
	}

	pub fn add_listener(&self, listener: FailureListener) {
		self.listeners.write().push(listener);
	}

	/// Delivers `exception` to every registered listener exactly once.
	pub fn notify(&self, exception: &ProfileRuntimeException) {
		let listeners = self.listeners.read().clone();
		for listener in listeners {
			listener(exception);
		}
	}

	/// Notifies listeners, then rethrows or suppresses according to the policy.
	pub fn propagate<T>(&self, exception: ProfileRuntimeException) -> Result<Option<T>> {
		self.propagate_once(exception, &AtomicBool::new(false))
	}

	/// Like [`ExceptionPropagator::propagate`], but skips the listeners when
	/// `notified` is already set. One flag is shared by everything that can
	/// report a failure of the same call.
	pub fn propagate_once<T>(&self, exception: ProfileRuntimeException, notified: &AtomicBool) -> Result<Option<T>> {
		warn!(
			target = "xprofile.exception",
			profile = %exception.profile(),
			service = exception.service(),
			method = exception.method(),
			cause = %exception.cause(),
			policy = ?self.policy,
			"uncaught failure in target method"
		);
		self.notify_once(&exception, notified);
		match self.policy {
			UncaughtExceptionPolicy::NotifyRethrow => Err(Error::RemoteInvocation(exception)),
			UncaughtExceptionPolicy::NotifySuppress => Ok(None),
		}
	}

	/// Notifies listeners unless `notified` was already set.
	pub fn notify_once(&self, exception: &ProfileRuntimeException, notified: &AtomicBool) {
		if !notified.swap(true, Ordering::SeqCst) {
			self.notify(exception);
		}
	}

	/// Routes a call result: successes pass through, remote failures follow the
	/// policy, and every other error is surfaced unchanged.
	pub fn settle<T>(&self, result: Result<T>) -> Result<Option<T>> {
		self.settle_once(result, &AtomicBool::new(false))
	}

	pub fn settle_once<T>(&self, result: Result<T>, notified: &AtomicBool) -> Result<Option<T>> {
		match result {
			Ok(value) => Ok(Some(value)),
			Err(Error::RemoteInvocation(exception)) => self.propagate_once(exception, notified),
			Err(other) => Err(other),
		}
	}
}

impl fmt::Debug for ExceptionPropagator {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ExceptionPropagator")
			.field("policy", &self.policy)
			.field("listeners", &self.listeners.read().len())
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use std::error::Error as _;
	use std::sync::atomic::AtomicUsize;

	use super::*;

	fn exception() -> ProfileRuntimeException {
		ProfileRuntimeException::new(Profile::Work, "notes", "count", MethodFailure::new("NotFound", "no folder"))
	}

	fn counting(propagator: &ExceptionPropagator) -> Arc<AtomicUsize> {
		let count = Arc::new(AtomicUsize::new(0));
		let seen = Arc::clone(&count);
		propagator.add_listener(Arc::new(move |_| {
			seen.fetch_add(1, Ordering::SeqCst);
		}));
		count
	}

	#[test]
	fn rethrow_notifies_then_returns_wrapped_failure() {
		let propagator = ExceptionPropagator::new(UncaughtExceptionPolicy::NotifyRethrow);
		let count = counting(&propagator);

		let err = propagator.propagate::<()>(exception()).unwrap_err();
		assert_eq!(count.load(Ordering::SeqCst), 1);
		let wrapped = err.as_remote().expect("remote invocation error");
		assert_eq!(wrapped.cause().class_name(), Some("NotFound"));
	}

	#[test]
	fn suppress_notifies_and_yields_no_value() {
		let propagator = ExceptionPropagator::new(UncaughtExceptionPolicy::NotifySuppress);
		let count = counting(&propagator);

		let value = propagator.propagate::<u32>(exception()).unwrap();
		assert_eq!(value, None);
		assert_eq!(count.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn shared_flag_notifies_once_per_call() {
		let propagator = ExceptionPropagator::new(UncaughtExceptionPolicy::NotifyRethrow);
		let count = counting(&propagator);
		let notified = AtomicBool::new(false);

		propagator.notify_once(&exception(), &notified);
		let err = propagator.settle_once::<u32>(Err(Error::RemoteInvocation(exception())), &notified).unwrap_err();
		assert!(err.as_remote().is_some());
		assert_eq!(count.load(Ordering::SeqCst), 1);

		propagator.settle::<u32>(Err(Error::RemoteInvocation(exception()))).unwrap_err();
		assert_eq!(count.load(Ordering::SeqCst), 2);
	}

	#[test]
	fn settle_never_gates_connectivity_errors() {
		let propagator = ExceptionPropagator::new(UncaughtExceptionPolicy::NotifySuppress);
		let count = counting(&propagator);

		let err = propagator.settle::<u32>(Err(Error::ProfileUnavailable(Profile::Work))).unwrap_err();
		assert!(err.is_unavailable());
		assert_eq!(count.load(Ordering::SeqCst), 0);
		assert_eq!(propagator.settle(Ok(5)).unwrap(), Some(5));
	}

	#[test]
	fn wrapped_failure_exposes_cause_as_source() {
		let wrapped = exception();
		let source = wrapped.source().expect("cause");
		assert_eq!(source.to_string(), "NotFound: no folder");
	}

	#[test]
	fn from_error_records_type_path_and_chain() {
		let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
		let failure = MethodFailure::from_error(&io);
		let class_name = failure.class_name().expect("class identity");
		assert!(class_name.starts_with("std::io"), "{class_name}");
		assert_eq!(failure.message(), "gone");

		let panic = MethodFailure::panicked(Box::new("boom"));
		assert_eq!(panic.class_name(), None);
		assert_eq!(panic.message(), "panic: boom");
	}

	#[test]
	fn payload_roundtrip_preserves_identity() {
		let failure = MethodFailure::new("IoError", "disk full").with_stack("at write");
		assert_eq!(MethodFailure::from(failure.to_payload()), failure);
	}
}
