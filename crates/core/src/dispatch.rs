//! Caller-side dispatch for one service.
//!
//! The [`Dispatcher`] is what every generated entry point funnels into. For a
//! resolved target profile it validates the arguments, consults the result
//! cache, runs the call locally or over the profile's connection, and settles
//! the outcome through the service's exception propagator.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use futures_util::stream::{self, BoxStream, FuturesUnordered, StreamExt};
use futures_util::FutureExt;
use serde_json::Value;
use tracing::{debug, trace};
use xprofile_protocol::Profile;
use xprofile_runtime::{
	CacheKey, CallbackSink, Connected, Error, ExceptionPropagator, MethodFailure, ProfileConnector, ProfileRuntimeException, Result, ResultCache, TargetResolver, Targets,
};

use crate::codec;
use crate::descriptor::{CrossProfileType, MethodDescriptor};
use crate::service::{Completion, ServiceImpl};

/// Outcome of one target: `Ok(None)` means a failure was suppressed by policy.
pub type TargetOutcome = Result<Option<Value>>;

pub struct Dispatcher {
	descriptor: CrossProfileType,
	connector: ProfileConnector,
	resolver: TargetResolver,
	local: Option<Arc<dyn ServiceImpl>>,
	cache: ResultCache,
	propagator: Arc<ExceptionPropagator>,
}

impl Dispatcher {
	pub fn new(descriptor: CrossProfileType, connector: ProfileConnector, local: Option<Arc<dyn ServiceImpl>>) -> Self {
		let policy = descriptor.effective_policy(Some(connector.config()));
		Self {
			resolver: TargetResolver::new(connector.clone()),
			propagator: Arc::new(ExceptionPropagator::new(policy)),
			cache: ResultCache::new(),
			descriptor,
			connector,
			local,
		}
	}

	pub fn descriptor(&self) -> &CrossProfileType {
		&self.descriptor
	}

	pub fn connector(&self) -> &ProfileConnector {
		&self.connector
	}

	pub fn resolver(&self) -> &TargetResolver {
		&self.resolver
	}

	pub fn cache(&self) -> &ResultCache {
		&self.cache
	}

	pub fn propagator(&self) -> &ExceptionPropagator {
		&self.propagator
	}

	/// Calls `method` in `profile`, which must already be resolved.
	pub async fn call_profile(&self, profile: Profile, method: &str, args: Vec<Value>, sinks: Vec<Arc<dyn CallbackSink>>) -> TargetOutcome {
		let descriptor = self.method(method)?;
		self.check_arity(descriptor, &args, &sinks)?;

		let cache_key = descriptor
			.cacheable
			.then(|| CacheKey::new(self.descriptor.name(), method, codec::argument_key(descriptor, &args), profile));
		if let Some(key) = &cache_key {
			if let Some(value) = self.cache.get(key) {
				trace!(target = "xprofile.dispatch", service = self.descriptor.name(), method, %profile, "cache hit");
				return Ok(Some(value));
			}
		}

		let notified = Arc::new(AtomicBool::new(false));
		let sinks = self.propagating(sinks, &notified);
		let slots = descriptor.callback_slots();
		let result = if profile == self.connector.current_profile() {
			self.call_local(profile, method, args, slots, sinks).await
		} else {
			self.call_remote(profile, method, args, slots, sinks).await
		};

		// Concurrent misses on one key each reach the target; see `ResultCache`.
		if let (Some(key), Ok(value)) = (cache_key, &result) {
			self.cache.insert(key, value.clone());
		}
		self.propagator.settle_once(result, &notified)
	}

	/// Runs one envelope per reachable target concurrently. Outcomes are
	/// yielded in completion order; unavailable targets come first.
	pub fn fan_out(self: &Arc<Self>, targets: &Targets, method: &str, args: Vec<Value>, sinks: Vec<Arc<dyn CallbackSink>>) -> BoxStream<'static, (Profile, TargetOutcome)> {
		debug!(
			target = "xprofile.dispatch",
			service = self.descriptor.name(),
			method,
			reachable = targets.reachable().len(),
			unavailable = targets.unavailable().len(),
			"fan-out"
		);

		let unavailable: Vec<(Profile, TargetOutcome)> = targets.unavailable().iter().map(|profile| (*profile, Err(Error::ProfileUnavailable(*profile)))).collect();

		let calls: FuturesUnordered<_> = targets
			.reachable()
			.iter()
			.map(|&profile| {
				let dispatcher = Arc::clone(self);
				let method = method.to_string();
				let args = args.clone();
				let sinks = sinks.clone();
				async move {
					let outcome = dispatcher.call_profile(profile, &method, args, sinks).await;
					(profile, outcome)
				}
			})
			.collect();

		stream::iter(unavailable).chain(calls).boxed()
	}

	fn method(&self, method: &str) -> Result<&MethodDescriptor> {
		self.descriptor.method(method).ok_or_else(|| Error::UnknownMethod {
			service: self.descriptor.name().to_string(),
			method: method.to_string(),
		})
	}

	fn check_arity(&self, descriptor: &MethodDescriptor, args: &[Value], sinks: &[Arc<dyn CallbackSink>]) -> Result<()> {
		let expected_args = descriptor.value_arity();
		let expected_sinks = descriptor.callback_slots().len();
		if args.len() != expected_args || sinks.len() != expected_sinks {
			return Err(Error::InvalidArguments {
				method: descriptor.name.clone(),
				reason: format!(
					"expected {expected_args} argument(s) and {expected_sinks} callback(s), got {} and {}",
					args.len(),
					sinks.len()
				),
			});
		}
		Ok(())
	}

	fn propagating(&self, sinks: Vec<Arc<dyn CallbackSink>>, notified: &Arc<AtomicBool>) -> Vec<Arc<dyn CallbackSink>> {
		if sinks.is_empty() {
			return sinks;
		}
		sinks
			.into_iter()
			.map(|inner| {
				Arc::new(PropagatingSink {
					inner,
					propagator: Arc::clone(&self.propagator),
					notified: Arc::clone(notified),
				}) as Arc<dyn CallbackSink>
			})
			.collect()
	}

	async fn call_local(&self, profile: Profile, method: &str, args: Vec<Value>, slots: Vec<u32>, sinks: Vec<Arc<dyn CallbackSink>>) -> Result<Value> {
		let service = self.descriptor.name();
		let Some(local) = &self.local else {
			return Err(Error::ServiceNotRegistered {
				service: service.to_string(),
				profile,
			});
		};
		trace!(target = "xprofile.dispatch", service, method, %profile, "local call");

		let completion = (!slots.is_empty()).then(|| Completion::local(profile, service, method, slots.clone(), sinks));
		let handles = completion.as_ref().map(|c| c.handles(&slots)).unwrap_or_default();

		let outcome = AssertUnwindSafe(local.invoke(method, args, handles))
			.catch_unwind()
			.await
			.unwrap_or_else(|panic| Err(MethodFailure::panicked(panic)));

		match outcome {
			Ok(value) => Ok(value),
			Err(failure) => {
				if let Some(completion) = &completion {
					completion.finish(Err(failure.clone()));
				}
				Err(Error::RemoteInvocation(ProfileRuntimeException::new(profile, service, method, failure)))
			}
		}
	}

	async fn call_remote(&self, profile: Profile, method: &str, args: Vec<Value>, slots: Vec<u32>, sinks: Vec<Arc<dyn CallbackSink>>) -> Result<Value> {
		let _hold = self.connector.hold(profile);
		let connection = match self.connector.connect(profile).await? {
			Connected::Remote(connection) => connection,
			Connected::Local(_) => {
				return Err(Error::Protocol(format!("profile {profile} resolved to a local connection")));
			}
		};

		let envelope = connection.envelope(self.descriptor.name(), method, args, slots);
		trace!(target = "xprofile.dispatch", service = self.descriptor.name(), method, %profile, id = envelope.id, "remote call");
		connection.call(envelope, sinks).await
	}
}

/// Reports wrapped callback failures to the service's listeners. The flag is
/// shared with the call's own settlement so listeners hear once per call.
struct PropagatingSink {
	inner: Arc<dyn CallbackSink>,
	propagator: Arc<ExceptionPropagator>,
	notified: Arc<AtomicBool>,
}

impl CallbackSink for PropagatingSink {
	fn on_event(&self, profile: Profile, event: &str, payload: Value) {
		self.inner.on_event(profile, event, payload);
	}

	fn on_complete(&self, profile: Profile, outcome: Result<Value>) {
		if let Err(Error::RemoteInvocation(exception)) = &outcome {
			self.propagator.notify_once(exception, &self.notified);
		}
		self.inner.on_complete(profile, outcome);
	}
}
