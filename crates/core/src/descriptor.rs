//! Descriptor model for cross-profile services.
//!
//! A [`CrossProfileType`] is built once, validated, and never mutated. It is
//! what the runtime generator and the dispatcher consume; the
//! `cross_profile_type!` macro emits code that builds one.
//!
//! Descriptors also load from JSON:
//!
//! ```json
//! {
//!   "name": "Notes",
//!   "connector": "notes",
//!   "policy": "NOTIFY_SUPPRESS",
//!   "methods": [
//!     { "name": "count", "cacheable": true, "returns": "u32",
//!       "params": [{ "name": "folder", "kind": "key", "type": "String" }] },
//!     { "name": "sync",
//!       "params": [{ "name": "force", "type": "bool" }, { "name": "progress", "kind": "callback" }] }
//!   ]
//! }
//! ```

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use xprofile_runtime::{ConnectorConfig, Error, Result, UncaughtExceptionPolicy};

/// How a parameter participates in a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ParamKind {
	/// Plain serialized value.
	#[default]
	Value,
	/// Serialized value that forms part of the cache key.
	Key,
	/// Callback reference; delivered through the call's reverse channel.
	Callback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Param {
	pub name: String,
	#[serde(default)]
	pub kind: ParamKind,
	/// Type name for display; not interpreted.
	#[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
	pub ty: Option<String>,
}

impl Param {
	pub fn is_callback(&self) -> bool {
		self.kind == ParamKind::Callback
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodDescriptor {
	pub name: String,
	#[serde(default)]
	pub params: Vec<Param>,
	/// Return type name; `None` for void methods.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub returns: Option<String>,
	#[serde(default)]
	pub cacheable: bool,
}

impl MethodDescriptor {
	pub fn new(name: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			params: Vec::new(),
			returns: None,
			cacheable: false,
		}
	}

	pub fn param(self, name: impl Into<String>, ty: impl Into<String>) -> Self {
		self.push(name, ParamKind::Value, Some(ty.into()))
	}

	/// Adds a value parameter that is part of the cache key.
	pub fn key(self, name: impl Into<String>, ty: impl Into<String>) -> Self {
		self.push(name, ParamKind::Key, Some(ty.into()))
	}

	pub fn callback(self, name: impl Into<String>) -> Self {
		self.push(name, ParamKind::Callback, None)
	}

	pub fn returns(mut self, ty: impl Into<String>) -> Self {
		self.returns = Some(ty.into());
		self
	}

	pub fn cacheable(mut self) -> Self {
		self.cacheable = true;
		self
	}

	fn push(mut self, name: impl Into<String>, kind: ParamKind, ty: Option<String>) -> Self {
		self.params.push(Param { name: name.into(), kind, ty });
		self
	}

	pub fn is_void(&self) -> bool {
		self.returns.is_none()
	}

	/// Non-callback parameters, in declaration order. These are the call's `args`.
	pub fn value_params(&self) -> impl Iterator<Item = &Param> {
		self.params.iter().filter(|param| !param.is_callback())
	}

	pub fn value_arity(&self) -> usize {
		self.value_params().count()
	}

	/// Positions of callback parameters in the signature; used as wire slots.
	pub fn callback_slots(&self) -> Vec<u32> {
		self.params
			.iter()
			.enumerate()
			.filter(|(_, param)| param.is_callback())
			.map(|(index, _)| index as u32)
			.collect()
	}

	/// Indices into the value arguments that form the cache key.
	///
	/// Explicit `key` parameters win; without any, every value parameter counts.
	pub fn key_indices(&self) -> Vec<usize> {
		let keyed: Vec<usize> = self
			.value_params()
			.enumerate()
			.filter(|(_, param)| param.kind == ParamKind::Key)
			.map(|(index, _)| index)
			.collect();
		if keyed.is_empty() { (0..self.value_arity()).collect() } else { keyed }
	}

	fn validate(&self, service: &str) -> Result<()> {
		let invalid = |reason: String| Err(Error::InvalidDescriptor(format!("{service}.{}: {reason}", self.name)));

		if self.name.trim().is_empty() {
			return Err(Error::InvalidDescriptor(format!("{service}: method name must not be empty")));
		}
		if self.cacheable && self.is_void() {
			return invalid("void methods cannot be cacheable".to_string());
		}
		if self.cacheable && self.params.iter().any(Param::is_callback) {
			return invalid("cacheable methods cannot take callback parameters".to_string());
		}

		let mut seen = HashSet::new();
		for param in &self.params {
			if param.name.trim().is_empty() {
				return invalid("parameter name must not be empty".to_string());
			}
			if !seen.insert(param.name.as_str()) {
				return invalid(format!("duplicate parameter '{}'", param.name));
			}
		}
		Ok(())
	}
}

/// Immutable description of a service whose methods may run in another profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossProfileType {
	name: String,
	#[serde(default)]
	methods: Vec<MethodDescriptor>,
	/// Name of the connector this service is statically bound to, if any.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	connector: Option<String>,
	/// Declared policy; falls back to the connector's default when absent.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	policy: Option<UncaughtExceptionPolicy>,
}

impl CrossProfileType {
	pub fn builder(name: impl Into<String>) -> CrossProfileTypeBuilder {
		CrossProfileTypeBuilder {
			descriptor: CrossProfileType {
				name: name.into(),
				methods: Vec::new(),
				connector: None,
				policy: None,
			},
		}
	}

	pub fn from_json(json: &str) -> Result<Self> {
		let descriptor: Self = serde_json::from_str(json)?;
		descriptor.validate()?;
		Ok(descriptor)
	}

	pub fn load(path: &Path) -> Result<Self> {
		let content = std::fs::read_to_string(path)?;
		Self::from_json(&content)
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn methods(&self) -> &[MethodDescriptor] {
		&self.methods
	}

	pub fn method(&self, name: &str) -> Option<&MethodDescriptor> {
		self.methods.iter().find(|method| method.name == name)
	}

	pub fn connector(&self) -> Option<&str> {
		self.connector.as_deref()
	}

	pub fn declared_policy(&self) -> Option<UncaughtExceptionPolicy> {
		self.policy
	}

	/// The declared policy, else the connector default, else `NOTIFY_RETHROW`.
	pub fn effective_policy(&self, connector: Option<&ConnectorConfig>) -> UncaughtExceptionPolicy {
		self.policy
			.or_else(|| connector.map(|config| config.uncaught_exception_policy))
			.unwrap_or_default()
	}

	pub fn validate(&self) -> Result<()> {
		if self.name.trim().is_empty() {
			return Err(Error::InvalidDescriptor("service name must not be empty".to_string()));
		}

		let mut seen = HashSet::new();
		for method in &self.methods {
			method.validate(&self.name)?;
			if !seen.insert(method.name.as_str()) {
				return Err(Error::InvalidDescriptor(format!("{}: duplicate method '{}'", self.name, method.name)));
			}
		}
		Ok(())
	}
}

#[derive(Debug, Clone)]
pub struct CrossProfileTypeBuilder {
	descriptor: CrossProfileType,
}

impl CrossProfileTypeBuilder {
	pub fn connector(mut self, name: impl Into<String>) -> Self {
		self.descriptor.connector = Some(name.into());
		self
	}

	pub fn policy(mut self, policy: UncaughtExceptionPolicy) -> Self {
		self.descriptor.policy = Some(policy);
		self
	}

	pub fn method(mut self, method: MethodDescriptor) -> Self {
		self.descriptor.methods.push(method);
		self
	}

	pub fn build(self) -> Result<CrossProfileType> {
		self.descriptor.validate()?;
		Ok(self.descriptor)
	}
}
