//! Descriptor to entry-point surface.
//!
//! [`generate`] is the runtime counterpart of the `cross_profile_type!` macro:
//! given a descriptor and, when statically known, its connector configuration,
//! it decides which profile-aware entry points the service exposes and how
//! each method is marshaled.

use std::fmt;

use serde::Serialize;
use xprofile_runtime::{ConnectorConfig, UncaughtExceptionPolicy};

use crate::descriptor::{CrossProfileType, MethodDescriptor, ParamKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EntryPoint {
	Current,
	Other,
	Personal,
	Work,
	Profile,
	Profiles,
	Both,
	Primary,
	Secondary,
	Suppliers,
}

impl EntryPoint {
	/// Entry points every service has.
	pub const ALWAYS: [EntryPoint; 7] = [
		EntryPoint::Current,
		EntryPoint::Other,
		EntryPoint::Personal,
		EntryPoint::Work,
		EntryPoint::Profile,
		EntryPoint::Profiles,
		EntryPoint::Both,
	];

	/// Entry points that depend on a configured primary profile.
	pub const ROLES: [EntryPoint; 3] = [EntryPoint::Primary, EntryPoint::Secondary, EntryPoint::Suppliers];

	pub fn name(self) -> &'static str {
		match self {
			EntryPoint::Current => "current",
			EntryPoint::Other => "other",
			EntryPoint::Personal => "personal",
			EntryPoint::Work => "work",
			EntryPoint::Profile => "profile",
			EntryPoint::Profiles => "profiles",
			EntryPoint::Both => "both",
			EntryPoint::Primary => "primary",
			EntryPoint::Secondary => "secondary",
			EntryPoint::Suppliers => "suppliers",
		}
	}

	/// Returns `true` when the entry point can address several profiles.
	pub fn is_fanout(self) -> bool {
		matches!(self, EntryPoint::Profiles | EntryPoint::Both | EntryPoint::Suppliers)
	}
}

impl fmt::Display for EntryPoint {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.name())
	}
}

/// Marshaling plan for one method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedMethod {
	pub name: String,
	/// Value parameters, in wire order.
	pub args: Vec<String>,
	pub callbacks: Vec<String>,
	/// Callback parameter slots, parallel to `callbacks`.
	pub callback_slots: Vec<u32>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub returns: Option<String>,
	pub cacheable: bool,
	/// Parameters forming the cache key; empty unless cacheable.
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub cache_key: Vec<String>,
}

impl GeneratedMethod {
	fn plan(method: &MethodDescriptor) -> Self {
		let args: Vec<String> = method.value_params().map(|param| param.name.clone()).collect();
		let cache_key = if method.cacheable {
			method.key_indices().into_iter().filter_map(|index| args.get(index).cloned()).collect()
		} else {
			Vec::new()
		};

		Self {
			name: method.name.clone(),
			callbacks: method.params.iter().filter(|param| param.kind == ParamKind::Callback).map(|param| param.name.clone()).collect(),
			callback_slots: method.callback_slots(),
			returns: method.returns.clone(),
			cacheable: method.cacheable,
			cache_key,
			args,
		}
	}
}

/// Generated profile-aware surface of one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedSurface {
	pub service: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub connector: Option<String>,
	pub policy: UncaughtExceptionPolicy,
	pub entry_points: Vec<EntryPoint>,
	pub methods: Vec<GeneratedMethod>,
}

impl GeneratedSurface {
	pub fn has(&self, entry_point: EntryPoint) -> bool {
		self.entry_points.contains(&entry_point)
	}

	pub fn method(&self, name: &str) -> Option<&GeneratedMethod> {
		self.methods.iter().find(|method| method.name == name)
	}
}

/// Builds the entry-point surface for `descriptor`.
///
/// Role entry points are emitted when `connector` configures a primary
/// profile, or when no connector is known; in the latter case they fail at
/// call time if the runtime connector turns out to be unconfigured.
pub fn generate(descriptor: &CrossProfileType, connector: Option<&ConnectorConfig>) -> GeneratedSurface {
	let mut entry_points = EntryPoint::ALWAYS.to_vec();
	let roles = connector.is_none_or(|config| !config.primary_profile.is_none());
	if roles {
		entry_points.extend(EntryPoint::ROLES);
	}

	GeneratedSurface {
		service: descriptor.name().to_string(),
		connector: connector.map(|config| config.name.clone()).or_else(|| descriptor.connector().map(str::to_string)),
		policy: descriptor.effective_policy(connector),
		entry_points,
		methods: descriptor.methods().iter().map(GeneratedMethod::plan).collect(),
	}
}
