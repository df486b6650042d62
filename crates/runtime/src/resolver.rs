//! Call intent to concrete profile targets.

use std::collections::BTreeSet;

use xprofile_protocol::Profile;

use crate::connector::ProfileConnector;
use crate::error::{Error, Result};

/// Which profiles a call addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
	Current,
	Other,
	Personal,
	Work,
	Profile(Profile),
	Profiles(Vec<Profile>),
	Both,
	Primary,
	Secondary,
	Suppliers,
}

impl Intent {
	/// Returns `true` for intents that address exactly one profile.
	pub fn is_single(&self) -> bool {
		!matches!(self, Intent::Profiles(_) | Intent::Both | Intent::Suppliers)
	}
}

/// Outcome of resolving an [`Intent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
	Single(Profile),
	Fanout(Targets),
}

/// Deduplicated fan-out targets.
///
/// `reachable` profiles get an envelope each; `unavailable` ones were named by
/// the caller but are not accessible and report
/// [`Error::ProfileUnavailable`] in the aggregate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Targets {
	reachable: BTreeSet<Profile>,
	unavailable: BTreeSet<Profile>,
}

impl Targets {
	pub fn reachable(&self) -> &BTreeSet<Profile> {
		&self.reachable
	}

	pub fn unavailable(&self) -> &BTreeSet<Profile> {
		&self.unavailable
	}

	/// Number of distinct profiles, reachable or not.
	pub fn len(&self) -> usize {
		self.reachable.len() + self.unavailable.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Drops reachable targets without a live connection. Never connects.
	pub fn retain_connected(&mut self, connector: &ProfileConnector) {
		self.reachable.retain(|profile| connector.is_connected(*profile));
	}
}

/// Resolves intents against a connector's configuration and its host.
#[derive(Debug, Clone)]
pub struct TargetResolver {
	connector: ProfileConnector,
}

impl TargetResolver {
	pub fn new(connector: ProfileConnector) -> Self {
		Self { connector }
	}

	pub fn connector(&self) -> &ProfileConnector {
		&self.connector
	}

	/// The current profile, or one the host reports as existing and turned on.
	pub fn is_accessible(&self, profile: Profile) -> bool {
		profile == self.connector.current_profile() || self.connector.host().is_available(profile)
	}

	pub fn resolve(&self, intent: &Intent) -> Result<Resolution> {
		if intent.is_single() {
			self.resolve_single(intent).map(Resolution::Single)
		} else {
			self.resolve_many(intent).map(Resolution::Fanout)
		}
	}

	/// Resolves a single-target intent; inaccessible targets fail.
	pub fn resolve_single(&self, intent: &Intent) -> Result<Profile> {
		let current = self.connector.current_profile();
		let profile = match intent {
			Intent::Current => return Ok(current),
			Intent::Other => current.other(),
			Intent::Personal => Profile::Personal,
			Intent::Work => Profile::Work,
			Intent::Profile(profile) => *profile,
			Intent::Primary => self.connector.primary_profile()?,
			Intent::Secondary => self.connector.secondary_profile()?,
			Intent::Profiles(_) | Intent::Both | Intent::Suppliers => {
				return Err(Error::InvalidArguments {
					method: "resolve_single".to_string(),
					reason: format!("{intent:?} addresses several profiles"),
				});
			}
		};

		if self.is_accessible(profile) {
			Ok(profile)
		} else {
			Err(Error::ProfileUnavailable(profile))
		}
	}

	/// Resolves any intent to a deduplicated target set.
	pub fn resolve_many(&self, intent: &Intent) -> Result<Targets> {
		let mut targets = Targets::default();
		match intent {
			Intent::Profiles(profiles) => {
				for profile in profiles {
					if self.is_accessible(*profile) {
						targets.reachable.insert(*profile);
					} else {
						targets.unavailable.insert(*profile);
					}
				}
			}
			Intent::Both => {
				targets.reachable = Profile::ALL.into_iter().filter(|p| self.is_accessible(*p)).collect();
			}
			Intent::Suppliers => {
				let primary = self.connector.primary_profile()?;
				let secondary = primary.other();
				let candidates: &[Profile] = if self.connector.current_profile() == primary {
					&[primary, secondary]
				} else {
					&[secondary]
				};
				targets.reachable = candidates.iter().copied().filter(|p| self.is_accessible(*p)).collect();
			}
			single => match self.resolve_single(single) {
				Ok(profile) => {
					targets.reachable.insert(profile);
				}
				Err(Error::ProfileUnavailable(profile)) => {
					targets.unavailable.insert(profile);
				}
				Err(err) => return Err(err),
			},
		}
		Ok(targets)
	}
}
