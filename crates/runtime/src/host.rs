//! Host profile queries.

use std::collections::HashSet;

use parking_lot::RwLock;
use xprofile_protocol::Profile;

/// Host collaborator answering which profile the process runs in and which
/// profiles exist and are turned on.
pub trait ProfileHost: Send + Sync {
	/// Profile the calling process executes in.
	fn current_profile(&self) -> Profile;

	/// Returns `true` when `profile` exists and is turned on.
	fn is_available(&self, profile: Profile) -> bool;
}

/// Host with a fixed current profile and a mutable availability set.
#[derive(Debug)]
pub struct StaticProfileHost {
	current: Profile,
	available: RwLock<HashSet<Profile>>,
}

impl StaticProfileHost {
	/// A host where every profile is available.
	pub fn new(current: Profile) -> Self {
		Self {
			current,
			available: RwLock::new(Profile::ALL.into_iter().collect()),
		}
	}

	/// A host where only the current profile is available.
	pub fn isolated(current: Profile) -> Self {
		Self {
			current,
			available: RwLock::new(HashSet::from([current])),
		}
	}

	pub fn set_available(&self, profile: Profile, available: bool) {
		let mut set = self.available.write();
		if available {
			set.insert(profile);
		} else {
			set.remove(&profile);
		}
	}
}

impl ProfileHost for StaticProfileHost {
	fn current_profile(&self) -> Profile {
		self.current
	}

	fn is_available(&self, profile: Profile) -> bool {
		profile == self.current || self.available.read().contains(&profile)
	}
}
