//! Profile identities.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// An isolated execution context on the device that can host a service.
///
/// Profiles are peers. Neither one owns the other; "primary" and "secondary"
/// are roles assigned by connector configuration, not by the profile itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Profile {
	Personal,
	Work,
}

impl Profile {
	/// Every concrete profile, in identity order.
	pub const ALL: [Profile; 2] = [Profile::Personal, Profile::Work];

	/// Returns the complementary profile.
	pub fn other(self) -> Profile {
		match self {
			Profile::Personal => Profile::Work,
			Profile::Work => Profile::Personal,
		}
	}

	pub fn as_str(self) -> &'static str {
		match self {
			Profile::Personal => "PERSONAL",
			Profile::Work => "WORK",
		}
	}
}

impl fmt::Display for Profile {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for Profile {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_ascii_uppercase().as_str() {
			"PERSONAL" => Ok(Profile::Personal),
			"WORK" => Ok(Profile::Work),
			other => Err(format!("unknown profile '{other}', expected PERSONAL or WORK")),
		}
	}
}

/// Profile value as it appears in configuration, where "no profile" is legal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProfileType {
	Personal,
	Work,
	#[default]
	None,
}

impl ProfileType {
	/// Returns the concrete profile, or `None` for [`ProfileType::None`].
	pub fn profile(self) -> Option<Profile> {
		match self {
			ProfileType::Personal => Some(Profile::Personal),
			ProfileType::Work => Some(Profile::Work),
			ProfileType::None => None,
		}
	}

	pub fn is_none(self) -> bool {
		self == ProfileType::None
	}
}

impl From<Profile> for ProfileType {
	fn from(profile: Profile) -> Self {
		match profile {
			Profile::Personal => ProfileType::Personal,
			Profile::Work => ProfileType::Work,
		}
	}
}

impl FromStr for ProfileType {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		if s.eq_ignore_ascii_case("none") {
			return Ok(ProfileType::None);
		}
		s.parse::<Profile>().map(ProfileType::from)
	}
}
