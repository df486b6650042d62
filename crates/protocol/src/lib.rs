//! Wire types for cross-profile calls.
//!
//! This crate contains the serde-serializable types exchanged between a caller
//! and a service endpoint running in another profile. These types are the
//! "protocol layer": the shapes of data as they appear on a connection.
//!
//! # Design Philosophy
//!
//! Types in this crate are:
//! * Pure data: No behavior beyond serialization/deserialization
//! * Transport agnostic: Any ordered, reliable message channel can carry them
//! * Stable: Changes only when the wire protocol changes
//!
//! Connection management and dispatch are built on top of these types in
//! `xprofile-runtime` and `xprofile`.

pub mod message;
pub mod profile;

pub use message::*;
pub use profile::*;
