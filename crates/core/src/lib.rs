//! Profile-aware dispatch for cross-profile services.
//!
//! A service is described once, either with the [`cross_profile_type!`] macro
//! or as a [`CrossProfileType`] built at runtime, and is then called through
//! entry points that pick the target profile: `current`, `other`,
//! `personal`, `work`, `profile(p)`, `profiles(..)`, `both`, and, when the
//! connector configures a primary profile, `primary`, `secondary` and
//! `suppliers`.
//!
//! # Example
//!
//! ```ignore
//! use xprofile::prelude::*;
//!
//! cross_profile_type! {
//!     pub service Notes {
//!         policy: NotifySuppress,
//!         primary_profile: Work,
//!         methods {
//!             #[cacheable]
//!             fn count(#[key] folder: String) -> u32;
//!             fn sync(force: bool, #[callback] progress);
//!         }
//!     }
//! }
//!
//! let notes = Notes::create(connector)?;
//! let work_count = notes.work().count("inbox".into()).await?;
//! let everywhere = notes.both().count("inbox".into()).await?;
//! ```

extern crate self as xprofile;

pub mod codec;
pub mod descriptor;
pub mod dispatch;
pub mod endpoint;
pub mod generator;
pub mod sender;
pub mod service;
pub mod testing;

pub use async_trait::async_trait;
pub use descriptor::{CrossProfileType, CrossProfileTypeBuilder, MethodDescriptor, Param, ParamKind};
pub use dispatch::{Dispatcher, TargetOutcome};
pub use endpoint::ServiceEndpoint;
pub use generator::{EntryPoint, GeneratedMethod, GeneratedSurface, generate};
pub use sender::{MultiSender, ProfileResults, ServiceSurface, SingleSender};
pub use serde_json::Value;
pub use service::{CallbackHandle, ServiceImpl};
pub use xprofile_macros::cross_profile_type;
pub use xprofile_protocol as protocol;
pub use xprofile_runtime as runtime;
pub use xprofile_runtime::{
	CallbackEvent, CallbackSink, ConnectionHolder, ConnectionState, ConnectorConfig, Error, ExceptionPropagator, Intent, MethodFailure, Profile, ProfileBinder, ProfileConnector,
	ProfileHost, ProfileRuntimeException, ProfileType, Result, StaticProfileHost, UncaughtExceptionPolicy, channel_sink, sink_fn,
};

/// Common imports for services and callers.
pub mod prelude {
	pub use crate::{
		CallbackHandle, CallbackSink, ConnectorConfig, CrossProfileType, MethodFailure, Profile, ProfileConnector, ProfileType, ServiceEndpoint, ServiceImpl, ServiceSurface,
		StaticProfileHost, UncaughtExceptionPolicy, Value, async_trait, cross_profile_type,
	};
}
