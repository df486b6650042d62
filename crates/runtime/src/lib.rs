// xprofile-runtime: caller-side machinery for cross-profile calls
//
// Connection lifecycle, envelope correlation, target resolution, result
// caching and failure propagation. The `xprofile` crate builds the
// descriptor-driven surface on top of this.

pub mod cache;
pub mod callback;
pub mod config;
pub mod connection;
pub mod connector;
pub mod error;
pub mod exception;
pub mod fake_transport;
pub mod host;
pub mod resolver;
pub mod transport;

pub use cache::{CacheKey, ResultCache};
pub use callback::{CallbackEvent, CallbackSink, channel_sink, sink_fn};
pub use config::{ConnectorConfig, DEFAULT_IDLE_TIMEOUT_MS};
pub use connection::{CallEnvelope, Connection};
pub use connector::{Connected, ConnectionHolder, ConnectionState, HoldGuard, ProfileConnector};
pub use error::{Error, Result};
pub use exception::{ExceptionPropagator, FailureListener, MethodFailure, ProfileRuntimeException, UncaughtExceptionPolicy};
pub use host::{ProfileHost, StaticProfileHost};
pub use resolver::{Intent, Resolution, TargetResolver, Targets};
pub use transport::{LinkSeverer, ProfileBinder, Transport, TransportParts, TransportReceiver, memory_pair};
pub use xprofile_protocol::{Profile, ProfileType};
