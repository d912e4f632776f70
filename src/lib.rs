#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Tollgate
//!
//! Admission primitives for async Rust: the pieces that turn an inbound
//! event into a gated, observable, rate-limited handler call.
//!
//! ## Components
//!
//! - **TTL cache** ([`TtlCache`], [`FetchCache`]): keyed store with per-entry
//!   expiry, optional FIFO capacity eviction, lifecycle callbacks, and
//!   counters. Expiry is driven by an injected [`Clock`], never by timers.
//! - **Throttle** ([`Throttle`], [`ThrottleStore`]): sliding-window cooldowns
//!   keyed by a stable handler identity and a scope-derived resource id.
//! - **Middleware** ([`Middleware`], [`Pipeline`]): ordered async stages with
//!   "call `next()` or halt" semantics, hooks, and runtime statistics.
//! - **Gate** ([`Gate`]): the fixed-order constraint gate (enablement,
//!   permission level, origin, availability, platform permissions, NSFW,
//!   allow-lists, throttle) wrapped around handler execution.
//!
//! ## Quick start
//!
//! ```rust
//! use std::sync::Arc;
//! use tollgate::{DispatchMeta, Event, EventKind, Caller, Gate, Handler, Throttle};
//!
//! #[tokio::main]
//! async fn main() {
//!     let gate: Gate<String> = Gate::builder().build();
//!     let handler = Handler::builder("ping")
//!         .source("commands/util/ping.rs")
//!         .guild_only(false)
//!         .throttle(Throttle::new().with_usages(2))
//!         .run(|_ctx| Box::pin(async { Ok(Some("pong".to_string())) }))
//!         .build()
//!         .expect("valid handler");
//!
//!     let event = Event::new(
//!         EventKind::ChatInput { command: "ping".into() },
//!         Caller::new("user-1"),
//!     );
//!     let executed = gate.dispatch(&handler, event, DispatchMeta::default()).await;
//!     assert!(executed.unwrap());
//! }
//! ```

pub mod cache;
pub mod clock;
pub mod error;
pub mod event;
pub mod gate;
pub mod handler;
pub mod middleware;
pub mod permissions;
pub mod resources;
pub mod telemetry;
pub mod throttle;

// Re-exports
pub use cache::{CacheConfig, CacheStats, FetchCache, FetchError, FetchStats, RemovalReason, TtlCache};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use error::{ConfigError, PipelineError, StageError};
pub use event::{Caller, Channel, ChannelKind, Event, EventKind, Id};
pub use gate::{
    DispatchContext, DispatchMeta, Gate, GateBuilder, Notifier, NsfwRejection, Rejection,
    TracingNotifier,
};
pub use handler::{
    Handler, HandlerBuilder, HandlerIdentity, HandlerKind, ReturnValueStages, RunResult,
    StageBundle,
};
pub use middleware::{Middleware, MiddlewareStats, Pipeline, StageControl, StageResult};
pub use permissions::{
    PermLevel, Permission, PermissionResolver, PermissionSet, StaticResolver,
};
pub use resources::{ResourceAllowList, ResourceKind};
pub use telemetry::{GateEvent, LogSink, RecordingSink, StagePhase, TelemetrySink};
pub use throttle::{CooldownScope, Throttle, ThrottleDecision, ThrottleEntry, ThrottleStore};
