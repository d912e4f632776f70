//! Constraint gate and dispatch state machine.
//!
//! [`Gate::dispatch`] turns an inbound [`Event`] into a gated, observable,
//! rate-limited call of a [`Handler`]. The admission order is fixed and
//! significant:
//!
//! 1. global + local pre-check middleware
//! 2. enablement
//! 3. permission level (callers below the bar learn nothing further)
//! 4. component origin (components only)
//! 5. DM/guild availability (skipped for autocomplete)
//! 6. platform permissions, the caller's then the bot's
//! 7. NSFW (after the permission checks, so NSFW-gated existence is not
//!    leaked to callers who would have failed earlier anyway)
//! 8. resource allow-list
//! 9. pre-throttle middleware + throttle check (throttled handlers only,
//!    last of all so failed attempts never consume quota)
//! 10. pre-execution middleware, the handler body, post-execution
//!     middleware, and return-value-keyed middleware
//!
//! A failed check produces a [`Rejection`] value, reported through the
//! [`Notifier`] and surfaced as `Ok(false)`, never an error. Only
//! middleware-infrastructure faults escape as [`PipelineError`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::clock::{Clock, MonotonicClock};
use crate::error::PipelineError;
use crate::event::{Event, EventKind};
use crate::handler::{Handler, HandlerKind, RunResult, StageBundle};
use crate::middleware::Pipeline;
use crate::permissions::{PermLevel, Permission, PermissionResolver, StaticResolver};
use crate::resources::ResourceKind;
use crate::telemetry::{GateEvent, StagePhase, TelemetrySink};
use crate::throttle::{CooldownScope, ThrottleDecision, ThrottleStore};

/// Why the NSFW constraint failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NsfwRejection {
    /// No channel context to verify against.
    UnknownChannel,
    /// DMs cannot be age-restricted.
    Dm,
    /// Threads cannot be age-restricted.
    Thread,
    /// The channel is not age-restricted.
    SfwChannel,
}

/// A failed admission check, with the user-facing notice as its `Display`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    Disabled,
    PermissionLevel { required: PermLevel, actual: PermLevel },
    ComponentOrigin,
    GuildOnly,
    /// No channel context to verify platform permissions against.
    MissingChannel,
    MissingUserPermissions { missing: Vec<Permission> },
    /// The bot's own member could not be resolved for a permission check.
    BotMemberUnavailable,
    MissingBotPermissions { missing: Vec<Permission> },
    Nsfw(NsfwRejection),
    Resource(ResourceKind),
    Throttled { retry_after: Duration, scope: CooldownScope },
}

fn join_permissions(missing: &[Permission]) -> String {
    missing.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(", ")
}

fn format_wait(duration: Duration) -> String {
    let mut seconds = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        seconds += 1;
    }
    let seconds = seconds.max(1);
    if seconds == 1 { "1 second".to_string() } else { format!("{seconds} seconds") }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::Disabled => f.write_str("This command is currently disabled."),
            Rejection::PermissionLevel { .. } => {
                f.write_str("You do not have the required permission level to use this command.")
            }
            Rejection::ComponentOrigin => {
                f.write_str("Only the member that used this command can use its components.")
            }
            Rejection::GuildOnly => f.write_str("This command is not available in DMs."),
            Rejection::MissingChannel => f.write_str(
                "The channel for this command could not be resolved for a permission check.",
            ),
            Rejection::MissingUserPermissions { missing } => {
                write!(f, "You are missing permissions: {}", join_permissions(missing))
            }
            Rejection::BotMemberUnavailable => {
                f.write_str("The bot could not verify its own permissions in this channel.")
            }
            Rejection::MissingBotPermissions { missing } => {
                write!(f, "The bot is missing permissions: {}", join_permissions(missing))
            }
            Rejection::Nsfw(reason) => {
                let text = match reason {
                    NsfwRejection::UnknownChannel => {
                        "The channel for this command could not be resolved for an age-restriction check."
                    }
                    NsfwRejection::Dm => "Age-restricted commands are not available in DMs.",
                    NsfwRejection::Thread => "Age-restricted commands are not available in threads.",
                    NsfwRejection::SfwChannel => {
                        "This command is only available in age-restricted channels."
                    }
                };
                f.write_str(text)
            }
            Rejection::Resource(kind) => {
                let text = match kind {
                    ResourceKind::Guild => "This command is not available in this server.",
                    ResourceKind::Channel => "This command is not available in this channel.",
                    ResourceKind::Role => "You are missing a role required for this command.",
                    ResourceKind::User => "You are not allowed to use this command.",
                    ResourceKind::Category => {
                        "This command is not available in this channel category."
                    }
                };
                f.write_str(text)
            }
            Rejection::Throttled { retry_after, .. } => {
                write!(
                    f,
                    "You are on cooldown for this command - please wait {} before using it again",
                    format_wait(*retry_after)
                )
            }
        }
    }
}

/// Delivers user-facing rejection notices. The platform reply mechanics are
/// the host's concern; the gate only hands over the rejection.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &Event, rejection: &Rejection);
}

/// Default notifier: logs the rejection at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, event: &Event, rejection: &Rejection) {
        tracing::debug!(
            user = %event.user_id(),
            event_kind = event.kind.name(),
            rejection = %rejection,
            "dispatch rejected"
        );
    }
}

/// Host-supplied metadata for one dispatch.
#[derive(Debug, Clone, Copy, Default)]
pub struct DispatchMeta {
    /// When the platform raised the event, on the gate's clock timeline.
    pub invoked_at_ms: u64,
}

impl DispatchMeta {
    pub fn invoked_at(millis: u64) -> Self {
        Self { invoked_at_ms: millis }
    }
}

/// Context threaded through every middleware stage and the handler body of
/// one dispatch.
pub struct DispatchContext<V> {
    pub event: Event,
    pub handler_name: String,
    /// When the platform raised the event.
    pub invoked_at_ms: u64,
    /// When the gate started this run.
    pub started_at_ms: u64,
    /// Present from post-execution stages onward.
    pub result: Option<RunResult<V>>,
}

impl<V> fmt::Debug for DispatchContext<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchContext")
            .field("handler_name", &self.handler_name)
            .field("invoked_at_ms", &self.invoked_at_ms)
            .field("started_at_ms", &self.started_at_ms)
            .field("result", &self.result)
            .finish_non_exhaustive()
    }
}

enum Admission {
    Pass,
    /// A pre-throttle middleware stopped propagation; it already handled the
    /// caller-facing outcome.
    Halted,
    Reject(Rejection),
}

/// The admission gate. Cheap to share behind an `Arc`; concurrent dispatches
/// interleave freely.
pub struct Gate<V> {
    pipeline: Pipeline,
    throttles: ThrottleStore,
    stages: StageBundle<DispatchContext<V>, V>,
    resolver: Arc<dyn PermissionResolver>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    sink: Option<Arc<dyn TelemetrySink>>,
}

impl<V> Gate<V>
where
    V: Clone + PartialEq,
{
    pub fn builder() -> GateBuilder<V> {
        GateBuilder {
            stages: StageBundle::new(),
            resolver: None,
            notifier: None,
            clock: None,
            sink: None,
        }
    }

    /// The shared throttle store backing this gate's cooldown checks.
    pub fn throttles(&self) -> &ThrottleStore {
        &self.throttles
    }

    /// Global middleware bundle.
    pub fn stages(&self) -> &StageBundle<DispatchContext<V>, V> {
        &self.stages
    }

    /// Dispatch with `invoked_at` stamped from the gate's clock.
    pub async fn dispatch_now(
        &self,
        handler: &Handler<V>,
        event: Event,
    ) -> Result<bool, PipelineError> {
        let meta = DispatchMeta::invoked_at(self.clock.now_millis());
        self.dispatch(handler, event, meta).await
    }

    /// Run the full admission and execution pipeline for one event.
    ///
    /// Returns `Ok(true)` when the handler body ran and every stage
    /// completed, `Ok(false)` on any admission failure or middleware halt,
    /// and `Err` only for middleware-infrastructure faults.
    pub async fn dispatch(
        &self,
        handler: &Handler<V>,
        event: Event,
        meta: DispatchMeta,
    ) -> Result<bool, PipelineError> {
        let mut ctx = DispatchContext {
            event,
            handler_name: handler.name().to_string(),
            invoked_at_ms: meta.invoked_at_ms,
            started_at_ms: self.clock.now_millis(),
            result: None,
        };

        if !self.pipeline.run(&mut ctx, self.stages.pre_checks()).await?
            || !self.pipeline.run(&mut ctx, handler.stages().pre_checks()).await?
        {
            self.emit_halt(handler, StagePhase::PreChecks).await;
            return Ok(false);
        }

        match self.check_constraints(handler, &mut ctx).await? {
            Admission::Pass => {}
            Admission::Halted => {
                self.emit_halt(handler, StagePhase::PreThrottle).await;
                return Ok(false);
            }
            Admission::Reject(rejection) => {
                tracing::debug!(
                    handler = %handler.name(),
                    rejection = %rejection,
                    "admission check failed"
                );
                self.notifier.notify(&ctx.event, &rejection).await;
                self.emit(GateEvent::Rejected { handler: handler.name().to_string(), rejection })
                    .await;
                return Ok(false);
            }
        }

        if !self.pipeline.run(&mut ctx, self.stages.pre_executions()).await?
            || !self.pipeline.run(&mut ctx, handler.stages().pre_executions()).await?
        {
            self.emit_halt(handler, StagePhase::PreExecution).await;
            return Ok(false);
        }

        let run_started = self.clock.now_millis();
        let outcome = handler.execute(&mut ctx).await;
        let runtime_ms = self.clock.now_millis().saturating_sub(run_started);
        let result = match outcome {
            Ok(data) => RunResult::completed(data),
            Err(error) => {
                tracing::error!(
                    handler = %handler.name(),
                    error = %error,
                    "handler execution failed"
                );
                RunResult::failed(error)
            }
        };
        self.emit(GateEvent::Executed {
            handler: handler.name().to_string(),
            success: result.success,
            runtime_ms,
        })
        .await;
        ctx.result = Some(result);

        if !self.pipeline.run(&mut ctx, self.stages.post_executions()).await?
            || !self.pipeline.run(&mut ctx, handler.stages().post_executions()).await?
        {
            self.emit_halt(handler, StagePhase::PostExecution).await;
            return Ok(false);
        }

        let returned = ctx.result.as_ref().and_then(|r| r.data.clone());
        if let Some(value) = returned {
            for entry in self.stages.return_values() {
                if entry.value == value {
                    self.pipeline.run(&mut ctx, &entry.stages).await?;
                }
            }
            for entry in handler.stages().return_values() {
                if entry.value == value {
                    self.pipeline.run(&mut ctx, &entry.stages).await?;
                }
            }
        }

        Ok(true)
    }

    async fn check_constraints(
        &self,
        handler: &Handler<V>,
        ctx: &mut DispatchContext<V>,
    ) -> Result<Admission, PipelineError> {
        if !handler.is_enabled() {
            return Ok(Admission::Reject(Rejection::Disabled));
        }

        // Internal permission level first: callers below the bar learn
        // nothing else about the command.
        let actual = self.resolver.resolve(&ctx.event).await;
        if actual < handler.perm_level() {
            return Ok(Admission::Reject(Rejection::PermissionLevel {
                required: handler.perm_level(),
                actual,
            }));
        }

        if let Some(rejection) = check_component_origin(handler, &ctx.event) {
            return Ok(Admission::Reject(rejection));
        }
        if let Some(rejection) = check_availability(handler, &ctx.event) {
            return Ok(Admission::Reject(rejection));
        }
        if let Some(rejection) = check_platform_permissions(handler, &ctx.event) {
            return Ok(Admission::Reject(rejection));
        }
        if let Some(rejection) = check_nsfw(handler, &ctx.event) {
            return Ok(Admission::Reject(rejection));
        }
        if let Err(kind) = handler.resources().check(&ctx.event) {
            return Ok(Admission::Reject(Rejection::Resource(kind)));
        }

        // Throttle last: only admitted-so-far calls may consume quota.
        if handler.throttle().enabled {
            if !self.pipeline.run(ctx, self.stages.pre_throttles()).await?
                || !self.pipeline.run(ctx, handler.stages().pre_throttles()).await?
            {
                return Ok(Admission::Halted);
            }
            let decision =
                self.throttles.check(handler.identity().as_str(), handler.throttle(), &ctx.event);
            if let ThrottleDecision::Limited { retry_after, scope } = decision {
                return Ok(Admission::Reject(Rejection::Throttled { retry_after, scope }));
            }
        }

        Ok(Admission::Pass)
    }

    async fn emit(&self, event: GateEvent) {
        if let Some(sink) = &self.sink {
            sink.emit(event).await;
        }
    }

    async fn emit_halt(&self, handler: &Handler<V>, phase: StagePhase) {
        self.emit(GateEvent::Halted { handler: handler.name().to_string(), phase }).await;
    }
}

fn check_component_origin<V>(handler: &Handler<V>, event: &Event) -> Option<Rejection> {
    if handler.kind() != HandlerKind::Component || !handler.is_user_scoped() {
        return None;
    }
    if let EventKind::Component { origin_user_id: Some(origin), .. } = &event.kind {
        // Components created outside an interaction have no origin and are
        // open to everyone.
        if origin != event.user_id() {
            return Some(Rejection::ComponentOrigin);
        }
    }
    None
}

fn check_availability<V>(handler: &Handler<V>, event: &Event) -> Option<Rejection> {
    // Autocomplete queries are bound to a command rather than standalone;
    // the command itself gets the real check when it is invoked.
    if event.is_autocomplete() {
        return None;
    }
    if handler.is_guild_only() && !event.in_guild() {
        return Some(Rejection::GuildOnly);
    }
    None
}

fn check_platform_permissions<V>(handler: &Handler<V>, event: &Event) -> Option<Rejection> {
    // In DMs both sides hold every permission that matters.
    if !event.in_guild() {
        return None;
    }

    let required = handler.user_permissions();
    if !required.is_empty() {
        let Some(channel) = event.channel() else {
            return Some(Rejection::MissingChannel);
        };
        if !channel.is_dm() {
            let missing = event.caller.permissions.missing(required);
            if !missing.is_empty() {
                return Some(Rejection::MissingUserPermissions { missing });
            }
        }
    }

    let required = handler.bot_permissions();
    if !required.is_empty() {
        let Some(channel) = event.channel() else {
            return Some(Rejection::MissingChannel);
        };
        if channel.is_dm() {
            return None;
        }
        let Some(bot_permissions) = event.caller.bot_permissions else {
            return Some(Rejection::BotMemberUnavailable);
        };
        let missing = bot_permissions.missing(required);
        if !missing.is_empty() {
            return Some(Rejection::MissingBotPermissions { missing });
        }
    }

    None
}

fn check_nsfw<V>(handler: &Handler<V>, event: &Event) -> Option<Rejection> {
    if !handler.is_nsfw() {
        return None;
    }
    let Some(channel) = event.channel() else {
        return Some(Rejection::Nsfw(NsfwRejection::UnknownChannel));
    };
    if channel.is_dm() {
        return Some(Rejection::Nsfw(NsfwRejection::Dm));
    }
    if channel.is_thread() {
        return Some(Rejection::Nsfw(NsfwRejection::Thread));
    }
    if !channel.nsfw {
        return Some(Rejection::Nsfw(NsfwRejection::SfwChannel));
    }
    None
}

/// Builder for [`Gate`].
pub struct GateBuilder<V> {
    stages: StageBundle<DispatchContext<V>, V>,
    resolver: Option<Arc<dyn PermissionResolver>>,
    notifier: Option<Arc<dyn Notifier>>,
    clock: Option<Arc<dyn Clock>>,
    sink: Option<Arc<dyn TelemetrySink>>,
}

impl<V> GateBuilder<V>
where
    V: Clone + PartialEq,
{
    /// Global middleware applied around every handler.
    pub fn stages(mut self, stages: StageBundle<DispatchContext<V>, V>) -> Self {
        self.stages = stages;
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn PermissionResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Shared clock for the pipeline, the throttle store, and dispatch
    /// timestamps.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn telemetry(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn build(self) -> Gate<V> {
        let clock = self.clock.unwrap_or_else(|| Arc::new(MonotonicClock::default()));
        Gate {
            pipeline: Pipeline::new().with_clock(Arc::clone(&clock)),
            throttles: ThrottleStore::with_clock(Arc::clone(&clock)),
            stages: self.stages,
            resolver: self.resolver.unwrap_or_else(|| Arc::new(StaticResolver::new())),
            notifier: self.notifier.unwrap_or_else(|| Arc::new(TracingNotifier)),
            clock,
            sink: self.sink,
        }
    }
}
