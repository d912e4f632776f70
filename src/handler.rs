//! Handler records.
//!
//! A [`Handler`] is a flat record: the shared admission fields (enablement,
//! permission level, platform permission requirements, allow-list, NSFW and
//! guild-only flags, throttle policy), a [`HandlerKind`] tag, the stage
//! bundle, and the boxed run function. There is no inheritance tower;
//! kind-specific behavior lives in the event union and the gate's pattern
//! matching.

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use sha2::{Digest, Sha256};

use crate::error::{ConfigError, StageError};
use crate::gate::DispatchContext;
use crate::middleware::Middleware;
use crate::permissions::{PermLevel, PermissionSet};
use crate::resources::ResourceAllowList;
use crate::throttle::Throttle;

/// The handler kinds the dispatcher routes events to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    ChatInput,
    UserContext,
    MessageContext,
    Component,
    Modal,
}

/// Stable identity for a handler's *origin*, independent of display names
/// and aliases. Used as the throttle key prefix so renaming or aliasing a
/// handler never splits its cooldown buckets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HandlerIdentity(String);

impl HandlerIdentity {
    /// Derive an identity from a source origin (file path, module path, ...).
    pub fn from_source(origin: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(origin.as_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }

    /// Adopt an externally computed hash verbatim.
    pub fn from_hash(hash: impl Into<String>) -> Result<Self, ConfigError> {
        let hash = hash.into();
        if hash.is_empty() {
            return Err(ConfigError::EmptyIdentity);
        }
        Ok(Self(hash))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HandlerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Normalized outcome of a handler body.
///
/// Execution faults are absorbed here, never rethrown: post-execution
/// middleware receives the fault as data.
#[derive(Clone)]
pub struct RunResult<V> {
    /// Value the handler returned, when it succeeded and returned one.
    pub data: Option<V>,
    pub success: bool,
    pub error: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl<V> RunResult<V> {
    pub fn completed(data: Option<V>) -> Self {
        Self { data, success: true, error: None }
    }

    pub fn failed(error: StageError) -> Self {
        Self { data: None, success: false, error: Some(Arc::from(error)) }
    }
}

impl<V> fmt::Debug for RunResult<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunResult")
            .field("success", &self.success)
            .field("has_data", &self.data.is_some())
            .field("error", &self.error.as_ref().map(|e| e.to_string()))
            .finish()
    }
}

/// Stage list keyed to a specific handler return value.
pub struct ReturnValueStages<C, V> {
    pub value: V,
    pub stages: Vec<Middleware<C, V>>,
}

/// The ordered stage lists a gate or handler carries.
///
/// `pre_checks` run before any constraint, `pre_throttle` immediately before
/// the throttle check (only for throttled handlers), `pre_execution` after
/// all admission checks, `post_execution` after the handler body, and
/// `on_return_value` lists run only when the handler's result equals their
/// key.
pub struct StageBundle<C, V> {
    pre_checks: Vec<Middleware<C, V>>,
    pre_throttle: Vec<Middleware<C, V>>,
    pre_execution: Vec<Middleware<C, V>>,
    post_execution: Vec<Middleware<C, V>>,
    on_return_value: Vec<ReturnValueStages<C, V>>,
}

impl<C, V> Default for StageBundle<C, V> {
    fn default() -> Self {
        Self {
            pre_checks: Vec::new(),
            pre_throttle: Vec::new(),
            pre_execution: Vec::new(),
            post_execution: Vec::new(),
            on_return_value: Vec::new(),
        }
    }
}

impl<C, V> StageBundle<C, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pre_check(mut self, stage: Middleware<C, V>) -> Self {
        self.pre_checks.push(stage);
        self
    }

    pub fn pre_throttle(mut self, stage: Middleware<C, V>) -> Self {
        self.pre_throttle.push(stage);
        self
    }

    pub fn pre_execution(mut self, stage: Middleware<C, V>) -> Self {
        self.pre_execution.push(stage);
        self
    }

    pub fn post_execution(mut self, stage: Middleware<C, V>) -> Self {
        self.post_execution.push(stage);
        self
    }

    pub fn on_return_value(mut self, value: V, stages: Vec<Middleware<C, V>>) -> Self {
        self.on_return_value.push(ReturnValueStages { value, stages });
        self
    }

    /// Append another bundle's stages after this one's, list by list.
    pub fn extend(&mut self, other: StageBundle<C, V>) {
        self.pre_checks.extend(other.pre_checks);
        self.pre_throttle.extend(other.pre_throttle);
        self.pre_execution.extend(other.pre_execution);
        self.post_execution.extend(other.post_execution);
        self.on_return_value.extend(other.on_return_value);
    }

    pub fn pre_checks(&self) -> &[Middleware<C, V>] {
        &self.pre_checks
    }

    pub fn pre_throttles(&self) -> &[Middleware<C, V>] {
        &self.pre_throttle
    }

    pub fn pre_executions(&self) -> &[Middleware<C, V>] {
        &self.pre_execution
    }

    pub fn post_executions(&self) -> &[Middleware<C, V>] {
        &self.post_execution
    }

    pub fn return_values(&self) -> &[ReturnValueStages<C, V>] {
        &self.on_return_value
    }
}

type RunFn<V> = Box<
    dyn for<'a> Fn(&'a mut DispatchContext<V>) -> BoxFuture<'a, Result<Option<V>, StageError>>
        + Send
        + Sync,
>;

/// One registered handler.
pub struct Handler<V> {
    name: String,
    kind: HandlerKind,
    identity: HandlerIdentity,
    enabled: bool,
    perm_level: PermLevel,
    user_permissions: PermissionSet,
    bot_permissions: PermissionSet,
    resources: ResourceAllowList,
    nsfw: bool,
    guild_only: bool,
    /// For components: restrict the component to the user whose interaction
    /// created it.
    user_scoped: bool,
    throttle: Throttle,
    stages: StageBundle<DispatchContext<V>, V>,
    run: RunFn<V>,
}

impl<V> Handler<V> {
    pub fn builder(name: impl Into<String>) -> HandlerBuilder<V> {
        HandlerBuilder {
            name: name.into(),
            kind: HandlerKind::ChatInput,
            identity: None,
            enabled: true,
            perm_level: PermLevel::User,
            user_permissions: PermissionSet::empty(),
            bot_permissions: PermissionSet::empty(),
            resources: ResourceAllowList::new(),
            nsfw: false,
            guild_only: true,
            user_scoped: false,
            throttle: Throttle::default(),
            stages: StageBundle::new(),
            run: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> HandlerKind {
        self.kind
    }

    pub fn identity(&self) -> &HandlerIdentity {
        &self.identity
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn perm_level(&self) -> PermLevel {
        self.perm_level
    }

    pub fn user_permissions(&self) -> PermissionSet {
        self.user_permissions
    }

    pub fn bot_permissions(&self) -> PermissionSet {
        self.bot_permissions
    }

    pub fn resources(&self) -> &ResourceAllowList {
        &self.resources
    }

    pub fn is_nsfw(&self) -> bool {
        self.nsfw
    }

    pub fn is_guild_only(&self) -> bool {
        self.guild_only
    }

    pub fn is_user_scoped(&self) -> bool {
        self.user_scoped
    }

    pub fn throttle(&self) -> &Throttle {
        &self.throttle
    }

    pub fn stages(&self) -> &StageBundle<DispatchContext<V>, V> {
        &self.stages
    }

    /// Append middleware to this handler's bundle after construction.
    pub fn use_stages(&mut self, bundle: StageBundle<DispatchContext<V>, V>) {
        self.stages.extend(bundle);
    }

    pub(crate) async fn execute(
        &self,
        ctx: &mut DispatchContext<V>,
    ) -> Result<Option<V>, StageError> {
        (self.run)(ctx).await
    }
}

impl<V> fmt::Debug for Handler<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("identity", &self.identity)
            .field("enabled", &self.enabled)
            .field("perm_level", &self.perm_level)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Handler`]. Configuration faults surface here, at
/// registration time, never at dispatch time.
pub struct HandlerBuilder<V> {
    name: String,
    kind: HandlerKind,
    identity: Option<HandlerIdentity>,
    enabled: bool,
    perm_level: PermLevel,
    user_permissions: PermissionSet,
    bot_permissions: PermissionSet,
    resources: ResourceAllowList,
    nsfw: bool,
    guild_only: bool,
    user_scoped: bool,
    throttle: Throttle,
    stages: StageBundle<DispatchContext<V>, V>,
    run: Option<RunFn<V>>,
}

impl<V> HandlerBuilder<V> {
    pub fn kind(mut self, kind: HandlerKind) -> Self {
        self.kind = kind;
        self
    }

    /// Identity derived from the handler's source origin.
    pub fn source(mut self, origin: &str) -> Self {
        self.identity = Some(HandlerIdentity::from_source(origin));
        self
    }

    /// Externally supplied identity.
    pub fn identity(mut self, identity: HandlerIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn perm_level(mut self, level: PermLevel) -> Self {
        self.perm_level = level;
        self
    }

    pub fn user_permissions(mut self, permissions: PermissionSet) -> Self {
        self.user_permissions = permissions;
        self
    }

    pub fn bot_permissions(mut self, permissions: PermissionSet) -> Self {
        self.bot_permissions = permissions;
        self
    }

    pub fn resources(mut self, resources: ResourceAllowList) -> Self {
        self.resources = resources;
        self
    }

    pub fn nsfw(mut self, nsfw: bool) -> Self {
        self.nsfw = nsfw;
        self
    }

    pub fn guild_only(mut self, guild_only: bool) -> Self {
        self.guild_only = guild_only;
        self
    }

    pub fn user_scoped(mut self, user_scoped: bool) -> Self {
        self.user_scoped = user_scoped;
        self
    }

    pub fn throttle(mut self, throttle: Throttle) -> Self {
        self.throttle = throttle;
        self
    }

    pub fn stages(mut self, stages: StageBundle<DispatchContext<V>, V>) -> Self {
        self.stages = stages;
        self
    }

    pub fn run<F>(mut self, run: F) -> Self
    where
        F: for<'a> Fn(
                &'a mut DispatchContext<V>,
            ) -> BoxFuture<'a, Result<Option<V>, StageError>>
            + Send
            + Sync
            + 'static,
    {
        self.run = Some(Box::new(run));
        self
    }

    pub fn build(self) -> Result<Handler<V>, ConfigError> {
        let identity = self
            .identity
            .ok_or_else(|| ConfigError::MissingIdentity { name: self.name.clone() })?;
        let run = self.run.ok_or_else(|| ConfigError::MissingRun { name: self.name.clone() })?;
        Ok(Handler {
            name: self.name,
            kind: self.kind,
            identity,
            enabled: self.enabled,
            perm_level: self.perm_level,
            user_permissions: self.user_permissions,
            bot_permissions: self.bot_permissions,
            resources: self.resources,
            nsfw: self.nsfw,
            guild_only: self.guild_only,
            user_scoped: self.user_scoped,
            throttle: self.throttle,
            stages: self.stages,
            run,
        })
    }
}
