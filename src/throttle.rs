//! Cooldown policies and the sliding-window throttle store.
//!
//! A [`Throttle`] describes *how* a handler is rate limited: the scope its
//! buckets are keyed by, how many usages fit in the window, and how long the
//! window is. The [`ThrottleStore`] holds the live buckets (per-resource
//! usage timestamps inside a [`TtlCache`]) and answers the one question the
//! gate asks: is this call admitted, and if not, how long until it would be?
//!
//! Windows slide: each usage ages out individually rather than the whole
//! bucket resetting at a fixed boundary.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::cache::{CacheConfig, CacheStats, TtlCache};
use crate::clock::{Clock, MonotonicClock};
use crate::event::Event;

/// Bucket key used by [`CooldownScope::Global`].
pub const GLOBAL_RESOURCE_ID: &str = "global";

/// What a throttle's buckets are keyed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CooldownScope {
    /// One bucket per user, anywhere.
    User,
    /// One bucket per (guild, user) pair.
    Member,
    /// One bucket per guild.
    Guild,
    /// One bucket per channel.
    Channel,
    /// A single shared bucket.
    Global,
}

impl CooldownScope {
    /// Derive the resource id for an event under this scope.
    ///
    /// A pure function of the event's scoping ids, never a hash of the full
    /// event, so bucketing is stable across otherwise-different events.
    pub fn resource_id(self, event: &Event) -> String {
        match self {
            CooldownScope::User => event.user_id().clone(),
            CooldownScope::Member => match event.guild_id() {
                Some(guild) => format!("{guild}:{}", event.user_id()),
                None => format!("dm:{}", event.user_id()),
            },
            CooldownScope::Guild => {
                event.guild_id().cloned().unwrap_or_else(|| "dm".to_string())
            }
            CooldownScope::Channel => {
                event.channel_id().cloned().unwrap_or_else(|| "none".to_string())
            }
            CooldownScope::Global => GLOBAL_RESOURCE_ID.to_string(),
        }
    }
}

/// Cooldown configuration for one handler. Immutable after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Throttle {
    /// Whether throttling applies at all.
    pub enabled: bool,
    pub scope: CooldownScope,
    /// Usages admitted inside one window. Zero blocks every call.
    pub usages: u32,
    /// Window length. Zero disables the policy (nothing can remain inside a
    /// zero-width window), even when `enabled` is set.
    pub duration: Duration,
    /// Advisory flag for hosts that persist cooldown state themselves; this
    /// crate performs no persistence.
    pub persistent: bool,
}

impl Default for Throttle {
    fn default() -> Self {
        Self {
            enabled: true,
            scope: CooldownScope::User,
            usages: 2,
            duration: Duration::from_secs(15),
            persistent: false,
        }
    }
}

impl Throttle {
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy that never throttles.
    pub fn disabled() -> Self {
        Self { enabled: false, ..Self::default() }
    }

    pub fn with_scope(mut self, scope: CooldownScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_usages(mut self, usages: u32) -> Self {
        self.usages = usages;
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }
}

/// One bucket: the usage timestamps recorded under a throttle key.
#[derive(Debug, Clone)]
pub struct ThrottleEntry {
    pub throttle_id: String,
    pub duration: Duration,
    /// Millisecond timestamps, oldest first.
    pub usages: Vec<u64>,
}

/// Outcome of a throttle check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThrottleDecision {
    /// Admitted; a usage was recorded.
    Allowed {
        /// Usages left in the window after this one.
        remaining: u32,
    },
    /// On cooldown; nothing was recorded.
    Limited {
        /// Time until the earliest usage leaves the window.
        retry_after: Duration,
        scope: CooldownScope,
    },
}

impl ThrottleDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, ThrottleDecision::Allowed { .. })
    }
}

/// Process-wide store of throttle buckets.
///
/// A single mutex spans the whole read-filter-decide-write sequence of
/// [`check`](ThrottleStore::check), so two concurrent checks against the same
/// bucket serialize and the quota cannot be over-admitted.
pub struct ThrottleStore {
    cache: Mutex<TtlCache<ThrottleEntry>>,
    clock: Arc<dyn Clock>,
}

impl ThrottleStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(MonotonicClock::default()))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            cache: Mutex::new(TtlCache::new(CacheConfig::default()).with_clock(Arc::clone(&clock))),
            clock,
        }
    }

    /// Check (and on admission, record) a usage for `identity` under `policy`.
    ///
    /// `identity` must be the handler's stable identity hash, not its display
    /// name, so aliases of one handler share a bucket. The bucket entry is
    /// created lazily and lives in the cache with TTL equal to the policy
    /// duration, refreshed on every recorded usage.
    pub fn check(&self, identity: &str, policy: &Throttle, event: &Event) -> ThrottleDecision {
        if !policy.enabled || policy.duration.is_zero() {
            return ThrottleDecision::Allowed { remaining: policy.usages };
        }

        let now = self.clock.now_millis();
        let duration_ms = u64::try_from(policy.duration.as_millis()).unwrap_or(u64::MAX);
        let resource_id = policy.scope.resource_id(event);
        let throttle_id = format!("{identity}@{resource_id}");

        let mut cache = self.cache.lock().unwrap();
        let mut entry = match cache.get(&throttle_id) {
            Some(entry) => entry.clone(),
            None => ThrottleEntry {
                throttle_id: throttle_id.clone(),
                duration: policy.duration,
                usages: Vec::new(),
            },
        };

        let live: Vec<u64> = entry
            .usages
            .iter()
            .copied()
            .filter(|used_at| used_at.saturating_add(duration_ms) > now)
            .collect();

        if live.len() as u64 >= u64::from(policy.usages) {
            let retry_after = live
                .first()
                .map(|first| Duration::from_millis(first.saturating_add(duration_ms) - now))
                .unwrap_or(policy.duration);
            tracing::debug!(
                throttle_id = %throttle_id,
                retry_after_ms = retry_after.as_millis() as u64,
                "call throttled"
            );
            return ThrottleDecision::Limited { retry_after, scope: policy.scope };
        }

        let remaining = policy.usages - (live.len() as u32 + 1);
        entry.usages = live;
        entry.usages.push(now);
        cache.set_with_ttl(throttle_id, entry, policy.duration);

        ThrottleDecision::Allowed { remaining }
    }

    /// Live bucket count.
    pub fn len(&self) -> usize {
        self.cache.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every bucket.
    pub fn clear(&self) {
        self.cache.lock().unwrap().clear();
    }

    /// Counters of the backing cache.
    pub fn stats(&self) -> CacheStats {
        self.cache.lock().unwrap().stats()
    }
}

impl Default for ThrottleStore {
    fn default() -> Self {
        Self::new()
    }
}
