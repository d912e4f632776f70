//! Ordered middleware stages with short-circuit semantics.
//!
//! A [`Middleware`] wraps one async stage: an execute function, optional
//! `before`/`after`/`on_error` hooks, and runtime statistics. A [`Pipeline`]
//! runs a slice of stages strictly in order, handing each a [`StageControl`]
//! whose `next()` must be called for the run to continue. *Not* calling it
//! is how a stage rejects a call without raising an error.
//!
//! Semantics:
//! - Disabled stages are skipped entirely: no hooks, no stats, no effect on
//!   `previous_result`.
//! - `previous_result` is the value returned by the immediately preceding
//!   *executed* stage, threaded through the per-run control and never stored
//!   on the pipeline, so interleaved runs against one `Pipeline` are
//!   independent.
//! - Timing wraps only `execute`: `before` runs prior to the timer starting,
//!   `after` runs once it has stopped.
//! - An error from `execute` is absorbed by the stage's `on_error` hook (the
//!   stage then counts as completed with no result); without a hook it aborts
//!   the whole run as a [`PipelineError`].

use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;

use crate::clock::{Clock, MonotonicClock};
use crate::error::{PipelineError, StageError};

/// Value produced by one stage: `Ok(Some(v))` to hand a result to the next
/// stage, `Ok(None)` for no result, `Err` for a stage fault.
pub type StageResult<V> = Result<Option<V>, StageError>;

type ExecuteFn<C, V> = Box<
    dyn for<'a> Fn(&'a mut C, &'a mut StageControl<V>) -> BoxFuture<'a, StageResult<V>>
        + Send
        + Sync,
>;
type HookFn<C> = Box<dyn for<'a> Fn(&'a mut C) -> BoxFuture<'a, ()> + Send + Sync>;
type ErrorHookFn<C> = Box<
    dyn for<'a> Fn(&'a (dyn std::error::Error + Send + Sync), &'a mut C) -> BoxFuture<'a, ()>
        + Send
        + Sync,
>;

/// Per-run control handed to each stage alongside the caller's context.
#[derive(Debug)]
pub struct StageControl<V> {
    previous_result: Option<V>,
    previous_stage: Option<String>,
    next_stage: Option<String>,
    index: usize,
    next_called: bool,
}

impl<V> StageControl<V> {
    /// Continue to the next stage once this one's `execute` resolves.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) {
        self.next_called = true;
    }

    /// Result of the previous executed (not skipped) stage in this run.
    pub fn previous_result(&self) -> Option<&V> {
        self.previous_result.as_ref()
    }

    /// Label of the previous executed stage, if any.
    pub fn previous_stage(&self) -> Option<&str> {
        self.previous_stage.as_deref()
    }

    /// Label of the stage that would run next, if any.
    pub fn next_stage(&self) -> Option<&str> {
        self.next_stage.as_deref()
    }

    /// Position of this stage in the original stage list.
    pub fn index(&self) -> usize {
        self.index
    }
}

struct StageState<V> {
    executed_count: u64,
    runtime_total_ms: u64,
    runtime_sum_squares: f64,
    runtime_lowest_ms: Option<u64>,
    runtime_highest_ms: Option<u64>,
    last_executed_at_ms: Option<u64>,
    last_runtime_ms: Option<u64>,
    last_result: Option<V>,
}

impl<V> Default for StageState<V> {
    fn default() -> Self {
        Self {
            executed_count: 0,
            runtime_total_ms: 0,
            runtime_sum_squares: 0.0,
            runtime_lowest_ms: None,
            runtime_highest_ms: None,
            last_executed_at_ms: None,
            last_runtime_ms: None,
            last_result: None,
        }
    }
}

/// Snapshot of a stage's runtime statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MiddlewareStats {
    pub executed_count: u64,
    pub runtime_total_ms: u64,
    pub runtime_lowest_ms: Option<u64>,
    pub runtime_highest_ms: Option<u64>,
    pub runtime_average_ms: Option<f64>,
    pub runtime_variance_ms: Option<f64>,
    pub runtime_std_dev_ms: Option<f64>,
    pub last_executed_at_ms: Option<u64>,
    pub last_runtime_ms: Option<u64>,
}

/// One middleware stage.
///
/// Owned by exactly one stage list; stage lists are plain ordered `Vec`s,
/// never shared across handlers.
pub struct Middleware<C, V> {
    name: Option<String>,
    disabled: bool,
    execute: ExecuteFn<C, V>,
    before: Option<HookFn<C>>,
    after: Option<HookFn<C>>,
    on_error: Option<ErrorHookFn<C>>,
    state: Mutex<StageState<V>>,
}

impl<C, V: Clone> Middleware<C, V> {
    /// Stage from a bare execute function.
    ///
    /// ```ignore
    /// let stage = Middleware::new(|ctx: &mut MyCtx, ctl: &mut StageControl<String>| {
    ///     Box::pin(async move {
    ///         ctl.next();
    ///         Ok(None)
    ///     })
    /// });
    /// ```
    pub fn new<F>(execute: F) -> Self
    where
        F: for<'a> Fn(&'a mut C, &'a mut StageControl<V>) -> BoxFuture<'a, StageResult<V>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: None,
            disabled: false,
            execute: Box::new(execute),
            before: None,
            after: None,
            on_error: None,
            state: Mutex::new(StageState::default()),
        }
    }

    /// Stage with a label used in logs and error messages.
    pub fn named<F>(name: impl Into<String>, execute: F) -> Self
    where
        F: for<'a> Fn(&'a mut C, &'a mut StageControl<V>) -> BoxFuture<'a, StageResult<V>>
            + Send
            + Sync
            + 'static,
    {
        Self::new(execute).with_name(name)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    /// Hook run before `execute`, outside the timing window.
    pub fn before<F>(mut self, hook: F) -> Self
    where
        F: for<'a> Fn(&'a mut C) -> BoxFuture<'a, ()> + Send + Sync + 'static,
    {
        self.before = Some(Box::new(hook));
        self
    }

    /// Hook run after `execute` and the timing stop, before the result
    /// propagates.
    pub fn after<F>(mut self, hook: F) -> Self
    where
        F: for<'a> Fn(&'a mut C) -> BoxFuture<'a, ()> + Send + Sync + 'static,
    {
        self.after = Some(Box::new(hook));
        self
    }

    /// Hook absorbing an `execute` error. With this hook present the stage is
    /// treated as completed; without it the error aborts the pipeline run.
    pub fn on_error<F>(mut self, hook: F) -> Self
    where
        F: for<'a> Fn(&'a (dyn std::error::Error + Send + Sync), &'a mut C) -> BoxFuture<'a, ()>
            + Send
            + Sync
            + 'static,
    {
        self.on_error = Some(Box::new(hook));
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    pub fn stats(&self) -> MiddlewareStats {
        let state = self.state.lock().unwrap();
        let average = if state.executed_count == 0 {
            None
        } else {
            Some(state.runtime_total_ms as f64 / state.executed_count as f64)
        };
        let variance = average.map(|mean| {
            let mean_square = state.runtime_sum_squares / state.executed_count as f64;
            (mean_square - mean * mean).max(0.0)
        });
        MiddlewareStats {
            executed_count: state.executed_count,
            runtime_total_ms: state.runtime_total_ms,
            runtime_lowest_ms: state.runtime_lowest_ms,
            runtime_highest_ms: state.runtime_highest_ms,
            runtime_average_ms: average,
            runtime_variance_ms: variance,
            runtime_std_dev_ms: variance.map(f64::sqrt),
            last_executed_at_ms: state.last_executed_at_ms,
            last_runtime_ms: state.last_runtime_ms,
        }
    }

    /// Result of the most recent completed execution, if it produced one.
    pub fn last_result(&self) -> Option<V> {
        self.state.lock().unwrap().last_result.clone()
    }

    pub fn reset_stats(&self) {
        *self.state.lock().unwrap() = StageState::default();
    }

    fn label(&self, index: usize) -> String {
        self.name.clone().unwrap_or_else(|| format!("#{index}"))
    }

    async fn run(
        &self,
        ctx: &mut C,
        control: &mut StageControl<V>,
        clock: &dyn Clock,
    ) -> StageResult<V> {
        if let Some(before) = &self.before {
            before(ctx).await;
        }

        let started = clock.now_millis();
        let outcome = (self.execute)(ctx, control).await;
        let finished = clock.now_millis();

        let result = match outcome {
            Ok(value) => value,
            Err(err) => match &self.on_error {
                Some(hook) => {
                    hook(err.as_ref(), ctx).await;
                    None
                }
                None => return Err(err),
            },
        };

        if let Some(after) = &self.after {
            after(ctx).await;
        }

        self.record_run(finished.saturating_sub(started), clock.now_millis(), result.clone());
        Ok(result)
    }

    fn record_run(&self, runtime_ms: u64, now_ms: u64, result: Option<V>) {
        let mut state = self.state.lock().unwrap();
        state.executed_count += 1;
        state.runtime_total_ms += runtime_ms;
        state.runtime_sum_squares += (runtime_ms as f64) * (runtime_ms as f64);
        state.runtime_lowest_ms =
            Some(state.runtime_lowest_ms.map_or(runtime_ms, |low| low.min(runtime_ms)));
        state.runtime_highest_ms =
            Some(state.runtime_highest_ms.map_or(runtime_ms, |high| high.max(runtime_ms)));
        state.last_executed_at_ms = Some(now_ms);
        state.last_runtime_ms = Some(runtime_ms);
        state.last_result = result;
    }
}

impl<C, V> std::fmt::Debug for Middleware<C, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Middleware")
            .field("name", &self.name)
            .field("disabled", &self.disabled)
            .finish_non_exhaustive()
    }
}

/// Executes stage lists in order.
///
/// Stateless between runs apart from the injected clock; safe to share and
/// run concurrently.
#[derive(Debug, Clone)]
pub struct Pipeline {
    clock: Arc<dyn Clock>,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipeline {
    pub fn new() -> Self {
        Self { clock: Arc::new(MonotonicClock::default()) }
    }

    /// Override the clock (useful for deterministic timing tests).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Run `stages` in order against `ctx`.
    ///
    /// Returns `Ok(true)` when every enabled stage ran and called `next()`,
    /// `Ok(false)` when a stage stopped propagation, and `Err` when a stage
    /// faulted with no `on_error` hook.
    pub async fn run<C, V: Clone>(
        &self,
        ctx: &mut C,
        stages: &[Middleware<C, V>],
    ) -> Result<bool, PipelineError> {
        if stages.is_empty() {
            return Ok(true);
        }

        let enabled: Vec<(usize, &Middleware<C, V>)> =
            stages.iter().enumerate().filter(|(_, stage)| !stage.disabled).collect();

        let mut previous_result: Option<V> = None;
        let mut previous_label: Option<String> = None;
        for (position, (index, stage)) in enabled.iter().enumerate() {
            let mut control = StageControl {
                previous_result: previous_result.take(),
                previous_stage: previous_label.take(),
                next_stage: enabled.get(position + 1).map(|(i, next)| next.label(*i)),
                index: *index,
                next_called: false,
            };

            let value = stage.run(ctx, &mut control, self.clock.as_ref()).await.map_err(
                |source| PipelineError::Stage {
                    index: *index,
                    label: stage.label(*index),
                    source,
                },
            )?;

            if !control.next_called {
                tracing::debug!(stage = %stage.label(*index), "middleware stopped propagation");
                return Ok(false);
            }
            previous_result = value;
            previous_label = Some(stage.label(*index));
        }
        Ok(true)
    }
}
