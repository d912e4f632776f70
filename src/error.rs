//! Error types for the admission pipeline.
//!
//! Only two classes of failure surface as `Err` values: middleware
//! infrastructure faults ([`PipelineError`]) and setup-time configuration
//! faults ([`ConfigError`]). Everything else (a failed admission check, a
//! throttled call, a handler body that blew up) is an ordinary value:
//! `Rejection`, `ThrottleDecision::Limited`, or `RunResult`. Those are
//! expected runtime outcomes, not programming errors.

use thiserror::Error;

/// Boxed error produced by a middleware stage or handler body.
pub type StageError = Box<dyn std::error::Error + Send + Sync>;

/// Fault inside the middleware infrastructure itself.
///
/// Raised when a stage's `execute` errors and the stage has no `on_error`
/// hook to absorb it. Fatal to the current pipeline run; the dispatcher
/// boundary should catch and log it as an internal error, distinct from
/// handler faults (which are normalized into `RunResult`).
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("middleware stage {index} ({label}) failed: {source}")]
    Stage {
        /// Position of the failing stage in its stage list.
        index: usize,
        /// Stage name, or a synthesized `#index` label for anonymous stages.
        label: String,
        #[source]
        source: StageError,
    },
}

impl PipelineError {
    /// Position of the failing stage in its stage list.
    pub fn stage_index(&self) -> usize {
        match self {
            PipelineError::Stage { index, .. } => *index,
        }
    }
}

/// Setup/registration-time configuration fault.
///
/// These are raised while wiring handlers and collaborators, never during
/// dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A handler identity hash must be a non-empty string.
    #[error("handler identity must not be empty")]
    EmptyIdentity,
    /// Every handler needs a run function.
    #[error("handler `{name}` has no run function")]
    MissingRun { name: String },
    /// Every handler needs a stable identity for throttle bucketing.
    #[error("handler `{name}` has no identity; supply one via source() or identity()")]
    MissingIdentity { name: String },
}
