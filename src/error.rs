use std::time::Duration;

use thiserror::Error;

/// A user method failed, either by returning an error or by panicking.
///
/// Carries the signature of the call that failed, the context it was invoked
/// in ("inline", "worker", "light", ...) and how long it ran.
#[derive(Debug, Error)]
#[error("Could not invoke {context} task {call}:\n{source}")]
pub struct InvocationError {
    pub call: String,
    pub context: &'static str,
    pub duration: Duration,
    #[source]
    pub source: anyhow::Error,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Invocation(#[from] InvocationError),

    #[error("Failed to build the worker pool.\n{0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("Couldn't initialize logging.\n{0}")]
    Logging(anyhow::Error),

    #[error("The orchestrator is already executing")]
    AlreadyExecuting,
}
