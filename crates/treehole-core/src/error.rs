//! Error taxonomy shared by the core and the application crate.

use thiserror::Error;

/// Errors surfaced by the search orchestrator and its collaborators.
///
/// Per-keyword forum failures are absorbed inside the retrieval loop and
/// never reach callers; only the cases below escape
/// [`Orchestrator::run`](crate::orchestrator::Orchestrator::run).
#[derive(Debug, Error)]
pub enum AgentError {
    /// The forum API or the LLM API was unreachable or rejected the
    /// request after the retry budget was exhausted.
    #[error("upstream service failed: {0}")]
    Upstream(String),

    /// Every iteration completed and the candidate set is still empty.
    #[error("no matching posts found after all search iterations")]
    SearchExhausted,

    /// Invalid or missing configuration, surfaced before any query runs.
    #[error("configuration error: {0}")]
    Config(String),
}

impl AgentError {
    pub fn upstream(msg: impl Into<String>) -> Self {
        AgentError::Upstream(msg.into())
    }
}
