//! # Treehole Core
//!
//! Shared logic for the treehole RAG agent: data models, candidate-set
//! deduplication and ranking, course-review extraction, prompt assembly,
//! and the iterative search orchestrator.
//!
//! This crate performs no network or filesystem I/O. The orchestrator
//! talks to the outside world only through the [`orchestrator::ForumSearcher`]
//! and [`orchestrator::ChatModel`] traits, so every decision it makes can
//! be exercised with in-memory stubs.
//!
//! ## Data Flow
//!
//! 1. A front-end builds a [`models::Query`] (manual keyword, automatic,
//!    or course review).
//! 2. The [`orchestrator::Orchestrator`] runs the bounded retrieval loop,
//!    merging every fetch into a [`candidates::CandidateSet`] keyed by
//!    post id.
//! 3. [`candidates::select`] picks the context posts; for course reviews,
//!    [`review`] extracts and filters the relevant comments.
//! 4. [`prompt`] renders the bounded [`models::SynthesisContext`] into the
//!    final LLM prompt, and the answer streams back to the caller as lazy
//!    chunks.

pub mod candidates;
pub mod error;
pub mod models;
pub mod orchestrator;
pub mod prompt;
pub mod review;

pub use candidates::CandidateSet;
pub use error::AgentError;
pub use models::{Comment, ContextKind, Post, Query, QueryMode, SearchIteration, SynthesisContext};
pub use orchestrator::{Answer, ChatModel, ForumSearcher, Orchestrator, SearchLimits};
