//! Message processing pipeline.
//!
//! Each polled message flows through:
//! 1. Quarantine: sanitize, then scan (fail-closed)
//! 2. Persist (idempotent on message id)
//! 3. Score, label, and initialize the stage
//! 4. Research the sender domain
//! 5. Draft a reply for review
//! 6. Escalate to the operator
//!
//! **Nothing is ever sent to the sender.** Drafts are stored, not mailed.

pub mod backoff;
pub mod orchestrator;
pub mod types;

pub use backoff::{BackoffPolicy, Sleeper, TokioSleeper, VirtualSleeper};
pub use orchestrator::{
    Orchestrator, PipelineServices, RECENT_LIMIT, pipeline_stats, recent_messages,
};
pub use types::{
    AccountPollResult, BackfillReport, PipelineStats, PollReport, ProcessReport, Step, StepFailure,
};
