//! leadflow: inbound email lead pipeline.
//!
//! Mail is quarantined, scored against a versioned rubric, labeled, tracked
//! through sales stages, enriched with sender research, drafted against
//! vetted templates, and escalated to the operator.

pub mod config;
pub mod drafting;
pub mod error;
pub mod escalation;
pub mod leads;
pub mod llm;
pub mod mail;
pub mod pipeline;
pub mod quarantine;
pub mod research;
pub mod scoring;
pub mod store;

pub use error::{Error, Result};
