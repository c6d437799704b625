//! Outbound reply drafts. Nothing here sends mail.
//!
//! 1. Writer model personalizes a vetted template
//! 2. Reviewer model independently approves or denies
//! 3. Deterministic content gate

pub mod drafter;
pub mod gate;
pub mod reviewer;
pub mod templates;
pub mod writer;

pub use drafter::{DraftOutcome, Drafter};
pub use gate::{ContentGate, GateResult, content_gate};
pub use reviewer::{DraftReviewer, ReviewVerdict};
pub use templates::TemplateStore;
pub use writer::{DraftContext, DraftWriter};
