//! Lead lifecycle: score labels, stages, and the stage audit trail.

pub mod labeler;
pub mod stage;
pub mod tracker;

pub use labeler::{apply_score_label, initialize_stage, labels, score_label_for};
pub use stage::{Stage, allowed_from, is_valid_transition};
pub use tracker::{StageChange, StageDrift, StageSystemOfRecord, StageTracker};
