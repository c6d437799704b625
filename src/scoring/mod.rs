//! Lead scoring against a versioned rubric.

pub mod rubric;
pub mod scorer;

pub use rubric::Rubric;
pub use scorer::{
    Bucket, CLASSIFICATIONS, DimensionScore, Dimensions, DriftReport, LeadScorer, RescoreSummary,
    ScoreResult, ScoringInput, check_drift, parse_score_response,
};
