//! Reports produced by the orchestrator.

use std::fmt;

use serde::Serialize;

use crate::drafting::DraftOutcome;
use crate::escalation::EscalationOutcome;
use crate::scoring::DriftReport;
use crate::store::{MessageCounts, QuarantineStatus};

/// Pipeline steps, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Quarantine,
    Persist,
    Score,
    ScoreLabel,
    StageInit,
    StageDrift,
    Research,
    Draft,
    Escalate,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Quarantine => "quarantine",
            Self::Persist => "persist",
            Self::Score => "score",
            Self::ScoreLabel => "score_label",
            Self::StageInit => "stage_init",
            Self::StageDrift => "stage_drift",
            Self::Research => "research",
            Self::Draft => "draft",
            Self::Escalate => "escalate",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepFailure {
    pub step: Step,
    pub error: String,
}

/// What happened to one message.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessReport {
    pub message_id: String,
    /// Row id, once persisted.
    pub id: Option<i64>,
    /// The message id was already stored; nothing else ran.
    pub duplicate: bool,
    pub quarantine: Option<QuarantineStatus>,
    pub classification: Option<String>,
    pub score: Option<i64>,
    pub completed: Vec<Step>,
    pub failures: Vec<StepFailure>,
    pub draft: Option<DraftOutcome>,
    pub escalation: Option<EscalationOutcome>,
}

impl ProcessReport {
    pub(crate) fn new(message_id: &str) -> Self {
        Self {
            message_id: message_id.to_string(),
            id: None,
            duplicate: false,
            quarantine: None,
            classification: None,
            score: None,
            completed: Vec::new(),
            failures: Vec::new(),
            draft: None,
            escalation: None,
        }
    }

    pub fn has_completed(&self, step: Step) -> bool {
        self.completed.contains(&step)
    }

    pub fn failed_at(&self, step: Step) -> bool {
        self.failures.iter().any(|f| f.step == step)
    }

    pub fn is_lead(&self) -> bool {
        self.classification.as_deref() == Some("lead")
    }
}

/// One poll of one account.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PollReport {
    pub account: String,
    pub listed: usize,
    pub processed: usize,
    pub skipped_known: usize,
    pub failed: usize,
    pub new_domains: Vec<String>,
    pub backfilled: usize,
    pub cursor_before: u32,
    pub cursor_after: u32,
    pub reports: Vec<ProcessReport>,
}

/// Result of polling one account with retries.
#[derive(Debug, Clone, Serialize)]
pub struct AccountPollResult {
    pub account: String,
    pub attempts: u32,
    pub report: Option<PollReport>,
    pub error: Option<String>,
}

impl AccountPollResult {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BackfillReport {
    pub account: String,
    pub domain: String,
    pub matched: usize,
    pub processed: usize,
    pub skipped_known: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub counts: MessageCounts,
    pub rubric: DriftReport,
}
