//! Lead lifecycle stages and the legal transitions between them.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::error::IntegrityError;

/// Prefix carried by stored stage labels.
pub const STAGE_LABEL_PREFIX: &str = "Stage/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Stage {
    New,
    Contacted,
    Qualified,
    ProposalSent,
    Negotiating,
    Booked,
    Lost,
    Archived,
}

impl Stage {
    pub const ALL: [Stage; 8] = [
        Stage::New,
        Stage::Contacted,
        Stage::Qualified,
        Stage::ProposalSent,
        Stage::Negotiating,
        Stage::Booked,
        Stage::Lost,
        Stage::Archived,
    ];

    /// Human-readable name, as written in audit rows.
    pub fn name(&self) -> &'static str {
        match self {
            Self::New => "New",
            Self::Contacted => "Contacted",
            Self::Qualified => "Qualified",
            Self::ProposalSent => "Proposal Sent",
            Self::Negotiating => "Negotiating",
            Self::Booked => "Booked",
            Self::Lost => "Lost",
            Self::Archived => "Archived",
        }
    }

    /// Stored label form, e.g. `Stage/Proposal Sent`.
    pub fn label(&self) -> String {
        format!("{STAGE_LABEL_PREFIX}{}", self.name())
    }

    /// Accepts `Stage/Proposal Sent`, `proposal_sent`, `ProposalSent`, `stage/new`.
    pub fn parse(input: &str) -> Result<Self, IntegrityError> {
        let trimmed = input.trim();
        let bare = match trimmed.get(..STAGE_LABEL_PREFIX.len()) {
            Some(head) if head.eq_ignore_ascii_case(STAGE_LABEL_PREFIX) => {
                &trimmed[STAGE_LABEL_PREFIX.len()..]
            }
            _ => trimmed,
        };
        let key: String = bare
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '_' && *c != '-')
            .flat_map(char::to_lowercase)
            .collect();

        Self::ALL
            .into_iter()
            .find(|s| s.name().replace(' ', "").to_lowercase() == key)
            .ok_or_else(|| IntegrityError::UnknownStage(input.to_string()))
    }

    /// Stages reachable in one step from `self`.
    pub fn next(&self) -> &'static [Stage] {
        use Stage::*;
        match self {
            New => &[Contacted, Lost, Archived],
            Contacted => &[Qualified, Lost, Archived],
            Qualified => &[ProposalSent, Lost, Archived],
            ProposalSent => &[Negotiating, Booked, Lost, Archived],
            Negotiating => &[Booked, Lost, Archived],
            Booked => &[Archived],
            Lost => &[New],
            Archived => &[New],
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Stage {
    type Err = IntegrityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Legal targets from `from`. A message with no stage may only enter `New`.
pub fn allowed_from(from: Option<Stage>) -> &'static [Stage] {
    match from {
        Some(stage) => stage.next(),
        None => &[Stage::New],
    }
}

pub fn is_valid_transition(from: Option<Stage>, to: Stage) -> bool {
    allowed_from(from).contains(&to)
}

/// Comma-separated names of `stages`, for error messages.
pub fn describe(stages: &[Stage]) -> String {
    stages
        .iter()
        .map(Stage::name)
        .collect::<Vec<_>>()
        .join(", ")
}
