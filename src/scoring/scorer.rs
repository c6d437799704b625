//! LLM lead scoring against the rubric, with strict response validation.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{DatabaseError, Error, ValidationError};
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider, extract_json_object};
use crate::scoring::rubric::Rubric;
use crate::store::{Database, NewScoringLog, ScoreUpdate, StoredMessage};

const COMPONENT: &str = "scorer";

const SCORING_TEMPERATURE: f32 = 0.2;

const SCORING_MAX_TOKENS: u32 = 1200;

/// Body characters sent to the scoring model.
const SCORING_BODY_CHARS: usize = 6000;

pub const CLASSIFICATIONS: &[&str] = &[
    "lead",
    "vendor_outreach",
    "newsletter",
    "personal",
    "automated",
    "spam",
    "other",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Bucket {
    Exceptional,
    High,
    Medium,
    Low,
    Spam,
}

impl Bucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exceptional => "exceptional",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
            Self::Spam => "spam",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "exceptional" => Some(Self::Exceptional),
            "high" => Some(Self::High),
            "medium" => Some(Self::Medium),
            "low" => Some(Self::Low),
            "spam" => Some(Self::Spam),
            _ => None,
        }
    }

    /// Capitalized form used in labels: `Exceptional`, `High`, ...
    pub fn title(&self) -> &'static str {
        match self {
            Self::Exceptional => "Exceptional",
            Self::High => "High",
            Self::Medium => "Medium",
            Self::Low => "Low",
            Self::Spam => "Spam",
        }
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DimensionScore {
    pub score: u8,
    pub reasoning: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Dimensions {
    pub fit: DimensionScore,
    pub clarity: DimensionScore,
    pub budget: DimensionScore,
    pub trust: DimensionScore,
    pub timeline: DimensionScore,
}

/// The parts of a message the scorer reads.
#[derive(Debug, Clone)]
pub struct ScoringInput<'a> {
    pub from_email: &'a str,
    pub from_name: Option<&'a str>,
    pub subject: &'a str,
    pub body_text: &'a str,
}

impl<'a> ScoringInput<'a> {
    pub fn from_message(msg: &'a StoredMessage) -> Self {
        Self {
            from_email: &msg.from_email,
            from_name: msg.from_name.as_deref(),
            subject: &msg.subject,
            body_text: &msg.body_text,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreResult {
    pub is_lead: bool,
    pub classification: String,
    pub classification_label: Option<String>,
    pub dimensions: Option<Dimensions>,
    pub weighted_total: Option<f64>,
    /// `round(weighted_total)` for leads.
    pub score: Option<i64>,
    pub bucket: Option<Bucket>,
    pub flags: Vec<String>,
    pub rubric_version: String,
    #[serde(skip)]
    pub raw_output: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriftReport {
    pub drift: bool,
    pub stale_count: i64,
    pub stale_message_ids: Vec<i64>,
    pub current_version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RescoreSummary {
    pub attempted: usize,
    pub rescored: usize,
    pub failed: usize,
}

// Wire shape. Every field optional so that absence is reported precisely
// rather than as a generic deserialization failure.
#[derive(Debug, Deserialize)]
struct RawScore {
    is_lead: Option<bool>,
    classification: Option<String>,
    classification_label: Option<String>,
    dimensions: Option<RawDimensions>,
    weighted_total: Option<f64>,
    bucket: Option<String>,
    flags: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct RawDimensions {
    fit: Option<RawDimension>,
    clarity: Option<RawDimension>,
    budget: Option<RawDimension>,
    trust: Option<RawDimension>,
    timeline: Option<RawDimension>,
}

#[derive(Debug, Deserialize)]
struct RawDimension {
    score: Option<f64>,
    reasoning: Option<String>,
}

fn malformed(reason: impl Into<String>) -> ValidationError {
    ValidationError::MalformedResponse {
        component: COMPONENT.into(),
        reason: reason.into(),
    }
}

fn missing(field: &str) -> ValidationError {
    ValidationError::MissingField {
        component: COMPONENT.into(),
        field: field.into(),
    }
}

fn out_of_range(field: &str, value: impl fmt::Display) -> ValidationError {
    ValidationError::OutOfRange {
        component: COMPONENT.into(),
        field: field.into(),
        value: value.to_string(),
    }
}

fn check_percent(field: &str, value: f64) -> Result<f64, ValidationError> {
    if !value.is_finite() || !(0.0..=100.0).contains(&value) {
        return Err(out_of_range(field, value));
    }
    Ok(value)
}

fn validate_dimension(
    name: &str,
    raw: Option<RawDimension>,
) -> Result<DimensionScore, ValidationError> {
    let field = format!("dimensions.{name}");
    let raw = raw.ok_or_else(|| missing(&field))?;
    let score = raw.score.ok_or_else(|| missing(&format!("{field}.score")))?;
    let score = check_percent(&format!("{field}.score"), score)?;
    Ok(DimensionScore {
        score: score.round() as u8,
        reasoning: raw.reasoning.unwrap_or_default(),
    })
}

/// Parse and validate a scoring response. There are no defaults for required fields.
pub fn parse_score_response(
    content: &str,
    rubric_version: &str,
) -> Result<ScoreResult, ValidationError> {
    let json = extract_json_object(content).ok_or_else(|| malformed("no JSON object in response"))?;
    let raw: RawScore =
        serde_json::from_str(&json).map_err(|e| malformed(format!("invalid JSON: {e}")))?;

    let is_lead = raw.is_lead.ok_or_else(|| missing("is_lead"))?;
    let classification = raw
        .classification
        .map(|c| c.trim().to_ascii_lowercase())
        .filter(|c| !c.is_empty())
        .ok_or_else(|| missing("classification"))?;
    if !CLASSIFICATIONS.contains(&classification.as_str()) {
        return Err(out_of_range("classification", &classification));
    }
    if is_lead != (classification == "lead") {
        return Err(malformed(format!(
            "is_lead={is_lead} contradicts classification `{classification}`"
        )));
    }
    let classification_label = raw
        .classification_label
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty());
    let flags = raw.flags.unwrap_or_default();

    if !is_lead {
        return Ok(ScoreResult {
            is_lead,
            classification,
            classification_label,
            dimensions: None,
            weighted_total: None,
            score: None,
            bucket: None,
            flags,
            rubric_version: rubric_version.to_string(),
            raw_output: content.to_string(),
        });
    }

    let dims = raw.dimensions.ok_or_else(|| missing("dimensions"))?;
    let dimensions = Dimensions {
        fit: validate_dimension("fit", dims.fit)?,
        clarity: validate_dimension("clarity", dims.clarity)?,
        budget: validate_dimension("budget", dims.budget)?,
        trust: validate_dimension("trust", dims.trust)?,
        timeline: validate_dimension("timeline", dims.timeline)?,
    };
    let weighted_total = raw.weighted_total.ok_or_else(|| missing("weighted_total"))?;
    let weighted_total = check_percent("weighted_total", weighted_total)?;
    let bucket_raw = raw.bucket.ok_or_else(|| missing("bucket"))?;
    let bucket = Bucket::parse(&bucket_raw).ok_or_else(|| out_of_range("bucket", &bucket_raw))?;

    Ok(ScoreResult {
        is_lead,
        classification,
        classification_label,
        dimensions: Some(dimensions),
        weighted_total: Some(weighted_total),
        score: Some(weighted_total.round() as i64),
        bucket: Some(bucket),
        flags,
        rubric_version: rubric_version.to_string(),
        raw_output: content.to_string(),
    })
}

const RESPONSE_SCHEMA: &str = r#"Score the following email. Return ONLY valid JSON:
{
  "is_lead": true or false,
  "classification": "lead" | "vendor_outreach" | "newsletter" | "personal" | "automated" | "spam" | "other",
  "classification_label": "short descriptive label if not a lead",
  "dimensions": {
    "fit": { "score": 0-100, "reasoning": "..." },
    "clarity": { "score": 0-100, "reasoning": "..." },
    "budget": { "score": 0-100, "reasoning": "..." },
    "trust": { "score": 0-100, "reasoning": "..." },
    "timeline": { "score": 0-100, "reasoning": "..." }
  },
  "weighted_total": 0-100,
  "bucket": "exceptional" | "high" | "medium" | "low" | "spam",
  "flags": ["..."]
}
"dimensions", "weighted_total" and "bucket" are required when is_lead is true.
"is_lead" is true exactly when "classification" is "lead"."#;

fn build_user_prompt(input: &ScoringInput<'_>) -> String {
    let body: String = input.body_text.chars().take(SCORING_BODY_CHARS).collect();
    format!(
        "{RESPONSE_SCHEMA}\n\nEmail:\nFrom: {} <{}>\nSubject: {}\nBody:\n{}",
        input.from_name.unwrap_or(""),
        input.from_email,
        if input.subject.is_empty() { "(no subject)" } else { input.subject },
        body
    )
}

pub struct LeadScorer {
    llm: Arc<dyn LlmProvider>,
    model: String,
    rubric: Rubric,
}

impl LeadScorer {
    pub fn new(llm: Arc<dyn LlmProvider>, model: impl Into<String>, rubric: Rubric) -> Self {
        Self {
            llm,
            model: model.into(),
            rubric,
        }
    }

    pub fn rubric_version(&self) -> &str {
        self.rubric.version()
    }

    pub async fn score(&self, input: &ScoringInput<'_>) -> Result<ScoreResult, Error> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(self.rubric.text()),
            ChatMessage::user(build_user_prompt(input)),
        ])
        .with_model(&self.model)
        .with_temperature(SCORING_TEMPERATURE)
        .with_max_tokens(SCORING_MAX_TOKENS);

        let response = self.llm.complete(request).await?;
        let result = parse_score_response(&response.content, self.rubric.version())?;
        debug!(
            from = %input.from_email,
            classification = %result.classification,
            score = ?result.score,
            "Scored message"
        );
        Ok(result)
    }

    /// Write the score onto the message and append a scoring-log row.
    pub async fn record(
        &self,
        db: &dyn Database,
        message_id: i64,
        result: &ScoreResult,
    ) -> Result<(), DatabaseError> {
        db.set_score(
            message_id,
            &ScoreUpdate {
                classification: result.classification.clone(),
                classification_label: result.classification_label.clone(),
                score: result.score,
                bucket: result.bucket.map(|b| b.as_str().to_string()),
            },
        )
        .await?;

        let dimensions = match &result.dimensions {
            Some(d) => serde_json::to_value(d)
                .map_err(|e| DatabaseError::Serialization(e.to_string()))?,
            None => serde_json::Value::Null,
        };
        db.append_scoring_log(&NewScoringLog {
            message_id,
            rubric_version: result.rubric_version.clone(),
            dimensions,
            flags: serde_json::json!(result.flags),
            raw_output: result.raw_output.clone(),
        })
        .await?;
        Ok(())
    }

    pub async fn check_drift(&self, db: &dyn Database) -> Result<DriftReport, DatabaseError> {
        check_drift(db, self.rubric.version()).await
    }

    /// Rescore clean messages: those received since `since`, or, when unset,
    /// those last scored under a different rubric version.
    pub async fn rescore(
        &self,
        db: &dyn Database,
        since: Option<DateTime<Utc>>,
    ) -> Result<RescoreSummary, DatabaseError> {
        let targets: Vec<StoredMessage> = match since {
            Some(_) => db.clean_messages_since(since).await?,
            None => {
                let mut out = Vec::new();
                for id in db.stale_scored_messages(self.rubric.version()).await? {
                    if let Some(msg) = db.get_message(id).await?
                        && msg.quarantine_status == crate::store::QuarantineStatus::Clean
                    {
                        out.push(msg);
                    }
                }
                out
            }
        };

        info!(count = targets.len(), version = %self.rubric.version(), "Rescore started");
        let mut summary = RescoreSummary {
            attempted: targets.len(),
            ..Default::default()
        };

        for msg in &targets {
            match self.score(&ScoringInput::from_message(msg)).await {
                Ok(result) => {
                    self.record(db, msg.id, &result).await?;
                    summary.rescored += 1;
                    info!(
                        message_id = msg.id,
                        classification = %result.classification,
                        score = ?result.score,
                        "Message rescored"
                    );
                }
                Err(e) => {
                    summary.failed += 1;
                    warn!(message_id = msg.id, error = %e, "Rescore failed");
                }
            }
        }

        info!(rescored = summary.rescored, failed = summary.failed, "Rescore complete");
        Ok(summary)
    }
}

/// Compare stored scores against `current` rubric version.
pub async fn check_drift(db: &dyn Database, current: &str) -> Result<DriftReport, DatabaseError> {
    let stale_count = db.count_stale_scoring_rows(current).await?;
    let stale_message_ids = db.stale_scored_messages(current).await?;
    // Historical rows stay stale forever; drift clears once every
    // message's latest score uses the current rubric.
    let drift = !stale_message_ids.is_empty();
    if drift {
        warn!(
            current_version = %current,
            stale_rows = stale_count,
            stale_messages = stale_message_ids.len(),
            "Rubric drift detected; run `rescore` to update scores"
        );
    }
    Ok(DriftReport {
        drift,
        stale_count,
        stale_message_ids,
        current_version: current.to_string(),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::llm::scripted::ScriptedLlm;
    use crate::store::libsql_backend::tests::new_message;
    use crate::store::{InsertOutcome, LibSqlBackend};

    pub(crate) const LEAD_JSON: &str = r#"{
        "is_lead": true,
        "classification": "lead",
        "dimensions": {
            "fit": {"score": 90, "reasoning": "wedding photography"},
            "clarity": {"score": 80, "reasoning": "clear ask"},
            "budget": {"score": 85, "reasoning": "stated"},
            "trust": {"score": 70, "reasoning": "real domain"},
            "timeline": {"score": 75, "reasoning": "next spring"}
        },
        "weighted_total": 82.6,
        "bucket": "high",
        "flags": ["budget_stated"]
    }"#;

    pub(crate) const NEWSLETTER_JSON: &str = r#"{"is_lead": false, "classification": "newsletter", "classification_label": "Weekly digest"}"#;

    async fn db_with(ids: &[&str]) -> (Arc<dyn Database>, Vec<i64>) {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        db.run_migrations().await.unwrap();
        let mut rows = Vec::new();
        for id in ids {
            match db.insert_message(&new_message(id, "acme.test")).await.unwrap() {
                InsertOutcome::Inserted(row) => rows.push(row),
                InsertOutcome::Duplicate(_) => panic!("duplicate"),
            }
        }
        (db, rows)
    }

    fn input() -> ScoringInput<'static> {
        ScoringInput {
            from_email: "jane@acme.test",
            from_name: Some("Jane"),
            subject: "Wedding in May",
            body_text: "We'd love a quote.",
        }
    }

    #[test]
    fn lead_response_is_validated_and_rounded() {
        let result = parse_score_response(LEAD_JSON, "v1").unwrap();
        assert!(result.is_lead);
        assert_eq!(result.score, Some(83));
        assert_eq!(result.bucket, Some(Bucket::High));
        assert_eq!(result.dimensions.as_ref().unwrap().fit.score, 90);
        assert_eq!(result.flags, vec!["budget_stated".to_string()]);
    }

    #[test]
    fn non_lead_needs_no_dimensions() {
        let result = parse_score_response(NEWSLETTER_JSON, "v1").unwrap();
        assert!(!result.is_lead);
        assert_eq!(result.score, None);
        assert_eq!(result.bucket, None);
        assert_eq!(result.classification_label.as_deref(), Some("Weekly digest"));
    }

    #[test]
    fn fenced_response_is_accepted() {
        let fenced = format!("Here you go:\n```json\n{NEWSLETTER_JSON}\n```");
        assert!(parse_score_response(&fenced, "v1").is_ok());
    }

    #[test]
    fn violations_are_rejected_without_defaults() {
        let cases = [
            ("not json at all", "malformed"),
            (r#"{"classification": "lead"}"#, "is_lead"),
            (r#"{"is_lead": false}"#, "classification"),
            (r#"{"is_lead": false, "classification": "cold_call"}"#, "classification"),
            (r#"{"is_lead": true, "classification": "newsletter"}"#, "contradicts"),
            (r#"{"is_lead": true, "classification": "lead", "weighted_total": 50, "bucket": "low"}"#, "dimensions"),
            (r#"{"is_lead": "yes", "classification": "lead"}"#, "invalid JSON"),
        ];
        for (body, needle) in cases {
            let err = parse_score_response(body, "v1").unwrap_err();
            assert!(err.to_string().contains(needle), "{body}: {err}");
        }

        let no_total = LEAD_JSON.replace("\"weighted_total\": 82.6,", "");
        assert!(matches!(
            parse_score_response(&no_total, "v1"),
            Err(ValidationError::MissingField { field, .. }) if field == "weighted_total"
        ));

        let bad_bucket = LEAD_JSON.replace("\"high\"", "\"lukewarm\"");
        assert!(matches!(
            parse_score_response(&bad_bucket, "v1"),
            Err(ValidationError::OutOfRange { field, .. }) if field == "bucket"
        ));

        let over = LEAD_JSON.replace("\"score\": 90", "\"score\": 140");
        assert!(matches!(
            parse_score_response(&over, "v1"),
            Err(ValidationError::OutOfRange { field, .. }) if field == "dimensions.fit.score"
        ));

        let no_trust = LEAD_JSON.replace(
            r#""trust": {"score": 70, "reasoning": "real domain"},"#,
            "",
        );
        assert!(matches!(
            parse_score_response(&no_trust, "v1"),
            Err(ValidationError::MissingField { field, .. }) if field == "dimensions.trust"
        ));
    }

    #[tokio::test]
    async fn score_uses_rubric_as_system_prompt() {
        let llm = Arc::new(ScriptedLlm::new().reply("scoring-model", LEAD_JSON));
        let scorer = LeadScorer::new(llm.clone(), "scoring-model", Rubric::from_text("RUBRIC TEXT"));
        let result = scorer.score(&input()).await.unwrap();
        assert_eq!(result.rubric_version, Rubric::from_text("RUBRIC TEXT").version());

        let requests = llm.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].messages[0].content, "RUBRIC TEXT");
        assert_eq!(requests[0].temperature, Some(0.2));
        assert!(requests[0].messages[1].content.contains("Wedding in May"));
    }

    #[tokio::test]
    async fn score_surfaces_llm_failure() {
        let llm = Arc::new(ScriptedLlm::new().fail("scoring-model"));
        let scorer = LeadScorer::new(llm, "scoring-model", Rubric::from_text("r"));
        assert!(matches!(scorer.score(&input()).await, Err(Error::Llm(_))));
    }

    #[tokio::test]
    async fn record_writes_score_and_log_for_leads_and_non_leads() {
        let (db, ids) = db_with(&["<a@x>", "<b@x>"]).await;
        let scorer = LeadScorer::new(Arc::new(ScriptedLlm::new()), "m", Rubric::from_text("r"));

        let lead = parse_score_response(LEAD_JSON, scorer.rubric_version()).unwrap();
        scorer.record(db.as_ref(), ids[0], &lead).await.unwrap();
        let news = parse_score_response(NEWSLETTER_JSON, scorer.rubric_version()).unwrap();
        scorer.record(db.as_ref(), ids[1], &news).await.unwrap();

        let stored = db.get_message(ids[0]).await.unwrap().unwrap();
        assert_eq!(stored.score, Some(83));
        assert_eq!(stored.score_bucket.as_deref(), Some("high"));
        assert!(stored.is_lead());

        let log = db.latest_scoring_log(ids[1]).await.unwrap().unwrap();
        assert_eq!(log.rubric_version, scorer.rubric_version());
        let stored = db.get_message(ids[1]).await.unwrap().unwrap();
        assert_eq!(stored.classification.as_deref(), Some("newsletter"));
        assert_eq!(stored.score, None);
    }

    #[tokio::test]
    async fn drift_detected_after_rubric_edit() {
        let (db, ids) = db_with(&["<a@x>"]).await;
        let old = LeadScorer::new(Arc::new(ScriptedLlm::new()), "m", Rubric::from_text("v1"));
        let result = parse_score_response(LEAD_JSON, old.rubric_version()).unwrap();
        old.record(db.as_ref(), ids[0], &result).await.unwrap();

        let report = old.check_drift(db.as_ref()).await.unwrap();
        assert!(!report.drift);

        let edited = LeadScorer::new(Arc::new(ScriptedLlm::new()), "m", Rubric::from_text("v2"));
        let report = edited.check_drift(db.as_ref()).await.unwrap();
        assert!(report.drift);
        assert_eq!(report.stale_count, 1);
        assert_eq!(report.stale_message_ids, ids);
        assert_eq!(report.current_version, edited.rubric_version());
    }

    #[tokio::test]
    async fn rescore_clears_drift_and_counts_failures() {
        let (db, ids) = db_with(&["<a@x>", "<b@x>"]).await;
        let old = LeadScorer::new(Arc::new(ScriptedLlm::new()), "m", Rubric::from_text("v1"));
        for id in &ids {
            let result = parse_score_response(LEAD_JSON, old.rubric_version()).unwrap();
            old.record(db.as_ref(), *id, &result).await.unwrap();
        }

        // First call succeeds, every later call is malformed.
        let llm = Arc::new(
            ScriptedLlm::new()
                .reply("m", NEWSLETTER_JSON)
                .reply("m", "garbage"),
        );
        let edited = LeadScorer::new(llm, "m", Rubric::from_text("v2"));
        let summary = edited.rescore(db.as_ref(), None).await.unwrap();
        assert_eq!(summary.attempted, 2);
        assert_eq!(summary.rescored, 1);
        assert_eq!(summary.failed, 1);

        let report = edited.check_drift(db.as_ref()).await.unwrap();
        assert_eq!(report.stale_message_ids.len(), 1);
        assert!(report.drift);
        assert_eq!(report.stale_count, 2);
    }

    #[tokio::test]
    async fn rescore_since_targets_received_window() {
        let (db, _ids) = db_with(&["<a@x>"]).await;
        let llm = Arc::new(ScriptedLlm::new().reply("m", NEWSLETTER_JSON));
        let scorer = LeadScorer::new(llm, "m", Rubric::from_text("r"));

        let future = Utc::now() + chrono::Duration::days(1);
        let none = scorer.rescore(db.as_ref(), Some(future)).await.unwrap();
        assert_eq!(none.attempted, 0);

        let past = Utc::now() - chrono::Duration::days(365);
        let all = scorer.rescore(db.as_ref(), Some(past)).await.unwrap();
        assert_eq!(all.attempted, 1);
        assert_eq!(all.rescored, 1);
    }
}
