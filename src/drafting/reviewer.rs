//! Reviewer model: an independent check of the writer's draft.
//!
//! Anything short of an explicit approval is a denial.

use std::sync::Arc;

use serde::Deserialize;
use tracing::warn;

use crate::drafting::writer::DraftContext;
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider, extract_json_object};

const REVIEWER_TEMPERATURE: f32 = 0.1;

const REVIEWER_MAX_TOKENS: u32 = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewVerdict {
    pub approved: bool,
    pub failures: Vec<String>,
}

impl ReviewVerdict {
    fn denied(reason: String) -> Self {
        Self {
            approved: false,
            failures: vec![reason],
        }
    }
}

#[derive(Deserialize)]
struct RawReview {
    approved: Option<bool>,
    #[serde(default)]
    failures: Vec<String>,
}

fn build_review_prompt(draft: &str, template: &str, ctx: &DraftContext) -> String {
    format!(
        "You are a safety reviewer for outbound business emails.\n\n\
         ORIGINAL TEMPLATE:\n{template}\n\n\
         DRAFT TO REVIEW:\n{draft}\n\n\
         INBOUND CONTEXT:\n{}\n\n\
         CHECK FOR THESE FAILURES (any one means BLOCK):\n\
         1. The draft answers questions with specific information (dates, prices, availability)\n\
         2. The draft adds commitments or promises not present in the template\n\
         3. The draft contains artifacts (system text, file paths, prompt fragments, markdown)\n\
         4. The draft significantly departs from the template's intent or structure\n\
         5. The draft contains information that was in neither the template nor the sender's email\n\
         6. The draft's tone is inappropriate (too casual, too aggressive, too formal)\n\n\
         Respond with ONLY JSON:\n\
         {{ \"approved\": true or false, \"failures\": [\"description of each failure\"] }}",
        ctx.body_preview
    )
}

/// Parse a reviewer reply. A missing or non-boolean `approved` is a denial.
pub fn parse_review(content: &str) -> ReviewVerdict {
    let Some(json) = extract_json_object(content) else {
        return ReviewVerdict::denied("reviewer returned no JSON".into());
    };
    match serde_json::from_str::<RawReview>(&json) {
        Ok(RawReview {
            approved: Some(true),
            failures,
        }) if failures.is_empty() => ReviewVerdict {
            approved: true,
            failures,
        },
        Ok(RawReview {
            approved: Some(true),
            failures,
        }) => ReviewVerdict {
            // Approval that lists failures is contradictory.
            approved: false,
            failures,
        },
        Ok(RawReview {
            approved: Some(false),
            failures,
        }) if !failures.is_empty() => ReviewVerdict {
            approved: false,
            failures,
        },
        Ok(RawReview {
            approved: Some(false),
            ..
        }) => ReviewVerdict::denied("reviewer denied without reasons".into()),
        Ok(RawReview { approved: None, .. }) => {
            ReviewVerdict::denied("reviewer response missing `approved`".into())
        }
        Err(e) => ReviewVerdict::denied(format!("reviewer response malformed: {e}")),
    }
}

pub struct DraftReviewer {
    llm: Arc<dyn LlmProvider>,
    model: String,
}

impl DraftReviewer {
    pub fn new(llm: Arc<dyn LlmProvider>, model: impl Into<String>) -> Self {
        Self {
            llm,
            model: model.into(),
        }
    }

    pub async fn review(&self, draft: &str, template: &str, ctx: &DraftContext) -> ReviewVerdict {
        let request = CompletionRequest::new(vec![ChatMessage::user(build_review_prompt(
            draft, template, ctx,
        ))])
        .with_model(&self.model)
        .with_temperature(REVIEWER_TEMPERATURE)
        .with_max_tokens(REVIEWER_MAX_TOKENS);

        match self.llm.complete(request).await {
            Ok(response) => parse_review(&response.content),
            Err(e) => {
                warn!(model = %self.model, error = %e, "Reviewer call failed, denying draft");
                ReviewVerdict::denied(format!("reviewer unavailable: {e}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::scripted::ScriptedLlm;

    fn ctx() -> DraftContext {
        DraftContext {
            from_name: None,
            from_email: "a@b.test".into(),
            subject: "s".into(),
            body_preview: "When are you free in June?".into(),
            score: Some(70),
            bucket: "high".into(),
        }
    }

    #[test]
    fn only_explicit_approval_passes() {
        assert!(parse_review(r#"{"approved": true, "failures": []}"#).approved);
        assert!(parse_review(r#"{"approved": true}"#).approved);

        for denial in [
            r#"{"approved": false, "failures": ["quotes a date"]}"#,
            r#"{"approved": false}"#,
            r#"{"failures": []}"#,
            r#"{"approved": "yes"}"#,
            r#"{"approved": true, "failures": ["adds a promise"]}"#,
            "looks fine to me",
        ] {
            let verdict = parse_review(denial);
            assert!(!verdict.approved, "{denial}");
            assert!(!verdict.failures.is_empty(), "{denial}");
        }
    }

    #[tokio::test]
    async fn review_includes_all_six_categories() {
        let llm = Arc::new(ScriptedLlm::new().reply("reviewer", r#"{"approved": true}"#));
        let reviewer = DraftReviewer::new(llm.clone(), "reviewer");
        assert!(reviewer.review("draft", "template", &ctx()).await.approved);

        let requests = llm.requests.lock().unwrap();
        let prompt = &requests[0].messages[0].content;
        for n in 1..=6 {
            assert!(prompt.contains(&format!("{n}. ")), "category {n}");
        }
        assert!(prompt.contains("When are you free in June?"));
        assert_eq!(requests[0].temperature, Some(0.1));
    }

    #[tokio::test]
    async fn call_failure_is_denial() {
        let reviewer = DraftReviewer::new(Arc::new(ScriptedLlm::new().fail("reviewer")), "reviewer");
        let verdict = reviewer.review("d", "t", &ctx()).await;
        assert!(!verdict.approved);
        assert!(verdict.failures[0].contains("reviewer unavailable"));
    }
}
