//! Deterministic content gate, the last check on outbound text.
//!
//! Every rule is a compiled regex. Any match blocks the draft.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use tracing::debug;

/// A single blocking rule.
#[derive(Debug, Clone)]
pub struct GateRule {
    /// Reason code reported when the rule matches.
    pub name: String,
    pub regex: Regex,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GateResult {
    pub passed: bool,
    pub blocked_reasons: Vec<String>,
}

pub struct ContentGate {
    rules: Vec<GateRule>,
}

static DEFAULT_RULES: LazyLock<Vec<GateRule>> = LazyLock::new(|| {
    let rule = |name: &str, pattern: &str| GateRule {
        name: name.into(),
        regex: Regex::new(pattern).expect("gate regex"),
    };
    vec![
        rule("internal_path", r"(?i)/Users/|/Volumes/|/workspace/"),
        rule("api_key", r"(?i)(?:sk|pk|api|key|token)[-_]\w{20,}"),
        // Prices are never quoted in automated replies
        rule("dollar_amount", r"\$[\d,]+(?:\.\d{2})?"),
        rule(
            "prompt_artifact",
            r"(?i)\[INST\]|\[/INST\]|<\|im_start\|>|<\|system\|>",
        ),
        rule("markdown_artifact", r"(?m)^#{1,3}\s|```|^\|.*\|$"),
        rule(
            "debug_text",
            r"(?i)TODO|FIXME|DEBUG|console\.log|function\s+\w+\(",
        ),
    ]
});

impl ContentGate {
    /// The built-in rule set. Patterns are compiled once per process.
    pub fn default_rules() -> Self {
        Self {
            rules: DEFAULT_RULES.clone(),
        }
    }

    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn add_rule(&mut self, name: &str, pattern: &str) -> Result<(), regex::Error> {
        self.rules.push(GateRule {
            name: name.into(),
            regex: Regex::new(pattern)?,
        });
        Ok(())
    }

    pub fn check(&self, draft: &str) -> GateResult {
        let blocked_reasons: Vec<String> = self
            .rules
            .iter()
            .filter(|r| r.regex.is_match(draft))
            .map(|r| r.name.clone())
            .collect();
        if !blocked_reasons.is_empty() {
            debug!(reasons = ?blocked_reasons, "Content gate blocked draft");
        }
        GateResult {
            passed: blocked_reasons.is_empty(),
            blocked_reasons,
        }
    }
}

static DEFAULT_GATE: LazyLock<ContentGate> = LazyLock::new(ContentGate::default_rules);

/// Check `draft` against the default rules.
pub fn content_gate(draft: &str) -> GateResult {
    DEFAULT_GATE.check(draft)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reasons(text: &str) -> Vec<String> {
        content_gate(text).blocked_reasons
    }

    #[test]
    fn clean_reply_passes() {
        let result = content_gate(
            "Hi Jane,\n\nThank you so much for reaching out about your wedding. \
             I'd love to hear more about your plans. Could we set up a short call?\n\nBest,\nSam",
        );
        assert!(result.passed);
        assert!(result.blocked_reasons.is_empty());
    }

    #[test]
    fn default_gates_share_compiled_rules_but_not_additions() {
        let mut custom = ContentGate::default_rules();
        custom.add_rule("competitor", r"(?i)acme photo").unwrap();
        let stock = ContentGate::default_rules();
        assert_eq!(stock.rules.len(), DEFAULT_RULES.len());
        assert_eq!(custom.rules.len(), DEFAULT_RULES.len() + 1);
        assert!(stock.check("Try Acme Photo instead").passed);
        assert!(!custom.check("Try Acme Photo instead").passed);
    }

    #[test]
    fn each_rule_fires() {
        assert_eq!(reasons("Our rate is $1,234.56 per day."), vec!["dollar_amount"]);
        assert_eq!(reasons("See $500"), vec!["dollar_amount"]);
        assert_eq!(reasons("saved at /Users/alice/secret"), vec!["internal_path"]);
        assert_eq!(reasons("mounted on /Volumes/Backup"), vec!["internal_path"]);
        assert_eq!(
            reasons("use sk-abcdefghijklmnopqrstuvwxyz123"),
            vec!["api_key"]
        );
        assert_eq!(
            reasons("token_ABCDEFGHIJ0123456789xyz"),
            vec!["api_key"]
        );
        assert_eq!(reasons("[INST] be nice [/INST]"), vec!["prompt_artifact"]);
        assert_eq!(reasons("<|im_start|>assistant"), vec!["prompt_artifact"]);
        assert_eq!(reasons("## Summary\nHello"), vec!["markdown_artifact"]);
        assert_eq!(reasons("Hello\n| a | b |\nBye"), vec!["markdown_artifact"]);
        assert_eq!(reasons("```\ncode\n```"), vec!["markdown_artifact"]);
        assert_eq!(reasons("TODO: personalize"), vec!["debug_text"]);
        assert_eq!(reasons("console.log(x)"), vec!["debug_text"]);
    }

    #[test]
    fn multiple_reasons_are_all_reported() {
        let r = reasons("# Quote\nTotal $99 TODO");
        assert_eq!(r, vec!["dollar_amount", "markdown_artifact", "debug_text"]);
    }

    #[test]
    fn near_misses_pass() {
        for text in [
            "We charge in dollars, happy to discuss.",
            "The #1 studio in town",
            "Short key-abc is fine",
            "Pricing depends on the package.",
        ] {
            assert!(content_gate(text).passed, "{text} should pass");
        }
    }

    #[test]
    fn custom_rules() {
        let mut gate = ContentGate::empty();
        assert!(gate.check("anything $5").passed);
        gate.add_rule("competitor", r"(?i)\bacme\b").unwrap();
        assert_eq!(gate.check("Unlike ACME, we...").blocked_reasons, vec!["competitor"]);
        assert!(gate.add_rule("bad", "(").is_err());
    }
}
