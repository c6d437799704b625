//! Poll loop and per-message sequencing.
//!
//! Every collaborator arrives through [`PipelineServices`]; nothing is looked
//! up globally. The poll cursor only moves after a batch completes, and never
//! past the first UID that failed, so delivery is at-least-once.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::Mutex;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::config::{AccountConfig, PipelineConfig};
use crate::drafting::{Drafter, DraftReviewer, DraftWriter, TemplateStore};
use crate::error::{DatabaseError, LlmError, MailError, PipelineError, ValidationError};
use crate::escalation::{Escalator, NoopNotifier, NoopTaskSink, Notifier, TaskSink, alert};
use crate::leads::{StageSystemOfRecord, StageTracker, apply_score_label, initialize_stage};
use crate::llm::LlmProvider;
use crate::mail::{MailSource, RawMail};
use crate::pipeline::backoff::{BackoffPolicy, Sleeper, TokioSleeper};
use crate::pipeline::types::{
    AccountPollResult, BackfillReport, PipelineStats, PollReport, ProcessReport, Step,
    StepFailure,
};
use crate::quarantine::{Quarantine, ThreatScanner};
use crate::research::{DomainResearcher, HttpFetcher, PageFetcher, Resolver, SystemResolver};
use crate::scoring::{LeadScorer, Rubric, ScoringInput, check_drift};
use crate::store::{Database, InsertOutcome, NewMessage, PollCursor, QuarantineStatus, StoredMessage};

/// `recent_messages` never returns more than this.
pub const RECENT_LIMIT: usize = 50;

/// External collaborators of the orchestrator.
pub struct PipelineServices {
    pub db: Arc<dyn Database>,
    pub mail: Arc<dyn MailSource>,
    pub llm: Arc<dyn LlmProvider>,
    pub notifier: Arc<dyn Notifier>,
    pub tasks: Arc<dyn TaskSink>,
    pub stage_crm: Option<Arc<dyn StageSystemOfRecord>>,
    pub resolver: Arc<dyn Resolver>,
    pub fetcher: Arc<dyn PageFetcher>,
    pub sleeper: Arc<dyn Sleeper>,
}

impl PipelineServices {
    /// Production defaults for everything but storage, mail, and the model:
    /// no-op escalation channels, system DNS, HTTPS fetch, real sleeps.
    pub fn new(
        db: Arc<dyn Database>,
        mail: Arc<dyn MailSource>,
        llm: Arc<dyn LlmProvider>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            db,
            mail,
            llm,
            notifier: Arc::new(NoopNotifier),
            tasks: Arc::new(NoopTaskSink),
            stage_crm: None,
            resolver: Arc::new(SystemResolver),
            fetcher: Arc::new(HttpFetcher::new(
                config.research.fetch_timeout(),
                config.research.max_page_size_kb,
            )),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_tasks(mut self, tasks: Arc<dyn TaskSink>) -> Self {
        self.tasks = tasks;
        self
    }

    pub fn with_stage_crm(mut self, crm: Arc<dyn StageSystemOfRecord>) -> Self {
        self.stage_crm = Some(crm);
        self
    }

    pub fn with_research(mut self, resolver: Arc<dyn Resolver>, fetcher: Arc<dyn PageFetcher>) -> Self {
        self.resolver = resolver;
        self.fetcher = fetcher;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }
}

pub struct Orchestrator {
    config: PipelineConfig,
    db: Arc<dyn Database>,
    mail: Arc<dyn MailSource>,
    notifier: Arc<dyn Notifier>,
    sleeper: Arc<dyn Sleeper>,
    backoff: BackoffPolicy,
    quarantine: Quarantine,
    scorer: LeadScorer,
    tracker: StageTracker,
    researcher: DomainResearcher,
    drafter: Drafter,
    escalator: Escalator,
    /// Consecutive exhausted polls per account.
    failures: Mutex<HashMap<String, u32>>,
}

impl Orchestrator {
    pub fn new(
        config: PipelineConfig,
        services: PipelineServices,
        rubric: Rubric,
        templates: TemplateStore,
    ) -> Self {
        let PipelineServices {
            db,
            mail,
            llm,
            notifier,
            tasks,
            stage_crm,
            resolver,
            fetcher,
            sleeper,
        } = services;

        let quarantine = Quarantine::new(ThreatScanner::new(
            llm.clone(),
            &config.quarantine.scanner_model,
            config.quarantine.fail_closed,
        ));
        let scorer = LeadScorer::new(llm.clone(), &config.scoring.model, rubric);
        let mut tracker = StageTracker::new(db.clone());
        if let Some(crm) = stage_crm {
            tracker = tracker.with_system_of_record(crm);
        }
        let researcher =
            DomainResearcher::new(db.clone(), resolver, fetcher, config.research.cache_days);
        let drafter = Drafter::new(
            db.clone(),
            templates,
            DraftWriter::new(llm.clone(), &config.drafting.writer_model),
            DraftReviewer::new(llm, &config.drafting.reviewer_model),
        );
        let escalator = Escalator::new(db.clone(), notifier.clone(), tasks);

        Self {
            backoff: BackoffPolicy::from_config(&config.polling),
            config,
            db,
            mail,
            notifier,
            sleeper,
            quarantine,
            scorer,
            tracker,
            researcher,
            drafter,
            escalator,
            failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn db(&self) -> &Arc<dyn Database> {
        &self.db
    }

    pub fn scorer(&self) -> &LeadScorer {
        &self.scorer
    }

    pub fn tracker(&self) -> &StageTracker {
        &self.tracker
    }

    pub fn researcher(&self) -> &DomainResearcher {
        &self.researcher
    }

    pub fn drafter(&self) -> &Drafter {
        &self.drafter
    }

    pub fn escalator(&self) -> &Escalator {
        &self.escalator
    }

    fn account(&self, id: &str) -> Result<&AccountConfig, PipelineError> {
        self.config
            .account(id)
            .ok_or_else(|| MailError::UnknownAccount(id.to_string()).into())
    }

    /// Consecutive exhausted polls for `account`.
    pub async fn failure_count(&self, account: &str) -> u32 {
        self.failures.lock().await.get(account).copied().unwrap_or(0)
    }

    // ── Polling ─────────────────────────────────────────────────────

    pub async fn poll_account(&self, account_id: &str) -> Result<PollReport, PipelineError> {
        let account = self.account(account_id)?;
        let cursor = self
            .db
            .get_cursor(account_id)
            .await?
            .map_or(0, |c| c.last_seen_uid);

        let envelopes = self
            .mail
            .list_envelopes(account_id, &account.folder, cursor)
            .await?;
        let mut report = PollReport {
            account: account_id.to_string(),
            listed: envelopes.len(),
            cursor_before: cursor,
            cursor_after: cursor,
            ..Default::default()
        };
        info!(account = account_id, cursor, listed = envelopes.len(), "Poll started");

        let mut advance_to = cursor;
        let mut blocked = false;
        // Domain -> whether the account had mail from it before this batch.
        let mut seen_before: HashMap<String, bool> = HashMap::new();
        let mut new_domains = BTreeSet::new();

        for envelope in envelopes
            .iter()
            .filter(|e| e.uid > cursor)
            .take(self.config.polling.max_emails_per_poll)
        {
            let uid = envelope.uid;
            let mail = match self.mail.fetch(account_id, &account.folder, uid).await {
                Ok(mail) => mail,
                Err(e) => {
                    warn!(account = account_id, uid, error = %e, "Fetch failed");
                    report.failed += 1;
                    blocked = true;
                    continue;
                }
            };

            if self.db.message_exists(&mail.message_id).await? {
                debug!(account = account_id, uid, message_id = %mail.message_id, "Already stored");
                report.skipped_known += 1;
                if !blocked {
                    advance_to = advance_to.max(uid);
                }
                continue;
            }

            let domain = mail.sender_domain();
            if !domain.is_empty() && !seen_before.contains_key(&domain) {
                let seen = self.db.sender_domain_seen(account_id, &domain).await?;
                seen_before.insert(domain.clone(), seen);
            }

            match self.process_message(account, &mail).await {
                Ok(processed) => {
                    report.processed += 1;
                    if !domain.is_empty() && seen_before.get(&domain) == Some(&false) {
                        new_domains.insert(domain);
                    }
                    report.reports.push(processed);
                    if !blocked {
                        advance_to = advance_to.max(uid);
                    }
                }
                Err(e) => {
                    error!(
                        account = account_id,
                        uid,
                        message_id = %mail.message_id,
                        error = %e,
                        "Message processing failed"
                    );
                    report.failed += 1;
                    blocked = true;
                }
            }
        }

        for domain in &new_domains {
            info!(account = account_id, domain = %domain, "New sender domain, backfilling");
            match self.backfill_domain(account_id, domain).await {
                Ok(backfill) => report.backfilled += backfill.processed,
                Err(e) => warn!(account = account_id, domain = %domain, error = %e, "Backfill failed"),
            }
        }
        report.new_domains = new_domains.into_iter().collect();

        self.db
            .set_cursor(&PollCursor {
                account_id: account_id.to_string(),
                folder: account.folder.clone(),
                last_seen_uid: advance_to,
                last_poll_at: Utc::now(),
            })
            .await?;
        report.cursor_after = advance_to;

        info!(
            account = account_id,
            processed = report.processed,
            skipped = report.skipped_known,
            failed = report.failed,
            backfilled = report.backfilled,
            cursor = advance_to,
            "Poll complete"
        );
        Ok(report)
    }

    /// Poll with exponential backoff. Alerts the operator once an account
    /// has exhausted its retries `alert_after_failures` times in a row.
    pub async fn poll_with_retry(&self, account_id: &str) -> AccountPollResult {
        let max_attempts = self.backoff.max_attempts.max(1);
        let mut attempts = 0;
        let mut last_error = String::new();

        while attempts < max_attempts {
            let attempt = attempts;
            attempts += 1;
            match self.poll_account(account_id).await {
                Ok(report) => {
                    self.failures.lock().await.insert(account_id.to_string(), 0);
                    return AccountPollResult {
                        account: account_id.to_string(),
                        attempts,
                        report: Some(report),
                        error: None,
                    };
                }
                Err(e) => {
                    last_error = e.to_string();
                    if !is_transient(&e) {
                        warn!(account = account_id, error = %e, "Poll failed, not retrying");
                        break;
                    }
                    if attempts < max_attempts {
                        let delay = self.backoff.delay(attempt);
                        warn!(
                            account = account_id,
                            attempt = attempts,
                            backoff_ms = delay.as_millis() as u64,
                            error = %e,
                            "Poll failed, retrying"
                        );
                        self.sleeper.sleep(delay).await;
                    }
                }
            }
        }

        let failures = {
            let mut map = self.failures.lock().await;
            let count = map.entry(account_id.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        let exhausted = PipelineError::PollExhausted {
            account: account_id.to_string(),
            attempts,
            reason: last_error.clone(),
        };
        error!(account = account_id, failures, error = %exhausted, "Poll gave up");

        if failures >= self.config.polling.alert_after_failures {
            alert(
                self.notifier.as_ref(),
                &format!(
                    "Lead pipeline: {failures} consecutive failures for {account_id}. Last error: {last_error}"
                ),
            )
            .await;
        }

        AccountPollResult {
            account: account_id.to_string(),
            attempts,
            report: None,
            error: Some(exhausted.to_string()),
        }
    }

    /// Poll every account in configuration order.
    pub async fn poll_all(&self) -> Vec<AccountPollResult> {
        let run_id = Uuid::new_v4();
        let span = info_span!("poll_all", run_id = %run_id);
        async {
            let mut results = Vec::with_capacity(self.config.accounts.len());
            for account in &self.config.accounts {
                results.push(self.poll_with_retry(&account.id).await);
            }
            let ok = results.iter().filter(|r| r.is_ok()).count();
            info!(accounts = results.len(), ok, "Poll cycle complete");
            results
        }
        .instrument(span)
        .await
    }

    /// Poll every `interval` until `shutdown` is set.
    pub async fn run(&self, interval: Duration, shutdown: Arc<AtomicBool>) {
        info!(interval_secs = interval.as_secs(), "Pipeline started");
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tick.tick().await;
            if shutdown.load(Ordering::Relaxed) {
                info!("Pipeline shutting down");
                return;
            }
            self.poll_all().await;
        }
    }

    /// Process recent mail from `domain` that is not stored yet. The cursor
    /// is left alone.
    pub async fn backfill_domain(
        &self,
        account_id: &str,
        domain: &str,
    ) -> Result<BackfillReport, PipelineError> {
        let account = self.account(account_id)?;
        let domain = domain.trim().to_lowercase();
        let since = lookback(
            "polling.backfill_days",
            self.config.polling.backfill_days,
            TimeDelta::try_days,
        )?;

        let matching: Vec<_> = self
            .mail
            .list_since(account_id, &account.folder, since)
            .await?
            .into_iter()
            .filter(|e| e.sender_domain() == domain)
            .take(self.config.polling.max_backfill)
            .collect();

        let mut report = BackfillReport {
            account: account_id.to_string(),
            domain: domain.clone(),
            matched: matching.len(),
            ..Default::default()
        };

        for envelope in matching {
            let mail = match self.mail.fetch(account_id, &account.folder, envelope.uid).await {
                Ok(mail) => mail,
                Err(e) => {
                    warn!(account = account_id, uid = envelope.uid, error = %e, "Backfill fetch failed");
                    report.failed += 1;
                    continue;
                }
            };
            if self.db.message_exists(&mail.message_id).await? {
                report.skipped_known += 1;
                continue;
            }
            match self.process_message(account, &mail).await {
                Ok(_) => report.processed += 1,
                Err(e) => {
                    warn!(account = account_id, uid = envelope.uid, error = %e, "Backfill processing failed");
                    report.failed += 1;
                }
            }
        }

        info!(
            account = account_id,
            domain = %domain,
            matched = report.matched,
            processed = report.processed,
            "Backfill complete"
        );
        Ok(report)
    }

    // ── Per-message pipeline ────────────────────────────────────────

    /// Run one message through every enabled step.
    ///
    /// Only quarantine and persistence failures are errors. Later steps
    /// record their failure in the report; score, label, and stage-init
    /// failures end the run, while drift, research, draft, and escalation
    /// failures are logged and the remaining steps still run.
    pub async fn process_message(
        &self,
        account: &AccountConfig,
        mail: &RawMail,
    ) -> Result<ProcessReport, PipelineError> {
        let mut report = ProcessReport::new(&mail.message_id);
        let features = account.features;

        let quarantined = self.quarantine.process(mail).await;
        report.quarantine = Some(quarantined.verdict.status);
        if let Some(warning) = &quarantined.verdict.warning {
            warn!(message_id = %mail.message_id, warning = %warning, "Message passed without a scan");
        }
        report.completed.push(Step::Quarantine);

        let from_domain = mail.sender_domain();
        let new = NewMessage {
            account_id: account.id.clone(),
            message_id: mail.message_id.clone(),
            thread_id: mail.thread_id.clone(),
            from_email: mail.from_email.clone(),
            from_name: mail.from_name.clone(),
            from_domain: from_domain.clone(),
            to_email: mail.to_email.clone(),
            subject: mail.subject.clone(),
            body_text: quarantined.content.body_text.clone(),
            body_html: quarantined.content.body_html.clone(),
            received_at: mail.date,
            is_reply: mail.is_reply(),
            in_reply_to: mail.in_reply_to.clone(),
            quarantine_status: quarantined.verdict.status,
            quarantine_reason: quarantined.verdict.reason(),
            metadata: quarantined.content.to_metadata(),
        };
        let id = match self.db.insert_message(&new).await? {
            InsertOutcome::Inserted(id) => id,
            InsertOutcome::Duplicate(id) => {
                info!(message_id = %mail.message_id, id, "Duplicate message, skipped");
                report.id = Some(id);
                report.duplicate = true;
                return Ok(report);
            }
        };
        report.id = Some(id);
        report.completed.push(Step::Persist);

        if quarantined.verdict.status != QuarantineStatus::Clean {
            warn!(
                message_id = %mail.message_id,
                id,
                status = %quarantined.verdict.status,
                reason = quarantined.verdict.reason().as_deref().unwrap_or(""),
                "Message quarantined"
            );
            return Ok(report);
        }
        if !features.scoring {
            return Ok(report);
        }

        let input = ScoringInput {
            from_email: &mail.from_email,
            from_name: mail.from_name.as_deref(),
            subject: &mail.subject,
            body_text: &quarantined.content.body_text,
        };
        let scored = match self.scorer.score(&input).await {
            Ok(result) => result,
            Err(e) => return Ok(fail(report, Step::Score, id, e)),
        };
        if let Err(e) = self.scorer.record(self.db.as_ref(), id, &scored).await {
            return Ok(fail(report, Step::Score, id, e));
        }
        report.classification = Some(scored.classification.clone());
        report.score = scored.score;
        report.completed.push(Step::Score);
        info!(
            message_id = %mail.message_id,
            id,
            classification = %scored.classification,
            score = ?scored.score,
            "Message scored"
        );

        if features.labels {
            if let Err(e) = apply_score_label(self.db.as_ref(), id).await {
                return Ok(fail(report, Step::ScoreLabel, id, e));
            }
            report.completed.push(Step::ScoreLabel);
        }

        if !scored.is_lead {
            return Ok(report);
        }

        if let Err(e) = initialize_stage(self.db.as_ref(), &self.tracker, id).await {
            return Ok(fail(report, Step::StageInit, id, e));
        }
        report.completed.push(Step::StageInit);

        if features.stage_tracking {
            match self.tracker.check_drift(id).await {
                Ok(Some(drift)) if drift.drift => {
                    warn!(
                        id,
                        local = drift.local_stage.name(),
                        crm = %drift.crm_stage,
                        "Stage drift against system of record"
                    );
                    report.completed.push(Step::StageDrift);
                }
                Ok(_) => report.completed.push(Step::StageDrift),
                Err(e) => report = record_failure(report, Step::StageDrift, id, e),
            }
        }

        if !from_domain.is_empty() {
            match self.researcher.research(&from_domain).await {
                Ok(research) => {
                    debug!(id, domain = %from_domain, resolves = research.domain_resolves, "Sender researched");
                    report.completed.push(Step::Research);
                }
                Err(e) => report = record_failure(report, Step::Research, id, e),
            }
        }

        if features.draft_generation {
            match self.load(id).await {
                Ok(stored) => match self.drafter.generate(&stored).await {
                    Ok(outcome) => {
                        report.draft = outcome;
                        report.completed.push(Step::Draft);
                    }
                    Err(e) => report = record_failure(report, Step::Draft, id, e),
                },
                Err(e) => report = record_failure(report, Step::Draft, id, e),
            }
        }

        if features.escalation {
            match self.escalator.escalate(id).await {
                Ok(outcome) => {
                    report.escalation = Some(outcome);
                    report.completed.push(Step::Escalate);
                }
                Err(e) => report = record_failure(report, Step::Escalate, id, e),
            }
        }

        Ok(report)
    }

    async fn load(&self, id: i64) -> Result<StoredMessage, DatabaseError> {
        self.db
            .get_message(id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "message".into(),
                id: id.to_string(),
            })
    }

    // ── Reporting ───────────────────────────────────────────────────

    pub async fn stats(&self) -> Result<PipelineStats, PipelineError> {
        pipeline_stats(self.db.as_ref(), self.scorer.rubric_version()).await
    }

    pub async fn list_recent(
        &self,
        hours: i64,
        leads_only: bool,
    ) -> Result<Vec<StoredMessage>, PipelineError> {
        recent_messages(self.db.as_ref(), hours, leads_only).await
    }
}

/// Message totals and rubric drift against `rubric_version`.
pub async fn pipeline_stats(
    db: &dyn Database,
    rubric_version: &str,
) -> Result<PipelineStats, PipelineError> {
    Ok(PipelineStats {
        counts: db.message_counts().await?,
        rubric: check_drift(db, rubric_version).await?,
    })
}

/// Up to [`RECENT_LIMIT`] messages from the last `hours`, newest first.
/// Negative spans count as zero.
pub async fn recent_messages(
    db: &dyn Database,
    hours: i64,
    leads_only: bool,
) -> Result<Vec<StoredMessage>, PipelineError> {
    let since = lookback("hours", hours.max(0), TimeDelta::try_hours)?;
    Ok(db.recent_messages(since, leads_only, RECENT_LIMIT).await?)
}

/// `now - span(amount)`, or `OutOfRange` when that instant is not representable.
fn lookback(
    field: &str,
    amount: i64,
    span: fn(i64) -> Option<TimeDelta>,
) -> Result<DateTime<Utc>, ValidationError> {
    span(amount)
        .and_then(|d| Utc::now().checked_sub_signed(d))
        .ok_or_else(|| ValidationError::OutOfRange {
            component: "pipeline".into(),
            field: field.into(),
            value: amount.to_string(),
        })
}

fn record_failure(
    mut report: ProcessReport,
    step: Step,
    id: i64,
    error: impl std::fmt::Display,
) -> ProcessReport {
    warn!(id, step = step.as_str(), error = %error, "Pipeline step failed");
    report.failures.push(StepFailure {
        step,
        error: error.to_string(),
    });
    report
}

fn fail(report: ProcessReport, step: Step, id: i64, error: impl std::fmt::Display) -> ProcessReport {
    error!(id, step = step.as_str(), "Pipeline stopped; message left at its last completed step");
    record_failure(report, step, id, error)
}

/// Whether a failed poll is worth retrying.
fn is_transient(error: &PipelineError) -> bool {
    match error {
        PipelineError::Mail(MailError::UnknownAccount(_)) => false,
        PipelineError::Mail(_) => true,
        PipelineError::Llm(e) => matches!(
            e,
            LlmError::RequestFailed { .. } | LlmError::Timeout { .. } | LlmError::RateLimited { .. }
        ),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashSet};
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::AtomicU32;

    use async_trait::async_trait;
    use chrono::DateTime;

    use super::*;
    use crate::escalation::EscalationOutcome;
    use crate::escalation::escalator::tests::{RecordingNotifier, RecordingTasks};
    use crate::llm::scripted::ScriptedLlm;
    use crate::mail::Envelope;
    use crate::pipeline::backoff::VirtualSleeper;
    use crate::research::researcher::tests::{StaticFetcher, StaticResolver};
    use crate::scoring::scorer::tests::{LEAD_JSON, NEWSLETTER_JSON};
    use crate::store::LibSqlBackend;

    const SAFE: &str = r#"{"safe": true, "risk_level": "none"}"#;
    const TEMPLATE: &str = "Hi,\n\nThanks for reaching out! Happy to chat.\n\nBest,\nSam";

    /// In-memory mailbox keyed by UID.
    #[derive(Default)]
    struct FakeMail {
        messages: StdMutex<BTreeMap<u32, RawMail>>,
        broken: StdMutex<HashSet<u32>>,
        list_failures: AtomicU32,
    }

    impl FakeMail {
        fn add(&self, uid: u32, from: &str, days_ago: i64) {
            let mail = RawMail {
                uid,
                message_id: format!("<m{uid}@mail.test>"),
                thread_id: None,
                in_reply_to: None,
                from_email: from.to_string(),
                from_name: Some("Jane Doe".into()),
                to_email: "me@studio.test".into(),
                subject: format!("Inquiry {uid}"),
                text_body: Some("We are planning a wedding in May and love your work.".into()),
                html_body: None,
                attachments: vec![],
                date: Utc::now() - chrono::Duration::days(days_ago),
            };
            self.messages.lock().unwrap().insert(uid, mail);
        }

        fn envelope(mail: &RawMail) -> Envelope {
            Envelope {
                uid: mail.uid,
                date: mail.date,
                from: mail.from_email.clone(),
                subject: mail.subject.clone(),
            }
        }
    }

    #[async_trait]
    impl MailSource for FakeMail {
        async fn list_envelopes(
            &self,
            _account: &str,
            _folder: &str,
            after_uid: u32,
        ) -> Result<Vec<Envelope>, MailError> {
            if self
                .list_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(MailError::Connect {
                    host: "imap.test".into(),
                    reason: "connection reset".into(),
                });
            }
            Ok(self
                .messages
                .lock()
                .unwrap()
                .values()
                .filter(|m| m.uid > after_uid)
                .map(Self::envelope)
                .collect())
        }

        async fn list_since(
            &self,
            _account: &str,
            _folder: &str,
            since: DateTime<Utc>,
        ) -> Result<Vec<Envelope>, MailError> {
            Ok(self
                .messages
                .lock()
                .unwrap()
                .values()
                .filter(|m| m.date >= since)
                .map(Self::envelope)
                .collect())
        }

        async fn fetch(&self, account: &str, _folder: &str, uid: u32) -> Result<RawMail, MailError> {
            if self.broken.lock().unwrap().contains(&uid) {
                return Err(MailError::Protocol("FETCH failed".into()));
            }
            self.messages
                .lock()
                .unwrap()
                .get(&uid)
                .cloned()
                .ok_or_else(|| MailError::NotFound {
                    account: account.into(),
                    uid,
                })
        }
    }

    struct Harness {
        orchestrator: Orchestrator,
        mail: Arc<FakeMail>,
        notifier: Arc<RecordingNotifier>,
        tasks: Arc<RecordingTasks>,
        sleeper: Arc<VirtualSleeper>,
    }

    fn config(extra: &str) -> PipelineConfig {
        PipelineConfig::from_json(&format!(
            r#"{{
                "accounts": [{{ "id": "main", "email": "me@studio.test" }}],
                "quarantine": {{ "scanner_model": "scanner" }},
                "scoring": {{ "model": "scorer" }},
                "drafting": {{ "writer_model": "writer", "reviewer_model": "reviewer" }}
                {extra}
            }}"#
        ))
        .unwrap()
    }

    async fn harness(llm: ScriptedLlm, config: PipelineConfig) -> Harness {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        db.run_migrations().await.unwrap();
        let mail = Arc::new(FakeMail::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let tasks = Arc::new(RecordingTasks::default());
        let sleeper = Arc::new(VirtualSleeper::new());

        let services = PipelineServices::new(db, mail.clone(), Arc::new(llm), &config)
            .with_notifier(notifier.clone())
            .with_tasks(tasks.clone())
            .with_research(
                Arc::new(StaticResolver::new(&["93.184.216.34"])),
                Arc::new(StaticFetcher::new(Some("<title>Acme</title>"))),
            )
            .with_sleeper(sleeper.clone());
        let orchestrator = Orchestrator::new(
            config,
            services,
            Rubric::from_text("Score wedding inquiries."),
            TemplateStore::in_memory().with_template("main", "high", TEMPLATE),
        )
        .with_backoff(BackoffPolicy {
            max_attempts: 3,
            base: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            jitter: 0.0,
        });
        Harness {
            orchestrator,
            mail,
            notifier,
            tasks,
            sleeper,
        }
    }

    fn lead_llm() -> ScriptedLlm {
        ScriptedLlm::new()
            .reply("scanner", SAFE)
            .reply("scorer", LEAD_JSON)
            .reply("writer", "Hi Jane,\n\nThanks for reaching out about May! Happy to chat.\n\nBest,\nSam")
            .reply("reviewer", r#"{"approved": true, "failures": []}"#)
    }

    fn newsletter_llm() -> ScriptedLlm {
        ScriptedLlm::new()
            .reply("scanner", SAFE)
            .reply("scorer", NEWSLETTER_JSON)
    }

    #[tokio::test]
    async fn lead_runs_every_step() {
        let h = harness(lead_llm(), config("")).await;
        h.mail.add(1, "jane@acme.test", 0);

        let report = h.orchestrator.poll_account("main").await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(report.cursor_after, 1);

        let msg = &report.reports[0];
        assert!(msg.failures.is_empty(), "{:?}", msg.failures);
        for step in [
            Step::Quarantine,
            Step::Persist,
            Step::Score,
            Step::ScoreLabel,
            Step::StageInit,
            Step::StageDrift,
            Step::Research,
            Step::Draft,
            Step::Escalate,
        ] {
            assert!(msg.has_completed(step), "missing {step}");
        }
        assert!(matches!(msg.escalation, Some(EscalationOutcome::Attempted(_))));
        assert_eq!(h.notifier.sent.lock().unwrap().len(), 1);
        assert_eq!(h.tasks.created.lock().unwrap().len(), 1);

        let stored = h.orchestrator.db().get_message(msg.id.unwrap()).await.unwrap().unwrap();
        assert_eq!(stored.score_label.as_deref(), Some("Lead/High 83"));
        assert_eq!(stored.stage_label.as_deref(), Some("Stage/New"));
        assert!(stored.escalated);
        assert!(h.orchestrator.db().get_research("acme.test").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn non_lead_stops_after_label() {
        let h = harness(newsletter_llm(), config("")).await;
        h.mail.add(1, "news@letters.test", 0);
        let report = h.orchestrator.poll_account("main").await.unwrap();
        let msg = &report.reports[0];
        assert!(msg.has_completed(Step::ScoreLabel));
        assert!(!msg.has_completed(Step::StageInit));
        assert!(msg.escalation.is_none());
        assert!(h.notifier.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn blocked_message_is_stored_but_not_scored() {
        let llm = ScriptedLlm::new().reply(
            "scanner",
            r#"{"safe": false, "risk_level": "critical", "reasons": ["credential phishing"]}"#,
        );
        let h = harness(llm, config("")).await;
        h.mail.add(1, "evil@phish.test", 0);

        let report = h.orchestrator.poll_account("main").await.unwrap();
        let msg = &report.reports[0];
        assert_eq!(msg.quarantine, Some(QuarantineStatus::Blocked));
        assert_eq!(msg.completed, vec![Step::Quarantine, Step::Persist]);

        let stored = h.orchestrator.db().get_message(msg.id.unwrap()).await.unwrap().unwrap();
        assert_eq!(stored.quarantine_status, QuarantineStatus::Blocked);
        assert!(stored.classification.is_none());
    }

    #[tokio::test]
    async fn scoring_failure_leaves_message_clean_and_unscored() {
        let llm = ScriptedLlm::new().reply("scanner", SAFE).reply("scorer", "no idea");
        let h = harness(llm, config("")).await;
        h.mail.add(1, "jane@acme.test", 0);

        let report = h.orchestrator.poll_account("main").await.unwrap();
        let msg = &report.reports[0];
        assert!(msg.failed_at(Step::Score));
        assert!(!msg.has_completed(Step::ScoreLabel));
        // The message is stored, so the cursor still advances.
        assert_eq!(report.cursor_after, 1);
    }

    #[tokio::test]
    async fn disabled_features_are_skipped() {
        let cfg = PipelineConfig::from_json(
            r#"{ "accounts": [{ "id": "main", "email": "me@studio.test",
                 "features": { "draft_generation": false, "escalation": false } }],
                 "quarantine": { "scanner_model": "scanner" },
                 "scoring": { "model": "scorer" } }"#,
        )
        .unwrap();
        let h = harness(lead_llm(), cfg).await;
        h.mail.add(1, "jane@acme.test", 0);
        let report = h.orchestrator.poll_account("main").await.unwrap();
        let msg = &report.reports[0];
        assert!(msg.has_completed(Step::StageInit));
        assert!(!msg.has_completed(Step::Draft));
        assert!(!msg.has_completed(Step::Escalate));
        assert!(h.tasks.created.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn second_poll_sees_nothing_new() {
        let h = harness(newsletter_llm(), config("")).await;
        h.mail.add(1, "a@one.test", 0);
        h.mail.add(2, "b@two.test", 0);

        let first = h.orchestrator.poll_account("main").await.unwrap();
        assert_eq!(first.processed, 2);
        assert_eq!(first.cursor_after, 2);

        let second = h.orchestrator.poll_account("main").await.unwrap();
        assert_eq!(second.listed, 0);
        assert_eq!(second.processed, 0);
        assert_eq!(second.cursor_after, 2);
    }

    #[tokio::test]
    async fn cursor_stops_below_first_failure() {
        let h = harness(newsletter_llm(), config("")).await;
        for uid in 1..=3 {
            h.mail.add(uid, &format!("x{uid}@d{uid}.test"), 0);
        }
        h.mail.broken.lock().unwrap().insert(2);

        let first = h.orchestrator.poll_account("main").await.unwrap();
        assert_eq!(first.processed, 2);
        assert_eq!(first.failed, 1);
        assert_eq!(first.cursor_after, 1);

        h.mail.broken.lock().unwrap().clear();
        let second = h.orchestrator.poll_account("main").await.unwrap();
        assert_eq!(second.processed, 1);
        assert_eq!(second.skipped_known, 1);
        assert_eq!(second.cursor_after, 3);
    }

    #[tokio::test]
    async fn batch_is_capped() {
        let h = harness(
            newsletter_llm(),
            config(r#", "polling": { "max_emails_per_poll": 2 }"#),
        )
        .await;
        for uid in 1..=5 {
            h.mail.add(uid, &format!("a@d{uid}.test"), 0);
        }
        let first = h.orchestrator.poll_account("main").await.unwrap();
        assert_eq!(first.listed, 5);
        assert_eq!(first.cursor_after, 2);
        let second = h.orchestrator.poll_account("main").await.unwrap();
        assert_eq!(second.cursor_after, 4);
    }

    #[tokio::test]
    async fn new_domain_triggers_backfill_of_older_mail() {
        let h = harness(newsletter_llm(), config("")).await;
        h.mail.add(10, "old@acme.test", 20);
        h.orchestrator
            .db()
            .set_cursor(&PollCursor {
                account_id: "main".into(),
                folder: "INBOX".into(),
                last_seen_uid: 10,
                last_poll_at: Utc::now(),
            })
            .await
            .unwrap();
        h.mail.add(11, "new@acme.test", 0);

        let report = h.orchestrator.poll_account("main").await.unwrap();
        assert_eq!(report.new_domains, vec!["acme.test".to_string()]);
        assert_eq!(report.backfilled, 1);
        assert_eq!(report.cursor_after, 11);
        assert!(
            h.orchestrator
                .db()
                .message_exists("<m10@mail.test>")
                .await
                .unwrap()
        );

        h.mail.add(12, "again@acme.test", 0);
        let again = h.orchestrator.poll_account("main").await.unwrap();
        assert!(again.new_domains.is_empty());
    }

    #[tokio::test]
    async fn backfill_respects_window_and_limit() {
        let h = harness(
            newsletter_llm(),
            config(r#", "polling": { "backfill_days": 30, "max_backfill": 2 }"#),
        )
        .await;
        h.mail.add(1, "a@acme.test", 60);
        for uid in 2..=5 {
            h.mail.add(uid, "b@acme.test", 5);
        }
        h.mail.add(6, "c@other.test", 1);

        let report = h.orchestrator.backfill_domain("main", "ACME.test").await.unwrap();
        assert_eq!(report.matched, 2);
        assert_eq!(report.processed, 2);
        assert!(h.orchestrator.db().get_cursor("main").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn retries_with_backoff_then_succeeds() {
        let h = harness(newsletter_llm(), config("")).await;
        h.mail.list_failures.store(2, Ordering::SeqCst);

        let result = h.orchestrator.poll_with_retry("main").await;
        assert!(result.is_ok());
        assert_eq!(result.attempts, 3);
        assert_eq!(
            h.sleeper.delays(),
            vec![Duration::from_millis(1000), Duration::from_millis(2000)]
        );
        assert_eq!(h.orchestrator.failure_count("main").await, 0);
    }

    #[tokio::test]
    async fn alerts_after_consecutive_exhausted_polls() {
        let h = harness(newsletter_llm(), config("")).await;
        h.mail.list_failures.store(u32::MAX, Ordering::SeqCst);

        for round in 1..=3 {
            let result = h.orchestrator.poll_with_retry("main").await;
            assert!(!result.is_ok());
            assert_eq!(result.attempts, 3);
            assert_eq!(h.orchestrator.failure_count("main").await, round);
        }
        let sent = h.notifier.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("3 consecutive failures for main"));
        // Two sleeps per exhausted round.
        assert_eq!(h.sleeper.delays().len(), 6);

        h.mail.list_failures.store(0, Ordering::SeqCst);
        assert!(h.orchestrator.poll_with_retry("main").await.is_ok());
        assert_eq!(h.orchestrator.failure_count("main").await, 0);
    }

    #[tokio::test]
    async fn unknown_account_is_not_retried() {
        let h = harness(newsletter_llm(), config("")).await;
        let result = h.orchestrator.poll_with_retry("nope").await;
        assert_eq!(result.attempts, 1);
        assert!(h.sleeper.delays().is_empty());
    }

    #[tokio::test]
    async fn stats_and_recent_listing() {
        let h = harness(newsletter_llm(), config("")).await;
        h.mail.add(1, "a@one.test", 0);
        h.orchestrator.poll_all().await;

        let stats = h.orchestrator.stats().await.unwrap();
        assert_eq!(stats.counts.total, 1);
        assert_eq!(stats.counts.leads, 0);
        assert!(!stats.rubric.drift);

        assert_eq!(h.orchestrator.list_recent(24, false).await.unwrap().len(), 1);
        assert!(h.orchestrator.list_recent(24, true).await.unwrap().is_empty());

        let db = h.orchestrator.db().as_ref();
        let direct = pipeline_stats(db, h.orchestrator.scorer().rubric_version())
            .await
            .unwrap();
        assert_eq!(direct.counts.total, stats.counts.total);
        assert!(recent_messages(db, -5, false).await.is_ok());
    }

    #[tokio::test]
    async fn oversized_listing_window_is_rejected() {
        let h = harness(newsletter_llm(), config("")).await;
        for hours in [i64::MAX, i64::MAX / 2] {
            let err = h.orchestrator.list_recent(hours, false).await.unwrap_err();
            assert!(
                matches!(
                    err,
                    PipelineError::Validation(ValidationError::OutOfRange { ref field, .. })
                        if field == "hours"
                ),
                "{err}"
            );
        }
    }

    #[tokio::test]
    async fn oversized_backfill_window_is_rejected() {
        let mut cfg = config("");
        cfg.polling.backfill_days = i64::MAX;
        let h = harness(newsletter_llm(), cfg).await;
        h.mail.add(1, "a@acme.test", 0);

        let err = h
            .orchestrator
            .backfill_domain("main", "acme.test")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)), "{err}");
        assert!(!h.orchestrator.db().message_exists("<m1@mail.test>").await.unwrap());
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let h = harness(newsletter_llm(), config("")).await;
        let shutdown = Arc::new(AtomicBool::new(true));
        tokio::time::timeout(
            Duration::from_secs(5),
            h.orchestrator.run(Duration::from_millis(10), shutdown),
        )
        .await
        .unwrap();
    }
}
