//! Stage changes with an append-only audit trail, plus drift checks
//! against an external system of record.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{Error, IntegrityError};
use crate::leads::stage::{Stage, allowed_from, describe, is_valid_transition};
use crate::store::{Database, NewStageAudit, StageAuditEntry, StoredMessage};

/// External CRM that may hold its own view of a lead's stage.
#[async_trait]
pub trait StageSystemOfRecord: Send + Sync {
    /// The CRM's stage for this message, or `None` if it has no record.
    async fn stage_for(&self, message: &StoredMessage) -> Result<Option<String>, Error>;
}

/// A committed stage change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageChange {
    pub audit_id: i64,
    pub message_id: i64,
    pub from: Option<Stage>,
    pub to: Stage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageDrift {
    pub drift: bool,
    pub local_stage: Stage,
    pub crm_stage: String,
}

pub struct StageTracker {
    db: Arc<dyn Database>,
    crm: Option<Arc<dyn StageSystemOfRecord>>,
}

impl StageTracker {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db, crm: None }
    }

    pub fn with_system_of_record(mut self, crm: Arc<dyn StageSystemOfRecord>) -> Self {
        self.crm = Some(crm);
        self
    }

    async fn load(&self, id: i64) -> Result<StoredMessage, Error> {
        self.db
            .get_message(id)
            .await?
            .ok_or_else(|| IntegrityError::MessageNotFound(id.to_string()).into())
    }

    fn current_stage(msg: &StoredMessage) -> Result<Option<Stage>, IntegrityError> {
        msg.stage_label.as_deref().map(Stage::parse).transpose()
    }

    /// Move a message to `to`. Illegal pairs are rejected and nothing is written.
    pub async fn change_stage(
        &self,
        id: i64,
        to: Stage,
        changed_by: &str,
        reason: Option<&str>,
    ) -> Result<StageChange, Error> {
        let msg = self.load(id).await?;
        let from = Self::current_stage(&msg)?;

        if !is_valid_transition(from, to) {
            let err = IntegrityError::IllegalTransition {
                message_id: id.to_string(),
                from: from.map_or("(none)", |s| s.name()).to_string(),
                to: to.name().to_string(),
                allowed: describe(allowed_from(from)),
            };
            warn!(message_id = id, error = %err, "Rejected stage change");
            return Err(err.into());
        }

        let audit_id = self
            .db
            .record_stage_change(
                &NewStageAudit {
                    message_id: id,
                    thread_id: msg.thread_id.clone(),
                    from_stage: from.map(|s| s.name().to_string()),
                    to_stage: to.name().to_string(),
                    changed_by: changed_by.to_string(),
                    reason: reason.map(String::from),
                },
                msg.stage_label.as_deref(),
                &to.label(),
            )
            .await?;

        info!(
            message_id = id,
            from_stage = from.map_or("(none)", |s| s.name()),
            to_stage = to.name(),
            changed_by,
            reason = reason.unwrap_or(""),
            "Stage changed"
        );
        Ok(StageChange {
            audit_id,
            message_id: id,
            from,
            to,
        })
    }

    pub async fn audit_trail(&self, id: i64) -> Result<Vec<StageAuditEntry>, Error> {
        Ok(self.db.audit_trail(id).await?)
    }

    pub async fn thread_audit_trail(&self, thread_id: &str) -> Result<Vec<StageAuditEntry>, Error> {
        Ok(self.db.thread_audit_trail(thread_id).await?)
    }

    /// Compare the local stage with the system of record. Divergence is
    /// logged to the message's drift log and never corrected.
    pub async fn check_drift(&self, id: i64) -> Result<Option<StageDrift>, Error> {
        let Some(crm) = &self.crm else {
            return Ok(None);
        };
        let msg = self.load(id).await?;
        let Some(local_stage) = Self::current_stage(&msg)? else {
            return Ok(None);
        };

        let crm_stage = match crm.stage_for(&msg).await {
            Ok(Some(stage)) => stage,
            Ok(None) => return Ok(None),
            Err(e) => {
                debug!(message_id = id, error = %e, "System of record unavailable");
                return Ok(None);
            }
        };

        let drift = Stage::parse(&crm_stage).map_or(true, |s| s != local_stage);
        if drift {
            warn!(
                message_id = id,
                local_stage = local_stage.name(),
                crm_stage = %crm_stage,
                "Stage drift detected"
            );
            self.db
                .append_drift_log(
                    id,
                    &serde_json::json!({
                        "detected_at": Utc::now().to_rfc3339(),
                        "local_stage": local_stage.name(),
                        "crm_stage": crm_stage,
                    }),
                )
                .await?;
        }
        Ok(Some(StageDrift {
            drift,
            local_stage,
            crm_stage,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::libsql_backend::tests::new_message;
    use crate::store::{InsertOutcome, LibSqlBackend};

    async fn setup() -> (Arc<dyn Database>, StageTracker, i64) {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        db.run_migrations().await.unwrap();
        let id = match db.insert_message(&new_message("<s@x>", "acme.test")).await.unwrap() {
            InsertOutcome::Inserted(id) => id,
            other => panic!("unexpected {other:?}"),
        };
        (db.clone(), StageTracker::new(db), id)
    }

    struct FixedCrm(Result<Option<String>, ()>);

    #[async_trait]
    impl StageSystemOfRecord for FixedCrm {
        async fn stage_for(&self, _message: &StoredMessage) -> Result<Option<String>, Error> {
            self.0.clone().map_err(|_| {
                Error::Integrity(IntegrityError::MessageNotFound("crm offline".into()))
            })
        }
    }

    #[tokio::test]
    async fn legal_path_builds_audit_trail() {
        let (db, tracker, id) = setup().await;
        for (to, by) in [
            (Stage::New, "system"),
            (Stage::Contacted, "manual"),
            (Stage::Qualified, "manual"),
            (Stage::ProposalSent, "manual"),
        ] {
            tracker.change_stage(id, to, by, Some("progress")).await.unwrap();
        }

        let msg = db.get_message(id).await.unwrap().unwrap();
        assert_eq!(msg.stage_label.as_deref(), Some("Stage/Proposal Sent"));

        let trail = tracker.audit_trail(id).await.unwrap();
        let pairs: Vec<(Option<&str>, &str)> = trail
            .iter()
            .map(|e| (e.from_stage.as_deref(), e.to_stage.as_str()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                (None, "New"),
                (Some("New"), "Contacted"),
                (Some("Contacted"), "Qualified"),
                (Some("Qualified"), "Proposal Sent"),
            ]
        );
        assert_eq!(trail[0].changed_by, "system");
    }

    #[tokio::test]
    async fn illegal_transition_names_pair_and_writes_nothing() {
        let (db, tracker, id) = setup().await;
        tracker.change_stage(id, Stage::New, "system", None).await.unwrap();

        let err = tracker
            .change_stage(id, Stage::Booked, "manual", None)
            .await
            .unwrap_err();
        let text = err.to_string();
        assert!(text.contains("New -> Booked"), "{text}");
        assert!(text.contains("Contacted, Lost, Archived"), "{text}");

        assert_eq!(tracker.audit_trail(id).await.unwrap().len(), 1);
        let msg = db.get_message(id).await.unwrap().unwrap();
        assert_eq!(msg.stage_label.as_deref(), Some("Stage/New"));
    }

    #[tokio::test]
    async fn first_transition_must_be_new() {
        let (_db, tracker, id) = setup().await;
        let err = tracker
            .change_stage(id, Stage::Contacted, "manual", None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("(none) -> Contacted"));
        assert!(tracker.audit_trail(id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn lost_leads_can_reopen() {
        let (_db, tracker, id) = setup().await;
        for to in [Stage::New, Stage::Lost, Stage::New, Stage::Archived, Stage::New] {
            tracker.change_stage(id, to, "manual", None).await.unwrap();
        }
        assert_eq!(tracker.audit_trail(id).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn unknown_message_is_an_integrity_error() {
        let (_db, tracker, _id) = setup().await;
        let err = tracker
            .change_stage(9999, Stage::New, "manual", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Integrity(IntegrityError::MessageNotFound(_))));
    }

    #[tokio::test]
    async fn thread_trail_spans_messages() {
        let (db, tracker, id) = setup().await;
        let mut reply = new_message("<s2@x>", "acme.test");
        reply.thread_id = Some("thread-<s@x>".into());
        let InsertOutcome::Inserted(second) = db.insert_message(&reply).await.unwrap() else {
            panic!("duplicate");
        };
        tracker.change_stage(id, Stage::New, "system", None).await.unwrap();
        tracker.change_stage(second, Stage::New, "system", None).await.unwrap();

        let trail = tracker.thread_audit_trail("thread-<s@x>").await.unwrap();
        assert_eq!(trail.len(), 2);
        assert_eq!(trail[0].message_id, id);
        assert_eq!(trail[1].message_id, second);
    }

    #[tokio::test]
    async fn drift_without_crm_is_none() {
        let (_db, tracker, id) = setup().await;
        tracker.change_stage(id, Stage::New, "system", None).await.unwrap();
        assert!(tracker.check_drift(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn drift_is_recorded_not_corrected() {
        let (db, tracker, id) = setup().await;
        let tracker =
            tracker.with_system_of_record(Arc::new(FixedCrm(Ok(Some("Qualified".into())))));
        tracker.change_stage(id, Stage::New, "system", None).await.unwrap();

        let drift = tracker.check_drift(id).await.unwrap().unwrap();
        assert!(drift.drift);
        assert_eq!(drift.local_stage, Stage::New);
        assert_eq!(drift.crm_stage, "Qualified");

        let msg = db.get_message(id).await.unwrap().unwrap();
        assert_eq!(msg.stage_label.as_deref(), Some("Stage/New"));
        let log = msg.metadata["drift_log"].as_array().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0]["crm_stage"], "Qualified");
        assert_eq!(log[0]["local_stage"], "New");
    }

    #[tokio::test]
    async fn matching_or_unavailable_crm_records_nothing() {
        for crm in [
            FixedCrm(Ok(Some("Stage/New".into()))),
            FixedCrm(Ok(None)),
            FixedCrm(Err(())),
        ] {
            let (db, tracker, id) = setup().await;
            let tracker = tracker.with_system_of_record(Arc::new(crm));
            tracker.change_stage(id, Stage::New, "system", None).await.unwrap();
            if let Some(d) = tracker.check_drift(id).await.unwrap() {
                assert!(!d.drift);
            }
            let msg = db.get_message(id).await.unwrap().unwrap();
            assert!(msg.metadata.get("drift_log").is_none());
        }
    }
}
