//! Score labels (set once) and stage initialization for new leads.

use tracing::{debug, info};

use crate::error::{Error, IntegrityError};
use crate::leads::stage::Stage;
use crate::leads::tracker::{StageChange, StageTracker};
use crate::scoring::Bucket;
use crate::store::{Database, StoredMessage};

/// `Lead/High 83` for scored leads; the classification label or the
/// classification itself otherwise. `None` for unscored messages.
pub fn score_label_for(msg: &StoredMessage) -> Option<String> {
    if msg.is_lead()
        && let (Some(score), Some(bucket)) = (msg.score, msg.score_bucket.as_deref())
    {
        let bucket = Bucket::parse(bucket).map_or_else(|| bucket.to_string(), |b| b.title().into());
        return Some(format!("Lead/{bucket} {score}"));
    }
    msg.classification_label
        .clone()
        .or_else(|| msg.classification.clone())
}

async fn load(db: &dyn Database, id: i64) -> Result<StoredMessage, Error> {
    db.get_message(id)
        .await?
        .ok_or_else(|| IntegrityError::MessageNotFound(id.to_string()).into())
}

/// Write the score label if the message has none. An existing label is
/// returned untouched.
pub async fn apply_score_label(db: &dyn Database, id: i64) -> Result<Option<String>, Error> {
    let msg = load(db, id).await?;
    if let Some(existing) = msg.score_label {
        debug!(message_id = id, label = %existing, "Score label already set");
        return Ok(Some(existing));
    }
    let Some(label) = score_label_for(&msg) else {
        return Ok(None);
    };

    if db.set_score_label_if_absent(id, &label).await? {
        info!(message_id = id, label = %label, "Score label applied");
        Ok(Some(label))
    } else {
        // Lost a race with another writer; theirs stands.
        Ok(load(db, id).await?.score_label)
    }
}

/// Enter `New` for a lead with no stage yet. Non-leads and leads already in
/// a stage are left alone.
pub async fn initialize_stage(
    db: &dyn Database,
    tracker: &StageTracker,
    id: i64,
) -> Result<Option<StageChange>, Error> {
    let msg = load(db, id).await?;
    if !msg.is_lead() {
        debug!(
            message_id = id,
            classification = msg.classification.as_deref().unwrap_or("(none)"),
            "Stage init skipped, not a lead"
        );
        return Ok(None);
    }
    if msg.stage_label.is_some() {
        return Ok(None);
    }
    tracker
        .change_stage(id, Stage::New, "system", Some("new lead"))
        .await
        .map(Some)
}

/// Current `(score_label, stage_label)`.
pub async fn labels(db: &dyn Database, id: i64) -> Result<(Option<String>, Option<String>), Error> {
    let msg = load(db, id).await?;
    Ok((msg.score_label, msg.stage_label))
}
