//! Dossier aggregate: coarse business status, cancellation, archiving and
//! progress.
//!
//! The dossier status is a business milestone set by staff or provisioning.
//! It is not derived from step validation, except that completing the final
//! step marks the dossier COMPLETED.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, Instrument};

use crate::engine::DossierEngine;
use crate::error::{StoreError, WorkflowError, WorkflowResult};
use crate::events::EventDraft;
use crate::identity::Caller;
use crate::model::{Dossier, DossierId, DossierStatus, EntityType, EventType};
use crate::store::DossierPatch;
use crate::telemetry::{create_workflow_span, generate_correlation_id};

pub const CANCELLATION_REASON: &str = "cancellation_reason";
pub const CANCELLED_AT: &str = "cancelled_at";
pub const CANCELLED_BY: &str = "cancelled_by";
pub const ARCHIVE_SNAPSHOT: &str = "archive_snapshot";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
    /// Rounded down
    pub percent: u8,
}

impl Progress {
    pub fn new(completed: usize, total: usize) -> Self {
        let percent = if total == 0 {
            0
        } else {
            (completed.min(total) * 100 / total) as u8
        };
        Self {
            completed,
            total,
            percent,
        }
    }
}

impl DossierEngine {
    /// Staff moves the dossier to another business milestone.
    pub async fn set_status(
        &self,
        caller: &Caller,
        dossier_id: DossierId,
        status: DossierStatus,
    ) -> WorkflowResult<Dossier> {
        let correlation_id = generate_correlation_id();
        let dossier_label = dossier_id.to_string();
        let span = create_workflow_span("set_status", Some(&dossier_label), Some(&correlation_id));

        async move {
            caller.require_staff("changing a dossier status")?;
            let dossier = self.load_dossier(caller, dossier_id).await?;
            if dossier.is_closed() || dossier.archived_at.is_some() {
                return Err(WorkflowError::precondition(format!(
                    "dossier {dossier_id} is closed"
                )));
            }
            if status == DossierStatus::Closed {
                return Err(WorkflowError::invalid("closing a dossier goes through cancel"));
            }
            if dossier.status == status {
                return Ok(dossier);
            }

            let from = dossier.status;
            let now = self.now();
            let mut patch = DossierPatch::new(now).status(status);
            if status == DossierStatus::Completed {
                patch = patch.completed_at(now);
            }
            let updated = self
                .store
                .patch_dossier_if(dossier_id, from, &patch)
                .await?
                .ok_or_else(|| WorkflowError::Conflict {
                    reason: format!("dossier {dossier_id} status changed concurrently"),
                })?;

            info!(dossier_id = %dossier_id, from = %from, to = %status, "Dossier status changed");
            self.record(
                caller,
                EventDraft::new(
                    Some(dossier_id),
                    EntityType::Dossier,
                    dossier_id,
                    EventType::DossierStatusChanged,
                )
                .with_payload(json!({ "from": from, "to": status })),
            )
            .await;
            Ok(updated)
        }
        .instrument(span)
        .await
    }

    /// Closes the dossier. Repeating the same cancellation is a no-op so a
    /// retried admin request succeeds.
    pub async fn cancel(
        &self,
        caller: &Caller,
        dossier_id: DossierId,
        reason: &str,
    ) -> WorkflowResult<Dossier> {
        let correlation_id = generate_correlation_id();
        let dossier_label = dossier_id.to_string();
        let span = create_workflow_span("cancel", Some(&dossier_label), Some(&correlation_id));

        async move {
            caller.require_staff("cancelling a dossier")?;
            let reason = reason.trim();
            if reason.is_empty() {
                return Err(WorkflowError::invalid("a cancellation reason is required"));
            }
            let dossier = self.load_dossier(caller, dossier_id).await?;
            if dossier.is_closed() {
                return already_cancelled(dossier, reason);
            }

            let from = dossier.status;
            let now = self.now();
            let patch = DossierPatch::new(now)
                .status(DossierStatus::Closed)
                .metadata(CANCELLATION_REASON, json!(reason))
                .metadata(CANCELLED_AT, json!(now))
                .metadata(CANCELLED_BY, json!(caller.id));

            let Some(updated) = self.store.patch_dossier_if(dossier_id, from, &patch).await? else {
                // Lost a race; the winner may have been the same cancellation.
                let current = self.load_dossier(caller, dossier_id).await?;
                if current.is_closed() {
                    return already_cancelled(current, reason);
                }
                return Err(WorkflowError::Conflict {
                    reason: format!("dossier {dossier_id} status changed concurrently"),
                });
            };

            info!(dossier_id = %dossier_id, from = %from, "Dossier cancelled");
            self.record(
                caller,
                EventDraft::new(
                    Some(dossier_id),
                    EntityType::Dossier,
                    dossier_id,
                    EventType::DossierStatusChanged,
                )
                .with_payload(json!({
                    "from": from,
                    "to": DossierStatus::Closed,
                    "reason": reason,
                })),
            )
            .await;
            Ok(updated)
        }
        .instrument(span)
        .await
    }

    /// Admin only. Copies the dossier and its step instances into metadata
    /// and stamps `archived_at`. Archiving twice returns the archived dossier.
    pub async fn archive(&self, caller: &Caller, dossier_id: DossierId) -> WorkflowResult<Dossier> {
        let correlation_id = generate_correlation_id();
        let dossier_label = dossier_id.to_string();
        let span = create_workflow_span("archive", Some(&dossier_label), Some(&correlation_id));

        async move {
            caller.require_admin("archiving a dossier")?;
            let dossier = self.load_dossier(caller, dossier_id).await?;
            if dossier.archived_at.is_some() {
                return Ok(dossier);
            }

            let steps = self.store.list_step_instances(dossier_id).await?;
            let mut frozen = dossier.clone();
            frozen.metadata = Value::Null;
            let now = self.now();
            let snapshot = json!({
                "dossier": serde_json::to_value(&frozen).map_err(snapshot_error)?,
                "steps": serde_json::to_value(&steps).map_err(snapshot_error)?,
                "archived_by": caller.id,
                "archived_at": now,
            });

            let status = dossier.status;
            let patch = DossierPatch::new(now)
                .archived_at(now)
                .metadata(ARCHIVE_SNAPSHOT, snapshot);
            let Some(updated) = self.store.patch_dossier_if(dossier_id, status, &patch).await? else {
                // A concurrent archive of the same dossier counts as done.
                let current = self.load_dossier(caller, dossier_id).await?;
                if current.archived_at.is_some() {
                    return Ok(current);
                }
                return Err(WorkflowError::Conflict {
                    reason: format!("dossier {dossier_id} changed while archiving"),
                });
            };

            info!(dossier_id = %dossier_id, steps = steps.len(), "Dossier archived");
            self.record(
                caller,
                EventDraft::new(
                    Some(dossier_id),
                    EntityType::Dossier,
                    dossier_id,
                    EventType::DossierArchived,
                )
                .with_payload(json!({ "status": status, "steps": steps.len() })),
            )
            .await;
            Ok(updated)
        }
        .instrument(span)
        .await
    }

    /// Completed step instances over the product's template steps.
    pub async fn progress(&self, caller: &Caller, dossier_id: DossierId) -> WorkflowResult<Progress> {
        let dossier = self.load_dossier(caller, dossier_id).await?;
        let total = self.catalog.product(&dossier.product_id)?.total_steps();
        let completed = self
            .store
            .list_step_instances(dossier_id)
            .await?
            .iter()
            .filter(|s| s.is_completed())
            .count();
        Ok(Progress::new(completed, total))
    }
}

fn already_cancelled(dossier: Dossier, reason: &str) -> WorkflowResult<Dossier> {
    match dossier.metadata_str(CANCELLATION_REASON) {
        Some(existing) if existing == reason => {
            info!(dossier_id = %dossier.id, "Dossier already cancelled with the same reason");
            Ok(dossier)
        }
        _ => Err(WorkflowError::precondition(format!(
            "dossier {} is already closed",
            dossier.id
        ))),
    }
}

fn snapshot_error(err: serde_json::Error) -> WorkflowError {
    WorkflowError::Store(StoreError::Backend(format!("archive snapshot: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_support::*;
    use crate::store::DossierStore;

    #[test]
    fn test_progress_percent() {
        assert_eq!(Progress::new(1, 3).percent, 33);
        assert_eq!(Progress::new(3, 3).percent, 100);
        assert_eq!(Progress::new(0, 0).percent, 0);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent_for_same_reason() {
        let h = harness();
        let (dossier, _) = seeded_dossier(&h).await;
        let agent = Caller::agent("a1");

        let closed = h
            .engine
            .cancel(&agent, dossier.id, "client requested refund")
            .await
            .unwrap();
        assert_eq!(closed.status, DossierStatus::Closed);
        assert_eq!(
            closed.metadata_str(CANCELLATION_REASON),
            Some("client requested refund")
        );
        assert_eq!(closed.metadata_str(CANCELLED_BY), Some("a1"));

        let again = h
            .engine
            .cancel(&agent, dossier.id, "client requested refund")
            .await
            .unwrap();
        assert_eq!(again, closed);

        let err = h
            .engine
            .cancel(&agent, dossier.id, "duplicate dossier")
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::PreconditionFailed { .. }));

        let events = h.store.list_events(dossier.id).await.unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn test_set_status_rules() {
        let h = harness();
        let (dossier, _) = seeded_dossier(&h).await;
        let agent = Caller::agent("a1");

        let err = h
            .engine
            .set_status(&Caller::client("c1"), dossier.id, DossierStatus::LlcFiled)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Forbidden { .. }));

        let updated = h
            .engine
            .set_status(&agent, dossier.id, DossierStatus::LlcFiled)
            .await
            .unwrap();
        assert_eq!(updated.status, DossierStatus::LlcFiled);

        let unchanged = h
            .engine
            .set_status(&agent, dossier.id, DossierStatus::LlcFiled)
            .await
            .unwrap();
        assert_eq!(unchanged, updated);
        assert_eq!(h.store.list_events(dossier.id).await.unwrap().len(), 1);

        h.engine
            .cancel(&agent, dossier.id, "client went silent")
            .await
            .unwrap();
        let err = h
            .engine
            .set_status(&agent, dossier.id, DossierStatus::BankOpened)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::PreconditionFailed { .. }));
    }

    #[tokio::test]
    async fn test_archive_snapshots_steps() {
        let h = harness();
        let (dossier, steps) = seeded_dossier(&h).await;

        let err = h
            .engine
            .archive(&Caller::agent("a1"), dossier.id)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Forbidden { .. }));

        let archived = h
            .engine
            .archive(&Caller::admin("ad1"), dossier.id)
            .await
            .unwrap();
        assert!(archived.archived_at.is_some());
        let snapshot = &archived.metadata[ARCHIVE_SNAPSHOT];
        assert_eq!(snapshot["steps"].as_array().map(Vec::len), Some(steps.len()));
        assert_eq!(snapshot["dossier"]["id"], json!(dossier.id));

        let again = h
            .engine
            .archive(&Caller::admin("ad1"), dossier.id)
            .await
            .unwrap();
        assert_eq!(again.archived_at, archived.archived_at);
    }

    #[tokio::test]
    async fn test_progress_counts_completed_steps() {
        let h = harness();
        let (dossier, steps) = seeded_dossier(&h).await;
        let client = Caller::client("c1");

        let before = h.engine.progress(&client, dossier.id).await.unwrap();
        assert_eq!(before, Progress::new(0, 3));

        h.engine
            .force_complete_step(&Caller::admin("ad1"), steps[0].id, "verified by phone")
            .await
            .unwrap();
        let after = h.engine.progress(&client, dossier.id).await.unwrap();
        assert_eq!(after.completed, 1);
        assert_eq!(after.percent, 33);
    }
}
