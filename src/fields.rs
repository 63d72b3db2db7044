//! Field validation tracker: per-field submission and review.

use serde_json::{json, Value};
use tracing::{info, Instrument};

use crate::engine::DossierEngine;
use crate::error::{WorkflowError, WorkflowResult};
use crate::events::EventDraft;
use crate::identity::Caller;
use crate::model::{
    EntityType, EventType, FieldId, FieldStatus, FieldValue, FieldValueId, ReviewDecision,
    StepInstanceId, StepStatus,
};
use crate::store::{FieldReview, FieldWrite, UpsertOutcome, UpsertPolicy};
use crate::telemetry::{create_workflow_span, generate_correlation_id};

impl DossierEngine {
    /// Upserts one field value and resets it to PENDING. Fields of an
    /// APPROVED step are frozen, and clients never re-open an approved field.
    pub async fn submit_field_value(
        &self,
        caller: &Caller,
        step_instance_id: StepInstanceId,
        field_id: &FieldId,
        value: Value,
    ) -> WorkflowResult<FieldValue> {
        let correlation_id = generate_correlation_id();
        let span = create_workflow_span("submit_field_value", None, Some(&correlation_id));

        async move {
            let (dossier, step) = self.load_step(caller, step_instance_id).await?;
            if step.status == StepStatus::Approved {
                return Err(WorkflowError::precondition(format!(
                    "step {step_instance_id} is approved, its fields can no longer change"
                )));
            }
            let template = self.template_for(&dossier, &step)?;
            let definition = template
                .field(field_id)
                .ok_or_else(|| WorkflowError::not_found("field", field_id))?;
            definition.kind.validate(&value).map_err(|reason| {
                WorkflowError::invalid(format!("{}: {reason}", definition.key))
            })?;

            let write = FieldWrite {
                step_instance_id,
                field_id: field_id.clone(),
                value,
                submitted_by: caller.id.clone(),
                now: self.now(),
            };
            let policy = if caller.is_staff() {
                UpsertPolicy::ALWAYS
            } else {
                UpsertPolicy::SUBMISSION
            }
            .on_open_step();
            match self.store.upsert_field_value(&write, policy).await? {
                UpsertOutcome::Inserted(field) | UpsertOutcome::Updated(field) => Ok(field),
                UpsertOutcome::Skipped { current } => Err(WorkflowError::precondition(format!(
                    "field {field_id} could not be written from {current:?}"
                ))),
                UpsertOutcome::StepApproved => Err(WorkflowError::precondition(format!(
                    "step {step_instance_id} is approved, its fields can no longer change"
                ))),
            }
        }
        .instrument(span)
        .await
    }

    /// Records a staff decision on a single field value.
    pub async fn review_field(
        &self,
        caller: &Caller,
        field_value_id: FieldValueId,
        decision: ReviewDecision,
        reason: Option<&str>,
    ) -> WorkflowResult<FieldValue> {
        let correlation_id = generate_correlation_id();
        let span = create_workflow_span("review_field", None, Some(&correlation_id));

        async move {
            caller.require_staff("reviewing a field")?;
            let field = self
                .store
                .get_field_value(field_value_id)
                .await?
                .ok_or_else(|| WorkflowError::not_found("field value", field_value_id))?;
            let (dossier, _) = self.load_step(caller, field.step_instance_id).await?;

            let (status, reason) = match decision {
                ReviewDecision::Approve => (FieldStatus::Approved, None),
                ReviewDecision::Reject => {
                    (FieldStatus::Rejected, Some(self.validate_reason(reason)?))
                }
            };
            let review = FieldReview {
                status,
                reason: reason.clone(),
                reviewer: caller.id.clone(),
                now: self.now(),
            };
            let updated = self
                .store
                .review_field_value(field_value_id, &review)
                .await?
                .ok_or_else(|| WorkflowError::not_found("field value", field_value_id))?;

            info!(
                dossier_id = %dossier.id,
                field_id = %updated.field_id,
                decision = %decision,
                "Field reviewed"
            );
            self.record(
                caller,
                EventDraft::new(
                    Some(dossier.id),
                    EntityType::FieldValue,
                    field_value_id,
                    EventType::FieldReviewed,
                )
                .with_payload(json!({
                    "step_instance_id": updated.step_instance_id,
                    "field_id": updated.field_id,
                    "decision": decision,
                    "reason": reason,
                })),
            )
            .await;

            Ok(updated)
        }
        .instrument(span)
        .await
    }
}
