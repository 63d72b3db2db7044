// Step lifecycle operations
// Every write goes through a status-guarded store primitive; the transition
// table only decides whether it is worth attempting.

use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::{info, warn, Instrument};

use super::state_machine::{StepTransition, TransitionResult};
use crate::catalog::{Product, StepTemplate};
use crate::engine::DossierEngine;
use crate::error::{WorkflowError, WorkflowResult};
use crate::events::EventDraft;
use crate::identity::Caller;
use crate::model::{
    Dossier, DossierId, DossierStatus, EntityType, EventType, StepInstance, StepInstanceId,
    StepStatus, StepTemplateId,
};
use crate::store::{
    ApprovalGate, ApprovalOutcome, DossierPatch, FieldWrite, StepChange, UpsertOutcome,
    UpsertPolicy,
};
use crate::telemetry::{create_workflow_span, generate_correlation_id};

/// What a submission did to each field it carried.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmissionReport {
    pub written: Vec<String>,
    pub skipped: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubmittedStep {
    pub step: StepInstance,
    pub report: SubmissionReport,
}

impl DossierEngine {
    /// Finds or lazily creates the instance of a template step and makes it
    /// the dossier's current step.
    pub async fn start_step(
        &self,
        caller: &Caller,
        dossier_id: DossierId,
        step_template_id: &StepTemplateId,
    ) -> WorkflowResult<StepInstance> {
        let correlation_id = generate_correlation_id();
        let dossier_label = dossier_id.to_string();
        let span = create_workflow_span("start_step", Some(&dossier_label), Some(&correlation_id));

        async move {
            let dossier = self.load_dossier(caller, dossier_id).await?;
            let product = self.catalog.product(&dossier.product_id)?;
            let template = product
                .step(step_template_id)
                .ok_or_else(|| WorkflowError::not_found("step template", step_template_id))?;
            self.check_sequencing(caller, &dossier, product, template)
                .await?;

            let now = self.now();
            let step = self
                .store
                .ensure_step_instance(&StepInstance::new(
                    dossier.id,
                    template.id.clone(),
                    template.position,
                    now,
                ))
                .await?;
            self.make_current(caller, &dossier, &step).await?;

            self.reload_step(step.id).await
        }
        .instrument(span)
        .await
    }

    /// Client submission of a step's field values.
    ///
    /// Every key must name a field of the template and every value must match
    /// its kind before anything is written. On a REJECTED step only fields
    /// currently REJECTED are rewritten; otherwise APPROVED fields are kept.
    /// Fields that are left alone are reported in `skipped` and logged.
    pub async fn submit_step(
        &self,
        caller: &Caller,
        step_instance_id: StepInstanceId,
        values: BTreeMap<String, Value>,
    ) -> WorkflowResult<SubmittedStep> {
        let correlation_id = generate_correlation_id();
        let span = create_workflow_span("submit_step", None, Some(&correlation_id));

        async move {
            let (dossier, step) = self.load_step(caller, step_instance_id).await?;
            let product = self.catalog.product(&dossier.product_id)?;
            let template = self.template_for(&dossier, &step)?;
            self.check_sequencing(caller, &dossier, product, template)
                .await?;
            StepTransition::Submit.check(&step)?;

            let mut writes = Vec::with_capacity(values.len());
            for (key, value) in values {
                let definition = template.field_by_key(&key).ok_or_else(|| {
                    WorkflowError::invalid(format!("unknown field key {key} for step {}", template.id))
                })?;
                definition
                    .kind
                    .validate(&value)
                    .map_err(|reason| WorkflowError::invalid(format!("{key}: {reason}")))?;
                writes.push((key, definition.id.clone(), value));
            }

            let resubmission = step.status == StepStatus::Rejected;
            let policy = if resubmission {
                UpsertPolicy::CORRECTION
            } else {
                UpsertPolicy::SUBMISSION
            };

            let now = self.now();
            let mut report = SubmissionReport::default();
            for (key, field_id, value) in writes {
                let write = FieldWrite {
                    step_instance_id,
                    field_id,
                    value,
                    submitted_by: caller.id.clone(),
                    now,
                };
                match self.store.upsert_field_value(&write, policy).await? {
                    UpsertOutcome::Inserted(_) | UpsertOutcome::Updated(_) => {
                        report.written.push(key)
                    }
                    UpsertOutcome::Skipped { current } => {
                        warn!(
                            dossier_id = %dossier.id,
                            step_instance_id = %step_instance_id,
                            field = %key,
                            current = ?current,
                            "Field is not open for resubmission, left unchanged"
                        );
                        report.skipped.push(key);
                    }
                    UpsertOutcome::StepApproved => report.skipped.push(key),
                }
            }

            let updated = self
                .store
                .apply_step_change(step_instance_id, step.status, &StepChange::Submit { now })
                .await?
                .ok_or_else(|| concurrent_change(step_instance_id))?;
            self.make_current(caller, &dossier, &updated).await?;

            info!(
                dossier_id = %dossier.id,
                step_instance_id = %step_instance_id,
                from = %step.status,
                written = report.written.len(),
                skipped = report.skipped.len(),
                "Step submitted"
            );
            self.record(
                caller,
                EventDraft::new(
                    Some(dossier.id),
                    EntityType::StepInstance,
                    step_instance_id,
                    EventType::StepSubmitted,
                )
                .with_payload(json!({
                    "from": step.status,
                    "resubmission": resubmission,
                    "fields": report.written,
                    "skipped_fields": report.skipped,
                })),
            )
            .await;

            Ok(SubmittedStep {
                step: self.reload_step(step_instance_id).await?,
                report,
            })
        }
        .instrument(span)
        .await
    }

    /// Staff picks up a submitted step.
    pub async fn start_review(
        &self,
        caller: &Caller,
        step_instance_id: StepInstanceId,
    ) -> WorkflowResult<StepInstance> {
        let correlation_id = generate_correlation_id();
        let span = create_workflow_span("start_review", None, Some(&correlation_id));

        async move {
            caller.require_staff("starting a review")?;
            let (dossier, step) = self.load_step(caller, step_instance_id).await?;
            if StepTransition::StartReview.check(&step)? == TransitionResult::AlreadyDone {
                return Ok(step);
            }

            let change = StepChange::StartReview {
                reviewer: caller.id.clone(),
                now: self.now(),
            };
            let updated = self
                .store
                .apply_step_change(step_instance_id, step.status, &change)
                .await?
                .ok_or_else(|| concurrent_change(step_instance_id))?;

            info!(
                dossier_id = %dossier.id,
                step_instance_id = %step_instance_id,
                reviewer = %caller.id,
                "Step review started"
            );
            self.record(
                caller,
                EventDraft::new(
                    Some(dossier.id),
                    EntityType::StepInstance,
                    step_instance_id,
                    EventType::StepReviewStarted,
                ),
            )
            .await;
            Ok(updated)
        }
        .instrument(span)
        .await
    }

    /// Approves a step once every field value and every required document
    /// is APPROVED. The gate is evaluated by the store in the same atomic
    /// unit as the status write.
    pub async fn approve_step(
        &self,
        caller: &Caller,
        step_instance_id: StepInstanceId,
    ) -> WorkflowResult<StepInstance> {
        let correlation_id = generate_correlation_id();
        let span = create_workflow_span("approve_step", None, Some(&correlation_id));

        async move {
            caller.require_staff("approving a step")?;
            let (dossier, step) = self.load_step(caller, step_instance_id).await?;
            let template = self.template_for(&dossier, &step)?;
            if StepTransition::Approve.check(&step)? == TransitionResult::AlreadyDone {
                return Ok(step);
            }

            let required_fields = template.required_field_ids();
            let gate = ApprovalGate {
                required_fields: &required_fields,
                required_document_types: &template.required_document_types,
            };
            let outcome = self
                .store
                .approve_step_if_ready(step_instance_id, &caller.id, gate, self.now())
                .await?;

            match outcome {
                ApprovalOutcome::Approved(approved) => {
                    info!(
                        dossier_id = %dossier.id,
                        step_instance_id = %step_instance_id,
                        reviewer = %caller.id,
                        "Step approved"
                    );
                    self.record(
                        caller,
                        EventDraft::new(
                            Some(dossier.id),
                            EntityType::StepInstance,
                            step_instance_id,
                            EventType::StepCompleted,
                        )
                        .with_payload(json!({
                            "manual": false,
                            "status": approved.status,
                        })),
                    )
                    .await;
                    self.notify(
                        &dossier.owner_id,
                        "step_completed",
                        json!({
                            "dossier_id": dossier.id,
                            "step": template.label,
                        }),
                    )
                    .await;
                    self.advance_after(caller, &dossier, &approved).await?;
                    self.reload_step(step_instance_id).await
                }
                ApprovalOutcome::AlreadyApproved(current) => Ok(current),
                ApprovalOutcome::Blocked(report) => {
                    let fields: Vec<&str> =
                        report.unapproved_fields.iter().map(|f| f.as_str()).collect();
                    let documents: Vec<&str> = report
                        .unapproved_documents
                        .iter()
                        .map(|d| d.as_str())
                        .collect();
                    Err(WorkflowError::precondition(format!(
                        "step {step_instance_id} has unapproved fields {fields:?} and documents {documents:?}"
                    )))
                }
                ApprovalOutcome::Missing => {
                    Err(WorkflowError::not_found("step instance", step_instance_id))
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Sends a step back to the client for correction.
    pub async fn reject_step(
        &self,
        caller: &Caller,
        step_instance_id: StepInstanceId,
        reason: &str,
    ) -> WorkflowResult<StepInstance> {
        let correlation_id = generate_correlation_id();
        let span = create_workflow_span("reject_step", None, Some(&correlation_id));

        async move {
            caller.require_staff("rejecting a step")?;
            let reason = self.validate_reason(Some(reason))?;
            let (dossier, step) = self.load_step(caller, step_instance_id).await?;
            let template = self.template_for(&dossier, &step)?;
            StepTransition::Reject.check(&step)?;

            let change = StepChange::Reject {
                reviewer: caller.id.clone(),
                reason: reason.clone(),
                now: self.now(),
            };
            let updated = self
                .store
                .apply_step_change(step_instance_id, step.status, &change)
                .await?
                .ok_or_else(|| concurrent_change(step_instance_id))?;

            info!(
                dossier_id = %dossier.id,
                step_instance_id = %step_instance_id,
                reviewer = %caller.id,
                "Step rejected"
            );
            self.record(
                caller,
                EventDraft::new(
                    Some(dossier.id),
                    EntityType::StepInstance,
                    step_instance_id,
                    EventType::StepRejected,
                )
                .with_payload(json!({ "from": step.status, "reason": reason })),
            )
            .await;
            self.notify(
                &dossier.owner_id,
                "step_rejected",
                json!({
                    "dossier_id": dossier.id,
                    "step": template.label,
                    "reason": reason,
                }),
            )
            .await;
            Ok(updated)
        }
        .instrument(span)
        .await
    }

    /// Admin override: marks the step completed without the approval gate and
    /// without changing its validation status.
    pub async fn force_complete_step(
        &self,
        caller: &Caller,
        step_instance_id: StepInstanceId,
        note: &str,
    ) -> WorkflowResult<StepInstance> {
        let correlation_id = generate_correlation_id();
        let span = create_workflow_span("force_complete_step", None, Some(&correlation_id));

        async move {
            caller.require_admin("force-completing a step")?;
            let note = note.trim();
            if note.is_empty() {
                return Err(WorkflowError::invalid("a note is required to force-complete a step"));
            }
            let (dossier, step) = self.load_step(caller, step_instance_id).await?;
            let template = self.template_for(&dossier, &step)?;
            if StepTransition::ForceComplete.check(&step)? == TransitionResult::AlreadyDone {
                return Ok(step);
            }

            let updated = self
                .store
                .apply_step_change(
                    step_instance_id,
                    step.status,
                    &StepChange::ForceComplete { now: self.now() },
                )
                .await?
                .ok_or_else(|| concurrent_change(step_instance_id))?;

            warn!(
                dossier_id = %dossier.id,
                step_instance_id = %step_instance_id,
                admin = %caller.id,
                status = %updated.status,
                "Step force-completed"
            );
            self.record(
                caller,
                EventDraft::new(
                    Some(dossier.id),
                    EntityType::StepInstance,
                    step_instance_id,
                    EventType::StepCompleted,
                )
                .with_payload(json!({
                    "manual": true,
                    "note": note,
                    "status": updated.status,
                })),
            )
            .await;
            self.notify(
                &dossier.owner_id,
                "step_completed",
                json!({
                    "dossier_id": dossier.id,
                    "step": template.label,
                }),
            )
            .await;
            self.advance_after(caller, &dossier, &updated).await?;
            self.reload_step(step_instance_id).await
        }
        .instrument(span)
        .await
    }

    pub(crate) async fn reload_step(
        &self,
        step_instance_id: StepInstanceId,
    ) -> WorkflowResult<StepInstance> {
        self.store
            .get_step_instance(step_instance_id)
            .await?
            .ok_or_else(|| WorkflowError::not_found("step instance", step_instance_id))
    }

    /// A client may open a step other than the first only once the step
    /// before it has been submitted at least once. Staff are not sequenced.
    async fn check_sequencing(
        &self,
        caller: &Caller,
        dossier: &Dossier,
        product: &Product,
        template: &StepTemplate,
    ) -> WorkflowResult<()> {
        if caller.is_staff() {
            return Ok(());
        }
        let steps = product.ordered_steps();
        let Some(index) = steps.iter().position(|s| s.id == template.id) else {
            return Err(WorkflowError::not_found("step template", &template.id));
        };
        if index == 0 {
            return Ok(());
        }

        let previous = &steps[index - 1];
        let instances = self.store.list_step_instances(dossier.id).await?;
        let submitted = instances
            .iter()
            .find(|s| s.step_template_id == previous.id)
            .is_some_and(|s| s.status.has_been_submitted());
        if submitted {
            Ok(())
        } else {
            Err(WorkflowError::precondition(format!(
                "step {} must be submitted before {}",
                previous.id, template.id
            )))
        }
    }

    /// Points the dossier at `step` and stamps its start the first time.
    async fn make_current(
        &self,
        caller: &Caller,
        dossier: &Dossier,
        step: &StepInstance,
    ) -> WorkflowResult<()> {
        let now = self.now();
        if !self
            .store
            .set_current_step(dossier.id, step.id, now)
            .await?
        {
            return Err(WorkflowError::not_found("step instance", step.id));
        }
        if self.store.mark_step_started(step.id, now).await? {
            info!(
                dossier_id = %dossier.id,
                step_instance_id = %step.id,
                "Step started"
            );
            self.record(
                caller,
                EventDraft::new(
                    Some(dossier.id),
                    EntityType::StepInstance,
                    step.id,
                    EventType::StepStarted,
                )
                .with_payload(json!({ "step_template_id": step.step_template_id })),
            )
            .await;
        }
        Ok(())
    }

    /// After a completion: the next step becomes current, or the dossier is
    /// completed when the final step was the one completed. The pointer only
    /// moves if it still points at the completed step.
    async fn advance_after(
        &self,
        caller: &Caller,
        dossier: &Dossier,
        completed: &StepInstance,
    ) -> WorkflowResult<()> {
        let dossier = self
            .store
            .get_dossier(dossier.id)
            .await?
            .ok_or_else(|| WorkflowError::not_found("dossier", dossier.id))?;
        let product = self.catalog.product(&dossier.product_id)?;
        let next = product
            .ordered_steps()
            .iter()
            .find(|t| t.position > completed.position);

        match next {
            Some(template) => {
                let follows_pointer = dossier
                    .current_step_instance_id
                    .map_or(true, |current| current == completed.id);
                if !follows_pointer {
                    return Ok(());
                }
                let step = self
                    .store
                    .ensure_step_instance(&StepInstance::new(
                        dossier.id,
                        template.id.clone(),
                        template.position,
                        self.now(),
                    ))
                    .await?;
                self.make_current(caller, &dossier, &step).await
            }
            None => self.complete_dossier(caller, dossier).await,
        }
    }

    async fn complete_dossier(&self, caller: &Caller, dossier: Dossier) -> WorkflowResult<()> {
        if dossier.status.is_terminal() || dossier.archived_at.is_some() {
            return Ok(());
        }
        let from = dossier.status;
        let now = self.now();
        let patch = DossierPatch::new(now)
            .status(DossierStatus::Completed)
            .completed_at(now);

        let Some(completed) = self.store.patch_dossier_if(dossier.id, from, &patch).await? else {
            warn!(
                dossier_id = %dossier.id,
                "Dossier status changed while completing the final step, left as is"
            );
            return Ok(());
        };

        info!(dossier_id = %completed.id, from = %from, "Dossier completed");
        self.record(
            caller,
            EventDraft::new(
                Some(completed.id),
                EntityType::Dossier,
                completed.id,
                EventType::DossierStatusChanged,
            )
            .with_payload(json!({ "from": from, "to": DossierStatus::Completed })),
        )
        .await;
        Ok(())
    }
}

fn concurrent_change(step_instance_id: StepInstanceId) -> WorkflowError {
    WorkflowError::Conflict {
        reason: format!("step {step_instance_id} changed concurrently, reload and retry"),
    }
}
