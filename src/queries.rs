//! Read models for dashboards and admin tooling.

use serde::Serialize;

use crate::documents::StoredDocument;
use crate::engine::DossierEngine;
use crate::error::WorkflowResult;
use crate::identity::Caller;
use crate::model::{
    DocumentStatus, Dossier, DossierId, Event, FieldStatus, FieldValue, StepActor, StepInstance,
    UploaderType,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FieldCounts {
    pub total: usize,
    pub approved: usize,
    pub rejected: usize,
    pub pending: usize,
}

impl FieldCounts {
    pub fn tally(fields: &[FieldValue]) -> Self {
        let count = |status: FieldStatus| fields.iter().filter(|f| f.status == status).count();
        Self {
            total: fields.len(),
            approved: count(FieldStatus::Approved),
            rejected: count(FieldStatus::Rejected),
            pending: count(FieldStatus::Pending),
        }
    }
}

/// One step instance with everything a reviewer needs to judge it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepOverview {
    pub step: StepInstance,
    pub label: String,
    pub actor: StepActor,
    pub fields: Vec<FieldValue>,
    pub counts: FieldCounts,
    /// Documents on the step that are not OUTDATED
    pub live_documents: usize,
    pub approved_documents: usize,
}

impl DossierEngine {
    pub async fn dossier(&self, caller: &Caller, dossier_id: DossierId) -> WorkflowResult<Dossier> {
        self.load_dossier(caller, dossier_id).await
    }

    /// Step instances in template order.
    pub async fn step_overview(
        &self,
        caller: &Caller,
        dossier_id: DossierId,
    ) -> WorkflowResult<Vec<StepOverview>> {
        let dossier = self.load_dossier(caller, dossier_id).await?;
        let steps = self.store.list_step_instances(dossier_id).await?;

        let mut overview = Vec::with_capacity(steps.len());
        for step in steps {
            let template = self.template_for(&dossier, &step)?;
            let fields = self.store.list_field_values(step.id).await?;
            let documents = self.store.list_step_documents(step.id).await?;
            let live: Vec<_> = documents
                .iter()
                .filter(|d| d.status != DocumentStatus::Outdated)
                .collect();

            overview.push(StepOverview {
                label: template.label.clone(),
                actor: template.actor,
                counts: FieldCounts::tally(&fields),
                live_documents: live.len(),
                approved_documents: live
                    .iter()
                    .filter(|d| d.status == DocumentStatus::Approved)
                    .count(),
                fields,
                step,
            });
        }
        Ok(overview)
    }

    /// Staff only. Newest first.
    pub async fn audit_trail(
        &self,
        caller: &Caller,
        dossier_id: DossierId,
    ) -> WorkflowResult<Vec<Event>> {
        caller.require_staff("reading the audit trail")?;
        self.load_dossier(caller, dossier_id).await?;
        let mut events = self.store.list_events(dossier_id).await?;
        events.reverse();
        Ok(events)
    }

    /// Documents whose current version was uploaded by staff, newest first.
    pub async fn delivery_history(
        &self,
        caller: &Caller,
        dossier_id: DossierId,
    ) -> WorkflowResult<Vec<StoredDocument>> {
        self.load_dossier(caller, dossier_id).await?;
        let documents = self.store.list_documents(dossier_id).await?;

        let mut deliveries = Vec::new();
        for document in documents {
            let Some(version_id) = document.current_version_id else {
                continue;
            };
            let Some(version) = self.store.get_document_version(version_id).await? else {
                continue;
            };
            if version.uploader_type == UploaderType::Agent {
                deliveries.push(StoredDocument { document, version });
            }
        }
        deliveries.sort_by(|a, b| b.version.created_at.cmp(&a.version.created_at));
        Ok(deliveries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::documents::UploadRequest;
    use crate::engine::test_support::*;
    use crate::error::WorkflowError;
    use crate::model::{DocumentTypeId, EventType, FieldId, ReviewDecision};
    use serde_json::json;

    fn upload(dossier_id: DossierId, doc_type: &str, name: &str) -> UploadRequest {
        UploadRequest {
            dossier_id,
            document_type_id: DocumentTypeId::from(doc_type),
            step_instance_id: None,
            file_name: name.to_string(),
            mime_type: "application/pdf".to_string(),
            bytes: vec![1, 2, 3],
        }
    }

    #[tokio::test]
    async fn test_step_overview_counts_fields() {
        let h = harness();
        let (dossier, steps) = seeded_dossier(&h).await;
        let client = Caller::client("c1");

        let field = h
            .engine
            .submit_field_value(&client, steps[0].id, &FieldId::from("email"), json!("a@b.co"))
            .await
            .unwrap();
        h.engine
            .review_field(&Caller::agent("a1"), field.id, ReviewDecision::Approve, None)
            .await
            .unwrap();

        let overview = h.engine.step_overview(&client, dossier.id).await.unwrap();
        assert_eq!(overview.len(), 3);
        assert_eq!(overview[0].label, "Identity");
        assert_eq!(
            overview[0].counts,
            FieldCounts {
                total: 1,
                approved: 1,
                rejected: 0,
                pending: 0
            }
        );
        assert_eq!(overview[2].actor, StepActor::Admin);
        assert_eq!(overview[2].counts, FieldCounts::default());
    }

    #[tokio::test]
    async fn test_audit_trail_is_newest_first_and_staff_only() {
        let h = harness();
        let (dossier, _) = seeded_dossier(&h).await;
        let agent = Caller::agent("a1");

        h.engine
            .set_status(&agent, dossier.id, crate::model::DossierStatus::InProgress)
            .await
            .unwrap();
        h.engine
            .cancel(&agent, dossier.id, "client asked to stop")
            .await
            .unwrap();

        let trail = h.engine.audit_trail(&agent, dossier.id).await.unwrap();
        assert_eq!(trail.len(), 2);
        assert!(trail[0].created_at >= trail[1].created_at);
        assert_eq!(trail[0].payload["to"], json!("CLOSED"));
        assert!(trail
            .iter()
            .all(|e| e.event_type == EventType::DossierStatusChanged));

        let err = h
            .engine
            .audit_trail(&Caller::client("c1"), dossier.id)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Forbidden { .. }));
    }

    #[tokio::test]
    async fn test_delivery_history_lists_staff_uploads_only() {
        let h = harness();
        let (dossier, _) = seeded_dossier(&h).await;
        let client = Caller::client("c1");

        h.engine
            .upload_document(&client, upload(dossier.id, "passport", "mine.pdf"))
            .await
            .unwrap();
        h.engine
            .deliver_document(&Caller::agent("a1"), upload(dossier.id, "articles", "articles.pdf"))
            .await
            .unwrap();

        let history = h.engine.delivery_history(&client, dossier.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].version.file_name, "articles.pdf");
        assert_eq!(history[0].version.uploader_type, UploaderType::Agent);
    }
}
