//! Document review tracker: uploads, staff deliveries, reviews and versions.
//!
//! Versions are immutable. The store assigns version numbers and repoints the
//! document at its newest version in one write; reviews are appended as
//! separate rows and only ever target the current version.

use serde_json::json;
use tracing::{info, Instrument};

use crate::engine::DossierEngine;
use crate::error::{StoreError, WorkflowError, WorkflowResult};
use crate::events::EventDraft;
use crate::identity::Caller;
use crate::model::{
    Document, DocumentId, DocumentReview, DocumentReviewId, DocumentStatus, DocumentTypeId,
    DocumentVersion, DocumentVersionId, Dossier, DossierId, EntityType, EventType,
    ReviewDecision, StepInstanceId,
};
use crate::store::NewVersion;
use crate::telemetry::{create_workflow_span, generate_correlation_id};

/// A file headed for a dossier.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadRequest {
    pub dossier_id: DossierId,
    pub document_type_id: DocumentTypeId,
    /// `None` for ad-hoc deliveries outside any step
    pub step_instance_id: Option<StepInstanceId>,
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub document: Document,
    pub version: DocumentVersion,
}

/// Where the bytes of one version live in the object store.
pub fn object_key(
    dossier_id: DossierId,
    document_id: DocumentId,
    version_id: DocumentVersionId,
    file_name: &str,
) -> String {
    format!("dossiers/{dossier_id}/documents/{document_id}/{version_id}/{file_name}")
}

impl DossierEngine {
    /// Client upload. Every call creates a new document; earlier live
    /// documents of the same type on the step become OUTDATED. Staff callers
    /// are routed to [`DossierEngine::deliver_document`].
    pub async fn upload_document(
        &self,
        caller: &Caller,
        request: UploadRequest,
    ) -> WorkflowResult<StoredDocument> {
        if caller.is_staff() {
            return self.deliver_document(caller, request).await;
        }

        let correlation_id = generate_correlation_id();
        let dossier_label = request.dossier_id.to_string();
        let span = create_workflow_span(
            "upload_document",
            Some(&dossier_label),
            Some(&correlation_id),
        );

        async move {
            let dossier = self.load_dossier(caller, request.dossier_id).await?;
            self.check_upload_target(&dossier, &request).await?;

            let now = self.now();
            let document = Document {
                id: DocumentId::new(),
                dossier_id: dossier.id,
                document_type_id: request.document_type_id.clone(),
                step_instance_id: request.step_instance_id,
                status: DocumentStatus::Pending,
                current_version_id: None,
                created_at: now,
                updated_at: now,
            };
            let new_version = self.put_version(caller, &dossier, document.id, &request).await?;
            let (document, version, outdated) = self
                .store
                .insert_document_with_version(&document, new_version, true)
                .await?;

            info!(
                dossier_id = %dossier.id,
                document_id = %document.id,
                version_number = version.version_number,
                outdated,
                "Document uploaded"
            );
            self.record(
                caller,
                EventDraft::new(
                    Some(dossier.id),
                    EntityType::Document,
                    document.id,
                    EventType::DocumentUploaded,
                )
                .with_payload(json!({
                    "document_type_id": document.document_type_id,
                    "step_instance_id": document.step_instance_id,
                    "version_number": version.version_number,
                    "file_name": version.file_name,
                    "outdated": outdated,
                })),
            )
            .await;

            Ok(StoredDocument { document, version })
        }
        .instrument(span)
        .await
    }

    /// Staff delivery. Attaches a new version to the live document for
    /// (dossier, type, step) or creates one, approved with no pending state.
    pub async fn deliver_document(
        &self,
        caller: &Caller,
        request: UploadRequest,
    ) -> WorkflowResult<StoredDocument> {
        let correlation_id = generate_correlation_id();
        let dossier_label = request.dossier_id.to_string();
        let span = create_workflow_span(
            "deliver_document",
            Some(&dossier_label),
            Some(&correlation_id),
        );

        async move {
            caller.require_staff("delivering a document")?;
            let dossier = self.load_dossier(caller, request.dossier_id).await?;
            self.check_upload_target(&dossier, &request).await?;

            let now = self.now();
            let existing = self
                .store
                .find_live_document(
                    dossier.id,
                    &request.document_type_id,
                    request.step_instance_id,
                )
                .await?;
            let (document_id, created) = match existing {
                Some(document) => (document.id, false),
                None => (DocumentId::new(), true),
            };

            let new_version = self.put_version(caller, &dossier, document_id, &request).await?;
            let version = if created {
                // A new staff delivery supersedes whatever the client had on the step.
                let document = Document {
                    id: document_id,
                    dossier_id: dossier.id,
                    document_type_id: request.document_type_id.clone(),
                    step_instance_id: request.step_instance_id,
                    status: DocumentStatus::Approved,
                    current_version_id: None,
                    created_at: now,
                    updated_at: now,
                };
                let (_, version, _) = self
                    .store
                    .insert_document_with_version(&document, new_version, true)
                    .await?;
                version
            } else {
                self.store
                    .append_document_version(document_id, new_version, DocumentStatus::Approved)
                    .await?
            };

            let review = DocumentReview {
                id: DocumentReviewId::new(),
                document_id,
                version_id: version.id,
                decision: ReviewDecision::Approve,
                reason: None,
                reviewer_id: caller.id.clone(),
                automatic: true,
                created_at: now,
            };
            if !self
                .store
                .record_document_review(&review, DocumentStatus::Approved)
                .await?
            {
                return Err(WorkflowError::Conflict {
                    reason: format!("document {document_id} changed during delivery"),
                });
            }

            info!(
                dossier_id = %dossier.id,
                document_id = %document_id,
                version_number = version.version_number,
                created,
                "Document delivered"
            );
            self.record(
                caller,
                EventDraft::new(
                    Some(dossier.id),
                    EntityType::Document,
                    document_id,
                    EventType::DocumentDelivered,
                )
                .with_payload(json!({
                    "document_type_id": request.document_type_id,
                    "step_instance_id": request.step_instance_id,
                    "version_number": version.version_number,
                    "file_name": version.file_name,
                })),
            )
            .await;
            self.notify(
                &dossier.owner_id,
                "document_delivered",
                json!({
                    "dossier_id": dossier.id,
                    "document_id": document_id,
                    "document_type_id": request.document_type_id,
                    "file_name": version.file_name,
                }),
            )
            .await;

            let document = self.reload_document(document_id).await?;
            Ok(StoredDocument { document, version })
        }
        .instrument(span)
        .await
    }

    /// Staff decision on the current version of a document.
    pub async fn review_document(
        &self,
        caller: &Caller,
        document_id: DocumentId,
        decision: ReviewDecision,
        reason: Option<&str>,
    ) -> WorkflowResult<Document> {
        let correlation_id = generate_correlation_id();
        let span = create_workflow_span("review_document", None, Some(&correlation_id));

        async move {
            caller.require_staff("reviewing a document")?;
            let document = self.reload_document(document_id).await?;
            let dossier = self.load_dossier(caller, document.dossier_id).await?;

            if document.status == DocumentStatus::Outdated {
                return Err(WorkflowError::precondition(format!(
                    "document {document_id} has been superseded"
                )));
            }
            let version_id = document.current_version_id.ok_or_else(|| {
                WorkflowError::precondition(format!("document {document_id} has no version"))
            })?;

            let (status, reason) = match decision {
                ReviewDecision::Approve => (DocumentStatus::Approved, None),
                ReviewDecision::Reject => (
                    DocumentStatus::Rejected,
                    Some(self.validate_reason(reason)?),
                ),
            };
            let review = DocumentReview {
                id: DocumentReviewId::new(),
                document_id,
                version_id,
                decision,
                reason: reason.clone(),
                reviewer_id: caller.id.clone(),
                automatic: false,
                created_at: self.now(),
            };
            if !self.store.record_document_review(&review, status).await? {
                return Err(WorkflowError::precondition(format!(
                    "document {document_id} changed since it was loaded"
                )));
            }

            info!(
                dossier_id = %dossier.id,
                document_id = %document_id,
                decision = %decision,
                "Document reviewed"
            );
            self.record(
                caller,
                EventDraft::new(
                    Some(dossier.id),
                    EntityType::Document,
                    document_id,
                    EventType::DocumentReviewed,
                )
                .with_payload(json!({
                    "version_id": version_id,
                    "decision": decision,
                    "reason": reason,
                })),
            )
            .await;

            self.reload_document(document_id).await
        }
        .instrument(span)
        .await
    }

    /// Oldest version first.
    pub async fn document_versions(
        &self,
        caller: &Caller,
        document_id: DocumentId,
    ) -> WorkflowResult<Vec<DocumentVersion>> {
        let document = self.reload_document(document_id).await?;
        self.load_dossier(caller, document.dossier_id).await?;
        Ok(self.store.list_document_versions(document_id).await?)
    }

    pub async fn document_reviews(
        &self,
        caller: &Caller,
        document_id: DocumentId,
    ) -> WorkflowResult<Vec<DocumentReview>> {
        let document = self.reload_document(document_id).await?;
        self.load_dossier(caller, document.dossier_id).await?;
        Ok(self.store.list_document_reviews(document_id).await?)
    }

    /// Fetches the bytes of one version from the object store.
    pub async fn download_version(
        &self,
        caller: &Caller,
        version_id: DocumentVersionId,
    ) -> WorkflowResult<Vec<u8>> {
        let version = self
            .store
            .get_document_version(version_id)
            .await?
            .ok_or_else(|| WorkflowError::not_found("document version", version_id))?;
        let document = self.reload_document(version.document_id).await?;
        self.load_dossier(caller, document.dossier_id).await?;
        self.objects
            .get(&version.file_url)
            .await
            .map_err(|e| WorkflowError::Store(StoreError::Transient(e.to_string())))
    }

    async fn reload_document(&self, document_id: DocumentId) -> WorkflowResult<Document> {
        self.store
            .get_document(document_id)
            .await?
            .ok_or_else(|| WorkflowError::not_found("document", document_id))
    }

    async fn check_upload_target(
        &self,
        dossier: &Dossier,
        request: &UploadRequest,
    ) -> WorkflowResult<()> {
        if request.file_name.trim().is_empty() {
            return Err(WorkflowError::invalid("file name is empty"));
        }
        if self
            .catalog
            .document_type(&request.document_type_id)
            .is_none()
        {
            return Err(WorkflowError::not_found(
                "document type",
                &request.document_type_id,
            ));
        }
        if let Some(step_id) = request.step_instance_id {
            match self.store.get_step_instance(step_id).await? {
                Some(step) if step.dossier_id == dossier.id => {}
                _ => return Err(WorkflowError::not_found("step instance", step_id)),
            }
        }
        Ok(())
    }

    /// Pushes the bytes to the object store and describes the version.
    async fn put_version(
        &self,
        caller: &Caller,
        dossier: &Dossier,
        document_id: DocumentId,
        request: &UploadRequest,
    ) -> WorkflowResult<NewVersion> {
        let version_id = DocumentVersionId::new();
        let key = object_key(dossier.id, document_id, version_id, &request.file_name);
        let file_url = self
            .objects
            .put(&key, request.bytes.clone())
            .await
            .map_err(|e| WorkflowError::Store(StoreError::Transient(e.to_string())))?;

        Ok(NewVersion {
            id: version_id,
            file_url,
            file_name: request.file_name.clone(),
            size_bytes: request.bytes.len() as u64,
            mime_type: request.mime_type.clone(),
            uploaded_by: caller.id.clone(),
            uploader_type: caller.uploader_type(),
            created_at: self.now(),
        })
    }
}
