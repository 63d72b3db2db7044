//! Storage seam.
//!
//! Every method that has a check-then-act shape performs the check and the
//! write as one atomic unit inside the backend (a single write guard for the
//! in-memory store, a conditional statement or transaction for SQLite).
//! Callers never rely on a value they read earlier in the same request.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::model::*;

pub mod memory;
#[cfg(feature = "database")]
pub mod sqlite;

pub use memory::InMemoryStore;

pub type StoreResult<T> = Result<T, StoreError>;

/// A status-guarded mutation of a step instance.
#[derive(Debug, Clone, PartialEq)]
pub enum StepChange {
    Submit {
        now: DateTime<Utc>,
    },
    StartReview {
        reviewer: UserId,
        now: DateTime<Utc>,
    },
    Reject {
        reviewer: UserId,
        reason: String,
        now: DateTime<Utc>,
    },
    ForceComplete {
        now: DateTime<Utc>,
    },
}

impl StepChange {
    pub fn apply(&self, step: &mut StepInstance) {
        match self {
            StepChange::Submit { now } => {
                step.status = StepStatus::Submitted;
                step.completed_at = None;
                step.force_completed = false;
                step.rejection_reason = None;
                step.validated_by = None;
                step.validated_at = None;
                step.updated_at = *now;
            }
            StepChange::StartReview { reviewer, now } => {
                step.status = StepStatus::UnderReview;
                step.assigned_reviewer_id = Some(reviewer.clone());
                step.updated_at = *now;
            }
            StepChange::Reject {
                reviewer,
                reason,
                now,
            } => {
                step.status = StepStatus::Rejected;
                step.rejection_reason = Some(reason.clone());
                step.assigned_reviewer_id = Some(reviewer.clone());
                step.validated_by = None;
                step.validated_at = None;
                step.completed_at = None;
                step.force_completed = false;
                step.updated_at = *now;
            }
            StepChange::ForceComplete { now } => {
                step.completed_at = Some(*now);
                step.force_completed = true;
                step.updated_at = *now;
            }
        }
    }
}

/// Marks a step approved. Only called once the gate has passed.
pub fn apply_approval(step: &mut StepInstance, reviewer: &UserId, now: DateTime<Utc>) {
    step.status = StepStatus::Approved;
    step.completed_at = Some(now);
    step.validated_by = Some(reviewer.clone());
    step.validated_at = Some(now);
    step.rejection_reason = None;
    step.updated_at = now;
}

/// Why a step cannot be approved yet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GateReport {
    pub unapproved_fields: Vec<FieldId>,
    pub unapproved_documents: Vec<DocumentTypeId>,
}

/// What a step must carry before it can be approved, taken from its template.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApprovalGate<'a> {
    pub required_fields: &'a [FieldId],
    pub required_document_types: &'a [DocumentTypeId],
}

impl GateReport {
    /// A required field with no value counts as unapproved.
    pub fn evaluate(fields: &[FieldValue], documents: &[Document], gate: ApprovalGate<'_>) -> Self {
        let mut unapproved_fields: Vec<FieldId> = fields
            .iter()
            .filter(|f| f.status != FieldStatus::Approved)
            .map(|f| f.field_id.clone())
            .collect();
        unapproved_fields.extend(
            gate.required_fields
                .iter()
                .filter(|id| !fields.iter().any(|f| &f.field_id == *id))
                .cloned(),
        );
        let unapproved_documents = gate
            .required_document_types
            .iter()
            .filter(|doc_type| {
                !documents.iter().any(|d| {
                    &d.document_type_id == *doc_type && d.status == DocumentStatus::Approved
                })
            })
            .cloned()
            .collect();
        Self {
            unapproved_fields,
            unapproved_documents,
        }
    }

    pub fn passes(&self) -> bool {
        self.unapproved_fields.is_empty() && self.unapproved_documents.is_empty()
    }
}

/// Column-scoped dossier write. Only the columns named here change; the
/// current-step pointer is never touched.
#[derive(Debug, Clone, PartialEq)]
pub struct DossierPatch {
    pub status: Option<DossierStatus>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Stamped once; a dossier that is already archived refuses the patch.
    pub archived_at: Option<DateTime<Utc>>,
    /// Merged key by key into the stored metadata object.
    pub metadata: Vec<(String, serde_json::Value)>,
    pub now: DateTime<Utc>,
}

impl DossierPatch {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            status: None,
            completed_at: None,
            archived_at: None,
            metadata: Vec::new(),
            now,
        }
    }

    pub fn status(mut self, status: DossierStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn completed_at(mut self, at: DateTime<Utc>) -> Self {
        self.completed_at = Some(at);
        self
    }

    pub fn archived_at(mut self, at: DateTime<Utc>) -> Self {
        self.archived_at = Some(at);
        self
    }

    pub fn metadata(mut self, key: &str, value: serde_json::Value) -> Self {
        self.metadata.push((key.to_string(), value));
        self
    }

    pub fn permits(&self, dossier: &Dossier, expected: DossierStatus) -> bool {
        dossier.status == expected && (self.archived_at.is_none() || dossier.archived_at.is_none())
    }

    pub fn apply(&self, dossier: &mut Dossier) {
        if let Some(status) = self.status {
            dossier.status = status;
        }
        if let Some(at) = self.completed_at {
            dossier.completed_at = Some(at);
        }
        if let Some(at) = self.archived_at {
            dossier.archived_at = Some(at);
        }
        if !self.metadata.is_empty() {
            if !dossier.metadata.is_object() {
                dossier.metadata = serde_json::json!({});
            }
            if let serde_json::Value::Object(map) = &mut dossier.metadata {
                for (key, value) in &self.metadata {
                    map.insert(key.clone(), value.clone());
                }
            }
        }
        dossier.updated_at = self.now;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApprovalOutcome {
    Approved(StepInstance),
    AlreadyApproved(StepInstance),
    Blocked(GateReport),
    Missing,
}

/// Which prior states a field upsert may overwrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertPolicy {
    pub allow_insert: bool,
    pub replaceable: &'static [FieldStatus],
    /// Refuse the write when the owning step is already APPROVED.
    pub open_steps_only: bool,
}

impl UpsertPolicy {
    pub const ALWAYS: UpsertPolicy = UpsertPolicy {
        allow_insert: true,
        replaceable: &[FieldStatus::Pending, FieldStatus::Approved, FieldStatus::Rejected],
        open_steps_only: false,
    };
    /// Regular submission never re-opens an approved field.
    pub const SUBMISSION: UpsertPolicy = UpsertPolicy {
        allow_insert: true,
        replaceable: &[FieldStatus::Pending, FieldStatus::Rejected],
        open_steps_only: false,
    };
    /// Resubmission after a step rejection only touches rejected fields.
    pub const CORRECTION: UpsertPolicy = UpsertPolicy {
        allow_insert: false,
        replaceable: &[FieldStatus::Rejected],
        open_steps_only: false,
    };

    pub const fn on_open_step(self) -> Self {
        Self {
            open_steps_only: true,
            ..self
        }
    }

    pub fn permits(&self, current: Option<FieldStatus>) -> bool {
        match current {
            None => self.allow_insert,
            Some(status) => self.replaceable.contains(&status),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldWrite {
    pub step_instance_id: StepInstanceId,
    pub field_id: FieldId,
    pub value: serde_json::Value,
    pub submitted_by: UserId,
    pub now: DateTime<Utc>,
}

impl FieldWrite {
    /// Writes reset review state to PENDING.
    pub fn apply(&self, existing: Option<&FieldValue>) -> FieldValue {
        FieldValue {
            id: existing.map(|f| f.id).unwrap_or_default(),
            step_instance_id: self.step_instance_id,
            field_id: self.field_id.clone(),
            value: self.value.clone(),
            status: FieldStatus::Pending,
            rejection_reason: None,
            submitted_by: self.submitted_by.clone(),
            reviewed_by: None,
            reviewed_at: None,
            updated_at: self.now,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpsertOutcome {
    Inserted(FieldValue),
    Updated(FieldValue),
    Skipped { current: Option<FieldStatus> },
    /// The step was APPROVED under a policy that only writes open steps.
    StepApproved,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldReview {
    pub status: FieldStatus,
    pub reason: Option<String>,
    pub reviewer: UserId,
    pub now: DateTime<Utc>,
}

impl FieldReview {
    pub fn apply(&self, field: &mut FieldValue) {
        field.status = self.status;
        field.rejection_reason = self.reason.clone();
        field.reviewed_by = Some(self.reviewer.clone());
        field.reviewed_at = Some(self.now);
        field.updated_at = self.now;
    }
}

/// Everything about a version except the number the store assigns.
#[derive(Debug, Clone, PartialEq)]
pub struct NewVersion {
    pub id: DocumentVersionId,
    pub file_url: String,
    pub file_name: String,
    pub size_bytes: u64,
    pub mime_type: String,
    pub uploaded_by: UserId,
    pub uploader_type: UploaderType,
    pub created_at: DateTime<Utc>,
}

impl NewVersion {
    pub fn into_version(self, document_id: DocumentId, version_number: u32) -> DocumentVersion {
        DocumentVersion {
            id: self.id,
            document_id,
            version_number,
            file_url: self.file_url,
            file_name: self.file_name,
            size_bytes: self.size_bytes,
            mime_type: self.mime_type,
            uploaded_by: self.uploaded_by,
            uploader_type: self.uploader_type,
            created_at: self.created_at,
        }
    }
}

#[async_trait]
pub trait DossierStore: Send + Sync {
    // Orders and client profiles

    async fn insert_order(&self, order: &Order) -> StoreResult<()>;

    async fn find_order_by_session(&self, session_id: &str) -> StoreResult<Option<Order>>;

    /// PENDING -> PAID compare-and-set. `true` only for the caller that
    /// performed the transition.
    async fn mark_order_paid(&self, id: OrderId, capture: &PaymentCapture) -> StoreResult<bool>;

    /// PENDING -> FAILED/EXPIRED compare-and-set.
    async fn mark_order_unpaid(
        &self,
        id: OrderId,
        status: OrderStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Links the order unless already linked; returns the dossier it is
    /// linked to afterwards.
    async fn link_order(
        &self,
        id: OrderId,
        dossier_id: DossierId,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<DossierId>>;

    /// Orders a reconciliation pass should look at: PENDING orders created
    /// before the cutoff, plus PAID orders that never got linked to a dossier.
    async fn list_unsettled_orders(
        &self,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<Order>>;

    async fn activate_client_profile(
        &self,
        user_id: &UserId,
        now: DateTime<Utc>,
    ) -> StoreResult<ClientProfile>;

    async fn get_client_profile(&self, user_id: &UserId) -> StoreResult<Option<ClientProfile>>;

    // Dossiers

    /// Inserts a dossier and its step instances as one unit. At most one
    /// dossier per (owner, product): a second insert fails with
    /// `StoreError::UniqueViolation`.
    async fn insert_dossier_with_steps(
        &self,
        dossier: &Dossier,
        steps: &[StepInstance],
    ) -> StoreResult<()>;

    async fn get_dossier(&self, id: DossierId) -> StoreResult<Option<Dossier>>;

    async fn find_dossier_for(
        &self,
        owner_id: &UserId,
        product_id: &ProductId,
    ) -> StoreResult<Option<Dossier>>;

    /// Applies `patch` if the status is still `expected`. Returns the row as
    /// written, or `None` when the guard failed.
    async fn patch_dossier_if(
        &self,
        id: DossierId,
        expected: DossierStatus,
        patch: &DossierPatch,
    ) -> StoreResult<Option<Dossier>>;

    /// Repoints the current step. Refuses a step of another dossier.
    async fn set_current_step(
        &self,
        dossier_id: DossierId,
        step_id: StepInstanceId,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    // Step instances

    async fn get_step_instance(&self, id: StepInstanceId) -> StoreResult<Option<StepInstance>>;

    /// Ordered by template position.
    async fn list_step_instances(&self, dossier_id: DossierId) -> StoreResult<Vec<StepInstance>>;

    /// Find-or-create on (dossier, step template).
    async fn ensure_step_instance(&self, instance: &StepInstance) -> StoreResult<StepInstance>;

    /// Stamps `started_at` if still unset. `true` if this call stamped it.
    async fn mark_step_started(&self, id: StepInstanceId, now: DateTime<Utc>) -> StoreResult<bool>;

    /// Applies `change` only if the status is still `expected`.
    async fn apply_step_change(
        &self,
        id: StepInstanceId,
        expected: StepStatus,
        change: &StepChange,
    ) -> StoreResult<Option<StepInstance>>;

    /// Re-evaluates the approval gate and writes APPROVED in the same
    /// atomic unit.
    async fn approve_step_if_ready(
        &self,
        id: StepInstanceId,
        reviewer: &UserId,
        gate: ApprovalGate<'_>,
        now: DateTime<Utc>,
    ) -> StoreResult<ApprovalOutcome>;

    // Field values

    async fn get_field_value(&self, id: FieldValueId) -> StoreResult<Option<FieldValue>>;

    async fn list_field_values(&self, step_id: StepInstanceId) -> StoreResult<Vec<FieldValue>>;

    /// Upsert on (step instance, field), conditional on the current status.
    async fn upsert_field_value(
        &self,
        write: &FieldWrite,
        policy: UpsertPolicy,
    ) -> StoreResult<UpsertOutcome>;

    async fn review_field_value(
        &self,
        id: FieldValueId,
        review: &FieldReview,
    ) -> StoreResult<Option<FieldValue>>;

    // Documents

    /// Inserts a document together with its first version. With
    /// `outdate_siblings` every other live document of the same type on the
    /// same step becomes OUTDATED in the same unit, so exactly one stays live.
    async fn insert_document_with_version(
        &self,
        document: &Document,
        version: NewVersion,
        outdate_siblings: bool,
    ) -> StoreResult<(Document, DocumentVersion, u64)>;

    async fn get_document(&self, id: DocumentId) -> StoreResult<Option<Document>>;

    /// Most recent non-outdated document for (dossier, type, step).
    async fn find_live_document(
        &self,
        dossier_id: DossierId,
        document_type_id: &DocumentTypeId,
        step_id: Option<StepInstanceId>,
    ) -> StoreResult<Option<Document>>;

    async fn list_documents(&self, dossier_id: DossierId) -> StoreResult<Vec<Document>>;

    async fn list_step_documents(&self, step_id: StepInstanceId) -> StoreResult<Vec<Document>>;

    /// Assigns `max(version_number) + 1`, inserts the version and repoints the
    /// document at it with `status`, all at once.
    async fn append_document_version(
        &self,
        document_id: DocumentId,
        version: NewVersion,
        status: DocumentStatus,
    ) -> StoreResult<DocumentVersion>;

    async fn list_document_versions(
        &self,
        document_id: DocumentId,
    ) -> StoreResult<Vec<DocumentVersion>>;

    async fn get_document_version(
        &self,
        id: DocumentVersionId,
    ) -> StoreResult<Option<DocumentVersion>>;

    /// Appends the review and sets the document status, provided the review
    /// still targets the current version of a live document.
    async fn record_document_review(
        &self,
        review: &DocumentReview,
        status: DocumentStatus,
    ) -> StoreResult<bool>;

    async fn list_document_reviews(
        &self,
        document_id: DocumentId,
    ) -> StoreResult<Vec<DocumentReview>>;

    // Events

    async fn append_event(&self, event: &Event) -> StoreResult<()>;

    /// Oldest first.
    async fn list_events(&self, dossier_id: DossierId) -> StoreResult<Vec<Event>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn field(status: FieldStatus) -> FieldValue {
        FieldWrite {
            step_instance_id: StepInstanceId::new(),
            field_id: FieldId::from("a"),
            value: serde_json::json!("x"),
            submitted_by: UserId::from("c1"),
            now: Utc::now(),
        }
        .apply(None)
        .with_status(status)
    }

    impl FieldValue {
        fn with_status(mut self, status: FieldStatus) -> Self {
            self.status = status;
            self
        }
    }

    #[test]
    fn test_gate_requires_every_field_approved() {
        let fields = vec![field(FieldStatus::Approved), field(FieldStatus::Pending)];
        let report = GateReport::evaluate(&fields, &[], ApprovalGate::default());
        assert!(!report.passes());
        assert_eq!(report.unapproved_fields.len(), 1);

        let fields = vec![field(FieldStatus::Approved)];
        assert!(GateReport::evaluate(&fields, &[], ApprovalGate::default()).passes());
    }

    #[test]
    fn test_gate_requires_approved_document_per_type() {
        let required = [DocumentTypeId::from("passport")];
        let gate = ApprovalGate {
            required_fields: &[],
            required_document_types: &required,
        };
        let report = GateReport::evaluate(&[], &[], gate);
        assert_eq!(
            report.unapproved_documents,
            vec![DocumentTypeId::from("passport")]
        );
    }

    #[test]
    fn test_gate_counts_missing_required_field() {
        let required = [FieldId::from("a"), FieldId::from("b")];
        let gate = ApprovalGate {
            required_fields: &required,
            required_document_types: &[],
        };
        let fields = vec![field(FieldStatus::Approved)];
        let report = GateReport::evaluate(&fields, &[], gate);
        assert!(!report.passes());
        assert_eq!(report.unapproved_fields, vec![FieldId::from("b")]);

        assert!(!GateReport::evaluate(&[], &[], gate).passes());
    }

    #[test]
    fn test_dossier_patch_merges_metadata_and_keeps_pointer() {
        let now = Utc::now();
        let mut dossier = Dossier::new(UserId::from("c1"), ProductId::from("llc"), now);
        let pointer = StepInstanceId::new();
        dossier.current_step_instance_id = Some(pointer);
        dossier.metadata = serde_json::json!({ "source_order_id": "o1" });

        let patch = DossierPatch::new(now)
            .status(DossierStatus::Closed)
            .metadata("cancellation_reason", serde_json::json!("client left"));
        assert!(patch.permits(&dossier, dossier.status));
        patch.apply(&mut dossier);

        assert_eq!(dossier.status, DossierStatus::Closed);
        assert_eq!(dossier.current_step_instance_id, Some(pointer));
        assert_eq!(dossier.metadata["source_order_id"], "o1");
        assert_eq!(dossier.metadata["cancellation_reason"], "client left");

        let archive = DossierPatch::new(now).archived_at(now);
        assert!(archive.permits(&dossier, DossierStatus::Closed));
        archive.apply(&mut dossier);
        assert!(!archive.permits(&dossier, DossierStatus::Closed));
    }

    #[test]
    fn test_upsert_policies() {
        assert!(UpsertPolicy::SUBMISSION.permits(None));
        assert!(UpsertPolicy::SUBMISSION.permits(Some(FieldStatus::Rejected)));
        assert!(!UpsertPolicy::SUBMISSION.permits(Some(FieldStatus::Approved)));
        assert!(!UpsertPolicy::CORRECTION.permits(None));
        assert!(!UpsertPolicy::CORRECTION.permits(Some(FieldStatus::Pending)));
        assert!(UpsertPolicy::CORRECTION.permits(Some(FieldStatus::Rejected)));
        assert!(UpsertPolicy::ALWAYS.permits(Some(FieldStatus::Approved)));
    }

    fn field_status() -> impl Strategy<Value = FieldStatus> {
        prop_oneof![
            Just(FieldStatus::Pending),
            Just(FieldStatus::Approved),
            Just(FieldStatus::Rejected),
        ]
    }

    proptest! {
        #[test]
        fn prop_gate_passes_iff_all_fields_approved(
            statuses in proptest::collection::vec(field_status(), 0..8)
        ) {
            let fields: Vec<FieldValue> = statuses.iter().map(|s| field(*s)).collect();
            let report = GateReport::evaluate(&fields, &[], ApprovalGate::default());
            let all_approved = statuses.iter().all(|s| *s == FieldStatus::Approved);
            prop_assert_eq!(report.passes(), all_approved);
        }
    }

    #[test]
    fn test_reject_clears_completion() {
        let now = Utc::now();
        let mut step = StepInstance::new(DossierId::new(), StepTemplateId::from("s1"), 1, now);
        apply_approval(&mut step, &UserId::from("a1"), now);
        assert!(step.completed_at.is_some());

        StepChange::Reject {
            reviewer: UserId::from("a1"),
            reason: "missing signature".to_string(),
            now,
        }
        .apply(&mut step);
        assert_eq!(step.status, StepStatus::Rejected);
        assert!(step.completed_at.is_none());
        assert!(step.validated_by.is_none());
    }
}
