//! Persistent entities of the dossier workflow and their status enums.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! uuid_id {
    ($($name:ident),* $(,)?) => {$(
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    )*};
}

macro_rules! text_id {
    ($($name:ident),* $(,)?) => {$(
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    )*};
}

/// Enums persisted as SCREAMING_SNAKE_CASE text.
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),* $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
        pub enum $name {
            $($variant),*
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),*
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)*
                    other => Err(format!("unknown {}: {}", stringify!($name), other)),
                }
            }
        }
    };
}

uuid_id!(
    DossierId,
    StepInstanceId,
    FieldValueId,
    DocumentId,
    DocumentVersionId,
    DocumentReviewId,
    EventId,
    OrderId,
    ClientProfileId,
);

text_id!(UserId, ProductId, StepTemplateId, FieldId, DocumentTypeId);

text_enum!(
    /// Human-review outcome of a step instance.
    StepStatus {
        Draft => "DRAFT",
        Submitted => "SUBMITTED",
        UnderReview => "UNDER_REVIEW",
        Approved => "APPROVED",
        Rejected => "REJECTED",
    }
);

impl StepStatus {
    /// DRAFT is the only state in which the client has never submitted.
    pub fn has_been_submitted(&self) -> bool {
        !matches!(self, StepStatus::Draft)
    }
}

text_enum!(
    FieldStatus {
        Pending => "PENDING",
        Approved => "APPROVED",
        Rejected => "REJECTED",
    }
);

text_enum!(
    DocumentStatus {
        Pending => "PENDING",
        Approved => "APPROVED",
        Rejected => "REJECTED",
        Outdated => "OUTDATED",
    }
);

text_enum!(
    /// Coarse business-process milestone, set by staff and provisioning.
    DossierStatus {
        Qualification => "QUALIFICATION",
        FormSubmitted => "FORM_SUBMITTED",
        InProgress => "IN_PROGRESS",
        LlcFiled => "LLC_FILED",
        EinPending => "EIN_PENDING",
        BankPreparation => "BANK_PREPARATION",
        BankOpened => "BANK_OPENED",
        Completed => "COMPLETED",
        Closed => "CLOSED",
        Error => "ERROR",
    }
);

impl DossierStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DossierStatus::Completed | DossierStatus::Closed)
    }
}

text_enum!(
    /// Who performs a template step.
    StepActor {
        Client => "CLIENT",
        Admin => "ADMIN",
    }
);

text_enum!(
    UploaderType {
        Client => "CLIENT",
        Agent => "AGENT",
    }
);

text_enum!(
    ActorType {
        User => "USER",
        Agent => "AGENT",
        System => "SYSTEM",
    }
);

text_enum!(
    ReviewDecision {
        Approve => "APPROVE",
        Reject => "REJECT",
    }
);

text_enum!(
    EntityType {
        Dossier => "DOSSIER",
        StepInstance => "STEP_INSTANCE",
        FieldValue => "FIELD_VALUE",
        Document => "DOCUMENT",
        Order => "ORDER",
    }
);

text_enum!(
    EventType {
        DossierCreated => "DOSSIER_CREATED",
        DossierStatusChanged => "DOSSIER_STATUS_CHANGED",
        DossierArchived => "DOSSIER_ARCHIVED",
        StepStarted => "STEP_STARTED",
        StepSubmitted => "STEP_SUBMITTED",
        StepReviewStarted => "STEP_REVIEW_STARTED",
        StepCompleted => "STEP_COMPLETED",
        StepRejected => "STEP_REJECTED",
        FieldReviewed => "FIELD_REVIEWED",
        DocumentUploaded => "DOCUMENT_UPLOADED",
        DocumentReviewed => "DOCUMENT_REVIEWED",
        DocumentDelivered => "DOCUMENT_DELIVERED",
        PaymentReceived => "PAYMENT_RECEIVED",
        PaymentFailed => "PAYMENT_FAILED",
    }
);

text_enum!(
    OrderStatus {
        Pending => "PENDING",
        Paid => "PAID",
        Failed => "FAILED",
        Expired => "EXPIRED",
    }
);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dossier {
    pub id: DossierId,
    pub owner_id: UserId,
    pub product_id: ProductId,
    pub status: DossierStatus,
    pub current_step_instance_id: Option<StepInstanceId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub archived_at: Option<DateTime<Utc>>,
    /// Free-form bag: cancellation reason, source order, archive snapshot.
    pub metadata: serde_json::Value,
}

impl Dossier {
    pub fn new(owner_id: UserId, product_id: ProductId, now: DateTime<Utc>) -> Self {
        Self {
            id: DossierId::new(),
            owner_id,
            product_id,
            status: DossierStatus::Qualification,
            current_step_instance_id: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            archived_at: None,
            metadata: serde_json::json!({}),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.status == DossierStatus::Closed
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepInstance {
    pub id: StepInstanceId,
    pub dossier_id: DossierId,
    pub step_template_id: StepTemplateId,
    /// Ordering position copied from the template.
    pub position: u32,
    pub status: StepStatus,
    pub rejection_reason: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub force_completed: bool,
    pub assigned_reviewer_id: Option<UserId>,
    pub validated_by: Option<UserId>,
    pub validated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StepInstance {
    pub fn new(
        dossier_id: DossierId,
        step_template_id: StepTemplateId,
        position: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: StepInstanceId::new(),
            dossier_id,
            step_template_id,
            position,
            status: StepStatus::Draft,
            rejection_reason: None,
            started_at: None,
            completed_at: None,
            force_completed: false,
            assigned_reviewer_id: None,
            validated_by: None,
            validated_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldValue {
    pub id: FieldValueId,
    pub step_instance_id: StepInstanceId,
    pub field_id: FieldId,
    pub value: serde_json::Value,
    pub status: FieldStatus,
    pub rejection_reason: Option<String>,
    pub submitted_by: UserId,
    pub reviewed_by: Option<UserId>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub dossier_id: DossierId,
    pub document_type_id: DocumentTypeId,
    /// `None` for ad-hoc deliveries not tied to a step.
    pub step_instance_id: Option<StepInstanceId>,
    pub status: DocumentStatus,
    pub current_version_id: Option<DocumentVersionId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentVersion {
    pub id: DocumentVersionId,
    pub document_id: DocumentId,
    pub version_number: u32,
    pub file_url: String,
    pub file_name: String,
    pub size_bytes: u64,
    pub mime_type: String,
    pub uploaded_by: UserId,
    pub uploader_type: UploaderType,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentReview {
    pub id: DocumentReviewId,
    pub document_id: DocumentId,
    pub version_id: DocumentVersionId,
    pub decision: ReviewDecision,
    pub reason: Option<String>,
    pub reviewer_id: UserId,
    /// Set for staff deliveries, which skip human review.
    pub automatic: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub dossier_id: Option<DossierId>,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub event_type: EventType,
    pub actor_type: ActorType,
    pub actor_id: Option<String>,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    /// Identifier assigned by the payment processor.
    pub processor_session_id: String,
    pub client_id: UserId,
    pub product_id: ProductId,
    pub status: OrderStatus,
    pub amount_cents: i64,
    pub currency: String,
    pub payment_intent_id: Option<String>,
    pub customer_id: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub dossier_id: Option<DossierId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn pending(
        processor_session_id: impl Into<String>,
        client_id: UserId,
        product_id: ProductId,
        amount_cents: i64,
        currency: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: OrderId::new(),
            processor_session_id: processor_session_id.into(),
            client_id,
            product_id,
            status: OrderStatus::Pending,
            amount_cents,
            currency: currency.into(),
            payment_intent_id: None,
            customer_id: None,
            paid_at: None,
            dossier_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Payment facts written atomically with the PENDING -> PAID transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentCapture {
    pub amount_cents: i64,
    pub payment_intent_id: Option<String>,
    pub customer_id: Option<String>,
    pub paid_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientProfile {
    pub id: ClientProfileId,
    pub user_id: UserId,
    pub active: bool,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_text_round_trip() {
        assert_eq!(StepStatus::UnderReview.as_str(), "UNDER_REVIEW");
        assert_eq!("REJECTED".parse::<StepStatus>(), Ok(StepStatus::Rejected));
        assert!("rejected".parse::<StepStatus>().is_err());
        assert_eq!(
            serde_json::to_value(EventType::DossierCreated).unwrap(),
            serde_json::json!("DOSSIER_CREATED")
        );
    }

    #[test]
    fn test_only_draft_counts_as_unsubmitted() {
        assert!(!StepStatus::Draft.has_been_submitted());
        assert!(StepStatus::Rejected.has_been_submitted());
        assert!(StepStatus::UnderReview.has_been_submitted());
    }

    #[test]
    fn test_terminal_dossier_statuses() {
        assert!(DossierStatus::Closed.is_terminal());
        assert!(DossierStatus::Completed.is_terminal());
        assert!(!DossierStatus::BankPreparation.is_terminal());
    }
}
