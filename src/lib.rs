// Dossier Flow Library - LLC formation dossier workflow and validation engine
// This exposes the core components for testing and integration

pub mod catalog;
pub mod config;
pub mod database;
pub mod documents;
pub mod dossier;
pub mod engine;
pub mod error;
pub mod events;
pub mod external;
pub mod fields;
pub mod identity;
pub mod model;
pub mod observability;
pub mod provisioning;
pub mod queries;
pub mod store;
pub mod telemetry;
pub mod workflows;

// Re-export key types for easy access
pub use catalog::{CatalogError, FieldKind, Product, ProductCatalog, StepTemplate};
pub use config::{config, DossierFlowConfig};
pub use database::{init_database, open_store, shutdown_database};
pub use documents::{StoredDocument, UploadRequest};
pub use dossier::Progress;
pub use engine::DossierEngine;
pub use error::{StoreError, WorkflowError, WorkflowResult};
pub use events::{EventDraft, EventLog};
pub use external::{
    InMemoryObjectStore, NotificationSink, ObjectStore, PaymentProcessor, PaymentVerification,
    RecordingNotificationSink, ScriptedPaymentProcessor,
};
pub use identity::{Caller, IdentityProvider, Role};
pub use observability::{EngineMetrics, EngineStats};
pub use provisioning::{
    PaymentSignal, ProvisioningOutcome, ProvisioningPipeline, ReconciliationReport, Reconciler,
    SignalSource,
};
pub use queries::{FieldCounts, StepOverview};
pub use store::{DossierStore, InMemoryStore};
pub use telemetry::{create_workflow_span, generate_correlation_id, init_telemetry, shutdown_telemetry};
pub use workflows::steps::{SubmissionReport, SubmittedStep};
pub use workflows::{StepTransition, TransitionResult};
