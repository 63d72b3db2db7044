//! The dossier workflow engine.
//!
//! `DossierEngine` owns the storage seam, the product catalog and the external
//! collaborators. Operations are grouped by concern in `fields`, `documents`,
//! `steps`, `dossier` and `queries`, each adding an `impl DossierEngine` block.
//! Every operation takes the acting [`Caller`] explicitly.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::warn;

use crate::catalog::{ProductCatalog, StepTemplate};
use crate::config::ReviewConfig;
use crate::error::{WorkflowError, WorkflowResult};
use crate::events::{EventDraft, EventLog};
use crate::external::{NotificationSink, ObjectStore};
use crate::identity::Caller;
use crate::model::{Dossier, DossierId, StepInstance, StepInstanceId, UserId};
use crate::observability::EngineMetrics;
use crate::store::DossierStore;

#[derive(Clone)]
pub struct DossierEngine {
    pub(crate) store: Arc<dyn DossierStore>,
    pub(crate) catalog: Arc<ProductCatalog>,
    pub(crate) objects: Arc<dyn ObjectStore>,
    pub(crate) notifications: Arc<dyn NotificationSink>,
    pub(crate) review: ReviewConfig,
    pub(crate) metrics: Arc<EngineMetrics>,
    pub(crate) events: EventLog,
}

impl DossierEngine {
    pub fn new(
        store: Arc<dyn DossierStore>,
        catalog: Arc<ProductCatalog>,
        objects: Arc<dyn ObjectStore>,
        notifications: Arc<dyn NotificationSink>,
    ) -> Self {
        let metrics = Arc::new(EngineMetrics::new());
        Self {
            events: EventLog::new(store.clone(), metrics.clone()),
            store,
            catalog,
            objects,
            notifications,
            review: ReviewConfig::default(),
            metrics,
        }
    }

    pub fn with_review_config(mut self, review: ReviewConfig) -> Self {
        self.review = review;
        self
    }

    /// Share counters with another component, e.g. the provisioning pipeline
    pub fn with_metrics(mut self, metrics: Arc<EngineMetrics>) -> Self {
        self.events = EventLog::new(self.store.clone(), metrics.clone());
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }

    pub fn catalog(&self) -> &ProductCatalog {
        &self.catalog
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    /// Loads a dossier the caller may act on.
    pub(crate) async fn load_dossier(
        &self,
        caller: &Caller,
        dossier_id: DossierId,
    ) -> WorkflowResult<Dossier> {
        let dossier = self
            .store
            .get_dossier(dossier_id)
            .await?
            .ok_or_else(|| WorkflowError::not_found("dossier", dossier_id))?;
        caller.require_access(&dossier)?;
        Ok(dossier)
    }

    /// Loads a step instance together with its dossier, checking access on
    /// the dossier.
    pub(crate) async fn load_step(
        &self,
        caller: &Caller,
        step_id: StepInstanceId,
    ) -> WorkflowResult<(Dossier, StepInstance)> {
        let step = self
            .store
            .get_step_instance(step_id)
            .await?
            .ok_or_else(|| WorkflowError::not_found("step instance", step_id))?;
        let dossier = self.load_dossier(caller, step.dossier_id).await?;
        Ok((dossier, step))
    }

    pub(crate) fn template_for(
        &self,
        dossier: &Dossier,
        step: &StepInstance,
    ) -> WorkflowResult<&StepTemplate> {
        self.catalog
            .step_template(&dossier.product_id, &step.step_template_id)
    }

    /// Rejection reasons must carry at least `min_rejection_reason_len`
    /// characters once trimmed.
    pub(crate) fn validate_reason(&self, reason: Option<&str>) -> WorkflowResult<String> {
        let reason = reason.map(str::trim).unwrap_or_default();
        let min = self.review.min_rejection_reason_len;
        if reason.chars().count() < min {
            return Err(WorkflowError::invalid(format!(
                "rejection reason must be at least {min} characters"
            )));
        }
        Ok(reason.to_string())
    }

    pub(crate) async fn record(&self, caller: &Caller, draft: EventDraft) {
        self.events.record(caller, draft).await;
    }

    /// Fire-and-forget notification. Failures are logged and counted.
    pub(crate) async fn notify(
        &self,
        user_id: &UserId,
        template_code: &str,
        payload: serde_json::Value,
    ) {
        if let Err(e) = self
            .notifications
            .enqueue(user_id, template_code, payload)
            .await
        {
            self.metrics.record_notification_dropped();
            warn!(
                user_id = %user_id,
                template_code,
                error = %e,
                "Failed to enqueue notification, continuing"
            );
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::external::{InMemoryObjectStore, RecordingNotificationSink};
    use crate::store::InMemoryStore;

    pub const CATALOG: &str = r#"
[[document_types]]
id = "passport"
label = "Passport"

[[document_types]]
id = "articles"
label = "Articles of organization"

[[products]]
id = "llc-formation"
name = "LLC formation"

[[products.steps]]
id = "identity"
label = "Identity"
position = 1
actor = "CLIENT"
required_document_types = ["passport"]

[[products.steps.fields]]
id = "email"
key = "email"
label = "Email"
required = true
kind = { type = "email" }

[[products.steps]]
id = "company"
label = "Company"
position = 2
actor = "CLIENT"

[[products.steps.fields]]
id = "company_name"
key = "company_name"
label = "Company name"
required = true
kind = { type = "text", pattern = "LLC$" }

[[products.steps.fields]]
id = "state"
key = "state"
label = "State"
kind = { type = "select", options = ["WY", "DE"] }

[[products.steps]]
id = "filing"
label = "Filing"
position = 3
actor = "ADMIN"
"#;

    pub struct Harness {
        pub engine: DossierEngine,
        pub store: Arc<InMemoryStore>,
        pub notifications: Arc<RecordingNotificationSink>,
        pub objects: Arc<InMemoryObjectStore>,
    }

    pub fn harness() -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let notifications = Arc::new(RecordingNotificationSink::new());
        let objects = Arc::new(InMemoryObjectStore::new());
        let catalog = Arc::new(ProductCatalog::from_toml_str(CATALOG).unwrap());
        let engine = DossierEngine::new(
            store.clone(),
            catalog,
            objects.clone(),
            notifications.clone(),
        );
        Harness {
            engine,
            store,
            notifications,
            objects,
        }
    }

    /// A dossier owned by `c1` with all three step instances, the first one
    /// started and current.
    pub async fn seeded_dossier(h: &Harness) -> (Dossier, Vec<StepInstance>) {
        seed_dossier(&h.engine, &h.store).await
    }

    /// An engine over a fresh in-memory store with the given collaborators.
    pub fn engine_with(
        objects: Arc<dyn ObjectStore>,
        notifications: Arc<dyn NotificationSink>,
    ) -> (DossierEngine, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let catalog = Arc::new(ProductCatalog::from_toml_str(CATALOG).unwrap());
        let engine = DossierEngine::new(store.clone(), catalog, objects, notifications);
        (engine, store)
    }

    pub async fn seed_dossier(
        engine: &DossierEngine,
        store: &InMemoryStore,
    ) -> (Dossier, Vec<StepInstance>) {
        let now = Utc::now();
        let mut dossier = Dossier::new(
            UserId::from("c1"),
            crate::model::ProductId::from("llc-formation"),
            now,
        );
        let product = engine.catalog.product(&dossier.product_id).unwrap();
        let mut steps: Vec<StepInstance> = product
            .ordered_steps()
            .iter()
            .map(|t| StepInstance::new(dossier.id, t.id.clone(), t.position, now))
            .collect();
        steps[0].started_at = Some(now);
        dossier.current_step_instance_id = Some(steps[0].id);
        store
            .insert_dossier_with_steps(&dossier, &steps)
            .await
            .unwrap();
        (dossier, steps)
    }
}
