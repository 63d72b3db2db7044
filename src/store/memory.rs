//! In-memory [`DossierStore`]. Each method holds the table write guard for its
//! whole check-and-act, which gives the same atomicity a conditional SQL
//! statement would.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio::sync::RwLock;

use super::*;
use crate::error::StoreError;

#[derive(Debug, Default)]
struct Tables {
    orders: HashMap<OrderId, Order>,
    profiles: HashMap<UserId, ClientProfile>,
    dossiers: HashMap<DossierId, Dossier>,
    steps: HashMap<StepInstanceId, StepInstance>,
    fields: HashMap<FieldValueId, FieldValue>,
    documents: HashMap<DocumentId, Document>,
    versions: HashMap<DocumentVersionId, DocumentVersion>,
    reviews: Vec<DocumentReview>,
    events: Vec<Event>,
}

impl Tables {
    fn step_fields(&self, step_id: StepInstanceId) -> Vec<FieldValue> {
        self.fields
            .values()
            .filter(|f| f.step_instance_id == step_id)
            .cloned()
            .collect()
    }

    fn step_documents(&self, step_id: StepInstanceId) -> Vec<Document> {
        let mut docs: Vec<Document> = self
            .documents
            .values()
            .filter(|d| d.step_instance_id == Some(step_id))
            .cloned()
            .collect();
        docs.sort_by_key(|d| d.created_at);
        docs
    }
}

/// Fault injection switches for tests.
#[derive(Debug, Default)]
struct Faults {
    fail_events: AtomicBool,
    transient_order_failures: AtomicU32,
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
    faults: Faults,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every `append_event` fail until switched off.
    pub fn fail_event_writes(&self, fail: bool) {
        self.faults.fail_events.store(fail, Ordering::SeqCst);
    }

    /// The next `count` order lookups fail with a transient error.
    pub fn fail_next_order_lookups(&self, count: u32) {
        self.faults
            .transient_order_failures
            .store(count, Ordering::SeqCst);
    }

    fn take_transient_failure(&self) -> StoreResult<()> {
        let remaining = self.faults.transient_order_failures.fetch_update(
            Ordering::SeqCst,
            Ordering::SeqCst,
            |n| n.checked_sub(1),
        );
        match remaining {
            Ok(_) => Err(StoreError::Transient(
                "injected order lookup failure".to_string(),
            )),
            Err(_) => Ok(()),
        }
    }

    pub async fn dossier_count(&self) -> usize {
        self.tables.read().await.dossiers.len()
    }

    pub async fn step_instance_count(&self) -> usize {
        self.tables.read().await.steps.len()
    }
}

#[async_trait]
impl DossierStore for InMemoryStore {
    async fn insert_order(&self, order: &Order) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        if tables
            .orders
            .values()
            .any(|o| o.processor_session_id == order.processor_session_id)
        {
            return Err(StoreError::UniqueViolation {
                constraint: "orders_processor_session_id".to_string(),
            });
        }
        tables.orders.insert(order.id, order.clone());
        Ok(())
    }

    async fn find_order_by_session(&self, session_id: &str) -> StoreResult<Option<Order>> {
        self.take_transient_failure()?;
        let tables = self.tables.read().await;
        Ok(tables
            .orders
            .values()
            .find(|o| o.processor_session_id == session_id)
            .cloned())
    }

    async fn mark_order_paid(&self, id: OrderId, capture: &PaymentCapture) -> StoreResult<bool> {
        let mut tables = self.tables.write().await;
        match tables.orders.get_mut(&id) {
            Some(order) if order.status == OrderStatus::Pending => {
                order.status = OrderStatus::Paid;
                order.amount_cents = capture.amount_cents;
                order.payment_intent_id = capture.payment_intent_id.clone();
                order.customer_id = capture.customer_id.clone();
                order.paid_at = Some(capture.paid_at);
                order.updated_at = capture.paid_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_order_unpaid(
        &self,
        id: OrderId,
        status: OrderStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut tables = self.tables.write().await;
        match tables.orders.get_mut(&id) {
            Some(order) if order.status == OrderStatus::Pending => {
                order.status = status;
                order.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn link_order(
        &self,
        id: OrderId,
        dossier_id: DossierId,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<DossierId>> {
        let mut tables = self.tables.write().await;
        let Some(order) = tables.orders.get_mut(&id) else {
            return Ok(None);
        };
        if order.dossier_id.is_none() {
            order.dossier_id = Some(dossier_id);
            order.updated_at = now;
        }
        Ok(order.dossier_id)
    }

    async fn list_unsettled_orders(
        &self,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<Order>> {
        let tables = self.tables.read().await;
        let mut orders: Vec<Order> = tables
            .orders
            .values()
            .filter(|o| match o.status {
                OrderStatus::Pending => o.created_at < created_before,
                OrderStatus::Paid => o.dossier_id.is_none(),
                _ => false,
            })
            .cloned()
            .collect();
        orders.sort_by_key(|o| o.created_at);
        orders.truncate(limit);
        Ok(orders)
    }

    async fn activate_client_profile(
        &self,
        user_id: &UserId,
        now: DateTime<Utc>,
    ) -> StoreResult<ClientProfile> {
        let mut tables = self.tables.write().await;
        let profile = tables
            .profiles
            .entry(user_id.clone())
            .or_insert_with(|| ClientProfile {
                id: ClientProfileId::new(),
                user_id: user_id.clone(),
                active: false,
                updated_at: now,
            });
        if !profile.active {
            profile.active = true;
            profile.updated_at = now;
        }
        Ok(profile.clone())
    }

    async fn get_client_profile(&self, user_id: &UserId) -> StoreResult<Option<ClientProfile>> {
        Ok(self.tables.read().await.profiles.get(user_id).cloned())
    }

    async fn insert_dossier_with_steps(
        &self,
        dossier: &Dossier,
        steps: &[StepInstance],
    ) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        if tables
            .dossiers
            .values()
            .any(|d| d.owner_id == dossier.owner_id && d.product_id == dossier.product_id)
        {
            return Err(StoreError::UniqueViolation {
                constraint: "dossiers_owner_product".to_string(),
            });
        }
        if let Some(current) = dossier.current_step_instance_id {
            if !steps.iter().any(|s| s.id == current) {
                return Err(StoreError::Backend(format!(
                    "current step {current} is not part of dossier {}",
                    dossier.id
                )));
            }
        }
        tables.dossiers.insert(dossier.id, dossier.clone());
        for step in steps {
            tables.steps.insert(step.id, step.clone());
        }
        Ok(())
    }

    async fn get_dossier(&self, id: DossierId) -> StoreResult<Option<Dossier>> {
        Ok(self.tables.read().await.dossiers.get(&id).cloned())
    }

    async fn find_dossier_for(
        &self,
        owner_id: &UserId,
        product_id: &ProductId,
    ) -> StoreResult<Option<Dossier>> {
        let tables = self.tables.read().await;
        Ok(tables
            .dossiers
            .values()
            .find(|d| &d.owner_id == owner_id && &d.product_id == product_id)
            .cloned())
    }

    async fn patch_dossier_if(
        &self,
        id: DossierId,
        expected: DossierStatus,
        patch: &DossierPatch,
    ) -> StoreResult<Option<Dossier>> {
        let mut tables = self.tables.write().await;
        match tables.dossiers.get_mut(&id) {
            Some(stored) if patch.permits(stored, expected) => {
                patch.apply(stored);
                Ok(Some(stored.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn set_current_step(
        &self,
        dossier_id: DossierId,
        step_id: StepInstanceId,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut tables = self.tables.write().await;
        let belongs = tables
            .steps
            .get(&step_id)
            .is_some_and(|s| s.dossier_id == dossier_id);
        if !belongs {
            return Ok(false);
        }
        match tables.dossiers.get_mut(&dossier_id) {
            Some(dossier) => {
                dossier.current_step_instance_id = Some(step_id);
                dossier.updated_at = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get_step_instance(&self, id: StepInstanceId) -> StoreResult<Option<StepInstance>> {
        Ok(self.tables.read().await.steps.get(&id).cloned())
    }

    async fn list_step_instances(&self, dossier_id: DossierId) -> StoreResult<Vec<StepInstance>> {
        let tables = self.tables.read().await;
        let mut steps: Vec<StepInstance> = tables
            .steps
            .values()
            .filter(|s| s.dossier_id == dossier_id)
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.position);
        Ok(steps)
    }

    async fn ensure_step_instance(&self, instance: &StepInstance) -> StoreResult<StepInstance> {
        let mut tables = self.tables.write().await;
        if let Some(existing) = tables.steps.values().find(|s| {
            s.dossier_id == instance.dossier_id && s.step_template_id == instance.step_template_id
        }) {
            return Ok(existing.clone());
        }
        tables.steps.insert(instance.id, instance.clone());
        Ok(instance.clone())
    }

    async fn mark_step_started(&self, id: StepInstanceId, now: DateTime<Utc>) -> StoreResult<bool> {
        let mut tables = self.tables.write().await;
        match tables.steps.get_mut(&id) {
            Some(step) if step.started_at.is_none() => {
                step.started_at = Some(now);
                step.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn apply_step_change(
        &self,
        id: StepInstanceId,
        expected: StepStatus,
        change: &StepChange,
    ) -> StoreResult<Option<StepInstance>> {
        let mut tables = self.tables.write().await;
        match tables.steps.get_mut(&id) {
            Some(step) if step.status == expected => {
                change.apply(step);
                Ok(Some(step.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn approve_step_if_ready(
        &self,
        id: StepInstanceId,
        reviewer: &UserId,
        gate: ApprovalGate<'_>,
        now: DateTime<Utc>,
    ) -> StoreResult<ApprovalOutcome> {
        let mut tables = self.tables.write().await;
        let report = GateReport::evaluate(&tables.step_fields(id), &tables.step_documents(id), gate);
        let Some(step) = tables.steps.get_mut(&id) else {
            return Ok(ApprovalOutcome::Missing);
        };
        if step.status == StepStatus::Approved {
            return Ok(ApprovalOutcome::AlreadyApproved(step.clone()));
        }
        if !report.passes() {
            return Ok(ApprovalOutcome::Blocked(report));
        }
        apply_approval(step, reviewer, now);
        Ok(ApprovalOutcome::Approved(step.clone()))
    }

    async fn get_field_value(&self, id: FieldValueId) -> StoreResult<Option<FieldValue>> {
        Ok(self.tables.read().await.fields.get(&id).cloned())
    }

    async fn list_field_values(&self, step_id: StepInstanceId) -> StoreResult<Vec<FieldValue>> {
        let tables = self.tables.read().await;
        let mut fields = tables.step_fields(step_id);
        fields.sort_by(|a, b| a.field_id.cmp(&b.field_id));
        Ok(fields)
    }

    async fn upsert_field_value(
        &self,
        write: &FieldWrite,
        policy: UpsertPolicy,
    ) -> StoreResult<UpsertOutcome> {
        let mut tables = self.tables.write().await;
        let step_approved = tables
            .steps
            .get(&write.step_instance_id)
            .is_some_and(|s| s.status == StepStatus::Approved);
        if policy.open_steps_only && step_approved {
            return Ok(UpsertOutcome::StepApproved);
        }
        let existing = tables
            .fields
            .values()
            .find(|f| f.step_instance_id == write.step_instance_id && f.field_id == write.field_id)
            .cloned();
        let current = existing.as_ref().map(|f| f.status);
        if !policy.permits(current) {
            return Ok(UpsertOutcome::Skipped { current });
        }
        let value = write.apply(existing.as_ref());
        tables.fields.insert(value.id, value.clone());
        Ok(match existing {
            Some(_) => UpsertOutcome::Updated(value),
            None => UpsertOutcome::Inserted(value),
        })
    }

    async fn review_field_value(
        &self,
        id: FieldValueId,
        review: &FieldReview,
    ) -> StoreResult<Option<FieldValue>> {
        let mut tables = self.tables.write().await;
        Ok(tables.fields.get_mut(&id).map(|field| {
            review.apply(field);
            field.clone()
        }))
    }

    async fn insert_document_with_version(
        &self,
        document: &Document,
        version: NewVersion,
        outdate_siblings: bool,
    ) -> StoreResult<(Document, DocumentVersion, u64)> {
        let mut tables = self.tables.write().await;
        let version = version.into_version(document.id, 1);
        let mut stored = document.clone();
        stored.current_version_id = Some(version.id);
        stored.updated_at = version.created_at;

        let mut outdated = 0;
        if let (true, Some(step_id)) = (outdate_siblings, document.step_instance_id) {
            for doc in tables.documents.values_mut() {
                if doc.step_instance_id == Some(step_id)
                    && doc.document_type_id == document.document_type_id
                    && doc.status != DocumentStatus::Outdated
                {
                    doc.status = DocumentStatus::Outdated;
                    doc.updated_at = version.created_at;
                    outdated += 1;
                }
            }
        }
        tables.documents.insert(stored.id, stored.clone());
        tables.versions.insert(version.id, version.clone());
        Ok((stored, version, outdated))
    }

    async fn get_document(&self, id: DocumentId) -> StoreResult<Option<Document>> {
        Ok(self.tables.read().await.documents.get(&id).cloned())
    }

    async fn find_live_document(
        &self,
        dossier_id: DossierId,
        document_type_id: &DocumentTypeId,
        step_id: Option<StepInstanceId>,
    ) -> StoreResult<Option<Document>> {
        let tables = self.tables.read().await;
        Ok(tables
            .documents
            .values()
            .filter(|d| {
                d.dossier_id == dossier_id
                    && &d.document_type_id == document_type_id
                    && d.step_instance_id == step_id
                    && d.status != DocumentStatus::Outdated
            })
            .max_by_key(|d| d.created_at)
            .cloned())
    }

    async fn list_documents(&self, dossier_id: DossierId) -> StoreResult<Vec<Document>> {
        let tables = self.tables.read().await;
        let mut docs: Vec<Document> = tables
            .documents
            .values()
            .filter(|d| d.dossier_id == dossier_id)
            .cloned()
            .collect();
        docs.sort_by_key(|d| d.created_at);
        Ok(docs)
    }

    async fn list_step_documents(&self, step_id: StepInstanceId) -> StoreResult<Vec<Document>> {
        Ok(self.tables.read().await.step_documents(step_id))
    }

    async fn append_document_version(
        &self,
        document_id: DocumentId,
        version: NewVersion,
        status: DocumentStatus,
    ) -> StoreResult<DocumentVersion> {
        let mut tables = self.tables.write().await;
        if !tables.documents.contains_key(&document_id) {
            return Err(StoreError::Backend(format!(
                "document {document_id} does not exist"
            )));
        }
        let next = tables
            .versions
            .values()
            .filter(|v| v.document_id == document_id)
            .map(|v| v.version_number)
            .max()
            .unwrap_or(0)
            + 1;
        let version = version.into_version(document_id, next);
        tables.versions.insert(version.id, version.clone());
        if let Some(doc) = tables.documents.get_mut(&document_id) {
            doc.current_version_id = Some(version.id);
            doc.status = status;
            doc.updated_at = version.created_at;
        }
        Ok(version)
    }

    async fn list_document_versions(
        &self,
        document_id: DocumentId,
    ) -> StoreResult<Vec<DocumentVersion>> {
        let tables = self.tables.read().await;
        let mut versions: Vec<DocumentVersion> = tables
            .versions
            .values()
            .filter(|v| v.document_id == document_id)
            .cloned()
            .collect();
        versions.sort_by_key(|v| v.version_number);
        Ok(versions)
    }

    async fn get_document_version(
        &self,
        id: DocumentVersionId,
    ) -> StoreResult<Option<DocumentVersion>> {
        Ok(self.tables.read().await.versions.get(&id).cloned())
    }

    async fn record_document_review(
        &self,
        review: &DocumentReview,
        status: DocumentStatus,
    ) -> StoreResult<bool> {
        let mut tables = self.tables.write().await;
        match tables.documents.get_mut(&review.document_id) {
            Some(doc)
                if doc.current_version_id == Some(review.version_id)
                    && doc.status != DocumentStatus::Outdated =>
            {
                doc.status = status;
                doc.updated_at = review.created_at;
            }
            _ => return Ok(false),
        }
        tables.reviews.push(review.clone());
        Ok(true)
    }

    async fn list_document_reviews(
        &self,
        document_id: DocumentId,
    ) -> StoreResult<Vec<DocumentReview>> {
        let tables = self.tables.read().await;
        Ok(tables
            .reviews
            .iter()
            .filter(|r| r.document_id == document_id)
            .cloned()
            .collect())
    }

    async fn append_event(&self, event: &Event) -> StoreResult<()> {
        if self.faults.fail_events.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("event log unavailable".to_string()));
        }
        self.tables.write().await.events.push(event.clone());
        Ok(())
    }

    async fn list_events(&self, dossier_id: DossierId) -> StoreResult<Vec<Event>> {
        let tables = self.tables.read().await;
        let mut events: Vec<Event> = tables
            .events
            .iter()
            .filter(|e| e.dossier_id == Some(dossier_id))
            .cloned()
            .collect();
        events.sort_by_key(|e| e.created_at);
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order() -> Order {
        Order::pending(
            "cs_test_1",
            UserId::from("c1"),
            ProductId::from("llc"),
            50_000,
            "usd",
            Utc::now(),
        )
    }

    fn capture() -> PaymentCapture {
        PaymentCapture {
            amount_cents: 50_000,
            payment_intent_id: Some("pi_1".to_string()),
            customer_id: Some("cus_1".to_string()),
            paid_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_order_paid_transition_happens_once() {
        let store = InMemoryStore::new();
        let order = order();
        store.insert_order(&order).await.unwrap();

        assert!(store.mark_order_paid(order.id, &capture()).await.unwrap());
        assert!(!store.mark_order_paid(order.id, &capture()).await.unwrap());
        assert!(!store
            .mark_order_unpaid(order.id, OrderStatus::Expired, Utc::now())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_second_dossier_for_same_client_product_rejected() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let first = Dossier::new(UserId::from("c1"), ProductId::from("llc"), now);
        let second = Dossier::new(UserId::from("c1"), ProductId::from("llc"), now);

        store.insert_dossier_with_steps(&first, &[]).await.unwrap();
        let err = store.insert_dossier_with_steps(&second, &[]).await.unwrap_err();
        assert!(matches!(err, StoreError::UniqueViolation { .. }));
        assert_eq!(store.dossier_count().await, 1);
    }

    #[tokio::test]
    async fn test_link_order_keeps_first_link() {
        let store = InMemoryStore::new();
        let order = order();
        store.insert_order(&order).await.unwrap();
        let first = DossierId::new();

        assert_eq!(
            store.link_order(order.id, first, Utc::now()).await.unwrap(),
            Some(first)
        );
        assert_eq!(
            store
                .link_order(order.id, DossierId::new(), Utc::now())
                .await
                .unwrap(),
            Some(first)
        );
    }

    #[tokio::test]
    async fn test_current_step_must_belong_to_dossier() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let a = Dossier::new(UserId::from("c1"), ProductId::from("llc"), now);
        let b = Dossier::new(UserId::from("c2"), ProductId::from("llc"), now);
        let step_b = StepInstance::new(b.id, StepTemplateId::from("s1"), 1, now);
        store.insert_dossier_with_steps(&a, &[]).await.unwrap();
        store
            .insert_dossier_with_steps(&b, &[step_b.clone()])
            .await
            .unwrap();

        assert!(!store.set_current_step(a.id, step_b.id, now).await.unwrap());
        assert!(store.set_current_step(b.id, step_b.id, now).await.unwrap());
    }

    #[tokio::test]
    async fn test_status_patch_keeps_concurrent_pointer_move() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let mut dossier = Dossier::new(UserId::from("c1"), ProductId::from("llc"), now);
        let s1 = StepInstance::new(dossier.id, StepTemplateId::from("s1"), 1, now);
        let s2 = StepInstance::new(dossier.id, StepTemplateId::from("s2"), 2, now);
        dossier.current_step_instance_id = Some(s1.id);
        store
            .insert_dossier_with_steps(&dossier, &[s1.clone(), s2.clone()])
            .await
            .unwrap();

        // Status read before the pointer moved.
        let read = store.get_dossier(dossier.id).await.unwrap().unwrap();
        assert!(store.set_current_step(dossier.id, s2.id, now).await.unwrap());

        let patch = DossierPatch::new(now).status(DossierStatus::Closed);
        let written = store
            .patch_dossier_if(dossier.id, read.status, &patch)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(written.status, DossierStatus::Closed);
        assert_eq!(written.current_step_instance_id, Some(s2.id));

        // Guard failed: status is no longer what the caller read.
        assert!(store
            .patch_dossier_if(dossier.id, read.status, &patch)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_unsettled_orders_include_paid_but_unlinked() {
        let store = InMemoryStore::new();
        let paid = order();
        let mut linked = Order::pending(
            "cs_test_2",
            UserId::from("c2"),
            ProductId::from("llc"),
            50_000,
            "usd",
            Utc::now(),
        );
        store.insert_order(&paid).await.unwrap();
        store.insert_order(&linked).await.unwrap();
        store.mark_order_paid(paid.id, &capture()).await.unwrap();
        store.mark_order_paid(linked.id, &capture()).await.unwrap();
        linked.dossier_id = store
            .link_order(linked.id, DossierId::new(), Utc::now())
            .await
            .unwrap();
        assert!(linked.dossier_id.is_some());

        // The cutoff only applies to PENDING orders.
        let unsettled = store
            .list_unsettled_orders(Utc::now() - chrono::Duration::hours(1), 10)
            .await
            .unwrap();
        assert_eq!(unsettled.len(), 1);
        assert_eq!(unsettled[0].id, paid.id);
    }

    #[tokio::test]
    async fn test_concurrent_uploads_leave_one_live_document() {
        let store = std::sync::Arc::new(InMemoryStore::new());
        let now = Utc::now();
        let dossier_id = DossierId::new();
        let step_id = StepInstanceId::new();

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let document = Document {
                    id: DocumentId::new(),
                    dossier_id,
                    document_type_id: DocumentTypeId::from("passport"),
                    step_instance_id: Some(step_id),
                    status: DocumentStatus::Pending,
                    current_version_id: None,
                    created_at: now,
                    updated_at: now,
                };
                let version = NewVersion {
                    id: DocumentVersionId::new(),
                    file_url: format!("mem://{i}"),
                    file_name: format!("passport-{i}.pdf"),
                    size_bytes: 3,
                    mime_type: "application/pdf".to_string(),
                    uploaded_by: UserId::from("c1"),
                    uploader_type: UploaderType::Client,
                    created_at: now,
                };
                store
                    .insert_document_with_version(&document, version, true)
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            let (document, version, _) = handle.await.unwrap();
            assert_eq!(version.version_number, 1);
            assert_eq!(document.current_version_id, Some(version.id));
        }

        let documents = store.list_step_documents(step_id).await.unwrap();
        assert_eq!(documents.len(), 8);
        let live: Vec<_> = documents
            .iter()
            .filter(|d| d.status != DocumentStatus::Outdated)
            .collect();
        assert_eq!(live.len(), 1);
        assert!(live[0].current_version_id.is_some());
    }

    #[tokio::test]
    async fn test_transient_failures_are_consumed() {
        let store = InMemoryStore::new();
        store.fail_next_order_lookups(1);
        assert!(store.find_order_by_session("x").await.is_err());
        assert!(store.find_order_by_session("x").await.unwrap().is_none());
    }
}
