//! Payment-driven provisioning.
//!
//! The push callback and the pull reconciler both feed a [`PaymentSignal`]
//! into [`ProvisioningPipeline::provision`]. The procedure can be re-run from
//! scratch any number of times, by any number of racing callers, and still
//! leaves exactly one paid order linked to exactly one dossier.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn, Instrument};

use crate::catalog::ProductCatalog;
use crate::engine::DossierEngine;
use crate::error::{StoreError, WorkflowError, WorkflowResult};
use crate::events::{EventDraft, EventLog};
use crate::identity::Caller;
use crate::model::{
    Dossier, DossierId, EntityType, EventType, Order, OrderStatus, PaymentCapture, ProductId,
    StepInstance, UserId,
};
use crate::observability::EngineMetrics;
use crate::store::DossierStore;
use crate::telemetry::{create_workflow_span, generate_correlation_id};

pub mod reconcile;

pub use reconcile::{ReconciliationReport, Reconciler};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalSource {
    /// Processor callback
    Push,
    /// Reconciliation pass
    Pull,
}

impl fmt::Display for SignalSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalSource::Push => f.write_str("push"),
            SignalSource::Pull => f.write_str("pull"),
        }
    }
}

/// A confirmed payment for one checkout session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentSignal {
    pub session_id: String,
    pub client_id: UserId,
    pub product_id: ProductId,
    pub amount_cents: i64,
    pub payment_intent_id: Option<String>,
    pub customer_id: Option<String>,
    pub source: SignalSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisioningOutcome {
    /// This call created the dossier.
    Provisioned { dossier_id: DossierId },
    /// A dossier already existed for the client and product; the order now
    /// points at it.
    LinkedExisting { dossier_id: DossierId },
    /// The order was already paid and linked. Nothing was written.
    AlreadyProcessed { dossier_id: DossierId },
}

impl ProvisioningOutcome {
    pub fn dossier_id(&self) -> DossierId {
        match self {
            ProvisioningOutcome::Provisioned { dossier_id }
            | ProvisioningOutcome::LinkedExisting { dossier_id }
            | ProvisioningOutcome::AlreadyProcessed { dossier_id } => *dossier_id,
        }
    }
}

#[derive(Clone)]
pub struct ProvisioningPipeline {
    store: Arc<dyn DossierStore>,
    catalog: Arc<ProductCatalog>,
    metrics: Arc<EngineMetrics>,
    events: EventLog,
}

impl ProvisioningPipeline {
    pub fn new(
        store: Arc<dyn DossierStore>,
        catalog: Arc<ProductCatalog>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            events: EventLog::new(store.clone(), metrics.clone()),
            store,
            catalog,
            metrics,
        }
    }

    /// Shares the engine's store, catalog and counters.
    pub fn for_engine(engine: &DossierEngine) -> Self {
        Self::new(
            engine.store.clone(),
            engine.catalog.clone(),
            engine.metrics.clone(),
        )
    }

    pub fn store(&self) -> &Arc<dyn DossierStore> {
        &self.store
    }

    pub async fn provision(&self, signal: &PaymentSignal) -> WorkflowResult<ProvisioningOutcome> {
        let correlation_id = generate_correlation_id();
        let span = create_workflow_span("provision", None, Some(&correlation_id));

        async move {
            if signal.session_id.trim().is_empty() {
                return Err(WorkflowError::invalid("payment signal without a session id"));
            }
            let product = self.catalog.product(&signal.product_id)?;

            let order = self
                .store
                .find_order_by_session(&signal.session_id)
                .await?
                .ok_or_else(|| WorkflowError::not_found("order", &signal.session_id))?;
            if order.client_id != signal.client_id || order.product_id != signal.product_id {
                return Err(WorkflowError::invalid(format!(
                    "signal for session {} does not match its order",
                    signal.session_id
                )));
            }

            let (order, paid_now) = match self.settle(order, signal).await? {
                Settled::Linked(dossier_id) => {
                    self.metrics.record_duplicate_signal();
                    info!(
                        session_id = %signal.session_id,
                        source = %signal.source,
                        dossier_id = %dossier_id,
                        "Payment signal already processed"
                    );
                    return Ok(ProvisioningOutcome::AlreadyProcessed { dossier_id });
                }
                Settled::Unlinked { order, paid_now } => (order, paid_now),
            };

            let now = Utc::now();
            self.store
                .activate_client_profile(&order.client_id, now)
                .await?;

            let outcome = match self
                .store
                .find_dossier_for(&order.client_id, &order.product_id)
                .await?
            {
                Some(existing) => ProvisioningOutcome::LinkedExisting {
                    dossier_id: existing.id,
                },
                None => {
                    let (dossier, steps) = build_dossier(&order, product.ordered_steps(), now);
                    match self.store.insert_dossier_with_steps(&dossier, &steps).await {
                        Ok(()) => {
                            self.metrics.record_provisioned();
                            info!(
                                dossier_id = %dossier.id,
                                client_id = %order.client_id,
                                steps = steps.len(),
                                "Dossier provisioned"
                            );
                            ProvisioningOutcome::Provisioned {
                                dossier_id: dossier.id,
                            }
                        }
                        Err(StoreError::UniqueViolation { .. }) => {
                            self.metrics.record_provisioning_conflict();
                            let winner = self
                                .store
                                .find_dossier_for(&order.client_id, &order.product_id)
                                .await?
                                .ok_or_else(|| WorkflowError::Conflict {
                                    reason: format!(
                                        "dossier for {} vanished after a duplicate insert",
                                        order.client_id
                                    ),
                                })?;
                            ProvisioningOutcome::LinkedExisting {
                                dossier_id: winner.id,
                            }
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
            };

            let linked = self
                .store
                .link_order(order.id, outcome.dossier_id(), now)
                .await?
                .ok_or_else(|| WorkflowError::not_found("order", order.id))?;
            if linked != outcome.dossier_id() {
                warn!(
                    order_id = %order.id,
                    linked = %linked,
                    wanted = %outcome.dossier_id(),
                    "Order was already linked to another dossier"
                );
            }

            self.record_provisioning_events(&order, &outcome, paid_now, signal.source)
                .await;
            Ok(outcome)
        }
        .instrument(span)
        .await
    }

    /// PENDING -> PAID, or the paid order a previous run left behind.
    async fn settle(&self, order: Order, signal: &PaymentSignal) -> WorkflowResult<Settled> {
        match order.status {
            OrderStatus::Paid => return Ok(Settled::after_payment(order, false)),
            OrderStatus::Failed | OrderStatus::Expired => {
                warn!(
                    order_id = %order.id,
                    status = %order.status,
                    "Payment signal for a closed order"
                );
                return Err(WorkflowError::precondition(format!(
                    "order {} is {}",
                    order.id, order.status
                )));
            }
            OrderStatus::Pending => {}
        }

        let capture = PaymentCapture {
            amount_cents: signal.amount_cents,
            payment_intent_id: signal.payment_intent_id.clone(),
            customer_id: signal.customer_id.clone(),
            paid_at: Utc::now(),
        };
        if self.store.mark_order_paid(order.id, &capture).await? {
            debug!(order_id = %order.id, source = %signal.source, "Order marked paid");
            let mut order = order;
            order.status = OrderStatus::Paid;
            order.amount_cents = capture.amount_cents;
            order.payment_intent_id = capture.payment_intent_id;
            order.customer_id = capture.customer_id;
            order.paid_at = Some(capture.paid_at);
            return Ok(Settled::Unlinked {
                order,
                paid_now: true,
            });
        }

        // Another caller moved the order first.
        let current = self
            .store
            .find_order_by_session(&signal.session_id)
            .await?
            .ok_or_else(|| WorkflowError::not_found("order", &signal.session_id))?;
        match current.status {
            OrderStatus::Paid => Ok(Settled::after_payment(current, false)),
            status => Err(WorkflowError::precondition(format!(
                "order {} is {status}",
                current.id
            ))),
        }
    }

    async fn record_provisioning_events(
        &self,
        order: &Order,
        outcome: &ProvisioningOutcome,
        paid_now: bool,
        source: SignalSource,
    ) {
        let system = Caller::system();
        let dossier_id = outcome.dossier_id();
        if let ProvisioningOutcome::Provisioned { .. } = outcome {
            self.events
                .record(
                    &system,
                    EventDraft::new(
                        Some(dossier_id),
                        EntityType::Dossier,
                        dossier_id,
                        EventType::DossierCreated,
                    )
                    .with_payload(json!({
                        "order_id": order.id,
                        "client_id": order.client_id,
                        "product_id": order.product_id,
                    })),
                )
                .await;
        }
        if paid_now {
            self.events
                .record(
                    &system,
                    EventDraft::new(
                        Some(dossier_id),
                        EntityType::Order,
                        order.id,
                        EventType::PaymentReceived,
                    )
                    .with_payload(json!({
                        "amount_cents": order.amount_cents,
                        "currency": order.currency,
                        "payment_intent_id": order.payment_intent_id,
                        "source": source,
                    })),
                )
                .await;
        }
    }
}

enum Settled {
    Linked(DossierId),
    Unlinked { order: Order, paid_now: bool },
}

impl Settled {
    fn after_payment(order: Order, paid_now: bool) -> Self {
        match order.dossier_id {
            Some(dossier_id) => Settled::Linked(dossier_id),
            None => Settled::Unlinked { order, paid_now },
        }
    }
}

/// One step instance per template step; only the first is started and
/// current.
fn build_dossier(
    order: &Order,
    templates: &[crate::catalog::StepTemplate],
    now: chrono::DateTime<Utc>,
) -> (Dossier, Vec<StepInstance>) {
    let mut dossier = Dossier::new(order.client_id.clone(), order.product_id.clone(), now);
    dossier.metadata = json!({
        "source_order_id": order.id,
        "processor_session_id": order.processor_session_id,
    });
    let mut steps: Vec<StepInstance> = templates
        .iter()
        .map(|t| StepInstance::new(dossier.id, t.id.clone(), t.position, now))
        .collect();
    if let Some(first) = steps.first_mut() {
        first.started_at = Some(now);
        dossier.current_step_instance_id = Some(first.id);
    }
    (dossier, steps)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::engine::test_support::CATALOG;
    use crate::store::InMemoryStore;

    pub struct Pipeline {
        pub pipeline: ProvisioningPipeline,
        pub store: Arc<InMemoryStore>,
        pub metrics: Arc<EngineMetrics>,
    }

    pub fn pipeline() -> Pipeline {
        let store = Arc::new(InMemoryStore::new());
        let metrics = Arc::new(EngineMetrics::new());
        let catalog = Arc::new(ProductCatalog::from_toml_str(CATALOG).unwrap());
        Pipeline {
            pipeline: ProvisioningPipeline::new(store.clone(), catalog, metrics.clone()),
            store,
            metrics,
        }
    }

    pub async fn pending_order(store: &InMemoryStore, session_id: &str, client: &str) -> Order {
        let order = Order::pending(
            session_id,
            UserId::from(client),
            ProductId::from("llc-formation"),
            49_900,
            "usd",
            Utc::now() - chrono::Duration::hours(1),
        );
        store.insert_order(&order).await.unwrap();
        order
    }

    pub fn signal(session_id: &str, client: &str, source: SignalSource) -> PaymentSignal {
        PaymentSignal {
            session_id: session_id.to_string(),
            client_id: UserId::from(client),
            product_id: ProductId::from("llc-formation"),
            amount_cents: 49_900,
            payment_intent_id: Some("pi_1".to_string()),
            customer_id: Some("cus_1".to_string()),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::model::StepStatus;

    #[tokio::test]
    async fn test_provision_creates_dossier_and_steps() {
        let p = pipeline();
        let order = pending_order(&p.store, "cs_1", "c1").await;

        let outcome = p
            .pipeline
            .provision(&signal("cs_1", "c1", SignalSource::Push))
            .await
            .unwrap();
        let dossier_id = match outcome {
            ProvisioningOutcome::Provisioned { dossier_id } => dossier_id,
            other => panic!("unexpected outcome {other:?}"),
        };

        let dossier = p.store.get_dossier(dossier_id).await.unwrap().unwrap();
        let steps = p.store.list_step_instances(dossier_id).await.unwrap();
        assert_eq!(steps.len(), 3);
        assert!(steps.iter().all(|s| s.status == StepStatus::Draft));
        assert!(steps[0].started_at.is_some());
        assert!(steps[1..].iter().all(|s| s.started_at.is_none()));
        assert_eq!(dossier.current_step_instance_id, Some(steps[0].id));

        let order = p.store.find_order_by_session("cs_1").await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Paid);
        assert_eq!(order.dossier_id, Some(dossier_id));
        assert_eq!(order.payment_intent_id.as_deref(), Some("pi_1"));

        let profile = p
            .store
            .get_client_profile(&order.client_id)
            .await
            .unwrap()
            .unwrap();
        assert!(profile.active);

        let events = p.store.list_events(dossier_id).await.unwrap();
        let kinds: Vec<EventType> = events.iter().map(|e| e.event_type).collect();
        assert_eq!(kinds, vec![EventType::DossierCreated, EventType::PaymentReceived]);
        assert!(events
            .iter()
            .all(|e| e.actor_type == crate::model::ActorType::System));
    }

    #[tokio::test]
    async fn test_duplicate_signal_is_a_no_op() {
        let p = pipeline();
        pending_order(&p.store, "cs_1", "c1").await;
        let push = signal("cs_1", "c1", SignalSource::Push);

        let first = p.pipeline.provision(&push).await.unwrap();
        let second = p.pipeline.provision(&push).await.unwrap();
        assert_eq!(
            second,
            ProvisioningOutcome::AlreadyProcessed {
                dossier_id: first.dossier_id()
            }
        );
        assert_eq!(p.store.dossier_count().await, 1);
        assert_eq!(p.store.step_instance_count().await, 3);
        assert_eq!(p.store.list_events(first.dossier_id()).await.unwrap().len(), 2);
        assert_eq!(p.metrics.get_stats().duplicate_signals, 1);
    }

    #[tokio::test]
    async fn test_paid_but_unlinked_order_resumes() {
        let p = pipeline();
        let order = pending_order(&p.store, "cs_1", "c1").await;
        let capture = PaymentCapture {
            amount_cents: 49_900,
            payment_intent_id: None,
            customer_id: None,
            paid_at: Utc::now(),
        };
        assert!(p.store.mark_order_paid(order.id, &capture).await.unwrap());

        let outcome = p
            .pipeline
            .provision(&signal("cs_1", "c1", SignalSource::Pull))
            .await
            .unwrap();
        assert!(matches!(outcome, ProvisioningOutcome::Provisioned { .. }));

        let events = p.store.list_events(outcome.dossier_id()).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::DossierCreated);
    }

    #[tokio::test]
    async fn test_second_order_links_existing_dossier() {
        let p = pipeline();
        pending_order(&p.store, "cs_1", "c1").await;
        pending_order(&p.store, "cs_2", "c1").await;

        let first = p
            .pipeline
            .provision(&signal("cs_1", "c1", SignalSource::Push))
            .await
            .unwrap();
        let second = p
            .pipeline
            .provision(&signal("cs_2", "c1", SignalSource::Push))
            .await
            .unwrap();
        assert_eq!(
            second,
            ProvisioningOutcome::LinkedExisting {
                dossier_id: first.dossier_id()
            }
        );
        assert_eq!(p.store.dossier_count().await, 1);
    }

    #[tokio::test]
    async fn test_event_failures_do_not_undo_provisioning() {
        let p = pipeline();
        pending_order(&p.store, "cs_1", "c1").await;
        p.store.fail_event_writes(true);

        let outcome = p
            .pipeline
            .provision(&signal("cs_1", "c1", SignalSource::Push))
            .await
            .unwrap();
        assert!(matches!(outcome, ProvisioningOutcome::Provisioned { .. }));
        assert_eq!(p.metrics.get_stats().events_dropped, 2);
        assert_eq!(p.store.dossier_count().await, 1);
    }

    #[tokio::test]
    async fn test_rejects_unknown_and_mismatched_signals() {
        let p = pipeline();
        pending_order(&p.store, "cs_1", "c1").await;

        let err = p
            .pipeline
            .provision(&signal("cs_missing", "c1", SignalSource::Push))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::NotFound { .. }));

        let err = p
            .pipeline
            .provision(&signal("cs_1", "c2", SignalSource::Push))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidArgument { .. }));
        assert_eq!(p.store.dossier_count().await, 0);
    }

    #[tokio::test]
    async fn test_transient_lookup_failure_surfaces() {
        let p = pipeline();
        pending_order(&p.store, "cs_1", "c1").await;
        p.store.fail_next_order_lookups(1);

        let err = p
            .pipeline
            .provision(&signal("cs_1", "c1", SignalSource::Push))
            .await
            .unwrap_err();
        assert!(err.is_transient());

        let outcome = p
            .pipeline
            .provision(&signal("cs_1", "c1", SignalSource::Push))
            .await
            .unwrap();
        assert!(matches!(outcome, ProvisioningOutcome::Provisioned { .. }));
    }
}
