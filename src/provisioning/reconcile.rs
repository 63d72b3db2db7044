//! Pull-based reconciliation of orders stuck in PENDING, and of paid orders
//! an earlier run never linked to a dossier.

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn, Instrument};

use super::{PaymentSignal, ProvisioningOutcome, ProvisioningPipeline, SignalSource};
use crate::config::ReconciliationConfig;
use crate::error::WorkflowResult;
use crate::events::EventDraft;
use crate::external::PaymentProcessor;
use crate::identity::Caller;
use crate::model::{EntityType, EventType, Order, OrderStatus};
use crate::store::DossierStore;
use crate::telemetry::{create_workflow_span, generate_correlation_id};

/// Counts for one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconciliationReport {
    pub examined: usize,
    pub provisioned: usize,
    pub linked_existing: usize,
    pub already_processed: usize,
    pub expired: usize,
    pub still_pending: usize,
    pub failed: usize,
}

pub struct Reconciler {
    pipeline: ProvisioningPipeline,
    processor: Arc<dyn PaymentProcessor>,
    config: ReconciliationConfig,
}

impl Reconciler {
    pub fn new(
        pipeline: ProvisioningPipeline,
        processor: Arc<dyn PaymentProcessor>,
        config: ReconciliationConfig,
    ) -> Self {
        Self {
            pipeline,
            processor,
            config,
        }
    }

    /// Re-verifies every order pending since before
    /// `now - pending_after_minutes` and resumes every paid order that has no
    /// dossier yet. A failure on one order is counted and the pass moves on;
    /// only a failed listing aborts the pass.
    pub async fn run_once(&self, now: DateTime<Utc>) -> WorkflowResult<ReconciliationReport> {
        let correlation_id = generate_correlation_id();
        let span = create_workflow_span("reconcile", None, Some(&correlation_id));

        async move {
            let cutoff = now - Duration::minutes(self.config.pending_after_minutes);
            let orders = self
                .pipeline
                .store()
                .list_unsettled_orders(cutoff, self.config.batch_size)
                .await?;

            let mut report = ReconciliationReport::default();
            for order in &orders {
                report.examined += 1;

                if order.status == OrderStatus::Paid {
                    // Captured already; an earlier run stopped before linking.
                    let signal = signal_for(
                        order,
                        order.amount_cents,
                        order.payment_intent_id.clone(),
                        order.customer_id.clone(),
                    );
                    self.tally_provisioning(order, &signal, &mut report).await;
                    continue;
                }

                let verification = match self
                    .processor
                    .verify_session(&order.processor_session_id)
                    .await
                {
                    Ok(v) => v,
                    Err(e) => {
                        report.failed += 1;
                        warn!(
                            order_id = %order.id,
                            session_id = %order.processor_session_id,
                            error = %e,
                            "Could not verify checkout session"
                        );
                        continue;
                    }
                };

                if verification.paid {
                    let signal = signal_for(
                        order,
                        verification.amount_cents.unwrap_or(order.amount_cents),
                        verification.payment_intent_id.clone(),
                        verification.customer_id.clone(),
                    );
                    self.tally_provisioning(order, &signal, &mut report).await;
                } else if verification.expired {
                    match self.expire(order, now).await {
                        Ok(true) => report.expired += 1,
                        Ok(false) => report.still_pending += 1,
                        Err(e) => {
                            report.failed += 1;
                            warn!(order_id = %order.id, error = %e, "Failed to expire order");
                        }
                    }
                } else {
                    report.still_pending += 1;
                }
            }

            info!(
                examined = report.examined,
                provisioned = report.provisioned,
                linked_existing = report.linked_existing,
                expired = report.expired,
                failed = report.failed,
                "Reconciliation pass finished"
            );
            self.pipeline.metrics.log_stats();
            Ok(report)
        }
        .instrument(span)
        .await
    }

    async fn tally_provisioning(
        &self,
        order: &Order,
        signal: &PaymentSignal,
        report: &mut ReconciliationReport,
    ) {
        match self.provision_with_retry(order, signal).await {
            Ok(ProvisioningOutcome::Provisioned { .. }) => report.provisioned += 1,
            Ok(ProvisioningOutcome::LinkedExisting { .. }) => report.linked_existing += 1,
            Ok(ProvisioningOutcome::AlreadyProcessed { .. }) => report.already_processed += 1,
            Err(e) => {
                report.failed += 1;
                warn!(order_id = %order.id, error = %e, "Reconciliation provisioning failed");
            }
        }
    }

    async fn provision_with_retry(
        &self,
        order: &Order,
        signal: &PaymentSignal,
    ) -> WorkflowResult<ProvisioningOutcome> {
        match self.pipeline.provision(signal).await {
            Err(e) if e.is_transient() && self.config.retry_transient_once => {
                warn!(order_id = %order.id, error = %e, "Transient failure, retrying once");
                self.pipeline.provision(signal).await
            }
            other => other,
        }
    }
    /// `false` when the order left PENDING in the meantime.
    async fn expire(&self, order: &Order, now: DateTime<Utc>) -> WorkflowResult<bool> {
        let expired = self
            .pipeline
            .store()
            .mark_order_unpaid(order.id, OrderStatus::Expired, now)
            .await?;
        if expired {
            info!(order_id = %order.id, "Checkout session expired");
            self.pipeline
                .events
                .record(
                    &Caller::system(),
                    EventDraft::new(None, EntityType::Order, order.id, EventType::PaymentFailed)
                        .with_payload(json!({
                            "session_id": order.processor_session_id,
                            "status": OrderStatus::Expired,
                        })),
                )
                .await;
        }
        Ok(expired)
    }
}

fn signal_for(
    order: &Order,
    amount_cents: i64,
    payment_intent_id: Option<String>,
    customer_id: Option<String>,
) -> PaymentSignal {
    PaymentSignal {
        session_id: order.processor_session_id.clone(),
        client_id: order.client_id.clone(),
        product_id: order.product_id.clone(),
        amount_cents,
        payment_intent_id,
        customer_id,
        source: SignalSource::Pull,
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::external::payment::MockPaymentProcessor;
    use crate::external::{PaymentError, PaymentVerification, ScriptedPaymentProcessor};

    fn config(retry: bool) -> ReconciliationConfig {
        ReconciliationConfig {
            pending_after_minutes: 15,
            batch_size: 10,
            retry_transient_once: retry,
        }
    }

    #[tokio::test]
    async fn test_run_once_provisions_paid_and_expires_stale() {
        let p = pipeline();
        pending_order(&p.store, "cs_paid", "c1").await;
        pending_order(&p.store, "cs_gone", "c2").await;
        pending_order(&p.store, "cs_open", "c3").await;

        let processor = Arc::new(ScriptedPaymentProcessor::new());
        processor
            .set_session("cs_paid", PaymentVerification::paid(49_900))
            .await;
        processor
            .set_session("cs_gone", PaymentVerification::expired())
            .await;
        processor
            .set_session("cs_open", PaymentVerification::open())
            .await;

        let reconciler = Reconciler::new(p.pipeline.clone(), processor, config(true));
        let report = reconciler.run_once(Utc::now()).await.unwrap();
        assert_eq!(report.examined, 3);
        assert_eq!(report.provisioned, 1);
        assert_eq!(report.expired, 1);
        assert_eq!(report.still_pending, 1);

        let gone = p.store.find_order_by_session("cs_gone").await.unwrap().unwrap();
        assert_eq!(gone.status, OrderStatus::Expired);

        // Nothing left pending except the open session.
        let again = reconciler.run_once(Utc::now()).await.unwrap();
        assert_eq!(again.examined, 1);
        assert_eq!(again.still_pending, 1);
    }

    #[tokio::test]
    async fn test_recent_orders_are_left_alone() {
        let p = pipeline();
        pending_order(&p.store, "cs_1", "c1").await;

        let mut processor = MockPaymentProcessor::new();
        processor.expect_verify_session().never();

        let reconciler = Reconciler::new(p.pipeline.clone(), Arc::new(processor), config(true));
        let report = reconciler
            .run_once(Utc::now() - Duration::hours(2))
            .await
            .unwrap();
        assert_eq!(report, ReconciliationReport::default());
    }

    #[tokio::test]
    async fn test_transient_failure_retried_once() {
        let p = pipeline();
        pending_order(&p.store, "cs_1", "c1").await;

        let mut processor = MockPaymentProcessor::new();
        processor
            .expect_verify_session()
            .times(1)
            .returning(|_| Ok(PaymentVerification::paid(49_900)));
        let reconciler = Reconciler::new(p.pipeline.clone(), Arc::new(processor), config(true));

        p.store.fail_next_order_lookups(1);
        let report = reconciler.run_once(Utc::now()).await.unwrap();
        assert_eq!(report.provisioned, 1);
        assert_eq!(report.failed, 0);

        // The order is paid now, so a second pass finds nothing pending.
        let report = reconciler.run_once(Utc::now()).await.unwrap();
        assert_eq!(report.examined, 0);
    }

    #[tokio::test]
    async fn test_transient_failure_without_retry_is_counted() {
        let p = pipeline();
        pending_order(&p.store, "cs_1", "c1").await;

        let mut processor = MockPaymentProcessor::new();
        processor
            .expect_verify_session()
            .returning(|_| Ok(PaymentVerification::paid(49_900)));
        let reconciler = Reconciler::new(p.pipeline.clone(), Arc::new(processor), config(false));

        p.store.fail_next_order_lookups(1);
        let report = reconciler.run_once(Utc::now()).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(p.store.dossier_count().await, 0);
    }

    #[tokio::test]
    async fn test_paid_unlinked_order_is_resumed_without_processor() {
        let p = pipeline();
        let order = pending_order(&p.store, "cs_1", "c1").await;
        let capture = crate::model::PaymentCapture {
            amount_cents: 49_900,
            payment_intent_id: Some("pi_1".to_string()),
            customer_id: None,
            paid_at: Utc::now(),
        };
        assert!(p.store.mark_order_paid(order.id, &capture).await.unwrap());

        let mut processor = MockPaymentProcessor::new();
        processor.expect_verify_session().never();
        let reconciler = Reconciler::new(p.pipeline.clone(), Arc::new(processor), config(true));

        let report = reconciler.run_once(Utc::now()).await.unwrap();
        assert_eq!(report.examined, 1);
        assert_eq!(report.provisioned, 1);

        let order = p.store.find_order_by_session("cs_1").await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Paid);
        assert!(order.dossier_id.is_some());
        assert_eq!(p.store.dossier_count().await, 1);

        let report = reconciler.run_once(Utc::now()).await.unwrap();
        assert_eq!(report.examined, 0);
    }

    #[tokio::test]
    async fn test_processor_outage_skips_order() {
        let p = pipeline();
        pending_order(&p.store, "cs_1", "c1").await;

        let mut processor = MockPaymentProcessor::new();
        processor.expect_verify_session().returning(|_| {
            Err(PaymentError::Unavailable {
                message: "503".to_string(),
            })
        });
        let reconciler = Reconciler::new(p.pipeline.clone(), Arc::new(processor), config(true));

        let report = reconciler.run_once(Utc::now()).await.unwrap();
        assert_eq!(report.failed, 1);
        let order = p.store.find_order_by_session("cs_1").await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Pending);
    }
}
