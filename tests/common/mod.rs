// Shared fixtures for the integration tests
#![allow(dead_code)]

use chrono::{Duration, Utc};
use std::sync::Arc;

use dossier_flow::model::{Dossier, Order, ProductId, StepInstance, UserId};
use dossier_flow::{
    DossierEngine, DossierStore, InMemoryObjectStore, InMemoryStore, PaymentSignal,
    ProductCatalog, ProvisioningPipeline, RecordingNotificationSink, SignalSource,
};

pub const CATALOG: &str = r#"
[[document_types]]
id = "passport"
label = "Passport"

[[document_types]]
id = "ein_letter"
label = "EIN confirmation letter"

[[products]]
id = "llc-formation"
name = "LLC formation"

[[products.steps]]
id = "s1"
label = "Applicant"
position = 1
actor = "CLIENT"

[[products.steps.fields]]
id = "a"
key = "a"
label = "Answer A"
required = true
kind = { type = "text" }

[[products.steps.fields]]
id = "b"
key = "b"
label = "Answer B"
kind = { type = "text" }

[[products.steps]]
id = "s2"
label = "Identity documents"
position = 2
actor = "CLIENT"
required_document_types = ["passport"]

[[products.steps.fields]]
id = "email"
key = "email"
label = "Email"
required = true
kind = { type = "email" }

[[products.steps]]
id = "s3"
label = "EIN filing"
position = 3
actor = "ADMIN"
"#;

pub const PRODUCT: &str = "llc-formation";

pub struct World {
    pub engine: DossierEngine,
    pub pipeline: ProvisioningPipeline,
    pub store: Arc<InMemoryStore>,
    pub notifications: Arc<RecordingNotificationSink>,
}

pub fn world() -> World {
    let store = Arc::new(InMemoryStore::new());
    let notifications = Arc::new(RecordingNotificationSink::new());
    let catalog = Arc::new(ProductCatalog::from_toml_str(CATALOG).expect("catalog"));
    let engine = DossierEngine::new(
        store.clone(),
        catalog,
        Arc::new(InMemoryObjectStore::new()),
        notifications.clone(),
    );
    let pipeline = ProvisioningPipeline::for_engine(&engine);
    World {
        engine,
        pipeline,
        store,
        notifications,
    }
}

pub async fn pending_order(world: &World, session_id: &str, client: &str) -> Order {
    let order = Order::pending(
        session_id,
        UserId::from(client),
        ProductId::from(PRODUCT),
        49_900,
        "usd",
        Utc::now() - Duration::hours(1),
    );
    world.store.insert_order(&order).await.expect("insert order");
    order
}

pub fn signal(session_id: &str, client: &str, source: SignalSource) -> PaymentSignal {
    PaymentSignal {
        session_id: session_id.to_string(),
        client_id: UserId::from(client),
        product_id: ProductId::from(PRODUCT),
        amount_cents: 49_900,
        payment_intent_id: Some(format!("pi_{session_id}")),
        customer_id: Some(format!("cus_{client}")),
        source,
    }
}

/// Pays for a fresh order and returns the provisioned dossier with its steps.
pub async fn provisioned(world: &World, client: &str) -> (Dossier, Vec<StepInstance>) {
    let session_id = format!("cs_{client}");
    pending_order(world, &session_id, client).await;
    let outcome = world
        .pipeline
        .provision(&signal(&session_id, client, SignalSource::Push))
        .await
        .expect("provision");
    let dossier_id = outcome.dossier_id();
    let dossier = world
        .store
        .get_dossier(dossier_id)
        .await
        .expect("get dossier")
        .expect("dossier exists");
    let steps = world
        .store
        .list_step_instances(dossier_id)
        .await
        .expect("list steps");
    (dossier, steps)
}
