//! Append-only audit log.
//!
//! Event writes are side effects of a transition that has already been
//! stored, so a failed append is logged and counted but never returned.

use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::identity::Caller;
use crate::model::{DossierId, EntityType, Event, EventId, EventType};
use crate::observability::EngineMetrics;
use crate::store::DossierStore;

/// An event before the log stamps id, actor and time on it.
#[derive(Debug, Clone, PartialEq)]
pub struct EventDraft {
    pub dossier_id: Option<DossierId>,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub event_type: EventType,
    pub payload: Value,
}

impl EventDraft {
    pub fn new(
        dossier_id: Option<DossierId>,
        entity_type: EntityType,
        entity_id: impl ToString,
        event_type: EventType,
    ) -> Self {
        Self {
            dossier_id,
            entity_type,
            entity_id: entity_id.to_string(),
            event_type,
            payload: Value::Object(Default::default()),
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

#[derive(Clone)]
pub struct EventLog {
    store: Arc<dyn DossierStore>,
    metrics: Arc<EngineMetrics>,
}

impl EventLog {
    pub fn new(store: Arc<dyn DossierStore>, metrics: Arc<EngineMetrics>) -> Self {
        Self { store, metrics }
    }

    /// Best-effort append. Returns the event id when the write landed.
    pub async fn record(&self, caller: &Caller, draft: EventDraft) -> Option<EventId> {
        let event = Event {
            id: EventId::new(),
            dossier_id: draft.dossier_id,
            entity_type: draft.entity_type,
            entity_id: draft.entity_id,
            event_type: draft.event_type,
            actor_type: caller.actor_type(),
            actor_id: Some(caller.id.to_string()),
            payload: draft.payload,
            created_at: Utc::now(),
        };

        match self.store.append_event(&event).await {
            Ok(()) => {
                debug!(
                    event_type = %event.event_type,
                    entity_id = %event.entity_id,
                    "Event recorded"
                );
                Some(event.id)
            }
            Err(e) => {
                self.metrics.record_event_dropped();
                warn!(
                    event_type = %event.event_type,
                    entity_id = %event.entity_id,
                    error = %e,
                    "Failed to append audit event, continuing"
                );
                None
            }
        }
    }
}
