//! Payment processor abstraction
//!
//! Provisioning only ever reads a session's verification result; it never
//! mutates anything on the processor side.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;

#[cfg(test)]
use mockall::automock;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PaymentError {
    #[error("Checkout session not found: {session_id}")]
    SessionNotFound { session_id: String },
    #[error("Payment processor unavailable: {message}")]
    Unavailable { message: String },
}

/// What the processor reports about a checkout session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentVerification {
    pub paid: bool,
    /// The session can no longer be paid
    pub expired: bool,
    pub amount_cents: Option<i64>,
    pub customer_id: Option<String>,
    pub payment_intent_id: Option<String>,
}

impl PaymentVerification {
    pub fn paid(amount_cents: i64) -> Self {
        Self {
            paid: true,
            amount_cents: Some(amount_cents),
            ..Default::default()
        }
    }

    pub fn expired() -> Self {
        Self {
            expired: true,
            ..Default::default()
        }
    }

    pub fn open() -> Self {
        Self::default()
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    async fn verify_session(&self, session_id: &str) -> Result<PaymentVerification, PaymentError>;
}

/// Answers `verify_session` from a table filled in ahead of time.
#[derive(Debug, Default)]
pub struct ScriptedPaymentProcessor {
    sessions: RwLock<HashMap<String, PaymentVerification>>,
}

impl ScriptedPaymentProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_session(&self, session_id: &str, verification: PaymentVerification) {
        self.sessions
            .write()
            .await
            .insert(session_id.to_string(), verification);
    }
}

#[async_trait]
impl PaymentProcessor for ScriptedPaymentProcessor {
    async fn verify_session(&self, session_id: &str) -> Result<PaymentVerification, PaymentError> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| PaymentError::SessionNotFound {
                session_id: session_id.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_processor_answers_known_sessions() {
        let processor = ScriptedPaymentProcessor::new();
        processor
            .set_session("cs_1", PaymentVerification::paid(49_900))
            .await;

        let verification = processor.verify_session("cs_1").await.unwrap();
        assert!(verification.paid);
        assert_eq!(verification.amount_cents, Some(49_900));

        let err = processor.verify_session("cs_2").await.unwrap_err();
        assert_eq!(
            err,
            PaymentError::SessionNotFound {
                session_id: "cs_2".to_string()
            }
        );
    }
}
