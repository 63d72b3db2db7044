//! External collaborator abstractions
//!
//! The engine never talks to object storage, outbound notification delivery
//! or the payment processor directly. Each is a trait here so that callers
//! inject the real client and tests inject an in-memory or mocked one.

pub mod notification;
pub mod object_store;
pub mod payment;

pub use notification::{
    NotificationError, NotificationSink, QueuedNotification, RecordingNotificationSink,
};
pub use object_store::{InMemoryObjectStore, ObjectStore, ObjectStoreError};
pub use payment::{PaymentError, PaymentProcessor, PaymentVerification, ScriptedPaymentProcessor};
