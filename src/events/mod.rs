//! Notification and audit event publishing.

pub mod publisher;

pub use publisher::{EventPublisher, ExecutionWatch, PublishError, PublishedEvent};
