use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Lifecycle event as seen by subscribers
#[derive(Debug, Clone)]
pub struct PublishedEvent {
    pub name: String,
    /// Execution the event is about, lifted from the `execution_uuid` payload field
    pub execution_uuid: Option<Uuid>,
    pub context: Value,
    pub published_at: chrono::DateTime<chrono::Utc>,
}

/// Broadcast fan-out of execution lifecycle events. Sending never waits on
/// subscribers and succeeds when nobody listens.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    sender: broadcast::Sender<PublishedEvent>,
}

impl EventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub async fn publish(
        &self,
        event_name: impl Into<String>,
        context: Value,
    ) -> Result<(), PublishError> {
        let execution_uuid = match context.get("execution_uuid") {
            None | Some(Value::Null) => None,
            Some(Value::String(raw)) => Some(
                Uuid::parse_str(raw).map_err(|_| PublishError::MalformedExecutionId(raw.clone()))?,
            ),
            Some(other) => return Err(PublishError::MalformedExecutionId(other.to_string())),
        };
        let event = PublishedEvent {
            name: event_name.into(),
            execution_uuid,
            context,
            published_at: chrono::Utc::now(),
        };
        let _ = self.sender.send(event);
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PublishedEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Events for one execution only
    pub fn watch_execution(&self, execution_uuid: Uuid) -> ExecutionWatch {
        ExecutionWatch {
            execution_uuid,
            receiver: self.sender.subscribe(),
        }
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(1000)
    }
}

/// Subscription filtered to a single execution
#[derive(Debug)]
pub struct ExecutionWatch {
    execution_uuid: Uuid,
    receiver: broadcast::Receiver<PublishedEvent>,
}

impl ExecutionWatch {
    /// Next event for the watched execution. Lagged events are skipped;
    /// `None` once the publisher is gone.
    pub async fn next(&mut self) -> Option<PublishedEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.execution_uuid == Some(self.execution_uuid) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        execution_uuid = %self.execution_uuid,
                        skipped,
                        "Execution watch lagged behind the event stream"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Event payload carries a malformed execution id: {0}")]
    MalformedExecutionId(String),
}
