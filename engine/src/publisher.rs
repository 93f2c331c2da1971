//! Outbox publishing.
//!
//! Events are appended through the caller's unit of work, never on their own
//! connection: an event row exists exactly when the state change it
//! describes was committed.

use allotment_core::error::AllocationError;
use allotment_core::event::InventoryEvent;
use allotment_core::outbox::OutboxMessage;
use allotment_core::store::UnitOfWork;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

/// Appends [`InventoryEvent`]s to the outbox with shared correlation metadata.
///
/// # Example
///
/// ```ignore
/// let publisher = OutboxPublisher::new()
///     .with("order_id", order_id.to_string())
///     .with("session_id", session_id.as_str());
/// publisher.publish(&mut uow, &event, now).await?;
/// ```
#[derive(Clone, Debug, Default)]
pub struct OutboxPublisher {
    metadata: Map<String, Value>,
}

impl OutboxPublisher {
    /// A publisher with no metadata.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a metadata entry to every event published from here on.
    #[must_use]
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Append `event` to the outbox within `uow`.
    ///
    /// Returns the outbox sequence assigned to the row.
    ///
    /// # Errors
    ///
    /// - [`AllocationError::Event`] if the payload cannot be encoded
    /// - [`AllocationError::Store`] if the insert fails
    pub async fn publish<U: UnitOfWork>(
        &self,
        uow: &mut U,
        event: &InventoryEvent,
        occurred_at: DateTime<Utc>,
    ) -> Result<i64, AllocationError> {
        let mut message = OutboxMessage::from_event(event, occurred_at)?;
        if !self.metadata.is_empty() {
            message = message.with_metadata(Value::Object(self.metadata.clone()));
        }
        let sequence = uow.append_outbox(&message).await?;

        tracing::debug!(
            sequence,
            event_type = %message.event_type,
            aggregate_id = %message.aggregate_id,
            "Outbox event appended"
        );
        metrics::counter!("allocation.outbox.appended", "event_type" => message.event_type)
            .increment(1);

        Ok(sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use allotment_core::event::AvailabilityReason;
    use allotment_core::ids::ProductId;
    use allotment_core::store::{AllocationStore, Isolation};
    use allotment_testing::InMemoryAllocationStore;

    #[tokio::test]
    async fn published_rows_carry_metadata_and_vanish_on_rollback() {
        let store = InMemoryAllocationStore::new();
        let publisher = OutboxPublisher::new().with("actor", "ops");
        let event = InventoryEvent::StockAvailabilityIncreased {
            product_id: ProductId::new(),
            reason: AvailabilityReason::StockAdjusted,
            increased_by: 3,
            order_id: None,
        };

        {
            let Ok(mut uow) = store.begin(Isolation::ReadCommitted).await else {
                unreachable!("in-memory begin never fails");
            };
            assert!(publisher.publish(&mut uow, &event, Utc::now()).await.is_ok());
        }
        assert!(store.outbox().await.is_empty());

        let Ok(mut uow) = store.begin(Isolation::ReadCommitted).await else {
            unreachable!("in-memory begin never fails");
        };
        assert!(publisher.publish(&mut uow, &event, Utc::now()).await.is_ok());
        assert!(uow.commit().await.is_ok());

        let outbox = store.outbox().await;
        assert_eq!(outbox.len(), 1);
        assert_eq!(
            outbox[0].message.metadata,
            Some(serde_json::json!({ "actor": "ops" }))
        );
        assert_eq!(outbox[0].decode::<InventoryEvent>().ok(), Some(event));
    }
}
