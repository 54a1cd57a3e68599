//! Command execution pipeline for event-sourced aggregates.
//!
//! ```text
//! Command
//!   ↓
//! 1. Load the aggregate's stream
//!   ↓
//! 2. Rehydrate (apply history)
//!   ↓
//! 3. Handle (pure decision, produces events)
//!   ↓
//! 4. Append with ExpectedVersion::Exact(stream version)
//!   ↓
//! 5. Publish committed envelopes to the bus
//! ```
//!
//! The append in step 4 is the only synchronization point between
//! concurrent commands on one aggregate: if two commands race, exactly one
//! append succeeds and the other surfaces `DispatchError::Concurrency`.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use medcart_core::{Aggregate, AggregateId, ExpectedVersion};
use medcart_events::{EventBus, EventEnvelope};

use crate::event_store::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};

#[derive(Debug, Error)]
pub enum DispatchError<E> {
    /// The aggregate rejected the command (deterministic).
    #[error("{0}")]
    Domain(E),

    /// Optimistic concurrency failure: the stream moved since it was loaded.
    #[error("optimistic concurrency check failed: {0}")]
    Concurrency(String),

    /// Historical payloads did not deserialize into the aggregate's event type.
    #[error("failed to deserialize stream: {0}")]
    Deserialize(String),

    #[error("event store error: {0}")]
    Store(EventStoreError),
}

impl<E> From<EventStoreError> for DispatchError<E> {
    fn from(value: EventStoreError) -> Self {
        match value {
            EventStoreError::Concurrency(msg) => DispatchError::Concurrency(msg),
            other => DispatchError::Store(other),
        }
    }
}

/// Outcome of a successful dispatch: the aggregate after the command and the
/// events that were committed (empty for an idempotent no-op).
#[derive(Debug)]
pub struct Dispatched<A> {
    pub aggregate: A,
    pub committed: Vec<StoredEvent>,
}

/// Reusable command execution engine.
///
/// - `S`: event store implementation
/// - `B`: event bus implementation
#[derive(Debug)]
pub struct CommandDispatcher<S, B> {
    store: S,
    bus: B,
}

impl<S, B> CommandDispatcher<S, B> {
    pub fn new(store: S, bus: B) -> Self {
        Self { store, bus }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }
}

impl<S, B> CommandDispatcher<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    /// Run a command through the full pipeline.
    ///
    /// Publication happens only after a successful append. A publish failure
    /// is logged and not returned: the events are durable, and consumers
    /// tolerate redelivery.
    pub fn dispatch<A>(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        command: A::Command,
        make_aggregate: impl FnOnce(AggregateId) -> A,
    ) -> Result<Dispatched<A>, DispatchError<A::Error>>
    where
        A: Aggregate,
        A::Event: medcart_events::Event + Serialize + DeserializeOwned,
    {
        // 1) Load + 2) rehydrate
        let (mut aggregate, version) = self.rehydrate(aggregate_id, make_aggregate)?;

        // 3) Decide events (no mutation)
        let decided = aggregate.handle(&command).map_err(DispatchError::Domain)?;
        if decided.is_empty() {
            return Ok(Dispatched {
                aggregate,
                committed: vec![],
            });
        }

        // 4) Persist (append-only, optimistic)
        let uncommitted = decided
            .iter()
            .map(|ev| UncommittedEvent::from_typed(aggregate_id, aggregate_type, Uuid::now_v7(), ev))
            .collect::<Result<Vec<_>, _>>()?;

        let committed = self
            .store
            .append(uncommitted, ExpectedVersion::Exact(version))?;

        for ev in &decided {
            aggregate.apply(ev);
        }

        // 5) Publish committed events (after append)
        for stored in &committed {
            if let Err(err) = self.bus.publish(stored.to_envelope()) {
                tracing::warn!(
                    aggregate_id = %aggregate_id,
                    sequence_number = stored.sequence_number,
                    event_type = %stored.event_type,
                    error = ?err,
                    "event committed but publication failed"
                );
            }
        }

        Ok(Dispatched { aggregate, committed })
    }

    /// Load and rehydrate without handling a command.
    pub fn load<A>(
        &self,
        aggregate_id: AggregateId,
        make_aggregate: impl FnOnce(AggregateId) -> A,
    ) -> Result<A, DispatchError<A::Error>>
    where
        A: Aggregate,
        A::Event: DeserializeOwned,
    {
        self.rehydrate(aggregate_id, make_aggregate)
            .map(|(aggregate, _)| aggregate)
    }

    fn rehydrate<A>(
        &self,
        aggregate_id: AggregateId,
        make_aggregate: impl FnOnce(AggregateId) -> A,
    ) -> Result<(A, u64), DispatchError<A::Error>>
    where
        A: Aggregate,
        A::Event: DeserializeOwned,
    {
        let history = self.store.load_stream(aggregate_id)?;
        validate_loaded_stream(aggregate_id, &history)?;

        let mut aggregate = make_aggregate(aggregate_id);
        for stored in &history {
            let ev: A::Event = serde_json::from_value(stored.payload.clone())
                .map_err(|e| DispatchError::Deserialize(e.to_string()))?;
            aggregate.apply(&ev);
        }

        Ok((aggregate, stream_version(&history)))
    }
}

fn stream_version(stream: &[StoredEvent]) -> u64 {
    stream.last().map(|e| e.sequence_number).unwrap_or(0)
}

fn validate_loaded_stream<E>(
    aggregate_id: AggregateId,
    stream: &[StoredEvent],
) -> Result<(), DispatchError<E>> {
    // A buggy backend must not leak another stream's events into this one,
    // and sequence numbers must be strictly increasing from 1.
    let mut last = 0u64;
    for (idx, e) in stream.iter().enumerate() {
        if e.aggregate_id != aggregate_id {
            return Err(DispatchError::Store(EventStoreError::InvalidAppend(format!(
                "loaded stream contains wrong aggregate_id at index {idx}"
            ))));
        }
        if e.sequence_number <= last {
            return Err(DispatchError::Store(EventStoreError::InvalidAppend(format!(
                "non-monotonic sequence_number in loaded stream (last={last}, found={})",
                e.sequence_number
            ))));
        }
        last = e.sequence_number;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use medcart_core::{Amount, AggregateRoot, UserId};
    use medcart_events::InMemoryEventBus;
    use medcart_orders::{
        CancelOrder, CancellationReason, Actor, DeliveryAddress, Order, OrderCommand, OrderError,
        OrderId, OrderItem, OrderStatus, PaymentMethod, PlaceOrder,
    };
    use medcart_catalog::{MedicineId, SellerId};

    use crate::event_store::InMemoryEventStore;

    type Dispatcher = CommandDispatcher<InMemoryEventStore, InMemoryEventBus<EventEnvelope<JsonValue>>>;

    fn place(order_id: OrderId) -> OrderCommand {
        OrderCommand::PlaceOrder(PlaceOrder {
            order_id,
            buyer_id: UserId::new(),
            items: vec![OrderItem {
                medicine_id: MedicineId::generate(),
                seller_id: SellerId::new(UserId::new()),
                name: "Ibuprofen".to_string(),
                quantity: 1,
                unit_price: Amount::new(100),
                line_total: Amount::new(100),
                requires_prescription: false,
            }],
            total_amount: Amount::new(100),
            payment_method: PaymentMethod::Cod,
            delivery_address: DeliveryAddress {
                recipient: "R".to_string(),
                phone: "1234567".to_string(),
                street: "S".to_string(),
                city: "C".to_string(),
                state: None,
                postal_code: "P".to_string(),
            },
            prescription_reference: None,
            occurred_at: Utc::now(),
        })
    }

    fn dispatcher() -> Dispatcher {
        CommandDispatcher::new(InMemoryEventStore::new(), InMemoryEventBus::new())
    }

    #[test]
    fn dispatch_appends_then_publishes() {
        let d = dispatcher();
        let sub = d.bus().subscribe();
        let order_id = OrderId::generate();

        let out = d
            .dispatch(order_id.0, "orders.order", place(order_id), |id| Order::empty(OrderId::new(id)))
            .unwrap();

        assert_eq!(out.committed.len(), 1);
        assert_eq!(out.aggregate.version(), 1);
        let envelope = sub.try_recv().unwrap();
        assert_eq!(envelope.event_type(), "orders.order.placed");
        assert_eq!(envelope.sequence_number(), 1);
    }

    #[test]
    fn domain_rejection_appends_nothing() {
        let d = dispatcher();
        let order_id = OrderId::generate();
        d.dispatch(order_id.0, "orders.order", place(order_id), |id| Order::empty(OrderId::new(id)))
            .unwrap();

        let err = d
            .dispatch(order_id.0, "orders.order", place(order_id), |id| Order::empty(OrderId::new(id)))
            .unwrap_err();
        assert!(matches!(err, DispatchError::Domain(OrderError::AlreadyExists)));
        assert_eq!(d.store().load_stream(order_id.0).unwrap().len(), 1);
    }

    #[test]
    fn no_op_commands_commit_nothing() {
        let d = dispatcher();
        let order_id = OrderId::generate();
        d.dispatch(order_id.0, "orders.order", place(order_id), |id| Order::empty(OrderId::new(id)))
            .unwrap();
        let cancel = OrderCommand::CancelOrder(CancelOrder {
            order_id,
            reason: CancellationReason::PaymentTimeout,
            actor: Actor::System,
            occurred_at: Utc::now(),
        });
        d.dispatch(order_id.0, "orders.order", cancel.clone(), |id| Order::empty(OrderId::new(id)))
            .unwrap();

        let again = d
            .dispatch(order_id.0, "orders.order", cancel, |id| Order::empty(OrderId::new(id)))
            .unwrap();
        assert!(again.committed.is_empty());
        assert_eq!(again.aggregate.status(), OrderStatus::Cancelled);
    }

    #[test]
    fn load_rehydrates_current_state() {
        let d = dispatcher();
        let order_id = OrderId::generate();
        d.dispatch(order_id.0, "orders.order", place(order_id), |id| Order::empty(OrderId::new(id)))
            .unwrap();

        let order: Order = d.load(order_id.0, |id| Order::empty(OrderId::new(id))).unwrap();
        assert!(order.is_created());
        assert_eq!(order.status(), OrderStatus::PendingPayment);
    }
}
