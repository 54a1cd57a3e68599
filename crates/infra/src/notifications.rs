//! Buyer notifications derived from committed order events.
//!
//! Delivery is strictly out-of-band: the dispatcher runs on its own thread,
//! retries with a [`RetryPolicy`], and dead-letters what it cannot deliver.
//! Nothing here can fail or roll back the transition that caused it.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex};
use std::thread;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, warn};

use medcart_core::UserId;
use medcart_events::{EventBus, EventEnvelope};
use medcart_orders::{OrderEvent, OrderId, OrderStatus};

use crate::jobs::RetryPolicy;
use crate::projections::ORDER_AGGREGATE_TYPE;
use crate::workers::{ProjectionWorker, WorkerHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    OrderPlaced,
    OrderConfirmed,
    StatusChanged,
    OrderCancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub recipient: UserId,
    pub order_id: OrderId,
    pub kind: NotificationKind,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NotificationError {
    /// Transient: worth retrying.
    #[error("notification channel unavailable: {0}")]
    Unavailable(String),
    /// Permanent: retrying will not help.
    #[error("notification rejected: {0}")]
    Rejected(String),
}

/// One-way notification channel (email, push, SMS gateway...).
pub trait NotificationSink: Send + Sync {
    fn send(&self, notification: &Notification) -> Result<(), NotificationError>;
}

impl<S> NotificationSink for Arc<S>
where
    S: NotificationSink + ?Sized,
{
    fn send(&self, notification: &Notification) -> Result<(), NotificationError> {
        (**self).send(notification)
    }
}

/// Default sink: writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotificationSink;

impl NotificationSink for TracingNotificationSink {
    fn send(&self, n: &Notification) -> Result<(), NotificationError> {
        info!(
            recipient = %n.recipient,
            order_id = %n.order_id,
            kind = ?n.kind,
            "{}",
            n.message
        );
        Ok(())
    }
}

/// A notification that exhausted its retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeadLetter {
    pub notification: Notification,
    pub attempts: u32,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Dead letters kept for inspection before the oldest are dropped.
pub const DEAD_LETTER_CAPACITY: usize = 1024;

/// Bounded dead-letter buffer; the oldest entry is evicted when full.
#[derive(Debug)]
pub struct DeadLetterQueue {
    entries: VecDeque<DeadLetter>,
    capacity: usize,
    evicted: u64,
}

impl DeadLetterQueue {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
            evicted: 0,
        }
    }

    pub fn push(&mut self, letter: DeadLetter) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
            self.evicted += 1;
        }
        self.entries.push_back(letter);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries dropped to stay within capacity.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    pub fn snapshot(&self) -> Vec<DeadLetter> {
        self.entries.iter().cloned().collect()
    }

    pub fn drain(&mut self) -> Vec<DeadLetter> {
        self.entries.drain(..).collect()
    }
}

impl Default for DeadLetterQueue {
    fn default() -> Self {
        Self::with_capacity(DEAD_LETTER_CAPACITY)
    }
}

/// Turns order envelopes into buyer notifications.
///
/// Only `OrderPlaced` carries the buyer, so the deriver remembers each
/// order's buyer as it sees the stream.
#[derive(Debug, Default)]
pub struct NotificationDeriver {
    buyers: HashMap<OrderId, UserId>,
}

impl NotificationDeriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn derive(&mut self, envelope: &EventEnvelope<JsonValue>) -> Option<Notification> {
        if envelope.aggregate_type() != ORDER_AGGREGATE_TYPE {
            return None;
        }
        let ev: OrderEvent = match serde_json::from_value(envelope.payload().clone()) {
            Ok(ev) => ev,
            Err(err) => {
                warn!(event_type = envelope.event_type(), error = %err, "undecodable order event");
                return None;
            }
        };

        let (order_id, kind, message) = match &ev {
            OrderEvent::OrderPlaced(e) => {
                self.buyers.insert(e.order_id, e.buyer_id);
                (
                    e.order_id,
                    NotificationKind::OrderPlaced,
                    format!("Order {} placed, total {}", e.order_id, e.total_amount),
                )
            }
            OrderEvent::PaymentIntentRecorded(_) => return None,
            OrderEvent::OrderConfirmed(e) => (
                e.order_id,
                NotificationKind::OrderConfirmed,
                format!("Order {} confirmed", e.order_id),
            ),
            OrderEvent::StatusUpdated(e) => (
                e.order_id,
                NotificationKind::StatusChanged,
                if e.from == e.to {
                    format!("Order {} is {}", e.order_id, e.delivery_status)
                } else {
                    format!("Order {} is now {}", e.order_id, e.to)
                },
            ),
            OrderEvent::OrderCancelled(e) => (
                e.order_id,
                NotificationKind::OrderCancelled,
                format!("Order {} cancelled ({})", e.order_id, e.reason.as_str()),
            ),
        };

        let recipient = *self.buyers.get(&order_id)?;
        if closes_order(&ev) {
            self.buyers.remove(&order_id);
        }

        Some(Notification {
            recipient,
            order_id,
            kind,
            message,
            occurred_at: envelope.occurred_at(),
        })
    }
}

fn closes_order(ev: &OrderEvent) -> bool {
    match ev {
        OrderEvent::OrderCancelled(_) => true,
        OrderEvent::StatusUpdated(e) => e.to == OrderStatus::Delivered,
        _ => false,
    }
}

/// Deliver with retries. Returns the number of attempts made on success, or
/// the last error and attempt count on failure.
pub fn deliver(
    sink: &dyn NotificationSink,
    policy: &RetryPolicy,
    notification: &Notification,
) -> Result<u32, (NotificationError, u32)> {
    let mut retries = 0u32;
    loop {
        match sink.send(notification) {
            Ok(()) => return Ok(retries + 1),
            Err(err @ NotificationError::Rejected(_)) => return Err((err, retries + 1)),
            Err(err) => {
                if !policy.should_retry(retries) {
                    return Err((err, retries + 1));
                }
                retries += 1;
                warn!(
                    order_id = %notification.order_id,
                    attempt = retries,
                    error = %err,
                    "notification delivery failed, retrying"
                );
                thread::sleep(policy.delay_for_attempt(retries));
            }
        }
    }
}

/// Background notification dispatcher.
#[derive(Debug)]
pub struct NotificationDispatcher {
    worker: WorkerHandle,
    dead_letters: Arc<Mutex<DeadLetterQueue>>,
}

impl NotificationDispatcher {
    pub fn spawn<B>(
        bus: &B,
        sink: Arc<dyn NotificationSink>,
        policy: RetryPolicy,
    ) -> io::Result<Self>
    where
        B: EventBus<EventEnvelope<JsonValue>> + ?Sized,
    {
        let dead_letters = Arc::new(Mutex::new(DeadLetterQueue::default()));
        let dlq = Arc::clone(&dead_letters);
        let mut deriver = NotificationDeriver::new();

        let worker = ProjectionWorker::spawn(
            "medcart-notifications",
            bus,
            move |envelope: EventEnvelope<JsonValue>| {
                let Some(notification) = deriver.derive(&envelope) else {
                    return Ok(());
                };
                match deliver(sink.as_ref(), &policy, &notification) {
                    Ok(_) => Ok(()),
                    Err((err, attempts)) => {
                        warn!(
                            order_id = %notification.order_id,
                            attempts,
                            error = %err,
                            "notification dead-lettered"
                        );
                        let reason = err.to_string();
                        if let Ok(mut dlq) = dlq.lock() {
                            dlq.push(DeadLetter {
                                notification,
                                attempts,
                                reason,
                                dead_lettered_at: Utc::now(),
                            });
                        }
                        Err(err)
                    }
                }
            },
        )?;

        Ok(Self {
            worker,
            dead_letters,
        })
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters
            .lock()
            .map(|d| d.snapshot())
            .unwrap_or_default()
    }

    /// Take the dead letters for redelivery or reporting.
    pub fn drain_dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters
            .lock()
            .map(|mut d| d.drain())
            .unwrap_or_default()
    }

    pub fn shutdown(self) {
        self.worker.shutdown();
    }
}
