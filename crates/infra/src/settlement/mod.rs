//! Settlement service: cart to confirmed, stock-consistent order.
//!
//! ```text
//! create_order ──► pending_payment ──┬─ confirm_cod ─────────────► confirmed
//!                                    ├─ create_intent ─► verify ─► confirmed
//!                                    │                     └─────► cancelled (fail closed)
//!                                    └─ expire / cancel ─────────► cancelled
//! confirmed ─► processing ─► shipped ─► delivered   (update_status)
//! ```
//!
//! The order stream is the gate: every outcome is decided by an append to
//! the order's stream under optimistic concurrency. Stock and payment side
//! effects follow the committed order state and are idempotent, so a loser
//! of a race (or a replayed callback) reloads, sees the decided state and
//! does nothing harmful.

mod error;
mod fulfillment;
mod intake;
mod payment;
mod sweeper;
mod view;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

use medcart_catalog::MedicineCatalog;
use medcart_events::{EventBus, EventEnvelope};
use medcart_inventory::StockLedger;
use medcart_orders::{Order, OrderCommand, OrderError, OrderId};
use medcart_payments::{Payment, PaymentCommand, PaymentError, PaymentGateway, PaymentId};

use crate::command_dispatcher::{CommandDispatcher, DispatchError, Dispatched};
use crate::config::SettlementConfig;
use crate::event_store::{EventStore, StoredEvent};
use crate::projections::ORDER_AGGREGATE_TYPE;

pub use error::{ErrorKind, SettlementError};
pub use intake::NewOrder;
pub use sweeper::ExpirySweeper;
pub use view::{IntentDetails, OrderDetails, OrderView, SellerOrderDetails};

pub const PAYMENT_AGGREGATE_TYPE: &str = "payments.payment";

/// Attempts per command when the order stream moves underneath us.
const MAX_CONCURRENCY_ATTEMPTS: u32 = 3;

pub struct SettlementService<S, B> {
    dispatcher: CommandDispatcher<S, B>,
    catalog: Arc<dyn MedicineCatalog>,
    ledger: Arc<dyn StockLedger>,
    gateway: Arc<dyn PaymentGateway>,
    config: SettlementConfig,
    /// gateway order id -> order, filled as intents are recorded.
    intents: RwLock<HashMap<String, OrderId>>,
}

impl<S, B> core::fmt::Debug for SettlementService<S, B> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SettlementService")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<S, B> SettlementService<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    pub fn new(
        dispatcher: CommandDispatcher<S, B>,
        catalog: Arc<dyn MedicineCatalog>,
        ledger: Arc<dyn StockLedger>,
        gateway: Arc<dyn PaymentGateway>,
        config: SettlementConfig,
    ) -> Self {
        Self {
            dispatcher,
            catalog,
            ledger,
            gateway,
            config,
            intents: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SettlementConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<dyn StockLedger> {
        &self.ledger
    }

    pub fn dispatcher(&self) -> &CommandDispatcher<S, B> {
        &self.dispatcher
    }

    fn load_order(&self, order_id: OrderId) -> Result<Order, SettlementError> {
        let order: Order = self
            .dispatcher
            .load(order_id.0, |id| Order::empty(OrderId::new(id)))
            .map_err(SettlementError::from)?;
        if !order.is_created() {
            return Err(SettlementError::OrderNotFound);
        }
        Ok(order)
    }

    fn load_payment(&self, payment_id: PaymentId) -> Result<Payment, SettlementError> {
        let payment: Payment = self
            .dispatcher
            .load(payment_id.0, |id| Payment::empty(PaymentId::new(id)))
            .map_err(SettlementError::from)?;
        if !payment.is_created() {
            return Err(SettlementError::IntentNotFound);
        }
        Ok(payment)
    }

    /// Dispatch an order command, retrying when another writer appended first.
    fn dispatch_order(
        &self,
        order_id: OrderId,
        command: OrderCommand,
    ) -> Result<Dispatched<Order>, DispatchError<OrderError>> {
        retry_on_conflict(|| {
            self.dispatcher.dispatch(order_id.0, ORDER_AGGREGATE_TYPE, command.clone(), |id| {
                Order::empty(OrderId::new(id))
            })
        })
    }

    fn dispatch_payment(
        &self,
        payment_id: PaymentId,
        command: PaymentCommand,
    ) -> Result<Dispatched<Payment>, DispatchError<PaymentError>> {
        retry_on_conflict(|| {
            self.dispatcher.dispatch(payment_id.0, PAYMENT_AGGREGATE_TYPE, command.clone(), |id| {
                Payment::empty(PaymentId::new(id))
            })
        })
    }

    fn remember_intent(&self, gateway_order_id: &str, order_id: OrderId) {
        if let Ok(mut intents) = self.intents.write() {
            intents.insert(gateway_order_id.to_string(), order_id);
        }
    }

    fn lookup_intent(&self, gateway_order_id: &str) -> Option<OrderId> {
        self.intents.read().ok()?.get(gateway_order_id).copied()
    }

    /// Give back an order's stock. The order state is already decided, so a
    /// failure here is logged and left to the sweeper.
    fn release_stock(&self, order_id: OrderId) {
        if let Err(err) = self.ledger.release(order_id) {
            tracing::warn!(order_id = %order_id, error = %err, "stock release failed; sweeper will retry");
        }
    }
}

fn retry_on_conflict<T, E>(
    mut op: impl FnMut() -> Result<T, DispatchError<E>>,
) -> Result<T, DispatchError<E>> {
    let mut attempt = 1;
    loop {
        match op() {
            Err(DispatchError::Concurrency(msg)) if attempt < MAX_CONCURRENCY_ATTEMPTS => {
                tracing::debug!(attempt, reason = %msg, "stream moved, retrying command");
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// Decode the typed events of a committed batch.
fn committed_events<E: DeserializeOwned>(committed: &[StoredEvent]) -> Vec<E> {
    committed
        .iter()
        .filter_map(|stored| serde_json::from_value(stored.payload.clone()).ok())
        .collect()
}

#[cfg(test)]
pub(crate) mod testing;
