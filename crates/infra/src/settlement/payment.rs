use chrono::Utc;
use serde_json::Value as JsonValue;
use tracing::{error, info, instrument, warn};

use medcart_events::{EventBus, EventEnvelope};
use medcart_orders::{
    Actor, CancelOrder, CancellationReason, ConfirmOrder, Order, OrderCommand, OrderError, OrderId,
    OrderStatus, PaymentIntent, PaymentMethod, RecordPaymentIntent, Settlement,
};
use medcart_payments::{
    CreatePayment, GatewayOrderRequest, MarkFailed, MarkVerified, PaymentCallback, PaymentCommand,
    PaymentId, PaymentStatus, Verdict,
};

use super::{IntentDetails, OrderDetails, SettlementError, SettlementService};
use crate::command_dispatcher::DispatchError;
use crate::event_store::EventStore;
use crate::projections::ORDER_AGGREGATE_TYPE;

impl<S, B> SettlementService<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    /// Open (or return the already open) gateway payment for an online order.
    ///
    /// The amount always comes from the stored order, never from the caller.
    #[instrument(skip(self))]
    pub fn create_intent(&self, order_id: OrderId) -> Result<IntentDetails, SettlementError> {
        let order = self.load_order(order_id)?;
        ensure_awaiting_online_payment(&order)?;

        if let Some(existing) = self.open_intent(&order)? {
            return Ok(existing);
        }

        let gateway_order = self.gateway.create_order(&GatewayOrderRequest {
            receipt: order_id.to_string(),
            amount: order.total_amount(),
            currency: self.config.currency.clone(),
        })?;

        let payment_id = PaymentId::generate();
        self.dispatch_payment(
            payment_id,
            PaymentCommand::CreatePayment(CreatePayment {
                payment_id,
                order_id,
                gateway_order_id: gateway_order.gateway_order_id.clone(),
                amount: order.total_amount(),
                currency: gateway_order.currency.clone(),
                occurred_at: Utc::now(),
            }),
        )?;

        let intent = PaymentIntent {
            payment_id: payment_id.0,
            gateway_order_id: gateway_order.gateway_order_id.clone(),
            amount: order.total_amount(),
        };
        let record = OrderCommand::RecordPaymentIntent(RecordPaymentIntent {
            order_id,
            intent,
            occurred_at: Utc::now(),
        });

        // A concurrent checkout may have recorded its own intent first; that
        // one wins and ours is abandoned.
        match self.dispatcher.dispatch(order_id.0, ORDER_AGGREGATE_TYPE, record.clone(), |id| {
            Order::empty(OrderId::new(id))
        }) {
            Ok(_) => {}
            Err(DispatchError::Concurrency(_)) => {
                let current = self.load_order(order_id)?;
                let winner = match ensure_awaiting_online_payment(&current) {
                    Ok(()) => self.open_intent(&current)?,
                    Err(err) => {
                        self.fail_payment(payment_id, "order left pending_payment during checkout");
                        return Err(err);
                    }
                };
                if let Some(winner) = winner {
                    self.fail_payment(payment_id, "superseded by a concurrent checkout");
                    return Ok(winner);
                }
                self.dispatch_order(order_id, record)?;
            }
            Err(err) => return Err(err.into()),
        }

        self.remember_intent(&gateway_order.gateway_order_id, order_id);
        info!(
            order_id = %order_id,
            payment_id = %payment_id,
            gateway_order_id = %gateway_order.gateway_order_id,
            "payment intent created"
        );

        let payment = self.load_payment(payment_id)?;
        Ok(IntentDetails::from_payment(order_id, &payment, &self.config.currency))
    }

    /// Find the order a gateway order id belongs to.
    pub fn resolve_intent(&self, gateway_order_id: &str) -> Result<OrderId, SettlementError> {
        self.lookup_intent(gateway_order_id)
            .ok_or(SettlementError::IntentNotFound)
    }

    /// Settle an online payment from the client's callback.
    ///
    /// - order already cancelled: `OrderCancelled`, no changes
    /// - genuine replay for a verified payment: same success, no changes
    /// - forged replay for a verified payment: `PaymentVerificationFailed`,
    ///   no changes
    /// - forged signature or foreign gateway order: fail closed (cancel the
    ///   order, release stock, fail the payment)
    /// - gateway unreachable: `Gateway` error, no changes
    #[instrument(skip(self, callback), fields(gateway_order_id = %callback.gateway_order_id))]
    pub fn verify(
        &self,
        order_id: OrderId,
        callback: PaymentCallback,
    ) -> Result<OrderDetails, SettlementError> {
        let order = self.load_order(order_id)?;

        if order.status() == OrderStatus::Cancelled {
            warn!(
                order_id = %order_id,
                gateway_payment_id = %callback.gateway_payment_id,
                "payment callback for a cancelled order; refund may be required"
            );
            return Err(SettlementError::OrderCancelled);
        }

        if let Some(Settlement::Online {
            payment_id,
            gateway_order_id,
            gateway_payment_id,
        }) = order.settlement()
        {
            if *gateway_order_id == callback.gateway_order_id
                && *gateway_payment_id == callback.gateway_payment_id
            {
                // A replay still has to carry a genuine signature. A forged
                // one changes nothing: the order is already paid.
                if self.gateway.verify_signature(&callback)? != Verdict::Valid {
                    warn!(order_id = %order_id, "replayed payment callback with a bad signature");
                    return Err(SettlementError::PaymentVerificationFailed);
                }
                // Finish any side effect an earlier attempt did not get to.
                self.finish_settlement(order_id, PaymentId::new(*payment_id), gateway_payment_id)?;
                return Ok(OrderDetails::from(&order));
            }
        }

        if order.payment_method() != PaymentMethod::Online {
            return Err(SettlementError::PaymentMethodMismatch);
        }
        if order.status() != OrderStatus::PendingPayment {
            return Err(SettlementError::NotPendingPayment(order.status()));
        }

        let Some(intent) = order.payment_intent().cloned() else {
            warn!(order_id = %order_id, "payment callback without a recorded intent");
            self.fail_closed(order_id, None)?;
            return Err(SettlementError::PaymentVerificationFailed);
        };
        let payment_id = PaymentId::new(intent.payment_id);

        if intent.gateway_order_id != callback.gateway_order_id {
            warn!(order_id = %order_id, "callback names a different gateway order");
            self.fail_closed(order_id, Some(payment_id))?;
            return Err(SettlementError::PaymentVerificationFailed);
        }

        match self.gateway.verify_signature(&callback)? {
            Verdict::Valid => {}
            Verdict::Invalid => {
                warn!(order_id = %order_id, "payment signature rejected");
                self.fail_closed(order_id, Some(payment_id))?;
                return Err(SettlementError::PaymentVerificationFailed);
            }
        }

        let confirmed = self.dispatch_order(
            order_id,
            OrderCommand::ConfirmOrder(ConfirmOrder {
                order_id,
                settlement: Settlement::Online {
                    payment_id: intent.payment_id,
                    gateway_order_id: intent.gateway_order_id.clone(),
                    gateway_payment_id: callback.gateway_payment_id.clone(),
                },
                occurred_at: Utc::now(),
            }),
        );
        let confirmed = match confirmed {
            Ok(confirmed) => confirmed,
            Err(DispatchError::Domain(OrderError::OrderCancelled)) => {
                warn!(
                    order_id = %order_id,
                    gateway_payment_id = %callback.gateway_payment_id,
                    "order was cancelled before the payment settled; refund may be required"
                );
                return Err(SettlementError::OrderCancelled);
            }
            Err(err) => return Err(err.into()),
        };

        self.finish_settlement(order_id, payment_id, &callback.gateway_payment_id)?;
        info!(order_id = %order_id, payment_id = %payment_id, "online payment verified");
        Ok(OrderDetails::from(&confirmed.aggregate))
    }

    /// Release an abandoned checkout. Returns whether this call cancelled it.
    ///
    /// Orders that already left `pending_payment` are untouched, apart from
    /// settling any stock holds an interrupted settlement left behind.
    #[instrument(skip(self))]
    pub fn expire(&self, order_id: OrderId) -> Result<bool, SettlementError> {
        let order = match self.load_order(order_id) {
            Ok(order) => order,
            Err(SettlementError::OrderNotFound) => {
                // Holds without an order: intake died between reserve and place.
                self.ledger.release(order_id)?;
                return Ok(false);
            }
            Err(err) => return Err(err),
        };

        match order.status() {
            OrderStatus::PendingPayment => {}
            OrderStatus::Cancelled => {
                self.ledger.release(order_id)?;
                return Ok(false);
            }
            _ => {
                self.ledger.commit(order_id)?;
                return Ok(false);
            }
        }

        let cancelled = self.dispatch_order(
            order_id,
            OrderCommand::CancelOrder(CancelOrder {
                order_id,
                reason: CancellationReason::PaymentTimeout,
                actor: Actor::System,
                occurred_at: Utc::now(),
            }),
        )?;

        if cancelled.aggregate.status() != OrderStatus::Cancelled {
            // Settlement won the race.
            self.ledger.commit(order_id)?;
            return Ok(false);
        }

        self.ledger.release(order_id)?;
        if let Some(intent) = cancelled.aggregate.payment_intent() {
            self.fail_payment(PaymentId::new(intent.payment_id), "payment_timeout");
        }
        let expired = !cancelled.committed.is_empty();
        if expired {
            info!(order_id = %order_id, "abandoned checkout expired");
        }
        Ok(expired)
    }

    fn open_intent(&self, order: &Order) -> Result<Option<IntentDetails>, SettlementError> {
        let Some(intent) = order.payment_intent() else {
            return Ok(None);
        };
        let payment = self.load_payment(PaymentId::new(intent.payment_id))?;
        if payment.status() != PaymentStatus::Created {
            return Ok(None);
        }
        self.remember_intent(&intent.gateway_order_id, order.id_typed());
        Ok(Some(IntentDetails::from_payment(
            order.id_typed(),
            &payment,
            &self.config.currency,
        )))
    }

    /// Side effects that follow a committed online confirmation. Both are
    /// idempotent.
    fn finish_settlement(
        &self,
        order_id: OrderId,
        payment_id: PaymentId,
        gateway_payment_id: &str,
    ) -> Result<(), SettlementError> {
        self.dispatch_payment(
            payment_id,
            PaymentCommand::MarkVerified(MarkVerified {
                payment_id,
                gateway_payment_id: gateway_payment_id.to_string(),
                occurred_at: Utc::now(),
            }),
        )
        .map_err(|err| {
            error!(order_id = %order_id, payment_id = %payment_id, error = %err, "confirmed order but payment could not be marked verified");
            SettlementError::from(err)
        })?;
        self.ledger.commit(order_id)?;
        Ok(())
    }

    /// Integrity failure: cancel first (the gate), then undo stock and the
    /// payment. If the order is no longer awaiting payment, a genuine
    /// settlement already happened and nothing is undone.
    fn fail_closed(
        &self,
        order_id: OrderId,
        payment_id: Option<PaymentId>,
    ) -> Result<(), SettlementError> {
        let outcome = self.dispatch_order(
            order_id,
            OrderCommand::CancelOrder(CancelOrder {
                order_id,
                reason: CancellationReason::PaymentVerificationFailed,
                actor: Actor::System,
                occurred_at: Utc::now(),
            }),
        )?;
        if outcome.aggregate.status() != OrderStatus::Cancelled {
            return Ok(());
        }

        self.release_stock(order_id);
        if let Some(payment_id) = payment_id {
            self.fail_payment(payment_id, "payment_verification_failed");
        }
        Ok(())
    }

    fn fail_payment(&self, payment_id: PaymentId, reason: &str) {
        let result = self.dispatch_payment(
            payment_id,
            PaymentCommand::MarkFailed(MarkFailed {
                payment_id,
                reason: reason.to_string(),
                occurred_at: Utc::now(),
            }),
        );
        if let Err(err) = result {
            warn!(payment_id = %payment_id, error = %err, "could not mark payment failed");
        }
    }
}

fn ensure_awaiting_online_payment(order: &Order) -> Result<(), SettlementError> {
    if order.status() == OrderStatus::Cancelled {
        return Err(SettlementError::OrderCancelled);
    }
    if order.payment_method() != PaymentMethod::Online {
        return Err(SettlementError::PaymentMethodMismatch);
    }
    if order.status() != OrderStatus::PendingPayment {
        return Err(SettlementError::NotPendingPayment(order.status()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use medcart_auth::{Principal, Role};
    use medcart_catalog::MedicineId;
    use medcart_core::Amount;
    use medcart_inventory::StockLedger;
    use medcart_payments::{GatewayError, Payment};

    use crate::event_store::EventStore;

    fn online_order(h: &Harness, stock: u64, qty: i64) -> (OrderId, MedicineId) {
        let m = h.medicine(199, stock, false);
        let order = h
            .service
            .create_order(h.new_order(vec![(m, qty)], PaymentMethod::Online))
            .unwrap();
        (order.order_id, m)
    }

    fn payment(h: &Harness, id: PaymentId) -> Payment {
        h.service
            .dispatcher()
            .load(id.0, |id| Payment::empty(PaymentId::new(id)))
            .unwrap()
    }

    #[test]
    fn intent_amount_comes_from_the_stored_order() {
        let h = Harness::new();
        let (order_id, _) = online_order(&h, 5, 2);

        let intent = h.service.create_intent(order_id).unwrap();
        assert_eq!(intent.amount, Amount::new(398));
        assert_eq!(h.service.resolve_intent(&intent.gateway_order_id).unwrap(), order_id);
    }

    #[test]
    fn reentering_checkout_returns_the_open_intent() {
        let h = Harness::new();
        let (order_id, _) = online_order(&h, 5, 1);

        let first = h.service.create_intent(order_id).unwrap();
        let second = h.service.create_intent(order_id).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn cod_orders_have_no_intent() {
        let h = Harness::new();
        let m = h.medicine(50, 5, false);
        let order = h
            .service
            .create_order(h.new_order(vec![(m, 1)], PaymentMethod::Cod))
            .unwrap();

        let err = h.service.create_intent(order.order_id).unwrap_err();
        assert_eq!(err, SettlementError::PaymentMethodMismatch);
    }

    #[test]
    fn genuine_callback_confirms_and_commits() {
        let h = Harness::new();
        let (order_id, m) = online_order(&h, 3, 2);
        let intent = h.service.create_intent(order_id).unwrap();

        let order = h
            .service
            .verify(order_id, h.genuine_callback(&intent, "pay_001"))
            .unwrap();

        assert_eq!(order.status, OrderStatus::Confirmed);
        assert_eq!(payment(&h, intent.payment_id).status(), PaymentStatus::Verified);
        assert!(h.ledger.reservations(order_id).unwrap().is_empty());
        assert_eq!(h.ledger.on_hand(m).unwrap(), 1);
    }

    #[test]
    fn replayed_callback_is_a_no_op_with_the_same_result() {
        let h = Harness::new();
        let (order_id, m) = online_order(&h, 3, 1);
        let intent = h.service.create_intent(order_id).unwrap();
        let callback = h.genuine_callback(&intent, "pay_002");

        let first = h.service.verify(order_id, callback.clone()).unwrap();
        let events_after_first = h.store.load_stream(order_id.0).unwrap().len();
        let second = h.service.verify(order_id, callback).unwrap();

        assert_eq!(first, second);
        assert_eq!(h.store.load_stream(order_id.0).unwrap().len(), events_after_first);
        assert_eq!(h.ledger.on_hand(m).unwrap(), 2);
    }

    #[test]
    fn forged_signature_fails_closed() {
        let h = Harness::new();
        let (order_id, m) = online_order(&h, 4, 3);
        let intent = h.service.create_intent(order_id).unwrap();
        let mut forged = h.genuine_callback(&intent, "pay_003");
        forged.signature = "00".repeat(32);

        let err = h.service.verify(order_id, forged).unwrap_err();

        assert_eq!(err, SettlementError::PaymentVerificationFailed);
        let buyer = Principal::new(h.buyer, Role::Patient);
        let order = h.service.owned_order(order_id, &buyer).unwrap();
        assert_eq!(order.status, OrderStatus::Cancelled);
        assert_eq!(
            order.cancellation_reason,
            Some(CancellationReason::PaymentVerificationFailed)
        );
        assert_eq!(payment(&h, intent.payment_id).status(), PaymentStatus::Failed);
        assert_eq!(h.ledger.on_hand(m).unwrap(), 4);
    }

    #[test]
    fn callback_for_another_gateway_order_fails_closed() {
        let h = Harness::new();
        let (order_id, m) = online_order(&h, 2, 1);
        let intent = h.service.create_intent(order_id).unwrap();
        let (other_order, _) = online_order(&h, 2, 1);
        let other_intent = h.service.create_intent(other_order).unwrap();

        // Genuinely signed, but for somebody else's checkout.
        let err = h
            .service
            .verify(order_id, h.genuine_callback(&other_intent, "pay_004"))
            .unwrap_err();

        assert_eq!(err, SettlementError::PaymentVerificationFailed);
        assert_eq!(payment(&h, intent.payment_id).status(), PaymentStatus::Failed);
        assert_eq!(h.ledger.on_hand(m).unwrap(), 2);
    }

    #[test]
    fn gateway_outage_changes_nothing_and_can_be_retried() {
        let h = Harness::new();
        let (order_id, m) = online_order(&h, 2, 1);
        let intent = h.service.create_intent(order_id).unwrap();
        let callback = h.genuine_callback(&intent, "pay_005");

        h.gateway.set_down(true);
        let err = h.service.verify(order_id, callback.clone()).unwrap_err();
        assert!(matches!(err, SettlementError::Gateway(GatewayError::Unavailable(_))));
        assert!(err.is_retryable());
        assert_eq!(h.ledger.reservations(order_id).unwrap().len(), 1);
        assert_eq!(payment(&h, intent.payment_id).status(), PaymentStatus::Created);

        h.gateway.set_down(false);
        let order = h.service.verify(order_id, callback).unwrap();
        assert_eq!(order.status, OrderStatus::Confirmed);
        assert_eq!(h.ledger.on_hand(m).unwrap(), 1);
    }

    #[test]
    fn payment_for_a_cancelled_order_is_refused() {
        let h = Harness::new();
        let (order_id, m) = online_order(&h, 2, 1);
        let intent = h.service.create_intent(order_id).unwrap();
        assert!(h.service.expire(order_id).unwrap());

        let err = h
            .service
            .verify(order_id, h.genuine_callback(&intent, "pay_006"))
            .unwrap_err();

        assert_eq!(err, SettlementError::OrderCancelled);
        assert_eq!(h.ledger.on_hand(m).unwrap(), 2);
    }

    #[test]
    fn replay_after_a_confirmed_order_is_cancelled_is_refused() {
        let h = Harness::new();
        let (order_id, _) = online_order(&h, 2, 1);
        let intent = h.service.create_intent(order_id).unwrap();
        let callback = h.genuine_callback(&intent, "pay_007");
        h.service.verify(order_id, callback.clone()).unwrap();

        let buyer = Principal::new(h.buyer, Role::Patient);
        h.service.cancel_order(order_id, &buyer).unwrap();
        let events_after_cancel = h.store.load_stream(order_id.0).unwrap().len();

        let replay = h.service.verify(order_id, callback.clone()).unwrap_err();
        assert_eq!(replay, SettlementError::OrderCancelled);

        let mut forged = callback;
        forged.signature = "00".repeat(32);
        let forged_replay = h.service.verify(order_id, forged).unwrap_err();
        assert_eq!(forged_replay, SettlementError::OrderCancelled);

        assert_eq!(h.store.load_stream(order_id.0).unwrap().len(), events_after_cancel);
    }

    #[test]
    fn forged_replay_on_a_confirmed_order_changes_nothing() {
        let h = Harness::new();
        let (order_id, m) = online_order(&h, 3, 1);
        let intent = h.service.create_intent(order_id).unwrap();
        let callback = h.genuine_callback(&intent, "pay_008");
        h.service.verify(order_id, callback.clone()).unwrap();
        let events_after_confirm = h.store.load_stream(order_id.0).unwrap().len();

        let mut forged = callback;
        forged.signature = "00".repeat(32);
        let err = h.service.verify(order_id, forged).unwrap_err();

        assert_eq!(err, SettlementError::PaymentVerificationFailed);
        let buyer = Principal::new(h.buyer, Role::Patient);
        let order = h.service.owned_order(order_id, &buyer).unwrap();
        assert_eq!(order.status, OrderStatus::Confirmed);
        assert_eq!(payment(&h, intent.payment_id).status(), PaymentStatus::Verified);
        assert_eq!(h.store.load_stream(order_id.0).unwrap().len(), events_after_confirm);
        assert_eq!(h.ledger.on_hand(m).unwrap(), 2);
    }

    #[test]
    fn expire_is_a_no_op_once_settled() {
        let h = Harness::new();
        let (order_id, m) = online_order(&h, 2, 1);
        let intent = h.service.create_intent(order_id).unwrap();
        h.service
            .verify(order_id, h.genuine_callback(&intent, "pay_007"))
            .unwrap();

        assert!(!h.service.expire(order_id).unwrap());
        assert_eq!(h.ledger.on_hand(m).unwrap(), 1);
    }

    #[test]
    fn expire_releases_and_fails_the_open_payment() {
        let h = Harness::new();
        let (order_id, m) = online_order(&h, 2, 2);
        let intent = h.service.create_intent(order_id).unwrap();

        assert!(h.service.expire(order_id).unwrap());
        assert!(!h.service.expire(order_id).unwrap());

        assert_eq!(h.ledger.on_hand(m).unwrap(), 2);
        assert_eq!(payment(&h, intent.payment_id).status(), PaymentStatus::Failed);
    }
}
