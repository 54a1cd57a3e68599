//! Integration tests for the full settlement pipeline.
//!
//! Tests: Command → EventStore → EventBus → Projection / Notifications
//!
//! Verifies:
//! - Racing checkouts never oversell
//! - Settlement outcomes are consistent with stock no matter who wins
//! - Read models and notifications follow the committed stream

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier, Mutex};
    use std::thread;
    use std::time::{Duration, Instant};

    use serde_json::Value as JsonValue;

    use medcart_auth::{Principal, Role};
    use medcart_catalog::SellerId;
    use medcart_core::{Amount, UserId};
    use medcart_events::EventEnvelope;
    use medcart_inventory::StockLedger;
    use medcart_orders::{CancellationReason, DeliveryStatus, OrderId, OrderStatus, PaymentMethod};

    use crate::event_store::EventStore;
    use crate::jobs::RetryPolicy;
    use crate::notifications::{
        Notification, NotificationDispatcher, NotificationError, NotificationKind, NotificationSink,
    };
    use crate::projections::{OrderSummary, OrdersProjection};
    use crate::read_model::InMemoryReadStore;
    use crate::settlement::SettlementError;
    use crate::settlement::testing::Harness;
    use crate::workers::ProjectionWorker;

    type Projection = OrdersProjection<InMemoryReadStore<OrderId, OrderSummary>>;

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    fn projection_worker(h: &Harness) -> (Arc<Projection>, crate::workers::WorkerHandle) {
        let projection = Arc::new(OrdersProjection::new(InMemoryReadStore::new()));
        let p = Arc::clone(&projection);
        let worker = ProjectionWorker::spawn(
            "orders-projection-test",
            h.bus.as_ref(),
            move |envelope: EventEnvelope<JsonValue>| p.apply_envelope(&envelope),
        )
        .unwrap();
        (projection, worker)
    }

    #[test]
    fn last_unit_goes_to_exactly_one_of_many_buyers() {
        let h = Harness::new();
        let m = h.medicine(120, 1, false);
        let buyers = 8;
        let barrier = Arc::new(Barrier::new(buyers));

        let handles: Vec<_> = (0..buyers)
            .map(|_| {
                let service = Arc::clone(&h.service);
                let barrier = Arc::clone(&barrier);
                let mut order = h.new_order(vec![(m, 1)], PaymentMethod::Online);
                order.buyer_id = UserId::new();
                thread::spawn(move || {
                    barrier.wait();
                    service.create_order(order)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|t| t.join().unwrap()).collect();
        let winners = results.iter().filter(|r| r.is_ok()).count();

        assert_eq!(winners, 1);
        for err in results.into_iter().filter_map(Result::err) {
            assert!(matches!(
                err,
                SettlementError::InsufficientStock { requested: 1, available: 0, .. }
            ));
        }
        assert_eq!(h.ledger.on_hand(m).unwrap(), 0);
    }

    #[test]
    fn racing_verify_and_expiry_leave_stock_consistent() {
        for round in 0..20 {
            let h = Harness::new();
            let m = h.medicine(75, 4, false);
            let order = h
                .service
                .create_order(h.new_order(vec![(m, 3)], PaymentMethod::Online))
                .unwrap();
            let intent = h.service.create_intent(order.order_id).unwrap();
            let callback = h.genuine_callback(&intent, &format!("pay_race_{round}"));
            let barrier = Arc::new(Barrier::new(2));

            let verifier = {
                let service = Arc::clone(&h.service);
                let barrier = Arc::clone(&barrier);
                let order_id = order.order_id;
                thread::spawn(move || {
                    barrier.wait();
                    service.verify(order_id, callback)
                })
            };
            let expirer = {
                let service = Arc::clone(&h.service);
                let barrier = Arc::clone(&barrier);
                let order_id = order.order_id;
                thread::spawn(move || {
                    barrier.wait();
                    service.expire(order_id)
                })
            };
            let verified = verifier.join().unwrap();
            let expired = expirer.join().unwrap().unwrap();

            let admin = Principal::new(UserId::new(), Role::Admin);
            let settled = h.service.owned_order(order.order_id, &admin).unwrap();
            assert!(h.ledger.reservations(order.order_id).unwrap().is_empty());
            match settled.status {
                OrderStatus::Confirmed => {
                    assert!(verified.is_ok());
                    assert!(!expired);
                    assert_eq!(h.ledger.on_hand(m).unwrap(), 1);
                }
                OrderStatus::Cancelled => {
                    assert_eq!(verified.unwrap_err(), SettlementError::OrderCancelled);
                    assert!(expired);
                    assert_eq!(
                        settled.cancellation_reason,
                        Some(CancellationReason::PaymentTimeout)
                    );
                    assert_eq!(h.ledger.on_hand(m).unwrap(), 4);
                }
                other => panic!("unexpected settled status {other}"),
            }
        }
    }

    #[test]
    fn cancelled_order_stays_cancelled() {
        let h = Harness::new();
        let m = h.medicine(300, 2, false);
        let order = h
            .service
            .create_order(h.new_order(vec![(m, 2)], PaymentMethod::Online))
            .unwrap();
        let intent = h.service.create_intent(order.order_id).unwrap();
        let buyer = Principal::new(h.buyer, Role::Patient);

        h.service.cancel_order(order.order_id, &buyer).unwrap();
        assert_eq!(h.ledger.on_hand(m).unwrap(), 2);
        let events = h.store.load_stream(order.order_id.0).unwrap().len();

        let late_payment = h
            .service
            .verify(order.order_id, h.genuine_callback(&intent, "pay_late"))
            .unwrap_err();
        let shipped = h
            .service
            .update_status(order.order_id, h.seller, OrderStatus::Shipped, None)
            .unwrap_err();
        let recancel = h.service.cancel_order(order.order_id, &buyer).unwrap_err();

        assert_eq!(late_payment, SettlementError::OrderCancelled);
        assert_eq!(shipped, SettlementError::OrderCancelled);
        assert_eq!(recancel, SettlementError::OrderCancelled);
        let stored = h.service.owned_order(order.order_id, &buyer).unwrap();
        assert_eq!(stored.cancellation_reason, Some(CancellationReason::BuyerRequest));
        assert_eq!(h.store.load_stream(order.order_id.0).unwrap().len(), events);
        assert_eq!(h.ledger.on_hand(m).unwrap(), 2);
    }

    #[test]
    fn failed_line_reserves_nothing_for_the_whole_cart() {
        let h = Harness::new();
        let plenty = h.medicine(10, 50, false);
        let scarce = h.medicine(20, 1, false);

        let err = h
            .service
            .create_order(h.new_order(vec![(plenty, 5), (scarce, 2)], PaymentMethod::Cod))
            .unwrap_err();

        assert!(matches!(err, SettlementError::InsufficientStock { requested: 2, available: 1, .. }));
        assert_eq!(h.ledger.on_hand(plenty).unwrap(), 50);
        assert_eq!(h.ledger.on_hand(scarce).unwrap(), 1);
        assert!(h.ledger.stale_orders(chrono::Utc::now() + chrono::Duration::days(1)).unwrap().is_empty());
    }

    #[test]
    fn gateway_outage_keeps_the_checkout_recoverable() {
        let h = Harness::new();
        let m = h.medicine(99, 3, false);
        let order = h
            .service
            .create_order(h.new_order(vec![(m, 1)], PaymentMethod::Online))
            .unwrap();

        h.gateway.set_down(true);
        let err = h.service.create_intent(order.order_id).unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(h.ledger.reservations(order.order_id).unwrap().len(), 1);

        h.gateway.set_down(false);
        let intent = h.service.create_intent(order.order_id).unwrap();
        let confirmed = h
            .service
            .verify(order.order_id, h.genuine_callback(&intent, "pay_after_outage"))
            .unwrap();

        assert_eq!(confirmed.status, OrderStatus::Confirmed);
        assert_eq!(h.ledger.on_hand(m).unwrap(), 2);
    }

    #[test]
    fn projection_follows_the_bus_through_settlement() {
        let h = Harness::new();
        let (projection, worker) = projection_worker(&h);
        let other_seller = SellerId::new(UserId::new());
        let mine = h.medicine(100, 5, false);
        let theirs = h.medicine_for(other_seller, 40, 5, false);

        let order = h
            .service
            .create_order(h.new_order(vec![(mine, 1), (theirs, 2)], PaymentMethod::Online))
            .unwrap();
        let intent = h.service.create_intent(order.order_id).unwrap();
        h.service
            .verify(order.order_id, h.genuine_callback(&intent, "pay_proj"))
            .unwrap();
        h.service
            .update_status(
                order.order_id,
                other_seller,
                OrderStatus::Processing,
                Some(DeliveryStatus::Pending),
            )
            .unwrap();

        assert!(wait_until(|| {
            projection
                .get(&order.order_id)
                .is_some_and(|o| o.status == OrderStatus::Processing)
        }));
        let summary = projection.get(&order.order_id).unwrap();
        assert_eq!(summary.total_amount, Amount::new(180));
        assert_eq!(summary.delivery_status, DeliveryStatus::Pending);
        assert_eq!(summary.gateway_order_id, Some(intent.gateway_order_id.clone()));
        assert_eq!(projection.list_for_buyer(h.buyer).len(), 1);

        let seller_views = projection.list_for_seller(h.seller);
        assert_eq!(seller_views.len(), 1);
        assert_eq!(seller_views[0].slice.items.len(), 1);
        assert_eq!(seller_views[0].slice.subtotal, Amount::new(100));
        assert_eq!(seller_views[0].status, OrderStatus::Processing);

        worker.shutdown();
    }

    #[test]
    fn rebuilt_projection_matches_the_live_one() {
        let h = Harness::new();
        let (live, worker) = projection_worker(&h);
        let m = h.medicine(60, 10, false);

        let mut order_ids = Vec::new();
        for method in [PaymentMethod::Cod, PaymentMethod::Online, PaymentMethod::Online] {
            let order = h.service.create_order(h.new_order(vec![(m, 1)], method)).unwrap();
            order_ids.push(order.order_id);
        }
        h.service.confirm_cod(order_ids[0]).unwrap();
        h.service.expire(order_ids[2]).unwrap();

        assert!(wait_until(|| {
            live.get(&order_ids[2])
                .is_some_and(|o| o.status == OrderStatus::Cancelled)
        }));
        worker.shutdown();

        let history: Vec<_> = order_ids
            .iter()
            .flat_map(|id| h.store.load_stream(id.0).unwrap())
            .map(|stored| stored.to_envelope())
            .collect();
        let rebuilt: Projection = OrdersProjection::new(InMemoryReadStore::new());
        rebuilt.rebuild_from_scratch(history.into_iter().rev()).unwrap();

        for id in &order_ids {
            assert_eq!(rebuilt.get(id), live.get(id));
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        delivered: Mutex<Vec<Notification>>,
    }

    impl NotificationSink for RecordingSink {
        fn send(&self, notification: &Notification) -> Result<(), NotificationError> {
            self.delivered
                .lock()
                .map_err(|_| NotificationError::Unavailable("poisoned".to_string()))?
                .push(notification.clone());
            Ok(())
        }
    }

    #[test]
    fn buyer_is_notified_of_each_committed_transition() {
        let h = Harness::new();
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = NotificationDispatcher::spawn(
            h.bus.as_ref(),
            sink.clone(),
            RetryPolicy::fixed(2, Duration::from_millis(1)),
        )
        .unwrap();
        let m = h.medicine(45, 3, false);

        let order = h
            .service
            .create_order(h.new_order(vec![(m, 1)], PaymentMethod::Cod))
            .unwrap();
        h.service.confirm_cod(order.order_id).unwrap();
        h.service
            .update_status(order.order_id, h.seller, OrderStatus::Processing, None)
            .unwrap();

        assert!(wait_until(|| sink.delivered.lock().unwrap().len() == 3));
        let kinds: Vec<_> = sink
            .delivered
            .lock()
            .unwrap()
            .iter()
            .map(|n| {
                assert_eq!(n.recipient, h.buyer);
                assert_eq!(n.order_id, order.order_id);
                n.kind
            })
            .collect();
        assert_eq!(
            kinds,
            vec![
                NotificationKind::OrderPlaced,
                NotificationKind::OrderConfirmed,
                NotificationKind::StatusChanged,
            ]
        );
        assert!(dispatcher.dead_letters().is_empty());
        dispatcher.shutdown();
    }

    #[test]
    fn sweeper_releases_abandoned_checkouts_end_to_end() {
        let h = Harness::new();
        let (projection, worker) = projection_worker(&h);
        let m = h.medicine(30, 2, false);
        let order = h
            .service
            .create_order(h.new_order(vec![(m, 2)], PaymentMethod::Online))
            .unwrap();

        let later = chrono::Utc::now() + chrono::Duration::hours(1);
        assert_eq!(h.service.sweep(later).unwrap(), 1);
        assert_eq!(h.service.sweep(later).unwrap(), 0);

        assert_eq!(h.ledger.on_hand(m).unwrap(), 2);
        assert!(wait_until(|| {
            projection.get(&order.order_id).is_some_and(|o| {
                o.cancellation_reason == Some(CancellationReason::PaymentTimeout)
            })
        }));
        worker.shutdown();
    }
}
