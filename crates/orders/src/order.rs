use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use medcart_catalog::SellerId;
use medcart_core::{Aggregate, AggregateId, AggregateRoot, Amount, DomainError, UserId};
use medcart_events::Event;

use crate::error::OrderError;
use crate::item::{DeliveryAddress, OrderItem, PaymentMethod};
use crate::split::{SellerSlice, seller_slices};
use crate::status::{DeliveryStatus, OrderStatus};

/// Order identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(pub AggregateId);

impl OrderId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }

    pub fn generate() -> Self {
        Self(AggregateId::new())
    }
}

impl core::fmt::Display for OrderId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Online payment attempt recorded against the order.
///
/// `payment_id` is the id of the payment aggregate's stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub payment_id: AggregateId,
    pub gateway_order_id: String,
    pub amount: Amount,
}

/// How an order left `pending_payment` for `confirmed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Settlement {
    CashOnDelivery,
    Online {
        payment_id: AggregateId,
        gateway_order_id: String,
        gateway_payment_id: String,
    },
}

impl Settlement {
    pub fn method(&self) -> PaymentMethod {
        match self {
            Settlement::CashOnDelivery => PaymentMethod::Cod,
            Settlement::Online { .. } => PaymentMethod::Online,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancellationReason {
    PaymentVerificationFailed,
    PaymentTimeout,
    BuyerRequest,
    SellerRequest,
    AdminRequest,
}

impl CancellationReason {
    /// Settlement outcomes only ever cancel an order that is still awaiting
    /// payment; against any other state they are no-ops.
    pub fn is_settlement_outcome(self) -> bool {
        matches!(
            self,
            CancellationReason::PaymentVerificationFailed | CancellationReason::PaymentTimeout
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CancellationReason::PaymentVerificationFailed => "payment_verification_failed",
            CancellationReason::PaymentTimeout => "payment_timeout",
            CancellationReason::BuyerRequest => "buyer_request",
            CancellationReason::SellerRequest => "seller_request",
            CancellationReason::AdminRequest => "admin_request",
        }
    }
}

/// Who asked for a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Actor {
    System,
    Buyer(UserId),
    Seller(SellerId),
    Admin(UserId),
}

/// Aggregate root: Order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    id: OrderId,
    buyer_id: Option<UserId>,
    created_at: Option<DateTime<Utc>>,
    status: OrderStatus,
    delivery_status: DeliveryStatus,
    payment_method: PaymentMethod,
    total_amount: Amount,
    delivery_address: Option<DeliveryAddress>,
    items: Vec<OrderItem>,
    prescription_reference: Option<String>,
    payment_intent: Option<PaymentIntent>,
    settlement: Option<Settlement>,
    cancellation: Option<CancellationReason>,
    version: u64,
    created: bool,
}

impl Order {
    /// Create an empty, not-yet-placed aggregate instance for rehydration.
    pub fn empty(id: OrderId) -> Self {
        Self {
            id,
            buyer_id: None,
            created_at: None,
            status: OrderStatus::PendingPayment,
            delivery_status: DeliveryStatus::Pending,
            payment_method: PaymentMethod::Online,
            total_amount: Amount::ZERO,
            delivery_address: None,
            items: Vec::new(),
            prescription_reference: None,
            payment_intent: None,
            settlement: None,
            cancellation: None,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> OrderId {
        self.id
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    pub fn buyer_id(&self) -> Option<UserId> {
        self.buyer_id
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    pub fn status(&self) -> OrderStatus {
        self.status
    }

    pub fn delivery_status(&self) -> DeliveryStatus {
        self.delivery_status
    }

    pub fn payment_method(&self) -> PaymentMethod {
        self.payment_method
    }

    pub fn total_amount(&self) -> Amount {
        self.total_amount
    }

    pub fn delivery_address(&self) -> Option<&DeliveryAddress> {
        self.delivery_address.as_ref()
    }

    pub fn items(&self) -> &[OrderItem] {
        &self.items
    }

    pub fn prescription_reference(&self) -> Option<&str> {
        self.prescription_reference.as_deref()
    }

    pub fn payment_intent(&self) -> Option<&PaymentIntent> {
        self.payment_intent.as_ref()
    }

    pub fn settlement(&self) -> Option<&Settlement> {
        self.settlement.as_ref()
    }

    pub fn cancellation_reason(&self) -> Option<CancellationReason> {
        self.cancellation
    }

    pub fn is_owned_by(&self, user: UserId) -> bool {
        self.buyer_id == Some(user)
    }

    /// Whether `seller` has at least one line in this order.
    pub fn has_seller(&self, seller: SellerId) -> bool {
        self.items.iter().any(|i| i.seller_id == seller)
    }

    pub fn requires_prescription(&self) -> bool {
        self.items.iter().any(|i| i.requires_prescription)
    }

    pub fn seller_slices(&self) -> Result<Vec<SellerSlice>, DomainError> {
        seller_slices(&self.items)
    }

    pub fn slice_for(&self, seller: SellerId) -> Result<Option<SellerSlice>, DomainError> {
        Ok(self
            .seller_slices()?
            .into_iter()
            .find(|s| s.seller_id == seller))
    }
}

impl AggregateRoot for Order {
    type Id = OrderId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: PlaceOrder.
///
/// Items arrive already priced; the aggregate re-checks the arithmetic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceOrder {
    pub order_id: OrderId,
    pub buyer_id: UserId,
    pub items: Vec<OrderItem>,
    pub total_amount: Amount,
    pub payment_method: PaymentMethod,
    pub delivery_address: DeliveryAddress,
    pub prescription_reference: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RecordPaymentIntent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordPaymentIntent {
    pub order_id: OrderId,
    pub intent: PaymentIntent,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ConfirmOrder (settlement only).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmOrder {
    pub order_id: OrderId,
    pub settlement: Settlement,
    pub occurred_at: DateTime<Utc>,
}

/// Command: UpdateStatus (seller-driven fulfillment).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateStatus {
    pub order_id: OrderId,
    pub seller_id: SellerId,
    pub status: OrderStatus,
    pub delivery_status: Option<DeliveryStatus>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CancelOrder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelOrder {
    pub order_id: OrderId,
    pub reason: CancellationReason,
    pub actor: Actor,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderCommand {
    PlaceOrder(PlaceOrder),
    RecordPaymentIntent(RecordPaymentIntent),
    ConfirmOrder(ConfirmOrder),
    UpdateStatus(UpdateStatus),
    CancelOrder(CancelOrder),
}

/// Event: OrderPlaced. Carries the order and all of its items, so both are
/// persisted by a single append.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderPlaced {
    pub order_id: OrderId,
    pub buyer_id: UserId,
    pub items: Vec<OrderItem>,
    pub total_amount: Amount,
    pub payment_method: PaymentMethod,
    pub delivery_address: DeliveryAddress,
    pub prescription_reference: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: PaymentIntentRecorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentIntentRecorded {
    pub order_id: OrderId,
    pub intent: PaymentIntent,
    pub occurred_at: DateTime<Utc>,
}

/// Event: OrderConfirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderConfirmed {
    pub order_id: OrderId,
    pub settlement: Settlement,
    pub occurred_at: DateTime<Utc>,
}

/// Event: StatusUpdated. `from == to` records a delivery-only advance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdated {
    pub order_id: OrderId,
    pub seller_id: SellerId,
    pub from: OrderStatus,
    pub to: OrderStatus,
    pub delivery_status: DeliveryStatus,
    pub occurred_at: DateTime<Utc>,
}

/// Event: OrderCancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCancelled {
    pub order_id: OrderId,
    pub reason: CancellationReason,
    pub actor: Actor,
    pub previous_status: OrderStatus,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderEvent {
    OrderPlaced(OrderPlaced),
    PaymentIntentRecorded(PaymentIntentRecorded),
    OrderConfirmed(OrderConfirmed),
    StatusUpdated(StatusUpdated),
    OrderCancelled(OrderCancelled),
}

impl Event for OrderEvent {
    fn event_type(&self) -> &'static str {
        match self {
            OrderEvent::OrderPlaced(_) => "orders.order.placed",
            OrderEvent::PaymentIntentRecorded(_) => "orders.order.payment_intent_recorded",
            OrderEvent::OrderConfirmed(_) => "orders.order.confirmed",
            OrderEvent::StatusUpdated(_) => "orders.order.status_updated",
            OrderEvent::OrderCancelled(_) => "orders.order.cancelled",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            OrderEvent::OrderPlaced(e) => e.occurred_at,
            OrderEvent::PaymentIntentRecorded(e) => e.occurred_at,
            OrderEvent::OrderConfirmed(e) => e.occurred_at,
            OrderEvent::StatusUpdated(e) => e.occurred_at,
            OrderEvent::OrderCancelled(e) => e.occurred_at,
        }
    }
}

impl Aggregate for Order {
    type Command = OrderCommand;
    type Event = OrderEvent;
    type Error = OrderError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            OrderEvent::OrderPlaced(e) => {
                self.id = e.order_id;
                self.buyer_id = Some(e.buyer_id);
                self.created_at = Some(e.occurred_at);
                self.status = OrderStatus::PendingPayment;
                self.delivery_status = DeliveryStatus::Pending;
                self.payment_method = e.payment_method;
                self.total_amount = e.total_amount;
                self.delivery_address = Some(e.delivery_address.clone());
                self.items = e.items.clone();
                self.prescription_reference = e.prescription_reference.clone();
                self.created = true;
            }
            OrderEvent::PaymentIntentRecorded(e) => {
                self.payment_intent = Some(e.intent.clone());
            }
            OrderEvent::OrderConfirmed(e) => {
                self.status = OrderStatus::Confirmed;
                self.delivery_status = OrderStatus::Confirmed.delivery_status();
                self.settlement = Some(e.settlement.clone());
            }
            OrderEvent::StatusUpdated(e) => {
                self.status = e.to;
                self.delivery_status = e.delivery_status;
            }
            OrderEvent::OrderCancelled(e) => {
                self.status = OrderStatus::Cancelled;
                self.delivery_status = DeliveryStatus::Cancelled;
                self.cancellation = Some(e.reason);
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            OrderCommand::PlaceOrder(cmd) => self.handle_place(cmd),
            OrderCommand::RecordPaymentIntent(cmd) => self.handle_record_intent(cmd),
            OrderCommand::ConfirmOrder(cmd) => self.handle_confirm(cmd),
            OrderCommand::UpdateStatus(cmd) => self.handle_update_status(cmd),
            OrderCommand::CancelOrder(cmd) => self.handle_cancel(cmd),
        }
    }
}

impl Order {
    fn ensure_placed(&self, order_id: OrderId) -> Result<(), OrderError> {
        if !self.created {
            return Err(OrderError::NotFound);
        }
        if self.id != order_id {
            return Err(DomainError::invariant("order_id mismatch").into());
        }
        Ok(())
    }

    fn ensure_not_cancelled(&self) -> Result<(), OrderError> {
        if self.status == OrderStatus::Cancelled {
            return Err(OrderError::OrderCancelled);
        }
        Ok(())
    }

    fn handle_place(&self, cmd: &PlaceOrder) -> Result<Vec<OrderEvent>, OrderError> {
        if self.created {
            return Err(OrderError::AlreadyExists);
        }
        if cmd.items.is_empty() {
            return Err(OrderError::EmptyCart);
        }
        cmd.delivery_address.validate()?;

        let mut total = Amount::ZERO;
        for item in &cmd.items {
            if item.quantity == 0 {
                return Err(DomainError::validation("quantity must be positive").into());
            }
            if item.unit_price.checked_mul(item.quantity)? != item.line_total {
                return Err(DomainError::invariant("line_total must equal unit_price * quantity").into());
            }
            total = total.checked_add(item.line_total)?;
        }
        if total != cmd.total_amount {
            return Err(DomainError::invariant("total_amount must equal the sum of line totals").into());
        }

        Ok(vec![OrderEvent::OrderPlaced(OrderPlaced {
            order_id: cmd.order_id,
            buyer_id: cmd.buyer_id,
            items: cmd.items.clone(),
            total_amount: cmd.total_amount,
            payment_method: cmd.payment_method,
            delivery_address: cmd.delivery_address.clone(),
            prescription_reference: cmd.prescription_reference.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_record_intent(
        &self,
        cmd: &RecordPaymentIntent,
    ) -> Result<Vec<OrderEvent>, OrderError> {
        self.ensure_placed(cmd.order_id)?;
        self.ensure_not_cancelled()?;

        if self.payment_method != PaymentMethod::Online {
            return Err(OrderError::PaymentMethodMismatch);
        }
        if self.status != OrderStatus::PendingPayment {
            return Err(OrderError::NotPendingPayment(self.status));
        }
        if cmd.intent.amount != self.total_amount {
            return Err(DomainError::invariant("payment intent amount must equal the order total").into());
        }
        if self.payment_intent.as_ref() == Some(&cmd.intent) {
            return Ok(vec![]);
        }

        Ok(vec![OrderEvent::PaymentIntentRecorded(PaymentIntentRecorded {
            order_id: cmd.order_id,
            intent: cmd.intent.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_confirm(&self, cmd: &ConfirmOrder) -> Result<Vec<OrderEvent>, OrderError> {
        self.ensure_placed(cmd.order_id)?;
        self.ensure_not_cancelled()?;

        if let Some(existing) = &self.settlement {
            // A replayed settlement is a no-op; a different one is a conflict.
            if existing == &cmd.settlement {
                return Ok(vec![]);
            }
            return Err(OrderError::NotPendingPayment(self.status));
        }
        if self.status != OrderStatus::PendingPayment {
            return Err(OrderError::NotPendingPayment(self.status));
        }
        if cmd.settlement.method() != self.payment_method {
            return Err(OrderError::PaymentMethodMismatch);
        }

        if let Settlement::Online {
            payment_id,
            gateway_order_id,
            ..
        } = &cmd.settlement
        {
            match &self.payment_intent {
                Some(intent)
                    if intent.payment_id == *payment_id
                        && intent.gateway_order_id == *gateway_order_id => {}
                _ => return Err(OrderError::PaymentIntentMismatch),
            }
        }

        Ok(vec![OrderEvent::OrderConfirmed(OrderConfirmed {
            order_id: cmd.order_id,
            settlement: cmd.settlement.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_update_status(&self, cmd: &UpdateStatus) -> Result<Vec<OrderEvent>, OrderError> {
        self.ensure_placed(cmd.order_id)?;

        // Order matters: cancelled, then participation, then the edge.
        self.ensure_not_cancelled()?;
        if !self.has_seller(cmd.seller_id) {
            return Err(OrderError::Unauthorized);
        }

        let invalid = OrderError::InvalidTransition {
            from: self.status,
            to: cmd.status,
        };

        if cmd.status == OrderStatus::Confirmed {
            return Err(invalid);
        }

        if cmd.status == OrderStatus::Cancelled {
            if !self.status.can_transition_to(OrderStatus::Cancelled) {
                return Err(invalid);
            }
            return Ok(vec![OrderEvent::OrderCancelled(OrderCancelled {
                order_id: cmd.order_id,
                reason: CancellationReason::SellerRequest,
                actor: Actor::Seller(cmd.seller_id),
                previous_status: self.status,
                occurred_at: cmd.occurred_at,
            })]);
        }

        if cmd.status == self.status {
            return self.handle_delivery_advance(cmd, invalid);
        }

        if !self.status.can_transition_to(cmd.status) {
            return Err(invalid);
        }

        let delivery_status = self.resolve_delivery(cmd.status, cmd.delivery_status)?;

        Ok(vec![OrderEvent::StatusUpdated(StatusUpdated {
            order_id: cmd.order_id,
            seller_id: cmd.seller_id,
            from: self.status,
            to: cmd.status,
            delivery_status,
            occurred_at: cmd.occurred_at,
        })])
    }

    /// Same status requested again: only `shipped` with a later delivery
    /// status (`in_transit`) is meaningful.
    fn handle_delivery_advance(
        &self,
        cmd: &UpdateStatus,
        invalid: OrderError,
    ) -> Result<Vec<OrderEvent>, OrderError> {
        let Some(requested) = cmd.delivery_status else {
            return Err(invalid);
        };
        if self.status != OrderStatus::Shipped {
            return Err(invalid);
        }

        let delivery_status = self.resolve_delivery(cmd.status, Some(requested))?;
        if delivery_status == self.delivery_status {
            return Ok(vec![]);
        }

        Ok(vec![OrderEvent::StatusUpdated(StatusUpdated {
            order_id: cmd.order_id,
            seller_id: cmd.seller_id,
            from: self.status,
            to: self.status,
            delivery_status,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn resolve_delivery(
        &self,
        status: OrderStatus,
        requested: Option<DeliveryStatus>,
    ) -> Result<DeliveryStatus, OrderError> {
        let delivery_status = requested.unwrap_or_else(|| status.delivery_status());
        if !delivery_status.agrees_with(status) || !self.delivery_status.can_advance_to(delivery_status)
        {
            return Err(OrderError::InvalidDeliveryStatus {
                status,
                delivery_status,
            });
        }
        Ok(delivery_status)
    }

    fn handle_cancel(&self, cmd: &CancelOrder) -> Result<Vec<OrderEvent>, OrderError> {
        self.ensure_placed(cmd.order_id)?;

        if cmd.reason.is_settlement_outcome() {
            if self.status != OrderStatus::PendingPayment {
                return Ok(vec![]);
            }
        } else {
            self.ensure_not_cancelled()?;
            let allowed = match cmd.actor {
                Actor::System | Actor::Admin(_) => true,
                Actor::Buyer(user) => self.is_owned_by(user),
                Actor::Seller(seller) => self.has_seller(seller),
            };
            if !allowed {
                return Err(OrderError::Unauthorized);
            }
            if !self.status.can_transition_to(OrderStatus::Cancelled) {
                return Err(OrderError::InvalidTransition {
                    from: self.status,
                    to: OrderStatus::Cancelled,
                });
            }
        }

        Ok(vec![OrderEvent::OrderCancelled(OrderCancelled {
            order_id: cmd.order_id,
            reason: cmd.reason,
            actor: cmd.actor,
            previous_status: self.status,
            occurred_at: cmd.occurred_at,
        })])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medcart_catalog::MedicineId;
    use medcart_events::execute;
    use proptest::prelude::*;

    fn address() -> DeliveryAddress {
        DeliveryAddress {
            recipient: "Asha Rao".to_string(),
            phone: "9845012345".to_string(),
            street: "12 MG Road".to_string(),
            city: "Bengaluru".to_string(),
            state: None,
            postal_code: "560001".to_string(),
        }
    }

    fn item(seller: SellerId, qty: u64, price: u64) -> OrderItem {
        OrderItem {
            medicine_id: MedicineId::generate(),
            seller_id: seller,
            name: "Cetirizine".to_string(),
            quantity: qty,
            unit_price: Amount::new(price),
            line_total: Amount::new(qty * price),
            requires_prescription: false,
        }
    }

    struct Fixture {
        order: Order,
        buyer: UserId,
        seller: SellerId,
    }

    fn placed(method: PaymentMethod) -> Fixture {
        let order_id = OrderId::generate();
        let buyer = UserId::new();
        let seller = SellerId::new(UserId::new());
        let items = vec![item(seller, 2, 250)];
        let mut order = Order::empty(order_id);

        execute(
            &mut order,
            &OrderCommand::PlaceOrder(PlaceOrder {
                order_id,
                buyer_id: buyer,
                items,
                total_amount: Amount::new(500),
                payment_method: method,
                delivery_address: address(),
                prescription_reference: None,
                occurred_at: Utc::now(),
            }),
        )
        .unwrap();

        Fixture { order, buyer, seller }
    }

    fn confirm_cod(order: &mut Order) {
        execute(
            order,
            &OrderCommand::ConfirmOrder(ConfirmOrder {
                order_id: order.id_typed(),
                settlement: Settlement::CashOnDelivery,
                occurred_at: Utc::now(),
            }),
        )
        .unwrap();
    }

    fn update(order: &Order, seller: SellerId, status: OrderStatus) -> OrderCommand {
        OrderCommand::UpdateStatus(UpdateStatus {
            order_id: order.id_typed(),
            seller_id: seller,
            status,
            delivery_status: None,
            occurred_at: Utc::now(),
        })
    }

    fn cancel(order: &Order, reason: CancellationReason, actor: Actor) -> OrderCommand {
        OrderCommand::CancelOrder(CancelOrder {
            order_id: order.id_typed(),
            reason,
            actor,
            occurred_at: Utc::now(),
        })
    }

    #[test]
    fn place_order_starts_in_pending_payment() {
        let f = placed(PaymentMethod::Online);
        assert_eq!(f.order.status(), OrderStatus::PendingPayment);
        assert_eq!(f.order.delivery_status(), DeliveryStatus::Pending);
        assert_eq!(f.order.total_amount(), Amount::new(500));
        assert_eq!(f.order.version(), 1);
        assert!(f.order.is_owned_by(f.buyer));
    }

    #[test]
    fn place_order_rejects_a_total_that_does_not_add_up() {
        let order_id = OrderId::generate();
        let order = Order::empty(order_id);
        let seller = SellerId::new(UserId::new());

        let err = order
            .handle(&OrderCommand::PlaceOrder(PlaceOrder {
                order_id,
                buyer_id: UserId::new(),
                items: vec![item(seller, 1, 100)],
                total_amount: Amount::new(99),
                payment_method: PaymentMethod::Cod,
                delivery_address: address(),
                prescription_reference: None,
                occurred_at: Utc::now(),
            }))
            .unwrap_err();
        assert!(matches!(err, OrderError::Domain(DomainError::InvariantViolation(_))));
    }

    #[test]
    fn placing_twice_is_rejected() {
        let f = placed(PaymentMethod::Cod);
        let err = f
            .order
            .handle(&OrderCommand::PlaceOrder(PlaceOrder {
                order_id: f.order.id_typed(),
                buyer_id: f.buyer,
                items: f.order.items().to_vec(),
                total_amount: f.order.total_amount(),
                payment_method: PaymentMethod::Cod,
                delivery_address: address(),
                prescription_reference: None,
                occurred_at: Utc::now(),
            }))
            .unwrap_err();
        assert_eq!(err, OrderError::AlreadyExists);
    }

    #[test]
    fn cod_confirmation_is_idempotent() {
        let mut f = placed(PaymentMethod::Cod);
        confirm_cod(&mut f.order);
        assert_eq!(f.order.status(), OrderStatus::Confirmed);

        let again = f
            .order
            .handle(&OrderCommand::ConfirmOrder(ConfirmOrder {
                order_id: f.order.id_typed(),
                settlement: Settlement::CashOnDelivery,
                occurred_at: Utc::now(),
            }))
            .unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn online_confirmation_requires_the_recorded_intent() {
        let mut f = placed(PaymentMethod::Online);
        let payment_id = AggregateId::new();
        let order_id = f.order.id_typed();
        execute(
            &mut f.order,
            &OrderCommand::RecordPaymentIntent(RecordPaymentIntent {
                order_id,
                intent: PaymentIntent {
                    payment_id,
                    gateway_order_id: "gw_order_1".to_string(),
                    amount: Amount::new(500),
                },
                occurred_at: Utc::now(),
            }),
        )
        .unwrap();

        let wrong = OrderCommand::ConfirmOrder(ConfirmOrder {
            order_id: f.order.id_typed(),
            settlement: Settlement::Online {
                payment_id,
                gateway_order_id: "gw_order_forged".to_string(),
                gateway_payment_id: "pay_1".to_string(),
            },
            occurred_at: Utc::now(),
        });
        assert_eq!(f.order.handle(&wrong).unwrap_err(), OrderError::PaymentIntentMismatch);

        let right = ConfirmOrder {
            order_id: f.order.id_typed(),
            settlement: Settlement::Online {
                payment_id,
                gateway_order_id: "gw_order_1".to_string(),
                gateway_payment_id: "pay_1".to_string(),
            },
            occurred_at: Utc::now(),
        };
        execute(&mut f.order, &OrderCommand::ConfirmOrder(right.clone())).unwrap();
        assert_eq!(f.order.status(), OrderStatus::Confirmed);

        // Replayed callback: no events.
        let replay = f.order.handle(&OrderCommand::ConfirmOrder(right)).unwrap();
        assert!(replay.is_empty());
    }

    #[test]
    fn intent_amount_must_match_the_stored_total() {
        let f = placed(PaymentMethod::Online);
        let err = f
            .order
            .handle(&OrderCommand::RecordPaymentIntent(RecordPaymentIntent {
                order_id: f.order.id_typed(),
                intent: PaymentIntent {
                    payment_id: AggregateId::new(),
                    gateway_order_id: "gw".to_string(),
                    amount: Amount::new(1),
                },
                occurred_at: Utc::now(),
            }))
            .unwrap_err();
        assert!(matches!(err, OrderError::Domain(DomainError::InvariantViolation(_))));
    }

    #[test]
    fn cod_order_cannot_take_a_payment_intent() {
        let f = placed(PaymentMethod::Cod);
        let err = f
            .order
            .handle(&OrderCommand::RecordPaymentIntent(RecordPaymentIntent {
                order_id: f.order.id_typed(),
                intent: PaymentIntent {
                    payment_id: AggregateId::new(),
                    gateway_order_id: "gw".to_string(),
                    amount: Amount::new(500),
                },
                occurred_at: Utc::now(),
            }))
            .unwrap_err();
        assert_eq!(err, OrderError::PaymentMethodMismatch);
    }

    #[test]
    fn full_fulfillment_lifecycle() {
        let mut f = placed(PaymentMethod::Cod);
        confirm_cod(&mut f.order);

        for status in [OrderStatus::Processing, OrderStatus::Shipped] {
            let cmd = update(&f.order, f.seller, status);
            execute(&mut f.order, &cmd).unwrap();
        }
        assert_eq!(f.order.delivery_status(), DeliveryStatus::Shipped);

        let in_transit = OrderCommand::UpdateStatus(UpdateStatus {
            order_id: f.order.id_typed(),
            seller_id: f.seller,
            status: OrderStatus::Shipped,
            delivery_status: Some(DeliveryStatus::InTransit),
            occurred_at: Utc::now(),
        });
        execute(&mut f.order, &in_transit).unwrap();
        assert_eq!(f.order.status(), OrderStatus::Shipped);
        assert_eq!(f.order.delivery_status(), DeliveryStatus::InTransit);

        let cmd = update(&f.order, f.seller, OrderStatus::Delivered);
        execute(&mut f.order, &cmd).unwrap();
        assert_eq!(f.order.status(), OrderStatus::Delivered);
        assert_eq!(f.order.delivery_status(), DeliveryStatus::Delivered);
    }

    #[test]
    fn shipped_to_processing_is_an_invalid_transition() {
        let mut f = placed(PaymentMethod::Cod);
        confirm_cod(&mut f.order);
        for status in [OrderStatus::Processing, OrderStatus::Shipped] {
            let cmd = update(&f.order, f.seller, status);
            execute(&mut f.order, &cmd).unwrap();
        }

        let err = f
            .order
            .handle(&update(&f.order, f.seller, OrderStatus::Processing))
            .unwrap_err();
        assert_eq!(
            err,
            OrderError::InvalidTransition {
                from: OrderStatus::Shipped,
                to: OrderStatus::Processing
            }
        );
    }

    #[test]
    fn sellers_cannot_confirm_orders() {
        let f = placed(PaymentMethod::Cod);
        let err = f
            .order
            .handle(&update(&f.order, f.seller, OrderStatus::Confirmed))
            .unwrap_err();
        assert!(matches!(err, OrderError::InvalidTransition { .. }));
    }

    #[test]
    fn non_participating_seller_is_unauthorized() {
        let mut f = placed(PaymentMethod::Cod);
        confirm_cod(&mut f.order);
        let stranger = SellerId::new(UserId::new());

        let err = f
            .order
            .handle(&update(&f.order, stranger, OrderStatus::Processing))
            .unwrap_err();
        assert_eq!(err, OrderError::Unauthorized);
    }

    #[test]
    fn cancelled_is_reported_before_authorization() {
        let mut f = placed(PaymentMethod::Cod);
        let cmd = cancel(&f.order, CancellationReason::BuyerRequest, Actor::Buyer(f.buyer));
        execute(&mut f.order, &cmd).unwrap();

        let stranger = SellerId::new(UserId::new());
        let err = f
            .order
            .handle(&update(&f.order, stranger, OrderStatus::Processing))
            .unwrap_err();
        assert_eq!(err, OrderError::OrderCancelled);
    }

    #[test]
    fn cancelled_orders_reject_every_mutation() {
        let mut f = placed(PaymentMethod::Online);
        let cmd = cancel(&f.order, CancellationReason::PaymentTimeout, Actor::System);
        execute(&mut f.order, &cmd).unwrap();
        let snapshot = f.order.clone();

        assert_eq!(
            f.order.handle(&update(&f.order, f.seller, OrderStatus::Processing)),
            Err(OrderError::OrderCancelled)
        );
        assert_eq!(
            f.order.handle(&OrderCommand::ConfirmOrder(ConfirmOrder {
                order_id: f.order.id_typed(),
                settlement: Settlement::CashOnDelivery,
                occurred_at: Utc::now(),
            })),
            Err(OrderError::OrderCancelled)
        );
        assert_eq!(
            f.order.handle(&cancel(&f.order, CancellationReason::AdminRequest, Actor::Admin(UserId::new()))),
            Err(OrderError::OrderCancelled)
        );
        assert_eq!(f.order, snapshot);
    }

    #[test]
    fn timeout_after_confirmation_is_a_no_op() {
        let mut f = placed(PaymentMethod::Cod);
        confirm_cod(&mut f.order);

        let events = f
            .order
            .handle(&cancel(&f.order, CancellationReason::PaymentTimeout, Actor::System))
            .unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn only_the_owner_may_cancel_as_buyer() {
        let f = placed(PaymentMethod::Cod);
        let err = f
            .order
            .handle(&cancel(&f.order, CancellationReason::BuyerRequest, Actor::Buyer(UserId::new())))
            .unwrap_err();
        assert_eq!(err, OrderError::Unauthorized);
    }

    #[test]
    fn seller_cancel_records_previous_status() {
        let f = placed(PaymentMethod::Online);
        let events = f
            .order
            .handle(&update(&f.order, f.seller, OrderStatus::Cancelled))
            .unwrap();
        match &events[0] {
            OrderEvent::OrderCancelled(e) => {
                assert_eq!(e.previous_status, OrderStatus::PendingPayment);
                assert_eq!(e.reason, CancellationReason::SellerRequest);
            }
            other => panic!("expected OrderCancelled, got {other:?}"),
        }
    }

    #[test]
    fn mismatched_delivery_status_is_rejected() {
        let mut f = placed(PaymentMethod::Cod);
        confirm_cod(&mut f.order);
        let err = f
            .order
            .handle(&OrderCommand::UpdateStatus(UpdateStatus {
                order_id: f.order.id_typed(),
                seller_id: f.seller,
                status: OrderStatus::Processing,
                delivery_status: Some(DeliveryStatus::Delivered),
                occurred_at: Utc::now(),
            }))
            .unwrap_err();
        assert!(matches!(err, OrderError::InvalidDeliveryStatus { .. }));
    }

    #[test]
    fn placed_event_serializes_with_items() {
        let f = placed(PaymentMethod::Cod);
        let event = OrderEvent::OrderPlaced(OrderPlaced {
            order_id: f.order.id_typed(),
            buyer_id: f.buyer,
            items: f.order.items().to_vec(),
            total_amount: f.order.total_amount(),
            payment_method: PaymentMethod::Cod,
            delivery_address: address(),
            prescription_reference: None,
            occurred_at: Utc::now(),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["OrderPlaced"]["payment_method"], "cod");
        assert_eq!(json["OrderPlaced"]["items"].as_array().unwrap().len(), 1);
    }

    fn any_status() -> impl Strategy<Value = OrderStatus> {
        prop_oneof![
            Just(OrderStatus::PendingPayment),
            Just(OrderStatus::Confirmed),
            Just(OrderStatus::Processing),
            Just(OrderStatus::Shipped),
            Just(OrderStatus::Delivered),
            Just(OrderStatus::Cancelled),
        ]
    }

    fn rank(status: OrderStatus) -> u8 {
        match status {
            OrderStatus::PendingPayment => 0,
            OrderStatus::Confirmed => 1,
            OrderStatus::Processing => 2,
            OrderStatus::Shipped => 3,
            OrderStatus::Delivered => 4,
            OrderStatus::Cancelled => 5,
        }
    }

    proptest! {
        #[test]
        fn fulfillment_only_moves_forward(requests in proptest::collection::vec(any_status(), 0..24)) {
            let mut f = placed(PaymentMethod::Cod);
            confirm_cod(&mut f.order);

            for requested in requests {
                let before = f.order.clone();
                let cmd = update(&f.order, f.seller, requested);
                match execute(&mut f.order, &cmd) {
                    Ok(_) => {
                        prop_assert!(!before.status().is_terminal());
                        prop_assert!(rank(f.order.status()) >= rank(before.status()));
                    }
                    Err(_) => prop_assert_eq!(&f.order, &before),
                }
            }
        }
    }
}
