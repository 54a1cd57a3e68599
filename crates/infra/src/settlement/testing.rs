//! Shared fixtures for settlement tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value as JsonValue;

use medcart_catalog::{InMemoryCatalog, Medicine, MedicineId, SellerId};
use medcart_core::{Amount, UserId};
use medcart_events::{EventEnvelope, InMemoryEventBus};
use medcart_inventory::{InMemoryStockLedger, StockLedger};
use medcart_orders::{Cart, CartLine, DeliveryAddress, PaymentMethod};
use medcart_payments::{
    GatewayError, GatewayOrder, GatewayOrderRequest, HmacGateway, PaymentCallback, PaymentGateway,
    Verdict,
};

use super::{IntentDetails, NewOrder, SettlementService};
use crate::command_dispatcher::CommandDispatcher;
use crate::config::{PrescriptionPolicy, SettlementConfig};
use crate::event_store::InMemoryEventStore;

pub(crate) type TestBus = Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>;
pub(crate) type TestService = SettlementService<Arc<InMemoryEventStore>, TestBus>;

/// HMAC gateway whose transport can be switched off.
#[derive(Debug)]
pub(crate) struct FlakyGateway {
    pub inner: HmacGateway,
    down: AtomicBool,
}

impl FlakyGateway {
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), GatewayError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(GatewayError::Unavailable("connection reset".to_string()));
        }
        Ok(())
    }
}

impl PaymentGateway for FlakyGateway {
    fn create_order(&self, request: &GatewayOrderRequest) -> Result<GatewayOrder, GatewayError> {
        self.check()?;
        self.inner.create_order(request)
    }

    fn verify_signature(&self, callback: &PaymentCallback) -> Result<Verdict, GatewayError> {
        self.check()?;
        self.inner.verify_signature(callback)
    }
}

pub(crate) struct Harness {
    pub service: Arc<TestService>,
    pub store: Arc<InMemoryEventStore>,
    pub bus: TestBus,
    pub catalog: Arc<InMemoryCatalog>,
    pub ledger: Arc<InMemoryStockLedger>,
    pub gateway: Arc<FlakyGateway>,
    pub seller: SellerId,
    pub buyer: UserId,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(SettlementConfig::default())
    }

    pub fn with_policy(policy: PrescriptionPolicy) -> Self {
        Self::with_config(SettlementConfig {
            prescription_policy: policy,
            ..SettlementConfig::default()
        })
    }

    pub fn with_config(config: SettlementConfig) -> Self {
        let store = Arc::new(InMemoryEventStore::new());
        let bus: TestBus = Arc::new(InMemoryEventBus::new());
        let catalog = Arc::new(InMemoryCatalog::new());
        let ledger = Arc::new(InMemoryStockLedger::new());
        let gateway = Arc::new(FlakyGateway {
            inner: HmacGateway::new("rzp_test_key", "test-gateway-secret"),
            down: AtomicBool::new(false),
        });

        let service = SettlementService::new(
            CommandDispatcher::new(Arc::clone(&store), Arc::clone(&bus)),
            catalog.clone(),
            ledger.clone(),
            gateway.clone(),
            config,
        );

        Self {
            service: Arc::new(service),
            store,
            bus,
            catalog,
            ledger,
            gateway,
            seller: SellerId::new(UserId::new()),
            buyer: UserId::new(),
        }
    }

    pub fn medicine(&self, price: u64, stock: u64, requires_prescription: bool) -> MedicineId {
        self.medicine_for(self.seller, price, stock, requires_prescription)
    }

    pub fn medicine_for(
        &self,
        seller: SellerId,
        price: u64,
        stock: u64,
        requires_prescription: bool,
    ) -> MedicineId {
        let id = MedicineId::generate();
        self.catalog
            .upsert(Medicine::active(
                id,
                seller,
                "Paracetamol 500mg",
                Amount::new(price),
                requires_prescription,
            ))
            .unwrap();
        if stock > 0 {
            self.ledger.restock(id, stock).unwrap();
        }
        id
    }

    pub fn new_order(&self, lines: Vec<(MedicineId, i64)>, payment_method: PaymentMethod) -> NewOrder {
        NewOrder {
            buyer_id: self.buyer,
            cart: Cart::new(
                lines
                    .into_iter()
                    .map(|(medicine_id, quantity)| CartLine::new(medicine_id, quantity))
                    .collect(),
            ),
            delivery_address: address(),
            payment_method,
            prescription_reference: None,
        }
    }

    /// The callback a genuine gateway checkout would produce.
    pub fn genuine_callback(&self, intent: &IntentDetails, gateway_payment_id: &str) -> PaymentCallback {
        PaymentCallback {
            gateway_order_id: intent.gateway_order_id.clone(),
            gateway_payment_id: gateway_payment_id.to_string(),
            signature: self
                .gateway
                .inner
                .sign(&intent.gateway_order_id, gateway_payment_id)
                .unwrap(),
        }
    }
}

pub(crate) fn address() -> DeliveryAddress {
    DeliveryAddress {
        recipient: "Asha Rao".to_string(),
        phone: "+91 98450-12345".to_string(),
        street: "22 MG Road".to_string(),
        city: "Bengaluru".to_string(),
        state: Some("KA".to_string()),
        postal_code: "560001".to_string(),
    }
}
