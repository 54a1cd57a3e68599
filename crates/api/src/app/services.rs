use std::sync::{Arc, Mutex};

use anyhow::Context;
use serde_json::Value as JsonValue;
use tracing::info;

use medcart_catalog::InMemoryCatalog;
use medcart_events::{EventEnvelope, InMemoryEventBus};
use medcart_infra::{
    command_dispatcher::CommandDispatcher,
    config::AppConfig,
    event_store::InMemoryEventStore,
    jobs::RetryPolicy,
    notifications::{NotificationDispatcher, TracingNotificationSink},
    projections::{OrderSummary, OrdersProjection},
    read_model::InMemoryReadStore,
    settlement::{ExpirySweeper, SettlementService},
    workers::{ProjectionWorker, WorkerHandle},
};
use medcart_inventory::StockLedger;
use medcart_orders::OrderId;
use medcart_payments::HmacGateway;

pub type AppEventBus = Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>;
pub type AppSettlement = SettlementService<Arc<InMemoryEventStore>, AppEventBus>;
pub type AppOrdersProjection = OrdersProjection<InMemoryReadStore<OrderId, OrderSummary>>;

/// Everything the handlers need, shared behind one `Arc`.
pub struct AppServices {
    pub settlement: Arc<AppSettlement>,
    pub orders: Arc<AppOrdersProjection>,
    pub catalog: Arc<InMemoryCatalog>,
    /// Public gateway key the checkout widget needs alongside an intent.
    pub gateway_key_id: String,
    workers: Mutex<Vec<WorkerHandle>>,
    notifications: Mutex<Option<NotificationDispatcher>>,
}

impl AppServices {
    pub fn ledger(&self) -> &Arc<dyn StockLedger> {
        self.settlement.ledger()
    }

    /// Stop the background workers (projection, notifications, sweeper).
    pub fn shutdown(&self) {
        if let Ok(mut workers) = self.workers.lock() {
            for worker in workers.drain(..) {
                worker.shutdown();
            }
        }
        if let Some(dispatcher) = self.notifications.lock().ok().and_then(|mut n| n.take()) {
            dispatcher.shutdown();
        }
    }
}

impl core::fmt::Debug for AppServices {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AppServices")
            .field("settlement", &self.settlement)
            .field("gateway_key_id", &self.gateway_key_id)
            .finish_non_exhaustive()
    }
}

pub async fn build_services(config: &AppConfig) -> anyhow::Result<AppServices> {
    let ledger = build_ledger(config).await?;

    // In-memory event wiring: store + bus fan-out to the read model and notifications.
    let store = Arc::new(InMemoryEventStore::new());
    let bus: AppEventBus = Arc::new(InMemoryEventBus::new());
    let catalog = Arc::new(InMemoryCatalog::new());
    let gateway = Arc::new(HmacGateway::new(
        config.gateway.key_id.clone(),
        config.gateway.key_secret.clone(),
    ));

    let settlement = Arc::new(SettlementService::new(
        CommandDispatcher::new(store, Arc::clone(&bus)),
        catalog.clone(),
        ledger,
        gateway,
        config.settlement.clone(),
    ));

    let orders: Arc<AppOrdersProjection> = Arc::new(OrdersProjection::new(InMemoryReadStore::new()));

    // Background subscriber: bus -> orders projection
    let projection_worker = {
        let orders = Arc::clone(&orders);
        ProjectionWorker::spawn(
            "medcart-orders-projection",
            bus.as_ref(),
            move |envelope: EventEnvelope<JsonValue>| orders.apply_envelope(&envelope),
        )
        .context("failed to start orders projection worker")?
    };

    let notifications = NotificationDispatcher::spawn(
        bus.as_ref(),
        Arc::new(TracingNotificationSink),
        RetryPolicy::default(),
    )
    .context("failed to start notification dispatcher")?;

    let sweeper = ExpirySweeper::spawn(Arc::clone(&settlement), config.settlement.sweep_interval)
        .context("failed to start expiry sweeper")?;

    info!(
        currency = %config.settlement.currency,
        payment_timeout_secs = config.settlement.payment_timeout.as_secs(),
        prescription_policy = ?config.settlement.prescription_policy,
        "settlement services ready"
    );

    Ok(AppServices {
        settlement,
        orders,
        catalog,
        gateway_key_id: config.gateway.key_id.clone(),
        workers: Mutex::new(vec![projection_worker, sweeper]),
        notifications: Mutex::new(Some(notifications)),
    })
}

#[cfg(feature = "postgres")]
async fn build_ledger(config: &AppConfig) -> anyhow::Result<Arc<dyn StockLedger>> {
    use medcart_infra::stock::PostgresStockLedger;

    let Some(url) = config.server.database_url.as_deref() else {
        return Ok(Arc::new(medcart_inventory::InMemoryStockLedger::new()));
    };

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(url)
        .await
        .context("failed to connect to postgres")?;
    let ledger = PostgresStockLedger::new(pool)?;
    ledger.migrate().await?;

    info!("using postgres stock ledger");
    Ok(Arc::new(ledger))
}

#[cfg(not(feature = "postgres"))]
async fn build_ledger(config: &AppConfig) -> anyhow::Result<Arc<dyn StockLedger>> {
    if config.server.database_url.is_some() {
        tracing::warn!(
            "MEDCART_DATABASE_URL is set but the postgres feature is not enabled, falling back to in-memory stock"
        );
    }
    Ok(Arc::new(medcart_inventory::InMemoryStockLedger::new()))
}
