use std::io;
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use medcart_events::{EventBus, EventEnvelope};

use super::{SettlementError, SettlementService};
use crate::event_store::EventStore;
use crate::workers::WorkerHandle;

impl<S, B> SettlementService<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    /// Expire every checkout whose stock has been held longer than the
    /// payment timeout as of `now`. Returns how many orders were cancelled.
    pub fn sweep(&self, now: DateTime<Utc>) -> Result<usize, SettlementError> {
        let timeout = chrono::Duration::from_std(self.config.payment_timeout)
            .map_err(|e| SettlementError::Validation(format!("payment timeout out of range: {e}")))?;
        let stale = self.ledger.stale_orders(now - timeout)?;

        let mut expired = 0;
        for order_id in stale {
            match self.expire(order_id) {
                Ok(true) => expired += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!(order_id = %order_id, error = %err, "failed to expire stale checkout");
                }
            }
        }
        Ok(expired)
    }
}

/// Background thread that periodically runs [`SettlementService::sweep`].
#[derive(Debug)]
pub struct ExpirySweeper;

impl ExpirySweeper {
    pub fn spawn<S, B>(
        service: Arc<SettlementService<S, B>>,
        interval: Duration,
    ) -> io::Result<WorkerHandle>
    where
        S: EventStore + 'static,
        B: EventBus<EventEnvelope<JsonValue>> + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let join = thread::Builder::new()
            .name("medcart-expiry-sweeper".to_string())
            .spawn(move || {
                loop {
                    match shutdown_rx.recv_timeout(interval) {
                        Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                        Err(mpsc::RecvTimeoutError::Timeout) => {}
                    }
                    match service.sweep(Utc::now()) {
                        Ok(0) => debug!("expiry sweep found nothing to release"),
                        Ok(n) => info!(expired = n, "expiry sweep released abandoned checkouts"),
                        Err(err) => warn!(error = %err, "expiry sweep failed"),
                    }
                }
            })?;

        Ok(WorkerHandle::new(shutdown_tx, join))
    }
}
