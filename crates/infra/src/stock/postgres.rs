//! Postgres-backed stock ledger.
//!
//! Every `reserve` is one transaction: a guarded decrement
//! (`UPDATE ... WHERE stock_quantity >= $qty`) plus the hold row. Postgres
//! row locks serialize racing reservations on the same medicine and nothing
//! else, so disjoint orders never contend.
//!
//! ## Error Mapping
//!
//! | SQLx Error | Code | StockError |
//! |------------|------|------------|
//! | Database (check violation) | `23514` | `InsufficientStock` is detected before this; reported as `Storage` |
//! | Database (foreign key violation) | `23503` | `UnknownMedicine` is detected before this; reported as `Storage` |
//! | anything else | | `Storage` |
//!
//! The ledger trait is synchronous. Calls bridge into the async pool with
//! `block_in_place` on a multi-threaded tokio runtime.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use medcart_catalog::MedicineId;
use medcart_core::AggregateId;
use medcart_inventory::{Reservation, StockError, StockLedger};
use medcart_orders::OrderId;

const SCHEMA: &str = include_str!("../../migrations/0001_stock_ledger.sql");

#[derive(Debug, Clone)]
pub struct PostgresStockLedger {
    pool: PgPool,
    runtime: tokio::runtime::Handle,
}

impl PostgresStockLedger {
    /// Must be called from within a tokio runtime.
    pub fn new(pool: PgPool) -> Result<Self, StockError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            StockError::Storage("PostgresStockLedger requires a tokio runtime".to_string())
        })?;
        Ok(Self { pool, runtime })
    }

    /// Create the ledger tables if they do not exist.
    pub async fn migrate(&self) -> Result<(), StockError> {
        for statement in SCHEMA.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            let statement = statement
                .lines()
                .filter(|l| !l.trim_start().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");
            if statement.trim().is_empty() {
                continue;
            }
            sqlx::query(&statement)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("migrate", e))?;
        }
        Ok(())
    }

    fn run<F, T>(&self, fut: F) -> Result<T, StockError>
    where
        F: std::future::Future<Output = Result<T, StockError>>,
    {
        tokio::task::block_in_place(|| self.runtime.block_on(fut))
    }

    #[instrument(skip(self), fields(medicine_id = %medicine_id, order_id = %order_id), err)]
    async fn reserve_async(
        &self,
        medicine_id: MedicineId,
        quantity: u64,
        order_id: OrderId,
    ) -> Result<Reservation, StockError> {
        if quantity == 0 {
            return Err(StockError::ZeroQuantity);
        }
        let qty = to_db_quantity(quantity)?;
        let mut tx = self.pool.begin().await.map_err(|e| map_sqlx_error("begin", e))?;

        let decremented = sqlx::query(
            r#"
            UPDATE stock_levels
            SET stock_quantity = stock_quantity - $2, updated_at = now()
            WHERE medicine_id = $1 AND stock_quantity >= $2
            RETURNING stock_quantity
            "#,
        )
        .bind(medicine_id.0.as_uuid())
        .bind(qty)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("reserve", e))?;

        if decremented.is_none() {
            let available = current_quantity(&mut tx, medicine_id).await?;
            tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(match available {
                Some(available) => StockError::InsufficientStock {
                    medicine_id,
                    requested: quantity,
                    available,
                },
                None => StockError::UnknownMedicine(medicine_id),
            });
        }

        let reserved_at = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO stock_reservations (order_id, medicine_id, quantity, reserved_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (order_id, medicine_id)
            DO UPDATE SET quantity = stock_reservations.quantity + EXCLUDED.quantity
            "#,
        )
        .bind(order_id.0.as_uuid())
        .bind(medicine_id.0.as_uuid())
        .bind(qty)
        .bind(reserved_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("reserve", e))?;

        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;

        Ok(Reservation {
            medicine_id,
            order_id,
            quantity,
            reserved_at,
        })
    }

    async fn settle_async(&self, order_id: OrderId, give_back: bool) -> Result<(), StockError> {
        let mut tx = self.pool.begin().await.map_err(|e| map_sqlx_error("begin", e))?;

        let rows = sqlx::query(
            r#"
            DELETE FROM stock_reservations
            WHERE order_id = $1
            RETURNING medicine_id, quantity
            "#,
        )
        .bind(order_id.0.as_uuid())
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("settle", e))?;

        if give_back {
            for row in rows {
                let medicine_id: uuid::Uuid = row.try_get("medicine_id").map_err(|e| map_sqlx_error("settle", e))?;
                let quantity: i64 = row.try_get("quantity").map_err(|e| map_sqlx_error("settle", e))?;
                sqlx::query(
                    r#"
                    UPDATE stock_levels
                    SET stock_quantity = stock_quantity + $2, updated_at = now()
                    WHERE medicine_id = $1
                    "#,
                )
                .bind(medicine_id)
                .bind(quantity)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("release", e))?;
            }
        }

        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))
    }

    async fn on_hand_async(&self, medicine_id: MedicineId) -> Result<u64, StockError> {
        let mut tx = self.pool.begin().await.map_err(|e| map_sqlx_error("begin", e))?;
        let quantity = current_quantity(&mut tx, medicine_id).await?;
        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        quantity.ok_or(StockError::UnknownMedicine(medicine_id))
    }

    async fn restock_async(&self, medicine_id: MedicineId, quantity: u64) -> Result<u64, StockError> {
        let qty = to_db_quantity(quantity)?;
        let row = sqlx::query(
            r#"
            INSERT INTO stock_levels (medicine_id, stock_quantity)
            VALUES ($1, $2)
            ON CONFLICT (medicine_id)
            DO UPDATE SET stock_quantity = stock_levels.stock_quantity + EXCLUDED.stock_quantity,
                          updated_at = now()
            RETURNING stock_quantity
            "#,
        )
        .bind(medicine_id.0.as_uuid())
        .bind(qty)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("restock", e))?;

        let on_hand: i64 = row.try_get("stock_quantity").map_err(|e| map_sqlx_error("restock", e))?;
        from_db_quantity(on_hand)
    }

    async fn reservations_async(&self, order_id: OrderId) -> Result<Vec<Reservation>, StockError> {
        let rows = sqlx::query(
            r#"
            SELECT medicine_id, quantity, reserved_at
            FROM stock_reservations
            WHERE order_id = $1
            ORDER BY medicine_id ASC
            "#,
        )
        .bind(order_id.0.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("reservations", e))?;

        rows.into_iter()
            .map(|row| {
                let medicine_id: uuid::Uuid = row.try_get("medicine_id").map_err(|e| map_sqlx_error("reservations", e))?;
                let quantity: i64 = row.try_get("quantity").map_err(|e| map_sqlx_error("reservations", e))?;
                let reserved_at: DateTime<Utc> = row.try_get("reserved_at").map_err(|e| map_sqlx_error("reservations", e))?;
                Ok(Reservation {
                    medicine_id: MedicineId::new(AggregateId::from_uuid(medicine_id)),
                    order_id,
                    quantity: from_db_quantity(quantity)?,
                    reserved_at,
                })
            })
            .collect()
    }

    async fn stale_orders_async(&self, reserved_before: DateTime<Utc>) -> Result<Vec<OrderId>, StockError> {
        let rows = sqlx::query(
            r#"
            SELECT order_id
            FROM stock_reservations
            GROUP BY order_id
            HAVING MIN(reserved_at) < $1
            ORDER BY order_id ASC
            "#,
        )
        .bind(reserved_before)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("stale_orders", e))?;

        rows.into_iter()
            .map(|row| {
                let order_id: uuid::Uuid = row.try_get("order_id").map_err(|e| map_sqlx_error("stale_orders", e))?;
                Ok(OrderId::new(AggregateId::from_uuid(order_id)))
            })
            .collect()
    }
}

impl StockLedger for PostgresStockLedger {
    fn reserve(
        &self,
        medicine_id: MedicineId,
        quantity: u64,
        order_id: OrderId,
    ) -> Result<Reservation, StockError> {
        self.run(self.reserve_async(medicine_id, quantity, order_id))
    }

    fn commit(&self, order_id: OrderId) -> Result<(), StockError> {
        self.run(self.settle_async(order_id, false))
    }

    fn release(&self, order_id: OrderId) -> Result<(), StockError> {
        self.run(self.settle_async(order_id, true))
    }

    fn on_hand(&self, medicine_id: MedicineId) -> Result<u64, StockError> {
        self.run(self.on_hand_async(medicine_id))
    }

    fn restock(&self, medicine_id: MedicineId, quantity: u64) -> Result<u64, StockError> {
        self.run(self.restock_async(medicine_id, quantity))
    }

    fn reservations(&self, order_id: OrderId) -> Result<Vec<Reservation>, StockError> {
        self.run(self.reservations_async(order_id))
    }

    fn stale_orders(&self, reserved_before: DateTime<Utc>) -> Result<Vec<OrderId>, StockError> {
        self.run(self.stale_orders_async(reserved_before))
    }
}

async fn current_quantity(
    tx: &mut Transaction<'_, Postgres>,
    medicine_id: MedicineId,
) -> Result<Option<u64>, StockError> {
    let row = sqlx::query("SELECT stock_quantity FROM stock_levels WHERE medicine_id = $1")
        .bind(medicine_id.0.as_uuid())
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("on_hand", e))?;

    match row {
        Some(row) => {
            let quantity: i64 = row.try_get("stock_quantity").map_err(|e| map_sqlx_error("on_hand", e))?;
            from_db_quantity(quantity).map(Some)
        }
        None => Ok(None),
    }
}

fn to_db_quantity(quantity: u64) -> Result<i64, StockError> {
    i64::try_from(quantity).map_err(|_| StockError::Storage(format!("quantity {quantity} out of range")))
}

fn from_db_quantity(quantity: i64) -> Result<u64, StockError> {
    u64::try_from(quantity).map_err(|_| StockError::Storage(format!("negative quantity {quantity} in storage")))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StockError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.to_string()).unwrap_or_default();
            StockError::Storage(format!(
                "database error in {operation} (code {code}): {}",
                db_err.message()
            ))
        }
        sqlx::Error::PoolClosed => StockError::Storage(format!("connection pool closed in {operation}")),
        other => StockError::Storage(format!("{operation}: {other}")),
    }
}
