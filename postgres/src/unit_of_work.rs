//! Transaction-backed unit of work.

use crate::rows::{
    self, LOCATION_STOCK_COLUMNS, RESERVATION_COLUMNS, SALES_LIMIT_COLUMNS, map_sqlx_error,
};
use allotment_core::ids::{LocationId, OrderId, OrderItemId, ProductId, ReservationId, SessionId};
use allotment_core::model::{
    FrameClaim, InventoryAdjustment, LedgerAuditRow, LocationStock, Order, OrderStatus, Product,
    ReservationKind, SalesLimit, StockReservation,
};
use allotment_core::outbox::OutboxMessage;
use allotment_core::store::{StoreError, UnitOfWork};
use chrono::{DateTime, Utc};
use sqlx::{Postgres, Row, Transaction};
use uuid::Uuid;

/// A unit of work over [`PostgresAllocationStore`](crate::PostgresAllocationStore).
///
/// Dropping it without [`UnitOfWork::commit`] rolls the transaction back.
pub struct PgUnitOfWork {
    tx: Transaction<'static, Postgres>,
}

impl PgUnitOfWork {
    pub(crate) const fn new(tx: Transaction<'static, Postgres>) -> Self {
        Self { tx }
    }
}

impl std::fmt::Debug for PgUnitOfWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgUnitOfWork").finish_non_exhaustive()
    }
}

impl UnitOfWork for PgUnitOfWork {
    async fn find_product(&mut self, product_id: ProductId) -> Result<Option<Product>, StoreError> {
        let row = sqlx::query("SELECT id, name, allocation_policy FROM products WHERE id = $1")
            .bind(product_id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;

        row.as_ref().map(rows::product).transpose()
    }

    async fn lock_order(&mut self, order_id: OrderId) -> Result<Option<Order>, StoreError> {
        let Some(row) = sqlx::query("SELECT id, status, placed_at FROM orders WHERE id = $1 FOR UPDATE")
            .bind(order_id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?
        else {
            return Ok(None);
        };

        let status: String = row
            .try_get("status")
            .map_err(|e| StoreError::Database(e.to_string()))?;
        let placed_at: DateTime<Utc> = row
            .try_get("placed_at")
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let items = sqlx::query(
            r"
            SELECT id, order_id, product_id, quantity, fulfilled_quantity
            FROM order_items
            WHERE order_id = $1
            ORDER BY product_id
            ",
        )
        .bind(order_id.as_uuid())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_sqlx_error)?;

        Ok(Some(Order {
            id: order_id,
            status: OrderStatus::parse(&status)?,
            placed_at,
            items: items.iter().map(rows::order_item).collect::<Result<_, _>>()?,
        }))
    }

    async fn set_order_status(
        &mut self,
        order_id: OrderId,
        status: OrderStatus,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE orders SET status = $1 WHERE id = $2")
            .bind(status.as_str())
            .bind(order_id.as_uuid())
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn set_fulfilled_quantity(
        &mut self,
        item_id: OrderItemId,
        fulfilled_quantity: i64,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE order_items SET fulfilled_quantity = $1 WHERE id = $2")
            .bind(fulfilled_quantity)
            .bind(item_id.as_uuid())
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn orders_with_pending_frame_lines(&mut self) -> Result<Vec<OrderId>, StoreError> {
        let ids: Vec<(Uuid,)> = sqlx::query_as(
            r"
            SELECT o.id
            FROM orders o
            WHERE o.status <> 'CANCELLED'
              AND EXISTS (
                  SELECT 1
                  FROM order_items oi
                  JOIN products p ON p.id = oi.product_id
                  WHERE oi.order_id = o.id
                    AND p.allocation_policy = 'FRAME'
                    AND oi.fulfilled_quantity < oi.quantity
              )
            ORDER BY o.placed_at ASC, o.id ASC
            ",
        )
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_sqlx_error)?;

        Ok(ids.into_iter().map(|(id,)| OrderId::from_uuid(id)).collect())
    }

    async fn lock_location_stock(
        &mut self,
        product_id: ProductId,
        location_id: LocationId,
        now: DateTime<Utc>,
    ) -> Result<LocationStock, StoreError> {
        sqlx::query(
            r"
            INSERT INTO location_stocks (product_id, location_id, allocatable_qty, allocated_qty, updated_at)
            VALUES ($1, $2, 0, 0, $3)
            ON CONFLICT (product_id, location_id) DO NOTHING
            ",
        )
        .bind(product_id.as_uuid())
        .bind(location_id.get())
        .bind(now)
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx_error)?;

        let sql = format!(
            "SELECT {LOCATION_STOCK_COLUMNS} FROM location_stocks \
             WHERE product_id = $1 AND location_id = $2 FOR UPDATE"
        );
        let row = sqlx::query(&sql)
            .bind(product_id.as_uuid())
            .bind(location_id.get())
            .fetch_one(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;

        rows::location_stock(&row)
    }

    async fn lock_sales_limit(
        &mut self,
        product_id: ProductId,
        now: DateTime<Utc>,
    ) -> Result<SalesLimit, StoreError> {
        sqlx::query(
            r"
            INSERT INTO sales_limits (product_id, sales_limit_total, updated_at)
            VALUES ($1, 0, $2)
            ON CONFLICT (product_id) DO NOTHING
            ",
        )
        .bind(product_id.as_uuid())
        .bind(now)
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx_error)?;

        let sql =
            format!("SELECT {SALES_LIMIT_COLUMNS} FROM sales_limits WHERE product_id = $1 FOR UPDATE");
        let row = sqlx::query(&sql)
            .bind(product_id.as_uuid())
            .fetch_one(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;

        rows::sales_limit(&row)
    }

    async fn find_location_stock(
        &mut self,
        product_id: ProductId,
        location_id: LocationId,
    ) -> Result<Option<LocationStock>, StoreError> {
        let sql = format!(
            "SELECT {LOCATION_STOCK_COLUMNS} FROM location_stocks \
             WHERE product_id = $1 AND location_id = $2"
        );
        let row = sqlx::query(&sql)
            .bind(product_id.as_uuid())
            .bind(location_id.get())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;

        row.as_ref().map(rows::location_stock).transpose()
    }

    async fn find_sales_limit(
        &mut self,
        product_id: ProductId,
    ) -> Result<Option<SalesLimit>, StoreError> {
        let sql = format!("SELECT {SALES_LIMIT_COLUMNS} FROM sales_limits WHERE product_id = $1");
        let row = sqlx::query(&sql)
            .bind(product_id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;

        row.as_ref().map(rows::sales_limit).transpose()
    }

    async fn save_location_stock(&mut self, row: &LocationStock) -> Result<(), StoreError> {
        sqlx::query(
            r"
            UPDATE location_stocks
            SET allocatable_qty = $1, allocated_qty = $2, updated_at = $3
            WHERE product_id = $4 AND location_id = $5
            ",
        )
        .bind(row.allocatable_qty)
        .bind(row.allocated_qty)
        .bind(row.updated_at)
        .bind(row.product_id.as_uuid())
        .bind(row.location_id.get())
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn save_sales_limit(&mut self, row: &SalesLimit) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE sales_limits SET sales_limit_total = $1, updated_at = $2 WHERE product_id = $3",
        )
        .bind(row.sales_limit_total)
        .bind(row.updated_at)
        .bind(row.product_id.as_uuid())
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn frame_consumed(
        &mut self,
        product_id: ProductId,
        exclude_order: Option<OrderId>,
    ) -> Result<i64, StoreError> {
        let (consumed,): (i64,) = sqlx::query_as(
            r"
            SELECT COALESCE(SUM(oi.quantity), 0)::BIGINT
            FROM order_items oi
            JOIN orders o ON o.id = oi.order_id
            WHERE oi.product_id = $1
              AND o.status <> 'CANCELLED'
              AND ($2::UUID IS NULL OR o.id <> $2)
            ",
        )
        .bind(product_id.as_uuid())
        .bind(exclude_order.map(|id| *id.as_uuid()))
        .fetch_one(&mut *self.tx)
        .await
        .map_err(map_sqlx_error)?;

        Ok(consumed)
    }

    async fn frame_claims(&mut self, product_id: ProductId) -> Result<Vec<FrameClaim>, StoreError> {
        let claims: Vec<(Uuid, DateTime<Utc>, i64, i64)> = sqlx::query_as(
            r"
            SELECT o.id, o.placed_at, oi.quantity, oi.fulfilled_quantity
            FROM order_items oi
            JOIN orders o ON o.id = oi.order_id
            WHERE oi.product_id = $1
              AND o.status <> 'CANCELLED'
            ORDER BY o.placed_at ASC, o.id ASC
            ",
        )
        .bind(product_id.as_uuid())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_sqlx_error)?;

        Ok(claims
            .into_iter()
            .map(|(order_id, placed_at, quantity, fulfilled_quantity)| FrameClaim {
                order_id: OrderId::from_uuid(order_id),
                placed_at,
                quantity,
                fulfilled_quantity,
            })
            .collect())
    }

    async fn real_ledger_audit_rows(&mut self) -> Result<Vec<LedgerAuditRow>, StoreError> {
        let audit: Vec<(Uuid, i64, i64, i64)> = sqlx::query_as(
            r"
            SELECT ls.product_id,
                   ls.location_id,
                   ls.allocated_qty,
                   COALESCE((
                       SELECT SUM(oi.fulfilled_quantity)
                       FROM order_items oi
                       JOIN orders o ON o.id = oi.order_id
                       WHERE oi.product_id = ls.product_id
                         AND o.status <> 'CANCELLED'
                   ), 0)::BIGINT AS order_fulfilled_qty
            FROM location_stocks ls
            JOIN products p ON p.id = ls.product_id
            WHERE p.allocation_policy = 'REAL'
            ORDER BY ls.product_id, ls.location_id
            ",
        )
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_sqlx_error)?;

        Ok(audit
            .into_iter()
            .map(
                |(product_id, location_id, allocated_qty, order_fulfilled_qty)| LedgerAuditRow {
                    product_id: ProductId::from_uuid(product_id),
                    location_id: LocationId::new(location_id),
                    allocated_qty,
                    order_fulfilled_qty,
                },
            )
            .collect())
    }

    async fn active_tentative(
        &mut self,
        session_id: &SessionId,
        product_id: ProductId,
        now: DateTime<Utc>,
    ) -> Result<Option<StockReservation>, StoreError> {
        let sql = format!(
            "SELECT {RESERVATION_COLUMNS} FROM stock_reservations \
             WHERE session_id = $1 AND product_id = $2 AND kind = 'TENTATIVE' AND expires_at > $3 \
             ORDER BY created_at LIMIT 1 FOR UPDATE"
        );
        let row = sqlx::query(&sql)
            .bind(session_id.as_str())
            .bind(product_id.as_uuid())
            .bind(now)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;

        row.as_ref().map(rows::reservation).transpose()
    }

    async fn active_tentatives_for_session(
        &mut self,
        session_id: &SessionId,
        now: DateTime<Utc>,
    ) -> Result<Vec<StockReservation>, StoreError> {
        let sql = format!(
            "SELECT {RESERVATION_COLUMNS} FROM stock_reservations \
             WHERE session_id = $1 AND kind = 'TENTATIVE' AND expires_at > $2 \
             ORDER BY product_id"
        );
        let found = sqlx::query(&sql)
            .bind(session_id.as_str())
            .bind(now)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;

        found.iter().map(rows::reservation).collect()
    }

    async fn active_tentative_total(
        &mut self,
        product_id: ProductId,
        now: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let (held,): (i64,) = sqlx::query_as(
            r"
            SELECT COALESCE(SUM(quantity), 0)::BIGINT
            FROM stock_reservations
            WHERE product_id = $1 AND kind = 'TENTATIVE' AND expires_at > $2
            ",
        )
        .bind(product_id.as_uuid())
        .bind(now)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(map_sqlx_error)?;

        Ok(held)
    }

    async fn insert_reservation(&mut self, reservation: &StockReservation) -> Result<(), StoreError> {
        sqlx::query(
            r"
            INSERT INTO stock_reservations
                (id, product_id, session_id, quantity, kind, order_id, expires_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ",
        )
        .bind(reservation.id.as_uuid())
        .bind(reservation.product_id.as_uuid())
        .bind(reservation.session_id.as_str())
        .bind(reservation.quantity)
        .bind(reservation.kind.as_str())
        .bind(reservation.order_id.map(|id| *id.as_uuid()))
        .bind(reservation.expires_at)
        .bind(reservation.created_at)
        .bind(reservation.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn update_reservation(&mut self, reservation: &StockReservation) -> Result<(), StoreError> {
        let result = sqlx::query(
            r"
            UPDATE stock_reservations
            SET quantity = $1, kind = $2, order_id = $3, expires_at = $4, updated_at = $5
            WHERE id = $6
            ",
        )
        .bind(reservation.quantity)
        .bind(reservation.kind.as_str())
        .bind(reservation.order_id.map(|id| *id.as_uuid()))
        .bind(reservation.expires_at)
        .bind(reservation.updated_at)
        .bind(reservation.id.as_uuid())
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!(
                "reservation {} does not exist",
                reservation.id
            )));
        }
        Ok(())
    }

    async fn delete_reservation(&mut self, reservation_id: ReservationId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM stock_reservations WHERE id = $1")
            .bind(reservation_id.as_uuid())
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_tentatives_for_session(
        &mut self,
        session_id: &SessionId,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM stock_reservations WHERE session_id = $1 AND kind = $2")
            .bind(session_id.as_str())
            .bind(ReservationKind::Tentative.as_str())
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;
        Ok(result.rows_affected())
    }

    async fn delete_committed_for_order(&mut self, order_id: OrderId) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM stock_reservations WHERE order_id = $1 AND kind = $2")
            .bind(order_id.as_uuid())
            .bind(ReservationKind::Committed.as_str())
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;
        Ok(result.rows_affected())
    }

    async fn delete_expired_tentatives(&mut self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM stock_reservations WHERE kind = 'TENTATIVE' AND expires_at < $1",
        )
        .bind(now)
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx_error)?;
        Ok(result.rows_affected())
    }

    async fn insert_adjustment(&mut self, adjustment: &InventoryAdjustment) -> Result<(), StoreError> {
        sqlx::query(
            r"
            INSERT INTO inventory_adjustments
                (id, product_id, target, before_value, after_value, delta, reason, actor, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ",
        )
        .bind(adjustment.id.as_uuid())
        .bind(adjustment.product_id.as_uuid())
        .bind(adjustment.target.as_str())
        .bind(adjustment.before)
        .bind(adjustment.after)
        .bind(adjustment.delta)
        .bind(&adjustment.reason)
        .bind(&adjustment.actor)
        .bind(adjustment.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn append_outbox(&mut self, message: &OutboxMessage) -> Result<i64, StoreError> {
        let (sequence,): (i64,) = sqlx::query_as(
            r"
            INSERT INTO outbox (aggregate_type, aggregate_id, event_type, payload, metadata, occurred_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING sequence
            ",
        )
        .bind(&message.aggregate_type)
        .bind(&message.aggregate_id)
        .bind(&message.event_type)
        .bind(&message.payload)
        .bind(message.metadata.clone())
        .bind(message.occurred_at)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(map_sqlx_error)?;

        Ok(sequence)
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await.map_err(map_sqlx_error)
    }
}
