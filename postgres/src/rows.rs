//! Row decoding and error mapping.

use allotment_core::ids::{
    LocationId, OrderId, OrderItemId, ProductId, ReservationId, SessionId,
};
use allotment_core::model::{
    AllocationPolicy, LocationStock, OrderItem, Product, ReservationKind, SalesLimit,
    StockReservation,
};
use allotment_core::outbox::{OutboxMessage, OutboxRecord};
use allotment_core::store::StoreError;
use sqlx::Row;
use sqlx::postgres::PgRow;
use uuid::Uuid;

/// SQLSTATE raised when `lock_timeout` expires.
const LOCK_NOT_AVAILABLE: &str = "55P03";
/// SQLSTATE raised when a serializable/repeatable-read transaction conflicts.
const SERIALIZATION_FAILURE: &str = "40001";
/// SQLSTATE raised when the deadlock detector aborts a transaction.
const DEADLOCK_DETECTED: &str = "40P01";

pub(crate) fn map_sqlx_error(error: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &error {
        match db.code().as_deref() {
            Some(LOCK_NOT_AVAILABLE) => {
                tracing::warn!(error = %db.message(), "Row lock wait timed out");
                metrics::counter!("allocation.store.lock_timeouts").increment(1);
                return StoreError::LockTimeout(db.message().to_string());
            },
            Some(code @ (SERIALIZATION_FAILURE | DEADLOCK_DETECTED)) => {
                tracing::warn!(code, error = %db.message(), "Transaction aborted by conflict");
                metrics::counter!("allocation.store.conflicts", "code" => code.to_string())
                    .increment(1);
                return StoreError::SerializationConflict(db.message().to_string());
            },
            _ => {},
        }
    }
    StoreError::Database(error.to_string())
}

fn column<'r, T>(row: &'r PgRow, name: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(name)
        .map_err(|e| StoreError::Database(format!("Failed to read column {name}: {e}")))
}

pub(crate) fn product(row: &PgRow) -> Result<Product, StoreError> {
    Ok(Product {
        id: ProductId::from_uuid(column(row, "id")?),
        name: column(row, "name")?,
        policy: AllocationPolicy::parse(&column::<String>(row, "allocation_policy")?)?,
    })
}

pub(crate) fn order_item(row: &PgRow) -> Result<OrderItem, StoreError> {
    Ok(OrderItem {
        id: OrderItemId::from_uuid(column(row, "id")?),
        order_id: OrderId::from_uuid(column(row, "order_id")?),
        product_id: ProductId::from_uuid(column(row, "product_id")?),
        quantity: column(row, "quantity")?,
        fulfilled_quantity: column(row, "fulfilled_quantity")?,
    })
}

pub(crate) fn location_stock(row: &PgRow) -> Result<LocationStock, StoreError> {
    Ok(LocationStock {
        product_id: ProductId::from_uuid(column(row, "product_id")?),
        location_id: LocationId::new(column(row, "location_id")?),
        allocatable_qty: column(row, "allocatable_qty")?,
        allocated_qty: column(row, "allocated_qty")?,
        updated_at: column(row, "updated_at")?,
    })
}

pub(crate) fn sales_limit(row: &PgRow) -> Result<SalesLimit, StoreError> {
    Ok(SalesLimit {
        product_id: ProductId::from_uuid(column(row, "product_id")?),
        sales_limit_total: column(row, "sales_limit_total")?,
        updated_at: column(row, "updated_at")?,
    })
}

pub(crate) fn reservation(row: &PgRow) -> Result<StockReservation, StoreError> {
    Ok(StockReservation {
        id: ReservationId::from_uuid(column(row, "id")?),
        product_id: ProductId::from_uuid(column(row, "product_id")?),
        session_id: SessionId::new(column::<String>(row, "session_id")?),
        quantity: column(row, "quantity")?,
        kind: ReservationKind::parse(&column::<String>(row, "kind")?)?,
        order_id: column::<Option<Uuid>>(row, "order_id")?.map(OrderId::from_uuid),
        expires_at: column(row, "expires_at")?,
        created_at: column(row, "created_at")?,
        updated_at: column(row, "updated_at")?,
    })
}

pub(crate) fn outbox_record(row: &PgRow) -> Result<OutboxRecord, StoreError> {
    Ok(OutboxRecord {
        sequence: column(row, "sequence")?,
        message: OutboxMessage {
            aggregate_type: column(row, "aggregate_type")?,
            aggregate_id: column(row, "aggregate_id")?,
            event_type: column(row, "event_type")?,
            payload: column(row, "payload")?,
            metadata: column(row, "metadata")?,
            occurred_at: column(row, "occurred_at")?,
        },
    })
}

pub(crate) const RESERVATION_COLUMNS: &str =
    "id, product_id, session_id, quantity, kind, order_id, expires_at, created_at, updated_at";

pub(crate) const LOCATION_STOCK_COLUMNS: &str =
    "product_id, location_id, allocatable_qty, allocated_qty, updated_at";

pub(crate) const SALES_LIMIT_COLUMNS: &str = "product_id, sales_limit_total, updated_at";
