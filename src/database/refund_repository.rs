use crate::database::error::DatabaseError;
use crate::database::repository::RefundStore;
use crate::domain::{Refund, RefundStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{FromRow, PgConnection, PgPool};
use uuid::Uuid;

pub(crate) const REFUND_COLUMNS: &str = "id, payment_id, reconciliation_id, amount, currency, \
     reason, status, external_refund_id, failure_reason, requested_by, requested_at, \
     approved_by, approved_at, processed_at, completed_at, updated_at";

#[derive(Debug, Clone, FromRow)]
pub struct RefundRow {
    pub id: Uuid,
    pub payment_id: Uuid,
    pub reconciliation_id: Option<Uuid>,
    pub amount: Decimal,
    pub currency: String,
    pub reason: String,
    pub status: String,
    pub external_refund_id: Option<String>,
    pub failure_reason: Option<String>,
    pub requested_by: String,
    pub requested_at: DateTime<Utc>,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<RefundRow> for Refund {
    type Error = DatabaseError;

    fn try_from(row: RefundRow) -> Result<Self, Self::Error> {
        let status = RefundStatus::parse(&row.status)
            .ok_or_else(|| DatabaseError::invalid_data(format!("refund status {}", row.status)))?;
        Ok(Refund {
            id: row.id,
            payment_id: row.payment_id,
            reconciliation_id: row.reconciliation_id,
            amount: row.amount,
            currency: row.currency,
            reason: row.reason,
            status,
            external_refund_id: row.external_refund_id,
            failure_reason: row.failure_reason,
            requested_by: row.requested_by,
            requested_at: row.requested_at,
            approved_by: row.approved_by,
            approved_at: row.approved_at,
            processed_at: row.processed_at,
            completed_at: row.completed_at,
            updated_at: row.updated_at,
        })
    }
}

pub(crate) async fn refunds_for_payment(
    conn: &mut PgConnection,
    payment_id: Uuid,
) -> Result<Vec<Refund>, DatabaseError> {
    sqlx::query_as::<_, RefundRow>(&format!(
        "SELECT {} FROM refunds WHERE payment_id = $1 ORDER BY requested_at ASC",
        REFUND_COLUMNS
    ))
    .bind(payment_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(DatabaseError::from_sqlx)?
    .into_iter()
    .map(Refund::try_from)
    .collect()
}

pub(crate) async fn insert_refund(conn: &mut PgConnection, refund: &Refund) -> Result<(), DatabaseError> {
    sqlx::query(&format!(
        "INSERT INTO refunds ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, \
         $14, $15, $16)",
        REFUND_COLUMNS
    ))
    .bind(refund.id)
    .bind(refund.payment_id)
    .bind(refund.reconciliation_id)
    .bind(refund.amount)
    .bind(&refund.currency)
    .bind(&refund.reason)
    .bind(refund.status.as_str())
    .bind(&refund.external_refund_id)
    .bind(&refund.failure_reason)
    .bind(&refund.requested_by)
    .bind(refund.requested_at)
    .bind(&refund.approved_by)
    .bind(refund.approved_at)
    .bind(refund.processed_at)
    .bind(refund.completed_at)
    .bind(refund.updated_at)
    .execute(&mut *conn)
    .await
    .map_err(DatabaseError::from_sqlx)?;
    Ok(())
}

pub(crate) async fn lock_refund(conn: &mut PgConnection, id: Uuid) -> Result<Refund, DatabaseError> {
    let row = sqlx::query_as::<_, RefundRow>(&format!(
        "SELECT {} FROM refunds WHERE id = $1 FOR UPDATE",
        REFUND_COLUMNS
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(DatabaseError::from_sqlx)?
    .ok_or_else(|| DatabaseError::not_found("Refund", id))?;
    Refund::try_from(row)
}

pub(crate) async fn write_refund(
    conn: &mut PgConnection,
    refund: &Refund,
    expected: RefundStatus,
) -> Result<(), DatabaseError> {
    let result = sqlx::query(
        "UPDATE refunds
         SET status = $2, external_refund_id = $3, failure_reason = $4, approved_by = $5,
             approved_at = $6, processed_at = $7, completed_at = $8, updated_at = $9
         WHERE id = $1 AND status = $10",
    )
    .bind(refund.id)
    .bind(refund.status.as_str())
    .bind(&refund.external_refund_id)
    .bind(&refund.failure_reason)
    .bind(&refund.approved_by)
    .bind(refund.approved_at)
    .bind(refund.processed_at)
    .bind(refund.completed_at)
    .bind(refund.updated_at)
    .bind(expected.as_str())
    .execute(&mut *conn)
    .await
    .map_err(DatabaseError::from_sqlx)?;

    if result.rows_affected() == 0 {
        return Err(DatabaseError::stale("Refund", refund.id, expected, "another state"));
    }
    Ok(())
}

pub struct PgRefundStore {
    pool: PgPool,
}

impl PgRefundStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RefundStore for PgRefundStore {
    async fn find_refund(&self, id: Uuid) -> Result<Option<Refund>, DatabaseError> {
        sqlx::query_as::<_, RefundRow>(&format!(
            "SELECT {} FROM refunds WHERE id = $1",
            REFUND_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?
        .map(Refund::try_from)
        .transpose()
    }

    async fn list_for_payment(&self, payment_id: Uuid) -> Result<Vec<Refund>, DatabaseError> {
        let mut conn = self.pool.acquire().await.map_err(DatabaseError::from_sqlx)?;
        refunds_for_payment(&mut conn, payment_id).await
    }
}
