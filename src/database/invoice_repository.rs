//! Read/write view onto the billing service's `invoices` table.

use crate::database::error::DatabaseError;
use crate::database::repository::InvoiceLedger;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

const OPEN: &str = "OPEN";

pub struct PgInvoiceLedger {
    pool: PgPool,
}

impl PgInvoiceLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InvoiceLedger for PgInvoiceLedger {
    async fn is_open_for_payment(&self, invoice_id: &str) -> Result<bool, DatabaseError> {
        let status = sqlx::query_scalar::<_, String>("SELECT status FROM invoices WHERE id = $1")
            .bind(invoice_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        Ok(status.as_deref() == Some(OPEN))
    }
}

/// Returns `false` when the invoice exists but is no longer open
pub(crate) async fn mark_invoice_paid(
    conn: &mut PgConnection,
    invoice_id: &str,
    payment_id: Uuid,
    at: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    let result = sqlx::query(
        "UPDATE invoices
         SET status = 'PAID', paid_by_payment_id = $2, paid_at = $3
         WHERE id = $1 AND status = 'OPEN'",
    )
    .bind(invoice_id)
    .bind(payment_id)
    .bind(at)
    .execute(&mut *conn)
    .await
    .map_err(DatabaseError::from_sqlx)?;

    if result.rows_affected() > 0 {
        return Ok(true);
    }

    let exists = sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM invoices WHERE id = $1)")
        .bind(invoice_id)
        .fetch_one(&mut *conn)
        .await
        .map_err(DatabaseError::from_sqlx)?;
    if !exists {
        return Err(DatabaseError::not_found("Invoice", invoice_id));
    }
    Ok(false)
}
