use crate::database::error::DatabaseError;
use crate::database::repository::{PaymentStore, UnitOfWork};
use crate::database::unit_of_work::PgUnitOfWork;
use crate::domain::{
    EvidenceAttachment, Payment, PaymentStatus, Provenance, StatusUpdate, VerificationMethod,
};
use crate::services::risk::PayerHistory;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::{FromRow, PgConnection, PgPool};
use std::str::FromStr;
use uuid::Uuid;

pub(crate) const PAYMENT_COLUMNS: &str = "id, merchant_reference, external_transaction_id, \
     invoice_id, patient_id, facility_id, provider, amount, currency, fx_rate, \
     amount_in_settlement_currency, provider_fee, platform_fee, total_fees, net_amount, status, \
     verification_method, verified_by, verified_at, verification_notes, evidence, risk_score, \
     fraud_flags, is_suspicious, initiated_at, processed_at, confirmed_at, failed_at, \
     cancelled_at, failure_reason, cancellation_reason, created_by, client_ip, user_agent, \
     device_fingerprint, metadata, created_at, updated_at";

/// Row shape of the `payments` table
#[derive(Debug, Clone, FromRow)]
pub struct PaymentRow {
    pub id: Uuid,
    pub merchant_reference: String,
    pub external_transaction_id: Option<String>,
    pub invoice_id: String,
    pub patient_id: String,
    pub facility_id: String,
    pub provider: String,
    pub amount: Decimal,
    pub currency: String,
    pub fx_rate: Decimal,
    pub amount_in_settlement_currency: Decimal,
    pub provider_fee: Decimal,
    pub platform_fee: Decimal,
    pub total_fees: Decimal,
    pub net_amount: Decimal,
    pub status: String,
    pub verification_method: Option<String>,
    pub verified_by: Option<String>,
    pub verified_at: Option<DateTime<Utc>>,
    pub verification_notes: Option<String>,
    pub evidence: serde_json::Value,
    pub risk_score: i16,
    pub fraud_flags: Vec<String>,
    pub is_suspicious: bool,
    pub initiated_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub cancellation_reason: Option<String>,
    pub created_by: String,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    pub device_fingerprint: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<PaymentRow> for Payment {
    type Error = DatabaseError;

    fn try_from(row: PaymentRow) -> Result<Self, Self::Error> {
        let status = PaymentStatus::from_str(&row.status)
            .map_err(|e| DatabaseError::invalid_data(e.to_string()))?;
        let verification_method = row
            .verification_method
            .as_deref()
            .map(VerificationMethod::from_str)
            .transpose()
            .map_err(|e| DatabaseError::invalid_data(e.to_string()))?;
        let evidence: Vec<EvidenceAttachment> = serde_json::from_value(row.evidence)
            .map_err(|e| DatabaseError::invalid_data(format!("evidence: {}", e)))?;

        Ok(Payment {
            id: row.id,
            merchant_reference: row.merchant_reference,
            external_transaction_id: row.external_transaction_id,
            invoice_id: row.invoice_id,
            patient_id: row.patient_id,
            facility_id: row.facility_id,
            provider: row.provider,
            amount: row.amount,
            currency: row.currency,
            fx_rate: row.fx_rate,
            amount_in_settlement_currency: row.amount_in_settlement_currency,
            provider_fee: row.provider_fee,
            platform_fee: row.platform_fee,
            total_fees: row.total_fees,
            net_amount: row.net_amount,
            status,
            verification_method,
            verified_by: row.verified_by,
            verified_at: row.verified_at,
            verification_notes: row.verification_notes,
            evidence,
            risk_score: row.risk_score.clamp(0, 100) as u8,
            fraud_flags: row.fraud_flags,
            is_suspicious: row.is_suspicious,
            initiated_at: row.initiated_at,
            processed_at: row.processed_at,
            confirmed_at: row.confirmed_at,
            failed_at: row.failed_at,
            cancelled_at: row.cancelled_at,
            failure_reason: row.failure_reason,
            cancellation_reason: row.cancellation_reason,
            provenance: Provenance {
                created_by: row.created_by,
                client_ip: row.client_ip,
                user_agent: row.user_agent,
                device_fingerprint: row.device_fingerprint,
            },
            metadata: row.metadata,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn into_payments(rows: Vec<PaymentRow>) -> Result<Vec<Payment>, DatabaseError> {
    rows.into_iter().map(Payment::try_from).collect()
}

/// `SELECT ... FOR UPDATE` inside an open transaction
pub(crate) async fn lock_payment(
    conn: &mut PgConnection,
    id: Uuid,
) -> Result<Payment, DatabaseError> {
    let row = sqlx::query_as::<_, PaymentRow>(&format!(
        "SELECT {} FROM payments WHERE id = $1 FOR UPDATE",
        PAYMENT_COLUMNS
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(DatabaseError::from_sqlx)?
    .ok_or_else(|| DatabaseError::not_found("Payment", id))?;
    Payment::try_from(row)
}

/// Writes the mutable columns of `payment`, guarded on the status it was read in
pub(crate) async fn write_payment(
    conn: &mut PgConnection,
    payment: &Payment,
    expected: PaymentStatus,
) -> Result<(), DatabaseError> {
    let evidence = serde_json::to_value(&payment.evidence)
        .map_err(|e| DatabaseError::invalid_data(format!("evidence: {}", e)))?;

    let result = sqlx::query(
        "UPDATE payments
         SET external_transaction_id = $2, amount = $3, amount_in_settlement_currency = $4,
             net_amount = $5, status = $6, verification_method = $7, verified_by = $8,
             verified_at = $9, verification_notes = $10, evidence = $11, processed_at = $12,
             confirmed_at = $13, failed_at = $14, cancelled_at = $15, failure_reason = $16,
             cancellation_reason = $17, updated_at = $18
         WHERE id = $1 AND status = $19",
    )
    .bind(payment.id)
    .bind(&payment.external_transaction_id)
    .bind(payment.amount)
    .bind(payment.amount_in_settlement_currency)
    .bind(payment.net_amount)
    .bind(payment.status.as_str())
    .bind(payment.verification_method.map(|m| m.as_str()))
    .bind(&payment.verified_by)
    .bind(payment.verified_at)
    .bind(&payment.verification_notes)
    .bind(evidence)
    .bind(payment.processed_at)
    .bind(payment.confirmed_at)
    .bind(payment.failed_at)
    .bind(payment.cancelled_at)
    .bind(&payment.failure_reason)
    .bind(&payment.cancellation_reason)
    .bind(payment.updated_at)
    .bind(expected.as_str())
    .execute(&mut *conn)
    .await
    .map_err(DatabaseError::from_sqlx)?;

    if result.rows_affected() == 0 {
        return Err(DatabaseError::stale("Payment", payment.id, expected, "another state"));
    }
    Ok(())
}

/// Lock, check, apply and write back one status change
pub(crate) async fn transition_in(
    conn: &mut PgConnection,
    id: Uuid,
    expected: PaymentStatus,
    target: PaymentStatus,
    update: &StatusUpdate,
    at: DateTime<Utc>,
) -> Result<Payment, DatabaseError> {
    let mut payment = lock_payment(conn, id).await?;
    if payment.status != expected {
        return Err(DatabaseError::stale("Payment", id, expected, payment.status));
    }
    payment.apply_transition(target, update, at)?;
    write_payment(conn, &payment, expected).await?;
    Ok(payment)
}

/// Postgres-backed payment store
pub struct PgPaymentStore {
    pool: PgPool,
}

impl PgPaymentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PaymentStore for PgPaymentStore {
    async fn insert_payment(&self, payment: &Payment) -> Result<(), DatabaseError> {
        let evidence = serde_json::to_value(&payment.evidence)
            .map_err(|e| DatabaseError::invalid_data(format!("evidence: {}", e)))?;

        sqlx::query(&format!(
            "INSERT INTO payments ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, \
             $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27, $28, $29, \
             $30, $31, $32, $33, $34, $35, $36, $37, $38)",
            PAYMENT_COLUMNS
        ))
        .bind(payment.id)
        .bind(&payment.merchant_reference)
        .bind(&payment.external_transaction_id)
        .bind(&payment.invoice_id)
        .bind(&payment.patient_id)
        .bind(&payment.facility_id)
        .bind(&payment.provider)
        .bind(payment.amount)
        .bind(&payment.currency)
        .bind(payment.fx_rate)
        .bind(payment.amount_in_settlement_currency)
        .bind(payment.provider_fee)
        .bind(payment.platform_fee)
        .bind(payment.total_fees)
        .bind(payment.net_amount)
        .bind(payment.status.as_str())
        .bind(payment.verification_method.map(|m| m.as_str()))
        .bind(&payment.verified_by)
        .bind(payment.verified_at)
        .bind(&payment.verification_notes)
        .bind(evidence)
        .bind(i16::from(payment.risk_score))
        .bind(&payment.fraud_flags)
        .bind(payment.is_suspicious)
        .bind(payment.initiated_at)
        .bind(payment.processed_at)
        .bind(payment.confirmed_at)
        .bind(payment.failed_at)
        .bind(payment.cancelled_at)
        .bind(&payment.failure_reason)
        .bind(&payment.cancellation_reason)
        .bind(&payment.provenance.created_by)
        .bind(&payment.provenance.client_ip)
        .bind(&payment.provenance.user_agent)
        .bind(&payment.provenance.device_fingerprint)
        .bind(&payment.metadata)
        .bind(payment.created_at)
        .bind(payment.updated_at)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(())
    }

    async fn find_payment(&self, id: Uuid) -> Result<Option<Payment>, DatabaseError> {
        sqlx::query_as::<_, PaymentRow>(&format!(
            "SELECT {} FROM payments WHERE id = $1",
            PAYMENT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?
        .map(Payment::try_from)
        .transpose()
    }

    async fn find_by_external_transaction_id(
        &self,
        external_transaction_id: &str,
    ) -> Result<Option<Payment>, DatabaseError> {
        sqlx::query_as::<_, PaymentRow>(&format!(
            "SELECT {} FROM payments WHERE external_transaction_id = $1
             ORDER BY initiated_at DESC LIMIT 1",
            PAYMENT_COLUMNS
        ))
        .bind(external_transaction_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?
        .map(Payment::try_from)
        .transpose()
    }

    async fn find_by_provider_transaction(
        &self,
        provider: &str,
        external_transaction_id: &str,
    ) -> Result<Option<Payment>, DatabaseError> {
        sqlx::query_as::<_, PaymentRow>(&format!(
            "SELECT {} FROM payments WHERE provider = $1 AND external_transaction_id = $2",
            PAYMENT_COLUMNS
        ))
        .bind(provider)
        .bind(external_transaction_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?
        .map(Payment::try_from)
        .transpose()
    }

    async fn merchant_reference_exists(&self, reference: &str) -> Result<bool, DatabaseError> {
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM payments WHERE merchant_reference = $1)",
        )
        .bind(reference)
        .fetch_one(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn transition_status(
        &self,
        id: Uuid,
        expected: PaymentStatus,
        target: PaymentStatus,
        update: &StatusUpdate,
        at: DateTime<Utc>,
    ) -> Result<Payment, DatabaseError> {
        let mut tx = self.pool.begin().await.map_err(DatabaseError::from_sqlx)?;
        let payment = match transition_in(&mut *tx, id, expected, target, update, at).await {
            Ok(payment) => payment,
            Err(err) => {
                tx.rollback().await.map_err(DatabaseError::from_sqlx)?;
                return Err(err);
            }
        };
        tx.commit().await.map_err(DatabaseError::from_sqlx)?;
        Ok(payment)
    }

    async fn record_provider_report(
        &self,
        id: Uuid,
        expected: PaymentStatus,
        report: &serde_json::Value,
        at: DateTime<Utc>,
    ) -> Result<Payment, DatabaseError> {
        let mut tx = self.pool.begin().await.map_err(DatabaseError::from_sqlx)?;
        let mut payment = lock_payment(&mut *tx, id).await?;
        if payment.status != expected {
            tx.rollback().await.map_err(DatabaseError::from_sqlx)?;
            return Err(DatabaseError::stale("Payment", id, expected, payment.status));
        }
        payment.record_provider_report(report.clone(), at);

        sqlx::query("UPDATE payments SET metadata = $2, updated_at = $3 WHERE id = $1")
            .bind(payment.id)
            .bind(&payment.metadata)
            .bind(payment.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        tx.commit().await.map_err(DatabaseError::from_sqlx)?;
        Ok(payment)
    }

    async fn payer_history(
        &self,
        patient_id: &str,
        velocity_since: DateTime<Utc>,
        failures_since: DateTime<Utc>,
    ) -> Result<PayerHistory, DatabaseError> {
        let (prior, velocity, failures) = sqlx::query_as::<_, (i64, i64, i64)>(
            "SELECT COUNT(*),
                    COUNT(*) FILTER (WHERE initiated_at >= $2),
                    COUNT(*) FILTER (WHERE status IN ('FAILED', 'REJECTED') AND failed_at >= $3)
             FROM payments WHERE patient_id = $1",
        )
        .bind(patient_id)
        .bind(velocity_since)
        .bind(failures_since)
        .fetch_one(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        Ok(PayerHistory {
            prior_payments: u32::try_from(prior).unwrap_or(u32::MAX),
            payments_in_velocity_window: u32::try_from(velocity).unwrap_or(u32::MAX),
            recent_failures: u32::try_from(failures).unwrap_or(u32::MAX),
        })
    }

    async fn provider_volume_since(
        &self,
        provider: &str,
        since: DateTime<Utc>,
    ) -> Result<Decimal, DatabaseError> {
        sqlx::query_scalar::<_, Decimal>(
            "SELECT COALESCE(SUM(amount), 0) FROM payments
             WHERE provider = $1 AND initiated_at >= $2
               AND status NOT IN ('FAILED', 'CANCELLED', 'REJECTED')",
        )
        .bind(provider)
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn find_unconfirmed_by_amount_on(
        &self,
        amount: Decimal,
        currency: &str,
        date: NaiveDate,
    ) -> Result<Vec<Payment>, DatabaseError> {
        let rows = sqlx::query_as::<_, PaymentRow>(&format!(
            "SELECT {} FROM payments
             WHERE status IN ('PENDING', 'PROCESSING', 'AWAITING_VERIFICATION')
               AND amount = $1 AND currency = $2
               AND (initiated_at AT TIME ZONE 'UTC')::date = $3
             ORDER BY initiated_at ASC",
            PAYMENT_COLUMNS
        ))
        .bind(amount)
        .bind(currency.to_uppercase())
        .bind(date)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        into_payments(rows)
    }

    async fn find_confirmed_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Payment>, DatabaseError> {
        let rows = sqlx::query_as::<_, PaymentRow>(&format!(
            "SELECT {} FROM payments
             WHERE confirmed_at BETWEEN $1 AND $2
             ORDER BY confirmed_at ASC",
            PAYMENT_COLUMNS
        ))
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        into_payments(rows)
    }

    async fn find_processing_for_providers(
        &self,
        providers: &[String],
    ) -> Result<Vec<Payment>, DatabaseError> {
        let rows = sqlx::query_as::<_, PaymentRow>(&format!(
            "SELECT {} FROM payments
             WHERE status = 'PROCESSING' AND provider = ANY($1)
             ORDER BY initiated_at ASC",
            PAYMENT_COLUMNS
        ))
        .bind(providers.to_vec())
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        into_payments(rows)
    }

    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, DatabaseError> {
        let tx = self.pool.begin().await.map_err(DatabaseError::from_sqlx)?;
        Ok(Box::new(PgUnitOfWork::new(tx)))
    }
}
