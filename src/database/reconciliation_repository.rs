use crate::database::error::DatabaseError;
use crate::database::repository::ReconciliationStore;
use crate::domain::{
    AuditAnnotation, DiscrepancyType, ReconciliationRecord, ReconciliationStatus,
    ResolutionAction,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{FromRow, PgConnection, PgPool};
use uuid::Uuid;

pub(crate) const RECORD_COLUMNS: &str = "id, batch_id, payment_id, external_transaction_id, \
     external_amount, external_currency, external_fee, transaction_date, source_document, \
     recorded_amount, amount_difference, fee_difference, status, discrepancy_type, \
     resolution_action, resolved_by, resolution_notes, resolved_at, annotations, created_at, \
     updated_at";

#[derive(Debug, Clone, FromRow)]
pub struct ReconciliationRow {
    pub id: Uuid,
    pub batch_id: Uuid,
    pub payment_id: Option<Uuid>,
    pub external_transaction_id: Option<String>,
    pub external_amount: Option<Decimal>,
    pub external_currency: Option<String>,
    pub external_fee: Option<Decimal>,
    pub transaction_date: DateTime<Utc>,
    pub source_document: Option<String>,
    pub recorded_amount: Option<Decimal>,
    pub amount_difference: Option<Decimal>,
    pub fee_difference: Option<Decimal>,
    pub status: String,
    pub discrepancy_type: Option<String>,
    pub resolution_action: Option<String>,
    pub resolved_by: Option<String>,
    pub resolution_notes: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub annotations: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<ReconciliationRow> for ReconciliationRecord {
    type Error = DatabaseError;

    fn try_from(row: ReconciliationRow) -> Result<Self, Self::Error> {
        let status = ReconciliationStatus::parse(&row.status).ok_or_else(|| {
            DatabaseError::invalid_data(format!("reconciliation status {}", row.status))
        })?;
        let discrepancy_type = match row.discrepancy_type.as_deref() {
            Some(raw) => Some(DiscrepancyType::parse(raw).ok_or_else(|| {
                DatabaseError::invalid_data(format!("discrepancy type {}", raw))
            })?),
            None => None,
        };
        let resolution_action = match row.resolution_action.as_deref() {
            Some(raw) => Some(ResolutionAction::parse(raw).ok_or_else(|| {
                DatabaseError::invalid_data(format!("resolution action {}", raw))
            })?),
            None => None,
        };
        let annotations: Vec<AuditAnnotation> = serde_json::from_value(row.annotations)
            .map_err(|e| DatabaseError::invalid_data(format!("annotations: {}", e)))?;

        Ok(ReconciliationRecord {
            id: row.id,
            batch_id: row.batch_id,
            payment_id: row.payment_id,
            external_transaction_id: row.external_transaction_id,
            external_amount: row.external_amount,
            external_currency: row.external_currency,
            external_fee: row.external_fee,
            transaction_date: row.transaction_date,
            source_document: row.source_document,
            recorded_amount: row.recorded_amount,
            amount_difference: row.amount_difference,
            fee_difference: row.fee_difference,
            status,
            discrepancy_type,
            resolution_action,
            resolved_by: row.resolved_by,
            resolution_notes: row.resolution_notes,
            resolved_at: row.resolved_at,
            annotations,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

pub(crate) async fn lock_record(
    conn: &mut PgConnection,
    id: Uuid,
) -> Result<ReconciliationRecord, DatabaseError> {
    let row = sqlx::query_as::<_, ReconciliationRow>(&format!(
        "SELECT {} FROM reconciliation_records WHERE id = $1 FOR UPDATE",
        RECORD_COLUMNS
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(DatabaseError::from_sqlx)?
    .ok_or_else(|| DatabaseError::not_found("ReconciliationRecord", id))?;
    ReconciliationRecord::try_from(row)
}

/// Persists a resolution, guarded on the status the record was read in
pub(crate) async fn write_resolution(
    conn: &mut PgConnection,
    record: &ReconciliationRecord,
    expected: ReconciliationStatus,
) -> Result<(), DatabaseError> {
    let result = sqlx::query(
        "UPDATE reconciliation_records
         SET status = $2, resolution_action = $3, resolved_by = $4, resolution_notes = $5,
             resolved_at = $6, updated_at = $7
         WHERE id = $1 AND status = $8",
    )
    .bind(record.id)
    .bind(record.status.as_str())
    .bind(record.resolution_action.map(|a| a.as_str()))
    .bind(&record.resolved_by)
    .bind(&record.resolution_notes)
    .bind(record.resolved_at)
    .bind(record.updated_at)
    .bind(expected.as_str())
    .execute(&mut *conn)
    .await
    .map_err(DatabaseError::from_sqlx)?;

    if result.rows_affected() == 0 {
        return Err(DatabaseError::stale(
            "ReconciliationRecord",
            record.id,
            expected,
            "another state",
        ));
    }
    Ok(())
}

pub struct PgReconciliationStore {
    pool: PgPool,
}

impl PgReconciliationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ReconciliationStore for PgReconciliationStore {
    async fn insert_records(&self, records: &[ReconciliationRecord]) -> Result<(), DatabaseError> {
        let mut tx = self.pool.begin().await.map_err(DatabaseError::from_sqlx)?;

        for record in records {
            let annotations = serde_json::to_value(&record.annotations)
                .map_err(|e| DatabaseError::invalid_data(format!("annotations: {}", e)))?;
            sqlx::query(&format!(
                "INSERT INTO reconciliation_records ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, \
                 $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21)",
                RECORD_COLUMNS
            ))
            .bind(record.id)
            .bind(record.batch_id)
            .bind(record.payment_id)
            .bind(&record.external_transaction_id)
            .bind(record.external_amount)
            .bind(&record.external_currency)
            .bind(record.external_fee)
            .bind(record.transaction_date)
            .bind(&record.source_document)
            .bind(record.recorded_amount)
            .bind(record.amount_difference)
            .bind(record.fee_difference)
            .bind(record.status.as_str())
            .bind(record.discrepancy_type.map(|d| d.as_str()))
            .bind(record.resolution_action.map(|a| a.as_str()))
            .bind(&record.resolved_by)
            .bind(&record.resolution_notes)
            .bind(record.resolved_at)
            .bind(annotations)
            .bind(record.created_at)
            .bind(record.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        }

        tx.commit().await.map_err(DatabaseError::from_sqlx)?;
        Ok(())
    }

    async fn find_record(&self, id: Uuid) -> Result<Option<ReconciliationRecord>, DatabaseError> {
        sqlx::query_as::<_, ReconciliationRow>(&format!(
            "SELECT {} FROM reconciliation_records WHERE id = $1",
            RECORD_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?
        .map(ReconciliationRecord::try_from)
        .transpose()
    }

    async fn list_batch(&self, batch_id: Uuid) -> Result<Vec<ReconciliationRecord>, DatabaseError> {
        sqlx::query_as::<_, ReconciliationRow>(&format!(
            "SELECT {} FROM reconciliation_records WHERE batch_id = $1 ORDER BY created_at ASC",
            RECORD_COLUMNS
        ))
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?
        .into_iter()
        .map(ReconciliationRecord::try_from)
        .collect()
    }

    async fn append_annotation(
        &self,
        id: Uuid,
        annotation: &AuditAnnotation,
    ) -> Result<ReconciliationRecord, DatabaseError> {
        let entry = serde_json::to_value(vec![annotation])
            .map_err(|e| DatabaseError::invalid_data(format!("annotation: {}", e)))?;

        sqlx::query_as::<_, ReconciliationRow>(&format!(
            "UPDATE reconciliation_records
             SET annotations = annotations || $2::jsonb, updated_at = $3
             WHERE id = $1
             RETURNING {}",
            RECORD_COLUMNS
        ))
        .bind(id)
        .bind(entry)
        .bind(annotation.created_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?
        .ok_or_else(|| DatabaseError::not_found("ReconciliationRecord", id))
        .and_then(ReconciliationRecord::try_from)
    }
}
