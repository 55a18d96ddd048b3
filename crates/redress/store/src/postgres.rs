//! PostgreSQL adapter: the transactional source-of-truth backend.
//!
//! Counter and meta updates are single server-side statements so that
//! concurrent chunk workers never read-modify-write shared rows; the
//! billing hot path locks the profile row with `SELECT ... FOR UPDATE`.

use crate::traits::{
    AttemptStore, BankStore, BillingTarget, BillingTxn, BlacklistStore, ChargebackStore,
    DebtorStore, InFlightAttempt, ProfileStore, TxnStore, UploadStore, VopLogStore,
};
use crate::{StoreError, StoreResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redress_types::{
    AttemptContext, AttemptId, AttemptStatus, BankRecord, BillingAttempt, BillingModel,
    BlacklistEntry, Chargeback, ChargebackSource, Debtor, DebtorId, DebtorProfile, DebtorStatus,
    Meta, NewBillingAttempt, NewBlacklistEntry, NewChargeback, NewDebtor, NewUpload, NewVopLog,
    Phase, PhaseStatus, ProfileId, SkipReason, Upload, UploadId, UploadPhases, UploadStatus,
    ValidationStatus, VopLog,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;

/// PostgreSQL-backed store adapter.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect and initialize the schema.
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        Self::connect_with_options(database_url, 10, 5).await
    }

    /// Connect with explicit pool parameters.
    pub async fn connect_with_options(
        database_url: &str,
        max_connections: u32,
        connect_timeout_secs: u64,
    ) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(std::time::Duration::from_secs(connect_timeout_secs))
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Backend(format!("failed to connect postgres: {e}")))?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create the adapter from an existing pool.
    pub async fn from_pool(pool: PgPool) -> StoreResult<Self> {
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn init_schema(&self) -> StoreResult<()> {
        let ddl = [
            r#"
            CREATE TABLE IF NOT EXISTS uploads (
                id BIGSERIAL PRIMARY KEY,
                original_filename TEXT NOT NULL,
                stored_path TEXT NOT NULL,
                size_bytes BIGINT NOT NULL,
                uploader_id BIGINT NOT NULL,
                total_rows BIGINT NOT NULL DEFAULT 0,
                processed_records BIGINT NOT NULL DEFAULT 0,
                failed_records BIGINT NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                validation_status TEXT NOT NULL DEFAULT 'idle',
                vop_status TEXT NOT NULL DEFAULT 'idle',
                billing_status TEXT NOT NULL DEFAULT 'idle',
                reconciliation_status TEXT NOT NULL DEFAULT 'idle',
                column_mapping JSONB NOT NULL DEFAULT '{}',
                meta JSONB NOT NULL DEFAULT '{}',
                billing_model TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS debtors (
                id BIGSERIAL PRIMARY KEY,
                upload_id BIGINT NOT NULL REFERENCES uploads(id),
                first_name TEXT NOT NULL,
                last_name TEXT NOT NULL,
                email TEXT,
                iban TEXT NOT NULL,
                iban_hash TEXT NOT NULL,
                iban_valid BOOLEAN NOT NULL,
                country TEXT,
                amount NUMERIC(12,2) NOT NULL,
                currency TEXT NOT NULL,
                raw_row JSONB NOT NULL DEFAULT '{}',
                validation_status TEXT NOT NULL DEFAULT 'pending',
                validation_errors JSONB NOT NULL DEFAULT '[]',
                validated_at TIMESTAMPTZ,
                status TEXT NOT NULL DEFAULT 'uploaded',
                skip_reason TEXT,
                selected_for_bav BOOLEAN NOT NULL DEFAULT FALSE,
                profile_id BIGINT,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_debtors_upload ON debtors (upload_id)",
            "CREATE INDEX IF NOT EXISTS idx_debtors_iban_hash ON debtors (iban_hash)",
            r#"
            CREATE TABLE IF NOT EXISTS debtor_profiles (
                id BIGSERIAL PRIMARY KEY,
                iban_hash TEXT NOT NULL UNIQUE,
                iban_masked TEXT NOT NULL,
                billing_model TEXT NOT NULL,
                billing_amount NUMERIC(12,2),
                currency TEXT NOT NULL,
                is_active BOOLEAN NOT NULL DEFAULT TRUE,
                last_success_at TIMESTAMPTZ,
                last_billed_at TIMESTAMPTZ,
                next_bill_at TIMESTAMPTZ,
                lifetime_revenue NUMERIC(14,2) NOT NULL DEFAULT 0,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS billing_attempts (
                id BIGSERIAL PRIMARY KEY,
                debtor_id BIGINT NOT NULL REFERENCES debtors(id),
                upload_id BIGINT,
                profile_id BIGINT,
                emp_account_id TEXT,
                attempt_number INTEGER NOT NULL,
                unique_id TEXT UNIQUE,
                amount NUMERIC(12,2) NOT NULL,
                currency TEXT NOT NULL,
                billing_model TEXT NOT NULL,
                context TEXT NOT NULL,
                status TEXT NOT NULL,
                error_code TEXT,
                error_message TEXT,
                chargeback_reason_code TEXT,
                chargebacked_at TIMESTAMPTZ,
                reconciliation_attempts INTEGER NOT NULL DEFAULT 0,
                last_reconciled_at TIMESTAMPTZ,
                meta JSONB NOT NULL DEFAULT '{}',
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_attempts_debtor ON billing_attempts (debtor_id)",
            "CREATE INDEX IF NOT EXISTS idx_attempts_status ON billing_attempts (status)",
            r#"
            CREATE TABLE IF NOT EXISTS vop_logs (
                id BIGSERIAL PRIMARY KEY,
                debtor_id BIGINT NOT NULL REFERENCES debtors(id),
                upload_id BIGINT NOT NULL,
                iban_masked TEXT NOT NULL,
                iban_valid BOOLEAN NOT NULL,
                bank_identified BOOLEAN NOT NULL,
                bank_name TEXT,
                bic TEXT,
                country TEXT,
                vop_score SMALLINT NOT NULL,
                result TEXT NOT NULL,
                bav_verified BOOLEAN NOT NULL,
                bav_name_match TEXT NOT NULL,
                meta JSONB NOT NULL DEFAULT '{}',
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_vop_logs_upload ON vop_logs (upload_id)",
            r#"
            CREATE TABLE IF NOT EXISTS blacklist (
                id BIGSERIAL PRIMARY KEY,
                iban_hash TEXT NOT NULL UNIQUE,
                iban TEXT NOT NULL,
                first_name TEXT,
                last_name TEXT,
                email TEXT,
                reason TEXT NOT NULL,
                source TEXT NOT NULL,
                added_by TEXT,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS chargebacks (
                id BIGSERIAL PRIMARY KEY,
                billing_attempt_id BIGINT NOT NULL,
                debtor_id BIGINT NOT NULL,
                original_transaction_unique_id TEXT NOT NULL UNIQUE,
                cb_type TEXT,
                reason_code TEXT,
                reason_description TEXT,
                amount NUMERIC(12,2),
                currency TEXT,
                post_date TIMESTAMPTZ,
                import_date TIMESTAMPTZ NOT NULL,
                source TEXT NOT NULL,
                raw_response JSONB NOT NULL DEFAULT '{}'
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS banks (
                country TEXT NOT NULL,
                bank_code TEXT NOT NULL,
                name TEXT NOT NULL,
                bic TEXT,
                sdd_supported BOOLEAN NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (country, bank_code)
            )
            "#,
        ];

        for stmt in ddl {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::Backend(format!("schema init failed: {e}")))?;
        }
        Ok(())
    }
}

fn backend(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn parse_enum<T: FromStr<Err = String>>(raw: String) -> StoreResult<T> {
    raw.parse().map_err(StoreError::Serialization)
}

fn upload_from_row(row: &PgRow) -> StoreResult<Upload> {
    Ok(Upload {
        id: row.try_get("id").map_err(backend)?,
        original_filename: row.try_get("original_filename").map_err(backend)?,
        stored_path: row.try_get("stored_path").map_err(backend)?,
        size_bytes: row.try_get("size_bytes").map_err(backend)?,
        uploader_id: row.try_get("uploader_id").map_err(backend)?,
        total_rows: row.try_get("total_rows").map_err(backend)?,
        processed_records: row.try_get("processed_records").map_err(backend)?,
        failed_records: row.try_get("failed_records").map_err(backend)?,
        status: parse_enum::<UploadStatus>(row.try_get("status").map_err(backend)?)?,
        phases: UploadPhases {
            validation: parse_enum::<PhaseStatus>(
                row.try_get("validation_status").map_err(backend)?,
            )?,
            vop: parse_enum::<PhaseStatus>(row.try_get("vop_status").map_err(backend)?)?,
            billing: parse_enum::<PhaseStatus>(row.try_get("billing_status").map_err(backend)?)?,
            reconciliation: parse_enum::<PhaseStatus>(
                row.try_get("reconciliation_status").map_err(backend)?,
            )?,
        },
        column_mapping: row.try_get("column_mapping").map_err(backend)?,
        meta: row.try_get("meta").map_err(backend)?,
        billing_model: parse_enum::<BillingModel>(row.try_get("billing_model").map_err(backend)?)?,
        created_at: row.try_get("created_at").map_err(backend)?,
        updated_at: row.try_get("updated_at").map_err(backend)?,
    })
}

fn debtor_from_row(row: &PgRow) -> StoreResult<Debtor> {
    let errors: Meta = row.try_get("validation_errors").map_err(backend)?;
    let validation_errors = errors
        .as_array()
        .map(|list| {
            list.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    Ok(Debtor {
        id: row.try_get("id").map_err(backend)?,
        upload_id: row.try_get("upload_id").map_err(backend)?,
        first_name: row.try_get("first_name").map_err(backend)?,
        last_name: row.try_get("last_name").map_err(backend)?,
        email: row.try_get("email").map_err(backend)?,
        iban: row.try_get("iban").map_err(backend)?,
        iban_hash: row.try_get("iban_hash").map_err(backend)?,
        iban_valid: row.try_get("iban_valid").map_err(backend)?,
        country: row.try_get("country").map_err(backend)?,
        amount: row.try_get("amount").map_err(backend)?,
        currency: row.try_get("currency").map_err(backend)?,
        raw_row: row.try_get("raw_row").map_err(backend)?,
        validation_status: parse_enum::<ValidationStatus>(
            row.try_get("validation_status").map_err(backend)?,
        )?,
        validation_errors,
        validated_at: row.try_get("validated_at").map_err(backend)?,
        status: parse_enum::<DebtorStatus>(row.try_get("status").map_err(backend)?)?,
        skip_reason: row
            .try_get::<Option<String>, _>("skip_reason")
            .map_err(backend)?
            .map(parse_enum::<SkipReason>)
            .transpose()?,
        selected_for_bav: row.try_get("selected_for_bav").map_err(backend)?,
        profile_id: row.try_get("profile_id").map_err(backend)?,
        created_at: row.try_get("created_at").map_err(backend)?,
        updated_at: row.try_get("updated_at").map_err(backend)?,
    })
}

fn profile_from_row(row: &PgRow) -> StoreResult<DebtorProfile> {
    Ok(DebtorProfile {
        id: row.try_get("id").map_err(backend)?,
        iban_hash: row.try_get("iban_hash").map_err(backend)?,
        iban_masked: row.try_get("iban_masked").map_err(backend)?,
        billing_model: parse_enum::<BillingModel>(row.try_get("billing_model").map_err(backend)?)?,
        billing_amount: row.try_get("billing_amount").map_err(backend)?,
        currency: row.try_get("currency").map_err(backend)?,
        is_active: row.try_get("is_active").map_err(backend)?,
        last_success_at: row.try_get("last_success_at").map_err(backend)?,
        last_billed_at: row.try_get("last_billed_at").map_err(backend)?,
        next_bill_at: row.try_get("next_bill_at").map_err(backend)?,
        lifetime_revenue: row.try_get("lifetime_revenue").map_err(backend)?,
        created_at: row.try_get("created_at").map_err(backend)?,
        updated_at: row.try_get("updated_at").map_err(backend)?,
    })
}

fn attempt_from_row(row: &PgRow) -> StoreResult<BillingAttempt> {
    let context: String = row.try_get("context").map_err(backend)?;
    let context = match context.as_str() {
        "batch_upload" => AttemptContext::BatchUpload,
        "recurring_billing" => AttemptContext::RecurringBilling,
        other => {
            return Err(StoreError::Serialization(format!(
                "unknown attempt context: {other}"
            )))
        }
    };
    Ok(BillingAttempt {
        id: row.try_get("id").map_err(backend)?,
        debtor_id: row.try_get("debtor_id").map_err(backend)?,
        upload_id: row.try_get("upload_id").map_err(backend)?,
        profile_id: row.try_get("profile_id").map_err(backend)?,
        emp_account_id: row.try_get("emp_account_id").map_err(backend)?,
        attempt_number: row.try_get("attempt_number").map_err(backend)?,
        unique_id: row.try_get("unique_id").map_err(backend)?,
        amount: row.try_get("amount").map_err(backend)?,
        currency: row.try_get("currency").map_err(backend)?,
        billing_model: parse_enum::<BillingModel>(row.try_get("billing_model").map_err(backend)?)?,
        context,
        status: parse_enum::<AttemptStatus>(row.try_get("status").map_err(backend)?)?,
        error_code: row.try_get("error_code").map_err(backend)?,
        error_message: row.try_get("error_message").map_err(backend)?,
        chargeback_reason_code: row.try_get("chargeback_reason_code").map_err(backend)?,
        chargebacked_at: row.try_get("chargebacked_at").map_err(backend)?,
        reconciliation_attempts: row.try_get("reconciliation_attempts").map_err(backend)?,
        last_reconciled_at: row.try_get("last_reconciled_at").map_err(backend)?,
        meta: row.try_get("meta").map_err(backend)?,
        created_at: row.try_get("created_at").map_err(backend)?,
        updated_at: row.try_get("updated_at").map_err(backend)?,
    })
}

fn vop_log_from_row(row: &PgRow) -> StoreResult<VopLog> {
    let score: i16 = row.try_get("vop_score").map_err(backend)?;
    Ok(VopLog {
        id: row.try_get("id").map_err(backend)?,
        debtor_id: row.try_get("debtor_id").map_err(backend)?,
        upload_id: row.try_get("upload_id").map_err(backend)?,
        iban_masked: row.try_get("iban_masked").map_err(backend)?,
        iban_valid: row.try_get("iban_valid").map_err(backend)?,
        bank_identified: row.try_get("bank_identified").map_err(backend)?,
        bank_name: row.try_get("bank_name").map_err(backend)?,
        bic: row.try_get("bic").map_err(backend)?,
        country: row.try_get("country").map_err(backend)?,
        vop_score: score.clamp(0, 100) as u8,
        result: parse_enum(row.try_get("result").map_err(backend)?)?,
        bav_verified: row.try_get("bav_verified").map_err(backend)?,
        bav_name_match: parse_enum(row.try_get("bav_name_match").map_err(backend)?)?,
        meta: row.try_get("meta").map_err(backend)?,
        created_at: row.try_get("created_at").map_err(backend)?,
    })
}

fn blacklist_from_row(row: &PgRow) -> StoreResult<BlacklistEntry> {
    Ok(BlacklistEntry {
        id: row.try_get("id").map_err(backend)?,
        iban_hash: row.try_get("iban_hash").map_err(backend)?,
        iban: row.try_get("iban").map_err(backend)?,
        first_name: row.try_get("first_name").map_err(backend)?,
        last_name: row.try_get("last_name").map_err(backend)?,
        email: row.try_get("email").map_err(backend)?,
        reason: row.try_get("reason").map_err(backend)?,
        source: row.try_get("source").map_err(backend)?,
        added_by: row.try_get("added_by").map_err(backend)?,
        created_at: row.try_get("created_at").map_err(backend)?,
    })
}

fn chargeback_from_row(row: &PgRow) -> StoreResult<Chargeback> {
    Ok(Chargeback {
        id: row.try_get("id").map_err(backend)?,
        billing_attempt_id: row.try_get("billing_attempt_id").map_err(backend)?,
        debtor_id: row.try_get("debtor_id").map_err(backend)?,
        original_transaction_unique_id: row
            .try_get("original_transaction_unique_id")
            .map_err(backend)?,
        cb_type: row.try_get("cb_type").map_err(backend)?,
        reason_code: row.try_get("reason_code").map_err(backend)?,
        reason_description: row.try_get("reason_description").map_err(backend)?,
        amount: row.try_get("amount").map_err(backend)?,
        currency: row.try_get("currency").map_err(backend)?,
        post_date: row.try_get("post_date").map_err(backend)?,
        import_date: row.try_get("import_date").map_err(backend)?,
        source: parse_enum::<ChargebackSource>(row.try_get("source").map_err(backend)?)?,
        raw_response: row.try_get("raw_response").map_err(backend)?,
    })
}

fn bank_from_row(row: &PgRow) -> StoreResult<BankRecord> {
    Ok(BankRecord {
        country: row.try_get("country").map_err(backend)?,
        bank_code: row.try_get("bank_code").map_err(backend)?,
        name: row.try_get("name").map_err(backend)?,
        bic: row.try_get("bic").map_err(backend)?,
        sdd_supported: row.try_get("sdd_supported").map_err(backend)?,
        updated_at: row.try_get("updated_at").map_err(backend)?,
    })
}

fn phase_column(phase: Phase) -> &'static str {
    match phase {
        Phase::Validation => "validation_status",
        Phase::Vop => "vop_status",
        Phase::Billing => "billing_status",
        Phase::Reconciliation => "reconciliation_status",
    }
}

#[async_trait]
impl UploadStore for PostgresStore {
    async fn create_upload(&self, new: NewUpload) -> StoreResult<Upload> {
        let now = Utc::now();
        let row = sqlx::query(
            r#"
            INSERT INTO uploads (original_filename, stored_path, size_bytes, uploader_id,
                                 status, billing_model, created_at, updated_at)
            VALUES ($1, $2, $3, $4, 'pending', $5, $6, $6)
            RETURNING *
            "#,
        )
        .bind(&new.original_filename)
        .bind(&new.stored_path)
        .bind(new.size_bytes)
        .bind(new.uploader_id)
        .bind(new.billing_model.as_str())
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(backend)?;
        upload_from_row(&row)
    }

    async fn get_upload(&self, id: UploadId) -> StoreResult<Option<Upload>> {
        let row = sqlx::query("SELECT * FROM uploads WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.as_ref().map(upload_from_row).transpose()
    }

    async fn set_upload_status(&self, id: UploadId, status: UploadStatus) -> StoreResult<()> {
        let done = sqlx::query("UPDATE uploads SET status = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        if done.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("upload {id}")));
        }
        Ok(())
    }

    async fn set_total_rows(&self, id: UploadId, total_rows: i64) -> StoreResult<()> {
        sqlx::query("UPDATE uploads SET total_rows = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(total_rows)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn set_column_mapping(&self, id: UploadId, mapping: Meta) -> StoreResult<()> {
        sqlx::query("UPDATE uploads SET column_mapping = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(mapping)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn set_phase_status(
        &self,
        id: UploadId,
        phase: Phase,
        status: PhaseStatus,
    ) -> StoreResult<()> {
        // Closed column set; never interpolates caller input.
        let sql = format!(
            "UPDATE uploads SET {} = $2, updated_at = now() WHERE id = $1",
            phase_column(phase)
        );
        sqlx::query(&sql)
            .bind(id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn bump_upload_counters(
        &self,
        id: UploadId,
        processed: i64,
        failed: i64,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE uploads
            SET processed_records = processed_records + $2,
                failed_records = failed_records + $3,
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(processed)
        .bind(failed)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn bump_skip_counts(
        &self,
        id: UploadId,
        counts: &[(SkipReason, i64)],
    ) -> StoreResult<()> {
        for (reason, delta) in counts {
            sqlx::query(
                r#"
                UPDATE uploads
                SET meta = jsonb_set(
                        jsonb_set(meta, '{skipped}',
                                  COALESCE(meta->'skipped', '{}'::jsonb), true),
                        ARRAY['skipped', $2::text],
                        to_jsonb(COALESCE((meta #>> ARRAY['skipped', $2::text])::bigint, 0) + $3),
                        true),
                    updated_at = now()
                WHERE id = $1
                "#,
            )
            .bind(id)
            .bind(reason.as_str())
            .bind(delta)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        }
        Ok(())
    }

    async fn append_error_samples(
        &self,
        id: UploadId,
        samples: &[Meta],
        cap: usize,
    ) -> StoreResult<()> {
        if samples.is_empty() {
            return Ok(());
        }
        let patch = Meta::Array(samples.to_vec());
        sqlx::query(
            r#"
            UPDATE uploads
            SET meta = jsonb_set(
                    meta,
                    '{errors}',
                    (
                        SELECT COALESCE(jsonb_agg(elem), '[]'::jsonb)
                        FROM (
                            SELECT elem
                            FROM jsonb_array_elements(
                                COALESCE(meta->'errors', '[]'::jsonb) || $2::jsonb
                            ) WITH ORDINALITY AS t(elem, idx)
                            WHERE idx <= $3
                        ) capped
                    ),
                    true),
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(patch)
        .bind(cap as i64)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn merge_upload_meta(&self, id: UploadId, patch: Meta) -> StoreResult<()> {
        sqlx::query("UPDATE uploads SET meta = meta || $2::jsonb, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(patch)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }
}

#[async_trait]
impl DebtorStore for PostgresStore {
    async fn insert_debtors(&self, rows: Vec<NewDebtor>) -> StoreResult<Vec<Debtor>> {
        let now = Utc::now();
        let mut out = Vec::with_capacity(rows.len());
        let mut txn = self.pool.begin().await.map_err(backend)?;
        for new in rows {
            let row = sqlx::query(
                r#"
                INSERT INTO debtors (upload_id, first_name, last_name, email, iban, iban_hash,
                                     iban_valid, country, amount, currency, raw_row, skip_reason,
                                     profile_id, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $14)
                RETURNING *
                "#,
            )
            .bind(new.upload_id)
            .bind(&new.first_name)
            .bind(&new.last_name)
            .bind(&new.email)
            .bind(&new.iban)
            .bind(&new.iban_hash)
            .bind(new.iban_valid)
            .bind(&new.country)
            .bind(new.amount)
            .bind(&new.currency)
            .bind(&new.raw_row)
            .bind(new.skip_reason.map(|r| r.as_str()))
            .bind(new.profile_id)
            .bind(now)
            .fetch_one(&mut *txn)
            .await
            .map_err(backend)?;
            out.push(debtor_from_row(&row)?);
        }
        txn.commit().await.map_err(backend)?;
        Ok(out)
    }

    async fn get_debtor(&self, id: DebtorId) -> StoreResult<Option<Debtor>> {
        let row = sqlx::query("SELECT * FROM debtors WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.as_ref().map(debtor_from_row).transpose()
    }

    async fn list_debtors_for_upload(&self, upload_id: UploadId) -> StoreResult<Vec<Debtor>> {
        let rows = sqlx::query("SELECT * FROM debtors WHERE upload_id = $1 ORDER BY id")
            .bind(upload_id)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.iter().map(debtor_from_row).collect()
    }

    async fn unvalidated_debtors(&self, upload_id: UploadId) -> StoreResult<Vec<Debtor>> {
        let rows = sqlx::query(
            "SELECT * FROM debtors WHERE upload_id = $1 AND validation_status = 'pending' AND skip_reason IS NULL ORDER BY id",
        )
        .bind(upload_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter().map(debtor_from_row).collect()
    }

    async fn valid_debtors(&self, upload_id: UploadId) -> StoreResult<Vec<Debtor>> {
        let rows = sqlx::query(
            "SELECT * FROM debtors WHERE upload_id = $1 AND validation_status = 'valid' ORDER BY id",
        )
        .bind(upload_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter().map(debtor_from_row).collect()
    }

    async fn update_validation(
        &self,
        id: DebtorId,
        status: ValidationStatus,
        errors: Vec<String>,
        validated_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let errors = Meta::Array(errors.into_iter().map(Meta::String).collect());
        sqlx::query(
            r#"
            UPDATE debtors
            SET validation_status = $2, validation_errors = $3, validated_at = $4,
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(errors)
        .bind(validated_at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn set_debtor_status(&self, id: DebtorId, status: DebtorStatus) -> StoreResult<()> {
        let done = sqlx::query("UPDATE debtors SET status = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        if done.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("debtor {id}")));
        }
        Ok(())
    }

    async fn set_selected_for_bav(&self, ids: &[DebtorId], selected: bool) -> StoreResult<()> {
        sqlx::query(
            "UPDATE debtors SET selected_for_bav = $2, updated_at = now() WHERE id = ANY($1)",
        )
        .bind(ids)
        .bind(selected)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn recovered_iban_hashes(
        &self,
        hashes: &[String],
        exclude_upload: UploadId,
    ) -> StoreResult<HashSet<String>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT iban_hash FROM debtors
            WHERE iban_hash = ANY($1) AND status = 'recovered' AND upload_id <> $2
            "#,
        )
        .bind(hashes)
        .bind(exclude_upload)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter()
            .map(|r| r.try_get::<String, _>("iban_hash").map_err(backend))
            .collect()
    }

    async fn billable_debtors(
        &self,
        upload_id: UploadId,
        target: BillingTarget,
    ) -> StoreResult<Vec<Debtor>> {
        let (all, model) = match target {
            BillingTarget::All => (true, String::new()),
            BillingTarget::Model(m) => (false, m.as_str().to_string()),
        };
        let rows = sqlx::query(
            r#"
            SELECT d.* FROM debtors d
            LEFT JOIN debtor_profiles p ON p.id = d.profile_id
            WHERE d.upload_id = $1
              AND d.skip_reason IS NULL
              AND d.validation_status = 'valid'
              AND d.status = 'uploaded'
              AND ($2 OR p.id IS NULL OR p.billing_model = $3)
              AND (p.billing_model IN ('flywheel', 'recovery') OR NOT EXISTS (
                    SELECT 1 FROM billing_attempts a
                    WHERE a.debtor_id = d.id AND a.status IN ('pending', 'approved')))
              AND NOT EXISTS (
                    SELECT 1 FROM vop_logs v
                    WHERE v.debtor_id = d.id AND v.bav_name_match = 'no')
            ORDER BY d.id
            "#,
        )
        .bind(upload_id)
        .bind(all)
        .bind(model)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter().map(debtor_from_row).collect()
    }

    async fn recovered_debtors(&self, limit: usize, offset: usize) -> StoreResult<Vec<Debtor>> {
        let rows = sqlx::query(
            "SELECT * FROM debtors WHERE status = 'recovered' ORDER BY id LIMIT $1 OFFSET $2",
        )
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter().map(debtor_from_row).collect()
    }

    async fn latest_debtor_for_hash(&self, iban_hash: &str) -> StoreResult<Option<Debtor>> {
        let row = sqlx::query("SELECT * FROM debtors WHERE iban_hash = $1 ORDER BY id DESC LIMIT 1")
            .bind(iban_hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.as_ref().map(debtor_from_row).transpose()
    }
}

#[async_trait]
impl ProfileStore for PostgresStore {
    async fn get_profile(&self, id: ProfileId) -> StoreResult<Option<DebtorProfile>> {
        let row = sqlx::query("SELECT * FROM debtor_profiles WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.as_ref().map(profile_from_row).transpose()
    }

    async fn get_profile_by_hash(&self, iban_hash: &str) -> StoreResult<Option<DebtorProfile>> {
        let row = sqlx::query("SELECT * FROM debtor_profiles WHERE iban_hash = $1")
            .bind(iban_hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.as_ref().map(profile_from_row).transpose()
    }

    async fn profiles_by_hashes(
        &self,
        hashes: &[String],
    ) -> StoreResult<HashMap<String, DebtorProfile>> {
        let rows = sqlx::query("SELECT * FROM debtor_profiles WHERE iban_hash = ANY($1)")
            .bind(hashes)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        let mut out = HashMap::with_capacity(rows.len());
        for row in &rows {
            let profile = profile_from_row(row)?;
            out.insert(profile.iban_hash.clone(), profile);
        }
        Ok(out)
    }

    async fn ensure_profile(
        &self,
        iban_hash: &str,
        iban_masked: &str,
        billing_model: BillingModel,
        currency: &str,
    ) -> StoreResult<DebtorProfile> {
        let now = Utc::now();
        let row = sqlx::query(
            r#"
            INSERT INTO debtor_profiles (iban_hash, iban_masked, billing_model, currency,
                                         is_active, lifetime_revenue, created_at, updated_at)
            VALUES ($1, $2, $3, $4, TRUE, 0, $5, $5)
            ON CONFLICT (iban_hash) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(iban_hash)
        .bind(iban_masked)
        .bind(billing_model.as_str())
        .bind(currency)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        if let Some(row) = row {
            return profile_from_row(&row);
        }
        let existing = sqlx::query("SELECT * FROM debtor_profiles WHERE iban_hash = $1")
            .bind(iban_hash)
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?;
        profile_from_row(&existing)
    }

    async fn update_profile(&self, profile: &DebtorProfile) -> StoreResult<()> {
        let done = sqlx::query(
            r#"
            UPDATE debtor_profiles
            SET billing_model = $2, billing_amount = $3, currency = $4, is_active = $5,
                last_success_at = $6, last_billed_at = $7, next_bill_at = $8,
                lifetime_revenue = $9, iban_masked = $10, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(profile.id)
        .bind(profile.billing_model.as_str())
        .bind(profile.billing_amount)
        .bind(&profile.currency)
        .bind(profile.is_active)
        .bind(profile.last_success_at)
        .bind(profile.last_billed_at)
        .bind(profile.next_bill_at)
        .bind(profile.lifetime_revenue)
        .bind(&profile.iban_masked)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        if done.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("profile {}", profile.id)));
        }
        Ok(())
    }

    async fn profiles_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<DebtorProfile>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM debtor_profiles
            WHERE is_active
              AND billing_model IN ('flywheel', 'recovery')
              AND next_bill_at IS NOT NULL
              AND next_bill_at <= $1
            ORDER BY next_bill_at
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter().map(profile_from_row).collect()
    }
}

#[async_trait]
impl AttemptStore for PostgresStore {
    async fn get_attempt(&self, id: AttemptId) -> StoreResult<Option<BillingAttempt>> {
        let row = sqlx::query("SELECT * FROM billing_attempts WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.as_ref().map(attempt_from_row).transpose()
    }

    async fn find_attempt_by_unique_id(
        &self,
        unique_id: &str,
    ) -> StoreResult<Option<BillingAttempt>> {
        let row = sqlx::query("SELECT * FROM billing_attempts WHERE unique_id = $1")
            .bind(unique_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.as_ref().map(attempt_from_row).transpose()
    }

    async fn chargebacked_hashes(&self, hashes: &[String]) -> StoreResult<HashSet<String>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT d.iban_hash
            FROM billing_attempts a
            JOIN debtors d ON d.id = a.debtor_id
            WHERE d.iban_hash = ANY($1) AND a.status = 'chargebacked'
            "#,
        )
        .bind(hashes)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter()
            .map(|r| r.try_get::<String, _>("iban_hash").map_err(backend))
            .collect()
    }

    async fn in_flight_by_hashes(
        &self,
        hashes: &[String],
        since: DateTime<Utc>,
    ) -> StoreResult<HashMap<String, InFlightAttempt>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT ON (d.iban_hash) d.iban_hash, a.status, a.created_at
            FROM billing_attempts a
            JOIN debtors d ON d.id = a.debtor_id
            WHERE d.iban_hash = ANY($1)
              AND a.status IN ('pending', 'approved')
              AND a.created_at >= $2
            ORDER BY d.iban_hash, a.created_at DESC
            "#,
        )
        .bind(hashes)
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        let mut out = HashMap::with_capacity(rows.len());
        for row in &rows {
            let iban_hash: String = row.try_get("iban_hash").map_err(backend)?;
            let status = parse_enum::<AttemptStatus>(row.try_get("status").map_err(backend)?)?;
            let created_at: DateTime<Utc> = row.try_get("created_at").map_err(backend)?;
            out.insert(
                iban_hash.clone(),
                InFlightAttempt {
                    iban_hash,
                    status,
                    created_at,
                },
            );
        }
        Ok(out)
    }

    async fn update_attempt_status(
        &self,
        id: AttemptId,
        status: AttemptStatus,
        error_code: Option<String>,
        error_message: Option<String>,
    ) -> StoreResult<()> {
        let done = sqlx::query(
            r#"
            UPDATE billing_attempts
            SET status = $2,
                error_code = COALESCE($3, error_code),
                error_message = COALESCE($4, error_message),
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(error_code)
        .bind(error_message)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        if done.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("billing attempt {id}")));
        }
        Ok(())
    }

    async fn mark_attempt_chargebacked(
        &self,
        id: AttemptId,
        chargebacked_at: DateTime<Utc>,
        reason_code: Option<String>,
        error_code: Option<String>,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE billing_attempts
            SET status = 'chargebacked',
                chargebacked_at = $2,
                chargeback_reason_code = $3,
                error_code = COALESCE($4, error_code),
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(chargebacked_at)
        .bind(reason_code)
        .bind(error_code)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn merge_attempt_meta(&self, id: AttemptId, patch: Meta) -> StoreResult<()> {
        sqlx::query(
            "UPDATE billing_attempts SET meta = meta || $2::jsonb, updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .bind(patch)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn pending_for_reconciliation(
        &self,
        older_than: DateTime<Utc>,
        max_recon_attempts: i32,
        limit: usize,
    ) -> StoreResult<Vec<BillingAttempt>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM billing_attempts
            WHERE status = 'pending'
              AND unique_id IS NOT NULL
              AND created_at < $1
              AND reconciliation_attempts < $2
            ORDER BY created_at ASC, last_reconciled_at ASC NULLS FIRST
            LIMIT $3
            "#,
        )
        .bind(older_than)
        .bind(max_recon_attempts)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter().map(attempt_from_row).collect()
    }

    async fn record_reconciliation(&self, id: AttemptId, at: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE billing_attempts
            SET reconciliation_attempts = reconciliation_attempts + 1,
                last_reconciled_at = $2,
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }
}

#[async_trait]
impl VopLogStore for PostgresStore {
    async fn insert_vop_log(&self, new: NewVopLog) -> StoreResult<VopLog> {
        let row = sqlx::query(
            r#"
            INSERT INTO vop_logs (debtor_id, upload_id, iban_masked, iban_valid, bank_identified,
                                  bank_name, bic, country, vop_score, result, bav_verified,
                                  bav_name_match, meta, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, now())
            RETURNING *
            "#,
        )
        .bind(new.debtor_id)
        .bind(new.upload_id)
        .bind(&new.iban_masked)
        .bind(new.iban_valid)
        .bind(new.bank_identified)
        .bind(&new.bank_name)
        .bind(&new.bic)
        .bind(&new.country)
        .bind(i16::from(new.vop_score))
        .bind(new.result.as_str())
        .bind(new.bav_verified)
        .bind(new.bav_name_match.as_str())
        .bind(&new.meta)
        .fetch_one(&self.pool)
        .await
        .map_err(backend)?;
        vop_log_from_row(&row)
    }

    async fn bav_mismatch_debtors(&self, upload_id: UploadId) -> StoreResult<HashSet<DebtorId>> {
        let rows = sqlx::query(
            "SELECT DISTINCT debtor_id FROM vop_logs WHERE upload_id = $1 AND bav_name_match = 'no'",
        )
        .bind(upload_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter()
            .map(|r| r.try_get::<DebtorId, _>("debtor_id").map_err(backend))
            .collect()
    }

    async fn list_vop_logs_for_upload(&self, upload_id: UploadId) -> StoreResult<Vec<VopLog>> {
        let rows = sqlx::query("SELECT * FROM vop_logs WHERE upload_id = $1 ORDER BY id")
            .bind(upload_id)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.iter().map(vop_log_from_row).collect()
    }
}

#[async_trait]
impl BlacklistStore for PostgresStore {
    async fn add_blacklist_entry(&self, new: NewBlacklistEntry) -> StoreResult<BlacklistEntry> {
        let row = sqlx::query(
            r#"
            INSERT INTO blacklist (iban_hash, iban, first_name, last_name, email, reason,
                                   source, added_by, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, now())
            ON CONFLICT (iban_hash) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(&new.iban_hash)
        .bind(&new.iban)
        .bind(&new.first_name)
        .bind(&new.last_name)
        .bind(&new.email)
        .bind(&new.reason)
        .bind(&new.source)
        .bind(&new.added_by)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        if let Some(row) = row {
            return blacklist_from_row(&row);
        }
        // Lost the race (or the entry predates us); the existing row wins.
        let existing = sqlx::query("SELECT * FROM blacklist WHERE iban_hash = $1")
            .bind(&new.iban_hash)
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?;
        blacklist_from_row(&existing)
    }

    async fn remove_blacklist_entry(&self, iban_hash: &str) -> StoreResult<bool> {
        let done = sqlx::query("DELETE FROM blacklist WHERE iban_hash = $1")
            .bind(iban_hash)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(done.rows_affected() > 0)
    }

    async fn blacklisted_hashes(&self, hashes: &[String]) -> StoreResult<HashSet<String>> {
        let rows = sqlx::query("SELECT iban_hash FROM blacklist WHERE iban_hash = ANY($1)")
            .bind(hashes)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.iter()
            .map(|r| r.try_get::<String, _>("iban_hash").map_err(backend))
            .collect()
    }

    async fn blacklisted_names(
        &self,
        names: &[(String, String)],
    ) -> StoreResult<HashSet<(String, String)>> {
        let keys: Vec<String> = names
            .iter()
            .map(|(f, l)| format!("{}|{}", f.trim().to_lowercase(), l.trim().to_lowercase()))
            .collect();
        let rows = sqlx::query(
            r#"
            SELECT lower(first_name) AS first_name, lower(last_name) AS last_name
            FROM blacklist
            WHERE first_name IS NOT NULL AND last_name IS NOT NULL
              AND (lower(trim(first_name)) || '|' || lower(trim(last_name))) = ANY($1)
            "#,
        )
        .bind(&keys)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        let mut out = HashSet::with_capacity(rows.len());
        for row in &rows {
            let first: String = row.try_get("first_name").map_err(backend)?;
            let last: String = row.try_get("last_name").map_err(backend)?;
            out.insert((first.trim().to_string(), last.trim().to_string()));
        }
        Ok(out)
    }

    async fn blacklisted_emails(&self, emails: &[String]) -> StoreResult<HashSet<String>> {
        let folded: Vec<String> = emails.iter().map(|e| e.trim().to_lowercase()).collect();
        let rows = sqlx::query(
            "SELECT lower(trim(email)) AS email FROM blacklist WHERE email IS NOT NULL AND lower(trim(email)) = ANY($1)",
        )
        .bind(&folded)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter()
            .map(|r| r.try_get::<String, _>("email").map_err(backend))
            .collect()
    }
}

#[async_trait]
impl ChargebackStore for PostgresStore {
    async fn insert_chargeback(&self, new: NewChargeback) -> StoreResult<(Chargeback, bool)> {
        let row = sqlx::query(
            r#"
            INSERT INTO chargebacks (billing_attempt_id, debtor_id, original_transaction_unique_id,
                                     cb_type, reason_code, reason_description, amount, currency,
                                     post_date, import_date, source, raw_response)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, now(), $10, $11)
            ON CONFLICT (original_transaction_unique_id) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(new.billing_attempt_id)
        .bind(new.debtor_id)
        .bind(&new.original_transaction_unique_id)
        .bind(&new.cb_type)
        .bind(&new.reason_code)
        .bind(&new.reason_description)
        .bind(new.amount)
        .bind(&new.currency)
        .bind(new.post_date)
        .bind(new.source.as_str())
        .bind(&new.raw_response)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        if let Some(row) = row {
            return Ok((chargeback_from_row(&row)?, true));
        }
        let existing = sqlx::query(
            "SELECT * FROM chargebacks WHERE original_transaction_unique_id = $1",
        )
        .bind(&new.original_transaction_unique_id)
        .fetch_one(&self.pool)
        .await
        .map_err(backend)?;
        Ok((chargeback_from_row(&existing)?, false))
    }

    async fn chargeback_for_transaction(
        &self,
        original_transaction_unique_id: &str,
    ) -> StoreResult<Option<Chargeback>> {
        let row = sqlx::query(
            "SELECT * FROM chargebacks WHERE original_transaction_unique_id = $1",
        )
        .bind(original_transaction_unique_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        row.as_ref().map(chargeback_from_row).transpose()
    }
}

#[async_trait]
impl BankStore for PostgresStore {
    async fn get_bank(&self, country: &str, bank_code: &str) -> StoreResult<Option<BankRecord>> {
        let row = sqlx::query("SELECT * FROM banks WHERE country = $1 AND bank_code = $2")
            .bind(country)
            .bind(bank_code)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.as_ref().map(bank_from_row).transpose()
    }

    async fn upsert_bank(&self, record: BankRecord) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO banks (country, bank_code, name, bic, sdd_supported, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (country, bank_code) DO UPDATE
            SET name = EXCLUDED.name, bic = EXCLUDED.bic,
                sdd_supported = EXCLUDED.sdd_supported, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&record.country)
        .bind(&record.bank_code)
        .bind(&record.name)
        .bind(&record.bic)
        .bind(record.sdd_supported)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }
}

/// Billing transaction over PostgreSQL: the profile row is held
/// `FOR UPDATE` until commit; dropping without commit rolls back.
pub struct PgBillingTxn {
    txn: Transaction<'static, Postgres>,
}

#[async_trait]
impl BillingTxn for PgBillingTxn {
    async fn profile_for_update(
        &mut self,
        iban_hash: &str,
    ) -> StoreResult<Option<DebtorProfile>> {
        let row = sqlx::query("SELECT * FROM debtor_profiles WHERE iban_hash = $1 FOR UPDATE")
            .bind(iban_hash)
            .fetch_optional(&mut *self.txn)
            .await
            .map_err(backend)?;
        row.as_ref().map(profile_from_row).transpose()
    }

    async fn create_profile(
        &mut self,
        iban_hash: &str,
        iban_masked: &str,
        billing_model: BillingModel,
        currency: &str,
    ) -> StoreResult<DebtorProfile> {
        let now = Utc::now();
        let row = sqlx::query(
            r#"
            INSERT INTO debtor_profiles (iban_hash, iban_masked, billing_model, currency,
                                         is_active, lifetime_revenue, created_at, updated_at)
            VALUES ($1, $2, $3, $4, TRUE, 0, $5, $5)
            RETURNING *
            "#,
        )
        .bind(iban_hash)
        .bind(iban_masked)
        .bind(billing_model.as_str())
        .bind(currency)
        .bind(now)
        .fetch_one(&mut *self.txn)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Conflict(
                format!("profile for iban hash {iban_hash} already exists"),
            ),
            _ => backend(e),
        })?;
        profile_from_row(&row)
    }

    async fn save_profile(&mut self, profile: &DebtorProfile) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE debtor_profiles
            SET billing_model = $2, billing_amount = $3, currency = $4, is_active = $5,
                last_success_at = $6, last_billed_at = $7, next_bill_at = $8,
                lifetime_revenue = $9, iban_masked = $10, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(profile.id)
        .bind(profile.billing_model.as_str())
        .bind(profile.billing_amount)
        .bind(&profile.currency)
        .bind(profile.is_active)
        .bind(profile.last_success_at)
        .bind(profile.last_billed_at)
        .bind(profile.next_bill_at)
        .bind(profile.lifetime_revenue)
        .bind(&profile.iban_masked)
        .execute(&mut *self.txn)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn next_attempt_number(&mut self, debtor_id: DebtorId) -> StoreResult<i32> {
        let row = sqlx::query(
            "SELECT COALESCE(MAX(attempt_number), 0) + 1 AS next FROM billing_attempts WHERE debtor_id = $1",
        )
        .bind(debtor_id)
        .fetch_one(&mut *self.txn)
        .await
        .map_err(backend)?;
        row.try_get::<i32, _>("next").map_err(backend)
    }

    async fn insert_attempt(&mut self, new: NewBillingAttempt) -> StoreResult<BillingAttempt> {
        let now = Utc::now();
        let row = sqlx::query(
            r#"
            INSERT INTO billing_attempts (debtor_id, upload_id, profile_id, emp_account_id,
                                          attempt_number, unique_id, amount, currency,
                                          billing_model, context, status, error_code,
                                          error_message, meta, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $15)
            RETURNING *
            "#,
        )
        .bind(new.debtor_id)
        .bind(new.upload_id)
        .bind(new.profile_id)
        .bind(&new.emp_account_id)
        .bind(new.attempt_number)
        .bind(&new.unique_id)
        .bind(new.amount)
        .bind(&new.currency)
        .bind(new.billing_model.as_str())
        .bind(new.context.as_str())
        .bind(new.status.as_str())
        .bind(&new.error_code)
        .bind(&new.error_message)
        .bind(&new.meta)
        .bind(now)
        .fetch_one(&mut *self.txn)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Conflict(
                "billing attempt with this unique_id already exists".to_string(),
            ),
            _ => backend(e),
        })?;
        attempt_from_row(&row)
    }

    async fn set_debtor_status(&mut self, id: DebtorId, status: DebtorStatus) -> StoreResult<()> {
        sqlx::query("UPDATE debtors SET status = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .execute(&mut *self.txn)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn link_profile(
        &mut self,
        debtor_id: DebtorId,
        profile_id: ProfileId,
    ) -> StoreResult<()> {
        sqlx::query("UPDATE debtors SET profile_id = $2, updated_at = now() WHERE id = $1")
            .bind(debtor_id)
            .bind(profile_id)
            .execute(&mut *self.txn)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.txn.commit().await.map_err(backend)
    }
}

#[async_trait]
impl TxnStore for PostgresStore {
    async fn begin_billing(&self) -> StoreResult<Box<dyn BillingTxn>> {
        let txn = self.pool.begin().await.map_err(backend)?;
        Ok(Box::new(PgBillingTxn { txn }))
    }
}
