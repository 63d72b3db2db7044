//! SQLite [`DossierStore`] built on sqlx.
//!
//! Check-then-act primitives are single conditional statements
//! (`UPDATE … WHERE status = ?`, `NOT EXISTS` gates) or run inside a
//! transaction, and uniqueness is enforced by the indexes in `migrations/`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::migrate::MigrateDatabase;
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool};
use std::fmt::Display;
use std::str::FromStr;
use tracing::info;

use super::*;
use crate::error::StoreError;

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::UniqueViolation {
                constraint: db.constraint().unwrap_or("unique index").to_string(),
            },
            // SQLITE_BUSY / SQLITE_LOCKED
            sqlx::Error::Database(db) if matches!(db.code().as_deref(), Some("5") | Some("6")) => {
                StoreError::Transient(db.message().to_string())
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => StoreError::Transient(err.to_string()),
            _ => StoreError::Backend(err.to_string()),
        }
    }
}

fn parse<T>(row: &SqliteRow, column: &str) -> StoreResult<T>
where
    T: FromStr,
    T::Err: Display,
{
    let raw: String = row.try_get(column)?;
    raw.parse()
        .map_err(|e| StoreError::Backend(format!("column {column}: {e}")))
}

fn parse_opt<T>(row: &SqliteRow, column: &str) -> StoreResult<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    let raw: Option<String> = row.try_get(column)?;
    raw.map(|r| {
        r.parse()
            .map_err(|e| StoreError::Backend(format!("column {column}: {e}")))
    })
    .transpose()
}

fn json(row: &SqliteRow, column: &str) -> StoreResult<serde_json::Value> {
    let raw: String = row.try_get(column)?;
    serde_json::from_str(&raw).map_err(|e| StoreError::Backend(format!("column {column}: {e}")))
}

fn order_from_row(row: &SqliteRow) -> StoreResult<Order> {
    Ok(Order {
        id: parse(row, "id")?,
        processor_session_id: row.try_get("processor_session_id")?,
        client_id: UserId(row.try_get("client_id")?),
        product_id: ProductId(row.try_get("product_id")?),
        status: parse(row, "status")?,
        amount_cents: row.try_get("amount_cents")?,
        currency: row.try_get("currency")?,
        payment_intent_id: row.try_get("payment_intent_id")?,
        customer_id: row.try_get("customer_id")?,
        paid_at: row.try_get("paid_at")?,
        dossier_id: parse_opt(row, "dossier_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn profile_from_row(row: &SqliteRow) -> StoreResult<ClientProfile> {
    Ok(ClientProfile {
        id: parse(row, "id")?,
        user_id: UserId(row.try_get("user_id")?),
        active: row.try_get("active")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn dossier_from_row(row: &SqliteRow) -> StoreResult<Dossier> {
    Ok(Dossier {
        id: parse(row, "id")?,
        owner_id: UserId(row.try_get("owner_id")?),
        product_id: ProductId(row.try_get("product_id")?),
        status: parse(row, "status")?,
        current_step_instance_id: parse_opt(row, "current_step_instance_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        completed_at: row.try_get("completed_at")?,
        archived_at: row.try_get("archived_at")?,
        metadata: json(row, "metadata")?,
    })
}

fn step_from_row(row: &SqliteRow) -> StoreResult<StepInstance> {
    let position: i64 = row.try_get("position")?;
    Ok(StepInstance {
        id: parse(row, "id")?,
        dossier_id: parse(row, "dossier_id")?,
        step_template_id: StepTemplateId(row.try_get("step_template_id")?),
        position: position as u32,
        status: parse(row, "status")?,
        rejection_reason: row.try_get("rejection_reason")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        force_completed: row.try_get("force_completed")?,
        assigned_reviewer_id: row
            .try_get::<Option<String>, _>("assigned_reviewer_id")?
            .map(UserId),
        validated_by: row.try_get::<Option<String>, _>("validated_by")?.map(UserId),
        validated_at: row.try_get("validated_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn field_from_row(row: &SqliteRow) -> StoreResult<FieldValue> {
    Ok(FieldValue {
        id: parse(row, "id")?,
        step_instance_id: parse(row, "step_instance_id")?,
        field_id: FieldId(row.try_get("field_id")?),
        value: json(row, "value")?,
        status: parse(row, "status")?,
        rejection_reason: row.try_get("rejection_reason")?,
        submitted_by: UserId(row.try_get("submitted_by")?),
        reviewed_by: row.try_get::<Option<String>, _>("reviewed_by")?.map(UserId),
        reviewed_at: row.try_get("reviewed_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn document_from_row(row: &SqliteRow) -> StoreResult<Document> {
    Ok(Document {
        id: parse(row, "id")?,
        dossier_id: parse(row, "dossier_id")?,
        document_type_id: DocumentTypeId(row.try_get("document_type_id")?),
        step_instance_id: parse_opt(row, "step_instance_id")?,
        status: parse(row, "status")?,
        current_version_id: parse_opt(row, "current_version_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn version_from_row(row: &SqliteRow) -> StoreResult<DocumentVersion> {
    let version_number: i64 = row.try_get("version_number")?;
    let size_bytes: i64 = row.try_get("size_bytes")?;
    Ok(DocumentVersion {
        id: parse(row, "id")?,
        document_id: parse(row, "document_id")?,
        version_number: version_number as u32,
        file_url: row.try_get("file_url")?,
        file_name: row.try_get("file_name")?,
        size_bytes: size_bytes as u64,
        mime_type: row.try_get("mime_type")?,
        uploaded_by: UserId(row.try_get("uploaded_by")?),
        uploader_type: parse(row, "uploader_type")?,
        created_at: row.try_get("created_at")?,
    })
}

fn review_from_row(row: &SqliteRow) -> StoreResult<DocumentReview> {
    Ok(DocumentReview {
        id: parse(row, "id")?,
        document_id: parse(row, "document_id")?,
        version_id: parse(row, "version_id")?,
        decision: parse(row, "decision")?,
        reason: row.try_get("reason")?,
        reviewer_id: UserId(row.try_get("reviewer_id")?),
        automatic: row.try_get("automatic")?,
        created_at: row.try_get("created_at")?,
    })
}

fn event_from_row(row: &SqliteRow) -> StoreResult<Event> {
    Ok(Event {
        id: parse(row, "id")?,
        dossier_id: parse_opt(row, "dossier_id")?,
        entity_type: parse(row, "entity_type")?,
        entity_id: row.try_get("entity_id")?,
        event_type: parse(row, "event_type")?,
        actor_type: parse(row, "actor_type")?,
        actor_id: row.try_get("actor_id")?,
        payload: json(row, "payload")?,
        created_at: row.try_get("created_at")?,
    })
}

/// SQLite-backed store
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (and create if needed) the database, optionally running migrations
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        auto_migrate: bool,
    ) -> StoreResult<Self> {
        if !Sqlite::database_exists(database_url).await? {
            info!("Creating database at {}", database_url);
            Sqlite::create_database(database_url).await?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        if auto_migrate {
            info!("Running database migrations...");
            sqlx::migrate!("./migrations")
                .run(&pool)
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            info!("Database migrations completed");
        }

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close database connections gracefully
    pub async fn shutdown(&self) {
        info!("Shutting down database connections...");
        self.pool.close().await;
        info!("Database connections closed");
    }

    async fn write_step(
        executor: &mut sqlx::SqliteConnection,
        step: &StepInstance,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO step_instances (
                id, dossier_id, step_template_id, position, status, rejection_reason,
                started_at, completed_at, force_completed, assigned_reviewer_id,
                validated_by, validated_at, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(step.id.to_string())
        .bind(step.dossier_id.to_string())
        .bind(step.step_template_id.as_str())
        .bind(step.position as i64)
        .bind(step.status.as_str())
        .bind(step.rejection_reason.as_deref())
        .bind(step.started_at)
        .bind(step.completed_at)
        .bind(step.force_completed)
        .bind(step.assigned_reviewer_id.as_ref().map(|u| u.as_str()))
        .bind(step.validated_by.as_ref().map(|u| u.as_str()))
        .bind(step.validated_at)
        .bind(step.created_at)
        .bind(step.updated_at)
        .execute(executor)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl DossierStore for SqliteStore {
    async fn insert_order(&self, order: &Order) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO orders (
                id, processor_session_id, client_id, product_id, status, amount_cents,
                currency, payment_intent_id, customer_id, paid_at, dossier_id,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(order.id.to_string())
        .bind(&order.processor_session_id)
        .bind(order.client_id.as_str())
        .bind(order.product_id.as_str())
        .bind(order.status.as_str())
        .bind(order.amount_cents)
        .bind(&order.currency)
        .bind(order.payment_intent_id.as_deref())
        .bind(order.customer_id.as_deref())
        .bind(order.paid_at)
        .bind(order.dossier_id.map(|d| d.to_string()))
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_order_by_session(&self, session_id: &str) -> StoreResult<Option<Order>> {
        let row = sqlx::query("SELECT * FROM orders WHERE processor_session_id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(order_from_row).transpose()
    }

    async fn mark_order_paid(&self, id: OrderId, capture: &PaymentCapture) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE orders
            SET status = 'PAID', amount_cents = ?, payment_intent_id = ?, customer_id = ?,
                paid_at = ?, updated_at = ?
            WHERE id = ? AND status = 'PENDING'
            "#,
        )
        .bind(capture.amount_cents)
        .bind(capture.payment_intent_id.as_deref())
        .bind(capture.customer_id.as_deref())
        .bind(capture.paid_at)
        .bind(capture.paid_at)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_order_unpaid(
        &self,
        id: OrderId,
        status: OrderStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE orders SET status = ?, updated_at = ? WHERE id = ? AND status = 'PENDING'",
        )
        .bind(status.as_str())
        .bind(now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn link_order(
        &self,
        id: OrderId,
        dossier_id: DossierId,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<DossierId>> {
        sqlx::query(
            "UPDATE orders SET dossier_id = ?, updated_at = ? WHERE id = ? AND dossier_id IS NULL",
        )
        .bind(dossier_id.to_string())
        .bind(now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        let row = sqlx::query("SELECT dossier_id FROM orders WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => parse_opt(&row, "dossier_id"),
            None => Ok(None),
        }
    }

    async fn list_unsettled_orders(
        &self,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<Order>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM orders
            WHERE (status = 'PENDING' AND created_at < ?)
               OR (status = 'PAID' AND dossier_id IS NULL)
            ORDER BY created_at ASC
            LIMIT ?
            "#,
        )
        .bind(created_before)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(order_from_row).collect()
    }

    async fn activate_client_profile(
        &self,
        user_id: &UserId,
        now: DateTime<Utc>,
    ) -> StoreResult<ClientProfile> {
        sqlx::query(
            r#"
            INSERT INTO client_profiles (id, user_id, active, updated_at)
            VALUES (?, ?, 1, ?)
            ON CONFLICT (user_id) DO UPDATE SET active = 1, updated_at = excluded.updated_at
            WHERE client_profiles.active = 0
            "#,
        )
        .bind(ClientProfileId::new().to_string())
        .bind(user_id.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query("SELECT * FROM client_profiles WHERE user_id = ?")
            .bind(user_id.as_str())
            .fetch_one(&self.pool)
            .await?;
        profile_from_row(&row)
    }

    async fn get_client_profile(&self, user_id: &UserId) -> StoreResult<Option<ClientProfile>> {
        let row = sqlx::query("SELECT * FROM client_profiles WHERE user_id = ?")
            .bind(user_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(profile_from_row).transpose()
    }

    async fn insert_dossier_with_steps(
        &self,
        dossier: &Dossier,
        steps: &[StepInstance],
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        // The current pointer is written after the steps exist.
        sqlx::query(
            r#"
            INSERT INTO dossiers (
                id, owner_id, product_id, status, current_step_instance_id,
                created_at, updated_at, completed_at, archived_at, metadata
            ) VALUES (?, ?, ?, ?, NULL, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(dossier.id.to_string())
        .bind(dossier.owner_id.as_str())
        .bind(dossier.product_id.as_str())
        .bind(dossier.status.as_str())
        .bind(dossier.created_at)
        .bind(dossier.updated_at)
        .bind(dossier.completed_at)
        .bind(dossier.archived_at)
        .bind(dossier.metadata.to_string())
        .execute(&mut *tx)
        .await?;

        for step in steps {
            Self::write_step(&mut *tx, step).await?;
        }

        if let Some(current) = dossier.current_step_instance_id {
            if !steps.iter().any(|s| s.id == current) {
                return Err(StoreError::Backend(format!(
                    "current step {current} is not part of dossier {}",
                    dossier.id
                )));
            }
            sqlx::query("UPDATE dossiers SET current_step_instance_id = ? WHERE id = ?")
                .bind(current.to_string())
                .bind(dossier.id.to_string())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_dossier(&self, id: DossierId) -> StoreResult<Option<Dossier>> {
        let row = sqlx::query("SELECT * FROM dossiers WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(dossier_from_row).transpose()
    }

    async fn find_dossier_for(
        &self,
        owner_id: &UserId,
        product_id: &ProductId,
    ) -> StoreResult<Option<Dossier>> {
        let row = sqlx::query("SELECT * FROM dossiers WHERE owner_id = ? AND product_id = ?")
            .bind(owner_id.as_str())
            .bind(product_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(dossier_from_row).transpose()
    }

    async fn patch_dossier_if(
        &self,
        id: DossierId,
        expected: DossierStatus,
        patch: &DossierPatch,
    ) -> StoreResult<Option<Dossier>> {
        // Metadata keys are merged with json_set so concurrent writers of
        // other keys (and of the step pointer) are left alone.
        let mut metadata = String::from(
            "CASE WHEN json_type(metadata) = 'object' THEN metadata ELSE '{}' END",
        );
        for _ in &patch.metadata {
            metadata = format!("json_set({metadata}, ?, json(?))");
        }
        let sql = format!(
            r#"
            UPDATE dossiers
            SET status = COALESCE(?, status),
                completed_at = COALESCE(?, completed_at),
                archived_at = COALESCE(?, archived_at),
                metadata = {metadata},
                updated_at = ?
            WHERE id = ? AND status = ? AND (? = 0 OR archived_at IS NULL)
            "#
        );

        let mut query = sqlx::query(&sql)
            .bind(patch.status.map(|s| s.as_str()))
            .bind(patch.completed_at)
            .bind(patch.archived_at);
        for (key, value) in &patch.metadata {
            query = query.bind(format!("$.\"{key}\"")).bind(value.to_string());
        }
        let result = query
            .bind(patch.now)
            .bind(id.to_string())
            .bind(expected.as_str())
            .bind(patch.archived_at.is_some())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() != 1 {
            return Ok(None);
        }
        self.get_dossier(id).await
    }

    async fn set_current_step(
        &self,
        dossier_id: DossierId,
        step_id: StepInstanceId,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE dossiers SET current_step_instance_id = ?, updated_at = ?
            WHERE id = ?
              AND EXISTS (SELECT 1 FROM step_instances WHERE id = ? AND dossier_id = ?)
            "#,
        )
        .bind(step_id.to_string())
        .bind(now)
        .bind(dossier_id.to_string())
        .bind(step_id.to_string())
        .bind(dossier_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_step_instance(&self, id: StepInstanceId) -> StoreResult<Option<StepInstance>> {
        let row = sqlx::query("SELECT * FROM step_instances WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(step_from_row).transpose()
    }

    async fn list_step_instances(&self, dossier_id: DossierId) -> StoreResult<Vec<StepInstance>> {
        let rows = sqlx::query("SELECT * FROM step_instances WHERE dossier_id = ? ORDER BY position")
            .bind(dossier_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(step_from_row).collect()
    }

    async fn ensure_step_instance(&self, instance: &StepInstance) -> StoreResult<StepInstance> {
        let mut conn = self.pool.acquire().await?;
        match Self::write_step(&mut *conn, instance).await {
            Ok(()) | Err(StoreError::UniqueViolation { .. }) => {}
            Err(other) => return Err(other),
        }
        let row = sqlx::query(
            "SELECT * FROM step_instances WHERE dossier_id = ? AND step_template_id = ?",
        )
        .bind(instance.dossier_id.to_string())
        .bind(instance.step_template_id.as_str())
        .fetch_one(&mut *conn)
        .await?;
        step_from_row(&row)
    }

    async fn mark_step_started(&self, id: StepInstanceId, now: DateTime<Utc>) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE step_instances SET started_at = ?, updated_at = ? WHERE id = ? AND started_at IS NULL",
        )
        .bind(now)
        .bind(now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn apply_step_change(
        &self,
        id: StepInstanceId,
        expected: StepStatus,
        change: &StepChange,
    ) -> StoreResult<Option<StepInstance>> {
        let Some(mut step) = self.get_step_instance(id).await? else {
            return Ok(None);
        };
        if step.status != expected {
            return Ok(None);
        }
        let previous_updated_at = step.updated_at;
        change.apply(&mut step);

        let result = sqlx::query(
            r#"
            UPDATE step_instances
            SET status = ?, rejection_reason = ?, completed_at = ?, force_completed = ?,
                assigned_reviewer_id = ?, validated_by = ?, validated_at = ?, updated_at = ?
            WHERE id = ? AND status = ? AND updated_at = ?
            "#,
        )
        .bind(step.status.as_str())
        .bind(step.rejection_reason.as_deref())
        .bind(step.completed_at)
        .bind(step.force_completed)
        .bind(step.assigned_reviewer_id.as_ref().map(|u| u.as_str()))
        .bind(step.validated_by.as_ref().map(|u| u.as_str()))
        .bind(step.validated_at)
        .bind(step.updated_at)
        .bind(id.to_string())
        .bind(expected.as_str())
        .bind(previous_updated_at)
        .execute(&self.pool)
        .await?;

        Ok((result.rows_affected() == 1).then_some(step))
    }

    async fn approve_step_if_ready(
        &self,
        id: StepInstanceId,
        reviewer: &UserId,
        gate: ApprovalGate<'_>,
        now: DateTime<Utc>,
    ) -> StoreResult<ApprovalOutcome> {
        // Gate and write in one statement.
        let mut sql = String::from(
            r#"
            UPDATE step_instances
            SET status = 'APPROVED', completed_at = ?, validated_by = ?, validated_at = ?,
                rejection_reason = NULL, updated_at = ?
            WHERE id = ? AND status <> 'APPROVED'
              AND NOT EXISTS (
                  SELECT 1 FROM field_values f
                  WHERE f.step_instance_id = step_instances.id AND f.status <> 'APPROVED'
              )
            "#,
        );
        for _ in gate.required_fields {
            sql.push_str(
                r#"
              AND EXISTS (
                  SELECT 1 FROM field_values f
                  WHERE f.step_instance_id = step_instances.id
                    AND f.field_id = ? AND f.status = 'APPROVED'
              )
            "#,
            );
        }
        for _ in gate.required_document_types {
            sql.push_str(
                r#"
              AND EXISTS (
                  SELECT 1 FROM documents d
                  WHERE d.step_instance_id = step_instances.id
                    AND d.document_type_id = ? AND d.status = 'APPROVED'
              )
            "#,
            );
        }

        let mut query = sqlx::query(&sql)
            .bind(now)
            .bind(reviewer.as_str())
            .bind(now)
            .bind(now)
            .bind(id.to_string());
        for field_id in gate.required_fields {
            query = query.bind(field_id.as_str());
        }
        for doc_type in gate.required_document_types {
            query = query.bind(doc_type.as_str());
        }
        let approved = query.execute(&self.pool).await?.rows_affected() == 1;

        let Some(step) = self.get_step_instance(id).await? else {
            return Ok(ApprovalOutcome::Missing);
        };
        if approved {
            return Ok(ApprovalOutcome::Approved(step));
        }
        if step.status == StepStatus::Approved {
            return Ok(ApprovalOutcome::AlreadyApproved(step));
        }
        let fields = self.list_field_values(id).await?;
        let documents = self.list_step_documents(id).await?;
        Ok(ApprovalOutcome::Blocked(GateReport::evaluate(
            &fields, &documents, gate,
        )))
    }

    async fn get_field_value(&self, id: FieldValueId) -> StoreResult<Option<FieldValue>> {
        let row = sqlx::query("SELECT * FROM field_values WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(field_from_row).transpose()
    }

    async fn list_field_values(&self, step_id: StepInstanceId) -> StoreResult<Vec<FieldValue>> {
        let rows =
            sqlx::query("SELECT * FROM field_values WHERE step_instance_id = ? ORDER BY field_id")
                .bind(step_id.to_string())
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(field_from_row).collect()
    }

    async fn upsert_field_value(
        &self,
        write: &FieldWrite,
        policy: UpsertPolicy,
    ) -> StoreResult<UpsertOutcome> {
        let mut tx = self.pool.begin().await?;
        if policy.open_steps_only {
            let approved = sqlx::query(
                "SELECT 1 FROM step_instances WHERE id = ? AND status = 'APPROVED'",
            )
            .bind(write.step_instance_id.to_string())
            .fetch_optional(&mut *tx)
            .await?;
            if approved.is_some() {
                return Ok(UpsertOutcome::StepApproved);
            }
        }
        let existing = sqlx::query(
            "SELECT * FROM field_values WHERE step_instance_id = ? AND field_id = ?",
        )
        .bind(write.step_instance_id.to_string())
        .bind(write.field_id.as_str())
        .fetch_optional(&mut *tx)
        .await?
        .as_ref()
        .map(field_from_row)
        .transpose()?;

        let current = existing.as_ref().map(|f| f.status);
        if !policy.permits(current) {
            return Ok(UpsertOutcome::Skipped { current });
        }
        let value = write.apply(existing.as_ref());

        match &existing {
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO field_values (
                        id, step_instance_id, field_id, value, status, rejection_reason,
                        submitted_by, reviewed_by, reviewed_at, updated_at
                    ) VALUES (?, ?, ?, ?, ?, NULL, ?, NULL, NULL, ?)
                    "#,
                )
                .bind(value.id.to_string())
                .bind(value.step_instance_id.to_string())
                .bind(value.field_id.as_str())
                .bind(value.value.to_string())
                .bind(value.status.as_str())
                .bind(value.submitted_by.as_str())
                .bind(value.updated_at)
                .execute(&mut *tx)
                .await?;
            }
            Some(previous) => {
                let result = sqlx::query(
                    r#"
                    UPDATE field_values
                    SET value = ?, status = ?, rejection_reason = NULL, submitted_by = ?,
                        reviewed_by = NULL, reviewed_at = NULL, updated_at = ?
                    WHERE id = ? AND status = ?
                    "#,
                )
                .bind(value.value.to_string())
                .bind(value.status.as_str())
                .bind(value.submitted_by.as_str())
                .bind(value.updated_at)
                .bind(value.id.to_string())
                .bind(previous.status.as_str())
                .execute(&mut *tx)
                .await?;
                if result.rows_affected() != 1 {
                    return Err(StoreError::Transient(format!(
                        "field value {} changed during write",
                        previous.id
                    )));
                }
            }
        }
        tx.commit().await?;

        Ok(match existing {
            Some(_) => UpsertOutcome::Updated(value),
            None => UpsertOutcome::Inserted(value),
        })
    }

    async fn review_field_value(
        &self,
        id: FieldValueId,
        review: &FieldReview,
    ) -> StoreResult<Option<FieldValue>> {
        let result = sqlx::query(
            r#"
            UPDATE field_values
            SET status = ?, rejection_reason = ?, reviewed_by = ?, reviewed_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(review.status.as_str())
        .bind(review.reason.as_deref())
        .bind(review.reviewer.as_str())
        .bind(review.now)
        .bind(review.now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_field_value(id).await
    }

    async fn insert_document_with_version(
        &self,
        document: &Document,
        version: NewVersion,
        outdate_siblings: bool,
    ) -> StoreResult<(Document, DocumentVersion, u64)> {
        let mut tx = self.pool.begin().await?;
        let version = version.into_version(document.id, 1);

        let mut outdated = 0;
        if let (true, Some(step_id)) = (outdate_siblings, document.step_instance_id) {
            outdated = sqlx::query(
                r#"
                UPDATE documents SET status = 'OUTDATED', updated_at = ?
                WHERE step_instance_id = ? AND document_type_id = ? AND status <> 'OUTDATED'
                "#,
            )
            .bind(version.created_at)
            .bind(step_id.to_string())
            .bind(document.document_type_id.as_str())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }

        sqlx::query(
            r#"
            INSERT INTO documents (
                id, dossier_id, document_type_id, step_instance_id, status,
                current_version_id, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, NULL, ?, ?)
            "#,
        )
        .bind(document.id.to_string())
        .bind(document.dossier_id.to_string())
        .bind(document.document_type_id.as_str())
        .bind(document.step_instance_id.map(|s| s.to_string()))
        .bind(document.status.as_str())
        .bind(document.created_at)
        .bind(version.created_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO document_versions (
                id, document_id, version_number, file_url, file_name, size_bytes,
                mime_type, uploaded_by, uploader_type, created_at
            ) VALUES (?, ?, 1, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(version.id.to_string())
        .bind(document.id.to_string())
        .bind(&version.file_url)
        .bind(&version.file_name)
        .bind(version.size_bytes as i64)
        .bind(&version.mime_type)
        .bind(version.uploaded_by.as_str())
        .bind(version.uploader_type.as_str())
        .bind(version.created_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE documents SET current_version_id = ? WHERE id = ?")
            .bind(version.id.to_string())
            .bind(document.id.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        let mut stored = document.clone();
        stored.current_version_id = Some(version.id);
        stored.updated_at = version.created_at;
        Ok((stored, version, outdated))
    }

    async fn get_document(&self, id: DocumentId) -> StoreResult<Option<Document>> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(document_from_row).transpose()
    }

    async fn find_live_document(
        &self,
        dossier_id: DossierId,
        document_type_id: &DocumentTypeId,
        step_id: Option<StepInstanceId>,
    ) -> StoreResult<Option<Document>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM documents
            WHERE dossier_id = ? AND document_type_id = ?
              AND step_instance_id IS ? AND status <> 'OUTDATED'
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(dossier_id.to_string())
        .bind(document_type_id.as_str())
        .bind(step_id.map(|s| s.to_string()))
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(document_from_row).transpose()
    }

    async fn list_documents(&self, dossier_id: DossierId) -> StoreResult<Vec<Document>> {
        let rows = sqlx::query("SELECT * FROM documents WHERE dossier_id = ? ORDER BY created_at")
            .bind(dossier_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(document_from_row).collect()
    }

    async fn list_step_documents(&self, step_id: StepInstanceId) -> StoreResult<Vec<Document>> {
        let rows =
            sqlx::query("SELECT * FROM documents WHERE step_instance_id = ? ORDER BY created_at")
                .bind(step_id.to_string())
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(document_from_row).collect()
    }

    async fn append_document_version(
        &self,
        document_id: DocumentId,
        version: NewVersion,
        status: DocumentStatus,
    ) -> StoreResult<DocumentVersion> {
        let mut tx = self.pool.begin().await?;

        // Number assignment and insert in one statement; the unique index on
        // (document_id, version_number) rejects a racing duplicate.
        sqlx::query(
            r#"
            INSERT INTO document_versions (
                id, document_id, version_number, file_url, file_name, size_bytes,
                mime_type, uploaded_by, uploader_type, created_at
            )
            SELECT ?, ?, COALESCE(MAX(version_number), 0) + 1, ?, ?, ?, ?, ?, ?, ?
            FROM document_versions WHERE document_id = ?
            "#,
        )
        .bind(version.id.to_string())
        .bind(document_id.to_string())
        .bind(&version.file_url)
        .bind(&version.file_name)
        .bind(version.size_bytes as i64)
        .bind(&version.mime_type)
        .bind(version.uploaded_by.as_str())
        .bind(version.uploader_type.as_str())
        .bind(version.created_at)
        .bind(document_id.to_string())
        .execute(&mut *tx)
        .await?;

        let updated = sqlx::query(
            "UPDATE documents SET current_version_id = ?, status = ?, updated_at = ? WHERE id = ?",
        )
        .bind(version.id.to_string())
        .bind(status.as_str())
        .bind(version.created_at)
        .bind(document_id.to_string())
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() != 1 {
            return Err(StoreError::Backend(format!(
                "document {document_id} does not exist"
            )));
        }

        let row = sqlx::query("SELECT * FROM document_versions WHERE id = ?")
            .bind(version.id.to_string())
            .fetch_one(&mut *tx)
            .await?;
        let stored = version_from_row(&row)?;
        tx.commit().await?;
        Ok(stored)
    }

    async fn list_document_versions(
        &self,
        document_id: DocumentId,
    ) -> StoreResult<Vec<DocumentVersion>> {
        let rows = sqlx::query(
            "SELECT * FROM document_versions WHERE document_id = ? ORDER BY version_number",
        )
        .bind(document_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(version_from_row).collect()
    }

    async fn get_document_version(
        &self,
        id: DocumentVersionId,
    ) -> StoreResult<Option<DocumentVersion>> {
        let row = sqlx::query("SELECT * FROM document_versions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(version_from_row).transpose()
    }

    async fn record_document_review(
        &self,
        review: &DocumentReview,
        status: DocumentStatus,
    ) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            r#"
            UPDATE documents SET status = ?, updated_at = ?
            WHERE id = ? AND current_version_id = ? AND status <> 'OUTDATED'
            "#,
        )
        .bind(status.as_str())
        .bind(review.created_at)
        .bind(review.document_id.to_string())
        .bind(review.version_id.to_string())
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() != 1 {
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO document_reviews (
                id, document_id, version_id, decision, reason, reviewer_id, automatic, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(review.id.to_string())
        .bind(review.document_id.to_string())
        .bind(review.version_id.to_string())
        .bind(review.decision.as_str())
        .bind(review.reason.as_deref())
        .bind(review.reviewer_id.as_str())
        .bind(review.automatic)
        .bind(review.created_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn list_document_reviews(
        &self,
        document_id: DocumentId,
    ) -> StoreResult<Vec<DocumentReview>> {
        let rows =
            sqlx::query("SELECT * FROM document_reviews WHERE document_id = ? ORDER BY created_at")
                .bind(document_id.to_string())
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(review_from_row).collect()
    }

    async fn append_event(&self, event: &Event) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO events (
                id, dossier_id, entity_type, entity_id, event_type, actor_type, actor_id,
                payload, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(event.id.to_string())
        .bind(event.dossier_id.map(|d| d.to_string()))
        .bind(event.entity_type.as_str())
        .bind(&event.entity_id)
        .bind(event.event_type.as_str())
        .bind(event.actor_type.as_str())
        .bind(event.actor_id.as_deref())
        .bind(event.payload.to_string())
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_events(&self, dossier_id: DossierId) -> StoreResult<Vec<Event>> {
        let rows = sqlx::query("SELECT * FROM events WHERE dossier_id = ? ORDER BY created_at")
            .bind(dossier_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(event_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> SqliteStore {
        SqliteStore::connect("sqlite::memory:", 1, true).await.unwrap()
    }

    #[tokio::test]
    async fn test_sqlite_enforces_one_dossier_per_client_product() {
        let store = store().await;
        let now = Utc::now();
        let first = Dossier::new(UserId::from("c1"), ProductId::from("llc"), now);
        let step = StepInstance::new(first.id, StepTemplateId::from("s1"), 1, now);
        let mut first = first;
        first.current_step_instance_id = Some(step.id);
        store.insert_dossier_with_steps(&first, &[step]).await.unwrap();

        let second = Dossier::new(UserId::from("c1"), ProductId::from("llc"), now);
        let err = store.insert_dossier_with_steps(&second, &[]).await.unwrap_err();
        assert!(matches!(err, StoreError::UniqueViolation { .. }));

        let stored = store.get_dossier(first.id).await.unwrap().unwrap();
        assert_eq!(stored.current_step_instance_id, first.current_step_instance_id);
    }

    #[tokio::test]
    async fn test_sqlite_gate_requires_submitted_required_field() {
        let store = store().await;
        let now = Utc::now();
        let dossier = Dossier::new(UserId::from("c1"), ProductId::from("llc"), now);
        let step = StepInstance::new(dossier.id, StepTemplateId::from("s1"), 1, now);
        store
            .insert_dossier_with_steps(&dossier, &[step.clone()])
            .await
            .unwrap();

        let required = [FieldId::from("a")];
        let gate = ApprovalGate {
            required_fields: &required,
            required_document_types: &[],
        };
        let outcome = store
            .approve_step_if_ready(step.id, &UserId::from("a1"), gate, now)
            .await
            .unwrap();
        match outcome {
            ApprovalOutcome::Blocked(report) => {
                assert_eq!(report.unapproved_fields, vec![FieldId::from("a")])
            }
            other => panic!("expected a blocked approval, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_sqlite_status_patch_keeps_pointer_and_metadata() {
        let store = store().await;
        let now = Utc::now();
        let mut dossier = Dossier::new(UserId::from("c1"), ProductId::from("llc"), now);
        let s1 = StepInstance::new(dossier.id, StepTemplateId::from("s1"), 1, now);
        let s2 = StepInstance::new(dossier.id, StepTemplateId::from("s2"), 2, now);
        dossier.current_step_instance_id = Some(s1.id);
        dossier.metadata = serde_json::json!({ "source_order_id": "o1" });
        store
            .insert_dossier_with_steps(&dossier, &[s1, s2.clone()])
            .await
            .unwrap();
        assert!(store.set_current_step(dossier.id, s2.id, now).await.unwrap());

        let patch = DossierPatch::new(now)
            .status(DossierStatus::Closed)
            .metadata("cancellation_reason", serde_json::json!("client left"));
        let written = store
            .patch_dossier_if(dossier.id, dossier.status, &patch)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(written.status, DossierStatus::Closed);
        assert_eq!(written.current_step_instance_id, Some(s2.id));
        assert_eq!(written.metadata["source_order_id"], "o1");
        assert_eq!(written.metadata["cancellation_reason"], "client left");
    }

    #[tokio::test]
    async fn test_sqlite_order_paid_once() {
        let store = store().await;
        let order = Order::pending(
            "cs_1",
            UserId::from("c1"),
            ProductId::from("llc"),
            100,
            "usd",
            Utc::now(),
        );
        store.insert_order(&order).await.unwrap();
        let capture = PaymentCapture {
            amount_cents: 100,
            payment_intent_id: None,
            customer_id: None,
            paid_at: Utc::now(),
        };
        assert!(store.mark_order_paid(order.id, &capture).await.unwrap());
        assert!(!store.mark_order_paid(order.id, &capture).await.unwrap());
    }
}
