use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rfam_core::{
    CanonicalFields, Fingerprint, LiveFilter, Opportunity, OpportunityId, OpportunityUrls,
};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Postgres, Row, Transaction};
use tracing::debug;

use crate::store::{OpportunityStore, StoreError, UpsertOutcome};

const UNIQUE_VIOLATION: &str = "23505";
const MAX_RACE_RETRIES: usize = 3;

const SELECT_COLUMNS: &str = "id, fingerprint, source_name, source_native_id, title, agency, \
     mechanism, category, summary, eligibility, keywords, posted_date, close_date, urls, raw, \
     stale, embedding_pending, last_seen_at, created_at, updated_at";

pub async fn run_migrations(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("../../migrations")
        .run(pool)
        .await
        .map_err(|err| StoreError::Migration(err.to_string()))
}

fn classify(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION) => {
            StoreError::DuplicateKeyRace(db.message().to_string())
        }
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StoreError::Unavailable(err.to_string()),
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::ColumnNotFound(_) => {
            StoreError::Decode(err.to_string())
        }
        _ => StoreError::Query(err.to_string()),
    }
}

/// Postgres-backed store. Fingerprint uniqueness is enforced by the
/// `opportunities_fingerprint_key` constraint.
#[derive(Debug, Clone)]
pub struct PgOpportunityStore {
    pool: PgPool,
}

impl PgOpportunityStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await.map_err(classify)?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn try_upsert(
        &self,
        fields: &CanonicalFields,
        fingerprint: &Fingerprint,
    ) -> Result<UpsertOutcome, StoreError> {
        let now = Utc::now();
        let id = fingerprint.opportunity_id();
        let mut tx = self.pool.begin().await.map_err(classify)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO opportunities (
                id, fingerprint, source_name, source_native_id, title, agency, mechanism,
                category, summary, eligibility, keywords, posted_date, close_date, urls, raw,
                stale, embedding_pending, last_seen_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                    FALSE, FALSE, $16, $16, $16)
            ON CONFLICT (fingerprint) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(id)
        .bind(fingerprint.as_str())
        .bind(&fields.source_name)
        .bind(&fields.source_native_id)
        .bind(&fields.title)
        .bind(&fields.agency)
        .bind(&fields.mechanism)
        .bind(&fields.category)
        .bind(&fields.summary)
        .bind(&fields.eligibility)
        .bind(serde_json::json!(fields.keywords))
        .bind(fields.posted_date)
        .bind(fields.close_date)
        .bind(serde_json::to_value(&fields.urls).map_err(|e| StoreError::Decode(e.to_string()))?)
        .bind(&fields.raw)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(classify)?;

        let (is_new, reactivated) = if inserted.is_some() {
            (true, false)
        } else {
            let row = sqlx::query(
                r#"
                UPDATE opportunities o
                SET last_seen_at = $2,
                    stale = FALSE,
                    updated_at = CASE WHEN prev.was_stale THEN $2 ELSE o.updated_at END
                FROM (
                    SELECT id, stale AS was_stale
                    FROM opportunities
                    WHERE fingerprint = $1
                    FOR UPDATE
                ) prev
                WHERE o.id = prev.id
                RETURNING prev.was_stale
                "#,
            )
            .bind(fingerprint.as_str())
            .bind(now)
            .fetch_optional(&mut *tx)
            .await
            .map_err(classify)?;
            // The conflicting row is not visible yet; let the caller retry.
            let Some(row) = row else {
                return Err(StoreError::DuplicateKeyRace(fingerprint.to_string()));
            };
            let was_stale: bool = row.try_get("was_stale").map_err(classify)?;
            (false, was_stale)
        };

        let superseded = match &fields.source_native_id {
            Some(native_id) => {
                relink_source(&mut tx, &fields.source_name, native_id, id, now).await?
            }
            None => None,
        };

        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM opportunities WHERE id = $1"
        ))
        .bind(id)
        .fetch_one(&mut *tx)
        .await
        .map_err(classify)?;
        let opportunity = row_to_opportunity(&row)?;

        tx.commit().await.map_err(classify)?;

        Ok(UpsertOutcome {
            opportunity,
            is_new,
            reactivated,
            superseded,
        })
    }
}

/// Point (source, native id) at `id`; mark the previous target stale when no
/// other link still references it.
async fn relink_source(
    tx: &mut Transaction<'_, Postgres>,
    source_name: &str,
    native_id: &str,
    id: OpportunityId,
    now: DateTime<Utc>,
) -> Result<Option<OpportunityId>, StoreError> {
    let previous: Option<OpportunityId> = sqlx::query(
        "SELECT opportunity_id FROM opportunity_sources \
         WHERE source_name = $1 AND source_native_id = $2 FOR UPDATE",
    )
    .bind(source_name)
    .bind(native_id)
    .fetch_optional(&mut **tx)
    .await
    .map_err(classify)?
    .map(|row| row.try_get("opportunity_id"))
    .transpose()
    .map_err(classify)?;

    sqlx::query(
        r#"
        INSERT INTO opportunity_sources (source_name, source_native_id, opportunity_id, first_seen_at, last_seen_at)
        VALUES ($1, $2, $3, $4, $4)
        ON CONFLICT (source_name, source_native_id)
        DO UPDATE SET opportunity_id = EXCLUDED.opportunity_id, last_seen_at = EXCLUDED.last_seen_at
        "#,
    )
    .bind(source_name)
    .bind(native_id)
    .bind(id)
    .bind(now)
    .execute(&mut **tx)
    .await
    .map_err(classify)?;

    let Some(previous) = previous.filter(|prev| *prev != id) else {
        return Ok(None);
    };

    let retired = sqlx::query(
        r#"
        UPDATE opportunities
        SET stale = TRUE, updated_at = $2
        WHERE id = $1
          AND NOT stale
          AND NOT EXISTS (SELECT 1 FROM opportunity_sources WHERE opportunity_id = $1)
        RETURNING id
        "#,
    )
    .bind(previous)
    .bind(now)
    .fetch_optional(&mut **tx)
    .await
    .map_err(classify)?;

    Ok(retired.map(|_| previous))
}

fn row_to_opportunity(row: &PgRow) -> Result<Opportunity, StoreError> {
    let keywords: JsonValue = row.try_get("keywords").map_err(classify)?;
    let urls: JsonValue = row.try_get("urls").map_err(classify)?;
    let fingerprint: String = row.try_get("fingerprint").map_err(classify)?;
    let posted_date: Option<NaiveDate> = row.try_get("posted_date").map_err(classify)?;
    let close_date: Option<NaiveDate> = row.try_get("close_date").map_err(classify)?;

    Ok(Opportunity {
        id: row.try_get("id").map_err(classify)?,
        fingerprint: Fingerprint::from_hex(fingerprint),
        fields: CanonicalFields {
            source_name: row.try_get("source_name").map_err(classify)?,
            source_native_id: row.try_get("source_native_id").map_err(classify)?,
            title: row.try_get("title").map_err(classify)?,
            agency: row.try_get("agency").map_err(classify)?,
            mechanism: row.try_get("mechanism").map_err(classify)?,
            category: row.try_get("category").map_err(classify)?,
            summary: row.try_get("summary").map_err(classify)?,
            eligibility: row.try_get("eligibility").map_err(classify)?,
            keywords: serde_json::from_value(keywords)
                .map_err(|e| StoreError::Decode(format!("keywords: {e}")))?,
            posted_date,
            close_date,
            urls: serde_json::from_value::<OpportunityUrls>(urls)
                .map_err(|e| StoreError::Decode(format!("urls: {e}")))?,
            raw: row.try_get("raw").map_err(classify)?,
        },
        stale: row.try_get("stale").map_err(classify)?,
        embedding_pending: row.try_get("embedding_pending").map_err(classify)?,
        last_seen_at: row.try_get("last_seen_at").map_err(classify)?,
        created_at: row.try_get("created_at").map_err(classify)?,
        updated_at: row.try_get("updated_at").map_err(classify)?,
    })
}

#[async_trait]
impl OpportunityStore for PgOpportunityStore {
    fn is_durable(&self) -> bool {
        true
    }

    async fn upsert(
        &self,
        fields: CanonicalFields,
        fingerprint: Fingerprint,
    ) -> Result<UpsertOutcome, StoreError> {
        let mut attempt = 0;
        loop {
            match self.try_upsert(&fields, &fingerprint).await {
                Err(StoreError::DuplicateKeyRace(detail)) if attempt < MAX_RACE_RETRIES => {
                    debug!(%fingerprint, %detail, attempt, "lost insert race, retrying on update path");
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn list_live(&self, filter: &LiveFilter) -> Result<Vec<Opportunity>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {SELECT_COLUMNS}
            FROM opportunities
            WHERE NOT stale
              AND ($1::text IS NULL OR lower(trim(agency)) = lower(trim($1)))
              AND ($2::text IS NULL OR lower(trim(mechanism)) = lower(trim($2)))
              AND ($3::date IS NULL OR close_date IS NULL OR close_date >= $3)
              AND ($4::date IS NULL OR posted_date IS NULL OR posted_date <= $4)
            ORDER BY created_at, id
            "#
        ))
        .bind(&filter.agency)
        .bind(&filter.mechanism)
        .bind(filter.open_after)
        .bind(filter.open_before)
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        rows.iter().map(row_to_opportunity).collect()
    }

    async fn get_many(&self, ids: &[OpportunityId]) -> Result<Vec<Opportunity>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM opportunities WHERE id = ANY($1)"
        ))
        .bind(ids)
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        let mut found = rows
            .iter()
            .map(row_to_opportunity)
            .collect::<Result<Vec<_>, _>>()?;
        // Preserve the caller's order.
        found.sort_by_key(|o| ids.iter().position(|id| *id == o.id));
        Ok(found)
    }

    async fn set_embedding_pending(
        &self,
        id: OpportunityId,
        pending: bool,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE opportunities SET embedding_pending = $2 WHERE id = $1")
            .bind(id)
            .bind(pending)
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn list_embedding_pending(&self) -> Result<Vec<Opportunity>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM opportunities \
             WHERE embedding_pending AND NOT stale ORDER BY created_at, id"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        rows.iter().map(row_to_opportunity).collect()
    }
}
