//! PostgreSQL [`DocumentStore`]: JSONB documents plus indexed identity columns.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use polis_core::{FactFamily, IdentityQuery, OfficeType, Person, PersonPatch};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, Row, Transaction};
use tracing::debug;
use uuid::Uuid;

use crate::store::present_fields;
use crate::{DocumentStore, PersonFilter, PersonUpsert, StoreError, StoredFact, UpsertOutcome};

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn person_from_row(row: &PgRow) -> Result<Person, StoreError> {
    let Json(person): Json<Person> = row.try_get("doc")?;
    Ok(person)
}

fn persons_from_rows(rows: &[PgRow]) -> Result<Vec<Person>, StoreError> {
    rows.iter().map(person_from_row).collect()
}

/// Serializes concurrent creation of the same identity across workers.
async fn lock_identity(tx: &mut Transaction<'_, Postgres>, query: &IdentityQuery) -> Result<(), StoreError> {
    let mut keys = Vec::with_capacity(2);
    if let Some(tax_id) = &query.tax_id {
        keys.push(format!("tax:{tax_id}"));
    }
    keys.push(format!("name:{}", query.normalized_name()));
    for key in keys {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(key)
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

async fn write_person(tx: &mut Transaction<'_, Postgres>, person: &Person) -> Result<(), StoreError> {
    let (office_type, held) = match &person.current_office {
        Some(office) => (Some(office.office_type.as_str()), office.currently_held),
        None => (None, false),
    };
    sqlx::query(
        "INSERT INTO persons \
         (id, tax_id, normalized_name, birth_date, current_office_type, currently_held, doc, created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
         ON CONFLICT (id) DO UPDATE SET \
         tax_id = EXCLUDED.tax_id, \
         normalized_name = EXCLUDED.normalized_name, \
         birth_date = EXCLUDED.birth_date, \
         current_office_type = EXCLUDED.current_office_type, \
         currently_held = EXCLUDED.currently_held, \
         doc = EXCLUDED.doc, \
         updated_at = EXCLUDED.updated_at",
    )
    .bind(person.id)
    .bind(person.tax_id.as_deref())
    .bind(&person.normalized_name)
    .bind(person.birth_date)
    .bind(office_type)
    .bind(held)
    .bind(Json(person))
    .bind(person.created_at)
    .bind(person.updated_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[async_trait]
impl DocumentStore for PgStore {
    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        Ok(())
    }

    async fn find_person(&self, id: Uuid) -> Result<Option<Person>, StoreError> {
        let row = sqlx::query("SELECT doc FROM persons WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(person_from_row).transpose()
    }

    async fn find_person_by_tax_id(&self, tax_id: &str) -> Result<Option<Person>, StoreError> {
        let row = sqlx::query("SELECT doc FROM persons WHERE tax_id = $1 ORDER BY seq LIMIT 1")
            .bind(tax_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(person_from_row).transpose()
    }

    async fn find_persons_by_name(
        &self,
        normalized_name: &str,
        born_from: NaiveDate,
        born_to: NaiveDate,
    ) -> Result<Vec<Person>, StoreError> {
        let rows = sqlx::query(
            "SELECT doc FROM persons \
             WHERE normalized_name = $1 AND birth_date BETWEEN $2 AND $3 \
             ORDER BY seq",
        )
        .bind(normalized_name)
        .bind(born_from)
        .bind(born_to)
        .fetch_all(&self.pool)
        .await?;
        persons_from_rows(&rows)
    }

    async fn find_person_by_external_id(
        &self,
        source: &str,
        external_id: &str,
    ) -> Result<Option<Person>, StoreError> {
        let row = sqlx::query(
            "SELECT doc FROM persons \
             WHERE doc -> 'external_ids' @> jsonb_build_object($1::text, $2::text) \
             ORDER BY seq LIMIT 1",
        )
        .bind(source)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(person_from_row).transpose()
    }

    async fn find_current_holders(&self, office_type: OfficeType) -> Result<Vec<Person>, StoreError> {
        let rows = sqlx::query(
            "SELECT doc FROM persons WHERE current_office_type = $1 AND currently_held ORDER BY seq",
        )
        .bind(office_type.as_str())
        .fetch_all(&self.pool)
        .await?;
        persons_from_rows(&rows)
    }

    async fn upsert_person(
        &self,
        filter: &PersonFilter,
        patch: &PersonPatch,
        now: DateTime<Utc>,
    ) -> Result<PersonUpsert, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = match filter {
            PersonFilter::ById(id) => {
                sqlx::query("SELECT doc FROM persons WHERE id = $1 FOR UPDATE")
                    .bind(id)
                    .fetch_optional(&mut *tx)
                    .await?
            }
            PersonFilter::Identity(query) => {
                lock_identity(&mut tx, query).await?;
                sqlx::query(
                    "SELECT doc FROM persons \
                     WHERE ($1::text IS NOT NULL AND tax_id = $1) \
                        OR ($2 <> '' AND normalized_name = $2 AND birth_date IS NOT DISTINCT FROM $3) \
                     ORDER BY seq LIMIT 1 FOR UPDATE",
                )
                .bind(query.tax_id.as_deref())
                .bind(query.normalized_name())
                .bind(query.birth_date)
                .fetch_optional(&mut *tx)
                .await?
            }
        };

        let (person, inserted) = match row.as_ref().map(person_from_row).transpose()? {
            Some(mut person) => {
                patch.apply(&mut person, now);
                (person, false)
            }
            None => {
                let id = match filter {
                    PersonFilter::ById(id) => *id,
                    PersonFilter::Identity(_) => Uuid::new_v4(),
                };
                (patch.into_new_person(id, now), true)
            }
        };

        write_person(&mut tx, &person).await?;
        tx.commit().await?;
        debug!(person_id = %person.id, inserted, "person upserted");
        Ok(PersonUpsert {
            id: person.id,
            inserted,
        })
    }

    async fn upsert_fact(
        &self,
        family: FactFamily,
        natural_key: &str,
        person_id: Option<Uuid>,
        payload: &JsonValue,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError> {
        let fields = present_fields(family, payload)?;
        let row = sqlx::query(
            "INSERT INTO facts (family, natural_key, person_id, doc, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $5) \
             ON CONFLICT (family, natural_key) DO UPDATE SET \
             doc = facts.doc || EXCLUDED.doc, \
             person_id = COALESCE(EXCLUDED.person_id, facts.person_id), \
             updated_at = EXCLUDED.updated_at \
             RETURNING (xmax = 0) AS inserted",
        )
        .bind(family.collection())
        .bind(natural_key)
        .bind(person_id)
        .bind(Json(JsonValue::Object(fields)))
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(UpsertOutcome {
            inserted: row.try_get("inserted")?,
        })
    }

    async fn find_fact(&self, family: FactFamily, natural_key: &str) -> Result<Option<StoredFact>, StoreError> {
        let row = sqlx::query(
            "SELECT person_id, doc, created_at, updated_at FROM facts \
             WHERE family = $1 AND natural_key = $2",
        )
        .bind(family.collection())
        .bind(natural_key)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let Json(doc): Json<JsonValue> = row.try_get("doc")?;
        Ok(Some(StoredFact {
            family,
            natural_key: natural_key.to_string(),
            person_id: row.try_get("person_id")?,
            doc,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        }))
    }

    async fn count_persons(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM persons")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn count_facts(&self, family: FactFamily) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM facts WHERE family = $1")
            .bind(family.collection())
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}
