//! Persistence gateway: the operations the sync pipeline needs from the canonical store.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use polis_core::{FactFamily, IdentityQuery, OfficeType, Person, PersonPatch};
use serde::Serialize;
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("document encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("fact payload for {family:?} must be a JSON object")]
    NotAnObject { family: FactFamily },
}

/// Which person document an upsert targets.
#[derive(Debug, Clone)]
pub enum PersonFilter {
    /// A record already resolved by identity.
    ById(Uuid),
    /// Creation path: matches an existing record by tax id, or by exact
    /// normalized name plus exact birth date (both absent counts as equal).
    Identity(IdentityQuery),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PersonUpsert {
    pub id: Uuid,
    pub inserted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UpsertOutcome {
    pub inserted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredFact {
    pub family: FactFamily,
    pub natural_key: String,
    pub person_id: Option<Uuid>,
    pub doc: JsonValue,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Canonical store of persons and fact records. Every write is an atomic
/// upsert keyed by identity or natural key, so concurrent workers never
/// create duplicates.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn ping(&self) -> Result<(), StoreError>;

    async fn find_person(&self, id: Uuid) -> Result<Option<Person>, StoreError>;

    async fn find_person_by_tax_id(&self, tax_id: &str) -> Result<Option<Person>, StoreError>;

    /// Persons with this normalized name born inside the inclusive window,
    /// in insertion order.
    async fn find_persons_by_name(
        &self,
        normalized_name: &str,
        born_from: NaiveDate,
        born_to: NaiveDate,
    ) -> Result<Vec<Person>, StoreError>;

    async fn find_person_by_external_id(
        &self,
        source: &str,
        external_id: &str,
    ) -> Result<Option<Person>, StoreError>;

    /// Persons whose current office is of this type and is held.
    async fn find_current_holders(&self, office_type: OfficeType) -> Result<Vec<Person>, StoreError>;

    /// Applies `patch` to the matching person or inserts a new one. `created_at`
    /// is set only on insert; `updated_at` always.
    async fn upsert_person(
        &self,
        filter: &PersonFilter,
        patch: &PersonPatch,
        now: DateTime<Utc>,
    ) -> Result<PersonUpsert, StoreError>;

    /// Merges the non-null top-level fields of `payload` into the fact stored
    /// under `(family, natural_key)`, inserting it when absent.
    async fn upsert_fact(
        &self,
        family: FactFamily,
        natural_key: &str,
        person_id: Option<Uuid>,
        payload: &JsonValue,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError>;

    async fn find_fact(&self, family: FactFamily, natural_key: &str) -> Result<Option<StoredFact>, StoreError>;

    async fn count_persons(&self) -> Result<u64, StoreError>;

    async fn count_facts(&self, family: FactFamily) -> Result<u64, StoreError>;
}

/// Top-level object of a fact payload with null fields removed.
pub(crate) fn present_fields(family: FactFamily, payload: &JsonValue) -> Result<JsonMap<String, JsonValue>, StoreError> {
    let object = payload
        .as_object()
        .ok_or(StoreError::NotAnObject { family })?;
    Ok(object
        .iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect())
}

pub(crate) fn creation_filter_matches(query: &IdentityQuery, person: &Person) -> bool {
    if query.matches_tax_id(person) {
        return true;
    }
    let name = query.normalized_name();
    !name.is_empty() && person.normalized_name == name && person.birth_date == query.birth_date
}
