//! Upsert writer: resolves identity, folds the observed office into the
//! mandate, and writes persons and fact records idempotently.

use chrono::{DateTime, NaiveDate, Utc};
use polis_adapters::PersonObservation;
use polis_core::FactRecord;
use polis_storage::{DocumentStore, PersonFilter, PersonUpsert, StoreError, UpsertOutcome};
use tracing::debug;

use crate::mandates::{demote_other_holders, sitting_holder};
use crate::resolver::resolve;

/// Writes one person observation.
///
/// For a singleton office (head of state) other sitting holders are demoted
/// first, and a sitting holder whose name overlaps the incoming one is
/// preferred over ordinary resolution.
pub async fn write_observation(
    store: &dyn DocumentStore,
    observation: PersonObservation,
    today: NaiveDate,
    now: DateTime<Utc>,
) -> Result<PersonUpsert, StoreError> {
    let PersonObservation {
        source,
        external_id,
        identity,
        mut patch,
        office,
    } = observation;
    let singleton = office.office_type.is_singleton();

    if singleton && office.currently_held {
        demote_other_holders(store, office.office_type, &identity.civil_name, today, now).await?;
    }

    let existing = if singleton {
        match sitting_holder(store, office.office_type, &identity.civil_name).await? {
            Some(person) => Some(person),
            None => resolve(store, &identity).await?,
        }
    } else {
        resolve(store, &identity).await?
    };

    let base = existing.as_ref().map(|p| p.mandate()).unwrap_or_default();
    patch.mandate = Some(base.observe(office, today));
    if let Some(id) = external_id {
        patch.external_ids.entry(source.as_str().to_string()).or_insert(id);
    }

    let filter = match &existing {
        Some(person) => PersonFilter::ById(person.id),
        None => PersonFilter::Identity(identity),
    };
    let written = store.upsert_person(&filter, &patch, now).await?;
    debug!(person = %written.id, inserted = written.inserted, source = source.as_str(), "person written");
    Ok(written)
}

/// Upserts a fact under the SHA-256 digest of its natural key.
pub async fn write_fact<F: FactRecord>(
    store: &dyn DocumentStore,
    fact: &F,
    now: DateTime<Utc>,
) -> Result<UpsertOutcome, StoreError> {
    let natural_key = fact.natural_key().digest();
    let payload = serde_json::to_value(fact)?;
    store
        .upsert_fact(F::FAMILY, &natural_key, fact.person_id(), &payload, now)
        .await
}
