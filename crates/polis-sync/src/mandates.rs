//! Store-wide side of the mandate engine: the singleton-office scan.

use chrono::{DateTime, NaiveDate, Utc};
use polis_core::{names_overlap, OfficeType, Person, PersonPatch};
use polis_storage::{DocumentStore, PersonFilter, StoreError};
use tracing::info;
use uuid::Uuid;

/// A current holder of `office_type` whose name overlaps `incoming_name`.
pub async fn sitting_holder(
    store: &dyn DocumentStore,
    office_type: OfficeType,
    incoming_name: &str,
) -> Result<Option<Person>, StoreError> {
    Ok(store
        .find_current_holders(office_type)
        .await?
        .into_iter()
        .find(|p| names_overlap(&p.civil_name, incoming_name)))
}

/// Closes the tenure of every other holder of a singleton office before a new
/// holder is committed. Holders whose name overlaps the incoming one are left
/// alone: they are taken to be the same person.
///
/// Returns the ids of the demoted persons.
pub async fn demote_other_holders(
    store: &dyn DocumentStore,
    office_type: OfficeType,
    incoming_name: &str,
    today: NaiveDate,
    now: DateTime<Utc>,
) -> Result<Vec<Uuid>, StoreError> {
    if office_type != OfficeType::HeadOfState {
        return Ok(Vec::new());
    }

    let mut demoted = Vec::new();
    for holder in store.find_current_holders(office_type).await? {
        if names_overlap(&holder.civil_name, incoming_name) {
            continue;
        }
        let state = holder.mandate().demote_head_of_state(today);
        let restored = state.current.as_ref().map(|o| o.office_type.as_str());
        info!(
            person = %holder.id,
            name = %holder.civil_name,
            restored = restored.unwrap_or("none"),
            "closing previous head-of-state tenure"
        );
        let patch = PersonPatch {
            mandate: Some(state),
            ..Default::default()
        };
        store.upsert_person(&PersonFilter::ById(holder.id), &patch, now).await?;
        demoted.push(holder.id);
    }
    Ok(demoted)
}
