//! In-process [`DocumentStore`], used by tests and `POLIS_STORE=memory` dry runs.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use polis_core::{merge_present_fields, FactFamily, OfficeType, Person, PersonPatch};
use serde_json::Value as JsonValue;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::store::{creation_filter_matches, present_fields};
use crate::{DocumentStore, PersonFilter, PersonUpsert, StoreError, StoredFact, UpsertOutcome};

#[derive(Debug, Default)]
struct MemoryState {
    persons: Vec<Person>,
    facts: BTreeMap<(FactFamily, String), StoredFact>,
}

/// Writes take the lock for the whole read-modify-write, which makes each
/// upsert atomic the same way a database transaction would.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn persons(&self) -> Vec<Person> {
        self.state.read().await.persons.clone()
    }

    pub async fn facts(&self, family: FactFamily) -> Vec<StoredFact> {
        self.state
            .read()
            .await
            .facts
            .values()
            .filter(|f| f.family == family)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn find_person(&self, id: Uuid) -> Result<Option<Person>, StoreError> {
        let state = self.state.read().await;
        Ok(state.persons.iter().find(|p| p.id == id).cloned())
    }

    async fn find_person_by_tax_id(&self, tax_id: &str) -> Result<Option<Person>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .persons
            .iter()
            .find(|p| p.tax_id.as_deref() == Some(tax_id))
            .cloned())
    }

    async fn find_persons_by_name(
        &self,
        normalized_name: &str,
        born_from: NaiveDate,
        born_to: NaiveDate,
    ) -> Result<Vec<Person>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .persons
            .iter()
            .filter(|p| p.normalized_name == normalized_name)
            .filter(|p| p.birth_date.is_some_and(|b| b >= born_from && b <= born_to))
            .cloned()
            .collect())
    }

    async fn find_person_by_external_id(
        &self,
        source: &str,
        external_id: &str,
    ) -> Result<Option<Person>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .persons
            .iter()
            .find(|p| p.external_ids.get(source).map(String::as_str) == Some(external_id))
            .cloned())
    }

    async fn find_current_holders(&self, office_type: OfficeType) -> Result<Vec<Person>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .persons
            .iter()
            .filter(|p| p.currently_holds(office_type))
            .cloned()
            .collect())
    }

    async fn upsert_person(
        &self,
        filter: &PersonFilter,
        patch: &PersonPatch,
        now: DateTime<Utc>,
    ) -> Result<PersonUpsert, StoreError> {
        let mut state = self.state.write().await;
        let position = match filter {
            PersonFilter::ById(id) => state.persons.iter().position(|p| p.id == *id),
            PersonFilter::Identity(query) => state
                .persons
                .iter()
                .position(|p| creation_filter_matches(query, p)),
        };

        if let Some(index) = position {
            let person = &mut state.persons[index];
            patch.apply(person, now);
            return Ok(PersonUpsert {
                id: person.id,
                inserted: false,
            });
        }

        let id = match filter {
            PersonFilter::ById(id) => *id,
            PersonFilter::Identity(_) => Uuid::new_v4(),
        };
        state.persons.push(patch.into_new_person(id, now));
        Ok(PersonUpsert { id, inserted: true })
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
        let mut state = self.state.write().await;
        let slot = (family, natural_key.to_string());

        if let Some(existing) = state.facts.get_mut(&slot) {
            if let JsonValue::Object(stored) = &mut existing.doc {
                merge_present_fields(stored, &fields);
            } else {
                existing.doc = JsonValue::Object(fields);
            }
            if person_id.is_some() {
                existing.person_id = person_id;
            }
            existing.updated_at = now;
            return Ok(UpsertOutcome { inserted: false });
        }

        state.facts.insert(
            slot,
            StoredFact {
                family,
                natural_key: natural_key.to_string(),
                person_id,
                doc: JsonValue::Object(fields),
                created_at: now,
                updated_at: now,
            },
        );
        Ok(UpsertOutcome { inserted: true })
    }

    async fn find_fact(&self, family: FactFamily, natural_key: &str) -> Result<Option<StoredFact>, StoreError> {
        let state = self.state.read().await;
        Ok(state.facts.get(&(family, natural_key.to_string())).cloned())
    }

    async fn count_persons(&self) -> Result<u64, StoreError> {
        Ok(self.state.read().await.persons.len() as u64)
    }

    async fn count_facts(&self, family: FactFamily) -> Result<u64, StoreError> {
        let state = self.state.read().await;
        Ok(state.facts.keys().filter(|(f, _)| *f == family).count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use polis_core::IdentityQuery;
    use serde_json::json;
    use std::sync::Arc;

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, hour, 0, 0).single().unwrap()
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn patch(name: &str, born: Option<NaiveDate>) -> PersonPatch {
        PersonPatch {
            civil_name: Some(name.to_string()),
            display_name: Some(name.to_string()),
            birth_date: born,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn identity_filter_inserts_once_then_updates() {
        let store = MemoryStore::new();
        let query = IdentityQuery::new(None, "Ana Souza", Some(date(1970, 5, 10)));
        let filter = PersonFilter::Identity(query);

        let first = store
            .upsert_person(&filter, &patch("Ana Souza", Some(date(1970, 5, 10))), ts(1))
            .await
            .unwrap();
        let second = store
            .upsert_person(&filter, &patch("Ana Souza", Some(date(1970, 5, 10))), ts(2))
            .await
            .unwrap();

        assert!(first.inserted);
        assert!(!second.inserted);
        assert_eq!(first.id, second.id);
        let person = store.find_person(first.id).await.unwrap().unwrap();
        assert_eq!(person.created_at, ts(1));
        assert_eq!(person.updated_at, ts(2));
        assert_eq!(store.count_persons().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn persons_without_birth_date_collapse_on_exact_name() {
        let store = MemoryStore::new();
        let filter = PersonFilter::Identity(IdentityQuery::new(None, "Sem Data", None));
        store.upsert_person(&filter, &patch("Sem Data", None), ts(1)).await.unwrap();
        store.upsert_person(&filter, &patch("Sem Data", None), ts(2)).await.unwrap();
        assert_eq!(store.count_persons().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn name_lookup_keeps_insertion_order_and_window() {
        let store = MemoryStore::new();
        for born in [date(1970, 5, 11), date(1970, 5, 9), date(1970, 5, 20)] {
            let filter = PersonFilter::Identity(IdentityQuery::new(None, "Ana Souza", Some(born)));
            store.upsert_person(&filter, &patch("Ana Souza", Some(born)), ts(1)).await.unwrap();
        }
        let hits = store
            .find_persons_by_name("ANA SOUZA", date(1970, 5, 9), date(1970, 5, 11))
            .await
            .unwrap();
        assert_eq!(
            hits.iter().map(|p| p.birth_date.unwrap()).collect::<Vec<_>>(),
            vec![date(1970, 5, 11), date(1970, 5, 9)]
        );
    }

    #[tokio::test]
    async fn fact_upsert_merges_present_fields_and_keeps_created_at() {
        let store = MemoryStore::new();
        let person_id = Uuid::new_v4();
        store
            .upsert_fact(
                FactFamily::Proposition,
                "k1",
                Some(person_id),
                &json!({"summary": "a", "themes": ["Saúde"]}),
                ts(1),
            )
            .await
            .unwrap();
        let outcome = store
            .upsert_fact(FactFamily::Proposition, "k1", None, &json!({"summary": "b", "themes": null}), ts(2))
            .await
            .unwrap();
        assert!(!outcome.inserted);

        let fact = store.find_fact(FactFamily::Proposition, "k1").await.unwrap().unwrap();
        assert_eq!(fact.doc, json!({"summary": "b", "themes": ["Saúde"]}));
        assert_eq!(fact.person_id, Some(person_id));
        assert_eq!(fact.created_at, ts(1));
        assert_eq!(fact.updated_at, ts(2));
        assert_eq!(store.count_facts(FactFamily::Proposition).await.unwrap(), 1);
        assert_eq!(store.count_facts(FactFamily::Vote).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn fact_payload_must_be_an_object() {
        let store = MemoryStore::new();
        let err = store
            .upsert_fact(FactFamily::Vote, "k", None, &json!([1, 2]), ts(1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotAnObject { family: FactFamily::Vote }));
    }

    #[tokio::test]
    async fn concurrent_fact_upserts_never_duplicate() {
        let store = Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for worker in 0..16u32 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .upsert_fact(FactFamily::Attendance, "same", None, &json!({"worker": worker}), ts(1))
                    .await
                    .unwrap()
            }));
        }
        let mut inserted = 0;
        for handle in handles {
            if handle.await.unwrap().inserted {
                inserted += 1;
            }
        }
        assert_eq!(inserted, 1);
        assert_eq!(store.count_facts(FactFamily::Attendance).await.unwrap(), 1);
    }
}
