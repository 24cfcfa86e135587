//! Entity resolution: maps an incoming identity onto an existing canonical person.

use std::collections::HashMap;
use std::sync::Arc;

use polis_adapters::SourceId;
use polis_core::{IdentityQuery, Person};
use polis_storage::{DocumentStore, StoreError};
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

/// Exact tax id first, then exact normalized name with the birth date inside
/// a ±1 day window. `None` means the caller should create a new person.
///
/// Several name matches are resolved to the earliest-inserted one.
pub async fn resolve(store: &dyn DocumentStore, query: &IdentityQuery) -> Result<Option<Person>, StoreError> {
    if let Some(tax_id) = &query.tax_id {
        if let Some(person) = store.find_person_by_tax_id(tax_id).await? {
            return Ok(Some(person));
        }
    }

    let Some((from, to)) = query.birth_window() else {
        return Ok(None);
    };
    let mut hits = store.find_persons_by_name(&query.normalized_name(), from, to).await?;
    hits.retain(|p| query.matches_name_and_birth(p));
    if hits.len() > 1 {
        warn!(
            name = %query.civil_name,
            candidates = hits.len(),
            chosen = %hits[0].id,
            "ambiguous identity; taking the first match"
        );
    }
    Ok(if hits.is_empty() { None } else { Some(hits.swap_remove(0)) })
}

/// Source id → canonical person id, cached for the lifetime of one stage.
///
/// Fact families reference legislators only by their source id; a miss is
/// cached too so an unknown id costs a single store lookup.
pub struct PersonDirectory {
    store: Arc<dyn DocumentStore>,
    cache: RwLock<HashMap<(SourceId, String), Option<Uuid>>>,
}

impl PersonDirectory {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub async fn lookup(&self, source: SourceId, external_id: &str) -> Result<Option<Uuid>, StoreError> {
        let key = (source, external_id.to_string());
        if let Some(hit) = self.cache.read().await.get(&key) {
            return Ok(*hit);
        }
        let found = self
            .store
            .find_person_by_external_id(source.as_str(), external_id)
            .await?
            .map(|p| p.id);
        self.cache.write().await.insert(key, found);
        Ok(found)
    }

    pub async fn cached(&self) -> usize {
        self.cache.read().await.len()
    }
}
