//! Person stages: one listing call per source, then detail + upsert per entry.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use polis_adapters::PersonSource;
use polis_storage::{DocumentStore, JsonFetch};
use tracing::info;

use crate::dispatch::{dispatch, DispatchOptions, DispatchReport};
use crate::writer::write_observation;

/// Fetches the listing, then runs detail + upsert for every entry on the
/// worker pool. Only a failed listing fails the stage.
pub async fn sync_persons<S>(
    source: Arc<S>,
    http: Arc<dyn JsonFetch>,
    store: Arc<dyn DocumentStore>,
    options: DispatchOptions,
) -> Result<DispatchReport>
where
    S: PersonSource + 'static,
{
    let source_id = source.source_id();
    let listing = source
        .fetch_listing(http.as_ref())
        .await
        .with_context(|| format!("fetching {} listing", source_id.as_str()))?;
    info!(source = source_id.as_str(), count = listing.len(), "listing collected");

    let describe = {
        let source = Arc::clone(&source);
        move |entry: &S::Listing| source.describe(entry)
    };
    let report = dispatch(listing, &options, describe, move |entry| {
        let source = Arc::clone(&source);
        let http = Arc::clone(&http);
        let store = Arc::clone(&store);
        async move {
            let observation = source.fetch_detail(http.as_ref(), &entry).await?;
            let now = Utc::now();
            write_observation(store.as_ref(), observation, now.date_naive(), now).await?;
            Ok::<(), anyhow::Error>(())
        }
    })
    .await;

    info!(
        source = source_id.as_str(),
        succeeded = report.succeeded,
        failed = report.failed,
        skipped = report.skipped,
        "person stage finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use polis_adapters::{ExecutiveRoster, ExecutiveSource, RuleTables};
    use polis_core::OfficeType;
    use polis_storage::{FixtureFetcher, MemoryStore};

    #[tokio::test]
    async fn roster_stage_writes_every_entry_and_is_idempotent() {
        let roster = ExecutiveRoster::from_yaml_str(
            "version: 1\ngovernors:\n  - display_name: Gov A\n    civil_name: Governadora A\n    jurisdiction: MG\n    start_date: 2023-01-01\n    birth_date: 1970-01-01\n  - display_name: Gov B\n    civil_name: Governador B\n    jurisdiction: SP\n    start_date: 2023-01-01\n    birth_date: 1965-05-05\n",
        )
        .unwrap();
        let source = Arc::new(ExecutiveSource::governors(&roster, Arc::new(RuleTables::default())));
        let store = Arc::new(MemoryStore::new());
        let http: Arc<dyn JsonFetch> = Arc::new(FixtureFetcher::new());

        for _ in 0..2 {
            let report = sync_persons(
                Arc::clone(&source),
                Arc::clone(&http),
                store.clone(),
                DispatchOptions::new("governors", 2),
            )
            .await
            .unwrap();
            assert_eq!(report.succeeded, 2);
        }

        assert_eq!(store.count_persons().await.unwrap(), 2);
        let holders = store.find_current_holders(OfficeType::Governor).await.unwrap();
        assert_eq!(holders.len(), 2);
        assert!(holders.iter().all(|p| p.office_history.is_empty()));
    }
}
