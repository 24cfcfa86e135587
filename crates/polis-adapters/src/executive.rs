//! Executive office holders (head of state, governors) from `rosters/executive.yaml`.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use polis_core::{normalize_tax_id, IdentityQuery, Office, OfficeType, PersonPatch, Sphere};
use polis_storage::JsonFetch;
use serde::Deserialize;

use crate::palette::RuleTables;
use crate::{map_gender, non_empty, AdapterError, PersonObservation, PersonSource, SourceId};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecutiveRoster {
    #[allow(dead_code)]
    #[serde(default)]
    version: u32,
    #[serde(default)]
    pub head_of_state: Vec<RosterEntry>,
    #[serde(default)]
    pub governors: Vec<RosterEntry>,
}

fn held_by_default() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RosterEntry {
    pub display_name: String,
    pub civil_name: String,
    #[serde(default)]
    pub tax_id: Option<String>,
    #[serde(default)]
    pub birth_date: Option<NaiveDate>,
    #[serde(default)]
    pub gender: Option<String>,
    #[serde(default)]
    pub party: Option<String>,
    /// "BR" for the head of state, the state code for governors.
    pub jurisdiction: String,
    pub start_date: NaiveDate,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    #[serde(default = "held_by_default")]
    pub currently_held: bool,
    #[serde(default)]
    pub photo_url: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
}

impl ExecutiveRoster {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing executive roster")
    }

    pub fn from_workspace_root(root: &Path) -> Result<Self> {
        let path = root.join("rosters").join("executive.yaml");
        let text = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text)
    }
}

pub fn map_roster_entry(entry: &RosterEntry, office_type: OfficeType, rules: &RuleTables) -> PersonObservation {
    let sphere = if office_type == OfficeType::HeadOfState {
        Sphere::Federal
    } else {
        Sphere::State
    };
    let mut office = Office::held(office_type, sphere, entry.jurisdiction.trim(), entry.start_date);
    office.currently_held = entry.currently_held;
    if !entry.currently_held {
        office.end_date = entry.end_date;
    }

    let tax_id = entry.tax_id.as_deref().and_then(normalize_tax_id);
    let patch = PersonPatch {
        tax_id: tax_id.clone(),
        display_name: non_empty(Some(entry.display_name.as_str())),
        civil_name: Some(entry.civil_name.trim().to_string()),
        birth_date: entry.birth_date,
        gender: Some(map_gender(entry.gender.as_deref().unwrap_or_default())),
        party: entry.party.as_deref().and_then(|p| rules.parties.party(p)),
        photo_url: non_empty(entry.photo_url.as_deref()),
        email: non_empty(entry.email.as_deref()),
        phone: non_empty(entry.phone.as_deref()),
        salary: rules.salaries.for_office(office_type),
        ..Default::default()
    };

    PersonObservation {
        source: SourceId::Executive,
        external_id: None,
        identity: IdentityQuery::new(tax_id.as_deref(), &entry.civil_name, entry.birth_date),
        patch,
        office,
    }
}

/// One executive office type served from the static roster.
#[derive(Debug, Clone)]
pub struct ExecutiveSource {
    office_type: OfficeType,
    entries: Vec<RosterEntry>,
    rules: Arc<RuleTables>,
}

impl ExecutiveSource {
    pub fn head_of_state(roster: &ExecutiveRoster, rules: Arc<RuleTables>) -> Self {
        Self {
            office_type: OfficeType::HeadOfState,
            entries: roster.head_of_state.clone(),
            rules,
        }
    }

    pub fn governors(roster: &ExecutiveRoster, rules: Arc<RuleTables>) -> Self {
        Self {
            office_type: OfficeType::Governor,
            entries: roster.governors.clone(),
            rules,
        }
    }

    pub fn office_type(&self) -> OfficeType {
        self.office_type
    }
}

#[async_trait]
impl PersonSource for ExecutiveSource {
    type Listing = RosterEntry;

    fn source_id(&self) -> SourceId {
        SourceId::Executive
    }

    fn describe(&self, entry: &RosterEntry) -> String {
        format!("{} {}", self.office_type.as_str().to_lowercase(), entry.civil_name)
    }

    async fn fetch_listing(&self, _http: &dyn JsonFetch) -> Result<Vec<RosterEntry>, AdapterError> {
        Ok(self.entries.clone())
    }

    async fn fetch_detail(&self, _http: &dyn JsonFetch, entry: &RosterEntry) -> Result<PersonObservation, AdapterError> {
        Ok(map_roster_entry(entry, self.office_type, &self.rules))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn workspace_root() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..")
    }

    #[test]
    fn shipped_roster_has_a_sitting_head_of_state() {
        let roster = ExecutiveRoster::from_workspace_root(&workspace_root()).unwrap();
        assert_eq!(roster.head_of_state.len(), 1);
        let entry = &roster.head_of_state[0];
        assert!(entry.currently_held);
        assert_eq!(entry.jurisdiction, "BR");
        assert_eq!(entry.birth_date, NaiveDate::from_ymd_opt(1945, 10, 27));
    }

    #[test]
    fn roster_loads_from_a_temp_workspace() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("rosters")).unwrap();
        std::fs::write(
            dir.path().join("rosters/executive.yaml"),
            "version: 1\ngovernors:\n  - display_name: Gov\n    civil_name: Governadora Exemplo\n    jurisdiction: MG\n    start_date: 2023-01-01\n",
        )
        .unwrap();
        let roster = ExecutiveRoster::from_workspace_root(dir.path()).unwrap();
        assert!(roster.head_of_state.is_empty());
        assert_eq!(roster.governors.len(), 1);
        assert!(roster.governors[0].currently_held);
    }

    #[test]
    fn governor_entry_maps_to_state_sphere() {
        let roster = ExecutiveRoster::from_yaml_str(
            "version: 1\ngovernors:\n  - display_name: Gov\n    civil_name: Governadora Exemplo\n    jurisdiction: MG\n    start_date: 2019-01-01\n    end_date: 2022-12-31\n    currently_held: false\n    party: PSD\n",
        )
        .unwrap();
        let obs = map_roster_entry(&roster.governors[0], OfficeType::Governor, &RuleTables::default());
        assert_eq!(obs.office.sphere, Sphere::State);
        assert_eq!(obs.office.state, "MG");
        assert!(!obs.office.currently_held);
        assert_eq!(obs.office.end_date, NaiveDate::from_ymd_opt(2022, 12, 31));
        assert!(obs.external_id.is_none());
        assert!(obs.patch.salary.is_none());
    }
}
