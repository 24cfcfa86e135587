//! Source adapter contracts plus the per-source schemas and canonical mappings.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use polis_core::{Gender, IdentityQuery, Office, PersonPatch, SocialHandles};
use polis_storage::{FetchError, JsonFetch};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod camara;
pub mod executive;
pub mod palette;
pub mod senado;

pub use camara::{CamaraConfig, CamaraDeputies};
pub use executive::{ExecutiveRoster, ExecutiveSource, RosterEntry};
pub use palette::{PartyPalette, RuleTables, SalaryTable, DEFAULT_PARTY_COLOR};
pub use senado::{SenadoConfig, SenadoSenators};

pub const CRATE_NAME: &str = "polis-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceId {
    Camara,
    Senado,
    Executive,
}

impl SourceId {
    /// Key used in a person's external-id map.
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceId::Camara => "camara",
            SourceId::Senado => "senado",
            SourceId::Executive => "executive",
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("{source_id:?} record {record} is missing {field}")]
    MissingField {
        source_id: SourceId,
        record: String,
        field: &'static str,
    },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// One source's view of a person holding (or having held) one office.
#[derive(Debug, Clone, PartialEq)]
pub struct PersonObservation {
    pub source: SourceId,
    pub external_id: Option<String>,
    pub identity: IdentityQuery,
    /// Attribute overwrites; the mandate is filled in by the sync stage.
    pub patch: PersonPatch,
    pub office: Office,
}

impl PersonObservation {
    pub fn describe(&self) -> String {
        match &self.external_id {
            Some(id) => format!("{}:{} {}", self.source.as_str(), id, self.identity.civil_name),
            None => format!("{} {}", self.source.as_str(), self.identity.civil_name),
        }
    }
}

/// A source of office holders: a listing call plus a per-entry detail step.
#[async_trait]
pub trait PersonSource: Send + Sync {
    type Listing: Send + Sync + 'static;

    fn source_id(&self) -> SourceId;

    fn describe(&self, entry: &Self::Listing) -> String;

    async fn fetch_listing(&self, http: &dyn JsonFetch) -> Result<Vec<Self::Listing>, AdapterError>;

    async fn fetch_detail(
        &self,
        http: &dyn JsonFetch,
        entry: &Self::Listing,
    ) -> Result<PersonObservation, AdapterError>;
}

/// Accepts the date shapes the government APIs emit; anything else is `None`.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    for format in ["%Y-%m-%d", "%d/%m/%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(raw, format) {
            return Some(date);
        }
    }
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(ts.date());
        }
    }
    DateTime::parse_from_rfc3339(raw).ok().map(|ts| ts.date_naive())
}

pub fn map_gender(raw: &str) -> Gender {
    match raw.trim().to_uppercase().as_str() {
        "M" | "MASCULINO" => Gender::Male,
        "F" | "FEMININO" => Gender::Female,
        _ => Gender::Other,
    }
}

fn host_and_path(url: &str) -> (String, Vec<String>) {
    let lower = url.trim().to_lowercase();
    let without_scheme = lower.split("://").last().unwrap_or_default();
    let without_query = without_scheme.split(['?', '#']).next().unwrap_or_default();
    let mut parts = without_query.split('/');
    let host = parts.next().unwrap_or_default();
    let host = host.strip_prefix("www.").unwrap_or(host).to_string();
    let segments = parts.filter(|s| !s.is_empty()).map(str::to_string).collect();
    (host, segments)
}

/// Picks twitter/instagram handles (`@name`) and the facebook page name out of profile URLs.
pub fn map_social(urls: &[String]) -> SocialHandles {
    let mut handles = SocialHandles::default();
    for url in urls {
        let (host, segments) = host_and_path(url);
        let Some(last) = segments.last() else {
            continue;
        };
        match host.as_str() {
            "twitter.com" | "mobile.twitter.com" | "x.com" => handles.twitter = Some(format!("@{last}")),
            "instagram.com" => handles.instagram = Some(format!("@{last}")),
            "facebook.com" | "m.facebook.com" | "pt-br.facebook.com" => handles.facebook = Some(last.clone()),
            _ => {}
        }
    }
    handles
}

pub(crate) fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
