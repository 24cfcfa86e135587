//! Canonical civic record model shared by every Polis crate.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub mod identity;
pub mod mandate;

pub use identity::{names_overlap, normalize_name, normalize_tax_id, IdentityQuery};
pub use mandate::{MandateState, Transition};

pub const CRATE_NAME: &str = "polis-core";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OfficeType {
    FederalDeputy,
    StateDeputy,
    DistrictDeputy,
    Senator,
    Councilperson,
    Mayor,
    Governor,
    HeadOfState,
}

impl OfficeType {
    pub const ALL: [OfficeType; 8] = [
        OfficeType::FederalDeputy,
        OfficeType::StateDeputy,
        OfficeType::DistrictDeputy,
        OfficeType::Senator,
        OfficeType::Councilperson,
        OfficeType::Mayor,
        OfficeType::Governor,
        OfficeType::HeadOfState,
    ];

    /// Stored representation, identical to the serde form.
    pub fn as_str(&self) -> &'static str {
        match self {
            OfficeType::FederalDeputy => "FEDERAL_DEPUTY",
            OfficeType::StateDeputy => "STATE_DEPUTY",
            OfficeType::DistrictDeputy => "DISTRICT_DEPUTY",
            OfficeType::Senator => "SENATOR",
            OfficeType::Councilperson => "COUNCILPERSON",
            OfficeType::Mayor => "MAYOR",
            OfficeType::Governor => "GOVERNOR",
            OfficeType::HeadOfState => "HEAD_OF_STATE",
        }
    }

    /// Offices that at most one person may hold at a time, system-wide.
    pub fn is_singleton(&self) -> bool {
        matches!(self, OfficeType::HeadOfState)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Sphere {
    Federal,
    State,
    Municipal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Gender {
    #[serde(rename = "M")]
    Male,
    #[serde(rename = "F")]
    Female,
    #[default]
    #[serde(rename = "OTHER")]
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Party {
    pub acronym: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub color: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Contact {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub office: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SocialHandles {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub twitter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instagram: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub facebook: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Salary {
    pub gross: f64,
    pub net: f64,
}

/// An office tenure embedded in a [`Person`]; never stored on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Office {
    pub office_type: OfficeType,
    pub sphere: Sphere,
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub municipality: Option<String>,
    pub start_date: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<NaiveDate>,
    pub currently_held: bool,
}

/// Identity of a tenure inside a person's office list.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OfficeKey {
    pub office_type: OfficeType,
    pub state: String,
    pub start_date: NaiveDate,
}

impl Office {
    pub fn held(office_type: OfficeType, sphere: Sphere, state: impl Into<String>, start_date: NaiveDate) -> Self {
        Self {
            office_type,
            sphere,
            state: state.into(),
            municipality: None,
            start_date,
            end_date: None,
            currently_held: true,
        }
    }

    pub fn key(&self) -> OfficeKey {
        OfficeKey {
            office_type: self.office_type,
            state: self.state.clone(),
            start_date: self.start_date,
        }
    }

    /// Ends the tenure: clears the held flag and fills the end date when absent.
    pub fn closed(mut self, today: NaiveDate) -> Self {
        self.currently_held = false;
        if self.end_date.is_none() {
            self.end_date = Some(today);
        }
        self
    }
}

/// The reconciled record of one real office holder across every source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Person {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tax_id: Option<String>,
    pub display_name: String,
    pub civil_name: String,
    pub normalized_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub birth_date: Option<NaiveDate>,
    #[serde(default)]
    pub gender: Gender,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub party: Option<Party>,
    #[serde(default)]
    pub current_office: Option<Office>,
    #[serde(default)]
    pub office_history: Vec<Office>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo_url: Option<String>,
    #[serde(default)]
    pub contact: Contact,
    #[serde(default)]
    pub social: SocialHandles,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salary: Option<Salary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub education: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub birth_city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub birth_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    #[serde(default)]
    pub external_ids: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Person {
    pub fn new(id: Uuid, civil_name: impl Into<String>, now: DateTime<Utc>) -> Self {
        let civil_name = civil_name.into();
        Self {
            id,
            tax_id: None,
            display_name: civil_name.clone(),
            normalized_name: normalize_name(&civil_name),
            civil_name,
            birth_date: None,
            gender: Gender::Other,
            party: None,
            current_office: None,
            office_history: Vec::new(),
            photo_url: None,
            contact: Contact::default(),
            social: SocialHandles::default(),
            salary: None,
            education: None,
            birth_city: None,
            birth_state: None,
            website: None,
            external_ids: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn mandate(&self) -> MandateState {
        MandateState {
            current: self.current_office.clone(),
            history: self.office_history.clone(),
        }
    }

    pub fn set_mandate(&mut self, state: MandateState) {
        self.current_office = state.current;
        self.office_history = state.history;
    }

    pub fn currently_holds(&self, office_type: OfficeType) -> bool {
        self.current_office
            .as_ref()
            .is_some_and(|o| o.office_type == office_type && o.currently_held)
    }
}

/// Upsert payload for a person: every `Some` field overwrites the stored value.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PersonPatch {
    pub tax_id: Option<String>,
    pub display_name: Option<String>,
    pub civil_name: Option<String>,
    pub birth_date: Option<NaiveDate>,
    pub gender: Option<Gender>,
    pub party: Option<Party>,
    pub mandate: Option<MandateState>,
    pub photo_url: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub office_address: Option<String>,
    pub social: Option<SocialHandles>,
    pub salary: Option<Salary>,
    pub education: Option<String>,
    pub birth_city: Option<String>,
    pub birth_state: Option<String>,
    pub website: Option<String>,
    #[serde(default)]
    pub external_ids: BTreeMap<String, String>,
}

impl PersonPatch {
    /// Applies the present fields and refreshes `updated_at`; `id` and `created_at` are untouched.
    pub fn apply(&self, person: &mut Person, now: DateTime<Utc>) {
        if let Some(v) = &self.tax_id {
            person.tax_id = Some(v.clone());
        }
        if let Some(v) = &self.display_name {
            person.display_name = v.clone();
        }
        if let Some(v) = &self.civil_name {
            person.civil_name = v.clone();
            person.normalized_name = normalize_name(v);
        }
        if let Some(v) = self.birth_date {
            person.birth_date = Some(v);
        }
        if let Some(v) = self.gender {
            person.gender = v;
        }
        if let Some(v) = &self.party {
            person.party = Some(v.clone());
        }
        if let Some(state) = &self.mandate {
            person.set_mandate(state.clone());
        }
        if let Some(v) = &self.photo_url {
            person.photo_url = Some(v.clone());
        }
        if let Some(v) = &self.email {
            person.contact.email = Some(v.clone());
        }
        if let Some(v) = &self.phone {
            person.contact.phone = Some(v.clone());
        }
        if let Some(v) = &self.office_address {
            person.contact.office = Some(v.clone());
        }
        if let Some(v) = &self.social {
            person.social = v.clone();
        }
        if let Some(v) = self.salary {
            person.salary = Some(v);
        }
        if let Some(v) = &self.education {
            person.education = Some(v.clone());
        }
        if let Some(v) = &self.birth_city {
            person.birth_city = Some(v.clone());
        }
        if let Some(v) = &self.birth_state {
            person.birth_state = Some(v.clone());
        }
        if let Some(v) = &self.website {
            person.website = Some(v.clone());
        }
        for (source, external_id) in &self.external_ids {
            person
                .external_ids
                .insert(source.clone(), external_id.clone());
        }
        person.updated_at = now;
    }

    pub fn into_new_person(&self, id: Uuid, now: DateTime<Utc>) -> Person {
        let civil_name = self
            .civil_name
            .clone()
            .or_else(|| self.display_name.clone())
            .unwrap_or_default();
        let mut person = Person::new(id, civil_name, now);
        self.apply(&mut person, now);
        person
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactFamily {
    Expense,
    Vote,
    Proposition,
    Attendance,
}

impl FactFamily {
    pub const ALL: [FactFamily; 4] = [
        FactFamily::Expense,
        FactFamily::Vote,
        FactFamily::Proposition,
        FactFamily::Attendance,
    ];

    /// Name of the record family in the store.
    pub fn collection(&self) -> &'static str {
        match self {
            FactFamily::Expense => "expenses",
            FactFamily::Vote => "votes",
            FactFamily::Proposition => "propositions",
            FactFamily::Attendance => "attendance",
        }
    }
}

/// Source-supplied fields that identify "the same fact" across sync runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NaturalKey(Vec<String>);

impl NaturalKey {
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(parts.into_iter().map(Into::into).collect())
    }

    pub fn parts(&self) -> &[String] {
        &self.0
    }

    /// Stable storage key: SHA-256 over the unit-separator-joined parts.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.0.join("\u{1f}").as_bytes());
        hex::encode(hasher.finalize())
    }
}

pub trait FactRecord: Serialize + DeserializeOwned + Send + Sync {
    const FAMILY: FactFamily;

    fn natural_key(&self) -> NaturalKey;

    /// Person the fact belongs to, when it belongs to exactly one.
    fn person_id(&self) -> Option<Uuid>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expense {
    pub person_id: Uuid,
    pub year: i32,
    pub month: u32,
    pub category: String,
    pub supplier_name: String,
    pub supplier_tax_id: String,
    pub amount: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub net_amount: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_url: Option<String>,
}

impl FactRecord for Expense {
    const FAMILY: FactFamily = FactFamily::Expense;

    fn natural_key(&self) -> NaturalKey {
        let cents = (self.amount * 100.0).round() as i64;
        NaturalKey::new([
            self.person_id.to_string(),
            self.year.to_string(),
            self.month.to_string(),
            self.category.clone(),
            self.supplier_tax_id.clone(),
            cents.to_string(),
        ])
    }

    fn person_id(&self) -> Option<Uuid> {
        Some(self.person_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VoteChoice {
    Yes,
    No,
    Abstention,
    Obstruction,
    Absent,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropositionRef {
    pub source_id: String,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    pub person_id: Uuid,
    pub voting_id: String,
    pub session_date: NaiveDate,
    pub organ_code: String,
    pub choice: VoteChoice,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposition: Option<PropositionRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl FactRecord for Vote {
    const FAMILY: FactFamily = FactFamily::Vote;

    fn natural_key(&self) -> NaturalKey {
        NaturalKey::new([
            self.person_id.to_string(),
            self.voting_id.clone(),
            self.session_date.to_string(),
            self.organ_code.clone(),
        ])
    }

    fn person_id(&self) -> Option<Uuid> {
        Some(self.person_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PropositionStatus {
    InProgress,
    Approved,
    Rejected,
    Archived,
    Withdrawn,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TramitationStep {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,
    pub description: String,
    pub organ: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposition {
    pub source_id: String,
    pub kind: String,
    pub number: u32,
    pub year: i32,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_id: Option<Uuid>,
    #[serde(default)]
    pub coauthor_ids: Vec<Uuid>,
    pub status: PropositionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presented_on: Option<NaiveDate>,
    /// `None` when the enrichment fetch did not finish in time; stored values are kept.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub themes: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tramitation: Option<Vec<TramitationStep>>,
}

impl FactRecord for Proposition {
    const FAMILY: FactFamily = FactFamily::Proposition;

    fn natural_key(&self) -> NaturalKey {
        NaturalKey::new([
            self.kind.clone(),
            self.number.to_string(),
            self.year.to_string(),
        ])
    }

    fn person_id(&self) -> Option<Uuid> {
        self.author_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attendance {
    pub person_id: Uuid,
    pub event_id: String,
    pub date: NaiveDate,
    pub session_kind: String,
    pub present: bool,
}

impl FactRecord for Attendance {
    const FAMILY: FactFamily = FactFamily::Attendance;

    fn natural_key(&self) -> NaturalKey {
        NaturalKey::new([self.person_id.to_string(), self.event_id.clone()])
    }

    fn person_id(&self) -> Option<Uuid> {
        Some(self.person_id)
    }
}

/// Overwrites top-level fields of `stored` with every non-null field of `payload`.
pub fn merge_present_fields(stored: &mut JsonMap<String, JsonValue>, payload: &JsonMap<String, JsonValue>) {
    for (field, value) in payload {
        if value.is_null() {
            continue;
        }
        stored.insert(field.clone(), value.clone());
    }
}
