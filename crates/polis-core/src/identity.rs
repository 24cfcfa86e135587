//! Identity attributes and the exact-match predicate used by entity resolution.

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::Person;

/// Birth dates from different sources may drift by a day (timezone/parsing).
pub const BIRTH_DATE_TOLERANCE_DAYS: i64 = 1;

/// Declared identity attributes of an incoming record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityQuery {
    pub tax_id: Option<String>,
    pub civil_name: String,
    pub birth_date: Option<NaiveDate>,
}

impl IdentityQuery {
    pub fn new(tax_id: Option<&str>, civil_name: &str, birth_date: Option<NaiveDate>) -> Self {
        Self {
            tax_id: tax_id.and_then(normalize_tax_id),
            civil_name: civil_name.trim().to_string(),
            birth_date,
        }
    }

    pub fn normalized_name(&self) -> String {
        normalize_name(&self.civil_name)
    }

    /// Inclusive birth-date window, or `None` when name matching is impossible.
    pub fn birth_window(&self) -> Option<(NaiveDate, NaiveDate)> {
        if self.normalized_name().is_empty() {
            return None;
        }
        let born = self.birth_date?;
        let delta = Duration::days(BIRTH_DATE_TOLERANCE_DAYS);
        Some((born - delta, born + delta))
    }

    pub fn matches_tax_id(&self, person: &Person) -> bool {
        match (&self.tax_id, &person.tax_id) {
            (Some(ours), Some(theirs)) => ours == theirs,
            _ => false,
        }
    }

    pub fn matches_name_and_birth(&self, person: &Person) -> bool {
        let Some((from, to)) = self.birth_window() else {
            return false;
        };
        let Some(born) = person.birth_date else {
            return false;
        };
        person.normalized_name == self.normalized_name() && born >= from && born <= to
    }
}

/// Case-folds and collapses whitespace. No fuzzy matching.
pub fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase()
}

/// Keeps the digits of a tax id; `None` when nothing is left.
pub fn normalize_tax_id(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        None
    } else {
        Some(digits)
    }
}

/// Containment heuristic used when demoting a head of state: either normalized
/// name contains the other. Known to misfire on short or common name fragments.
pub fn names_overlap(a: &str, b: &str) -> bool {
    let a = normalize_name(a);
    let b = normalize_name(b);
    if a.is_empty() || b.is_empty() {
        return false;
    }
    a.contains(&b) || b.contains(&a)
}
