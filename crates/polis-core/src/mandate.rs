//! Mandate-history engine: how a person's current and past offices change
//! when a new office observation arrives.
//!
//! Everything here is pure; persistence and the system-wide singleton scan
//! live in the sync crate.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::{Office, OfficeKey, OfficeType};

/// Current office plus insertion-ordered history.
///
/// History behaves as a set keyed by [`OfficeKey`], and no key appears both
/// as current and in history.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MandateState {
    pub current: Option<Office>,
    pub history: Vec<Office>,
}

/// Decision taken by comparing the stored current office with an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// No current office is stored.
    Open,
    /// Same type, jurisdiction and start date.
    Same,
    /// The stored current office must be closed and moved to history.
    Supersede,
}

pub fn transition(stored: Option<&Office>, observed: &Office) -> Transition {
    match stored {
        None => Transition::Open,
        Some(stored) if stored.key() == observed.key() => Transition::Same,
        Some(_) => Transition::Supersede,
    }
}

fn push_unique(history: &mut Vec<Office>, office: Office) -> bool {
    let key = office.key();
    if history.iter().any(|h| h.key() == key) {
        return false;
    }
    history.push(office);
    true
}

impl MandateState {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Applies one office observation.
    pub fn observe(self, observed: Office, today: NaiveDate) -> Self {
        let MandateState {
            mut current,
            mut history,
        } = self;

        match transition(current.as_ref(), &observed) {
            Transition::Supersede => {
                if let Some(previous) = current.take() {
                    push_unique(&mut history, previous.closed(today));
                }
            }
            Transition::Same => {
                if !observed.currently_held {
                    current = None;
                }
            }
            Transition::Open => {}
        }

        if observed.currently_held {
            let mut observed = observed;
            observed.end_date = None;
            let key = observed.key();
            history.retain(|h| h.key() != key);
            current = Some(observed);
        } else {
            push_unique(&mut history, observed.closed(today));
        }

        MandateState { current, history }
    }

    /// Forcibly ends a sitting head-of-state tenure and restores the most
    /// recent other office from history as current, if there is one.
    pub fn demote_head_of_state(self, today: NaiveDate) -> Self {
        let MandateState {
            current,
            mut history,
        } = self;
        let Some(office) = current else {
            return MandateState { current: None, history };
        };
        if office.office_type != OfficeType::HeadOfState {
            return MandateState {
                current: Some(office),
                history,
            };
        }

        push_unique(&mut history, office.closed(today));
        let restored = history
            .iter()
            .rposition(|o| o.office_type != OfficeType::HeadOfState)
            .map(|pos| history.remove(pos));

        MandateState {
            current: restored,
            history,
        }
    }

    /// True when no key repeats across current + history and every held
    /// office has no end date.
    pub fn is_consistent(&self) -> bool {
        let mut seen: Vec<OfficeKey> = Vec::with_capacity(self.history.len() + 1);
        for office in self.current.iter().chain(self.history.iter()) {
            if office.currently_held && office.end_date.is_some() {
                return false;
            }
            let key = office.key();
            if seen.contains(&key) {
                return false;
            }
            seen.push(key);
        }
        true
    }
}
