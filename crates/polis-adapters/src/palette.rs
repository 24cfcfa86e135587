//! Immutable lookup tables loaded once per run: party colors and reference salaries.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use polis_core::{OfficeType, Party, Salary};
use serde::Deserialize;

pub const DEFAULT_PARTY_COLOR: &str = "#666666";

#[derive(Debug, Clone, Deserialize)]
struct PartiesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default = "default_color")]
    default_color: String,
    #[serde(default)]
    parties: Vec<PartyRule>,
}

#[derive(Debug, Clone, Deserialize)]
struct PartyRule {
    acronym: String,
    color: String,
    #[serde(default)]
    name: Option<String>,
}

fn default_color() -> String {
    DEFAULT_PARTY_COLOR.to_string()
}

/// Acronym → color. Lookups are case-insensitive; unknown acronyms get the default color.
#[derive(Debug, Clone)]
pub struct PartyPalette {
    default_color: String,
    entries: BTreeMap<String, PartyRule>,
}

impl Default for PartyPalette {
    fn default() -> Self {
        Self {
            default_color: default_color(),
            entries: BTreeMap::new(),
        }
    }
}

impl PartyPalette {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let file: PartiesFile = serde_yaml::from_str(text).context("parsing party palette")?;
        let entries = file
            .parties
            .into_iter()
            .map(|rule| (rule.acronym.to_uppercase(), rule))
            .collect();
        Ok(Self {
            default_color: file.default_color,
            entries,
        })
    }

    pub fn color(&self, acronym: &str) -> &str {
        self.entries
            .get(&acronym.trim().to_uppercase())
            .map(|rule| rule.color.as_str())
            .unwrap_or(&self.default_color)
    }

    /// `None` for a blank acronym.
    pub fn party(&self, acronym: &str) -> Option<Party> {
        let acronym = acronym.trim();
        if acronym.is_empty() {
            return None;
        }
        let name = self
            .entries
            .get(&acronym.to_uppercase())
            .and_then(|rule| rule.name.clone());
        Some(Party {
            acronym: acronym.to_string(),
            name,
            color: self.color(acronym).to_string(),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
struct SalariesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    salaries: Vec<SalaryRule>,
}

#[derive(Debug, Clone, Deserialize)]
struct SalaryRule {
    office_type: OfficeType,
    gross: f64,
    net: f64,
}

/// Reference salary per office type; absent entries mean "no salary info".
#[derive(Debug, Clone, Default)]
pub struct SalaryTable {
    entries: BTreeMap<OfficeType, Salary>,
}

impl SalaryTable {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let file: SalariesFile = serde_yaml::from_str(text).context("parsing salary table")?;
        Ok(Self {
            entries: file
                .salaries
                .into_iter()
                .map(|rule| {
                    (
                        rule.office_type,
                        Salary {
                            gross: rule.gross,
                            net: rule.net,
                        },
                    )
                })
                .collect(),
        })
    }

    pub fn for_office(&self, office_type: OfficeType) -> Option<Salary> {
        self.entries.get(&office_type).copied()
    }
}

/// Every table an adapter consults while mapping records.
#[derive(Debug, Clone, Default)]
pub struct RuleTables {
    pub parties: PartyPalette,
    pub salaries: SalaryTable,
}

impl RuleTables {
    pub fn from_workspace_root(root: &Path) -> Result<Self> {
        let rules_dir = root.join("rules");
        let parties = PartyPalette::from_yaml_str(
            &std::fs::read_to_string(rules_dir.join("parties.yaml")).context("reading rules/parties.yaml")?,
        )?;
        let salaries = SalaryTable::from_yaml_str(
            &std::fs::read_to_string(rules_dir.join("salaries.yaml")).context("reading rules/salaries.yaml")?,
        )?;
        Ok(Self { parties, salaries })
    }
}
