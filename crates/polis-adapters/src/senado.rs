//! Federal Senate open-data API (`legis.senado.leg.br/dadosabertos`).
//!
//! The Senate nests everything in PascalCase envelopes and collapses
//! single-element lists into bare objects, hence [`OneOrMany`].

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use polis_core::{IdentityQuery, Office, OfficeType, PersonPatch, Sphere};
use polis_storage::{get_json, JsonFetch};
use serde::Deserialize;
use tracing::warn;

use crate::palette::RuleTables;
use crate::{map_gender, non_empty, parse_date, AdapterError, PersonObservation, PersonSource, SourceId};

pub const DEFAULT_BASE_URL: &str = "https://legis.senado.leg.br/dadosabertos";

/// Mandate start assumed when the listing carries no legislature dates.
pub fn default_mandate_start() -> NaiveDate {
    NaiveDate::from_ymd_opt(2023, 2, 1).unwrap_or(NaiveDate::MIN)
}

#[derive(Debug, Clone)]
pub struct SenadoConfig {
    pub base_url: String,
}

impl Default for SenadoConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }
}

impl SenadoConfig {
    pub fn current_list_url(&self) -> String {
        format!("{}/senador/lista/atual.json", self.base_url.trim_end_matches('/'))
    }

    pub fn senator_url(&self, code: &str) -> String {
        format!("{}/senador/{code}.json", self.base_url.trim_end_matches('/'))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

impl<T> Default for OneOrMany<T> {
    fn default() -> Self {
        OneOrMany::Many(Vec::new())
    }
}

impl<T> OneOrMany<T> {
    pub fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::Many(items) => items,
            OneOrMany::One(item) => vec![item],
        }
    }

    pub fn first(&self) -> Option<&T> {
        match self {
            OneOrMany::Many(items) => items.first(),
            OneOrMany::One(item) => Some(item),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CurrentListResponse {
    pub lista_parlamentar_em_exercicio: CurrentList,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CurrentList {
    pub parlamentares: Parliamentarians,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Parliamentarians {
    #[serde(default)]
    pub parlamentar: OneOrMany<SenatorEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SenatorEntry {
    pub identificacao_parlamentar: Identification,
    #[serde(default)]
    pub mandato: Option<Mandate>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Identification {
    pub codigo_parlamentar: String,
    pub nome_parlamentar: String,
    #[serde(default)]
    pub nome_completo_parlamentar: Option<String>,
    #[serde(default)]
    pub sexo_parlamentar: Option<String>,
    #[serde(default)]
    pub url_foto_parlamentar: Option<String>,
    #[serde(default)]
    pub url_pagina_parlamentar: Option<String>,
    #[serde(default)]
    pub email_parlamentar: Option<String>,
    #[serde(default)]
    pub sigla_partido_parlamentar: Option<String>,
    #[serde(default)]
    pub uf_parlamentar: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Mandate {
    #[serde(default)]
    pub uf_parlamentar: Option<String>,
    #[serde(default)]
    pub primeira_legislatura_do_mandato: Option<Legislature>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Legislature {
    #[serde(default)]
    pub data_inicio: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SenatorDetailResponse {
    pub detalhe_parlamentar: DetailEnvelope,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DetailEnvelope {
    pub parlamentar: SenatorDetail,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SenatorDetail {
    #[serde(default)]
    pub dados_basicos_parlamentar: Option<BasicData>,
    #[serde(default)]
    pub telefones: Option<Phones>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BasicData {
    #[serde(default)]
    pub data_nascimento: Option<String>,
    #[serde(default)]
    pub naturalidade: Option<String>,
    #[serde(default)]
    pub uf_naturalidade: Option<String>,
    #[serde(default)]
    pub endereco_parlamentar: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Phones {
    #[serde(default)]
    pub telefone: OneOrMany<Phone>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Phone {
    pub numero_telefone: String,
}

/// Maps a listing entry, plus its detail record when one could be fetched.
/// The listing only carries senators in office, so the office is always held.
pub fn map_senator(
    entry: &SenatorEntry,
    detail: Option<&SenatorDetail>,
    rules: &RuleTables,
) -> Result<PersonObservation, AdapterError> {
    let id = &entry.identificacao_parlamentar;
    let state = non_empty(id.uf_parlamentar.as_deref())
        .or_else(|| entry.mandato.as_ref().and_then(|m| non_empty(m.uf_parlamentar.as_deref())))
        .ok_or_else(|| AdapterError::MissingField {
            source_id: SourceId::Senado,
            record: id.codigo_parlamentar.clone(),
            field: "UfParlamentar",
        })?;
    let start_date = entry
        .mandato
        .as_ref()
        .and_then(|m| m.primeira_legislatura_do_mandato.as_ref())
        .and_then(|l| l.data_inicio.as_deref())
        .and_then(parse_date)
        .unwrap_or_else(default_mandate_start);

    let office = Office::held(OfficeType::Senator, Sphere::Federal, state, start_date);

    let display_name = non_empty(Some(id.nome_parlamentar.as_str()));
    let civil_name = non_empty(id.nome_completo_parlamentar.as_deref())
        .or_else(|| display_name.clone())
        .unwrap_or_default();
    let basics = detail.and_then(|d| d.dados_basicos_parlamentar.as_ref());
    let birth_date = basics
        .and_then(|b| b.data_nascimento.as_deref())
        .and_then(parse_date);

    let patch = PersonPatch {
        display_name,
        civil_name: Some(civil_name.clone()),
        birth_date,
        gender: Some(map_gender(id.sexo_parlamentar.as_deref().unwrap_or_default())),
        party: id
            .sigla_partido_parlamentar
            .as_deref()
            .and_then(|p| rules.parties.party(p)),
        photo_url: non_empty(id.url_foto_parlamentar.as_deref()),
        email: non_empty(id.email_parlamentar.as_deref()),
        office_address: basics.and_then(|b| non_empty(b.endereco_parlamentar.as_deref())),
        phone: detail
            .and_then(|d| d.telefones.as_ref())
            .and_then(|t| t.telefone.first())
            .and_then(|p| non_empty(Some(p.numero_telefone.as_str()))),
        salary: rules.salaries.for_office(OfficeType::Senator),
        birth_city: basics.and_then(|b| non_empty(b.naturalidade.as_deref())),
        birth_state: basics.and_then(|b| non_empty(b.uf_naturalidade.as_deref())),
        website: non_empty(id.url_pagina_parlamentar.as_deref()),
        external_ids: BTreeMap::from([(
            SourceId::Senado.as_str().to_string(),
            id.codigo_parlamentar.clone(),
        )]),
        ..Default::default()
    };

    Ok(PersonObservation {
        source: SourceId::Senado,
        external_id: Some(id.codigo_parlamentar.clone()),
        identity: IdentityQuery::new(None, &civil_name, birth_date),
        patch,
        office,
    })
}

#[derive(Debug, Clone)]
pub struct SenadoSenators {
    config: SenadoConfig,
    rules: Arc<RuleTables>,
}

impl SenadoSenators {
    pub fn new(config: SenadoConfig, rules: Arc<RuleTables>) -> Self {
        Self { config, rules }
    }
}

#[async_trait]
impl PersonSource for SenadoSenators {
    type Listing = SenatorEntry;

    fn source_id(&self) -> SourceId {
        SourceId::Senado
    }

    fn describe(&self, entry: &SenatorEntry) -> String {
        let id = &entry.identificacao_parlamentar;
        format!("senator {} {}", id.codigo_parlamentar, id.nome_parlamentar)
    }

    async fn fetch_listing(&self, http: &dyn JsonFetch) -> Result<Vec<SenatorEntry>, AdapterError> {
        let response: CurrentListResponse = get_json(http, &self.config.current_list_url()).await?;
        Ok(response
            .lista_parlamentar_em_exercicio
            .parlamentares
            .parlamentar
            .into_vec())
    }

    async fn fetch_detail(
        &self,
        http: &dyn JsonFetch,
        entry: &SenatorEntry,
    ) -> Result<PersonObservation, AdapterError> {
        let code = &entry.identificacao_parlamentar.codigo_parlamentar;
        let detail = match get_json::<SenatorDetailResponse, _>(http, &self.config.senator_url(code)).await {
            Ok(response) => Some(response.detalhe_parlamentar.parlamentar),
            Err(err) => {
                warn!(senator = %code, %err, "senator detail unavailable; mapping listing only");
                None
            }
        };
        map_senator(entry, detail.as_ref(), &self.rules)
    }
}
