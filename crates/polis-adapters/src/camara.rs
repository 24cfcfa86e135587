//! Chamber of Deputies open-data API (`dadosabertos.camara.leg.br/api/v2`).
//!
//! Wire types mirror the API's camelCase JSON; the `map_*` functions are pure
//! conversions into canonical records so they can be tested without network.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use polis_core::{
    normalize_tax_id, Attendance, Expense, IdentityQuery, Office, OfficeType, PersonPatch, Proposition,
    PropositionRef, PropositionStatus, Sphere, TramitationStep, Vote, VoteChoice,
};
use polis_storage::{collect_linked, get_json, JsonFetch};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::palette::RuleTables;
use crate::{map_gender, map_social, non_empty, parse_date, AdapterError, PersonObservation, PersonSource, SourceId};

pub const DEFAULT_BASE_URL: &str = "https://dadosabertos.camara.leg.br/api/v2";
/// Situation text of a deputy currently in office.
pub const IN_OFFICE: &str = "Exercício";

#[derive(Debug, Clone)]
pub struct CamaraConfig {
    pub base_url: String,
    pub legislature: u32,
    pub page_size: u32,
}

impl Default for CamaraConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            legislature: 57,
            page_size: 100,
        }
    }
}

impl CamaraConfig {
    fn base(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }

    pub fn deputies_url(&self) -> String {
        format!(
            "{}/deputados?idLegislatura={}&itens={}&ordem=ASC&ordenarPor=nome",
            self.base(),
            self.legislature,
            self.page_size
        )
    }

    pub fn deputy_url(&self, id: u64) -> String {
        format!("{}/deputados/{id}", self.base())
    }

    pub fn expenses_url(&self, deputy_id: &str, year: i32) -> String {
        format!(
            "{}/deputados/{deputy_id}/despesas?ano={year}&itens={}&ordem=ASC&ordenarPor=mes",
            self.base(),
            self.page_size
        )
    }

    pub fn votings_url(&self, year: i32) -> String {
        format!(
            "{}/votacoes?dataInicio={year}-01-01&dataFim={year}-12-31&itens={}&ordem=ASC&ordenarPor=dataHoraRegistro",
            self.base(),
            self.page_size
        )
    }

    pub fn ballots_url(&self, voting_id: &str) -> String {
        format!("{}/votacoes/{voting_id}/votos", self.base())
    }

    pub fn propositions_url(&self, year: i32) -> String {
        format!(
            "{}/proposicoes?ano={year}&itens={}&ordem=ASC&ordenarPor=id",
            self.base(),
            self.page_size
        )
    }

    pub fn proposition_url(&self, id: u64) -> String {
        format!("{}/proposicoes/{id}", self.base())
    }

    pub fn authors_url(&self, id: u64) -> String {
        format!("{}/proposicoes/{id}/autores", self.base())
    }

    pub fn tramitations_url(&self, id: u64) -> String {
        format!("{}/proposicoes/{id}/tramitacoes", self.base())
    }

    pub fn themes_url(&self, id: u64) -> String {
        format!("{}/proposicoes/{id}/temas", self.base())
    }

    pub fn events_url(&self, year: i32) -> String {
        format!(
            "{}/eventos?dataInicio={year}-01-01&dataFim={year}-12-31&itens={}&ordem=ASC&ordenarPor=dataHoraInicio",
            self.base(),
            self.page_size
        )
    }

    pub fn event_attendees_url(&self, event_id: u64) -> String {
        format!("{}/eventos/{event_id}/deputados", self.base())
    }
}

/// `{"dados": ...}` wrapper used by every detail endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct Single<T> {
    pub dados: T,
}

/// `{"dados": [...]}` wrapper for unpaged sub-resources.
#[derive(Debug, Clone, Deserialize)]
pub struct Many<T> {
    #[serde(default = "Vec::new")]
    pub dados: Vec<T>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeputySummary {
    pub id: u64,
    #[serde(default)]
    pub nome: Option<String>,
    #[serde(default)]
    pub sigla_partido: Option<String>,
    #[serde(default)]
    pub sigla_uf: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeputyDetail {
    pub id: u64,
    #[serde(default)]
    pub nome_civil: Option<String>,
    #[serde(default)]
    pub cpf: Option<String>,
    #[serde(default)]
    pub sexo: Option<String>,
    #[serde(default)]
    pub url_website: Option<String>,
    #[serde(default)]
    pub rede_social: Option<Vec<String>>,
    #[serde(default)]
    pub data_nascimento: Option<String>,
    #[serde(default)]
    pub uf_nascimento: Option<String>,
    #[serde(default)]
    pub municipio_nascimento: Option<String>,
    #[serde(default)]
    pub escolaridade: Option<String>,
    pub ultimo_status: LatestStatus,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatestStatus {
    #[serde(default)]
    pub nome: Option<String>,
    #[serde(default)]
    pub sigla_partido: Option<String>,
    #[serde(default)]
    pub sigla_uf: Option<String>,
    #[serde(default)]
    pub url_foto: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub situacao: Option<String>,
    #[serde(default)]
    pub gabinete: Option<Cabinet>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cabinet {
    #[serde(default)]
    pub predio: Option<String>,
    #[serde(default)]
    pub sala: Option<String>,
    #[serde(default)]
    pub andar: Option<String>,
    #[serde(default)]
    pub telefone: Option<String>,
}

impl Cabinet {
    /// "building, floor, Sala room", or `None` without a building.
    pub fn address(&self) -> Option<String> {
        let building = non_empty(self.predio.as_deref())?;
        let floor = non_empty(self.andar.as_deref()).unwrap_or_default();
        let room = non_empty(self.sala.as_deref()).unwrap_or_default();
        Some(format!("{building}, {floor}, Sala {room}"))
    }
}

fn missing(record: impl Into<String>, field: &'static str) -> AdapterError {
    AdapterError::MissingField {
        source_id: SourceId::Camara,
        record: record.into(),
        field,
    }
}

/// Maps a deputy detail record into a person observation for a federal-deputy office.
pub fn map_deputy(detail: &DeputyDetail, rules: &RuleTables) -> Result<PersonObservation, AdapterError> {
    let status = &detail.ultimo_status;
    let record = detail.id.to_string();

    let state = non_empty(status.sigla_uf.as_deref()).ok_or_else(|| missing(record.clone(), "ultimoStatus.siglaUf"))?;
    let start_date = status
        .data
        .as_deref()
        .and_then(parse_date)
        .ok_or_else(|| missing(record.clone(), "ultimoStatus.data"))?;
    let held = status.situacao.as_deref().map(str::trim) == Some(IN_OFFICE);

    let mut office = Office::held(OfficeType::FederalDeputy, Sphere::Federal, state, start_date);
    office.currently_held = held;

    let display_name = non_empty(status.nome.as_deref());
    let civil_name = non_empty(detail.nome_civil.as_deref())
        .or_else(|| display_name.clone())
        .ok_or_else(|| missing(record.clone(), "nomeCivil"))?;
    let birth_date = detail.data_nascimento.as_deref().and_then(parse_date);
    let tax_id = detail.cpf.as_deref().and_then(normalize_tax_id);

    let mut patch = PersonPatch {
        tax_id: tax_id.clone(),
        display_name,
        civil_name: Some(civil_name.clone()),
        birth_date,
        gender: Some(map_gender(detail.sexo.as_deref().unwrap_or_default())),
        party: status.sigla_partido.as_deref().and_then(|p| rules.parties.party(p)),
        photo_url: non_empty(status.url_foto.as_deref()),
        email: non_empty(status.email.as_deref()),
        social: Some(map_social(detail.rede_social.as_deref().unwrap_or_default())),
        salary: rules.salaries.for_office(OfficeType::FederalDeputy),
        education: non_empty(detail.escolaridade.as_deref()),
        birth_city: non_empty(detail.municipio_nascimento.as_deref()),
        birth_state: non_empty(detail.uf_nascimento.as_deref()),
        website: non_empty(detail.url_website.as_deref()),
        external_ids: BTreeMap::from([(SourceId::Camara.as_str().to_string(), record.clone())]),
        ..Default::default()
    };

    if held {
        if let Some(cabinet) = &status.gabinete {
            patch.office_address = cabinet.address();
            patch.phone = non_empty(cabinet.telefone.as_deref());
        }
    }

    Ok(PersonObservation {
        source: SourceId::Camara,
        external_id: Some(record),
        identity: IdentityQuery::new(tax_id.as_deref(), &civil_name, birth_date),
        patch,
        office,
    })
}

/// Federal deputies of one legislature.
#[derive(Debug, Clone)]
pub struct CamaraDeputies {
    config: CamaraConfig,
    rules: Arc<RuleTables>,
}

impl CamaraDeputies {
    pub fn new(config: CamaraConfig, rules: Arc<RuleTables>) -> Self {
        Self { config, rules }
    }
}

#[async_trait]
impl PersonSource for CamaraDeputies {
    type Listing = DeputySummary;

    fn source_id(&self) -> SourceId {
        SourceId::Camara
    }

    fn describe(&self, entry: &DeputySummary) -> String {
        format!("deputy {} {}", entry.id, entry.nome.as_deref().unwrap_or_default())
    }

    async fn fetch_listing(&self, http: &dyn JsonFetch) -> Result<Vec<DeputySummary>, AdapterError> {
        Ok(collect_linked(http, &self.config.deputies_url()).await?)
    }

    async fn fetch_detail(
        &self,
        http: &dyn JsonFetch,
        entry: &DeputySummary,
    ) -> Result<PersonObservation, AdapterError> {
        let detail: Single<DeputyDetail> = get_json(http, &self.config.deputy_url(entry.id)).await?;
        map_deputy(&detail.dados, &self.rules)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawExpense {
    pub ano: i32,
    pub mes: u32,
    #[serde(default)]
    pub tipo_despesa: Option<String>,
    #[serde(default)]
    pub data_documento: Option<String>,
    #[serde(default)]
    pub valor_documento: f64,
    #[serde(default)]
    pub url_documento: Option<String>,
    #[serde(default)]
    pub nome_fornecedor: Option<String>,
    #[serde(default)]
    pub cnpj_cpf_fornecedor: Option<String>,
    #[serde(default)]
    pub valor_liquido: Option<f64>,
}

pub fn map_expense(raw: &RawExpense, person_id: Uuid) -> Expense {
    Expense {
        person_id,
        year: raw.ano,
        month: raw.mes,
        category: non_empty(raw.tipo_despesa.as_deref()).unwrap_or_default(),
        supplier_name: non_empty(raw.nome_fornecedor.as_deref()).unwrap_or_default(),
        supplier_tax_id: raw
            .cnpj_cpf_fornecedor
            .as_deref()
            .and_then(normalize_tax_id)
            .unwrap_or_default(),
        amount: raw.valor_documento,
        net_amount: raw.valor_liquido,
        document_date: raw.data_documento.as_deref().and_then(parse_date),
        document_url: non_empty(raw.url_documento.as_deref()),
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VotingSummary {
    pub id: String,
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub sigla_orgao: Option<String>,
    #[serde(default)]
    pub descricao: Option<String>,
    /// A label string in listings, an object in some detail payloads.
    #[serde(default)]
    pub proposicao_objeto: Option<JsonValue>,
    #[serde(default)]
    pub uri_proposicao_objeto: Option<String>,
}

impl VotingSummary {
    pub fn proposition(&self) -> Option<PropositionRef> {
        let from_uri = self
            .uri_proposicao_objeto
            .as_deref()
            .and_then(|uri| uri.rsplit('/').next())
            .and_then(|id| non_empty(Some(id)));
        match self.proposicao_objeto.as_ref()? {
            JsonValue::String(label) => Some(PropositionRef {
                source_id: from_uri.unwrap_or_default(),
                label: label.trim().to_string(),
            }),
            JsonValue::Object(obj) => {
                let id = obj.get("id").map(|v| v.to_string().trim_matches('"').to_string());
                let label = format!(
                    "{} {}/{}",
                    obj.get("siglaTipo").and_then(JsonValue::as_str).unwrap_or_default(),
                    obj.get("numero").map(JsonValue::to_string).unwrap_or_default(),
                    obj.get("ano").map(JsonValue::to_string).unwrap_or_default(),
                );
                Some(PropositionRef {
                    source_id: id.or(from_uri).unwrap_or_default(),
                    label,
                })
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeputyRef {
    pub id: u64,
    #[serde(default)]
    pub nome: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ballot {
    #[serde(default)]
    pub tipo_voto: Option<String>,
    #[serde(rename = "deputado_")]
    pub deputado: DeputyRef,
}

pub fn vote_choice(raw: &str) -> VoteChoice {
    match raw.trim().to_lowercase().as_str() {
        "sim" => VoteChoice::Yes,
        "não" | "nao" => VoteChoice::No,
        "abstenção" | "abstencao" => VoteChoice::Abstention,
        "obstrução" | "obstrucao" => VoteChoice::Obstruction,
        "" | "ausente" => VoteChoice::Absent,
        _ => VoteChoice::Other,
    }
}

pub fn map_vote(voting: &VotingSummary, ballot: &Ballot, person_id: Uuid) -> Result<Vote, AdapterError> {
    let session_date = voting
        .data
        .as_deref()
        .and_then(parse_date)
        .ok_or_else(|| missing(voting.id.clone(), "data"))?;
    Ok(Vote {
        person_id,
        voting_id: voting.id.clone(),
        session_date,
        organ_code: non_empty(voting.sigla_orgao.as_deref()).unwrap_or_default(),
        choice: vote_choice(ballot.tipo_voto.as_deref().unwrap_or_default()),
        proposition: voting.proposition(),
        description: non_empty(voting.descricao.as_deref()),
    })
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropositionSummary {
    pub id: u64,
    pub sigla_tipo: String,
    pub numero: u32,
    pub ano: i32,
    #[serde(default)]
    pub ementa: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropositionDetail {
    #[serde(default)]
    pub data_apresentacao: Option<String>,
    #[serde(default)]
    pub status_proposicao: Option<PropositionState>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropositionState {
    #[serde(default)]
    pub descricao_situacao: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Author {
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub nome: Option<String>,
    #[serde(default)]
    pub tipo: Option<String>,
    #[serde(default)]
    pub ordem_assinatura: Option<u32>,
}

impl Author {
    /// Deputy id when the author is a deputy (`.../deputados/{id}`).
    pub fn deputy_id(&self) -> Option<String> {
        let uri = self.uri.as_deref()?;
        let (_, tail) = uri.split_once("/deputados/")?;
        let id = tail.split('/').next()?;
        non_empty(Some(id))
    }
}

/// Authors in signing order; the first is the primary author.
pub fn order_authors(mut authors: Vec<Author>) -> Vec<Author> {
    authors.sort_by_key(|a| a.ordem_assinatura.unwrap_or(u32::MAX));
    authors
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTramitation {
    #[serde(default)]
    pub data_hora: Option<String>,
    #[serde(default)]
    pub descricao_tramitacao: Option<String>,
    #[serde(default)]
    pub sigla_orgao: Option<String>,
}

pub fn map_tramitation(raw: &RawTramitation) -> TramitationStep {
    TramitationStep {
        date: raw.data_hora.as_deref().and_then(parse_date),
        description: non_empty(raw.descricao_tramitacao.as_deref()).unwrap_or_default(),
        organ: non_empty(raw.sigla_orgao.as_deref()).unwrap_or_default(),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Theme {
    #[serde(alias = "nome")]
    pub tema: String,
}

pub fn proposition_status(situation: Option<&str>) -> PropositionStatus {
    let text = situation.unwrap_or_default().to_lowercase();
    if text.contains("arquivad") {
        PropositionStatus::Archived
    } else if text.contains("retirad") {
        PropositionStatus::Withdrawn
    } else if text.contains("rejeitad") {
        PropositionStatus::Rejected
    } else if text.contains("aprovad") || text.contains("transformad") {
        PropositionStatus::Approved
    } else {
        PropositionStatus::InProgress
    }
}

/// Base proposition record; authorship and enrichment are resolved by the caller.
pub fn map_proposition(summary: &PropositionSummary, detail: Option<&PropositionDetail>) -> Proposition {
    let situation = detail
        .and_then(|d| d.status_proposicao.as_ref())
        .and_then(|s| s.descricao_situacao.as_deref());
    Proposition {
        source_id: summary.id.to_string(),
        kind: summary.sigla_tipo.trim().to_string(),
        number: summary.numero,
        year: summary.ano,
        summary: non_empty(summary.ementa.as_deref()).unwrap_or_default(),
        author_id: None,
        coauthor_ids: Vec::new(),
        status: proposition_status(situation),
        presented_on: detail
            .and_then(|d| d.data_apresentacao.as_deref())
            .and_then(parse_date),
        themes: None,
        tramitation: None,
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: u64,
    #[serde(default)]
    pub data_hora_inicio: Option<String>,
    #[serde(default)]
    pub descricao_tipo: Option<String>,
}

/// Attendance of a deputy listed among an event's participants.
pub fn map_attendance(event: &Event, person_id: Uuid) -> Result<Attendance, AdapterError> {
    let date = event
        .data_hora_inicio
        .as_deref()
        .and_then(parse_date)
        .ok_or_else(|| missing(event.id.to_string(), "dataHoraInicio"))?;
    Ok(Attendance {
        person_id,
        event_id: event.id.to_string(),
        date,
        session_kind: non_empty(event.descricao_tipo.as_deref()).unwrap_or_default(),
        present: true,
    })
}
