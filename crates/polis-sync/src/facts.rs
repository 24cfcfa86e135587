//! Year-scoped Chamber fact stages: votes, propositions, expenses and event attendance.
//!
//! Legislators are referenced by their Chamber id only, so every stage
//! resolves persons through the [`PersonDirectory`]. Records whose deputy is
//! not in the store yet are counted as unresolved and skipped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use polis_adapters::camara::{
    map_attendance, map_expense, map_proposition, map_tramitation, map_vote, order_authors, Author, Ballot,
    DeputyRef, Event, Many, PropositionDetail, PropositionSummary, RawExpense, RawTramitation, Single, Theme,
    VotingSummary,
};
use polis_adapters::{CamaraConfig, SourceId};
use polis_core::OfficeType;
use polis_storage::{
    collect_adaptive, collect_linked, get_json, AdaptiveOptions, AdaptiveOutcome, CeilingSource, DocumentStore,
    JsonFetch, PageUrl,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dispatch::{dispatch, DispatchOptions, DispatchReport};
use crate::resolver::PersonDirectory;
use crate::writer::write_fact;

/// Query parameter carrying the page number on Chamber listings.
pub const PAGE_PARAM: &str = "pagina";

/// Everything a fact stage needs; shared by its workers.
pub struct FactStageContext {
    pub camara: CamaraConfig,
    pub http: Arc<dyn JsonFetch>,
    pub store: Arc<dyn DocumentStore>,
    pub directory: PersonDirectory,
    pub adaptive: AdaptiveOptions,
    pub enrichment_timeout: Duration,
}

impl FactStageContext {
    pub fn new(camara: CamaraConfig, http: Arc<dyn JsonFetch>, store: Arc<dyn DocumentStore>) -> Self {
        Self {
            camara,
            http,
            directory: PersonDirectory::new(Arc::clone(&store)),
            store,
            adaptive: AdaptiveOptions::default(),
            enrichment_timeout: Duration::from_secs(3),
        }
    }

    pub fn with_adaptive(mut self, adaptive: AdaptiveOptions) -> Self {
        self.adaptive = adaptive;
        self
    }

    pub fn with_enrichment_timeout(mut self, timeout: Duration) -> Self {
        self.enrichment_timeout = timeout;
        self
    }

    async fn deputy(&self, chamber_id: &str) -> Result<Option<Uuid>> {
        Ok(self.directory.lookup(SourceId::Camara, chamber_id).await?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageStats {
    pub ceiling: u32,
    pub ceiling_from_last_link: bool,
    pub pages_with_items: u32,
    pub empty_pages: Vec<u32>,
    pub failed_pages: Vec<u32>,
}

impl PageStats {
    fn of<T>(stage: &str, outcome: &AdaptiveOutcome<T>) -> Self {
        if !outcome.failed_pages.is_empty() {
            warn!(stage, pages = ?outcome.failed_pages, "listing pages failed; their items are missing from this run");
        }
        Self {
            ceiling: outcome.ceiling,
            ceiling_from_last_link: outcome.ceiling_source == CeilingSource::LastLink,
            pages_with_items: outcome.pages_with_items,
            empty_pages: outcome.empty_pages.clone(),
            failed_pages: outcome.failed_pages.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FactStageReport {
    pub dispatch: DispatchReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pages: Option<PageStats>,
    pub written: u64,
    pub unresolved: u64,
}

#[derive(Debug, Default)]
struct Tally {
    written: AtomicU64,
    unresolved: AtomicU64,
}

impl Tally {
    fn wrote(&self) {
        self.written.fetch_add(1, Ordering::Relaxed);
    }

    fn missed(&self, chamber_id: &str) {
        debug!(chamber_id, "deputy not in store; record skipped");
        self.unresolved.fetch_add(1, Ordering::Relaxed);
    }

    fn finish(&self, stage: &str, dispatch: DispatchReport, pages: Option<PageStats>) -> FactStageReport {
        let report = FactStageReport {
            dispatch,
            pages,
            written: self.written.load(Ordering::Relaxed),
            unresolved: self.unresolved.load(Ordering::Relaxed),
        };
        info!(
            stage,
            items = report.dispatch.total,
            failed = report.dispatch.failed,
            written = report.written,
            unresolved = report.unresolved,
            "fact stage finished"
        );
        report
    }
}

async fn collect_pages<T>(ctx: &FactStageContext, stage: &str, listing_url: &str) -> Result<AdaptiveOutcome<T>>
where
    T: DeserializeOwned + Send,
{
    let url = PageUrl::parse(listing_url, PAGE_PARAM).with_context(|| format!("parsing {listing_url}"))?;
    let outcome = collect_adaptive(ctx.http.as_ref(), &url, &ctx.adaptive)
        .await
        .with_context(|| format!("fetching {stage} listing"))?;
    info!(stage, items = outcome.items.len(), ceiling = outcome.ceiling, "listing collected");
    Ok(outcome)
}

/// Optional sub-fetch bounded by `limit`; a failure or timeout yields `None`.
async fn fetch_optional<T: DeserializeOwned>(http: &dyn JsonFetch, url: &str, limit: Duration) -> Option<T> {
    match tokio::time::timeout(limit, get_json::<T, dyn JsonFetch>(http, url)).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(err)) => {
            debug!(%url, %err, "enrichment dropped");
            None
        }
        Err(_) => {
            debug!(%url, ?limit, "enrichment timed out");
            None
        }
    }
}

/// Votings of `year`, then every ballot cast in each voting.
pub async fn sync_votes(ctx: Arc<FactStageContext>, year: i32, options: DispatchOptions) -> Result<FactStageReport> {
    let outcome: AdaptiveOutcome<VotingSummary> = collect_pages(&ctx, "votes", &ctx.camara.votings_url(year)).await?;
    let pages = PageStats::of("votes", &outcome);
    let tally = Arc::new(Tally::default());

    let handler = {
        let tally = Arc::clone(&tally);
        move |voting: VotingSummary| {
            let ctx = Arc::clone(&ctx);
            let tally = Arc::clone(&tally);
            async move {
                let ballots: Many<Ballot> = get_json(ctx.http.as_ref(), &ctx.camara.ballots_url(&voting.id)).await?;
                let now = Utc::now();
                for ballot in &ballots.dados {
                    let chamber_id = ballot.deputado.id.to_string();
                    let Some(person_id) = ctx.deputy(&chamber_id).await? else {
                        tally.missed(&chamber_id);
                        continue;
                    };
                    let vote = map_vote(&voting, ballot, person_id)?;
                    write_fact(ctx.store.as_ref(), &vote, now).await?;
                    tally.wrote();
                }
                Ok::<(), anyhow::Error>(())
            }
        }
    };
    let report = dispatch(outcome.items, &options, |v: &VotingSummary| format!("voting {}", v.id), handler).await;
    Ok(tally.finish("votes", report, Some(pages)))
}

/// Propositions presented in `year` with authorship; tramitation and themes
/// are best-effort under the enrichment timeout.
pub async fn sync_propositions(
    ctx: Arc<FactStageContext>,
    year: i32,
    options: DispatchOptions,
) -> Result<FactStageReport> {
    let outcome: AdaptiveOutcome<PropositionSummary> =
        collect_pages(&ctx, "propositions", &ctx.camara.propositions_url(year)).await?;
    let pages = PageStats::of("propositions", &outcome);
    let tally = Arc::new(Tally::default());

    let handler = {
        let tally = Arc::clone(&tally);
        move |summary: PropositionSummary| {
            let ctx = Arc::clone(&ctx);
            let tally = Arc::clone(&tally);
            async move {
                let http = ctx.http.as_ref();
                let detail = match get_json::<Single<PropositionDetail>, _>(http, &ctx.camara.proposition_url(summary.id)).await {
                    Ok(detail) => Some(detail.dados),
                    Err(err) => {
                        warn!(proposition = summary.id, %err, "detail unavailable; storing listing fields only");
                        None
                    }
                };
                let authors: Many<Author> = get_json(http, &ctx.camara.authors_url(summary.id)).await?;

                let mut author_ids: Vec<Uuid> = Vec::new();
                for author in order_authors(authors.dados) {
                    let Some(chamber_id) = author.deputy_id() else {
                        continue;
                    };
                    match ctx.deputy(&chamber_id).await? {
                        Some(id) if !author_ids.contains(&id) => author_ids.push(id),
                        Some(_) => {}
                        None => tally.missed(&chamber_id),
                    }
                }

                let mut proposition = map_proposition(&summary, detail.as_ref());
                let mut author_ids = author_ids.into_iter();
                proposition.author_id = author_ids.next();
                proposition.coauthor_ids = author_ids.collect();

                let limit = ctx.enrichment_timeout;
                let tramitation_url = ctx.camara.tramitations_url(summary.id);
                let themes_url = ctx.camara.themes_url(summary.id);
                let (tramitation, themes) = tokio::join!(
                    fetch_optional::<Many<RawTramitation>>(http, &tramitation_url, limit),
                    fetch_optional::<Many<Theme>>(http, &themes_url, limit),
                );
                proposition.tramitation = tramitation.map(|t| t.dados.iter().map(map_tramitation).collect());
                proposition.themes = themes.map(|t| t.dados.into_iter().map(|theme| theme.tema).collect());

                write_fact(ctx.store.as_ref(), &proposition, Utc::now()).await?;
                tally.wrote();
                Ok::<(), anyhow::Error>(())
            }
        }
    };
    let report = dispatch(
        outcome.items,
        &options,
        |p: &PropositionSummary| format!("proposition {} {}/{}", p.sigla_tipo, p.numero, p.ano),
        handler,
    )
    .await;
    Ok(tally.finish("propositions", report, Some(pages)))
}

/// Expenses of `year` for every sitting federal deputy with a Chamber id.
pub async fn sync_expenses(ctx: Arc<FactStageContext>, year: i32, options: DispatchOptions) -> Result<FactStageReport> {
    let deputies: Vec<(Uuid, String)> = ctx
        .store
        .find_current_holders(OfficeType::FederalDeputy)
        .await
        .context("listing sitting deputies")?
        .into_iter()
        .filter_map(|p| p.external_ids.get(SourceId::Camara.as_str()).cloned().map(|id| (p.id, id)))
        .collect();
    info!(stage = "expenses", deputies = deputies.len(), "deputies selected");
    let tally = Arc::new(Tally::default());

    let handler = {
        let tally = Arc::clone(&tally);
        move |(person_id, chamber_id): (Uuid, String)| {
            let ctx = Arc::clone(&ctx);
            let tally = Arc::clone(&tally);
            async move {
                let url = ctx.camara.expenses_url(&chamber_id, year);
                let raw: Vec<RawExpense> = collect_linked(ctx.http.as_ref(), &url).await?;
                let now = Utc::now();
                for record in &raw {
                    write_fact(ctx.store.as_ref(), &map_expense(record, person_id), now).await?;
                    tally.wrote();
                }
                Ok::<(), anyhow::Error>(())
            }
        }
    };
    let report = dispatch(deputies, &options, |(_, id): &(Uuid, String)| format!("deputy {id}"), handler).await;
    Ok(tally.finish("expenses", report, None))
}

/// Events of `year`, then the deputies listed as present at each.
pub async fn sync_attendance(
    ctx: Arc<FactStageContext>,
    year: i32,
    options: DispatchOptions,
) -> Result<FactStageReport> {
    let outcome: AdaptiveOutcome<Event> = collect_pages(&ctx, "attendance", &ctx.camara.events_url(year)).await?;
    let pages = PageStats::of("attendance", &outcome);
    let tally = Arc::new(Tally::default());

    let handler = {
        let tally = Arc::clone(&tally);
        move |event: Event| {
            let ctx = Arc::clone(&ctx);
            let tally = Arc::clone(&tally);
            async move {
                let attendees: Many<DeputyRef> =
                    get_json(ctx.http.as_ref(), &ctx.camara.event_attendees_url(event.id)).await?;
                let now = Utc::now();
                for deputy in &attendees.dados {
                    let chamber_id = deputy.id.to_string();
                    let Some(person_id) = ctx.deputy(&chamber_id).await? else {
                        tally.missed(&chamber_id);
                        continue;
                    };
                    write_fact(ctx.store.as_ref(), &map_attendance(&event, person_id)?, now).await?;
                    tally.wrote();
                }
                Ok::<(), anyhow::Error>(())
            }
        }
    };
    let report = dispatch(outcome.items, &options, |e: &Event| format!("event {}", e.id), handler).await;
    Ok(tally.finish("attendance", report, Some(pages)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use polis_core::{FactFamily, IdentityQuery, MandateState, Office, PersonPatch, Proposition, Sphere};
    use polis_storage::{FixtureFetcher, MemoryStore, PersonFilter};
    use serde_json::{json, Value as JsonValue};
    use std::collections::BTreeMap;

    const BASE: &str = "https://camara.test/api/v2";

    fn camara() -> CamaraConfig {
        CamaraConfig {
            base_url: BASE.to_string(),
            ..Default::default()
        }
    }

    fn first_page(listing_url: &str) -> String {
        PageUrl::parse(listing_url, PAGE_PARAM).unwrap().page(1)
    }

    fn single_page(listing_url: &str, rows: JsonValue) -> (String, JsonValue) {
        let page = first_page(listing_url);
        let body = json!({"dados": rows, "links": [{"rel": "last", "href": page.clone()}]});
        (page, body)
    }

    async fn seed_deputy(store: &MemoryStore, chamber_id: &str, name: &str) -> Uuid {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let office = Office::held(
            OfficeType::FederalDeputy,
            Sphere::Federal,
            "SP",
            chrono::NaiveDate::from_ymd_opt(2023, 2, 1).unwrap(),
        );
        let patch = PersonPatch {
            civil_name: Some(name.to_string()),
            mandate: Some(MandateState {
                current: Some(office),
                history: Vec::new(),
            }),
            external_ids: BTreeMap::from([("camara".to_string(), chamber_id.to_string())]),
            ..Default::default()
        };
        store
            .upsert_person(&PersonFilter::Identity(IdentityQuery::new(None, name, None)), &patch, now)
            .await
            .unwrap()
            .id
    }

    fn context(http: FixtureFetcher, store: Arc<MemoryStore>) -> Arc<FactStageContext> {
        Arc::new(FactStageContext::new(camara(), Arc::new(http), store))
    }

    #[tokio::test]
    async fn votes_skip_unknown_deputies_and_failed_ballot_fetches() {
        let store = Arc::new(MemoryStore::new());
        let known = seed_deputy(&store, "100", "Dep Cem").await;

        let cfg = camara();
        let (page, body) = single_page(
            &cfg.votings_url(2024),
            json!([
                {"id": "2265603-43", "data": "2024-03-12", "siglaOrgao": "PLEN", "descricao": "Aprovado"},
                {"id": "2265603-44", "data": "2024-03-12", "siglaOrgao": "PLEN"}
            ]),
        );
        let http = FixtureFetcher::new().with_json(page, body).with_json(
            cfg.ballots_url("2265603-43"),
            json!({"dados": [
                {"tipoVoto": "Sim", "deputado_": {"id": 100, "nome": "Dep Cem"}},
                {"tipoVoto": "Não", "deputado_": {"id": 200, "nome": "Dep Duzentos"}}
            ]}),
        );

        let ctx = context(http, store.clone());
        let report = sync_votes(ctx, 2024, DispatchOptions::new("votes", 2)).await.unwrap();
        assert_eq!(report.dispatch.succeeded, 1);
        assert_eq!(report.dispatch.failed, 1);
        assert_eq!(report.written, 1);
        assert_eq!(report.unresolved, 1);

        let votes = store.facts(FactFamily::Vote).await;
        assert_eq!(votes.len(), 1);
        assert_eq!(votes[0].person_id, Some(known));
        assert_eq!(votes[0].doc["choice"], "YES");
    }

    #[tokio::test]
    async fn slow_enrichment_is_dropped_without_erasing_stored_values() {
        let store = Arc::new(MemoryStore::new());
        let author = seed_deputy(&store, "100", "Dep Cem").await;
        let coauthor = seed_deputy(&store, "300", "Dep Trezentos").await;
        let cfg = camara();
        let (page, body) = single_page(
            &cfg.propositions_url(2024),
            json!([{"id": 42, "siglaTipo": "PL", "numero": 1234, "ano": 2024, "ementa": "Dispõe sobre..."}]),
        );
        let base = || {
            FixtureFetcher::new()
                .with_json(page.clone(), body.clone())
                .with_json(
                    cfg.proposition_url(42),
                    json!({"dados": {"dataApresentacao": "2024-02-01T10:00", "statusProposicao": {"descricaoSituacao": "Aguardando Parecer"}}}),
                )
                .with_json(
                    cfg.authors_url(42),
                    json!({"dados": [
                        {"uri": format!("{BASE}/deputados/300"), "nome": "Dep Trezentos", "ordemAssinatura": 2},
                        {"uri": "https://camara.test/api/v2/orgaos/5", "nome": "Comissão", "ordemAssinatura": 3},
                        {"uri": format!("{BASE}/deputados/100"), "nome": "Dep Cem", "ordemAssinatura": 1}
                    ]}),
                )
                .with_json(
                    cfg.tramitations_url(42),
                    json!({"dados": [{"dataHora": "2024-02-01T10:00", "descricaoTramitacao": "Apresentação", "siglaOrgao": "PLEN"}]}),
                )
        };

        let fast = base().with_json(cfg.themes_url(42), json!({"dados": [{"tema": "Saúde"}]}));
        sync_propositions(context(fast, store.clone()), 2024, DispatchOptions::new("propositions", 1))
            .await
            .unwrap();

        let slow = base()
            .with_json(cfg.themes_url(42), json!({"dados": [{"tema": "Outro"}]}))
            .with_delay(cfg.themes_url(42), Duration::from_millis(200));
        let ctx = Arc::new(
            FactStageContext::new(camara(), Arc::new(slow), store.clone())
                .with_enrichment_timeout(Duration::from_millis(20)),
        );
        let report = sync_propositions(ctx, 2024, DispatchOptions::new("propositions", 1)).await.unwrap();
        assert_eq!(report.written, 1);

        let stored = store.facts(FactFamily::Proposition).await;
        assert_eq!(stored.len(), 1);
        let proposition: Proposition = serde_json::from_value(stored[0].doc.clone()).unwrap();
        assert_eq!(proposition.author_id, Some(author));
        assert_eq!(proposition.coauthor_ids, vec![coauthor]);
        assert_eq!(proposition.themes, Some(vec!["Saúde".to_string()]));
        assert_eq!(proposition.tramitation.map(|t| t.len()), Some(1));
    }

    #[tokio::test]
    async fn expenses_follow_links_for_each_sitting_deputy() {
        let store = Arc::new(MemoryStore::new());
        let person = seed_deputy(&store, "100", "Dep Cem").await;
        let cfg = camara();
        let first = cfg.expenses_url("100", 2024);
        let second = format!("{first}&pagina=2");
        let row = |month: u32, amount: f64| {
            json!({"ano": 2024, "mes": month, "tipoDespesa": "COMBUSTÍVEIS", "valorDocumento": amount,
                   "nomeFornecedor": "Posto", "cnpjCpfFornecedor": "12.345.678/0001-99"})
        };
        let http = FixtureFetcher::new()
            .with_json(
                first.clone(),
                json!({"dados": [row(1, 100.0), row(2, 150.5)], "links": [{"rel": "next", "href": second.clone()}]}),
            )
            .with_json(second, json!({"dados": [row(3, 99.99)], "links": []}));

        let ctx = context(http, store.clone());
        let report = sync_expenses(Arc::clone(&ctx), 2024, DispatchOptions::new("expenses", 4))
            .await
            .unwrap();
        assert_eq!(report.written, 3);
        assert!(report.pages.is_none());

        sync_expenses(ctx, 2024, DispatchOptions::new("expenses", 4)).await.unwrap();
        let expenses = store.facts(FactFamily::Expense).await;
        assert_eq!(expenses.len(), 3);
        assert!(expenses.iter().all(|e| e.person_id == Some(person)));
    }

    #[tokio::test]
    async fn attendance_is_recorded_per_event_and_deputy() {
        let store = Arc::new(MemoryStore::new());
        let person = seed_deputy(&store, "100", "Dep Cem").await;
        let cfg = camara();
        let (page, body) = single_page(
            &cfg.events_url(2024),
            json!([{"id": 7001, "dataHoraInicio": "2024-04-02T14:00", "descricaoTipo": "Sessão Deliberativa"}]),
        );
        let http = FixtureFetcher::new().with_json(page, body).with_json(
            cfg.event_attendees_url(7001),
            json!({"dados": [{"id": 100, "nome": "Dep Cem"}, {"id": 999}]}),
        );

        let report = sync_attendance(context(http, store.clone()), 2024, DispatchOptions::new("attendance", 2))
            .await
            .unwrap();
        assert_eq!((report.written, report.unresolved), (1, 1));
        let stored = store.facts(FactFamily::Attendance).await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].person_id, Some(person));
        assert_eq!(stored[0].doc["present"], true);
        assert_eq!(report.pages.map(|p| p.ceiling_from_last_link), Some(true));
    }

    #[tokio::test]
    async fn listing_failure_fails_the_stage() {
        let store = Arc::new(MemoryStore::new());
        let err = sync_votes(context(FixtureFetcher::new(), store), 2024, DispatchOptions::new("votes", 1))
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("votes listing"));
    }
}
