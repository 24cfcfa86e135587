use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use polis_adapters::{CamaraConfig, ExecutiveRoster, RuleTables, SenadoConfig, SourceId};
use polis_core::{FactFamily, OfficeType, Person, PersonPatch};
use polis_storage::{
    DocumentStore, FixtureFetcher, JsonFetch, MemoryStore, PageUrl, PersonFilter, PersonUpsert, StoreError, StoredFact,
    UpsertOutcome,
};
use polis_sync::{SourceRegistry, Stage, StageStatus, StoreBackend, SyncConfig, SyncPipeline, SyncSelection};
use serde_json::{json, Value as JsonValue};
use uuid::Uuid;

const CAMARA: &str = "https://camara.test/api/v2";
const SENADO: &str = "https://senado.test/dadosabertos";
const YEAR: i32 = 2024;

const REGISTRY: &str = r#"
version: 1
sources:
  - source_id: camara
    display_name: Camara (fixtures)
    base_url: https://camara.test/api/v2
    legislature: 57
    page_size: 100
    fallback_max_pages: 2
    max_pages: 5
    page_retries: 0
    workers:
      persons: 2
      pages: 2
  - source_id: senado
    display_name: Senado (fixtures)
    base_url: https://senado.test/dadosabertos
  - source_id: executive
    display_name: Roster
    workers:
      persons: 1
"#;

fn roster(head_of_state: &str) -> ExecutiveRoster {
    ExecutiveRoster::from_yaml_str(&format!(
        "version: 1\nhead_of_state:\n  - display_name: {head_of_state}\n    civil_name: {head_of_state}\n    jurisdiction: BR\n    start_date: 2023-01-01\ngovernors:\n  - display_name: Gov MG\n    civil_name: Governadora de Minas\n    jurisdiction: MG\n    start_date: 2023-01-01\n    birth_date: 1970-01-01\n"
    ))
    .unwrap()
}

fn config(root: &Path) -> SyncConfig {
    SyncConfig {
        database_url: String::new(),
        store: StoreBackend::Memory,
        max_connections: 1,
        scheduler_enabled: false,
        sync_cron_1: "0 0 5 * * *".to_string(),
        sync_cron_2: "0 0 17 * * *".to_string(),
        user_agent: "polis-sync-tests".to_string(),
        http_timeout_secs: 5,
        http_retries: 0,
        deadline_secs: 60,
        workspace_root: root.to_path_buf(),
    }
}

fn single_page(listing_url: &str, rows: JsonValue) -> (String, JsonValue) {
    let page = PageUrl::parse(listing_url, "pagina").unwrap().page(1);
    let body = json!({"dados": rows, "links": [{"rel": "last", "href": page.clone()}]});
    (page, body)
}

fn camara_fixtures() -> FixtureFetcher {
    let cfg = CamaraConfig {
        base_url: CAMARA.to_string(),
        ..Default::default()
    };
    let deputy = json!({"dados": {
        "id": 204554,
        "nomeCivil": "Maria da Silva Souza",
        "cpf": "123.456.789-09",
        "sexo": "F",
        "dataNascimento": "1980-03-15",
        "ultimoStatus": {
            "nome": "Maria Souza",
            "siglaPartido": "PSOL",
            "siglaUf": "SP",
            "email": "dep.mariasouza@camara.leg.br",
            "data": "2023-02-01",
            "situacao": "Exercício"
        }
    }});
    let (votings_page, votings) = single_page(
        &cfg.votings_url(YEAR),
        json!([{"id": "2265603-43", "data": "2024-03-12", "siglaOrgao": "PLEN", "descricao": "Aprovado"}]),
    );
    let (propositions_page, propositions) = single_page(
        &cfg.propositions_url(YEAR),
        json!([{"id": 42, "siglaTipo": "PL", "numero": 1234, "ano": 2024, "ementa": "Dispõe sobre..."}]),
    );
    let (events_page, events) = single_page(
        &cfg.events_url(YEAR),
        json!([{"id": 7001, "dataHoraInicio": "2024-04-02T14:00", "descricaoTipo": "Sessão Deliberativa"}]),
    );

    FixtureFetcher::new()
        .with_json(
            cfg.deputies_url(),
            json!({"dados": [{"id": 204554, "nome": "Maria Souza"}, {"id": 220000, "nome": "Sem Detalhe"}], "links": []}),
        )
        .with_json(cfg.deputy_url(204554), deputy)
        .with_json(votings_page, votings)
        .with_json(
            cfg.ballots_url("2265603-43"),
            json!({"dados": [{"tipoVoto": "Sim", "deputado_": {"id": 204554, "nome": "Maria Souza"}}]}),
        )
        .with_json(propositions_page, propositions)
        .with_json(
            cfg.authors_url(42),
            json!({"dados": [{"uri": format!("{CAMARA}/deputados/204554"), "nome": "Maria Souza", "ordemAssinatura": 1}]}),
        )
        .with_json(
            cfg.expenses_url("204554", YEAR),
            json!({"dados": [{"ano": 2024, "mes": 3, "tipoDespesa": "COMBUSTÍVEIS", "valorDocumento": 250.0,
                              "nomeFornecedor": "Posto", "cnpjCpfFornecedor": "12.345.678/0001-99"}],
                   "links": []}),
        )
        .with_json(events_page, events)
        .with_json(
            cfg.event_attendees_url(7001),
            json!({"dados": [{"id": 204554, "nome": "Maria Souza"}]}),
        )
}

fn senado_fixtures() -> FixtureFetcher {
    let cfg = SenadoConfig {
        base_url: SENADO.to_string(),
    };
    FixtureFetcher::new().with_json(
        cfg.current_list_url(),
        json!({"ListaParlamentarEmExercicio": {"Parlamentares": {"Parlamentar": {
            "IdentificacaoParlamentar": {
                "CodigoParlamentar": "5000",
                "NomeParlamentar": "Fulana",
                "NomeCompletoParlamentar": "Fulana de Tal",
                "SexoParlamentar": "Feminino",
                "SiglaPartidoParlamentar": "MDB",
                "UfParlamentar": "RS"
            },
            "Mandato": {"PrimeiraLegislaturaDoMandato": {"DataInicio": "2019-02-01"}}
        }}}}),
    )
}

fn fetchers(camara: FixtureFetcher, senado: FixtureFetcher) -> HashMap<SourceId, Arc<dyn JsonFetch>> {
    let mut fetchers: HashMap<SourceId, Arc<dyn JsonFetch>> = HashMap::new();
    fetchers.insert(SourceId::Camara, Arc::new(camara));
    fetchers.insert(SourceId::Senado, Arc::new(senado));
    fetchers.insert(SourceId::Executive, Arc::new(FixtureFetcher::new()));
    fetchers
}

fn pipeline(root: &Path, store: Arc<dyn DocumentStore>, head_of_state: &str) -> SyncPipeline {
    SyncPipeline::from_parts(
        config(root),
        SourceRegistry::from_yaml_str(REGISTRY).unwrap(),
        RuleTables::default(),
        roster(head_of_state),
        store,
        fetchers(camara_fixtures(), senado_fixtures()),
    )
}

async fn fact_counts(store: &MemoryStore) -> Vec<u64> {
    let mut counts = Vec::new();
    for family in FactFamily::ALL {
        counts.push(store.count_facts(family).await.unwrap());
    }
    counts
}

#[tokio::test]
async fn full_run_is_idempotent_across_repeats() {
    let root = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    let pipeline = pipeline(root.path(), store.clone(), "Chefe de Estado");

    let first = pipeline.run_once(SyncSelection::default(), YEAR).await.unwrap();
    assert_eq!(first.stages.len(), Stage::ORDER.len());
    assert_eq!(first.failed_stages(), 0);
    let camara = first.stages.iter().find(|s| s.stage == Stage::Camara).unwrap();
    let report = camara.persons.as_ref().unwrap();
    assert_eq!((report.succeeded, report.failed), (1, 1));

    // deputy, senator, head of state, governor
    assert_eq!(first.persons_total, 4);
    let counts_after_first = fact_counts(&store).await;
    assert!(counts_after_first.iter().all(|n| *n == 1), "{counts_after_first:?}");
    let before: Vec<Person> = store.persons().await;

    let second = pipeline.run_once(SyncSelection::all(), YEAR).await.unwrap();
    assert_ne!(first.run_id, second.run_id);
    assert_eq!(second.persons_total, 4);
    assert_eq!(fact_counts(&store).await, counts_after_first);

    let after = store.persons().await;
    for person in &before {
        let again = after.iter().find(|p| p.id == person.id).unwrap();
        assert_eq!(again.created_at, person.created_at);
        assert_eq!(again.office_history, person.office_history);
        assert_eq!(again.current_office, person.current_office);
    }

    let deputy = store
        .find_person_by_external_id("camara", "204554")
        .await
        .unwrap()
        .unwrap();
    assert!(deputy.currently_holds(OfficeType::FederalDeputy));
    let votes = store.facts(FactFamily::Vote).await;
    assert_eq!(votes[0].person_id, Some(deputy.id));
}

#[tokio::test]
async fn run_writes_summary_report() {
    let root = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    let pipeline = pipeline(root.path(), store, "Chefe de Estado");

    let selection = SyncSelection {
        presidente: true,
        ..Default::default()
    };
    let summary = pipeline.run_once(selection, YEAR).await.unwrap();
    assert_eq!(summary.stages.len(), 1);
    assert_eq!(summary.stages[0].status, StageStatus::Completed);

    let path = root
        .path()
        .join("reports")
        .join(summary.run_id.to_string())
        .join("sync_summary.json");
    let written: JsonValue = serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
    assert_eq!(written["run_id"], summary.run_id.to_string());
    assert_eq!(written["stages"][0]["stage"], "presidente");
    assert_eq!(written["stages"][0]["status"], "completed");
    assert_eq!(written["persons_total"], 1);
}

#[tokio::test]
async fn a_new_head_of_state_replaces_the_previous_one() {
    let root = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    let selection = SyncSelection {
        presidente: true,
        ..Default::default()
    };

    pipeline(root.path(), store.clone(), "Fulano de Tal")
        .run_once(selection, YEAR)
        .await
        .unwrap();
    pipeline(root.path(), store.clone(), "Beltrano Souza")
        .run_once(selection, YEAR)
        .await
        .unwrap();

    let holders = store.find_current_holders(OfficeType::HeadOfState).await.unwrap();
    assert_eq!(holders.len(), 1);
    assert_eq!(holders[0].civil_name, "Beltrano Souza");
    let everyone = store.persons().await;
    let previous = everyone.iter().find(|p| p.civil_name == "Fulano de Tal").unwrap();
    assert!(previous.current_office.is_none());
    assert_eq!(previous.office_history.len(), 1);
}

#[tokio::test]
async fn head_of_state_entries_apply_in_roster_order_without_an_executive_entry() {
    let root = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    let registry = SourceRegistry::from_yaml_str(
        "version: 1\nsources:\n  - source_id: camara\n    display_name: Camara\n    workers:\n      persons: 5\n",
    )
    .unwrap();
    assert_eq!(registry.source(SourceId::Executive).workers.persons, 5);
    let roster = ExecutiveRoster::from_yaml_str(
        "version: 1\nhead_of_state:\n  - display_name: Primeiro\n    civil_name: Primeiro Chefe\n    jurisdiction: BR\n    start_date: 2015-01-01\n  - display_name: Segundo\n    civil_name: Segundo Chefe\n    jurisdiction: BR\n    start_date: 2019-01-01\n  - display_name: Terceiro\n    civil_name: Terceiro Chefe\n    jurisdiction: BR\n    start_date: 2023-01-01\n",
    )
    .unwrap();
    let pipeline = SyncPipeline::from_parts(
        config(root.path()),
        registry,
        RuleTables::default(),
        roster,
        store.clone(),
        fetchers(FixtureFetcher::new(), FixtureFetcher::new()),
    );

    let selection = SyncSelection {
        presidente: true,
        ..Default::default()
    };
    let summary = pipeline.run_once(selection, YEAR).await.unwrap();
    let presidente = summary.stages.iter().find(|s| s.stage == Stage::Presidente).unwrap();
    assert_eq!(presidente.status, StageStatus::Completed);
    assert_eq!(presidente.persons.as_ref().unwrap().succeeded, 3);

    let holders = store.find_current_holders(OfficeType::HeadOfState).await.unwrap();
    assert_eq!(holders.len(), 1);
    assert_eq!(holders[0].civil_name, "Terceiro Chefe");
    let everyone = store.persons().await;
    assert_eq!(everyone.iter().filter(|p| p.current_office.is_some()).count(), 1);
}

#[tokio::test]
async fn failed_listing_is_recorded_and_later_stages_still_run() {
    let root = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    let pipeline = SyncPipeline::from_parts(
        config(root.path()),
        SourceRegistry::from_yaml_str(REGISTRY).unwrap(),
        RuleTables::default(),
        roster("Chefe de Estado"),
        store.clone(),
        fetchers(camara_fixtures(), FixtureFetcher::new()),
    );

    let selection = SyncSelection {
        senado: true,
        presidente: true,
        ..Default::default()
    };
    let summary = pipeline.run_once(selection, YEAR).await.unwrap();
    assert_eq!(summary.failed_stages(), 1);
    let senado = summary.stages.iter().find(|s| s.stage == Stage::Senado).unwrap();
    assert_eq!(senado.status, StageStatus::Failed);
    assert!(senado.reason.as_deref().unwrap().contains("senado listing"));
    let presidente = summary.stages.iter().find(|s| s.stage == Stage::Presidente).unwrap();
    assert_eq!(presidente.status, StageStatus::Completed);
    assert_eq!(store.count_persons().await.unwrap(), 1);
}

#[tokio::test]
async fn disabled_sources_and_spent_deadlines_skip_stages() {
    let root = tempfile::tempdir().unwrap();
    let registry = SourceRegistry::from_yaml_str(
        "version: 1\nsources:\n  - source_id: senado\n    display_name: Senado\n    enabled: false\n",
    )
    .unwrap();
    let mut cfg = config(root.path());
    cfg.deadline_secs = 0;
    let pipeline = SyncPipeline::from_parts(
        cfg,
        registry,
        RuleTables::default(),
        roster("Chefe de Estado"),
        Arc::new(MemoryStore::new()),
        fetchers(FixtureFetcher::new(), FixtureFetcher::new()),
    );

    let selection = SyncSelection {
        senado: true,
        governadores: true,
        ..Default::default()
    };
    let summary = pipeline.run_once(selection, YEAR).await.unwrap();
    assert!(summary.stages.iter().all(|s| s.status == StageStatus::Skipped));
    assert_eq!(summary.stages[0].stage, Stage::Senado);
    assert_eq!(summary.stages[0].reason.as_deref(), Some("source disabled in sources.yaml"));
    assert_eq!(summary.stages[1].reason.as_deref(), Some("run deadline reached"));
    assert_eq!(summary.persons_total, 0);
}

struct Unreachable;

fn refused() -> StoreError {
    StoreError::Unavailable("connection refused".to_string())
}

#[async_trait]
impl DocumentStore for Unreachable {
    async fn ping(&self) -> Result<(), StoreError> {
        Err(refused())
    }

    async fn find_person(&self, _id: Uuid) -> Result<Option<Person>, StoreError> {
        Err(refused())
    }

    async fn find_person_by_tax_id(&self, _tax_id: &str) -> Result<Option<Person>, StoreError> {
        Err(refused())
    }

    async fn find_persons_by_name(
        &self,
        _normalized_name: &str,
        _born_from: NaiveDate,
        _born_to: NaiveDate,
    ) -> Result<Vec<Person>, StoreError> {
        Err(refused())
    }

    async fn find_person_by_external_id(&self, _source: &str, _external_id: &str) -> Result<Option<Person>, StoreError> {
        Err(refused())
    }

    async fn find_current_holders(&self, _office_type: OfficeType) -> Result<Vec<Person>, StoreError> {
        Err(refused())
    }

    async fn upsert_person(
        &self,
        _filter: &PersonFilter,
        _patch: &PersonPatch,
        _now: DateTime<Utc>,
    ) -> Result<PersonUpsert, StoreError> {
        Err(refused())
    }

    async fn upsert_fact(
        &self,
        _family: FactFamily,
        _natural_key: &str,
        _person_id: Option<Uuid>,
        _payload: &JsonValue,
        _now: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError> {
        Err(refused())
    }

    async fn find_fact(&self, _family: FactFamily, _natural_key: &str) -> Result<Option<StoredFact>, StoreError> {
        Err(refused())
    }

    async fn count_persons(&self) -> Result<u64, StoreError> {
        Err(refused())
    }

    async fn count_facts(&self, _family: FactFamily) -> Result<u64, StoreError> {
        Err(refused())
    }
}

#[tokio::test]
async fn unreachable_store_aborts_before_any_stage() {
    let root = tempfile::tempdir().unwrap();
    let camara = Arc::new(camara_fixtures());
    let mut fetchers = fetchers(FixtureFetcher::new(), FixtureFetcher::new());
    fetchers.insert(SourceId::Camara, camara.clone());
    let pipeline = SyncPipeline::from_parts(
        config(root.path()),
        SourceRegistry::from_yaml_str(REGISTRY).unwrap(),
        RuleTables::default(),
        roster("Chefe de Estado"),
        Arc::new(Unreachable),
        fetchers,
    );

    let err = pipeline.run_once(SyncSelection::all(), YEAR).await.unwrap_err();
    assert!(format!("{err:#}").contains("store unreachable"));
    assert!(camara.calls().is_empty());
    assert!(!root.path().join("reports").exists());
}
