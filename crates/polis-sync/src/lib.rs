//! Sync pipeline orchestration: stage selection, run summary, reports and scheduling.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Datelike, Utc};
use polis_adapters::{CamaraDeputies, ExecutiveRoster, ExecutiveSource, PersonSource, RuleTables, SenadoSenators, SourceId};
use polis_core::FactFamily;
use polis_storage::{DocumentStore, HttpFetcher, JsonFetch, MemoryStore, PgStore, TokenBucket};
use serde::Serialize;
use tokio::fs;
use tokio::time::Instant;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

pub mod config;
pub mod dispatch;
pub mod facts;
pub mod mandates;
pub mod persons;
pub mod resolver;
pub mod writer;

pub use config::{load_source_registry, SourceConfig, SourceRegistry, StageWorkers, StoreBackend, SyncConfig};
pub use dispatch::{dispatch, DispatchOptions, DispatchReport};
pub use facts::{FactStageContext, FactStageReport, PageStats};
pub use resolver::{resolve, PersonDirectory};
pub use writer::{write_fact, write_observation};

pub const CRATE_NAME: &str = "polis-sync";

/// Which stages a run covers. Nothing selected means everything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncSelection {
    pub camara: bool,
    pub senado: bool,
    pub presidente: bool,
    pub governadores: bool,
    pub votacoes: bool,
    pub proposicoes: bool,
    pub despesas: bool,
    pub presencas: bool,
}

impl SyncSelection {
    pub fn all() -> Self {
        Self {
            camara: true,
            senado: true,
            presidente: true,
            governadores: true,
            votacoes: true,
            proposicoes: true,
            despesas: true,
            presencas: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn or_all(self) -> Self {
        if self.is_empty() {
            Self::all()
        } else {
            self
        }
    }

    pub fn includes(&self, stage: Stage) -> bool {
        match stage {
            Stage::Camara => self.camara,
            Stage::Senado => self.senado,
            Stage::Presidente => self.presidente,
            Stage::Governadores => self.governadores,
            Stage::Votacoes => self.votacoes,
            Stage::Proposicoes => self.proposicoes,
            Stage::Despesas => self.despesas,
            Stage::Presencas => self.presencas,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Camara,
    Senado,
    Presidente,
    Governadores,
    Votacoes,
    Proposicoes,
    Despesas,
    Presencas,
}

impl Stage {
    /// Run order: deputies first so the Chamber fact stages can resolve them.
    pub const ORDER: [Stage; 8] = [
        Stage::Camara,
        Stage::Votacoes,
        Stage::Proposicoes,
        Stage::Despesas,
        Stage::Presencas,
        Stage::Senado,
        Stage::Presidente,
        Stage::Governadores,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Camara => "camara",
            Stage::Senado => "senado",
            Stage::Presidente => "presidente",
            Stage::Governadores => "governadores",
            Stage::Votacoes => "votacoes",
            Stage::Proposicoes => "proposicoes",
            Stage::Despesas => "despesas",
            Stage::Presencas => "presencas",
        }
    }

    pub fn source(&self) -> SourceId {
        match self {
            Stage::Senado => SourceId::Senado,
            Stage::Presidente | Stage::Governadores => SourceId::Executive,
            _ => SourceId::Camara,
        }
    }

    /// Person workers for this stage. The head-of-state stage demotes the
    /// previous holder on every upsert, so it is always sequential.
    pub fn person_workers(&self, configured: usize) -> usize {
        match self {
            Stage::Presidente => 1,
            _ => configured.max(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageSummary {
    pub stage: Stage,
    pub status: StageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persons: Option<DispatchReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub facts: Option<FactStageReport>,
}

impl StageSummary {
    fn skipped(stage: Stage, reason: &str) -> Self {
        Self {
            stage,
            status: StageStatus::Skipped,
            reason: Some(reason.to_string()),
            persons: None,
            facts: None,
        }
    }
}

enum StageOutcome {
    Persons(DispatchReport),
    Facts(FactStageReport),
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub year: i32,
    pub selection: SyncSelection,
    pub stages: Vec<StageSummary>,
    pub persons_total: u64,
    pub facts_total: BTreeMap<String, u64>,
    pub reports_dir: String,
}

impl SyncRunSummary {
    pub fn failed_stages(&self) -> usize {
        self.stages.iter().filter(|s| s.status == StageStatus::Failed).count()
    }
}

/// Opens the configured store. Failing here is the one fatal error of a run.
pub async fn connect_store(config: &SyncConfig) -> Result<Arc<dyn DocumentStore>> {
    match config.store {
        StoreBackend::Memory => {
            warn!("using the in-memory store; nothing outlives this process");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreBackend::Postgres => {
            let store = PgStore::connect(&config.database_url, config.max_connections)
                .await
                .context("connecting to postgres")?;
            Ok(Arc::new(store))
        }
    }
}

/// One rate-limited fetcher per external system, each with its own bucket.
pub fn build_fetchers(
    config: &SyncConfig,
    registry: &SourceRegistry,
) -> Result<HashMap<SourceId, Arc<dyn JsonFetch>>> {
    let mut fetchers: HashMap<SourceId, Arc<dyn JsonFetch>> = HashMap::new();
    for source_id in [SourceId::Camara, SourceId::Senado, SourceId::Executive] {
        let source = registry.source(source_id);
        let limiter = Arc::new(TokenBucket::per_second(source.requests_per_second));
        let fetcher = HttpFetcher::new(source_id.as_str(), config.http_client_for(&source), limiter)
            .with_context(|| format!("building {} fetcher", source_id.as_str()))?;
        fetchers.insert(source_id, Arc::new(fetcher));
    }
    Ok(fetchers)
}

pub struct SyncPipeline {
    config: SyncConfig,
    registry: SourceRegistry,
    rules: Arc<RuleTables>,
    roster: ExecutiveRoster,
    store: Arc<dyn DocumentStore>,
    fetchers: HashMap<SourceId, Arc<dyn JsonFetch>>,
}

impl SyncPipeline {
    pub async fn new(config: SyncConfig) -> Result<Self> {
        let registry = load_source_registry(&config.workspace_root).await?;
        let rules = RuleTables::from_workspace_root(&config.workspace_root)?;
        let roster = ExecutiveRoster::from_workspace_root(&config.workspace_root)?;
        let store = connect_store(&config).await?;
        let fetchers = build_fetchers(&config, &registry)?;
        Ok(Self::from_parts(config, registry, rules, roster, store, fetchers))
    }

    pub fn from_parts(
        config: SyncConfig,
        registry: SourceRegistry,
        rules: RuleTables,
        roster: ExecutiveRoster,
        store: Arc<dyn DocumentStore>,
        fetchers: HashMap<SourceId, Arc<dyn JsonFetch>>,
    ) -> Self {
        Self {
            config,
            registry,
            rules: Arc::new(rules),
            roster,
            store,
            fetchers,
        }
    }

    pub fn store(&self) -> Arc<dyn DocumentStore> {
        Arc::clone(&self.store)
    }

    /// Runs the selected stages in [`Stage::ORDER`]. Only an unreachable store
    /// is an error; stage failures are logged and recorded in the summary.
    pub async fn run_once(&self, selection: SyncSelection, year: i32) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let selection = selection.or_all();

        self.store.ping().await.context("store unreachable; aborting sync run")?;
        let deadline = Instant::now() + self.config.deadline();
        info!(%run_id, year, "sync run started");

        let mut stages = Vec::new();
        for stage in Stage::ORDER {
            if !selection.includes(stage) {
                continue;
            }
            let summary = if !self.registry.is_enabled(stage.source()) {
                StageSummary::skipped(stage, "source disabled in sources.yaml")
            } else if Instant::now() >= deadline {
                warn!(stage = stage.as_str(), "run deadline reached; stage not started");
                StageSummary::skipped(stage, "run deadline reached")
            } else {
                self.run_stage(stage, year, deadline).await
            };
            stages.push(summary);
        }

        let persons_total = match self.store.count_persons().await {
            Ok(n) => n,
            Err(err) => {
                warn!(%err, "could not count persons");
                0
            }
        };
        let mut facts_total = BTreeMap::new();
        for family in FactFamily::ALL {
            match self.store.count_facts(family).await {
                Ok(n) => {
                    facts_total.insert(family.collection().to_string(), n);
                }
                Err(err) => warn!(%err, family = family.collection(), "could not count facts"),
            }
        }

        let mut summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            year,
            selection,
            stages,
            persons_total,
            facts_total,
            reports_dir: String::new(),
        };
        match self.write_reports(&summary).await {
            Ok(dir) => summary.reports_dir = dir.display().to_string(),
            Err(err) => warn!(error = %format!("{err:#}"), "could not write run report"),
        }

        info!(
            %run_id,
            stages = summary.stages.len(),
            failed = summary.failed_stages(),
            persons = summary.persons_total,
            elapsed_secs = (summary.finished_at - summary.started_at).num_seconds(),
            "sync run finished"
        );
        Ok(summary)
    }

    async fn run_stage(&self, stage: Stage, year: i32, deadline: Instant) -> StageSummary {
        info!(stage = stage.as_str(), "stage started");
        match self.execute(stage, year, deadline).await {
            Ok(outcome) => {
                let (persons, facts) = match outcome {
                    StageOutcome::Persons(report) => (Some(report), None),
                    StageOutcome::Facts(report) => (None, Some(report)),
                };
                StageSummary {
                    stage,
                    status: StageStatus::Completed,
                    reason: None,
                    persons,
                    facts,
                }
            }
            Err(err) => {
                let reason = format!("{err:#}");
                warn!(stage = stage.as_str(), error = %reason, "stage failed");
                StageSummary {
                    stage,
                    status: StageStatus::Failed,
                    reason: Some(reason),
                    persons: None,
                    facts: None,
                }
            }
        }
    }

    async fn execute(&self, stage: Stage, year: i32, deadline: Instant) -> Result<StageOutcome> {
        let source = self.registry.source(stage.source());
        let rules = Arc::clone(&self.rules);
        let outcome = match stage {
            Stage::Camara => {
                let deputies = CamaraDeputies::new(source.camara(), rules);
                StageOutcome::Persons(self.person_stage(stage, deputies, &source, deadline).await?)
            }
            Stage::Senado => {
                let senators = SenadoSenators::new(source.senado(), rules);
                StageOutcome::Persons(self.person_stage(stage, senators, &source, deadline).await?)
            }
            Stage::Presidente => {
                let roster = ExecutiveSource::head_of_state(&self.roster, rules);
                StageOutcome::Persons(self.person_stage(stage, roster, &source, deadline).await?)
            }
            Stage::Governadores => {
                let roster = ExecutiveSource::governors(&self.roster, rules);
                StageOutcome::Persons(self.person_stage(stage, roster, &source, deadline).await?)
            }
            Stage::Votacoes => {
                let options = self.fact_options(stage, source.workers.votes, &source, deadline);
                StageOutcome::Facts(facts::sync_votes(self.fact_context(&source)?, year, options).await?)
            }
            Stage::Proposicoes => {
                let options = self.fact_options(stage, source.workers.propositions, &source, deadline);
                StageOutcome::Facts(facts::sync_propositions(self.fact_context(&source)?, year, options).await?)
            }
            Stage::Despesas => {
                let options = self.fact_options(stage, source.workers.expenses, &source, deadline);
                StageOutcome::Facts(facts::sync_expenses(self.fact_context(&source)?, year, options).await?)
            }
            Stage::Presencas => {
                let options = self.fact_options(stage, source.workers.attendance, &source, deadline);
                StageOutcome::Facts(facts::sync_attendance(self.fact_context(&source)?, year, options).await?)
            }
        };
        Ok(outcome)
    }

    fn fetcher(&self, source_id: SourceId) -> Result<Arc<dyn JsonFetch>> {
        self.fetchers
            .get(&source_id)
            .cloned()
            .ok_or_else(|| anyhow!("no fetcher configured for {}", source_id.as_str()))
    }

    async fn person_stage<S>(
        &self,
        stage: Stage,
        source: S,
        config: &SourceConfig,
        deadline: Instant,
    ) -> Result<DispatchReport>
    where
        S: PersonSource + 'static,
    {
        let workers = stage.person_workers(config.workers.persons);
        let options = DispatchOptions::new(stage.as_str(), workers)
            .progress_every(config.progress_every)
            .deadline(Some(deadline));
        persons::sync_persons(
            Arc::new(source),
            self.fetcher(config.source_id)?,
            Arc::clone(&self.store),
            options,
        )
        .await
    }

    fn fact_options(&self, stage: Stage, workers: usize, config: &SourceConfig, deadline: Instant) -> DispatchOptions {
        DispatchOptions::new(stage.as_str(), workers)
            .progress_every(config.progress_every)
            .deadline(Some(deadline))
    }

    /// A fresh context per stage, so ids cached by one stage never hide
    /// persons written by a later one.
    fn fact_context(&self, camara: &SourceConfig) -> Result<Arc<FactStageContext>> {
        let context = FactStageContext::new(camara.camara(), self.fetcher(SourceId::Camara)?, Arc::clone(&self.store))
            .with_adaptive(camara.adaptive())
            .with_enrichment_timeout(camara.enrichment_timeout());
        Ok(Arc::new(context))
    }

    async fn write_reports(&self, summary: &SyncRunSummary) -> Result<PathBuf> {
        let reports_dir = self
            .config
            .workspace_root
            .join("reports")
            .join(summary.run_id.to_string());
        fs::create_dir_all(&reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;

        let body = serde_json::to_vec_pretty(summary).context("serializing sync summary")?;
        fs::write(reports_dir.join("sync_summary.json"), body)
            .await
            .context("writing sync_summary.json")?;
        Ok(reports_dir)
    }

    /// Two cron jobs, each running a full sync for the current year.
    pub async fn build_scheduler(self: &Arc<Self>) -> Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        for cron in [&self.config.sync_cron_1, &self.config.sync_cron_2] {
            let pipeline = Arc::clone(self);
            let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
                let pipeline = Arc::clone(&pipeline);
                Box::pin(async move {
                    let year = Utc::now().year();
                    match pipeline.run_once(SyncSelection::all(), year).await {
                        Ok(summary) => info!(run_id = %summary.run_id, failed = summary.failed_stages(), "scheduled sync finished"),
                        Err(err) => warn!(error = %format!("{err:#}"), "scheduled sync aborted"),
                    }
                })
            })
            .with_context(|| format!("creating scheduler job for cron {cron}"))?;
            sched.add(job).await.context("adding scheduler job")?;
        }
        Ok(sched)
    }

    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }
        self.build_scheduler().await.map(Some)
    }
}

pub async fn run_sync_once_from_env(selection: SyncSelection, year: i32) -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env();
    let pipeline = SyncPipeline::new(config).await?;
    pipeline.run_once(selection, year).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_selection_means_everything() {
        let selection = SyncSelection::default().or_all();
        assert!(Stage::ORDER.iter().all(|s| selection.includes(*s)));

        let only_votes = SyncSelection {
            votacoes: true,
            ..Default::default()
        }
        .or_all();
        assert!(only_votes.includes(Stage::Votacoes));
        assert!(!only_votes.includes(Stage::Camara));
    }

    #[test]
    fn deputies_run_before_chamber_facts() {
        let position = |stage: Stage| Stage::ORDER.iter().position(|s| *s == stage).unwrap();
        for fact_stage in [Stage::Votacoes, Stage::Proposicoes, Stage::Despesas, Stage::Presencas] {
            assert!(position(Stage::Camara) < position(fact_stage));
            assert_eq!(fact_stage.source(), SourceId::Camara);
        }
        assert_eq!(Stage::Presidente.source(), SourceId::Executive);
    }

    #[test]
    fn head_of_state_stage_is_always_sequential() {
        assert_eq!(Stage::Presidente.person_workers(5), 1);
        assert_eq!(Stage::Presidente.person_workers(0), 1);
        assert_eq!(Stage::Governadores.person_workers(5), 5);
        assert_eq!(Stage::Camara.person_workers(0), 1);
    }
}
