use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Datelike, Utc};
use clap::{Args, Parser, Subcommand};
use polis_storage::PgStore;
use polis_sync::{StageStatus, SyncConfig, SyncPipeline, SyncRunSummary, SyncSelection};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "polis-cli")]
#[command(about = "Sync Brazilian legislative and executive open data into the civic record store")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync pass. With no stage flags every stage runs.
    Sync(SyncArgs),
    /// Apply database migrations.
    Migrate,
    /// Run the twice-daily scheduler until interrupted.
    Schedule,
}

#[derive(Debug, Default, Args)]
struct SyncArgs {
    /// Chamber of Deputies members
    #[arg(long)]
    camara: bool,
    /// Federal Senate members
    #[arg(long)]
    senado: bool,
    /// Head of state from the executive roster
    #[arg(long)]
    presidente: bool,
    /// State governors from the executive roster
    #[arg(long)]
    governadores: bool,
    /// Chamber roll-call votes
    #[arg(long)]
    votacoes: bool,
    /// Chamber bills
    #[arg(long)]
    proposicoes: bool,
    /// Deputy expense reports
    #[arg(long)]
    despesas: bool,
    /// Plenary attendance
    #[arg(long)]
    presencas: bool,
    /// Every stage; same as passing no flags
    #[arg(long)]
    all: bool,
    /// Reference year for fact stages
    #[arg(long, env = "POLIS_SYNC_YEAR")]
    year: Option<i32>,
}

impl SyncArgs {
    fn selection(&self) -> SyncSelection {
        if self.all {
            return SyncSelection::all();
        }
        SyncSelection {
            camara: self.camara,
            senado: self.senado,
            presidente: self.presidente,
            governadores: self.governadores,
            votacoes: self.votacoes,
            proposicoes: self.proposicoes,
            despesas: self.despesas,
            presencas: self.presencas,
        }
        .or_all()
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("warn,polis_cli=info,polis_sync=info,polis_storage=info,polis_adapters=info")
    });
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .init();
}

fn print_summary(summary: &SyncRunSummary) {
    println!(
        "sync complete: run_id={} year={} persons={} failed_stages={} reports={}",
        summary.run_id,
        summary.year,
        summary.persons_total,
        summary.failed_stages(),
        summary.reports_dir
    );
    for stage in &summary.stages {
        let status = status_label(stage.status);
        match &stage.reason {
            Some(reason) => println!("  {:<13} {status} ({reason})", stage.stage.as_str()),
            None => println!("  {:<13} {status}", stage.stage.as_str()),
        }
    }
    for (family, count) in &summary.facts_total {
        println!("  {family:<13} {count} records");
    }
}

fn status_label(status: StageStatus) -> &'static str {
    match status {
        StageStatus::Completed => "completed",
        StageStatus::Failed => "failed",
        StageStatus::Skipped => "skipped",
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync(SyncArgs::default())) {
        Commands::Sync(args) => {
            let year = args.year.unwrap_or_else(|| Utc::now().year());
            // Stage failures are reported, not fatal; only setup and store errors exit non-zero.
            let summary = polis_sync::run_sync_once_from_env(args.selection(), year).await?;
            print_summary(&summary);
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let store = PgStore::connect(&config.database_url, config.max_connections)
                .await
                .context("connecting to postgres")?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Schedule => {
            let config = SyncConfig::from_env();
            let pipeline = Arc::new(SyncPipeline::new(config).await?);
            let mut scheduler = pipeline.build_scheduler().await?;
            scheduler.start().await.context("starting scheduler")?;
            info!("scheduler running; press ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            scheduler.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_flags_selects_every_stage() {
        let cli = Cli::parse_from(["polis-cli", "sync"]);
        let Some(Commands::Sync(args)) = cli.command else {
            panic!("expected sync");
        };
        assert_eq!(args.selection(), SyncSelection::all());
    }

    #[test]
    fn stage_flags_limit_the_run() {
        let cli = Cli::parse_from(["polis-cli", "sync", "--despesas", "--camara", "--year", "2023"]);
        let Some(Commands::Sync(args)) = cli.command else {
            panic!("expected sync");
        };
        let selection = args.selection();
        assert!(selection.despesas && selection.camara);
        assert!(!selection.senado && !selection.votacoes);
        assert_eq!(args.year, Some(2023));
    }

    #[test]
    fn all_overrides_individual_flags() {
        let cli = Cli::parse_from(["polis-cli", "sync", "--senado", "--all"]);
        let Some(Commands::Sync(args)) = cli.command else {
            panic!("expected sync");
        };
        assert_eq!(args.selection(), SyncSelection::all());
    }
}
