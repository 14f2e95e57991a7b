//! `consolidate`: operator command line for the consolidation passes.
//!
//! Every pass previews by default; `--execute` applies it. Exit status is
//! 0 when the closing integrity audit is clean, 1 when it finds defects
//! and 2 on a fatal error.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use consolidate_core::images::RevertSelection;
use consolidate_core::pipeline::PassSummary;
use consolidate_core::{Database, JsonSnapshotFeed, NameQuery, Pipeline, PipelineConfig, RunMode, RunReport};

#[derive(Parser, Debug)]
#[command(name = "consolidate")]
#[command(version, about = "Patient identity resolution and record consolidation")]
struct Cli {
    /// SQLite database file
    #[arg(long, global = true, default_value = "consolidate.db")]
    db: PathBuf,

    /// Configuration file (TOML, YAML or JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter, e.g. "info" or "consolidate_core=debug" [default: $RUST_LOG, else info]
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Print reports as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create exams and patients for feed visits not yet stored
    Ingest {
        #[arg(long)]
        feed: PathBuf,
        #[arg(long)]
        execute: bool,
    },
    /// Reconcile every patient and exam location against the feed
    Reconcile {
        #[arg(long)]
        feed: PathBuf,
        #[arg(long)]
        execute: bool,
    },
    /// Merge duplicate patient records
    Merge {
        #[arg(long)]
        execute: bool,
    },
    /// Replace legacy image ids with stable ids
    MigrateImages {
        #[arg(long)]
        execute: bool,
    },
    /// Delete red-free images no report selects
    PruneDerived {
        #[arg(long)]
        execute: bool,
    },
    /// Undo audited selected-image changes
    RevertPointers {
        /// Every change recorded for this report
        #[arg(long, required_unless_present = "since", conflicts_with = "since")]
        report: Option<String>,
        /// Every change from this audit sequence number on
        #[arg(long)]
        since: Option<i64>,
        #[arg(long)]
        execute: bool,
    },
    /// Integrity audit only
    Audit,
    /// reconcile, merge, migrate-images, then audit
    Run {
        #[arg(long)]
        feed: PathBuf,
        #[arg(long)]
        execute: bool,
    },
    /// Search patients by name
    Find {
        name: String,
        #[arg(long, value_enum, default_value_t = SearchMode::Exact)]
        mode: SearchMode,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum SearchMode {
    Exact,
    Prefix,
    Contains,
}

impl From<SearchMode> for NameQuery {
    fn from(mode: SearchMode) -> Self {
        match mode {
            SearchMode::Exact => NameQuery::Exact,
            SearchMode::Prefix => NameQuery::Prefix,
            SearchMode::Contains => NameQuery::Contains,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(log_filter(cli.log_level.as_deref()))
        .with_writer(std::io::stderr)
        .init();

    match run(&cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(err) => {
            tracing::error!(error = %err, "fatal");
            eprintln!("error: {err:#}");
            ExitCode::from(2)
        }
    }
}

/// `--log-level` wins, then `RUST_LOG`, then "info".
fn log_filter(level: Option<&str>) -> EnvFilter {
    match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    }
}

/// Run the command. `Ok(false)` means defects remain.
fn run(cli: &Cli) -> anyhow::Result<bool> {
    let config = PipelineConfig::load(cli.config.as_deref()).context("loading configuration")?;
    let db = Database::open(&cli.db).with_context(|| format!("opening {}", cli.db.display()))?;
    let pipeline = Pipeline::new(&db, config);

    match &cli.command {
        Command::Ingest { feed, execute } => {
            let feed = JsonSnapshotFeed::from_path(feed)?;
            let pass = pipeline.ingest(&feed, RunMode::from_execute_flag(*execute))?;
            finish(cli, &pipeline, vec![pass])
        }
        Command::Reconcile { feed, execute } => {
            let feed = JsonSnapshotFeed::from_path(feed)?;
            let pass = pipeline.reconcile(&feed, RunMode::from_execute_flag(*execute))?;
            finish(cli, &pipeline, vec![pass])
        }
        Command::Merge { execute } => {
            let pass = pipeline.merge(RunMode::from_execute_flag(*execute))?;
            finish(cli, &pipeline, vec![pass])
        }
        Command::MigrateImages { execute } => {
            let pass = pipeline.migrate_images(RunMode::from_execute_flag(*execute))?;
            finish(cli, &pipeline, vec![pass])
        }
        Command::PruneDerived { execute } => {
            let pass = pipeline.prune_derived(RunMode::from_execute_flag(*execute))?;
            finish(cli, &pipeline, vec![pass])
        }
        Command::RevertPointers { report, since, execute } => {
            let selection = match (report, since) {
                (Some(report_id), _) => RevertSelection::Report(report_id.clone()),
                (None, Some(seq)) => RevertSelection::Since(*seq),
                (None, None) => anyhow::bail!("--report or --since is required"),
            };
            let pass = pipeline.revert_pointers(&selection, RunMode::from_execute_flag(*execute))?;
            finish(cli, &pipeline, vec![pass])
        }
        Command::Audit => {
            let audit = pipeline.audit()?;
            emit(cli.json, &audit, &audit)?;
            Ok(audit.is_clean())
        }
        Command::Run { feed, execute } => {
            let feed = JsonSnapshotFeed::from_path(feed)?;
            let report = pipeline.run(&feed, RunMode::from_execute_flag(*execute))?;
            emit(cli.json, &report, &report)?;
            Ok(report.is_clean())
        }
        Command::Find { name, mode, limit } => {
            let found = db.search_patients_by_name(name, (*mode).into(), *limit)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&found)?);
            } else {
                for p in &found {
                    println!(
                        "{}  {}  {}  {}",
                        p.id,
                        p.name,
                        p.birth_date.map(|d| d.to_string()).unwrap_or_else(|| "-".into()),
                        p.cpf.as_deref().unwrap_or("-"),
                    );
                }
            }
            Ok(true)
        }
    }
}

/// Close a single pass with an audit and print both.
fn finish(cli: &Cli, pipeline: &Pipeline<'_>, passes: Vec<PassSummary>) -> anyhow::Result<bool> {
    let report = RunReport {
        passes,
        audit: pipeline.audit()?,
    };
    emit(cli.json, &report, &report)?;
    Ok(report.is_clean())
}

fn emit<T: Serialize>(json: bool, value: &T, text: &dyn std::fmt::Display) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        print!("{text}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pass_commands_preview_by_default() {
        let cli = Cli::try_parse_from(["consolidate", "merge"]).unwrap();
        assert!(matches!(cli.command, Command::Merge { execute: false }));
        assert_eq!(cli.db, PathBuf::from("consolidate.db"));
        assert_eq!(cli.log_level, None);

        let cli = Cli::try_parse_from(["consolidate", "migrate-images", "--execute", "--db", "x.db"]).unwrap();
        assert!(matches!(cli.command, Command::MigrateImages { execute: true }));
        assert_eq!(cli.db, PathBuf::from("x.db"));
    }

    #[test]
    fn test_feed_is_required() {
        assert!(Cli::try_parse_from(["consolidate", "reconcile"]).is_err());
        let cli = Cli::try_parse_from(["consolidate", "--json", "run", "--feed", "feed.json"]).unwrap();
        assert!(cli.json);
        assert!(matches!(cli.command, Command::Run { execute: false, .. }));
    }

    #[test]
    fn test_revert_pointers_needs_one_selection() {
        assert!(Cli::try_parse_from(["consolidate", "revert-pointers"]).is_err());
        assert!(Cli::try_parse_from(["consolidate", "revert-pointers", "--report", "r1", "--since", "3"]).is_err());

        let cli = Cli::try_parse_from(["consolidate", "revert-pointers", "--since", "3"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::RevertPointers { report: None, since: Some(3), execute: false }
        ));
    }

    #[test]
    fn test_explicit_log_level_wins() {
        let cli = Cli::try_parse_from(["consolidate", "--log-level", "consolidate_core=debug", "audit"]).unwrap();
        assert_eq!(cli.log_level.as_deref(), Some("consolidate_core=debug"));
        assert_eq!(log_filter(cli.log_level.as_deref()).to_string(), "consolidate_core=debug");
    }

    #[test]
    fn test_find_mode() {
        let cli = Cli::try_parse_from(["consolidate", "find", "maria", "--mode", "prefix"]).unwrap();
        match cli.command {
            Command::Find { name, mode, limit } => {
                assert_eq!(name, "maria");
                assert_eq!(NameQuery::from(mode), NameQuery::Prefix);
                assert_eq!(limit, 20);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_end_to_end_preview_on_temp_db() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("store.db");
        let cli = Cli::try_parse_from(["consolidate", "--db", db_path.to_str().unwrap(), "audit"]).unwrap();
        assert!(run(&cli).unwrap());
    }
}
