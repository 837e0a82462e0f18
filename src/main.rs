// ========================================================================================
//
//                      THE COMMAND-LINE FRONT END: RISKGROUPER
//
// ========================================================================================
//
// Parses arguments, layers command-line overrides onto the TOML configuration,
// loads the member-period table, runs the pipeline and writes its outputs.
// Exits with status 1 when the run fails outright or no target completes.

#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand, ValueEnum};
use env_logger::Env;
use log::{error, info, warn};
use riskgrouper::boost::SearchStrategy;
use riskgrouper::config::{
    ConfigError, ImbalanceStrategy, ModelSelection, PipelineConfig, SplitInclusion,
};
use riskgrouper::consensus::ConsensusPolicy;
use riskgrouper::data::{DataError, DelimitedFileSource, load_table};
use riskgrouper::pipeline::{self, PipelineError, RunContext};
use riskgrouper::report::{RunLogEntry, append_run_log};
use std::path::{Path, PathBuf};
use std::process;
use std::time::Instant;
use thiserror::Error;

// ========================================================================================
//                         COMMAND-LINE INTERFACE DEFINITION
// ========================================================================================

#[derive(Parser)]
#[command(
    name = "riskgrouper",
    version,
    about = "Dual-model adverse-event risk prediction and explanation for care-management triage."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Train, evaluate and explain risk models for each target")]
    Run(RunArgs),
    #[command(about = "Print the default configuration as TOML")]
    DefaultConfig,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModelsCli {
    Logistic,
    Boosted,
    Both,
}

#[derive(Clone, Copy, ValueEnum)]
enum ImbalanceCli {
    ClassWeight,
    Oversample,
    Both,
    None,
}

#[derive(Clone, Copy, ValueEnum)]
enum SplitsCli {
    Test,
    ValidationTest,
    All,
}

#[derive(Clone, Copy, ValueEnum)]
enum ConsensusCli {
    DualBand,
    SharedCutoff,
}

#[derive(Clone, Copy, ValueEnum)]
enum SearchCli {
    Randomized,
    Grid,
    Disabled,
}

#[derive(Args)]
struct RunArgs {
    /// Member-period table (TSV by default; `.csv` files are read comma-separated).
    #[arg(value_name = "TABLE_PATH")]
    input: PathBuf,

    /// TOML configuration file; flags below override its values.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Field separator of the input table.
    #[arg(long)]
    separator: Option<char>,

    /// Target column to model. Repeat for several targets.
    #[arg(long = "target", value_name = "COLUMN")]
    targets: Vec<String>,

    /// Additional column to exclude from the features. Repeatable.
    #[arg(long = "exclude", value_name = "COLUMN")]
    exclude: Vec<String>,

    #[arg(long, value_name = "DIR")]
    output_dir: Option<PathBuf>,

    /// Directory in which built explainers are cached between runs.
    #[arg(long, value_name = "DIR")]
    cache_dir: Option<PathBuf>,

    /// CSV file to which one row per target is appended.
    #[arg(long, value_name = "PATH")]
    run_log: Option<PathBuf>,

    #[arg(long)]
    seed: Option<u64>,

    #[arg(long, value_enum)]
    models: Option<ModelsCli>,

    #[arg(long, value_enum)]
    imbalance: Option<ImbalanceCli>,

    /// Partitions whose rows receive individual records.
    #[arg(long, value_enum)]
    include_splits: Option<SplitsCli>,

    #[arg(long, value_enum)]
    consensus: Option<ConsensusCli>,

    /// Cutoff of the shared-cutoff consensus mode.
    #[arg(long)]
    cutoff: Option<f64>,

    #[arg(long, value_enum)]
    search: Option<SearchCli>,

    #[arg(long, value_name = "N")]
    search_candidates: Option<usize>,

    #[arg(long, value_name = "N")]
    top_n: Option<usize>,

    #[arg(long)]
    epsilon: Option<f64>,

    #[arg(long, value_name = "N")]
    background_cap: Option<usize>,

    #[arg(long, value_name = "YYYY-MM-DD")]
    window_start: Option<NaiveDate>,

    #[arg(long, value_name = "YYYY-MM-DD")]
    window_end: Option<NaiveDate>,

    /// Report rows from every period, ignoring the recency window.
    #[arg(long, conflicts_with_all = ["window_start", "window_end"])]
    all_periods: bool,
}

#[derive(Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Failed to load the member-period table: {0}")]
    Data(#[from] DataError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("The separator '{0}' is not a single-byte character.")]
    Separator(char),
    #[error("No target completed; see the log for the reason each was skipped or failed.")]
    NothingCompleted,
}

// ========================================================================================
//                                   ENTRY POINT
// ========================================================================================

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let code = match cli.command {
        Commands::DefaultConfig => match PipelineConfig::default().to_toml() {
            Ok(text) => {
                print!("{text}");
                0
            }
            Err(e) => {
                error!("{e}");
                1
            }
        },
        Commands::Run(args) => run_command(&args),
    };
    process::exit(code);
}

fn run_command(args: &RunArgs) -> i32 {
    let start_time = Instant::now();
    let config = match build_config(args) {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return 1;
        }
    };
    let run_log = config.run_log.clone();

    match execute(args, config) {
        Ok(()) => {
            info!("Finished in {:.2?}.", start_time.elapsed());
            0
        }
        Err(e) => {
            error!("{e}");
            if let (Some(path), false) = (&run_log, matches!(e, CliError::NothingCompleted)) {
                if let Err(log_error) = append_run_log(path, &RunLogEntry::fatal(&e.to_string())) {
                    warn!("Could not append to run log {}: {log_error}", path.display());
                }
            }
            1
        }
    }
}

fn execute(args: &RunArgs, config: PipelineConfig) -> Result<(), CliError> {
    let context = RunContext::new(config)?;
    let separator = resolve_separator(&args.input, args.separator)?;
    let mut source = DelimitedFileSource::new(&args.input).with_separator(separator);
    let table = load_table(&mut source, &context.config().schema())?;

    let summary = pipeline::run(&context, &table)?;
    let written = pipeline::write_outputs(&context, &summary)?;
    info!(
        "{} of {} target(s) completed; {} files written under {}.",
        summary.completed(),
        summary.reports.len(),
        written.len(),
        context.config().output_dir.display()
    );
    if summary.completed() == 0 {
        return Err(CliError::NothingCompleted);
    }
    Ok(())
}

fn resolve_separator(input: &Path, separator: Option<char>) -> Result<u8, CliError> {
    match separator {
        Some(c) if c.is_ascii() => Ok(c as u8),
        Some(c) => Err(CliError::Separator(c)),
        None => {
            let is_csv = input
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));
            Ok(if is_csv { b',' } else { b'\t' })
        }
    }
}

/// The configuration file (or defaults) with every given flag applied on top.
fn build_config(args: &RunArgs) -> Result<PipelineConfig, CliError> {
    let mut config = match &args.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };

    if !args.targets.is_empty() {
        config.targets = args.targets.clone();
    }
    config.exclude_features.extend(args.exclude.iter().cloned());
    if let Some(dir) = &args.output_dir {
        config.output_dir = dir.clone();
    }
    if let Some(dir) = &args.cache_dir {
        config.cache_dir = Some(dir.clone());
    }
    if let Some(path) = &args.run_log {
        config.run_log = Some(path.clone());
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
        config.boosting.seed = seed;
        config.search.seed = seed;
        config.smote.seed = seed;
    }
    if let Some(models) = args.models {
        config.models = match models {
            ModelsCli::Logistic => ModelSelection::Logistic,
            ModelsCli::Boosted => ModelSelection::Boosted,
            ModelsCli::Both => ModelSelection::Both,
        };
    }
    if let Some(imbalance) = args.imbalance {
        config.imbalance = match imbalance {
            ImbalanceCli::ClassWeight => ImbalanceStrategy::ClassWeight,
            ImbalanceCli::Oversample => ImbalanceStrategy::Oversample,
            ImbalanceCli::Both => ImbalanceStrategy::Both,
            ImbalanceCli::None => ImbalanceStrategy::None,
        };
    }
    if let Some(splits) = args.include_splits {
        config.include_splits = match splits {
            SplitsCli::Test => SplitInclusion::Test,
            SplitsCli::ValidationTest => SplitInclusion::ValidationTest,
            SplitsCli::All => SplitInclusion::All,
        };
    }
    match (args.consensus, args.cutoff) {
        (Some(ConsensusCli::DualBand), _) => config.consensus = ConsensusPolicy::default(),
        (Some(ConsensusCli::SharedCutoff), cutoff) => {
            config.consensus = ConsensusPolicy::SharedCutoff {
                cutoff: cutoff.unwrap_or(0.4),
            }
        }
        (None, Some(cutoff)) => config.consensus = ConsensusPolicy::SharedCutoff { cutoff },
        (None, None) => {}
    }
    if let Some(search) = args.search {
        config.search.strategy = match search {
            SearchCli::Randomized => SearchStrategy::Randomized,
            SearchCli::Grid => SearchStrategy::Grid,
            SearchCli::Disabled => SearchStrategy::Disabled,
        };
    }
    if let Some(n) = args.search_candidates {
        config.search.candidates = n;
    }
    if let Some(n) = args.top_n {
        config.top_n = n;
    }
    if let Some(epsilon) = args.epsilon {
        config.epsilon = epsilon;
    }
    if let Some(cap) = args.background_cap {
        config.background_cap = cap;
    }
    if args.all_periods {
        config.window_start = None;
        config.window_end = None;
    }
    if args.window_start.is_some() {
        config.window_start = args.window_start;
    }
    if args.window_end.is_some() {
        config.window_end = args.window_end;
    }
    Ok(config)
}
