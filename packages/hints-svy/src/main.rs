use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand};

use hints_svy::config::AnalysisConfig;
use hints_svy::io::load_dataset;
use hints_svy::pipeline;
use hints_svy::report::dataset_overview;

#[derive(Parser)]
#[command(
    name = "hints-svy",
    version,
    about = "Design-based analysis of HINTS public-use survey files",
    long_about = "Loads HINTS cycles, recodes raw codes into labelled factors, and computes \
                 weighted crosstabs, Rao-Scott chi-square tests and survey-weighted GLMs \
                 with replicate-weight or linearization variance."
)]
struct Cli {
    /// Log debug output (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the analysis described by a TOML config
    #[command(about = "Run an analysis config and print the results")]
    Run {
        /// Path to the analysis config (.toml)
        config: PathBuf,
    },

    /// Describe a data file
    #[command(about = "Show shape, column types and labels of a .dta or .csv file")]
    Inspect {
        /// Path to a .dta or .csv file
        file: PathBuf,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default))
        .format_timestamp(None)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match cli.command {
        Commands::Run { config } => run_command(&config),
        Commands::Inspect { file } => inspect_command(&file),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn run_command(config_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let config = AnalysisConfig::from_path(config_path)?;
    let report = pipeline::run(&config)?;
    println!("{}", report);
    Ok(())
}

fn inspect_command(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let ds = load_dataset(path)?;
    println!("{}: {} rows x {} columns", path.display(), ds.height(), ds.column_names().len());
    println!("{}", dataset_overview(&ds)?);
    Ok(())
}
