use anyhow::Result;
use clap::{Parser, Subcommand};
use log::info;
use std::path::PathBuf;
use swing_engine::commands::{backtest, batch, import, signal, EngineOverrides};
use swing_engine::config::ExitMode;

const DEFAULT_MARKET_DATA_FILE: &str = "data/market-data.bin";

#[derive(Parser)]
#[command(name = "swing-engine")]
#[command(about = "Swing-trading signal scoring and backtest simulation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Debug, Clone, Default)]
struct EngineArgs {
    /// Starting capital for each simulated instrument
    #[arg(long = "initial-capital", value_name = "AMOUNT")]
    initial_capital: Option<f64>,
    /// Minimum BUY confidence (0-100) required to open a position
    #[arg(long = "entry-threshold", value_name = "CONFIDENCE")]
    entry_threshold: Option<f64>,
    /// Close positions held for at least this many days
    #[arg(long = "max-hold-days", value_name = "DAYS")]
    max_hold_days: Option<i64>,
    /// Stop/target model used for exits
    #[arg(long = "exit-mode", value_enum)]
    exit_mode: Option<ExitMode>,
}

impl From<EngineArgs> for EngineOverrides {
    fn from(args: EngineArgs) -> Self {
        Self {
            initial_capital: args.initial_capital,
            entry_confidence_threshold: args.entry_threshold,
            max_hold_days: args.max_hold_days,
            exit_mode: args.exit_mode,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Score the latest bar of each instrument and print BUY/SELL/HOLD with reasons
    Signal {
        /// Tickers to evaluate (defaults to every ticker in the snapshot)
        #[arg(value_delimiter = ',', num_args = 0..)]
        tickers: Vec<String>,
        /// Path to the market data snapshot file
        #[arg(long = "data-file", value_name = "PATH")]
        data_file: Option<PathBuf>,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Replay the signal engine over one instrument's history
    Backtest {
        /// Ticker to simulate
        ticker: String,
        /// Path to the market data snapshot file
        #[arg(long = "data-file", value_name = "PATH")]
        data_file: Option<PathBuf>,
        #[command(flatten)]
        engine: EngineArgs,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Backtest many instruments in parallel, each in isolation
    Batch {
        /// Tickers to simulate (defaults to every ticker in the snapshot)
        #[arg(value_delimiter = ',', num_args = 0..)]
        tickers: Vec<String>,
        /// Path to the market data snapshot file
        #[arg(long = "data-file", value_name = "PATH")]
        data_file: Option<PathBuf>,
        #[command(flatten)]
        engine: EngineArgs,
        /// Worker threads (defaults to the number of logical CPUs)
        #[arg(long)]
        workers: Option<usize>,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Convert a JSON market data document into a binary snapshot
    Import {
        /// JSON document with settings and per-ticker bars
        input: PathBuf,
        /// Destination file for the snapshot
        #[arg(short, long = "output", value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("Starting swing-engine. Not financial advice.");

    match cli.command {
        Commands::Signal {
            tickers,
            data_file,
            json,
        } => {
            let market_data_path = resolve_market_data_path(data_file);
            signal::run(&market_data_path, &tickers, json)?;
        }
        Commands::Backtest {
            ticker,
            data_file,
            engine,
            json,
        } => {
            let market_data_path = resolve_market_data_path(data_file);
            backtest::run(&market_data_path, &ticker, &engine.into(), json)?;
        }
        Commands::Batch {
            tickers,
            data_file,
            engine,
            workers,
            json,
        } => {
            let market_data_path = resolve_market_data_path(data_file);
            batch::run(&market_data_path, &tickers, &engine.into(), workers, json)?;
        }
        Commands::Import { input, output } => {
            let output_path = resolve_market_data_path(output);
            import::run(&input, &output_path)?;
        }
    }

    Ok(())
}

fn resolve_market_data_path(cli_value: Option<PathBuf>) -> PathBuf {
    if let Some(path) = cli_value {
        return path;
    }

    PathBuf::from(DEFAULT_MARKET_DATA_FILE)
}
