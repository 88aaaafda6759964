//! Daily price scheduler.
//!
//! Exit codes: 0 all symbols healthy, 1 partial failure, 2 all failed,
//! 3 configuration error (no symbols, unreadable symbols file,
//! unregistered pipeline).

use std::path::PathBuf;
use std::time::Duration;

use chrono::NaiveDate;
use clap::Parser;

use spine_cli::{output, registration, startup};
use spine_scheduler::{
    OutputSize, PriceScheduleConfig, PriceScheduler, RunMode, ScheduleError,
};

#[derive(Parser, Debug)]
#[command(name = "schedule_prices")]
#[command(about = "Daily price ingest scheduler")]
#[command(version)]
struct Args {
    /// Symbols to ingest (comma-separated)
    #[arg(long, value_delimiter = ',')]
    symbols: Vec<String>,

    /// File with one symbol per line (alternative to --symbols)
    #[arg(long, conflicts_with = "symbols")]
    symbols_file: Option<PathBuf>,

    /// Seconds to sleep between upstream calls
    #[arg(long, default_value_t = 1)]
    sleep: u64,

    /// How much history to request
    #[arg(long, default_value = "compact", value_parser = ["compact", "full"])]
    outputsize: String,

    /// Run for real or report what would run
    #[arg(long, default_value = "run", value_parser = ["run", "dry-run"])]
    mode: String,

    /// Abort the sweep on the first symbol failure
    #[arg(long)]
    fail_fast: bool,

    /// Emit the report as JSON
    #[arg(long)]
    json: bool,

    /// Database URL or path (overrides SPINE_DATABASE_URL)
    #[arg(long)]
    db: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Capture date override (testing)
    #[arg(long, hide = true)]
    as_of: Option<String>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    startup::init_tracing(args.verbose);
    std::process::exit(run(args).await);
}

async fn run(args: Args) -> i32 {
    let config = match build_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return 3;
        }
    };

    let runtime = match startup::bootstrap(args.db.as_deref()).await {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("startup failed: {e}");
            return 2;
        }
    };

    let scheduler = PriceScheduler::new(runtime.dispatcher.clone(), runtime.store.clone(), config);
    match scheduler.run().await {
        Ok(report) => {
            output::print_report(&report, args.json);
            report.exit_code()
        }
        Err(ScheduleError::Configuration(e)) => {
            eprintln!("configuration error: {e}");
            3
        }
        Err(ScheduleError::Store(e)) => {
            eprintln!("storage error: {e}");
            2
        }
    }
}

fn build_config(args: &Args) -> Result<PriceScheduleConfig, String> {
    let symbols = if let Some(path) = &args.symbols_file {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read symbols file {}: {e}", path.display()))?;
        text.lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect()
    } else {
        args.symbols.clone()
    };

    let outputsize: OutputSize = args.outputsize.parse()?;
    let mode: RunMode = args.mode.parse()?;
    let as_of = args
        .as_of
        .as_deref()
        .map(|d| {
            NaiveDate::parse_from_str(d, "%Y-%m-%d")
                .map_err(|e| format!("invalid as-of date '{d}': {e}"))
        })
        .transpose()?;

    let mut config = PriceScheduleConfig::new(registration::PRICES_INGEST, symbols);
    config.sleep = Duration::from_secs(args.sleep);
    config.outputsize = outputsize;
    config.mode = mode;
    config.fail_fast = args.fail_fast;
    config.as_of = as_of;
    Ok(config)
}
