//! Phased multi-week FINRA scheduler.
//!
//! Exit codes: 0 all partitions healthy, 1 partial failure, 2 all failed
//! or critical error (DB down, invalid config).

use chrono::NaiveDate;
use clap::Parser;

use spine_cli::{output, registration, startup};
use spine_core::strategy::WeeklyPeriod;
use spine_scheduler::{
    RunMode, ScheduleError, StagePhase, WeeklyPipelines, WeeklyScheduleConfig, WeeklyScheduler,
};

#[derive(Parser, Debug)]
#[command(name = "schedule_finra")]
#[command(about = "Multi-week revision-aware scheduler for FINRA OTC transparency data")]
#[command(version)]
struct Args {
    /// How many recent period-ends to process
    #[arg(long, default_value_t = 4)]
    lookback_weeks: usize,

    /// Explicit week-ending dates (ISO, comma-separated); overrides lookback
    #[arg(long, value_delimiter = ',')]
    weeks: Vec<String>,

    /// Tiers to process
    #[arg(long, value_delimiter = ',', default_values_t = registration::FINRA_TIERS.iter().map(|t| t.to_string()))]
    tiers: Vec<String>,

    /// Source strategy to fetch with
    #[arg(long, default_value = "api", value_parser = ["file", "api"])]
    source: String,

    /// Run for real or report what would run
    #[arg(long, default_value = "run", value_parser = ["run", "dry-run"])]
    mode: String,

    /// Bypass revision detection; always re-capture today's rows
    #[arg(long)]
    force: bool,

    /// Restrict the sweep to one phase
    #[arg(long, default_value = "all", value_parser = ["ingest", "normalize", "calc", "all"])]
    only_stage: String,

    /// Abort the sweep on the first partition failure
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
            return 2;
        }
    };

    let runtime = match startup::bootstrap(args.db.as_deref()).await {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("startup failed: {e}");
            return 2;
        }
    };

    let period: std::sync::Arc<dyn spine_core::strategy::PeriodStrategy> = runtime
        .periods
        .get("weekly")
        .unwrap_or_else(|_| std::sync::Arc::new(WeeklyPeriod::new()));

    let scheduler = WeeklyScheduler::new(
        runtime.dispatcher.clone(),
        runtime.store.clone(),
        runtime.sources.clone(),
        period,
        config,
    );

    match scheduler.run().await {
        Ok(report) => {
            output::print_report(&report, args.json);
            report.exit_code()
        }
        Err(ScheduleError::Configuration(e)) => {
            eprintln!("configuration error: {e}");
            2
        }
        Err(ScheduleError::Store(e)) => {
            eprintln!("storage error: {e}");
            2
        }
    }
}

fn build_config(args: &Args) -> Result<WeeklyScheduleConfig, String> {
    let mode: RunMode = args.mode.parse()?;
    let only_stage: StagePhase = args.only_stage.parse()?;

    let weeks = if args.weeks.is_empty() {
        None
    } else {
        let parsed: Result<Vec<NaiveDate>, _> = args
            .weeks
            .iter()
            .map(|w| {
                NaiveDate::parse_from_str(w, "%Y-%m-%d")
                    .map_err(|e| format!("invalid week '{w}': {e}"))
            })
            .collect();
        Some(parsed?)
    };

    let as_of = args
        .as_of
        .as_deref()
        .map(|d| {
            NaiveDate::parse_from_str(d, "%Y-%m-%d")
                .map_err(|e| format!("invalid as-of date '{d}': {e}"))
        })
        .transpose()?;

    let mut config = WeeklyScheduleConfig::new(
        registration::FINRA_DOMAIN,
        WeeklyPipelines {
            ingest: registration::FINRA_INGEST.to_string(),
            normalize: registration::FINRA_NORMALIZE.to_string(),
            calcs: registration::FINRA_CALCS.iter().map(|c| c.to_string()).collect(),
        },
    );
    config.lookback_weeks = args.lookback_weeks;
    config.weeks = weeks;
    config.tiers = args.tiers.clone();
    config.source_key = args.source.clone();
    config.mode = mode;
    config.force = args.force;
    config.only_stage = only_stage;
    config.fail_fast = args.fail_fast;
    config.as_of = as_of;
    Ok(config)
}
