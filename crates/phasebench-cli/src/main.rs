use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use phasebench_runner::benchmark::describe_test;
use phasebench_runner::{
    prepare_test, summarize_run, summarize_test, BenchConfig, Benchmark, JsonStore, MetricsStore,
    RunId, RunReport, RunSummary, TestId, TestSummary,
};
use serde_json::{json, Value};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "phasebench",
    version,
    about = "Phase-aligned concurrency benchmark for container engines"
)]
struct Cli {
    /// YAML configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Overrides store.path.
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    /// Overrides log.path.
    #[arg(long, global = true)]
    log: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a test: an image, a unit count and a number of runs.
    Prepare {
        #[arg(long)]
        image: String,
        #[arg(long)]
        units: usize,
        #[arg(long, default_value_t = 1)]
        repetitions: usize,
        #[arg(long)]
        json: bool,
    },
    /// Execute the runs of a test that have not ended yet.
    Run {
        test_id: TestId,
        #[arg(long)]
        json: bool,
    },
    Summary {
        #[arg(long, conflicts_with = "test", required_unless_present = "test")]
        run: Option<RunId>,
        #[arg(long)]
        test: Option<TestId>,
        #[arg(long)]
        json: bool,
    },
    ShowConfig {
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = load_config(&cli).and_then(|config| {
        init_logging(config.log.path.as_deref())?;
        run_command(cli.command, config)
    });
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn load_config(cli: &Cli) -> Result<BenchConfig> {
    let mut config = match &cli.config {
        Some(path) => BenchConfig::load(path)?,
        None => BenchConfig::default(),
    };
    if let Some(db) = &cli.db {
        config.store.path = db.clone();
    }
    if let Some(log) = &cli.log {
        config.log.path = Some(log.clone());
    }
    config.validate()?;
    Ok(config)
}

fn log_filter(directives: Option<&str>) -> EnvFilter {
    directives
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

fn init_logging(path: Option<&Path>) -> Result<()> {
    let filter = log_filter(std::env::var(EnvFilter::DEFAULT_ENV).ok().as_deref());
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = match path {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()
        }
        None => builder.with_writer(std::io::stderr).try_init(),
    };
    installed.map_err(|err| anyhow!("failed to install log subscriber: {}", err))
}

fn open_store(config: &BenchConfig) -> Result<JsonStore> {
    JsonStore::open(&config.store.path)
        .with_context(|| format!("failed to open store {}", config.store.path.display()))
}

fn run_command(command: Commands, config: BenchConfig) -> Result<Option<Value>> {
    match command {
        Commands::Prepare {
            image,
            units,
            repetitions,
            json,
        } => {
            let store = open_store(&config)?;
            let test_id = prepare_test(&store, &image, units, repetitions)?;
            let test = store.test(test_id)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "prepare",
                    "test": serde_json::to_value(&test)?,
                    "store": config.store.path.display().to_string()
                })));
            }
            println!("{}", describe_test(&test));
            println!("test_id: {}", test_id);
        }
        Commands::Run { test_id, json } => {
            let bench = Benchmark::from_config(&config)?;
            let reports = bench.run_test(test_id)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "test_id": test_id,
                    "runs": reports.iter().map(run_report_to_json).collect::<Vec<_>>()
                })));
            }
            if reports.is_empty() {
                println!("test {}: every run has already ended", test_id);
            }
            for report in &reports {
                print_run_report(report);
            }
        }
        Commands::Summary { run, test, json } => {
            let store = open_store(&config)?;
            if let Some(run_id) = run {
                let summary = summarize_run(&store, run_id)?;
                if json {
                    return Ok(Some(json!({
                        "ok": true,
                        "command": "summary",
                        "run": serde_json::to_value(&summary)?
                    })));
                }
                print_run_summary(&summary);
            } else if let Some(test_id) = test {
                let summary = summarize_test(&store, test_id)?;
                if json {
                    return Ok(Some(json!({
                        "ok": true,
                        "command": "summary",
                        "test": serde_json::to_value(&summary)?
                    })));
                }
                print_test_summary(&summary);
            }
        }
        Commands::ShowConfig { json } => {
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "show-config",
                    "config": serde_json::to_value(&config)?
                })));
            }
            print!("{}", serde_yaml::to_string(&config)?);
        }
    }
    Ok(None)
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Prepare { json, .. }
        | Commands::Run { json, .. }
        | Commands::Summary { json, .. }
        | Commands::ShowConfig { json } => *json,
    }
}

fn run_report_to_json(report: &RunReport) -> Value {
    json!({
        "run_id": report.run_id,
        "succeeded": report.succeeded(),
        "failed": report.failed(),
        "disk_delta": report.disk_delta,
        "response_time_ms": report.response_time.map(|d| d.as_millis() as u64),
        "elapsed_ms": report.elapsed.as_millis() as u64
    })
}

fn print_run_report(report: &RunReport) {
    println!("run_id: {}", report.run_id);
    println!("  succeeded: {}", report.succeeded());
    println!("  failed: {}", report.failed());
    match report.disk_delta {
        Some(delta) => println!("  disk_delta: {} B", delta),
        None => println!("  disk_delta: unavailable"),
    }
    match report.response_time {
        Some(latency) => println!("  response_time: {} ms", latency.as_millis()),
        None => println!("  response_time: not measured"),
    }
    println!("  elapsed: {:.1} s", report.elapsed.as_secs_f64());
}

fn print_run_summary(summary: &RunSummary) {
    println!("run_id: {} (test {})", summary.run_id, summary.test_id);
    println!("ended: {}", summary.ended);
    println!(
        "units: {} ({} succeeded, {} failed, {} without outcome)",
        summary.units, summary.succeeded, summary.failed, summary.pending
    );
    for (kind, count) in &summary.errors_by_kind {
        println!("  {}: {}", kind, count);
    }
    if let Some(cpu) = summary.cpu_percent {
        println!("cpu: mean {:.2}% max {:.2}%", cpu.mean, cpu.max);
    }
    if let Some(memory) = summary.memory_percent {
        println!("memory: mean {:.2}% max {:.2}%", memory.mean, memory.max);
    }
    if let Some(startup) = summary.mean_startup_ms {
        println!("startup: mean {:.1} ms", startup);
    }
    if let Some(delta) = summary.disk_delta {
        println!("disk_delta: {} B", delta);
    }
    if let Some(latency) = summary.response_time_ms {
        println!("response_time: {} ms", latency);
    }
}

fn print_test_summary(summary: &TestSummary) {
    println!(
        "test {}: {} x {} units, {}/{} runs ended ({} unfinished)",
        summary.test_id,
        summary.image_id,
        summary.number_of_units,
        summary.runs_ended,
        summary.repetitions,
        summary.runs_unfinished
    );
    let show = |label: &str, value: Option<f64>, unit: &str| match value {
        Some(v) => println!("{}: {:.2}{}", label, v, unit),
        None => println!("{}: n/a", label),
    };
    show("mean cpu", summary.mean_cpu_percent, "%");
    show("mean memory", summary.mean_memory_percent, "%");
    show("mean startup", summary.mean_startup_ms, " ms");
    show("mean disk_delta", summary.mean_disk_delta, " B");
    show("mean response_time", summary.mean_response_time_ms, " ms");
}
