//! syncq CLI: exercise the write path against a simulated remote.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use syncq::config::Config;
use syncq::scenario::{BenchReport, Report, Scenario, run_bench};
use syncq::telemetry::{TelemetryConfig, init_telemetry};

#[derive(Parser)]
#[command(name = "syncq", about = "Bounded, debounced write path for dashboard records")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Replay a TOML script of edits through the debounced updater
    Replay {
        /// Path to the scenario script
        script: PathBuf,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run sleeping units through the queue and time the batches
    Bench {
        /// Number of units to submit
        #[arg(long, default_value_t = 4)]
        units: usize,
        /// How long each unit sleeps
        #[arg(long, default_value_t = 10)]
        work_ms: u64,
        /// Concurrency limit (defaults to SYNCQ_CONCURRENCY)
        #[arg(long)]
        concurrency: Option<usize>,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "syncq".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let result = match cli.command {
        Command::Replay { script, json } => cmd_replay(&config, script, json).await,
        Command::Bench {
            units,
            work_ms,
            concurrency,
            json,
        } => cmd_bench(&config, units, work_ms, concurrency, json).await,
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    };

    guard.force_flush();
    result
}

async fn cmd_replay(config: &Config, script: PathBuf, json: bool) -> anyhow::Result<()> {
    let scenario = Scenario::load(&script)?;
    let report = scenario.run(config).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn print_report(report: &Report) {
    println!(
        "concurrency={}  debounce={}ms  elapsed={}ms",
        report.concurrency, report.debounce_ms, report.elapsed_ms
    );
    println!();

    if report.sends.is_empty() {
        println!("No sends reached the remote.");
    } else {
        println!("{:>8}  {:<24}  {:<6}  PAYLOAD", "AT_MS", "KEY", "RESULT");
        println!("{}", "-".repeat(80));
        for send in &report.sends {
            let key_display: String = send.key.to_string().chars().take(24).collect();
            println!(
                "{:>8}  {:<24}  {:<6}  {}",
                send.at_ms,
                key_display,
                if send.ok { "ok" } else { "error" },
                send.payload
            );
        }
    }

    println!();
    println!(
        "{} request(s) -> {} send(s); {} acknowledged, {} failed, {} cancelled; peak in flight {}",
        report.requests,
        report.sends.len(),
        report.acknowledged,
        report.failed,
        report.cancelled,
        report.max_in_flight
    );
}

async fn cmd_bench(
    config: &Config,
    units: usize,
    work_ms: u64,
    concurrency: Option<usize>,
    json: bool,
) -> anyhow::Result<()> {
    let concurrency = concurrency.unwrap_or(config.concurrency_limit);
    if concurrency == 0 {
        anyhow::bail!("--concurrency must be positive");
    }

    let report: BenchReport = run_bench(concurrency, units, work_ms).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Units:       {}", report.units);
        println!("Work:        {}ms each", report.work_ms);
        println!("Concurrency: {}", report.concurrency);
        println!("Max active:  {}", report.max_active);
        println!("Expected:    ~{}ms", report.expected_ms);
        println!("Elapsed:     {}ms", report.elapsed_ms);
    }
    Ok(())
}
