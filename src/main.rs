use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use trafficctl::config::{ApiConfig, ControllerConfig, LoggingConfig};
use trafficctl::stats::Profile;
use trafficctl::transport::http::HttpTransport;
use trafficctl::verify::{self, VerificationResult};
use trafficctl::TestController;

#[derive(Parser)]
#[command(
    name = "trafficctl",
    about = "Drive remote traffic generators and verify traffic statistics against tolerances",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (defaults to $TRAFFICCTL_CONFIG, then /etc/trafficctl/trafficctl.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a test on the controller, run it, and verify the traffic
    Run {
        /// Test configuration file path on the controller host
        #[arg(long)]
        test: String,

        /// API setting as key=value (site_url, api_version, request_timeout_sec)
        #[arg(long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,

        /// Check only these streams (comma separated); all when omitted
        #[arg(long, value_delimiter = ',')]
        streams: Vec<String>,

        /// Run the outage/loss threshold check while traffic flows
        #[arg(long)]
        verify: bool,

        /// Check every flow group in the flow statistics view once
        #[arg(long)]
        flow_groups: bool,

        /// Compare the live statistics against this saved profile
        #[arg(long)]
        golden: Option<PathBuf>,

        /// Save the captured statistics profile to this file
        #[arg(long)]
        save_profile: Option<PathBuf>,

        /// Sample run-time metrics until the test ends and write them here
        #[arg(long)]
        stats_out: Option<PathBuf>,
    },

    /// Compare two saved traffic profiles
    Compare {
        /// Baseline profile (JSON)
        baseline: PathBuf,

        /// Profile to check against the baseline (JSON)
        current: PathBuf,

        /// Allowed loss % difference per stream
        #[arg(long, default_value = "5")]
        loss_tolerance: f64,

        /// Allowed frame rate difference per stream
        #[arg(long, default_value = "2")]
        rate_tolerance: f64,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Validate the effective configuration and print it
    CheckConfig,
}

fn parse_param(raw: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))?;
    Ok((key.trim().to_string(), value.trim().to_string()))
}

fn load_config(path: Option<&Path>) -> Result<ControllerConfig> {
    match path {
        Some(path) => ControllerConfig::load(path),
        None => Ok(ControllerConfig::load_or_default()),
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Overlay `--param` pairs on the API section of the loaded config.
fn apply_params(api: &ApiConfig, params: &[(String, String)]) -> Result<ApiConfig> {
    let mut merged = BTreeMap::new();
    merged.insert("site_url".to_string(), api.site_url.clone());
    merged.insert("api_version".to_string(), api.api_version.clone());
    merged.insert(
        "request_timeout_sec".to_string(),
        api.request_timeout_sec.to_string(),
    );
    merged.extend(params.iter().cloned());
    Ok(ApiConfig::from_params(&merged)?)
}

fn print_verification(result: &VerificationResult) {
    println!("\n=== Traffic Verification ===");
    println!("{:<35} | {:<6} | Details", "Port Pair | Stream", "Status");
    println!("{:-<35}-|-{:-<6}-|-{:-<50}", "", "", "");
    for (entity, verdict) in &result.per_entity {
        let status = if verdict.overall { "PASS" } else { "FAIL" };
        println!("{:<35} | {:<6} | {}", entity, status, verdict.outage.reason);
        println!("{:<35} | {:<6} | {}", "", "", verdict.loss.reason);
        println!("{:<35} | {:<6} | {}", "", "", verdict.rate.reason);
    }
    println!();
}

fn print_comparison(report: &verify::ComparisonReport) {
    println!("\n=== Profile Comparison ===");
    println!("Pairs compared: {}", report.pairs_compared);
    for skipped in &report.skipped_pairs {
        println!(" - skipped {}", skipped);
    }
    for violation in &report.violations {
        println!(" - {}", violation);
    }
    println!("Verdict:        {}", if report.passed() { "PASS" } else { "FAIL" });
    println!();
}

struct RunArgs {
    test: String,
    streams: Vec<String>,
    verify: bool,
    flow_groups: bool,
    golden: Option<PathBuf>,
    save_profile: Option<PathBuf>,
    stats_out: Option<PathBuf>,
}

async fn drive(controller: &mut TestController, args: &RunArgs) -> Result<()> {
    if let Some(path) = &args.golden {
        controller.set_golden(Profile::load(path)?);
    }

    controller.load_test(&args.test).await?;
    controller.start_test().await?;

    let outcome = run_checks(controller, args).await;
    controller.conclude(outcome).await
}

async fn run_checks(controller: &mut TestController, args: &RunArgs) -> Result<()> {
    if args.verify {
        let result = controller.check_traffic(&args.streams).await;
        if let Ok(result) = &result {
            print_verification(result);
        }
        result?;
    }

    if args.flow_groups {
        let result = controller.check_flow_groups(&args.streams).await;
        if let Ok(result) = &result {
            print_verification(result);
        }
        result?;
    }

    if args.save_profile.is_some() || args.golden.is_some() {
        let profile = controller.capture_profile(false).await?;
        println!("{}", profile);
        if let Some(path) = &args.save_profile {
            profile.save(path)?;
            println!("Profile {} saved to {}", profile.id(), path.display());
        }
    }
    if args.golden.is_some() {
        let report = controller.compare_to_golden().await?;
        print_comparison(&report);
    }

    if let Some(path) = &args.stats_out {
        let run = controller.gather_stats().await?;
        let json = serde_json::to_string_pretty(&run)?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write statistics: {}", path.display()))?;
        println!(
            "{} metric sample(s) written to {} ({} skipped)",
            run.fetches,
            path.display(),
            run.skipped
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_deref())?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Run {
            test,
            params,
            streams,
            verify,
            flow_groups,
            golden,
            save_profile,
            stats_out,
        } => {
            config.api = apply_params(&config.api, &params)?;
            tracing::info!(site = %config.api.site_url, %test, "Starting controller run");

            let transport = Arc::new(HttpTransport::new(config.api.request_timeout())?);
            let mut controller = TestController::connect(transport, config).await?;
            let args = RunArgs {
                test,
                streams,
                verify,
                flow_groups,
                golden,
                save_profile,
                stats_out,
            };
            let outcome = drive(&mut controller, &args).await;
            controller.release().await;
            outcome?;
        }
        Commands::Compare {
            baseline,
            current,
            loss_tolerance,
            rate_tolerance,
            json,
        } => {
            let baseline = Profile::load(&baseline)?;
            let current = Profile::load(&current)?;
            let report = verify::compare(&baseline, &current, loss_tolerance, rate_tolerance)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_comparison(&report);
            }
            report.into_result()?;
        }
        Commands::CheckConfig => {
            config.validate()?;
            println!("{}", toml::to_string_pretty(&config)?);
            println!("Configuration OK");
        }
    }

    Ok(())
}
