//! reclaim-e2e - run the reclaim scenarios against a live cluster

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use reclaim_context::KubeCluster;
use reclaim_scenarios::{run_suite, ReclaimCase, ScenarioConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Reclaim end-to-end runner
#[derive(Parser)]
#[command(name = "reclaim-e2e")]
#[command(about = "Run scheduler reclaim scenarios against a live cluster", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "RECLAIM_CONFIG")]
    config: Option<String>,

    /// Case to run; repeat for several. Defaults to all.
    #[arg(long = "case", value_enum)]
    cases: Vec<ReclaimCase>,

    /// Print the case names and exit
    #[arg(long)]
    list: bool,

    /// Log level
    #[arg(long, env = "RECLAIM_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Enable JSON logging
    #[arg(long, env = "RECLAIM_LOG_JSON")]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| cli.log_level.clone().into());

    if cli.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    if cli.list {
        for case in ReclaimCase::ALL {
            println!("{}", case);
        }
        return Ok(());
    }

    let config = ScenarioConfig::load(cli.config.as_deref()).context("loading configuration")?;
    let cluster = KubeCluster::try_default()
        .await
        .context("connecting to the cluster")?;

    let cases = if cli.cases.is_empty() {
        ReclaimCase::ALL.to_vec()
    } else {
        cli.cases
    };

    let report = run_suite(Arc::new(cluster), &config, &cases).await;
    for outcome in &report.outcomes {
        println!("{}", outcome);
    }

    if !report.is_success() {
        anyhow::bail!(
            "{} of {} cases failed",
            report.failed(),
            report.outcomes.len()
        );
    }
    Ok(())
}
