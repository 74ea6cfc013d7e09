use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use bugfix_orchestrator::analytics::AnalyticsTracker;
use bugfix_orchestrator::lock::{FsLeaseStore, LockManager};
use bugfix_orchestrator::stage::{
    CommunicateInput, CommunicateOutput, ImplementInput, ImplementOutput, PlanInput, PlanOutput,
    VerifyInput, VerifyOutput,
};
use bugfix_orchestrator::stages::ExecStage;
use bugfix_orchestrator::tracker::CliTracker;
use bugfix_orchestrator::validation::HeuristicValidator;
use bugfix_orchestrator::{Coordinator, OrchestratorConfig, PipelineStages, PollingDriver};

#[derive(Parser, Debug)]
#[command(name = "bugfix-orchestrator", about = "Automated bug-fix pipeline coordinator")]
struct Args {
    /// Run a single discovery pass instead of polling forever.
    #[arg(long)]
    once: bool,

    /// Override the poll interval in seconds.
    #[arg(long)]
    poll_interval: Option<u64>,

    /// Override the per-ticket retry budget.
    #[arg(long)]
    max_retries: Option<u32>,

    /// Override the lock lease directory.
    #[arg(long)]
    lock_dir: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let mut config = OrchestratorConfig::from_env();
    if let Some(secs) = args.poll_interval {
        config.poll_interval = Duration::from_secs(secs);
    }
    if let Some(max) = args.max_retries {
        config.max_retries = max;
    }
    if let Some(dir) = args.lock_dir {
        config.lock_dir = dir;
    }

    info!(
        poll_interval_secs = config.poll_interval.as_secs(),
        max_retries = config.max_retries,
        lock_dir = %config.lock_dir,
        tracker = %config.tracker_bin,
        "bugfix orchestrator starting"
    );

    let locks = LockManager::new(
        Box::new(FsLeaseStore::new(&config.lock_dir)?),
        config.owner.clone(),
        config.lock_staleness,
    );
    let tracker = Arc::new(CliTracker::new(&config.tracker_bin));
    let stages = PipelineStages {
        plan: Arc::new(ExecStage::<PlanInput, PlanOutput>::new(
            "plan",
            &config.plan_command,
        )?),
        implement: Arc::new(ExecStage::<ImplementInput, ImplementOutput>::new(
            "implement",
            &config.implement_command,
        )?),
        verify: Arc::new(ExecStage::<VerifyInput, VerifyOutput>::new(
            "verify",
            &config.verify_command,
        )?),
        communicate: Arc::new(ExecStage::<CommunicateInput, CommunicateOutput>::new(
            "communicate",
            &config.communicate_command,
        )?),
    };
    let analytics = AnalyticsTracker::new(&config.analytics_path);

    let coordinator = Coordinator::new(
        config.clone(),
        tracker,
        locks,
        stages,
        Arc::new(HeuristicValidator),
        analytics,
    );
    let mut driver = PollingDriver::new(coordinator, config.poll_interval);

    if args.once {
        let picked_up = driver.run_once().await;
        info!(picked_up, "single pass finished");
    } else {
        driver.run_forever().await;
    }
    Ok(())
}
