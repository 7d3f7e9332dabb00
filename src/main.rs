use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use hypha::config::AppConfig;
use hypha::flow::{FlowEngine, FlowRegistration};
use hypha::platform::github::GitHubPlatform;
use hypha::platform::ReviewPlatform;
use hypha::processor::{CheckCommandHandler, PullRequestHandler, PullRequestProcessor};
use hypha::shutdown::shutdown_token;
use hypha::vcs::{GitClient, Vcs};

#[derive(Parser)]
#[command(name = "hypha", about = "Pull request automation daemon")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// List registered flows and exit
    #[arg(short, long)]
    list: bool,

    /// Enable debug logs
    #[arg(short, long)]
    verbose: bool,

    /// Base working directory override
    #[arg(long)]
    work_dir: Option<PathBuf>,

    /// File to write the daemon pid into
    #[arg(long)]
    pid_file: Option<PathBuf>,
}

/// Ordered list of the flows this daemon runs. New flows are registered
/// here, by the startup routine, not via global state.
fn registered_flows() -> Vec<FlowRegistration> {
    vec![FlowRegistration {
        name: "pull-request-checks",
        factory: Box::new(|config, workdir| {
            let platform: Arc<dyn ReviewPlatform> =
                Arc::new(GitHubPlatform::new(&config.github)?);
            let vcs: Arc<dyn Vcs> = Arc::new(GitClient::new());
            let handler: Arc<dyn PullRequestHandler> =
                Arc::new(CheckCommandHandler::new(&config.repo, Arc::clone(&vcs)));
            Ok(Box::new(PullRequestProcessor::new(
                "pull-request-checks",
                &config.repo,
                workdir.to_path_buf(),
                platform,
                vcs,
                handler,
            )))
        }),
    }]
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let registrations = registered_flows();
    if cli.list {
        for registration in &registrations {
            println!("{}", registration.name);
        }
        return Ok(());
    }

    // Initialize tracing
    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = AppConfig::load(cli.config.as_deref())?;
    if let Some(work_dir) = cli.work_dir {
        config.daemon.work_dir = work_dir;
    }
    if let Some(pid_file) = cli.pid_file {
        config.daemon.pid_file = Some(pid_file);
    }

    if let Some(pid_file) = &config.daemon.pid_file {
        std::fs::write(pid_file, std::process::id().to_string())?;
    }

    tracing::info!(
        work_dir = %config.daemon.work_dir.display(),
        repo = %format!("{}/{}", config.repo.owner, config.repo.name),
        delay_secs = config.daemon.delay_secs,
        "Starting hypha daemon"
    );

    let cancel = shutdown_token();

    let mut tasks = tokio::task::JoinSet::new();
    for registration in registrations {
        let workdir = config.daemon.work_dir.join(registration.name);
        tokio::fs::create_dir_all(&workdir).await?;

        tracing::info!(flow = registration.name, workdir = %workdir.display(), "Run flow");
        let flow = (registration.factory)(&config, &workdir)?;
        let engine = FlowEngine::new(workdir, config.delay(), cancel.clone()).await?;
        tasks.spawn(engine.run(flow));
    }

    while let Some(result) = tasks.join_next().await {
        if let Err(err) = result {
            tracing::error!(error = %err, "Flow task aborted");
        }
    }

    tracing::info!("All flows have finished");
    Ok(())
}
