use anyhow::Context;
use clap::Parser;
use drm_lease_manager::{
    args::Args,
    config::Config,
    daemon::Daemon,
    lease::LeaseManager,
};
use tokio::signal::unix::{signal, SignalKind};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if let Ok(env_filter) = tracing_subscriber::EnvFilter::try_from_default_env() {
        tracing_subscriber::fmt()
            .compact()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(args.default_log_filter())
            .compact()
            .init();
    }

    let config = Config::load(&args.config);
    let requests = config.lease_requests();
    let manager = LeaseManager::open(&args.device, requests.as_deref())
        .with_context(|| format!("DRM lease initialization failed on {}", args.device.display()))?;

    let runtime_dir = dlmclient::protocol::runtime_dir();
    let mut daemon = Daemon::new(manager, &runtime_dir, args.daemon_options())
        .context("Client socket initialization failed")?;

    let mut terminate = signal(SignalKind::terminate()).context("Failed to watch SIGTERM")?;
    tokio::select! {
        _ = daemon.run() => tracing::error!("Lease server stopped"),
        _ = tokio::signal::ctrl_c() => tracing::info!("Interrupted, shutting down"),
        _ = terminate.recv() => tracing::info!("Terminated, shutting down"),
    }

    Ok(())
}
