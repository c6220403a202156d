use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};

use leased::config::Config;
use leased::error::Error;
use leased::server::{DHCP_CLIENT_PORT, DHCP_SERVER_PORT, InterfaceWorker};
use leased::{daemon, Result};

#[derive(Parser)]
#[command(name = "leased")]
#[command(version, about = "A DHCPv4 server daemon for directly-attached networks")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "/etc/leased.conf")]
    config: PathBuf,

    /// Stay in the foreground even when a pidfile is configured
    #[arg(short, long)]
    foreground: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("leased: {}", err);
            return ExitCode::FAILURE;
        }
    };

    if !cli.foreground
        && let Some(pidfile) = config.pidfile.clone()
        && let Err(err) = daemon::daemonize(&pidfile)
    {
        eprintln!("leased: {}", err);
        return ExitCode::FAILURE;
    }

    if let Err(err) = daemon::init_logging(&config) {
        eprintln!("leased: {}", err);
        return ExitCode::FAILURE;
    }

    // The runtime is built after the daemonization fork on purpose.
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!("Failed to start the async runtime: {}", err);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(serve(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{}", err);
            ExitCode::FAILURE
        }
    }
}

async fn serve(config: Config) -> Result<()> {
    info!(
        "Starting leased[{}], server port {}, client port {}",
        std::process::id(),
        DHCP_SERVER_PORT,
        DHCP_CLIENT_PORT
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut workers = Vec::new();
    for (name, interface) in &config.interfaces {
        // A failing interface never takes the others down with it.
        match InterfaceWorker::new(name.clone(), interface) {
            Ok(worker) => workers.push(tokio::spawn(worker.run(shutdown_rx.clone()))),
            Err(err) => error!("Interface {} failed to start: {}", name, err),
        }
    }

    if workers.is_empty() {
        return Err(Error::Socket(
            "no interface worker could be started".to_string(),
        ));
    }

    wait_for_shutdown().await;
    info!("Exiting leased...");

    let _ = shutdown_tx.send(true);
    for worker in workers {
        let _ = worker.await;
    }

    info!("Shutdown complete");
    Ok(())
}

async fn wait_for_shutdown() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(err) => {
            warn!("Failed to install the SIGTERM handler: {}", err);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}
