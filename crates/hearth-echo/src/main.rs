//! Example hearth worker.
//!
//! Serves two events: `ping` answers "pong" and `echo` streams every chunk
//! it receives straight back to the caller.

use std::process::ExitCode;

use clap::Parser;
use hearth_worker::{
    CancellationToken, EventHandlers, Request, Response, StopHandle, TokenManagerRegistry,
    Worker, WorkerArgs, WorkerConfig,
};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Example worker answering `ping` and `echo`.
#[derive(Parser, Debug)]
#[command(name = "hearth-echo")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    worker: WorkerArgs,

    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let config = WorkerConfig::load(&cli.worker)?;

    let filter = if cli.verbose || config.debug {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    let mut worker = Worker::connect(&config, &TokenManagerRegistry::new()).await?;
    worker.set_termination_handler(|_deadline| async {
        info!("terminating, nothing to clean up");
    });
    tokio::spawn(stop_on_signal(worker.stop_handle()));

    let handlers = EventHandlers::new().on("ping", ping).on("echo", echo);
    match worker.run(handlers).await {
        Ok(shutdown) => {
            info!(?shutdown, "worker finished");
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            error!(error = %e, "worker failed");
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn ping(_request: Request, response: Response) {
    if let Err(e) = response.write("pong") {
        warn!(error = %e, "failed to answer ping");
    }
}

async fn echo(mut request: Request, response: Response) {
    let cancel = CancellationToken::new();
    loop {
        match request.read(&cancel).await {
            Ok(Some(chunk)) => {
                if let Err(e) = response.write(&chunk) {
                    warn!(error = %e, "echo aborted");
                    return;
                }
            }
            Ok(None) => return,
            Err(e) => {
                let _ = response.error_msg(1, &e.to_string());
                return;
            }
        }
    }
}

async fn stop_on_signal(stop: StopHandle) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        () = ctrl_c => info!("received Ctrl+C, stopping"),
        () = terminate => info!("received SIGTERM, stopping"),
    }
    stop.stop();
}
