#[path = "devd/bootstrap.rs"]
mod bootstrap;
#[path = "devd/cloud_worker.rs"]
mod cloud_worker;
#[path = "devd/lan_server.rs"]
mod lan_server;
#[path = "devd/lan_worker.rs"]
mod lan_worker;
#[path = "devd/msg_server.rs"]
mod msg_server;
#[path = "devd/notify_worker.rs"]
mod notify_worker;
#[path = "devd/ops_worker.rs"]
mod ops_worker;
#[path = "devd/output_worker.rs"]
mod output_worker;
#[path = "devd/timer_worker.rs"]
mod timer_worker;

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::LocalSet;

#[derive(Parser, Debug)]
#[command(name = "devd", about = "Gateway device daemon")]
struct Args {
    /// TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Path of the application message socket.
    #[arg(long)]
    socket: Option<PathBuf>,
    /// Running in a terminal: log with timestamps.
    #[arg(long)]
    foreground: bool,
    /// Log filter, overrides RUST_LOG.
    #[arg(long)]
    log_level: Option<String>,
    #[arg(long)]
    dsn: Option<String>,
    #[arg(long)]
    ads_host: Option<String>,
}

fn init_logging(args: &Args) {
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(level) = args.log_level.as_deref() {
        builder.parse_filters(level);
    }
    if !args.foreground {
        builder.format_timestamp(None);
    }
    builder.init();
}

async fn shutdown_signal() -> std::io::Result<&'static str> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    Ok(tokio::select! {
        _ = interrupt.recv() => "SIGINT",
        _ = terminate.recv() => "SIGTERM",
    })
}

async fn run(args: Args) -> anyhow::Result<()> {
    let context = bootstrap::bootstrap(args).await?;
    let daemon = context.daemon.clone();
    let shutdown = daemon.shutdown_token();
    let served = tokio::select! {
        served = context.server.run(msg_server::session_events()) => served.map_err(anyhow::Error::from),
        signal = shutdown_signal() => {
            eprintln!("[devd] {} received, shutting down", signal?);
            Ok(())
        }
        _ = shutdown.cancelled() => Ok(()),
    };
    daemon.shutdown();
    context.server.stop();
    served
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args);
    let local = LocalSet::new();
    match local.run_until(run(args)).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("[devd] fatal: {err:#}");
            ExitCode::FAILURE
        }
    }
}
