use super::cloud_worker::spawn_cloud_worker;
use super::lan_server::spawn_lan_server;
use super::lan_worker::spawn_lan_worker;
use super::msg_server::interfaces;
use super::notify_worker::{bind_line, spawn_notify_worker};
use super::ops_worker::spawn_ops_worker;
use super::output_worker::spawn_output_worker;
use super::timer_worker::spawn_timer_worker;
use super::Args;
use amsg::Server;
use anyhow::{bail, Context};
use devd_core::gateway::NodeMapping;
use devd_core::{DaemonContext, DevdConfig};
use std::path::Path;
use devd_daemon::{Daemon, ReqwestClient};
use std::rc::Rc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::mpsc::unbounded_channel;

pub(super) struct BootstrapContext {
    pub(super) daemon: Rc<Daemon>,
    pub(super) server: Server,
}

/// Configuration file plus command line overrides.
pub(super) fn load_config(args: &Args) -> anyhow::Result<DevdConfig> {
    let mut config = match args.config.as_ref() {
        Some(path) => DevdConfig::from_path(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => DevdConfig::default(),
    };
    if let Some(dsn) = args.dsn.as_ref() {
        config.device.dsn = dsn.clone();
    }
    if let Some(host) = args.ads_host.as_ref() {
        config.device.ads_host = host.clone();
    }
    if let Some(socket) = args.socket.as_ref() {
        config.msg.socket_path = socket.clone();
    }
    if config.device.dsn.is_empty() {
        bail!("device serial number not configured");
    }
    Ok(config)
}

/// Rewrites the node mappings of the configuration file. Command line
/// overrides are not persisted.
pub(super) fn save_node_mappings(path: &Path, mappings: Vec<NodeMapping>) -> anyhow::Result<()> {
    let mut config = if path.exists() {
        DevdConfig::from_path(path).with_context(|| format!("failed to load config {}", path.display()))?
    } else {
        DevdConfig::default()
    };
    config.gateway.node_mappings = mappings;
    config.save(path).with_context(|| format!("failed to save config {}", path.display()))
}

pub(super) async fn bootstrap(args: Args) -> anyhow::Result<BootstrapContext> {
    let config = load_config(&args)?;
    eprintln!("[devd] dsn={} cloud={}", config.device.dsn, config.device.ads_host);

    let (output_tx, output_rx) = unbounded_channel();
    let daemon = Daemon::new(DaemonContext::new(config.clone(), Instant::now()), output_tx);

    if let Some(dir) = config.msg.socket_path.parent() {
        std::fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    }
    let server = Server::bind(&config.msg.socket_path, config.msg.max_sessions, interfaces(daemon.clone())?)
        .with_context(|| format!("failed to bind {}", config.msg.socket_path.display()))?;

    let reg_line = bind_line().await.context("failed to bind notify socket")?;
    let (notify_tx, notify_rx) = unbounded_channel();
    spawn_notify_worker(daemon.clone(), reg_line, notify_rx);
    spawn_output_worker(
        daemon.clone(),
        server.clone(),
        output_rx,
        notify_tx,
        config.ota.command.clone(),
        args.config.clone(),
    );

    spawn_cloud_worker(daemon.clone(), ReqwestClient::new().context("cloud http client")?);
    spawn_ops_worker(
        daemon.clone(),
        ReqwestClient::new().context("ops http client")?,
        ReqwestClient::new().context("lan http client")?,
    );
    spawn_lan_worker(daemon.clone(), ReqwestClient::new().context("lan http client")?);
    spawn_timer_worker(daemon.clone());

    let listener = TcpListener::bind(&config.lan_server.listen)
        .await
        .with_context(|| format!("failed to bind LAN endpoint {}", config.lan_server.listen))?;
    eprintln!("[devd] lan endpoint listening on http://{}", config.lan_server.listen);
    spawn_lan_server(daemon.clone(), listener);

    // Link monitoring is left to the platform; the daemon assumes a network.
    daemon.update(|ctx, _| ctx.net_up());
    Ok(BootstrapContext { daemon, server })
}
