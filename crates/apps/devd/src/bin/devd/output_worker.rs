use super::bootstrap::save_node_mappings;
use super::msg_server::{broadcast_app, broadcast_dests};
use amsg::Server;
use devd_core::notify::NotifyOutput;
use devd_core::DaemonOutput;
use devd_daemon::ota::run_ota;
use devd_daemon::Daemon;
use std::path::PathBuf;
use std::rc::Rc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

/// Routes everything the daemon context asks for outside itself.
pub(super) fn spawn_output_worker(
    daemon: Rc<Daemon>,
    server: Server,
    mut outputs: UnboundedReceiver<DaemonOutput>,
    notify: UnboundedSender<NotifyOutput>,
    ota_command: Option<PathBuf>,
    config_path: Option<PathBuf>,
) {
    tokio::task::spawn_local(async move {
        while let Some(output) = outputs.recv().await {
            match output {
                DaemonOutput::App(message) => broadcast_app(&server, &message),
                DaemonOutput::Dests(dests) => broadcast_dests(&server, dests),
                DaemonOutput::Notify(output) => {
                    if notify.send(output).is_err() {
                        log::warn!("devd: notify worker gone");
                    }
                }
                DaemonOutput::CancelRequests => daemon.cancel_requests(),
                DaemonOutput::Reset { factory } => {
                    let kind = if factory { "factory reset" } else { "reset" };
                    log::warn!("devd: cloud requested {kind}, exiting");
                    eprintln!("[devd] {kind} requested");
                    daemon.shutdown();
                }
                DaemonOutput::Ota(image) => match ota_command.clone() {
                    Some(program) => {
                        let daemon = daemon.clone();
                        tokio::task::spawn_local(async move {
                            let status = run_ota(&program, &image).await;
                            daemon.update(|ctx, now| ctx.ota_result(status, now));
                        });
                    }
                    None => log::warn!("devd: OTA {} ready but no OTA command configured", image.ver),
                },
                DaemonOutput::NodesChanged(mappings) => match config_path.as_deref() {
                    Some(path) => {
                        if let Err(err) = save_node_mappings(path, mappings) {
                            log::error!("devd: node mappings not saved: {err:#}");
                        }
                    }
                    None => log::warn!("devd: no config file, {} node mappings kept in memory", mappings.len()),
                },
            }
        }
    });
}
