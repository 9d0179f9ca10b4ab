use super::cloud_worker::send_until;
use devd_core::HttpClient;
use devd_daemon::Daemon;
use std::rc::Rc;

/// Key exchanges, command fetches and command replies towards LAN clients.
pub(super) fn spawn_lan_worker<H: HttpClient + 'static>(daemon: Rc<Daemon>, http: H) {
    tokio::task::spawn_local(async move {
        while !daemon.is_shutting_down() {
            let next = daemon.next_work(|ctx, now| ctx.next_lan_request(now), Option::is_none);
            let Some(step) = next else {
                if !daemon.wait(None).await {
                    break;
                }
                continue;
            };
            log::debug!("devd: lan #{} {:?} {}", step.id, step.kind, step.request.url);
            let result = send_until(daemon.shutdown_token(), &http, step.request).await;
            daemon.update(|ctx, now| ctx.lan_complete(step.id, step.generation, step.kind, result, now));
        }
        log::debug!("devd: lan worker stopped");
    });
}
