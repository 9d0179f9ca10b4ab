use super::cloud_worker::send_until;
use devd_core::{HttpClient, OpWork};
use devd_daemon::Daemon;
use std::rc::Rc;

/// Drains the operation queue. Cloud requests go through `cloud`, which
/// is separate from the cloud worker's client; LAN deliveries go through
/// `lan` and are reported back together.
pub(super) fn spawn_ops_worker<H: HttpClient + 'static>(daemon: Rc<Daemon>, cloud: H, lan: H) {
    tokio::task::spawn_local(async move {
        while !daemon.is_shutting_down() {
            let work = daemon.next_work(
                |ctx, now| ctx.next_op(now),
                |work| matches!(work, OpWork::Idle | OpWork::Wait),
            );
            match work {
                OpWork::Idle | OpWork::Wait => {
                    if !daemon.wait(None).await {
                        break;
                    }
                }
                OpWork::Send(mut request) => loop {
                    let result = send_until(daemon.request_token(), &cloud, request.clone()).await;
                    match daemon.update(|ctx, now| ctx.op_complete(request, result, now)) {
                        Some(again) => request = again,
                        None => break,
                    }
                },
                OpWork::Lan(deliveries) => {
                    let mut results = Vec::with_capacity(deliveries.len());
                    for delivery in deliveries {
                        log::debug!("devd: op post to lan #{}", delivery.lan_id);
                        let result = send_until(daemon.shutdown_token(), &lan, delivery.request).await;
                        results.push((delivery.lan_id, delivery.generation, result));
                    }
                    daemon.update(|ctx, now| ctx.op_lan_complete(results, now));
                }
            }
        }
        log::debug!("devd: ops worker stopped");
    });
}
