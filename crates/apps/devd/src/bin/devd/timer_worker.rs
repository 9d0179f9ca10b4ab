use devd_core::DaemonContext;
use devd_daemon::Daemon;
use std::rc::Rc;
use std::time::Instant;

pub(super) fn spawn_timer_worker(daemon: Rc<Daemon>) {
    tokio::task::spawn_local(async move {
        loop {
            let deadline = daemon.read(DaemonContext::next_deadline);
            if !daemon.wait(deadline).await {
                break;
            }
            if deadline.is_some_and(|at| at <= Instant::now()) {
                daemon.update(|ctx, now| ctx.poll(now));
            }
        }
    });
}
