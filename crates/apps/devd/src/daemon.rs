use devd_core::{DaemonContext, DaemonOutput};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Instant;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// The daemon context shared by every worker on the local task set.
///
/// Workers take work out of the context, perform the I/O, and feed the result
/// back through [`Daemon::update`]. Every update wakes the other workers and
/// forwards the context's outputs to the dispatcher channel.
pub struct Daemon {
    ctx: RefCell<DaemonContext>,
    changed: Notify,
    shutdown: CancellationToken,
    requests: RefCell<CancellationToken>,
    outputs: UnboundedSender<DaemonOutput>,
}

impl Daemon {
    pub fn new(ctx: DaemonContext, outputs: UnboundedSender<DaemonOutput>) -> Rc<Self> {
        let shutdown = CancellationToken::new();
        Rc::new(Self {
            ctx: RefCell::new(ctx),
            changed: Notify::new(),
            requests: RefCell::new(shutdown.child_token()),
            shutdown,
            outputs,
        })
    }

    /// Applies an event to the context and wakes the workers.
    pub fn update<R>(&self, f: impl FnOnce(&mut DaemonContext, Instant) -> R) -> R {
        let result = self.apply(f);
        self.changed.notify_waiters();
        result
    }

    /// Takes the next piece of work. Other workers are only woken when work
    /// was found or the context produced output, so idle polls stay quiet.
    pub fn next_work<R>(
        &self,
        f: impl FnOnce(&mut DaemonContext, Instant) -> R,
        is_idle: impl FnOnce(&R) -> bool,
    ) -> R {
        let mut forwarded = false;
        let result = {
            let mut ctx = self.ctx.borrow_mut();
            let result = f(&mut ctx, Instant::now());
            for output in ctx.drain_outputs() {
                forwarded = true;
                self.forward(output);
            }
            result
        };
        if forwarded || !is_idle(&result) {
            self.changed.notify_waiters();
        }
        result
    }

    pub fn read<R>(&self, f: impl FnOnce(&DaemonContext) -> R) -> R {
        f(&self.ctx.borrow())
    }

    /// Waits for a context change, the deadline or shutdown. Returns `false`
    /// once the daemon is shutting down.
    pub async fn wait(&self, deadline: Option<Instant>) -> bool {
        let timer = async {
            match deadline {
                Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = self.changed.notified() => true,
            _ = timer => true,
        }
    }

    /// Token for one outgoing request. It fires when cloud requests are
    /// canceled or the daemon shuts down.
    pub fn request_token(&self) -> CancellationToken {
        self.requests.borrow().clone()
    }

    pub fn cancel_requests(&self) {
        let fresh = self.shutdown.child_token();
        let old = std::mem::replace(&mut *self.requests.borrow_mut(), fresh);
        old.cancel();
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn apply<R>(&self, f: impl FnOnce(&mut DaemonContext, Instant) -> R) -> R {
        let mut ctx = self.ctx.borrow_mut();
        let result = f(&mut ctx, Instant::now());
        for output in ctx.drain_outputs() {
            self.forward(output);
        }
        result
    }

    fn forward(&self, output: DaemonOutput) {
        if self.outputs.send(output).is_err() {
            log::debug!("devd: output dispatcher gone, dropping output");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devd_core::{DestMask, DevdConfig};
    use std::time::Duration;
    use tokio::sync::mpsc::unbounded_channel;

    fn daemon() -> (Rc<Daemon>, tokio::sync::mpsc::UnboundedReceiver<DaemonOutput>) {
        let mut config = DevdConfig::default();
        config.device.dsn = "AC000W000000001".to_string();
        let (tx, rx) = unbounded_channel();
        (Daemon::new(DaemonContext::new(config, Instant::now()), tx), rx)
    }

    #[tokio::test(flavor = "current_thread")]
    async fn update_forwards_outputs() {
        let (daemon, mut rx) = daemon();
        daemon.update(|ctx, now| ctx.data_message(b"not json", now));
        match rx.try_recv().expect("output forwarded") {
            DaemonOutput::App(msg) => assert_eq!(msg["cmd"]["op"], "error"),
            other => panic!("unexpected output {other:?}"),
        }
        assert_eq!(daemon.read(|ctx| ctx.dests_avail()), DestMask::NONE);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn wait_ends_on_deadline_and_shutdown() {
        let (daemon, _rx) = daemon();
        let deadline = Instant::now() + Duration::from_millis(20);
        assert!(daemon.wait(Some(deadline)).await);
        assert!(Instant::now() >= deadline);

        daemon.shutdown();
        assert!(!daemon.wait(None).await);
        assert!(daemon.is_shutting_down());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn canceling_requests_leaves_later_requests_alone() {
        let (daemon, _rx) = daemon();
        let first = daemon.request_token();
        daemon.cancel_requests();
        assert!(first.is_cancelled());
        let second = daemon.request_token();
        assert!(!second.is_cancelled());
        daemon.shutdown();
        assert!(second.is_cancelled());
    }
}
