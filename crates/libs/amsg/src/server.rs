use crate::endpoint::Endpoint;
use crate::error::AmsgError;
use crate::interface::Interfaces;
use crate::sys;
use std::cell::RefCell;
use std::os::fd::{AsFd, OwnedFd};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tokio::io::unix::AsyncFd;
use tokio_util::sync::CancellationToken;

const DEFAULT_BACKLOG: i32 = 32;
const SOCKET_MODE: u32 = 0o660;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    Connected,
    Disconnected,
}

pub type SessionCallback = Rc<dyn Fn(&Endpoint, SessionEvent)>;

struct ServerInner {
    path: PathBuf,
    listener: AsyncFd<OwnedFd>,
    max_sessions: usize,
    interfaces: Rc<Interfaces>,
    sessions: RefCell<Vec<Endpoint>>,
    shutdown: CancellationToken,
}

/// Listening socket plus the set of accepted sessions.
#[derive(Clone)]
pub struct Server {
    inner: Rc<ServerInner>,
}

impl Server {
    /// Binds `path`, replacing a stale socket file. `max_sessions == 0`
    /// means no limit.
    pub fn bind(
        path: impl AsRef<Path>,
        max_sessions: usize,
        interfaces: Rc<Interfaces>,
    ) -> Result<Self, AmsgError> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        let backlog = match max_sessions {
            0 => DEFAULT_BACKLOG,
            max => i32::try_from(max).unwrap_or(DEFAULT_BACKLOG),
        };
        let fd = sys::listener(&path, backlog)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(SOCKET_MODE))?;
        let listener = AsyncFd::new(fd)?;
        log::info!("amsg: listening on {}", path.display());
        Ok(Server {
            inner: Rc::new(ServerInner {
                path,
                listener,
                max_sessions,
                interfaces,
                sessions: RefCell::new(Vec::new()),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Accepts connections until [`stop`](Self::stop) is called.
    ///
    /// Each session's receive loop is spawned on the current `LocalSet`.
    pub async fn run(&self, on_event: SessionCallback) -> Result<(), AmsgError> {
        let shutdown = self.inner.shutdown.clone();
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                accepted = self.accept() => accepted?,
            };
            self.admit(accepted, on_event.clone());
        }
    }

    async fn accept(&self) -> Result<OwnedFd, AmsgError> {
        loop {
            let mut guard = self.inner.listener.readable().await?;
            match sys::accept(self.inner.listener.get_ref().as_fd())? {
                Some(fd) => return Ok(fd),
                None => guard.clear_ready(),
            }
        }
    }

    fn admit(&self, fd: OwnedFd, on_event: SessionCallback) {
        let max = self.inner.max_sessions;
        if max != 0 && self.sessions() >= max {
            log::warn!("amsg: session limit {max} reached, closing new connection");
            return;
        }
        let endpoint = match Endpoint::from_fd(fd, self.inner.interfaces.clone()) {
            Ok(endpoint) => endpoint,
            Err(err) => {
                log::warn!("amsg: failed to set up session: {err}");
                return;
            }
        };
        let weak = Rc::downgrade(&self.inner);
        let on_close = on_event.clone();
        endpoint.on_disconnect(move |endpoint| {
            if let Some(inner) = weak.upgrade() {
                inner.sessions.borrow_mut().retain(|session| !session.ptr_eq(endpoint));
            }
            on_close(endpoint, SessionEvent::Disconnected);
        });
        self.inner.sessions.borrow_mut().push(endpoint.clone());
        log::debug!("amsg: session {} connected", endpoint.id());
        on_event(&endpoint, SessionEvent::Connected);

        tokio::task::spawn_local(async move {
            if let Err(err) = endpoint.run().await {
                log::debug!("amsg: session {} ended: {err}", endpoint.id());
            }
        });
    }

    pub fn sessions(&self) -> usize {
        self.inner.sessions.borrow().len()
    }

    pub fn for_each_session(&self, mut f: impl FnMut(&Endpoint)) {
        let sessions = self.inner.sessions.borrow().clone();
        for session in &sessions {
            f(session);
        }
    }

    /// Sends to every session, returning how many sends succeeded.
    pub fn broadcast(&self, interface: u8, msg_type: u8, payload: &[u8]) -> usize {
        let mut delivered = 0;
        self.for_each_session(|session| match session.send(interface, msg_type, payload) {
            Ok(()) => delivered += 1,
            Err(err) => log::debug!("amsg: broadcast to session {} failed: {err}", session.id()),
        });
        delivered
    }

    pub fn disconnect_all(&self) {
        let sessions = std::mem::take(&mut *self.inner.sessions.borrow_mut());
        for session in sessions {
            session.disconnect();
        }
    }

    /// Stops accepting, closes every session and removes the socket file.
    pub fn stop(&self) {
        self.inner.shutdown.cancel();
        self.disconnect_all();
        if let Err(err) = std::fs::remove_file(&self.inner.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                log::warn!("amsg: failed to remove {}: {err}", self.inner.path.display());
            }
        }
    }
}
