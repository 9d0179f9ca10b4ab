use crate::error::AmsgError;
use crate::interface::{
    DefaultResponse, Interfaces, INTERNAL_INTERFACE, MSG_DEFAULT_RESP, MSG_PING, MSG_PING_RESP,
};
use crate::responder::{AsyncResponse, Responder};
use crate::sys::{self, Frame, Recv};
use crate::wire::{Flags, Header, Message, HEADER_LEN, MAX_MSG_SIZE};
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::os::fd::{AsFd, OwnedFd};
use std::path::Path;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::unix::AsyncFd;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub type ReplyCallback = Box<dyn FnOnce(&Endpoint, Result<Message, AmsgError>)>;

static NEXT_ENDPOINT_ID: AtomicU64 = AtomicU64::new(1);

struct PendingReply {
    seq: u16,
    deadline: Option<Instant>,
    on_reply: ReplyCallback,
}

/// Where a response must go: the request it answers and, for synchronous
/// requests, the private descriptor the peer is waiting on.
pub(crate) struct ReplyTo {
    pub(crate) interface: u8,
    pub(crate) msg_type: u8,
    pub(crate) seq: u16,
    pub(crate) reply_fd: Option<OwnedFd>,
}

pub(crate) struct Inner {
    id: u64,
    socket: RefCell<Option<Rc<AsyncFd<OwnedFd>>>>,
    seq: Cell<u16>,
    pending: RefCell<Vec<PendingReply>>,
    owed: RefCell<HashMap<u64, ReplyTo>>,
    next_owed: Cell<u64>,
    user_data: RefCell<HashMap<u32, Box<dyn Any>>>,
    interfaces: Rc<Interfaces>,
    disconnect_hooks: RefCell<Vec<Box<dyn FnOnce(&Endpoint)>>>,
    wake: Notify,
    shutdown: CancellationToken,
}

/// One end of a message channel.
///
/// Cloning yields another handle to the same endpoint. All state lives on the
/// thread that created it; the receive side is driven by [`Endpoint::run`].
#[derive(Clone)]
pub struct Endpoint {
    inner: Rc<Inner>,
}

impl Endpoint {
    pub fn connect(path: impl AsRef<Path>, interfaces: Rc<Interfaces>) -> Result<Self, AmsgError> {
        let fd = sys::connect(path.as_ref())?;
        Self::from_fd(fd, interfaces)
    }

    /// Two connected endpoints sharing one handler table.
    pub fn pair(interfaces: Rc<Interfaces>) -> Result<(Self, Self), AmsgError> {
        let (left, right) = sys::pair()?;
        Ok((Self::from_fd(left, interfaces.clone())?, Self::from_fd(right, interfaces)?))
    }

    /// Wraps an already connected `SOCK_SEQPACKET` socket.
    pub fn from_fd(fd: OwnedFd, interfaces: Rc<Interfaces>) -> Result<Self, AmsgError> {
        let socket = AsyncFd::new(fd)?;
        Ok(Endpoint {
            inner: Rc::new(Inner {
                id: NEXT_ENDPOINT_ID.fetch_add(1, Ordering::Relaxed),
                socket: RefCell::new(Some(Rc::new(socket))),
                seq: Cell::new(0),
                pending: RefCell::new(Vec::new()),
                owed: RefCell::new(HashMap::new()),
                next_owed: Cell::new(1),
                user_data: RefCell::new(HashMap::new()),
                interfaces,
                disconnect_hooks: RefCell::new(Vec::new()),
                wake: Notify::new(),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    pub(crate) fn upgrade(weak: &Weak<Inner>) -> Option<Self> {
        weak.upgrade().map(|inner| Endpoint { inner })
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn is_connected(&self) -> bool {
        self.inner.socket.borrow().is_some()
    }

    pub fn ptr_eq(&self, other: &Endpoint) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Sequence number used by the most recent send, `0` before the first one.
    pub fn last_seq(&self) -> u16 {
        self.inner.seq.get()
    }

    pub fn pending_replies(&self) -> usize {
        self.inner.pending.borrow().len()
    }

    pub fn owed_responses(&self) -> usize {
        self.inner.owed.borrow().len()
    }

    pub fn send(&self, interface: u8, msg_type: u8, payload: &[u8]) -> Result<(), AmsgError> {
        let header = self.request_header(Flags::NONE, interface, msg_type, payload)?;
        self.send_header(&header, payload, None)
    }

    /// Sends a request and registers `on_reply` under its sequence number.
    ///
    /// `on_reply` runs exactly once from the receive loop: with the matching
    /// response, with `TimedOut` after `timeout`, or with `Disconnected`. A
    /// zero `timeout` waits indefinitely. When the send itself fails the error
    /// is returned and `on_reply` is dropped unused.
    pub fn send_with_reply<F>(
        &self,
        interface: u8,
        msg_type: u8,
        payload: &[u8],
        timeout: Duration,
        on_reply: F,
    ) -> Result<(), AmsgError>
    where
        F: FnOnce(&Endpoint, Result<Message, AmsgError>) + 'static,
    {
        let header =
            self.request_header(Flags::RESPONSE_REQUESTED, interface, msg_type, payload)?;
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        self.inner.pending.borrow_mut().push(PendingReply {
            seq: header.seq,
            deadline,
            on_reply: Box::new(on_reply),
        });
        if let Err(err) = self.send_header(&header, payload, None) {
            self.take_pending(header.seq);
            return Err(err);
        }
        self.inner.wake.notify_one();
        Ok(())
    }

    /// Sends a request and waits for its reply on a private channel handed
    /// to the peer with the request, so replies to concurrent asynchronous
    /// requests on this endpoint are never confused with it.
    pub async fn send_sync(
        &self,
        interface: u8,
        msg_type: u8,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Message, AmsgError> {
        let header = self.request_header(
            Flags::RESPONSE_REQUESTED | Flags::SYNC,
            interface,
            msg_type,
            payload,
        )?;
        let (ours, theirs) = sys::pair()?;
        self.send_header(&header, payload, Some(theirs.as_fd()))?;
        drop(theirs);

        let reply = AsyncFd::new(ours)?;
        let frame = if timeout.is_zero() {
            read_one(&reply).await?
        } else {
            tokio::time::timeout(timeout, read_one(&reply))
                .await
                .map_err(|_| AmsgError::TimedOut)??
        };
        if frame.header.seq != header.seq {
            return Err(AmsgError::SequenceBad);
        }
        let msg = Message::from_parts(frame.header, frame.payload);
        match DefaultResponse::error_in(&msg) {
            Some(err) => Err(err),
            None => Ok(msg),
        }
    }

    pub fn ping<F>(&self, timeout: Duration, on_done: F) -> Result<(), AmsgError>
    where
        F: FnOnce(Result<Duration, AmsgError>) + 'static,
    {
        let started = Instant::now();
        self.send_with_reply(INTERNAL_INTERFACE, MSG_PING, &[], timeout, move |_, result| {
            on_done(result.map(|_| started.elapsed()))
        })
    }

    pub async fn ping_sync(&self, timeout: Duration) -> Result<Duration, AmsgError> {
        let started = Instant::now();
        self.send_sync(INTERNAL_INTERFACE, MSG_PING, &[], timeout).await?;
        Ok(started.elapsed())
    }

    /// Stores `value` under `id`, dropping whatever was there before.
    pub fn set_user_data<T: Any>(&self, id: u32, value: T) {
        let previous = self.inner.user_data.borrow_mut().insert(id, Box::new(value));
        drop(previous);
    }

    pub fn with_user_data<T: Any, R>(&self, id: u32, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut bag = self.inner.user_data.borrow_mut();
        bag.get_mut(&id).and_then(|value| value.downcast_mut::<T>()).map(f)
    }

    /// Removes the entry and hands it back to the caller instead of dropping it.
    pub fn take_user_data<T: Any>(&self, id: u32) -> Option<T> {
        let mut bag = self.inner.user_data.borrow_mut();
        if !bag.get(&id).is_some_and(|value| value.is::<T>()) {
            return None;
        }
        bag.remove(&id).and_then(|value| value.downcast::<T>().ok()).map(|value| *value)
    }

    pub fn on_disconnect(&self, hook: impl FnOnce(&Endpoint) + 'static) {
        self.inner.disconnect_hooks.borrow_mut().push(Box::new(hook));
    }

    /// Closes the channel. Pending replies complete with `Disconnected`, owed
    /// responses are released unsent and the sequence counter starts over.
    pub fn disconnect(&self) {
        let Some(socket) = self.inner.socket.borrow_mut().take() else {
            return;
        };
        sys::shutdown(socket.get_ref().as_fd());
        drop(socket);
        self.inner.shutdown.cancel();
        self.inner.seq.set(0);

        let pending: Vec<PendingReply> = self.inner.pending.borrow_mut().drain(..).collect();
        let owed: Vec<ReplyTo> = self.inner.owed.borrow_mut().drain().map(|(_, to)| to).collect();
        drop(owed);
        for reply in pending {
            (reply.on_reply)(self, Err(AmsgError::Disconnected));
        }
        let hooks = std::mem::take(&mut *self.inner.disconnect_hooks.borrow_mut());
        for hook in hooks {
            hook(self);
        }
        let user_data = std::mem::take(&mut *self.inner.user_data.borrow_mut());
        drop(user_data);
    }

    /// Drives the receive side until the endpoint is closed.
    ///
    /// Returns `Ok(())` after a local [`disconnect`](Self::disconnect) and the
    /// cause otherwise.
    pub async fn run(&self) -> Result<(), AmsgError> {
        let Some(socket) = self.socket() else {
            return Err(AmsgError::Disconnected);
        };
        let shutdown = self.inner.shutdown.clone();
        loop {
            let deadline = self.next_deadline();
            let received = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = self.inner.wake.notified() => continue,
                _ = sleep_until(deadline) => {
                    self.expire_pending(Instant::now());
                    continue;
                }
                received = read_frame(&socket) => received,
            };
            match received {
                Ok(Recv::Frame(frame)) => self.dispatch(frame),
                Ok(Recv::Dropped(err)) => {
                    log::warn!("amsg: endpoint {} dropped malformed message: {err}", self.id());
                }
                Ok(Recv::WouldBlock) => {}
                Err(err) => {
                    log::debug!("amsg: endpoint {} closed: {err}", self.id());
                    drop(socket);
                    self.disconnect();
                    return Err(err);
                }
            }
        }
    }

    fn socket(&self) -> Option<Rc<AsyncFd<OwnedFd>>> {
        self.inner.socket.borrow().clone()
    }

    fn next_seq(&self) -> u16 {
        let mut seq = self.inner.seq.get().wrapping_add(1);
        if seq == 0 {
            seq = 1;
        }
        self.inner.seq.set(seq);
        seq
    }

    fn request_header(
        &self,
        flags: Flags,
        interface: u8,
        msg_type: u8,
        payload: &[u8],
    ) -> Result<Header, AmsgError> {
        if !self.is_connected() {
            return Err(AmsgError::Disconnected);
        }
        let payload_len = checked_len(payload)?;
        Ok(Header { flags, interface, msg_type, seq: self.next_seq(), payload_len })
    }

    fn send_header(
        &self,
        header: &Header,
        payload: &[u8],
        pass_fd: Option<std::os::fd::BorrowedFd<'_>>,
    ) -> Result<(), AmsgError> {
        let socket = self.socket().ok_or(AmsgError::Disconnected)?;
        sys::send_frame(socket.get_ref().as_fd(), header, payload, pass_fd)
    }

    pub(crate) fn reply(&self, to: ReplyTo, msg_type: u8, payload: &[u8]) -> Result<(), AmsgError> {
        let interface = to.interface;
        self.reply_on(to, interface, msg_type, payload)
    }

    pub(crate) fn reply_default(
        &self,
        to: ReplyTo,
        error: Option<AmsgError>,
    ) -> Result<(), AmsgError> {
        let body = DefaultResponse { interface: to.interface, msg_type: to.msg_type, error };
        self.reply_on(to, INTERNAL_INTERFACE, MSG_DEFAULT_RESP, &body.to_bytes())
    }

    fn reply_on(
        &self,
        to: ReplyTo,
        interface: u8,
        msg_type: u8,
        payload: &[u8],
    ) -> Result<(), AmsgError> {
        let payload_len = checked_len(payload)?;
        match to.reply_fd {
            Some(fd) => {
                let header = Header {
                    flags: Flags::RESPONSE | Flags::SYNC,
                    interface,
                    msg_type,
                    seq: to.seq,
                    payload_len,
                };
                sys::send_frame(fd.as_fd(), &header, payload, None)
            }
            None => {
                let header =
                    Header { flags: Flags::RESPONSE, interface, msg_type, seq: to.seq, payload_len };
                self.send_header(&header, payload, None)
            }
        }
    }

    pub(crate) fn owe(&self, to: ReplyTo) -> AsyncResponse {
        let id = self.inner.next_owed.get();
        self.inner.next_owed.set(id.wrapping_add(1));
        self.inner.owed.borrow_mut().insert(id, to);
        AsyncResponse { endpoint: Rc::downgrade(&self.inner), id }
    }

    pub(crate) fn take_owed(&self, id: u64) -> Option<ReplyTo> {
        self.inner.owed.borrow_mut().remove(&id)
    }

    fn take_pending(&self, seq: u16) -> Option<PendingReply> {
        let mut pending = self.inner.pending.borrow_mut();
        let index = pending.iter().position(|reply| reply.seq == seq)?;
        Some(pending.remove(index))
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.inner.pending.borrow().iter().filter_map(|reply| reply.deadline).min()
    }

    fn expire_pending(&self, now: Instant) {
        let expired: Vec<PendingReply> = {
            let mut pending = self.inner.pending.borrow_mut();
            let (expired, live) = pending
                .drain(..)
                .partition(|reply| reply.deadline.is_some_and(|deadline| deadline <= now));
            *pending = live;
            expired
        };
        for reply in expired {
            log::debug!("amsg: endpoint {} reply seq={} timed out", self.id(), reply.seq);
            (reply.on_reply)(self, Err(AmsgError::TimedOut));
        }
    }

    fn dispatch(&self, frame: Frame) {
        let Frame { header, payload, reply_fd } = frame;
        let msg = Message::from_parts(header, payload);
        if msg.is_response() {
            self.dispatch_response(msg);
        } else {
            self.dispatch_request(msg, reply_fd);
        }
    }

    fn dispatch_response(&self, msg: Message) {
        if msg.is_sync() {
            log::warn!("amsg: endpoint {} unexpected sync response seq={}", self.id(), msg.seq);
            return;
        }
        if let Some(reply) = self.take_pending(msg.seq) {
            let result = match DefaultResponse::error_in(&msg) {
                Some(err) => Err(err),
                None => Ok(msg),
            };
            (reply.on_reply)(self, result);
            return;
        }
        if msg.interface == INTERNAL_INTERFACE {
            log::debug!("amsg: endpoint {} stray response seq={}", self.id(), msg.seq);
            return;
        }
        let Some(handler) = self.inner.interfaces.get(msg.interface) else {
            log::debug!("amsg: no handler for response on interface {}", msg.interface);
            return;
        };
        let mut responder = Responder::for_message(self, &msg, None);
        if let Err(err) = handler.handle(self, &msg, &mut responder) {
            log::debug!("amsg: handler for interface {} failed: {err}", msg.interface);
        }
    }

    fn dispatch_request(&self, msg: Message, reply_fd: Option<OwnedFd>) {
        let mut responder = Responder::for_message(self, &msg, reply_fd);
        let result = if msg.interface == INTERNAL_INTERFACE {
            match msg.msg_type {
                MSG_PING if responder.response_requested() => {
                    responder.send_response(MSG_PING_RESP, &[])
                }
                MSG_PING => Ok(()),
                _ => Err(AmsgError::TypeUnsupported),
            }
        } else {
            match self.inner.interfaces.get(msg.interface) {
                Some(handler) => handler.handle(self, &msg, &mut responder),
                None => Err(AmsgError::InterfaceUnsupported),
            }
        };
        if let Err(err) = &result {
            log::debug!(
                "amsg: request iface={} type={} seq={} failed: {err}",
                msg.interface,
                msg.msg_type,
                msg.seq
            );
        }
        responder.finish(result);
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.inner.id)
            .field("connected", &self.is_connected())
            .field("pending", &self.pending_replies())
            .finish()
    }
}

fn checked_len(payload: &[u8]) -> Result<u32, AmsgError> {
    if HEADER_LEN + payload.len() > MAX_MSG_SIZE {
        return Err(AmsgError::MessageTooLarge);
    }
    u32::try_from(payload.len()).map_err(|_| AmsgError::MessageTooLarge)
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn read_frame(socket: &AsyncFd<OwnedFd>) -> Result<Recv, AmsgError> {
    loop {
        let mut guard = socket.readable().await?;
        match sys::recv_frame(socket.get_ref().as_fd()) {
            Ok(Recv::WouldBlock) => guard.clear_ready(),
            other => return other,
        }
    }
}

async fn read_one(socket: &AsyncFd<OwnedFd>) -> Result<Frame, AmsgError> {
    match read_frame(socket).await? {
        Recv::Frame(frame) => Ok(frame),
        Recv::Dropped(err) => Err(err),
        Recv::WouldBlock => Err(AmsgError::Socket),
    }
}
