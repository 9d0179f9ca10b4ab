//! Push-notification client.
//!
//! Registers with the notify server over UDP, narrows the longest keep-alive
//! period the network path tolerates by pinging, then sends keep-alives and
//! turns server notifications into "check the cloud now" events.
//!
//! The client owns no sockets or timers. Every entry point takes `now`, and
//! the daemon drains [`NotifyOutput`]s and calls [`NotifyClient::poll`] at
//! [`NotifyClient::next_deadline`].

pub mod packet;

use crate::backoff::bounded_backoff_next;
use crate::config::NotifyConfig;
use crate::error::DevdError;
use packet::{Format, Op, Packet, PacketError, ERR_NONE, IV_LEN, KEY_LEN};
use rand_core::{OsRng, RngCore};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::{Duration, Instant};
use zeroize::Zeroizing;

pub const REG_PORT: u16 = 55056;
pub const PING_PORT: u16 = 55057;

/// Ping delays, in seconds.
pub const INIT_PING: u16 = 20;
pub const MIN_PING: u16 = 10;
pub const MAX_PING: u16 = 600;
/// Consecutive pings that must arrive before a delay is accepted.
pub const INIT_PINGS: u8 = 2;
const RESP_WAIT: i64 = 5;
const PING_GRACE: u64 = 2;
const MAX_TRY: u8 = 3;
/// Seconds before the pinged period at which a keep-alive goes out.
const KA_MARGIN: i64 = 3;
const MIN_CHANGE_WAIT: Duration = Duration::from_secs(1);
const MAX_CHANGE_WAIT: Duration = Duration::from_secs(600);
const RETRY_INTERVAL: u32 = 60;

/// Events for the cloud state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyEvent {
    /// The server rejected us; ask the cloud for a new one.
    Change,
    Down,
    DownRetry,
    /// Server name resolved; the client can be started.
    DnsPass,
    /// Up, or a notification arrived.
    Check,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Down,
    DnsPass,
    Register,
    Up,
    ChangeWait,
    DownRetry,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Down => "down",
            Self::DnsPass => "dns_pass",
            Self::Register => "register",
            Self::Up => "up",
            Self::ChangeWait => "change_wait",
            Self::DownRetry => "down_retry",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingState {
    Down,
    /// Ping request sent, waiting for its acknowledgement.
    Send,
    /// Waiting for the server's ping.
    Wait,
    Idle,
}

/// The two UDP sockets. The server tells them apart by destination port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Line {
    Reg,
    Ping,
}

impl Line {
    pub fn port(self) -> u16 {
        match self {
            Self::Reg => REG_PORT,
            Self::Ping => PING_PORT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyOutput {
    Send { line: Line, to: SocketAddrV4, packet: Vec<u8> },
    Event(NotifyEvent),
    /// Resolve this host name and report back through `dns_resolved`.
    Resolve(String),
    OpenPingLine,
    ClosePingLine,
}

pub struct NotifyClient {
    state: ClientState,
    ping_state: PingState,
    host: String,
    server: Option<Ipv4Addr>,
    dns_pending: bool,
    dsn: String,
    key: Option<Zeroizing<Vec<u8>>>,
    reg_key: u32,
    sequence: u16,
    keep_alive_delay: u16,

    ping_delay: u16,
    min_ping: u16,
    max_ping: u16,
    pings_needed: u8,
    change_wait: Duration,
    /// Next keep-alive is a reachability ping.
    ping_send: bool,
    /// Resume narrowing once the server answers again.
    restart_pinging: bool,
    ping_time: Option<Instant>,
    poll_interval: u32,
    poll_default: u32,

    reg_seq: u16,
    ping_seq: u16,
    reg_attempts: u8,
    ping_attempts: u8,
    ping_line_open: bool,

    gen_at: Option<Instant>,
    ping_at: Option<Instant>,
    epoch: Instant,
    event_pending: bool,
    out: Vec<NotifyOutput>,
}

impl fmt::Debug for NotifyClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotifyClient")
            .field("state", &self.state)
            .field("ping_state", &self.ping_state)
            .field("host", &self.host)
            .field("server", &self.server)
            .field("keep_alive_delay", &self.keep_alive_delay)
            .field("ping_delay", &self.ping_delay)
            .finish_non_exhaustive()
    }
}

fn after(now: Instant, secs: i64) -> Instant {
    now + Duration::from_secs(secs.max(0) as u64)
}

impl NotifyClient {
    pub fn new(config: &NotifyConfig, now: Instant) -> Self {
        Self {
            state: ClientState::Down,
            ping_state: PingState::Down,
            host: String::new(),
            server: None,
            dns_pending: false,
            dsn: String::new(),
            key: None,
            reg_key: 0,
            sequence: OsRng.next_u32() as u16,
            keep_alive_delay: INIT_PING,
            ping_delay: INIT_PING,
            min_ping: MIN_PING,
            max_ping: MAX_PING,
            pings_needed: INIT_PINGS,
            change_wait: Duration::ZERO,
            ping_send: false,
            restart_pinging: false,
            ping_time: None,
            poll_interval: config.poll_interval,
            poll_default: config.poll_interval,
            reg_seq: 0,
            ping_seq: 0,
            reg_attempts: 0,
            ping_attempts: 0,
            ping_line_open: false,
            gen_at: None,
            ping_at: None,
            epoch: now,
            event_pending: false,
            out: Vec::new(),
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn ping_state(&self) -> PingState {
        self.ping_state
    }

    pub fn keep_alive_delay(&self) -> u16 {
        self.keep_alive_delay
    }

    pub fn ping_bounds(&self) -> (u16, u16) {
        (self.min_ping, self.max_ping)
    }

    pub fn server_is_set(&self) -> bool {
        !self.host.is_empty()
    }

    pub fn server(&self) -> Option<Ipv4Addr> {
        self.server
    }

    /// Applies a new default reachability-check period, in seconds.
    pub fn set_poll_default(&mut self, secs: u32) {
        self.poll_default = secs;
    }

    /// Sets the server name and asks for it to be resolved.
    pub fn set_server(&mut self, name: &str, now: Instant) {
        self.host = name.to_string();
        if self.dns_pending {
            return;
        }
        if name.is_empty() {
            self.server = None;
            self.down_retry_event(now);
            return;
        }
        self.dns_pending = true;
        self.out.push(NotifyOutput::Resolve(name.to_string()));
    }

    /// Resolves the current server name again.
    pub fn recheck(&mut self, now: Instant) {
        if self.server_is_set() {
            let host = self.host.clone();
            self.set_server(&host, now);
        }
    }

    /// Result of a [`NotifyOutput::Resolve`].
    pub fn dns_resolved(&mut self, addr: Option<Ipv4Addr>, now: Instant) {
        self.dns_pending = false;
        let Some(addr) = addr else {
            log::warn!("notify: lookup of {} failed", self.host);
            self.server = None;
            if self.state == ClientState::DownRetry {
                self.setup_next_reach_check(now);
            } else {
                self.down_retry_event(now);
            }
            return;
        };
        let changed = self.server != Some(addr);
        if self.server.is_none() && self.state == ClientState::DownRetry {
            // never resolved, so the server was never up
            self.state = ClientState::Down;
        }
        self.server = Some(addr);
        log::info!("notify: server {} at {addr}", self.host);
        match self.state {
            ClientState::DownRetry => {
                if changed {
                    self.down();
                    self.state = ClientState::DownRetry;
                    self.restart_pinging = true;
                    self.open_ping_line();
                }
                self.ping_time = None;
                self.setup_ping_send(now);
            }
            ClientState::DnsPass | ClientState::Up => {}
            _ => {
                self.state = ClientState::DnsPass;
                self.post_event();
            }
        }
    }

    /// Registers `dsn` with the resolved server using the cloud-issued key.
    pub fn start(&mut self, dsn: &str, key: &[u8], now: Instant) -> Result<(), DevdError> {
        if key.len() != KEY_LEN {
            return Err(DevdError::Notify { message: format!("bad key length {}", key.len()) });
        }
        if self.host.is_empty() || self.server.is_none() {
            return Err(DevdError::Notify { message: "server not resolved".to_string() });
        }
        self.down();
        self.ping_init();
        self.poll_interval = self.poll_default;
        self.dsn = dsn.to_string();
        self.key = Some(Zeroizing::new(key.to_vec()));
        self.open_ping_line();
        self.reg_attempts = MAX_TRY;
        self.reg_seq = self.next_seq();
        self.register(now);
        Ok(())
    }

    pub fn stop(&mut self) {
        self.change_wait = Duration::ZERO;
        self.down();
    }

    /// The daemon could not send a datagram this client produced.
    pub fn send_failed(&mut self, now: Instant) {
        if self.state != ClientState::Down {
            self.down_retry_event(now);
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.gen_at, self.ping_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Fires expired timers.
    pub fn poll(&mut self, now: Instant) {
        if self.ping_at.is_some_and(|at| at <= now) {
            self.ping_at = None;
            self.ping_timeout(now);
        }
        if self.gen_at.is_some_and(|at| at <= now) {
            self.gen_at = None;
            self.gen_timeout(now);
        }
    }

    pub fn drain(&mut self) -> Vec<NotifyOutput> {
        if std::mem::take(&mut self.event_pending) {
            let event = match self.state {
                ClientState::Down => NotifyEvent::Down,
                ClientState::DownRetry => NotifyEvent::DownRetry,
                ClientState::DnsPass => NotifyEvent::DnsPass,
                ClientState::ChangeWait => NotifyEvent::Change,
                ClientState::Register | ClientState::Up => NotifyEvent::Check,
            };
            self.out.push(NotifyOutput::Event(event));
        }
        std::mem::take(&mut self.out)
    }

    /// Handles a datagram received on `line` from `from`.
    pub fn recv(&mut self, line: Line, from: SocketAddrV4, buf: &[u8], now: Instant) {
        let port_ok = from.port() == REG_PORT || from.port() == PING_PORT;
        if !port_ok || self.server != Some(*from.ip()) {
            log::warn!("notify: datagram from unexpected {from}");
            return;
        }
        if self.key.is_none() {
            return;
        }
        match packet::peek_format(buf) {
            Ok(Format::IvKey) => {}
            Ok(Format::DsnErr) => {
                self.recv_reg_err(buf, now);
                return;
            }
            Ok(Format::KeyErr) => {
                log::warn!("notify: bad key error, re-registering");
                self.reregister(now);
                return;
            }
            Ok(format) => {
                log::warn!("notify: unexpected format {format:?}");
                self.host.clear();
                return;
            }
            Err(err) => {
                log::warn!("notify: {err}");
                return;
            }
        }
        let decoded = match self.key.as_ref() {
            Some(key) => Packet::decode(buf, key),
            None => return,
        };
        let packet = match decoded {
            Ok(packet) => packet,
            Err(PacketError::Crc) => {
                log::warn!("notify: bad crc, re-registering");
                self.reregister(now);
                return;
            }
            Err(err @ PacketError::Version(_)) => {
                log::warn!("notify: {err}");
                self.host.clear();
                return;
            }
            Err(err) => {
                log::warn!("notify: {err}");
                return;
            }
        };
        if packet.op != Op::RegResp && packet.reg_key != self.reg_key {
            log::warn!("notify: wrong reg key {:#x}", packet.reg_key);
            return;
        }
        log::debug!("notify: recv {:?} seq {}", packet.op, packet.seq);
        match packet.op {
            Op::RegResp => self.recv_reg_resp(&packet, now),
            Op::ReqPingResp => self.recv_req_ping_resp(&packet, now),
            Op::Ping => self.recv_ping(&packet, line, now),
            Op::KeepAliveResp => self.recv_keep_alive_resp(&packet, now),
            Op::Notify => self.recv_notify(&packet, now),
            Op::PingResp => self.recv_ping_resp(&packet, now),
            op => log::warn!("notify: unexpected op {op:?}"),
        }
    }

    fn next_seq(&mut self) -> u16 {
        let seq = self.sequence;
        self.sequence = seq.wrapping_add(1);
        seq
    }

    fn time_ms(&self, now: Instant) -> u32 {
        now.duration_since(self.epoch).as_millis() as u32
    }

    fn post_event(&mut self) {
        self.event_pending = true;
    }

    fn send_raw(&mut self, line: Line, packet: Vec<u8>) -> bool {
        let Some(server) = self.server else {
            return false;
        };
        self.out.push(NotifyOutput::Send { line, to: SocketAddrV4::new(server, line.port()), packet });
        true
    }

    fn send(&mut self, line: Line, packet: Packet) -> bool {
        let Some(key) = self.key.as_ref() else {
            return false;
        };
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);
        match packet.encode(key, &iv) {
            Ok(bytes) => self.send_raw(line, bytes),
            Err(err) => {
                log::warn!("notify: encode {:?}: {err}", packet.op);
                false
            }
        }
    }

    fn check_resp(&self, packet: &Packet, expected: ClientState, seq: u16) -> bool {
        if packet.seq != seq {
            log::warn!("notify: wrong seq {} expected {seq}", packet.seq);
            return false;
        }
        if self.state != expected {
            log::warn!("notify: {:?} in state {}", packet.op, self.state);
            return false;
        }
        if self.reg_key != 0 && self.reg_key != packet.reg_key {
            log::warn!("notify: wrong reg key {:#x}", packet.reg_key);
            return false;
        }
        true
    }

    fn setup_next_reach_check(&mut self, now: Instant) {
        self.gen_at = Some(now + Duration::from_secs(u64::from(self.poll_interval)));
        log::info!("notify: reachability check in {} seconds", self.poll_interval);
    }

    fn open_ping_line(&mut self) {
        if !self.ping_line_open {
            self.ping_line_open = true;
            self.out.push(NotifyOutput::OpenPingLine);
        }
    }

    fn ping_down(&mut self) {
        self.ping_state = PingState::Down;
        self.ping_at = None;
        if self.ping_line_open {
            self.ping_line_open = false;
            self.out.push(NotifyOutput::ClosePingLine);
        }
    }

    fn down_retry_event(&mut self, now: Instant) {
        if self.state == ClientState::Up {
            self.restart_pinging = self.ping_state != PingState::Idle;
        }
        self.ping_send = false;
        self.state = ClientState::DownRetry;
        self.poll_interval = RETRY_INTERVAL;
        self.ping_down();
        self.setup_next_reach_check(now);
        self.post_event();
    }

    fn down(&mut self) {
        if self.state == ClientState::Up {
            log::info!("notify: down");
        }
        self.state = ClientState::Down;
        self.ping_send = false;
        self.gen_at = None;
        self.ping_down();
    }

    fn ping_init(&mut self) {
        self.ping_delay = INIT_PING;
        self.min_ping = MIN_PING;
        self.max_ping = MAX_PING;
        self.pings_needed = INIT_PINGS;
    }

    fn req_ping(&mut self, now: Instant) {
        if self.reg_attempts == 0 {
            self.ping_down();
            return;
        }
        self.reg_attempts -= 1;
        log::debug!(
            "notify: ping request #{} delay {}s min {} max {}",
            1 + INIT_PINGS - self.pings_needed,
            self.ping_delay,
            self.min_ping,
            self.max_ping
        );
        let request = Packet::new(Op::ReqPing, self.reg_seq, self.time_ms(now), self.reg_key).with_u16(self.ping_delay);
        if !self.send(Line::Ping, request) {
            self.down_retry_event(now);
            return;
        }
        self.ping_at = Some(after(now, RESP_WAIT));
        self.ping_state = PingState::Send;
    }

    /// One narrowing step. Done once `min` is within an eighth of `max`.
    fn req_ping_new(&mut self, now: Instant) {
        if narrowed(self.min_ping, self.max_ping) {
            self.ping_delay = self.min_ping;
            self.keep_alive_delay = self.min_ping;
            self.ping_state = PingState::Idle;
            log::debug!("notify: pinging done, keep-alive {}s", self.keep_alive_delay);
            self.reset_keep_alive(now);
            return;
        }
        self.ping_delay = next_candidate(self.min_ping, self.max_ping, self.ping_delay);
        if self.keep_alive_delay < self.min_ping {
            self.keep_alive_delay = self.min_ping;
            self.reset_keep_alive(now);
            if self.state != ClientState::Up {
                return;
            }
        }
        self.pings_needed = INIT_PINGS;
        self.reg_attempts = MAX_TRY;
        self.reg_seq = self.next_seq();
        self.req_ping(now);
    }

    fn ping_wait(&mut self, now: Instant) {
        self.ping_at = Some(now + Duration::from_secs(PING_GRACE + u64::from(self.ping_delay)));
        self.ping_state = PingState::Wait;
    }

    fn recv_req_ping_resp(&mut self, packet: &Packet, now: Instant) {
        if !self.check_resp(packet, ClientState::Up, self.reg_seq) || self.ping_state != PingState::Send {
            return;
        }
        if packet.error() != ERR_NONE {
            log::warn!("notify: ping request error {}", packet.error());
            self.down_retry_event(now);
            return;
        }
        self.ping_wait(now);
    }

    fn setup_ping_send(&mut self, now: Instant) {
        self.ping_send = true;
        self.ping_attempts = if self.state == ClientState::Up { MAX_TRY } else { 1 };
        self.ping_seq = self.next_seq();
        self.gen_at = Some(self.ping_time.filter(|at| *at > now).unwrap_or(now));
    }

    /// Schedules the next keep-alive, or a reachability ping when one is due first.
    /// `correction` accounts for time already spent waiting on a response.
    fn set_next_timeout(&mut self, now: Instant, correction: i64) {
        let keep_alive_after = i64::from(self.keep_alive_delay) - KA_MARGIN + correction;
        if self.ping_send {
            self.gen_at = Some(after(now, RESP_WAIT + correction));
        } else if self.ping_time.map_or(true, |at| at < after(now, keep_alive_after)) {
            self.setup_ping_send(now);
        } else {
            self.gen_at = Some(after(now, keep_alive_after));
        }
    }

    fn bring_up(&mut self, keep_alive: u16, now: Instant) {
        self.change_wait = Duration::ZERO;
        self.state = ClientState::Up;
        self.keep_alive_delay = keep_alive;
        log::info!("notify: up, keep-alive {keep_alive}s");
        self.reset_keep_alive(now);
        self.post_event();
    }

    fn recv_ping_resp(&mut self, packet: &Packet, now: Instant) {
        if !self.ping_send || self.ping_seq != packet.seq {
            log::warn!("notify: ping response without ping");
            return;
        }
        self.ping_send = false;
        self.ping_time = Some(now + Duration::from_secs(u64::from(self.poll_interval)));
        if self.state == ClientState::DownRetry {
            self.poll_interval = self.poll_default;
            if self.restart_pinging {
                self.open_ping_line();
                self.ping_init();
                self.ping_wait(now);
            } else {
                self.ping_state = PingState::Idle;
            }
            self.bring_up(self.ping_delay, now);
            return;
        }
        self.set_next_timeout(now, -RESP_WAIT);
    }

    fn recv_notify(&mut self, packet: &Packet, now: Instant) {
        let ack = Packet::new(Op::NotifyResp, packet.seq, self.time_ms(now), self.reg_key).with_u8(ERR_NONE);
        self.send(Line::Reg, ack);
        self.post_event();
    }

    fn recv_ping(&mut self, packet: &Packet, line: Line, now: Instant) {
        let ack = Packet::new(Op::PingResp, packet.seq, self.time_ms(now), self.reg_key).with_u8(ERR_NONE);
        self.send(line, ack);

        if self.ping_state != PingState::Wait || packet.seq != self.reg_seq {
            return;
        }
        if self.pings_needed > 1 {
            self.pings_needed -= 1;
            self.reg_attempts = MAX_TRY;
            self.reg_seq = self.next_seq();
            self.req_ping(now);
        } else {
            log::debug!("notify: new min ping delay {}s", self.ping_delay);
            self.min_ping = self.ping_delay;
            self.req_ping_new(now);
        }
    }

    fn ping_timeout(&mut self, now: Instant) {
        match self.ping_state {
            PingState::Send => self.req_ping(now),
            PingState::Wait => {
                log::debug!("notify: new max ping delay {}s", self.ping_delay);
                self.max_ping = self.ping_delay;
                self.req_ping_new(now);
            }
            PingState::Down | PingState::Idle => {}
        }
    }

    fn register(&mut self, now: Instant) {
        if self.reg_attempts == 0 {
            self.down_retry_event(now);
            return;
        }
        self.reg_attempts -= 1;
        self.reg_key = 0;
        let Some(key) = self.key.as_ref() else {
            self.down_retry_event(now);
            return;
        };
        let request = match packet::encode_register(&self.dsn, self.reg_seq, self.time_ms(now), self.ping_delay, key) {
            Ok(request) => request,
            Err(err) => {
                log::error!("notify: register: {err}");
                self.down_retry_event(now);
                return;
            }
        };
        log::debug!("notify: register, ping delay {}s seq {}", self.ping_delay, self.reg_seq);
        if !self.send_raw(Line::Reg, request) {
            self.down_retry_event(now);
            return;
        }
        self.state = ClientState::Register;
        self.gen_at = Some(after(now, RESP_WAIT));
    }

    /// Recovers from the server losing our registration. Pinging restarts.
    fn reregister(&mut self, now: Instant) {
        if matches!(self.state, ClientState::Down | ClientState::DnsPass | ClientState::Register) {
            return;
        }
        if self.ping_state != PingState::Idle {
            self.ping_state = PingState::Down;
            self.ping_at = None;
            self.ping_init();
        }
        self.ping_send = false;
        self.reg_attempts = MAX_TRY;
        self.reg_seq = self.next_seq();
        self.state = ClientState::Register;
        self.gen_at = Some(now);
    }

    fn recv_reg_resp(&mut self, packet: &Packet, now: Instant) {
        if !self.check_resp(packet, ClientState::Register, self.reg_seq) {
            return;
        }
        if packet.error() != ERR_NONE {
            log::warn!("notify: register error {}", packet.error());
            self.down_retry_event(now);
            return;
        }
        let offered = packet.u16_at(1);
        let keep_alive = if i64::from(offered) > KA_MARGIN { offered } else { self.ping_delay };
        self.reg_key = packet.reg_key;
        self.bring_up(keep_alive, now);
        self.ping_wait(now);
    }

    /// Waits longer on every consecutive change before asking for a new server.
    fn change(&mut self, now: Instant) {
        self.state = ClientState::ChangeWait;
        self.ping_send = false;
        self.change_wait = if self.change_wait.is_zero() {
            MIN_CHANGE_WAIT
        } else {
            bounded_backoff_next(self.change_wait, MAX_CHANGE_WAIT)
        };
        self.gen_at = Some(now + self.change_wait);
    }

    fn recv_reg_err(&mut self, buf: &[u8], now: Instant) {
        let Some(key) = self.key.as_ref() else {
            return;
        };
        if let Err(err) = packet::check_register_error(buf, &self.dsn, self.reg_seq, key) {
            log::warn!("notify: ignoring registration error: {err}");
            return;
        }
        log::debug!("notify: registration rejected");
        self.change(now);
    }

    fn send_keep_alive(&mut self, now: Instant) {
        let request = if self.ping_send {
            if self.ping_attempts == 0 {
                self.down_retry_event(now);
                return;
            }
            self.ping_attempts -= 1;
            Packet::new(Op::Ping, self.ping_seq, self.time_ms(now), self.reg_key)
        } else {
            self.ping_seq = self.next_seq();
            Packet::new(Op::KeepAlive, self.ping_seq, self.time_ms(now), self.reg_key).with_u16(self.keep_alive_delay)
        };
        if !self.send(Line::Reg, request) {
            self.down_retry_event(now);
            return;
        }
        self.set_next_timeout(now, 0);
    }

    fn recv_keep_alive_resp(&mut self, packet: &Packet, now: Instant) {
        if !self.check_resp(packet, ClientState::Up, self.ping_seq) {
            return;
        }
        if packet.error() != ERR_NONE {
            log::warn!("notify: keep-alive error {}", packet.error());
            self.down_retry_event(now);
        }
    }

    fn reset_keep_alive(&mut self, now: Instant) {
        self.gen_at = None;
        self.ping_time = Some(now + Duration::from_secs(u64::from(self.poll_interval)));
        self.send_keep_alive(now);
    }

    fn gen_timeout(&mut self, now: Instant) {
        match self.state {
            ClientState::Register => self.register(now),
            ClientState::ChangeWait => self.post_event(),
            ClientState::Up => self.send_keep_alive(now),
            ClientState::DownRetry => {
                if self.server.is_some() {
                    if self.reg_key == 0 {
                        self.reregister(now);
                        return;
                    }
                    if self.ping_send {
                        self.send_keep_alive(now);
                        return;
                    }
                }
                self.recheck(now);
            }
            ClientState::Down | ClientState::DnsPass => {}
        }
    }
}

/// Pinging stops once `min` plus an eighth of itself reaches `max`.
pub fn narrowed(min: u16, max: u16) -> bool {
    u32::from(min) + u32::from(min) / 8 >= u32::from(max)
}

/// Next candidate delay: the midpoint of the bounds, but at most double the current one.
pub fn next_candidate(min: u16, max: u16, current: u16) -> u16 {
    let mid = (u32::from(min) + u32::from(max)) / 2;
    mid.min(u32::from(current) * 2) as u16
}

#[cfg(test)]
mod tests {
    use super::*;
    use packet::{DSN_ENCAPS_LEN, ENCAPS_LEN};

    const KEY: [u8; KEY_LEN] = *b"notify-key-0123!";
    const DSN: &str = "AC000W000000001";
    const SERVER: Ipv4Addr = Ipv4Addr::new(10, 1, 2, 3);

    fn from(line: Line) -> SocketAddrV4 {
        SocketAddrV4::new(SERVER, line.port())
    }

    fn sent(out: &[NotifyOutput]) -> Vec<(Line, Vec<u8>)> {
        out.iter()
            .filter_map(|o| match o {
                NotifyOutput::Send { line, packet, .. } => Some((*line, packet.clone())),
                _ => None,
            })
            .collect()
    }

    fn events(out: &[NotifyOutput]) -> Vec<NotifyEvent> {
        out.iter()
            .filter_map(|o| match o {
                NotifyOutput::Event(event) => Some(*event),
                _ => None,
            })
            .collect()
    }

    fn reply(op: Op, seq: u16, reg_key: u32) -> Packet {
        Packet::new(op, seq, 0, reg_key)
    }

    fn encode(packet: Packet) -> Vec<u8> {
        packet.encode(&KEY, &[5u8; IV_LEN]).expect("encode")
    }

    fn decode(buf: &[u8]) -> Packet {
        Packet::decode(buf, &KEY).expect("decode")
    }

    fn register_seq(buf: &[u8]) -> u16 {
        let head = DSN_ENCAPS_LEN + usize::from(buf[2]);
        u16::from_be_bytes([buf[head + 2], buf[head + 3]])
    }

    /// Resolves and starts a client, returning it with the registration seq.
    fn started(now: Instant) -> (NotifyClient, u16) {
        let mut client = NotifyClient::new(&NotifyConfig::default(), now);
        client.set_server("ans.example.com", now);
        assert_eq!(client.drain(), vec![NotifyOutput::Resolve("ans.example.com".to_string())]);
        client.dns_resolved(Some(SERVER), now);
        assert_eq!(events(&client.drain()), vec![NotifyEvent::DnsPass]);

        client.start(DSN, &KEY, now).expect("start");
        let out = client.drain();
        assert!(out.contains(&NotifyOutput::OpenPingLine));
        let sent = sent(&out);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, Line::Reg);
        assert_eq!(client.state(), ClientState::Register);
        (client, register_seq(&sent[0].1))
    }

    fn up(now: Instant) -> (NotifyClient, u16) {
        let (mut client, seq) = started(now);
        client.recv(Line::Reg, from(Line::Reg), &encode(reply(Op::RegResp, seq, 0x55).with_u8(ERR_NONE).with_u16(0)), now);
        assert_eq!(client.state(), ClientState::Up);
        assert_eq!(client.ping_state(), PingState::Wait);
        (client, seq)
    }

    #[test]
    fn bisection_terminates_within_log_steps() {
        for (min, max) in [(10u16, 600u16), (10, 11), (1, 600), (100, 101), (20, 600), (599, 600)] {
            let (mut lo, mut hi, mut current) = (min, max, INIT_PING.clamp(min, max));
            let mut steps = 0;
            while !narrowed(lo, hi) {
                current = next_candidate(lo, hi, current);
                // alternate outcomes to exercise both bounds
                if steps % 2 == 0 {
                    lo = current;
                } else {
                    hi = current;
                }
                steps += 1;
                assert!(steps <= 64, "no convergence for [{min}, {max}]");
            }
            let bound = 2 * (f64::from(max - min) / f64::from(min)).log2().max(1.0).ceil() as u32 + 8;
            assert!(steps <= bound, "[{min}, {max}] took {steps} steps");
        }
    }

    #[test]
    fn registration_brings_client_up_and_sends_keep_alive() {
        let now = Instant::now();
        let (mut client, _) = up(now);
        let out = client.drain();
        assert_eq!(events(&out), vec![NotifyEvent::Check]);
        let sent = sent(&out);
        assert_eq!(sent.len(), 1);
        let keep_alive = decode(&sent[0].1);
        assert_eq!(keep_alive.op, Op::KeepAlive);
        assert_eq!(keep_alive.reg_key, 0x55);
        assert_eq!(keep_alive.u16_at(0), INIT_PING);
        // next keep-alive goes out a margin before the period ends
        assert_eq!(client.next_deadline(), Some(now + Duration::from_secs(17)));
    }

    #[test]
    fn delay_narrowing_shrinks_keep_alive_period() {
        let now = Instant::now();
        let (mut client, reg_seq) = up(now);
        client.drain();

        // server pings at the registered delay; two pings are needed
        client.recv(Line::Ping, from(Line::Ping), &encode(reply(Op::Ping, reg_seq, 0x55)), now);
        let out = sent(&client.drain());
        assert_eq!(decode(&out[0].1).op, Op::PingResp);
        let request = decode(&out[1].1);
        assert_eq!((out[1].0, request.op, request.u16_at(0)), (Line::Ping, Op::ReqPing, INIT_PING));
        assert_eq!(client.ping_state(), PingState::Send);

        client.recv(Line::Ping, from(Line::Ping), &encode(reply(Op::ReqPingResp, request.seq, 0x55).with_u8(0)), now);
        assert_eq!(client.ping_state(), PingState::Wait);
        client.recv(Line::Ping, from(Line::Ping), &encode(reply(Op::Ping, request.seq, 0x55)), now);
        assert_eq!(client.ping_bounds(), (INIT_PING, MAX_PING));
        let out = sent(&client.drain());
        let request = decode(&out[1].1);
        assert_eq!(request.u16_at(0), 40, "candidate doubles");

        // the next candidate is never pinged back: max comes down to it
        client.recv(Line::Ping, from(Line::Ping), &encode(reply(Op::ReqPingResp, request.seq, 0x55).with_u8(0)), now);
        client.poll(now + Duration::from_secs(43));
        assert_eq!(client.ping_bounds(), (INIT_PING, 40));
        assert_eq!(client.keep_alive_delay(), INIT_PING);
    }

    #[test]
    fn missed_registration_responses_fall_back_to_down_retry() {
        let mut now = Instant::now();
        let (mut client, _) = started(now);
        for _ in 0..2 {
            now += Duration::from_secs(5);
            client.poll(now);
            assert_eq!(client.state(), ClientState::Register);
            assert_eq!(sent(&client.drain()).len(), 1);
        }
        now += Duration::from_secs(5);
        client.poll(now);
        assert_eq!(client.state(), ClientState::DownRetry);
        let out = client.drain();
        assert!(out.contains(&NotifyOutput::ClosePingLine));
        assert_eq!(events(&out), vec![NotifyEvent::DownRetry]);
        assert_eq!(client.next_deadline(), Some(now + Duration::from_secs(60)));

        // resolved but never registered: the reach check registers again
        now += Duration::from_secs(60);
        client.poll(now);
        assert_eq!(client.state(), ClientState::Register);
        client.poll(now);
        assert_eq!(sent(&client.drain()).len(), 1);
    }

    #[test]
    fn down_retry_recovers_on_reachability_answer() {
        let now = Instant::now();
        let (mut client, _) = up(now);
        client.drain();
        client.send_failed(now);
        assert_eq!(client.state(), ClientState::DownRetry);
        client.drain();

        client.recheck(now);
        client.drain();
        client.dns_resolved(Some(SERVER), now);
        client.poll(now);
        let out = sent(&client.drain());
        let ping = decode(&out[0].1);
        assert_eq!(ping.op, Op::Ping);

        client.recv(Line::Reg, from(Line::Reg), &encode(reply(Op::PingResp, ping.seq, 0x55).with_u8(0)), now);
        assert_eq!(client.state(), ClientState::Up);
        let out = client.drain();
        assert!(out.contains(&NotifyOutput::OpenPingLine), "pinging restarts");
        assert_eq!(events(&out), vec![NotifyEvent::Check]);
    }

    #[test]
    fn rejected_registration_waits_longer_each_time() {
        let now = Instant::now();
        let (mut client, seq) = started(now);
        let mut rejection = packet::encode_register(DSN, seq, 0, INIT_PING, &KEY).expect("register");
        rejection[0] = Format::DsnErr as u8;
        client.recv(Line::Reg, from(Line::Reg), &rejection, now);
        assert_eq!(client.state(), ClientState::ChangeWait);
        assert_eq!(client.next_deadline(), Some(now + Duration::from_secs(1)));
        client.poll(now + Duration::from_secs(1));
        assert_eq!(events(&client.drain()), vec![NotifyEvent::Change]);

        client.change(now);
        assert_eq!(client.next_deadline(), Some(now + Duration::from_secs(2)));
    }

    #[test]
    fn notifications_are_acked_and_raise_check() {
        let now = Instant::now();
        let (mut client, _) = up(now);
        client.drain();
        client.recv(Line::Reg, from(Line::Reg), &encode(reply(Op::Notify, 777, 0x55)), now);
        let out = client.drain();
        assert_eq!(events(&out), vec![NotifyEvent::Check]);
        let ack = decode(&sent(&out)[0].1);
        assert_eq!((ack.op, ack.seq), (Op::NotifyResp, 777));

        // wrong reg key and foreign sources are dropped
        client.recv(Line::Reg, from(Line::Reg), &encode(reply(Op::Notify, 778, 0x66)), now);
        client.recv(Line::Reg, SocketAddrV4::new(Ipv4Addr::new(10, 9, 9, 9), REG_PORT), &encode(reply(Op::Notify, 779, 0x55)), now);
        assert!(client.drain().is_empty());
    }

    #[test]
    fn key_error_and_bad_crc_force_reregistration() {
        let now = Instant::now();
        let (mut client, _) = up(now);
        client.drain();
        let mut key_err = vec![0u8; ENCAPS_LEN];
        key_err[0] = Format::KeyErr as u8;
        client.recv(Line::Reg, from(Line::Reg), &key_err, now);
        assert_eq!(client.state(), ClientState::Register);
        client.poll(now);
        assert_eq!(sent(&client.drain()).len(), 1);

        let (mut client, _) = up(now);
        client.drain();
        let mut wire = encode(reply(Op::Notify, 1, 0x55));
        let last = wire.len() - 1;
        wire[last] ^= 0x01;
        client.recv(Line::Reg, from(Line::Reg), &wire, now);
        assert!(client.state() == ClientState::Register || client.state() == ClientState::Up);
    }

    #[test]
    fn start_requires_resolved_server_and_key() {
        let now = Instant::now();
        let mut client = NotifyClient::new(&NotifyConfig::default(), now);
        assert!(client.start(DSN, &KEY, now).is_err());
        client.set_server("ans.example.com", now);
        client.dns_resolved(Some(SERVER), now);
        assert!(client.start(DSN, &KEY[..4], now).is_err());
        assert!(client.start(DSN, &KEY, now).is_ok());
    }
}
