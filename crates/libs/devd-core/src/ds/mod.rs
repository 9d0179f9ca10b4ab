//! Device cloud state machine.
//!
//! The machine owns the connection state with the cloud service and decides
//! which request the device client runs next. It performs no I/O: the daemon
//! asks [`CloudMachine::step`] for work, sends the returned request, feeds
//! the result back through [`CloudMachine::check_response`] and
//! [`CloudMachine::complete`], and drains [`CloudEvent`]s for the other
//! subsystems. Timers are deadlines checked by [`CloudMachine::poll_timers`].
//!
//! ```text
//! DOWN --ping ok--> INIT --GET record--> UPDATE --PUT attrs--> UP
//!   ^                 |                    |                   |
//!   +------ failure --+--------------------+-------------------+
//! ```

pub mod device;

use crate::backoff::{ping_retry_delay, random_jitter};
use crate::config::DevdConfig;
use crate::dests::DestMask;
use crate::http::{
    HttpError, HttpMethod, HttpRequest, HttpResponse, STATUS_GATEWAY_TIMEOUT, STATUS_PARTIAL_CONTENT,
    STATUS_TOO_MANY_REQUESTS, STATUS_UNAUTHORIZED, STATUS_UNAVAILABLE,
};
use crate::link::CloudLink;
use crate::notify::NotifyEvent;
use device::{DeviceInfo, LocalAttributes};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

/// Response header carrying the temporary device credential, and the
/// request header it is sent back in.
pub const AUTH_HEADER: &str = "x-Ayla-auth-key";
pub const AUTH_VERSION: &str = "Ayla1.0";
/// Holdoff after repeated 401 responses, seconds.
pub const UNAUTH_HOLDOFF: u32 = 60;
/// Holdoff after a throttling response, seconds.
pub const OVERLOAD_HOLDOFF: u32 = 60;
pub const MAX_AUTH_ERRORS: u32 = 3;
/// How long a push-button registration window stays open.
pub const REG_WINDOW: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudState {
    Down,
    Init,
    Update,
    Up,
}

impl fmt::Display for CloudState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Down => "down",
            Self::Init => "init",
            Self::Update => "update",
            Self::Up => "up",
        };
        f.write_str(name)
    }
}

/// Work items of the device client, in no particular order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudAction {
    Ping,
    GetDsns,
    PutInfo,
    PutOemInfo,
    RegWindowStart,
    OtaStatusPut,
    CmdReply,
    ProcessCmd,
    GetCommands,
    GetRegtoken,
}

impl CloudAction {
    /// Actions that may only run while the cloud is up.
    pub fn is_up_only(self) -> bool {
        !matches!(self, Self::Ping | Self::GetDsns | Self::PutInfo)
    }
}

/// What the device client should do next.
#[derive(Debug, Clone, PartialEq)]
pub enum CloudStep {
    Idle,
    Send(CloudAction, HttpRequest),
    /// Run one reverse-REST command fetched from the cloud.
    Command(Value),
}

/// How a finished cloud request should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Deliver,
    /// Send the same request again with refreshed credentials.
    Resend,
}

/// Requests the machine makes of the rest of the daemon.
#[derive(Debug, Clone, PartialEq)]
pub enum CloudEvent {
    DestsChanged(DestMask),
    /// Abort in-flight requests on both cloud clients.
    CancelRequests,
    NotifyServer(String),
    NotifyStart(Vec<u8>),
    NotifyStop,
    /// Re-resolve the notify server.
    NotifyRecheck,
    /// `properties` array from a command fetch.
    Properties(Value),
    /// `node_properties` array: updates for nodes behind the gateway.
    NodeProperties(Value),
    /// `node_schedules` array.
    NodeSchedules(Value),
}

pub struct CloudMachine {
    link: CloudLink,
    attrs: LocalAttributes,
    poll_interval: Duration,
    ping_timeout: Duration,
    provisioned_auth: Option<String>,
    template_version: String,
    dsns_args: Option<&'static str>,
    state: CloudState,
    net_up: bool,
    do_ping: bool,
    ping_attempts: u32,
    update_info: Option<Value>,
    update_oem_info: bool,
    reg_window_start: bool,
    ota_status: Option<i32>,
    ads_listen: bool,
    get_cmds: bool,
    par_content: bool,
    get_regtoken: bool,
    np_up: bool,
    np_started: bool,
    np_up_once: bool,
    poll_ads: bool,
    dests_avail: DestMask,
    req_auth_errors: u32,
    auth_header: Option<String>,
    info: Option<DeviceInfo>,
    commands: VecDeque<Value>,
    replies: VecDeque<HttpRequest>,
    in_flight: Option<CloudAction>,
    ping_at: Option<Instant>,
    poll_at: Option<Instant>,
    reg_window_until: Option<Instant>,
    events: Vec<CloudEvent>,
    jitter: fn() -> u32,
}

impl CloudMachine {
    pub fn new(link: CloudLink, attrs: LocalAttributes) -> Self {
        Self {
            link,
            attrs,
            poll_interval: Duration::from_secs(u64::from(crate::config::DEFAULT_POLL_INTERVAL)),
            ping_timeout: Duration::from_secs(5),
            provisioned_auth: None,
            template_version: String::new(),
            dsns_args: None,
            state: CloudState::Down,
            net_up: false,
            do_ping: false,
            ping_attempts: 0,
            update_info: None,
            update_oem_info: false,
            reg_window_start: false,
            ota_status: None,
            ads_listen: false,
            get_cmds: false,
            par_content: false,
            get_regtoken: false,
            np_up: false,
            np_started: false,
            np_up_once: false,
            poll_ads: false,
            dests_avail: DestMask::NONE,
            req_auth_errors: 0,
            auth_header: None,
            info: None,
            commands: VecDeque::new(),
            replies: VecDeque::new(),
            in_flight: None,
            ping_at: None,
            poll_at: None,
            reg_window_until: None,
            events: Vec::new(),
            jitter: random_jitter,
        }
    }

    pub fn from_config(config: &DevdConfig) -> Self {
        let device = &config.device;
        let link = CloudLink {
            scheme: config.cloud_scheme(),
            host: device.ads_host.clone(),
            dsn: device.dsn.clone(),
            key: String::new(),
            timeout: Duration::from_secs(config.client.request_timeout),
        };
        let attrs = LocalAttributes {
            sw_version: device.sw_version.clone(),
            model: device.model.clone(),
            lan_ip: String::new(),
            oem: device.oem_id.clone(),
            oem_model: device.oem_model.clone(),
            oem_key: device.oem_key.clone(),
            mac: (!device.mac.is_empty()).then(|| device.mac.clone()),
            hwsig: (!device.hwsig.is_empty()).then(|| device.hwsig.clone()),
            setup_token: device.setup_token.clone(),
            location: device.location.clone(),
            ssid: device.ssid.clone(),
        };
        let mut machine = Self::new(link, attrs);
        machine.poll_interval = Duration::from_secs(u64::from(config.client.poll_interval));
        machine.ping_timeout = Duration::from_secs(config.client.ping_timeout);
        machine.provisioned_auth = device.auth_token.clone();
        machine.template_version = device.template_version.clone();
        machine
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Takes effect at the next polling start.
    pub fn set_poll_interval(&mut self, interval: Duration) {
        self.poll_interval = interval;
    }

    pub fn with_jitter(mut self, jitter: fn() -> u32) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.provisioned_auth = Some(token.into());
        self
    }

    /// Adds `reset=1` / `test=1` to the next device record GET.
    pub fn set_dsns_args(&mut self, args: Option<&'static str>) {
        self.dsns_args = args;
    }

    pub fn state(&self) -> CloudState {
        self.state
    }

    pub fn is_up(&self) -> bool {
        self.state == CloudState::Up
    }

    pub fn link(&self) -> &CloudLink {
        &self.link
    }

    pub fn info(&self) -> Option<&DeviceInfo> {
        self.info.as_ref()
    }

    pub fn dests_avail(&self) -> DestMask {
        self.dests_avail
    }

    pub fn is_polling(&self) -> bool {
        self.poll_ads
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn ping_attempts(&self) -> u32 {
        self.ping_attempts
    }

    pub fn ping_deadline(&self) -> Option<Instant> {
        self.ping_at
    }

    pub fn reg_window_open(&self) -> bool {
        self.reg_window_until.is_some()
    }

    pub fn lan_ip(&self) -> &str {
        &self.attrs.lan_ip
    }

    pub fn set_lan_ip(&mut self, ip: impl Into<String>) {
        self.attrs.lan_ip = ip.into();
    }

    pub fn drain_events(&mut self) -> Vec<CloudEvent> {
        std::mem::take(&mut self.events)
    }

    /// Earliest pending timer.
    pub fn next_deadline(&self) -> Option<Instant> {
        [self.ping_at, self.poll_at, self.reg_window_until].into_iter().flatten().min()
    }

    pub fn net_up(&mut self) {
        if self.net_up {
            return;
        }
        log::info!("ds: network up, cloud {}", self.link.host);
        self.net_up = true;
        self.do_ping = true;
        self.ping_attempts = 0;
    }

    pub fn net_down(&mut self) {
        if !self.net_up {
            return;
        }
        log::warn!("ds: network down");
        self.net_up = false;
        self.cloud_down();
    }

    /// Re-reads the device record. Fails when the cloud is down.
    pub fn cloud_init(&mut self) -> bool {
        if self.state == CloudState::Down {
            return false;
        }
        self.state = CloudState::Init;
        true
    }

    /// Tears the session down and schedules a ping after `holdoff_secs`, or
    /// after the ping backoff delay when zero.
    pub fn cloud_failure(&mut self, holdoff_secs: u32, now: Instant) {
        self.cloud_down();
        self.ping_schedule_retry(Duration::from_secs(u64::from(holdoff_secs)), now);
    }

    fn cloud_down(&mut self) {
        if self.state == CloudState::Down {
            return;
        }
        log::info!("ds: cloud connection down");
        self.state = CloudState::Down;
        self.dest_avail_set(self.dests_avail & !DestMask::ADS);
        self.events.push(CloudEvent::CancelRequests);
        self.notify_stop();
        self.polling_stop();
        self.do_ping = false;
        self.req_auth_errors = 0;
        self.ads_listen = false;
        self.replies.clear();
    }

    fn cloud_up(&mut self, now: Instant) {
        if self.state == CloudState::Up {
            return;
        }
        log::info!("ds: cloud connection up");
        self.state = CloudState::Up;
        self.dest_avail_set(self.dests_avail | DestMask::ADS);
        if !self.np_up {
            self.polling_start(now);
        }
    }

    pub fn dest_avail_set(&mut self, mask: DestMask) {
        if self.dests_avail != mask {
            self.dests_avail = mask;
            self.events.push(CloudEvent::DestsChanged(mask));
        }
    }

    /// Lets the machine fetch commands on behalf of the listening application.
    pub fn enable_ads_listen(&mut self) {
        if !self.ads_listen {
            log::info!("ds: listen enabled");
        }
        self.ads_listen = true;
        self.get_cmds = true;
    }

    pub fn request_commands(&mut self) {
        self.get_cmds = true;
    }

    /// A file datapoint was marked fetched: resume a partial command fetch.
    pub fn file_fetched(&mut self) {
        self.get_cmds = self.par_content;
        self.par_content = false;
    }

    pub fn set_ota_status(&mut self, status: i32) {
        self.ota_status = (status != 0).then_some(status);
    }

    pub fn request_regtoken(&mut self) {
        self.get_regtoken = true;
    }

    /// Opens a user registration window. Only possible while up.
    pub fn push_button_reg_start(&mut self) -> bool {
        if self.state != CloudState::Up {
            log::warn!("ds: cannot open registration window while cloud is {}", self.state);
            return false;
        }
        self.reg_window_start = true;
        true
    }

    /// Pushes a new template version to the cloud unless it already has it.
    pub fn update_template_version(&mut self, version: &str) {
        self.template_version = version.to_string();
        let current = self.info.as_ref().and_then(|info| info.template_version.as_deref());
        if current == Some(version) {
            return;
        }
        log::debug!("ds: template version {} to {version}", current.unwrap_or(""));
        self.update_oem_info = true;
    }

    /// Registration details for local clients.
    pub fn registration(&self) -> Value {
        let info = self.info.clone().unwrap_or_default();
        json!({
            "regtoken": info.regtoken,
            "registered": u8::from(info.registered),
            "registration_type": info.registration_type,
            "host_symname": info.product_name,
        })
    }

    /// Registration status pushed by the cloud. Unregistering invalidates the regtoken.
    pub fn set_registered(&mut self, registered: bool) {
        if let Some(info) = self.info.as_mut() {
            info.registered = registered;
            if !registered {
                info.regtoken = None;
            }
        }
    }

    /// Queues the reply to a reverse-REST command.
    pub fn queue_reply(&mut self, request: HttpRequest) {
        if self.state != CloudState::Up {
            log::warn!("ds: dropping command reply, cloud {}", self.state);
            return;
        }
        self.replies.push_back(request);
    }

    pub fn notify_event(&mut self, event: NotifyEvent, now: Instant) {
        match event {
            NotifyEvent::Change => {
                log::info!("ds: notify change event");
                self.np_up = false;
                self.np_started = false;
                self.cloud_init();
            }
            NotifyEvent::Down | NotifyEvent::DownRetry => {
                if self.np_up {
                    log::warn!("ds: notify down");
                    if self.state == CloudState::Up {
                        self.polling_start(now);
                        self.ping_schedule_retry(Duration::ZERO, now);
                    }
                }
                self.np_up = false;
                self.np_started = false;
            }
            NotifyEvent::DnsPass => {
                if !self.np_started {
                    if let Some(info) = &self.info {
                        self.events.push(CloudEvent::NotifyStart(info.cipher_key.clone()));
                        self.np_started = true;
                    }
                }
            }
            NotifyEvent::Check => {
                if !self.np_up {
                    log::info!("ds: notify up");
                }
                self.np_up = true;
                self.np_up_once = true;
                self.get_cmds = true;
                self.polling_stop();
            }
        }
    }

    fn notify_stop(&mut self) {
        self.events.push(CloudEvent::NotifyStop);
        self.np_up = false;
        self.np_started = false;
    }

    fn polling_start(&mut self, now: Instant) {
        if self.poll_interval.is_zero() {
            log::debug!("ds: polling disabled");
            return;
        }
        if self.poll_ads {
            return;
        }
        log::info!("ds: polling started, period {}s", self.poll_interval.as_secs());
        self.poll_ads = true;
        self.poll_at = Some(now + self.poll_interval);
    }

    fn polling_stop(&mut self) {
        if !self.poll_ads {
            return;
        }
        log::info!("ds: polling stopped");
        self.poll_ads = false;
        self.poll_at = None;
    }

    /// Schedules a ping retry. A zero delay uses the backoff for the number
    /// of pings sent so far. An already scheduled retry is only lengthened.
    fn ping_schedule_retry(&mut self, delay: Duration, now: Instant) {
        let delay = if delay.is_zero() {
            ping_retry_delay(self.ping_attempts, (self.jitter)())
        } else {
            delay
        };
        let current = self.ping_at.map(|at| at.saturating_duration_since(now));
        if current.map_or(true, |current| current.is_zero() || current < delay) {
            log::debug!("ds: ping retry in {}ms", delay.as_millis());
            self.ping_at = Some(now + delay);
        }
    }

    /// Fires expired timers.
    pub fn poll_timers(&mut self, now: Instant) {
        if self.ping_at.is_some_and(|at| at <= now) {
            self.ping_at = None;
            self.do_ping = true;
        }
        if self.poll_at.is_some_and(|at| at <= now) {
            log::debug!("ds: polling");
            self.get_cmds = true;
            if self.info.as_ref().is_some_and(|info| info.notify_server.is_some()) {
                self.events.push(CloudEvent::NotifyRecheck);
            }
            self.poll_at = Some(now + self.poll_interval);
        }
        if self.reg_window_until.is_some_and(|at| at <= now) {
            log::debug!("ds: registration window closed");
            self.reg_window_until = None;
        }
    }

    /// Highest priority work for the current state. Pure.
    pub fn next_action(&self) -> Option<CloudAction> {
        match self.state {
            CloudState::Down => self.do_ping.then_some(CloudAction::Ping),
            CloudState::Init => Some(CloudAction::GetDsns),
            CloudState::Update => self.update_info.is_some().then_some(CloudAction::PutInfo),
            CloudState::Up => {
                if self.do_ping {
                    Some(CloudAction::Ping)
                } else if self.update_oem_info {
                    Some(CloudAction::PutOemInfo)
                } else if self.reg_window_start {
                    Some(CloudAction::RegWindowStart)
                } else if self.ota_status.is_some() {
                    Some(CloudAction::OtaStatusPut)
                } else if !self.replies.is_empty() {
                    Some(CloudAction::CmdReply)
                } else if self.ads_listen && !self.commands.is_empty() {
                    Some(CloudAction::ProcessCmd)
                } else if self.ads_listen && self.get_cmds {
                    Some(CloudAction::GetCommands)
                } else if self.get_regtoken {
                    Some(CloudAction::GetRegtoken)
                } else {
                    None
                }
            }
        }
    }

    /// Picks the next piece of work. Returns `Idle` while a request is
    /// outstanding or the network is down.
    pub fn step(&mut self, now: Instant) -> CloudStep {
        loop {
            if self.in_flight.is_some() || !self.net_up {
                return CloudStep::Idle;
            }
            if self.state == CloudState::Update && self.update_info.is_none() {
                self.cloud_up(now);
                continue;
            }
            let Some(action) = self.next_action() else {
                return CloudStep::Idle;
            };
            if action == CloudAction::ProcessCmd {
                let Some(elem) = self.commands.pop_front() else {
                    continue;
                };
                match elem.get("cmd").filter(|cmd| cmd.is_object()) {
                    Some(cmd) => return CloudStep::Command(cmd.clone()),
                    None => {
                        log::warn!("ds: invalid cached command");
                        self.get_cmds = true;
                        self.commands.clear();
                        continue;
                    }
                }
            }
            let request = self.request(action);
            self.begin(action);
            log::debug!("ds: {action:?} {} {}", request.method, request.url);
            self.in_flight = Some(action);
            return CloudStep::Send(action, request);
        }
    }

    fn begin(&mut self, action: CloudAction) {
        match action {
            CloudAction::Ping => {
                self.ping_at = None;
                self.ping_attempts += 1;
            }
            CloudAction::GetDsns => self.notify_stop(),
            _ => {}
        }
    }

    /// Builds the request for `action`.
    pub fn request(&mut self, action: CloudAction) -> HttpRequest {
        let link = &self.link;
        let mut request = match action {
            CloudAction::Ping => {
                return HttpRequest::new(HttpMethod::Get, format!("http://{}/ping", link.host))
                    .timeout(self.ping_timeout)
                    .external();
            }
            CloudAction::GetDsns => {
                let mut url = link.url("dsns/$DSN.json");
                if let Some(args) = self.dsns_args {
                    url = format!("{url}?{args}");
                }
                link.request(HttpMethod::Get, url)
            }
            CloudAction::PutInfo => link
                .request(HttpMethod::Put, link.url("devices/$DEV_KEY.json"))
                .json(self.update_info.clone().unwrap_or(Value::Null)),
            CloudAction::PutOemInfo => link
                .request(HttpMethod::Put, link.device_url("oem_info.json"))
                .json(self.attrs.oem_info(&self.template_version)),
            CloudAction::RegWindowStart => {
                link.request(HttpMethod::Put, link.device_url("start_reg_window.json"))
            }
            CloudAction::OtaStatusPut => link
                .request(HttpMethod::Put, link.device_url("ota_failed.json"))
                .json(json!({"status": self.ota_status.unwrap_or(0), "type": "host_mcu"})),
            CloudAction::CmdReply => match self.replies.pop_front() {
                Some(reply) => reply,
                None => link.request(HttpMethod::Put, link.device_url("commands.json")),
            },
            CloudAction::GetCommands => {
                let mut url = link.device_url("commands.json");
                if self.poll_ads {
                    url.push_str(if self.np_up_once { "?polling=1" } else { "?polling=2" });
                }
                link.request(HttpMethod::Get, url)
            }
            CloudAction::GetRegtoken => link.request(HttpMethod::Get, link.url("dsns/$DSN.json")),
            CloudAction::ProcessCmd => link.request(HttpMethod::Get, link.device_url("commands.json")),
        };
        self.authorize(&mut request);
        request
    }

    /// Applies the device credential to a cloud request.
    pub fn authorize(&self, request: &mut HttpRequest) {
        if !request.cloud {
            return;
        }
        let header = self
            .auth_header
            .clone()
            .or_else(|| self.provisioned_auth.as_ref().map(|token| format!("{AUTH_VERSION} {token}")));
        match header {
            Some(value) => request.set_header(AUTH_HEADER, value),
            None => request.headers.retain(|(name, _)| !name.eq_ignore_ascii_case(AUTH_HEADER)),
        }
    }

    /// Status handling shared by every cloud request, from either client.
    pub fn check_response(
        &mut self,
        request: &HttpRequest,
        result: &Result<HttpResponse, HttpError>,
        now: Instant,
    ) -> Verdict {
        if !request.cloud {
            return Verdict::Deliver;
        }
        match result {
            Ok(resp) => {
                if let Some(token) = resp.header(AUTH_HEADER).filter(|token| !token.is_empty()) {
                    log::debug!("ds: received auth token, {} bytes", token.len());
                    self.auth_header = Some(format!("{AUTH_VERSION} {token}"));
                }
                match resp.status {
                    STATUS_UNAUTHORIZED => {
                        self.auth_header = None;
                        self.req_auth_errors += 1;
                        if self.req_auth_errors >= MAX_AUTH_ERRORS {
                            log::warn!("ds: max auth errors reached");
                            self.cloud_failure(UNAUTH_HOLDOFF, now);
                        } else {
                            log::debug!("ds: resending with new credentials");
                            return Verdict::Resend;
                        }
                    }
                    STATUS_TOO_MANY_REQUESTS | STATUS_UNAVAILABLE | STATUS_GATEWAY_TIMEOUT => {
                        log::warn!("ds: cloud overloaded, status {}", resp.status);
                        self.cloud_failure(OVERLOAD_HOLDOFF, now);
                    }
                    status if crate::http::is_success(status) => self.req_auth_errors = 0,
                    _ => {}
                }
            }
            Err(HttpError::Canceled) => {}
            Err(err) => {
                log::warn!("ds: {} {} failed: {err}", request.method, request.url);
                self.cloud_failure(0, now);
            }
        }
        Verdict::Deliver
    }

    /// Applies the result of the request started for `action`.
    pub fn complete(&mut self, action: CloudAction, result: Result<HttpResponse, HttpError>, now: Instant) {
        if self.in_flight != Some(action) {
            log::warn!("ds: unexpected completion of {action:?}");
            return;
        }
        self.in_flight = None;
        let canceled = matches!(result, Err(HttpError::Canceled));
        let resp = match result {
            Ok(resp) if resp.is_success() => Some(resp),
            Ok(resp) => {
                log::warn!("ds: {action:?} failed with status {}", resp.status);
                None
            }
            Err(_) => None,
        };

        match action {
            CloudAction::Ping => self.ping_done(resp, canceled, now),
            CloudAction::GetDsns => match resp {
                Some(resp) => self.dsns_done(&resp, now),
                None if !canceled => self.cloud_failure(0, now),
                None => {}
            },
            CloudAction::PutInfo => match resp {
                Some(_) => {
                    self.update_info = None;
                    self.cloud_up(now);
                }
                None if !canceled => self.cloud_failure(0, now),
                None => {}
            },
            CloudAction::PutOemInfo => match resp {
                Some(resp) => {
                    let body = resp.json().unwrap_or(Value::Null);
                    if let Some(info) = self.info.as_mut() {
                        if let Some(name) = body.get("product_name").and_then(Value::as_str) {
                            info.product_name = Some(name.to_string());
                        }
                        if let Some(kind) = body.get("registration_type").and_then(Value::as_str) {
                            info.registration_type = Some(kind.to_string());
                        }
                        info.template_version = Some(self.template_version.clone());
                    }
                    self.update_oem_info = false;
                }
                None if !canceled => self.cloud_failure(0, now),
                None => {}
            },
            CloudAction::RegWindowStart => {
                if resp.is_some() {
                    log::debug!("ds: registration window open for {}s", REG_WINDOW.as_secs());
                    self.reg_window_until = Some(now + REG_WINDOW);
                }
                if !canceled {
                    self.reg_window_start = false;
                }
            }
            CloudAction::OtaStatusPut => {
                if !canceled {
                    self.ota_status = None;
                }
            }
            CloudAction::CmdReply | CloudAction::ProcessCmd => {}
            CloudAction::GetCommands => match resp {
                Some(resp) => self.commands_done(&resp),
                None if !canceled => self.get_cmds = false,
                None => {}
            },
            CloudAction::GetRegtoken => match resp {
                Some(resp) => {
                    let regtoken = resp
                        .json()
                        .and_then(|body| body.pointer("/device/regtoken").cloned())
                        .and_then(|token| token.as_str().map(str::to_string));
                    if let Some(info) = self.info.as_mut() {
                        info.regtoken = regtoken;
                    }
                    self.get_regtoken = false;
                }
                None if !canceled => self.cloud_failure(0, now),
                None => {}
            },
        }
    }

    fn ping_done(&mut self, resp: Option<HttpResponse>, canceled: bool, now: Instant) {
        self.do_ping = false;
        let Some(resp) = resp else {
            if !canceled {
                log::warn!("ds: ping failed");
                self.cloud_failure(0, now);
            }
            return;
        };
        if !resp.header("Text").is_some_and(|text| text.eq_ignore_ascii_case("Ping")) {
            log::warn!("ds: ping response invalid");
            self.cloud_failure(0, now);
            return;
        }
        log::debug!("ds: ping succeeded");
        self.ping_attempts = 0;
        if self.state == CloudState::Down {
            self.state = CloudState::Init;
        }
    }

    fn dsns_done(&mut self, resp: &HttpResponse, now: Instant) {
        let parsed = resp
            .json()
            .ok_or(device::InfoError::NoDevice)
            .and_then(|body| DeviceInfo::parse(&body).map(|info| (info, body)));
        let (info, body) = match parsed {
            Ok(parsed) => parsed,
            Err(err) => {
                log::error!("ds: invalid device record: {err}");
                self.cloud_failure(0, now);
                return;
            }
        };
        self.dsns_args = None;
        self.link.key = info.key.clone();
        match &info.notify_server {
            Some(server) => {
                log::info!("ds: notify server {server}");
                self.events.push(CloudEvent::NotifyServer(server.clone()));
            }
            None => log::info!("ds: notify disabled"),
        }
        let cloud_template = info.template_version.clone();
        self.info = Some(info);
        if !self.template_version.is_empty() && cloud_template.as_deref() != Some(&self.template_version) {
            self.update_oem_info = true;
        }
        match self.attrs.diff(&body) {
            Some(update) => {
                self.update_info = Some(update);
                self.state = CloudState::Update;
            }
            None => {
                log::debug!("ds: device attributes up to date");
                self.cloud_up(now);
            }
        }
    }

    fn commands_done(&mut self, resp: &HttpResponse) {
        match resp.json().and_then(|body| body.get("commands").cloned()) {
            Some(commands) if commands.is_object() => {
                self.commands.clear();
                if let Some(cmds) = commands.get("cmds").and_then(Value::as_array) {
                    self.commands.extend(cmds.iter().cloned());
                }
                let non_empty = |key: &str| commands.get(key).filter(|v| v.as_array().is_some_and(|a| !a.is_empty())).cloned();
                if let Some(props) = non_empty("properties") {
                    self.events.push(CloudEvent::Properties(props));
                }
                if let Some(scheds) = non_empty("node_schedules") {
                    self.events.push(CloudEvent::NodeSchedules(scheds));
                }
                if let Some(props) = non_empty("node_properties") {
                    self.events.push(CloudEvent::NodeProperties(props));
                }
            }
            _ => log::error!("ds: missing commands object"),
        }
        self.get_cmds = false;
        self.par_content = resp.status == STATUS_PARTIAL_CONTENT;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;

    fn no_jitter() -> u32 {
        0
    }

    fn machine() -> CloudMachine {
        let link = CloudLink {
            host: "ads.example.com".to_string(),
            dsn: "AC000W1".to_string(),
            ..CloudLink::default()
        };
        let attrs = LocalAttributes { model: "gw".to_string(), ..LocalAttributes::default() };
        CloudMachine::new(link, attrs)
            .with_jitter(no_jitter)
            .with_poll_interval(Duration::from_secs(300))
    }

    fn record(attrs_current: bool) -> Value {
        let mut device = json!({
            "key": 77,
            "ans_cipher_key": BASE64.encode([3u8; 16]),
            "ans_server": "ans.example.com",
        });
        if attrs_current {
            for (name, value) in [
                ("api_major", json!(1)),
                ("api_minor", json!(0)),
                ("sw_version", json!("")),
                ("model", json!("gw")),
                ("lan_ip", json!("")),
                ("oem", json!("")),
                ("oem_model", json!("")),
                ("setup_token", json!("")),
                ("setup_location", json!("")),
                ("ssid", json!("")),
            ] {
                device[name] = value;
            }
        }
        json!({ "device": device })
    }

    fn ping_ok() -> HttpResponse {
        HttpResponse::new(200).with_header("Text", "Ping")
    }

    fn expect_send(machine: &mut CloudMachine, expected: CloudAction) -> HttpRequest {
        match machine.step(Instant::now()) {
            CloudStep::Send(action, request) => {
                assert_eq!(action, expected);
                request
            }
            other => panic!("expected {expected:?}, got {other:?}"),
        }
    }

    fn bring_up(machine: &mut CloudMachine, now: Instant) {
        machine.net_up();
        expect_send(machine, CloudAction::Ping);
        machine.complete(CloudAction::Ping, Ok(ping_ok()), now);
        assert_eq!(machine.state(), CloudState::Init);
        expect_send(machine, CloudAction::GetDsns);
        machine.complete(CloudAction::GetDsns, Ok(HttpResponse::with_json(200, &record(true))), now);
        assert_eq!(machine.state(), CloudState::Up);
    }

    #[test]
    fn ping_then_record_brings_cloud_up() {
        let now = Instant::now();
        let mut m = machine();
        assert_eq!(m.step(now), CloudStep::Idle);
        m.net_up();
        let ping = expect_send(&mut m, CloudAction::Ping);
        assert_eq!(ping.url, "http://ads.example.com/ping");
        assert!(!ping.cloud);
        assert_eq!(m.step(now), CloudStep::Idle);
        m.complete(CloudAction::Ping, Ok(ping_ok()), now);

        let get = expect_send(&mut m, CloudAction::GetDsns);
        assert_eq!(get.url, "https://ads.example.com/dsns/AC000W1.json");
        m.complete(CloudAction::GetDsns, Ok(HttpResponse::with_json(200, &record(false))), now);
        assert_eq!(m.state(), CloudState::Update);
        assert_eq!(m.link().key, "77");

        let put = expect_send(&mut m, CloudAction::PutInfo);
        assert_eq!(put.url, "https://ads.example.com/devices/77.json");
        m.complete(CloudAction::PutInfo, Ok(HttpResponse::new(200)), now);
        assert!(m.is_up());
        assert!(m.dests_avail().has_ads());
        assert!(m.is_polling());

        let events = m.drain_events();
        assert!(events.contains(&CloudEvent::NotifyServer("ans.example.com".to_string())));
        assert!(events.contains(&CloudEvent::DestsChanged(DestMask::ADS)));
    }

    #[test]
    fn up_only_actions_never_run_outside_up() {
        let now = Instant::now();
        let mut m = machine();
        m.enable_ads_listen();
        m.request_regtoken();
        m.set_ota_status(3);
        m.update_template_version("2.0");
        m.net_up();
        let mut seen = Vec::new();
        for _ in 0..3 {
            match m.step(now) {
                CloudStep::Send(action, _) => {
                    assert!(!action.is_up_only() || m.is_up(), "{action:?} while {}", m.state());
                    seen.push(action);
                    let resp = match action {
                        CloudAction::Ping => ping_ok(),
                        CloudAction::GetDsns => HttpResponse::with_json(200, &record(false)),
                        _ => HttpResponse::new(200),
                    };
                    m.complete(action, Ok(resp), now);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(seen, vec![CloudAction::Ping, CloudAction::GetDsns, CloudAction::PutInfo]);
        assert!(m.is_up());
        assert_eq!(m.next_action(), Some(CloudAction::PutOemInfo));

        m.cloud_failure(0, now);
        assert_eq!(m.state(), CloudState::Down);
        assert_eq!(m.next_action(), None);
        assert!(!m.is_polling());
    }

    #[test]
    fn up_actions_follow_priority_order() {
        let now = Instant::now();
        let mut m = machine();
        bring_up(&mut m, now);
        m.enable_ads_listen();
        m.request_regtoken();
        m.set_ota_status(5);
        assert!(m.push_button_reg_start());

        let reg = expect_send(&mut m, CloudAction::RegWindowStart);
        assert_eq!(reg.url, "https://ads.example.com/devices/77/start_reg_window.json");
        m.complete(CloudAction::RegWindowStart, Ok(HttpResponse::new(200)), now);
        assert!(m.reg_window_open());

        let ota = expect_send(&mut m, CloudAction::OtaStatusPut);
        assert_eq!(ota.body, crate::http::RequestBody::Json(json!({"status": 5, "type": "host_mcu"})));
        m.complete(CloudAction::OtaStatusPut, Ok(HttpResponse::new(200)), now);

        let get = expect_send(&mut m, CloudAction::GetCommands);
        assert_eq!(get.url, "https://ads.example.com/devices/77/commands.json?polling=2");
        let body = json!({"commands": {
            "cmds": [{"cmd": {"id": 9, "method": "GET", "resource": "status.json", "uri": "/status"}}],
            "properties": [{"property": {"name": "a", "value": 1}}],
            "node_properties": [{"property": {"dsn": "VR1", "name": "s1:t:a", "value": 1}}],
            "node_schedules": []
        }});
        m.complete(CloudAction::GetCommands, Ok(HttpResponse::with_json(206, &body)), now);
        let events = m.drain_events();
        assert!(events.iter().any(|e| matches!(e, CloudEvent::Properties(_))));
        assert!(events.iter().any(|e| matches!(e, CloudEvent::NodeProperties(_))));
        assert!(!events.iter().any(|e| matches!(e, CloudEvent::NodeSchedules(_))));

        match m.step(now) {
            CloudStep::Command(cmd) => assert_eq!(cmd["id"], 9),
            other => panic!("expected command, got {other:?}"),
        }
        m.queue_reply(HttpRequest::new(HttpMethod::Put, "https://ads.example.com/devices/77/status?cmd_id=9&status=200"));
        expect_send(&mut m, CloudAction::CmdReply);
        m.complete(CloudAction::CmdReply, Ok(HttpResponse::new(200)), now);

        expect_send(&mut m, CloudAction::GetRegtoken);
        m.complete(
            CloudAction::GetRegtoken,
            Ok(HttpResponse::with_json(200, &json!({"device": {"regtoken": "abc123"}}))),
            now,
        );
        assert_eq!(m.registration()["regtoken"], "abc123");
        assert_eq!(m.step(now), CloudStep::Idle);

        m.file_fetched();
        assert_eq!(m.next_action(), Some(CloudAction::GetCommands));
    }

    #[test]
    fn repeated_ping_failures_back_off() {
        let start = Instant::now();
        let mut m = machine();
        m.net_up();
        let mut now = start;
        for attempt in 1..=4u32 {
            expect_send(&mut m, CloudAction::Ping);
            m.complete(CloudAction::Ping, Err(HttpError::Timeout), now);
            let delay = m.ping_deadline().expect("retry scheduled") - now;
            let expected = if attempt < 4 { 1000 } else { 2000 };
            assert_eq!(delay, Duration::from_millis(expected), "attempt {attempt}");
            now += delay;
            m.poll_timers(now);
        }
        assert_eq!(m.ping_attempts(), 4);
        assert_eq!(m.state(), CloudState::Down);
    }

    #[test]
    fn retry_jitter_stays_below_half_the_delay() {
        fn big_jitter() -> u32 {
            u32::MAX
        }
        let now = Instant::now();
        let mut m = machine().with_jitter(big_jitter);
        m.net_up();
        for _ in 0..4 {
            expect_send(&mut m, CloudAction::Ping);
            m.complete(CloudAction::Ping, Err(HttpError::Timeout), now);
            m.poll_timers(now + Duration::from_secs(60));
        }
        expect_send(&mut m, CloudAction::Ping);
        m.complete(CloudAction::Ping, Err(HttpError::Timeout), now);
        let delay = m.ping_deadline().expect("retry scheduled") - now;
        assert!(delay >= Duration::from_millis(2000));
        assert!(delay < Duration::from_millis(3000));
    }

    #[test]
    fn scheduled_retry_is_only_lengthened() {
        let now = Instant::now();
        let mut m = machine();
        bring_up(&mut m, now);
        m.cloud_failure(OVERLOAD_HOLDOFF, now);
        assert_eq!(m.ping_deadline(), Some(now + Duration::from_secs(60)));
        m.cloud_failure(0, now);
        assert_eq!(m.ping_deadline(), Some(now + Duration::from_secs(60)));
        m.poll_timers(now + Duration::from_secs(60));
        assert_eq!(m.next_action(), Some(CloudAction::Ping));
    }

    #[test]
    fn unauthorized_resends_until_limit() {
        let now = Instant::now();
        let mut m = machine().with_auth_token("provisioned");
        bring_up(&mut m, now);
        m.enable_ads_listen();
        let request = expect_send(&mut m, CloudAction::GetCommands);
        assert_eq!(
            request.headers,
            vec![(AUTH_HEADER.to_string(), "Ayla1.0 provisioned".to_string())]
        );

        let ok = Ok(HttpResponse::new(200).with_header(AUTH_HEADER, "temp"));
        assert_eq!(m.check_response(&request, &ok, now), Verdict::Deliver);
        let mut again = request.clone();
        m.authorize(&mut again);
        assert_eq!(again.headers[0].1, "Ayla1.0 temp");

        let unauthorized = Ok(HttpResponse::new(401));
        assert_eq!(m.check_response(&request, &unauthorized, now), Verdict::Resend);
        assert_eq!(m.check_response(&request, &unauthorized, now), Verdict::Resend);
        assert_eq!(m.check_response(&request, &unauthorized, now), Verdict::Deliver);
        assert_eq!(m.state(), CloudState::Down);
        assert_eq!(m.ping_deadline(), Some(now + Duration::from_secs(60)));
        assert!(m.drain_events().contains(&CloudEvent::CancelRequests));
    }

    #[test]
    fn transport_failure_takes_cloud_down() {
        let now = Instant::now();
        let mut m = machine();
        bring_up(&mut m, now);
        m.enable_ads_listen();
        let request = expect_send(&mut m, CloudAction::GetCommands);
        let result = Err(HttpError::Transport { message: "reset".to_string() });
        assert_eq!(m.check_response(&request, &result, now), Verdict::Deliver);
        assert_eq!(m.state(), CloudState::Down);
        assert!(!m.dests_avail().has_ads());
        m.complete(CloudAction::GetCommands, result, now);
        assert!(!m.is_busy());
    }

    #[test]
    fn notify_liveness_replaces_polling() {
        let now = Instant::now();
        let mut m = machine();
        bring_up(&mut m, now);
        assert!(m.is_polling());
        m.notify_event(NotifyEvent::DnsPass, now);
        assert!(m.drain_events().contains(&CloudEvent::NotifyStart(vec![3u8; 16])));
        m.notify_event(NotifyEvent::Check, now);
        assert!(!m.is_polling());

        m.notify_event(NotifyEvent::Down, now);
        assert!(m.is_polling());
        assert_eq!(m.next_action(), None);
        assert!(m.ping_deadline().is_some());

        m.poll_timers(now + Duration::from_secs(300));
        assert!(m.drain_events().contains(&CloudEvent::NotifyRecheck));
        expect_send(&mut m, CloudAction::Ping);
        m.complete(CloudAction::Ping, Ok(ping_ok()), now);
        assert!(m.is_up());
        m.enable_ads_listen();
        let get = expect_send(&mut m, CloudAction::GetCommands);
        assert!(get.url.ends_with("commands.json?polling=1"));
    }

    #[test]
    fn update_without_pending_info_completes_bring_up() {
        let now = Instant::now();
        let mut m = machine();
        m.net_up();
        expect_send(&mut m, CloudAction::Ping);
        m.complete(CloudAction::Ping, Ok(ping_ok()), now);
        expect_send(&mut m, CloudAction::GetDsns);
        m.complete(CloudAction::GetDsns, Ok(HttpResponse::with_json(200, &record(false))), now);
        assert_eq!(m.state(), CloudState::Update);
        m.update_info = None;
        m.drain_events();

        assert_eq!(m.step(now), CloudStep::Idle);
        assert!(m.is_up());
        assert!(m.dests_avail().has_ads());
        assert!(m.is_polling());
        assert!(m.drain_events().contains(&CloudEvent::DestsChanged(DestMask::ADS)));
    }

    #[test]
    fn net_down_from_any_state_returns_to_down() {
        let now = Instant::now();
        let mut m = machine();
        bring_up(&mut m, now);
        m.net_down();
        assert_eq!(m.state(), CloudState::Down);
        assert_eq!(m.step(now), CloudStep::Idle);
        m.net_up();
        assert_eq!(m.next_action(), Some(CloudAction::Ping));
    }
}
