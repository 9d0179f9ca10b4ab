//! Daemon state shared by every worker.
//!
//! [`DaemonContext`] wires the cloud machine, the operation queue, the LAN
//! table, the notify client and the reverse-REST router together. It does no
//! I/O: workers ask it for the next request of their kind, perform it, and
//! feed the result back. Anything else the daemon must act on comes out of
//! [`DaemonContext::drain_outputs`].

use crate::app::{
    AppOutbox, AppRequest, CLIENT_DESTS, CLIENT_DESTS_REG, CLIENT_DESTS_REQ, CLIENT_LISTEN_ENABLE, PROTO_DATA,
};
use crate::config::{ClientConfig, DevdConfig, LanConfig, NotifyConfig};
use crate::dests::{DestMask, SOURCE_ADS};
use crate::ds::{CloudAction, CloudEvent, CloudMachine, CloudStep, Verdict};
use crate::error::{DevdError, ErrType};
use crate::gateway::{
    deliver_node_schedules, deliver_node_updates, handle_gateway_request, GatewayAction, NodeMap, NodeMapping,
    PROTO_GATEWAY,
};
use crate::http::{HttpError, HttpMethod, HttpRequest, HttpResponse, STATUS_BAD_REQUEST};
use crate::lan::{LanSession, LanStepKind, LanTable, RsaSealer};
use crate::notify::{Line, NotifyClient, NotifyOutput};
use crate::ops::ota::{OtaImage, OtaUrlFetch};
use crate::ops::{Exec, FileLocation, LanOutcome, OpContext, OpEvent, OpsQueue};
use crate::props::{deliver_updates, handle_data_request, DataAction, QueuedCmd};
use crate::registry::ConfigRegistry;
use crate::rest::{DeviceStatus, Dispatch, Origin, RevContext, RevEffect, RevReply, RevRequest, RevServer};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Something the daemon has to do outside the core.
#[derive(Debug, Clone, PartialEq)]
pub enum DaemonOutput {
    /// JSON interface message for the local application.
    App(Value),
    /// New destination mask for subscribed sessions.
    Dests(DestMask),
    Notify(NotifyOutput),
    /// Abort cloud requests in flight.
    CancelRequests,
    Reset { factory: bool },
    Ota(OtaImage),
    /// The node mappings changed and should be persisted.
    NodesChanged(Vec<NodeMapping>),
}

/// Work for the operations worker.
#[derive(Debug, Clone, PartialEq)]
pub enum OpWork {
    Idle,
    Wait,
    /// Deliver each post and report the results together.
    Lan(Vec<LanDelivery>),
    Send(HttpRequest),
}

#[derive(Debug, Clone, PartialEq)]
pub struct LanDelivery {
    pub lan_id: u8,
    pub generation: u64,
    pub request: HttpRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LanRequestKind {
    KeyExchange,
    GetCommands,
    /// Answer to a command the client issued.
    Reply,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LanRequest {
    pub id: u8,
    /// Registration of slot `id` the request was built for.
    pub generation: u64,
    pub kind: LanRequestKind,
    pub request: HttpRequest,
}

fn apply_client(config: &mut DevdConfig, value: &Value) -> Result<(), DevdError> {
    config.client = serde_json::from_value::<ClientConfig>(value.clone())
        .map_err(|err| DevdError::config(err.to_string()))?;
    Ok(())
}

fn apply_lan(config: &mut DevdConfig, value: &Value) -> Result<(), DevdError> {
    config.lan =
        serde_json::from_value::<LanConfig>(value.clone()).map_err(|err| DevdError::config(err.to_string()))?;
    Ok(())
}

fn apply_notify(config: &mut DevdConfig, value: &Value) -> Result<(), DevdError> {
    config.notify = serde_json::from_value::<NotifyConfig>(value.clone())
        .map_err(|err| DevdError::config(err.to_string()))?;
    Ok(())
}

fn unix_time() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|elapsed| elapsed.as_secs()).unwrap_or(0)
}

pub struct DaemonContext {
    config: DevdConfig,
    registry: ConfigRegistry<DevdConfig>,
    cloud: CloudMachine,
    ops: OpsQueue,
    app: AppOutbox,
    rev: RevServer,
    lan: LanTable,
    notify: NotifyClient,
    file: Option<FileLocation>,
    op_events: Vec<OpEvent>,
    nodes: NodeMap,
    status: DeviceStatus,
    started: Instant,
    /// LAN posts of the head command that failed before being sent.
    lan_prefailed: Vec<(u8, LanOutcome)>,
    lan_replies: VecDeque<(u8, u64, HttpRequest)>,
    outputs: Vec<DaemonOutput>,
}

impl DaemonContext {
    pub fn new(config: DevdConfig, now: Instant) -> Self {
        let mut registry = ConfigRegistry::new();
        registry.register("client", apply_client);
        registry.register("lan", apply_lan);
        registry.register("notify", apply_notify);
        let status = DeviceStatus {
            dsn: config.device.dsn.clone(),
            device_service: config.device.ads_host.clone(),
            version: config.device.sw_version.clone(),
            ..DeviceStatus::default()
        };
        Self {
            cloud: CloudMachine::from_config(&config),
            ops: OpsQueue::new(),
            app: AppOutbox::new(),
            rev: RevServer::new(),
            lan: LanTable::new(config.lan.clone()).with_sealer(Box::new(RsaSealer)),
            notify: NotifyClient::new(&config.notify, now),
            file: None,
            op_events: Vec::new(),
            nodes: NodeMap::from_mappings(&config.gateway.node_mappings),
            status,
            started: now,
            lan_prefailed: Vec::new(),
            lan_replies: VecDeque::new(),
            outputs: Vec::new(),
            config,
            registry,
        }
    }

    /// Replaces the cloud machine, keeping everything else.
    pub fn with_cloud(mut self, cloud: CloudMachine) -> Self {
        self.cloud = cloud;
        self
    }

    pub fn with_lan_table(mut self, lan: LanTable) -> Self {
        self.lan = lan;
        self
    }

    pub fn config(&self) -> &DevdConfig {
        &self.config
    }

    pub fn cloud(&self) -> &CloudMachine {
        &self.cloud
    }

    pub fn cloud_mut(&mut self) -> &mut CloudMachine {
        &mut self.cloud
    }

    pub fn lan(&self) -> &LanTable {
        &self.lan
    }

    pub fn notify(&self) -> &NotifyClient {
        &self.notify
    }

    pub fn ops_len(&self) -> usize {
        self.ops.len()
    }

    pub fn file_location(&self) -> Option<&FileLocation> {
        self.file.as_ref()
    }

    pub fn nodes(&self) -> &NodeMap {
        &self.nodes
    }

    pub fn dests_avail(&self) -> DestMask {
        self.cloud.dests_avail()
    }

    pub fn net_up(&mut self) {
        self.cloud.net_up();
    }

    pub fn net_down(&mut self) {
        self.cloud.net_down();
    }

    /// Runtime config read, `section/key` paths.
    pub fn config_get(&self, path: &str) -> Option<Value> {
        self.registry.get(&self.config, path)
    }

    /// Runtime config change. The owning subsystem picks up the new section.
    pub fn config_set(&mut self, path: &str, value: Value, now: Instant) -> Result<(), DevdError> {
        self.registry.set(&mut self.config, path, value)?;
        let section = path.trim_matches('/').split('/').next().unwrap_or_default();
        log::info!("devd: config {section} changed");
        match section {
            "client" => {
                self.cloud.set_poll_interval(Duration::from_secs(u64::from(self.config.client.poll_interval)));
            }
            "lan" => self.install_lan_config(self.config.lan.clone()),
            "notify" => {
                self.notify.set_poll_default(self.config.notify.poll_interval);
                if let Some(server) = self.config.notify.server.clone() {
                    self.notify.set_server(&server, now);
                }
            }
            _ => {}
        }
        self.settle(now);
        Ok(())
    }

    /// Everything produced since the last call, in order.
    pub fn drain_outputs(&mut self) -> Vec<DaemonOutput> {
        std::mem::take(&mut self.outputs)
    }

    /// Earliest timer across all subsystems.
    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.cloud.next_deadline(),
            self.notify.next_deadline(),
            self.lan.next_deadline(),
            self.rev.next_deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Fires every expired timer.
    pub fn poll(&mut self, now: Instant) {
        self.cloud.poll_timers(now);
        self.notify.poll(now);
        let expired = self.lan.expire(now);
        if !expired.is_empty() {
            log::info!("devd: lan sessions {expired:?} expired");
        }
        for (req, reply) in self.rev.expire(now) {
            self.send_rev_reply(&req, &reply, now);
        }
        self.settle(now);
    }

    /// Message on the client control interface. Returns the `DESTS` payload
    /// to send back, if the message asks for one.
    pub fn client_message(&mut self, kind: u8, now: Instant) -> Option<Value> {
        let reply = match kind {
            CLIENT_LISTEN_ENABLE => {
                self.cloud.enable_ads_listen();
                None
            }
            CLIENT_DESTS_REQ | CLIENT_DESTS_REG => Some(json!({"dests": self.cloud.dests_avail().bits()})),
            CLIENT_DESTS => None,
            other => {
                log::debug!("devd: unhandled client message {other}");
                None
            }
        };
        self.settle(now);
        reply
    }

    /// A JSON interface datagram from the local application.
    pub fn data_message(&mut self, payload: &[u8], now: Instant) {
        match AppRequest::parse(payload) {
            Err(err) => {
                log::warn!("devd: bad app message: {err}");
                self.app.error(err);
            }
            Ok(req) if req.proto == PROTO_GATEWAY => self.gateway_message(&req, now),
            Ok(req) if req.proto != PROTO_DATA => {
                log::warn!("devd: unknown protocol {}", req.proto);
                self.app.nak(&req.proto, ErrType::UnknownProtocol, req.id);
            }
            Ok(req) => match handle_data_request(&req, self.cloud.dests_avail(), &mut self.app) {
                DataAction::Done => {}
                DataAction::Queue(cmd, handler) => {
                    self.ops.add(cmd, handler);
                }
                DataAction::PropResp { id, args } => match self.rev.prop_response(id, args.as_ref()) {
                    Some((request, reply)) => self.send_rev_reply(&request, &reply, now),
                    None => log::debug!("devd: prop_resp {id} matches no request"),
                },
            },
        }
        self.settle(now);
    }

    fn gateway_message(&mut self, req: &AppRequest, now: Instant) {
        match handle_gateway_request(req, self.cloud.dests_avail(), &mut self.app) {
            GatewayAction::Done => {}
            GatewayAction::Queue(cmd, handler) => {
                self.ops.add(cmd, handler);
            }
            GatewayAction::PropResp { id, args } => {
                match self.rev.node_prop_response(id, args.as_ref(), &self.nodes, &mut self.app) {
                    Some((request, reply)) => self.send_rev_reply(&request, &reply, now),
                    None => log::debug!("devd: node prop_resp {id} matches no request"),
                }
            }
            GatewayAction::ConnStatusResp { id, args } => {
                match self.rev.conn_status_response(id, args.as_ref(), &self.nodes, &mut self.app) {
                    Some((request, reply)) => self.send_rev_reply(&request, &reply, now),
                    None => log::debug!("devd: conn_status_resp {id} matches no request"),
                }
            }
        }
    }

    /// Next request for the cloud client. Reverse-REST commands fetched from
    /// the cloud are executed here until an HTTP request is needed.
    pub fn next_cloud_request(&mut self, now: Instant) -> Option<(CloudAction, HttpRequest)> {
        let next = loop {
            match self.cloud.step(now) {
                CloudStep::Idle => break None,
                CloudStep::Send(action, request) => break Some((action, request)),
                CloudStep::Command(cmd) => self.run_command(&cmd, Origin::Ads, now),
            }
        };
        self.settle(now);
        next
    }

    /// Result of a request from [`Self::next_cloud_request`]. Returns the
    /// request again, with fresh credentials, when it must be re-sent.
    pub fn cloud_complete(
        &mut self,
        action: CloudAction,
        mut request: HttpRequest,
        result: Result<HttpResponse, HttpError>,
        now: Instant,
    ) -> Option<HttpRequest> {
        if self.cloud.check_response(&request, &result, now) == Verdict::Resend {
            self.cloud.authorize(&mut request);
            return Some(request);
        }
        self.cloud.complete(action, result, now);
        self.settle(now);
        None
    }

    /// Next piece of work for the operations worker.
    pub fn next_op(&mut self, now: Instant) -> OpWork {
        let work = loop {
            let exec = {
                let mut ctx = OpContext {
                    link: self.cloud.link(),
                    cloud_up: self.cloud.is_up(),
                    dests_avail: self.cloud.dests_avail(),
                    app: &mut self.app,
                    file: &mut self.file,
                    events: &mut self.op_events,
                    nodes: &self.nodes,
                };
                self.ops.next_request(&mut ctx)
            };
            match exec {
                Exec::Idle => break OpWork::Idle,
                Exec::Wait => break OpWork::Wait,
                Exec::Send(mut request) => {
                    self.cloud.authorize(&mut request);
                    break OpWork::Send(request);
                }
                Exec::Lan(posts) => {
                    let mut deliveries = Vec::new();
                    self.lan_prefailed.clear();
                    for post in posts {
                        match self.lan.post_request(post.lan_id, &post.resource, &post.body, now) {
                            Ok(request) => deliveries.push(LanDelivery {
                                lan_id: post.lan_id,
                                generation: self.lan.session(post.lan_id).map_or(0, LanSession::generation),
                                request,
                            }),
                            Err(err) => {
                                log::warn!("devd: lan #{} post not built: {err}", post.lan_id);
                                self.lan_prefailed.push((post.lan_id, LanOutcome::Failed));
                            }
                        }
                    }
                    if !deliveries.is_empty() {
                        break OpWork::Lan(deliveries);
                    }
                    let results = std::mem::take(&mut self.lan_prefailed);
                    self.ops.complete_lan(&results);
                }
            }
        };
        self.settle(now);
        work
    }

    /// Results of an [`OpWork::Lan`] batch, keyed by delivery slot and generation.
    pub fn op_lan_complete(&mut self, results: Vec<(u8, u64, Result<HttpResponse, HttpError>)>, now: Instant) {
        let mut outcomes = std::mem::take(&mut self.lan_prefailed);
        for (lan_id, generation, result) in results {
            outcomes.push((lan_id, self.lan.post_result(lan_id, generation, &result)));
        }
        self.ops.complete_lan(&outcomes);
        self.settle(now);
    }

    /// Result of an [`OpWork::Send`] request.
    pub fn op_complete(
        &mut self,
        mut request: HttpRequest,
        result: Result<HttpResponse, HttpError>,
        now: Instant,
    ) -> Option<HttpRequest> {
        if self.cloud.check_response(&request, &result, now) == Verdict::Resend {
            self.cloud.authorize(&mut request);
            return Some(request);
        }
        {
            let mut ctx = OpContext {
                link: self.cloud.link(),
                cloud_up: self.cloud.is_up(),
                dests_avail: self.cloud.dests_avail(),
                app: &mut self.app,
                file: &mut self.file,
                events: &mut self.op_events,
                nodes: &self.nodes,
            };
            self.ops.complete(&mut ctx, result);
        }
        self.settle(now);
        None
    }

    /// `local_reg.json` from a LAN client. Returns the HTTP status.
    pub fn lan_register(&mut self, method: HttpMethod, body: &Value, now: Instant) -> u16 {
        let status = match method {
            HttpMethod::Post => self.lan.register_post(body, now),
            HttpMethod::Put => self.lan.register_put(body, now),
            _ => STATUS_BAD_REQUEST,
        };
        self.settle(now);
        status
    }

    /// Body of the local `status.json`.
    pub fn lan_status(&mut self, now: Instant) -> Value {
        self.refresh_status(now);
        let req = RevRequest {
            cmd_id: 0,
            method: HttpMethod::Get,
            resource: "status.json".to_string(),
            query: Vec::new(),
            resp_uri: String::new(),
            data: None,
            origin: Origin::Lan(0),
        };
        let mut effects = Vec::new();
        let mut ctx = RevContext {
            app: &mut self.app,
            effects: &mut effects,
            status: &self.status,
            nodes: &self.nodes,
            now,
        };
        match self.rev.handle(&req, &mut ctx) {
            Dispatch::Reply(RevReply { body: Some(body), .. }) => body,
            _ => json!({}),
        }
    }

    /// Registration details for `regtoken.json`.
    pub fn registration(&self) -> Value {
        self.cloud.registration()
    }

    /// Opens a user registration window with the cloud.
    pub fn push_button_reg(&mut self, now: Instant) -> bool {
        let opened = self.cloud.push_button_reg_start();
        self.settle(now);
        opened
    }

    /// Next request for the LAN worker: command replies first, then key
    /// exchanges and command fetches.
    pub fn next_lan_request(&mut self, now: Instant) -> Option<LanRequest> {
        if let Some((id, generation, request)) = self.lan_replies.pop_front() {
            return Some(LanRequest { id, generation, kind: LanRequestKind::Reply, request });
        }
        let step = self.lan.next_step(now)?;
        let kind = match step.kind {
            LanStepKind::KeyExchange => LanRequestKind::KeyExchange,
            LanStepKind::GetCommands => LanRequestKind::GetCommands,
        };
        Some(LanRequest { id: step.id, generation: step.generation, kind, request: step.request })
    }

    pub fn lan_complete(
        &mut self,
        id: u8,
        generation: u64,
        kind: LanRequestKind,
        result: Result<HttpResponse, HttpError>,
        now: Instant,
    ) {
        match kind {
            LanRequestKind::KeyExchange => {
                if let Err(err) = self.lan.complete_key_exchange(id, generation, result, now) {
                    log::debug!("devd: lan #{id} dropped: {err}");
                }
            }
            LanRequestKind::GetCommands => match self.lan.complete_get(id, generation, result, now) {
                Ok(Some(commands)) => {
                    // Availability has to reflect the verified session before echoes are built.
                    self.sync_lan_dests();
                    if let Some(props) = commands.properties {
                        let source = DestMask::lan_source(id);
                        let echoes = deliver_updates(
                            &props,
                            source,
                            self.cloud.dests_avail(),
                            self.lan.config().auto_sync,
                            &mut self.app,
                        );
                        self.queue_all(echoes);
                    }
                    if let Some(props) = commands.node_properties {
                        let source = DestMask::lan_source(id);
                        let echoes = deliver_node_updates(
                            &props,
                            source,
                            self.cloud.dests_avail(),
                            self.lan.config().auto_sync,
                            &self.nodes,
                            &mut self.app,
                        );
                        self.queue_all(echoes);
                    }
                    for cmd in &commands.cmds {
                        self.run_command(cmd, Origin::Lan(id), now);
                    }
                }
                Ok(None) => {}
                Err(err) => log::warn!("devd: lan #{id} commands rejected: {err}"),
            },
            LanRequestKind::Reply => {
                self.lan.post_result(id, generation, &result);
            }
        }
        self.settle(now);
    }

    pub fn notify_recv(&mut self, line: Line, from: SocketAddrV4, buf: &[u8], now: Instant) {
        self.notify.recv(line, from, buf, now);
        self.settle(now);
    }

    pub fn notify_resolved(&mut self, addr: Option<Ipv4Addr>, now: Instant) {
        self.notify.dns_resolved(addr, now);
        self.settle(now);
    }

    pub fn notify_send_failed(&mut self, now: Instant) {
        self.notify.send_failed(now);
        self.settle(now);
    }

    /// Exit status of the OTA command. Zero clears any reported failure.
    pub fn ota_result(&mut self, status: i32, now: Instant) {
        self.cloud.set_ota_status(status);
        self.settle(now);
    }

    fn queue_all(&mut self, cmds: Vec<QueuedCmd>) {
        for (cmd, handler) in cmds {
            self.ops.add(cmd, handler);
        }
    }

    fn refresh_status(&mut self, now: Instant) {
        self.status.mtime = now.saturating_duration_since(self.started).as_millis() as u64;
        self.status.time = unix_time();
    }

    fn run_command(&mut self, cmd: &Value, origin: Origin, now: Instant) {
        let req = match RevRequest::parse(cmd, origin) {
            Ok(req) => req,
            Err(err) => {
                log::warn!("devd: dropping command from {origin:?}: {err}");
                return;
            }
        };
        self.refresh_status(now);
        let mut effects = Vec::new();
        let dispatch = {
            let mut ctx = RevContext {
                app: &mut self.app,
                effects: &mut effects,
                status: &self.status,
                nodes: &self.nodes,
                now,
            };
            self.rev.handle(&req, &mut ctx)
        };
        if let Dispatch::Reply(reply) = dispatch {
            self.send_rev_reply(&req, &reply, now);
        }
        for effect in effects {
            self.apply_effect(effect, now);
        }
    }

    fn send_rev_reply(&mut self, req: &RevRequest, reply: &RevReply, now: Instant) {
        match req.origin {
            Origin::Ads => {
                let request = reply.to_ads_request(self.cloud.link(), req.cmd_id, &req.resp_uri);
                self.cloud.queue_reply(request);
            }
            Origin::Lan(id) => {
                let body = reply.body.clone().unwrap_or_else(|| json!({}));
                match self.lan.reply_request(id, &reply.lan_uri(req.cmd_id, &req.resp_uri), &body, now) {
                    Ok(request) => {
                        let generation = self.lan.session(id).map_or(0, LanSession::generation);
                        self.lan_replies.push_back((id, generation, request));
                    }
                    Err(err) => log::warn!("devd: lan #{id} reply dropped: {err}"),
                }
            }
        }
    }

    fn apply_effect(&mut self, effect: RevEffect, now: Instant) {
        match effect {
            RevEffect::CloudInit => {
                if !self.cloud.cloud_init() {
                    log::debug!("devd: cloud down, re-init skipped");
                }
            }
            RevEffect::Reset { factory } => self.outputs.push(DaemonOutput::Reset { factory }),
            RevEffect::Ota(ota) => self.ota_ready(&ota),
            RevEffect::OtaFetch(url) => {
                self.ops.add(OtaUrlFetch::cmd(), Box::new(OtaUrlFetch::new(url)));
            }
            RevEffect::LanIp(lan) => {
                self.config.lan = lan.clone();
                self.install_lan_config(lan);
            }
            RevEffect::Registered(registered) => {
                log::info!("devd: registration status {registered}");
                self.cloud.set_registered(registered);
            }
        }
    }

    fn install_lan_config(&mut self, lan: LanConfig) {
        let dropped = self.lan.set_config(lan);
        if !dropped.is_empty() {
            log::info!("devd: lan key changed, dropped sessions {dropped:?}");
        }
    }

    fn ota_ready(&mut self, ota: &Value) {
        match OtaImage::from_value(ota) {
            Some(image) => {
                log::info!("devd: OTA {} ready, {} bytes", image.ver, image.size);
                self.outputs.push(DaemonOutput::Ota(image));
            }
            None => log::warn!("devd: ignoring unusable OTA {ota}"),
        }
    }

    fn sync_lan_dests(&mut self) {
        let mask = (self.cloud.dests_avail() & DestMask::ADS) | self.lan.dests();
        self.cloud.dest_avail_set(mask);
    }

    /// Applies cross-subsystem events until everything is quiet, then moves
    /// application and notify traffic to the output queue.
    fn settle(&mut self, now: Instant) {
        loop {
            self.sync_lan_dests();
            let mut progressed = false;

            for event in self.cloud.drain_events() {
                progressed = true;
                self.cloud_event(event, now);
            }
            for output in self.notify.drain() {
                progressed = true;
                match output {
                    NotifyOutput::Event(event) => self.cloud.notify_event(event, now),
                    other => self.outputs.push(DaemonOutput::Notify(other)),
                }
            }
            for event in std::mem::take(&mut self.op_events) {
                progressed = true;
                match event {
                    OpEvent::FileFetched => self.cloud.file_fetched(),
                    OpEvent::OtaReady(ota) => self.ota_ready(&ota),
                    OpEvent::NodeMapped { dsn, address } => match self.nodes.insert(&dsn, &address) {
                        Ok(()) => self.nodes_changed(),
                        Err(err) => log::warn!("devd: node not mapped: {err}"),
                    },
                    OpEvent::NodeUnmapped { dsn } => {
                        if self.nodes.remove_dsn(&dsn).is_some() {
                            self.nodes_changed();
                        }
                    }
                }
            }
            if !progressed {
                break;
            }
        }
        for message in self.app.drain() {
            self.outputs.push(DaemonOutput::App(message));
        }
    }

    fn nodes_changed(&mut self) {
        let mappings = self.nodes.mappings();
        log::info!("devd: {} nodes mapped", mappings.len());
        self.config.gateway.node_mappings = mappings.clone();
        self.outputs.push(DaemonOutput::NodesChanged(mappings));
    }

    fn cloud_event(&mut self, event: CloudEvent, now: Instant) {
        match event {
            CloudEvent::DestsChanged(mask) => {
                if mask.has_ads() {
                    self.refresh_status(now);
                    self.status.last_connect_mtime = self.status.mtime;
                    self.status.last_connect_time = self.status.time;
                }
                self.outputs.push(DaemonOutput::Dests(mask));
            }
            CloudEvent::CancelRequests => self.outputs.push(DaemonOutput::CancelRequests),
            CloudEvent::NotifyServer(name) => {
                let server = self.config.notify.server.clone().unwrap_or(name);
                self.notify.set_server(&server, now);
            }
            CloudEvent::NotifyStart(key) => {
                if let Err(err) = self.notify.start(&self.config.device.dsn, &key, now) {
                    log::warn!("devd: notify not started: {err}");
                }
            }
            CloudEvent::NotifyStop => self.notify.stop(),
            CloudEvent::NotifyRecheck => self.notify.recheck(now),
            CloudEvent::Properties(props) => {
                let echoes = deliver_updates(
                    &props,
                    SOURCE_ADS,
                    self.cloud.dests_avail(),
                    self.lan.config().auto_sync,
                    &mut self.app,
                );
                self.queue_all(echoes);
            }
            CloudEvent::NodeProperties(props) => {
                let echoes = deliver_node_updates(
                    &props,
                    SOURCE_ADS,
                    self.cloud.dests_avail(),
                    self.lan.config().auto_sync,
                    &self.nodes,
                    &mut self.app,
                );
                self.queue_all(echoes);
            }
            CloudEvent::NodeSchedules(scheds) => {
                deliver_node_schedules(&scheds, SOURCE_ADS, &self.nodes, &mut self.app);
            }
        }
    }
}
