//! Serialized operation queue.
//!
//! Commands run one at a time. Each command targets a destination mask; LAN
//! destinations are served first (the daemon delivers the posts returned in
//! [`Exec::Lan`]), then the command's cloud request runs. Every destination
//! bit ends up either succeeded or failed before the command is popped, and
//! the outcome is reported back to the requesting application.

pub mod file;
pub mod ota;
pub mod prop;

use crate::app::{error_object, AppOutbox, ReqId, PROTO_DATA};
use crate::dests::{DestMask, Source};
use crate::error::ErrType;
use crate::gateway::NodeMap;
use crate::http::{is_success, HttpError, HttpRequest, HttpResponse, STATUS_NOT_FOUND, STATUS_UNPROCESSABLE};
use crate::link::CloudLink;
use serde_json::{json, Value};
use std::collections::VecDeque;

/// Bookkeeping shared by every queued command.
#[derive(Debug, Clone, PartialEq)]
pub struct OpCmd {
    pub proto: &'static str,
    pub req_id: ReqId,
    pub source: Source,
    /// Property name reported in error objects.
    pub err_name: Option<String>,
    pub err_type: Option<ErrType>,
    pub op_args: Option<Value>,
    pub dests_target: DestMask,
    pub dests_failed: DestMask,
    pub dests_succeeded: DestMask,
    pub echo: bool,
    pub confirm: bool,
    pub dests_specified: bool,
    /// Daemon-internal command: nothing is reported to the application.
    pub local: bool,
}

impl OpCmd {
    pub fn new(req_id: ReqId, dests: DestMask) -> Self {
        Self {
            proto: PROTO_DATA,
            req_id,
            source: 0,
            err_name: None,
            err_type: None,
            op_args: None,
            dests_target: dests,
            dests_failed: DestMask::NONE,
            dests_succeeded: DestMask::NONE,
            echo: false,
            confirm: false,
            dests_specified: false,
            local: false,
        }
    }

    pub fn local(dests: DestMask) -> Self {
        Self { local: true, ..Self::new(0, dests) }
    }

    /// Concludes the destinations in `mask` that are still targeted.
    pub fn mark_results(&mut self, mask: DestMask, success: bool) {
        let concluded = mask & self.dests_target;
        if success {
            self.dests_succeeded |= concluded;
        } else {
            self.dests_failed |= concluded;
        }
        self.dests_target &= !mask;
    }

    pub fn fail_with(&mut self, mask: DestMask, err: ErrType) {
        self.err_type = Some(err);
        self.mark_results(mask, false);
    }

    /// Query suffix asking the receiver to treat the post as an echo.
    pub fn echo_suffix(&self) -> &'static str {
        if self.echo {
            "?echo=true"
        } else {
            ""
        }
    }
}

/// Side effects of finished commands that the daemon applies to its own state.
#[derive(Debug, Clone, PartialEq)]
pub enum OpEvent {
    /// A file datapoint was marked fetched.
    FileFetched,
    /// The cloud handed out OTA image details.
    OtaReady(Value),
    /// The cloud registered a node under `dsn`.
    NodeMapped { dsn: String, address: String },
    /// A node left the gateway.
    NodeUnmapped { dsn: String },
}

/// Most recently created file datapoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileLocation {
    pub location: String,
    pub file: String,
}

/// What a command may see and touch while it runs.
pub struct OpContext<'a> {
    pub link: &'a CloudLink,
    pub cloud_up: bool,
    pub dests_avail: DestMask,
    pub app: &'a mut AppOutbox,
    pub file: &'a mut Option<FileLocation>,
    pub events: &'a mut Vec<OpEvent>,
    pub nodes: &'a NodeMap,
}

pub enum InitOutcome {
    Send(HttpRequest),
    /// Nothing left to send; remaining destinations count as delivered.
    Done,
    Fail(ErrType),
}

pub enum StepOutcome {
    Done,
    Failed(ErrType),
    /// Run another request under a new handler.
    Next(Box<dyn Command>),
}

/// One JSON body to deliver to a LAN client resource.
#[derive(Debug, Clone, PartialEq)]
pub struct LanPayload {
    pub resource: String,
    pub body: Value,
    /// Targeted clients that receive this body.
    pub dests: DestMask,
    /// The client counts as served whatever the post's outcome.
    pub best_effort: bool,
}

impl LanPayload {
    pub fn new(resource: impl Into<String>, body: Value) -> Self {
        Self { resource: resource.into(), body, dests: DestMask::LAN_APPS, best_effort: false }
    }

    pub fn only(mut self, dests: DestMask) -> Self {
        self.dests = dests;
        self
    }

    pub fn best_effort(mut self) -> Self {
        self.best_effort = true;
        self
    }
}

pub trait Command {
    /// Operation name reported in error objects.
    fn name(&self) -> &'static str;

    /// Runs once before any delivery. May conclude destinations early; an
    /// error fails every remaining destination.
    fn prepare(&mut self, _cmd: &mut OpCmd, _ctx: &mut OpContext<'_>) -> Result<(), ErrType> {
        Ok(())
    }

    /// Bodies to post to each targeted LAN client, or `None` when the command
    /// has no LAN delivery.
    fn lan_payloads(&self, _cmd: &OpCmd) -> Option<Vec<LanPayload>> {
        None
    }

    fn init(&mut self, cmd: &mut OpCmd, ctx: &mut OpContext<'_>) -> InitOutcome;

    fn on_success(
        &mut self,
        _cmd: &mut OpCmd,
        _ctx: &mut OpContext<'_>,
        _resp: &HttpResponse,
    ) -> StepOutcome {
        StepOutcome::Done
    }

    /// Called exactly once after the command has been reported.
    fn on_finish(&mut self, _cmd: &OpCmd, _ctx: &mut OpContext<'_>) {}
}

/// A post addressed to one LAN client.
#[derive(Debug, Clone, PartialEq)]
pub struct LanPost {
    pub lan_id: u8,
    pub resource: String,
    pub body: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LanOutcome {
    Delivered,
    /// The client does not know the resource.
    NotFound,
    Failed,
}

pub enum Exec {
    /// Queue is empty.
    Idle,
    /// The head command is waiting on the cloud or on an outstanding request.
    Wait,
    Lan(Vec<LanPost>),
    Send(HttpRequest),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Fresh,
    Prepared,
    LanPending,
    Ready,
    Sent,
}

struct Entry {
    cmd: OpCmd,
    handler: Box<dyn Command>,
    phase: Phase,
    lan_best_effort: DestMask,
}

#[derive(Default)]
pub struct OpsQueue {
    entries: VecDeque<Entry>,
}

impl OpsQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a command. Returns `true` when the queue was empty and a step
    /// should be scheduled.
    pub fn add(&mut self, cmd: OpCmd, handler: Box<dyn Command>) -> bool {
        let was_empty = self.entries.is_empty();
        log::debug!("ops: add {} dests {}", handler.name(), cmd.dests_target);
        self.entries.push_back(Entry { cmd, handler, phase: Phase::Fresh, lan_best_effort: DestMask::NONE });
        was_empty
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn head_name(&self) -> Option<&'static str> {
        self.entries.front().map(|entry| entry.handler.name())
    }

    /// Runs queued commands until one needs I/O or the queue drains.
    pub fn next_request(&mut self, ctx: &mut OpContext<'_>) -> Exec {
        loop {
            let Some(entry) = self.entries.front_mut() else {
                return Exec::Idle;
            };
            match entry.phase {
                Phase::LanPending | Phase::Sent => return Exec::Wait,
                Phase::Fresh | Phase::Prepared | Phase::Ready => {}
            }
            if entry.phase == Phase::Fresh {
                entry.phase = Phase::Prepared;
                if let Err(err) = entry.handler.prepare(&mut entry.cmd, ctx) {
                    log::warn!("ops: {} rejected: {err}", entry.handler.name());
                    entry.cmd.err_type = Some(err);
                    self.pop(ctx);
                    continue;
                }
            }
            let cmd = &mut entry.cmd;
            if cmd.dests_target.has_ads() {
                if !ctx.dests_avail.has_ads() {
                    cmd.err_type = Some(ErrType::ConnErr);
                } else if !ctx.cloud_up {
                    return Exec::Wait;
                }
            }
            let unavailable = !ctx.dests_avail & cmd.dests_target;
            cmd.mark_results(unavailable, false);
            if cmd.dests_target.is_empty() {
                self.pop(ctx);
                continue;
            }

            if entry.phase == Phase::Prepared {
                entry.phase = Phase::Ready;
                let lan = entry.cmd.dests_target & DestMask::LAN_APPS;
                if !lan.is_empty() {
                    if let Some(payloads) = entry.handler.lan_payloads(&entry.cmd) {
                        let mut posts = Vec::new();
                        let mut served = DestMask::NONE;
                        let mut best_effort = DestMask::NONE;
                        for lan_id in lan.lan_ids() {
                            let client = DestMask::lan(lan_id);
                            for payload in payloads.iter().filter(|payload| payload.dests.contains(client)) {
                                served |= client;
                                if payload.best_effort {
                                    best_effort |= client;
                                }
                                posts.push(LanPost {
                                    lan_id,
                                    resource: payload.resource.clone(),
                                    body: payload.body.clone(),
                                });
                            }
                        }
                        // clients with nothing to receive are done
                        entry.cmd.mark_results(lan & !served, true);
                        if !posts.is_empty() {
                            entry.lan_best_effort = best_effort;
                            entry.phase = Phase::LanPending;
                            return Exec::Lan(posts);
                        }
                    }
                }
            }

            let entry = match self.entries.front_mut() {
                Some(entry) => entry,
                None => return Exec::Idle,
            };
            if entry.cmd.dests_target.is_empty() {
                self.pop(ctx);
                continue;
            }
            match entry.handler.init(&mut entry.cmd, ctx) {
                InitOutcome::Send(request) => {
                    log::debug!("ops: {} {} {}", entry.handler.name(), request.method, request.url);
                    entry.phase = Phase::Sent;
                    return Exec::Send(request);
                }
                InitOutcome::Done => {
                    let remaining = entry.cmd.dests_target;
                    entry.cmd.mark_results(remaining, true);
                    self.pop(ctx);
                }
                InitOutcome::Fail(err) => {
                    log::warn!("ops: {} init failed: {err}", entry.handler.name());
                    entry.cmd.err_type = Some(err);
                    self.pop(ctx);
                }
            }
        }
    }

    /// Records the LAN delivery results for the head command. A client fails
    /// when any of its posts failed.
    pub fn complete_lan(&mut self, results: &[(u8, LanOutcome)]) {
        let Some(entry) = self.entries.front_mut() else {
            return;
        };
        if entry.phase != Phase::LanPending {
            log::warn!("ops: unexpected lan completion");
            return;
        }
        let lan = entry.cmd.dests_target & DestMask::LAN_APPS;
        for lan_id in lan.lan_ids() {
            if entry.lan_best_effort.contains(DestMask::lan(lan_id)) {
                entry.cmd.mark_results(DestMask::lan(lan_id), true);
                continue;
            }
            let mut success = true;
            for (_, outcome) in results.iter().filter(|(id, _)| *id == lan_id) {
                match outcome {
                    LanOutcome::Delivered => {}
                    LanOutcome::NotFound => {
                        entry.cmd.err_type = Some(ErrType::UnknownProp);
                        success = false;
                    }
                    LanOutcome::Failed => {
                        entry.cmd.err_type = Some(ErrType::ConnErr);
                        success = false;
                    }
                }
            }
            entry.cmd.mark_results(DestMask::lan(lan_id), success);
        }
        entry.phase = Phase::Ready;
    }

    /// Applies the result of the head command's request.
    pub fn complete(&mut self, ctx: &mut OpContext<'_>, result: Result<HttpResponse, HttpError>) {
        let Some(entry) = self.entries.front_mut() else {
            return;
        };
        if entry.phase != Phase::Sent {
            log::warn!("ops: unexpected completion");
            return;
        }
        let success = match result {
            Err(err) => {
                log::warn!("ops: {} request failed: {err}", entry.handler.name());
                entry.cmd.err_type = Some(ErrType::ConnErr);
                false
            }
            Ok(resp) if !is_success(resp.status) => {
                entry.cmd.err_type = Some(match resp.status {
                    STATUS_NOT_FOUND => ErrType::UnknownProp,
                    STATUS_UNPROCESSABLE => ErrType::BadValue,
                    _ => ErrType::ConnErr,
                });
                false
            }
            Ok(resp) => match entry.handler.on_success(&mut entry.cmd, ctx, &resp) {
                StepOutcome::Done => true,
                StepOutcome::Failed(err) => {
                    log::warn!("ops: {} failed: {err}", entry.handler.name());
                    entry.cmd.err_type = Some(ErrType::Unknown);
                    false
                }
                StepOutcome::Next(next) => {
                    log::debug!("ops: {} continues as {}", entry.handler.name(), next.name());
                    let mut previous = std::mem::replace(&mut entry.handler, next);
                    previous.on_finish(&entry.cmd, ctx);
                    entry.phase = Phase::Ready;
                    return;
                }
            },
        };
        entry.cmd.mark_results(DestMask::ADS, success);
        self.pop(ctx);
    }

    fn pop(&mut self, ctx: &mut OpContext<'_>) {
        let Some(mut entry) = self.entries.pop_front() else {
            return;
        };
        let cmd = &mut entry.cmd;
        let remaining = cmd.dests_target;
        cmd.mark_results(remaining, false);
        if !cmd.local {
            if !cmd.dests_failed.is_empty() {
                let err = *cmd.err_type.get_or_insert(ErrType::Unknown);
                let args = json!([error_object(
                    cmd.err_name.as_deref(),
                    cmd.dests_failed,
                    Some(err),
                    Some(entry.handler.name()),
                    cmd.op_args.as_ref(),
                )]);
                if cmd.echo {
                    ctx.app.echo_failure(cmd.proto, args);
                } else {
                    ctx.app.nak_with_args(cmd.proto, args, cmd.req_id);
                }
            }
            if cmd.confirm {
                if cmd.dests_failed.is_empty()
                    || (!cmd.dests_specified && !cmd.dests_failed.has_ads())
                {
                    ctx.app.confirm_true(cmd.proto, cmd.req_id);
                } else {
                    ctx.app.confirm_false(cmd.proto, cmd.req_id, cmd.dests_failed, cmd.err_type);
                }
            }
        }
        log::debug!(
            "ops: done {} ok {} failed {}",
            entry.handler.name(),
            entry.cmd.dests_succeeded,
            entry.cmd.dests_failed
        );
        entry.handler.on_finish(&entry.cmd, ctx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpMethod;
    use std::cell::Cell;
    use std::rc::Rc;

    struct Harness {
        link: CloudLink,
        app: AppOutbox,
        file: Option<FileLocation>,
        events: Vec<OpEvent>,
        nodes: NodeMap,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                link: CloudLink::default(),
                app: AppOutbox::new(),
                file: None,
                events: Vec::new(),
                nodes: NodeMap::default(),
            }
        }

        fn ctx(&mut self, cloud_up: bool, dests_avail: DestMask) -> OpContext<'_> {
            OpContext {
                link: &self.link,
                cloud_up,
                dests_avail,
                app: &mut self.app,
                file: &mut self.file,
                events: &mut self.events,
                nodes: &self.nodes,
            }
        }
    }

    struct Scripted {
        outcome: Option<InitOutcome>,
        lan: Option<Vec<LanPayload>>,
        reject: Option<ErrType>,
        finished: Rc<Cell<u32>>,
        inits: Rc<Cell<u32>>,
    }

    impl Scripted {
        fn new(outcome: InitOutcome) -> (Self, Rc<Cell<u32>>, Rc<Cell<u32>>) {
            let finished = Rc::new(Cell::new(0));
            let inits = Rc::new(Cell::new(0));
            let scripted = Self {
                outcome: Some(outcome),
                lan: None,
                reject: None,
                finished: finished.clone(),
                inits: inits.clone(),
            };
            (scripted, finished, inits)
        }
    }

    impl Command for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn prepare(&mut self, _cmd: &mut OpCmd, _ctx: &mut OpContext<'_>) -> Result<(), ErrType> {
            self.reject.map_or(Ok(()), Err)
        }

        fn lan_payloads(&self, _cmd: &OpCmd) -> Option<Vec<LanPayload>> {
            self.lan.clone()
        }

        fn init(&mut self, _cmd: &mut OpCmd, _ctx: &mut OpContext<'_>) -> InitOutcome {
            self.inits.set(self.inits.get() + 1);
            self.outcome.take().unwrap_or(InitOutcome::Fail(ErrType::Unknown))
        }

        fn on_finish(&mut self, _cmd: &OpCmd, _ctx: &mut OpContext<'_>) {
            self.finished.set(self.finished.get() + 1);
        }
    }

    fn get(url: &str) -> HttpRequest {
        HttpRequest::new(HttpMethod::Get, url)
    }

    #[test]
    fn nothing_to_do_pops_without_network() {
        let mut harness = Harness::new();
        let mut queue = OpsQueue::new();
        let (scripted, finished, _) = Scripted::new(InitOutcome::Done);
        let mut cmd = OpCmd::new(9, DestMask::ADS);
        cmd.confirm = true;
        assert!(queue.add(cmd, Box::new(scripted)));

        let mut ctx = harness.ctx(true, DestMask::ADS);
        assert!(matches!(queue.next_request(&mut ctx), Exec::Idle));
        assert_eq!(finished.get(), 1);
        assert!(queue.is_empty());
        let sent = harness.app.drain();
        assert_eq!(sent, vec![json!({"cmd": {"proto": "data", "id": 9, "op": "confirm_true"}})]);
    }

    #[test]
    fn cloud_command_waits_for_cloud_up() {
        let mut harness = Harness::new();
        let mut queue = OpsQueue::new();
        let (scripted, finished, inits) = Scripted::new(InitOutcome::Send(get("https://h/x")));
        queue.add(OpCmd::new(1, DestMask::ADS), Box::new(scripted));

        assert!(matches!(queue.next_request(&mut harness.ctx(false, DestMask::ADS)), Exec::Wait));
        assert_eq!(inits.get(), 0);
        assert!(matches!(queue.next_request(&mut harness.ctx(true, DestMask::ADS)), Exec::Send(_)));
        assert!(matches!(queue.next_request(&mut harness.ctx(true, DestMask::ADS)), Exec::Wait));
        queue.complete(&mut harness.ctx(true, DestMask::ADS), Ok(HttpResponse::new(200)));
        assert_eq!(finished.get(), 1);
        assert!(harness.app.is_empty());
    }

    #[test]
    fn unavailable_cloud_fails_with_conn_err() {
        let mut harness = Harness::new();
        let mut queue = OpsQueue::new();
        let (scripted, finished, inits) = Scripted::new(InitOutcome::Done);
        let mut cmd = OpCmd::new(3, DestMask::ADS);
        cmd.err_name = Some("Blue_LED".to_string());
        queue.add(cmd, Box::new(scripted));

        assert!(matches!(queue.next_request(&mut harness.ctx(false, DestMask::NONE)), Exec::Idle));
        assert_eq!(inits.get(), 0);
        assert_eq!(finished.get(), 1);
        let sent = harness.app.drain();
        assert_eq!(
            sent[0],
            json!({"cmd": {"proto": "data", "id": 3, "op": "nak",
                "args": [{"err": "conn_err", "name": "Blue_LED", "dests": 1, "op": "scripted"}]}})
        );
    }

    #[test]
    fn http_status_maps_to_error_kind() {
        for (status, err) in [(404, "unknown_prop"), (422, "bad_value"), (500, "conn_err")] {
            let mut harness = Harness::new();
            let mut queue = OpsQueue::new();
            let (scripted, _, _) = Scripted::new(InitOutcome::Send(get("https://h/x")));
            let mut cmd = OpCmd::new(5, DestMask::ADS);
            cmd.echo = true;
            queue.add(cmd, Box::new(scripted));
            assert!(matches!(queue.next_request(&mut harness.ctx(true, DestMask::ADS)), Exec::Send(_)));
            queue.complete(&mut harness.ctx(true, DestMask::ADS), Ok(HttpResponse::new(status)));
            let sent = harness.app.drain();
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0]["cmd"]["op"], json!("echo_failure"));
            assert_eq!(sent[0]["cmd"]["id"], json!(1));
            assert_eq!(sent[0]["cmd"]["args"][0]["err"], json!(err));
        }
    }

    #[test]
    fn lan_results_then_cloud_account_for_every_bit() {
        let mut harness = Harness::new();
        let mut queue = OpsQueue::new();
        let (mut scripted, finished, _) = Scripted::new(InitOutcome::Send(get("https://h/x")));
        scripted.lan = Some(vec![LanPayload::new("property/datapoint.json", json!({"v": 1}))]);
        let target = DestMask::ADS | DestMask::lan(1) | DestMask::lan(2) | DestMask::lan(3);
        let avail = DestMask::ADS | DestMask::lan(1) | DestMask::lan(2);
        let mut cmd = OpCmd::new(11, target);
        cmd.confirm = true;
        cmd.dests_specified = true;
        queue.add(cmd, Box::new(scripted));

        let posts = match queue.next_request(&mut harness.ctx(true, avail)) {
            Exec::Lan(posts) => posts,
            _ => panic!("expected lan posts"),
        };
        assert_eq!(posts.iter().map(|post| post.lan_id).collect::<Vec<_>>(), vec![1, 2]);
        assert!(matches!(queue.next_request(&mut harness.ctx(true, avail)), Exec::Wait));
        queue.complete_lan(&[(1, LanOutcome::Delivered), (2, LanOutcome::Failed)]);
        assert!(matches!(queue.next_request(&mut harness.ctx(true, avail)), Exec::Send(_)));
        queue.complete(&mut harness.ctx(true, avail), Ok(HttpResponse::new(201)));

        assert_eq!(finished.get(), 1);
        let sent = harness.app.drain();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0]["cmd"]["op"], json!("nak"));
        assert_eq!(sent[0]["cmd"]["args"][0]["dests"], json!((DestMask::lan(2) | DestMask::lan(3)).bits()));
        assert_eq!(
            sent[1],
            json!({"cmd": {"proto": "data", "id": 11, "op": "confirm_false",
                "args": [{"err": "conn_err", "dests": (DestMask::lan(2) | DestMask::lan(3)).bits()}]}})
        );
    }

    #[test]
    fn lan_failure_without_explicit_dests_still_confirms() {
        let mut harness = Harness::new();
        let mut queue = OpsQueue::new();
        let (mut scripted, _, _) = Scripted::new(InitOutcome::Done);
        scripted.lan = Some(vec![LanPayload::new("r", json!({}))]);
        let target = DestMask::ADS | DestMask::lan(1);
        let mut cmd = OpCmd::new(4, target);
        cmd.confirm = true;
        queue.add(cmd, Box::new(scripted));

        assert!(matches!(queue.next_request(&mut harness.ctx(true, target)), Exec::Lan(_)));
        queue.complete_lan(&[(1, LanOutcome::NotFound)]);
        assert!(matches!(queue.next_request(&mut harness.ctx(true, target)), Exec::Idle));
        let sent = harness.app.drain();
        assert_eq!(sent[0]["cmd"]["args"][0]["err"], json!("unknown_prop"));
        assert_eq!(sent[1]["cmd"]["op"], json!("confirm_true"));
    }

    struct Chain {
        step: u8,
        finished: Rc<Cell<u32>>,
    }

    impl Command for Chain {
        fn name(&self) -> &'static str {
            "chain"
        }

        fn init(&mut self, _cmd: &mut OpCmd, _ctx: &mut OpContext<'_>) -> InitOutcome {
            InitOutcome::Send(get(&format!("https://h/step{}", self.step)))
        }

        fn on_success(&mut self, _cmd: &mut OpCmd, _ctx: &mut OpContext<'_>, _resp: &HttpResponse) -> StepOutcome {
            if self.step == 0 {
                StepOutcome::Next(Box::new(Chain { step: 1, finished: self.finished.clone() }))
            } else {
                StepOutcome::Done
            }
        }

        fn on_finish(&mut self, _cmd: &OpCmd, _ctx: &mut OpContext<'_>) {
            self.finished.set(self.finished.get() + 1);
        }
    }

    #[test]
    fn next_step_replaces_handler_and_sends_again() {
        let mut harness = Harness::new();
        let mut queue = OpsQueue::new();
        let finished = Rc::new(Cell::new(0));
        queue.add(OpCmd::local(DestMask::ADS), Box::new(Chain { step: 0, finished: finished.clone() }));

        let mut urls = Vec::new();
        for _ in 0..2 {
            match queue.next_request(&mut harness.ctx(true, DestMask::ADS)) {
                Exec::Send(request) => urls.push(request.url),
                _ => panic!("expected request"),
            }
            queue.complete(&mut harness.ctx(true, DestMask::ADS), Ok(HttpResponse::new(200)));
        }
        assert_eq!(urls, vec!["https://h/step0", "https://h/step1"]);
        assert_eq!(finished.get(), 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn add_reports_only_first_command() {
        let mut queue = OpsQueue::new();
        let (a, _, _) = Scripted::new(InitOutcome::Done);
        let (b, _, _) = Scripted::new(InitOutcome::Done);
        assert!(queue.add(OpCmd::local(DestMask::ADS), Box::new(a)));
        assert!(!queue.add(OpCmd::local(DestMask::ADS), Box::new(b)));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.head_name(), Some("scripted"));
    }

    #[test]
    fn rejected_command_is_naked_without_delivery() {
        let mut harness = Harness::new();
        let mut queue = OpsQueue::new();
        let (mut scripted, finished, inits) = Scripted::new(InitOutcome::Send(get("https://h/x")));
        scripted.reject = Some(ErrType::InvalidArgs);
        scripted.lan = Some(vec![LanPayload::new("r", json!({}))]);
        let target = DestMask::ADS | DestMask::lan(1);
        let mut cmd = OpCmd::new(8, target);
        cmd.proto = "gateway";
        queue.add(cmd, Box::new(scripted));

        assert!(matches!(queue.next_request(&mut harness.ctx(true, target)), Exec::Idle));
        assert_eq!((inits.get(), finished.get()), (0, 1));
        let sent = harness.app.drain();
        assert_eq!(
            sent,
            vec![json!({"cmd": {"proto": "gateway", "id": 8, "op": "nak",
                "args": [{"err": "invalid_args", "dests": target.bits(), "op": "scripted"}]}})]
        );
    }

    #[test]
    fn payloads_reach_only_their_clients() {
        let mut harness = Harness::new();
        let mut queue = OpsQueue::new();
        let (mut scripted, _, _) = Scripted::new(InitOutcome::Done);
        scripted.lan = Some(vec![
            LanPayload::new("ack.json", json!({"id": "a"})).only(DestMask::lan(1)).best_effort(),
            LanPayload::new("echo.json", json!({"v": 1})).only(DestMask::lan(2)),
        ]);
        let target = DestMask::lan(1) | DestMask::lan(2) | DestMask::lan(3);
        let mut cmd = OpCmd::new(2, target);
        cmd.confirm = true;
        queue.add(cmd, Box::new(scripted));

        let Exec::Lan(posts) = queue.next_request(&mut harness.ctx(true, target)) else {
            panic!("expected lan posts");
        };
        let routed: Vec<(u8, &str)> = posts.iter().map(|post| (post.lan_id, post.resource.as_str())).collect();
        assert_eq!(routed, vec![(1, "ack.json"), (2, "echo.json")]);
        queue.complete_lan(&[(1, LanOutcome::Failed), (2, LanOutcome::Delivered)]);
        assert!(matches!(queue.next_request(&mut harness.ctx(true, target)), Exec::Idle));
        assert_eq!(
            harness.app.drain(),
            vec![json!({"cmd": {"proto": "data", "id": 2, "op": "confirm_true"}})]
        );
    }
}
