use super::crypto::{Roots, SessionKeys};
use super::{convert_pubkey_pem, KeySealer, LanError, LanRegistration, EXCHANGE_VERSION, PROTO, RANDOM_LEN, REFRESH_LIMIT, SEALED_SECRET_LEN};
use crate::config::{LanConfig, DEFAULT_LAN_KEEP_ALIVE};
use crate::dests::{DestMask, LAN_SLOTS};
use crate::http::{
    HttpError, HttpMethod, HttpRequest, HttpResponse, STATUS_ACCEPTED, STATUS_NOT_FOUND, STATUS_OK,
    STATUS_PARTIAL_CONTENT, STATUS_PRECONDITION_FAILED, STATUS_UNAVAILABLE,
};
use crate::ops::LanOutcome;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand_core::{OsRng, RngCore};
use serde_json::{json, Value};
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};
use zeroize::Zeroizing;

const LAN_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Keeps the exchanged time value under 10^15.
const TIME_MASK: u64 = 0x01FF_FFFF_FFFF_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LanStepKind {
    KeyExchange,
    GetCommands,
}

/// A request the table wants sent to one client.
#[derive(Debug, Clone, PartialEq)]
pub struct LanStep {
    pub id: u8,
    /// Registration the step belongs to. Completions carrying another
    /// generation are for a session that has since left the slot.
    pub generation: u64,
    pub kind: LanStepKind,
    pub request: HttpRequest,
}

/// Verified contents of a commands GET.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LanCommands {
    /// `properties` array, absent for sealed-key sessions.
    pub properties: Option<Value>,
    /// `node_properties` array, absent for sealed-key sessions.
    pub node_properties: Option<Value>,
    /// Each element's `cmd` object.
    pub cmds: Vec<Value>,
}

/// One registered LAN client.
#[derive(Debug)]
pub struct LanSession {
    pub id: u8,
    pub addr: Ipv4Addr,
    pub port: u16,
    pub uri: String,
    generation: u64,
    pending: bool,
    refresh_count: u32,
    send_seq_no: u64,
    busy: bool,
    verified: bool,
    expires_at: Instant,
    exchange: Option<(String, u64)>,
    keys: Option<SessionKeys>,
    public_key: Option<String>,
    sealed_secret: Option<Zeroizing<Vec<u8>>>,
}

impl LanSession {
    fn matches(&self, reg: &LanRegistration) -> bool {
        self.addr == reg.addr && self.port == reg.port && self.uri == reg.uri
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed_secret.is_some()
    }

    pub fn has_keys(&self) -> bool {
        self.keys.is_some()
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    pub fn refresh_count(&self) -> u32 {
        self.refresh_count
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// `http://ip:port[/base]/resource`.
    fn url(&self, base: &str, resource: &str) -> String {
        let mut url = format!("http://{}:{}", self.addr, self.port);
        for part in [base, resource] {
            if part.is_empty() {
                continue;
            }
            if !part.starts_with('/') {
                url.push('/');
            }
            url.push_str(part);
        }
        url
    }
}

/// Fixed table of LAN client registrations.
pub struct LanTable {
    config: LanConfig,
    slots: Vec<Option<LanSession>>,
    sealer: Option<Box<dyn KeySealer>>,
    epoch: Instant,
    next_generation: u64,
}

impl LanTable {
    pub fn new(config: LanConfig) -> Self {
        Self {
            config,
            slots: (0..LAN_SLOTS).map(|_| None).collect(),
            sealer: None,
            epoch: Instant::now(),
            next_generation: 0,
        }
    }

    pub fn with_sealer(mut self, sealer: Box<dyn KeySealer>) -> Self {
        self.sealer = Some(sealer);
        self
    }

    pub fn config(&self) -> &LanConfig {
        &self.config
    }

    /// Installs new LAN settings. Sessions keyed with an old key are dropped;
    /// returns their ids.
    pub fn set_config(&mut self, config: LanConfig) -> Vec<u8> {
        let rekey = config.key != self.config.key || config.key_id != self.config.key_id || !config.enable;
        self.config = config;
        if !rekey {
            return Vec::new();
        }
        let ids: Vec<u8> = self.sessions().map(|session| session.id).collect();
        for id in &ids {
            self.remove(*id);
        }
        ids
    }

    pub fn sessions(&self) -> impl Iterator<Item = &LanSession> {
        self.slots.iter().flatten()
    }

    pub fn session(&self, id: u8) -> Option<&LanSession> {
        self.slot(id).and_then(Option::as_ref)
    }

    fn slot(&self, id: u8) -> Option<&Option<LanSession>> {
        usize::from(id).checked_sub(1).and_then(|index| self.slots.get(index))
    }

    fn session_mut(&mut self, id: u8) -> Option<&mut LanSession> {
        usize::from(id)
            .checked_sub(1)
            .and_then(|index| self.slots.get_mut(index))
            .and_then(Option::as_mut)
    }

    /// Whether slot `id` still holds the registration `generation` was issued for.
    pub fn is_current(&self, id: u8, generation: u64) -> bool {
        self.session(id).is_some_and(|session| session.generation == generation)
    }

    /// Clients that may receive property updates.
    pub fn dests(&self) -> DestMask {
        self.sessions()
            .filter(|session| session.verified && !session.is_sealed())
            .fold(DestMask::NONE, |mask, session| mask | DestMask::lan(session.id))
    }

    fn keep_alive(&self) -> Duration {
        match self.config.keep_alive {
            0 => Duration::from_secs(u64::from(DEFAULT_LAN_KEEP_ALIVE)),
            secs => Duration::from_secs(u64::from(secs)),
        }
    }

    /// Registration precondition. Errors carry the HTTP status to return.
    pub fn precondition(&self) -> Result<(), u16> {
        if !self.config.enable {
            log::debug!("lan: LAN mode disabled");
            return Err(STATUS_NOT_FOUND);
        }
        if self.config.key.is_empty() {
            log::debug!("lan: no LAN key");
            return Err(STATUS_PRECONDITION_FAILED);
        }
        Ok(())
    }

    /// Slot id for a registration: the matching entry, else the first free one.
    pub fn lookup(&self, reg: &LanRegistration) -> Option<u8> {
        let mut free = None;
        for (index, slot) in self.slots.iter().enumerate() {
            let id = (index + 1) as u8;
            match slot {
                Some(session) if session.matches(reg) => return Some(id),
                None if free.is_none() => free = Some(id),
                _ => {}
            }
        }
        free
    }

    /// New registration. An existing session for the same client is torn down
    /// and replaced. Returns the HTTP status.
    pub fn register_post(&mut self, body: &Value, now: Instant) -> u16 {
        if let Err(status) = self.precondition() {
            return status;
        }
        let reg = match LanRegistration::parse(body) {
            Ok(reg) => reg,
            Err(status) => return status,
        };
        let Some(id) = self.lookup(&reg) else {
            return STATUS_UNAVAILABLE;
        };
        if self.session(id).is_some() {
            self.remove(id);
        }
        self.add(id, reg, true, now);
        STATUS_ACCEPTED
    }

    /// Registration refresh. Marks a commands GET pending when the client says
    /// it has something or after too many silent refreshes.
    pub fn register_put(&mut self, body: &Value, now: Instant) -> u16 {
        if let Err(status) = self.precondition() {
            return status;
        }
        let reg = match LanRegistration::parse(body) {
            Ok(reg) => reg,
            Err(status) => return status,
        };
        let Some(id) = self.lookup(&reg) else {
            return STATUS_UNAVAILABLE;
        };
        let keep_alive = self.keep_alive();
        let Some(session) = self.session_mut(id) else {
            let notify = reg.notify;
            self.add(id, reg, notify, now);
            return STATUS_ACCEPTED;
        };
        session.refresh_count += 1;
        if session.refresh_count >= REFRESH_LIMIT || reg.notify {
            session.pending = true;
            session.refresh_count = 0;
        }
        session.expires_at = now + keep_alive;
        STATUS_ACCEPTED
    }

    fn add(&mut self, id: u8, reg: LanRegistration, notify: bool, now: Instant) {
        let sealed_secret = match (&reg.public_key, &self.sealer) {
            (Some(_), Some(_)) => {
                let mut secret = Zeroizing::new(vec![0u8; SEALED_SECRET_LEN]);
                OsRng.fill_bytes(&mut secret);
                Some(secret)
            }
            (Some(_), None) => {
                log::debug!("lan: ignoring client public key, no sealer");
                None
            }
            _ => None,
        };
        self.next_generation += 1;
        log::debug!("lan: add #{id} {}:{} {}", reg.addr, reg.port, reg.uri);
        let session = LanSession {
            id,
            generation: self.next_generation,
            addr: reg.addr,
            port: reg.port,
            uri: reg.uri,
            pending: notify,
            refresh_count: 0,
            send_seq_no: 0,
            busy: false,
            verified: false,
            expires_at: now + self.keep_alive(),
            exchange: None,
            keys: None,
            public_key: sealed_secret.as_ref().and(reg.public_key.as_deref().map(convert_pubkey_pem)),
            sealed_secret,
        };
        if let Some(slot) = usize::from(id).checked_sub(1).and_then(|index| self.slots.get_mut(index)) {
            *slot = Some(session);
        }
    }

    /// Clears a slot. Returns whether it held a session.
    pub fn remove(&mut self, id: u8) -> bool {
        let removed = usize::from(id)
            .checked_sub(1)
            .and_then(|index| self.slots.get_mut(index))
            .and_then(Option::take);
        if removed.is_some() {
            log::debug!("lan: removing #{id}");
        }
        removed.is_some()
    }

    /// Drops sessions whose keep-alive ran out.
    pub fn expire(&mut self, now: Instant) -> Vec<u8> {
        let expired: Vec<u8> =
            self.sessions().filter(|session| session.expires_at <= now).map(|session| session.id).collect();
        for id in &expired {
            log::debug!("lan: expire #{id}");
            self.remove(*id);
        }
        expired
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.sessions().map(|session| session.expires_at).min()
    }

    /// Next request to make on any idle session: key exchange first, then a
    /// pending commands GET.
    pub fn next_step(&mut self, now: Instant) -> Option<LanStep> {
        let time_1 = (now.saturating_duration_since(self.epoch).as_millis() as u64) & TIME_MASK;
        let key_id = self.config.key_id;

        let index = self
            .slots
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|s| !s.busy && (s.keys.is_none() || s.pending)))?;
        let sealed = {
            let session = self.slots[index].as_ref()?;
            match (&session.public_key, &session.sealed_secret, &self.sealer, session.keys.is_none()) {
                (Some(pem), Some(secret), Some(sealer), true) => Some(sealer.seal(pem, secret)),
                _ => None,
            }
        };
        let session = self.slots[index].as_mut()?;
        let id = session.id;
        let generation = session.generation;
        session.busy = true;

        if session.keys.is_some() {
            session.pending = false;
            let request = HttpRequest::new(HttpMethod::Get, session.url(&session.uri, "commands.json"))
                .timeout(LAN_REQUEST_TIMEOUT)
                .external();
            return Some(LanStep { id, generation, kind: LanStepKind::GetCommands, request });
        }

        let mut nonce = [0u8; RANDOM_LEN];
        OsRng.fill_bytes(&mut nonce);
        let random_1 = BASE64.encode(nonce);
        let mut exchange = json!({
            "ver": EXCHANGE_VERSION,
            "random_1": random_1,
            "time_1": time_1,
            "proto": PROTO,
        });
        match sealed {
            Some(Ok(sealed)) => exchange["sec"] = json!(BASE64.encode(sealed)),
            Some(Err(err)) => {
                log::warn!("lan: #{id} key seal failed: {err}");
                self.remove(id);
                return None;
            }
            None => exchange["key_id"] = json!(key_id),
        }
        session.exchange = Some((random_1, time_1));
        let request = HttpRequest::new(HttpMethod::Post, session.url(&session.uri, "key_exchange.json"))
            .json(json!({"key_exchange": exchange}))
            .timeout(LAN_REQUEST_TIMEOUT)
            .external();
        Some(LanStep { id, generation, kind: LanStepKind::KeyExchange, request })
    }

    /// Derives session keys from the client's `random_2`/`time_2` answer.
    /// Any failure removes the session. Answers for a registration that has
    /// left the slot are ignored.
    pub fn complete_key_exchange(
        &mut self,
        id: u8,
        generation: u64,
        result: Result<HttpResponse, HttpError>,
        now: Instant,
    ) -> Result<(), LanError> {
        if !self.is_current(id, generation) {
            log::debug!("lan: #{id} stale key exchange answer");
            return Err(LanError::NoSession(id));
        }
        let outcome = self.apply_key_exchange(id, result, now);
        if let Err(err) = &outcome {
            log::warn!("lan: #{id} key exchange failed: {err}");
            self.remove(id);
        }
        outcome
    }

    fn apply_key_exchange(
        &mut self,
        id: u8,
        result: Result<HttpResponse, HttpError>,
        now: Instant,
    ) -> Result<(), LanError> {
        let keep_alive = self.keep_alive();
        let lan_key = self.config.key.clone();
        let session = self.session_mut(id).ok_or(LanError::NoSession(id))?;
        session.busy = false;
        let resp = result.map_err(|_| LanError::Decode("key exchange response"))?;
        if !resp.is_success() {
            return Err(LanError::Decode("key exchange status"));
        }
        let body = resp.json().ok_or(LanError::Decode("key exchange response"))?;
        let random_2 = body.get("random_2").and_then(Value::as_str).ok_or(LanError::Decode("random_2"))?;
        let time_2 = body.get("time_2").and_then(Value::as_i64).ok_or(LanError::Decode("time_2"))?;
        let (random_1, time_1) = session.exchange.take().ok_or(LanError::KeyMismatch)?;

        let roots = Roots::new(&random_1, time_1, random_2, time_2);
        let keys = match &session.sealed_secret {
            Some(secret) => SessionKeys::for_module(secret, &roots),
            None => SessionKeys::for_module(lan_key.as_bytes(), &roots),
        };
        session.keys = Some(keys);
        session.public_key = None;
        session.expires_at = now + keep_alive;
        log::debug!("lan: #{id} keys established");
        Ok(())
    }

    /// Handles a commands GET response. Returns the verified commands, if any.
    pub fn complete_get(
        &mut self,
        id: u8,
        generation: u64,
        result: Result<HttpResponse, HttpError>,
        now: Instant,
    ) -> Result<Option<LanCommands>, LanError> {
        if !self.is_current(id, generation) {
            log::debug!("lan: #{id} stale commands answer");
            return Ok(None);
        }
        let keep_alive = self.keep_alive();
        let session = self.session_mut(id).ok_or(LanError::NoSession(id))?;
        session.busy = false;
        let resp = match result {
            Ok(resp) if matches!(resp.status, STATUS_OK | STATUS_PARTIAL_CONTENT) => resp,
            Ok(resp) if resp.is_success() => {
                session.expires_at = now + keep_alive;
                return Ok(None);
            }
            Ok(resp) => {
                log::warn!("lan: #{id} commands GET status {}", resp.status);
                self.remove(id);
                return Ok(None);
            }
            Err(err) => {
                log::warn!("lan: #{id} commands GET failed: {err}");
                self.remove(id);
                return Ok(None);
            }
        };
        session.expires_at = now + keep_alive;
        if resp.status == STATUS_PARTIAL_CONTENT {
            session.pending = true;
        }
        let Some(envelope) = resp.json() else {
            return Ok(None);
        };
        let keys = session.keys.as_mut().ok_or(LanError::KeyMismatch)?;
        let plain = match keys.decaps(&envelope) {
            Ok(plain) => plain,
            Err(err) if err.ends_session() => {
                self.remove(id);
                return Err(err);
            }
            Err(err) => {
                log::warn!("lan: #{id} dropping packet: {err}");
                return Err(err);
            }
        };
        session.verified = true;

        let Some(data) = plain.get("data").filter(|data| data.is_object()) else {
            log::warn!("lan: #{id} no data");
            return Ok(None);
        };
        let sealed = session.is_sealed();
        let updates = |key: &str| {
            if sealed {
                None
            } else {
                data.get(key).filter(|props| props.is_array()).cloned()
            }
        };
        let properties = updates("properties");
        let node_properties = updates("node_properties");
        let cmds = data
            .get("cmds")
            .and_then(Value::as_array)
            .map(|cmds| cmds.iter().filter_map(|item| item.get("cmd").filter(|cmd| cmd.is_object()).cloned()).collect())
            .unwrap_or_default();
        Ok(Some(LanCommands { properties, node_properties, cmds }))
    }

    /// Encapsulated POST of `body` to `resource` under the client's base URI.
    pub fn post_request(&mut self, id: u8, resource: &str, body: &Value, now: Instant) -> Result<HttpRequest, LanError> {
        self.build_post(id, true, resource, body, now)
    }

    /// Encapsulated POST answering a client command at `uri` (path and query).
    pub fn reply_request(&mut self, id: u8, uri: &str, body: &Value, now: Instant) -> Result<HttpRequest, LanError> {
        self.build_post(id, false, uri, body, now)
    }

    fn build_post(
        &mut self,
        id: u8,
        under_base: bool,
        resource: &str,
        body: &Value,
        now: Instant,
    ) -> Result<HttpRequest, LanError> {
        let keep_alive = self.keep_alive();
        let session = self.session_mut(id).ok_or(LanError::NoSession(id))?;
        let seq_no = session.send_seq_no;
        let keys = session.keys.as_mut().ok_or(LanError::NoSession(id))?;
        let envelope = keys.encaps(seq_no, body)?;
        session.send_seq_no = seq_no.wrapping_add(1) & u64::from(u16::MAX);
        session.expires_at = now + keep_alive;
        let base = if under_base { session.uri.as_str() } else { "" };
        Ok(HttpRequest::new(HttpMethod::Post, session.url(base, resource))
            .json(envelope)
            .timeout(LAN_REQUEST_TIMEOUT)
            .external())
    }

    /// Classifies a POST result. 404 means the client ignores the resource and
    /// keeps the session; any other failure ends it.
    pub fn post_result(&mut self, id: u8, generation: u64, result: &Result<HttpResponse, HttpError>) -> LanOutcome {
        if !self.is_current(id, generation) {
            log::debug!("lan: #{id} stale post result");
            return LanOutcome::Failed;
        }
        match result {
            Ok(resp) if resp.is_success() => LanOutcome::Delivered,
            Ok(resp) if resp.status == STATUS_NOT_FOUND => LanOutcome::NotFound,
            Ok(resp) => {
                log::debug!("lan: #{id} post status {}", resp.status);
                self.remove(id);
                LanOutcome::Failed
            }
            Err(err) => {
                log::debug!("lan: #{id} post failed: {err}");
                self.remove(id);
                LanOutcome::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "lan-secret-key";

    fn table() -> LanTable {
        LanTable::new(LanConfig { enable: true, key: KEY.to_string(), key_id: 42, ..LanConfig::default() })
    }

    fn reg(ip: &str, notify: i64) -> Value {
        json!({"local_reg": {"uri": "local_lan", "ip": ip, "port": 10275, "notify": notify}})
    }

    /// Plays the client side of a key exchange, returning its session keys.
    fn exchange(table: &mut LanTable, now: Instant) -> (u8, SessionKeys) {
        let step = table.next_step(now).expect("key exchange step");
        assert_eq!(step.kind, LanStepKind::KeyExchange);
        assert_eq!(step.request.url, "http://192.168.1.20:10275/local_lan/key_exchange.json");
        let crate::http::RequestBody::Json(body) = &step.request.body else {
            panic!("key exchange body");
        };
        let ke = &body["key_exchange"];
        assert_eq!(ke["key_id"], 42);
        let random_1 = ke["random_1"].as_str().expect("random_1");
        assert_eq!(BASE64.decode(random_1).expect("b64").len(), RANDOM_LEN);
        let time_1 = ke["time_1"].as_u64().expect("time_1");

        let roots = Roots::new(random_1, time_1, "Y2xpZW50bm9uY2U=", 99);
        let client = SessionKeys::derive(KEY.as_bytes(), &roots.app, &roots.module);
        let resp = HttpResponse::with_json(200, &json!({"random_2": "Y2xpZW50bm9uY2U=", "time_2": 99}));
        table.complete_key_exchange(step.id, step.generation, Ok(resp), now).expect("keys");
        (step.id, client)
    }

    #[test]
    fn preconditions_map_to_statuses() {
        let mut disabled = LanTable::new(LanConfig::default());
        assert_eq!(disabled.register_post(&reg("10.0.0.1", 1), Instant::now()), 404);
        let mut keyless = LanTable::new(LanConfig { enable: true, ..LanConfig::default() });
        assert_eq!(keyless.register_post(&reg("10.0.0.1", 1), Instant::now()), 412);
        assert_eq!(table().register_post(&json!({"bogus": 1}), Instant::now()), 400);

        let mut full = table();
        for host in 1..=LAN_SLOTS {
            assert_eq!(full.register_post(&reg(&format!("10.0.0.{host}"), 1), Instant::now()), 202);
        }
        assert_eq!(full.register_post(&reg("10.0.0.99", 1), Instant::now()), 503);
    }

    #[test]
    fn same_client_reuses_slot_and_drops_old_session() {
        let mut table = table();
        let now = Instant::now();
        assert_eq!(table.register_post(&reg("192.168.1.20", 1), now), 202);
        let (id, _) = exchange(&mut table, now);
        assert!(table.session(id).expect("session").has_keys());

        assert_eq!(table.register_post(&reg("192.168.1.20", 1), now), 202);
        assert_eq!(table.sessions().count(), 1);
        let session = table.session(id).expect("same slot");
        assert!(!session.has_keys());
    }

    #[test]
    fn refresh_pends_get_on_notify_or_limit() {
        let mut table = table();
        let now = Instant::now();
        table.register_post(&reg("192.168.1.20", 1), now);
        let (id, _) = exchange(&mut table, now);
        let get = table.next_step(now).expect("initial get");
        assert_eq!(get.kind, LanStepKind::GetCommands);
        table.complete_get(id, get.generation, Ok(HttpResponse::new(204)), now).expect("no content");

        for _ in 0..REFRESH_LIMIT - 1 {
            assert_eq!(table.register_put(&reg("192.168.1.20", 0), now), 202);
            assert!(!table.session(id).expect("session").is_pending());
        }
        table.register_put(&reg("192.168.1.20", 0), now);
        assert!(table.session(id).expect("session").is_pending());
        assert_eq!(table.session(id).expect("session").refresh_count(), 0);
    }

    #[test]
    fn verified_get_delivers_commands_and_sets_dest() {
        let mut table = table();
        let now = Instant::now();
        table.register_post(&reg("192.168.1.20", 1), now);
        let (id, mut client) = exchange(&mut table, now);
        assert_eq!(table.dests(), DestMask::NONE);

        let step = table.next_step(now).expect("get");
        assert_eq!(step.request.url, "http://192.168.1.20:10275/local_lan/commands.json");
        let data = json!({
            "properties": [{"property": {"name": "Blue_LED", "value": 1, "base_type": "boolean"}}],
            "node_properties": [{"property": {"dsn": "VR1", "name": "s1:t:onoff", "value": 0}}],
            "cmds": [{"cmd": {"cmd_id": 0, "method": "GET", "resource": "property.json?name=LED", "data": "none", "uri": "local_lan/property/datapoint.json"}}],
        });
        let envelope = client.encaps(8, &data).expect("encaps");
        let cmds = table
            .complete_get(id, step.generation, Ok(HttpResponse::with_json(206, &envelope)), now)
            .expect("verified")
            .expect("commands");
        assert_eq!(cmds.cmds.len(), 1);
        assert_eq!(cmds.properties.expect("props")[0]["property"]["name"], "Blue_LED");
        assert_eq!(cmds.node_properties.expect("node props")[0]["property"]["dsn"], "VR1");
        assert_eq!(table.dests(), DestMask::lan(id));
        assert!(table.session(id).expect("session").is_pending());

        let post = table.post_request(id, "property/datapoint.json", &json!({"name": "t"}), now).expect("post");
        let crate::http::RequestBody::Json(envelope) = &post.body else {
            panic!("post body");
        };
        assert_eq!(client.decaps(envelope).expect("client decaps")["seq_no"], 0);
        let reply = table.reply_request(id, "local_lan/property/datapoint.json?cmd_id=0&status=200", &json!({}), now);
        assert_eq!(
            reply.expect("reply").url,
            "http://192.168.1.20:10275/local_lan/property/datapoint.json?cmd_id=0&status=200"
        );
    }

    #[test]
    fn bad_signature_drops_packet_but_keeps_session() {
        let mut table = table();
        let now = Instant::now();
        table.register_post(&reg("192.168.1.20", 1), now);
        let (id, mut client) = exchange(&mut table, now);
        let step = table.next_step(now).expect("get");
        let mut envelope = client.encaps(1, &json!({"cmds": []})).expect("encaps");
        envelope["sign"] = json!(BASE64.encode([0u8; 32]));
        let err = table.complete_get(id, step.generation, Ok(HttpResponse::with_json(200, &envelope)), now);
        assert_eq!(err, Err(LanError::SignatureMismatch));
        assert!(table.session(id).is_some());
        assert_eq!(table.dests(), DestMask::NONE);
    }

    #[test]
    fn failures_and_keep_alive_remove_sessions() {
        let mut table = table();
        let now = Instant::now();
        table.register_post(&reg("192.168.1.20", 1), now);
        let step = table.next_step(now).expect("exchange");
        let bad = Ok(HttpResponse::with_json(200, &json!({})));
        assert!(table.complete_key_exchange(step.id, step.generation, bad, now).is_err());
        assert!(table.session(step.id).is_none());

        table.register_post(&reg("192.168.1.20", 1), now);
        let (id, _) = exchange(&mut table, now);
        let generation = table.session(id).expect("session").generation();
        assert_eq!(table.post_result(id, generation, &Ok(HttpResponse::new(404))), LanOutcome::NotFound);
        assert!(table.session(id).is_some());
        let deadline = table.next_deadline().expect("deadline");
        assert!(table.expire(deadline - Duration::from_millis(1)).is_empty());
        assert_eq!(table.expire(deadline), vec![id]);
    }

    #[test]
    fn late_answer_for_replaced_registration_is_ignored() {
        let mut table = table();
        let now = Instant::now();
        table.register_post(&reg("192.168.1.20", 1), now);
        let first = table.next_step(now).expect("exchange A");

        let later = now + Duration::from_secs(31);
        assert_eq!(table.expire(later), vec![first.id]);
        table.register_post(&reg("192.168.1.20", 1), later);
        let second = table.next_step(later).expect("exchange B");
        assert_eq!(second.id, first.id);
        assert_ne!(second.generation, first.generation);

        let stale = HttpResponse::with_json(200, &json!({"random_2": "c3RhbGVub25jZQ==", "time_2": 5}));
        assert_eq!(
            table.complete_key_exchange(first.id, first.generation, Ok(stale), later),
            Err(LanError::NoSession(first.id))
        );
        let session = table.session(second.id).expect("new session kept");
        assert!(!session.has_keys());

        let crate::http::RequestBody::Json(body) = &second.request.body else {
            panic!("key exchange body");
        };
        let random_1 = body["key_exchange"]["random_1"].as_str().expect("random_1");
        let time_1 = body["key_exchange"]["time_1"].as_u64().expect("time_1");
        let roots = Roots::new(random_1, time_1, "Y2xpZW50bm9uY2U=", 99);
        let mut client = SessionKeys::derive(KEY.as_bytes(), &roots.app, &roots.module);
        let resp = HttpResponse::with_json(200, &json!({"random_2": "Y2xpZW50bm9uY2U=", "time_2": 99}));
        table.complete_key_exchange(second.id, second.generation, Ok(resp), later).expect("keys");

        let get = table.next_step(later).expect("get");
        assert_eq!(table.complete_get(first.id, first.generation, Ok(HttpResponse::new(500)), later), Ok(None));
        assert!(table.session(get.id).is_some());
        let envelope = client.encaps(1, &json!({"cmds": []})).expect("encaps");
        let verified = table.complete_get(get.id, get.generation, Ok(HttpResponse::with_json(200, &envelope)), later);
        assert!(verified.expect("verified").is_some());
        assert_eq!(table.post_result(first.id, first.generation, &Err(HttpError::Timeout)), LanOutcome::Failed);
        assert!(table.session(get.id).is_some());
    }

    #[test]
    fn keep_alive_runs_from_last_successful_exchange() {
        let mut table = table();
        let start = Instant::now();
        table.register_post(&reg("192.168.1.20", 1), start);
        let registered = table.session(1).expect("session").expires_at();

        let sent = start + Duration::from_secs(10);
        let step = table.next_step(sent).expect("exchange");
        assert_eq!(table.session(step.id).expect("session").expires_at(), registered);

        let answered = start + Duration::from_secs(20);
        let resp = HttpResponse::with_json(200, &json!({"random_2": "Y2xpZW50bm9uY2U=", "time_2": 99}));
        table.complete_key_exchange(step.id, step.generation, Ok(resp), answered).expect("keys");
        assert_eq!(table.session(step.id).expect("session").expires_at(), answered + Duration::from_secs(30));

        let get = table.next_step(answered + Duration::from_secs(5)).expect("get");
        assert_eq!(table.session(get.id).expect("session").expires_at(), answered + Duration::from_secs(30));
        let failed_at = answered + Duration::from_secs(29);
        table.complete_get(get.id, get.generation, Err(HttpError::Timeout), failed_at).expect("removed");
        assert!(table.session(get.id).is_none());
    }

    struct FakeSealer;

    impl KeySealer for FakeSealer {
        fn seal(&self, public_key_pem: &str, secret: &[u8]) -> Result<Vec<u8>, LanError> {
            assert!(public_key_pem.starts_with("-----BEGIN"));
            Ok(secret.iter().rev().copied().collect())
        }
    }

    #[test]
    fn public_key_clients_get_sealed_secret() {
        let mut table = table().with_sealer(Box::new(FakeSealer));
        let now = Instant::now();
        let body = json!({"local_reg": {"uri": "l", "ip": "10.0.0.7", "port": 80, "key": "QUJD"}});
        assert_eq!(table.register_post(&body, now), 202);
        let step = table.next_step(now).expect("exchange");
        let crate::http::RequestBody::Json(body) = &step.request.body else {
            panic!("body");
        };
        assert!(body["key_exchange"].get("key_id").is_none());
        let sealed = BASE64.decode(body["key_exchange"]["sec"].as_str().expect("sec")).expect("b64");
        assert_eq!(sealed.len(), SEALED_SECRET_LEN);
        assert!(table.session(step.id).expect("session").is_sealed());
    }
}
