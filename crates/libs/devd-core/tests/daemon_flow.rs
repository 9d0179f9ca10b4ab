use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use devd_core::config::LanConfig;
use devd_core::ds::{CloudAction, CloudMachine};
use devd_core::http::RequestBody;
use devd_core::lan::crypto::{Roots, SessionKeys};
use devd_core::{
    DaemonContext, DaemonOutput, DestMask, DevdConfig, HttpClient, HttpError, HttpMethod, HttpRequest,
    HttpResponse, LanRequestKind, OpWork,
};
use serde_json::{json, Value};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::time::Instant;

const LAN_KEY: &str = "0123456789abcdef0123456789abcdef";

/// Answers requests from a fixed script and records what was sent.
#[derive(Default)]
struct ScriptedHttp {
    replies: RefCell<VecDeque<Result<HttpResponse, HttpError>>>,
    sent: RefCell<Vec<HttpRequest>>,
}

impl ScriptedHttp {
    fn push(&self, reply: Result<HttpResponse, HttpError>) {
        self.replies.borrow_mut().push_back(reply);
    }

    fn urls(&self) -> Vec<String> {
        self.sent.borrow().iter().map(|request| request.url.clone()).collect()
    }
}

#[async_trait(?Send)]
impl HttpClient for ScriptedHttp {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
        self.sent.borrow_mut().push(request);
        self.replies.borrow_mut().pop_front().unwrap_or(Err(HttpError::Timeout))
    }
}

fn no_jitter() -> u32 {
    0
}

fn config() -> DevdConfig {
    let mut config = DevdConfig::default();
    config.device.dsn = "AC000W000000001".to_string();
    config.device.ads_host = "ads.example.com".to_string();
    config.device.model = "gw".to_string();
    config
}

fn context(config: DevdConfig, now: Instant) -> DaemonContext {
    let cloud = CloudMachine::from_config(&config).with_jitter(no_jitter);
    DaemonContext::new(config, now).with_cloud(cloud)
}

fn record() -> Value {
    json!({"device": {
        "key": 4242,
        "ans_cipher_key": BASE64.encode([5u8; 16]),
        "ans_server": "ans.example.com",
        "registered": true,
    }})
}

/// Runs the cloud client against `http` until it has nothing left to send.
async fn drive_cloud(ctx: &mut DaemonContext, http: &ScriptedHttp, now: Instant) -> Vec<CloudAction> {
    let mut actions = Vec::new();
    while let Some((action, request)) = ctx.next_cloud_request(now) {
        actions.push(action);
        let mut request = request;
        loop {
            let result = http.send(request.clone()).await;
            match ctx.cloud_complete(action, request, result, now) {
                Some(again) => request = again,
                None => break,
            }
        }
    }
    actions
}

async fn bring_up(ctx: &mut DaemonContext, http: &ScriptedHttp, now: Instant) {
    http.push(Ok(HttpResponse::new(200).with_header("Text", "Ping")));
    http.push(Ok(HttpResponse::with_json(200, &record()).with_header("x-Ayla-auth-key", "tok3n")));
    http.push(Ok(HttpResponse::new(200)));
    ctx.net_up();
    let actions = drive_cloud(ctx, http, now).await;
    assert_eq!(actions, vec![CloudAction::Ping, CloudAction::GetDsns, CloudAction::PutInfo]);
    assert!(ctx.cloud().is_up());
}

#[tokio::test(flavor = "current_thread")]
async fn bring_up_uses_issued_credential_and_waits_for_listener() {
    let now = Instant::now();
    let http = ScriptedHttp::default();
    let mut ctx = context(config(), now);
    bring_up(&mut ctx, &http, now).await;

    assert_eq!(
        http.urls(),
        vec![
            "http://ads.example.com/ping".to_string(),
            "https://ads.example.com/dsns/AC000W000000001.json".to_string(),
            "https://ads.example.com/devices/4242.json".to_string(),
        ]
    );
    let put = http.sent.borrow()[2].clone();
    assert!(put.headers.contains(&("x-Ayla-auth-key".to_string(), "Ayla1.0 tok3n".to_string())));
    assert_eq!(ctx.registration()["registered"], 1);

    // Commands are only fetched once the application listens.
    assert!(ctx.next_cloud_request(now).is_none());
    ctx.client_message(devd_core::app::CLIENT_LISTEN_ENABLE, now);
    http.push(Ok(HttpResponse::with_json(200, &json!({"commands": {"cmds": [], "properties": []}}))));
    assert_eq!(drive_cloud(&mut ctx, &http, now).await, vec![CloudAction::GetCommands]);
    assert!(http.urls()[3].starts_with("https://ads.example.com/devices/4242/commands.json"));
}

#[tokio::test(flavor = "current_thread")]
async fn unauthorized_request_is_resent_with_fresh_credential() {
    let now = Instant::now();
    let http = ScriptedHttp::default();
    let mut ctx = context(config(), now);
    bring_up(&mut ctx, &http, now).await;
    ctx.drain_outputs();

    ctx.data_message(
        br#"{"cmd":{"proto":"data","id":9,"op":"prop_send",
            "args":[{"property":{"name":"temp","base_type":"integer","value":21}}]}}"#,
        now,
    );
    let OpWork::Send(request) = ctx.next_op(now) else {
        panic!("expected datapoint POST");
    };
    let resent = ctx
        .op_complete(request, Ok(HttpResponse::new(401)), now)
        .expect("first 401 is retried");
    assert!(resent.headers.iter().all(|(name, _)| !name.eq_ignore_ascii_case("x-Ayla-auth-key")));
    assert!(ctx.op_complete(resent, Ok(HttpResponse::new(201)), now).is_none());
    let outputs = ctx.drain_outputs();
    assert!(outputs.iter().all(|out| !matches!(out, DaemonOutput::App(msg) if msg["cmd"]["op"] == "nak")));
    assert_eq!(ctx.next_op(now), OpWork::Idle);
}

#[tokio::test(flavor = "current_thread")]
async fn lan_client_session_carries_properties_both_ways() {
    let now = Instant::now();
    let http = ScriptedHttp::default();
    let mut config = config();
    config.lan = LanConfig { enable: true, key: LAN_KEY.to_string(), key_id: 11, ..LanConfig::default() };
    let mut ctx = context(config, now);
    bring_up(&mut ctx, &http, now).await;
    ctx.drain_outputs();

    let reg = json!({"local_reg": {"uri": "local_lan", "ip": "192.168.1.20", "port": 10275, "notify": 1}});
    assert_eq!(ctx.lan_register(HttpMethod::Post, &reg, now), 202);

    let exchange = ctx.next_lan_request(now).expect("key exchange");
    assert_eq!(exchange.kind, LanRequestKind::KeyExchange);
    let RequestBody::Json(body) = &exchange.request.body else {
        panic!("key exchange carries JSON");
    };
    assert_eq!(body["key_exchange"]["key_id"], 11);
    let random_1 = body["key_exchange"]["random_1"].as_str().expect("random_1").to_string();
    let time_1 = body["key_exchange"]["time_1"].as_u64().expect("time_1");
    let roots = Roots::new(&random_1, time_1, "Y2xpZW50LW5vbmNl", 9001);
    let mut client = SessionKeys::derive(LAN_KEY.as_bytes(), &roots.app, &roots.module);
    ctx.lan_complete(
        exchange.id,
        exchange.generation,
        LanRequestKind::KeyExchange,
        Ok(HttpResponse::with_json(200, &json!({"random_2": "Y2xpZW50LW5vbmNl", "time_2": 9001}))),
        now,
    );

    let get = ctx.next_lan_request(now).expect("commands fetch");
    assert_eq!(get.kind, LanRequestKind::GetCommands);
    assert_eq!(get.request.url, "http://192.168.1.20:10275/local_lan/commands.json");
    let envelope = client
        .encaps(
            1,
            &json!({
                "properties": [{"property": {"name": "Blue_LED", "value": 1}}],
                "cmds": [{"cmd": {"cmd_id": 4, "method": "GET", "resource": "status.json",
                    "uri": "/local_lan/status_resp.json", "data": ""}}],
            }),
        )
        .expect("client encaps");
    ctx.lan_complete(get.id, get.generation, LanRequestKind::GetCommands, Ok(HttpResponse::with_json(200, &envelope)), now);

    let lan_dest = DestMask::lan(get.id);
    assert_eq!(ctx.dests_avail(), DestMask::ADS | lan_dest);
    let outputs = ctx.drain_outputs();
    assert!(outputs.contains(&DaemonOutput::Dests(DestMask::ADS | lan_dest)));
    let update = outputs
        .iter()
        .find_map(|out| match out {
            DaemonOutput::App(msg) if msg["cmd"]["op"] == "prop_update" => Some(msg.clone()),
            _ => None,
        })
        .expect("prop_update for the app");
    assert_eq!(update["cmd"]["opts"]["source"], json!(DestMask::lan_source(get.id)));

    // The status command is answered on the client's response URI.
    let reply = ctx.next_lan_request(now).expect("command reply");
    assert_eq!(reply.kind, LanRequestKind::Reply);
    assert_eq!(reply.request.url, "http://192.168.1.20:10275/local_lan/status_resp.json?cmd_id=4&status=200");
    let RequestBody::Json(reply_body) = &reply.request.body else {
        panic!("reply carries an envelope");
    };
    let plain = client.decaps(reply_body).expect("client decaps reply");
    assert_eq!(plain["data"]["dsn"], "AC000W000000001");
    ctx.lan_complete(reply.id, reply.generation, LanRequestKind::Reply, Ok(HttpResponse::new(200)), now);

    // The LAN update is echoed to the cloud.
    let OpWork::Send(echo) = ctx.next_op(now) else {
        panic!("expected echo to the cloud");
    };
    assert!(echo.url.ends_with("properties/Blue_LED/datapoints.json?echo=true"), "{}", echo.url);
    assert!(ctx.op_complete(echo, Ok(HttpResponse::new(201)), now).is_none());

    // An application update reaches the LAN client first, then the cloud.
    ctx.data_message(
        br#"{"cmd":{"proto":"data","id":30,"op":"prop_send","opts":{"confirm":true},
            "args":[{"property":{"name":"Blue_LED","base_type":"boolean","value":0}}]}}"#,
        now,
    );
    let OpWork::Lan(deliveries) = ctx.next_op(now) else {
        panic!("expected LAN delivery");
    };
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].request.url, "http://192.168.1.20:10275/local_lan/property/datapoint.json");
    let RequestBody::Json(post) = &deliveries[0].request.body else {
        panic!("post carries an envelope");
    };
    assert_eq!(client.decaps(post).expect("client decaps post")["data"]["value"], 0);
    ctx.op_lan_complete(vec![(deliveries[0].lan_id, deliveries[0].generation, Ok(HttpResponse::new(200)))], now);

    let OpWork::Send(request) = ctx.next_op(now) else {
        panic!("expected cloud POST");
    };
    ctx.op_complete(request, Ok(HttpResponse::new(201)), now);
    let outputs = ctx.drain_outputs();
    assert!(outputs.contains(&DaemonOutput::App(json!({"cmd": {"proto": "data", "id": 30, "op": "ack"}}))));
    assert!(outputs.contains(&DaemonOutput::App(json!({"cmd": {"proto": "data", "id": 30, "op": "confirm_true"}}))));
}

#[tokio::test(flavor = "current_thread")]
async fn failed_lan_post_drops_client_and_reports_dests() {
    let now = Instant::now();
    let http = ScriptedHttp::default();
    let mut config = config();
    config.lan = LanConfig { enable: true, key: LAN_KEY.to_string(), key_id: 2, ..LanConfig::default() };
    let mut ctx = context(config, now);
    bring_up(&mut ctx, &http, now).await;

    let reg = json!({"local_reg": {"uri": "local_lan", "ip": "10.0.0.7", "port": 80}});
    ctx.lan_register(HttpMethod::Post, &reg, now);
    let exchange = ctx.next_lan_request(now).expect("key exchange");
    let RequestBody::Json(body) = &exchange.request.body else {
        panic!("key exchange carries JSON");
    };
    let roots = Roots::new(
        body["key_exchange"]["random_1"].as_str().expect("random_1"),
        body["key_exchange"]["time_1"].as_u64().expect("time_1"),
        "cjI=",
        5,
    );
    let mut client = SessionKeys::derive(LAN_KEY.as_bytes(), &roots.app, &roots.module);
    ctx.lan_complete(
        exchange.id,
        exchange.generation,
        LanRequestKind::KeyExchange,
        Ok(HttpResponse::with_json(200, &json!({"random_2": "cjI=", "time_2": 5}))),
        now,
    );
    let get = ctx.next_lan_request(now).expect("commands fetch");
    let envelope = client.encaps(0, &json!({})).expect("encaps");
    ctx.lan_complete(get.id, get.generation, LanRequestKind::GetCommands, Ok(HttpResponse::with_json(200, &envelope)), now);
    assert!(ctx.dests_avail().contains(DestMask::lan(get.id)));
    ctx.drain_outputs();

    ctx.data_message(
        br#"{"cmd":{"proto":"data","id":41,"op":"prop_send","opts":{"confirm":true,"dests":2},
            "args":[{"property":{"name":"fan","base_type":"integer","value":3}}]}}"#,
        now,
    );
    let OpWork::Lan(deliveries) = ctx.next_op(now) else {
        panic!("expected LAN delivery");
    };
    ctx.op_lan_complete(vec![(deliveries[0].lan_id, deliveries[0].generation, Err(HttpError::Timeout))], now);
    assert_eq!(ctx.next_op(now), OpWork::Idle);

    let outputs = ctx.drain_outputs();
    assert!(outputs.contains(&DaemonOutput::Dests(DestMask::ADS)));
    let confirm = outputs
        .iter()
        .find_map(|out| match out {
            DaemonOutput::App(msg) if msg["cmd"]["op"] == "confirm_false" => Some(msg.clone()),
            _ => None,
        })
        .expect("confirm_false");
    assert_eq!(confirm["cmd"]["args"][0]["dests"], json!(DestMask::lan(get.id).bits()));
    assert_eq!(confirm["cmd"]["args"][0]["err"], "conn_err");
}
