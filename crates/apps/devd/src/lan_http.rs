//! Minimal HTTP/1.1 handling for the LAN registration endpoint.
//!
//! LAN clients register here and read device status; everything else they
//! exchange with the device travels over the secure channel the device opens
//! back to them.

use devd_core::{DaemonContext, HttpMethod};
use serde_json::Value;
use std::time::Instant;

const HEADER_END: &[u8] = b"\r\n\r\n";

pub const LOCAL_REG_PATH: &str = "/local_lan/local_reg.json";
pub const STATUS_PATH: &str = "/local_lan/status.json";
pub const REGTOKEN_PATH: &str = "/local_lan/regtoken.json";
pub const PUSH_BUTTON_PATH: &str = "/local_lan/push_button_reg.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanHttpRequest {
    pub method: String,
    pub path: String,
    pub body: Vec<u8>,
}

pub fn find_header_end(request: &[u8]) -> Option<usize> {
    request.windows(HEADER_END.len()).position(|window| window == HEADER_END)
}

pub fn parse_content_length(headers: &[u8]) -> Option<usize> {
    String::from_utf8_lossy(headers).lines().find_map(|line| {
        let lower = line.to_ascii_lowercase();
        lower.strip_prefix("content-length:").and_then(|value| value.trim().parse::<usize>().ok())
    })
}

/// True once `buffer` holds the headers and the whole declared body.
pub fn is_complete(buffer: &[u8]) -> bool {
    let Some(header_end) = find_header_end(buffer) else {
        return false;
    };
    match parse_content_length(&buffer[..header_end]) {
        Some(length) => buffer.len() >= header_end + HEADER_END.len() + length,
        None => true,
    }
}

pub fn parse_request(buffer: &[u8]) -> Option<LanHttpRequest> {
    let header_end = find_header_end(buffer)?;
    let headers = String::from_utf8_lossy(&buffer[..header_end]);
    let mut parts = headers.lines().next()?.split_whitespace();
    let method = parts.next()?.to_string();
    let target = parts.next()?;
    let path = target.split_once('?').map_or(target, |(path, _)| path).to_string();
    let body_start = header_end + HEADER_END.len();
    let body = match parse_content_length(&buffer[..header_end]) {
        Some(length) => buffer.get(body_start..body_start + length)?.to_vec(),
        None => Vec::new(),
    };
    Some(LanHttpRequest { method, path, body })
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        202 => "Accepted",
        204 => "No Content",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        412 => "Precondition Failed",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

pub fn build_response(status: u16, body: Option<&Value>) -> Vec<u8> {
    let body = body.map(Value::to_string).unwrap_or_default();
    let mut response = format!("HTTP/1.1 {status} {}\r\n", reason(status));
    if !body.is_empty() {
        response.push_str("Content-Type: application/json\r\n");
    }
    response.push_str(&format!("Content-Length: {}\r\nConnection: close\r\n\r\n", body.len()));
    response.push_str(&body);
    response.into_bytes()
}

/// Routes one request against the daemon context and returns the status and
/// optional JSON body.
pub fn route(ctx: &mut DaemonContext, request: &LanHttpRequest, now: Instant) -> (u16, Option<Value>) {
    match (request.method.as_str(), request.path.as_str()) {
        (method @ ("POST" | "PUT"), LOCAL_REG_PATH) => {
            let Ok(body) = serde_json::from_slice::<Value>(&request.body) else {
                log::debug!("lan: unparsable registration body");
                return (400, None);
            };
            let method = if method == "POST" { HttpMethod::Post } else { HttpMethod::Put };
            (ctx.lan_register(method, &body, now), None)
        }
        ("GET", STATUS_PATH) => (200, Some(ctx.lan_status(now))),
        ("GET", REGTOKEN_PATH) => (200, Some(ctx.registration())),
        ("PUT" | "POST", PUSH_BUTTON_PATH) => {
            if ctx.push_button_reg(now) {
                (204, None)
            } else {
                (412, None)
            }
        }
        (_, LOCAL_REG_PATH | STATUS_PATH | REGTOKEN_PATH | PUSH_BUTTON_PATH) => (405, None),
        _ => (404, None),
    }
}

/// Parses the raw request in `buffer`, routes it and builds the response.
pub fn respond(ctx: &mut DaemonContext, buffer: &[u8], now: Instant) -> Vec<u8> {
    match parse_request(buffer) {
        Some(request) => {
            let (status, body) = route(ctx, &request, now);
            log::debug!("lan: {} {} -> {status}", request.method, request.path);
            build_response(status, body.as_ref())
        }
        None => build_response(400, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devd_core::config::LanConfig;
    use devd_core::DevdConfig;
    use serde_json::json;

    fn context() -> DaemonContext {
        let mut config = DevdConfig::default();
        config.device.dsn = "AC000W000000001".to_string();
        config.lan = LanConfig { enable: true, key: "secret".to_string(), key_id: 3, ..LanConfig::default() };
        DaemonContext::new(config, Instant::now())
    }

    fn status_line(response: &[u8]) -> String {
        String::from_utf8_lossy(response).lines().next().expect("status line").to_string()
    }

    fn body(response: &[u8]) -> Value {
        let end = find_header_end(response).expect("header end");
        serde_json::from_slice(&response[end + HEADER_END.len()..]).expect("json body")
    }

    fn request(method: &str, path: &str, body: &str) -> Vec<u8> {
        format!("{method} {path} HTTP/1.1\r\nHost: 10.0.0.2\r\nContent-Length: {}\r\n\r\n{body}", body.len())
            .into_bytes()
    }

    #[test]
    fn request_is_complete_only_with_whole_body() {
        let full = request("POST", LOCAL_REG_PATH, "{\"a\":1}");
        assert!(is_complete(&full));
        assert!(!is_complete(&full[..full.len() - 1]));
        assert!(is_complete(b"GET /local_lan/status.json HTTP/1.1\r\n\r\n"));
        assert!(!is_complete(b"GET /local_lan/status.json HTTP/1.1\r\n"));
    }

    #[test]
    fn registration_is_accepted() {
        let mut ctx = context();
        let reg = json!({"local_reg": {"uri": "local_lan", "ip": "10.0.0.9", "port": 80, "notify": 1}});
        let response = respond(&mut ctx, &request("POST", LOCAL_REG_PATH, &reg.to_string()), Instant::now());
        assert_eq!(status_line(&response), "HTTP/1.1 202 Accepted");
        assert_eq!(ctx.lan().sessions().count(), 1);
    }

    #[test]
    fn bad_registration_body_is_rejected() {
        let mut ctx = context();
        let response = respond(&mut ctx, &request("PUT", LOCAL_REG_PATH, "{nope"), Instant::now());
        assert_eq!(status_line(&response), "HTTP/1.1 400 Bad Request");
    }

    #[test]
    fn status_and_regtoken_are_served() {
        let mut ctx = context();
        let status = respond(&mut ctx, &request("GET", STATUS_PATH, ""), Instant::now());
        assert_eq!(status_line(&status), "HTTP/1.1 200 OK");
        assert_eq!(body(&status)["dsn"], "AC000W000000001");

        let regtoken = respond(&mut ctx, &request("GET", REGTOKEN_PATH, ""), Instant::now());
        assert_eq!(body(&regtoken)["registered"], 0);
    }

    #[test]
    fn push_button_needs_cloud_and_unknown_paths_are_404() {
        let mut ctx = context();
        let push = respond(&mut ctx, &request("PUT", PUSH_BUTTON_PATH, ""), Instant::now());
        assert_eq!(status_line(&push), "HTTP/1.1 412 Precondition Failed");
        let wrong = respond(&mut ctx, &request("DELETE", STATUS_PATH, ""), Instant::now());
        assert_eq!(status_line(&wrong), "HTTP/1.1 405 Method Not Allowed");
        let missing = respond(&mut ctx, &request("GET", "/local_lan/nothing.json", ""), Instant::now());
        assert_eq!(status_line(&missing), "HTTP/1.1 404 Not Found");
        assert_eq!(status_line(&respond(&mut ctx, b"garbage", Instant::now())), "HTTP/1.1 400 Bad Request");
    }
}
