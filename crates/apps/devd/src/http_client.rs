use async_trait::async_trait;
use devd_core::http::{is_success, RequestBody};
use devd_core::{HttpClient, HttpError, HttpMethod, HttpRequest, HttpResponse};
use reqwest::header::CONTENT_TYPE;

/// [`HttpClient`] over a shared `reqwest` connection pool.
///
/// Each worker owns its own instance so a slow cloud request never holds up
/// LAN traffic or the operation queue.
#[derive(Clone)]
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("devd/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

fn method(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Delete => reqwest::Method::DELETE,
    }
}

fn transport_error(err: reqwest::Error) -> HttpError {
    if err.is_timeout() {
        HttpError::Timeout
    } else {
        HttpError::Transport { message: err.to_string() }
    }
}

fn io_error(err: std::io::Error, path: &std::path::Path) -> HttpError {
    HttpError::Transport { message: format!("{}: {err}", path.display()) }
}

#[async_trait(?Send)]
impl HttpClient for ReqwestClient {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
        let mut builder = self.client.request(method(request.method), &request.url).timeout(request.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder = match &request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(body) => builder.json(body),
            RequestBody::File(path) => {
                let data = tokio::fs::read(path).await.map_err(|err| io_error(err, path))?;
                builder.header(CONTENT_TYPE, "application/octet-stream").body(data)
            }
        };

        let response = builder.send().await.map_err(transport_error)?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| Some((name.as_str().to_string(), value.to_str().ok()?.to_string())))
            .collect();
        let body = response.bytes().await.map_err(transport_error)?.to_vec();
        log::debug!("http: {} {} -> {status}, {} bytes", request.method, request.url, body.len());

        if let Some(path) = request.save_to.as_ref().filter(|_| is_success(status)) {
            tokio::fs::write(path, &body).await.map_err(|err| io_error(err, path))?;
            return Ok(HttpResponse { status, headers, body: Vec::new() });
        }
        Ok(HttpResponse { status, headers, body })
    }
}
