use devd_core::{HttpClient, HttpError, HttpRequest, HttpResponse};
use devd_daemon::Daemon;
use std::rc::Rc;
use tokio_util::sync::CancellationToken;

/// Sends `request` unless `token` fires first.
pub(super) async fn send_until<H: HttpClient>(
    token: CancellationToken,
    http: &H,
    request: HttpRequest,
) -> Result<HttpResponse, HttpError> {
    tokio::select! {
        _ = token.cancelled() => Err(HttpError::Canceled),
        result = http.send(request) => result,
    }
}

/// Runs the cloud state machine's requests one at a time.
pub(super) fn spawn_cloud_worker<H: HttpClient + 'static>(daemon: Rc<Daemon>, http: H) {
    tokio::task::spawn_local(async move {
        while !daemon.is_shutting_down() {
            let next = daemon.next_work(|ctx, now| ctx.next_cloud_request(now), Option::is_none);
            let Some((action, mut request)) = next else {
                if !daemon.wait(None).await {
                    break;
                }
                continue;
            };
            loop {
                let result = send_until(daemon.request_token(), &http, request.clone()).await;
                match daemon.update(|ctx, now| ctx.cloud_complete(action, request, result, now)) {
                    Some(again) => request = again,
                    None => break,
                }
            }
        }
        log::debug!("devd: cloud worker stopped");
    });
}
