use devd_daemon::lan_http;
use devd_daemon::Daemon;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const READ_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_REQUEST: usize = 16 * 1024;

pub(super) fn spawn_lan_server(daemon: Rc<Daemon>, listener: TcpListener) {
    tokio::task::spawn_local(async move {
        let shutdown = daemon.shutdown_token();
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    let daemon = daemon.clone();
                    tokio::task::spawn_local(async move { handle_connection(stream, peer, &daemon).await });
                }
                Err(err) => log::warn!("lan: accept failed: {err}"),
            }
        }
    });
}

async fn read_request(stream: &mut TcpStream) -> io::Result<Vec<u8>> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 2048];
    loop {
        let read = stream.read(&mut chunk).await?;
        if read == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..read]);
        if lan_http::is_complete(&buffer) {
            break;
        }
        if buffer.len() > MAX_REQUEST {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "request too large"));
        }
    }
    Ok(buffer)
}

async fn handle_connection(mut stream: TcpStream, peer: SocketAddr, daemon: &Daemon) {
    let buffer = match tokio::time::timeout(READ_TIMEOUT, read_request(&mut stream)).await {
        Ok(Ok(buffer)) => buffer,
        Ok(Err(err)) => {
            log::debug!("lan: read from {peer} failed: {err}");
            return;
        }
        Err(_) => {
            log::debug!("lan: {peer} sent no complete request");
            return;
        }
    };
    if buffer.is_empty() {
        return;
    }
    let response = daemon.update(|ctx, now| lan_http::respond(ctx, &buffer, now));
    if let Err(err) = stream.write_all(&response).await {
        log::debug!("lan: write to {peer} failed: {err}");
    }
    let _ = stream.shutdown().await;
}
