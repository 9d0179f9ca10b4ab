use devd_core::notify::{Line, NotifyOutput};
use devd_daemon::Daemon;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::rc::Rc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::UnboundedReceiver;

const RECV_BUF: usize = 512;

/// Unconnected UDP socket for one notify line.
pub(super) async fn bind_line() -> io::Result<UdpSocket> {
    UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await
}

async fn recv_optional(socket: Option<&UdpSocket>, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
    match socket {
        Some(socket) => socket.recv_from(buf).await,
        None => std::future::pending().await,
    }
}

fn deliver(daemon: &Daemon, line: Line, received: io::Result<(usize, SocketAddr)>, buf: &[u8]) {
    match received {
        Ok((len, SocketAddr::V4(from))) => daemon.update(|ctx, now| ctx.notify_recv(line, from, &buf[..len], now)),
        Ok((_, from)) => log::debug!("np: ignoring packet from {from}"),
        Err(err) => log::warn!("np: receive on {line:?} line failed: {err}"),
    }
}

fn spawn_resolve(daemon: Rc<Daemon>, host: String) {
    tokio::task::spawn_local(async move {
        let addr = match tokio::net::lookup_host((host.as_str(), Line::Reg.port())).await {
            Ok(mut addrs) => addrs.find_map(|addr| match addr {
                SocketAddr::V4(v4) => Some(*v4.ip()),
                SocketAddr::V6(_) => None,
            }),
            Err(err) => {
                log::warn!("np: resolving {host} failed: {err}");
                None
            }
        };
        daemon.update(|ctx, now| ctx.notify_resolved(addr, now));
    });
}

async fn handle(daemon: &Rc<Daemon>, reg: &UdpSocket, ping: &mut Option<UdpSocket>, output: NotifyOutput) {
    match output {
        NotifyOutput::Send { line, to, packet } => {
            let socket = match line {
                Line::Reg => Some(reg),
                Line::Ping => ping.as_ref(),
            };
            let sent = match socket {
                Some(socket) => socket.send_to(&packet, to).await.map(drop),
                None => Err(io::Error::new(io::ErrorKind::NotConnected, "ping line closed")),
            };
            if let Err(err) = sent {
                log::warn!("np: send on {line:?} line to {to} failed: {err}");
                daemon.update(|ctx, now| ctx.notify_send_failed(now));
            }
        }
        NotifyOutput::Resolve(host) => spawn_resolve(daemon.clone(), host),
        NotifyOutput::OpenPingLine => {
            if ping.is_none() {
                match bind_line().await {
                    Ok(socket) => *ping = Some(socket),
                    Err(err) => {
                        log::warn!("np: ping socket failed: {err}");
                        daemon.update(|ctx, now| ctx.notify_send_failed(now));
                    }
                }
            }
        }
        NotifyOutput::ClosePingLine => *ping = None,
        // Events are consumed inside the context.
        NotifyOutput::Event(_) => {}
    }
}

/// Owns the notify sockets. The registration line lives for the whole run;
/// the ping line is opened and closed on request.
pub(super) fn spawn_notify_worker(daemon: Rc<Daemon>, reg: UdpSocket, mut outputs: UnboundedReceiver<NotifyOutput>) {
    tokio::task::spawn_local(async move {
        let shutdown = daemon.shutdown_token();
        let mut ping: Option<UdpSocket> = None;
        let mut reg_buf = [0u8; RECV_BUF];
        let mut ping_buf = [0u8; RECV_BUF];
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                output = outputs.recv() => match output {
                    Some(output) => handle(&daemon, &reg, &mut ping, output).await,
                    None => break,
                },
                received = reg.recv_from(&mut reg_buf) => deliver(&daemon, Line::Reg, received, &reg_buf),
                received = recv_optional(ping.as_ref(), &mut ping_buf) => {
                    deliver(&daemon, Line::Ping, received, &ping_buf)
                }
            }
        }
        log::debug!("np: worker stopped");
    });
}
