//! Per-connection plumbing: one reader task splitting the inbound byte
//! stream into protocol lines, one writer task draining the outbound
//! queue. The central server task never touches a socket directly, so
//! no client can stall command execution or frame fan-out.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Hard cap on one inbound line; beyond this the connection is shut.
pub const PARSE_BUF_MAX: usize = 131_072;

/// Queue depth of a client's outbound channel. A client that cannot
/// drain this many pending messages is dropped rather than allowed to
/// hold frame memory hostage.
pub const OUTBOX_DEPTH: usize = 256;

/// Messages the server queues toward one client.
#[derive(Debug)]
pub enum Outbound {
    /// One protocol line; the writer appends the newline.
    Line(String),
    /// Announcement line followed by exactly the raw payload bytes.
    Blob(String, Arc<Vec<u8>>),
    /// Flush what was queued before this and half-close.
    Shutdown,
}

/// What the per-client tasks report back to the server task.
#[derive(Debug)]
pub enum ClientEvent {
    Line(u64, String),
    /// Inbound line overflowed [`PARSE_BUF_MAX`] without a terminator.
    Overflow(u64),
    /// EOF, socket error, or writer exit; unlink the client.
    Gone(u64),
}

/// Render a peer address; IPv4 clients on the dual-stack listener show
/// as dotted quads instead of `::ffff:` forms.
pub fn format_peer(addr: SocketAddr) -> String {
    match addr.ip() {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => format!("{}:{}", v4, addr.port()),
            None => addr.to_string(),
        },
        IpAddr::V4(_) => addr.to_string(),
    }
}

pub fn spawn_reader(id: u64, mut read: OwnedReadHalf, events: mpsc::Sender<ClientEvent>) {
    tokio::spawn(async move {
        let mut line = Vec::with_capacity(256);
        let mut chunk = [0u8; 4096];
        'io: loop {
            let n = match read.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            for &b in &chunk[..n] {
                if b == b'\r' || b == b'\n' {
                    if !line.is_empty() {
                        let text = String::from_utf8_lossy(&line).into_owned();
                        line.clear();
                        if events.send(ClientEvent::Line(id, text)).await.is_err() {
                            break 'io;
                        }
                    }
                } else {
                    line.push(b);
                    if line.len() > PARSE_BUF_MAX {
                        debug!(target: "server.client", id, "line_overflow");
                        let _ = events.send(ClientEvent::Overflow(id)).await;
                        return;
                    }
                }
            }
        }
        trace!(target: "server.client", id, "reader_done");
        let _ = events.send(ClientEvent::Gone(id)).await;
    });
}

pub fn spawn_writer(
    id: u64,
    mut write: OwnedWriteHalf,
    mut outbox: mpsc::Receiver<Outbound>,
    events: mpsc::Sender<ClientEvent>,
) {
    tokio::spawn(async move {
        while let Some(out) = outbox.recv().await {
            let result = match out {
                Outbound::Line(s) => write_line(&mut write, &s).await,
                Outbound::Blob(header, data) => {
                    match write_line(&mut write, &header).await {
                        Ok(()) => write.write_all(&data).await,
                        Err(e) => Err(e),
                    }
                }
                Outbound::Shutdown => {
                    let _ = write.flush().await;
                    let _ = write.shutdown().await;
                    break;
                }
            };
            if result.is_err() {
                break;
            }
        }
        trace!(target: "server.client", id, "writer_done");
        let _ = events.send(ClientEvent::Gone(id)).await;
    });
}

async fn write_line(write: &mut OwnedWriteHalf, line: &str) -> std::io::Result<()> {
    write.write_all(line.as_bytes()).await?;
    write.write_all(b"\n").await
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn mapped_v4_peers_render_as_dotted_quads() {
        let addr: SocketAddr = "[::ffff:192.0.2.7]:4242".parse().unwrap();
        assert_eq!(format_peer(addr), "192.0.2.7:4242");
        let addr: SocketAddr = "[2001:db8::1]:80".parse().unwrap();
        assert_eq!(format_peer(addr), "[2001:db8::1]:80");
        let addr: SocketAddr = "127.0.0.1:99".parse().unwrap();
        assert_eq!(format_peer(addr), "127.0.0.1:99");
    }
}
