//! Broadcast server: the TCP listener, the client registry, and the
//! frame-driven fan-out.
//!
//! All command execution, and therefore all catalog mutation, happens
//! on the single server task. Pipeline workers signal frame completion
//! through the wakeup channel (`Z` depth, `V` video, `K` shutdown in
//! the wire protocol's terms); the server walks its subscribers and
//! queues differential updates into per-client outboxes. Socket I/O
//! lives in per-client reader/writer tasks, so nothing here ever blocks
//! on a slow peer.

mod client;
mod commands;

pub use client::{format_peer, PARSE_BUF_MAX};
pub use commands::PROTOCOL_VERSION;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::{Context, Result};
use core_engine::FpsCounter;
use core_sensor::{LedClock, SensorCommands};
use core_zones::ZoneCatalog;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use client::{spawn_reader, spawn_writer, ClientEvent, Outbound, OUTBOX_DEPTH};

/// Byte codes carried by the wakeup channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wakeup {
    /// A depth frame finished processing.
    Depth,
    /// A video frame finished processing.
    Video,
    /// Stop the server loop.
    Shutdown,
}

/// Everything the command handlers and fan-out need to reach.
#[derive(Clone)]
pub struct ServerContext {
    pub catalog: Arc<ZoneCatalog>,
    pub commands: Arc<SensorCommands>,
    pub led: Arc<LedClock>,
    pub fps: Arc<FpsCounter>,
    /// Latest completed depth frame, copied in by the depth worker.
    pub depth_frame: Arc<StdMutex<Vec<u8>>>,
    /// Latest completed video frame, copied in by the video worker.
    pub video_frame: Arc<StdMutex<Vec<u8>>>,
    pub app_version: &'static str,
}

/// Cheap cloneable handle for waking the server from worker threads.
#[derive(Clone)]
pub struct ServerHandle {
    tx: mpsc::UnboundedSender<Wakeup>,
}

impl ServerHandle {
    pub fn notify_depth(&self) {
        let _ = self.tx.send(Wakeup::Depth);
    }

    pub fn notify_video(&self) {
        let _ = self.tx.send(Wakeup::Video);
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(Wakeup::Shutdown);
    }
}

pub(crate) struct Client {
    peer: String,
    outbox: mpsc::Sender<Outbound>,
    subglobal: bool,
    subdepth: bool,
    subvideo: bool,
    subbright: bool,
    /// Remaining depth frames; 0 or less means unlimited.
    depth_budget: i32,
    shutting_down: bool,
    /// Outbox overflowed or task died; reaped after the current pass.
    dead: bool,
}

pub(crate) struct ServerState {
    pub(crate) ctx: ServerContext,
    pub(crate) clients: HashMap<u64, Client>,
}

impl ServerState {
    /// Queue an outbound message. A client that cannot absorb it is
    /// marked dead and reaped after the current pass.
    pub(crate) fn push(&mut self, id: u64, out: Outbound) {
        if let Some(client) = self.clients.get_mut(&id) {
            if client.outbox.try_send(out).is_err() {
                warn!(target: "server.client", id, peer = client.peer.as_str(), "outbox_overflow");
                client.dead = true;
            }
        }
    }

    pub(crate) fn push_line(&mut self, id: u64, line: String) {
        self.push(id, Outbound::Line(line));
    }

    /// Send a line to every global subscriber.
    pub(crate) fn broadcast_global(&mut self, line: String) {
        let ids: Vec<u64> = self
            .clients
            .iter()
            .filter(|(_, c)| c.subglobal && !c.shutting_down)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            self.push_line(id, line.clone());
        }
    }

    /// Full record line for one zone, if it exists.
    pub(crate) fn record_of(&self, name: &str) -> Option<String> {
        let g = self.ctx.catalog.lock();
        g.zones()
            .iter()
            .find(|z| z.name.eq_ignore_ascii_case(name))
            .map(|z| z.format_record(true))
    }

    fn reap_dead(&mut self) {
        let dead: Vec<u64> = self
            .clients
            .iter()
            .filter(|(_, c)| c.dead)
            .map(|(id, _)| *id)
            .collect();
        for id in dead {
            self.drop_client(id);
        }
    }

    fn drop_client(&mut self, id: u64) {
        if let Some(client) = self.clients.remove(&id) {
            info!(target: "server.client", id, peer = client.peer.as_str(), "client_dropped");
        }
        self.refresh_video_demand();
    }

    /// The color stream runs while anyone wants frames or brightness;
    /// it stops only when the last interested client is served or gone.
    fn refresh_video_demand(&mut self) {
        let wanted = self
            .clients
            .values()
            .any(|c| (c.subvideo || c.subbright) && !c.dead);
        self.ctx.commands.set_video_requested(wanted);
    }
}

pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    wakeup_rx: mpsc::UnboundedReceiver<Wakeup>,
    handle: ServerHandle,
    events_tx: mpsc::Sender<ClientEvent>,
    events_rx: mpsc::Receiver<ClientEvent>,
    state: ServerState,
    next_id: u64,
}

impl Server {
    /// Bind the dual-stack listener. On Linux the IPv6 any-address
    /// accepts IPv4 peers as mapped addresses.
    pub async fn bind(port: u16, ctx: ServerContext) -> Result<Server> {
        let listener = match TcpListener::bind(("::", port)).await {
            Ok(l) => l,
            Err(e) => {
                // Hosts without IPv6 still get a listener, just not a
                // dual-stack one.
                warn!(target: "server", error = %e, "ipv6_bind_failed_falling_back");
                TcpListener::bind(("0.0.0.0", port))
                    .await
                    .with_context(|| format!("bind TCP port {port}"))?
            }
        };
        let local_addr = listener.local_addr().context("listener local address")?;
        info!(target: "server", %local_addr, "listening");
        let (wakeup_tx, wakeup_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::channel(1024);
        Ok(Server {
            listener,
            local_addr,
            wakeup_rx,
            handle: ServerHandle { tx: wakeup_tx },
            events_tx,
            events_rx,
            state: ServerState {
                ctx,
                clients: HashMap::new(),
            },
            next_id: 1,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    /// The server event loop. Runs until a shutdown wakeup arrives.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => self.register(stream, addr),
                    Err(e) => warn!(target: "server", error = %e, "accept_failed"),
                },
                Some(event) = self.events_rx.recv() => {
                    self.handle_client_event(event);
                    self.state.reap_dead();
                }
                wakeup = self.wakeup_rx.recv() => {
                    let Some(first) = wakeup else { break };
                    // Coalesce everything already queued; a burst of
                    // frames becomes one pass per stream.
                    let mut depth = first == Wakeup::Depth;
                    let mut video = first == Wakeup::Video;
                    let mut stop = first == Wakeup::Shutdown;
                    while let Ok(w) = self.wakeup_rx.try_recv() {
                        match w {
                            Wakeup::Depth => depth = true,
                            Wakeup::Video => video = true,
                            Wakeup::Shutdown => stop = true,
                        }
                    }
                    if stop {
                        break;
                    }
                    if depth {
                        self.handle_depth_tick();
                    }
                    if video {
                        self.handle_video_tick();
                    }
                    self.state.reap_dead();
                }
            }
        }
        info!(target: "server", clients = self.state.clients.len(), "server_stopping");
        let ids: Vec<u64> = self.state.clients.keys().copied().collect();
        for id in ids {
            self.state.push(id, Outbound::Shutdown);
        }
    }

    fn register(&mut self, stream: TcpStream, addr: SocketAddr) {
        let id = self.next_id;
        self.next_id += 1;
        let peer = format_peer(addr);
        info!(target: "server.client", id, peer = peer.as_str(), "client_connected");
        let _ = stream.set_nodelay(true);
        let (read, write) = stream.into_split();
        let (outbox_tx, outbox_rx) = mpsc::channel(OUTBOX_DEPTH);
        spawn_reader(id, read, self.events_tx.clone());
        spawn_writer(id, write, outbox_rx, self.events_tx.clone());
        self.state.clients.insert(
            id,
            Client {
                peer,
                outbox: outbox_tx,
                subglobal: false,
                subdepth: false,
                subvideo: false,
                subbright: false,
                depth_budget: 0,
                shutting_down: false,
                dead: false,
            },
        );
    }

    fn handle_client_event(&mut self, event: ClientEvent) {
        match event {
            ClientEvent::Line(id, line) => {
                let active = self
                    .state
                    .clients
                    .get(&id)
                    .is_some_and(|c| !c.shutting_down);
                if active {
                    commands::execute(&mut self.state, id, &line);
                }
            }
            ClientEvent::Overflow(id) => {
                debug!(target: "server.client", id, "inbound_overflow");
                self.state.push_line(id, "ERR - Buffer overflow".to_string());
                self.state.push_line(
                    id,
                    format!("ERR - Commands are limited to {PARSE_BUF_MAX} bytes"),
                );
                self.state
                    .push_line(id, "ERR - Closing connection".to_string());
                if let Some(client) = self.state.clients.get_mut(&id) {
                    client.shutting_down = true;
                }
                self.state.push(id, Outbound::Shutdown);
            }
            ClientEvent::Gone(id) => self.state.drop_client(id),
        }
    }

    /// Depth wakeup: differential SUB lines, then depth payloads, then
    /// the catalog touch that arms the next differential.
    fn handle_depth_tick(&mut self) {
        let sub_lines: Vec<String> = {
            let g = self.state.ctx.catalog.lock();
            g.zones()
                .iter()
                .filter(|z| z.lastpop != z.pop || z.lastoccupied != z.occupied || z.new_zone)
                .map(|z| format!("SUB - {}", z.format_record(z.new_zone)))
                .collect()
        };
        let mut depth_blob: Option<Arc<Vec<u8>>> = None;
        let ids: Vec<u64> = self.state.clients.keys().copied().collect();
        for id in ids {
            let (subglobal, subdepth, shutting_down) = match self.state.clients.get(&id) {
                Some(c) => (c.subglobal, c.subdepth, c.shutting_down),
                None => continue,
            };
            if shutting_down {
                continue;
            }
            if subglobal {
                for line in &sub_lines {
                    self.state.push_line(id, line.clone());
                }
            }
            if subdepth {
                let blob = depth_blob
                    .get_or_insert_with(|| {
                        Arc::new(
                            self.state
                                .ctx
                                .depth_frame
                                .lock()
                                .unwrap_or_else(|e| e.into_inner())
                                .clone(),
                        )
                    })
                    .clone();
                let header = format!("DEPTH - {} bytes of depth data follow newline", blob.len());
                self.state.push(id, Outbound::Blob(header, blob));
                self.state.ctx.led.note_depth_pull();
                if let Some(client) = self.state.clients.get_mut(&id) {
                    if client.depth_budget > 0 {
                        client.depth_budget -= 1;
                        if client.depth_budget == 0 {
                            client.subdepth = false;
                        }
                    }
                }
            }
        }
        self.state.ctx.catalog.touch();
    }

    /// Video wakeup: brightness one-shots, then video payloads.
    fn handle_video_tick(&mut self) {
        let mut bright_lines: Option<Vec<String>> = None;
        let mut video_blob: Option<Arc<Vec<u8>>> = None;
        let ids: Vec<u64> = self.state.clients.keys().copied().collect();
        for id in ids {
            let (subbright, subvideo, shutting_down) = match self.state.clients.get(&id) {
                Some(c) => (c.subbright, c.subvideo, c.shutting_down),
                None => continue,
            };
            if shutting_down {
                continue;
            }
            if subbright {
                let lines = bright_lines.get_or_insert_with(|| {
                    let g = self.state.ctx.catalog.lock();
                    g.zones()
                        .iter()
                        .map(|z| {
                            format!("BRIGHT - bright={} name=\"{}\"", z.bright(), z.name)
                        })
                        .collect()
                });
                for line in lines.clone() {
                    self.state.push_line(id, line);
                }
                if let Some(client) = self.state.clients.get_mut(&id) {
                    client.subbright = false;
                }
            }
            if subvideo {
                let blob = video_blob
                    .get_or_insert_with(|| {
                        Arc::new(
                            self.state
                                .ctx
                                .video_frame
                                .lock()
                                .unwrap_or_else(|e| e.into_inner())
                                .clone(),
                        )
                    })
                    .clone();
                let header = format!("VIDEO - {} bytes of video data follow newline", blob.len());
                self.state.push(id, Outbound::Blob(header, blob));
                self.state.ctx.led.note_video_pull();
                if let Some(client) = self.state.clients.get_mut(&id) {
                    client.subvideo = false;
                }
            }
        }
        self.state.refresh_video_demand();
    }
}
