//! TCP front-end
//!
//! Listens on the configured loopback port and speaks the line-delimited
//! JSON protocol: each connection gets a reader that parses and routes
//! packets and a writer task that drains the registry's bounded outbound
//! queue. The current state is sent immediately after accept as the
//! handshake. Validation failures answer an `error` response and keep the
//! connection open.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task;
use tracing::{debug, error, info, warn};

use nab_common::{
    ErrorClass, Frame, ModeKind, Packet, RabbitState, Response, ShutdownMode,
};

use crate::registry::{WriterId, WriterRegistry};
use crate::scheduler::{SchedulerHandle, SchedulerMsg, WorkItem};

/// TCP server accepting writer connections
pub struct IpcServer {
    addr: String,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl IpcServer {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into(), shutdown_tx: None }
    }

    /// Bind and start accepting; returns the bound address (useful when the
    /// configured port is 0).
    pub async fn start(
        &mut self,
        registry: Arc<WriterRegistry>,
        scheduler: SchedulerHandle,
        state_rx: watch::Receiver<RabbitState>,
    ) -> std::io::Result<SocketAddr> {
        let listener = TcpListener::bind(&self.addr).await?;
        let local_addr = listener.local_addr()?;
        info!("front-end listening on {}", local_addr);

        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel();
        self.shutdown_tx = Some(shutdown_tx);

        task::spawn(async move {
            loop {
                tokio::select! {
                    connection = listener.accept() => {
                        match connection {
                            Ok((stream, peer)) => {
                                debug!("writer connected from {}", peer);
                                let registry = Arc::clone(&registry);
                                let scheduler = scheduler.clone();
                                let state_rx = state_rx.clone();
                                task::spawn(async move {
                                    handle_writer(stream, registry, scheduler, state_rx).await;
                                });
                            }
                            Err(e) => {
                                error!("error accepting connection: {}", e);
                            }
                        }
                    }
                    _ = &mut shutdown_rx => {
                        info!("front-end shutting down");
                        break;
                    }
                }
            }
        });

        Ok(local_addr)
    }

    pub async fn shutdown(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
    }
}

/// One connection: register, handshake, then read/route until EOF.
async fn handle_writer(
    stream: TcpStream,
    registry: Arc<WriterRegistry>,
    scheduler: SchedulerHandle,
    state_rx: watch::Receiver<RabbitState>,
) {
    let (id, mut outbound) = registry.register().await;
    let (read_half, mut write_half) = stream.into_split();

    // Writer side: drain the bounded outbound queue. The registry closing
    // the channel (disconnect or overflow) ends the connection.
    let writer_task = task::spawn(async move {
        while let Some(mut line) = outbound.recv().await {
            line.push('\n');
            if write_half.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    // Handshake: the current state, before anything else
    let current_state = *state_rx.borrow();
    registry.send(id, &Frame::State { state: current_state }).await;

    let mut lines = BufReader::new(read_half).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Packet>(line) {
                    Ok(packet) => route_packet(id, packet, &registry, &scheduler).await,
                    Err(e) => {
                        warn!("writer {} sent invalid packet: {}", id, e);
                        let response = invalid_packet_response(line, &e);
                        registry.send(id, &Frame::Response(response)).await;
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!("writer {} read error: {}", id, e);
                break;
            }
        }
    }

    debug!("writer {} disconnected", id);
    registry.unregister(id).await;
    scheduler.writer_gone(id).await;
    writer_task.abort();
}

/// Dispatch one validated packet.
async fn route_packet(
    id: WriterId,
    packet: Packet,
    registry: &Arc<WriterRegistry>,
    scheduler: &SchedulerHandle,
) {
    match packet {
        Packet::Command { request_id, sequence, cancelable, expiration } => {
            if let Err(response) = validate_items(&sequence, &request_id) {
                registry.send(id, &Frame::Response(response)).await;
                return;
            }
            scheduler
                .submit(WorkItem::Command {
                    sequence,
                    cancelable: cancelable.unwrap_or(true),
                    expiration,
                    origin: id,
                    request_id,
                })
                .await;
        }
        Packet::Message { request_id, signature, body, cancelable, expiration } => {
            if let Err(response) = validate_items(&body, &request_id) {
                registry.send(id, &Frame::Response(response)).await;
                return;
            }
            if let Some(signature) = &signature {
                if signature.is_empty() {
                    let response = Response::error(
                        request_id,
                        ErrorClass::InvalidPacket,
                        "signature item carries neither audio nor choreography",
                    );
                    registry.send(id, &Frame::Response(response)).await;
                    return;
                }
            }
            scheduler
                .submit(WorkItem::Message {
                    signature,
                    body,
                    cancelable: cancelable.unwrap_or(true),
                    expiration,
                    origin: id,
                    request_id,
                })
                .await;
        }
        Packet::Mode { request_id, mode, events } => {
            if let Some(events) = events {
                registry.set_subscriptions(id, events).await;
            }
            match mode {
                Some(ModeKind::Interactive) => {
                    scheduler.submit(WorkItem::ModeSwitch { origin: id, request_id }).await;
                }
                Some(ModeKind::Idle) => {
                    scheduler
                        .send(SchedulerMsg::ReleaseInteractive { origin: id, request_id })
                        .await;
                }
                None => {
                    if request_id.is_some() {
                        registry.send(id, &Frame::Response(Response::ok(request_id))).await;
                    }
                }
            }
        }
        Packet::Info { request_id, info_id, animation } => match (info_id, animation) {
            (Some(info_id), Some(animation)) => {
                if let Err(message) = animation.validate() {
                    let response =
                        Response::error(request_id, ErrorClass::InvalidParameter, message);
                    registry.send(id, &Frame::Response(response)).await;
                    return;
                }
                scheduler.send(SchedulerMsg::PublishInfo { info_id, animation }).await;
                if request_id.is_some() {
                    registry.send(id, &Frame::Response(Response::ok(request_id))).await;
                }
            }
            (Some(info_id), None) => {
                scheduler.send(SchedulerMsg::RevokeInfo { info_id }).await;
                if request_id.is_some() {
                    registry.send(id, &Frame::Response(Response::ok(request_id))).await;
                }
            }
            (None, _) => {
                if request_id.is_some() {
                    scheduler.send(SchedulerMsg::InfoQuery { origin: id, request_id }).await;
                } else {
                    debug!("bare info without request_id ignored");
                }
            }
        },
        Packet::Sleep { request_id } => {
            scheduler.submit(WorkItem::Sleep { origin: id, request_id }).await;
        }
        Packet::Wakeup { request_id } => {
            scheduler.send(SchedulerMsg::Wakeup { origin: id, request_id }).await;
        }
        Packet::Cancel { request_id } => {
            scheduler.send(SchedulerMsg::Cancel { origin: id, target: request_id }).await;
        }
        Packet::Test { request_id, test } => {
            scheduler.submit(WorkItem::Test { which: test, origin: id, request_id }).await;
        }
        Packet::Gestalt { request_id } => {
            scheduler.send(SchedulerMsg::Gestalt { origin: id, request_id }).await;
        }
        Packet::RfidWrite { request_id, tech, uid, picture, app, data, timeout } => {
            scheduler
                .submit(WorkItem::RfidWrite {
                    tech,
                    uid,
                    picture,
                    app,
                    data,
                    timeout,
                    origin: id,
                    request_id,
                })
                .await;
        }
        Packet::ConfigUpdate { request_id, service, slot } => {
            if slot.is_some() {
                debug!("config-update slot payload ignored for service '{}'", service);
            }
            scheduler.submit(WorkItem::ConfigUpdate { service, origin: id, request_id }).await;
        }
        Packet::Shutdown { request_id, mode } => {
            scheduler
                .submit(WorkItem::Shutdown {
                    mode: mode.unwrap_or(ShutdownMode::Halt),
                    origin: id,
                    request_id,
                })
                .await;
        }
    }
}

fn validate_items(
    items: &[nab_common::CommandItem],
    request_id: &Option<String>,
) -> Result<(), Response> {
    if items.is_empty() {
        return Err(Response::error(
            request_id.clone(),
            ErrorClass::MissingField,
            "sequence is empty",
        ));
    }
    if items.iter().any(|item| item.is_empty()) {
        return Err(Response::error(
            request_id.clone(),
            ErrorClass::InvalidPacket,
            "command item carries neither audio nor choreography",
        ));
    }
    Ok(())
}

/// Build the error response for an unparseable line, recovering the
/// request_id when the line is at least valid JSON.
fn invalid_packet_response(line: &str, error: &serde_json::Error) -> Response {
    let request_id = serde_json::from_str::<serde_json::Value>(line)
        .ok()
        .and_then(|v| v.get("request_id").and_then(|id| id.as_str()).map(str::to_string));

    Response::error(request_id, classify_parse_error(error), error.to_string())
}

fn classify_parse_error(error: &serde_json::Error) -> ErrorClass {
    if error.is_syntax() || error.is_eof() {
        return ErrorClass::ProtocolError;
    }
    let message = error.to_string();
    if message.contains("unknown variant") {
        // Unrecognized packet type
        ErrorClass::ProtocolError
    } else if message.contains("missing field") {
        ErrorClass::MissingField
    } else if message.contains("out of range")
        || message.contains("invalid color")
        || message.contains("invalid tag uid")
    {
        ErrorClass::InvalidParameter
    } else {
        ErrorClass::InvalidPacket
    }
}
