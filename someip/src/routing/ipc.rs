//! Local inter-process transport for the routing manager: a host role
//! listens on a unix-domain stream socket (the "routing root"), a client
//! role dials it, and every [`Command`]/[`ClientEvent`] that would
//! otherwise cross an in-process `mpsc` channel is framed onto the wire
//! instead with [`someip_proto::CommandFrame`]. Mirrors the split between
//! vsomeip's `routing_manager_stub` (host side, here [`run_host_listener`])
//! and `routing_manager_proxy` (client side, here [`run_client_session`]).
//!
//! Only reachable with [`crate::Config::routing_root_path`] set: the
//! default keeps the single-process fast path of a client role driving an
//! in-process host directly.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rustc_hash::FxHashMap;
use someip_proto::{
    ClientId, CommandCode, CommandFrame, EventId, EventgroupId, InstanceId, MajorVersion, MethodId, MinorVersion, ServiceId, Ttl,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::RoutingError;
use crate::routing::command::{ClientEvent, Command};

async fn write_frame(w: &mut (impl AsyncWrite + Unpin), frame: &CommandFrame) -> std::io::Result<()> {
    let mut buf = BytesMut::with_capacity(someip_proto::ipc::HEADER_LEN + frame.payload.len());
    frame.encode(&mut buf);
    w.write_all(&buf).await
}

/// Reads one frame, buffering partial reads across calls in `buf`. Returns
/// `Ok(None)` on a clean EOF.
async fn read_frame(r: &mut (impl AsyncRead + Unpin), buf: &mut BytesMut) -> std::io::Result<Option<CommandFrame>> {
    loop {
        if let Some(len) = CommandFrame::peek_payload_len(&buf[..]) {
            let total = someip_proto::ipc::HEADER_LEN + len as usize;
            if buf.len() >= total {
                let mut framed = buf.split_to(total).freeze();
                return CommandFrame::decode(&mut framed)
                    .map(Some)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()));
            }
        }
        if buf.capacity() - buf.len() < 4096 {
            buf.reserve(8192);
        }
        if r.read_buf(buf).await? == 0 {
            return Ok(None);
        }
    }
}

fn timed_out(what: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::TimedOut, format!("{what} timed out"))
}

fn protocol_error(what: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, what.to_string())
}

fn closed(what: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::UnexpectedEof, format!("routing root closed during {what}"))
}

// --- payload codecs -------------------------------------------------------
//
// Plain big-endian fields, the same way `someip_proto::header` lays out the
// wire PDU header; these never leave the local machine, so there's no
// interop concern to design for beyond a stable shape the two ends agree
// on.

fn encode_offer(service: ServiceId, instance: InstanceId, major: MajorVersion, minor: MinorVersion, ttl: Ttl, reliable: bool, unreliable: bool) -> Bytes {
    let mut out = BytesMut::with_capacity(15);
    out.put_u16(service.get());
    out.put_u16(instance.get());
    out.put_u8(major.0);
    out.put_u32(minor.0);
    out.put_u32(ttl.0);
    out.put_u8(reliable as u8);
    out.put_u8(unreliable as u8);
    out.freeze()
}

fn decode_offer(mut p: Bytes) -> Option<(ServiceId, InstanceId, MajorVersion, MinorVersion, Ttl, bool, bool)> {
    if p.remaining() < 15 {
        return None;
    }
    Some((
        ServiceId(p.get_u16()),
        InstanceId(p.get_u16()),
        MajorVersion(p.get_u8()),
        MinorVersion(p.get_u32()),
        Ttl(p.get_u32()),
        p.get_u8() != 0,
        p.get_u8() != 0,
    ))
}

fn encode_service_instance(service: ServiceId, instance: InstanceId) -> Bytes {
    let mut out = BytesMut::with_capacity(4);
    out.put_u16(service.get());
    out.put_u16(instance.get());
    out.freeze()
}

fn decode_service_instance(mut p: Bytes) -> Option<(ServiceId, InstanceId)> {
    if p.remaining() < 4 {
        return None;
    }
    Some((ServiceId(p.get_u16()), InstanceId(p.get_u16())))
}

fn encode_request_service(service: ServiceId, instance: InstanceId, major: MajorVersion, minor: MinorVersion) -> Bytes {
    let mut out = BytesMut::with_capacity(9);
    out.put_u16(service.get());
    out.put_u16(instance.get());
    out.put_u8(major.0);
    out.put_u32(minor.0);
    out.freeze()
}

fn decode_request_service(mut p: Bytes) -> Option<(ServiceId, InstanceId, MajorVersion, MinorVersion)> {
    if p.remaining() < 9 {
        return None;
    }
    Some((ServiceId(p.get_u16()), InstanceId(p.get_u16()), MajorVersion(p.get_u8()), MinorVersion(p.get_u32())))
}

fn encode_create_eventgroup(service: ServiceId, instance: InstanceId, eventgroup: EventgroupId, major: MajorVersion, ttl: Ttl) -> Bytes {
    let mut out = BytesMut::with_capacity(11);
    out.put_u16(service.get());
    out.put_u16(instance.get());
    out.put_u16(eventgroup.get());
    out.put_u8(major.0);
    out.put_u32(ttl.0);
    out.freeze()
}

fn decode_create_eventgroup(mut p: Bytes) -> Option<(ServiceId, InstanceId, EventgroupId, MajorVersion, Ttl)> {
    if p.remaining() < 11 {
        return None;
    }
    Some((
        ServiceId(p.get_u16()),
        InstanceId(p.get_u16()),
        EventgroupId(p.get_u16()),
        MajorVersion(p.get_u8()),
        Ttl(p.get_u32()),
    ))
}

fn encode_add_event(service: ServiceId, instance: InstanceId, eventgroup: EventgroupId, event: EventId, reliable: bool) -> Bytes {
    let mut out = BytesMut::with_capacity(9);
    out.put_u16(service.get());
    out.put_u16(instance.get());
    out.put_u16(eventgroup.get());
    out.put_u16(event.get());
    out.put_u8(reliable as u8);
    out.freeze()
}

fn decode_add_event(mut p: Bytes) -> Option<(ServiceId, InstanceId, EventgroupId, EventId, bool)> {
    if p.remaining() < 9 {
        return None;
    }
    Some((
        ServiceId(p.get_u16()),
        InstanceId(p.get_u16()),
        EventgroupId(p.get_u16()),
        EventId(p.get_u16()),
        p.get_u8() != 0,
    ))
}

fn encode_subscribe(service: ServiceId, instance: InstanceId, eventgroup: EventgroupId, major: MajorVersion) -> Bytes {
    let mut out = BytesMut::with_capacity(7);
    out.put_u16(service.get());
    out.put_u16(instance.get());
    out.put_u16(eventgroup.get());
    out.put_u8(major.0);
    out.freeze()
}

fn decode_subscribe(mut p: Bytes) -> Option<(ServiceId, InstanceId, EventgroupId, MajorVersion)> {
    if p.remaining() < 7 {
        return None;
    }
    Some((ServiceId(p.get_u16()), InstanceId(p.get_u16()), EventgroupId(p.get_u16()), MajorVersion(p.get_u8())))
}

fn encode_unsubscribe(service: ServiceId, instance: InstanceId, eventgroup: EventgroupId) -> Bytes {
    let mut out = BytesMut::with_capacity(6);
    out.put_u16(service.get());
    out.put_u16(instance.get());
    out.put_u16(eventgroup.get());
    out.freeze()
}

fn decode_unsubscribe(mut p: Bytes) -> Option<(ServiceId, InstanceId, EventgroupId)> {
    if p.remaining() < 6 {
        return None;
    }
    Some((ServiceId(p.get_u16()), InstanceId(p.get_u16()), EventgroupId(p.get_u16())))
}

fn encode_notify(service: ServiceId, instance: InstanceId, event: EventId, payload: Bytes) -> Bytes {
    let mut out = BytesMut::with_capacity(6 + payload.len());
    out.put_u16(service.get());
    out.put_u16(instance.get());
    out.put_u16(event.get());
    out.extend_from_slice(&payload);
    out.freeze()
}

fn decode_notify(mut p: Bytes) -> Option<(ServiceId, InstanceId, EventId, Bytes)> {
    if p.remaining() < 6 {
        return None;
    }
    let service = ServiceId(p.get_u16());
    let instance = InstanceId(p.get_u16());
    let event = EventId(p.get_u16());
    Some((service, instance, event, p))
}

fn encode_send(service: ServiceId, instance: InstanceId, method: MethodId, payload: Bytes) -> Bytes {
    let mut out = BytesMut::with_capacity(6 + payload.len());
    out.put_u16(service.get());
    out.put_u16(instance.get());
    out.put_u16(method.get());
    out.extend_from_slice(&payload);
    out.freeze()
}

fn decode_send(mut p: Bytes) -> Option<(ServiceId, InstanceId, MethodId, Bytes)> {
    if p.remaining() < 6 {
        return None;
    }
    let service = ServiceId(p.get_u16());
    let instance = InstanceId(p.get_u16());
    let method = MethodId(p.get_u16());
    Some((service, instance, method, p))
}

/// `RoutingInfo` payload: one byte of kind, then the kind's body. Only
/// carries the two local-availability transitions the in-process
/// `ClientEvent` enum itself can express; it isn't a general client/service
/// directory the way vsomeip's own `ROUTING_INFO` entries are.
fn encode_availability(available: bool, service: ServiceId, instance: InstanceId) -> Bytes {
    let mut out = BytesMut::with_capacity(5);
    out.put_u8(if available { 0 } else { 1 });
    out.put_u16(service.get());
    out.put_u16(instance.get());
    out.freeze()
}

fn decode_availability(mut p: Bytes) -> Option<(bool, ServiceId, InstanceId)> {
    if p.remaining() < 5 {
        return None;
    }
    let available = p.get_u8() == 0;
    Some((available, ServiceId(p.get_u16()), InstanceId(p.get_u16())))
}

// --- client role ------------------------------------------------------

/// Offer state replayed verbatim after a reconnect, since the host side
/// has no memory of a connection that dropped.
#[derive(Debug, Clone, Copy)]
struct OfferState {
    major: MajorVersion,
    minor: MinorVersion,
    ttl: Ttl,
    reliable: bool,
    unreliable: bool,
}

/// Drives the client role's connection to a routing root: dial, register,
/// proxy commands out and events in, and on disconnect fall back to
/// `DEREGISTERED` and keep retrying. Runs for the lifetime of the
/// [`crate::RoutingManagerClient`] handle that owns `commands_rx`'s sender.
pub(crate) async fn run_client_session(path: PathBuf, mut commands_rx: mpsc::Receiver<Command>, assign_timeout: Duration, register_timeout: Duration) {
    let mut registered: FxHashMap<ClientId, mpsc::Sender<ClientEvent>> = FxHashMap::default();
    let mut active_offers: HashMap<(ServiceId, InstanceId), OfferState> = HashMap::new();
    let mut active_eventgroups: Vec<(ServiceId, InstanceId, EventgroupId, MajorVersion, Ttl)> = Vec::new();
    let mut active_events: Vec<(ServiceId, InstanceId, EventgroupId, EventId, bool)> = Vec::new();
    let mut active_subscriptions: HashMap<(ClientId, ServiceId, InstanceId, EventgroupId), MajorVersion> = HashMap::new();

    loop {
        if commands_rx.is_closed() {
            return;
        }
        match connect_and_register(&path, assign_timeout, register_timeout).await {
            Ok((stream, client_id, leftover)) => {
                debug!(path = %path.display(), client = %client_id, "routing root connected and registered");
                run_connected(
                    stream,
                    leftover,
                    client_id,
                    &mut commands_rx,
                    &mut registered,
                    &mut active_offers,
                    &mut active_subscriptions,
                    &mut active_eventgroups,
                    &mut active_events,
                )
                .await;
                warn!(path = %path.display(), "local routing connection lost, reverting to DEREGISTERED and retrying");
            }
            Err(e) => {
                warn!(error = %e, path = %path.display(), "failed to reach routing root");
            }
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

async fn connect_and_register(path: &Path, assign_timeout: Duration, register_timeout: Duration) -> std::io::Result<(UnixStream, ClientId, BytesMut)> {
    let mut stream = UnixStream::connect(path).await?;
    let mut buf = BytesMut::with_capacity(256);

    let assign = CommandFrame {
        code: CommandCode::AssignClient,
        client: 0,
        payload: Bytes::new(),
    };
    write_frame(&mut stream, &assign).await?;
    let ack = tokio::time::timeout(assign_timeout, read_frame(&mut stream, &mut buf))
        .await
        .map_err(|_| timed_out("ASSIGN_CLIENT_ACK"))??
        .ok_or_else(|| closed("ASSIGN_CLIENT"))?;
    if ack.code != CommandCode::AssignClientAck {
        return Err(protocol_error("expected ASSIGN_CLIENT_ACK"));
    }
    let client_id = ClientId(ack.client);

    let register = CommandFrame {
        code: CommandCode::RegisterApplication,
        client: client_id.get(),
        payload: Bytes::new(),
    };
    write_frame(&mut stream, &register).await?;
    let registered_ack = tokio::time::timeout(register_timeout, read_frame(&mut stream, &mut buf))
        .await
        .map_err(|_| timed_out("REGISTERED_ACK"))??
        .ok_or_else(|| closed("REGISTER_APPLICATION"))?;
    if registered_ack.code != CommandCode::RegisteredAck {
        return Err(protocol_error("expected REGISTERED_ACK"));
    }

    Ok((stream, client_id, buf))
}

#[allow(clippy::too_many_arguments)]
async fn run_connected(
    stream: UnixStream,
    leftover: BytesMut,
    my_client_id: ClientId,
    commands_rx: &mut mpsc::Receiver<Command>,
    registered: &mut FxHashMap<ClientId, mpsc::Sender<ClientEvent>>,
    active_offers: &mut HashMap<(ServiceId, InstanceId), OfferState>,
    active_subscriptions: &mut HashMap<(ClientId, ServiceId, InstanceId, EventgroupId), MajorVersion>,
    active_eventgroups: &mut Vec<(ServiceId, InstanceId, EventgroupId, MajorVersion, Ttl)>,
    active_events: &mut Vec<(ServiceId, InstanceId, EventgroupId, EventId, bool)>,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let mut read_buf = leftover;

    macro_rules! send_or_return {
        ($frame:expr) => {
            if write_frame(&mut write_half, &$frame).await.is_err() {
                return;
            }
        };
    }

    for (&(service, instance), offer) in active_offers.iter() {
        send_or_return!(CommandFrame {
            code: CommandCode::OfferService,
            client: my_client_id.get(),
            payload: encode_offer(service, instance, offer.major, offer.minor, offer.ttl, offer.reliable, offer.unreliable),
        });
    }
    for &(service, instance, eventgroup, major, ttl) in active_eventgroups.iter() {
        send_or_return!(CommandFrame {
            code: CommandCode::CreateEventgroup,
            client: my_client_id.get(),
            payload: encode_create_eventgroup(service, instance, eventgroup, major, ttl),
        });
    }
    for &(service, instance, eventgroup, event, reliable) in active_events.iter() {
        send_or_return!(CommandFrame {
            code: CommandCode::AddEventToEventgroup,
            client: my_client_id.get(),
            payload: encode_add_event(service, instance, eventgroup, event, reliable),
        });
    }
    for (&client, _) in registered.iter() {
        send_or_return!(CommandFrame {
            code: CommandCode::RegisterClient,
            client: client.get(),
            payload: Bytes::new(),
        });
    }
    for (&(client, service, instance, eventgroup), &major) in active_subscriptions.iter() {
        send_or_return!(CommandFrame {
            code: CommandCode::Subscribe,
            client: client.get(),
            payload: encode_subscribe(service, instance, eventgroup, major),
        });
    }

    loop {
        tokio::select! {
            frame = read_frame(&mut read_half, &mut read_buf) => {
                match frame {
                    Ok(Some(frame)) => dispatch_inbound_frame(frame, registered).await,
                    Ok(None) => return,
                    Err(e) => {
                        warn!(error = %e, "local routing read failed");
                        return;
                    }
                }
            }
            cmd = commands_rx.recv() => {
                let Some(cmd) = cmd else { return };
                let ok = apply_outbound_command(
                    cmd,
                    my_client_id,
                    &mut write_half,
                    registered,
                    active_offers,
                    active_subscriptions,
                    active_eventgroups,
                    active_events,
                )
                .await;
                if !ok {
                    return;
                }
            }
        }
    }
}

async fn dispatch_inbound_frame(frame: CommandFrame, registered: &FxHashMap<ClientId, mpsc::Sender<ClientEvent>>) {
    match frame.code {
        CommandCode::Notify => {
            if let Some((service, instance, event, payload)) = decode_notify(frame.payload) {
                if let Some(tx) = registered.get(&ClientId(frame.client)) {
                    let _ = tx.send(ClientEvent::Notification { service, instance, event, payload }).await;
                }
            }
        }
        CommandCode::RoutingInfo => {
            if let Some((available, service, instance)) = decode_availability(frame.payload) {
                if let Some(tx) = registered.get(&ClientId(frame.client)) {
                    let event = if available {
                        ClientEvent::ServiceAvailable { service, instance }
                    } else {
                        ClientEvent::ServiceUnavailable { service, instance }
                    };
                    let _ = tx.send(event).await;
                }
            }
        }
        _ => {}
    }
}

#[allow(clippy::too_many_arguments)]
async fn apply_outbound_command(
    cmd: Command,
    my_client_id: ClientId,
    write_half: &mut (impl AsyncWrite + Unpin),
    registered: &mut FxHashMap<ClientId, mpsc::Sender<ClientEvent>>,
    active_offers: &mut HashMap<(ServiceId, InstanceId), OfferState>,
    active_subscriptions: &mut HashMap<(ClientId, ServiceId, InstanceId, EventgroupId), MajorVersion>,
    active_eventgroups: &mut Vec<(ServiceId, InstanceId, EventgroupId, MajorVersion, Ttl)>,
    active_events: &mut Vec<(ServiceId, InstanceId, EventgroupId, EventId, bool)>,
) -> bool {
    match cmd {
        Command::OfferService {
            service,
            instance,
            major,
            minor,
            ttl,
            reliable,
            unreliable,
        } => {
            active_offers.insert(
                (service, instance),
                OfferState {
                    major,
                    minor,
                    ttl,
                    reliable,
                    unreliable,
                },
            );
            let frame = CommandFrame {
                code: CommandCode::OfferService,
                client: my_client_id.get(),
                payload: encode_offer(service, instance, major, minor, ttl, reliable, unreliable),
            };
            write_frame(write_half, &frame).await.is_ok()
        }
        Command::StopOfferService { service, instance } => {
            active_offers.remove(&(service, instance));
            let frame = CommandFrame {
                code: CommandCode::StopOfferService,
                client: my_client_id.get(),
                payload: encode_service_instance(service, instance),
            };
            write_frame(write_half, &frame).await.is_ok()
        }
        Command::RequestService {
            client,
            service,
            instance,
            major,
            minor,
        } => {
            let frame = CommandFrame {
                code: CommandCode::RequestService,
                client: client.get(),
                payload: encode_request_service(service, instance, major, minor),
            };
            write_frame(write_half, &frame).await.is_ok()
        }
        Command::ReleaseService { client, service, instance } => {
            let frame = CommandFrame {
                code: CommandCode::ReleaseService,
                client: client.get(),
                payload: encode_service_instance(service, instance),
            };
            write_frame(write_half, &frame).await.is_ok()
        }
        Command::CreateEventgroup {
            service,
            instance,
            eventgroup,
            major,
            ttl,
        } => {
            active_eventgroups.push((service, instance, eventgroup, major, ttl));
            let frame = CommandFrame {
                code: CommandCode::CreateEventgroup,
                client: my_client_id.get(),
                payload: encode_create_eventgroup(service, instance, eventgroup, major, ttl),
            };
            write_frame(write_half, &frame).await.is_ok()
        }
        Command::AddEventToEventgroup {
            service,
            instance,
            eventgroup,
            event,
            reliable,
        } => {
            active_events.push((service, instance, eventgroup, event, reliable));
            let frame = CommandFrame {
                code: CommandCode::AddEventToEventgroup,
                client: my_client_id.get(),
                payload: encode_add_event(service, instance, eventgroup, event, reliable),
            };
            write_frame(write_half, &frame).await.is_ok()
        }
        Command::Subscribe {
            client,
            service,
            instance,
            eventgroup,
            major,
        } => {
            active_subscriptions.insert((client, service, instance, eventgroup), major);
            let frame = CommandFrame {
                code: CommandCode::Subscribe,
                client: client.get(),
                payload: encode_subscribe(service, instance, eventgroup, major),
            };
            write_frame(write_half, &frame).await.is_ok()
        }
        Command::Unsubscribe {
            client,
            service,
            instance,
            eventgroup,
        } => {
            active_subscriptions.remove(&(client, service, instance, eventgroup));
            let frame = CommandFrame {
                code: CommandCode::Unsubscribe,
                client: client.get(),
                payload: encode_unsubscribe(service, instance, eventgroup),
            };
            write_frame(write_half, &frame).await.is_ok()
        }
        Command::Notify { service, instance, event, payload } => {
            let frame = CommandFrame {
                code: CommandCode::Notify,
                client: my_client_id.get(),
                payload: encode_notify(service, instance, event, payload),
            };
            write_frame(write_half, &frame).await.is_ok()
        }
        Command::Send {
            client,
            service,
            instance,
            method,
            payload,
            reply,
        } => {
            let frame = CommandFrame {
                code: CommandCode::Send,
                client: client.get(),
                payload: encode_send(service, instance, method, payload),
            };
            let ok = write_frame(write_half, &frame).await.is_ok();
            // Matches the in-process contract: this only confirms the
            // local transport accepted the frame, not that the remote
            // method answered.
            let _ = reply.send(if ok { Ok(()) } else { Err(RoutingError::ManagerGone) });
            ok
        }
        Command::RegisterClient { client, events } => {
            registered.insert(client, events);
            let frame = CommandFrame {
                code: CommandCode::RegisterClient,
                client: client.get(),
                payload: Bytes::new(),
            };
            write_frame(write_half, &frame).await.is_ok()
        }
        Command::UnregisterClient { client } => {
            registered.remove(&client);
            let frame = CommandFrame {
                code: CommandCode::UnregisterClient,
                client: client.get(),
                payload: Bytes::new(),
            };
            write_frame(write_half, &frame).await.is_ok()
        }
    }
}

// --- host role ----------------------------------------------------------

/// Binds the routing root and accepts client-role connections for the
/// lifetime of the process, translating each one's frames into the same
/// [`Command`] channel the in-process routing manager task reads from.
pub(crate) async fn run_host_listener(path: PathBuf, command_tx: mpsc::Sender<Command>) {
    let _ = std::fs::remove_file(&path);
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let listener = match UnixListener::bind(&path) {
        Ok(l) => l,
        Err(e) => {
            warn!(error = %e, path = %path.display(), "failed to bind routing root, local IPC disabled");
            return;
        }
    };
    debug!(path = %path.display(), "routing root listening for local clients");

    // IPC-assigned client ids start high to stay clear of the range
    // callers typically pick for in-process `ClientId`s by hand.
    let next_client = Arc::new(AtomicU16::new(0xE000));
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let command_tx = command_tx.clone();
                let next_client = next_client.clone();
                tokio::spawn(async move {
                    serve_connection(stream, command_tx, next_client).await;
                });
            }
            Err(e) => {
                warn!(error = %e, "routing root accept failed, stopping listener");
                return;
            }
        }
    }
}

async fn serve_connection(stream: UnixStream, command_tx: mpsc::Sender<Command>, next_client: Arc<AtomicU16>) {
    let (mut read_half, mut write_half) = stream.into_split();
    let mut buf = BytesMut::with_capacity(256);

    match read_frame(&mut read_half, &mut buf).await {
        Ok(Some(f)) if f.code == CommandCode::AssignClient => {}
        _ => return,
    }
    let client_id = ClientId(next_client.fetch_add(1, Ordering::Relaxed));
    let ack = CommandFrame {
        code: CommandCode::AssignClientAck,
        client: client_id.get(),
        payload: Bytes::new(),
    };
    if write_frame(&mut write_half, &ack).await.is_err() {
        return;
    }

    match read_frame(&mut read_half, &mut buf).await {
        Ok(Some(f)) if f.code == CommandCode::RegisterApplication => {}
        _ => return,
    }
    let registered_ack = CommandFrame {
        code: CommandCode::RegisteredAck,
        client: client_id.get(),
        payload: Bytes::new(),
    };
    if write_frame(&mut write_half, &registered_ack).await.is_err() {
        return;
    }
    debug!(client = %client_id, "local client registered over routing root");

    // Events the routing manager delivers for any client this connection
    // has registered on behalf of, tagged with which one so they can be
    // re-addressed on the wire.
    let (local_events_tx, mut local_events_rx) = mpsc::channel::<(ClientId, ClientEvent)>(64);

    loop {
        tokio::select! {
            frame = read_frame(&mut read_half, &mut buf) => {
                match frame {
                    Ok(Some(frame)) => {
                        if !handle_inbound_command_frame(frame, &command_tx, &local_events_tx).await {
                            return;
                        }
                    }
                    Ok(None) => return,
                    Err(e) => {
                        warn!(client = %client_id, error = %e, "routing root read failed");
                        return;
                    }
                }
            }
            event = local_events_rx.recv() => {
                let Some((client, event)) = event else { return };
                let frame = match event {
                    ClientEvent::Notification { service, instance, event, payload } => CommandFrame {
                        code: CommandCode::Notify,
                        client: client.get(),
                        payload: encode_notify(service, instance, event, payload),
                    },
                    ClientEvent::ServiceAvailable { service, instance } => CommandFrame {
                        code: CommandCode::RoutingInfo,
                        client: client.get(),
                        payload: encode_availability(true, service, instance),
                    },
                    ClientEvent::ServiceUnavailable { service, instance } => CommandFrame {
                        code: CommandCode::RoutingInfo,
                        client: client.get(),
                        payload: encode_availability(false, service, instance),
                    },
                };
                if write_frame(&mut write_half, &frame).await.is_err() {
                    return;
                }
            }
        }
    }
}

async fn handle_inbound_command_frame(frame: CommandFrame, command_tx: &mpsc::Sender<Command>, local_events_tx: &mpsc::Sender<(ClientId, ClientEvent)>) -> bool {
    let client = ClientId(frame.client);
    let cmd = match frame.code {
        CommandCode::OfferService => decode_offer(frame.payload).map(|(service, instance, major, minor, ttl, reliable, unreliable)| Command::OfferService {
            service,
            instance,
            major,
            minor,
            ttl,
            reliable,
            unreliable,
        }),
        CommandCode::StopOfferService => decode_service_instance(frame.payload).map(|(service, instance)| Command::StopOfferService { service, instance }),
        CommandCode::RequestService => decode_request_service(frame.payload).map(|(service, instance, major, minor)| Command::RequestService {
            client,
            service,
            instance,
            major,
            minor,
        }),
        CommandCode::ReleaseService => decode_service_instance(frame.payload).map(|(service, instance)| Command::ReleaseService { client, service, instance }),
        CommandCode::CreateEventgroup => decode_create_eventgroup(frame.payload).map(|(service, instance, eventgroup, major, ttl)| Command::CreateEventgroup {
            service,
            instance,
            eventgroup,
            major,
            ttl,
        }),
        CommandCode::AddEventToEventgroup => {
            decode_add_event(frame.payload).map(|(service, instance, eventgroup, event, reliable)| Command::AddEventToEventgroup {
                service,
                instance,
                eventgroup,
                event,
                reliable,
            })
        }
        CommandCode::Subscribe => decode_subscribe(frame.payload).map(|(service, instance, eventgroup, major)| Command::Subscribe {
            client,
            service,
            instance,
            eventgroup,
            major,
        }),
        CommandCode::Unsubscribe => decode_unsubscribe(frame.payload).map(|(service, instance, eventgroup)| Command::Unsubscribe {
            client,
            service,
            instance,
            eventgroup,
        }),
        CommandCode::Notify => decode_notify(frame.payload).map(|(service, instance, event, payload)| Command::Notify {
            service,
            instance,
            event,
            payload,
        }),
        CommandCode::Send => {
            let Some((service, instance, method, payload)) = decode_send(frame.payload) else {
                return true;
            };
            let (reply_tx, reply_rx) = oneshot::channel();
            if command_tx
                .send(Command::Send {
                    client,
                    service,
                    instance,
                    method,
                    payload,
                    reply: reply_tx,
                })
                .await
                .is_err()
            {
                return false;
            }
            // The wire's `Send` already only promises "handed to a
            // transport", matching `RoutingManagerClient::send`'s own
            // contract, so the dispatch result is dropped rather than
            // relayed back.
            tokio::spawn(async move {
                let _ = reply_rx.await;
            });
            return true;
        }
        CommandCode::RegisterClient => {
            let (events_tx, mut events_rx) = mpsc::channel(64);
            let fan_out = local_events_tx.clone();
            tokio::spawn(async move {
                while let Some(event) = events_rx.recv().await {
                    if fan_out.send((client, event)).await.is_err() {
                        break;
                    }
                }
            });
            Some(Command::RegisterClient { client, events: events_tx })
        }
        CommandCode::UnregisterClient => Some(Command::UnregisterClient { client }),
        CommandCode::AssignClient | CommandCode::AssignClientAck | CommandCode::RegisterApplication | CommandCode::DeregisterApplication | CommandCode::RegisteredAck | CommandCode::RoutingInfo | CommandCode::Ping | CommandCode::Pong => None,
    };
    match cmd {
        Some(cmd) => command_tx.send(cmd).await.is_ok(),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offer_payload_round_trips() {
        let encoded = encode_offer(ServiceId(0x1234), InstanceId(0x0001), MajorVersion(1), MinorVersion(2), Ttl(5), true, false);
        let (service, instance, major, minor, ttl, reliable, unreliable) = decode_offer(encoded).unwrap();
        assert_eq!(service, ServiceId(0x1234));
        assert_eq!(instance, InstanceId(0x0001));
        assert_eq!(major, MajorVersion(1));
        assert_eq!(minor, MinorVersion(2));
        assert_eq!(ttl, Ttl(5));
        assert!(reliable);
        assert!(!unreliable);
    }

    #[test]
    fn notify_payload_keeps_trailing_bytes_as_the_event_payload() {
        let encoded = encode_notify(ServiceId(0x10), InstanceId(0x01), EventId(0x8001), Bytes::from_static(b"hello"));
        let (service, instance, event, payload) = decode_notify(encoded).unwrap();
        assert_eq!(service, ServiceId(0x10));
        assert_eq!(instance, InstanceId(0x01));
        assert_eq!(event, EventId(0x8001));
        assert_eq!(payload, Bytes::from_static(b"hello"));
    }

    #[test]
    fn availability_payload_round_trips_both_directions() {
        let available = encode_availability(true, ServiceId(0x20), InstanceId(0x01));
        assert_eq!(decode_availability(available), Some((true, ServiceId(0x20), InstanceId(0x01))));
        let unavailable = encode_availability(false, ServiceId(0x20), InstanceId(0x01));
        assert_eq!(decode_availability(unavailable), Some((false, ServiceId(0x20), InstanceId(0x01))));
    }

    #[tokio::test]
    async fn read_frame_reassembles_a_frame_split_across_two_writes() {
        let (mut client, mut server) = UnixStream::pair().unwrap();
        let frame = CommandFrame {
            code: CommandCode::Ping,
            client: 7,
            payload: Bytes::from_static(b"abc"),
        };
        let mut encoded = BytesMut::new();
        frame.encode(&mut encoded);
        let encoded = encoded.freeze();

        let first_half = encoded.len() / 2;
        client.write_all(&encoded[..first_half]).await.unwrap();
        let mut buf = BytesMut::new();
        let read_task = tokio::spawn(async move { read_frame(&mut server, &mut buf).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.write_all(&encoded[first_half..]).await.unwrap();

        let decoded = read_task.await.unwrap().unwrap().unwrap();
        assert_eq!(decoded, frame);
    }
}
