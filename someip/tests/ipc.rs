//! End-to-end coverage of the routing manager's local IPC transport: a
//! host-role [`Runtime`] listening on a routing root, and a client-role
//! [`Runtime`] dialing it as a genuinely separate routing-manager client
//! rather than sharing the host's in-process task.
#![cfg(unix)]

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use bytes::Bytes;
use someip::{ClientEvent, Config, Role, Runtime};
use someip_proto::{ClientId, EventId, EventgroupId, InstanceId, MajorVersion, MinorVersion, Ttl};

fn routing_root() -> std::path::PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!("someip-routing-root-{}", std::process::id()));
    path
}

fn host_config(path: std::path::PathBuf) -> Config {
    Config {
        role: Role::Host,
        unicast_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        sd_unicast_port: 0,
        routing_root_path: Some(path),
        ..Config::default()
    }
}

fn client_config(path: std::path::PathBuf) -> Config {
    Config {
        role: Role::Client,
        routing_root_path: Some(path),
        ..Config::default()
    }
}

async fn next_event(rx: &mut tokio::sync::mpsc::Receiver<ClientEvent>) -> ClientEvent {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for client event")
        .expect("event channel closed")
}

#[tokio::test]
async fn client_role_reaches_host_role_offer_over_local_ipc() {
    let path = routing_root();
    let (_host_runtime, host_client) = Runtime::bind(host_config(path.clone())).await.unwrap();
    // give the routing root a moment to bind before the client role dials it
    tokio::time::sleep(Duration::from_millis(50)).await;
    let (_client_runtime, remote_client) = Runtime::bind(client_config(path)).await.unwrap();
    // give the registration handshake a moment to complete
    tokio::time::sleep(Duration::from_millis(100)).await;

    let service = someip_proto::ServiceId(0x2001);
    let instance = InstanceId(0x0001);
    let watcher = ClientId(0x0050);

    let mut events = remote_client.register_client(watcher, 8).await.unwrap();
    remote_client
        .request_service(watcher, service, instance, MajorVersion(1), MinorVersion::ANY)
        .await
        .unwrap();

    host_client
        .offer_service(service, instance, MajorVersion(1), MinorVersion(0), Ttl(5), true, false)
        .await
        .unwrap();

    match next_event(&mut events).await {
        ClientEvent::ServiceAvailable { service: s, instance: i } => {
            assert_eq!(s, service);
            assert_eq!(i, instance);
        }
        other => panic!("expected ServiceAvailable relayed over local IPC, got {other:?}"),
    }
}

#[tokio::test]
async fn client_role_subscriber_receives_notification_over_local_ipc() {
    let path = routing_root();
    let (_host_runtime, host_client) = Runtime::bind(host_config(path.clone())).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let (_client_runtime, remote_client) = Runtime::bind(client_config(path)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let service = someip_proto::ServiceId(0x2002);
    let instance = InstanceId(0x0001);
    let eventgroup = EventgroupId(0x01);
    let event = EventId(0x8001);
    let subscriber = ClientId(0x0051);

    host_client
        .offer_service(service, instance, MajorVersion(1), MinorVersion(0), Ttl(5), false, true)
        .await
        .unwrap();
    host_client
        .create_eventgroup(service, instance, eventgroup, MajorVersion(1), Ttl(5))
        .await
        .unwrap();
    host_client
        .add_event_to_eventgroup(service, instance, eventgroup, event, false)
        .await
        .unwrap();

    let mut events = remote_client.register_client(subscriber, 8).await.unwrap();
    remote_client
        .subscribe(subscriber, service, instance, eventgroup, MajorVersion(1))
        .await
        .unwrap();
    // give the subscribe frame time to cross the socket and be applied
    tokio::time::sleep(Duration::from_millis(100)).await;

    let payload = Bytes::from_static(b"over-the-wire");
    host_client.notify(service, instance, event, payload.clone()).await.unwrap();

    match next_event(&mut events).await {
        ClientEvent::Notification {
            service: s,
            instance: i,
            event: e,
            payload: p,
        } => {
            assert_eq!(s, service);
            assert_eq!(i, instance);
            assert_eq!(e, event);
            assert_eq!(p, payload);
        }
        other => panic!("expected Notification relayed over local IPC, got {other:?}"),
    }
}
