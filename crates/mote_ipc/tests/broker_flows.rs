#![cfg(unix)]

use std::{future::Future, path::Path, time::Duration};

use tokio::{io::AsyncWriteExt, net::UnixStream, sync::mpsc, time};

use mote_ipc::{
    codec, decode_notification, Broker, BrokerClient, IpcError, IpcMessage, MessageKind,
    NotificationPayload, RegisterPayload, Role, ServiceStatus, StatusUpdatePayload,
};

fn socket_path(dir: &tempfile::TempDir) -> String {
    dir.path().join("mote.sock").to_string_lossy().into_owned()
}

async fn start_broker() -> (tempfile::TempDir, Broker) {
    let dir = tempfile::tempdir().expect("tempdir");
    let broker = Broker::new(socket_path(&dir));
    broker.start().await.expect("broker start");
    (dir, broker)
}

async fn register_raw(endpoint: &str, role: Role, pid: u32) -> UnixStream {
    let mut stream = UnixStream::connect(endpoint).await.expect("connect");
    let register = IpcMessage::to(MessageKind::Register, role, Role::Main)
        .with_payload(&RegisterPayload { role, pid })
        .expect("payload");
    let frame = codec::encode_frame(&register).expect("encode");
    stream.write_all(&frame).await.expect("write register");
    stream
}

async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if condition().await {
            return;
        }
        time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within deadline");
}

#[tokio::test]
async fn register_and_route() {
    let (_dir, broker) = start_broker().await;

    let mut client = register_raw(broker.endpoint(), Role::Tray, 4242).await;
    wait_until(|| broker.is_connected(Role::Tray)).await;
    assert_eq!(broker.client_pid(Role::Tray).await, Some(4242));

    let outbound = IpcMessage::to(MessageKind::ShowNotification, Role::Main, Role::Tray)
        .with_payload(&NotificationPayload {
            title: "t".into(),
            body: "b".into(),
        })
        .expect("payload");
    broker.send(Role::Tray, &outbound).await.expect("send");

    let received = time::timeout(Duration::from_secs(2), codec::read_frame(&mut client))
        .await
        .expect("read timeout")
        .expect("read frame");
    assert_eq!(received, outbound);
    let payload = decode_notification(&received).expect("decode");
    assert_eq!(payload.title, "t");
    assert_eq!(payload.body, "b");

    broker.stop().await;
}

#[tokio::test]
async fn second_registration_evicts_prior_client() {
    let (_dir, broker) = start_broker().await;

    let mut first = register_raw(broker.endpoint(), Role::Tray, 1).await;
    wait_until(|| async { broker.client_pid(Role::Tray).await == Some(1) }).await;

    let mut second = register_raw(broker.endpoint(), Role::Tray, 2).await;
    wait_until(|| async { broker.client_pid(Role::Tray).await == Some(2) }).await;

    let ping = IpcMessage::to(MessageKind::Ping, Role::Main, Role::Tray);
    broker.send(Role::Tray, &ping).await.expect("send");

    let received = time::timeout(Duration::from_secs(2), codec::read_frame(&mut second))
        .await
        .expect("read timeout")
        .expect("read frame");
    assert_eq!(received.kind, MessageKind::Ping);

    // The first connection was closed on eviction.
    let evicted = time::timeout(Duration::from_secs(2), codec::read_frame(&mut first))
        .await
        .expect("read timeout");
    assert!(evicted.is_err());

    broker.stop().await;
}

#[tokio::test]
async fn send_to_unconnected_role_fails() {
    let (_dir, broker) = start_broker().await;

    let message = IpcMessage::to(MessageKind::Ping, Role::Main, Role::Bubble);
    match broker.send(Role::Bubble, &message).await {
        Err(IpcError::RoleNotConnected(Role::Bubble)) => {}
        other => panic!("expected RoleNotConnected, got {other:?}"),
    }

    broker.stop().await;
}

#[tokio::test]
async fn broker_client_receives_broadcasts() {
    let (_dir, broker) = start_broker().await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let client = BrokerClient::connect(broker.endpoint(), Role::Bubble, move |message| {
        let _ = tx.send(message);
    })
    .await
    .expect("client connect");
    wait_until(|| broker.is_connected(Role::Bubble)).await;

    let status = IpcMessage::new(MessageKind::StatusUpdate, Role::Main)
        .with_payload(&StatusUpdatePayload {
            status: ServiceStatus::Running,
        })
        .expect("payload");
    broker.broadcast(&status).await.expect("broadcast");

    let received = time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("receive timeout")
        .expect("message");
    assert_eq!(received.kind, MessageKind::StatusUpdate);

    client.close().await;
    broker.stop().await;
}

#[tokio::test]
async fn disconnect_handler_fires_on_client_drop() {
    let (_dir, broker) = start_broker().await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    broker
        .set_disconnect_handler(move |role| {
            let _ = tx.send(role);
        })
        .await;

    let client = register_raw(broker.endpoint(), Role::Tray, 7).await;
    wait_until(|| broker.is_connected(Role::Tray)).await;
    drop(client);

    let role = time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("receive timeout")
        .expect("role");
    assert_eq!(role, Role::Tray);
    assert!(!broker.is_connected(Role::Tray).await);

    broker.stop().await;
}

#[tokio::test]
async fn idle_connection_receives_ping_and_pong_keeps_it_alive() {
    let dir = tempfile::tempdir().expect("tempdir");
    let broker = Broker::with_read_idle(socket_path(&dir), Duration::from_millis(100));
    broker.start().await.expect("broker start");

    let mut client = register_raw(broker.endpoint(), Role::Tray, 9).await;
    wait_until(|| broker.is_connected(Role::Tray)).await;

    // The broker pings after the idle window elapses.
    let ping = time::timeout(Duration::from_secs(2), codec::read_frame(&mut client))
        .await
        .expect("read timeout")
        .expect("read frame");
    assert_eq!(ping.kind, MessageKind::Ping);

    // Reciprocate and survive another idle window.
    let pong = IpcMessage::to(MessageKind::Pong, Role::Tray, Role::Main).in_reply_to(ping.id);
    let frame = codec::encode_frame(&pong).expect("encode");
    client.write_all(&frame).await.expect("write pong");

    time::sleep(Duration::from_millis(250)).await;
    assert!(broker.is_connected(Role::Tray).await);

    broker.stop().await;
}

#[tokio::test]
async fn stop_removes_the_socket_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = socket_path(&dir);
    let broker = Broker::new(path.clone());
    broker.start().await.expect("broker start");
    assert!(Path::new(&path).exists());

    broker.stop().await;
    assert!(!Path::new(&path).exists());
}
