//! End-to-end bootstrap: a fresh node with no credentials connects
//! insecurely, obtains a certificate, reconnects over TLS presenting
//! it, and its device report lands in the hub's store.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use hearth_domain::{Device, DeviceId, HubConfig};
use hearth_hub::servers::{insecure, tls};
use hearth_hub::state::AppState;
use hearth_node_sdk::{CallbackRegistry, NodeClient};

struct RunningHub {
    state: AppState,
    insecure_port: u16,
    /// Stops only the plain-HTTP listener; the TLS listener keeps serving.
    insecure_shutdown: CancellationToken,
    _hub_dir: tempfile::TempDir,
}

async fn start_hub() -> RunningHub {
    let hub_dir = tempfile::tempdir().unwrap();

    let insecure_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let tls_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let insecure_port = insecure_listener.local_addr().unwrap().port();
    let tls_port = tls_listener.local_addr().unwrap().port();

    let config = HubConfig {
        name: "test-hub".into(),
        uuid: uuid::Uuid::new_v4().to_string(),
        host: "127.0.0.1".into(),
        port: insecure_port,
        tls_port,
        timezone: "UTC".into(),
    };
    let state = AppState::with_config(hub_dir.path(), config).unwrap();

    let insecure_shutdown = state.shutdown.child_token();
    tokio::spawn(insecure::serve(
        state.clone(),
        insecure_listener,
        insecure_shutdown.clone(),
    ));
    tokio::spawn(tls::serve(
        state.clone(),
        tls_listener,
        state.shutdown.clone(),
    ));

    RunningHub {
        state,
        insecure_port,
        insecure_shutdown,
        _hub_dir: hub_dir,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn node_bootstraps_and_reports_a_device() {
    let hub = start_hub().await;
    let node_dir = tempfile::tempdir().unwrap();

    let client = NodeClient::builder("example")
        .host("127.0.0.1")
        .port(hub.insecure_port)
        .data_dir(node_dir.path())
        .name("Example node")
        .bootstrap_timeout(Duration::from_secs(20))
        .build()
        .unwrap();
    let handle = client.handle();

    let shutdown = CancellationToken::new();
    let runner = client.spawn(CallbackRegistry::new(), shutdown.clone());

    tokio::time::timeout(Duration::from_secs(20), handle.wait_connected())
        .await
        .expect("node never reached the secure session");

    // Bootstrap persisted a full identity on the node side...
    assert!(node_dir.path().join("crt.crt").exists());
    assert!(node_dir.path().join("crt.key").exists());
    assert!(node_dir.path().join("ca.crt").exists());
    assert!(node_dir.path().join("hub.json").exists());
    // ...and CA material on the hub side.
    assert!(hub._hub_dir.path().join("ca.crt").exists());
    assert!(hub._hub_dir.path().join("ca.key").exists());

    let node_uuid = handle.uuid().expect("connected node has a uuid");

    handle
        .add_or_update(Device {
            device_type: "light".into(),
            id: DeviceId::new("", "1"),
            name: "lamp".into(),
            alias: String::new(),
            online: true,
            state: serde_json::from_value(serde_json::json!({"on": false})).unwrap(),
            traits: vec!["OnOff".into()],
        })
        .await
        .unwrap();

    // The report crosses two sockets; poll the store until it lands.
    let key = DeviceId::new(node_uuid.to_string(), "1");
    let device = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Some(device) = hub.state.store.device(&key) {
                return device;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("device never reached the hub store");

    assert_eq!(hub.state.store.devices().len(), 1);
    assert!(device.online);
    assert_eq!(device.id.node, node_uuid.to_string());
    assert_eq!(device.state.bool("on"), Some(false));

    // The announced node was persisted under its certificate identity.
    let stored = hub
        .state
        .store
        .node(&node_uuid.to_string())
        .expect("node record exists");
    assert_eq!(stored.node_type, "example");
    assert!(hub
        ._hub_dir
        .path()
        .join("configs")
        .join(format!("{node_uuid}.json"))
        .exists());

    shutdown.cancel();
    let _ = runner.await;
    hub.state.shutdown.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn restart_skips_bootstrap_and_reuses_identity() {
    let hub = start_hub().await;
    let node_dir = tempfile::tempdir().unwrap();

    let connect = |port: u16| {
        NodeClient::builder("example")
            .host("127.0.0.1")
            .port(port)
            .data_dir(node_dir.path())
            .build()
            .unwrap()
    };

    // First life: full bootstrap.
    let client = connect(hub.insecure_port);
    let handle = client.handle();
    let shutdown = CancellationToken::new();
    let runner = client.spawn(CallbackRegistry::new(), shutdown.clone());
    tokio::time::timeout(Duration::from_secs(20), handle.wait_connected())
        .await
        .expect("first connection failed");
    let first_uuid = handle.uuid().unwrap();
    shutdown.cancel();
    let _ = runner.await;

    // Second life: same data dir, same identity, no new CSR needed.
    let cert_before = std::fs::read(node_dir.path().join("crt.crt")).unwrap();
    let client = connect(hub.insecure_port);
    let handle = client.handle();
    let shutdown = CancellationToken::new();
    let runner = client.spawn(CallbackRegistry::new(), shutdown.clone());
    tokio::time::timeout(Duration::from_secs(20), handle.wait_connected())
        .await
        .expect("reconnect with stored identity failed");

    assert_eq!(handle.uuid().unwrap(), first_uuid);
    let cert_after = std::fs::read(node_dir.path().join("crt.crt")).unwrap();
    assert_eq!(cert_before, cert_after);

    shutdown.cancel();
    let _ = runner.await;
    hub.state.shutdown.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn stored_identity_connects_without_the_insecure_listener() {
    let hub = start_hub().await;
    let node_dir = tempfile::tempdir().unwrap();

    let connect = || {
        NodeClient::builder("example")
            .host("127.0.0.1")
            .port(hub.insecure_port)
            .data_dir(node_dir.path())
            .build()
            .unwrap()
    };

    // First life: full bootstrap, which also persists the hub endpoint.
    let client = connect();
    let handle = client.handle();
    let shutdown = CancellationToken::new();
    let runner = client.spawn(CallbackRegistry::new(), shutdown.clone());
    tokio::time::timeout(Duration::from_secs(20), handle.wait_connected())
        .await
        .expect("bootstrap connection failed");
    let first_uuid = handle.uuid().unwrap();
    shutdown.cancel();
    let _ = runner.await;
    assert!(node_dir.path().join("hub.json").exists());

    // The insecure listener goes away; only TLS keeps serving.
    hub.insecure_shutdown.cancel();
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Second life: the stored identity and endpoint reach the secure
    // session directly.
    let client = connect();
    let handle = client.handle();
    let shutdown = CancellationToken::new();
    let runner = client.spawn(CallbackRegistry::new(), shutdown.clone());
    tokio::time::timeout(Duration::from_secs(20), handle.wait_connected())
        .await
        .expect("stored identity never reached the secure session without the insecure listener");
    assert_eq!(handle.uuid().unwrap(), first_uuid);

    shutdown.cancel();
    let _ = runner.await;
    hub.state.shutdown.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn silent_connection_is_dropped_at_the_read_deadline() {
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::http::HeaderValue;

    let hub = start_hub().await;

    let mut request = format!("ws://127.0.0.1:{}/ws", hub.insecure_port)
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("gui"));
    let (ws, _) = tokio_tungstenite::connect_async(request).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while hub.state.sessions.is_empty() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("session never registered");

    // Never polling the socket means the hub's pings are never answered;
    // the session must be dropped once the read deadline lapses instead
    // of lingering until the kernel gives up on the TCP connection.
    tokio::time::timeout(Duration::from_secs(25), async {
        while !hub.state.sessions.is_empty() {
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    })
    .await
    .expect("half-open session survived the read deadline");

    drop(ws);
    hub.state.shutdown.cancel();
}
