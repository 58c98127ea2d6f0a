use fog_client::core::simulator::{Capacity, DeclaredCapacity};
use fog_client::domain::model::Mode;
use fog_client::domain::ports::OrchestratorApi;
use fog_client::utils::error::FogError;
use fog_client::{Manager, NodeOptions, OrchestratorClient};
use httpmock::prelude::*;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::UdpSocket;

fn options() -> NodeOptions {
    NodeOptions {
        id: Some("00:00:00:00:10:10".to_string()),
        label: Some("h1".to_string()),
        dpid: None,
    }
}

fn manager(server: &MockServer, mode: Mode, data_dir: &TempDir) -> Manager {
    let api: Arc<dyn OrchestratorApi> = Arc::new(OrchestratorClient::new(*server.address()).unwrap());
    Manager::new(api, *server.address(), mode, data_dir.path()).with_retry_interval(Duration::from_millis(50))
}

async fn wait_for_hits(mock: &httpmock::Mock<'_>, hits: usize) -> bool {
    for _ in 0..50 {
        if mock.hits() >= hits {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn test_resource_connects_sends_heartbeats_and_specs() {
    let data_dir = TempDir::new().unwrap();
    let heartbeat = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let udp_port = heartbeat.local_addr().unwrap().port();

    let server = MockServer::start();
    let config = server.mock(|when, then| {
        when.method(GET).path("/config");
        then.status(200).json_body(json!({
            "ORCHESTRATOR_UDP_PORT": udp_port,
            "ORCHESTRATOR_UDP_TIMEOUT": 0.1,
            "MONITOR_PERIOD": 0.05,
            "SIMULATOR_ACTIVE": "True",
            "RESOURCE_LIMIT": 50,
            "PROTOCOL_SEND_TO": "NONE"
        }));
    });
    let add = server.mock(|when, then| {
        when.method(POST)
            .path("/node")
            .json_body_partial(r#"{"id": "00:00:00:00:10:10", "label": "h1", "threshold": 0.5}"#);
        then.status(200);
    });
    let specs = server.mock(|when, then| {
        when.method(PUT)
            .path("/node_specs/00:00:00:00:10:10")
            .json_body_partial(r#"{"cpu_count": 2, "cpu_free": 2.0, "memory_total": 1024.0}"#);
        then.status(200);
    });
    let delete = server.mock(|when, then| {
        when.method(DELETE).path("/node/00:00:00:00:10:10");
        then.status(200);
    });

    let mut manager = manager(&server, Mode::Resource, &data_dir);
    let session = manager
        .connect(
            &options(),
            DeclaredCapacity {
                cpu: Some(2.0),
                ram: Some(1024.0),
                disk: Some(10.0),
            },
        )
        .await
        .unwrap();
    config.assert();
    add.assert();
    assert!(manager.is_connected());
    assert!(manager.is_running());
    assert_eq!(session.resources.totals(), Capacity::new(2.0, 1024.0, 10.0));

    let mut buf = [0u8; 64];
    let (len, _) = tokio::time::timeout(Duration::from_secs(2), heartbeat.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..len], b"00:00:00:00:10:10");

    assert!(wait_for_hits(&specs, 1).await);

    assert!(manager.disconnect().await);
    delete.assert();
    assert!(!manager.is_connected());
    assert!(!manager.is_running());
}

#[tokio::test]
async fn test_already_connected_node_is_an_error() {
    let data_dir = TempDir::new().unwrap();
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/config");
        then.status(200).json_body(json!({"MONITOR_PERIOD": 0.05}));
    });
    server.mock(|when, then| {
        when.method(POST).path("/node");
        then.status(303).body("exists");
    });

    let mut manager = manager(&server, Mode::Client, &data_dir);
    let err = manager
        .connect(&options(), DeclaredCapacity::default())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, FogError::AlreadyConnected { ref id } if id == "00:00:00:00:10:10"));
    // 監控工作隨失敗一起停止
    assert!(!manager.is_running());
    assert!(!manager.is_connected());
}

#[tokio::test]
async fn test_failed_spec_update_re_adds_node() {
    let data_dir = TempDir::new().unwrap();
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/config");
        then.status(200).json_body(json!({"MONITOR_PERIOD": 0.05}));
    });
    let add = server.mock(|when, then| {
        when.method(POST).path("/node");
        then.status(200);
    });
    server.mock(|when, then| {
        when.method(PUT).path("/node_specs/00:00:00:00:10:10");
        then.status(404);
    });
    server.mock(|when, then| {
        when.method(DELETE).path("/node/00:00:00:00:10:10");
        then.status(200);
    });

    let mut manager = manager(&server, Mode::Client, &data_dir);
    manager.connect(&options(), DeclaredCapacity::default()).await.unwrap();
    assert!(wait_for_hits(&add, 2).await);
    manager.disconnect().await;
}

#[tokio::test]
async fn test_switch_only_pushes_specs() {
    let data_dir = TempDir::new().unwrap();
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/config");
        then.status(200).json_body(json!({"MONITOR_PERIOD": 0.05}));
    });
    let add = server.mock(|when, then| {
        when.method(POST).path("/node");
        then.status(200);
    });
    let specs = server.mock(|when, then| {
        when.method(PUT).path("/node_specs/1a2b");
        then.status(500);
    });
    let delete = server.mock(|when, then| {
        when.method(DELETE).path("/node/1a2b");
        then.status(200);
    });

    let mut manager = manager(&server, Mode::Switch, &data_dir);
    let options = NodeOptions {
        dpid: Some("1a2b".to_string()),
        ..NodeOptions::default()
    };
    manager.connect(&options, DeclaredCapacity::default()).await.unwrap();
    assert_eq!(manager.node().unwrap().label, "");
    assert!(wait_for_hits(&specs, 2).await);

    assert!(manager.disconnect().await);
    assert_eq!(add.hits(), 0);
    assert_eq!(delete.hits(), 0);
}
