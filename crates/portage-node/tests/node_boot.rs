//! Boots the full daemon and exercises the control surface

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use portage_node::{NodeConfig, Supervisor};

#[tokio::test]
async fn test_daemon_boots_and_shuts_down() {
    let temp = TempDir::new().unwrap();
    let config = NodeConfig {
        data_dir: temp.path().to_path_buf(),
        control_listen_addr: "127.0.0.1:0".parse().unwrap(),
        gateway_url: "http://127.0.0.1:1".to_string(),
        ..NodeConfig::default()
    };
    let supervisor = Arc::new(Supervisor::new(config).await.unwrap());

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(supervisor.clone().run(shutdown.clone()));

    // Wait for the control server to bind
    let addr = loop {
        if let Some(addr) = supervisor.control_addr() {
            break addr;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };

    let body: serde_json::Value = reqwest::get(format!("http://{addr}/v1/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("daemon stopped in time")
        .unwrap()
        .unwrap();
}
