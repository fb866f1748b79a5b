use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use axum_test::TestServer;
use fleetlease_core::types::{AccountStatus, NewAccount, NewBatch, ProxyCandidate};
use fleetlease_server::infra::config::{ConfigLoader, sources::EnvConfig};
use fleetlease_server::infra::startup::{Bootstrap, bootstrap};
use fleetlease_server::routes::{WORKER_SOCKET_PATH, create_app};
use serde_json::{Value, json};

/// In-memory stores, no proxy source, assignments only on request.
async fn start() -> Result<(TestServer, Bootstrap)> {
    let mut file = tempfile::NamedTempFile::new()?;
    file.write_all(
        br#"
        [coordinator]
        initial_assignment_delay_ms = 3600000
        resubmit_cooldown_ms = 3600000
        "#,
    )?;
    let loaded = ConfigLoader::new()
        .with_config_path(file.path())
        .load_with_env(EnvConfig::default(), false)?;
    let app = bootstrap(Arc::new(loaded.config)).await?;
    let server = TestServer::builder()
        .http_transport()
        .build(create_app(app.state.clone()))
        .map_err(|err| anyhow!(err.to_string()))?;
    Ok((server, app))
}

#[tokio::test]
async fn health_reports_in_memory_backends() -> Result<()> {
    let (server, app) = start().await?;
    let response = server.get("/health").await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["checks"]["database"], "in_memory");
    assert_eq!(body["checks"]["telemetry"], "in_memory");
    app.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn worker_round_trip_over_socket() -> Result<()> {
    let (server, app) = start().await?;
    let coordinator = app.state.coordinator.clone();
    coordinator
        .leases()
        .create_batch(NewBatch::new(
            "socket.txt",
            vec![
                NewAccount::new("one@example.com", "pw"),
                NewAccount::new("two@example.com", "pw"),
            ],
        ))
        .await?;
    coordinator
        .proxies()
        .replace_all(vec![ProxyCandidate::new("10.0.0.1", 8080)], "test")
        .await?;

    let mut socket = server
        .get_websocket(WORKER_SOCKET_PATH)
        .await
        .into_websocket()
        .await;

    socket.send_text("{not json").await;
    let error: Value = socket.receive_json().await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["kind"], "protocol");

    socket
        .send_json(&json!({"type": "register", "worker_id": "w-1", "capabilities": {"batchSize": 2}}))
        .await;
    let registered: Value = socket.receive_json().await;
    assert_eq!(registered["type"], "registered");
    assert_eq!(registered["batch_size"], 2);

    socket.send_json(&json!({"type": "request_work"})).await;
    let assigned: Value = socket.receive_json().await;
    assert_eq!(assigned["type"], "work_assigned");
    assert_eq!(assigned["proxy"]["url"], "http://10.0.0.1:8080");
    let accounts = assigned["accounts"]
        .as_array()
        .ok_or_else(|| anyhow!("accounts missing"))?;
    assert_eq!(accounts.len(), 2);
    assert_eq!(app.state.coordinator.proxies().stats().await?.available, 0);

    let first = accounts[0]["id"].clone();
    socket
        .send_json(&json!({
            "type": "submit_results",
            "results": [{"id": first, "status": "good"}],
        }))
        .await;
    let ack: Value = socket.receive_json().await;
    assert_eq!(ack["type"], "results_acknowledged");
    assert_eq!(ack["processed_count"], 1);

    // The unreported account went straight back to the queue.
    let stats = coordinator.leases().account_stats().await?;
    assert_eq!((stats.completed, stats.pending), (1, 1));

    socket.send_json(&json!({"type": "heartbeat"})).await;
    let beat: Value = socket.receive_json().await;
    assert_eq!(beat["type"], "heartbeat_ack");

    app.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn closing_the_socket_releases_leases() -> Result<()> {
    let (server, app) = start().await?;
    let coordinator = app.state.coordinator.clone();
    coordinator
        .leases()
        .create_batch(NewBatch::new(
            "drop.txt",
            vec![NewAccount::new("held@example.com", "pw")],
        ))
        .await?;
    coordinator
        .proxies()
        .replace_all(vec![ProxyCandidate::new("10.0.0.2", 3128)], "test")
        .await?;

    let mut socket = server
        .get_websocket(WORKER_SOCKET_PATH)
        .await
        .into_websocket()
        .await;
    socket
        .send_json(&json!({"type": "register", "worker_id": "w-drop"}))
        .await;
    let _registered: Value = socket.receive_json().await;
    socket.send_json(&json!({"type": "request_work"})).await;
    let assigned: Value = socket.receive_json().await;
    assert_eq!(assigned["type"], "work_assigned");
    socket.close().await;

    let mut released = false;
    for _ in 0..50 {
        let stats = coordinator.leases().account_stats().await?;
        if stats.pending == 1 && coordinator.connection_count() == 0 {
            released = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(released, "lease was not released after disconnect");

    let account = coordinator
        .leases()
        .account(fleetlease_core::types::AccountId(
            assigned["accounts"][0]["id"]
                .as_i64()
                .ok_or_else(|| anyhow!("id missing"))?,
        ))
        .await?
        .ok_or_else(|| anyhow!("account missing"))?;
    assert_eq!(account.status, AccountStatus::Pending);

    app.shutdown().await;
    Ok(())
}
