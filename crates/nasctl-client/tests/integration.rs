//! Integration tests for the client against an in-process daemon
//!
//! The daemon runs the real server and session stack on top of the
//! scripted in-memory backend, so no appliance is needed.

use anyhow::Result;
use nasctl_client::{ClientError, DaemonClient, LaunchOptions, RemoteApi};
use nasctl_daemon::testing::{MockBackend, MockReply};
use nasctl_daemon::{Server, SessionConfig, SessionRegistry};
use nasctl_protocol::{SessionKey, TIMEOUT_ERROR};
use serde_json::json;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UnixListener;
use tokio::task::JoinHandle;

/// Test fixture that starts a real daemon server for integration testing
struct TestServer {
    _temp_dir: TempDir,
    socket_path: PathBuf,
    server_handle: JoinHandle<()>,
    shutdown_handle: tokio::sync::broadcast::Sender<()>,
    mock: MockBackend,
}

impl TestServer {
    async fn start() -> Result<Self> {
        Self::start_with(SessionConfig::default()).await
    }

    async fn start_with(config: SessionConfig) -> Result<Self> {
        let temp_dir = tempfile::tempdir()?;
        let socket_path = temp_dir.path().join("daemon.sock");
        let mock = MockBackend::new();

        let registry = SessionRegistry::new(Arc::new(mock.clone()), config);
        let server = Server::bind(&socket_path, registry, None).await?;
        let shutdown_handle = server.shutdown_handle();

        let server_handle = tokio::spawn(async move {
            let _ = server.run().await;
        });

        Ok(Self {
            _temp_dir: temp_dir,
            socket_path,
            server_handle,
            shutdown_handle,
            mock,
        })
    }

    fn api(&self) -> RemoteApi {
        let launch = LaunchOptions {
            // The daemon is already up; a relaunch attempt would fail loudly.
            executable: PathBuf::from("/nonexistent/nasctl"),
            socket: self.socket_path.clone(),
            idle_timeout: None,
        };
        RemoteApi::new(SessionKey::new("nas.test", "1-secret"), launch)
    }

    async fn stop(self) {
        let _ = self.shutdown_handle.send(());
        let _ = self.server_handle.await;
    }
}

#[tokio::test]
async fn test_client_ping_and_status() -> Result<()> {
    let server = TestServer::start().await?;
    let client = DaemonClient::connect_to(&server.socket_path).await?;

    assert_eq!(client.ping().await?, "pong");
    let status = client.status().await?;
    assert_eq!(status["pid"], json!(std::process::id()));
    assert_eq!(status["sessions"], json!([]));

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_remote_call_round_trip() -> Result<()> {
    let server = TestServer::start().await?;
    server
        .mock
        .on("pool.dataset.query", |_| MockReply::value(json!([{"id": "tank"}])));

    let mut api = server.api();
    let result = api.call("pool.dataset.query", None, json!([])).await?;
    assert_eq!(result, json!([{"id": "tank"}]));
    api.close(None).await?;

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_two_clients_share_one_backend_login() -> Result<()> {
    let server = TestServer::start().await?;
    server.mock.set_connect_delay(Duration::from_millis(100));
    server
        .mock
        .on("system.info", |_| MockReply::value(json!("ok")));

    let mut a = server.api();
    let mut b = server.api();
    let (ra, rb) = tokio::join!(
        a.call("system.info", None, json!([])),
        b.call("system.info", None, json!([]))
    );
    assert_eq!(ra?, json!("ok"));
    assert_eq!(rb?, json!("ok"));
    assert_eq!(server.mock.login_count(), 1);

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_backend_errors_arrive_verbatim() -> Result<()> {
    let server = TestServer::start().await?;
    server.mock.on("pool.dataset.create", |_| MockReply::Error {
        code: 17,
        message: "File exists".into(),
        data: Some(json!({"reason": "[EEXIST] tank/x already exists"})),
    });

    let mut api = server.api();
    let err = api
        .call("pool.dataset.create", None, json!({"name": "tank/x"}))
        .await
        .unwrap_err();
    let rpc = err.rpc().unwrap();
    assert_eq!(rpc.code, 17);
    assert_eq!(rpc.to_string(), "File exists (code 17): [EEXIST] tank/x already exists");

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_timeout_is_reported() -> Result<()> {
    let server = TestServer::start().await?;
    server.mock.on("system.slow", |_| MockReply::Silent);

    let mut api = server.api();
    let err = api
        .call("system.slow", Some("100ms"), json!([]))
        .await
        .unwrap_err();
    assert_eq!(err.rpc().map(|e| e.code), Some(TIMEOUT_ERROR));

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_close_flushes_provisional_deletes() -> Result<()> {
    let server = TestServer::start_with(SessionConfig {
        delete_grace: Duration::from_millis(20),
        ..SessionConfig::default()
    })
    .await?;
    server.mock.on("pool.dataset.delete", |params| {
        if params[0] == json!("tank/busy") {
            MockReply::error(16, "Device busy").after(Duration::from_millis(150))
        } else {
            MockReply::value(json!(true)).after(Duration::from_millis(150))
        }
    });

    let mut api = server.api();
    let first = api
        .call("pool.dataset.delete", None, json!(["tank/old"]))
        .await?;
    let second = api
        .call("pool.dataset.delete", None, json!(["tank/busy"]))
        .await?;
    assert_eq!(first["pending"], json!(true));
    assert_eq!(second["pending"], json!(true));
    assert_eq!(api.pending_jobs().len(), 2);

    match api.close(None).await {
        Err(ClientError::Aggregate(failures)) => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].rpc().map(|e| e.code), Some(16));
        }
        other => panic!("unexpected {:?}", other),
    }

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_close_prefers_prior_error() -> Result<()> {
    let server = TestServer::start().await?;
    let api = server.api();

    match api.close(Some(ClientError::Launch("earlier".into()))).await {
        Err(ClientError::Launch(msg)) => assert_eq!(msg, "earlier"),
        other => panic!("unexpected {:?}", other),
    }

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_bulk_through_daemon() -> Result<()> {
    let server = TestServer::start().await?;
    server
        .mock
        .on("user.update", |params| MockReply::value(params[0].clone()));

    let mut api = server.api();
    let id = api
        .call("bulk_call", None, json!(["user.update", [1, 2, 3]]))
        .await?;
    let results = api.call("await_daemon_job", Some("5s"), json!([id])).await?;
    assert_eq!(
        results,
        json!([
            {"result": 1, "error": null},
            {"result": 2, "error": null},
            {"result": 3, "error": null},
        ])
    );

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_dropped_connection_is_surfaced_then_relaunch_failure() -> Result<()> {
    let server = TestServer::start().await?;
    let mut api = server.api();
    server
        .mock
        .on("system.info", |_| MockReply::value(json!("ok")));
    api.call("system.info", None, json!([])).await?;

    let socket = server.socket_path.clone();
    server.stop().await;

    // The cached connection is gone; the call is not resent.
    let err = api.call("system.info", None, json!([])).await.unwrap_err();
    assert!(err.is_transport(), "{:?}", err);

    // The next call dials afresh and has to relaunch.
    let err = api.call("system.info", None, json!([])).await.unwrap_err();
    assert!(matches!(err, ClientError::Launch(_)), "{:?}", err);
    assert!(!socket.exists());
    Ok(())
}

#[tokio::test]
async fn test_request_lost_in_flight_is_sent_once() -> Result<()> {
    let temp_dir = tempfile::tempdir()?;
    let socket = temp_dir.path().join("daemon.sock");
    let listener = UnixListener::bind(&socket)?;
    let received = Arc::new(AtomicUsize::new(0));

    // Reads one request per connection and hangs up without answering.
    let counter = received.clone();
    let daemon = tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let mut reader = BufReader::new(stream);
            let mut line = String::new();
            if reader.read_line(&mut line).await.unwrap_or(0) > 0 {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }
    });

    let launch = LaunchOptions {
        executable: PathBuf::from("/nonexistent/nasctl"),
        socket: socket.clone(),
        idle_timeout: None,
    };
    let mut api = RemoteApi::new(SessionKey::new("nas.test", "1-secret"), launch);
    let err = api
        .call("pool.dataset.create", None, json!([{"name": "tank/x"}]))
        .await
        .unwrap_err();
    assert!(err.is_transport(), "{:?}", err);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(received.load(Ordering::SeqCst), 1);
    assert!(socket.exists());

    daemon.abort();
    Ok(())
}
