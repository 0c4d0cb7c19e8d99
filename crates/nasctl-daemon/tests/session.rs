//! Session multiplexer behavior against the in-memory backend.

use nasctl_daemon::testing::{MockBackend, MockReply};
use nasctl_daemon::{CallError, Session, SessionConfig};
use nasctl_protocol::SessionKey;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn key() -> SessionKey {
    SessionKey::new("nas.test", "1-secret")
}

async fn open(mock: &MockBackend) -> Arc<Session> {
    open_with(mock, SessionConfig::default()).await
}

async fn open_with(mock: &MockBackend, config: SessionConfig) -> Arc<Session> {
    Session::establish(key(), mock, config).await.unwrap()
}

#[tokio::test]
async fn test_plain_call_returns_result() {
    let mock = MockBackend::new();
    mock.on("system.info", |_| MockReply::value(json!({"hostname": "nas"})));
    let session = open(&mock).await;

    let result = session.call("system.info", None, Value::Null).await.unwrap();
    assert_eq!(result, json!({"hostname": "nas"}));
    assert_eq!(mock.calls_to("system.info")[0].params, json!([]));
}

#[tokio::test]
async fn test_backend_error_is_passed_through() {
    let mock = MockBackend::new();
    mock.on("pool.dataset.create", |_| MockReply::Error {
        code: 17,
        message: "File exists".into(),
        data: Some(json!({"reason": "dataset already exists", "errname": "EEXIST"})),
    });
    let session = open(&mock).await;

    let err = session
        .call("pool.dataset.create", None, json!({"name": "tank/x"}))
        .await
        .unwrap_err();
    match err {
        CallError::Backend {
            code,
            message,
            data,
        } => {
            assert_eq!(code, 17);
            assert_eq!(message, "File exists");
            assert_eq!(data.unwrap()["errname"], "EEXIST");
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_login_rejection_is_auth_error() {
    let mock = MockBackend::new().with_api_key("right");
    let err = Session::establish(key(), &mock, SessionConfig::default())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, CallError::Auth { .. }), "{:?}", err);
}

#[tokio::test]
async fn test_login_and_subscribe_happen_once() {
    let mock = MockBackend::new();
    let _session = open(&mock).await;
    assert_eq!(mock.login_count(), 1);
    assert_eq!(mock.calls_to("core.subscribe")[0].params, json!(["core.get_jobs"]));
}

#[tokio::test]
async fn test_job_result_is_awaited_transparently() {
    let mock = MockBackend::new();
    mock.on("pool.dataset.lock", |_| {
        MockReply::job(Duration::from_millis(100), json!({"locked": true}))
    });
    let session = open(&mock).await;

    let started = Instant::now();
    let result = session
        .call("pool.dataset.lock", Some("5s"), json!(["tank/secure"]))
        .await
        .unwrap();
    assert_eq!(result, json!({"locked": true}));
    assert!(started.elapsed() >= Duration::from_millis(90));
    assert_eq!(mock.calls_to("core.job_wait").len(), 1);
}

#[tokio::test]
async fn test_job_failure_surfaces_job_error() {
    let mock = MockBackend::new();
    mock.on("pool.scrub.run", |_| {
        MockReply::failed_job(Duration::from_millis(20), "pool is busy")
    });
    let session = open(&mock).await;

    let err = session
        .call("pool.scrub.run", Some("5s"), json!(["tank"]))
        .await
        .unwrap_err();
    match err {
        CallError::JobFailed { error, .. } => assert_eq!(error, "pool is busy"),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_job_resolved_by_wait_wrapper_only() {
    let mock = MockBackend::new();
    mock.announce_jobs(false);
    mock.on("pool.dataset.promote", |_| {
        MockReply::job(Duration::from_millis(50), json!(null))
    });
    let session = open(&mock).await;

    let result = session
        .call("pool.dataset.promote", Some("5s"), json!(["tank/clone"]))
        .await
        .unwrap();
    assert_eq!(result, Value::Null);
}

#[tokio::test]
async fn test_read_verbs_returning_integers_are_not_jobs() {
    let mock = MockBackend::new();
    mock.on("pool.dataset.count", |_| MockReply::value(json!(12)));
    let session = open(&mock).await;

    let result = session
        .call("pool.dataset.count", None, json!([]))
        .await
        .unwrap();
    assert_eq!(result, json!(12));
    assert!(mock.calls_to("core.job_wait").is_empty());
}

#[tokio::test]
async fn test_explicit_job_wait_is_not_doubled() {
    let mock = MockBackend::new();
    let session = open(&mock).await;
    let job = mock.start_job(Duration::from_millis(50), Ok(json!("replicated")));

    let result = session
        .call("core.job_wait", Some("5s"), json!([job]))
        .await
        .unwrap();
    assert_eq!(result, json!("replicated"));
    assert_eq!(mock.calls_to("core.job_wait").len(), 1);
}

#[tokio::test]
async fn test_timeout_reports_bound_and_session_survives() {
    let mock = MockBackend::new();
    mock.on("system.slow", |_| {
        MockReply::value(json!("late")).after(Duration::from_millis(300))
    });
    mock.on("system.info", |_| MockReply::value(json!("ok")));
    let session = open(&mock).await;

    let err = session
        .call("system.slow", Some("50ms"), json!([]))
        .await
        .unwrap_err();
    match err {
        CallError::TimeoutPending { after, .. } => assert_eq!(after, Duration::from_millis(50)),
        other => panic!("unexpected {:?}", other),
    }

    let ok = session.call("system.info", None, json!([])).await.unwrap();
    assert_eq!(ok, json!("ok"));
}

#[tokio::test]
async fn test_late_result_is_kept_as_daemon_job() {
    let mock = MockBackend::new();
    mock.on("pool.dataset.update", |_| {
        MockReply::value(json!({"id": "tank/a"})).after(Duration::from_millis(150))
    });
    let session = open(&mock).await;

    let err = session
        .call("pool.dataset.update", Some("30ms"), json!(["tank/a", {"comments": "x"}]))
        .await
        .unwrap_err();
    let data = err.to_rpc_error().data.unwrap();
    assert_eq!(data["timeout_ms"], json!(30));
    assert!(data["call_id"].is_u64(), "{}", data);
    let daemon_job = data["daemon_job_id"].clone();

    let results = session
        .call("await_daemon_job", Some("5s"), json!([daemon_job]))
        .await
        .unwrap();
    assert_eq!(results, json!([{"result": {"id": "tank/a"}, "error": null}]));
    assert_eq!(mock.calls_to("pool.dataset.update").len(), 1);
}

#[tokio::test]
async fn test_unparseable_timeout_uses_default() {
    let mock = MockBackend::new();
    mock.on("system.info", |_| {
        MockReply::value(json!("ok")).after(Duration::from_millis(50))
    });
    let session = open(&mock).await;

    let ok = session
        .call("system.info", Some("soon"), json!([]))
        .await
        .unwrap();
    assert_eq!(ok, json!("ok"));
}

#[tokio::test]
async fn test_create_waits_for_inflight_delete_of_same_dataset() {
    let mock = MockBackend::new();
    mock.on("pool.dataset.delete", |_| {
        MockReply::value(json!(true)).after(Duration::from_millis(300))
    });
    mock.on("pool.dataset.create", |_| MockReply::value(json!({"id": "tank/x"})));
    let session = open(&mock).await;

    let deleting = {
        let session = session.clone();
        tokio::spawn(async move {
            session
                .call("pool.dataset.delete", Some("5s"), json!(["tank/x"]))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;

    let created = session
        .call("pool.dataset.create", Some("5s"), json!({"name": "tank/x"}))
        .await
        .unwrap();
    assert_eq!(created, json!({"id": "tank/x"}));
    assert_eq!(deleting.await.unwrap().unwrap(), json!(true));

    let delete = mock.calls_to("pool.dataset.delete")[0].clone();
    let create = mock.calls_to("pool.dataset.create")[0].clone();
    assert!(
        create.at.duration_since(delete.at) >= Duration::from_millis(250),
        "create was sent {:?} after delete",
        create.at.duration_since(delete.at)
    );
}

#[tokio::test]
async fn test_different_objects_do_not_wait() {
    let mock = MockBackend::new();
    mock.on("pool.dataset.update", |_| {
        MockReply::value(json!(true)).after(Duration::from_millis(300))
    });
    mock.on("pool.dataset.create", |_| MockReply::value(json!(true)));
    let session = open(&mock).await;

    let updating = {
        let session = session.clone();
        tokio::spawn(async move {
            session
                .call("pool.dataset.update", Some("5s"), json!(["tank/a", {"comments": "x"}]))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;

    let started = Instant::now();
    session
        .call("pool.dataset.create", Some("5s"), json!({"name": "tank/b"}))
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_millis(200));
    updating.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_conflict_wait_is_bounded() {
    let mock = MockBackend::new();
    mock.on("pool.dataset.update", |params| {
        if params[1]["hang"] == json!(true) {
            MockReply::Silent
        } else {
            MockReply::value(json!("updated"))
        }
    });
    let config = SessionConfig {
        conflict_wait: Duration::from_millis(100),
        ..SessionConfig::default()
    };
    let session = open_with(&mock, config).await;

    let first = {
        let session = session.clone();
        tokio::spawn(async move {
            session
                .call("pool.dataset.update", Some("500ms"), json!(["tank/a", {"hang": true}]))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let second = session
        .call("pool.dataset.update", Some("2s"), json!(["tank/a", {"hang": false}]))
        .await
        .unwrap();
    assert_eq!(second, json!("updated"));
    assert!(matches!(
        first.await.unwrap(),
        Err(CallError::TimeoutPending { .. })
    ));
}

#[tokio::test]
async fn test_queued_call_is_dropped_when_its_caller_times_out() {
    let mock = MockBackend::new();
    mock.on("pool.dataset.update", |_| {
        MockReply::value(json!(true)).after(Duration::from_millis(300))
    });
    mock.on("pool.dataset.create", |_| MockReply::value(json!({"id": "tank/x"})));
    let session = open(&mock).await;

    let updating = {
        let session = session.clone();
        tokio::spawn(async move {
            session
                .call("pool.dataset.update", Some("5s"), json!(["tank/x", {"comments": "x"}]))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;

    let err = session
        .call("pool.dataset.create", Some("50ms"), json!({"name": "tank/x"}))
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::Timeout { .. }), "{:?}", err);

    assert_eq!(updating.await.unwrap().unwrap(), json!(true));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(mock.calls_to("pool.dataset.create").is_empty());
    assert_eq!(session.stats().pending_actions, 0);
    assert_eq!(session.stats().operations, 0);
}

#[tokio::test]
async fn test_slow_delete_returns_provisional_handle() {
    let mock = MockBackend::new();
    mock.on("pool.dataset.delete", |_| {
        MockReply::value(json!(true)).after(Duration::from_millis(300))
    });
    let config = SessionConfig {
        delete_grace: Duration::from_millis(50),
        ..SessionConfig::default()
    };
    let session = open_with(&mock, config).await;

    let handle = session
        .call("pool.dataset.delete", Some("5s"), json!(["tank/old"]))
        .await
        .unwrap();
    assert_eq!(handle["pending"], json!(true));
    assert!(handle["call_id"].as_u64().is_some());
    let daemon_job = handle["daemon_job_id"].clone();

    let results = session
        .call("await_daemon_job", Some("5s"), json!([daemon_job]))
        .await
        .unwrap();
    assert_eq!(results, json!([{"result": true, "error": null}]));
}

#[tokio::test]
async fn test_fast_delete_returns_result_directly() {
    let mock = MockBackend::new();
    mock.on("zfs.snapshot.delete", |_| MockReply::value(json!(true)));
    let session = open(&mock).await;

    let result = session
        .call("zfs.snapshot.delete", None, json!(["tank/x@daily"]))
        .await
        .unwrap();
    assert_eq!(result, json!(true));
}

#[tokio::test]
async fn test_bulk_results_keep_submission_order() {
    let mock = MockBackend::new();
    mock.on("user.update", |params| {
        let n = params[0].as_u64().unwrap_or_default();
        if n == 3 {
            return MockReply::error(2, "No such user");
        }
        // Later elements finish first.
        MockReply::value(json!(n * 10)).after(Duration::from_millis(200 - n * 40))
    });
    let session = open(&mock).await;

    let id = session
        .call("bulk_call", None, json!(["user.update", [0, 1, 2, 3, 4]]))
        .await
        .unwrap();
    let results = session
        .call("await_daemon_job", Some("5s"), json!([id]))
        .await
        .unwrap();

    let results = results.as_array().unwrap();
    assert_eq!(results.len(), 5);
    for (i, pair) in results.iter().enumerate() {
        if i == 3 {
            assert_eq!(pair["result"], Value::Null);
            assert_eq!(pair["error"]["code"], json!(2));
        } else {
            assert_eq!(pair["result"], json!(i * 10));
            assert_eq!(pair["error"], Value::Null);
        }
    }
}

#[tokio::test]
async fn test_daemon_job_is_forgotten_after_full_await() {
    let mock = MockBackend::new();
    mock.on("user.update", |_| MockReply::value(json!(true)));
    let session = open(&mock).await;

    let id = session
        .call("bulk_call", None, json!(["user.update", [[1], [2]]]))
        .await
        .unwrap();
    session
        .call("await_daemon_job", Some("5s"), json!([id.clone()]))
        .await
        .unwrap();

    let err = session
        .call("await_daemon_job", Some("5s"), json!([id]))
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::UnknownDaemonJob(_)));
}

#[tokio::test]
async fn test_peek_daemon_job_does_not_block() {
    let mock = MockBackend::new();
    mock.on("user.update", |_| {
        MockReply::value(json!(true)).after(Duration::from_millis(300))
    });
    let session = open(&mock).await;

    let id = session
        .call("bulk_call", None, json!(["user.update", [1, 2]]))
        .await
        .unwrap();
    let peek = session
        .call("peek_daemon_job", None, json!([id.clone()]))
        .await
        .unwrap();
    assert_eq!(peek["done"], json!(false));
    assert_eq!(peek["results"].as_array().unwrap().len(), 2);
    assert_eq!(peek["results"][0]["done"], json!(false));

    tokio::time::sleep(Duration::from_millis(400)).await;
    let peek = session
        .call("peek_daemon_job", None, json!([id]))
        .await
        .unwrap();
    assert_eq!(peek["done"], json!(true));
    assert_eq!(peek["results"][1]["result"], json!(true));
}

#[tokio::test]
async fn test_await_daemon_job_times_out_without_losing_results() {
    let mock = MockBackend::new();
    mock.on("user.update", |_| {
        MockReply::value(json!("ok")).after(Duration::from_millis(200))
    });
    let session = open(&mock).await;

    let id = session
        .call("bulk_call", None, json!(["user.update", [1]]))
        .await
        .unwrap();
    let err = session
        .call("await_daemon_job", Some("20ms"), json!([id.clone()]))
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::Timeout { .. }));

    let results = session
        .call("await_daemon_job", Some("5s"), json!([id]))
        .await
        .unwrap();
    assert_eq!(results, json!([{"result": "ok", "error": null}]));
}

#[tokio::test]
async fn test_external_job_await_and_peek() {
    let mock = MockBackend::new();
    let session = open(&mock).await;
    let job = mock.start_job(Duration::from_millis(150), Ok(json!({"bytes": 42})));

    let peek = session
        .call("peek_external_job", None, json!([job]))
        .await
        .unwrap();
    assert_eq!(peek["id"], json!(job));
    assert_eq!(peek["done"], json!(false));

    let result = session
        .call("await_external_job", Some("5s"), json!([job]))
        .await
        .unwrap();
    assert_eq!(result, json!({"bytes": 42}));
}

#[tokio::test]
async fn test_external_job_failure() {
    let mock = MockBackend::new();
    let session = open(&mock).await;
    let job = mock.start_job(Duration::from_millis(20), Err("replication failed".into()));

    let err = session
        .call("await_external_job", Some("5s"), json!([job]))
        .await
        .unwrap_err();
    match err {
        CallError::JobFailed { id, error, .. } => {
            assert_eq!(id, job);
            assert_eq!(error, "replication failed");
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_unknown_external_job_fails_fast() {
    let mock = MockBackend::new();
    let session = open(&mock).await;

    let err = session
        .call("await_external_job", Some("5s"), json!([99999]))
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::Backend { code: 22, .. }), "{:?}", err);
}

#[tokio::test]
async fn test_transport_failure_fails_pending_calls() {
    let mock = MockBackend::new();
    mock.on("system.hang", |_| MockReply::Silent);
    let session = open(&mock).await;

    let pending = {
        let session = session.clone();
        tokio::spawn(async move { session.call("system.hang", Some("5s"), json!([])).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    mock.kill_connections();

    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, CallError::Transport(_)), "{:?}", err);
    assert!(session.is_closed());

    let err = session.call("system.hang", None, json!([])).await.unwrap_err();
    assert!(matches!(err, CallError::Transport(_)), "{:?}", err);
}

#[tokio::test]
async fn test_close_interrupts_waiters() {
    let mock = MockBackend::new();
    mock.on("system.hang", |_| MockReply::Silent);
    let session = open(&mock).await;

    let pending = {
        let session = session.clone();
        tokio::spawn(async move { session.call("system.hang", Some("30s"), json!([])).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    session.close().await;

    let err = tokio::time::timeout(Duration::from_secs(2), pending)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert!(
        matches!(err, CallError::Interrupted | CallError::SessionClosed),
        "{:?}",
        err
    );
}

#[tokio::test]
async fn test_malformed_messages_are_dropped() {
    let mock = MockBackend::new();
    mock.on("system.info", |_| {
        MockReply::value(json!("ok")).after(Duration::from_millis(50))
    });
    let session = open(&mock).await;

    let call = {
        let session = session.clone();
        tokio::spawn(async move { session.call("system.info", None, json!([])).await })
    };
    mock.push_raw("{definitely not json");
    mock.push_raw(r#"{"method":"collection_update","params":{"collection":"alert.list","id":1}}"#);

    assert_eq!(call.await.unwrap().unwrap(), json!("ok"));
    assert!(!session.is_closed());
}

#[tokio::test]
async fn test_concurrent_calls_get_their_own_responses() {
    let mock = MockBackend::new();
    mock.on("echo.delay", |params| {
        let ms = params[0].as_u64().unwrap_or_default();
        MockReply::value(json!(ms)).after(Duration::from_millis(ms))
    });
    let session = open(&mock).await;

    let tasks: Vec<_> = [120u64, 10, 80, 40, 0]
        .into_iter()
        .map(|ms| {
            let session = session.clone();
            tokio::spawn(async move {
                (ms, session.call("echo.delay", Some("5s"), json!([ms])).await)
            })
        })
        .collect();
    for task in tasks {
        let (ms, result) = task.await.unwrap();
        assert_eq!(result.unwrap(), json!(ms));
    }
}

#[tokio::test]
async fn test_stats_reflect_tables() {
    let mock = MockBackend::new();
    mock.on("user.update", |_| {
        MockReply::value(json!(true)).after(Duration::from_millis(200))
    });
    let session = open(&mock).await;

    session
        .call("bulk_call", None, json!(["user.update", [1, 2, 3]]))
        .await
        .unwrap();
    let stats = session.stats();
    assert_eq!(stats.server, "nas.test");
    assert_eq!(stats.daemon_jobs, 1);
    assert_eq!(stats.operations, 3);
}
