use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chronowire_core::ChronowireConfig;
use chronowire_gateway::{Chronowire, Target};
use chronowire_rooms::ConnectionHandle;
use chronowire_scheduler::{
    db::SqliteJobStore, Chronology, JobContext, JobRecord, JobState, JobStore, Schedule,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tower::ServiceExt;

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn test_config() -> ChronowireConfig {
    let mut config = ChronowireConfig::default();
    config.scheduler.store = "memory".to_string();
    config.scheduler.poll_interval_ms = 50;
    config
}

async fn serve(cw: &Chronowire) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = cw.clone();
    tokio::spawn(async move { server.serve(listener).await });
    format!("ws://{addr}/ws")
}

/// Open a client and consume the `connected` greeting.
async fn connect(url: &str) -> (Ws, String) {
    let (mut ws, _) = connect_async(url).await.unwrap();
    let hello = next_event(&mut ws, "connected").await;
    let conn_id = hello["payload"]["conn_id"].as_str().unwrap().to_string();
    (ws, conn_id)
}

async fn next_frame(ws: &mut Ws) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(_) = msg {
            return serde_json::from_str(msg.to_text().unwrap()).unwrap();
        }
    }
}

async fn next_event(ws: &mut Ws, name: &str) -> Value {
    loop {
        let frame = next_frame(ws).await;
        if frame["type"] == "event" && frame["event"] == name {
            return frame;
        }
    }
}

async fn request(ws: &mut Ws, id: &str, method: &str, params: Value) -> Value {
    let req = json!({ "type": "req", "id": id, "method": method, "params": params });
    ws.send(Message::text(req.to_string())).await.unwrap();
    loop {
        let frame = next_frame(ws).await;
        if frame["type"] == "res" && frame["id"] == id {
            return frame;
        }
    }
}

/// Assert nothing but heartbeats arrives for a while.
async fn assert_quiet(ws: &mut Ws) {
    let got = tokio::time::timeout(Duration::from_millis(300), async {
        loop {
            let frame = next_frame(ws).await;
            if frame["event"] != "tick" {
                return frame;
            }
        }
    })
    .await;
    assert!(got.is_err(), "unexpected frame: {got:?}");
}

#[tokio::test]
async fn room_message_reaches_subscribers_only() {
    let cw = Chronowire::new(test_config()).unwrap();
    let url = serve(&cw).await;

    let (mut a, _) = connect(&url).await;
    let (mut b, _) = connect(&url).await;
    let (mut c, _) = connect(&url).await;

    let res = request(&mut a, "1", "subscribe", json!({ "rooms": "r1" })).await;
    assert_eq!(res["ok"], true);
    assert_eq!(res["payload"]["rooms"], json!(["r1"]));

    let res = request(
        &mut b,
        "2",
        "send",
        json!({ "event": "chat", "payload": "hello", "rooms": "r1" }),
    )
    .await;
    assert_eq!(res["ok"], true);
    assert_eq!(res["payload"]["delivered"], 1);

    let ev = next_event(&mut a, "chat").await;
    assert_eq!(ev["payload"], "hello");
    assert!(ev["seq"].is_u64());
    assert_quiet(&mut c).await;
}

#[tokio::test]
async fn non_broadcast_send_skips_sender_and_needs_a_target() {
    let cw = Chronowire::new(test_config()).unwrap();
    let url = serve(&cw).await;

    let (mut a, _) = connect(&url).await;
    let (mut b, _) = connect(&url).await;
    request(&mut a, "1", "subscribe", json!({ "rooms": ["r1"] })).await;
    request(&mut b, "1", "subscribe", json!({ "rooms": ["r1"] })).await;

    let res = request(
        &mut a,
        "2",
        "send",
        json!({ "event": "typing", "rooms": "r1", "broadcast": false }),
    )
    .await;
    assert_eq!(res["payload"]["delivered"], 1);
    next_event(&mut b, "typing").await;
    assert_quiet(&mut a).await;

    let res = request(&mut a, "3", "send", json!({ "event": "typing", "broadcast": false })).await;
    assert_eq!(res["ok"], false);
    assert_eq!(res["error"]["code"], "MISSING_TARGET");

    let res = request(&mut a, "4", "send", json!({ "event": "dm", "to": "nobody" })).await;
    assert_eq!(res["error"]["code"], "CONNECTION_NOT_FOUND");
}

#[tokio::test]
async fn direct_send_from_host() {
    let cw = Chronowire::new(test_config()).unwrap();
    let url = serve(&cw).await;
    let (mut a, a_id) = connect(&url).await;

    assert_eq!(cw.connections().len(), 1);
    assert_eq!(cw.connection(&a_id).unwrap().id(), a_id);

    let report = cw
        .send_message(&Target::Connection(a_id.clone()), "notice", json!({ "n": 1 }), None)
        .await
        .unwrap();
    assert_eq!(report.delivered, 1);
    let ev = next_event(&mut a, "notice").await;
    assert_eq!(ev["payload"]["n"], 1);
}

#[tokio::test]
async fn listeners_and_custom_events() {
    let cw = Chronowire::new(test_config()).unwrap();
    let subscribes = Arc::new(AtomicUsize::new(0));
    let typing = Arc::new(AtomicUsize::new(0));
    {
        let s = Arc::clone(&subscribes);
        cw.on_subscribe(move |_ev| {
            let s = Arc::clone(&s);
            async move {
                s.fetch_add(1, Ordering::SeqCst);
                anyhow::Ok(())
            }
        });
        let t = Arc::clone(&typing);
        cw.on_custom_event("typing", move |ev| {
            let t = Arc::clone(&t);
            async move {
                assert_eq!(ev.payload["who"], "a");
                t.fetch_add(1, Ordering::SeqCst);
                anyhow::Ok(())
            }
        });
    }
    let url = serve(&cw).await;
    let (mut a, _) = connect(&url).await;

    request(&mut a, "1", "subscribe", json!({ "rooms": "r1" })).await;
    // Already a member: no second notification.
    request(&mut a, "2", "subscribe", json!({ "rooms": "r1" })).await;
    assert_eq!(subscribes.load(Ordering::SeqCst), 1);

    let res = request(&mut a, "3", "typing", json!({ "who": "a" })).await;
    assert_eq!(res["ok"], true);
    assert_eq!(res["payload"]["handled"], 1);
    assert_eq!(typing.load(Ordering::SeqCst), 1);

    assert_eq!(cw.remove_listeners("typing"), 1);
    let res = request(&mut a, "4", "typing", json!({ "who": "a" })).await;
    assert_eq!(res["error"]["code"], "METHOD_NOT_FOUND");

    let res = request(&mut a, "5", "ping", Value::Null).await;
    assert_eq!(res["payload"]["pong"], true);
}

#[tokio::test]
async fn scheduled_message_fires_and_reports_completion() {
    let cw = Chronowire::new(test_config()).unwrap();
    cw.start().await.unwrap();
    let url = serve(&cw).await;
    let (mut a, _) = connect(&url).await;
    request(&mut a, "1", "subscribe", json!({ "rooms": "r1" })).await;

    let res = request(
        &mut a,
        "2",
        "jobs.schedule_message",
        json!({
            "when": "1 second",
            "event": "reminder",
            "payload": { "msg": "hi" },
            "rooms": "r1"
        }),
    )
    .await;
    assert_eq!(res["ok"], true, "{res}");
    let reference = res["payload"]["reference"].as_str().unwrap().to_string();
    request(&mut a, "3", "subscribe", json!({ "rooms": format!("job:{reference}") })).await;

    let ev = next_event(&mut a, "reminder").await;
    assert_eq!(ev["payload"]["msg"], "hi");
    let done = next_event(&mut a, "job.completed").await;
    assert_eq!(done["payload"]["reference"], reference.as_str());
    assert_eq!(done["payload"]["status"], "completed");

    let res = request(&mut a, "4", "jobs.list", Value::Null).await;
    assert_eq!(res["payload"]["jobs"], json!([]));

    let res = request(
        &mut a,
        "5",
        "jobs.schedule_message",
        json!({ "when": "someday", "event": "x", "rooms": "r1" }),
    )
    .await;
    assert_eq!(res["error"]["code"], "INVALID_SCHEDULE");

    cw.shutdown().await;
}

#[tokio::test]
async fn jobs_can_be_canceled_over_ws() {
    let cw = Chronowire::new(test_config()).unwrap();
    let url = serve(&cw).await;
    let (mut a, _) = connect(&url).await;

    let res = request(
        &mut a,
        "1",
        "jobs.schedule_message",
        json!({ "when": "every 10 minutes", "chronology": "recurring", "event": "x" }),
    )
    .await;
    let id = res["payload"]["id"].as_str().unwrap().to_string();

    let res = request(&mut a, "2", "jobs.cancel", json!({ "id": id })).await;
    assert_eq!(res["ok"], true);
    let res = request(&mut a, "3", "jobs.cancel", json!({ "id": id })).await;
    assert_eq!(res["error"]["code"], "NOT_FOUND");
    let res = request(&mut a, "4", "jobs.cancel", json!({})).await;
    assert_eq!(res["error"]["code"], "INVALID_PARAMS");
}

#[tokio::test]
async fn disconnect_leaves_every_room() {
    let cw = Chronowire::new(test_config()).unwrap();
    let url = serve(&cw).await;
    let (mut a, _) = connect(&url).await;
    request(&mut a, "1", "subscribe", json!({ "rooms": ["r1", "r2"] })).await;
    assert_eq!(cw.registry().room_count(), 2);

    a.close(None).await.unwrap();
    for _ in 0..100 {
        if cw.registry().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(cw.registry().is_empty());
    assert!(cw.registry().members_of("r1").is_empty());
    assert_eq!(cw.registry().room_count(), 0);
}

async fn wait_until_empty(cw: &Chronowire) {
    for _ in 0..100 {
        if cw.registry().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn panicking_listener_still_leaves_every_room() {
    let cw = Chronowire::new(test_config()).unwrap();
    cw.on_custom_event("explode", |_ev| async move {
        if true {
            panic!("listener bug");
        }
        anyhow::Ok(())
    });
    let url = serve(&cw).await;
    let (mut a, a_id) = connect(&url).await;
    request(&mut a, "1", "subscribe", json!({ "rooms": "r1" })).await;
    assert!(cw.registry().members_of("r1").contains(&a_id));

    let req = json!({ "type": "req", "id": "2", "method": "explode", "params": {} });
    a.send(Message::text(req.to_string())).await.unwrap();

    wait_until_empty(&cw).await;
    assert!(!cw.registry().contains(&a_id));
    assert!(cw.registry().members_of("r1").is_empty());
}

#[tokio::test]
async fn out_of_range_schedule_is_rejected_over_ws() {
    let cw = Chronowire::new(test_config()).unwrap();
    let url = serve(&cw).await;
    let (mut a, a_id) = connect(&url).await;
    request(&mut a, "1", "subscribe", json!({ "rooms": "r1" })).await;

    let res = request(
        &mut a,
        "2",
        "jobs.schedule_message",
        json!({ "when": "in 99999999 weeks", "event": "x", "rooms": "r1" }),
    )
    .await;
    assert_eq!(res["error"]["code"], "INVALID_SCHEDULE");

    // The session is still usable.
    let res = request(&mut a, "3", "ping", Value::Null).await;
    assert_eq!(res["payload"]["pong"], true);
    assert!(cw.registry().members_of("r1").contains(&a_id));
}

#[tokio::test]
async fn oversized_message_gets_an_error_then_close() {
    let cw = Chronowire::new(test_config()).unwrap();
    let url = serve(&cw).await;
    let (mut a, _) = connect(&url).await;

    let big = "x".repeat(chronowire_core::config::MAX_PAYLOAD_BYTES + 1);
    a.send(Message::text(big)).await.unwrap();
    let res = next_frame(&mut a).await;
    assert_eq!(res["type"], "res");
    assert_eq!(res["error"]["code"], "PAYLOAD_TOO_LARGE");

    wait_until_empty(&cw).await;
    assert!(cw.registry().is_empty());
}

#[tokio::test]
async fn message_past_the_codec_limit_drops_the_connection() {
    let cw = Chronowire::new(test_config()).unwrap();
    let url = serve(&cw).await;
    let (mut a, _) = connect(&url).await;

    let huge = "x".repeat(4 * chronowire_core::config::MAX_PAYLOAD_BYTES);
    // The server may reset before the whole frame is written.
    let _ = a.send(Message::text(huge)).await;

    wait_until_empty(&cw).await;
    assert!(cw.registry().is_empty());
}

#[tokio::test]
async fn server_side_close_ends_the_socket() {
    let cw = Chronowire::new(test_config()).unwrap();
    let url = serve(&cw).await;
    let (mut a, a_id) = connect(&url).await;

    cw.connection(&a_id).unwrap().close();
    let ended = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match a.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(ended.is_ok());
}

#[tokio::test]
async fn health_reports_connections_and_rooms() {
    let cw = Chronowire::new(test_config()).unwrap();
    let url = serve(&cw).await;
    let (mut a, _) = connect(&url).await;
    request(&mut a, "1", "subscribe", json!({ "rooms": "r1" })).await;

    let res = cw
        .router()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
    let health: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["connections"], 1);
    assert_eq!(health["rooms"], 1);
}

#[tokio::test]
async fn facade_schedule_task_runs_handler_once() {
    let cw = Chronowire::new(test_config()).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&calls);
    let job = cw
        .schedule_task(
            "greet",
            "1 second",
            Chronology::OneShot,
            json!({ "msg": "hi" }),
            move |ctx: JobContext| {
                let c = Arc::clone(&c);
                async move {
                    assert_eq!(ctx.payload["msg"], "hi");
                    c.fetch_add(1, Ordering::SeqCst);
                    anyhow::Ok(())
                }
            },
        )
        .await
        .unwrap();
    cw.start().await.unwrap();

    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(cw.scheduler().get_job(&job.id).await.unwrap().is_none());
    cw.shutdown().await;
}

#[tokio::test]
async fn restart_rejuvenates_interrupted_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("jobs.db");

    {
        let store = SqliteJobStore::open(&path).unwrap();
        let due = chrono::Utc::now() - chrono::Duration::seconds(1);
        let mut job = JobRecord::new(
            "greet",
            json!({}),
            Chronology::OneShot,
            Schedule::Once { at: due },
            due,
        );
        job.state = JobState::Running;
        store.create(&job).await.unwrap();
    }

    let mut config = test_config();
    config.scheduler.store = format!("sqlite://{}", path.display());
    let cw = Chronowire::new(config).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&calls);
    cw.register_handler("greet", move |_ctx: JobContext| {
        let c = Arc::clone(&c);
        async move {
            c.fetch_add(1, Ordering::SeqCst);
            anyhow::Ok(())
        }
    });

    assert_eq!(cw.start().await.unwrap(), 1);
    for _ in 0..100 {
        if calls.load(Ordering::SeqCst) > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cw.shutdown().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(cw.jobs().await.unwrap().is_empty());
}
