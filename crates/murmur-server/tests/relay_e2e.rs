use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use murmur_core::{CompletionClient, CompletionError, OutboundEvent};
use murmur_llm::{DemoClient, ScriptedClient, ScriptedResponse};
use murmur_server::{start, ServerConfig, ServerHandle};
use murmur_telemetry::MetricsRecorder;

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WEATHER_REPLY: &str = "Thanks for your message! This is a demo response. To use real AI responses, please add a valid OpenAI API key to your .env file.";

async fn boot(client: Arc<dyn CompletionClient>) -> ServerHandle {
    boot_with_metrics(client, None).await
}

async fn boot_with_metrics(
    client: Arc<dyn CompletionClient>,
    metrics: Option<Arc<MetricsRecorder>>,
) -> ServerHandle {
    let config = ServerConfig {
        port: 0,
        ..Default::default()
    };
    start(config, client, metrics).await.unwrap()
}

async fn connect(handle: &ServerHandle, path: &str) -> Ws {
    let url = format!("ws://127.0.0.1:{}{}", handle.port(), path);
    let (ws, _) = connect_async(url).await.unwrap();
    ws
}

async fn send_text(ws: &mut Ws, raw: &str) {
    ws.send(Message::text(raw)).await.unwrap();
}

/// Read events until a terminal one arrives.
async fn read_until_terminal(ws: &mut Ws) -> Vec<OutboundEvent> {
    let mut events = Vec::new();
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(10), ws.next())
            .await
            .expect("timed out waiting for event")
            .expect("socket ended")
            .unwrap();
        if !msg.is_text() {
            continue;
        }
        let event: OutboundEvent = serde_json::from_str(msg.to_text().unwrap()).unwrap();
        let terminal = event.is_terminal();
        events.push(event);
        if terminal {
            return events;
        }
    }
}

fn tokens(events: &[OutboundEvent]) -> Vec<&str> {
    events
        .iter()
        .filter_map(|e| match e {
            OutboundEvent::Token { value } => Some(value.as_str()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn demo_weather_streams_per_character_then_done() {
    let handle = boot(Arc::new(DemoClient::new(Duration::ZERO))).await;
    let mut ws = connect(&handle, "/").await;

    send_text(&mut ws, r#"{"text":"What's the weather?"}"#).await;
    let events = read_until_terminal(&mut ws).await;

    assert_eq!(events.last(), Some(&OutboundEvent::Done));
    let toks = tokens(&events);
    assert_eq!(toks.len(), WEATHER_REPLY.chars().count());
    assert!(toks.iter().all(|t| t.chars().count() == 1));
    assert_eq!(toks.concat(), WEATHER_REPLY);
    assert_eq!(events.len(), toks.len() + 1);

    handle.shutdown().await;
}

#[tokio::test]
async fn ws_alias_path_works() {
    let handle = boot(Arc::new(ScriptedClient::new(vec![ScriptedResponse::text(&["ok"])]))).await;
    let mut ws = connect(&handle, "/ws").await;

    send_text(&mut ws, r#"{"text":"ping"}"#).await;
    let events = read_until_terminal(&mut ws).await;
    assert_eq!(events, vec![OutboundEvent::token("ok"), OutboundEvent::Done]);

    handle.shutdown().await;
}

#[tokio::test]
async fn empty_input_gets_single_error_and_no_upstream_call() {
    let client = Arc::new(ScriptedClient::new(vec![]));
    let handle = boot(client.clone()).await;
    let mut ws = connect(&handle, "/").await;

    send_text(&mut ws, r#"{"text":"   "}"#).await;
    let events = read_until_terminal(&mut ws).await;
    assert_eq!(events, vec![OutboundEvent::error("Message cannot be empty")]);

    send_text(&mut ws, "{}").await;
    let events = read_until_terminal(&mut ws).await;
    assert_eq!(events, vec![OutboundEvent::error("Message cannot be empty")]);

    send_text(&mut ws, r#"{"text":null}"#).await;
    let events = read_until_terminal(&mut ws).await;
    assert_eq!(events, vec![OutboundEvent::error("Message cannot be empty")]);

    assert_eq!(client.call_count(), 0);
    handle.shutdown().await;
}

#[tokio::test]
async fn malformed_json_keeps_session_open() {
    let client = Arc::new(ScriptedClient::new(vec![ScriptedResponse::text(&["still ", "here"])]));
    let handle = boot(client).await;
    let mut ws = connect(&handle, "/").await;

    send_text(&mut ws, "this is not json").await;
    let events = read_until_terminal(&mut ws).await;
    assert_eq!(events.len(), 1);
    match &events[0] {
        OutboundEvent::Error { message } => {
            assert!(message.starts_with("Failed to process message: "), "got {message}");
        }
        other => panic!("expected error, got {other:?}"),
    }

    send_text(&mut ws, r#"{"text":"hello?"}"#).await;
    let events = read_until_terminal(&mut ws).await;
    assert_eq!(tokens(&events).concat(), "still here");
    assert_eq!(events.last(), Some(&OutboundEvent::Done));

    handle.shutdown().await;
}

#[tokio::test]
async fn upstream_failure_is_one_classified_error() {
    let client = Arc::new(ScriptedClient::new(vec![ScriptedResponse::FailAfter(
        vec!["half".into()],
        CompletionError::Quota("429".into()),
    )]));
    let handle = boot(client).await;
    let mut ws = connect(&handle, "/").await;

    send_text(&mut ws, r#"{"text":"hello"}"#).await;
    let events = read_until_terminal(&mut ws).await;
    assert_eq!(
        events,
        vec![
            OutboundEvent::token("half"),
            OutboundEvent::error("API quota exceeded. Please check your provider account billing."),
        ]
    );

    handle.shutdown().await;
}

#[tokio::test]
async fn back_to_back_requests_are_serialized() {
    let client = Arc::new(ScriptedClient::new(vec![
        ScriptedResponse::Paced(vec!["one".into(), "two".into()], Duration::from_millis(20)),
        ScriptedResponse::text(&["three"]),
    ]));
    let handle = boot(client.clone()).await;
    let mut ws = connect(&handle, "/").await;

    send_text(&mut ws, r#"{"text":"first"}"#).await;
    send_text(&mut ws, r#"{"text":"second"}"#).await;

    let first = read_until_terminal(&mut ws).await;
    let second = read_until_terminal(&mut ws).await;
    assert_eq!(first, vec![OutboundEvent::token("one"), OutboundEvent::token("two"), OutboundEvent::Done]);
    assert_eq!(second, vec![OutboundEvent::token("three"), OutboundEvent::Done]);
    assert_eq!(client.prompts(), vec!["first", "second"]);

    handle.shutdown().await;
}

#[tokio::test]
async fn client_disconnect_mid_stream_drops_upstream() {
    let client = Arc::new(ScriptedClient::new(vec![ScriptedResponse::Hang]));
    let handle = boot(client.clone()).await;
    let mut ws = connect(&handle, "/").await;

    send_text(&mut ws, r#"{"text":"hello"}"#).await;
    while client.call_count() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    ws.close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: "bye".into(),
    }))
    .await
    .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while (client.streams_dropped() == 0 || handle.session_count() > 0)
        && tokio::time::Instant::now() < deadline
    {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(client.streams_dropped(), 1);
    assert_eq!(handle.session_count(), 0);

    handle.shutdown().await;
}

#[tokio::test]
async fn shutdown_closes_sessions_normally() {
    let handle = boot(Arc::new(DemoClient::new(Duration::ZERO))).await;
    let mut ws = connect(&handle, "/").await;

    while handle.session_count() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    handle.shutdown().await;

    let mut close_code = None;
    while let Ok(Some(Ok(msg))) = tokio::time::timeout(Duration::from_secs(5), ws.next()).await {
        if let Message::Close(frame) = msg {
            close_code = frame.map(|f| u16::from(f.code));
            break;
        }
    }
    assert_eq!(close_code, Some(1000));
}

#[tokio::test]
async fn health_reports_live_sessions_and_metrics_record_traffic() {
    let recorder = Arc::new(MetricsRecorder::new());
    let handle = boot_with_metrics(
        Arc::new(ScriptedClient::new(vec![ScriptedResponse::text(&["a", "b"])]).as_demo()),
        Some(Arc::clone(&recorder)),
    )
    .await;
    let mut ws = connect(&handle, "/").await;

    send_text(&mut ws, r#"{"text":"hi"}"#).await;
    read_until_terminal(&mut ws).await;

    let body: serde_json::Value = reqwest::get(format!("http://127.0.0.1:{}/health", handle.port()))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["sessions"], 1);
    assert_eq!(body["mode"], "demo");

    // The observer runs on its own task.
    let labels = [("mode", "demo")];
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while recorder.counter_get("relay.tokens.total", &labels) < 2 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(recorder.counter_get("relay.requests.total", &labels), 1);
    assert_eq!(recorder.counter_get("relay.tokens.total", &labels), 2);
    assert_eq!(recorder.gauge_get("ws.sessions.active", &[]), 1.0);

    let body: serde_json::Value = reqwest::get(format!("http://127.0.0.1:{}/health", handle.port()))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let series = body["metrics"].as_array().unwrap();
    let tokens = series
        .iter()
        .find(|s| s["name"] == "relay.tokens.total")
        .unwrap();
    assert_eq!(tokens["value"], 2.0);
    assert_eq!(tokens["metric_type"], "counter");

    handle.shutdown().await;
}
