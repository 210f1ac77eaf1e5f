use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;

use murmur_core::{CloseReason, InboundRequest};

use crate::error::RelayError;
use crate::session::{Inbound, TransportSession};

/// Pump frames between a WebSocket and its session until either side ends.
///
/// Opens the session once both halves are running. Returns after the
/// session has reached a terminal state.
pub async fn drive(
    socket: WebSocket,
    session: Arc<TransportSession>,
    outbound_rx: mpsc::Receiver<String>,
    heartbeat: Duration,
) {
    let (ws_tx, ws_rx) = socket.split();
    drive_split(ws_tx, ws_rx, session, outbound_rx, heartbeat).await;
}

async fn drive_split<W, R>(
    ws_tx: W,
    ws_rx: R,
    session: Arc<TransportSession>,
    outbound_rx: mpsc::Receiver<String>,
    heartbeat: Duration,
) where
    W: Sink<WsMessage> + Unpin + Send + 'static,
    W::Error: std::fmt::Display,
    R: Stream<Item = Result<WsMessage, axum::Error>> + Unpin + Send + 'static,
{
    let mut writer = tokio::spawn(write_loop(ws_tx, Arc::clone(&session), outbound_rx, heartbeat));
    let mut reader = tokio::spawn(read_loop(ws_rx, Arc::clone(&session)));

    session.open();

    tokio::select! {
        _ = &mut writer => {
            // Our close frame is out; the peer's acknowledgement is not needed.
            reader.abort();
        }
        _ = &mut reader => {
            let _ = writer.await;
        }
    }

    if !session.state().is_terminal() {
        session.fail("socket tasks ended without a close handshake");
    }
}

/// Forward queued events to the socket, ping on the heartbeat interval, and
/// send the close frame once the session is cancelled.
async fn write_loop<W>(
    mut ws_tx: W,
    session: Arc<TransportSession>,
    mut rx: mpsc::Receiver<String>,
    heartbeat: Duration,
) where
    W: Sink<WsMessage> + Unpin,
    W::Error: std::fmt::Display,
{
    let cancel = session.cancellation();
    let mut ping_interval = tokio::time::interval(heartbeat);
    ping_interval.tick().await; // consume first immediate tick

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            msg = rx.recv() => {
                let Some(text) = msg else { break };
                if let Err(e) = ws_tx.send(WsMessage::Text(text.into())).await {
                    session.fail(&RelayError::Transport(e.to_string()).to_string());
                    return;
                }
            }
            _ = ping_interval.tick() => {
                if let Err(e) = ws_tx.send(WsMessage::Ping(Vec::<u8>::new().into())).await {
                    session.fail(&RelayError::Transport(e.to_string()).to_string());
                    return;
                }
                tracing::trace!(session_id = %session.id(), "sent ping");
            }
        }
    }

    // Only a locally initiated close still owes the peer a close frame.
    let Some(reason) = session.close_reason() else {
        return;
    };
    if session.state().is_terminal() {
        return;
    }

    // Events queued before the close still go out.
    while let Ok(text) = rx.try_recv() {
        if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
            break;
        }
    }

    let frame = CloseFrame {
        code: reason.code(),
        reason: match reason {
            CloseReason::Normal => "session closed".into(),
            CloseReason::Abnormal => "internal error".into(),
        },
    };
    match ws_tx.send(WsMessage::Close(Some(frame))).await {
        Ok(()) => session.mark_closed(),
        Err(e) => session.fail(&RelayError::Transport(e.to_string()).to_string()),
    }
}

/// Parse text frames into the session's inbound queue.
async fn read_loop<R>(mut ws_rx: R, session: Arc<TransportSession>)
where
    R: Stream<Item = Result<WsMessage, axum::Error>> + Unpin,
{
    while let Some(msg) = ws_rx.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                session.fail(&RelayError::Transport(e.to_string()).to_string());
                return;
            }
        };

        match msg {
            WsMessage::Text(text) => {
                let inbound = match InboundRequest::parse(text.as_str()) {
                    Ok(request) => Inbound::Request(request),
                    Err(e) => Inbound::Malformed { detail: e.to_string() },
                };
                session.deliver_inbound(inbound);
            }
            WsMessage::Close(frame) => {
                let code = frame.as_ref().map(|f| f.code);
                tracing::info!(session_id = %session.id(), code, "peer closed connection");
                session.on_peer_close(CloseReason::from_code(code));
                return;
            }
            // axum answers pings itself
            WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Binary(_) => {}
        }
    }

    // Stream ended without a close frame.
    session.on_peer_close(CloseReason::Abnormal);
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc as fmpsc;
    use murmur_core::SessionState;

    struct Harness {
        session: Arc<TransportSession>,
        to_server: fmpsc::UnboundedSender<Result<WsMessage, axum::Error>>,
        from_server: fmpsc::UnboundedReceiver<WsMessage>,
        task: tokio::task::JoinHandle<()>,
    }

    fn harness() -> Harness {
        let (session, outbound_rx) = TransportSession::new(32, 8);
        let (to_server, ws_rx) = fmpsc::unbounded();
        let (ws_tx, from_server) = fmpsc::unbounded();
        let task = tokio::spawn(drive_split(
            ws_tx,
            ws_rx,
            Arc::clone(&session),
            outbound_rx,
            Duration::from_secs(30),
        ));
        Harness {
            session,
            to_server,
            from_server,
            task,
        }
    }

    async fn wait_open(session: &TransportSession) {
        while session.state() == SessionState::Connecting {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn text_frames_reach_inbound_queue() {
        let h = harness();
        let mut inbound = h.session.take_inbound().unwrap();
        wait_open(&h.session).await;

        h.to_server
            .unbounded_send(Ok(WsMessage::Text(r#"{"text":"hi"}"#.into())))
            .unwrap();
        h.to_server.unbounded_send(Ok(WsMessage::Text("nope".into()))).unwrap();

        assert_eq!(inbound.recv().await.unwrap(), Inbound::Request(InboundRequest::new("hi")));
        assert!(matches!(inbound.recv().await.unwrap(), Inbound::Malformed { .. }));
        assert!(h.session.is_open());
    }

    #[tokio::test]
    async fn sent_events_become_text_frames() {
        let mut h = harness();
        wait_open(&h.session).await;

        h.session.send(murmur_core::OutboundEvent::Done).await;
        match h.from_server.next().await.unwrap() {
            WsMessage::Text(text) => assert_eq!(text.as_str(), r#"{"type":"done"}"#),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn local_close_sends_close_frame() {
        let mut h = harness();
        wait_open(&h.session).await;

        h.session.close(CloseReason::Normal);
        h.task.await.unwrap();

        let mut close_code = None;
        while let Some(frame) = h.from_server.next().await {
            if let WsMessage::Close(Some(frame)) = frame {
                close_code = Some(frame.code);
            }
        }
        assert_eq!(close_code, Some(1000));
        assert_eq!(h.session.state(), SessionState::Closed(CloseReason::Normal));
    }

    #[tokio::test]
    async fn peer_close_frame_closes_session() {
        let h = harness();
        wait_open(&h.session).await;

        h.to_server
            .unbounded_send(Ok(WsMessage::Close(Some(CloseFrame {
                code: 1000,
                reason: "bye".into(),
            }))))
            .unwrap();
        h.task.await.unwrap();
        assert_eq!(h.session.state(), SessionState::Closed(CloseReason::Normal));
    }

    #[tokio::test]
    async fn dropped_peer_is_abnormal() {
        let h = harness();
        wait_open(&h.session).await;

        drop(h.to_server);
        h.task.await.unwrap();
        assert_eq!(h.session.state(), SessionState::Closed(CloseReason::Abnormal));
    }
}
