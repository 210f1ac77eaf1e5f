use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use murmur_core::{CloseReason, InboundRequest, OutboundEvent};

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::reconnect::{ReconnectDecision, ReconnectPolicy};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const COMMAND_BUFFER: usize = 32;

/// Connection indicator exposed to the renderer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    /// Retries are exhausted. Terminal.
    Error,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the driver reports, in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientEvent {
    Status(ConnectionStatus),
    Outbound(OutboundEvent),
    Reconnecting { attempt: u32, delay: Duration },
    GaveUp { attempts: u32 },
}

enum Command {
    Send {
        text: String,
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
    Close,
}

/// How a connected session ended.
enum SessionEnd {
    Dropped(CloseReason),
    /// Close requested or every handle dropped; the driver stops.
    Shutdown,
}

/// Entry point: spawns the driver task for one logical chat connection.
pub struct ChatConnection;

impl ChatConnection {
    /// Start connecting in the background. Must be called inside a tokio runtime.
    pub fn connect(config: ClientConfig) -> (ChatHandle, ChatEvents) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Connecting);

        let driver = Driver {
            policy: ReconnectPolicy::new(config.reconnect.clone()),
            url: config.url,
            commands: command_rx,
            events: event_tx,
            status: status_tx,
        };
        tokio::spawn(driver.run());

        (
            ChatHandle {
                commands: command_tx,
                status: status_rx,
            },
            ChatEvents { rx: event_rx },
        )
    }
}

/// Cloneable control half. Dropping every handle tears the connection down.
#[derive(Clone)]
pub struct ChatHandle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<ConnectionStatus>,
}

impl ChatHandle {
    /// Send one user message. At most one request may be awaiting its
    /// terminal event at a time.
    pub async fn send(&self, text: impl Into<String>) -> Result<(), ClientError> {
        if self.status() != ConnectionStatus::Connected {
            return Err(ClientError::NotConnected);
        }
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Send {
                text: text.into(),
                reply,
            })
            .await
            .map_err(|_| ClientError::Closed)?;
        rx.await.map_err(|_| ClientError::Closed)?
    }

    /// Intentional close: sends code 1000 and cancels any pending retry.
    pub async fn close(&self) {
        // A stopped driver is already closed.
        let _ = self.commands.send(Command::Close).await;
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }
}

/// Consumable event half.
pub struct ChatEvents {
    rx: mpsc::UnboundedReceiver<ClientEvent>,
}

impl ChatEvents {
    /// Next event, or `None` once the driver has stopped.
    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        self.rx.recv().await
    }
}

struct Driver {
    url: String,
    policy: ReconnectPolicy,
    commands: mpsc::Receiver<Command>,
    events: mpsc::UnboundedSender<ClientEvent>,
    status: watch::Sender<ConnectionStatus>,
}

impl Driver {
    async fn run(mut self) {
        loop {
            self.set_status(ConnectionStatus::Connecting);

            let reason = match connect_async(self.url.as_str()).await {
                Ok((ws, _)) => {
                    tracing::info!(url = %self.url, "connected");
                    self.policy.on_open();
                    self.set_status(ConnectionStatus::Connected);
                    match self.run_session(ws).await {
                        SessionEnd::Dropped(reason) => reason,
                        SessionEnd::Shutdown => break,
                    }
                }
                Err(e) => {
                    tracing::warn!(url = %self.url, error = %e, "connect failed");
                    CloseReason::Abnormal
                }
            };

            match self.policy.on_close(reason) {
                ReconnectDecision::Retry { attempt, delay } => {
                    self.set_status(ConnectionStatus::Disconnected);
                    self.emit(ClientEvent::Reconnecting { attempt, delay });
                    if !self.wait_retry(delay).await {
                        break;
                    }
                }
                ReconnectDecision::GiveUp { attempts } => {
                    self.set_status(ConnectionStatus::Error);
                    self.emit(ClientEvent::GaveUp { attempts });
                    return;
                }
                ReconnectDecision::Stay => break,
            }
        }

        self.policy.reset();
        self.set_status(ConnectionStatus::Disconnected);
        tracing::debug!(url = %self.url, "connection driver stopped");
    }

    /// Sleep out a retry delay. Returns `false` if the connection was torn
    /// down meanwhile, which also cancels the timer.
    async fn wait_retry(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return self.policy.begin_attempt(),
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Send { reply, .. }) => {
                        let _ = reply.send(Err(ClientError::NotConnected));
                    }
                    Some(Command::Close) | None => {
                        tracing::debug!("pending reconnect cancelled");
                        return false;
                    }
                },
            }
        }
    }

    async fn run_session(&mut self, mut ws: Ws) -> SessionEnd {
        let mut awaiting_terminal = false;

        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Send { text, reply }) => {
                        if awaiting_terminal {
                            let _ = reply.send(Err(ClientError::Busy));
                            continue;
                        }
                        let json = match serde_json::to_string(&InboundRequest::new(text)) {
                            Ok(json) => json,
                            Err(e) => {
                                let _ = reply.send(Err(e.into()));
                                continue;
                            }
                        };
                        if let Err(e) = ws.send(Message::text(json)).await {
                            tracing::warn!(error = %e, "send failed");
                            let _ = reply.send(Err(ClientError::Transport(e.to_string())));
                            return SessionEnd::Dropped(CloseReason::Abnormal);
                        }
                        awaiting_terminal = true;
                        let _ = reply.send(Ok(()));
                    }
                    Some(Command::Close) | None => {
                        let frame = CloseFrame {
                            code: CloseCode::Normal,
                            reason: "client closed".into(),
                        };
                        if let Err(e) = ws.close(Some(frame)).await {
                            tracing::debug!(error = %e, "close handshake failed");
                        }
                        return SessionEnd::Shutdown;
                    }
                },
                msg = ws.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<OutboundEvent>(text.as_str()) {
                            Ok(event) => {
                                if event.is_terminal() {
                                    awaiting_terminal = false;
                                }
                                self.emit(ClientEvent::Outbound(event));
                            }
                            Err(e) => tracing::warn!(error = %e, "unrecognized server frame"),
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let code = frame.map(|f| u16::from(f.code));
                        tracing::info!(code, "server closed connection");
                        return SessionEnd::Dropped(CloseReason::from_code(code));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "connection error");
                        return SessionEnd::Dropped(CloseReason::Abnormal);
                    }
                    None => return SessionEnd::Dropped(CloseReason::Abnormal),
                },
            }
        }
    }

    fn set_status(&self, status: ConnectionStatus) {
        let previous = self.status.send_replace(status);
        if previous != status {
            tracing::debug!(from = %previous, to = %status, "connection status");
            self.emit(ClientEvent::Status(status));
        }
    }

    fn emit(&self, event: ClientEvent) {
        // The event half may have been dropped; the handle still works.
        let _ = self.events.send(event);
    }
}
