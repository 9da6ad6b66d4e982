//! Streaming ticker over the broker's websocket.
//!
//! The connection runs as one background task owning the socket. The engine
//! talks to it through a command channel (subscribe / unsubscribe / mode)
//! and receives parsed ticks and connection-state changes through a bounded
//! event channel. Reconnects are automatic with exponential backoff, and all
//! subscriptions are replayed after a reconnect.

use crate::api::frame::parse_frame;
use crate::config::TickerConfig;
use crate::types::{Tick, TickMode};
use crate::{Error, Result};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Connection-state and data events surfaced to the engine.
#[derive(Debug)]
pub enum TickerEvent {
    Tick(Tick),
    Connected,
    Disconnected,
    Reconnecting { attempt: u32 },
    Error(String),
}

enum TickerCommand {
    Subscribe(Vec<u32>),
    Unsubscribe(Vec<u32>),
    SetMode(TickMode, Vec<u32>),
}

/// Credentials and policy needed to open the ticker for one user.
#[derive(Clone)]
pub struct TickerConnector {
    ws_url: String,
    api_key: String,
    access_token: String,
    config: TickerConfig,
}

/// Command-side handle held by the engine.
#[derive(Clone)]
pub struct TickerHandle {
    cmd_tx: mpsc::Sender<TickerCommand>,
    connected: Arc<AtomicBool>,
}

impl TickerHandle {
    pub async fn subscribe(&self, tokens: Vec<u32>) -> Result<()> {
        self.send(TickerCommand::Subscribe(tokens)).await
    }

    pub async fn unsubscribe(&self, tokens: Vec<u32>) -> Result<()> {
        self.send(TickerCommand::Unsubscribe(tokens)).await
    }

    pub async fn set_mode(&self, mode: TickMode, tokens: Vec<u32>) -> Result<()> {
        self.send(TickerCommand::SetMode(mode, tokens)).await
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send(&self, command: TickerCommand) -> Result<()> {
        self.cmd_tx
            .send(command)
            .await
            .map_err(|_| Error::Cancelled)
    }
}

impl TickerConnector {
    pub fn new(
        ws_url: impl Into<String>,
        api_key: impl Into<String>,
        access_token: impl Into<String>,
        config: TickerConfig,
    ) -> Self {
        Self {
            ws_url: ws_url.into(),
            api_key: api_key.into(),
            access_token: access_token.into(),
            config,
        }
    }

    /// Spawn the connection task. Dropping the receiver or cancelling the
    /// token shuts the connection down.
    pub fn spawn(&self, shutdown: CancellationToken) -> (TickerHandle, mpsc::Receiver<TickerEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::channel(1024);
        let connected = Arc::new(AtomicBool::new(false));
        let handle = TickerHandle {
            cmd_tx,
            connected: connected.clone(),
        };
        tokio::spawn(run_ticker(self.clone(), cmd_rx, event_tx, connected, shutdown));
        (handle, event_rx)
    }
}

/// Backoff doubles from one second up to the configured ceiling.
fn reconnect_delay(attempt: u32, max_delay: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(20);
    Duration::from_secs(1u64 << exponent).min(max_delay)
}

enum SessionEnd {
    Shutdown,
    ReceiverGone,
    ConnectionLost,
}

async fn run_ticker(
    conn: TickerConnector,
    mut cmd_rx: mpsc::Receiver<TickerCommand>,
    event_tx: mpsc::Sender<TickerEvent>,
    connected: Arc<AtomicBool>,
    shutdown: CancellationToken,
) {
    let url = format!(
        "{}?api_key={}&access_token={}",
        conn.ws_url, conn.api_key, conn.access_token
    );
    let mut subscribed: HashMap<u32, TickMode> = HashMap::new();
    let mut attempt: u32 = 0;

    loop {
        if shutdown.is_cancelled() {
            break;
        }

        match timeout(conn.config.connect_timeout, connect_async(url.as_str())).await {
            Ok(Ok((stream, _))) => {
                attempt = 0;
                connected.store(true, Ordering::SeqCst);
                let _ = event_tx.send(TickerEvent::Connected).await;
                info!("Ticker connected");

                let end = run_session(
                    &conn,
                    stream,
                    &mut subscribed,
                    &mut cmd_rx,
                    &event_tx,
                    &shutdown,
                )
                .await;

                connected.store(false, Ordering::SeqCst);
                let _ = event_tx.send(TickerEvent::Disconnected).await;
                match end {
                    SessionEnd::Shutdown | SessionEnd::ReceiverGone => break,
                    SessionEnd::ConnectionLost => {}
                }
            }
            Ok(Err(e)) => warn!(error = %e, "Ticker connect failed"),
            Err(_) => warn!("Ticker connect timed out"),
        }

        attempt += 1;
        if attempt > conn.config.reconnect_max_tries {
            let _ = event_tx
                .send(TickerEvent::Error(
                    "maximum reconnection attempts exceeded".to_string(),
                ))
                .await;
            break;
        }
        let delay = reconnect_delay(attempt, conn.config.reconnect_max_delay);
        info!(attempt, delay_secs = delay.as_secs(), "Ticker reconnecting");
        let _ = event_tx.send(TickerEvent::Reconnecting { attempt }).await;
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = sleep(delay) => {}
        }
    }

    debug!("Ticker task finished");
}

async fn run_session(
    conn: &TickerConnector,
    stream: WsStream,
    subscribed: &mut HashMap<u32, TickMode>,
    cmd_rx: &mut mpsc::Receiver<TickerCommand>,
    event_tx: &mpsc::Sender<TickerEvent>,
    shutdown: &CancellationToken,
) -> SessionEnd {
    let (mut sink, mut read) = stream.split();

    if resubscribe(&mut sink, subscribed).await.is_err() {
        return SessionEnd::ConnectionLost;
    }

    let mut ping_timer = tokio::time::interval(conn.config.ping_interval);
    ping_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let heartbeat_deadline = conn.config.ping_interval + conn.config.pong_timeout;
    let mut last_pong = Instant::now();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let tokens: Vec<u32> = subscribed.keys().copied().collect();
                if !tokens.is_empty() {
                    let _ = send_json(&mut sink, &json!({"a": "unsubscribe", "v": tokens})).await;
                }
                let _ = sink.send(Message::Close(None)).await;
                return SessionEnd::Shutdown;
            }
            command = cmd_rx.recv() => match command {
                Some(command) => {
                    if apply_command(&mut sink, subscribed, command).await.is_err() {
                        return SessionEnd::ConnectionLost;
                    }
                }
                None => return SessionEnd::ReceiverGone,
            },
            message = read.next() => match message {
                Some(Ok(Message::Binary(data))) => {
                    for tick in parse_frame(&data) {
                        if event_tx.send(TickerEvent::Tick(tick)).await.is_err() {
                            return SessionEnd::ReceiverGone;
                        }
                    }
                }
                Some(Ok(Message::Text(text))) => {
                    handle_text_frame(&text, event_tx).await;
                }
                Some(Ok(Message::Ping(payload))) => {
                    let _ = sink.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Pong(_))) => {
                    last_pong = Instant::now();
                }
                Some(Ok(Message::Close(frame))) => {
                    info!(?frame, "Ticker closed by server");
                    return SessionEnd::ConnectionLost;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "Ticker read error");
                    return SessionEnd::ConnectionLost;
                }
                None => return SessionEnd::ConnectionLost,
            },
            _ = ping_timer.tick() => {
                if last_pong.elapsed() > heartbeat_deadline {
                    warn!("Ticker heartbeat timed out");
                    return SessionEnd::ConnectionLost;
                }
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    return SessionEnd::ConnectionLost;
                }
            }
        }
    }
}

async fn apply_command(
    sink: &mut WsSink,
    subscribed: &mut HashMap<u32, TickMode>,
    command: TickerCommand,
) -> Result<()> {
    match command {
        TickerCommand::Subscribe(tokens) => {
            send_json(sink, &json!({"a": "subscribe", "v": &tokens})).await?;
            for token in tokens {
                // The broker defaults fresh subscriptions to quote mode.
                subscribed.insert(token, TickMode::Quote);
            }
        }
        TickerCommand::Unsubscribe(tokens) => {
            send_json(sink, &json!({"a": "unsubscribe", "v": &tokens})).await?;
            for token in tokens {
                subscribed.remove(&token);
            }
        }
        TickerCommand::SetMode(mode, tokens) => {
            send_json(sink, &json!({"a": "mode", "v": [json!(mode.as_str()), json!(&tokens)]})).await?;
            for token in tokens {
                subscribed.insert(token, mode);
            }
        }
    }
    Ok(())
}

/// Replay every subscription and its mode after a reconnect.
async fn resubscribe(sink: &mut WsSink, subscribed: &HashMap<u32, TickMode>) -> Result<()> {
    if subscribed.is_empty() {
        return Ok(());
    }

    let mut by_mode: HashMap<TickMode, Vec<u32>> = HashMap::new();
    for (token, mode) in subscribed {
        by_mode.entry(*mode).or_default().push(*token);
    }

    let all: Vec<u32> = subscribed.keys().copied().collect();
    debug!(count = all.len(), "Resubscribing after reconnect");
    send_json(sink, &json!({"a": "subscribe", "v": all})).await?;
    for (mode, tokens) in by_mode {
        send_json(sink, &json!({"a": "mode", "v": [mode.as_str(), tokens]})).await?;
    }
    Ok(())
}

async fn send_json(sink: &mut WsSink, payload: &serde_json::Value) -> Result<()> {
    sink.send(Message::Text(payload.to_string())).await?;
    Ok(())
}

/// Text frames carry error notices and order postbacks; only errors matter
/// to the engine.
async fn handle_text_frame(text: &str, event_tx: &mpsc::Sender<TickerEvent>) {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else {
        return;
    };
    match value.get("type").and_then(|t| t.as_str()) {
        Some("error") => {
            let message = value
                .get("data")
                .map(|d| d.to_string())
                .unwrap_or_else(|| "unknown ticker error".to_string());
            let _ = event_tx.send(TickerEvent::Error(message)).await;
        }
        Some("order") => {
            debug!("Ignoring order postback on ticker channel");
        }
        _ => {}
    }
}
