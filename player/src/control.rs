//! Control channel.
//!
//! A persistent WebSocket used only to request and receive track metadata.
//! Inbound text is parsed as JSON when possible and delivered as an opaque
//! payload otherwise. The connection is supervised with the control-channel
//! reconnection policy; an explicit stop suppresses all automatic
//! reconnection.

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use live_player_common::MetricsContext;

use crate::reconnect::{ConnectionAttempt, ReconnectPolicy};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Outbound command asking the server for current track metadata.
pub const METADATA_REQUEST: &str = "metadata";

/// Track metadata pushed by the server.
///
/// Numeric fields feed the playback clock; the rest is display data passed
/// through to the consumer.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TrackMetadata {
    // ---
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub author: Option<String>,

    #[serde(default)]
    pub image: Option<String>,

    /// Where the active track starts on the broadcast timeline.
    pub active_file_start_time_ms: i64,

    /// Duration of the active track.
    pub active_file_duration_ms: i64,

    /// Server-reported playhead, when the server knows it.
    #[serde(default)]
    pub current_offset_ms: Option<i64>,

    /// Buffering hint for latency compensation.
    #[serde(default)]
    pub buffer_size_ms: i64,
}

impl TrackMetadata {
    // ---
    /// Position the clock should resync to.
    ///
    /// The server's playhead wins when present; the track start time only
    /// anchors where progress display begins.
    pub fn resync_target_ms(&self) -> i64 {
        // ---
        self.current_offset_ms
            .unwrap_or(self.active_file_start_time_ms)
    }
}

/// Events delivered to the control channel consumer.
#[derive(Debug, Clone)]
pub enum ControlEvent {
    // ---
    /// Parsed track metadata.
    Metadata(TrackMetadata),

    /// Payload that was not metadata JSON, delivered as-is.
    Raw(String),

    /// Retry budget exhausted; no further automatic reconnects.
    GaveUp,
}

/// Outbound control messages: raw strings or JSON-serializable values.
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    // ---
    Raw(String),
    Json(serde_json::Value),
}

/// Classifies one inbound text payload.
fn classify_text(text: &str) -> ControlEvent {
    // ---
    match serde_json::from_str::<TrackMetadata>(text) {
        Ok(metadata) => ControlEvent::Metadata(metadata),
        Err(_) => ControlEvent::Raw(text.to_string()),
    }
}

/// Handle to a supervised control channel connection.
pub struct ControlChannel {
    // ---
    events: mpsc::Receiver<ControlEvent>,
    outbound: mpsc::Sender<OutboundMessage>,
    _task: JoinHandle<()>,
}

impl ControlChannel {
    // ---
    /// Connects (and keeps reconnecting) to the control channel URL.
    ///
    /// Cancelling `stop` is the explicit user disconnect: it aborts any
    /// pending backoff wait and suppresses all future automatic attempts.
    pub fn spawn(url: String, stop: CancellationToken, metrics: Option<MetricsContext>) -> Self {
        // ---
        let (event_tx, events) = mpsc::channel(16);
        let (outbound, outbound_rx) = mpsc::channel(16);

        let task = tokio::spawn(run(url, event_tx, outbound_rx, stop, metrics));

        Self {
            events,
            outbound,
            _task: task,
        }
    }

    /// Waits for the next inbound event.
    pub async fn next_event(&mut self) -> Option<ControlEvent> {
        // ---
        self.events.recv().await
    }

    /// Returns a sender for outbound messages.
    pub fn sender(&self) -> mpsc::Sender<OutboundMessage> {
        // ---
        self.outbound.clone()
    }
}

/// Supervision loop: connect, drive, back off, repeat.
async fn run(
    url: String,
    event_tx: mpsc::Sender<ControlEvent>,
    mut outbound_rx: mpsc::Receiver<OutboundMessage>,
    stop: CancellationToken,
    metrics: Option<MetricsContext>,
) {
    // ---
    let mut attempt = ConnectionAttempt::new(ReconnectPolicy::control_channel());

    loop {
        if stop.is_cancelled() {
            break;
        }

        attempt.connecting();
        match connect_async(url.as_str()).await {
            Ok((mut ws, _)) => {
                info!("Control channel connected: {}", url);
                attempt.opened();

                // Ask for metadata on every (re)open.
                match ws.send(Message::Text(METADATA_REQUEST.into())).await {
                    Ok(()) => drive(&mut ws, &event_tx, &mut outbound_rx, &stop).await,
                    Err(e) => warn!("Failed to send metadata request: {}", e),
                }

                let _ = ws.close(None).await;
            }
            Err(e) => {
                warn!("Control channel connect failed: {}", e);
            }
        }

        if stop.is_cancelled() {
            break;
        }

        match attempt.failed() {
            Some(delay) => {
                if let Some(metrics) = &metrics {
                    metrics.control_reconnects_total.inc();
                }

                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }

                // A disconnect can race the timer; check again before acting.
                if stop.is_cancelled() {
                    break;
                }
            }
            None => {
                if let Some(metrics) = &metrics {
                    metrics.gave_up_total.inc();
                }
                let _ = event_tx.send(ControlEvent::GaveUp).await;
                break;
            }
        }
    }

    debug!("Control channel task exiting");
}

/// Pumps one open connection until it drops or the user stops.
async fn drive(
    ws: &mut WsStream,
    event_tx: &mpsc::Sender<ControlEvent>,
    outbound_rx: &mut mpsc::Receiver<OutboundMessage>,
    stop: &CancellationToken,
) {
    // ---
    loop {
        tokio::select! {
            biased;

            _ = stop.cancelled() => return,

            outbound = outbound_rx.recv() => {
                let Some(message) = outbound else { return };
                if let Err(e) = send_message(ws, message).await {
                    warn!("Control channel send failed: {}", e);
                    return;
                }
            }

            inbound = ws.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        let _ = event_tx.send(classify_text(&text)).await;
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = ws.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("Control channel closed by server");
                        return;
                    }
                    Some(Ok(_)) => {
                        // Binary and pong frames carry nothing we consume.
                    }
                    Some(Err(e)) => {
                        warn!("Control channel error: {}", e);
                        return;
                    }
                    None => {
                        info!("Control channel disconnected");
                        return;
                    }
                }
            }
        }
    }
}

async fn send_message(ws: &mut WsStream, message: OutboundMessage) -> Result<()> {
    // ---
    let frame = match message {
        OutboundMessage::Raw(text) => Message::Text(text),
        OutboundMessage::Json(value) => Message::Text(value.to_string()),
    };
    ws.send(frame).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_metadata_json_is_parsed() {
        // ---
        let payload = r#"{
            "name": "Song name",
            "author": "Author Smith",
            "image": null,
            "active_file_start_time_ms": 120000,
            "active_file_duration_ms": 180000,
            "current_offset_ms": 125000,
            "buffer_size_ms": 200
        }"#;

        match classify_text(payload) {
            ControlEvent::Metadata(metadata) => {
                assert_eq!(metadata.name.as_deref(), Some("Song name"));
                assert_eq!(metadata.active_file_duration_ms, 180_000);
                assert_eq!(metadata.resync_target_ms(), 125_000);
                assert_eq!(metadata.buffer_size_ms, 200);
            }
            other => panic!("expected metadata, got {:?}", other),
        }
    }

    #[test]
    fn test_minimal_metadata_uses_defaults() {
        // ---
        let payload = r#"{
            "active_file_start_time_ms": 60000,
            "active_file_duration_ms": 180000
        }"#;

        match classify_text(payload) {
            ControlEvent::Metadata(metadata) => {
                assert_eq!(metadata.name, None);
                assert_eq!(metadata.current_offset_ms, None);
                assert_eq!(metadata.buffer_size_ms, 0);
                assert_eq!(metadata.resync_target_ms(), 60_000);
            }
            other => panic!("expected metadata, got {:?}", other),
        }
    }

    #[test]
    fn test_non_json_is_delivered_raw() {
        // ---
        match classify_text("pong") {
            ControlEvent::Raw(text) => assert_eq!(text, "pong"),
            other => panic!("expected raw payload, got {:?}", other),
        }
    }

    #[test]
    fn test_json_without_required_fields_is_raw() {
        // ---
        match classify_text(r#"{"hello": "world"}"#) {
            ControlEvent::Raw(_) => {}
            other => panic!("expected raw payload, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_outbound_and_inbound_over_loopback() {
        // ---
        use tokio::net::TcpListener;
        use tokio_tungstenite::accept_async;

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
        let addr = listener.local_addr().expect("local addr");

        let server = tokio::spawn(async move {
            // ---
            let (stream, _) = listener.accept().await.expect("accept failed");
            let mut ws = accept_async(stream).await.expect("handshake failed");

            // The client asks for metadata on every open
            let first = ws.next().await.expect("no request").expect("read failed");
            assert_eq!(first, Message::Text(METADATA_REQUEST.into()));

            // Raw and JSON outbound messages arrive as sent
            let raw = ws.next().await.expect("no raw message").expect("read failed");
            assert_eq!(raw, Message::Text("ping".into()));

            let json = ws.next().await.expect("no json message").expect("read failed");
            assert_eq!(json, Message::Text(r#"{"volume":0.5}"#.into()));

            let payload = r#"{
                "name": "Song name",
                "active_file_start_time_ms": 0,
                "active_file_duration_ms": 1000
            }"#;
            ws.send(Message::Text(payload.into()))
                .await
                .expect("send failed");
            let _ = ws.close(None).await;
        });

        let stop = CancellationToken::new();
        let mut channel = ControlChannel::spawn(format!("ws://{}", addr), stop.clone(), None);

        let sender = channel.sender();
        sender
            .send(OutboundMessage::Raw("ping".into()))
            .await
            .expect("raw send failed");
        sender
            .send(OutboundMessage::Json(serde_json::json!({"volume": 0.5})))
            .await
            .expect("json send failed");

        match channel.next_event().await {
            Some(ControlEvent::Metadata(metadata)) => {
                assert_eq!(metadata.name.as_deref(), Some("Song name"));
                assert_eq!(metadata.active_file_duration_ms, 1000);
            }
            other => panic!("expected metadata, got {:?}", other),
        }

        server.await.expect("server task failed");
        stop.cancel();
    }
}
