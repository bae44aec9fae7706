//! Connection handlers for the foundry server.
//!
//! Every WebSocket connection is registered with the hub as an observer and
//! may also act as a control source by sending `simulator:update` frames.

use crate::config::Config;
use crate::metrics;
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bytes::BytesMut;
use foundry_core::{Hub, HubHandle, MachineRegistry};
use foundry_protocol::{codec, error_codes, Encoding, Frame, ProtocolError};
use foundry_transport::ConnectionId;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::{interval_at, Instant};
use tracing::{debug, error, info, warn};

type WsSender = SplitSink<WebSocket, Message>;

/// Shared server state.
pub struct AppState {
    /// Handle to the registry owner task.
    pub hub: HubHandle,
    /// Server configuration.
    pub config: Config,
    active_connections: Arc<AtomicUsize>,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config, hub: HubHandle) -> Self {
        Self {
            hub,
            config,
            active_connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of upgraded connections currently alive.
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Acquire)
    }

    fn try_acquire_slot(&self) -> Option<ConnectionSlot> {
        let max = self.config.limits.max_connections;
        self.active_connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .ok()
            .map(|_| {
                metrics::record_connection();
                ConnectionSlot {
                    active: Arc::clone(&self.active_connections),
                }
            })
    }
}

/// A reserved connection slot, released on drop.
struct ConnectionSlot {
    active: Arc<AtomicUsize>,
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
        metrics::record_disconnection();
    }
}

/// Query parameters accepted on the WebSocket endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    #[serde(default)]
    format: Encoding,
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let hub = Hub::spawn_with_capacity(
        MachineRegistry::seeded(),
        config.limits.observer_queue_capacity,
    );
    let state = Arc::new(AppState::new(config.clone(), hub));

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Foundry server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Foundry server stopped");
    Ok(())
}

/// Build the HTTP router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(health_handler))
        .route("/health", get(health_handler))
        .route("/machines", get(machines_handler))
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.hub.stats().await {
        Ok(stats) => Json(serde_json::json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "machines": stats.machines,
            "observers": stats.observers,
        }))
        .into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "unavailable", "error": e.to_string() })),
        )
            .into_response(),
    }
}

/// Registry snapshot as JSON.
async fn machines_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.hub.snapshot().await {
        Ok(machines) => Json(machines).into_response(),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let Some(slot) = state.try_acquire_slot() else {
        warn!(
            max = state.config.limits.max_connections,
            "Connection limit reached, refusing upgrade"
        );
        metrics::record_rejection();
        return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
    };

    let encoding = params.format;
    ws.max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, state, encoding, slot))
}

/// Handle a WebSocket connection.
async fn handle_websocket(
    socket: WebSocket,
    state: Arc<AppState>,
    encoding: Encoding,
    _slot: ConnectionSlot,
) {
    let connection_id = ConnectionId::generate();

    // The bootstrap snapshot is already queued when connect returns.
    let mut observer_rx = match state.hub.connect(connection_id.as_str()).await {
        Ok(rx) => rx,
        Err(e) => {
            error!(connection = %connection_id, error = %e, "Failed to register observer");
            metrics::record_error("hub");
            return;
        }
    };

    debug!(connection = %connection_id, encoding = %encoding, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();

    // Read buffer for partial binary frames
    let mut read_buffer = BytesMut::with_capacity(4096);

    let period = Duration::from_millis(state.config.heartbeat.interval_ms.max(1));
    let timeout = Duration::from_millis(state.config.heartbeat.timeout_ms);
    let mut heartbeat = interval_at(Instant::now() + period, period);
    let mut last_seen = Instant::now();

    'conn: loop {
        tokio::select! {
            biased;

            // Frames queued for this observer by the hub
            frame = observer_rx.recv() => {
                let Some(frame) = frame else {
                    warn!(connection = %connection_id, "Dropped by the hub for falling behind");
                    metrics::record_error("slow_observer");
                    break;
                };
                match tokio::time::timeout(timeout, send_frame(&mut sender, &frame, encoding)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!(connection = %connection_id, error = %e, "Failed to deliver frame");
                        break;
                    }
                    Err(_) => {
                        warn!(connection = %connection_id, "Peer stopped reading, closing");
                        metrics::record_error("send_timeout");
                        break;
                    }
                }
            }

            // Receive from WebSocket
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let start = std::time::Instant::now();
                        last_seen = Instant::now();
                        metrics::record_message(data.len(), "inbound");
                        read_buffer.extend_from_slice(&data);

                        let (frames, failure) = drain_frames(&mut read_buffer);
                        for frame in frames {
                            if let Err(e) = handle_frame(frame, &connection_id, &state, &mut sender, encoding).await {
                                error!(connection = %connection_id, error = %e, "Frame handling error");
                                break 'conn;
                            }
                        }
                        if let Some(e) = failure {
                            if reject_invalid(&mut sender, &connection_id, &e, encoding).await.is_err() {
                                break;
                            }
                        }

                        metrics::record_latency(start.elapsed().as_secs_f64());
                    }
                    Some(Ok(Message::Text(text))) => {
                        let start = std::time::Instant::now();
                        last_seen = Instant::now();
                        metrics::record_message(text.len(), "inbound");

                        let outcome = match codec::decode_json(&text) {
                            Ok(frame) => handle_frame(frame, &connection_id, &state, &mut sender, encoding).await,
                            Err(e) => reject_invalid(&mut sender, &connection_id, &e, encoding).await,
                        };
                        if let Err(e) = outcome {
                            error!(connection = %connection_id, error = %e, "Frame handling error");
                            break;
                        }

                        metrics::record_latency(start.elapsed().as_secs_f64());
                    }
                    Some(Ok(Message::Ping(data))) => {
                        last_seen = Instant::now();
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_seen = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break;
                    }
                }
            }

            _ = heartbeat.tick() => {
                if last_seen.elapsed() > timeout {
                    warn!(connection = %connection_id, "Heartbeat timeout");
                    metrics::record_error("heartbeat_timeout");
                    break;
                }
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    // A closed hub means shutdown is under way and there is nothing to remove.
    let _ = state.hub.disconnect(connection_id.as_str());

    debug!(connection = %connection_id, "WebSocket disconnected");
}

/// Decode every complete frame in the buffer.
///
/// A frame rejected by validation is skipped. Any other decoding failure
/// clears the buffer, since the stream can no longer be resynchronized.
/// The first error is returned alongside the frames that did decode.
fn drain_frames(buf: &mut BytesMut) -> (Vec<Frame>, Option<ProtocolError>) {
    let mut frames = Vec::new();
    let mut failure = None;
    loop {
        match codec::decode_from(buf) {
            Ok(Some(frame)) => frames.push(frame),
            Ok(None) => return (frames, failure),
            Err(e @ ProtocolError::Invalid(_)) => {
                failure.get_or_insert(e);
            }
            Err(e) => {
                buf.clear();
                return (frames, failure.or(Some(e)));
            }
        }
    }
}

/// Handle a decoded frame.
async fn handle_frame(
    frame: Frame,
    connection_id: &ConnectionId,
    state: &AppState,
    sender: &mut WsSender,
    encoding: Encoding,
) -> Result<()> {
    match frame {
        Frame::RequestMachines => {
            debug!(connection = %connection_id, "Machine list requested");
            state.hub.request_snapshot(connection_id.as_str())?;
        }

        Frame::SimulatorUpdate(patch) => {
            let machine_id = patch.machine_id.clone();
            match state.hub.apply(patch).await? {
                Some(applied) => {
                    metrics::record_patch(true);
                    metrics::record_recipients(applied.recipients);
                    debug!(
                        connection = %connection_id,
                        machine = %machine_id,
                        recipients = applied.recipients,
                        "Machine updated"
                    );
                }
                None => {
                    metrics::record_patch(false);
                    debug!(connection = %connection_id, machine = %machine_id, "Patch for unknown machine ignored");
                }
            }
        }

        other => {
            warn!(connection = %connection_id, event = %other.event(), "Unexpected frame");
            let reply = Frame::error(
                error_codes::UNEXPECTED_FRAME,
                format!("{} is not accepted from clients", other.event()),
            );
            send_frame(sender, &reply, encoding).await?;
        }
    }

    Ok(())
}

async fn reject_invalid(
    sender: &mut WsSender,
    connection_id: &ConnectionId,
    err: &ProtocolError,
    encoding: Encoding,
) -> Result<()> {
    warn!(connection = %connection_id, error = %err, "Invalid frame");
    metrics::record_error("decode");
    let reply = Frame::error(error_codes::INVALID_FRAME, err.to_string());
    send_frame(sender, &reply, encoding).await
}

/// Send a frame to the WebSocket in the connection's encoding.
async fn send_frame(sender: &mut WsSender, frame: &Frame, encoding: Encoding) -> Result<()> {
    let message = match encoding {
        Encoding::Json => {
            let text = codec::encode_json(frame)?;
            metrics::record_message(text.len(), "outbound");
            Message::Text(text)
        }
        Encoding::Msgpack => {
            let data = codec::encode(frame)?;
            metrics::record_message(data.len(), "outbound");
            Message::Binary(data.to_vec())
        }
    };
    sender.send(message).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MetricsConfig;
    use foundry_protocol::{MachinePatch, MachineStatus, Sensors};
    use foundry_transport::{Connection, WebSocketConfig, WebSocketConnection};
    use std::net::SocketAddr;
    use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

    fn test_config() -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            metrics: MetricsConfig {
                enabled: false,
                ..MetricsConfig::default()
            },
            ..Config::default()
        }
    }

    async fn spawn_server(config: Config) -> SocketAddr {
        let hub = Hub::spawn_with_capacity(
            MachineRegistry::seeded(),
            config.limits.observer_queue_capacity,
        );
        let state = Arc::new(AppState::new(config, hub));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, build_router(state)).await.unwrap();
        });
        addr
    }

    async fn connect(addr: SocketAddr, encoding: Encoding) -> WebSocketConnection {
        let config = WebSocketConfig::new(format!("ws://{}/ws", addr)).with_encoding(encoding);
        WebSocketConnection::connect(&config).await.unwrap()
    }

    async fn expect_list(conn: &mut WebSocketConnection) -> usize {
        match conn.recv().await.unwrap() {
            Some(Frame::MachinesList(machines)) => machines.len(),
            other => panic!("Expected machines:list, got {:?}", other),
        }
    }

    #[test]
    fn test_drain_frames() {
        let mut buf = BytesMut::new();
        codec::encode_into(&Frame::request_machines(), &mut buf).unwrap();
        let second = codec::encode(&Frame::request_machines()).unwrap();
        buf.extend_from_slice(&second[..3]);

        let (frames, failure) = drain_frames(&mut buf);
        assert_eq!(frames, vec![Frame::RequestMachines]);
        assert!(failure.is_none());
        assert_eq!(buf.len(), 3);

        let mut garbage = BytesMut::from(&[0u8, 0, 0, 2, 0xc1, 0xc1][..]);
        let (frames, failure) = drain_frames(&mut garbage);
        assert!(frames.is_empty());
        assert!(failure.is_some());
        assert!(garbage.is_empty());
    }

    #[tokio::test]
    async fn test_bootstrap_and_fan_out_across_encodings() {
        let addr = spawn_server(test_config()).await;

        let mut observer = connect(addr, Encoding::Json).await;
        assert_eq!(expect_list(&mut observer).await, 8);

        let mut control = connect(addr, Encoding::Msgpack).await;
        assert_eq!(expect_list(&mut control).await, 8);

        let sensors: Sensors = [("temperature".to_string(), 80.0)].into_iter().collect();
        let patch = MachinePatch::new("machine-1")
            .with_status(MachineStatus::Online)
            .with_sensors(sensors.clone());
        control.send(&Frame::simulator_update(patch)).await.unwrap();

        let seen_by_observer = match observer.recv().await.unwrap() {
            Some(Frame::MachineUpdate(machine)) => machine,
            other => panic!("Expected machine:update, got {:?}", other),
        };
        let seen_by_control = match control.recv().await.unwrap() {
            Some(Frame::MachineUpdate(machine)) => machine,
            other => panic!("Expected machine:update, got {:?}", other),
        };

        assert_eq!(seen_by_observer, seen_by_control);
        assert_eq!(seen_by_observer.status, MachineStatus::Online);
        assert_eq!(seen_by_observer.sensors, sensors);
        assert!(seen_by_observer.last_update.is_some());
    }

    #[tokio::test]
    async fn test_unknown_machine_and_unexpected_frames() {
        let addr = spawn_server(test_config()).await;
        let mut conn = connect(addr, Encoding::Json).await;
        expect_list(&mut conn).await;

        let patch = MachinePatch::new("machine-404").with_status(MachineStatus::Online);
        conn.send(&Frame::simulator_update(patch)).await.unwrap();
        conn.send(&Frame::request_machines()).await.unwrap();

        // Nothing was broadcast for the unknown id, so the list comes next.
        assert_eq!(expect_list(&mut conn).await, 8);

        conn.send(&Frame::machines_list(Vec::new())).await.unwrap();
        match conn.recv().await.unwrap() {
            Some(Frame::Error(body)) => assert_eq!(body.code, error_codes::UNEXPECTED_FRAME),
            other => panic!("Expected error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_non_finite_patch_is_rejected() {
        let addr = spawn_server(test_config()).await;
        let mut conn = connect(addr, Encoding::Msgpack).await;
        expect_list(&mut conn).await;

        let sensors: Sensors = [("temperature".to_string(), f64::INFINITY)].into_iter().collect();
        let patch = MachinePatch::new("machine-1").with_sensors(sensors);
        conn.send(&Frame::simulator_update(patch)).await.unwrap();
        match conn.recv().await.unwrap() {
            Some(Frame::Error(body)) => assert_eq!(body.code, error_codes::INVALID_FRAME),
            other => panic!("Expected error, got {:?}", other),
        }

        // The registry is untouched and the connection still works.
        conn.send(&Frame::request_machines()).await.unwrap();
        match conn.recv().await.unwrap() {
            Some(Frame::MachinesList(machines)) => {
                assert_eq!(machines[0].sensors["temperature"], 0.0);
                assert!(machines[0].last_update.is_none());
            }
            other => panic!("Expected machines:list, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invalid_json_is_rejected() {
        let addr = spawn_server(test_config()).await;
        let (mut ws, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();

        // Bootstrap snapshot first.
        assert!(matches!(ws.next().await, Some(Ok(WsMessage::Text(_)))));

        ws.send(WsMessage::Text("{\"event\":\"nope\"}".to_string()))
            .await
            .unwrap();
        match ws.next().await {
            Some(Ok(WsMessage::Text(text))) => match codec::decode_json(&text).unwrap() {
                Frame::Error(body) => assert_eq!(body.code, error_codes::INVALID_FRAME),
                other => panic!("Expected error, got {:?}", other),
            },
            other => panic!("Expected text message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let mut config = test_config();
        config.limits.max_connections = 1;
        let addr = spawn_server(config).await;

        let mut first = connect(addr, Encoding::Json).await;
        expect_list(&mut first).await;

        let second =
            WebSocketConnection::connect(&WebSocketConfig::new(format!("ws://{}/ws", addr))).await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn test_http_handlers() {
        let hub = Hub::spawn(MachineRegistry::seeded());
        let state = Arc::new(AppState::new(test_config(), hub));

        let response = health_handler(State(Arc::clone(&state))).await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = machines_handler(State(Arc::clone(&state))).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(state.active_connections(), 0);
    }

    #[tokio::test]
    async fn test_connection_slots() {
        let mut config = test_config();
        config.limits.max_connections = 2;
        let state = AppState::new(config, Hub::spawn(MachineRegistry::seeded()));

        let a = state.try_acquire_slot().unwrap();
        let _b = state.try_acquire_slot().unwrap();
        assert!(state.try_acquire_slot().is_none());
        assert_eq!(state.active_connections(), 2);

        drop(a);
        assert_eq!(state.active_connections(), 1);
        assert!(state.try_acquire_slot().is_some());
    }
}
