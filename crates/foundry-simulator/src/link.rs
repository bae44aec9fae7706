//! Connection to the foundry server.
//!
//! The link task owns the WebSocket connection. Patches submitted through
//! [`ServerLink`] are queued and sent as `simulator:update` frames; machine
//! frames coming back refresh the shared control state. When the
//! connection drops the task reconnects with exponential backoff, and the
//! server's connect-time snapshot re-synchronizes the machine list.

use crate::config::ReconnectConfig;
use crate::controls::SharedControls;
use crate::session::{PatchSink, SinkError};
use async_trait::async_trait;
use foundry_protocol::{Frame, MachinePatch};
use foundry_transport::{Connection, TransportError, WebSocketConfig, WebSocketConnection};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Sending half of the link, usable as a [`PatchSink`].
#[derive(Debug, Clone)]
pub struct ServerLink {
    outbound: mpsc::UnboundedSender<MachinePatch>,
}

#[async_trait]
impl PatchSink for ServerLink {
    async fn submit(&self, patch: MachinePatch) -> Result<(), SinkError> {
        self.outbound.send(patch).map_err(|_| SinkError::Closed)
    }
}

enum Exit {
    Cancelled,
    Disconnected,
}

/// Spawn the link task.
///
/// The task runs until `cancel` fires. Patches still queued at that point
/// are flushed before the connection is closed.
pub fn spawn(
    ws: WebSocketConfig,
    reconnect: ReconnectConfig,
    controls: SharedControls,
    cancel: CancellationToken,
) -> (ServerLink, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(run(ws, reconnect, controls, rx, cancel));
    (ServerLink { outbound: tx }, task)
}

async fn run(
    ws: WebSocketConfig,
    reconnect: ReconnectConfig,
    controls: SharedControls,
    mut outbound: mpsc::UnboundedReceiver<MachinePatch>,
    cancel: CancellationToken,
) {
    let mut attempt = 0u32;

    loop {
        // Patches generated while offline describe a past state.
        let mut stale = 0usize;
        while outbound.try_recv().is_ok() {
            stale += 1;
        }
        if stale > 0 {
            debug!(dropped = stale, "Dropped patches queued while disconnected");
        }

        let connected = tokio::select! {
            _ = cancel.cancelled() => break,
            result = WebSocketConnection::connect(&ws) => result,
        };

        match connected {
            Ok(mut conn) => {
                attempt = 0;
                info!(url = %ws.url, "Connected to server");

                let exit = pump(&mut conn, &mut outbound, &controls, &cancel).await;
                if let Err(e) = conn.close().await {
                    trace!(error = %e, "Close failed");
                }
                match exit {
                    Exit::Cancelled => break,
                    Exit::Disconnected => warn!(url = %ws.url, "Disconnected from server"),
                }
            }
            Err(e) => {
                warn!(url = %ws.url, attempt, error = %e, "Connection failed");
            }
        }

        attempt = attempt.saturating_add(1);
        let delay = reconnect.delay_for_attempt(attempt);
        debug!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting");

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    debug!("Server link stopped");
}

async fn pump(
    conn: &mut WebSocketConnection,
    outbound: &mut mpsc::UnboundedReceiver<MachinePatch>,
    controls: &SharedControls,
    cancel: &CancellationToken,
) -> Exit {
    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                while let Ok(patch) = outbound.try_recv() {
                    if conn.send(&Frame::simulator_update(patch)).await.is_err() {
                        break;
                    }
                }
                return Exit::Cancelled;
            }

            patch = outbound.recv() => {
                let Some(patch) = patch else {
                    return Exit::Cancelled;
                };
                trace!(machine = %patch.machine_id, "Sending patch");
                if let Err(e) = conn.send(&Frame::simulator_update(patch)).await {
                    warn!(error = %e, "Failed to send patch");
                    return Exit::Disconnected;
                }
            }

            frame = conn.recv() => {
                match frame {
                    Ok(Some(frame)) => apply_server_frame(controls, frame).await,
                    Ok(None) => return Exit::Disconnected,
                    // One bad frame does not make the connection unusable.
                    Err(TransportError::Protocol(e)) => {
                        warn!(error = %e, "Ignoring undecodable frame from server");
                    }
                    Err(e) => {
                        warn!(error = %e, "Receive failed");
                        return Exit::Disconnected;
                    }
                }
            }
        }
    }
}

/// Fold a frame from the server into the control state.
pub async fn apply_server_frame(controls: &SharedControls, frame: Frame) {
    match frame {
        Frame::MachinesList(machines) => {
            debug!(machines = machines.len(), "Machine list received");
            controls.write().await.replace_machines(machines);
        }
        Frame::MachineUpdate(machine) => {
            trace!(machine = %machine.id, "Machine update received");
            controls.write().await.update_machine(machine);
        }
        Frame::Error(body) => {
            warn!(code = body.code, message = %body.message, "Server reported an error");
        }
        other => {
            debug!(event = %other.event(), "Ignoring frame");
        }
    }
}
