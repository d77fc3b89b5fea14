//! Per-connection session driver.
//!
//! [`run_session`] spawns the shell, registers it, and multiplexes the
//! process events with the client's messages until either side ends:
//!
//! - output: each process chunk becomes one `Output` message, in order
//! - exit: forwarded once, after the last output, then the loop ends
//! - input: queued verbatim for the shell; never waits on the PTY
//! - resize: applied to the PTY as given
//! - disconnect: the inbound channel closing ends the loop and kills the shell
//!
//! Teardown always goes through [`Session::teardown`], so whichever of
//! disconnect, exit, or shutdown arrives first wins and the rest are ignored.

use std::sync::Arc;
use std::time::Duration;

use protocol::{ClientMessage, ExitInfo, ServerMessage};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::session::{
    CloseReason, ConnectionId, ProcessEvent, ProcessHandle, Session, SessionError,
    SessionRegistry, SpawnOptions,
};
use crate::transport::TransportEndpoint;

/// How long a shutdown waits for the killed shell's exit status.
const SHUTDOWN_EXIT_GRACE: Duration = Duration::from_secs(2);

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutcome {
    /// Connection identity.
    pub id: ConnectionId,
    /// The event that started teardown.
    pub reason: CloseReason,
    /// The exit sent to the client, if any.
    pub exit: Option<ExitInfo>,
}

/// Runs one session to completion.
///
/// Returns an error only when setup fails (spawn or registration); the
/// session never becomes active in that case and nothing is left registered.
pub async fn run_session(
    endpoint: TransportEndpoint,
    registry: &SessionRegistry,
    options: &SpawnOptions,
    shutdown: CancellationToken,
) -> Result<SessionOutcome, SessionError> {
    let (id, mut inbound, outbound) = endpoint.into_parts();

    let (process, mut events) = ProcessHandle::spawn(options).map_err(|e| {
        error!(connection_id = %id, program = %options.program, error = %e, "Failed to spawn shell");
        e
    })?;

    let session = Arc::new(Session::new(id.clone(), Arc::new(process)));
    if let Err(e) = registry.put(Arc::clone(&session)) {
        let _ = session.process().kill().await;
        return Err(e);
    }
    session.lifecycle().activate();

    info!(
        connection_id = %id,
        pid = ?session.process().pid(),
        cols = options.size.cols,
        rows = options.size.rows,
        "Session created"
    );

    let mut exit = None;
    let reason = loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(ProcessEvent::Output(data)) => {
                    // A client that stops reading must not hold off shutdown.
                    tokio::select! {
                        sent = outbound.send(ServerMessage::Output(data)) => {
                            if sent.is_err() {
                                break CloseReason::ClientDisconnected;
                            }
                        }
                        _ = shutdown.cancelled() => break CloseReason::ServerShutdown,
                    }
                }
                Some(ProcessEvent::Exit(info)) => {
                    let _ = outbound.send(ServerMessage::Exit(info)).await;
                    exit = Some(info);
                    break CloseReason::ProcessExited;
                }
                None => break CloseReason::ProcessExited,
            },
            message = inbound.recv() => match message {
                Some(message) => dispatch(&session, message).await,
                None => break CloseReason::ClientDisconnected,
            },
            _ = shutdown.cancelled() => break CloseReason::ServerShutdown,
        }
    };

    session.teardown(registry, reason).await;

    if reason == CloseReason::ServerShutdown {
        exit = forward_final_exit(&mut events, &outbound).await;
    }

    Ok(SessionOutcome {
        id,
        reason: session.lifecycle().close_reason().unwrap_or(reason),
        exit,
    })
}

async fn dispatch(session: &Session, message: ClientMessage) {
    match message {
        ClientMessage::Input(data) => {
            if let Err(e) = session.process().write(data) {
                warn!(connection_id = %session.id(), error = %e, "Failed to write input");
            }
        }
        ClientMessage::Resize(size) => {
            if let Err(e) = session.process().resize(size).await {
                warn!(
                    connection_id = %session.id(),
                    cols = size.cols,
                    rows = size.rows,
                    error = %e,
                    "Failed to resize PTY"
                );
            }
        }
    }
}

/// Relays what the killed shell still produces, up to and including its exit.
async fn forward_final_exit(
    events: &mut mpsc::Receiver<ProcessEvent>,
    outbound: &mpsc::Sender<ServerMessage>,
) -> Option<ExitInfo> {
    let drain = async {
        while let Some(event) = events.recv().await {
            match event {
                ProcessEvent::Output(data) => {
                    let _ = outbound.send(ServerMessage::Output(data)).await;
                }
                ProcessEvent::Exit(info) => {
                    let _ = outbound.send(ServerMessage::Exit(info)).await;
                    return Some(info);
                }
            }
        }
        None
    };

    match tokio::time::timeout(SHUTDOWN_EXIT_GRACE, drain).await {
        Ok(exit) => exit,
        Err(_) => {
            debug!("Shell did not report exit before shutdown grace elapsed");
            None
        }
    }
}
