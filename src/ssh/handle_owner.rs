//! Handle Owner Task
//!
//! Only one task owns the `Handle<ClientHandler>`. Every listener that needs a
//! new forwarded channel goes through a cloned `HandleController`, which
//! sends the request over an mpsc queue. Each open then runs in a task the
//! owner tracks, so a slow destination never delays a disconnect; the
//! channels themselves are used independently once opened.
//!
//! The task also watches the russh session: when the session closes under it
//! (peer reset, missed keepalives) the task exits and flips the shared
//! liveness flag, so `HandleController::is_alive` never has to block.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use russh::client::{Handle, Msg};
use russh::Channel;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::SshError;

/// How often the owner task checks whether russh has torn the session down.
const SESSION_WATCH_INTERVAL: Duration = Duration::from_millis(200);

/// Commands sent to the Handle Owner Task
pub enum HandleCommand {
    /// Open a direct-tcpip channel (local forward)
    ChannelOpenDirectTcpip {
        host: String,
        port: u32,
        originator_host: String,
        originator_port: u32,
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// Disconnect the SSH connection
    Disconnect,
}

/// Cloneable front end of the Handle Owner Task.
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
    alive: Arc<AtomicBool>,
}

impl HandleController {
    /// Open a direct-tcpip channel to `host:port` through the jump host
    pub async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u16,
        originator_host: &str,
        originator_port: u32,
    ) -> Result<Channel<Msg>, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::ChannelOpenDirectTcpip {
                host: host.to_string(),
                port: u32::from(port),
                originator_host: originator_host.to_string(),
                originator_port,
                reply_tx,
            })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| SshError::ChannelOpenFailed {
                host: host.to_string(),
                port,
                reason: e.to_string(),
            })
    }

    /// Ask the owner task to disconnect. Returns immediately.
    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(HandleCommand::Disconnect).await;
    }

    /// Non-blocking liveness check
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.cmd_tx.is_closed()
    }
}

/// Spawn the Handle Owner Task
///
/// Consumes the Handle and returns a controller for sending commands to it.
pub fn spawn_handle_owner_task(
    handle: Handle<ClientHandler>,
    session_id: String,
) -> HandleController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(64);
    let alive = Arc::new(AtomicBool::new(true));
    let alive_flag = alive.clone();

    tokio::spawn(async move {
        let handle = Arc::new(handle);
        // Opens run beside the loop so a Disconnect is never stuck behind one
        let mut opens = JoinSet::new();
        let mut watch = tokio::time::interval(SESSION_WATCH_INTERVAL);
        watch.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!("Handle owner task started for session {}", session_id);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(HandleCommand::ChannelOpenDirectTcpip {
                        host,
                        port,
                        originator_host,
                        originator_port,
                        reply_tx,
                    }) => {
                        debug!("Opening direct-tcpip {}:{} for session {}", host, port, session_id);
                        let handle = handle.clone();
                        opens.spawn(async move {
                            let result = handle
                                .channel_open_direct_tcpip(
                                    host,
                                    port,
                                    originator_host,
                                    originator_port,
                                )
                                .await;
                            if reply_tx.send(result).is_err() {
                                // Channel is dropped here, server side closes it
                                warn!("Caller dropped before receiving direct_tcpip result");
                            }
                        });
                    }
                    Some(HandleCommand::Disconnect) => {
                        info!("Disconnect requested for session {}", session_id);
                        break;
                    }
                    None => {
                        info!("All controllers dropped for session {}", session_id);
                        break;
                    }
                },

                Some(_) = opens.join_next(), if !opens.is_empty() => {}

                _ = watch.tick() => {
                    if handle.is_closed() {
                        warn!("SSH session {} closed by transport", session_id);
                        break;
                    }
                }
            }
        }

        alive_flag.store(false, Ordering::SeqCst);
        // Pending callers see their reply sender dropped
        opens.shutdown().await;
        drain_pending_commands(&mut cmd_rx);

        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "Tunnel closed", "en")
            .await;
        info!("Handle owner task terminated for session {}", session_id);
    });

    HandleController { cmd_tx, alive }
}

/// Drain all pending commands, returning Disconnect to each waiting caller
fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<HandleCommand>) {
    cmd_rx.close();

    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::ChannelOpenDirectTcpip { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Disconnect => {}
        }
    }
}
