//! Local Port Forwarding
//!
//! Forwards connections from a local port to a remote host:port through the
//! jump host. Example: local:8080 -> internal-web:80

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::events::ForwardEventEmitter;
use super::relay::ForwardChannel;
use crate::config::ForwardMapping;
use crate::ssh::ChannelOpener;

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("Could not listen on port {port}: {reason}")]
    Bind { port: u16, reason: String },
}

/// Statistics for a port forward
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardStats {
    /// Total connections handled
    pub connection_count: u64,
    /// Active connections right now
    pub active_connections: u64,
    /// Total bytes sent (client -> remote)
    pub bytes_sent: u64,
    /// Total bytes received (remote -> client)
    pub bytes_received: u64,
    /// Connections dropped because the channel could not be opened
    pub failed_opens: u64,
}

/// Bind the listener for one mapping on `bind_address`
pub async fn bind_listener(
    bind_address: &str,
    mapping: &ForwardMapping,
) -> Result<TcpListener, ForwardError> {
    let port = mapping.local_port;
    let local_addr = format!("{}:{}", bind_address, port);

    TcpListener::bind((bind_address, port)).await.map_err(|e| {
        let reason = match e.kind() {
            std::io::ErrorKind::AddrInUse => format!(
                "Port already in use: {}. Another application may be using this port.",
                local_addr
            ),
            std::io::ErrorKind::PermissionDenied => format!(
                "Permission denied binding to {}. Ports below 1024 require elevated privileges.",
                local_addr
            ),
            std::io::ErrorKind::AddrNotAvailable => format!(
                "Address not available: {}. The specified address is not valid on this system.",
                local_addr
            ),
            _ => format!("Failed to bind to {}: {}", local_addr, e),
        };
        ForwardError::Bind { port, reason }
    })
}

/// Everything an accept loop needs besides its listener
pub(crate) struct ListenerContext {
    pub mapping: ForwardMapping,
    pub bound_addr: SocketAddr,
    pub opener: Arc<dyn ChannelOpener>,
    pub stats: Arc<RwLock<ForwardStats>>,
    pub emitter: ForwardEventEmitter,
}

/// Accept connections until the stop signal, then wait for this listener's
/// relays to wind down.
///
/// The listener is dropped (port unbound) before waiting on relays. If the
/// task is aborted while waiting, the relay `JoinSet` drops and aborts them.
pub(crate) async fn run_listener(
    listener: TcpListener,
    ctx: ListenerContext,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut relays = JoinSet::new();
    let ctx = Arc::new(ctx);
    let relay_stop = stop_rx.clone();

    info!(
        "Started local port forward: {} -> {}:{}",
        ctx.bound_addr, ctx.mapping.remote_host, ctx.mapping.remote_port
    );

    loop {
        tokio::select! {
            _ = wait_stopped(&mut stop_rx) => {
                info!("Local port forward on {} stopped by request", ctx.bound_addr);
                break;
            }

            Some(_) = relays.join_next(), if !relays.is_empty() => {}

            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer_addr)) => {
                        // Disable Nagle's algorithm for low-latency forwarding
                        if let Err(e) = stream.set_nodelay(true) {
                            warn!("Failed to set TCP_NODELAY: {}", e);
                        }

                        debug!("Accepted connection from {} on {}", peer_addr, ctx.bound_addr);

                        {
                            let mut s = ctx.stats.write();
                            s.connection_count += 1;
                            s.active_connections += 1;
                        }

                        relays.spawn(handle_connection(ctx.clone(), stream, relay_stop.clone()));
                    }
                    Err(e) => {
                        error!("Accept error on {}: {}", ctx.bound_addr, e);
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }

    drop(listener);

    while relays.join_next().await.is_some() {}
    debug!("Local port forward task for {} exited", ctx.bound_addr);
}

/// Resolves once the stop flag is set or its sender is gone
pub(crate) async fn wait_stopped(stop_rx: &mut watch::Receiver<bool>) {
    let _ = stop_rx.wait_for(|stopped| *stopped).await;
}

async fn handle_connection(
    ctx: Arc<ListenerContext>,
    mut stream: TcpStream,
    stop_rx: watch::Receiver<bool>,
) {
    let mapping = &ctx.mapping;
    match ctx
        .opener
        .open_channel(&mapping.remote_host, mapping.remote_port)
        .await
    {
        Ok(channel) => {
            debug!(
                "Opened channel for forward {} -> {}:{}",
                ctx.bound_addr, mapping.remote_host, mapping.remote_port
            );
            ForwardChannel::new(stream, channel, ctx.stats.clone())
                .run(stop_rx)
                .await;
        }
        Err(e) => {
            warn!(
                "Could not open channel to {}:{} for {}: {}",
                mapping.remote_host, mapping.remote_port, ctx.bound_addr, e
            );
            ctx.stats.write().failed_opens += 1;
            ctx.emitter.emit_channel_open_failed(
                mapping.local_port,
                format!("{}:{}", mapping.remote_host, mapping.remote_port),
                e.to_string(),
            );
            let _ = stream.shutdown().await;
        }
    }

    let mut s = ctx.stats.write();
    s.active_connections = s.active_connections.saturating_sub(1);
}
