//! Forward Channel
//!
//! Bridges one accepted local socket and one remote channel stream. Either
//! direction finishing (EOF or error) or the stop signal ends the relay and
//! shuts down both sides.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::debug;

use super::local::{wait_stopped, ForwardStats};
use crate::ssh::BoxedStream;

const RELAY_BUFFER_SIZE: usize = 32 * 1024;

/// Why a relay ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    LocalClosed,
    RemoteClosed,
    Stopped,
}

pub struct ForwardChannel {
    local: TcpStream,
    remote: BoxedStream,
    stats: Arc<RwLock<ForwardStats>>,
}

impl ForwardChannel {
    pub fn new(local: TcpStream, remote: BoxedStream, stats: Arc<RwLock<ForwardStats>>) -> Self {
        Self {
            local,
            remote,
            stats,
        }
    }

    /// Relay until one side closes or `stop_rx` fires
    pub async fn run(self, mut stop_rx: watch::Receiver<bool>) -> RelayEnd {
        let ForwardChannel {
            mut local,
            remote,
            stats,
        } = self;

        let (mut local_read, mut local_write) = local.split();
        let (mut remote_read, mut remote_write) = tokio::io::split(remote);

        let end = {
            let local_to_remote = copy_counted(&mut local_read, &mut remote_write, |n| {
                stats.write().bytes_sent += n as u64;
            });
            let remote_to_local = copy_counted(&mut remote_read, &mut local_write, |n| {
                stats.write().bytes_received += n as u64;
            });

            tokio::select! {
                _ = local_to_remote => RelayEnd::LocalClosed,
                _ = remote_to_local => RelayEnd::RemoteClosed,
                _ = wait_stopped(&mut stop_rx) => RelayEnd::Stopped,
            }
        };

        let _ = remote_write.shutdown().await;
        let _ = local_write.shutdown().await;

        debug!("Forward connection closed ({:?})", end);
        end
    }
}

async fn copy_counted<R, W>(reader: &mut R, writer: &mut W, mut on_bytes: impl FnMut(usize))
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if let Err(e) = writer.write_all(&buf[..n]).await {
                    debug!("Relay write error: {}", e);
                    break;
                }
                if let Err(e) = writer.flush().await {
                    debug!("Relay flush error: {}", e);
                    break;
                }
                on_bytes(n);
            }
            Err(e) => {
                debug!("Relay read error: {}", e);
                break;
            }
        }
    }
}
