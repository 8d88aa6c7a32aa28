//! Forwarding Manager
//!
//! Owns one listener per mapping for a single tunnel. Start is
//! all-or-nothing: every port is bound before any accept loop runs, and a
//! failed bind drops the ones already bound.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{info, warn};

use super::events::ForwardEventEmitter;
use super::local::{bind_listener, run_listener, ForwardError, ForwardStats, ListenerContext};
use crate::config::ForwardMapping;
use crate::ssh::ChannelOpener;

/// Default interface for forwarded ports
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0";

#[derive(Debug, Clone)]
pub struct ForwardOptions {
    pub bind_address: String,
    /// How long `stop` waits for relays before aborting them
    pub stop_grace: Duration,
    pub emitter: ForwardEventEmitter,
}

impl Default for ForwardOptions {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            stop_grace: Duration::from_secs(5),
            emitter: ForwardEventEmitter::noop(),
        }
    }
}

/// Snapshot of one running listener
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerStatus {
    pub mapping: ForwardMapping,
    pub bound_addr: SocketAddr,
    pub stats: ForwardStats,
}

struct ListenerEntry {
    mapping: ForwardMapping,
    bound_addr: SocketAddr,
    stats: Arc<RwLock<ForwardStats>>,
}

pub struct ForwardingManager {
    entries: Vec<ListenerEntry>,
    tasks: JoinSet<()>,
    stop_tx: watch::Sender<bool>,
    stop_grace: Duration,
}

impl ForwardingManager {
    /// Bind every mapping and start accepting.
    pub async fn start(
        opener: Arc<dyn ChannelOpener>,
        mappings: &[ForwardMapping],
        options: ForwardOptions,
    ) -> Result<Self, ForwardError> {
        let mut bound = Vec::with_capacity(mappings.len());
        for mapping in mappings {
            match bind_listener(&options.bind_address, mapping).await {
                Ok(listener) => bound.push((mapping.clone(), listener)),
                Err(e) => {
                    warn!(
                        "Bind failed for port {}, releasing {} listener(s)",
                        mapping.local_port,
                        bound.len()
                    );
                    drop(bound);
                    return Err(e);
                }
            }
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut tasks = JoinSet::new();
        let mut entries = Vec::with_capacity(bound.len());

        for (mapping, listener) in bound {
            let bound_addr = listener.local_addr().map_err(|e| ForwardError::Bind {
                port: mapping.local_port,
                reason: format!("Failed to get bound address: {}", e),
            })?;
            let stats = Arc::new(RwLock::new(ForwardStats::default()));

            let ctx = ListenerContext {
                mapping: mapping.clone(),
                bound_addr,
                opener: opener.clone(),
                stats: stats.clone(),
                emitter: options.emitter.clone(),
            };
            tasks.spawn(run_listener(listener, ctx, stop_rx.clone()));

            entries.push(ListenerEntry {
                mapping,
                bound_addr,
                stats,
            });
        }

        info!("Forwarding {} port(s)", entries.len());

        Ok(Self {
            entries,
            tasks,
            stop_tx,
            stop_grace: options.stop_grace,
        })
    }

    /// Close every listener and relay. Waits at most the grace period, then
    /// aborts whatever is left. All ports are unbound on return.
    pub async fn stop(mut self) {
        info!("Stopping {} local port forward(s)", self.entries.len());
        let _ = self.stop_tx.send(true);

        let drained = tokio::time::timeout(self.stop_grace, async {
            while self.tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                "Forwards did not stop within {:?}, aborting remaining tasks",
                self.stop_grace
            );
            self.tasks.abort_all();
            while self.tasks.join_next().await.is_some() {}
        }

        info!("All local port forwards stopped");
    }

    pub fn stats(&self) -> Vec<ListenerStatus> {
        self.entries
            .iter()
            .map(|entry| ListenerStatus {
                mapping: entry.mapping.clone(),
                bound_addr: entry.bound_addr,
                stats: entry.stats.read().clone(),
            })
            .collect()
    }

    pub fn bound_addrs(&self) -> Vec<SocketAddr> {
        self.entries.iter().map(|entry| entry.bound_addr).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::{BoxedStream, SshError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    /// Echoes everything back; optionally refuses the first N opens
    #[derive(Default)]
    struct EchoOpener {
        refuse_first: usize,
        opens: AtomicUsize,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ChannelOpener for EchoOpener {
        async fn open_channel(&self, host: &str, port: u16) -> Result<BoxedStream, SshError> {
            if self.opens.fetch_add(1, Ordering::SeqCst) < self.refuse_first {
                return Err(SshError::ChannelOpenFailed {
                    host: host.to_string(),
                    port,
                    reason: "Connect failed".into(),
                });
            }

            let (near, far) = tokio::io::duplex(64 * 1024);
            let closed = self.closed.clone();
            tokio::spawn(async move {
                let (mut r, mut w) = tokio::io::split(far);
                let _ = tokio::io::copy(&mut r, &mut w).await;
                closed.fetch_add(1, Ordering::SeqCst);
            });
            Ok(Box::new(near))
        }
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn options() -> ForwardOptions {
        ForwardOptions {
            bind_address: "127.0.0.1".into(),
            stop_grace: Duration::from_millis(500),
            ..Default::default()
        }
    }

    async fn echo_roundtrip(stream: &mut TcpStream, payload: &[u8]) {
        stream.write_all(payload).await.unwrap();
        let mut buf = vec![0u8; payload.len()];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, payload);
    }

    async fn wait_until(cond: impl Fn() -> bool) {
        for _ in 0..100 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_bind_failure_rolls_back() {
        let free = free_port();
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let taken_port = taken.local_addr().unwrap().port();

        let mappings = vec![
            ForwardMapping::new(free, "web", 80),
            ForwardMapping::new(taken_port, "db", 5432),
        ];
        let result =
            ForwardingManager::start(Arc::new(EchoOpener::default()), &mappings, options()).await;

        match result {
            Err(ForwardError::Bind { port, .. }) => assert_eq!(port, taken_port),
            Ok(_) => panic!("start should fail"),
        }
        // The first listener was released
        std::net::TcpListener::bind(("127.0.0.1", free)).unwrap();
    }

    #[tokio::test]
    async fn test_relays_are_isolated() {
        let opener = Arc::new(EchoOpener::default());
        let closed = opener.closed.clone();
        let manager = ForwardingManager::start(
            opener,
            &[ForwardMapping::new(0, "web", 80)],
            options(),
        )
        .await
        .unwrap();
        let addr = manager.bound_addrs()[0];

        let mut first = TcpStream::connect(addr).await.unwrap();
        let mut second = TcpStream::connect(addr).await.unwrap();
        echo_roundtrip(&mut first, b"one").await;
        echo_roundtrip(&mut second, b"two").await;

        drop(first);
        wait_until(|| closed.load(Ordering::SeqCst) == 1).await;

        echo_roundtrip(&mut second, b"still here").await;
        assert_eq!(manager.stats()[0].stats.connection_count, 2);

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_open_failure_keeps_accepting() {
        let opener = Arc::new(EchoOpener {
            refuse_first: 1,
            ..Default::default()
        });
        let events = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = events.clone();
        let mut opts = options();
        opts.emitter = ForwardEventEmitter::new(move |e| sink.lock().push(e));

        let manager = ForwardingManager::start(opener, &[ForwardMapping::new(0, "web", 80)], opts)
            .await
            .unwrap();
        let addr = manager.bound_addrs()[0];

        let mut refused = TcpStream::connect(addr).await.unwrap();
        let mut buf = Vec::new();
        assert_eq!(refused.read_to_end(&mut buf).await.unwrap(), 0);

        let mut accepted = TcpStream::connect(addr).await.unwrap();
        echo_roundtrip(&mut accepted, b"hello").await;

        let stats = manager.stats()[0].stats.clone();
        assert_eq!(stats.failed_opens, 1);
        assert_eq!(stats.connection_count, 2);
        assert_eq!(events.lock().len(), 1);

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_stop_unbinds_and_closes_relays() {
        let manager = ForwardingManager::start(
            Arc::new(EchoOpener::default()),
            &[
                ForwardMapping::new(0, "web", 80),
                ForwardMapping::new(0, "db", 5432),
            ],
            options(),
        )
        .await
        .unwrap();
        let addrs = manager.bound_addrs();
        assert_eq!(addrs.len(), 2);

        let mut client = TcpStream::connect(addrs[0]).await.unwrap();
        echo_roundtrip(&mut client, b"x").await;

        manager.stop().await;

        let mut buf = Vec::new();
        assert_eq!(client.read_to_end(&mut buf).await.unwrap_or(0), 0);
        for addr in addrs {
            std::net::TcpListener::bind(addr).unwrap();
        }
    }
}
