//! Tunnel Lifecycle Controller
//!
//! Runs credential resolution, transport connect and listener startup as one
//! operation, and tears everything down in reverse order exactly once:
//! on `stop`, on start failure, or when the liveness poll finds the
//! transport dead.
//!
//! The lifecycle mutex is held for the whole of `start`, so a concurrent
//! `stop` waits for the start to settle and then tears it down.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::error::TunnelError;
use super::events::TunnelEvent;
use super::state::TunnelState;
use crate::auth::{first_default_key, AuthResolver, PassphrasePrompt};
use crate::config::{ConfigStorage, SecretStore, TunnelConfig, SERVICE_NAME};
use crate::forwarding::{
    ForwardEvent, ForwardEventEmitter, ForwardOptions, ForwardingManager, DEFAULT_BIND_ADDRESS,
};
use crate::ssh::{
    BoxedStream, ChannelOpener, SshError, Transport, TransportFactory, TransportOptions,
};

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// Interface the forwarded ports listen on
    pub bind_address: String,
    pub connect_timeout: Duration,
    /// Transport liveness poll while running
    pub poll_interval: Duration,
    /// Grace period for relays on stop
    pub stop_grace: Duration,
    pub strict_host_key_checking: bool,
    pub known_hosts_path: Option<PathBuf>,
    /// Where a successfully started configuration is saved, if anywhere
    pub last_used_path: Option<PathBuf>,
    /// Secret store service name for cached passphrases
    pub secret_service: String,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            connect_timeout: Duration::from_secs(15),
            poll_interval: Duration::from_millis(250),
            stop_grace: Duration::from_secs(5),
            strict_host_key_checking: false,
            known_hosts_path: None,
            last_used_path: None,
            secret_service: SERVICE_NAME.to_string(),
        }
    }
}

impl ControllerOptions {
    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            connect_timeout: self.connect_timeout,
            strict_host_key_checking: self.strict_host_key_checking,
            known_hosts_path: self.known_hosts_path.clone(),
            ..Default::default()
        }
    }
}

/// Lets listeners share the controller's transport as a plain opener
struct SharedTransport(Arc<dyn Transport>);

#[async_trait]
impl ChannelOpener for SharedTransport {
    async fn open_channel(&self, host: &str, port: u16) -> Result<BoxedStream, SshError> {
        self.0.open_channel(host, port).await
    }
}

/// Everything that exists only while running
struct ActiveTunnel {
    generation: u64,
    transport: Arc<dyn Transport>,
    forwarding: ForwardingManager,
    monitor: JoinHandle<()>,
}

struct Inner {
    factory: Arc<dyn TransportFactory>,
    resolver: AuthResolver,
    prompt: Arc<dyn PassphrasePrompt>,
    options: ControllerOptions,
    state: RwLock<TunnelState>,
    /// Transport of the running tunnel, for non-blocking `is_alive`
    current: RwLock<Option<Arc<dyn Transport>>>,
    lifecycle: Mutex<Option<ActiveTunnel>>,
    generation: AtomicU64,
    events: broadcast::Sender<TunnelEvent>,
}

impl Inner {
    fn emit(&self, event: TunnelEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn set_state(&self, state: TunnelState) {
        {
            let mut current = self.state.write();
            if *current == state {
                return;
            }
            *current = state;
        }
        debug!("Tunnel state -> {}", state);
        self.emit(TunnelEvent::StateChanged { state });
    }

    /// Auth, connect, bind. Each failure undoes the steps before it.
    async fn bring_up(self: &Arc<Self>, config: &TunnelConfig) -> Result<ActiveTunnel, TunnelError> {
        let key_path = config
            .expanded_key_path()
            .or_else(first_default_key)
            .ok_or_else(|| TunnelError::KeyNotFound {
                path: PathBuf::from("~/.ssh"),
                reason: "no key configured and no default key found".into(),
            })?;

        let resolver = self.resolver.clone();
        let prompt = self.prompt.clone();
        let path = key_path.clone();
        let credential = tokio::task::spawn_blocking(move || resolver.resolve(&path, prompt.as_ref()))
            .await
            .map_err(|e| TunnelError::Internal(e.to_string()))??;
        info!(
            "Credential for {} resolved ({:?})",
            key_path.display(),
            credential.source
        );

        let transport = self.factory.create(&self.options.transport_options());
        if let Err(e) = transport.connect(&config.target(), credential).await {
            transport.close().await;
            return Err(e.into());
        }

        let events = self.events.clone();
        let forward_options = ForwardOptions {
            bind_address: self.options.bind_address.clone(),
            stop_grace: self.options.stop_grace,
            emitter: ForwardEventEmitter::new(move |event| match event {
                ForwardEvent::ChannelOpenFailed {
                    local_port, remote, ..
                } => {
                    let _ = events.send(TunnelEvent::ChannelOpenFailed { local_port, remote });
                }
            }),
        };

        let opener: Arc<dyn ChannelOpener> = Arc::new(SharedTransport(transport.clone()));
        let forwarding =
            match ForwardingManager::start(opener, &config.forwardings, forward_options).await {
                Ok(forwarding) => forwarding,
                Err(e) => {
                    transport.close().await;
                    return Err(e.into());
                }
            };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let monitor = tokio::spawn(monitor_transport(
            Arc::downgrade(self),
            transport.clone(),
            generation,
            self.options.poll_interval,
        ));

        Ok(ActiveTunnel {
            generation,
            transport,
            forwarding,
            monitor,
        })
    }

    /// Listeners first, then the transport
    async fn teardown(&self, tunnel: ActiveTunnel, abort_monitor: bool) {
        self.set_state(TunnelState::Stopping);
        if abort_monitor {
            tunnel.monitor.abort();
        }
        *self.current.write() = None;

        tunnel.forwarding.stop().await;
        tunnel.transport.close().await;

        self.set_state(TunnelState::Idle);
        info!("Tunnel stopped");
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(tunnel) = self.lifecycle.get_mut().take() {
            tunnel.monitor.abort();
        }
    }
}

async fn monitor_transport(
    inner: Weak<Inner>,
    transport: Arc<dyn Transport>,
    generation: u64,
    poll_interval: Duration,
) {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if !transport.is_alive() {
            break;
        }
    }

    warn!("Transport to jump host lost (state {:?})", transport.state());

    let Some(inner) = inner.upgrade() else {
        return;
    };
    let mut active = inner.lifecycle.lock().await;
    if active.as_ref().map(|t| t.generation) != Some(generation) {
        // Already stopped or replaced
        return;
    }
    let Some(tunnel) = active.take() else {
        return;
    };

    inner.emit(TunnelEvent::ConnectionLost {
        reason: "connection to jump host lost".into(),
    });
    // This task is the monitor; it must not abort itself
    inner.teardown(tunnel, false).await;
}

/// Public face of a tunnel: start, stop, liveness and status events
#[derive(Clone)]
pub struct TunnelController {
    inner: Arc<Inner>,
}

impl TunnelController {
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        secrets: Arc<dyn SecretStore>,
        prompt: Arc<dyn PassphrasePrompt>,
        options: ControllerOptions,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let resolver = AuthResolver::new(secrets, options.secret_service.clone());
        Self {
            inner: Arc::new(Inner {
                factory,
                resolver,
                prompt,
                options,
                state: RwLock::new(TunnelState::Idle),
                current: RwLock::new(None),
                lifecycle: Mutex::new(None),
                generation: AtomicU64::new(0),
                events,
            }),
        }
    }

    /// Bring the tunnel up. On error nothing is left bound or connected.
    pub async fn start(&self, config: TunnelConfig) -> Result<(), TunnelError> {
        config.validate()?;

        let mut active = self.inner.lifecycle.lock().await;
        if active.is_some() {
            return Err(TunnelError::AlreadyRunning);
        }

        info!(
            "Starting tunnel via {} with {} forwarding(s)",
            config.target().addr(),
            config.forwardings.len()
        );
        self.inner.set_state(TunnelState::Starting);

        let tunnel = match self.inner.bring_up(&config).await {
            Ok(tunnel) => tunnel,
            Err(e) => {
                warn!("Tunnel start failed: {}", e);
                self.inner.set_state(TunnelState::Failed);
                self.inner.emit(TunnelEvent::StartFailed {
                    error: e.to_string(),
                });
                self.inner.set_state(TunnelState::Idle);
                return Err(e);
            }
        };

        for status in tunnel.forwarding.stats() {
            info!(
                "Forwarding {} -> {}:{}",
                status.bound_addr, status.mapping.remote_host, status.mapping.remote_port
            );
        }

        *self.inner.current.write() = Some(tunnel.transport.clone());
        *active = Some(tunnel);
        self.inner.set_state(TunnelState::Running);
        drop(active);

        if let Some(path) = &self.inner.options.last_used_path {
            if let Err(e) = ConfigStorage::with_path(path).save(&config).await {
                warn!("Could not remember configuration in {:?}: {}", path, e);
            }
        }

        Ok(())
    }

    /// Tear the tunnel down. No-op when idle.
    pub async fn stop(&self) {
        let mut active = self.inner.lifecycle.lock().await;
        let Some(tunnel) = active.take() else {
            debug!("Stop requested while idle");
            return;
        };
        info!("Stopping tunnel");
        self.inner.teardown(tunnel, true).await;
    }

    /// Non-blocking; false as soon as the transport is gone, even before the
    /// monitor has finished teardown.
    pub fn is_alive(&self) -> bool {
        *self.inner.state.read() == TunnelState::Running
            && self
                .inner
                .current
                .read()
                .as_ref()
                .is_some_and(|transport| transport.is_alive())
    }

    pub fn state(&self) -> TunnelState {
        *self.inner.state.read()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.inner.events.subscribe()
    }

    /// Per-listener statistics, empty unless running
    pub async fn stats(&self) -> Vec<crate::forwarding::ListenerStatus> {
        self.inner
            .lifecycle
            .lock()
            .await
            .as_ref()
            .map(|tunnel| tunnel.forwarding.stats())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Credential, PromptResponse};
    use crate::config::{ForwardMapping, MemoryStore};
    use crate::ssh::{JumpTarget, TransportState};
    use std::path::Path;
    use std::sync::atomic::AtomicBool;

    /// Transport that never touches the network
    #[derive(Default)]
    struct StubTransport {
        fail_connect: bool,
        alive: AtomicBool,
        closed: AtomicBool,
    }

    #[async_trait]
    impl ChannelOpener for StubTransport {
        async fn open_channel(&self, host: &str, port: u16) -> Result<BoxedStream, SshError> {
            Err(SshError::ChannelOpenFailed {
                host: host.into(),
                port,
                reason: "stub".into(),
            })
        }
    }

    #[async_trait]
    impl Transport for StubTransport {
        async fn connect(&self, target: &JumpTarget, _: Credential) -> Result<(), SshError> {
            if self.fail_connect {
                return Err(SshError::connection(target.addr(), "refused"));
            }
            self.alive.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        async fn close(&self) {
            self.alive.store(false, Ordering::SeqCst);
            self.closed.store(true, Ordering::SeqCst);
        }

        fn state(&self) -> TransportState {
            if self.is_alive() {
                TransportState::Connected
            } else {
                TransportState::Closed
            }
        }
    }

    struct StubFactory {
        fail_connect: bool,
        created: parking_lot::Mutex<Vec<Arc<StubTransport>>>,
    }

    impl TransportFactory for StubFactory {
        fn create(&self, _: &TransportOptions) -> Arc<dyn Transport> {
            let transport = Arc::new(StubTransport {
                fail_connect: self.fail_connect,
                ..Default::default()
            });
            self.created.lock().push(transport.clone());
            transport
        }
    }

    fn factory(fail_connect: bool) -> Arc<StubFactory> {
        Arc::new(StubFactory {
            fail_connect,
            created: parking_lot::Mutex::new(Vec::new()),
        })
    }

    fn controller(factory: Arc<StubFactory>) -> TunnelController {
        let prompt = |_: &Path, _: u32| PromptResponse::Abort;
        TunnelController::new(
            factory,
            Arc::new(MemoryStore::new()),
            Arc::new(prompt),
            ControllerOptions {
                bind_address: "127.0.0.1".into(),
                poll_interval: Duration::from_millis(20),
                stop_grace: Duration::from_millis(200),
                ..Default::default()
            },
        )
    }

    fn config() -> TunnelConfig {
        let mut config = TunnelConfig::new("jump.example.com", "alice");
        config.key_path = Some(
            Path::new(env!("CARGO_MANIFEST_DIR"))
                .join("tests/fixtures/id_ed25519_plain")
                .to_string_lossy()
                .into_owned(),
        );
        config.forwardings.push(ForwardMapping::new(0, "web", 80));
        config
    }

    #[tokio::test]
    async fn test_start_stop() {
        let factory = factory(false);
        let controller = controller(factory.clone());

        controller.start(config()).await.unwrap();
        assert_eq!(controller.state(), TunnelState::Running);
        assert!(controller.is_alive());
        assert!(matches!(
            controller.start(config()).await,
            Err(TunnelError::AlreadyRunning)
        ));

        controller.stop().await;
        assert_eq!(controller.state(), TunnelState::Idle);
        assert!(!controller.is_alive());
        assert!(factory.created.lock()[0].closed.load(Ordering::SeqCst));

        // Idle stop is a no-op
        controller.stop().await;
    }

    #[tokio::test]
    async fn test_connect_failure_rolls_back() {
        let factory = factory(true);
        let controller = controller(factory.clone());
        let mut events = controller.subscribe();

        let err = controller.start(config()).await.unwrap_err();
        assert!(matches!(err, TunnelError::ConnectError(_)));
        assert_eq!(controller.state(), TunnelState::Idle);
        assert!(factory.created.lock()[0].closed.load(Ordering::SeqCst));

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert_eq!(
            seen.first(),
            Some(&TunnelEvent::StateChanged {
                state: TunnelState::Starting
            })
        );
        assert!(seen
            .iter()
            .any(|e| matches!(e, TunnelEvent::StartFailed { .. })));
        assert_eq!(
            seen.last(),
            Some(&TunnelEvent::StateChanged {
                state: TunnelState::Idle
            })
        );
    }

    #[tokio::test]
    async fn test_invalid_config_rejected_before_io() {
        let factory = factory(false);
        let controller = controller(factory.clone());
        let mut config = config();
        config.jump_host = "10.0.0.300".into();

        assert!(matches!(
            controller.start(config).await,
            Err(TunnelError::InvalidConfig(_))
        ));
        assert!(factory.created.lock().is_empty());
    }

    #[tokio::test]
    async fn test_missing_key_file() {
        let controller = controller(factory(false));
        let mut config = config();
        config.key_path = Some("/nonexistent/id_ed25519".into());

        assert!(matches!(
            controller.start(config).await,
            Err(TunnelError::KeyNotFound { .. })
        ));
        assert_eq!(controller.state(), TunnelState::Idle);
    }

    #[tokio::test]
    async fn test_transport_loss_returns_to_idle() {
        let factory = factory(false);
        let controller = controller(factory.clone());
        controller.start(config()).await.unwrap();
        let mut events = controller.subscribe();

        factory.created.lock()[0].alive.store(false, Ordering::SeqCst);
        assert!(!controller.is_alive());

        let lost = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match events.recv().await {
                    Ok(TunnelEvent::ConnectionLost { .. }) => break,
                    Ok(_) => continue,
                    Err(e) => panic!("event channel closed: {}", e),
                }
            }
            loop {
                if let Ok(TunnelEvent::StateChanged {
                    state: TunnelState::Idle,
                }) = events.recv().await
                {
                    break;
                }
            }
        })
        .await;

        assert!(lost.is_ok());
        assert_eq!(controller.state(), TunnelState::Idle);
        assert!(!controller.is_alive());
    }
}
