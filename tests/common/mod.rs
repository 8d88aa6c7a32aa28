//! Shared fakes for controller tests
//!
//! `DirectTransport` plays the jump host: every channel open is a plain TCP
//! connection to the requested destination.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use jumpforward::auth::{Credential, PromptResponse};
use jumpforward::config::{MemoryStore, SecretStore};
use jumpforward::ssh::{
    BoxedStream, ChannelOpener, JumpTarget, SshError, Transport, TransportFactory,
    TransportOptions, TransportState,
};
use jumpforward::{ControllerOptions, ForwardMapping, TunnelConfig, TunnelController};

pub const PASSPHRASE: &str = "open sesame";

pub fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

#[derive(Default)]
pub struct DirectTransport {
    pub alive: AtomicBool,
    pub closed: AtomicBool,
    pub opens: AtomicUsize,
}

impl DirectTransport {
    /// Simulate the jump host going away
    pub fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl ChannelOpener for DirectTransport {
    async fn open_channel(&self, host: &str, port: u16) -> Result<BoxedStream, SshError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(SshError::NotConnected);
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| SshError::ChannelOpenFailed {
                host: host.to_string(),
                port,
                reason: e.to_string(),
            })?;
        Ok(Box::new(stream))
    }
}

#[async_trait]
impl Transport for DirectTransport {
    async fn connect(&self, _target: &JumpTarget, _credential: Credential) -> Result<(), SshError> {
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

#[derive(Default)]
pub struct DirectFactory {
    pub created: Mutex<Vec<Arc<DirectTransport>>>,
}

impl DirectFactory {
    pub fn last(&self) -> Arc<DirectTransport> {
        self.created
            .lock()
            .last()
            .cloned()
            .expect("no transport created")
    }
}

impl TransportFactory for DirectFactory {
    fn create(&self, _options: &TransportOptions) -> Arc<dyn Transport> {
        let transport = Arc::new(DirectTransport::default());
        self.created.lock().push(transport.clone());
        transport
    }
}

/// Prompt that answers from a script and counts calls
pub struct ScriptedPrompt {
    answers: Mutex<Vec<PromptResponse>>,
    pub calls: AtomicUsize,
}

impl ScriptedPrompt {
    pub fn new(answers: Vec<PromptResponse>) -> Self {
        Self {
            answers: Mutex::new(answers),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl jumpforward::auth::PassphrasePrompt for ScriptedPrompt {
    fn prompt(&self, _key_path: &Path, _attempt: u32) -> PromptResponse {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut answers = self.answers.lock();
        if answers.is_empty() {
            PromptResponse::Abort
        } else {
            answers.remove(0)
        }
    }
}

pub fn options() -> ControllerOptions {
    ControllerOptions {
        bind_address: "127.0.0.1".into(),
        poll_interval: Duration::from_millis(20),
        stop_grace: Duration::from_millis(500),
        ..Default::default()
    }
}

pub fn controller_with(
    factory: Arc<DirectFactory>,
    secrets: Arc<dyn SecretStore>,
    prompt: Arc<ScriptedPrompt>,
) -> TunnelController {
    TunnelController::new(factory, secrets, prompt, options())
}

pub fn controller(factory: Arc<DirectFactory>) -> TunnelController {
    controller_with(
        factory,
        Arc::new(MemoryStore::new()),
        Arc::new(ScriptedPrompt::new(Vec::new())),
    )
}

pub fn config(key: &str, forwardings: Vec<ForwardMapping>) -> TunnelConfig {
    let mut config = TunnelConfig::new("jump.example.com", "alice");
    config.key_path = Some(fixture(key).to_string_lossy().into_owned());
    config.forwardings = forwardings;
    config
}

pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// TCP echo server standing in for the remote destination
pub async fn spawn_echo_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    port
}

pub async fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
