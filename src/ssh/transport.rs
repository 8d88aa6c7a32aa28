//! Transport Session
//!
//! One authenticated SSH connection to the jump host. After `connect` the
//! russh `Handle` is moved into the handle-owner task and every channel open
//! goes through its `HandleController`.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use russh::client;
use russh::keys::key::PrivateKeyWithHashAlg;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::config::{JumpTarget, TransportOptions};
use super::error::SshError;
use super::handle_owner::{spawn_handle_owner_task, HandleController};
use super::known_hosts::KnownHosts;
use crate::auth::Credential;

/// Byte stream carried by a forwarded channel
pub trait ForwardStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ForwardStream for T {}

pub type BoxedStream = Box<dyn ForwardStream>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
    Closed,
}

/// Anything that can open a channel to `host:port` on the far side
#[async_trait]
pub trait ChannelOpener: Send + Sync {
    async fn open_channel(&self, host: &str, port: u16) -> Result<BoxedStream, SshError>;
}

#[async_trait]
pub trait Transport: ChannelOpener {
    async fn connect(&self, target: &JumpTarget, credential: Credential) -> Result<(), SshError>;

    /// Non-blocking
    fn is_alive(&self) -> bool;

    /// Idempotent
    async fn close(&self);

    fn state(&self) -> TransportState;
}

pub trait TransportFactory: Send + Sync {
    fn create(&self, options: &TransportOptions) -> Arc<dyn Transport>;
}

/// russh-backed transport
pub struct SshTransport {
    options: TransportOptions,
    state: RwLock<TransportState>,
    controller: RwLock<Option<HandleController>>,
}

impl SshTransport {
    pub fn new(options: TransportOptions) -> Self {
        Self {
            options,
            state: RwLock::new(TransportState::Disconnected),
            controller: RwLock::new(None),
        }
    }

    fn set_state(&self, state: TransportState) {
        *self.state.write() = state;
    }

    async fn establish(
        &self,
        target: &JumpTarget,
        credential: Credential,
    ) -> Result<HandleController, SshError> {
        let addr = target.addr();
        info!("Connecting to jump host {}", addr);

        let socket_addr = tokio::net::lookup_host(&addr)
            .await
            .map_err(|e| SshError::connection(&addr, format!("failed to resolve address: {}", e)))?
            .next()
            .ok_or_else(|| SshError::connection(&addr, "no address found"))?;

        let ssh_config = client::Config {
            // Liveness is polled by the controller
            inactivity_timeout: None,
            keepalive_interval: Some(self.options.keepalive_interval),
            keepalive_max: self.options.keepalive_max,
            ..Default::default()
        };

        let known_hosts = self
            .options
            .known_hosts_path
            .clone()
            .map(KnownHosts::new)
            .unwrap_or_else(|| KnownHosts::new(KnownHosts::default_path()));
        let handler = ClientHandler::new(
            target.host.clone(),
            target.port,
            self.options.strict_host_key_checking,
            known_hosts,
        );

        let mut handle = tokio::time::timeout(
            self.options.connect_timeout,
            client::connect(Arc::new(ssh_config), socket_addr, handler),
        )
        .await
        .map_err(|_| {
            SshError::Timeout(format!(
                "connection to {} timed out after {}s",
                addr,
                self.options.connect_timeout.as_secs_f32()
            ))
        })?
        .map_err(|e| match e {
            rejected @ SshError::HostKeyRejected { .. } => rejected,
            other => SshError::connection(&addr, other),
        })?;

        debug!("SSH handshake completed with {}", addr);

        let username = if target.username.is_empty() {
            whoami::username()
        } else {
            target.username.clone()
        };

        let hash_alg = handle.best_supported_rsa_hash().await.ok().flatten().flatten();
        let auth_result = handle
            .authenticate_publickey(
                &username,
                PrivateKeyWithHashAlg::new(credential.key.clone(), hash_alg),
            )
            .await
            .map_err(|e| SshError::AuthenticationFailed {
                username: username.clone(),
                target: addr.clone(),
                reason: e.to_string(),
            })?;

        if !auth_result.success() {
            return Err(SshError::AuthenticationFailed {
                username,
                target: addr,
                reason: format!("public key {} rejected by server", credential.key_path.display()),
            });
        }

        info!("Authenticated to {} as {}", addr, username);

        Ok(spawn_handle_owner_task(
            handle,
            uuid::Uuid::new_v4().to_string(),
        ))
    }
}

#[async_trait]
impl ChannelOpener for SshTransport {
    async fn open_channel(&self, host: &str, port: u16) -> Result<BoxedStream, SshError> {
        if *self.state.read() != TransportState::Connected {
            return Err(SshError::NotConnected);
        }
        let controller = self
            .controller
            .read()
            .clone()
            .ok_or(SshError::NotConnected)?;

        let channel = controller
            .open_direct_tcpip(host, port, "127.0.0.1", 0)
            .await?;
        Ok(Box::new(channel.into_stream()))
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn connect(&self, target: &JumpTarget, credential: Credential) -> Result<(), SshError> {
        {
            let mut state = self.state.write();
            match *state {
                TransportState::Connected | TransportState::Connecting => {
                    return Err(SshError::AlreadyConnected)
                }
                _ => *state = TransportState::Connecting,
            }
        }

        match self.establish(target, credential).await {
            Ok(controller) => {
                *self.controller.write() = Some(controller);
                self.set_state(TransportState::Connected);
                Ok(())
            }
            Err(e) => {
                warn!("Connection to {} failed: {}", target.addr(), e);
                self.set_state(TransportState::Failed);
                Err(e)
            }
        }
    }

    fn is_alive(&self) -> bool {
        *self.state.read() == TransportState::Connected
            && self
                .controller
                .read()
                .as_ref()
                .is_some_and(HandleController::is_alive)
    }

    async fn close(&self) {
        let controller = self.controller.write().take();
        if let Some(controller) = controller {
            controller.disconnect().await;
            info!("Transport closed");
        }
        self.set_state(TransportState::Closed);
    }

    fn state(&self) -> TransportState {
        let state = *self.state.read();
        if state == TransportState::Connected && !self.is_alive() {
            return TransportState::Closed;
        }
        state
    }
}

/// Produces a fresh `SshTransport` per tunnel start
#[derive(Debug, Clone, Copy, Default)]
pub struct SshTransportFactory;

impl TransportFactory for SshTransportFactory {
    fn create(&self, options: &TransportOptions) -> Arc<dyn Transport> {
        Arc::new(SshTransport::new(options.clone()))
    }
}
