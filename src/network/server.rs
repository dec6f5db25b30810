//! Invite listener
//!
//! Accepts connections from screens that want us as their right neighbor,
//! hands each invitation to the control loop and answers with its decision.

use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::client::{InviteError, TcpConnection};
use super::connection::{Connection, ConnectionError, ConnectionResult};
use super::NetworkConfig;
use crate::color::select_color;
use crate::protocol::{Color, Message, PROTOCOL_VERSION};

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bind failed: {0}")]
    BindFailed(String),
}

pub type ServerResult<T> = Result<T, ServerError>;

/// The control loop's answer to an invitation
#[derive(Debug)]
pub enum InviteDecision {
    /// Accepted: once the acknowledgement is written, the live connection
    /// is passed through the sender to the left neighbor slot.
    Accept(oneshot::Sender<TcpConnection>),
    Reject(InviteError),
}

/// An invitation waiting for the control loop.
///
/// Dropping the receiver behind `reply` means the inviter withdrew.
#[derive(Debug)]
pub struct IncomingInvite {
    pub peer_name: String,
    pub color: Color,
    pub reply: oneshot::Sender<InviteDecision>,
}

/// Listens for invitations
pub struct InviteListener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl InviteListener {
    /// Bind the listener
    pub async fn bind(config: &NetworkConfig) -> ServerResult<Self> {
        let bind_addr = config.bind_addr();
        let listener = TcpListener::bind(bind_addr).await.map_err(|e| {
            ServerError::BindFailed(format!("Failed to bind to {}: {}", bind_addr, e))
        })?;
        let local_addr = listener.local_addr()?;
        tracing::info!("Invite listener on {}", local_addr);
        Ok(Self { listener, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept invitations until `shutdown` fires. Returns once every
    /// per-connection handler has finished.
    pub async fn run(
        self,
        invites: mpsc::Sender<IncomingInvite>,
        handshake_timeout: Duration,
        shutdown: CancellationToken,
    ) {
        let mut handlers = JoinSet::new();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            tracing::debug!("New connection from {}", addr);
                            let invites = invites.clone();
                            let shutdown = shutdown.clone();
                            handlers.spawn(async move {
                                if let Err(e) = handle_invite(stream, addr, invites, handshake_timeout, shutdown).await {
                                    tracing::warn!("Invitation from {} failed: {}", addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                Some(_) = handlers.join_next(), if !handlers.is_empty() => {}
                _ = shutdown.cancelled() => {
                    tracing::debug!("Invite listener shutting down");
                    break;
                }
            }
        }

        while handlers.join_next().await.is_some() {}
    }
}

/// Handle one inviting connection
async fn handle_invite(
    stream: TcpStream,
    addr: SocketAddr,
    invites: mpsc::Sender<IncomingInvite>,
    handshake_timeout: Duration,
    shutdown: CancellationToken,
) -> ConnectionResult<()> {
    stream.set_nodelay(true)?;
    let mut conn = Connection::new(stream, addr.to_string());

    let frame = conn.recv_timeout(handshake_timeout).await?.ok_or_else(|| {
        ConnectionError::HandshakeFailed("Connection closed during handshake".to_string())
    })?;
    let (peer_name, identity) = match frame.message {
        Message::Invite {
            protocol_version,
            name,
            identity,
        } => {
            if protocol_version != PROTOCOL_VERSION {
                reject(
                    &mut conn,
                    format!(
                        "Protocol version mismatch: expected {}, got {}",
                        PROTOCOL_VERSION, protocol_version
                    ),
                )
                .await;
                return Err(ConnectionError::VersionMismatch {
                    local: PROTOCOL_VERSION,
                    remote: protocol_version,
                });
            }
            (name, identity)
        }
        _ => {
            return Err(ConnectionError::HandshakeFailed(
                "Expected Invite message".to_string(),
            ));
        }
    };

    let (reply_tx, mut reply_rx) = oneshot::channel();
    let invite = IncomingInvite {
        peer_name: peer_name.clone(),
        color: select_color(&identity),
        reply: reply_tx,
    };
    if invites.send(invite).await.is_err() {
        reject(&mut conn, InviteError::ShuttingDown.to_string()).await;
        return Ok(());
    }

    let decision = tokio::select! {
        decision = &mut reply_rx => decision,
        _ = conn.recv() => {
            // The inviter hung up (or spoke out of turn) before we answered.
            tracing::info!("Invitation from {} ({}) withdrawn", peer_name, addr);
            return Ok(());
        }
        _ = shutdown.cancelled() => {
            reject(&mut conn, InviteError::ShuttingDown.to_string()).await;
            return Ok(());
        }
    };

    match decision {
        Ok(InviteDecision::Accept(handoff)) => {
            conn.send(&Message::InviteAck {
                protocol_version: PROTOCOL_VERSION,
                accepted: true,
                reason: None,
            })
            .await?;
            tracing::info!("Accepted invitation from {} ({})", peer_name, addr);
            if handoff.send(conn).is_err() {
                tracing::warn!("Left slot went away before taking the link from {}", peer_name);
            }
        }
        Ok(InviteDecision::Reject(reason)) => {
            tracing::info!("Rejected invitation from {}: {}", peer_name, reason);
            let reason = match reason {
                InviteError::Rejected(reason) => reason,
                other => other.to_string(),
            };
            reject(&mut conn, reason).await;
        }
        Err(_) => {
            reject(&mut conn, InviteError::ShuttingDown.to_string()).await;
        }
    }

    Ok(())
}

/// Best-effort negative acknowledgement
async fn reject(conn: &mut TcpConnection, reason: String) {
    let _ = conn
        .send(&Message::InviteAck {
            protocol_version: PROTOCOL_VERSION,
            accepted: false,
            reason: Some(reason),
        })
        .await;
}
