//! Invite client
//!
//! Sends invitations to other screens and runs the search for a right
//! neighbor.

use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::connection::{Connection, ConnectionError};
use super::{NetworkConfig, PeerContext};
use crate::discovery::{Discovery, DiscoveryEvent};
use crate::protocol::{Message, BUSY_REASON, PROTOCOL_VERSION};

/// A link over TCP
pub type TcpConnection = Connection<TcpStream>;

/// Why an invitation did not produce a link
#[derive(Error, Debug)]
pub enum InviteError {
    #[error("{}", BUSY_REASON)]
    Busy,

    #[error("Invitation rejected: {0}")]
    Rejected(String),

    #[error("Invitation timed out")]
    Timeout,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),

    #[error("Shutting down")]
    ShuttingDown,
}

pub type InviteResult<T> = Result<T, InviteError>;

/// A screen that accepted our invitation and is now our right neighbor
#[derive(Debug)]
pub struct AcceptedNeighbor {
    pub peer_name: String,
    pub address: SocketAddr,
    pub connection: TcpConnection,
}

/// Invite the screen listening on `addr`.
///
/// The whole exchange, including the remote user's decision, is bounded by
/// `timeout`. On failure the socket is dropped before returning.
pub async fn invite(
    addr: SocketAddr,
    ctx: &PeerContext,
    timeout: std::time::Duration,
) -> InviteResult<TcpConnection> {
    match tokio::time::timeout(timeout, invite_unbounded(addr, ctx)).await {
        Ok(result) => result,
        Err(_) => Err(InviteError::Timeout),
    }
}

async fn invite_unbounded(addr: SocketAddr, ctx: &PeerContext) -> InviteResult<TcpConnection> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    let mut conn = Connection::new(stream, addr.to_string());

    conn.send(&Message::Invite {
        protocol_version: PROTOCOL_VERSION,
        name: ctx.name.clone(),
        identity: ctx.identity.clone(),
    })
    .await?;

    let frame = conn.recv().await?.ok_or(ConnectionError::Closed)?;
    match frame.message {
        Message::InviteAck {
            protocol_version,
            accepted: true,
            ..
        } => {
            if protocol_version != PROTOCOL_VERSION {
                return Err(ConnectionError::VersionMismatch {
                    local: PROTOCOL_VERSION,
                    remote: protocol_version,
                }
                .into());
            }
            Ok(conn)
        }
        Message::InviteAck { reason, .. } => match reason {
            Some(reason) if reason == BUSY_REASON => Err(InviteError::Busy),
            Some(reason) => Err(InviteError::Rejected(reason)),
            None => Err(InviteError::Rejected("no reason given".to_string())),
        },
        other => Err(InviteError::UnexpectedReply(format!("{:?}", other))),
    }
}

/// Invite the given addresses one after another and keep the first link
/// that is accepted. Every other attempt is closed before the next starts.
pub async fn try_candidates(
    addrs: &[SocketAddr],
    ctx: &PeerContext,
    timeout: std::time::Duration,
) -> Option<(SocketAddr, TcpConnection)> {
    for &addr in addrs {
        match invite(addr, ctx, timeout).await {
            Ok(conn) => {
                tracing::info!("Invitation to {} accepted", addr);
                return Some((addr, conn));
            }
            Err(e) => {
                tracing::info!("Invitation to {} failed: {}", addr, e);
            }
        }
    }
    None
}

/// Look for a right neighbor until one accepts, then report it and return.
pub async fn search(
    discovery: Arc<dyn Discovery>,
    ctx: Arc<PeerContext>,
    config: NetworkConfig,
    accepted: mpsc::Sender<AcceptedNeighbor>,
    shutdown: CancellationToken,
) {
    tracing::info!("Scanning for peers to invite");
    loop {
        match discovery.scan(&ctx.interface).await {
            Ok(mut scan) => loop {
                let event = tokio::select! {
                    event = scan.recv() => event,
                    _ = shutdown.cancelled() => return,
                };
                let advert = match event {
                    Some(DiscoveryEvent::Found(advert)) if advert.instance_id != ctx.instance_id => advert,
                    Some(_) => continue,
                    None => break,
                };

                tracing::info!("Sending invitations to {} at {:?}", advert.name, advert.addresses);
                let attempt = tokio::select! {
                    attempt = try_candidates(&advert.addresses, &ctx, config.invite_timeout()) => attempt,
                    _ = shutdown.cancelled() => return,
                };
                let Some((address, connection)) = attempt else {
                    continue;
                };

                let neighbor = AcceptedNeighbor {
                    peer_name: advert.name,
                    address,
                    connection,
                };
                tokio::select! {
                    result = accepted.send(neighbor) => {
                        if result.is_err() {
                            tracing::debug!("Control loop gone, dropping accepted neighbor");
                        }
                    }
                    _ = shutdown.cancelled() => {}
                }
                return;
            },
            Err(e) => tracing::warn!("Scan failed: {}", e),
        }

        tracing::debug!("Scan ended without finding a neighbor, retrying");
        tokio::select! {
            _ = tokio::time::sleep(config.search_retry()) => {}
            _ = shutdown.cancelled() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Fake invitee that reads the Invite and answers with `reply`, or never
    /// answers when `reply` is None. Reports whether the inviter closed its end.
    async fn fake_invitee(reply: Option<Message>) -> (SocketAddr, tokio::task::JoinHandle<bool>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            let mut conn = Connection::new(stream, peer.to_string());
            let frame = conn.recv().await.unwrap().unwrap();
            assert!(matches!(frame.message, Message::Invite { .. }));
            if let Some(reply) = reply {
                conn.send(&reply).await.unwrap();
            }
            // Wait for the inviter to hang up.
            matches!(
                tokio::time::timeout(Duration::from_secs(5), conn.recv()).await,
                Ok(Ok(None)) | Ok(Err(_))
            )
        });
        (addr, handle)
    }

    fn ack(accepted: bool, reason: Option<&str>) -> Message {
        Message::InviteAck {
            protocol_version: PROTOCOL_VERSION,
            accepted,
            reason: reason.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_invite_accepted() {
        let (addr, invitee) = fake_invitee(Some(ack(true, None))).await;
        let ctx = PeerContext::new("inviter", None);

        let conn = invite(addr, &ctx, Duration::from_secs(1)).await.unwrap();
        drop(conn);
        assert!(invitee.await.unwrap());
    }

    #[tokio::test]
    async fn test_invite_busy() {
        let (addr, invitee) = fake_invitee(Some(ack(false, Some(BUSY_REASON)))).await;
        let ctx = PeerContext::new("inviter", None);

        let result = invite(addr, &ctx, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(InviteError::Busy)));
        assert!(invitee.await.unwrap());
    }

    #[tokio::test]
    async fn test_invite_timeout() {
        let (addr, invitee) = fake_invitee(None).await;
        let ctx = PeerContext::new("inviter", None);

        let result = invite(addr, &ctx, Duration::from_millis(200)).await;
        assert!(matches!(result, Err(InviteError::Timeout)));
        assert!(invitee.await.unwrap(), "timed out attempt must close its socket");
    }

    #[tokio::test]
    async fn test_candidates_tried_serially() {
        let (slow, slow_invitee) = fake_invitee(None).await;
        let (rude, rude_invitee) = fake_invitee(Some(ack(false, Some("user rejected")))).await;
        let (kind, kind_invitee) = fake_invitee(Some(ack(true, None))).await;
        let ctx = PeerContext::new("inviter", None);

        let started = std::time::Instant::now();
        let (winner, conn) = try_candidates(&[slow, rude, kind], &ctx, Duration::from_secs(1))
            .await
            .expect("third candidate accepts");
        assert_eq!(winner, kind);
        assert!(started.elapsed() >= Duration::from_secs(1));

        // The losing attempts were closed before we got here.
        assert!(slow_invitee.await.unwrap());
        assert!(rude_invitee.await.unwrap());

        drop(conn);
        assert!(kind_invitee.await.unwrap());
    }

    #[tokio::test]
    async fn test_unreachable_candidate_is_skipped() {
        let closed = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let (kind, _invitee) = fake_invitee(Some(ack(true, None))).await;
        let ctx = PeerContext::new("inviter", None);

        let (winner, _conn) = try_candidates(&[closed, kind], &ctx, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(winner, kind);
    }

    #[tokio::test]
    async fn test_invite_sends_identity() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let ctx = PeerContext::new("named", Some(b"who".to_vec()));

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            // The inviter gives up after the timeout and closes.
            let _ = stream.read_to_end(&mut buf).await;
            buf
        });

        let result = invite(addr, &ctx, Duration::from_millis(100)).await;
        assert!(matches!(result, Err(InviteError::Timeout)));

        let bytes = server.await.unwrap();
        let mut decoder = crate::protocol::Decoder::new();
        let mut buf = bytes::BytesMut::from(&bytes[..]);
        match decoder.decode(&mut buf).unwrap().unwrap().message {
            Message::Invite { name, identity, .. } => {
                assert_eq!(name, "named");
                assert_eq!(identity, b"who".to_vec());
            }
            other => panic!("expected Invite, got {:?}", other),
        }
    }
}
