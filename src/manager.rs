//! Network manager
//!
//! Runs the control loop that owns both neighbor slots and the pending
//! invitation. Every state change happens on that one task; the listener,
//! the advertiser, the search and the transfer streams only talk to it
//! through channels.

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::discovery::{Discovery, DiscoveryError, PeerAdvertisement};
use crate::neighbor::{LinkSource, NeighborSlot, SlotError, TransferConfig};
use crate::network::{
    search, AcceptedNeighbor, IncomingInvite, InviteDecision, InviteError, InviteListener,
    NetworkConfig, PeerContext, ServerError,
};
use crate::protocol::Color;
use crate::scene::{NeighborQueue, SceneSender, Side};

/// Room for neighbor updates the scene has not read yet
const NEIGHBOR_CHANNEL_CAPACITY: usize = 8;

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Listener error: {0}")]
    Listener(#[from] ServerError),

    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Invariant violated: {0}")]
    Invariant(#[from] SlotError),

    #[error("Network manager stopped")]
    Stopped,
}

pub type NetworkResult<T> = Result<T, NetworkError>;

/// The local user's answer to an invitation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvitationResponse {
    Accept,
    Reject(String),
}

/// An invitation waiting for the local user.
///
/// Dropping it without answering rejects it. `withdrawn` fires if the
/// inviter gives up first; the prompt should then be dismissed.
#[derive(Debug)]
pub struct Invitation {
    pub name: String,
    pub color: Color,
    pub withdrawn: CancellationToken,
    response: oneshot::Sender<InvitationResponse>,
}

impl Invitation {
    /// Answer the invitation. Returns false when it is no longer pending.
    pub fn respond(self, response: InvitationResponse) -> bool {
        self.response.send(response).is_ok()
    }

    pub fn accept(self) -> bool {
        self.respond(InvitationResponse::Accept)
    }

    pub fn reject(self, reason: impl Into<String>) -> bool {
        self.respond(InvitationResponse::Reject(reason.into()))
    }

    pub fn is_withdrawn(&self) -> bool {
        self.withdrawn.is_cancelled()
    }
}

/// Snapshot of the control loop's state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NeighborStatus {
    pub listen_addr: Option<SocketAddr>,
    pub left: Option<String>,
    pub right: Option<String>,
    pub advertising: bool,
    pub searching: bool,
    pub invitation_pending: bool,
}

/// Everything the scene needs from the network
pub struct NetworkChannels {
    /// Our color, or the setup error that stopped the manager. Fires once.
    pub ready: oneshot::Receiver<NetworkResult<Color>>,
    /// Queue to the left neighbor, `None` when it goes away
    pub new_left_screen: mpsc::Receiver<Option<NeighborQueue>>,
    /// Queue to the right neighbor, `None` when it goes away
    pub new_right_screen: mpsc::Receiver<Option<NeighborQueue>>,
    /// Invitations in arrival order. One may have been withdrawn before it
    /// is read; at most one is ever live.
    pub invitations: mpsc::UnboundedReceiver<Invitation>,
    pub status: watch::Receiver<NeighborStatus>,
}

/// Handle to a running control loop
pub struct NetworkManager {
    shutdown: CancellationToken,
    task: JoinHandle<NetworkResult<()>>,
}

impl NetworkManager {
    /// Start the control loop. Triangles arriving from neighbors, and those
    /// bounced back by failed links, are pushed into `scene`.
    pub fn start(
        config: NetworkConfig,
        ctx: PeerContext,
        discovery: Arc<dyn Discovery>,
        scene: SceneSender,
    ) -> (Self, NetworkChannels) {
        let (ready_tx, ready) = oneshot::channel();
        let (left_tx, new_left_screen) = mpsc::channel(NEIGHBOR_CHANNEL_CAPACITY);
        let (right_tx, new_right_screen) = mpsc::channel(NEIGHBOR_CHANNEL_CAPACITY);
        let (invitations_tx, invitations) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(NeighborStatus::default());
        let shutdown = CancellationToken::new();

        let outputs = Outputs {
            ready: ready_tx,
            left: left_tx,
            right: right_tx,
            invitations: invitations_tx,
            status: status_tx,
        };
        let task = tokio::spawn(run(
            config,
            Arc::new(ctx),
            discovery,
            scene,
            outputs,
            shutdown.clone(),
        ));

        (
            Self { shutdown, task },
            NetworkChannels {
                ready,
                new_left_screen,
                new_right_screen,
                invitations,
                status,
            },
        )
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop every link and auxiliary task and wait for them. Returns the
    /// error that ended the control loop, if any.
    pub async fn shutdown(self) -> NetworkResult<()> {
        self.shutdown.cancel();
        match self.task.await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!("Network manager task failed: {}", e);
                Err(NetworkError::Stopped)
            }
        }
    }
}

struct Outputs {
    ready: oneshot::Sender<NetworkResult<Color>>,
    left: mpsc::Sender<Option<NeighborQueue>>,
    right: mpsc::Sender<Option<NeighborQueue>>,
    invitations: mpsc::UnboundedSender<Invitation>,
    status: watch::Sender<NeighborStatus>,
}

async fn run(
    config: NetworkConfig,
    ctx: Arc<PeerContext>,
    discovery: Arc<dyn Discovery>,
    scene: SceneSender,
    outputs: Outputs,
    shutdown: CancellationToken,
) -> NetworkResult<()> {
    let Outputs {
        ready,
        left,
        right,
        invitations,
        status,
    } = outputs;

    let listener = match InviteListener::bind(&config).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Network setup failed: {}", e);
            let _ = ready.send(Err(e.into()));
            return Ok(());
        }
    };
    let listen_addr = listener.local_addr();

    let advert = ctx.advertisement(vec![listen_addr]);
    if let Err(e) = discovery.advertise(&advert).await {
        tracing::error!("Network setup failed: {}", e);
        let _ = ready.send(Err(e.into()));
        return Ok(());
    }
    tracing::info!("Advertising {} ({}) on {}", ctx.name, ctx.instance_id, listen_addr);

    let (advertise_tx, advertise_rx) = mpsc::channel(1);
    let advertiser = tokio::spawn(run_advertiser(discovery.clone(), advert, advertise_rx));

    let tasks = shutdown.child_token();
    let (invites_tx, mut invites_rx) = mpsc::channel(1);
    let listener = tokio::spawn(listener.run(invites_tx, config.connect_timeout(), tasks.clone()));
    let (accepted_tx, mut accepted_rx) = mpsc::channel(1);

    let transfer = |side| TransferConfig {
        side,
        give_timeout: config.give_timeout(),
        heartbeat_interval: config.heartbeat_interval(),
        linger: config.give_timeout(),
    };
    let mut control = ControlLoop {
        left: NeighborSlot::new(transfer(Side::Left), config.queue_capacity, scene.clone(), left),
        right: NeighborSlot::new(transfer(Side::Right), config.queue_capacity, scene, right),
        pending: None,
        invitations,
        advertise: advertise_tx,
        advertising: true,
        advertiser,
        listener,
        accepted: accepted_tx,
        search: None,
        searching: false,
        tasks,
        status,
        listen_addr,
        discovery,
        ctx: ctx.clone(),
        config,
    };

    if control.config.seek_neighbors {
        control.start_search();
    }
    control.publish();
    let _ = ready.send(Ok(ctx.color()));

    let result = control.run(&mut invites_rx, &mut accepted_rx, &shutdown).await;
    if let Err(e) = &result {
        tracing::error!("Control loop stopped: {}", e);
    }
    control.teardown().await;
    result
}

/// The invitation the local user has not answered yet
struct PendingInvite {
    name: String,
    reply: oneshot::Sender<InviteDecision>,
    response: oneshot::Receiver<InvitationResponse>,
    withdrawn: CancellationToken,
}

enum PendingOutcome {
    Decided(InvitationResponse),
    Withdrawn,
}

async fn next_outcome(pending: &mut Option<PendingInvite>) -> PendingOutcome {
    let Some(pending) = pending.as_mut() else {
        return std::future::pending().await;
    };
    tokio::select! {
        response = &mut pending.response => PendingOutcome::Decided(
            response.unwrap_or_else(|_| InvitationResponse::Reject("invitation dismissed".to_string())),
        ),
        _ = pending.reply.closed() => PendingOutcome::Withdrawn,
    }
}

struct ControlLoop {
    ctx: Arc<PeerContext>,
    config: NetworkConfig,
    discovery: Arc<dyn Discovery>,
    listen_addr: SocketAddr,

    left: NeighborSlot,
    right: NeighborSlot,
    pending: Option<PendingInvite>,
    invitations: mpsc::UnboundedSender<Invitation>,

    advertise: mpsc::Sender<bool>,
    advertising: bool,
    advertiser: JoinHandle<()>,
    listener: JoinHandle<()>,

    accepted: mpsc::Sender<AcceptedNeighbor>,
    search: Option<JoinHandle<()>>,
    searching: bool,

    /// Stops the listener and the search
    tasks: CancellationToken,
    status: watch::Sender<NeighborStatus>,
}

impl ControlLoop {
    async fn run(
        &mut self,
        invites: &mut mpsc::Receiver<IncomingInvite>,
        accepted: &mut mpsc::Receiver<AcceptedNeighbor>,
        shutdown: &CancellationToken,
    ) -> NetworkResult<()> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                Some(incoming) = invites.recv() => {
                    self.on_incoming(incoming);
                }
                outcome = next_outcome(&mut self.pending), if self.pending.is_some() => {
                    self.on_outcome(outcome).await?;
                }
                error = self.left.lost() => {
                    tracing::info!("Left neighbor lost: {}", error);
                    self.left.deactivate().await;
                    self.set_advertising(true).await;
                }
                Some(neighbor) = accepted.recv() => {
                    self.searching = false;
                    tracing::info!("{} at {} is our right neighbor", neighbor.peer_name, neighbor.address);
                    self.right
                        .activate(neighbor.peer_name, LinkSource::Connected(neighbor.connection))?;
                }
                error = self.right.lost() => {
                    tracing::info!("Right neighbor lost: {}", error);
                    self.right.deactivate().await;
                    if self.config.seek_neighbors {
                        self.restart_search().await;
                    }
                }
            }
            self.publish();
        }
    }

    fn on_incoming(&mut self, incoming: IncomingInvite) {
        if self.left.is_active() || self.pending.is_some() {
            tracing::info!("Busy, rejecting invitation from {}", incoming.peer_name);
            let _ = incoming.reply.send(InviteDecision::Reject(InviteError::Busy));
            return;
        }

        let (response_tx, response_rx) = oneshot::channel();
        let withdrawn = CancellationToken::new();
        let invitation = Invitation {
            name: incoming.peer_name.clone(),
            color: incoming.color,
            withdrawn: withdrawn.clone(),
            response: response_tx,
        };
        if self.invitations.send(invitation).is_err() {
            tracing::warn!("No one to answer the invitation from {}", incoming.peer_name);
            let _ = incoming.reply.send(InviteDecision::Reject(InviteError::Rejected(
                "no one to answer".to_string(),
            )));
            return;
        }

        tracing::info!("Invitation from {} waiting for an answer", incoming.peer_name);
        self.pending = Some(PendingInvite {
            name: incoming.peer_name,
            reply: incoming.reply,
            response: response_rx,
            withdrawn,
        });
    }

    async fn on_outcome(&mut self, outcome: PendingOutcome) -> NetworkResult<()> {
        let Some(pending) = self.pending.take() else {
            return Ok(());
        };

        match outcome {
            PendingOutcome::Withdrawn => {
                tracing::info!("Invitation from {} withdrawn", pending.name);
                pending.withdrawn.cancel();
            }
            PendingOutcome::Decided(InvitationResponse::Reject(reason)) => {
                tracing::info!("Invitation from {} rejected: {}", pending.name, reason);
                let _ = pending
                    .reply
                    .send(InviteDecision::Reject(InviteError::Rejected(reason)));
            }
            PendingOutcome::Decided(InvitationResponse::Accept) => {
                let (handoff_tx, handoff_rx) = oneshot::channel();
                if pending.reply.send(InviteDecision::Accept(handoff_tx)).is_err() {
                    tracing::info!("Invitation from {} withdrawn before the answer", pending.name);
                    pending.withdrawn.cancel();
                    return Ok(());
                }
                self.left
                    .activate(pending.name, LinkSource::HandOff(handoff_rx))?;
                self.set_advertising(false).await;
            }
        }
        Ok(())
    }

    async fn set_advertising(&mut self, on: bool) {
        if self.advertising == on {
            return;
        }
        self.advertising = on;
        if self.advertise.send(on).await.is_err() {
            tracing::warn!("Advertiser gone");
        }
    }

    fn start_search(&mut self) {
        tracing::debug!("Starting the search for a right neighbor");
        self.search = Some(tokio::spawn(search(
            self.discovery.clone(),
            self.ctx.clone(),
            self.config.clone(),
            self.accepted.clone(),
            self.tasks.clone(),
        )));
        self.searching = true;
    }

    /// Only one search runs at a time: the previous one is awaited first.
    async fn restart_search(&mut self) {
        if let Some(previous) = self.search.take() {
            if let Err(e) = previous.await {
                tracing::error!("Search task failed: {}", e);
            }
        }
        self.start_search();
    }

    fn publish(&self) {
        self.status.send_replace(NeighborStatus {
            listen_addr: Some(self.listen_addr),
            left: self.left.peer().map(str::to_string),
            right: self.right.peer().map(str::to_string),
            advertising: self.advertising,
            searching: self.searching,
            invitation_pending: self.pending.is_some(),
        });
    }

    async fn teardown(self) {
        let ControlLoop {
            mut left,
            mut right,
            pending,
            advertise,
            advertiser,
            listener,
            search,
            tasks,
            status,
            listen_addr,
            ..
        } = self;

        if let Some(pending) = pending {
            let _ = pending
                .reply
                .send(InviteDecision::Reject(InviteError::ShuttingDown));
            pending.withdrawn.cancel();
        }

        drop(advertise);
        if let Err(e) = advertiser.await {
            tracing::error!("Advertiser task failed: {}", e);
        }

        left.deactivate().await;
        right.deactivate().await;

        tasks.cancel();
        if let Err(e) = listener.await {
            tracing::error!("Listener task failed: {}", e);
        }
        if let Some(search) = search {
            if let Err(e) = search.await {
                tracing::error!("Search task failed: {}", e);
            }
        }

        status.send_replace(NeighborStatus {
            listen_addr: Some(listen_addr),
            ..NeighborStatus::default()
        });
        tracing::info!("Network manager stopped");
    }
}

/// Starts and stops the advertisement on command. The advertisement is
/// live when the task starts and is withdrawn before it returns.
async fn run_advertiser(
    discovery: Arc<dyn Discovery>,
    advert: PeerAdvertisement,
    mut commands: mpsc::Receiver<bool>,
) {
    let mut advertising = true;
    while let Some(on) = commands.recv().await {
        if on == advertising {
            continue;
        }
        let result = if on {
            discovery.advertise(&advert).await
        } else {
            discovery.unadvertise(&advert).await
        };
        match result {
            Ok(()) => {
                advertising = on;
                tracing::info!("Advertisement {}", if on { "resumed" } else { "withdrawn" });
            }
            Err(e) => tracing::warn!("Failed to update the advertisement: {}", e),
        }
    }

    if advertising {
        if let Err(e) = discovery.unadvertise(&advert).await {
            tracing::warn!("Failed to withdraw the advertisement: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::select_color;
    use crate::discovery::MemoryDiscovery;
    use crate::network::invite;
    use crate::protocol::Triangle;
    use std::time::Duration;

    fn test_config(seek: bool) -> NetworkConfig {
        NetworkConfig {
            connect_timeout_ms: 1000,
            invite_timeout_ms: 2000,
            give_timeout_ms: 100,
            heartbeat_interval_ms: 200,
            search_retry_ms: 50,
            seek_neighbors: seek,
            ..NetworkConfig::new(0).loopback()
        }
    }

    struct Screen {
        manager: NetworkManager,
        channels: NetworkChannels,
        scene: mpsc::UnboundedReceiver<Triangle>,
    }

    async fn screen(name: &str, discovery: &MemoryDiscovery, seek: bool) -> Screen {
        let (scene_tx, scene) = mpsc::unbounded_channel();
        let ctx = PeerContext::new(name, Some(name.as_bytes().to_vec()));
        let (manager, mut channels) =
            NetworkManager::start(test_config(seek), ctx, Arc::new(discovery.clone()), scene_tx);
        let color = (&mut channels.ready).await.unwrap().unwrap();
        assert_eq!(color, select_color(name.as_bytes()));
        Screen {
            manager,
            channels,
            scene,
        }
    }

    /// Accept every invitation the screen receives
    fn accept_all(screen: &mut Screen) -> JoinHandle<()> {
        let (_, placeholder) = mpsc::unbounded_channel();
        let mut invitations = std::mem::replace(&mut screen.channels.invitations, placeholder);
        tokio::spawn(async move {
            while let Some(invitation) = invitations.recv().await {
                invitation.accept();
            }
        })
    }

    async fn wait_for(status: &mut watch::Receiver<NeighborStatus>, f: impl FnMut(&NeighborStatus) -> bool) {
        tokio::time::timeout(Duration::from_secs(5), status.wait_for(f))
            .await
            .expect("status reached in time")
            .expect("manager running");
    }

    fn listen_addr(screen: &Screen) -> SocketAddr {
        screen.channels.status.borrow().listen_addr.unwrap()
    }

    #[tokio::test]
    async fn test_invite_links_both_sides() {
        let discovery = MemoryDiscovery::new();
        let mut b = screen("b", &discovery, false).await;
        let _accepter = accept_all(&mut b);
        let mut a = screen("a", &discovery, true).await;

        wait_for(&mut a.channels.status, |s| s.right.as_deref() == Some("b")).await;
        wait_for(&mut b.channels.status, |s| s.left.as_deref() == Some("a") && !s.advertising).await;
        assert_eq!(a.channels.status.borrow().left, None);
        assert_eq!(b.channels.status.borrow().right, None);

        let to_b = a.channels.new_right_screen.recv().await.unwrap().expect("right queue");
        let to_a = b.channels.new_left_screen.recv().await.unwrap().expect("left queue");

        // Leaves A past its right edge, enters B at its left edge.
        let color = select_color(b"a");
        to_b.send(Triangle::new(1.05, 0.5, color).with_velocity(0.1, 0.0)).await.unwrap();
        let at_b = tokio::time::timeout(Duration::from_secs(1), b.scene.recv())
            .await
            .unwrap()
            .unwrap();
        assert!((at_b.x - (-0.95)).abs() < 1e-6);

        // And back again.
        to_a.send(at_b.with_velocity(-0.1, 0.0)).await.unwrap();
        let at_a = tokio::time::timeout(Duration::from_secs(1), a.scene.recv())
            .await
            .unwrap()
            .unwrap();
        assert!((at_a.x - 1.05).abs() < 1e-6);

        a.manager.shutdown().await.unwrap();
        b.manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_busy_when_left_active() {
        let discovery = MemoryDiscovery::new();
        let mut b = screen("b", &discovery, false).await;
        let _accepter = accept_all(&mut b);
        let a = screen("a", &discovery, true).await;
        wait_for(&mut b.channels.status, |s| s.left.is_some()).await;

        let intruder = PeerContext::new("c", None);
        let result = invite(listen_addr(&b), &intruder, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(InviteError::Busy)));
        assert_eq!(b.channels.status.borrow().left.as_deref(), Some("a"));

        a.manager.shutdown().await.unwrap();
        b.manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_pending_invitation_busy_and_withdrawn() {
        let discovery = MemoryDiscovery::new();
        let mut b = screen("b", &discovery, false).await;
        let addr = listen_addr(&b);

        let first = tokio::spawn(async move {
            let ctx = PeerContext::new("x", Some(b"x".to_vec()));
            invite(addr, &ctx, Duration::from_secs(10)).await
        });
        let invitation = b.channels.invitations.recv().await.unwrap();
        assert_eq!(invitation.name, "x");
        assert_eq!(invitation.color, select_color(b"x"));

        // One invitation at a time.
        let second = invite(addr, &PeerContext::new("y", None), Duration::from_secs(1)).await;
        assert!(matches!(second, Err(InviteError::Busy)));

        // The inviter gives up: the prompt is withdrawn.
        first.abort();
        tokio::time::timeout(Duration::from_secs(2), invitation.withdrawn.cancelled())
            .await
            .expect("withdrawal signalled");
        assert!(!invitation.accept(), "withdrawn invitation is no longer pending");

        // The next one is surfaced again and can be rejected.
        let third = tokio::spawn(async move {
            let ctx = PeerContext::new("z", None);
            invite(addr, &ctx, Duration::from_secs(5)).await
        });
        let invitation = b.channels.invitations.recv().await.unwrap();
        assert_eq!(invitation.name, "z");
        invitation.reject("not now");
        assert!(matches!(
            third.await.unwrap(),
            Err(InviteError::Rejected(ref reason)) if reason == "not now"
        ));
        assert_eq!(b.channels.status.borrow().left, None);

        b.manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_invitation_rejects() {
        let discovery = MemoryDiscovery::new();
        let mut b = screen("b", &discovery, false).await;
        let addr = listen_addr(&b);

        let inviter = tokio::spawn(async move {
            let ctx = PeerContext::new("x", None);
            invite(addr, &ctx, Duration::from_secs(5)).await
        });
        drop(b.channels.invitations.recv().await.unwrap());
        assert!(matches!(inviter.await.unwrap(), Err(InviteError::Rejected(_))));

        b.manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_right_failure_restarts_search() {
        let discovery = MemoryDiscovery::new();
        let mut b = screen("b", &discovery, false).await;
        let _accept_b = accept_all(&mut b);
        let mut a = screen("a", &discovery, true).await;
        wait_for(&mut a.channels.status, |s| s.right.as_deref() == Some("b")).await;

        let mut c = screen("c", &discovery, false).await;
        let _accept_c = accept_all(&mut c);

        b.manager.shutdown().await.unwrap();
        wait_for(&mut a.channels.status, |s| s.right.as_deref() == Some("c")).await;
        wait_for(&mut c.channels.status, |s| s.left.as_deref() == Some("a")).await;

        // Some(b), None, Some(c)
        assert!(a.channels.new_right_screen.recv().await.unwrap().is_some());
        assert!(a.channels.new_right_screen.recv().await.unwrap().is_none());
        assert!(a.channels.new_right_screen.recv().await.unwrap().is_some());

        a.manager.shutdown().await.unwrap();
        c.manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_left_loss_resumes_advertising() {
        let discovery = MemoryDiscovery::new();
        let mut b = screen("b", &discovery, false).await;
        let _accepter = accept_all(&mut b);
        let a = screen("a", &discovery, true).await;
        wait_for(&mut b.channels.status, |s| s.left.is_some() && !s.advertising).await;

        a.manager.shutdown().await.unwrap();
        wait_for(&mut b.channels.status, |s| s.left.is_none() && s.advertising).await;
        tokio::time::timeout(Duration::from_secs(2), async {
            while discovery.advertised().await.len() != 1 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("b advertised again");

        b.manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_withdraws_everything() {
        let discovery = MemoryDiscovery::new();
        let b = screen("b", &discovery, true).await;
        let addr = listen_addr(&b);
        assert_eq!(discovery.advertised().await.len(), 1);

        b.manager.shutdown().await.unwrap();
        assert!(discovery.advertised().await.is_empty());
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_bind_failure_reported_through_ready() {
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();
        let (scene_tx, _scene) = mpsc::unbounded_channel();

        let (manager, channels) = NetworkManager::start(
            NetworkConfig::new(port).loopback(),
            PeerContext::new("late", None),
            Arc::new(MemoryDiscovery::new()),
            scene_tx,
        );
        let ready = channels.ready.await.unwrap();
        assert!(matches!(ready, Err(NetworkError::Listener(_))));
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_withdrawn_invitation_does_not_block_the_next() {
        let discovery = MemoryDiscovery::new();
        let mut b = screen("b", &discovery, false).await;
        let addr = listen_addr(&b);

        let first = tokio::spawn(async move {
            invite(addr, &PeerContext::new("x", None), Duration::from_secs(10)).await
        });
        wait_for(&mut b.channels.status, |s| s.invitation_pending).await;
        first.abort();
        wait_for(&mut b.channels.status, |s| !s.invitation_pending).await;

        // Nobody has looked at the first prompt yet.
        let second = tokio::spawn(async move {
            invite(addr, &PeerContext::new("y", None), Duration::from_secs(5)).await
        });
        wait_for(&mut b.channels.status, |s| s.invitation_pending).await;

        let stale = b.channels.invitations.recv().await.unwrap();
        assert_eq!(stale.name, "x");
        assert!(stale.is_withdrawn());
        assert!(!stale.accept());

        let live = b.channels.invitations.recv().await.unwrap();
        assert_eq!(live.name, "y");
        assert!(!live.is_withdrawn());
        assert!(live.accept());
        assert!(second.await.unwrap().is_ok());

        b.manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_mutual_invitations_form_a_ring() {
        let discovery = MemoryDiscovery::new();
        let (mut a, mut b) = tokio::join!(screen("a", &discovery, true), screen("b", &discovery, true));
        let _accept_a = accept_all(&mut a);
        let _accept_b = accept_all(&mut b);

        // Each invitation lands in the other's free left slot.
        wait_for(&mut a.channels.status, |s| {
            s.right.as_deref() == Some("b") && s.left.as_deref() == Some("b")
        })
        .await;
        wait_for(&mut b.channels.status, |s| {
            s.right.as_deref() == Some("a") && s.left.as_deref() == Some("a")
        })
        .await;

        let a_status = a.channels.status.borrow().clone();
        let b_status = b.channels.status.borrow().clone();
        assert!(!a_status.advertising && !b_status.advertising);
        assert!(!a_status.searching && !b_status.searching);

        a.manager.shutdown().await.unwrap();
        b.manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_peer_shutdown_conserves_triangles() {
        let discovery = MemoryDiscovery::new();
        let mut b = screen("b", &discovery, false).await;
        let _accepter = accept_all(&mut b);
        let mut a = screen("a", &discovery, true).await;
        wait_for(&mut a.channels.status, |s| s.right.as_deref() == Some("b")).await;
        wait_for(&mut b.channels.status, |s| s.left.as_deref() == Some("a")).await;

        let to_b = a.channels.new_right_screen.recv().await.unwrap().expect("right queue");
        let color = select_color(b"a");
        let total = 20;
        for i in 0..total {
            let t = Triangle::new(1.01, 0.0, color).with_velocity(0.1 + i as f32 * 0.01, 0.0);
            to_b.send(t).await.unwrap();
        }

        b.manager.shutdown().await.unwrap();
        wait_for(&mut a.channels.status, |s| s.right.is_none()).await;

        let mut arrived = 0;
        while b.scene.try_recv().is_ok() {
            arrived += 1;
        }
        let mut reflected = 0;
        while let Ok(t) = a.scene.try_recv() {
            assert!(t.dx < 0.0, "only reflections come back to a");
            reflected += 1;
        }
        assert_eq!(arrived + reflected, total);
        assert!(to_b.try_send(Triangle::new(1.01, 0.0, color)).is_err());

        a.manager.shutdown().await.unwrap();
    }
}
