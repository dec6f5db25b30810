//! Entity transfer stream
//!
//! Moves triangles over one link in both directions. The outbound direction
//! runs in two phases: it forwards while the link is healthy, and once the
//! link is dead (or torn down) it drains the queue and reflects everything
//! back into the local scene. Every triangle taken from the queue is either
//! written to the peer or reflected, never both.
//!
//! The inbound direction expects some traffic at least every few heartbeat
//! intervals. After a local teardown it keeps reading for a short while so
//! that triangles the peer already wrote still reach the scene.

use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::network::{timestamp_micros, Connection, ConnectionReader, ConnectionWriter};
use crate::protocol::{Message, Triangle};
use crate::scene::{reflect, SceneSender, Side};

/// Why a link died on its own
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("Send failed: {0}")]
    Send(String),

    #[error("Receive failed: {0}")]
    Receive(String),

    #[error("Peer disconnected: {0}")]
    PeerDisconnected(String),

    #[error("Connection closed by peer")]
    Closed,

    #[error("Connection hand-off failed")]
    HandOff,

    #[error("Local scene closed")]
    SceneClosed,

    #[error("No traffic from peer")]
    Timeout,
}

/// Heartbeat intervals without any frame before the peer counts as gone
const MISSED_HEARTBEATS: u32 = 3;

/// Where a link's connection comes from
pub enum LinkSource<S> {
    /// Already established (we invited the peer)
    Connected(Connection<S>),
    /// Still owned by the invite listener until it has acknowledged the
    /// invitation (the peer invited us)
    HandOff(oneshot::Receiver<Connection<S>>),
}

/// Link timing and orientation
#[derive(Debug, Clone, Copy)]
pub struct TransferConfig {
    /// Side the peer sits on
    pub side: Side,
    /// Bound on one send
    pub give_timeout: Duration,
    /// Heartbeat interval on an idle link
    pub heartbeat_interval: Duration,
    /// How long inbound keeps reading after a local teardown
    pub linger: Duration,
}

impl TransferConfig {
    fn heartbeat_period(&self) -> Duration {
        self.heartbeat_interval.max(Duration::from_millis(1))
    }

    /// Longest silence tolerated from the peer
    fn silence_limit(&self) -> Duration {
        self.heartbeat_period() * MISSED_HEARTBEATS
    }
}

/// What happened to the triangles taken from the outgoing queue
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OutboundReport {
    pub delivered: usize,
    pub reflected: usize,
}

/// Running link
pub struct TransferStream {
    task: JoinHandle<OutboundReport>,
    cancel: CancellationToken,
}

impl TransferStream {
    /// Start moving triangles between `queue`, the peer behind `source` and
    /// the local `scene`. The first terminal error of a link that dies on its
    /// own is sent on `lost`.
    pub fn spawn<S>(
        source: LinkSource<S>,
        queue: mpsc::Receiver<Triangle>,
        scene: SceneSender,
        config: TransferConfig,
        lost: mpsc::Sender<TransferError>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_link(source, queue, scene, config, lost, cancel.clone()));
        Self { task, cancel }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Tear the link down and wait for both directions to stop
    pub async fn close(self) -> OutboundReport {
        self.cancel.cancel();
        self.join().await
    }

    /// Wait for the link to stop on its own
    pub async fn join(self) -> OutboundReport {
        match self.task.await {
            Ok(report) => report,
            Err(e) => {
                tracing::error!("Transfer task failed: {}", e);
                OutboundReport::default()
            }
        }
    }
}

fn report_lost(lost: &mpsc::Sender<TransferError>, error: TransferError) {
    if lost.try_send(error).is_err() {
        tracing::trace!("Link loss already reported");
    }
}

fn push_reflected(scene: &SceneSender, triangle: Triangle) {
    if scene.send(reflect(triangle)).is_err() {
        tracing::warn!("Local scene closed, reflected triangle discarded");
    }
}

async fn run_link<S>(
    source: LinkSource<S>,
    queue: mpsc::Receiver<Triangle>,
    scene: SceneSender,
    config: TransferConfig,
    lost: mpsc::Sender<TransferError>,
    cancel: CancellationToken,
) -> OutboundReport
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let connection = match source {
        LinkSource::Connected(connection) => Some(connection),
        LinkSource::HandOff(handoff) => tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = handoff => match result {
                Ok(connection) => Some(connection),
                Err(_) => {
                    report_lost(&lost, TransferError::HandOff);
                    cancel.cancel();
                    None
                }
            },
        },
    };

    let Some(connection) = connection else {
        return drain(queue, &scene, OutboundReport::default()).await;
    };

    tracing::debug!("{} link to {} up", config.side, connection.remote());
    let remote = connection.remote().to_string();
    let (reader, writer) = connection.into_split();
    let inbound = tokio::spawn(run_inbound(
        reader,
        scene.clone(),
        config,
        lost.clone(),
        cancel.clone(),
    ));

    let report = run_outbound(writer, queue, &scene, config, &lost, &cancel).await;
    if let Err(e) = inbound.await {
        tracing::error!("Inbound task failed: {}", e);
    }
    tracing::info!(
        "{} link to {} down: {} delivered, {} reflected",
        config.side,
        remote,
        report.delivered,
        report.reflected
    );
    report
}

/// Phases of the outbound direction
enum Phase {
    /// The link is healthy; triangles go to the peer
    Forwarding,
    /// The link is dead; triangles bounce back into the scene
    Draining,
}

async fn run_outbound<W>(
    mut writer: ConnectionWriter<W>,
    mut queue: mpsc::Receiver<Triangle>,
    scene: &SceneSender,
    config: TransferConfig,
    lost: &mpsc::Sender<TransferError>,
    cancel: &CancellationToken,
) -> OutboundReport
where
    W: AsyncWrite + Unpin,
{
    let mut report = OutboundReport::default();
    let period = config.heartbeat_period();
    let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut queue_open = true;

    let mut phase = Phase::Forwarding;
    while let Phase::Forwarding = phase {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let goodbye = Message::Disconnect { reason: format!("{} link closed", config.side) };
                let _ = writer.send_timeout(&goodbye, config.give_timeout).await;
                let _ = tokio::time::timeout(config.give_timeout, writer.shutdown()).await;
                phase = Phase::Draining;
            }
            next = queue.recv(), if queue_open => {
                let Some(triangle) = next else {
                    // Every producer is gone; keep the link alive until torn down.
                    queue_open = false;
                    continue;
                };
                let give = Message::Give { triangle };
                let sent = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    result = writer.send_timeout(&give, config.give_timeout) => Some(result),
                };
                match sent {
                    Some(Ok(())) => {
                        report.delivered += 1;
                        heartbeat.reset();
                    }
                    Some(Err(e)) => {
                        tracing::info!("{} neighbor unreachable ({}), reflecting triangles", config.side, e);
                        push_reflected(scene, triangle);
                        report.reflected += 1;
                        report_lost(lost, TransferError::Send(e.to_string()));
                        cancel.cancel();
                        phase = Phase::Draining;
                    }
                    None => {
                        // Torn down mid-send; the frame may be cut short so
                        // nothing more goes on the wire.
                        push_reflected(scene, triangle);
                        report.reflected += 1;
                        phase = Phase::Draining;
                    }
                }
            }
            _ = heartbeat.tick() => {
                let beat = Message::Heartbeat { timestamp: timestamp_micros() };
                if let Err(e) = writer.send_timeout(&beat, config.give_timeout).await {
                    tracing::info!("{} neighbor missed a heartbeat: {}", config.side, e);
                    report_lost(lost, TransferError::Send(e.to_string()));
                    cancel.cancel();
                    phase = Phase::Draining;
                }
            }
        }
    }

    drain(queue, scene, report).await
}

/// Reflect every triangle still queued. Closing the queue first makes any
/// later offer fail back to the producer.
async fn drain(
    mut queue: mpsc::Receiver<Triangle>,
    scene: &SceneSender,
    mut report: OutboundReport,
) -> OutboundReport {
    queue.close();
    while let Some(triangle) = queue.recv().await {
        push_reflected(scene, triangle);
        report.reflected += 1;
    }
    report
}

async fn run_inbound<R>(
    mut reader: ConnectionReader<R>,
    scene: SceneSender,
    config: TransferConfig,
    lost: mpsc::Sender<TransferError>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let side = config.side;
    let delta = side.inbound_delta();
    let silence = config.silence_limit();
    let error = loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let taken = linger(&mut reader, &scene, config).await;
                if taken > 0 {
                    tracing::debug!("Took {} late triangles from the {} neighbor", taken, side);
                }
                return;
            }
            frame = tokio::time::timeout(silence, reader.recv()) => match frame {
                Ok(frame) => frame,
                Err(_) => break TransferError::Timeout,
            },
        };
        match frame {
            Ok(Some(frame)) => match frame.message {
                Message::Give { mut triangle } => {
                    triangle.x += delta;
                    tracing::trace!("Took a triangle from the {} neighbor: {:?}", side, triangle);
                    if scene.send(triangle).is_err() {
                        break TransferError::SceneClosed;
                    }
                }
                Message::Heartbeat { .. } => {}
                Message::Disconnect { reason } => break TransferError::PeerDisconnected(reason),
                other => {
                    tracing::warn!("Unexpected message on {} link: {:?}", side, other);
                }
            },
            Ok(None) => break TransferError::Closed,
            Err(e) => break TransferError::Receive(e.to_string()),
        }
    };

    if !cancel.is_cancelled() {
        tracing::info!("{} link ended: {}", side, error);
        report_lost(&lost, error);
        cancel.cancel();
    }
}

/// Keep taking triangles after a local teardown until the peer says goodbye,
/// hangs up or `config.linger` runs out. The peer counted these as delivered.
async fn linger<R>(reader: &mut ConnectionReader<R>, scene: &SceneSender, config: TransferConfig) -> usize
where
    R: AsyncRead + Unpin,
{
    let delta = config.side.inbound_delta();
    let deadline = tokio::time::Instant::now() + config.linger;
    let mut taken = 0;
    while let Ok(Ok(Some(frame))) = tokio::time::timeout_at(deadline, reader.recv()).await {
        match frame.message {
            Message::Give { mut triangle } => {
                triangle.x += delta;
                if scene.send(triangle).is_err() {
                    break;
                }
                taken += 1;
            }
            Message::Disconnect { .. } => break,
            _ => {}
        }
    }
    taken
}
