//! Headless scene
//!
//! Owns the local triangles when no renderer is attached: steps physics,
//! routes departures to the neighbor queues and answers invitations.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{departure, move_triangle, offer, reflect, NeighborQueue, Side};
use crate::manager::{NetworkChannels, NetworkError};
use crate::protocol::{Color, Triangle};

/// Headless scene settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneConfig {
    /// Interval between physics steps in ms
    #[serde(default = "default_tick")]
    pub tick_ms: u64,
    /// Accept every invitation without asking
    #[serde(default)]
    pub auto_accept: bool,
    /// Horizontal speed given to spawned triangles
    #[serde(default = "default_spawn_speed")]
    pub spawn_speed: f32,
}

fn default_tick() -> u64 {
    16
}

fn default_spawn_speed() -> f32 {
    0.1
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick(),
            auto_accept: false,
            spawn_speed: default_spawn_speed(),
        }
    }
}

/// Outcome of one physics step
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StepReport {
    pub sent_left: usize,
    pub sent_right: usize,
    pub reflected: usize,
}

/// The local scene
#[derive(Debug, Default)]
pub struct Scene {
    color: Option<Color>,
    triangles: Vec<Triangle>,
    left: Option<NeighborQueue>,
    right: Option<NeighborQueue>,
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn triangles(&self) -> &[Triangle] {
        &self.triangles
    }

    pub fn color(&self) -> Option<Color> {
        self.color
    }

    pub fn set_color(&mut self, color: Color) {
        self.color = Some(color);
    }

    /// Add a triangle handed in by a neighbor or reflected by a link
    pub fn push(&mut self, triangle: Triangle) {
        self.triangles.push(triangle);
    }

    /// Spawn a triangle of our own color at the top of the screen
    pub fn spawn(&mut self, x: f32, dx: f32) {
        let color = self.color.unwrap_or(Color::new(1.0, 1.0, 1.0));
        self.triangles.push(Triangle::new(x, 1.0, color).with_velocity(dx, 0.0));
    }

    /// Install (or remove, with `None`) the outgoing queue for one side
    pub fn set_neighbor(&mut self, side: Side, queue: Option<NeighborQueue>) {
        tracing::info!(
            "{} neighbor {}",
            side,
            if queue.is_some() { "attached" } else { "detached" }
        );
        match side {
            Side::Left => self.left = queue,
            Side::Right => self.right = queue,
        }
    }

    /// Move every triangle once and hand departures to the neighbors
    pub fn step(&mut self) -> StepReport {
        let mut report = StepReport::default();
        let mut staying = Vec::with_capacity(self.triangles.len());

        for mut t in self.triangles.drain(..) {
            move_triangle(&mut t);
            let Some(side) = departure(&t) else {
                staying.push(t);
                continue;
            };
            let queue = match side {
                Side::Left => self.left.as_ref(),
                Side::Right => self.right.as_ref(),
            };
            match offer(queue, t) {
                Ok(()) => match side {
                    Side::Left => report.sent_left += 1,
                    Side::Right => report.sent_right += 1,
                },
                Err(rejected) => {
                    report.reflected += 1;
                    staying.push(reflect(rejected));
                }
            }
        }

        self.triangles = staying;
        report
    }

    /// Drive the scene from the network channels until `shutdown` fires.
    pub async fn run(
        mut self,
        mut channels: NetworkChannels,
        mut incoming: mpsc::UnboundedReceiver<Triangle>,
        config: SceneConfig,
        shutdown: CancellationToken,
    ) -> Result<Self, NetworkError> {
        let mut ticker = tokio::time::interval(Duration::from_millis(config.tick_ms.max(1)));
        let mut ready = channels.ready;
        let mut ready_seen = false;

        loop {
            tokio::select! {
                result = &mut ready, if !ready_seen => {
                    ready_seen = true;
                    match result {
                        Ok(Ok(color)) => {
                            tracing::info!("Network ready, our color is {:?}", color);
                            self.set_color(color);
                            self.spawn(0.0, config.spawn_speed);
                        }
                        Ok(Err(e)) => return Err(e),
                        Err(_) => return Err(NetworkError::Stopped),
                    }
                }
                Some(invitation) = channels.invitations.recv() => {
                    if invitation.is_withdrawn() {
                        tracing::debug!("Invitation from {} already withdrawn", invitation.name);
                    } else if config.auto_accept {
                        tracing::info!("Accepting invitation from {}", invitation.name);
                        invitation.accept();
                    } else {
                        tracing::info!("Rejecting invitation from {} (auto-accept is off)", invitation.name);
                        invitation.reject("user rejected");
                    }
                }
                Some(queue) = channels.new_left_screen.recv() => {
                    self.set_neighbor(Side::Left, queue);
                }
                Some(queue) = channels.new_right_screen.recv() => {
                    self.set_neighbor(Side::Right, queue);
                }
                Some(triangle) = incoming.recv() => {
                    self.push(triangle);
                }
                _ = ticker.tick() => {
                    let report = self.step();
                    if report != StepReport::default() {
                        tracing::debug!("Step: {:?}, {} on screen", report, self.triangles.len());
                    }
                }
                _ = shutdown.cancelled() => {
                    break;
                }
            }
        }

        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn moving(x: f32, dx: f32) -> Triangle {
        Triangle::new(x, 0.0, Color::new(0.4, 0.4, 0.4)).with_velocity(dx, 0.0)
    }

    #[test]
    fn test_step_without_neighbors_reflects() {
        let mut scene = Scene::new();
        scene.push(moving(0.99, 0.5));
        scene.push(moving(-0.99, -0.5));
        scene.push(moving(0.0, 0.1));

        let report = scene.step();
        assert_eq!(report.reflected, 2);
        assert_eq!(scene.triangles().len(), 3);
        assert!(scene.triangles().iter().all(|t| departure(t).is_none()));
    }

    #[test]
    fn test_step_routes_to_neighbors() {
        let mut scene = Scene::new();
        let (left_tx, mut left_rx) = mpsc::channel(4);
        let (right_tx, mut right_rx) = mpsc::channel(4);
        scene.set_neighbor(Side::Left, Some(left_tx));
        scene.set_neighbor(Side::Right, Some(right_tx));

        scene.push(moving(0.99, 0.5));
        scene.push(moving(-0.99, -0.5));

        let report = scene.step();
        assert_eq!(report, StepReport { sent_left: 1, sent_right: 1, reflected: 0 });
        assert!(scene.triangles().is_empty());
        assert!(right_rx.try_recv().unwrap().x > 1.0);
        assert!(left_rx.try_recv().unwrap().x < -1.0);
    }

    #[test]
    fn test_closed_queue_reflects() {
        let mut scene = Scene::new();
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        scene.set_neighbor(Side::Right, Some(tx));
        scene.push(moving(0.99, 0.5));

        let report = scene.step();
        assert_eq!(report.reflected, 1);
        assert_eq!(scene.triangles().len(), 1);
        assert_eq!(scene.triangles()[0].dx, -0.5);
    }

    #[test]
    fn test_spawn_uses_color() {
        let mut scene = Scene::new();
        let color = Color::new(0.2, 0.3, 0.4);
        scene.set_color(color);
        scene.spawn(0.0, 0.1);
        assert_eq!(scene.triangles()[0].color(), color);
        assert_eq!(scene.triangles()[0].y, 1.0);
    }
}
