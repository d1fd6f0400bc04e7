// src/liveness.rs

use std::{sync::Arc, time::Duration};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::presence::PresenceStore;
use crate::registry::{Liveness, Outbound};
use crate::session::{EvictReason, SessionManager};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub pinged: usize,
    pub evicted: usize,
}

/// Periodically pings every local connection and evicts the ones that did
/// not answer the previous ping.
pub struct LivenessMonitor {
    sessions: Arc<SessionManager>,
    presence: Arc<PresenceStore>,
    interval: Duration,
}

impl LivenessMonitor {
    pub fn new(sessions: Arc<SessionManager>, presence: Arc<PresenceStore>, interval: Duration) -> Self {
        Self {
            sessions,
            presence,
            interval,
        }
    }

    /// One pass over all connections.
    ///
    /// A connection still waiting for the previous pong is dead. Every other
    /// connection gets its presence refreshed and a new ping. A ping that
    /// cannot be queued kills the connection on the spot.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        for conn in self.sessions.registry().snapshot().await {
            if conn.begin_ping() == Liveness::AwaitingPong {
                debug!(user_id = %conn.user_id, "no pong since last sweep");
                self.sessions.evict(&conn, EvictReason::Dead).await;
                report.evicted += 1;
                continue;
            }

            if let Err(e) = self.presence.mark_online(&conn.user_id).await {
                warn!(user_id = %conn.user_id, error = %e, "failed to refresh presence");
            }

            if conn.try_enqueue(Outbound::Ping).is_err() {
                self.sessions.evict(&conn, EvictReason::Dead).await;
                report.evicted += 1;
                continue;
            }
            report.pinged += 1;
        }

        if report.evicted > 0 {
            info!(evicted = report.evicted, pinged = report.pinged, "liveness sweep");
        }
        report
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; skip it so fresh
            // connections get a full interval to answer.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.sweep().await;
            }
        })
    }
}
